//! Table layout and the hash-part operations the collector itself needs
//! (metamethod lookup, weak-entry clearing, the FFI finalizer table, and
//! enough mutation for the test hosts). The array part is a plain TValue
//! vector; the hash part uses coalesced chaining through `Node.next` so
//! that a lookup always starts at the key's main position.

use std::mem;

use crate::global::GlobalState;
use crate::object::{GCRef, GCstr, GcKind, TValue};
use crate::policy::blob;
use crate::util::Address;
use crate::vm::VMBinding;
use crate::GcError;

/// One hash slot. An empty slot has both key and value nil; a tombstone
/// keeps its key so chains stay walkable.
#[repr(C)]
#[derive(Copy, Clone)]
pub struct Node {
    pub val: TValue,
    pub key: TValue,
    /// Next node in this chain, or zero.
    pub next: Address,
}

/// Table object. Array and hash payloads are blob-allocated unless the
/// array part was colocated into adjacent table slots at allocation.
#[repr(C)]
pub struct GCtab {
    pub gcflags: u8,
    pub gct: u8,
    pub nomm: u8,
    /// Nonzero when the array part is colocated.
    pub colo: i8,
    pub asize: u32,
    pub hmask: u32,
    pub _pad: u32,
    pub array: Address,
    pub node: Address,
    /// Free-slot scan cursor, one past the highest candidate.
    pub freetop: Address,
    pub metatable: GCRef,
    pub gclist: GCRef,
}

impl GCtab {
    pub fn node_ptr(&self, i: u32) -> *mut Node {
        debug_assert!(i <= self.hmask && !self.node.is_zero());
        (self.node + i as usize * mem::size_of::<Node>()).to_mut_ptr()
    }

    pub fn array_slot(&self, i: u32) -> Address {
        debug_assert!(i < self.asize);
        self.array + i as usize * mem::size_of::<TValue>()
    }

    pub fn hash_bytes(&self) -> usize {
        if self.node.is_zero() {
            0
        } else {
            (self.hmask as usize + 1) * mem::size_of::<Node>()
        }
    }

    pub fn array_bytes(&self) -> usize {
        self.asize as usize * mem::size_of::<TValue>()
    }
}

fn hash_u64(x: u64) -> u32 {
    // Fibonacci scramble of the raw bits; good enough for the collector's
    // own tables and stable across a value's lifetime.
    (x.wrapping_mul(0x9E37_79B9_7F4A_7C15) >> 32) as u32
}

/// Hash of a non-nil key. Strings use their interning hash so identical
/// text always lands in the same chain.
pub fn key_hash(key: TValue) -> u32 {
    match key {
        TValue::Nil => unreachable!("nil key"),
        TValue::False => 0x2545_F491,
        TValue::True => 0x5851_F42D,
        TValue::Num(n) => hash_u64(n.to_bits()),
        TValue::Gc(o) => {
            if o.gct() == GcKind::Str {
                unsafe { o.as_ref::<GCstr>() }.hash
            } else {
                hash_u64(o.addr().as_usize() as u64)
            }
        }
    }
}

fn array_index(key: TValue, asize: u32) -> Option<u32> {
    if let TValue::Num(n) = key {
        let i = n as u32;
        if i as f64 == n && i < asize {
            return Some(i);
        }
    }
    None
}

/// Read a slot. Returns `None` for absent or nil entries.
pub fn tab_get(t: &GCtab, key: TValue) -> Option<TValue> {
    if let Some(i) = array_index(key, t.asize) {
        let v = unsafe { t.array_slot(i).load::<TValue>() };
        return if v.is_nil() { None } else { Some(v) };
    }
    if t.hmask == 0 && t.node.is_zero() {
        return None;
    }
    let mut n = t.node_ptr(key_hash(key) & t.hmask);
    loop {
        let node = unsafe { &*n };
        if node.key == key && !node.val.is_nil() {
            return Some(node.val);
        }
        if node.next.is_zero() {
            return None;
        }
        n = node.next.to_mut_ptr();
    }
}

/// String-keyed read; interning makes this pointer equality.
pub fn tab_getstr(t: &GCtab, s: GCRef) -> Option<TValue> {
    tab_get(t, TValue::Gc(s))
}

fn init_nodes(node: Address, count: u32) {
    for i in 0..count {
        let n = (node + i as usize * mem::size_of::<Node>()).to_mut_ptr::<Node>();
        unsafe {
            (*n).val = TValue::Nil;
            (*n).key = TValue::Nil;
            (*n).next = Address::ZERO;
        }
    }
}

fn new_hash_part<VM: VMBinding>(
    g: &mut GlobalState<VM>,
    t: *mut GCtab,
    hbits: u32,
) -> Result<(), GcError> {
    let count = 1u32 << hbits;
    let bytes = count as usize * mem::size_of::<Node>();
    let node = blob::newblob(g, bytes)?;
    init_nodes(node, count);
    unsafe {
        (*t).node = node;
        (*t).hmask = count - 1;
        (*t).freetop = node + bytes;
    }
    Ok(())
}

fn get_free_pos(t: &mut GCtab) -> Option<*mut Node> {
    while t.freetop > t.node {
        t.freetop = t.freetop - mem::size_of::<Node>();
        let n = t.freetop.to_mut_ptr::<Node>();
        let node = unsafe { &*n };
        if node.key.is_nil() && node.val.is_nil() {
            return Some(n);
        }
    }
    None
}

/// Insert without looking for an existing entry. Returns false when the
/// hash part is full.
fn insert_raw(t: &mut GCtab, key: TValue, val: TValue) -> bool {
    let mp = t.node_ptr(key_hash(key) & t.hmask);
    let main = unsafe { &mut *mp };
    if main.key.is_nil() && main.val.is_nil() {
        main.key = key;
        main.val = val;
        return true;
    }
    let Some(free) = get_free_pos(t) else {
        return false;
    };
    let main = unsafe { &mut *mp };
    unsafe {
        (*free).next = main.next;
        (*free).key = key;
        (*free).val = val;
    }
    main.next = Address::from_mut_ptr(free);
    true
}

fn rehash<VM: VMBinding>(g: &mut GlobalState<VM>, t: *mut GCtab) -> Result<(), GcError> {
    let (old_node, old_mask, old_bytes) = unsafe { ((*t).node, (*t).hmask, (*t).hash_bytes()) };
    let nbits = 31 - (old_mask + 1).leading_zeros();
    new_hash_part(g, t, nbits + 1)?;
    blob::shrinkblob(g, old_bytes);
    let tr = unsafe { &mut *t };
    for i in 0..=old_mask {
        let n = unsafe { (old_node + i as usize * mem::size_of::<Node>()).load::<Node>() };
        if !n.val.is_nil() {
            let ok = insert_raw(tr, n.key, n.val);
            debug_assert!(ok, "fresh hash part full during rehash");
        }
    }
    Ok(())
}

/// Store `t[key] = val`, growing the hash part as needed. Applies the
/// table back-barrier so a black table re-enters the gray queue.
pub fn tab_set<VM: VMBinding>(
    g: &mut GlobalState<VM>,
    t: *mut GCtab,
    key: TValue,
    val: TValue,
) -> Result<(), GcError> {
    debug_assert!(!key.is_nil(), "nil table key");
    crate::plan::barriers::barriert(g, GCRef::from_ptr(t), val);
    let tr = unsafe { &mut *t };
    if let Some(i) = array_index(key, tr.asize) {
        unsafe { tr.array_slot(i).store(val) };
        return Ok(());
    }
    if tr.node.is_zero() {
        new_hash_part(g, t, 2)?;
    }
    let tr = unsafe { &mut *t };
    // Overwrite an existing entry in place.
    let mut n = tr.node_ptr(key_hash(key) & tr.hmask);
    loop {
        let node = unsafe { &mut *n };
        if node.key == key {
            node.val = val;
            return Ok(());
        }
        if node.next.is_zero() {
            break;
        }
        n = node.next.to_mut_ptr();
    }
    if val.is_nil() {
        return Ok(());
    }
    if !insert_raw(tr, key, val) {
        rehash(g, t)?;
        let tr = unsafe { &mut *t };
        let ok = insert_raw(tr, key, val);
        debug_assert!(ok, "fresh hash part full after rehash");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn string_hash_is_stable() {
        // key_hash on non-GC keys must not depend on ambient state.
        assert_eq!(key_hash(TValue::Num(4.0)), key_hash(TValue::Num(4.0)));
        assert_ne!(key_hash(TValue::Num(4.0)), key_hash(TValue::Num(5.0)));
        assert_ne!(key_hash(TValue::True), key_hash(TValue::False));
    }

    #[test]
    fn array_index_bounds() {
        assert_eq!(array_index(TValue::Num(0.0), 4), Some(0));
        assert_eq!(array_index(TValue::Num(3.0), 4), Some(3));
        assert_eq!(array_index(TValue::Num(4.0), 4), None);
        assert_eq!(array_index(TValue::Num(1.5), 4), None);
        assert_eq!(array_index(TValue::True, 4), None);
    }
}

//! String interning: a primary open-addressed entry array plus a paged
//! secondary store for overflow chains.
//!
//! Every interned string carries a 32-bit `hid` encoding its locus:
//! primary entries have the top six bits set, with a 22-bit entry index;
//! secondary loci are (19-bit arena-slot index | 9-bit entry index);
//! the low 4 bits select the chain slot within the entry, 15 reserved as
//! invalid. `prev_len` packs the previous entry's locus (high bits) with
//! the entry's live count (low 4 bits) so chained entries can unlink
//! themselves when they empty.

use std::mem;
use std::ptr;

use static_assertions::const_assert;

use crate::global::GlobalState;
use crate::object::{GCRef, GCstr, GcKind};
use crate::policy::arena::{abit, aidxh, aidxl, arena_of, GCAstr, STR_MED_LAYOUT};
use crate::util::constants::*;
use crate::util::simd::{reset_lowest32, reset_lowest64, tzcount64};
use crate::util::Address;
use crate::vm::VMBinding;
use crate::GcError;

/// Chain slots per entry; slot 15 is the invalid marker.
pub const STRTAB_SLOTS: usize = 15;
const SLOT_INVALID: u32 = 0xF;
const PRIMARY_TAG: u32 = 0xFC00_0000;

/// One interning entry: up to 15 strings with their hashes.
#[repr(C)]
#[derive(Clone)]
pub struct StrTab {
    pub strs: [GCRef; STRTAB_SLOTS],
    pub hashes: [u32; STRTAB_SLOTS],
    /// High bits: locus of the previous entry in the chain (chained
    /// entries only). Low 4 bits: live count.
    pub prev_len: u32,
    pub next: *mut StrTab,
}

impl StrTab {
    pub const EMPTY: StrTab = StrTab {
        strs: [GCRef::NULL; STRTAB_SLOTS],
        hashes: [0; STRTAB_SLOTS],
        prev_len: 0,
        next: ptr::null_mut(),
    };
}

/// Bitmap words tracking entry occupancy in a secondary arena.
pub const STRTAB_WORDS: usize = 6;
/// Entries per secondary arena.
pub const STRTAB_ENTRIES: usize =
    (ARENA_SIZE - mem::size_of::<StrTabArenaHdr>()) / mem::size_of::<StrTab>();

#[repr(C)]
struct StrTabArenaHdr {
    next: i32,
    prev: i32,
    index: u32,
    count: u32,
    free_h: u32,
    _pad: u32,
    free: [u64; STRTAB_WORDS],
}

/// A secondary string-table arena: a page of entries with an occupancy
/// freelist. Full arenas leave the free-head chain.
#[repr(C)]
pub struct GCAstrtab {
    hdr: StrTabArenaHdr,
    entries: [StrTab; STRTAB_ENTRIES],
}

const_assert!(mem::size_of::<GCAstrtab>() <= ARENA_SIZE);
const_assert!(STRTAB_ENTRIES <= 512); // must fit the 9-bit entry index
const_assert!(STRTAB_ENTRIES > (STRTAB_WORDS - 1) * 64);

/// A slot of the secondary arena list: either a live arena or a link in
/// the slot freelist.
#[derive(Copy, Clone)]
pub enum SecondarySlot {
    Arena(*mut GCAstrtab),
    Free(i32),
}

/// Interning state hanging off the global state.
pub struct StrState {
    pub primary: Vec<StrTab>,
    pub mask: u32,
    /// Total interned strings.
    pub num: usize,
    /// Live small strings counted by the current sweep.
    pub num_small: usize,
    /// Dead small strings accounted from dirty arenas.
    pub num_dead: usize,
    pub secondary_list: Vec<SecondarySlot>,
    pub secondary_slot_free_head: i32,
    pub secondary_arena_free_head: i32,
}

impl StrState {
    pub fn new(size: usize) -> StrState {
        debug_assert!(size.is_power_of_two());
        StrState {
            primary: vec![StrTab::EMPTY; size],
            mask: size as u32 - 1,
            num: 0,
            num_small: 0,
            num_dead: 0,
            secondary_list: Vec::new(),
            secondary_slot_free_head: -1,
            secondary_arena_free_head: -1,
        }
    }
}

fn read_u32(s: &[u8], at: usize) -> u32 {
    u32::from_le_bytes([s[at], s[at + 1], s[at + 2], s[at + 3]])
}

/// String hash (sparse sampling for long strings).
pub fn str_hash(s: &[u8]) -> u32 {
    let len = s.len();
    let mut h = len as u32;
    let mut a: u32;
    let mut b: u32;
    if len >= 4 {
        a = read_u32(s, 0);
        h ^= read_u32(s, len - 4);
        b = read_u32(s, (len >> 1) - 2);
        h ^= b;
        h = h.wrapping_sub(b.rotate_left(14));
        b = b.wrapping_add(read_u32(s, (len >> 2) - 1));
    } else if len > 0 {
        a = s[0] as u32;
        h ^= s[len - 1] as u32;
        b = s[len >> 1] as u32;
        h ^= b;
        h = h.wrapping_sub(b.rotate_left(14));
    } else {
        return 0;
    }
    a ^= h;
    a = a.wrapping_sub(h.rotate_left(11));
    b ^= a;
    b = b.wrapping_sub(a.rotate_left(25));
    h ^= b;
    h = h.wrapping_sub(b.rotate_left(16));
    h
}

fn is_primary(hid: u32) -> bool {
    hid >= PRIMARY_TAG
}

/// Resolve a hid to its entry.
pub fn get_strtab(s: &StrState, hid: u32) -> *mut StrTab {
    if is_primary(hid) {
        let idx = ((hid & 0x03FF_FFFF) >> 4) as usize;
        debug_assert!(idx <= s.mask as usize, "primary list exceeded");
        &s.primary[idx] as *const StrTab as *mut StrTab
    } else {
        let slot = (hid >> 13) as usize;
        debug_assert!(slot < s.secondary_list.len(), "secondary list exceeded");
        let eidx = ((hid >> 4) & 0x1FF) as usize;
        debug_assert!(eidx < STRTAB_ENTRIES, "bad arena index");
        match s.secondary_list[slot] {
            SecondarySlot::Arena(a) => unsafe { &mut (*a).entries[eidx] as *mut StrTab },
            SecondarySlot::Free(_) => unreachable!("hid into freed secondary slot"),
        }
    }
}

/// Locus bits (slot nibble zero) of an entry.
fn entry_locus(s: &StrState, st: *const StrTab) -> u32 {
    let base = s.primary.as_ptr() as usize;
    let stu = st as usize;
    let span = s.primary.len() * mem::size_of::<StrTab>();
    if stu >= base && stu < base + span {
        let idx = (stu - base) / mem::size_of::<StrTab>();
        PRIMARY_TAG | ((idx as u32) << 4)
    } else {
        let a = (stu & !ARENA_OMASK) as *mut GCAstrtab;
        let eidx = (stu - unsafe { (*a).entries.as_ptr() } as usize) / mem::size_of::<StrTab>();
        unsafe { ((*a).hdr.index << 13) | ((eidx as u32) << 4) }
    }
}

// -- Secondary allocation --------------------------------------------------

fn new_secondary_arena<VM: VMBinding>(g: &mut GlobalState<VM>) -> Result<(), GcError> {
    // Claim a list slot first.
    let slot = if g.str.secondary_slot_free_head >= 0 {
        let slot = g.str.secondary_slot_free_head;
        g.str.secondary_slot_free_head = match g.str.secondary_list[slot as usize] {
            SecondarySlot::Free(n) => n,
            SecondarySlot::Arena(_) => unreachable!("free head points at live arena"),
        };
        slot
    } else {
        if g.str.secondary_list.len() >= STRTAB_SECONDARY_MAX {
            return Err(GcError::OutOfMemory);
        }
        g.str.secondary_list.push(SecondarySlot::Free(-1));
        (g.str.secondary_list.len() - 1) as i32
    };
    let page = g.pages.alloc();
    if page.is_zero() {
        // Give the slot back before surfacing the failure.
        g.str.secondary_list[slot as usize] = SecondarySlot::Free(g.str.secondary_slot_free_head);
        g.str.secondary_slot_free_head = slot;
        return Err(GcError::OutOfMemory);
    }
    let a = page.to_mut_ptr::<GCAstrtab>();
    unsafe {
        (*a).hdr.next = -1;
        (*a).hdr.prev = -1;
        (*a).hdr.index = slot as u32;
        (*a).hdr.count = 0;
        (*a).hdr.free_h = (1u32 << STRTAB_WORDS) - 1;
        for w in 0..STRTAB_WORDS - 1 {
            (*a).hdr.free[w] = !0;
        }
        (*a).hdr.free[STRTAB_WORDS - 1] =
            (1u64 << (STRTAB_ENTRIES - (STRTAB_WORDS - 1) * 64)) - 1;
    }
    g.str.secondary_list[slot as usize] = SecondarySlot::Arena(a);
    g.str.secondary_arena_free_head = slot;
    Ok(())
}

/// Allocate a zeroed secondary entry; returns the entry and its locus.
fn alloc_strtab<VM: VMBinding>(g: &mut GlobalState<VM>) -> Result<(*mut StrTab, u32), GcError> {
    if g.str.secondary_arena_free_head < 0 {
        new_secondary_arena(g)?;
    }
    let head = g.str.secondary_arena_free_head;
    let a = match g.str.secondary_list[head as usize] {
        SecondarySlot::Arena(a) => a,
        SecondarySlot::Free(_) => unreachable!("arena free head points at freed slot"),
    };
    unsafe {
        let i = (*a).hdr.free_h.trailing_zeros() as usize;
        let j = tzcount64((*a).hdr.free[i]);
        let idx = (i << 6) + j as usize;
        (*a).hdr.free[i] = reset_lowest64((*a).hdr.free[i]);
        if (*a).hdr.free[i] == 0 {
            (*a).hdr.free_h = reset_lowest32((*a).hdr.free_h);
        }
        (*a).hdr.count += 1;
        if (*a).hdr.count as usize == STRTAB_ENTRIES {
            g.str.secondary_arena_free_head = (*a).hdr.next;
            if (*a).hdr.next != -1 {
                if let SecondarySlot::Arena(n) = g.str.secondary_list[(*a).hdr.next as usize] {
                    (*n).hdr.prev = -1;
                }
            }
            (*a).hdr.next = -1;
        }
        let st = &mut (*a).entries[idx] as *mut StrTab;
        *st = StrTab::EMPTY;
        let locus = ((head as u32) << 13) | ((idx as u32) << 4);
        Ok((st, locus))
    }
}

/// Return a secondary entry to its arena, releasing the arena when it
/// empties.
fn free_strtab<VM: VMBinding>(g: &mut GlobalState<VM>, st: *mut StrTab) {
    let a = (st as usize & !ARENA_OMASK) as *mut GCAstrtab;
    unsafe {
        let idx = (st as usize - (*a).entries.as_ptr() as usize) / mem::size_of::<StrTab>();
        (*a).hdr.count -= 1;
        if (*a).hdr.count == 0 && (*a).hdr.index as i32 != g.str.secondary_arena_free_head {
            if (*a).hdr.prev >= 0 {
                if let SecondarySlot::Arena(p) = g.str.secondary_list[(*a).hdr.prev as usize] {
                    (*p).hdr.next = (*a).hdr.next;
                }
            } else if (*a).hdr.free_h != 0 {
                // Only chained arenas have a prev; the chain head is us.
                g.str.secondary_arena_free_head = (*a).hdr.next;
            }
            if (*a).hdr.next >= 0 {
                if let SecondarySlot::Arena(n) = g.str.secondary_list[(*a).hdr.next as usize] {
                    (*n).hdr.prev = (*a).hdr.prev;
                }
            }
            let index = (*a).hdr.index as i32;
            g.str.secondary_list[index as usize] =
                SecondarySlot::Free(g.str.secondary_slot_free_head);
            g.str.secondary_slot_free_head = index;
            g.pages.free(Address::from_mut_ptr(a));
            return;
        }
        if (*a).hdr.free_h == 0 {
            // Was full: rejoin the arenas-with-space chain.
            let head = g.str.secondary_arena_free_head;
            if head >= 0 {
                if let SecondarySlot::Arena(n) = g.str.secondary_list[head as usize] {
                    (*n).hdr.prev = (*a).hdr.index as i32;
                }
            }
            (*a).hdr.prev = -1;
            (*a).hdr.next = head;
            g.str.secondary_arena_free_head = (*a).hdr.index as i32;
        }
        (*a).hdr.free[aidxh(idx as u32)] |= abit(aidxl(idx as u32));
        (*a).hdr.free_h |= 1 << aidxh(idx as u32);
    }
}

// -- Entry maintenance -----------------------------------------------------

/// Unchain and free a chained entry that just emptied.
fn free_chained_strtab<VM: VMBinding>(g: &mut GlobalState<VM>, st: *mut StrTab) {
    unsafe {
        let prev = get_strtab(&g.str, (*st).prev_len);
        (*prev).next = (*st).next;
        if !(*st).next.is_null() {
            let n = (*st).next;
            (*n).prev_len = ((*n).prev_len & 0xF) | ((*st).prev_len & 0xFFFF_FFF0);
        }
    }
    free_strtab(g, st);
}

/// Clear one string table entry.
/// Precondition: the entry referred to by `hid` holds a matching string.
pub fn clear_strtab<VM: VMBinding>(g: &mut GlobalState<VM>, hid: u32) {
    let i = (hid & 0xF) as usize;
    debug_assert!(i as u32 != SLOT_INVALID, "invalid hid slot 15");
    g.str.num -= 1;
    let st = get_strtab(&g.str, hid);
    unsafe {
        debug_assert!(!(*st).strs[i].is_null(), "clearing null string");
        debug_assert_eq!(
            (*st).strs[i].as_ref::<GCstr>().hid,
            hid,
            "hid mismatch on clear"
        );
        (*st).strs[i] = GCRef::NULL;
        // Flipped hashes can never match a probe whose slot must agree.
        (*st).hashes[i] = !(*st).hashes[i];
        (*st).prev_len -= 1;
        if !is_primary(hid) && (*st).prev_len & 0xF == 0 {
            free_chained_strtab(g, st);
        }
    }
}

// -- Lookup / insert -------------------------------------------------------

fn str_eq(s: GCRef, bytes: &[u8]) -> bool {
    let st = unsafe { s.as_ref::<GCstr>() };
    st.len as usize == bytes.len() && st.bytes() == bytes
}

/// Find an interned string with these bytes. The caller re-marks a hit.
pub fn strtab_lookup<VM: VMBinding>(g: &GlobalState<VM>, bytes: &[u8], h: u32) -> Option<GCRef> {
    let mut st = &g.str.primary[(h & g.str.mask) as usize] as *const StrTab;
    loop {
        let e = unsafe { &*st };
        for i in 0..STRTAB_SLOTS {
            if e.hashes[i] == h && !e.strs[i].is_null() && str_eq(e.strs[i], bytes) {
                return Some(e.strs[i]);
            }
        }
        if e.next.is_null() {
            return None;
        }
        st = e.next;
    }
}

/// Index a freshly created string. Writes its hid.
pub fn strtab_insert<VM: VMBinding>(g: &mut GlobalState<VM>, s: GCRef, h: u32) -> Result<(), GcError> {
    let mut st = &mut g.str.primary[(h & g.str.mask) as usize] as *mut StrTab;
    let (entry, slot) = loop {
        let e = unsafe { &mut *st };
        if let Some(i) = (0..STRTAB_SLOTS).position(|i| e.strs[i].is_null()) {
            break (st, i);
        }
        if e.next.is_null() {
            // Chain a fresh secondary entry at the tail.
            let tail_locus = entry_locus(&g.str, st);
            let (new, _locus) = alloc_strtab(g)?;
            unsafe {
                (*new).prev_len = tail_locus;
                (*st).next = new;
            }
            break (new, 0);
        }
        st = e.next;
    };
    unsafe {
        let locus = entry_locus(&g.str, entry);
        let hid = locus | slot as u32;
        debug_assert!(slot as u32 != SLOT_INVALID);
        (*entry).strs[slot] = s;
        (*entry).hashes[slot] = h;
        (*entry).prev_len += 1;
        s.as_mut::<GCstr>().hid = hid;
    }
    g.str.num += 1;
    Ok(())
}

/// Rebuild the primary table at a new size, rewriting every hid. All
/// chained entries are re-created; secondary arenas are released first.
pub fn strtab_resize<VM: VMBinding>(g: &mut GlobalState<VM>, newsize: usize) -> Result<(), GcError> {
    debug_assert!(newsize.is_power_of_two());
    let mut live: Vec<GCRef> = Vec::with_capacity(g.str.num);
    for i in 0..g.str.primary.len() {
        let mut st = &g.str.primary[i] as *const StrTab;
        loop {
            let e = unsafe { &*st };
            for s in e.strs {
                if !s.is_null() {
                    live.push(s);
                }
            }
            if e.next.is_null() {
                break;
            }
            st = e.next;
        }
    }
    for slot in std::mem::take(&mut g.str.secondary_list) {
        if let SecondarySlot::Arena(a) = slot {
            g.pages.free(Address::from_mut_ptr(a));
        }
    }
    g.str.secondary_slot_free_head = -1;
    g.str.secondary_arena_free_head = -1;
    g.str.primary = vec![StrTab::EMPTY; newsize];
    g.str.mask = newsize as u32 - 1;
    g.str.num = 0;
    debug!("string table resized to {} entries ({} live)", newsize, live.len());
    for s in live {
        let h = unsafe { s.as_ref::<GCstr>().hash };
        strtab_insert(g, s, h)?;
    }
    Ok(())
}

/// Intern a byte string: return the existing object (re-marking it, in
/// case its arena is pending sweep) or create, index and return a new
/// one. The primary table doubles when live strings outgrow it.
pub fn str_new<VM: VMBinding>(g: &mut GlobalState<VM>, bytes: &[u8]) -> Result<GCRef, GcError> {
    let h = str_hash(bytes);
    if let Some(s) = strtab_lookup(g, bytes, h) {
        crate::mark::gc_mark_str(g, s);
        return Ok(s);
    }
    let s = crate::memory_manager::allocstr(g, bytes.len())?;
    unsafe {
        (*s).gcflags = 0;
        (*s).gct = GcKind::Str as u8;
        (*s).strflags = 0;
        (*s).reserved = 0;
        (*s).len = bytes.len() as u32;
        (*s).hash = h;
        let p = (*s).payload();
        std::ptr::copy_nonoverlapping(bytes.as_ptr(), p.to_mut_ptr(), bytes.len());
        (p + bytes.len()).store::<u8>(0);
    }
    let r = GCRef::from_ptr(s);
    strtab_insert(g, r, h)?;
    if g.str.num > g.str.mask as usize + 1 && (g.str.mask as usize) < (1 << 22) - 1 {
        strtab_resize(g, (g.str.mask as usize + 1) * 2)?;
    }
    Ok(r)
}

/// Pin a string so no sweep ever reclaims it.
pub fn str_fix<VM: VMBinding>(g: &mut GlobalState<VM>, s: GCRef) {
    debug_assert_eq!(s.gct(), GcKind::Str);
    let len = unsafe { s.as_ref::<GCstr>().len } as usize;
    let a = arena_of(s.addr()) as *mut GCAstr;
    if len > HUGE_STR_THRESHOLD {
        unsafe { (*a).free_start = 1 };
        return;
    }
    let idx = STR_MED_LAYOUT.idx_of(s.addr());
    unsafe { (*a).fixed.set(idx) };
    let _ = g;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hash_is_deterministic_and_spread() {
        assert_eq!(str_hash(b"hello"), str_hash(b"hello"));
        assert_ne!(str_hash(b"hello"), str_hash(b"hellp"));
        assert_ne!(str_hash(b"a"), str_hash(b"b"));
        assert_eq!(str_hash(b""), 0);
        let long = vec![7u8; 300];
        assert_eq!(str_hash(&long), str_hash(&long.clone()));
    }

    #[test]
    fn hid_geometry() {
        // Primary loci always carry the top six bits; secondary entry
        // indices fit nine bits.
        assert!(is_primary(PRIMARY_TAG));
        assert!(!is_primary((3 << 13) | (339 << 4)));
        assert!(STRTAB_ENTRIES <= 512);
        let locus = (7u32 << 13) | (42 << 4);
        assert_eq!((locus >> 13), 7);
        assert_eq!((locus >> 4) & 0x1FF, 42);
    }

    #[test]
    fn entry_shape() {
        assert_eq!(mem::size_of::<StrTab>(), 192);
        assert!(mem::size_of::<GCAstrtab>() <= ARENA_SIZE);
    }
}

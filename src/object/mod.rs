//! The value model the collector owns: object kinds, flag bytes, tagged
//! values and the fixed-slot object layouts that live inside arenas.
//!
//! Interpreter-facing structure is kept to what marking, sweeping and the
//! finalizer bridge must observe.

pub mod tab;

use memoffset::offset_of;
use static_assertions::const_assert_eq;
use std::mem;
use strum_macros::EnumIter;

use crate::util::constants::*;
use crate::util::Address;

pub use tab::{GCtab, Node};

/// GC object kinds. Fixed-slot kinds (string, upvalue, function, table,
/// userdata) live in typed arenas; the rest are raw-allocated and chained
/// on the root list.
#[derive(Debug, Clone, Copy, PartialEq, Eq, EnumIter)]
#[repr(u8)]
pub enum GcKind {
    Str = 0,
    Upval,
    Thread,
    Proto,
    Func,
    Trace,
    Cdata,
    Tab,
    Udata,
}

impl GcKind {
    pub fn from_u8(b: u8) -> GcKind {
        debug_assert!(b <= GcKind::Udata as u8);
        // The gct byte is written exclusively from GcKind discriminants.
        unsafe { mem::transmute(b) }
    }

    /// Kinds allocated from bitmap arenas.
    pub const fn is_arena_kind(self) -> bool {
        matches!(
            self,
            GcKind::Str | GcKind::Upval | GcKind::Func | GcKind::Tab | GcKind::Udata
        )
    }
}

/// Slot size of an arena kind (zero for list kinds, mirroring the
/// divider table).
pub const fn kind_size(k: GcKind) -> usize {
    match k {
        GcKind::Str => mem::size_of::<GCstr>(),
        GcKind::Upval => mem::size_of::<GCupval>(),
        GcKind::Func => mem::size_of::<GCfunc>(),
        GcKind::Tab => mem::size_of::<GCtab>(),
        GcKind::Udata => mem::size_of::<GCudata>(),
        _ => 0,
    }
}

/// Fixed-point shift of the divider inverses.
pub const INVERSE_SHIFT: u32 = 32;

/// Multiplicative inverse of the slot size: `off * inv >> 32` recovers
/// `off / size` exactly for every legal in-arena offset. mul + shift beats
/// div on every CPU this runs on.
pub const fn kind_inverse(k: GcKind) -> u32 {
    let size = kind_size(k);
    if size == 0 {
        0
    } else {
        ((1u64 << INVERSE_SHIFT) / size as u64 + 1) as u32
    }
}

/// A nullable reference to any GC object.
#[repr(transparent)]
#[derive(Copy, Clone, PartialEq, Eq, Hash)]
pub struct GCRef(Address);

impl GCRef {
    pub const NULL: GCRef = GCRef(Address::ZERO);

    pub fn from_addr(a: Address) -> GCRef {
        GCRef(a)
    }

    pub fn from_ptr<T>(p: *mut T) -> GCRef {
        GCRef(Address::from_mut_ptr(p))
    }

    pub fn addr(self) -> Address {
        self.0
    }

    pub fn is_null(self) -> bool {
        self.0.is_zero()
    }

    pub fn ptr<T>(self) -> *mut T {
        self.0.to_mut_ptr()
    }

    /// # Safety
    /// The reference must point to a live object of type `T`.
    pub unsafe fn as_ref<'a, T>(self) -> &'a T {
        self.0.as_ref()
    }

    /// # Safety
    /// As [`GCRef::as_ref`], with exclusive access.
    pub unsafe fn as_mut<'a, T>(self) -> &'a mut T {
        self.0.as_mut_ref()
    }

    /// The object's kind byte. Every object layout starts with
    /// `(gcflags, gct)`.
    pub fn gct(self) -> GcKind {
        debug_assert!(!self.is_null());
        GcKind::from_u8(unsafe { (self.0 + 1usize).load::<u8>() })
    }

    pub fn gcflags(self) -> u8 {
        debug_assert!(!self.is_null());
        unsafe { self.0.load::<u8>() }
    }

    pub fn set_gcflags(self, flags: u8) {
        unsafe { self.0.store::<u8>(flags) }
    }

    pub fn flags_or(self, bits: u8) {
        self.set_gcflags(self.gcflags() | bits);
    }

    pub fn flags_andn(self, bits: u8) {
        self.set_gcflags(self.gcflags() & !bits);
    }

    /// Strip all color bits (the new white).
    pub fn make_white(self) {
        self.flags_andn(GC_COLORS);
    }

    pub fn is_white(self, currentblackgray: u8) -> bool {
        self.gcflags() & currentblackgray == 0
    }
}

impl Default for GCRef {
    fn default() -> Self {
        GCRef::NULL
    }
}

impl std::fmt::Debug for GCRef {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        if self.is_null() {
            write!(f, "GCRef(null)")
        } else {
            write!(f, "GCRef({:?}/{:?})", self.gct(), self.0)
        }
    }
}

/// A tagged value slot. The collector only distinguishes collectible
/// payloads; everything else is inert.
#[derive(Copy, Clone, Debug, PartialEq)]
pub enum TValue {
    Nil,
    False,
    True,
    Num(f64),
    Gc(GCRef),
}

impl TValue {
    pub fn is_nil(self) -> bool {
        matches!(self, TValue::Nil)
    }

    pub fn gc(self) -> Option<GCRef> {
        match self {
            TValue::Gc(o) => Some(o),
            _ => None,
        }
    }

    pub fn is_str(self) -> bool {
        matches!(self, TValue::Gc(o) if o.gct() == GcKind::Str)
    }
}

// -- Fixed-slot (arena) kinds ---------------------------------------------

/// String header; the bytes follow inline, NUL-terminated. Small strings
/// (len <= 15) occupy exactly two 16-byte slots of a small-string arena.
#[repr(C)]
pub struct GCstr {
    pub gcflags: u8,
    pub gct: u8,
    pub strflags: u8,
    pub reserved: u8,
    /// Interning locus, see the string table module.
    pub hid: u32,
    pub len: u32,
    pub hash: u32,
}

impl GCstr {
    pub fn payload(&self) -> Address {
        Address::from_ref(self) + mem::size_of::<GCstr>()
    }

    pub fn bytes(&self) -> &[u8] {
        unsafe { std::slice::from_raw_parts(self.payload().to_ptr(), self.len as usize) }
    }
}

/// Upvalue: either open (v points into a thread stack) or closed
/// (v points at the inline tv).
#[repr(C)]
pub struct GCupval {
    pub gcflags: u8,
    pub gct: u8,
    pub closed: u8,
    pub immutable: u8,
    pub _pad: u32,
    /// Points at the current value location.
    pub v: Address,
    pub tv: TValue,
    /// Next upvalue in the owning thread's open chain.
    pub next: GCRef,
}

impl GCupval {
    pub fn value(&self) -> TValue {
        unsafe { self.v.load::<TValue>() }
    }
}

/// Function. `ffid == 0` is a scripted function whose `pt` references a
/// prototype and whose data payload holds `nupvalues` upvalue refs; a
/// native function keeps `nupvalues` TValues there instead.
#[repr(C)]
pub struct GCfunc {
    pub gcflags: u8,
    pub gct: u8,
    pub ffid: u8,
    pub nupvalues: u8,
    pub _pad: u32,
    pub env: GCRef,
    pub pt: GCRef,
    /// Colocated in adjacent slots or blob-allocated.
    pub data: Address,
    pub gclist: GCRef,
}

pub const FF_LUA: u8 = 0;

impl GCfunc {
    pub fn is_scripted(&self) -> bool {
        self.ffid == FF_LUA
    }

    /// Size of the data payload in bytes.
    pub fn data_size(&self) -> usize {
        if self.is_scripted() {
            self.nupvalues as usize * mem::size_of::<GCRef>()
        } else {
            self.nupvalues as usize * mem::size_of::<TValue>()
        }
    }

    pub fn upval_ref(&self, i: usize) -> GCRef {
        debug_assert!(self.is_scripted() && i < self.nupvalues as usize);
        unsafe { (self.data + i * mem::size_of::<GCRef>()).load() }
    }

    pub fn upval_tv_slot(&self, i: usize) -> Address {
        debug_assert!(!self.is_scripted() && i < self.nupvalues as usize);
        self.data + i * mem::size_of::<TValue>()
    }
}

/// Userdata kinds with special traversal/teardown.
pub const UDTYPE_GENERIC: u8 = 0;
pub const UDTYPE_BUFFER: u8 = 1;

/// Userdata. The payload is either colocated in following slots
/// (size-class flag bits set) or raw-allocated.
#[repr(C)]
pub struct GCudata {
    pub gcflags: u8,
    pub gct: u8,
    pub udtype: u8,
    pub unused: u8,
    pub len: u32,
    pub payload: Address,
    pub metatable: GCRef,
    pub env: GCRef,
    pub gclist: GCRef,
}

impl GCudata {
    pub fn is_colocated(&self) -> bool {
        self.gcflags & GC_SIZE_BITS != 0 || self.len == 0
    }
}

/// Leading header of a buffer-typed userdata payload.
#[repr(C)]
pub struct BufHeader {
    pub flags: u32,
    pub _pad: u32,
    /// Copy-on-write source.
    pub cowref: GCRef,
    pub dict_str: GCRef,
    pub dict_mt: GCRef,
}

/// Buffer flag: payload borrows from `cowref`.
pub const BUF_COW: u32 = 0x1;

// -- Raw-allocated (root list) kinds --------------------------------------

/// Common prefix of every raw-allocated kind; checked below.
#[repr(C)]
pub struct GCoHdr {
    pub gcflags: u8,
    pub gct: u8,
    pub _pad: [u8; 6],
    pub nextgc: GCRef,
    pub gclist: GCRef,
}

/// An execution thread. Only the parts stack traversal needs.
#[repr(C)]
pub struct GCthread {
    pub gcflags: u8,
    pub gct: u8,
    pub status: u8,
    pub _pad: [u8; 5],
    pub nextgc: GCRef,
    pub gclist: GCRef,
    pub env: GCRef,
    /// Raw-allocated TValue array.
    pub stack: Address,
    /// Capacity in slots.
    pub stacksize: u32,
    /// First unused slot.
    pub top: u32,
    pub base: u32,
    pub _pad2: u32,
    /// Head of the open-upvalue chain.
    pub openupval: GCRef,
}

impl GCthread {
    pub fn slot(&self, i: u32) -> Address {
        debug_assert!(i < self.stacksize);
        self.stack + i as usize * mem::size_of::<TValue>()
    }

    pub fn stack_bytes(size: u32) -> usize {
        size as usize * mem::size_of::<TValue>()
    }
}

/// A function prototype. `sizekgc` collectible constants follow the
/// header inline; `sizept` is the full allocation size.
#[repr(C)]
pub struct GCproto {
    pub gcflags: u8,
    pub gct: u8,
    pub _pad: [u8; 6],
    pub nextgc: GCRef,
    pub gclist: GCRef,
    pub chunkname: GCRef,
    pub sizekgc: u32,
    pub sizept: u32,
    pub trace: u32,
    pub _pad2: u32,
}

impl GCproto {
    pub fn kgc_slot(&self, i: usize) -> Address {
        debug_assert!(i < self.sizekgc as usize);
        Address::from_ref(self) + mem::size_of::<GCproto>() + i * mem::size_of::<GCRef>()
    }

    pub fn kgc(&self, i: usize) -> GCRef {
        unsafe { self.kgc_slot(i).load() }
    }

    pub const fn alloc_size(nkgc: u32) -> usize {
        mem::size_of::<GCproto>() + nkgc as usize * mem::size_of::<GCRef>()
    }
}

/// A compiled trace: the constant references the mark engine must see,
/// plus the links trace unlinking follows.
#[repr(C)]
pub struct GCtrace {
    pub gcflags: u8,
    pub gct: u8,
    pub _pad: [u8; 6],
    pub nextgc: GCRef,
    pub gclist: GCRef,
    pub startpt: GCRef,
    pub traceno: u32,
    pub link: u32,
    pub nextroot: u32,
    pub nextside: u32,
    pub nk: u32,
    pub _pad2: u32,
}

impl GCtrace {
    pub fn kgc_slot(&self, i: usize) -> Address {
        debug_assert!(i < self.nk as usize);
        Address::from_ref(self) + mem::size_of::<GCtrace>() + i * mem::size_of::<GCRef>()
    }

    pub fn kgc(&self, i: usize) -> GCRef {
        unsafe { self.kgc_slot(i).load() }
    }

    pub const fn alloc_size(nk: u32) -> usize {
        mem::size_of::<GCtrace>() + nk as usize * mem::size_of::<GCRef>()
    }
}

/// FFI cdata; payload follows inline. Finalizers are dispatched through
/// the FFI finalizer table with the cdata as key.
#[repr(C)]
pub struct GCcdata {
    pub gcflags: u8,
    pub gct: u8,
    pub ctypeid: u16,
    pub _pad: u32,
    pub nextgc: GCRef,
    pub gclist: GCRef,
    pub len: u32,
    pub _pad2: u32,
}

impl GCcdata {
    pub const fn alloc_size(len: u32) -> usize {
        mem::size_of::<GCcdata>() + len as usize
    }
}

// The small-string cell size is load-bearing: slot math, hid bookkeeping
// and the 2-of-2 bitmap pattern all assume it.
const_assert_eq!(mem::size_of::<GCstr>(), 16);
const_assert_eq!(mem::size_of::<TValue>(), 16);
// Slot addressing assumes 8-aligned slot sizes.
const_assert_eq!(mem::size_of::<GCupval>() % 8, 0);
const_assert_eq!(mem::size_of::<GCfunc>() % 8, 0);
const_assert_eq!(mem::size_of::<GCtab>() % 8, 0);
const_assert_eq!(mem::size_of::<GCudata>() % 8, 0);

macro_rules! assert_gco_prefix {
    ($t:ty) => {
        const_assert_eq!(offset_of!($t, gcflags), 0);
        const_assert_eq!(offset_of!($t, gct), 1);
        const_assert_eq!(offset_of!($t, nextgc), offset_of!(GCoHdr, nextgc));
        const_assert_eq!(offset_of!($t, gclist), offset_of!(GCoHdr, gclist));
    };
}

assert_gco_prefix!(GCthread);
assert_gco_prefix!(GCproto);
assert_gco_prefix!(GCtrace);
assert_gco_prefix!(GCcdata);

#[cfg(test)]
mod tests {
    use super::*;
    use strum::IntoEnumIterator;

    #[test]
    fn kind_roundtrip() {
        for k in GcKind::iter() {
            assert_eq!(GcKind::from_u8(k as u8), k);
        }
    }

    #[test]
    fn inverse_recovers_every_offset() {
        // Contract of the divider tables: exact recovery for all legal
        // in-arena offsets of every arena kind.
        for k in GcKind::iter().filter(|k| k.is_arena_kind()) {
            let size = kind_size(k);
            let inv = kind_inverse(k) as u64;
            let mut off = 0usize;
            while off < ARENA_SIZE {
                let idx = (off as u64 * inv) >> INVERSE_SHIFT;
                assert_eq!(idx as usize, off / size, "kind {:?} offset {}", k, off);
                off += size;
            }
        }
    }

    #[test]
    fn tvalue_tags() {
        assert!(TValue::Nil.is_nil());
        assert_eq!(TValue::Num(1.5).gc(), None);
        let r = GCRef::NULL;
        assert!(r.is_null());
    }
}

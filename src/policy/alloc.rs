//! Bitmap arena allocation: the fast path, 1–3 slot coalescing for
//! colocated payloads, the 4-run merged userdata path, and arena
//! acquisition (freelist first, fresh page second).

use std::mem;

use crate::global::{ArenaKind, GlobalState};
use crate::object::*;
use crate::policy::arena::*;
use crate::policy::{blob, medium};
use crate::util::constants::*;
use crate::util::simd::{reset_lowest64, tzcount64};
use crate::util::Address;
use crate::vm::VMBinding;
use crate::GcError;

pub fn layout_of(ak: ArenaKind) -> ArenaLayout {
    match ak {
        ArenaKind::Tab | ArenaKind::FinTab => TAB_LAYOUT,
        ArenaKind::Func => FUNC_LAYOUT,
        ArenaKind::Uv => UV_LAYOUT,
        ArenaKind::Udata => UDATA_LAYOUT,
        ArenaKind::StrSmall => STR_SMALL_LAYOUT,
        ArenaKind::StrMed => STR_MED_LAYOUT,
    }
}

fn kind_of(ak: ArenaKind) -> GcKind {
    match ak {
        ArenaKind::Tab | ArenaKind::FinTab => GcKind::Tab,
        ArenaKind::Func => GcKind::Func,
        ArenaKind::Uv => GcKind::Upval,
        ArenaKind::Udata => GcKind::Udata,
        ArenaKind::StrSmall | ArenaKind::StrMed => GcKind::Str,
    }
}

/// Acquire an allocation arena for `ak` and make it the list head:
/// the first freelist arena if any (sweeping it first when its parity
/// is stale), otherwise a fresh page.
pub fn new_arena<VM: VMBinding>(
    g: &mut GlobalState<VM>,
    ak: ArenaKind,
) -> Result<*mut GCAcommon, GcError> {
    let current = g.gc.currentsweep;
    let list = g.gc.list(ak);
    if !list.free.is_null() {
        let a = unsafe { relink(&mut list.free, &mut list.head) };
        unsafe {
            debug_assert!((*(a as *mut GCAcommon)).free_h != 0, "empty arena on freelist");
            if (*a).flags & current == 0 {
                if g.gc.sweep == a {
                    g.gc.sweep = (*a).next;
                }
                crate::sweep::sweep_one_bitmap(g, ak, a);
            }
        }
        trace!("reusing {:?} arena {:?}", ak, a);
        return Ok(a as *mut GCAcommon);
    }
    let page = g.pages.alloc();
    if page.is_zero() {
        return Err(GcError::OutOfMemory);
    }
    let a = unsafe { init_bitmap_arena(page, kind_of(ak), layout_of(ak), current) };
    if ak == ArenaKind::Udata {
        unsafe {
            let ud = a as *mut GCAudata;
            (*ud).free4_h = (*a).free_h;
        }
    }
    let list = g.gc.list(ak);
    unsafe { list_link(&mut list.head, a as *mut ArenaHdr) };
    trace!("fresh {:?} arena {:?}", ak, a);
    Ok(a)
}

/// One primary arena per kind; created at init and immortal thereafter.
pub fn init_primary_arenas<VM: VMBinding>(g: &mut GlobalState<VM>) -> Result<(), GcError> {
    for ak in [
        ArenaKind::Tab,
        ArenaKind::FinTab,
        ArenaKind::Func,
        ArenaKind::Uv,
        ArenaKind::Udata,
        ArenaKind::StrSmall,
    ] {
        new_arena(g, ak)?;
    }
    medium::new_med_arena(g)?;
    Ok(())
}

/// Fast-path slot allocation from the head arena. Returns the slot
/// address; refills the head arena when exhausted.
fn alloc_slot<VM: VMBinding>(
    g: &mut GlobalState<VM>,
    ak: ArenaKind,
) -> Result<Address, GcError> {
    let layout = layout_of(ak);
    let mut a = g.gc.list(ak).head as *mut GCAcommon;
    unsafe {
        if (*a).free_h == 0 {
            a = new_arena(g, ak)?;
        }
        let i = tzcount64((*a).free_h) as usize;
        debug_assert!((*a).free[i] != 0, "free summary out of sync");
        let j = tzcount64((*a).free[i]);
        let f = reset_lowest64((*a).free[i]);
        (*a).free[i] = f;
        if f == 0 {
            (*a).free_h = reset_lowest64((*a).free_h);
            if ak == ArenaKind::Udata {
                (*(a as *mut GCAudata)).free4_h &= !abit(i as u32);
            }
        }
        let idx = (i << 6) as u32 + j;
        debug_assert!(idx >= layout.occupied, "allocating into arena header");
        Ok(slot_addr(a as *mut ArenaHdr, layout, idx))
    }
}

/// Find the lowest run of `n + 1` consecutive set bits in `word`
/// (iterated shift-and: cumulative shifts 1, 1, 2).
fn find_run(word: u64, n: usize) -> Option<u32> {
    debug_assert!((1..=3).contains(&n));
    let mut k = word;
    k &= k >> ((n >> 1) + (n & 1));
    k &= k >> (n >> 1);
    if k != 0 {
        Some(tzcount64(k))
    } else {
        None
    }
}

/// Allocate a table; an array part of `asize` is colocated into adjacent
/// slots when it fits in at most three, blob-allocated otherwise.
pub fn alloctab<VM: VMBinding>(
    g: &mut GlobalState<VM>,
    asize: u32,
) -> Result<*mut GCtab, GcError> {
    if asize as usize > MAX_ASIZE {
        return Err(GcError::TableOverflow);
    }
    let layout = TAB_LAYOUT;
    let mut a = g.gc.tab.head as *mut GCAcommon;
    unsafe {
        if (*a).free_h == 0 {
            a = new_arena(g, ArenaKind::Tab)?;
        }
        let i = tzcount64((*a).free_h) as usize;
        let mut j = tzcount64((*a).free[i]);
        let mut f = reset_lowest64((*a).free[i]);
        let mut newf = 0u8;
        let mut colo = Address::ZERO;
        let n = (asize as usize * mem::size_of::<TValue>() + mem::size_of::<GCtab>() - 1)
            / mem::size_of::<GCtab>();
        if n > 0 && n <= 3 {
            if let Some(rj) = find_run((*a).free[i], n) {
                j = rj;
                f = (*a).free[i] ^ (((1u64 << (n + 1)) - 1) << j);
                newf = size2flags(n + 1);
                colo = slot_addr(a as *mut ArenaHdr, layout, (i << 6) as u32 + j + 1);
            }
        }
        (*a).free[i] = f;
        if f == 0 {
            (*a).free_h = reset_lowest64((*a).free_h);
        }
        let idx = (i << 6) as u32 + j;
        debug_assert!(idx >= layout.occupied, "allocating into arena header");
        let t = slot_addr(a as *mut ArenaHdr, layout, idx).to_mut_ptr::<GCtab>();
        let array = if colo.is_zero() && asize > 0 {
            blob::newblob(g, asize as usize * mem::size_of::<TValue>())?
        } else {
            colo
        };
        (*t).gcflags = newf;
        (*t).gct = GcKind::Tab as u8;
        (*t).nomm = !0;
        (*t).colo = if colo.is_zero() { 0 } else { asize as i8 };
        (*t).asize = asize;
        (*t).hmask = 0;
        (*t)._pad = 0;
        (*t).array = array;
        (*t).node = Address::ZERO;
        (*t).freetop = Address::ZERO;
        (*t).metatable = GCRef::NULL;
        (*t).gclist = GCRef::NULL;
        for k in 0..asize {
            (*t).array_slot(k).store(TValue::Nil);
        }
        g.gc.total += mem::size_of::<GCtab>() + asize as usize * mem::size_of::<TValue>();
        Ok(t)
    }
}

/// Allocate an empty table from the finalizer-table arena list; only
/// tables allocated here can carry `__gc` finalizers.
pub fn alloctabempty_gc<VM: VMBinding>(g: &mut GlobalState<VM>) -> Result<*mut GCtab, GcError> {
    let slot = alloc_slot(g, ArenaKind::FinTab)?;
    let t = slot.to_mut_ptr::<GCtab>();
    unsafe {
        (*t).gcflags = 0;
        (*t).gct = GcKind::Tab as u8;
        (*t).nomm = !0;
        (*t).colo = 0;
        (*t).asize = 0;
        (*t).hmask = 0;
        (*t)._pad = 0;
        (*t).array = Address::ZERO;
        (*t).node = Address::ZERO;
        (*t).freetop = Address::ZERO;
        (*t).metatable = GCRef::NULL;
        (*t).gclist = GCRef::NULL;
    }
    g.gc.total += mem::size_of::<GCtab>();
    Ok(t)
}

/// Allocate an upvalue, closed over its own nil slot; the host reopens
/// it onto a stack slot when capturing.
pub fn allocuv<VM: VMBinding>(g: &mut GlobalState<VM>) -> Result<*mut GCupval, GcError> {
    let slot = alloc_slot(g, ArenaKind::Uv)?;
    let uv = slot.to_mut_ptr::<GCupval>();
    unsafe {
        (*uv).gcflags = 0;
        (*uv).gct = GcKind::Upval as u8;
        (*uv).closed = 1;
        (*uv).immutable = 0;
        (*uv)._pad = 0;
        (*uv).tv = TValue::Nil;
        (*uv).v = Address::from_mut_ptr(std::ptr::addr_of_mut!((*uv).tv));
        (*uv).next = GCRef::NULL;
    }
    g.gc.total += mem::size_of::<GCupval>();
    Ok(uv)
}

/// Allocate a function with `bytes` of upvalue payload, colocated into
/// adjacent slots when it fits, blob-allocated otherwise.
pub fn allocfunc<VM: VMBinding>(
    g: &mut GlobalState<VM>,
    bytes: usize,
) -> Result<*mut GCfunc, GcError> {
    let layout = FUNC_LAYOUT;
    let mut a = g.gc.func.head as *mut GCAcommon;
    unsafe {
        if (*a).free_h == 0 {
            a = new_arena(g, ArenaKind::Func)?;
        }
        let i = tzcount64((*a).free_h) as usize;
        let mut j = tzcount64((*a).free[i]);
        let mut f = reset_lowest64((*a).free[i]);
        let mut newf = 0u8;
        let mut data = Address::ZERO;
        let n = (bytes + mem::size_of::<GCfunc>() - 1) / mem::size_of::<GCfunc>();
        if n > 0 && n <= 3 {
            if let Some(rj) = find_run((*a).free[i], n) {
                j = rj;
                f = (*a).free[i] ^ (((1u64 << (n + 1)) - 1) << j);
                newf = size2flags(n + 1);
                data = slot_addr(a as *mut ArenaHdr, layout, (i << 6) as u32 + j + 1);
            }
        }
        (*a).free[i] = f;
        if f == 0 {
            (*a).free_h = reset_lowest64((*a).free_h);
        }
        let idx = (i << 6) as u32 + j;
        debug_assert!(idx >= layout.occupied, "allocating into arena header");
        let func = slot_addr(a as *mut ArenaHdr, layout, idx).to_mut_ptr::<GCfunc>();
        if data.is_zero() && bytes > 0 {
            data = blob::newblob(g, bytes)?;
        }
        if !data.is_zero() {
            std::ptr::write_bytes(data.to_mut_ptr::<u8>(), 0, bytes);
        }
        (*func).gcflags = newf;
        (*func).gct = GcKind::Func as u8;
        (*func).ffid = FF_LUA;
        (*func).nupvalues = 0;
        (*func)._pad = 0;
        (*func).env = GCRef::NULL;
        (*func).pt = GCRef::NULL;
        (*func).data = data;
        (*func).gclist = GCRef::NULL;
        g.gc.total += bytes + mem::size_of::<GCfunc>();
        Ok(func)
    }
}

unsafe fn alloc_udata_merged(a: *mut GCAudata, n: usize) -> Option<*mut GCudata> {
    loop {
        if (*a).free4_h == 0 {
            return None;
        }
        let i = tzcount64((*a).free4_h) as usize;
        let mut q = (*a).a.free[i];
        q &= q >> 2;
        q &= q >> 1;
        if q == 0 {
            (*a).free4_h = reset_lowest64((*a).free4_h);
            continue;
        }
        let j = tzcount64(q);
        (*a).a.free[i] ^= ((1u64 << n) - 1) << j;
        if (*a).a.free[i] == 0 {
            (*a).a.free_h &= !abit(i as u32);
            (*a).free4_h &= !abit(i as u32);
        }
        let idx = (i << 6) as u32 + j;
        let ud = slot_addr(a as *mut ArenaHdr, UDATA_LAYOUT, idx).to_mut_ptr::<GCudata>();
        (*ud).gcflags = size2flags(n);
        (*ud).gct = GcKind::Udata as u8;
        (*ud).payload = Address::from_mut_ptr(ud.add(1));
        return Some(ud);
    }
}

/// Allocate userdata. Payloads of up to three extra slots are merged
/// into the arena; anything larger comes from the raw allocator.
pub fn allocudata<VM: VMBinding>(
    g: &mut GlobalState<VM>,
    bytes: usize,
) -> Result<*mut GCudata, GcError> {
    let n = (bytes + 2 * mem::size_of::<GCudata>() - 1) / mem::size_of::<GCudata>();
    let mut a = g.gc.udata.head as *mut GCAudata;
    unsafe {
        if (*a).a.free_h == 0 {
            a = new_arena(g, ArenaKind::Udata)? as *mut GCAudata;
        }
        if (1..=4).contains(&n) && bytes > 0 {
            let merged = alloc_udata_merged(a, n.max(2)).or_else(|| {
                // Walk the freelist for an arena that still has a run.
                let mut fa = g.gc.udata.free as *mut GCAudata;
                while !fa.is_null() {
                    if let Some(ud) = alloc_udata_merged(fa, n.max(2)) {
                        if (*fa).a.free_h == 0 {
                            free_unlink(&mut g.gc.udata.free, fa as *mut ArenaHdr);
                        }
                        return Some(ud);
                    }
                    fa = (*fa).a.hdr.freenext as *mut GCAudata;
                }
                None
            });
            let ud = match merged {
                Some(ud) => ud,
                None => {
                    let fresh = new_arena(g, ArenaKind::Udata)? as *mut GCAudata;
                    alloc_udata_merged(fresh, n.max(2)).ok_or(GcError::OutOfMemory)?
                }
            };
            std::ptr::write_bytes((*ud).payload.to_mut_ptr::<u8>(), 0, bytes);
            (*ud).udtype = UDTYPE_GENERIC;
            (*ud).unused = 0;
            (*ud).len = bytes as u32;
            (*ud).metatable = GCRef::NULL;
            (*ud).env = GCRef::NULL;
            (*ud).gclist = GCRef::NULL;
            g.gc.total += mem::size_of::<GCudata>();
            return Ok(ud);
        }
        let slot = alloc_slot(g, ArenaKind::Udata)?;
        let ud = slot.to_mut_ptr::<GCudata>();
        let payload = if bytes > 0 {
            g.gc.malloc += bytes;
            g.gc.total += bytes;
            let p = g.allocf.raw_alloc(Address::ZERO, 0, bytes);
            if p.is_zero() {
                return Err(GcError::OutOfMemory);
            }
            p
        } else {
            Address::ZERO
        };
        (*ud).gcflags = 0;
        (*ud).gct = GcKind::Udata as u8;
        (*ud).udtype = UDTYPE_GENERIC;
        (*ud).unused = 0;
        (*ud).len = bytes as u32;
        (*ud).payload = payload;
        (*ud).metatable = GCRef::NULL;
        (*ud).env = GCRef::NULL;
        (*ud).gclist = GCRef::NULL;
        g.gc.total += mem::size_of::<GCudata>();
        Ok(ud)
    }
}

/// Allocate a small-string cell (two 16-byte slots). The caller fills
/// bytes, hash and hid.
pub fn allocstr_small<VM: VMBinding>(g: &mut GlobalState<VM>) -> Result<*mut GCstr, GcError> {
    let mut a = g.gc.str_small.head as *mut GCAstr;
    unsafe {
        let (i, j) = loop {
            if (*a).free_h == 0 {
                // Arena filled mid-cycle: its sweep must recover the dead
                // count by popcount.
                (*a).hdr.flags |= ARENA_SWEEP_DIRTY;
                a = new_arena(g, ArenaKind::StrSmall)? as *mut GCAstr;
            }
            let i = tzcount64((*a).free_h) as usize;
            if (*a).free[i] != 0 {
                break (i, tzcount64((*a).free[i]));
            }
            (*a).free_h = reset_lowest64((*a).free_h);
        };
        let f = reset_lowest64((*a).free[i]);
        (*a).free[i] = f;
        if f == 0 {
            (*a).free_h = reset_lowest64((*a).free_h);
        }
        let idx = (i << 6) as u32 + j;
        debug_assert!(idx >= STR_SMALL_LAYOUT.occupied, "allocating into arena header");
        debug_assert!(idx % 2 == 0, "small strings start on even slots");
        let s = slot_addr(a as *mut ArenaHdr, STR_MED_LAYOUT, idx).to_mut_ptr::<GCstr>();
        g.gc.total += 2 * mem::size_of::<GCstr>();
        g.gc.strings += 2 * mem::size_of::<GCstr>();
        Ok(s)
    }
}

#[cfg(test)]
mod tests {
    use super::find_run;

    #[test]
    fn run_finder() {
        // n is the payload slot count; the run is n+1 bits long.
        assert_eq!(find_run(0b0011, 1), Some(0));
        assert_eq!(find_run(0b0110, 1), Some(1));
        assert_eq!(find_run(0b0110, 2), None);
        assert_eq!(find_run(0b1110, 2), Some(1));
        assert_eq!(find_run(0b1111, 3), Some(0));
        assert_eq!(find_run(0b1011_0111, 3), None);
        assert_eq!(find_run(0b1111_0111, 3), Some(4));
        assert_eq!(find_run(u64::MAX, 3), Some(0));
        assert_eq!(find_run(0, 1), None);
    }
}

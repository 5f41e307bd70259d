//! The blob region: GC-managed variable-size payloads owned by GC
//! objects (table array/hash parts, function data, prototype constants).
//!
//! Payloads are bump-allocated in arena-sized blob pages tracked by id.
//! Liveness is recomputed during mark through per-page usage counters;
//! pages whose usage stays low are tagged `BLOB_REAP` and their live
//! payloads are copied out during the next mark.

use crate::global::GlobalState;
use crate::util::constants::*;
use crate::util::Address;
use crate::vm::VMBinding;
use crate::GcError;

/// Blob page header; allocations bump `alloc`.
#[repr(C)]
pub struct GCAblob {
    pub alloc: u32,
    pub flags: u32,
    pub id: u32,
    pub _pad: u32,
}

/// The page owning a blob payload. Huge pages are arena-aligned too, and
/// a payload base always lies within the first arena-sized window.
#[inline]
pub fn blob_of(p: Address) -> *mut GCAblob {
    p.align_down(ARENA_SIZE).to_mut_ptr()
}

fn push_page<VM: VMBinding>(g: &mut GlobalState<VM>, page: *mut GCAblob, flags: u32) -> u32 {
    let id = g.gc.bloblist.len() as u32;
    unsafe {
        (*page).alloc = std::mem::size_of::<GCAblob>() as u32;
        (*page).flags = flags;
        (*page).id = id;
    }
    g.gc.bloblist.push(page);
    g.gc.bloblist_usage.push(0);
    id
}

fn new_generic_page<VM: VMBinding>(g: &mut GlobalState<VM>) -> Result<*mut GCAblob, GcError> {
    let page = g.pages.alloc();
    if page.is_zero() {
        return Err(GcError::OutOfMemory);
    }
    let page = page.to_mut_ptr::<GCAblob>();
    push_page(g, page, 0);
    g.gc.blob_generic = page;
    trace!("new blob page id={}", unsafe { (*page).id });
    Ok(page)
}

/// First blob page, created at state init.
pub fn init_blob_region<VM: VMBinding>(g: &mut GlobalState<VM>) -> Result<(), GcError> {
    debug_assert!(g.gc.bloblist.is_empty());
    new_generic_page(g).map(|_| ())
}

/// Allocate without touching the total (mark-time moves use this).
pub fn newblob_g<VM: VMBinding>(g: &mut GlobalState<VM>, sz: usize) -> Result<Address, GcError> {
    let sz = (sz + 15) & !15;
    if sz > BLOB_HUGE_THRESHOLD {
        let page = g.pages.alloc_huge(sz + std::mem::size_of::<GCAblob>());
        if page.is_zero() {
            return Err(GcError::OutOfMemory);
        }
        let page = page.to_mut_ptr::<GCAblob>();
        let id = push_page(g, page, BLOB_HUGE);
        unsafe { (*page).alloc = (std::mem::size_of::<GCAblob>() + sz) as u32 };
        // The current generic page must stay last so its in-place growth
        // check stays valid; swap the fresh huge page below it.
        let last = id as usize;
        g.gc.bloblist.swap(last - 1, last);
        g.gc.bloblist_usage.swap(last - 1, last);
        unsafe {
            (*g.gc.bloblist[last - 1]).id = (last - 1) as u32;
            (*g.gc.bloblist[last]).id = last as u32;
        }
        return Ok(Address::from_mut_ptr(page) + std::mem::size_of::<GCAblob>());
    }
    let mut page = g.gc.blob_generic;
    if unsafe { (*page).alloc } as usize + sz > ARENA_SIZE {
        page = new_generic_page(g)?;
    }
    let at = unsafe { (*page).alloc } as usize;
    unsafe { (*page).alloc = (at + sz) as u32 };
    Ok(Address::from_mut_ptr(page) + at)
}

/// Allocate a blob owned by a GC object.
pub fn newblob<VM: VMBinding>(g: &mut GlobalState<VM>, sz: usize) -> Result<Address, GcError> {
    g.gc.total += sz;
    newblob_g(g, sz)
}

/// Account for a dropped blob payload; the memory itself is reclaimed by
/// the next blob sweep once no live owner references it.
pub fn shrinkblob<VM: VMBinding>(g: &mut GlobalState<VM>, osz: usize) {
    g.gc.total = g.gc.total.saturating_sub(osz);
}

/// Grow or shrink a blob payload. Shrinking is free; growing extends in
/// place when `p` is the most recent allocation of the current page,
/// reallocates the dedicated page for huge blobs, and copies otherwise.
pub fn reallocblob<VM: VMBinding>(
    g: &mut GlobalState<VM>,
    p: Address,
    osz: usize,
    nsz: usize,
) -> Result<Address, GcError> {
    g.gc.total = g.gc.total.saturating_sub(osz) + nsz;
    if osz == 0 {
        return newblob_g(g, nsz);
    }
    let osz = (osz + 15) & !15;
    let nsz = (nsz + 15) & !15;
    if nsz <= osz {
        return Ok(if nsz == 0 { Address::ZERO } else { p });
    }
    let generic = g.gc.blob_generic;
    let cur_end = Address::from_mut_ptr(generic) + unsafe { (*generic).alloc } as usize;
    if cur_end - osz == p {
        let d = nsz - osz;
        if unsafe { (*generic).alloc } as usize + d <= ARENA_SIZE {
            unsafe { (*generic).alloc += d as u32 };
            return Ok(p);
        }
    }
    let a = blob_of(p);
    if unsafe { (*a).flags } & BLOB_HUGE != 0 {
        let hdr = std::mem::size_of::<GCAblob>();
        let newp = g
            .pages
            .realloc_huge(Address::from_mut_ptr(a), osz + hdr, nsz + hdr);
        if newp.is_zero() {
            return Err(GcError::OutOfMemory);
        }
        let newp = newp.to_mut_ptr::<GCAblob>();
        unsafe {
            g.gc.bloblist[(*newp).id as usize] = newp;
            (*newp).alloc = (hdr + nsz) as u32;
        }
        return Ok(Address::from_mut_ptr(newp) + hdr);
    }
    let r = newblob_g(g, nsz)?;
    unsafe { std::ptr::copy_nonoverlapping::<u8>(p.to_ptr(), r.to_mut_ptr(), osz) };
    Ok(r)
}

/// Copy a payload out of a reap-tagged page into a fresh blob, crediting
/// the new page's usage. Returns `None` (leaving the payload in place)
/// if the region is exhausted; the old page then simply survives.
pub fn move_blob<VM: VMBinding>(
    g: &mut GlobalState<VM>,
    src: Address,
    sz: usize,
) -> Option<Address> {
    let newp = match newblob_g(g, sz) {
        Ok(p) => p,
        Err(_) => return None,
    };
    let id = unsafe { (*blob_of(newp)).id } as usize;
    g.gc.bloblist_usage[id] += sz as u32;
    unsafe { std::ptr::copy_nonoverlapping::<u8>(src.to_ptr(), newp.to_mut_ptr(), sz) };
    trace!("moved blob payload {} -> {} ({} bytes)", src, newp, sz);
    Some(newp)
}

/// Credit a visited payload to its page, or move it out of a reap page.
/// The caller's reference is updated in place on a move.
pub fn mark_blob<VM: VMBinding>(g: &mut GlobalState<VM>, bref: &mut Address, sz: usize) {
    if sz == 0 {
        return;
    }
    let a = blob_of(*bref);
    let flags = unsafe { (*a).flags };
    if flags & BLOB_REAP != 0 && g.jit_base.is_zero() {
        if let Some(newp) = move_blob(g, *bref, sz) {
            *bref = newp;
            return;
        }
    }
    g.gc.bloblist_usage[unsafe { (*a).id } as usize] += sz as u32;
}

/// Post-mark blob sweep: free pages nothing used, tag low-usage pages for
/// compaction during the next mark.
pub fn sweep_blobs<VM: VMBinding>(g: &mut GlobalState<VM>) {
    let minor = g.gc.minor;
    let mut i = g.gc.bloblist_sweep;
    while i >= 0 {
        let idx = i as usize;
        let a = g.gc.bloblist[idx];
        debug_assert_eq!(unsafe { (*a).id } as usize, idx, "id invariant violated");
        let usage = g.gc.bloblist_usage[idx];
        if usage == 0 && a != g.gc.blob_generic {
            g.gc.bloblist.swap_remove(idx);
            g.gc.bloblist_usage.swap_remove(idx);
            if idx < g.gc.bloblist.len() {
                unsafe { (*g.gc.bloblist[idx]).id = idx as u32 };
            }
            let flags = unsafe { (*a).flags };
            if flags & BLOB_HUGE != 0 {
                let bytes = unsafe { (*a).alloc } as usize;
                g.pages.free_huge(Address::from_mut_ptr(a), bytes);
            } else {
                g.pages.free(Address::from_mut_ptr(a));
            }
            trace!("released blob page {}", idx);
        } else {
            if (usage as usize) < BLOB_REAP_THRESHOLD && a != g.gc.blob_generic {
                unsafe { (*a).flags |= BLOB_REAP };
            }
            if !minor {
                g.gc.bloblist_usage[idx] = 0;
            }
        }
        i -= 1;
    }
}

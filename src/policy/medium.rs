//! Medium strings: variable-size allocations inside string arenas,
//! carved from an intrusive freelist of 16-byte blocks.
//!
//! Bitmap semantics differ from the fixed-slot arenas: a `mark` bit on a
//! block means "begins a free run", a `free` bit means "holds a live
//! string"; both clear is a run extent. The freelist is threaded through
//! the free runs themselves and rebuilt by the sweep.

use std::mem;

use crate::global::GlobalState;
use crate::object::{GCstr, GcKind};
use crate::policy::arena::*;
use crate::strtab::clear_strtab;
use crate::util::constants::*;
use crate::util::simd::tzcount64;
use crate::util::Address;
use crate::vm::VMBinding;
use crate::GcError;

/// Blocks needed for a string of `len` bytes: header block plus payload
/// rounded up, with the terminating NUL.
pub fn med_blocks(len: usize) -> u32 {
    (len >> 4) as u32 + 2
}

fn arena_base(a: *mut GCAstr) -> Address {
    Address::from_mut_ptr(a)
}

/// Fresh medium-string arena with one maximal free run.
pub fn new_med_arena<VM: VMBinding>(g: &mut GlobalState<VM>) -> Result<*mut GCAstr, GcError> {
    let page = g.pages.alloc();
    if page.is_zero() {
        return Err(GcError::OutOfMemory);
    }
    let a = page.to_mut_ptr::<GCAstr>();
    unsafe {
        // Zero the header plus the first block so stale object bytes
        // cannot masquerade as a free-run header.
        std::ptr::write_bytes(
            page.to_mut_ptr::<u8>(),
            0,
            mem::size_of::<GCAstr>() + mem::size_of::<FreeBlock>(),
        );
        (*a).hdr.obj_type = GcKind::Str as u8;
        (*a).hdr.flags = g.gc.currentsweep;
        (*a).free_start = mem::size_of::<GCAstr>() as u32;
        let first = STR_MED_LAYOUT.occupied;
        (*a).mark.set(first);
        let b = (page + mem::size_of::<GCAstr>()).to_mut_ptr::<FreeBlock>();
        (*b).size = ((ARENA_SIZE - mem::size_of::<GCAstr>()) >> 4) as u32;
        (*b).next = 0;
        list_link(&mut g.gc.str_med.head, a as *mut ArenaHdr);
    }
    trace!("fresh medium string arena {:?}", a);
    Ok(a)
}

/// Take an allocation arena from the freelist (sweeping it first when
/// its parity is stale), or map a fresh one.
fn take_free_arena<VM: VMBinding>(g: &mut GlobalState<VM>) -> Result<*mut GCAstr, GcError> {
    if g.gc.str_med.free.is_null() {
        return new_med_arena(g);
    }
    let current = g.gc.currentsweep;
    let list = &mut g.gc.str_med;
    let a = unsafe { relink(&mut list.free, &mut list.head) };
    unsafe {
        debug_assert!((*a).flags & ARENA_ON_FREE_LIST != 0, "freelist arena unflagged");
        if (*a).flags & current == 0 {
            if g.gc.sweep == a {
                g.gc.sweep = (*a).next;
            }
            crate::sweep::sweep_one_med(g, a as *mut GCAstr);
        }
        (*a).flags &= !ARENA_ON_FREE_LIST;
        debug_assert!((*(a as *mut GCAstr)).free_start != 0, "no free data");
    }
    Ok(a as *mut GCAstr)
}

/// Allocate a medium string of `len` bytes, first-fit over the arena
/// freelists; gives up on reuse after a few arenas and maps a fresh one.
pub fn allocstr_med<VM: VMBinding>(
    g: &mut GlobalState<VM>,
    len: usize,
) -> Result<*mut GCstr, GcError> {
    let n = med_blocks(len);
    let mut a = g.gc.str_med.head as *mut GCAstr;
    if unsafe { (*a).free_start } == 0 {
        a = take_free_arena(g)?;
    }
    let mut at = arena_base(a) + unsafe { (*a).free_start } as usize;
    let mut prev: *mut FreeBlock = std::ptr::null_mut();
    // Arenas to try before concluding the freelists are just fragmented.
    let mut budget = 3u32;
    loop {
        let f = at.to_mut_ptr::<FreeBlock>();
        unsafe {
            if (*f).size >= n {
                (*a).in_use += n << 4;
                g.gc.total += (n as usize) << 4;
                g.gc.strings += (n as usize) << 4;
                if (*f).size != n {
                    // Carve the string from the run's tail.
                    (*f).size -= n;
                    at = at + (((*f).size as usize) << 4);
                    let idx = ((at - arena_base(a)) >> 4) as u32;
                    (*a).free.set(idx);
                    return Ok(at.to_mut_ptr());
                }
                // Exact fit: unlink the run.
                if !prev.is_null() {
                    (*prev).next = (*f).next;
                } else {
                    (*a).free_start = (*f).next;
                }
                let idx = ((at - arena_base(a)) >> 4) as u32;
                (*a).mark.clear(idx);
                (*a).free.set(idx);
                return Ok(at.to_mut_ptr());
            }
            if (*f).next == 0 {
                budget -= 1;
                a = if budget == 0 {
                    new_med_arena(g)?
                } else {
                    take_free_arena(g)?
                };
                at = arena_base(a) + (*a).free_start as usize;
                prev = std::ptr::null_mut();
            } else {
                at = arena_base(a) + (*f).next as usize;
                prev = f;
            }
        }
    }
}

/// Rescan a swept arena: aggregate adjacent free blocks, thread them
/// back onto the freelist in address order, clear the interning entries
/// of newly freed strings and recompute `in_use`.
///
/// The arena consists of free runs (`mark & !free`), newly freed strings
/// (same bit state, not yet on the freelist), live strings
/// (`free & !mark`) and extents (neither). The existing freelist is
/// chained in order, so a free block is "newly freed" exactly when it is
/// not the next expected freelist entry.
pub fn aggregate_str_freelist<VM: VMBinding>(g: &mut GlobalState<VM>, a: *mut GCAstr) {
    unsafe {
        let base = arena_base(a);
        let mut pnext: *mut u32 = &mut (*a).free_start;
        let mut prev: *mut FreeBlock = std::ptr::null_mut();
        let mut walk_at = (*a).free_start;
        let mut end = 0u32;
        (*a).in_use = (ARENA_SIZE - mem::size_of::<GCAstr>()) as u32;

        for i in 1..BITMAP_WORDS {
            let mut run = !(*a).free[i] & (*a).mark[i];
            while run != 0 {
                let j = tzcount64(run);
                run &= run - 1;
                let at = ((i as u32) << 10) | (j << 4);
                let b = (base + at as usize).to_mut_ptr::<FreeBlock>();
                if at == walk_at {
                    walk_at = (*b).next;
                    if at == end {
                        // Expected entry adjacent to the previous run:
                        // coalesce and turn it into an extent.
                        (*prev).size += (*b).size;
                        end += (*b).size << 4;
                        (*a).mark[i] ^= abit(j);
                        continue;
                    }
                } else {
                    // A newly freed string.
                    let s = b as *mut GCstr;
                    let len = med_blocks((*s).len as usize);
                    clear_strtab(g, (*s).hid);
                    if at == end {
                        (*prev).size += len;
                        end += len << 4;
                        (*a).mark[i] ^= abit(j);
                        continue;
                    }
                    (*b).size = len;
                }
                *pnext = at;
                pnext = &mut (*b).next;
                prev = b;
                end = at + ((*b).size << 4);
                (*a).in_use -= (*b).size << 4;
            }
        }
        *pnext = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::med_blocks;

    #[test]
    fn block_counts() {
        // Header block + payload blocks incl. the NUL.
        assert_eq!(med_blocks(16), 3);
        assert_eq!(med_blocks(31), 3);
        assert_eq!(med_blocks(32), 4);
        assert_eq!(med_blocks(100), 8);
    }
}

//! Raw memory: the page provider consumed by the arena layer and the
//! pluggable allocator callback for non-GC memory.

use crate::util::constants::{ARENA_OMASK, ARENA_SIZE};
use crate::util::Address;

/// Provider of arena-sized, arena-aligned pages plus huge allocations.
///
/// `alloc` returns `Address::ZERO` on exhaustion; callers surface that as
/// [`crate::GcError::OutOfMemory`]. Huge allocations are also
/// arena-aligned so that interior pointers within the first arena-sized
/// window can be masked back to the page header.
pub trait PageProvider {
    fn alloc(&mut self) -> Address;
    fn alloc_huge(&mut self, bytes: usize) -> Address;
    fn free(&mut self, page: Address);
    fn free_huge(&mut self, page: Address, bytes: usize);
    fn realloc_huge(&mut self, page: Address, osz: usize, nsz: usize) -> Address;
}

/// The allocator callback for non-GC memory (userdata buffers, thread
/// stacks, growable vectors). Semantics follow the classic realloc
/// contract: `ptr == ZERO` allocates, `nsz == 0` frees, both nonzero
/// reallocates. Returns `Address::ZERO` only for a failed nonzero
/// request.
pub trait RawAlloc {
    fn raw_alloc(&mut self, ptr: Address, osz: usize, nsz: usize) -> Address;
}

const RAW_ALIGN: usize = 16;

/// Default raw allocator over the Rust global allocator.
#[derive(Default)]
pub struct SysAlloc;

impl RawAlloc for SysAlloc {
    fn raw_alloc(&mut self, ptr: Address, osz: usize, nsz: usize) -> Address {
        use std::alloc::{alloc_zeroed, dealloc, realloc, Layout};
        unsafe {
            if ptr.is_zero() {
                if nsz == 0 {
                    return Address::ZERO;
                }
                let layout = Layout::from_size_align_unchecked(nsz, RAW_ALIGN);
                Address::from_mut_ptr(alloc_zeroed(layout))
            } else if nsz == 0 {
                let layout = Layout::from_size_align_unchecked(osz, RAW_ALIGN);
                dealloc(ptr.to_mut_ptr(), layout);
                Address::ZERO
            } else {
                let layout = Layout::from_size_align_unchecked(osz, RAW_ALIGN);
                let p = realloc(ptr.to_mut_ptr(), layout, nsz);
                if !p.is_null() && nsz > osz {
                    // Keep the grown tail zeroed; object vectors rely on it.
                    std::ptr::write_bytes(p.add(osz), 0, nsz - osz);
                }
                Address::from_mut_ptr(p)
            }
        }
    }
}

/// Default page provider over mmap. Requests are over-mapped by one arena
/// and trimmed so the surviving mapping is arena-aligned.
#[derive(Default)]
pub struct SysPages;

fn mmap_aligned(bytes: usize) -> Address {
    let req = bytes + ARENA_SIZE;
    let raw = unsafe {
        libc::mmap(
            std::ptr::null_mut(),
            req,
            libc::PROT_READ | libc::PROT_WRITE,
            libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
            -1,
            0,
        )
    };
    if raw == libc::MAP_FAILED {
        return Address::ZERO;
    }
    let base = Address::from_mut_ptr(raw);
    let aligned = unsafe { Address::from_usize((base.as_usize() + ARENA_OMASK) & !ARENA_OMASK) };
    let head = aligned - base;
    if head > 0 {
        unsafe { libc::munmap(base.to_mut_ptr(), head) };
    }
    let tail = ARENA_SIZE - head;
    if tail > 0 {
        unsafe { libc::munmap((aligned + bytes).to_mut_ptr(), tail) };
    }
    aligned
}

fn huge_size(bytes: usize) -> usize {
    // Round to the page size; the kernel would anyway.
    let page = 4096;
    (bytes + page - 1) & !(page - 1)
}

impl PageProvider for SysPages {
    fn alloc(&mut self) -> Address {
        mmap_aligned(ARENA_SIZE)
    }

    fn alloc_huge(&mut self, bytes: usize) -> Address {
        mmap_aligned(huge_size(bytes))
    }

    fn free(&mut self, page: Address) {
        debug_assert!(page.is_aligned_to(ARENA_SIZE));
        unsafe { libc::munmap(page.to_mut_ptr(), ARENA_SIZE) };
    }

    fn free_huge(&mut self, page: Address, bytes: usize) {
        debug_assert!(page.is_aligned_to(ARENA_SIZE));
        unsafe { libc::munmap(page.to_mut_ptr(), huge_size(bytes)) };
    }

    fn realloc_huge(&mut self, page: Address, osz: usize, nsz: usize) -> Address {
        let newp = self.alloc_huge(nsz);
        if newp.is_zero() {
            return Address::ZERO;
        }
        unsafe {
            std::ptr::copy_nonoverlapping::<u8>(
                page.to_ptr(),
                newp.to_mut_ptr(),
                osz.min(nsz),
            );
        }
        self.free_huge(page, osz);
        newp
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pages_are_arena_aligned() {
        let mut p = SysPages;
        let a = p.alloc();
        assert!(!a.is_zero());
        assert!(a.is_aligned_to(ARENA_SIZE));
        unsafe { a.store::<u64>(0xDEAD) };
        p.free(a);

        let h = p.alloc_huge(3 * ARENA_SIZE + 17);
        assert!(h.is_aligned_to(ARENA_SIZE));
        p.free_huge(h, 3 * ARENA_SIZE + 17);
    }

    #[test]
    fn raw_alloc_roundtrip() {
        let mut a = SysAlloc;
        let p = a.raw_alloc(Address::ZERO, 0, 64);
        assert!(!p.is_zero());
        unsafe { p.store::<u64>(7) };
        let q = a.raw_alloc(p, 64, 128);
        assert_eq!(unsafe { q.load::<u64>() }, 7);
        assert_eq!(unsafe { (q + 64usize).load::<u64>() }, 0);
        assert!(a.raw_alloc(q, 128, 0).is_zero());
    }
}

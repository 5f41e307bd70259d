//! Huge strings: one dedicated page per string, chained through the
//! header's `gray` link. Only the leading words of `mark` exist on these
//! pages; `free_h` holds the total allocation size and `free_start`
//! doubles as the immortal flag.

use memoffset::offset_of;
use std::mem;

use crate::global::GlobalState;
use crate::object::{GCstr, GcKind};
use crate::policy::arena::GCAstr;
use crate::util::Address;
use crate::vm::VMBinding;
use crate::GcError;

/// Bytes of a huge-string page: header through `mark[2]`, the string
/// header, the payload and its NUL.
pub fn huge_str_size(len: usize) -> usize {
    offset_of!(GCAstr, mark) + 2 * mem::size_of::<u64>() + mem::size_of::<GCstr>() + len + 1
}

/// The string object of a huge page.
pub fn huge_str_obj(a: *mut GCAstr) -> *mut GCstr {
    (Address::from_mut_ptr(a) + offset_of!(GCAstr, mark) + 2 * mem::size_of::<u64>()).to_mut_ptr()
}

/// Allocate a huge string of `len` bytes and chain its page.
pub fn allocstr_huge<VM: VMBinding>(
    g: &mut GlobalState<VM>,
    len: usize,
) -> Result<*mut GCstr, GcError> {
    let size = huge_str_size(len);
    let page = g.pages.alloc_huge(size);
    if page.is_zero() {
        return Err(GcError::OutOfMemory);
    }
    let a = page.to_mut_ptr::<GCAstr>();
    unsafe {
        (*a).hdr.obj_type = GcKind::Str as u8;
        (*a).hdr.flags = g.gc.currentsweep;
        (*a).hdr.gray = g.gc.str_huge;
        g.gc.str_huge = a as *mut crate::policy::arena::ArenaHdr;
        (*a).free_h = size as u64;
        (*a).in_use = 0;
        (*a).free_start = 0;
        (*a).mark[0] = 0;
        (*a).mark[1] = 0;
    }
    g.gc.total += size;
    g.gc.strings += size;
    trace!("huge string page {:?} ({} bytes)", a, size);
    Ok(huge_str_obj(a))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn string_lands_in_mark_word_zero() {
        // Marking a huge string sets a bit at slot offset/16; the page
        // only materializes the first two mark words, so the slot index
        // must stay below 128.
        let off = offset_of!(GCAstr, mark) + 2 * mem::size_of::<u64>();
        assert!(off % 16 == 0);
        assert!(off / 16 < 128);
        assert_eq!(huge_str_size(0), off + mem::size_of::<GCstr>() + 1);
    }
}

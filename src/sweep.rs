//! Sweep engine: vectorized per-arena bitmap sweeps producing fresh
//! `free` bitmaps from `mark`, arena release and freelist scheduling,
//! kind-specific post-sweep work, the root-list sweep for raw-allocated
//! kinds, and terminal teardown.
//!
//! All bitmap loops are written once against [`SimdOps`] and instantiated
//! with the widest backing the target offers.

use std::mem;

use crate::global::{ArenaKind, GlobalState};
use crate::object::*;
use crate::policy::arena::*;
use crate::policy::{alloc, huge, medium};
use crate::strtab::clear_strtab;
use crate::util::constants::*;
use crate::util::simd::{popcount64, reset_lowest64, tzcount64, DefaultSimd, SimdOps};
use crate::util::Address;
use crate::vm::VMBinding;

fn check_not_gray<VM: VMBinding>(g: &GlobalState<VM>, a: *mut ArenaHdr) -> bool {
    let mut h = g.gc.gray_head;
    while !h.is_null() {
        if h == a {
            return false;
        }
        h = unsafe { (*h).gray };
    }
    true
}

/// Core bitmap transform: `free = !mark` (raw), `mark = 0` unless kept
/// for a minor cycle. Returns the raw free-word summary and whether any
/// mark bit was set.
unsafe fn sweep_bitmaps<S: SimdOps>(a: *mut GCAcommon, words: usize, clear_mark: bool) -> (u64, bool) {
    let zero = S::zero();
    let ones = S::ones();
    let mut any = S::zero();
    let mut freew = !0u64;
    let mut w = 0;
    while w < words {
        let v = S::loada((*a).mark.word_ptr(w));
        any = any.or(v);
        if clear_mark {
            zero.storea((*a).mark.word_mut_ptr(w));
        }
        let f = v.xor(ones);
        f.storea((*a).free.word_mut_ptr(w));
        freew ^= f.eq64_mask(zero) << w;
        w += S::LANES;
    }
    (freew, !any.all_zero())
}

unsafe fn toggle_parity<VM: VMBinding>(g: &GlobalState<VM>, a: *mut ArenaHdr) {
    debug_assert!((*a).flags & ARENA_SWEEPS != ARENA_SWEEPS, "both sweep bits set");
    debug_assert!((*a).flags & g.gc.currentsweep == 0, "sweeping swept arena");
    (*a).flags ^= ARENA_SWEEPS;
}

/// Release an empty arena or schedule one with fresh holes; shared tail
/// of every bitmap sweep. Returns true when the arena was released.
unsafe fn finish_bitmap_arena<VM: VMBinding>(
    g: &mut GlobalState<VM>,
    ak: ArenaKind,
    a: *mut GCAcommon,
    freew: u64,
    any_live: bool,
) -> bool {
    let hdr = a as *mut ArenaHdr;
    let list = g.gc.list(ak);
    if list.head != hdr {
        if !any_live {
            debug_assert!(check_not_gray(g, hdr), "arena in gray list while being freed");
            let list = g.gc.list(ak);
            free_unlink(&mut list.free, hdr);
            list_unlink(list.head, hdr);
            g.pages.free(Address::from_mut_ptr(hdr));
            trace!("released empty {:?} arena {:?}", ak, hdr);
            return true;
        }
        if freew != 0 && (*a).free_h == 0 {
            free_enq(&mut g.gc.list(ak).free, hdr);
        }
    }
    (*a).free_h = freew;
    false
}

unsafe fn sweep_plain_arena<VM: VMBinding>(g: &mut GlobalState<VM>, ak: ArenaKind, a: *mut GCAcommon) {
    toggle_parity(g, a as *mut ArenaHdr);
    let layout = alloc::layout_of(ak);
    let words = round_up_words(layout.words);
    let (mut freew, any) = sweep_bitmaps::<DefaultSimd>(a, words, !g.gc.minor);
    layout.fixup_free(&mut (*a).free, &mut freew);
    finish_bitmap_arena(g, ak, a, freew, any);
}

/// Finalizer-table arenas additionally keep `fin` only for survivors:
/// `fin &= mark` before the mark bits are consumed.
unsafe fn sweep_fintab_arena<VM: VMBinding>(g: &mut GlobalState<VM>, a: *mut GCAtab) {
    toggle_parity(g, a as *mut ArenaHdr);
    let layout = TAB_LAYOUT;
    let words = round_up_words(layout.words);
    let c = &mut (*a).a;
    let mut w = 0;
    while w < words {
        let m = DefaultSimd::loada(c.mark.word_ptr(w));
        let f = DefaultSimd::loada((*a).fin.word_ptr(w));
        f.and(m).storea((*a).fin.word_mut_ptr(w));
        w += DefaultSimd::LANES;
    }
    let (mut freew, any) = sweep_bitmaps::<DefaultSimd>(c, words, !g.gc.minor);
    layout.fixup_free(&mut c.free, &mut freew);
    finish_bitmap_arena(g, ArenaKind::FinTab, a as *mut GCAcommon, freew, any);
}

unsafe fn sweep_udata_obj<VM: VMBinding>(g: &mut GlobalState<VM>, a: *mut GCAudata, w: usize, f: u64) {
    let mut f = f;
    while f != 0 {
        let j = tzcount64(f);
        f = reset_lowest64(f);
        let ud = slot_addr(a as *mut ArenaHdr, UDATA_LAYOUT, (w as u32) << 6 | j)
            .to_mut_ptr::<GCudata>();
        if (*ud).gcflags & GC_SIZE_BITS != 0 {
            // Merged allocation: the payload lives in the following
            // slots, which carry no headers of their own. Consume their
            // bits so they are not misread as objects.
            for k in 1..flags2size((*ud).gcflags) as u32 {
                f &= !abit(j + k);
            }
            continue;
        }
        if (*ud).len > 0 && !(*ud).payload.is_zero() {
            g.gc.malloc = g.gc.malloc.saturating_sub((*ud).len as usize);
            let r = g
                .allocf
                .raw_alloc((*ud).payload, (*ud).len as usize, 0);
            debug_assert!(r.is_zero());
            (*ud).payload = Address::ZERO;
        }
    }
}

/// Userdata sweep is scalar: newly freed slots need per-object teardown
/// of raw-allocated buffers.
unsafe fn sweep_udata_arena<VM: VMBinding>(g: &mut GlobalState<VM>, a: *mut GCAudata) {
    toggle_parity(g, a as *mut ArenaHdr);
    let layout = UDATA_LAYOUT;
    let clear = !g.gc.minor;
    let mut any = 0u64;
    let mut freew = 0u64;
    for w in 0..layout.words {
        let m = (*a).a.mark[w];
        any |= m;
        let f = !m & !(*a).a.free[w] & layout.free_word_init(w);
        sweep_udata_obj(g, a, w, f);
        (*a).a.free[w] |= f;
        if clear {
            (*a).a.mark[w] = 0;
        }
        (*a).fin[w] &= m;
        (*a).fin_req[w] &= m;
        if f != 0 {
            freew |= abit(w as u32);
        }
    }
    let hdr = a as *mut ArenaHdr;
    let list = &mut g.gc.udata;
    if list.head != hdr {
        if any == 0 {
            debug_assert!(check_not_gray(g, hdr), "arena in gray list while being freed");
            let list = &mut g.gc.udata;
            free_unlink(&mut list.free, hdr);
            list_unlink(list.head, hdr);
            g.pages.free(Address::from_mut_ptr(hdr));
            return;
        }
        if freew != 0 && (*a).a.free_h == 0 {
            free_enq(&mut g.gc.udata.free, hdr);
        }
    }
    (*a).a.free_h |= freew;
    // Words with fresh holes may hold merged runs again.
    (*a).free4_h |= freew;
}

unsafe fn clean_str_small<VM: VMBinding>(g: &mut GlobalState<VM>, a: *mut GCAstr, newly: &[u64]) {
    for (w, &bits) in newly.iter().enumerate() {
        let mut bits = bits;
        while bits != 0 {
            let j = tzcount64(bits);
            bits = reset_lowest64(bits);
            let s = (Address::from_mut_ptr(a) + (((w as u32) << 6 | j) as usize) * 16)
                .to_ptr::<GCstr>();
            clear_strtab(g, (*s).hid);
        }
    }
}

/// Small-string sweep: live = `mark | fixed` on the even bits; newly
/// freed slots have their interning entries cleared eagerly; dirty
/// arenas recover their dead count by popcount.
unsafe fn sweep_str_small_arena<VM: VMBinding>(g: &mut GlobalState<VM>, a: *mut GCAstr) {
    toggle_parity(g, a as *mut ArenaHdr);
    let layout = STR_SMALL_LAYOUT;
    let clear = !g.gc.minor;
    let mut count = 0usize;
    let mut any = 0u64;
    let mut freew = 0u64;
    let mut newly = [0u64; BITMAP_WORDS];
    for w in 0..layout.words {
        let m = (*a).mark[w];
        let x = (*a).fixed[w];
        count += popcount64(m) as usize;
        let live = m | x;
        any |= live;
        if clear {
            (*a).mark[w] = 0;
        }
        let newfree = !live & layout.free_word_init(w);
        newly[w] = newfree & !(*a).free[w];
        (*a).free[w] = newfree;
        if newfree != 0 {
            freew |= abit(w as u32);
        }
    }
    g.str.num_small += count;
    if (*a).hdr.flags & ARENA_SWEEP_DIRTY != 0 {
        let capacity = (layout.max - layout.occupied) as usize / 2;
        g.str.num_dead += capacity - count;
        (*a).hdr.flags &= !ARENA_SWEEP_DIRTY;
    }
    clean_str_small(g, a, &newly);
    let hdr = a as *mut ArenaHdr;
    let list = &mut g.gc.str_small;
    if list.head != hdr {
        if any == 0 {
            debug_assert!(check_not_gray(g, hdr), "arena in gray list while being freed");
            let list = &mut g.gc.str_small;
            free_unlink(&mut list.free, hdr);
            list_unlink(list.head, hdr);
            g.pages.free(Address::from_mut_ptr(hdr));
            return;
        }
        if freew != 0 && (*a).free_h == 0 {
            free_enq(&mut g.gc.str_small.free, hdr);
        }
    }
    (*a).free_h = freew;
}

/// Medium-string sweep: collapse `(fixed, free, mark)` per the truth
/// table, then rebuild the freelist when anything was freed.
///
/// ```text
/// (fixed, free, mark) -> (free', mark')
/// 111 -> 10   110 -> 10   011 -> 10
/// 010 -> 01   001 -> 01   000 -> 00
/// 10* -> invalid
/// free' = (free & mark) | fixed
/// mark' = (free ^ mark) & !fixed
/// ```
unsafe fn sweep_str_med_arena<VM: VMBinding>(g: &mut GlobalState<VM>, a: *mut GCAstr) {
    toggle_parity(g, a as *mut ArenaHdr);
    let mut any = 0u64;
    let mut newly_freed = 0u64;
    for w in 0..BITMAP_WORDS {
        let m = (*a).mark[w];
        let f = (*a).fixed[w];
        let b = (*a).free[w];
        debug_assert_eq!(f & !b, 0, "fixed block outside a live string");
        let live = (b & m) | f;
        any |= live;
        (*a).free[w] = live;
        newly_freed |= b & !live;
        (*a).mark[w] = (b ^ m) & !f;
    }
    let mut entered_freelist = false;
    if newly_freed != 0 {
        // Newly freed strings must leave the interning table even when
        // the whole arena dies right after.
        entered_freelist = (*a).hdr.flags & ARENA_ON_FREE_LIST == 0;
        (*a).hdr.flags |= ARENA_ON_FREE_LIST;
        medium::aggregate_str_freelist(g, a);
    }
    let hdr = a as *mut ArenaHdr;
    let list = &mut g.gc.str_med;
    if list.head != hdr {
        if any == 0 {
            debug_assert!(check_not_gray(g, hdr), "arena in gray list while being freed");
            let list = &mut g.gc.str_med;
            free_unlink(&mut list.free, hdr);
            list_unlink(list.head, hdr);
            g.pages.free(Address::from_mut_ptr(hdr));
            return;
        }
        if entered_freelist {
            free_enq(&mut g.gc.str_med.free, hdr);
        }
    }
    g.gc.strings += (*a).in_use as usize;
}

/// Sweep a single arena out of band (allocator refill path).
pub fn sweep_one_bitmap<VM: VMBinding>(g: &mut GlobalState<VM>, ak: ArenaKind, a: *mut ArenaHdr) {
    unsafe {
        match ak {
            ArenaKind::Tab | ArenaKind::Func | ArenaKind::Uv => {
                sweep_plain_arena(g, ak, a as *mut GCAcommon)
            }
            ArenaKind::FinTab => sweep_fintab_arena(g, a as *mut GCAtab),
            ArenaKind::Udata => sweep_udata_arena(g, a as *mut GCAudata),
            ArenaKind::StrSmall => sweep_str_small_arena(g, a as *mut GCAstr),
            ArenaKind::StrMed => sweep_str_med_arena(g, a as *mut GCAstr),
        }
    }
}

/// Sweep a single medium-string arena (freelist take path).
pub fn sweep_one_med<VM: VMBinding>(g: &mut GlobalState<VM>, a: *mut GCAstr) {
    unsafe { sweep_str_med_arena(g, a) }
}

/// Sweep up to `lim` arenas starting at `a`; returns the next cursor.
pub fn sweep_arenas<VM: VMBinding>(
    g: &mut GlobalState<VM>,
    ak: ArenaKind,
    mut a: *mut ArenaHdr,
    mut lim: u32,
) -> *mut ArenaHdr {
    while !a.is_null() && lim > 0 {
        let next = unsafe { (*a).next };
        sweep_one_bitmap(g, ak, a);
        a = next;
        lim -= 1;
    }
    a
}

/// Skip arenas already swept to the current parity.
pub fn find_unswept<VM: VMBinding>(g: &GlobalState<VM>, mut a: *mut ArenaHdr) -> *mut ArenaHdr {
    unsafe {
        while !a.is_null() && (*a).flags & ARENA_SWEEPS == g.gc.currentsweep {
            a = (*a).next;
        }
    }
    a
}

// -- Huge strings ----------------------------------------------------------

/// Sweep up to `count` huge strings; returns true when the chain is
/// exhausted.
pub fn sweep_hugestrings<VM: VMBinding>(g: &mut GlobalState<VM>, count: u32) -> bool {
    let mut prev = g.gc.sweep_huge_prev;
    let mut a = if prev.is_null() {
        g.gc.str_huge
    } else {
        unsafe { (*prev).gray }
    };
    let mut budget = count;
    unsafe {
        while !a.is_null() {
            if budget == 0 {
                g.gc.sweep_huge_prev = prev;
                return false;
            }
            budget -= 1;
            let astr = a as *mut GCAstr;
            let next = (*a).gray;
            if (*astr).free_start != 0 || (*astr).mark[0] != 0 {
                (*astr).mark[0] = 0;
                g.gc.strings += (*astr).free_h as usize;
                prev = a;
            } else {
                let s = huge::huge_str_obj(astr);
                if prev.is_null() {
                    g.gc.str_huge = next;
                } else {
                    (*prev).gray = next;
                }
                clear_strtab(g, (*s).hid);
                let size = huge::huge_str_size((*s).len as usize);
                g.pages.free_huge(Address::from_mut_ptr(astr), size);
            }
            a = next;
        }
    }
    g.gc.sweep_huge_prev = std::ptr::null_mut();
    true
}

// -- Root-list sweep -------------------------------------------------------

fn free_list_obj<VM: VMBinding>(g: &mut GlobalState<VM>, o: GCRef) {
    unsafe {
        match o.gct() {
            GcKind::Thread => {
                let th = o.ptr::<GCthread>();
                // Close surviving open upvalues before the stack goes.
                let mut uv = (*th).openupval;
                while !uv.is_null() {
                    let u = uv.ptr::<GCupval>();
                    (*u).tv = (*u).v.load();
                    (*u).v = crate::util::Address::from_mut_ptr(std::ptr::addr_of_mut!((*u).tv));
                    (*u).closed = 1;
                    let next = (*u).next;
                    (*u).next = GCRef::NULL;
                    uv = next;
                }
                let bytes = GCthread::stack_bytes((*th).stacksize);
                g.mem_free((*th).stack, bytes);
                g.mem_free(o.addr(), mem::size_of::<GCthread>());
            }
            GcKind::Proto => {
                let pt = o.ptr::<GCproto>();
                g.mem_free(o.addr(), (*pt).sizept as usize);
            }
            GcKind::Trace => {
                let t = o.ptr::<GCtrace>();
                let no = (*t).traceno as usize;
                if no < g.traces.len() && g.traces[no] == o {
                    g.traces[no] = GCRef::NULL;
                }
                g.mem_free(o.addr(), GCtrace::alloc_size((*t).nk));
            }
            GcKind::Cdata => {
                let cd = o.ptr::<GCcdata>();
                g.mem_free(o.addr(), GCcdata::alloc_size((*cd).len));
            }
            k => unreachable!("bad list object kind {:?}", k),
        }
    }
}

/// Partial sweep of the root list: survivors turn white, dead objects
/// are unchained and freed. Returns true when the list is exhausted.
pub fn gc_sweep_list<VM: VMBinding>(g: &mut GlobalState<VM>, lim: u32) -> bool {
    let safe = g.gc.safecolor;
    let mut prev = g.gc.sweep_prev;
    for _ in 0..lim {
        let cur = if prev.is_null() {
            g.gc.root
        } else {
            unsafe { prev.as_ref::<GCoHdr>().nextgc }
        };
        if cur.is_null() {
            g.gc.sweep_prev = GCRef::NULL;
            return true;
        }
        if cur.gcflags() & safe != 0 {
            cur.make_white();
            prev = cur;
        } else {
            let next = unsafe { cur.as_ref::<GCoHdr>().nextgc };
            if prev.is_null() {
                g.gc.root = next;
            } else {
                unsafe { prev.as_mut::<GCoHdr>().nextgc = next };
            }
            free_list_obj(g, cur);
        }
    }
    g.gc.sweep_prev = prev;
    false
}

// -- Shutdown --------------------------------------------------------------

/// Free all remaining GC objects except super-fixed ones (the main
/// thread); userdata teardown still runs so raw buffers are returned.
pub fn gc_freeall<VM: VMBinding>(g: &mut GlobalState<VM>) {
    g.gc.safecolor = GC_SFIXED;
    g.gc.sweep_prev = GCRef::NULL;
    while !gc_sweep_list(g, u32::MAX) {}
    g.gc.total = g.gc.malloc;
    g.gc.currentsweep ^= ARENA_SWEEPS;
    let mut a = g.gc.udata.head;
    while !a.is_null() {
        let next = unsafe { (*a).next };
        unsafe {
            if (*a).flags & g.gc.currentsweep == 0 {
                let ud = a as *mut GCAudata;
                (*ud).a.mark = Bitmap::ZERO;
                sweep_udata_arena(g, ud);
            }
        }
        a = next;
    }
}

fn free_type_list<VM: VMBinding>(g: &mut GlobalState<VM>, ak: ArenaKind) {
    let mut a = g.gc.list(ak).head;
    while !a.is_null() {
        let next = unsafe { (*a).next };
        g.pages.free(Address::from_mut_ptr(a));
        a = next;
    }
    let list = g.gc.list(ak);
    list.head = std::ptr::null_mut();
    list.free = std::ptr::null_mut();
}

/// Terminal teardown used by `Drop`: run the shutdown sweep, then return
/// every page (arenas, huge strings, blobs, secondary string tables) and
/// the main thread itself.
pub fn free_everything<VM: VMBinding>(g: &mut GlobalState<VM>) {
    gc_freeall(g);
    for ak in [
        ArenaKind::Tab,
        ArenaKind::FinTab,
        ArenaKind::Func,
        ArenaKind::Uv,
        ArenaKind::Udata,
        ArenaKind::StrSmall,
        ArenaKind::StrMed,
    ] {
        free_type_list(g, ak);
    }
    let mut a = g.gc.str_huge;
    while !a.is_null() {
        unsafe {
            let next = (*a).gray;
            let s = huge::huge_str_obj(a as *mut GCAstr);
            g.pages
                .free_huge(Address::from_mut_ptr(a), huge::huge_str_size((*s).len as usize));
            a = next;
        }
    }
    g.gc.str_huge = std::ptr::null_mut();
    for page in std::mem::take(&mut g.gc.bloblist) {
        unsafe {
            if (*page).flags & BLOB_HUGE != 0 {
                g.pages
                    .free_huge(Address::from_mut_ptr(page), (*page).alloc as usize);
            } else {
                g.pages.free(Address::from_mut_ptr(page));
            }
        }
    }
    g.gc.bloblist_usage.clear();
    g.gc.blob_generic = std::ptr::null_mut();
    for slot in std::mem::take(&mut g.str.secondary_list) {
        if let crate::strtab::SecondarySlot::Arena(a) = slot {
            g.pages.free(Address::from_mut_ptr(a));
        }
    }
    if !g.mainthread.is_null() {
        let main = g.mainthread;
        free_list_obj(g, main);
        g.mainthread = GCRef::NULL;
        g.gc.root = GCRef::NULL;
    }
}

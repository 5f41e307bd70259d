//! Mark engine: tri-color marking over two gray-queue flavors (the
//! object-linked list for raw-allocated kinds and the per-arena gray
//! bitmaps chained on the arena-gray queue), traversal per kind, weak
//! table routing and the ephemeron fixpoint.

use std::mem;

use crate::global::{GcRoot, GlobalState};
use crate::object::tab::{tab_getstr, Node};
use crate::object::*;
use crate::policy::arena::*;
use crate::policy::blob;
use crate::util::constants::*;
use crate::util::simd::{reset_lowest64, tzcount64};
use crate::vm::VMBinding;

/// Weak-mode bit reported for the FFI finalizer table: traversed with
/// weak keys but never placed on the weak-clear lists.
pub const WEAK_FFI: u8 = 0x80;

fn mark_layout(k: GcKind) -> ArenaLayout {
    match k {
        GcKind::Str => STR_MED_LAYOUT,
        GcKind::Upval => UV_LAYOUT,
        GcKind::Func => FUNC_LAYOUT,
        GcKind::Tab => TAB_LAYOUT,
        GcKind::Udata => UDATA_LAYOUT,
        _ => unreachable!("not an arena kind"),
    }
}

/// Append an arena to the tail of the arena-gray queue.
fn gray_enq<VM: VMBinding>(g: &mut GlobalState<VM>, a: *mut ArenaHdr) {
    unsafe {
        (*a).gray = std::ptr::null_mut();
        if !g.gc.gray_head.is_null() {
            (*g.gc.gray_tail).gray = a;
        } else {
            g.gc.gray_head = a;
        }
        g.gc.gray_tail = a;
    }
}

/// Enqueue an arena whose gray bitmap was repopulated out of band
/// (finalizer presweep).
pub fn requeue_gray_arena<VM: VMBinding>(g: &mut GlobalState<VM>, a: *mut ArenaHdr) {
    debug_assert!(!std::ptr::eq(g.gc.gray_head, a));
    gray_enq(g, a);
}

/// Mark a string black directly: strings are leaves, so no gray pass is
/// needed and fixed strings can stay permanently gray-free.
pub fn gc_mark_str<VM: VMBinding>(g: &mut GlobalState<VM>, s: GCRef) {
    debug_assert_eq!(s.gct(), GcKind::Str);
    let a = arena_of(s.addr()) as *mut GCAstr;
    let idx = (s.addr() & ARENA_OMASK) as u32 >> 4;
    unsafe { (*a).mark.set(idx) };
    s.set_gcflags((s.gcflags() & !GC_BLACKS) | g.gc.currentblack);
}

/// Set mark+gray for an arena object and enqueue its arena when its
/// gray summary was empty.
fn mark_arena_obj<VM: VMBinding>(g: &mut GlobalState<VM>, o: GCRef, layout: ArenaLayout) {
    let a = arena_of(o.addr()) as *mut GCAcommon;
    let idx = layout.idx_of(o.addr());
    debug_assert!(idx >= layout.occupied && idx < layout.max, "bad obj pointer");
    let h = aidxh(idx);
    let bit = abit(aidxl(idx));
    unsafe {
        if (*a).mark[h] & bit == 0 {
            if (*a).gray_h == 0 {
                gray_enq(g, a as *mut ArenaHdr);
            }
            (*a).gray_h |= abit(h as u32);
            (*a).mark[h] |= bit;
            (*a).gray[h] |= bit;
        }
    }
}

/// Mark a table reference.
pub fn gc_mark_tab<VM: VMBinding>(g: &mut GlobalState<VM>, t: GCRef) {
    debug_assert_eq!(t.gct(), GcKind::Tab);
    mark_arena_obj(g, t, TAB_LAYOUT);
}

/// Mark an upvalue reference.
pub fn gc_mark_uv<VM: VMBinding>(g: &mut GlobalState<VM>, uv: GCRef) {
    debug_assert_eq!(uv.gct(), GcKind::Upval);
    mark_arena_obj(g, uv, UV_LAYOUT);
}

/// Mark dispatch over all kinds.
pub fn gc_mark_type<VM: VMBinding>(g: &mut GlobalState<VM>, o: GCRef, gct: GcKind) {
    debug_assert_eq!(o.gct(), gct, "GC type mismatch");
    if gct == GcKind::Str {
        gc_mark_str(g, o);
        return;
    }
    if gct.is_arena_kind() {
        mark_arena_obj(g, o, mark_layout(gct));
        return;
    }
    debug_assert!(g.gc.is_white(o), "mark of non-white object");
    debug_assert!(!g.checkdead(o), "mark of dead object");
    o.flags_or(GC_GRAY);
    if gct != GcKind::Cdata {
        debug_assert!(matches!(gct, GcKind::Thread | GcKind::Proto | GcKind::Trace));
        unsafe {
            o.as_mut::<GCoHdr>().gclist = g.gc.gray;
        }
        g.gc.gray = o;
    }
}

/// Mark an object if it is still white.
pub fn gc_markobj<VM: VMBinding>(g: &mut GlobalState<VM>, o: GCRef) {
    if g.gc.is_white(o) {
        gc_mark_type(g, o, o.gct());
    }
}

/// Mark the referent of a value slot, if collectible and white.
pub fn gc_marktv<VM: VMBinding>(g: &mut GlobalState<VM>, tv: TValue) {
    if let TValue::Gc(o) = tv {
        if g.gc.is_white(o) {
            gc_mark_type(g, o, o.gct());
        }
    }
}

/// Mark a trace by number if it is white.
pub fn gc_marktrace<VM: VMBinding>(g: &mut GlobalState<VM>, traceno: u32) {
    let o = g.traces[traceno as usize];
    debug_assert!(o != g.cur_trace, "active trace escaped");
    if !o.is_null() && g.gc.is_white(o) {
        o.flags_or(GC_GRAY);
        unsafe { o.as_mut::<GCoHdr>().gclist = g.gc.gray };
        g.gc.gray = o;
    }
}

/// Mark the fixed root set.
pub fn gc_mark_gcroot<VM: VMBinding>(g: &mut GlobalState<VM>) {
    for root in [
        GcRoot::MmMode,
        GcRoot::MmGc,
        GcRoot::FfiFin,
        GcRoot::BasemtStr,
        GcRoot::BasemtUdata,
    ] {
        let o = g.gcroot[root];
        if !o.is_null() {
            gc_markobj(g, o);
        }
    }
}

/// Start a cycle: seed the gray queues from the root set.
pub fn gc_mark_start<VM: VMBinding>(g: &mut GlobalState<VM>) {
    g.gc.gray = GCRef::NULL;
    g.gc.grayagain = GCRef::NULL;
    g.gc.grayagain_th = GCRef::NULL;
    g.gc.weak = GCRef::NULL;
    let main = g.mainthread;
    gc_markobj(g, main);
    let env = unsafe { main.as_ref::<GCthread>() }.env;
    if !env.is_null() {
        gc_mark_tab(g, env);
    }
    gc_marktv(g, g.registry);
    gc_mark_gcroot(g);
    g.gc.state = crate::global::GcPhase::Propagate;
    g.gc.accum = 0;
    debug!("mark phase started, total={}", g.gc.total);
}

// -- Traversal -------------------------------------------------------------

/// Count (or move) a table's hash-part blob and rewrite the intrusive
/// chain pointers after a move.
fn gc_mark_tab_hash<VM: VMBinding>(g: &mut GlobalState<VM>, t: *mut GCtab) {
    unsafe {
        if (*t).node.is_zero() {
            return;
        }
        let hmask = (*t).hmask;
        let size = (hmask as usize + 1) * mem::size_of::<Node>();
        let a = blob::blob_of((*t).node);
        if (*a).flags & BLOB_REAP != 0 && g.jit_base.is_zero() {
            if let Some(newp) = blob::move_blob(g, (*t).node, size) {
                let diff = newp.as_usize() as isize - (*t).node.as_usize() as isize;
                (*t).node = newp;
                for i in 0..=hmask {
                    let n = (*t).node_ptr(i);
                    if !(*n).next.is_zero() {
                        (*n).next = (*n).next + diff;
                    }
                }
                if !(*t).freetop.is_zero() {
                    (*t).freetop = (*t).freetop + diff;
                }
                return;
            }
        }
        g.gc.bloblist_usage[(*a).id as usize] += size as u32;
    }
}

/// Traverse a table; returns its weak-mode bits (possibly `WEAK_FFI`).
fn gc_traverse_tab<VM: VMBinding>(g: &mut GlobalState<VM>, t: *mut GCtab) -> u8 {
    let mut weak = 0u8;
    unsafe {
        let mt = (*t).metatable;
        if !mt.is_null() {
            gc_mark_tab(g, mt);
            let mode = g.gcroot[GcRoot::MmMode];
            if !mode.is_null() {
                if let Some(TValue::Gc(m)) = tab_getstr(mt.as_ref::<GCtab>(), mode) {
                    if m.gct() == GcKind::Str {
                        for &c in m.as_ref::<GCstr>().bytes() {
                            if c == b'k' {
                                weak |= GC_WEAKKEY;
                            } else if c == b'v' {
                                weak |= GC_WEAKVAL;
                            }
                        }
                    }
                }
            }
            if weak != 0 {
                if g.gcroot[GcRoot::FfiFin] == GCRef::from_ptr(t) {
                    // The finalizer table keeps its values strong and is
                    // cleared by the finalizer pipeline alone.
                    weak = WEAK_FFI | GC_WEAKKEY;
                } else {
                    (*t).gcflags = ((*t).gcflags & !GC_WEAK) | weak;
                }
            }
        }
        if (*t).gcflags & GC_SIZE_BITS == 0 && !(*t).array.is_zero() && (*t).asize > 0 {
            let sz = (*t).asize as usize * mem::size_of::<TValue>();
            let mut aref = (*t).array;
            blob::mark_blob(g, &mut aref, sz);
            (*t).array = aref;
        }
        // Fully weak: nothing further to mark.
        if weak & GC_WEAK == GC_WEAK && weak & WEAK_FFI == 0 {
            return weak;
        }
        if weak & GC_WEAKVAL == 0 {
            for i in 0..(*t).asize {
                gc_marktv(g, (*t).array_slot(i).load());
            }
        }
        if (*t).hmask > 0 {
            gc_mark_tab_hash(g, t);
            if weak & GC_WEAKKEY != 0 && weak & WEAK_FFI == 0 {
                // Ephemeron: both edges wait for the fixpoint pass.
                return weak;
            }
            for i in 0..=(*t).hmask {
                let n = (*t).node_ptr(i);
                if !(*n).val.is_nil() {
                    debug_assert!(!(*n).key.is_nil(), "nil key in non-empty slot");
                    if weak & GC_WEAKKEY == 0 {
                        gc_marktv(g, (*n).key);
                    }
                    if weak & GC_WEAKVAL == 0 {
                        gc_marktv(g, (*n).val);
                    }
                }
            }
        }
    }
    weak
}

/// Traverse a function: environment, prototype and upvalues.
fn gc_traverse_func<VM: VMBinding>(g: &mut GlobalState<VM>, f: *mut GCfunc) {
    unsafe {
        if !(*f).env.is_null() {
            gc_mark_tab(g, (*f).env);
        }
        if (*f).is_scripted() {
            if !(*f).pt.is_null() {
                gc_markobj(g, (*f).pt);
            }
            for i in 0..(*f).nupvalues as usize {
                let uv = (*f).upval_ref(i);
                if !uv.is_null() {
                    gc_mark_uv(g, uv);
                }
            }
        } else {
            for i in 0..(*f).nupvalues as usize {
                gc_marktv(g, (*f).upval_tv_slot(i).load());
            }
        }
    }
}

/// Traverse a prototype: chunk name, collectible constants, root trace.
fn gc_traverse_proto<VM: VMBinding>(g: &mut GlobalState<VM>, pt: *mut GCproto) {
    unsafe {
        if !(*pt).chunkname.is_null() {
            gc_mark_str(g, (*pt).chunkname);
        }
        for i in 0..(*pt).sizekgc as usize {
            let o = (*pt).kgc(i);
            if !o.is_null() {
                gc_markobj(g, o);
            }
        }
        if (*pt).trace != 0 {
            gc_marktrace(g, (*pt).trace);
        }
    }
}

/// Traverse a trace: constants, linked traces, start prototype.
fn gc_traverse_trace<VM: VMBinding>(g: &mut GlobalState<VM>, t: *mut GCtrace) {
    unsafe {
        if (*t).traceno == 0 {
            return;
        }
        for i in 0..(*t).nk as usize {
            let o = (*t).kgc(i);
            if !o.is_null() {
                gc_markobj(g, o);
            }
        }
        if (*t).link != 0 {
            gc_marktrace(g, (*t).link);
        }
        if (*t).nextroot != 0 {
            gc_marktrace(g, (*t).nextroot);
        }
        if (*t).nextside != 0 {
            gc_marktrace(g, (*t).nextside);
        }
        if !(*t).startpt.is_null() {
            gc_markobj(g, (*t).startpt);
        }
    }
}

/// Traverse the trace being recorded, if any.
pub fn gc_traverse_curtrace<VM: VMBinding>(g: &mut GlobalState<VM>) {
    if !g.cur_trace.is_null() {
        gc_traverse_trace(g, g.cur_trace.ptr());
    }
}

/// Shrink an oversized thread stack, relocating open upvalues.
fn shrink_stack<VM: VMBinding>(g: &mut GlobalState<VM>, th: *mut GCthread) {
    unsafe {
        let used = (*th).top.max((*th).base) + 1;
        let size = (*th).stacksize;
        if size < 64 || used * 4 > size {
            return;
        }
        let newsize = (used * 2).max(64);
        if newsize >= size {
            return;
        }
        let old = (*th).stack;
        let Ok(stack) = g.mem_realloc(
            old,
            GCthread::stack_bytes(size),
            GCthread::stack_bytes(newsize),
        ) else {
            return;
        };
        let diff = stack.as_usize() as isize - old.as_usize() as isize;
        (*th).stack = stack;
        (*th).stacksize = newsize;
        let mut uv = (*th).openupval;
        while !uv.is_null() {
            let u = uv.as_mut::<GCupval>();
            u.v = u.v + diff;
            uv = u.next;
        }
    }
}

/// Traverse a thread's stack; during atomic, also clear the unused tail
/// and shrink the stack.
fn gc_traverse_thread<VM: VMBinding>(g: &mut GlobalState<VM>, th: *mut GCthread) {
    unsafe {
        let top = (*th).top;
        for i in 1..top {
            gc_marktv(g, (*th).slot(i).load());
        }
        if g.gc.state == crate::global::GcPhase::Atomic {
            for i in top..(*th).stacksize {
                (*th).slot(i).store(TValue::Nil);
            }
            shrink_stack(g, th);
        }
        if !(*th).env.is_null() {
            gc_mark_tab(g, (*th).env);
        }
    }
}

// -- Propagation -----------------------------------------------------------

fn push_grayagain<VM: VMBinding>(g: &mut GlobalState<VM>, t: *mut GCtab) {
    unsafe {
        (*t).gcflags |= GC_GRAY;
        (*t).gclist = g.gc.grayagain;
    }
    g.gc.grayagain = GCRef::from_ptr(t);
}

unsafe fn traverse_tab_arena<VM: VMBinding>(
    g: &mut GlobalState<VM>,
    a: *mut GCAcommon,
    threshold: usize,
) -> usize {
    let mut ret = 0usize;
    while (*a).gray_h != 0 {
        let i = tzcount64((*a).gray_h) as usize;
        while (*a).gray[i] != 0 {
            let j = tzcount64((*a).gray[i]);
            (*a).gray[i] = reset_lowest64((*a).gray[i]);
            let t = slot_addr(a as *mut ArenaHdr, TAB_LAYOUT, (i as u32) << 6 | j)
                .to_mut_ptr::<GCtab>();
            g.gc.gray2black(GCRef::from_ptr(t));
            (*a).mark[i] |= flags2bitmask((*t).gcflags, j);
            ret += mem::size_of::<GCtab>() + (*t).array_bytes() + (*t).hash_bytes();
            let weak = gc_traverse_tab(g, t);
            if weak & GC_WEAK != 0 && weak & WEAK_FFI == 0 {
                // Weak tables are cleared in the atomic phase.
                push_grayagain(g, t);
            }
            if ret >= threshold {
                return ret;
            }
        }
        (*a).gray_h &= !abit(i as u32);
    }
    g.gc.gray_head = (*a).hdr.gray;
    ret
}

unsafe fn traverse_func_arena<VM: VMBinding>(
    g: &mut GlobalState<VM>,
    a: *mut GCAcommon,
    threshold: usize,
) -> usize {
    let mut ret = 0usize;
    while (*a).gray_h != 0 {
        let i = tzcount64((*a).gray_h) as usize;
        while (*a).gray[i] != 0 {
            let j = tzcount64((*a).gray[i]);
            (*a).gray[i] = reset_lowest64((*a).gray[i]);
            let f = slot_addr(a as *mut ArenaHdr, FUNC_LAYOUT, (i as u32) << 6 | j)
                .to_mut_ptr::<GCfunc>();
            let size = (*f).data_size();
            g.gc.gray2black(GCRef::from_ptr(f));
            (*a).mark[i] |= flags2bitmask((*f).gcflags, j);
            if (*f).gcflags & GC_SIZE_BITS == 0 && !(*f).data.is_zero() {
                let mut dref = (*f).data;
                blob::mark_blob(g, &mut dref, size);
                (*f).data = dref;
            }
            ret += mem::size_of::<GCfunc>() + size;
            gc_traverse_func(g, f);
            if ret >= threshold {
                return ret;
            }
        }
        (*a).gray_h &= !abit(i as u32);
    }
    g.gc.gray_head = (*a).hdr.gray;
    ret
}

unsafe fn traverse_uv_arena<VM: VMBinding>(
    g: &mut GlobalState<VM>,
    a: *mut GCAcommon,
    threshold: usize,
) -> usize {
    let mut ret = 0usize;
    while (*a).gray_h != 0 {
        let i = tzcount64((*a).gray_h) as usize;
        while (*a).gray[i] != 0 {
            let j = tzcount64((*a).gray[i]);
            (*a).gray[i] = reset_lowest64((*a).gray[i]);
            let uv = slot_addr(a as *mut ArenaHdr, UV_LAYOUT, (i as u32) << 6 | j)
                .to_mut_ptr::<GCupval>();
            (*uv).gcflags = ((*uv).gcflags & !GC_COLORS) | g.gc.currentblack;
            ret += mem::size_of::<GCupval>();
            gc_marktv(g, (*uv).value());
            if ret >= threshold {
                return ret;
            }
        }
        (*a).gray_h &= !abit(i as u32);
    }
    g.gc.gray_head = (*a).hdr.gray;
    ret
}

unsafe fn traverse_udata_arena<VM: VMBinding>(
    g: &mut GlobalState<VM>,
    a: *mut GCAcommon,
    threshold: usize,
) -> usize {
    let mut ret = 0usize;
    while (*a).gray_h != 0 {
        let i = tzcount64((*a).gray_h) as usize;
        while (*a).gray[i] != 0 {
            let j = tzcount64((*a).gray[i]);
            (*a).gray[i] = reset_lowest64((*a).gray[i]);
            let ud = slot_addr(a as *mut ArenaHdr, UDATA_LAYOUT, (i as u32) << 6 | j)
                .to_mut_ptr::<GCudata>();
            g.gc.gray2black(GCRef::from_ptr(ud));
            (*a).mark[i] |= flags2bitmask((*ud).gcflags, j);
            if !(*ud).metatable.is_null() {
                gc_mark_tab(g, (*ud).metatable);
            }
            if !(*ud).env.is_null() {
                gc_mark_tab(g, (*ud).env);
            }
            if (*ud).udtype == UDTYPE_BUFFER {
                let buf = (*ud).payload.to_ptr::<BufHeader>();
                if (*buf).flags & BUF_COW != 0 && !(*buf).cowref.is_null() {
                    gc_markobj(g, (*buf).cowref);
                }
                if !(*buf).dict_str.is_null() {
                    gc_mark_tab(g, (*buf).dict_str);
                }
                if !(*buf).dict_mt.is_null() {
                    gc_mark_tab(g, (*buf).dict_mt);
                }
            }
            ret += mem::size_of::<GCudata>();
            if ret >= threshold {
                return ret;
            }
        }
        (*a).gray_h &= !abit(i as u32);
    }
    g.gc.gray_head = (*a).hdr.gray;
    ret
}

/// Traverse at most `threshold` accounted bytes from the head arena of
/// the arena-gray queue.
pub fn propagatemark_arena<VM: VMBinding>(g: &mut GlobalState<VM>, threshold: usize) -> usize {
    let a = g.gc.gray_head as *mut GCAcommon;
    debug_assert!(!a.is_null());
    let ret = unsafe {
        match GcKind::from_u8((*a).hdr.obj_type) {
            GcKind::Upval => traverse_uv_arena(g, a, threshold),
            GcKind::Func => traverse_func_arena(g, a, threshold),
            GcKind::Tab => traverse_tab_arena(g, a, threshold),
            GcKind::Udata => traverse_udata_arena(g, a, threshold),
            k => unreachable!("bad arena type {:?}", k),
        }
    };
    g.gc.accum += ret;
    ret
}

/// Propagate one object from the object-gray list and turn it black.
pub fn propagatemark<VM: VMBinding>(g: &mut GlobalState<VM>) -> usize {
    let o = g.gc.gray;
    debug_assert!(g.gc.is_gray(o), "propagation of non-gray object");
    g.gc.gray2black(o);
    g.gc.gray = unsafe { o.as_ref::<GCoHdr>().gclist };
    match o.gct() {
        GcKind::Proto => {
            let pt = o.ptr::<GCproto>();
            gc_traverse_proto(g, pt);
            unsafe { (*pt).sizept as usize }
        }
        GcKind::Thread => {
            let th = o.ptr::<GCthread>();
            unsafe {
                (*th).gclist = g.gc.grayagain_th;
            }
            g.gc.grayagain_th = o;
            // Threads are never left black; the atomic phase rescans.
            o.set_gcflags((o.gcflags() & !GC_BLACKS) | GC_GRAY);
            gc_traverse_thread(g, th);
            unsafe { mem::size_of::<GCthread>() + GCthread::stack_bytes((*th).stacksize) }
        }
        GcKind::Trace => {
            let t = o.ptr::<GCtrace>();
            gc_traverse_trace(g, t);
            unsafe { GCtrace::alloc_size((*t).nk) }
        }
        k => unreachable!("bad gray object kind {:?}", k),
    }
}

/// Drain both gray queues completely.
pub fn gc_propagate_gray<VM: VMBinding>(g: &mut GlobalState<VM>) -> usize {
    let mut m = 0usize;
    while !g.gc.gray.is_null() || !g.gc.gray_head.is_null() {
        while !g.gc.gray.is_null() {
            m += propagatemark(g);
        }
        while !g.gc.gray_head.is_null() {
            m += propagatemark_arena(g, usize::MAX);
        }
    }
    m
}

// -- Ephemerons and the second-chance list ---------------------------------

fn traverse_ephemeron<VM: VMBinding>(g: &mut GlobalState<VM>, t: *mut GCtab) -> bool {
    let mut changed = false;
    unsafe {
        if (*t).node.is_zero() {
            return false;
        }
        for i in 0..=(*t).hmask {
            let n = (*t).node_ptr(i);
            let (key, val) = ((*n).key, (*n).val);
            if !val.is_nil() {
                let val_white = matches!(val, TValue::Gc(o) if g.gc.is_white(o));
                let key_white = matches!(key, TValue::Gc(o) if g.gc.is_white(o));
                if val_white && !key_white {
                    gc_marktv(g, val);
                    changed = true;
                }
            }
        }
    }
    changed
}

/// Run the ephemeron fixpoint: propagate, rescan all ephemeron tables,
/// repeat until no value gets newly marked.
pub fn process_ephemerons<VM: VMBinding>(g: &mut GlobalState<VM>) {
    loop {
        gc_propagate_gray(g);
        let mut changed = false;
        let mut t = g.gc.ephemeron;
        while !t.is_null() {
            changed |= traverse_ephemeron(g, t.ptr());
            t = unsafe { t.as_ref::<GCtab>().gclist };
        }
        if !changed {
            break;
        }
    }
}

/// Re-traverse the second-chance lists in the atomic phase. Weak tables
/// are routed to the weak/ephemeron lists; threads get a final scan.
pub fn propagatemark_again<VM: VMBinding>(g: &mut GlobalState<VM>) {
    let mut o = g.gc.grayagain;
    while !o.is_null() {
        let next = unsafe { o.as_ref::<GCtab>().gclist };
        g.gc.gray2black(o);
        let t = o.ptr::<GCtab>();
        let weak = gc_traverse_tab(g, t);
        if weak & GC_WEAK != 0 && weak & WEAK_FFI == 0 {
            debug_assert!(o.gcflags() & GC_WEAK != 0, "no weak flags");
            if weak == GC_WEAKKEY {
                unsafe { (*t).gclist = g.gc.ephemeron };
                g.gc.ephemeron = o;
            } else {
                unsafe { (*t).gclist = g.gc.weak };
                g.gc.weak = o;
            }
        }
        o = next;
    }
    g.gc.grayagain = GCRef::NULL;

    let mut o = g.gc.grayagain_th;
    while !o.is_null() {
        g.gc.gray2black(o);
        gc_traverse_thread(g, o.ptr());
        o = unsafe { o.as_ref::<GCthread>().gclist };
    }
}

/// May this weak slot be cleared? Strings never act as weak references
/// (and get marked on inspection); finalized userdata drops from value
/// slots only.
fn gc_mayclear<VM: VMBinding>(g: &mut GlobalState<VM>, tv: TValue, is_val: bool) -> bool {
    if let TValue::Gc(o) = tv {
        if o.gct() == GcKind::Str {
            gc_mark_str(g, o);
            return false;
        }
        if g.gc.is_white(o) {
            return true;
        }
        if is_val && o.gct() == GcKind::Udata && o.gcflags() & GC_FINALIZED != 0 {
            return true;
        }
    }
    false
}

/// Clear weak-table entries whose key or value is about to die. Runs
/// after the ephemeron fixpoint over both the weak and ephemeron lists.
pub fn gc_clearweak<VM: VMBinding>(g: &mut GlobalState<VM>, list: GCRef) {
    let mut o = list;
    while !o.is_null() {
        let t = o.ptr::<GCtab>();
        unsafe {
            debug_assert!((*t).gcflags & GC_WEAK != 0, "clear of non-weak table");
            if (*t).gcflags & GC_WEAK != GC_WEAKVAL {
                // The hash part was skipped during traversal; account it
                // (and relocate it) now.
                gc_mark_tab_hash(g, t);
            }
            if (*t).gcflags & GC_WEAKVAL != 0 {
                for i in 0..(*t).asize {
                    let slot = (*t).array_slot(i);
                    if gc_mayclear(g, slot.load(), true) {
                        slot.store(TValue::Nil);
                    }
                }
            }
            if (*t).hmask > 0 && !(*t).node.is_zero() {
                for i in 0..=(*t).hmask {
                    let n = (*t).node_ptr(i);
                    if !(*n).val.is_nil()
                        && (gc_mayclear(g, (*n).key, false) || gc_mayclear(g, (*n).val, true))
                    {
                        (*n).val = TValue::Nil;
                    }
                }
            }
            o = (*t).gclist;
        }
    }
}

/// Unchain dead upvalues from every traversed thread's open chain.
pub fn sweep_upvals<VM: VMBinding>(g: &mut GlobalState<VM>) {
    let black = g.gc.currentblack;
    let mut o = g.gc.grayagain_th;
    while !o.is_null() {
        unsafe {
            let th = o.ptr::<GCthread>();
            let mut slot: *mut GCRef = &mut (*th).openupval;
            while !(*slot).is_null() {
                let uv = (*slot).ptr::<GCupval>();
                if (*uv).gcflags & black != 0 {
                    slot = &mut (*uv).next;
                } else {
                    *slot = (*uv).next;
                }
            }
            o = (*th).gclist;
        }
    }
}

//! Finalizer pipeline: presweep resurrection of newly unreachable
//! finalizable tables/userdata, the `fin_list` drain with the collector
//! paused, and the cdata bridge through the FFI finalizer table.

use crate::global::{GcRoot, GlobalState};
use crate::mark::{gc_markobj, gc_marktv};
use crate::object::tab::{tab_get, tab_getstr, tab_set};
use crate::object::*;
use crate::policy::arena::*;
use crate::util::constants::*;
use crate::util::simd::{reset_lowest64, tzcount64};
use crate::vm::VMBinding;

fn push_fin_list<VM: VMBinding>(g: &mut GlobalState<VM>, o: GCRef) {
    // Tables and userdata both keep gclist at the same slot.
    match o.gct() {
        GcKind::Tab => unsafe { o.as_mut::<GCtab>().gclist = g.gc.fin_list },
        GcKind::Udata => unsafe { o.as_mut::<GCudata>().gclist = g.gc.fin_list },
        k => unreachable!("finalizing {:?}", k),
    }
    o.flags_or(GC_FINALIZED);
    g.gc.fin_list = o;
}

unsafe fn presweep_words<VM: VMBinding>(
    g: &mut GlobalState<VM>,
    a: *mut GCAcommon,
    fin: *mut Bitmap,
    req: Option<*const Bitmap>,
    layout: ArenaLayout,
) {
    let mut gray_h = 0u64;
    for w in 0..layout.words {
        let mut f = !((*a).free[w] | (*fin)[w] | (*a).mark[w]) & layout.free_word_init(w);
        if let Some(req) = req {
            f &= (*req)[w];
        }
        if f == 0 {
            (*a).gray[w] = 0;
            continue;
        }
        (*fin)[w] |= f;
        (*a).gray[w] = f;
        (*a).mark[w] |= f;
        gray_h |= abit(w as u32);
        let mut bits = f;
        while bits != 0 {
            let j = tzcount64(bits);
            bits = reset_lowest64(bits);
            let o = GCRef::from_addr(slot_addr(a as *mut ArenaHdr, layout, (w as u32) << 6 | j));
            push_fin_list(g, o);
        }
    }
    (*a).gray_h = gray_h;
    if gray_h != 0 {
        // Resurrected objects need their children kept alive too.
        crate::mark::requeue_gray_arena(g, a as *mut ArenaHdr);
    }
}

/// Presweep the finalizer-table arenas: resurrect newly unreachable
/// tables (`!free & !fin & !mark`), flag them finalized and queue them.
///
/// `fin` is carried rather than rebuilt so an object referenced by a
/// dying finalized object cannot re-run its finalizer next cycle.
pub fn presweep_fintab<VM: VMBinding>(g: &mut GlobalState<VM>) {
    let mut a = g.gc.fintab.head;
    while !a.is_null() {
        unsafe {
            let at = a as *mut GCAtab;
            let fin: *mut Bitmap = &mut (*at).fin;
            presweep_words(g, a as *mut GCAcommon, fin, None, TAB_LAYOUT);
            a = (*a).next;
        }
    }
}

/// Presweep userdata arenas, gated by the finalizer-request bitmap.
pub fn presweep_udata<VM: VMBinding>(g: &mut GlobalState<VM>) {
    let mut a = g.gc.udata.head;
    while !a.is_null() {
        unsafe {
            let au = a as *mut GCAudata;
            let fin: *mut Bitmap = &mut (*au).fin;
            let req: *const Bitmap = &(*au).fin_req;
            presweep_words(g, a as *mut GCAcommon, fin, Some(req), UDATA_LAYOUT);
            a = (*a).next;
        }
    }
}

/// Strip finalizer-requested userdata of their mark bits and queue every
/// unreachable one; used on shutdown to force pending finalizers.
pub fn separateudata<VM: VMBinding>(g: &mut GlobalState<VM>) {
    g.gc.fin_list = GCRef::NULL;
    let mut a = g.gc.udata.head;
    while !a.is_null() {
        unsafe {
            let au = a as *mut GCAudata;
            for w in 0..UDATA_LAYOUT.words {
                (*au).a.mark[w] &= !(*au).fin_req[w];
            }
            a = (*a).next;
        }
    }
    presweep_udata(g);
}

/// Record that a userdata wants its finalizer run when it dies.
pub fn registergc_udata<VM: VMBinding>(_g: &mut GlobalState<VM>, ud: *mut GCudata) {
    let addr = crate::util::Address::from_mut_ptr(ud);
    let a = arena_of(addr) as *mut GCAudata;
    let idx = UDATA_LAYOUT.idx_of(addr);
    unsafe { (*a).fin_req.set(idx) };
}

/// Resolve the `__gc` metamethod of a table or userdata.
fn resolve_gc_mm<VM: VMBinding>(g: &GlobalState<VM>, o: GCRef) -> Option<TValue> {
    let mt = match o.gct() {
        GcKind::Tab => unsafe { o.as_ref::<GCtab>().metatable },
        GcKind::Udata => unsafe { o.as_ref::<GCudata>().metatable },
        GcKind::Cdata => g.gcroot[GcRoot::BasemtUdata],
        _ => GCRef::NULL,
    };
    if mt.is_null() {
        return None;
    }
    let name = g.gcroot[GcRoot::MmGc];
    if name.is_null() {
        return None;
    }
    tab_getstr(unsafe { mt.as_ref::<GCtab>() }, name)
}

/// Call a finalizer with the collector effectively paused; errors are
/// routed to the host's error sink and swallowed.
pub fn gc_call_finalizer<VM: VMBinding>(g: &mut GlobalState<VM>, mo: TValue, o: GCRef) {
    let old_threshold = g.gc.threshold;
    g.gc.threshold = GCMAXCOST;
    g.cur_trace = GCRef::NULL;
    trace!("running finalizer for {:?}", o);
    if let Err(e) = VM::invoke_finalizer(g, mo, o) {
        VM::finalizer_error(g, e);
    }
    g.gc.threshold = old_threshold;
}

/// Finalize the head of `fin_list`; returns the new head.
pub fn gc_finalize_obj<VM: VMBinding>(g: &mut GlobalState<VM>, o: GCRef) -> GCRef {
    debug_assert!(g.jit_base.is_zero(), "finalizer called on trace");
    let next = match o.gct() {
        GcKind::Tab => unsafe { o.as_ref::<GCtab>().gclist },
        _ => unsafe { o.as_ref::<GCudata>().gclist },
    };
    if let Some(mo) = resolve_gc_mm(g, o) {
        gc_call_finalizer(g, mo, o);
    }
    next
}

/// Drain the whole `fin_list` (shutdown helper; the scheduler drains it
/// one object per step).
pub fn finalize_udata<VM: VMBinding>(g: &mut GlobalState<VM>) {
    while !g.gc.fin_list.is_null() {
        let head = g.gc.fin_list;
        g.gc.fin_list = gc_finalize_obj(g, head);
    }
}

/// Atomic-phase cdata separation: dead cdata keys of the FFI finalizer
/// table with a registered finalizer are resurrected, their finalizers
/// kept alive, and queued on the legacy `mmudata` chain.
pub fn separate_cdata<VM: VMBinding>(g: &mut GlobalState<VM>) {
    let fin_tab = g.gcroot[GcRoot::FfiFin];
    if fin_tab.is_null() {
        return;
    }
    let t = fin_tab.ptr::<GCtab>();
    unsafe {
        if (*t).node.is_zero() {
            return;
        }
        for i in 0..=(*t).hmask {
            let n = (*t).node_ptr(i);
            if (*n).val.is_nil() {
                continue;
            }
            if let TValue::Gc(cd) = (*n).key {
                if cd.gct() == GcKind::Cdata
                    && g.gc.is_white(cd)
                    && cd.gcflags() & GC_CDATA_FIN != 0
                {
                    gc_markobj(g, cd);
                    gc_marktv(g, (*n).val);
                    cd.as_mut::<GCcdata>().gclist = g.gc.mmudata;
                    g.gc.mmudata = cd;
                    g.gc.nocdatafin = false;
                }
            }
        }
    }
}

/// Finalize one cdata from the `mmudata` chain: clear its table entry,
/// run the finalizer, and leave the object white on the root list.
pub fn gc_finalize_mm<VM: VMBinding>(g: &mut GlobalState<VM>) {
    let cd = g.gc.mmudata;
    debug_assert!(!cd.is_null());
    g.gc.mmudata = unsafe { cd.as_ref::<GCcdata>().gclist };
    cd.flags_andn(GC_CDATA_FIN);
    cd.make_white();
    let fin_tab = g.gcroot[GcRoot::FfiFin];
    if fin_tab.is_null() {
        return;
    }
    let t = fin_tab.ptr::<GCtab>();
    let mo = tab_get(unsafe { &*t }, TValue::Gc(cd));
    if let Some(mo) = mo {
        let _ = tab_set(g, t, TValue::Gc(cd), TValue::Nil);
        gc_call_finalizer(g, mo, cd);
    }
}

/// Shutdown path: disable the finalizer table and run every registered
/// cdata finalizer.
pub fn finalize_cdata<VM: VMBinding>(g: &mut GlobalState<VM>) {
    let fin_tab = g.gcroot[GcRoot::FfiFin];
    if fin_tab.is_null() {
        return;
    }
    let t = fin_tab.ptr::<GCtab>();
    unsafe {
        (*t).metatable = GCRef::NULL;
        if (*t).node.is_zero() {
            return;
        }
        for i in (0..=(*t).hmask).rev() {
            let n = (*t).node_ptr(i);
            if (*n).val.is_nil() {
                continue;
            }
            if let TValue::Gc(cd) = (*n).key {
                if cd.gct() == GcKind::Cdata {
                    cd.flags_andn(GC_CDATA_FIN);
                    let mo = (*n).val;
                    (*n).val = TValue::Nil;
                    gc_call_finalizer(g, mo, cd);
                }
            }
        }
    }
}

/// Register (or clear, with nil) a cdata finalizer in the FFI table.
pub fn set_cdata_finalizer<VM: VMBinding>(
    g: &mut GlobalState<VM>,
    cd: GCRef,
    fin: TValue,
) -> Result<(), crate::GcError> {
    debug_assert_eq!(cd.gct(), GcKind::Cdata);
    let fin_tab = g.gcroot[GcRoot::FfiFin];
    debug_assert!(!fin_tab.is_null(), "no finalizer table");
    tab_set(g, fin_tab.ptr(), TValue::Gc(cd), fin)?;
    if fin.is_nil() {
        cd.flags_andn(GC_CDATA_FIN);
    } else {
        cd.flags_or(GC_CDATA_FIN);
    }
    Ok(())
}

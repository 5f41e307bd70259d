//! Write barriers. The tri-color invariant ("no black points to white")
//! only holds during propagate and atomic; outside those phases the
//! barriers degrade to cheap color resets.

use crate::global::{GcPhase, GlobalState};
use crate::mark::{gc_marktrace, gc_marktv, gc_markobj};
use crate::object::{GCRef, GcKind, TValue};
use crate::policy::arena::{abit, aidxh, aidxl, arena_of, GCAcommon, TAB_LAYOUT};
use crate::util::constants::*;
use crate::vm::VMBinding;

fn barriers_active<VM: VMBinding>(g: &GlobalState<VM>) -> bool {
    matches!(g.gc.state, GcPhase::Propagate | GcPhase::Atomic)
}

/// Forward barrier: move the propagation frontier over the new edge
/// `o -> v`, or push `o` back to white outside the marking phases.
pub fn barrierf<VM: VMBinding>(g: &mut GlobalState<VM>, o: GCRef, v: GCRef) {
    debug_assert!(
        g.gc.is_black(o) && g.gc.is_white(v),
        "bad object states for forward barrier"
    );
    debug_assert!(!g.checkdead(v) && !g.checkdead(o));
    debug_assert!(
        g.gc.state != GcPhase::Finalize && g.gc.state != GcPhase::Pause,
        "bad GC state"
    );
    debug_assert!(o.gct() != GcKind::Tab, "tables use the back-barrier");
    if barriers_active(g) {
        gc_markobj(g, v);
    } else {
        o.make_white();
    }
}

/// Closed-upvalue barrier: unconditionally mark the stored value.
pub fn barrieruv<VM: VMBinding>(g: &mut GlobalState<VM>, tv: TValue) {
    gc_marktv(g, tv);
}

/// Trace barrier: gray a trace saved during marking.
pub fn barriertrace<VM: VMBinding>(g: &mut GlobalState<VM>, traceno: u32) {
    if barriers_active(g) {
        gc_marktrace(g, traceno);
    }
}

/// Table back-barrier: any store into a black table re-grays it in its
/// arena so the new edge (and any relocated hash part) is traversed
/// again before sweep.
pub fn barriert<VM: VMBinding>(g: &mut GlobalState<VM>, t: GCRef, _v: TValue) {
    if !barriers_active(g) || !g.gc.is_black(t) {
        return;
    }
    let a = arena_of(t.addr()) as *mut GCAcommon;
    let idx = TAB_LAYOUT.idx_of(t.addr());
    let h = aidxh(idx);
    let bit = abit(aidxl(idx));
    unsafe {
        if (*a).gray[h] & bit == 0 {
            if (*a).gray_h == 0 {
                crate::mark::requeue_gray_arena(g, a as *mut crate::policy::arena::ArenaHdr);
            }
            (*a).gray_h |= abit(h as u32);
            (*a).gray[h] |= bit;
        }
    }
    t.set_gcflags((t.gcflags() & !GC_BLACKS) | GC_GRAY);
}

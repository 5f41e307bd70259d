//! The incremental schedule: a cost-bounded state machine interleaving
//! mark, sweep and finalizer work with mutator execution, paced by
//! allocation debt.

use crate::finalize;
use crate::global::{ArenaKind, GcPhase, GlobalState};
use crate::mark;
use crate::object::GCRef;
use crate::strtab;
use crate::sweep;
use crate::util::constants::*;
use crate::vm::VMBinding;

/// Outcome of [`step`]: the {0, -1, 1} contract.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepResult {
    /// Mid-cycle, more work queued (0).
    InProgress,
    /// Debt paid off; parked just below the threshold (-1).
    Threshold,
    /// Finished a full cycle (1).
    Finished,
}

/// The indivisible transition from mark to sweep.
fn atomic<VM: VMBinding>(g: &mut GlobalState<VM>) {
    debug_assert!(g.jit_base.is_zero(), "atomic phase on trace");
    g.gc.weak = GCRef::NULL;
    g.gc.ephemeron = GCRef::NULL;
    debug_assert!(!g.gc.is_white(g.mainthread), "main thread turned white");

    let cur = g.cur_l;
    if !cur.is_null() {
        mark::gc_markobj(g, cur);
    }
    mark::gc_traverse_curtrace(g);
    mark::gc_mark_gcroot(g);

    // Empty the second-chance lists, then run the ephemeron fixpoint
    // (which also drains any leftover gray work).
    mark::propagatemark_again(g);
    mark::process_ephemerons(g);

    mark::sweep_upvals(g);

    // Resurrect newly unreachable finalizable objects. A resurrected
    // finalizable object can reach another one, so the round runs twice.
    g.gc.fin_list = GCRef::NULL;
    finalize::presweep_fintab(g);
    finalize::presweep_udata(g);
    let mut udsize = mark::gc_propagate_gray(g);
    finalize::presweep_fintab(g);
    finalize::presweep_udata(g);
    udsize += mark::gc_propagate_gray(g);

    finalize::separate_cdata(g);
    mark::gc_propagate_gray(g);

    // All marking done; clear weak tables.
    let weak = g.gc.weak;
    mark::gc_clearweak(g, weak);
    let eph = g.gc.ephemeron;
    mark::gc_clearweak(g, eph);

    // Gray keeps lazily swept strings alive through the sweep states.
    g.gc.safecolor = g.gc.currentblack | GC_GRAY | GC_SFIXED;

    if !g.gc.minor {
        g.gc.grayagain_th = GCRef::NULL;
        g.gc.currentblack ^= GC_BLACKS;
        g.gc.currentblackgray ^= GC_BLACKS;
    }
    g.gc.currentsweep ^= ARENA_SWEEPS;
    g.gc.sweep_prev = GCRef::NULL;

    // Expected consumption is raw allocations plus whatever traversal
    // found live. String memory is not traversed; carry the previous
    // sweep's figure and fix it up as the string sweeps run.
    g.gc.total = g.gc.malloc + g.gc.accum + g.gc.old_strings;
    g.gc.estimate = g.gc.total.saturating_sub(udsize);
    g.gc.old_strings = g.gc.strings;
    g.gc.strings = 0;
    g.str.num_small = 0;
    g.str.num_dead = 0;

    // The allocation head of each kind must be swept here; the allocator
    // only re-checks parity when it acquires an arena.
    for ak in [
        ArenaKind::Tab,
        ArenaKind::FinTab,
        ArenaKind::Func,
        ArenaKind::Uv,
        ArenaKind::Udata,
        ArenaKind::StrSmall,
        ArenaKind::StrMed,
    ] {
        let head = g.gc.list(ak).head;
        sweep::sweep_one_bitmap(g, ak, head);
    }

    debug_assert!(!g.gc.bloblist.is_empty(), "no blobs");
    g.gc.bloblist_sweep = g.gc.bloblist.len() as i32 - 2;
    if !g.gc.minor {
        let last = g.gc.bloblist.len() - 1;
        g.gc.bloblist_usage[last] = 0;
    }
    debug!(
        "atomic done: total={} estimate={} fin queued={}",
        g.gc.total,
        g.gc.estimate,
        !g.gc.fin_list.is_null()
    );
}

/// One state-machine step; returns the cost consumed.
fn onestep<VM: VMBinding>(g: &mut GlobalState<VM>) -> usize {
    match g.gc.state {
        GcPhase::Pause => {
            mark::gc_mark_start(g);
            0
        }
        GcPhase::Propagate => {
            if !g.gc.gray.is_null() {
                return mark::propagatemark(g);
            }
            if !g.gc.gray_head.is_null() {
                return mark::propagatemark_arena(g, GCSTEPSIZE);
            }
            g.gc.state = GcPhase::Atomic;
            0
        }
        GcPhase::Atomic => {
            if !g.jit_base.is_zero() {
                // Cannot run the atomic phase with a live trace base.
                return GCMAXCOST;
            }
            atomic(g);
            g.gc.state = GcPhase::Sweep;
            0
        }
        GcPhase::Sweep => {
            let old = g.gc.total;
            let done = sweep::gc_sweep_list(g, GCSWEEPMAX);
            debug_assert!(old >= g.gc.total, "sweep increased memory");
            g.gc.estimate = g.gc.estimate.saturating_sub(old - g.gc.total);
            if done {
                g.gc.state = GcPhase::SweepBlob;
            }
            GCSWEEPCOST
        }
        GcPhase::SweepBlob => {
            if g.gc.bloblist_sweep >= 0 {
                crate::policy::blob::sweep_blobs(g);
            }
            g.gc.state = GcPhase::SweepSmallStr;
            let next = unsafe { (*g.gc.str_small.head).next };
            g.gc.sweep = sweep::find_unswept(g, next);
            GCSWEEPCOST
        }
        GcPhase::SweepSmallStr => {
            if !g.gc.sweep.is_null() {
                g.gc.sweep = sweep::sweep_arenas(g, ArenaKind::StrSmall, g.gc.sweep, 10);
            } else {
                g.gc.state = GcPhase::SweepStr;
                g.gc.strings += g.str.num_small << 5;
                let next = unsafe { (*g.gc.str_med.head).next };
                g.gc.sweep = sweep::find_unswept(g, next);
            }
            GCSWEEPCOST
        }
        GcPhase::SweepStr => {
            if !g.gc.sweep.is_null() {
                g.gc.sweep = sweep::sweep_arenas(g, ArenaKind::StrMed, g.gc.sweep, 10);
            } else {
                g.gc.state = GcPhase::SweepHugeStr;
                g.gc.sweep_huge_prev = std::ptr::null_mut();
            }
            GCSWEEPCOST
        }
        GcPhase::SweepHugeStr => {
            if !sweep::sweep_hugestrings(g, 20) {
                return GCSWEEPCOST;
            }
            g.gc.state = GcPhase::SweepFunc;
            let next = unsafe { (*g.gc.func.head).next };
            g.gc.sweep = sweep::find_unswept(g, next);
            // String memory is known at this point; fix up the total.
            g.gc.total = g.gc.total.saturating_sub(g.gc.old_strings) + g.gc.strings;
            let mask = g.str.mask as usize;
            if g.str.num <= mask >> 2 && mask > MIN_STRTAB * 2 - 1 {
                let _ = strtab::strtab_resize(g, (mask + 1) >> 1);
            }
            GCSWEEPCOST
        }
        GcPhase::SweepFunc => {
            if !g.gc.sweep.is_null() {
                g.gc.sweep = sweep::sweep_arenas(g, ArenaKind::Func, g.gc.sweep, 10);
            } else {
                g.gc.state = GcPhase::SweepTab;
                let next = unsafe { (*g.gc.tab.head).next };
                g.gc.sweep = sweep::find_unswept(g, next);
            }
            GCSWEEPCOST
        }
        GcPhase::SweepTab => {
            if !g.gc.sweep.is_null() {
                g.gc.sweep = sweep::sweep_arenas(g, ArenaKind::Tab, g.gc.sweep, 10);
            } else {
                g.gc.state = GcPhase::SweepFinTab;
                let next = unsafe { (*g.gc.fintab.head).next };
                g.gc.sweep = sweep::find_unswept(g, next);
            }
            GCSWEEPCOST
        }
        GcPhase::SweepFinTab => {
            if !g.gc.sweep.is_null() {
                g.gc.sweep = sweep::sweep_arenas(g, ArenaKind::FinTab, g.gc.sweep, 10);
            } else {
                g.gc.state = GcPhase::SweepUv;
                let next = unsafe { (*g.gc.uv.head).next };
                g.gc.sweep = sweep::find_unswept(g, next);
            }
            GCSWEEPCOST
        }
        GcPhase::SweepUv => {
            if !g.gc.sweep.is_null() {
                g.gc.sweep = sweep::sweep_arenas(g, ArenaKind::Uv, g.gc.sweep, 10);
            } else {
                g.gc.state = GcPhase::SweepUdata;
                let next = unsafe { (*g.gc.udata.head).next };
                g.gc.sweep = sweep::find_unswept(g, next);
            }
            GCSWEEPCOST
        }
        GcPhase::SweepUdata => {
            if !g.gc.sweep.is_null() {
                g.gc.sweep = sweep::sweep_arenas(g, ArenaKind::Udata, g.gc.sweep, 10);
            } else {
                g.gc.state = GcPhase::FinalizeArena;
            }
            GCSWEEPCOST
        }
        GcPhase::FinalizeArena => {
            if !g.gc.fin_list.is_null() {
                if !g.jit_base.is_zero() {
                    return GCMAXCOST;
                }
                let head = g.gc.fin_list;
                g.gc.fin_list = finalize::gc_finalize_obj(g, head);
            } else if !g.gc.mmudata.is_null() {
                g.gc.state = GcPhase::Finalize;
                g.gc.nocdatafin = true;
            } else {
                g.gc.state = GcPhase::Pause;
                g.gc.debt = 0;
                debug!("cycle complete: total={} estimate={}", g.gc.total, g.gc.estimate);
            }
            GCSWEEPCOST
        }
        GcPhase::Finalize => {
            if !g.gc.mmudata.is_null() {
                if !g.jit_base.is_zero() {
                    return GCMAXCOST;
                }
                let old = g.gc.total;
                finalize::gc_finalize_mm(g);
                if old >= g.gc.total && g.gc.estimate > old - g.gc.total {
                    g.gc.estimate -= old - g.gc.total;
                }
                g.gc.estimate = g.gc.estimate.saturating_sub(GCFINALIZECOST);
                return GCFINALIZECOST;
            }
            g.gc.state = GcPhase::Pause;
            g.gc.debt = 0;
            0
        }
    }
}

/// Perform a bounded amount of incremental GC work on behalf of `l`.
pub fn step<VM: VMBinding>(g: &mut GlobalState<VM>, l: GCRef) -> StepResult {
    g.cur_l = l;
    let mut lim = ((GCSTEPSIZE / 100) * g.gc.stepmul) as i64;
    if lim == 0 {
        lim = i64::MAX;
    }
    if g.gc.total > g.gc.threshold {
        g.gc.debt += g.gc.total - g.gc.threshold;
    }
    loop {
        lim -= onestep(g).min(i64::MAX as usize) as i64;
        if g.gc.state == GcPhase::Pause {
            g.gc.threshold = (g.gc.estimate / 100) * g.gc.pause;
            return StepResult::Finished;
        }
        if lim <= 0 {
            break;
        }
    }
    if g.gc.debt < GCSTEPSIZE {
        g.gc.threshold = g.gc.total + GCSTEPSIZE;
        StepResult::Threshold
    } else {
        g.gc.debt -= GCSTEPSIZE;
        g.gc.threshold = g.gc.total;
        StepResult::InProgress
    }
}

/// As [`step`], but refresh the running thread's top first (callers that
/// may have a stale top, e.g. straight out of the interpreter loop).
pub fn step_fixtop<VM: VMBinding>(g: &mut GlobalState<VM>, l: GCRef) -> StepResult {
    unsafe {
        let th = l.ptr::<crate::object::GCthread>();
        if (*th).top < (*th).base {
            (*th).top = (*th).base;
        }
    }
    step(g, l)
}

/// Perform multiple steps on behalf of JIT-compiled code. Returns true
/// when a trace exit is required (atomic or finalize pending).
pub fn step_jit<VM: VMBinding>(g: &mut GlobalState<VM>, nsteps: usize) -> bool {
    let l = g.cur_l;
    for _ in 0..nsteps {
        if step(g, l) != StepResult::InProgress {
            break;
        }
    }
    g.gc.state == GcPhase::Atomic || g.gc.state == GcPhase::Finalize
}

/// Run a full collection. Non-maximal mode first finishes whatever
/// sweep is in progress; maximal drains any state.
pub fn fullgc<VM: VMBinding>(g: &mut GlobalState<VM>, l: GCRef, maximal: bool) {
    g.cur_l = l;
    let boundary = if maximal { GcPhase::Pause } else { GcPhase::Atomic };
    if g.gc.state > boundary {
        while g.gc.state != GcPhase::Pause {
            onestep(g);
        }
    }
    while {
        onestep(g);
        g.gc.state != GcPhase::Pause
    } {}
    g.gc.threshold = (g.gc.estimate / 100) * g.gc.pause;
}

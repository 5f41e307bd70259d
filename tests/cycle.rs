//! End-to-end collection scenarios: interning survival, unreachable
//! cycles, coalesced allocation, finalizer-once, pacing.

mod common;

use std::sync::atomic::Ordering;

use common::*;
use luna_gc::memory_manager as mm;
use luna_gc::object::tab::{tab_get, tab_set};
use luna_gc::object::{GCRef, GCstr, TValue};
use luna_gc::util::constants::*;
use luna_gc::{GcPhase, StepResult};

#[test]
fn interned_strings_survive_only_while_referenced() {
    let mut g = new_gc();
    let mut kept = Vec::new();
    let before = g.str.num;
    for i in 0..1000 {
        let name = format!("s{}", i);
        let st = s(&mut g, &name);
        if i % 2 == 1 {
            root_value(&mut g, &format!("keep{}", i), TValue::Gc(st));
            kept.push((name, st));
        }
    }
    assert_eq!(g.str.num, before + 1000 + 500); // 500 "keepN" keys too
    full(&mut g);
    full(&mut g);
    // Even-indexed strings died; re-interning a survivor returns the
    // same object.
    for (name, st) in &kept {
        let again = s(&mut g, name);
        assert_eq!(again, *st, "{} lost its identity", name);
    }
    // A collected string comes back as a fresh small-string cell.
    let s4 = s(&mut g, "s4");
    assert_eq!(unsafe { s4.as_ref::<GCstr>() }.len, 2);
    let roundtrip = s(&mut g, "s4");
    assert_eq!(s4, roundtrip);
}

#[test]
fn unreachable_table_cycle_is_collected() {
    let mut g = new_gc();
    let t = mm::alloctab(&mut g, 2).expect("table");
    let tref = GCRef::from_ptr(t);
    tab_set(&mut g, t, TValue::Num(0.0), TValue::Gc(tref)).unwrap();
    full(&mut g);
    // Reachable through nothing: the self-cycle must die.
    full(&mut g);
    assert!(!slot_allocated(tref));
}

#[test]
fn rooted_table_survives_collections() {
    let mut g = new_gc();
    let t = mm::alloctab(&mut g, 4).expect("table");
    let tref = GCRef::from_ptr(t);
    let marker = s(&mut g, "marker");
    tab_set(&mut g, t, TValue::Num(1.0), TValue::Gc(marker)).unwrap();
    root_value(&mut g, "t", TValue::Gc(tref));
    for _ in 0..4 {
        full(&mut g);
        assert!(slot_allocated(tref));
        let got = tab_get(unsafe { &*t }, TValue::Num(1.0)).expect("marker");
        assert_eq!(got, TValue::Gc(s(&mut g, "marker")));
    }
}

#[test]
fn coalesced_tables_use_adjacent_slots() {
    let mut g = new_gc();
    let mut tabs = Vec::new();
    for _ in 0..4 {
        let t = mm::alloctab(&mut g, 1).expect("table");
        unsafe {
            assert_eq!((*t).colo, 1, "array part should be colocated");
            assert_eq!((*t).gcflags & GC_SIZE_BITS, size2flags(2));
            let delta = (*t).array.as_usize() - (t as usize);
            assert_eq!(delta, std::mem::size_of::<luna_gc::object::GCtab>());
        }
        tabs.push(t);
    }
    // Keep them alive across a cycle; the coalesced pair sweeps as one.
    for (i, t) in tabs.iter().enumerate() {
        root_value(&mut g, &format!("colo{}", i), TValue::Gc(GCRef::from_ptr(*t)));
    }
    full(&mut g);
    for t in &tabs {
        assert!(slot_allocated(GCRef::from_ptr(*t)));
    }
}

#[test]
fn finalizer_runs_exactly_once() {
    let mut g = new_gc();
    FINALIZER_RUNS.store(0, Ordering::SeqCst);
    let ud = mm::allocudata(&mut g, 16).expect("udata");
    let udref = GCRef::from_ptr(ud);
    let mt = mm::alloctab(&mut g, 0).expect("mt");
    let gc_name = g.gcroot[luna_gc::global::GcRoot::MmGc];
    tab_set(&mut g, mt, TValue::Gc(gc_name), TValue::True).unwrap();
    unsafe { (*ud).metatable = GCRef::from_ptr(mt) };
    root_value(&mut g, "mt", TValue::Gc(GCRef::from_ptr(mt)));
    mm::registergc_udata(&mut g, ud);

    // Still referenced: no finalization.
    root_value(&mut g, "ud", TValue::Gc(udref));
    full(&mut g);
    assert_eq!(FINALIZER_RUNS.load(Ordering::SeqCst), 0);

    // Drop the last reference: the finalizer runs once, and the
    // resurrected object is only reclaimed by the following cycle.
    unroot(&mut g, "ud");
    full(&mut g);
    assert_eq!(FINALIZER_RUNS.load(Ordering::SeqCst), 1);
    assert!(slot_allocated(udref), "finalized object reclaimed too early");
    full(&mut g);
    assert_eq!(FINALIZER_RUNS.load(Ordering::SeqCst), 1);
    assert!(!slot_allocated(udref));
}

#[test]
fn finalizer_errors_are_swallowed() {
    let mut g = new_gc();
    FINALIZER_RUNS.store(0, Ordering::SeqCst);
    FINALIZER_ERRORS.store(0, Ordering::SeqCst);
    let ud = mm::allocudata(&mut g, 0).expect("udata");
    let mt = mm::alloctab(&mut g, 0).expect("mt");
    let gc_name = g.gcroot[luna_gc::global::GcRoot::MmGc];
    tab_set(&mut g, mt, TValue::Gc(gc_name), TValue::True).unwrap();
    unsafe { (*ud).metatable = GCRef::from_ptr(mt) };
    root_value(&mut g, "mt2", TValue::Gc(GCRef::from_ptr(mt)));
    mm::registergc_udata(&mut g, ud);
    FAIL_NEXT_FINALIZER.store(true, Ordering::SeqCst);
    full(&mut g);
    assert_eq!(FINALIZER_RUNS.load(Ordering::SeqCst), 1);
    assert_eq!(FINALIZER_ERRORS.load(Ordering::SeqCst), 1);
    // The collector keeps going afterwards.
    full(&mut g);
}

#[test]
fn incremental_steps_complete_cycles() {
    let mut g = new_gc();
    let main = g.mainthread;
    for i in 0..200 {
        let t = mm::alloctab(&mut g, 8).unwrap();
        if i % 4 == 0 {
            root_value(&mut g, &format!("inc{}", i), TValue::Gc(GCRef::from_ptr(t)));
        }
    }
    let mut finished = 0;
    for _ in 0..10_000 {
        match mm::step(&mut g, main) {
            StepResult::Finished => {
                finished += 1;
                assert_eq!(g.gc.state, GcPhase::Pause);
                if finished == 3 {
                    break;
                }
            }
            StepResult::Threshold | StepResult::InProgress => {}
        }
    }
    assert_eq!(finished, 3, "steps never completed three cycles");
}

#[test]
fn resweeping_is_a_noop() {
    let mut g = new_gc();
    let t = mm::alloctab(&mut g, 0).unwrap();
    root_value(&mut g, "stay", TValue::Gc(GCRef::from_ptr(t)));
    full(&mut g);
    let before = g.gc.total;
    // A second full collection with an unchanged heap must not shrink
    // accounting below the live set or free anything it kept.
    full(&mut g);
    assert!(slot_allocated(GCRef::from_ptr(t)));
    let after = g.gc.total;
    assert!(after <= before + GCSTEPSIZE && after > 0);
}

#[test]
fn dead_open_upvalues_leave_the_thread_chain() {
    let mut g = new_gc();
    let th = mm::thread_new(&mut g).expect("thread");
    root_value(&mut g, "th", TValue::Gc(GCRef::from_ptr(th)));

    // Two upvalues open onto the thread's stack; only one is referenced
    // by a live function.
    let kept = mm::allocuv(&mut g).expect("uv");
    let dropped = mm::allocuv(&mut g).expect("uv");
    unsafe {
        (*kept).closed = 0;
        (*kept).v = (*th).slot(1);
        (*dropped).closed = 0;
        (*dropped).v = (*th).slot(2);
        (*dropped).next = GCRef::from_ptr(kept);
        (*th).openupval = GCRef::from_ptr(dropped);
        (*th).top = 3;
    }
    let f = mm::allocfunc(&mut g, 8).expect("func");
    unsafe {
        (*f).nupvalues = 1;
        (*f).data.store(GCRef::from_ptr(kept));
    }
    root_value(&mut g, "f", TValue::Gc(GCRef::from_ptr(f)));

    full(&mut g);
    full(&mut g);
    assert!(slot_allocated(GCRef::from_ptr(kept)));
    assert!(!slot_allocated(GCRef::from_ptr(dropped)));
    // The chain now starts at the surviving upvalue.
    unsafe {
        assert_eq!((*th).openupval, GCRef::from_ptr(kept));
        assert_eq!((*kept).next, GCRef::NULL);
    }
}

#[test]
fn primary_arenas_survive_with_single_objects() {
    let mut g = new_gc();
    let t = mm::alloctab(&mut g, 0).unwrap();
    let uv = mm::allocuv(&mut g).unwrap();
    let f = mm::allocfunc(&mut g, 0).unwrap();
    let ud = mm::allocudata(&mut g, 0).unwrap();
    root_value(&mut g, "pt", TValue::Gc(GCRef::from_ptr(t)));
    root_value(&mut g, "puv", TValue::Gc(GCRef::from_ptr(uv)));
    root_value(&mut g, "pf", TValue::Gc(GCRef::from_ptr(f)));
    root_value(&mut g, "pud", TValue::Gc(GCRef::from_ptr(ud)));
    unsafe {
        (*f).env = GCRef::from_ptr(t);
    }
    full(&mut g);
    // Heads stay linked and the survivors stay allocated.
    assert!(!g.gc.tab.head.is_null());
    assert!(!g.gc.uv.head.is_null());
    assert!(!g.gc.func.head.is_null());
    assert!(!g.gc.udata.head.is_null());
    for o in [t as usize, uv as usize, f as usize, ud as usize] {
        let r = GCRef::from_addr(unsafe { luna_gc::util::Address::from_usize(o) });
        assert!(slot_allocated(r));
    }
}

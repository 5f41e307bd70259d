//! Randomized object-graph properties: color soundness over mutation
//! through the barriers, with incremental steps interleaved.

mod common;

use common::*;
use luna_gc::memory_manager as mm;
use luna_gc::object::tab::{tab_get, tab_set};
use luna_gc::object::{GCRef, GCtab, TValue};
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;

const NODES: usize = 120;
const EDGES_PER_NODE: u32 = 4;

struct Graph {
    tabs: Vec<*mut GCtab>,
    /// edges[i][k] = target node for slot k, usize::MAX for none.
    edges: Vec<[usize; EDGES_PER_NODE as usize]>,
    rooted: Vec<bool>,
}

fn reachable(gr: &Graph) -> Vec<bool> {
    let mut seen = vec![false; gr.tabs.len()];
    let mut stack: Vec<usize> = (0..gr.tabs.len()).filter(|&i| gr.rooted[i]).collect();
    for &i in &stack {
        seen[i] = true;
    }
    while let Some(i) = stack.pop() {
        for &t in &gr.edges[i] {
            if t != usize::MAX && !seen[t] {
                seen[t] = true;
                stack.push(t);
            }
        }
    }
    seen
}

#[test]
fn random_graph_mutation_never_dangles() {
    let mut g = new_gc();
    let main = g.mainthread;
    let mut rng = ChaCha8Rng::seed_from_u64(0x5EED_CAFE);

    let mut gr = Graph {
        tabs: Vec::new(),
        edges: Vec::new(),
        rooted: Vec::new(),
    };
    for i in 0..NODES {
        let t = mm::alloctab(&mut g, EDGES_PER_NODE).expect("node");
        // A unique marker string to detect corruption later.
        let marker = s(&mut g, &format!("node-{}", i));
        tab_set(&mut g, t, TValue::Num(EDGES_PER_NODE as f64 - 1.0), TValue::Gc(marker))
            .unwrap();
        gr.tabs.push(t);
        gr.edges.push([usize::MAX; EDGES_PER_NODE as usize]);
        let rooted = i % 5 == 0;
        if rooted {
            root_value(&mut g, &format!("root-{}", i), TValue::Gc(GCRef::from_ptr(t)));
        }
        gr.rooted.push(rooted);
    }

    // Mutate edges while stepping the collector; every store goes
    // through tab_set, i.e. through the table back-barrier.
    for round in 0..400 {
        let from = rng.random_range(0..NODES);
        let slot = rng.random_range(0..EDGES_PER_NODE - 1);
        if rng.random_bool(0.25) {
            gr.edges[from][slot as usize] = usize::MAX;
            tab_set(&mut g, gr.tabs[from], TValue::Num(slot as f64), TValue::Nil).unwrap();
        } else {
            let to = rng.random_range(0..NODES);
            gr.edges[from][slot as usize] = to;
            tab_set(
                &mut g,
                gr.tabs[from],
                TValue::Num(slot as f64),
                TValue::Gc(GCRef::from_ptr(gr.tabs[to])),
            )
            .unwrap();
        }
        if round % 7 == 0 {
            mm::step(&mut g, main);
        }
    }
    full(&mut g);

    // Color soundness: every node reachable from the roots must still
    // be allocated with intact contents and intact outgoing edges.
    let live = reachable(&gr);
    for i in 0..NODES {
        if !live[i] {
            continue;
        }
        let t = gr.tabs[i];
        assert!(slot_allocated(GCRef::from_ptr(t)), "node {} swept while live", i);
        let marker = s(&mut g, &format!("node-{}", i));
        assert_eq!(
            tab_get(unsafe { &*t }, TValue::Num(EDGES_PER_NODE as f64 - 1.0)),
            Some(TValue::Gc(marker)),
            "node {} marker corrupted",
            i
        );
        for (k, &target) in gr.edges[i].iter().enumerate() {
            let got = tab_get(unsafe { &*t }, TValue::Num(k as f64));
            if target == usize::MAX {
                if k as u32 != EDGES_PER_NODE - 1 {
                    assert_eq!(got, None, "node {} slot {} should be empty", i, k);
                }
            } else {
                assert_eq!(
                    got,
                    Some(TValue::Gc(GCRef::from_ptr(gr.tabs[target]))),
                    "node {} slot {} dangles",
                    i,
                    k
                );
            }
        }
    }
}

#[test]
fn random_graph_with_weak_values_clears_exactly_the_dead() {
    let mut g = new_gc();
    let mut rng = ChaCha8Rng::seed_from_u64(0xBADC_0FFE);

    // Strong nodes, a subset rooted, plus one weak-valued observer table
    // referencing every node. After collection the observer must hold
    // exactly the strongly reachable ones.
    let mode_name = g.gcroot[luna_gc::global::GcRoot::MmMode];
    let observer = mm::alloctab(&mut g, 0).unwrap();
    let omt = mm::alloctab(&mut g, 0).unwrap();
    let v_str = s(&mut g, "v");
    tab_set(&mut g, omt, TValue::Gc(mode_name), TValue::Gc(v_str)).unwrap();
    unsafe { (*observer).metatable = GCRef::from_ptr(omt) };
    root_value(&mut g, "observer", TValue::Gc(GCRef::from_ptr(observer)));

    let mut gr = Graph {
        tabs: Vec::new(),
        edges: Vec::new(),
        rooted: Vec::new(),
    };
    for i in 0..NODES {
        let t = mm::alloctab(&mut g, EDGES_PER_NODE).unwrap();
        gr.tabs.push(t);
        gr.edges.push([usize::MAX; EDGES_PER_NODE as usize]);
        let rooted = rng.random_bool(0.2);
        if rooted {
            root_value(&mut g, &format!("wroot-{}", i), TValue::Gc(GCRef::from_ptr(t)));
        }
        gr.rooted.push(rooted);
        tab_set(
            &mut g,
            observer,
            TValue::Num(i as f64 + 1000.0),
            TValue::Gc(GCRef::from_ptr(t)),
        )
        .unwrap();
    }
    for _ in 0..300 {
        let from = rng.random_range(0..NODES);
        let to = rng.random_range(0..NODES);
        let slot = rng.random_range(0..EDGES_PER_NODE);
        gr.edges[from][slot as usize] = to;
        tab_set(
            &mut g,
            gr.tabs[from],
            TValue::Num(slot as f64),
            TValue::Gc(GCRef::from_ptr(gr.tabs[to])),
        )
        .unwrap();
    }
    full(&mut g);

    let live = reachable(&gr);
    for i in 0..NODES {
        let got = tab_get(unsafe { &*observer }, TValue::Num(i as f64 + 1000.0));
        if live[i] {
            assert_eq!(
                got,
                Some(TValue::Gc(GCRef::from_ptr(gr.tabs[i]))),
                "weak entry for live node {} cleared",
                i
            );
        } else {
            assert_eq!(got, None, "weak entry for dead node {} survived", i);
        }
    }
}

#[test]
fn unreachable_subgraphs_are_reclaimed() {
    let mut g = new_gc();
    let mut rng = ChaCha8Rng::seed_from_u64(42);
    let mut refs = Vec::new();
    // Chains hanging off a single root; cutting the root strands them.
    let root = mm::alloctab(&mut g, 2).unwrap();
    root_value(&mut g, "chain", TValue::Gc(GCRef::from_ptr(root)));
    let mut prev = root;
    for _ in 0..50 {
        let t = mm::alloctab(&mut g, 2).unwrap();
        tab_set(&mut g, prev, TValue::Num(0.0), TValue::Gc(GCRef::from_ptr(t))).unwrap();
        refs.push(GCRef::from_ptr(t));
        prev = t;
    }
    full(&mut g);
    for r in &refs {
        assert!(slot_allocated(*r));
    }
    // Cut the chain at a random link.
    let cut = rng.random_range(0..refs.len() - 1);
    tab_set(&mut g, refs[cut].ptr(), TValue::Num(0.0), TValue::Nil).unwrap();
    full(&mut g);
    full(&mut g);
    for (i, r) in refs.iter().enumerate() {
        assert_eq!(
            slot_allocated(*r),
            i <= cut,
            "link {} (cut at {}) in wrong state",
            i,
            cut
        );
    }
}

//! String-table properties: uniqueness, hid round-trips, length-class
//! routing, table growth and shrink-through-collection.

mod common;

use common::*;
use luna_gc::object::{GCRef, GCstr, TValue};
use luna_gc::strtab::get_strtab;
use luna_gc::util::constants::*;

fn hid_of(s: GCRef) -> u32 {
    unsafe { s.as_ref::<GCstr>() }.hid
}

#[test]
fn identical_bytes_intern_to_one_object() {
    let mut g = new_gc();
    for text in ["", "a", "hello world", "tail\0embedded"] {
        let a = luna_gc::memory_manager::new_string(&mut g, text.as_bytes()).unwrap();
        let b = luna_gc::memory_manager::new_string(&mut g, text.as_bytes()).unwrap();
        assert_eq!(a, b, "{:?} interned twice", text);
        assert_eq!(unsafe { a.as_ref::<GCstr>() }.bytes(), text.as_bytes());
    }
}

#[test]
fn hid_resolves_back_to_its_string() {
    let mut g = new_gc();
    let mut all = Vec::new();
    for i in 0..5000 {
        let st = s(&mut g, &format!("roundtrip-{}", i));
        all.push(st);
    }
    for st in &all {
        let hid = hid_of(*st);
        let entry = get_strtab(&g.str, hid);
        let found = unsafe { (*entry).strs[(hid & 0xF) as usize] };
        assert_eq!(found, *st, "hid {:#x} does not resolve", hid);
        assert_eq!(hid_of(found), hid);
    }
}

#[test]
fn length_classes_route_and_intern() {
    let mut g = new_gc();
    let small = "x".repeat(SMALL_STR_MAX);
    let medium = "y".repeat(SMALL_STR_MAX + 1);
    let medium2 = "y".repeat(4000);
    let huge = "z".repeat(HUGE_STR_THRESHOLD + 1);
    for text in [small, medium, medium2, huge] {
        let a = s(&mut g, &text);
        let b = s(&mut g, &text);
        assert_eq!(a, b);
        let st = unsafe { a.as_ref::<GCstr>() };
        assert_eq!(st.len as usize, text.len());
        assert_eq!(st.bytes(), text.as_bytes());
        let hid = hid_of(a);
        let entry = get_strtab(&g.str, hid);
        assert_eq!(unsafe { (*entry).strs[(hid & 0xF) as usize] }, a);
    }
}

#[test]
fn medium_strings_survive_rooted_collections() {
    let mut g = new_gc();
    let mut kept = Vec::new();
    for i in 0..64 {
        let text = format!("medium-{}-{}", i, "m".repeat(100 + i));
        let st = s(&mut g, &text);
        root_value(&mut g, &format!("med{}", i), TValue::Gc(st));
        kept.push((text, st));
    }
    // Interleave garbage so sweeps have something to free.
    for i in 0..512 {
        let _ = s(&mut g, &format!("garbage-{}-{}", i, "g".repeat(50)));
    }
    full(&mut g);
    full(&mut g);
    for (text, st) in &kept {
        let again = s(&mut g, text);
        assert_eq!(again, *st, "{} lost after collection", text);
        assert_eq!(unsafe { again.as_ref::<GCstr>() }.bytes(), text.as_bytes());
    }
}

#[test]
fn huge_strings_are_collected_when_dropped() {
    let mut g = new_gc();
    let text = "h".repeat(HUGE_STR_THRESHOLD * 2);
    let st = s(&mut g, &text);
    root_value(&mut g, "huge", TValue::Gc(st));
    full(&mut g);
    assert_eq!(s(&mut g, &text), st);
    unroot(&mut g, "huge");
    full(&mut g);
    full(&mut g);
    // The page is gone; re-interning builds a fresh object.
    let num_before = g.str.num;
    let again = s(&mut g, &text);
    assert_eq!(g.str.num, num_before + 1);
    assert_eq!(unsafe { again.as_ref::<GCstr>() }.len as usize, text.len());
}

#[test]
fn table_grows_under_load_and_shrinks_after_collection() {
    let mut g = new_gc();
    let initial_mask = g.str.mask;
    for i in 0..(MIN_STRTAB * 8) {
        let _ = s(&mut g, &format!("load-{}", i));
    }
    assert!(g.str.mask > initial_mask, "primary table never grew");
    // Drop everything and collect twice: the sweep shrinks the table
    // once occupancy falls below a quarter.
    full(&mut g);
    full(&mut g);
    assert!(g.str.mask < MIN_STRTAB as u32 * 8);
    // Survivors still resolve.
    let mode = g.gcroot[luna_gc::global::GcRoot::MmMode];
    let hid = hid_of(mode);
    assert_eq!(
        unsafe { (*get_strtab(&g.str, hid)).strs[(hid & 0xF) as usize] },
        mode
    );
}

//! Weak-table clearing and the ephemeron fixpoint.

mod common;

use common::*;
use luna_gc::memory_manager as mm;
use luna_gc::object::tab::{tab_get, tab_getstr, tab_set};
use luna_gc::object::{GCRef, GCtab, TValue};

/// Build a table whose metatable sets `__mode` to the given string.
fn weak_table(g: &mut luna_gc::GlobalState<MockVM>, mode: &str) -> *mut GCtab {
    let t = mm::alloctab(g, 0).expect("table");
    let mt = mm::alloctab(g, 0).expect("metatable");
    let mode_name = g.gcroot[luna_gc::global::GcRoot::MmMode];
    let mode_str = s(g, mode);
    tab_set(g, mt, TValue::Gc(mode_name), TValue::Gc(mode_str)).unwrap();
    unsafe { (*t).metatable = GCRef::from_ptr(mt) };
    t
}

fn hash_all_nil(t: *mut GCtab) -> bool {
    unsafe {
        if (*t).node.is_zero() {
            return true;
        }
        for i in 0..=(*t).hmask {
            if !(*(*t).node_ptr(i)).val.is_nil() {
                return false;
            }
        }
        true
    }
}

#[test]
fn weak_value_entries_clear_when_value_dies() {
    let mut g = new_gc();
    let w = weak_table(&mut g, "v");
    root_value(&mut g, "w", TValue::Gc(GCRef::from_ptr(w)));

    let obj = mm::alloctab(&mut g, 0).expect("value");
    let key = s(&mut g, "a");
    tab_set(&mut g, w, TValue::Gc(key), TValue::Gc(GCRef::from_ptr(obj))).unwrap();

    full(&mut g);
    // Value was reachable only through the weak table: entry cleared.
    let key = s(&mut g, "a");
    assert_eq!(tab_getstr(unsafe { &*w }, key), None);
}

#[test]
fn weak_value_entries_survive_while_value_lives() {
    let mut g = new_gc();
    let w = weak_table(&mut g, "v");
    root_value(&mut g, "w2", TValue::Gc(GCRef::from_ptr(w)));

    let obj = mm::alloctab(&mut g, 0).expect("value");
    root_value(&mut g, "strong", TValue::Gc(GCRef::from_ptr(obj)));
    let key = s(&mut g, "b");
    tab_set(&mut g, w, TValue::Gc(key), TValue::Gc(GCRef::from_ptr(obj))).unwrap();

    full(&mut g);
    let key = s(&mut g, "b");
    assert_eq!(
        tab_getstr(unsafe { &*w }, key),
        Some(TValue::Gc(GCRef::from_ptr(obj)))
    );
}

#[test]
fn ephemeron_cycle_is_collected() {
    let mut g = new_gc();
    let t = weak_table(&mut g, "k");
    root_value(&mut g, "eph", TValue::Gc(GCRef::from_ptr(t)));

    // t[k] = v where v -> k and nothing else reaches k: both must die
    // and the entry must clear.
    let k = mm::alloctab(&mut g, 0).expect("key");
    let v = mm::alloctab(&mut g, 2).expect("value");
    tab_set(&mut g, v, TValue::Num(0.0), TValue::Gc(GCRef::from_ptr(k))).unwrap();
    tab_set(&mut g, t, TValue::Gc(GCRef::from_ptr(k)), TValue::Gc(GCRef::from_ptr(v))).unwrap();
    let kref = GCRef::from_ptr(k);
    let vref = GCRef::from_ptr(v);

    full(&mut g);
    assert!(hash_all_nil(t), "ephemeron entry not cleared");
    assert!(!slot_allocated(kref));
    assert!(!slot_allocated(vref));
}

#[test]
fn ephemeron_value_kept_while_key_reachable() {
    let mut g = new_gc();
    let t = weak_table(&mut g, "k");
    root_value(&mut g, "eph2", TValue::Gc(GCRef::from_ptr(t)));

    let k = mm::alloctab(&mut g, 0).expect("key");
    let v = mm::alloctab(&mut g, 0).expect("value");
    root_value(&mut g, "key-root", TValue::Gc(GCRef::from_ptr(k)));
    tab_set(&mut g, t, TValue::Gc(GCRef::from_ptr(k)), TValue::Gc(GCRef::from_ptr(v))).unwrap();

    full(&mut g);
    // The value's only reference is the ephemeron entry, but the key is
    // independently reachable, so the value must survive.
    assert!(slot_allocated(GCRef::from_ptr(v)));
    assert_eq!(
        tab_get(unsafe { &*t }, TValue::Gc(GCRef::from_ptr(k))),
        Some(TValue::Gc(GCRef::from_ptr(v)))
    );
}

#[test]
fn fully_weak_table_drops_both_sides() {
    let mut g = new_gc();
    let t = weak_table(&mut g, "kv");
    root_value(&mut g, "kv", TValue::Gc(GCRef::from_ptr(t)));
    let k = mm::alloctab(&mut g, 0).expect("key");
    let v = mm::alloctab(&mut g, 0).expect("value");
    tab_set(&mut g, t, TValue::Gc(GCRef::from_ptr(k)), TValue::Gc(GCRef::from_ptr(v))).unwrap();
    full(&mut g);
    assert!(hash_all_nil(t));
    assert!(!slot_allocated(GCRef::from_ptr(k)));
    assert!(!slot_allocated(GCRef::from_ptr(v)));
}

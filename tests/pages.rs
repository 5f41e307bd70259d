//! Page accounting: blob-reap compaction and shutdown leak-freedom.

mod common;

use std::sync::atomic::Ordering;

use common::*;
use luna_gc::memory_manager as mm;
use luna_gc::object::tab::tab_set;
use luna_gc::object::{GCRef, TValue};
use luna_gc::util::constants::*;

#[test]
fn blob_reap_compacts_sparse_pages() {
    let mut g = new_gc();
    // Fill the current blob page so the table's array lands on a fresh
    // one, then strand that page with garbage around it.
    let _ = mm::newblob(&mut g, BLOB_HUGE_THRESHOLD - 64).unwrap();
    let t = mm::alloctab(&mut g, 256).expect("table"); // 4 KiB array blob
    root_value(&mut g, "reap", TValue::Gc(GCRef::from_ptr(t)));
    let old_array = unsafe { (*t).array };
    // Push allocation onto further pages so the sparse page stops being
    // the current one.
    for _ in 0..3 {
        let _ = mm::newblob(&mut g, BLOB_HUGE_THRESHOLD - 64).unwrap();
    }

    // Cycle 1: the array's page ends up far below the reap threshold
    // and gets tagged (empty garbage pages are released outright).
    full(&mut g);
    let pages_before = g.gc.bloblist.len();
    // Cycle 2: the mark pass copies the payload out; with its usage back
    // at zero the page is released by the blob sweep.
    full(&mut g);
    let new_array = unsafe { (*t).array };
    assert_ne!(old_array, new_array, "sparse blob page was never compacted");
    assert!(g.gc.bloblist.len() < pages_before, "reaped page not released");
    // The moved array still holds its contents.
    tab_set(&mut g, t, TValue::Num(7.0), TValue::True).unwrap();
    assert_eq!(
        luna_gc::object::tab::tab_get(unsafe { &*t }, TValue::Num(7.0)),
        Some(TValue::True)
    );
}

#[test]
fn shutdown_returns_every_page() {
    PAGES_LIVE.store(0, Ordering::SeqCst);
    {
        let mut g = new_counting_gc();
        // Touch every allocation path: strings of all classes, tables
        // with blob and colocated arrays, functions, upvalues, userdata
        // with raw buffers, threads, prototypes, traces, cdata, huge
        // blobs.
        for i in 0..400 {
            let st = s(&mut g, &format!("leak-{}-{}", i, "x".repeat(i % 120)));
            if i % 3 == 0 {
                root_value(&mut g, &format!("keep-{}", i), TValue::Gc(st));
            }
        }
        let _ = s(&mut g, &"h".repeat(HUGE_STR_THRESHOLD + 5));
        for i in 0..64 {
            let t = mm::alloctab(&mut g, (i % 7) * 50).unwrap();
            if i % 2 == 0 {
                root_value(&mut g, &format!("tab-{}", i), TValue::Gc(GCRef::from_ptr(t)));
            }
        }
        let ud = mm::allocudata(&mut g, 4096).unwrap();
        mm::registergc_udata(&mut g, ud);
        let _ = mm::allocuv(&mut g).unwrap();
        let _ = mm::allocfunc(&mut g, 64).unwrap();
        let th = mm::thread_new(&mut g).unwrap();
        root_value(&mut g, "th", TValue::Gc(GCRef::from_ptr(th)));
        let chunk = s(&mut g, "test.luna");
        let _ = mm::proto_new(&mut g, 4, chunk).unwrap();
        let _ = mm::trace_new(&mut g, 2).unwrap();
        let _ = mm::cdata_new(&mut g, 17, 64).unwrap();
        let _ = mm::newblob(&mut g, BLOB_HUGE_THRESHOLD + 4096).unwrap();

        full(&mut g);
        full(&mut g);
        // Box drop runs freeall + page teardown.
    }
    assert_eq!(
        PAGES_LIVE.load(Ordering::SeqCst),
        0,
        "page provider balance nonzero after shutdown"
    );
}

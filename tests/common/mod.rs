//! Shared fixture for the collector integration tests: a mock host VM
//! with observable finalizer behavior and a counting page provider.
#![allow(dead_code)]

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use luna_gc::global::GlobalState;
use luna_gc::memory_manager as mm;
use luna_gc::object::tab::tab_set;
use luna_gc::object::{GCRef, GCtab, TValue};
use luna_gc::util::memory::{PageProvider, SysAlloc, SysPages};
use luna_gc::util::Address;
use luna_gc::vm::{FinalizerError, VMBinding};
use luna_gc::GcOptions;

pub static FINALIZER_RUNS: AtomicUsize = AtomicUsize::new(0);
pub static FAIL_NEXT_FINALIZER: AtomicBool = AtomicBool::new(false);
pub static FINALIZER_ERRORS: AtomicUsize = AtomicUsize::new(0);

pub struct MockVM;

impl VMBinding for MockVM {
    fn invoke_finalizer(
        _g: &mut GlobalState<Self>,
        _mo: TValue,
        _o: GCRef,
    ) -> Result<(), FinalizerError> {
        FINALIZER_RUNS.fetch_add(1, Ordering::SeqCst);
        if FAIL_NEXT_FINALIZER.swap(false, Ordering::SeqCst) {
            return Err(FinalizerError {
                message: "boom".into(),
            });
        }
        Ok(())
    }

    fn finalizer_error(_g: &mut GlobalState<Self>, _err: FinalizerError) {
        FINALIZER_ERRORS.fetch_add(1, Ordering::SeqCst);
    }
}

pub static PAGES_LIVE: AtomicUsize = AtomicUsize::new(0);

/// Page provider that balances allocations against frees so shutdown
/// leaks show up as a nonzero residue.
pub struct CountingPages(pub SysPages);

impl PageProvider for CountingPages {
    fn alloc(&mut self) -> Address {
        let p = self.0.alloc();
        if !p.is_zero() {
            PAGES_LIVE.fetch_add(1, Ordering::SeqCst);
        }
        p
    }
    fn alloc_huge(&mut self, bytes: usize) -> Address {
        let p = self.0.alloc_huge(bytes);
        if !p.is_zero() {
            PAGES_LIVE.fetch_add(1, Ordering::SeqCst);
        }
        p
    }
    fn free(&mut self, page: Address) {
        PAGES_LIVE.fetch_sub(1, Ordering::SeqCst);
        self.0.free(page)
    }
    fn free_huge(&mut self, page: Address, bytes: usize) {
        PAGES_LIVE.fetch_sub(1, Ordering::SeqCst);
        self.0.free_huge(page, bytes)
    }
    fn realloc_huge(&mut self, page: Address, osz: usize, nsz: usize) -> Address {
        let p = self.0.alloc_huge(nsz);
        if p.is_zero() {
            return p;
        }
        PAGES_LIVE.fetch_add(1, Ordering::SeqCst);
        unsafe {
            std::ptr::copy_nonoverlapping::<u8>(page.to_ptr(), p.to_mut_ptr(), osz.min(nsz));
        }
        self.free_huge(page, osz);
        p
    }
}

pub fn new_gc() -> Box<GlobalState<MockVM>> {
    let _ = env_logger::builder().is_test(true).try_init();
    GlobalState::new(
        GcOptions::default(),
        Box::new(SysPages),
        Box::new(SysAlloc),
    )
    .expect("collector init")
}

pub fn new_counting_gc() -> Box<GlobalState<MockVM>> {
    let _ = env_logger::builder().is_test(true).try_init();
    GlobalState::new(
        GcOptions::default(),
        Box::new(CountingPages(SysPages)),
        Box::new(SysAlloc),
    )
    .expect("collector init")
}

/// Run a full maximal collection on the main thread.
pub fn full(g: &mut GlobalState<MockVM>) {
    let main = g.mainthread;
    mm::fullgc(g, main, true);
}

/// Intern a string.
pub fn s(g: &mut GlobalState<MockVM>, text: &str) -> GCRef {
    mm::new_string(g, text.as_bytes()).expect("intern")
}

/// The registry table (a root).
pub fn registry(g: &GlobalState<MockVM>) -> *mut GCtab {
    match g.registry {
        TValue::Gc(t) => t.ptr(),
        _ => panic!("registry is not a table"),
    }
}

/// Root a value under a string key in the registry.
pub fn root_value(g: &mut GlobalState<MockVM>, key: &str, v: TValue) {
    let k = s(g, key);
    let reg = registry(g);
    tab_set(g, reg, TValue::Gc(k), v).expect("registry set");
}

/// Drop a previously rooted value.
pub fn unroot(g: &mut GlobalState<MockVM>, key: &str) {
    let k = s(g, key);
    let reg = registry(g);
    tab_set(g, reg, TValue::Gc(k), TValue::Nil).expect("registry clear");
}

/// Is this arena-allocated object's slot still allocated (its free bit
/// clear)? Usable for liveness probes right after a full collection.
pub fn slot_allocated(o: GCRef) -> bool {
    use luna_gc::util::constants::ARENA_SIZE;
    let base = o.addr().align_down(ARENA_SIZE);
    let a = base.to_mut_ptr::<luna_gc::policy::arena::GCAcommon>();
    let layout = match o.gct() {
        luna_gc::object::GcKind::Tab => luna_gc::policy::arena::TAB_LAYOUT,
        luna_gc::object::GcKind::Func => luna_gc::policy::arena::FUNC_LAYOUT,
        luna_gc::object::GcKind::Upval => luna_gc::policy::arena::UV_LAYOUT,
        luna_gc::object::GcKind::Udata => luna_gc::policy::arena::UDATA_LAYOUT,
        _ => panic!("not a bitmap arena kind"),
    };
    let idx = layout.idx_of(o.addr());
    unsafe { !(*a).free.test(idx) }
}

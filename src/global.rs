//! The single owner of all collector state: arena lists, gray queues,
//! the blob region, the string tables, accounting and pacing.

use enum_map::{Enum, EnumMap};
use std::marker::PhantomData;
use strum_macros::Display;

use crate::object::{GCRef, TValue};
use crate::policy::arena::ArenaHdr;
use crate::policy::blob::GCAblob;
use crate::strtab::StrState;
use crate::util::constants::*;
use crate::util::memory::{PageProvider, RawAlloc};
use crate::util::options::GcOptions;
use crate::util::Address;
use crate::vm::VMBinding;
use crate::GcError;

/// Memory sizes tracked by the accounting fields.
pub type GCSize = usize;

/// Collector phases. Ordering matters: everything after `Atomic` is a
/// sweep-or-later phase.
#[derive(Debug, Display, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum GcPhase {
    Pause,
    Propagate,
    Atomic,
    Sweep,
    SweepBlob,
    SweepSmallStr,
    SweepStr,
    SweepHugeStr,
    SweepFunc,
    SweepTab,
    SweepFinTab,
    SweepUv,
    SweepUdata,
    FinalizeArena,
    Finalize,
}

/// Well-known roots re-marked at cycle start and atomic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Enum)]
pub enum GcRoot {
    /// The interned "__mode" metamethod name.
    MmMode,
    /// The interned "__gc" metamethod name.
    MmGc,
    /// The FFI finalizer table (weak cdata keys).
    FfiFin,
    /// Base metatable for strings.
    BasemtStr,
    /// Base metatable for userdata.
    BasemtUdata,
}

/// The arena type lists the collector maintains. `Tab` and `FinTab`
/// share an object kind but live on separate lists so presweep only
/// scans tables that can have finalizers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArenaKind {
    Tab,
    FinTab,
    Func,
    Uv,
    Udata,
    StrSmall,
    StrMed,
}

/// Head (the primary allocation arena) and freelist of one arena kind.
pub struct TypeList {
    pub head: *mut ArenaHdr,
    pub free: *mut ArenaHdr,
}

impl TypeList {
    const fn empty() -> TypeList {
        TypeList {
            head: std::ptr::null_mut(),
            free: std::ptr::null_mut(),
        }
    }
}

/// Everything the collector proper mutates.
pub struct GcState {
    pub state: GcPhase,

    // Accounting.
    /// Total managed bytes (arenas' live estimate + raw allocations).
    pub total: GCSize,
    /// Raw-allocated bytes.
    pub malloc: GCSize,
    /// Bytes found live by arena traversal this cycle.
    pub accum: GCSize,
    /// String bytes counted by the current sweep.
    pub strings: GCSize,
    /// String bytes as of the previous cycle.
    pub old_strings: GCSize,
    pub estimate: GCSize,
    pub debt: GCSize,
    pub threshold: GCSize,
    pub stepmul: usize,
    pub pause: usize,
    pub minor: bool,

    // Colors and sweep parity.
    pub currentblack: u8,
    pub currentblackgray: u8,
    pub safecolor: u8,
    pub currentsweep: u8,

    // Object lists (raw-allocated kinds).
    pub root: GCRef,
    pub gray: GCRef,
    pub grayagain: GCRef,
    pub grayagain_th: GCRef,
    pub weak: GCRef,
    pub ephemeron: GCRef,
    pub fin_list: GCRef,
    pub mmudata: GCRef,
    pub nocdatafin: bool,

    // Arena gray queue.
    pub gray_head: *mut ArenaHdr,
    pub gray_tail: *mut ArenaHdr,

    // Sweep cursors.
    /// Arena cursor for the per-kind sweep states.
    pub sweep: *mut ArenaHdr,
    /// Previous object in the root-list sweep (null = at list head).
    pub sweep_prev: GCRef,
    /// Previous huge-string header (null = at chain head).
    pub sweep_huge_prev: *mut ArenaHdr,

    // Arena lists.
    pub tab: TypeList,
    pub fintab: TypeList,
    pub func: TypeList,
    pub uv: TypeList,
    pub udata: TypeList,
    pub str_small: TypeList,
    pub str_med: TypeList,
    /// Huge strings, single-linked through `hdr.gray`.
    pub str_huge: *mut ArenaHdr,

    // Blob region.
    pub bloblist: Vec<*mut GCAblob>,
    pub bloblist_usage: Vec<u32>,
    pub blob_generic: *mut GCAblob,
    /// Highest blob id the next blob sweep will visit.
    pub bloblist_sweep: i32,
}

impl GcState {
    pub fn list(&mut self, k: ArenaKind) -> &mut TypeList {
        match k {
            ArenaKind::Tab => &mut self.tab,
            ArenaKind::FinTab => &mut self.fintab,
            ArenaKind::Func => &mut self.func,
            ArenaKind::Uv => &mut self.uv,
            ArenaKind::Udata => &mut self.udata,
            ArenaKind::StrSmall => &mut self.str_small,
            ArenaKind::StrMed => &mut self.str_med,
        }
    }

    /// Is this object white (not reached this cycle)?
    pub fn is_white(&self, o: GCRef) -> bool {
        o.gcflags() & self.currentblackgray == 0
    }

    pub fn is_black(&self, o: GCRef) -> bool {
        o.gcflags() & self.currentblack != 0
    }

    pub fn is_gray(&self, o: GCRef) -> bool {
        o.gcflags() & GC_GRAY != 0
    }

    /// Turn a traversed object black for the current cycle.
    pub fn gray2black(&self, o: GCRef) {
        o.set_gcflags((o.gcflags() & !GC_COLORS) | self.currentblack);
    }
}

/// The collector bound to one host VM. All public operations take this
/// by mutable reference; nothing here is thread-safe, by design.
pub struct GlobalState<VM: VMBinding> {
    pub gc: GcState,
    pub str: StrState,
    pub options: GcOptions,

    /// Registry value, always a root.
    pub registry: TValue,
    pub gcroot: EnumMap<GcRoot, GCRef>,
    pub mainthread: GCRef,
    /// The currently running thread.
    pub cur_l: GCRef,

    /// Nonzero while JIT-compiled code is running; forbids the atomic
    /// phase and blob moves.
    pub jit_base: Address,
    /// The trace currently being recorded (a GC root until anchored).
    pub cur_trace: GCRef,
    /// Trace registry indexed by trace number; slot 0 unused.
    pub traces: Vec<GCRef>,

    pub pages: Box<dyn PageProvider>,
    pub allocf: Box<dyn RawAlloc>,

    pub(crate) _vm: PhantomData<VM>,
}

impl<VM: VMBinding> GlobalState<VM> {
    /// Create a collector: primary arenas for every kind, the blob
    /// region, the interning table, the main thread and the fixed roots.
    pub fn new(
        options: GcOptions,
        pages: Box<dyn PageProvider>,
        allocf: Box<dyn RawAlloc>,
    ) -> Result<Box<Self>, GcError> {
        let mut g = Box::new(GlobalState {
            gc: GcState {
                state: GcPhase::Pause,
                total: 0,
                malloc: 0,
                accum: 0,
                strings: 0,
                old_strings: 0,
                estimate: 0,
                debt: 0,
                threshold: GCSTEPSIZE * 4,
                stepmul: options.stepmul,
                pause: options.pause,
                minor: options.minor,
                currentblack: GC_BLACK0,
                currentblackgray: GC_BLACK0 | GC_GRAY,
                safecolor: GC_BLACK0 | GC_GRAY | GC_SFIXED,
                currentsweep: ARENA_SWEEP0,
                root: GCRef::NULL,
                gray: GCRef::NULL,
                grayagain: GCRef::NULL,
                grayagain_th: GCRef::NULL,
                weak: GCRef::NULL,
                ephemeron: GCRef::NULL,
                fin_list: GCRef::NULL,
                mmudata: GCRef::NULL,
                nocdatafin: true,
                gray_head: std::ptr::null_mut(),
                gray_tail: std::ptr::null_mut(),
                sweep: std::ptr::null_mut(),
                sweep_prev: GCRef::NULL,
                sweep_huge_prev: std::ptr::null_mut(),
                tab: TypeList::empty(),
                fintab: TypeList::empty(),
                func: TypeList::empty(),
                uv: TypeList::empty(),
                udata: TypeList::empty(),
                str_small: TypeList::empty(),
                str_med: TypeList::empty(),
                str_huge: std::ptr::null_mut(),
                bloblist: Vec::new(),
                bloblist_usage: Vec::new(),
                blob_generic: std::ptr::null_mut(),
                bloblist_sweep: -1,
            },
            str: StrState::new(options.strtab_size),
            options,
            registry: TValue::Nil,
            gcroot: EnumMap::default(),
            mainthread: GCRef::NULL,
            cur_l: GCRef::NULL,
            jit_base: Address::ZERO,
            cur_trace: GCRef::NULL,
            traces: vec![GCRef::NULL],
            pages,
            allocf,
            _vm: PhantomData,
        });
        crate::policy::blob::init_blob_region(&mut g)?;
        crate::policy::alloc::init_primary_arenas(&mut g)?;
        crate::memory_manager::init_roots(&mut g)?;
        debug!(
            "collector initialized: total={} threshold={}",
            g.gc.total, g.gc.threshold
        );
        Ok(g)
    }

    /// Call the pluggable allocator to allocate or resize a raw
    /// fragment, with accounting.
    pub fn mem_realloc(
        &mut self,
        p: Address,
        osz: usize,
        nsz: usize,
    ) -> Result<Address, GcError> {
        debug_assert_eq!(osz == 0, p.is_zero(), "realloc API violation");
        let p = self.allocf.raw_alloc(p, osz, nsz);
        if p.is_zero() && nsz > 0 {
            return Err(GcError::OutOfMemory);
        }
        self.gc.total = self.gc.total.saturating_sub(osz) + nsz;
        self.gc.malloc = self.gc.malloc.saturating_sub(osz) + nsz;
        Ok(p)
    }

    /// Free a raw fragment.
    pub fn mem_free(&mut self, p: Address, osz: usize) {
        if !p.is_zero() {
            let r = self.allocf.raw_alloc(p, osz, 0);
            debug_assert!(r.is_zero());
            self.gc.total = self.gc.total.saturating_sub(osz);
            self.gc.malloc = self.gc.malloc.saturating_sub(osz);
        }
    }

    /// Resize a growable vector, doubling with clamping.
    pub fn mem_grow(
        &mut self,
        p: Address,
        szp: &mut usize,
        lim: usize,
        esz: usize,
    ) -> Result<Address, GcError> {
        let mut sz = (*szp) << 1;
        if sz < MIN_VECSZ {
            sz = MIN_VECSZ;
        }
        if sz > lim {
            sz = lim;
        }
        let p = self.mem_realloc(p, *szp * esz, sz * esz)?;
        *szp = sz;
        Ok(p)
    }

    /// Debug predicate: may this reference already be dead? Nothing is
    /// dead before atomic completes; arena objects are live when flagged
    /// with the safe color or sitting in an unswept arena.
    pub fn checkdead(&self, o: GCRef) -> bool {
        if self.gc.state <= GcPhase::Atomic {
            return false;
        }
        if o.gct().is_arena_kind() {
            if self.gc.safecolor & o.gcflags() & !GC_SIZE_BITS != 0 {
                return false;
            }
            let a = crate::policy::arena::arena_of(o.addr());
            unsafe { (*a).flags & self.gc.currentsweep == 0 }
        } else {
            if self.gc.safecolor & o.gcflags() != 0 {
                return false;
            }
            // List objects can only be dead while their sweep runs.
            self.gc.state == GcPhase::Sweep
        }
    }
}

impl<VM: VMBinding> Drop for GlobalState<VM> {
    fn drop(&mut self) {
        crate::sweep::free_everything(self);
    }
}

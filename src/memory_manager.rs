//! The collector's public surface: allocation entry points for every
//! object kind, the stepping and full-collection calls, barriers and the
//! finalizer hooks. Hosts drive the collector exclusively through this
//! module (and the re-exports in the crate root).

use std::mem;

use crate::global::{GcRoot, GlobalState};
use crate::object::tab::tab_set;
use crate::object::*;
use crate::strtab::str_new;
use crate::util::constants::*;
use crate::util::Address;
use crate::vm::VMBinding;
use crate::GcError;

pub use crate::plan::barriers::{barrierf, barriert, barriertrace, barrieruv};
pub use crate::plan::{fullgc, step, step_fixtop, step_jit, StepResult};

pub use crate::finalize::{
    finalize_cdata, finalize_udata, registergc_udata, separateudata, set_cdata_finalizer,
};
pub use crate::policy::alloc::{alloctab, alloctabempty_gc, allocfunc, allocudata, allocuv};
pub use crate::policy::blob::{newblob, reallocblob};
pub use crate::sweep::gc_freeall as freeall;

/// Step the collector if allocation debt has crossed the threshold.
pub fn check_gc<VM: VMBinding>(g: &mut GlobalState<VM>, l: GCRef) {
    if g.gc.total >= g.gc.threshold {
        step(g, l);
    }
}

/// Allocate a raw GC object of one of the list kinds and chain it on
/// the root list, white.
pub fn newgco<VM: VMBinding>(g: &mut GlobalState<VM>, size: usize) -> Result<Address, GcError> {
    let o = g.mem_realloc(Address::ZERO, 0, size)?;
    unsafe {
        let hdr = o.to_mut_ptr::<GCoHdr>();
        (*hdr).gcflags = 0;
        (*hdr).gct = 0;
        (*hdr)._pad = [0; 6];
        (*hdr).nextgc = g.gc.root;
        (*hdr).gclist = GCRef::NULL;
    }
    g.gc.root = GCRef::from_addr(o);
    Ok(o)
}

/// Allocate a string object (uninterned); dispatches on length class.
pub fn allocstr<VM: VMBinding>(g: &mut GlobalState<VM>, len: usize) -> Result<*mut GCstr, GcError> {
    if len > SMALL_STR_MAX {
        if len > HUGE_STR_THRESHOLD {
            return crate::policy::huge::allocstr_huge(g, len);
        }
        return crate::policy::medium::allocstr_med(g, len);
    }
    crate::policy::alloc::allocstr_small(g)
}

const INITIAL_STACK: u32 = 64;

/// Create a thread with a fresh stack.
pub fn thread_new<VM: VMBinding>(g: &mut GlobalState<VM>) -> Result<*mut GCthread, GcError> {
    let stack = g.mem_realloc(
        Address::ZERO,
        0,
        GCthread::stack_bytes(INITIAL_STACK),
    )?;
    for i in 0..INITIAL_STACK {
        unsafe { (stack + i as usize * mem::size_of::<TValue>()).store(TValue::Nil) };
    }
    let o = newgco(g, mem::size_of::<GCthread>())?;
    let th = o.to_mut_ptr::<GCthread>();
    unsafe {
        (*th).gct = GcKind::Thread as u8;
        (*th).status = 0;
        (*th).env = GCRef::NULL;
        (*th).stack = stack;
        (*th).stacksize = INITIAL_STACK;
        (*th).top = 1;
        (*th).base = 1;
        (*th)._pad2 = 0;
        (*th).openupval = GCRef::NULL;
    }
    Ok(th)
}

/// Create a prototype with room for `nkgc` collectible constants.
pub fn proto_new<VM: VMBinding>(
    g: &mut GlobalState<VM>,
    nkgc: u32,
    chunkname: GCRef,
) -> Result<*mut GCproto, GcError> {
    let size = GCproto::alloc_size(nkgc);
    let o = newgco(g, size)?;
    let pt = o.to_mut_ptr::<GCproto>();
    unsafe {
        (*pt).gct = GcKind::Proto as u8;
        (*pt).chunkname = chunkname;
        (*pt).sizekgc = nkgc;
        (*pt).sizept = size as u32;
        (*pt).trace = 0;
        (*pt)._pad2 = 0;
        for i in 0..nkgc as usize {
            (*pt).kgc_slot(i).store(GCRef::NULL);
        }
    }
    Ok(pt)
}

/// Create a trace with room for `nk` collectible constants and register
/// it; returns the trace, its number is in the object.
pub fn trace_new<VM: VMBinding>(g: &mut GlobalState<VM>, nk: u32) -> Result<*mut GCtrace, GcError> {
    let size = GCtrace::alloc_size(nk);
    let o = newgco(g, size)?;
    let t = o.to_mut_ptr::<GCtrace>();
    let traceno = g.traces.len() as u32;
    unsafe {
        (*t).gct = GcKind::Trace as u8;
        (*t).startpt = GCRef::NULL;
        (*t).traceno = traceno;
        (*t).link = 0;
        (*t).nextroot = 0;
        (*t).nextside = 0;
        (*t).nk = nk;
        (*t)._pad2 = 0;
        for i in 0..nk as usize {
            (*t).kgc_slot(i).store(GCRef::NULL);
        }
    }
    g.traces.push(GCRef::from_addr(o));
    Ok(t)
}

/// Create a cdata payload of `len` bytes.
pub fn cdata_new<VM: VMBinding>(
    g: &mut GlobalState<VM>,
    ctypeid: u16,
    len: u32,
) -> Result<*mut GCcdata, GcError> {
    let o = newgco(g, GCcdata::alloc_size(len))?;
    let cd = o.to_mut_ptr::<GCcdata>();
    unsafe {
        (*cd).gct = GcKind::Cdata as u8;
        (*cd).ctypeid = ctypeid;
        (*cd)._pad = 0;
        (*cd).len = len;
        (*cd)._pad2 = 0;
    }
    Ok(cd)
}

/// Intern a string (see the string-table module).
pub fn new_string<VM: VMBinding>(g: &mut GlobalState<VM>, bytes: &[u8]) -> Result<GCRef, GcError> {
    str_new(g, bytes)
}

/// Create the fixed roots: the main thread and its environment, the
/// registry, the metamethod-name strings and the FFI finalizer table.
pub fn init_roots<VM: VMBinding>(g: &mut GlobalState<VM>) -> Result<(), GcError> {
    let main = thread_new(g)?;
    let main_ref = GCRef::from_ptr(main);
    main_ref.flags_or(GC_SFIXED);
    g.mainthread = main_ref;
    g.cur_l = main_ref;

    let env = crate::policy::alloc::alloctab(g, 0)?;
    unsafe { (*main).env = GCRef::from_ptr(env) };
    let registry = crate::policy::alloc::alloctab(g, 0)?;
    g.registry = TValue::Gc(GCRef::from_ptr(registry));

    let mode = str_new(g, b"__mode")?;
    crate::strtab::str_fix(g, mode);
    g.gcroot[GcRoot::MmMode] = mode;
    let gcname = str_new(g, b"__gc")?;
    crate::strtab::str_fix(g, gcname);
    g.gcroot[GcRoot::MmGc] = gcname;

    // The FFI finalizer table: weak cdata keys via a __mode = "k"
    // metatable; entries are cleared by the finalizer pipeline.
    let k = str_new(g, b"k")?;
    crate::strtab::str_fix(g, k);
    let mt = crate::policy::alloc::alloctab(g, 0)?;
    let fin = crate::policy::alloc::alloctab(g, 0)?;
    tab_set(g, mt, TValue::Gc(mode), TValue::Gc(k))?;
    unsafe { (*fin).metatable = GCRef::from_ptr(mt) };
    g.gcroot[GcRoot::FfiFin] = GCRef::from_ptr(fin);
    Ok(())
}

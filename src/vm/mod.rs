//! The host-VM binding: the hooks the collector needs from the language
//! implementation. Modeled as static methods on a binding type so a
//! collector instance is parameterized by exactly one host.

use crate::global::GlobalState;
use crate::object::{GCRef, TValue};

/// A runtime error raised inside user finalizer code. Captured by the
/// collector, delivered to [`VMBinding::finalizer_error`], then dropped;
/// the object counts as finalized either way.
#[derive(Debug)]
pub struct FinalizerError {
    pub message: String,
}

/// Static hooks into the host VM.
pub trait VMBinding: Sized + 'static {
    /// Run the finalizer metamethod `mo` with `o` as its argument under
    /// a protected call. The collector has already parked itself; the
    /// host may allocate and may resurrect `o`.
    fn invoke_finalizer(
        g: &mut GlobalState<Self>,
        mo: TValue,
        o: GCRef,
    ) -> Result<(), FinalizerError>;

    /// Error sink for failed finalizers (the ERRFIN event).
    fn finalizer_error(_g: &mut GlobalState<Self>, err: FinalizerError) {
        warn!("error in finalizer (ignored): {}", err.message);
    }
}

/// A binding for hosts with no runnable finalizer code; `__gc` entries
/// become no-ops.
pub struct NullVM;

impl VMBinding for NullVM {
    fn invoke_finalizer(
        _g: &mut GlobalState<Self>,
        _mo: TValue,
        _o: GCRef,
    ) -> Result<(), FinalizerError> {
        Ok(())
    }
}

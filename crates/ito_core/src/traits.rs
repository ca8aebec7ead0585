use crate::error::Result;
use crate::model::Model;
use num_traits::{Float, FromPrimitive};
use std::fmt::Debug;

/// A trait for types that expressions can be evaluated over.
/// Must support basic arithmetic, debug printing, and conversion from f64.
pub trait Scalar: Float + FromPrimitive + Debug + 'static {}

impl<T: Float + FromPrimitive + Debug + 'static> Scalar for T {}

/// Lifts an `f64` constant into any scalar type.
/// Both `f64` and `HyperDual` accept every value, so the NaN fallback is never hit
/// for the types used by this crate.
pub(crate) fn lift<T: Scalar>(value: f64) -> T {
    T::from_f64(value).unwrap_or_else(T::nan)
}

/// How the scheduler treats a failing operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperationKind {
    /// Sampling, fitting and stepping. A failure stops the run.
    Core,
    /// Side-effecting checks (plots, reports). A failure is logged and skipped.
    Diagnostic,
}

/// A unit of work the scheduler can fire on a tick.
pub trait Operation {
    /// Name used in logs, run reports and error context.
    fn name(&self) -> &str;

    fn kind(&self) -> OperationKind {
        OperationKind::Core
    }

    /// Runs the operation to completion against the model.
    fn run(&mut self, model: &mut Model) -> Result<()>;
}

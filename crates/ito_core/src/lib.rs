//! The `ito_core` crate is a numerical engine for continuous-time stochastic
//! equilibrium models. Unknown equilibrium functions are represented by
//! feed-forward approximators and fitted toward the fixed point of a
//! Bellman-style residual on Monte-Carlo batches.
//!
//! Key components:
//! - **Expressions**: `Expr` graphs over state variables, shocks and approximators,
//!   compiled to bytecode for a stack VM that runs over `f64` or `HyperDual`.
//! - **State space**: Itô dynamics `dX = μ dt + Σ b_k dZ_k` per variable.
//! - **Operators**: drift, variance and covariance via Itô's lemma and
//!   second-order forward-mode autodiff.
//! - **Sampler / Fit / Euler–Maruyama**: operations over the current batch.
//! - **Scheduler**: programs of operations fired every N ticks under a budget.
//! - **Checkpoints**: versioned JSON snapshots of approximators and ticks.
pub mod autodiff;
pub mod batch;
pub mod checkpoint;
pub mod equation_engine;
pub mod error;
mod evaluator;
pub mod expr;
pub mod fit;
pub mod model;
pub mod network;
mod operators;
pub mod sampler;
pub mod scheduler;
pub mod solvers;
pub mod state_space;
pub mod traits;

pub use batch::Batch;
pub use checkpoint::{Checkpoint, CheckpointStore};
pub use error::{EngineError, ErrorCategory, Result};
pub use expr::{Expr, Shock, Var};
pub use fit::{Fit, FitReport};
pub use model::{EngineSettings, Model};
pub use network::{Activation, AdamSettings, Network};
pub use sampler::{Bounds, Sampler, SamplingDistribution};
pub use scheduler::{
    parse_duration, Budget, Diagnostic, Program, RunReport, Scheduler, SchedulerState,
};
pub use solvers::EulerMaruyama;
pub use traits::{Operation, OperationKind};

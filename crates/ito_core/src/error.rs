//! Error taxonomy for the engine.
//!
//! Structural errors come from malformed model definitions and are raised while
//! the graph is being built. Configuration errors are raised before a run
//! starts. Numerical errors stop the scheduler when they occur in a core
//! operation. Diagnostic errors are logged and never abort a run.

use thiserror::Error;

/// Coarse classification used by the scheduler and by callers deciding how to react.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    Structural,
    Configuration,
    Numerical,
    Diagnostic,
    Persistence,
}

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("variable index {index} is not declared ({declared} variables exist)")]
    UndeclaredVariable { index: usize, declared: usize },

    #[error("variable '{0}' has no dynamics assigned")]
    UnassignedDynamics(String),

    #[error("variable '{0}' already has dynamics assigned")]
    DuplicateDynamics(String),

    #[error("shock index {index} is out of range ({declared} shocks declared)")]
    ShockOutOfRange { index: usize, declared: usize },

    #[error("network '{0}' is already defined")]
    DuplicateNetwork(String),

    #[error("invalid expression graph: {0}")]
    InvalidGraph(String),

    #[error("model is already launched; cannot {0}")]
    AlreadyLaunched(&'static str),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("variable '{0}' has no values in the batch")]
    MissingValues(String),

    #[error("non-finite values: {0}")]
    Numerical(String),

    #[error("diagnostic failed: {0}")]
    Diagnostic(String),

    #[error("operation '{operation}' failed at tick {tick}: {source}")]
    OperationFailed {
        operation: String,
        tick: u64,
        #[source]
        source: Box<EngineError>,
    },

    #[error("scheduler is stopped after a fatal error")]
    Stopped,

    #[error("checkpoint error: {0}")]
    Checkpoint(String),

    #[error("I/O error: {context}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl EngineError {
    pub fn io(context: impl Into<String>, source: std::io::Error) -> Self {
        Self::Io {
            context: context.into(),
            source,
        }
    }

    pub fn category(&self) -> ErrorCategory {
        match self {
            Self::UndeclaredVariable { .. }
            | Self::UnassignedDynamics(_)
            | Self::DuplicateDynamics(_)
            | Self::ShockOutOfRange { .. }
            | Self::DuplicateNetwork(_)
            | Self::InvalidGraph(_)
            | Self::AlreadyLaunched(_) => ErrorCategory::Structural,
            Self::Config(_) | Self::MissingValues(_) | Self::Stopped => {
                ErrorCategory::Configuration
            }
            Self::Numerical(_) => ErrorCategory::Numerical,
            Self::Diagnostic(_) => ErrorCategory::Diagnostic,
            Self::OperationFailed { source, .. } => source.category(),
            Self::Checkpoint(_) | Self::Io { .. } | Self::Serialization(_) => {
                ErrorCategory::Persistence
            }
        }
    }
}

pub type Result<T> = std::result::Result<T, EngineError>;

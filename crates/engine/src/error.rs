use tandem_core::{CoreError, Fault};
use tandem_storage::StorageError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("core error: {0}")]
    Core(#[from] CoreError),

    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("invariant violated: {0}")]
    InvariantViolation(String),

    #[error("session stopped: {reason}")]
    SessionStopped { reason: String },

    #[error("checkpoint '{name}' would move backwards: {current} -> {proposed}")]
    CheckpointRegression {
        name: String,
        current: String,
        proposed: String,
    },

    #[error("adapter fault: {0}")]
    Adapter(#[from] Fault),

    #[error("conflict not found: {0}")]
    ConflictNotFound(String),

    #[error("rule not found: {0}")]
    RuleNotFound(String),

    #[error("change group not found: {0}")]
    GroupNotFound(String),
}

impl EngineError {
    /// Faults the routing policy must never see.
    pub fn is_fatal(&self) -> bool {
        match self {
            Self::Configuration(_)
            | Self::InvariantViolation(_)
            | Self::CheckpointRegression { .. }
            | Self::SessionStopped { .. } => true,
            Self::Storage(StorageError::Invariant(_)) => true,
            _ => false,
        }
    }
}

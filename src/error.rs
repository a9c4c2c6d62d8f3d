//! Error types for pwa-foreman.

use crate::worker::protocol::Failure;
use thiserror::Error;

/// Main error type for the computation engine.
#[derive(Error, Debug)]
pub enum ForemanError {
    #[error("Partition error: {0}")]
    Partition(String),

    #[error("Worker {} failed during setup: {}", .0.process_id, .0.message)]
    Setup(Failure),

    #[error("Worker {} failed to compute: {}", .0.process_id, .0.message)]
    Compute(Failure),

    #[error("Worker pool has been closed")]
    PoolShutdown,

    #[error("Worker {process_id} was lost: {reason}")]
    WorkerLost { process_id: usize, reason: String },

    #[error("Protocol violation from worker {process_id}: {message}")]
    Protocol { process_id: usize, message: String },

    #[error("Channel to worker {process_id} is simplex and cannot send arguments")]
    SimplexSend { process_id: usize },

    #[error("Worker {process_id} is simplex and has already reported its result")]
    SimplexExhausted { process_id: usize },

    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl ForemanError {
    /// Whether this error leaves the pool's channels in an unknown state.
    ///
    /// Structural errors close the pool; compute errors do not. JSON errors
    /// come from encoding arguments before anything is sent, so they leave
    /// the channels in step.
    pub fn is_structural(&self) -> bool {
        matches!(
            self,
            Self::WorkerLost { .. } | Self::Protocol { .. } | Self::Io(_)
        )
    }

    /// The worker failure carried by this error, if any.
    pub fn failure(&self) -> Option<&Failure> {
        match self {
            Self::Setup(failure) | Self::Compute(failure) => Some(failure),
            _ => None,
        }
    }
}

/// Result type alias for engine operations.
pub type Result<T> = std::result::Result<T, ForemanError>;

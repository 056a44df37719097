//! Error types for the broadphase

use thiserror::Error;

/// Errors from the rebuild scheduling machinery
#[derive(Debug, Error)]
pub enum SchedulerError {
    /// The background worker thread could not be spawned
    #[error("Failed to spawn rebuild worker thread: {0}")]
    WorkerSpawn(#[from] std::io::Error),
}

/// Result type for scheduler operations
pub type Result<T> = std::result::Result<T, SchedulerError>;

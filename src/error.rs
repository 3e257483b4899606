//! Error types for procpool.

use thiserror::Error;

/// Main error type for procpool.
#[derive(Error, Debug)]
pub enum PoolError {
    #[error("Pool has no alive workers. Restart failed workers or expand the pool.")]
    DeadPool,

    #[error("Worker {pid} is dead and cannot accept work")]
    DeadWorker { pid: i32 },

    #[error("Cannot shrink pool by {requested}: only {alive} workers are alive")]
    InvalidShrink { requested: usize, alive: usize },

    #[error("Failed to spawn worker: {0}")]
    Spawn(String),

    #[error("Process control error: {0}")]
    Process(String),

    #[error("Channel error: {0}")]
    Channel(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Result type alias for procpool operations.
pub type Result<T> = std::result::Result<T, PoolError>;

//! Error types for the performance-optimization core.

use std::time::Duration;
use thiserror::Error;

/// Result type alias for perfcore operations
pub type Result<T> = std::result::Result<T, Error>;

/// perfcore error types
///
/// Boundary-crossing failures only: internal validation failures are absorbed
/// and counted by the component that saw them.
#[derive(Debug, Error)]
pub enum Error {
    #[error("timed out after {0:?} waiting for a pooled connection")]
    AcquireTimeout(Duration),

    #[error("optimization queue is full")]
    QueueFull,

    #[error("optimization engine is disabled")]
    EngineDisabled,

    #[error("connection pool is closed")]
    PoolClosed,

    #[error("parameter {name}: value {value} outside [{min}, {max}]")]
    ParameterOutOfBounds {
        name: String,
        value: String,
        min: String,
        max: String,
    },

    #[error("unknown parameter: {0}")]
    UnknownParameter(String),

    #[error("connection factory error: {0}")]
    Factory(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("optimization error: {0}")]
    Optimization(String),

    #[error("metrics export error: {0}")]
    Metrics(#[from] prometheus::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

//! Error types for the Berth state store and domain validation.

use thiserror::Error;

use crate::types::DeploymentStatus;

/// Result type alias for state store operations.
pub type StateResult<T> = Result<T, StateError>;

/// Errors that can occur during state store operations.
#[derive(Debug, Error)]
pub enum StateError {
    #[error("failed to open database: {0}")]
    Open(String),

    #[error("transaction error: {0}")]
    Transaction(String),

    #[error("table error: {0}")]
    Table(String),

    #[error("read error: {0}")]
    Read(String),

    #[error("write error: {0}")]
    Write(String),

    #[error("serialization error: {0}")]
    Serialize(String),

    #[error("deserialization error: {0}")]
    Deserialize(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("illegal transition for {id}: {from} -> {to}")]
    InvalidTransition {
        id: String,
        from: DeploymentStatus,
        to: DeploymentStatus,
    },
}

/// Scaling policy validation failures.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum PolicyError {
    #[error("scale-up threshold {up} must be greater than scale-down threshold {down}")]
    ThresholdOrder { up: f64, down: f64 },

    #[error("threshold {0} must lie within [0, 1]")]
    ThresholdRange(f64),

    #[error("instance bounds invalid: min={min}, max={max} (need 0 < min <= max)")]
    InstanceBounds { min: u32, max: u32 },

    #[error("policy must configure at least one metric")]
    NoMetrics,

    #[error("invalid metric weight: {0}")]
    Weight(String),

    #[error("scale step must be at least 1")]
    Step,
}

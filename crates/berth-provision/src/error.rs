//! Errors reported by the provisioning collaborator.

use thiserror::Error;

pub type ProvisionResult<T> = Result<T, ProvisionError>;

/// Raw failures as the sandbox backend reports them. The recovery crate
/// maps these onto the deployment error taxonomy.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ProvisionError {
    #[error("operation timed out: {0}")]
    Timeout(String),

    #[error("insufficient capacity: {0}")]
    Capacity(String),

    #[error("connection failed: {0}")]
    Connection(String),

    #[error("sandbox failure: {0}")]
    Sandbox(String),

    #[error("sandbox not found: {0}")]
    NotFound(String),

    #[error("{0}")]
    Other(String),
}

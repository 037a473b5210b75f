//! Controller error types.

use berth_state::{DeploymentStatus, StateError};
use thiserror::Error;

/// Errors returned by controller operations. Pipeline failures are not
/// errors: they end in a `FAILED` deployment carrying its own
/// [`berth_state::DeploymentError`].
#[derive(Debug, Error)]
pub enum ControllerError {
    #[error("deployment not found: {0}")]
    NotFound(String),

    #[error("cannot {operation} deployment {id} in status {status}")]
    InvalidState {
        id: String,
        status: DeploymentStatus,
        operation: &'static str,
    },

    #[error("invalid deploy request: {0}")]
    InvalidRequest(String),

    #[error("{operation} timed out for {target}")]
    Timeout { operation: &'static str, target: String },

    #[error("state store error: {0}")]
    State(#[from] StateError),
}

pub type ControllerResult<T> = Result<T, ControllerError>;

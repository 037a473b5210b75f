use berth_provision::ProvisionError;
use berth_state::StateError;
use thiserror::Error;

pub type CleanupResult<T> = Result<T, CleanupError>;

#[derive(Debug, Error)]
pub enum CleanupError {
    #[error("sandbox {0} is already being reclaimed")]
    AlreadyClaimed(String),

    #[error("terminate {sandbox_id} failed: {source}")]
    Terminate {
        sandbox_id: String,
        #[source]
        source: ProvisionError,
    },

    #[error("{operation} timed out for {target}")]
    Timeout { operation: &'static str, target: String },

    #[error("state store error: {0}")]
    State(#[from] StateError),
}

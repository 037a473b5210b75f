use berth_state::{PolicyError, StateError};

#[derive(Debug, thiserror::Error)]
pub enum AutoscaleError {
    #[error("no scaling policy for deployment {0}")]
    NoPolicy(String),

    #[error("scaling policy for {0} is disabled")]
    Disabled(String),

    #[error("evaluation already in progress for {0}")]
    InFlight(String),

    #[error("no metrics available for {0}")]
    NoMetrics(String),

    #[error("{operation} timed out for {deployment_id}")]
    Timeout {
        operation: &'static str,
        deployment_id: String,
    },

    #[error("scaling {deployment_id} to {target} failed: {source}")]
    Scale {
        deployment_id: String,
        target: u32,
        #[source]
        source: anyhow::Error,
    },

    #[error("metrics source: {0}")]
    Metrics(#[source] anyhow::Error),

    #[error(transparent)]
    Policy(#[from] PolicyError),

    #[error(transparent)]
    State(#[from] StateError),
}

pub type AutoscaleResult<T> = Result<T, AutoscaleError>;

use berth_core::ConfigError;
use berth_provision::ProvisionError;
use berth_state::StateError;

#[derive(Debug, thiserror::Error)]
pub enum CostError {
    #[error("{operation} timed out for {target}")]
    Timeout {
        operation: &'static str,
        target: String,
    },

    #[error("invalid budget: {0}")]
    Budget(#[from] ConfigError),

    #[error(transparent)]
    Provision(#[from] ProvisionError),

    #[error(transparent)]
    State(#[from] StateError),
}

pub type CostResult<T> = Result<T, CostError>;

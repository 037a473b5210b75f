//! berth-controller — the Deployment Controller.
//!
//! Owns the deployment lifecycle: runs each submitted project through
//! provisioning, build and startup with classified retries, supervises
//! running deployments against their time budget, and hands failed
//! deployments to the cleanup scheduler.
//!
//! - [`DeploymentController::deploy_project`]: create and run the pipeline
//! - [`DeploymentController::monitor_deployment`]: read-only status view
//! - [`DeploymentController::stop_deployment`] / [`DeploymentController::destroy_deployment`]
//! - [`DeploymentController::restore`]: rebuild state after a restart
//!
//! The controller also implements the autoscaler's
//! [`berth_autoscale::ScaleTarget`] and [`berth_autoscale::MetricsSource`].

pub mod controller;
pub mod error;
pub mod logs;
mod pipeline;
mod scaling;
mod supervisor;
pub mod types;

pub use controller::{Collaborators, DeploymentController};
pub use error::{ControllerError, ControllerResult};
pub use logs::{LOG_TAIL_LINES, LogBook, LogLine};
pub use types::{DeployConfig, DeploymentView, RestoreReport};

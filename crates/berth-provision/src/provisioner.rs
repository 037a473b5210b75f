//! The sandbox provisioning collaborator.

use std::time::Duration;

use async_trait::async_trait;
use berth_state::HealthStatus;

use crate::error::ProvisionResult;
use crate::types::{SandboxHandle, SandboxSpec, UsageReading};

/// Backend that owns the actual sandbox execution environment.
///
/// Calls may fail independently of the caller's own timeout; the control
/// plane wraps every call in a deadline of its own.
#[async_trait]
pub trait Provisioner: Send + Sync + 'static {
    /// Create a sandbox. `budget` is the time the deployment may run for;
    /// the backend uses it as the sandbox lease.
    async fn create(&self, spec: &SandboxSpec, budget: Duration) -> ProvisionResult<SandboxHandle>;

    /// Install dependencies and compile inside a created sandbox.
    async fn prepare(&self, _sandbox_id: &str, _spec: &SandboxSpec) -> ProvisionResult<()> {
        Ok(())
    }

    async fn terminate(&self, sandbox_id: &str) -> ProvisionResult<()>;

    async fn health_check(&self, sandbox_id: &str) -> HealthStatus;

    /// Latest resource reading, if the backend reports one.
    async fn usage(&self, _sandbox_id: &str) -> ProvisionResult<Option<UsageReading>> {
        Ok(None)
    }
}

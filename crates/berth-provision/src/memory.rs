//! In-process simulated sandbox backend.
//!
//! Sandboxes are plain records. Failures, latency, health and usage are
//! scripted by the caller, which makes the backend suitable both for the
//! daemon's local mode and for driving failure scenarios in tests.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use berth_state::HealthStatus;
use tracing::debug;
use uuid::Uuid;

use crate::error::{ProvisionError, ProvisionResult};
use crate::provisioner::Provisioner;
use crate::types::{ResourceProfile, SandboxHandle, SandboxSpec, UsageReading};

#[derive(Default)]
struct Inner {
    live: HashMap<String, SandboxSpec>,
    create_failures: VecDeque<ProvisionError>,
    prepare_failures: VecDeque<ProvisionError>,
    terminate_failures: HashSet<String>,
    create_delay: Duration,
    health: HashMap<String, HealthStatus>,
    default_health: Option<HealthStatus>,
    usage: HashMap<String, UsageReading>,
    default_usage: Option<UsageReading>,
    created_profiles: Vec<ResourceProfile>,
    create_calls: u32,
    terminated: Vec<String>,
}

#[derive(Default)]
pub struct InMemoryProvisioner {
    inner: Mutex<Inner>,
}

impl InMemoryProvisioner {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Fail the next `create` call with `error`. Calls queue up.
    pub fn fail_next_create(&self, error: ProvisionError) {
        self.state().create_failures.push_back(error);
    }

    /// Fail the next `prepare` call with `error`. Calls queue up.
    pub fn fail_next_prepare(&self, error: ProvisionError) {
        self.state().prepare_failures.push_back(error);
    }

    /// Make every `terminate` of `sandbox_id` fail until cleared.
    pub fn fail_terminate(&self, sandbox_id: &str, fail: bool) {
        let mut state = self.state();
        if fail {
            state.terminate_failures.insert(sandbox_id.to_string());
        } else {
            state.terminate_failures.remove(sandbox_id);
        }
    }

    /// Delay every `create` call by `delay`.
    pub fn set_create_delay(&self, delay: Duration) {
        self.state().create_delay = delay;
    }

    pub fn set_health(&self, sandbox_id: &str, health: HealthStatus) {
        self.state().health.insert(sandbox_id.to_string(), health);
    }

    /// Health reported for sandboxes without an explicit override.
    pub fn set_default_health(&self, health: HealthStatus) {
        self.state().default_health = Some(health);
    }

    pub fn set_usage(&self, sandbox_id: &str, usage: UsageReading) {
        self.state().usage.insert(sandbox_id.to_string(), usage);
    }

    pub fn set_default_usage(&self, usage: UsageReading) {
        self.state().default_usage = Some(usage);
    }

    /// Register a sandbox the control plane does not know about.
    pub fn adopt(&self, sandbox_id: &str, spec: SandboxSpec) {
        self.state().live.insert(sandbox_id.to_string(), spec);
    }

    pub fn live_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.state().live.keys().cloned().collect();
        ids.sort();
        ids
    }

    pub fn is_live(&self, sandbox_id: &str) -> bool {
        self.state().live.contains_key(sandbox_id)
    }

    pub fn live_count(&self) -> usize {
        self.state().live.len()
    }

    /// Every successful `terminate`, in call order.
    pub fn terminated(&self) -> Vec<String> {
        self.state().terminated.clone()
    }

    /// Total `create` calls, successful or not.
    pub fn create_calls(&self) -> u32 {
        self.state().create_calls
    }

    /// Profiles of successfully created sandboxes, in order.
    pub fn created_profiles(&self) -> Vec<ResourceProfile> {
        self.state().created_profiles.clone()
    }
}

#[async_trait]
impl Provisioner for InMemoryProvisioner {
    async fn create(&self, spec: &SandboxSpec, _budget: Duration) -> ProvisionResult<SandboxHandle> {
        let (delay, scripted) = {
            let mut state = self.state();
            state.create_calls += 1;
            (state.create_delay, state.create_failures.pop_front())
        };
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        if let Some(err) = scripted {
            debug!(deployment_id = %spec.deployment_id, error = %err, "simulated create failure");
            return Err(err);
        }

        let sandbox_id = format!("sbx-{}", Uuid::new_v4().simple());
        let mut state = self.state();
        state.live.insert(sandbox_id.clone(), spec.clone());
        state.created_profiles.push(spec.profile);
        debug!(deployment_id = %spec.deployment_id, %sandbox_id, "simulated sandbox created");
        Ok(SandboxHandle {
            sandbox_id,
            profile: spec.profile,
        })
    }

    async fn prepare(&self, sandbox_id: &str, _spec: &SandboxSpec) -> ProvisionResult<()> {
        let mut state = self.state();
        if !state.live.contains_key(sandbox_id) {
            return Err(ProvisionError::NotFound(sandbox_id.to_string()));
        }
        match state.prepare_failures.pop_front() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    async fn terminate(&self, sandbox_id: &str) -> ProvisionResult<()> {
        let mut state = self.state();
        if state.terminate_failures.contains(sandbox_id) {
            return Err(ProvisionError::Connection(format!(
                "terminate {sandbox_id}: backend unreachable"
            )));
        }
        // Terminating an already-gone sandbox succeeds.
        state.live.remove(sandbox_id);
        state.terminated.push(sandbox_id.to_string());
        Ok(())
    }

    async fn health_check(&self, sandbox_id: &str) -> HealthStatus {
        let state = self.state();
        if !state.live.contains_key(sandbox_id) {
            return HealthStatus::Unknown;
        }
        state
            .health
            .get(sandbox_id)
            .copied()
            .or(state.default_health)
            .unwrap_or(HealthStatus::Healthy)
    }

    async fn usage(&self, sandbox_id: &str) -> ProvisionResult<Option<UsageReading>> {
        let state = self.state();
        if !state.live.contains_key(sandbox_id) {
            return Err(ProvisionError::NotFound(sandbox_id.to_string()));
        }
        Ok(state
            .usage
            .get(sandbox_id)
            .cloned()
            .or_else(|| state.default_usage.clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec() -> SandboxSpec {
        SandboxSpec {
            deployment_id: "dep-1".to_string(),
            project_id: "proj".to_string(),
            owner_id: "owner".to_string(),
            runtime: "node".to_string(),
            profile: ResourceProfile::STANDARD,
            env: HashMap::new(),
            files: vec!["index.js".to_string()],
        }
    }

    #[tokio::test]
    async fn create_and_terminate() {
        let p = InMemoryProvisioner::new();
        let handle = p.create(&spec(), Duration::from_secs(300)).await.unwrap();
        assert!(p.is_live(&handle.sandbox_id));
        assert_eq!(p.health_check(&handle.sandbox_id).await, HealthStatus::Healthy);

        p.terminate(&handle.sandbox_id).await.unwrap();
        assert!(!p.is_live(&handle.sandbox_id));
        assert_eq!(p.health_check(&handle.sandbox_id).await, HealthStatus::Unknown);
        assert_eq!(p.terminated(), vec![handle.sandbox_id]);
    }

    #[tokio::test]
    async fn scripted_failures_are_consumed_in_order() {
        let p = InMemoryProvisioner::new();
        p.fail_next_create(ProvisionError::Connection("reset".into()));
        p.fail_next_create(ProvisionError::Capacity("no hosts".into()));

        assert!(matches!(
            p.create(&spec(), Duration::from_secs(1)).await,
            Err(ProvisionError::Connection(_))
        ));
        assert!(matches!(
            p.create(&spec(), Duration::from_secs(1)).await,
            Err(ProvisionError::Capacity(_))
        ));
        assert!(p.create(&spec(), Duration::from_secs(1)).await.is_ok());
        assert_eq!(p.create_calls(), 3);
        assert_eq!(p.live_count(), 1);
    }

    #[tokio::test]
    async fn terminate_failure_keeps_sandbox_live() {
        let p = InMemoryProvisioner::new();
        let handle = p.create(&spec(), Duration::from_secs(1)).await.unwrap();
        p.fail_terminate(&handle.sandbox_id, true);
        assert!(p.terminate(&handle.sandbox_id).await.is_err());
        assert!(p.is_live(&handle.sandbox_id));

        p.fail_terminate(&handle.sandbox_id, false);
        assert!(p.terminate(&handle.sandbox_id).await.is_ok());
    }

    #[tokio::test]
    async fn usage_overrides_default() {
        let p = InMemoryProvisioner::new();
        let handle = p.create(&spec(), Duration::from_secs(1)).await.unwrap();
        assert_eq!(p.usage(&handle.sandbox_id).await.unwrap(), None);

        p.set_default_usage(UsageReading {
            cpu_percent: 10.0,
            ..Default::default()
        });
        p.set_usage(
            &handle.sandbox_id,
            UsageReading {
                cpu_percent: 90.0,
                ..Default::default()
            },
        );
        let reading = p.usage(&handle.sandbox_id).await.unwrap().unwrap();
        assert_eq!(reading.cpu_percent, 90.0);
        assert!(p.usage("missing").await.is_err());
    }
}

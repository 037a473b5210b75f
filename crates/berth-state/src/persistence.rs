//! The durable persistence collaborator.
//!
//! Control-plane components hold an `Arc<dyn Persistence>` and never touch
//! redb directly. [`StateStore`] implements the trait by moving each
//! transaction onto tokio's blocking pool, so a slow disk never stalls a
//! runtime worker.

use async_trait::async_trait;
use berth_core::BudgetConfig;

use crate::error::{StateError, StateResult};
use crate::store::StateStore;
use crate::types::*;

#[async_trait]
pub trait Persistence: Send + Sync + 'static {
    async fn create_deployment(&self, deployment: &Deployment) -> StateResult<()>;

    /// Transactional status transition; see [`StateStore::update_deployment_status`].
    async fn update_deployment_status(
        &self,
        id: &str,
        status: DeploymentStatus,
        error: Option<DeploymentError>,
        now: u64,
    ) -> StateResult<Deployment>;

    async fn put_deployment(&self, deployment: &Deployment) -> StateResult<()>;
    async fn get_deployment(&self, id: &str) -> StateResult<Option<Deployment>>;
    async fn list_deployments(&self) -> StateResult<Vec<Deployment>>;

    async fn put_sandbox(&self, sandbox: &SandboxMeta) -> StateResult<()>;
    async fn remove_sandbox(&self, id: &str) -> StateResult<bool>;
    async fn list_sandboxes(&self) -> StateResult<Vec<SandboxMeta>>;

    async fn put_policy(&self, policy: &ScalingPolicy) -> StateResult<()>;
    async fn list_policies(&self) -> StateResult<Vec<ScalingPolicy>>;

    async fn record_scaling_event(&self, event: &ScalingEvent) -> StateResult<()>;
    async fn list_scaling_events(&self, deployment_id: &str, limit: usize)
    -> StateResult<Vec<ScalingEvent>>;
    async fn upsert_instance_counter(&self, counter: &InstanceCounter) -> StateResult<()>;
    async fn get_instance_counter(&self, deployment_id: &str)
    -> StateResult<Option<InstanceCounter>>;

    /// Append a sample, evicting the oldest beyond `retention`.
    async fn append_usage_sample(&self, sample: &UsageSample, retention: usize)
    -> StateResult<usize>;
    async fn list_usage_samples(&self, deployment_id: &str) -> StateResult<Vec<UsageSample>>;

    async fn get_budget(&self) -> StateResult<Option<BudgetConfig>>;
    async fn put_budget(&self, budget: &BudgetConfig) -> StateResult<()>;
    async fn get_budget_alerts(&self) -> StateResult<Option<BudgetAlertState>>;
    async fn put_budget_alerts(&self, state: &BudgetAlertState) -> StateResult<()>;

    /// Forget per-deployment scaling and usage state after destruction.
    async fn purge_deployment(&self, deployment_id: &str) -> StateResult<()>;
}

impl StateStore {
    async fn blocking<T, F>(&self, f: F) -> StateResult<T>
    where
        T: Send + 'static,
        F: FnOnce(&StateStore) -> StateResult<T> + Send + 'static,
    {
        let store = self.clone();
        tokio::task::spawn_blocking(move || f(&store))
            .await
            .map_err(|e| StateError::Transaction(format!("blocking task failed: {e}")))?
    }
}

#[async_trait]
impl Persistence for StateStore {
    async fn create_deployment(&self, deployment: &Deployment) -> StateResult<()> {
        let deployment = deployment.clone();
        self.blocking(move |s| s.create_deployment(&deployment)).await
    }

    async fn update_deployment_status(
        &self,
        id: &str,
        status: DeploymentStatus,
        error: Option<DeploymentError>,
        now: u64,
    ) -> StateResult<Deployment> {
        let id = id.to_string();
        self.blocking(move |s| s.update_deployment_status(&id, status, error, now))
            .await
    }

    async fn put_deployment(&self, deployment: &Deployment) -> StateResult<()> {
        let deployment = deployment.clone();
        self.blocking(move |s| s.put_deployment(&deployment)).await
    }

    async fn get_deployment(&self, id: &str) -> StateResult<Option<Deployment>> {
        let id = id.to_string();
        self.blocking(move |s| s.get_deployment(&id)).await
    }

    async fn list_deployments(&self) -> StateResult<Vec<Deployment>> {
        self.blocking(|s| s.list_deployments()).await
    }

    async fn put_sandbox(&self, sandbox: &SandboxMeta) -> StateResult<()> {
        let sandbox = sandbox.clone();
        self.blocking(move |s| s.put_sandbox(&sandbox)).await
    }

    async fn remove_sandbox(&self, id: &str) -> StateResult<bool> {
        let id = id.to_string();
        self.blocking(move |s| s.remove_sandbox(&id)).await
    }

    async fn list_sandboxes(&self) -> StateResult<Vec<SandboxMeta>> {
        self.blocking(|s| s.list_sandboxes()).await
    }

    async fn put_policy(&self, policy: &ScalingPolicy) -> StateResult<()> {
        let policy = policy.clone();
        self.blocking(move |s| s.put_policy(&policy)).await
    }

    async fn list_policies(&self) -> StateResult<Vec<ScalingPolicy>> {
        self.blocking(|s| s.list_policies()).await
    }

    async fn record_scaling_event(&self, event: &ScalingEvent) -> StateResult<()> {
        let event = event.clone();
        self.blocking(move |s| s.record_scaling_event(&event)).await
    }

    async fn list_scaling_events(
        &self,
        deployment_id: &str,
        limit: usize,
    ) -> StateResult<Vec<ScalingEvent>> {
        let id = deployment_id.to_string();
        self.blocking(move |s| s.list_scaling_events(&id, limit)).await
    }

    async fn upsert_instance_counter(&self, counter: &InstanceCounter) -> StateResult<()> {
        let counter = counter.clone();
        self.blocking(move |s| s.upsert_instance_counter(&counter)).await
    }

    async fn get_instance_counter(
        &self,
        deployment_id: &str,
    ) -> StateResult<Option<InstanceCounter>> {
        let id = deployment_id.to_string();
        self.blocking(move |s| s.get_instance_counter(&id)).await
    }

    async fn append_usage_sample(
        &self,
        sample: &UsageSample,
        retention: usize,
    ) -> StateResult<usize> {
        let sample = sample.clone();
        self.blocking(move |s| s.append_usage_sample(&sample, retention))
            .await
    }

    async fn list_usage_samples(&self, deployment_id: &str) -> StateResult<Vec<UsageSample>> {
        let id = deployment_id.to_string();
        self.blocking(move |s| s.list_usage_samples(&id)).await
    }

    async fn get_budget(&self) -> StateResult<Option<BudgetConfig>> {
        self.blocking(|s| s.get_budget()).await
    }

    async fn put_budget(&self, budget: &BudgetConfig) -> StateResult<()> {
        let budget = budget.clone();
        self.blocking(move |s| s.put_budget(&budget)).await
    }

    async fn get_budget_alerts(&self) -> StateResult<Option<BudgetAlertState>> {
        self.blocking(|s| s.get_budget_alerts()).await
    }

    async fn put_budget_alerts(&self, state: &BudgetAlertState) -> StateResult<()> {
        let state = state.clone();
        self.blocking(move |s| s.put_budget_alerts(&state)).await
    }

    async fn purge_deployment(&self, deployment_id: &str) -> StateResult<()> {
        let id = deployment_id.to_string();
        self.blocking(move |s| s.purge_deployment(&id)).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[tokio::test]
    async fn trait_object_round_trip() {
        let store: Arc<dyn Persistence> = Arc::new(StateStore::open_in_memory().unwrap());
        let d = Deployment::new("dep-1", "proj", "owner", "python", 100);
        store.create_deployment(&d).await.unwrap();

        let updated = store
            .update_deployment_status("dep-1", DeploymentStatus::Provisioning, None, 110)
            .await
            .unwrap();
        assert_eq!(updated.status, DeploymentStatus::Provisioning);

        let listed = store.list_deployments().await.unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].status, DeploymentStatus::Provisioning);
    }

    #[tokio::test]
    async fn concurrent_sandbox_writes() {
        let store = Arc::new(StateStore::open_in_memory().unwrap());
        let mut handles = Vec::new();
        for i in 0..8 {
            let store = Arc::clone(&store);
            handles.push(tokio::spawn(async move {
                let meta = SandboxMeta::new(&format!("sbx-{i}"), "dep-1", "owner", 100, 60);
                Persistence::put_sandbox(store.as_ref(), &meta).await
            }));
        }
        for h in handles {
            h.await.unwrap().unwrap();
        }
        assert_eq!(Persistence::list_sandboxes(store.as_ref()).await.unwrap().len(), 8);
    }
}

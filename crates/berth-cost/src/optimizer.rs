//! CostOptimizer — periodic usage sampling, budget checks and advice.

use std::collections::BTreeMap;
use std::future::Future;
use std::sync::{Arc, Mutex, PoisonError, RwLock};

use berth_core::{BudgetConfig, CallTimeouts, CostConfig, EventBus, SingleFlight, Topic, epoch_secs, run_periodic};
use berth_provision::{Provisioner, ResourceProfile, UsageReading};
use berth_registry::SandboxRegistry;
use berth_state::{DeploymentStatus, Persistence, ScalingPolicy, UsageSample};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::sync::{broadcast, watch};
use tracing::{debug, error, info, warn};

use crate::budget::{BudgetAlert, BudgetTracker, seconds_in_month};
use crate::error::{CostError, CostResult};
use crate::pricing::{aggregate, estimate};
use crate::recommend::{Recommendation, recommend};
use crate::window::UsageWindow;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UsageSummary {
    pub deployment_id: String,
    pub samples: usize,
    pub avg_cpu_cores: f64,
    pub avg_memory_gb: f64,
    /// Cost of all retained samples.
    pub window_cost: f64,
    pub projected_monthly_cost: f64,
}

pub struct CostOptimizer {
    config: CostConfig,
    calls: CallTimeouts,
    registry: Arc<SandboxRegistry>,
    provisioner: Arc<dyn Provisioner>,
    persistence: Arc<dyn Persistence>,
    events: EventBus,
    windows: DashMap<String, UsageWindow>,
    budget: RwLock<BudgetConfig>,
    tracker: Mutex<BudgetTracker>,
    flight: SingleFlight,
}

impl CostOptimizer {
    pub fn new(
        config: CostConfig,
        calls: CallTimeouts,
        registry: Arc<SandboxRegistry>,
        provisioner: Arc<dyn Provisioner>,
        persistence: Arc<dyn Persistence>,
        events: EventBus,
    ) -> Self {
        let budget = config.budget.clone();
        Self {
            config,
            calls,
            registry,
            provisioner,
            persistence,
            events,
            windows: DashMap::new(),
            budget: RwLock::new(budget),
            tracker: Mutex::new(BudgetTracker::new()),
            flight: SingleFlight::new(),
        }
    }

    fn interval_secs(&self) -> u64 {
        self.config.sample_interval.as_secs().max(1)
    }

    /// Oldest sample age a window keeps: one full retention span.
    fn max_age_secs(&self) -> u64 {
        self.interval_secs().saturating_mul(self.config.retention as u64)
    }

    pub fn budget(&self) -> BudgetConfig {
        self.budget.read().unwrap_or_else(PoisonError::into_inner).clone()
    }

    /// Validate, persist and apply a new budget.
    pub async fn set_budget(&self, budget: BudgetConfig) -> CostResult<()> {
        budget.validate()?;
        self.persist("put_budget", "budget", self.persistence.put_budget(&budget))
            .await?;
        info!(
            monthly_limit = budget.monthly_limit,
            warning = budget.warning_threshold,
            critical = budget.critical_threshold,
            enabled = budget.is_enabled,
            "budget updated"
        );
        *self.budget.write().unwrap_or_else(PoisonError::into_inner) = budget;
        Ok(())
    }

    /// Reload the stored budget, the alerts already fired this period and
    /// the retained history of the given deployments.
    pub async fn restore(&self, deployment_ids: &[String]) -> CostResult<()> {
        if let Some(budget) = self
            .persist("get_budget", "budget", self.persistence.get_budget())
            .await?
        {
            *self.budget.write().unwrap_or_else(PoisonError::into_inner) = budget;
        }
        if let Some(state) = self
            .persist("get_budget_alerts", "budget", self.persistence.get_budget_alerts())
            .await?
        {
            debug!(period = %state.period, fired = state.fired.len(), "budget alert state restored");
            *self.tracker.lock().unwrap_or_else(PoisonError::into_inner) = BudgetTracker::from_state(state);
        }
        for id in deployment_ids {
            let samples = self
                .persist("list_usage_samples", id, self.persistence.list_usage_samples(id))
                .await?;
            if !samples.is_empty() {
                let window = UsageWindow::from_samples(samples, self.config.retention, self.max_age_secs());
                self.windows.insert(id.clone(), window);
            }
        }
        Ok(())
    }

    /// Take one usage sample for every deployment with live sandboxes,
    /// then check the budget. Skipped if a previous pass is still running.
    pub async fn sample_all(&self, now: u64) -> Vec<UsageSample> {
        let Some(_flight) = self.flight.try_begin() else {
            return Vec::new();
        };

        let mut by_deployment: BTreeMap<String, Vec<String>> = BTreeMap::new();
        for meta in self.registry.snapshot() {
            by_deployment.entry(meta.deployment_id).or_default().push(meta.id);
        }

        let mut taken = Vec::new();
        for (deployment_id, sandboxes) in by_deployment {
            let mut readings = Vec::new();
            for sandbox_id in &sandboxes {
                match tokio::time::timeout(self.calls.health_check, self.provisioner.usage(sandbox_id)).await {
                    Ok(Ok(Some(reading))) => readings.push(reading),
                    Ok(Ok(None)) => {}
                    Ok(Err(e)) => warn!(%deployment_id, %sandbox_id, error = %e, "usage reading failed"),
                    Err(_) => warn!(%deployment_id, %sandbox_id, "usage reading timed out"),
                }
            }
            if readings.is_empty() {
                continue;
            }
            let usage = aggregate(&readings);
            match self.record(&deployment_id, &usage, now).await {
                Ok(sample) => taken.push(sample),
                Err(e) => warn!(%deployment_id, error = %e, "failed to store usage sample"),
            }
        }

        self.check_budget(now).await;
        taken
    }

    /// Price one aggregate reading and append it to the deployment's window.
    pub async fn record(&self, deployment_id: &str, usage: &UsageReading, now: u64) -> CostResult<UsageSample> {
        let cost = estimate(usage, &self.config.rates, self.config.sample_interval);
        let sample = UsageSample {
            deployment_id: deployment_id.to_string(),
            cpu_usage: usage.cpu_cores,
            memory_usage: usage.memory_gb,
            network_io: usage.network_mb,
            disk_io: usage.disk_gb,
            cost_estimate: cost.total,
            timestamp: now,
        };

        let retention = self.config.retention;
        self.persist(
            "append_usage_sample",
            deployment_id,
            self.persistence.append_usage_sample(&sample, retention),
        )
        .await?;

        let max_age = self.max_age_secs();
        let evicted = self
            .windows
            .entry(deployment_id.to_string())
            .or_insert_with(|| UsageWindow::new(retention, max_age))
            .push(sample.clone());
        debug!(%deployment_id, cost = sample.cost_estimate, evicted, "usage sample recorded");
        Ok(sample)
    }

    /// Monthly projection across all tracked deployments. Samples past the
    /// retention span at `now` are dropped first.
    pub fn projected_monthly_cost(&self, now: u64) -> f64 {
        let month = seconds_in_month(now) as f64;
        let interval = self.interval_secs();
        let mut total = 0.0;
        for mut window in self.windows.iter_mut() {
            window.expire(now);
            total += window.cost_rate(interval) * month;
        }
        total
    }

    /// Compare the projection with the budget and publish new alerts. The
    /// fired levels are persisted before the alerts go out.
    pub async fn check_budget(&self, now: u64) -> Vec<BudgetAlert> {
        let projected = self.projected_monthly_cost(now);
        let budget = self.budget();
        let (alerts, state) = {
            let mut tracker = self.tracker.lock().unwrap_or_else(PoisonError::into_inner);
            let alerts = tracker.evaluate(&budget, projected, now);
            (alerts, tracker.state())
        };
        if alerts.is_empty() {
            return alerts;
        }
        if let Err(e) = self
            .persist("put_budget_alerts", "budget", self.persistence.put_budget_alerts(&state))
            .await
        {
            warn!(error = %e, "failed to persist budget alert state");
        }

        for alert in &alerts {
            info!(
                level = alert.level.as_str(),
                period = %alert.period,
                projected = alert.projected_cost,
                limit = alert.monthly_limit,
                "budget threshold crossed"
            );
            self.events.emit(
                Topic::BudgetAlert,
                None,
                json!({
                    "level": alert.level.as_str(),
                    "period": alert.period,
                    "projected_cost": alert.projected_cost,
                    "monthly_limit": alert.monthly_limit,
                    "percent_used": alert.percent_used,
                    "threshold": alert.threshold,
                }),
            );
        }
        alerts
    }

    pub fn summary(&self, deployment_id: &str, now: u64) -> Option<UsageSummary> {
        let month = seconds_in_month(now) as f64;
        let interval = self.interval_secs();
        self.windows.get_mut(deployment_id).map(|mut w| {
            w.expire(now);
            let n = w.len().max(1) as f64;
            UsageSummary {
                deployment_id: deployment_id.to_string(),
                samples: w.len(),
                avg_cpu_cores: w.iter().map(|s| s.cpu_usage).sum::<f64>() / n,
                avg_memory_gb: w.iter().map(|s| s.memory_usage).sum::<f64>() / n,
                window_cost: w.total_cost(),
                projected_monthly_cost: w.cost_rate(interval) * month,
            }
        })
    }

    /// Advisory recommendations for one deployment. `allocated` is its
    /// total provisioned capacity.
    pub fn recommendations(
        &self,
        deployment_id: &str,
        allocated: &ResourceProfile,
        policy: Option<&ScalingPolicy>,
        now: u64,
    ) -> Vec<Recommendation> {
        let Some(summary) = self.summary(deployment_id, now) else {
            return Vec::new();
        };
        let samples = self.windows.get(deployment_id).map(|w| w.to_vec()).unwrap_or_default();
        recommend(deployment_id, &samples, allocated, policy, summary.projected_monthly_cost)
    }

    /// Drop all usage state for a deployment.
    pub async fn purge(&self, deployment_id: &str) {
        self.windows.remove(deployment_id);
        match tokio::time::timeout(self.calls.persistence, self.persistence.purge_deployment(deployment_id)).await {
            Ok(Ok(())) => debug!(%deployment_id, "usage history purged"),
            Ok(Err(e)) => warn!(%deployment_id, error = %e, "failed to purge usage history"),
            Err(_) => warn!(%deployment_id, "purging usage history timed out"),
        }
    }

    /// Sample on the configured interval until shutdown, dropping history
    /// for deployments that reach `DESTROYED`.
    pub async fn run(self: Arc<Self>, shutdown: watch::Receiver<bool>) {
        let listener = {
            let this = Arc::clone(&self);
            let mut events = self.events.subscribe();
            let mut shutdown = shutdown.clone();
            tokio::spawn(async move {
                loop {
                    tokio::select! {
                        next = events.recv() => match next {
                            Ok(event) if event.topic == Topic::DeploymentStatus
                                && event.payload["status"] == DeploymentStatus::Destroyed.as_str() =>
                            {
                                if let Some(id) = event.deployment_id {
                                    this.purge(&id).await;
                                }
                            }
                            Ok(_) => {}
                            Err(broadcast::error::RecvError::Lagged(n)) => {
                                warn!(skipped = n, "cost optimizer lagged behind status events");
                            }
                            Err(broadcast::error::RecvError::Closed) => break,
                        },
                        _ = shutdown.changed() => break,
                    }
                }
            })
        };

        run_periodic("cost", self.config.sample_interval, shutdown, || {
            let this = Arc::clone(&self);
            async move {
                let taken = this.sample_all(epoch_secs()).await;
                debug!(samples = taken.len(), "usage sampling pass finished");
            }
        })
        .await;

        if let Err(e) = listener.await {
            error!(error = %e, "cost status listener panicked");
        }
    }

    #[cfg(test)]
    fn window_len(&self, deployment_id: &str) -> usize {
        self.windows.get(deployment_id).map(|w| w.len()).unwrap_or(0)
    }

    async fn persist<T>(
        &self,
        operation: &'static str,
        target: &str,
        fut: impl Future<Output = berth_state::StateResult<T>>,
    ) -> CostResult<T> {
        match tokio::time::timeout(self.calls.persistence, fut).await {
            Ok(result) => Ok(result?),
            Err(_) => Err(CostError::Timeout {
                operation,
                target: target.to_string(),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::budget::BudgetLevel;
    use berth_provision::{InMemoryProvisioner, SandboxSpec};
    use berth_state::{SandboxMeta, StateStore};

    // 2026-03-15T00:00:00Z
    const NOW: u64 = 1_773_532_800;

    struct Fixture {
        optimizer: Arc<CostOptimizer>,
        registry: Arc<SandboxRegistry>,
        provisioner: Arc<InMemoryProvisioner>,
        store: Arc<StateStore>,
        bus: EventBus,
    }

    fn fixture(config: CostConfig) -> Fixture {
        let registry = Arc::new(SandboxRegistry::new());
        let provisioner = Arc::new(InMemoryProvisioner::new());
        let store = Arc::new(StateStore::open_in_memory().unwrap());
        let (bus, _queue) = EventBus::new(64);
        let optimizer = Arc::new(CostOptimizer::new(
            config,
            CallTimeouts::default(),
            Arc::clone(&registry),
            provisioner.clone(),
            store.clone(),
            bus.clone(),
        ));
        Fixture {
            optimizer,
            registry,
            provisioner,
            store,
            bus,
        }
    }

    fn spec(deployment_id: &str) -> SandboxSpec {
        SandboxSpec {
            deployment_id: deployment_id.to_string(),
            project_id: "proj".to_string(),
            owner_id: "owner".to_string(),
            runtime: "node".to_string(),
            profile: ResourceProfile::STANDARD,
            env: Default::default(),
            files: vec![],
        }
    }

    fn busy() -> UsageReading {
        UsageReading {
            cpu_percent: 50.0,
            memory_percent: 50.0,
            cpu_cores: 0.5,
            memory_gb: 0.5,
            disk_gb: 1.0,
            network_mb: 10.0,
            ..UsageReading::default()
        }
    }

    impl Fixture {
        fn sandbox(&self, id: &str, deployment_id: &str) {
            self.provisioner.adopt(id, spec(deployment_id));
            self.provisioner.set_usage(id, busy());
            self.registry.register(SandboxMeta::new(id, deployment_id, "owner", NOW, 300));
        }
    }

    #[tokio::test]
    async fn sampling_aggregates_sandboxes_per_deployment() {
        let f = fixture(CostConfig::default());
        f.sandbox("sbx-1", "dep-1");
        f.sandbox("sbx-2", "dep-1");
        f.sandbox("sbx-3", "dep-2");

        let taken = f.optimizer.sample_all(NOW).await;
        assert_eq!(taken.len(), 2);
        assert_eq!(taken[0].deployment_id, "dep-1");
        assert_eq!(taken[0].cpu_usage, 1.0);
        assert_eq!(taken[0].network_io, 20.0);
        assert!(taken[0].cost_estimate > 0.0);

        assert_eq!(f.store.list_usage_samples("dep-1").unwrap().len(), 1);
    }

    #[tokio::test]
    async fn retention_is_enforced_in_memory_and_store() {
        let config = CostConfig {
            retention: 3,
            ..CostConfig::default()
        };
        let f = fixture(config);
        for i in 0..5 {
            f.optimizer.record("dep-1", &busy(), NOW + i * 300).await.unwrap();
        }
        assert_eq!(f.optimizer.window_len("dep-1"), 3);
        let stored = f.store.list_usage_samples("dep-1").unwrap();
        assert_eq!(stored.len(), 3);
        assert_eq!(stored[0].timestamp, NOW + 600);
    }

    #[tokio::test]
    async fn budget_alert_published_once_per_month() {
        let mut config = CostConfig::default();
        config.budget = BudgetConfig {
            monthly_limit: 1.0,
            warning_threshold: 80.0,
            critical_threshold: 95.0,
            is_enabled: true,
        };
        let f = fixture(config);
        let mut events = f.bus.subscribe();
        f.optimizer.record("dep-1", &busy(), NOW).await.unwrap();

        let first = f.optimizer.check_budget(NOW).await;
        assert_eq!(first.len(), 2);
        assert!(f.optimizer.check_budget(NOW + 300).await.is_empty());

        let event = events.recv().await.unwrap();
        assert_eq!(event.topic, Topic::BudgetAlert);
        assert_eq!(event.payload["level"], "warning");
        assert_eq!(event.payload["period"], "2026-03");
    }

    #[tokio::test]
    async fn invalid_budget_rejected() {
        let f = fixture(CostConfig::default());
        let bad = BudgetConfig {
            warning_threshold: 95.0,
            critical_threshold: 80.0,
            ..BudgetConfig::default()
        };
        assert!(matches!(f.optimizer.set_budget(bad).await, Err(CostError::Budget(_))));
        assert!(f.store.get_budget().unwrap().is_none());
    }

    #[tokio::test]
    async fn restore_reloads_budget_and_history() {
        let f = fixture(CostConfig::default());
        let budget = BudgetConfig {
            monthly_limit: 250.0,
            is_enabled: true,
            ..BudgetConfig::default()
        };
        f.optimizer.set_budget(budget.clone()).await.unwrap();
        f.optimizer.record("dep-1", &busy(), NOW).await.unwrap();

        let fresh = fixture(CostConfig::default());
        let restored = CostOptimizer::new(
            CostConfig::default(),
            CallTimeouts::default(),
            fresh.registry.clone(),
            fresh.provisioner.clone(),
            f.store.clone(),
            fresh.bus.clone(),
        );
        restored.restore(&["dep-1".to_string()]).await.unwrap();
        assert_eq!(restored.budget(), budget);
        assert_eq!(restored.window_len("dep-1"), 1);
    }

    #[tokio::test]
    async fn restart_does_not_refire_alerts_in_the_same_period() {
        let mut config = CostConfig::default();
        config.budget = BudgetConfig {
            monthly_limit: 1.0,
            warning_threshold: 80.0,
            critical_threshold: 95.0,
            is_enabled: true,
        };
        let f = fixture(config.clone());
        f.optimizer.record("dep-1", &busy(), NOW).await.unwrap();
        assert_eq!(f.optimizer.check_budget(NOW).await.len(), 2);

        let stored = f.store.get_budget_alerts().unwrap().unwrap();
        assert_eq!(stored.period, "2026-03");
        assert_eq!(stored.fired, vec![BudgetLevel::Warning, BudgetLevel::Critical]);

        let fresh = fixture(config);
        let restarted = CostOptimizer::new(
            fresh.optimizer.config.clone(),
            CallTimeouts::default(),
            fresh.registry.clone(),
            fresh.provisioner.clone(),
            f.store.clone(),
            fresh.bus.clone(),
        );
        let mut events = fresh.bus.subscribe();
        restarted.restore(&["dep-1".to_string()]).await.unwrap();
        assert!(restarted.check_budget(NOW + 600).await.is_empty());
        assert!(events.try_recv().is_err());

        // The next month rearms both levels.
        restarted.record("dep-1", &busy(), NOW + 31 * 24 * 3600).await.unwrap();
        assert_eq!(restarted.check_budget(NOW + 31 * 24 * 3600).await.len(), 2);
    }

    #[tokio::test]
    async fn projection_drops_samples_past_retention() {
        let f = fixture(CostConfig::default());
        f.optimizer.record("dep-1", &busy(), NOW).await.unwrap();
        assert!(f.optimizer.projected_monthly_cost(NOW) > 0.0);

        let week_later = NOW + 7 * 24 * 3600;
        assert_eq!(f.optimizer.projected_monthly_cost(week_later), 0.0);
        assert_eq!(f.optimizer.window_len("dep-1"), 0);
        assert_eq!(f.optimizer.summary("dep-1", week_later).unwrap().samples, 0);
    }

    #[tokio::test]
    async fn purge_forgets_history() {
        let f = fixture(CostConfig::default());
        f.optimizer.record("dep-1", &busy(), NOW).await.unwrap();
        f.optimizer.purge("dep-1").await;
        assert!(f.optimizer.summary("dep-1", NOW).is_none());
        assert!(f.store.list_usage_samples("dep-1").unwrap().is_empty());
    }

    #[tokio::test]
    async fn summary_projects_month() {
        let f = fixture(CostConfig::default());
        f.optimizer.record("dep-1", &busy(), NOW).await.unwrap();
        let s = f.optimizer.summary("dep-1", NOW).unwrap();
        // One five-minute sample repeated over a 31-day month.
        let expected = s.window_cost * (31.0 * 24.0 * 12.0);
        assert!((s.projected_monthly_cost - expected).abs() < 1e-9);
        assert_eq!(f.optimizer.projected_monthly_cost(NOW), s.projected_monthly_cost);
    }
}

//! AutoscaleEngine — evaluation loop, scaling execution and the audit trail.
//!
//! Evaluations for distinct deployments run concurrently; a per-deployment
//! in-flight lock keeps two evaluations of the same deployment from
//! overlapping. The actual instance change is performed by a
//! [`ScaleTarget`] (the deployment controller).

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use berth_core::{AutoscaleConfig, CallTimeouts, EventBus, SingleFlight, Topic, epoch_secs, run_periodic};
use berth_registry::KeyedLocks;
use berth_state::{DeploymentStatus, InstanceCounter, LiveMetrics, Persistence, ScalingEvent, ScalingPolicy};
use dashmap::DashMap;
use serde_json::json;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use crate::error::{AutoscaleError, AutoscaleResult};
use crate::score::{ScalingAction, ScalingDecision, decide};

/// Source of live load metrics and instance counts.
#[async_trait]
pub trait MetricsSource: Send + Sync + 'static {
    /// Current aggregate load, or `None` if nothing is running.
    async fn current_metrics(&self, deployment_id: &str) -> anyhow::Result<Option<LiveMetrics>>;

    /// Instances currently running.
    async fn current_instances(&self, deployment_id: &str) -> anyhow::Result<u32>;
}

/// Performs an instance count change.
#[async_trait]
pub trait ScaleTarget: Send + Sync + 'static {
    /// Move the deployment to `target` instances and return the count
    /// actually reached.
    async fn scale_to(&self, deployment_id: &str, target: u32) -> anyhow::Result<u32>;
}

pub struct AutoscaleEngine {
    config: AutoscaleConfig,
    calls: CallTimeouts,
    policies: DashMap<String, ScalingPolicy>,
    counters: DashMap<String, InstanceCounter>,
    in_flight: KeyedLocks,
    flight: SingleFlight,
    metrics: Arc<dyn MetricsSource>,
    target: Arc<dyn ScaleTarget>,
    persistence: Arc<dyn Persistence>,
    events: EventBus,
}

impl AutoscaleEngine {
    pub fn new(
        config: AutoscaleConfig,
        calls: CallTimeouts,
        metrics: Arc<dyn MetricsSource>,
        target: Arc<dyn ScaleTarget>,
        persistence: Arc<dyn Persistence>,
        events: EventBus,
    ) -> Self {
        Self {
            config,
            calls,
            policies: DashMap::new(),
            counters: DashMap::new(),
            in_flight: KeyedLocks::new(),
            flight: SingleFlight::new(),
            metrics,
            target,
            persistence,
            events,
        }
    }

    /// Load every persisted policy. Returns the number loaded.
    pub async fn load_policies(&self) -> AutoscaleResult<usize> {
        let policies = self
            .with_timeout("list_policies", "*", self.persistence.list_policies())
            .await??;
        let mut loaded = 0;
        for policy in policies {
            if let Err(e) = policy.validate() {
                warn!(deployment_id = %policy.deployment_id, error = %e, "skipping invalid stored policy");
                continue;
            }
            self.policies.insert(policy.deployment_id.clone(), policy);
            loaded += 1;
        }
        info!(count = loaded, "scaling policies loaded");
        Ok(loaded)
    }

    /// Validate, persist and activate a policy.
    pub async fn set_policy(&self, policy: ScalingPolicy) -> AutoscaleResult<()> {
        policy.validate()?;
        let id = policy.deployment_id.clone();
        self.with_timeout("put_policy", &id, self.persistence.put_policy(&policy))
            .await??;
        info!(
            deployment_id = %id,
            min = policy.min_instances,
            max = policy.max_instances,
            enabled = policy.is_enabled,
            "scaling policy updated"
        );
        self.policies.insert(id, policy);
        Ok(())
    }

    pub fn policy(&self, deployment_id: &str) -> Option<ScalingPolicy> {
        self.policies.get(deployment_id).map(|p| p.value().clone())
    }

    pub fn counter(&self, deployment_id: &str) -> Option<InstanceCounter> {
        self.counters.get(deployment_id).map(|c| c.value().clone())
    }

    /// Evaluate one deployment and execute the decision.
    pub async fn evaluate(&self, deployment_id: &str, now: u64) -> AutoscaleResult<ScalingDecision> {
        let Some(_guard) = self.in_flight.try_lock(deployment_id) else {
            return Err(AutoscaleError::InFlight(deployment_id.to_string()));
        };
        let policy = self.enabled_policy(deployment_id)?;
        let counter = self.load_counter(deployment_id).await?;

        let metrics = self
            .with_timeout("current_metrics", deployment_id, self.metrics.current_metrics(deployment_id))
            .await?
            .map_err(AutoscaleError::Metrics)?
            .ok_or_else(|| AutoscaleError::NoMetrics(deployment_id.to_string()))?;

        let step = policy.scale_amount.unwrap_or(self.config.step);
        let decision = decide(&policy, &counter, &metrics, step, now);
        if !decision.changes_instances() {
            debug!(
                %deployment_id,
                score = decision.score,
                confidence = decision.confidence,
                reason = %decision.reason,
                "no scaling change"
            );
            return Ok(decision);
        }

        self.execute(counter, decision.target_instances, decision.reason.clone(), Some(metrics), now)
            .await?;
        Ok(decision)
    }

    /// Apply an operator-requested instance count. Scoring is skipped, but
    /// the target is clamped to the policy bounds and a new cooldown window
    /// starts.
    pub async fn manual_override(
        &self,
        deployment_id: &str,
        requested: u32,
        now: u64,
    ) -> AutoscaleResult<InstanceCounter> {
        let _guard = self.in_flight.lock(deployment_id).await;
        let policy = self
            .policy(deployment_id)
            .ok_or_else(|| AutoscaleError::NoPolicy(deployment_id.to_string()))?;
        let counter = self.load_counter(deployment_id).await?;
        let target = policy.clamp(requested);
        if target != requested {
            info!(%deployment_id, requested, target, "manual override clamped to policy bounds");
        }
        let reason = format!("manual override: requested {requested}, applied {target}");
        self.execute(counter, target, reason, None, now).await
    }

    /// Evaluate every enabled policy concurrently. Skipped entirely if the
    /// previous pass is still running.
    pub async fn evaluate_all(self: &Arc<Self>, now: u64) -> Vec<(String, AutoscaleResult<ScalingDecision>)> {
        let Some(_flight) = self.flight.try_begin() else {
            return Vec::new();
        };

        let enabled: Vec<String> = self
            .policies
            .iter()
            .filter(|p| p.is_enabled)
            .map(|p| p.key().clone())
            .collect();
        let mut set = JoinSet::new();
        for id in enabled {
            let this = Arc::clone(self);
            set.spawn(async move {
                let result = this.evaluate(&id, now).await;
                (id, result)
            });
        }

        let mut results = Vec::new();
        while let Some(joined) = set.join_next().await {
            match joined {
                Ok((id, result)) => {
                    match &result {
                        Ok(_) | Err(AutoscaleError::NoMetrics(_)) | Err(AutoscaleError::InFlight(_)) => {}
                        Err(e) => warn!(deployment_id = %id, error = %e, "scaling evaluation failed"),
                    }
                    results.push((id, result));
                }
                Err(e) => error!(error = %e, "scaling evaluation task panicked"),
            }
        }
        results.sort_by(|a, b| a.0.cmp(&b.0));
        results
    }

    /// Drop all scaling state for a deployment.
    pub async fn purge(&self, deployment_id: &str) {
        let _guard = self.in_flight.lock(deployment_id).await;
        self.policies.remove(deployment_id);
        self.counters.remove(deployment_id);
        match self
            .with_timeout("purge_deployment", deployment_id, self.persistence.purge_deployment(deployment_id))
            .await
        {
            Ok(Ok(())) => debug!(%deployment_id, "scaling state purged"),
            Ok(Err(e)) => warn!(%deployment_id, error = %e, "failed to purge scaling state"),
            Err(e) => warn!(%deployment_id, error = %e, "failed to purge scaling state"),
        }
    }

    /// Evaluate on the configured interval until shutdown, dropping state
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
                                warn!(skipped = n, "autoscaler lagged behind status events");
                            }
                            Err(broadcast::error::RecvError::Closed) => break,
                        },
                        _ = shutdown.changed() => break,
                    }
                }
            })
        };

        run_periodic("autoscale", self.config.interval, shutdown, || {
            let this = Arc::clone(&self);
            async move {
                let results = this.evaluate_all(epoch_secs()).await;
                let scaled = results
                    .iter()
                    .filter(|(_, r)| matches!(r, Ok(d) if d.changes_instances()))
                    .count();
                debug!(evaluated = results.len(), scaled, "autoscale pass finished");
            }
        })
        .await;

        if let Err(e) = listener.await {
            error!(error = %e, "autoscale status listener panicked");
        }
    }

    fn enabled_policy(&self, deployment_id: &str) -> AutoscaleResult<ScalingPolicy> {
        let policy = self
            .policy(deployment_id)
            .ok_or_else(|| AutoscaleError::NoPolicy(deployment_id.to_string()))?;
        if !policy.is_enabled {
            return Err(AutoscaleError::Disabled(deployment_id.to_string()));
        }
        Ok(policy)
    }

    /// The cached counter, else the persisted one, else a fresh one. The
    /// instance count is always replaced by the live count, since sandboxes
    /// can be reclaimed between evaluations.
    async fn load_counter(&self, deployment_id: &str) -> AutoscaleResult<InstanceCounter> {
        let live = self
            .with_timeout(
                "current_instances",
                deployment_id,
                self.metrics.current_instances(deployment_id),
            )
            .await?
            .map_err(AutoscaleError::Metrics)?;

        let cached = self.counter(deployment_id);
        let mut counter = match cached {
            Some(counter) => counter,
            None => self
                .with_timeout(
                    "get_instance_counter",
                    deployment_id,
                    self.persistence.get_instance_counter(deployment_id),
                )
                .await??
                .unwrap_or_else(|| InstanceCounter::new(deployment_id, live)),
        };
        if counter.current_instances != live {
            debug!(
                %deployment_id,
                recorded = counter.current_instances,
                live,
                "instance count drifted, using live count"
            );
            counter.current_instances = live;
        }
        self.counters.insert(deployment_id.to_string(), counter.clone());
        Ok(counter)
    }

    /// Scale to `target`, then record the event, the counter and the
    /// `scaling:executed` notification.
    async fn execute(
        &self,
        mut counter: InstanceCounter,
        target: u32,
        reason: String,
        metrics: Option<LiveMetrics>,
        now: u64,
    ) -> AutoscaleResult<InstanceCounter> {
        let deployment_id = counter.deployment_id.clone();
        let from = counter.current_instances;

        let reached = match tokio::time::timeout(
            self.calls.provision,
            self.target.scale_to(&deployment_id, target),
        )
        .await
        {
            Ok(Ok(reached)) => reached,
            Ok(Err(source)) => {
                return Err(AutoscaleError::Scale {
                    deployment_id,
                    target,
                    source,
                });
            }
            Err(_) => {
                return Err(AutoscaleError::Timeout {
                    operation: "scale_to",
                    deployment_id,
                });
            }
        };

        counter.target_instances = target;
        if reached == from {
            // Nothing moved: no cooldown window, no audit entry.
            debug!(%deployment_id, instances = from, target, "scale request left instance count unchanged");
            self.counters.insert(deployment_id, counter.clone());
            return Ok(counter);
        }

        counter.current_instances = reached;
        counter.last_scaling_action = Some(now);
        counter.last_scaling_reason = Some(reason.clone());
        self.counters.insert(deployment_id.clone(), counter.clone());

        let event = ScalingEvent {
            deployment_id: deployment_id.clone(),
            from_instances: from,
            to_instances: reached,
            reason: reason.clone(),
            metrics_snapshot: metrics,
            timestamp: now,
        };
        if let Err(e) = self
            .with_timeout("record_scaling_event", &deployment_id, self.persistence.record_scaling_event(&event))
            .await
            .and_then(|r| r.map_err(AutoscaleError::from))
        {
            warn!(%deployment_id, error = %e, "failed to record scaling event");
        }
        self.with_timeout(
            "upsert_instance_counter",
            &deployment_id,
            self.persistence.upsert_instance_counter(&counter),
        )
        .await??;

        info!(%deployment_id, from, to = reached, target, %reason, "scaling executed");
        self.events.emit(
            Topic::ScalingExecuted,
            Some(&deployment_id),
            json!({
                "from_instances": from,
                "to_instances": reached,
                "target_instances": target,
                "reason": reason,
            }),
        );
        Ok(counter)
    }

    async fn with_timeout<T>(
        &self,
        operation: &'static str,
        deployment_id: &str,
        fut: impl Future<Output = T>,
    ) -> AutoscaleResult<T> {
        let limit: Duration = match operation {
            "current_metrics" | "current_instances" => self.calls.health_check,
            _ => self.calls.persistence,
        };
        tokio::time::timeout(limit, fut).await.map_err(|_| AutoscaleError::Timeout {
            operation,
            deployment_id: deployment_id.to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use berth_state::{Comparison, MetricKind, MetricRule, StateStore};
    use std::sync::Mutex;

    /// Fake deployment with a settable load and instance count.
    #[derive(Default)]
    struct FakeFleet {
        metrics: Mutex<Option<LiveMetrics>>,
        instances: Mutex<u32>,
        calls: Mutex<Vec<u32>>,
    }

    impl FakeFleet {
        fn new(instances: u32, cpu: f64, memory: f64) -> Arc<Self> {
            let fleet = Self::default();
            *fleet.instances.lock().unwrap() = instances;
            *fleet.metrics.lock().unwrap() = Some(LiveMetrics {
                cpu_percent: cpu,
                memory_percent: memory,
                ..LiveMetrics::default()
            });
            Arc::new(fleet)
        }
    }

    #[async_trait]
    impl MetricsSource for FakeFleet {
        async fn current_metrics(&self, _: &str) -> anyhow::Result<Option<LiveMetrics>> {
            Ok(self.metrics.lock().unwrap().clone())
        }

        async fn current_instances(&self, _: &str) -> anyhow::Result<u32> {
            Ok(*self.instances.lock().unwrap())
        }
    }

    #[async_trait]
    impl ScaleTarget for FakeFleet {
        async fn scale_to(&self, _: &str, target: u32) -> anyhow::Result<u32> {
            self.calls.lock().unwrap().push(target);
            *self.instances.lock().unwrap() = target;
            Ok(target)
        }
    }

    fn policy(max: u32) -> ScalingPolicy {
        ScalingPolicy::new(
            "dep-1",
            vec![
                MetricRule::new(MetricKind::Cpu, 0.7, Comparison::GreaterThan, 0.5),
                MetricRule::new(MetricKind::Memory, 0.6, Comparison::GreaterThan, 0.5),
            ],
            0.65,
            0.35,
            180,
            1,
            max,
        )
        .unwrap()
    }

    fn engine(fleet: &Arc<FakeFleet>) -> (Arc<AutoscaleEngine>, Arc<StateStore>, EventBus) {
        let store = Arc::new(StateStore::open_in_memory().unwrap());
        let (bus, _queue) = EventBus::new(64);
        let engine = AutoscaleEngine::new(
            AutoscaleConfig::default(),
            CallTimeouts::default(),
            fleet.clone(),
            fleet.clone(),
            store.clone(),
            bus.clone(),
        );
        (Arc::new(engine), store, bus)
    }

    #[tokio::test]
    async fn scale_up_is_recorded_and_announced() {
        let fleet = FakeFleet::new(1, 80.0, 50.0);
        let (engine, store, bus) = engine(&fleet);
        let mut events = bus.subscribe();
        engine.set_policy(policy(3)).await.unwrap();

        let d = engine.evaluate("dep-1", 1000).await.unwrap();
        assert_eq!(d.action, ScalingAction::ScaleUp);
        assert_eq!(*fleet.instances.lock().unwrap(), 2);

        let history = store.list_scaling_events("dep-1", 10).unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!((history[0].from_instances, history[0].to_instances), (1, 2));
        assert!(history[0].metrics_snapshot.is_some());

        let counter = store.get_instance_counter("dep-1").unwrap().unwrap();
        assert_eq!(counter.current_instances, 2);
        assert_eq!(counter.last_scaling_action, Some(1000));

        let event = events.recv().await.unwrap();
        assert_eq!(event.topic, Topic::ScalingExecuted);
        assert_eq!(event.payload["to_instances"], 2);
    }

    #[tokio::test]
    async fn no_second_action_within_cooldown() {
        let fleet = FakeFleet::new(1, 95.0, 95.0);
        let (engine, store, _bus) = engine(&fleet);
        engine.set_policy(policy(5)).await.unwrap();

        assert_eq!(engine.evaluate("dep-1", 1000).await.unwrap().action, ScalingAction::ScaleUp);
        let held = engine.evaluate("dep-1", 1100).await.unwrap();
        assert_eq!(held.action, ScalingAction::NoChange);
        assert_eq!(engine.evaluate("dep-1", 1180).await.unwrap().action, ScalingAction::ScaleUp);

        assert_eq!(*fleet.calls.lock().unwrap(), vec![2, 3]);
        assert_eq!(store.list_scaling_events("dep-1", 10).unwrap().len(), 2);
    }

    #[tokio::test]
    async fn no_change_is_not_recorded() {
        let fleet = FakeFleet::new(2, 50.0, 50.0);
        let (engine, store, _bus) = engine(&fleet);
        engine.set_policy(policy(5)).await.unwrap();

        let d = engine.evaluate("dep-1", 1000).await.unwrap();
        assert_eq!(d.action, ScalingAction::NoChange);
        assert!(store.list_scaling_events("dep-1", 10).unwrap().is_empty());
        assert!(fleet.calls.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn manual_override_is_clamped_and_starts_cooldown() {
        let fleet = FakeFleet::new(1, 95.0, 95.0);
        let (engine, _store, _bus) = engine(&fleet);
        engine.set_policy(policy(3)).await.unwrap();

        let counter = engine.manual_override("dep-1", 5, 2000).await.unwrap();
        assert_eq!(counter.current_instances, 3);
        assert_eq!(counter.last_scaling_action, Some(2000));

        // Idle load would scale down, but the override's cooldown holds it.
        *fleet.metrics.lock().unwrap() = Some(LiveMetrics::default());
        let d = engine.evaluate("dep-1", 2100).await.unwrap();
        assert_eq!(d.action, ScalingAction::NoChange);
        assert!(d.reason.contains("cooldown"));
    }

    #[tokio::test]
    async fn reclaimed_instances_are_seen_by_the_next_evaluation() {
        let fleet = FakeFleet::new(1, 95.0, 95.0);
        let (engine, store, _bus) = engine(&fleet);
        engine.set_policy(policy(5)).await.unwrap();

        let first = engine.evaluate("dep-1", 1000).await.unwrap();
        assert_eq!((first.current_instances, first.target_instances), (1, 2));

        // A sandbox was reclaimed behind the autoscaler's back.
        *fleet.instances.lock().unwrap() = 1;

        let second = engine.evaluate("dep-1", 1180).await.unwrap();
        assert_eq!(second.action, ScalingAction::ScaleUp);
        assert_eq!((second.current_instances, second.target_instances), (1, 2));
        assert_eq!(*fleet.calls.lock().unwrap(), vec![2, 2]);

        let history = store.list_scaling_events("dep-1", 10).unwrap();
        assert_eq!(history.len(), 2);
        assert!(history.iter().all(|e| (e.from_instances, e.to_instances) == (1, 2)));
        assert_eq!(engine.counter("dep-1").unwrap().current_instances, 2);
    }

    #[tokio::test]
    async fn unchanged_instance_count_starts_no_cooldown() {
        let fleet = FakeFleet::new(2, 95.0, 95.0);
        let (engine, store, bus) = engine(&fleet);
        let mut events = bus.subscribe();
        engine.set_policy(policy(5)).await.unwrap();

        let counter = engine.manual_override("dep-1", 2, 1000).await.unwrap();
        assert_eq!(counter.current_instances, 2);
        assert_eq!(counter.last_scaling_action, None);
        assert!(store.list_scaling_events("dep-1", 10).unwrap().is_empty());
        assert!(events.try_recv().is_err());

        // High load right after is not held back by a cooldown.
        let d = engine.evaluate("dep-1", 1010).await.unwrap();
        assert_eq!(d.action, ScalingAction::ScaleUp);
        assert_eq!(d.target_instances, 3);
    }

    #[tokio::test]
    async fn overlapping_evaluation_is_rejected() {
        let fleet = FakeFleet::new(1, 80.0, 50.0);
        let (engine, _store, _bus) = engine(&fleet);
        engine.set_policy(policy(3)).await.unwrap();

        let _held = engine.in_flight.try_lock("dep-1").unwrap();
        let err = engine.evaluate("dep-1", 1000).await.unwrap_err();
        assert!(matches!(err, AutoscaleError::InFlight(_)));
    }

    #[tokio::test]
    async fn invalid_policy_is_rejected() {
        let fleet = FakeFleet::new(1, 0.0, 0.0);
        let (engine, _store, _bus) = engine(&fleet);
        let mut bad = policy(3);
        bad.min_instances = 4;
        assert!(matches!(engine.set_policy(bad).await, Err(AutoscaleError::Policy(_))));
        assert!(engine.policy("dep-1").is_none());
    }

    #[tokio::test]
    async fn purge_drops_policy_and_counter() {
        let fleet = FakeFleet::new(1, 80.0, 50.0);
        let (engine, store, _bus) = engine(&fleet);
        engine.set_policy(policy(3)).await.unwrap();
        engine.evaluate("dep-1", 1000).await.unwrap();

        engine.purge("dep-1").await;
        assert!(engine.policy("dep-1").is_none());
        assert!(engine.counter("dep-1").is_none());
        assert!(store.get_policy("dep-1").unwrap().is_none());
        // The audit trail survives.
        assert_eq!(store.list_scaling_events("dep-1", 10).unwrap().len(), 1);
    }

    #[tokio::test]
    async fn evaluate_all_covers_enabled_policies() {
        let fleet = FakeFleet::new(1, 80.0, 50.0);
        let (engine, _store, _bus) = engine(&fleet);
        engine.set_policy(policy(3)).await.unwrap();
        let mut disabled = policy(3);
        disabled.deployment_id = "dep-2".to_string();
        disabled.is_enabled = false;
        engine.set_policy(disabled).await.unwrap();

        let results = engine.evaluate_all(1000).await;
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].0, "dep-1");
        assert!(results[0].1.is_ok());
    }

    #[tokio::test]
    async fn load_policies_restores_persisted() {
        let fleet = FakeFleet::new(1, 80.0, 50.0);
        let (engine, store, _bus) = engine(&fleet);
        store.put_policy(&policy(3)).unwrap();
        assert_eq!(engine.load_policies().await.unwrap(), 1);
        assert_eq!(engine.policy("dep-1").unwrap().max_instances, 3);
    }
}

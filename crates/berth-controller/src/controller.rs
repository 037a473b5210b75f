//! DeploymentController — the lifecycle state machine.
//!
//! ```text
//! deploy_project ─► PENDING ─► PROVISIONING ─► BUILDING ─► RUNNING ─► supervisor
//!                                 ↻ retry        ↻ retry      │
//!                                 ↓ fallback                  │ kill
//!                                 └──────────────┴─► FAILED ◄─┘
//!                                                      │ cleanup (immediate, then sweep)
//!                                                      ▼
//!                                                  DESTROYED
//! ```
//!
//! Transitions for one deployment are serialized by a per-id lock that is
//! held only around the persistence write; collaborator calls never run
//! under it.

use std::future::Future;
use std::sync::Arc;

use berth_cleanup::{CleanupHandle, CleanupScheduler, ReclaimReason};
use berth_core::{BerthConfig, CallTimeouts, EventBus, Topic, epoch_secs};
use berth_provision::{ProjectClassifier, ProjectFile, ProjectProfile, Provisioner, SandboxSpec};
use berth_recovery::{ClassifiedError, RecoveryCoordinator};
use berth_registry::{KeyedLocks, SandboxRegistry};
use berth_state::{
    Complexity, Deployment, DeploymentError, DeploymentStatus, ErrorKind, HealthStatus, LiveMetrics,
    Persistence, SandboxMeta, StateResult,
};
use berth_timeout::TimeoutManager;
use dashmap::DashMap;
use serde_json::json;
use tokio::sync::{broadcast, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::{ControllerError, ControllerResult};
use crate::logs::LogBook;
use crate::types::{DeployConfig, DeploymentView, RestoreReport};

/// Collaborators injected into the controller.
pub struct Collaborators {
    pub registry: Arc<SandboxRegistry>,
    pub provisioner: Arc<dyn Provisioner>,
    pub classifier: Arc<dyn ProjectClassifier>,
    pub persistence: Arc<dyn Persistence>,
    /// Direct reclamation for stop, destroy and scale-in.
    pub cleanup: Arc<CleanupScheduler>,
    /// Immediate cleanup requests for failed deployments.
    pub cleanup_queue: CleanupHandle,
    pub events: EventBus,
}

pub struct DeploymentController {
    pub(crate) calls: CallTimeouts,
    pub(crate) registry: Arc<SandboxRegistry>,
    pub(crate) provisioner: Arc<dyn Provisioner>,
    classifier: Arc<dyn ProjectClassifier>,
    pub(crate) persistence: Arc<dyn Persistence>,
    pub(crate) cleanup: Arc<CleanupScheduler>,
    cleanup_queue: CleanupHandle,
    events: EventBus,
    locks: KeyedLocks,
    pub(crate) timeouts: TimeoutManager,
    pub(crate) recovery: RecoveryCoordinator,
    /// Cancels retry timers and the supervisor of a deployment.
    pub(crate) tokens: DashMap<String, CancellationToken>,
    /// Sandbox spec per live deployment, reused when adding instances.
    pub(crate) specs: DashMap<String, SandboxSpec>,
    logs: LogBook,
}

impl DeploymentController {
    pub fn new(config: &BerthConfig, deps: Collaborators) -> Self {
        Self {
            calls: config.calls.clone(),
            registry: deps.registry,
            provisioner: deps.provisioner,
            classifier: deps.classifier,
            persistence: deps.persistence,
            cleanup: deps.cleanup,
            cleanup_queue: deps.cleanup_queue,
            events: deps.events,
            locks: KeyedLocks::new(),
            timeouts: TimeoutManager::new(config.timeouts.clone()),
            recovery: RecoveryCoordinator::new(config.recovery.clone()),
            tokens: DashMap::new(),
            specs: DashMap::new(),
            logs: LogBook::default(),
        }
    }

    pub fn timeouts(&self) -> &TimeoutManager {
        &self.timeouts
    }

    pub fn registry(&self) -> &Arc<SandboxRegistry> {
        &self.registry
    }

    /// Create a deployment and drive it through the pipeline.
    ///
    /// Returns once the deployment is `RUNNING` (with its supervisor
    /// started), `FAILED` (cleanup already requested) or `STOPPED` by a
    /// concurrent stop. Only infrastructure errors (persistence) are `Err`.
    pub async fn deploy_project(
        self: &Arc<Self>,
        files: Vec<ProjectFile>,
        config: DeployConfig,
    ) -> ControllerResult<Deployment> {
        config.validate().map_err(ControllerError::InvalidRequest)?;

        let now = epoch_secs();
        let id = format!("dep-{}", Uuid::new_v4().simple());
        let profile = self.classify(&id, &files).await;
        let budget = self.timeouts.assign(&id, &profile, now);

        let mut deployment = Deployment::new(&id, &config.project_id, &config.owner_id, &config.runtime, now);
        deployment.complexity = Some(budget.complexity);
        if let Err(e) = self
            .persist("create_deployment", &id, self.persistence.create_deployment(&deployment))
            .await
        {
            self.timeouts.release(&id);
            return Err(e);
        }
        info!(
            deployment_id = %id,
            project_id = %config.project_id,
            owner_id = %config.owner_id,
            complexity = ?budget.complexity,
            files = files.len(),
            "deployment created"
        );
        self.log(&id, &format!("deployment created ({:?}, {} files)", budget.complexity, files.len()));
        self.announce(&deployment);

        let token = CancellationToken::new();
        self.tokens.insert(id.clone(), token.clone());
        self.specs.insert(id.clone(), config.sandbox_spec(&id, &files));
        self.run_pipeline(&id, token).await
    }

    /// Read-only view over the stored deployment, the registry and the
    /// log tail.
    pub async fn monitor_deployment(&self, deployment_id: &str) -> ControllerResult<DeploymentView> {
        let deployment = self.current(deployment_id).await?;
        let sandboxes = self.registry.for_deployment(deployment_id);
        Ok(DeploymentView {
            health: aggregate_health(&sandboxes),
            metrics: registry_metrics(&sandboxes),
            budget: self.timeouts.budget(deployment_id),
            logs: self.logs.tail(deployment_id),
            deployment,
            sandboxes,
        })
    }

    /// Stop a deployment in `PROVISIONING`, `BUILDING` or `RUNNING`: cancel
    /// pending retries and supervision, then release its sandboxes.
    pub async fn stop_deployment(&self, deployment_id: &str) -> ControllerResult<Deployment> {
        let current = self.current(deployment_id).await?;
        if !matches!(
            current.status,
            DeploymentStatus::Provisioning | DeploymentStatus::Building | DeploymentStatus::Running
        ) {
            return Err(ControllerError::InvalidState {
                id: deployment_id.to_string(),
                status: current.status,
                operation: "stop",
            });
        }

        // Commit STOPPED before cancelling so a cancelled pipeline reads it back.
        let stopped = self.transition(deployment_id, DeploymentStatus::Stopped, None).await?;
        self.stop_tracking(deployment_id);
        let released = self
            .cleanup
            .reclaim_deployment(deployment_id, ReclaimReason::Released)
            .await;
        info!(%deployment_id, released, "deployment stopped");
        self.log(deployment_id, &format!("stopped, {released} sandbox(es) released"));
        Ok(stopped)
    }

    /// Move a `STOPPED` or `FAILED` deployment to `DESTROYED`, terminating
    /// whatever is still registered for it.
    pub async fn destroy_deployment(&self, deployment_id: &str) -> ControllerResult<Deployment> {
        let current = self.current(deployment_id).await?;
        if !matches!(current.status, DeploymentStatus::Stopped | DeploymentStatus::Failed) {
            return Err(ControllerError::InvalidState {
                id: deployment_id.to_string(),
                status: current.status,
                operation: "destroy",
            });
        }

        self.cleanup
            .reclaim_deployment(deployment_id, ReclaimReason::Released)
            .await;
        let remaining = self.registry.count_for_deployment(deployment_id);
        if remaining > 0 {
            warn!(%deployment_id, remaining, "sandboxes left for the cleanup sweep");
        }
        self.finalize(deployment_id).await
    }

    /// Rebuild in-memory state after a restart.
    ///
    /// Sandbox records are reloaded into the registry, `RUNNING`
    /// deployments are supervised again, and deployments caught
    /// mid-pipeline are failed so cleanup reclaims what they created.
    pub async fn restore(self: &Arc<Self>) -> ControllerResult<RestoreReport> {
        let sandboxes = self
            .persist("list_sandboxes", "*", self.persistence.list_sandboxes())
            .await?;
        let mut report = RestoreReport {
            sandboxes: self.registry.rebuild(sandboxes),
            ..RestoreReport::default()
        };

        let deployments = self
            .persist("list_deployments", "*", self.persistence.list_deployments())
            .await?;
        for deployment in deployments {
            let id = deployment.id.clone();
            match deployment.status {
                DeploymentStatus::Pending | DeploymentStatus::Provisioning | DeploymentStatus::Building => {
                    let error = DeploymentError {
                        kind: ErrorKind::Unknown,
                        message: "interrupted by restart".to_string(),
                    };
                    self.transition(&id, DeploymentStatus::Failed, Some(error)).await?;
                    self.cleanup_queue.enqueue(&id);
                    report.interrupted.push(id);
                }
                DeploymentStatus::Running => {
                    let complexity = deployment.complexity.unwrap_or(Complexity::Simple);
                    self.timeouts.assign_tier(&id, complexity, deployment.created_at);
                    self.specs.insert(id.clone(), restored_spec(&deployment));
                    let token = CancellationToken::new();
                    self.tokens.insert(id.clone(), token.clone());
                    self.supervise(&id, token);
                    report.resumed.push(id);
                }
                _ => {}
            }
        }

        info!(
            sandboxes = report.sandboxes,
            resumed = report.resumed.len(),
            interrupted = report.interrupted.len(),
            "controller state restored"
        );
        Ok(report)
    }

    /// Finalize failed deployments once cleanup has reclaimed their last
    /// sandbox. Stops every supervisor on shutdown.
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let mut events = self.events.subscribe();
        loop {
            tokio::select! {
                next = events.recv() => match next {
                    Ok(event) if event.topic == Topic::SandboxCleanup
                        && event.payload["remaining"].as_u64() == Some(0) =>
                    {
                        if let Some(id) = event.deployment_id {
                            self.finalize_failed(&id).await;
                        }
                    }
                    Ok(_) => {}
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        warn!(skipped = n, "controller lagged behind cleanup events");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                },
                _ = shutdown.changed() => break,
            }
        }

        let mut stopped = 0;
        for entry in self.tokens.iter() {
            entry.value().cancel();
            stopped += 1;
        }
        info!(supervisors = stopped, "deployment controller stopped");
    }

    async fn finalize_failed(&self, deployment_id: &str) {
        match self.current(deployment_id).await {
            Ok(d) if d.status == DeploymentStatus::Failed => {
                if let Err(e) = self.finalize(deployment_id).await {
                    warn!(%deployment_id, error = %e, "failed to finalize deployment");
                }
            }
            Ok(_) => {}
            Err(e) => debug!(%deployment_id, error = %e, "cleanup event for unknown deployment"),
        }
    }

    async fn finalize(&self, deployment_id: &str) -> ControllerResult<Deployment> {
        self.stop_tracking(deployment_id);
        let destroyed = self.transition(deployment_id, DeploymentStatus::Destroyed, None).await?;
        self.specs.remove(deployment_id);
        self.logs.forget(deployment_id);
        Ok(destroyed)
    }

    /// Fail a deployment with an already-classified error and request
    /// immediate cleanup. A deployment that already left the pipeline
    /// (stopped concurrently) is returned unchanged: an operator stop wins
    /// over a late pipeline or supervisor failure.
    pub(crate) async fn fail(&self, deployment_id: &str, error: &ClassifiedError) -> ControllerResult<Deployment> {
        self.stop_tracking(deployment_id);
        let left = [DeploymentStatus::Stopped, DeploymentStatus::Failed, DeploymentStatus::Destroyed];
        let failed = match self
            .transition_unless(deployment_id, DeploymentStatus::Failed, Some(error.to_deployment_error()), &left)
            .await?
        {
            Ok(d) => d,
            Err(current) => {
                debug!(%deployment_id, from = %current.status, "deployment already left the pipeline");
                return Ok(current);
            }
        };
        self.cleanup_queue.enqueue(deployment_id);
        Ok(failed)
    }

    /// Cancel retry timers and supervision, and drop the time budget.
    fn stop_tracking(&self, deployment_id: &str) {
        if let Some((_, token)) = self.tokens.remove(deployment_id) {
            token.cancel();
        }
        self.timeouts.release(deployment_id);
    }

    /// Persist a status change and announce it after it commits.
    pub(crate) async fn transition(
        &self,
        deployment_id: &str,
        status: DeploymentStatus,
        error: Option<DeploymentError>,
    ) -> ControllerResult<Deployment> {
        let updated = {
            let _guard = self.locks.lock(deployment_id).await;
            self.persist(
                "update_deployment_status",
                deployment_id,
                self.persistence
                    .update_deployment_status(deployment_id, status, error, epoch_secs()),
            )
            .await?
        };
        self.committed(deployment_id, status, &updated);
        Ok(updated)
    }

    /// Like [`Self::transition`], but a deployment currently in one of
    /// `keep` is left alone and handed back as `Err`. The status check and
    /// the update happen under the same per-deployment lock.
    async fn transition_unless(
        &self,
        deployment_id: &str,
        status: DeploymentStatus,
        error: Option<DeploymentError>,
        keep: &[DeploymentStatus],
    ) -> ControllerResult<Result<Deployment, Deployment>> {
        let updated = {
            let _guard = self.locks.lock(deployment_id).await;
            let current = self.current(deployment_id).await?;
            if keep.contains(&current.status) {
                return Ok(Err(current));
            }
            self.persist(
                "update_deployment_status",
                deployment_id,
                self.persistence
                    .update_deployment_status(deployment_id, status, error, epoch_secs()),
            )
            .await?
        };
        self.committed(deployment_id, status, &updated);
        Ok(Ok(updated))
    }

    fn committed(&self, deployment_id: &str, status: DeploymentStatus, updated: &Deployment) {
        match &updated.last_error {
            Some(e) if status == DeploymentStatus::Failed => {
                info!(%deployment_id, %status, kind = %e.kind, error = %e.message, "deployment status changed");
                self.log(deployment_id, &format!("status {status}: {} ({})", e.message, e.kind));
            }
            _ => {
                info!(%deployment_id, %status, "deployment status changed");
                self.log(deployment_id, &format!("status {status}"));
            }
        }
        self.announce(updated);
    }

    /// Record a new sandbox on the deployment.
    pub(crate) async fn attach(&self, deployment_id: &str, sandbox_id: &str) -> ControllerResult<()> {
        let _guard = self.locks.lock(deployment_id).await;
        let mut deployment = self.current(deployment_id).await?;
        deployment.sandbox_ids.push(sandbox_id.to_string());
        self.persist("put_deployment", deployment_id, self.persistence.put_deployment(&deployment))
            .await
    }

    pub(crate) async fn current(&self, deployment_id: &str) -> ControllerResult<Deployment> {
        self.persist("get_deployment", deployment_id, self.persistence.get_deployment(deployment_id))
            .await?
            .ok_or_else(|| ControllerError::NotFound(deployment_id.to_string()))
    }

    pub(crate) async fn persist<T>(
        &self,
        operation: &'static str,
        target: &str,
        fut: impl Future<Output = StateResult<T>>,
    ) -> ControllerResult<T> {
        match tokio::time::timeout(self.calls.persistence, fut).await {
            Ok(result) => Ok(result?),
            Err(_) => Err(ControllerError::Timeout {
                operation,
                target: target.to_string(),
            }),
        }
    }

    pub(crate) fn log(&self, deployment_id: &str, message: &str) {
        self.logs.push(deployment_id, epoch_secs(), message);
    }

    fn announce(&self, deployment: &Deployment) {
        self.events.emit(
            Topic::DeploymentStatus,
            Some(&deployment.id),
            json!({
                "status": deployment.status.as_str(),
                "project_id": deployment.project_id,
                "owner_id": deployment.owner_id,
                "error": deployment.last_error,
            }),
        );
    }

    /// Ask the classifier for a project profile. A failed or slow
    /// classifier falls back to the file count alone.
    async fn classify(&self, deployment_id: &str, files: &[ProjectFile]) -> ProjectProfile {
        let fallback = ProjectProfile {
            file_count: u32::try_from(files.len()).unwrap_or(u32::MAX),
            dependency_count: 0,
            estimated_build_secs: 0,
        };
        match tokio::time::timeout(self.calls.classify, self.classifier.classify(files)).await {
            Ok(Ok(profile)) => profile,
            Ok(Err(e)) => {
                warn!(%deployment_id, error = %e, "classifier failed, using file count");
                fallback
            }
            Err(_) => {
                warn!(%deployment_id, "classifier timed out, using file count");
                fallback
            }
        }
    }
}

/// Worst health across sandboxes; `Unknown` when there are none.
pub(crate) fn aggregate_health(sandboxes: &[SandboxMeta]) -> HealthStatus {
    if sandboxes.iter().any(|s| s.health == HealthStatus::Unhealthy) {
        HealthStatus::Unhealthy
    } else if !sandboxes.is_empty() && sandboxes.iter().all(|s| s.health == HealthStatus::Healthy) {
        HealthStatus::Healthy
    } else {
        HealthStatus::Unknown
    }
}

/// CPU and memory averaged over the sandboxes that reported usage.
pub(crate) fn registry_metrics(sandboxes: &[SandboxMeta]) -> LiveMetrics {
    let mean = |vals: Vec<f64>| {
        if vals.is_empty() {
            0.0
        } else {
            vals.iter().sum::<f64>() / vals.len() as f64
        }
    };
    LiveMetrics {
        cpu_percent: mean(sandboxes.iter().filter_map(|s| s.cpu_percent).collect()),
        memory_percent: mean(sandboxes.iter().filter_map(|s| s.memory_percent).collect()),
        ..LiveMetrics::default()
    }
}

/// Submitted files are not persisted, so a restored deployment scales out
/// with an empty file list and the default profile.
fn restored_spec(deployment: &Deployment) -> SandboxSpec {
    SandboxSpec {
        deployment_id: deployment.id.clone(),
        project_id: deployment.project_id.clone(),
        owner_id: deployment.owner_id.clone(),
        runtime: deployment.runtime.clone(),
        profile: Default::default(),
        env: Default::default(),
        files: Vec::new(),
    }
}

//! The provisioning → building → running pipeline and its recovery loop.

use std::sync::Arc;
use std::time::Duration;

use berth_cleanup::{CleanupError, ReclaimReason};
use berth_core::epoch_secs;
use berth_provision::SandboxSpec;
use berth_recovery::{ClassifiedError, Failure, RecoveryAction, RecoveryContext};
use berth_state::{Deployment, DeploymentStatus, HealthStatus, SandboxMeta, Stage, StateError};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::controller::DeploymentController;
use crate::error::{ControllerError, ControllerResult};

/// What the pipeline does after a stage failure.
enum Next {
    Retry,
    Fallback,
    Abort(ClassifiedError),
    Cancelled,
}

impl DeploymentController {
    pub(crate) async fn run_pipeline(
        self: &Arc<Self>,
        deployment_id: &str,
        token: CancellationToken,
    ) -> ControllerResult<Deployment> {
        let mut spec = self
            .specs
            .get(deployment_id)
            .map(|s| s.value().clone())
            .ok_or_else(|| ControllerError::NotFound(deployment_id.to_string()))?;

        // Provisioning.
        if !self.enter(deployment_id, DeploymentStatus::Provisioning, &token).await? {
            return self.current(deployment_id).await;
        }
        let budget = self.lease(deployment_id);
        let mut ctx = self.recovery.context(Stage::Provisioning);
        let sandbox = loop {
            let failure = match self.create_sandbox(deployment_id, &spec, budget).await {
                Ok(meta) => break meta,
                Err(failure) => failure,
            };
            match self.recover(deployment_id, &failure, &mut ctx, &token).await {
                Next::Retry => {
                    if !self.enter(deployment_id, DeploymentStatus::Provisioning, &token).await? {
                        return self.current(deployment_id).await;
                    }
                }
                Next::Fallback => {
                    spec.profile = spec.profile.smaller();
                    self.specs.insert(deployment_id.to_string(), spec.clone());
                    self.log(
                        deployment_id,
                        &format!(
                            "retrying with smaller profile ({} cores, {} MB)",
                            spec.profile.cpu_cores, spec.profile.memory_mb
                        ),
                    );
                }
                Next::Abort(error) => return self.fail(deployment_id, &error).await,
                Next::Cancelled => return self.current(deployment_id).await,
            }
        };
        // A stop that raced the create call must not leave the new sandbox behind.
        if token.is_cancelled() {
            self.release(&sandbox.id).await;
            return self.current(deployment_id).await;
        }

        // Building.
        if !self.enter(deployment_id, DeploymentStatus::Building, &token).await? {
            self.release(&sandbox.id).await;
            return self.current(deployment_id).await;
        }
        let mut ctx = self.recovery.context(Stage::Building);
        loop {
            let failure = match self.prepare_sandbox(&sandbox.id, &spec).await {
                Ok(()) => break,
                Err(failure) => failure,
            };
            match self.recover(deployment_id, &failure, &mut ctx, &token).await {
                Next::Retry | Next::Fallback => {
                    if !self.enter(deployment_id, DeploymentStatus::Building, &token).await? {
                        return self.current(deployment_id).await;
                    }
                }
                Next::Abort(error) => return self.fail(deployment_id, &error).await,
                Next::Cancelled => return self.current(deployment_id).await,
            }
        }

        // Running.
        if !self.enter(deployment_id, DeploymentStatus::Running, &token).await? {
            return self.current(deployment_id).await;
        }
        self.probe(deployment_id).await;
        self.supervise(deployment_id, token);
        self.current(deployment_id).await
    }

    /// Enter `status` unless the pipeline was cancelled or the deployment
    /// already left it. Returns `false` when the pipeline must stop here.
    async fn enter(
        &self,
        deployment_id: &str,
        status: DeploymentStatus,
        token: &CancellationToken,
    ) -> ControllerResult<bool> {
        if token.is_cancelled() {
            return Ok(false);
        }
        match self.transition(deployment_id, status, None).await {
            Ok(_) => Ok(true),
            Err(ControllerError::State(StateError::InvalidTransition { from, .. }))
                if token.is_cancelled()
                    || matches!(
                        from,
                        DeploymentStatus::Stopped | DeploymentStatus::Failed | DeploymentStatus::Destroyed
                    ) =>
            {
                debug!(%deployment_id, %from, to = %status, "pipeline cancelled before transition");
                Ok(false)
            }
            Err(e) => Err(e),
        }
    }

    /// Consult the recovery coordinator. A retry waits out its backoff
    /// unless the deployment is stopped first.
    async fn recover(
        &self,
        deployment_id: &str,
        failure: &Failure,
        ctx: &mut RecoveryContext,
        token: &CancellationToken,
    ) -> Next {
        let decision = self.recovery.handle_error(deployment_id, failure, ctx);
        self.log(
            deployment_id,
            &format!("{} failed ({}): {}", ctx.stage, decision.error.kind, decision.error.message),
        );

        match decision.action {
            RecoveryAction::Retry => {
                let delay = decision.next_retry_in.unwrap_or_default();
                self.log(
                    deployment_id,
                    &format!(
                        "retry {} of {} in {}ms",
                        ctx.retry_count + 1,
                        ctx.max_retries,
                        delay.as_millis()
                    ),
                );
                tokio::select! {
                    _ = token.cancelled() => {
                        info!(%deployment_id, stage = %ctx.stage, "pending retry cancelled");
                        return Next::Cancelled;
                    }
                    _ = tokio::time::sleep(delay) => {}
                }
                ctx.retry_count += 1;
                Next::Retry
            }
            RecoveryAction::Fallback => {
                ctx.fallback_used = true;
                Next::Fallback
            }
            RecoveryAction::Abort => Next::Abort(decision.error),
        }
    }

    /// Create one sandbox and register it. The sandbox is in the registry
    /// before anything else can fail, so cleanup always sees it.
    pub(crate) async fn create_sandbox(
        &self,
        deployment_id: &str,
        spec: &SandboxSpec,
        budget: Duration,
    ) -> Result<SandboxMeta, Failure> {
        let handle = match tokio::time::timeout(self.calls.provision, self.provisioner.create(spec, budget)).await {
            Ok(Ok(handle)) => handle,
            Ok(Err(e)) => return Err(e.into()),
            Err(_) => {
                return Err(Failure::CallTimeout {
                    operation: "create".to_string(),
                    after: self.calls.provision,
                });
            }
        };

        let meta = SandboxMeta::new(
            &handle.sandbox_id,
            deployment_id,
            &spec.owner_id,
            epoch_secs(),
            budget.as_secs(),
        );
        self.registry.register(meta.clone());
        info!(
            %deployment_id,
            sandbox_id = %meta.id,
            cpu_cores = handle.profile.cpu_cores,
            memory_mb = handle.profile.memory_mb,
            "sandbox created"
        );
        self.log(deployment_id, &format!("sandbox {} created", meta.id));

        let recorded = match self
            .persist("put_sandbox", &meta.id, self.persistence.put_sandbox(&meta))
            .await
        {
            Ok(()) => self.attach(deployment_id, &meta.id).await,
            Err(e) => Err(e),
        };
        if let Err(e) = recorded {
            self.release(&meta.id).await;
            return Err(Failure::Internal(e.to_string()));
        }
        Ok(meta)
    }

    pub(crate) async fn prepare_sandbox(&self, sandbox_id: &str, spec: &SandboxSpec) -> Result<(), Failure> {
        match tokio::time::timeout(self.calls.prepare, self.provisioner.prepare(sandbox_id, spec)).await {
            Ok(result) => result.map_err(Failure::from),
            Err(_) => Err(Failure::CallTimeout {
                operation: "prepare".to_string(),
                after: self.calls.prepare,
            }),
        }
    }

    /// Probe every sandbox of a deployment once: health, then usage.
    pub(crate) async fn probe(&self, deployment_id: &str) {
        for meta in self.registry.for_deployment(deployment_id) {
            let health = tokio::time::timeout(self.calls.health_check, self.provisioner.health_check(&meta.id))
                .await
                .unwrap_or(HealthStatus::Unhealthy);
            if let Some(failures) = self.registry.record_health(&meta.id, health)
                && failures > 0
            {
                debug!(%deployment_id, sandbox_id = %meta.id, failures, "health check failed");
            }

            match tokio::time::timeout(self.calls.health_check, self.provisioner.usage(&meta.id)).await {
                Ok(Ok(Some(reading))) => {
                    self.registry
                        .record_usage(&meta.id, reading.cpu_percent, reading.memory_percent);
                    if let Some(at) = reading.last_activity {
                        self.registry.touch(&meta.id, at);
                    }
                }
                Ok(Ok(None)) => {}
                Ok(Err(e)) => debug!(sandbox_id = %meta.id, error = %e, "usage reading failed"),
                Err(_) => debug!(sandbox_id = %meta.id, "usage reading timed out"),
            }
        }
    }

    /// Release a single sandbox through the cleanup claim.
    pub(crate) async fn release(&self, sandbox_id: &str) {
        match self.cleanup.reclaim(sandbox_id, ReclaimReason::Released).await {
            Ok(()) | Err(CleanupError::AlreadyClaimed(_)) => {}
            Err(e) => warn!(%sandbox_id, error = %e, "sandbox release failed, left for cleanup"),
        }
    }

    /// Sandbox lease: the deployment's current granted budget.
    pub(crate) fn lease(&self, deployment_id: &str) -> Duration {
        self.timeouts
            .budget(deployment_id)
            .map(|b| b.granted)
            .unwrap_or(self.calls.provision)
    }
}

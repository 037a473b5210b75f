//! Per-deployment supervision of running deployments.
//!
//! Each `RUNNING` deployment gets a background task that probes its
//! sandboxes on the health-check interval and applies the timeout
//! manager's extension and kill rules. The task ends when the
//! deployment's cancellation token fires (stop, failure, destroy,
//! shutdown) or when it kills the deployment itself.

use std::sync::Arc;

use berth_core::epoch_secs;
use berth_recovery::Failure;
use berth_state::{Deployment, Stage};
use berth_timeout::{KillReason, Verdict};
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::controller::DeploymentController;
use crate::error::ControllerResult;

impl DeploymentController {
    /// Spawn the supervisor for a deployment.
    pub(crate) fn supervise(self: &Arc<Self>, deployment_id: &str, token: CancellationToken) {
        let this = Arc::clone(self);
        let deployment_id = deployment_id.to_string();
        let interval = self.timeouts.config().health_check_interval;

        tokio::spawn(async move {
            debug!(%deployment_id, interval_secs = interval.as_secs(), "supervisor started");
            let mut ticker = tokio::time::interval_at(Instant::now() + interval, interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = ticker.tick() => match this.check_deployment(&deployment_id, epoch_secs()).await {
                        Ok(Verdict::Kill(_)) => break,
                        Ok(_) => {}
                        Err(e) => error!(%deployment_id, error = %e, "supervision pass failed"),
                    },
                }
            }
            debug!(%deployment_id, "supervisor stopped");
        });
    }

    /// One supervision pass at `now`: probe every sandbox, then apply the
    /// extension and kill rules. A killed deployment is failed and queued
    /// for cleanup before this returns.
    ///
    /// Deployments without a time budget (not running, or already
    /// released) always get `Continue`.
    pub async fn check_deployment(&self, deployment_id: &str, now: u64) -> ControllerResult<Verdict> {
        if self.timeouts.budget(deployment_id).is_none() {
            return Ok(Verdict::Continue);
        }
        self.probe(deployment_id).await;

        let Some(obs) = self.timeouts.observe(&self.registry, deployment_id, now) else {
            return Ok(Verdict::Continue);
        };
        let verdict = self.timeouts.evaluate(deployment_id, &obs);
        match &verdict {
            Verdict::Continue => {}
            Verdict::Extended(granted) => {
                self.log(deployment_id, &format!("time budget extended to {}s", granted.as_secs()));
                self.extend_leases(deployment_id, now).await;
            }
            Verdict::Kill(reason) => {
                self.kill(deployment_id, reason.clone()).await?;
            }
        }
        Ok(verdict)
    }

    /// Route a kill through the classifier as a non-recoverable timeout.
    async fn kill(&self, deployment_id: &str, reason: KillReason) -> ControllerResult<Deployment> {
        let ctx = self.recovery.context(Stage::Running);
        let decision = self
            .recovery
            .handle_error(deployment_id, &Failure::Killed(reason.clone()), &ctx);
        info!(%deployment_id, %reason, "force-terminating deployment");
        self.fail(deployment_id, &decision.error).await
    }

    /// Push the new lease end onto every sandbox of the deployment.
    async fn extend_leases(&self, deployment_id: &str, now: u64) {
        let Some(elapsed) = self.timeouts.elapsed(deployment_id, now) else {
            return;
        };
        let granted = self.lease(deployment_id).as_secs();
        let end_at = now.saturating_sub(elapsed.as_secs()) + granted;

        for meta in self.registry.for_deployment(deployment_id) {
            self.registry.set_lease(&meta.id, end_at, granted);
            let Some(updated) = self.registry.get(&meta.id) else {
                continue;
            };
            if let Err(e) = self
                .persist("put_sandbox", &meta.id, self.persistence.put_sandbox(&updated))
                .await
            {
                warn!(%deployment_id, sandbox_id = %meta.id, error = %e, "failed to persist extended lease");
            }
        }
    }
}

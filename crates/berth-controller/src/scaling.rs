//! The controller as the autoscaler's instance target and metrics source.

use async_trait::async_trait;
use berth_autoscale::{MetricsSource, ScaleTarget};
use berth_cleanup::{CleanupError, ReclaimReason};
use berth_provision::UsageReading;
use berth_state::{DeploymentStatus, LiveMetrics};
use tracing::{debug, info, warn};

use crate::controller::{DeploymentController, registry_metrics};
use crate::error::ControllerError;

#[async_trait]
impl ScaleTarget for DeploymentController {
    /// Add or remove sandboxes one at a time until `target` is reached or a
    /// step fails. New instances are built before they count; removal
    /// takes the newest first.
    async fn scale_to(&self, deployment_id: &str, target: u32) -> anyhow::Result<u32> {
        let deployment = self.current(deployment_id).await?;
        if deployment.status != DeploymentStatus::Running {
            return Err(ControllerError::InvalidState {
                id: deployment_id.to_string(),
                status: deployment.status,
                operation: "scale",
            }
            .into());
        }
        let spec = self
            .specs
            .get(deployment_id)
            .map(|s| s.value().clone())
            .ok_or_else(|| ControllerError::NotFound(deployment_id.to_string()))?;

        let start = self.registry.count_for_deployment(deployment_id) as u32;
        let mut current = start;
        while current < target {
            let meta = match self
                .create_sandbox(deployment_id, &spec, self.lease(deployment_id))
                .await
            {
                Ok(meta) => meta,
                Err(failure) if current == start => anyhow::bail!("scale out failed: {}", failure.message()),
                Err(failure) => {
                    warn!(%deployment_id, reached = current, target, error = %failure.message(), "scale out stopped early");
                    break;
                }
            };
            if let Err(failure) = self.prepare_sandbox(&meta.id, &spec).await {
                self.release(&meta.id).await;
                if current == start {
                    anyhow::bail!("new instance failed to build: {}", failure.message());
                }
                warn!(%deployment_id, reached = current, target, error = %failure.message(), "scale out stopped early");
                break;
            }
            current += 1;
        }

        while current > target {
            let Some(newest) = self.registry.for_deployment(deployment_id).pop() else {
                break;
            };
            match self.cleanup.reclaim(&newest.id, ReclaimReason::Released).await {
                Ok(()) => current -= 1,
                // Someone else is already reclaiming it.
                Err(CleanupError::AlreadyClaimed(_)) => {
                    current = self.registry.count_for_deployment(deployment_id) as u32;
                }
                Err(e) => {
                    warn!(%deployment_id, sandbox_id = %newest.id, error = %e, "scale in stopped early");
                    break;
                }
            }
        }

        let reached = self.registry.count_for_deployment(deployment_id) as u32;
        info!(%deployment_id, from = start, to = reached, target, "instances scaled");
        self.log(deployment_id, &format!("scaled from {start} to {reached} instance(s)"));
        Ok(reached)
    }
}

#[async_trait]
impl MetricsSource for DeploymentController {
    /// Per-instance load: percentages, latency, error rate and request
    /// rate are averaged across sandboxes. Falls back to the last usage
    /// recorded in the registry when no sandbox answers.
    async fn current_metrics(&self, deployment_id: &str) -> anyhow::Result<Option<LiveMetrics>> {
        let sandboxes = self.registry.for_deployment(deployment_id);
        if sandboxes.is_empty() {
            return Ok(None);
        }

        let mut readings = Vec::with_capacity(sandboxes.len());
        for meta in &sandboxes {
            match tokio::time::timeout(self.calls.health_check, self.provisioner.usage(&meta.id)).await {
                Ok(Ok(Some(reading))) => readings.push(reading),
                Ok(Ok(None)) => {}
                Ok(Err(e)) => debug!(sandbox_id = %meta.id, error = %e, "usage reading failed"),
                Err(_) => debug!(sandbox_id = %meta.id, "usage reading timed out"),
            }
        }

        if readings.is_empty() {
            if sandboxes.iter().any(|s| s.cpu_percent.is_some()) {
                return Ok(Some(registry_metrics(&sandboxes)));
            }
            return Ok(None);
        }
        Ok(Some(mean_metrics(&readings)))
    }

    async fn current_instances(&self, deployment_id: &str) -> anyhow::Result<u32> {
        Ok(self.registry.count_for_deployment(deployment_id) as u32)
    }
}

fn mean_metrics(readings: &[UsageReading]) -> LiveMetrics {
    let n = readings.len() as f64;
    let mean = |f: fn(&UsageReading) -> f64| readings.iter().map(f).sum::<f64>() / n;
    LiveMetrics {
        cpu_percent: mean(|r| r.cpu_percent),
        memory_percent: mean(|r| r.memory_percent),
        response_time_ms: mean(|r| r.response_time_ms),
        error_rate: mean(|r| r.error_rate),
        requests_per_sec: mean(|r| r.requests_per_sec),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn readings_are_averaged_per_instance() {
        let busy = UsageReading {
            cpu_percent: 90.0,
            memory_percent: 40.0,
            requests_per_sec: 300.0,
            error_rate: 0.02,
            ..UsageReading::default()
        };
        let quiet = UsageReading {
            cpu_percent: 10.0,
            memory_percent: 20.0,
            requests_per_sec: 100.0,
            ..UsageReading::default()
        };
        let m = mean_metrics(&[busy, quiet]);
        assert_eq!(m.cpu_percent, 50.0);
        assert_eq!(m.memory_percent, 30.0);
        assert_eq!(m.requests_per_sec, 200.0);
        assert!((m.error_rate - 0.01).abs() < 1e-12);
    }
}

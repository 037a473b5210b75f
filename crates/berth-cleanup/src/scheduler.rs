//! CleanupScheduler — the reclamation loop and its immediate-request path.
//!
//! ```text
//! run_periodic(interval) ──► sweep ──► select_candidates ──► reclaim × batch
//! CleanupHandle::enqueue ──► mpsc ──► reclaim_deployment ──► reclaim × n
//! ```
//!
//! Both paths claim a sandbox through the registry before terminating it,
//! so the controller, the sweep and the immediate path never terminate
//! the same sandbox twice.

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use berth_core::{CallTimeouts, CleanupConfig, EventBus, SingleFlight, Topic, epoch_secs, run_periodic};
use berth_provision::Provisioner;
use berth_registry::SandboxRegistry;
use berth_state::{Deployment, Persistence, SandboxMeta};
use serde_json::json;
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, warn};

use crate::error::{CleanupError, CleanupResult};
use crate::policy::{ReclaimReason, select_candidates};

/// Queue depth of immediate cleanup requests.
const REQUEST_CAPACITY: usize = 256;

/// Outcome of one sweep.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct SweepReport {
    /// Another sweep was still running; nothing was done.
    pub skipped: bool,
    pub candidates: usize,
    pub reclaimed: Vec<(String, ReclaimReason)>,
    pub failed: Vec<String>,
}

/// Non-blocking handle for requesting immediate cleanup of a deployment.
#[derive(Clone)]
pub struct CleanupHandle {
    tx: mpsc::Sender<String>,
}

impl CleanupHandle {
    /// Ask for every sandbox of `deployment_id` to be reclaimed now. If the
    /// queue is full the next sweep picks the deployment up instead.
    pub fn enqueue(&self, deployment_id: &str) {
        if let Err(e) = self.tx.try_send(deployment_id.to_string()) {
            warn!(%deployment_id, error = %e, "immediate cleanup not queued, deferring to sweep");
        }
    }
}

pub struct CleanupScheduler {
    config: CleanupConfig,
    calls: CallTimeouts,
    registry: Arc<SandboxRegistry>,
    provisioner: Arc<dyn Provisioner>,
    persistence: Arc<dyn Persistence>,
    events: EventBus,
    flight: SingleFlight,
    /// Orphaned sandbox id → first time seen without an owner.
    orphans_seen: Mutex<HashMap<String, u64>>,
}

impl CleanupScheduler {
    pub fn new(
        config: CleanupConfig,
        calls: CallTimeouts,
        registry: Arc<SandboxRegistry>,
        provisioner: Arc<dyn Provisioner>,
        persistence: Arc<dyn Persistence>,
        events: EventBus,
    ) -> Self {
        Self {
            config,
            calls,
            registry,
            provisioner,
            persistence,
            events,
            flight: SingleFlight::new(),
            orphans_seen: Mutex::new(HashMap::new()),
        }
    }

    /// Create the immediate-request channel.
    pub fn channel() -> (CleanupHandle, mpsc::Receiver<String>) {
        let (tx, rx) = mpsc::channel(REQUEST_CAPACITY);
        (CleanupHandle { tx }, rx)
    }

    /// Run sweeps on the configured interval and serve immediate requests
    /// until shutdown.
    pub async fn run(self: Arc<Self>, mut requests: mpsc::Receiver<String>, shutdown: watch::Receiver<bool>) {
        let listener = {
            let this = Arc::clone(&self);
            let mut shutdown = shutdown.clone();
            tokio::spawn(async move {
                loop {
                    tokio::select! {
                        next = requests.recv() => match next {
                            Some(deployment_id) => {
                                this.reclaim_deployment(&deployment_id, ReclaimReason::Failed).await;
                            }
                            None => break,
                        },
                        _ = shutdown.changed() => break,
                    }
                }
            })
        };

        let interval = self.config.interval;
        run_periodic("cleanup", interval, shutdown, || {
            let this = Arc::clone(&self);
            async move {
                let report = this.sweep(epoch_secs()).await;
                if !report.failed.is_empty() {
                    warn!(failed = report.failed.len(), "cleanup sweep left sandboxes for next cycle");
                }
            }
        })
        .await;

        if let Err(e) = listener.await {
            error!(error = %e, "cleanup request listener panicked");
        }
    }

    /// One cleanup cycle. Skipped if a previous cycle is still running.
    pub async fn sweep(&self, now: u64) -> SweepReport {
        let Some(_flight) = self.flight.try_begin() else {
            return SweepReport {
                skipped: true,
                ..SweepReport::default()
            };
        };

        let deployments = match self
            .with_timeout("list_deployments", "state", self.calls.persistence, self.persistence.list_deployments())
            .await
        {
            Ok(list) => list.into_iter().map(|d| (d.id.clone(), d)).collect::<HashMap<String, Deployment>>(),
            Err(e) => {
                error!(error = %e, "cleanup sweep aborted: cannot read deployments");
                return SweepReport::default();
            }
        };

        let sandboxes = self.registry.snapshot();
        let orphans_seen = self.track_orphans(&sandboxes, &deployments, now);
        let candidates = select_candidates(&sandboxes, &deployments, &orphans_seen, &self.config, now);

        let mut report = SweepReport {
            candidates: candidates.len(),
            ..SweepReport::default()
        };
        for candidate in candidates {
            match self.reclaim(&candidate.sandbox_id, candidate.reason).await {
                Ok(()) => report.reclaimed.push((candidate.sandbox_id, candidate.reason)),
                Err(CleanupError::AlreadyClaimed(_)) => {}
                Err(e) => {
                    warn!(sandbox_id = %candidate.sandbox_id, error = %e, "reclaim failed, retrying next cycle");
                    report.failed.push(candidate.sandbox_id);
                }
            }
        }

        if !report.reclaimed.is_empty() || !report.failed.is_empty() {
            info!(
                candidates = report.candidates,
                reclaimed = report.reclaimed.len(),
                failed = report.failed.len(),
                "cleanup sweep finished"
            );
        } else {
            debug!(sandboxes = self.registry.len(), "cleanup sweep found nothing to reclaim");
        }
        report
    }

    /// Remember when each ownerless sandbox was first seen and forget
    /// sandboxes that regained an owner or disappeared.
    fn track_orphans(
        &self,
        sandboxes: &[SandboxMeta],
        deployments: &HashMap<String, Deployment>,
        now: u64,
    ) -> HashMap<String, u64> {
        let mut seen = self.orphans_seen.lock().unwrap_or_else(PoisonError::into_inner);
        let orphans: Vec<&str> = sandboxes
            .iter()
            .filter(|s| !deployments.contains_key(&s.deployment_id))
            .map(|s| s.id.as_str())
            .collect();
        seen.retain(|id, _| orphans.contains(&id.as_str()));
        for id in orphans {
            seen.entry(id.to_string()).or_insert(now);
        }
        seen.clone()
    }

    /// Reclaim every registered sandbox of one deployment. Returns the
    /// number reclaimed; failures are left for the sweep.
    pub async fn reclaim_deployment(&self, deployment_id: &str, reason: ReclaimReason) -> usize {
        let mut reclaimed = 0;
        for meta in self.registry.for_deployment(deployment_id) {
            match self.reclaim(&meta.id, reason).await {
                Ok(()) => reclaimed += 1,
                Err(CleanupError::AlreadyClaimed(_)) => {}
                Err(e) => warn!(%deployment_id, sandbox_id = %meta.id, error = %e, "reclaim failed"),
            }
        }
        reclaimed
    }

    /// Terminate one sandbox, drop its record and registry entry, and
    /// announce it. A failed termination releases the claim for a retry.
    pub async fn reclaim(&self, sandbox_id: &str, reason: ReclaimReason) -> CleanupResult<()> {
        if !self.registry.try_mark_reclaiming(sandbox_id) {
            return Err(CleanupError::AlreadyClaimed(sandbox_id.to_string()));
        }
        let Some(meta) = self.registry.get(sandbox_id) else {
            return Err(CleanupError::AlreadyClaimed(sandbox_id.to_string()));
        };

        let terminated = match tokio::time::timeout(self.calls.terminate, self.provisioner.terminate(sandbox_id)).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(source)) => Err(CleanupError::Terminate {
                sandbox_id: sandbox_id.to_string(),
                source,
            }),
            Err(_) => Err(CleanupError::Timeout {
                operation: "terminate",
                target: sandbox_id.to_string(),
            }),
        };
        if let Err(e) = terminated {
            self.registry.clear_reclaiming(sandbox_id);
            return Err(e);
        }

        // The sandbox is gone; a stale record is rebuilt into the registry
        // on restart and reclaimed again as an orphan, so this is not fatal.
        if let Err(e) = self
            .with_timeout("remove_sandbox", sandbox_id, self.calls.persistence, self.persistence.remove_sandbox(sandbox_id))
            .await
        {
            warn!(%sandbox_id, error = %e, "failed to remove sandbox record");
        }
        self.registry.remove(sandbox_id);
        self.orphans_seen
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(sandbox_id);

        info!(
            %sandbox_id,
            deployment_id = %meta.deployment_id,
            %reason,
            priority = reason.priority(),
            "sandbox reclaimed"
        );
        self.events.emit(
            Topic::SandboxCleanup,
            Some(&meta.deployment_id),
            json!({
                "sandbox_id": sandbox_id,
                "reason": reason.as_str(),
                "priority": reason.priority(),
                "remaining": self.registry.count_for_deployment(&meta.deployment_id),
            }),
        );
        Ok(())
    }

    async fn with_timeout<T>(
        &self,
        operation: &'static str,
        target: &str,
        limit: Duration,
        fut: impl Future<Output = berth_state::StateResult<T>>,
    ) -> CleanupResult<T> {
        match tokio::time::timeout(limit, fut).await {
            Ok(result) => Ok(result?),
            Err(_) => Err(CleanupError::Timeout {
                operation,
                target: target.to_string(),
            }),
        }
    }
}

//! Candidate selection. Pure: all inputs, including the clock, are passed in.

use std::collections::HashMap;

use berth_core::CleanupConfig;
use berth_state::{Deployment, DeploymentStatus, SandboxMeta};
use serde::{Deserialize, Serialize};

/// Why a sandbox is reclaimed. The discriminant order is the priority.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReclaimReason {
    /// The controller released the sandbox itself (stop, destroy, scale-in).
    Released,
    /// The owning deployment failed or is no longer active.
    Failed,
    Orphaned,
    QuotaExceeded,
    MaxAge,
    Idle,
}

impl ReclaimReason {
    /// Sweep priority, 1 (most urgent) through 5. Controller releases are 0.
    pub fn priority(&self) -> u8 {
        *self as u8
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ReclaimReason::Released => "released",
            ReclaimReason::Failed => "failed",
            ReclaimReason::Orphaned => "orphaned",
            ReclaimReason::QuotaExceeded => "quota_exceeded",
            ReclaimReason::MaxAge => "max_age",
            ReclaimReason::Idle => "idle",
        }
    }
}

impl std::fmt::Display for ReclaimReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Candidate {
    pub sandbox_id: String,
    pub deployment_id: String,
    pub reason: ReclaimReason,
    pub started_at: u64,
}

impl Candidate {
    fn new(meta: &SandboxMeta, reason: ReclaimReason) -> Self {
        Self {
            sandbox_id: meta.id.clone(),
            deployment_id: meta.deployment_id.clone(),
            reason,
            started_at: meta.started_at,
        }
    }
}

/// Choose this cycle's batch. Each sandbox is classified by the first rule
/// it matches; the result is ordered by priority, then oldest first, and
/// cut to `batch_size`.
///
/// `orphans_seen` maps an orphaned sandbox id to the time it was first
/// seen without an owner.
pub fn select_candidates(
    sandboxes: &[SandboxMeta],
    deployments: &HashMap<String, Deployment>,
    orphans_seen: &HashMap<String, u64>,
    config: &CleanupConfig,
    now: u64,
) -> Vec<Candidate> {
    let mut picked: Vec<Candidate> = Vec::new();
    let mut remaining: Vec<&SandboxMeta> = Vec::new();

    for meta in sandboxes {
        match deployments.get(&meta.deployment_id) {
            Some(d)
                if matches!(
                    d.status,
                    DeploymentStatus::Failed | DeploymentStatus::Stopped | DeploymentStatus::Destroyed
                ) =>
            {
                picked.push(Candidate::new(meta, ReclaimReason::Failed));
            }
            None => {
                let first_seen = orphans_seen.get(&meta.id).copied().unwrap_or(now);
                if now.saturating_sub(first_seen) >= config.orphan_grace.as_secs() {
                    picked.push(Candidate::new(meta, ReclaimReason::Orphaned));
                }
            }
            Some(_) => remaining.push(meta),
        }
    }

    // Quota: for each owner over the limit, evict its oldest sandboxes.
    let mut by_owner: HashMap<&str, Vec<&SandboxMeta>> = HashMap::new();
    for meta in &remaining {
        by_owner.entry(meta.owner_id.as_str()).or_default().push(*meta);
    }
    let mut evicted: Vec<&str> = Vec::new();
    for owned in by_owner.values_mut() {
        if owned.len() <= config.max_sandboxes_per_owner {
            continue;
        }
        owned.sort_by(|a, b| a.started_at.cmp(&b.started_at).then_with(|| a.id.cmp(&b.id)));
        let excess = owned.len() - config.max_sandboxes_per_owner;
        for &meta in &owned[..excess] {
            picked.push(Candidate::new(meta, ReclaimReason::QuotaExceeded));
            evicted.push(meta.id.as_str());
        }
    }

    let max_age = config.max_age.as_secs() + config.max_age_grace.as_secs();
    let idle_timeout = config.idle_timeout.as_secs();
    for meta in remaining {
        if evicted.contains(&meta.id.as_str()) {
            continue;
        }
        if now >= meta.started_at + max_age {
            picked.push(Candidate::new(meta, ReclaimReason::MaxAge));
        } else if now >= meta.last_activity + idle_timeout + meta.idle_grace_secs {
            picked.push(Candidate::new(meta, ReclaimReason::Idle));
        }
    }

    picked.sort_by(|a, b| {
        a.reason
            .cmp(&b.reason)
            .then_with(|| a.started_at.cmp(&b.started_at))
            .then_with(|| a.sandbox_id.cmp(&b.sandbox_id))
    });
    picked.truncate(config.batch_size);
    picked
}

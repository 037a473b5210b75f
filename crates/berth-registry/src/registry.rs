//! SandboxRegistry — authoritative in-memory map of live sandboxes.
//!
//! Entries are keyed by sandbox id. Besides the persisted metadata, each
//! entry carries a transient `reclaiming` mark: whoever sets it first
//! (controller or cleanup sweep) owns termination of that sandbox, so a
//! sandbox is never terminated twice.

use berth_state::{HealthStatus, SandboxMeta};
use dashmap::DashMap;
use tracing::debug;

#[derive(Debug, Clone)]
struct Entry {
    meta: SandboxMeta,
    reclaiming: bool,
}

#[derive(Default)]
pub struct SandboxRegistry {
    entries: DashMap<String, Entry>,
}

impl SandboxRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the registry contents with persisted records (startup rebuild).
    pub fn rebuild(&self, sandboxes: Vec<SandboxMeta>) -> usize {
        self.entries.clear();
        let count = sandboxes.len();
        for meta in sandboxes {
            self.register(meta);
        }
        debug!(count, "sandbox registry rebuilt");
        count
    }

    pub fn register(&self, meta: SandboxMeta) {
        self.entries.insert(
            meta.id.clone(),
            Entry {
                meta,
                reclaiming: false,
            },
        );
    }

    pub fn get(&self, sandbox_id: &str) -> Option<SandboxMeta> {
        self.entries.get(sandbox_id).map(|e| e.meta.clone())
    }

    pub fn contains(&self, sandbox_id: &str) -> bool {
        self.entries.contains_key(sandbox_id)
    }

    pub fn remove(&self, sandbox_id: &str) -> Option<SandboxMeta> {
        self.entries.remove(sandbox_id).map(|(_, e)| e.meta)
    }

    /// Claim a sandbox for termination. Returns false if it is unknown or
    /// already being reclaimed by someone else.
    pub fn try_mark_reclaiming(&self, sandbox_id: &str) -> bool {
        match self.entries.get_mut(sandbox_id) {
            Some(mut e) if !e.reclaiming => {
                e.reclaiming = true;
                true
            }
            _ => false,
        }
    }

    /// Release a claim after a failed termination so a later pass can retry.
    pub fn clear_reclaiming(&self, sandbox_id: &str) {
        if let Some(mut e) = self.entries.get_mut(sandbox_id) {
            e.reclaiming = false;
        }
    }

    pub fn is_reclaiming(&self, sandbox_id: &str) -> bool {
        self.entries.get(sandbox_id).is_some_and(|e| e.reclaiming)
    }

    /// Fold a health check result into the entry and return the updated
    /// consecutive failure count.
    pub fn record_health(&self, sandbox_id: &str, health: HealthStatus) -> Option<u32> {
        let mut e = self.entries.get_mut(sandbox_id)?;
        e.meta.record_health(health);
        Some(e.meta.consecutive_failures)
    }

    /// Record observed activity.
    pub fn touch(&self, sandbox_id: &str, now: u64) {
        if let Some(mut e) = self.entries.get_mut(sandbox_id) {
            e.meta.last_activity = e.meta.last_activity.max(now);
        }
    }

    pub fn record_usage(&self, sandbox_id: &str, cpu_percent: f64, memory_percent: f64) {
        if let Some(mut e) = self.entries.get_mut(sandbox_id) {
            e.meta.cpu_percent = Some(cpu_percent);
            e.meta.memory_percent = Some(memory_percent);
        }
    }

    /// Move the lease expiry (timeout extension).
    pub fn set_lease(&self, sandbox_id: &str, end_at: u64, idle_grace_secs: u64) {
        if let Some(mut e) = self.entries.get_mut(sandbox_id) {
            e.meta.end_at = end_at;
            e.meta.idle_grace_secs = idle_grace_secs;
        }
    }

    /// Sandboxes owned by one deployment, oldest first.
    pub fn for_deployment(&self, deployment_id: &str) -> Vec<SandboxMeta> {
        let mut out: Vec<SandboxMeta> = self
            .entries
            .iter()
            .filter(|e| e.meta.deployment_id == deployment_id)
            .map(|e| e.meta.clone())
            .collect();
        out.sort_by(|a, b| a.started_at.cmp(&b.started_at).then_with(|| a.id.cmp(&b.id)));
        out
    }

    pub fn count_for_deployment(&self, deployment_id: &str) -> usize {
        self.entries
            .iter()
            .filter(|e| e.meta.deployment_id == deployment_id)
            .count()
    }

    /// Point-in-time copy of all entries not currently being reclaimed.
    pub fn snapshot(&self) -> Vec<SandboxMeta> {
        self.entries
            .iter()
            .filter(|e| !e.reclaiming)
            .map(|e| e.meta.clone())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

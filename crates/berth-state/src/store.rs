//! StateStore — redb-backed persistence for Berth.
//!
//! Typed CRUD over deployments, sandboxes, scaling policies, the scaling
//! audit trail, instance counters, usage samples, the budget config and the
//! budget alerts already fired.
//! Multi-step updates (status transitions, sample retention) run inside a
//! single write transaction.

use std::path::Path;
use std::sync::Arc;

use redb::{Database, ReadableDatabase, ReadableTable, TableDefinition};
use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::debug;

use crate::error::{StateError, StateResult};
use crate::tables::*;
use crate::types::*;
use berth_core::BudgetConfig;

/// Convert any `Display` error into a `StateError` variant via a closure factory.
macro_rules! map_err {
    ($variant:ident) => {
        |e| StateError::$variant(e.to_string())
    };
}

type Table = TableDefinition<'static, &'static str, &'static [u8]>;

/// Thread-safe state store backed by redb.
#[derive(Clone)]
pub struct StateStore {
    db: Arc<Database>,
}

impl StateStore {
    /// Open (or create) a persistent state store at the given path.
    pub fn open(path: &Path) -> StateResult<Self> {
        let db = Database::create(path).map_err(map_err!(Open))?;
        let store = Self { db: Arc::new(db) };
        store.ensure_tables()?;
        debug!(?path, "state store opened");
        Ok(store)
    }

    /// Create an ephemeral in-memory state store (for testing).
    pub fn open_in_memory() -> StateResult<Self> {
        let backend = redb::backends::InMemoryBackend::new();
        let db = Database::builder()
            .create_with_backend(backend)
            .map_err(map_err!(Open))?;
        let store = Self { db: Arc::new(db) };
        store.ensure_tables()?;
        debug!("in-memory state store opened");
        Ok(store)
    }

    fn ensure_tables(&self) -> StateResult<()> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        for table in [
            DEPLOYMENTS,
            SANDBOXES,
            POLICIES,
            SCALING_EVENTS,
            COUNTERS,
            USAGE,
            SETTINGS,
        ] {
            txn.open_table(table).map_err(map_err!(Table))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(())
    }

    // ── Generic helpers ───────────────────────────────────────────

    fn put<T: Serialize>(&self, table: Table, key: &str, value: &T) -> StateResult<()> {
        let bytes = serde_json::to_vec(value).map_err(map_err!(Serialize))?;
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        {
            let mut t = txn.open_table(table).map_err(map_err!(Table))?;
            t.insert(key, bytes.as_slice()).map_err(map_err!(Write))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(())
    }

    fn get<T: DeserializeOwned>(&self, table: Table, key: &str) -> StateResult<Option<T>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let t = txn.open_table(table).map_err(map_err!(Table))?;
        match t.get(key).map_err(map_err!(Read))? {
            Some(guard) => {
                let value = serde_json::from_slice(guard.value()).map_err(map_err!(Deserialize))?;
                Ok(Some(value))
            }
            None => Ok(None),
        }
    }

    /// All values whose key starts with `prefix` (empty prefix = whole table),
    /// in key order.
    fn scan<T: DeserializeOwned>(&self, table: Table, prefix: &str) -> StateResult<Vec<T>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let t = txn.open_table(table).map_err(map_err!(Table))?;
        let mut results = Vec::new();
        for entry in t.range(prefix..).map_err(map_err!(Read))? {
            let (key, value) = entry.map_err(map_err!(Read))?;
            if !key.value().starts_with(prefix) {
                break;
            }
            results.push(serde_json::from_slice(value.value()).map_err(map_err!(Deserialize))?);
        }
        Ok(results)
    }

    /// Keys starting with `prefix`, in key order. Seeks to the prefix and
    /// stops at the first key past it.
    fn prefixed_keys(
        table: &impl ReadableTable<&'static str, &'static [u8]>,
        prefix: &str,
    ) -> StateResult<Vec<String>> {
        let mut keys = Vec::new();
        for entry in table.range(prefix..).map_err(map_err!(Read))? {
            let (key, _) = entry.map_err(map_err!(Read))?;
            if !key.value().starts_with(prefix) {
                break;
            }
            keys.push(key.value().to_string());
        }
        Ok(keys)
    }

    fn delete(&self, table: Table, key: &str) -> StateResult<bool> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let existed;
        {
            let mut t = txn.open_table(table).map_err(map_err!(Table))?;
            existed = t.remove(key).map_err(map_err!(Write))?.is_some();
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(existed)
    }

    // ── Deployments ────────────────────────────────────────────────

    /// Insert a new deployment. Fails if the id is already taken.
    pub fn create_deployment(&self, deployment: &Deployment) -> StateResult<()> {
        let value = serde_json::to_vec(deployment).map_err(map_err!(Serialize))?;
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        {
            let mut table = txn.open_table(DEPLOYMENTS).map_err(map_err!(Table))?;
            if table.get(deployment.table_key()).map_err(map_err!(Read))?.is_some() {
                return Err(StateError::Write(format!(
                    "deployment {} already exists",
                    deployment.id
                )));
            }
            table
                .insert(deployment.table_key(), value.as_slice())
                .map_err(map_err!(Write))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(deployment_id = %deployment.id, "deployment created");
        Ok(())
    }

    /// Insert or overwrite a deployment record.
    pub fn put_deployment(&self, deployment: &Deployment) -> StateResult<()> {
        self.put(DEPLOYMENTS, deployment.table_key(), deployment)
    }

    pub fn get_deployment(&self, id: &str) -> StateResult<Option<Deployment>> {
        self.get(DEPLOYMENTS, id)
    }

    pub fn list_deployments(&self) -> StateResult<Vec<Deployment>> {
        self.scan(DEPLOYMENTS, "")
    }

    /// Move a deployment to `status` in one read-check-write transaction.
    ///
    /// Rejects transitions the lifecycle does not allow. `error` replaces
    /// `last_error` when given; a successful forward move keeps the old one.
    pub fn update_deployment_status(
        &self,
        id: &str,
        status: DeploymentStatus,
        error: Option<DeploymentError>,
        now: u64,
    ) -> StateResult<Deployment> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let updated = {
            let mut table = txn.open_table(DEPLOYMENTS).map_err(map_err!(Table))?;
            let mut deployment: Deployment = {
                let guard = table
                    .get(id)
                    .map_err(map_err!(Read))?
                    .ok_or_else(|| StateError::NotFound(format!("deployment {id}")))?;
                serde_json::from_slice(guard.value()).map_err(map_err!(Deserialize))?
            };
            if !deployment.status.can_transition_to(status) {
                return Err(StateError::InvalidTransition {
                    id: id.to_string(),
                    from: deployment.status,
                    to: status,
                });
            }
            deployment.status = status;
            deployment.updated_at = now;
            if error.is_some() {
                deployment.last_error = error;
            }
            let value = serde_json::to_vec(&deployment).map_err(map_err!(Serialize))?;
            table.insert(id, value.as_slice()).map_err(map_err!(Write))?;
            deployment
        };
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(deployment_id = %id, %status, "deployment status updated");
        Ok(updated)
    }

    pub fn delete_deployment(&self, id: &str) -> StateResult<bool> {
        self.delete(DEPLOYMENTS, id)
    }

    // ── Sandboxes ──────────────────────────────────────────────────

    pub fn put_sandbox(&self, sandbox: &SandboxMeta) -> StateResult<()> {
        self.put(SANDBOXES, &sandbox.id, sandbox)
    }

    pub fn get_sandbox(&self, id: &str) -> StateResult<Option<SandboxMeta>> {
        self.get(SANDBOXES, id)
    }

    pub fn list_sandboxes(&self) -> StateResult<Vec<SandboxMeta>> {
        self.scan(SANDBOXES, "")
    }

    /// Remove a sandbox record. Returns true if it existed.
    pub fn remove_sandbox(&self, id: &str) -> StateResult<bool> {
        let existed = self.delete(SANDBOXES, id)?;
        debug!(sandbox_id = %id, existed, "sandbox record removed");
        Ok(existed)
    }

    // ── Policies ───────────────────────────────────────────────────

    pub fn put_policy(&self, policy: &ScalingPolicy) -> StateResult<()> {
        self.put(POLICIES, &policy.deployment_id, policy)
    }

    pub fn get_policy(&self, deployment_id: &str) -> StateResult<Option<ScalingPolicy>> {
        self.get(POLICIES, deployment_id)
    }

    pub fn list_policies(&self) -> StateResult<Vec<ScalingPolicy>> {
        self.scan(POLICIES, "")
    }

    pub fn delete_policy(&self, deployment_id: &str) -> StateResult<bool> {
        self.delete(POLICIES, deployment_id)
    }

    // ── Scaling events ─────────────────────────────────────────────

    /// Append a scaling event. Events recorded in the same second keep
    /// their insertion order.
    pub fn record_scaling_event(&self, event: &ScalingEvent) -> StateResult<()> {
        let prefix = format!("{}:", event.key_prefix());
        let value = serde_json::to_vec(event).map_err(map_err!(Serialize))?;
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        {
            let mut table = txn.open_table(SCALING_EVENTS).map_err(map_err!(Table))?;
            let seq = Self::prefixed_keys(&table, &prefix)?.len();
            let key = format!("{prefix}{seq:010}");
            table
                .insert(key.as_str(), value.as_slice())
                .map_err(map_err!(Write))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(
            deployment_id = %event.deployment_id,
            from = event.from_instances,
            to = event.to_instances,
            "scaling event recorded"
        );
        Ok(())
    }

    /// The audit trail for a deployment, newest first.
    pub fn list_scaling_events(
        &self,
        deployment_id: &str,
        limit: usize,
    ) -> StateResult<Vec<ScalingEvent>> {
        let mut events: Vec<ScalingEvent> =
            self.scan(SCALING_EVENTS, &format!("{deployment_id}:"))?;
        events.reverse();
        events.truncate(limit);
        Ok(events)
    }

    // ── Instance counters ──────────────────────────────────────────

    pub fn upsert_instance_counter(&self, counter: &InstanceCounter) -> StateResult<()> {
        self.put(COUNTERS, &counter.deployment_id, counter)
    }

    pub fn get_instance_counter(&self, deployment_id: &str) -> StateResult<Option<InstanceCounter>> {
        self.get(COUNTERS, deployment_id)
    }

    // ── Usage samples ──────────────────────────────────────────────

    /// Append a usage sample and evict the oldest samples beyond `retention`.
    /// Returns the number of samples evicted.
    pub fn append_usage_sample(&self, sample: &UsageSample, retention: usize) -> StateResult<usize> {
        let key = sample.table_key();
        let prefix = format!("{}:", sample.deployment_id);
        let value = serde_json::to_vec(sample).map_err(map_err!(Serialize))?;
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let evicted;
        {
            let mut table = txn.open_table(USAGE).map_err(map_err!(Table))?;
            table
                .insert(key.as_str(), value.as_slice())
                .map_err(map_err!(Write))?;

            let keys = Self::prefixed_keys(&table, &prefix)?;
            // Keys sort by zero-padded timestamp, oldest first.
            evicted = keys.len().saturating_sub(retention);
            for old in &keys[..evicted] {
                table.remove(old.as_str()).map_err(map_err!(Write))?;
            }
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(evicted)
    }

    /// Retained usage samples for a deployment, oldest first.
    pub fn list_usage_samples(&self, deployment_id: &str) -> StateResult<Vec<UsageSample>> {
        self.scan(USAGE, &format!("{deployment_id}:"))
    }

    // ── Budget ─────────────────────────────────────────────────────

    pub fn put_budget(&self, budget: &BudgetConfig) -> StateResult<()> {
        self.put(SETTINGS, BUDGET_KEY, budget)
    }

    pub fn get_budget(&self) -> StateResult<Option<BudgetConfig>> {
        self.get(SETTINGS, BUDGET_KEY)
    }

    pub fn put_budget_alerts(&self, state: &BudgetAlertState) -> StateResult<()> {
        self.put(SETTINGS, BUDGET_ALERTS_KEY, state)
    }

    pub fn get_budget_alerts(&self) -> StateResult<Option<BudgetAlertState>> {
        self.get(SETTINGS, BUDGET_ALERTS_KEY)
    }

    // ── Purge ──────────────────────────────────────────────────────

    /// Drop the scaling policy, instance counter and usage history of a
    /// destroyed deployment. The scaling audit trail is kept.
    pub fn purge_deployment(&self, deployment_id: &str) -> StateResult<()> {
        let prefix = format!("{deployment_id}:");
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        {
            let mut policies = txn.open_table(POLICIES).map_err(map_err!(Table))?;
            policies.remove(deployment_id).map_err(map_err!(Write))?;

            let mut counters = txn.open_table(COUNTERS).map_err(map_err!(Table))?;
            counters.remove(deployment_id).map_err(map_err!(Write))?;

            let mut usage = txn.open_table(USAGE).map_err(map_err!(Table))?;
            for key in &Self::prefixed_keys(&usage, &prefix)? {
                usage.remove(key.as_str()).map_err(map_err!(Write))?;
            }
        }
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(%deployment_id, "deployment state purged");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn deployment(id: &str) -> Deployment {
        Deployment::new(id, "proj-1", "owner-1", "node", 1000)
    }

    fn usage(deployment_id: &str, timestamp: u64) -> UsageSample {
        UsageSample {
            deployment_id: deployment_id.to_string(),
            cpu_usage: 0.5,
            memory_usage: 0.25,
            network_io: 10.0,
            disk_io: 1.0,
            cost_estimate: 0.01,
            timestamp,
        }
    }

    fn scaling_event(deployment_id: &str, from: u32, to: u32, timestamp: u64) -> ScalingEvent {
        ScalingEvent {
            deployment_id: deployment_id.to_string(),
            from_instances: from,
            to_instances: to,
            reason: "test".to_string(),
            metrics_snapshot: None,
            timestamp,
        }
    }

    #[test]
    fn deployment_create_and_get() {
        let store = StateStore::open_in_memory().unwrap();
        let d = deployment("dep-1");
        store.create_deployment(&d).unwrap();
        assert_eq!(store.get_deployment("dep-1").unwrap(), Some(d));
        assert!(store.get_deployment("nope").unwrap().is_none());
    }

    #[test]
    fn deployment_create_rejects_duplicate() {
        let store = StateStore::open_in_memory().unwrap();
        store.create_deployment(&deployment("dep-1")).unwrap();
        assert!(store.create_deployment(&deployment("dep-1")).is_err());
    }

    #[test]
    fn status_update_follows_lifecycle() {
        let store = StateStore::open_in_memory().unwrap();
        store.create_deployment(&deployment("dep-1")).unwrap();

        let d = store
            .update_deployment_status("dep-1", DeploymentStatus::Provisioning, None, 1010)
            .unwrap();
        assert_eq!(d.status, DeploymentStatus::Provisioning);
        assert_eq!(d.updated_at, 1010);

        let err = store
            .update_deployment_status("dep-1", DeploymentStatus::Pending, None, 1020)
            .unwrap_err();
        assert!(matches!(err, StateError::InvalidTransition { .. }));

        let stored = store.get_deployment("dep-1").unwrap().unwrap();
        assert_eq!(stored.status, DeploymentStatus::Provisioning);
    }

    #[test]
    fn status_update_records_error() {
        let store = StateStore::open_in_memory().unwrap();
        store.create_deployment(&deployment("dep-1")).unwrap();
        let error = DeploymentError {
            kind: ErrorKind::Sandbox,
            message: "sandbox crashed".to_string(),
        };
        let d = store
            .update_deployment_status("dep-1", DeploymentStatus::Failed, Some(error.clone()), 1050)
            .unwrap();
        assert_eq!(d.last_error, Some(error));
    }

    #[test]
    fn status_update_missing_deployment() {
        let store = StateStore::open_in_memory().unwrap();
        let err = store
            .update_deployment_status("ghost", DeploymentStatus::Failed, None, 1)
            .unwrap_err();
        assert!(matches!(err, StateError::NotFound(_)));
    }

    #[test]
    fn sandbox_crud() {
        let store = StateStore::open_in_memory().unwrap();
        let meta = SandboxMeta::new("sbx-1", "dep-1", "owner-1", 1000, 300);
        store.put_sandbox(&meta).unwrap();
        store
            .put_sandbox(&SandboxMeta::new("sbx-2", "dep-1", "owner-1", 1000, 300))
            .unwrap();

        assert_eq!(store.get_sandbox("sbx-1").unwrap(), Some(meta));
        assert_eq!(store.list_sandboxes().unwrap().len(), 2);
        assert!(store.remove_sandbox("sbx-1").unwrap());
        assert!(!store.remove_sandbox("sbx-1").unwrap());
        assert_eq!(store.list_sandboxes().unwrap().len(), 1);
    }

    #[test]
    fn scaling_events_newest_first() {
        let store = StateStore::open_in_memory().unwrap();
        store.record_scaling_event(&scaling_event("dep-1", 1, 2, 100)).unwrap();
        store.record_scaling_event(&scaling_event("dep-1", 2, 3, 200)).unwrap();
        store.record_scaling_event(&scaling_event("dep-1", 3, 2, 200)).unwrap();
        store.record_scaling_event(&scaling_event("dep-10", 1, 5, 150)).unwrap();

        let events = store.list_scaling_events("dep-1", 10).unwrap();
        assert_eq!(events.len(), 3);
        assert_eq!((events[0].from_instances, events[0].to_instances), (3, 2));
        assert_eq!((events[1].from_instances, events[1].to_instances), (2, 3));
        assert_eq!(events[2].timestamp, 100);

        assert_eq!(store.list_scaling_events("dep-1", 1).unwrap().len(), 1);
    }

    #[test]
    fn usage_retention_evicts_oldest() {
        let store = StateStore::open_in_memory().unwrap();
        let mut evicted = 0;
        for i in 0..5 {
            evicted += store.append_usage_sample(&usage("dep-1", 1000 + i * 300), 3).unwrap();
        }
        store.append_usage_sample(&usage("dep-2", 1000), 3).unwrap();

        assert_eq!(evicted, 2);
        let samples = store.list_usage_samples("dep-1").unwrap();
        let stamps: Vec<u64> = samples.iter().map(|s| s.timestamp).collect();
        assert_eq!(stamps, vec![1600, 1900, 2200]);
        assert_eq!(store.list_usage_samples("dep-2").unwrap().len(), 1);
    }

    #[test]
    fn prefix_scans_stop_at_neighbouring_deployments() {
        let store = StateStore::open_in_memory().unwrap();
        for id in ["dep-0", "dep-10", "dep-2"] {
            store.append_usage_sample(&usage(id, 1000), 1).unwrap();
            store.record_scaling_event(&scaling_event(id, 1, 2, 100)).unwrap();
        }
        for i in 0..3 {
            store.append_usage_sample(&usage("dep-1", 2000 + i), 2).unwrap();
        }
        store.record_scaling_event(&scaling_event("dep-1", 1, 2, 100)).unwrap();
        store.record_scaling_event(&scaling_event("dep-1", 2, 3, 100)).unwrap();

        let stamps: Vec<u64> = store
            .list_usage_samples("dep-1")
            .unwrap()
            .iter()
            .map(|s| s.timestamp)
            .collect();
        assert_eq!(stamps, vec![2001, 2002]);
        for id in ["dep-0", "dep-10", "dep-2"] {
            assert_eq!(store.list_usage_samples(id).unwrap().len(), 1, "{id}");
            assert_eq!(store.list_scaling_events(id, 10).unwrap().len(), 1, "{id}");
        }

        // Same-second events are numbered from the deployment's own count.
        let events = store.list_scaling_events("dep-1", 10).unwrap();
        assert_eq!((events[0].from_instances, events[1].from_instances), (2, 1));

        store.purge_deployment("dep-1").unwrap();
        assert!(store.list_usage_samples("dep-1").unwrap().is_empty());
        assert_eq!(store.list_usage_samples("dep-10").unwrap().len(), 1);
    }

    #[test]
    fn counter_and_policy_roundtrip() {
        let store = StateStore::open_in_memory().unwrap();
        let mut counter = InstanceCounter::new("dep-1", 2);
        counter.last_scaling_action = Some(500);
        store.upsert_instance_counter(&counter).unwrap();
        counter.current_instances = 3;
        store.upsert_instance_counter(&counter).unwrap();
        assert_eq!(
            store.get_instance_counter("dep-1").unwrap().unwrap().current_instances,
            3
        );

        let policy = ScalingPolicy::new(
            "dep-1",
            vec![MetricRule::new(MetricKind::Cpu, 0.7, Comparison::GreaterThan, 1.0)],
            0.7,
            0.3,
            60,
            1,
            4,
        )
        .unwrap();
        store.put_policy(&policy).unwrap();
        assert_eq!(store.list_policies().unwrap(), vec![policy]);
    }

    #[test]
    fn purge_keeps_audit_trail() {
        let store = StateStore::open_in_memory().unwrap();
        store.upsert_instance_counter(&InstanceCounter::new("dep-1", 1)).unwrap();
        store.append_usage_sample(&usage("dep-1", 1000), 10).unwrap();
        store.record_scaling_event(&scaling_event("dep-1", 1, 2, 100)).unwrap();

        store.purge_deployment("dep-1").unwrap();

        assert!(store.get_instance_counter("dep-1").unwrap().is_none());
        assert!(store.list_usage_samples("dep-1").unwrap().is_empty());
        assert_eq!(store.list_scaling_events("dep-1", 10).unwrap().len(), 1);
    }

    #[test]
    fn budget_defaults_absent() {
        let store = StateStore::open_in_memory().unwrap();
        assert!(store.get_budget().unwrap().is_none());
        let budget = BudgetConfig {
            monthly_limit: 250.0,
            is_enabled: true,
            ..BudgetConfig::default()
        };
        store.put_budget(&budget).unwrap();
        assert_eq!(store.get_budget().unwrap(), Some(budget));

        assert!(store.get_budget_alerts().unwrap().is_none());
        let fired = BudgetAlertState {
            period: "2026-03".to_string(),
            fired: vec![BudgetLevel::Warning],
        };
        store.put_budget_alerts(&fired).unwrap();
        assert_eq!(store.get_budget_alerts().unwrap(), Some(fired));
    }

    #[test]
    fn persistent_store_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.redb");
        {
            let store = StateStore::open(&path).unwrap();
            store.create_deployment(&deployment("dep-1")).unwrap();
            store
                .put_sandbox(&SandboxMeta::new("sbx-1", "dep-1", "owner-1", 1000, 300))
                .unwrap();
        }
        let store = StateStore::open(&path).unwrap();
        assert!(store.get_deployment("dep-1").unwrap().is_some());
        assert_eq!(store.list_sandboxes().unwrap().len(), 1);
    }
}

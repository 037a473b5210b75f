//! redb table definitions for the Berth state store.
//!
//! Every table uses `&str` keys and `&[u8]` values holding JSON. History
//! tables use `{deployment_id}:{timestamp:020}` keys so a prefix scan
//! returns one deployment's records in time order.

use redb::TableDefinition;

/// Deployments keyed by deployment id.
pub const DEPLOYMENTS: TableDefinition<&str, &[u8]> = TableDefinition::new("deployments");

/// Sandbox metadata keyed by sandbox id.
pub const SANDBOXES: TableDefinition<&str, &[u8]> = TableDefinition::new("sandboxes");

/// Scaling policies keyed by deployment id.
pub const POLICIES: TableDefinition<&str, &[u8]> = TableDefinition::new("policies");

/// Scaling audit trail keyed by `{deployment_id}:{timestamp:020}:{seq:010}`.
pub const SCALING_EVENTS: TableDefinition<&str, &[u8]> = TableDefinition::new("scaling_events");

/// Instance counters keyed by deployment id.
pub const COUNTERS: TableDefinition<&str, &[u8]> = TableDefinition::new("counters");

/// Usage samples keyed by `{deployment_id}:{timestamp:020}`.
pub const USAGE: TableDefinition<&str, &[u8]> = TableDefinition::new("usage");

/// Singleton settings (budget config, fired alerts) keyed by name.
pub const SETTINGS: TableDefinition<&str, &[u8]> = TableDefinition::new("settings");

/// Settings key for the operator budget.
pub const BUDGET_KEY: &str = "budget";

/// Settings key for the alert levels fired in the current billing period.
pub const BUDGET_ALERTS_KEY: &str = "budget_alerts";

//! berth-core — shared plumbing for the Berth control plane.
//!
//! - [`config`]: the typed `berth.toml` configuration with validated defaults
//! - [`duration`]: human duration strings (`"30s"`, `"5m"`, `"500ms"`)
//! - [`events`]: the non-blocking event bus and the `EventSink` collaborator
//! - [`task`]: cancellable periodic loops with single-flight execution
//! - [`time`]: wall-clock helpers

pub mod config;
pub mod duration;
pub mod events;
pub mod task;
pub mod time;

pub use config::{
    AutoscaleConfig, BerthConfig, BudgetConfig, CallTimeouts, ClassificationLimits,
    CleanupConfig, ConfigError, CostConfig, EventsConfig, RecoveryConfig, TierBudget,
    TimeoutConfig, UnitRates,
};
pub use duration::{format_duration, parse_duration};
pub use events::{Event, EventBus, EventQueue, EventSink, MemorySink, Topic, TracingSink};
pub use task::{SingleFlight, run_periodic};
pub use time::epoch_secs;

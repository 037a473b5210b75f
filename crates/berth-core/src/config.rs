//! `berth.toml` configuration.
//!
//! Every section has defaults equal to the reference policy values, so an
//! empty file is a valid configuration. Durations are written as human
//! strings (`"300s"`, `"5m"`) and parsed by [`crate::duration`].

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::duration::serde_str;

/// Errors raised while loading or validating configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid config: {0}")]
    Invalid(String),
}

/// Top-level control plane configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct BerthConfig {
    pub timeouts: TimeoutConfig,
    pub recovery: RecoveryConfig,
    pub cleanup: CleanupConfig,
    pub autoscale: AutoscaleConfig,
    pub cost: CostConfig,
    pub calls: CallTimeouts,
    pub events: EventsConfig,
}

impl BerthConfig {
    /// Load and validate a configuration file.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml_str(&content)
    }

    /// Parse and validate configuration from a TOML string.
    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        let config: BerthConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn to_toml_string(&self) -> anyhow::Result<String> {
        Ok(toml::to_string_pretty(self)?)
    }

    /// Reject configurations that would make a component misbehave.
    pub fn validate(&self) -> Result<(), ConfigError> {
        for (name, tier) in [
            ("simple", &self.timeouts.simple),
            ("complex", &self.timeouts.complex),
            ("enterprise", &self.timeouts.enterprise),
        ] {
            tier.validate(name)?;
        }
        if self.timeouts.health_check_interval.is_zero() {
            return Err(invalid("timeouts.health_check_interval must be > 0"));
        }
        if self.timeouts.unhealthy_threshold == 0 {
            return Err(invalid("timeouts.unhealthy_threshold must be > 0"));
        }
        if !(0.0..1.0).contains(&self.timeouts.extension_trigger) {
            return Err(invalid("timeouts.extension_trigger must be in [0, 1)"));
        }
        if self.recovery.max_retries == 0 {
            return Err(invalid("recovery.max_retries must be > 0"));
        }
        if self.recovery.base_delay > self.recovery.max_delay {
            return Err(invalid("recovery.base_delay must not exceed recovery.max_delay"));
        }
        if self.cleanup.interval.is_zero() {
            return Err(invalid("cleanup.interval must be > 0"));
        }
        if self.cleanup.batch_size == 0 {
            return Err(invalid("cleanup.batch_size must be > 0"));
        }
        if self.cleanup.max_sandboxes_per_owner == 0 {
            return Err(invalid("cleanup.max_sandboxes_per_owner must be > 0"));
        }
        if self.autoscale.interval.is_zero() {
            return Err(invalid("autoscale.interval must be > 0"));
        }
        if self.autoscale.step == 0 {
            return Err(invalid("autoscale.step must be > 0"));
        }
        if self.cost.sample_interval.is_zero() {
            return Err(invalid("cost.sample_interval must be > 0"));
        }
        if self.cost.retention == 0 {
            return Err(invalid("cost.retention must be > 0"));
        }
        self.cost.budget.validate()?;
        if self.events.capacity == 0 {
            return Err(invalid("events.capacity must be > 0"));
        }
        Ok(())
    }
}

fn invalid(msg: &str) -> ConfigError {
    ConfigError::Invalid(msg.to_string())
}

// ── Timeouts ──────────────────────────────────────────────────────

/// Time budget for one complexity tier.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct TierBudget {
    #[serde(with = "serde_str")]
    pub initial: Duration,
    #[serde(with = "serde_str")]
    pub extension: Duration,
    #[serde(with = "serde_str")]
    pub maximum: Duration,
}

impl TierBudget {
    pub const fn from_secs(initial: u64, extension: u64, maximum: u64) -> Self {
        Self {
            initial: Duration::from_secs(initial),
            extension: Duration::from_secs(extension),
            maximum: Duration::from_secs(maximum),
        }
    }

    fn validate(&self, name: &str) -> Result<(), ConfigError> {
        if self.initial.is_zero() {
            return Err(ConfigError::Invalid(format!(
                "timeouts.{name}.initial must be > 0"
            )));
        }
        if self.initial > self.maximum {
            return Err(ConfigError::Invalid(format!(
                "timeouts.{name}.initial must not exceed maximum"
            )));
        }
        Ok(())
    }
}

/// Upper bounds used to classify a project into a complexity tier.
///
/// A project exceeding any `simple_*` bound is complex; exceeding any
/// `complex_*` bound makes it enterprise.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ClassificationLimits {
    pub simple_max_files: u32,
    pub simple_max_dependencies: u32,
    #[serde(with = "serde_str")]
    pub simple_max_build: Duration,
    pub complex_max_files: u32,
    pub complex_max_dependencies: u32,
    #[serde(with = "serde_str")]
    pub complex_max_build: Duration,
}

impl Default for ClassificationLimits {
    fn default() -> Self {
        Self {
            simple_max_files: 50,
            simple_max_dependencies: 10,
            simple_max_build: Duration::from_secs(60),
            complex_max_files: 500,
            complex_max_dependencies: 100,
            complex_max_build: Duration::from_secs(600),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct TimeoutConfig {
    /// How often running sandboxes are health-checked.
    #[serde(with = "serde_str")]
    pub health_check_interval: Duration,
    /// No observed activity for this long kills the deployment.
    #[serde(with = "serde_str")]
    pub idle_window: Duration,
    /// Consecutive failed health checks before a kill.
    pub unhealthy_threshold: u32,
    /// Fraction of the current budget after which an extension may be granted.
    pub extension_trigger: f64,
    pub max_cpu_percent: f64,
    pub max_memory_percent: f64,
    pub simple: TierBudget,
    pub complex: TierBudget,
    pub enterprise: TierBudget,
    pub classification: ClassificationLimits,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            simple: TierBudget::from_secs(300, 180, 900),
            complex: TierBudget::from_secs(600, 300, 1800),
            enterprise: TierBudget::from_secs(900, 600, 3600),
            classification: ClassificationLimits::default(),
            health_check_interval: Duration::from_secs(30),
            idle_window: Duration::from_secs(15 * 60),
            unhealthy_threshold: 3,
            extension_trigger: 0.8,
            max_cpu_percent: 95.0,
            max_memory_percent: 95.0,
        }
    }
}

// ── Recovery ──────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct RecoveryConfig {
    pub max_retries: u32,
    #[serde(with = "serde_str")]
    pub base_delay: Duration,
    #[serde(with = "serde_str")]
    pub max_delay: Duration,
    /// Multiplier applied to network backoff before the cap.
    pub network_multiplier: u32,
}

impl Default for RecoveryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(1000),
            max_delay: Duration::from_millis(30_000),
            network_multiplier: 2,
        }
    }
}

// ── Cleanup ───────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct CleanupConfig {
    #[serde(with = "serde_str")]
    pub interval: Duration,
    /// Maximum reclamations per sweep.
    pub batch_size: usize,
    #[serde(with = "serde_str")]
    pub orphan_grace: Duration,
    #[serde(with = "serde_str")]
    pub max_age: Duration,
    #[serde(with = "serde_str")]
    pub max_age_grace: Duration,
    #[serde(with = "serde_str")]
    pub idle_timeout: Duration,
    pub max_sandboxes_per_owner: usize,
}

impl Default for CleanupConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(5 * 60),
            batch_size: 10,
            orphan_grace: Duration::from_secs(10 * 60),
            max_age: Duration::from_secs(24 * 3600),
            max_age_grace: Duration::from_secs(5 * 60),
            idle_timeout: Duration::from_secs(30 * 60),
            max_sandboxes_per_owner: 10,
        }
    }
}

// ── Autoscale ─────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct AutoscaleConfig {
    #[serde(with = "serde_str")]
    pub interval: Duration,
    /// Default instance step for policies that do not set one.
    pub step: u32,
}

impl Default for AutoscaleConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(30),
            step: 1,
        }
    }
}

// ── Cost ──────────────────────────────────────────────────────────

/// Per-resource prices used to estimate sample cost.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct UnitRates {
    pub cpu_hour: f64,
    pub memory_gb_hour: f64,
    pub storage_gb_hour: f64,
    pub network_mb: f64,
}

impl Default for UnitRates {
    fn default() -> Self {
        Self {
            cpu_hour: 0.048,
            memory_gb_hour: 0.0065,
            storage_gb_hour: 0.00014,
            network_mb: 0.00009,
        }
    }
}

/// Operator-managed spending limit.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct BudgetConfig {
    pub monthly_limit: f64,
    /// Percent of `monthly_limit` that raises a warning alert.
    pub warning_threshold: f64,
    /// Percent of `monthly_limit` that raises a critical alert.
    pub critical_threshold: f64,
    pub is_enabled: bool,
}

impl Default for BudgetConfig {
    fn default() -> Self {
        Self {
            monthly_limit: 100.0,
            warning_threshold: 80.0,
            critical_threshold: 95.0,
            is_enabled: false,
        }
    }
}

impl BudgetConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.monthly_limit < 0.0 {
            return Err(invalid("cost.budget.monthly_limit must be >= 0"));
        }
        if self.warning_threshold <= 0.0 || self.critical_threshold <= 0.0 {
            return Err(invalid("cost.budget thresholds must be > 0"));
        }
        if self.warning_threshold >= self.critical_threshold {
            return Err(invalid(
                "cost.budget.warning_threshold must be below critical_threshold",
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct CostConfig {
    #[serde(with = "serde_str")]
    pub sample_interval: Duration,
    /// Samples retained per deployment.
    pub retention: usize,
    pub rates: UnitRates,
    pub budget: BudgetConfig,
}

impl Default for CostConfig {
    fn default() -> Self {
        Self {
            sample_interval: Duration::from_secs(5 * 60),
            retention: 288,
            rates: UnitRates::default(),
            budget: BudgetConfig::default(),
        }
    }
}

// ── External calls ────────────────────────────────────────────────

/// Timeouts applied to every collaborator call.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct CallTimeouts {
    #[serde(with = "serde_str")]
    pub provision: Duration,
    #[serde(with = "serde_str")]
    pub prepare: Duration,
    #[serde(with = "serde_str")]
    pub terminate: Duration,
    #[serde(with = "serde_str")]
    pub health_check: Duration,
    #[serde(with = "serde_str")]
    pub persistence: Duration,
    #[serde(with = "serde_str")]
    pub event: Duration,
    #[serde(with = "serde_str")]
    pub classify: Duration,
}

impl Default for CallTimeouts {
    fn default() -> Self {
        Self {
            provision: Duration::from_secs(120),
            prepare: Duration::from_secs(300),
            terminate: Duration::from_secs(30),
            health_check: Duration::from_secs(5),
            persistence: Duration::from_secs(5),
            event: Duration::from_secs(2),
            classify: Duration::from_secs(10),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct EventsConfig {
    /// Bounded queue size between the control plane and the event sink.
    pub capacity: usize,
}

impl Default for EventsConfig {
    fn default() -> Self {
        Self { capacity: 1024 }
    }
}

//! Time budgets and the extension/kill rules.
//!
//! Everything here is a pure function of its inputs; the manager owns the
//! per-deployment bookkeeping.

use std::time::Duration;

use berth_core::{ClassificationLimits, TierBudget, TimeoutConfig};
use berth_provision::ProjectProfile;
use berth_state::{Complexity, HealthStatus};
use serde::{Deserialize, Serialize};

/// Pick the smallest tier whose every limit the project stays within.
pub fn classify(profile: &ProjectProfile, limits: &ClassificationLimits) -> Complexity {
    let build = Duration::from_secs(profile.estimated_build_secs);
    if profile.file_count <= limits.simple_max_files
        && profile.dependency_count <= limits.simple_max_dependencies
        && build <= limits.simple_max_build
    {
        Complexity::Simple
    } else if profile.file_count <= limits.complex_max_files
        && profile.dependency_count <= limits.complex_max_dependencies
        && build <= limits.complex_max_build
    {
        Complexity::Complex
    } else {
        Complexity::Enterprise
    }
}

/// Tier budget for a complexity class.
pub fn tier(config: &TimeoutConfig, complexity: Complexity) -> TierBudget {
    match complexity {
        Complexity::Simple => config.simple,
        Complexity::Complex => config.complex,
        Complexity::Enterprise => config.enterprise,
    }
}

/// Per-deployment time budget. `granted` is the cumulative time allowed so
/// far and never exceeds `maximum`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TimeoutBudget {
    pub complexity: Complexity,
    pub initial: Duration,
    pub extension: Duration,
    pub maximum: Duration,
    pub health_check_interval: Duration,
    pub granted: Duration,
    pub extensions_granted: u32,
}

impl TimeoutBudget {
    pub fn new(config: &TimeoutConfig, complexity: Complexity) -> Self {
        let t = tier(config, complexity);
        Self {
            complexity,
            initial: t.initial,
            extension: t.extension,
            maximum: t.maximum,
            health_check_interval: config.health_check_interval,
            granted: t.initial,
            extensions_granted: 0,
        }
    }

    /// Whether one more extension fits under the maximum.
    pub fn can_extend(&self) -> bool {
        self.granted + self.extension <= self.maximum
    }

    pub fn remaining(&self, elapsed: Duration) -> Duration {
        self.granted.saturating_sub(elapsed)
    }
}

/// What the supervisor observed about a deployment at one instant.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Observation {
    pub elapsed: Duration,
    pub health: HealthStatus,
    pub consecutive_failures: u32,
    /// Time since the most recent activity on any of its sandboxes.
    pub idle: Option<Duration>,
    pub cpu_percent: Option<f64>,
    pub memory_percent: Option<f64>,
}

impl Observation {
    pub fn healthy(elapsed: Duration) -> Self {
        Self {
            elapsed,
            health: HealthStatus::Healthy,
            consecutive_failures: 0,
            idle: None,
            cpu_percent: None,
            memory_percent: None,
        }
    }
}

/// Why a deployment was force-terminated.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum KillReason {
    MaximumExceeded { elapsed_secs: u64, maximum_secs: u64 },
    HealthChecksFailed { consecutive: u32 },
    Idle { idle_secs: u64 },
    ResourceCeiling { cpu_percent: f64, memory_percent: f64 },
    BudgetExhausted { elapsed_secs: u64, granted_secs: u64 },
}

impl std::fmt::Display for KillReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            KillReason::MaximumExceeded {
                elapsed_secs,
                maximum_secs,
            } => write!(f, "exceeded maximum runtime ({elapsed_secs}s >= {maximum_secs}s)"),
            KillReason::HealthChecksFailed { consecutive } => {
                write!(f, "health check failed {consecutive} consecutive times")
            }
            KillReason::Idle { idle_secs } => write!(f, "no activity for {idle_secs}s"),
            KillReason::ResourceCeiling {
                cpu_percent,
                memory_percent,
            } => write!(
                f,
                "resource ceiling exceeded (cpu {cpu_percent:.1}%, memory {memory_percent:.1}%)"
            ),
            KillReason::BudgetExhausted {
                elapsed_secs,
                granted_secs,
            } => write!(
                f,
                "time budget exhausted ({elapsed_secs}s of {granted_secs}s, no extension available)"
            ),
        }
    }
}

/// Outcome of checking a deployment against its budget.
#[derive(Debug, Clone, PartialEq)]
pub enum Verdict {
    Continue,
    /// An extension was granted; carries the new cumulative budget.
    Extended(Duration),
    Kill(KillReason),
}

/// Whether an extension should be granted now. All four must hold:
/// past the trigger fraction of the current budget, healthy, the remaining
/// time is shorter than one extension, and the extension fits under the
/// maximum.
pub fn should_extend(budget: &TimeoutBudget, obs: &Observation, trigger: f64) -> bool {
    obs.elapsed.as_secs_f64() > trigger * budget.granted.as_secs_f64()
        && obs.health == HealthStatus::Healthy
        && budget.remaining(obs.elapsed) < budget.extension
        && budget.can_extend()
}

/// The kill rule. Any one condition is enough.
pub fn kill_reason(
    budget: &TimeoutBudget,
    obs: &Observation,
    config: &TimeoutConfig,
) -> Option<KillReason> {
    if obs.elapsed >= budget.maximum {
        return Some(KillReason::MaximumExceeded {
            elapsed_secs: obs.elapsed.as_secs(),
            maximum_secs: budget.maximum.as_secs(),
        });
    }
    if obs.consecutive_failures >= config.unhealthy_threshold {
        return Some(KillReason::HealthChecksFailed {
            consecutive: obs.consecutive_failures,
        });
    }
    if let Some(idle) = obs.idle
        && idle >= config.idle_window
    {
        return Some(KillReason::Idle {
            idle_secs: idle.as_secs(),
        });
    }
    let cpu = obs.cpu_percent.unwrap_or(0.0);
    let memory = obs.memory_percent.unwrap_or(0.0);
    if cpu > config.max_cpu_percent || memory > config.max_memory_percent {
        return Some(KillReason::ResourceCeiling {
            cpu_percent: cpu,
            memory_percent: memory,
        });
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    fn profile(files: u32, deps: u32, build: u64) -> ProjectProfile {
        ProjectProfile {
            file_count: files,
            dependency_count: deps,
            estimated_build_secs: build,
        }
    }

    #[test]
    fn classification_tiers() {
        let limits = ClassificationLimits::default();
        assert_eq!(classify(&profile(10, 0, 20), &limits), Complexity::Simple);
        assert_eq!(classify(&profile(51, 0, 20), &limits), Complexity::Complex);
        assert_eq!(classify(&profile(10, 11, 20), &limits), Complexity::Complex);
        assert_eq!(classify(&profile(10, 0, 61), &limits), Complexity::Complex);
        assert_eq!(classify(&profile(501, 0, 20), &limits), Complexity::Enterprise);
        assert_eq!(classify(&profile(10, 0, 601), &limits), Complexity::Enterprise);
    }

    #[test]
    fn tier_budgets_from_config() {
        let config = TimeoutConfig::default();
        let b = TimeoutBudget::new(&config, Complexity::Complex);
        assert_eq!(b.initial, Duration::from_secs(600));
        assert_eq!(b.extension, Duration::from_secs(300));
        assert_eq!(b.maximum, Duration::from_secs(1800));
        assert_eq!(b.granted, b.initial);
    }

    #[test]
    fn extension_requires_trigger_and_health() {
        let config = TimeoutConfig::default();
        let budget = TimeoutBudget::new(&config, Complexity::Simple);

        assert!(!should_extend(&budget, &Observation::healthy(Duration::from_secs(240)), 0.8));
        assert!(should_extend(&budget, &Observation::healthy(Duration::from_secs(250)), 0.8));

        let mut sick = Observation::healthy(Duration::from_secs(250));
        sick.health = HealthStatus::Unhealthy;
        assert!(!should_extend(&budget, &sick, 0.8));
    }

    #[test]
    fn extension_never_exceeds_maximum() {
        let config = TimeoutConfig::default();
        let mut budget = TimeoutBudget::new(&config, Complexity::Simple);
        budget.granted = Duration::from_secs(840);
        // 840 + 180 > 900
        assert!(!budget.can_extend());
        assert!(!should_extend(&budget, &Observation::healthy(Duration::from_secs(800)), 0.8));
    }

    #[test]
    fn kill_at_maximum_regardless_of_health() {
        let config = TimeoutConfig::default();
        let budget = TimeoutBudget::new(&config, Complexity::Simple);
        let reason = kill_reason(&budget, &Observation::healthy(Duration::from_secs(900)), &config);
        assert!(matches!(reason, Some(KillReason::MaximumExceeded { maximum_secs: 900, .. })));
    }

    #[test]
    fn kill_on_health_idle_and_resources() {
        let config = TimeoutConfig::default();
        let budget = TimeoutBudget::new(&config, Complexity::Simple);
        let base = Observation::healthy(Duration::from_secs(10));

        let failing = Observation {
            consecutive_failures: 3,
            health: HealthStatus::Unhealthy,
            ..base
        };
        assert_eq!(
            kill_reason(&budget, &failing, &config),
            Some(KillReason::HealthChecksFailed { consecutive: 3 })
        );

        let idle = Observation {
            idle: Some(Duration::from_secs(15 * 60)),
            ..base
        };
        assert!(matches!(kill_reason(&budget, &idle, &config), Some(KillReason::Idle { .. })));

        let hot = Observation {
            memory_percent: Some(99.0),
            ..base
        };
        assert!(matches!(
            kill_reason(&budget, &hot, &config),
            Some(KillReason::ResourceCeiling { .. })
        ));

        let two_failures = Observation {
            consecutive_failures: 2,
            ..base
        };
        assert_eq!(kill_reason(&budget, &two_failures, &config), None);
    }

    #[test]
    fn kill_reason_serializes_tagged() {
        let v = serde_json::to_value(KillReason::Idle { idle_secs: 900 }).unwrap();
        assert_eq!(v["reason"], "idle");
        assert_eq!(v["idle_secs"], 900);
    }
}

//! TimeoutManager — per-deployment budget bookkeeping.

use std::time::Duration;

use berth_core::TimeoutConfig;
use berth_provision::ProjectProfile;
use berth_registry::SandboxRegistry;
use berth_state::{Complexity, HealthStatus};
use dashmap::DashMap;
use tracing::{debug, info, warn};

use crate::budget::{KillReason, Observation, TimeoutBudget, Verdict, classify, kill_reason, should_extend};

#[derive(Debug, Clone, Copy)]
struct Tracked {
    budget: TimeoutBudget,
    /// Unix timestamp the budget started counting from.
    started_at: u64,
}

pub struct TimeoutManager {
    config: TimeoutConfig,
    budgets: DashMap<String, Tracked>,
}

impl TimeoutManager {
    pub fn new(config: TimeoutConfig) -> Self {
        Self {
            config,
            budgets: DashMap::new(),
        }
    }

    pub fn config(&self) -> &TimeoutConfig {
        &self.config
    }

    /// Classify a project and start its budget clock at `now`.
    pub fn assign(&self, deployment_id: &str, profile: &ProjectProfile, now: u64) -> TimeoutBudget {
        let complexity = classify(profile, &self.config.classification);
        let budget = self.assign_tier(deployment_id, complexity, now);
        info!(
            %deployment_id,
            ?complexity,
            files = profile.file_count,
            dependencies = profile.dependency_count,
            initial_secs = budget.initial.as_secs(),
            maximum_secs = budget.maximum.as_secs(),
            "timeout budget assigned"
        );
        budget
    }

    /// Start a budget for an already-known tier.
    pub fn assign_tier(&self, deployment_id: &str, complexity: Complexity, started_at: u64) -> TimeoutBudget {
        let budget = TimeoutBudget::new(&self.config, complexity);
        self.budgets.insert(deployment_id.to_string(), Tracked { budget, started_at });
        budget
    }

    pub fn budget(&self, deployment_id: &str) -> Option<TimeoutBudget> {
        self.budgets.get(deployment_id).map(|t| t.budget)
    }

    pub fn elapsed(&self, deployment_id: &str, now: u64) -> Option<Duration> {
        self.budgets
            .get(deployment_id)
            .map(|t| Duration::from_secs(now.saturating_sub(t.started_at)))
    }

    /// Drop a deployment's budget (stop, failure, destroy).
    pub fn release(&self, deployment_id: &str) {
        if self.budgets.remove(deployment_id).is_some() {
            debug!(%deployment_id, "timeout budget released");
        }
    }

    pub fn tracked(&self) -> usize {
        self.budgets.len()
    }

    /// Build an observation from the registry entries of a deployment.
    pub fn observe(&self, registry: &SandboxRegistry, deployment_id: &str, now: u64) -> Option<Observation> {
        let elapsed = self.elapsed(deployment_id, now)?;
        let sandboxes = registry.for_deployment(deployment_id);
        if sandboxes.is_empty() {
            return Some(Observation {
                elapsed,
                health: HealthStatus::Unknown,
                consecutive_failures: 0,
                idle: None,
                cpu_percent: None,
                memory_percent: None,
            });
        }

        let health = if sandboxes.iter().any(|s| s.health == HealthStatus::Unhealthy) {
            HealthStatus::Unhealthy
        } else if sandboxes.iter().all(|s| s.health == HealthStatus::Healthy) {
            HealthStatus::Healthy
        } else {
            HealthStatus::Unknown
        };
        let max = |vals: Vec<f64>| vals.into_iter().reduce(f64::max);

        Some(Observation {
            elapsed,
            health,
            consecutive_failures: sandboxes.iter().map(|s| s.consecutive_failures).max().unwrap_or(0),
            idle: sandboxes
                .iter()
                .map(|s| s.idle_secs(now))
                .min()
                .map(Duration::from_secs),
            cpu_percent: max(sandboxes.iter().filter_map(|s| s.cpu_percent).collect()),
            memory_percent: max(sandboxes.iter().filter_map(|s| s.memory_percent).collect()),
        })
    }

    /// Apply the kill and extension rules. A granted extension is recorded
    /// before returning.
    pub fn evaluate(&self, deployment_id: &str, obs: &Observation) -> Verdict {
        let config = &self.config;
        let verdict = self.budgets.get_mut(deployment_id).map(|mut tracked| {
            let budget = &mut tracked.budget;
            if let Some(reason) = kill_reason(budget, obs, config) {
                return Verdict::Kill(reason);
            }
            if should_extend(budget, obs, config.extension_trigger) {
                budget.granted += budget.extension;
                budget.extensions_granted += 1;
                return Verdict::Extended(budget.granted);
            }
            if obs.elapsed >= budget.granted {
                return Verdict::Kill(KillReason::BudgetExhausted {
                    elapsed_secs: obs.elapsed.as_secs(),
                    granted_secs: budget.granted.as_secs(),
                });
            }
            Verdict::Continue
        });

        match &verdict {
            Some(Verdict::Extended(granted)) => {
                info!(%deployment_id, granted_secs = granted.as_secs(), "timeout extension granted")
            }
            Some(Verdict::Kill(reason)) => warn!(%deployment_id, %reason, "deployment over budget"),
            _ => {}
        }
        verdict.unwrap_or(Verdict::Continue)
    }
}

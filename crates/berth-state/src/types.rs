//! Domain types for the Berth control plane.
//!
//! These types represent the persisted state of deployments, sandboxes,
//! scaling policies and their audit trail, and resource usage samples.
//! All types serialize to/from JSON for storage in redb tables.

use serde::{Deserialize, Serialize};

use crate::error::PolicyError;

/// Unique identifier for a deployment.
pub type DeploymentId = String;

/// Unique identifier for a sandbox.
pub type SandboxId = String;

// ── Deployment ─────────────────────────────────────────────────────

/// Lifecycle status of a deployment.
///
/// ```text
/// PENDING → PROVISIONING → BUILDING → RUNNING → STOPPED ─┐
///    └──────────┴─────────────┴──────────┴──→ FAILED ────┴→ DESTROYED
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DeploymentStatus {
    Pending,
    Provisioning,
    Building,
    Running,
    Stopped,
    Failed,
    Destroyed,
}

impl DeploymentStatus {
    /// No further pipeline work happens in a terminal state.
    pub fn is_terminal(&self) -> bool {
        matches!(self, DeploymentStatus::Failed | DeploymentStatus::Destroyed)
    }

    /// Pipeline stage represented by this status, if any.
    pub fn stage(&self) -> Option<Stage> {
        match self {
            DeploymentStatus::Provisioning => Some(Stage::Provisioning),
            DeploymentStatus::Building => Some(Stage::Building),
            DeploymentStatus::Running => Some(Stage::Running),
            _ => None,
        }
    }

    /// Whether `self → next` is a legal transition.
    ///
    /// A status may re-enter itself (a retry of the current stage) but
    /// never move back to an earlier stage.
    pub fn can_transition_to(&self, next: DeploymentStatus) -> bool {
        use DeploymentStatus::*;
        if *self == next {
            return matches!(self, Provisioning | Building | Running);
        }
        match (self, next) {
            (Pending, Provisioning) => true,
            (Provisioning, Building) => true,
            (Building, Running) => true,
            (Provisioning | Building | Running, Stopped) => true,
            (Pending | Provisioning | Building | Running | Stopped, Failed) => true,
            (Stopped | Failed, Destroyed) => true,
            _ => false,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            DeploymentStatus::Pending => "PENDING",
            DeploymentStatus::Provisioning => "PROVISIONING",
            DeploymentStatus::Building => "BUILDING",
            DeploymentStatus::Running => "RUNNING",
            DeploymentStatus::Stopped => "STOPPED",
            DeploymentStatus::Failed => "FAILED",
            DeploymentStatus::Destroyed => "DESTROYED",
        }
    }
}

impl std::fmt::Display for DeploymentStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Pipeline stage a failure occurred in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Provisioning,
    Building,
    Running,
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Stage::Provisioning => "provisioning",
            Stage::Building => "building",
            Stage::Running => "running",
        })
    }
}

/// Project complexity tier, used to pick a timeout budget.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Complexity {
    Simple,
    Complex,
    Enterprise,
}

/// Failure taxonomy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Timeout,
    Resource,
    Network,
    Sandbox,
    Unknown,
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            ErrorKind::Timeout => "timeout",
            ErrorKind::Resource => "resource",
            ErrorKind::Network => "network",
            ErrorKind::Sandbox => "sandbox",
            ErrorKind::Unknown => "unknown",
        })
    }
}

/// User-visible failure. `message` is always sanitized.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DeploymentError {
    pub kind: ErrorKind,
    pub message: String,
}

/// The tracked lifecycle entity for one execution of a submitted project.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Deployment {
    pub id: DeploymentId,
    pub project_id: String,
    /// Tenant that owns the deployment (quota boundary).
    pub owner_id: String,
    pub status: DeploymentStatus,
    /// Runtime label, e.g. "node", "python", "static".
    pub runtime: String,
    pub complexity: Option<Complexity>,
    pub sandbox_ids: Vec<SandboxId>,
    /// Unix timestamp (seconds) when the deployment was requested.
    pub created_at: u64,
    /// Unix timestamp (seconds) of the last status change.
    pub updated_at: u64,
    pub last_error: Option<DeploymentError>,
}

impl Deployment {
    pub fn new(id: &str, project_id: &str, owner_id: &str, runtime: &str, now: u64) -> Self {
        Self {
            id: id.to_string(),
            project_id: project_id.to_string(),
            owner_id: owner_id.to_string(),
            status: DeploymentStatus::Pending,
            runtime: runtime.to_string(),
            complexity: None,
            sandbox_ids: Vec::new(),
            created_at: now,
            updated_at: now,
            last_error: None,
        }
    }
}

// ── Sandbox ───────────────────────────────────────────────────────

/// Health status as reported by the provisioning collaborator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthStatus {
    Healthy,
    Unhealthy,
    Unknown,
}

/// Metadata for one live sandbox.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SandboxMeta {
    pub id: SandboxId,
    pub deployment_id: DeploymentId,
    pub owner_id: String,
    /// Unix timestamp when the sandbox was confirmed created.
    pub started_at: u64,
    /// Lease expiry (unix timestamp).
    pub end_at: u64,
    pub last_activity: u64,
    pub health: HealthStatus,
    /// Consecutive failed health checks.
    pub consecutive_failures: u32,
    /// Latest CPU usage, percent of allocation.
    pub cpu_percent: Option<f64>,
    /// Latest memory usage, percent of allocation.
    pub memory_percent: Option<f64>,
    /// Grace period applied to idle reclamation: the deployment's own timeout.
    pub idle_grace_secs: u64,
}

impl SandboxMeta {
    pub fn new(id: &str, deployment_id: &str, owner_id: &str, now: u64, lease_secs: u64) -> Self {
        Self {
            id: id.to_string(),
            deployment_id: deployment_id.to_string(),
            owner_id: owner_id.to_string(),
            started_at: now,
            end_at: now + lease_secs,
            last_activity: now,
            health: HealthStatus::Unknown,
            consecutive_failures: 0,
            cpu_percent: None,
            memory_percent: None,
            idle_grace_secs: lease_secs,
        }
    }

    pub fn age_secs(&self, now: u64) -> u64 {
        now.saturating_sub(self.started_at)
    }

    pub fn idle_secs(&self, now: u64) -> u64 {
        now.saturating_sub(self.last_activity)
    }

    /// Fold a health check result into the failure streak.
    pub fn record_health(&mut self, health: HealthStatus) {
        self.health = health;
        match health {
            HealthStatus::Healthy => self.consecutive_failures = 0,
            HealthStatus::Unhealthy => self.consecutive_failures += 1,
            HealthStatus::Unknown => {}
        }
    }
}

// ── Live metrics ──────────────────────────────────────────────────

/// Point-in-time load metrics for one deployment.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct LiveMetrics {
    /// Percent (0–100).
    pub cpu_percent: f64,
    /// Percent (0–100).
    pub memory_percent: f64,
    pub response_time_ms: f64,
    /// Fraction of failed requests (0.0–1.0).
    pub error_rate: f64,
    pub requests_per_sec: f64,
}

// ── Scaling ───────────────────────────────────────────────────────

/// Metric a scaling rule evaluates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MetricKind {
    Cpu,
    Memory,
    ResponseTime,
    ErrorRate,
    Requests,
}

impl std::fmt::Display for MetricKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            MetricKind::Cpu => "cpu",
            MetricKind::Memory => "memory",
            MetricKind::ResponseTime => "response_time",
            MetricKind::ErrorRate => "error_rate",
            MetricKind::Requests => "requests",
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Comparison {
    #[serde(rename = "gt")]
    GreaterThan,
    #[serde(rename = "gte")]
    GreaterOrEqual,
    #[serde(rename = "lt")]
    LessThan,
    #[serde(rename = "lte")]
    LessOrEqual,
}

impl Comparison {
    pub fn holds(&self, value: f64, threshold: f64) -> bool {
        match self {
            Comparison::GreaterThan => value > threshold,
            Comparison::GreaterOrEqual => value >= threshold,
            Comparison::LessThan => value < threshold,
            Comparison::LessOrEqual => value <= threshold,
        }
    }
}

/// One weighted metric in a scaling policy. `threshold` is on the
/// normalized `[0, 1]` scale.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MetricRule {
    pub metric: MetricKind,
    pub threshold: f64,
    pub comparison: Comparison,
    pub weight: f64,
}

impl MetricRule {
    pub fn new(metric: MetricKind, threshold: f64, comparison: Comparison, weight: f64) -> Self {
        Self {
            metric,
            threshold,
            comparison,
            weight,
        }
    }
}

/// Per-deployment autoscaling policy.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ScalingPolicy {
    pub deployment_id: DeploymentId,
    pub metrics: Vec<MetricRule>,
    pub scale_up_threshold: f64,
    pub scale_down_threshold: f64,
    /// Minimum seconds between two scaling actions.
    pub cooldown_secs: u64,
    pub min_instances: u32,
    pub max_instances: u32,
    /// Instances added or removed per scaling action. `None` uses the
    /// engine's configured default step.
    #[serde(default)]
    pub scale_amount: Option<u32>,
    pub is_enabled: bool,
}

impl ScalingPolicy {
    /// Build a validated, enabled policy that uses the default step.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        deployment_id: &str,
        metrics: Vec<MetricRule>,
        scale_up_threshold: f64,
        scale_down_threshold: f64,
        cooldown_secs: u64,
        min_instances: u32,
        max_instances: u32,
    ) -> Result<Self, PolicyError> {
        let policy = Self {
            deployment_id: deployment_id.to_string(),
            metrics,
            scale_up_threshold,
            scale_down_threshold,
            cooldown_secs,
            min_instances,
            max_instances,
            scale_amount: None,
            is_enabled: true,
        };
        policy.validate()?;
        Ok(policy)
    }

    pub fn validate(&self) -> Result<(), PolicyError> {
        for t in [self.scale_up_threshold, self.scale_down_threshold] {
            if !(0.0..=1.0).contains(&t) {
                return Err(PolicyError::ThresholdRange(t));
            }
        }
        if self.scale_up_threshold <= self.scale_down_threshold {
            return Err(PolicyError::ThresholdOrder {
                up: self.scale_up_threshold,
                down: self.scale_down_threshold,
            });
        }
        if self.min_instances == 0 || self.min_instances > self.max_instances {
            return Err(PolicyError::InstanceBounds {
                min: self.min_instances,
                max: self.max_instances,
            });
        }
        if self.metrics.is_empty() {
            return Err(PolicyError::NoMetrics);
        }
        for rule in &self.metrics {
            if !rule.weight.is_finite() || rule.weight < 0.0 {
                return Err(PolicyError::Weight(format!(
                    "{} weight {} must be finite and >= 0",
                    rule.metric, rule.weight
                )));
            }
            if !(0.0..=1.0).contains(&rule.threshold) {
                return Err(PolicyError::ThresholdRange(rule.threshold));
            }
        }
        if self.metrics.iter().map(|r| r.weight).sum::<f64>() <= 0.0 {
            return Err(PolicyError::Weight("weights must not all be zero".to_string()));
        }
        if self.scale_amount == Some(0) {
            return Err(PolicyError::Step);
        }
        Ok(())
    }

    /// Clamp an instance count into `[min_instances, max_instances]`.
    pub fn clamp(&self, instances: u32) -> u32 {
        instances.clamp(self.min_instances, self.max_instances)
    }
}

/// Immutable record of one executed scaling action.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ScalingEvent {
    pub deployment_id: DeploymentId,
    pub from_instances: u32,
    pub to_instances: u32,
    pub reason: String,
    /// Metrics the decision was based on; `None` for manual overrides.
    pub metrics_snapshot: Option<LiveMetrics>,
    pub timestamp: u64,
}

/// The mutable scaling state of one deployment.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct InstanceCounter {
    pub deployment_id: DeploymentId,
    pub current_instances: u32,
    pub target_instances: u32,
    pub last_scaling_action: Option<u64>,
    pub last_scaling_reason: Option<String>,
}

impl InstanceCounter {
    pub fn new(deployment_id: &str, instances: u32) -> Self {
        Self {
            deployment_id: deployment_id.to_string(),
            current_instances: instances,
            target_instances: instances,
            last_scaling_action: None,
            last_scaling_reason: None,
        }
    }

    /// Seconds left in the cooldown window, zero if none is active.
    pub fn cooldown_remaining(&self, cooldown_secs: u64, now: u64) -> u64 {
        match self.last_scaling_action {
            Some(at) => (at + cooldown_secs).saturating_sub(now),
            None => 0,
        }
    }
}

// ── Usage ─────────────────────────────────────────────────────────

/// One resource usage sample for a deployment.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct UsageSample {
    pub deployment_id: DeploymentId,
    /// vCPU cores in use.
    pub cpu_usage: f64,
    /// Memory in use, GB.
    pub memory_usage: f64,
    /// Network transfer during the sample interval, MB.
    pub network_io: f64,
    /// Storage in use, GB.
    pub disk_io: f64,
    /// Estimated cost of the sample interval.
    pub cost_estimate: f64,
    pub timestamp: u64,
}

// ── Budget alerts ─────────────────────────────────────────────────

/// Severity of a budget alert.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BudgetLevel {
    Warning,
    Critical,
}

impl BudgetLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            BudgetLevel::Warning => "warning",
            BudgetLevel::Critical => "critical",
        }
    }
}

/// Alert levels already published in a billing period.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BudgetAlertState {
    /// `YYYY-MM`.
    pub period: String,
    pub fired: Vec<BudgetLevel>,
}

impl Deployment {
    pub fn table_key(&self) -> &str {
        &self.id
    }
}

impl ScalingEvent {
    /// Build the composite key prefix for the scaling events table.
    pub fn key_prefix(&self) -> String {
        format!("{}:{:020}", self.deployment_id, self.timestamp)
    }
}

impl UsageSample {
    /// Build the composite key for the usage table.
    pub fn table_key(&self) -> String {
        format!("{}:{:020}", self.deployment_id, self.timestamp)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cpu_rule() -> MetricRule {
        MetricRule::new(MetricKind::Cpu, 0.7, Comparison::GreaterThan, 0.5)
    }

    #[test]
    fn forward_transitions_are_legal() {
        use DeploymentStatus::*;
        assert!(Pending.can_transition_to(Provisioning));
        assert!(Provisioning.can_transition_to(Building));
        assert!(Building.can_transition_to(Running));
        assert!(Running.can_transition_to(Stopped));
        assert!(Stopped.can_transition_to(Destroyed));
        assert!(Failed.can_transition_to(Destroyed));
    }

    #[test]
    fn failed_reachable_from_every_non_terminal_state() {
        use DeploymentStatus::*;
        for s in [Pending, Provisioning, Building, Running, Stopped] {
            assert!(s.can_transition_to(Failed), "{s} -> FAILED");
        }
        assert!(!Destroyed.can_transition_to(Failed));
    }

    #[test]
    fn status_never_regresses() {
        use DeploymentStatus::*;
        let order = [Pending, Provisioning, Building, Running];
        for (i, later) in order.iter().enumerate() {
            for earlier in &order[..i] {
                assert!(!later.can_transition_to(*earlier), "{later} -> {earlier}");
            }
        }
        assert!(!Destroyed.can_transition_to(Pending));
        assert!(!Failed.can_transition_to(Provisioning));
    }

    #[test]
    fn retry_reenters_current_stage_only() {
        use DeploymentStatus::*;
        assert!(Provisioning.can_transition_to(Provisioning));
        assert!(Building.can_transition_to(Building));
        assert!(!Pending.can_transition_to(Pending));
        assert!(!Failed.can_transition_to(Failed));
        assert!(!Destroyed.can_transition_to(Destroyed));
    }

    #[test]
    fn status_serializes_screaming_case() {
        assert_eq!(
            serde_json::to_value(DeploymentStatus::Provisioning).unwrap(),
            serde_json::json!("PROVISIONING")
        );
    }

    #[test]
    fn policy_rejects_inverted_thresholds() {
        let err = ScalingPolicy::new("d", vec![cpu_rule()], 0.3, 0.3, 60, 1, 3).unwrap_err();
        assert!(matches!(err, PolicyError::ThresholdOrder { .. }));

        let err = ScalingPolicy::new("d", vec![cpu_rule()], 0.2, 0.6, 60, 1, 3).unwrap_err();
        assert!(matches!(err, PolicyError::ThresholdOrder { .. }));
    }

    #[test]
    fn policy_rejects_bad_instance_bounds() {
        let err = ScalingPolicy::new("d", vec![cpu_rule()], 0.7, 0.3, 60, 4, 3).unwrap_err();
        assert_eq!(err, PolicyError::InstanceBounds { min: 4, max: 3 });

        let err = ScalingPolicy::new("d", vec![cpu_rule()], 0.7, 0.3, 60, 0, 3).unwrap_err();
        assert_eq!(err, PolicyError::InstanceBounds { min: 0, max: 3 });
    }

    #[test]
    fn policy_rejects_empty_metrics_and_zero_weights() {
        let err = ScalingPolicy::new("d", vec![], 0.7, 0.3, 60, 1, 3).unwrap_err();
        assert_eq!(err, PolicyError::NoMetrics);

        let mut rule = cpu_rule();
        rule.weight = 0.0;
        let err = ScalingPolicy::new("d", vec![rule], 0.7, 0.3, 60, 1, 3).unwrap_err();
        assert!(matches!(err, PolicyError::Weight(_)));
    }

    #[test]
    fn weights_need_not_sum_to_one() {
        let mut a = cpu_rule();
        a.weight = 3.0;
        let b = MetricRule::new(MetricKind::Memory, 0.6, Comparison::GreaterThan, 2.0);
        assert!(ScalingPolicy::new("d", vec![a, b], 0.7, 0.3, 60, 1, 3).is_ok());
    }

    #[test]
    fn policy_clamps_instances() {
        let policy = ScalingPolicy::new("d", vec![cpu_rule()], 0.7, 0.3, 60, 2, 5).unwrap();
        assert_eq!(policy.clamp(0), 2);
        assert_eq!(policy.clamp(4), 4);
        assert_eq!(policy.clamp(9), 5);
    }

    #[test]
    fn comparison_operators() {
        assert!(Comparison::GreaterThan.holds(0.8, 0.7));
        assert!(!Comparison::GreaterThan.holds(0.7, 0.7));
        assert!(Comparison::GreaterOrEqual.holds(0.7, 0.7));
        assert!(Comparison::LessThan.holds(0.5, 0.6));
        assert!(Comparison::LessOrEqual.holds(0.6, 0.6));
    }

    #[test]
    fn sandbox_health_streak() {
        let mut meta = SandboxMeta::new("sbx", "dep", "owner", 1000, 300);
        meta.record_health(HealthStatus::Unhealthy);
        meta.record_health(HealthStatus::Unhealthy);
        meta.record_health(HealthStatus::Unknown);
        assert_eq!(meta.consecutive_failures, 2);
        meta.record_health(HealthStatus::Healthy);
        assert_eq!(meta.consecutive_failures, 0);
        assert_eq!(meta.end_at, 1300);
    }

    #[test]
    fn cooldown_remaining_counts_down() {
        let mut counter = InstanceCounter::new("d", 2);
        assert_eq!(counter.cooldown_remaining(180, 5000), 0);
        counter.last_scaling_action = Some(5000);
        assert_eq!(counter.cooldown_remaining(180, 5060), 120);
        assert_eq!(counter.cooldown_remaining(180, 5180), 0);
    }
}

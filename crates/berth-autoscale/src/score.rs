//! Composite scoring and the scaling decision. Pure functions: the clock
//! and the current instance counter are inputs.

use berth_state::{InstanceCounter, LiveMetrics, MetricKind, ScalingPolicy};
use serde::{Deserialize, Serialize};

/// Tolerance for score/threshold comparisons, so that a score computed as
/// exactly the threshold is not lost to floating point rounding.
const SCORE_EPSILON: f64 = 1e-9;

const RESPONSE_TIME_CEILING_MS: f64 = 5000.0;
const ERROR_RATE_CEILING: f64 = 0.10;
const REQUESTS_CEILING: f64 = 1000.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScalingAction {
    ScaleUp,
    ScaleDown,
    NoChange,
}

impl std::fmt::Display for ScalingAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            ScalingAction::ScaleUp => "scale_up",
            ScalingAction::ScaleDown => "scale_down",
            ScalingAction::NoChange => "no_change",
        })
    }
}

/// Map a raw metric into `[0, 1]` against its reference ceiling.
pub fn normalize(kind: MetricKind, metrics: &LiveMetrics) -> f64 {
    let raw = match kind {
        MetricKind::Cpu => metrics.cpu_percent / 100.0,
        MetricKind::Memory => metrics.memory_percent / 100.0,
        MetricKind::ResponseTime => metrics.response_time_ms / RESPONSE_TIME_CEILING_MS,
        MetricKind::ErrorRate => metrics.error_rate / ERROR_RATE_CEILING,
        MetricKind::Requests => metrics.requests_per_sec / REQUESTS_CEILING,
    };
    if raw.is_nan() { 0.0 } else { raw.clamp(0.0, 1.0) }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Score {
    /// Weighted mean of the normalized metrics, in `[0, 1]`.
    pub composite: f64,
    /// Share of the total weight whose rule comparison holds.
    pub breached_share: f64,
    /// Metrics whose rule comparison holds.
    pub breached: Vec<MetricKind>,
}

pub fn score(policy: &ScalingPolicy, metrics: &LiveMetrics) -> Score {
    let total: f64 = policy.metrics.iter().map(|r| r.weight).sum();
    if total <= 0.0 {
        return Score {
            composite: 0.0,
            breached_share: 0.0,
            breached: Vec::new(),
        };
    }

    let mut weighted = 0.0;
    let mut breached_weight = 0.0;
    let mut breached = Vec::new();
    for rule in &policy.metrics {
        let value = normalize(rule.metric, metrics);
        weighted += rule.weight * value;
        if rule.comparison.holds(value, rule.threshold) {
            breached_weight += rule.weight;
            breached.push(rule.metric);
        }
    }

    Score {
        composite: (weighted / total).clamp(0.0, 1.0),
        breached_share: breached_weight / total,
        breached,
    }
}

/// Outcome of one evaluation, reported for every decision including
/// `no_change`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScalingDecision {
    pub deployment_id: String,
    pub action: ScalingAction,
    pub current_instances: u32,
    pub target_instances: u32,
    pub score: f64,
    /// How strongly the evidence supports the action, in `[0, 1]`.
    pub confidence: f64,
    pub reason: String,
}

impl ScalingDecision {
    pub fn changes_instances(&self) -> bool {
        self.action != ScalingAction::NoChange && self.target_instances != self.current_instances
    }
}

/// Decide the next action for one deployment.
///
/// `step` is the instance delta per action. The current count is clamped
/// into the policy bounds before stepping, so a deployment that drifted
/// outside them is pulled back in.
pub fn decide(
    policy: &ScalingPolicy,
    counter: &InstanceCounter,
    metrics: &LiveMetrics,
    step: u32,
    now: u64,
) -> ScalingDecision {
    let s = score(policy, metrics);
    let current = counter.current_instances;
    let base = policy.clamp(current);

    let (action, target) = if s.composite + SCORE_EPSILON >= policy.scale_up_threshold {
        (ScalingAction::ScaleUp, policy.clamp(base.saturating_add(step)))
    } else if s.composite <= policy.scale_down_threshold + SCORE_EPSILON {
        (ScalingAction::ScaleDown, policy.clamp(base.saturating_sub(step)))
    } else {
        (ScalingAction::NoChange, current)
    };

    let no_change = |confidence: f64, reason: String| ScalingDecision {
        deployment_id: policy.deployment_id.clone(),
        action: ScalingAction::NoChange,
        current_instances: current,
        target_instances: current,
        score: s.composite,
        confidence,
        reason,
    };

    if action == ScalingAction::NoChange {
        return no_change(
            steady_confidence(policy, s.composite),
            format!(
                "score {:.2} between thresholds {:.2} and {:.2}",
                s.composite, policy.scale_down_threshold, policy.scale_up_threshold
            ),
        );
    }

    if target == current {
        let bound = if action == ScalingAction::ScaleUp {
            format!("max_instances {}", policy.max_instances)
        } else {
            format!("min_instances {}", policy.min_instances)
        };
        return no_change(1.0, format!("{action} wanted (score {:.2}) but already at {bound}", s.composite));
    }

    let remaining = counter.cooldown_remaining(policy.cooldown_secs, now);
    if remaining > 0 {
        return no_change(
            1.0,
            format!("{action} suppressed by cooldown, {remaining}s remaining (score {:.2})", s.composite),
        );
    }

    let (confidence, drivers) = match action {
        ScalingAction::ScaleUp => (s.breached_share, s.breached.clone()),
        _ => {
            let calm: Vec<MetricKind> = policy
                .metrics
                .iter()
                .map(|r| r.metric)
                .filter(|m| !s.breached.contains(m))
                .collect();
            (1.0 - s.breached_share, calm)
        }
    };
    let drivers = if drivers.is_empty() {
        "composite".to_string()
    } else {
        drivers.iter().map(|m| m.to_string()).collect::<Vec<_>>().join(", ")
    };

    let threshold = if action == ScalingAction::ScaleUp {
        policy.scale_up_threshold
    } else {
        policy.scale_down_threshold
    };
    ScalingDecision {
        deployment_id: policy.deployment_id.clone(),
        action,
        current_instances: current,
        target_instances: target,
        score: s.composite,
        confidence: confidence.clamp(0.0, 1.0),
        reason: format!(
            "score {:.2} crossed {action} threshold {threshold:.2} ({drivers})",
            s.composite
        ),
    }
}

/// Confidence in holding steady: 1 at the midpoint between thresholds,
/// falling to 0 at either threshold.
fn steady_confidence(policy: &ScalingPolicy, composite: f64) -> f64 {
    let half = (policy.scale_up_threshold - policy.scale_down_threshold) / 2.0;
    if half <= 0.0 {
        return 0.0;
    }
    let mid = policy.scale_down_threshold + half;
    (1.0 - (composite - mid).abs() / half).clamp(0.0, 1.0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use berth_state::{Comparison, MetricRule};

    fn balanced_policy() -> ScalingPolicy {
        ScalingPolicy::new(
            "dep-1",
            vec![
                MetricRule::new(MetricKind::Cpu, 0.7, Comparison::GreaterThan, 0.5),
                MetricRule::new(MetricKind::Memory, 0.6, Comparison::GreaterThan, 0.5),
            ],
            0.65,
            0.35,
            180,
            1,
            5,
        )
        .unwrap()
    }

    fn load(cpu: f64, memory: f64) -> LiveMetrics {
        LiveMetrics {
            cpu_percent: cpu,
            memory_percent: memory,
            ..LiveMetrics::default()
        }
    }

    #[test]
    fn normalization_ceilings() {
        let m = LiveMetrics {
            cpu_percent: 50.0,
            memory_percent: 150.0,
            response_time_ms: 2500.0,
            error_rate: 0.05,
            requests_per_sec: 250.0,
        };
        assert_eq!(normalize(MetricKind::Cpu, &m), 0.5);
        assert_eq!(normalize(MetricKind::Memory, &m), 1.0);
        assert_eq!(normalize(MetricKind::ResponseTime, &m), 0.5);
        assert!((normalize(MetricKind::ErrorRate, &m) - 0.5).abs() < 1e-12);
        assert_eq!(normalize(MetricKind::Requests, &m), 0.25);
    }

    #[test]
    fn score_exactly_at_threshold_scales_up() {
        let policy = balanced_policy();
        let counter = InstanceCounter::new("dep-1", 2);
        let d = decide(&policy, &counter, &load(80.0, 50.0), 1, 1000);

        assert!((d.score - 0.65).abs() < 1e-9);
        assert_eq!(d.action, ScalingAction::ScaleUp);
        assert_eq!(d.target_instances, 3);
        // Only cpu breaches its own threshold.
        assert_eq!(d.confidence, 0.5);
        assert!(d.reason.contains("cpu"), "{}", d.reason);
    }

    #[test]
    fn low_load_scales_down_to_min() {
        let policy = balanced_policy();
        let d = decide(&policy, &InstanceCounter::new("dep-1", 2), &load(10.0, 20.0), 3, 1000);
        assert_eq!(d.action, ScalingAction::ScaleDown);
        assert_eq!(d.target_instances, 1);
        assert_eq!(d.confidence, 1.0);
    }

    #[test]
    fn middle_band_is_no_change_with_confidence() {
        let policy = balanced_policy();
        let d = decide(&policy, &InstanceCounter::new("dep-1", 2), &load(50.0, 50.0), 1, 1000);
        assert_eq!(d.action, ScalingAction::NoChange);
        assert_eq!(d.target_instances, 2);
        assert!((d.confidence - 1.0).abs() < 1e-9);
        assert!(!d.changes_instances());
    }

    #[test]
    fn cooldown_suppresses_action() {
        let policy = balanced_policy();
        let mut counter = InstanceCounter::new("dep-1", 2);
        counter.last_scaling_action = Some(1000);

        let d = decide(&policy, &counter, &load(95.0, 90.0), 1, 1179);
        assert_eq!(d.action, ScalingAction::NoChange);
        assert!(d.reason.contains("1s remaining"), "{}", d.reason);

        let d = decide(&policy, &counter, &load(95.0, 90.0), 1, 1180);
        assert_eq!(d.action, ScalingAction::ScaleUp);
    }

    #[test]
    fn at_bound_is_no_change() {
        let policy = balanced_policy();
        let d = decide(&policy, &InstanceCounter::new("dep-1", 5), &load(99.0, 99.0), 1, 1000);
        assert_eq!(d.action, ScalingAction::NoChange);
        assert!(d.reason.contains("max_instances 5"));
    }

    #[test]
    fn step_is_clamped() {
        let policy = balanced_policy();
        let d = decide(&policy, &InstanceCounter::new("dep-1", 4), &load(99.0, 99.0), 3, 1000);
        assert_eq!(d.target_instances, 5);
    }

    #[test]
    fn less_than_rules_breach_on_low_values() {
        let policy = ScalingPolicy::new(
            "dep-1",
            vec![MetricRule::new(MetricKind::Requests, 0.1, Comparison::LessThan, 1.0)],
            0.8,
            0.2,
            60,
            1,
            4,
        )
        .unwrap();
        let s = score(&policy, &LiveMetrics::default());
        assert_eq!(s.composite, 0.0);
        assert_eq!(s.breached, vec![MetricKind::Requests]);
    }
}

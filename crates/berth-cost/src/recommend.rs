//! Advisory recommendations derived from usage history.

use berth_provision::ResourceProfile;
use berth_state::{ScalingPolicy, UsageSample};
use serde::{Deserialize, Serialize};

/// Fewer samples than this (one hour at the default interval) is too
/// little history to advise on.
pub const MIN_SAMPLES: usize = 12;

const RIGHT_SIZE_PEAK_CPU: f64 = 0.30;
const RIGHT_SIZE_AVG_MEMORY: f64 = 0.40;
const IDLE_CPU: f64 = 0.05;
const IDLE_SHARE: f64 = 0.25;
const LOW_AVG_CPU: f64 = 0.30;
const HOT_AVG_CPU: f64 = 0.80;
const HOT_PEAK_MEMORY: f64 = 0.90;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecommendationKind {
    RightSizing,
    Schedule,
    CostReduction,
    Performance,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Recommendation {
    pub deployment_id: String,
    pub kind: RecommendationKind,
    pub message: String,
    /// Estimated monthly saving; zero for performance advice.
    pub estimated_monthly_savings: f64,
}

struct Utilization {
    avg_cpu: f64,
    peak_cpu: f64,
    avg_memory: f64,
    peak_memory: f64,
    idle_share: f64,
}

fn utilization(samples: &[UsageSample], allocated: &ResourceProfile) -> Option<Utilization> {
    if samples.is_empty() || allocated.cpu_cores <= 0.0 || allocated.memory_mb == 0 {
        return None;
    }
    let n = samples.len() as f64;
    let cpu: Vec<f64> = samples.iter().map(|s| s.cpu_usage / allocated.cpu_cores).collect();
    let memory: Vec<f64> = samples.iter().map(|s| s.memory_usage / allocated.memory_gb()).collect();
    let idle = samples
        .iter()
        .zip(&cpu)
        .filter(|(s, c)| **c < IDLE_CPU && s.network_io <= 0.0)
        .count() as f64;
    Some(Utilization {
        avg_cpu: cpu.iter().sum::<f64>() / n,
        peak_cpu: cpu.iter().copied().fold(0.0, f64::max),
        avg_memory: memory.iter().sum::<f64>() / n,
        peak_memory: memory.iter().copied().fold(0.0, f64::max),
        idle_share: idle / n,
    })
}

/// Advice for one deployment from its retained history.
///
/// `allocated` is the deployment's total provisioned capacity, `monthly_cost`
/// its current monthly projection.
pub fn recommend(
    deployment_id: &str,
    samples: &[UsageSample],
    allocated: &ResourceProfile,
    policy: Option<&ScalingPolicy>,
    monthly_cost: f64,
) -> Vec<Recommendation> {
    if samples.len() < MIN_SAMPLES {
        return Vec::new();
    }
    let Some(u) = utilization(samples, allocated) else {
        return Vec::new();
    };
    let mut out = Vec::new();
    let mut push = |kind, message: String, savings: f64| {
        out.push(Recommendation {
            deployment_id: deployment_id.to_string(),
            kind,
            message,
            estimated_monthly_savings: (savings * 100.0).round() / 100.0,
        });
    };

    if u.peak_cpu < RIGHT_SIZE_PEAK_CPU && u.avg_memory < RIGHT_SIZE_AVG_MEMORY {
        let smaller = allocated.smaller();
        let saved_share = 1.0 - smaller.cpu_cores / allocated.cpu_cores;
        push(
            RecommendationKind::RightSizing,
            format!(
                "peak CPU {:.0}% and average memory {:.0}% of allocation; {} cores / {} MB would suffice",
                u.peak_cpu * 100.0,
                u.avg_memory * 100.0,
                smaller.cpu_cores,
                smaller.memory_mb
            ),
            monthly_cost * saved_share,
        );
    }

    if u.idle_share >= IDLE_SHARE {
        push(
            RecommendationKind::Schedule,
            format!(
                "idle in {:.0}% of samples; stop or scale down during idle hours",
                u.idle_share * 100.0
            ),
            monthly_cost * u.idle_share,
        );
    }

    if let Some(p) = policy
        && p.min_instances > 1
        && u.avg_cpu < LOW_AVG_CPU
    {
        push(
            RecommendationKind::CostReduction,
            format!(
                "average CPU {:.0}% with min_instances {}; lowering min_instances to 1 keeps headroom",
                u.avg_cpu * 100.0,
                p.min_instances
            ),
            monthly_cost * f64::from(p.min_instances - 1) / f64::from(p.min_instances),
        );
    }

    if u.avg_cpu > HOT_AVG_CPU || u.peak_memory > HOT_PEAK_MEMORY {
        let message = match policy {
            Some(p) if p.is_enabled => format!(
                "average CPU {:.0}%, peak memory {:.0}%; raise max_instances above {} or use a larger profile",
                u.avg_cpu * 100.0,
                u.peak_memory * 100.0,
                p.max_instances
            ),
            _ => format!(
                "average CPU {:.0}%, peak memory {:.0}%; enable autoscaling or use a larger profile",
                u.avg_cpu * 100.0,
                u.peak_memory * 100.0
            ),
        };
        push(RecommendationKind::Performance, message, 0.0);
    }

    out
}

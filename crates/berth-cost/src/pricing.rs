//! Cost estimation from unit rates.

use std::time::Duration;

use berth_core::UnitRates;
use berth_provision::UsageReading;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CostBreakdown {
    pub compute: f64,
    pub memory: f64,
    pub storage: f64,
    pub network: f64,
    pub total: f64,
}

/// Cost of `usage` sustained over `interval`.
///
/// Compute, memory and storage are billed per hour of use; network per MB
/// transferred during the interval.
pub fn estimate(usage: &UsageReading, rates: &UnitRates, interval: Duration) -> CostBreakdown {
    let hours = interval.as_secs_f64() / 3600.0;
    let compute = usage.cpu_cores.max(0.0) * rates.cpu_hour * hours;
    let memory = usage.memory_gb.max(0.0) * rates.memory_gb_hour * hours;
    let storage = usage.disk_gb.max(0.0) * rates.storage_gb_hour * hours;
    let network = usage.network_mb.max(0.0) * rates.network_mb;
    CostBreakdown {
        compute,
        memory,
        storage,
        network,
        total: compute + memory + storage + network,
    }
}

/// Sum readings from every sandbox of one deployment into one reading.
pub(crate) fn aggregate<'a>(readings: impl IntoIterator<Item = &'a UsageReading>) -> UsageReading {
    let mut total = UsageReading::default();
    let mut n = 0.0;
    for r in readings {
        total.cpu_cores += r.cpu_cores;
        total.memory_gb += r.memory_gb;
        total.disk_gb += r.disk_gb;
        total.network_mb += r.network_mb;
        total.cpu_percent += r.cpu_percent;
        total.memory_percent += r.memory_percent;
        total.requests_per_sec += r.requests_per_sec;
        total.last_activity = total.last_activity.max(r.last_activity);
        n += 1.0;
    }
    if n > 0.0 {
        total.cpu_percent /= n;
        total.memory_percent /= n;
    }
    total
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn five_minutes_of_one_standard_sandbox() {
        let usage = UsageReading {
            cpu_cores: 1.0,
            memory_gb: 1.0,
            disk_gb: 5.0,
            network_mb: 100.0,
            ..UsageReading::default()
        };
        let cost = estimate(&usage, &UnitRates::default(), Duration::from_secs(300));

        let h = 300.0 / 3600.0;
        assert!((cost.compute - 0.048 * h).abs() < 1e-12);
        assert!((cost.memory - 0.0065 * h).abs() < 1e-12);
        assert!((cost.storage - 5.0 * 0.00014 * h).abs() < 1e-12);
        assert!((cost.network - 0.009).abs() < 1e-12);
        assert!((cost.total - (cost.compute + cost.memory + cost.storage + cost.network)).abs() < 1e-15);
    }

    #[test]
    fn aggregate_sums_absolute_and_averages_percent() {
        let a = UsageReading {
            cpu_cores: 0.5,
            cpu_percent: 50.0,
            last_activity: Some(10),
            ..UsageReading::default()
        };
        let b = UsageReading {
            cpu_cores: 0.25,
            cpu_percent: 25.0,
            last_activity: Some(20),
            ..UsageReading::default()
        };
        let total = aggregate([&a, &b]);
        assert_eq!(total.cpu_cores, 0.75);
        assert_eq!(total.cpu_percent, 37.5);
        assert_eq!(total.last_activity, Some(20));
    }
}

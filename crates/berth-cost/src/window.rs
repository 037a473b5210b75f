//! Bounded FIFO window of usage samples for one deployment.
//!
//! A window is bounded twice: by sample count and by age. A deployment that
//! stops producing samples keeps nothing older than `max_age_secs`.

use std::collections::VecDeque;

use berth_state::UsageSample;

#[derive(Debug, Clone)]
pub struct UsageWindow {
    samples: VecDeque<UsageSample>,
    capacity: usize,
    max_age_secs: u64,
}

impl UsageWindow {
    pub fn new(capacity: usize, max_age_secs: u64) -> Self {
        Self {
            samples: VecDeque::with_capacity(capacity.min(1024)),
            capacity: capacity.max(1),
            max_age_secs: max_age_secs.max(1),
        }
    }

    /// Rebuild from persisted samples (oldest first), keeping the newest.
    pub fn from_samples(samples: Vec<UsageSample>, capacity: usize, max_age_secs: u64) -> Self {
        let mut window = Self::new(capacity, max_age_secs);
        for s in samples {
            window.push(s);
        }
        window
    }

    /// Append a sample, evicting the oldest ones over capacity or older
    /// than the window's age limit at the new sample's time. Returns the
    /// number evicted.
    pub fn push(&mut self, sample: UsageSample) -> usize {
        let now = sample.timestamp;
        self.samples.push_back(sample);
        let mut evicted = self.expire(now);
        while self.samples.len() > self.capacity {
            self.samples.pop_front();
            evicted += 1;
        }
        evicted
    }

    /// Drop samples at least `max_age_secs` old at `now`. Returns the number
    /// dropped.
    pub fn expire(&mut self, now: u64) -> usize {
        let mut evicted = 0;
        while let Some(oldest) = self.samples.front() {
            if now.saturating_sub(oldest.timestamp) < self.max_age_secs {
                break;
            }
            self.samples.pop_front();
            evicted += 1;
        }
        evicted
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn latest(&self) -> Option<&UsageSample> {
        self.samples.back()
    }

    pub fn iter(&self) -> impl Iterator<Item = &UsageSample> {
        self.samples.iter()
    }

    pub fn to_vec(&self) -> Vec<UsageSample> {
        self.samples.iter().cloned().collect()
    }

    pub fn total_cost(&self) -> f64 {
        self.samples.iter().map(|s| s.cost_estimate).sum()
    }

    /// Cost per second over the covered period, each sample covering
    /// `interval_secs`.
    pub fn cost_rate(&self, interval_secs: u64) -> f64 {
        let covered = self.samples.len() as u64 * interval_secs;
        if covered == 0 {
            0.0
        } else {
            self.total_cost() / covered as f64
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(ts: u64, cost: f64) -> UsageSample {
        UsageSample {
            deployment_id: "dep-1".to_string(),
            cpu_usage: 0.5,
            memory_usage: 0.5,
            network_io: 0.0,
            disk_io: 1.0,
            cost_estimate: cost,
            timestamp: ts,
        }
    }

    #[test]
    fn evicts_oldest_first() {
        let mut w = UsageWindow::new(288, 288 * 300);
        for i in 0..300 {
            w.push(sample(i, 0.01));
        }
        assert_eq!(w.len(), 288);
        assert_eq!(w.iter().next().unwrap().timestamp, 12);
        assert_eq!(w.latest().unwrap().timestamp, 299);
    }

    #[test]
    fn cost_rate_over_covered_time() {
        let mut w = UsageWindow::new(10, 3000);
        assert_eq!(w.cost_rate(300), 0.0);
        w.push(sample(0, 0.30));
        w.push(sample(300, 0.30));
        assert!((w.cost_rate(300) - 0.001).abs() < 1e-12);
    }

    #[test]
    fn samples_age_out_without_new_ones() {
        let mut w = UsageWindow::new(288, 288 * 300);
        w.push(sample(1000, 0.3));
        w.push(sample(1300, 0.3));

        assert_eq!(w.expire(1000 + 288 * 300 - 1), 0);
        assert_eq!(w.expire(1000 + 288 * 300), 1);
        assert_eq!(w.latest().unwrap().timestamp, 1300);
        assert_eq!(w.expire(1000 + 7 * 24 * 3600), 1);
        assert!(w.is_empty());
        assert_eq!(w.cost_rate(300), 0.0);
    }

    #[test]
    fn push_after_a_gap_drops_stale_samples() {
        let mut w = UsageWindow::new(10, 3000);
        w.push(sample(0, 0.3));
        w.push(sample(300, 0.3));
        assert_eq!(w.push(sample(3300, 0.3)), 2);
        assert_eq!(w.len(), 1);
    }
}

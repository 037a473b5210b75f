//! Budget evaluation with once-per-billing-period alerts.
//!
//! The billing period is the UTC calendar month. A level that fired in a
//! period stays quiet until the next period, however often the projection
//! crosses it again. The fired levels are persisted so a restart does not
//! announce them a second time.

use std::collections::HashSet;

use berth_core::BudgetConfig;
pub use berth_state::BudgetLevel;
use berth_state::BudgetAlertState;
use chrono::{DateTime, Datelike, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

const DEFAULT_MONTH_SECS: u64 = 30 * 24 * 3600;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BudgetAlert {
    pub level: BudgetLevel,
    /// `YYYY-MM`.
    pub period: String,
    pub projected_cost: f64,
    pub monthly_limit: f64,
    /// Projection as a percent of the limit.
    pub percent_used: f64,
    pub threshold: f64,
}

/// `YYYY-MM` of the UTC month containing `now`.
pub fn billing_period(now: u64) -> String {
    match DateTime::<Utc>::from_timestamp(now as i64, 0) {
        Some(t) => t.format("%Y-%m").to_string(),
        None => "unknown".to_string(),
    }
}

/// Length of the UTC month containing `now`.
pub fn seconds_in_month(now: u64) -> u64 {
    let Some(t) = DateTime::<Utc>::from_timestamp(now as i64, 0) else {
        return DEFAULT_MONTH_SECS;
    };
    let (year, month) = (t.year(), t.month());
    let (next_year, next_month) = if month == 12 { (year + 1, 1) } else { (year, month + 1) };
    match (
        NaiveDate::from_ymd_opt(year, month, 1),
        NaiveDate::from_ymd_opt(next_year, next_month, 1),
    ) {
        (Some(start), Some(end)) => (end - start).num_seconds().max(0) as u64,
        _ => DEFAULT_MONTH_SECS,
    }
}

/// Remembers which levels already fired in the current period.
#[derive(Debug, Default)]
pub struct BudgetTracker {
    period: String,
    fired: HashSet<BudgetLevel>,
}

impl BudgetTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Resume from persisted state.
    pub fn from_state(state: BudgetAlertState) -> Self {
        Self {
            period: state.period,
            fired: state.fired.into_iter().collect(),
        }
    }

    pub fn state(&self) -> BudgetAlertState {
        let mut fired: Vec<BudgetLevel> = self.fired.iter().copied().collect();
        fired.sort();
        BudgetAlertState {
            period: self.period.clone(),
            fired,
        }
    }

    /// Compare a monthly projection with the budget and return the alerts
    /// that have not fired yet in this period, lowest level first.
    pub fn evaluate(&mut self, budget: &BudgetConfig, projected: f64, now: u64) -> Vec<BudgetAlert> {
        if !budget.is_enabled || budget.monthly_limit <= 0.0 {
            return Vec::new();
        }
        let period = billing_period(now);
        if period != self.period {
            self.period = period.clone();
            self.fired.clear();
        }

        let percent_used = projected / budget.monthly_limit * 100.0;
        let mut alerts = Vec::new();
        for (level, threshold) in [
            (BudgetLevel::Warning, budget.warning_threshold),
            (BudgetLevel::Critical, budget.critical_threshold),
        ] {
            if percent_used >= threshold && self.fired.insert(level) {
                alerts.push(BudgetAlert {
                    level,
                    period: period.clone(),
                    projected_cost: projected,
                    monthly_limit: budget.monthly_limit,
                    percent_used,
                    threshold,
                });
            }
        }
        alerts
    }

    pub fn has_fired(&self, level: BudgetLevel) -> bool {
        self.fired.contains(&level)
    }
}

//! berth-cost — the Cost/Resource Optimizer.
//!
//! - [`pricing`]: per-sample cost from fixed unit rates
//! - [`window`]: the bounded rolling window of usage samples
//! - [`budget`]: monthly projection and once-per-period budget alerts
//! - [`recommend`]: advisory recommendations, a pure function of history
//! - [`optimizer`]: the sampling loop tying them together
//!
//! Nothing in this crate mutates control-plane state; recommendations are
//! advice for an operator.

pub mod budget;
pub mod error;
pub mod optimizer;
pub mod pricing;
pub mod recommend;
pub mod window;

pub use budget::{BudgetAlert, BudgetLevel, BudgetTracker, billing_period, seconds_in_month};
pub use error::{CostError, CostResult};
pub use optimizer::{CostOptimizer, UsageSummary};
pub use pricing::{CostBreakdown, estimate};
pub use recommend::{Recommendation, RecommendationKind, recommend};
pub use window::UsageWindow;

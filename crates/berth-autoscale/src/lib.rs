//! berth-autoscale — the Autoscaling Decision Engine.
//!
//! Evaluates every enabled `ScalingPolicy` on a fixed interval and moves
//! the deployment's instance count one bounded step at a time.
//!
//! # Scoring
//!
//! ```text
//! normalized(metric) = clamp(raw / ceiling, 0, 1)
//!     cpu, memory      ceiling 100 (%)
//!     response_time    ceiling 5000 ms
//!     error_rate       ceiling 0.10
//!     requests         ceiling 1000 rps
//!
//! score = Σ weight·normalized / Σ weight
//!
//! score >= scale_up_threshold    → scale_up   (+step, clamped to max)
//! score <= scale_down_threshold  → scale_down (−step, clamped to min)
//! otherwise                      → no_change
//! ```
//!
//! An action is suppressed while the deployment's cooldown window is open.
//! Operator overrides skip scoring but are still clamped and still open a
//! fresh cooldown window.

pub mod engine;
pub mod error;
pub mod score;

pub use engine::{AutoscaleEngine, MetricsSource, ScaleTarget};
pub use error::{AutoscaleError, AutoscaleResult};
pub use score::{Score, ScalingAction, ScalingDecision, decide, normalize, score};

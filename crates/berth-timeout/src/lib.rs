//! berth-timeout — the Timeout Manager.
//!
//! Classifies each deployment into a complexity tier, assigns the tier's
//! time budget, grants extensions and decides when a deployment must be
//! force-terminated.

pub mod budget;
pub mod manager;

pub use budget::{KillReason, Observation, TimeoutBudget, Verdict, classify};
pub use manager::TimeoutManager;

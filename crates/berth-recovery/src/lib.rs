//! berth-recovery — the Error Classifier and Recovery Coordinator.
//!
//! Raw failures from the pipeline ([`Failure`]) are mapped onto the
//! deployment error taxonomy ([`ClassifiedError`]); the coordinator then
//! decides whether a stage is retried, retried with a smaller resource
//! profile, or aborted.
//!
//! ```text
//! Failure ──classify──► ClassifiedError ──handle_error──► RecoveryDecision
//!                            │                              retry (+delay)
//!                            └─ sanitize_message            fallback
//!                                                           abort
//! ```

pub mod backoff;
pub mod classify;
pub mod coordinator;
pub mod sanitize;

pub use backoff::backoff_delay;
pub use classify::{ClassifiedError, Failure, Severity, classify};
pub use coordinator::{RecoveryAction, RecoveryContext, RecoveryCoordinator, RecoveryDecision};
pub use sanitize::sanitize_message;

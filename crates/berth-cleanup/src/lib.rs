//! berth-cleanup — the Cleanup Scheduler.
//!
//! A periodic sweep over the sandbox registry that reclaims sandboxes by
//! priority, independent of the deployment controller's own termination
//! path. It is the backstop that guarantees a failed or abandoned
//! deployment never leaks a sandbox.
//!
//! | Priority | Condition                         | Grace                  |
//! |----------|-----------------------------------|------------------------|
//! | 1        | owning deployment failed          | none                   |
//! | 2        | no owning deployment record       | `orphan_grace`         |
//! | 3        | owner over its sandbox quota      | none (oldest first)    |
//! | 4        | older than `max_age`              | `max_age_grace`        |
//! | 5        | idle longer than `idle_timeout`   | the deployment timeout |

pub mod error;
pub mod policy;
pub mod scheduler;

pub use error::{CleanupError, CleanupResult};
pub use policy::{Candidate, ReclaimReason, select_candidates};
pub use scheduler::{CleanupHandle, CleanupScheduler, SweepReport};

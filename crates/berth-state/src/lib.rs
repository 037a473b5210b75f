//! berth-state — domain model and persistence for the Berth control plane.
//!
//! Backed by [redb](https://docs.rs/redb). All domain types are
//! JSON-serialized into `&[u8]` value columns. Composite keys
//! (`{deployment_id}:{timestamp}`) keep per-deployment history contiguous.
//!
//! The [`StateStore`] is `Clone` + `Send` + `Sync` (backed by
//! `Arc<Database>`) and implements the async [`Persistence`] collaborator
//! by moving each transaction onto the blocking pool.

pub mod error;
pub mod persistence;
pub mod store;
pub mod tables;
pub mod types;

pub use berth_core::BudgetConfig;
pub use error::{PolicyError, StateError, StateResult};
pub use persistence::Persistence;
pub use store::StateStore;
pub use types::*;

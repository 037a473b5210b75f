//! berth-registry — the in-memory sandbox registry.
//!
//! The registry is the only structure mutated by more than one component
//! (deployment controller, cleanup scheduler). It is a rebuildable cache
//! over the persisted sandbox records, held in a `DashMap` so updates to
//! different sandboxes never contend on a single lock.
//!
//! [`KeyedLocks`] provides the matching per-deployment async mutex used to
//! serialize lifecycle transitions for a single deployment id.

pub mod locks;
pub mod registry;

pub use locks::{KeyGuard, KeyedLocks};
pub use registry::SandboxRegistry;

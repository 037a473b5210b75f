//! berth-provision — the collaborators the control plane drives.
//!
//! - [`Provisioner`]: creates, prepares, health-checks and terminates
//!   sandboxes. The control plane never runs user code itself.
//! - [`ProjectClassifier`]: reports file count, dependency count and
//!   estimated build time for a submitted project.
//!
//! [`InMemoryProvisioner`] simulates a sandbox backend with scriptable
//! failures; it backs the daemon's local mode and every test suite.

pub mod classifier;
pub mod error;
pub mod memory;
pub mod provisioner;
pub mod types;

pub use classifier::{ManifestClassifier, ProjectClassifier, StaticClassifier};
pub use error::{ProvisionError, ProvisionResult};
pub use memory::InMemoryProvisioner;
pub use provisioner::Provisioner;
pub use types::{ProjectFile, ProjectProfile, ResourceProfile, SandboxHandle, SandboxSpec, UsageReading};

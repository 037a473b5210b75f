//! Request and response types exchanged with the collaborators.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// Compute shape requested for one sandbox.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ResourceProfile {
    pub cpu_cores: f64,
    pub memory_mb: u64,
    pub disk_gb: f64,
}

impl ResourceProfile {
    pub const STANDARD: ResourceProfile = ResourceProfile {
        cpu_cores: 1.0,
        memory_mb: 1024,
        disk_gb: 5.0,
    };

    const FLOOR: ResourceProfile = ResourceProfile {
        cpu_cores: 0.25,
        memory_mb: 256,
        disk_gb: 1.0,
    };

    /// The fallback profile: half of every dimension, never below the floor.
    pub fn smaller(&self) -> ResourceProfile {
        ResourceProfile {
            cpu_cores: (self.cpu_cores / 2.0).max(Self::FLOOR.cpu_cores),
            memory_mb: (self.memory_mb / 2).max(Self::FLOOR.memory_mb),
            disk_gb: (self.disk_gb / 2.0).max(Self::FLOOR.disk_gb),
        }
    }

    pub fn memory_gb(&self) -> f64 {
        self.memory_mb as f64 / 1024.0
    }
}

impl Default for ResourceProfile {
    fn default() -> Self {
        Self::STANDARD
    }
}

/// What to run in a sandbox.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SandboxSpec {
    pub deployment_id: String,
    pub project_id: String,
    pub owner_id: String,
    pub runtime: String,
    pub profile: ResourceProfile,
    pub env: HashMap<String, String>,
    /// Paths of the project files shipped into the sandbox.
    pub files: Vec<String>,
}

/// A sandbox the backend confirmed as created.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SandboxHandle {
    pub sandbox_id: String,
    pub profile: ResourceProfile,
}

/// One resource usage reading for a sandbox.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct UsageReading {
    /// Percent of the allocated CPU.
    pub cpu_percent: f64,
    /// Percent of the allocated memory.
    pub memory_percent: f64,
    /// Absolute cores in use.
    pub cpu_cores: f64,
    /// Absolute memory in use, GB.
    pub memory_gb: f64,
    /// Storage in use, GB.
    pub disk_gb: f64,
    /// Network transfer since the previous reading, MB.
    pub network_mb: f64,
    pub requests_per_sec: f64,
    pub response_time_ms: f64,
    /// Fraction of failed requests (0.0–1.0).
    pub error_rate: f64,
    /// Unix timestamp of the last request or process activity.
    pub last_activity: Option<u64>,
}

/// One submitted project file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProjectFile {
    /// Path relative to the project root, `/`-separated.
    pub path: String,
    /// Text contents; empty for binary or unread files.
    #[serde(default)]
    pub contents: String,
}

impl ProjectFile {
    pub fn new(path: &str, contents: &str) -> Self {
        Self {
            path: path.to_string(),
            contents: contents.to_string(),
        }
    }

    pub fn file_name(&self) -> &str {
        self.path.rsplit('/').next().unwrap_or(&self.path)
    }
}

/// Classifier output consumed by the timeout manager.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ProjectProfile {
    pub file_count: u32,
    pub dependency_count: u32,
    pub estimated_build_secs: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn smaller_profile_halves_until_floor() {
        let small = ResourceProfile::STANDARD.smaller();
        assert_eq!(small.cpu_cores, 0.5);
        assert_eq!(small.memory_mb, 512);

        let tiny = small.smaller().smaller().smaller();
        assert_eq!(tiny.cpu_cores, 0.25);
        assert_eq!(tiny.memory_mb, 256);
        assert_eq!(tiny.disk_gb, 1.0);
    }

    #[test]
    fn file_name_strips_directories() {
        assert_eq!(ProjectFile::new("web/package.json", "").file_name(), "package.json");
        assert_eq!(ProjectFile::new("Cargo.toml", "").file_name(), "Cargo.toml");
    }
}

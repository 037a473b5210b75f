//! Request and view types exposed by the controller.

use std::collections::HashMap;

use berth_provision::{ProjectFile, ResourceProfile, SandboxSpec};
use berth_state::{Deployment, HealthStatus, LiveMetrics, SandboxMeta};
use berth_timeout::TimeoutBudget;
use serde::{Deserialize, Serialize};

use crate::logs::LogLine;

/// Per-deployment settings accepted by `deploy_project`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeployConfig {
    pub project_id: String,
    pub owner_id: String,
    pub runtime: String,
    #[serde(default)]
    pub env: HashMap<String, String>,
    #[serde(default)]
    pub profile: ResourceProfile,
}

impl DeployConfig {
    pub fn new(project_id: &str, owner_id: &str, runtime: &str) -> Self {
        Self {
            project_id: project_id.to_string(),
            owner_id: owner_id.to_string(),
            runtime: runtime.to_string(),
            env: HashMap::new(),
            profile: ResourceProfile::STANDARD,
        }
    }

    pub(crate) fn validate(&self) -> Result<(), String> {
        if self.project_id.trim().is_empty() {
            return Err("project_id is empty".into());
        }
        if self.owner_id.trim().is_empty() {
            return Err("owner_id is empty".into());
        }
        if self.runtime.trim().is_empty() {
            return Err("runtime is empty".into());
        }
        if self.profile.cpu_cores <= 0.0 || self.profile.memory_mb == 0 {
            return Err("resource profile must allocate cpu and memory".into());
        }
        Ok(())
    }

    pub(crate) fn sandbox_spec(&self, deployment_id: &str, files: &[ProjectFile]) -> SandboxSpec {
        SandboxSpec {
            deployment_id: deployment_id.to_string(),
            project_id: self.project_id.clone(),
            owner_id: self.owner_id.clone(),
            runtime: self.runtime.clone(),
            profile: self.profile,
            env: self.env.clone(),
            files: files.iter().map(|f| f.path.clone()).collect(),
        }
    }
}

/// Read-only projection returned by `monitor_deployment`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeploymentView {
    pub deployment: Deployment,
    /// Worst health across the deployment's sandboxes.
    pub health: HealthStatus,
    /// Averaged over sandboxes from their last recorded usage.
    pub metrics: LiveMetrics,
    pub sandboxes: Vec<SandboxMeta>,
    pub budget: Option<TimeoutBudget>,
    pub logs: Vec<LogLine>,
}

/// What `restore` found on startup.
#[derive(Debug, Default, Clone, PartialEq, Serialize, Deserialize)]
pub struct RestoreReport {
    pub sandboxes: usize,
    /// RUNNING deployments whose supervision resumed.
    pub resumed: Vec<String>,
    /// Deployments caught mid-pipeline and marked failed.
    pub interrupted: Vec<String>,
}

//! Shared wiring for controller integration tests.

#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use berth_cleanup::CleanupScheduler;
use berth_controller::{Collaborators, DeployConfig, DeploymentController};
use berth_core::{BerthConfig, EventBus, EventQueue};
use berth_provision::{InMemoryProvisioner, ProjectClassifier, ProjectFile, StaticClassifier};
use berth_registry::SandboxRegistry;
use berth_state::{Deployment, DeploymentStatus, Persistence, StateStore};
use tokio::sync::mpsc;

pub struct Harness {
    pub controller: Arc<DeploymentController>,
    pub provisioner: Arc<InMemoryProvisioner>,
    pub store: StateStore,
    pub persistence: Arc<dyn Persistence>,
    pub registry: Arc<SandboxRegistry>,
    pub cleanup: Arc<CleanupScheduler>,
    pub events: EventBus,
    pub config: BerthConfig,
    /// Immediate cleanup requests the controller issued.
    pub requests: mpsc::Receiver<String>,
    _queue: EventQueue,
}

impl Harness {
    /// A simple project: 10 files, no dependencies.
    pub fn new() -> Self {
        Self::build(
            StateStore::open_in_memory().unwrap(),
            Arc::new(InMemoryProvisioner::new()),
            Arc::new(StaticClassifier::new(10, 0, 20)),
        )
    }

    pub fn build(
        store: StateStore,
        provisioner: Arc<InMemoryProvisioner>,
        classifier: Arc<dyn ProjectClassifier>,
    ) -> Self {
        let config = BerthConfig::default();
        let (events, queue) = EventBus::new(config.events.capacity);
        let persistence: Arc<dyn Persistence> = Arc::new(store.clone());
        let registry = Arc::new(SandboxRegistry::new());
        let cleanup = Arc::new(CleanupScheduler::new(
            config.cleanup.clone(),
            config.calls.clone(),
            Arc::clone(&registry),
            provisioner.clone(),
            Arc::clone(&persistence),
            events.clone(),
        ));
        let (cleanup_queue, requests) = CleanupScheduler::channel();
        let controller = Arc::new(DeploymentController::new(
            &config,
            Collaborators {
                registry: Arc::clone(&registry),
                provisioner: provisioner.clone(),
                classifier,
                persistence: Arc::clone(&persistence),
                cleanup: Arc::clone(&cleanup),
                cleanup_queue,
                events: events.clone(),
            },
        ));
        Self {
            controller,
            provisioner,
            store,
            persistence,
            registry,
            cleanup,
            events,
            config,
            requests,
            _queue: queue,
        }
    }

    pub async fn deploy(&self) -> Deployment {
        self.controller
            .deploy_project(project_files(10), DeployConfig::new("proj-1", "owner-1", "node"))
            .await
            .unwrap()
    }

    pub fn stored(&self, id: &str) -> Deployment {
        self.store.get_deployment(id).unwrap().unwrap()
    }

    /// Poll (real time) until the stored status matches.
    pub async fn wait_for_status(&self, id: &str, status: DeploymentStatus) {
        for _ in 0..200 {
            if self.stored(id).status == status {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("{id} never reached {status}, still {}", self.stored(id).status);
    }
}

pub fn project_files(n: usize) -> Vec<ProjectFile> {
    (0..n)
        .map(|i| ProjectFile::new(&format!("src/file{i}.js"), "module.exports = {};"))
        .collect()
}

//! Wiring of every control plane component into one running process.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use anyhow::Context;
use berth_autoscale::AutoscaleEngine;
use berth_cleanup::CleanupScheduler;
use berth_controller::{Collaborators, DeploymentController};
use berth_core::{BerthConfig, EventBus, TracingSink};
use berth_cost::CostOptimizer;
use berth_provision::{InMemoryProvisioner, ManifestClassifier, ResourceProfile, SandboxSpec};
use berth_registry::SandboxRegistry;
use berth_state::{DeploymentStatus, Persistence, StateStore};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{error, info};

pub struct Daemon {
    pub controller: Arc<DeploymentController>,
    shutdown_tx: watch::Sender<bool>,
    tasks: Vec<(&'static str, JoinHandle<()>)>,
}

impl Daemon {
    /// Open the state store under `data_dir`, restore persisted state and
    /// start every background loop.
    pub async fn start(config: BerthConfig, data_dir: &Path) -> anyhow::Result<Self> {
        info!("berth daemon starting");

        std::fs::create_dir_all(data_dir).with_context(|| format!("creating {}", data_dir.display()))?;
        let db_path = data_dir.join("berth.redb");
        let store = StateStore::open(&db_path)?;
        info!(path = ?db_path, "state store opened");
        let persistence: Arc<dyn Persistence> = Arc::new(store.clone());

        // ── Event bus ──────────────────────────────────────────────
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let (events, queue) = EventBus::new(config.events.capacity);
        let mut tasks = vec![(
            "events",
            tokio::spawn(queue.drain(Arc::new(TracingSink), config.calls.event, shutdown_rx.clone())),
        )];

        // ── Collaborators ─────────────────────────────────────────
        let provisioner = Arc::new(InMemoryProvisioner::new());
        let adopted = reattach(&store, &provisioner)?;
        info!(adopted, "simulated provisioner ready");
        let registry = Arc::new(SandboxRegistry::new());

        // ── Components ────────────────────────────────────────────
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
                classifier: Arc::new(ManifestClassifier::new()),
                persistence: Arc::clone(&persistence),
                cleanup: Arc::clone(&cleanup),
                cleanup_queue,
                events: events.clone(),
            },
        ));

        let autoscaler = Arc::new(AutoscaleEngine::new(
            config.autoscale.clone(),
            config.calls.clone(),
            controller.clone(),
            controller.clone(),
            Arc::clone(&persistence),
            events.clone(),
        ));

        let cost = Arc::new(CostOptimizer::new(
            config.cost.clone(),
            config.calls.clone(),
            Arc::clone(&registry),
            provisioner.clone(),
            Arc::clone(&persistence),
            events.clone(),
        ));

        // ── Restore ───────────────────────────────────────────────
        let restored = controller.restore().await?;
        let policies = autoscaler.load_policies().await?;
        let active: Vec<String> = store
            .list_deployments()?
            .into_iter()
            .filter(|d| d.status != DeploymentStatus::Destroyed)
            .map(|d| d.id)
            .collect();
        cost.restore(&active).await?;
        info!(
            sandboxes = restored.sandboxes,
            resumed = restored.resumed.len(),
            interrupted = restored.interrupted.len(),
            policies,
            "persisted state restored"
        );

        // ── Background loops ──────────────────────────────────────
        tasks.push(("controller", tokio::spawn(Arc::clone(&controller).run(shutdown_rx.clone()))));
        tasks.push((
            "cleanup",
            tokio::spawn(Arc::clone(&cleanup).run(requests, shutdown_rx.clone())),
        ));
        tasks.push(("autoscaler", tokio::spawn(Arc::clone(&autoscaler).run(shutdown_rx.clone()))));
        tasks.push(("cost", tokio::spawn(Arc::clone(&cost).run(shutdown_rx))));

        info!("berth daemon running");
        Ok(Self {
            controller,
            shutdown_tx,
            tasks,
        })
    }

    pub async fn wait_for_signal(&self) -> anyhow::Result<()> {
        tokio::signal::ctrl_c().await.context("installing ctrl-c handler")?;
        info!("shutdown signal received");
        Ok(())
    }

    /// Signal every loop to stop and wait for them.
    pub async fn shutdown(self) {
        let _ = self.shutdown_tx.send(true);
        for (name, handle) in self.tasks {
            if let Err(e) = handle.await {
                error!(task = name, error = %e, "background task panicked");
            }
        }
        info!("berth daemon stopped");
    }
}

/// The simulated backend starts empty on every boot. Persisted sandboxes
/// are adopted back so a restart resumes them rather than losing them.
fn reattach(store: &StateStore, provisioner: &InMemoryProvisioner) -> anyhow::Result<usize> {
    let deployments: HashMap<String, _> = store
        .list_deployments()?
        .into_iter()
        .map(|d| (d.id.clone(), d))
        .collect();

    let mut adopted = 0;
    for meta in store.list_sandboxes()? {
        let Some(deployment) = deployments.get(&meta.deployment_id) else {
            continue;
        };
        provisioner.adopt(
            &meta.id,
            SandboxSpec {
                deployment_id: deployment.id.clone(),
                project_id: deployment.project_id.clone(),
                owner_id: deployment.owner_id.clone(),
                runtime: deployment.runtime.clone(),
                profile: ResourceProfile::default(),
                env: HashMap::new(),
                files: Vec::new(),
            },
        );
        adopted += 1;
    }
    Ok(adopted)
}

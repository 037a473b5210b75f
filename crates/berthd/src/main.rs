//! berthd — the Berth daemon.
//!
//! Single binary that assembles the Berth subsystems:
//! - State store (redb)
//! - Sandbox registry and the simulated provisioner
//! - Deployment controller + per-deployment supervisors
//! - Cleanup scheduler
//! - Autoscaler
//! - Cost optimizer
//!
//! # Usage
//!
//! ```text
//! berthd run --config berth.toml --data-dir /var/lib/berth
//! berthd deploy --path ./my-app --keep-running
//! berthd check-config --config berth.toml
//! ```

mod daemon;
mod project;

use std::path::{Path, PathBuf};

use anyhow::Context;
use berth_controller::DeployConfig;
use berth_core::BerthConfig;
use clap::{Parser, Subcommand, ValueEnum};
use tracing::info;
use tracing_subscriber::EnvFilter;

use crate::daemon::Daemon;

const DEFAULT_FILTER: &str = "info,berth=debug";

#[derive(Parser)]
#[command(name = "berthd", about = "Berth deployment control plane")]
struct Cli {
    /// Log output format.
    #[arg(long, value_enum, default_value_t = LogFormat::Text, global = true)]
    log_format: LogFormat,

    #[command(subcommand)]
    command: Command,
}

#[derive(Clone, Copy, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

#[derive(Subcommand)]
enum Command {
    /// Run the control plane until interrupted.
    Run {
        /// Path to berth.toml. Built-in defaults are used when omitted.
        #[arg(long)]
        config: Option<PathBuf>,

        /// Data directory for persistent state.
        #[arg(long, default_value = "/var/lib/berth")]
        data_dir: PathBuf,
    },
    /// Deploy a local project directory and print the resulting status.
    Deploy {
        /// Project root to classify and ship.
        #[arg(long)]
        path: PathBuf,

        /// Project id. Defaults to the directory name.
        #[arg(long)]
        project_id: Option<String>,

        #[arg(long, default_value = "local")]
        owner: String,

        #[arg(long, default_value = "node")]
        runtime: String,

        #[arg(long)]
        config: Option<PathBuf>,

        #[arg(long, default_value = "/var/lib/berth")]
        data_dir: PathBuf,

        /// Keep the control plane running after the deployment settles.
        #[arg(long)]
        keep_running: bool,
    },
    /// Validate a configuration file and print the effective settings.
    CheckConfig {
        #[arg(long)]
        config: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.log_format);

    match cli.command {
        Command::Run { config, data_dir } => {
            let config = load_config(config.as_deref())?;
            let daemon = Daemon::start(config, &data_dir).await?;
            daemon.wait_for_signal().await?;
            daemon.shutdown().await;
            Ok(())
        }
        Command::Deploy {
            path,
            project_id,
            owner,
            runtime,
            config,
            data_dir,
            keep_running,
        } => {
            let config = load_config(config.as_deref())?;
            let files = project::load_dir(&path)?;
            let project_id = project_id.unwrap_or_else(|| project::default_project_id(&path));
            info!(%project_id, files = files.len(), "project loaded");

            let daemon = Daemon::start(config, &data_dir).await?;
            let deployment = daemon
                .controller
                .deploy_project(files, DeployConfig::new(&project_id, &owner, &runtime))
                .await?;
            let view = daemon.controller.monitor_deployment(&deployment.id).await?;
            println!("{}", serde_json::to_string_pretty(&view)?);

            if keep_running {
                daemon.wait_for_signal().await?;
            }
            daemon.shutdown().await;
            Ok(())
        }
        Command::CheckConfig { config } => {
            let config = load_config(config.as_deref())?;
            print!("{}", config.to_toml_string()?);
            Ok(())
        }
    }
}

fn init_tracing(format: LogFormat) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    match format {
        LogFormat::Text => builder.init(),
        LogFormat::Json => builder.json().init(),
    }
}

fn load_config(path: Option<&Path>) -> anyhow::Result<BerthConfig> {
    match path {
        Some(path) => BerthConfig::from_file(path).with_context(|| format!("loading {}", path.display())),
        None => Ok(BerthConfig::default()),
    }
}

//! fleetd — the optimizer fleet daemon.
//!
//! Assembles the fleet subsystems from one `fleet.toml`:
//! - Resource container (backend selected by name)
//! - Status reconciler
//! - Static-parallelism group scheduler
//!
//! # Usage
//!
//! ```text
//! fleetd run --config /etc/ams/fleet.toml
//! fleetd args --config /etc/ams/fleet.toml --group default --threads 4
//! fleetd env --config /etc/ams/fleet.toml
//! ```

mod scheduler;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tokio::sync::{mpsc, watch};
use tracing::{info, warn};

use fleet_container::{BoxFuture, ResourceContainer};
use fleet_core::{FleetConfig, Resource};
use fleet_reconcile::{Reconciler, ReconcilerConfig, ReplacementCallback};

use crate::scheduler::GroupScheduler;

#[derive(Parser)]
#[command(name = "fleetd", about = "Optimizer fleet daemon")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Launch every configured group and keep it staffed until Ctrl-C.
    Run {
        /// Path to fleet.toml.
        #[arg(long, short)]
        config: PathBuf,
    },
    /// Print the worker command line for one resource.
    Args {
        #[arg(long, short)]
        config: PathBuf,

        /// Optimizing group name.
        #[arg(long)]
        group: String,

        /// Worker threads (defaults to the group's configured thread_count).
        #[arg(long)]
        threads: Option<u32>,

        /// Resource id to pass with -id.
        #[arg(long)]
        id: Option<String>,

        /// Resource property as key=value; repeatable.
        #[arg(long = "property", value_name = "KEY=VALUE")]
        properties: Vec<String>,
    },
    /// Print the export statements for the container's exported variables.
    Env {
        #[arg(long, short)]
        config: PathBuf,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info,fleetd=debug,fleet=debug")),
        )
        .init();

    let cli = Cli::parse();

    match cli.command {
        Command::Run { config } => run(&config).await,
        Command::Args {
            config,
            group,
            threads,
            id,
            properties,
        } => print_args(&config, &group, threads, id, &properties),
        Command::Env { config } => print_env(&config),
    }
}

fn load(path: &Path) -> anyhow::Result<(FleetConfig, ResourceContainer)> {
    let config = FleetConfig::from_file(path)
        .with_context(|| format!("failed to load {}", path.display()))?;
    let container = ResourceContainer::from_kind(
        config.container.name.as_str(),
        &config.container.backend,
        config.container.properties.clone(),
    )?;
    Ok((config, container))
}

async fn run(path: &Path) -> anyhow::Result<()> {
    let (config, container) = load(path)?;
    info!(
        container = %container.name(),
        backend = container.backend_kind(),
        groups = config.groups.len(),
        "fleet daemon starting"
    );

    // ── Wire reconciler → scheduler ────────────────────────────

    let (replacement_tx, replacement_rx) = mpsc::unbounded_channel();
    let on_replacement: ReplacementCallback = Arc::new(move |request| {
        if replacement_tx.send(request).is_err() {
            warn!("scheduler gone, replacement request dropped");
        }
        Box::pin(async {}) as BoxFuture<'static, ()>
    });

    let reconciler = Arc::new(
        Reconciler::new(Arc::new(container), ReconcilerConfig::from(&config.reconciler))
            .with_callback(on_replacement),
    );
    let scheduler = Arc::new(GroupScheduler::new(reconciler.clone(), config.groups.clone()));

    scheduler.start().await;

    // ── Background loops ───────────────────────────────────────

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let reconcile_handle = {
        let reconciler = reconciler.clone();
        let shutdown = shutdown_rx.clone();
        tokio::spawn(async move { reconciler.run(shutdown).await })
    };
    let scheduler_handle = {
        let scheduler = scheduler.clone();
        tokio::spawn(async move { scheduler.serve(replacement_rx, shutdown_rx).await })
    };

    tokio::signal::ctrl_c()
        .await
        .context("failed to install Ctrl-C handler")?;
    info!("shutdown signal received");
    let _ = shutdown_tx.send(true);

    let _ = reconcile_handle.await;
    let _ = scheduler_handle.await;

    let failed = reconciler.release_all().await;
    if !failed.is_empty() {
        warn!(count = failed.len(), ids = ?failed, "some workers could not be released");
    }

    info!("fleet daemon stopped");
    Ok(())
}

fn print_args(
    path: &Path,
    group: &str,
    threads: Option<u32>,
    id: Option<String>,
    properties: &[String],
) -> anyhow::Result<()> {
    let (config, container) = load(path)?;

    let mut resource = match config.group(group) {
        Some(section) => section.resource(),
        None => Resource::new(group, 1),
    };
    if let Some(threads) = threads {
        resource.thread_count = threads;
    }
    if let Some(id) = id {
        resource.resource_id = id;
    }
    for raw in properties {
        let (key, value) = raw
            .split_once('=')
            .with_context(|| format!("property {raw:?} is not KEY=VALUE"))?;
        resource.properties.insert(key.trim().to_string(), value.to_string());
    }

    println!("{}", container.build_startup_arguments(&resource)?);
    Ok(())
}

fn print_env(path: &Path) -> anyhow::Result<()> {
    let (_, container) = load(path)?;
    for statement in container.export_environment() {
        println!("{statement}");
    }
    Ok(())
}

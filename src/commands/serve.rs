//! Implementation of the `serve` subcommand.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use anyhow::Result;
use clap::Parser;
use tracing::info;

use joblet_engine::JobManagerSvc;
use joblet_engine::PersistSink;
use joblet_engine::RuntimeIndex;
use joblet_engine::VolumeManager;
use joblet_workflow::WorkflowEngineSvc;

use crate::config::Config;
use crate::service::JobletService;

/// The arguments for the `serve` subcommand.
#[derive(Debug, Parser)]
pub struct Args {
    /// The path to the configuration file.
    #[arg(short, long)]
    pub config: Option<PathBuf>,
}

/// Runs the daemon until a shutdown signal arrives.
///
/// Components initialise leaves-first — volume manager (replaying tmpfs
/// mounts), runtime index, persistence sink, job manager, workflow
/// engine — and tear down in reverse, draining each one.
pub async fn run(args: Args) -> Result<()> {
    let config = Config::load(args.config.as_deref())?;
    let buffer = config.daemon.channel_buffer_size;

    let volumes = Arc::new(
        VolumeManager::new(&config.engine.volumes).context("failed to start the volume manager")?,
    );
    let runtimes = Arc::new(RuntimeIndex::load(&config.engine.runtimes));
    let persist = PersistSink::spawn(config.engine.persistence.clone());

    let (manager_task, manager, status_tx) = JobManagerSvc::spawn(
        buffer,
        config.engine.clone(),
        runtimes.clone(),
        volumes.clone(),
        persist.handle(),
    );

    let (workflow_task, workflows) =
        WorkflowEngineSvc::spawn(buffer, manager.clone(), status_tx.subscribe());

    // The RPC transport wraps the facade; it lives for the daemon's
    // lifetime.
    let _service = JobletService::new(
        config.engine.clone(),
        manager.clone(),
        workflows.clone(),
        volumes,
        runtimes,
    );

    info!("joblet daemon started");
    wait_for_shutdown().await;
    info!("joblet daemon shutting down");

    workflows.shutdown().await;
    let _ = workflow_task.await;
    manager.shutdown().await;
    let _ = manager_task.await;
    persist.shutdown().await;

    info!("joblet daemon stopped");
    Ok(())
}

/// Waits for `SIGINT` or `SIGTERM`.
async fn wait_for_shutdown() {
    let mut sigterm = match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
    {
        Ok(sigterm) => sigterm,
        Err(e) => {
            tracing::error!(error = %e, "failed to install the SIGTERM handler");
            let _ = tokio::signal::ctrl_c().await;
            return;
        }
    };

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {}
        _ = sigterm.recv() => {}
    }
}

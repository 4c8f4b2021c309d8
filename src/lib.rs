//! A daemon for executing jobs and workflows of jobs in isolated Linux
//! sandboxes.
//!
//! Clients submit arbitrary commands (or YAML-defined workflows of
//! dependent jobs) and the daemon executes each in an isolated sandbox —
//! PID, mount, network, IPC, and UTS namespaces plus chroot and cgroup
//! v2 — with enforced CPU, memory, I/O, and disk quotas, optional
//! persistent volumes, streaming file uploads, and pluggable language
//! runtimes.

#![warn(missing_docs)]
#![warn(rust_2018_idioms)]
#![warn(rust_2021_compatibility)]
#![warn(missing_debug_implementations)]
#![warn(clippy::missing_docs_in_private_items)]
#![warn(rustdoc::broken_intra_doc_links)]

use clap::Parser;
use clap::Subcommand;
use clap_verbosity_flag::InfoLevel;
use clap_verbosity_flag::Verbosity;
use tracing_subscriber::EnvFilter;

pub mod commands;
pub mod config;
pub mod service;

/// The Joblet daemon command line.
#[derive(Debug, Parser)]
#[command(author, version, about)]
struct Cli {
    /// The verbosity flags.
    #[command(flatten)]
    verbosity: Verbosity<InfoLevel>,

    /// The subcommand to run.
    #[command(subcommand)]
    command: Commands,
}

/// The supported subcommands.
#[derive(Debug, Subcommand)]
enum Commands {
    /// Runs the daemon.
    Serve(commands::serve::Args),
    /// Displays the resolved configuration.
    Config(commands::config::Args),
    /// Administers named volumes.
    Volume(commands::volume::Args),
    /// Lists the installed runtimes.
    Runtimes(commands::runtimes::Args),
    /// Validates workflow definitions.
    Workflow(commands::workflow::Args),
    /// The sandbox init re-exec entry; never invoked by operators.
    #[command(hide = true)]
    SandboxInit(commands::sandbox_init::Args),
}

/// The main function for the Joblet binary.
pub async fn joblet_main() {
    let cli = Cli::parse();

    // The init entry runs before any logging setup: its stdout and
    // stderr are the job's output streams, and it never returns.
    if let Commands::SandboxInit(args) = &cli.command {
        commands::sandbox_init::run(args);
    }

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| {
            let level = cli.verbosity.tracing_level_filter();
            EnvFilter::new(format!(
                "joblet={level},joblet_core={level},joblet_engine={level},joblet_workflow={level}"
            ))
        }))
        .with_writer(std::io::stderr)
        .init();

    let result = match cli.command {
        Commands::Serve(args) => commands::serve::run(args).await,
        Commands::Config(args) => commands::config::run(args),
        Commands::Volume(args) => commands::volume::run(args),
        Commands::Runtimes(args) => commands::runtimes::run(args),
        Commands::Workflow(args) => commands::workflow::run(args),
        Commands::SandboxInit(_) => unreachable!("handled above"),
    };

    if let Err(e) = result {
        tracing::error!("{e:#}");
        std::process::exit(1);
    }
}

#[cfg(test)]
mod test {
    use clap::CommandFactory;

    use super::*;

    #[test]
    fn cli_is_well_formed() {
        Cli::command().debug_assert();
    }
}

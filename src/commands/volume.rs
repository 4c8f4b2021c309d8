//! Implementation of the `volume` subcommand.
//!
//! Volume administration works directly against the volumes directory,
//! so it is usable while the daemon is stopped. A running daemon replays
//! the directory on startup; removing a volume out from under live jobs
//! is refused by the daemon, not by this offline path, so `remove` here
//! should only be used with the daemon stopped.

use std::path::PathBuf;
use std::str::FromStr;

use anyhow::Context;
use anyhow::Result;
use anyhow::bail;
use clap::Parser;
use clap::Subcommand;

use joblet_core::display_size;
use joblet_core::parse_size;
use joblet_engine::VolumeKind;
use joblet_engine::VolumeManager;

use crate::config::Config;

/// The arguments for the `volume` subcommand.
#[derive(Debug, Parser)]
pub struct Args {
    /// The path to the configuration file.
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    /// The volume operation to perform.
    #[command(subcommand)]
    pub command: VolumeCommand,
}

/// The volume operations.
#[derive(Debug, Subcommand)]
pub enum VolumeCommand {
    /// Creates a named volume.
    Create {
        /// The volume name.
        name: String,
        /// The volume size (e.g. `100MiB`, `2G`).
        #[arg(long, default_value = "1GiB")]
        size: String,
        /// The volume kind: `filesystem` or `memory`.
        #[arg(long, default_value = "filesystem")]
        kind: String,
    },
    /// Lists the volumes with usage metrics.
    List,
    /// Removes a volume.
    Remove {
        /// The volume name.
        name: String,
    },
}

/// Runs the `volume` subcommand.
pub fn run(args: Args) -> Result<()> {
    let config = Config::load(args.config.as_deref())?;
    let volumes = VolumeManager::new(&config.engine.volumes)
        .context("failed to open the volumes directory")?;

    match args.command {
        VolumeCommand::Create { name, size, kind } => {
            let size = match parse_size(&size) {
                Some(size) => size,
                None => bail!("`{size}` is not a valid size"),
            };
            let kind = VolumeKind::from_str(&kind)
                .map_err(|_| anyhow::anyhow!("`{kind}` is not a volume kind"))?;

            let info = volumes.create(&name, size, kind)?;
            println!(
                "created volume `{name}` ({kind}, {size})",
                name = info.name,
                kind = info.kind,
                size = display_size(info.size_bytes),
            );
        }
        VolumeCommand::List => {
            for info in volumes.list() {
                println!(
                    "{name}\t{kind}\t{size}\t{used} used",
                    name = info.name,
                    kind = info.kind,
                    size = display_size(info.size_bytes),
                    used = display_size(info.used_bytes),
                );
            }
        }
        VolumeCommand::Remove { name } => {
            volumes.remove(&name)?;
            println!("removed volume `{name}`");
        }
    }

    Ok(())
}

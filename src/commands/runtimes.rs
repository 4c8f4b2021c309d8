//! Implementation of the `runtimes` subcommand.

use std::path::PathBuf;

use anyhow::Result;
use clap::Parser;

use joblet_engine::RuntimeIndex;

use crate::config::Config;

/// The arguments for the `runtimes` subcommand.
#[derive(Debug, Parser)]
pub struct Args {
    /// The path to the configuration file.
    #[arg(short, long)]
    pub config: Option<PathBuf>,
}

/// Lists the installed runtimes.
pub fn run(args: Args) -> Result<()> {
    let config = Config::load(args.config.as_deref())?;
    let index = RuntimeIndex::load(&config.engine.runtimes);

    for runtime in index.list() {
        let manifest = runtime.manifest();
        println!(
            "{name}@{version}\t{language}\t{description}",
            name = manifest.name,
            version = manifest.version,
            language = manifest.language.as_deref().unwrap_or("-"),
            description = manifest.description.as_deref().unwrap_or(""),
        );
    }

    Ok(())
}

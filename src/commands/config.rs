//! Implementation of the `config` subcommand.

use std::path::PathBuf;

use anyhow::Context;
use anyhow::Result;
use clap::Parser;

use crate::config::Config;

/// The arguments for the `config` subcommand.
#[derive(Debug, Parser)]
pub struct Args {
    /// The path to the configuration file.
    #[arg(short, long)]
    pub config: Option<PathBuf>,
}

/// Displays the resolved configuration as TOML.
pub fn run(args: Args) -> Result<()> {
    let config = Config::load(args.config.as_deref())?;
    let rendered =
        toml::to_string_pretty(&config).context("failed to render the configuration")?;
    println!("{rendered}");
    Ok(())
}

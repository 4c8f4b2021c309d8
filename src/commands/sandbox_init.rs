//! Implementation of the hidden `sandbox-init` subcommand.
//!
//! This is the init re-exec entry: the daemon clones a child into new
//! namespaces and the child execs `/proc/self/exe sandbox-init <spec>`,
//! landing here as PID 1 of its PID namespace. Everything interesting
//! happens in [`joblet_engine::init`].

use std::path::PathBuf;

use clap::Parser;

/// The arguments for the `sandbox-init` subcommand.
#[derive(Debug, Parser)]
pub struct Args {
    /// The path of the spawn specification written by the parent.
    pub spec: PathBuf,
}

/// Runs the sandbox init sequence; never returns.
pub fn run(args: &Args) -> ! {
    joblet_engine::init::run(&args.spec)
}

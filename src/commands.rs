//! Implementation of the command line interface subcommands.

pub mod config;
pub mod runtimes;
pub mod sandbox_init;
pub mod serve;
pub mod volume;
pub mod workflow;

//! Implementation of the `workflow` subcommand.

use std::path::PathBuf;

use anyhow::Context;
use anyhow::Result;
use clap::Parser;
use clap::Subcommand;

use joblet_workflow::Workflow;
use joblet_workflow::WorkflowFile;

/// The arguments for the `workflow` subcommand.
#[derive(Debug, Parser)]
pub struct Args {
    /// The workflow operation to perform.
    #[command(subcommand)]
    pub command: WorkflowCommand,
}

/// The workflow operations.
#[derive(Debug, Subcommand)]
pub enum WorkflowCommand {
    /// Validates a workflow definition without running it.
    Check {
        /// The workflow YAML file.
        file: PathBuf,
    },
}

/// Runs the `workflow` subcommand.
pub fn run(args: Args) -> Result<()> {
    match args.command {
        WorkflowCommand::Check { file } => {
            let bytes = std::fs::read(&file).with_context(|| {
                format!("failed to read workflow file `{path}`", path = file.display())
            })?;

            let parsed = WorkflowFile::parse(&bytes)?;
            let workflow = Workflow::from_file(&parsed)?;

            println!(
                "workflow is valid: {count} job(s)",
                count = workflow.jobs().count()
            );
            for job in workflow.jobs() {
                match &job.requirement {
                    Some(requirement) => {
                        println!("  {name}: requires {requirement}", name = job.name)
                    }
                    None => println!("  {name}: ready immediately", name = job.name),
                }
            }

            Ok(())
        }
    }
}

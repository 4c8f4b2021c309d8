//! The workflow engine service.
//!
//! The engine is an actor that owns every workflow record. It consumes
//! job status change events from the job manager, recomputes readiness
//! and impossibility for the affected workflow, submits jobs whose
//! requirements are satisfied, and cancels jobs whose requirements can
//! never be satisfied. Workflows reference jobs by identifier only; the
//! job manager holds no back-pointer to the engine.

use std::collections::HashMap;

use chrono::DateTime;
use chrono::Utc;
use thiserror::Error;
use tokio::sync::broadcast;
use tokio::sync::mpsc;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::debug;
use tracing::info;
use tracing::trace;
use tracing::warn;
use uuid::Uuid;

use joblet_core::JobId;
use joblet_core::JobStatus;
use joblet_engine::JobManagerHandle;
use joblet_engine::JobStatusEvent;

use crate::model::Workflow;
use crate::model::WorkflowCounters;
use crate::model::WorkflowError;
use crate::model::WorkflowFile;
use crate::model::WorkflowStatus;

/// A command issued to the workflow engine service.
#[derive(Debug)]
pub enum WorkflowEngineCmd {
    /// Runs a workflow definition.
    Run {
        /// The parsed workflow file.
        file: WorkflowFile,
        /// The channel to send the response on.
        rx: oneshot::Sender<Result<Uuid, RunWorkflowError>>,
    },
    /// Gets a workflow snapshot.
    Get {
        /// The workflow to query.
        id: Uuid,
        /// The channel to send the response on.
        rx: oneshot::Sender<Result<WorkflowSnapshot, GetWorkflowError>>,
    },
    /// Lists all workflows.
    List {
        /// The channel to send the response on.
        rx: oneshot::Sender<Vec<WorkflowSnapshot>>,
    },
    /// Shuts the service down.
    Shutdown {
        /// The channel acknowledging the shutdown.
        rx: oneshot::Sender<()>,
    },
}

/// Error type for running a workflow.
#[derive(Debug, Error)]
pub enum RunWorkflowError {
    /// The definition was invalid.
    #[error(transparent)]
    Invalid(#[from] WorkflowError),
    /// The service is shutting down.
    #[error("the workflow engine is shutting down")]
    ShuttingDown,
}

/// Error type for getting a workflow.
#[derive(Debug, Error)]
pub enum GetWorkflowError {
    /// The workflow does not exist.
    #[error("workflow `{0}` was not found")]
    NotFound(Uuid),
}

/// A point-in-time view of one workflow job.
#[derive(Debug, Clone)]
pub struct WorkflowJobSnapshot {
    /// The in-workflow name.
    pub name: String,
    /// The identifier assigned at submission, if submitted.
    pub job_id: Option<JobId>,
    /// The last observed status.
    pub status: JobStatus,
}

/// A point-in-time view of one workflow.
#[derive(Debug, Clone)]
pub struct WorkflowSnapshot {
    /// The workflow identifier.
    pub id: Uuid,
    /// The workflow status.
    pub status: WorkflowStatus,
    /// The progress counters.
    pub counters: WorkflowCounters,
    /// The jobs in definition order.
    pub jobs: Vec<WorkflowJobSnapshot>,
    /// When the workflow was accepted.
    pub created_at: DateTime<Utc>,
    /// When the workflow reached a terminal status.
    pub ended_at: Option<DateTime<Utc>>,
}

impl WorkflowSnapshot {
    /// Builds a snapshot of a workflow.
    fn of(workflow: &Workflow) -> Self {
        Self {
            id: workflow.id,
            status: workflow.status(),
            counters: workflow.counters(),
            jobs: workflow
                .jobs()
                .map(|job| WorkflowJobSnapshot {
                    name: job.name.clone(),
                    job_id: job.submitted,
                    status: job.status,
                })
                .collect(),
            created_at: workflow.created_at,
            ended_at: workflow.ended_at,
        }
    }
}

/// The workflow engine service.
#[allow(missing_debug_implementations)]
pub struct WorkflowEngineSvc {
    /// The handle used to submit released jobs.
    manager: JobManagerHandle,
    /// The job status change events.
    status_rx: broadcast::Receiver<JobStatusEvent>,
    /// The workflow records.
    workflows: HashMap<Uuid, Workflow>,
    /// The receiver for commands.
    rx: mpsc::Receiver<WorkflowEngineCmd>,
}

impl WorkflowEngineSvc {
    /// Spawns a new workflow engine service.
    ///
    /// Returns the join handle of the event loop and a typed command
    /// handle.
    pub fn spawn(
        channel_buffer_size: usize,
        manager: JobManagerHandle,
        status_rx: broadcast::Receiver<JobStatusEvent>,
    ) -> (JoinHandle<()>, WorkflowEngineHandle) {
        let (tx, rx) = mpsc::channel(channel_buffer_size);
        let svc = Self {
            manager,
            status_rx,
            workflows: HashMap::new(),
            rx,
        };
        let handle = tokio::spawn(svc.run());
        (handle, WorkflowEngineHandle { tx })
    }

    /// Runs the event loop.
    async fn run(mut self) {
        info!("workflow engine service started");

        loop {
            tokio::select! {
                cmd = self.rx.recv() => {
                    match cmd {
                        Some(WorkflowEngineCmd::Run { file, rx }) => {
                            trace!("received `Run` command");
                            let result = self.run_workflow(file).await;
                            let _ = rx.send(result);
                        }
                        Some(WorkflowEngineCmd::Get { id, rx }) => {
                            trace!(?id, "received `Get` command");
                            let result = self
                                .workflows
                                .get(&id)
                                .map(WorkflowSnapshot::of)
                                .ok_or(GetWorkflowError::NotFound(id));
                            let _ = rx.send(result);
                        }
                        Some(WorkflowEngineCmd::List { rx }) => {
                            trace!("received `List` command");
                            let mut listed: Vec<_> =
                                self.workflows.values().map(WorkflowSnapshot::of).collect();
                            listed.sort_by_key(|snapshot| snapshot.created_at);
                            let _ = rx.send(listed);
                        }
                        Some(WorkflowEngineCmd::Shutdown { rx }) => {
                            trace!("received `Shutdown` command");
                            info!("workflow engine service is shutting down");
                            let _ = rx.send(());
                            break;
                        }
                        None => break,
                    }
                }
                event = self.status_rx.recv() => {
                    match event {
                        Ok(event) => self.on_status_event(event).await,
                        Err(broadcast::error::RecvError::Lagged(missed)) => {
                            // Lagging loses intermediate statuses; the
                            // terminal ones will still arrive.
                            warn!(missed, "workflow engine lagged behind job status events");
                        }
                        Err(broadcast::error::RecvError::Closed) => break,
                    }
                }
            }
        }

        info!("workflow engine service stopped");
    }

    /// Validates and starts a new workflow.
    async fn run_workflow(&mut self, file: WorkflowFile) -> Result<Uuid, RunWorkflowError> {
        let workflow = Workflow::from_file(&file)?;
        let id = workflow.id;
        self.workflows.insert(id, workflow);
        info!(workflow = %id, "workflow accepted");

        // Jobs without requirements are ready immediately.
        self.drive(id).await;
        Ok(id)
    }

    /// Applies one job status change to its workflow.
    async fn on_status_event(&mut self, event: JobStatusEvent) {
        let Some(workflow_id) = event.workflow_id else {
            return;
        };

        let Some(workflow) = self.workflows.get_mut(&workflow_id) else {
            return;
        };

        let key = event.id.to_string();
        if !workflow.record_status(&key, event.status) {
            debug!(workflow = %workflow_id, job = %event.id, "status event for an untracked job");
            return;
        }

        trace!(
            workflow = %workflow_id,
            job = %event.id,
            status = %event.status,
            "workflow observed a job status change"
        );
        self.drive(workflow_id).await;
    }

    /// Recomputes a workflow and submits newly ready jobs until a fixed
    /// point is reached.
    ///
    /// Submission failures mark the job failed within the workflow,
    /// which may cascade further impossibilities; hence the loop.
    async fn drive(&mut self, id: Uuid) {
        loop {
            let Some(workflow) = self.workflows.get_mut(&id) else {
                return;
            };

            let recomputation = workflow.recompute();
            for name in &recomputation.canceled {
                let requirement = workflow
                    .job(name)
                    .and_then(|job| job.requirement.as_ref())
                    .map(ToString::to_string)
                    .unwrap_or_default();
                info!(
                    workflow = %id,
                    "{error}",
                    error = joblet_core::Error::WorkflowImpossible {
                        job: name.clone(),
                        requirement,
                    }
                );
            }

            if recomputation.ready.is_empty() {
                break;
            }

            for name in recomputation.ready {
                // SAFETY: recompute only returns names of tracked jobs.
                let job = self.workflows.get(&id).unwrap().job(&name).unwrap();
                let spec = job.spec.clone();

                match self.manager.submit(spec, Some(name.clone())).await {
                    Ok(submitted) => {
                        debug!(workflow = %id, job = %name, id = %submitted.id, "workflow job submitted");
                        let workflow = self.workflows.get_mut(&id).unwrap();
                        workflow.record_submitted(&name, submitted.id);
                        workflow.record_status(&submitted.id.to_string(), submitted.status);
                    }
                    Err(e) => {
                        warn!(
                            workflow = %id,
                            job = %name,
                            error = %e,
                            "workflow job submission failed"
                        );
                        let workflow = self.workflows.get_mut(&id).unwrap();
                        workflow.record_status(&name, JobStatus::Failed);
                    }
                }
            }
        }

        let workflow = self.workflows.get(&id).expect("workflow still tracked");
        if workflow.status().is_terminal() {
            info!(
                workflow = %id,
                status = %workflow.status(),
                "workflow reached a terminal status"
            );
        }
    }
}

/// A typed handle to a running workflow engine service.
#[derive(Debug, Clone)]
pub struct WorkflowEngineHandle {
    /// The sender half of the service's command channel.
    tx: mpsc::Sender<WorkflowEngineCmd>,
}

impl WorkflowEngineHandle {
    /// Runs a workflow definition, returning its identifier.
    pub async fn run(&self, file: WorkflowFile) -> Result<Uuid, RunWorkflowError> {
        let (rx, response) = oneshot::channel();
        self.tx
            .send(WorkflowEngineCmd::Run { file, rx })
            .await
            .map_err(|_| RunWorkflowError::ShuttingDown)?;
        response.await.map_err(|_| RunWorkflowError::ShuttingDown)?
    }

    /// Gets a workflow snapshot.
    pub async fn get(&self, id: Uuid) -> Result<WorkflowSnapshot, GetWorkflowError> {
        let (rx, response) = oneshot::channel();
        self.tx
            .send(WorkflowEngineCmd::Get { id, rx })
            .await
            .map_err(|_| GetWorkflowError::NotFound(id))?;
        response.await.map_err(|_| GetWorkflowError::NotFound(id))?
    }

    /// Lists all workflows.
    pub async fn list(&self) -> Vec<WorkflowSnapshot> {
        let (rx, response) = oneshot::channel();
        if self.tx.send(WorkflowEngineCmd::List { rx }).await.is_err() {
            return Vec::new();
        }
        response.await.unwrap_or_default()
    }

    /// Shuts the service down and waits for acknowledgement.
    pub async fn shutdown(&self) {
        let (rx, response) = oneshot::channel();
        if self.tx.send(WorkflowEngineCmd::Shutdown { rx }).await.is_ok() {
            let _ = response.await;
        }
    }
}

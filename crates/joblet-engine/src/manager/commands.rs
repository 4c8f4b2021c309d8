//! Commands and responses for the job manager service.

use thiserror::Error;
use tokio::sync::mpsc;
use tokio::sync::oneshot;
use uuid::Uuid;

use joblet_core::Job;
use joblet_core::JobId;
use joblet_core::JobSpec;
use joblet_core::JobStatus;

use crate::events::Subscription;

/// A command issued to the job manager service.
#[derive(Debug)]
pub enum JobManagerCmd {
    /// Submits a new job for execution.
    Submit {
        /// The job specification.
        spec: JobSpec,
        /// The in-workflow name of the job, if any.
        name: Option<String>,
        /// The channel to send the response on.
        rx: oneshot::Sender<Result<Job, SubmitJobError>>,
    },
    /// Stops a running job.
    Stop {
        /// The job to stop.
        id: JobId,
        /// The signal to deliver; `SIGTERM` when absent, escalating to
        /// `SIGKILL` after the configured grace period.
        signal: Option<i32>,
        /// The channel to send the response on.
        rx: oneshot::Sender<Result<JobStatus, StopJobError>>,
    },
    /// Cancels a job that has not started running.
    Cancel {
        /// The job to cancel.
        id: JobId,
        /// The channel to send the response on.
        rx: oneshot::Sender<Result<(), CancelJobError>>,
    },
    /// Gets a job's current snapshot.
    GetStatus {
        /// The job to query.
        id: JobId,
        /// The channel to send the response on.
        rx: oneshot::Sender<Result<Job, GetJobError>>,
    },
    /// Lists jobs matching a filter.
    List {
        /// The filter to apply.
        filter: JobFilter,
        /// The channel to send the response on.
        rx: oneshot::Sender<Vec<Job>>,
    },
    /// Subscribes to a job's log stream.
    Logs {
        /// The job to subscribe to.
        id: JobId,
        /// Whether to follow live output after the history snapshot.
        follow: bool,
        /// The channel to send the response on.
        rx: oneshot::Sender<Result<Subscription, GetJobError>>,
    },
    /// Records that one of a job's uploads has been fully streamed.
    UploadFinished {
        /// The job the upload belongs to.
        id: JobId,
        /// The channel to send the response on.
        rx: oneshot::Sender<Result<(), GetJobError>>,
    },
    /// Deletes a terminal job's record.
    Delete {
        /// The job to delete.
        id: JobId,
        /// The channel to send the response on.
        rx: oneshot::Sender<Result<(), DeleteJobError>>,
    },
    /// Shuts the service down.
    Shutdown {
        /// The channel acknowledging the shutdown.
        rx: oneshot::Sender<()>,
    },
}

/// A filter for listing jobs.
#[derive(Debug, Default, Clone)]
pub struct JobFilter {
    /// Only jobs with this status.
    pub status: Option<JobStatus>,
    /// Only jobs belonging to this workflow.
    pub workflow_id: Option<Uuid>,
}

/// Error type for submitting a job.
#[derive(Debug, Error)]
pub enum SubmitJobError {
    /// The specification was invalid; no state was changed.
    #[error("validation error: {0}")]
    Validation(String),
    /// Preparing the job's resources (directories, cgroup, pipes) failed.
    #[error("failed to prepare job resources: {0:#}")]
    Resource(#[source] anyhow::Error),
    /// The service is shutting down.
    #[error("the job manager is shutting down")]
    ShuttingDown,
}

/// Error type for stopping a job.
#[derive(Debug, Error)]
pub enum StopJobError {
    /// The job does not exist.
    #[error("job `{0}` was not found")]
    NotFound(JobId),
    /// The job is not running.
    #[error("only running jobs can be stopped; job `{id}` has status `{status}`")]
    InvalidStatus {
        /// The job ID.
        id: JobId,
        /// The current status.
        status: JobStatus,
    },
    /// Delivering the signal failed.
    #[error("failed to signal job `{id}`: {source:#}")]
    Signal {
        /// The job ID.
        id: JobId,
        /// The underlying error.
        #[source]
        source: anyhow::Error,
    },
}

/// Error type for canceling a job.
#[derive(Debug, Error)]
pub enum CancelJobError {
    /// The job does not exist.
    #[error("job `{0}` was not found")]
    NotFound(JobId),
    /// The job already started running.
    #[error(
        "only pending or scheduled jobs can be canceled; job `{id}` has status `{status}`"
    )]
    InvalidStatus {
        /// The job ID.
        id: JobId,
        /// The current status.
        status: JobStatus,
    },
}

/// Error type for getting a job.
#[derive(Debug, Error)]
pub enum GetJobError {
    /// The job does not exist.
    #[error("job `{0}` was not found")]
    NotFound(JobId),
}

/// Error type for deleting a job.
#[derive(Debug, Error)]
pub enum DeleteJobError {
    /// The job does not exist.
    #[error("job `{0}` was not found")]
    NotFound(JobId),
    /// The job has not reached a terminal status.
    #[error("job `{id}` is still `{status}`; stop or cancel it before deleting")]
    NotTerminal {
        /// The job ID.
        id: JobId,
        /// The current status.
        status: JobStatus,
    },
}

/// A typed handle to a running job manager service.
///
/// Cloneable; each method sends a command and awaits the reply.
#[derive(Debug, Clone)]
pub struct JobManagerHandle {
    /// The sender half of the service's command channel.
    tx: mpsc::Sender<JobManagerCmd>,
}

impl JobManagerHandle {
    /// Creates a handle over a command sender.
    pub(crate) fn new(tx: mpsc::Sender<JobManagerCmd>) -> Self {
        Self { tx }
    }

    /// Submits a job, returning its initial snapshot.
    pub async fn submit(
        &self,
        spec: JobSpec,
        name: Option<String>,
    ) -> Result<Job, SubmitJobError> {
        let (rx, response) = oneshot::channel();
        self.tx
            .send(JobManagerCmd::Submit { spec, name, rx })
            .await
            .map_err(|_| SubmitJobError::ShuttingDown)?;
        response.await.map_err(|_| SubmitJobError::ShuttingDown)?
    }

    /// Stops a running job.
    pub async fn stop(&self, id: JobId, signal: Option<i32>) -> Result<JobStatus, StopJobError> {
        let (rx, response) = oneshot::channel();
        self.tx
            .send(JobManagerCmd::Stop { id, signal, rx })
            .await
            .map_err(|_| StopJobError::NotFound(id))?;
        response.await.map_err(|_| StopJobError::NotFound(id))?
    }

    /// Cancels a job that has not started running.
    pub async fn cancel(&self, id: JobId) -> Result<(), CancelJobError> {
        let (rx, response) = oneshot::channel();
        self.tx
            .send(JobManagerCmd::Cancel { id, rx })
            .await
            .map_err(|_| CancelJobError::NotFound(id))?;
        response.await.map_err(|_| CancelJobError::NotFound(id))?
    }

    /// Gets a job's current snapshot.
    pub async fn status(&self, id: JobId) -> Result<Job, GetJobError> {
        let (rx, response) = oneshot::channel();
        self.tx
            .send(JobManagerCmd::GetStatus { id, rx })
            .await
            .map_err(|_| GetJobError::NotFound(id))?;
        response.await.map_err(|_| GetJobError::NotFound(id))?
    }

    /// Lists jobs matching the filter.
    pub async fn list(&self, filter: JobFilter) -> Vec<Job> {
        let (rx, response) = oneshot::channel();
        if self.tx.send(JobManagerCmd::List { filter, rx }).await.is_err() {
            return Vec::new();
        }
        response.await.unwrap_or_default()
    }

    /// Subscribes to a job's logs.
    pub async fn logs(&self, id: JobId, follow: bool) -> Result<Subscription, GetJobError> {
        let (rx, response) = oneshot::channel();
        self.tx
            .send(JobManagerCmd::Logs { id, follow, rx })
            .await
            .map_err(|_| GetJobError::NotFound(id))?;
        response.await.map_err(|_| GetJobError::NotFound(id))?
    }

    /// Records the completion of one upload stream for a job.
    pub async fn upload_finished(&self, id: JobId) -> Result<(), GetJobError> {
        let (rx, response) = oneshot::channel();
        self.tx
            .send(JobManagerCmd::UploadFinished { id, rx })
            .await
            .map_err(|_| GetJobError::NotFound(id))?;
        response.await.map_err(|_| GetJobError::NotFound(id))?
    }

    /// Deletes a terminal job's record.
    pub async fn delete(&self, id: JobId) -> Result<(), DeleteJobError> {
        let (rx, response) = oneshot::channel();
        self.tx
            .send(JobManagerCmd::Delete { id, rx })
            .await
            .map_err(|_| DeleteJobError::NotFound(id))?;
        response.await.map_err(|_| DeleteJobError::NotFound(id))?
    }

    /// Shuts the service down and waits for acknowledgement.
    pub async fn shutdown(&self) {
        let (rx, response) = oneshot::channel();
        if self.tx.send(JobManagerCmd::Shutdown { rx }).await.is_ok() {
            let _ = response.await;
        }
    }
}

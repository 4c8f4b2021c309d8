//! The service facade the RPC transport wraps.
//!
//! The wire transport (an RPC server with mutual TLS) is an external
//! collaborator; this type is the interface it calls. Every method
//! mirrors one RPC of the daemon's surface and delegates to the owning
//! component: the job manager, the workflow engine, the volume manager,
//! or the runtime index.

use std::sync::Arc;

use anyhow::Result;
use futures::Stream;
use futures::StreamExt;
use uuid::Uuid;

use joblet_core::Job;
use joblet_core::JobId;
use joblet_core::JobStatus;
use joblet_engine::DeleteJobError;
use joblet_engine::GetJobError;
use joblet_engine::JobFilter;
use joblet_engine::JobManagerHandle;
use joblet_engine::RuntimeIndex;
use joblet_engine::RuntimeManifest;
use joblet_engine::StopJobError;
use joblet_engine::SubmitJobError;
use joblet_engine::Subscription;
use joblet_engine::UploadSink;
use joblet_engine::VolumeInfo;
use joblet_engine::VolumeKind;
use joblet_engine::VolumeManager;
use joblet_engine::config::Config;
use joblet_workflow::GetWorkflowError;
use joblet_workflow::RunWorkflowError;
use joblet_workflow::WorkflowEngineHandle;
use joblet_workflow::WorkflowFile;
use joblet_workflow::WorkflowSnapshot;

use joblet_core::JobSpec;

/// The service facade for the daemon's RPC surface.
#[derive(Debug, Clone)]
pub struct JobletService {
    /// The engine configuration (pipe path derivation).
    config: Config,
    /// The job manager handle.
    manager: JobManagerHandle,
    /// The workflow engine handle.
    workflows: WorkflowEngineHandle,
    /// The volume manager.
    volumes: Arc<VolumeManager>,
    /// The runtime index.
    runtimes: Arc<RuntimeIndex>,
}

impl JobletService {
    /// Creates the service facade over the daemon's components.
    pub fn new(
        config: Config,
        manager: JobManagerHandle,
        workflows: WorkflowEngineHandle,
        volumes: Arc<VolumeManager>,
        runtimes: Arc<RuntimeIndex>,
    ) -> Self {
        Self {
            config,
            manager,
            workflows,
            volumes,
            runtimes,
        }
    }

    /// Submits a job for execution, returning its initial snapshot.
    pub async fn run_job(&self, spec: JobSpec) -> Result<Job, SubmitJobError> {
        self.manager.submit(spec, None).await
    }

    /// Stops a running job.
    pub async fn stop_job(
        &self,
        id: JobId,
        signal: Option<i32>,
    ) -> Result<JobStatus, StopJobError> {
        self.manager.stop(id, signal).await
    }

    /// Gets a job's current snapshot.
    pub async fn get_job_status(&self, id: JobId) -> Result<Job, GetJobError> {
        self.manager.status(id).await
    }

    /// Lists jobs matching the filter.
    pub async fn list_jobs(&self, filter: JobFilter) -> Vec<Job> {
        self.manager.list(filter).await
    }

    /// Subscribes to a job's log stream: the retained history followed,
    /// when following, by live records until termination.
    pub async fn stream_logs(&self, id: JobId, follow: bool) -> Result<Subscription, GetJobError> {
        self.manager.logs(id, follow).await
    }

    /// Deletes a terminal job's record.
    pub async fn delete_job(&self, id: JobId) -> Result<(), DeleteJobError> {
        self.manager.delete(id).await
    }

    /// Streams one client upload into its pre-created FIFO.
    ///
    /// The chunks arrive from the wire; back-pressure propagates from
    /// the sandbox materialiser through the FIFO to this writer and on
    /// to the client.
    pub async fn upload_file(
        &self,
        id: JobId,
        index: usize,
        mut chunks: impl Stream<Item = Vec<u8>> + Unpin,
    ) -> Result<()> {
        let pipe = self.config.job_pipes(id).join(index.to_string());
        let mut sink = UploadSink::open(pipe).await?;

        while let Some(chunk) = chunks.next().await {
            sink.write_chunk(&chunk).await?;
        }

        sink.finish().await?;
        let _ = self.manager.upload_finished(id).await;
        Ok(())
    }

    /// Parses and runs a YAML workflow definition, returning the
    /// workflow identifier.
    pub async fn run_workflow(&self, yaml: &[u8]) -> Result<Uuid, RunWorkflowError> {
        let file = WorkflowFile::parse(yaml)?;
        self.workflows.run(file).await
    }

    /// Gets a workflow snapshot.
    pub async fn get_workflow(&self, id: Uuid) -> Result<WorkflowSnapshot, GetWorkflowError> {
        self.workflows.get(id).await
    }

    /// Lists all workflows.
    pub async fn list_workflows(&self) -> Vec<WorkflowSnapshot> {
        self.workflows.list().await
    }

    /// Creates a named volume.
    pub fn create_volume(&self, name: &str, size: u64, kind: VolumeKind) -> Result<VolumeInfo> {
        self.volumes.create(name, size, kind)
    }

    /// Lists the volumes with usage metrics.
    pub fn list_volumes(&self) -> Vec<VolumeInfo> {
        self.volumes.list()
    }

    /// Removes a volume; fails while any live job holds it.
    pub fn remove_volume(&self, name: &str) -> Result<()> {
        self.volumes.remove(name)
    }

    /// Lists the installed runtime manifests.
    pub fn list_runtimes(&self) -> Vec<RuntimeManifest> {
        self.runtimes
            .list()
            .iter()
            .map(|runtime| runtime.manifest().clone())
            .collect()
    }

    /// Gets one runtime's manifest by specification string.
    pub fn get_runtime(&self, spec: &str) -> Result<RuntimeManifest> {
        Ok(self.runtimes.resolve(spec)?.manifest().clone())
    }
}

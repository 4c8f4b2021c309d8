//! The job manager service.
//!
//! The job manager is an actor that owns the full job lifecycle: spec
//! validation, resource preparation (directories, cgroup, upload FIFOs,
//! volume references), the two-phase sandbox spawn, output pumping into
//! the fan-out, stop/cancel handling, terminal classification, and
//! cleanup. Status transitions are atomic under the job table lock and
//! are broadcast to listeners (the workflow engine consumes them).

use std::collections::BTreeSet;
use std::collections::HashMap;
use std::fs;
use std::sync::Arc;

use anyhow::Context as _;
use anyhow::anyhow;
use chrono::Utc;
use nix::sys::signal::Signal;
use tokio::io::AsyncBufReadExt;
use tokio::io::BufReader;
use tokio::sync::Mutex;
use tokio::sync::broadcast;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use tracing::error;
use tracing::info;
use tracing::trace;
use tracing::warn;
use uuid::Uuid;

use joblet_core::EXEC_EXIT_CODE;
use joblet_core::FailureReason;
use joblet_core::INTEGRITY_EXIT_CODE;
use joblet_core::Job;
use joblet_core::JobId;
use joblet_core::JobSpec;
use joblet_core::JobStatus;
use joblet_core::SetupPhase;

use crate::cgroup::JobCgroup;
use crate::config::Config;
use crate::events::JobEvents;
use crate::events::StreamKind;
use crate::init::InitSpec;
use crate::init::compute_environment;
use crate::metrics::spawn_sampler;
use crate::persist::PersistHandle;
use crate::persist::PersistRecord;
use crate::runtime::RuntimeIndex;
use crate::sandbox;
use crate::spawn::ExitKind;
use crate::spawn::clone_flags;
use crate::spawn::spawn_sandbox_child;
use crate::spawn::wait_child;
use crate::upload::create_pipes;
use crate::volume::VolumeManager;
use crate::volume::VolumeMount;

mod commands;

pub use commands::*;

/// The capacity of the job status broadcast channel.
const STATUS_CHANNEL_CAPACITY: usize = 1024;

/// A job status change, broadcast to listeners.
#[derive(Debug, Clone)]
pub struct JobStatusEvent {
    /// The job that changed.
    pub id: JobId,
    /// The in-workflow name of the job, if any.
    pub name: Option<String>,
    /// The workflow the job belongs to, if any.
    pub workflow_id: Option<Uuid>,
    /// The new status.
    pub status: JobStatus,
    /// The exit code, when the new status is terminal and the command
    /// exited.
    pub exit_code: Option<i32>,
}

/// A job's live state inside the manager.
#[derive(Debug)]
struct JobEntry {
    /// The job record.
    job: Job,
    /// The job's fan-out hub.
    events: Arc<JobEvents>,
    /// The job's cgroup.
    cgroup: Arc<JobCgroup>,
    /// Cancels the job's auxiliary tasks (schedule timer, sampler).
    cancellation: CancellationToken,
    /// The planned volume mounts (kept for detach on cleanup).
    volume_mounts: Vec<VolumeMount>,
    /// The GPU device indexes allocated to the job.
    gpu_devices: Vec<u32>,
    /// The number of uploads the transport has not finished streaming.
    uploads_outstanding: usize,
    /// Whether an explicit stop was requested.
    stop_requested: bool,
    /// Whether the upload timeout fired for this job.
    upload_timed_out: bool,
}

/// State shared between the actor loop and per-job tasks.
#[derive(Debug)]
struct State {
    /// The engine configuration.
    config: Config,
    /// The runtime index.
    runtimes: Arc<RuntimeIndex>,
    /// The volume manager.
    volumes: Arc<VolumeManager>,
    /// The persistence producer handle.
    persist: PersistHandle,
    /// The job table.
    jobs: Mutex<HashMap<JobId, JobEntry>>,
    /// The status change broadcast.
    status_tx: broadcast::Sender<JobStatusEvent>,
    /// The free GPU device indexes.
    gpus: parking_lot::Mutex<BTreeSet<u32>>,
    /// Signals daemon shutdown to per-job tasks.
    shutdown: CancellationToken,
}

/// The job manager service.
#[allow(missing_debug_implementations)]
pub struct JobManagerSvc {
    /// The shared state.
    state: Arc<State>,
    /// The receiver for commands.
    rx: mpsc::Receiver<JobManagerCmd>,
}

impl JobManagerSvc {
    /// Spawns a new job manager service.
    ///
    /// Returns the join handle of the event loop, a typed command handle,
    /// and the status broadcast sender (subscribe for change events).
    pub fn spawn(
        channel_buffer_size: usize,
        config: Config,
        runtimes: Arc<RuntimeIndex>,
        volumes: Arc<VolumeManager>,
        persist: PersistHandle,
    ) -> (
        JoinHandle<()>,
        JobManagerHandle,
        broadcast::Sender<JobStatusEvent>,
    ) {
        let (tx, rx) = mpsc::channel(channel_buffer_size);
        let (status_tx, _) = broadcast::channel(STATUS_CHANNEL_CAPACITY);

        let gpus = (0..config.sandbox.gpu_count).collect();
        let state = Arc::new(State {
            config,
            runtimes,
            volumes,
            persist,
            jobs: Mutex::default(),
            status_tx: status_tx.clone(),
            gpus: parking_lot::Mutex::new(gpus),
            shutdown: CancellationToken::new(),
        });

        let svc = Self { state, rx };
        let handle = tokio::spawn(svc.run());
        (handle, JobManagerHandle::new(tx), status_tx)
    }

    /// Runs the event loop.
    async fn run(mut self) {
        info!("job manager service started");

        while let Some(cmd) = self.rx.recv().await {
            match cmd {
                JobManagerCmd::Submit { spec, name, rx } => {
                    trace!(?name, "received `Submit` command");
                    let result = submit_job(&self.state, spec, name).await;
                    let _ = rx.send(result);
                }
                JobManagerCmd::Stop { id, signal, rx } => {
                    trace!(?id, ?signal, "received `Stop` command");
                    let result = stop_job(&self.state, id, signal).await;
                    let _ = rx.send(result);
                }
                JobManagerCmd::Cancel { id, rx } => {
                    trace!(?id, "received `Cancel` command");
                    let result = cancel_job(&self.state, id).await;
                    let _ = rx.send(result);
                }
                JobManagerCmd::GetStatus { id, rx } => {
                    trace!(?id, "received `GetStatus` command");
                    let jobs = self.state.jobs.lock().await;
                    let result = jobs
                        .get(&id)
                        .map(|entry| entry.job.clone())
                        .ok_or(GetJobError::NotFound(id));
                    let _ = rx.send(result);
                }
                JobManagerCmd::List { filter, rx } => {
                    trace!(?filter, "received `List` command");
                    let jobs = self.state.jobs.lock().await;
                    let mut listed: Vec<_> = jobs
                        .values()
                        .map(|entry| &entry.job)
                        .filter(|job| {
                            filter.status.is_none_or(|status| job.status == status)
                                && filter
                                    .workflow_id
                                    .is_none_or(|id| job.spec.workflow_id == Some(id))
                        })
                        .cloned()
                        .collect();
                    listed.sort_by_key(|job| job.created_at);
                    let _ = rx.send(listed);
                }
                JobManagerCmd::Logs { id, follow, rx } => {
                    trace!(?id, follow, "received `Logs` command");
                    let jobs = self.state.jobs.lock().await;
                    let result = jobs
                        .get(&id)
                        .map(|entry| entry.events.subscribe(follow))
                        .ok_or(GetJobError::NotFound(id));
                    let _ = rx.send(result);
                }
                JobManagerCmd::UploadFinished { id, rx } => {
                    trace!(?id, "received `UploadFinished` command");
                    let mut jobs = self.state.jobs.lock().await;
                    let result = match jobs.get_mut(&id) {
                        Some(entry) => {
                            entry.uploads_outstanding = entry.uploads_outstanding.saturating_sub(1);
                            Ok(())
                        }
                        None => Err(GetJobError::NotFound(id)),
                    };
                    let _ = rx.send(result);
                }
                JobManagerCmd::Delete { id, rx } => {
                    trace!(?id, "received `Delete` command");
                    let result = delete_job(&self.state, id).await;
                    let _ = rx.send(result);
                }
                JobManagerCmd::Shutdown { rx } => {
                    trace!("received `Shutdown` command");
                    info!("job manager service is shutting down");
                    self.state.shutdown.cancel();
                    let _ = rx.send(());
                    break;
                }
            }
        }

        info!("job manager service stopped");
    }
}

impl State {
    /// Broadcasts a job's status change.
    fn emit(&self, job: &Job) {
        let _ = self.status_tx.send(JobStatusEvent {
            id: job.id,
            name: job.name.clone(),
            workflow_id: job.spec.workflow_id,
            status: job.status,
            exit_code: job.exit_code,
        });
    }

    /// Allocates GPU device indexes for a job.
    fn allocate_gpus(&self, count: u32) -> Result<Vec<u32>, SubmitJobError> {
        if count == 0 {
            return Ok(Vec::new());
        }

        let mut free = self.gpus.lock();
        if (free.len() as u32) < count {
            return Err(SubmitJobError::Validation(format!(
                "requested {count} GPU(s) but only {available} are free",
                available = free.len()
            )));
        }

        let allocated: Vec<u32> = free.iter().copied().take(count as usize).collect();
        for index in &allocated {
            free.remove(index);
        }
        Ok(allocated)
    }

    /// Returns GPU device indexes to the free pool.
    fn release_gpus(&self, devices: &[u32]) {
        let mut free = self.gpus.lock();
        free.extend(devices.iter().copied());
    }
}

/// Validates a job specification at submit time.
///
/// Spec-internal checks live on [`JobSpec::validate`]; this adds the
/// checks that need host knowledge.
fn validate_spec(spec: &JobSpec) -> Result<(), SubmitJobError> {
    spec.validate()
        .map_err(|e| SubmitJobError::Validation(e.to_string()))?;

    // A limit the host can never satisfy is a spec error, not a job
    // failure.
    if let Some(memory) = spec.limits.max_memory_bytes {
        let total = crate::SYSTEM.total_memory();
        if total > 0 && memory > total {
            return Err(SubmitJobError::Validation(format!(
                "job requires {memory} bytes of memory but the host only has {total}",
            )));
        }
    }

    if let Some(percent) = spec.limits.max_cpu_percent {
        let total = crate::SYSTEM.cpus().len() as u32 * 100;
        if total > 0 && percent > total {
            return Err(SubmitJobError::Validation(format!(
                "job requires {percent}% CPU but the host only has {total}%",
            )));
        }
    }

    Ok(())
}

/// Submits a job: validates the spec, prepares every resource, and either
/// starts the job or parks it until its schedule time.
async fn submit_job(
    state: &Arc<State>,
    spec: JobSpec,
    name: Option<String>,
) -> Result<Job, SubmitJobError> {
    validate_spec(&spec)?;

    // Resolve the runtime before any resource is created.
    let runtime = match &spec.runtime {
        Some(runtime_spec) => Some(
            state
                .runtimes
                .resolve(runtime_spec)
                .map_err(|e| SubmitJobError::Validation(format!("{e:#}")))?,
        ),
        None => None,
    };

    let gpu_devices = state.allocate_gpus(spec.gpu_count)?;

    let id = JobId::new();
    let prepared = prepare_job(state, id, &spec, runtime.as_deref(), &gpu_devices).await;
    let (init_spec, volume_mounts, cgroup) = match prepared {
        Ok(prepared) => prepared,
        Err(e) => {
            // Preparation is not transactional; remove whatever partial
            // state exists.
            state.release_gpus(&gpu_devices);
            state.volumes.detach(id, &spec.volumes);
            let _ = fs::remove_dir(state.config.cgroup.scope_dir(id));
            if let Err(cleanup) = sandbox::cleanup_host(&state.config.job_root(id)) {
                warn!(job = %id, error = %cleanup, "failed to remove partial sandbox");
            }
            let _ = fs::remove_file(state.config.job_spawn_spec(id));
            return Err(e);
        }
    };

    let mut job = Job::new(id, spec);
    job.name = name;

    let entry = JobEntry {
        job: job.clone(),
        events: JobEvents::new(
            state.config.events.ring_bytes,
            state.config.events.channel_capacity,
        ),
        cgroup: Arc::new(cgroup),
        cancellation: state.shutdown.child_token(),
        volume_mounts,
        gpu_devices,
        uploads_outstanding: job.spec.uploads.len(),
        stop_requested: false,
        upload_timed_out: false,
    };

    {
        let mut jobs = state.jobs.lock().await;
        jobs.insert(id, entry);
    }
    state.emit(&job);
    info!(job = %id, command = %job.spec.command, "job submitted");

    match job.spec.schedule_at {
        Some(at) if at > Utc::now() => {
            let job = schedule_job(state, id, at).await;
            Ok(job)
        }
        _ => {
            let state = state.clone();
            tokio::spawn(async move {
                start_job(&state, id, init_spec).await;
            });
            Ok(job)
        }
    }
}

/// Prepares a job's on-disk and kernel resources.
///
/// Creates the job directories, the cgroup (with limits applied), the
/// upload FIFOs, and the volume references, then writes the spawn
/// specification for the init process.
async fn prepare_job(
    state: &Arc<State>,
    id: JobId,
    spec: &JobSpec,
    runtime: Option<&crate::runtime::InstalledRuntime>,
    gpu_devices: &[u32],
) -> Result<(InitSpec, Vec<VolumeMount>, JobCgroup), SubmitJobError> {
    let root = state.config.job_root(id);
    let tmp = state.config.job_tmp(id);
    fs::create_dir_all(&tmp)
        .with_context(|| format!("failed to create job directories under `{}`", root.display()))
        .map_err(SubmitJobError::Resource)?;

    // The cgroup exists, fully limited, before the child can.
    let cgroup = JobCgroup::create(&state.config.cgroup, id, &spec.limits)
        .map_err(SubmitJobError::Resource)?;

    let pipes_dir = state.config.job_pipes(id);
    if !spec.uploads.is_empty() {
        create_pipes(&pipes_dir, &spec.uploads).map_err(SubmitJobError::Resource)?;
    }

    let volume_mounts = state
        .volumes
        .attach(id, &spec.volumes)
        .map_err(|e| SubmitJobError::Validation(format!("{e:#}")))?;

    let (runtime_mounts, runtime_env) = match runtime {
        Some(runtime) => (
            runtime.plan_mounts(),
            runtime.manifest().environment.clone(),
        ),
        None => (Vec::new(), Default::default()),
    };

    let mut cuda_paths = Vec::new();
    if !gpu_devices.is_empty() {
        cuda_paths.extend(state.config.sandbox.cuda_paths.iter().cloned());
    }

    let mut allowed_host_paths = state.config.sandbox.allowed_host_paths.clone();
    allowed_host_paths.extend(cuda_paths);

    let init_spec = InitSpec {
        job_id: id,
        command: spec.command.clone(),
        args: spec.args.clone(),
        env: compute_environment(&spec.env, &runtime_env),
        sandbox_root: root,
        tmp_dir: tmp,
        pipes_dir,
        allowed_host_paths,
        dns_servers: state.config.sandbox.dns_servers.clone(),
        runtime_mounts,
        volume_mounts: volume_mounts.clone(),
        uploads: spec.uploads.clone(),
        network: spec.network.clone(),
        work_tmpfs_bytes: spec
            .limits
            .workspace_quota_bytes
            .unwrap_or(state.config.sandbox.work_tmpfs_bytes),
        builder: spec.builder,
        runtimes_dir: state.config.runtimes.base_dir.clone(),
        gpu_devices: gpu_devices.to_vec(),
    };

    init_spec
        .store(&state.config.job_spawn_spec(id))
        .context("failed to write the spawn specification")
        .map_err(SubmitJobError::Resource)?;

    Ok((init_spec, volume_mounts, cgroup))
}

/// Parks a job until its schedule time, then starts it.
async fn schedule_job(state: &Arc<State>, id: JobId, at: chrono::DateTime<Utc>) -> Job {
    let job = {
        let mut jobs = state.jobs.lock().await;
        // SAFETY: the entry was inserted by the caller and nothing
        // removes non-terminal entries.
        let entry = jobs.get_mut(&id).unwrap();
        entry.job.status = JobStatus::Scheduled;
        entry.job.clone()
    };
    state.emit(&job);

    let delay = (at - Utc::now()).to_std().unwrap_or_default();
    debug!(job = %id, ?delay, "job scheduled");

    let state = state.clone();
    tokio::spawn(async move {
        let cancellation = {
            let jobs = state.jobs.lock().await;
            match jobs.get(&id) {
                Some(entry) => entry.cancellation.clone(),
                None => return,
            }
        };

        tokio::select! {
            _ = tokio::time::sleep(delay) => {}
            _ = cancellation.cancelled() => return,
        }

        let init_spec = match InitSpec::load(&state.config.job_spawn_spec(id)) {
            Ok(init_spec) => init_spec,
            Err(e) => {
                error!(job = %id, error = %e, "failed to reload the spawn specification");
                finish_job(&state, id, JobStatus::Failed, None, Some(FailureReason::SpawnFailed))
                    .await;
                return;
            }
        };

        start_job(&state, id, init_spec).await;
    });

    job
}

/// Starts a job: clones the sandbox child, enrolls it in its cgroup,
/// releases it, and supervises it to termination.
async fn start_job(state: &Arc<State>, id: JobId, init_spec: InitSpec) {
    // A cancel may have won the race; starting is only legal from
    // PENDING or SCHEDULED.
    let (cgroup, events, network_isolated) = {
        let jobs = state.jobs.lock().await;
        match jobs.get(&id) {
            Some(entry)
                if matches!(entry.job.status, JobStatus::Pending | JobStatus::Scheduled) =>
            {
                (
                    entry.cgroup.clone(),
                    entry.events.clone(),
                    entry.job.spec.network.isolated(),
                )
            }
            _ => return,
        }
    };

    let flags = clone_flags(network_isolated, state.config.sandbox.user_namespaces);
    let spec_path = state.config.job_spawn_spec(id);

    let child = match spawn_sandbox_child(id, &spec_path, flags) {
        Ok(child) => child,
        Err(e) => {
            error!(job = %id, error = %format!("{e:#}"), "failed to clone the sandbox child");
            finish_job(state, id, JobStatus::Failed, None, Some(FailureReason::SpawnFailed)).await;
            return;
        }
    };

    // Enrolment before release: the child's first user-space instruction
    // runs inside the constrained cgroup.
    if let Err(e) = cgroup.enroll(child.pid) {
        error!(job = %id, error = %format!("{e:#}"), "failed to enroll the sandbox child");
        // Dropping the child closes the sync pipe; it exits on its own.
        drop(child);
        finish_job(state, id, JobStatus::Failed, None, Some(FailureReason::SpawnFailed)).await;
        return;
    }

    let (pid, stdout, stderr) = match child.release() {
        Ok(released) => released,
        Err(e) => {
            error!(job = %id, error = %format!("{e:#}"), "failed to release the sandbox child");
            finish_job(state, id, JobStatus::Failed, None, Some(FailureReason::SpawnFailed)).await;
            return;
        }
    };

    let (sampler_token, has_uploads) = {
        let mut jobs = state.jobs.lock().await;
        // SAFETY: non-terminal entries are never removed and this job was
        // just checked to be pre-running.
        let entry = jobs.get_mut(&id).unwrap();
        if !entry.job.status.can_transition_to(JobStatus::Running) {
            // A cancel won the race against the clone; the child was
            // released but its cgroup is already being torn down.
            drop(jobs);
            let _ = nix::sys::signal::kill(pid, Signal::SIGKILL);
            let _ = wait_child(pid).await;
            return;
        }

        entry.job.status = JobStatus::Running;
        entry.job.started_at = Some(Utc::now());
        state.emit(&entry.job);
        (entry.cancellation.clone(), !entry.job.spec.uploads.is_empty())
    };
    info!(job = %id, %pid, "job running");

    let sampler = spawn_sampler(
        id,
        cgroup.clone(),
        events.clone(),
        state.persist.clone(),
        state.config.events.sample_interval,
        sampler_token.clone(),
    );

    if has_uploads {
        spawn_upload_watchdog(state.clone(), id, cgroup.clone());
    }

    let state = state.clone();
    tokio::spawn(async move {
        supervise_job(&state, id, pid, stdout, stderr, cgroup, events, sampler, sampler_token)
            .await;
    });
}

/// Fails the job if its uploads have not finished streaming within the
/// configured timeout.
fn spawn_upload_watchdog(state: Arc<State>, id: JobId, cgroup: Arc<JobCgroup>) {
    let timeout = state.config.lifecycle.upload_timeout;
    tokio::spawn(async move {
        tokio::time::sleep(timeout).await;

        let fire = {
            let mut jobs = state.jobs.lock().await;
            match jobs.get_mut(&id) {
                Some(entry)
                    if entry.job.status == JobStatus::Running
                        && entry.uploads_outstanding > 0 =>
                {
                    entry.upload_timed_out = true;
                    true
                }
                _ => false,
            }
        };

        if fire {
            warn!(job = %id, "uploads did not complete in time; killing the job");
            if let Err(e) = cgroup.signal_all(Signal::SIGKILL) {
                error!(job = %id, error = %format!("{e:#}"), "failed to kill a timed-out job");
            }
        }
    });
}

/// Pumps one output stream into the job's fan-out and the persistence
/// sink, line by line, until EOF.
async fn pump_output(
    id: JobId,
    kind: StreamKind,
    output: crate::spawn::ChildOutput,
    events: Arc<JobEvents>,
    persist: PersistHandle,
) {
    let mut lines = BufReader::new(output).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => {
                let record = events.publish_line(id, kind, line);
                persist.send(PersistRecord::Log(record));
            }
            Ok(None) => break,
            Err(e) => {
                debug!(job = %id, ?kind, error = %e, "output pump read failed");
                break;
            }
        }
    }
}

/// Supervises a running job to termination: waits for the child (with an
/// optional wall-clock limit), drains the output pumps, classifies the
/// exit, and cleans up.
#[allow(clippy::too_many_arguments)]
async fn supervise_job(
    state: &Arc<State>,
    id: JobId,
    pid: nix::unistd::Pid,
    stdout: crate::spawn::ChildOutput,
    stderr: crate::spawn::ChildOutput,
    cgroup: Arc<JobCgroup>,
    events: Arc<JobEvents>,
    sampler: JoinHandle<()>,
    sampler_token: CancellationToken,
) {
    let pumps = async {
        tokio::join!(
            pump_output(id, StreamKind::Stdout, stdout, events.clone(), state.persist.clone()),
            pump_output(id, StreamKind::Stderr, stderr, events.clone(), state.persist.clone()),
        );
    };

    let wait = async {
        let wait = wait_child(pid);
        tokio::pin!(wait);

        match state.config.lifecycle.max_wall_clock_secs {
            Some(secs) => {
                tokio::select! {
                    exit = &mut wait => exit,
                    _ = tokio::time::sleep(std::time::Duration::from_secs(secs)) => {
                        warn!(job = %id, "job exceeded its wall-clock limit; killing");
                        if let Err(e) = cgroup.signal_all(Signal::SIGKILL) {
                            error!(job = %id, error = %format!("{e:#}"), "failed to kill the job");
                        }
                        wait.await
                    }
                }
            }
            None => wait.await,
        }
    };

    let (exit, ()) = tokio::join!(wait, pumps);

    sampler_token.cancel();
    let _ = sampler.await;

    let (status, exit_code, failure) = classify_exit(state, id, &cgroup, exit).await;
    finish_job(state, id, status, exit_code, failure).await;
}

/// Classifies a child's exit into a terminal job status.
async fn classify_exit(
    state: &Arc<State>,
    id: JobId,
    cgroup: &JobCgroup,
    exit: anyhow::Result<ExitKind>,
) -> (JobStatus, Option<i32>, Option<FailureReason>) {
    let (stop_requested, upload_timed_out) = {
        let jobs = state.jobs.lock().await;
        match jobs.get(&id) {
            Some(entry) => (entry.stop_requested, entry.upload_timed_out),
            None => (false, false),
        }
    };

    // An OOM kill shows up as a signal exit; the cgroup's memory.events
    // is the distinguishing signal.
    if cgroup.oom_killed() {
        return (JobStatus::Failed, None, Some(FailureReason::OomKilled));
    }

    match exit {
        Ok(ExitKind::Exited(0)) => (JobStatus::Completed, Some(0), None),
        Ok(ExitKind::Exited(code)) if code == INTEGRITY_EXIT_CODE => (
            JobStatus::Failed,
            Some(code),
            Some(FailureReason::IntegrityCheck),
        ),
        Ok(ExitKind::Exited(code)) => match SetupPhase::from_exit_code(code) {
            Some(phase) => (
                JobStatus::Failed,
                Some(code),
                Some(FailureReason::Setup(phase)),
            ),
            None if code == EXEC_EXIT_CODE && upload_timed_out => (
                JobStatus::Failed,
                Some(code),
                Some(FailureReason::Setup(SetupPhase::Uploads)),
            ),
            None => (JobStatus::Failed, Some(code), None),
        },
        Ok(ExitKind::Signaled(_)) if stop_requested => (JobStatus::Stopped, None, None),
        Ok(ExitKind::Signaled(_)) if upload_timed_out => (
            JobStatus::Failed,
            None,
            Some(FailureReason::Setup(SetupPhase::Uploads)),
        ),
        Ok(ExitKind::Signaled(signal)) => {
            (JobStatus::Failed, None, Some(FailureReason::Signaled(signal)))
        }
        Err(e) => {
            error!(job = %id, error = %format!("{e:#}"), "failed to reap the sandbox child");
            (JobStatus::Failed, None, Some(FailureReason::SpawnFailed))
        }
    }
}

/// Moves a job to a terminal status, cleans its resources up, and closes
/// its fan-out.
async fn finish_job(
    state: &Arc<State>,
    id: JobId,
    status: JobStatus,
    exit_code: Option<i32>,
    failure: Option<FailureReason>,
) {
    let (job, events, cgroup, volume_names, gpu_devices) = {
        let mut jobs = state.jobs.lock().await;
        let entry = match jobs.get_mut(&id) {
            Some(entry) => entry,
            None => return,
        };

        // Guards both double-finishes and races like a cancel losing to a
        // concurrent start: terminal statuses permit nothing, and RUNNING
        // does not permit CANCELED.
        if !entry.job.status.can_transition_to(status) {
            return;
        }

        entry.cancellation.cancel();
        entry.job.status = status;
        entry.job.exit_code = exit_code;
        entry.job.failure = failure.clone();
        entry.job.ended_at = Some(Utc::now());
        (
            entry.job.clone(),
            entry.events.clone(),
            entry.cgroup.clone(),
            entry.job.spec.volumes.clone(),
            entry.gpu_devices.clone(),
        )
    };

    // Errors are recorded on the job and surfaced as a final tagged log
    // line for subscribers.
    if let Some(failure) = &failure {
        let record = events.publish_line(id, StreamKind::Stderr, format!("[joblet] {failure}"));
        state.persist.send(PersistRecord::Log(record));
    }

    cleanup_job(state, id, &cgroup, &volume_names, &gpu_devices).await;

    events.close();
    state.emit(&job);

    match status {
        JobStatus::Completed => info!(job = %id, "job completed"),
        status => info!(job = %id, %status, ?exit_code, "job finished"),
    }
}

/// Releases a job's resources: volume references, the cgroup, the sandbox
/// tree, and the spawn specification.
///
/// Cleanup errors are logged and never surfaced; they must not block
/// releasing the job slot.
async fn cleanup_job(
    state: &Arc<State>,
    id: JobId,
    cgroup: &JobCgroup,
    volume_names: &[String],
    gpu_devices: &[u32],
) {
    state.volumes.detach(id, volume_names);
    state.release_gpus(gpu_devices);

    if let Err(e) = cgroup
        .destroy(state.config.lifecycle.cgroup_destroy_grace)
        .await
    {
        warn!(job = %id, error = %format!("{e:#}"), "failed to destroy the job cgroup");
    }

    if let Err(e) = sandbox::cleanup_host(&state.config.job_root(id)) {
        warn!(job = %id, error = %format!("{e:#}"), "failed to remove the sandbox tree");
    }

    if let Err(e) = fs::remove_file(state.config.job_spawn_spec(id)) {
        if e.kind() != std::io::ErrorKind::NotFound {
            warn!(job = %id, error = %e, "failed to remove the spawn specification");
        }
    }
}

/// Stops a running job by signalling its cgroup, with escalation to
/// `SIGKILL` after the configured grace period.
async fn stop_job(
    state: &Arc<State>,
    id: JobId,
    signal: Option<i32>,
) -> Result<JobStatus, StopJobError> {
    let cgroup = {
        let mut jobs = state.jobs.lock().await;
        let entry = jobs.get_mut(&id).ok_or(StopJobError::NotFound(id))?;

        if entry.job.status != JobStatus::Running {
            return Err(StopJobError::InvalidStatus {
                id,
                status: entry.job.status,
            });
        }

        entry.stop_requested = true;
        entry.cgroup.clone()
    };

    let signal = signal
        .map(Signal::try_from)
        .transpose()
        .map_err(|e| StopJobError::Signal {
            id,
            source: anyhow!(e).context("invalid stop signal"),
        })?
        .unwrap_or(Signal::SIGTERM);

    cgroup
        .signal_all(signal)
        .map_err(|source| StopJobError::Signal { id, source })?;
    debug!(job = %id, %signal, "stop requested");

    // Escalate if the job outlives the grace period.
    if signal != Signal::SIGKILL {
        let state = state.clone();
        let grace = state.config.lifecycle.stop_grace;
        tokio::spawn(async move {
            tokio::time::sleep(grace).await;

            let still_running = {
                let jobs = state.jobs.lock().await;
                jobs.get(&id)
                    .map(|entry| entry.job.status == JobStatus::Running)
                    .unwrap_or(false)
            };
            if still_running {
                warn!(job = %id, "job survived the stop grace period; killing");
                if let Err(e) = cgroup.signal_all(Signal::SIGKILL) {
                    error!(job = %id, error = %format!("{e:#}"), "failed to kill the job");
                }
            }
        });
    }

    Ok(JobStatus::Running)
}

/// Cancels a job that has not started running.
async fn cancel_job(state: &Arc<State>, id: JobId) -> Result<(), CancelJobError> {
    {
        let mut jobs = state.jobs.lock().await;
        let entry = jobs.get_mut(&id).ok_or(CancelJobError::NotFound(id))?;

        if !matches!(entry.job.status, JobStatus::Pending | JobStatus::Scheduled) {
            return Err(CancelJobError::InvalidStatus {
                id,
                status: entry.job.status,
            });
        }
    }

    finish_job(state, id, JobStatus::Canceled, None, None).await;
    Ok(())
}

/// Deletes a terminal job's record, dropping its fan-out.
async fn delete_job(state: &Arc<State>, id: JobId) -> Result<(), DeleteJobError> {
    let mut jobs = state.jobs.lock().await;
    let entry = jobs.get(&id).ok_or(DeleteJobError::NotFound(id))?;

    if !entry.job.status.is_terminal() {
        return Err(DeleteJobError::NotTerminal {
            id,
            status: entry.job.status,
        });
    }

    jobs.remove(&id);
    debug!(job = %id, "job deleted");
    Ok(())
}

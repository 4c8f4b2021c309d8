//! The job model.

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use chrono::DateTime;
use chrono::Utc;
use indexmap::IndexMap;
use serde::Deserialize;
use serde::Serialize;
use uuid::Uuid;

use crate::SetupPhase;

/// The default file mode for materialised uploads.
pub const DEFAULT_UPLOAD_MODE: u32 = 0o644;

/// A stable job identifier.
///
/// Identifiers are 128-bit UUIDs rendered in the hyphenated string form.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Default,
)]
#[serde(transparent)]
pub struct JobId(Uuid);

impl JobId {
    /// Allocates a new random job identifier.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Gets the inner UUID.
    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.hyphenated().fmt(f)
    }
}

impl FromStr for JobId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self(Uuid::parse_str(s)?))
    }
}

impl From<Uuid> for JobId {
    fn from(id: Uuid) -> Self {
        Self(id)
    }
}

/// The status of a job.
///
/// Statuses are rendered with their wire names (e.g. `COMPLETED`) for
/// display, serialization, and workflow requirement expressions.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    strum::Display,
    strum::EnumString,
)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
pub enum JobStatus {
    /// The job has been accepted but not yet released for execution.
    Pending,
    /// The job is waiting for its schedule time.
    Scheduled,
    /// The job's sandbox process is executing.
    Running,
    /// The job's command exited with a zero status.
    Completed,
    /// The job's command exited non-zero, was killed, or setup failed.
    Failed,
    /// The job was stopped by an explicit stop request.
    Stopped,
    /// The job was canceled before it ever ran.
    Canceled,
}

impl JobStatus {
    /// Determines if the status is terminal.
    ///
    /// A job in a terminal status will never transition again.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Completed | Self::Failed | Self::Stopped | Self::Canceled
        )
    }

    /// Determines if a transition from this status to the given status is
    /// permitted by the job state machine.
    ///
    /// Transitions are monotonic: terminal statuses permit nothing and
    /// `CANCELED` is only reachable before the job runs.
    pub fn can_transition_to(&self, next: JobStatus) -> bool {
        match self {
            Self::Pending => matches!(
                next,
                Self::Scheduled | Self::Running | Self::Canceled | Self::Failed
            ),
            Self::Scheduled => matches!(next, Self::Running | Self::Canceled | Self::Failed),
            Self::Running => matches!(next, Self::Completed | Self::Failed | Self::Stopped),
            Self::Completed | Self::Failed | Self::Stopped | Self::Canceled => false,
        }
    }
}

/// The network mode for a job's sandbox.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(into = "String", try_from = "String")]
pub enum NetworkMode {
    /// The job joins the daemon's bridge network.
    #[default]
    Bridge,
    /// The job shares the host network namespace.
    Host,
    /// The job gets a network namespace with only loopback.
    None,
    /// The job joins a named custom network.
    Custom(String),
}

impl NetworkMode {
    /// Determines if the job requires a new network namespace.
    ///
    /// Host networking is the only mode that reuses the host's namespace.
    pub fn isolated(&self) -> bool {
        !matches!(self, Self::Host)
    }
}

impl fmt::Display for NetworkMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Bridge => write!(f, "bridge"),
            Self::Host => write!(f, "host"),
            Self::None => write!(f, "none"),
            Self::Custom(name) => write!(f, "{name}"),
        }
    }
}

impl From<NetworkMode> for String {
    fn from(mode: NetworkMode) -> Self {
        mode.to_string()
    }
}

impl TryFrom<String> for NetworkMode {
    type Error = std::convert::Infallible;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        Ok(match s.as_str() {
            "bridge" | "" => Self::Bridge,
            "host" => Self::Host,
            "none" => Self::None,
            _ => Self::Custom(s),
        })
    }
}

/// Resource limits applied to a job's cgroup and sandbox.
///
/// A limit of `None` leaves the corresponding controller unconstrained.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", deny_unknown_fields)]
pub struct ResourceLimits {
    /// The maximum CPU utilisation as a percentage of one core.
    ///
    /// Values above 100 grant more than one core.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_cpu_percent: Option<u32>,
    /// The maximum resident memory, in bytes.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_memory_bytes: Option<u64>,
    /// The maximum block I/O throughput, in bytes per second.
    ///
    /// Applied to both reads and writes on every configured device.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_io_bps: Option<u64>,
    /// The CPU core mask (`cpuset.cpus` syntax, e.g. `0-3,8`).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cpu_cores: Option<String>,
    /// The maximum number of PIDs the job may hold.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_pids: Option<u32>,
    /// The workspace disk quota, in bytes.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub workspace_quota_bytes: Option<u64>,
}

impl ResourceLimits {
    /// Determines if no limits are set at all.
    pub fn is_unlimited(&self) -> bool {
        self.max_cpu_percent.is_none()
            && self.max_memory_bytes.is_none()
            && self.max_io_bps.is_none()
            && self.cpu_cores.is_none()
            && self.max_pids.is_none()
            && self.workspace_quota_bytes.is_none()
    }
}

/// Describes one client file upload streamed into a job's workspace.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", deny_unknown_fields)]
pub struct UploadSpec {
    /// The zero-based upload index; names the FIFO the bytes arrive on.
    pub index: usize,
    /// The destination path, absolute inside the sandbox or relative to
    /// the working directory.
    pub destination: PathBuf,
    /// The file mode for the materialised destination.
    #[serde(default = "default_upload_mode")]
    pub mode: u32,
    /// The declared size of the upload, in bytes.
    pub size: u64,
}

/// Returns the default upload mode.
fn default_upload_mode() -> u32 {
    DEFAULT_UPLOAD_MODE
}

impl UploadSpec {
    /// Gets the FIFO file name for this upload within the job's pipes
    /// directory.
    pub fn fifo_name(&self) -> String {
        self.index.to_string()
    }
}

/// The specification of a job as submitted by a client.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", deny_unknown_fields)]
pub struct JobSpec {
    /// The command to execute.
    pub command: String,
    /// The argument vector, not including the command itself.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub args: Vec<String>,
    /// The environment for the command.
    ///
    /// Runtime environments are merged underneath these entries.
    #[serde(default, skip_serializing_if = "IndexMap::is_empty")]
    pub env: IndexMap<String, String>,
    /// The ordered upload descriptors.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub uploads: Vec<UploadSpec>,
    /// The resource limits.
    #[serde(default, skip_serializing_if = "ResourceLimits::is_unlimited")]
    pub limits: ResourceLimits,
    /// The runtime specification string (e.g. `python-3.11-ml` or
    /// `python@3.11`).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub runtime: Option<String>,
    /// The network mode.
    #[serde(default)]
    pub network: NetworkMode,
    /// The names of volumes to mount into the sandbox.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub volumes: Vec<String>,
    /// The absolute time at which to release the job for execution.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub schedule_at: Option<DateTime<Utc>>,
    /// The identifier of the workflow the job belongs to, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub workflow_id: Option<Uuid>,
    /// The number of GPUs to allocate to the job.
    #[serde(default, skip_serializing_if = "is_zero")]
    pub gpu_count: u32,
    /// Whether the job is a runtime build job granted host userland access.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub builder: bool,
}

/// Determines if a count is zero; used to skip serialization.
fn is_zero(n: &u32) -> bool {
    *n == 0
}

impl JobSpec {
    /// Creates a new job specification for the given command.
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            ..Default::default()
        }
    }

    /// Validates the specification's internal consistency.
    ///
    /// Checks that do not depend on daemon state (installed runtimes,
    /// existing volumes, host capacity) live here so every surface that
    /// accepts a specification applies them identically.
    pub fn validate(&self) -> crate::Result<()> {
        if self.command.trim().is_empty() {
            return Err(crate::Error::validation("job command must not be empty"));
        }

        if self.command.contains('\0') || self.args.iter().any(|arg| arg.contains('\0')) {
            return Err(crate::Error::validation(
                "job command and arguments must not contain NUL bytes",
            ));
        }

        let mut indexes = std::collections::BTreeSet::new();
        for upload in &self.uploads {
            if !indexes.insert(upload.index) {
                return Err(crate::Error::validation(format!(
                    "duplicate upload index {index}",
                    index = upload.index
                )));
            }

            if upload.destination.as_os_str().is_empty() {
                return Err(crate::Error::validation(format!(
                    "upload {index} has an empty destination",
                    index = upload.index
                )));
            }

            // A relative destination that climbs out of the working
            // directory defeats the workspace quota.
            if upload
                .destination
                .components()
                .any(|c| matches!(c, std::path::Component::ParentDir))
            {
                return Err(crate::Error::validation(format!(
                    "upload destination `{destination}` must not contain `..`",
                    destination = upload.destination.display()
                )));
            }
        }

        if let Some(percent) = self.limits.max_cpu_percent {
            if percent == 0 {
                return Err(crate::Error::validation(
                    "a CPU limit of zero percent would never schedule",
                ));
            }
        }

        if let Some(pids) = self.limits.max_pids {
            if pids == 0 {
                return Err(crate::Error::validation(
                    "a PID limit of zero would prevent exec",
                ));
            }
        }

        Ok(())
    }
}

/// The reason a job reached the `FAILED` status.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureReason {
    /// The kernel OOM killer terminated the job.
    OomKilled,
    /// The job was terminated by the given signal.
    Signaled(i32),
    /// Sandbox setup failed in the given phase.
    Setup(SetupPhase),
    /// The child could not be spawned at all.
    SpawnFailed,
    /// A sandbox safety check refused to proceed.
    IntegrityCheck,
}

impl fmt::Display for FailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::OomKilled => write!(f, "killed by the kernel OOM killer"),
            Self::Signaled(signal) => write!(f, "terminated by signal {signal}"),
            Self::Setup(phase) => write!(f, "sandbox setup failed during {phase}"),
            Self::SpawnFailed => write!(f, "the sandbox process could not be spawned"),
            Self::IntegrityCheck => write!(f, "a sandbox safety check refused to proceed"),
        }
    }
}

/// A job record: the submitted specification plus the daemon's view of its
/// lifecycle.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct Job {
    /// The job identifier.
    pub id: JobId,
    /// The in-workflow name of the job, if it was submitted via a workflow.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// The submitted specification.
    pub spec: JobSpec,
    /// The current status.
    pub status: JobStatus,
    /// The exit code of the user command, when it exited on its own.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
    /// The reason the job failed, when `status` is `FAILED`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure: Option<FailureReason>,
    /// When the job was accepted.
    pub created_at: DateTime<Utc>,
    /// When the job started running.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    /// When the job reached a terminal status.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ended_at: Option<DateTime<Utc>>,
}

impl Job {
    /// Creates a new pending job record for the given specification.
    pub fn new(id: JobId, spec: JobSpec) -> Self {
        Self {
            id,
            name: None,
            spec,
            status: JobStatus::Pending,
            exit_code: None,
            failure: None,
            created_at: Utc::now(),
            started_at: None,
            ended_at: None,
        }
    }
}

#[cfg(test)]
mod test {
    use std::str::FromStr;

    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn status_wire_names_round_trip() {
        for status in [
            JobStatus::Pending,
            JobStatus::Scheduled,
            JobStatus::Running,
            JobStatus::Completed,
            JobStatus::Failed,
            JobStatus::Stopped,
            JobStatus::Canceled,
        ] {
            let rendered = status.to_string();
            assert_eq!(rendered, rendered.to_uppercase());
            assert_eq!(JobStatus::from_str(&rendered).unwrap(), status);
        }
    }

    #[test]
    fn terminal_statuses_permit_nothing() {
        for terminal in [
            JobStatus::Completed,
            JobStatus::Failed,
            JobStatus::Stopped,
            JobStatus::Canceled,
        ] {
            assert!(terminal.is_terminal());
            for next in [
                JobStatus::Pending,
                JobStatus::Running,
                JobStatus::Completed,
                JobStatus::Failed,
            ] {
                assert!(!terminal.can_transition_to(next));
            }
        }
    }

    #[test]
    fn canceled_is_unreachable_from_running() {
        assert!(!JobStatus::Running.can_transition_to(JobStatus::Canceled));
        assert!(JobStatus::Pending.can_transition_to(JobStatus::Canceled));
        assert!(JobStatus::Scheduled.can_transition_to(JobStatus::Canceled));
    }

    #[test]
    fn network_mode_round_trip() {
        for (text, mode) in [
            ("bridge", NetworkMode::Bridge),
            ("host", NetworkMode::Host),
            ("none", NetworkMode::None),
            ("lab-net", NetworkMode::Custom("lab-net".to_string())),
        ] {
            let parsed = NetworkMode::try_from(text.to_string()).unwrap();
            assert_eq!(parsed, mode);
            assert_eq!(parsed.to_string(), text);
        }

        assert!(NetworkMode::Bridge.isolated());
        assert!(!NetworkMode::Host.isolated());
    }

    #[test]
    fn job_spec_serde_defaults() {
        let spec: JobSpec = serde_json::from_str(r#"{"command": "echo"}"#).unwrap();
        assert_eq!(spec.command, "echo");
        assert_eq!(spec.network, NetworkMode::Bridge);
        assert!(spec.limits.is_unlimited());
        assert!(!spec.builder);
    }

    #[test]
    fn validation_accepts_a_plain_command() {
        let mut spec = JobSpec::new("echo");
        spec.args = vec!["hello".to_string()];
        spec.validate().unwrap();
    }

    #[test]
    fn validation_rejects_empty_and_nul_commands() {
        assert!(JobSpec::new("").validate().is_err());
        assert!(JobSpec::new("  ").validate().is_err());
        assert!(JobSpec::new("ec\0ho").validate().is_err());
    }

    #[test]
    fn validation_rejects_bad_uploads() {
        let upload = |index, destination: &str| UploadSpec {
            index,
            destination: destination.into(),
            mode: DEFAULT_UPLOAD_MODE,
            size: 1,
        };

        let mut spec = JobSpec::new("cat");
        spec.uploads = vec![upload(0, "a"), upload(0, "b")];
        assert!(spec.validate().is_err());

        let mut spec = JobSpec::new("cat");
        spec.uploads = vec![upload(0, "../escape")];
        assert!(spec.validate().is_err());

        let mut spec = JobSpec::new("cat");
        spec.uploads = vec![upload(0, "data/input.csv"), upload(1, "/tmp/x")];
        spec.validate().unwrap();
    }

    #[test]
    fn validation_rejects_degenerate_limits() {
        let mut spec = JobSpec::new("echo");
        spec.limits.max_cpu_percent = Some(0);
        assert!(spec.validate().is_err());

        let mut spec = JobSpec::new("echo");
        spec.limits.max_pids = Some(0);
        assert!(spec.validate().is_err());
    }
}

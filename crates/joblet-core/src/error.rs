//! The error taxonomy shared across the daemon.

use std::fmt;

use serde::Deserialize;
use serde::Serialize;
use thiserror::Error;

/// A phase of sandbox setup.
///
/// Each phase has a distinct child exit code so the parent can map a child
/// that died before `execve` back to the failing phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SetupPhase {
    /// Creating the sandbox directory skeleton.
    Directories,
    /// Applying bind, tmpfs, or proc mounts.
    Mount,
    /// Entering the sandbox root via `chroot`.
    Chroot,
    /// Creating device nodes inside the sandbox.
    Devices,
    /// Composing the runtime filesystem overlay.
    Runtime,
    /// Bind-mounting attached volumes.
    Volumes,
    /// Materialising client uploads from their FIFOs.
    Uploads,
    /// Creating or populating the job's cgroup.
    Cgroup,
}

impl SetupPhase {
    /// The base of the child exit code range reserved for setup failures.
    const EXIT_BASE: i32 = 40;

    /// All phases, in setup order.
    pub const ALL: &[SetupPhase] = &[
        Self::Directories,
        Self::Mount,
        Self::Chroot,
        Self::Devices,
        Self::Runtime,
        Self::Volumes,
        Self::Uploads,
        Self::Cgroup,
    ];

    /// Gets the child exit code that reports a failure in this phase.
    pub fn exit_code(&self) -> i32 {
        Self::EXIT_BASE
            + match self {
                Self::Directories => 0,
                Self::Mount => 1,
                Self::Chroot => 2,
                Self::Devices => 3,
                Self::Runtime => 4,
                Self::Volumes => 5,
                Self::Uploads => 6,
                Self::Cgroup => 7,
            }
    }

    /// Maps a child exit code back to a setup phase, if it is in the
    /// reserved range.
    pub fn from_exit_code(code: i32) -> Option<Self> {
        Self::ALL.iter().copied().find(|p| p.exit_code() == code)
    }
}

impl fmt::Display for SetupPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Directories => write!(f, "directory creation"),
            Self::Mount => write!(f, "filesystem mounting"),
            Self::Chroot => write!(f, "chroot"),
            Self::Devices => write!(f, "device node creation"),
            Self::Runtime => write!(f, "runtime composition"),
            Self::Volumes => write!(f, "volume mounting"),
            Self::Uploads => write!(f, "upload materialisation"),
            Self::Cgroup => write!(f, "cgroup setup"),
        }
    }
}

/// The child exit code for a failed integrity check.
///
/// Distinct from the [`SetupPhase`] range: an integrity refusal means the
/// child never attempted any setup at all.
pub const INTEGRITY_EXIT_CODE: i32 = 39;

/// The child exit code when `execve` of the user command itself failed.
pub const EXEC_EXIT_CODE: i32 = 48;

/// An error in the Joblet core.
///
/// The variants mirror the operational error kinds the daemon reports:
/// validation problems are surfaced to the submitting client unchanged,
/// while the remaining kinds are recorded on the job and logged.
#[derive(Debug, Error)]
pub enum Error {
    /// A bad specification, unknown runtime, or missing volume at submit
    /// time. No state was changed.
    #[error("validation error: {0}")]
    Validation(String),

    /// Cgroup creation, mounting, or chroot failed while preparing the
    /// sandbox.
    #[error("sandbox setup failed during {phase}: {message}")]
    Resource {
        /// The phase that failed.
        phase: SetupPhase,
        /// A description of the failing operation.
        message: String,
    },

    /// The child exited before reaching `execve`.
    #[error("the sandbox child exited before exec: {0}")]
    ChildExec(String),

    /// The user command exited non-zero or was killed by a signal.
    #[error("the job command failed ({})", describe_exit(.exit_code, .signal))]
    Runtime {
        /// The exit code, when the command exited on its own.
        exit_code: Option<i32>,
        /// The terminating signal, when the command was killed.
        signal: Option<i32>,
    },

    /// The kernel OOM killer terminated the job.
    #[error("the job exceeded its memory limit and was killed by the kernel OOM killer")]
    OomKill,

    /// The host denied an isolation feature (cgroup controller missing,
    /// namespace unsupported).
    #[error("host policy error: {0}")]
    Policy(String),

    /// A sandbox safety check failed; the child refused to proceed.
    #[error("sandbox integrity check failed: {0}")]
    Integrity(String),

    /// A workflow dependency is provably unsatisfiable.
    #[error("requirement `{requirement}` of job `{job}` can never be satisfied")]
    WorkflowImpossible {
        /// The name of the dependent job.
        job: String,
        /// The unsatisfiable requirement, rendered.
        requirement: String,
    },
}

/// Describes a command exit for the `Runtime` error display.
fn describe_exit(exit_code: &Option<i32>, signal: &Option<i32>) -> String {
    match (*exit_code, *signal) {
        (Some(code), _) => format!("exit code {code}"),
        (None, Some(signal)) => format!("signal {signal}"),
        (None, None) => "unknown termination".to_string(),
    }
}

impl Error {
    /// Creates a validation error.
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation(message.into())
    }

    /// Creates a resource error for the given setup phase.
    pub fn resource(phase: SetupPhase, message: impl Into<String>) -> Self {
        Self::Resource {
            phase,
            message: message.into(),
        }
    }

    /// Determines if the error should be surfaced to the submitting client
    /// rather than recorded on a job.
    pub fn is_validation(&self) -> bool {
        matches!(self, Self::Validation(_))
    }
}

/// A result type using the shared [`Error`].
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn setup_phase_exit_codes_are_distinct() {
        let mut seen = std::collections::HashSet::new();
        for phase in SetupPhase::ALL {
            assert!(seen.insert(phase.exit_code()));
            assert_eq!(SetupPhase::from_exit_code(phase.exit_code()), Some(*phase));
        }

        assert!(!seen.contains(&INTEGRITY_EXIT_CODE));
        assert!(!seen.contains(&EXEC_EXIT_CODE));
        assert_eq!(SetupPhase::from_exit_code(0), None);
        assert_eq!(SetupPhase::from_exit_code(1), None);
    }

    #[test]
    fn runtime_error_display() {
        let err = Error::Runtime {
            exit_code: Some(2),
            signal: None,
        };
        assert_eq!(err.to_string(), "the job command failed (exit code 2)");

        let err = Error::Runtime {
            exit_code: None,
            signal: Some(9),
        };
        assert_eq!(err.to_string(), "the job command failed (signal 9)");
    }
}

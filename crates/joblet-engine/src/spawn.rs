//! The two-phase sandbox spawn protocol.
//!
//! The parent clones a child directly into new namespaces, immediately
//! enrolls the child PID into the job's cgroup, and only then releases the
//! child through a synchronisation pipe. The child stays blocked on that
//! pipe until enrolment is complete, so its first user-space instruction
//! executes under the cgroup's limits. Once released, the child execs
//! `/proc/self/exe sandbox-init <spec>` to become the sandbox init
//! process.
//!
//! The clone callback runs in the child between `clone` and `execve`: it
//! performs only raw fd syscalls on pre-prepared values. No allocation,
//! no locks.

use std::ffi::CString;
use std::fs::File;
use std::io;
use std::io::Read as _;
use std::os::fd::AsRawFd;
use std::os::fd::OwnedFd;
use std::path::Path;
use std::pin::Pin;
use std::task::Context as TaskContext;
use std::task::Poll;

use anyhow::Context;
use anyhow::Result;
use futures::ready;
use nix::sched::CloneFlags;
use nix::sys::signal::Signal;
use nix::sys::wait::WaitStatus;
use nix::sys::wait::waitpid;
use nix::unistd::Pid;
use nix::unistd::pipe;
use tokio::io::AsyncRead;
use tokio::io::ReadBuf;
use tokio::io::unix::AsyncFd;
use tracing::debug;

use joblet_core::JobId;

use crate::init::JOB_ID_ENV_VAR;

/// The size of the stack given to the cloned child.
///
/// The child only dup2s fds, blocks on the sync pipe, and execs.
const CHILD_STACK_SIZE: usize = 256 * 1024;

/// The exit code the child uses when the re-exec of the daemon binary
/// itself fails.
const REEXEC_FAILED_EXIT_CODE: isize = 126;

/// The exit code the child uses when the parent disappears before
/// releasing it.
const ORPHANED_EXIT_CODE: isize = 125;

/// How a sandbox child terminated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitKind {
    /// The child exited on its own with the given code.
    Exited(i32),
    /// The child was terminated by the given signal.
    Signaled(i32),
}

/// Computes the namespace flags for a job.
///
/// PID, mount, IPC, and UTS namespaces are always unshared. The network
/// namespace is kept only for host networking, and user namespaces are
/// opt-in via configuration.
pub fn clone_flags(network_isolated: bool, user_namespaces: bool) -> CloneFlags {
    let mut flags = CloneFlags::CLONE_NEWPID
        | CloneFlags::CLONE_NEWNS
        | CloneFlags::CLONE_NEWIPC
        | CloneFlags::CLONE_NEWUTS;

    if network_isolated {
        flags |= CloneFlags::CLONE_NEWNET;
    }

    if user_namespaces {
        flags |= CloneFlags::CLONE_NEWUSER;
    }

    flags
}

/// An async reader over one of the child's output pipes.
///
/// Wraps the raw, non-blocking read end so tokio can pump it.
#[derive(Debug)]
pub struct ChildOutput(AsyncFd<File>);

impl ChildOutput {
    /// Wraps the read end of a pipe, making it non-blocking.
    fn new(fd: OwnedFd) -> Result<Self> {
        if unsafe { libc::fcntl(fd.as_raw_fd(), libc::F_SETFL, libc::O_NONBLOCK) } == -1 {
            return Err(io::Error::last_os_error())
                .context("failed to make a child output pipe non-blocking");
        }

        Ok(Self(
            AsyncFd::new(File::from(fd)).context("failed to register a child output pipe")?,
        ))
    }
}

impl AsyncRead for ChildOutput {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut TaskContext<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        loop {
            let mut guard = ready!(self.0.poll_read_ready(cx))?;

            let unfilled = buf.initialize_unfilled();
            match guard.try_io(|inner| inner.get_ref().read(unfilled)) {
                Ok(Ok(len)) => {
                    buf.advance(len);
                    return Poll::Ready(Ok(()));
                }
                Ok(Err(err)) => return Poll::Ready(Err(err)),
                Err(_would_block) => continue,
            }
        }
    }
}

/// A cloned sandbox child that has not been released yet.
///
/// The caller enrolls `pid` into the job's cgroup and then calls
/// [`release`][Self::release]; dropping the handle without releasing
/// leaves the child blocked until the sync pipe closes, upon which it
/// exits without exec'ing anything.
#[derive(Debug)]
pub struct SpawnedChild {
    /// The child PID in the parent's namespace.
    pub pid: Pid,
    /// The child's stdout pipe.
    pub stdout: ChildOutput,
    /// The child's stderr pipe.
    pub stderr: ChildOutput,
    /// The write end of the synchronisation pipe.
    sync: OwnedFd,
}

impl SpawnedChild {
    /// Releases the child to continue into sandbox setup.
    ///
    /// Called only after the child PID is enrolled in its cgroup.
    pub fn release(self) -> Result<(Pid, ChildOutput, ChildOutput)> {
        nix::unistd::write(&self.sync, &[1u8]).context("failed to release the sandbox child")?;
        // Dropping the write end closes the pipe; the child has its byte.
        Ok((self.pid, self.stdout, self.stderr))
    }
}

/// Clones the sandbox child for a job.
///
/// The child is created directly inside the new namespaces and blocks on
/// the sync pipe; on release it execs `/proc/self/exe sandbox-init
/// <spec-path>` with `JOBLET_JOB_ID` as its only environment.
pub fn spawn_sandbox_child(
    id: JobId,
    spec_path: &Path,
    flags: CloneFlags,
) -> Result<SpawnedChild> {
    let (stdout_rd, stdout_wr) = pipe().context("failed to create the stdout pipe")?;
    let (stderr_rd, stderr_wr) = pipe().context("failed to create the stderr pipe")?;
    let (sync_rd, sync_wr) = pipe().context("failed to create the sync pipe")?;

    // Everything the child touches is prepared before the clone.
    let exe = CString::new("/proc/self/exe").expect("static string has no NUL");
    let argv = [
        CString::new("joblet").expect("static string has no NUL"),
        CString::new("sandbox-init").expect("static string has no NUL"),
        CString::new(spec_path.as_os_str().as_encoded_bytes())
            .context("spawn specification path contains a NUL byte")?,
    ];
    let envp = [CString::new(format!("{JOB_ID_ENV_VAR}={id}"))
        .expect("job ids contain no NUL bytes")];

    let stdout_wr_fd = stdout_wr.as_raw_fd();
    let stderr_wr_fd = stderr_wr.as_raw_fd();
    let sync_rd_fd = sync_rd.as_raw_fd();

    let mut stack = vec![0u8; CHILD_STACK_SIZE];
    let callback = {
        let exe = exe.clone();
        let argv = argv.clone();
        let envp = envp.clone();
        move || {
            // Raw syscalls only: the child shares no locks with the
            // parent's other threads, so anything that could take one
            // (allocation included) may deadlock.
            unsafe {
                libc::dup2(stdout_wr_fd, libc::STDOUT_FILENO);
                libc::dup2(stderr_wr_fd, libc::STDERR_FILENO);
            }

            let mut buf = [0u8; 1];
            let n = unsafe { libc::read(sync_rd_fd, buf.as_mut_ptr().cast(), 1) };
            if n != 1 {
                // The parent died before releasing us.
                return ORPHANED_EXIT_CODE;
            }

            let _ = nix::unistd::execve(&exe, &argv, &envp);
            REEXEC_FAILED_EXIT_CODE
        }
    };

    // SAFETY: the callback confines itself to async-signal-safe
    // operations on values prepared before the clone.
    let pid = unsafe {
        nix::sched::clone(
            Box::new(callback),
            &mut stack,
            flags,
            Some(Signal::SIGCHLD as i32),
        )
    }
    .context("failed to clone the sandbox child")?;

    debug!(job = %id, %pid, "cloned sandbox child");

    // The parent keeps only its own ends.
    drop(stdout_wr);
    drop(stderr_wr);
    drop(sync_rd);

    Ok(SpawnedChild {
        pid,
        stdout: ChildOutput::new(stdout_rd)?,
        stderr: ChildOutput::new(stderr_rd)?,
        sync: sync_wr,
    })
}

/// Waits for a sandbox child to terminate.
pub async fn wait_child(pid: Pid) -> Result<ExitKind> {
    let status = tokio::task::spawn_blocking(move || waitpid(pid, None))
        .await
        .context("the child wait task failed")?
        .with_context(|| format!("failed to wait for sandbox child {pid}"))?;

    match status {
        WaitStatus::Exited(_, code) => Ok(ExitKind::Exited(code)),
        WaitStatus::Signaled(_, signal, _) => Ok(ExitKind::Signaled(signal as i32)),
        other => anyhow::bail!("unexpected wait status for sandbox child {pid}: {other:?}"),
    }
}

#[cfg(test)]
mod test {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn flags_always_include_the_core_namespaces() {
        for (network, user) in [(false, false), (true, false), (false, true), (true, true)] {
            let flags = clone_flags(network, user);
            assert!(flags.contains(CloneFlags::CLONE_NEWPID));
            assert!(flags.contains(CloneFlags::CLONE_NEWNS));
            assert!(flags.contains(CloneFlags::CLONE_NEWIPC));
            assert!(flags.contains(CloneFlags::CLONE_NEWUTS));
            assert_eq!(flags.contains(CloneFlags::CLONE_NEWNET), network);
            assert_eq!(flags.contains(CloneFlags::CLONE_NEWUSER), user);
        }
    }
}

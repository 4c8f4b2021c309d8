//! Implementation of the cgroup v2 controller.
//!
//! Every job gets one scope directory under the joblet slice. The scope is
//! created and fully limited before the sandbox child process exists, so
//! the child is born inside the constrained cgroup and a fork bomb cannot
//! escape the PID limit during its first microseconds.

use std::fs;
use std::io;
use std::path::Path;
use std::path::PathBuf;
use std::time::Duration;
use std::time::Instant;

use anyhow::Context;
use anyhow::Result;
use nix::sys::signal::Signal;
use nix::sys::signal::kill;
use nix::unistd::Pid;
use tracing::debug;
use tracing::warn;

use joblet_core::JobId;
use joblet_core::ResourceLimits;

use crate::config::CgroupConfig;

/// The initial interval used when polling `cgroup.procs` during destroy.
const DESTROY_POLL_INITIAL: Duration = Duration::from_millis(10);

/// The maximum interval between `cgroup.procs` polls during destroy.
const DESTROY_POLL_MAX: Duration = Duration::from_millis(500);

/// Formats the `cpu.max` value for a CPU percentage.
///
/// A percentage of 100 grants one full core for the period.
fn cpu_max_value(percent: u32, period_us: u64) -> String {
    let quota = (period_us * u64::from(percent)) / 100;
    format!("{quota} {period_us}")
}

/// Formats the `io.max` value for one device.
///
/// The same throughput cap is applied to reads and writes.
fn io_max_value(device: &str, bps: u64) -> String {
    format!("{device} rbps={bps} wbps={bps}")
}

/// Parses the `oom_kill` counter out of a `memory.events` file's contents.
fn parse_oom_kill(events: &str) -> u64 {
    events
        .lines()
        .find_map(|line| line.strip_prefix("oom_kill "))
        .and_then(|count| count.trim().parse().ok())
        .unwrap_or(0)
}

/// Parses an `io.stat` file's contents into total read and write bytes
/// across all devices.
fn parse_io_stat(stat: &str) -> (u64, u64) {
    let mut read = 0;
    let mut written = 0;
    for line in stat.lines() {
        for field in line.split_whitespace().skip(1) {
            if let Some(bytes) = field.strip_prefix("rbytes=") {
                read += bytes.parse().unwrap_or(0);
            } else if let Some(bytes) = field.strip_prefix("wbytes=") {
                written += bytes.parse().unwrap_or(0);
            }
        }
    }
    (read, written)
}

/// A cgroup v2 scope owned by a single job.
#[derive(Debug)]
pub struct JobCgroup {
    /// The job the scope belongs to.
    id: JobId,
    /// The scope directory.
    dir: PathBuf,
}

impl JobCgroup {
    /// Creates the scope directory for a job and applies its resource
    /// limits.
    ///
    /// The parent slice directory is created if it does not exist yet.
    /// Limit writes that the host kernel rejects (e.g. a controller not
    /// enabled in the slice) fail the creation; the caller reports this as
    /// a policy error.
    pub fn create(config: &CgroupConfig, id: JobId, limits: &ResourceLimits) -> Result<Self> {
        let slice = config.slice_dir();
        fs::create_dir_all(&slice).with_context(|| {
            format!("failed to create cgroup slice `{path}`", path = slice.display())
        })?;

        let dir = config.scope_dir(id);
        fs::create_dir(&dir).with_context(|| {
            format!("failed to create cgroup scope `{path}`", path = dir.display())
        })?;

        let cgroup = Self { id, dir };
        if let Err(e) = cgroup.apply_limits(config, limits) {
            // Leave no empty scope behind when limit writes fail.
            let _ = fs::remove_dir(&cgroup.dir);
            return Err(e);
        }

        debug!(job = %id, path = %cgroup.dir.display(), "created cgroup scope");
        Ok(cgroup)
    }

    /// Opens an existing scope directory for a job.
    ///
    /// Used by the teardown path when the creating handle is gone.
    pub fn open(config: &CgroupConfig, id: JobId) -> Self {
        Self {
            id,
            dir: config.scope_dir(id),
        }
    }

    /// Gets the scope directory.
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Writes the job's resource limits into the scope's controller files.
    fn apply_limits(&self, config: &CgroupConfig, limits: &ResourceLimits) -> Result<()> {
        if let Some(percent) = limits.max_cpu_percent {
            self.write_file("cpu.max", &cpu_max_value(percent, config.cpu_period_us))?;
        }

        if let Some(bytes) = limits.max_memory_bytes {
            self.write_file("memory.max", &bytes.to_string())?;
            // Swap would let the job spill past its memory limit.
            self.write_file("memory.swap.max", "0")?;
        }

        if let Some(bps) = limits.max_io_bps {
            for device in &config.io_devices {
                self.write_file("io.max", &io_max_value(device, bps))?;
            }
        }

        if let Some(pids) = limits.max_pids {
            self.write_file("pids.max", &pids.to_string())?;
        }

        if let Some(cores) = &limits.cpu_cores {
            self.write_file("cpuset.cpus", cores)?;
        }

        Ok(())
    }

    /// Enrolls a process into the scope.
    pub fn enroll(&self, pid: Pid) -> Result<()> {
        self.write_file("cgroup.procs", &pid.as_raw().to_string())
            .with_context(|| format!("failed to enroll pid {pid} in cgroup for job {id}", id = self.id))
    }

    /// Reads the PIDs currently in the scope.
    pub fn procs(&self) -> io::Result<Vec<Pid>> {
        let contents = fs::read_to_string(self.dir.join("cgroup.procs"))?;
        Ok(contents
            .lines()
            .filter_map(|line| line.trim().parse().ok())
            .map(Pid::from_raw)
            .collect())
    }

    /// Determines if the kernel OOM killer has fired inside the scope.
    pub fn oom_killed(&self) -> bool {
        fs::read_to_string(self.dir.join("memory.events"))
            .map(|events| parse_oom_kill(&events) > 0)
            .unwrap_or(false)
    }

    /// Reads the current resident memory of the scope, in bytes.
    pub fn memory_current(&self) -> io::Result<u64> {
        self.read_counter("memory.current")
    }

    /// Reads the cumulative CPU usage of the scope, in microseconds.
    pub fn cpu_usage_usec(&self) -> io::Result<u64> {
        let stat = fs::read_to_string(self.dir.join("cpu.stat"))?;
        Ok(stat
            .lines()
            .find_map(|line| line.strip_prefix("usage_usec "))
            .and_then(|v| v.trim().parse().ok())
            .unwrap_or(0))
    }

    /// Reads the current PID count of the scope.
    pub fn pids_current(&self) -> io::Result<u64> {
        self.read_counter("pids.current")
    }

    /// Reads the cumulative block I/O of the scope, in bytes, as a
    /// `(read, written)` pair summed across devices.
    pub fn io_bytes(&self) -> io::Result<(u64, u64)> {
        let stat = fs::read_to_string(self.dir.join("io.stat"))?;
        Ok(parse_io_stat(&stat))
    }

    /// Signals every process in the scope.
    ///
    /// `SIGKILL` uses the kernel's `cgroup.kill` when available, which
    /// atomically kills the whole scope; other signals (and kernels
    /// without `cgroup.kill`) iterate `cgroup.procs`.
    pub fn signal_all(&self, signal: Signal) -> Result<()> {
        if signal == Signal::SIGKILL && self.write_file("cgroup.kill", "1").is_ok() {
            return Ok(());
        }

        let procs = self
            .procs()
            .with_context(|| format!("failed to read cgroup.procs for job {id}", id = self.id))?;
        for pid in procs {
            if let Err(e) = kill(pid, signal) {
                // The process may have exited between the read and the kill.
                debug!(job = %self.id, %pid, %signal, error = %e, "failed to signal job process");
            }
        }

        Ok(())
    }

    /// Destroys the scope.
    ///
    /// Waits for `cgroup.procs` to drain, polling with exponential
    /// backoff. If processes survive past the grace period they are
    /// killed, and once the scope is empty its directory is removed.
    pub async fn destroy(&self, grace: Duration) -> Result<()> {
        let deadline = Instant::now() + grace;
        let mut interval = DESTROY_POLL_INITIAL;
        let mut killed = false;

        loop {
            match self.procs() {
                Ok(procs) if procs.is_empty() => break,
                Ok(procs) => {
                    if Instant::now() >= deadline && !killed {
                        warn!(
                            job = %self.id,
                            survivors = procs.len(),
                            "cgroup did not drain within the grace period; killing survivors"
                        );
                        self.signal_all(Signal::SIGKILL)?;
                        killed = true;
                    }
                }
                // The scope directory is already gone.
                Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(()),
                Err(e) => {
                    return Err(e).with_context(|| {
                        format!("failed to poll cgroup.procs for job {id}", id = self.id)
                    });
                }
            }

            tokio::time::sleep(interval).await;
            interval = (interval * 2).min(DESTROY_POLL_MAX);
        }

        fs::remove_dir(&self.dir).with_context(|| {
            format!(
                "failed to remove cgroup scope `{path}`",
                path = self.dir.display()
            )
        })?;

        debug!(job = %self.id, "destroyed cgroup scope");
        Ok(())
    }

    /// Writes a value into one of the scope's controller files.
    fn write_file(&self, name: &str, value: &str) -> Result<()> {
        let path = self.dir.join(name);
        fs::write(&path, value).with_context(|| {
            format!(
                "failed to write `{value}` to `{path}`",
                path = path.display()
            )
        })
    }

    /// Reads a single-integer controller file.
    fn read_counter(&self, name: &str) -> io::Result<u64> {
        let contents = fs::read_to_string(self.dir.join(name))?;
        contents
            .trim()
            .parse()
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
    }
}

#[cfg(test)]
mod test {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn cpu_max_scales_with_percentage() {
        assert_eq!(cpu_max_value(100, 100_000), "100000 100000");
        assert_eq!(cpu_max_value(50, 100_000), "50000 100000");
        // Above 100 grants more than one core.
        assert_eq!(cpu_max_value(250, 100_000), "250000 100000");
    }

    #[test]
    fn io_max_caps_reads_and_writes() {
        assert_eq!(
            io_max_value("8:0", 1_048_576),
            "8:0 rbps=1048576 wbps=1048576"
        );
    }

    #[test]
    fn oom_kill_counter_is_parsed() {
        assert_eq!(parse_oom_kill("low 0\nhigh 0\nmax 12\noom 1\noom_kill 1\n"), 1);
        assert_eq!(parse_oom_kill("oom 0\noom_kill 0\n"), 0);
        assert_eq!(parse_oom_kill(""), 0);
    }

    #[test]
    fn io_stat_sums_across_devices() {
        let stat = "\
8:0 rbytes=1024 wbytes=2048 rios=10 wios=20 dbytes=0 dios=0
259:0 rbytes=512 wbytes=0 rios=1 wios=0 dbytes=0 dios=0
";
        assert_eq!(parse_io_stat(stat), (1536, 2048));
        assert_eq!(parse_io_stat(""), (0, 0));
    }
}

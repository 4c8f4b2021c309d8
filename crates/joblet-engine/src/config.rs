//! Implementation of engine configuration.

use std::path::Path;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::Result;
use anyhow::bail;
use serde::Deserialize;
use serde::Serialize;

use joblet_core::JobId;

/// The default base directory for per-job sandbox roots.
const DEFAULT_JOBS_DIR: &str = "/opt/joblet/jobs";

/// The default base directory for named volumes.
const DEFAULT_VOLUMES_DIR: &str = "/opt/joblet/volumes";

/// The default base directory for installed runtimes.
const DEFAULT_RUNTIMES_DIR: &str = "/opt/joblet/runtimes";

/// The default state directory (persistence socket and friends).
const DEFAULT_STATE_DIR: &str = "/var/run/joblet";

/// The cgroup v2 slice all job scopes live under.
pub const CGROUP_SLICE: &str = "joblet.slice";

/// Host directories bind-mounted read-only into every sandbox by default.
const DEFAULT_ALLOWED_HOST_PATHS: &[&str] = &[
    "/bin",
    "/sbin",
    "/lib",
    "/lib64",
    "/usr/bin",
    "/usr/sbin",
    "/usr/lib",
    "/usr/lib64",
    "/usr/share",
    "/etc/ssl",
    "/etc/alternatives",
];

/// Represents the engine configuration.
#[derive(Debug, Default, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", deny_unknown_fields)]
pub struct Config {
    /// Sandbox construction configuration.
    #[serde(default)]
    pub sandbox: SandboxConfig,
    /// Cgroup controller configuration.
    #[serde(default)]
    pub cgroup: CgroupConfig,
    /// Runtime composer configuration.
    #[serde(default)]
    pub runtimes: RuntimeConfig,
    /// Volume manager configuration.
    #[serde(default)]
    pub volumes: VolumeConfig,
    /// Log and metric fan-out configuration.
    #[serde(default)]
    pub events: EventsConfig,
    /// Persistence sink configuration.
    #[serde(default)]
    pub persistence: PersistenceConfig,
    /// Job lifecycle timing configuration.
    #[serde(default)]
    pub lifecycle: LifecycleConfig,
}

impl Config {
    /// Validates the configuration.
    pub fn validate(&self) -> Result<()> {
        self.sandbox.validate()?;
        self.cgroup.validate()?;
        self.events.validate()?;
        self.persistence.validate()?;
        Ok(())
    }

    /// Gets the sandbox root directory for a job.
    ///
    /// This directory becomes `/` inside the sandbox.
    pub fn job_root(&self, id: JobId) -> PathBuf {
        self.sandbox.jobs_dir.join(id.to_string())
    }

    /// Gets the host-side scratch directory for a job.
    pub fn job_tmp(&self, id: JobId) -> PathBuf {
        self.job_root(id).join("tmp")
    }

    /// Gets the host-side upload FIFO directory for a job.
    pub fn job_pipes(&self, id: JobId) -> PathBuf {
        self.job_root(id).join("pipes")
    }

    /// Gets the path of the spawn specification handed to the re-exec'd
    /// sandbox init process.
    pub fn job_spawn_spec(&self, id: JobId) -> PathBuf {
        self.sandbox.jobs_dir.join(format!("{id}.spawn.json"))
    }
}

/// Represents sandbox construction configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", deny_unknown_fields)]
pub struct SandboxConfig {
    /// The base directory under which per-job sandbox roots are created.
    #[serde(default = "default_jobs_dir")]
    pub jobs_dir: PathBuf,
    /// Host directories bind-mounted read-only into every sandbox.
    ///
    /// Missing entries are skipped; individual mount failures are logged
    /// and do not abort setup.
    #[serde(default = "default_allowed_host_paths")]
    pub allowed_host_paths: Vec<PathBuf>,
    /// The DNS servers written to the sandbox `/etc/resolv.conf`.
    #[serde(default = "default_dns_servers")]
    pub dns_servers: Vec<String>,
    /// The size of the tmpfs mounted on `/work` when a job has neither
    /// volumes nor uploads, in bytes.
    #[serde(default = "default_work_tmpfs_bytes")]
    pub work_tmpfs_bytes: u64,
    /// Whether to unshare a user namespace for each job.
    #[serde(default)]
    pub user_namespaces: bool,
    /// Host directories bind-mounted read-only for GPU jobs (CUDA
    /// toolkit and driver libraries).
    #[serde(default)]
    pub cuda_paths: Vec<PathBuf>,
    /// The number of GPU device nodes available for allocation.
    #[serde(default)]
    pub gpu_count: u32,
}

impl SandboxConfig {
    /// Validates the sandbox configuration.
    fn validate(&self) -> Result<()> {
        if !self.jobs_dir.is_absolute() {
            bail!(
                "sandbox jobs directory `{dir}` must be an absolute path",
                dir = self.jobs_dir.display()
            );
        }

        if self.work_tmpfs_bytes == 0 {
            bail!("sandbox work tmpfs size must be greater than zero");
        }

        Ok(())
    }
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            jobs_dir: default_jobs_dir(),
            allowed_host_paths: default_allowed_host_paths(),
            dns_servers: default_dns_servers(),
            work_tmpfs_bytes: default_work_tmpfs_bytes(),
            user_namespaces: false,
            cuda_paths: Vec::new(),
            gpu_count: 0,
        }
    }
}

/// Represents cgroup controller configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", deny_unknown_fields)]
pub struct CgroupConfig {
    /// The cgroup v2 filesystem mount point.
    #[serde(default = "default_cgroup_mount")]
    pub mount_point: PathBuf,
    /// The block devices (`major:minor`) that `io.max` limits apply to.
    #[serde(default)]
    pub io_devices: Vec<String>,
    /// The CPU period used when deriving `cpu.max` from a percentage, in
    /// microseconds.
    #[serde(default = "default_cpu_period_us")]
    pub cpu_period_us: u64,
}

impl CgroupConfig {
    /// Validates the cgroup configuration.
    fn validate(&self) -> Result<()> {
        if self.cpu_period_us == 0 {
            bail!("cgroup CPU period must be greater than zero");
        }

        for device in &self.io_devices {
            if device.split(':').count() != 2 {
                bail!("cgroup io device `{device}` is not in `major:minor` form");
            }
        }

        Ok(())
    }

    /// Gets the directory of the joblet slice.
    pub fn slice_dir(&self) -> PathBuf {
        self.mount_point.join(CGROUP_SLICE)
    }

    /// Gets the scope directory for a job.
    pub fn scope_dir(&self, id: JobId) -> PathBuf {
        self.slice_dir().join(format!("joblet-{id}.scope"))
    }
}

impl Default for CgroupConfig {
    fn default() -> Self {
        Self {
            mount_point: default_cgroup_mount(),
            io_devices: Vec::new(),
            cpu_period_us: default_cpu_period_us(),
        }
    }
}

/// Represents runtime composer configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", deny_unknown_fields)]
pub struct RuntimeConfig {
    /// The base directory runtimes are installed under.
    #[serde(default = "default_runtimes_dir")]
    pub base_dir: PathBuf,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            base_dir: default_runtimes_dir(),
        }
    }
}

/// Represents volume manager configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", deny_unknown_fields)]
pub struct VolumeConfig {
    /// The base directory named volumes are created under.
    #[serde(default = "default_volumes_dir")]
    pub base_dir: PathBuf,
}

impl Default for VolumeConfig {
    fn default() -> Self {
        Self {
            base_dir: default_volumes_dir(),
        }
    }
}

/// Represents log and metric fan-out configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", deny_unknown_fields)]
pub struct EventsConfig {
    /// The capacity of the in-memory tail ring kept per output stream, in
    /// bytes.
    #[serde(default = "default_ring_bytes")]
    pub ring_bytes: usize,
    /// The capacity of the live subscriber broadcast channel, in records.
    #[serde(default = "default_channel_capacity")]
    pub channel_capacity: usize,
    /// The interval between resource samples for running jobs.
    #[serde(default = "default_sample_interval", with = "duration_secs")]
    pub sample_interval: Duration,
}

impl EventsConfig {
    /// Validates the events configuration.
    fn validate(&self) -> Result<()> {
        if self.ring_bytes == 0 {
            bail!("events ring capacity must be greater than zero");
        }

        if self.channel_capacity == 0 {
            bail!("events channel capacity must be greater than zero");
        }

        Ok(())
    }
}

impl Default for EventsConfig {
    fn default() -> Self {
        Self {
            ring_bytes: default_ring_bytes(),
            channel_capacity: default_channel_capacity(),
            sample_interval: default_sample_interval(),
        }
    }
}

/// Represents persistence sink configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", deny_unknown_fields)]
pub struct PersistenceConfig {
    /// The path of the persistence daemon's Unix socket.
    #[serde(default = "default_persist_socket")]
    pub socket_path: PathBuf,
    /// The maximum number of records batched into one socket write.
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    /// The timeout applied to each socket write.
    #[serde(default = "default_write_timeout", with = "duration_secs")]
    pub write_timeout: Duration,
    /// The maximum number of records buffered while the socket is slow;
    /// the oldest record is dropped when the buffer is full.
    #[serde(default = "default_buffer_records")]
    pub buffer_records: usize,
}

impl PersistenceConfig {
    /// Validates the persistence configuration.
    fn validate(&self) -> Result<()> {
        if self.batch_size == 0 {
            bail!("persistence batch size must be greater than zero");
        }

        if self.buffer_records < self.batch_size {
            bail!(
                "persistence buffer ({buffer} records) must hold at least one batch \
                 ({batch} records)",
                buffer = self.buffer_records,
                batch = self.batch_size
            );
        }

        Ok(())
    }
}

impl Default for PersistenceConfig {
    fn default() -> Self {
        Self {
            socket_path: default_persist_socket(),
            batch_size: default_batch_size(),
            write_timeout: default_write_timeout(),
            buffer_records: default_buffer_records(),
        }
    }
}

/// Represents job lifecycle timing configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", deny_unknown_fields)]
pub struct LifecycleConfig {
    /// The grace period between `SIGTERM` and `SIGKILL` when stopping a
    /// job.
    #[serde(default = "default_stop_grace", with = "duration_secs")]
    pub stop_grace: Duration,
    /// The grace period allowed for a job's cgroup to drain before the
    /// survivors are killed.
    #[serde(default = "default_destroy_grace", with = "duration_secs")]
    pub cgroup_destroy_grace: Duration,
    /// The total time allowed for all of a job's uploads to materialise.
    #[serde(default = "default_upload_timeout", with = "duration_secs")]
    pub upload_timeout: Duration,
    /// The optional wall-clock limit applied to every job.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_wall_clock_secs: Option<u64>,
}

impl Default for LifecycleConfig {
    fn default() -> Self {
        Self {
            stop_grace: default_stop_grace(),
            cgroup_destroy_grace: default_destroy_grace(),
            upload_timeout: default_upload_timeout(),
            max_wall_clock_secs: None,
        }
    }
}

/// Serde adapter for durations expressed in whole seconds.
mod duration_secs {
    use std::time::Duration;

    use serde::Deserialize;
    use serde::Deserializer;
    use serde::Serializer;

    /// Serializes a duration as whole seconds.
    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_u64(duration.as_secs())
    }

    /// Deserializes a duration from whole seconds.
    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        Ok(Duration::from_secs(u64::deserialize(deserializer)?))
    }
}

/// Returns the default jobs directory.
fn default_jobs_dir() -> PathBuf {
    PathBuf::from(DEFAULT_JOBS_DIR)
}

/// Returns the default allowed host paths.
fn default_allowed_host_paths() -> Vec<PathBuf> {
    DEFAULT_ALLOWED_HOST_PATHS
        .iter()
        .map(PathBuf::from)
        .collect()
}

/// Returns the default DNS servers.
fn default_dns_servers() -> Vec<String> {
    vec!["1.1.1.1".to_string(), "8.8.8.8".to_string()]
}

/// Returns the default work tmpfs size (1 MiB).
fn default_work_tmpfs_bytes() -> u64 {
    1 << 20
}

/// Returns the default cgroup v2 mount point.
fn default_cgroup_mount() -> PathBuf {
    PathBuf::from("/sys/fs/cgroup")
}

/// Returns the default CPU period (100ms, the kernel default).
fn default_cpu_period_us() -> u64 {
    100_000
}

/// Returns the default runtimes directory.
fn default_runtimes_dir() -> PathBuf {
    PathBuf::from(DEFAULT_RUNTIMES_DIR)
}

/// Returns the default volumes directory.
fn default_volumes_dir() -> PathBuf {
    PathBuf::from(DEFAULT_VOLUMES_DIR)
}

/// Returns the default per-stream ring capacity (64 KiB).
fn default_ring_bytes() -> usize {
    64 << 10
}

/// Returns the default broadcast channel capacity.
fn default_channel_capacity() -> usize {
    2048
}

/// Returns the default resource sample interval.
fn default_sample_interval() -> Duration {
    Duration::from_secs(5)
}

/// Returns the default persistence socket path.
fn default_persist_socket() -> PathBuf {
    Path::new(DEFAULT_STATE_DIR).join("joblet-persist.sock")
}

/// Returns the default persistence batch size.
fn default_batch_size() -> usize {
    100
}

/// Returns the default persistence write timeout.
fn default_write_timeout() -> Duration {
    Duration::from_secs(5)
}

/// Returns the default persistence buffer capacity.
fn default_buffer_records() -> usize {
    10_000
}

/// Returns the default stop grace period.
fn default_stop_grace() -> Duration {
    Duration::from_secs(10)
}

/// Returns the default cgroup destroy grace period.
fn default_destroy_grace() -> Duration {
    Duration::from_secs(5)
}

/// Returns the default upload materialisation timeout.
fn default_upload_timeout() -> Duration {
    Duration::from_secs(300)
}

#[cfg(test)]
mod test {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn default_config_is_valid() {
        let config = Config::default();
        config.validate().expect("default config should validate");
        assert_eq!(config.persistence.batch_size, 100);
        assert_eq!(config.events.ring_bytes, 64 << 10);
    }

    #[test]
    fn job_paths_are_distinct_per_job() {
        let config = Config::default();
        let a = JobId::new();
        let b = JobId::new();
        assert_ne!(config.job_root(a), config.job_root(b));
        assert!(config.job_pipes(a).starts_with(config.job_root(a)));
        assert!(config.job_tmp(a).starts_with(config.job_root(a)));
    }

    #[test]
    fn scope_dir_embeds_the_job_id() {
        let config = CgroupConfig::default();
        let id = JobId::new();
        let scope = config.scope_dir(id);
        assert!(
            scope
                .to_str()
                .unwrap()
                .ends_with(&format!("joblet.slice/joblet-{id}.scope"))
        );
    }

    #[test]
    fn rejects_bad_io_device() {
        let config = CgroupConfig {
            io_devices: vec!["not-a-device".to_string()],
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn rejects_undersized_persistence_buffer() {
        let config = PersistenceConfig {
            buffer_records: 10,
            batch_size: 100,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }
}

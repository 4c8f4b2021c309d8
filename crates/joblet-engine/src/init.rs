//! The sandbox init entry.
//!
//! The daemon re-executes itself inside the cloned child as PID 1 of the
//! new namespaces (the hidden `sandbox-init` subcommand lands here). This
//! module finalises isolation — filesystem construction, upload
//! materialisation, environment computation — and then replaces itself
//! with the user command.
//!
//! Failures exit with distinct codes (see [`joblet_core::SetupPhase`]) so
//! the parent can map a child that died before `execve` back to the
//! failing phase.

use std::env;
use std::ffi::CString;
use std::fs;
use std::path::Path;
use std::path::PathBuf;
use std::process;

use indexmap::IndexMap;
use nix::unistd::execvp;
use nix::unistd::getpid;
use serde::Deserialize;
use serde::Serialize;

use joblet_core::EXEC_EXIT_CODE;
use joblet_core::INTEGRITY_EXIT_CODE;
use joblet_core::JobId;
use joblet_core::NetworkMode;
use joblet_core::SetupPhase;
use joblet_core::UploadSpec;

use crate::runtime::PATH_PREPEND_VAR;
use crate::runtime::RuntimeMount;
use crate::sandbox::Sandbox;
use crate::upload::SANDBOX_PIPES_DIR;
use crate::upload::materialise_uploads;
use crate::volume::VolumeMount;

/// The environment variable carrying the job id into the child.
///
/// The init entry refuses to run when it does not match the spawn
/// specification.
pub const JOB_ID_ENV_VAR: &str = "JOBLET_JOB_ID";

/// The default `PATH` inside a sandbox when the job supplies none.
const DEFAULT_PATH: &str = "/usr/local/bin:/usr/bin:/bin:/usr/sbin:/sbin";

/// Everything the re-exec'd init process needs to finalise isolation and
/// exec the user command.
///
/// The parent serialises this to `<jobs-dir>/<id>.spawn.json` before the
/// clone; the child loads it by the path passed as its sole argument.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", deny_unknown_fields)]
pub struct InitSpec {
    /// The job identifier.
    pub job_id: JobId,
    /// The command to exec.
    pub command: String,
    /// The argument vector, not including the command.
    pub args: Vec<String>,
    /// The fully computed environment (runtime environment merged into
    /// the job environment, `PATH` already resolved).
    pub env: IndexMap<String, String>,
    /// The sandbox root directory (host path until chroot).
    pub sandbox_root: PathBuf,
    /// The host-side scratch directory bound onto `/tmp`.
    pub tmp_dir: PathBuf,
    /// The host-side upload FIFO directory.
    pub pipes_dir: PathBuf,
    /// Host directories bind-mounted read-only into the sandbox.
    pub allowed_host_paths: Vec<PathBuf>,
    /// The DNS servers for the sandbox `resolv.conf`.
    pub dns_servers: Vec<String>,
    /// The planned runtime overlay mounts.
    pub runtime_mounts: Vec<RuntimeMount>,
    /// The planned volume mounts.
    pub volume_mounts: Vec<VolumeMount>,
    /// The upload descriptors to materialise before exec.
    pub uploads: Vec<UploadSpec>,
    /// The job's network mode.
    pub network: NetworkMode,
    /// The size of the `/work` tmpfs for jobs without volumes or uploads.
    pub work_tmpfs_bytes: u64,
    /// Whether the job is a runtime build job.
    pub builder: bool,
    /// The runtimes directory, mounted read-write for builder jobs.
    pub runtimes_dir: PathBuf,
    /// The allocated GPU device indexes.
    pub gpu_devices: Vec<u32>,
}

impl InitSpec {
    /// Loads a spawn specification from disk.
    pub fn load(path: &Path) -> std::io::Result<Self> {
        let contents = fs::read_to_string(path)?;
        serde_json::from_str(&contents)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))
    }

    /// Writes the spawn specification to disk.
    pub fn store(&self, path: &Path) -> std::io::Result<()> {
        let contents = serde_json::to_vec_pretty(self)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
        fs::write(path, contents)
    }
}

/// Computes the environment for the user command.
///
/// The runtime environment is merged underneath the job environment (the
/// job wins on conflicts). A runtime `PATH_PREPEND` entry is not exported
/// verbatim: its value is prepended to the effective `PATH`.
pub fn compute_environment(
    job_env: &IndexMap<String, String>,
    runtime_env: &IndexMap<String, String>,
) -> IndexMap<String, String> {
    let mut env: IndexMap<String, String> = runtime_env
        .iter()
        .filter(|(key, _)| *key != PATH_PREPEND_VAR)
        .map(|(key, value)| (key.clone(), value.clone()))
        .collect();

    for (key, value) in job_env {
        env.insert(key.clone(), value.clone());
    }

    let base_path = env
        .get("PATH")
        .cloned()
        .unwrap_or_else(|| DEFAULT_PATH.to_string());
    let path = match runtime_env.get(PATH_PREPEND_VAR) {
        Some(prepend) if !prepend.is_empty() => format!("{prepend}:{base_path}"),
        _ => base_path,
    };
    env.insert("PATH".to_string(), path);

    env
}

/// Verifies the init safety invariants.
///
/// The process must be PID 1 of its namespace (the clone happened) and
/// the `JOBLET_JOB_ID` environment variable must match the specification.
/// A mismatch means this process is not the sandbox child it believes it
/// is; proceeding could corrupt the host mount table.
fn integrity_check(spec: &InitSpec) -> Result<(), String> {
    if getpid().as_raw() != 1 {
        return Err(format!(
            "expected to be PID 1 of a new namespace, but running as PID {pid}",
            pid = getpid()
        ));
    }

    match env::var(JOB_ID_ENV_VAR) {
        Ok(id) if id == spec.job_id.to_string() => Ok(()),
        Ok(id) => Err(format!(
            "{JOB_ID_ENV_VAR} is `{id}` but the spawn specification is for job `{expected}`",
            expected = spec.job_id
        )),
        Err(_) => Err(format!("{JOB_ID_ENV_VAR} is not set")),
    }
}

/// Runs the sandbox init sequence and execs the user command.
///
/// Never returns: on success the process image is replaced; on failure
/// the process exits with a phase-distinct code. Diagnostics go to
/// stderr, which the parent captures on the job's error stream.
pub fn run(spec_path: &Path) -> ! {
    let spec = match InitSpec::load(spec_path) {
        Ok(spec) => spec,
        Err(e) => {
            eprintln!(
                "joblet-init: failed to load spawn specification `{path}`: {e}",
                path = spec_path.display()
            );
            process::exit(INTEGRITY_EXIT_CODE);
        }
    };

    if let Err(message) = integrity_check(&spec) {
        eprintln!("joblet-init: refusing to continue: {message}");
        process::exit(INTEGRITY_EXIT_CODE);
    }

    // The UTS and network namespaces are fresh; give the sandbox its own
    // identity and a working loopback. Neither is worth dying over.
    set_hostname(&spec.job_id);
    if spec.network.isolated() {
        if let Err(e) = bring_loopback_up() {
            eprintln!("joblet-init: failed to bring the loopback interface up: {e}");
        }
    }

    if let Err(e) = Sandbox::new(&spec).setup() {
        eprintln!("joblet-init: {e}");
        process::exit(e.phase.exit_code());
    }

    // All uploads materialise before exec; a stalled client blocks here,
    // which is exactly the back-pressure the pipe design intends.
    if !spec.uploads.is_empty() {
        let pipes = Path::new(SANDBOX_PIPES_DIR).join(spec.job_id.to_string());
        if let Err(e) = materialise_uploads(&pipes, &spec.uploads) {
            eprintln!("joblet-init: failed to materialise uploads: {e}");
            process::exit(SetupPhase::Uploads.exit_code());
        }
    }

    exec_command(&spec)
}

/// Sets the sandbox hostname to the job identifier.
fn set_hostname(id: &JobId) {
    if let Err(e) = nix::unistd::sethostname(id.to_string()) {
        eprintln!("joblet-init: failed to set the sandbox hostname: {e}");
    }
}

/// Brings the loopback interface up inside the fresh network namespace.
///
/// A new network namespace starts with `lo` present but down; jobs that
/// talk to themselves over `127.0.0.1` need it up before exec.
fn bring_loopback_up() -> std::io::Result<()> {
    const LO: &[u8] = b"lo";

    let socket = unsafe { libc::socket(libc::AF_INET, libc::SOCK_DGRAM, 0) };
    if socket < 0 {
        return Err(std::io::Error::last_os_error());
    }

    let mut request: libc::ifreq = unsafe { std::mem::zeroed() };
    for (slot, byte) in request.ifr_name.iter_mut().zip(LO) {
        *slot = *byte as libc::c_char;
    }

    let result = (|| {
        if unsafe { libc::ioctl(socket, libc::SIOCGIFFLAGS, &mut request) } < 0 {
            return Err(std::io::Error::last_os_error());
        }

        unsafe {
            request.ifr_ifru.ifru_flags |= (libc::IFF_UP | libc::IFF_RUNNING) as libc::c_short;
            if libc::ioctl(socket, libc::SIOCSIFFLAGS, &request) < 0 {
                return Err(std::io::Error::last_os_error());
            }
        }

        Ok(())
    })();

    unsafe { libc::close(socket) };
    result
}

/// Replaces the process image with the user command.
fn exec_command(spec: &InitSpec) -> ! {
    // Exported environment replaces the daemon's own.
    let existing: Vec<_> = env::vars_os().map(|(key, _)| key).collect();
    for key in existing {
        unsafe { env::remove_var(&key) };
    }
    for (key, value) in &spec.env {
        unsafe { env::set_var(key, value) };
    }

    let command = match CString::new(spec.command.as_str()) {
        Ok(command) => command,
        Err(_) => {
            eprintln!("joblet-init: command contains an interior NUL byte");
            process::exit(EXEC_EXIT_CODE);
        }
    };

    let mut argv = vec![command.clone()];
    for arg in &spec.args {
        match CString::new(arg.as_str()) {
            Ok(arg) => argv.push(arg),
            Err(_) => {
                eprintln!("joblet-init: argument contains an interior NUL byte");
                process::exit(EXEC_EXIT_CODE);
            }
        }
    }

    // execvp resolves the command against the PATH exported above.
    let err = execvp(&command, &argv).unwrap_err();
    eprintln!(
        "joblet-init: failed to exec `{command}`: {err}",
        command = spec.command
    );
    process::exit(EXEC_EXIT_CODE);
}

#[cfg(test)]
mod test {
    use pretty_assertions::assert_eq;

    use super::*;

    /// Builds an environment map from pairs.
    fn env_map(pairs: &[(&str, &str)]) -> IndexMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn job_env_wins_over_runtime_env() {
        let env = compute_environment(
            &env_map(&[("LANG", "C.UTF-8")]),
            &env_map(&[("LANG", "en_US"), ("PYTHONHOME", "/usr/local")]),
        );
        assert_eq!(env.get("LANG").unwrap(), "C.UTF-8");
        assert_eq!(env.get("PYTHONHOME").unwrap(), "/usr/local");
    }

    #[test]
    fn path_prepend_is_prepended_not_exported() {
        let env = compute_environment(
            &env_map(&[("PATH", "/bin")]),
            &env_map(&[(PATH_PREPEND_VAR, "/usr/local/python/bin")]),
        );
        assert_eq!(env.get("PATH").unwrap(), "/usr/local/python/bin:/bin");
        assert!(!env.contains_key(PATH_PREPEND_VAR));
    }

    #[test]
    fn default_path_applies_when_absent() {
        let env = compute_environment(&env_map(&[]), &env_map(&[]));
        assert_eq!(env.get("PATH").unwrap(), DEFAULT_PATH);

        let env = compute_environment(
            &env_map(&[]),
            &env_map(&[(PATH_PREPEND_VAR, "/opt/go/bin")]),
        );
        assert_eq!(
            env.get("PATH").unwrap(),
            &format!("/opt/go/bin:{DEFAULT_PATH}")
        );
    }

    #[test]
    fn init_spec_round_trips_through_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("spawn.json");

        let spec = InitSpec {
            job_id: JobId::new(),
            command: "echo".to_string(),
            args: vec!["hello".to_string()],
            env: env_map(&[("PATH", "/bin")]),
            sandbox_root: PathBuf::from("/opt/joblet/jobs/x"),
            tmp_dir: PathBuf::from("/opt/joblet/jobs/x/tmp"),
            pipes_dir: PathBuf::from("/opt/joblet/jobs/x/pipes"),
            allowed_host_paths: vec![PathBuf::from("/bin")],
            dns_servers: vec!["1.1.1.1".to_string()],
            runtime_mounts: Vec::new(),
            volume_mounts: Vec::new(),
            uploads: Vec::new(),
            network: NetworkMode::Bridge,
            work_tmpfs_bytes: 1 << 20,
            builder: false,
            runtimes_dir: PathBuf::from("/opt/joblet/runtimes"),
            gpu_devices: Vec::new(),
        };

        spec.store(&path).unwrap();
        assert_eq!(InitSpec::load(&path).unwrap(), spec);
    }
}

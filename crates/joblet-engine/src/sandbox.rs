//! Implementation of the isolator.
//!
//! The isolator converts a freshly cloned, still-privileged child process
//! running in new PID, mount, IPC, UTS, and (usually) network namespaces
//! into a sandboxed root ready to exec the user command. It runs entirely
//! inside the child, as PID 1 of the new PID namespace; its mounts live in
//! the child's private mount namespace and vanish when the namespace does.
//!
//! Construction order is mandatory: later steps assume earlier mounts are
//! visible inside the prospective new root.

use std::fs;
use std::io;
use std::path::Component;
use std::path::Path;
use std::path::PathBuf;

use anyhow::Context;
use anyhow::Result;
use anyhow::anyhow;
use anyhow::bail;
use nix::mount::MsFlags;
use nix::mount::mount;
use nix::mount::umount2;
use nix::mount::MntFlags;
use nix::sys::stat::Mode;
use nix::sys::stat::SFlag;
use nix::sys::stat::makedev;
use nix::sys::stat::mknod;
use nix::unistd::chroot;
use tracing::debug;
use tracing::warn;

use joblet_core::SetupPhase;

use crate::init::InitSpec;

/// The directories created under every sandbox root.
const SKELETON_DIRS: &[&str] = &[
    "etc", "tmp", "proc", "dev", "sys", "work", "var", "var/run", "var/tmp", "volumes", "pipes",
];

/// Host root entries never mirrored into a builder sandbox.
const BUILDER_EXCLUDED: &[&str] = &["proc", "sys", "dev", "tmp"];

/// The `/opt` prefix handled subdirectory by subdirectory for builder
/// jobs, so a recursive bind of the joblet tree into itself is impossible.
const OPT_DIR: &str = "opt";

/// The joblet installation prefix excluded from builder sandboxes.
const JOBLET_OPT_SUBDIR: &str = "joblet";

/// The character devices created in every sandbox's `/dev`.
///
/// `null` and `zero` are required; `random` and `urandom` failures are
/// logged and tolerated.
const DEVICES: &[(&str, u64, u64, bool)] = &[
    ("null", 1, 3, true),
    ("zero", 1, 5, true),
    ("random", 1, 8, false),
    ("urandom", 1, 9, false),
];

/// The device major for NVIDIA GPU and control nodes.
const NVIDIA_MAJOR: u64 = 195;

/// The device minor for `/dev/nvidiactl`.
const NVIDIACTL_MINOR: u64 = 255;

/// The device major for `/dev/nvidia-uvm`.
const NVIDIA_UVM_MAJOR: u64 = 237;

/// An error from a sandbox setup phase.
///
/// Carries the phase so the init process can exit with the phase's
/// distinct code.
#[derive(Debug)]
pub struct SetupError {
    /// The phase that failed.
    pub phase: SetupPhase,
    /// The underlying error.
    pub source: anyhow::Error,
}

impl SetupError {
    /// Creates a setup error for the given phase.
    fn new(phase: SetupPhase, source: anyhow::Error) -> Self {
        Self { phase, source }
    }
}

impl std::fmt::Display for SetupError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{phase} failed: {source:#}",
            phase = self.phase,
            source = self.source
        )
    }
}

impl std::error::Error for SetupError {}

/// A sandbox filesystem under construction.
///
/// Owned exclusively by one job for its lifetime; no two jobs ever share a
/// root directory.
#[derive(Debug)]
pub struct Sandbox<'a> {
    /// The spawn specification being realised.
    spec: &'a InitSpec,
    /// Mount targets in mount order, kept for reverse-order teardown.
    mounts: Vec<PathBuf>,
}

impl<'a> Sandbox<'a> {
    /// Creates a sandbox builder for the given spawn specification.
    pub fn new(spec: &'a InitSpec) -> Self {
        Self {
            spec,
            mounts: Vec::new(),
        }
    }

    /// Constructs the sandbox filesystem and enters it.
    ///
    /// On success the process is chrooted into the sandbox root with its
    /// working directory at `/work` (falling back to `/tmp`, then `/`) and
    /// the essential device nodes exist in `/dev`. On failure, the mounts
    /// made so far are unwound in reverse mount order.
    pub fn setup(mut self) -> Result<(), SetupError> {
        self.setup_inner().inspect_err(|_| self.unwind())
    }

    /// Runs the construction steps in order.
    fn setup_inner(&mut self) -> Result<(), SetupError> {
        // Mounts must never propagate back into the host namespace.
        mount(
            None::<&str>,
            "/",
            None::<&str>,
            MsFlags::MS_REC | MsFlags::MS_PRIVATE,
            None::<&str>,
        )
        .map_err(|e| {
            SetupError::new(
                SetupPhase::Mount,
                anyhow!(e).context("failed to make the mount namespace private"),
            )
        })?;

        self.create_skeleton()
            .map_err(|e| SetupError::new(SetupPhase::Directories, e))?;
        self.mount_proc()
            .map_err(|e| SetupError::new(SetupPhase::Mount, e))?;

        if self.spec.builder {
            self.mount_host_userland()
                .map_err(|e| SetupError::new(SetupPhase::Mount, e))?;
        } else {
            self.mount_allowed_host_paths();
        }

        self.mount_runtime()
            .map_err(|e| SetupError::new(SetupPhase::Runtime, e))?;
        self.mount_volumes();
        self.mount_work_tmpfs()
            .map_err(|e| SetupError::new(SetupPhase::Mount, e))?;
        self.mount_pipes()
            .map_err(|e| SetupError::new(SetupPhase::Mount, e))?;
        self.mount_tmp()
            .map_err(|e| SetupError::new(SetupPhase::Mount, e))?;

        self.enter_root()
            .map_err(|e| SetupError::new(SetupPhase::Chroot, e))?;
        create_devices(self.spec.gpu_devices.as_slice())
            .map_err(|e| SetupError::new(SetupPhase::Devices, e))?;

        Ok(())
    }

    /// Unmounts everything mounted so far, newest first.
    fn unwind(&mut self) {
        for target in self.mounts.drain(..).rev() {
            if let Err(e) = umount2(&target, MntFlags::MNT_DETACH) {
                warn!(
                    target = %target.display(),
                    error = %e,
                    "failed to unwind a sandbox mount"
                );
            }
        }
    }

    /// Step 1: creates the directory skeleton under the root.
    fn create_skeleton(&self) -> Result<()> {
        for dir in SKELETON_DIRS {
            let path = self.spec.sandbox_root.join(dir);
            fs::create_dir_all(&path).with_context(|| {
                format!("failed to create `{path}`", path = path.display())
            })?;
        }

        // Step 2: minimal name resolution inside the sandbox.
        let resolv = self
            .spec
            .dns_servers
            .iter()
            .map(|server| format!("nameserver {server}\n"))
            .collect::<String>();
        fs::write(self.spec.sandbox_root.join("etc/resolv.conf"), resolv)
            .context("failed to write resolv.conf")?;
        fs::write(
            self.spec.sandbox_root.join("etc/hosts"),
            "127.0.0.1 localhost\n::1 localhost\n",
        )
        .context("failed to write hosts")?;

        Ok(())
    }

    /// Mounts a fresh procfs for the new PID namespace.
    fn mount_proc(&mut self) -> Result<()> {
        let target = self.spec.sandbox_root.join("proc");
        mount(
            Some("proc"),
            &target,
            Some("proc"),
            MsFlags::MS_NOSUID | MsFlags::MS_NODEV | MsFlags::MS_NOEXEC,
            None::<&str>,
        )
        .with_context(|| format!("failed to mount proc at `{path}`", path = target.display()))?;
        self.mounts.push(target);
        Ok(())
    }

    /// Step 3: bind-mounts the configured allowed host directories
    /// read-only.
    ///
    /// Missing sources are skipped with a debug log; individual mount
    /// failures are logged and do not abort setup.
    fn mount_allowed_host_paths(&mut self) {
        let spec = self.spec;
        for source in &spec.allowed_host_paths {
            if !source.exists() {
                debug!(source = %source.display(), "skipping missing host path");
                continue;
            }

            let target = rebase(&spec.sandbox_root, source);
            if let Err(e) = self.bind_mount(source, &target, true) {
                warn!(
                    source = %source.display(),
                    error = %e,
                    "failed to bind host path into sandbox"
                );
            }
        }
    }

    /// Builder variant of step 3: mirrors the whole host userland.
    ///
    /// Every entry of `/` is bind-mounted except `proc`, `sys`, `dev`, and
    /// `tmp`. `/opt` is mounted subdirectory by subdirectory with the
    /// joblet prefix excluded, then the runtimes output directory is
    /// bind-mounted read-write so the build can deposit its result.
    fn mount_host_userland(&mut self) -> Result<()> {
        let entries =
            fs::read_dir("/").context("failed to enumerate the host root directory")?;
        for entry in entries.flatten() {
            let name = entry.file_name();
            let name = name.to_string_lossy();
            if BUILDER_EXCLUDED.contains(&name.as_ref()) {
                continue;
            }

            let source = entry.path();
            if name == OPT_DIR {
                self.mount_opt_subdirs(&source);
                continue;
            }

            if !source.is_dir() {
                continue;
            }

            let target = rebase(&self.spec.sandbox_root, &source);
            if let Err(e) = self.bind_mount(&source, &target, true) {
                warn!(
                    source = %source.display(),
                    error = %e,
                    "failed to mirror host directory into builder sandbox"
                );
            }
        }

        // The build's output location is the one writable host mount.
        let spec = self.spec;
        let runtimes_target = rebase(&spec.sandbox_root, &spec.runtimes_dir);
        self.bind_mount(&spec.runtimes_dir, &runtimes_target, false)
            .context("failed to mount the runtimes output directory read-write")?;

        Ok(())
    }

    /// Mounts `/opt` subdirectories individually, excluding the joblet
    /// installation so the sandbox tree cannot be bound into itself.
    fn mount_opt_subdirs(&mut self, opt: &Path) {
        let entries = match fs::read_dir(opt) {
            Ok(entries) => entries,
            Err(_) => return,
        };

        for entry in entries.flatten() {
            if entry.file_name().to_string_lossy() == JOBLET_OPT_SUBDIR {
                continue;
            }

            let source = entry.path();
            if !source.is_dir() {
                continue;
            }

            let target = rebase(&self.spec.sandbox_root, &source);
            if let Err(e) = self.bind_mount(&source, &target, true) {
                warn!(
                    source = %source.display(),
                    error = %e,
                    "failed to mirror /opt subdirectory into builder sandbox"
                );
            }
        }
    }

    /// Step 4: overlays the runtime mounts onto the tree.
    ///
    /// Two phases: every target is created first, then the binds are
    /// performed. A bind over a directory can make later `mkdir`s in it
    /// fail with `EROFS`, so no target creation may follow any bind.
    fn mount_runtime(&mut self) -> Result<()> {
        let spec = self.spec;
        for rt_mount in &spec.runtime_mounts {
            let target = rebase(&spec.sandbox_root, &rt_mount.target);
            create_mount_target(&target, rt_mount.is_dir)?;
        }

        for rt_mount in &spec.runtime_mounts {
            let target = rebase(&spec.sandbox_root, &rt_mount.target);
            self.bind_mount(&rt_mount.source, &target, rt_mount.readonly)
                .with_context(|| {
                    format!(
                        "failed to mount runtime path `{source}`",
                        source = rt_mount.source.display()
                    )
                })?;
        }

        Ok(())
    }

    /// Step 5: bind-mounts each attached volume read-write at
    /// `/volumes/<name>`.
    ///
    /// Per-volume failures are logged but do not abort setup.
    fn mount_volumes(&mut self) {
        let spec = self.spec;
        for volume in &spec.volume_mounts {
            let target = spec.sandbox_root.join("volumes").join(&volume.name);
            if let Err(e) = self.bind_mount(&volume.source, &target, false) {
                warn!(
                    volume = %volume.name,
                    error = %e,
                    "failed to mount volume into sandbox"
                );
            }
        }
    }

    /// Step 6: mounts a size-capped tmpfs on `/work` when the job has
    /// neither volumes nor materialised uploads.
    fn mount_work_tmpfs(&mut self) -> Result<()> {
        if !self.spec.volume_mounts.is_empty() || !self.spec.uploads.is_empty() {
            return Ok(());
        }

        let work = self.spec.sandbox_root.join("work");
        let empty = fs::read_dir(&work)
            .map(|mut entries| entries.next().is_none())
            .unwrap_or(true);
        if !empty {
            return Ok(());
        }

        mount(
            Some("tmpfs"),
            &work,
            Some("tmpfs"),
            MsFlags::empty(),
            Some(format!("size={size}", size = self.spec.work_tmpfs_bytes).as_str()),
        )
        .with_context(|| format!("failed to mount work tmpfs at `{path}`", path = work.display()))?;
        self.mounts.push(work);
        Ok(())
    }

    /// Step 7: exposes the upload FIFOs inside the sandbox at
    /// `/pipes/<job-id>`.
    fn mount_pipes(&mut self) -> Result<()> {
        if self.spec.uploads.is_empty() {
            return Ok(());
        }

        let spec = self.spec;
        let target = spec.sandbox_root.join("pipes").join(spec.job_id.to_string());
        self.bind_mount(&spec.pipes_dir, &target, false)
            .context("failed to mount the upload pipes directory")
    }

    /// Step 8: bind-mounts the host-side scratch directory onto `/tmp`.
    fn mount_tmp(&mut self) -> Result<()> {
        let spec = self.spec;
        let target = spec.sandbox_root.join("tmp");
        self.bind_mount(&spec.tmp_dir, &target, false)
            .context("failed to mount the scratch directory")
    }

    /// Step 9: enters the sandbox root.
    fn enter_root(&self) -> Result<()> {
        std::env::set_current_dir(&self.spec.sandbox_root).with_context(|| {
            format!(
                "failed to change into the sandbox root `{path}`",
                path = self.spec.sandbox_root.display()
            )
        })?;
        chroot(".").context("chroot into the sandbox root failed")?;

        for dir in ["/work", "/tmp", "/"] {
            if std::env::set_current_dir(dir).is_ok() {
                return Ok(());
            }
        }

        bail!("no usable working directory inside the sandbox");
    }

    /// Performs one bind mount, creating the target to mirror the source
    /// type and remounting read-only when requested.
    fn bind_mount(&mut self, source: &Path, target: &Path, readonly: bool) -> Result<()> {
        let is_dir = source.is_dir();
        create_mount_target(target, is_dir)?;

        mount(
            Some(source),
            target,
            None::<&str>,
            MsFlags::MS_BIND | MsFlags::MS_REC,
            None::<&str>,
        )
        .with_context(|| {
            format!(
                "failed to bind `{source}` to `{target}`",
                source = source.display(),
                target = target.display()
            )
        })?;
        self.mounts.push(target.to_path_buf());

        if readonly {
            mount(
                None::<&str>,
                target,
                None::<&str>,
                MsFlags::MS_REMOUNT | MsFlags::MS_BIND | MsFlags::MS_RDONLY,
                None::<&str>,
            )
            .with_context(|| {
                format!(
                    "failed to remount `{target}` read-only",
                    target = target.display()
                )
            })?;
        }

        Ok(())
    }
}

/// Creates a bind-mount target mirroring the source type: a directory, or
/// a zero-byte file.
fn create_mount_target(target: &Path, is_dir: bool) -> Result<()> {
    if is_dir {
        fs::create_dir_all(target).with_context(|| {
            format!(
                "failed to create mount target directory `{path}`",
                path = target.display()
            )
        })
    } else {
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent).with_context(|| {
                format!(
                    "failed to create mount target parent `{path}`",
                    path = parent.display()
                )
            })?;
        }

        match fs::OpenOptions::new().create(true).write(true).open(target) {
            Ok(_) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => Ok(()),
            Err(e) => Err(e).with_context(|| {
                format!(
                    "failed to create mount target file `{path}`",
                    path = target.display()
                )
            }),
        }
    }
}

/// Step 10: creates the essential device nodes, plus GPU nodes for jobs
/// with allocated GPUs.
///
/// Runs after chroot, so paths are sandbox-absolute. `EEXIST` is never an
/// error; `random`/`urandom` creation failures are logged and tolerated.
fn create_devices(gpu_devices: &[u32]) -> Result<()> {
    let mode = Mode::from_bits_truncate(0o666);

    for (name, major, minor, required) in DEVICES {
        let path = Path::new("/dev").join(name);
        match mknod(&path, SFlag::S_IFCHR, mode, makedev(*major, *minor)) {
            Ok(()) => {}
            Err(nix::errno::Errno::EEXIST) => {}
            Err(e) if *required => {
                return Err(anyhow!(e)).with_context(|| {
                    format!("failed to create device `{path}`", path = path.display())
                });
            }
            Err(e) => {
                warn!(device = %path.display(), error = %e, "failed to create optional device");
            }
        }
    }

    if !gpu_devices.is_empty() {
        for (name, major, minor) in [
            ("nvidiactl", NVIDIA_MAJOR, NVIDIACTL_MINOR),
            ("nvidia-uvm", NVIDIA_UVM_MAJOR, 0),
        ] {
            let path = Path::new("/dev").join(name);
            match mknod(&path, SFlag::S_IFCHR, mode, makedev(major, minor)) {
                Ok(()) | Err(nix::errno::Errno::EEXIST) => {}
                Err(e) => {
                    return Err(anyhow!(e)).with_context(|| {
                        format!("failed to create GPU device `{path}`", path = path.display())
                    });
                }
            }
        }

        for index in gpu_devices {
            let path = PathBuf::from(format!("/dev/nvidia{index}"));
            match mknod(&path, SFlag::S_IFCHR, mode, makedev(NVIDIA_MAJOR, u64::from(*index))) {
                Ok(()) | Err(nix::errno::Errno::EEXIST) => {}
                Err(e) => {
                    return Err(anyhow!(e)).with_context(|| {
                        format!("failed to create GPU device `{path}`", path = path.display())
                    });
                }
            }
        }
    }

    Ok(())
}

/// Rebase an absolute path under a new root.
fn rebase(root: &Path, path: &Path) -> PathBuf {
    let mut rebased = root.to_path_buf();
    for component in path.components() {
        match component {
            Component::RootDir | Component::CurDir => {}
            component => rebased.push(component.as_os_str()),
        }
    }
    rebased
}

/// Removes a job's sandbox tree from the host.
///
/// The sandbox's own mounts live in the child's private mount namespace
/// and are gone with it, but any mounts that remained host-visible (e.g.
/// from an interrupted setup) are unmounted in reverse mount order before
/// the tree is deleted. Cleanup failures are logged, never surfaced: they
/// must not block releasing the job slot.
pub fn cleanup_host(root: &Path) -> Result<()> {
    if !root.exists() {
        return Ok(());
    }

    for target in host_mounts_under(root)?.iter().rev() {
        if let Err(e) = umount2(target.as_path(), MntFlags::MNT_DETACH) {
            warn!(
                target = %target.display(),
                error = %e,
                "failed to unmount stray sandbox mount"
            );
        }
    }

    fs::remove_dir_all(root).with_context(|| {
        format!(
            "failed to remove sandbox root `{path}`",
            path = root.display()
        )
    })
}

/// Lists the host-visible mount points under a directory, in mount order.
fn host_mounts_under(root: &Path) -> Result<Vec<PathBuf>> {
    let mounts =
        fs::read_to_string("/proc/self/mounts").context("failed to read /proc/self/mounts")?;
    Ok(parse_mounts_under(&mounts, root))
}

/// Parses `/proc/self/mounts` contents, returning the mount points under
/// the given root in file (mount) order.
fn parse_mounts_under(mounts: &str, root: &Path) -> Vec<PathBuf> {
    mounts
        .lines()
        .filter_map(|line| line.split_whitespace().nth(1))
        .map(|target| PathBuf::from(unescape_mount_path(target)))
        .filter(|target| target.starts_with(root))
        .collect()
}

/// Reverses the octal escaping applied to mount points in `/proc` (spaces
/// become `\040`, tabs `\011`, and so on).
fn unescape_mount_path(path: &str) -> String {
    let mut result = String::with_capacity(path.len());
    let mut chars = path.chars();
    while let Some(c) = chars.next() {
        if c != '\\' {
            result.push(c);
            continue;
        }

        let digits: String = chars.by_ref().take(3).collect();
        match u32::from_str_radix(&digits, 8).ok().and_then(char::from_u32) {
            Some(unescaped) => result.push(unescaped),
            None => {
                result.push(c);
                result.push_str(&digits);
            }
        }
    }
    result
}

#[cfg(test)]
mod test {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn rebase_strips_the_leading_root() {
        assert_eq!(
            rebase(Path::new("/jobs/abc"), Path::new("/usr/lib")),
            PathBuf::from("/jobs/abc/usr/lib")
        );
        assert_eq!(
            rebase(Path::new("/jobs/abc"), Path::new("bin")),
            PathBuf::from("/jobs/abc/bin")
        );
    }

    #[test]
    fn mount_target_mirrors_source_type() {
        let dir = tempfile::tempdir().unwrap();

        let dir_target = dir.path().join("a/b/dir");
        create_mount_target(&dir_target, true).unwrap();
        assert!(dir_target.is_dir());

        let file_target = dir.path().join("c/d/file");
        create_mount_target(&file_target, false).unwrap();
        assert!(file_target.is_file());
        assert_eq!(fs::metadata(&file_target).unwrap().len(), 0);

        // Idempotent over an existing target.
        create_mount_target(&file_target, false).unwrap();
    }

    #[test]
    fn mounts_under_root_preserve_mount_order() {
        let mounts = "\
proc /proc proc rw 0 0
tmpfs /jobs/abc/work tmpfs rw 0 0
none /jobs/abc/proc proc rw 0 0
/dev/sda1 /jobs/abc/usr/lib ext4 ro 0 0
/dev/sda1 /jobs/other ext4 ro 0 0
";
        let under = parse_mounts_under(mounts, Path::new("/jobs/abc"));
        assert_eq!(
            under,
            vec![
                PathBuf::from("/jobs/abc/work"),
                PathBuf::from("/jobs/abc/proc"),
                PathBuf::from("/jobs/abc/usr/lib"),
            ]
        );
    }

    #[test]
    fn mount_paths_are_unescaped() {
        assert_eq!(unescape_mount_path(r"/jobs/with\040space"), "/jobs/with space");
        assert_eq!(unescape_mount_path("/plain"), "/plain");
    }
}

//! Implementation of the volume manager.
//!
//! Volumes are named host directories bind-mounted into job sandboxes.
//! Filesystem volumes persist across daemon restarts; memory volumes are
//! tmpfs mounts whose contents vanish with the mount. All mutations are
//! serialised by a single manager-wide lock, and refcount changes happen
//! synchronously with job status transitions.

use std::collections::HashMap;
use std::collections::HashSet;
use std::fs;
use std::path::Path;
use std::path::PathBuf;

use anyhow::Context;
use anyhow::Result;
use anyhow::bail;
use chrono::DateTime;
use chrono::Utc;
use parking_lot::Mutex;
use serde::Deserialize;
use serde::Serialize;
use tracing::debug;
use tracing::warn;

use joblet_core::JobId;

use crate::config::VolumeConfig;

/// The metadata file kept next to each volume's data directory.
const METADATA_FILE_NAME: &str = "volume.json";

/// The name of the data directory inside a volume directory.
const DATA_DIR_NAME: &str = "data";

/// The kind of backing storage for a volume.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, strum::Display, strum::EnumString)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum VolumeKind {
    /// A plain directory on the host filesystem.
    Filesystem,
    /// A tmpfs mount; contents are lost when the volume is removed or the
    /// host reboots.
    Memory,
}

/// The durable metadata for a volume.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
struct VolumeMetadata {
    /// The volume kind.
    kind: VolumeKind,
    /// The volume size, in bytes.
    size_bytes: u64,
    /// When the volume was created.
    created_at: DateTime<Utc>,
}

/// A volume record held by the manager.
#[derive(Debug)]
struct Volume {
    /// The durable metadata.
    metadata: VolumeMetadata,
    /// The volume's data directory on the host.
    data_dir: PathBuf,
    /// The jobs currently holding the volume.
    holders: HashSet<JobId>,
}

/// A point-in-time view of a volume for listings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct VolumeInfo {
    /// The volume name.
    pub name: String,
    /// The volume kind.
    pub kind: VolumeKind,
    /// The volume size, in bytes.
    pub size_bytes: u64,
    /// The bytes currently used by the volume's data.
    pub used_bytes: u64,
    /// The number of live jobs holding the volume.
    pub refcount: usize,
    /// When the volume was created.
    pub created_at: DateTime<Utc>,
}

/// A volume bind mount planned for a job's sandbox.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct VolumeMount {
    /// The volume name; the sandbox target is `/volumes/<name>`.
    pub name: String,
    /// The absolute host source path (the volume's data directory).
    pub source: PathBuf,
}

/// Determines if a volume name is acceptable.
///
/// Names become path components and mount targets, so only a conservative
/// character set is allowed.
fn valid_name(name: &str) -> bool {
    !name.is_empty()
        && name.len() <= 64
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
        && !name.starts_with('-')
}

/// Sums the file sizes under a directory.
fn directory_used_bytes(dir: &Path) -> u64 {
    walkdir::WalkDir::new(dir)
        .into_iter()
        .flatten()
        .filter_map(|entry| entry.metadata().ok())
        .filter(|metadata| metadata.is_file())
        .map(|metadata| metadata.len())
        .sum()
}

/// The volume manager.
///
/// A single process-wide instance owns every volume record; jobs hold
/// volumes by name only.
#[derive(Debug)]
pub struct VolumeManager {
    /// The configured base directory.
    base_dir: PathBuf,
    /// The volume records, keyed by name.
    volumes: Mutex<HashMap<String, Volume>>,
}

impl VolumeManager {
    /// Creates a manager over the configured base directory, replaying
    /// the volumes found on disk.
    ///
    /// Memory volumes are re-mounted: their data did not survive the
    /// previous daemon exit, but the volume itself (name, size) does.
    pub fn new(config: &VolumeConfig) -> Result<Self> {
        let manager = Self {
            base_dir: config.base_dir.clone(),
            volumes: Mutex::default(),
        };
        manager.replay()?;
        Ok(manager)
    }

    /// Scans the base directory and restores volume records.
    fn replay(&self) -> Result<()> {
        let entries = match fs::read_dir(&self.base_dir) {
            Ok(entries) => entries,
            Err(_) => {
                debug!(
                    base = %self.base_dir.display(),
                    "volumes directory does not exist; no volumes to replay"
                );
                return Ok(());
            }
        };

        let mut volumes = self.volumes.lock();
        for entry in entries.flatten() {
            let dir = entry.path();
            let metadata_path = dir.join(METADATA_FILE_NAME);
            let name = entry.file_name().to_string_lossy().to_string();

            let contents = match fs::read_to_string(&metadata_path) {
                Ok(contents) => contents,
                Err(_) => {
                    warn!(dir = %dir.display(), "ignoring volume directory without metadata");
                    continue;
                }
            };

            let metadata: VolumeMetadata = match serde_json::from_str(&contents) {
                Ok(metadata) => metadata,
                Err(e) => {
                    warn!(
                        dir = %dir.display(),
                        error = %e,
                        "ignoring volume directory with invalid metadata"
                    );
                    continue;
                }
            };

            let data_dir = dir.join(DATA_DIR_NAME);
            if metadata.kind == VolumeKind::Memory {
                if let Err(e) = mount_tmpfs(&data_dir, metadata.size_bytes) {
                    warn!(
                        volume = %name,
                        error = %e,
                        "failed to re-mount memory volume; it will be empty until removed"
                    );
                }
            }

            debug!(volume = %name, kind = %metadata.kind, "replayed volume");
            volumes.insert(
                name,
                Volume {
                    metadata,
                    data_dir,
                    holders: HashSet::new(),
                },
            );
        }

        Ok(())
    }

    /// Creates a new named volume.
    ///
    /// Volume names are globally unique; creating an existing name is a
    /// validation error.
    pub fn create(&self, name: &str, size_bytes: u64, kind: VolumeKind) -> Result<VolumeInfo> {
        if !valid_name(name) {
            bail!(
                "volume name `{name}` is invalid: names are at most 64 characters of \
                 letters, digits, `-`, and `_`"
            );
        }

        if size_bytes == 0 {
            bail!("volume size must be greater than zero");
        }

        let mut volumes = self.volumes.lock();
        if volumes.contains_key(name) {
            bail!("a volume named `{name}` already exists");
        }

        let dir = self.base_dir.join(name);
        let data_dir = dir.join(DATA_DIR_NAME);
        fs::create_dir_all(&data_dir).with_context(|| {
            format!(
                "failed to create volume data directory `{path}`",
                path = data_dir.display()
            )
        })?;

        let metadata = VolumeMetadata {
            kind,
            size_bytes,
            created_at: Utc::now(),
        };

        let contents =
            serde_json::to_string_pretty(&metadata).context("failed to serialize volume metadata")?;
        fs::write(dir.join(METADATA_FILE_NAME), contents).with_context(|| {
            format!(
                "failed to write volume metadata under `{path}`",
                path = dir.display()
            )
        })?;

        if kind == VolumeKind::Memory {
            if let Err(e) = mount_tmpfs(&data_dir, size_bytes) {
                // Roll the directory back so creation is all-or-nothing.
                let _ = fs::remove_dir_all(&dir);
                return Err(e);
            }
        }

        debug!(volume = %name, %kind, size = size_bytes, "created volume");

        let info = VolumeInfo {
            name: name.to_string(),
            kind,
            size_bytes,
            used_bytes: 0,
            refcount: 0,
            created_at: metadata.created_at,
        };
        volumes.insert(
            name.to_string(),
            Volume {
                metadata,
                data_dir,
                holders: HashSet::new(),
            },
        );
        Ok(info)
    }

    /// Removes a volume.
    ///
    /// Removal is refused while any live job holds the volume.
    pub fn remove(&self, name: &str) -> Result<()> {
        let mut volumes = self.volumes.lock();
        let volume = volumes
            .get(name)
            .ok_or_else(|| anyhow::anyhow!("volume `{name}` does not exist"))?;

        if !volume.holders.is_empty() {
            bail!(
                "volume `{name}` is in use by {count} job{s}",
                count = volume.holders.len(),
                s = if volume.holders.len() == 1 { "" } else { "s" }
            );
        }

        if volume.metadata.kind == VolumeKind::Memory {
            if let Err(e) = unmount_tmpfs(&volume.data_dir) {
                warn!(volume = %name, error = %e, "failed to unmount memory volume");
            }
        }

        let dir = self.base_dir.join(name);
        fs::remove_dir_all(&dir).with_context(|| {
            format!(
                "failed to remove volume directory `{path}`",
                path = dir.display()
            )
        })?;

        volumes.remove(name);
        debug!(volume = %name, "removed volume");
        Ok(())
    }

    /// Lists the volumes with current usage metrics.
    pub fn list(&self) -> Vec<VolumeInfo> {
        let volumes = self.volumes.lock();
        let mut infos: Vec<_> = volumes
            .iter()
            .map(|(name, volume)| VolumeInfo {
                name: name.clone(),
                kind: volume.metadata.kind,
                size_bytes: volume.metadata.size_bytes,
                used_bytes: directory_used_bytes(&volume.data_dir),
                refcount: volume.holders.len(),
                created_at: volume.metadata.created_at,
            })
            .collect();
        infos.sort_by(|a, b| a.name.cmp(&b.name));
        infos
    }

    /// Attaches a job to each named volume, incrementing refcounts, and
    /// returns the planned sandbox mounts.
    ///
    /// Attachment is all-or-nothing: an unknown volume name detaches
    /// anything already attached and fails.
    pub fn attach(&self, job: JobId, names: &[String]) -> Result<Vec<VolumeMount>> {
        let mut volumes = self.volumes.lock();

        if let Some(missing) = names.iter().find(|name| !volumes.contains_key(*name)) {
            bail!("volume `{missing}` does not exist");
        }

        let mut mounts = Vec::with_capacity(names.len());
        for name in names {
            // SAFETY: presence of every name was checked above under the
            // same lock guard.
            let volume = volumes.get_mut(name).unwrap();
            volume.holders.insert(job);
            mounts.push(VolumeMount {
                name: name.clone(),
                source: volume.data_dir.clone(),
            });
        }

        Ok(mounts)
    }

    /// Detaches a job from each named volume, decrementing refcounts.
    pub fn detach(&self, job: JobId, names: &[String]) {
        let mut volumes = self.volumes.lock();
        for name in names {
            if let Some(volume) = volumes.get_mut(name) {
                volume.holders.remove(&job);
            }
        }
    }
}

/// Mounts a tmpfs of the given size at the path.
fn mount_tmpfs(path: &Path, size_bytes: u64) -> Result<()> {
    fs::create_dir_all(path).with_context(|| {
        format!("failed to create tmpfs mount point `{path}`", path = path.display())
    })?;

    nix::mount::mount(
        Some("tmpfs"),
        path,
        Some("tmpfs"),
        nix::mount::MsFlags::empty(),
        Some(format!("size={size_bytes}").as_str()),
    )
    .with_context(|| format!("failed to mount tmpfs at `{path}`", path = path.display()))
}

/// Unmounts a tmpfs previously mounted by [`mount_tmpfs`].
fn unmount_tmpfs(path: &Path) -> Result<()> {
    nix::mount::umount(path)
        .with_context(|| format!("failed to unmount tmpfs at `{path}`", path = path.display()))
}

#[cfg(test)]
mod test {
    use pretty_assertions::assert_eq;

    use super::*;

    /// Creates a manager over a temporary directory.
    fn manager() -> (tempfile::TempDir, VolumeManager) {
        let dir = tempfile::tempdir().unwrap();
        let manager = VolumeManager::new(&VolumeConfig {
            base_dir: dir.path().to_path_buf(),
        })
        .unwrap();
        (dir, manager)
    }

    #[test]
    fn name_validation() {
        assert!(valid_name("models"));
        assert!(valid_name("train_data-2"));
        assert!(!valid_name(""));
        assert!(!valid_name("-leading"));
        assert!(!valid_name("has/slash"));
        assert!(!valid_name("has space"));
        assert!(!valid_name(&"x".repeat(65)));
    }

    #[test]
    fn create_list_remove() {
        let (_dir, manager) = manager();
        manager
            .create("models", 100 << 20, VolumeKind::Filesystem)
            .unwrap();

        let listed = manager.list();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].name, "models");
        assert_eq!(listed[0].used_bytes, 0);
        assert_eq!(listed[0].refcount, 0);

        manager.remove("models").unwrap();
        assert!(manager.list().is_empty());
    }

    #[test]
    fn duplicate_names_are_rejected() {
        let (_dir, manager) = manager();
        manager.create("v", 1024, VolumeKind::Filesystem).unwrap();
        assert!(manager.create("v", 1024, VolumeKind::Filesystem).is_err());
    }

    #[test]
    fn removal_is_refused_while_held() {
        let (_dir, manager) = manager();
        manager.create("v", 1024, VolumeKind::Filesystem).unwrap();

        let job = JobId::new();
        let mounts = manager.attach(job, &["v".to_string()]).unwrap();
        assert_eq!(mounts.len(), 1);
        assert_eq!(mounts[0].name, "v");

        let err = manager.remove("v").unwrap_err();
        assert!(err.to_string().contains("in use"));

        manager.detach(job, &["v".to_string()]);
        manager.remove("v").unwrap();
    }

    #[test]
    fn attach_is_all_or_nothing_for_unknown_names() {
        let (_dir, manager) = manager();
        manager.create("v", 1024, VolumeKind::Filesystem).unwrap();

        let job = JobId::new();
        assert!(
            manager
                .attach(job, &["v".to_string(), "missing".to_string()])
                .is_err()
        );

        // The existing volume must not be left attached.
        manager.remove("v").unwrap();
    }

    #[test]
    fn filesystem_volumes_survive_replay() {
        let dir = tempfile::tempdir().unwrap();
        let config = VolumeConfig {
            base_dir: dir.path().to_path_buf(),
        };

        {
            let manager = VolumeManager::new(&config).unwrap();
            manager.create("data", 1024, VolumeKind::Filesystem).unwrap();
            fs::write(dir.path().join("data/data/file"), b"hello").unwrap();
        }

        let manager = VolumeManager::new(&config).unwrap();
        let listed = manager.list();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].name, "data");
        assert_eq!(listed[0].used_bytes, 5);
    }
}

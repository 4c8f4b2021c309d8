//! Implementation of the runtime composer.
//!
//! A runtime is a pre-staged filesystem tree plus a `runtime.yml` manifest
//! that describes how to overlay a language toolchain onto a job's minimal
//! chroot. Runtimes are installed under `<runtimes-base>/<name>/<version>/`
//! (or the legacy flat `<runtimes-base>/<name>/` layout) and are resolved
//! from a job's runtime specification string.

use std::fmt;
use std::fs;
use std::path::Path;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use anyhow::Result;
use anyhow::anyhow;
use anyhow::bail;
use indexmap::IndexMap;
use parking_lot::RwLock;
use serde::Deserialize;
use serde::Serialize;
use tracing::debug;
use tracing::warn;

use crate::config::RuntimeConfig;

/// The manifest file name inside a runtime directory.
pub const MANIFEST_FILE_NAME: &str = "runtime.yml";

/// The environment key a runtime uses to prepend entries to the job's
/// `PATH`.
pub const PATH_PREPEND_VAR: &str = "PATH_PREPEND";

/// A parsed runtime specification string.
///
/// Specifications are either a bare name (`python-3.11-ml`) or a
/// `name@version` pair (`python@3.11`). A missing version matches the
/// newest installed version of the runtime.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RuntimeSpec {
    /// The runtime name.
    pub name: String,
    /// The requested version, if any.
    pub version: Option<String>,
}

impl RuntimeSpec {
    /// Parses a runtime specification string.
    pub fn parse(spec: &str) -> Result<Self> {
        let spec = spec.trim();
        if spec.is_empty() {
            bail!("runtime specification is empty");
        }

        match spec.split_once('@') {
            Some((name, version)) => {
                if name.is_empty() || version.is_empty() {
                    bail!("runtime specification `{spec}` is not in `name@version` form");
                }

                Ok(Self {
                    name: name.to_string(),
                    version: Some(version.to_string()),
                })
            }
            None => Ok(Self {
                name: spec.to_string(),
                version: None,
            }),
        }
    }
}

impl fmt::Display for RuntimeSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.version {
            Some(version) => write!(f, "{name}@{version}", name = self.name),
            None => write!(f, "{name}", name = self.name),
        }
    }
}

/// One mount entry in a runtime manifest.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", deny_unknown_fields)]
pub struct ManifestMount {
    /// The mount source, relative to the runtime root.
    pub source: PathBuf,
    /// The mount target, absolute inside the sandbox.
    pub target: PathBuf,
    /// Whether the mount is remounted read-only.
    #[serde(default = "default_readonly")]
    pub readonly: bool,
}

/// Returns the default for a mount's read-only flag.
fn default_readonly() -> bool {
    true
}

/// Architecture requirements declared by a runtime manifest.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", deny_unknown_fields)]
pub struct ManifestRequirements {
    /// The architectures the runtime supports; empty means any.
    #[serde(default)]
    pub architectures: Vec<String>,
}

/// A runtime manifest (`runtime.yml`), immutable once loaded.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", deny_unknown_fields)]
pub struct RuntimeManifest {
    /// The runtime name.
    pub name: String,
    /// The runtime version.
    pub version: String,
    /// The language the runtime provides.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub language: Option<String>,
    /// A human-readable description.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// The mounts the runtime overlays onto the sandbox.
    #[serde(default)]
    pub mounts: Vec<ManifestMount>,
    /// The environment the runtime contributes to jobs.
    ///
    /// A `PATH_PREPEND` entry is prepended to the job's `PATH` rather than
    /// set verbatim.
    #[serde(default, skip_serializing_if = "IndexMap::is_empty")]
    pub environment: IndexMap<String, String>,
    /// The architecture requirements.
    #[serde(default)]
    pub requirements: ManifestRequirements,
}

impl RuntimeManifest {
    /// Loads a manifest from a `runtime.yml` file.
    pub fn load(path: &Path) -> Result<Self> {
        let contents = fs::read_to_string(path).with_context(|| {
            format!("failed to read runtime manifest `{path}`", path = path.display())
        })?;

        serde_yaml_ng::from_str(&contents).with_context(|| {
            format!(
                "failed to parse runtime manifest `{path}`",
                path = path.display()
            )
        })
    }

    /// Determines if the manifest supports the given architecture.
    ///
    /// An empty requirement list supports every architecture.
    pub fn supports_architecture(&self, arch: &str) -> bool {
        self.requirements.architectures.is_empty()
            || self.requirements.architectures.iter().any(|a| a == arch)
    }
}

/// One bind mount planned for a sandbox, with its source resolved to an
/// absolute host path.
///
/// Plans are computed before the sandbox child is spawned and handed to
/// the init process as data, so planning is testable without privileges.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct RuntimeMount {
    /// The absolute host source path.
    pub source: PathBuf,
    /// The target path, absolute inside the sandbox.
    pub target: PathBuf,
    /// Whether the mount is remounted read-only after binding.
    pub readonly: bool,
    /// Whether the source is a directory (`false` means a regular file).
    pub is_dir: bool,
}

/// An installed runtime: its on-disk root plus its manifest.
#[derive(Debug, Clone)]
pub struct InstalledRuntime {
    /// The runtime root directory on the host.
    root: PathBuf,
    /// The name directory the runtime was found under.
    family: String,
    /// The loaded manifest.
    manifest: RuntimeManifest,
}

impl InstalledRuntime {
    /// Gets the runtime root directory.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Gets the manifest.
    pub fn manifest(&self) -> &RuntimeManifest {
        &self.manifest
    }

    /// Plans the bind mounts that overlay this runtime onto a sandbox.
    ///
    /// Sources that do not exist or are empty directories are skipped with
    /// a debug log; mounting proceeds in manifest order.
    pub fn plan_mounts(&self) -> Vec<RuntimeMount> {
        let mut mounts = Vec::with_capacity(self.manifest.mounts.len());
        for entry in &self.manifest.mounts {
            let source = self.root.join(&entry.source);
            let metadata = match fs::metadata(&source) {
                Ok(metadata) => metadata,
                Err(_) => {
                    debug!(
                        source = %source.display(),
                        "skipping runtime mount with missing source"
                    );
                    continue;
                }
            };

            if metadata.is_dir()
                && fs::read_dir(&source)
                    .map(|mut entries| entries.next().is_none())
                    .unwrap_or(true)
            {
                debug!(
                    source = %source.display(),
                    "skipping runtime mount with empty source directory"
                );
                continue;
            }

            mounts.push(RuntimeMount {
                source,
                target: entry.target.clone(),
                readonly: entry.readonly,
                is_dir: metadata.is_dir(),
            });
        }

        mounts
    }
}

/// The index of installed runtimes.
///
/// The index is loaded once at daemon startup and cached; reloads take the
/// write half of the lock.
#[derive(Debug, Default)]
pub struct RuntimeIndex {
    /// The configured base directory.
    base_dir: PathBuf,
    /// The installed runtimes.
    runtimes: RwLock<Vec<Arc<InstalledRuntime>>>,
}

impl RuntimeIndex {
    /// Creates an index over the configured runtimes directory and loads
    /// it.
    ///
    /// A missing base directory yields an empty index: a daemon without
    /// installed runtimes is valid as long as no job requests one.
    pub fn load(config: &RuntimeConfig) -> Self {
        let index = Self {
            base_dir: config.base_dir.clone(),
            runtimes: RwLock::default(),
        };
        index.reload();
        index
    }

    /// Rescans the base directory for installed runtimes.
    pub fn reload(&self) {
        let mut found = Vec::new();

        let names = match fs::read_dir(&self.base_dir) {
            Ok(entries) => entries,
            Err(_) => {
                debug!(
                    base = %self.base_dir.display(),
                    "runtimes directory does not exist; no runtimes installed"
                );
                *self.runtimes.write() = found;
                return;
            }
        };

        for name_entry in names.flatten() {
            let name_dir = name_entry.path();
            if !name_dir.is_dir() {
                continue;
            }

            // Legacy flat layout: the manifest sits directly in the name
            // directory.
            let family = name_entry.file_name().to_string_lossy().to_string();
            let flat_manifest = name_dir.join(MANIFEST_FILE_NAME);
            if flat_manifest.is_file() {
                match RuntimeManifest::load(&flat_manifest) {
                    Ok(manifest) => found.push(Arc::new(InstalledRuntime {
                        root: name_dir.clone(),
                        family,
                        manifest,
                    })),
                    Err(e) => warn!(
                        path = %flat_manifest.display(),
                        error = %e,
                        "ignoring runtime with invalid manifest"
                    ),
                }
                continue;
            }

            let versions = match fs::read_dir(&name_dir) {
                Ok(entries) => entries,
                Err(_) => continue,
            };

            for version_entry in versions.flatten() {
                let version_dir = version_entry.path();
                let manifest_path = version_dir.join(MANIFEST_FILE_NAME);
                if !manifest_path.is_file() {
                    continue;
                }

                match RuntimeManifest::load(&manifest_path) {
                    Ok(manifest) => found.push(Arc::new(InstalledRuntime {
                        root: version_dir,
                        family: family.clone(),
                        manifest,
                    })),
                    Err(e) => warn!(
                        path = %manifest_path.display(),
                        error = %e,
                        "ignoring runtime with invalid manifest"
                    ),
                }
            }
        }

        debug!(count = found.len(), "loaded runtime index");
        *self.runtimes.write() = found;
    }

    /// Lists the installed runtimes.
    pub fn list(&self) -> Vec<Arc<InstalledRuntime>> {
        self.runtimes.read().clone()
    }

    /// Resolves a runtime specification string to an installed runtime.
    ///
    /// Resolution tries, in order: an exact match on the runtime's
    /// directory name, a match on the manifest `name` (with `name@version`
    /// parsing applied first). When multiple versions match, the newest
    /// (lexicographically greatest) version wins. A runtime whose manifest
    /// does not support the host architecture is a resolution error.
    pub fn resolve(&self, spec: &str) -> Result<Arc<InstalledRuntime>> {
        let spec = RuntimeSpec::parse(spec)?;
        let runtimes = self.runtimes.read();

        let mut best: Option<&Arc<InstalledRuntime>> = None;
        for runtime in runtimes.iter() {
            let manifest = &runtime.manifest;

            // An exact match on the installation directory (e.g. a spec
            // of `python-3.11-ml` naming the name directory) needs no
            // version agreement.
            let exact_dir = spec.version.is_none() && runtime.family == spec.name;
            let name_matches = manifest.name == spec.name || runtime.family == spec.name;
            let version_matches = spec
                .version
                .as_ref()
                .is_none_or(|version| &manifest.version == version);

            if !(exact_dir || (name_matches && version_matches)) {
                continue;
            }

            if !manifest.supports_architecture(std::env::consts::ARCH) {
                bail!(
                    "runtime `{name}` version `{version}` does not support the host \
                     architecture `{arch}`",
                    name = manifest.name,
                    version = manifest.version,
                    arch = std::env::consts::ARCH,
                );
            }

            match best {
                Some(current) if current.manifest.version >= manifest.version => {}
                _ => best = Some(runtime),
            }
        }

        best.cloned()
            .ok_or_else(|| anyhow!("runtime `{spec}` is not installed"))
    }
}

#[cfg(test)]
mod test {
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::config::RuntimeConfig;

    /// Installs a runtime tree under the given base directory.
    fn install(base: &Path, dir: &str, manifest: &str) {
        let root = base.join(dir);
        fs::create_dir_all(root.join("bin")).unwrap();
        fs::write(root.join("bin/tool"), b"#!/bin/sh\n").unwrap();
        fs::write(root.join(MANIFEST_FILE_NAME), manifest).unwrap();
    }

    /// Creates an index over a temporary directory with two python
    /// versions and one legacy runtime.
    fn fixture() -> (tempfile::TempDir, RuntimeIndex) {
        let dir = tempfile::tempdir().unwrap();
        install(
            dir.path(),
            "python/3.11",
            "name: python\nversion: \"3.11\"\nlanguage: python\nmounts:\n  - source: bin\n    target: /usr/local/bin\n",
        );
        install(
            dir.path(),
            "python/3.12",
            "name: python\nversion: \"3.12\"\nlanguage: python\nmounts:\n  - source: bin\n    target: /usr/local/bin\n",
        );
        install(
            dir.path(),
            "go-legacy",
            "name: go\nversion: \"1.22\"\nmounts:\n  - source: bin\n    target: /usr/local/go/bin\n",
        );

        let index = RuntimeIndex::load(&RuntimeConfig {
            base_dir: dir.path().to_path_buf(),
        });
        (dir, index)
    }

    #[test]
    fn spec_parsing() {
        assert_eq!(
            RuntimeSpec::parse("python-3.11-ml").unwrap(),
            RuntimeSpec {
                name: "python-3.11-ml".to_string(),
                version: None,
            }
        );
        assert_eq!(
            RuntimeSpec::parse("python@3.11").unwrap(),
            RuntimeSpec {
                name: "python".to_string(),
                version: Some("3.11".to_string()),
            }
        );
        assert!(RuntimeSpec::parse("").is_err());
        assert!(RuntimeSpec::parse("@3.11").is_err());
        assert!(RuntimeSpec::parse("python@").is_err());
    }

    #[test]
    fn resolves_newest_version_without_a_version() {
        let (_dir, index) = fixture();
        let runtime = index.resolve("python").unwrap();
        assert_eq!(runtime.manifest().version, "3.12");
    }

    #[test]
    fn resolves_exact_version() {
        let (_dir, index) = fixture();
        let runtime = index.resolve("python@3.11").unwrap();
        assert_eq!(runtime.manifest().version, "3.11");
    }

    #[test]
    fn resolves_legacy_flat_layout() {
        let (_dir, index) = fixture();
        let runtime = index.resolve("go").unwrap();
        assert_eq!(runtime.manifest().version, "1.22");

        // The directory name also matches.
        let runtime = index.resolve("go-legacy").unwrap();
        assert_eq!(runtime.manifest().name, "go");
    }

    #[test]
    fn unknown_runtime_is_an_error() {
        let (_dir, index) = fixture();
        assert!(index.resolve("rust").is_err());
        assert!(index.resolve("python@2.7").is_err());
    }

    #[test]
    fn architecture_mismatch_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        install(
            dir.path(),
            "exotic/1.0",
            "name: exotic\nversion: \"1.0\"\nrequirements:\n  architectures: [some-other-arch]\n",
        );

        let index = RuntimeIndex::load(&RuntimeConfig {
            base_dir: dir.path().to_path_buf(),
        });
        let err = index.resolve("exotic").unwrap_err();
        assert!(err.to_string().contains("architecture"));
    }

    #[test]
    fn mount_plan_skips_missing_and_empty_sources() {
        let dir = tempfile::tempdir().unwrap();
        install(
            dir.path(),
            "python/3.11",
            "name: python\nversion: \"3.11\"\nmounts:\n  - source: bin\n    target: /usr/local/bin\n  - source: missing\n    target: /missing\n  - source: empty\n    target: /empty\n",
        );
        fs::create_dir_all(dir.path().join("python/3.11/empty")).unwrap();

        let index = RuntimeIndex::load(&RuntimeConfig {
            base_dir: dir.path().to_path_buf(),
        });
        let runtime = index.resolve("python").unwrap();
        let mounts = runtime.plan_mounts();
        assert_eq!(mounts.len(), 1);
        assert_eq!(mounts[0].target, PathBuf::from("/usr/local/bin"));
        assert!(mounts[0].is_dir);
        assert!(mounts[0].readonly);
    }
}

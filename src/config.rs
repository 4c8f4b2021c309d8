//! Implementation of the daemon configuration module.
//!
//! Configuration is layered: built-in defaults, then an optional TOML
//! file, then `JOBLET_`-prefixed environment variables (with `__`
//! separating nesting levels, e.g. `JOBLET_ENGINE__SANDBOX__JOBS_DIR`).

use std::path::Path;
use std::path::PathBuf;

use anyhow::Context;
use anyhow::Result;
use serde::Deserialize;
use serde::Serialize;

/// The default configuration file location.
pub const DEFAULT_CONFIG_PATH: &str = "/etc/joblet/joblet.toml";

/// The environment variable prefix for configuration overrides.
const ENV_PREFIX: &str = "JOBLET";

/// Represents the configuration for the Joblet daemon.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", deny_unknown_fields)]
pub struct Config {
    /// The execution engine configuration.
    #[serde(default)]
    pub engine: joblet_engine::config::Config,
    /// The daemon's service configuration.
    #[serde(default)]
    pub daemon: DaemonConfig,
}

/// Represents daemon-level service configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", deny_unknown_fields)]
pub struct DaemonConfig {
    /// The command channel buffer size for the manager services.
    #[serde(default = "default_channel_buffer_size")]
    pub channel_buffer_size: usize,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            channel_buffer_size: default_channel_buffer_size(),
        }
    }
}

/// Returns the default command channel buffer size.
fn default_channel_buffer_size() -> usize {
    64
}

impl Config {
    /// Loads the layered configuration.
    ///
    /// An explicitly provided path must exist; the default path is used
    /// only when present.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = config::Config::builder();

        match path {
            Some(path) => {
                builder = builder.add_source(config::File::from(path.to_path_buf()));
            }
            None => {
                let default = PathBuf::from(DEFAULT_CONFIG_PATH);
                if default.is_file() {
                    builder = builder.add_source(config::File::from(default));
                }
            }
        }

        let config: Self = builder
            .add_source(
                config::Environment::with_prefix(ENV_PREFIX)
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .context("failed to load configuration")?
            .try_deserialize()
            .context("failed to parse configuration")?;

        config.engine.validate()?;
        Ok(config)
    }
}

#[cfg(test)]
mod test {
    use std::io::Write;

    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn defaults_load_without_a_file() {
        let config = Config::load(None).unwrap();
        assert_eq!(config.daemon.channel_buffer_size, 64);
    }

    #[test]
    fn file_values_override_defaults() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(
            file,
            "[daemon]\nchannel_buffer_size = 16\n\n[engine.sandbox]\njobs_dir = \"/srv/joblet/jobs\"\n"
        )
        .unwrap();

        let config = Config::load(Some(file.path())).unwrap();
        assert_eq!(config.daemon.channel_buffer_size, 16);
        assert_eq!(
            config.engine.sandbox.jobs_dir,
            PathBuf::from("/srv/joblet/jobs")
        );
    }

    #[test]
    fn unknown_keys_are_rejected() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(file, "[daemon]\nchannel_buffer = 16\n").unwrap();
        assert!(Config::load(Some(file.path())).is_err());
    }

    #[test]
    fn a_missing_explicit_file_is_an_error() {
        assert!(Config::load(Some(Path::new("/nonexistent/joblet.toml"))).is_err());
    }
}

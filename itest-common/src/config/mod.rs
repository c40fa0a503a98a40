//! Configuration for the entity runner.
//!
//! Values are layered: built-in defaults, then an optional TOML file, then
//! `ITEST_*` environment variables. Every value remembers where it came from.

pub mod env;
pub mod source;

pub use env::{EnvError, EnvParser};
pub use source::{ConfigSource, Sourced};

use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

/// Soft timeout of the pre-test and post-test hook phases.
pub const DEFAULT_HOOK_TIMEOUT: Duration = Duration::from_secs(15);

/// Grace period added to a phase's soft timeout to get its hard timeout.
pub const DEFAULT_EXIT_TIMEOUT: Duration = Duration::from_secs(30);

/// Errors that can occur while loading configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse config file {path}: {source}")]
    Parse {
        path: String,
        #[source]
        source: toml::de::Error,
    },

    #[error("Invalid duration for {key}: {value}")]
    InvalidDuration { key: String, value: String },

    #[error("{} invalid environment variable(s): {}", .0.len(), join_errors(.0))]
    Env(Vec<EnvError>),
}

fn join_errors(errors: &[EnvError]) -> String {
    errors
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

/// Fixed phase timeouts applied by the entity runner.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimeoutConfig {
    /// Soft timeout of the pre-test and post-test hook phases.
    pub hook_timeout: Duration,
    /// Default grace period between a phase's soft and hard deadline.
    pub exit_timeout: Duration,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            hook_timeout: DEFAULT_HOOK_TIMEOUT,
            exit_timeout: DEFAULT_EXIT_TIMEOUT,
        }
    }
}

/// Process-level runner configuration.
#[derive(Debug, Clone, PartialEq)]
pub struct RunnerConfig {
    pub timeouts: TimeoutConfig,
    /// Directory that declared data files are resolved against.
    pub data_dir: PathBuf,
    /// Root output directory; each entity gets a subdirectory.
    pub out_dir: Option<PathBuf>,
    /// Where each value came from, keyed by setting name.
    pub sources: BTreeMap<&'static str, ConfigSource>,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            timeouts: TimeoutConfig::default(),
            data_dir: PathBuf::from("data"),
            out_dir: None,
            sources: BTreeMap::new(),
        }
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct FileConfig {
    data_dir: Option<PathBuf>,
    out_dir: Option<PathBuf>,
    #[serde(default)]
    timeouts: FileTimeouts,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct FileTimeouts {
    hook_timeout: Option<String>,
    exit_timeout: Option<String>,
}

impl RunnerConfig {
    /// Defaults overlaid with `ITEST_*` environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = Self::default();
        config.apply_env()?;
        Ok(config)
    }

    /// Load a TOML file, then overlay `ITEST_*` environment variables.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let mut config = Self::from_toml_str(&text, &path.display().to_string())?;
        config.apply_env()?;
        Ok(config)
    }

    /// Parse TOML text. `origin` names the source in errors and source tracking.
    pub fn from_toml_str(text: &str, origin: &str) -> Result<Self, ConfigError> {
        let file: FileConfig = toml::from_str(text).map_err(|source| ConfigError::Parse {
            path: origin.to_string(),
            source,
        })?;

        let mut config = Self::default();
        let from_file = || ConfigSource::File(origin.to_string());

        if let Some(dir) = file.data_dir {
            config.data_dir = dir;
            config.sources.insert("data_dir", from_file());
        }
        if let Some(dir) = file.out_dir {
            config.out_dir = Some(dir);
            config.sources.insert("out_dir", from_file());
        }
        if let Some(raw) = file.timeouts.hook_timeout {
            config.timeouts.hook_timeout = parse_file_duration("timeouts.hook_timeout", &raw)?;
            config.sources.insert("hook_timeout", from_file());
        }
        if let Some(raw) = file.timeouts.exit_timeout {
            config.timeouts.exit_timeout = parse_file_duration("timeouts.exit_timeout", &raw)?;
            config.sources.insert("exit_timeout", from_file());
        }
        Ok(config)
    }

    fn apply_env(&mut self) -> Result<(), ConfigError> {
        let mut parser = EnvParser::new();

        let hook = parser.get_duration("HOOK_TIMEOUT", self.timeouts.hook_timeout);
        let exit = parser.get_duration("EXIT_TIMEOUT", self.timeouts.exit_timeout);
        let data_dir = parser.get_optional_path("DATA_DIR");
        let out_dir = parser.get_optional_path("OUT_DIR");

        if parser.has_errors() {
            return Err(ConfigError::Env(parser.take_errors()));
        }

        if !hook.is_default() {
            self.timeouts.hook_timeout = hook.value;
            self.sources.insert("hook_timeout", hook.source);
        }
        if !exit.is_default() {
            self.timeouts.exit_timeout = exit.value;
            self.sources.insert("exit_timeout", exit.source);
        }
        if let Some(dir) = data_dir.value {
            self.data_dir = dir;
            self.sources.insert("data_dir", data_dir.source);
        }
        if let Some(dir) = out_dir.value {
            self.out_dir = Some(dir);
            self.sources.insert("out_dir", out_dir.source);
        }
        Ok(())
    }

    /// Source of a setting, `Default` when it was never overridden.
    pub fn source_of(&self, key: &str) -> ConfigSource {
        self.sources
            .get(key)
            .cloned()
            .unwrap_or(ConfigSource::Default)
    }
}

fn parse_file_duration(key: &str, raw: &str) -> Result<Duration, ConfigError> {
    env::parse_duration(raw).ok_or_else(|| ConfigError::InvalidDuration {
        key: key.to_string(),
        value: raw.to_string(),
    })
}

#[cfg(test)]
pub(crate) fn env_test_lock() -> std::sync::MutexGuard<'static, ()> {
    use std::sync::{Mutex, OnceLock};

    static ENV_LOCK: OnceLock<Mutex<()>> = OnceLock::new();
    ENV_LOCK
        .get_or_init(|| Mutex::new(()))
        .lock()
        .unwrap_or_else(|e| e.into_inner())
}

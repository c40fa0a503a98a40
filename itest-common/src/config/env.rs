//! Typed reads of `ITEST_*` environment variables.
//!
//! The parser keeps going past bad values so every problem can be reported
//! in one pass. A bad value falls back to the caller's default.

use super::source::Sourced;
use std::env;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

const PREFIX: &str = "ITEST_";

const LOG_LEVELS: [&str; 6] = ["trace", "debug", "info", "warn", "error", "off"];

#[derive(Debug, Error)]
pub enum EnvError {
    #[error("Invalid duration for {var}: {value}")]
    InvalidDuration { var: String, value: String },

    #[error("Invalid log level for {var}: {value} (expected one of {})", LOG_LEVELS.join(", "))]
    InvalidLogLevel { var: String, value: String },
}

impl EnvError {
    /// Full name of the offending variable.
    pub fn var(&self) -> &str {
        match self {
            Self::InvalidDuration { var, .. } | Self::InvalidLogLevel { var, .. } => var,
        }
    }
}

/// Reads prefixed variables and collects parse failures.
#[derive(Debug, Default)]
pub struct EnvParser {
    errors: Vec<EnvError>,
}

impl EnvParser {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn errors(&self) -> &[EnvError] {
        &self.errors
    }

    pub fn has_errors(&self) -> bool {
        !self.errors.is_empty()
    }

    pub fn take_errors(&mut self) -> Vec<EnvError> {
        std::mem::take(&mut self.errors)
    }

    /// `(full name, value)`; unset and non-UTF-8 variables read as `None`.
    fn lookup(name: &str) -> (String, Option<String>) {
        let var = format!("{PREFIX}{name}");
        let value = env::var(&var).ok();
        (var, value)
    }

    /// A duration in humantime notation ("15s", "2m 30s", "500ms"). A bare
    /// integer counts as seconds.
    pub fn get_duration(&mut self, name: &str, default: Duration) -> Sourced<Duration> {
        let (var, value) = Self::lookup(name);
        let Some(value) = value else {
            return Sourced::default_value(default);
        };
        match parse_duration(&value) {
            Some(d) => Sourced::from_env(d, var),
            None => {
                self.errors.push(EnvError::InvalidDuration { var, value });
                Sourced::default_value(default)
            }
        }
    }

    /// A tracing level name, lowercased.
    pub fn get_log_level(&mut self, name: &str, default: &str) -> Sourced<String> {
        let (var, value) = Self::lookup(name);
        let Some(value) = value else {
            return Sourced::default_value(default.to_string());
        };
        let level = value.trim().to_ascii_lowercase();
        if LOG_LEVELS.contains(&level.as_str()) {
            Sourced::from_env(level, var)
        } else {
            self.errors.push(EnvError::InvalidLogLevel { var, value });
            Sourced::default_value(default.to_string())
        }
    }

    /// An optional string. Set but empty reads as `None` from the environment.
    pub fn get_optional_string(&mut self, name: &str) -> Sourced<Option<String>> {
        match Self::lookup(name) {
            (var, Some(value)) => Sourced::from_env(Some(value).filter(|v| !v.is_empty()), var),
            (_, None) => Sourced::default_value(None),
        }
    }

    pub fn get_optional_path(&mut self, name: &str) -> Sourced<Option<PathBuf>> {
        let sourced = self.get_optional_string(name);
        Sourced {
            value: sourced.value.map(PathBuf::from),
            source: sourced.source,
            env_var: sourced.env_var,
        }
    }
}

/// Parse a humantime duration, accepting bare seconds as well.
pub(crate) fn parse_duration(value: &str) -> Option<Duration> {
    let trimmed = value.trim();
    match trimmed.parse::<u64>() {
        Ok(secs) => Some(Duration::from_secs(secs)),
        Err(_) => humantime::parse_duration(trimmed).ok(),
    }
}

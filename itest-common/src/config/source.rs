//! Source tracking for configuration values.

use std::fmt;

/// Where a configuration value came from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigSource {
    /// Built-in default.
    Default,
    /// Configuration file at the given path.
    File(String),
    /// Environment variable.
    Environment,
}

impl fmt::Display for ConfigSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Default => write!(f, "default"),
            Self::File(path) => write!(f, "file:{}", path),
            Self::Environment => write!(f, "env"),
        }
    }
}

/// A value together with the source it was read from.
#[derive(Debug, Clone, PartialEq)]
pub struct Sourced<T> {
    pub value: T,
    pub source: ConfigSource,
    /// Environment variable name, when `source` is `Environment`.
    pub env_var: Option<String>,
}

impl<T> Sourced<T> {
    pub fn default_value(value: T) -> Self {
        Self {
            value,
            source: ConfigSource::Default,
            env_var: None,
        }
    }

    pub fn from_env(value: T, var: String) -> Self {
        Self {
            value,
            source: ConfigSource::Environment,
            env_var: Some(var),
        }
    }

    pub fn from_file(value: T, path: impl Into<String>) -> Self {
        Self {
            value,
            source: ConfigSource::File(path.into()),
            env_var: None,
        }
    }

    pub fn is_default(&self) -> bool {
        self.source == ConfigSource::Default
    }

    pub fn into_value(self) -> T {
        self.value
    }
}

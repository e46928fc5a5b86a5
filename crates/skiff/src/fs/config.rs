//! Per-directory `.skiff.styx` option files.

use std::collections::HashMap;
use std::time::Duration;

use camino::Utf8Path;
use indexmap::IndexMap;
use jiff::SignedDuration;
use regex::Regex;

/// Name of the option file looked up in every schema directory.
pub const CONFIG_FILE: &str = ".skiff.styx";

/// Errors from reading or interpreting options.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// I/O error reading the file
    #[error("failed to read {path}: {message}")]
    Io { path: String, message: String },

    /// Parse error in the Styx file
    #[error("failed to parse {path}: {message}")]
    Parse { path: String, message: String },

    /// An option has a value of the wrong shape
    #[error("option {key}: invalid value {value:?}, expected {expected}")]
    Invalid {
        key: String,
        value: String,
        expected: String,
    },

    /// A required option is missing
    #[error("option {0} is required")]
    Missing(String),
}

/// Flat option map for one directory.
///
/// Values are kept as strings; the typed getters interpret them on demand so
/// that a bad value only fails the operation that needs it.
///
/// ```styx
/// host 127.0.0.1
/// schema app
/// workspace docker
/// docker_image postgres:16
/// lint_pk error
/// ```
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Config {
    options: IndexMap<String, String>,
}

impl Config {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse `.skiff.styx` content. `origin` is only used in error messages.
    pub fn parse(content: &str, origin: &str) -> Result<Self, ConfigError> {
        let raw: HashMap<String, String> =
            facet_styx::from_str(content).map_err(|e| ConfigError::Parse {
                path: origin.to_string(),
                message: e.to_string(),
            })?;
        let mut options: IndexMap<String, String> = raw.into_iter().collect();
        options.sort_keys();
        Ok(Self { options })
    }

    /// Load `.skiff.styx` from `dir`; a missing file is an empty config.
    pub fn load_dir(dir: &Utf8Path) -> Result<Self, ConfigError> {
        let path = dir.join(CONFIG_FILE);
        if !path.exists() {
            return Ok(Self::default());
        }
        let content = std::fs::read_to_string(&path).map_err(|e| ConfigError::Io {
            path: path.to_string(),
            message: e.to_string(),
        })?;
        Self::parse(&content, path.as_str())
    }

    /// Set an option, e.g. from a command-line flag.
    pub fn set(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.options.insert(key.into(), value.into());
    }

    /// This config with every option of `child` laid over it.
    pub fn overlay(&self, child: &Config) -> Config {
        let mut options = self.options.clone();
        for (k, v) in &child.options {
            options.insert(k.clone(), v.clone());
        }
        Config { options }
    }

    pub fn contains(&self, key: &str) -> bool {
        self.options.contains_key(key)
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.options
            .get(key)
            .map(|v| v.trim())
            .filter(|v| !v.is_empty())
    }

    /// A boolean option; missing means `false`.
    pub fn get_bool(&self, key: &str) -> Result<bool, ConfigError> {
        let Some(value) = self.get(key) else {
            return Ok(false);
        };
        match value.to_ascii_lowercase().as_str() {
            "true" | "yes" | "on" | "1" => Ok(true),
            "false" | "no" | "off" | "0" => Ok(false),
            _ => Err(self.invalid(key, value, "a boolean")),
        }
    }

    /// One of `allowed` (case-insensitive); missing means `allowed[0]`.
    pub fn get_enum(&self, key: &str, allowed: &[&str]) -> Result<String, ConfigError> {
        let Some(value) = self.get(key) else {
            return Ok(allowed.first().copied().unwrap_or_default().to_string());
        };
        allowed
            .iter()
            .find(|a| a.eq_ignore_ascii_case(value))
            .map(|a| a.to_string())
            .ok_or_else(|| self.invalid(key, value, &format!("one of {}", allowed.join(", "))))
    }

    pub fn get_regex(&self, key: &str) -> Result<Option<Regex>, ConfigError> {
        self.get(key)
            .map(|value| {
                Regex::new(value).map_err(|e| self.invalid(key, value, &format!("a regex ({})", e)))
            })
            .transpose()
    }

    /// A duration such as `30s`, `1m 30s` or `PT2M`; a bare number is seconds.
    pub fn get_duration(&self, key: &str) -> Result<Option<Duration>, ConfigError> {
        let Some(value) = self.get(key) else {
            return Ok(None);
        };
        if let Ok(secs) = value.parse::<u64>() {
            return Ok(Some(Duration::from_secs(secs)));
        }
        let signed: SignedDuration = value
            .parse()
            .map_err(|e| self.invalid(key, value, &format!("a duration ({})", e)))?;
        Duration::try_from(signed)
            .map(Some)
            .map_err(|_| self.invalid(key, value, "a positive duration"))
    }

    pub fn get_u64(&self, key: &str) -> Result<Option<u64>, ConfigError> {
        self.get(key)
            .map(|value| {
                value
                    .parse()
                    .map_err(|_| self.invalid(key, value, "a non-negative integer"))
            })
            .transpose()
    }

    /// Comma-separated list; missing means empty.
    pub fn get_list(&self, key: &str) -> Vec<String> {
        self.get(key)
            .map(|v| {
                v.split(',')
                    .map(str::trim)
                    .filter(|s| !s.is_empty())
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default()
    }

    fn invalid(&self, key: &str, value: &str, expected: &str) -> ConfigError {
        ConfigError::Invalid {
            key: key.to_string(),
            value: value.to_string(),
            expected: expected.to_string(),
        }
    }
}

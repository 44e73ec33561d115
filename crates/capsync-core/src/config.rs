//! Configuration parsing for capsync.
//!
//! Same key=value format as `.capsync/config`.
//! Precedence: CLI flags > `--config` file > `.capsync/config` > defaults.

use std::path::{Path, PathBuf};
use thiserror::Error;

/// Namespace used when no namespace is specified for list and sync.
pub const DEFAULT_NAMESPACE: &str = "vela-system";
/// Description given to definitions without a description annotation.
pub const DESCRIPTION_UNDEFINED: &str = "description not defined";
/// Annotation key holding a definition's human-readable description.
pub const ANNOTATION_DESCRIPTION: &str = "definition.oam.dev/description";
/// Config file looked up in the working directory.
pub const DEFAULT_CONFIG_PATH: &str = ".capsync/config";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    ReadError(#[from] std::io::Error),
    #[error("invalid config line: {0}")]
    InvalidLine(String),
    #[error("invalid boolean value for {key}: {value}")]
    InvalidBool { key: String, value: String },
    #[error("invalid integer value for {key}: {value}")]
    InvalidInt { key: String, value: String },
}

/// Resolution and sync configuration.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(default)]
pub struct Config {
    /// Namespace definitions are listed from (default: vela-system).
    pub namespace: String,
    /// Local template cache (default: ~/.capsync/capabilities).
    pub cache_dir: PathBuf,
    /// Default label selector for `list`. Empty matches everything.
    pub selector: String,
    /// Items resolved concurrently within one batch (default: 4).
    pub concurrency: usize,
    /// Timeout for remote template fetches in seconds; 0 disables it.
    pub fetch_timeout_sec: u64,
    pub helm_bin: PathBuf,
    /// Bind the chart installer to the terminal's streams (default: true).
    pub interactive_install: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            namespace: DEFAULT_NAMESPACE.to_string(),
            cache_dir: dirs::home_dir().map_or_else(
                || PathBuf::from("~/.capsync/capabilities"),
                |h| h.join(".capsync/capabilities"),
            ),
            selector: String::new(),
            concurrency: 4,
            fetch_timeout_sec: 30,
            helm_bin: PathBuf::from("helm"),
            interactive_install: true,
        }
    }
}

impl Config {
    /// Load config from a file, merging with defaults.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let mut config = Self::default();
        config.load_file(path)?;
        Ok(config)
    }

    /// Load and merge values from a config file.
    pub fn load_file(&mut self, path: &Path) -> Result<(), ConfigError> {
        let content = std::fs::read_to_string(path)?;
        self.parse_content(&content, &path.display().to_string())
    }

    /// Parse config content (key=value format).
    pub fn parse_content(&mut self, content: &str, source: &str) -> Result<(), ConfigError> {
        for line in content.lines() {
            let trimmed = line.trim();

            if trimmed.is_empty() || trimmed.starts_with('#') {
                continue;
            }

            let Some((key, value)) = trimmed.split_once('=') else {
                return Err(ConfigError::InvalidLine(line.to_string()));
            };

            let key = key.trim();
            let value = Self::unquote(value.trim());

            self.apply_value(key, &value, source)?;
        }
        Ok(())
    }

    /// Remove surrounding quotes from a value.
    fn unquote(value: &str) -> String {
        if value.len() >= 2
            && ((value.starts_with('"') && value.ends_with('"'))
                || (value.starts_with('\'') && value.ends_with('\'')))
        {
            return value[1..value.len() - 1].to_string();
        }
        value.to_string()
    }

    fn apply_value(&mut self, key: &str, value: &str, source: &str) -> Result<(), ConfigError> {
        match key {
            "namespace" => {
                if value.is_empty() {
                    return Err(ConfigError::InvalidLine(
                        "namespace must not be empty".to_string(),
                    ));
                }
                self.namespace = value.to_string();
            }
            "cache_dir" => self.cache_dir = expand_home(value),
            "selector" => self.selector = value.to_string(),
            "concurrency" => {
                self.concurrency = Self::parse_int::<usize>(key, value)?.max(1);
            }
            "fetch_timeout_sec" => self.fetch_timeout_sec = Self::parse_int(key, value)?,
            "helm_bin" => self.helm_bin = PathBuf::from(value),
            "interactive_install" => self.interactive_install = Self::parse_bool(key, value)?,
            _ => {
                tracing::warn!(key, source, "unknown config key");
            }
        }
        Ok(())
    }

    fn parse_int<T: std::str::FromStr>(key: &str, value: &str) -> Result<T, ConfigError> {
        value.parse().map_err(|_| ConfigError::InvalidInt {
            key: key.to_string(),
            value: value.to_string(),
        })
    }

    fn parse_bool(key: &str, value: &str) -> Result<bool, ConfigError> {
        match value.to_lowercase().as_str() {
            "true" | "1" | "yes" | "y" | "on" => Ok(true),
            "false" | "0" | "no" | "n" | "off" => Ok(false),
            _ => Err(ConfigError::InvalidBool {
                key: key.to_string(),
                value: value.to_string(),
            }),
        }
    }

    /// Resolve a relative cache directory against a workspace root.
    pub fn resolve_paths(&mut self, workspace_root: &Path) {
        if self.cache_dir.is_relative() {
            self.cache_dir = workspace_root.join(&self.cache_dir);
        }
    }
}

fn expand_home(value: &str) -> PathBuf {
    if let Some(rest) = value.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }
    PathBuf::from(value)
}

// ABOUTME: Application configuration loaded from ~/.devloop/config.toml with env overrides

pub mod project;

pub use project::{CommandSpec, ProjectConfig, PROJECT_FILE};

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use tracing::debug;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ClusterConfig {
    /// Namespace to look for pods in; the kubeconfig default when unset.
    pub namespace: Option<String>,
    /// Kubeconfig context; the current context when unset.
    pub context: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PodmanConfig {
    /// `unix:///path/podman.sock`, `tcp://host:port` or a bare socket path.
    pub host: Option<String>,
    pub timeout_secs: u64,
}

impl Default for PodmanConfig {
    fn default() -> Self {
        Self {
            host: None,
            timeout_secs: 30,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LogsConfig {
    /// How often `--follow` looks for newly started containers; 0 disables it.
    pub discovery_interval_ms: u64,
    pub color: bool,
}

impl Default for LogsConfig {
    fn default() -> Self {
        Self {
            discovery_interval_ms: 2000,
            color: true,
        }
    }
}

impl LogsConfig {
    pub fn discovery_interval(&self) -> Option<Duration> {
        (self.discovery_interval_ms > 0).then(|| Duration::from_millis(self.discovery_interval_ms))
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub cluster: ClusterConfig,
    pub podman: PodmanConfig,
    pub logs: LogsConfig,
    /// Directory for devstate files; `<project>/.devloop` when unset.
    pub state_dir: Option<PathBuf>,
}

impl AppConfig {
    /// Load `~/.devloop/config.toml`, falling back to defaults, then apply env overrides.
    pub fn load() -> Result<Self, ConfigError> {
        let mut config = match Self::default_path() {
            Some(path) if path.exists() => Self::load_from(&path)?,
            _ => Self::default(),
        };
        config.apply_env(|key| std::env::var(key).ok());
        Ok(config)
    }

    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let config = Self::parse(&content).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        debug!("Loaded configuration from {}", path.display());
        Ok(config)
    }

    pub fn parse(content: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(content)
    }

    pub fn default_path() -> Option<PathBuf> {
        dirs::home_dir().map(|home| home.join(".devloop").join("config.toml"))
    }

    pub fn apply_env<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(namespace) = lookup("DEVLOOP_NAMESPACE").filter(|v| !v.is_empty()) {
            self.cluster.namespace = Some(namespace);
        }
        if let Some(context) = lookup("DEVLOOP_KUBE_CONTEXT").filter(|v| !v.is_empty()) {
            self.cluster.context = Some(context);
        }
        if let Some(host) = lookup("CONTAINER_HOST").filter(|v| !v.is_empty()) {
            self.podman.host = Some(host);
        }
    }

    pub fn state_dir_for(&self, project_dir: &Path) -> PathBuf {
        self.state_dir
            .clone()
            .unwrap_or_else(|| project_dir.join(".devloop"))
    }
}

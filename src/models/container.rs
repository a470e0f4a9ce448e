// ABOUTME: Container, mode and platform models discovered from an execution backend
// Containers are never created here; backends own their lifetime

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Execution backend a session runs against.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Platform {
    Cluster,
    Podman,
}

impl Platform {
    pub fn as_str(&self) -> &'static str {
        match self {
            Platform::Cluster => "cluster",
            Platform::Podman => "podman",
        }
    }
}

impl Default for Platform {
    fn default() -> Self {
        Platform::Cluster
    }
}

impl fmt::Display for Platform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Platform {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "cluster" => Ok(Platform::Cluster),
            "podman" => Ok(Platform::Podman),
            other => Err(format!("unknown platform {:?}, expected cluster or podman", other)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Mode {
    Dev,    // Interactive live-coding target
    Deploy, // Production-like deployed instance
}

impl Mode {
    /// Value used for the mode label on platform resources.
    pub fn label_value(&self) -> &'static str {
        match self {
            Mode::Dev => "Dev",
            Mode::Deploy => "Deploy",
        }
    }
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label_value())
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ModeFilterError {
    #[error("pass only one of --dev or --deploy flags; pass no flag to see logs for both modes")]
    ConflictingFlags,
}

/// Which modes a router or aggregator call looks at.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModeFilter {
    Dev,
    Deploy,
    Both,
}

impl ModeFilter {
    /// Build a filter from the `--dev` / `--deploy` flag pair.
    pub fn from_flags(dev: bool, deploy: bool) -> Result<Self, ModeFilterError> {
        match (dev, deploy) {
            (true, true) => Err(ModeFilterError::ConflictingFlags),
            (true, false) => Ok(ModeFilter::Dev),
            (false, true) => Ok(ModeFilter::Deploy),
            (false, false) => Ok(ModeFilter::Both),
        }
    }

    /// Modes in merge order: Dev always precedes Deploy.
    pub fn modes(&self) -> &'static [Mode] {
        match self {
            ModeFilter::Dev => &[Mode::Dev],
            ModeFilter::Deploy => &[Mode::Deploy],
            ModeFilter::Both => &[Mode::Dev, Mode::Deploy],
        }
    }

    pub fn includes(&self, mode: Mode) -> bool {
        self.modes().contains(&mode)
    }
}

impl From<Mode> for ModeFilter {
    fn from(mode: Mode) -> Self {
        match mode {
            Mode::Dev => ModeFilter::Dev,
            Mode::Deploy => ModeFilter::Deploy,
        }
    }
}

/// Component identity used to select platform resources.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ComponentRef {
    pub name: String,
    pub app: String,
}

impl ComponentRef {
    pub fn new(name: impl Into<String>, app: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            app: app.into(),
        }
    }
}

impl fmt::Display for ComponentRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name)
    }
}

/// Backend-specific address of one concrete container instance.
///
/// On a cluster `instance` is the pod name and `container` the container name inside it;
/// on Podman `instance` is the container id and `container` its engine name.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ContainerHandle {
    pub instance: String,
    pub container: String,
}

impl ContainerHandle {
    pub fn new(instance: impl Into<String>, container: impl Into<String>) -> Self {
        Self {
            instance: instance.into(),
            container: container.into(),
        }
    }
}

impl fmt::Display for ContainerHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.instance, self.container)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Container {
    pub logical_name: String,
    pub mode: Mode,
    pub handle: ContainerHandle,
    pub running: bool,
}

impl Container {
    pub fn new(logical_name: impl Into<String>, mode: Mode, handle: ContainerHandle) -> Self {
        Self {
            logical_name: logical_name.into(),
            mode,
            handle,
            running: true,
        }
    }

    pub fn with_running(mut self, running: bool) -> Self {
        self.running = running;
        self
    }
}

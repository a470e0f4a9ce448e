// ABOUTME: Per-project component definition read from devloop.toml
// Supplies the component identity and its command catalog to the session runtime

use super::ConfigError;
use crate::models::{Command, CommandCatalog, CommandKind, ComponentRef, Endpoint};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

pub const PROJECT_FILE: &str = "devloop.toml";

fn default_app() -> String {
    "app".to_string()
}

fn default_kind() -> String {
    "exec".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommandSpec {
    pub id: String,
    #[serde(default = "default_kind")]
    pub kind: String,
    pub container: Option<String>,
    pub command_line: Option<String>,
    pub working_dir: Option<String>,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProjectConfig {
    pub name: String,
    #[serde(default = "default_app")]
    pub app: String,
    #[serde(default)]
    pub commands: Vec<CommandSpec>,
    /// Ports forwarded while a Dev session runs.
    #[serde(default)]
    pub endpoints: Vec<Endpoint>,
}

impl ProjectConfig {
    /// Load `devloop.toml` from `dir`; `Ok(None)` when the directory has none.
    pub fn load_from_dir(dir: &Path) -> Result<Option<Self>, ConfigError> {
        let path = dir.join(PROJECT_FILE);
        if !path.exists() {
            return Ok(None);
        }
        let content = std::fs::read_to_string(&path).map_err(|source| ConfigError::Read {
            path: path.clone(),
            source,
        })?;
        Self::parse(&content, &path).map(Some)
    }

    pub fn parse(content: &str, path: &Path) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(content).map_err(|source| ConfigError::Parse {
            path: PathBuf::from(path),
            source,
        })?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.name.trim().is_empty() {
            return Err(ConfigError::Invalid("component name must not be empty".to_string()));
        }
        for spec in &self.commands {
            spec.to_command()?;
        }
        for endpoint in &self.endpoints {
            if endpoint.target_port == 0 {
                return Err(ConfigError::Invalid(format!(
                    "endpoint {:?} has no target_port",
                    endpoint.name
                )));
            }
        }
        Ok(())
    }

    pub fn component(&self) -> ComponentRef {
        ComponentRef::new(self.name.clone(), self.app.clone())
    }
}

impl CommandSpec {
    fn to_command(&self) -> Result<Command, ConfigError> {
        let kind = match self.kind.as_str() {
            "exec" => {
                let command_line = self.command_line.clone().ok_or_else(|| {
                    ConfigError::Invalid(format!("exec command {:?} has no command_line", self.id))
                })?;
                if self.container.is_none() {
                    return Err(ConfigError::Invalid(format!(
                        "exec command {:?} has no container",
                        self.id
                    )));
                }
                CommandKind::Exec {
                    command_line,
                    working_dir: self.working_dir.clone(),
                    env: self
                        .env
                        .iter()
                        .map(|(k, v)| (k.clone(), v.clone()))
                        .collect(),
                }
            }
            "apply" => CommandKind::Apply,
            "composite" => CommandKind::Composite,
            other => {
                return Err(ConfigError::Invalid(format!(
                    "command {:?} has unknown kind {:?}",
                    self.id, other
                )))
            }
        };

        Ok(Command {
            name: self.id.clone(),
            kind,
            target_container: self.container.clone().unwrap_or_default(),
        })
    }
}

impl CommandCatalog for ProjectConfig {
    fn commands(&self) -> Vec<Command> {
        // validate() already rejected malformed specs
        self.commands
            .iter()
            .filter_map(|spec| spec.to_command().ok())
            .collect()
    }
}

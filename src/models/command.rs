// ABOUTME: Named component commands and the read-only catalog they are looked up in

use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum CommandKind {
    Exec {
        command_line: String,
        working_dir: Option<String>,
        env: Vec<(String, String)>,
    },
    Apply,
    Composite,
}

impl CommandKind {
    pub fn name(&self) -> &'static str {
        match self {
            CommandKind::Exec { .. } => "exec",
            CommandKind::Apply => "apply",
            CommandKind::Composite => "composite",
        }
    }
}

impl fmt::Display for CommandKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Command {
    pub name: String,
    pub kind: CommandKind,
    pub target_container: String,
}

impl Command {
    pub fn exec(
        name: impl Into<String>,
        target_container: impl Into<String>,
        command_line: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            kind: CommandKind::Exec {
                command_line: command_line.into(),
                working_dir: None,
                env: Vec::new(),
            },
            target_container: target_container.into(),
        }
    }

    /// Argument vector to run inside the target container, or `None` for commands
    /// that are not executed in a container.
    pub fn shell_invocation(&self) -> Option<Vec<String>> {
        let CommandKind::Exec {
            command_line,
            working_dir,
            env,
        } = &self.kind
        else {
            return None;
        };

        let mut script = String::new();
        if let Some(dir) = working_dir.as_deref().filter(|d| !d.is_empty()) {
            script.push_str(&format!("cd {} && ", shell_quote(dir)));
        }
        if !env.is_empty() {
            let exports: Vec<String> = env
                .iter()
                .map(|(key, value)| format!("export {}={}", key, shell_quote(value)))
                .collect();
            script.push_str(&exports.join(" && "));
            script.push_str(" && ");
        }
        script.push_str(&format!("({})", command_line));

        Some(vec!["/bin/sh".to_string(), "-c".to_string(), script])
    }
}

/// Single-quote `value` for `sh`.
fn shell_quote(value: &str) -> String {
    format!("'{}'", value.replace('\'', "'\\''"))
}

/// Read-only command catalog supplied by the component definition.
pub trait CommandCatalog: Send + Sync {
    fn commands(&self) -> Vec<Command>;

    fn find(&self, name: &str) -> Option<Command> {
        self.commands().into_iter().find(|command| command.name == name)
    }
}

impl CommandCatalog for Vec<Command> {
    fn commands(&self) -> Vec<Command> {
        self.clone()
    }
}

// ABOUTME: Command router resolving a named command to its Dev container and executing it
// Reads the runtime view only; never changes container or session state

use crate::models::{CommandCatalog, ComponentRef, Mode, Platform};
use crate::platform::{ExecStream, PlatformError, PlatformSet};
use crate::runtime::{ComponentRuntimeView, RuntimeError};
use crate::session::signal::StopSignal;
use crate::session::{SessionManager, StateStore};
use futures_util::StreamExt;
use std::sync::Arc;
use thiserror::Error;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tracing::{debug, info, warn};

#[derive(Error, Debug)]
pub enum RouterError {
    #[error(transparent)]
    Runtime(#[from] RuntimeError),
    #[error(transparent)]
    Platform(#[from] PlatformError),
    #[error("command \"{name}\" is a {kind} command and cannot be run in a container")]
    NotExecutable { name: String, kind: String },
    #[error("component \"{component}\" is running in Dev mode on {active}; pass --platform {active} to run commands against it (requested {requested})")]
    PlatformMismatch {
        component: String,
        active: Platform,
        requested: Platform,
    },
    #[error("failed to write output of command \"{command}\": {source}")]
    Io {
        command: String,
        #[source]
        source: std::io::Error,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunOutcome {
    /// The remote process finished with this status.
    Exited(i64),
    /// The stop signal fired before the command finished.
    Cancelled,
}

#[derive(Clone)]
pub struct CommandRouter {
    component: ComponentRef,
    catalog: Arc<dyn CommandCatalog>,
    platforms: PlatformSet,
    sessions: Option<SessionManager>,
    state: Option<StateStore>,
}

impl CommandRouter {
    pub fn new(
        component: ComponentRef,
        catalog: Arc<dyn CommandCatalog>,
        platforms: PlatformSet,
    ) -> Self {
        Self {
            component,
            catalog,
            platforms,
            sessions: None,
            state: None,
        }
    }

    /// Reject runs against a platform other than the one the Dev session uses.
    pub fn with_sessions(mut self, sessions: SessionManager) -> Self {
        self.sessions = Some(sessions);
        self
    }

    /// Same check against Dev sessions recorded by other processes.
    pub fn with_state_store(mut self, store: StateStore) -> Self {
        self.state = Some(store);
        self
    }

    pub async fn run<W>(
        &self,
        name: &str,
        platform: Platform,
        out: &mut W,
        stop: &StopSignal,
    ) -> Result<RunOutcome, RouterError>
    where
        W: AsyncWrite + Unpin + Send,
    {
        let adapter = self.platforms.get(platform)?;
        adapter.ping().await?;
        self.check_session_platform(platform).await?;

        let view = ComponentRuntimeView::new(
            self.component.clone(),
            adapter.clone(),
            self.catalog.clone(),
        );
        let command = view.command(name)?;
        let argv = command
            .shell_invocation()
            .ok_or_else(|| RouterError::NotExecutable {
                name: command.name.clone(),
                kind: command.kind.name().to_string(),
            })?;
        let (_, container) = view.resolve(name).await?;

        info!(
            command = name,
            container = %container.handle,
            platform = %platform,
            "Executing command"
        );
        let io_err = |source: std::io::Error| RouterError::Io {
            command: name.to_string(),
            source,
        };
        let header = format!("Executing command in container (command: {})\n", name);
        out.write_all(header.as_bytes()).await.map_err(io_err)?;
        out.flush().await.map_err(io_err)?;

        let ExecStream { mut output, exit } = tokio::select! {
            _ = stop.stopped() => return Ok(Self::cancelled(name)),
            exec = adapter.exec(&container, &argv) => exec?,
        };

        loop {
            let next = tokio::select! {
                _ = stop.stopped() => return Ok(Self::cancelled(name)),
                next = output.next() => next,
            };
            match next {
                Some(Ok(line)) => {
                    out.write_all(line.as_bytes()).await.map_err(io_err)?;
                    out.write_all(b"\n").await.map_err(io_err)?;
                }
                Some(Err(e)) => return Err(e.into()),
                None => break,
            }
        }
        out.flush().await.map_err(io_err)?;

        let status = tokio::select! {
            _ = stop.stopped() => return Ok(Self::cancelled(name)),
            status = exit => status?,
        };
        debug!("Command {} exited with status {}", name, status);
        Ok(RunOutcome::Exited(status))
    }

    fn cancelled(name: &str) -> RunOutcome {
        info!("Command {} cancelled", name);
        RunOutcome::Cancelled
    }

    async fn check_session_platform(&self, requested: Platform) -> Result<(), RouterError> {
        let mut active = None;
        if let Some(sessions) = &self.sessions {
            active = sessions
                .active(&self.component, Mode::Dev)
                .await
                .map(|session| session.platform);
        }
        if let (None, Some(store)) = (active, &self.state) {
            active = store
                .active_platform(&self.component.name, Mode::Dev)
                .unwrap_or_else(|e| {
                    warn!("Unable to read session state: {}", e);
                    None
                });
        }

        match active {
            Some(active) if active != requested => Err(RouterError::PlatformMismatch {
                component: self.component.name.clone(),
                active,
                requested,
            }),
            _ => Ok(()),
        }
    }
}

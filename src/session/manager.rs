// ABOUTME: Session manager owning the lifecycle of Dev and Deploy sessions on a platform
// Start and stop are serialized; every task a session spawns is joined before stop returns

use super::persistence::{PersistenceError, SessionRecord, StateStore};
use super::signal::{StopSignal, TaskGroup};
use crate::models::{
    ComponentRef, Endpoint, ForwardedPort, InvalidTransition, Mode, OwnedResource, Platform,
    Session, SessionEvent, SessionId, SessionState,
};
use crate::platform::{PlatformAdapter, PlatformError, PlatformSet};
use futures_util::future::BoxFuture;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{watch, Mutex};
use tracing::{debug, error, info, warn};

#[derive(Error, Debug)]
pub enum SessionError {
    #[error(transparent)]
    Platform(#[from] PlatformError),
    #[error("a {mode} session of component \"{component}\" is already running ({id})")]
    AlreadyRunning {
        component: String,
        mode: Mode,
        id: SessionId,
    },
    #[error("session {0} not found")]
    NotFound(SessionId),
    #[error("session {id} is {state}, not running")]
    NotRunning { id: SessionId, state: SessionState },
    #[error(transparent)]
    Transition(#[from] InvalidTransition),
    #[error("failed to {operation} session state: {source}")]
    Persistence {
        operation: &'static str,
        #[source]
        source: PersistenceError,
    },
}

#[derive(Debug, Clone)]
pub struct SessionRequest {
    pub component: ComponentRef,
    pub mode: Mode,
    pub platform: Platform,
    /// Forwarded for Dev sessions only.
    pub endpoints: Vec<Endpoint>,
}

/// Forwards opened during start, served by the session's tasks once it runs.
type Forwards = Vec<(ForwardedPort, BoxFuture<'static, ()>)>;

struct SessionEntry {
    session: Session,
    tasks: Option<TaskGroup>,
    done: watch::Sender<bool>,
}

impl SessionEntry {
    fn new(session: Session, tasks: Option<TaskGroup>) -> Self {
        let finished = session.state.is_terminal();
        let (done, _) = watch::channel(finished);
        Self {
            session,
            tasks,
            done,
        }
    }

    /// Occupies the (component, mode) slot until it has fully stopped.
    fn holds_slot(&self, component: &ComponentRef, mode: Mode) -> bool {
        self.session.component == *component
            && self.session.mode == mode
            && !self.session.state.is_terminal()
    }
}

struct Inner {
    platforms: PlatformSet,
    store: Option<StateStore>,
    // Held across the whole of start and stop
    transitions: Mutex<()>,
    sessions: Mutex<HashMap<SessionId, SessionEntry>>,
}

#[derive(Clone)]
pub struct SessionManager {
    inner: Arc<Inner>,
}

impl SessionManager {
    pub fn new(platforms: PlatformSet) -> Self {
        Self::build(platforms, None)
    }

    pub fn with_state_store(platforms: PlatformSet, store: StateStore) -> Self {
        Self::build(platforms, Some(store))
    }

    fn build(platforms: PlatformSet, store: Option<StateStore>) -> Self {
        Self {
            inner: Arc::new(Inner {
                platforms,
                store,
                transitions: Mutex::new(()),
                sessions: Mutex::new(HashMap::new()),
            }),
        }
    }

    pub fn platforms(&self) -> &PlatformSet {
        &self.inner.platforms
    }

    /// Start a session. A failed start is kept in the table as `Failed` and never
    /// reaches `Running`.
    pub async fn start(&self, request: SessionRequest) -> Result<Session, SessionError> {
        let _transition = self.inner.transitions.lock().await;

        {
            let sessions = self.inner.sessions.lock().await;
            if let Some(existing) = sessions
                .values()
                .find(|entry| entry.holds_slot(&request.component, request.mode))
            {
                return Err(SessionError::AlreadyRunning {
                    component: request.component.name.clone(),
                    mode: request.mode,
                    id: existing.session.id,
                });
            }
        }

        let mut session = Session::new(request.component, request.platform, request.mode);
        info!(
            "Starting {} session {} of {} on {}",
            session.mode, session.id, session.component, session.platform
        );

        let forwards = match self.provision(&mut session, &request.endpoints).await {
            Ok(forwards) => forwards,
            Err(e) => {
                warn!("Session {} failed to start: {}", session.id, e);
                session.apply(SessionEvent::StartFailed(e.to_string()))?;
                self.insert(SessionEntry::new(session, None)).await;
                return Err(e);
            }
        };

        let mut tasks = TaskGroup::new();
        for (forwarded, serve) in forwards {
            session.add_resource(OwnedResource::PortForward(forwarded));
            tasks.spawn(move |signal| async move {
                tokio::select! {
                    _ = signal.stopped() => {}
                    _ = serve => {}
                }
            });
        }

        session.apply(SessionEvent::Started)?;
        info!("Session {} is running", session.id);
        self.insert(SessionEntry::new(session.clone(), Some(tasks)))
            .await;
        Ok(session)
    }

    async fn provision(
        &self,
        session: &mut Session,
        endpoints: &[Endpoint],
    ) -> Result<Forwards, SessionError> {
        let adapter = self.inner.platforms.get(session.platform)?;
        adapter.ping().await?;

        if let Some(store) = &self.inner.store {
            store
                .check_platform_free(session.platform, session.mode)
                .map_err(|source| SessionError::Persistence {
                    operation: "save",
                    source,
                })?;
        }

        let forwards = if session.mode == Mode::Dev {
            Self::forward_endpoints(adapter.as_ref(), &session.component, endpoints).await?
        } else {
            Vec::new()
        };

        if let Some(store) = &self.inner.store {
            let path = store
                .save(SessionRecord {
                    session_id: session.id,
                    component: session.component.name.clone(),
                    platform: session.platform,
                    mode: session.mode,
                    started_at: session.created_at,
                    forwarded_ports: forwards.iter().map(|(forwarded, _)| forwarded.clone()).collect(),
                })
                .map_err(|source| SessionError::Persistence {
                    operation: "save",
                    source,
                })?;
            session.add_resource(OwnedResource::StateFile(path));
        }
        Ok(forwards)
    }

    /// Open a forward for each endpoint whose container is running. Endpoints of
    /// containers that are not running yet are skipped.
    async fn forward_endpoints(
        adapter: &dyn PlatformAdapter,
        component: &ComponentRef,
        endpoints: &[Endpoint],
    ) -> Result<Forwards, SessionError> {
        if endpoints.is_empty() {
            return Ok(Vec::new());
        }
        let containers = adapter.list_containers(component, Mode::Dev).await?;

        let mut forwards = Vec::new();
        for endpoint in endpoints {
            let Some(container) = containers
                .iter()
                .find(|container| container.running && container.logical_name == endpoint.container)
            else {
                warn!(
                    "Container {} is not running, not forwarding endpoint {}",
                    endpoint.container, endpoint.name
                );
                continue;
            };

            let forward = adapter.forward_port(container, endpoint.target_port).await?;
            let forwarded = ForwardedPort {
                endpoint: endpoint.name.clone(),
                container: endpoint.container.clone(),
                local_address: forward.local_address,
                local_port: forward.local_port,
                container_port: endpoint.target_port,
            };
            info!("Forwarding endpoint {}: {}", endpoint.name, forwarded);
            forwards.push((forwarded, forward.serve));
        }
        Ok(forwards)
    }

    async fn insert(&self, entry: SessionEntry) {
        self.inner
            .sessions
            .lock()
            .await
            .insert(entry.session.id, entry);
    }

    /// Stop a running session and join all of its tasks. Stopping a session that is
    /// unknown, failed or already stopped is a no-op.
    pub async fn stop(&self, id: SessionId) -> Result<(), SessionError> {
        let _transition = self.inner.transitions.lock().await;

        let (tasks, resources) = {
            let mut sessions = self.inner.sessions.lock().await;
            let Some(entry) = sessions.get_mut(&id) else {
                debug!("Stop requested for unknown session {}", id);
                return Ok(());
            };
            if !entry.session.state.is_running() {
                debug!("Session {} is {}, nothing to stop", id, entry.session.state);
                return Ok(());
            }
            entry.session.apply(SessionEvent::StopRequested)?;
            (entry.tasks.take(), entry.session.owned_resources.clone())
        };

        info!("Stopping session {}", id);
        if let Some(mut tasks) = tasks {
            tasks.shutdown().await;
        }
        self.release(id, &resources);

        let mut sessions = self.inner.sessions.lock().await;
        if let Some(entry) = sessions.get_mut(&id) {
            entry.session.apply(SessionEvent::Stopped)?;
            entry.done.send_replace(true);
        }
        info!("Session {} stopped", id);
        Ok(())
    }

    fn release(&self, id: SessionId, resources: &[OwnedResource]) {
        for resource in resources {
            match resource {
                OwnedResource::StateFile(path) => {
                    let Some(store) = &self.inner.store else {
                        continue;
                    };
                    if let Err(e) = store.remove(id) {
                        error!("Failed to remove state file {}: {}", path.display(), e);
                    }
                }
                OwnedResource::PortForward(forwarded) => {
                    // Its serving task was joined by the task group shutdown
                    info!("Stopped forwarding {}", forwarded);
                }
                // Joined by the task group shutdown
                OwnedResource::Task(_) => {}
            }
        }
    }

    pub async fn stop_all(&self) -> Result<(), SessionError> {
        let running: Vec<SessionId> = self
            .inner
            .sessions
            .lock()
            .await
            .values()
            .filter(|entry| entry.session.state.is_running())
            .map(|entry| entry.session.id)
            .collect();

        for id in running {
            self.stop(id).await?;
        }
        Ok(())
    }

    /// Run `task` as part of session `id`; it receives the session's stop signal and
    /// is joined when the session stops.
    pub async fn spawn<F, Fut>(&self, id: SessionId, name: &str, task: F) -> Result<(), SessionError>
    where
        F: FnOnce(StopSignal) -> Fut,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let mut sessions = self.inner.sessions.lock().await;
        let entry = sessions.get_mut(&id).ok_or(SessionError::NotFound(id))?;
        let state = entry.session.state.clone();
        let Some(tasks) = entry.tasks.as_mut().filter(|_| state.is_running()) else {
            return Err(SessionError::NotRunning { id, state });
        };

        tasks.spawn(task);
        entry
            .session
            .add_resource(OwnedResource::Task(name.to_string()));
        debug!("Spawned task {} in session {}", name, id);
        Ok(())
    }

    /// The stop signal every task of session `id` observes.
    pub async fn signal(&self, id: SessionId) -> Result<StopSignal, SessionError> {
        let sessions = self.inner.sessions.lock().await;
        let entry = sessions.get(&id).ok_or(SessionError::NotFound(id))?;
        entry
            .tasks
            .as_ref()
            .map(TaskGroup::signal)
            .ok_or_else(|| SessionError::NotRunning {
                id,
                state: entry.session.state.clone(),
            })
    }

    /// Block until session `id` has stopped and all of its tasks have exited.
    pub async fn wait_end(&self, id: SessionId) -> Result<(), SessionError> {
        let mut done = {
            let sessions = self.inner.sessions.lock().await;
            sessions
                .get(&id)
                .ok_or(SessionError::NotFound(id))?
                .done
                .subscribe()
        };
        // The sender lives as long as the entry, which is never removed
        let _ = done.wait_for(|finished| *finished).await;
        Ok(())
    }

    pub async fn get(&self, id: SessionId) -> Option<Session> {
        self.inner
            .sessions
            .lock()
            .await
            .get(&id)
            .map(|entry| entry.session.clone())
    }

    pub async fn list(&self) -> Vec<Session> {
        let mut sessions: Vec<Session> = self
            .inner
            .sessions
            .lock()
            .await
            .values()
            .map(|entry| entry.session.clone())
            .collect();
        sessions.sort_by_key(|session| session.created_at);
        sessions
    }

    /// The running session of `component` in `mode`, if any.
    pub async fn active(&self, component: &ComponentRef, mode: Mode) -> Option<Session> {
        self.inner
            .sessions
            .lock()
            .await
            .values()
            .find(|entry| {
                entry.session.component == *component
                    && entry.session.mode == mode
                    && entry.session.state.is_running()
            })
            .map(|entry| entry.session.clone())
    }

    /// State files left behind by processes that exited without stopping.
    pub fn orphan_state_files(&self) -> Vec<std::path::PathBuf> {
        let Some(store) = &self.inner.store else {
            return Vec::new();
        };
        store.orphans().unwrap_or_else(|e| {
            warn!("Unable to scan for orphaned state files: {}", e);
            Vec::new()
        })
    }
}

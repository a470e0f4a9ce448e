// ABOUTME: In-memory platform used by the integration tests
// Containers, buffered logs, live log lines and exec results are scripted per test

#![allow(dead_code)]

use async_trait::async_trait;
use devloop::models::{Command, ComponentRef, Container, ContainerHandle, Mode, Platform};
use devloop::platform::{ExecStream, LineStream, PlatformAdapter, PlatformError, PortForward};
use futures_util::{stream, FutureExt, StreamExt};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;

pub struct FakePlatform {
    platform: Platform,
    unreachable: Mutex<Option<String>>,
    failing_modes: Mutex<HashSet<Mode>>,
    containers: Mutex<Vec<Container>>,
    logs: Mutex<HashMap<ContainerHandle, Vec<String>>>,
    live: Mutex<HashMap<ContainerHandle, mpsc::UnboundedSender<String>>>,
    exec_result: Mutex<Option<(Vec<String>, i64)>>,
    execs: Mutex<Vec<(ContainerHandle, Vec<String>)>>,
    forward_failure: Mutex<Option<String>>,
    serving_forwards: Arc<AtomicUsize>,
    calls: AtomicUsize,
}

/// Counts a forward as served until its future is dropped.
struct ServingGuard(Arc<AtomicUsize>);

impl Drop for ServingGuard {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

impl FakePlatform {
    pub fn new(platform: Platform) -> Arc<Self> {
        Arc::new(Self {
            platform,
            unreachable: Mutex::new(None),
            failing_modes: Mutex::new(HashSet::new()),
            containers: Mutex::new(Vec::new()),
            logs: Mutex::new(HashMap::new()),
            live: Mutex::new(HashMap::new()),
            exec_result: Mutex::new(Some((Vec::new(), 0))),
            execs: Mutex::new(Vec::new()),
            forward_failure: Mutex::new(None),
            serving_forwards: Arc::new(AtomicUsize::new(0)),
            calls: AtomicUsize::new(0),
        })
    }

    pub fn set_unreachable(&self, cause: &str) {
        *self.unreachable.lock().unwrap() = Some(cause.to_string());
    }

    pub fn fail_mode(&self, mode: Mode) {
        self.failing_modes.lock().unwrap().insert(mode);
    }

    /// Add a running container whose buffered log is `lines`.
    pub fn add_container(&self, name: &str, instance: &str, mode: Mode, lines: &[&str]) -> Container {
        let container = Container::new(name, mode, ContainerHandle::new(instance, name));
        self.containers.lock().unwrap().push(container.clone());
        self.logs.lock().unwrap().insert(
            container.handle.clone(),
            lines.iter().map(|line| line.to_string()).collect(),
        );
        container
    }

    pub fn add_stopped_container(&self, name: &str, instance: &str, mode: Mode) {
        let container =
            Container::new(name, mode, ContainerHandle::new(instance, name)).with_running(false);
        self.containers.lock().unwrap().push(container);
    }

    /// Emit a line on a followed container's live log.
    pub fn push_live(&self, container: &Container, line: &str) -> bool {
        self.live
            .lock()
            .unwrap()
            .get(&container.handle)
            .map(|tx| tx.send(line.to_string()).is_ok())
            .unwrap_or(false)
    }

    /// End a followed container's live log.
    pub fn close_live(&self, container: &Container) {
        self.live.lock().unwrap().remove(&container.handle);
    }

    pub fn is_followed(&self, container: &Container) -> bool {
        self.live.lock().unwrap().contains_key(&container.handle)
    }

    /// `None` makes exec hang until cancelled.
    pub fn set_exec_result(&self, result: Option<(Vec<&str>, i64)>) {
        *self.exec_result.lock().unwrap() = result.map(|(lines, status)| {
            (lines.into_iter().map(String::from).collect(), status)
        });
    }

    pub fn execs(&self) -> Vec<(ContainerHandle, Vec<String>)> {
        self.execs.lock().unwrap().clone()
    }

    pub fn fail_forwards(&self, message: &str) {
        *self.forward_failure.lock().unwrap() = Some(message.to_string());
    }

    /// Forwards opened and not yet dropped.
    pub fn serving_forwards(&self) -> usize {
        self.serving_forwards.load(Ordering::SeqCst)
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    fn check_reachable(&self) -> Result<(), PlatformError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        match self.unreachable.lock().unwrap().clone() {
            Some(cause) => Err(PlatformError::unreachable(self.platform, cause)),
            None => Ok(()),
        }
    }
}

#[async_trait]
impl PlatformAdapter for FakePlatform {
    fn platform(&self) -> Platform {
        self.platform
    }

    async fn ping(&self) -> Result<(), PlatformError> {
        self.check_reachable()
    }

    async fn list_containers(
        &self,
        _component: &ComponentRef,
        mode: Mode,
    ) -> Result<Vec<Container>, PlatformError> {
        self.check_reachable()?;
        if self.failing_modes.lock().unwrap().contains(&mode) {
            return Err(PlatformError::backend(self.platform, format!("{} listing failed", mode)));
        }
        Ok(self
            .containers
            .lock()
            .unwrap()
            .iter()
            .filter(|container| container.mode == mode)
            .cloned()
            .collect())
    }

    async fn fetch_logs(&self, container: &Container) -> Result<LineStream, PlatformError> {
        self.check_reachable()?;
        let lines = self
            .logs
            .lock()
            .unwrap()
            .get(&container.handle)
            .cloned()
            .ok_or_else(|| PlatformError::ContainerGone(container.handle.clone()))?;
        Ok(stream::iter(lines.into_iter().map(Ok)).boxed())
    }

    async fn stream_logs(&self, container: &Container) -> Result<LineStream, PlatformError> {
        self.check_reachable()?;
        let buffered = self
            .logs
            .lock()
            .unwrap()
            .get(&container.handle)
            .cloned()
            .ok_or_else(|| PlatformError::ContainerGone(container.handle.clone()))?;

        let (tx, rx) = mpsc::unbounded_channel();
        for line in buffered {
            let _ = tx.send(line);
        }
        self.live.lock().unwrap().insert(container.handle.clone(), tx);
        Ok(UnboundedReceiverStream::new(rx).map(Ok).boxed())
    }

    async fn exec(
        &self,
        container: &Container,
        command: &[String],
    ) -> Result<ExecStream, PlatformError> {
        self.check_reachable()?;
        self.execs
            .lock()
            .unwrap()
            .push((container.handle.clone(), command.to_vec()));

        match self.exec_result.lock().unwrap().clone() {
            Some((lines, status)) => Ok(ExecStream {
                output: stream::iter(lines.into_iter().map(Ok)).boxed(),
                exit: async move { Ok(status) }.boxed(),
            }),
            None => Ok(ExecStream {
                output: stream::pending().boxed(),
                exit: std::future::pending().boxed(),
            }),
        }
    }

    /// Local port is the container port shifted by 20000.
    async fn forward_port(
        &self,
        _container: &Container,
        port: u16,
    ) -> Result<PortForward, PlatformError> {
        self.check_reachable()?;
        if let Some(message) = self.forward_failure.lock().unwrap().clone() {
            return Err(PlatformError::backend(self.platform, message));
        }

        self.serving_forwards.fetch_add(1, Ordering::SeqCst);
        let guard = ServingGuard(self.serving_forwards.clone());
        Ok(PortForward {
            local_address: "127.0.0.1".to_string(),
            local_port: port + 20000,
            serve: async move {
                let _guard = guard;
                std::future::pending::<()>().await
            }
            .boxed(),
        })
    }
}

pub fn component() -> ComponentRef {
    ComponentRef::new("nodejs", "app")
}

pub fn catalog() -> Arc<Vec<Command>> {
    Arc::new(vec![
        Command::exec("create-file", "runtime", "touch /tmp/new-file"),
        Command::exec("build", "runtime", "npm install"),
    ])
}

/// Poll `condition` until it holds or a second passes.
pub async fn eventually<F: Fn() -> bool>(condition: F) -> bool {
    for _ in 0..100 {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    condition()
}

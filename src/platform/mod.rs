// ABOUTME: Execution backend abstraction shared by the cluster and Podman adapters
// Callers only depend on PlatformAdapter, never on a concrete backend

pub mod cluster;
pub mod labels;
pub mod podman;

pub use cluster::ClusterAdapter;
pub use podman::PodmanAdapter;

use crate::models::{ComponentRef, Container, ContainerHandle, Mode, Platform};
use async_trait::async_trait;
use futures_util::future::BoxFuture;
use futures_util::stream::BoxStream;
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PlatformError {
    #[error("unable to access the cluster: {0}")]
    ClusterUnreachable(String),
    #[error("unable to access podman. Do you have podman installed and configured correctly? cause: {0}")]
    PodmanUnreachable(String),
    #[error("platform {0} is not configured")]
    NotConfigured(Platform),
    #[error("container {0} no longer exists")]
    ContainerGone(ContainerHandle),
    #[error("{platform} error: {message}")]
    Backend { platform: Platform, message: String },
}

impl PlatformError {
    pub fn unreachable(platform: Platform, cause: impl ToString) -> Self {
        match platform {
            Platform::Cluster => PlatformError::ClusterUnreachable(cause.to_string()),
            Platform::Podman => PlatformError::PodmanUnreachable(cause.to_string()),
        }
    }

    pub fn backend(platform: Platform, message: impl ToString) -> Self {
        PlatformError::Backend {
            platform,
            message: message.to_string(),
        }
    }

    pub fn is_unreachable(&self) -> bool {
        matches!(
            self,
            PlatformError::ClusterUnreachable(_) | PlatformError::PodmanUnreachable(_)
        )
    }
}

/// Lines of container output, without trailing newlines.
pub type LineStream = BoxStream<'static, Result<String, PlatformError>>;

/// A command running inside a container.
///
/// `exit` resolves once the remote process has finished; poll it after `output` is
/// drained. Dropping either half cancels the remote call.
pub struct ExecStream {
    pub output: LineStream,
    pub exit: BoxFuture<'static, Result<i64, PlatformError>>,
}

impl std::fmt::Debug for ExecStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecStream").finish_non_exhaustive()
    }
}

/// A local address reaching a container port.
///
/// `serve` carries the connections while it is polled; dropping it closes the local
/// listener. Backends that publish ports themselves return a future that never ends.
pub struct PortForward {
    pub local_address: String,
    pub local_port: u16,
    pub serve: BoxFuture<'static, ()>,
}

impl std::fmt::Debug for PortForward {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PortForward")
            .field("local_address", &self.local_address)
            .field("local_port", &self.local_port)
            .finish_non_exhaustive()
    }
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait PlatformAdapter: Send + Sync {
    fn platform(&self) -> Platform;

    /// Check the backend is reachable; fails with the backend's unreachable diagnostic.
    async fn ping(&self) -> Result<(), PlatformError>;

    /// Containers of `component` running in `mode`, in discovery order. Zero
    /// containers is not an error.
    async fn list_containers(
        &self,
        component: &ComponentRef,
        mode: Mode,
    ) -> Result<Vec<Container>, PlatformError>;

    /// Point-in-time log of a container; the stream ends after the buffered output.
    async fn fetch_logs(&self, container: &Container) -> Result<LineStream, PlatformError>;

    /// Live log of a container; the stream ends when the container's log closes.
    async fn stream_logs(&self, container: &Container) -> Result<LineStream, PlatformError>;

    async fn exec(
        &self,
        container: &Container,
        command: &[String],
    ) -> Result<ExecStream, PlatformError>;

    /// Make `port` of `container` reachable from this machine.
    async fn forward_port(&self, container: &Container, port: u16)
        -> Result<PortForward, PlatformError>;
}

/// The adapters available to this process, one per platform.
#[derive(Clone, Default)]
pub struct PlatformSet {
    adapters: HashMap<Platform, Arc<dyn PlatformAdapter>>,
}

impl PlatformSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_adapter(mut self, adapter: Arc<dyn PlatformAdapter>) -> Self {
        self.insert(adapter);
        self
    }

    pub fn insert(&mut self, adapter: Arc<dyn PlatformAdapter>) {
        self.adapters.insert(adapter.platform(), adapter);
    }

    pub fn get(&self, platform: Platform) -> Result<Arc<dyn PlatformAdapter>, PlatformError> {
        self.adapters
            .get(&platform)
            .cloned()
            .ok_or(PlatformError::NotConfigured(platform))
    }

    pub fn platforms(&self) -> Vec<Platform> {
        let mut platforms: Vec<Platform> = self.adapters.keys().copied().collect();
        platforms.sort_by_key(|p| p.as_str());
        platforms
    }
}

impl std::fmt::Debug for PlatformSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PlatformSet")
            .field("platforms", &self.platforms())
            .finish()
    }
}

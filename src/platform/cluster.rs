// ABOUTME: Kubernetes adapter finding component pods by label and exec'ing into them
// The client is built lazily so an unreachable cluster surfaces on first use

use super::labels;
use super::{ExecStream, LineStream, PlatformAdapter, PlatformError, PortForward};
use crate::config::ClusterConfig;
use crate::models::{ComponentRef, Container, ContainerHandle, Mode, Platform};
use async_trait::async_trait;
use futures_util::{AsyncBufReadExt, FutureExt, StreamExt, TryStreamExt};
use k8s_openapi::api::core::v1::Pod;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::Status;
use kube::api::{Api, AttachParams, ListParams, LogParams};
use kube::config::{Config, KubeConfigOptions};
use kube::Client;
use tokio::io::AsyncBufReadExt as _;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::OnceCell;
use tokio_stream::wrappers::LinesStream;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

struct Connection {
    client: Client,
    namespace: String,
}

pub struct ClusterAdapter {
    config: ClusterConfig,
    connection: OnceCell<Connection>,
}

impl ClusterAdapter {
    pub fn new(config: ClusterConfig) -> Self {
        Self {
            config,
            connection: OnceCell::new(),
        }
    }

    async fn connection(&self) -> Result<&Connection, PlatformError> {
        self.connection.get_or_try_init(|| self.connect()).await
    }

    async fn connect(&self) -> Result<Connection, PlatformError> {
        let kube_config = match &self.config.context {
            Some(context) => Config::from_kubeconfig(&KubeConfigOptions {
                context: Some(context.clone()),
                ..Default::default()
            })
            .await
            .map_err(|e| PlatformError::unreachable(Platform::Cluster, e))?,
            None => Config::infer()
                .await
                .map_err(|e| PlatformError::unreachable(Platform::Cluster, e))?,
        };

        let namespace = self
            .config
            .namespace
            .clone()
            .unwrap_or_else(|| kube_config.default_namespace.clone());

        let client = Client::try_from(kube_config)
            .map_err(|e| PlatformError::unreachable(Platform::Cluster, e))?;

        info!("Using cluster namespace {}", namespace);
        Ok(Connection { client, namespace })
    }

    async fn pods(&self) -> Result<Api<Pod>, PlatformError> {
        let connection = self.connection().await?;
        Ok(Api::namespaced(
            connection.client.clone(),
            &connection.namespace,
        ))
    }

    fn pod_containers(pod: &Pod, mode: Mode) -> Vec<Container> {
        let Some(pod_name) = pod.metadata.name.clone() else {
            return Vec::new();
        };
        let phase_running = pod
            .status
            .as_ref()
            .and_then(|status| status.phase.as_deref())
            == Some("Running");
        let terminating = pod.metadata.deletion_timestamp.is_some();
        let statuses = pod
            .status
            .as_ref()
            .and_then(|status| status.container_statuses.clone())
            .unwrap_or_default();

        pod.spec
            .as_ref()
            .map(|spec| spec.containers.as_slice())
            .unwrap_or_default()
            .iter()
            .map(|container| {
                let container_running = statuses
                    .iter()
                    .find(|status| status.name == container.name)
                    .and_then(|status| status.state.as_ref())
                    .map_or(false, |state| state.running.is_some());

                Container::new(
                    container.name.clone(),
                    mode,
                    ContainerHandle::new(pod_name.clone(), container.name.clone()),
                )
                .with_running(phase_running && container_running && !terminating)
            })
            .collect()
    }

    fn log_params(container: &Container, follow: bool) -> LogParams {
        LogParams {
            container: Some(container.handle.container.clone()),
            follow,
            ..Default::default()
        }
    }
}

fn cluster_error(err: kube::Error, handle: Option<&ContainerHandle>) -> PlatformError {
    match (err, handle) {
        (kube::Error::Api(response), Some(handle)) if response.code == 404 => {
            PlatformError::ContainerGone(handle.clone())
        }
        (kube::Error::Api(response), _) => PlatformError::backend(Platform::Cluster, response.message),
        (err @ (kube::Error::HyperError(_) | kube::Error::Service(_)), _) => {
            PlatformError::unreachable(Platform::Cluster, err)
        }
        (other, _) => PlatformError::backend(Platform::Cluster, other),
    }
}

const FORWARD_ADDRESS: &str = "127.0.0.1";

/// Accept local connections and bridge each one to `port` of `pod`.
async fn serve_forward(listener: TcpListener, pods: Api<Pod>, pod: String, port: u16) {
    let mut connections = JoinSet::new();
    loop {
        tokio::select! {
            accepted = listener.accept() => match accepted {
                Ok((socket, peer)) => {
                    debug!("Forwarding connection from {} to {}:{}", peer, pod, port);
                    let pods = pods.clone();
                    let pod = pod.clone();
                    connections.spawn(async move {
                        if let Err(e) = forward_connection(&pods, &pod, port, socket).await {
                            warn!("Port forward to {}:{} failed: {}", pod, port, e);
                        }
                    });
                }
                Err(e) => {
                    warn!("Failed to accept forwarded connection: {}", e);
                    tokio::time::sleep(std::time::Duration::from_millis(100)).await;
                }
            },
            Some(_) = connections.join_next(), if !connections.is_empty() => {}
        }
    }
}

async fn forward_connection(
    pods: &Api<Pod>,
    pod: &str,
    port: u16,
    mut socket: TcpStream,
) -> Result<(), PlatformError> {
    let mut forwarder = pods
        .portforward(pod, &[port])
        .await
        .map_err(|e| cluster_error(e, None))?;
    let mut upstream = forwarder.take_stream(port).ok_or_else(|| {
        PlatformError::backend(Platform::Cluster, format!("no stream for port {}", port))
    })?;

    tokio::io::copy_bidirectional(&mut socket, &mut upstream)
        .await
        .map_err(|e| PlatformError::backend(Platform::Cluster, e))?;
    drop(upstream);
    forwarder
        .join()
        .await
        .map_err(|e| PlatformError::backend(Platform::Cluster, e))
}

/// Exit status reported by the exec websocket's final Status message.
pub(crate) fn exit_code_from_status(status: &Status) -> i64 {
    if status.status.as_deref() == Some("Success") {
        return 0;
    }
    status
        .details
        .as_ref()
        .and_then(|details| details.causes.as_ref())
        .and_then(|causes| {
            causes
                .iter()
                .find(|cause| cause.reason.as_deref() == Some("ExitCode"))
        })
        .and_then(|cause| cause.message.as_deref())
        .and_then(|message| message.trim().parse::<i64>().ok())
        .unwrap_or(1)
}

#[async_trait]
impl PlatformAdapter for ClusterAdapter {
    fn platform(&self) -> Platform {
        Platform::Cluster
    }

    async fn ping(&self) -> Result<(), PlatformError> {
        let connection = self.connection().await?;
        let version = connection
            .client
            .apiserver_version()
            .await
            .map_err(|e| PlatformError::unreachable(Platform::Cluster, e))?;
        debug!("Cluster is reachable (server {})", version.git_version);
        Ok(())
    }

    async fn list_containers(
        &self,
        component: &ComponentRef,
        mode: Mode,
    ) -> Result<Vec<Container>, PlatformError> {
        let pods = self.pods().await?;
        let selector = labels::selector(component, mode);

        let mut pod_list = pods
            .list(&ListParams::default().labels(&selector))
            .await
            .map_err(|e| cluster_error(e, None))?
            .items;

        pod_list.sort_by(|a, b| {
            a.metadata
                .creation_timestamp
                .cmp(&b.metadata.creation_timestamp)
                .then_with(|| a.metadata.name.cmp(&b.metadata.name))
        });

        let containers: Vec<Container> = pod_list
            .iter()
            .flat_map(|pod| Self::pod_containers(pod, mode))
            .collect();

        debug!(
            selector = %selector,
            pods = pod_list.len(),
            containers = containers.len(),
            "Listed cluster containers"
        );
        Ok(containers)
    }

    async fn fetch_logs(&self, container: &Container) -> Result<LineStream, PlatformError> {
        let pods = self.pods().await?;
        let logs = pods
            .logs(&container.handle.instance, &Self::log_params(container, false))
            .await
            .map_err(|e| cluster_error(e, Some(&container.handle)))?;

        let lines: Vec<Result<String, PlatformError>> =
            logs.lines().map(|line| Ok(line.to_string())).collect();
        Ok(futures_util::stream::iter(lines).boxed())
    }

    async fn stream_logs(&self, container: &Container) -> Result<LineStream, PlatformError> {
        let pods = self.pods().await?;
        let reader = pods
            .log_stream(&container.handle.instance, &Self::log_params(container, true))
            .await
            .map_err(|e| cluster_error(e, Some(&container.handle)))?;

        Ok(reader
            .lines()
            .map_err(|e| PlatformError::backend(Platform::Cluster, e))
            .boxed())
    }

    async fn exec(
        &self,
        container: &Container,
        command: &[String],
    ) -> Result<ExecStream, PlatformError> {
        let pods = self.pods().await?;
        let handle = container.handle.clone();
        let params = AttachParams::default()
            .container(handle.container.clone())
            .stdin(false)
            .stdout(true)
            .stderr(true);

        let mut attached = pods
            .exec(&handle.instance, command.to_vec(), &params)
            .await
            .map_err(|e| cluster_error(e, Some(&handle)))?;

        info!("Started exec in pod container {}", handle);

        let missing = |stream: &str| {
            PlatformError::backend(Platform::Cluster, format!("exec has no {} stream", stream))
        };
        let stdout = attached.stdout().ok_or_else(|| missing("stdout"))?;
        let stderr = attached.stderr().ok_or_else(|| missing("stderr"))?;
        let status = attached.take_status().ok_or_else(|| missing("status"))?;

        let stdout = LinesStream::new(tokio::io::BufReader::new(stdout).lines());
        let stderr = LinesStream::new(tokio::io::BufReader::new(stderr).lines());
        let output = futures_util::stream::select(stdout, stderr)
            .map_err(|e| PlatformError::backend(Platform::Cluster, e))
            .boxed();

        let exit = async move {
            let status = status.await;
            if let Err(e) = attached.join().await {
                debug!("Exec connection closed with error: {}", e);
            }
            match status {
                Some(status) => Ok(exit_code_from_status(&status)),
                None => Err(PlatformError::backend(
                    Platform::Cluster,
                    "exec ended without reporting a status",
                )),
            }
        }
        .boxed();

        Ok(ExecStream { output, exit })
    }

    async fn forward_port(
        &self,
        container: &Container,
        port: u16,
    ) -> Result<PortForward, PlatformError> {
        let pods = self.pods().await?;
        let handle = &container.handle;
        pods.get(&handle.instance)
            .await
            .map_err(|e| cluster_error(e, Some(handle)))?;

        let listener = TcpListener::bind((FORWARD_ADDRESS, 0)).await.map_err(|e| {
            PlatformError::backend(Platform::Cluster, format!("unable to open a local port: {}", e))
        })?;
        let local_port = listener
            .local_addr()
            .map_err(|e| PlatformError::backend(Platform::Cluster, e))?
            .port();

        info!(
            "Forwarding {}:{} to pod {} port {}",
            FORWARD_ADDRESS, local_port, handle.instance, port
        );
        Ok(PortForward {
            local_address: FORWARD_ADDRESS.to_string(),
            local_port,
            serve: serve_forward(listener, pods, handle.instance.clone(), port).boxed(),
        })
    }
}

// ABOUTME: Podman adapter talking to the Docker-compatible Podman API through bollard
// Discovers the component's containers by label and streams their logs and exec output

use super::labels::{self, CONTAINER_NAME_LABEL};
use super::{ExecStream, LineStream, PlatformAdapter, PlatformError, PortForward};
use crate::config::PodmanConfig;
use crate::models::{ComponentRef, Container, ContainerHandle, Mode, Platform};
use async_trait::async_trait;
use bollard::container::{ListContainersOptions, LogOutput, LogsOptions};
use bollard::exec::{CreateExecOptions, StartExecResults};
use bollard::models::{ContainerSummary, PortMap};
use bollard::{Docker, API_DEFAULT_VERSION};
use futures_util::{FutureExt, Stream, StreamExt};
use std::collections::HashMap;
use tokio::sync::OnceCell;
use tracing::{debug, info, warn};

pub struct PodmanAdapter {
    config: PodmanConfig,
    docker: OnceCell<Docker>,
}

impl PodmanAdapter {
    pub fn new(config: PodmanConfig) -> Self {
        Self {
            config,
            docker: OnceCell::new(),
        }
    }

    async fn client(&self) -> Result<&Docker, PlatformError> {
        self.docker
            .get_or_try_init(|| self.connect())
            .await
    }

    async fn connect(&self) -> Result<Docker, PlatformError> {
        let timeout = self.config.timeout_secs;

        if let Some(host) = &self.config.host {
            info!("Using Podman host from config: {}", host);
            return Self::connect_to(host, timeout);
        }

        for socket_path in Self::get_podman_socket_paths().await {
            if std::path::Path::new(&socket_path).exists() {
                info!("Found Podman socket at: {}", socket_path);
                match Self::connect_to(&socket_path, timeout) {
                    Ok(docker) => return Ok(docker),
                    Err(e) => {
                        warn!("Failed to connect to Podman socket {}: {}", socket_path, e);
                        continue;
                    }
                }
            }
        }

        Err(PlatformError::unreachable(
            Platform::Podman,
            "no podman socket found",
        ))
    }

    fn connect_to(host: &str, timeout: u64) -> Result<Docker, PlatformError> {
        let result = if host.starts_with("tcp://") || host.starts_with("http://") {
            Docker::connect_with_http(host, timeout, API_DEFAULT_VERSION)
        } else {
            let path = host.strip_prefix("unix://").unwrap_or(host);
            Docker::connect_with_unix(path, timeout, API_DEFAULT_VERSION)
        };
        result.map_err(|e| PlatformError::unreachable(Platform::Podman, e))
    }

    async fn get_podman_socket_paths() -> Vec<String> {
        let mut paths = Vec::new();

        // Ask the podman client first, it knows about machines and connections
        if let Some(remote_socket) = Self::get_podman_info_socket().await {
            paths.push(remote_socket);
        }

        if cfg!(target_os = "linux") {
            // Rootless
            if let Ok(xdg_runtime_dir) = std::env::var("XDG_RUNTIME_DIR") {
                paths.push(format!("{}/podman/podman.sock", xdg_runtime_dir));
            }
            // Rootful
            paths.push("/run/podman/podman.sock".to_string());
        }

        if cfg!(target_os = "macos") {
            if let Some(home) = dirs::home_dir() {
                let machine = home.join(".local/share/containers/podman/machine");
                paths.push(machine.join("podman.sock").to_string_lossy().to_string());
                paths.push(machine.join("qemu/podman.sock").to_string_lossy().to_string());
            }
        }

        paths
    }

    async fn get_podman_info_socket() -> Option<String> {
        let output = tokio::process::Command::new("podman")
            .args(["info", "--format", "{{.Host.RemoteSocket.Path}}"])
            .kill_on_drop(true)
            .output()
            .await
            .ok()?;

        if !output.status.success() {
            return None;
        }

        let socket = String::from_utf8(output.stdout).ok()?;
        let socket = socket.trim();
        let path = socket.strip_prefix("unix://").unwrap_or(socket);
        if path.is_empty() {
            return None;
        }
        debug!("Podman remote socket: {}", path);
        Some(path.to_string())
    }

    fn to_container(
        summary: &ContainerSummary,
        component: &ComponentRef,
        mode: Mode,
    ) -> Option<Container> {
        let id = summary.id.clone()?;
        let engine_name = summary
            .names
            .as_ref()
            .and_then(|names| names.first())
            .map(|name| name.trim_start_matches('/').to_string())
            .unwrap_or_else(|| id.clone());

        let logical_name = summary
            .labels
            .as_ref()
            .and_then(|labels| labels.get(CONTAINER_NAME_LABEL))
            .cloned()
            .unwrap_or_else(|| logical_name_from(&engine_name, component));

        let running = summary.state.as_deref() == Some("running");
        Some(
            Container::new(logical_name, mode, ContainerHandle::new(id, engine_name))
                .with_running(running),
        )
    }

    async fn logs(&self, container: &Container, follow: bool) -> Result<LineStream, PlatformError> {
        let docker = self.client().await?.clone();
        let id = container.handle.instance.clone();
        let handle = container.handle.clone();

        let options = LogsOptions::<String> {
            stdout: true,
            stderr: true,
            follow,
            tail: "all".to_string(),
            ..Default::default()
        };

        let frames = async_stream::stream! {
            let mut frames = docker.logs(&id, Some(options));
            while let Some(frame) = frames.next().await {
                yield frame;
            }
        };

        Ok(frames_to_lines(frames, handle))
    }
}

/// Logical container name for an engine name like `<component>-<app>-runtime`.
/// Host address and port publishing `port/tcp`, if any.
fn published_port(ports: &PortMap, port: u16) -> Option<(String, u16)> {
    ports
        .get(&format!("{}/tcp", port))?
        .as_ref()?
        .iter()
        .find_map(|binding| {
            let host_port = binding.host_port.as_deref()?.parse::<u16>().ok()?;
            let address = match binding.host_ip.as_deref() {
                None | Some("") | Some("0.0.0.0") | Some("::") => "127.0.0.1",
                Some(ip) => ip,
            };
            Some((address.to_string(), host_port))
        })
}

fn logical_name_from(engine_name: &str, component: &ComponentRef) -> String {
    let prefix = labels::pod_prefix(component);
    engine_name
        .strip_prefix(&prefix)
        .filter(|rest| !rest.is_empty())
        .unwrap_or(engine_name)
        .to_string()
}

fn podman_error(err: bollard::errors::Error, handle: Option<&ContainerHandle>) -> PlatformError {
    use bollard::errors::Error;

    match (err, handle) {
        (Error::DockerResponseServerError { status_code: 404, .. }, Some(handle)) => {
            PlatformError::ContainerGone(handle.clone())
        }
        (Error::DockerResponseServerError { message, .. }, _) => {
            PlatformError::backend(Platform::Podman, message)
        }
        (err @ (Error::IOError { .. } | Error::HyperResponseError { .. } | Error::RequestTimeoutError), _) => {
            PlatformError::unreachable(Platform::Podman, err)
        }
        (other, _) => PlatformError::backend(Platform::Podman, other),
    }
}

/// Reassembles whole lines from engine frames, which may split or batch lines.
#[derive(Debug, Default)]
pub(crate) struct LineSplitter {
    pending: Vec<u8>,
}

impl LineSplitter {
    pub(crate) fn push(&mut self, bytes: &[u8]) -> Vec<String> {
        self.pending.extend_from_slice(bytes);
        let mut lines = Vec::new();
        while let Some(pos) = self.pending.iter().position(|b| *b == b'\n') {
            let line: Vec<u8> = self.pending.drain(..=pos).collect();
            lines.push(Self::decode(&line[..line.len() - 1]));
        }
        lines
    }

    pub(crate) fn finish(&mut self) -> Option<String> {
        if self.pending.is_empty() {
            return None;
        }
        let rest = std::mem::take(&mut self.pending);
        Some(Self::decode(&rest))
    }

    fn decode(bytes: &[u8]) -> String {
        let text = String::from_utf8_lossy(bytes);
        text.strip_suffix('\r').unwrap_or(&text).to_string()
    }
}

fn frames_to_lines<S>(frames: S, handle: ContainerHandle) -> LineStream
where
    S: Stream<Item = Result<LogOutput, bollard::errors::Error>> + Send + 'static,
{
    async_stream::try_stream! {
        let mut splitter = LineSplitter::default();
        futures_util::pin_mut!(frames);
        while let Some(frame) = frames.next().await {
            let frame = frame.map_err(|e| podman_error(e, Some(&handle)))?;
            let bytes = match frame {
                LogOutput::StdOut { message }
                | LogOutput::StdErr { message }
                | LogOutput::Console { message } => message,
                LogOutput::StdIn { .. } => continue,
            };
            for line in splitter.push(&bytes) {
                yield line;
            }
        }
        if let Some(rest) = splitter.finish() {
            yield rest;
        }
    }
    .boxed()
}

#[async_trait]
impl PlatformAdapter for PodmanAdapter {
    fn platform(&self) -> Platform {
        Platform::Podman
    }

    async fn ping(&self) -> Result<(), PlatformError> {
        let docker = self.client().await?;
        docker
            .ping()
            .await
            .map_err(|e| PlatformError::unreachable(Platform::Podman, e))?;
        debug!("Podman is reachable");
        Ok(())
    }

    async fn list_containers(
        &self,
        component: &ComponentRef,
        mode: Mode,
    ) -> Result<Vec<Container>, PlatformError> {
        let docker = self.client().await?;

        let mut filters = HashMap::new();
        filters.insert("label".to_string(), labels::label_filters(component, mode));

        let mut summaries = docker
            .list_containers(Some(ListContainersOptions::<String> {
                all: true,
                filters,
                ..Default::default()
            }))
            .await
            .map_err(|e| podman_error(e, None))?;

        // Creation order is the discovery order
        summaries.sort_by(|a, b| {
            a.created
                .cmp(&b.created)
                .then_with(|| a.names.cmp(&b.names))
        });

        let containers: Vec<Container> = summaries
            .iter()
            .filter_map(|summary| Self::to_container(summary, component, mode))
            .collect();

        debug!(
            "Found {} podman containers for {} in {} mode",
            containers.len(),
            component,
            mode
        );
        Ok(containers)
    }

    async fn fetch_logs(&self, container: &Container) -> Result<LineStream, PlatformError> {
        self.logs(container, false).await
    }

    async fn stream_logs(&self, container: &Container) -> Result<LineStream, PlatformError> {
        self.logs(container, true).await
    }

    async fn exec(
        &self,
        container: &Container,
        command: &[String],
    ) -> Result<ExecStream, PlatformError> {
        let docker = self.client().await?.clone();
        let handle = container.handle.clone();

        let exec = docker
            .create_exec(
                &handle.instance,
                CreateExecOptions {
                    attach_stdout: Some(true),
                    attach_stderr: Some(true),
                    cmd: Some(command.to_vec()),
                    ..Default::default()
                },
            )
            .await
            .map_err(|e| podman_error(e, Some(&handle)))?;

        info!("Started exec {} in container {}", exec.id, handle);

        let output = match docker
            .start_exec(&exec.id, None)
            .await
            .map_err(|e| podman_error(e, Some(&handle)))?
        {
            StartExecResults::Attached { output, .. } => output,
            StartExecResults::Detached => {
                return Err(PlatformError::backend(
                    Platform::Podman,
                    "exec started detached, no output to stream",
                ))
            }
        };

        let exec_id = exec.id.clone();
        let exit = async move {
            let inspect = docker
                .inspect_exec(&exec_id)
                .await
                .map_err(|e| podman_error(e, None))?;
            Ok(inspect.exit_code.unwrap_or(0))
        }
        .boxed();

        Ok(ExecStream {
            output: frames_to_lines(output, handle),
            exit,
        })
    }

    async fn forward_port(
        &self,
        container: &Container,
        port: u16,
    ) -> Result<PortForward, PlatformError> {
        let docker = self.client().await?;
        let inspect = docker
            .inspect_container(&container.handle.instance, None)
            .await
            .map_err(|e| podman_error(e, Some(&container.handle)))?;

        let ports = inspect
            .network_settings
            .and_then(|settings| settings.ports)
            .unwrap_or_default();
        let (local_address, local_port) = published_port(&ports, port).ok_or_else(|| {
            PlatformError::backend(
                Platform::Podman,
                format!("port {} of container {} is not published", port, container.handle),
            )
        })?;

        debug!(
            "Container {} publishes port {} on {}:{}",
            container.handle, port, local_address, local_port
        );
        // Podman keeps the binding for the container's lifetime
        Ok(PortForward {
            local_address,
            local_port,
            serve: futures_util::future::pending().boxed(),
        })
    }
}

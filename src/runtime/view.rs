// ABOUTME: Read-only view of a component's running containers on one platform
// Membership is recomputed on every call; nothing is cached between calls

use crate::models::{Command, CommandCatalog, ComponentRef, Container, ContainerHandle, Mode, ModeFilter};
use crate::platform::{PlatformAdapter, PlatformError};
use std::collections::HashSet;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, warn};

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RuntimeError {
    #[error("no command named \"{0}\" found in the devfile")]
    UnknownCommand(String),
    #[error("the container \"{container}\" targeted by command \"{command}\" is not running in Dev mode")]
    NotRunning { command: String, container: String },
    #[error(transparent)]
    Platform(#[from] PlatformError),
}

#[derive(Clone)]
pub struct ComponentRuntimeView {
    component: ComponentRef,
    adapter: Arc<dyn PlatformAdapter>,
    catalog: Arc<dyn CommandCatalog>,
}

impl ComponentRuntimeView {
    pub fn new(
        component: ComponentRef,
        adapter: Arc<dyn PlatformAdapter>,
        catalog: Arc<dyn CommandCatalog>,
    ) -> Self {
        Self {
            component,
            adapter,
            catalog,
        }
    }

    pub fn component(&self) -> &ComponentRef {
        &self.component
    }

    pub fn adapter(&self) -> &Arc<dyn PlatformAdapter> {
        &self.adapter
    }

    /// Running containers for `filter`: Dev containers in discovery order, then Deploy.
    ///
    /// With `ModeFilter::Both` a failing mode degrades to empty as long as the other
    /// mode answers; when every mode fails the first error is returned.
    pub async fn list(&self, filter: ModeFilter) -> Result<Vec<Container>, PlatformError> {
        let mut merged = Vec::new();
        let mut seen: HashSet<ContainerHandle> = HashSet::new();
        let mut first_error = None;
        let mut answered = 0;

        for &mode in filter.modes() {
            match self.list_mode(mode).await {
                Ok(containers) => {
                    answered += 1;
                    for container in containers {
                        if seen.insert(container.handle.clone()) {
                            merged.push(container);
                        }
                    }
                }
                Err(e) if filter == ModeFilter::Both => {
                    warn!(
                        "Listing {} containers of {} failed, treating as none: {}",
                        mode, self.component, e
                    );
                    first_error.get_or_insert(e);
                }
                Err(e) => return Err(e),
            }
        }

        if answered == 0 {
            if let Some(e) = first_error {
                return Err(e);
            }
        }

        debug!(
            "{} running containers for {} ({:?})",
            merged.len(),
            self.component,
            filter
        );
        Ok(merged)
    }

    async fn list_mode(&self, mode: Mode) -> Result<Vec<Container>, PlatformError> {
        let containers = self
            .adapter
            .list_containers(&self.component, mode)
            .await?;
        Ok(containers
            .into_iter()
            // Backends may mislabel; trust the mode that was asked for
            .map(|container| Container { mode, ..container })
            .filter(|container| container.running)
            .collect())
    }

    pub fn command(&self, name: &str) -> Result<Command, RuntimeError> {
        self.catalog
            .find(name)
            .ok_or_else(|| RuntimeError::UnknownCommand(name.to_string()))
    }

    /// Resolve a command to the first running Dev container carrying its target name.
    pub async fn resolve(&self, name: &str) -> Result<(Command, Container), RuntimeError> {
        let command = self.command(name)?;
        let container = self
            .list(ModeFilter::Dev)
            .await?
            .into_iter()
            .find(|container| container.logical_name == command.target_container)
            .ok_or_else(|| RuntimeError::NotRunning {
                command: command.name.clone(),
                container: command.target_container.clone(),
            })?;
        Ok((command, container))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Platform;
    use crate::platform::MockPlatformAdapter;
    use mockall::predicate::eq;

    fn container(name: &str, instance: &str, mode: Mode) -> Container {
        Container::new(name, mode, ContainerHandle::new(instance, name))
    }

    fn view(mock: MockPlatformAdapter, catalog: Vec<Command>) -> ComponentRuntimeView {
        ComponentRuntimeView::new(
            ComponentRef::new("nodejs", "app"),
            Arc::new(mock),
            Arc::new(catalog),
        )
    }

    #[tokio::test]
    async fn test_both_merges_dev_before_deploy_and_dedupes() {
        let mut mock = MockPlatformAdapter::new();
        mock.expect_list_containers()
            .with(mockall::predicate::always(), eq(Mode::Dev))
            .returning(|_, _| {
                Ok(vec![
                    container("runtime", "dev-pod", Mode::Dev),
                    container("main", "dev-pod", Mode::Dev),
                    container("stopped", "dev-pod", Mode::Dev).with_running(false),
                ])
            });
        mock.expect_list_containers()
            .with(mockall::predicate::always(), eq(Mode::Deploy))
            .returning(|_, _| {
                Ok(vec![
                    container("main", "deploy-1", Mode::Deploy),
                    container("main", "dev-pod", Mode::Deploy),
                ])
            });

        let containers = view(mock, vec![]).list(ModeFilter::Both).await.unwrap();
        let handles: Vec<String> = containers.iter().map(|c| c.handle.to_string()).collect();
        assert_eq!(handles, vec!["dev-pod/runtime", "dev-pod/main", "deploy-1/main"]);
        assert_eq!(containers[2].mode, Mode::Deploy);
    }

    #[tokio::test]
    async fn test_both_degrades_one_failing_mode() {
        let mut mock = MockPlatformAdapter::new();
        mock.expect_list_containers()
            .with(mockall::predicate::always(), eq(Mode::Dev))
            .returning(|_, _| Err(PlatformError::backend(Platform::Podman, "boom")));
        mock.expect_list_containers()
            .with(mockall::predicate::always(), eq(Mode::Deploy))
            .returning(|_, _| Ok(vec![container("main", "deploy-1", Mode::Deploy)]));

        let containers = view(mock, vec![]).list(ModeFilter::Both).await.unwrap();
        assert_eq!(containers.len(), 1);
    }

    #[tokio::test]
    async fn test_all_modes_failing_surfaces_error() {
        let mut mock = MockPlatformAdapter::new();
        mock.expect_list_containers()
            .returning(|_, _| Err(PlatformError::unreachable(Platform::Podman, "refused")));

        let err = view(mock, vec![]).list(ModeFilter::Both).await.unwrap_err();
        assert!(err.to_string().contains("unable to access podman"));
    }

    #[tokio::test]
    async fn test_single_mode_failure_is_fatal() {
        let mut mock = MockPlatformAdapter::new();
        mock.expect_list_containers()
            .times(1)
            .returning(|_, _| Err(PlatformError::unreachable(Platform::Cluster, "refused")));

        let err = view(mock, vec![]).list(ModeFilter::Deploy).await.unwrap_err();
        assert!(err.is_unreachable());
    }

    #[tokio::test]
    async fn test_resolve_picks_first_running_dev_container() {
        let mut mock = MockPlatformAdapter::new();
        mock.expect_list_containers()
            .with(mockall::predicate::always(), eq(Mode::Dev))
            .returning(|_, _| {
                Ok(vec![
                    container("main", "pod-a", Mode::Dev),
                    container("runtime", "pod-a", Mode::Dev),
                    container("runtime", "pod-b", Mode::Dev),
                ])
            });

        let catalog = vec![Command::exec("create-file", "runtime", "touch /tmp/f")];
        let (command, target) = view(mock, catalog).resolve("create-file").await.unwrap();
        assert_eq!(command.name, "create-file");
        assert_eq!(target.handle, ContainerHandle::new("pod-a", "runtime"));
    }

    #[tokio::test]
    async fn test_resolve_unknown_command_skips_backend() {
        let mut mock = MockPlatformAdapter::new();
        mock.expect_list_containers().never();

        let err = view(mock, vec![]).resolve("unknown-command").await.unwrap_err();
        assert_eq!(
            err.to_string(),
            "no command named \"unknown-command\" found in the devfile"
        );
    }

    #[tokio::test]
    async fn test_resolve_target_not_running() {
        let mut mock = MockPlatformAdapter::new();
        mock.expect_list_containers().returning(|_, _| Ok(vec![]));

        let catalog = vec![Command::exec("build", "tools", "make")];
        let err = view(mock, catalog).resolve("build").await.unwrap_err();
        assert_eq!(
            err,
            RuntimeError::NotRunning {
                command: "build".to_string(),
                container: "tools".to_string()
            }
        );
    }
}

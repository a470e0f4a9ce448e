// ABOUTME: Log aggregator fanning labeled container output into one consumer-owned channel
// Snapshot mode reads buffered logs in label order; follow mode runs one task per source

use super::labeler::Labeler;
use crate::models::{Container, ContainerHandle, Mode, ModeFilter, ModeFilterError};
use crate::platform::{LineStream, PlatformAdapter, PlatformError};
use crate::runtime::ComponentRuntimeView;
use crate::session::signal::{StopSignal, TaskGroup};
use futures_util::StreamExt;
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio::time::{Instant, Interval};
use tracing::{debug, error, info, warn};

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LogsError {
    #[error(transparent)]
    Validation(#[from] ModeFilterError),
    #[error(transparent)]
    Platform(#[from] PlatformError),
    #[error("log source {label} failed: {source}")]
    Source {
        label: String,
        #[source]
        source: PlatformError,
    },
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LogsRequest {
    pub dev: bool,
    pub deploy: bool,
    pub follow: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogLine {
    pub label: String,
    pub mode: Mode,
    /// The container instance the line was read from.
    pub source: ContainerHandle,
    pub line: String,
}

impl LogLine {
    /// Banner naming the instance behind a label, shown before its first line.
    pub fn source_header(&self) -> String {
        format!(
            "--> Logs for {} / {} ({})",
            self.source.instance, self.source.container, self.label
        )
    }
}

impl fmt::Display for LogLine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.label, self.line)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FollowPhase {
    Idle,
    Streaming,
    Cancelled,
    AllSourcesClosed,
    Done,
}

pub enum LogsOutput {
    /// Nothing matched the filter; carries the message to show the user.
    NoContainers(String),
    Streaming(LogStream),
}

impl fmt::Debug for LogsOutput {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LogsOutput::NoContainers(message) => f.debug_tuple("NoContainers").field(message).finish(),
            LogsOutput::Streaming(stream) => f.debug_tuple("Streaming").field(&stream.phase).finish(),
        }
    }
}

type Item = Result<LogLine, LogsError>;

/// Receiving end of an aggregation. Lines already yielded are never retracted.
pub struct LogStream {
    rx: mpsc::UnboundedReceiver<Item>,
    tasks: TaskGroup,
    phase: FollowPhase,
    end_reason: Option<FollowPhase>,
    failures: usize,
}

impl LogStream {
    fn new(rx: mpsc::UnboundedReceiver<Item>, tasks: TaskGroup) -> Self {
        Self {
            rx,
            tasks,
            phase: FollowPhase::Idle,
            end_reason: None,
            failures: 0,
        }
    }

    pub fn phase(&self) -> FollowPhase {
        self.phase
    }

    /// Why the stream ended, once it is `Done`.
    pub fn end_reason(&self) -> Option<FollowPhase> {
        self.end_reason
    }

    /// Number of source errors yielded so far.
    pub fn failed_sources(&self) -> usize {
        self.failures
    }

    /// Next labeled line; `None` once every producer has exited and been joined.
    pub async fn next(&mut self) -> Option<Item> {
        if self.phase == FollowPhase::Done {
            return None;
        }
        if let Some(item) = self.rx.recv().await {
            if item.is_err() {
                self.failures += 1;
            }
            return Some(item);
        }

        // Every sender is gone, so every producer has returned
        let reason = if self.tasks.is_stopped() {
            FollowPhase::Cancelled
        } else {
            FollowPhase::AllSourcesClosed
        };
        self.finish(reason).await;
        None
    }

    /// Stop every producer and wait for all of them to exit.
    pub async fn cancel(&mut self) {
        if self.phase == FollowPhase::Done {
            return;
        }
        self.tasks.stop();
        self.finish(FollowPhase::Cancelled).await;
    }

    async fn finish(&mut self, reason: FollowPhase) {
        self.phase = reason;
        self.tasks.wait_end().await;
        self.rx.close();
        self.end_reason = Some(reason);
        self.phase = FollowPhase::Done;
        debug!("Log stream done ({:?})", reason);
    }
}

impl fmt::Debug for LogStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LogStream")
            .field("phase", &self.phase)
            .field("tasks", &self.tasks.len())
            .finish()
    }
}

#[derive(Clone)]
pub struct LogAggregator {
    view: ComponentRuntimeView,
    discovery_interval: Option<Duration>,
}

impl LogAggregator {
    pub fn new(view: ComponentRuntimeView) -> Self {
        Self {
            view,
            discovery_interval: None,
        }
    }

    /// Re-poll for new containers at this interval while following.
    pub fn with_discovery_interval(mut self, interval: Option<Duration>) -> Self {
        self.discovery_interval = interval;
        self
    }

    pub fn no_containers_message(&self) -> String {
        format!(
            "no containers running in the specified mode for the component \"{}\"",
            self.view.component()
        )
    }

    pub async fn stream(
        &self,
        request: LogsRequest,
        parent: &StopSignal,
    ) -> Result<LogsOutput, LogsError> {
        let filter = ModeFilter::from_flags(request.dev, request.deploy)?;
        let containers = self.view.list(filter).await?;
        if containers.is_empty() {
            return Ok(LogsOutput::NoContainers(self.no_containers_message()));
        }

        let mut labeler = Labeler::new();
        let labeled: Vec<(Container, String)> = containers
            .into_iter()
            .map(|container| {
                let label = labeler.assign(&container);
                (container, label)
            })
            .collect();

        info!(
            component = %self.view.component(),
            sources = labeled.len(),
            follow = request.follow,
            "Streaming logs"
        );

        let (tx, rx) = mpsc::unbounded_channel();
        let mut tasks = TaskGroup::with_parent(parent);

        if request.follow {
            let follow = Follow {
                view: self.view.clone(),
                filter,
                labeler,
                discovery_interval: self.discovery_interval,
                tx,
                following: HashSet::new(),
                labels: HashMap::new(),
            };
            tasks.spawn(move |signal| follow.run(labeled, signal));
        } else {
            let adapter = self.view.adapter().clone();
            tasks.spawn(move |signal| snapshot(adapter, labeled, tx, signal));
        }

        let mut stream = LogStream::new(rx, tasks);
        stream.phase = FollowPhase::Streaming;
        Ok(LogsOutput::Streaming(stream))
    }
}

/// Forward `lines` until the source ends. Returns false when the consumer is gone
/// or the signal fired, meaning no further sources should be read.
async fn pump(
    mut lines: LineStream,
    container: &Container,
    label: &str,
    tx: &mpsc::UnboundedSender<Item>,
    signal: &StopSignal,
) -> bool {
    loop {
        let next = tokio::select! {
            _ = signal.stopped() => return false,
            next = lines.next() => next,
        };
        match next {
            Some(Ok(line)) => {
                let line = LogLine {
                    label: label.to_string(),
                    mode: container.mode,
                    source: container.handle.clone(),
                    line,
                };
                if tx.send(Ok(line)).is_err() {
                    return false;
                }
            }
            Some(Err(PlatformError::ContainerGone(handle))) => {
                debug!("Container {} went away, closing its source", handle);
                return true;
            }
            Some(Err(source)) => {
                return tx
                    .send(Err(LogsError::Source {
                        label: label.to_string(),
                        source,
                    }))
                    .is_ok();
            }
            None => return true,
        }
    }
}

fn open_failed(err: PlatformError, label: &str, tx: &mpsc::UnboundedSender<Item>) -> bool {
    if let PlatformError::ContainerGone(handle) = err {
        debug!("Container {} went away before its log opened", handle);
        return true;
    }
    warn!("Unable to open log of {}: {}", label, err);
    tx.send(Err(LogsError::Source {
        label: label.to_string(),
        source: err,
    }))
    .is_ok()
}

async fn snapshot(
    adapter: Arc<dyn PlatformAdapter>,
    labeled: Vec<(Container, String)>,
    tx: mpsc::UnboundedSender<Item>,
    signal: StopSignal,
) {
    for (container, label) in labeled {
        let opened = tokio::select! {
            _ = signal.stopped() => return,
            opened = adapter.fetch_logs(&container) => opened,
        };
        let keep_going = match opened {
            Ok(lines) => pump(lines, &container, &label, &tx, &signal).await,
            Err(e) => open_failed(e, &label, &tx),
        };
        if !keep_going {
            return;
        }
    }
}

struct Follow {
    view: ComponentRuntimeView,
    filter: ModeFilter,
    labeler: Labeler,
    discovery_interval: Option<Duration>,
    tx: mpsc::UnboundedSender<Item>,
    // Handles with an open source task
    following: HashSet<ContainerHandle>,
    // Every handle seen so far keeps its label for the whole stream
    labels: HashMap<ContainerHandle, String>,
}

impl Follow {
    async fn run(mut self, initial: Vec<(Container, String)>, signal: StopSignal) {
        let mut sources = JoinSet::new();
        for (container, label) in initial {
            self.subscribe(&mut sources, container, label, &signal);
        }

        let mut ticker = self
            .discovery_interval
            .map(|period| tokio::time::interval_at(Instant::now() + period, period));

        loop {
            if sources.is_empty() && ticker.is_none() {
                break;
            }
            tokio::select! {
                _ = signal.stopped() => break,
                joined = sources.join_next(), if !sources.is_empty() => match joined {
                    // Closed sources may be picked up again if the container restarts
                    Some(Ok(handle)) => {
                        self.following.remove(&handle);
                    }
                    Some(Err(e)) if e.is_panic() => error!("Log source task panicked: {}", e),
                    _ => {}
                },
                _ = next_tick(&mut ticker) => {
                    self.discover(&mut sources, &signal).await;
                }
            }
        }

        // Sources watch the same signal and exit on their own
        while sources.join_next().await.is_some() {}
        debug!("Follow supervisor for {} exited", self.view.component());
    }

    /// Follow `container` until its log closes; the task yields the handle back.
    fn subscribe(
        &mut self,
        sources: &mut JoinSet<ContainerHandle>,
        container: Container,
        label: String,
        signal: &StopSignal,
    ) {
        debug!("Following {} as {}", container.handle, label);
        self.following.insert(container.handle.clone());
        self.labels.insert(container.handle.clone(), label.clone());

        let adapter = self.view.adapter().clone();
        let tx = self.tx.clone();
        let signal = signal.clone();
        sources.spawn(async move {
            let opened = tokio::select! {
                _ = signal.stopped() => None,
                opened = adapter.stream_logs(&container) => Some(opened),
            };
            match opened {
                Some(Ok(lines)) => {
                    pump(lines, &container, &label, &tx, &signal).await;
                }
                Some(Err(e)) => {
                    open_failed(e, &label, &tx);
                }
                None => {}
            }
            debug!("Log source {} closed", label);
            container.handle
        });
    }

    async fn discover(&mut self, sources: &mut JoinSet<ContainerHandle>, signal: &StopSignal) {
        let containers = match self.view.list(self.filter).await {
            Ok(containers) => containers,
            Err(e) => {
                warn!("Container discovery failed, retrying next interval: {}", e);
                return;
            }
        };
        for container in containers {
            if self.following.contains(&container.handle) {
                continue;
            }
            let label = match self.labels.get(&container.handle) {
                Some(label) => {
                    info!("Container {} restarted, following it again as {}", container.handle, label);
                    label.clone()
                }
                None => {
                    let label = self.labeler.assign(&container);
                    info!("New container {} joined the log stream as {}", container.handle, label);
                    label
                }
            };
            self.subscribe(sources, container, label, signal);
        }
    }
}

async fn next_tick(ticker: &mut Option<Interval>) {
    match ticker {
        Some(ticker) => {
            ticker.tick().await;
        }
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Command, ComponentRef, Platform};
    use crate::platform::MockPlatformAdapter;
    use crate::session::signal::StopTrigger;
    use futures_util::stream;
    use pretty_assertions::assert_eq;

    fn aggregator(mock: MockPlatformAdapter) -> LogAggregator {
        let view = ComponentRuntimeView::new(
            ComponentRef::new("nodejs", "app"),
            Arc::new(mock),
            Arc::new(Vec::<Command>::new()),
        );
        LogAggregator::new(view)
    }

    fn container(name: &str, instance: &str, mode: Mode) -> Container {
        Container::new(name, mode, ContainerHandle::new(instance, name))
    }

    async fn collect(stream: &mut LogStream) -> Vec<String> {
        let mut lines = Vec::new();
        while let Some(item) = stream.next().await {
            lines.push(item.unwrap().to_string());
        }
        lines
    }

    #[tokio::test]
    async fn test_conflicting_flags_make_no_backend_call() {
        let mut mock = MockPlatformAdapter::new();
        mock.expect_list_containers().never();
        mock.expect_fetch_logs().never();

        let request = LogsRequest {
            dev: true,
            deploy: true,
            follow: false,
        };
        let err = aggregator(mock)
            .stream(request, &StopSignal::never())
            .await
            .unwrap_err();
        assert_eq!(
            err.to_string(),
            "pass only one of --dev or --deploy flags; pass no flag to see logs for both modes"
        );
    }

    #[tokio::test]
    async fn test_no_containers_is_soft_success() {
        let mut mock = MockPlatformAdapter::new();
        mock.expect_list_containers().returning(|_, _| Ok(vec![]));

        let output = aggregator(mock)
            .stream(LogsRequest::default(), &StopSignal::never())
            .await
            .unwrap();
        match output {
            LogsOutput::NoContainers(message) => assert_eq!(
                message,
                "no containers running in the specified mode for the component \"nodejs\""
            ),
            other => panic!("unexpected output {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_snapshot_emits_in_label_order() {
        let mut mock = MockPlatformAdapter::new();
        mock.expect_list_containers()
            .returning(|_, mode| match mode {
                Mode::Dev => Ok(vec![container("main", "dev-pod", Mode::Dev)]),
                Mode::Deploy => Ok(vec![
                    container("main", "deploy-a", Mode::Deploy),
                    container("main", "deploy-b", Mode::Deploy),
                ]),
            });
        mock.expect_fetch_logs().returning(|container| {
            let lines = vec![
                Ok(format!("hello from {}", container.handle.instance)),
                Ok("done".to_string()),
            ];
            Ok(stream::iter(lines).boxed())
        });

        let output = aggregator(mock)
            .stream(LogsRequest::default(), &StopSignal::never())
            .await
            .unwrap();
        let LogsOutput::Streaming(mut stream) = output else {
            panic!("expected a stream");
        };
        assert_eq!(stream.phase(), FollowPhase::Streaming);

        assert_eq!(
            collect(&mut stream).await,
            vec![
                "main: hello from dev-pod",
                "main: done",
                "main[1]: hello from deploy-a",
                "main[1]: done",
                "main[2]: hello from deploy-b",
                "main[2]: done",
            ]
        );
        assert_eq!(stream.phase(), FollowPhase::Done);
        assert_eq!(stream.end_reason(), Some(FollowPhase::AllSourcesClosed));
    }

    #[tokio::test]
    async fn test_snapshot_reports_source_failure_and_continues() {
        let mut mock = MockPlatformAdapter::new();
        mock.expect_list_containers().returning(|_, _| {
            Ok(vec![
                container("runtime", "pod", Mode::Dev),
                container("main", "pod", Mode::Dev),
            ])
        });
        mock.expect_fetch_logs().returning(|container| {
            if container.logical_name == "runtime" {
                Err(PlatformError::backend(Platform::Podman, "log driver none"))
            } else {
                Ok(stream::iter(vec![Ok("ready".to_string())]).boxed())
            }
        });

        let request = LogsRequest {
            dev: true,
            ..Default::default()
        };
        let LogsOutput::Streaming(mut stream) = aggregator(mock)
            .stream(request, &StopSignal::never())
            .await
            .unwrap()
        else {
            panic!("expected a stream");
        };

        let first = stream.next().await.unwrap().unwrap_err();
        assert!(matches!(first, LogsError::Source { ref label, .. } if label == "runtime"));
        let ready = stream.next().await.unwrap().unwrap();
        assert_eq!(ready.to_string(), "main: ready");
        assert_eq!(ready.source_header(), "--> Logs for pod / main (main)");
        assert!(stream.next().await.is_none());
        assert_eq!(stream.failed_sources(), 1);
    }

    #[tokio::test]
    async fn test_unreachable_fetch_is_counted_as_failure() {
        let mut mock = MockPlatformAdapter::new();
        mock.expect_list_containers()
            .returning(|_, _| Ok(vec![container("main", "pod", Mode::Dev)]));
        mock.expect_fetch_logs()
            .returning(|_| Err(PlatformError::unreachable(Platform::Cluster, "connection refused")));

        let LogsOutput::Streaming(mut stream) = aggregator(mock)
            .stream(LogsRequest::default(), &StopSignal::never())
            .await
            .unwrap()
        else {
            panic!("expected a stream");
        };

        let err = stream.next().await.unwrap().unwrap_err();
        assert!(err.to_string().contains("unable to access the cluster"));
        assert!(stream.next().await.is_none());
        assert_eq!(stream.failed_sources(), 1);
    }

    #[tokio::test]
    async fn test_parent_stop_cancels_follow() {
        let mut mock = MockPlatformAdapter::new();
        mock.expect_list_containers()
            .returning(|_, _| Ok(vec![container("main", "pod", Mode::Deploy)]));
        mock.expect_stream_logs().returning(|_| {
            let lines = stream::iter(vec![Ok("started".to_string())]).chain(stream::pending());
            Ok(lines.boxed())
        });

        let parent = StopTrigger::new();
        let request = LogsRequest {
            deploy: true,
            follow: true,
            ..Default::default()
        };
        let LogsOutput::Streaming(mut stream) = aggregator(mock)
            .stream(request, &parent.signal())
            .await
            .unwrap()
        else {
            panic!("expected a stream");
        };

        assert_eq!(stream.next().await.unwrap().unwrap().line, "started");
        parent.stop();
        assert!(stream.next().await.is_none());
        assert_eq!(stream.end_reason(), Some(FollowPhase::Cancelled));
    }
}

// ABOUTME: Tests for log aggregation across containers and modes
// Covers labeling, the no-containers soft case, flag validation and follow cancellation

mod common;

use common::{catalog, component, eventually, FakePlatform};
use devloop::logs::{FollowPhase, LogAggregator, LogStream, LogsOutput, LogsRequest};
use devloop::models::{Mode, Platform};
use devloop::runtime::ComponentRuntimeView;
use devloop::session::{StopSignal, StopTrigger};
use pretty_assertions::assert_eq;
use std::sync::Arc;
use std::time::Duration;

fn aggregator(platform: &Arc<FakePlatform>) -> LogAggregator {
    LogAggregator::new(ComponentRuntimeView::new(component(), platform.clone(), catalog()))
}

fn request(dev: bool, deploy: bool, follow: bool) -> LogsRequest {
    LogsRequest { dev, deploy, follow }
}

/// Containers `[runtime, main]` in Dev and `[main, main, main]` in Deploy.
fn replicated_platform() -> Arc<FakePlatform> {
    let platform = FakePlatform::new(Platform::Podman);
    platform.add_container("runtime", "dev-pod", Mode::Dev, &["runtime ready"]);
    platform.add_container("main", "dev-pod", Mode::Dev, &["main ready"]);
    platform.add_container("main", "deploy-1", Mode::Deploy, &["replica 1"]);
    platform.add_container("main", "deploy-2", Mode::Deploy, &["replica 2"]);
    platform.add_container("main", "deploy-3", Mode::Deploy, &["replica 3"]);
    platform
}

async fn snapshot(aggregator: &LogAggregator, request: LogsRequest) -> Vec<String> {
    match aggregator.stream(request, &StopSignal::never()).await.unwrap() {
        LogsOutput::NoContainers(message) => vec![message],
        LogsOutput::Streaming(mut stream) => {
            let mut lines = Vec::new();
            while let Some(item) = stream.next().await {
                lines.push(item.unwrap().to_string());
            }
            assert_eq!(stream.phase(), FollowPhase::Done);
            lines
        }
    }
}

async fn next_line(stream: &mut LogStream) -> String {
    tokio::time::timeout(Duration::from_secs(2), stream.next())
        .await
        .expect("timed out waiting for a log line")
        .expect("stream ended early")
        .expect("source failed")
        .to_string()
}

#[tokio::test]
async fn test_no_containers_is_soft_success() {
    // BEHAVIOR: zero matching containers yields a message, not an error
    let platform = FakePlatform::new(Platform::Cluster);
    platform.add_stopped_container("main", "old-pod", Mode::Dev);

    for (dev, deploy) in [(false, false), (true, false), (false, true)] {
        let lines = snapshot(&aggregator(&platform), request(dev, deploy, false)).await;
        assert_eq!(lines.len(), 1);
        assert!(lines[0].contains("no containers running in the specified mode for the component"));
    }
}

#[tokio::test]
async fn test_conflicting_flags_fail_before_backend() {
    // BEHAVIOR: --dev with --deploy is rejected without touching the platform
    let platform = replicated_platform();
    let err = aggregator(&platform)
        .stream(request(true, true, false), &StopSignal::never())
        .await
        .unwrap_err();

    assert_eq!(
        err.to_string(),
        "pass only one of --dev or --deploy flags; pass no flag to see logs for both modes"
    );
    assert_eq!(platform.calls(), 0);
}

#[tokio::test]
async fn test_label_determinism_per_mode() {
    // BEHAVIOR: repeated logical names get bracketed indexes in discovery order
    let platform = replicated_platform();
    let aggregator = aggregator(&platform);

    assert_eq!(
        snapshot(&aggregator, request(true, false, false)).await,
        vec!["runtime: runtime ready", "main: main ready"]
    );
    assert_eq!(
        snapshot(&aggregator, request(false, true, false)).await,
        vec!["main: replica 1", "main[1]: replica 2", "main[2]: replica 3"]
    );

    let both = vec![
        "runtime: runtime ready",
        "main: main ready",
        "main[1]: replica 1",
        "main[2]: replica 2",
        "main[3]: replica 3",
    ];
    assert_eq!(snapshot(&aggregator, request(false, false, false)).await, both);
    // Unchanged backend state gives identical output
    assert_eq!(snapshot(&aggregator, request(false, false, false)).await, both);
}

#[tokio::test]
async fn test_both_modes_degrade_when_one_fails() {
    // BEHAVIOR: with no mode flag, a failing mode contributes nothing instead of failing the call
    let platform = replicated_platform();
    platform.fail_mode(Mode::Deploy);

    assert_eq!(
        snapshot(&aggregator(&platform), request(false, false, false)).await,
        vec!["runtime: runtime ready", "main: main ready"]
    );

    let err = aggregator(&platform)
        .stream(request(false, true, false), &StopSignal::never())
        .await
        .unwrap_err();
    assert!(err.to_string().contains("Deploy listing failed"));
}

#[tokio::test]
async fn test_unreachable_platform_surfaces_diagnostic() {
    let platform = replicated_platform();
    platform.set_unreachable("dial unix /run/podman/podman.sock: connect: no such file");

    let err = aggregator(&platform)
        .stream(request(false, false, false), &StopSignal::never())
        .await
        .unwrap_err();
    assert!(err.to_string().contains("unable to access podman"));
}

#[tokio::test]
async fn test_follow_grows_until_all_sources_close() {
    // BEHAVIOR: follow output only grows; the stream ends once every source closes
    let platform = FakePlatform::new(Platform::Cluster);
    let runtime = platform.add_container("runtime", "pod", Mode::Dev, &["booting"]);
    let main = platform.add_container("main", "pod", Mode::Dev, &[]);

    let LogsOutput::Streaming(mut stream) = aggregator(&platform)
        .stream(request(true, false, true), &StopSignal::never())
        .await
        .unwrap()
    else {
        panic!("expected a stream");
    };

    let mut seen = vec![next_line(&mut stream).await];
    assert_eq!(seen, vec!["runtime: booting"]);

    assert!(eventually(|| platform.is_followed(&main)).await);
    platform.push_live(&main, "listening on 3000");
    platform.push_live(&runtime, "compiled");

    let before = seen.len();
    seen.push(next_line(&mut stream).await);
    seen.push(next_line(&mut stream).await);
    assert!(seen.len() > before);
    assert!(seen.contains(&"main: listening on 3000".to_string()));
    assert!(seen.contains(&"runtime: compiled".to_string()));

    platform.close_live(&runtime);
    platform.close_live(&main);
    assert!(stream.next().await.is_none());
    assert_eq!(stream.phase(), FollowPhase::Done);
    assert_eq!(stream.end_reason(), Some(FollowPhase::AllSourcesClosed));
}

#[tokio::test]
async fn test_cancel_joins_every_source() {
    // BEHAVIOR: cancel returns only after all subscriptions have closed
    let platform = FakePlatform::new(Platform::Cluster);
    let main = platform.add_container("main", "pod-a", Mode::Deploy, &["up"]);
    let replica = platform.add_container("main", "pod-b", Mode::Deploy, &["up"]);

    let LogsOutput::Streaming(mut stream) = aggregator(&platform)
        .stream(request(false, true, true), &StopSignal::never())
        .await
        .unwrap()
    else {
        panic!("expected a stream");
    };
    next_line(&mut stream).await;
    next_line(&mut stream).await;

    stream.cancel().await;
    assert_eq!(stream.phase(), FollowPhase::Done);
    assert_eq!(stream.end_reason(), Some(FollowPhase::Cancelled));
    assert!(stream.next().await.is_none());

    // The receivers were dropped with their tasks
    assert!(!platform.push_live(&main, "late"));
    assert!(!platform.push_live(&replica, "late"));
}

#[tokio::test]
async fn test_follow_picks_up_new_replicas() {
    // BEHAVIOR: with discovery enabled, containers started later join with continued labels
    let platform = FakePlatform::new(Platform::Podman);
    platform.add_container("main", "deploy-1", Mode::Deploy, &["first"]);

    let stop = StopTrigger::new();
    let aggregator = aggregator(&platform).with_discovery_interval(Some(Duration::from_millis(20)));
    let LogsOutput::Streaming(mut stream) = aggregator
        .stream(request(false, true, true), &stop.signal())
        .await
        .unwrap()
    else {
        panic!("expected a stream");
    };
    assert_eq!(next_line(&mut stream).await, "main: first");

    platform.add_container("main", "deploy-2", Mode::Deploy, &["second"]);
    assert_eq!(next_line(&mut stream).await, "main[1]: second");

    stop.stop();
    assert!(stream.next().await.is_none());
    assert_eq!(stream.end_reason(), Some(FollowPhase::Cancelled));
}

#[tokio::test]
async fn test_follow_resubscribes_restarted_container() {
    // BEHAVIOR: a container whose log closed while it stays running is followed again under its old label
    let platform = FakePlatform::new(Platform::Cluster);
    let main = platform.add_container("main", "pod", Mode::Dev, &["first boot"]);

    let stop = StopTrigger::new();
    let aggregator = aggregator(&platform).with_discovery_interval(Some(Duration::from_millis(20)));
    let LogsOutput::Streaming(mut stream) = aggregator
        .stream(request(true, false, true), &stop.signal())
        .await
        .unwrap()
    else {
        panic!("expected a stream");
    };
    assert_eq!(next_line(&mut stream).await, "main: first boot");
    assert!(eventually(|| platform.is_followed(&main)).await);

    // The log ends but the container is still listed as running
    platform.close_live(&main);
    assert_eq!(next_line(&mut stream).await, "main: first boot");
    assert!(eventually(|| platform.is_followed(&main)).await);

    platform.push_live(&main, "second boot");
    assert_eq!(next_line(&mut stream).await, "main: second boot");

    stop.stop();
    assert!(stream.next().await.is_none());
    assert_eq!(stream.end_reason(), Some(FollowPhase::Cancelled));
}

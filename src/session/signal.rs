// ABOUTME: Stop signals and task groups used to cancel and join background work as a unit
// A signal fires when its trigger stops or is dropped; groups inherit their parent's signal

use futures_util::future::{select_all, FutureExt};
use std::future::Future;
use tokio::sync::watch;
use tokio::task::JoinSet;
use tracing::{debug, error};

/// Observer side of one or more stop triggers; fires as soon as any of them does.
#[derive(Clone, Debug, Default)]
pub struct StopSignal {
    receivers: Vec<watch::Receiver<bool>>,
}

impl StopSignal {
    /// A signal that never fires.
    pub fn never() -> Self {
        Self::default()
    }

    pub fn is_stopped(&self) -> bool {
        self.receivers
            .iter()
            .any(|rx| *rx.borrow() || rx.has_changed().is_err())
    }

    /// Resolves once stopped. Pending forever for `never()`.
    pub async fn stopped(&self) {
        if self.receivers.is_empty() {
            return std::future::pending().await;
        }
        let waits = self.receivers.iter().cloned().map(|mut rx| {
            async move {
                // Err means the trigger was dropped, which also counts as stopped
                let _ = rx.wait_for(|stopped| *stopped).await;
            }
            .boxed()
        });
        select_all(waits).await;
    }

    /// A signal firing when either `self` or `other` fires.
    pub fn merge(&self, other: &StopSignal) -> StopSignal {
        let mut receivers = self.receivers.clone();
        receivers.extend(other.receivers.iter().cloned());
        StopSignal { receivers }
    }
}

/// Owning side of a stop signal.
#[derive(Debug)]
pub struct StopTrigger {
    tx: watch::Sender<bool>,
}

impl StopTrigger {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(false);
        Self { tx }
    }

    pub fn signal(&self) -> StopSignal {
        StopSignal {
            receivers: vec![self.tx.subscribe()],
        }
    }

    pub fn stop(&self) {
        self.tx.send_replace(true);
    }

    pub fn is_stopped(&self) -> bool {
        *self.tx.borrow()
    }
}

impl Default for StopTrigger {
    fn default() -> Self {
        Self::new()
    }
}

/// Background tasks that stop and join together.
///
/// Every task receives the group's signal, which also fires when the parent signal
/// the group was created under fires. Dropping the group aborts whatever is left.
#[derive(Debug)]
pub struct TaskGroup {
    trigger: StopTrigger,
    signal: StopSignal,
    tasks: JoinSet<()>,
}

impl TaskGroup {
    pub fn new() -> Self {
        Self::with_parent(&StopSignal::never())
    }

    pub fn with_parent(parent: &StopSignal) -> Self {
        let trigger = StopTrigger::new();
        let signal = trigger.signal().merge(parent);
        Self {
            trigger,
            signal,
            tasks: JoinSet::new(),
        }
    }

    pub fn signal(&self) -> StopSignal {
        self.signal.clone()
    }

    pub fn spawn<F, Fut>(&mut self, task: F)
    where
        F: FnOnce(StopSignal) -> Fut,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.tasks.spawn(task(self.signal.clone()));
    }

    pub fn stop(&self) {
        self.trigger.stop();
    }

    pub fn is_stopped(&self) -> bool {
        self.signal.is_stopped()
    }

    /// Block until every task in the group has exited.
    pub async fn wait_end(&mut self) {
        while let Some(result) = self.tasks.join_next().await {
            match result {
                Ok(()) => {}
                Err(e) if e.is_panic() => error!("Background task panicked: {}", e),
                Err(e) => debug!("Background task cancelled: {}", e),
            }
        }
    }

    pub async fn shutdown(&mut self) {
        self.stop();
        self.wait_end().await;
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }
}

impl Default for TaskGroup {
    fn default() -> Self {
        Self::new()
    }
}

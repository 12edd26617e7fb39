use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::error::Result;
use crate::traits::EventSink;
use crate::types::{BlockId, RunId};

/// Kind of a run event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum EventKind {
    RunStarted,
    Started,
    Streaming,
    Succeeded,
    Failed,
    Skipped,
    RunSucceeded,
    RunFailed,
    RunCancelled,
}

impl EventKind {
    /// Lifecycle events are never dropped by the emitter queue; only
    /// streaming chunks are.
    pub fn is_lifecycle(&self) -> bool {
        !matches!(self, Self::Streaming)
    }

    pub fn is_run_terminal(&self) -> bool {
        matches!(
            self,
            Self::RunSucceeded | Self::RunFailed | Self::RunCancelled
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::RunStarted => "run-started",
            Self::Started => "started",
            Self::Streaming => "streaming",
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
            Self::Skipped => "skipped",
            Self::RunSucceeded => "run-succeeded",
            Self::RunFailed => "run-failed",
            Self::RunCancelled => "run-cancelled",
        }
    }
}

impl std::fmt::Display for EventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A single entry of a run's ordered event stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunEvent {
    pub run_id: RunId,
    /// Monotonically increasing within a run, starting at 1.
    pub seq: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub block_id: Option<BlockId>,
    pub kind: EventKind,
    #[serde(default)]
    pub payload: serde_json::Value,
    pub timestamp: DateTime<Utc>,
}

/// Event bus using tokio broadcast channel.
/// All subscribers receive all events of all runs; per-run consumers use
/// `subscribe_run`.
pub struct EventBus {
    tx: broadcast::Sender<RunEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    pub fn publish(&self, event: RunEvent) {
        // Ignore error if no receivers
        let _ = self.tx.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<RunEvent> {
        self.tx.subscribe()
    }

    /// Subscribe to the events of one run.
    pub fn subscribe_run(&self, run_id: RunId) -> RunSubscription {
        RunSubscription {
            run_id,
            rx: self.tx.subscribe(),
            done: false,
        }
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(1024)
    }
}

impl EventSink for EventBus {
    fn deliver(&self, event: RunEvent) -> BoxFuture<'_, Result<()>> {
        self.publish(event);
        Box::pin(async { Ok(()) })
    }
}

/// Receiver filtered to a single run. Ends after the run's terminal event.
pub struct RunSubscription {
    run_id: RunId,
    rx: broadcast::Receiver<RunEvent>,
    done: bool,
}

impl RunSubscription {
    /// Next event of this run, or `None` once the run finished or the bus
    /// closed. Lagged receivers skip ahead; consumers detect the gap from
    /// sequence numbers.
    pub async fn recv(&mut self) -> Option<RunEvent> {
        if self.done {
            return None;
        }
        loop {
            match self.rx.recv().await {
                Ok(event) if event.run_id == self.run_id => {
                    if event.kind.is_run_terminal() {
                        self.done = true;
                    }
                    return Some(event);
                }
                Ok(_) => continue,
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    tracing::debug!(skipped = n, run_id = %self.run_id, "Run subscription lagged");
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }
}

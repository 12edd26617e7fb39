use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use futures::future::BoxFuture;
use parking_lot::Mutex;
use tokio::sync::mpsc;

use braid_core::error::{BraidError, Result};
use braid_core::event::{EventKind, RunEvent};
use braid_core::traits::EventSink;

/// Keeps every delivered event in memory.
#[derive(Clone, Default)]
pub struct RecordingSink {
    events: Arc<Mutex<Vec<RunEvent>>>,
}

impl RecordingSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<RunEvent> {
        self.events.lock().clone()
    }

    /// Kinds of the events for one block, in delivery order.
    pub fn kinds_for(&self, block_id: &str) -> Vec<EventKind> {
        self.events
            .lock()
            .iter()
            .filter(|e| e.block_id.as_deref() == Some(block_id))
            .map(|e| e.kind)
            .collect()
    }

    pub fn count(&self, kind: EventKind) -> usize {
        self.events.lock().iter().filter(|e| e.kind == kind).count()
    }

    pub fn clear(&self) {
        self.events.lock().clear();
    }
}

impl EventSink for RecordingSink {
    fn deliver(&self, event: RunEvent) -> BoxFuture<'_, Result<()>> {
        self.events.lock().push(event);
        Box::pin(async { Ok(()) })
    }
}

/// Forwards events into an unbounded channel.
pub struct ChannelSink {
    tx: mpsc::UnboundedSender<RunEvent>,
}

impl ChannelSink {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<RunEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

impl EventSink for ChannelSink {
    fn deliver(&self, event: RunEvent) -> BoxFuture<'_, Result<()>> {
        let result = self
            .tx
            .send(event)
            .map_err(|e| BraidError::EventDelivery(e.to_string()));
        Box::pin(async move { result })
    }
}

/// Rejects the first `failures` deliveries, then records like
/// `RecordingSink`. With `record_before_failing` the rejected events are
/// recorded too, which produces duplicates on redelivery.
#[derive(Clone)]
pub struct FlakySink {
    failures: u32,
    record_before_failing: bool,
    attempts: Arc<AtomicU32>,
    inner: RecordingSink,
}

impl FlakySink {
    pub fn new(failures: u32) -> Self {
        Self {
            failures,
            record_before_failing: false,
            attempts: Arc::new(AtomicU32::new(0)),
            inner: RecordingSink::new(),
        }
    }

    pub fn recording_before_failing(mut self) -> Self {
        self.record_before_failing = true;
        self
    }

    pub fn attempts(&self) -> u32 {
        self.attempts.load(Ordering::SeqCst)
    }

    pub fn recorded(&self) -> &RecordingSink {
        &self.inner
    }
}

impl EventSink for FlakySink {
    fn deliver(&self, event: RunEvent) -> BoxFuture<'_, Result<()>> {
        let attempt = self.attempts.fetch_add(1, Ordering::SeqCst);
        if attempt < self.failures {
            if self.record_before_failing {
                self.inner.events.lock().push(event);
            }
            return Box::pin(async move {
                Err(BraidError::EventDelivery(format!(
                    "flaky sink rejected delivery {}",
                    attempt + 1
                )))
            });
        }
        self.inner.deliver(event)
    }
}

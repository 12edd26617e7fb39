//! Ordered, bounded event queue between a run and its sink.
//!
//! The emitter stamps each event with the next value of the run's logical
//! clock while holding the queue lock, so queue order is sequence order.
//! A dispatcher task ([`deliver`]) drains the queue into an [`EventSink`],
//! retrying failed deliveries.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::Notify;
use tracing::{debug, error, warn};

use braid_core::event::{EventKind, RunEvent};
use braid_core::traits::EventSink;
use braid_core::types::BlockId;

use crate::context::ExecutionContext;
use crate::retry::RetryPolicy;

/// An event before it is sequenced.
#[derive(Debug, Clone)]
pub struct EventDraft {
    pub block_id: Option<BlockId>,
    pub kind: EventKind,
    pub payload: Value,
    pub timestamp: DateTime<Utc>,
}

impl EventDraft {
    pub fn run(kind: EventKind, payload: Value, timestamp: DateTime<Utc>) -> Self {
        Self {
            block_id: None,
            kind,
            payload,
            timestamp,
        }
    }

    pub fn block(
        block_id: impl Into<BlockId>,
        kind: EventKind,
        payload: Value,
        timestamp: DateTime<Utc>,
    ) -> Self {
        Self {
            block_id: Some(block_id.into()),
            kind,
            payload,
            timestamp,
        }
    }
}

struct Queue {
    events: VecDeque<RunEvent>,
    closed: bool,
    dropped: u64,
}

struct Shared {
    queue: Mutex<Queue>,
    readable: Notify,
    writable: Notify,
    capacity: usize,
}

/// Producer half. Cheap to clone; every clone feeds the same queue.
#[derive(Clone)]
pub struct EventEmitter {
    ctx: Arc<ExecutionContext>,
    shared: Arc<Shared>,
    /// Serializes producers so a back-pressured lifecycle event keeps its
    /// place ahead of later events.
    order: Arc<tokio::sync::Mutex<()>>,
}

/// Consumer half.
pub struct EventReceiver {
    shared: Arc<Shared>,
}

/// Create the event queue for a run.
pub fn channel(ctx: Arc<ExecutionContext>, capacity: usize) -> (EventEmitter, EventReceiver) {
    let shared = Arc::new(Shared {
        queue: Mutex::new(Queue {
            events: VecDeque::with_capacity(capacity),
            closed: false,
            dropped: 0,
        }),
        readable: Notify::new(),
        writable: Notify::new(),
        capacity: capacity.max(1),
    });
    (
        EventEmitter {
            ctx,
            shared: shared.clone(),
            order: Arc::new(tokio::sync::Mutex::new(())),
        },
        EventReceiver { shared },
    )
}

impl EventEmitter {
    fn stamp(&self, draft: EventDraft) -> RunEvent {
        RunEvent {
            run_id: self.ctx.run_id().clone(),
            seq: self.ctx.tick(),
            block_id: draft.block_id,
            kind: draft.kind,
            payload: draft.payload,
            timestamp: draft.timestamp,
        }
    }

    /// Enqueue an event. Returns its sequence number, or `None` if a
    /// streaming chunk was dropped or the queue is closed.
    ///
    /// When the queue is full the oldest queued streaming event makes room.
    /// With no streaming event to evict, a lifecycle event waits for the
    /// dispatcher and an incoming chunk is dropped.
    pub async fn emit(&self, draft: EventDraft) -> Option<u64> {
        let _order = self.order.lock().await;
        loop {
            let writable = self.shared.writable.notified();
            tokio::pin!(writable);
            writable.as_mut().enable();

            {
                let mut queue = self.shared.queue.lock();
                if queue.closed {
                    debug!(kind = %draft.kind, "Event emitted after close, dropped");
                    return None;
                }
                if queue.events.len() >= self.shared.capacity {
                    if let Some(pos) = queue
                        .events
                        .iter()
                        .position(|e| e.kind == EventKind::Streaming)
                    {
                        queue.events.remove(pos);
                        queue.dropped += 1;
                    } else if !draft.kind.is_lifecycle() {
                        queue.dropped += 1;
                        return None;
                    }
                }
                if queue.events.len() < self.shared.capacity {
                    let event = self.stamp(draft);
                    let seq = event.seq;
                    queue.events.push_back(event);
                    drop(queue);
                    self.shared.readable.notify_one();
                    return Some(seq);
                }
            }

            writable.await;
        }
    }

    /// Stop accepting events. The receiver drains what is queued, then ends.
    pub fn close(&self) {
        self.shared.queue.lock().closed = true;
        self.shared.readable.notify_one();
    }

    /// Streaming events dropped so far.
    pub fn dropped(&self) -> u64 {
        self.shared.queue.lock().dropped
    }
}

impl EventReceiver {
    /// Next queued event, or `None` once the emitter closed and the queue is
    /// drained.
    pub async fn recv(&mut self) -> Option<RunEvent> {
        loop {
            let readable = self.shared.readable.notified();
            tokio::pin!(readable);
            readable.as_mut().enable();

            {
                let mut queue = self.shared.queue.lock();
                if let Some(event) = queue.events.pop_front() {
                    drop(queue);
                    self.shared.writable.notify_one();
                    return Some(event);
                }
                if queue.closed {
                    return None;
                }
            }

            readable.await;
        }
    }
}

/// Drain `receiver` into `sink` until the emitter closes.
///
/// A failed delivery is retried with exponential backoff. Streaming chunks
/// are dropped once `retries` is spent; lifecycle events are retried until
/// the sink takes them, so a dead sink back-pressures the run through the
/// bounded queue.
pub async fn deliver(mut receiver: EventReceiver, sink: Arc<dyn EventSink>, retries: u32) {
    let backoff = RetryPolicy::new(retries)
        .with_backoff(Duration::from_millis(10), Duration::from_secs(1));
    while let Some(event) = receiver.recv().await {
        let mut attempt: u32 = 0;
        loop {
            attempt = attempt.saturating_add(1);
            let err = match sink.deliver(event.clone()).await {
                Ok(()) => break,
                Err(e) => e,
            };
            if attempt > retries {
                if event.kind == EventKind::Streaming {
                    warn!(
                        run_id = %event.run_id,
                        seq = event.seq,
                        error = %err,
                        "Chunk delivery failed, dropping chunk"
                    );
                    break;
                }
                if attempt == retries.saturating_add(1) {
                    error!(
                        run_id = %event.run_id,
                        seq = event.seq,
                        kind = %event.kind,
                        error = %err,
                        "Event sink unavailable, holding lifecycle event"
                    );
                }
            } else {
                warn!(
                    run_id = %event.run_id,
                    seq = event.seq,
                    attempt,
                    error = %err,
                    "Event delivery failed, retrying"
                );
            }
            tokio::time::sleep(backoff.backoff(attempt)).await;
        }
        if attempt > 1 {
            debug!(run_id = %event.run_id, seq = event.seq, attempt, "Event delivered after retry");
        }
    }
}

impl std::fmt::Debug for EventEmitter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventEmitter")
            .field("run_id", self.ctx.run_id())
            .field("capacity", &self.shared.capacity)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::{Block, Graph};
    use braid_core::types::{CallerIdentity, RunId};
    use braid_test_utils::{FlakySink, RecordingSink};
    use serde_json::json;
    use tokio_util::sync::CancellationToken;

    fn ctx() -> Arc<ExecutionContext> {
        let graph = Graph::new("g", "a")
            .with_block(Block::invoking("a", "echo"))
            .validate()
            .unwrap();
        Arc::new(ExecutionContext::new(
            RunId::from_string("r1"),
            &graph,
            json!({}),
            CallerIdentity::anonymous(),
            CancellationToken::new(),
        ))
    }

    fn draft(kind: EventKind, n: u64) -> EventDraft {
        EventDraft::block("a", kind, json!({"n": n}), Utc::now())
    }

    async fn drain(rx: &mut EventReceiver) -> Vec<RunEvent> {
        let mut out = Vec::new();
        while let Some(e) = rx.recv().await {
            out.push(e);
        }
        out
    }

    #[tokio::test]
    async fn test_sequence_order() {
        let (tx, mut rx) = channel(ctx(), 16);
        for n in 0..5 {
            assert_eq!(tx.emit(draft(EventKind::Started, n)).await, Some(n + 1));
        }
        tx.close();
        let seqs: Vec<u64> = drain(&mut rx).await.iter().map(|e| e.seq).collect();
        assert_eq!(seqs, vec![1, 2, 3, 4, 5]);
    }

    #[tokio::test]
    async fn test_full_queue_drops_oldest_chunk() {
        let (tx, mut rx) = channel(ctx(), 2);
        tx.emit(draft(EventKind::Streaming, 0)).await;
        tx.emit(draft(EventKind::Started, 1)).await;
        // Full: evicts the queued chunk.
        tx.emit(draft(EventKind::Succeeded, 2)).await;
        // Full with no chunk queued: the incoming chunk is dropped.
        assert_eq!(tx.emit(draft(EventKind::Streaming, 3)).await, None);
        assert_eq!(tx.dropped(), 2);
        tx.close();

        let events = drain(&mut rx).await;
        let kinds: Vec<EventKind> = events.iter().map(|e| e.kind).collect();
        assert_eq!(kinds, vec![EventKind::Started, EventKind::Succeeded]);
        assert_eq!(events[0].seq, 2);
        assert_eq!(events[1].seq, 3);
    }

    #[tokio::test]
    async fn test_lifecycle_waits_for_room() {
        let (tx, mut rx) = channel(ctx(), 1);
        tx.emit(draft(EventKind::Started, 0)).await;

        let producer = {
            let tx = tx.clone();
            tokio::spawn(async move { tx.emit(draft(EventKind::Succeeded, 1)).await })
        };
        tokio::task::yield_now().await;
        assert!(!producer.is_finished());

        assert_eq!(rx.recv().await.unwrap().kind, EventKind::Started);
        assert_eq!(producer.await.unwrap(), Some(2));
        assert_eq!(rx.recv().await.unwrap().kind, EventKind::Succeeded);
    }

    #[tokio::test]
    async fn test_deliver_to_sink() {
        let (tx, rx) = channel(ctx(), 8);
        let sink = RecordingSink::new();
        let dispatcher = tokio::spawn(deliver(rx, Arc::new(sink.clone()), 0));
        tx.emit(draft(EventKind::Started, 0)).await;
        tx.emit(draft(EventKind::Succeeded, 1)).await;
        tx.close();
        dispatcher.await.unwrap();
        assert_eq!(sink.events().len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_lifecycle_outlasts_retry_budget() {
        let (tx, rx) = channel(ctx(), 8);
        let sink = FlakySink::new(10);
        let dispatcher = tokio::spawn(deliver(rx, Arc::new(sink.clone()), 2));
        tx.emit(draft(EventKind::Started, 0)).await;
        tx.close();
        dispatcher.await.unwrap();
        assert_eq!(sink.attempts(), 11);
        let kinds: Vec<EventKind> = sink.recorded().events().iter().map(|e| e.kind).collect();
        assert_eq!(kinds, vec![EventKind::Started]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_chunk_dropped_after_retry_budget() {
        let (tx, rx) = channel(ctx(), 8);
        let sink = FlakySink::new(3);
        let dispatcher = tokio::spawn(deliver(rx, Arc::new(sink.clone()), 1));
        tx.emit(draft(EventKind::Streaming, 0)).await;
        tx.emit(draft(EventKind::Started, 1)).await;
        tx.close();
        dispatcher.await.unwrap();
        // Two attempts for the chunk, then two for the lifecycle event.
        assert_eq!(sink.attempts(), 4);
        let events = sink.recorded().events();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].kind, EventKind::Started);
        assert_eq!(events[0].seq, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_deliver_recovers() {
        let (tx, rx) = channel(ctx(), 8);
        let sink = FlakySink::new(1);
        let dispatcher = tokio::spawn(deliver(rx, Arc::new(sink.clone()), 3));
        tx.emit(draft(EventKind::Started, 0)).await;
        tx.close();
        dispatcher.await.unwrap();
        assert_eq!(sink.recorded().events().len(), 1);
    }
}

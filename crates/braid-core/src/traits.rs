use futures::future::BoxFuture;
use futures::stream::BoxStream;

use crate::error::Result;
use crate::event::RunEvent;
use crate::types::{CapabilityEvent, Invocation};

/// Capability: a named, uniformly invocable unit of work referenced by blocks.
pub trait Capability: Send + Sync + 'static {
    /// Capability name (used in block definitions).
    fn name(&self) -> &str;

    /// Human-readable description.
    fn description(&self) -> &str;

    /// Start an invocation. The stream yields zero or more
    /// `CapabilityEvent::Partial` chunks followed by one `CapabilityEvent::Output`;
    /// an `Err` item fails the attempt.
    ///
    /// Implementations should watch `invocation.cancel` and return promptly
    /// once it fires.
    fn invoke(&self, invocation: Invocation) -> BoxStream<'_, Result<CapabilityEvent>>;

    /// Request cancellation of an in-flight invocation by id. The engine also
    /// cancels the invocation's token, so most capabilities need not override this.
    fn cancel(&self, invocation_id: &str) -> BoxFuture<'_, ()> {
        let _ = invocation_id;
        Box::pin(async {})
    }

    /// Whether this capability emits partial chunks.
    fn streaming(&self) -> bool {
        false
    }
}

/// Event sink: the downstream fan-out interface for run events.
///
/// Delivery may be retried after an error, so sinks must tolerate duplicates
/// (identified by `(run_id, seq)`).
pub trait EventSink: Send + Sync + 'static {
    fn deliver(&self, event: RunEvent) -> BoxFuture<'_, Result<()>>;
}

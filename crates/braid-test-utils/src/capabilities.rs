use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::stream::{self, BoxStream, StreamExt};
use parking_lot::Mutex;
use serde_json::Value;

use braid_core::error::{BraidError, Result};
use braid_core::traits::Capability;
use braid_core::types::{CapabilityEvent, Invocation};

fn output(value: Value) -> BoxStream<'static, Result<CapabilityEvent>> {
    stream::once(async move { Ok(CapabilityEvent::Output(value)) }).boxed()
}

fn failure(error: BraidError) -> BoxStream<'static, Result<CapabilityEvent>> {
    stream::once(async move { Err(error) }).boxed()
}

// ── ScriptedCapability ──────────────────────────────────────────

/// Fails the first `failures` invocations with a handler error, then
/// succeeds. Succeeds with `output`, or with its inputs when none is set.
#[derive(Clone)]
pub struct ScriptedCapability {
    name: String,
    failures: u32,
    output: Option<Value>,
    calls: Arc<AtomicU32>,
}

impl ScriptedCapability {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            failures: 0,
            output: None,
            calls: Arc::new(AtomicU32::new(0)),
        }
    }

    /// A capability that never succeeds.
    pub fn always_failing(name: impl Into<String>) -> Self {
        Self::new(name).failing(u32::MAX)
    }

    pub fn failing(mut self, failures: u32) -> Self {
        self.failures = failures;
        self
    }

    pub fn returning(mut self, output: Value) -> Self {
        self.output = Some(output);
        self
    }

    /// Invocations so far, across clones.
    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }
}

impl Capability for ScriptedCapability {
    fn name(&self) -> &str {
        &self.name
    }
    fn description(&self) -> &str {
        "Scripted test capability"
    }
    fn invoke(&self, invocation: Invocation) -> BoxStream<'_, Result<CapabilityEvent>> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst);
        if call < self.failures {
            return failure(BraidError::Handler {
                capability: self.name.clone(),
                message: format!("scripted failure {}", call + 1),
            });
        }
        output(self.output.clone().unwrap_or(invocation.inputs))
    }
}

// ── SlowCapability ──────────────────────────────────────────────

/// Sleeps before returning its inputs. When `honor_cancel` is false the
/// cancellation token is ignored, which models a handler that must be
/// abandoned after the grace period.
#[derive(Clone)]
pub struct SlowCapability {
    name: String,
    delay: Duration,
    honor_cancel: bool,
    started: Arc<AtomicU32>,
    cancel_requests: Arc<AtomicU32>,
}

impl SlowCapability {
    pub fn new(name: impl Into<String>, delay: Duration) -> Self {
        Self {
            name: name.into(),
            delay,
            honor_cancel: true,
            started: Arc::new(AtomicU32::new(0)),
            cancel_requests: Arc::new(AtomicU32::new(0)),
        }
    }

    pub fn ignoring_cancel(mut self) -> Self {
        self.honor_cancel = false;
        self
    }

    pub fn started(&self) -> u32 {
        self.started.load(Ordering::SeqCst)
    }

    /// Calls to `Capability::cancel`.
    pub fn cancel_requests(&self) -> u32 {
        self.cancel_requests.load(Ordering::SeqCst)
    }
}

impl Capability for SlowCapability {
    fn name(&self) -> &str {
        &self.name
    }
    fn description(&self) -> &str {
        "Slow test capability"
    }
    fn invoke(&self, invocation: Invocation) -> BoxStream<'_, Result<CapabilityEvent>> {
        self.started.fetch_add(1, Ordering::SeqCst);
        let delay = self.delay;
        let honor_cancel = self.honor_cancel;
        stream::once(async move {
            if honor_cancel {
                tokio::select! {
                    _ = tokio::time::sleep(delay) => {}
                    _ = invocation.cancel.cancelled() => return Err(BraidError::Cancelled),
                }
            } else {
                tokio::time::sleep(delay).await;
            }
            Ok(CapabilityEvent::Output(invocation.inputs))
        })
        .boxed()
    }
    fn cancel(&self, _invocation_id: &str) -> futures::future::BoxFuture<'_, ()> {
        self.cancel_requests.fetch_add(1, Ordering::SeqCst);
        Box::pin(async {})
    }
}

// ── ConcurrencyProbe ────────────────────────────────────────────

#[derive(Default)]
struct ProbeState {
    current: AtomicUsize,
    peak: AtomicUsize,
    order: Mutex<Vec<String>>,
}

/// Records how many invocations overlap, and the order blocks started in.
#[derive(Clone)]
pub struct ConcurrencyProbe {
    name: String,
    delay: Duration,
    state: Arc<ProbeState>,
}

impl ConcurrencyProbe {
    pub fn new(name: impl Into<String>, delay: Duration) -> Self {
        Self {
            name: name.into(),
            delay,
            state: Arc::new(ProbeState::default()),
        }
    }

    /// Highest number of simultaneous invocations observed.
    pub fn peak(&self) -> usize {
        self.state.peak.load(Ordering::SeqCst)
    }

    pub fn current(&self) -> usize {
        self.state.current.load(Ordering::SeqCst)
    }

    /// Block ids in invocation order.
    pub fn order(&self) -> Vec<String> {
        self.state.order.lock().clone()
    }
}

impl Capability for ConcurrencyProbe {
    fn name(&self) -> &str {
        &self.name
    }
    fn description(&self) -> &str {
        "Concurrency-measuring test capability"
    }
    fn invoke(&self, invocation: Invocation) -> BoxStream<'_, Result<CapabilityEvent>> {
        let state = self.state.clone();
        let delay = self.delay;
        stream::once(async move {
            state.order.lock().push(invocation.block_id.clone());
            let now = state.current.fetch_add(1, Ordering::SeqCst) + 1;
            state.peak.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(delay).await;
            state.current.fetch_sub(1, Ordering::SeqCst);
            Ok(CapabilityEvent::Output(invocation.inputs))
        })
        .boxed()
    }
}

// ── StreamingCapability ─────────────────────────────────────────

/// Emits a fixed list of partial chunks, then a final output.
#[derive(Clone)]
pub struct StreamingCapability {
    name: String,
    chunks: Vec<Value>,
    output: Value,
}

impl StreamingCapability {
    pub fn new(name: impl Into<String>, chunks: Vec<Value>, output: Value) -> Self {
        Self {
            name: name.into(),
            chunks,
            output,
        }
    }
}

impl Capability for StreamingCapability {
    fn name(&self) -> &str {
        &self.name
    }
    fn description(&self) -> &str {
        "Streaming test capability"
    }
    fn streaming(&self) -> bool {
        true
    }
    fn invoke(&self, _invocation: Invocation) -> BoxStream<'_, Result<CapabilityEvent>> {
        let partials = self
            .chunks
            .iter()
            .cloned()
            .map(|c| Ok(CapabilityEvent::Partial(c)));
        stream::iter(partials)
            .chain(output(self.output.clone()))
            .boxed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fixtures::invocation;
    use serde_json::json;

    #[tokio::test]
    async fn test_scripted_fails_then_succeeds() {
        let cap = ScriptedCapability::new("flaky").failing(2).returning(json!("ok"));
        for _ in 0..2 {
            let mut s = cap.invoke(invocation(json!({})));
            assert!(s.next().await.unwrap().is_err());
        }
        let mut s = cap.invoke(invocation(json!({})));
        assert_eq!(
            s.next().await.unwrap().unwrap(),
            CapabilityEvent::Output(json!("ok"))
        );
        assert_eq!(cap.clone().calls(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_probe_tracks_peak() {
        let probe = ConcurrencyProbe::new("probe", Duration::from_millis(50));
        let a = probe.invoke(invocation(json!({}))).collect::<Vec<_>>();
        let b = probe.invoke(invocation(json!({}))).collect::<Vec<_>>();
        futures::future::join(a, b).await;
        assert_eq!(probe.peak(), 2);
        assert_eq!(probe.current(), 0);
    }

    #[tokio::test]
    async fn test_streaming_order() {
        let cap = StreamingCapability::new("s", vec![json!(1), json!(2)], json!("end"));
        let items: Vec<_> = cap.invoke(invocation(json!({}))).collect().await;
        assert_eq!(items.len(), 3);
        assert_eq!(
            items[2].as_ref().unwrap(),
            &CapabilityEvent::Output(json!("end"))
        );
    }
}

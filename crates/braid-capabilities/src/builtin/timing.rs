use std::time::Duration;

use futures::stream::BoxStream;
use serde::Deserialize;
use serde_json::Value;

use braid_core::error::{BraidError, Result};
use braid_core::traits::Capability;
use braid_core::types::{CapabilityEvent, Invocation};

use super::{parse_inputs, single};

/// Sleeps for `ms` milliseconds, then returns `value` (or `{"slept_ms": ms}`).
/// Returns early with a cancellation error when the invocation is cancelled.
pub struct DelayCapability;

#[derive(Deserialize)]
struct DelayInput {
    ms: u64,
    #[serde(default)]
    value: Option<Value>,
}

impl Capability for DelayCapability {
    fn name(&self) -> &str {
        "delay"
    }
    fn description(&self) -> &str {
        "Sleep for 'ms' milliseconds, then return 'value'."
    }
    fn invoke(&self, invocation: Invocation) -> BoxStream<'_, Result<CapabilityEvent>> {
        single(async move {
            let p: DelayInput = parse_inputs("delay", invocation.inputs)?;
            tokio::select! {
                _ = tokio::time::sleep(Duration::from_millis(p.ms)) => {}
                _ = invocation.cancel.cancelled() => {
                    tracing::debug!(block_id = %invocation.block_id, "Delay cancelled");
                    return Err(BraidError::Cancelled);
                }
            }
            Ok(p.value.unwrap_or_else(|| serde_json::json!({ "slept_ms": p.ms })))
        })
    }
}

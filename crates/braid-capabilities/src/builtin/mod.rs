pub mod data;
pub mod math;
pub mod text;
pub mod timing;

use std::future::Future;

use futures::stream::{self, BoxStream, StreamExt};
use serde::de::DeserializeOwned;
use serde_json::Value;

use braid_core::error::{BraidError, Result};
use braid_core::types::CapabilityEvent;

/// Wrap a one-shot computation as an invocation stream with a single output.
pub(crate) fn single<'a, F>(fut: F) -> BoxStream<'a, Result<CapabilityEvent>>
where
    F: Future<Output = Result<Value>> + Send + 'a,
{
    stream::once(async move { fut.await.map(CapabilityEvent::Output) }).boxed()
}

/// Deserialize a capability's inputs, rejecting malformed ones as input errors.
pub(crate) fn parse_inputs<T: DeserializeOwned>(capability: &str, inputs: Value) -> Result<T> {
    serde_json::from_value(inputs)
        .map_err(|e| BraidError::InvalidInput(format!("{}: {}", capability, e)))
}

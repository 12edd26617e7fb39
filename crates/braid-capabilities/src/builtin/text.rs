use std::collections::VecDeque;
use std::time::Duration;

use futures::stream::{self, BoxStream, StreamExt};
use serde::Deserialize;
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use braid_core::error::{BraidError, Result};
use braid_core::traits::Capability;
use braid_core::types::{CapabilityEvent, Invocation};

use super::parse_inputs;

/// Streams the words of `text` as partial chunks, then outputs the full text.
pub struct TextStreamCapability;

#[derive(Deserialize)]
struct TextStreamInput {
    text: String,
    /// Pause before each chunk after the first.
    #[serde(default)]
    delay_ms: u64,
}

struct Progress {
    words: VecDeque<String>,
    text: String,
    delay: Duration,
    cancel: CancellationToken,
    emitted: usize,
    done: bool,
}

impl Progress {
    async fn step(mut self) -> Option<(Result<CapabilityEvent>, Self)> {
        if self.done {
            return None;
        }
        if self.emitted > 0 && !self.delay.is_zero() {
            tokio::select! {
                _ = tokio::time::sleep(self.delay) => {}
                _ = self.cancel.cancelled() => {
                    self.done = true;
                    return Some((Err(BraidError::Cancelled), self));
                }
            }
        }
        match self.words.pop_front() {
            Some(word) => {
                self.emitted += 1;
                Some((Ok(CapabilityEvent::Partial(Value::String(word))), self))
            }
            None => {
                self.done = true;
                let text = std::mem::take(&mut self.text);
                Some((Ok(CapabilityEvent::Output(Value::String(text))), self))
            }
        }
    }
}

impl Capability for TextStreamCapability {
    fn name(&self) -> &str {
        "text_stream"
    }
    fn description(&self) -> &str {
        "Stream the words of 'text' as partial chunks; the output is the full text."
    }
    fn streaming(&self) -> bool {
        true
    }
    fn invoke(&self, invocation: Invocation) -> BoxStream<'_, Result<CapabilityEvent>> {
        let p: TextStreamInput = match parse_inputs("text_stream", invocation.inputs) {
            Ok(p) => p,
            Err(e) => return stream::once(async move { Err(e) }).boxed(),
        };
        let progress = Progress {
            words: p.text.split_whitespace().map(str::to_string).collect(),
            text: p.text,
            delay: Duration::from_millis(p.delay_ms),
            cancel: invocation.cancel,
            emitted: 0,
            done: false,
        };
        stream::unfold(progress, Progress::step).boxed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use braid_test_utils::invocation;
    use serde_json::json;

    #[tokio::test]
    async fn test_streams_words_then_output() {
        let events: Vec<_> = TextStreamCapability
            .invoke(invocation(json!({"text": "one two  three"})))
            .collect()
            .await;
        let events: Vec<CapabilityEvent> = events.into_iter().map(|e| e.unwrap()).collect();
        assert_eq!(
            events,
            vec![
                CapabilityEvent::Partial(json!("one")),
                CapabilityEvent::Partial(json!("two")),
                CapabilityEvent::Partial(json!("three")),
                CapabilityEvent::Output(json!("one two  three")),
            ]
        );
    }

    #[tokio::test]
    async fn test_empty_text_outputs_immediately() {
        let events: Vec<_> = TextStreamCapability
            .invoke(invocation(json!({"text": ""})))
            .collect()
            .await;
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].as_ref().unwrap(), &CapabilityEvent::Output(json!("")));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_between_chunks() {
        let inv = invocation(json!({"text": "a b c", "delay_ms": 1000}));
        inv.cancel.cancel();
        let events: Vec<_> = TextStreamCapability.invoke(inv).collect().await;
        assert_eq!(events.len(), 2);
        assert!(matches!(events[0], Ok(CapabilityEvent::Partial(_))));
        assert!(matches!(events[1], Err(BraidError::Cancelled)));
    }

    #[tokio::test]
    async fn test_bad_input() {
        let events: Vec<_> = TextStreamCapability
            .invoke(invocation(json!({"words": 1})))
            .collect()
            .await;
        assert_eq!(events.len(), 1);
        assert!(events[0].is_err());
    }
}

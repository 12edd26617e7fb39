//! Executor core: drives one run from its entry block to a terminal status.
//!
//! The driver loop owns every state change that depends on the graph
//! (skips, inline control blocks, edge latching, loop resets). Capability
//! blocks run as tokio tasks under the run's semaphore and report back a
//! single outcome after their retries are exhausted.

use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use futures::future::BoxFuture;
use futures::stream::FuturesUnordered;
use futures::{FutureExt, StreamExt};
use serde_json::{json, Map, Value};
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use braid_capabilities::CapabilityRegistry;
use braid_core::config::RunConfig;
use braid_core::error::{BraidError, Result};
use braid_core::event::EventKind;
use braid_core::traits::Capability;
use braid_core::types::{BlockError, BlockStatus, CapabilityEvent, Invocation, RunStatus};

use crate::context::{ContextState, ExecutionContext, LoopFrame};
use crate::emitter::{EventDraft, EventEmitter};
use crate::expr::resolve_inputs;
use crate::graph::{BlockMode, FailureMode, ValidatedGraph};
use crate::ledger::RunLedger;
use crate::scheduler::{self, halts_run};

type InFlight = FuturesUnordered<BoxFuture<'static, (usize, Result<Value>)>>;

/// Bookkeeping local to the driver loop.
struct Progress {
    in_flight: InFlight,
    /// Blocks handed to a task and not yet settled.
    dispatched: HashSet<usize>,
    semaphore: Arc<Semaphore>,
    /// First fatal error; set once the run is halting.
    halt: Option<BlockError>,
}

/// Runs one validated graph against one execution context.
pub struct Executor {
    graph: Arc<ValidatedGraph>,
    registry: Arc<CapabilityRegistry>,
    ctx: Arc<ExecutionContext>,
    emitter: EventEmitter,
    config: RunConfig,
    /// Child of the run's cancel token. Cancelled on halt as well as on run
    /// cancellation; every invocation token derives from it.
    work: CancellationToken,
}

impl Executor {
    pub fn new(
        graph: Arc<ValidatedGraph>,
        registry: Arc<CapabilityRegistry>,
        ctx: Arc<ExecutionContext>,
        emitter: EventEmitter,
        config: RunConfig,
    ) -> Self {
        let work = ctx.cancel_token().child_token();
        Self {
            graph,
            registry,
            ctx,
            emitter,
            config,
            work,
        }
    }

    /// Execute the run to completion and return its final ledger. Closes the
    /// emitter after the terminal run event.
    pub async fn run(self) -> RunLedger {
        let started = Utc::now();
        self.ctx.write(|s| s.start_run(started));
        let block_ids: Vec<&str> = self.graph.blocks().iter().map(|b| b.id.as_str()).collect();
        info!(
            run_id = %self.ctx.run_id(),
            graph_id = %self.graph.id(),
            caller = %self.ctx.caller(),
            blocks = block_ids.len(),
            "Run started"
        );
        let input = self.ctx.read(|s| s.input().clone());
        self.emitter
            .emit(EventDraft::run(
                EventKind::RunStarted,
                json!({
                    "graph_id": self.graph.id(),
                    "input": input,
                    "caller": self.ctx.caller(),
                    "blocks": block_ids,
                }),
                started,
            ))
            .await;

        let mut progress = Progress {
            in_flight: FuturesUnordered::new(),
            dispatched: HashSet::new(),
            semaphore: Arc::new(Semaphore::new(self.config.max_concurrent_blocks.max(1))),
            halt: None,
        };

        loop {
            self.advance(&mut progress).await;
            match progress.in_flight.next().await {
                Some((idx, result)) => {
                    progress.dispatched.remove(&idx);
                    match result {
                        Ok(output) => self.succeed(idx, output).await,
                        Err(e) => self.fail(idx, e, &mut progress).await,
                    }
                }
                None => break,
            }
        }

        self.finish(progress).await
    }

    /// Plan repeatedly, skipping and resolving inline blocks until the ready
    /// set only holds dispatched work.
    async fn advance(&self, progress: &mut Progress) {
        loop {
            if self.work.is_cancelled() {
                return;
            }
            let plan = self.ctx.read(|s| scheduler::plan(&self.graph, s));
            let mut changed = false;

            for id in &plan.skip {
                if let Some(idx) = self.graph.index_of(id) {
                    self.skip(idx, "unsatisfied dependencies").await;
                    changed = true;
                }
            }

            for id in &plan.ready {
                if self.work.is_cancelled() {
                    return;
                }
                let Some(idx) = self.graph.index_of(id) else {
                    continue;
                };
                if progress.dispatched.contains(&idx) {
                    continue;
                }
                if self.graph.block_at(idx).is_inline() {
                    self.resolve_inline(idx, progress).await;
                    changed = true;
                } else {
                    self.dispatch(idx, progress);
                }
            }

            if !changed {
                return;
            }
        }
    }

    fn dispatch(&self, idx: usize, progress: &mut Progress) {
        progress.dispatched.insert(idx);
        let block = self.graph.block_at(idx);
        let capability = block.capability.clone().unwrap_or_default();
        debug!(run_id = %self.ctx.run_id(), block_id = %block.id, %capability, "Dispatching block");

        let task = BlockTask {
            graph: self.graph.clone(),
            idx,
            registry: self.registry.clone(),
            ctx: self.ctx.clone(),
            emitter: self.emitter.clone(),
            semaphore: progress.semaphore.clone(),
            work: self.work.clone(),
            default_timeout: self.config.default_block_timeout(),
            cancel_grace: self.config.cancel_grace(),
        };
        let handle = tokio::spawn(task.run());
        progress.in_flight.push(
            async move {
                let result = match handle.await {
                    Ok(result) => result,
                    Err(e) => Err(BraidError::Handler {
                        capability,
                        message: format!("block task aborted: {e}"),
                    }),
                };
                (idx, result)
            }
            .boxed(),
        );
    }

    async fn skip(&self, idx: usize, reason: &str) {
        let block = self.graph.block_at(idx);
        let now = Utc::now();
        let result = self.ctx.write(|s| -> Result<()> {
            s.skip(&block.id, now)?;
            if let BlockMode::LoopEnd { start } = &block.mode {
                s.pop_frame(start);
            }
            let latched = scheduler::resolve_outgoing(&self.graph, idx, BlockStatus::Skipped, s);
            s.latch(latched);
            Ok(())
        });
        if let Err(e) = result {
            error!(block_id = %block.id, error = %e, "Failed to skip block");
            return;
        }
        debug!(run_id = %self.ctx.run_id(), block_id = %block.id, reason, "Block skipped");
        self.emitter
            .emit(EventDraft::block(
                &block.id,
                EventKind::Skipped,
                json!({ "reason": reason }),
                now,
            ))
            .await;
    }

    /// Control and pass-through blocks complete without a task.
    async fn resolve_inline(&self, idx: usize, progress: &mut Progress) {
        let block = self.graph.block_at(idx);
        let now = Utc::now();
        let attempt = match self.ctx.write(|s| s.begin_attempt(&block.id, now)) {
            Ok(attempt) => attempt,
            Err(e) => {
                error!(block_id = %block.id, error = %e, "Failed to start inline block");
                return;
            }
        };
        self.emitter
            .emit(EventDraft::block(
                &block.id,
                EventKind::Started,
                json!({ "attempt": attempt, "mode": block.mode.as_str() }),
                now,
            ))
            .await;

        match &block.mode {
            BlockMode::LoopStart { .. } => {
                let cap = self
                    .graph
                    .loop_starting_at(&block.id)
                    .and_then(|r| r.max_iterations)
                    .map_or(self.config.max_loop_iterations, |m| {
                        m.min(self.config.max_loop_iterations)
                    });
                if cap == 0 {
                    let err = BraidError::LoopIterationLimitExceeded {
                        loop_start: block.id.clone(),
                        max: 0,
                    };
                    error!(run_id = %self.ctx.run_id(), loop_start = %block.id, "Loop cap is zero, not entering");
                    let error = BlockError::from(&err);
                    self.record_failure(idx, error.clone(), None).await;
                    self.halt(error, progress);
                    return;
                }
                let end = self
                    .graph
                    .loop_starting_at(&block.id)
                    .map(|r| r.end.clone())
                    .unwrap_or_default();
                self.ctx.write(|s| {
                    s.push_frame(LoopFrame {
                        start: block.id.clone(),
                        end,
                        index: 0,
                        results: Vec::new(),
                        cap,
                    })
                });
                self.succeed(idx, json!({ "index": 0 })).await;
            }
            BlockMode::LoopEnd { start } => self.close_iteration(idx, start, progress).await,
            _ => {
                let output = self.ctx.read(|s| pass_through(&self.graph, idx, s));
                self.succeed(idx, output).await;
            }
        }
    }

    /// A loop-end was reached: record the iteration, then either reset the
    /// body for another pass or exit the region.
    async fn close_iteration(&self, idx: usize, start: &str, progress: &mut Progress) {
        let Some(region) = self.graph.loop_ending_at(&self.graph.block_at(idx).id) else {
            return;
        };
        let block = self.graph.block_at(idx);

        let decision = self.ctx.write(|s| -> Result<Option<LoopFrame>> {
            let snapshot: Map<String, Value> = region
                .body
                .iter()
                .filter(|id| **id != region.end)
                .filter_map(|id| s.output(id).map(|o| (id.clone(), o.clone())))
                .collect();
            let again = region.condition().evaluate(&s.scope_for(&region.end));
            let frame = s.frame_mut(start).ok_or_else(|| BraidError::InvalidTransition {
                block: block.id.clone(),
                from: "no active loop frame".into(),
                to: "loop-end".into(),
            })?;
            frame.results.push(Value::Object(snapshot));
            if !again {
                return Ok(s.pop_frame(start));
            }
            if frame.index + 1 >= frame.cap {
                return Err(BraidError::LoopIterationLimitExceeded {
                    loop_start: start.to_string(),
                    max: frame.cap,
                });
            }
            frame.index += 1;
            Ok(None)
        });

        match decision {
            Ok(Some(frame)) => {
                let iterations = frame.index + 1;
                debug!(run_id = %self.ctx.run_id(), loop_start = start, iterations, "Loop exited");
                let output = json!({ "iterations": iterations, "results": frame.results });
                self.succeed_with(
                    idx,
                    output,
                    Some(json!({ "start": start, "iteration": iterations, "continue": false })),
                    true,
                )
                .await;
            }
            Ok(None) => {
                let iteration = self
                    .ctx
                    .read(|s| s.frame(start).map(|f| f.index).unwrap_or_default());
                debug!(run_id = %self.ctx.run_id(), loop_start = start, iteration, "Loop continues");
                let reset = region.body.clone();
                let info = json!({
                    "start": start,
                    "iteration": iteration,
                    "continue": true,
                    "reset": reset,
                });
                self.succeed_with(idx, json!({ "iteration": iteration, "continue": true }), Some(info), false)
                    .await;
                self.ctx.write(|s| s.reset_blocks(&self.graph, &reset));
            }
            Err(e) => {
                error!(run_id = %self.ctx.run_id(), loop_start = start, error = %e, "Loop aborted");
                let error = BlockError::from(&e);
                self.record_failure(idx, error.clone(), None).await;
                self.halt(error, progress);
            }
        }
    }

    async fn succeed(&self, idx: usize, output: Value) {
        self.succeed_with(idx, output, None, true).await;
    }

    /// Mark a block succeeded, optionally latching its outgoing edges, and
    /// emit the event. `loop_info` is attached for loop-ends.
    async fn succeed_with(&self, idx: usize, output: Value, loop_info: Option<Value>, latch: bool) {
        let block = self.graph.block_at(idx);
        let now = Utc::now();
        let written = self.ctx.write(|s| -> Result<(BTreeMap<String, Value>, u32)> {
            let bindings = s.succeed(&block.id, output.clone(), &block.output_keys, now)?;
            if latch {
                let latched =
                    scheduler::resolve_outgoing(&self.graph, idx, BlockStatus::Succeeded, s);
                s.latch(latched);
            }
            Ok((bindings, attempts_of(s, &block.id)))
        });
        let (bindings, attempts) = match written {
            Ok(w) => w,
            Err(e) => {
                error!(block_id = %block.id, error = %e, "Failed to record block success");
                return;
            }
        };
        debug!(run_id = %self.ctx.run_id(), block_id = %block.id, attempts, "Block succeeded");

        let mut payload = json!({
            "output": output,
            "bindings": bindings,
            "attempts": attempts,
        });
        if let Some(info) = loop_info {
            payload["loop"] = info;
        }
        self.emitter
            .emit(EventDraft::block(&block.id, EventKind::Succeeded, payload, now))
            .await;
    }

    /// Settle a block whose task returned an error.
    async fn fail(&self, idx: usize, err: BraidError, progress: &mut Progress) {
        let block = self.graph.block_at(idx);
        let error = BlockError::from(&err);
        let cancelled = matches!(err, BraidError::Cancelled);
        if cancelled && self.ctx.status(&block.id) == BlockStatus::Pending {
            // Never got a slot; `finish` resolves it with the run.
            return;
        }
        let default_output = match &block.on_failure {
            FailureMode::ContinueWithDefaultOutput { default } if !cancelled => Some(default.clone()),
            _ => None,
        };
        self.record_failure(idx, error.clone(), default_output).await;

        if cancelled {
            debug!(run_id = %self.ctx.run_id(), block_id = %block.id, "Block cancelled");
        } else if halts_run(&self.graph, idx) {
            error!(run_id = %self.ctx.run_id(), block_id = %block.id, error = %err, "Block failed, halting run");
            self.halt(error, progress);
        } else {
            error!(run_id = %self.ctx.run_id(), block_id = %block.id, error = %err, "Block failed");
        }
    }

    async fn record_failure(&self, idx: usize, error: BlockError, default_output: Option<Value>) {
        let block = self.graph.block_at(idx);
        let now = Utc::now();
        let written = self.ctx.write(|s| -> Result<(BTreeMap<String, Value>, u32)> {
            let bindings = s.fail(
                &block.id,
                error.clone(),
                default_output.clone(),
                &block.output_keys,
                now,
            )?;
            let latched = scheduler::resolve_outgoing(&self.graph, idx, BlockStatus::Failed, s);
            s.latch(latched);
            Ok((bindings, attempts_of(s, &block.id)))
        });
        let (bindings, attempts) = match written {
            Ok(w) => w,
            Err(e) => {
                error!(block_id = %block.id, error = %e, "Failed to record block failure");
                return;
            }
        };

        let mut payload = json!({
            "error": error,
            "attempts": attempts,
            "bindings": bindings,
        });
        if let Some(output) = default_output {
            payload["output"] = output;
        }
        self.emitter
            .emit(EventDraft::block(&block.id, EventKind::Failed, payload, now))
            .await;
    }

    fn halt(&self, error: BlockError, progress: &mut Progress) {
        if progress.halt.is_none() {
            progress.halt = Some(error);
        }
        self.work.cancel();
    }

    async fn finish(self, progress: Progress) -> RunLedger {
        let unresolved: Vec<usize> = self.ctx.read(|s| {
            (0..self.graph.len())
                .filter(|&i| !s.status(&self.graph.block_at(i).id).is_terminal())
                .collect()
        });

        let (status, error) = if self.ctx.cancel_token().is_cancelled() {
            for &idx in &unresolved {
                self.record_failure(idx, BlockError::cancelled(), None).await;
            }
            (RunStatus::Cancelled, Some(BlockError::cancelled()))
        } else if let Some(error) = progress.halt {
            for &idx in &unresolved {
                self.skip(idx, "run halted").await;
            }
            (RunStatus::Failed, Some(error))
        } else if !unresolved.is_empty() {
            let ids = unresolved
                .iter()
                .map(|&i| self.graph.block_at(i).id.clone())
                .collect();
            let err = BraidError::Stalled(ids);
            warn!(run_id = %self.ctx.run_id(), error = %err, "Run stalled");
            (RunStatus::Failed, Some(BlockError::from(&err)))
        } else if self.ctx.read(|s| s.blocks_with(BlockStatus::Failed).is_empty()) {
            (RunStatus::Succeeded, None)
        } else {
            (RunStatus::SucceededWithFailures, None)
        };

        let now = Utc::now();
        self.ctx.write(|s| s.finish_run(status, error.clone(), now));
        let partial_failures = self.ctx.read(|s| s.blocks_with(BlockStatus::Failed));
        let kind = match status {
            RunStatus::Cancelled => EventKind::RunCancelled,
            RunStatus::Succeeded | RunStatus::SucceededWithFailures => EventKind::RunSucceeded,
            _ => EventKind::RunFailed,
        };
        info!(
            run_id = %self.ctx.run_id(),
            status = %status,
            failed = partial_failures.len(),
            "Run finished"
        );
        self.emitter
            .emit(EventDraft::run(
                kind,
                json!({
                    "status": status,
                    "error": error,
                    "partial_failures": partial_failures,
                }),
                now,
            ))
            .await;
        self.emitter.close();
        self.ctx.ledger()
    }
}

fn attempts_of(state: &ContextState, id: &str) -> u32 {
    state.block(id).map(|b| b.attempts).unwrap_or_default()
}

/// Output of a block with no capability: its resolved inputs, or, when it
/// declares none, its predecessors' outputs keyed by block id.
fn pass_through(graph: &ValidatedGraph, idx: usize, state: &ContextState) -> Value {
    let inputs = graph.inputs(idx);
    if !inputs.is_empty() {
        return resolve_inputs(inputs, &state.scope_for(&graph.block_at(idx).id));
    }
    let outputs: Map<String, Value> = graph
        .predecessors(idx)
        .into_iter()
        .filter_map(|id| state.output(id).map(|o| (id.to_string(), o.clone())))
        .collect();
    Value::Object(outputs)
}

/// One capability block, run as its own task.
struct BlockTask {
    graph: Arc<ValidatedGraph>,
    idx: usize,
    registry: Arc<CapabilityRegistry>,
    ctx: Arc<ExecutionContext>,
    emitter: EventEmitter,
    semaphore: Arc<Semaphore>,
    work: CancellationToken,
    default_timeout: Duration,
    cancel_grace: Duration,
}

enum Interrupted {
    Finished(Result<Value>),
    TimedOut,
    Cancelled,
}

impl BlockTask {
    /// Acquire a concurrency slot, then attempt the block until it succeeds
    /// or its retry policy is exhausted.
    async fn run(self) -> Result<Value> {
        let block = self.graph.block_at(self.idx);
        let _permit = tokio::select! {
            permit = self.semaphore.clone().acquire_owned() => {
                permit.map_err(|_| BraidError::Cancelled)?
            }
            _ = self.work.cancelled() => return Err(BraidError::Cancelled),
        };

        let capability = block.capability.as_deref().unwrap_or_default();
        let timeout = block.timeout().unwrap_or(self.default_timeout);
        loop {
            if self.work.is_cancelled() {
                return Err(BraidError::Cancelled);
            }
            let now = Utc::now();
            let attempt = self.ctx.write(|s| s.begin_attempt(&block.id, now))?;
            debug!(run_id = %self.ctx.run_id(), block_id = %block.id, attempt, "Block started");
            self.emitter
                .emit(EventDraft::block(
                    &block.id,
                    EventKind::Started,
                    json!({ "attempt": attempt, "capability": capability }),
                    now,
                ))
                .await;

            let err = match self.attempt(capability, attempt, timeout).await {
                Ok(output) => return Ok(output),
                Err(e) => e,
            };
            if !err.is_retryable() || attempt >= block.retry.max_attempts() {
                return Err(err);
            }
            let delay = block.retry.backoff(attempt);
            warn!(
                run_id = %self.ctx.run_id(),
                block_id = %block.id,
                attempt,
                delay_ms = delay.as_millis() as u64,
                error = %err,
                "Block attempt failed, retrying"
            );
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = self.work.cancelled() => return Err(BraidError::Cancelled),
            }
        }
    }

    async fn attempt(&self, name: &str, attempt: u32, timeout: Duration) -> Result<Value> {
        let block = self.graph.block_at(self.idx);
        let capability = self.registry.resolve(name)?;
        let inputs = self
            .ctx
            .read(|s| resolve_inputs(self.graph.inputs(self.idx), &s.scope_for(&block.id)));
        let token = self.work.child_token();
        let invocation = Invocation::new(
            self.ctx.run_id().clone(),
            block.id.clone(),
            attempt,
            inputs,
            tokio::time::Instant::now() + timeout,
            token.clone(),
            self.ctx.caller().clone(),
        );
        let invocation_id = invocation.id.clone();

        let drive = self.drive(&capability, invocation);
        tokio::pin!(drive);
        let interrupted = tokio::select! {
            result = tokio::time::timeout(timeout, &mut drive) => match result {
                Ok(result) => Interrupted::Finished(result),
                Err(_) => Interrupted::TimedOut,
            },
            _ = self.work.cancelled() => Interrupted::Cancelled,
        };

        match interrupted {
            Interrupted::Finished(result) => result,
            Interrupted::TimedOut => {
                token.cancel();
                Err(BraidError::Timeout {
                    capability: name.to_string(),
                    timeout_ms: timeout.as_millis() as u64,
                })
            }
            Interrupted::Cancelled => {
                capability.cancel(&invocation_id).await;
                if tokio::time::timeout(self.cancel_grace, &mut drive).await.is_err() {
                    warn!(
                        run_id = %self.ctx.run_id(),
                        block_id = %block.id,
                        grace_ms = self.cancel_grace.as_millis() as u64,
                        "Handler ignored cancellation, abandoning it"
                    );
                }
                Err(BraidError::Cancelled)
            }
        }
    }

    /// Consume the invocation stream, forwarding partial chunks.
    async fn drive(&self, capability: &Arc<dyn Capability>, invocation: Invocation) -> Result<Value> {
        let block_id = invocation.block_id.clone();
        let attempt = invocation.attempt;
        let mut stream = capability.invoke(invocation);
        while let Some(item) = stream.next().await {
            match item? {
                CapabilityEvent::Partial(chunk) => {
                    self.emitter
                        .emit(EventDraft::block(
                            &block_id,
                            EventKind::Streaming,
                            json!({ "attempt": attempt, "chunk": chunk }),
                            Utc::now(),
                        ))
                        .await;
                }
                CapabilityEvent::Output(output) => return Ok(output),
            }
        }
        Err(BraidError::Handler {
            capability: capability.name().to_string(),
            message: "stream ended without an output".into(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::emitter::{channel, deliver};
    use crate::graph::{Block, Edge, Graph, InputExpr};
    use crate::ledger::RunProjection;
    use crate::retry::RetryPolicy;
    use braid_core::types::{CallerIdentity, ErrorKind, RunId};
    use braid_test_utils::{RecordingSink, ScriptedCapability, SlowCapability};

    async fn execute(
        graph: Graph,
        registry: CapabilityRegistry,
        input: Value,
        config: RunConfig,
    ) -> (RunLedger, RecordingSink) {
        let graph = Arc::new(graph.validate().unwrap());
        let ctx = Arc::new(ExecutionContext::new(
            RunId::from_string("run"),
            &graph,
            input,
            CallerIdentity::new("tester"),
            CancellationToken::new(),
        ));
        let (emitter, receiver) = channel(ctx.clone(), config.event_queue_capacity);
        let sink = RecordingSink::new();
        let dispatcher = tokio::spawn(deliver(receiver, Arc::new(sink.clone()), 0));
        let ledger = Executor::new(graph, Arc::new(registry), ctx, emitter, config)
            .run()
            .await;
        dispatcher.await.unwrap();
        (ledger, sink)
    }

    fn registry() -> CapabilityRegistry {
        CapabilityRegistry::with_builtins()
    }

    #[tokio::test]
    async fn test_linear_run() {
        let graph = Graph::new("g", "a")
            .with_block(
                Block::invoking("a", "echo")
                    .with_input("v", InputExpr::reference("input.x"))
                    .with_outputs(vec!["v".into()]),
            )
            .with_block(Block::invoking("b", "echo").with_input("w", InputExpr::reference("vars.v")))
            .with_edge(Edge::always("a", "b"));
        let (ledger, sink) = execute(graph, registry(), json!({"x": 7}), RunConfig::default()).await;

        assert_eq!(ledger.status, RunStatus::Succeeded);
        assert_eq!(ledger.blocks["b"].output, Some(json!({"w": 7})));
        assert_eq!(sink.kinds_for("a"), vec![EventKind::Started, EventKind::Succeeded]);
        let events = sink.events();
        assert_eq!(events.first().unwrap().kind, EventKind::RunStarted);
        assert_eq!(events.last().unwrap().kind, EventKind::RunSucceeded);
        assert_eq!(ledger.last_seq, events.len() as u64);
    }

    #[tokio::test]
    async fn test_missing_capability_fails_block() {
        let graph = Graph::new("g", "a").with_block(
            Block::invoking("a", "nope").with_retry(RetryPolicy::new(3)),
        );
        let (ledger, sink) = execute(graph, registry(), json!({}), RunConfig::default()).await;
        assert_eq!(ledger.status, RunStatus::Failed);
        let a = &ledger.blocks["a"];
        assert_eq!(a.error.as_ref().unwrap().kind, ErrorKind::CapabilityResolution);
        assert_eq!(a.attempts, 1);
        assert_eq!(sink.count(EventKind::Started), 1);
    }

    #[tokio::test]
    async fn test_pass_through_join_output() {
        let graph = Graph::new("g", "a")
            .with_block(Block::invoking("a", "echo").with_input("n", InputExpr::literal(1)))
            .with_block(Block::invoking("b", "echo").with_input("n", InputExpr::literal(2)))
            .with_block(Block::new("root"))
            .with_block(Block::new("j"))
            .with_edge(Edge::always("root", "a"))
            .with_edge(Edge::always("root", "b"))
            .with_edge(Edge::always("a", "j"))
            .with_edge(Edge::always("b", "j"));
        let graph = Graph { entry: "root".into(), ..graph };
        let (ledger, _) = execute(graph, registry(), json!({}), RunConfig::default()).await;
        assert_eq!(
            ledger.blocks["j"].output,
            Some(json!({"a": {"n": 1}, "b": {"n": 2}}))
        );
    }

    #[tokio::test]
    async fn test_loop_results_accumulate() {
        let graph = Graph::new("g", "l")
            .with_block(Block::loop_start("l", "vars.n < 2"))
            .with_block(
                Block::invoking("inc", "math")
                    .with_input("op", InputExpr::literal("add"))
                    .with_input("a", InputExpr::reference("vars.n"))
                    .with_input("b", InputExpr::literal(1))
                    .with_outputs(vec!["n".into()]),
            )
            .with_block(Block::loop_end("e", "l"))
            .with_edge(Edge::always("l", "inc"))
            .with_edge(Edge::always("inc", "e"))
            .with_edge(Edge::always("e", "l"));
        let (ledger, _) = execute(graph, registry(), json!({"n": 0}), RunConfig::default()).await;
        assert_eq!(ledger.status, RunStatus::Succeeded);
        assert_eq!(
            ledger.blocks["e"].output,
            Some(json!({"iterations": 2, "results": [{"inc": 1}, {"inc": 2}]}))
        );
    }

    #[tokio::test]
    async fn test_projection_matches_ledger() {
        let mut reg = registry();
        reg.register(ScriptedCapability::new("flaky").failing(1));
        let graph = Graph::new("g", "a")
            .with_block(Block::invoking("a", "flaky").with_retry(
                RetryPolicy::new(1).with_backoff(Duration::from_millis(1), Duration::from_millis(1)),
            ))
            .with_block(Block::invoking("b", "echo"))
            .with_block(Block::invoking("c", "echo"))
            .with_edge(Edge::always("a", "b"))
            .with_edge(Edge::on_failure("a", "c"));
        let (ledger, sink) = execute(graph, reg, json!({"k": 1}), RunConfig::default()).await;
        let projection = RunProjection::replay(ledger.run_id.clone(), &sink.events());
        assert_eq!(projection.ledger(), &ledger);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancellation_grace_abandons_handler() {
        let slow = SlowCapability::new("stubborn", Duration::from_secs(600)).ignoring_cancel();
        let mut reg = registry();
        reg.register(slow.clone());
        let graph = Arc::new(
            Graph::new("g", "a")
                .with_block(Block::invoking("a", "stubborn"))
                .validate()
                .unwrap(),
        );
        let cancel = CancellationToken::new();
        let ctx = Arc::new(ExecutionContext::new(
            RunId::from_string("run"),
            &graph,
            json!({}),
            CallerIdentity::anonymous(),
            cancel.clone(),
        ));
        let (emitter, receiver) = channel(ctx.clone(), 16);
        let sink = RecordingSink::new();
        let dispatcher = tokio::spawn(deliver(receiver, Arc::new(sink.clone()), 0));
        let config = RunConfig::default().with_cancel_grace(Duration::from_millis(50));
        let run = tokio::spawn(Executor::new(graph, Arc::new(reg), ctx, emitter, config).run());

        tokio::time::sleep(Duration::from_millis(10)).await;
        cancel.cancel();
        let ledger = run.await.unwrap();
        dispatcher.await.unwrap();

        assert_eq!(ledger.status, RunStatus::Cancelled);
        assert_eq!(ledger.blocks["a"].error.as_ref().unwrap().kind, ErrorKind::Cancelled);
        assert_eq!(slow.cancel_requests(), 1);
        assert_eq!(sink.count(EventKind::RunCancelled), 1);
    }
}

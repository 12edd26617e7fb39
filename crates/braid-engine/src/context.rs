use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;

use braid_core::error::{BraidError, Result};
use braid_core::types::{BlockError, BlockId, BlockStatus, CallerIdentity, RunId, RunStatus};

use crate::expr::Scope;
use crate::graph::ValidatedGraph;
use crate::ledger::{BlockRecord, RunLedger};

/// Mutable per-block state within a run.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BlockState {
    pub status: BlockStatus,
    pub output: Option<Value>,
    pub error: Option<BlockError>,
    pub attempts: u32,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl BlockState {
    fn view(&self) -> Value {
        json!({
            "status": self.status,
            "output": self.output,
            "error": self.error,
            "attempts": self.attempts,
        })
    }

    fn record(&self) -> BlockRecord {
        BlockRecord {
            status: self.status,
            output: self.output.clone(),
            error: self.error.clone(),
            attempts: self.attempts,
            started_at: self.started_at,
            finished_at: self.finished_at,
        }
    }
}

/// Latched outcome of an edge, fixed when its source became terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EdgeState {
    Satisfied,
    Dead,
}

/// One active iteration of a loop region.
#[derive(Debug, Clone, PartialEq)]
pub struct LoopFrame {
    pub start: BlockId,
    pub end: BlockId,
    /// Zero-based index of the current iteration.
    pub index: u32,
    /// Body outputs of each completed iteration.
    pub results: Vec<Value>,
    /// Effective iteration cap.
    pub cap: u32,
}

impl LoopFrame {
    fn view(&self) -> Value {
        json!({
            "index": self.index,
            "iteration": self.index + 1,
            "results": self.results,
        })
    }
}

/// Everything a run knows. Only reachable through `ExecutionContext`'s lock.
#[derive(Debug)]
pub struct ContextState {
    blocks: HashMap<BlockId, BlockState>,
    variables: BTreeMap<String, Value>,
    input: Value,
    /// Active loop frames keyed by loop-start id.
    frames: HashMap<BlockId, LoopFrame>,
    /// For each block, the loop-starts of the regions enclosing it,
    /// innermost first. A loop-start counts as inside its own region.
    enclosing: HashMap<BlockId, Vec<BlockId>>,
    edges: HashMap<usize, EdgeState>,
    run_status: RunStatus,
    run_error: Option<BlockError>,
    started_at: Option<DateTime<Utc>>,
    finished_at: Option<DateTime<Utc>>,
}

/// The context as seen from one block: `loop.*` resolves to the innermost
/// active loop enclosing that block.
pub struct BlockScope<'a> {
    state: &'a ContextState,
    block: &'a str,
}

impl Scope for BlockScope<'_> {
    fn variable(&self, name: &str) -> Option<&Value> {
        self.state.variables.get(name)
    }

    fn variables(&self) -> Value {
        json!(self.state.variables)
    }

    fn input(&self) -> &Value {
        &self.state.input
    }

    fn loop_frame(&self) -> Option<Value> {
        self.state.enclosing_frame(self.block).map(LoopFrame::view)
    }

    fn block_view(&self, id: &str) -> Option<Value> {
        self.state.blocks.get(id).map(BlockState::view)
    }
}

/// Loop-starts enclosing each block, innermost first. Nested regions have
/// strictly smaller bodies than the regions around them.
fn enclosing_loops(graph: &ValidatedGraph) -> HashMap<BlockId, Vec<BlockId>> {
    let mut regions: Vec<_> = graph.loops().iter().collect();
    regions.sort_by_key(|r| r.body.len());
    let mut enclosing: HashMap<BlockId, Vec<BlockId>> = HashMap::new();
    for region in regions {
        for id in region.body.iter().chain(std::iter::once(&region.start)) {
            enclosing
                .entry(id.clone())
                .or_default()
                .push(region.start.clone());
        }
    }
    enclosing
}

/// Copy a block's output into run variables: fields of an object output by
/// key, otherwise the whole output under every key.
pub fn bind_outputs(keys: &[String], output: &Value) -> BTreeMap<String, Value> {
    let mut bindings = BTreeMap::new();
    if keys.is_empty() {
        return bindings;
    }
    if let Some(obj) = output.as_object() {
        for key in keys {
            if let Some(val) = obj.get(key) {
                bindings.insert(key.clone(), val.clone());
            }
        }
        return bindings;
    }
    for key in keys {
        bindings.insert(key.clone(), output.clone());
    }
    bindings
}

impl ContextState {
    pub fn block(&self, id: &str) -> Option<&BlockState> {
        self.blocks.get(id)
    }

    pub fn status(&self, id: &str) -> BlockStatus {
        self.blocks.get(id).map(|b| b.status).unwrap_or_default()
    }

    pub fn output(&self, id: &str) -> Option<&Value> {
        self.blocks.get(id).and_then(|b| b.output.as_ref())
    }

    pub fn edge(&self, edge_idx: usize) -> Option<EdgeState> {
        self.edges.get(&edge_idx).copied()
    }

    pub fn variables_map(&self) -> &BTreeMap<String, Value> {
        &self.variables
    }

    pub fn input(&self) -> &Value {
        &self.input
    }

    pub fn block_view(&self, id: &str) -> Option<Value> {
        self.blocks.get(id).map(BlockState::view)
    }

    pub fn frames(&self) -> &HashMap<BlockId, LoopFrame> {
        &self.frames
    }

    pub fn frame(&self, start: &str) -> Option<&LoopFrame> {
        self.frames.get(start)
    }

    /// The innermost active frame of a loop enclosing `block`.
    pub fn enclosing_frame(&self, block: &str) -> Option<&LoopFrame> {
        self.enclosing
            .get(block)?
            .iter()
            .find_map(|start| self.frames.get(start))
    }

    /// Evaluate expressions on behalf of `block`.
    pub fn scope_for<'a>(&'a self, block: &'a str) -> BlockScope<'a> {
        BlockScope { state: self, block }
    }

    pub fn run_status(&self) -> RunStatus {
        self.run_status
    }

    /// Ids of blocks with the given status, sorted.
    pub fn blocks_with(&self, status: BlockStatus) -> Vec<BlockId> {
        let mut ids: Vec<BlockId> = self
            .blocks
            .iter()
            .filter(|(_, b)| b.status == status)
            .map(|(id, _)| id.clone())
            .collect();
        ids.sort();
        ids
    }

    fn transition(&mut self, id: &str, next: BlockStatus) -> Result<&mut BlockState> {
        let state = self
            .blocks
            .get_mut(id)
            .ok_or_else(|| BraidError::InvalidTransition {
                block: id.to_string(),
                from: "unknown".into(),
                to: next.to_string(),
            })?;
        if !state.status.can_transition_to(next) {
            return Err(BraidError::InvalidTransition {
                block: id.to_string(),
                from: state.status.to_string(),
                to: next.to_string(),
            });
        }
        state.status = next;
        Ok(state)
    }

    /// Move a block to `running` for a new attempt. Returns the attempt number.
    pub fn begin_attempt(&mut self, id: &str, now: DateTime<Utc>) -> Result<u32> {
        let state = self.transition(id, BlockStatus::Running)?;
        state.attempts += 1;
        state.started_at.get_or_insert(now);
        Ok(state.attempts)
    }

    /// Record success. Output and bindings land in the same write as the
    /// status change. Returns the bindings written.
    pub fn succeed(
        &mut self,
        id: &str,
        output: Value,
        output_keys: &[String],
        now: DateTime<Utc>,
    ) -> Result<BTreeMap<String, Value>> {
        let bindings = bind_outputs(output_keys, &output);
        let state = self.transition(id, BlockStatus::Succeeded)?;
        state.output = Some(output);
        state.finished_at = Some(now);
        self.variables.extend(bindings.clone());
        Ok(bindings)
    }

    /// Record failure. A default output (from `continue-with-default-output`)
    /// is stored and bound like a successful one.
    pub fn fail(
        &mut self,
        id: &str,
        error: BlockError,
        default_output: Option<Value>,
        output_keys: &[String],
        now: DateTime<Utc>,
    ) -> Result<BTreeMap<String, Value>> {
        let bindings = default_output
            .as_ref()
            .map(|o| bind_outputs(output_keys, o))
            .unwrap_or_default();
        let state = self.transition(id, BlockStatus::Failed)?;
        state.error = Some(error);
        state.output = default_output;
        state.finished_at = Some(now);
        self.variables.extend(bindings.clone());
        Ok(bindings)
    }

    pub fn skip(&mut self, id: &str, now: DateTime<Utc>) -> Result<()> {
        let state = self.transition(id, BlockStatus::Skipped)?;
        state.finished_at = Some(now);
        Ok(())
    }

    pub fn latch(&mut self, edges: impl IntoIterator<Item = (usize, EdgeState)>) {
        self.edges.extend(edges);
    }

    /// Enter a loop region. Replaces any stale frame of the same loop.
    pub fn push_frame(&mut self, frame: LoopFrame) {
        self.frames.insert(frame.start.clone(), frame);
    }

    pub fn frame_mut(&mut self, start: &str) -> Option<&mut LoopFrame> {
        self.frames.get_mut(start)
    }

    pub fn pop_frame(&mut self, start: &str) -> Option<LoopFrame> {
        self.frames.remove(start)
    }

    /// Return loop body blocks to `pending` for another iteration: clear their
    /// state, the edges they latched, and frames of loops nested in the body.
    /// This is the only way a terminal block leaves its terminal status.
    pub fn reset_blocks(&mut self, graph: &ValidatedGraph, ids: &[BlockId]) {
        for id in ids {
            if let Some(state) = self.blocks.get_mut(id) {
                *state = BlockState::default();
            }
            if let Some(idx) = graph.index_of(id) {
                for edge in graph.outgoing(idx) {
                    self.edges.remove(edge);
                }
            }
        }
        self.frames.retain(|start, _| !ids.contains(start));
    }

    pub fn start_run(&mut self, now: DateTime<Utc>) {
        self.run_status = RunStatus::Running;
        self.started_at = Some(now);
    }

    pub fn finish_run(&mut self, status: RunStatus, error: Option<BlockError>, now: DateTime<Utc>) {
        self.run_status = status;
        self.run_error = error;
        self.finished_at = Some(now);
    }
}

/// Per-run state shared by the executor's tasks.
///
/// Status transitions go through a single write lock and are checked
/// against the legal transition table; reads take the shared lock. The
/// logical clock orders emitted events.
pub struct ExecutionContext {
    run_id: RunId,
    graph_id: String,
    caller: CallerIdentity,
    state: RwLock<ContextState>,
    clock: AtomicU64,
    cancel: CancellationToken,
}

impl ExecutionContext {
    /// Initial context: every block pending, variables seeded from the
    /// fields of an object input.
    pub fn new(
        run_id: RunId,
        graph: &ValidatedGraph,
        input: Value,
        caller: CallerIdentity,
        cancel: CancellationToken,
    ) -> Self {
        let blocks = graph
            .blocks()
            .iter()
            .map(|b| (b.id.clone(), BlockState::default()))
            .collect();
        let variables = input
            .as_object()
            .map(|o| o.iter().map(|(k, v)| (k.clone(), v.clone())).collect())
            .unwrap_or_default();
        Self {
            run_id,
            graph_id: graph.id().to_string(),
            caller,
            state: RwLock::new(ContextState {
                blocks,
                variables,
                input,
                frames: HashMap::new(),
                enclosing: enclosing_loops(graph),
                edges: HashMap::new(),
                run_status: RunStatus::Created,
                run_error: None,
                started_at: None,
                finished_at: None,
            }),
            clock: AtomicU64::new(0),
            cancel,
        }
    }

    pub fn run_id(&self) -> &RunId {
        &self.run_id
    }

    pub fn graph_id(&self) -> &str {
        &self.graph_id
    }

    pub fn caller(&self) -> &CallerIdentity {
        &self.caller
    }

    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Advance the logical clock and return the new value.
    pub fn tick(&self) -> u64 {
        self.clock.fetch_add(1, Ordering::SeqCst) + 1
    }

    pub fn clock(&self) -> u64 {
        self.clock.load(Ordering::SeqCst)
    }

    pub fn read<R>(&self, f: impl FnOnce(&ContextState) -> R) -> R {
        f(&self.state.read())
    }

    pub fn write<R>(&self, f: impl FnOnce(&mut ContextState) -> R) -> R {
        f(&mut self.state.write())
    }

    pub fn status(&self, id: &str) -> BlockStatus {
        self.read(|s| s.status(id))
    }

    pub fn output(&self, id: &str) -> Option<Value> {
        self.read(|s| s.output(id).cloned())
    }

    pub fn variable(&self, name: &str) -> Option<Value> {
        self.read(|s| s.variables.get(name).cloned())
    }

    pub fn run_status(&self) -> RunStatus {
        self.read(|s| s.run_status)
    }

    /// Snapshot the run as a ledger.
    pub fn ledger(&self) -> RunLedger {
        let state = self.state.read();
        RunLedger {
            run_id: self.run_id.clone(),
            graph_id: self.graph_id.clone(),
            caller: self.caller.clone(),
            status: state.run_status,
            error: state.run_error.clone(),
            input: state.input.clone(),
            variables: state.variables.clone(),
            blocks: state
                .blocks
                .iter()
                .map(|(id, b)| (id.clone(), b.record()))
                .collect(),
            started_at: state.started_at,
            finished_at: state.finished_at,
            last_seq: self.clock(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::{Block, BlockMode, Edge, Graph};
    use braid_core::types::ErrorKind;

    fn graph() -> ValidatedGraph {
        Graph::new("g", "a")
            .with_block(Block::invoking("a", "echo"))
            .with_block(Block::invoking("b", "echo"))
            .with_edge(Edge::always("a", "b"))
            .validate()
            .unwrap()
    }

    fn ctx(input: Value) -> ExecutionContext {
        ExecutionContext::new(
            RunId::from_string("r1"),
            &graph(),
            input,
            CallerIdentity::anonymous(),
            CancellationToken::new(),
        )
    }

    #[test]
    fn test_bind_outputs() {
        let keys = vec!["x".to_string(), "y".to_string()];
        let b = bind_outputs(&keys, &json!({"x": 1, "z": 2}));
        assert_eq!(b.len(), 1);
        assert_eq!(b["x"], json!(1));

        let b = bind_outputs(&keys, &json!("whole"));
        assert_eq!(b["x"], json!("whole"));
        assert_eq!(b["y"], json!("whole"));

        assert!(bind_outputs(&[], &json!(1)).is_empty());
    }

    #[test]
    fn test_input_seeds_variables() {
        let c = ctx(json!({"count": 0, "name": "x"}));
        assert_eq!(c.variable("count"), Some(json!(0)));
        assert_eq!(ctx(json!([1, 2])).variable("count"), None);
    }

    #[test]
    fn test_lifecycle_and_bindings() {
        let c = ctx(json!({}));
        let now = Utc::now();
        c.write(|s| {
            assert_eq!(s.begin_attempt("a", now).unwrap(), 1);
            assert_eq!(s.begin_attempt("a", now).unwrap(), 2);
            let bindings = s
                .succeed("a", json!({"v": 5}), &["v".to_string()], now)
                .unwrap();
            assert_eq!(bindings["v"], json!(5));
        });
        assert_eq!(c.status("a"), BlockStatus::Succeeded);
        assert_eq!(c.output("a"), Some(json!({"v": 5})));
        assert_eq!(c.variable("v"), Some(json!(5)));
        let view = c.read(|s| s.block_view("a")).unwrap();
        assert_eq!(view["attempts"], json!(2));
        assert_eq!(view["status"], json!("succeeded"));
    }

    #[test]
    fn test_illegal_transitions_rejected() {
        let c = ctx(json!({}));
        let now = Utc::now();
        let err = c.write(|s| s.succeed("a", json!(1), &[], now)).unwrap_err();
        assert!(matches!(err, BraidError::InvalidTransition { .. }));

        c.write(|s| s.skip("b", now)).unwrap();
        assert!(c.write(|s| s.begin_attempt("b", now)).is_err());
        assert!(c.write(|s| s.skip("ghost", now)).is_err());
    }

    #[test]
    fn test_fail_with_default_output() {
        let c = ctx(json!({}));
        let now = Utc::now();
        c.write(|s| {
            s.begin_attempt("a", now).unwrap();
            s.fail(
                "a",
                BlockError::new(ErrorKind::Handler, "boom"),
                Some(json!({"r": 0})),
                &["r".to_string()],
                now,
            )
            .unwrap();
        });
        assert_eq!(c.status("a"), BlockStatus::Failed);
        assert_eq!(c.variable("r"), Some(json!(0)));
        assert_eq!(c.read(|s| s.block("a").unwrap().error.clone().unwrap().kind), ErrorKind::Handler);
    }

    #[test]
    fn test_reset_clears_state_and_edges() {
        let g = graph();
        let c = ctx(json!({}));
        let now = Utc::now();
        c.write(|s| {
            s.begin_attempt("a", now).unwrap();
            s.succeed("a", json!(1), &[], now).unwrap();
            s.latch([(0, EdgeState::Satisfied)]);
            s.push_frame(LoopFrame {
                start: "a".into(),
                end: "b".into(),
                index: 0,
                results: vec![],
                cap: 3,
            });
            s.reset_blocks(&g, &["a".to_string()]);
        });
        c.read(|s| {
            assert_eq!(s.status("a"), BlockStatus::Pending);
            assert_eq!(s.edge(0), None);
            assert!(s.frames().is_empty());
        });
    }

    #[test]
    fn test_clock_and_ledger() {
        let c = ctx(json!({"k": 1}));
        assert_eq!(c.tick(), 1);
        assert_eq!(c.tick(), 2);
        let ledger = c.ledger();
        assert_eq!(ledger.last_seq, 2);
        assert_eq!(ledger.blocks.len(), 2);
        assert_eq!(ledger.variables["k"], json!(1));
        assert_eq!(ledger.status, RunStatus::Created);
    }

    fn frame(start: &str, end: &str, index: u32) -> LoopFrame {
        LoopFrame {
            start: start.into(),
            end: end.into(),
            index,
            results: vec![],
            cap: 10,
        }
    }

    #[test]
    fn test_frames_keyed_by_loop() {
        let c = ctx(json!({}));
        c.write(|s| {
            s.push_frame(frame("l", "e", 2));
            s.push_frame(frame("m", "f", 0));
            assert!(s.frame_mut("other").is_none());
            s.frame_mut("l").unwrap().index += 1;
            assert_eq!(s.frame("l").unwrap().index, 3);
            assert!(s.pop_frame("other").is_none());
            assert!(s.pop_frame("l").is_some());
            assert_eq!(s.frame("m").unwrap().index, 0);
        });
    }

    #[test]
    fn test_loop_paths_follow_enclosing_region() {
        use crate::expr::Path;

        // Two sibling loops entered together from a fanout.
        let g = Graph::new("g", "root")
            .with_block(Block::new("root").with_mode(BlockMode::ParallelFanout))
            .with_block(Block::loop_start("l1", "true"))
            .with_block(Block::invoking("a", "echo"))
            .with_block(Block::loop_end("e1", "l1"))
            .with_block(Block::loop_start("l2", "true"))
            .with_block(Block::invoking("b", "echo"))
            .with_block(Block::loop_end("e2", "l2"))
            .with_edge(Edge::always("root", "l1"))
            .with_edge(Edge::always("l1", "a"))
            .with_edge(Edge::always("a", "e1"))
            .with_edge(Edge::always("e1", "l1"))
            .with_edge(Edge::always("root", "l2"))
            .with_edge(Edge::always("l2", "b"))
            .with_edge(Edge::always("b", "e2"))
            .with_edge(Edge::always("e2", "l2"))
            .validate()
            .unwrap();
        let c = ExecutionContext::new(
            RunId::from_string("r1"),
            &g,
            json!({}),
            CallerIdentity::anonymous(),
            CancellationToken::new(),
        );
        let index = Path::parse("loop.index").unwrap();
        c.write(|s| {
            s.push_frame(frame("l1", "e1", 4));
            s.push_frame(frame("l2", "e2", 1));
        });
        c.read(|s| {
            assert_eq!(index.resolve(&s.scope_for("a")), Some(json!(4)));
            assert_eq!(index.resolve(&s.scope_for("e1")), Some(json!(4)));
            assert_eq!(index.resolve(&s.scope_for("b")), Some(json!(1)));
            assert_eq!(index.resolve(&s.scope_for("l2")), Some(json!(1)));
            assert_eq!(index.resolve(&s.scope_for("root")), None);
        });
    }
}

//! Ready-set computation.
//!
//! The scheduler is pure: given the validated graph and a read view of the
//! context it decides which pending blocks may run and which must be
//! skipped. Edge outcomes are latched by the executor when a source block
//! becomes terminal (see [`resolve_outgoing`]); planning only reads them.

use braid_core::types::{BlockId, BlockStatus};

use crate::context::{ContextState, EdgeState};
use crate::graph::{BlockMode, EdgeCondition, FailureMode, JoinMode, LoopRegion, ValidatedGraph};

/// Outcome of one planning pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Plan {
    /// Blocks to dispatch now, in topological order.
    pub ready: Vec<BlockId>,
    /// Blocks whose join can no longer be satisfied.
    pub skip: Vec<BlockId>,
}

impl Plan {
    pub fn is_empty(&self) -> bool {
        self.ready.is_empty() && self.skip.is_empty()
    }
}

enum Readiness {
    Waiting,
    Ready,
    Skip,
}

/// Compute the blocks that can run and the blocks to skip.
pub fn plan(graph: &ValidatedGraph, state: &ContextState) -> Plan {
    let mut plan = Plan::default();
    for &idx in graph.topo_order() {
        let block = graph.block_at(idx);
        if state.status(&block.id) != BlockStatus::Pending {
            continue;
        }
        match readiness(graph, state, idx) {
            Readiness::Waiting => {}
            Readiness::Skip => plan.skip.push(block.id.clone()),
            Readiness::Ready => {
                // A loop-end runs only once the rest of its body has settled,
                // so a reset never races a running body block.
                if let Some(region) = graph.loop_ending_at(&block.id) {
                    if !body_settled(region, state) {
                        continue;
                    }
                }
                plan.ready.push(block.id.clone());
            }
        }
    }
    plan
}

fn readiness(graph: &ValidatedGraph, state: &ContextState, idx: usize) -> Readiness {
    let incoming = graph.incoming(idx);
    if incoming.is_empty() {
        return Readiness::Ready;
    }
    let mut satisfied = 0;
    for &edge in incoming {
        match state.edge(edge) {
            None => return Readiness::Waiting,
            Some(EdgeState::Satisfied) => satisfied += 1,
            Some(EdgeState::Dead) => {}
        }
    }
    let run = match graph.block_at(idx).join {
        JoinMode::AllSucceed => satisfied == incoming.len(),
        JoinMode::AnySucceed => satisfied > 0,
        JoinMode::BestEffort => true,
    };
    if run {
        Readiness::Ready
    } else {
        Readiness::Skip
    }
}

fn body_settled(region: &LoopRegion, state: &ContextState) -> bool {
    region
        .body
        .iter()
        .filter(|id| **id != region.end)
        .all(|id| state.status(id).is_terminal())
}

/// Latch the forward outgoing edges of a block that just became terminal.
///
/// `state` must already hold the block's own output and bindings so guards
/// see the values it produced. Guards are evaluated from the block's own
/// position, so `loop.*` refers to the loop around it.
pub fn resolve_outgoing(
    graph: &ValidatedGraph,
    idx: usize,
    status: BlockStatus,
    state: &ContextState,
) -> Vec<(usize, EdgeState)> {
    let block = graph.block_at(idx);
    let scope = state.scope_for(&block.id);
    let as_success = match status {
        BlockStatus::Succeeded => true,
        BlockStatus::Failed => matches!(
            block.on_failure,
            FailureMode::ContinueWithDefaultOutput { .. }
        ),
        _ => false,
    };
    let exclusive = matches!(block.mode, BlockMode::Condition) && as_success;
    let mut routed = false;

    graph
        .outgoing(idx)
        .iter()
        .map(|&e| {
            let edge = graph.edge(e);
            let mut satisfied = match (&edge.condition, status) {
                (_, BlockStatus::Skipped) => edge.on_skip,
                (EdgeCondition::OnFailure, s) => s == BlockStatus::Failed,
                _ if !as_success => false,
                (EdgeCondition::Always, _) => true,
                (EdgeCondition::Conditional { .. }, _) => {
                    graph.guard(e).is_some_and(|g| g.evaluate(&scope))
                }
            };
            if exclusive && satisfied && edge.condition != EdgeCondition::OnFailure {
                satisfied = !routed;
                routed = true;
            }
            let state = if satisfied {
                EdgeState::Satisfied
            } else {
                EdgeState::Dead
            };
            (e, state)
        })
        .collect()
}

/// Whether a failed block's failure stops the run: `halt-run` applies
/// unless the failure was routed to an `on_failure` edge.
pub fn halts_run(graph: &ValidatedGraph, idx: usize) -> bool {
    matches!(graph.block_at(idx).on_failure, FailureMode::HaltRun)
        && !graph
            .outgoing(idx)
            .iter()
            .any(|&e| graph.edge(e).condition == EdgeCondition::OnFailure)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::ExecutionContext;
    use crate::graph::{Block, Edge, Graph};
    use braid_core::types::{BlockError, CallerIdentity, ErrorKind, RunId};
    use chrono::Utc;
    use serde_json::{json, Value};
    use tokio_util::sync::CancellationToken;

    fn ctx(graph: &ValidatedGraph, input: Value) -> ExecutionContext {
        ExecutionContext::new(
            RunId::from_string("r"),
            graph,
            input,
            CallerIdentity::anonymous(),
            CancellationToken::new(),
        )
    }

    /// Mark a block terminal and latch its edges, as the executor does.
    fn finish(graph: &ValidatedGraph, c: &ExecutionContext, id: &str, status: BlockStatus) {
        let idx = graph.index_of(id).unwrap();
        let now = Utc::now();
        c.write(|s| {
            match status {
                BlockStatus::Succeeded => {
                    s.begin_attempt(id, now).unwrap();
                    s.succeed(id, json!({"ok": true}), &[], now).unwrap();
                }
                BlockStatus::Failed => {
                    s.begin_attempt(id, now).unwrap();
                    s.fail(id, BlockError::new(ErrorKind::Handler, "x"), None, &[], now)
                        .unwrap();
                }
                BlockStatus::Skipped => s.skip(id, now).unwrap(),
                _ => unreachable!(),
            }
            let latched = resolve_outgoing(graph, idx, status, s);
            s.latch(latched);
        });
    }

    fn diamond() -> ValidatedGraph {
        Graph::new("g", "a")
            .with_block(Block::invoking("a", "echo"))
            .with_block(Block::invoking("b", "echo"))
            .with_block(Block::invoking("c", "echo"))
            .with_block(Block::invoking("d", "echo"))
            .with_edge(Edge::always("a", "b"))
            .with_edge(Edge::always("a", "c"))
            .with_edge(Edge::always("b", "d"))
            .with_edge(Edge::always("c", "d"))
            .validate()
            .unwrap()
    }

    #[test]
    fn test_entry_ready_first() {
        let g = diamond();
        let c = ctx(&g, json!({}));
        let p = c.read(|s| plan(&g, s));
        assert_eq!(p.ready, vec!["a"]);
        assert!(p.skip.is_empty());
    }

    #[test]
    fn test_independent_branches_together() {
        let g = diamond();
        let c = ctx(&g, json!({}));
        finish(&g, &c, "a", BlockStatus::Succeeded);
        let p = c.read(|s| plan(&g, s));
        assert_eq!(p.ready, vec!["b", "c"]);
    }

    #[test]
    fn test_join_waits_for_all_edges() {
        let g = diamond();
        let c = ctx(&g, json!({}));
        finish(&g, &c, "a", BlockStatus::Succeeded);
        finish(&g, &c, "b", BlockStatus::Succeeded);
        assert!(c.read(|s| plan(&g, s)).ready.contains(&"c".to_string()));
        assert!(!c.read(|s| plan(&g, s)).ready.contains(&"d".to_string()));
        finish(&g, &c, "c", BlockStatus::Failed);
        let p = c.read(|s| plan(&g, s));
        assert_eq!(p.skip, vec!["d"]);
    }

    #[test]
    fn test_join_modes() {
        for (mode, expect_ready) in [
            (JoinMode::AllSucceed, false),
            (JoinMode::AnySucceed, true),
            (JoinMode::BestEffort, true),
        ] {
            let g = Graph::new("g", "a")
                .with_block(Block::invoking("a", "echo"))
                .with_block(Block::invoking("b", "echo"))
                .with_block(Block::invoking("c", "echo"))
                .with_block(Block::invoking("d", "echo").with_join(mode))
                .with_edge(Edge::always("a", "b"))
                .with_edge(Edge::always("a", "c"))
                .with_edge(Edge::always("b", "d"))
                .with_edge(Edge::always("c", "d"))
                .validate()
                .unwrap();
            let c = ctx(&g, json!({}));
            finish(&g, &c, "a", BlockStatus::Succeeded);
            finish(&g, &c, "b", BlockStatus::Succeeded);
            finish(&g, &c, "c", BlockStatus::Skipped);
            let p = c.read(|s| plan(&g, s));
            assert_eq!(p.ready == vec!["d"], expect_ready, "{mode:?}");
            assert_eq!(p.skip == vec!["d"], !expect_ready, "{mode:?}");
        }
    }

    #[test]
    fn test_conditional_and_failure_edges() {
        let g = Graph::new("g", "a")
            .with_block(Block::invoking("a", "echo").with_outputs(vec!["n".into()]))
            .with_block(Block::invoking("big", "echo"))
            .with_block(Block::invoking("small", "echo"))
            .with_block(Block::invoking("err", "echo"))
            .with_edge(Edge::conditional("a", "big", "vars.n > 5"))
            .with_edge(Edge::conditional("a", "small", "vars.n <= 5"))
            .with_edge(Edge::on_failure("a", "err"))
            .validate()
            .unwrap();
        let c = ctx(&g, json!({"n": 9}));
        finish(&g, &c, "a", BlockStatus::Succeeded);
        let p = c.read(|s| plan(&g, s));
        assert_eq!(p.ready, vec!["big"]);
        assert_eq!(p.skip, vec!["small", "err"]);

        let c = ctx(&g, json!({"n": 9}));
        finish(&g, &c, "a", BlockStatus::Failed);
        let p = c.read(|s| plan(&g, s));
        assert_eq!(p.ready, vec!["err"]);
        assert_eq!(p.skip, vec!["big", "small"]);
    }

    #[test]
    fn test_condition_block_routes_exclusively() {
        let g = Graph::new("g", "r")
            .with_block(Block::invoking("r", "echo").with_mode(BlockMode::Condition))
            .with_block(Block::invoking("x", "echo"))
            .with_block(Block::invoking("y", "echo"))
            .with_edge(Edge::conditional("r", "x", "input.go"))
            .with_edge(Edge::always("r", "y"))
            .validate()
            .unwrap();
        let c = ctx(&g, json!({"go": true}));
        finish(&g, &c, "r", BlockStatus::Succeeded);
        let p = c.read(|s| plan(&g, s));
        assert_eq!(p.ready, vec!["x"]);
        assert_eq!(p.skip, vec!["y"]);

        let c = ctx(&g, json!({"go": false}));
        finish(&g, &c, "r", BlockStatus::Succeeded);
        assert_eq!(c.read(|s| plan(&g, s)).ready, vec!["y"]);
    }

    #[test]
    fn test_on_skip_edge() {
        let g = Graph::new("g", "a")
            .with_block(Block::invoking("a", "echo"))
            .with_block(Block::invoking("b", "echo"))
            .with_block(Block::invoking("c", "echo"))
            .with_edge(Edge::always("a", "b"))
            .with_edge(Edge::always("b", "c").satisfied_on_skip())
            .validate()
            .unwrap();
        let c = ctx(&g, json!({}));
        finish(&g, &c, "a", BlockStatus::Succeeded);
        finish(&g, &c, "b", BlockStatus::Skipped);
        assert_eq!(c.read(|s| plan(&g, s)).ready, vec!["c"]);
    }

    #[test]
    fn test_continue_with_default_resolves_as_success() {
        let g = Graph::new("g", "a")
            .with_block(Block::invoking("a", "echo").with_failure_mode(
                FailureMode::ContinueWithDefaultOutput { default: json!(0) },
            ))
            .with_block(Block::invoking("b", "echo"))
            .with_edge(Edge::always("a", "b"))
            .validate()
            .unwrap();
        let c = ctx(&g, json!({}));
        finish(&g, &c, "a", BlockStatus::Failed);
        assert_eq!(c.read(|s| plan(&g, s)).ready, vec!["b"]);
    }

    #[test]
    fn test_loop_end_waits_for_body() {
        let g = Graph::new("g", "l")
            .with_block(Block::loop_start("l", "vars.go"))
            .with_block(Block::invoking("work", "echo"))
            .with_block(Block::invoking("side", "echo"))
            .with_block(Block::loop_end("e", "l"))
            .with_edge(Edge::always("l", "work"))
            .with_edge(Edge::always("l", "side"))
            .with_edge(Edge::always("work", "e"))
            .with_edge(Edge::always("e", "l"))
            .validate()
            .unwrap();
        let c = ctx(&g, json!({}));
        finish(&g, &c, "l", BlockStatus::Succeeded);
        finish(&g, &c, "work", BlockStatus::Succeeded);
        let p = c.read(|s| plan(&g, s));
        assert_eq!(p.ready, vec!["side"]);
        finish(&g, &c, "side", BlockStatus::Succeeded);
        assert_eq!(c.read(|s| plan(&g, s)).ready, vec!["e"]);
    }

    #[test]
    fn test_halts_run() {
        let g = Graph::new("g", "a")
            .with_block(Block::invoking("a", "echo"))
            .with_block(Block::invoking("b", "echo"))
            .with_block(Block::invoking("c", "echo"))
            .with_edge(Edge::always("a", "b"))
            .with_edge(Edge::on_failure("b", "c"))
            .validate()
            .unwrap();
        assert!(halts_run(&g, 0));
        assert!(!halts_run(&g, 1));
    }
}

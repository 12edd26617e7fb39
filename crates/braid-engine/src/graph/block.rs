use std::collections::BTreeMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use braid_core::types::BlockId;

use crate::retry::RetryPolicy;

/// A block in the workflow graph.
///
/// A block either invokes a capability with its resolved inputs, or (with no
/// capability) is a control block resolved inline by the executor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Block {
    /// Unique identifier for this block.
    pub id: BlockId,
    /// Human-readable name.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// Capability to invoke. `None` makes this a pass-through block whose
    /// output is its resolved input map.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub capability: Option<String>,
    /// Input parameter name -> expression.
    #[serde(default)]
    pub inputs: BTreeMap<String, InputExpr>,
    /// Run variables written from this block's output.
    #[serde(default)]
    pub output_keys: Vec<String>,
    #[serde(default)]
    pub mode: BlockMode,
    #[serde(default)]
    pub join: JoinMode,
    #[serde(default)]
    pub retry: RetryPolicy,
    /// Per-attempt deadline; falls back to the run's default block timeout.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
    #[serde(default)]
    pub on_failure: FailureMode,
}

/// How the executor treats a block.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum BlockMode {
    #[default]
    Normal,
    /// Routes exclusively: only the first satisfied outgoing edge is taken.
    Condition,
    /// Opens a loop region. `condition` is evaluated when the matching
    /// loop-end is reached; true runs the body again.
    LoopStart {
        condition: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        max_iterations: Option<u32>,
    },
    /// Closes the region opened by `start`.
    LoopEnd { start: BlockId },
    ParallelFanout,
    ParallelJoin,
}

impl BlockMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Normal => "normal",
            Self::Condition => "condition",
            Self::LoopStart { .. } => "loop-start",
            Self::LoopEnd { .. } => "loop-end",
            Self::ParallelFanout => "parallel-fanout",
            Self::ParallelJoin => "parallel-join",
        }
    }
}

/// How a block with several incoming edges decides whether to run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum JoinMode {
    /// Run iff every incoming edge is satisfied, otherwise skip.
    #[default]
    AllSucceed,
    /// Run iff at least one incoming edge is satisfied.
    AnySucceed,
    /// Run once every incoming edge is latched, whatever the outcome.
    BestEffort,
}

/// What happens after a block exhausts its retries.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum FailureMode {
    /// Cancel in-flight work and fail the run, unless the failure is routed
    /// to an `on_failure` edge.
    #[default]
    HaltRun,
    /// Mark the block failed; dependents resolve by their join mode.
    SkipDownstream,
    /// Mark the block failed but record `default` as its output; outgoing
    /// edges resolve as if it had succeeded.
    ContinueWithDefaultOutput {
        #[serde(default)]
        default: Value,
    },
}

/// Expression producing one input parameter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum InputExpr {
    Literal { value: Value },
    /// A path such as `vars.count` or `blocks.fetch.output.items[0]`.
    /// Resolves to null when missing.
    Ref { path: String },
    /// A string with `{{ path }}` placeholders. Missing paths render empty.
    Template { template: String },
}

impl InputExpr {
    pub fn literal(value: impl Into<Value>) -> Self {
        Self::Literal {
            value: value.into(),
        }
    }

    pub fn reference(path: impl Into<String>) -> Self {
        Self::Ref { path: path.into() }
    }

    pub fn template(template: impl Into<String>) -> Self {
        Self::Template {
            template: template.into(),
        }
    }
}

impl Block {
    /// Create a pass-through block.
    pub fn new(id: impl Into<BlockId>) -> Self {
        Self {
            id: id.into(),
            name: None,
            capability: None,
            inputs: BTreeMap::new(),
            output_keys: vec![],
            mode: BlockMode::Normal,
            join: JoinMode::AllSucceed,
            retry: RetryPolicy::default(),
            timeout_ms: None,
            on_failure: FailureMode::HaltRun,
        }
    }

    /// Create a block that invokes `capability`.
    pub fn invoking(id: impl Into<BlockId>, capability: impl Into<String>) -> Self {
        Self::new(id).with_capability(capability)
    }

    /// Create a loop-start block with its continuation predicate.
    pub fn loop_start(id: impl Into<BlockId>, condition: impl Into<String>) -> Self {
        Self::new(id).with_mode(BlockMode::LoopStart {
            condition: condition.into(),
            max_iterations: None,
        })
    }

    /// Create the loop-end block closing `start`.
    pub fn loop_end(id: impl Into<BlockId>, start: impl Into<BlockId>) -> Self {
        Self::new(id).with_mode(BlockMode::LoopEnd {
            start: start.into(),
        })
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn with_capability(mut self, capability: impl Into<String>) -> Self {
        self.capability = Some(capability.into());
        self
    }

    /// Add one input expression.
    pub fn with_input(mut self, name: impl Into<String>, expr: InputExpr) -> Self {
        self.inputs.insert(name.into(), expr);
        self
    }

    /// Set the output keys.
    pub fn with_outputs(mut self, keys: Vec<String>) -> Self {
        self.output_keys = keys;
        self
    }

    pub fn with_mode(mut self, mode: BlockMode) -> Self {
        self.mode = mode;
        self
    }

    pub fn with_join(mut self, join: JoinMode) -> Self {
        self.join = join;
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout_ms = Some(timeout.as_millis() as u64);
        self
    }

    pub fn with_failure_mode(mut self, mode: FailureMode) -> Self {
        self.on_failure = mode;
        self
    }

    /// Cap this loop-start's iterations below the run-wide ceiling.
    pub fn with_max_iterations(mut self, max: u32) -> Self {
        if let BlockMode::LoopStart { max_iterations, .. } = &mut self.mode {
            *max_iterations = Some(max);
        }
        self
    }

    /// Control blocks are resolved by the executor without a capability.
    pub fn is_inline(&self) -> bool {
        self.capability.is_none()
            || matches!(self.mode, BlockMode::LoopStart { .. } | BlockMode::LoopEnd { .. })
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.timeout_ms.map(Duration::from_millis)
    }

    pub fn display_name(&self) -> &str {
        self.name.as_deref().unwrap_or(&self.id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_block_builder() {
        let block = Block::invoking("b1", "math")
            .with_name("Increment")
            .with_input("a", InputExpr::reference("vars.count"))
            .with_input("b", InputExpr::literal(1))
            .with_outputs(vec!["count".into()])
            .with_retry(RetryPolicy::new(2))
            .with_timeout(Duration::from_millis(1500));

        assert_eq!(block.id, "b1");
        assert_eq!(block.display_name(), "Increment");
        assert_eq!(block.capability.as_deref(), Some("math"));
        assert_eq!(block.inputs.len(), 2);
        assert_eq!(block.retry.max_retries, 2);
        assert_eq!(block.timeout(), Some(Duration::from_millis(1500)));
        assert!(!block.is_inline());
        assert!(Block::new("p").is_inline());
    }

    #[test]
    fn test_block_from_json_defaults() {
        let block: Block = serde_json::from_value(json!({
            "id": "x",
            "capability": "echo",
            "inputs": {
                "greeting": {"type": "template", "template": "hi {{ vars.name }}"},
                "n": {"type": "literal", "value": 3},
                "prev": {"type": "ref", "path": "blocks.a.output"}
            }
        }))
        .unwrap();
        assert_eq!(block.mode, BlockMode::Normal);
        assert_eq!(block.join, JoinMode::AllSucceed);
        assert_eq!(block.on_failure, FailureMode::HaltRun);
        assert_eq!(block.retry.max_retries, 0);
        assert_eq!(block.inputs["n"], InputExpr::literal(3));
    }

    #[test]
    fn test_mode_serde() {
        let block: Block = serde_json::from_value(json!({
            "id": "l",
            "mode": {"kind": "loop-start", "condition": "vars.n < 3", "max_iterations": 5},
            "on_failure": {"type": "continue-with-default-output", "default": {"ok": false}},
            "join": "any-succeed"
        }))
        .unwrap();
        assert_eq!(
            block.mode,
            BlockMode::LoopStart {
                condition: "vars.n < 3".into(),
                max_iterations: Some(5)
            }
        );
        assert_eq!(block.join, JoinMode::AnySucceed);
        assert_eq!(
            block.on_failure,
            FailureMode::ContinueWithDefaultOutput {
                default: json!({"ok": false})
            }
        );
        assert_eq!(block.mode.as_str(), "loop-start");
    }

    #[test]
    fn test_loop_builders() {
        let start = Block::loop_start("l", "vars.more").with_max_iterations(4);
        assert!(matches!(
            start.mode,
            BlockMode::LoopStart {
                max_iterations: Some(4),
                ..
            }
        ));
        let end = Block::loop_end("e", "l");
        assert_eq!(end.mode, BlockMode::LoopEnd { start: "l".into() });
        assert!(end.is_inline());
    }
}

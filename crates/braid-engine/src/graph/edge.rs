use serde::{Deserialize, Serialize};

use braid_core::types::BlockId;

/// A dependency between two blocks.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Edge {
    /// Source block id.
    pub from: BlockId,
    /// Target block id.
    pub to: BlockId,
    /// When the edge is satisfied once the source is terminal.
    #[serde(default)]
    pub condition: EdgeCondition,
    /// Satisfied (rather than dead) when the source is skipped. Used to join
    /// alternate branches.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub on_skip: bool,
}

/// Condition for an edge to be satisfied.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EdgeCondition {
    /// Satisfied when the source succeeds.
    #[default]
    Always,
    /// Satisfied when the source succeeds and the guard holds, evaluated
    /// against the run context at the moment the source completes.
    Conditional { expr: String },
    /// Satisfied only when the source fails.
    OnFailure,
}

impl Edge {
    /// Create an unconditional edge.
    pub fn always(from: impl Into<BlockId>, to: impl Into<BlockId>) -> Self {
        Self {
            from: from.into(),
            to: to.into(),
            condition: EdgeCondition::Always,
            on_skip: false,
        }
    }

    /// Create an error-route edge.
    pub fn on_failure(from: impl Into<BlockId>, to: impl Into<BlockId>) -> Self {
        Self {
            condition: EdgeCondition::OnFailure,
            ..Self::always(from, to)
        }
    }

    /// Create a guarded edge.
    pub fn conditional(
        from: impl Into<BlockId>,
        to: impl Into<BlockId>,
        expr: impl Into<String>,
    ) -> Self {
        Self {
            condition: EdgeCondition::Conditional { expr: expr.into() },
            ..Self::always(from, to)
        }
    }

    /// Mark the edge satisfied when its source is skipped.
    pub fn satisfied_on_skip(mut self) -> Self {
        self.on_skip = true;
        self
    }
}

use thiserror::Error;

use crate::types::ErrorKind;

#[derive(Debug, Error)]
pub enum BraidError {
    // Graph errors
    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error("Graph not found: {0}")]
    GraphNotFound(String),

    // Capability errors
    #[error("Capability not found: {0}")]
    CapabilityNotFound(String),

    #[error("Capability failed: {capability}: {message}")]
    Handler { capability: String, message: String },

    #[error("Capability timeout after {timeout_ms}ms: {capability}")]
    Timeout { capability: String, timeout_ms: u64 },

    #[error("Capability input rejected: {0}")]
    InvalidInput(String),

    // Run errors
    #[error("Cancelled")]
    Cancelled,

    #[error("Loop '{loop_start}' exceeded max iterations ({max})")]
    LoopIterationLimitExceeded { loop_start: String, max: u32 },

    #[error("Run stalled with unresolved blocks: {}", .0.join(", "))]
    Stalled(Vec<String>),

    #[error("Run not found: {0}")]
    RunNotFound(String),

    #[error("Illegal status transition for block '{block}': {from} -> {to}")]
    InvalidTransition {
        block: String,
        from: String,
        to: String,
    },

    #[error("Expression error: {0}")]
    Expression(String),

    // Event delivery
    #[error("Event delivery failed: {0}")]
    EventDelivery(String),

    // Config errors
    #[error("Config error: {0}")]
    Config(String),

    #[error("Config file not found: {0}")]
    ConfigNotFound(String),

    // Storage errors
    #[error("Database error: {0}")]
    Database(String),

    // I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    // JSON errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl BraidError {
    /// The ledger-facing classification of this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Validation(_) => ErrorKind::Validation,
            Self::CapabilityNotFound(_) => ErrorKind::CapabilityResolution,
            Self::Handler { .. } => ErrorKind::Handler,
            Self::Timeout { .. } => ErrorKind::Timeout,
            Self::InvalidInput(_) | Self::Expression(_) => ErrorKind::Input,
            Self::Cancelled => ErrorKind::Cancelled,
            Self::LoopIterationLimitExceeded { .. } => ErrorKind::LoopIterationLimit,
            Self::Stalled(_) => ErrorKind::Stalled,
            _ => ErrorKind::Internal,
        }
    }

    /// Handler failures and timeouts are retried per the block's policy;
    /// everything else fails the block on the first attempt.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Handler { .. } | Self::Timeout { .. })
    }
}

/// Reasons a graph is rejected at load time.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ValidationError {
    #[error("Graph has no blocks")]
    EmptyGraph,

    #[error("Duplicate block id: {0}")]
    DuplicateBlock(String),

    #[error("Entry block not found: {0}")]
    UnknownEntry(String),

    #[error("Edge {from} -> {to} references unknown block '{missing}'")]
    DanglingEdge {
        from: String,
        to: String,
        missing: String,
    },

    #[error("Loop end '{end}' names '{start}', which is not a loop-start block")]
    LoopEndWithoutStart { end: String, start: String },

    #[error("Loop start '{0}' has no matching loop-end")]
    LoopStartWithoutEnd(String),

    #[error("Loop start '{0}' allows zero iterations")]
    ZeroLoopCap(String),

    #[error("Loop start '{start}' is claimed by more than one loop-end: {first}, {second}")]
    LoopStartSharedByEnds {
        start: String,
        first: String,
        second: String,
    },

    #[error("Cycle outside a loop region through: {}", .0.join(" -> "))]
    Cycle(Vec<String>),

    #[error("Entry block '{0}' has incoming edges")]
    EntryHasIncoming(String),

    #[error("Blocks unreachable from entry: {}", .0.join(", "))]
    Unreachable(Vec<String>),

    #[error("Loop end '{end}' is not reachable from loop start '{start}'")]
    LoopEndUnreachable { start: String, end: String },

    #[error("Loop '{start}' body block '{block}' is entered from outside the region by '{from}'")]
    LoopRegionEntered {
        start: String,
        block: String,
        from: String,
    },

    #[error("Loop '{start}' body block '{block}' exits the region to '{to}' without passing through the loop end")]
    LoopRegionExited {
        start: String,
        block: String,
        to: String,
    },

    #[error("Loop regions '{first}' and '{second}' overlap without nesting")]
    OverlappingLoops { first: String, second: String },

    #[error("Parallel join '{0}' is not dominated by a parallel-fanout block")]
    JoinWithoutFanout(String),

    #[error("Invalid guard on edge {from} -> {to}: {reason}")]
    InvalidGuard {
        from: String,
        to: String,
        reason: String,
    },

    #[error("Invalid expression in block '{block}': {reason}")]
    InvalidExpression { block: String, reason: String },

    #[error("Block '{block}' references unknown block '{reference}'")]
    UnknownBlockReference { block: String, reference: String },
}

pub type Result<T> = std::result::Result<T, BraidError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_kinds() {
        assert_eq!(
            BraidError::CapabilityNotFound("x".into()).kind(),
            ErrorKind::CapabilityResolution
        );
        assert_eq!(
            BraidError::Timeout {
                capability: "x".into(),
                timeout_ms: 10
            }
            .kind(),
            ErrorKind::Timeout
        );
        assert_eq!(BraidError::Cancelled.kind(), ErrorKind::Cancelled);
        assert_eq!(
            BraidError::from(ValidationError::EmptyGraph).kind(),
            ErrorKind::Validation
        );
    }

    #[test]
    fn test_retryable() {
        assert!(BraidError::Handler {
            capability: "x".into(),
            message: "boom".into()
        }
        .is_retryable());
        assert!(BraidError::Timeout {
            capability: "x".into(),
            timeout_ms: 5
        }
        .is_retryable());
        assert!(!BraidError::CapabilityNotFound("x".into()).is_retryable());
        assert!(!BraidError::InvalidInput("bad".into()).is_retryable());
        assert!(!BraidError::Cancelled.is_retryable());
    }

    #[test]
    fn test_display_messages() {
        let e = ValidationError::Cycle(vec!["a".into(), "b".into(), "a".into()]);
        assert_eq!(e.to_string(), "Cycle outside a loop region through: a -> b -> a");

        let e = BraidError::Stalled(vec!["x".into(), "y".into()]);
        assert_eq!(e.to_string(), "Run stalled with unresolved blocks: x, y");
    }
}

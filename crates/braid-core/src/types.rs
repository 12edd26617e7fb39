use std::fmt;

use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// Identifier of a block within a graph.
pub type BlockId = String;

/// Unique run identifier.
#[derive(Debug, Clone, Hash, Eq, PartialEq, Ord, PartialOrd, Serialize, Deserialize)]
pub struct RunId(pub String);

impl RunId {
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn from_string(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl Default for RunId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for RunId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Opaque identity of whoever started a run. The engine never interprets it;
/// it is handed through to capabilities and recorded in the ledger.
#[derive(Debug, Clone, Hash, Eq, PartialEq, Serialize, Deserialize)]
pub struct CallerIdentity(pub String);

impl CallerIdentity {
    pub fn new(subject: impl Into<String>) -> Self {
        Self(subject.into())
    }

    pub fn anonymous() -> Self {
        Self("anonymous".to_string())
    }
}

impl fmt::Display for CallerIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Status of a single block within a run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BlockStatus {
    #[default]
    Pending,
    Running,
    Succeeded,
    Failed,
    Skipped,
}

impl BlockStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed | Self::Skipped)
    }

    /// Legal forward transitions. Terminal statuses only return to `Pending`
    /// through a loop reset, which is not a transition.
    pub fn can_transition_to(&self, next: BlockStatus) -> bool {
        use BlockStatus::*;
        matches!(
            (self, next),
            (Pending, Running)
                | (Pending, Skipped)
                | (Pending, Failed)
                | (Running, Running)
                | (Running, Succeeded)
                | (Running, Failed)
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
            Self::Skipped => "skipped",
        }
    }
}

impl fmt::Display for BlockStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Lifecycle of a run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RunStatus {
    #[default]
    Created,
    Running,
    Succeeded,
    /// Every block resolved, but at least one failed without halting the run.
    SucceededWithFailures,
    Failed,
    Cancelled,
}

impl RunStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Created | Self::Running)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Created => "created",
            Self::Running => "running",
            Self::Succeeded => "succeeded",
            Self::SucceededWithFailures => "succeeded-with-failures",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Classification of a block or run failure, preserved through retries and
/// recorded in events and ledgers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ErrorKind {
    Validation,
    CapabilityResolution,
    Handler,
    Timeout,
    Input,
    Cancelled,
    LoopIterationLimit,
    Stalled,
    Internal,
}

/// Serializable error record attached to a failed block or run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BlockError {
    pub kind: ErrorKind,
    pub message: String,
}

impl BlockError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn cancelled() -> Self {
        Self::new(ErrorKind::Cancelled, "Cancelled")
    }
}

impl From<&crate::error::BraidError> for BlockError {
    fn from(e: &crate::error::BraidError) -> Self {
        Self::new(e.kind(), e.to_string())
    }
}

impl fmt::Display for BlockError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}: {}", self.kind, self.message)
    }
}

/// One call into a capability.
#[derive(Debug, Clone)]
pub struct Invocation {
    /// Unique per attempt; passed back to `Capability::cancel`.
    pub id: String,
    pub run_id: RunId,
    pub block_id: BlockId,
    /// 1-based attempt number.
    pub attempt: u32,
    pub inputs: serde_json::Value,
    pub deadline: tokio::time::Instant,
    pub cancel: CancellationToken,
    pub caller: CallerIdentity,
}

impl Invocation {
    pub fn new(
        run_id: RunId,
        block_id: impl Into<BlockId>,
        attempt: u32,
        inputs: serde_json::Value,
        deadline: tokio::time::Instant,
        cancel: CancellationToken,
        caller: CallerIdentity,
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            run_id,
            block_id: block_id.into(),
            attempt,
            inputs,
            deadline,
            cancel,
            caller,
        }
    }

    /// Get a typed input field.
    pub fn input(&self, key: &str) -> Option<&serde_json::Value> {
        self.inputs.get(key)
    }
}

/// An item produced by a capability's invocation stream.
#[derive(Debug, Clone, PartialEq)]
pub enum CapabilityEvent {
    /// A partial chunk; forwarded as a `streaming` event.
    Partial(serde_json::Value),
    /// The final output. Items after it are ignored.
    Output(serde_json::Value),
}

/// Capability metadata for listings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CapabilityInfo {
    pub name: String,
    pub description: String,
    pub streaming: bool,
}

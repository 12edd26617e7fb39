//! Workflow execution engine.
//!
//! A [`Graph`] of blocks is validated once into a [`ValidatedGraph`], then
//! executed by the [`Engine`]: the scheduler computes which blocks are
//! eligible, the executor dispatches them to capabilities under a per-run
//! concurrency cap, and every state transition is emitted as an ordered
//! [`RunEvent`](braid_core::RunEvent).

pub mod context;
pub mod emitter;
pub mod executor;
pub mod expr;
pub mod graph;
pub mod ledger;
pub mod manager;
pub mod retry;
pub mod run_log;
pub mod scheduler;
pub mod store;

pub use context::ExecutionContext;
pub use graph::{
    Block, BlockMode, Edge, EdgeCondition, FailureMode, Graph, InputExpr, JoinMode,
    ValidatedGraph,
};
pub use ledger::{BlockRecord, RunLedger, RunProjection, RunSummary};
pub use manager::Engine;
pub use retry::RetryPolicy;
pub use run_log::RunLogger;
pub use store::{MemoryStore, RunStore};

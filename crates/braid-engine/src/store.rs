use std::collections::HashMap;

use futures::future::BoxFuture;
use parking_lot::Mutex;

use braid_core::error::{BraidError, Result};
use braid_core::types::RunId;

use crate::graph::Graph;
use crate::ledger::{RunLedger, RunSummary};

/// Persistence for graph definitions and finished run ledgers.
pub trait RunStore: Send + Sync + 'static {
    /// Insert or replace a graph definition.
    fn save_graph(&self, graph: &Graph) -> BoxFuture<'_, Result<()>>;

    /// Load a graph by id. Fails with `GraphNotFound`.
    fn load_graph(&self, graph_id: &str) -> BoxFuture<'_, Result<Graph>>;

    /// Ids of stored graphs, sorted.
    fn list_graphs(&self) -> BoxFuture<'_, Result<Vec<String>>>;

    /// Record a run's final ledger. A ledger for the same run replaces the
    /// earlier one.
    fn append_ledger(&self, ledger: &RunLedger) -> BoxFuture<'_, Result<()>>;

    fn load_ledger(&self, run_id: &RunId) -> BoxFuture<'_, Result<Option<RunLedger>>>;

    /// Summaries of the most recently finished runs, newest first.
    fn list_runs(&self, limit: usize) -> BoxFuture<'_, Result<Vec<RunSummary>>>;
}

/// In-process store, mostly for tests and one-shot CLI runs.
#[derive(Default)]
pub struct MemoryStore {
    graphs: Mutex<HashMap<String, Graph>>,
    /// Ledgers in append order.
    ledgers: Mutex<Vec<RunLedger>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn ledger_count(&self) -> usize {
        self.ledgers.lock().len()
    }
}

impl RunStore for MemoryStore {
    fn save_graph(&self, graph: &Graph) -> BoxFuture<'_, Result<()>> {
        self.graphs.lock().insert(graph.id.clone(), graph.clone());
        Box::pin(async { Ok(()) })
    }

    fn load_graph(&self, graph_id: &str) -> BoxFuture<'_, Result<Graph>> {
        let graph = self
            .graphs
            .lock()
            .get(graph_id)
            .cloned()
            .ok_or_else(|| BraidError::GraphNotFound(graph_id.to_string()));
        Box::pin(async move { graph })
    }

    fn list_graphs(&self) -> BoxFuture<'_, Result<Vec<String>>> {
        let mut ids: Vec<String> = self.graphs.lock().keys().cloned().collect();
        ids.sort();
        Box::pin(async move { Ok(ids) })
    }

    fn append_ledger(&self, ledger: &RunLedger) -> BoxFuture<'_, Result<()>> {
        let mut ledgers = self.ledgers.lock();
        ledgers.retain(|l| l.run_id != ledger.run_id);
        ledgers.push(ledger.clone());
        Box::pin(async { Ok(()) })
    }

    fn load_ledger(&self, run_id: &RunId) -> BoxFuture<'_, Result<Option<RunLedger>>> {
        let ledger = self
            .ledgers
            .lock()
            .iter()
            .find(|l| &l.run_id == run_id)
            .cloned();
        Box::pin(async move { Ok(ledger) })
    }

    fn list_runs(&self, limit: usize) -> BoxFuture<'_, Result<Vec<RunSummary>>> {
        let summaries = self
            .ledgers
            .lock()
            .iter()
            .rev()
            .take(limit)
            .map(RunLedger::summary)
            .collect();
        Box::pin(async move { Ok(summaries) })
    }
}

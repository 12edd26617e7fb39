use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use parking_lot::RwLock;
use serde_json::Value;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use braid_capabilities::CapabilityRegistry;
use braid_core::config::RunConfig;
use braid_core::error::{BraidError, Result};
use braid_core::traits::EventSink;
use braid_core::types::{CallerIdentity, RunId};

use crate::context::ExecutionContext;
use crate::emitter;
use crate::executor::Executor;
use crate::graph::{Graph, ValidatedGraph};
use crate::ledger::{RunLedger, RunSummary};
use crate::store::RunStore;

struct RunEntry {
    cancel: CancellationToken,
    /// Present while the run executes; dropped once the ledger is handed off.
    live: Option<Arc<ExecutionContext>>,
    summary: watch::Receiver<Option<RunSummary>>,
}

/// Finished runs kept in memory unless configured otherwise.
const DEFAULT_RETAINED_RUNS: usize = 1024;

#[derive(Default)]
struct RunTable {
    entries: HashMap<RunId, RunEntry>,
    /// Finished runs, oldest first.
    finished: VecDeque<RunId>,
}

impl RunTable {
    fn get(&self, run_id: &RunId) -> Option<&RunEntry> {
        self.entries.get(run_id)
    }

    /// Mark a run finished and forget the oldest finished runs beyond `retain`.
    fn retire(&mut self, run_id: &RunId, retain: usize) {
        if let Some(entry) = self.entries.get_mut(run_id) {
            entry.live = None;
            self.finished.push_back(run_id.clone());
        }
        while self.finished.len() > retain {
            if let Some(old) = self.finished.pop_front() {
                self.entries.remove(&old);
            }
        }
    }
}

/// Starts runs and answers questions about them.
///
/// Each run executes on its own task with its own context, semaphore and
/// event queue; the engine only keeps a handle per run. After a run ends its
/// ledger goes to the store (if any) and only the summary stays in memory,
/// for the most recent `retained_runs` finished runs.
pub struct Engine {
    registry: Arc<CapabilityRegistry>,
    sink: Arc<dyn EventSink>,
    store: Option<Arc<dyn RunStore>>,
    runs: Arc<RwLock<RunTable>>,
    retained_runs: usize,
}

impl Engine {
    pub fn new(registry: Arc<CapabilityRegistry>, sink: Arc<dyn EventSink>) -> Self {
        Self {
            registry,
            sink,
            store: None,
            runs: Arc::new(RwLock::new(RunTable::default())),
            retained_runs: DEFAULT_RETAINED_RUNS,
        }
    }

    /// Number of finished runs whose summaries stay queryable. Older ones
    /// are only reachable through the store.
    pub fn with_retained_runs(mut self, retained: usize) -> Self {
        self.retained_runs = retained;
        self
    }

    /// Persist finished ledgers and enable `start_stored`.
    pub fn with_store(mut self, store: Arc<dyn RunStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn registry(&self) -> &CapabilityRegistry {
        &self.registry
    }

    pub fn store(&self) -> Option<&Arc<dyn RunStore>> {
        self.store.as_ref()
    }

    /// Validate `graph` and start a run. Must be called within a tokio
    /// runtime. An invalid graph fails here and no run is created.
    pub fn start(
        &self,
        graph: Graph,
        input: Value,
        caller: CallerIdentity,
        config: RunConfig,
    ) -> Result<RunId> {
        let graph = Arc::new(graph.validate()?);
        Ok(self.start_validated(graph, input, caller, config))
    }

    /// Start a run of an already validated graph.
    pub fn start_validated(
        &self,
        graph: Arc<ValidatedGraph>,
        input: Value,
        caller: CallerIdentity,
        config: RunConfig,
    ) -> RunId {
        let run_id = RunId::new();
        let cancel = CancellationToken::new();
        let ctx = Arc::new(ExecutionContext::new(
            run_id.clone(),
            &graph,
            input,
            caller,
            cancel.clone(),
        ));
        let (events, receiver) = emitter::channel(ctx.clone(), config.event_queue_capacity);
        let (summary_tx, summary_rx) = watch::channel(None);

        self.runs.write().entries.insert(
            run_id.clone(),
            RunEntry {
                cancel,
                live: Some(ctx.clone()),
                summary: summary_rx,
            },
        );
        info!(run_id = %run_id, graph_id = %graph.id(), "Run submitted");

        let dispatcher = tokio::spawn(emitter::deliver(
            receiver,
            self.sink.clone(),
            config.delivery_retries,
        ));
        let executor = Executor::new(graph, self.registry.clone(), ctx, events, config);
        let runs = self.runs.clone();
        let store = self.store.clone();
        let retain = self.retained_runs;
        let id = run_id.clone();

        tokio::spawn(async move {
            let ledger = executor.run().await;
            if let Err(e) = dispatcher.await {
                error!(run_id = %id, error = %e, "Event dispatcher failed");
            }
            if let Some(store) = store {
                if let Err(e) = store.append_ledger(&ledger).await {
                    error!(run_id = %id, error = %e, "Failed to persist run ledger");
                }
            }
            // Readers must never see a finished run without its summary.
            {
                let mut runs = runs.write();
                let _ = summary_tx.send(Some(ledger.summary()));
                runs.retire(&id, retain);
            }
        });

        run_id
    }

    /// Load a graph from the store and start a run of it.
    pub async fn start_stored(
        &self,
        graph_id: &str,
        input: Value,
        caller: CallerIdentity,
        config: RunConfig,
    ) -> Result<RunId> {
        let store = self
            .store
            .as_ref()
            .ok_or_else(|| BraidError::Config("No run store configured".into()))?;
        let graph = store.load_graph(graph_id).await?;
        self.start(graph, input, caller, config)
    }

    /// Request cancellation. In-flight blocks are cancelled cooperatively;
    /// cancelling a finished run is a no-op.
    pub fn cancel(&self, run_id: &RunId) -> Result<()> {
        let runs = self.runs.read();
        let entry = runs
            .get(run_id)
            .ok_or_else(|| BraidError::RunNotFound(run_id.to_string()))?;
        if entry.live.is_some() {
            info!(run_id = %run_id, "Cancelling run");
        }
        entry.cancel.cancel();
        Ok(())
    }

    /// Current summary of a run, live or finished.
    pub fn status(&self, run_id: &RunId) -> Result<RunSummary> {
        let runs = self.runs.read();
        let entry = runs
            .get(run_id)
            .ok_or_else(|| BraidError::RunNotFound(run_id.to_string()))?;
        if let Some(summary) = entry.summary.borrow().clone() {
            return Ok(summary);
        }
        entry
            .live
            .as_ref()
            .map(|ctx| ctx.ledger().summary())
            .ok_or_else(|| BraidError::RunNotFound(run_id.to_string()))
    }

    /// Wait for a run to finish. Every event of the run has been handed to
    /// the sink by the time this returns.
    pub async fn wait(&self, run_id: &RunId) -> Result<RunSummary> {
        let mut rx = self
            .runs
            .read()
            .get(run_id)
            .map(|e| e.summary.clone())
            .ok_or_else(|| BraidError::RunNotFound(run_id.to_string()))?;
        let summary = rx
            .wait_for(Option::is_some)
            .await
            .map_err(|_| BraidError::RunNotFound(run_id.to_string()))?
            .clone();
        summary.ok_or_else(|| BraidError::RunNotFound(run_id.to_string()))
    }

    /// Full ledger: a snapshot while the run is live, otherwise the stored
    /// copy.
    pub async fn ledger(&self, run_id: &RunId) -> Result<RunLedger> {
        let live = self
            .runs
            .read()
            .get(run_id)
            .and_then(|e| e.live.clone());
        if let Some(ctx) = live {
            return Ok(ctx.ledger());
        }
        match &self.store {
            Some(store) => store
                .load_ledger(run_id)
                .await?
                .ok_or_else(|| BraidError::RunNotFound(run_id.to_string())),
            None => Err(BraidError::RunNotFound(run_id.to_string())),
        }
    }

    /// Runs still executing.
    pub fn active_runs(&self) -> Vec<RunId> {
        self.runs
            .read()
            .entries
            .iter()
            .filter(|(_, e)| e.live.is_some())
            .map(|(id, _)| id.clone())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use crate::graph::{Block, Edge};
    use crate::store::MemoryStore;
    use braid_core::types::RunStatus;
    use braid_test_utils::{RecordingSink, SlowCapability};
    use serde_json::json;

    fn engine(sink: RecordingSink) -> Engine {
        let mut registry = CapabilityRegistry::with_builtins();
        registry.register(SlowCapability::new("slow", Duration::from_secs(60)));
        Engine::new(Arc::new(registry), Arc::new(sink))
    }

    fn chain() -> Graph {
        Graph::new("chain", "a")
            .with_block(Block::invoking("a", "echo"))
            .with_block(Block::invoking("b", "echo"))
            .with_edge(Edge::always("a", "b"))
    }

    #[tokio::test]
    async fn test_start_and_wait() {
        let sink = RecordingSink::new();
        let engine = engine(sink.clone());
        let run_id = engine
            .start(chain(), json!({}), CallerIdentity::anonymous(), RunConfig::default())
            .unwrap();
        let summary = engine.wait(&run_id).await.unwrap();
        assert_eq!(summary.status, RunStatus::Succeeded);
        assert_eq!(summary.succeeded, 2);
        assert_eq!(engine.status(&run_id).unwrap(), summary);
        assert!(sink.events().last().unwrap().kind.is_run_terminal());
    }

    #[tokio::test]
    async fn test_invalid_graph_rejected() {
        let engine = engine(RecordingSink::new());
        let graph = chain().with_edge(Edge::always("b", "a"));
        let err = engine
            .start(graph, json!({}), CallerIdentity::anonymous(), RunConfig::default())
            .unwrap_err();
        assert!(matches!(err, BraidError::Validation(_)));
        assert!(engine.active_runs().is_empty());
    }

    #[tokio::test]
    async fn test_unknown_run() {
        let engine = engine(RecordingSink::new());
        let id = RunId::from_string("nope");
        assert!(matches!(engine.status(&id), Err(BraidError::RunNotFound(_))));
        assert!(engine.cancel(&id).is_err());
        assert!(engine.wait(&id).await.is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_run() {
        let engine = engine(RecordingSink::new());
        let graph = Graph::new("g", "s").with_block(Block::invoking("s", "slow"));
        let run_id = engine
            .start(graph, json!({}), CallerIdentity::anonymous(), RunConfig::default())
            .unwrap();
        tokio::time::sleep(Duration::from_millis(5)).await;
        assert_eq!(engine.status(&run_id).unwrap().status, RunStatus::Running);
        engine.cancel(&run_id).unwrap();
        let summary = engine.wait(&run_id).await.unwrap();
        assert_eq!(summary.status, RunStatus::Cancelled);
        assert_eq!(summary.failed, 1);
    }

    #[tokio::test]
    async fn test_store_receives_ledger() {
        let store = Arc::new(MemoryStore::new());
        store.save_graph(&chain()).await.unwrap();
        let engine = engine(RecordingSink::new()).with_store(store.clone());
        let run_id = engine
            .start_stored("chain", json!({"k": 1}), CallerIdentity::new("u"), RunConfig::default())
            .await
            .unwrap();
        engine.wait(&run_id).await.unwrap();

        let ledger = engine.ledger(&run_id).await.unwrap();
        assert_eq!(ledger.caller, CallerIdentity::new("u"));
        assert_eq!(ledger.status, RunStatus::Succeeded);
        assert_eq!(store.ledger_count(), 1);

        assert!(matches!(
            engine
                .start_stored("missing", json!({}), CallerIdentity::anonymous(), RunConfig::default())
                .await,
            Err(BraidError::GraphNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_old_runs_evicted() {
        let store = Arc::new(MemoryStore::new());
        let engine = engine(RecordingSink::new())
            .with_store(store.clone())
            .with_retained_runs(1);
        let mut ids = Vec::new();
        for _ in 0..2 {
            let run_id = engine
                .start(chain(), json!({}), CallerIdentity::anonymous(), RunConfig::default())
                .unwrap();
            engine.wait(&run_id).await.unwrap();
            ids.push(run_id);
        }

        assert!(matches!(engine.status(&ids[0]), Err(BraidError::RunNotFound(_))));
        assert_eq!(engine.status(&ids[1]).unwrap().status, RunStatus::Succeeded);
        // Evicted runs are still in the store.
        assert_eq!(engine.ledger(&ids[0]).await.unwrap().run_id, ids[0]);
        assert_eq!(store.ledger_count(), 2);
    }

    #[tokio::test]
    async fn test_start_stored_requires_store() {
        let engine = engine(RecordingSink::new());
        let err = engine
            .start_stored("chain", json!({}), CallerIdentity::anonymous(), RunConfig::default())
            .await
            .unwrap_err();
        assert!(matches!(err, BraidError::Config(_)));
    }
}

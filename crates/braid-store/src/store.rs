use chrono::Utc;
use futures::future::BoxFuture;
use rusqlite::{params, Connection, OptionalExtension};
use std::path::Path;
use std::sync::Mutex;
use tracing::debug;

use braid_core::error::{BraidError, Result};
use braid_core::types::RunId;
use braid_engine::graph::Graph;
use braid_engine::ledger::{RunLedger, RunSummary};
use braid_engine::store::RunStore;

const SCHEMA: &str = "
    CREATE TABLE IF NOT EXISTS graphs (
        id TEXT PRIMARY KEY,
        name TEXT NOT NULL,
        definition TEXT NOT NULL,
        updated_at TEXT NOT NULL
    );

    CREATE TABLE IF NOT EXISTS run_ledgers (
        run_id TEXT PRIMARY KEY,
        graph_id TEXT NOT NULL,
        status TEXT NOT NULL,
        ledger TEXT NOT NULL,
        finished_at TEXT,
        recorded_at TEXT NOT NULL
    );

    CREATE INDEX IF NOT EXISTS idx_run_ledgers_graph ON run_ledgers(graph_id);
";

/// SQLite-backed run store. Graphs and ledgers are kept as JSON documents
/// next to a few indexed columns.
pub struct SqliteRunStore {
    conn: Mutex<Connection>,
}

fn db_err(e: rusqlite::Error) -> BraidError {
    BraidError::Database(e.to_string())
}

impl SqliteRunStore {
    /// Open or create a database at the given path.
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                BraidError::Database(format!("Failed to create db directory: {}", e))
            })?;
        }

        let conn = Connection::open(path).map_err(db_err)?;
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL;")
            .map_err(db_err)?;
        conn.execute_batch(SCHEMA).map_err(db_err)?;

        debug!(path = %path.display(), "Run store opened");
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Open an in-memory database (for testing).
    pub fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().map_err(db_err)?;
        conn.execute_batch(SCHEMA).map_err(db_err)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|e| BraidError::Database(e.to_string()))
    }
}

impl RunStore for SqliteRunStore {
    fn save_graph(&self, graph: &Graph) -> BoxFuture<'_, Result<()>> {
        let id = graph.id.clone();
        let name = graph.name.clone();
        let definition = serde_json::to_string(graph);
        Box::pin(async move {
            let definition = definition?;
            let conn = self.lock()?;
            conn.execute(
                "INSERT OR REPLACE INTO graphs (id, name, definition, updated_at)
                 VALUES (?1, ?2, ?3, ?4)",
                params![id, name, definition, Utc::now().to_rfc3339()],
            )
            .map_err(db_err)?;
            debug!(graph_id = %id, "Graph saved");
            Ok(())
        })
    }

    fn load_graph(&self, graph_id: &str) -> BoxFuture<'_, Result<Graph>> {
        let graph_id = graph_id.to_string();
        Box::pin(async move {
            let definition: Option<String> = {
                let conn = self.lock()?;
                conn.query_row(
                    "SELECT definition FROM graphs WHERE id = ?1",
                    params![graph_id],
                    |row| row.get(0),
                )
                .optional()
                .map_err(db_err)?
            };
            match definition {
                Some(json) => Ok(serde_json::from_str(&json)?),
                None => Err(BraidError::GraphNotFound(graph_id)),
            }
        })
    }

    fn list_graphs(&self) -> BoxFuture<'_, Result<Vec<String>>> {
        Box::pin(async move {
            let conn = self.lock()?;
            let mut stmt = conn
                .prepare("SELECT id FROM graphs ORDER BY id")
                .map_err(db_err)?;
            let ids = stmt
                .query_map([], |row| row.get::<_, String>(0))
                .map_err(db_err)?
                .collect::<std::result::Result<Vec<_>, _>>()
                .map_err(db_err)?;
            Ok(ids)
        })
    }

    fn append_ledger(&self, ledger: &RunLedger) -> BoxFuture<'_, Result<()>> {
        let run_id = ledger.run_id.to_string();
        let graph_id = ledger.graph_id.clone();
        let status = ledger.status.as_str();
        let finished_at = ledger.finished_at.map(|t| t.to_rfc3339());
        let json = serde_json::to_string(ledger);
        Box::pin(async move {
            let json = json?;
            let conn = self.lock()?;
            // REPLACE deletes the old row, so a re-recorded run sorts as newest.
            conn.execute(
                "INSERT OR REPLACE INTO run_ledgers
                     (run_id, graph_id, status, ledger, finished_at, recorded_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![run_id, graph_id, status, json, finished_at, Utc::now().to_rfc3339()],
            )
            .map_err(db_err)?;
            debug!(run_id = %run_id, status, "Run ledger stored");
            Ok(())
        })
    }

    fn load_ledger(&self, run_id: &RunId) -> BoxFuture<'_, Result<Option<RunLedger>>> {
        let run_id = run_id.to_string();
        Box::pin(async move {
            let json: Option<String> = {
                let conn = self.lock()?;
                conn.query_row(
                    "SELECT ledger FROM run_ledgers WHERE run_id = ?1",
                    params![run_id],
                    |row| row.get(0),
                )
                .optional()
                .map_err(db_err)?
            };
            json.map(|j| serde_json::from_str(&j).map_err(BraidError::from))
                .transpose()
        })
    }

    fn list_runs(&self, limit: usize) -> BoxFuture<'_, Result<Vec<RunSummary>>> {
        Box::pin(async move {
            let rows: Vec<String> = {
                let conn = self.lock()?;
                let mut stmt = conn
                    .prepare("SELECT ledger FROM run_ledgers ORDER BY rowid DESC LIMIT ?1")
                    .map_err(db_err)?;
                let rows = stmt
                    .query_map(params![limit as i64], |row| row.get::<_, String>(0))
                    .map_err(db_err)?
                    .collect::<std::result::Result<Vec<_>, _>>()
                    .map_err(db_err)?;
                rows
            };
            rows.iter()
                .map(|json| -> Result<RunSummary> {
                    let ledger: RunLedger = serde_json::from_str(json)?;
                    Ok(ledger.summary())
                })
                .collect()
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use braid_core::types::RunStatus;
    use braid_engine::graph::{Block, Edge};

    fn graph(id: &str) -> Graph {
        Graph::new(id, "a")
            .with_name("Sample")
            .with_block(Block::invoking("a", "echo"))
            .with_block(Block::invoking("b", "echo"))
            .with_edge(Edge::always("a", "b"))
    }

    fn ledger(run: &str, status: RunStatus) -> RunLedger {
        let mut l = RunLedger::empty(RunId::from_string(run));
        l.graph_id = "g".into();
        l.status = status;
        l.finished_at = Some(Utc::now());
        l
    }

    #[tokio::test]
    async fn test_graph_roundtrip() {
        let store = SqliteRunStore::in_memory().unwrap();
        store.save_graph(&graph("g2")).await.unwrap();
        store.save_graph(&graph("g1")).await.unwrap();
        assert_eq!(store.load_graph("g1").await.unwrap(), graph("g1"));
        assert_eq!(store.list_graphs().await.unwrap(), vec!["g1", "g2"]);
    }

    #[tokio::test]
    async fn test_missing_graph() {
        let store = SqliteRunStore::in_memory().unwrap();
        assert!(matches!(
            store.load_graph("nope").await,
            Err(BraidError::GraphNotFound(id)) if id == "nope"
        ));
    }

    #[tokio::test]
    async fn test_ledgers_newest_first() {
        let store = SqliteRunStore::in_memory().unwrap();
        store.append_ledger(&ledger("r1", RunStatus::Succeeded)).await.unwrap();
        store.append_ledger(&ledger("r2", RunStatus::Failed)).await.unwrap();
        store.append_ledger(&ledger("r3", RunStatus::Cancelled)).await.unwrap();

        let runs = store.list_runs(2).await.unwrap();
        let ids: Vec<String> = runs.iter().map(|s| s.run_id.to_string()).collect();
        assert_eq!(ids, vec!["r3", "r2"]);
        assert_eq!(runs[1].status, RunStatus::Failed);

        // Re-recording a run replaces it and moves it to the front.
        store.append_ledger(&ledger("r1", RunStatus::Failed)).await.unwrap();
        let runs = store.list_runs(10).await.unwrap();
        assert_eq!(runs.len(), 3);
        assert_eq!(runs[0].run_id.to_string(), "r1");
        assert_eq!(runs[0].status, RunStatus::Failed);
    }

    #[tokio::test]
    async fn test_load_ledger() {
        let store = SqliteRunStore::in_memory().unwrap();
        let original = ledger("r1", RunStatus::Succeeded);
        store.append_ledger(&original).await.unwrap();
        let loaded = store
            .load_ledger(&RunId::from_string("r1"))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(loaded, original);
        assert!(store
            .load_ledger(&RunId::from_string("zz"))
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn test_reopen_persists() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("braid.db");
        {
            let store = SqliteRunStore::open(&path).unwrap();
            store.save_graph(&graph("g")).await.unwrap();
            store.append_ledger(&ledger("r1", RunStatus::Succeeded)).await.unwrap();
        }
        let store = SqliteRunStore::open(&path).unwrap();
        assert_eq!(store.list_graphs().await.unwrap(), vec!["g"]);
        assert_eq!(store.list_runs(5).await.unwrap().len(), 1);
    }
}

//! Run ledgers and their reconstruction from event streams.
//!
//! A [`RunLedger`] is the externally visible record of a run. The executor
//! snapshots it from the live context; [`RunProjection`] rebuilds the same
//! value from the run's events alone, so a consumer that saw every event
//! (duplicates included) ends up with a ledger equal to the engine's.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::warn;

use braid_core::event::{EventKind, RunEvent};
use braid_core::types::{BlockError, BlockId, BlockStatus, CallerIdentity, RunId, RunStatus};

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BlockRecord {
    pub status: BlockStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<BlockError>,
    pub attempts: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
}

/// Final (or current) record of a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunLedger {
    pub run_id: RunId,
    pub graph_id: String,
    pub caller: CallerIdentity,
    pub status: RunStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<BlockError>,
    pub input: Value,
    pub variables: BTreeMap<String, Value>,
    pub blocks: BTreeMap<BlockId, BlockRecord>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
    /// Sequence number of the last event emitted for this run.
    pub last_seq: u64,
}

impl RunLedger {
    pub fn empty(run_id: RunId) -> Self {
        Self {
            run_id,
            graph_id: String::new(),
            caller: CallerIdentity::anonymous(),
            status: RunStatus::Created,
            error: None,
            input: Value::Null,
            variables: BTreeMap::new(),
            blocks: BTreeMap::new(),
            started_at: None,
            finished_at: None,
            last_seq: 0,
        }
    }

    /// Blocks that ended `failed`, sorted by id.
    pub fn failed_blocks(&self) -> Vec<BlockId> {
        self.blocks_with(BlockStatus::Failed)
    }

    pub fn blocks_with(&self, status: BlockStatus) -> Vec<BlockId> {
        self.blocks
            .iter()
            .filter(|(_, b)| b.status == status)
            .map(|(id, _)| id.clone())
            .collect()
    }

    pub fn summary(&self) -> RunSummary {
        let count = |status| self.blocks.values().filter(|b| b.status == status).count();
        RunSummary {
            run_id: self.run_id.clone(),
            graph_id: self.graph_id.clone(),
            status: self.status,
            error: self.error.clone(),
            partial_failures: self.failed_blocks(),
            succeeded: count(BlockStatus::Succeeded),
            failed: count(BlockStatus::Failed),
            skipped: count(BlockStatus::Skipped),
            pending: count(BlockStatus::Pending) + count(BlockStatus::Running),
            started_at: self.started_at,
            finished_at: self.finished_at,
        }
    }
}

/// Compact view of a run for status queries and listings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunSummary {
    pub run_id: RunId,
    pub graph_id: String,
    pub status: RunStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<BlockError>,
    /// Failed blocks of a run that otherwise completed.
    #[serde(default)]
    pub partial_failures: Vec<BlockId>,
    pub succeeded: usize,
    pub failed: usize,
    pub skipped: usize,
    /// Blocks not yet terminal.
    pub pending: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
}

/// Folds a run's events into a ledger.
///
/// Events are applied in sequence order. A redelivered event (sequence at or
/// below the last applied one) is ignored; a jump in sequence is recorded as
/// a gap and applied anyway.
#[derive(Debug, Clone)]
pub struct RunProjection {
    ledger: RunLedger,
    gaps: Vec<(u64, u64)>,
    duplicates: u64,
}

impl RunProjection {
    pub fn new(run_id: RunId) -> Self {
        Self {
            ledger: RunLedger::empty(run_id),
            gaps: Vec::new(),
            duplicates: 0,
        }
    }

    /// Build a projection from a complete event stream.
    pub fn replay<'a>(run_id: RunId, events: impl IntoIterator<Item = &'a RunEvent>) -> Self {
        let mut projection = Self::new(run_id);
        for event in events {
            projection.apply(event);
        }
        projection
    }

    /// Apply one event. Returns false when the event was ignored.
    pub fn apply(&mut self, event: &RunEvent) -> bool {
        if event.run_id != self.ledger.run_id {
            return false;
        }
        if event.seq <= self.ledger.last_seq {
            self.duplicates += 1;
            return false;
        }
        if event.seq > self.ledger.last_seq + 1 {
            self.gaps.push((self.ledger.last_seq + 1, event.seq - 1));
        }
        self.ledger.last_seq = event.seq;

        let payload = &event.payload;
        match event.kind {
            EventKind::RunStarted => self.apply_run_started(payload, event.timestamp),
            EventKind::Started => {
                let record = self.record(event);
                record.status = BlockStatus::Running;
                record.attempts = field_u32(payload, "attempt").unwrap_or(record.attempts + 1);
                record.started_at.get_or_insert(event.timestamp);
            }
            EventKind::Streaming => {}
            EventKind::Succeeded => {
                let record = self.record(event);
                record.status = BlockStatus::Succeeded;
                record.output = payload.get("output").cloned();
                record.error = None;
                record.finished_at = Some(event.timestamp);
                if let Some(attempts) = field_u32(payload, "attempts") {
                    record.attempts = attempts;
                }
                self.bind(payload);
                self.apply_loop_reset(payload);
            }
            EventKind::Failed => {
                let record = self.record(event);
                record.status = BlockStatus::Failed;
                record.error = payload
                    .get("error")
                    .and_then(|e| serde_json::from_value(e.clone()).ok());
                record.output = payload.get("output").cloned();
                record.finished_at = Some(event.timestamp);
                if let Some(attempts) = field_u32(payload, "attempts") {
                    record.attempts = attempts;
                }
                self.bind(payload);
            }
            EventKind::Skipped => {
                let record = self.record(event);
                record.status = BlockStatus::Skipped;
                record.finished_at = Some(event.timestamp);
            }
            EventKind::RunSucceeded | EventKind::RunFailed | EventKind::RunCancelled => {
                self.ledger.status = payload
                    .get("status")
                    .and_then(|s| serde_json::from_value(s.clone()).ok())
                    .unwrap_or(match event.kind {
                        EventKind::RunSucceeded => RunStatus::Succeeded,
                        EventKind::RunCancelled => RunStatus::Cancelled,
                        _ => RunStatus::Failed,
                    });
                self.ledger.error = payload
                    .get("error")
                    .and_then(|e| serde_json::from_value(e.clone()).ok());
                self.ledger.finished_at = Some(event.timestamp);
            }
        }
        true
    }

    fn apply_run_started(&mut self, payload: &Value, at: DateTime<Utc>) {
        let ledger = &mut self.ledger;
        ledger.status = RunStatus::Running;
        ledger.started_at = Some(at);
        if let Some(graph_id) = payload.get("graph_id").and_then(Value::as_str) {
            ledger.graph_id = graph_id.to_string();
        }
        if let Some(caller) = payload.get("caller").and_then(Value::as_str) {
            ledger.caller = CallerIdentity::new(caller);
        }
        ledger.input = payload.get("input").cloned().unwrap_or(Value::Null);
        if let Some(obj) = ledger.input.as_object() {
            ledger
                .variables
                .extend(obj.iter().map(|(k, v)| (k.clone(), v.clone())));
        }
        if let Some(ids) = payload.get("blocks").and_then(Value::as_array) {
            for id in ids.iter().filter_map(Value::as_str) {
                ledger.blocks.entry(id.to_string()).or_default();
            }
        }
    }

    fn apply_loop_reset(&mut self, payload: &Value) {
        let Some(reset) = payload.pointer("/loop/reset").and_then(Value::as_array) else {
            return;
        };
        for id in reset.iter().filter_map(Value::as_str) {
            self.ledger
                .blocks
                .insert(id.to_string(), BlockRecord::default());
        }
    }

    fn bind(&mut self, payload: &Value) {
        if let Some(bindings) = payload.get("bindings").and_then(Value::as_object) {
            self.ledger
                .variables
                .extend(bindings.iter().map(|(k, v)| (k.clone(), v.clone())));
        }
    }

    fn record(&mut self, event: &RunEvent) -> &mut BlockRecord {
        let id = match &event.block_id {
            Some(id) => id.clone(),
            None => {
                warn!(run_id = %event.run_id, seq = event.seq, kind = %event.kind, "Block event without block id");
                String::new()
            }
        };
        self.ledger.blocks.entry(id).or_default()
    }

    pub fn ledger(&self) -> &RunLedger {
        &self.ledger
    }

    pub fn into_ledger(self) -> RunLedger {
        self.ledger
    }

    /// Missing sequence ranges, inclusive.
    pub fn gaps(&self) -> &[(u64, u64)] {
        &self.gaps
    }

    pub fn duplicates(&self) -> u64 {
        self.duplicates
    }

    pub fn is_complete(&self) -> bool {
        self.ledger.status.is_terminal()
    }
}

fn field_u32(payload: &Value, key: &str) -> Option<u32> {
    payload
        .get(key)
        .and_then(Value::as_u64)
        .and_then(|n| u32::try_from(n).ok())
}

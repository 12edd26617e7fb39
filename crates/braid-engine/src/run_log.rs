use std::collections::HashMap;
use std::path::{Path, PathBuf};

use tokio::io::{AsyncWriteExt, BufWriter};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use braid_core::config::LogConfig;
use braid_core::error::Result;
use braid_core::event::{EventBus, EventKind, RunEvent};
use braid_core::types::RunId;

/// JSONL run logger.
///
/// Subscribes to the EventBus and appends each run's events to
/// `{log_dir}/{run_id}.jsonl`, one event per line. Lines are the events
/// themselves, so a complete log can be replayed into a ledger.
pub struct RunLogger {
    log_dir: PathBuf,
    level: u8,
}

impl RunLogger {
    /// `level` controls verbosity: 1 = run lifecycle, 2 = + block lifecycle,
    /// 3 = + streaming chunks.
    pub fn new(log_dir: PathBuf, level: u8) -> Self {
        Self { log_dir, level }
    }

    pub fn from_config(config: &LogConfig) -> Self {
        Self::new(config.resolved_dir(), config.level)
    }

    pub fn path_for(&self, run_id: &RunId) -> PathBuf {
        self.log_dir.join(format!("{}.jsonl", run_id))
    }

    /// Subscribe now and log on a background task until `cancel` fires.
    /// Subscribing before any run starts guarantees no event is missed.
    pub fn spawn(self, bus: &EventBus, cancel: CancellationToken) -> JoinHandle<()> {
        let rx = bus.subscribe();
        tokio::spawn(self.run(rx, cancel))
    }

    /// Write events until cancelled or the bus closes. Events already queued
    /// when cancellation fires are still written.
    pub async fn run(self, mut rx: broadcast::Receiver<RunEvent>, cancel: CancellationToken) {
        if let Err(e) = tokio::fs::create_dir_all(&self.log_dir).await {
            error!(error = %e, "Failed to create log directory");
            return;
        }
        info!(dir = %self.log_dir.display(), level = self.level, "RunLogger started");

        let mut writers: HashMap<RunId, BufWriter<tokio::fs::File>> = HashMap::new();
        loop {
            let event = tokio::select! {
                biased;
                result = rx.recv() => match result {
                    Ok(event) => event,
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        debug!(skipped = n, "RunLogger lagged, skipped events");
                        continue;
                    }
                    Err(broadcast::error::RecvError::Closed) => {
                        debug!("EventBus closed, RunLogger stopping");
                        break;
                    }
                },
                _ = cancel.cancelled() => {
                    debug!("RunLogger cancelled");
                    break;
                }
            };

            if !self.should_log(event.kind) {
                continue;
            }
            if let Err(e) = self.write(&mut writers, &event).await {
                error!(run_id = %event.run_id, error = %e, "Failed to write log entry");
                continue;
            }
            if event.kind.is_run_terminal() {
                if let Some(mut writer) = writers.remove(&event.run_id) {
                    writer.flush().await.ok();
                }
            }
        }

        for (_, mut writer) in writers {
            writer.flush().await.ok();
        }
        debug!("RunLogger finished");
    }

    async fn write(
        &self,
        writers: &mut HashMap<RunId, BufWriter<tokio::fs::File>>,
        event: &RunEvent,
    ) -> Result<()> {
        if !writers.contains_key(&event.run_id) {
            let path = self.path_for(&event.run_id);
            let file = tokio::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(&path)
                .await?;
            debug!(path = %path.display(), "Opened run log");
            writers.insert(event.run_id.clone(), BufWriter::new(file));
        }
        let Some(writer) = writers.get_mut(&event.run_id) else {
            return Ok(());
        };
        let mut line = serde_json::to_string(event)?;
        line.push('\n');
        writer.write_all(line.as_bytes()).await?;
        // Flush after each entry for crash resilience
        writer.flush().await?;
        Ok(())
    }

    fn should_log(&self, kind: EventKind) -> bool {
        match kind {
            EventKind::RunStarted
            | EventKind::RunSucceeded
            | EventKind::RunFailed
            | EventKind::RunCancelled => true,
            EventKind::Streaming => self.level >= 3,
            _ => self.level >= 2,
        }
    }
}

/// Read a JSONL event log. Blank lines are ignored.
pub async fn read_events(path: &Path) -> Result<Vec<RunEvent>> {
    let text = tokio::fs::read_to_string(path).await?;
    text.lines()
        .filter(|l| !l.trim().is_empty())
        .map(|l| Ok(serde_json::from_str(l)?))
        .collect()
}

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{bail, Context};
use clap::{CommandFactory, Parser, Subcommand};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use braid_capabilities::CapabilityRegistry;
use braid_core::config::{AppConfig, RunConfig};
use braid_core::event::{EventBus, RunEvent};
use braid_core::traits::EventSink;
use braid_core::types::{CallerIdentity, RunId, RunStatus};
use braid_engine::run_log::read_events;
use braid_engine::{Engine, Graph, RunLogger, RunProjection, RunStore, RunSummary};
use braid_store::SqliteRunStore;

#[derive(Parser)]
#[command(name = "braid", version, about = "Workflow execution engine for capability graphs")]
struct Cli {
    /// Path to config file
    #[arg(short, long, default_value = "braid.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Check a graph definition without running it
    Validate {
        /// Graph definition (JSON)
        graph: PathBuf,
    },
    /// Run a graph definition and print the run summary
    Run {
        /// Graph definition (JSON)
        graph: PathBuf,
        #[command(flatten)]
        opts: RunOpts,
    },
    /// Run a graph previously imported into the store
    RunStored {
        /// Stored graph id
        graph_id: String,
        #[command(flatten)]
        opts: RunOpts,
    },
    /// Validate a graph and save it to the store
    Import {
        /// Graph definition (JSON)
        graph: PathBuf,
    },
    /// List recently finished runs
    History {
        /// Maximum number of runs to show
        #[arg(long, default_value = "20")]
        limit: usize,
    },
    /// Rebuild a run ledger from a JSONL event log
    Replay {
        /// Event log written by the run logger
        events: PathBuf,
    },
    /// List registered capabilities
    Capabilities,
    /// Generate shell completions
    Completions {
        /// Shell to generate completions for
        #[arg(value_enum)]
        shell: clap_complete::Shell,
    },
}

#[derive(clap::Args)]
struct RunOpts {
    /// Run input as a JSON document
    #[arg(long, default_value = "{}")]
    input: String,
    /// Identity the run is attributed to
    #[arg(long, default_value = "anonymous")]
    caller: String,
    /// Print every run event as a JSON line while the run executes
    #[arg(long)]
    events: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("braid=info,warn")),
        )
        .with_target(false)
        .init();

    let cli = Cli::parse();

    // Commands that need neither config nor engine
    match &cli.command {
        Commands::Completions { shell } => {
            let mut cmd = Cli::command();
            clap_complete::generate(*shell, &mut cmd, "braid", &mut std::io::stdout());
            return Ok(());
        }
        Commands::Validate { graph } => return validate(graph),
        Commands::Replay { events } => return replay(events).await,
        _ => {}
    }

    let config = AppConfig::load_or_default(&cli.config)
        .with_context(|| format!("loading {}", cli.config.display()))?;

    let store: Option<Arc<dyn RunStore>> = match &config.store {
        Some(store_config) => {
            let path = store_config.resolved_path();
            let store = SqliteRunStore::open(&path)?;
            info!(path = %path.display(), "Run store ready");
            Some(Arc::new(store))
        }
        None => None,
    };

    let registry = CapabilityRegistry::with_builtins();
    let bus = Arc::new(EventBus::default());
    let shutdown = CancellationToken::new();
    let logger = match &config.log {
        Some(log) if log.enabled => {
            Some(RunLogger::from_config(log).spawn(&bus, shutdown.clone()))
        }
        _ => None,
    };

    let sink: Arc<dyn EventSink> = bus.clone();
    let mut engine = Engine::new(Arc::new(registry), sink);
    if let Some(store) = &store {
        engine = engine.with_store(store.clone());
    }

    let result = match cli.command {
        Commands::Run { graph, opts } => {
            let graph = read_graph(&graph)?;
            execute(&engine, &bus, &config.run, opts, |input, caller, run| {
                Ok(engine.start(graph, input, caller, run)?)
            })
            .await
        }
        Commands::RunStored { graph_id, opts } => {
            let graph = require_store(&store)?.load_graph(&graph_id).await?;
            execute(&engine, &bus, &config.run, opts, |input, caller, run| {
                Ok(engine.start(graph, input, caller, run)?)
            })
            .await
        }
        Commands::Import { graph } => {
            let store = require_store(&store)?;
            let graph = read_graph(&graph)?;
            let validated = graph.clone().validate()?;
            store.save_graph(&graph).await?;
            println!(
                "Imported {} ({} blocks, {} edges)",
                graph.id,
                validated.len(),
                validated.edges().len()
            );
            Ok(())
        }
        Commands::History { limit } => {
            let store = require_store(&store)?;
            let runs = store.list_runs(limit).await?;
            if runs.is_empty() {
                println!("No runs recorded.");
            }
            for run in runs {
                print_summary_line(&run);
            }
            Ok(())
        }
        Commands::Capabilities => {
            for info in engine.registry().infos() {
                let stream = if info.streaming { " (streaming)" } else { "" };
                println!("{:<14} {}{}", info.name, info.description, stream);
            }
            Ok(())
        }
        Commands::Validate { .. } | Commands::Replay { .. } | Commands::Completions { .. } => {
            unreachable!("handled before config load")
        }
    };

    shutdown.cancel();
    if let Some(handle) = logger {
        handle.await.ok();
    }
    result
}

fn require_store(store: &Option<Arc<dyn RunStore>>) -> anyhow::Result<&Arc<dyn RunStore>> {
    store
        .as_ref()
        .context("this command needs a [store] section in the config file")
}

fn read_graph(path: &Path) -> anyhow::Result<Graph> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("reading {}", path.display()))?;
    let graph: Graph = serde_json::from_str(&text)
        .with_context(|| format!("parsing {}", path.display()))?;
    Ok(graph)
}

fn validate(path: &Path) -> anyhow::Result<()> {
    let graph = read_graph(path)?;
    let validated = graph.validate()?;
    println!(
        "{} is valid: {} blocks, {} edges, {} loop regions",
        validated.id(),
        validated.len(),
        validated.edges().len(),
        validated.loops().len()
    );
    Ok(())
}

/// Start a run, optionally echo its events, and wait for it to finish.
async fn execute<F>(
    engine: &Engine,
    bus: &EventBus,
    run_config: &RunConfig,
    opts: RunOpts,
    start: F,
) -> anyhow::Result<()>
where
    F: FnOnce(serde_json::Value, CallerIdentity, RunConfig) -> anyhow::Result<RunId>,
{
    let input: serde_json::Value =
        serde_json::from_str(&opts.input).context("--input must be a JSON document")?;

    // Subscribe before the run starts so its first events are not missed.
    let rx = opts.events.then(|| bus.subscribe());
    let run_id = start(input, CallerIdentity::new(opts.caller), run_config.clone())?;
    let printer = rx.map(|rx| print_events(rx, run_id.clone()));

    let summary = engine.wait(&run_id).await?;
    if let Some(printer) = printer {
        printer.await.ok();
    }

    println!("{}", serde_json::to_string_pretty(&summary)?);
    match summary.status {
        RunStatus::Succeeded => Ok(()),
        RunStatus::SucceededWithFailures => {
            warn!(run_id = %run_id, failed = ?summary.partial_failures, "Run finished with failed blocks");
            Ok(())
        }
        status => bail!("run {} {}", run_id, status),
    }
}

fn print_events(mut rx: broadcast::Receiver<RunEvent>, run_id: RunId) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            match rx.recv().await {
                Ok(event) if event.run_id == run_id => {
                    if let Ok(line) = serde_json::to_string(&event) {
                        println!("{}", line);
                    }
                    if event.kind.is_run_terminal() {
                        break;
                    }
                }
                Ok(_) => {}
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    warn!(skipped = n, "Event printer lagged");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    })
}

async fn replay(path: &Path) -> anyhow::Result<()> {
    let events = read_events(path).await?;
    let Some(first) = events.first() else {
        bail!("{} contains no events", path.display());
    };
    let projection = RunProjection::replay(first.run_id.clone(), &events);
    for (from, to) in projection.gaps() {
        warn!(from, to, "Sequence gap in event log");
    }
    if projection.duplicates() > 0 {
        info!(duplicates = projection.duplicates(), "Ignored redelivered events");
    }
    if !projection.is_complete() {
        warn!("Event log ends before the run finished");
    }
    println!("{}", serde_json::to_string_pretty(projection.ledger())?);
    Ok(())
}

fn print_summary_line(run: &RunSummary) {
    let finished = run
        .finished_at
        .map(|t| t.format("%Y-%m-%d %H:%M:%S").to_string())
        .unwrap_or_else(|| "-".into());
    println!(
        "{}  {:<24} {:<24} {:>3} ok {:>3} failed {:>3} skipped  {}",
        run.run_id, run.graph_id, run.status, run.succeeded, run.failed, run.skipped, finished
    );
}

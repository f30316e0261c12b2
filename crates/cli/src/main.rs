mod config;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use db::Store;
use events::{EventBus, EventQuery, LifecycleEvent};
use hive_core::{CreateTaskRequest, ExecutionPlan, PlanningEntry, TaskStatus};
use orchestrator::{CommandWorker, Queen};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};
use uuid::Uuid;

use config::HiveConfig;

const EVENT_SOURCE: &str = "cli";

#[derive(Parser)]
#[command(name = "hive")]
#[command(about = "Workflow-driven task orchestrator", long_about = None)]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Config file (defaults to $HIVE_CONFIG, then ./hive.toml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Log as JSON lines
    #[arg(long, global = true)]
    json: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Write a default config and create the database
    Init,
    /// Start the Queen
    Run {
        /// Stop once nothing is running or eligible
        #[arg(long)]
        once: bool,
    },
    /// Queue a task from a JSON file
    Submit {
        #[arg(short, long)]
        file: PathBuf,
    },
    /// Ingest an execution plan from a JSON file
    Plan {
        #[arg(short, long)]
        file: PathBuf,
    },
    /// Record a worker's structured result on its open run
    Report {
        #[arg(long, env = "HIVE_RUN_ID")]
        run_id: Uuid,
        /// JSON document
        #[arg(long)]
        result: String,
    },
    /// Query the event log
    Events {
        #[arg(long = "type")]
        event_type: Option<String>,
        #[arg(long)]
        correlation_id: Option<String>,
        #[arg(long, default_value_t = 50)]
        limit: usize,
    },
    /// Task counts and the current queue
    Status,
    /// Requeue tasks stuck in progress whose runs stopped heartbeating
    Reclaim {
        #[arg(long, default_value_t = 3600)]
        older_than_secs: u64,
    },
}

/// Plan file accepted by `hive plan`.
#[derive(Debug, Deserialize)]
struct PlanDocument {
    name: String,
    #[serde(default)]
    request: String,
    subtasks: Vec<PlanningEntry>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.json);

    let config_path = HiveConfig::resolve_path(cli.config);
    let config = HiveConfig::load(&config_path).await?;

    match cli.command {
        Commands::Init => init(&config_path, &config).await,
        Commands::Run { once } => run(&config, once).await,
        Commands::Submit { file } => submit(&config, &file).await,
        Commands::Plan { file } => plan(&config, &file).await,
        Commands::Report { run_id, result } => report(&config, run_id, &result).await,
        Commands::Events {
            event_type,
            correlation_id,
            limit,
        } => list_events(&config, event_type, correlation_id, limit).await,
        Commands::Status => status(&config).await,
        Commands::Reclaim { older_than_secs } => {
            reclaim(&config, Duration::from_secs(older_than_secs)).await
        }
    }
}

async fn open(config: &HiveConfig) -> Result<(Store, EventBus)> {
    let store = Store::connect(&config.database.url)
        .await
        .with_context(|| format!("Failed to open database {}", config.database.url))?;
    let bus = EventBus::new(Arc::new(store.events.clone()));
    Ok((store, bus))
}

async fn read_json<T: serde::de::DeserializeOwned>(path: &Path) -> Result<T> {
    let content = tokio::fs::read_to_string(path)
        .await
        .with_context(|| format!("Failed to read {}", path.display()))?;
    serde_json::from_str(&content).with_context(|| format!("Invalid JSON in {}", path.display()))
}

async fn init(config_path: &Path, config: &HiveConfig) -> Result<()> {
    if tokio::fs::try_exists(config_path).await.unwrap_or(false) {
        println!("Using existing config {}", config_path.display());
    } else {
        config.save(config_path).await?;
        println!("Wrote {}", config_path.display());
    }

    open(config).await?;
    println!("Database ready at {}", config.database.url);
    Ok(())
}

async fn run(config: &HiveConfig, once: bool) -> Result<()> {
    let (store, bus) = open(config).await?;
    let worker = CommandWorker::new(config.queen.shell.clone())
        .with_database_url(config.database.url.clone());
    let mut queen = Queen::new(
        Arc::new(store),
        bus,
        Arc::new(worker),
        config.queen.to_queen_config(),
    );

    if once {
        queen.run_until_idle().await?;
        return Ok(());
    }

    let shutdown = CancellationToken::new();
    let trigger = shutdown.clone();
    tokio::spawn(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to listen for Ctrl+C");
            return;
        }
        tracing::info!("Shutdown requested");
        trigger.cancel();
    });

    queen.run(shutdown).await?;
    Ok(())
}

async fn submit(config: &HiveConfig, file: &Path) -> Result<()> {
    let request: CreateTaskRequest = read_json(file).await?;
    let (store, bus) = open(config).await?;

    let task = orchestrator::submit_task(&store, &bus, EVENT_SOURCE, request).await?;
    println!("{}", task.id);
    Ok(())
}

async fn plan(config: &HiveConfig, file: &Path) -> Result<()> {
    let document: PlanDocument = read_json(file).await?;
    let (store, bus) = open(config).await?;

    let plan = ExecutionPlan::new(document.name, document.request);
    let tasks =
        orchestrator::ingest_plan(&store, &bus, EVENT_SOURCE, &plan, &document.subtasks).await?;

    println!("Plan {} ({} subtasks)", plan.id, tasks.len());
    for task in &tasks {
        let subtask_id = task
            .subtask_ref()
            .map(|reference| reference.subtask_id)
            .unwrap_or_default();
        println!("  {}  {}  {}", task.id, subtask_id, task.title);
    }
    Ok(())
}

async fn report(config: &HiveConfig, run_id: Uuid, result: &str) -> Result<()> {
    let result: serde_json::Value =
        serde_json::from_str(result).context("--result must be a JSON document")?;
    let (store, _) = open(config).await?;

    if !store.runs.record_result(run_id, &result).await? {
        bail!("run {} has already finished", run_id);
    }
    Ok(())
}

async fn list_events(
    config: &HiveConfig,
    event_type: Option<String>,
    correlation_id: Option<String>,
    limit: usize,
) -> Result<()> {
    let (_, bus) = open(config).await?;

    let mut query = EventQuery::new().limit(limit);
    if let Some(event_type) = event_type {
        query = query.event_type(event_type);
    }
    if let Some(correlation_id) = correlation_id {
        query = query.correlation_id(correlation_id);
    }

    for event in bus.query(&query).await? {
        println!("{}", serde_json::to_string(&event)?);
    }
    Ok(())
}

async fn status(config: &HiveConfig) -> Result<()> {
    let (store, _) = open(config).await?;

    let counts = store.tasks.count_by_status().await?;
    if counts.is_empty() {
        println!("No tasks yet.");
        return Ok(());
    }

    println!();
    for (status, count) in &counts {
        println!("  {:<15} {}", status.as_str(), count);
    }
    println!();

    for task in store.tasks.find_all(None).await? {
        if task.status.is_terminal() {
            continue;
        }
        let icon = match task.status {
            TaskStatus::Queued => "○",
            TaskStatus::InProgress => "◑",
            _ => "◕",
        };
        println!(
            "  {} [{}] {} ({}) {}",
            icon,
            task.status,
            task.id,
            task.current_phase.as_deref().unwrap_or("-"),
            task.title
        );
    }
    println!();
    Ok(())
}

async fn reclaim(config: &HiveConfig, older_than: Duration) -> Result<()> {
    config.queen.check_reclaim_threshold(older_than)?;
    let (store, bus) = open(config).await?;

    let requeued = store.requeue_stale(older_than).await?;
    for task in &requeued {
        let event = LifecycleEvent::TaskRequeued {
            task_id: task.id,
            phase: task.current_phase.clone(),
            reason: "abandoned".to_string(),
        };
        if let Err(e) = bus.emit(EVENT_SOURCE, event).await {
            tracing::warn!(task_id = %task.id, error = %e, "Failed to publish event");
        }
    }

    println!("Requeued {} task(s)", requeued.len());
    Ok(())
}

fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let registry = tracing_subscriber::registry().with(filter);

    if json {
        registry
            .with(tracing_subscriber::fmt::layer().json().with_writer(std::io::stderr))
            .init();
    } else {
        registry
            .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
            .init();
    }
}

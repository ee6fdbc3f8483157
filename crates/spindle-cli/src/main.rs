//! spindle - スケジューラの CLI
//!
//! - `run`: SQLite store に対してデモ用ワークロードを流す
//! - `status`: status ごとの行数と最近の行（読み取りのみ）
//! - `recover`: recovery loader だけを実行

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use serde::Deserialize;
use serde_json::{Value, json};
use spindle_core::observability::StatusCounts;
use spindle_core::ports::{SystemClock, TaskFilter, TaskStore};
use spindle_core::{
    CacheSpec, CallArgs, SchedulerBuilder, SchedulerConfig, SqliteTaskStore, Submission,
    TaskStatus,
};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "spindle", about = "Persistent, rate-limited job scheduler")]
struct Cli {
    /// TOML file with scheduler settings (SPINDLE_* variables override it).
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// SQLite database holding the task rows (default: `spindle.db`).
    #[arg(long, global = true, env = "SPINDLE_DB")]
    db: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Submit a batch of simulated LLM calls and wait for them.
    Run {
        #[arg(long, default_value_t = 8)]
        tasks: usize,
        /// Simulated latency of one call, in milliseconds.
        #[arg(long, default_value_t = 200)]
        latency_ms: u64,
    },
    /// Print row counts per status and the most recent rows.
    Status {
        #[arg(long, default_value_t = 10)]
        limit: usize,
    },
    /// Fail every unfinished row left by a previous process.
    Recover,
}

/// Layout of the `--config` file.
///
/// ```toml
/// db = "tasks.db"
///
/// [scheduler]
/// num_workers = 4
/// rate_limit_per_minute = 60
/// cutoff = 120.0
/// ```
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct FileConfig {
    db: Option<PathBuf>,
    scheduler: SchedulerConfig,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();
    let file = load_file(cli.config.as_deref())?;
    let db = cli
        .db
        .or(file.db)
        .unwrap_or_else(|| PathBuf::from("spindle.db"));

    match cli.command {
        Command::Run { tasks, latency_ms } => {
            let config = file.scheduler.merge_lookup(|name| std::env::var(name).ok())?;
            config.validate()?;
            run(&db, config, tasks, Duration::from_millis(latency_ms)).await
        }
        Command::Status { limit } => status(&db, limit).await,
        Command::Recover => recover(&db).await,
    }
}

fn load_file(path: Option<&Path>) -> Result<FileConfig> {
    let Some(path) = path else {
        return Ok(FileConfig::default());
    };
    let raw =
        std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    toml::from_str(&raw).with_context(|| format!("parsing {}", path.display()))
}

fn open_store(db: &Path) -> Result<SqliteTaskStore> {
    SqliteTaskStore::open(db).with_context(|| format!("opening {}", db.display()))
}

async fn run(db: &Path, config: SchedulerConfig, tasks: usize, latency: Duration) -> Result<()> {
    let scheduler = SchedulerBuilder::new()
        .config(config)
        .store(open_store(db)?)
        .renderer("summary-prompt", |call: &CallArgs| -> Result<Value, String> {
            let style = call.arg(0).and_then(Value::as_str).ok_or("missing style")?;
            let text = call.arg(1).and_then(Value::as_str).ok_or("missing text")?;
            Ok(json!(format!("Summarize in a {style} tone:\n{text}")))
        })
        .build()
        .await?;

    let report = scheduler.recovery_report();
    if report.scanned > 0 {
        warn!(failed = report.failed, "previous run left unfinished tasks");
    }

    let summarize = move |call: CallArgs| -> Result<Value, String> {
        let prompt = call.arg(0).and_then(Value::as_str).ok_or("missing prompt")?;
        std::thread::sleep(latency);
        Ok(json!({ "chars": prompt.len(), "summary": prompt.lines().last() }))
    };

    let mut handles = Vec::with_capacity(tasks);
    for n in 0..tasks {
        let submission = Submission::new("summarize", summarize)
            .arg("concise")
            .arg(format!("document #{n}"))
            .deferred_kwarg("prompt", "summary-prompt")
            .cache(CacheSpec::positions([0]).with_keyword("prompt"));
        handles.push(scheduler.submit(submission).await?);
    }
    info!(tasks, "submitted");

    let wait_all = async {
        for (id, handle) in handles {
            match handle.await {
                Ok(value) => info!(task_id = %id, result = %value, "done"),
                Err(err) => warn!(task_id = %id, error = %err, "task did not complete"),
            }
        }
    };
    tokio::select! {
        _ = wait_all => {}
        _ = tokio::signal::ctrl_c() => warn!("interrupted"),
    }

    let snapshot = scheduler.snapshot().await?;
    scheduler.stop().await;
    println!("{}", serde_json::to_string_pretty(&snapshot)?);
    Ok(())
}

async fn status(db: &Path, limit: usize) -> Result<()> {
    let store = open_store(db)?;
    let mut counts = StatusCounts::default();
    for status in TaskStatus::ALL {
        counts.set(status, store.count(&TaskFilter::status(status)).await?);
    }
    println!("{}", serde_json::to_string_pretty(&counts)?);

    let rows = store.find(&TaskFilter::all()).await?;
    for row in rows.iter().rev().take(limit) {
        println!(
            "{}  {:<11}  {:<16}  {}",
            row.id,
            row.status.as_str(),
            row.function_key,
            row.error.as_deref().or(row.result_json.as_deref()).unwrap_or("-"),
        );
    }
    Ok(())
}

async fn recover(db: &Path) -> Result<()> {
    let store = open_store(db)?;
    let report = spindle_core::app::recover(&store, &SystemClock).await?;
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}

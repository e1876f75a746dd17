//! # QQBot — task scheduler daemon and administration CLI
//!
//! Usage:
//!   qqbot run                                              # Start the scheduler loop
//!   qqbot add-periodic --name news --command "..." --every-secs 3600
//!   qqbot add-once --name reminder --command "..." --in-secs 600
//!   qqbot list                                             # Show all tasks
//!   qqbot pause <id> / resume <id> / remove <id>
//!   qqbot stats                                            # Execution statistics
//!
//! Administration commands edit the task file directly; run them while the
//! daemon is stopped, since the daemon keeps its own in-memory copy.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use clap::{Args, Parser, Subcommand};
use qqbot_core::QqBotConfig;
use qqbot_scheduler::{
    CreateTaskParams, PeriodicConfig, SchedulerEngine, ShellExecutor, Task, TaskType,
};
use tokio::sync::broadcast::error::RecvError;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(
    name = "qqbot",
    version,
    about = "🤖 QQBot — task scheduler daemon and administration CLI"
)]
struct Cli {
    /// Config file (default: ~/.qqbot/config.toml)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Override the task storage file
    #[arg(long)]
    storage: Option<String>,

    /// Verbose logging
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the scheduler loop until Ctrl-C
    Run,
    /// Create a repeating task
    AddPeriodic {
        #[arg(long)]
        name: String,
        /// Command passed to the executor
        #[arg(long)]
        command: String,
        /// Seconds between runs
        #[arg(long)]
        every_secs: u64,
        /// Run on the next tick instead of one interval from now
        #[arg(long)]
        run_immediately: bool,
        /// Complete the task after this many runs
        #[arg(long)]
        max_runs: Option<u32>,
        /// Stop rescheduling after the first failed run
        #[arg(long)]
        stop_on_error: bool,
        #[command(flatten)]
        common: CommonTaskArgs,
    },
    /// Create a one-shot task
    AddOnce {
        #[arg(long)]
        name: String,
        #[arg(long)]
        command: String,
        /// RFC 3339 timestamp or local "YYYY-MM-DD HH:MM"
        #[arg(long, conflicts_with = "in_secs")]
        at: Option<String>,
        /// Seconds from now
        #[arg(long)]
        in_secs: Option<u64>,
        #[command(flatten)]
        common: CommonTaskArgs,
    },
    /// List all tasks
    List {
        /// Print raw JSON
        #[arg(long)]
        json: bool,
    },
    /// Show one task with its history
    Show { id: String },
    /// Delete a task
    Remove { id: String },
    /// Enable a task
    Enable { id: String },
    /// Disable a task
    Disable { id: String },
    /// Pause a task
    Pause { id: String },
    /// Resume a paused, cancelled or failed task
    Resume { id: String },
    /// Print execution statistics
    Stats,
}

#[derive(Args)]
struct CommonTaskArgs {
    #[arg(long, default_value = "")]
    description: String,
    /// Requesting principal
    #[arg(long, default_value = "cli")]
    created_by: String,
    /// QQ user/group to notify on completion
    #[arg(long)]
    notify: Option<String>,
    /// Save output to a result file
    #[arg(long)]
    save_result: bool,
    /// Result directory for this task
    #[arg(long)]
    result_dir: Option<String>,
    /// Per-task timeout in seconds
    #[arg(long)]
    timeout_secs: Option<u64>,
}

impl CommonTaskArgs {
    fn apply(self, mut params: CreateTaskParams) -> CreateTaskParams {
        params = params.with_description(&self.description);
        if let Some(target) = &self.notify {
            params = params.with_notify(target);
        }
        if self.save_result {
            params = params.with_save_result(self.result_dir.as_deref());
        }
        if let Some(secs) = self.timeout_secs {
            params = params.with_timeout(Duration::from_secs(secs));
        }
        params
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut config = match &cli.config {
        Some(path) => QqBotConfig::load_from(path)?,
        None => QqBotConfig::load()?,
    };
    if let Some(storage) = &cli.storage {
        config.scheduler.storage_path = storage.clone();
    }

    // Initialize logging
    let level = if cli.verbose {
        "qqbot=debug,qqbot_scheduler=debug,qqbot_core=debug".to_string()
    } else {
        config.logging.level.clone()
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    if config.logging.json {
        tracing_subscriber::fmt().json().with_env_filter(filter).init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(false)
            .init();
    }

    let engine = Arc::new(SchedulerEngine::from_config(
        &config.scheduler,
        Arc::new(ShellExecutor::new()),
    ));

    match cli.command {
        Commands::Run => run_daemon(engine, config.scheduler.enabled).await?,
        Commands::AddPeriodic {
            name,
            command,
            every_secs,
            run_immediately,
            max_runs,
            stop_on_error,
            common,
        } => {
            if every_secs == 0 {
                bail!("--every-secs must be greater than zero");
            }
            let periodic = PeriodicConfig {
                run_immediately,
                max_runs,
                continue_on_error: !stop_on_error,
                ..PeriodicConfig::every(Duration::from_secs(every_secs))
            };
            let params =
                CreateTaskParams::periodic(&name, &command, &common.created_by, periodic);
            let task = create(&engine, common.apply(params)).await?;
            println!(
                "✅ Created periodic task {} (next run {})",
                task.id,
                format_time(task.next_execution_time)
            );
        }
        Commands::AddOnce {
            name,
            command,
            at,
            in_secs,
            common,
        } => {
            let when = match (at, in_secs) {
                (Some(at), _) => parse_time(&at)?,
                (None, Some(secs)) => {
                    chrono::Utc::now().timestamp_millis() + (secs as i64) * 1000
                }
                (None, None) => bail!("one of --at or --in-secs is required"),
            };
            let params = CreateTaskParams::scheduled(&name, &command, &common.created_by, when);
            let task = create(&engine, common.apply(params)).await?;
            println!(
                "✅ Created one-shot task {} at {}",
                task.id,
                format_time(task.next_execution_time)
            );
        }
        Commands::List { json } => {
            let store = engine.store();
            let store = store.lock().await;
            if json {
                println!("{}", serde_json::to_string_pretty(store.all_tasks())?);
            } else if store.is_empty() {
                println!("No tasks.");
            } else {
                for task in store.all_tasks() {
                    print_task_line(task);
                }
            }
        }
        Commands::Show { id } => {
            let store = engine.store();
            let store = store.lock().await;
            let task = store.get_task(&id).with_context(|| format!("task {id} not found"))?;
            println!("{}", serde_json::to_string_pretty(task)?);
        }
        Commands::Remove { id } => {
            let removed = engine.store().lock().await.delete_task(&id)?;
            report(removed, "Removed", &id);
        }
        Commands::Enable { id } => report(engine.set_enabled(&id, true).await?, "Enabled", &id),
        Commands::Disable { id } => report(engine.set_enabled(&id, false).await?, "Disabled", &id),
        Commands::Pause { id } => report(engine.pause_task(&id).await?, "Paused", &id),
        Commands::Resume { id } => report(engine.resume_task(&id).await?, "Resumed", &id),
        Commands::Stats => {
            let stats = engine.store().lock().await.statistics();
            println!("{}", serde_json::to_string_pretty(&stats)?);
        }
    }

    Ok(())
}

async fn run_daemon(engine: Arc<SchedulerEngine>, enabled: bool) -> Result<()> {
    if !enabled {
        tracing::warn!("⚠️ Scheduler is disabled in config, nothing to run");
        return Ok(());
    }

    println!("🤖 QQBot scheduler v{}", env!("CARGO_PKG_VERSION"));
    let mut rx = engine.subscribe();
    let reporter = tokio::spawn(async move {
        loop {
            match rx.recv().await {
                Ok(n) if n.should_deliver() => {
                    let target = n.notify_target.as_deref().unwrap_or_default();
                    tracing::info!("📨 [{}] {}", target, n.summary());
                }
                Ok(n) => tracing::info!("📣 {}", n.summary()),
                Err(RecvError::Lagged(skipped)) => {
                    tracing::warn!("⚠️ Notification reporter skipped {skipped} messages");
                }
                Err(RecvError::Closed) => break,
            }
        }
    });

    let handle = Arc::clone(&engine).start();
    tokio::signal::ctrl_c().await.context("waiting for Ctrl-C")?;
    tracing::info!("Shutting down...");
    engine.stop();
    handle.await?;
    reporter.abort();
    Ok(())
}

async fn create(engine: &SchedulerEngine, params: CreateTaskParams) -> Result<Task> {
    let task = engine.store().lock().await.create_task(params)?;
    Ok(task)
}

fn report(found: bool, action: &str, id: &str) {
    if found {
        println!("✅ {action} {id}");
    } else {
        println!("⚠️  Task {id} not found (or not in a state that allows this)");
    }
}

fn print_task_line(task: &Task) {
    let kind = match task.task_type() {
        TaskType::Periodic => "🔁",
        TaskType::Scheduled => "📅",
    };
    let enabled = if task.enabled { "" } else { " (disabled)" };
    println!(
        "{kind} {}  {:<9} next: {:<19}  runs: {:>3} (failed {:>3})  {}{}",
        task.id,
        task.status.to_string(),
        format_time(task.next_execution_time),
        task.execution_count,
        task.failure_count,
        task.name,
        enabled
    );
}

fn format_time(millis: Option<i64>) -> String {
    millis
        .and_then(chrono::DateTime::from_timestamp_millis)
        .map(|t| {
            t.with_timezone(&chrono::Local)
                .format("%Y-%m-%d %H:%M:%S")
                .to_string()
        })
        .unwrap_or_else(|| "-".into())
}

fn parse_time(raw: &str) -> Result<i64> {
    if let Ok(t) = chrono::DateTime::parse_from_rfc3339(raw) {
        return Ok(t.timestamp_millis());
    }
    let naive = chrono::NaiveDateTime::parse_from_str(raw, "%Y-%m-%d %H:%M")
        .with_context(|| format!("cannot parse time '{raw}'"))?;
    naive
        .and_local_timezone(chrono::Local)
        .earliest()
        .map(|t| t.timestamp_millis())
        .with_context(|| format!("'{raw}' does not exist in the local timezone"))
}

//! LabMan CLI - lab automation scheduling core.

use std::path::{Path, PathBuf};
use std::time::Duration;
use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use tracing::info;
use tracing_subscriber::EnvFilter;
use labman_core::{ExperimentSpec, LabConfig, TaskFilter, TaskStatus};
use labman_execution::Lab;
use labman_storage::{JsonStorage, Storage};
use labman_work::builtin_task_types;

#[derive(Parser)]
#[command(name = "labman")]
#[command(about = "Lab automation scheduling core", long_about = None)]
struct Cli {
    /// Lab configuration file (default: $LABMAN_CONFIG, then ./lab.toml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Check a lab configuration and, optionally, an experiment against it
    Validate {
        /// Experiment document (JSON)
        #[arg(long)]
        experiment: Option<PathBuf>,
    },
    /// Run an experiment to completion against simulated devices
    Run {
        /// Experiment document (JSON)
        experiment: PathBuf,
        /// Give up after this many seconds
        #[arg(long, default_value = "300")]
        timeout: u64,
    },
    /// List stored tasks
    List {
        /// Filter by status
        #[arg(long)]
        status: Option<String>,
    },
    /// Show a stored task
    Show {
        /// Task ID
        id: String,
    },
    /// Show stored lab status
    Status,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();
    let config = LabConfig::load(cli.config.as_deref())
        .with_context(|| format!("loading {}", LabConfig::resolve_path(cli.config.as_deref()).display()))?;

    match cli.command {
        Commands::Validate { experiment } => {
            println!(
                "Lab {}: {} devices, {} standalone position groups",
                config.general.name,
                config.devices.len(),
                config.positions.len()
            );
            if let Some(path) = experiment {
                let spec = read_experiment(&path)?;
                let mut dry = config.clone();
                dry.general.sim_mode = true;
                dry.storage.root = None;
                let (lab, _scheduler) = Lab::with_storage(dry, builtin_task_types(), None)?;
                lab.admit_experiment(spec).await?;
                println!("Experiment {}: OK ({} tasks)", path.display(), lab.status().tasks.total);
                lab.shutdown().await;
            }
        }
        Commands::Run { experiment, timeout } => {
            let spec = read_experiment(&experiment)?;
            let mut config = config;
            config.general.sim_mode = true;

            let (lab, mut scheduler) = Lab::new(config, builtin_task_types()).await?;
            let id = lab.admit_experiment(spec).await?;
            let outcome = scheduler.run_until_idle(Duration::from_secs(timeout)).await;
            scheduler.stop().await;

            if let Some(record) = lab.experiment(id) {
                println!("Experiment {} ({}): {}", record.name, record.id, record.status);
                for task_id in &record.tasks {
                    if let Some(task) = lab.task(*task_id) {
                        println!("  {} | {} | {} {}", task.id, task.status, task.task_type, task.message);
                    }
                }
            }
            lab.shutdown().await;

            let stats = outcome?;
            info!("Completed {} of {} tasks", stats.completed, stats.total);
        }
        Commands::List { status } => {
            let storage = open_store(&config).await?;
            let filter = TaskFilter {
                status: match status {
                    Some(s) => Some(vec![parse_status(&s)?]),
                    None => None,
                },
                ..Default::default()
            };
            let tasks = storage.list_tasks(&filter).await?;

            println!("Tasks ({})", tasks.len());
            for task in tasks {
                println!("  {} | {} | {} | {}", task.id, task.status, task.priority, task.task_type);
            }
        }
        Commands::Show { id } => {
            let storage = open_store(&config).await?;
            let task_id = id.parse().map_err(|_| anyhow::anyhow!("Invalid task ID"))?;
            let Some(task) = storage.load_task(task_id).await? else {
                println!("Task not found");
                return Ok(());
            };

            println!("Task: {}", task.id);
            println!("  Type: {}", task.task_type);
            println!("  Status: {}", task.status);
            println!("  Priority: {}", task.priority);
            println!("  Predecessors: {}", task.predecessors.len());
            println!("  Message: {}", task.message);
            if let Some(result) = &task.result {
                println!("  Result: {}", serde_json::to_string_pretty(result)?);
            }
            println!("  Created: {}", task.created_at);
        }
        Commands::Status => {
            let storage = open_store(&config).await?;
            let tasks = storage.list_tasks(&TaskFilter::default()).await?;

            println!("LabMan Status: {}", config.general.name);
            for status in [
                TaskStatus::Waiting,
                TaskStatus::Ready,
                TaskStatus::RequestingResources,
                TaskStatus::Running,
                TaskStatus::Paused,
                TaskStatus::Completed,
                TaskStatus::Error,
                TaskStatus::Stopped,
                TaskStatus::Cancelled,
            ] {
                let count = tasks.iter().filter(|t| t.status == status).count();
                if count > 0 {
                    println!("  {}: {}", status, count);
                }
            }
            for experiment in storage.list_experiments().await? {
                println!("  experiment {} ({}): {}", experiment.name, experiment.id, experiment.status);
            }
            for device in storage.list_devices().await? {
                println!("  device {} [{}]: {} {}", device.name, device.device_type, device.status, device.message);
            }
        }
    }

    Ok(())
}

fn read_experiment(path: &Path) -> Result<ExperimentSpec> {
    let text = std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    serde_json::from_str(&text).with_context(|| format!("parsing {}", path.display()))
}

async fn open_store(config: &LabConfig) -> Result<JsonStorage> {
    let Some(root) = &config.storage.root else {
        bail!("no [storage] root configured");
    };
    Ok(JsonStorage::new(root).await?)
}

fn parse_status(s: &str) -> Result<TaskStatus> {
    Ok(match s.to_lowercase().as_str() {
        "waiting" => TaskStatus::Waiting,
        "ready" => TaskStatus::Ready,
        "requesting" | "requesting_resources" => TaskStatus::RequestingResources,
        "running" => TaskStatus::Running,
        "paused" => TaskStatus::Paused,
        "completed" => TaskStatus::Completed,
        "error" => TaskStatus::Error,
        "stopped" => TaskStatus::Stopped,
        "cancelled" => TaskStatus::Cancelled,
        other => bail!("unknown status {}", other),
    })
}

//! CLI command definitions for folio-jobs.
//!
//! This module provides operator commands for running workers and inspecting
//! or repairing queues.

use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tokio::sync::broadcast;
use tracing::{info, warn};

use crate::config::{hours_to_duration, QueueConfig};
use crate::metrics::{export_metrics, init_metrics};
use crate::queue::{QueueManager, TaskEnvelope, TaskKind, TaskPayload};
use crate::worker::{
    EchoExecutor, Maintenance, MaintenanceConfig, WorkerPool, WorkerPoolConfig,
};

/// Default number of dead-letter entries listed.
const DEFAULT_DEAD_LETTER_LIMIT: usize = 20;

/// Background job queue for long-running document, slide, book and video tasks.
#[derive(Parser)]
#[command(name = "folio-jobs")]
#[command(about = "Run and operate the Redis-backed background job queue")]
#[command(version)]
#[command(
    long_about = "folio-jobs runs queue workers and inspects, repairs and monitors queues.\n\nStore and queue settings are read from the environment (REDIS_URL, QUEUE_NAME, QUEUE_*), and --redis-url / --queue override them.\n\nExample usage:\n  folio-jobs worker --queues ai_editor,translation_jobs --workers 4\n  folio-jobs enqueue translate --payload '{\"document_id\":\"d1\",\"content\":\"hola\",\"target_language\":\"en\"}'\n  folio-jobs status <job-id> --wait"
)]
pub struct Cli {
    /// The subcommand to execute.
    #[command(subcommand)]
    pub command: Commands,

    /// Log level (trace, debug, info, warn, error).
    #[arg(short, long, default_value = "info", global = true)]
    pub log_level: String,

    /// Backing store URL (overrides REDIS_URL).
    #[arg(long, global = true)]
    pub redis_url: Option<String>,

    /// Queue-name to operate on (overrides QUEUE_NAME).
    #[arg(short, long, global = true)]
    pub queue: Option<String>,
}

/// Available CLI subcommands.
#[derive(clap::Subcommand)]
pub enum Commands {
    /// Run a worker pool until SIGINT/SIGTERM.
    Worker(WorkerArgs),

    /// Enqueue one task.
    Enqueue(EnqueueArgs),

    /// Show the Status Record of a job.
    Status(StatusArgs),

    /// Show queue depths and lifetime counters.
    Stats(StatsArgs),

    /// Inspect, replay or purge dead-lettered tasks.
    #[command(name = "dead-letter", alias = "dlq")]
    DeadLetter(DeadLetterArgs),

    /// Delete Status Records older than a given age.
    Cleanup(CleanupArgs),

    /// Run maintenance sweeps (retry promotion, reaping, orphan recovery).
    Maintain(MaintainArgs),

    /// Print Prometheus metrics for the selected queues.
    Metrics(MetricsArgs),
}

/// Arguments for `folio-jobs worker`.
#[derive(Parser, Debug)]
pub struct WorkerArgs {
    /// Comma-separated queue-names to serve (default: --queue / QUEUE_NAME).
    #[arg(long)]
    pub queues: Option<String>,

    /// Competing workers per queue.
    #[arg(short = 'w', long, default_value = "4")]
    pub workers: usize,

    /// Seconds a blocking dequeue waits before re-checking for shutdown.
    #[arg(long, default_value = "5")]
    pub poll_timeout_secs: u64,

    /// Seconds to wait for in-flight tasks on shutdown.
    #[arg(long, default_value = "60")]
    pub shutdown_timeout_secs: u64,

    /// Seconds between maintenance sweeps.
    #[arg(long, default_value = "30")]
    pub maintenance_interval_secs: u64,

    /// Do not run maintenance loops in this process.
    #[arg(long)]
    pub no_maintenance: bool,
}

/// Arguments for `folio-jobs enqueue`.
#[derive(Parser, Debug)]
pub struct EnqueueArgs {
    /// Task type (edit_document, format_document, bilingual_document, translate,
    /// generate_slides, pdf_to_pages, image_to_chapter, export_video).
    pub task_type: String,

    /// JSON payload for the task type.
    #[arg(short = 'p', long)]
    pub payload: String,

    /// Owner of the job.
    #[arg(long, default_value = "cli")]
    pub owner: String,

    /// Job ID to report under (default: the generated task ID).
    #[arg(long)]
    pub job_id: Option<String>,

    /// Priority; values above 1 jump the queue.
    #[arg(long, default_value = "1")]
    pub priority: i32,

    /// Retry budget.
    #[arg(long, default_value = "3")]
    pub max_retries: u32,

    /// Output JSON.
    #[arg(short = 'j', long)]
    pub json: bool,
}

/// Arguments for `folio-jobs status`.
#[derive(Parser, Debug)]
pub struct StatusArgs {
    /// Job ID to look up.
    pub job_id: String,

    /// Look on this task type's queue when --queue is not given.
    #[arg(short = 't', long)]
    pub task_type: Option<String>,

    /// Poll until the job reaches a terminal state.
    #[arg(long)]
    pub wait: bool,

    /// Seconds between polls with --wait.
    #[arg(long, default_value = "2")]
    pub interval_secs: u64,

    /// Seconds before --wait gives up.
    #[arg(long, default_value = "600")]
    pub timeout_secs: u64,
}

/// Arguments for `folio-jobs stats`.
#[derive(Parser, Debug)]
pub struct StatsArgs {
    /// Use this task type's queue when --queue is not given.
    #[arg(short = 't', long)]
    pub task_type: Option<String>,

    /// Output JSON.
    #[arg(short = 'j', long)]
    pub json: bool,
}

/// Arguments for `folio-jobs dead-letter`.
#[derive(Parser, Debug)]
pub struct DeadLetterArgs {
    /// Use this task type's queue when --queue is not given.
    #[arg(short = 't', long)]
    pub task_type: Option<String>,

    #[command(subcommand)]
    pub command: DeadLetterSubcommand,
}

/// Dead-letter subcommands.
#[derive(clap::Subcommand, Debug)]
pub enum DeadLetterSubcommand {
    /// List the oldest dead-lettered tasks.
    List {
        #[arg(short = 'n', long, default_value_t = DEFAULT_DEAD_LETTER_LIMIT)]
        limit: usize,

        /// Output JSON.
        #[arg(short = 'j', long)]
        json: bool,
    },

    /// Put a dead-lettered task back on the queue with a fresh retry budget.
    Retry { task_id: String },

    /// Remove one dead-lettered task, or all of them with --all.
    Purge {
        #[arg(required_unless_present = "all")]
        task_id: Option<String>,

        #[arg(long, conflicts_with = "task_id")]
        all: bool,
    },
}

/// Arguments for `folio-jobs cleanup`.
#[derive(Parser, Debug)]
pub struct CleanupArgs {
    /// Delete Status Records created more than this many hours ago.
    #[arg(long, default_value = "24")]
    pub older_than_hours: u64,
}

/// Arguments for `folio-jobs maintain`.
#[derive(Parser, Debug)]
pub struct MaintainArgs {
    /// Run a single sweep and exit.
    #[arg(long)]
    pub once: bool,

    /// Seconds between sweeps.
    #[arg(long, default_value = "30")]
    pub interval_secs: u64,
}

/// Arguments for `folio-jobs metrics`.
#[derive(Parser, Debug)]
pub struct MetricsArgs {
    /// Comma-separated queue-names to sample (default: --queue / QUEUE_NAME).
    #[arg(long)]
    pub queues: Option<String>,
}

/// Parse CLI arguments and return the Cli struct.
pub fn parse_cli() -> Cli {
    Cli::parse()
}

/// Run the CLI by parsing arguments and executing the command.
///
/// This is a convenience function that parses CLI args and runs the command.
/// For more control over logging initialization, use `parse_cli()` and `run_with_cli()`.
pub async fn run() -> anyhow::Result<()> {
    run_with_cli(parse_cli()).await
}

/// Run the CLI with the parsed arguments.
///
/// This is the main entry point for the folio-jobs CLI.
pub async fn run_with_cli(cli: Cli) -> anyhow::Result<()> {
    let target = StoreTarget {
        redis_url: cli.redis_url,
        queue: cli.queue,
    };

    match cli.command {
        Commands::Worker(args) => run_worker_command(&target, args).await,
        Commands::Enqueue(args) => run_enqueue_command(&target, args).await,
        Commands::Status(args) => run_status_command(&target, args).await,
        Commands::Stats(args) => run_stats_command(&target, args).await,
        Commands::DeadLetter(args) => run_dead_letter_command(&target, args).await,
        Commands::Cleanup(args) => run_cleanup_command(&target, args).await,
        Commands::Maintain(args) => run_maintain_command(&target, args).await,
        Commands::Metrics(args) => run_metrics_command(&target, args).await,
    }
}

// ============================================================================
// Connection helpers
// ============================================================================

/// Store location chosen on the command line.
struct StoreTarget {
    redis_url: Option<String>,
    queue: Option<String>,
}

impl StoreTarget {
    /// Environment configuration with command-line overrides applied.
    fn config(&self) -> anyhow::Result<QueueConfig> {
        let mut config = QueueConfig::from_env()?;
        if let Some(url) = &self.redis_url {
            config = config.with_redis_url(url.clone());
        }
        if let Some(queue) = &self.queue {
            config = config.with_queue_name(queue.clone());
        }
        Ok(config)
    }

    async fn connect(&self) -> anyhow::Result<Arc<QueueManager>> {
        let config = self.config()?;
        Ok(Arc::new(QueueManager::connect(config).await?))
    }

    /// Connects to `--queue` if given, else to the default queue of
    /// `task_type`, else to the configured queue.
    async fn connect_for(&self, task_type: Option<&str>) -> anyhow::Result<Arc<QueueManager>> {
        let kind = parse_task_kind(task_type)?;
        match queue_for(self.queue.as_deref(), kind) {
            Some(queue) => self.connect_to(&queue).await,
            None => self.connect().await,
        }
    }

    async fn connect_to(&self, queue: &str) -> anyhow::Result<Arc<QueueManager>> {
        let config = self.config()?.with_queue_name(queue);
        Ok(Arc::new(QueueManager::connect(config).await?))
    }

    /// Connects to every queue in `list`, or to the default queue when absent.
    async fn connect_all(&self, list: Option<&str>) -> anyhow::Result<Vec<Arc<QueueManager>>> {
        let names = list.map(parse_queue_list).unwrap_or_default();
        if names.is_empty() {
            return Ok(vec![self.connect().await?]);
        }
        let mut queues = Vec::with_capacity(names.len());
        for name in names {
            queues.push(self.connect_to(&name).await?);
        }
        Ok(queues)
    }
}

fn parse_task_kind(raw: Option<&str>) -> anyhow::Result<Option<TaskKind>> {
    raw.map(|name| name.parse::<TaskKind>().map_err(anyhow::Error::msg))
        .transpose()
}

/// Queue-name selected by an explicit `--queue` or, failing that, by a task type.
fn queue_for(explicit: Option<&str>, kind: Option<TaskKind>) -> Option<String> {
    explicit
        .map(str::to_string)
        .or_else(|| kind.map(|kind| kind.default_queue().to_string()))
}

/// Queues searched for a job's Status Record: the configured one first, then
/// every task type's default queue.
fn status_search_order(configured: &str) -> Vec<String> {
    let mut names = vec![configured.to_string()];
    for kind in TaskKind::ALL {
        let name = kind.default_queue();
        if !names.iter().any(|known| known == name) {
            names.push(name.to_string());
        }
    }
    names
}

fn parse_queue_list(raw: &str) -> Vec<String> {
    let mut names: Vec<String> = raw
        .split(',')
        .map(str::trim)
        .filter(|name| !name.is_empty())
        .map(str::to_string)
        .collect();
    names.dedup();
    names
}

/// Waits for SIGINT or (on Unix) SIGTERM.
async fn wait_for_termination() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                tracing::error!("Failed to listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => info!("Received SIGINT (Ctrl+C), initiating shutdown"),
        () = terminate => info!("Received SIGTERM, initiating shutdown"),
    }
}

// ============================================================================
// Command implementations
// ============================================================================

async fn run_worker_command(target: &StoreTarget, args: WorkerArgs) -> anyhow::Result<()> {
    if let Err(e) = init_metrics() {
        warn!(error = %e, "Metrics registration failed; continuing without metrics");
    }

    let queues = target.connect_all(args.queues.as_deref()).await?;
    let config = WorkerPoolConfig::new(args.workers)
        .with_poll_timeout(Duration::from_secs(args.poll_timeout_secs))
        .with_shutdown_timeout(Duration::from_secs(args.shutdown_timeout_secs))
        .with_maintenance(!args.no_maintenance)
        .with_maintenance_interval(Duration::from_secs(args.maintenance_interval_secs));

    // The binary carries no business handlers; it acknowledges every task.
    let mut pool = WorkerPool::new(config, queues, Arc::new(EchoExecutor));
    pool.start().await?;

    wait_for_termination().await;

    let result = pool.shutdown().await;
    let stats = pool.stats();
    info!(
        completed = stats.jobs_completed,
        failed = stats.jobs_failed,
        dead_lettered = stats.jobs_dead_lettered,
        success_rate = stats.success_rate(),
        "Worker pool finished"
    );
    result?;
    Ok(())
}

async fn run_enqueue_command(target: &StoreTarget, args: EnqueueArgs) -> anyhow::Result<()> {
    let kind: TaskKind = args.task_type.parse().map_err(anyhow::Error::msg)?;
    let body: serde_json::Value = serde_json::from_str(&args.payload)
        .map_err(|e| anyhow::anyhow!("Payload is not valid JSON: {}", e))?;
    let task = TaskPayload::from_parts(kind, body)
        .map_err(|e| anyhow::anyhow!("Payload does not match task type '{}': {}", kind, e))?;

    let mut envelope = TaskEnvelope::new(args.owner, task)
        .with_priority(args.priority)
        .with_max_retries(args.max_retries);
    if let Some(job_id) = args.job_id {
        envelope = envelope.with_job_id(job_id);
    }

    // Tasks go to their kind's queue unless one was named explicitly.
    let queue = match queue_for(target.queue.as_deref(), Some(kind)) {
        Some(name) => target.connect_to(&name).await?,
        None => target.connect().await?,
    };

    let task_id = envelope.task_id.clone();
    let job_id = envelope.job_id.clone();
    queue.enqueue(envelope).await?;

    if args.json {
        let output = serde_json::json!({
            "status": "queued",
            "queue": queue.queue_name(),
            "task_id": task_id,
            "job_id": job_id,
        });
        println!("{}", serde_json::to_string_pretty(&output)?);
    } else {
        println!("✓ Queued {} on '{}'", kind, queue.queue_name());
        println!("  Task ID: {}", task_id);
        println!("  Job ID:  {}", job_id);
        println!(
            "  Follow:  folio-jobs -q {} status {} --wait",
            queue.queue_name(),
            job_id
        );
    }
    Ok(())
}

async fn run_status_command(target: &StoreTarget, args: StatusArgs) -> anyhow::Result<()> {
    let queue = locate_status_queue(target, &args).await?;

    let record = if args.wait {
        let producer = crate::producer::Producer::new(queue);
        Some(
            producer
                .wait_for_terminal(
                    &args.job_id,
                    Duration::from_secs(args.interval_secs.max(1)),
                    Duration::from_secs(args.timeout_secs),
                )
                .await?,
        )
    } else {
        queue.get_status(&args.job_id).await?
    };

    match record {
        Some(record) => println!("{}", serde_json::to_string_pretty(&record)?),
        None => anyhow::bail!("No status record for job {}", args.job_id),
    }
    Ok(())
}

/// Picks the queue holding the job's Status Record.
///
/// Without `--queue` or `--task-type` every default queue is searched, so a
/// job enqueued by task type alone is still found.
async fn locate_status_queue(
    target: &StoreTarget,
    args: &StatusArgs,
) -> anyhow::Result<Arc<QueueManager>> {
    if target.queue.is_some() || args.task_type.is_some() {
        return target.connect_for(args.task_type.as_deref()).await;
    }

    let configured = target.config()?.queue_name;
    let mut first = None;
    for name in status_search_order(&configured) {
        let queue = target.connect_to(&name).await?;
        if queue.get_status(&args.job_id).await?.is_some() {
            return Ok(queue);
        }
        first.get_or_insert(queue);
    }
    match first {
        Some(queue) => Ok(queue),
        None => target.connect().await,
    }
}

async fn run_stats_command(target: &StoreTarget, args: StatsArgs) -> anyhow::Result<()> {
    let queue = target.connect_for(args.task_type.as_deref()).await?;
    let stats = queue.get_stats().await?;

    if args.json {
        println!("{}", serde_json::to_string_pretty(&stats)?);
        return Ok(());
    }

    println!("=== Queue '{}' ===", stats.queue_name);
    println!("Pending:        {}", stats.pending);
    println!("Delayed:        {}", stats.delayed);
    println!("Processing:     {}", stats.processing);
    println!("Dead letter:    {}", stats.dead_letter);
    println!();
    println!("Lifetime:");
    println!("  queued:        {}", stats.lifetime.queued);
    println!("  processing:    {}", stats.lifetime.processing);
    println!("  completed:     {}", stats.lifetime.completed);
    println!("  failed:        {}", stats.lifetime.failed);
    println!("  retried:       {}", stats.lifetime.retried);
    println!("  dead_lettered: {}", stats.lifetime.dead_lettered);
    println!("  malformed:     {}", stats.lifetime.malformed);
    println!("  reaped:        {}", stats.lifetime.reaped);
    Ok(())
}

async fn run_dead_letter_command(target: &StoreTarget, args: DeadLetterArgs) -> anyhow::Result<()> {
    let queue = target.connect_for(args.task_type.as_deref()).await?;

    match args.command {
        DeadLetterSubcommand::List { limit, json } => {
            let entries = queue.list_dead_letters(limit).await?;
            if json {
                println!("{}", serde_json::to_string_pretty(&entries)?);
            } else if entries.is_empty() {
                println!("No dead-lettered tasks.");
            } else {
                for entry in &entries {
                    println!(
                        "{}  {}  job={}  retries={}  failed_at={}",
                        entry.task_id(),
                        entry.envelope.kind(),
                        entry.envelope.job_id,
                        entry.envelope.retry_count,
                        entry.failed_at.to_rfc3339()
                    );
                    println!("    error: {}", entry.final_error);
                }
            }
        }
        DeadLetterSubcommand::Retry { task_id } => {
            let envelope = queue.retry_dead_letter(&task_id).await?;
            println!(
                "✓ Requeued {} (job {}) on '{}'",
                envelope.task_id,
                envelope.job_id,
                queue.queue_name()
            );
        }
        DeadLetterSubcommand::Purge { all: true, .. } => {
            let removed = queue.purge_all_dead_letters().await?;
            println!("✓ Purged {} dead-lettered tasks", removed);
        }
        DeadLetterSubcommand::Purge {
            task_id: Some(task_id),
            ..
        } => {
            if queue.purge_dead_letter(&task_id).await? {
                println!("✓ Purged {}", task_id);
            } else {
                anyhow::bail!("Task {} not found in dead-letter store", task_id);
            }
        }
        DeadLetterSubcommand::Purge { task_id: None, .. } => {
            anyhow::bail!("Specify a task ID or --all");
        }
    }
    Ok(())
}

async fn run_cleanup_command(target: &StoreTarget, args: CleanupArgs) -> anyhow::Result<()> {
    let age = hours_to_duration(args.older_than_hours, "--older-than-hours")?;
    let queue = target.connect().await?;
    let removed = queue.cleanup_old_statuses(age).await?;
    println!("✓ Removed {} status records", removed);
    Ok(())
}

async fn run_maintain_command(target: &StoreTarget, args: MaintainArgs) -> anyhow::Result<()> {
    let queue = target.connect().await?;
    let config = MaintenanceConfig::for_queue(queue.config())
        .with_interval(Duration::from_secs(args.interval_secs.max(1)));
    let mut maintenance = Maintenance::new(queue, config);

    if args.once {
        let report = maintenance.sweep().await;
        println!("Promoted:          {}", report.promoted);
        println!("Reaped:            {}", report.reaped);
        println!("Orphans requeued:  {}", report.orphans_requeued);
        println!("Statuses removed:  {}", report.statuses_removed);
        return Ok(());
    }

    let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
    let handle = tokio::spawn(maintenance.run(shutdown_rx));
    wait_for_termination().await;
    // The loop may already have exited.
    let _ = shutdown_tx.send(());
    handle.await?;
    Ok(())
}

async fn run_metrics_command(target: &StoreTarget, args: MetricsArgs) -> anyhow::Result<()> {
    init_metrics()?;
    for queue in target.connect_all(args.queues.as_deref()).await? {
        // Refreshes the depth gauges as a side effect.
        queue.get_stats().await?;
    }
    print!("{}", export_metrics());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition_is_valid() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_parse_worker_command() {
        let cli = Cli::parse_from([
            "folio-jobs",
            "--redis-url",
            "redis://cache:6379",
            "worker",
            "--queues",
            "ai_editor,translation_jobs",
            "-w",
            "8",
            "--no-maintenance",
        ]);

        assert_eq!(cli.redis_url.as_deref(), Some("redis://cache:6379"));
        match cli.command {
            Commands::Worker(args) => {
                assert_eq!(args.workers, 8);
                assert!(args.no_maintenance);
                assert_eq!(args.queues.as_deref(), Some("ai_editor,translation_jobs"));
            }
            _ => panic!("expected worker command"),
        }
    }

    #[test]
    fn test_parse_dead_letter_purge_all() {
        let cli = Cli::parse_from(["folio-jobs", "-q", "video_export", "dead-letter", "purge", "--all"]);
        assert_eq!(cli.queue.as_deref(), Some("video_export"));
        match cli.command {
            Commands::DeadLetter(DeadLetterArgs {
                command: DeadLetterSubcommand::Purge { task_id, all },
                ..
            }) => {
                assert!(all);
                assert!(task_id.is_none());
            }
            _ => panic!("expected dead-letter purge"),
        }
    }

    #[test]
    fn test_purge_requires_target() {
        assert!(Cli::try_parse_from(["folio-jobs", "dead-letter", "purge"]).is_err());
    }

    #[test]
    fn test_status_routes_by_task_type() {
        let cli = Cli::parse_from(["folio-jobs", "status", "job-9", "--wait", "-t", "translate"]);
        let Commands::Status(args) = cli.command else {
            panic!("expected status command");
        };
        assert!(args.wait);

        let kind = parse_task_kind(args.task_type.as_deref()).unwrap();
        assert_eq!(
            queue_for(cli.queue.as_deref(), kind).as_deref(),
            Some("translation_jobs")
        );
    }

    #[test]
    fn test_explicit_queue_wins_over_task_type() {
        assert_eq!(
            queue_for(Some("ops"), Some(TaskKind::ExportVideo)).as_deref(),
            Some("ops")
        );
        assert_eq!(queue_for(None, None), None);
        assert!(parse_task_kind(Some("teleport")).is_err());
    }

    #[test]
    fn test_enqueue_and_status_agree_on_default_queue() {
        // Whatever queue enqueue picks by task type, status searches it.
        let searched = status_search_order("ai_editor");
        assert_eq!(searched[0], "ai_editor");
        for kind in TaskKind::ALL {
            let enqueued_on = queue_for(None, Some(kind)).unwrap();
            assert!(searched.contains(&enqueued_on), "{} not searched", enqueued_on);
        }
        let unique: std::collections::HashSet<&String> = searched.iter().collect();
        assert_eq!(unique.len(), searched.len());
    }

    #[test]
    fn test_parse_queue_list() {
        assert_eq!(
            parse_queue_list(" ai_editor, ,slide_generation,"),
            vec!["ai_editor".to_string(), "slide_generation".to_string()]
        );
        assert!(parse_queue_list("").is_empty());
    }
}

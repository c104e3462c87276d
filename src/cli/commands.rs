//! CLI command definitions for bistro-queue.
//!
//! Provides commands for running the probe server, submitting jobs, tailing
//! queue events, and inspecting queue counts.

use clap::Parser;
use futures::StreamExt;
use serde::Serialize;
use tracing::info;

use crate::broker::{shutdown_signal, Broker};
use crate::config::{
    BrokerConfig, DEFAULT_KEY_PREFIX, DEFAULT_REDIS_DB, DEFAULT_REDIS_HOST, DEFAULT_REDIS_PORT,
};
use crate::health::{lazy_database_pool, router, HealthState, DEFAULT_DATABASE_URL};
use crate::metrics::{init_metrics, MetricsCollector};
use crate::scheduler::{Backoff, BackoffKind, JobOptions, JobQueue};

/// Default listen address of the probe server.
const DEFAULT_HEALTH_ADDR: &str = "0.0.0.0:8080";

/// Background job queue tooling for the bistro platform.
#[derive(Parser)]
#[command(name = "bistro-queue")]
#[command(about = "Submit, observe and health-check Redis-backed background jobs")]
#[command(version)]
pub struct Cli {
    /// The subcommand to execute.
    #[command(subcommand)]
    pub command: Commands,

    #[command(flatten)]
    pub broker: BrokerArgs,

    /// Log level (trace, debug, info, warn, error).
    #[arg(short, long, default_value = "info", global = true)]
    pub log_level: String,
}

/// Broker connection settings, shared by every subcommand.
#[derive(Parser, Debug, Clone)]
pub struct BrokerArgs {
    #[arg(long, env = "REDIS_HOST", default_value = DEFAULT_REDIS_HOST, global = true)]
    pub redis_host: String,

    #[arg(long, env = "REDIS_PORT", default_value_t = DEFAULT_REDIS_PORT, global = true)]
    pub redis_port: u16,

    #[arg(long, env = "REDIS_PASSWORD", hide_env_values = true, global = true)]
    pub redis_password: Option<String>,

    /// Logical database index.
    #[arg(long, env = "REDIS_DB", default_value_t = DEFAULT_REDIS_DB, global = true)]
    pub redis_db: i64,

    /// Key prefix of all queues.
    #[arg(long, env = "QUEUE_PREFIX", default_value = DEFAULT_KEY_PREFIX, global = true)]
    pub queue_prefix: String,
}

impl BrokerArgs {
    pub fn to_config(&self) -> BrokerConfig {
        let mut config = BrokerConfig::default()
            .with_host(&self.redis_host)
            .with_port(self.redis_port)
            .with_db(self.redis_db)
            .with_prefix(&self.queue_prefix);
        if let Some(password) = self.redis_password.as_deref().filter(|p| !p.is_empty()) {
            config = config.with_password(password);
        }
        config
    }
}

/// Available CLI subcommands.
#[derive(clap::Subcommand)]
pub enum Commands {
    /// Serve /health and /metrics until SIGINT or SIGTERM.
    Serve(ServeArgs),

    /// Submit one job with a JSON payload.
    Submit(SubmitArgs),

    /// Print a queue's lifecycle events as JSON lines.
    Events(EventsArgs),

    /// Show the number of jobs in each state.
    Counts(CountsArgs),
}

#[derive(Parser, Debug)]
pub struct ServeArgs {
    /// Address to listen on.
    #[arg(long, env = "HEALTH_ADDR", default_value = DEFAULT_HEALTH_ADDR)]
    pub addr: String,

    /// Relational store checked by the liveness probe.
    #[arg(long, env = "DATABASE_URL", default_value = DEFAULT_DATABASE_URL, hide_env_values = true)]
    pub database_url: String,
}

#[derive(Parser, Debug)]
pub struct SubmitArgs {
    #[arg(short, long)]
    pub queue: String,

    /// Job payload as a JSON document.
    #[arg(short, long)]
    pub data: String,

    /// Job name (defaults to a name derived from the queue).
    #[arg(long)]
    pub name: Option<String>,

    #[arg(long)]
    pub attempts: Option<u32>,

    /// Backoff strategy: fixed or exponential.
    #[arg(long, value_parser = parse_backoff_kind, requires = "backoff_delay")]
    pub backoff: Option<BackoffKind>,

    /// Base backoff delay in milliseconds.
    #[arg(long, requires = "backoff")]
    pub backoff_delay: Option<u64>,

    #[arg(long)]
    pub dedup_id: Option<String>,

    /// Output JSON.
    #[arg(short = 'j', long)]
    pub json: bool,
}

impl SubmitArgs {
    fn job_options(&self) -> JobOptions {
        JobOptions {
            name: self.name.clone(),
            attempts: self.attempts,
            backoff: self
                .backoff
                .zip(self.backoff_delay)
                .map(|(kind, delay)| Backoff { kind, delay }),
            dedup_id: self.dedup_id.clone(),
            ..JobOptions::default()
        }
    }
}

#[derive(Parser, Debug)]
pub struct EventsArgs {
    #[arg(short, long)]
    pub queue: String,

    /// Stop after this many events.
    #[arg(short = 'n', long)]
    pub count: Option<usize>,
}

#[derive(Parser, Debug)]
pub struct CountsArgs {
    #[arg(short, long)]
    pub queue: String,

    /// Output JSON.
    #[arg(short = 'j', long)]
    pub json: bool,
}

fn parse_backoff_kind(value: &str) -> Result<BackoffKind, String> {
    match value.to_ascii_lowercase().as_str() {
        "fixed" => Ok(BackoffKind::Fixed),
        "exponential" => Ok(BackoffKind::Exponential),
        other => Err(format!("unknown backoff '{other}', expected fixed or exponential")),
    }
}

/// Parse CLI arguments.
pub fn parse_cli() -> Cli {
    Cli::parse()
}

/// Run the CLI by parsing arguments and executing the command.
pub async fn run() -> anyhow::Result<()> {
    run_with_cli(parse_cli()).await
}

/// Run the CLI with the parsed arguments.
///
/// The process owns the broker here, so this is where it is closed.
pub async fn run_with_cli(cli: Cli) -> anyhow::Result<()> {
    let broker = Broker::new(cli.broker.to_config())?;

    let result = match cli.command {
        Commands::Serve(args) => run_serve_command(&broker, args).await,
        Commands::Submit(args) => run_submit_command(&broker, args).await,
        Commands::Events(args) => run_events_command(&broker, args).await,
        Commands::Counts(args) => run_counts_command(&broker, args).await,
    };

    broker.close().await;
    result
}

async fn run_serve_command(broker: &Broker, args: ServeArgs) -> anyhow::Result<()> {
    init_metrics()?;
    let pool = lazy_database_pool(&args.database_url)?;
    let app = router(HealthState::new(pool, broker.clone()));

    let listener = tokio::net::TcpListener::bind(&args.addr).await?;
    info!(addr = %args.addr, "Probe server listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!("Probe server stopped");
    Ok(())
}

async fn run_submit_command(broker: &Broker, args: SubmitArgs) -> anyhow::Result<()> {
    let payload: serde_json::Value = serde_json::from_str(&args.data)
        .map_err(|e| anyhow::anyhow!("--data is not valid JSON: {e}"))?;

    let queue = JobQueue::<serde_json::Value>::new(&args.queue, broker, None)?;
    let handle = queue.submit(&payload, Some(args.job_options())).await?;

    if args.json {
        println!("{}", serde_json::to_string_pretty(&handle)?);
    } else if handle.deduplicated {
        println!("Job {} already queued on '{}' ({})", handle.id, handle.queue, handle.name);
    } else {
        println!("Submitted job {} to '{}' ({})", handle.id, handle.queue, handle.name);
    }
    Ok(())
}

async fn run_events_command(broker: &Broker, args: EventsArgs) -> anyhow::Result<()> {
    let queue = JobQueue::<serde_json::Value>::new(&args.queue, broker, None)?;
    let mut stream = queue.events().subscribe().await?;
    info!(queue = %args.queue, channel = %queue.events().channel(), "Listening for job events");

    let shutdown = shutdown_signal();
    tokio::pin!(shutdown);

    let mut seen = 0usize;
    loop {
        tokio::select! {
            event = stream.next() => {
                let Some(event) = event else {
                    info!("Event stream ended");
                    break;
                };
                println!("{}", event.encode()?);
                seen += 1;
                if args.count.is_some_and(|limit| seen >= limit) {
                    break;
                }
            }
            _ = &mut shutdown => break,
        }
    }
    Ok(())
}

#[derive(Serialize)]
struct CountsOutput<'a> {
    queue: &'a str,
    #[serde(flatten)]
    counts: crate::scheduler::JobCounts,
    total: u64,
}

async fn run_counts_command(broker: &Broker, args: CountsArgs) -> anyhow::Result<()> {
    let queue = JobQueue::<serde_json::Value>::new(&args.queue, broker, None)?;
    let counts = queue.counts().await?;
    MetricsCollector::new().update_counts(queue.name(), &counts);

    if args.json {
        let output = CountsOutput {
            queue: queue.name(),
            counts,
            total: counts.total(),
        };
        println!("{}", serde_json::to_string_pretty(&output)?);
    } else {
        println!("Queue '{}':", queue.name());
        println!("  waiting:   {}", counts.waiting);
        println!("  active:    {}", counts.active);
        println!("  delayed:   {}", counts.delayed);
        println!("  completed: {}", counts.completed);
        println!("  failed:    {}", counts.failed);
    }
    Ok(())
}

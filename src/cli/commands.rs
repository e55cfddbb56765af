//! CLI command definitions for agent-scheduler.
//!
//! `run` drives a scheduler against Redis with the demo agents declared in
//! the configuration file; the other commands inspect or repair a store.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use clap::Parser;
use tracing::{info, warn};

use crate::config::{AgentDefinition, SchedulerConfig};
use crate::metrics::{export_metrics, init_metrics};
use crate::scheduler::{
    Agent, AgentError, AgentExecution, AgentStore, LoggingInstrumentation, PriorityAgentScheduler,
    RedisAgentStore, SchedulerKeys, SetKind, StoredScore,
};

const DEFAULT_REDIS_URL: &str = "redis://127.0.0.1:6379";

/// Distributed agent scheduler over Redis sorted sets.
#[derive(Parser)]
#[command(name = "agent-scheduler")]
#[command(about = "Run and inspect a distributed at-most-one-owner agent scheduler")]
#[command(version)]
#[command(
    long_about = "agent-scheduler runs periodic agents across a fleet of pods. Each agent is owned by at most one pod at a time, coordinated through Redis sorted sets and Lua scripts.\n\nExample usage:\n  agent-scheduler run --config scheduler.yaml --redis-url redis://localhost:6379"
)]
pub struct Cli {
    /// The subcommand to execute.
    #[command(subcommand)]
    pub command: Commands,

    /// Log level (trace, debug, info, warn, error).
    #[arg(short, long, default_value = "info", global = true)]
    pub log_level: String,
}

/// Available CLI subcommands.
#[derive(clap::Subcommand)]
pub enum Commands {
    /// Run the scheduler with the demo agents from the config until Ctrl-C.
    Run(RunArgs),

    /// Load, validate and print the effective configuration.
    #[command(name = "validate-config")]
    ValidateConfig(ConfigArgs),

    /// Print the waiting and working sets.
    Inspect(InspectArgs),

    /// Run one orphan cleanup pass without leadership.
    #[command(name = "cleanup-orphans")]
    CleanupOrphans(CleanupArgs),

    /// Print the Prometheus exposition.
    Metrics,
}

#[derive(Parser, Debug)]
pub struct RunArgs {
    /// Scheduler configuration file (YAML).
    #[arg(short = 'c', long)]
    pub config: PathBuf,

    /// Redis connection URL.
    #[arg(long, env = "REDIS_URL", default_value = DEFAULT_REDIS_URL)]
    pub redis_url: String,
}

#[derive(Parser, Debug)]
pub struct ConfigArgs {
    /// Scheduler configuration file (YAML).
    #[arg(short = 'c', long)]
    pub config: PathBuf,
}

#[derive(Parser, Debug)]
pub struct InspectArgs {
    /// Redis connection URL.
    #[arg(long, env = "REDIS_URL", default_value = DEFAULT_REDIS_URL)]
    pub redis_url: String,

    /// Configuration file for key names; defaults apply when omitted.
    #[arg(short = 'c', long)]
    pub config: Option<PathBuf>,

    /// Maximum entries printed per set.
    #[arg(short = 'n', long, default_value = "50")]
    pub limit: usize,
}

#[derive(Parser, Debug)]
pub struct CleanupArgs {
    /// Scheduler configuration file (YAML).
    #[arg(short = 'c', long)]
    pub config: PathBuf,

    /// Redis connection URL.
    #[arg(long, env = "REDIS_URL", default_value = DEFAULT_REDIS_URL)]
    pub redis_url: String,
}

/// Parse CLI arguments and return the Cli struct.
///
/// This allows main.rs to access CLI arguments (like log_level) before running commands.
pub fn parse_cli() -> Cli {
    Cli::parse()
}

/// Run the CLI by parsing arguments and executing the command.
pub async fn run() -> anyhow::Result<()> {
    run_with_cli(parse_cli()).await
}

/// Run the CLI with the parsed arguments.
pub async fn run_with_cli(cli: Cli) -> anyhow::Result<()> {
    match cli.command {
        Commands::Run(args) => run_scheduler_command(args).await,
        Commands::ValidateConfig(args) => run_validate_config_command(args),
        Commands::Inspect(args) => run_inspect_command(args).await,
        Commands::CleanupOrphans(args) => run_cleanup_orphans_command(args).await,
        Commands::Metrics => run_metrics_command(),
    }
}

/// Demo execution: sleeps for the configured work time.
struct SleepExecution {
    work: Duration,
}

#[async_trait]
impl AgentExecution for SleepExecution {
    async fn execute(&self, agent: &Agent) -> Result<(), AgentError> {
        info!(agent = %agent, work_ms = self.work.as_millis() as u64, "Running demo agent");
        tokio::time::sleep(self.work).await;
        Ok(())
    }
}

async fn connect(config: &SchedulerConfig, redis_url: &str) -> anyhow::Result<Arc<RedisAgentStore>> {
    let keys = SchedulerKeys::from_config(&config.keys);
    let store = RedisAgentStore::connect(redis_url, keys).await?;
    Ok(Arc::new(store))
}

async fn schedule_definitions(scheduler: &PriorityAgentScheduler, agents: &[AgentDefinition]) {
    for definition in agents {
        scheduler
            .schedule(
                definition.to_agent(),
                Arc::new(SleepExecution {
                    work: Duration::from_millis(definition.work_ms),
                }),
                Arc::new(LoggingInstrumentation),
            )
            .await;
    }
}

async fn run_scheduler_command(args: RunArgs) -> anyhow::Result<()> {
    let config = SchedulerConfig::from_yaml_file(&args.config)?;
    if let Err(e) = init_metrics() {
        warn!(error = %e, "Failed to initialize metrics");
    }
    let store = connect(&config, &args.redis_url).await?;
    let agents = config.agents.clone();
    let scheduler = Arc::new(PriorityAgentScheduler::builder(config, store).build()?);

    schedule_definitions(&scheduler, &agents).await;
    info!(agents = agents.len(), "Scheduled demo agents");

    let (shutdown_tx, shutdown_rx) = tokio::sync::broadcast::channel(1);
    let driver = tokio::spawn({
        let scheduler = Arc::clone(&scheduler);
        async move { scheduler.run_forever(shutdown_rx).await }
    });

    tokio::signal::ctrl_c().await?;
    info!("Ctrl-C received; shutting down");
    let _ = shutdown_tx.send(());
    driver.await??;
    scheduler.shutdown().await?;

    let stats = scheduler.stats();
    info!(
        runs = stats.run_count,
        zombies_cleaned = stats.zombies_cleaned,
        orphans_cleaned = stats.orphans_cleaned,
        "Scheduler stopped"
    );
    Ok(())
}

fn run_validate_config_command(args: ConfigArgs) -> anyhow::Result<()> {
    let config = SchedulerConfig::from_yaml_file(&args.config)?;
    println!("# Configuration is valid");
    print!("{}", config.to_yaml()?);
    Ok(())
}

fn format_score(score: StoredScore) -> String {
    match score {
        StoredScore::Valid(secs) => match DateTime::<Utc>::from_timestamp(secs, 0) {
            Some(at) => format!("{} ({})", secs, at.to_rfc3339()),
            None => secs.to_string(),
        },
        StoredScore::Invalid => "<invalid>".to_string(),
    }
}

async fn run_inspect_command(args: InspectArgs) -> anyhow::Result<()> {
    let config = match &args.config {
        Some(path) => SchedulerConfig::from_yaml_file(path)?,
        None => SchedulerConfig::default(),
    };
    let store = connect(&config, &args.redis_url).await?;
    store.initialize().await?;

    let mut both: Vec<String> = Vec::new();
    for set in [SetKind::Waiting, SetKind::Working] {
        let total = store.cardinality(set).await?;
        let entries = store.range_by_score(set, i64::MAX, 0, args.limit).await?;
        println!("{} ({} entries, showing {}):", set.label(), total, entries.len());
        for (agent, score) in &entries {
            println!("  {:<48} {}", agent, format_score(*score));
        }
        if set == SetKind::Working {
            let names: Vec<String> = entries.into_iter().map(|(name, _)| name).collect();
            if !names.is_empty() {
                let scores = store.scores(&names).await?;
                both.extend(
                    names
                        .into_iter()
                        .zip(scores)
                        .filter(|(_, s)| s.waiting.is_some() && s.working.is_some())
                        .map(|(name, _)| name),
                );
            }
        }
    }

    if both.is_empty() {
        println!("consistency: no agent found in both sets");
    } else {
        println!("consistency: {} agent(s) in both sets:", both.len());
        for name in both {
            println!("  {}", name);
        }
    }
    Ok(())
}

async fn run_cleanup_orphans_command(args: CleanupArgs) -> anyhow::Result<()> {
    let config = SchedulerConfig::from_yaml_file(&args.config)?;
    let store = connect(&config, &args.redis_url).await?;
    let agents = config.agents.clone();
    let scheduler = PriorityAgentScheduler::builder(config, store).build()?;
    schedule_definitions(&scheduler, &agents).await;

    let report = scheduler
        .orphan_cleanup()
        .force_cleanup_orphaned_agents()
        .await?;
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}

fn run_metrics_command() -> anyhow::Result<()> {
    init_metrics()?;
    print!("{}", export_metrics());
    Ok(())
}

//! smartq CLI - priority job queue with dependency gating and resource admission.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use smartq_core::{
    DatabaseConfig, Job, JobFilter, JobId, JobSpec, JobStatus, Priority, ResourceRequirements, RetryConfig,
    SmartqConfig, CPU_UNITS, MEMORY_MB,
};
use smartq_engine::{
    CycleResult, EngineConfig, ExecutionEngine, JobService, Notifier, ResourceLedger, SimulatedWork,
};
use smartq_storage::{MemoryStorage, SqliteStorage, Storage};
use tokio::sync::broadcast::error::RecvError;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "smartq")]
#[command(about = "Priority job queue with dependencies, resource admission and retries", long_about = None)]
struct Cli {
    /// Config file (defaults to ./smartq.toml when present)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Submit a new job
    Submit {
        /// Job type tag
        job_type: String,
        /// Priority (low, normal, high, critical)
        #[arg(long, default_value = "normal")]
        priority: Priority,
        /// JSON payload
        #[arg(long)]
        payload: Option<String>,
        /// Compute units required
        #[arg(long)]
        cpu: Option<u64>,
        /// Memory required, in MB
        #[arg(long)]
        memory: Option<u64>,
        /// Other resource requirement as NAME=QUANTITY (repeatable)
        #[arg(long = "resource", value_parser = parse_resource)]
        resources: Vec<(String, u64)>,
        /// Job that must succeed first (repeatable)
        #[arg(long = "depends-on")]
        depends_on: Vec<JobId>,
        /// Total attempts allowed
        #[arg(long)]
        max_attempts: Option<u32>,
        /// Backoff multiplier between attempts
        #[arg(long)]
        backoff: Option<f64>,
        /// Deadline in seconds
        #[arg(long)]
        timeout: Option<u64>,
        /// Deduplication key
        #[arg(long)]
        idempotency_key: Option<String>,
    },
    /// List jobs
    List {
        /// Filter by status
        #[arg(long)]
        status: Option<JobStatus>,
        /// Maximum number of jobs
        #[arg(long)]
        limit: Option<usize>,
    },
    /// Show job details
    Show {
        /// Job ID
        id: JobId,
    },
    /// Cancel a pending job
    Cancel {
        /// Job ID
        id: JobId,
    },
    /// Print a job's execution log
    Logs {
        /// Job ID
        id: JobId,
    },
    /// Reconcile jobs orphaned by a previous run, then schedule until Ctrl-C
    Serve,
    /// Run execution cycles one job at a time, stopping early when idle
    Run {
        /// Number of cycles to run
        #[arg(long, default_value = "1")]
        cycles: usize,
        /// Reconcile orphaned RUNNING jobs first; only safe when no other
        /// engine uses the same store
        #[arg(long)]
        recover: bool,
    },
    /// Show queue and capacity summary
    Status,
}

fn parse_resource(raw: &str) -> std::result::Result<(String, u64), String> {
    let (name, quantity) = raw
        .split_once('=')
        .ok_or_else(|| format!("expected NAME=QUANTITY, got {raw:?}"))?;
    let quantity = quantity
        .trim()
        .parse()
        .map_err(|e| format!("invalid quantity in {raw:?}: {e}"))?;
    Ok((name.trim().to_string(), quantity))
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let config = SmartqConfig::load(cli.config.as_deref())?;

    let storage = open_storage(&config.database).await?;
    let notifier = Notifier::default();
    let service = JobService::new(Arc::clone(&storage), config.resources.clone()).with_notifier(notifier.clone());

    match cli.command {
        Commands::Submit {
            job_type,
            priority,
            payload,
            cpu,
            memory,
            resources,
            depends_on,
            max_attempts,
            backoff,
            timeout,
            idempotency_key,
        } => {
            let mut requirements: ResourceRequirements = resources.into_iter().collect();
            if let Some(cpu) = cpu {
                requirements = requirements.with(CPU_UNITS, cpu);
            }
            if let Some(memory) = memory {
                requirements = requirements.with(MEMORY_MB, memory);
            }

            let mut spec = JobSpec::new(job_type)
                .with_priority(priority)
                .with_resources(requirements)
                .with_retry(RetryConfig {
                    max_attempts,
                    backoff_multiplier: backoff,
                });
            if let Some(raw) = payload {
                spec = spec.with_payload(serde_json::from_str(&raw).context("payload is not valid JSON")?);
            }
            for dep in depends_on {
                spec = spec.depends_on(dep);
            }
            if let Some(seconds) = timeout {
                spec = spec.with_timeout(seconds);
            }
            if let Some(key) = idempotency_key {
                spec = spec.with_idempotency_key(key);
            }

            let submission = service.submit(spec).await?;
            if submission.created {
                println!("Submitted job: {} - {}", submission.job.id, submission.job.job_type);
            } else {
                println!("Existing job: {} ({})", submission.job.id, submission.job.status);
            }
        }
        Commands::List { status, limit } => {
            let filter = JobFilter {
                statuses: status.map(|s| vec![s]),
                limit,
            };
            let jobs = service.list(&filter).await?;

            println!("Jobs ({})", jobs.len());
            for job in jobs {
                println!(
                    "  {} | {:<9} | {:<8} | attempt {} | {}",
                    job.id, job.status, job.priority, job.current_attempt, job.job_type,
                );
            }
        }
        Commands::Show { id } => {
            let job = service.get(id).await?;
            print_job(&job)?;
        }
        Commands::Cancel { id } => {
            let job = service.cancel(id).await?;
            println!("Cancelled job: {}", job.id);
        }
        Commands::Logs { id } => {
            for entry in service.logs(id).await? {
                println!("{}  {}", entry.timestamp.to_rfc3339(), entry.message);
            }
        }
        Commands::Serve => {
            let engine = Arc::new(build_engine(&config, storage, notifier.clone()));
            engine.recover().await?;

            let shutdown = CancellationToken::new();
            tokio::spawn(log_events(notifier, shutdown.clone()));
            tokio::spawn({
                let shutdown = shutdown.clone();
                async move {
                    match tokio::signal::ctrl_c().await {
                        Ok(()) => info!("Shutdown requested"),
                        Err(e) => warn!(error = %e, "Cannot listen for Ctrl-C, stopping"),
                    }
                    shutdown.cancel();
                }
            });

            engine.run(shutdown).await?;
        }
        Commands::Run { cycles, recover } => {
            let engine = build_engine(&config, storage, notifier);
            if recover {
                engine.recover().await?;
            }

            for _ in 0..cycles {
                match engine.run_cycle().await? {
                    CycleResult::Executed { job_id, outcome } => println!("{job_id}: {outcome:?}"),
                    CycleResult::Idle => {
                        info!("No more jobs to execute");
                        break;
                    }
                }
            }
            info!("Completed {} cycles", engine.cycles());
        }
        Commands::Status => {
            let jobs = service.list(&JobFilter::default()).await?;
            let mut by_status: BTreeMap<&str, usize> = BTreeMap::new();
            for job in &jobs {
                *by_status.entry(job.status.as_str()).or_default() += 1;
            }

            println!("smartq status");
            println!("  Store: {}", config.database.url);
            for status in JobStatus::ALL {
                if let Some(count) = by_status.get(status.as_str()) {
                    println!("  {:<9} {}", status, count);
                }
            }
            println!("  Capacity:");
            for (dimension, total) in &config.resources {
                println!("    {dimension}: {total}");
            }
        }
    }

    Ok(())
}

async fn open_storage(database: &DatabaseConfig) -> Result<Arc<dyn Storage>> {
    if database.is_memory() {
        warn!("Using the in-memory store; jobs are lost when this process exits");
        return Ok(Arc::new(MemoryStorage::new()));
    }
    let storage = SqliteStorage::new(&database.url)
        .await
        .with_context(|| format!("opening {}", database.url))?;
    Ok(Arc::new(storage))
}

fn build_engine(
    config: &SmartqConfig,
    storage: Arc<dyn Storage>,
    notifier: Notifier,
) -> ExecutionEngine {
    let ledger = Arc::new(ResourceLedger::new(config.resources.clone()));
    let duration = Duration::try_from_secs_f64(config.scheduler.simulated_duration_secs)
        .unwrap_or_else(|_| Duration::from_secs(10));

    ExecutionEngine::new(storage, ledger, EngineConfig::from(&config.scheduler))
        .with_body(Arc::new(SimulatedWork::new(duration)))
        .with_notifier(notifier)
}

async fn log_events(notifier: Notifier, shutdown: CancellationToken) {
    let mut events = notifier.subscribe();
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            received = events.recv() => match received {
                Ok(event) => info!(kind = ?event.kind, "{event}"),
                Err(RecvError::Lagged(skipped)) => warn!(skipped, "Event subscriber lagged"),
                Err(RecvError::Closed) => break,
            },
        }
    }
}

fn print_job(job: &Job) -> Result<()> {
    println!("Job: {}", job.id);
    println!("  Type: {}", job.job_type);
    println!("  Status: {}", job.status);
    println!("  Priority: {}", job.priority);
    println!("  Attempt: {}", job.current_attempt);
    if !job.resources.is_empty() {
        let listed: Vec<_> = job.resources.iter().map(|(d, q)| format!("{d}={q}")).collect();
        println!("  Resources: {}", listed.join(", "));
    }
    if !job.depends_on.is_empty() {
        let listed: Vec<_> = job.depends_on.iter().map(ToString::to_string).collect();
        println!("  Depends on: {}", listed.join(", "));
    }
    if let Some(timeout) = job.timeout_seconds {
        println!("  Timeout: {timeout}s");
    }
    if let Some(key) = &job.idempotency_key {
        println!("  Idempotency key: {key}");
    }
    if let Some(error) = &job.last_error {
        println!("  Last error: {error}");
    }
    if let Some(run_at) = job.run_at {
        println!("  Not before: {run_at}");
    }
    println!("  Created: {}", job.created_at);
    if let Some(at) = job.started_at {
        println!("  Started: {at}");
    }
    if let Some(at) = job.completed_at {
        println!("  Completed: {at}");
    }
    if !job.payload.is_null() {
        println!(
            "  Payload: {}",
            serde_json::to_string_pretty(&job.payload)?
        );
    }
    Ok(())
}

// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! semo-office main entry point - config, plan inspection and simulation.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use clap::{Parser, Subcommand};
use colored::Colorize;
use indicatif::{ProgressBar, ProgressStyle};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use semo_office::config::{self, CliOptions, OrchestratorConfig};
use semo_office::orchestrate::{JobExecutor, JobOutcome, Orchestrator};
use semo_office::scheduler::DependencyGraph;
use semo_office::session::Session;
use semo_office::telemetry::{init_telemetry, TelemetryConfig, GLOBAL_METRICS};
use semo_office::types::{Job, JobPlan};
use semo_office::{ExecutionError, VERSION};

/// semo-office - schedule and run decomposed agent jobs.
#[derive(Parser)]
#[command(name = "semo-office")]
#[command(author, version, about = "Job scheduling core for agent offices", long_about = None)]
struct Cli {
    /// Show verbose output
    #[arg(short = 'v', long, global = true)]
    verbose: bool,

    /// Show debug output
    #[arg(long, global = true)]
    debug: bool,

    /// Override scheduler.maxParallelJobs
    #[arg(long, global = true, env = "SEMO_OFFICE_MAX_PARALLEL")]
    max_parallel: Option<usize>,

    /// Override scheduler.pollingInterval (milliseconds)
    #[arg(long, global = true)]
    poll_interval_ms: Option<u64>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Show or initialize configuration
    Config {
        #[command(subcommand)]
        action: Option<ConfigAction>,
    },

    /// Print execution waves, cycles and graph stats for a plan file
    Plan {
        /// JSON or YAML plan file
        file: PathBuf,
    },

    /// Run a plan against a simulated executor
    Simulate {
        /// JSON or YAML plan file
        file: PathBuf,

        /// Probability that an execution fails (0-1)
        #[arg(long, default_value_t = 0.1)]
        fail_rate: f64,

        /// How long each simulated execution takes
        #[arg(long, default_value_t = 500)]
        duration_ms: u64,

        /// Seed for reproducible failures
        #[arg(long)]
        seed: Option<u64>,
    },

    /// Show version information
    Version,
}

#[derive(Subcommand)]
enum ConfigAction {
    /// Show the resolved configuration
    Show,
    /// Write an example .semo-office.json
    Init,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let _guard = init_telemetry(&TelemetryConfig::for_cli(cli.verbose, cli.debug))?;

    let cli_options = CliOptions {
        max_parallel: cli.max_parallel,
        poll_interval_ms: cli.poll_interval_ms,
    };

    match cli.command {
        Commands::Config { action } => handle_config(action, cli_options),
        Commands::Plan { file } => handle_plan(&file),
        Commands::Simulate {
            file,
            fail_rate,
            duration_ms,
            seed,
        } => {
            let workspace_root = std::env::current_dir()?;
            let config = config::load_config(&workspace_root, cli_options)?;
            let executor = SimulatedExecutor::new(
                fail_rate,
                Duration::from_millis(duration_ms),
                seed,
            )?;
            simulate(config, &file, executor).await
        }
        Commands::Version => {
            println!("semo-office {}", VERSION);
            Ok(())
        }
    }
}

fn handle_config(action: Option<ConfigAction>, cli_options: CliOptions) -> anyhow::Result<()> {
    let workspace_root = std::env::current_dir()?;
    match action {
        Some(ConfigAction::Show) | None => {
            let config = config::load_config(&workspace_root, cli_options)?;
            println!("{}", serde_json::to_string_pretty(&config.to_workspace())?);
        }
        Some(ConfigAction::Init) => {
            let path = config::init_config(&workspace_root, Some(config::get_example_config()))?;
            println!("Created config file: {}", path.display());
        }
    }
    Ok(())
}

fn load_plan(file: &Path) -> anyhow::Result<JobPlan> {
    let plan = JobPlan::load(file).with_context(|| format!("reading plan {}", file.display()))?;
    if plan.jobs.is_empty() {
        return Err(semo_office::PlanError::Empty.into());
    }
    Ok(plan)
}

fn handle_plan(file: &Path) -> anyhow::Result<()> {
    let plan = load_plan(file)?;
    let graph = DependencyGraph::from_decomposed(&plan.jobs);

    println!(
        "{}",
        format!("Plan for {} ({} jobs)", plan.owner_id, graph.len())
            .bright_blue()
            .bold()
    );
    print!("{}", graph.execution_order().render());

    for (job, dep) in graph.missing_dependencies() {
        println!("{} {job} depends on unknown job {dep}", "warning:".yellow());
    }
    for cycle in graph.detect_cycles() {
        println!("{} {}", "cycle:".red(), cycle.join(" -> "));
    }

    let stats = graph.stats();
    println!(
        "\n{} jobs, {} edges, {} roots, max depth {}",
        stats.jobs, stats.edges, stats.roots, stats.max_depth
    );
    Ok(())
}

async fn simulate(
    config: OrchestratorConfig,
    file: &Path,
    executor: SimulatedExecutor,
) -> anyhow::Result<()> {
    let plan = load_plan(file)?;
    let orchestrator = Orchestrator::new(config, Arc::new(executor))?;
    let owner = plan.owner_id.clone();
    let total = orchestrator.enqueue(plan.jobs, &owner).len();

    let progress = ProgressBar::new(total as u64);
    progress.set_style(
        ProgressStyle::with_template("{spinner} [{elapsed_precise}] {bar:40.cyan/blue} {pos}/{len} {msg}")?
            .progress_chars("=> "),
    );
    progress.enable_steady_tick(Duration::from_millis(120));

    orchestrator.start();
    let settled = orchestrator.wait_until_settled(&owner);
    tokio::pin!(settled);
    let mut ticker = tokio::time::interval(Duration::from_millis(100));
    loop {
        tokio::select! {
            _ = &mut settled => break,
            _ = ticker.tick() => {
                let stats = orchestrator.scheduler().get_stats(&owner);
                progress.set_position((stats.done + stats.merged + stats.failed) as u64);
                progress.set_message(format!(
                    "{} running, {} failed",
                    stats.processing, stats.failed
                ));
            }
        }
    }

    let stats = orchestrator.stats(&owner);
    let finished = stats.scheduler.done + stats.scheduler.merged + stats.scheduler.failed;
    progress.set_position(finished as u64);
    progress.finish_with_message("settled");
    orchestrator.shutdown();

    let scheduler = &stats.scheduler;
    println!(
        "\n{} {} done, {} failed, {} stranded ({:.0}% complete)",
        "Result:".bold(),
        scheduler.done.to_string().green(),
        scheduler.failed.to_string().red(),
        scheduler.pending,
        scheduler.completion_rate
    );
    println!(
        "Retries: {} attempts, {} exhausted",
        stats.retry.total_attempts, stats.retry.exhausted
    );
    println!("\n{}", GLOBAL_METRICS.snapshot().format_report());
    Ok(())
}

/// Executor that sleeps, then fails with a fixed probability.
struct SimulatedExecutor {
    fail_rate: f64,
    duration: Duration,
    rng: Mutex<StdRng>,
    next_pr: AtomicU64,
}

impl SimulatedExecutor {
    fn new(fail_rate: f64, duration: Duration, seed: Option<u64>) -> anyhow::Result<Self> {
        if !(0.0..=1.0).contains(&fail_rate) {
            anyhow::bail!("--fail-rate must be between 0 and 1, got {fail_rate}");
        }
        let rng = match seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        Ok(Self {
            fail_rate,
            duration,
            rng: Mutex::new(rng),
            next_pr: AtomicU64::new(1),
        })
    }
}

#[async_trait]
impl JobExecutor for SimulatedExecutor {
    async fn execute(&self, job: &Job, session: &Session) -> Result<JobOutcome, ExecutionError> {
        tracing::debug!(job_id = %job.id, session_id = %session.id, "Simulating job");
        tokio::time::sleep(self.duration).await;

        let roll: f64 = self
            .rng
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .gen();
        if roll < self.fail_rate {
            return Err(ExecutionError::failed(format!(
                "simulated failure in {}",
                job.role_or_default()
            )));
        }
        Ok(JobOutcome::with_pr(self.next_pr.fetch_add(1, Ordering::Relaxed)))
    }
}

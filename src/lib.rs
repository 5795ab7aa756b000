// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! semo-office - job scheduling and execution lifecycle for agent offices.
//!
//! A decomposed plan becomes a set of jobs with dependencies. The crate
//! decides which jobs may run, hands them out under a parallelism ceiling,
//! retries the ones that fail, watches their wall-clock budgets and leases
//! them execution sessions.
//!
//! # Architecture
//!
//! The crate is organized into the following modules:
//!
//! - [`types`] - Job, status and plan definitions
//! - [`error`] - Error types and result aliases
//! - [`events`] - Observer registration shared by every component
//! - [`timer`] - Owned one-shot timers
//! - [`scheduler`] - Dependency-aware job scheduler, retry and timeout managers
//! - [`session`] - Warm/cold session pool with per-role circuit breakers
//! - [`orchestrate`] - Executor trait and the orchestrator wiring it all together
//! - [`config`] - Configuration loading and merging
//! - [`telemetry`] - Tracing, metrics, and observability infrastructure
//!
//! # Example
//!
//! ```rust,ignore
//! use semo_office::config::{load_config, CliOptions};
//! use semo_office::orchestrate::Orchestrator;
//! use semo_office::types::JobPlan;
//!
//! let config = load_config(".".as_ref(), CliOptions::default())?;
//! let plan = JobPlan::load("plan.yaml".as_ref())?;
//!
//! let orchestrator = Orchestrator::new(config, executor)?;
//! orchestrator.enqueue(plan.jobs, &plan.owner_id);
//! orchestrator.start();
//! orchestrator.wait_until_settled(&plan.owner_id).await;
//! ```

pub mod config;
pub mod error;
pub mod events;
pub mod orchestrate;
pub mod scheduler;
pub mod session;
pub mod telemetry;
pub mod timer;
pub mod types;

// Re-export commonly used types at crate root
pub use error::{ConfigError, ExecutionError, PlanError, PoolError, Result};
pub use orchestrate::{JobExecutor, JobOutcome, Orchestrator};
pub use scheduler::{JobScheduler, RetryManager, TimeoutManager};
pub use session::{Session, SessionPool};
pub use types::{DecomposedJob, Job, JobPlan, JobStatus};

/// semo-office version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Job execution on top of the scheduling core.
//!
//! # Architecture
//!
//! - **JobExecutor**: the trait a caller implements to actually run a job
//!   (spawn an agent, open a PR, ...) inside a leased [`Session`].
//!
//! - **Orchestrator**: owns a [`JobScheduler`], [`RetryManager`],
//!   [`TimeoutManager`] and [`SessionPool`] and drives each dispatched job
//!   through acquire, execute, complete or fail, and retry.
//!
//! # Usage
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use semo_office::config::OrchestratorConfig;
//! use semo_office::orchestrate::Orchestrator;
//!
//! let orchestrator = Orchestrator::new(OrchestratorConfig::default(), Arc::new(MyExecutor))?;
//! orchestrator.enqueue(plan.jobs, &plan.owner_id);
//! orchestrator.start();
//! orchestrator.wait_until_settled(&plan.owner_id).await;
//! orchestrator.shutdown();
//! ```
//!
//! Timeouts are decoupled from scheduling: the [`TimeoutManager`] only emits
//! events, and the orchestrator's listener turns a hard expiry into an
//! aborted execution that flows through the normal failure path.
//!
//! [`Session`]: crate::session::Session
//! [`JobScheduler`]: crate::scheduler::JobScheduler
//! [`RetryManager`]: crate::scheduler::RetryManager
//! [`TimeoutManager`]: crate::scheduler::TimeoutManager
//! [`SessionPool`]: crate::session::SessionPool

mod executor;
mod orchestrator;

pub use executor::{JobExecutor, JobOutcome};
pub use orchestrator::{Orchestrator, OrchestratorStats, DEFAULT_WORKTREE_ROOT};

#[cfg(test)]
pub use executor::MockJobExecutor;

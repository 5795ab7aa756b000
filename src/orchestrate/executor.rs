// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! The seam between the orchestrator and whatever actually runs a job.

use async_trait::async_trait;
use serde::Serialize;

use crate::error::ExecutionError;
use crate::session::Session;
use crate::types::Job;

/// Result of a successful execution.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct JobOutcome {
    /// Pull request opened for the job, if any.
    pub pr_number: Option<u64>,
}

impl JobOutcome {
    pub fn with_pr(pr_number: u64) -> Self {
        Self {
            pr_number: Some(pr_number),
        }
    }
}

/// Runs one job inside a leased session.
///
/// Implementations should be cancel-safe: a timed-out execution is aborted
/// at its next await point.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait JobExecutor: Send + Sync {
    async fn execute(&self, job: &Job, session: &Session) -> Result<JobOutcome, ExecutionError>;
}

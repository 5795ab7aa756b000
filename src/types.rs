// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Core type definitions for the orchestration core.
//!
//! This module defines the job records that flow between the decomposition
//! producer, the [`JobScheduler`](crate::scheduler::JobScheduler) and the
//! executors that actually run agent sessions.

use std::fmt;
use std::path::Path;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::PlanError;

// ============================================================================
// Agent Roles
// ============================================================================

/// Agent role name.
///
/// Roles are free-form strings so offices can define their own teams
/// without code changes. The constants in [`roles`] cover the common ones.
pub type AgentRole = String;

/// Well-known agent role names.
pub mod roles {
    pub const PO: &str = "PO";
    pub const PM: &str = "PM";
    pub const ARCHITECT: &str = "Architect";
    pub const FE: &str = "FE";
    pub const BE: &str = "BE";
    pub const QA: &str = "QA";
    pub const DEVOPS: &str = "DevOps";

    /// Roles the warm pool is pre-seeded with, in round-robin order.
    pub const WARM_POOL_ROLES: &[&str] = &[FE, BE, QA, DEVOPS];
}

// ============================================================================
// Job Status
// ============================================================================

/// Lifecycle status of a job.
///
/// ```text
/// pending ──▶ ready ──▶ processing ──┬──▶ done ──▶ merged
///                                    └──▶ failed
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    /// Waiting on at least one dependency.
    Pending,
    /// Eligible for execution.
    Ready,
    /// Handed to an executor.
    Processing,
    /// Finished successfully.
    Done,
    /// Finished and its pull request merged.
    Merged,
    /// Finished unsuccessfully.
    Failed,
}

impl JobStatus {
    /// All statuses, in lifecycle order.
    pub const ALL: [JobStatus; 6] = [
        JobStatus::Pending,
        JobStatus::Ready,
        JobStatus::Processing,
        JobStatus::Done,
        JobStatus::Merged,
        JobStatus::Failed,
    ];

    /// Whether a dependent may treat this status as satisfied.
    pub fn satisfies_dependency(&self) -> bool {
        matches!(self, Self::Done | Self::Merged)
    }

    /// Check if this status represents a terminal state.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Done | Self::Merged | Self::Failed)
    }

    /// Status name as used in events and reports.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Ready => "ready",
            Self::Processing => "processing",
            Self::Done => "done",
            Self::Merged => "merged",
            Self::Failed => "failed",
        }
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ============================================================================
// Job
// ============================================================================

/// A unit of decomposed work.
///
/// Jobs are owned by the scheduler. Accessors hand out clones, so a `Job`
/// held by a caller is a snapshot and never reflects later transitions.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    /// Unique job identifier.
    pub id: String,
    /// Office (tenant) that owns this job.
    pub office_id: String,
    /// Role expected to execute the job.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub role: Option<AgentRole>,
    /// Free-text description of the work.
    pub description: String,
    /// Current lifecycle status.
    pub status: JobStatus,
    /// Ids of jobs that must be done or merged first.
    #[serde(default)]
    pub depends_on: Vec<String>,
    /// Scheduling priority, lower runs first.
    pub priority: i32,
    /// Pull request opened for this job, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pr_number: Option<u64>,
    /// Last failure reason.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Number of times the job has entered `processing`.
    #[serde(default)]
    pub attempts: u32,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
}

impl Job {
    /// Build a job from a decomposition record.
    ///
    /// The job starts `ready` when it has no dependencies and `pending`
    /// otherwise.
    pub fn from_decomposed(decomposed: DecomposedJob, office_id: impl Into<String>) -> Self {
        let status = if decomposed.depends_on.is_empty() {
            JobStatus::Ready
        } else {
            JobStatus::Pending
        };

        Self {
            id: decomposed.id,
            office_id: office_id.into(),
            role: decomposed.role,
            description: decomposed.description,
            status,
            depends_on: decomposed.depends_on,
            priority: decomposed.priority,
            pr_number: None,
            error: None,
            attempts: 0,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
        }
    }

    /// Role name, or `"default"` when the job carries none.
    pub fn role_or_default(&self) -> &str {
        self.role.as_deref().unwrap_or("default")
    }

    /// Whether the job has reached a terminal status.
    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }
}

// ============================================================================
// Decomposition Input
// ============================================================================

/// A job as produced by the request decomposer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DecomposedJob {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub role: Option<AgentRole>,
    pub description: String,
    #[serde(default)]
    pub depends_on: Vec<String>,
    #[serde(default)]
    pub priority: i32,
}

impl DecomposedJob {
    /// Create a decomposed job with no dependencies and priority 0.
    pub fn new(id: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            role: None,
            description: description.into(),
            depends_on: Vec::new(),
            priority: 0,
        }
    }

    /// Set the executing role.
    pub fn with_role(mut self, role: impl Into<String>) -> Self {
        self.role = Some(role.into());
        self
    }

    /// Set the dependency list.
    pub fn with_depends_on<I, S>(mut self, deps: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.depends_on = deps.into_iter().map(Into::into).collect();
        self
    }

    /// Set the priority.
    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }
}

/// A full decomposition: the jobs for one office request.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct JobPlan {
    /// Office the jobs belong to.
    pub owner_id: String,
    /// Decomposed jobs in producer order.
    #[serde(default)]
    pub jobs: Vec<DecomposedJob>,
}

impl JobPlan {
    /// Load a plan from a JSON or YAML file.
    pub fn load(path: &Path) -> Result<Self, PlanError> {
        let content = std::fs::read_to_string(path)?;

        let extension = path
            .extension()
            .and_then(|e| e.to_str())
            .unwrap_or("")
            .to_lowercase();

        match extension.as_str() {
            "yaml" | "yml" => serde_yaml::from_str(&content).map_err(PlanError::from),
            _ => serde_json::from_str(&content).map_err(PlanError::from),
        }
    }
}

// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Dependency-aware job scheduling.
//!
//! The [`JobScheduler`] owns every [`Job`] and drives a cooperative poll loop:
//!
//! ```text
//!   enqueue ──▶ ┌──────────────────────────────┐
//!               │ JobScheduler                 │
//!               │  jobs + insertion order      │
//!               │  dependents index            │
//!               └──────────────┬───────────────┘
//!                              │ every polling interval
//!                              ▼
//!        ready jobs (priority, then insertion order)
//!                              │ up to maxParallelJobs - processing
//!                              ▼
//!                 start_job ──▶ on_job_ready(job)
//!                                     │ Err / panic
//!                                     ▼
//!                                  fail_job
//! ```
//!
//! [`RetryManager`] and [`TimeoutManager`] are independent trackers keyed by
//! job id. The scheduler never calls them; the executor integration in
//! [`crate::orchestrate`] keeps all three consistent.

pub mod dependency;
pub mod retry;
pub mod timeout;

pub use dependency::{DependencyGraph, ExecutionOrder, GraphStats};
pub use retry::{
    RetryConfig, RetryDecision, RetryEvent, RetryManager, RetrySnapshot, RetryStats, RetryStatus,
    DEFAULT_NON_RETRYABLE_PATTERNS,
};
pub use timeout::{
    TimeoutConfig, TimeoutEvent, TimeoutManager, TimeoutSnapshot, TimeoutStats, TimeoutStatus,
};

use std::collections::{BTreeMap, HashMap};
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::events::EventBus;
use crate::types::{DecomposedJob, Job, JobStatus};

/// Scheduler configuration.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SchedulerConfig {
    /// Ceiling on jobs in `processing` at once.
    pub max_parallel_jobs: usize,
    /// Delay between poll ticks.
    pub polling_interval: Duration,
    /// Optional per-role ceilings. Roles not listed are only bound by
    /// `max_parallel_jobs`.
    pub max_concurrent_by_role: HashMap<String, usize>,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            max_parallel_jobs: 6,
            polling_interval: Duration::from_secs(5),
            max_concurrent_by_role: HashMap::new(),
        }
    }
}

impl SchedulerConfig {
    /// Set the parallelism ceiling.
    pub fn with_max_parallel_jobs(mut self, max: usize) -> Self {
        self.max_parallel_jobs = max;
        self
    }

    /// Set the poll interval.
    pub fn with_polling_interval(mut self, interval: Duration) -> Self {
        self.polling_interval = interval;
        self
    }

    /// Cap concurrent jobs for one role.
    pub fn with_role_limit(mut self, role: impl Into<String>, max: usize) -> Self {
        self.max_concurrent_by_role.insert(role.into(), max);
        self
    }
}

/// Per-owner job counts.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct SchedulerStats {
    pub total: usize,
    pub pending: usize,
    pub ready: usize,
    pub processing: usize,
    pub done: usize,
    pub merged: usize,
    pub failed: usize,
    /// `(done + merged) / total * 100`, or 0 with no jobs.
    pub completion_rate: f64,
    /// Jobs in `processing` across every owner.
    pub active_executions: usize,
    /// Processing jobs of this owner, per role.
    pub by_role: BTreeMap<String, usize>,
}

/// A job currently in `processing`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ActiveExecution {
    pub job_id: String,
    pub office_id: String,
    pub role: Option<String>,
    pub started_at: Option<DateTime<Utc>>,
    pub elapsed_ms: u64,
}

/// Notifications emitted by the scheduler.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum SchedulerEvent {
    Enqueued { owner_id: String, job_ids: Vec<String> },
    Started { job_id: String },
    Completed { job_id: String, pr_number: Option<u64>, newly_ready: Vec<String> },
    Failed { job_id: String, error: String },
    Merged { job_id: String },
    Retried { job_id: String },
    Cancelled { job_id: String },
    LoopStarted,
    LoopStopped,
}

#[derive(Default)]
struct State {
    jobs: HashMap<String, Job>,
    /// Insertion order, used to break priority ties.
    order: Vec<String>,
    /// Dependency id to the jobs that list it.
    dependents: HashMap<String, Vec<String>>,
    started: HashMap<String, Instant>,
    running: bool,
    loop_task: Option<JoinHandle<()>>,
}

impl State {
    fn ready_jobs(&self) -> Vec<Job> {
        let mut ready: Vec<Job> = self
            .order
            .iter()
            .filter_map(|id| self.jobs.get(id))
            .filter(|j| j.status == JobStatus::Ready)
            .cloned()
            .collect();
        // sort_by_key is stable.
        ready.sort_by_key(|j| j.priority);
        ready
    }

    fn processing_by_role(&self) -> HashMap<String, usize> {
        let mut counts = HashMap::new();
        for job in self.jobs.values().filter(|j| j.status == JobStatus::Processing) {
            *counts.entry(job.role_or_default().to_string()).or_insert(0) += 1;
        }
        counts
    }

    fn processing_count(&self) -> usize {
        self.jobs
            .values()
            .filter(|j| j.status == JobStatus::Processing)
            .count()
    }

    fn link_dependents(&mut self, job: &Job) {
        for dep in &job.depends_on {
            let list = self.dependents.entry(dep.clone()).or_default();
            if !list.contains(&job.id) {
                list.push(job.id.clone());
            }
        }
    }

    fn unlink_dependents(&mut self, job: &Job) {
        for dep in &job.depends_on {
            if let Some(list) = self.dependents.get_mut(dep) {
                list.retain(|id| id != &job.id);
            }
        }
    }

    fn start_job(&mut self, job_id: &str) -> Option<Job> {
        let job = self.jobs.get_mut(job_id)?;
        if job.status != JobStatus::Ready {
            return None;
        }
        job.status = JobStatus::Processing;
        job.started_at = Some(Utc::now());
        job.attempts += 1;
        self.started.insert(job_id.to_string(), Instant::now());
        Some(job.clone())
    }
}

struct Shared {
    config: SchedulerConfig,
    state: Mutex<State>,
    events: EventBus<SchedulerEvent>,
}

impl Shared {
    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Owner of the job DAG and driver of the poll loop.
///
/// Cloning is cheap; clones share the same jobs. Every read returns a
/// snapshot. Unknown ids are reported as `None` rather than errors.
#[derive(Clone)]
pub struct JobScheduler {
    shared: Arc<Shared>,
}

impl JobScheduler {
    /// Create a scheduler with no jobs.
    pub fn new(config: SchedulerConfig) -> Self {
        Self {
            shared: Arc::new(Shared {
                config,
                state: Mutex::new(State::default()),
                events: EventBus::new(),
            }),
        }
    }

    /// Active configuration.
    pub fn config(&self) -> &SchedulerConfig {
        &self.shared.config
    }

    /// Register an observer for scheduler events.
    pub fn subscribe(&self) -> mpsc::UnboundedReceiver<SchedulerEvent> {
        self.shared.events.subscribe()
    }

    /// Insert a batch of decomposed jobs.
    ///
    /// A job is `ready` iff its dependency list is empty. Dependencies are not
    /// checked for existence or cycles; use [`DependencyGraph`] for that.
    /// Re-enqueueing an existing id replaces the record but keeps its
    /// original position for tie-breaking.
    pub fn enqueue(&self, jobs: Vec<DecomposedJob>, owner_id: &str) -> Vec<Job> {
        let created: Vec<Job> = {
            let mut state = self.shared.state();
            jobs.into_iter()
                .map(|decomposed| {
                    let job = Job::from_decomposed(decomposed, owner_id);
                    match state.jobs.get(&job.id).cloned() {
                        Some(previous) => state.unlink_dependents(&previous),
                        None => state.order.push(job.id.clone()),
                    }
                    state.link_dependents(&job);
                    state.started.remove(&job.id);
                    state.jobs.insert(job.id.clone(), job.clone());
                    job
                })
                .collect()
        };

        info!(owner_id, count = created.len(), "Enqueued jobs");
        self.shared.events.emit(SchedulerEvent::Enqueued {
            owner_id: owner_id.to_string(),
            job_ids: created.iter().map(|j| j.id.clone()).collect(),
        });
        created
    }

    /// Jobs in `ready`, ascending priority, ties in insertion order.
    pub fn get_ready_jobs(&self) -> Vec<Job> {
        self.shared.state().ready_jobs()
    }

    /// Move a job from `ready` to `processing`.
    pub fn start_job(&self, job_id: &str) -> Option<Job> {
        let job = self.shared.state().start_job(job_id)?;
        info!(job_id, attempt = job.attempts, "Job started");
        self.shared.events.emit(SchedulerEvent::Started {
            job_id: job_id.to_string(),
        });
        Some(job)
    }

    /// Mark a job `done` and promote direct dependents whose dependencies
    /// are now all satisfied.
    pub fn complete_job(&self, job_id: &str, pr_number: Option<u64>) -> Option<Job> {
        let (job, newly_ready) = {
            let mut state = self.shared.state();
            let job = state.jobs.get_mut(job_id)?;
            job.status = JobStatus::Done;
            job.completed_at = Some(Utc::now());
            if pr_number.is_some() {
                job.pr_number = pr_number;
            }
            let job = job.clone();
            state.started.remove(job_id);

            let candidates = state.dependents.get(job_id).cloned().unwrap_or_default();
            let mut newly_ready = Vec::new();
            for id in candidates {
                let satisfied = match state.jobs.get(&id) {
                    Some(dependent) if dependent.status == JobStatus::Pending => {
                        dependent.depends_on.iter().all(|dep| {
                            state
                                .jobs
                                .get(dep)
                                .is_some_and(|d| d.status.satisfies_dependency())
                        })
                    }
                    _ => false,
                };
                if satisfied {
                    if let Some(dependent) = state.jobs.get_mut(&id) {
                        dependent.status = JobStatus::Ready;
                        newly_ready.push(id);
                    }
                }
            }
            (job, newly_ready)
        };

        info!(job_id, newly_ready = newly_ready.len(), "Job completed");
        self.shared.events.emit(SchedulerEvent::Completed {
            job_id: job_id.to_string(),
            pr_number: job.pr_number,
            newly_ready,
        });
        Some(job)
    }

    /// Mark a job `failed`.
    ///
    /// Dependents are left `pending`; nothing cascades.
    pub fn fail_job(&self, job_id: &str, error: Option<&str>) -> Option<Job> {
        let error = error.unwrap_or("Unknown error").to_string();
        let job = {
            let mut state = self.shared.state();
            let job = state.jobs.get_mut(job_id)?;
            job.status = JobStatus::Failed;
            job.completed_at = Some(Utc::now());
            job.error = Some(error.clone());
            let job = job.clone();
            state.started.remove(job_id);
            job
        };

        warn!(job_id, error = %error, "Job failed");
        self.shared.events.emit(SchedulerEvent::Failed {
            job_id: job_id.to_string(),
            error,
        });
        Some(job)
    }

    /// Move a job from `done` to `merged`.
    pub fn mark_merged(&self, job_id: &str) -> Option<Job> {
        let job = {
            let mut state = self.shared.state();
            let job = state.jobs.get_mut(job_id)?;
            if job.status != JobStatus::Done {
                return None;
            }
            job.status = JobStatus::Merged;
            job.clone()
        };

        info!(job_id, "Job merged");
        self.shared.events.emit(SchedulerEvent::Merged {
            job_id: job_id.to_string(),
        });
        Some(job)
    }

    /// Put a failed job back into `ready`, keeping its last error.
    pub fn retry_job(&self, job_id: &str) -> Option<Job> {
        let job = {
            let mut state = self.shared.state();
            let job = state.jobs.get_mut(job_id)?;
            if job.status != JobStatus::Failed {
                return None;
            }
            job.status = JobStatus::Ready;
            job.completed_at = None;
            job.clone()
        };

        info!(job_id, attempts = job.attempts, "Job ready for retry");
        self.shared.events.emit(SchedulerEvent::Retried {
            job_id: job_id.to_string(),
        });
        Some(job)
    }

    /// Fail a non-terminal job with a `cancelled` error.
    pub fn cancel_job(&self, job_id: &str) -> Option<Job> {
        let job = {
            let mut state = self.shared.state();
            let job = state.jobs.get_mut(job_id)?;
            if job.is_terminal() {
                return None;
            }
            job.status = JobStatus::Failed;
            job.completed_at = Some(Utc::now());
            job.error = Some("cancelled".to_string());
            let job = job.clone();
            state.started.remove(job_id);
            job
        };

        info!(job_id, "Job cancelled");
        self.shared.events.emit(SchedulerEvent::Cancelled {
            job_id: job_id.to_string(),
        });
        Some(job)
    }

    /// Cancel every non-terminal job of an owner. Returns how many changed.
    pub fn cancel_all_jobs(&self, owner_id: &str) -> usize {
        let ids: Vec<String> = self
            .get_jobs(owner_id)
            .into_iter()
            .filter(|j| !j.is_terminal())
            .map(|j| j.id)
            .collect();
        ids.iter().filter(|id| self.cancel_job(id).is_some()).count()
    }

    /// Snapshot of one job.
    pub fn get_job(&self, job_id: &str) -> Option<Job> {
        self.shared.state().jobs.get(job_id).cloned()
    }

    /// Snapshots of an owner's jobs, in insertion order.
    pub fn get_jobs(&self, owner_id: &str) -> Vec<Job> {
        let state = self.shared.state();
        state
            .order
            .iter()
            .filter_map(|id| state.jobs.get(id))
            .filter(|j| j.office_id == owner_id)
            .cloned()
            .collect()
    }

    /// Every job in `processing`, oldest first.
    pub fn get_active_executions(&self) -> Vec<ActiveExecution> {
        let state = self.shared.state();
        let mut active: Vec<(Instant, ActiveExecution)> = state
            .order
            .iter()
            .filter_map(|id| state.jobs.get(id))
            .filter(|j| j.status == JobStatus::Processing)
            .map(|j| {
                let started = state.started.get(&j.id).copied().unwrap_or_else(Instant::now);
                let execution = ActiveExecution {
                    job_id: j.id.clone(),
                    office_id: j.office_id.clone(),
                    role: j.role.clone(),
                    started_at: j.started_at,
                    elapsed_ms: started.elapsed().as_millis() as u64,
                };
                (started, execution)
            })
            .collect();
        active.sort_by_key(|(started, _)| *started);
        active.into_iter().map(|(_, e)| e).collect()
    }

    /// Number of `processing` jobs for a role.
    ///
    /// Jobs without a role count under `"default"`.
    pub fn role_concurrency(&self, role: &str) -> usize {
        self.shared
            .state()
            .processing_by_role()
            .get(role)
            .copied()
            .unwrap_or(0)
    }

    /// Status counts for one owner.
    pub fn get_stats(&self, owner_id: &str) -> SchedulerStats {
        let state = self.shared.state();
        let mut stats = SchedulerStats {
            active_executions: state.processing_count(),
            ..SchedulerStats::default()
        };

        for job in state.jobs.values().filter(|j| j.office_id == owner_id) {
            stats.total += 1;
            match job.status {
                JobStatus::Pending => stats.pending += 1,
                JobStatus::Ready => stats.ready += 1,
                JobStatus::Processing => {
                    stats.processing += 1;
                    *stats
                        .by_role
                        .entry(job.role_or_default().to_string())
                        .or_insert(0) += 1;
                }
                JobStatus::Done => stats.done += 1,
                JobStatus::Merged => stats.merged += 1,
                JobStatus::Failed => stats.failed += 1,
            }
        }

        if stats.total > 0 {
            stats.completion_rate = (stats.done + stats.merged) as f64 / stats.total as f64 * 100.0;
        }
        stats
    }

    /// Whether the poll loop is running.
    pub fn is_running(&self) -> bool {
        self.shared.state().running
    }

    /// Start the poll loop.
    ///
    /// Each tick starts up to `max_parallel_jobs - processing` ready jobs and
    /// hands each to `on_job_ready` on its own task. An `Err` or a panic from
    /// the handler fails that job only. Calling `start` while running is a
    /// no-op. Requires a tokio runtime.
    pub fn start<F, Fut>(&self, on_job_ready: F)
    where
        F: Fn(Job) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        let mut state = self.shared.state();
        if state.running {
            warn!("Scheduler poll loop already running");
            return;
        }
        state.running = true;

        let weak = Arc::downgrade(&self.shared);
        let handler = Arc::new(on_job_ready);
        let interval = self.shared.config.polling_interval;
        state.loop_task = Some(tokio::spawn(async move {
            loop {
                if !poll_once(&weak, &handler) {
                    break;
                }
                tokio::time::sleep(interval).await;
            }
        }));
        drop(state);

        info!(
            max_parallel_jobs = self.shared.config.max_parallel_jobs,
            polling_interval_ms = interval.as_millis() as u64,
            "Scheduler started"
        );
        self.shared.events.emit(SchedulerEvent::LoopStarted);
    }

    /// Stop scheduling new ticks. In-flight handlers keep running.
    pub fn stop(&self) {
        let task = {
            let mut state = self.shared.state();
            if !state.running {
                return;
            }
            state.running = false;
            state.loop_task.take()
        };
        if let Some(task) = task {
            task.abort();
        }

        info!("Scheduler stopped");
        self.shared.events.emit(SchedulerEvent::LoopStopped);
    }

    /// Stop the loop and forget every job.
    pub fn shutdown(&self) {
        self.stop();
        let mut state = self.shared.state();
        state.jobs.clear();
        state.order.clear();
        state.dependents.clear();
        state.started.clear();
    }

    /// Pick the jobs for one tick and move them to `processing`.
    fn take_startable(&self) -> Vec<Job> {
        let config = &self.shared.config;
        let mut state = self.shared.state();
        if !state.running {
            return Vec::new();
        }

        let available = config
            .max_parallel_jobs
            .saturating_sub(state.processing_count());
        if available == 0 {
            return Vec::new();
        }

        let mut by_role = state.processing_by_role();
        let mut chosen = Vec::new();
        for job in state.ready_jobs() {
            if chosen.len() >= available {
                break;
            }
            let role = job.role_or_default();
            let running = by_role.get(role).copied().unwrap_or(0);
            if config
                .max_concurrent_by_role
                .get(role)
                .is_some_and(|&cap| running >= cap)
            {
                continue;
            }
            *by_role.entry(role.to_string()).or_insert(0) += 1;
            chosen.push(job.id);
        }

        chosen
            .iter()
            .filter_map(|id| state.start_job(id))
            .collect()
    }
}

impl std::fmt::Debug for JobScheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.shared.state();
        f.debug_struct("JobScheduler")
            .field("config", &self.shared.config)
            .field("jobs", &state.jobs.len())
            .field("running", &state.running)
            .finish()
    }
}

/// Run one poll tick. Returns `false` once the scheduler is gone or stopped.
fn poll_once<F, Fut>(weak: &Weak<Shared>, handler: &Arc<F>) -> bool
where
    F: Fn(Job) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    let Some(shared) = weak.upgrade() else {
        return false;
    };
    let scheduler = JobScheduler { shared };
    if !scheduler.is_running() {
        return false;
    }

    let jobs = scheduler.take_startable();
    debug!(started = jobs.len(), "Poll tick");

    for job in jobs {
        info!(job_id = %job.id, attempt = job.attempts, "Job started");
        scheduler.shared.events.emit(SchedulerEvent::Started {
            job_id: job.id.clone(),
        });
        dispatch(scheduler.clone(), Arc::clone(handler), job);
    }
    true
}

/// Run the handler on its own task and route failures to `fail_job`.
fn dispatch<F, Fut>(scheduler: JobScheduler, handler: Arc<F>, job: Job)
where
    F: Fn(Job) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    let job_id = job.id.clone();
    tokio::spawn(async move {
        let outcome = tokio::spawn((*handler)(job)).await;
        let error = match outcome {
            Ok(Ok(())) => return,
            Ok(Err(err)) => format!("{err:#}"),
            Err(join_err) if join_err.is_panic() => "Job handler panicked".to_string(),
            Err(_) => "Job handler cancelled".to_string(),
        };
        warn!(job_id = %job_id, error = %error, "Job handler failed");
        scheduler.fail_job(&job_id, Some(&error));
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    fn job(id: &str, deps: &[&str], priority: i32) -> DecomposedJob {
        DecomposedJob::new(id, format!("job {id}"))
            .with_depends_on(deps.iter().copied())
            .with_priority(priority)
    }

    fn ids(jobs: &[Job]) -> Vec<&str> {
        jobs.iter().map(|j| j.id.as_str()).collect()
    }

    #[test]
    fn test_enqueue_initial_status() {
        let scheduler = JobScheduler::new(SchedulerConfig::default());
        let jobs = scheduler.enqueue(vec![job("a", &[], 0), job("b", &["a"], 0)], "office");

        assert_eq!(jobs[0].status, JobStatus::Ready);
        assert_eq!(jobs[1].status, JobStatus::Pending);
        assert_eq!(jobs[1].office_id, "office");
    }

    #[test]
    fn test_ready_jobs_sorted_stably() {
        let scheduler = JobScheduler::new(SchedulerConfig::default());
        scheduler.enqueue(
            vec![job("x", &[], 2), job("y", &[], 1), job("z", &[], 2), job("w", &[], 1)],
            "office",
        );

        assert_eq!(ids(&scheduler.get_ready_jobs()), vec!["y", "w", "x", "z"]);
    }

    #[test]
    fn test_start_job_only_from_ready() {
        let scheduler = JobScheduler::new(SchedulerConfig::default());
        scheduler.enqueue(vec![job("a", &[], 0), job("b", &["a"], 0)], "office");

        assert!(scheduler.start_job("b").is_none());
        let started = scheduler.start_job("a").unwrap();
        assert_eq!(started.status, JobStatus::Processing);
        assert_eq!(started.attempts, 1);
        assert!(started.started_at.is_some());

        // Second start is a no-op.
        assert!(scheduler.start_job("a").is_none());
        assert!(scheduler.start_job("missing").is_none());
    }

    #[test]
    fn test_complete_promotes_only_when_all_deps_done() {
        let scheduler = JobScheduler::new(SchedulerConfig::default());
        scheduler.enqueue(
            vec![job("a", &[], 0), job("b", &[], 0), job("c", &["a", "b"], 0)],
            "office",
        );

        scheduler.complete_job("a", None);
        assert_eq!(scheduler.get_job("c").unwrap().status, JobStatus::Pending);

        scheduler.complete_job("b", Some(42));
        assert_eq!(scheduler.get_job("c").unwrap().status, JobStatus::Ready);
        assert_eq!(scheduler.get_job("b").unwrap().pr_number, Some(42));
    }

    #[test]
    fn test_complete_only_unblocks_one_hop() {
        let scheduler = JobScheduler::new(SchedulerConfig::default());
        scheduler.enqueue(
            vec![job("a", &[], 0), job("b", &["a"], 0), job("c", &["b"], 0)],
            "office",
        );

        scheduler.complete_job("a", None);
        assert_eq!(scheduler.get_job("b").unwrap().status, JobStatus::Ready);
        assert_eq!(scheduler.get_job("c").unwrap().status, JobStatus::Pending);
    }

    #[test]
    fn test_merged_dependency_satisfies() {
        let scheduler = JobScheduler::new(SchedulerConfig::default());
        scheduler.enqueue(
            vec![job("a", &[], 0), job("b", &[], 0), job("c", &["a", "b"], 0)],
            "office",
        );
        scheduler.complete_job("a", None);
        assert!(scheduler.mark_merged("a").is_some());

        scheduler.complete_job("b", None);
        assert_eq!(scheduler.get_job("c").unwrap().status, JobStatus::Ready);
    }

    #[test]
    fn test_fail_job_does_not_cascade() {
        // Known gap: dependents of a failed job stay pending until someone
        // intervenes.
        let scheduler = JobScheduler::new(SchedulerConfig::default());
        scheduler.enqueue(vec![job("a", &[], 0), job("b", &["a"], 0)], "office");

        let failed = scheduler.fail_job("a", Some("boom")).unwrap();
        assert_eq!(failed.status, JobStatus::Failed);
        assert_eq!(failed.error.as_deref(), Some("boom"));
        assert!(failed.completed_at.is_some());
        assert_eq!(scheduler.get_job("b").unwrap().status, JobStatus::Pending);
    }

    #[test]
    fn test_unknown_ids_return_none() {
        let scheduler = JobScheduler::new(SchedulerConfig::default());
        assert!(scheduler.complete_job("nope", None).is_none());
        assert!(scheduler.fail_job("nope", None).is_none());
        assert!(scheduler.mark_merged("nope").is_none());
        assert!(scheduler.retry_job("nope").is_none());
        assert!(scheduler.cancel_job("nope").is_none());
        assert!(scheduler.get_job("nope").is_none());
    }

    #[test]
    fn test_mark_merged_requires_done() {
        let scheduler = JobScheduler::new(SchedulerConfig::default());
        scheduler.enqueue(vec![job("a", &[], 0)], "office");

        assert!(scheduler.mark_merged("a").is_none());
        assert_eq!(scheduler.get_job("a").unwrap().status, JobStatus::Ready);

        scheduler.complete_job("a", None);
        assert_eq!(scheduler.mark_merged("a").unwrap().status, JobStatus::Merged);
    }

    #[test]
    fn test_retry_job_returns_failed_to_ready() {
        let scheduler = JobScheduler::new(SchedulerConfig::default());
        scheduler.enqueue(vec![job("a", &[], 0)], "office");
        scheduler.start_job("a");
        scheduler.fail_job("a", Some("flaky"));

        let retried = scheduler.retry_job("a").unwrap();
        assert_eq!(retried.status, JobStatus::Ready);
        assert!(retried.completed_at.is_none());
        assert_eq!(retried.error.as_deref(), Some("flaky"));

        // Only failed jobs can be retried.
        assert!(scheduler.retry_job("a").is_none());
        assert_eq!(scheduler.start_job("a").unwrap().attempts, 2);
    }

    #[test]
    fn test_cancel_all_jobs() {
        let scheduler = JobScheduler::new(SchedulerConfig::default());
        scheduler.enqueue(
            vec![job("a", &[], 0), job("b", &["a"], 0), job("c", &[], 0)],
            "office",
        );
        scheduler.enqueue(vec![job("other", &[], 0)], "elsewhere");
        scheduler.complete_job("c", None);

        assert_eq!(scheduler.cancel_all_jobs("office"), 2);
        let a = scheduler.get_job("a").unwrap();
        assert_eq!(a.status, JobStatus::Failed);
        assert_eq!(a.error.as_deref(), Some("cancelled"));
        assert_eq!(scheduler.get_job("c").unwrap().status, JobStatus::Done);
        assert_eq!(scheduler.get_job("other").unwrap().status, JobStatus::Ready);
    }

    #[test]
    fn test_stats_completion_rate() {
        let scheduler = JobScheduler::new(SchedulerConfig::default());
        assert_eq!(scheduler.get_stats("office").completion_rate, 0.0);

        scheduler.enqueue(
            vec![
                job("a", &[], 0),
                job("b", &[], 0),
                job("c", &[], 0),
                DecomposedJob::new("d", "qa").with_role("QA"),
            ],
            "office",
        );
        scheduler.complete_job("a", None);
        scheduler.complete_job("b", None);
        scheduler.mark_merged("b");
        scheduler.start_job("d");

        let stats = scheduler.get_stats("office");
        assert_eq!(stats.total, 4);
        assert_eq!(stats.done, 1);
        assert_eq!(stats.merged, 1);
        assert_eq!(stats.ready, 1);
        assert_eq!(stats.processing, 1);
        assert_eq!(stats.completion_rate, 50.0);
        assert_eq!(stats.by_role.get("QA"), Some(&1));
        assert_eq!(stats.active_executions, 1);
        assert_eq!(scheduler.role_concurrency("QA"), 1);
    }

    #[test]
    fn test_reenqueue_keeps_position() {
        let scheduler = JobScheduler::new(SchedulerConfig::default());
        scheduler.enqueue(vec![job("a", &[], 1), job("b", &[], 1)], "office");
        scheduler.enqueue(vec![job("a", &[], 1)], "office");

        assert_eq!(ids(&scheduler.get_ready_jobs()), vec!["a", "b"]);
        assert_eq!(scheduler.get_jobs("office").len(), 2);
    }

    #[test]
    fn test_events_emitted() {
        let scheduler = JobScheduler::new(SchedulerConfig::default());
        let mut rx = scheduler.subscribe();
        scheduler.enqueue(vec![job("a", &[], 0), job("b", &["a"], 0)], "office");
        scheduler.start_job("a");
        scheduler.complete_job("a", None);

        assert!(matches!(rx.try_recv().unwrap(), SchedulerEvent::Enqueued { .. }));
        assert_eq!(
            rx.try_recv().unwrap(),
            SchedulerEvent::Started { job_id: "a".into() }
        );
        assert_eq!(
            rx.try_recv().unwrap(),
            SchedulerEvent::Completed {
                job_id: "a".into(),
                pr_number: None,
                newly_ready: vec!["b".into()],
            }
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_poll_loop_respects_role_limits() {
        let config = SchedulerConfig::default()
            .with_max_parallel_jobs(3)
            .with_polling_interval(Duration::from_millis(100))
            .with_role_limit("QA", 1);
        let scheduler = JobScheduler::new(config);
        scheduler.enqueue(
            vec![
                DecomposedJob::new("q1", "qa").with_role("QA"),
                DecomposedJob::new("q2", "qa").with_role("QA"),
                DecomposedJob::new("f1", "fe").with_role("FE"),
            ],
            "office",
        );

        scheduler.start(|_job| async { std::future::pending::<anyhow::Result<()>>().await });
        tokio::time::sleep(Duration::from_millis(10)).await;

        assert_eq!(scheduler.get_job("q1").unwrap().status, JobStatus::Processing);
        assert_eq!(scheduler.get_job("q2").unwrap().status, JobStatus::Ready);
        assert_eq!(scheduler.get_job("f1").unwrap().status, JobStatus::Processing);

        scheduler.complete_job("q1", None);
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(scheduler.get_job("q2").unwrap().status, JobStatus::Processing);
        scheduler.stop();
    }

    #[tokio::test(start_paused = true)]
    async fn test_handler_error_fails_job() {
        let config = SchedulerConfig::default().with_polling_interval(Duration::from_millis(50));
        let scheduler = JobScheduler::new(config);
        scheduler.enqueue(vec![job("bad", &[], 0), job("worse", &[], 0)], "office");

        scheduler.start(|job: Job| async move {
            anyhow::ensure!(job.id != "bad", "executor exploded");
            if job.id == "worse" {
                panic!("handler panic");
            }
            Ok::<(), anyhow::Error>(())
        });
        tokio::time::sleep(Duration::from_millis(10)).await;

        let bad = scheduler.get_job("bad").unwrap();
        assert_eq!(bad.status, JobStatus::Failed);
        assert_eq!(bad.error.as_deref(), Some("executor exploded"));

        let worse = scheduler.get_job("worse").unwrap();
        assert_eq!(worse.status, JobStatus::Failed);
        assert_eq!(worse.error.as_deref(), Some("Job handler panicked"));

        // The loop survives handler failures.
        assert!(scheduler.is_running());
        scheduler.stop();
        assert!(!scheduler.is_running());
    }

    #[tokio::test(start_paused = true)]
    async fn test_start_twice_is_noop_and_shutdown_clears() {
        let scheduler = JobScheduler::new(SchedulerConfig::default());
        let mut rx = scheduler.subscribe();
        scheduler.start(|_job| async { Ok::<(), anyhow::Error>(()) });
        scheduler.start(|_job| async { Ok::<(), anyhow::Error>(()) });

        scheduler.enqueue(vec![job("a", &[], 0)], "office");
        scheduler.shutdown();

        assert!(scheduler.get_jobs("office").is_empty());
        let events: Vec<_> = std::iter::from_fn(|| rx.try_recv().ok()).collect();
        assert_eq!(
            events.iter().filter(|e| **e == SchedulerEvent::LoopStarted).count(),
            1
        );
        assert_eq!(events.last(), Some(&SchedulerEvent::LoopStopped));
    }
}

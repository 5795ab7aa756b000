// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Wires the scheduler, retry manager, timeout manager and session pool
//! around a [`JobExecutor`].
//!
//! ```text
//! poll tick ──► acquire session ──► start timeout ──► execute
//!                    │                                   │
//!                    ▼                                   ▼
//!               failure path ◄── error / timeout ── success path
//!                    │                                   │
//!     fail_job + record_failure                 complete_job + release
//!                    │
//!            schedule_retry ──► retry_job
//! ```

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use serde::Serialize;
use tokio::task::{AbortHandle, JoinHandle};
use tracing::{debug, info, warn, Instrument};

use super::executor::{JobExecutor, JobOutcome};
use crate::config::OrchestratorConfig;
use crate::error::{ConfigError, ExecutionError};
use crate::scheduler::{
    JobScheduler, RetryManager, RetryStats, RetryStatus, SchedulerStats, TimeoutEvent,
    TimeoutManager, TimeoutStats,
};
use crate::session::{PoolStats, Session, SessionPool};
#[cfg(feature = "telemetry")]
use crate::telemetry::GLOBAL_METRICS;
use crate::telemetry::{JobSpan, JobSpanOutcome};
use crate::types::{DecomposedJob, Job, JobStatus};

/// Where session worktrees are rooted unless told otherwise.
pub const DEFAULT_WORKTREE_ROOT: &str = ".semo-office/worktrees";

/// Combined view of every component.
#[derive(Debug, Clone, Serialize)]
pub struct OrchestratorStats {
    pub scheduler: SchedulerStats,
    pub retry: RetryStats,
    pub timeout: TimeoutStats,
    pub pool: PoolStats,
}

struct Inner {
    config: OrchestratorConfig,
    scheduler: JobScheduler,
    retry: RetryManager,
    timeouts: TimeoutManager,
    pool: Mutex<SessionPool>,
    executor: Arc<dyn JobExecutor>,
    worktree_root: PathBuf,
    /// Jobs between dispatch and the end of their failure/success path.
    /// The handle is set while the executor runs.
    active: Mutex<HashMap<String, Option<AbortHandle>>>,
    listener: Mutex<Option<JoinHandle<()>>>,
}

impl Inner {
    fn pool(&self) -> MutexGuard<'_, SessionPool> {
        self.pool.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn active(&self) -> MutexGuard<'_, HashMap<String, Option<AbortHandle>>> {
        self.active.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Run the executor on its own task so a timeout can abort it.
    async fn execute(&self, job: &Job, session: &Session) -> Result<JobOutcome, ExecutionError> {
        let executor = Arc::clone(&self.executor);
        let (task_job, task_session) = (job.clone(), session.clone());
        let task = tokio::spawn(async move { executor.execute(&task_job, &task_session).await });
        self.active().insert(job.id.clone(), Some(task.abort_handle()));

        match task.await {
            Ok(result) => result,
            Err(err) if err.is_cancelled() => {
                if self.timeouts.is_timed_out(&job.id) {
                    let budget = self.timeouts.config().timeout_for(job.role.as_deref());
                    Err(ExecutionError::Timeout(budget.as_millis() as u64))
                } else {
                    Err(ExecutionError::Cancelled)
                }
            }
            Err(_) => Err(ExecutionError::failed("Executor panicked")),
        }
    }

    /// Fail the job and arm a retry when the policy allows one.
    fn handle_failure(&self, job: &Job, error: &str) {
        let Some(failed) = self.scheduler.fail_job(&job.id, Some(error)) else {
            return;
        };

        let decision = self
            .retry
            .record_failure(&failed, error, failed.role.as_deref());
        if !decision.should_retry {
            warn!(job_id = %job.id, reason = %decision.reason, "Job will not be retried");
            return;
        }

        let delay = decision.delay.unwrap_or(self.retry.config().base_delay);
        #[cfg(feature = "telemetry")]
        GLOBAL_METRICS.record_retry_scheduled(failed.role_or_default());
        let scheduler = self.scheduler.clone();
        let id = job.id.clone();
        self.retry.schedule_retry(&job.id, delay, move || {
            scheduler.retry_job(&id);
        });
    }

    /// False once the job was cancelled or otherwise settled from outside.
    fn still_processing(&self, job_id: &str) -> bool {
        self.scheduler
            .get_job(job_id)
            .is_some_and(|job| job.status == JobStatus::Processing)
    }

    fn is_settled(&self, owner_id: &str) -> bool {
        let active = self.active();
        self.scheduler.get_jobs(owner_id).iter().all(|job| {
            let busy = matches!(job.status, JobStatus::Ready | JobStatus::Processing)
                || active.contains_key(&job.id)
                || self
                    .retry
                    .get_retry_state(&job.id)
                    .is_some_and(|s| s.status == RetryStatus::Scheduled);
            !busy
        })
    }
}

/// Session acquisition, execution, timeouts and retries for scheduled jobs.
///
/// Cloning is cheap and clones share state.
#[derive(Clone)]
pub struct Orchestrator {
    inner: Arc<Inner>,
}

impl Orchestrator {
    /// Build every component from `config`. Fails if the config is invalid.
    pub fn new(
        config: OrchestratorConfig,
        executor: Arc<dyn JobExecutor>,
    ) -> Result<Self, ConfigError> {
        Self::with_worktree_root(config, executor, DEFAULT_WORKTREE_ROOT)
    }

    /// Like [`new`](Self::new), binding sessions under `worktree_root/<job id>`.
    pub fn with_worktree_root(
        config: OrchestratorConfig,
        executor: Arc<dyn JobExecutor>,
        worktree_root: impl Into<PathBuf>,
    ) -> Result<Self, ConfigError> {
        config.validate()?;

        let retry = RetryManager::new(config.retry.clone())?;
        let mut pool = SessionPool::new(config.pool.clone());
        pool.initialize();

        Ok(Self {
            inner: Arc::new(Inner {
                scheduler: JobScheduler::new(config.scheduler.clone()),
                retry,
                timeouts: TimeoutManager::new(config.timeout.clone()),
                pool: Mutex::new(pool),
                executor,
                worktree_root: worktree_root.into(),
                active: Mutex::new(HashMap::new()),
                listener: Mutex::new(None),
                config,
            }),
        })
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.inner.config
    }

    pub fn scheduler(&self) -> &JobScheduler {
        &self.inner.scheduler
    }

    pub fn retry_manager(&self) -> &RetryManager {
        &self.inner.retry
    }

    pub fn timeout_manager(&self) -> &TimeoutManager {
        &self.inner.timeouts
    }

    /// Add a decomposed plan to the queue.
    pub fn enqueue(&self, jobs: Vec<DecomposedJob>, owner_id: &str) -> Vec<Job> {
        self.inner.scheduler.enqueue(jobs, owner_id)
    }

    /// Start the poll loop and the timeout listener. Requires a tokio runtime.
    pub fn start(&self) {
        if self.inner.scheduler.is_running() {
            return;
        }

        let mut timeouts = self.inner.timeouts.subscribe();
        let weak = Arc::downgrade(&self.inner);
        let listener = tokio::spawn(async move {
            while let Some(event) = timeouts.recv().await {
                let TimeoutEvent::Timeout { job_id, duration_ms } = event else {
                    continue;
                };
                let Some(inner) = weak.upgrade() else {
                    break;
                };
                let active = inner.active();
                if let Some(Some(handle)) = active.get(&job_id) {
                    warn!(%job_id, duration_ms, "Aborting timed-out execution");
                    handle.abort();
                }
            }
        });
        let previous = self
            .inner
            .listener
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .replace(listener);
        if let Some(previous) = previous {
            previous.abort();
        }

        let weak: Weak<Inner> = Arc::downgrade(&self.inner);
        self.inner.scheduler.start(move |job| {
            let inner = weak.upgrade();
            async move {
                if let Some(inner) = inner {
                    run_job(inner, job).await;
                }
                Ok(())
            }
        });
        info!("Orchestrator started");
    }

    /// Cancel one job, aborting its execution if it is running.
    pub fn cancel_job(&self, job_id: &str) -> Option<Job> {
        self.inner.retry.cancel(job_id);
        if let Some(Some(handle)) = self.inner.active().get(job_id) {
            handle.abort();
        }
        self.inner.scheduler.cancel_job(job_id)
    }

    pub fn pool_stats(&self) -> PoolStats {
        self.inner.pool().get_stats()
    }

    pub fn stats(&self, owner_id: &str) -> OrchestratorStats {
        OrchestratorStats {
            scheduler: self.inner.scheduler.get_stats(owner_id),
            retry: self.inner.retry.get_stats(),
            timeout: self.inner.timeouts.get_stats(),
            pool: self.pool_stats(),
        }
    }

    /// Resolve once no job of `owner_id` is ready, processing or waiting for
    /// a retry. Jobs stranded behind a failed dependency do not hold this up.
    pub async fn wait_until_settled(&self, owner_id: &str) {
        let interval = self.inner.config.scheduler.polling_interval;
        while !self.inner.is_settled(owner_id) {
            tokio::time::sleep(interval).await;
        }
        debug!(owner_id, "Jobs settled");
    }

    /// Stop the loop, abort in-flight executions and release everything.
    pub fn shutdown(&self) {
        let inner = &self.inner;
        inner.scheduler.stop();
        if let Some(listener) = inner
            .listener
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            listener.abort();
        }
        for handle in inner.active().drain().filter_map(|(_, handle)| handle) {
            handle.abort();
        }
        inner.retry.shutdown();
        inner.timeouts.shutdown();
        inner.pool().shutdown();
        inner.scheduler.shutdown();
        info!("Orchestrator shut down");
    }
}

impl std::fmt::Debug for Orchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Orchestrator")
            .field("scheduler", &self.inner.scheduler)
            .field("worktree_root", &self.inner.worktree_root)
            .finish()
    }
}

/// Handler for one dispatched job. Failures are routed here, never back to
/// the scheduler's catch-all.
async fn run_job(inner: Arc<Inner>, job: Job) {
    inner.active().insert(job.id.clone(), None);
    let span = JobSpan::start(&job);

    let role = job.role_or_default().to_string();
    let acquired = inner.pool().acquire(&role, inner.worktree_root.join(&job.id));
    let session = match acquired {
        Ok(session) => session,
        Err(err) => {
            if inner.still_processing(&job.id) {
                inner.handle_failure(&job, &ExecutionError::from(err).to_string());
            }
            inner.active().remove(&job.id);
            span.finish(JobSpanOutcome::Failed);
            return;
        }
    };

    inner.timeouts.start(&job, job.role.as_deref());
    let result = inner
        .execute(&job, &session)
        .instrument(span.span().clone())
        .await;
    inner.timeouts.clear(&job.id);

    match result {
        // Cancelled from outside; the scheduler already has the final word.
        _ if !inner.still_processing(&job.id) => {
            debug!(job_id = %job.id, "Job settled during execution, dropping result");
            inner.pool().release(&session.id);
            span.finish(JobSpanOutcome::Failed);
        }
        Ok(outcome) => {
            inner.retry.record_success(&job.id);
            inner.pool().release(&session.id);
            inner.scheduler.complete_job(&job.id, outcome.pr_number);
            span.finish(JobSpanOutcome::Completed);
        }
        Err(ExecutionError::Cancelled) => {
            inner.pool().release(&session.id);
            span.finish(JobSpanOutcome::Failed);
        }
        Err(err) => {
            inner.pool().release_failed(&session.id);
            let outcome = if matches!(err, ExecutionError::Timeout(_)) {
                JobSpanOutcome::TimedOut
            } else {
                JobSpanOutcome::Failed
            };
            inner.handle_failure(&job, &err.to_string());
            span.finish(outcome);
        }
    }
    inner.active().remove(&job.id);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::orchestrate::MockJobExecutor;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    fn fast_config() -> OrchestratorConfig {
        let mut config = OrchestratorConfig::default();
        config.scheduler.polling_interval = Duration::from_millis(10);
        config.retry.base_delay = Duration::from_millis(100);
        config.retry.jitter_factor = 0.0;
        config
    }

    fn orchestrator(config: OrchestratorConfig, executor: MockJobExecutor) -> Orchestrator {
        Orchestrator::new(config, Arc::new(executor)).unwrap()
    }

    #[tokio::test(start_paused = true)]
    async fn test_runs_plan_to_completion() {
        let mut executor = MockJobExecutor::new();
        executor
            .expect_execute()
            .times(2)
            .returning(|_, _| Ok(JobOutcome::with_pr(7)));

        let orch = orchestrator(fast_config(), executor);
        orch.enqueue(
            vec![
                DecomposedJob::new("a", "first"),
                DecomposedJob::new("b", "second").with_depends_on(["a"]),
            ],
            "office",
        );
        orch.start();
        orch.wait_until_settled("office").await;

        for id in ["a", "b"] {
            let job = orch.scheduler().get_job(id).unwrap();
            assert_eq!(job.status, JobStatus::Done);
            assert_eq!(job.pr_number, Some(7));
        }
        assert_eq!(orch.pool_stats().leased, 0);
        orch.shutdown();
    }

    #[tokio::test(start_paused = true)]
    async fn test_session_is_bound_to_job_worktree() {
        let mut executor = MockJobExecutor::new();
        executor.expect_execute().times(1).returning(|job, session| {
            assert_eq!(session.agent_role.as_deref(), Some("BE"));
            let path = session.worktree_path.clone().unwrap_or_default();
            assert!(path.ends_with(&job.id));
            Ok(JobOutcome::default())
        });

        let orch = Orchestrator::with_worktree_root(fast_config(), Arc::new(executor), "/tmp/wt")
            .unwrap();
        orch.enqueue(vec![DecomposedJob::new("api", "x").with_role("BE")], "office");
        orch.start();
        orch.wait_until_settled("office").await;

        assert_eq!(orch.scheduler().get_job("api").unwrap().status, JobStatus::Done);
    }

    #[tokio::test(start_paused = true)]
    async fn test_non_retryable_failure_is_not_retried() {
        let mut executor = MockJobExecutor::new();
        executor
            .expect_execute()
            .times(1)
            .returning(|_, _| Err(ExecutionError::failed("permission denied: cannot write file")));

        let orch = orchestrator(fast_config(), executor);
        orch.enqueue(vec![DecomposedJob::new("a", "x")], "office");
        orch.start();
        orch.wait_until_settled("office").await;

        let job = orch.scheduler().get_job("a").unwrap();
        assert_eq!(job.status, JobStatus::Failed);
        assert_eq!(
            orch.retry_manager().get_retry_state("a").unwrap().status,
            RetryStatus::Exhausted
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_transient_failure_is_retried() {
        let calls = Arc::new(AtomicUsize::new(0));
        let seen = Arc::clone(&calls);
        let mut executor = MockJobExecutor::new();
        executor.expect_execute().returning(move |_, _| {
            if seen.fetch_add(1, Ordering::SeqCst) == 0 {
                Err(ExecutionError::failed("connection reset"))
            } else {
                Ok(JobOutcome::with_pr(3))
            }
        });

        let orch = orchestrator(fast_config(), executor);
        orch.enqueue(vec![DecomposedJob::new("a", "x")], "office");
        orch.start();
        orch.wait_until_settled("office").await;

        let job = orch.scheduler().get_job("a").unwrap();
        assert_eq!(job.status, JobStatus::Done);
        assert_eq!(job.attempts, 2);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        // Success forgets the retry entry
        assert!(orch.retry_manager().get_retry_state("a").is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_ceiling_leaves_job_failed() {
        let mut executor = MockJobExecutor::new();
        executor
            .expect_execute()
            .times(3)
            .returning(|_, _| Err(ExecutionError::failed("flaky network")));

        let orch = orchestrator(fast_config(), executor);
        orch.enqueue(vec![DecomposedJob::new("a", "x")], "office");
        orch.start();
        orch.wait_until_settled("office").await;

        let job = orch.scheduler().get_job("a").unwrap();
        assert_eq!(job.status, JobStatus::Failed);
        assert_eq!(job.error.as_deref(), Some("flaky network"));
        let state = orch.retry_manager().get_retry_state("a").unwrap();
        assert_eq!(state.attempts, 3);
        assert_eq!(state.status, RetryStatus::Exhausted);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_dependency_strands_dependents() {
        let mut executor = MockJobExecutor::new();
        executor
            .expect_execute()
            .times(1)
            .returning(|_, _| Err(ExecutionError::failed("syntax error in main.rs")));

        let orch = orchestrator(fast_config(), executor);
        orch.enqueue(
            vec![
                DecomposedJob::new("a", "x"),
                DecomposedJob::new("b", "y").with_depends_on(["a"]),
            ],
            "office",
        );
        orch.start();
        orch.wait_until_settled("office").await;

        assert_eq!(orch.scheduler().get_job("b").unwrap().status, JobStatus::Pending);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stats_aggregate_components() {
        let mut executor = MockJobExecutor::new();
        executor
            .expect_execute()
            .returning(|_, _| Ok(JobOutcome::default()));

        let orch = orchestrator(fast_config(), executor);
        orch.enqueue(vec![DecomposedJob::new("a", "x")], "office");
        orch.start();
        orch.wait_until_settled("office").await;

        let stats = orch.stats("office");
        assert_eq!(stats.scheduler.done, 1);
        assert_eq!(stats.retry, RetryStats::default());
        assert_eq!(stats.timeout, TimeoutStats::default());
        assert_eq!(stats.pool.max_capacity, 14);
    }

    #[test]
    fn test_invalid_config_is_rejected() {
        let mut config = OrchestratorConfig::default();
        config.scheduler.max_parallel_jobs = 0;
        let result = Orchestrator::new(config, Arc::new(MockJobExecutor::new()));
        assert!(result.is_err());
    }
}

// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Retry policy with exponential backoff and jitter.
//!
//! The [`RetryManager`] keeps one [`RetryEntry`] per failing job. Each call
//! to [`RetryManager::record_failure`] bumps the attempt count and returns a
//! [`RetryDecision`]. Checks run in a fixed order:
//!
//! 1. Non-retryable error patterns (permission, auth, not-found, syntax and
//!    type errors by default) exhaust the entry immediately, even on the
//!    first attempt.
//! 2. The retry ceiling (role override, else the global limit) exhausts the
//!    entry once `attempts >= ceiling`.
//! 3. Otherwise the backoff delay is computed and the entry is `scheduled`.
//!
//! The delay for attempt `n` is `min(base * multiplier^(n-1), max)`, jittered
//! by `±jitter_factor` and floored at `base`.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

use chrono::{DateTime, Utc};
use rand::Rng;
use regex::{Regex, RegexBuilder};
use serde::Serialize;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::error::ConfigError;
use crate::events::EventBus;
use crate::timer::TimerHandle;
use crate::types::{roles, Job};

/// Error patterns that are never worth retrying.
pub const DEFAULT_NON_RETRYABLE_PATTERNS: &[&str] = &[
    "permission denied",
    "authentication failed",
    "invalid credentials",
    "not found",
    "syntax error",
    "type error",
];

// ============================================================================
// Configuration
// ============================================================================

/// Retry configuration.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RetryConfig {
    /// Global retry ceiling.
    pub max_retries: u32,
    /// Delay before the first retry, and the floor for every retry.
    pub base_delay: Duration,
    /// Cap applied before jitter.
    pub max_delay: Duration,
    pub backoff_multiplier: f64,
    /// Fraction of the delay used as the jitter range (0-1).
    pub jitter_factor: f64,
    /// Per-role retry ceilings.
    pub role_retry_limits: HashMap<String, u32>,
    /// Case-insensitive regular expressions for permanent errors.
    pub non_retryable_patterns: Vec<String>,
}

impl Default for RetryConfig {
    fn default() -> Self {
        let role_retry_limits = [
            (roles::PO, 2),
            (roles::ARCHITECT, 2),
            (roles::FE, 3),
            (roles::BE, 3),
            // flaky test suites
            (roles::QA, 4),
            (roles::DEVOPS, 2),
        ]
        .into_iter()
        .map(|(role, limit)| (role.to_string(), limit))
        .collect();

        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(5_000),
            max_delay: Duration::from_millis(60_000),
            backoff_multiplier: 2.0,
            jitter_factor: 0.2,
            role_retry_limits,
            non_retryable_patterns: DEFAULT_NON_RETRYABLE_PATTERNS
                .iter()
                .map(|p| p.to_string())
                .collect(),
        }
    }
}

impl RetryConfig {
    /// Retry ceiling for a role.
    pub fn max_retries_for(&self, role: Option<&str>) -> u32 {
        role.and_then(|r| self.role_retry_limits.get(r).copied())
            .unwrap_or(self.max_retries)
    }

    /// Backoff delay for an attempt before jitter: `min(base * m^(n-1), max)`.
    pub fn backoff_delay(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(i32::MAX as u32) as i32;
        let base_ms = self.base_delay.as_millis() as f64;
        let max_ms = self.max_delay.as_millis() as f64;
        let delay = (base_ms * self.backoff_multiplier.powi(exponent)).min(max_ms);
        Duration::from_millis(delay.max(0.0) as u64)
    }

    /// Final retry delay given a jitter sample in `[-1, 1]`.
    ///
    /// The result is rounded to the millisecond and never below `base_delay`.
    pub fn jittered_delay(&self, attempt: u32, jitter_sample: f64) -> Duration {
        let delay = self.backoff_delay(attempt).as_millis() as f64;
        let jitter = delay * self.jitter_factor * jitter_sample.clamp(-1.0, 1.0);
        let jittered = (delay + jitter).round().max(0.0) as u64;
        Duration::from_millis(jittered.max(self.base_delay.as_millis() as u64))
    }

    fn compile_patterns(&self) -> Result<Vec<Regex>, ConfigError> {
        self.non_retryable_patterns
            .iter()
            .map(|pattern| {
                RegexBuilder::new(pattern)
                    .case_insensitive(true)
                    .build()
                    .map_err(|e| ConfigError::InvalidPattern {
                        pattern: pattern.clone(),
                        message: e.to_string(),
                    })
            })
            .collect()
    }
}

// ============================================================================
// Entries, Decisions and Events
// ============================================================================

/// Lifecycle of a retry entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RetryStatus {
    /// Failure recorded, or a scheduled retry has fired.
    Pending,
    /// Waiting for the backoff delay.
    Scheduled,
    /// No more retries. Never reverts.
    Exhausted,
}

/// Outcome of [`RetryManager::record_failure`].
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RetryDecision {
    pub should_retry: bool,
    /// Backoff before the next attempt, set when `should_retry` is true.
    #[serde(skip_serializing_if = "Option::is_none", with = "opt_duration_ms")]
    pub delay: Option<Duration>,
    pub reason: String,
}

/// Read-only copy of a retry entry.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RetrySnapshot {
    pub job_id: String,
    pub attempts: u32,
    pub last_error: Option<String>,
    pub next_retry_at: Option<DateTime<Utc>>,
    pub status: RetryStatus,
    /// Whether a retry timer is currently armed.
    pub timer_armed: bool,
}

/// Aggregate retry counters.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RetryStats {
    pub pending: usize,
    pub scheduled: usize,
    pub exhausted: usize,
    pub total_attempts: u64,
}

/// Notifications emitted by the retry manager.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum RetryEvent {
    Scheduled {
        job_id: String,
        attempt: u32,
        delay_ms: u64,
        next_retry_at: DateTime<Utc>,
    },
    Retrying {
        job_id: String,
        attempt: u32,
    },
    Exhausted {
        job_id: String,
        reason: String,
        attempts: u32,
        error: String,
    },
    Cancelled {
        job_id: String,
    },
    Succeeded {
        job_id: String,
    },
}

/// Per-job retry bookkeeping.
#[derive(Debug)]
struct RetryEntry {
    job_id: String,
    attempts: u32,
    last_error: Option<String>,
    next_retry_at: Option<DateTime<Utc>>,
    status: RetryStatus,
    timer: Option<TimerHandle>,
    /// Tag of the armed timer; a firing timer with a stale tag does nothing.
    generation: u64,
}

impl RetryEntry {
    fn new(job_id: &str) -> Self {
        Self {
            job_id: job_id.to_string(),
            attempts: 0,
            last_error: None,
            next_retry_at: None,
            status: RetryStatus::Pending,
            timer: None,
            generation: 0,
        }
    }

    fn snapshot(&self) -> RetrySnapshot {
        RetrySnapshot {
            job_id: self.job_id.clone(),
            attempts: self.attempts,
            last_error: self.last_error.clone(),
            next_retry_at: self.next_retry_at,
            status: self.status,
            timer_armed: self.timer.as_ref().is_some_and(|t| !t.is_finished()),
        }
    }
}

// ============================================================================
// Retry Manager
// ============================================================================

struct Shared {
    config: RetryConfig,
    patterns: Vec<Regex>,
    entries: Mutex<HashMap<String, RetryEntry>>,
    events: EventBus<RetryEvent>,
}

impl Shared {
    fn entries(&self) -> MutexGuard<'_, HashMap<String, RetryEntry>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Decides retry eligibility and arms backoff timers.
///
/// Cloning is cheap and clones share state.
#[derive(Clone)]
pub struct RetryManager {
    shared: Arc<Shared>,
}

impl RetryManager {
    /// Create a retry manager, compiling the non-retryable patterns.
    pub fn new(config: RetryConfig) -> Result<Self, ConfigError> {
        let patterns = config.compile_patterns()?;
        Ok(Self {
            shared: Arc::new(Shared {
                config,
                patterns,
                entries: Mutex::new(HashMap::new()),
                events: EventBus::new(),
            }),
        })
    }

    /// Active configuration.
    pub fn config(&self) -> &RetryConfig {
        &self.shared.config
    }

    /// Register an observer for retry events.
    pub fn subscribe(&self) -> mpsc::UnboundedReceiver<RetryEvent> {
        self.shared.events.subscribe()
    }

    /// Check whether an error matches a non-retryable pattern.
    pub fn is_non_retryable(&self, error: &str) -> bool {
        self.shared.patterns.iter().any(|p| p.is_match(error))
    }

    /// Record a failure and decide whether to retry.
    pub fn record_failure(&self, job: &Job, error: &str, role: Option<&str>) -> RetryDecision {
        self.record_failure_with_jitter(job, error, role, rand::thread_rng().gen_range(-1.0..=1.0))
    }

    /// [`record_failure`](Self::record_failure) with an explicit jitter sample in `[-1, 1]`.
    pub fn record_failure_with_jitter(
        &self,
        job: &Job,
        error: &str,
        role: Option<&str>,
        jitter_sample: f64,
    ) -> RetryDecision {
        let config = &self.shared.config;
        let non_retryable = self.is_non_retryable(error);

        let mut entries = self.shared.entries();
        let entry = entries
            .entry(job.id.clone())
            .or_insert_with(|| RetryEntry::new(&job.id));

        entry.attempts += 1;
        entry.last_error = Some(error.to_string());

        if non_retryable {
            // An entry that is already exhausted stays exhausted, silently.
            if entry.status != RetryStatus::Exhausted {
                entry.status = RetryStatus::Exhausted;
                entry.timer = None;
                warn!(job_id = %job.id, error, "Non-retryable error, giving up");
                self.shared.events.emit(RetryEvent::Exhausted {
                    job_id: job.id.clone(),
                    reason: "Non-retryable error".to_string(),
                    attempts: entry.attempts,
                    error: error.to_string(),
                });
            }
            return RetryDecision {
                should_retry: false,
                delay: None,
                reason: format!("Non-retryable error: {error}"),
            };
        }

        if entry.status == RetryStatus::Exhausted {
            return RetryDecision {
                should_retry: false,
                delay: None,
                reason: format!("Retries already exhausted after {} attempts", entry.attempts - 1),
            };
        }

        let max_retries = config.max_retries_for(role);
        if entry.attempts >= max_retries {
            entry.status = RetryStatus::Exhausted;
            entry.timer = None;
            warn!(job_id = %job.id, attempts = entry.attempts, max_retries, "Retries exhausted");
            self.shared.events.emit(RetryEvent::Exhausted {
                job_id: job.id.clone(),
                reason: "Max retries exceeded".to_string(),
                attempts: entry.attempts,
                error: error.to_string(),
            });
            return RetryDecision {
                should_retry: false,
                delay: None,
                reason: format!("Max retries ({max_retries}) exceeded"),
            };
        }

        let delay = config.jittered_delay(entry.attempts, jitter_sample);
        let next_retry_at = Utc::now()
            + chrono::Duration::from_std(delay).unwrap_or_else(|_| chrono::Duration::zero());
        entry.next_retry_at = Some(next_retry_at);
        entry.status = RetryStatus::Scheduled;

        let delay_ms = delay.as_millis() as u64;
        info!(job_id = %job.id, attempt = entry.attempts, delay_ms, "Retry scheduled");
        self.shared.events.emit(RetryEvent::Scheduled {
            job_id: job.id.clone(),
            attempt: entry.attempts,
            delay_ms,
            next_retry_at,
        });

        RetryDecision {
            should_retry: true,
            delay: Some(delay),
            reason: format!(
                "Retry {}/{} scheduled in {}ms",
                entry.attempts, max_retries, delay_ms
            ),
        }
    }

    /// Arm the retry timer for a job, replacing any timer already armed.
    ///
    /// When the timer fires the entry returns to `pending` and `callback`
    /// runs. Does nothing for a job without a retry entry. Must be called
    /// from within a tokio runtime.
    pub fn schedule_retry<F>(&self, job_id: &str, delay: Duration, callback: F)
    where
        F: FnOnce() + Send + 'static,
    {
        let mut entries = self.shared.entries();
        let Some(entry) = entries.get_mut(job_id) else {
            debug!(job_id, "No retry entry, ignoring schedule request");
            return;
        };

        entry.generation += 1;
        let generation = entry.generation;
        let shared: Weak<Shared> = Arc::downgrade(&self.shared);
        let id = job_id.to_string();

        // Replacing the handle drops (and aborts) the previous timer.
        entry.timer = Some(TimerHandle::after(delay, move || {
            let Some(shared) = shared.upgrade() else {
                return;
            };
            let attempt = {
                let mut entries = shared.entries();
                match entries.get_mut(&id) {
                    Some(entry) if entry.generation == generation => {
                        entry.status = RetryStatus::Pending;
                        entry.attempts + 1
                    }
                    _ => return,
                }
            };
            debug!(job_id = %id, attempt, "Retry timer fired");
            shared.events.emit(RetryEvent::Retrying {
                job_id: id.clone(),
                attempt,
            });
            callback();
        }));
    }

    /// Cancel any pending retry and forget the job.
    pub fn cancel(&self, job_id: &str) {
        let removed = self.shared.entries().remove(job_id);
        if removed.is_some() {
            debug!(job_id, "Retry state cancelled");
            self.shared.events.emit(RetryEvent::Cancelled {
                job_id: job_id.to_string(),
            });
        }
    }

    /// Clear retry state after the job succeeded.
    pub fn record_success(&self, job_id: &str) {
        self.cancel(job_id);
        self.shared.events.emit(RetryEvent::Succeeded {
            job_id: job_id.to_string(),
        });
    }

    /// Current retry state for a job.
    pub fn get_retry_state(&self, job_id: &str) -> Option<RetrySnapshot> {
        self.shared.entries().get(job_id).map(RetryEntry::snapshot)
    }

    /// All entries waiting on a backoff timer, soonest first.
    pub fn get_pending_retries(&self) -> Vec<RetrySnapshot> {
        let mut pending: Vec<_> = self
            .shared
            .entries()
            .values()
            .filter(|e| e.status == RetryStatus::Scheduled)
            .map(RetryEntry::snapshot)
            .collect();
        pending.sort_by(|a, b| {
            a.next_retry_at
                .cmp(&b.next_retry_at)
                .then_with(|| a.job_id.cmp(&b.job_id))
        });
        pending
    }

    /// Aggregate counters.
    pub fn get_stats(&self) -> RetryStats {
        let entries = self.shared.entries();
        let mut stats = RetryStats::default();
        for entry in entries.values() {
            match entry.status {
                RetryStatus::Pending => stats.pending += 1,
                RetryStatus::Scheduled => stats.scheduled += 1,
                RetryStatus::Exhausted => stats.exhausted += 1,
            }
            stats.total_attempts += u64::from(entry.attempts);
        }
        stats
    }

    /// Cancel every pending retry.
    pub fn shutdown(&self) {
        let ids: Vec<String> = self.shared.entries().keys().cloned().collect();
        for id in ids {
            self.cancel(&id);
        }
    }
}

impl std::fmt::Debug for RetryManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RetryManager")
            .field("config", &self.shared.config)
            .field("stats", &self.get_stats())
            .finish()
    }
}

mod opt_duration_ms {
    use serde::Serializer;
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Option<Duration>, s: S) -> Result<S::Ok, S::Error> {
        match value {
            Some(d) => s.serialize_some(&(d.as_millis() as u64)),
            None => s.serialize_none(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::DecomposedJob;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn job(id: &str) -> Job {
        Job::from_decomposed(DecomposedJob::new(id, "work"), "office")
    }

    fn manager() -> RetryManager {
        RetryManager::new(RetryConfig::default()).unwrap()
    }

    #[test]
    fn test_backoff_delay_before_jitter() {
        let config = RetryConfig::default();
        assert_eq!(config.backoff_delay(1), Duration::from_millis(5_000));
        assert_eq!(config.backoff_delay(2), Duration::from_millis(10_000));
        assert_eq!(config.backoff_delay(3), Duration::from_millis(20_000));
        assert_eq!(config.backoff_delay(4), Duration::from_millis(40_000));
        assert_eq!(config.backoff_delay(5), Duration::from_millis(60_000));
        assert_eq!(config.backoff_delay(40), Duration::from_millis(60_000));
    }

    #[test]
    fn test_jittered_delay_bounds() {
        let config = RetryConfig::default();
        // attempt 2: 10s ± 2s
        assert_eq!(config.jittered_delay(2, 1.0), Duration::from_millis(12_000));
        assert_eq!(config.jittered_delay(2, -1.0), Duration::from_millis(8_000));
        assert_eq!(config.jittered_delay(2, 0.0), Duration::from_millis(10_000));
        // attempt 1 jittered downwards is floored at base
        assert_eq!(config.jittered_delay(1, -1.0), Duration::from_millis(5_000));
    }

    #[test]
    fn test_jittered_delay_never_below_base() {
        let config = RetryConfig::default();
        for attempt in 1..10 {
            for step in 0..=20 {
                let sample = -1.0 + step as f64 * 0.1;
                assert!(config.jittered_delay(attempt, sample) >= config.base_delay);
            }
        }
    }

    #[test]
    fn test_first_retry_uses_base_delay() {
        let manager = manager();
        let decision = manager.record_failure_with_jitter(&job("a"), "flaky network", None, 0.0);
        assert!(decision.should_retry);
        assert_eq!(decision.delay, Some(Duration::from_millis(5_000)));
        assert!(decision.reason.contains("Retry 1/3"));
    }

    #[test]
    fn test_retry_ceiling_global() {
        let manager = manager();
        let job = job("a");

        let first = manager.record_failure(&job, "connection reset", None);
        let second = manager.record_failure(&job, "connection reset", None);
        let third = manager.record_failure(&job, "connection reset", None);

        assert!(first.should_retry);
        assert!(second.should_retry);
        assert!(!third.should_retry);
        assert_eq!(third.reason, "Max retries (3) exceeded");
        assert_eq!(
            manager.get_retry_state("a").unwrap().status,
            RetryStatus::Exhausted
        );
    }

    #[test]
    fn test_role_override_ceiling() {
        let manager = manager();
        let job = job("qa-1");

        for _ in 0..3 {
            assert!(manager.record_failure(&job, "tests flaked", Some("QA")).should_retry);
        }
        let fourth = manager.record_failure(&job, "tests flaked", Some("QA"));
        assert!(!fourth.should_retry);
        assert_eq!(fourth.reason, "Max retries (4) exceeded");
    }

    #[test]
    fn test_non_retryable_beats_ceiling_on_first_attempt() {
        let manager = manager();
        let decision =
            manager.record_failure(&job("a"), "permission denied: cannot write file", None);
        assert!(!decision.should_retry);
        assert!(decision.reason.contains("Non-retryable error"));
        assert!(decision.delay.is_none());
    }

    #[test]
    fn test_non_retryable_patterns_case_insensitive() {
        let manager = manager();
        assert!(manager.is_non_retryable("Authentication Failed for user"));
        assert!(manager.is_non_retryable("module NOT FOUND"));
        assert!(manager.is_non_retryable("TypeScript: Type Error in foo.ts"));
        assert!(!manager.is_non_retryable("rate limited"));
    }

    #[test]
    fn test_custom_pattern_and_invalid_pattern() {
        let mut config = RetryConfig::default();
        config.non_retryable_patterns.push(r"quota\s+exceeded".to_string());
        let manager = RetryManager::new(config).unwrap();
        assert!(manager.is_non_retryable("Monthly QUOTA   exceeded"));

        let mut config = RetryConfig::default();
        config.non_retryable_patterns.push("(unclosed".to_string());
        assert!(matches!(
            RetryManager::new(config),
            Err(ConfigError::InvalidPattern { .. })
        ));
    }

    #[test]
    fn test_exhausted_never_reverts() {
        let manager = manager();
        let job = job("a");
        manager.record_failure(&job, "not found", None);

        // A role with a higher ceiling must not revive the entry.
        let decision = manager.record_failure(&job, "transient", Some("QA"));
        assert!(!decision.should_retry);
        let state = manager.get_retry_state("a").unwrap();
        assert_eq!(state.status, RetryStatus::Exhausted);
        assert_eq!(state.attempts, 2);
    }

    #[test]
    fn test_non_retryable_reported_after_ceiling() {
        let manager = manager();
        let job = job("a");
        for _ in 0..3 {
            manager.record_failure(&job, "connection reset", None);
        }
        assert_eq!(
            manager.get_retry_state("a").unwrap().status,
            RetryStatus::Exhausted
        );

        let mut rx = manager.subscribe();
        let decision = manager.record_failure(&job, "permission denied: cannot write file", None);
        assert!(!decision.should_retry);
        assert!(decision.reason.contains("Non-retryable error"));
        // Already exhausted: no second exhausted event.
        assert!(rx.try_recv().is_err());
        assert_eq!(
            manager.get_retry_state("a").unwrap().status,
            RetryStatus::Exhausted
        );
    }

    #[test]
    fn test_events_emitted() {
        let manager = manager();
        let mut rx = manager.subscribe();
        let job = job("a");

        manager.record_failure_with_jitter(&job, "oops", None, 0.0);
        match rx.try_recv().unwrap() {
            RetryEvent::Scheduled { job_id, attempt, delay_ms, .. } => {
                assert_eq!(job_id, "a");
                assert_eq!(attempt, 1);
                assert_eq!(delay_ms, 5_000);
            }
            other => panic!("unexpected event {other:?}"),
        }

        manager.record_success("a");
        assert_eq!(rx.try_recv().unwrap(), RetryEvent::Cancelled { job_id: "a".into() });
        assert_eq!(rx.try_recv().unwrap(), RetryEvent::Succeeded { job_id: "a".into() });
        assert!(manager.get_retry_state("a").is_none());
    }

    #[test]
    fn test_event_serialization_names() {
        let json = serde_json::to_value(RetryEvent::Cancelled { job_id: "x".into() }).unwrap();
        assert_eq!(json["event"], "cancelled");
        assert_eq!(json["job_id"], "x");
    }

    #[tokio::test(start_paused = true)]
    async fn test_schedule_retry_fires_callback() {
        let manager = manager();
        let mut rx = manager.subscribe();
        let job = job("a");
        let decision = manager.record_failure_with_jitter(&job, "flaky", None, 0.0);
        let _ = rx.try_recv();

        let fired = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&fired);
        manager.schedule_retry("a", decision.delay.unwrap(), move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        assert!(manager.get_retry_state("a").unwrap().timer_armed);
        assert_eq!(manager.get_pending_retries().len(), 1);

        tokio::time::sleep(Duration::from_millis(5_001)).await;

        assert_eq!(fired.load(Ordering::SeqCst), 1);
        assert_eq!(manager.get_retry_state("a").unwrap().status, RetryStatus::Pending);
        assert_eq!(
            rx.try_recv().unwrap(),
            RetryEvent::Retrying { job_id: "a".into(), attempt: 2 }
        );
        assert!(manager.get_pending_retries().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_reschedule_replaces_timer() {
        let manager = manager();
        let job = job("a");
        manager.record_failure(&job, "flaky", None);

        let fired = Arc::new(AtomicU32::new(0));
        let first = Arc::clone(&fired);
        let second = Arc::clone(&fired);
        manager.schedule_retry("a", Duration::from_secs(5), move || {
            first.fetch_add(1, Ordering::SeqCst);
        });
        manager.schedule_retry("a", Duration::from_secs(10), move || {
            second.fetch_add(10, Ordering::SeqCst);
        });

        tokio::time::sleep(Duration::from_secs(6)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 0);

        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 10);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_prevents_callback() {
        let manager = manager();
        manager.record_failure(&job("a"), "flaky", None);

        let fired = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&fired);
        manager.schedule_retry("a", Duration::from_secs(5), move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        manager.cancel("a");

        tokio::time::sleep(Duration::from_secs(30)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 0);
        assert!(manager.get_retry_state("a").is_none());
    }

    #[test]
    fn test_schedule_retry_unknown_job_is_noop() {
        let manager = manager();
        // No runtime needed: nothing gets armed.
        manager.schedule_retry("ghost", Duration::from_secs(1), || {});
        assert!(manager.get_retry_state("ghost").is_none());
    }

    #[test]
    fn test_stats() {
        let manager = manager();
        manager.record_failure(&job("a"), "flaky", None);
        manager.record_failure(&job("b"), "permission denied", None);
        manager.record_failure(&job("b"), "permission denied", None);

        let stats = manager.get_stats();
        assert_eq!(stats.scheduled, 1);
        assert_eq!(stats.exhausted, 1);
        assert_eq!(stats.total_attempts, 3);

        manager.shutdown();
        assert_eq!(manager.get_stats(), RetryStats::default());
    }
}

// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Per-job execution budgets with a grace period.
//!
//! ```text
//! start ──▶ active ──(timeout)──▶ grace ──(grace period)──▶ expired
//!             │                     │                          │
//!             └────────── clear() removes the entry ───────────┘
//! ```
//!
//! Expiry only emits a [`TimeoutEvent::Timeout`]. Failing the job is up to
//! whoever listens.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

use serde::Serialize;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::events::EventBus;
use crate::timer::TimerHandle;
use crate::types::{roles, Job};

/// Timeout configuration.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TimeoutConfig {
    /// Budget for roles without an override.
    pub default_timeout: Duration,
    /// Per-role budgets.
    pub role_timeouts: HashMap<String, Duration>,
    /// Extra time between the soft timeout and hard expiry.
    pub grace_period: Duration,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        const MINUTE: u64 = 60;
        let role_timeouts = [
            (roles::PO, 10 * MINUTE),
            (roles::ARCHITECT, 10 * MINUTE),
            (roles::FE, 15 * MINUTE),
            (roles::BE, 15 * MINUTE),
            (roles::QA, 20 * MINUTE),
            (roles::DEVOPS, 10 * MINUTE),
        ]
        .into_iter()
        .map(|(role, secs)| (role.to_string(), Duration::from_secs(secs)))
        .collect();

        Self {
            default_timeout: Duration::from_secs(5 * MINUTE),
            role_timeouts,
            grace_period: Duration::from_secs(30),
        }
    }
}

impl TimeoutConfig {
    /// Budget for a role.
    pub fn timeout_for(&self, role: Option<&str>) -> Duration {
        role.and_then(|r| self.role_timeouts.get(r).copied())
            .unwrap_or(self.default_timeout)
    }
}

/// Lifecycle of a timeout entry. Only ever moves forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TimeoutStatus {
    Active,
    Grace,
    Expired,
}

/// Notifications emitted by the timeout manager.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum TimeoutEvent {
    Started { job_id: String, timeout_ms: u64 },
    Cleared { job_id: String },
    Extended { job_id: String, new_timeout_ms: u64 },
    Warning { job_id: String, message: String },
    /// Hard expiry; `duration_ms` is the total time since `start`.
    Timeout { job_id: String, duration_ms: u64 },
}

/// Read-only copy of a timeout entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TimeoutSnapshot {
    pub job_id: String,
    pub timeout_ms: u64,
    pub elapsed_ms: u64,
    pub remaining_ms: u64,
    pub status: TimeoutStatus,
}

/// Aggregate timeout counters.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct TimeoutStats {
    pub active: usize,
    pub grace: usize,
    pub expired: usize,
}

#[derive(Debug)]
struct TimeoutEntry {
    job_id: String,
    started: Instant,
    timeout: Duration,
    status: TimeoutStatus,
    timer: Option<TimerHandle>,
    grace_timer: Option<TimerHandle>,
    generation: u64,
}

impl TimeoutEntry {
    fn remaining(&self) -> Duration {
        self.timeout.saturating_sub(self.started.elapsed())
    }

    fn snapshot(&self) -> TimeoutSnapshot {
        TimeoutSnapshot {
            job_id: self.job_id.clone(),
            timeout_ms: self.timeout.as_millis() as u64,
            elapsed_ms: self.started.elapsed().as_millis() as u64,
            remaining_ms: self.remaining().as_millis() as u64,
            status: self.status,
        }
    }
}

struct Shared {
    config: TimeoutConfig,
    entries: Mutex<HashMap<String, TimeoutEntry>>,
    events: EventBus<TimeoutEvent>,
}

impl Shared {
    fn entries(&self) -> MutexGuard<'_, HashMap<String, TimeoutEntry>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Tracks wall-clock budgets for running jobs.
///
/// Cloning is cheap and clones share state. Methods that arm timers
/// (`start`, `extend`) must run inside a tokio runtime.
#[derive(Clone)]
pub struct TimeoutManager {
    shared: Arc<Shared>,
}

impl TimeoutManager {
    /// Create a timeout manager.
    pub fn new(config: TimeoutConfig) -> Self {
        Self {
            shared: Arc::new(Shared {
                config,
                entries: Mutex::new(HashMap::new()),
                events: EventBus::new(),
            }),
        }
    }

    /// Active configuration.
    pub fn config(&self) -> &TimeoutConfig {
        &self.shared.config
    }

    /// Register an observer for timeout events.
    pub fn subscribe(&self) -> mpsc::UnboundedReceiver<TimeoutEvent> {
        self.shared.events.subscribe()
    }

    /// Start (or restart) the budget for a job.
    pub fn start(&self, job: &Job, role: Option<&str>) {
        self.clear(&job.id);

        let timeout = self.shared.config.timeout_for(role);
        {
            // The entry must exist before the timer can fire.
            let mut entries = self.shared.entries();
            let entry = entries.entry(job.id.clone()).or_insert(TimeoutEntry {
                job_id: job.id.clone(),
                started: Instant::now(),
                timeout,
                status: TimeoutStatus::Active,
                timer: None,
                grace_timer: None,
                generation: 1,
            });
            entry.timer = Some(arm_primary(&self.shared, &job.id, timeout, entry.generation));
        }

        let timeout_ms = timeout.as_millis() as u64;
        debug!(job_id = %job.id, timeout_ms, "Timeout started");
        self.shared.events.emit(TimeoutEvent::Started {
            job_id: job.id.clone(),
            timeout_ms,
        });
    }

    /// Cancel both timers and forget the job.
    pub fn clear(&self, job_id: &str) {
        let removed = self.shared.entries().remove(job_id);
        if removed.is_some() {
            debug!(job_id, "Timeout cleared");
            self.shared.events.emit(TimeoutEvent::Cleared {
                job_id: job_id.to_string(),
            });
        }
    }

    /// Grant more time to an active job.
    ///
    /// Defaults to half the current budget. Ignored once the job has entered
    /// its grace period.
    pub fn extend(&self, job_id: &str, additional: Option<Duration>) {
        let new_timeout = {
            let mut entries = self.shared.entries();
            let Some(entry) = entries.get_mut(job_id) else {
                return;
            };
            if entry.status != TimeoutStatus::Active {
                return;
            }

            let extension = additional.unwrap_or(entry.timeout / 2);
            let new_timeout = entry.timeout + extension;
            let remaining = new_timeout.saturating_sub(entry.started.elapsed());

            entry.generation += 1;
            entry.timer = Some(arm_primary(
                &self.shared,
                job_id,
                remaining,
                entry.generation,
            ));
            entry.timeout = new_timeout;
            new_timeout
        };

        let new_timeout_ms = new_timeout.as_millis() as u64;
        info!(job_id, new_timeout_ms, "Timeout extended");
        self.shared.events.emit(TimeoutEvent::Extended {
            job_id: job_id.to_string(),
            new_timeout_ms,
        });
    }

    /// Time left before the soft timeout, or `None` for an unknown job.
    pub fn get_remaining(&self, job_id: &str) -> Option<Duration> {
        self.shared.entries().get(job_id).map(TimeoutEntry::remaining)
    }

    /// Whether the job has passed its grace period.
    pub fn is_timed_out(&self, job_id: &str) -> bool {
        self.shared
            .entries()
            .get(job_id)
            .is_some_and(|e| e.status == TimeoutStatus::Expired)
    }

    /// Current state of a job's budget.
    pub fn get_timeout(&self, job_id: &str) -> Option<TimeoutSnapshot> {
        self.shared.entries().get(job_id).map(TimeoutEntry::snapshot)
    }

    /// Entries still inside their primary budget.
    pub fn get_active_timeouts(&self) -> Vec<TimeoutSnapshot> {
        let mut active: Vec<_> = self
            .shared
            .entries()
            .values()
            .filter(|e| e.status == TimeoutStatus::Active)
            .map(TimeoutEntry::snapshot)
            .collect();
        active.sort_by(|a, b| a.job_id.cmp(&b.job_id));
        active
    }

    /// Aggregate counters.
    pub fn get_stats(&self) -> TimeoutStats {
        let entries = self.shared.entries();
        let mut stats = TimeoutStats::default();
        for entry in entries.values() {
            match entry.status {
                TimeoutStatus::Active => stats.active += 1,
                TimeoutStatus::Grace => stats.grace += 1,
                TimeoutStatus::Expired => stats.expired += 1,
            }
        }
        stats
    }

    /// Clear every tracked job.
    pub fn shutdown(&self) {
        let ids: Vec<String> = self.shared.entries().keys().cloned().collect();
        for id in ids {
            self.clear(&id);
        }
    }
}

impl std::fmt::Debug for TimeoutManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TimeoutManager")
            .field("config", &self.shared.config)
            .field("stats", &self.get_stats())
            .finish()
    }
}

fn arm_primary(shared: &Arc<Shared>, job_id: &str, delay: Duration, generation: u64) -> TimerHandle {
    let weak = Arc::downgrade(shared);
    let id = job_id.to_string();
    TimerHandle::after(delay, move || handle_timeout(&weak, &id, generation))
}

fn handle_timeout(weak: &Weak<Shared>, job_id: &str, generation: u64) {
    let Some(shared) = weak.upgrade() else {
        return;
    };

    {
        let mut entries = shared.entries();
        let Some(entry) = entries.get_mut(job_id) else {
            return;
        };
        if entry.generation != generation || entry.status != TimeoutStatus::Active {
            return;
        }

        entry.status = TimeoutStatus::Grace;
        let grace_weak = Arc::downgrade(&shared);
        let id = job_id.to_string();
        entry.grace_timer = Some(TimerHandle::after(shared.config.grace_period, move || {
            handle_grace_expired(&grace_weak, &id, generation)
        }));
    }

    warn!(job_id, "Job entering grace period");
    shared.events.emit(TimeoutEvent::Warning {
        job_id: job_id.to_string(),
        message: "Job entering grace period".to_string(),
    });
}

fn handle_grace_expired(weak: &Weak<Shared>, job_id: &str, generation: u64) {
    let Some(shared) = weak.upgrade() else {
        return;
    };

    let duration = {
        let mut entries = shared.entries();
        let Some(entry) = entries.get_mut(job_id) else {
            return;
        };
        if entry.generation != generation || entry.status != TimeoutStatus::Grace {
            return;
        }
        entry.status = TimeoutStatus::Expired;
        entry.started.elapsed()
    };

    let duration_ms = duration.as_millis() as u64;
    warn!(job_id, duration_ms, "Job timed out");
    shared.events.emit(TimeoutEvent::Timeout {
        job_id: job_id.to_string(),
        duration_ms,
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::DecomposedJob;

    fn job(id: &str) -> Job {
        Job::from_decomposed(DecomposedJob::new(id, "work"), "office")
    }

    fn manager() -> TimeoutManager {
        TimeoutManager::new(TimeoutConfig::default())
    }

    fn drain(rx: &mut mpsc::UnboundedReceiver<TimeoutEvent>) -> Vec<TimeoutEvent> {
        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            events.push(event);
        }
        events
    }

    #[test]
    fn test_role_timeouts() {
        let config = TimeoutConfig::default();
        assert_eq!(config.timeout_for(None), Duration::from_secs(300));
        assert_eq!(config.timeout_for(Some("QA")), Duration::from_secs(1200));
        assert_eq!(config.timeout_for(Some("Designer")), Duration::from_secs(300));
    }

    #[tokio::test(start_paused = true)]
    async fn test_active_grace_expired_sequence() {
        let manager = manager();
        let mut rx = manager.subscribe();
        manager.start(&job("a"), None);

        tokio::time::sleep(Duration::from_secs(299)).await;
        assert_eq!(manager.get_timeout("a").unwrap().status, TimeoutStatus::Active);

        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(manager.get_timeout("a").unwrap().status, TimeoutStatus::Grace);
        assert!(!manager.is_timed_out("a"));
        assert_eq!(manager.get_remaining("a"), Some(Duration::ZERO));

        tokio::time::sleep(Duration::from_secs(30)).await;
        assert!(manager.is_timed_out("a"));

        let events = drain(&mut rx);
        let timeouts: Vec<_> = events
            .iter()
            .filter(|e| matches!(e, TimeoutEvent::Timeout { .. }))
            .collect();
        assert_eq!(timeouts.len(), 1);
        assert_eq!(
            events[0],
            TimeoutEvent::Started { job_id: "a".into(), timeout_ms: 300_000 }
        );
        assert!(matches!(events[1], TimeoutEvent::Warning { .. }));
        assert_eq!(
            events[2],
            TimeoutEvent::Timeout { job_id: "a".into(), duration_ms: 330_000 }
        );

        // Nothing more fires later.
        tokio::time::sleep(Duration::from_secs(600)).await;
        assert!(drain(&mut rx).is_empty());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_zero_budget_still_expires_on_worker_threads() {
        let mut config = TimeoutConfig::default();
        config.role_timeouts.insert("QA".to_string(), Duration::ZERO);
        config.grace_period = Duration::ZERO;
        let manager = TimeoutManager::new(config);
        let mut rx = manager.subscribe();

        for i in 0..20 {
            let id = format!("qa-{i}");
            manager.start(&job(&id), Some("QA"));
        }
        tokio::time::sleep(Duration::from_millis(200)).await;

        for i in 0..20 {
            assert!(manager.is_timed_out(&format!("qa-{i}")));
        }
        let fired = drain(&mut rx)
            .into_iter()
            .filter(|e| matches!(e, TimeoutEvent::Timeout { .. }))
            .count();
        assert_eq!(fired, 20);
    }

    #[tokio::test(start_paused = true)]
    async fn test_clear_cancels_timers() {
        let manager = manager();
        let mut rx = manager.subscribe();
        manager.start(&job("a"), None);
        manager.clear("a");

        tokio::time::sleep(Duration::from_secs(1_000)).await;

        let events = drain(&mut rx);
        assert_eq!(events.len(), 2);
        assert_eq!(events[1], TimeoutEvent::Cleared { job_id: "a".into() });
        assert!(manager.get_remaining("a").is_none());
        assert!(!manager.is_timed_out("a"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_clear_during_grace() {
        let manager = manager();
        let mut rx = manager.subscribe();
        manager.start(&job("a"), None);

        tokio::time::sleep(Duration::from_secs(310)).await;
        manager.clear("a");
        tokio::time::sleep(Duration::from_secs(60)).await;

        assert!(!drain(&mut rx)
            .iter()
            .any(|e| matches!(e, TimeoutEvent::Timeout { .. })));
    }

    #[tokio::test(start_paused = true)]
    async fn test_extend_defaults_to_half() {
        let manager = manager();
        manager.start(&job("a"), None);

        tokio::time::sleep(Duration::from_secs(100)).await;
        manager.extend("a", None);

        let snapshot = manager.get_timeout("a").unwrap();
        assert_eq!(snapshot.timeout_ms, 450_000);
        assert_eq!(manager.get_remaining("a"), Some(Duration::from_secs(350)));

        // Old deadline (300s) passes without a state change.
        tokio::time::sleep(Duration::from_secs(250)).await;
        assert_eq!(manager.get_timeout("a").unwrap().status, TimeoutStatus::Active);

        tokio::time::sleep(Duration::from_secs(101)).await;
        assert_eq!(manager.get_timeout("a").unwrap().status, TimeoutStatus::Grace);
    }

    #[tokio::test(start_paused = true)]
    async fn test_extend_ignored_in_grace() {
        let manager = manager();
        let mut rx = manager.subscribe();
        manager.start(&job("a"), None);
        tokio::time::sleep(Duration::from_secs(301)).await;

        manager.extend("a", Some(Duration::from_secs(600)));
        assert_eq!(manager.get_timeout("a").unwrap().timeout_ms, 300_000);
        assert!(!drain(&mut rx)
            .iter()
            .any(|e| matches!(e, TimeoutEvent::Extended { .. })));
    }

    #[tokio::test(start_paused = true)]
    async fn test_restart_replaces_entry() {
        let manager = manager();
        manager.start(&job("a"), None);
        tokio::time::sleep(Duration::from_secs(200)).await;

        manager.start(&job("a"), Some("QA"));
        tokio::time::sleep(Duration::from_secs(200)).await;

        let snapshot = manager.get_timeout("a").unwrap();
        assert_eq!(snapshot.status, TimeoutStatus::Active);
        assert_eq!(snapshot.timeout_ms, 1_200_000);
        assert_eq!(manager.get_active_timeouts().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stats_and_shutdown() {
        let manager = manager();
        manager.start(&job("a"), None);
        manager.start(&job("b"), Some("QA"));
        tokio::time::sleep(Duration::from_secs(301)).await;

        assert_eq!(
            manager.get_stats(),
            TimeoutStats { active: 1, grace: 1, expired: 0 }
        );

        manager.shutdown();
        assert_eq!(manager.get_stats(), TimeoutStats::default());
    }

    #[test]
    fn test_unknown_job_queries() {
        let manager = manager();
        assert!(manager.get_remaining("nope").is_none());
        assert!(!manager.is_timed_out("nope"));
        manager.extend("nope", None);
        manager.clear("nope");
    }
}

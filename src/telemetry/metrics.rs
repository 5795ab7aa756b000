// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Metrics collection for job execution.
//!
//! Provides lightweight in-process counters without external dependencies.
//! Per-role job metrics carry a latency histogram; pool counters are atomics.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{PoisonError, RwLock};
use std::time::{Duration, Instant};

use once_cell::sync::Lazy;
use serde::Serialize;

/// Global metrics instance.
pub static GLOBAL_METRICS: Lazy<Metrics> = Lazy::new(Metrics::new);

/// Central metrics collection.
#[derive(Debug)]
pub struct Metrics {
    /// Job metrics by role.
    roles: RwLock<HashMap<String, RoleMetrics>>,

    /// Session pool counters.
    pool: PoolMetrics,

    /// Start time for calculating uptime.
    start_time: Instant,
}

impl Metrics {
    /// Create a new metrics collector.
    pub fn new() -> Self {
        Self {
            roles: RwLock::new(HashMap::new()),
            pool: PoolMetrics::new(),
            start_time: Instant::now(),
        }
    }

    fn with_role(&self, role: &str, f: impl FnOnce(&mut RoleMetrics)) {
        let mut roles = self.roles.write().unwrap_or_else(PoisonError::into_inner);
        f(roles.entry(role.to_string()).or_default());
    }

    /// Record a job entering `processing`.
    pub fn record_job_started(&self, role: &str) {
        self.with_role(role, |m| m.started += 1);
    }

    /// Record a successful job execution.
    pub fn record_job_completed(&self, role: &str, duration: Duration) {
        self.with_role(role, |m| m.record_finished(duration, true));
    }

    /// Record a failed job execution.
    pub fn record_job_failed(&self, role: &str, duration: Duration) {
        self.with_role(role, |m| m.record_finished(duration, false));
    }

    /// Record a retry being scheduled.
    pub fn record_retry_scheduled(&self, role: &str) {
        self.with_role(role, |m| m.retries_scheduled += 1);
    }

    /// Record a hard timeout.
    pub fn record_timeout(&self, role: &str) {
        self.with_role(role, |m| m.timeouts += 1);
    }

    /// Record a session acquisition.
    pub fn record_pool_acquire(&self, warm: bool) {
        if warm {
            self.pool.warm_acquisitions.fetch_add(1, Ordering::Relaxed);
        } else {
            self.pool.cold_acquisitions.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Record a pool exhaustion.
    pub fn record_pool_exhausted(&self) {
        self.pool.exhaustions.fetch_add(1, Ordering::Relaxed);
    }

    /// Get metrics for a specific role.
    pub fn role_metrics(&self, role: &str) -> Option<RoleMetrics> {
        self.roles
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(role)
            .cloned()
    }

    /// Get pool counters.
    pub fn pool_counts(&self) -> PoolCounts {
        self.pool.counts()
    }

    /// Get uptime since metrics were initialized.
    pub fn uptime(&self) -> Duration {
        self.start_time.elapsed()
    }

    /// Take a snapshot of all metrics.
    pub fn snapshot(&self) -> MetricsSnapshot {
        let roles = self.roles.read().unwrap_or_else(PoisonError::into_inner);

        MetricsSnapshot {
            roles: roles.iter().map(|(k, v)| (k.clone(), v.clone())).collect(),
            pool: self.pool.counts(),
            uptime: self.uptime(),
        }
    }

    /// Reset all metrics.
    pub fn reset(&self) {
        self.roles
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
        self.pool.reset();
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Job metrics for a single role.
#[derive(Debug, Clone, Serialize)]
pub struct RoleMetrics {
    /// Jobs handed to an executor.
    pub started: u64,

    pub completed: u64,

    pub failed: u64,

    pub retries_scheduled: u64,

    pub timeouts: u64,

    /// Total time spent executing.
    pub total_duration: Duration,

    /// Execution latency distribution.
    #[serde(skip)]
    pub histogram: Histogram,
}

impl RoleMetrics {
    /// Create empty role metrics.
    pub fn new() -> Self {
        Self {
            started: 0,
            completed: 0,
            failed: 0,
            retries_scheduled: 0,
            timeouts: 0,
            total_duration: Duration::ZERO,
            histogram: Histogram::default(),
        }
    }

    fn record_finished(&mut self, duration: Duration, success: bool) {
        if success {
            self.completed += 1;
        } else {
            self.failed += 1;
        }
        self.total_duration += duration;
        self.histogram.record(duration);
    }

    /// Number of finished executions.
    pub fn finished(&self) -> u64 {
        self.completed + self.failed
    }

    /// Calculate average execution time.
    pub fn avg_duration(&self) -> Duration {
        match self.finished() {
            0 => Duration::ZERO,
            n => self.total_duration / n as u32,
        }
    }

    /// Calculate success rate (0.0 to 1.0).
    pub fn success_rate(&self) -> f64 {
        match self.finished() {
            0 => 1.0,
            n => self.completed as f64 / n as f64,
        }
    }
}

impl Default for RoleMetrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Simple histogram with fixed buckets for latency tracking.
#[derive(Debug, Clone)]
pub struct Histogram {
    /// Bucket boundaries in milliseconds.
    /// Default: [1s, 10s, 1m, 5m, 15m, 30m, +inf]
    buckets: Vec<u64>,

    /// Count per bucket.
    counts: Vec<u64>,
}

impl Histogram {
    /// Create a histogram with custom bucket boundaries (in milliseconds).
    pub fn with_buckets(buckets: Vec<u64>) -> Self {
        let counts = vec![0; buckets.len() + 1];
        Self { buckets, counts }
    }

    /// Record a duration value.
    pub fn record(&mut self, duration: Duration) {
        let millis = duration.as_millis() as u64;
        let bucket_idx = self
            .buckets
            .iter()
            .position(|&b| millis <= b)
            .unwrap_or(self.buckets.len());
        self.counts[bucket_idx] += 1;
    }

    /// Get counts for each bucket.
    pub fn counts(&self) -> &[u64] {
        &self.counts
    }

    /// Get bucket boundaries.
    pub fn buckets(&self) -> &[u64] {
        &self.buckets
    }

    /// Calculate approximate percentile (p50, p90, p99, etc.).
    pub fn percentile(&self, p: f64) -> Duration {
        let total: u64 = self.counts.iter().sum();
        if total == 0 {
            return Duration::ZERO;
        }

        let target = (total as f64 * p / 100.0).ceil() as u64;
        let mut cumulative = 0u64;

        for (i, &count) in self.counts.iter().enumerate() {
            cumulative += count;
            if cumulative >= target {
                // Overflow bucket reports ten times the last boundary.
                let millis = if i < self.buckets.len() {
                    self.buckets[i]
                } else {
                    self.buckets.last().copied().unwrap_or(0) * 10
                };
                return Duration::from_millis(millis);
            }
        }

        Duration::ZERO
    }

    /// Get p50 (median) latency.
    pub fn p50(&self) -> Duration {
        self.percentile(50.0)
    }

    /// Get p90 latency.
    pub fn p90(&self) -> Duration {
        self.percentile(90.0)
    }

    /// Get p99 latency.
    pub fn p99(&self) -> Duration {
        self.percentile(99.0)
    }
}

impl Default for Histogram {
    fn default() -> Self {
        Self::with_buckets(vec![1_000, 10_000, 60_000, 300_000, 900_000, 1_800_000])
    }
}

/// Thread-safe session pool counters.
#[derive(Debug)]
struct PoolMetrics {
    warm_acquisitions: AtomicU64,
    cold_acquisitions: AtomicU64,
    exhaustions: AtomicU64,
}

impl PoolMetrics {
    fn new() -> Self {
        Self {
            warm_acquisitions: AtomicU64::new(0),
            cold_acquisitions: AtomicU64::new(0),
            exhaustions: AtomicU64::new(0),
        }
    }

    fn counts(&self) -> PoolCounts {
        PoolCounts {
            warm_acquisitions: self.warm_acquisitions.load(Ordering::Relaxed),
            cold_acquisitions: self.cold_acquisitions.load(Ordering::Relaxed),
            exhaustions: self.exhaustions.load(Ordering::Relaxed),
        }
    }

    fn reset(&self) {
        self.warm_acquisitions.store(0, Ordering::Relaxed);
        self.cold_acquisitions.store(0, Ordering::Relaxed);
        self.exhaustions.store(0, Ordering::Relaxed);
    }
}

/// Session pool counter values.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PoolCounts {
    pub warm_acquisitions: u64,
    pub cold_acquisitions: u64,
    pub exhaustions: u64,
}

/// A snapshot of all metrics at a point in time.
#[derive(Debug, Clone)]
pub struct MetricsSnapshot {
    /// Job metrics by role, sorted by role name.
    pub roles: BTreeMap<String, RoleMetrics>,

    pub pool: PoolCounts,

    /// Uptime when snapshot was taken.
    pub uptime: Duration,
}

impl MetricsSnapshot {
    /// Format as a human-readable report.
    pub fn format_report(&self) -> String {
        let mut report = String::new();

        report.push_str("=== Metrics Report ===\n\n");
        report.push_str(&format!("Uptime: {:.2?}\n", self.uptime));
        report.push_str(&format!(
            "Sessions: {} warm, {} cold, {} exhausted\n\n",
            self.pool.warm_acquisitions, self.pool.cold_acquisitions, self.pool.exhaustions
        ));

        if !self.roles.is_empty() {
            report.push_str("Role Metrics:\n");
            for (role, metrics) in &self.roles {
                report.push_str(&format!(
                    "  {}: {} started, {:.1}% success, {} retries, {} timeouts, avg {:.2?}, p90 {:.2?}\n",
                    role,
                    metrics.started,
                    metrics.success_rate() * 100.0,
                    metrics.retries_scheduled,
                    metrics.timeouts,
                    metrics.avg_duration(),
                    metrics.histogram.p90()
                ));
            }
        }

        report
    }
}

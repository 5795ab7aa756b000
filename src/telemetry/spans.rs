// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Span helpers for consistent instrumentation.

use tokio::time::Instant;
use tracing::{info_span, Span};

use crate::types::Job;

/// Extension trait for enhanced span functionality.
pub trait SpanExt {
    /// Record the result of an operation (success/error).
    fn record_result<T, E>(&self, result: &Result<T, E>);
}

impl SpanExt for Span {
    fn record_result<T, E>(&self, result: &Result<T, E>) {
        self.record("success", result.is_ok());
        self.record("error", result.is_err());
    }
}

/// How a job execution ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobSpanOutcome {
    Completed,
    Failed,
    TimedOut,
}

impl JobSpanOutcome {
    fn as_str(self) -> &'static str {
        match self {
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::TimedOut => "timed_out",
        }
    }
}

/// RAII guard for timing one job execution.
///
/// Records job id, role, attempt, duration and outcome, and feeds the
/// role's metrics. Uses the tokio clock so simulated runs report simulated
/// durations.
pub struct JobSpan {
    role: String,
    start: Instant,
    span: Span,
    finished: bool,
}

impl JobSpan {
    /// Start a span for a job that just entered `processing`.
    pub fn start(job: &Job) -> Self {
        let role = job.role_or_default().to_string();
        let span = info_span!(
            "job",
            job_id = %job.id,
            role = %role,
            attempt = job.attempts,
            duration_ms = tracing::field::Empty,
            outcome = tracing::field::Empty,
        );
        super::metrics::GLOBAL_METRICS.record_job_started(&role);

        Self {
            role,
            start: Instant::now(),
            span,
            finished: false,
        }
    }

    /// Get the underlying tracing span.
    pub fn span(&self) -> &Span {
        &self.span
    }

    /// Time since the span started.
    pub fn elapsed(&self) -> std::time::Duration {
        self.start.elapsed()
    }

    /// Finish the span, recording duration and outcome.
    pub fn finish(mut self, outcome: JobSpanOutcome) {
        self.finished = true;
        let duration = self.start.elapsed();

        self.span.record("duration_ms", duration.as_millis() as u64);
        self.span.record("outcome", outcome.as_str());

        let metrics = &super::metrics::GLOBAL_METRICS;
        match outcome {
            JobSpanOutcome::Completed => metrics.record_job_completed(&self.role, duration),
            JobSpanOutcome::Failed => metrics.record_job_failed(&self.role, duration),
            JobSpanOutcome::TimedOut => {
                metrics.record_timeout(&self.role);
                metrics.record_job_failed(&self.role, duration);
            }
        }

        tracing::info!(parent: &self.span, outcome = outcome.as_str(), "Job execution finished");
    }
}

impl Drop for JobSpan {
    fn drop(&mut self) {
        // Aborted executions never reach finish().
        if !self.finished {
            let duration = self.start.elapsed();
            self.span.record("duration_ms", duration.as_millis() as u64);
            self.span.record("outcome", "aborted");
        }
    }
}

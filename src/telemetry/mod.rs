// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Telemetry, tracing, and metrics infrastructure.
//!
//! - **Tracing**: Structured logging, one span per job execution
//! - **Metrics**: Per-role job counters and session pool counters
//!
//! # Usage
//!
//! Initialize telemetry at application startup:
//!
//! ```rust,ignore
//! use semo_office::telemetry::{init_telemetry, TelemetryConfig};
//!
//! let _guard = init_telemetry(&TelemetryConfig::default())?;
//! ```
//!
//! Wrap each execution in a [`JobSpan`]:
//!
//! ```rust,ignore
//! let span = JobSpan::start(&job);
//! let result = executor.execute(&job, &session).await;
//! span.finish(if result.is_ok() { JobSpanOutcome::Completed } else { JobSpanOutcome::Failed });
//! ```

mod init;
pub mod metrics;
mod spans;

pub use init::{init_telemetry, TelemetryConfig, TelemetryGuard};
pub use metrics::{
    Histogram, Metrics, MetricsSnapshot, PoolCounts, RoleMetrics, GLOBAL_METRICS,
};
pub use spans::{JobSpan, JobSpanOutcome, SpanExt};

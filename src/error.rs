// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Error types for the orchestration core.
//!
//! Scheduling, retry and timeout operations never fail: unknown ids are
//! no-ops. The hard failures live here, using `thiserror` for the typed
//! errors and `anyhow` for propagation in the CLI.

use thiserror::Error;

/// Errors raised by the session pool.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PoolError {
    #[error("Session pool exhausted ({capacity} cold sessions in use)")]
    Exhausted { capacity: usize },

    #[error("Circuit breaker open for role: {role}")]
    CircuitOpen { role: String },
}

impl PoolError {
    /// Check if waiting and trying again could succeed.
    pub fn is_retryable(&self) -> bool {
        // Both clear on their own: sessions get released, circuits half-open.
        true
    }
}

/// Errors reported by a job executor.
#[derive(Error, Debug)]
pub enum ExecutionError {
    #[error("{0}")]
    Failed(String),

    #[error("Execution timed out after {}s", .0 / 1000)]
    Timeout(u64),

    #[error("Execution cancelled")]
    Cancelled,

    #[error("Session unavailable: {0}")]
    Session(#[from] PoolError),
}

impl ExecutionError {
    /// Create a generic execution failure.
    pub fn failed(message: impl Into<String>) -> Self {
        Self::Failed(message.into())
    }
}

/// Errors that can occur during configuration loading.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Config file not found: {0}")]
    NotFound(String),

    #[error("Invalid value for {field}: {message}")]
    InvalidValue { field: String, message: String },

    #[error("Invalid non-retryable pattern {pattern:?}: {message}")]
    InvalidPattern { pattern: String, message: String },

    #[error("IO error reading config: {0}")]
    IoError(String),

    #[error("YAML parsing error: {0}")]
    YamlError(String),

    #[error("JSON parsing error: {0}")]
    JsonError(String),
}

impl ConfigError {
    /// Create an invalid value error.
    pub fn invalid(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self::InvalidValue {
            field: field.into(),
            message: message.into(),
        }
    }
}

impl From<std::io::Error> for ConfigError {
    fn from(err: std::io::Error) -> Self {
        match err.kind() {
            std::io::ErrorKind::NotFound => Self::NotFound(err.to_string()),
            _ => Self::IoError(err.to_string()),
        }
    }
}

impl From<serde_json::Error> for ConfigError {
    fn from(err: serde_json::Error) -> Self {
        Self::JsonError(err.to_string())
    }
}

impl From<serde_yaml::Error> for ConfigError {
    fn from(err: serde_yaml::Error) -> Self {
        Self::YamlError(err.to_string())
    }
}

/// Errors that can occur while reading a job plan.
#[derive(Error, Debug)]
pub enum PlanError {
    #[error("IO error reading plan: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON parsing error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("YAML parsing error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("Plan has no jobs")]
    Empty,
}

/// Result type alias using anyhow for flexible error handling.
pub type Result<T> = anyhow::Result<T>;

// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Configuration merging.
//!
//! Handles merging configurations from different sources with proper precedence.

use std::time::Duration;

use super::types::{
    OrchestratorConfig, PoolSection, RetrySection, SchedulerSection, TimeoutSection,
    WorkspaceConfig,
};

/// CLI options that can override configuration.
#[derive(Debug, Clone, Default)]
pub struct CliOptions {
    pub max_parallel: Option<usize>,
    pub poll_interval_ms: Option<u64>,
}

/// Default configuration values.
pub fn default_config() -> OrchestratorConfig {
    OrchestratorConfig::default()
}

/// Merge multiple configurations with precedence.
///
/// Precedence (highest to lowest):
/// 1. CLI options
/// 2. Local config (.semo-office.local.json)
/// 3. Workspace config (.semo-office.json)
/// 4. Global config (~/.semo-office/config.json)
/// 5. Default values
pub fn merge_config(
    global: Option<WorkspaceConfig>,
    workspace: Option<WorkspaceConfig>,
    local: Option<WorkspaceConfig>,
    cli: CliOptions,
) -> OrchestratorConfig {
    let mut result = default_config();

    for config in [global, workspace, local].into_iter().flatten() {
        apply_workspace_config(&mut result, &config);
    }

    apply_cli_options(&mut result, &cli);

    result
}

fn apply_workspace_config(result: &mut OrchestratorConfig, config: &WorkspaceConfig) {
    if let Some(ref section) = config.scheduler {
        apply_scheduler(result, section);
    }
    if let Some(ref section) = config.retry {
        apply_retry(result, section);
    }
    if let Some(ref section) = config.timeout {
        apply_timeout(result, section);
    }
    if let Some(ref section) = config.pool {
        apply_pool(result, section);
    }
}

fn apply_scheduler(result: &mut OrchestratorConfig, section: &SchedulerSection) {
    let scheduler = &mut result.scheduler;
    if let Some(max) = section.max_parallel_jobs {
        scheduler.max_parallel_jobs = max;
    }
    if let Some(interval) = section.polling_interval {
        scheduler.polling_interval = Duration::from_millis(interval);
    }
    if let Some(ref limits) = section.max_concurrent_by_role {
        scheduler.max_concurrent_by_role.extend(limits.clone());
    }
}

fn apply_retry(result: &mut OrchestratorConfig, section: &RetrySection) {
    let retry = &mut result.retry;
    if let Some(max) = section.max_retries {
        retry.max_retries = max;
    }
    if let Some(delay) = section.base_delay {
        retry.base_delay = Duration::from_millis(delay);
    }
    if let Some(delay) = section.max_delay {
        retry.max_delay = Duration::from_millis(delay);
    }
    if let Some(multiplier) = section.backoff_multiplier {
        retry.backoff_multiplier = multiplier;
    }
    if let Some(jitter) = section.jitter_factor {
        retry.jitter_factor = jitter;
    }
    if let Some(ref limits) = section.role_retry_limits {
        retry.role_retry_limits.extend(limits.clone());
    }
    if let Some(ref patterns) = section.non_retryable_patterns {
        // Built-in patterns always apply
        for pattern in patterns {
            if !retry.non_retryable_patterns.contains(pattern) {
                retry.non_retryable_patterns.push(pattern.clone());
            }
        }
    }
}

fn apply_timeout(result: &mut OrchestratorConfig, section: &TimeoutSection) {
    let timeout = &mut result.timeout;
    if let Some(ms) = section.default_timeout {
        timeout.default_timeout = Duration::from_millis(ms);
    }
    if let Some(ref roles) = section.role_timeouts {
        timeout.role_timeouts.extend(
            roles
                .iter()
                .map(|(role, ms)| (role.clone(), Duration::from_millis(*ms))),
        );
    }
    if let Some(ms) = section.grace_period {
        timeout.grace_period = Duration::from_millis(ms);
    }
}

fn apply_pool(result: &mut OrchestratorConfig, section: &PoolSection) {
    let pool = &mut result.pool;
    if let Some(size) = section.warm_pool_size {
        pool.warm_pool_size = size;
    }
    if let Some(max) = section.max_cold_sessions {
        pool.max_cold_sessions = max;
    }
    if let Some(ms) = section.session_timeout {
        pool.session_timeout = Duration::from_millis(ms);
    }
    if let Some(ref breaker) = section.circuit_breaker {
        breaker.apply(&mut pool.circuit_breaker);
    }
}

fn apply_cli_options(result: &mut OrchestratorConfig, cli: &CliOptions) {
    if let Some(max) = cli.max_parallel {
        result.scheduler.max_parallel_jobs = max;
    }
    if let Some(ms) = cli.poll_interval_ms {
        result.scheduler.polling_interval = Duration::from_millis(ms);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CircuitBreakerSection;
    use std::collections::HashMap;

    fn with_scheduler(section: SchedulerSection) -> WorkspaceConfig {
        WorkspaceConfig {
            scheduler: Some(section),
            ..Default::default()
        }
    }

    #[test]
    fn test_default_config() {
        let config = default_config();
        assert_eq!(config.scheduler.max_parallel_jobs, 6);
        assert_eq!(config.retry.max_retries, 3);
        assert_eq!(config.pool.warm_pool_size, 4);
        assert_eq!(config.pool.max_cold_sessions, 10);
    }

    #[test]
    fn test_merge_precedence() {
        let global = with_scheduler(SchedulerSection {
            max_parallel_jobs: Some(2),
            polling_interval: Some(1_000),
            ..Default::default()
        });
        let workspace = with_scheduler(SchedulerSection {
            max_parallel_jobs: Some(3),
            ..Default::default()
        });
        let local = with_scheduler(SchedulerSection {
            max_parallel_jobs: Some(4),
            ..Default::default()
        });

        let config = merge_config(Some(global), Some(workspace), Some(local), CliOptions::default());
        assert_eq!(config.scheduler.max_parallel_jobs, 4);
        // Only global set the interval
        assert_eq!(config.scheduler.polling_interval, Duration::from_secs(1));
    }

    #[test]
    fn test_cli_overrides_files() {
        let workspace = with_scheduler(SchedulerSection {
            max_parallel_jobs: Some(3),
            polling_interval: Some(2_000),
            ..Default::default()
        });
        let cli = CliOptions {
            max_parallel: Some(1),
            poll_interval_ms: Some(10),
        };

        let config = merge_config(None, Some(workspace), None, cli);
        assert_eq!(config.scheduler.max_parallel_jobs, 1);
        assert_eq!(config.scheduler.polling_interval, Duration::from_millis(10));
    }

    #[test]
    fn test_role_maps_merge_keywise() {
        let workspace = WorkspaceConfig {
            retry: Some(RetrySection {
                role_retry_limits: Some(HashMap::from([("QA".to_string(), 6)])),
                ..Default::default()
            }),
            timeout: Some(TimeoutSection {
                role_timeouts: Some(HashMap::from([("Docs".to_string(), 60_000)])),
                ..Default::default()
            }),
            ..Default::default()
        };

        let config = merge_config(None, Some(workspace), None, CliOptions::default());
        assert_eq!(config.retry.role_retry_limits["QA"], 6);
        // Untouched defaults survive
        assert_eq!(config.retry.role_retry_limits["FE"], 3);
        assert_eq!(config.timeout.role_timeouts["Docs"], Duration::from_secs(60));
        assert_eq!(config.timeout.role_timeouts["BE"], Duration::from_secs(900));
    }

    #[test]
    fn test_non_retryable_patterns_append() {
        let defaults = default_config().retry.non_retryable_patterns.len();
        let workspace = WorkspaceConfig {
            retry: Some(RetrySection {
                non_retryable_patterns: Some(vec![
                    "quota exceeded".to_string(),
                    "permission denied".to_string(),
                ]),
                ..Default::default()
            }),
            ..Default::default()
        };

        let config = merge_config(None, Some(workspace), None, CliOptions::default());
        let patterns = &config.retry.non_retryable_patterns;
        assert_eq!(patterns.len(), defaults + 1);
        assert_eq!(patterns.last().map(String::as_str), Some("quota exceeded"));
    }

    #[test]
    fn test_pool_and_breaker_merge() {
        let workspace = WorkspaceConfig {
            pool: Some(PoolSection {
                warm_pool_size: Some(0),
                session_timeout: Some(60_000),
                circuit_breaker: Some(CircuitBreakerSection {
                    recovery_timeout: Some(5_000),
                    ..Default::default()
                }),
                ..Default::default()
            }),
            ..Default::default()
        };

        let config = merge_config(None, Some(workspace), None, CliOptions::default());
        assert_eq!(config.pool.warm_pool_size, 0);
        assert_eq!(config.pool.max_cold_sessions, 10);
        assert_eq!(config.pool.session_timeout, Duration::from_secs(60));
        assert_eq!(config.pool.circuit_breaker.recovery_timeout, Duration::from_secs(5));
        assert_eq!(config.pool.circuit_breaker.failure_threshold, 3);
    }
}

// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Engine configuration.
//!
//! Every component receives its settings from an [`EngineConfig`] passed in at
//! construction time. There is no process-wide configuration state.

use std::str::FromStr;
use std::time::Duration;

/// How the completion monitor learns that calls started and finished.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MonitorStrategy {
    /// Periodically list the job namespace in storage.
    #[default]
    Polling,
    /// Subscribe to the per-job notification topic.
    Push,
}

impl MonitorStrategy {
    /// Strategy name as used in configuration.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Polling => "polling",
            Self::Push => "push",
        }
    }
}

impl FromStr for MonitorStrategy {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "polling" | "poll" | "storage" => Ok(Self::Polling),
            "push" | "pubsub" => Ok(Self::Push),
            _ => Err(ConfigError::Invalid(
                "BURSTMAP_MONITOR_STRATEGY",
                "must be 'polling' or 'push'",
            )),
        }
    }
}

/// Engine configuration.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Completion monitoring strategy (default: polling)
    pub monitor_strategy: MonitorStrategy,
    /// Interval between storage scans of the polling monitor (default: 1s)
    pub monitor_poll_interval: Duration,
    /// Background invoker tasks per job for the deferred lane (default: 2)
    pub invoker_workers: usize,
    /// Concurrent invocations on the direct lane (default: 32)
    pub direct_invoke_parallelism: usize,
    /// Interval between status document lookups in `CallFuture::status` (default: 500ms)
    pub status_poll_interval: Duration,
    /// Status poll intervals a reader waits past the execution timeout and grace (default: 1200)
    pub status_max_attempts: u32,
    /// Interval between output lookups in `CallFuture::result` (default: 500ms)
    pub result_poll_interval: Duration,
    /// Output lookups before `result()` reports the result as unavailable (default: 10)
    pub result_max_attempts: u32,
    /// Lower bound of the randomized backoff after a rejected invocation (default: 100ms)
    pub rejection_backoff_min: Duration,
    /// Upper bound of the randomized backoff after a rejected invocation (default: 1s)
    pub rejection_backoff_max: Duration,
    /// Slack added to the execution timeout before a timeout is synthesized (default: 10s)
    pub timeout_grace: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            monitor_strategy: MonitorStrategy::Polling,
            monitor_poll_interval: Duration::from_secs(1),
            invoker_workers: 2,
            direct_invoke_parallelism: 32,
            status_poll_interval: Duration::from_millis(500),
            status_max_attempts: 1200,
            result_poll_interval: Duration::from_millis(500),
            result_max_attempts: 10,
            rejection_backoff_min: Duration::from_millis(100),
            rejection_backoff_max: Duration::from_secs(1),
            timeout_grace: Duration::from_secs(10),
        }
    }
}

impl EngineConfig {
    /// Load configuration from environment variables.
    ///
    /// Optional (with defaults):
    /// - `BURSTMAP_MONITOR_STRATEGY`: `polling` or `push` (default: polling)
    /// - `BURSTMAP_MONITOR_POLL_INTERVAL_MS` (default: 1000)
    /// - `BURSTMAP_INVOKER_WORKERS` (default: 2)
    /// - `BURSTMAP_DIRECT_INVOKE_PARALLELISM` (default: 32)
    /// - `BURSTMAP_STATUS_POLL_INTERVAL_MS` (default: 500)
    /// - `BURSTMAP_STATUS_MAX_ATTEMPTS` (default: 1200)
    /// - `BURSTMAP_RESULT_POLL_INTERVAL_MS` (default: 500)
    /// - `BURSTMAP_RESULT_MAX_ATTEMPTS` (default: 10)
    /// - `BURSTMAP_REJECTION_BACKOFF_MIN_MS` (default: 100)
    /// - `BURSTMAP_REJECTION_BACKOFF_MAX_MS` (default: 1000)
    /// - `BURSTMAP_TIMEOUT_GRACE_SECS` (default: 10)
    pub fn from_env() -> Result<Self, ConfigError> {
        let defaults = Self::default();

        let monitor_strategy = match std::env::var("BURSTMAP_MONITOR_STRATEGY") {
            Ok(v) => v.parse()?,
            Err(_) => defaults.monitor_strategy,
        };

        let config = Self {
            monitor_strategy,
            monitor_poll_interval: env_millis(
                "BURSTMAP_MONITOR_POLL_INTERVAL_MS",
                defaults.monitor_poll_interval,
            )?,
            invoker_workers: env_parse("BURSTMAP_INVOKER_WORKERS", defaults.invoker_workers)?,
            direct_invoke_parallelism: env_parse(
                "BURSTMAP_DIRECT_INVOKE_PARALLELISM",
                defaults.direct_invoke_parallelism,
            )?,
            status_poll_interval: env_millis(
                "BURSTMAP_STATUS_POLL_INTERVAL_MS",
                defaults.status_poll_interval,
            )?,
            status_max_attempts: env_parse(
                "BURSTMAP_STATUS_MAX_ATTEMPTS",
                defaults.status_max_attempts,
            )?,
            result_poll_interval: env_millis(
                "BURSTMAP_RESULT_POLL_INTERVAL_MS",
                defaults.result_poll_interval,
            )?,
            result_max_attempts: env_parse(
                "BURSTMAP_RESULT_MAX_ATTEMPTS",
                defaults.result_max_attempts,
            )?,
            rejection_backoff_min: env_millis(
                "BURSTMAP_REJECTION_BACKOFF_MIN_MS",
                defaults.rejection_backoff_min,
            )?,
            rejection_backoff_max: env_millis(
                "BURSTMAP_REJECTION_BACKOFF_MAX_MS",
                defaults.rejection_backoff_max,
            )?,
            timeout_grace: match std::env::var("BURSTMAP_TIMEOUT_GRACE_SECS") {
                Ok(v) => Duration::from_secs(v.parse().map_err(|_| {
                    ConfigError::Invalid(
                        "BURSTMAP_TIMEOUT_GRACE_SECS",
                        "must be a non-negative integer",
                    )
                })?),
                Err(_) => defaults.timeout_grace,
            },
        };

        config.validate()?;
        Ok(config)
    }

    /// Check cross-field constraints.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.invoker_workers == 0 {
            return Err(ConfigError::Invalid(
                "BURSTMAP_INVOKER_WORKERS",
                "must be at least 1",
            ));
        }
        if self.direct_invoke_parallelism == 0 {
            return Err(ConfigError::Invalid(
                "BURSTMAP_DIRECT_INVOKE_PARALLELISM",
                "must be at least 1",
            ));
        }
        if self.result_max_attempts == 0 {
            return Err(ConfigError::Invalid(
                "BURSTMAP_RESULT_MAX_ATTEMPTS",
                "must be at least 1",
            ));
        }
        if self.status_max_attempts == 0 {
            return Err(ConfigError::Invalid(
                "BURSTMAP_STATUS_MAX_ATTEMPTS",
                "must be at least 1",
            ));
        }
        if self.rejection_backoff_min > self.rejection_backoff_max {
            return Err(ConfigError::Invalid(
                "BURSTMAP_REJECTION_BACKOFF_MIN_MS",
                "must not exceed BURSTMAP_REJECTION_BACKOFF_MAX_MS",
            ));
        }
        Ok(())
    }

    /// Set the completion monitoring strategy.
    pub fn with_monitor_strategy(mut self, strategy: MonitorStrategy) -> Self {
        self.monitor_strategy = strategy;
        self
    }

    /// Set the polling monitor interval.
    pub fn with_monitor_poll_interval(mut self, interval: Duration) -> Self {
        self.monitor_poll_interval = interval;
        self
    }

    /// Set the number of deferred-lane invoker tasks per job.
    pub fn with_invoker_workers(mut self, workers: usize) -> Self {
        self.invoker_workers = workers;
        self
    }

    /// Set the direct-lane invocation parallelism.
    pub fn with_direct_invoke_parallelism(mut self, parallelism: usize) -> Self {
        self.direct_invoke_parallelism = parallelism;
        self
    }

    /// Set status polling interval and attempt bound.
    pub fn with_status_polling(mut self, interval: Duration, max_attempts: u32) -> Self {
        self.status_poll_interval = interval;
        self.status_max_attempts = max_attempts;
        self
    }

    /// Set output polling interval and attempt bound.
    pub fn with_result_polling(mut self, interval: Duration, max_attempts: u32) -> Self {
        self.result_poll_interval = interval;
        self.result_max_attempts = max_attempts;
        self
    }

    /// Set the randomized backoff window used after rejected invocations.
    pub fn with_rejection_backoff(mut self, min: Duration, max: Duration) -> Self {
        self.rejection_backoff_min = min;
        self.rejection_backoff_max = max;
        self
    }

    /// Set the slack added to the execution timeout before a timeout is synthesized.
    pub fn with_timeout_grace(mut self, grace: Duration) -> Self {
        self.timeout_grace = grace;
        self
    }
}

fn env_parse<T: FromStr>(var: &'static str, default: T) -> Result<T, ConfigError> {
    match std::env::var(var) {
        Ok(v) => v
            .parse()
            .map_err(|_| ConfigError::Invalid(var, "must be a non-negative integer")),
        Err(_) => Ok(default),
    }
}

fn env_millis(var: &'static str, default: Duration) -> Result<Duration, ConfigError> {
    match std::env::var(var) {
        Ok(v) => v
            .parse()
            .map(Duration::from_millis)
            .map_err(|_| ConfigError::Invalid(var, "must be a duration in milliseconds")),
        Err(_) => Ok(default),
    }
}

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// An environment variable has an invalid value.
    #[error("invalid value for {0}: {1}")]
    Invalid(&'static str, &'static str),
}

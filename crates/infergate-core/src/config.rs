// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Configuration for the worker pool and the dispatcher.

use std::str::FromStr;
use std::time::Duration;

/// Configuration errors.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ConfigError {
    /// A variable is present but cannot be parsed.
    #[error("Invalid value for {key}: {value:?}")]
    InvalidValue {
        /// Variable name.
        key: &'static str,
        /// Raw value that failed to parse.
        value: String,
    },
    /// A combination of values is not usable.
    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// Parse variable `key` from `lookup`, falling back to `default` when unset.
pub fn parse_var<T: FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &'static str,
    default: T,
) -> Result<T, ConfigError> {
    match lookup(key) {
        None => Ok(default),
        Some(raw) => raw
            .trim()
            .parse()
            .map_err(|_| ConfigError::InvalidValue { key, value: raw }),
    }
}

/// Parse a boolean variable (`1/true/yes/on`, `0/false/no/off`).
pub fn parse_bool(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &'static str,
    default: bool,
) -> Result<bool, ConfigError> {
    match lookup(key) {
        None => Ok(default),
        Some(raw) => match raw.trim().to_ascii_lowercase().as_str() {
            "1" | "true" | "yes" | "on" => Ok(true),
            "0" | "false" | "no" | "off" => Ok(false),
            _ => Err(ConfigError::InvalidValue { key, value: raw }),
        },
    }
}

/// Worker pool configuration.
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Number of worker processes.
    pub worker_count: usize,
    /// Port of worker 0; worker `i` binds `base_port + i`.
    pub base_port: u16,
    /// Admission cap: concurrent requests per worker.
    pub max_in_flight: usize,
    /// Restart threshold of worker 0.
    pub threshold_base: u64,
    /// Increment of the restart threshold per worker index.
    ///
    /// The ladder keeps workers from recycling at the same moment.
    pub threshold_step: u64,
    /// Warm-up after the initial spawn of all workers.
    pub startup_warmup: Duration,
    /// Warm-up after each restart spawn.
    pub restart_warmup: Duration,
    /// Spawn attempts per restart before a worker is declared dead.
    pub restart_attempts: u32,
    /// Backoff after the first failed attempt; doubles per attempt.
    pub restart_backoff: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            worker_count: 3,
            base_port: 8001,
            max_in_flight: 5,
            threshold_base: 100,
            threshold_step: 100,
            startup_warmup: Duration::from_secs(2),
            restart_warmup: Duration::from_secs(5),
            restart_attempts: 3,
            restart_backoff: Duration::from_secs(1),
        }
    }
}

impl PoolConfig {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load configuration from an arbitrary variable lookup.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let d = Self::default();
        let config = Self {
            worker_count: parse_var(&lookup, "INFERGATE_WORKER_COUNT", d.worker_count)?,
            base_port: parse_var(&lookup, "INFERGATE_BASE_PORT", d.base_port)?,
            max_in_flight: parse_var(&lookup, "INFERGATE_MAX_IN_FLIGHT", d.max_in_flight)?,
            threshold_base: parse_var(
                &lookup,
                "INFERGATE_RESTART_THRESHOLD_BASE",
                d.threshold_base,
            )?,
            threshold_step: parse_var(
                &lookup,
                "INFERGATE_RESTART_THRESHOLD_STEP",
                d.threshold_step,
            )?,
            startup_warmup: Duration::from_secs(parse_var(
                &lookup,
                "INFERGATE_STARTUP_WARMUP_SECS",
                d.startup_warmup.as_secs(),
            )?),
            restart_warmup: Duration::from_secs(parse_var(
                &lookup,
                "INFERGATE_RESTART_WARMUP_SECS",
                d.restart_warmup.as_secs(),
            )?),
            restart_attempts: parse_var(&lookup, "INFERGATE_RESTART_ATTEMPTS", d.restart_attempts)?,
            restart_backoff: Duration::from_millis(parse_var(
                &lookup,
                "INFERGATE_RESTART_BACKOFF_MS",
                d.restart_backoff.as_millis() as u64,
            )?),
        };
        config.validate()?;
        Ok(config)
    }

    /// Check value ranges.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.worker_count == 0 {
            return Err(ConfigError::Invalid("worker_count must be at least 1".into()));
        }
        if self.max_in_flight == 0 {
            return Err(ConfigError::Invalid("max_in_flight must be at least 1".into()));
        }
        if self.threshold_base == 0 {
            return Err(ConfigError::Invalid("threshold_base must be at least 1".into()));
        }
        if self.restart_attempts == 0 {
            return Err(ConfigError::Invalid("restart_attempts must be at least 1".into()));
        }
        if usize::from(self.base_port) + self.worker_count > usize::from(u16::MAX) + 1 {
            return Err(ConfigError::Invalid(format!(
                "{} workers starting at port {} exceed the port range",
                self.worker_count, self.base_port
            )));
        }
        Ok(())
    }

    /// Port of worker `index`.
    pub fn port(&self, index: usize) -> u16 {
        self.base_port + index as u16
    }

    /// Restart threshold of worker `index`.
    pub fn restart_threshold(&self, index: usize) -> u64 {
        self.threshold_base + index as u64 * self.threshold_step
    }

    /// Set the number of workers.
    pub fn with_worker_count(mut self, count: usize) -> Self {
        self.worker_count = count;
        self
    }

    /// Set the port of worker 0.
    pub fn with_base_port(mut self, port: u16) -> Self {
        self.base_port = port;
        self
    }

    /// Set the per-worker admission cap.
    pub fn with_max_in_flight(mut self, cap: usize) -> Self {
        self.max_in_flight = cap;
        self
    }

    /// Set the restart threshold ladder.
    pub fn with_thresholds(mut self, base: u64, step: u64) -> Self {
        self.threshold_base = base;
        self.threshold_step = step;
        self
    }

    /// Set both warm-up delays.
    pub fn with_warmup(mut self, startup: Duration, restart: Duration) -> Self {
        self.startup_warmup = startup;
        self.restart_warmup = restart;
        self
    }

    /// Set the restart retry policy.
    pub fn with_restart_policy(mut self, attempts: u32, backoff: Duration) -> Self {
        self.restart_attempts = attempts;
        self.restart_backoff = backoff;
        self
    }
}

/// Dispatcher and ingest queue configuration.
#[derive(Debug, Clone)]
pub struct DispatchConfig {
    /// Maximum number of queued requests before new ones are rejected.
    pub max_queue_depth: usize,
    /// Number of coordinating dispatcher loops.
    pub dispatcher_loops: usize,
    /// Upper bound on a single wait for worker capacity.
    pub recheck_interval: Duration,
    /// Recycle a worker when it answers with `crash_status`.
    pub crash_restart: bool,
    /// Upstream status meaning "this worker likely crashed".
    pub crash_status: u16,
    /// How many times a crash-failed request is dispatched again.
    pub max_retries: u32,
    /// How long shutdown waits for in-flight proxied calls.
    pub shutdown_grace: Duration,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            max_queue_depth: 1024,
            dispatcher_loops: 1,
            recheck_interval: Duration::from_millis(100),
            crash_restart: true,
            crash_status: 500,
            max_retries: 1,
            shutdown_grace: Duration::from_secs(30),
        }
    }
}

impl DispatchConfig {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load configuration from an arbitrary variable lookup.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let d = Self::default();
        let config = Self {
            max_queue_depth: parse_var(&lookup, "INFERGATE_MAX_QUEUE_DEPTH", d.max_queue_depth)?,
            dispatcher_loops: parse_var(&lookup, "INFERGATE_DISPATCHER_LOOPS", d.dispatcher_loops)?,
            recheck_interval: Duration::from_millis(parse_var(
                &lookup,
                "INFERGATE_RECHECK_INTERVAL_MS",
                d.recheck_interval.as_millis() as u64,
            )?),
            crash_restart: parse_bool(&lookup, "INFERGATE_CRASH_RESTART", d.crash_restart)?,
            crash_status: parse_var(&lookup, "INFERGATE_CRASH_STATUS", d.crash_status)?,
            max_retries: parse_var(&lookup, "INFERGATE_MAX_RETRIES", d.max_retries)?,
            shutdown_grace: Duration::from_secs(parse_var(
                &lookup,
                "INFERGATE_SHUTDOWN_GRACE_SECS",
                d.shutdown_grace.as_secs(),
            )?),
        };
        config.validate()?;
        Ok(config)
    }

    /// Check value ranges.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_queue_depth == 0 {
            return Err(ConfigError::Invalid("max_queue_depth must be at least 1".into()));
        }
        if self.dispatcher_loops == 0 {
            return Err(ConfigError::Invalid("dispatcher_loops must be at least 1".into()));
        }
        if self.recheck_interval.is_zero() {
            return Err(ConfigError::Invalid("recheck_interval must be non-zero".into()));
        }
        Ok(())
    }

    /// Set the queue depth bound.
    pub fn with_max_queue_depth(mut self, depth: usize) -> Self {
        self.max_queue_depth = depth;
        self
    }

    /// Set crash recycling behavior.
    pub fn with_crash_restart(mut self, enabled: bool, max_retries: u32) -> Self {
        self.crash_restart = enabled;
        self.max_retries = max_retries;
        self
    }

    /// Set the number of dispatcher loops.
    pub fn with_dispatcher_loops(mut self, loops: usize) -> Self {
        self.dispatcher_loops = loops;
        self
    }

    /// Set how long shutdown waits for in-flight calls.
    pub fn with_shutdown_grace(mut self, grace: Duration) -> Self {
        self.shutdown_grace = grace;
        self
    }
}

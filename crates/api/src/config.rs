//! Process configuration loaded from the environment.
//!
//! A `.env` file in the working directory is read first (if present); real
//! environment variables win over it. Every variable is optional.

use std::net::SocketAddr;
use std::str::FromStr;
use std::time::Duration;

use reelforge_observability::{LogConfig, LogFormat};
use reelforge_resilience::ResilienceConfig;
use reelforge_shutdown::ShutdownConfig;
use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("invalid value {value:?} for {var}: {reason}")]
    Invalid {
        var: &'static str,
        value: String,
        reason: String,
    },
}

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub bind_addr: SocketAddr,
    pub log: LogConfig,
    /// Progress events retained per job for replay
    pub history_limit: usize,
    pub heartbeat_interval: Duration,
    pub idle_timeout: Duration,
    /// Delay between a cancel and dropping the job's history
    pub cleanup_grace: Duration,
    /// Simulated work per pipeline step
    pub stage_delay: Duration,
    pub resilience: ResilienceConfig,
    pub shutdown: ShutdownConfig,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([0, 0, 0, 0], 8080)),
            log: LogConfig::default(),
            history_limit: 100,
            heartbeat_interval: Duration::from_secs(10),
            idle_timeout: Duration::from_secs(120),
            cleanup_grace: Duration::from_secs(30),
            stage_delay: Duration::from_millis(250),
            resilience: ResilienceConfig::default(),
            shutdown: ShutdownConfig::default(),
        }
    }
}

impl AppConfig {
    /// Load from the process environment, seeded from `.env`.
    pub fn from_env() -> Result<Self, ConfigError> {
        dotenvy::dotenv().ok();
        Self::from_lookup(|var| std::env::var(var).ok())
    }

    /// Load from an arbitrary variable source.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let env = Env { lookup };
        let mut config = Self::default();

        env.parse("REELFORGE_BIND_ADDR", &mut config.bind_addr)?;
        env.parse::<LogFormat>("REELFORGE_LOG_FORMAT", &mut config.log.format)?;
        if let Some(directive) = env.get("REELFORGE_LOG_LEVEL") {
            config.log.default_directive = directive;
        }

        env.parse("REELFORGE_HISTORY_LIMIT", &mut config.history_limit)?;
        if config.history_limit == 0 {
            return Err(invalid("REELFORGE_HISTORY_LIMIT", "0", "must be at least 1"));
        }
        env.secs("REELFORGE_HEARTBEAT_SECS", &mut config.heartbeat_interval)?;
        env.secs("REELFORGE_IDLE_TIMEOUT_SECS", &mut config.idle_timeout)?;
        env.secs("REELFORGE_CLEANUP_GRACE_SECS", &mut config.cleanup_grace)?;
        env.millis("REELFORGE_STAGE_DELAY_MS", &mut config.stage_delay)?;

        let retry = &mut config.resilience.retry;
        env.parse("REELFORGE_RETRY_MAX_ATTEMPTS", &mut retry.max_attempts)?;
        if retry.max_attempts == 0 {
            return Err(invalid("REELFORGE_RETRY_MAX_ATTEMPTS", "0", "must be at least 1"));
        }
        env.millis("REELFORGE_RETRY_INITIAL_DELAY_MS", &mut retry.base_delay)?;
        env.parse("REELFORGE_RETRY_BACKOFF_MULTIPLIER", &mut retry.multiplier)?;
        if !(retry.multiplier >= 1.0) {
            return Err(invalid(
                "REELFORGE_RETRY_BACKOFF_MULTIPLIER",
                &retry.multiplier.to_string(),
                "must be >= 1.0",
            ));
        }
        env.millis("REELFORGE_RETRY_MAX_DELAY_MS", &mut retry.max_delay)?;

        let breaker = &mut config.resilience.breaker;
        env.parse("REELFORGE_CB_FAILURE_RATIO", &mut breaker.failure_ratio)?;
        if !(breaker.failure_ratio > 0.0 && breaker.failure_ratio <= 1.0) {
            return Err(invalid(
                "REELFORGE_CB_FAILURE_RATIO",
                &breaker.failure_ratio.to_string(),
                "must be in (0, 1]",
            ));
        }
        env.parse("REELFORGE_CB_MIN_THROUGHPUT", &mut breaker.minimum_throughput)?;
        env.secs("REELFORGE_CB_SAMPLING_SECS", &mut breaker.sampling_duration)?;
        env.secs("REELFORGE_CB_BREAK_SECS", &mut breaker.break_duration)?;

        env.secs(
            "REELFORGE_SHUTDOWN_GRACEFUL_SECS",
            &mut config.shutdown.graceful_timeout,
        )?;
        env.secs(
            "REELFORGE_SHUTDOWN_PER_STEP_SECS",
            &mut config.shutdown.per_process_timeout,
        )?;

        Ok(config)
    }
}

fn invalid(var: &'static str, value: &str, reason: impl Into<String>) -> ConfigError {
    ConfigError::Invalid {
        var,
        value: value.to_string(),
        reason: reason.into(),
    }
}

struct Env<F> {
    lookup: F,
}

impl<F> Env<F>
where
    F: Fn(&str) -> Option<String>,
{
    fn get(&self, var: &str) -> Option<String> {
        (self.lookup)(var)
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
    }

    /// Overwrite `slot` when `var` is set.
    fn parse<T>(&self, var: &'static str, slot: &mut T) -> Result<(), ConfigError>
    where
        T: FromStr,
        T::Err: std::fmt::Display,
    {
        if let Some(raw) = self.get(var) {
            *slot = raw.parse().map_err(|e: T::Err| invalid(var, &raw, e.to_string()))?;
        }
        Ok(())
    }

    fn secs(&self, var: &'static str, slot: &mut Duration) -> Result<(), ConfigError> {
        let mut secs = slot.as_secs();
        self.parse(var, &mut secs)?;
        *slot = Duration::from_secs(secs);
        Ok(())
    }

    fn millis(&self, var: &'static str, slot: &mut Duration) -> Result<(), ConfigError> {
        let mut millis = slot.as_millis() as u64;
        self.parse(var, &mut millis)?;
        *slot = Duration::from_millis(millis);
        Ok(())
    }
}

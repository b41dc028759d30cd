//! Environment-driven configuration.
//!
//! All keys are optional except `REDIS_URL` when the Redis store is
//! selected. A `.env` file is honored via dotenvy before the process
//! environment is read.

use std::str::FromStr;
use std::time::Duration;

use thiserror::Error;

use crate::event_log::RetentionPolicy;
use crate::manager::ManagerConfig;
use crate::scheduler::SchedulerConfig;
use crate::types::RunMode;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid value for {key}: {value:?}")]
    Invalid { key: &'static str, value: String },

    #[error("REDIS_URL is required when ORCH_RUNSTORE=redis")]
    MissingRedisUrl,
}

#[derive(Clone, Debug)]
pub struct Config {
    pub bind: String,
    pub runstore: RunMode,
    pub redis_url: Option<String>,
    pub max_concurrent_runs: usize,
    pub max_concurrent_nodes_per_run: usize,
    pub event_retention_events: usize,
    pub event_retention_seconds: u64,
    pub min_replay_events: usize,
    pub node_timeout_seconds: u64,
    pub sse_heartbeat_seconds: u64,
    pub max_retries: u32,
    pub cancel_grace_seconds: u64,
    /// 0 disables the terminal-run purge sweep.
    pub run_ttl_seconds: u64,
    pub k8s_namespace: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bind: "0.0.0.0:8080".to_string(),
            runstore: RunMode::Memory,
            redis_url: None,
            max_concurrent_runs: 64,
            max_concurrent_nodes_per_run: 4,
            event_retention_events: 500,
            event_retention_seconds: 600,
            min_replay_events: 100,
            node_timeout_seconds: 600,
            sse_heartbeat_seconds: 30,
            max_retries: 3,
            cancel_grace_seconds: 30,
            run_ttl_seconds: 0,
            k8s_namespace: "default".to_string(),
        }
    }
}

fn parse_env<T: FromStr>(key: &'static str, default: T) -> Result<T, ConfigError> {
    match std::env::var(key) {
        Ok(raw) => raw
            .parse()
            .map_err(|_| ConfigError::Invalid { key, value: raw }),
        Err(_) => Ok(default),
    }
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        dotenvy::dotenv().ok();
        let defaults = Self::default();

        let config = Self {
            bind: std::env::var("ORCH_BIND").unwrap_or(defaults.bind),
            runstore: parse_env("ORCH_RUNSTORE", defaults.runstore)?,
            redis_url: std::env::var("REDIS_URL").ok(),
            max_concurrent_runs: parse_env(
                "ORCH_MAX_CONCURRENT_RUNS",
                defaults.max_concurrent_runs,
            )?,
            max_concurrent_nodes_per_run: parse_env(
                "ORCH_MAX_CONCURRENT_NODES_PER_RUN",
                defaults.max_concurrent_nodes_per_run,
            )?,
            event_retention_events: parse_env(
                "ORCH_EVENT_RETENTION_EVENTS",
                defaults.event_retention_events,
            )?,
            event_retention_seconds: parse_env(
                "ORCH_EVENT_RETENTION_SECONDS",
                defaults.event_retention_seconds,
            )?,
            min_replay_events: parse_env("ORCH_MIN_REPLAY_EVENTS", defaults.min_replay_events)?,
            node_timeout_seconds: parse_env(
                "ORCH_NODE_TIMEOUT_SECONDS",
                defaults.node_timeout_seconds,
            )?,
            sse_heartbeat_seconds: parse_env(
                "ORCH_SSE_HEARTBEAT_SECONDS",
                defaults.sse_heartbeat_seconds,
            )?,
            max_retries: parse_env("ORCH_MAX_RETRIES", defaults.max_retries)?,
            cancel_grace_seconds: parse_env(
                "ORCH_CANCEL_GRACE_SECONDS",
                defaults.cancel_grace_seconds,
            )?,
            run_ttl_seconds: parse_env("ORCH_RUN_TTL_SECONDS", defaults.run_ttl_seconds)?,
            k8s_namespace: std::env::var("ORCH_K8S_NAMESPACE").unwrap_or(defaults.k8s_namespace),
        };

        if config.runstore == RunMode::Redis && config.redis_url.is_none() {
            return Err(ConfigError::MissingRedisUrl);
        }
        Ok(config)
    }

    #[must_use]
    pub fn retention(&self) -> RetentionPolicy {
        RetentionPolicy {
            max_events: self.event_retention_events,
            max_age: Duration::from_secs(self.event_retention_seconds),
            min_replay: self.min_replay_events,
        }
    }

    #[must_use]
    pub fn scheduler(&self) -> SchedulerConfig {
        SchedulerConfig {
            max_concurrent_nodes: self.max_concurrent_nodes_per_run,
            max_retries: self.max_retries,
            node_timeout: Duration::from_secs(self.node_timeout_seconds),
            cancel_grace: Duration::from_secs(self.cancel_grace_seconds),
            ..SchedulerConfig::default()
        }
    }

    #[must_use]
    pub fn manager(&self) -> ManagerConfig {
        ManagerConfig {
            max_concurrent_runs: self.max_concurrent_runs,
            scheduler: self.scheduler(),
        }
    }

    #[must_use]
    pub fn sse_heartbeat(&self) -> Duration {
        Duration::from_secs(self.sse_heartbeat_seconds)
    }

    #[must_use]
    pub fn run_ttl(&self) -> Option<Duration> {
        (self.run_ttl_seconds > 0).then(|| Duration::from_secs(self.run_ttl_seconds))
    }
}

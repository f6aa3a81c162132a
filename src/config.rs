//! Environment-driven configuration.
//!
//! Every knob has a documented default so a bare `.env` with just
//! `DATABASE_URL` is enough to run. Durations are given in seconds (or
//! milliseconds where noted) in the environment and exposed as
//! `std::time::Duration` here.

use std::env;
use std::time::Duration;

use crate::error::DatabaseError;

fn env_var(key: &str) -> Option<String> {
    env::var(key).ok().filter(|v| !v.is_empty())
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> T {
    env_var(key).and_then(|v| v.parse().ok()).unwrap_or(default)
}

/// Database connection settings.
#[derive(Debug, Clone)]
pub struct DatabaseConfig {
    pub url: String,
    pub pool_size: usize,
}

impl DatabaseConfig {
    /// Load from `DATABASE_URL` and `DATABASE_POOL_SIZE`.
    pub fn from_env() -> Result<Self, DatabaseError> {
        let url = env_var("DATABASE_URL")
            .ok_or_else(|| DatabaseError::Pool("DATABASE_URL is not set".to_string()))?;
        Ok(Self {
            url,
            pool_size: env_parse("DATABASE_POOL_SIZE", 16),
        })
    }

    pub fn url(&self) -> &str {
        &self.url
    }
}

/// Task worker settings.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Poll interval when the queue is idle.
    pub poll_interval: Duration,
    /// Maximum tasks claimed per poll.
    pub batch_size: usize,
    /// Concurrent executions within one claimed batch.
    pub concurrency: usize,
    /// Maximum executor attempts per task before it is terminal.
    pub max_task_retries: u32,
    /// Budget for the post-task `advance` callback.
    pub callback_timeout: Duration,
    /// How often the worker logs queue statistics. Zero disables.
    pub stats_interval: Duration,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(5),
            batch_size: 3,
            concurrency: 3,
            max_task_retries: 3,
            callback_timeout: Duration::from_secs(30),
            stats_interval: Duration::from_secs(60),
        }
    }
}

impl WorkerConfig {
    pub fn from_env() -> Self {
        let d = Self::default();
        Self {
            poll_interval: Duration::from_secs(env_parse(
                "WORKER_POLL_INTERVAL_SECS",
                d.poll_interval.as_secs(),
            )),
            batch_size: env_parse("WORKER_BATCH_SIZE", d.batch_size),
            concurrency: env_parse("WORKER_CONCURRENCY", d.concurrency),
            max_task_retries: env_parse("TASK_MAX_RETRIES", d.max_task_retries),
            callback_timeout: Duration::from_secs(env_parse(
                "WORKER_CALLBACK_TIMEOUT_SECS",
                d.callback_timeout.as_secs(),
            )),
            stats_interval: Duration::from_secs(env_parse(
                "WORKER_STATS_INTERVAL_SECS",
                d.stats_interval.as_secs(),
            )),
        }
    }
}

/// Recovery scanner settings.
#[derive(Debug, Clone)]
pub struct RecoveryConfig {
    /// Interval between sweeps.
    pub interval: Duration,
    /// A session idle longer than this in THINK/INTEGRATE is stalled.
    pub stall_timeout: Duration,
    /// A session idle longer than this in EXECUTE (tasks outstanding) is stalled.
    pub execute_stall_timeout: Duration,
    /// A task PROCESSING longer than this is considered abandoned.
    pub lease_timeout: Duration,
}

impl Default for RecoveryConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(60),
            stall_timeout: Duration::from_secs(5 * 60),
            execute_stall_timeout: Duration::from_secs(15 * 60),
            lease_timeout: Duration::from_secs(10 * 60),
        }
    }
}

impl RecoveryConfig {
    pub fn from_env() -> Self {
        let d = Self::default();
        Self {
            interval: Duration::from_secs(env_parse(
                "RECOVERY_INTERVAL_SECS",
                d.interval.as_secs(),
            )),
            stall_timeout: Duration::from_secs(env_parse(
                "SESSION_STALL_TIMEOUT_SECS",
                d.stall_timeout.as_secs(),
            )),
            execute_stall_timeout: Duration::from_secs(env_parse(
                "SESSION_EXECUTE_STALL_TIMEOUT_SECS",
                d.execute_stall_timeout.as_secs(),
            )),
            lease_timeout: Duration::from_secs(env_parse(
                "TASK_LEASE_TIMEOUT_SECS",
                d.lease_timeout.as_secs(),
            )),
        }
    }
}

/// Session-level retry policy.
#[derive(Debug, Clone)]
pub struct SessionPolicy {
    /// Maximum strategy-error retries before a session fails.
    pub max_retries: u32,
    /// Base delay for exponential backoff between retries.
    pub retry_base_delay: Duration,
}

impl Default for SessionPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            retry_base_delay: Duration::from_secs(30),
        }
    }
}

impl SessionPolicy {
    pub fn from_env() -> Self {
        let d = Self::default();
        Self {
            max_retries: env_parse("SESSION_MAX_RETRIES", d.max_retries),
            retry_base_delay: Duration::from_secs(env_parse(
                "SESSION_RETRY_BASE_DELAY_SECS",
                d.retry_base_delay.as_secs(),
            )),
        }
    }
}

/// OpenAI-compatible chat completion provider settings.
#[derive(Debug, Clone)]
pub struct LlmConfig {
    pub base_url: String,
    pub api_key: Option<String>,
    pub model: String,
    pub request_timeout: Duration,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            base_url: "https://api.openai.com".to_string(),
            api_key: None,
            model: "gpt-4o".to_string(),
            request_timeout: Duration::from_secs(120),
        }
    }
}

impl LlmConfig {
    pub fn from_env() -> Self {
        let d = Self::default();
        Self {
            base_url: env_var("OPENAI_BASE_URL").unwrap_or(d.base_url),
            api_key: env_var("OPENAI_API_KEY"),
            model: env_var("OPENAI_MODEL").unwrap_or(d.model),
            request_timeout: Duration::from_secs(env_parse(
                "LLM_REQUEST_TIMEOUT_SECS",
                d.request_timeout.as_secs(),
            )),
        }
    }
}

/// Online search provider settings (Perplexity-compatible).
#[derive(Debug, Clone)]
pub struct SearchConfig {
    pub base_url: String,
    pub api_key: Option<String>,
    pub model: String,
    pub request_timeout: Duration,
}

impl Default for SearchConfig {
    fn default() -> Self {
        Self {
            base_url: "https://api.perplexity.ai".to_string(),
            api_key: None,
            model: "sonar".to_string(),
            request_timeout: Duration::from_secs(120),
        }
    }
}

impl SearchConfig {
    pub fn from_env() -> Self {
        let d = Self::default();
        Self {
            base_url: env_var("PERPLEXITY_BASE_URL").unwrap_or(d.base_url),
            api_key: env_var("PERPLEXITY_API_KEY"),
            model: env_var("PERPLEXITY_MODEL").unwrap_or(d.model),
            request_timeout: Duration::from_secs(env_parse(
                "SEARCH_REQUEST_TIMEOUT_SECS",
                d.request_timeout.as_secs(),
            )),
        }
    }
}

/// HTTP API server settings.
#[derive(Debug, Clone)]
pub struct HttpConfig {
    pub bind: std::net::SocketAddr,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            bind: "127.0.0.1:8787".parse().expect("static addr"),
        }
    }
}

impl HttpConfig {
    pub fn from_env() -> Self {
        let d = Self::default();
        Self {
            bind: env_var("HTTP_BIND")
                .and_then(|v| v.parse().ok())
                .unwrap_or(d.bind),
        }
    }
}

/// Top-level configuration bundle.
#[derive(Debug, Clone, Default)]
pub struct Config {
    pub worker: WorkerConfig,
    pub recovery: RecoveryConfig,
    pub session: SessionPolicy,
    pub llm: LlmConfig,
    pub search: SearchConfig,
    pub http: HttpConfig,
}

impl Config {
    /// Load everything except the database (which may be absent for
    /// ephemeral runs).
    pub fn from_env() -> Self {
        Self {
            worker: WorkerConfig::from_env(),
            recovery: RecoveryConfig::from_env(),
            session: SessionPolicy::from_env(),
            llm: LlmConfig::from_env(),
            search: SearchConfig::from_env(),
            http: HttpConfig::from_env(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_worker_defaults() {
        let config = WorkerConfig::default();
        assert_eq!(config.poll_interval, Duration::from_secs(5));
        assert_eq!(config.batch_size, 3);
        assert_eq!(config.concurrency, 3);
        assert_eq!(config.max_task_retries, 3);
        assert_eq!(config.callback_timeout, Duration::from_secs(30));
    }

    #[test]
    fn test_recovery_defaults() {
        let config = RecoveryConfig::default();
        assert_eq!(config.stall_timeout, Duration::from_secs(300));
        assert_eq!(config.lease_timeout, Duration::from_secs(600));
        assert!(config.execute_stall_timeout > config.stall_timeout);
    }

    #[test]
    fn test_session_policy_defaults() {
        let policy = SessionPolicy::default();
        assert_eq!(policy.max_retries, 3);
        assert_eq!(policy.retry_base_delay, Duration::from_secs(30));
    }
}

/// Configuration management for the taskgraph engine
///
/// Handles engine tuning (timeouts, concurrency, retry pacing), the default
/// remote caller endpoint and the artifact directory.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Main application configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Execution engine configuration
    pub engine: EngineConfig,
    /// Remote caller configuration
    pub caller: CallerConfig,
}

/// Execution engine configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Upper bound for a single remote call in seconds (0 disables the limit)
    pub call_timeout_secs: u64,
    /// Maximum number of remote calls in flight at once
    pub max_concurrency: usize,
    /// Pause between a failed attempt and its retry in milliseconds
    pub retry_delay_ms: u64,
    /// Default directory for run artifacts (None = artifacts disabled)
    pub project_dir: Option<String>,
}

/// Remote caller configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CallerConfig {
    /// Base URL that endpoint identifiers are appended to (e.g., "http://127.0.0.1:8080")
    pub base_url: String,
}

impl EngineConfig {
    pub fn call_timeout(&self) -> Option<Duration> {
        (self.call_timeout_secs > 0).then(|| Duration::from_secs(self.call_timeout_secs))
    }

    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            call_timeout_secs: 300,
            max_concurrency: 16,
            retry_delay_ms: 0,
            project_dir: None,
        }
    }
}

impl Config {
    /// Build configuration from TASKGRAPH_* environment variables
    pub fn from_env() -> Self {
        let defaults = EngineConfig::default();
        Self {
            engine: EngineConfig {
                call_timeout_secs: env_parse("TASKGRAPH_CALL_TIMEOUT_SECS", defaults.call_timeout_secs),
                max_concurrency: env_parse("TASKGRAPH_MAX_CONCURRENCY", defaults.max_concurrency),
                retry_delay_ms: env_parse("TASKGRAPH_RETRY_DELAY_MS", defaults.retry_delay_ms),
                project_dir: std::env::var("TASKGRAPH_PROJECT_DIR").ok(),
            },
            caller: CallerConfig {
                base_url: std::env::var("TASKGRAPH_CALLER_URL")
                    .unwrap_or_else(|_| "http://127.0.0.1:8080".to_string()),
            },
        }
    }
}

impl Default for Config {
    /// Default configuration with ENV_VAR support for container deployment
    fn default() -> Self {
        Self::from_env()
    }
}

fn env_parse<T: std::str::FromStr>(key: &str, fallback: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|value| value.parse().ok())
        .unwrap_or(fallback)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zero_timeout_disables_limit() {
        let config = EngineConfig { call_timeout_secs: 0, ..EngineConfig::default() };
        assert_eq!(config.call_timeout(), None);
        assert_eq!(EngineConfig::default().call_timeout(), Some(Duration::from_secs(300)));
    }

    #[test]
    fn env_parse_falls_back_on_garbage() {
        std::env::set_var("TASKGRAPH_TEST_GARBAGE", "not-a-number");
        assert_eq!(env_parse("TASKGRAPH_TEST_GARBAGE", 7usize), 7);
        std::env::set_var("TASKGRAPH_TEST_NUMBER", "12");
        assert_eq!(env_parse("TASKGRAPH_TEST_NUMBER", 7usize), 12);
    }
}

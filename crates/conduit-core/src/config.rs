// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Configuration loading from environment variables.

use std::net::SocketAddr;
use std::time::Duration;

/// Conduit Core configuration
#[derive(Debug, Clone)]
pub struct Config {
    /// SQLite connection URL
    pub database_url: String,
    /// HTTP server address for the slot and channel API
    pub http_addr: SocketAddr,
    /// Coordinator instance id; owner of the operations this process creates
    pub instance_id: String,
    /// Maximum concurrently executing operations
    pub max_concurrent_operations: usize,
    /// Initial retry budget of newly bound producers
    pub producer_retry_budget: i64,
    /// Deadline of engine operations, measured from creation
    pub operation_deadline: Duration,
    /// Base URL of the workflow service
    pub workflow_url: Option<String>,
}

impl Config {
    /// Load configuration from environment variables.
    ///
    /// Required:
    /// - `CONDUIT_DATABASE_URL`: SQLite connection string
    ///
    /// Optional (with defaults):
    /// - `CONDUIT_HTTP_PORT`: HTTP server port (default: 8122)
    /// - `CONDUIT_INSTANCE_ID`: Instance id (default: `HOSTNAME` or `conduit-local`)
    /// - `CONDUIT_MAX_CONCURRENT_OPERATIONS`: Engine pool size (default: 16)
    /// - `CONDUIT_PRODUCER_RETRY_BUDGET`: Producer retry budget (default: 2)
    /// - `CONDUIT_OPERATION_DEADLINE_SECS`: Operation deadline (default: 600)
    /// - `CONDUIT_WORKFLOW_URL`: Workflow service URL (default: unset, abort requests are only logged)
    pub fn from_env() -> Result<Self, ConfigError> {
        let database_url = std::env::var("CONDUIT_DATABASE_URL")
            .map_err(|_| ConfigError::Missing("CONDUIT_DATABASE_URL"))?;

        let http_port: u16 = std::env::var("CONDUIT_HTTP_PORT")
            .unwrap_or_else(|_| "8122".to_string())
            .parse()
            .map_err(|_| ConfigError::Invalid("CONDUIT_HTTP_PORT", "must be a valid port number"))?;

        let instance_id = std::env::var("CONDUIT_INSTANCE_ID")
            .or_else(|_| std::env::var("HOSTNAME"))
            .ok()
            .filter(|id| !id.is_empty())
            .unwrap_or_else(|| "conduit-local".to_string());

        let max_concurrent_operations: usize = std::env::var("CONDUIT_MAX_CONCURRENT_OPERATIONS")
            .unwrap_or_else(|_| "16".to_string())
            .parse()
            .ok()
            .filter(|n| *n > 0)
            .ok_or(ConfigError::Invalid(
                "CONDUIT_MAX_CONCURRENT_OPERATIONS",
                "must be a positive integer",
            ))?;

        let producer_retry_budget: i64 = std::env::var("CONDUIT_PRODUCER_RETRY_BUDGET")
            .unwrap_or_else(|_| "2".to_string())
            .parse()
            .ok()
            .filter(|n| *n >= 0)
            .ok_or(ConfigError::Invalid(
                "CONDUIT_PRODUCER_RETRY_BUDGET",
                "must be a non-negative integer",
            ))?;

        let deadline_secs: u64 = std::env::var("CONDUIT_OPERATION_DEADLINE_SECS")
            .unwrap_or_else(|_| "600".to_string())
            .parse()
            .ok()
            .filter(|n| *n > 0)
            .ok_or(ConfigError::Invalid(
                "CONDUIT_OPERATION_DEADLINE_SECS",
                "must be a positive number of seconds",
            ))?;

        let workflow_url = std::env::var("CONDUIT_WORKFLOW_URL")
            .ok()
            .filter(|url| !url.is_empty());

        Ok(Self {
            database_url,
            http_addr: SocketAddr::from(([0, 0, 0, 0], http_port)),
            instance_id,
            max_concurrent_operations,
            producer_retry_budget,
            operation_deadline: Duration::from_secs(deadline_secs),
            workflow_url,
        })
    }
}

/// Configuration errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// A required environment variable is missing.
    #[error("missing required environment variable: {0}")]
    Missing(&'static str),

    /// An environment variable has an invalid value.
    #[error("invalid value for {0}: {1}")]
    Invalid(&'static str, &'static str),
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::env;
    use std::sync::Mutex;

    // Mutex to serialize tests that modify environment variables
    static ENV_MUTEX: Mutex<()> = Mutex::new(());

    const VARS: &[&str] = &[
        "CONDUIT_DATABASE_URL",
        "CONDUIT_HTTP_PORT",
        "CONDUIT_INSTANCE_ID",
        "CONDUIT_MAX_CONCURRENT_OPERATIONS",
        "CONDUIT_PRODUCER_RETRY_BUDGET",
        "CONDUIT_OPERATION_DEADLINE_SECS",
        "CONDUIT_WORKFLOW_URL",
    ];

    /// Helper to set env vars for a test and restore them after
    struct EnvGuard {
        vars: Vec<(String, Option<String>)>,
    }

    impl EnvGuard {
        fn new() -> Self {
            Self { vars: Vec::new() }
        }

        /// Start from a clean slate for every conduit variable.
        fn cleared() -> Self {
            let mut guard = Self::new();
            for var in VARS {
                guard.remove(var);
            }
            guard
        }

        fn set(&mut self, key: &str, value: &str) {
            let old = env::var(key).ok();
            self.vars.push((key.to_string(), old));
            // SAFETY: Tests are serialized via ENV_MUTEX, so no concurrent access
            unsafe { env::set_var(key, value) };
        }

        fn remove(&mut self, key: &str) {
            let old = env::var(key).ok();
            self.vars.push((key.to_string(), old));
            // SAFETY: Tests are serialized via ENV_MUTEX, so no concurrent access
            unsafe { env::remove_var(key) };
        }
    }

    impl Drop for EnvGuard {
        fn drop(&mut self) {
            for (key, value) in self.vars.drain(..).rev() {
                // SAFETY: Tests are serialized via ENV_MUTEX, so no concurrent access
                unsafe {
                    match value {
                        Some(v) => env::set_var(&key, v),
                        None => env::remove_var(&key),
                    }
                }
            }
        }
    }

    #[test]
    fn test_config_from_env_with_defaults() {
        let _lock = ENV_MUTEX.lock().unwrap();
        let mut guard = EnvGuard::cleared();

        guard.set("CONDUIT_DATABASE_URL", "sqlite:conduit.db?mode=rwc");
        guard.set("CONDUIT_INSTANCE_ID", "conduit-a");

        let config = Config::from_env().unwrap();

        assert_eq!(config.database_url, "sqlite:conduit.db?mode=rwc");
        assert_eq!(config.http_addr.port(), 8122);
        assert_eq!(config.instance_id, "conduit-a");
        assert_eq!(config.max_concurrent_operations, 16);
        assert_eq!(config.producer_retry_budget, 2);
        assert_eq!(config.operation_deadline, Duration::from_secs(600));
        assert!(config.workflow_url.is_none());
    }

    #[test]
    fn test_config_from_env_all_custom() {
        let _lock = ENV_MUTEX.lock().unwrap();
        let mut guard = EnvGuard::cleared();

        guard.set("CONDUIT_DATABASE_URL", "sqlite::memory:");
        guard.set("CONDUIT_HTTP_PORT", "9000");
        guard.set("CONDUIT_INSTANCE_ID", "node-7");
        guard.set("CONDUIT_MAX_CONCURRENT_OPERATIONS", "4");
        guard.set("CONDUIT_PRODUCER_RETRY_BUDGET", "0");
        guard.set("CONDUIT_OPERATION_DEADLINE_SECS", "30");
        guard.set("CONDUIT_WORKFLOW_URL", "http://workflows:8080");

        let config = Config::from_env().unwrap();

        assert_eq!(config.http_addr.port(), 9000);
        assert_eq!(config.instance_id, "node-7");
        assert_eq!(config.max_concurrent_operations, 4);
        assert_eq!(config.producer_retry_budget, 0);
        assert_eq!(config.operation_deadline, Duration::from_secs(30));
        assert_eq!(config.workflow_url.as_deref(), Some("http://workflows:8080"));
    }

    #[test]
    fn test_config_missing_database_url() {
        let _lock = ENV_MUTEX.lock().unwrap();
        let _guard = EnvGuard::cleared();

        let err = Config::from_env().unwrap_err();
        assert!(matches!(err, ConfigError::Missing("CONDUIT_DATABASE_URL")));
        assert!(err.to_string().contains("CONDUIT_DATABASE_URL"));
    }

    #[test]
    fn test_config_invalid_http_port() {
        let _lock = ENV_MUTEX.lock().unwrap();
        let mut guard = EnvGuard::cleared();

        guard.set("CONDUIT_DATABASE_URL", "sqlite::memory:");
        guard.set("CONDUIT_HTTP_PORT", "99999"); // > 65535

        let err = Config::from_env().unwrap_err();
        assert!(matches!(err, ConfigError::Invalid("CONDUIT_HTTP_PORT", _)));
    }

    #[test]
    fn test_config_rejects_zero_operations() {
        let _lock = ENV_MUTEX.lock().unwrap();
        let mut guard = EnvGuard::cleared();

        guard.set("CONDUIT_DATABASE_URL", "sqlite::memory:");
        guard.set("CONDUIT_MAX_CONCURRENT_OPERATIONS", "0");

        let err = Config::from_env().unwrap_err();
        assert!(matches!(
            err,
            ConfigError::Invalid("CONDUIT_MAX_CONCURRENT_OPERATIONS", _)
        ));
    }

    #[test]
    fn test_config_rejects_negative_retry_budget() {
        let _lock = ENV_MUTEX.lock().unwrap();
        let mut guard = EnvGuard::cleared();

        guard.set("CONDUIT_DATABASE_URL", "sqlite::memory:");
        guard.set("CONDUIT_PRODUCER_RETRY_BUDGET", "-1");

        let err = Config::from_env().unwrap_err();
        assert!(matches!(
            err,
            ConfigError::Invalid("CONDUIT_PRODUCER_RETRY_BUDGET", _)
        ));
    }
}

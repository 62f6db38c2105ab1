//! Environment-style configuration surface.
//!
//! Every threshold the core consumes is a field with a default, and
//! every field can be overridden with a `QUORUM_`-prefixed environment
//! variable. Unparseable values fall back to the default rather than
//! aborting startup.

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use log::warn;

use crate::acp::client::AcpClientConfig;
use crate::acp::pool::PoolConfig;
use crate::breaker::BreakerConfig;
use crate::sandbox::SandboxConfig;
use crate::session::orchestrator::SessionConfig;

/// Aggregate configuration for the whole core.
#[derive(Debug, Clone, Default)]
pub struct Config {
    pub agent: AcpClientConfig,
    pub pool: PoolConfig,
    pub breaker: BreakerConfig,
    pub session: SessionConfig,
    pub sandbox: SandboxConfig,
}

impl Config {
    /// Read configuration from the environment.
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Ok(endpoint) = std::env::var("QUORUM_AGENT_ENDPOINT") {
            config.agent.endpoint = endpoint;
        }
        config.agent.token = std::env::var("QUORUM_AGENT_TOKEN").ok();
        config.agent.connect_timeout =
            duration_ms("QUORUM_CONNECT_TIMEOUT_MS", config.agent.connect_timeout);
        config.agent.request_timeout =
            duration_ms("QUORUM_REQUEST_TIMEOUT_MS", config.agent.request_timeout);
        config.agent.max_reconnect_attempts = parse_env(
            "QUORUM_MAX_RECONNECT_ATTEMPTS",
            config.agent.max_reconnect_attempts,
        );

        config.pool.max_pool_size = parse_env("QUORUM_MAX_POOL_SIZE", config.pool.max_pool_size);
        config.pool.batch_size = parse_env("QUORUM_BATCH_SIZE", config.pool.batch_size);
        config.pool.batch_delay = duration_ms("QUORUM_BATCH_DELAY_MS", config.pool.batch_delay);
        config.pool.acquire_timeout =
            duration_ms("QUORUM_ACQUIRE_TIMEOUT_MS", config.pool.acquire_timeout);

        config.breaker.failure_threshold = parse_env(
            "QUORUM_FAILURE_THRESHOLD",
            config.breaker.failure_threshold,
        );
        config.breaker.reset_timeout =
            duration_ms("QUORUM_RESET_TIMEOUT_MS", config.breaker.reset_timeout);
        config.breaker.call_timeout =
            duration_ms("QUORUM_CALL_TIMEOUT_MS", config.breaker.call_timeout);
        config.breaker.recovery_threshold = parse_env(
            "QUORUM_RECOVERY_THRESHOLD",
            config.breaker.recovery_threshold,
        );

        config.session.create_retries =
            parse_env("QUORUM_CREATE_RETRIES", config.session.create_retries);
        config.session.retry_backoff_base = duration_ms(
            "QUORUM_RETRY_BACKOFF_BASE_MS",
            config.session.retry_backoff_base,
        );
        config.session.session_max_age =
            duration_ms("QUORUM_SESSION_MAX_AGE_MS", config.session.session_max_age);
        config.session.reap_interval =
            duration_ms("QUORUM_REAP_INTERVAL_MS", config.session.reap_interval);
        config.session.stream_chunk_size = parse_env(
            "QUORUM_STREAM_CHUNK_SIZE",
            config.session.stream_chunk_size,
        );
        config.session.stream_chunk_delay = duration_ms(
            "QUORUM_STREAM_CHUNK_DELAY_MS",
            config.session.stream_chunk_delay,
        );

        if let Ok(image) = std::env::var("QUORUM_SANDBOX_IMAGE") {
            config.sandbox.image = image;
        }
        if let Ok(root) = std::env::var("QUORUM_SANDBOX_WORKSPACE_ROOT") {
            config.sandbox.workspace_root = PathBuf::from(root);
        }
        if let Ok(memory) = std::env::var("QUORUM_SANDBOX_MEMORY") {
            config.sandbox.limits.memory = memory;
        }
        config.sandbox.limits.cpus =
            parse_env("QUORUM_SANDBOX_CPUS", config.sandbox.limits.cpus);
        if let Ok(disk) = std::env::var("QUORUM_SANDBOX_DISK") {
            config.sandbox.limits.disk_space = disk;
        }
        config.sandbox.limits.network_access = parse_env(
            "QUORUM_SANDBOX_NETWORK",
            config.sandbox.limits.network_access,
        );
        config.sandbox.idle_timeout = duration_ms(
            "QUORUM_SANDBOX_IDLE_TIMEOUT_MS",
            config.sandbox.idle_timeout,
        );
        config.sandbox.tool_output_limit = parse_env(
            "QUORUM_TOOL_OUTPUT_LIMIT",
            config.sandbox.tool_output_limit,
        );

        config
    }
}

/// Parse an environment variable, falling back to `default` when unset
/// or unparseable.
fn parse_env<T: FromStr + Copy>(key: &str, default: T) -> T {
    match std::env::var(key) {
        Ok(raw) => parse_or(key, &raw, default),
        Err(_) => default,
    }
}

fn parse_or<T: FromStr + Copy>(key: &str, raw: &str, default: T) -> T {
    match raw.parse() {
        Ok(value) => value,
        Err(_) => {
            warn!("ignoring unparseable {key}={raw}");
            default
        }
    }
}

fn duration_ms(key: &str, default: Duration) -> Duration {
    Duration::from_millis(parse_env(key, default.as_millis() as u64))
}

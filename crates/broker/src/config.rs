//! Broker and pool configuration from the environment.

use std::time::Duration;

/// Connection parameters, read from `BROKER_*` environment variables.
///
/// Host, port and credentials describe the broker endpoint; with the
/// in-process transport they are carried for parity (and logged on
/// connect) rather than dialled.
#[derive(Debug, Clone)]
pub struct BrokerConfig {
    pub host: String,
    pub port: u16,
    pub user: String,
    pub pass: String,
    /// Dead-peer detection interval.
    pub heartbeat: Duration,
    pub connect_timeout: Duration,
    /// How long a flow-blocked connection may stall before teardown.
    pub blocked_timeout: Duration,
    pub socket_timeout: Duration,
    pub connection_attempts: u32,
    pub retry_delay: Duration,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 5672,
            user: "admin".to_string(),
            pass: "password".to_string(),
            heartbeat: Duration::from_secs(60),
            connect_timeout: Duration::from_secs(10),
            blocked_timeout: Duration::from_secs(300),
            socket_timeout: Duration::from_secs(10),
            connection_attempts: 3,
            retry_delay: Duration::from_secs(2),
        }
    }
}

impl BrokerConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            host: env_string("BROKER_HOST", defaults.host),
            port: env_parse("BROKER_PORT", defaults.port),
            user: env_string("BROKER_USER", defaults.user),
            pass: env_string("BROKER_PASS", defaults.pass),
            heartbeat: env_secs("BROKER_HEARTBEAT", defaults.heartbeat),
            connect_timeout: env_secs("BROKER_CONNECT_TIMEOUT", defaults.connect_timeout),
            blocked_timeout: env_secs("BROKER_BLOCKED_TIMEOUT", defaults.blocked_timeout),
            socket_timeout: env_secs("BROKER_SOCKET_TIMEOUT", defaults.socket_timeout),
            connection_attempts: defaults.connection_attempts,
            retry_delay: defaults.retry_delay,
        }
    }
}

/// Connection-pool parameters, read from `POOL_*` environment variables.
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Connections kept pooled.
    pub size: usize,
    /// Extra connections allowed under load; destroyed on checkin.
    pub max_overflow: usize,
    /// Checkout wait bound before `PoolExhaustedError`.
    pub timeout: Duration,
    /// Connections older than this are destroyed on checkin.
    pub recycle: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            size: 10,
            max_overflow: 5,
            timeout: Duration::from_secs(30),
            recycle: Duration::from_secs(3600),
        }
    }
}

impl PoolConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            size: env_parse("POOL_SIZE", defaults.size),
            max_overflow: env_parse("POOL_MAX_OVERFLOW", defaults.max_overflow),
            timeout: env_secs("POOL_TIMEOUT", defaults.timeout),
            recycle: env_secs("POOL_RECYCLE", defaults.recycle),
        }
    }
}

fn env_string(name: &str, default: String) -> String {
    std::env::var(name).unwrap_or(default)
}

pub(crate) fn env_parse<T: std::str::FromStr>(name: &str, default: T) -> T {
    std::env::var(name)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

pub(crate) fn env_secs(name: &str, default: Duration) -> Duration {
    std::env::var(name)
        .ok()
        .and_then(|v| v.parse::<u64>().ok())
        .map(Duration::from_secs)
        .unwrap_or(default)
}

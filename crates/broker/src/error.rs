//! Broker errors.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, BrokerError>;

#[derive(Debug, Error)]
pub enum BrokerError {
    #[error("broker unreachable after {attempts} attempt(s)")]
    Unreachable { attempts: u32 },

    #[error("connection is closed")]
    ConnectionClosed,

    #[error("queue '{0}' is not declared")]
    QueueNotFound(String),

    #[error("unknown delivery tag {0}")]
    UnknownDelivery(u64),

    #[error("timed out waiting for a pooled connection after {0:.1}s")]
    PoolExhausted(f64),

    #[error("failed to serialize payload: {0}")]
    Serialize(#[from] serde_json::Error),
}

impl BrokerError {
    /// Publish-side failures are retried by requeueing the in-flight
    /// delivery; everything else is terminal for the caller.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            BrokerError::ConnectionClosed | BrokerError::PoolExhausted(_)
        )
    }
}

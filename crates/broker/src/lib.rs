//! In-process AMQP-like message broker.
//!
//! The simulation components speak the classic broker contract (durable
//! queues, persistent messages, manual acknowledgement, per-message retry
//! headers, dead-letter routing, fair dispatch with prefetch credit) over
//! an in-process transport. `Broker` owns the queue state; `Connection` is
//! the client handle components use; `ConnectionPool` bounds and recycles
//! connections. The client surface keeps the wire contract so a networked
//! transport could replace the core without touching callers.

mod broker;
mod config;
mod envelope;
mod error;
mod pool;
mod queue;

pub use broker::{Broker, Delivery, Subscription};
pub use config::{BrokerConfig, PoolConfig};
pub use envelope::{
    retry_count, Envelope, Headers, CONSUMER_ID_HEADER, LAST_ERROR_HEADER, RETRY_COUNT_HEADER,
};
pub use error::{BrokerError, Result};
pub use pool::{global_pool, ConnectionPool, PooledConnection};
pub use queue::{standard_topology, QueueSpec};

pub use broker::Connection;

/// Stable queue identifiers.
pub mod queues {
    pub const MODEL: &str = "cola_modelo";
    pub const SCENARIOS: &str = "cola_escenarios";
    pub const RESULTS: &str = "cola_resultados";
    pub const SCENARIOS_DLQ: &str = "cola_dlq_escenarios";
    pub const RESULTS_DLQ: &str = "cola_dlq_resultados";
    pub const PRODUCER_STATS: &str = "cola_stats_productor";
    pub const CONSUMER_STATS: &str = "cola_stats_consumidores";
}

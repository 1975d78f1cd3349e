//! Queue specifications and the standard topology.

use std::time::Duration;

use crate::queues;

/// Declarative queue properties, mirroring AMQP queue arguments.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueSpec {
    pub name: String,
    pub durable: bool,
    /// Per-message TTL; expired messages are evicted lazily.
    pub message_ttl: Option<Duration>,
    /// Oldest messages are dead-lettered (or dropped) past this length.
    pub max_length: Option<usize>,
    /// Destination for rejected and overflowed messages.
    pub dead_letter: Option<String>,
}

impl QueueSpec {
    pub fn durable(name: &str) -> Self {
        Self {
            name: name.to_string(),
            durable: true,
            message_ttl: None,
            max_length: None,
            dead_letter: None,
        }
    }

    pub fn transient(name: &str) -> Self {
        Self {
            durable: false,
            ..Self::durable(name)
        }
    }

    pub fn with_max_length(mut self, max: usize) -> Self {
        self.max_length = Some(max);
        self
    }

    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.message_ttl = Some(ttl);
        self
    }

    pub fn with_dead_letter(mut self, queue: &str) -> Self {
        self.dead_letter = Some(queue.to_string());
        self
    }
}

/// The seven-queue topology of the simulation system.
///
/// | queue | durable | ttl | dlq | max len |
/// |---|---|---|---|---|
/// | `cola_modelo` | yes | - | - | 1 |
/// | `cola_escenarios` | yes | - | `cola_dlq_escenarios` | 100 000 |
/// | `cola_resultados` | yes | - | `cola_dlq_resultados` | - |
/// | `cola_dlq_escenarios` | yes | - | - | - |
/// | `cola_dlq_resultados` | yes | - | - | - |
/// | `cola_stats_productor` | no | 60 s | - | 100 |
/// | `cola_stats_consumidores` | no | 60 s | - | 1 000 |
pub fn standard_topology() -> Vec<QueueSpec> {
    vec![
        QueueSpec::durable(queues::SCENARIOS_DLQ),
        QueueSpec::durable(queues::RESULTS_DLQ),
        QueueSpec::durable(queues::MODEL).with_max_length(1),
        QueueSpec::durable(queues::SCENARIOS)
            .with_max_length(100_000)
            .with_dead_letter(queues::SCENARIOS_DLQ),
        QueueSpec::durable(queues::RESULTS).with_dead_letter(queues::RESULTS_DLQ),
        QueueSpec::transient(queues::PRODUCER_STATS)
            .with_max_length(100)
            .with_ttl(Duration::from_millis(60_000)),
        QueueSpec::transient(queues::CONSUMER_STATS)
            .with_max_length(1_000)
            .with_ttl(Duration::from_millis(60_000)),
    ]
}

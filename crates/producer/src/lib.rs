//! Scenario producer.
//!
//! Single-shot flow: declare the topology, replace the resident model
//! (purge then publish), generate `N` scenarios from the seeded generator
//! and publish each one persistently, emitting periodic telemetry. The
//! producer never consumes results.

use std::time::{Duration, Instant};

use thiserror::Error;
use tracing::{debug, info};

use azar_broker::{queues, standard_topology, BrokerError, Connection};
use azar_model::{
    ConfigError, Generator, Model, ModelMessage, ProducerState, ProducerStats, ScenarioMessage,
};

/// Default telemetry interval (`PRODUCER_STATS_INTERVAL`), seconds.
pub const DEFAULT_STATS_INTERVAL_SECS: u64 = 5;

#[derive(Debug, Error)]
pub enum ProducerError {
    #[error("broker error: {0}")]
    Broker(#[from] BrokerError),

    #[error("failed to publish scenario {scenario_id}: {source}")]
    Publish {
        scenario_id: u64,
        source: BrokerError,
    },

    #[error("scenario generation failed: {0}")]
    Generation(#[from] ConfigError),
}

impl ProducerError {
    /// Process exit code per the operational contract.
    pub fn exit_code(&self) -> i32 {
        match self {
            ProducerError::Broker(BrokerError::Unreachable { .. }) => 2,
            ProducerError::Generation(_) => 1,
            _ => 4,
        }
    }
}

/// Summary of a completed run.
#[derive(Debug, Clone)]
pub struct ProducerReport {
    pub model_id: String,
    pub generated: u64,
    pub elapsed: Duration,
}

/// Producer configuration knobs.
#[derive(Debug, Clone)]
pub struct ProducerConfig {
    pub stats_interval: Duration,
    /// Override of the model's scenario count.
    pub num_scenarios: Option<u64>,
}

impl Default for ProducerConfig {
    fn default() -> Self {
        Self {
            stats_interval: Duration::from_secs(DEFAULT_STATS_INTERVAL_SECS),
            num_scenarios: None,
        }
    }
}

impl ProducerConfig {
    pub fn from_env() -> Self {
        let stats_secs = std::env::var("PRODUCER_STATS_INTERVAL")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(DEFAULT_STATS_INTERVAL_SECS);
        Self {
            stats_interval: Duration::from_secs(stats_secs),
            num_scenarios: None,
        }
    }
}

pub struct Producer<'a> {
    conn: &'a Connection,
    config: ProducerConfig,
}

impl<'a> Producer<'a> {
    pub fn new(conn: &'a Connection, config: ProducerConfig) -> Self {
        Self { conn, config }
    }

    /// Run the full producer flow for a parsed model.
    pub async fn run(&self, model: &Model) -> Result<ProducerReport, ProducerError> {
        let started = Instant::now();
        let total = self
            .config
            .num_scenarios
            .unwrap_or(model.simulation.num_scenarios);

        self.conn.declare_topology(standard_topology())?;

        let model_id = self.publish_model(model)?;
        info!(model_id = %model_id, total, seed = ?model.simulation.seed, "model published");

        let mut generator = Generator::new(model.simulation.seed);
        let mut last_stats = Instant::now();
        let progress_stride = (total / 10).max(1);

        for scenario_id in 0..total {
            let scenario = self.build_scenario(model, &mut generator, scenario_id)?;
            self.conn
                .publish(queues::SCENARIOS, &scenario, true)
                .map_err(|source| ProducerError::Publish {
                    scenario_id,
                    source,
                })?;

            if last_stats.elapsed() >= self.config.stats_interval {
                self.publish_stats(scenario_id + 1, total, started, ProducerState::Active);
                last_stats = Instant::now();
            }
            if (scenario_id + 1) % progress_stride == 0 {
                info!(
                    generated = scenario_id + 1,
                    total,
                    progress_pct = (scenario_id + 1) as f64 / total as f64 * 100.0,
                    "generation progress"
                );
            }
        }

        self.publish_stats(total, total, started, ProducerState::Completed);

        let elapsed = started.elapsed();
        info!(
            generated = total,
            elapsed_secs = elapsed.as_secs_f64(),
            rate = total as f64 / elapsed.as_secs_f64().max(1e-9),
            "producer completed"
        );
        Ok(ProducerReport {
            model_id,
            generated: total,
            elapsed,
        })
    }

    /// Replacement semantics: purge the resident model, then publish the new
    /// one. A consumer holding the old compiled model keeps it for its
    /// lifetime; only workers that start afterwards observe the new model.
    fn publish_model(&self, model: &Model) -> Result<String, ProducerError> {
        let purged = self.conn.purge(queues::MODEL)?;
        if purged > 0 {
            info!(purged, "previous model purged");
        }
        let message = ModelMessage::from_model(model, azar_model::unix_now());
        self.conn.publish(queues::MODEL, &message, true)?;
        Ok(message.model_id)
    }

    fn build_scenario(
        &self,
        model: &Model,
        generator: &mut Generator,
        scenario_id: u64,
    ) -> Result<ScenarioMessage, ProducerError> {
        let mut values = indexmap::IndexMap::with_capacity(model.variables.len());
        for var in &model.variables {
            values.insert(var.name.clone(), generator.draw(var)?);
        }
        Ok(ScenarioMessage {
            scenario_id,
            timestamp: azar_model::unix_now(),
            values,
        })
    }

    fn publish_stats(&self, generated: u64, total: u64, started: Instant, state: ProducerState) {
        let elapsed = started.elapsed().as_secs_f64();
        let rate = if elapsed > 0.0 {
            generated as f64 / elapsed
        } else {
            0.0
        };
        let remaining = total.saturating_sub(generated);
        let stats = ProducerStats {
            generated,
            total,
            progress: if total > 0 {
                generated as f64 / total as f64
            } else {
                1.0
            },
            rate,
            elapsed,
            eta: if rate > 0.0 {
                remaining as f64 / rate
            } else {
                0.0
            },
            state,
            at_unix_sec: azar_model::unix_now(),
        };
        // Telemetry is best-effort; a full stats queue must not fail the run.
        if let Err(e) = self.conn.publish(queues::PRODUCER_STATS, &stats, false) {
            debug!(error = %e, "producer stats publish failed");
        }
    }
}

//! Integration test harness for the simulation pipeline.
//!
//! Provides utilities for end-to-end testing of the full flow:
//! Parse → Publish → Dispatch → Evaluate → Aggregate → Verify.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;

use azar_broker::{queues, Broker, BrokerConfig, Connection};
use azar_consumer::{Worker, WorkerConfig, WorkerReport};
use azar_dashboard::{Aggregator, AggregatorConfig, Snapshot};
use azar_model::{parse_model_str, Model, ResultMessage};
use azar_producer::{Producer, ProducerConfig};

/// Test harness running the whole pipeline against one in-process broker.
pub struct TestHarness {
    pub broker: Arc<Broker>,
    pub conn: Arc<Connection>,
    pub model: Model,
}

impl TestHarness {
    /// Parse a model and connect to a fresh broker.
    ///
    /// # Panics
    ///
    /// Panics if the model fails to parse or the broker connection fails.
    pub async fn from_source(source: &str) -> Self {
        let broker = Broker::new();
        let conn = Arc::new(
            Connection::connect(&broker, &BrokerConfig::default())
                .await
                .expect("broker connection failed"),
        );
        let model = parse_model_str(source).expect("model parse failed");
        Self {
            broker,
            conn,
            model,
        }
    }

    /// Run the producer for this harness's model.
    pub async fn produce(&self, scenarios: Option<u64>) {
        Producer::new(
            &self.conn,
            ProducerConfig {
                num_scenarios: scenarios,
                ..ProducerConfig::default()
            },
        )
        .run(&self.model)
        .await
        .expect("producer failed");
    }

    /// Start `count` workers. They keep running until the returned fleet is
    /// stopped.
    pub fn spawn_workers(&self, count: usize) -> WorkerFleet {
        let (tx, rx) = watch::channel(false);
        let mut tasks = Vec::new();
        for i in 0..count {
            let conn = Arc::clone(&self.conn);
            let config = WorkerConfig {
                model_retry_delay: Duration::from_millis(10),
                ..WorkerConfig::default()
            };
            let shutdown = rx.clone();
            let id = format!("C-test{i}");
            tasks.push(tokio::spawn(async move {
                Worker::with_id(conn, config, id).run(shutdown).await
            }));
        }
        WorkerFleet {
            shutdown: tx,
            tasks,
        }
    }

    /// Block until `budget` scenarios are accounted for (result or DLQ).
    pub async fn wait_for(&self, budget: u64) {
        let deadline = std::time::Instant::now() + Duration::from_secs(120);
        loop {
            let results = self.broker.queue_size(queues::RESULTS).unwrap() as u64;
            let dead = self.broker.queue_size(queues::SCENARIOS_DLQ).unwrap() as u64;
            if results + dead >= budget {
                return;
            }
            assert!(
                std::time::Instant::now() < deadline,
                "workers did not finish within the deadline"
            );
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    }

    /// Run `count` workers concurrently until `budget` scenarios have been
    /// handled in total, returning their reports.
    pub async fn run_workers(&self, count: usize, budget: u64) -> Vec<WorkerReport> {
        let fleet = self.spawn_workers(count);
        self.wait_for(budget).await;
        fleet.stop().await
    }

    /// Drain every result currently on the results queue.
    pub fn drain_results(&self) -> Vec<ResultMessage> {
        let mut out = Vec::new();
        while let Some(d) = self.broker.get(queues::RESULTS, true).unwrap() {
            out.push(serde_json::from_slice(&d.payload).unwrap());
        }
        out
    }

    /// Run an aggregator over the current queues until `expected` results
    /// have been ingested, returning its final snapshot.
    pub async fn aggregate(&self, expected: u64) -> Snapshot {
        let aggregator = Aggregator::new(AggregatorConfig {
            queue_poll_interval: Duration::from_millis(50),
            ..AggregatorConfig::default()
        });
        let (tx, rx) = watch::channel(false);
        let task = {
            let aggregator = Arc::clone(&aggregator);
            let conn = Arc::clone(&self.conn);
            tokio::spawn(async move { aggregator.run(conn, rx).await })
        };

        let deadline = std::time::Instant::now() + Duration::from_secs(60);
        while aggregator.total_results() < expected {
            assert!(
                std::time::Instant::now() < deadline,
                "aggregator did not ingest {expected} results in time"
            );
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        tx.send(true).unwrap();
        task.await.unwrap().unwrap();

        aggregator.normality(true);
        aggregator.snapshot()
    }

    pub fn queue_size(&self, queue: &str) -> usize {
        self.broker.queue_size(queue).unwrap()
    }
}

/// A running group of workers sharing one shutdown signal.
pub struct WorkerFleet {
    shutdown: watch::Sender<bool>,
    tasks: Vec<tokio::task::JoinHandle<Result<WorkerReport, azar_consumer::WorkerError>>>,
}

impl WorkerFleet {
    /// Signal shutdown and collect every worker's report.
    pub async fn stop(self) -> Vec<WorkerReport> {
        let _ = self.shutdown.send(true);
        let mut reports = Vec::new();
        for task in self.tasks {
            reports.push(task.await.unwrap().expect("worker failed"));
        }
        reports
    }
}

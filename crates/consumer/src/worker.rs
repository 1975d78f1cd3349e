//! Worker lifecycle and error policy.

use std::sync::Arc;
use std::time::{Duration, Instant};

use indexmap::IndexMap;
use serde_json::json;
use thiserror::Error;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use azar_broker::{
    queues, retry_count, BrokerError, Connection, Delivery, CONSUMER_ID_HEADER,
    LAST_ERROR_HEADER, RETRY_COUNT_HEADER,
};
use azar_lang::{LangError, SafeEvaluator};
use azar_model::{FunctionSpec, ModelMessage, ResultMessage, ScenarioMessage};

use crate::counters::Counters;

/// Test-only fault hook: `(scenario_id, retry_count) -> inject failure?`.
pub type FailureProbe = Arc<dyn Fn(u64, u64) -> bool + Send + Sync>;

#[derive(Debug, Error)]
pub enum WorkerError {
    #[error("broker error: {0}")]
    Broker(#[from] BrokerError),

    #[error("no model available on 'cola_modelo' after {attempts} attempt(s)")]
    ModelUnavailable { attempts: u32 },

    #[error("model function failed to compile: {0}")]
    Compile(#[from] LangError),

    #[error("malformed model message: {0}")]
    MalformedModel(String),
}

impl WorkerError {
    /// Process exit code per the operational contract: 2 broker
    /// unreachable, 3 model unavailable or uncompilable, 4 internal.
    pub fn exit_code(&self) -> i32 {
        match self {
            WorkerError::Broker(BrokerError::Unreachable { .. }) => 2,
            WorkerError::ModelUnavailable { .. } => 3,
            WorkerError::Compile(_) => 3,
            WorkerError::MalformedModel(_) => 3,
            WorkerError::Broker(_) => 4,
        }
    }
}

#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Telemetry interval (`CONSUMER_STATS_INTERVAL`).
    pub stats_interval: Duration,
    /// Fair dispatch demands 1 (`CONSUMER_PREFETCH`).
    pub prefetch: usize,
    /// Retry budget for recoverable evaluation errors
    /// (`CONSUMER_MAX_RETRIES`).
    pub max_retries: u64,
    /// Per-evaluation wall-clock bound (`EVAL_TIMEOUT_SEC`).
    pub eval_timeout: Duration,
    /// LoadModel grace: attempts and delay while the queue is empty.
    pub model_attempts: u32,
    pub model_retry_delay: Duration,
    /// Stop after handling this many scenarios (tests and bounded runs).
    pub max_scenarios: Option<u64>,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            stats_interval: Duration::from_secs(5),
            prefetch: 1,
            max_retries: 3,
            eval_timeout: Duration::from_secs(azar_lang::DEFAULT_EVAL_TIMEOUT_SECS),
            model_attempts: 5,
            model_retry_delay: Duration::from_secs(2),
            max_scenarios: None,
        }
    }
}

impl WorkerConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        let secs = |name: &str, d: Duration| {
            std::env::var(name)
                .ok()
                .and_then(|v| v.parse::<u64>().ok())
                .map(Duration::from_secs)
                .unwrap_or(d)
        };
        Self {
            stats_interval: secs("CONSUMER_STATS_INTERVAL", defaults.stats_interval),
            prefetch: std::env::var("CONSUMER_PREFETCH")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.prefetch),
            max_retries: std::env::var("CONSUMER_MAX_RETRIES")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.max_retries),
            eval_timeout: secs("EVAL_TIMEOUT_SEC", defaults.eval_timeout),
            ..defaults
        }
    }

    /// Shutdown grace: the in-flight evaluation may run to its timeout.
    pub fn shutdown_grace(&self) -> Duration {
        self.eval_timeout + Duration::from_secs(2)
    }
}

/// Summary of a stopped worker.
#[derive(Debug, Clone)]
pub struct WorkerReport {
    pub consumer_id: String,
    pub processed: u64,
    pub dead_lettered: u64,
}

pub struct Worker {
    conn: Arc<Connection>,
    config: WorkerConfig,
    counters: Arc<Counters>,
    failure_probe: Option<FailureProbe>,
}

impl Worker {
    pub fn new(conn: Arc<Connection>, config: WorkerConfig) -> Self {
        Self::with_id(conn, config, crate::consumer_id())
    }

    pub fn with_id(conn: Arc<Connection>, config: WorkerConfig, consumer_id: String) -> Self {
        Self {
            conn,
            config,
            counters: Arc::new(Counters::new(consumer_id)),
            failure_probe: None,
        }
    }

    pub fn counters(&self) -> Arc<Counters> {
        Arc::clone(&self.counters)
    }

    /// Install a fault-injection hook (test harness only).
    pub fn set_failure_probe(&mut self, probe: FailureProbe) {
        self.failure_probe = Some(probe);
    }

    /// Run the worker until shutdown is signalled, the broker goes away, or
    /// the configured scenario budget is exhausted.
    pub async fn run(
        &self,
        mut shutdown: watch::Receiver<bool>,
    ) -> Result<WorkerReport, WorkerError> {
        let id = self.counters.consumer_id().to_string();
        info!(consumer_id = %id, "worker starting");

        let evaluator = self.load_model().await?;
        info!(
            consumer_id = %id,
            kind = if evaluator.function().is_expression() { "expresion" } else { "codigo" },
            timeout_secs = self.config.eval_timeout.as_secs(),
            "model compiled"
        );

        let mut subscription = self.conn.subscribe(queues::SCENARIOS, self.config.prefetch)?;
        self.counters.set_active();

        let stats_task = self.spawn_stats_task(shutdown.clone());

        let mut handled: u64 = 0;
        loop {
            if self.config.max_scenarios.is_some_and(|max| handled >= max) {
                break;
            }
            tokio::select! {
                delivery = subscription.recv() => {
                    match delivery {
                        Some(delivery) => {
                            self.handle_delivery(&evaluator, delivery).await?;
                            handled += 1;
                        }
                        None => {
                            warn!(consumer_id = %id, "subscription closed by broker");
                            break;
                        }
                    }
                }
                _ = shutdown.changed() => {
                    info!(consumer_id = %id, "shutdown signalled, draining");
                    break;
                }
            }
        }

        // Draining: no new deliveries; anything already buffered goes back.
        subscription.cancel();
        while let Some(delivery) = subscription.try_recv() {
            let _ = self.conn.nack(delivery.tag, true);
        }

        self.counters.set_stopped();
        self.publish_stats();
        let report = WorkerReport {
            consumer_id: id.clone(),
            processed: self.counters.processed(),
            dead_lettered: self.counters.dlq_total(),
        };
        stats_task.abort();
        info!(
            consumer_id = %id,
            processed = report.processed,
            dead_lettered = report.dead_lettered,
            "worker stopped"
        );
        Ok(report)
    }

    /// LoadModel: read the resident model with manual ack, re-publish the
    /// same bytes for sibling workers, and compile the function. The purge
    /// window during replacement can leave the queue briefly empty, so the
    /// read retries with a grace delay.
    async fn load_model(&self) -> Result<SafeEvaluator, WorkerError> {
        let attempts = self.config.model_attempts.max(1);
        for attempt in 1..=attempts {
            match self.conn.get(queues::MODEL, false)? {
                Some(delivery) => return self.compile_model(delivery),
                None if attempt < attempts => {
                    debug!(attempt, attempts, "model queue empty, retrying");
                    tokio::time::sleep(self.config.model_retry_delay).await;
                }
                None => break,
            }
        }
        Err(WorkerError::ModelUnavailable { attempts })
    }

    fn compile_model(&self, delivery: Delivery) -> Result<SafeEvaluator, WorkerError> {
        let message: ModelMessage = match serde_json::from_slice(&delivery.payload) {
            Ok(message) => message,
            Err(e) => {
                // Put the broken message back rather than destroying the
                // only copy.
                let _ = self.conn.nack(delivery.tag, true);
                return Err(WorkerError::MalformedModel(e.to_string()));
            }
        };

        self.conn.ack(delivery.tag)?;
        self.conn.publish_bytes(
            queues::MODEL,
            delivery.payload.clone(),
            delivery.headers.clone(),
            true,
        )?;

        let function = message
            .function()
            .map_err(|e| WorkerError::MalformedModel(e.to_string()))?;
        let compiled = match &function {
            FunctionSpec::Expression(src) => azar_lang::compile_expression(src)?,
            FunctionSpec::Code(src) => azar_lang::compile_code(src)?,
        };
        info!(model_id = %message.model_id, version = %message.version, "model loaded");
        Ok(SafeEvaluator::new(compiled, self.config.eval_timeout))
    }

    async fn handle_delivery(
        &self,
        evaluator: &SafeEvaluator,
        delivery: Delivery,
    ) -> Result<(), WorkerError> {
        let retries = retry_count(&delivery.headers);
        let started = Instant::now();

        let scenario: ScenarioMessage = match serde_json::from_slice(&delivery.payload) {
            Ok(scenario) => scenario,
            Err(e) => {
                // Malformed payloads follow the transient path: the retry
                // budget bounds them, then they land in the DLQ.
                self.counters.record_error("MalformedScenario");
                self.fail_delivery(&delivery, retries, "MalformedScenario", &e.to_string())?;
                return Ok(());
            }
        };
        let scenario_id = scenario.scenario_id;

        let outcome = match &self.failure_probe {
            Some(probe) if probe(scenario_id, retries) => Err(LangError::Eval {
                line: 0,
                message: "injected transient failure".to_string(),
            }),
            _ => {
                let evaluator = evaluator.clone();
                let values: IndexMap<String, f64> = scenario.values.clone();
                tokio::task::spawn_blocking(move || evaluator.evaluate(&values))
                    .await
                    .map_err(|e| LangError::Eval {
                        line: 0,
                        message: format!("evaluation task failed: {e}"),
                    })
                    .and_then(|r| r)
            }
        };

        match outcome {
            Ok(value) => {
                let exec = started.elapsed().as_secs_f64();
                let result = ResultMessage {
                    scenario_id,
                    consumer_id: self.counters.consumer_id().to_string(),
                    value,
                    exec_duration_sec: exec,
                };
                if let Err(e) = self.conn.publish(queues::RESULTS, &result, true) {
                    // Broker-side failure: give the scenario back.
                    warn!(scenario_id, error = %e, "result publish failed, requeueing");
                    self.counters.record_error("BrokerPublishError");
                    self.conn.nack(delivery.tag, true)?;
                    return Ok(());
                }
                self.conn.ack(delivery.tag)?;
                self.counters.record_success(exec);

                if retries > 0 {
                    info!(scenario_id, retries, "scenario recovered after retry");
                }
                let processed = self.counters.processed();
                if processed % 10 == 0 {
                    self.publish_stats();
                }
                if processed % 100 == 0 {
                    info!(consumer_id = %self.counters.consumer_id(), processed, "progress");
                }
            }
            Err(lang_err) => {
                let kind = lang_err.kind_name();
                self.counters.record_error(kind);
                if lang_err.is_recoverable() {
                    self.fail_delivery(&delivery, retries, kind, &lang_err.to_string())?;
                } else {
                    warn!(scenario_id, kind, error = %lang_err, "non-recoverable failure, dead-lettering");
                    self.dead_letter(&delivery, kind, &lang_err.to_string())?;
                }
            }
        }
        Ok(())
    }

    /// Transient-failure policy: republish with an incremented retry header
    /// while the budget lasts, dead-letter after.
    fn fail_delivery(
        &self,
        delivery: &Delivery,
        retries: u64,
        kind: &str,
        detail: &str,
    ) -> Result<(), WorkerError> {
        if retries < self.config.max_retries {
            let mut headers = delivery.headers.clone();
            headers.insert(RETRY_COUNT_HEADER.to_string(), json!(retries + 1));
            headers.insert(LAST_ERROR_HEADER.to_string(), json!(kind));
            headers.insert(
                CONSUMER_ID_HEADER.to_string(),
                json!(self.counters.consumer_id()),
            );
            info!(
                retry = retries + 1,
                max = self.config.max_retries,
                kind,
                "retrying scenario"
            );
            // Payload bytes are preserved verbatim; only headers change.
            self.conn.publish_bytes(
                queues::SCENARIOS,
                delivery.payload.clone(),
                headers,
                true,
            )?;
            self.conn.ack(delivery.tag)?;
            self.counters.record_retry();
        } else {
            warn!(kind, detail, retries, "retry budget exhausted, dead-lettering");
            self.dead_letter(delivery, kind, detail)?;
        }
        Ok(())
    }

    /// Dead-letter with the failure recorded in the envelope headers, then
    /// ack the original delivery.
    fn dead_letter(&self, delivery: &Delivery, kind: &str, detail: &str) -> Result<(), WorkerError> {
        debug!(kind, detail, "dead-lettering scenario");
        let mut headers = delivery.headers.clone();
        headers.insert(LAST_ERROR_HEADER.to_string(), json!(kind));
        headers.insert(
            CONSUMER_ID_HEADER.to_string(),
            json!(self.counters.consumer_id()),
        );
        self.conn.publish_bytes(
            queues::SCENARIOS_DLQ,
            delivery.payload.clone(),
            headers,
            true,
        )?;
        self.conn.ack(delivery.tag)?;
        self.counters.record_dead_letter();
        Ok(())
    }

    fn spawn_stats_task(&self, mut shutdown: watch::Receiver<bool>) -> tokio::task::JoinHandle<()> {
        let conn = Arc::clone(&self.conn);
        let counters = Arc::clone(&self.counters);
        let interval = self.config.stats_interval;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let snapshot = counters.snapshot();
                        if let Err(e) = conn.publish(queues::CONSUMER_STATS, &snapshot, false) {
                            debug!(error = %e, "consumer stats publish failed");
                        }
                    }
                    _ = shutdown.changed() => break,
                }
            }
        })
    }

    fn publish_stats(&self) {
        let snapshot = self.counters.snapshot();
        if let Err(e) = self.conn.publish(queues::CONSUMER_STATS, &snapshot, false) {
            debug!(error = %e, "consumer stats publish failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use azar_broker::{Broker, BrokerConfig};
    use azar_model::parse_model_str;
    use azar_producer::{Producer, ProducerConfig};

    const EXPR_MODEL: &str = "\
[METADATA]
nombre = suma
version = 1.0

[VARIABLES]
x, float, normal, media=0, std=1
y, float, normal, media=0, std=1

[FUNCION]
tipo = expresion
expresion = x + y

[SIMULACION]
numero_escenarios = 20
semilla_aleatoria = 42
";

    async fn setup(model_src: &str, scenarios: u64) -> (std::sync::Arc<Broker>, Arc<Connection>) {
        let broker = Broker::new();
        let conn = Arc::new(
            Connection::connect(&broker, &BrokerConfig::default())
                .await
                .unwrap(),
        );
        let model = parse_model_str(model_src).unwrap();
        Producer::new(
            &conn,
            ProducerConfig {
                num_scenarios: Some(scenarios),
                ..ProducerConfig::default()
            },
        )
        .run(&model)
        .await
        .unwrap();
        (broker, conn)
    }

    fn quick_config(max_scenarios: u64) -> WorkerConfig {
        WorkerConfig {
            model_retry_delay: Duration::from_millis(10),
            max_scenarios: Some(max_scenarios),
            ..WorkerConfig::default()
        }
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_worker_processes_all_scenarios() {
        let (broker, conn) = setup(EXPR_MODEL, 20).await;
        let (_tx, rx) = watch::channel(false);
        let worker = Worker::with_id(Arc::clone(&conn), quick_config(20), "C-test".into());
        let report = worker.run(rx).await.unwrap();

        assert_eq!(report.processed, 20);
        assert_eq!(report.dead_lettered, 0);
        assert_eq!(broker.queue_size(queues::SCENARIOS).unwrap(), 0);
        assert_eq!(broker.queue_size(queues::RESULTS).unwrap(), 20);

        // The model must still be resident for sibling workers.
        assert_eq!(broker.queue_size(queues::MODEL).unwrap(), 1);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_retry_then_succeed() {
        let (broker, conn) = setup(EXPR_MODEL, 20).await;
        let (_tx, rx) = watch::channel(false);
        let mut worker = Worker::with_id(Arc::clone(&conn), quick_config(21), "C-test".into());
        // First delivery of scenario 17 fails; the retry succeeds.
        worker.set_failure_probe(Arc::new(|scenario_id, retries| {
            scenario_id == 17 && retries == 0
        }));
        let report = worker.run(rx).await.unwrap();

        assert_eq!(report.processed, 20);
        assert_eq!(report.dead_lettered, 0);
        assert_eq!(broker.queue_size(queues::SCENARIOS_DLQ).unwrap(), 0);

        let mut results_for_17 = 0;
        while let Some(d) = broker.get(queues::RESULTS, true).unwrap() {
            let msg: ResultMessage = serde_json::from_slice(&d.payload).unwrap();
            if msg.scenario_id == 17 {
                results_for_17 += 1;
            }
        }
        assert_eq!(results_for_17, 1);

        let stats = worker.counters().snapshot();
        assert_eq!(stats.retries_total, 1);
        assert_eq!(stats.errors_by_kind["EvaluationError"], 1);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_retry_budget_exhausted_dead_letters() {
        let (broker, conn) = setup(EXPR_MODEL, 1).await;
        let (_tx, rx) = watch::channel(false);
        let mut worker = Worker::with_id(Arc::clone(&conn), quick_config(4), "C-test".into());
        worker.set_failure_probe(Arc::new(|_, _| true));
        let report = worker.run(rx).await.unwrap();

        assert_eq!(report.processed, 0);
        assert_eq!(report.dead_lettered, 1);
        assert_eq!(broker.queue_size(queues::RESULTS).unwrap(), 0);
        assert_eq!(broker.queue_size(queues::SCENARIOS_DLQ).unwrap(), 1);

        // The dead-lettered envelope carries the failure headers.
        let d = broker.get(queues::SCENARIOS_DLQ, true).unwrap().unwrap();
        assert_eq!(d.headers[RETRY_COUNT_HEADER], json!(3));
        assert_eq!(d.headers[LAST_ERROR_HEADER], json!("EvaluationError"));
        assert_eq!(d.headers[CONSUMER_ID_HEADER], json!("C-test"));

        let stats = worker.counters().snapshot();
        assert_eq!(stats.retries_total, 3);
        assert_eq!(stats.dlq_total, 1);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_timeout_dead_letters_and_worker_stays_responsive() {
        let slow_model = "\
[METADATA]
nombre = bucle
version = 1.0

[VARIABLES]
x, float, uniform, min=0, max=1

[FUNCION]
tipo = codigo
codigo =
    resultado = 0
    while True:
        resultado = resultado + 1

[SIMULACION]
numero_escenarios = 3
";
        let (broker, conn) = setup(slow_model, 3).await;
        let (_tx, rx) = watch::channel(false);
        let config = WorkerConfig {
            eval_timeout: Duration::from_millis(100),
            ..quick_config(3)
        };
        let worker = Worker::with_id(Arc::clone(&conn), config, "C-test".into());
        let report = worker.run(rx).await.unwrap();

        // Timeouts are non-recoverable: every scenario dead-letters once.
        assert_eq!(report.processed, 0);
        assert_eq!(report.dead_lettered, 3);
        assert_eq!(broker.queue_size(queues::RESULTS).unwrap(), 0);
        assert_eq!(broker.queue_size(queues::SCENARIOS_DLQ).unwrap(), 3);

        let stats = worker.counters().snapshot();
        assert_eq!(stats.errors_by_kind["TimeoutError"], 3);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_compile_failure_is_fatal_exit_3() {
        let broker = Broker::new();
        let conn = Arc::new(
            Connection::connect(&broker, &BrokerConfig::default())
                .await
                .unwrap(),
        );
        conn.declare_topology(azar_broker::standard_topology())
            .unwrap();

        // A model message whose code imports a forbidden module. The
        // producer-side parser would refuse it; a worker receiving it over
        // the wire must refuse it too.
        let message = json!({
            "modelo_id": "malicioso_1",
            "version": "1.0",
            "timestamp": 1.0,
            "metadata": {"nombre": "malicioso"},
            "variables": [],
            "funcion": {"tipo": "codigo", "codigo": "import os\nresultado = 1"},
            "simulacion": {"numero_escenarios": 1}
        });
        conn.publish(queues::MODEL, &message, true).unwrap();

        let (_tx, rx) = watch::channel(false);
        let worker = Worker::with_id(conn, quick_config(1), "C-test".into());
        let err = worker.run(rx).await.unwrap_err();
        assert!(matches!(err, WorkerError::Compile(_)));
        assert_eq!(err.exit_code(), 3);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_no_model_exit_3() {
        let broker = Broker::new();
        let conn = Arc::new(
            Connection::connect(&broker, &BrokerConfig::default())
                .await
                .unwrap(),
        );
        conn.declare_topology(azar_broker::standard_topology())
            .unwrap();

        let (_tx, rx) = watch::channel(false);
        let config = WorkerConfig {
            model_attempts: 2,
            model_retry_delay: Duration::from_millis(10),
            ..WorkerConfig::default()
        };
        let worker = Worker::with_id(conn, config, "C-test".into());
        let err = worker.run(rx).await.unwrap_err();
        assert!(matches!(err, WorkerError::ModelUnavailable { .. }));
        assert_eq!(err.exit_code(), 3);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_shutdown_stops_worker() {
        let (_broker, conn) = setup(EXPR_MODEL, 5).await;
        let (tx, rx) = watch::channel(false);
        let worker = Worker::with_id(
            Arc::clone(&conn),
            WorkerConfig {
                model_retry_delay: Duration::from_millis(10),
                ..WorkerConfig::default()
            },
            "C-test".into(),
        );

        let handle = tokio::spawn(async move { worker.run(rx).await });
        tokio::time::sleep(Duration::from_millis(300)).await;
        tx.send(true).unwrap();
        let report = tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(report.processed, 5);
    }
}

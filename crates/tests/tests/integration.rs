//! End-to-end pipeline tests: producer → broker → worker fleet →
//! aggregator, all against the in-process broker.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;

use azar_broker::{queues, retry_count};
use azar_consumer::{Worker, WorkerConfig};
use azar_model::parse_model_str;
use azar_tests::TestHarness;

const SUM_NORMAL: &str = "\
[METADATA]
nombre = sum_normal
version = 1.0
descripcion = suma de dos normales estandar
autor = equipo
fecha_creacion = 2024-05-01

[VARIABLES]
x, float, normal, media=0, std=1
y, float, normal, media=0, std=1

[FUNCION]
tipo = expresion
expresion = x + y

[SIMULACION]
numero_escenarios = 10000
semilla_aleatoria = 42
";

const DISTANCE_CODE: &str = "\
[METADATA]
nombre = distance_code
version = 1.0

[VARIABLES]
x, float, normal, media=0, std=1
y, float, normal, media=0, std=1

[FUNCION]
tipo = codigo
codigo =
    import math
    d = math.sqrt(x**2 + y**2)
    resultado = d

[SIMULACION]
numero_escenarios = 1000
semilla_aleatoria = 7
";

/// Scenario 1: sum of two standard normals, N = 10 000, seed 42.
#[tokio::test(flavor = "multi_thread")]
async fn sum_of_normals_end_to_end() {
    let harness = TestHarness::from_source(SUM_NORMAL).await;
    harness.produce(None).await;
    harness.run_workers(3, 10_000).await;

    let results = harness.drain_results();
    assert_eq!(results.len(), 10_000);
    assert_eq!(harness.queue_size(queues::SCENARIOS_DLQ), 0);

    // Scenario IDs cover [0, N) exactly once across results ∪ DLQ.
    let ids: BTreeSet<u64> = results.iter().map(|r| r.scenario_id).collect();
    assert_eq!(ids.len(), 10_000);
    assert_eq!(*ids.iter().next().unwrap(), 0);
    assert_eq!(*ids.iter().last().unwrap(), 9_999);

    let n = results.len() as f64;
    let mean = results.iter().map(|r| r.value).sum::<f64>() / n;
    let variance = results
        .iter()
        .map(|r| (r.value - mean) * (r.value - mean))
        .sum::<f64>()
        / n;
    // X + Y ~ N(0, 2): mean within ~3·sqrt(2/N), variance near 2.
    assert!(mean.abs() < 0.06, "mean {mean}");
    assert!((1.9..=2.1).contains(&variance), "variance {variance}");
}

/// Scenario 2: Euclidean distance via a `math`-only code block.
#[tokio::test(flavor = "multi_thread")]
async fn euclidean_distance_code_block() {
    let harness = TestHarness::from_source(DISTANCE_CODE).await;
    harness.produce(None).await;
    harness.run_workers(2, 1_000).await;

    let results = harness.drain_results();
    assert_eq!(results.len(), 1_000);
    assert_eq!(harness.queue_size(queues::SCENARIOS_DLQ), 0);

    assert!(results.iter().all(|r| r.value >= 0.0));
    let mean = results.iter().map(|r| r.value).sum::<f64>() / results.len() as f64;
    // E[sqrt(X² + Y²)] = sqrt(π/2) ≈ 1.2533 for standard normal X, Y.
    assert!((1.20..=1.30).contains(&mean), "mean {mean}");
}

/// Scenario 3: a transient failure on the first delivery of scenario 17 is
/// retried and succeeds; nothing dead-letters.
#[tokio::test(flavor = "multi_thread")]
async fn retry_then_succeed() {
    let harness = TestHarness::from_source(SUM_NORMAL).await;
    harness.produce(Some(50)).await;

    let (_tx, rx) = watch::channel(false);
    let mut worker = Worker::with_id(
        Arc::clone(&harness.conn),
        WorkerConfig {
            model_retry_delay: Duration::from_millis(10),
            max_scenarios: Some(51),
            ..WorkerConfig::default()
        },
        "C-flaky".into(),
    );
    worker.set_failure_probe(Arc::new(|scenario_id, retries| {
        scenario_id == 17 && retries == 0
    }));
    let report = worker.run(rx).await.unwrap();

    assert_eq!(report.processed, 50);
    assert_eq!(report.dead_lettered, 0);
    assert_eq!(harness.queue_size(queues::SCENARIOS_DLQ), 0);

    let results = harness.drain_results();
    let for_17: Vec<_> = results.iter().filter(|r| r.scenario_id == 17).collect();
    assert_eq!(for_17.len(), 1);

    let stats = worker.counters().snapshot();
    assert_eq!(stats.retries_total, 1);
    assert_eq!(stats.errors_total, 1);
}

/// Retry bound: no envelope ever carries `x-retry-count` above the budget,
/// and an always-failing scenario lands in the DLQ with the final count.
#[tokio::test(flavor = "multi_thread")]
async fn retry_bound_is_enforced() {
    let harness = TestHarness::from_source(SUM_NORMAL).await;
    harness.produce(Some(5)).await;

    let (_tx, rx) = watch::channel(false);
    let mut worker = Worker::with_id(
        Arc::clone(&harness.conn),
        WorkerConfig {
            model_retry_delay: Duration::from_millis(10),
            max_scenarios: Some(5 + 5 * 3),
            ..WorkerConfig::default()
        },
        "C-doomed".into(),
    );
    worker.set_failure_probe(Arc::new(|_, _| true));
    let report = worker.run(rx).await.unwrap();

    assert_eq!(report.processed, 0);
    assert_eq!(report.dead_lettered, 5);
    assert_eq!(harness.queue_size(queues::SCENARIOS_DLQ), 5);

    while let Some(d) = harness.broker.get(queues::SCENARIOS_DLQ, true).unwrap() {
        assert_eq!(retry_count(&d.headers), 3);
    }
}

/// Scenario 4: `while True` with a short timeout dead-letters every
/// scenario and the worker stays responsive throughout.
#[tokio::test(flavor = "multi_thread")]
async fn timeout_dead_letters_every_scenario() {
    let model = "\
[METADATA]
nombre = bucle_infinito
version = 1.0

[VARIABLES]
x, float, uniform, min=0, max=1

[FUNCION]
tipo = codigo
codigo =
    n = 0
    while True:
        n = n + 1
    resultado = n

[SIMULACION]
numero_escenarios = 4
";
    let harness = TestHarness::from_source(model).await;
    harness.produce(None).await;

    let (_tx, rx) = watch::channel(false);
    let worker = Worker::with_id(
        Arc::clone(&harness.conn),
        WorkerConfig {
            eval_timeout: Duration::from_millis(200),
            model_retry_delay: Duration::from_millis(10),
            max_scenarios: Some(4),
            ..WorkerConfig::default()
        },
        "C-slow".into(),
    );
    let report = worker.run(rx).await.unwrap();

    assert_eq!(report.processed, 0);
    assert_eq!(report.dead_lettered, 4);
    assert_eq!(harness.queue_size(queues::RESULTS), 0);
    assert_eq!(harness.queue_size(queues::SCENARIOS_DLQ), 4);
}

/// Scenario 5: malicious code is refused before anything runs, both by the
/// producer-side parser and by a worker receiving it over the wire.
#[tokio::test(flavor = "multi_thread")]
async fn security_rejection_both_sides() {
    let bad_model = DISTANCE_CODE.replace("import math", "import os");
    let err = parse_model_str(&bad_model).unwrap_err();
    assert!(err.to_string().contains("security"));

    // A forged model message reaching a worker is refused at LoadModel.
    let harness = TestHarness::from_source(DISTANCE_CODE).await;
    harness
        .conn
        .declare_topology(azar_broker::standard_topology())
        .unwrap();
    let forged = serde_json::json!({
        "modelo_id": "evil_1",
        "version": "1.0",
        "timestamp": 1.0,
        "metadata": {"nombre": "evil"},
        "variables": [],
        "funcion": {"tipo": "codigo", "codigo": "f = open(\"/etc/passwd\")\nresultado = 1"},
        "simulacion": {"numero_escenarios": 1}
    });
    harness.conn.publish(queues::MODEL, &forged, true).unwrap();

    let (_tx, rx) = watch::channel(false);
    let worker = Worker::with_id(
        Arc::clone(&harness.conn),
        WorkerConfig {
            model_retry_delay: Duration::from_millis(10),
            ..WorkerConfig::default()
        },
        "C-sec".into(),
    );
    let err = worker.run(rx).await.unwrap_err();
    assert_eq!(err.exit_code(), 3);
    // No scenario was consumed.
    assert_eq!(harness.queue_size(queues::SCENARIOS), 0);
}

/// Scenario 6: replacing the model leaves exactly one resident message with
/// the new identity, and results produced under the old model survive.
#[tokio::test(flavor = "multi_thread")]
async fn model_replacement_keeps_old_results() {
    let harness = TestHarness::from_source(SUM_NORMAL).await;
    harness.produce(Some(50)).await;
    harness.run_workers(2, 50).await;
    let first_results = harness.drain_results();
    assert_eq!(first_results.len(), 50);

    // Publish model B and 50 new scenarios on the same broker.
    let harness_b = TestHarness {
        broker: Arc::clone(&harness.broker),
        conn: Arc::clone(&harness.conn),
        model: parse_model_str(DISTANCE_CODE).unwrap(),
    };
    harness_b.produce(Some(50)).await;
    harness_b.run_workers(2, 50).await;

    assert_eq!(harness.queue_size(queues::MODEL), 1);
    let d = harness.broker.get(queues::MODEL, true).unwrap().unwrap();
    let msg: azar_model::ModelMessage = serde_json::from_slice(&d.payload).unwrap();
    assert!(msg.model_id.starts_with("distance_code_"));

    let second_results = harness_b.drain_results();
    assert_eq!(second_results.len(), 50);
    assert!(second_results.iter().all(|r| r.value >= 0.0));
}

/// Fair dispatch: homogeneous workers split the load evenly, within O(K)
/// of each other rather than O(N/K).
#[tokio::test(flavor = "multi_thread")]
async fn fair_dispatch_balances_workers() {
    let harness = TestHarness::from_source(SUM_NORMAL).await;
    // Publish the model alone so the whole fleet is subscribed with
    // prefetch 1 before the first scenario appears.
    harness.produce(Some(0)).await;
    let fleet = harness.spawn_workers(4);
    tokio::time::sleep(Duration::from_millis(300)).await;

    harness.produce(Some(200)).await;
    harness.wait_for(200).await;
    let reports = fleet.stop().await;

    let processed: Vec<u64> = reports.iter().map(|r| r.processed).collect();
    assert_eq!(processed.iter().sum::<u64>(), 200);
    let max = processed.iter().max().unwrap();
    let min = processed.iter().min().unwrap();
    // O(K) imbalance is fine; O(N/K) = 50 would mean hoarding.
    assert!(
        max - min <= 20,
        "unbalanced dispatch: max {max}, min {min} ({processed:?})"
    );
}

/// Full pipeline with the aggregator: statistics, convergence history and
/// per-worker telemetry all line up.
#[tokio::test(flavor = "multi_thread")]
async fn aggregator_end_to_end() {
    let harness = TestHarness::from_source(SUM_NORMAL).await;
    harness.produce(Some(1_000)).await;

    let (worker_tx, worker_rx) = watch::channel(false);
    let mut worker_tasks = Vec::new();
    for i in 0..2 {
        let conn = Arc::clone(&harness.conn);
        let shutdown = worker_rx.clone();
        worker_tasks.push(tokio::spawn(async move {
            Worker::with_id(
                conn,
                WorkerConfig {
                    model_retry_delay: Duration::from_millis(10),
                    ..WorkerConfig::default()
                },
                format!("C-agg{i}"),
            )
            .run(shutdown)
            .await
        }));
    }

    let snapshot = harness.aggregate(1_000).await;
    worker_tx.send(true).unwrap();
    for task in worker_tasks {
        task.await.unwrap().unwrap();
    }

    let stats = snapshot.statistics.expect("statistics over 1000 results");
    assert_eq!(stats.n, 1_000);
    assert!(stats.mean.abs() < 0.2);
    assert!((1.6..=2.4).contains(&stats.variance));
    assert!(stats.ci95_lower < stats.mean && stats.mean < stats.ci95_upper);

    // Convergence sampled every 100 results over the full stream.
    assert_eq!(snapshot.total_results, 1_000);
    assert_eq!(snapshot.convergence.len(), 10);
    assert_eq!(snapshot.convergence.last().unwrap().n, 1_000);

    // Both workers reported telemetry under their own identity.
    assert_eq!(snapshot.consumers.len(), 2);

    // The sum-of-normals distribution is accepted as normal.
    let tests = snapshot.normality.expect("normality over 1000 results");
    assert!(tests.kolmogorov_smirnov.is_normal_alpha_01);
}

/// Model round-trip: parse → wire → parse preserves the model exactly.
#[tokio::test]
async fn model_round_trip_through_wire() {
    for source in [SUM_NORMAL, DISTANCE_CODE] {
        let model = parse_model_str(source).unwrap();
        let msg = azar_model::ModelMessage::from_model(&model, 1_700_000_000.0);
        let bytes = serde_json::to_vec(&msg).unwrap();
        let back: azar_model::ModelMessage = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(back.variables, model.variables);
        assert_eq!(back.function().unwrap(), model.function);
        assert_eq!(back.simulacion, model.simulation);
    }
}

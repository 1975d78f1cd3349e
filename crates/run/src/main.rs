//! Run a complete simulation in one process.
//!
//! Wires the broker, the telemetry aggregator, a fleet of consumer workers
//! and the producer together, waits until every scenario is accounted for
//! (result or dead-letter), then exports the result distribution.
//!
//! Exit codes: 0 success, 1 model-parse/config error, 2 broker unreachable,
//! 3 model unavailable to a worker, 4 internal error.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tokio::sync::watch;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use azar_broker::{queues, Broker, BrokerConfig, ConnectionPool, PoolConfig};
use azar_consumer::{Worker, WorkerConfig};
use azar_dashboard::{Aggregator, AggregatorConfig};
use azar_producer::{Producer, ProducerConfig};

#[derive(Parser, Debug)]
#[command(name = "azar-run")]
#[command(about = "Run a Monte Carlo simulation from a declarative model file")]
struct Cli {
    /// Path to the declarative model file
    model: PathBuf,

    /// Number of consumer workers
    #[arg(long, default_value = "2")]
    consumers: usize,

    /// Override the model's scenario count
    #[arg(long)]
    scenarios: Option<u64>,

    /// Directory to write the JSON and CSV exports into
    #[arg(long)]
    export_dir: Option<PathBuf>,
}

#[tokio::main]
async fn main() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                "azar_run=info,azar_producer=info,azar_consumer=info,azar_dashboard=info,azar_broker=info"
                    .into()
            }),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();
    std::process::exit(run(cli).await);
}

async fn run(cli: Cli) -> i32 {
    info!("loading model from: {}", cli.model.display());
    let model = match azar_model::parse_model_file(&cli.model) {
        Ok(model) => model,
        Err(e) => {
            error!("model parse failed: {e}");
            return 1;
        }
    };
    let total = cli.scenarios.unwrap_or(model.simulation.num_scenarios);

    let broker = Broker::new();
    let pool = Arc::new(ConnectionPool::new(
        Arc::clone(&broker),
        BrokerConfig::from_env(),
        PoolConfig::from_env(),
    ));

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn({
        let shutdown_tx = shutdown_tx.clone();
        async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                warn!("interrupt received, shutting down");
                let _ = shutdown_tx.send(true);
            }
        }
    });

    // Aggregator first so no telemetry is missed.
    let aggregator = Aggregator::new(AggregatorConfig::default());
    let agg_conn = match pool.checkout().await {
        Ok(conn) => conn,
        Err(e) => {
            error!("broker connection failed: {e}");
            return 2;
        }
    };
    let agg_task = {
        let aggregator = Arc::clone(&aggregator);
        let conn = Arc::clone(agg_conn.connection());
        let shutdown = shutdown_rx.clone();
        tokio::spawn(async move { aggregator.run(conn, shutdown).await })
    };

    // Producer publishes the model before any worker asks for it.
    let prod_conn = match pool.checkout().await {
        Ok(conn) => conn,
        Err(e) => {
            error!("broker connection failed: {e}");
            return 2;
        }
    };
    let producer_config = ProducerConfig {
        num_scenarios: cli.scenarios,
        ..ProducerConfig::from_env()
    };
    let report = match Producer::new(&prod_conn, producer_config).run(&model).await {
        Ok(report) => report,
        Err(e) => {
            error!("producer failed: {e}");
            return e.exit_code();
        }
    };
    pool.checkin(prod_conn).await;

    // Worker fleet.
    let mut worker_tasks = Vec::new();
    let mut worker_conns = Vec::new();
    for _ in 0..cli.consumers.max(1) {
        let pooled = match pool.checkout().await {
            Ok(conn) => conn,
            Err(e) => {
                error!("broker connection failed: {e}");
                return 2;
            }
        };
        let conn = Arc::clone(pooled.connection());
        worker_conns.push(pooled);
        let worker = Worker::new(conn, WorkerConfig::from_env());
        let shutdown = shutdown_rx.clone();
        worker_tasks.push(tokio::spawn(async move { worker.run(shutdown).await }));
    }

    // Wait until every scenario is accounted for: a result reached the
    // aggregator or the envelope landed in the scenarios DLQ.
    let outcome = wait_for_completion(&broker, &aggregator, total, shutdown_rx.clone()).await;
    let _ = shutdown_tx.send(true);

    let mut exit = 0;
    for task in worker_tasks {
        match task.await {
            Ok(Ok(report)) => {
                info!(
                    consumer_id = %report.consumer_id,
                    processed = report.processed,
                    dead_lettered = report.dead_lettered,
                    "worker finished"
                );
            }
            Ok(Err(e)) => {
                error!("worker failed: {e}");
                exit = e.exit_code();
            }
            Err(e) => {
                error!("worker task panicked: {e}");
                exit = 4;
            }
        }
    }
    let _ = agg_task.await;

    if let Some(stats) = aggregator.statistics() {
        info!(
            n = stats.n,
            mean = stats.mean,
            stddev = stats.stddev,
            p95 = stats.p95,
            "result distribution"
        );
    }

    if let Some(dir) = &cli.export_dir {
        if let Err(e) = write_exports(&aggregator, dir) {
            error!("export failed: {e}");
            exit = if exit == 0 { 4 } else { exit };
        }
    }

    for conn in worker_conns {
        pool.checkin(conn).await;
    }
    pool.checkin(agg_conn).await;
    pool.close_all().await;

    if outcome == Outcome::Interrupted && exit == 0 {
        info!(model_id = %report.model_id, "interrupted before completion");
    } else if exit == 0 {
        info!(model_id = %report.model_id, generated = report.generated, "simulation complete");
    }
    exit
}

#[derive(Debug, PartialEq, Eq)]
enum Outcome {
    Completed,
    Interrupted,
}

async fn wait_for_completion(
    broker: &Arc<Broker>,
    aggregator: &Arc<Aggregator>,
    total: u64,
    mut shutdown: watch::Receiver<bool>,
) -> Outcome {
    loop {
        let dead = broker.queue_size(queues::SCENARIOS_DLQ).unwrap_or(0) as u64;
        if aggregator.total_results() + dead >= total {
            return Outcome::Completed;
        }
        tokio::select! {
            _ = tokio::time::sleep(Duration::from_millis(200)) => {}
            _ = shutdown.changed() => return Outcome::Interrupted,
        }
    }
}

fn write_exports(aggregator: &Aggregator, dir: &std::path::Path) -> std::io::Result<()> {
    std::fs::create_dir_all(dir)?;
    aggregator.normality(true);
    let snapshot = aggregator.snapshot();
    let now = chrono::Utc::now();
    let (csv_name, json_name) = azar_dashboard::export_file_names(now);

    let json_path = dir.join(json_name);
    std::fs::write(&json_path, azar_dashboard::export_json(&snapshot, now))?;
    info!("wrote {}", json_path.display());

    let csv_path = dir.join(csv_name);
    std::fs::write(&csv_path, azar_dashboard::export_csv(&snapshot, true))?;
    info!("wrote {}", csv_path.display());
    Ok(())
}

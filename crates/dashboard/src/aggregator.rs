//! Live telemetry aggregation.
//!
//! One mutex guards the whole aggregate view; message handlers update it,
//! readers and exports copy snapshots out and serialize outside the lock.
//! Result values land in bounded rings that evict oldest, so memory stays
//! flat regardless of run length; the Welford accumulator and convergence
//! history keep the authoritative full-stream view.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use indexmap::IndexMap;
use serde::Serialize;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use azar_broker::{queues, BrokerError, Connection};
use azar_model::{ConsumerStats, ModelMessage, ProducerStats, ResultMessage};

use crate::stats::{Descriptive, NormalityTests, Welford};

/// Default capacity of the scalar-result ring.
pub const DEFAULT_RESULTS_CAPACITY: usize = 50_000;
/// Default capacity of the detailed-result ring.
pub const DEFAULT_DETAIL_CAPACITY: usize = 1_000;

/// What the dashboard knows about the active model.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ModelInfo {
    pub model_id: String,
    pub version: String,
    pub name: String,
    pub description: String,
    pub num_variables: usize,
    pub function_kind: String,
    pub expression: Option<String>,
}

impl From<&ModelMessage> for ModelInfo {
    fn from(msg: &ModelMessage) -> Self {
        Self {
            model_id: msg.model_id.clone(),
            version: msg.version.clone(),
            name: msg.metadata.name.clone(),
            description: msg.metadata.description.clone(),
            num_variables: msg.variables.len(),
            function_kind: msg.funcion.kind.clone(),
            expression: msg.funcion.expression.clone(),
        }
    }
}

/// One convergence sample: running statistics after `n` results.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct ConvergencePoint {
    pub n: u64,
    #[serde(rename = "media")]
    pub mean: f64,
    #[serde(rename = "varianza")]
    pub variance: f64,
    pub at_unix_sec: f64,
}

#[derive(Debug, Clone)]
pub struct AggregatorConfig {
    pub results_capacity: usize,
    pub detail_capacity: usize,
    /// Queue-depth polling cadence.
    pub queue_poll_interval: Duration,
    /// A convergence point is sampled every this many results.
    pub convergence_stride: u64,
    pub convergence_capacity: usize,
    /// Normality tests refresh after this many new results.
    pub normality_stride: usize,
    /// Prefetch for the result subscription; results are acked after the
    /// state update, so a batch in flight is safe.
    pub results_prefetch: usize,
}

impl Default for AggregatorConfig {
    fn default() -> Self {
        Self {
            results_capacity: DEFAULT_RESULTS_CAPACITY,
            detail_capacity: DEFAULT_DETAIL_CAPACITY,
            queue_poll_interval: Duration::from_secs(2),
            convergence_stride: 100,
            convergence_capacity: 10_000,
            normality_stride: 500,
            results_prefetch: 100,
        }
    }
}

#[derive(Default)]
struct AggState {
    model_info: Option<ModelInfo>,
    producer: Option<ProducerStats>,
    consumers: IndexMap<String, ConsumerStats>,
    results: VecDeque<f64>,
    results_raw: VecDeque<ResultMessage>,
    queue_sizes: IndexMap<String, usize>,
    convergence: VecDeque<ConvergencePoint>,
    running: Welford,
    stats_cache: Option<Descriptive>,
    stats_dirty: bool,
    normality: Option<NormalityTests>,
    normality_at: u64,
}

/// A consistent copy of the aggregate state for rendering or export.
#[derive(Debug, Clone, Serialize)]
pub struct Snapshot {
    pub model_info: Option<ModelInfo>,
    pub producer: Option<ProducerStats>,
    pub consumers: IndexMap<String, ConsumerStats>,
    pub results: Vec<f64>,
    pub results_raw: Vec<ResultMessage>,
    pub queue_sizes: IndexMap<String, usize>,
    pub convergence: Vec<ConvergencePoint>,
    pub statistics: Option<Descriptive>,
    pub normality: Option<NormalityTests>,
    pub total_results: u64,
}

pub struct Aggregator {
    config: AggregatorConfig,
    state: Mutex<AggState>,
}

impl Aggregator {
    pub fn new(config: AggregatorConfig) -> Arc<Self> {
        Arc::new(Self {
            config,
            state: Mutex::new(AggState::default()),
        })
    }

    fn lock(&self) -> MutexGuard<'_, AggState> {
        self.state.lock().unwrap_or_else(|p| p.into_inner())
    }

    /// Ingest one result: rings, running statistics, convergence sampling.
    pub fn record_result(&self, result: ResultMessage) {
        let mut state = self.lock();

        push_bounded(&mut state.results, result.value, self.config.results_capacity);
        push_bounded(
            &mut state.results_raw,
            result.clone(),
            self.config.detail_capacity,
        );
        state.running.push(result.value);
        state.stats_dirty = true;

        if state.running.count() % self.config.convergence_stride == 0 {
            let point = ConvergencePoint {
                n: state.running.count(),
                mean: state.running.mean(),
                variance: state.running.variance(),
                at_unix_sec: azar_model::unix_now(),
            };
            push_bounded(
                &mut state.convergence,
                point,
                self.config.convergence_capacity,
            );
        }
    }

    /// Latest producer snapshot wins; history lives in the stats stream.
    pub fn record_producer_stats(&self, stats: ProducerStats) {
        self.lock().producer = Some(stats);
    }

    /// Overwrite keyed by worker identity.
    pub fn record_consumer_stats(&self, stats: ConsumerStats) {
        self.lock()
            .consumers
            .insert(stats.consumer_id.clone(), stats);
    }

    pub fn set_model_info(&self, info: ModelInfo) {
        info!(model_id = %info.model_id, "model info loaded");
        self.lock().model_info = Some(info);
    }

    pub fn has_model_info(&self) -> bool {
        self.lock().model_info.is_some()
    }

    pub fn set_queue_sizes(&self, sizes: IndexMap<String, usize>) {
        self.lock().queue_sizes = sizes;
    }

    pub fn total_results(&self) -> u64 {
        self.lock().running.count()
    }

    /// Descriptive statistics over the result ring, recomputed at most once
    /// per batch of updates.
    pub fn statistics(&self) -> Option<Descriptive> {
        let mut state = self.lock();
        self.refresh_statistics(&mut state);
        state.stats_cache.clone()
    }

    fn refresh_statistics(&self, state: &mut AggState) {
        if state.stats_dirty || state.stats_cache.is_none() {
            let values: Vec<f64> = state.results.iter().copied().collect();
            state.stats_cache = Descriptive::compute(&values);
            state.stats_dirty = false;
        }
    }

    /// Normality tests, recomputed lazily once enough new results arrived
    /// (or `force` for exports).
    pub fn normality(&self, force: bool) -> Option<NormalityTests> {
        let mut state = self.lock();
        let n = state.running.count();
        let due = state.normality.is_none()
            || n.saturating_sub(state.normality_at) >= self.config.normality_stride as u64;
        if force || due {
            let values: Vec<f64> = state.results.iter().copied().collect();
            state.normality = NormalityTests::compute(&values);
            state.normality_at = n;
        }
        state.normality.clone()
    }

    /// Copy a consistent snapshot out; serialization happens outside the
    /// lock.
    pub fn snapshot(&self) -> Snapshot {
        let mut state = self.lock();
        self.refresh_statistics(&mut state);
        Snapshot {
            model_info: state.model_info.clone(),
            producer: state.producer.clone(),
            consumers: state.consumers.clone(),
            results: state.results.iter().copied().collect(),
            results_raw: state.results_raw.iter().cloned().collect(),
            queue_sizes: state.queue_sizes.clone(),
            convergence: state.convergence.iter().copied().collect(),
            statistics: state.stats_cache.clone(),
            normality: state.normality.clone(),
            total_results: state.running.count(),
        }
    }

    /// Subscribe to the telemetry and result streams and keep the aggregate
    /// view fresh until shutdown.
    pub async fn run(
        self: Arc<Self>,
        conn: Arc<Connection>,
        mut shutdown: watch::Receiver<bool>,
    ) -> Result<(), BrokerError> {
        let mut results_sub = conn.subscribe(queues::RESULTS, self.config.results_prefetch)?;
        let mut producer_sub = conn.subscribe_auto_ack(queues::PRODUCER_STATS)?;
        let mut consumer_sub = conn.subscribe_auto_ack(queues::CONSUMER_STATS)?;

        let poll_task = {
            let aggregator = Arc::clone(&self);
            let conn = Arc::clone(&conn);
            let mut shutdown = shutdown.clone();
            tokio::spawn(async move {
                let mut ticker = tokio::time::interval(aggregator.config.queue_poll_interval);
                ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
                loop {
                    tokio::select! {
                        _ = ticker.tick() => {
                            aggregator.poll_queues(&conn);
                            if !aggregator.has_model_info() {
                                aggregator.fetch_model_info(&conn);
                            }
                        }
                        _ = shutdown.changed() => break,
                    }
                }
            })
        };

        loop {
            tokio::select! {
                delivery = results_sub.recv() => {
                    let Some(delivery) = delivery else { break };
                    match serde_json::from_slice::<ResultMessage>(&delivery.payload) {
                        Ok(result) => {
                            self.record_result(result);
                            conn.ack(delivery.tag)?;
                        }
                        Err(e) => {
                            warn!(error = %e, "malformed result message");
                            conn.nack(delivery.tag, false)?;
                        }
                    }
                }
                delivery = producer_sub.recv() => {
                    let Some(delivery) = delivery else { break };
                    if let Ok(stats) = serde_json::from_slice::<ProducerStats>(&delivery.payload) {
                        self.record_producer_stats(stats);
                    }
                }
                delivery = consumer_sub.recv() => {
                    let Some(delivery) = delivery else { break };
                    if let Ok(stats) = serde_json::from_slice::<ConsumerStats>(&delivery.payload) {
                        self.record_consumer_stats(stats);
                    }
                }
                _ = shutdown.changed() => break,
            }
        }

        poll_task.abort();
        info!(total_results = self.total_results(), "aggregator stopped");
        Ok(())
    }

    fn poll_queues(&self, conn: &Connection) {
        let names = [
            queues::MODEL,
            queues::SCENARIOS,
            queues::RESULTS,
            queues::SCENARIOS_DLQ,
            queues::RESULTS_DLQ,
            queues::PRODUCER_STATS,
            queues::CONSUMER_STATS,
        ];
        let mut sizes = IndexMap::new();
        for name in names {
            match conn.queue_size(name) {
                Ok(size) => {
                    sizes.insert(name.to_string(), size);
                }
                Err(e) => {
                    debug!(queue = name, error = %e, "queue size poll failed");
                }
            }
        }
        self.set_queue_sizes(sizes);
    }

    /// Read the resident model without consuming it: get with manual ack,
    /// then re-publish the same bytes.
    fn fetch_model_info(&self, conn: &Connection) {
        let delivery = match conn.get(queues::MODEL, false) {
            Ok(Some(delivery)) => delivery,
            Ok(None) => return,
            Err(e) => {
                debug!(error = %e, "model fetch failed");
                return;
            }
        };
        let parsed = serde_json::from_slice::<ModelMessage>(&delivery.payload);
        let _ = conn.ack(delivery.tag);
        let _ = conn.publish_bytes(
            queues::MODEL,
            delivery.payload.clone(),
            delivery.headers.clone(),
            true,
        );
        match parsed {
            Ok(message) => self.set_model_info(ModelInfo::from(&message)),
            Err(e) => warn!(error = %e, "malformed model message"),
        }
    }
}

fn push_bounded<T>(ring: &mut VecDeque<T>, value: T, capacity: usize) {
    if ring.len() == capacity {
        ring.pop_front();
    }
    ring.push_back(value);
}

#[cfg(test)]
mod tests {
    use super::*;

    fn result(id: u64, value: f64) -> ResultMessage {
        ResultMessage {
            scenario_id: id,
            consumer_id: "C-test".into(),
            value,
            exec_duration_sec: 0.001,
        }
    }

    fn small_aggregator() -> Arc<Aggregator> {
        Aggregator::new(AggregatorConfig {
            results_capacity: 100,
            detail_capacity: 10,
            convergence_stride: 10,
            ..AggregatorConfig::default()
        })
    }

    #[test]
    fn test_ring_eviction_keeps_most_recent() {
        let agg = small_aggregator();
        for i in 0..150 {
            agg.record_result(result(i, i as f64));
        }
        let snap = agg.snapshot();
        assert_eq!(snap.results.len(), 100);
        assert_eq!(*snap.results.last().unwrap(), 149.0);
        assert_eq!(*snap.results.first().unwrap(), 50.0);
        assert_eq!(snap.results_raw.len(), 10);
        assert_eq!(snap.results_raw.last().unwrap().scenario_id, 149);
        assert_eq!(snap.total_results, 150);
    }

    #[test]
    fn test_convergence_sampled_on_stride() {
        let agg = small_aggregator();
        for i in 0..35 {
            agg.record_result(result(i, 1.0));
        }
        let snap = agg.snapshot();
        assert_eq!(snap.convergence.len(), 3);
        assert_eq!(snap.convergence[0].n, 10);
        assert_eq!(snap.convergence[2].n, 30);
        assert!((snap.convergence[2].mean - 1.0).abs() < 1e-12);
    }

    #[test]
    fn test_statistics_cache_refreshes() {
        let agg = small_aggregator();
        for i in 1..=5 {
            agg.record_result(result(i, i as f64));
        }
        let stats = agg.statistics().unwrap();
        assert_eq!(stats.mean, 3.0);
        agg.record_result(result(6, 9.0));
        let stats = agg.statistics().unwrap();
        assert_eq!(stats.n, 6);
    }

    #[test]
    fn test_consumer_stats_overwrite_by_id() {
        let agg = small_aggregator();
        let mut stats = azar_model::ConsumerStats {
            consumer_id: "C-1".into(),
            processed: 5,
            last_exec_sec: 0.0,
            avg_exec_sec: 0.0,
            rate: 0.0,
            state: azar_model::ConsumerState::Active,
            errors_total: 0,
            retries_total: 0,
            dlq_total: 0,
            errors_by_kind: IndexMap::new(),
            at_unix_sec: 0.0,
        };
        agg.record_consumer_stats(stats.clone());
        stats.processed = 10;
        agg.record_consumer_stats(stats.clone());
        stats.consumer_id = "C-2".into();
        agg.record_consumer_stats(stats);

        let snap = agg.snapshot();
        assert_eq!(snap.consumers.len(), 2);
        assert_eq!(snap.consumers["C-1"].processed, 10);
    }

    #[test]
    fn test_normality_lazy_recompute() {
        let agg = Aggregator::new(AggregatorConfig {
            normality_stride: 50,
            ..AggregatorConfig::default()
        });
        for i in 0..30 {
            agg.record_result(result(i, (i as f64 * 0.7).sin()));
        }
        let first = agg.normality(false);
        assert!(first.is_some());
        // Not enough new data: cached value returned.
        agg.record_result(result(31, 0.5));
        let second = agg.normality(false);
        assert_eq!(first, second);
        // Forced recompute sees the new sample.
        let forced = agg.normality(true);
        assert!(forced.is_some());
    }
}

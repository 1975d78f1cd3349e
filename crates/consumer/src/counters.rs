//! Per-worker counters.
//!
//! Written from the scenario path, read by the telemetry timer. Plain
//! atomics everywhere except the error-kind map, which takes a short lock
//! only when an error is recorded or a snapshot is composed.

use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::Mutex;
use std::time::Instant;

use indexmap::IndexMap;

use azar_model::{ConsumerState, ConsumerStats};

const STATE_ACTIVE: u8 = 0;
const STATE_IDLE: u8 = 1;
const STATE_STOPPED: u8 = 2;

pub struct Counters {
    consumer_id: String,
    started: Instant,
    processed: AtomicU64,
    errors_total: AtomicU64,
    retries_total: AtomicU64,
    dlq_total: AtomicU64,
    /// Microsecond resolution keeps these in atomics.
    last_exec_us: AtomicU64,
    total_exec_us: AtomicU64,
    state: AtomicU8,
    errors_by_kind: Mutex<IndexMap<String, u64>>,
}

impl Counters {
    pub fn new(consumer_id: String) -> Self {
        Self {
            consumer_id,
            started: Instant::now(),
            processed: AtomicU64::new(0),
            errors_total: AtomicU64::new(0),
            retries_total: AtomicU64::new(0),
            dlq_total: AtomicU64::new(0),
            last_exec_us: AtomicU64::new(0),
            total_exec_us: AtomicU64::new(0),
            state: AtomicU8::new(STATE_IDLE),
            errors_by_kind: Mutex::new(IndexMap::new()),
        }
    }

    pub fn consumer_id(&self) -> &str {
        &self.consumer_id
    }

    pub fn record_success(&self, exec_secs: f64) {
        let us = (exec_secs * 1e6) as u64;
        self.processed.fetch_add(1, Ordering::Relaxed);
        self.last_exec_us.store(us, Ordering::Relaxed);
        self.total_exec_us.fetch_add(us, Ordering::Relaxed);
    }

    pub fn record_error(&self, kind: &str) {
        self.errors_total.fetch_add(1, Ordering::Relaxed);
        let mut by_kind = self.errors_by_kind.lock().unwrap_or_else(|p| p.into_inner());
        *by_kind.entry(kind.to_string()).or_insert(0) += 1;
    }

    pub fn record_retry(&self) {
        self.retries_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_dead_letter(&self) {
        self.dlq_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn set_active(&self) {
        self.state.store(STATE_ACTIVE, Ordering::Relaxed);
    }

    pub fn set_idle(&self) {
        self.state.store(STATE_IDLE, Ordering::Relaxed);
    }

    pub fn set_stopped(&self) {
        self.state.store(STATE_STOPPED, Ordering::Relaxed);
    }

    pub fn processed(&self) -> u64 {
        self.processed.load(Ordering::Relaxed)
    }

    pub fn dlq_total(&self) -> u64 {
        self.dlq_total.load(Ordering::Relaxed)
    }

    /// Compose a telemetry snapshot.
    pub fn snapshot(&self) -> ConsumerStats {
        let processed = self.processed.load(Ordering::Relaxed);
        let total_us = self.total_exec_us.load(Ordering::Relaxed);
        let elapsed = self.started.elapsed().as_secs_f64();
        let state = match self.state.load(Ordering::Relaxed) {
            STATE_ACTIVE => ConsumerState::Active,
            STATE_STOPPED => ConsumerState::Stopped,
            _ => ConsumerState::Idle,
        };
        let errors_by_kind = self
            .errors_by_kind
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .clone();
        ConsumerStats {
            consumer_id: self.consumer_id.clone(),
            processed,
            last_exec_sec: self.last_exec_us.load(Ordering::Relaxed) as f64 / 1e6,
            avg_exec_sec: if processed > 0 {
                total_us as f64 / 1e6 / processed as f64
            } else {
                0.0
            },
            rate: if elapsed > 0.0 {
                processed as f64 / elapsed
            } else {
                0.0
            },
            state,
            errors_total: self.errors_total.load(Ordering::Relaxed),
            retries_total: self.retries_total.load(Ordering::Relaxed),
            dlq_total: self.dlq_total.load(Ordering::Relaxed),
            errors_by_kind,
            at_unix_sec: azar_model::unix_now(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_snapshot_reflects_counts() {
        let counters = Counters::new("C-test".into());
        counters.set_active();
        counters.record_success(0.010);
        counters.record_success(0.020);
        counters.record_error("EvaluationError");
        counters.record_error("EvaluationError");
        counters.record_error("TimeoutError");
        counters.record_retry();
        counters.record_dead_letter();

        let snap = counters.snapshot();
        assert_eq!(snap.consumer_id, "C-test");
        assert_eq!(snap.processed, 2);
        assert!((snap.last_exec_sec - 0.020).abs() < 1e-6);
        assert!((snap.avg_exec_sec - 0.015).abs() < 1e-6);
        assert_eq!(snap.state, ConsumerState::Active);
        assert_eq!(snap.errors_total, 3);
        assert_eq!(snap.retries_total, 1);
        assert_eq!(snap.dlq_total, 1);
        assert_eq!(snap.errors_by_kind["EvaluationError"], 2);
        assert_eq!(snap.errors_by_kind["TimeoutError"], 1);
    }
}

//! Consumer worker.
//!
//! Lifecycle: `Start → LoadModel → (Ready ⇄ Evaluating) → Draining →
//! Stopped`. A worker loads and compiles the model exactly once, then pulls
//! scenarios one at a time (prefetch 1, fair dispatch), evaluates them
//! under the wall-clock timeout and publishes results. Failures follow the
//! retry/dead-letter policy; per-worker counters feed the telemetry timer,
//! which runs independently and never blocks scenario handling.

mod counters;
mod worker;

pub use counters::Counters;
pub use worker::{FailureProbe, Worker, WorkerConfig, WorkerError, WorkerReport};

/// Generate a worker identity: `C-` plus a short unique suffix.
pub fn consumer_id() -> String {
    let id = uuid::Uuid::new_v4().simple().to_string();
    format!("C-{}", &id[..8])
}

//! Dashboard aggregation and export.
//!
//! Consumes the telemetry and result streams, maintains the bounded live
//! view (rings, per-worker stats, queue depths, convergence history) and
//! renders exports. The web UI that sits on top is out of scope; this crate
//! is its data layer.

mod aggregator;
mod export;
mod stats;

pub use aggregator::{
    Aggregator, AggregatorConfig, ConvergencePoint, ModelInfo, Snapshot,
    DEFAULT_DETAIL_CAPACITY, DEFAULT_RESULTS_CAPACITY,
};
pub use export::{
    export_convergence_csv, export_csv, export_file_names, export_json, export_stats_csv,
};
pub use stats::{percentile, Descriptive, NormalityTest, NormalityTests, Welford};

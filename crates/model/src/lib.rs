//! Model definitions for Monte Carlo simulation.
//!
//! A model declares stochastic variables (each with a probability
//! distribution), a scalar function over them, and simulation parameters.
//! This crate owns the declarative file format, the wire payloads exchanged
//! over the broker, and the seeded distribution generator.

mod distributions;
mod error;
mod parser;
mod types;
mod wire;

pub use distributions::Generator;
pub use error::{ConfigError, ParseError, Section};
pub use parser::{parse_model_file, parse_model_str};
pub use types::{
    DistributionKind, FunctionSpec, Model, SimulationSpec, VariableKind, VariableSpec,
};
pub use wire::{
    ConsumerState, ConsumerStats, ModelMessage, ProducerState, ProducerStats, ResultMessage,
    ScenarioMessage,
};

/// Seconds since the Unix epoch as a float, the wire timestamp convention.
pub fn unix_now() -> f64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0)
}

//! Core model types.

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

/// Scalar kind of a stochastic variable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VariableKind {
    Int,
    Float,
}

impl VariableKind {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "int" => Some(VariableKind::Int),
            "float" => Some(VariableKind::Float),
            _ => None,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            VariableKind::Int => "int",
            VariableKind::Float => "float",
        }
    }
}

/// Supported probability distributions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DistributionKind {
    Normal,
    Uniform,
    Exponential,
    Lognormal,
    Triangular,
    Binomial,
}

impl DistributionKind {
    pub const ALL: [DistributionKind; 6] = [
        DistributionKind::Normal,
        DistributionKind::Uniform,
        DistributionKind::Exponential,
        DistributionKind::Lognormal,
        DistributionKind::Triangular,
        DistributionKind::Binomial,
    ];

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "normal" => Some(DistributionKind::Normal),
            "uniform" => Some(DistributionKind::Uniform),
            "exponential" => Some(DistributionKind::Exponential),
            "lognormal" => Some(DistributionKind::Lognormal),
            "triangular" => Some(DistributionKind::Triangular),
            "binomial" => Some(DistributionKind::Binomial),
            _ => None,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            DistributionKind::Normal => "normal",
            DistributionKind::Uniform => "uniform",
            DistributionKind::Exponential => "exponential",
            DistributionKind::Lognormal => "lognormal",
            DistributionKind::Triangular => "triangular",
            DistributionKind::Binomial => "binomial",
        }
    }
}

/// One stochastic variable of the model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VariableSpec {
    #[serde(rename = "nombre")]
    pub name: String,
    #[serde(rename = "tipo")]
    pub kind: VariableKind,
    #[serde(rename = "distribucion")]
    pub distribution: DistributionKind,
    #[serde(rename = "parametros")]
    pub params: IndexMap<String, f64>,
}

/// The model function, in one of its two forms.
#[derive(Debug, Clone, PartialEq)]
pub enum FunctionSpec {
    /// Single-line infix formula over the variable names.
    Expression(String),
    /// Restricted imperative block assigning `resultado`.
    Code(String),
}

impl FunctionSpec {
    pub fn type_label(&self) -> &'static str {
        match self {
            FunctionSpec::Expression(_) => "expresion",
            FunctionSpec::Code(_) => "codigo",
        }
    }

    pub fn source(&self) -> &str {
        match self {
            FunctionSpec::Expression(s) | FunctionSpec::Code(s) => s,
        }
    }
}

/// Simulation parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SimulationSpec {
    #[serde(rename = "numero_escenarios")]
    pub num_scenarios: u64,
    #[serde(rename = "semilla_aleatoria", skip_serializing_if = "Option::is_none")]
    pub seed: Option<u64>,
}

/// A parsed and validated model, immutable once built.
#[derive(Debug, Clone, PartialEq)]
pub struct Model {
    pub name: String,
    pub version: String,
    pub description: String,
    pub author: String,
    pub creation_date: String,
    pub variables: Vec<VariableSpec>,
    pub function: FunctionSpec,
    pub simulation: SimulationSpec,
}

impl Model {
    /// Model identity assigned at publish: `name_publishEpochSeconds`.
    pub fn model_id(&self, publish_epoch: f64) -> String {
        format!("{}_{}", self.name, publish_epoch as i64)
    }
}

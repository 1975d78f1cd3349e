//! Wire payloads exchanged over the broker.
//!
//! Model, scenario and result messages keep the original Spanish JSON keys;
//! they are the stable protocol identifiers. Telemetry payloads use plain
//! field names.

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

use crate::types::{FunctionSpec, Model, SimulationSpec, VariableSpec};
use crate::ParseError;

/// Model metadata block as published.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelMetadata {
    #[serde(rename = "nombre")]
    pub name: String,
    #[serde(rename = "descripcion", default)]
    pub description: String,
    #[serde(rename = "autor", default)]
    pub author: String,
    #[serde(rename = "fecha_creacion", default)]
    pub creation_date: String,
}

/// Function block as published: a type tag plus the matching source field.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FunctionWire {
    #[serde(rename = "tipo")]
    pub kind: String,
    #[serde(rename = "expresion", skip_serializing_if = "Option::is_none")]
    pub expression: Option<String>,
    #[serde(rename = "codigo", skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
}

/// The message resident on `cola_modelo`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelMessage {
    #[serde(rename = "modelo_id")]
    pub model_id: String,
    pub version: String,
    /// Publish time, seconds since the Unix epoch.
    pub timestamp: f64,
    pub metadata: ModelMetadata,
    pub variables: Vec<VariableSpec>,
    pub funcion: FunctionWire,
    pub simulacion: SimulationSpec,
}

impl ModelMessage {
    /// Build the publishable message for a model at the given publish time.
    pub fn from_model(model: &Model, publish_epoch: f64) -> Self {
        let (expression, code) = match &model.function {
            FunctionSpec::Expression(s) => (Some(s.clone()), None),
            FunctionSpec::Code(s) => (None, Some(s.clone())),
        };
        Self {
            model_id: model.model_id(publish_epoch),
            version: model.version.clone(),
            timestamp: publish_epoch,
            metadata: ModelMetadata {
                name: model.name.clone(),
                description: model.description.clone(),
                author: model.author.clone(),
                creation_date: model.creation_date.clone(),
            },
            variables: model.variables.clone(),
            funcion: FunctionWire {
                kind: model.function.type_label().to_string(),
                expression,
                code,
            },
            simulacion: model.simulation,
        }
    }

    /// Recover the function form, rejecting inconsistent messages.
    pub fn function(&self) -> Result<FunctionSpec, ParseError> {
        match (self.funcion.kind.as_str(), &self.funcion.expression, &self.funcion.code) {
            ("expresion", Some(expr), _) => Ok(FunctionSpec::Expression(expr.clone())),
            ("codigo", _, Some(code)) => Ok(FunctionSpec::Code(code.clone())),
            (kind, _, _) => Err(ParseError::new(
                crate::Section::Function,
                0,
                format!("inconsistent function message of type '{kind}'"),
            )),
        }
    }
}

/// One scenario on `cola_escenarios`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScenarioMessage {
    #[serde(rename = "escenario_id")]
    pub scenario_id: u64,
    /// Publish time, seconds since the Unix epoch.
    pub timestamp: f64,
    #[serde(rename = "valores")]
    pub values: IndexMap<String, f64>,
}

/// One result on `cola_resultados`. Minimal on purpose: the aggregator
/// timestamps on receipt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResultMessage {
    #[serde(rename = "escenario_id")]
    pub scenario_id: u64,
    pub consumer_id: String,
    #[serde(rename = "resultado")]
    pub value: f64,
    #[serde(rename = "tiempo_ejecucion")]
    pub exec_duration_sec: f64,
}

/// Producer lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProducerState {
    Active,
    Completed,
}

/// Producer telemetry snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProducerStats {
    pub generated: u64,
    pub total: u64,
    pub progress: f64,
    /// Scenarios per second.
    pub rate: f64,
    pub elapsed: f64,
    pub eta: f64,
    pub state: ProducerState,
    pub at_unix_sec: f64,
}

/// Consumer lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConsumerState {
    Active,
    Idle,
    Stopped,
}

/// Per-worker telemetry snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConsumerStats {
    pub consumer_id: String,
    pub processed: u64,
    pub last_exec_sec: f64,
    pub avg_exec_sec: f64,
    /// Scenarios per second over the worker's lifetime.
    pub rate: f64,
    pub state: ConsumerState,
    pub errors_total: u64,
    pub retries_total: u64,
    pub dlq_total: u64,
    pub errors_by_kind: IndexMap<String, u64>,
    pub at_unix_sec: f64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{DistributionKind, VariableKind};

    fn sample_model() -> Model {
        Model {
            name: "suma_normal".into(),
            version: "1.0".into(),
            description: "suma de dos normales".into(),
            author: "equipo".into(),
            creation_date: "2024-05-01".into(),
            variables: vec![VariableSpec {
                name: "x".into(),
                kind: VariableKind::Float,
                distribution: DistributionKind::Normal,
                params: [("media".to_string(), 0.0), ("std".to_string(), 1.0)]
                    .into_iter()
                    .collect(),
            }],
            function: FunctionSpec::Expression("x + 1".into()),
            simulation: SimulationSpec {
                num_scenarios: 100,
                seed: Some(42),
            },
        }
    }

    #[test]
    fn test_model_message_spanish_keys() {
        let msg = ModelMessage::from_model(&sample_model(), 1_700_000_000.0);
        let json = serde_json::to_value(&msg).unwrap();
        assert_eq!(json["modelo_id"], "suma_normal_1700000000");
        assert_eq!(json["metadata"]["nombre"], "suma_normal");
        assert_eq!(json["variables"][0]["distribucion"], "normal");
        assert_eq!(json["funcion"]["tipo"], "expresion");
        assert_eq!(json["funcion"]["expresion"], "x + 1");
        assert!(json["funcion"].get("codigo").is_none());
        assert_eq!(json["simulacion"]["numero_escenarios"], 100);
    }

    #[test]
    fn test_model_message_round_trip() {
        let msg = ModelMessage::from_model(&sample_model(), 1_700_000_000.0);
        let bytes = serde_json::to_vec(&msg).unwrap();
        let back: ModelMessage = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(back, msg);
        assert_eq!(
            back.function().unwrap(),
            FunctionSpec::Expression("x + 1".into())
        );
    }

    #[test]
    fn test_result_message_keys() {
        let result = ResultMessage {
            scenario_id: 17,
            consumer_id: "C-abc123".into(),
            value: 3.5,
            exec_duration_sec: 0.002,
        };
        let json = serde_json::to_value(&result).unwrap();
        assert_eq!(json["escenario_id"], 17);
        assert_eq!(json["resultado"], 3.5);
        assert_eq!(json["tiempo_ejecucion"], 0.002);
    }

    #[test]
    fn test_scenario_message_round_trip() {
        let scenario = ScenarioMessage {
            scenario_id: 3,
            timestamp: 1_700_000_123.5,
            values: [("x".to_string(), 1.5)].into_iter().collect(),
        };
        let bytes = serde_json::to_vec(&scenario).unwrap();
        let back: ScenarioMessage = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(back, scenario);
    }

    #[test]
    fn test_consumer_state_serialization() {
        assert_eq!(
            serde_json::to_value(ConsumerState::Active).unwrap(),
            serde_json::json!("active")
        );
        assert_eq!(
            serde_json::to_value(ProducerState::Completed).unwrap(),
            serde_json::json!("completed")
        );
    }
}

//! Generation parameter capabilities and precedence merge.
//!
//! Each provider declares the parameters it accepts as data (`[[providers.params]]`).
//! Values are layered provider default < model default < workflow override; a
//! value the capability list cannot accept is dropped with a warning and the lower
//! layer's value stays in effect.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Number, Value};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ParamKind {
    Float,
    Integer,
    Boolean,
    String,
}

/// One supported generation parameter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParamSpec {
    pub key: String,
    pub kind: ParamKind,
    #[serde(default)]
    pub min: Option<f64>,
    #[serde(default)]
    pub max: Option<f64>,
    /// Provider-level default.
    #[serde(default)]
    pub default: Option<Value>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct MergedParams {
    pub values: Map<String, Value>,
    pub warnings: Vec<String>,
}

/// Merge the three parameter layers against a capability list.
pub fn merge_params(
    supported: &[ParamSpec],
    model_defaults: &Map<String, Value>,
    overrides: &Map<String, Value>,
) -> MergedParams {
    let mut merged = MergedParams::default();

    for spec in supported {
        if let Some(default) = &spec.default {
            if let Some(value) = coerce(spec, default, "provider default", &mut merged.warnings) {
                merged.values.insert(spec.key.clone(), value);
            }
        }
    }

    for (layer, values) in [("model default", model_defaults), ("workflow override", overrides)] {
        for (key, raw) in values {
            let Some(spec) = supported.iter().find(|s| &s.key == key) else {
                merged
                    .warnings
                    .push(format!("Ignoring unsupported parameter '{key}' ({layer})"));
                continue;
            };
            if let Some(value) = coerce(spec, raw, layer, &mut merged.warnings) {
                merged.values.insert(key.clone(), value);
            }
        }
    }

    merged
}

fn coerce(spec: &ParamSpec, raw: &Value, layer: &str, warnings: &mut Vec<String>) -> Option<Value> {
    let key = &spec.key;
    match spec.kind {
        ParamKind::Boolean => match raw {
            Value::Bool(_) => Some(raw.clone()),
            _ => {
                warnings.push(format!("Parameter '{key}' ({layer}) must be a boolean"));
                None
            }
        },
        ParamKind::String => match raw {
            Value::String(_) => Some(raw.clone()),
            _ => {
                warnings.push(format!("Parameter '{key}' ({layer}) must be a string"));
                None
            }
        },
        ParamKind::Float => {
            let Some(number) = raw.as_f64() else {
                warnings.push(format!("Parameter '{key}' ({layer}) must be a number"));
                return None;
            };
            let clamped = clamp(spec, number, layer, warnings);
            Number::from_f64(clamped).map(Value::Number)
        }
        ParamKind::Integer => {
            let number = match raw.as_i64() {
                Some(n) => n as f64,
                None => match raw.as_f64() {
                    Some(f) if f.fract() == 0.0 => f,
                    _ => {
                        warnings.push(format!("Parameter '{key}' ({layer}) must be an integer"));
                        return None;
                    }
                },
            };
            let clamped = clamp(spec, number, layer, warnings);
            Some(Value::Number(Number::from(clamped.round() as i64)))
        }
    }
}

fn clamp(spec: &ParamSpec, value: f64, layer: &str, warnings: &mut Vec<String>) -> f64 {
    let mut clamped = value;
    if let Some(min) = spec.min {
        clamped = clamped.max(min);
    }
    if let Some(max) = spec.max {
        clamped = clamped.min(max);
    }
    if clamped != value {
        warnings.push(format!(
            "Parameter '{}' ({layer}) clamped from {value} to {clamped}",
            spec.key
        ));
    }
    clamped
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn specs() -> Vec<ParamSpec> {
        vec![
            ParamSpec {
                key: "temperature".to_string(),
                kind: ParamKind::Float,
                min: Some(0.0),
                max: Some(2.0),
                default: Some(json!(1.0)),
            },
            ParamSpec {
                key: "max_tokens".to_string(),
                kind: ParamKind::Integer,
                min: Some(1.0),
                max: Some(4096.0),
                default: None,
            },
        ]
    }

    fn map(value: Value) -> Map<String, Value> {
        value.as_object().cloned().unwrap()
    }

    #[test]
    fn test_precedence_provider_model_workflow() {
        let merged = merge_params(
            &specs(),
            &map(json!({"temperature": 0.5, "max_tokens": 1000})),
            &map(json!({"temperature": 0.2})),
        );
        assert_eq!(merged.values["temperature"], json!(0.2));
        assert_eq!(merged.values["max_tokens"], json!(1000));
        assert!(merged.warnings.is_empty());
    }

    #[test]
    fn test_provider_default_applies_without_overrides() {
        let merged = merge_params(&specs(), &Map::new(), &Map::new());
        assert_eq!(merged.values["temperature"], json!(1.0));
        assert!(!merged.values.contains_key("max_tokens"));
    }

    #[test]
    fn test_out_of_range_is_clamped_with_warning() {
        let merged = merge_params(&specs(), &Map::new(), &map(json!({"temperature": 3.5})));
        assert_eq!(merged.values["temperature"], json!(2.0));
        assert_eq!(merged.warnings.len(), 1);
    }

    #[test]
    fn test_unsupported_and_mistyped_values_are_dropped() {
        let merged = merge_params(
            &specs(),
            &map(json!({"max_tokens": 512})),
            &map(json!({"top_k": 5, "max_tokens": "lots"})),
        );
        assert_eq!(merged.values["max_tokens"], json!(512));
        assert!(!merged.values.contains_key("top_k"));
        assert_eq!(merged.warnings.len(), 2);
    }
}

//! Declarative structural edits of a JSON request body.
//!
//! Stages always run rename, default, force, drop, clamp, in that order. Each
//! mutation is recorded as a [`BodyChange`].

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Number, Value};

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BodyTransform {
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub rename: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub default: BTreeMap<String, Value>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub force: BTreeMap<String, Value>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub drop: Vec<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub clamp: BTreeMap<String, ClampRange>,
}

impl BodyTransform {
    pub fn is_empty(&self) -> bool {
        self.rename.is_empty()
            && self.default.is_empty()
            && self.force.is_empty()
            && self.drop.is_empty()
            && self.clamp.is_empty()
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct ClampRange {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum BodyChange {
    Rename { key: String, to: String },
    Default { key: String, value: Value },
    Force {
        key: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        from: Option<Value>,
        value: Value,
    },
    Drop { key: String, from: Value },
    Clamp { key: String, from: Value, to: Value },
}

#[derive(Debug, thiserror::Error)]
pub enum BodyTransformError {
    #[error("request body is not valid JSON: {0}")]
    Decode(#[source] serde_json::Error),
    #[error("failed to encode transformed body: {0}")]
    Encode(#[source] serde_json::Error),
}

#[derive(Debug, Clone, PartialEq)]
pub struct BodyTransformOutcome {
    pub body: Vec<u8>,
    pub changes: Vec<BodyChange>,
}

pub fn is_json_content_type(content_type: Option<&str>) -> bool {
    let Some(content_type) = content_type else {
        return false;
    };
    let mime = content_type
        .split(';')
        .next()
        .unwrap_or_default()
        .trim()
        .to_ascii_lowercase();
    mime == "application/json" || mime.ends_with("+json")
}

/// Applies `directive` to a raw body.
///
/// Non-JSON content types, empty bodies and JSON values that are not objects
/// pass through untouched with an empty change log.
pub fn apply_body_transform(
    content_type: Option<&str>,
    directive: &BodyTransform,
    body: &[u8],
) -> Result<BodyTransformOutcome, BodyTransformError> {
    let untouched = || BodyTransformOutcome {
        body: body.to_vec(),
        changes: Vec::new(),
    };
    if directive.is_empty() || body.is_empty() || !is_json_content_type(content_type) {
        return Ok(untouched());
    }

    let mut value: Value = serde_json::from_slice(body).map_err(BodyTransformError::Decode)?;
    let Some(object) = value.as_object_mut() else {
        return Ok(untouched());
    };
    let changes = apply_to_object(object, directive);
    if changes.is_empty() {
        return Ok(untouched());
    }
    let body = serde_json::to_vec(&value).map_err(BodyTransformError::Encode)?;
    Ok(BodyTransformOutcome { body, changes })
}

pub fn apply_to_object(object: &mut Map<String, Value>, directive: &BodyTransform) -> Vec<BodyChange> {
    let mut changes = Vec::new();

    for (from, to) in &directive.rename {
        if from == to || !object.contains_key(from) || object.contains_key(to) {
            continue;
        }
        if let Some(value) = object.remove(from) {
            object.insert(to.clone(), value);
            changes.push(BodyChange::Rename {
                key: from.clone(),
                to: to.clone(),
            });
        }
    }

    for (key, value) in &directive.default {
        if object.contains_key(key) {
            continue;
        }
        object.insert(key.clone(), value.clone());
        changes.push(BodyChange::Default {
            key: key.clone(),
            value: value.clone(),
        });
    }

    for (key, value) in &directive.force {
        let from = object.insert(key.clone(), value.clone());
        changes.push(BodyChange::Force {
            key: key.clone(),
            from,
            value: value.clone(),
        });
    }

    for key in &directive.drop {
        if let Some(from) = object.remove(key) {
            changes.push(BodyChange::Drop {
                key: key.clone(),
                from,
            });
        }
    }

    for (key, range) in &directive.clamp {
        let Some(current) = object.get_mut(key) else {
            continue;
        };
        let Value::Number(number) = current else {
            continue;
        };
        if let Some(clamped) = clamp_number(number, *range) {
            let from = std::mem::replace(current, Value::Number(clamped.clone()));
            changes.push(BodyChange::Clamp {
                key: key.clone(),
                from,
                to: Value::Number(clamped),
            });
        }
    }

    changes
}

/// Returns the clipped number, or `None` when it is already within bounds.
/// Integers stay integers when the bound they hit is integral.
fn clamp_number(number: &Number, range: ClampRange) -> Option<Number> {
    let original = number.as_f64()?;
    let mut clipped = original;
    if let Some(min) = range.min.filter(|min| clipped < *min) {
        clipped = min;
    }
    if let Some(max) = range.max.filter(|max| clipped > *max) {
        clipped = max;
    }
    if clipped == original {
        return None;
    }
    let integral = number.is_i64() || number.is_u64();
    if integral && clipped.fract() == 0.0 && clipped.abs() < i64::MAX as f64 {
        return Some(Number::from(clipped as i64));
    }
    Number::from_f64(clipped)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    const JSON: Option<&str> = Some("application/json; charset=utf-8");

    fn run(directive: BodyTransform, body: Value) -> (Value, Vec<BodyChange>) {
        let raw = serde_json::to_vec(&body).unwrap();
        let outcome = apply_body_transform(JSON, &directive, &raw).unwrap();
        (serde_json::from_slice(&outcome.body).unwrap(), outcome.changes)
    }

    #[test]
    fn rename_then_clamp_sees_the_new_key() {
        let directive = BodyTransform {
            rename: BTreeMap::from([("max_tokens".into(), "max_completion_tokens".into())]),
            clamp: BTreeMap::from([(
                "max_completion_tokens".into(),
                ClampRange {
                    min: Some(1.0),
                    max: Some(8192.0),
                },
            )]),
            ..BodyTransform::default()
        };
        let (body, changes) = run(directive, json!({"max_tokens": 50000}));
        assert_eq!(body, json!({"max_completion_tokens": 8192}));
        assert_eq!(
            changes,
            vec![
                BodyChange::Rename {
                    key: "max_tokens".into(),
                    to: "max_completion_tokens".into()
                },
                BodyChange::Clamp {
                    key: "max_completion_tokens".into(),
                    from: json!(50000),
                    to: json!(8192)
                },
            ]
        );
    }

    #[test]
    fn rename_never_overwrites_an_existing_key() {
        let directive = BodyTransform {
            rename: BTreeMap::from([("a".into(), "b".into())]),
            ..BodyTransform::default()
        };
        let (body, changes) = run(directive, json!({"a": 1, "b": 2}));
        assert_eq!(body, json!({"a": 1, "b": 2}));
        assert!(changes.is_empty());
    }

    #[test]
    fn force_overrides_a_value_default_just_set() {
        let directive = BodyTransform {
            default: BTreeMap::from([("temperature".into(), json!(0.2))]),
            force: BTreeMap::from([("temperature".into(), json!(1))]),
            ..BodyTransform::default()
        };
        let (body, changes) = run(directive, json!({}));
        assert_eq!(body, json!({"temperature": 1}));
        assert_eq!(changes.len(), 2);
        assert!(matches!(&changes[1], BodyChange::Force { from: Some(v), .. } if *v == json!(0.2)));
    }

    #[test]
    fn drop_and_default_skip_when_not_applicable() {
        let directive = BodyTransform {
            default: BTreeMap::from([("stream".into(), json!(false))]),
            drop: vec!["top_p".into(), "missing".into()],
            ..BodyTransform::default()
        };
        let (body, changes) = run(directive, json!({"stream": true, "top_p": 0.9}));
        assert_eq!(body, json!({"stream": true}));
        assert_eq!(
            changes,
            vec![BodyChange::Drop {
                key: "top_p".into(),
                from: json!(0.9)
            }]
        );
    }

    #[test]
    fn clamp_ignores_non_numeric_and_in_range_values() {
        let directive = BodyTransform {
            clamp: BTreeMap::from([
                ("a".into(), ClampRange { min: Some(0.0), max: Some(1.0) }),
                ("b".into(), ClampRange { min: Some(0.0), max: Some(1.0) }),
                ("c".into(), ClampRange { min: Some(0.5), max: None }),
            ]),
            ..BodyTransform::default()
        };
        let (body, changes) = run(directive, json!({"a": "high", "b": 0.5, "c": 0.1}));
        assert_eq!(body, json!({"a": "high", "b": 0.5, "c": 0.5}));
        assert_eq!(changes.len(), 1);
    }

    #[test]
    fn disjoint_keys_are_independent_of_stage_order() {
        let directive = BodyTransform {
            rename: BTreeMap::from([("max_tokens".into(), "max_completion_tokens".into())]),
            default: BTreeMap::from([("n".into(), json!(1))]),
            force: BTreeMap::from([("user".into(), json!("gateway"))]),
            drop: vec!["top_p".into()],
            clamp: BTreeMap::from([("temperature".into(), ClampRange { min: None, max: Some(1.0) })]),
        };
        let (body, _) = run(
            directive,
            json!({"max_tokens": 10, "top_p": 1, "temperature": 1.7}),
        );
        assert_eq!(
            body,
            json!({"max_completion_tokens": 10, "n": 1, "user": "gateway", "temperature": 1.0})
        );
    }

    #[test]
    fn non_json_bodies_pass_through() {
        let directive = BodyTransform {
            drop: vec!["x".into()],
            ..BodyTransform::default()
        };
        let outcome =
            apply_body_transform(Some("multipart/form-data; boundary=x"), &directive, b"x=1").unwrap();
        assert_eq!(outcome.body, b"x=1");
        assert!(outcome.changes.is_empty());
    }

    #[test]
    fn malformed_json_is_an_error() {
        let directive = BodyTransform {
            drop: vec!["x".into()],
            ..BodyTransform::default()
        };
        assert!(matches!(
            apply_body_transform(JSON, &directive, b"{not json"),
            Err(BodyTransformError::Decode(_))
        ));
    }

    #[test]
    fn change_log_serializes_with_op_tags() {
        let change = BodyChange::Rename {
            key: "max_tokens".into(),
            to: "max_completion_tokens".into(),
        };
        assert_eq!(
            serde_json::to_value(change).unwrap(),
            json!({"op": "rename", "key": "max_tokens", "to": "max_completion_tokens"})
        );
    }
}

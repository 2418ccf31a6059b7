//! Normalization and schema validation of labeling responses.
//!
//! Validation is a pure function of the response body and the vocabulary, so
//! a rejected payload is rejected again on every retry.

use serde_json::{Map, Value};

use super::types::{LabelResult, Uncertainty};
use crate::vocab::Vocabulary;

pub const GOAL_START: &str = "<|goal_start|>";
pub const GOAL_END: &str = "<|goal_end|>";

const REQUIRED_FIELDS: [&str; 8] = [
    "goal",
    "next_mid_step",
    "short_goal_dsl",
    "horizon_steps",
    "done_evidence",
    "fallback_if_failed",
    "uncertainty",
    "attempt",
];

/// Pseudo-field used when the body itself is unusable.
pub const BODY_FIELD: &str = "<body>";

/// One failed schema check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Violation {
    pub field: String,
    pub message: String,
}

impl Violation {
    fn new(field: &str, message: impl Into<String>) -> Self {
        Self {
            field: field.to_string(),
            message: message.into(),
        }
    }
}

impl std::fmt::Display for Violation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.field, self.message)
    }
}

/// Parse, normalize and validate a raw response body.
pub fn parse_label(raw: &str, vocab: &Vocabulary) -> Result<LabelResult, Vec<Violation>> {
    let value = parse_body(raw).ok_or_else(|| vec![Violation::new(BODY_FIELD, "not a JSON object")])?;
    let normalized = normalize(value)?;
    let violations = validate(&normalized, vocab);
    if !violations.is_empty() {
        return Err(violations);
    }
    serde_json::from_value(Value::Object(normalized))
        .map_err(|e| vec![Violation::new(BODY_FIELD, e.to_string())])
}

/// Decode the body, tolerating code fences and a JSON-encoded string.
fn parse_body(raw: &str) -> Option<Map<String, Value>> {
    let text = strip_code_fences(raw);
    let value: Value = serde_json::from_str(text)
        .ok()
        .or_else(|| extract_object(text).and_then(|s| serde_json::from_str(s).ok()))?;
    match value {
        Value::Object(map) => Some(map),
        Value::String(inner) => match serde_json::from_str::<Value>(strip_code_fences(&inner)).ok()? {
            Value::Object(map) => Some(map),
            _ => None,
        },
        _ => None,
    }
}

/// Coerce common near-misses into the canonical shape.
///
/// - a single `short_goal_dsl` object becomes a one-element list
/// - a string `done_evidence` / `fallback_if_failed` becomes a list
/// - a numeric string `horizon_steps` becomes an integer
/// - `uncertainty` is lower-cased
/// - a null `need_replan` is dropped
pub fn normalize(mut map: Map<String, Value>) -> Result<Map<String, Value>, Vec<Violation>> {
    if let Some(dsl) = map.get_mut("short_goal_dsl") {
        if dsl.is_object() {
            let single = dsl.take();
            *dsl = Value::Array(vec![single]);
        }
    }
    for field in ["done_evidence", "fallback_if_failed"] {
        if let Some(v) = map.get_mut(field) {
            if v.is_string() {
                let single = v.take();
                *v = Value::Array(vec![single]);
            }
        }
    }
    if let Some(h) = map.get_mut("horizon_steps") {
        let coerced = match &*h {
            Value::Number(n) => n
                .as_u64()
                .or_else(|| n.as_f64().filter(|f| f.fract() == 0.0 && *f >= 0.0).map(|f| f as u64)),
            Value::String(s) => s.trim().parse::<u64>().ok(),
            _ => None,
        };
        match coerced {
            Some(n) => *h = Value::from(n),
            None => {
                return Err(vec![Violation::new(
                    "horizon_steps",
                    format!("not an integer: {h}"),
                )])
            }
        }
    }
    if let Some(Value::String(u)) = map.get_mut("uncertainty") {
        *u = u.trim().to_lowercase();
    }
    if map.get("need_replan").is_some_and(Value::is_null) {
        map.remove("need_replan");
    }
    Ok(map)
}

/// Check required fields, shapes and vocabulary membership.
pub fn validate(map: &Map<String, Value>, vocab: &Vocabulary) -> Vec<Violation> {
    let mut errors = Vec::new();

    for field in REQUIRED_FIELDS {
        if !map.contains_key(field) {
            errors.push(Violation::new(field, "missing field"));
        }
    }

    match map.get("goal") {
        Some(Value::String(goal)) => {
            if !goal.contains(GOAL_START) || !goal.contains(GOAL_END) {
                errors.push(Violation::new("goal", "goal markers missing"));
            }
        }
        Some(_) => errors.push(Violation::new("goal", "must be a string")),
        None => {}
    }

    for field in ["next_mid_step", "attempt"] {
        if let Some(v) = map.get(field) {
            if !v.is_string() {
                errors.push(Violation::new(field, "must be a string"));
            }
        }
    }

    match map.get("short_goal_dsl") {
        Some(Value::Array(ops)) => {
            for entry in ops {
                match entry.get("op") {
                    Some(Value::String(op)) if vocab.knows_op(op) => {}
                    Some(Value::String(op)) => {
                        errors.push(Violation::new("short_goal_dsl", format!("unknown op: {op}")))
                    }
                    _ => errors.push(Violation::new("short_goal_dsl", "entry missing op")),
                }
            }
        }
        Some(_) => errors.push(Violation::new("short_goal_dsl", "must be a list")),
        None => {}
    }

    if let Some(h) = map.get("horizon_steps") {
        match h.as_u64() {
            Some(0) => errors.push(Violation::new("horizon_steps", "must be positive")),
            Some(n) if n > u64::from(u32::MAX) => {
                errors.push(Violation::new("horizon_steps", "out of range"))
            }
            Some(_) => {}
            None => errors.push(Violation::new("horizon_steps", "must be an integer")),
        }
    }

    check_tag_list(map, "done_evidence", |t| vocab.knows_evidence(t), &mut errors);
    check_tag_list(map, "fallback_if_failed", |t| vocab.knows_fallback(t), &mut errors);

    if let Some(u) = map.get("uncertainty") {
        if u.as_str().and_then(Uncertainty::parse).is_none() {
            errors.push(Violation::new("uncertainty", "must be low/mid/high"));
        }
    }

    match map.get("mid_step_id") {
        None | Some(Value::Null) => {}
        Some(Value::String(task)) if vocab.knows_task(task) => {}
        Some(Value::String(task)) => {
            errors.push(Violation::new("mid_step_id", format!("unknown task: {task}")))
        }
        Some(_) => errors.push(Violation::new("mid_step_id", "must be a string")),
    }

    match map.get("need_replan") {
        None | Some(Value::Null) | Some(Value::Bool(_)) => {}
        Some(_) => errors.push(Violation::new("need_replan", "must be a boolean")),
    }

    errors
}

fn check_tag_list(
    map: &Map<String, Value>,
    field: &str,
    known: impl Fn(&str) -> bool,
    errors: &mut Vec<Violation>,
) {
    match map.get(field) {
        Some(Value::Array(items)) => {
            for item in items {
                match item.as_str() {
                    Some(tag) if known(tag) => {}
                    Some(tag) => errors.push(Violation::new(field, format!("unknown value: {tag}"))),
                    None => errors.push(Violation::new(field, "entries must be strings")),
                }
            }
        }
        Some(_) => errors.push(Violation::new(field, "must be a list")),
        None => {}
    }
}

/// Strip surrounding Markdown code fences from a model response.
pub fn strip_code_fences(s: &str) -> &str {
    let trimmed = s.trim();
    let stripped = trimmed
        .strip_prefix("```json")
        .or_else(|| trimmed.strip_prefix("```"))
        .unwrap_or(trimmed);
    let stripped = stripped.strip_suffix("```").unwrap_or(stripped);
    stripped.trim()
}

/// The outermost `{...}` of a response with prose around it.
fn extract_object(s: &str) -> Option<&str> {
    let start = s.find('{')?;
    let end = s.rfind('}')?;
    (end > start).then(|| &s[start..=end])
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vocab::fixtures::test_vocab;

    fn valid_body() -> Value {
        serde_json::json!({
            "goal": "<|goal_start|>clear the room<|goal_end|>",
            "next_mid_step": "clear_room",
            "short_goal_dsl": [{"op": "MOVE_TO", "args": {"target": "door"}}, {"op": "ATTACK"}],
            "horizon_steps": 12,
            "done_evidence": ["enemy_dead"],
            "fallback_if_failed": ["retreat"],
            "uncertainty": "low",
            "attempt": "enemy near the door"
        })
    }

    #[test]
    fn test_valid_label_parses() {
        let vocab = test_vocab();
        let label = parse_label(&valid_body().to_string(), &vocab).unwrap();
        assert_eq!(label.op_signature(), vec!["MOVE_TO", "ATTACK"]);
        assert_eq!(label.horizon_steps, 12);
        assert_eq!(label.uncertainty, Uncertainty::Low);
        assert!(!label.need_replan);
    }

    #[test]
    fn test_code_fences_and_prose_tolerated() {
        let vocab = test_vocab();
        let fenced = format!("```json\n{}\n```", valid_body());
        assert!(parse_label(&fenced, &vocab).is_ok());
        let prose = format!("Here is the label: {} hope it helps", valid_body());
        assert!(parse_label(&prose, &vocab).is_ok());
    }

    #[test]
    fn test_normalization_coerces_shapes() {
        let vocab = test_vocab();
        let mut body = valid_body();
        body["short_goal_dsl"] = serde_json::json!({"op": "ATTACK"});
        body["done_evidence"] = serde_json::json!("enemy_dead");
        body["horizon_steps"] = serde_json::json!("6");
        body["uncertainty"] = serde_json::json!("HIGH");

        let label = parse_label(&body.to_string(), &vocab).unwrap();
        assert_eq!(label.short_goal_dsl.len(), 1);
        assert_eq!(label.done_evidence, vec!["enemy_dead"]);
        assert_eq!(label.horizon_steps, 6);
        assert_eq!(label.uncertainty, Uncertainty::High);
    }

    #[test]
    fn test_missing_field_reports_field() {
        let vocab = test_vocab();
        let mut body = valid_body();
        body.as_object_mut().unwrap().remove("attempt");
        let errors = parse_label(&body.to_string(), &vocab).unwrap_err();
        assert_eq!(errors[0].field, "attempt");
    }

    #[test]
    fn test_out_of_vocabulary_rejected_every_time() {
        let vocab = test_vocab();
        let mut body = valid_body();
        body["short_goal_dsl"] = serde_json::json!([{"op": "TELEPORT"}]);
        let raw = body.to_string();
        for _ in 0..3 {
            let errors = parse_label(&raw, &vocab).unwrap_err();
            assert_eq!(errors[0].field, "short_goal_dsl");
            assert!(errors[0].message.contains("TELEPORT"));
        }
    }

    #[test]
    fn test_goal_markers_required() {
        let vocab = test_vocab();
        let mut body = valid_body();
        body["goal"] = serde_json::json!("clear the room");
        let errors = parse_label(&body.to_string(), &vocab).unwrap_err();
        assert_eq!(errors[0].field, "goal");
    }

    #[test]
    fn test_zero_horizon_rejected() {
        let vocab = test_vocab();
        let mut body = valid_body();
        body["horizon_steps"] = serde_json::json!(0);
        let errors = parse_label(&body.to_string(), &vocab).unwrap_err();
        assert_eq!(errors[0].field, "horizon_steps");
    }

    #[test]
    fn test_non_json_body() {
        let vocab = test_vocab();
        let errors = parse_label("I cannot label this clip.", &vocab).unwrap_err();
        assert_eq!(errors[0].field, BODY_FIELD);
    }

    #[test]
    fn test_empty_vocabulary_accepts_any_tag() {
        let vocab = Vocabulary::default();
        let mut body = valid_body();
        body["done_evidence"] = serde_json::json!(["whatever"]);
        body["short_goal_dsl"] = serde_json::json!([{"op": "ANYTHING"}]);
        assert!(parse_label(&body.to_string(), &vocab).is_ok());
    }
}

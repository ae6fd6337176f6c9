//! Deterministic `{{param:key}}` interpolation for macro expansion.
//!
//! Parameters are applied while a macro expands, before steps enter the
//! flow engine, and use a distinct syntax so they cannot collide with
//! flow vars (`{{var}}`) or memory refs (`{{mem:key}}`).
//!
//! Exact placeholders preserve scalar type; inline placeholders
//! stringify. The `note` channel mirrors the structure with values
//! replaced by `<param:key>` so plans never leak.

use once_cell::sync::Lazy;
use regex::{Captures, Regex};
use serde_json::{Map, Value};
use thiserror::Error;

static PARAM_INLINE_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?:\{\{\s*param:([A-Za-z0-9_.-]+)\s*\}\}|\$\{\s*param:([A-Za-z0-9_.-]+)\s*\})")
        .expect("param inline regex")
});

static PARAM_EXACT_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"^\s*(?:\{\{\s*param:([A-Za-z0-9_.-]+)\s*\}\}|\$\{\s*param:([A-Za-z0-9_.-]+)\s*\})\s*$",
    )
    .expect("param exact regex")
});

#[derive(Debug, Error)]
#[error("missing macro param: {key}")]
pub struct ParamMissing {
    pub key: String,
}

pub fn params_hint(params: &Map<String, Value>, limit: usize) -> Vec<String> {
    let mut keys: Vec<String> = params.keys().cloned().collect();
    keys.sort();
    keys.truncate(limit);
    keys
}

fn capture_key(caps: &Captures<'_>) -> String {
    caps.get(1)
        .or_else(|| caps.get(2))
        .map(|m| m.as_str().trim().to_string())
        .unwrap_or_default()
}

fn scalar_to_string(value: &Value) -> String {
    match value {
        Value::Null => String::new(),
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Return `(actual, note)`.
pub fn interpolate_params_pair(
    value: &Value,
    params: &Map<String, Value>,
) -> Result<(Value, Value), ParamMissing> {
    match value {
        Value::String(s) => {
            if let Some(caps) = PARAM_EXACT_RE.captures(s) {
                let key = capture_key(&caps);
                let Some(resolved) = params.get(&key) else {
                    return Err(ParamMissing { key });
                };
                return Ok((resolved.clone(), Value::String(format!("<param:{key}>"))));
            }

            if !s.contains("{{param:") && !s.contains("${param:") {
                return Ok((value.clone(), value.clone()));
            }

            let mut missing: Option<String> = None;
            let actual = PARAM_INLINE_RE.replace_all(s, |caps: &Captures<'_>| {
                let key = capture_key(caps);
                match params.get(&key) {
                    Some(resolved) => scalar_to_string(resolved),
                    None => {
                        missing.get_or_insert(key);
                        String::new()
                    }
                }
            });
            if let Some(key) = missing {
                return Err(ParamMissing { key });
            }
            let note = PARAM_INLINE_RE.replace_all(s, |caps: &Captures<'_>| {
                format!("<param:{}>", capture_key(caps))
            });
            Ok((
                Value::String(actual.into_owned()),
                Value::String(note.into_owned()),
            ))
        }
        Value::Object(map) => {
            let mut actual = Map::new();
            let mut note = Map::new();
            for (k, v) in map {
                let (a, n) = interpolate_params_pair(v, params)?;
                actual.insert(k.clone(), a);
                note.insert(k.clone(), n);
            }
            Ok((Value::Object(actual), Value::Object(note)))
        }
        Value::Array(items) => {
            let mut actual = Vec::with_capacity(items.len());
            let mut note = Vec::with_capacity(items.len());
            for item in items {
                let (a, n) = interpolate_params_pair(item, params)?;
                actual.push(a);
                note.push(n);
            }
            Ok((Value::Array(actual), Value::Array(note)))
        }
        other => Ok((other.clone(), other.clone())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn params(value: Value) -> Map<String, Value> {
        value.as_object().cloned().unwrap_or_default()
    }

    #[test]
    fn exact_placeholder_preserves_type() {
        let p = params(json!({"count": 7, "flag": true}));
        let (actual, note) =
            interpolate_params_pair(&json!("{{param:count}}"), &p).unwrap();
        assert_eq!(actual, json!(7));
        assert_eq!(note, json!("<param:count>"));

        let (actual, _) = interpolate_params_pair(&json!("${param:flag}"), &p).unwrap();
        assert_eq!(actual, json!(true));
    }

    #[test]
    fn inline_placeholder_stringifies() {
        let p = params(json!({"user": "alice"}));
        let (actual, note) =
            interpolate_params_pair(&json!("hello {{param:user}}!"), &p).unwrap();
        assert_eq!(actual, json!("hello alice!"));
        assert_eq!(note, json!("hello <param:user>!"));
    }

    #[test]
    fn missing_param_fails_closed() {
        let p = params(json!({}));
        let err = interpolate_params_pair(&json!("{{param:user}}"), &p).unwrap_err();
        assert_eq!(err.key, "user");
    }

    #[test]
    fn nested_structures_are_walked() {
        let p = params(json!({"sel": "#go"}));
        let step = json!({"click": {"selector": "{{param:sel}}"}, "optional": true});
        let (actual, note) = interpolate_params_pair(&step, &p).unwrap();
        assert_eq!(actual["click"]["selector"], json!("#go"));
        assert_eq!(note["click"]["selector"], json!("<param:sel>"));
        assert_eq!(actual["optional"], json!(true));
    }

    #[test]
    fn hint_is_sorted_and_bounded() {
        let p = params(json!({"b": 1, "a": 2, "c": 3}));
        assert_eq!(params_hint(&p, 2), vec!["a", "b"]);
    }
}

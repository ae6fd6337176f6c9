//! Flow-var and memory-ref interpolation.
//!
//! `{{var}}`/`${var}` resolve from step exports; `{{mem:key}}`/`${mem:key}`
//! resolve from agent memory at step time. Exact placeholders preserve
//! scalar type; inline replacement stringifies. Dict keys are never
//! interpolated, and the nested step lists carried by wrapper actions
//! (`when.then/else`, `repeat.steps`) stay untouched here; each contained
//! step is interpolated when it actually executes.

use once_cell::sync::Lazy;
use regex::{Captures, Regex};
use serde_json::{Map, Value};

use memory_center::MemoryCenter;

static FLOW_VAR_INLINE_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"\{\{\s*([A-Za-z0-9_.-]+)\s*\}\}|\$\{\s*([A-Za-z0-9_.-]+)\s*\}")
        .expect("flow var inline regex")
});

static FLOW_VAR_EXACT_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^\s*(?:\{\{\s*([A-Za-z0-9_.-]+)\s*\}\}|\$\{\s*([A-Za-z0-9_.-]+)\s*\})\s*$")
        .expect("flow var exact regex")
});

static MEM_VAR_INLINE_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?:\{\{\s*mem:([A-Za-z0-9_.-]+)\s*\}\}|\$\{\s*mem:([A-Za-z0-9_.-]+)\s*\})")
        .expect("mem var inline regex")
});

static MEM_VAR_EXACT_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^\s*(?:\{\{\s*mem:([A-Za-z0-9_.-]+)\s*\}\}|\$\{\s*mem:([A-Za-z0-9_.-]+)\s*\})\s*$")
        .expect("mem var exact regex")
});

/// Arg keys that wrapper actions carry as inert nested step lists.
fn skip_keys(tool: &str) -> &'static [&'static str] {
    match tool {
        "when" => &["then", "else"],
        "repeat" => &["steps"],
        _ => &[],
    }
}

fn capture_name(caps: &Captures<'_>) -> String {
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

// ── flow vars ───────────────────────────────────────────────────────

pub fn flow_vars_hint(vars: &Map<String, Value>, limit: usize) -> Vec<String> {
    let mut keys: Vec<String> = vars.keys().cloned().collect();
    keys.sort();
    keys.truncate(limit);
    keys
}

fn interpolate_flow_value(
    value: &Value,
    vars: &Map<String, Value>,
) -> Result<Value, String> {
    match value {
        Value::String(s) => {
            // Exact-placeholder preserves scalar types (int stays int).
            if let Some(caps) = FLOW_VAR_EXACT_RE.captures(s) {
                let name = capture_name(&caps);
                return vars
                    .get(&name)
                    .cloned()
                    .ok_or(name);
            }
            // Fast path: no placeholder syntax at all.
            if !s.contains("{{") && !s.contains("${") {
                return Ok(value.clone());
            }
            let mut missing: Option<String> = None;
            let replaced = FLOW_VAR_INLINE_RE.replace_all(s, |caps: &Captures<'_>| {
                let name = capture_name(caps);
                match vars.get(&name) {
                    Some(resolved) => scalar_to_string(resolved),
                    None => {
                        missing.get_or_insert(name);
                        String::new()
                    }
                }
            });
            match missing {
                Some(name) => Err(name),
                None => Ok(Value::String(replaced.into_owned())),
            }
        }
        Value::Object(map) => {
            let mut out = Map::new();
            for (k, v) in map {
                // Keys are never interpolated.
                out.insert(k.clone(), interpolate_flow_value(v, vars)?);
            }
            Ok(Value::Object(out))
        }
        Value::Array(items) => {
            let mut out = Vec::with_capacity(items.len());
            for item in items {
                out.push(interpolate_flow_value(item, vars)?);
            }
            Ok(Value::Array(out))
        }
        other => Ok(other.clone()),
    }
}

/// Interpolate a step's args, leaving nested wrapper step lists inert.
/// `Err(name)` carries the first missing variable.
pub fn interpolate_flow_vars_step_args(
    tool: &str,
    args: &Map<String, Value>,
    vars: &Map<String, Value>,
) -> Result<Map<String, Value>, String> {
    let skip = skip_keys(tool);
    let mut out = Map::new();
    for (k, v) in args {
        if skip.contains(&k.as_str()) {
            out.insert(k.clone(), v.clone());
            continue;
        }
        out.insert(k.clone(), interpolate_flow_value(v, vars)?);
    }
    Ok(out)
}

// ── memory refs ─────────────────────────────────────────────────────

fn mem_lookup(memory: &MemoryCenter, key: &str) -> Result<Value, String> {
    let key = key.trim();
    if key.is_empty() {
        return Err(String::new());
    }
    memory
        .get(key)
        .map(|entry| entry.value)
        .ok_or_else(|| key.to_string())
}

fn interpolate_mem_value(
    value: &Value,
    memory: &MemoryCenter,
) -> Result<(Value, Value), String> {
    match value {
        Value::String(s) => {
            if let Some(caps) = MEM_VAR_EXACT_RE.captures(s) {
                let key = capture_name(&caps);
                let resolved = mem_lookup(memory, &key)?;
                return Ok((resolved, Value::String(format!("<mem:{key}>"))));
            }
            if !s.contains("{{mem:") && !s.contains("${mem:") {
                return Ok((value.clone(), value.clone()));
            }
            let mut missing: Option<String> = None;
            let actual = MEM_VAR_INLINE_RE.replace_all(s, |caps: &Captures<'_>| {
                let key = capture_name(caps);
                match mem_lookup(memory, &key) {
                    Ok(resolved) => scalar_to_string(&resolved),
                    Err(key) => {
                        missing.get_or_insert(key);
                        String::new()
                    }
                }
            });
            if let Some(key) = missing {
                return Err(key);
            }
            // Note channel keeps the key for debuggability, never the value.
            let note = MEM_VAR_INLINE_RE.replace_all(s, |caps: &Captures<'_>| {
                format!("<mem:{}>", capture_name(caps))
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
                let (a, n) = interpolate_mem_value(v, memory)?;
                actual.insert(k.clone(), a);
                note.insert(k.clone(), n);
            }
            Ok((Value::Object(actual), Value::Object(note)))
        }
        Value::Array(items) => {
            let mut actual = Vec::with_capacity(items.len());
            let mut note = Vec::with_capacity(items.len());
            for item in items {
                let (a, n) = interpolate_mem_value(item, memory)?;
                actual.push(a);
                note.push(n);
            }
            Ok((Value::Array(actual), Value::Array(note)))
        }
        other => Ok((other.clone(), other.clone())),
    }
}

/// Resolve memory refs in a step's args, producing `(actual, note)`.
/// `Err(key)` carries the first missing memory key.
pub fn interpolate_mem_vars_step_args(
    tool: &str,
    args: &Map<String, Value>,
    memory: &MemoryCenter,
) -> Result<(Map<String, Value>, Map<String, Value>), String> {
    let skip = skip_keys(tool);
    let mut actual = Map::new();
    let mut note = Map::new();
    for (k, v) in args {
        if skip.contains(&k.as_str()) {
            actual.insert(k.clone(), v.clone());
            note.insert(k.clone(), v.clone());
            continue;
        }
        let (a, n) = interpolate_mem_value(v, memory)?;
        actual.insert(k.clone(), a);
        note.insert(k.clone(), n);
    }
    Ok((actual, note))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn vars(value: Value) -> Map<String, Value> {
        value.as_object().cloned().unwrap_or_default()
    }

    #[test]
    fn exact_placeholder_preserves_scalar_type() {
        let v = vars(json!({"cursor": 123, "flag": false}));
        let args = json!({"timeout": "{{cursor}}", "check": "${flag}"})
            .as_object()
            .cloned()
            .unwrap();
        let out = interpolate_flow_vars_step_args("wait", &args, &v).unwrap();
        assert_eq!(out["timeout"], json!(123));
        assert_eq!(out["check"], json!(false));
    }

    #[test]
    fn inline_replacement_stringifies() {
        let v = vars(json!({"artId": "art_abc"}));
        let args = json!({"url": "https://example.test/{{artId}}"})
            .as_object()
            .cloned()
            .unwrap();
        let out = interpolate_flow_vars_step_args("navigate", &args, &v).unwrap();
        assert_eq!(out["url"], json!("https://example.test/art_abc"));
    }

    #[test]
    fn missing_var_fails_with_its_name() {
        let args = json!({"url": "{{nope}}"}).as_object().cloned().unwrap();
        let err = interpolate_flow_vars_step_args("navigate", &args, &Map::new()).unwrap_err();
        assert_eq!(err, "nope");
    }

    #[test]
    fn nested_wrapper_step_lists_stay_inert() {
        let v = vars(json!({"x": 1}));
        let args = json!({
            "max_iters": 3,
            "until": {"js": "{{x}} > 0"},
            "steps": [{"click": {"selector": "{{x}}"}}],
        })
        .as_object()
        .cloned()
        .unwrap();
        let out = interpolate_flow_vars_step_args("repeat", &args, &v).unwrap();
        // until is interpolated, steps are not.
        assert_eq!(out["until"]["js"], json!("1 > 0"));
        assert_eq!(out["steps"][0]["click"]["selector"], json!("{{x}}"));
    }

    #[test]
    fn keys_are_never_interpolated() {
        let v = vars(json!({"k": "resolved"}));
        let args = json!({"fill": {"{{k}}": "{{k}}"}}).as_object().cloned().unwrap();
        let out = interpolate_flow_vars_step_args("form", &args, &v).unwrap();
        let fill = out["fill"].as_object().unwrap();
        assert!(fill.contains_key("{{k}}"));
        assert_eq!(fill["{{k}}"], json!("resolved"));
    }

    #[test]
    fn mem_refs_resolve_with_notes() {
        let memory = MemoryCenter::new();
        memory.set("api_token", json!("sk-secret"), 0, 0).unwrap();
        let args = json!({"text": "{{mem:api_token}}", "selector": "#f"})
            .as_object()
            .cloned()
            .unwrap();
        let (actual, note) = interpolate_mem_vars_step_args("type", &args, &memory).unwrap();
        assert_eq!(actual["text"], json!("sk-secret"));
        assert_eq!(note["text"], json!("<mem:api_token>"));
        assert_eq!(note["selector"], json!("#f"));
    }

    #[test]
    fn missing_mem_key_fails_with_the_key() {
        let memory = MemoryCenter::new();
        let args = json!({"text": "{{mem:absent}}"}).as_object().cloned().unwrap();
        let err = interpolate_mem_vars_step_args("type", &args, &memory).unwrap_err();
        assert_eq!(err, "absent");
    }

    #[test]
    fn mem_exact_placeholder_preserves_type() {
        let memory = MemoryCenter::new();
        memory.set("limit", json!(42), 0, 0).unwrap();
        let args = json!({"limit": "{{mem:limit}}"}).as_object().cloned().unwrap();
        let (actual, note) = interpolate_mem_vars_step_args("page", &args, &memory).unwrap();
        assert_eq!(actual["limit"], json!(42));
        assert_eq!(note["limit"], json!("<mem:limit>"));
    }
}

//! Runbook sanitation.
//!
//! Runbooks are JSON step arrays stored in agent memory and replayed
//! later. Recording must never capture secrets, but placeholder-based
//! workflows (`{{mem:...}}` / `{{param:...}}` / `{{var}}`) have to stay
//! intact or the runbook stops being replayable.

use serde_json::{Map, Value};

use crate::redact::{
    is_placeholder_value, redact_url, redacted_summary, SENSITIVE_KEYS,
};
use memory_center::is_sensitive_key;

const META_KEYS: &[&str] = &["label", "optional", "export", "download", "irreversible", "auto_tab"];

/// Sanitize a step list for recording. Returns the sanitized steps and
/// how many literals were redacted.
pub fn sanitize_runbook_steps(steps: &[Value]) -> (Vec<Value>, usize) {
    let mut out = Vec::with_capacity(steps.len());
    let mut redacted = 0;
    for step in steps {
        if let Value::Object(map) = step {
            let (sanitized, n) = sanitize_step(map);
            redacted += n;
            out.push(Value::Object(sanitized));
        }
    }
    (out, redacted)
}

/// True when sanitization would redact anything.
pub fn has_sensitive_literals(steps: &[Value]) -> bool {
    sanitize_runbook_steps(steps).1 > 0
}

/// Bounded, sanitized preview for list/inspect surfaces.
pub fn preview_runbook_steps(steps: &[Value], limit: usize) -> Value {
    let (sanitized, redacted) = sanitize_runbook_steps(steps);
    let limit = limit.min(20);
    let preview: Vec<Value> = sanitized.into_iter().take(limit).collect();
    let mut out = serde_json::json!({
        "steps_total": steps.len(),
        "steps_preview": preview,
    });
    if redacted > 0 {
        out["redacted"] = serde_json::json!(redacted);
    }
    out
}

fn sanitize_step(step: &Map<String, Value>) -> (Map<String, Value>, usize) {
    let mut out = step.clone();
    let mut redacted = 0;

    // Explicit form: {tool: "...", args: {...}}.
    if let Some(tool) = step.get("tool").and_then(Value::as_str).map(str::to_string) {
        if let Some(Value::Object(args)) = step.get("args") {
            let (sanitized, n) = sanitize_any_map(args, &tool);
            out.insert("args".into(), Value::Object(sanitized));
            redacted += n;
        }
        return (out, redacted);
    }

    // Shorthand: the single non-meta object key is the tool.
    for (key, value) in step {
        if META_KEYS.contains(&key.as_str()) {
            continue;
        }
        if let Value::Object(args) = value {
            let (sanitized, n) = sanitize_any_map(args, key);
            out.insert(key.clone(), Value::Object(sanitized));
            redacted += n;
            break;
        }
    }
    (out, redacted)
}

fn sanitize_any_map(map: &Map<String, Value>, tool: &str) -> (Map<String, Value>, usize) {
    // browser(action=memory, memory_action=set, key=<sensitive>) embeds the
    // secret under "value"; catch it at the container level.
    let sensitive_memory_set = tool == "browser"
        && map.get("action").and_then(Value::as_str) == Some("memory")
        && map.get("memory_action").and_then(Value::as_str) == Some("set")
        && map
            .get("key")
            .and_then(Value::as_str)
            .map(is_sensitive_key)
            .unwrap_or(false);

    let mut out = Map::new();
    let mut redacted = 0;
    for (key, value) in map {
        if sensitive_memory_set && key.eq_ignore_ascii_case("value") {
            if is_placeholder_value(value.as_str().unwrap_or_default()) {
                out.insert(key.clone(), value.clone());
            } else {
                out.insert(key.clone(), redacted_summary(value));
                redacted += 1;
            }
            continue;
        }
        let (sanitized, n) = sanitize_any(value, tool, Some(key));
        out.insert(key.clone(), sanitized);
        redacted += n;
    }
    (out, redacted)
}

fn sanitize_any(value: &Value, tool: &str, key: Option<&str>) -> (Value, usize) {
    let lk = key.map(str::to_ascii_lowercase).unwrap_or_default();

    match value {
        Value::Object(map) => {
            // Container-shaped masks.
            match (tool, lk.as_str()) {
                ("fetch" | "http", "headers") => {
                    let mut out = Map::new();
                    let mut redacted = 0;
                    for (k, v) in map {
                        let hk = k.to_ascii_lowercase();
                        let sensitive = SENSITIVE_KEYS.contains(&hk.as_str())
                            || hk.starts_with("authorization")
                            || hk.starts_with("cookie");
                        if sensitive && !is_placeholder_value(v.as_str().unwrap_or_default()) {
                            out.insert(k.clone(), redacted_summary(v));
                            redacted += 1;
                        } else {
                            out.insert(k.clone(), v.clone());
                        }
                    }
                    (Value::Object(out), redacted)
                }
                ("form", "fill") => {
                    let mut out = Map::new();
                    let mut redacted = 0;
                    for (k, v) in map {
                        if is_placeholder_value(v.as_str().unwrap_or_default()) {
                            out.insert(k.clone(), v.clone());
                        } else {
                            out.insert(k.clone(), redacted_summary(v));
                            redacted += 1;
                        }
                    }
                    (Value::Object(out), redacted)
                }
                ("storage", "items") => {
                    let mut out = Map::new();
                    let mut redacted = 0;
                    for (k, v) in map {
                        if is_placeholder_value(v.as_str().unwrap_or_default()) {
                            out.insert(k.clone(), v.clone());
                        } else {
                            out.insert(k.clone(), redacted_summary(v));
                            redacted += 1;
                        }
                    }
                    (Value::Object(out), redacted)
                }
                _ => {
                    let (out, n) = sanitize_any_map(map, tool);
                    (Value::Object(out), n)
                }
            }
        }
        Value::Array(items) => {
            let mut out = Vec::with_capacity(items.len());
            let mut redacted = 0;
            for item in items {
                let (sanitized, n) = sanitize_any(item, tool, key);
                out.push(sanitized);
                redacted += n;
            }
            (Value::Array(out), redacted)
        }
        Value::String(s) if lk == "url" => {
            let red = redact_url(s);
            if red != *s {
                (Value::String(red), 1)
            } else {
                (value.clone(), 0)
            }
        }
        Value::String(s) if is_placeholder_value(s) => (value.clone(), 0),
        other => {
            let masked = match (tool, lk.as_str()) {
                ("type", "text") => true,
                ("fetch" | "http", "body") => true,
                ("cookies", "value" | "cookies") => true,
                ("totp", "secret") => true,
                ("storage", "value") => true,
                _ => SENSITIVE_KEYS.contains(&lk.as_str()),
            };
            if masked {
                (redacted_summary(other), 1)
            } else {
                (other.clone(), 0)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn type_text_literal_is_redacted() {
        let steps = vec![json!({"type": {"selector": "#pwd", "text": "hunter2"}})];
        let (sanitized, redacted) = sanitize_runbook_steps(&steps);
        assert_eq!(redacted, 1);
        assert_eq!(
            sanitized[0]["type"]["text"],
            json!("<redacted str len=7>")
        );
        assert!(has_sensitive_literals(&steps));
    }

    #[test]
    fn placeholders_survive_verbatim() {
        let steps = vec![
            json!({"type": {"selector": "#pwd", "text": "{{mem:password}}"}}),
            json!({"navigate": {"url": "https://a.test/{{artId}}"}}),
            json!({"form": {"fill": {"user": "${param:user}"}, "submit": true}}),
        ];
        let (sanitized, redacted) = sanitize_runbook_steps(&steps);
        assert_eq!(redacted, 0);
        assert_eq!(sanitized[0]["type"]["text"], json!("{{mem:password}}"));
        assert_eq!(sanitized[1]["navigate"]["url"], json!("https://a.test/{{artId}}"));
        assert_eq!(sanitized[2]["form"]["fill"]["user"], json!("${param:user}"));
        assert!(!has_sensitive_literals(&steps));
    }

    #[test]
    fn explicit_step_form_is_sanitized_too() {
        let steps = vec![json!({"tool": "http", "args": {"url": "https://a.test/", "body": "pw=1", "headers": {"Cookie": "sid=1"}}})];
        let (sanitized, redacted) = sanitize_runbook_steps(&steps);
        assert!(redacted >= 2);
        assert!(sanitized[0]["args"]["body"].as_str().unwrap().starts_with("<redacted"));
        assert!(sanitized[0]["args"]["headers"]["Cookie"]
            .as_str()
            .unwrap()
            .starts_with("<redacted"));
    }

    #[test]
    fn sensitive_memory_set_value_is_masked() {
        let steps = vec![json!({"browser": {
            "action": "memory", "memory_action": "set", "key": "api_token", "value": "sk-123"
        }})];
        let (sanitized, redacted) = sanitize_runbook_steps(&steps);
        assert_eq!(redacted, 1);
        assert!(sanitized[0]["browser"]["value"]
            .as_str()
            .unwrap()
            .starts_with("<redacted"));
        // Non-sensitive key keeps its value.
        let steps = vec![json!({"browser": {
            "action": "memory", "memory_action": "set", "key": "notes", "value": "hello"
        }})];
        let (sanitized, redacted) = sanitize_runbook_steps(&steps);
        assert_eq!(redacted, 0);
        assert_eq!(sanitized[0]["browser"]["value"], json!("hello"));
    }

    #[test]
    fn url_values_go_through_url_redaction() {
        let steps = vec![json!({"navigate": {"url": "https://a.test/?token=abc&q=hi"}})];
        let (sanitized, redacted) = sanitize_runbook_steps(&steps);
        assert_eq!(redacted, 1);
        let url = sanitized[0]["navigate"]["url"].as_str().unwrap();
        assert!(url.contains("q=hi"));
        assert!(!url.contains("abc"));
    }

    #[test]
    fn preview_is_bounded() {
        let steps: Vec<Value> = (0..30).map(|i| json!({"wait": {"timeout": i}})).collect();
        let preview = preview_runbook_steps(&steps, 5);
        assert_eq!(preview["steps_total"], json!(30));
        assert_eq!(preview["steps_preview"].as_array().unwrap().len(), 5);
    }
}

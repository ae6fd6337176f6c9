//! Step shapes: normalization of the two accepted forms and the common
//! meta keys, plus dotted-path scalar extraction for exports.

use serde_json::{Map, Value};

pub const META_KEYS: &[&str] = &["label", "optional", "export", "download", "irreversible", "auto_tab"];

/// Internal actions handled by the engine rather than dispatched.
pub const INTERNAL_ACTIONS: &[&str] = &["assert", "when", "repeat", "macro"];

/// Step meta shared by both forms.
#[derive(Clone, Debug, Default)]
pub struct StepMeta {
    pub label: Option<String>,
    pub optional: bool,
    pub export: Option<Map<String, Value>>,
    pub download: Option<Value>,
    pub irreversible: bool,
    pub auto_tab: Option<bool>,
}

impl StepMeta {
    fn from_map(step: &Map<String, Value>) -> Option<Self> {
        let mut meta = StepMeta::default();
        let mut any = false;
        if let Some(label) = step.get("label") {
            meta.label = label.as_str().map(str::to_string);
            any = true;
        }
        if let Some(optional) = step.get("optional") {
            meta.optional = optional.as_bool().unwrap_or(false);
            any = true;
        }
        if let Some(Value::Object(export)) = step.get("export") {
            meta.export = Some(export.clone());
            any = true;
        }
        if let Some(download) = step.get("download") {
            meta.download = Some(download.clone());
            any = true;
        }
        if let Some(irreversible) = step.get("irreversible") {
            meta.irreversible = irreversible.as_bool().unwrap_or(false);
            any = true;
        }
        if let Some(auto_tab) = step.get("auto_tab") {
            meta.auto_tab = auto_tab.as_bool();
            any = true;
        }
        any.then_some(meta)
    }
}

/// Support both `{tool, args, ...meta}` and `{toolName: args, ...meta}`.
/// Returns `(tool, args, meta)`; `None` tool means the shape is invalid.
pub fn normalize_step(step: &Value) -> (Option<String>, Map<String, Value>, Option<StepMeta>) {
    let Value::Object(step) = step else {
        return (None, Map::new(), None);
    };

    if let Some(tool) = step.get("tool").and_then(Value::as_str) {
        let args = step
            .get("args")
            .and_then(Value::as_object)
            .cloned()
            .unwrap_or_default();
        return (
            Some(tool.to_string()),
            args,
            StepMeta::from_map(step).or(Some(StepMeta::default())),
        );
    }

    // Shorthand: exactly one non-meta key naming the tool.
    let tool_keys: Vec<&String> = step
        .keys()
        .filter(|key| !META_KEYS.contains(&key.as_str()))
        .collect();
    if tool_keys.len() == 1 {
        let tool = tool_keys[0].clone();
        let args = step
            .get(&tool)
            .and_then(Value::as_object)
            .cloned()
            .unwrap_or_default();
        return (Some(tool), args, StepMeta::from_map(step));
    }

    (None, Map::new(), None)
}

/// Extract a scalar at a dotted path (`artifact.id`, `items.0.url`).
/// Dots index both objects and list positions. Non-scalar leaves are
/// returned as-is; the caller filters.
pub fn extract_path<'a>(obj: &'a Value, path: &str) -> Option<&'a Value> {
    if path.trim().is_empty() {
        return None;
    }
    let mut current = obj;
    for raw_part in path.split('.') {
        let part = raw_part.trim();
        if part.is_empty() {
            continue;
        }
        match current {
            Value::Object(map) => {
                current = map.get(part)?;
            }
            Value::Array(items) => {
                let index: usize = part.parse().ok()?;
                current = items.get(index)?;
            }
            _ => return None,
        }
    }
    Some(current)
}

pub fn is_scalar(value: &Value) -> bool {
    matches!(
        value,
        Value::Null | Value::Bool(_) | Value::Number(_) | Value::String(_)
    )
}

/// Compact, secret-free note describing a step for the summary.
pub fn step_note(tool: &str, args: &Map<String, Value>) -> String {
    use policy_center::redact::redact_url;

    match tool {
        "navigate" => args
            .get("url")
            .and_then(Value::as_str)
            .map(redact_url)
            .unwrap_or_default(),
        "click" => {
            if let Some(text) = args.get("text").and_then(Value::as_str) {
                match args.get("role").and_then(Value::as_str) {
                    Some(role) => format!("text={text} role={role}"),
                    None => format!("text={text}"),
                }
            } else if let Some(selector) = args.get("selector").and_then(Value::as_str) {
                format!("selector={selector}")
            } else if args.contains_key("x") && args.contains_key("y") {
                format!(
                    "xy=({},{})",
                    args.get("x").cloned().unwrap_or(Value::Null),
                    args.get("y").cloned().unwrap_or(Value::Null)
                )
            } else {
                String::new()
            }
        }
        "type" => {
            if let Some(key) = args.get("key").and_then(Value::as_str) {
                let mods: String = [("ctrl", "C"), ("alt", "A"), ("meta", "M"), ("shift", "S")]
                    .iter()
                    .filter(|(flag, _)| {
                        args.get(*flag).and_then(Value::as_bool).unwrap_or(false)
                    })
                    .map(|(_, c)| *c)
                    .collect();
                if mods.is_empty() {
                    format!("key={key}")
                } else {
                    format!("key={key} mods={mods}")
                }
            } else {
                let text_len = args
                    .get("text")
                    .and_then(Value::as_str)
                    .map(str::len)
                    .unwrap_or(0);
                match args.get("selector").and_then(Value::as_str) {
                    Some(selector) => format!("selector={selector} text_len={text_len}"),
                    None => format!("text_len={text_len}"),
                }
            }
        }
        "http" | "fetch" => {
            let Some(url) = args.get("url").and_then(Value::as_str) else {
                return String::new();
            };
            let safe = redact_url(url);
            match args.get("method").and_then(Value::as_str) {
                Some(method) => format!("{method} {safe}"),
                None => safe,
            }
        }
        "net" => {
            let action = args.get("action").and_then(Value::as_str).unwrap_or("harLite");
            match args.get("since") {
                Some(since) if !since.is_null() => format!("action={action} since={since}"),
                _ => format!("action={action}"),
            }
        }
        "wait" => args
            .get("for")
            .and_then(Value::as_str)
            .map(|f| format!("for={f}"))
            .unwrap_or_default(),
        "page" => match args.get("detail").and_then(Value::as_str) {
            Some(detail) => format!("detail={detail}"),
            None => "overview".to_string(),
        },
        _ => String::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn explicit_form_normalizes() {
        let (tool, args, meta) = normalize_step(&json!({
            "tool": "click",
            "args": {"selector": "#go"},
            "optional": true,
            "export": {"id": "artifact.id"},
        }));
        assert_eq!(tool.as_deref(), Some("click"));
        assert_eq!(args["selector"], json!("#go"));
        let meta = meta.unwrap();
        assert!(meta.optional);
        assert!(meta.export.is_some());
    }

    #[test]
    fn shorthand_form_normalizes_with_meta() {
        let (tool, args, meta) = normalize_step(&json!({
            "navigate": {"url": "https://a.test/"},
            "label": "open",
            "auto_tab": true,
        }));
        assert_eq!(tool.as_deref(), Some("navigate"));
        assert_eq!(args["url"], json!("https://a.test/"));
        let meta = meta.unwrap();
        assert_eq!(meta.label.as_deref(), Some("open"));
        assert_eq!(meta.auto_tab, Some(true));
    }

    #[test]
    fn ambiguous_and_empty_shapes_are_rejected() {
        let (tool, _, _) = normalize_step(&json!({"click": {}, "type": {}}));
        assert!(tool.is_none());
        let (tool, _, _) = normalize_step(&json!({"optional": true}));
        assert!(tool.is_none());
        let (tool, _, _) = normalize_step(&json!(42));
        assert!(tool.is_none());
    }

    #[test]
    fn extract_path_walks_objects_and_lists() {
        let payload = json!({"artifact": {"id": "art_1"}, "items": [{"url": "u0"}, {"url": "u1"}]});
        assert_eq!(extract_path(&payload, "artifact.id"), Some(&json!("art_1")));
        assert_eq!(extract_path(&payload, "items.1.url"), Some(&json!("u1")));
        assert_eq!(extract_path(&payload, "items.5.url"), None);
        assert_eq!(extract_path(&payload, "missing"), None);
        assert_eq!(extract_path(&payload, ""), None);
    }

    #[test]
    fn notes_do_not_leak_typed_text() {
        let note = step_note(
            "type",
            json!({"selector": "#pwd", "text": "hunter2"}).as_object().unwrap(),
        );
        assert_eq!(note, "selector=#pwd text_len=7");
    }

    #[test]
    fn navigate_note_redacts_url() {
        let note = step_note(
            "navigate",
            json!({"url": "https://a.test/?token=abc&q=hi"}).as_object().unwrap(),
        );
        assert!(note.contains("q=hi"));
        assert!(!note.contains("abc"));
    }
}

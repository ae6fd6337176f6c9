//! Redaction for logs and frame dumps.
//!
//! Prefers safety over fidelity: obvious secrets and large payloads are
//! removed before anything reaches a log line or a dump file. Normal
//! queries (`q=hello`) survive; key-based suspects (`token=...`) do not.
//! Placeholders (`{{mem:...}}`, `{{param:...}}`, `{{var}}`) are always
//! preserved so runbook workflows keep working.

use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::{json, Map, Value};
use url::Url;

use memory_center::is_sensitive_key;

pub(crate) const SENSITIVE_KEYS: &[&str] = &[
    "secret",
    "password",
    "pass",
    "pwd",
    "token",
    "auth",
    "authorization",
    "cookie",
    "set-cookie",
    "api-key",
    "x-api-key",
    "x-auth-token",
];

pub static PLACEHOLDER_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"(?:\{\{\s*(?:mem:|param:)?[A-Za-z0-9_.-]+\s*\}\}|\$\{\s*(?:mem:|param:)?[A-Za-z0-9_.-]+\s*\})",
    )
    .expect("placeholder regex")
});

pub fn is_placeholder_value(value: &str) -> bool {
    !value.is_empty() && PLACEHOLDER_RE.is_match(value)
}

fn is_sensitive_plain_key(key: &str) -> bool {
    let lk = key.trim().to_ascii_lowercase();
    if lk.is_empty() {
        return false;
    }
    SENSITIVE_KEYS.contains(&lk.as_str()) || is_sensitive_key(&lk)
}

fn looks_like_query_string(value: &str) -> bool {
    value.contains('=')
}

fn redact_pairs(raw: &str) -> (String, bool) {
    let mut changed = false;
    let out: Vec<String> = raw
        .split('&')
        .map(|pair| match pair.split_once('=') {
            Some((key, value))
                if is_sensitive_plain_key(key)
                    && !value.is_empty()
                    && !is_placeholder_value(value) =>
            {
                changed = true;
                format!("{key}=%3Credacted%3E")
            }
            _ => pair.to_string(),
        })
        .collect();
    (out.join("&"), changed)
}

/// Redact suspicious URL parameters without destroying normal queries.
/// Returns the original string unchanged when no redaction is needed.
pub fn redact_url(raw: &str) -> String {
    if raw.is_empty() {
        return raw.to_string();
    }
    let Ok(mut url) = Url::parse(raw) else {
        return raw.to_string();
    };

    let mut changed = false;

    if !url.username().is_empty() || url.password().is_some() {
        let _ = url.set_username("");
        let _ = url.set_password(None);
        changed = true;
    }

    if let Some(query) = url.query().map(str::to_string) {
        let (redacted, query_changed) = redact_pairs(&query);
        if query_changed {
            url.set_query(Some(&redacted));
            changed = true;
        }
    }

    if let Some(fragment) = url.fragment().map(str::to_string) {
        if looks_like_query_string(&fragment) {
            let (redacted, fragment_changed) = redact_pairs(&fragment);
            if fragment_changed {
                url.set_fragment(Some(&redacted));
                changed = true;
            }
        }
    }

    if changed {
        url.to_string()
    } else {
        raw.to_string()
    }
}

/// Low-noise variant: drops query and fragment entirely, strips userinfo.
pub fn redact_url_brief(raw: &str) -> String {
    let Ok(mut url) = Url::parse(raw) else {
        return raw.to_string();
    };
    let _ = url.set_username("");
    let _ = url.set_password(None);
    url.set_query(None);
    url.set_fragment(None);
    url.to_string()
}

/// `<redacted ...>` descriptor that keeps shape information only.
pub fn redacted_summary(value: &Value) -> Value {
    let text = match value {
        Value::Null => "<redacted>".to_string(),
        Value::String(s) => format!("<redacted str len={}>", s.len()),
        Value::Array(items) => format!("<redacted list len={}>", items.len()),
        Value::Object(map) => format!("<redacted dict keys={}>", map.len()),
        _ => "<redacted>".to_string(),
    };
    Value::String(text)
}

pub fn redact_headers(headers: &Map<String, Value>) -> Map<String, Value> {
    let mut out = Map::new();
    for (key, value) in headers {
        let lk = key.to_ascii_lowercase();
        if SENSITIVE_KEYS.contains(&lk.as_str())
            || lk.starts_with("authorization")
            || lk.starts_with("cookie")
        {
            out.insert(key.clone(), redacted_summary(value));
        } else {
            out.insert(key.clone(), value.clone());
        }
    }
    out
}

/// Redact tool arguments for safe logging (tool-aware).
pub fn redact_tool_arguments(tool: &str, args: &Value) -> Value {
    redact_any(args, tool, None)
}

fn redact_any(value: &Value, tool: &str, key: Option<&str>) -> Value {
    match value {
        Value::Object(map) => {
            let mut out = Map::new();
            for (k, v) in map {
                out.insert(k.clone(), redact_any(v, tool, Some(k)));
            }
            Value::Object(out)
        }
        Value::Array(items) => {
            Value::Array(items.iter().map(|v| redact_any(v, tool, key)).collect())
        }
        Value::String(s) if key.map(str::to_ascii_lowercase).as_deref() == Some("url") => {
            Value::String(redact_url(s))
        }
        other => {
            let lk = key.map(str::to_ascii_lowercase).unwrap_or_default();

            if is_placeholder_value(other.as_str().unwrap_or_default()) {
                return other.clone();
            }

            // Tool-specific masks first, then the generic key rule.
            let masked = match (tool, lk.as_str()) {
                ("type", "text") => true,
                ("fetch" | "http", "body") => true,
                ("cookies", "value" | "cookies") => true,
                ("totp", "secret") => true,
                ("storage", "value") => true,
                _ => SENSITIVE_KEYS.contains(&lk.as_str()),
            };
            if masked {
                redacted_summary(other)
            } else {
                other.clone()
            }
        }
    }
}

/// Extra container-shaped masks that need the whole value, not a scalar.
fn redact_container(tool: &str, key: &str, value: &Value) -> Option<Value> {
    let lk = key.to_ascii_lowercase();
    match (tool, lk.as_str(), value) {
        ("fetch" | "http", "headers", Value::Object(map)) => {
            Some(Value::Object(redact_headers(map)))
        }
        ("form", "fill", Value::Object(map)) => {
            let mut out = Map::new();
            for (k, v) in map {
                if is_placeholder_value(v.as_str().unwrap_or_default()) {
                    out.insert(k.clone(), v.clone());
                } else {
                    out.insert(k.clone(), redacted_summary(v));
                }
            }
            Some(Value::Object(out))
        }
        ("storage", "items", Value::Object(map)) => {
            let mut out = Map::new();
            for (k, v) in map {
                out.insert(k.clone(), redacted_summary(v));
            }
            Some(Value::Object(out))
        }
        _ => None,
    }
}

/// Tool-argument redaction with the container rules applied. This is the
/// entry point used for frame dumps.
pub fn redact_tool_arguments_deep(tool: &str, args: &Value) -> Value {
    match args {
        Value::Object(map) => {
            let mut out = Map::new();
            for (k, v) in map {
                if let Some(masked) = redact_container(tool, k, v) {
                    out.insert(k.clone(), masked);
                } else {
                    out.insert(k.clone(), redact_any(v, tool, Some(k)));
                }
            }
            Value::Object(out)
        }
        other => redact_any(other, tool, None),
    }
}

fn dump_max_chars() -> usize {
    std::env::var("MCP_DUMP_FRAMES_MAX_CHARS")
        .ok()
        .and_then(|raw| raw.trim().parse().ok())
        .unwrap_or(5000)
}

/// Redact a JSON-RPC message for file dumps: tool args by tool name,
/// images replaced with a placeholder, large text truncated.
pub fn redact_jsonrpc_for_dump(payload: &Value, max_text_chars: Option<usize>) -> Value {
    let max_text_chars = max_text_chars.unwrap_or_else(dump_max_chars);
    let mut msg = payload.clone();

    let method = msg.get("method").and_then(Value::as_str).unwrap_or("");
    if method == "tools/call" {
        let name = msg
            .pointer("/params/name")
            .and_then(Value::as_str)
            .map(str::to_string);
        if let (Some(name), Some(args)) = (name, msg.pointer("/params/arguments").cloned()) {
            if let Some(params) = msg.get_mut("params") {
                params["arguments"] = redact_tool_arguments_deep(&name, &args);
            }
        }
    }

    if let Some(content) = msg.pointer_mut("/result/content").and_then(Value::as_array_mut) {
        for item in content {
            let item_type = item.get("type").and_then(Value::as_str).unwrap_or("");
            if item_type == "image" {
                if let Some(data) = item.get("data").and_then(Value::as_str) {
                    let note = format!("<omitted image base64 len={}>", data.len());
                    item["data"] = json!(note);
                }
            } else if item_type == "text" {
                if let Some(text) = item.get("text").and_then(Value::as_str) {
                    let mut redacted = redact_text_content(text);
                    if max_text_chars > 0 && redacted.len() > max_text_chars {
                        let total = text.len();
                        redacted.truncate(floor_char_boundary(&redacted, max_text_chars));
                        redacted.push_str(&format!("… <truncated len={total}>"));
                    }
                    item["text"] = json!(redacted);
                }
            }
        }
    }

    msg
}

/// Stricter variant for log lines (shorter and safer).
pub fn redact_jsonrpc_for_log(payload: &Value) -> Value {
    redact_jsonrpc_for_dump(payload, Some(512))
}

/// Redact sensitive fields inside text payloads (best-effort).
pub fn redact_text_content(text: &str) -> String {
    match serde_json::from_str::<Value>(text) {
        Ok(obj) => {
            let redacted = redact_output_json(&obj);
            serde_json::to_string(&redacted).unwrap_or_else(|_| text.to_string())
        }
        Err(_) => redact_plain_text(text),
    }
}

fn redact_output_json(value: &Value) -> Value {
    match value {
        Value::Object(map) => {
            let mut out = Map::new();
            for (k, v) in map {
                let lk = k.to_ascii_lowercase();
                if lk == "headers" {
                    if let Value::Object(headers) = v {
                        out.insert(k.clone(), Value::Object(redact_headers(headers)));
                        continue;
                    }
                }
                if lk == "body" {
                    out.insert(k.clone(), redacted_summary(v));
                    continue;
                }
                if lk == "cookies" {
                    if let Value::Array(items) = v {
                        let cookies: Vec<Value> = items
                            .iter()
                            .map(|cookie| {
                                if let Value::Object(cmap) = cookie {
                                    if cmap.contains_key("value") {
                                        let mut c2 = cmap.clone();
                                        c2.insert(
                                            "value".into(),
                                            redacted_summary(&cmap["value"]),
                                        );
                                        return Value::Object(c2);
                                    }
                                }
                                cookie.clone()
                            })
                            .collect();
                        out.insert(k.clone(), Value::Array(cookies));
                        continue;
                    }
                }
                if matches!(lk.as_str(), "secret" | "token" | "authorization" | "cookie") {
                    out.insert(k.clone(), redacted_summary(v));
                    continue;
                }
                // Numeric 2FA codes.
                if lk == "code" {
                    if let Some(s) = v.as_str() {
                        if s.chars().all(|c| c.is_ascii_digit()) && (4..=12).contains(&s.len()) {
                            out.insert(k.clone(), redacted_summary(v));
                            continue;
                        }
                    }
                }
                out.insert(k.clone(), redact_output_json(v));
            }
            Value::Object(out)
        }
        Value::Array(items) => Value::Array(items.iter().map(redact_output_json).collect()),
        other => other.clone(),
    }
}

fn redact_plain_text(text: &str) -> String {
    let mut out_lines = Vec::new();
    for line in text.lines() {
        let stripped = line.trim();
        if stripped.is_empty() {
            out_lines.push(line.to_string());
            continue;
        }

        let sep = if line.contains(':') {
            Some(':')
        } else if line.contains('=') {
            Some('=')
        } else {
            None
        };
        let Some(sep) = sep else {
            out_lines.push(line.to_string());
            continue;
        };

        let (left, right) = line.split_once(sep).unwrap_or((line, ""));
        let key = left.trim().to_ascii_lowercase();
        if SENSITIVE_KEYS.contains(&key.as_str())
            || key.starts_with("authorization")
            || key.starts_with("cookie")
            || key.starts_with("set-cookie")
        {
            let summary = redacted_summary(&Value::String(right.trim().to_string()));
            out_lines.push(format!("{left}{sep} {}", summary.as_str().unwrap_or("")));
            continue;
        }

        if key == "code" {
            let v = right.trim();
            if v.chars().all(|c| c.is_ascii_digit()) && (4..=12).contains(&v.len()) {
                let summary = redacted_summary(&Value::String(v.to_string()));
                out_lines.push(format!("{left}{sep} {}", summary.as_str().unwrap_or("")));
                continue;
            }
        }

        out_lines.push(line.to_string());
    }
    out_lines.join("\n")
}

fn floor_char_boundary(s: &str, mut at: usize) -> usize {
    at = at.min(s.len());
    while at > 0 && !s.is_char_boundary(at) {
        at -= 1;
    }
    at
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normal_queries_survive_token_values_do_not() {
        let url = "https://example.test/search?q=hello&token=abc123";
        let redacted = redact_url(url);
        assert!(redacted.contains("q=hello"));
        assert!(!redacted.contains("abc123"));
        assert!(redacted.contains("token="));
    }

    #[test]
    fn unchanged_urls_come_back_verbatim() {
        let url = "https://example.test/path?q=hi&page=2";
        assert_eq!(redact_url(url), url);
    }

    #[test]
    fn userinfo_is_stripped() {
        let redacted = redact_url("https://user:pw@example.test/a");
        assert!(!redacted.contains("user:pw@"));
        assert!(redacted.contains("example.test/a"));
    }

    #[test]
    fn oauth_fragment_is_sanitized() {
        let redacted = redact_url("https://app.test/cb#access_token=xyz&state=ok");
        assert!(!redacted.contains("xyz"));
        assert!(redacted.contains("state=ok"));
    }

    #[test]
    fn placeholders_are_preserved_in_urls() {
        let url = "https://api.test/v1?token={{mem:api_token}}";
        assert_eq!(redact_url(url), url);
    }

    #[test]
    fn brief_redaction_drops_query() {
        let brief = redact_url_brief("https://u:p@example.test/a/b?x=1#frag");
        assert_eq!(brief, "https://example.test/a/b");
    }

    #[test]
    fn type_text_is_masked() {
        let args = json!({"selector": "#pwd", "text": "hunter2"});
        let out = redact_tool_arguments_deep("type", &args);
        assert_eq!(out["selector"], json!("#pwd"));
        assert_eq!(out["text"], json!("<redacted str len=7>"));
    }

    #[test]
    fn form_fill_masks_values_but_keeps_placeholders() {
        let args = json!({"fill": {"user": "alice", "password": "{{mem:pw}}"}, "submit": true});
        let out = redact_tool_arguments_deep("form", &args);
        assert_eq!(out["fill"]["user"], json!("<redacted str len=5>"));
        assert_eq!(out["fill"]["password"], json!("{{mem:pw}}"));
        assert_eq!(out["submit"], json!(true));
    }

    #[test]
    fn http_headers_mask_authorization_only() {
        let args = json!({"url": "https://api.test/", "headers": {"Authorization": "Bearer x", "Accept": "application/json"}});
        let out = redact_tool_arguments_deep("http", &args);
        assert_eq!(out["headers"]["Accept"], json!("application/json"));
        assert!(out["headers"]["Authorization"]
            .as_str()
            .unwrap()
            .starts_with("<redacted"));
    }

    #[test]
    fn jsonrpc_dump_replaces_images_and_redacts_args() {
        let frame = json!({
            "jsonrpc": "2.0",
            "id": 1,
            "method": "tools/call",
            "params": {"name": "type", "arguments": {"text": "secret", "selector": "#x"}},
            "result": {"content": [
                {"type": "image", "data": "AAAA", "mimeType": "image/png"},
                {"type": "text", "text": "{\"token\": \"abc\"}"}
            ]}
        });
        let out = redact_jsonrpc_for_dump(&frame, Some(5000));
        assert_eq!(
            out["params"]["arguments"]["text"],
            json!("<redacted str len=6>")
        );
        assert_eq!(out["result"]["content"][0]["data"], json!("<omitted image base64 len=4>"));
        let text = out["result"]["content"][1]["text"].as_str().unwrap();
        assert!(!text.contains("abc"));
    }

    #[test]
    fn plain_text_kv_lines_are_redacted() {
        let text = "status: ok\nauthorization: Bearer abc\nq: hello";
        let out = redact_plain_text(text);
        assert!(out.contains("status: ok"));
        assert!(out.contains("q: hello"));
        assert!(!out.contains("Bearer abc"));
    }
}

//! Macro expansion for batched runs.
//!
//! Macros are run-internal conveniences that expand into regular steps.
//! They exist to keep action lists short and behavior deterministic and
//! bounded. Nothing here calls an LLM; nothing here loops unbounded.

pub mod overlay;
pub mod params;
pub mod repeat_macros;

use serde_json::{json, Map, Value};
use thiserror::Error;

use memory_center::MemoryCenter;
use policy_center::runbook::has_sensitive_literals;

pub use overlay::dismiss_overlays_js;
pub use params::{interpolate_params_pair, params_hint, ParamMissing};

/// Hard cap on generated steps per expansion.
pub const DEFAULT_MAX_STEPS: usize = 80;

pub const KNOWN_MACROS: &[&str] = &[
    "trace_then_screenshot",
    "dismiss_overlays",
    "login_basic",
    "scroll_until_visible",
    "scroll_to_end",
    "retry_click",
    "paginate_next",
    "auto_expand",
    "auto_expand_scroll_extract",
    "goto_if_needed",
    "assert_then",
    "include_memory_steps",
];

const DEFAULT_LOGIN_USER_KEYS: &[&str] = &["email", "e-mail", "username", "user", "login"];
const DEFAULT_LOGIN_PASSWORD_KEYS: &[&str] = &["password", "pass", "passcode"];

const DEFAULT_ERROR_TEXTS: &[&str] = &[
    "error while loading",
    "something went wrong",
    "please try again",
    "unable to load",
];

#[derive(Debug, Error)]
#[error("{message}")]
pub struct MacroError {
    pub message: String,
    pub suggestion: Option<String>,
    pub details: Option<Value>,
}

impl MacroError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            suggestion: None,
            details: None,
        }
    }

    pub fn with_suggestion(mut self, suggestion: impl Into<String>) -> Self {
        self.suggestion = Some(suggestion.into());
        self
    }

    pub fn with_details(mut self, details: Value) -> Self {
        self.details = Some(details);
        self
    }
}

/// Result of a successful expansion.
#[derive(Clone, Debug)]
pub struct Expansion {
    pub name: String,
    pub dry_run: bool,
    pub plan: Value,
    pub steps: Vec<Value>,
}

impl Expansion {
    pub fn steps_total(&self) -> usize {
        self.steps.len()
    }
}

/// Bounded keys-only view of an args object for plan summaries.
pub(crate) fn plan_keys(map: &Map<String, Value>, limit: usize) -> Vec<String> {
    map.keys().take(limit).cloned().collect()
}

fn dedupe_keep_order(items: Vec<String>) -> Vec<String> {
    let mut seen = std::collections::HashSet::new();
    items
        .into_iter()
        .filter(|item| seen.insert(item.clone()))
        .collect()
}

fn obj(value: Option<&Value>) -> Map<String, Value> {
    value.and_then(Value::as_object).cloned().unwrap_or_default()
}

/// Expand a macro into flow/run steps.
///
/// `args` carries real values (secrets already resolved); `args_note` is
/// the same structure with secrets replaced, used for plans so a dry-run
/// or a step note never leaks.
pub fn expand_macro(
    name: &str,
    args: &Value,
    args_note: &Value,
    dry_run: bool,
    max_steps: usize,
    memory: &MemoryCenter,
) -> Result<Expansion, MacroError> {
    let name = name.trim();
    if name.is_empty() {
        return Err(MacroError::new("Missing macro name").with_suggestion("Provide macro.name='...'"));
    }

    let a = obj(Some(args));
    let n = obj(Some(args_note));

    let mut plan = json!({"name": name, "dry_run": dry_run});
    let steps: Vec<Value>;

    match name {
        "trace_then_screenshot" => {
            let trace = a.get("trace").and_then(Value::as_str).unwrap_or("harLite");
            let trace = if matches!(trace, "harLite" | "trace") {
                trace
            } else {
                "harLite"
            };
            steps = vec![
                json!({"net": {"action": trace, "store": true}}),
                json!({"screenshot": {}}),
            ];
            plan["args"] = json!({"trace": n.get("trace").and_then(Value::as_str).unwrap_or(trace)});
        }

        "dismiss_overlays" => {
            steps = vec![json!({
                "js": {"code": dismiss_overlays_js()},
                "optional": true,
                "label": "dismiss_overlays",
            })];
            plan["args"] = json!({});
        }

        "login_basic" => {
            let username = a
                .get("username")
                .and_then(Value::as_str)
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .ok_or_else(|| {
                    MacroError::new("Missing username")
                        .with_suggestion("Provide macro.args.username")
                        .with_details(json!({"name": name}))
                })?;
            let password = a
                .get("password")
                .and_then(Value::as_str)
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .ok_or_else(|| {
                    MacroError::new("Missing password")
                        .with_suggestion("Provide macro.args.password (prefer {{mem:...}} placeholders)")
                        .with_details(json!({"name": name}))
                })?;

            let user_keys = dedupe_keep_order(
                repeat_macros::as_str_list(a.get("username_key_candidates"))
                    .into_iter()
                    .chain(DEFAULT_LOGIN_USER_KEYS.iter().map(|s| s.to_string()))
                    .collect(),
            );
            let pass_keys = dedupe_keep_order(
                repeat_macros::as_str_list(a.get("password_key_candidates"))
                    .into_iter()
                    .chain(DEFAULT_LOGIN_PASSWORD_KEYS.iter().map(|s| s.to_string()))
                    .collect(),
            );

            let mut fill = Map::new();
            for key in &user_keys {
                fill.insert(key.clone(), json!(username));
            }
            for key in &pass_keys {
                fill.insert(key.clone(), json!(password));
            }

            // Native form submit is less brittle than hunting the button.
            steps = vec![json!({"form": {"fill": fill, "submit": true}})];
            plan["args"] = json!({
                "username": n.get("username").and_then(Value::as_str).unwrap_or("<redacted>"),
                "username_key_candidates": user_keys,
                "password": "<redacted>",
                "password_key_candidates": pass_keys,
            });
        }

        "scroll_until_visible" => {
            let (s, p) = repeat_macros::expand_scroll_until_visible(&a, &n)
                .map_err(|err| err.with_details(json!({"name": name})))?;
            steps = s;
            plan["args"] = p;
        }

        "scroll_to_end" => {
            let (s, p) = repeat_macros::expand_scroll_to_end(&a, &n)
                .map_err(|err| err.with_details(json!({"name": name})))?;
            steps = s;
            plan["args"] = p;
        }

        "retry_click" => {
            let (s, p) = repeat_macros::expand_retry_click(&a, &n)
                .map_err(|err| err.with_details(json!({"name": name})))?;
            steps = s;
            plan["args"] = p;
        }

        "paginate_next" => {
            let (s, p) = repeat_macros::expand_paginate_next(&a, &n)
                .map_err(|err| err.with_details(json!({"name": name})))?;
            steps = s;
            plan["args"] = p;
        }

        "auto_expand" => {
            let (s, p) = repeat_macros::expand_auto_expand(&a, &n)
                .map_err(|err| err.with_details(json!({"name": name})))?;
            steps = s;
            plan["args"] = p;
        }

        "auto_expand_scroll_extract" => {
            let (s, p) = expand_auto_expand_scroll_extract(&a, &n)?;
            steps = s;
            plan["args"] = p;
        }

        "goto_if_needed" => {
            let (s, p) = expand_goto_if_needed(&a, &n)?;
            steps = s;
            plan["args"] = p;
        }

        "assert_then" => {
            let (s, p) = expand_assert_then(&a, &n)?;
            steps = s;
            plan["args"] = p;
        }

        "include_memory_steps" => {
            let (s, p, preview) = expand_include_memory_steps(&a, memory)?;
            steps = s;
            plan["args"] = p;
            if !preview.is_empty() {
                plan["stepsPreview"] = Value::Array(preview);
            }
        }

        _ => {
            return Err(MacroError::new("Unknown macro")
                .with_suggestion(format!("Known macros: {}", KNOWN_MACROS.join(", ")))
                .with_details(json!({"name": name})));
        }
    }

    if steps.len() > max_steps {
        return Err(MacroError::new("Macro expansion too large")
            .with_suggestion("Reduce macro scope or increase max_steps (server default is bounded)")
            .with_details(json!({"name": name, "steps": steps.len(), "max_steps": max_steps})));
    }

    Ok(Expansion {
        name: name.to_string(),
        dry_run,
        plan,
        steps,
    })
}

fn expand_goto_if_needed(
    args: &Map<String, Value>,
    args_note: &Map<String, Value>,
) -> Result<(Vec<Value>, Value), MacroError> {
    let url_contains = args
        .get("url_contains")
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .ok_or_else(|| {
            MacroError::new("Missing url_contains")
                .with_suggestion("Provide macro.args.url_contains='example.com/path'")
        })?;
    let url = args
        .get("url")
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .ok_or_else(|| {
            MacroError::new("Missing url").with_suggestion("Provide macro.args.url='https://...'")
        })?;

    let wait = args
        .get("wait")
        .and_then(Value::as_str)
        .map(|s| s.trim().to_ascii_lowercase());
    if let Some(wait) = &wait {
        if !matches!(wait.as_str(), "" | "auto" | "navigation" | "none") {
            return Err(MacroError::new("Invalid wait")
                .with_suggestion("Use wait='auto'|'navigation'|'none'"));
        }
    }

    let mut nav_args = json!({"url": url});
    if let Some(wait) = wait.as_deref().filter(|w| !w.is_empty()) {
        nav_args["wait"] = json!(wait);
    }

    let steps = vec![json!({
        "when": {
            "if": {"url": url_contains},
            "then": [],
            "else": [{"navigate": nav_args}],
        }
    })];
    let mut plan = json!({
        "url_contains": url_contains,
        "url": args_note.get("url").and_then(Value::as_str).unwrap_or("<redacted>"),
    });
    if let Some(wait) = wait.filter(|w| !w.is_empty()) {
        plan["wait"] = json!(wait);
    }
    Ok((steps, plan))
}

fn expand_assert_then(
    args: &Map<String, Value>,
    args_note: &Map<String, Value>,
) -> Result<(Vec<Value>, Value), MacroError> {
    let cond = args
        .get("assert")
        .and_then(Value::as_object)
        .filter(|m| !m.is_empty())
        .ok_or_else(|| {
            MacroError::new("Missing assert condition")
                .with_suggestion("Provide macro.args.assert={url/title/selector/text,...}")
        })?;
    let then_raw = args
        .get("then")
        .and_then(Value::as_array)
        .filter(|items| !items.is_empty())
        .ok_or_else(|| {
            MacroError::new("Missing then steps")
                .with_suggestion("Provide macro.args.then=[{click:{...}}, ...]")
        })?;

    let body: Vec<Value> = then_raw.iter().filter(|s| s.is_object()).cloned().collect();
    if body.len() != then_raw.len() {
        return Err(MacroError::new("Invalid then step list (non-object entries)")
            .with_suggestion("Ensure every then step is an object like {click:{...}}"));
    }
    if body.len() > 30 {
        return Err(MacroError::new("Then branch too large")
            .with_suggestion("Reduce then size or split into multiple runs")
            .with_details(json!({"steps": body.len(), "max": 30})));
    }

    let mut steps = vec![json!({"assert": cond})];
    steps.extend(body.iter().cloned());

    let mut plan = json!({
        "assert": plan_keys(cond, 8),
        "then": body.len(),
    });
    if let Some(timeout) = cond.get("timeout_s") {
        plan["timeout_s"] = timeout.clone();
    }
    if let Some(note) = args_note.get("note").and_then(Value::as_str) {
        if !note.is_empty() {
            plan["note"] = json!(note);
        }
    }
    Ok((steps, plan))
}

fn build_error_texts_js(texts: &[String]) -> String {
    let safe: Vec<String> = texts
        .iter()
        .map(|t| t.trim().to_ascii_lowercase())
        .filter(|t| !t.is_empty())
        .collect();
    if safe.is_empty() {
        return "true".into();
    }
    let items = serde_json::to_string(&safe).unwrap_or_else(|_| "[]".into());
    format!(
        "(() => {{\
  const errors = {items};\
  const hay = (document.body && document.body.innerText ? document.body.innerText : '').toLowerCase();\
  if (!hay) return true;\
  return !errors.some((t) => hay.includes(t));\
}})()"
    )
}

fn expand_auto_expand_scroll_extract(
    args: &Map<String, Value>,
    args_note: &Map<String, Value>,
) -> Result<(Vec<Value>, Value), MacroError> {
    use policy_center::reliability::coerce_boolish;

    let mut steps: Vec<Value> = Vec::new();
    let mut plan = Map::new();
    let mut warnings: Vec<String> = Vec::new();

    if let Some(nav) = args.get("navigate").and_then(Value::as_object) {
        steps.push(json!({"navigate": nav}));
        plan.insert("navigate".into(), json!(plan_keys(nav, 8)));
    } else if let Some(url) = args
        .get("url")
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|s| !s.is_empty())
    {
        steps.push(json!({"navigate": {"url": url}}));
        plan.insert("navigate".into(), json!(["url"]));
    }

    let sub_args = |key: &str, warnings: &mut Vec<String>| -> Option<Map<String, Value>> {
        match args.get(key) {
            None | Some(Value::Bool(true)) => Some(Map::new()),
            Some(Value::Bool(false)) | Some(Value::Null) => None,
            Some(Value::Object(map)) => Some(map.clone()),
            Some(other) => match coerce_boolish(other) {
                Some(Some(true)) => Some(Map::new()),
                Some(Some(false)) => None,
                _ => {
                    warnings.push(format!("{key}: expected bool or object; defaulted to true"));
                    Some(Map::new())
                }
            },
        }
    };

    if let Some(exp_args) = sub_args("expand", &mut warnings) {
        let note = obj(args_note.get("expand"));
        let (s, p) = repeat_macros::expand_auto_expand(&exp_args, &note)?;
        steps.extend(s);
        plan.insert("expand".into(), p);
    }

    if let Some(mut scroll_args) = sub_args("scroll", &mut warnings) {
        scroll_args
            .entry("stop_on_url_change".to_string())
            .or_insert(json!(true));
        let note = obj(args_note.get("scroll"));
        let (s, p) = repeat_macros::expand_scroll_to_end(&scroll_args, &note)?;
        steps.extend(s);
        plan.insert("scroll".into(), p);
    }

    let extract_args = match args.get("extract") {
        None | Some(Value::Null) => Map::new(),
        Some(Value::Object(map)) => map.clone(),
        Some(_) => {
            return Err(MacroError::new("extract must be an object")
                .with_suggestion("Use extract={...}"));
        }
    };

    let retry_enabled = args
        .get("retry_on_error")
        .map(|v| coerce_boolish(v).flatten().unwrap_or(false))
        .unwrap_or(true);
    let error_texts = {
        let listed = repeat_macros::as_str_list(args.get("error_texts"));
        if listed.is_empty() {
            DEFAULT_ERROR_TEXTS.iter().map(|s| s.to_string()).collect()
        } else {
            listed
        }
    };
    let max_error_retries = args
        .get("max_error_retries")
        .and_then(Value::as_i64)
        .unwrap_or(2)
        .clamp(1, 5);

    let retry_steps = {
        let listed: Vec<Value> = args
            .get("retry_steps")
            .and_then(Value::as_array)
            .map(|items| items.iter().filter(|s| s.is_object()).cloned().collect())
            .unwrap_or_default();
        if listed.is_empty() {
            vec![
                json!({"wait": {"for": "networkidle", "timeout": 6}}),
                json!({"scroll": {"direction": "down", "amount": 400}}),
                json!({"wait": {"for": "networkidle", "timeout": 6}}),
            ]
        } else {
            listed
        }
    };

    if retry_enabled && !error_texts.is_empty() {
        steps.push(json!({
            "repeat": {
                "max_iters": max_error_retries,
                "until": {"js": build_error_texts_js(&error_texts)},
                "timeout_s": 0.4,
                "steps": retry_steps,
            }
        }));
        plan.insert("retry_on_error".into(), json!(true));
        plan.insert("max_error_retries".into(), json!(max_error_retries));
    }

    steps.push(json!({"extract_content": extract_args}));
    plan.insert("extract".into(), json!(plan_keys(&extract_args, 12)));
    if !warnings.is_empty() {
        warnings.truncate(4);
        plan.insert("warnings".into(), json!(warnings));
    }

    Ok((steps, Value::Object(plan)))
}

fn expand_include_memory_steps(
    args: &Map<String, Value>,
    memory: &MemoryCenter,
) -> Result<(Vec<Value>, Value, Vec<Value>), MacroError> {
    let key = args
        .get("memory_key")
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .ok_or_else(|| {
            MacroError::new("Missing memory_key")
                .with_suggestion(
                    "Provide macro.args.memory_key (set via browser(action=\"memory\", memory_action=\"set\", key=\"...\", value=[...]))",
                )
                .with_details(json!({"name": "include_memory_steps"}))
        })?;

    let allow_sensitive = args
        .get("allow_sensitive")
        .and_then(Value::as_bool)
        .unwrap_or(false);

    let Some(entry) = memory.get(key) else {
        return Err(MacroError::new("Unknown memory key")
            .with_suggestion(
                "Set it via browser(action=\"memory\", memory_action=\"set\", key=\"...\", value=[...])",
            )
            .with_details(json!({"key": key, "known": memory.keys_hint(5)})));
    };

    if entry.sensitive && !allow_sensitive {
        return Err(MacroError::new("Refusing to include a sensitive memory key")
            .with_suggestion(
                "Use allow_sensitive=true only if you explicitly accept the risk; prefer storing steps with {{mem:...}} placeholders",
            )
            .with_details(json!({"key": key})));
    }

    let Value::Array(raw) = entry.value else {
        return Err(MacroError::new("Memory value is not a step list")
            .with_suggestion("Store value as a JSON array of step objects")
            .with_details(json!({"key": key})));
    };

    let raw_steps: Vec<Value> = raw.iter().filter(|s| s.is_object()).cloned().collect();
    if raw_steps.len() != raw.len() {
        return Err(MacroError::new("Invalid step list (non-object entries)")
            .with_suggestion(
                "Ensure every step is an object like {click:{...}} or {tool:'click', args:{...}}",
            )
            .with_details(json!({"key": key})));
    }

    if !allow_sensitive && has_sensitive_literals(&raw_steps) {
        return Err(MacroError::new("Refusing to include a step list with sensitive literals")
            .with_suggestion(
                "Prefer {{mem:...}} / {{param:...}} placeholders, or use allow_sensitive=true if you explicitly accept the risk",
            )
            .with_details(json!({"key": key})));
    }

    let params = obj(args.get("params"));
    let mut expanded = Vec::with_capacity(raw_steps.len());
    let mut preview = Vec::new();
    for step in &raw_steps {
        match interpolate_params_pair(step, &params) {
            Ok((actual, note)) => {
                expanded.push(actual);
                if preview.len() < 5 {
                    preview.push(note);
                }
            }
            Err(missing) => {
                return Err(MacroError::new("Missing macro param")
                    .with_suggestion("Provide params={...} for {{param:key}} placeholders")
                    .with_details(json!({
                        "missing": missing.key,
                        "known": params_hint(&params, 20),
                    })));
            }
        }
    }

    let plan = json!({
        "memory_key": key,
        "params": params_hint(&params, 50),
    });
    Ok((expanded, plan, preview))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn memory() -> MemoryCenter {
        MemoryCenter::new()
    }

    #[test]
    fn unknown_macro_lists_the_known_set() {
        let err = expand_macro("frobnicate", &json!({}), &json!({}), false, 80, &memory())
            .unwrap_err();
        assert_eq!(err.message, "Unknown macro");
        assert!(err.suggestion.unwrap().contains("login_basic"));
    }

    #[test]
    fn trace_then_screenshot_shape() {
        let exp = expand_macro(
            "trace_then_screenshot",
            &json!({}),
            &json!({}),
            false,
            80,
            &memory(),
        )
        .unwrap();
        assert_eq!(exp.steps.len(), 2);
        assert_eq!(exp.steps[0]["net"]["action"], json!("harLite"));
        assert_eq!(exp.steps[0]["net"]["store"], json!(true));
        assert!(exp.steps[1].get("screenshot").is_some());
    }

    #[test]
    fn login_basic_builds_form_fill_and_redacts_plan() {
        let exp = expand_macro(
            "login_basic",
            &json!({"username": "alice@example.test", "password": "hunter2"}),
            &json!({"username": "alice@example.test", "password": "<mem:pw>"}),
            false,
            80,
            &memory(),
        )
        .unwrap();
        assert_eq!(exp.steps.len(), 1);
        let fill = exp.steps[0]["form"]["fill"].as_object().unwrap();
        assert_eq!(fill["email"], json!("alice@example.test"));
        assert_eq!(fill["password"], json!("hunter2"));
        assert_eq!(exp.steps[0]["form"]["submit"], json!(true));
        // Plan never carries the password literal.
        assert_eq!(exp.plan["args"]["password"], json!("<redacted>"));
    }

    #[test]
    fn login_basic_requires_credentials() {
        let err = expand_macro(
            "login_basic",
            &json!({"username": "alice"}),
            &json!({}),
            false,
            80,
            &memory(),
        )
        .unwrap_err();
        assert_eq!(err.message, "Missing password");
    }

    #[test]
    fn goto_if_needed_expands_to_when() {
        let exp = expand_macro(
            "goto_if_needed",
            &json!({"url_contains": "dash", "url": "https://a.test/dash"}),
            &json!({}),
            false,
            80,
            &memory(),
        )
        .unwrap();
        let when = &exp.steps[0]["when"];
        assert_eq!(when["if"]["url"], json!("dash"));
        assert_eq!(when["then"], json!([]));
        assert_eq!(when["else"][0]["navigate"]["url"], json!("https://a.test/dash"));
    }

    #[test]
    fn assert_then_prepends_the_assert() {
        let exp = expand_macro(
            "assert_then",
            &json!({"assert": {"url": "cart"}, "then": [{"click": {"text": "Checkout"}}]}),
            &json!({}),
            false,
            80,
            &memory(),
        )
        .unwrap();
        assert_eq!(exp.steps.len(), 2);
        assert_eq!(exp.steps[0]["assert"]["url"], json!("cart"));
        assert_eq!(exp.steps[1]["click"]["text"], json!("Checkout"));
    }

    #[test]
    fn include_memory_steps_interpolates_params() {
        let mem = memory();
        mem.set(
            "checkout",
            json!([{"navigate": {"url": "{{param:base}}/cart"}}]),
            0,
            0,
        )
        .unwrap();
        let exp = expand_macro(
            "include_memory_steps",
            &json!({"memory_key": "checkout", "params": {"base": "https://shop.test"}}),
            &json!({}),
            false,
            80,
            &mem,
        )
        .unwrap();
        assert_eq!(
            exp.steps[0]["navigate"]["url"],
            json!("https://shop.test/cart")
        );
        // Preview keeps the placeholder shape.
        assert_eq!(
            exp.plan["stepsPreview"][0]["navigate"]["url"],
            json!("<param:base>/cart")
        );
    }

    #[test]
    fn include_memory_steps_refuses_sensitive_literals() {
        let mem = memory();
        mem.set(
            "bad-runbook",
            json!([{"type": {"selector": "#pwd", "text": "hunter2"}}]),
            0,
            0,
        )
        .unwrap();
        let err = expand_macro(
            "include_memory_steps",
            &json!({"memory_key": "bad-runbook"}),
            &json!({}),
            false,
            80,
            &mem,
        )
        .unwrap_err();
        assert!(err.message.contains("sensitive literals"));

        let exp = expand_macro(
            "include_memory_steps",
            &json!({"memory_key": "bad-runbook", "allow_sensitive": true}),
            &json!({}),
            false,
            80,
            &mem,
        )
        .unwrap();
        assert_eq!(exp.steps.len(), 1);
    }

    #[test]
    fn include_memory_steps_missing_param_fails_closed() {
        let mem = memory();
        mem.set("rb", json!([{"navigate": {"url": "{{param:base}}"}}]), 0, 0)
            .unwrap();
        let err = expand_macro(
            "include_memory_steps",
            &json!({"memory_key": "rb"}),
            &json!({}),
            false,
            80,
            &mem,
        )
        .unwrap_err();
        assert_eq!(err.message, "Missing macro param");
        assert_eq!(err.details.unwrap()["missing"], json!("base"));
    }

    #[test]
    fn auto_expand_scroll_extract_composes() {
        let exp = expand_macro(
            "auto_expand_scroll_extract",
            &json!({"url": "https://a.test/", "extract": {"mode": "article"}}),
            &json!({}),
            false,
            80,
            &memory(),
        )
        .unwrap();
        // navigate + auto_expand + scroll_to_end + error-retry repeat + extract.
        assert_eq!(exp.steps.len(), 5);
        assert_eq!(exp.steps[0]["navigate"]["url"], json!("https://a.test/"));
        assert!(exp.steps[1].get("repeat").is_some());
        assert!(exp.steps[2].get("repeat").is_some());
        assert!(exp.steps[3].get("repeat").is_some());
        assert_eq!(exp.steps[4]["extract_content"]["mode"], json!("article"));
    }

    #[test]
    fn oversized_expansion_is_refused() {
        let err = expand_macro(
            "trace_then_screenshot",
            &json!({}),
            &json!({}),
            false,
            1,
            &memory(),
        )
        .unwrap_err();
        assert_eq!(err.message, "Macro expansion too large");
        assert_eq!(err.details.unwrap()["max_steps"], json!(1));
    }
}

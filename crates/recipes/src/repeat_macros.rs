//! Repeat-based macros: each expands to one internal `repeat` action.

use serde_json::{json, Map, Value};

use crate::{plan_keys, MacroError};

pub const DEFAULT_SCROLL_END_JS: &str = "(() => {\
  const el = document.scrollingElement || document.documentElement;\
  const bottom = (el.scrollTop + window.innerHeight);\
  return bottom >= (el.scrollHeight - 2);\
})()";

pub const DEFAULT_EXPAND_PHRASES: &[&str] = &[
    "show more",
    "read more",
    "see more",
    "expand",
    "show all",
    "load more",
];

pub const DEFAULT_EXPAND_SELECTORS: &str = "button, [role=button], summary, details, \
[aria-expanded], [aria-controls], [data-expand], [data-expanded], [data-showmore], \
[data-show-more], [data-toggle], [data-collapse], [data-collapsed], [data-more], [data-open]";

pub(crate) fn as_str_list(value: Option<&Value>) -> Vec<String> {
    match value {
        Some(Value::String(s)) if !s.trim().is_empty() => vec![s.trim().to_string()],
        Some(Value::Array(items)) => items
            .iter()
            .filter_map(Value::as_str)
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
            .collect(),
        _ => Vec::new(),
    }
}

fn int_arg(args: &Map<String, Value>, key: &str, default: i64, lo: i64, hi: i64) -> i64 {
    args.get(key)
        .and_then(|v| v.as_i64().or_else(|| v.as_f64().map(|f| f as i64)))
        .unwrap_or(default)
        .clamp(lo, hi)
}

fn float_arg(args: &Map<String, Value>, key: &str, default: f64, lo: f64, hi: f64) -> f64 {
    args.get(key)
        .and_then(Value::as_f64)
        .unwrap_or(default)
        .clamp(lo, hi)
}

/// Copy explicit backoff tuning through to the repeat spec.
fn carry_backoff(args: &Map<String, Value>, repeat: &mut Map<String, Value>) {
    for key in [
        "max_time_s",
        "backoff_s",
        "backoff_factor",
        "backoff_max_s",
        "backoff_jitter",
        "jitter_seed",
    ] {
        if let Some(value) = args.get(key) {
            if !value.is_null() && !value.is_boolean() {
                repeat.insert(key.to_string(), value.clone());
            }
        }
    }
}

/// `settle_ms` is sugar for `backoff_s`; a small default keeps loops from
/// hammering the page.
fn settle_backoff(args: &Map<String, Value>, repeat: &mut Map<String, Value>) {
    if args.contains_key("backoff_s") {
        return;
    }
    let backoff = match args.get("settle_ms").and_then(Value::as_f64) {
        Some(ms) => (ms / 1000.0).clamp(0.0, 10.0),
        None => 0.2,
    };
    repeat.insert("backoff_s".into(), json!(backoff));
}

pub fn expand_scroll_until_visible(
    args: &Map<String, Value>,
    _args_note: &Map<String, Value>,
) -> Result<(Vec<Value>, Value), MacroError> {
    let selector = args.get("selector").and_then(Value::as_str).map(str::trim);
    let text = args.get("text").and_then(Value::as_str).map(str::trim);
    if selector.map_or(true, str::is_empty) && text.map_or(true, str::is_empty) {
        return Err(MacroError::new("Missing target")
            .with_suggestion("Provide macro.args.selector or macro.args.text"));
    }

    let mut until = Map::new();
    if let Some(selector) = selector.filter(|s| !s.is_empty()) {
        until.insert("selector".into(), json!(selector));
    }
    if let Some(text) = text.filter(|t| !t.is_empty()) {
        until.insert("text".into(), json!(text));
    }

    let max_iters = int_arg(args, "max_iters", 10, 1, 50);
    let timeout_s = float_arg(args, "timeout_s", 0.6, 0.0, 10.0);
    let scroll = args
        .get("scroll")
        .and_then(Value::as_object)
        .cloned()
        .unwrap_or_else(|| {
            json!({"direction": "down", "amount": 600})
                .as_object()
                .cloned()
                .unwrap_or_default()
        });

    let mut repeat = Map::new();
    repeat.insert("max_iters".into(), json!(max_iters));
    repeat.insert("until".into(), Value::Object(until.clone()));
    repeat.insert("timeout_s".into(), json!(timeout_s));
    repeat.insert("steps".into(), json!([{"scroll": scroll}]));
    carry_backoff(args, &mut repeat);

    let plan = json!({
        "selector": until.get("selector"),
        "text": until.get("text"),
        "max_iters": max_iters,
        "scroll": scroll,
    });
    Ok((vec![json!({"repeat": repeat})], plan))
}

pub fn expand_scroll_to_end(
    args: &Map<String, Value>,
    _args_note: &Map<String, Value>,
) -> Result<(Vec<Value>, Value), MacroError> {
    let scroll = args
        .get("scroll")
        .and_then(Value::as_object)
        .cloned()
        .unwrap_or_else(|| {
            json!({"direction": "down", "amount": 700})
                .as_object()
                .cloned()
                .unwrap_or_default()
        });
    let max_iters = int_arg(args, "max_iters", 8, 1, 50);
    let timeout_s = float_arg(args, "timeout_s", 0.4, 0.0, 10.0);

    let until_js = args
        .get("until_js")
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .unwrap_or_else(|| DEFAULT_SCROLL_END_JS.to_string());
    let custom = until_js != DEFAULT_SCROLL_END_JS;

    let mut repeat = Map::new();
    repeat.insert("max_iters".into(), json!(max_iters));
    repeat.insert("until".into(), json!({"js": until_js}));
    repeat.insert("timeout_s".into(), json!(timeout_s));
    repeat.insert("steps".into(), json!([{"scroll": scroll}]));
    settle_backoff(args, &mut repeat);
    carry_backoff(args, &mut repeat);

    let plan = json!({
        "max_iters": max_iters,
        "scroll": scroll,
        "until_js": if custom { "custom" } else { "<default>" },
    });
    Ok((vec![json!({"repeat": repeat})], plan))
}

pub fn expand_retry_click(
    args: &Map<String, Value>,
    args_note: &Map<String, Value>,
) -> Result<(Vec<Value>, Value), MacroError> {
    let click = args
        .get("click")
        .and_then(Value::as_object)
        .filter(|m| !m.is_empty())
        .ok_or_else(|| {
            MacroError::new("Missing click args")
                .with_suggestion("Provide macro.args.click={text/selector/x,y/...}")
        })?;
    let until = args
        .get("until")
        .and_then(Value::as_object)
        .filter(|m| !m.is_empty())
        .ok_or_else(|| {
            MacroError::new("Missing until condition")
                .with_suggestion("Provide macro.args.until={url/title/selector/text}")
        })?;

    let max_iters = int_arg(args, "max_iters", 5, 1, 50);
    let timeout_s = float_arg(args, "timeout_s", 0.8, 0.0, 10.0);
    let dismiss = args
        .get("dismiss_overlays")
        .and_then(Value::as_bool)
        .unwrap_or(true);

    let mut body = Vec::new();
    if dismiss {
        body.push(json!({"macro": {"name": "dismiss_overlays"}}));
    }
    // Optional so the loop survives failed attempts; `until` is the
    // success signal.
    body.push(json!({"click": click, "optional": true, "label": "retry_click"}));

    let mut repeat = Map::new();
    repeat.insert("max_iters".into(), json!(max_iters));
    repeat.insert("until".into(), Value::Object(until.clone()));
    repeat.insert("timeout_s".into(), json!(timeout_s));
    repeat.insert("steps".into(), Value::Array(body));
    carry_backoff(args, &mut repeat);

    let plan = json!({
        "max_iters": max_iters,
        "timeout_s": timeout_s,
        "dismiss_overlays": dismiss,
        "click": plan_keys(args_note.get("click").and_then(Value::as_object).unwrap_or(click), 8),
        "until": plan_keys(args_note.get("until").and_then(Value::as_object).unwrap_or(until), 8),
    });
    Ok((vec![json!({"repeat": repeat})], plan))
}

fn paginate_done_js(selector: &str) -> String {
    let sel = serde_json::to_string(selector).unwrap_or_else(|_| "\"\"".into());
    format!(
        "(() => {{\
  const el = document.querySelector({sel});\
  if (!el) return true;\
  const aria = (el.getAttribute && el.getAttribute('aria-disabled')) || '';\
  return !!(el.disabled || el.hasAttribute('disabled') || aria === 'true' || el.classList.contains('disabled'));\
}})()"
    )
}

pub fn expand_paginate_next(
    args: &Map<String, Value>,
    args_note: &Map<String, Value>,
) -> Result<(Vec<Value>, Value), MacroError> {
    let next_selector = args
        .get("next_selector")
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .ok_or_else(|| {
            MacroError::new("Missing next_selector")
                .with_suggestion("Provide macro.args.next_selector (CSS selector for the Next button)")
        })?;

    let click = args
        .get("click")
        .and_then(Value::as_object)
        .filter(|m| !m.is_empty())
        .cloned()
        .unwrap_or_else(|| {
            let mut map = Map::new();
            map.insert("selector".into(), json!(next_selector));
            map
        });

    let until = args
        .get("until")
        .and_then(Value::as_object)
        .filter(|m| !m.is_empty())
        .cloned()
        .unwrap_or_else(|| {
            let mut map = Map::new();
            map.insert("js".into(), json!(paginate_done_js(next_selector)));
            map
        });

    let max_iters = int_arg(args, "max_iters", 10, 1, 50);
    let timeout_s = float_arg(args, "timeout_s", 0.8, 0.0, 10.0);
    let dismiss = args
        .get("dismiss_overlays")
        .and_then(Value::as_bool)
        .unwrap_or(true);

    let mut body = Vec::new();
    if dismiss {
        body.push(json!({"macro": {"name": "dismiss_overlays"}}));
    }
    body.push(json!({"click": click, "optional": true, "label": "paginate_next"}));
    let wait = args.get("wait").and_then(Value::as_object).cloned();
    if let Some(wait) = &wait {
        body.push(json!({"wait": wait}));
    }

    let mut repeat = Map::new();
    repeat.insert("max_iters".into(), json!(max_iters));
    repeat.insert("until".into(), Value::Object(until.clone()));
    repeat.insert("timeout_s".into(), json!(timeout_s));
    repeat.insert("steps".into(), Value::Array(body));
    settle_backoff(args, &mut repeat);
    carry_backoff(args, &mut repeat);

    let mut plan = json!({
        "next_selector": next_selector,
        "max_iters": max_iters,
        "timeout_s": timeout_s,
        "dismiss_overlays": dismiss,
        "click": plan_keys(args_note.get("click").and_then(Value::as_object).unwrap_or(&click), 8),
        "until": plan_keys(args_note.get("until").and_then(Value::as_object).unwrap_or(&until), 8),
    });
    if let Some(wait) = &wait {
        plan["wait"] = json!(plan_keys(wait, 6));
    }
    Ok((vec![json!({"repeat": repeat})], plan))
}

/// Probe/click JS shared by `auto_expand`. With `do_click=false` it
/// evaluates to `true` when nothing expandable is left (the `until`
/// condition); with `do_click=true` it clicks a bounded batch.
pub(crate) fn auto_expand_js(
    phrases: &[String],
    selectors: &str,
    include_links: bool,
    max_clicks: i64,
    do_click: bool,
) -> String {
    let phrases_json = serde_json::to_string(
        &phrases
            .iter()
            .map(|p| p.to_ascii_lowercase())
            .collect::<Vec<_>>(),
    )
    .unwrap_or_else(|_| "[]".into());
    let selectors_json = serde_json::to_string(selectors).unwrap_or_else(|_| "\"\"".into());
    format!(
        "(() => {{\
  const phrases = {phrases_json};\
  const selector = {selectors_json};\
  const includeLinks = {include_links};\
  const maxClicks = {max_clicks};\
  const doClick = {do_click};\
  const norm = (s) => (s || '').replace(/\\s+/g, ' ').trim().toLowerCase();\
  const matches = (el) => {{\
    const hay = norm(el.textContent || '') || norm(el.getAttribute && el.getAttribute('aria-label')) || norm(el.getAttribute && el.getAttribute('title'));\
    if (!hay) return false;\
    return phrases.some((p) => hay.includes(p));\
  }};\
  const isVisible = (el) => {{\
    if (!el) return false;\
    const style = window.getComputedStyle(el);\
    if (style && (style.visibility === 'hidden' || style.display === 'none')) return false;\
    const rects = el.getClientRects();\
    return !!(rects && rects.length);\
  }};\
  const isDisabled = (el) => !!(el.disabled || (el.getAttribute && el.getAttribute('aria-disabled')) === 'true');\
  const allowLink = (el) => {{\
    if (el.tagName !== 'A') return true;\
    if (!includeLinks) return false;\
    const href = (el.getAttribute('href') || '').trim().toLowerCase();\
    if (!href || href.startsWith('#') || href.startsWith('javascript:')) return true;\
    return (el.getAttribute('role') || '').toLowerCase() === 'button';\
  }};\
  const hasExpandHints = (el) => {{\
    const ariaExpanded = el.getAttribute && el.getAttribute('aria-expanded');\
    if (ariaExpanded === 'false') return true;\
    if (ariaExpanded === 'true') return false;\
    if (el.getAttribute && el.getAttribute('aria-controls')) return true;\
    const tokens = ['expand', 'collapse', 'collapsed', 'show', 'more', 'toggle', 'open'];\
    const names = el.getAttributeNames ? el.getAttributeNames() : [];\
    for (const name of names) {{\
      if (!name.startsWith('data-')) continue;\
      const lower = name.toLowerCase();\
      if (tokens.some((t) => lower.includes(t))) return true;\
      const val = norm(el.getAttribute(name));\
      if (val && tokens.some((t) => val.includes(t))) return true;\
    }}\
    return false;\
  }};\
  const nodes = Array.from(document.querySelectorAll(selector));\
  let count = 0;\
  let clicked = 0;\
  for (const el of nodes) {{\
    if (!isVisible(el) || isDisabled(el)) continue;\
    if (el.dataset && el.dataset.mcpExpanded === '1') continue;\
    if (!allowLink(el)) continue;\
    if (!matches(el) && !hasExpandHints(el)) continue;\
    if (el.tagName === 'DETAILS') {{\
      count += 1;\
      if (doClick && !el.open && clicked < maxClicks) {{\
        el.open = true;\
        clicked += 1;\
        try {{ el.dataset.mcpExpanded = '1'; }} catch (e) {{}}\
      }}\
      continue;\
    }}\
    if ((el.getAttribute && el.getAttribute('aria-expanded')) === 'true') continue;\
    count += 1;\
    if (doClick && clicked < maxClicks) {{\
      try {{ el.click(); }} catch (e) {{}}\
      clicked += 1;\
      try {{ el.dataset.mcpExpanded = '1'; }} catch (e) {{}}\
    }}\
  }}\
  if (!doClick) return count === 0;\
  return {{clicked, total: count}};\
}})()"
    )
}

pub fn expand_auto_expand(
    args: &Map<String, Value>,
    _args_note: &Map<String, Value>,
) -> Result<(Vec<Value>, Value), MacroError> {
    let phrases = {
        let listed = as_str_list(args.get("phrases"));
        if listed.is_empty() {
            DEFAULT_EXPAND_PHRASES
                .iter()
                .map(|s| s.to_string())
                .collect()
        } else {
            listed
        }
    };
    let selectors = match args.get("selectors") {
        Some(Value::String(s)) if !s.trim().is_empty() => s.trim().to_string(),
        Some(Value::Array(_)) => {
            let joined = as_str_list(args.get("selectors")).join(", ");
            if joined.is_empty() {
                DEFAULT_EXPAND_SELECTORS.to_string()
            } else {
                joined
            }
        }
        _ => DEFAULT_EXPAND_SELECTORS.to_string(),
    };
    let include_links = args
        .get("include_links")
        .and_then(Value::as_bool)
        .unwrap_or(false);
    let max_clicks = int_arg(args, "click_limit", 6, 1, 40);
    let max_iters = int_arg(args, "max_iters", 6, 1, 50);
    let timeout_s = float_arg(args, "timeout_s", 0.4, 0.0, 10.0);

    let probe = auto_expand_js(&phrases, &selectors, include_links, max_clicks, false);
    let click_batch = auto_expand_js(&phrases, &selectors, include_links, max_clicks, true);

    let mut body = vec![json!({"js": {"code": click_batch}, "optional": true, "label": "auto_expand"})];
    if let Some(wait) = args.get("wait").and_then(Value::as_object) {
        body.push(json!({"wait": wait}));
    }

    let mut repeat = Map::new();
    repeat.insert("max_iters".into(), json!(max_iters));
    repeat.insert("until".into(), json!({"js": probe}));
    repeat.insert("timeout_s".into(), json!(timeout_s));
    repeat.insert("steps".into(), Value::Array(body));
    settle_backoff(args, &mut repeat);
    carry_backoff(args, &mut repeat);

    let plan = json!({
        "phrases": phrases.len(),
        "include_links": include_links,
        "click_limit": max_clicks,
        "max_iters": max_iters,
    });
    Ok((vec![json!({"repeat": repeat})], plan))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(value: Value) -> Map<String, Value> {
        value.as_object().cloned().unwrap_or_default()
    }

    #[test]
    fn scroll_until_visible_builds_repeat() {
        let (steps, plan) =
            expand_scroll_until_visible(&args(json!({"selector": "#done", "max_iters": 99})), &Map::new())
                .unwrap();
        assert_eq!(steps.len(), 1);
        let repeat = &steps[0]["repeat"];
        assert_eq!(repeat["max_iters"], json!(50), "max_iters is clamped");
        assert_eq!(repeat["until"]["selector"], json!("#done"));
        assert_eq!(repeat["steps"][0]["scroll"]["direction"], json!("down"));
        assert_eq!(plan["max_iters"], json!(50));
    }

    #[test]
    fn scroll_until_visible_needs_a_target() {
        assert!(expand_scroll_until_visible(&args(json!({})), &Map::new()).is_err());
    }

    #[test]
    fn scroll_to_end_defaults_backoff_from_settle_ms() {
        let (steps, _) =
            expand_scroll_to_end(&args(json!({"settle_ms": 500})), &Map::new()).unwrap();
        let repeat = &steps[0]["repeat"];
        assert_eq!(repeat["backoff_s"], json!(0.5));
        assert!(repeat["until"]["js"].as_str().unwrap().contains("scrollHeight"));
    }

    #[test]
    fn retry_click_is_optional_and_guarded() {
        let (steps, plan) = expand_retry_click(
            &args(json!({"click": {"selector": "#go"}, "until": {"url": "done"}})),
            &Map::new(),
        )
        .unwrap();
        let body = steps[0]["repeat"]["steps"].as_array().unwrap();
        assert_eq!(body[0]["macro"]["name"], json!("dismiss_overlays"));
        assert_eq!(body[1]["optional"], json!(true));
        // Plan leaks keys only, not values.
        assert_eq!(plan["click"], json!(["selector"]));
    }

    #[test]
    fn paginate_next_defaults_until_to_disabled_probe() {
        let (steps, _) = expand_paginate_next(
            &args(json!({"next_selector": ".next", "dismiss_overlays": false})),
            &Map::new(),
        )
        .unwrap();
        let repeat = &steps[0]["repeat"];
        let until_js = repeat["until"]["js"].as_str().unwrap();
        assert!(until_js.contains("aria-disabled"));
        let body = repeat["steps"].as_array().unwrap();
        assert_eq!(body.len(), 1);
        assert_eq!(body[0]["click"]["selector"], json!(".next"));
    }

    #[test]
    fn auto_expand_probe_and_batch_share_config() {
        let (steps, plan) = expand_auto_expand(
            &args(json!({"phrases": ["More"], "click_limit": 3})),
            &Map::new(),
        )
        .unwrap();
        let repeat = &steps[0]["repeat"];
        let probe = repeat["until"]["js"].as_str().unwrap();
        let batch = repeat["steps"][0]["js"]["code"].as_str().unwrap();
        assert!(probe.contains("\"more\""));
        assert!(batch.contains("\"more\""));
        assert!(probe.contains("const doClick = false"));
        assert!(batch.contains("const doClick = true"));
        assert_eq!(plan["click_limit"], json!(3));
    }
}

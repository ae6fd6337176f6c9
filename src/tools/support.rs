//! Shared helpers for the concrete tool handlers.

use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Value};

use browsermcp_core_types::{ErrorKind, ToolError, ToolResult};
use browsermcp_registry::ToolCtx;
use cdp_adapter::PageSession;

/// Character budget before a payload moves off-context into an artifact.
pub const COGNITIVE_BUDGET_CHARS: usize = 8_000;

/// Open (or reuse) the active session with telemetry enabled and the raw
/// event queue drained.
pub async fn page_session(
    ctx: &ToolCtx,
    tool: &str,
) -> Result<(Arc<dyn PageSession>, String), ToolResult> {
    match ctx.sessions.get_or_open(&ctx.config).await {
        Ok((session, target)) => {
            ctx.sessions.ensure_telemetry(&session).await;
            ctx.sessions.drain_and_ingest(&session);
            Ok((session, target.id))
        }
        Err(err) => Err(ToolResult::failure(
            ToolError::new(ErrorKind::CdpBrick, err.to_string())
                .with_tool(tool)
                .with_suggestion("Try browser(action=\"recover\") or change MCP_BROWSER_PORT"),
        )),
    }
}

/// Refuse page-evaluating work while a blocking JS dialog is open.
pub fn dialog_guard(ctx: &ToolCtx, tab_id: &str, tool: &str) -> Option<ToolResult> {
    let telemetry = ctx.sessions.get_telemetry(tab_id)?;
    if !telemetry.dialog_open() {
        return None;
    }
    let dialog = telemetry.dialog_last().unwrap_or(Value::Null);
    Some(ToolResult::failure(
        ToolError::new(ErrorKind::DialogBlock, "Blocking JS dialog is open")
            .with_tool(tool)
            .with_suggestion("Handle the dialog first: dialog(accept=true) or dialog(accept=false)")
            .with_details(json!({
                "type": dialog.get("type").cloned().unwrap_or(Value::Null),
                "message": dialog.get("message").cloned().unwrap_or(Value::Null),
            })),
    ))
}

pub fn args_obj(args: &Value) -> serde_json::Map<String, Value> {
    args.as_object().cloned().unwrap_or_default()
}

pub fn arg_str<'a>(args: &'a serde_json::Map<String, Value>, key: &str) -> Option<&'a str> {
    args.get(key).and_then(Value::as_str).map(str::trim).filter(|s| !s.is_empty())
}

pub fn arg_f64(args: &serde_json::Map<String, Value>, key: &str, default: f64) -> f64 {
    args.get(key)
        .and_then(|v| v.as_f64().or_else(|| v.as_str().and_then(|s| s.trim().parse().ok())))
        .unwrap_or(default)
}

pub fn arg_bool(args: &serde_json::Map<String, Value>, key: &str, default: bool) -> bool {
    args.get(key).and_then(Value::as_bool).unwrap_or(default)
}

pub fn eval_deadline(timeout_s: f64) -> Duration {
    Duration::from_secs_f64(timeout_s.clamp(0.2, 300.0))
}

/// Park a large text payload as an artifact and return a summary + hint.
pub fn offload_large_text(
    ctx: &ToolCtx,
    kind: &str,
    text: String,
    mime_type: &str,
    mut payload: Value,
) -> Value {
    use artifact_store::artifact_get_hint;

    if text.len() <= COGNITIVE_BUDGET_CHARS {
        payload["content"] = json!(text);
        return payload;
    }

    let total = text.len();
    let head: String = {
        let mut cut = 800.min(text.len());
        while cut > 0 && !text.is_char_boundary(cut) {
            cut -= 1;
        }
        text[..cut].to_string()
    };
    let reference = ctx
        .artifacts
        .put_text(kind, text, mime_type, json!({"chars": total}));
    payload["preview"] = json!(head);
    payload["truncated"] = json!(true);
    payload["artifact"] = json!({
        "id": reference.id.clone(),
        "kind": reference.kind.clone(),
        "mimeType": reference.mime_type.clone(),
        "bytes": reference.bytes,
    });
    payload["next"] = json!([artifact_get_hint(&reference.id, 0, 4000)]);
    payload
}

/// JS: locate one element's viewport center. Returns
/// `{x, y, matchesFound}` or `{error, matchesFound}`.
pub fn element_center_js(selector: Option<&str>, text: Option<&str>, index: Option<usize>) -> String {
    let selector_json = serde_json::to_string(&selector).unwrap_or_else(|_| "null".into());
    let text_json = serde_json::to_string(&text).unwrap_or_else(|_| "null".into());
    let index_json = index.map(|i| i.to_string()).unwrap_or_else(|| "null".into());
    format!(
        r#"(() => {{
  const selector = {selector_json};
  const text = {text_json};
  const index = {index_json};
  const visible = (el) => {{
    if (!el || !el.getBoundingClientRect) return false;
    const r = el.getBoundingClientRect();
    if (!r || r.width < 1 || r.height < 1) return false;
    const st = window.getComputedStyle(el);
    return !(st && (st.display === 'none' || st.visibility === 'hidden'));
  }};
  let candidates = [];
  if (selector) {{
    candidates = Array.from(document.querySelectorAll(selector)).filter(visible);
  }} else if (text) {{
    const needle = text.replace(/\s+/g, ' ').trim().toLowerCase();
    const all = document.querySelectorAll('a, button, [role=button], input, summary, label, [onclick], [tabindex]');
    for (const el of all) {{
      if (!visible(el)) continue;
      const hay = ((el.innerText || el.textContent || '') + ' ' + (el.getAttribute('aria-label') || '') + ' ' + (el.value || ''))
        .replace(/\s+/g, ' ').trim().toLowerCase();
      if (hay && hay.includes(needle)) candidates.push(el);
    }}
  }}
  const matchesFound = candidates.length;
  if (!matchesFound) return {{error: 'Element not found', matchesFound}};
  let pick = 0;
  if (index !== null) {{
    if (index < 0 || index >= matchesFound) return {{error: 'Index out of range', matchesFound}};
    pick = index;
  }}
  const r = candidates[pick].getBoundingClientRect();
  return {{
    x: Math.max(1, r.left + r.width / 2),
    y: Math.max(1, r.top + r.height / 2),
    matchesFound,
  }};
}})()"#
    )
}

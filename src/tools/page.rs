//! `page`: perception surface. Every detail returns a bounded structure
//! with a `cursor` and counters; `map`/`locators` also refresh the
//! affordance registry so `act(ref=...)` stays cheap.

use std::time::Duration;

use serde_json::{json, Value};

use browsermcp_core_types::{ErrorKind, ToolError, ToolResult};
use browsermcp_registry::ToolCtx;
use session_center::{affordance_ref, AffordanceItem};

use super::support::{arg_str, args_obj, dialog_guard, offload_large_text, page_session};

pub async fn page(ctx: ToolCtx, args: Value) -> ToolResult {
    let args = args_obj(&args);
    let detail = if args.get("info").and_then(Value::as_bool).unwrap_or(false) {
        "info"
    } else {
        arg_str(&args, "detail").unwrap_or("info")
    };

    let (session, tab_id) = match page_session(&ctx, "page").await {
        Ok(pair) => pair,
        Err(err) => return err,
    };
    if let Some(blocked) = dialog_guard(&ctx, &tab_id, "page") {
        return blocked;
    }

    let since = args.get("since").and_then(Value::as_i64);
    let offset = args.get("offset").and_then(Value::as_u64).unwrap_or(0) as usize;
    let limit = args
        .get("limit")
        .and_then(Value::as_u64)
        .unwrap_or(30)
        .min(200) as usize;

    let info = session
        .eval_js(
            "({url: location.href, title: document.title, readyState: document.readyState})",
            Duration::from_secs(3),
        )
        .await
        .unwrap_or(Value::Null);
    if let Some(url) = info.get("url").and_then(Value::as_str) {
        session.set_tab_url(url.to_string());
    }

    let snap = ctx
        .sessions
        .tier0_snapshot(&tab_id, since, offset, limit)
        .map(|s| s.to_value())
        .unwrap_or(json!({}));
    let cursor = snap.get("cursor").cloned().unwrap_or(Value::Null);
    let summary = snap.get("summary").cloned().unwrap_or(json!({}));

    match detail {
        "info" => ToolResult::json(json!({
            "ok": true,
            "tool": "page",
            "cursor": cursor,
            "pageInfo": info,
            "summary": summary,
        })),

        "triage" => {
            let mut top: Vec<Value> = Vec::new();
            if snap.get("dialogOpen") == Some(&json!(true)) {
                top.push(json!({"severity": "error", "kind": "dialog_open", "dialog": snap.get("dialog")}));
            }
            if let Some(last_error) = summary.get("lastError").and_then(Value::as_str) {
                top.push(json!({"severity": "error", "kind": "js_error", "message": last_error}));
            }
            for failed in snap
                .get("network")
                .and_then(Value::as_array)
                .into_iter()
                .flatten()
                .take(3)
            {
                top.push(json!({"severity": "error", "kind": "failed_request", "request": failed}));
            }
            ToolResult::json(json!({
                "ok": true,
                "tool": "page",
                "cursor": cursor,
                "triage": {
                    "page": {"url": info.get("url"), "title": info.get("title")},
                    "summary": summary,
                    "top": top,
                },
            }))
        }

        "diagnostics" => ToolResult::json(json!({
            "ok": true,
            "tool": "page",
            "cursor": cursor,
            "diagnostics": {
                "page": {"url": info.get("url"), "title": info.get("title"), "readyState": info.get("readyState")},
                "summary": summary,
                "console": snap.get("console").cloned().unwrap_or(json!([])),
                "network": snap.get("network").cloned().unwrap_or(json!([])),
                "harLite": snap.get("harLite").cloned().unwrap_or(json!([])),
                "dialogOpen": snap.get("dialogOpen").cloned().unwrap_or(json!(false)),
            },
        })),

        "audit" => {
            // Structure + accessibility + resource rollup in one pass.
            let audit_probe = r#"(() => {
  const counts = {
    links: document.querySelectorAll('a[href]').length,
    buttons: document.querySelectorAll('button, [role=button]').length,
    inputs: document.querySelectorAll('input, textarea, select').length,
    forms: document.forms.length,
    iframes: document.querySelectorAll('iframe').length,
    imagesMissingAlt: Array.from(document.images).filter((i) => !i.alt).length,
  };
  const headings = Array.from(document.querySelectorAll('h1, h2, h3')).slice(0, 12)
    .map((h) => ({level: h.tagName.toLowerCase(), text: (h.innerText || '').trim().slice(0, 120)}));
  const lang = document.documentElement.getAttribute('lang') || null;
  return {counts, headings, lang};
})()"#;
            let structure = session
                .eval_js(audit_probe, Duration::from_secs(5))
                .await
                .unwrap_or(Value::Null);
            ToolResult::json(json!({
                "ok": true,
                "tool": "page",
                "cursor": cursor,
                "audit": {
                    "page": {"url": info.get("url"), "title": info.get("title")},
                    "structure": structure,
                    "summary": summary,
                    "resources": {
                        "harLiteCount": snap.get("harLite").and_then(Value::as_array).map(Vec::len).unwrap_or(0),
                    },
                },
            }))
        }

        "map" | "locators" => {
            let kind_filter = arg_str(&args, "kind").unwrap_or("all");
            let items = collect_affordances(&ctx, &session, &tab_id, kind_filter, limit.max(30)).await;
            let items = match items {
                Ok(items) => items,
                Err(err) => return err,
            };

            let rows: Vec<Value> = items
                .iter()
                .map(|item| {
                    json!({
                        "ref": item.ref_id.clone(),
                        "tool": item.tool.clone(),
                        "args": item.args.clone(),
                        "meta": item.meta.clone(),
                    })
                })
                .collect();

            if detail == "map" {
                ToolResult::json(json!({
                    "ok": true,
                    "tool": "page",
                    "cursor": cursor,
                    "map": {
                        "page": {"url": info.get("url"), "title": info.get("title")},
                        "summary": summary,
                        "count": rows.len(),
                        "actions": rows,
                    },
                }))
            } else {
                ToolResult::json(json!({
                    "ok": true,
                    "tool": "page",
                    "cursor": cursor,
                    "locators": {"count": rows.len(), "items": rows},
                }))
            }
        }

        "graph" => {
            let frame_tree = session
                .send_with_deadline("Page.getFrameTree", json!({}), Duration::from_secs(5))
                .await
                .unwrap_or(Value::Null);
            let mut nodes = Vec::new();
            let mut edges = Vec::new();
            collect_frames(frame_tree.get("frameTree"), None, &mut nodes, &mut edges);
            let link_probe = r#"Array.from(new Set(Array.from(document.querySelectorAll('a[href]'))
  .map((a) => { try { return new URL(a.href).origin; } catch (e) { return null; } })
  .filter(Boolean))).slice(0, 20)"#;
            let origins = session
                .eval_js(link_probe, Duration::from_secs(5))
                .await
                .unwrap_or(json!([]));
            ToolResult::json(json!({
                "ok": true,
                "tool": "page",
                "cursor": cursor,
                "graph": {
                    "page": {"url": info.get("url")},
                    "frames": {"nodes": nodes, "edges": edges},
                    "linkedOrigins": origins,
                },
            }))
        }

        other => ToolResult::failure(
            ToolError::new(ErrorKind::Validation, format!("Unknown page detail: {other}"))
                .with_tool("page")
                .with_suggestion(
                    "Use detail='info'|'triage'|'diagnostics'|'audit'|'map'|'graph'|'locators'",
                ),
        ),
    }
}

fn collect_frames(
    frame_tree: Option<&Value>,
    parent: Option<&str>,
    nodes: &mut Vec<Value>,
    edges: &mut Vec<Value>,
) {
    let Some(tree) = frame_tree else {
        return;
    };
    let Some(frame) = tree.get("frame") else {
        return;
    };
    let id = frame.get("id").and_then(Value::as_str).unwrap_or("");
    nodes.push(json!({"id": id, "url": frame.get("url")}));
    if let Some(parent) = parent {
        edges.push(json!({"from": parent, "to": id}));
    }
    for child in tree
        .get("childFrames")
        .and_then(Value::as_array)
        .into_iter()
        .flatten()
    {
        collect_frames(Some(child), Some(id), nodes, edges);
    }
}

/// Scan the page for actionable elements and refresh the affordance
/// registry with stable refs.
async fn collect_affordances(
    ctx: &ToolCtx,
    session: &std::sync::Arc<dyn cdp_adapter::PageSession>,
    tab_id: &str,
    kind_filter: &str,
    limit: usize,
) -> Result<Vec<AffordanceItem>, ToolResult> {
    let probe = format!(
        r#"(() => {{
  const limit = {limit};
  const out = [];
  const norm = (s) => (s || '').replace(/\s+/g, ' ').trim();
  const visible = (el) => {{
    const r = el.getBoundingClientRect ? el.getBoundingClientRect() : null;
    if (!r || r.width < 2 || r.height < 2) return false;
    const st = window.getComputedStyle(el);
    return !(st && (st.display === 'none' || st.visibility === 'hidden'));
  }};
  const kindOf = (el) => {{
    const tag = el.tagName.toLowerCase();
    if (tag === 'a') return 'link';
    if (tag === 'input' || tag === 'textarea' || tag === 'select') return 'input';
    return 'button';
  }};
  const selectorFor = (el) => {{
    if (el.id) return '#' + CSS.escape(el.id);
    const tag = el.tagName.toLowerCase();
    if (el.name) return tag + '[name="' + el.name + '"]';
    const cls = (el.className && typeof el.className === 'string')
      ? el.className.split(/\s+/).filter(Boolean).slice(0, 2) : [];
    let sel = tag + cls.map((c) => '.' + CSS.escape(c)).join('');
    const siblings = document.querySelectorAll(sel);
    if (siblings.length > 1) {{
      const idx = Array.from(siblings).indexOf(el);
      sel = sel + ':nth-of-type(' + (idx + 1) + ')';
    }}
    return sel;
  }};
  const nodes = document.querySelectorAll('a[href], button, [role=button], input, textarea, select, summary');
  for (const el of nodes) {{
    if (out.length >= limit) break;
    if (!visible(el)) continue;
    const kind = kindOf(el);
    const text = norm(el.innerText || el.value || el.placeholder || el.getAttribute('aria-label') || '').slice(0, 120);
    out.push({{kind, text, selector: selectorFor(el)}});
  }}
  return out;
}})()"#,
    );

    let scanned = session
        .eval_js(&probe, Duration::from_secs(8))
        .await
        .map_err(|err| {
            ToolResult::failure(
                ToolError::new(ErrorKind::CdpBrick, err.to_string()).with_tool("page"),
            )
        })?;

    let url = session.tab_url();
    let mut items = Vec::new();
    for row in scanned.as_array().into_iter().flatten() {
        let kind = row.get("kind").and_then(Value::as_str).unwrap_or("button");
        if kind_filter != "all" && kind != kind_filter {
            continue;
        }
        let selector = row.get("selector").and_then(Value::as_str).unwrap_or("");
        if selector.is_empty() {
            continue;
        }
        let text = row.get("text").and_then(Value::as_str).unwrap_or("");

        // Inputs resolve to a focus+type seam; everything else clicks.
        let (tool, tool_args) = if kind == "input" {
            ("type", json!({"selector": selector, "text": ""}))
        } else {
            ("click", json!({"selector": selector}))
        };
        let ref_id = affordance_ref(&url, tool, &tool_args, Some(text));
        items.push(AffordanceItem {
            ref_id,
            tool: tool.to_string(),
            args: tool_args,
            meta: json!({"kind": kind, "text": text}),
        });
    }

    let cursor = ctx
        .sessions
        .get_telemetry(tab_id)
        .map(|t| t.cursor())
        .unwrap_or(0);
    ctx.sessions
        .set_affordances(tab_id, items.clone(), url, cursor);
    Ok(items)
}

pub async fn extract_content(ctx: ToolCtx, args: Value) -> ToolResult {
    let args = args_obj(&args);
    let (session, tab_id) = match page_session(&ctx, "extract_content").await {
        Ok(pair) => pair,
        Err(err) => return err,
    };
    if let Some(blocked) = dialog_guard(&ctx, &tab_id, "extract_content") {
        return blocked;
    }

    let mode = arg_str(&args, "mode").unwrap_or("article");
    let selector = arg_str(&args, "selector");
    let max_chars = args
        .get("max_chars")
        .and_then(Value::as_u64)
        .unwrap_or(200_000)
        .min(2_000_000) as usize;

    let scope = serde_json::to_string(&selector).unwrap_or_else(|_| "null".into());
    let code = match mode {
        "html" => format!(
            "(() => {{ const root = {scope} ? document.querySelector({scope}) : document.documentElement; return root ? root.outerHTML : null; }})()"
        ),
        "text" => format!(
            "(() => {{ const root = {scope} ? document.querySelector({scope}) : document.body; return root ? root.innerText : null; }})()"
        ),
        // article: main content heuristics before falling back to body.
        _ => format!(
            "(() => {{ const root = {scope} ? document.querySelector({scope}) : (document.querySelector('article, main, [role=main]') || document.body); return root ? root.innerText : null; }})()"
        ),
    };

    let extracted = match session.eval_js(&code, Duration::from_secs(10)).await {
        Ok(Value::String(text)) => text,
        Ok(Value::Null) => {
            return ToolResult::failure(
                ToolError::new(ErrorKind::UiTransient, "Element not found")
                    .with_tool("extract_content"),
            );
        }
        Ok(other) => other.to_string(),
        Err(err) => {
            return ToolResult::failure(
                ToolError::new(ErrorKind::CdpBrick, err.to_string()).with_tool("extract_content"),
            );
        }
    };

    let mut text = extracted;
    if text.len() > max_chars {
        let mut cut = max_chars;
        while cut > 0 && !text.is_char_boundary(cut) {
            cut -= 1;
        }
        text.truncate(cut);
    }

    let chars = text.len();
    let payload = offload_large_text(
        &ctx,
        "extracted_content",
        text,
        if mode == "html" { "text/html" } else { "text/plain" },
        json!({
            "ok": true,
            "tool": "extract_content",
            "mode": mode,
            "chars": chars,
            "url": session.tab_url(),
        }),
    );
    ToolResult::json(payload)
}

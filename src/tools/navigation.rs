//! `navigate` and `wait`.

use std::time::{Duration, Instant};

use serde_json::{json, Value};

use browsermcp_core_types::{ErrorKind, ToolError, ToolResult};
use browsermcp_registry::ToolCtx;

use super::support::{arg_f64, arg_str, args_obj, dialog_guard, eval_deadline, page_session};

pub async fn navigate(ctx: ToolCtx, args: Value) -> ToolResult {
    let args = args_obj(&args);
    let (session, tab_id) = match page_session(&ctx, "navigate").await {
        Ok(pair) => pair,
        Err(err) => return err,
    };
    if let Some(blocked) = dialog_guard(&ctx, &tab_id, "navigate") {
        return blocked;
    }

    let wait = arg_str(&args, "wait").unwrap_or("load");
    let timeout_s = arg_f64(&args, "timeout", 20.0).clamp(0.5, 120.0);

    if let Some(action) = arg_str(&args, "action") {
        let code = match action {
            "back" => "history.back()",
            "forward" => "history.forward()",
            "reload" => "location.reload()",
            other => {
                return ToolResult::failure(
                    ToolError::new(ErrorKind::Validation, format!("Unknown navigate action: {other}"))
                        .with_tool("navigate")
                        .with_suggestion("Use action='back'|'forward'|'reload' or url='https://...'"),
                );
            }
        };
        if let Err(err) = session.eval_js(code, Duration::from_secs(5)).await {
            return ToolResult::failure(
                ToolError::new(ErrorKind::ToolFailure, err.to_string()).with_tool("navigate"),
            );
        }
    } else if let Some(url) = arg_str(&args, "url") {
        let result = session
            .send_with_deadline("Page.navigate", json!({"url": url}), Duration::from_secs(10))
            .await;
        match result {
            Ok(resp) => {
                if let Some(error_text) = resp.get("errorText").and_then(Value::as_str) {
                    if !error_text.is_empty() {
                        return ToolResult::failure(
                            ToolError::new(
                                ErrorKind::ToolFailure,
                                format!("Navigation failed: {error_text}"),
                            )
                            .with_tool("navigate"),
                        );
                    }
                }
                session.set_tab_url(url.to_string());
            }
            Err(err) => {
                return ToolResult::failure(
                    ToolError::new(ErrorKind::CdpBrick, err.to_string()).with_tool("navigate"),
                );
            }
        }
    } else {
        return ToolResult::failure(
            ToolError::new(ErrorKind::Validation, "Missing url or action")
                .with_tool("navigate")
                .with_suggestion("Provide url='https://...' or action='back'|'forward'|'reload'"),
        );
    }

    if wait != "none" {
        wait_ready(&ctx, &session, wait, timeout_s).await;
    }

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

    ToolResult::json(json!({
        "ok": true,
        "tool": "navigate",
        "pageInfo": info,
        "waited": wait,
    }))
}

async fn wait_ready(
    ctx: &ToolCtx,
    session: &std::sync::Arc<dyn cdp_adapter::PageSession>,
    wait: &str,
    timeout_s: f64,
) {
    let wanted = match wait {
        "domcontentloaded" => "interactive",
        _ => "complete",
    };
    let deadline = Instant::now() + Duration::from_secs_f64(timeout_s);
    while Instant::now() < deadline {
        ctx.sessions.drain_and_ingest(session);
        if ctx
            .sessions
            .get_telemetry(&session.tab_id())
            .map(|t| t.dialog_open())
            .unwrap_or(false)
        {
            return;
        }
        let state = session
            .eval_js("document.readyState", Duration::from_secs(2))
            .await
            .ok()
            .and_then(|v| v.as_str().map(str::to_string))
            .unwrap_or_default();
        if state == "complete" || state == wanted {
            // networkidle additionally wants a short quiet window.
            if wait != "networkidle" {
                return;
            }
            tokio::time::sleep(Duration::from_millis(400)).await;
            return;
        }
        tokio::time::sleep(Duration::from_millis(150)).await;
    }
}

pub async fn wait(ctx: ToolCtx, args: Value) -> ToolResult {
    let args = args_obj(&args);
    let what = arg_str(&args, "for").unwrap_or("time");
    let timeout_s = arg_f64(&args, "timeout", 5.0).clamp(0.0, 120.0);

    if what == "time" {
        tokio::time::sleep(Duration::from_secs_f64(timeout_s.min(60.0))).await;
        return ToolResult::json(json!({"ok": true, "tool": "wait", "for": "time", "success": true}));
    }

    let (session, tab_id) = match page_session(&ctx, "wait").await {
        Ok(pair) => pair,
        Err(err) => return err,
    };

    let deadline = Instant::now() + Duration::from_secs_f64(timeout_s);
    loop {
        ctx.sessions.drain_and_ingest(&session);
        if ctx
            .sessions
            .get_telemetry(&tab_id)
            .map(|t| t.dialog_open())
            .unwrap_or(false)
        {
            return ToolResult::json(json!({
                "ok": true,
                "tool": "wait",
                "for": what,
                "success": false,
                "reason": "dialog_open",
                "suggestion": "Handle the dialog first: dialog(accept=true) or dialog(accept=false)",
            }));
        }

        let probe = match what {
            "element" => {
                let Some(selector) = arg_str(&args, "selector") else {
                    return ToolResult::failure(
                        ToolError::new(ErrorKind::Validation, "Missing selector")
                            .with_tool("wait")
                            .with_suggestion("Provide selector='...' with for='element'"),
                    );
                };
                let sel = serde_json::to_string(selector).unwrap_or_default();
                format!("!!document.querySelector({sel})")
            }
            "text" => {
                let Some(text) = arg_str(&args, "text") else {
                    return ToolResult::failure(
                        ToolError::new(ErrorKind::Validation, "Missing text")
                            .with_tool("wait")
                            .with_suggestion("Provide text='...' with for='text'"),
                    );
                };
                let needle = serde_json::to_string(&text.to_lowercase()).unwrap_or_default();
                match arg_str(&args, "selector") {
                    Some(selector) => {
                        let sel = serde_json::to_string(selector).unwrap_or_default();
                        format!(
                            "(() => {{ const el = document.querySelector({sel}); return !!(el && (el.innerText || '').toLowerCase().includes({needle})); }})()"
                        )
                    }
                    None => format!(
                        "((document.body && document.body.innerText) || '').toLowerCase().includes({needle})"
                    ),
                }
            }
            "navigation" | "networkidle" => "document.readyState === 'complete'".to_string(),
            other => {
                return ToolResult::failure(
                    ToolError::new(ErrorKind::Validation, format!("Unknown wait target: {other}"))
                        .with_tool("wait")
                        .with_suggestion(
                            "Use for='time'|'element'|'text'|'navigation'|'networkidle'",
                        ),
                );
            }
        };

        let hit = session
            .eval_js(&probe, eval_deadline(2.0))
            .await
            .ok()
            .and_then(|v| v.as_bool())
            .unwrap_or(false);
        if hit {
            let found = what == "element";
            let mut payload = json!({"ok": true, "tool": "wait", "for": what, "success": true});
            if found {
                payload["found"] = json!(true);
            }
            return ToolResult::json(payload);
        }

        if Instant::now() >= deadline {
            let mut payload = json!({
                "ok": true,
                "tool": "wait",
                "for": what,
                "success": false,
                "timedOut": true,
            });
            if what == "element" {
                payload["found"] = json!(false);
            }
            return ToolResult::json(payload);
        }
        tokio::time::sleep(Duration::from_millis(150)).await;
    }
}

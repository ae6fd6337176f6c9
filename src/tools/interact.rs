//! Interaction tools: `click`, `type`, `scroll`, `mouse`, `resize`.

use std::time::Duration;

use serde_json::{json, Value};

use browsermcp_core_types::{ErrorKind, ToolError, ToolResult};
use browsermcp_registry::ToolCtx;

use super::support::{
    arg_bool, arg_f64, arg_str, args_obj, dialog_guard, element_center_js, page_session,
};

pub async fn click(ctx: ToolCtx, args: Value) -> ToolResult {
    let args = args_obj(&args);
    let (session, tab_id) = match page_session(&ctx, "click").await {
        Ok(pair) => pair,
        Err(err) => return err,
    };
    if let Some(blocked) = dialog_guard(&ctx, &tab_id, "click") {
        return blocked;
    }

    // Affordance refs resolve to a concrete spec first.
    if let Some(ref_id) = arg_str(&args, "ref") {
        let (resolved, _state) = ctx.sessions.resolve_affordance(&tab_id, ref_id);
        let Some(item) = resolved else {
            return ToolResult::failure(
                ToolError::new(ErrorKind::MissingRef, "Unknown or stale affordance ref")
                    .with_tool("click")
                    .with_suggestion("Call page(detail='locators') to refresh affordances"),
            );
        };
        let mut merged = item.args.as_object().cloned().unwrap_or_default();
        for (k, v) in &args {
            if k != "ref" {
                merged.insert(k.clone(), v.clone());
            }
        }
        return Box::pin(click(ctx, Value::Object(merged))).await;
    }

    let (x, y, matches_found) = if let (Some(x), Some(y)) = (
        args.get("x").and_then(Value::as_f64),
        args.get("y").and_then(Value::as_f64),
    ) {
        (x, y, 1)
    } else {
        let selector = arg_str(&args, "selector");
        let text = arg_str(&args, "text");
        if selector.is_none() && text.is_none() {
            return ToolResult::failure(
                ToolError::new(ErrorKind::Validation, "Missing click target")
                    .with_tool("click")
                    .with_suggestion("Provide text, selector, (x, y), or ref"),
            );
        }
        let index = args
            .get("index")
            .and_then(Value::as_i64)
            .and_then(|i| usize::try_from(i).ok());
        let probe = element_center_js(selector, text, index);
        let hit = match session.eval_js(&probe, Duration::from_secs(5)).await {
            Ok(hit) => hit,
            Err(err) => {
                return ToolResult::failure(
                    ToolError::new(ErrorKind::CdpBrick, err.to_string()).with_tool("click"),
                );
            }
        };
        let matches_found = hit.get("matchesFound").and_then(Value::as_i64).unwrap_or(0);
        if let Some(error) = hit.get("error").and_then(Value::as_str) {
            let target = selector.or(text).unwrap_or("");
            return ToolResult::failure(
                ToolError::new(ErrorKind::UiTransient, format!("{error}: {target}"))
                    .with_tool("click")
                    .with_suggestion("Check the selector/text, or use page(detail='locators') to list actionable elements")
                    .with_details(json!({"matchesFound": matches_found})),
            );
        }
        (
            hit.get("x").and_then(Value::as_f64).unwrap_or(0.0),
            hit.get("y").and_then(Value::as_f64).unwrap_or(0.0),
            matches_found,
        )
    };

    let clicks = if arg_bool(&args, "double", false) { 2 } else { 1 };
    for _ in 0..clicks {
        if let Err(err) = session.click_xy(x, y).await {
            return ToolResult::failure(
                ToolError::new(ErrorKind::CdpBrick, err.to_string()).with_tool("click"),
            );
        }
    }

    let wait_after = arg_str(&args, "wait_after").unwrap_or("auto");
    if wait_after != "none" {
        tokio::time::sleep(Duration::from_millis(120)).await;
        ctx.sessions.drain_and_ingest(&session);
    }

    ToolResult::json(json!({
        "ok": true,
        "tool": "click",
        "result": {"x": x, "y": y, "matchesFound": matches_found},
    }))
}

pub async fn type_text(ctx: ToolCtx, args: Value) -> ToolResult {
    let args = args_obj(&args);
    let (session, tab_id) = match page_session(&ctx, "type").await {
        Ok(pair) => pair,
        Err(err) => return err,
    };
    if let Some(blocked) = dialog_guard(&ctx, &tab_id, "type") {
        return blocked;
    }

    // Named key (with modifiers) is a separate mode.
    if let Some(key) = arg_str(&args, "key") {
        let mut modifiers = 0;
        for (flag, bit) in [("alt", 1), ("ctrl", 2), ("meta", 4), ("shift", 8)] {
            if arg_bool(&args, flag, false) {
                modifiers |= bit;
            }
        }
        for event_type in ["rawKeyDown", "keyUp"] {
            let result = session
                .send_with_deadline(
                    "Input.dispatchKeyEvent",
                    json!({"type": event_type, "key": key, "modifiers": modifiers}),
                    Duration::from_secs(5),
                )
                .await;
            if let Err(err) = result {
                return ToolResult::failure(
                    ToolError::new(ErrorKind::CdpBrick, err.to_string()).with_tool("type"),
                );
            }
        }
        return ToolResult::json(json!({"ok": true, "tool": "type", "key": key}));
    }

    let Some(text) = args.get("text").and_then(Value::as_str) else {
        return ToolResult::failure(
            ToolError::new(ErrorKind::Validation, "Missing text")
                .with_tool("type")
                .with_suggestion("Provide text='...' (and selector to focus a field first)"),
        );
    };

    // Focus the target when a selector/ref is given.
    if let Some(selector) = arg_str(&args, "selector") {
        let sel = serde_json::to_string(selector).unwrap_or_default();
        let clear = arg_bool(&args, "clear", false);
        let focus_js = format!(
            "(() => {{ const el = document.querySelector({sel}); if (!el) return {{error: 'Element not found'}}; el.focus(); {} return {{ok: true}}; }})()",
            if clear { "if ('value' in el) el.value = '';" } else { "" }
        );
        match session.eval_js(&focus_js, Duration::from_secs(3)).await {
            Ok(hit) => {
                if hit.get("error").is_some() {
                    return ToolResult::failure(
                        ToolError::new(
                            ErrorKind::UiTransient,
                            format!("Element not found: {selector}"),
                        )
                        .with_tool("type"),
                    );
                }
            }
            Err(err) => {
                return ToolResult::failure(
                    ToolError::new(ErrorKind::CdpBrick, err.to_string()).with_tool("type"),
                );
            }
        }
    }

    let result = session
        .send_with_deadline(
            "Input.insertText",
            json!({"text": text}),
            Duration::from_secs(5),
        )
        .await;
    if let Err(err) = result {
        return ToolResult::failure(
            ToolError::new(ErrorKind::CdpBrick, err.to_string()).with_tool("type"),
        );
    }

    if arg_bool(&args, "submit", false) {
        let submit_js = "(() => { const el = document.activeElement; const form = el && el.form; if (form) { form.requestSubmit ? form.requestSubmit() : form.submit(); return true; } return false; })()";
        let _ = session.eval_js(submit_js, Duration::from_secs(3)).await;
    }

    ToolResult::json(json!({
        "ok": true,
        "tool": "type",
        "chars": text.len(),
        "submitted": arg_bool(&args, "submit", false),
    }))
}

pub async fn scroll(ctx: ToolCtx, args: Value) -> ToolResult {
    let args = args_obj(&args);
    let (session, tab_id) = match page_session(&ctx, "scroll").await {
        Ok(pair) => pair,
        Err(err) => return err,
    };
    if let Some(blocked) = dialog_guard(&ctx, &tab_id, "scroll") {
        return blocked;
    }

    let code = if let Some(selector) = arg_str(&args, "selector") {
        let sel = serde_json::to_string(selector).unwrap_or_default();
        format!(
            "(() => {{ const el = document.querySelector({sel}); if (!el) return {{error: 'Element not found'}}; el.scrollIntoView({{block: 'center'}}); return {{ok: true}}; }})()"
        )
    } else {
        let amount = arg_f64(&args, "amount", 600.0);
        let (dx, dy) = match arg_str(&args, "direction").unwrap_or("down") {
            "up" => (0.0, -amount),
            "left" => (-amount, 0.0),
            "right" => (amount, 0.0),
            _ => (0.0, amount),
        };
        format!("(() => {{ window.scrollBy({dx}, {dy}); return {{ok: true, x: window.scrollX, y: window.scrollY}}; }})()")
    };

    match session.eval_js(&code, Duration::from_secs(3)).await {
        Ok(hit) => {
            if hit.get("error").is_some() {
                return ToolResult::failure(
                    ToolError::new(ErrorKind::UiTransient, "Element not found").with_tool("scroll"),
                );
            }
            ToolResult::json(json!({"ok": true, "tool": "scroll", "result": hit}))
        }
        Err(err) => ToolResult::failure(
            ToolError::new(ErrorKind::CdpBrick, err.to_string()).with_tool("scroll"),
        ),
    }
}

pub async fn mouse(ctx: ToolCtx, args: Value) -> ToolResult {
    let args = args_obj(&args);
    let (session, tab_id) = match page_session(&ctx, "mouse").await {
        Ok(pair) => pair,
        Err(err) => return err,
    };
    if let Some(blocked) = dialog_guard(&ctx, &tab_id, "mouse") {
        return blocked;
    }

    let action = arg_str(&args, "action").unwrap_or("move");
    let x = arg_f64(&args, "x", 0.0);
    let y = arg_f64(&args, "y", 0.0);
    let mut params = json!({"x": x, "y": y, "button": "left"});
    let event_type = match action {
        "move" => "mouseMoved",
        "down" => "mousePressed",
        "up" => "mouseReleased",
        "wheel" => {
            params["deltaX"] = json!(0.0);
            params["deltaY"] = json!(arg_f64(&args, "delta_y", 120.0));
            "mouseWheel"
        }
        other => {
            return ToolResult::failure(
                ToolError::new(ErrorKind::Validation, format!("Unknown mouse action: {other}"))
                    .with_tool("mouse")
                    .with_suggestion("Use action='move'|'down'|'up'|'wheel'"),
            );
        }
    };
    params["type"] = json!(event_type);
    if matches!(action, "down" | "up") {
        params["clickCount"] = json!(1);
    }

    match session
        .send_with_deadline("Input.dispatchMouseEvent", params, Duration::from_secs(5))
        .await
    {
        Ok(_) => ToolResult::json(json!({"ok": true, "tool": "mouse", "action": action})),
        Err(err) => ToolResult::failure(
            ToolError::new(ErrorKind::CdpBrick, err.to_string()).with_tool("mouse"),
        ),
    }
}

pub async fn resize(ctx: ToolCtx, args: Value) -> ToolResult {
    let args = args_obj(&args);
    let (session, _tab_id) = match page_session(&ctx, "resize").await {
        Ok(pair) => pair,
        Err(err) => return err,
    };

    let width = args.get("width").and_then(Value::as_u64).unwrap_or(0);
    let height = args.get("height").and_then(Value::as_u64).unwrap_or(0);
    if width == 0 || height == 0 {
        return ToolResult::failure(
            ToolError::new(ErrorKind::Validation, "Missing width/height")
                .with_tool("resize")
                .with_suggestion("Provide width and height in CSS pixels"),
        );
    }

    let result = session
        .send_with_deadline(
            "Emulation.setDeviceMetricsOverride",
            json!({
                "width": width,
                "height": height,
                "deviceScaleFactor": 1,
                "mobile": false,
            }),
            Duration::from_secs(5),
        )
        .await;
    match result {
        Ok(_) => ToolResult::json(json!({"ok": true, "tool": "resize", "width": width, "height": height})),
        Err(err) => ToolResult::failure(
            ToolError::new(ErrorKind::CdpBrick, err.to_string()).with_tool("resize"),
        ),
    }
}

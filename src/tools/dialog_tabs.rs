//! `dialog` and `tabs`.

use std::time::Duration;

use serde_json::{json, Value};

use browsermcp_core_types::{ErrorKind, ToolError, ToolResult};
use browsermcp_registry::ToolCtx;
use cdp_adapter::targets;
use session_center::dialogs::is_no_dialog_error;

use super::support::{arg_bool, arg_str, args_obj, page_session};

pub async fn dialog(ctx: ToolCtx, args: Value) -> ToolResult {
    let args = args_obj(&args);
    let accept = arg_bool(&args, "accept", false);
    let prompt_text = arg_str(&args, "text");

    let (session, tab_id) = match page_session(&ctx, "dialog").await {
        Ok(pair) => pair,
        Err(err) => return err,
    };

    let was_open = ctx
        .sessions
        .get_telemetry(&tab_id)
        .map(|t| t.dialog_open())
        .unwrap_or(false);

    // Schedule the out-of-band close first, then try directly; some
    // browsers answer "no dialog" while one is still up, so the result
    // is corroborated against telemetry.
    ctx.sessions
        .schedule_auto_dialog_handle(&ctx.config, &tab_id, accept);

    let mut params = json!({"accept": accept});
    if let Some(text) = prompt_text {
        params["promptText"] = json!(text);
    }
    let direct = session
        .send_with_deadline("Page.handleJavaScriptDialog", params, Duration::from_secs(2))
        .await;

    let handled = match direct {
        Ok(_) => true,
        Err(err) if is_no_dialog_error(&err) => {
            ctx.sessions.drain_and_ingest(&session);
            !ctx.sessions
                .get_telemetry(&tab_id)
                .map(|t| t.dialog_open())
                .unwrap_or(false)
        }
        Err(_) => {
            // Give the out-of-band close a moment to win.
            tokio::time::sleep(Duration::from_millis(300)).await;
            ctx.sessions.drain_and_ingest(&session);
            !ctx.sessions
                .get_telemetry(&tab_id)
                .map(|t| t.dialog_open())
                .unwrap_or(false)
        }
    };

    if handled {
        ctx.sessions.note_dialog_closed(&tab_id, accept);
        return ToolResult::json(json!({
            "ok": true,
            "tool": "dialog",
            "handled": true,
            "accepted": accept,
            "wasOpen": was_open,
        }));
    }

    ToolResult::failure(
        ToolError::new(ErrorKind::ToolFailure, "Failed to close the dialog")
            .with_tool("dialog")
            .with_suggestion("Retry, or use tabs(action=\"rescue\") to abandon the wedged tab"),
    )
}

pub async fn tabs(ctx: ToolCtx, args: Value) -> ToolResult {
    let args = args_obj(&args);
    let action = arg_str(&args, "action").unwrap_or("list");

    match action {
        "list" => match ctx.sessions.list_tabs(&ctx.config).await {
            Ok(tabs) => {
                let rows: Vec<Value> = tabs
                    .iter()
                    .map(|t| {
                        json!({
                            "id": t.id.clone(),
                            "url": t.url.clone(),
                            "title": t.title.clone(),
                            "active": t.active,
                        })
                    })
                    .collect();
                ToolResult::json(json!({"ok": true, "tool": "tabs", "count": rows.len(), "tabs": rows}))
            }
            Err(err) => ToolResult::failure(
                ToolError::new(ErrorKind::CdpBrick, err.to_string()).with_tool("tabs"),
            ),
        },
        "new" => {
            let url = arg_str(&args, "url").unwrap_or("about:blank");
            match targets::new_tab(&ctx.config, url, Duration::from_secs(5)).await {
                Ok(target) => {
                    let switched = ctx
                        .sessions
                        .switch_tab(&ctx.config, &target.id)
                        .await
                        .unwrap_or(false);
                    ToolResult::json(json!({
                        "ok": true,
                        "tool": "tabs",
                        "tabId": target.id,
                        "switched": switched,
                    }))
                }
                Err(err) => ToolResult::failure(
                    ToolError::new(ErrorKind::CdpBrick, err.to_string()).with_tool("tabs"),
                ),
            }
        }
        "switch" => {
            let Some(tab_id) = arg_str(&args, "tab_id") else {
                return ToolResult::failure(
                    ToolError::new(ErrorKind::Validation, "Missing tab_id").with_tool("tabs"),
                );
            };
            match ctx.sessions.switch_tab(&ctx.config, tab_id).await {
                Ok(switched) => ToolResult::json(json!({
                    "ok": switched,
                    "tool": "tabs",
                    "tabId": tab_id,
                    "switched": switched,
                })),
                Err(err) => ToolResult::failure(
                    ToolError::new(ErrorKind::CdpBrick, err.to_string()).with_tool("tabs"),
                ),
            }
        }
        "close" => {
            let Some(tab_id) = arg_str(&args, "tab_id") else {
                return ToolResult::failure(
                    ToolError::new(ErrorKind::Validation, "Missing tab_id").with_tool("tabs"),
                );
            };
            match targets::close(&ctx.config, tab_id, Duration::from_secs(5)).await {
                Ok(()) => ToolResult::json(json!({"ok": true, "tool": "tabs", "closed": tab_id})),
                Err(err) => ToolResult::failure(
                    ToolError::new(ErrorKind::CdpBrick, err.to_string()).with_tool("tabs"),
                ),
            }
        }
        // Rescue: abandon the (possibly wedged) session tab and move to
        // any other healthy tab, opening a fresh one when none exists.
        "rescue" => {
            let current = ctx.sessions.tab_id();
            ctx.sessions.drop_session();
            let tabs = ctx
                .sessions
                .list_tabs(&ctx.config)
                .await
                .unwrap_or_default();
            let other = tabs
                .iter()
                .find(|t| Some(&t.id) != current.as_ref())
                .map(|t| t.id.clone());
            let target_id = match other {
                Some(id) => id,
                None => match targets::new_tab(&ctx.config, "about:blank", Duration::from_secs(5))
                    .await
                {
                    Ok(target) => target.id,
                    Err(err) => {
                        return ToolResult::failure(
                            ToolError::new(ErrorKind::CdpBrick, err.to_string())
                                .with_tool("tabs")
                                .with_suggestion("Try browser(action=\"recover\", hard=true)"),
                        );
                    }
                },
            };
            match ctx.sessions.switch_tab(&ctx.config, &target_id).await {
                Ok(switched) => ToolResult::json(json!({
                    "ok": switched,
                    "tool": "tabs",
                    "rescued": switched,
                    "tabId": target_id,
                    "abandoned": current,
                })),
                Err(err) => ToolResult::failure(
                    ToolError::new(ErrorKind::CdpBrick, err.to_string()).with_tool("tabs"),
                ),
            }
        }
        other => ToolResult::failure(
            ToolError::new(ErrorKind::Validation, format!("Unknown tabs action: {other}"))
                .with_tool("tabs")
                .with_suggestion("Use action='list'|'new'|'switch'|'close'|'rescue'"),
        ),
    }
}

//! `browser`: server control: status, safety policy, recovery, and the
//! agent memory surface with its sensitivity rules.

use std::time::Duration;

use serde_json::{json, Value};

use browsermcp_core_types::{ErrorKind, PolicyMode, ToolError, ToolResult};
use browsermcp_registry::ToolCtx;
use memory_center::is_sensitive_key;

use super::support::{arg_bool, arg_f64, arg_str, args_obj};
use crate::app_context::AppContext;

pub async fn browser(ctx: ToolCtx, args: Value) -> ToolResult {
    let args = args_obj(&args);
    let action = arg_str(&args, "action").unwrap_or("status");

    match action {
        "status" => {
            let cdp_ready = ctx.launcher.cdp_ready(Duration::from_millis(600)).await;
            ToolResult::json(json!({
                "ok": true,
                "tool": "browser",
                "status": {
                    "mode": ctx.config.mode.as_str(),
                    "cdpPort": ctx.launcher.active_port(),
                    "cdpReady": cdp_ready,
                    "ownsBrowser": ctx.launcher.owns_child().await,
                    "policy": ctx.policy.summary(),
                    "sessionTabId": ctx.sessions.tab_id(),
                    "memoryKeys": ctx.memory.len(),
                    "artifacts": ctx.artifacts.len(),
                },
            }))
        }
        "policy" => {
            if let Some(mode_raw) = arg_str(&args, "mode") {
                let Some(mode) = PolicyMode::parse(mode_raw) else {
                    return ToolResult::failure(
                        ToolError::new(ErrorKind::Validation, format!("Unknown policy mode: {mode_raw}"))
                            .with_tool("browser")
                            .with_suggestion("Use mode='permissive' or mode='strict'"),
                    );
                };
                ctx.policy.set_mode(mode);
            }
            ToolResult::json(json!({
                "ok": true,
                "tool": "browser",
                "policy": ctx.policy.summary(),
            }))
        }
        "recover" => {
            let hard = arg_bool(&args, "hard", false);
            let timeout_s = arg_f64(&args, "timeout", 5.0).clamp(1.0, 30.0);
            // Soft or hard, the wedged session is gone either way.
            ctx.sessions.drop_session();
            if hard {
                ctx.sessions.recover_reset();
            }
            match ctx
                .launcher
                .recover(hard, Duration::from_secs_f64(timeout_s))
                .await
            {
                Ok(outcome) => ToolResult::json(json!({
                    "ok": true,
                    "tool": "browser",
                    "recovery": outcome,
                })),
                Err(err) => ToolResult::failure(
                    ToolError::new(ErrorKind::CdpBrick, err.to_string())
                        .with_tool("browser")
                        .with_suggestion("Retry with hard=true, or change MCP_BROWSER_PORT"),
                ),
            }
        }
        "stop" => {
            ctx.sessions.drop_session();
            ctx.launcher.stop().await;
            ToolResult::json(json!({"ok": true, "tool": "browser", "stopped": true}))
        }
        "memory" => memory_action(&ctx, &args).await,
        other => ToolResult::failure(
            ToolError::new(ErrorKind::Validation, format!("Unknown browser action: {other}"))
                .with_tool("browser")
                .with_suggestion("Use action='status'|'policy'|'recover'|'memory'|'stop'"),
        ),
    }
}

async fn memory_action(ctx: &ToolCtx, args: &serde_json::Map<String, Value>) -> ToolResult {
    let memory_action = arg_str(args, "memory_action").unwrap_or("list");
    let strict = ctx.policy.is_strict();

    match memory_action {
        "set" => {
            let Some(key) = arg_str(args, "key") else {
                return ToolResult::failure(
                    ToolError::new(ErrorKind::Validation, "Missing key").with_tool("browser"),
                );
            };
            // Strict policy refuses sensitive writes outright.
            if strict && is_sensitive_key(key) {
                return ToolResult::failure(
                    ToolError::new(
                        ErrorKind::Policy,
                        format!("Strict policy blocks storing sensitive key: {key}"),
                    )
                    .with_tool("browser")
                    .with_suggestion("Switch policy to permissive explicitly if you accept the risk"),
                );
            }
            let Some(value) = args.get("value").cloned() else {
                return ToolResult::failure(
                    ToolError::new(ErrorKind::Validation, "Missing value").with_tool("browser"),
                );
            };
            match ctx.memory.set(key, value, 200_000, 500) {
                Ok(meta) => ToolResult::json(json!({
                    "ok": true,
                    "tool": "browser",
                    "memory": meta,
                })),
                Err(err) => ToolResult::failure(
                    ToolError::new(ErrorKind::ToolFailure, err.to_string()).with_tool("browser"),
                ),
            }
        }
        "get" => {
            let Some(key) = arg_str(args, "key") else {
                return ToolResult::failure(
                    ToolError::new(ErrorKind::Validation, "Missing key").with_tool("browser"),
                );
            };
            let reveal = arg_bool(args, "reveal", false);
            let max_chars = args
                .get("max_chars")
                .and_then(Value::as_u64)
                .unwrap_or(2000)
                .min(100_000) as usize;
            let view = ctx.memory.get_view(key, reveal, max_chars, ctx.policy.mode());
            ToolResult::json(json!({"ok": true, "tool": "browser", "memory": view}))
        }
        "list" => ToolResult::json(json!({
            "ok": true,
            "tool": "browser",
            "memory": {"count": ctx.memory.len(), "keys": ctx.memory.list()},
        })),
        "delete" => {
            let Some(key) = arg_str(args, "key") else {
                return ToolResult::failure(
                    ToolError::new(ErrorKind::Validation, "Missing key").with_tool("browser"),
                );
            };
            let deleted = ctx.memory.delete(key);
            ToolResult::json(json!({"ok": deleted, "tool": "browser", "deleted": deleted}))
        }
        "save" | "load" => {
            if strict {
                return ToolResult::failure(
                    ToolError::new(
                        ErrorKind::Policy,
                        format!("Strict policy blocks memory {memory_action}"),
                    )
                    .with_tool("browser"),
                );
            }
            let Some(path) = AppContext::memory_path(&ctx.config) else {
                return ToolResult::failure(
                    ToolError::new(ErrorKind::Validation, "MCP_AGENT_MEMORY_DIR is not set")
                        .with_tool("browser")
                        .with_suggestion("Set MCP_AGENT_MEMORY_DIR to enable persistence"),
                );
            };
            let allow_sensitive = arg_bool(args, "allow_sensitive", false);
            let outcome = if memory_action == "save" {
                ctx.memory.save(&path, allow_sensitive)
            } else {
                ctx.memory.load(&path, allow_sensitive)
            };
            match outcome {
                Ok(count) => ToolResult::json(json!({
                    "ok": true,
                    "tool": "browser",
                    "memory": {
                        "action": memory_action,
                        "entries": count,
                        "path": path.to_string_lossy(),
                        "allowSensitive": allow_sensitive,
                    },
                })),
                Err(err) => ToolResult::failure(
                    ToolError::new(ErrorKind::ToolFailure, err.to_string()).with_tool("browser"),
                ),
            }
        }
        other => ToolResult::failure(
            ToolError::new(ErrorKind::Validation, format!("Unknown memory action: {other}"))
                .with_tool("browser")
                .with_suggestion("Use memory_action='set'|'get'|'list'|'delete'|'save'|'load'"),
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use browsermcp_registry::test_ctx;

    #[tokio::test]
    async fn strict_policy_refuses_sensitive_memory_set() {
        let ctx = test_ctx();
        ctx.policy.set_mode(PolicyMode::Strict);
        let res = browser(
            ctx.clone(),
            json!({"action": "memory", "memory_action": "set", "key": "api_token", "value": "x"}),
        )
        .await;
        assert!(res.is_error);
        assert_eq!(res.data.as_ref().unwrap()["kind"], json!("policy"));

        // Non-sensitive keys still work in strict mode.
        let res = browser(
            ctx,
            json!({"action": "memory", "memory_action": "set", "key": "notes", "value": "x"}),
        )
        .await;
        assert!(!res.is_error);
    }

    #[tokio::test]
    async fn strict_policy_blocks_persistence() {
        let ctx = test_ctx();
        ctx.policy.set_mode(PolicyMode::Strict);
        let res = browser(ctx, json!({"action": "memory", "memory_action": "save"})).await;
        assert!(res.is_error);
        assert_eq!(res.data.as_ref().unwrap()["kind"], json!("policy"));
    }

    #[tokio::test]
    async fn policy_mode_round_trips_through_the_tool() {
        let ctx = test_ctx();
        let res = browser(ctx.clone(), json!({"action": "policy", "mode": "strict"})).await;
        assert!(!res.is_error);
        assert_eq!(res.data.unwrap()["policy"]["mode"], json!("strict"));
        assert!(ctx.policy.is_strict());
    }
}

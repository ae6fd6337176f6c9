//! `artifact`: drilldown access to off-context payloads.

use serde_json::{json, Value};

use browsermcp_core_types::{ErrorKind, ToolError, ToolResult};
use browsermcp_registry::ToolCtx;

use super::support::{arg_bool, arg_str, args_obj};

pub async fn artifact(ctx: ToolCtx, args: Value) -> ToolResult {
    let args = args_obj(&args);
    let action = arg_str(&args, "action").unwrap_or("get");

    match action {
        "get" => {
            let Some(id) = arg_str(&args, "id") else {
                return ToolResult::failure(
                    ToolError::new(ErrorKind::Validation, "Missing id").with_tool("artifact"),
                );
            };
            let offset = args.get("offset").and_then(Value::as_u64).unwrap_or(0) as usize;
            let max_chars = args
                .get("max_chars")
                .and_then(Value::as_u64)
                .unwrap_or(4000)
                .min(100_000) as usize;
            match ctx.artifacts.get(id, offset, max_chars) {
                Ok(payload) => ToolResult::json(json!({"ok": true, "tool": "artifact", "artifact": payload})),
                Err(err) => ToolResult::failure(
                    ToolError::new(ErrorKind::MissingRef, err.to_string())
                        .with_tool("artifact")
                        .with_suggestion("Use artifact(action=\"list\") to see live ids"),
                ),
            }
        }
        "list" => {
            let limit = args
                .get("limit")
                .and_then(Value::as_u64)
                .unwrap_or(20)
                .min(200) as usize;
            let refs = ctx.artifacts.list(limit);
            ToolResult::json(json!({
                "ok": true,
                "tool": "artifact",
                "count": refs.len(),
                "artifacts": refs,
            }))
        }
        "delete" => {
            let Some(id) = arg_str(&args, "id") else {
                return ToolResult::failure(
                    ToolError::new(ErrorKind::Validation, "Missing id").with_tool("artifact"),
                );
            };
            let deleted = ctx.artifacts.delete(id);
            ToolResult::json(json!({"ok": deleted, "tool": "artifact", "deleted": deleted, "id": id}))
        }
        "export" => {
            let Some(id) = arg_str(&args, "id") else {
                return ToolResult::failure(
                    ToolError::new(ErrorKind::Validation, "Missing id").with_tool("artifact"),
                );
            };
            let dir = arg_str(&args, "path").map(std::path::Path::new);
            let name = arg_str(&args, "name");
            let overwrite = arg_bool(&args, "overwrite", false);
            match ctx.artifacts.export(id, dir, name, overwrite) {
                Ok(mut payload) => {
                    payload["ok"] = json!(true);
                    payload["tool"] = json!("artifact");
                    ToolResult::json(payload)
                }
                Err(err) => ToolResult::failure(
                    ToolError::new(ErrorKind::ToolFailure, err.to_string())
                        .with_tool("artifact")
                        .with_suggestion("Pass overwrite=true to replace an existing file"),
                ),
            }
        }
        other => ToolResult::failure(
            ToolError::new(ErrorKind::Validation, format!("Unknown artifact action: {other}"))
                .with_tool("artifact")
                .with_suggestion("Use action='get'|'list'|'delete'|'export'"),
        ),
    }
}

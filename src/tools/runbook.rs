//! `runbook`: step lists stored in agent memory, with safe-by-default
//! sanitation and replay through the flow engine.

use serde_json::{json, Value};

use browsermcp_core_types::{ErrorKind, ToolError, ToolResult};
use browsermcp_registry::{RegistrySlot, ToolCtx};
use memory_center::is_sensitive_key;
use policy_center::runbook::{has_sensitive_literals, preview_runbook_steps};
use recipes::{interpolate_params_pair, params_hint};

use super::support::{arg_bool, arg_str, args_obj};

pub async fn runbook(ctx: ToolCtx, args: Value, slot: RegistrySlot) -> ToolResult {
    let args = args_obj(&args);
    let action = arg_str(&args, "action").unwrap_or("list");

    match action {
        "save" => {
            let Some(key) = arg_str(&args, "key") else {
                return ToolResult::failure(
                    ToolError::new(ErrorKind::Validation, "Missing key").with_tool("runbook"),
                );
            };
            let Some(steps) = args.get("steps").and_then(Value::as_array).cloned() else {
                return ToolResult::failure(
                    ToolError::new(ErrorKind::Validation, "Missing steps")
                        .with_tool("runbook")
                        .with_suggestion("Provide steps=[{click:{...}}, ...]"),
                );
            };
            let objects: Vec<Value> = steps.iter().filter(|s| s.is_object()).cloned().collect();
            if objects.len() != steps.len() || objects.is_empty() {
                return ToolResult::failure(
                    ToolError::new(ErrorKind::Validation, "Invalid step list (non-object entries)")
                        .with_tool("runbook"),
                );
            }

            let allow_sensitive = arg_bool(&args, "allow_sensitive", false);
            if !allow_sensitive && has_sensitive_literals(&objects) {
                return ToolResult::failure(
                    ToolError::new(
                        ErrorKind::Policy,
                        "Refusing to save a runbook with sensitive literals",
                    )
                    .with_tool("runbook")
                    .with_suggestion(
                        "Prefer {{mem:...}} / {{param:...}} placeholders, or pass allow_sensitive=true if you explicitly accept the risk",
                    ),
                );
            }
            if ctx.policy.is_strict() && (allow_sensitive || is_sensitive_key(key)) {
                return ToolResult::failure(
                    ToolError::new(ErrorKind::Policy, "Strict policy blocks sensitive runbook save")
                        .with_tool("runbook"),
                );
            }

            match ctx.memory.set(key, Value::Array(objects.clone()), 200_000, 500) {
                Ok(meta) => ToolResult::json(json!({
                    "ok": true,
                    "tool": "runbook",
                    "saved": {"key": key, "steps": objects.len(), "sensitive": meta.sensitive},
                })),
                Err(err) => ToolResult::failure(
                    ToolError::new(ErrorKind::ToolFailure, err.to_string()).with_tool("runbook"),
                ),
            }
        }

        "get" | "preview" => {
            let Some(key) = arg_str(&args, "key") else {
                return ToolResult::failure(
                    ToolError::new(ErrorKind::Validation, "Missing key").with_tool("runbook"),
                );
            };
            let Some(entry) = ctx.memory.get(key) else {
                return ToolResult::failure(
                    ToolError::new(ErrorKind::MissingRef, format!("Unknown runbook: {key}"))
                        .with_tool("runbook")
                        .with_details(json!({"known": ctx.memory.keys_hint(10)})),
                );
            };
            let Value::Array(steps) = entry.value else {
                return ToolResult::failure(
                    ToolError::new(ErrorKind::Validation, "Memory value is not a step list")
                        .with_tool("runbook"),
                );
            };
            // Both read paths return the sanitized preview: raw runbook
            // content is replayable, not displayable.
            let preview = preview_runbook_steps(&steps, if action == "get" { 20 } else { 5 });
            ToolResult::json(json!({
                "ok": true,
                "tool": "runbook",
                "key": key,
                "sensitive": entry.sensitive,
                "runbook": preview,
            }))
        }

        "list" => {
            let runbooks: Vec<Value> = ctx
                .memory
                .list()
                .into_iter()
                .filter(|entry| {
                    entry
                        .get("key")
                        .and_then(Value::as_str)
                        .and_then(|key| ctx.memory.get(key))
                        .map(|e| e.value.is_array())
                        .unwrap_or(false)
                })
                .collect();
            ToolResult::json(json!({
                "ok": true,
                "tool": "runbook",
                "count": runbooks.len(),
                "runbooks": runbooks,
            }))
        }

        "delete" => {
            let Some(key) = arg_str(&args, "key") else {
                return ToolResult::failure(
                    ToolError::new(ErrorKind::Validation, "Missing key").with_tool("runbook"),
                );
            };
            let deleted = ctx.memory.delete(key);
            ToolResult::json(json!({"ok": deleted, "tool": "runbook", "deleted": deleted}))
        }

        "run" => {
            let Some(key) = arg_str(&args, "key") else {
                return ToolResult::failure(
                    ToolError::new(ErrorKind::Validation, "Missing key").with_tool("runbook"),
                );
            };
            let Some(entry) = ctx.memory.get(key) else {
                return ToolResult::failure(
                    ToolError::new(ErrorKind::MissingRef, format!("Unknown runbook: {key}"))
                        .with_tool("runbook")
                        .with_details(json!({"known": ctx.memory.keys_hint(10)})),
                );
            };
            let allow_sensitive = arg_bool(&args, "allow_sensitive", false);
            if entry.sensitive && !allow_sensitive {
                return ToolResult::failure(
                    ToolError::new(ErrorKind::Policy, "Refusing to run a sensitive runbook")
                        .with_tool("runbook")
                        .with_suggestion("Pass allow_sensitive=true if you explicitly accept the risk"),
                );
            }
            let Value::Array(steps) = entry.value else {
                return ToolResult::failure(
                    ToolError::new(ErrorKind::Validation, "Memory value is not a step list")
                        .with_tool("runbook"),
                );
            };

            // `{{param:key}}` placeholders resolve at replay time.
            let params = args
                .get("params")
                .and_then(Value::as_object)
                .cloned()
                .unwrap_or_default();
            let mut resolved = Vec::with_capacity(steps.len());
            for step in &steps {
                match interpolate_params_pair(step, &params) {
                    Ok((actual, _note)) => resolved.push(actual),
                    Err(missing) => {
                        return ToolResult::failure(
                            ToolError::new(ErrorKind::MissingRef, "Missing macro param")
                                .with_tool("runbook")
                                .with_suggestion("Provide params={...} for {{param:key}} placeholders")
                                .with_details(json!({
                                    "missing": missing.key,
                                    "known": params_hint(&params, 20),
                                })),
                        );
                    }
                }
            }

            let Some(registry) = slot.get() else {
                return ToolResult::error("Tool registry not initialized", ErrorKind::ToolFailure);
            };
            registry
                .dispatch("flow", &ctx, json!({"steps": resolved}))
                .await
        }

        other => ToolResult::failure(
            ToolError::new(ErrorKind::Validation, format!("Unknown runbook action: {other}"))
                .with_tool("runbook")
                .with_suggestion("Use action='save'|'get'|'list'|'delete'|'preview'|'run'"),
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use browsermcp_registry::{registry_slot, test_ctx};

    #[tokio::test]
    async fn sensitive_literal_save_is_refused_without_opt_in() {
        let ctx = test_ctx();
        let slot = registry_slot();
        let steps = json!([{"type": {"selector": "#pwd", "text": "secret"}}]);

        let res = runbook(
            ctx.clone(),
            json!({"action": "save", "key": "rb", "steps": steps}),
            slot.clone(),
        )
        .await;
        assert!(res.is_error);
        assert_eq!(res.data.as_ref().unwrap()["kind"], json!("policy"));

        // Same call with allow_sensitive=true succeeds.
        let res = runbook(
            ctx.clone(),
            json!({"action": "save", "key": "rb", "steps": steps, "allow_sensitive": true}),
            slot,
        )
        .await;
        assert!(!res.is_error);
        assert!(ctx.memory.get("rb").is_some());
    }

    #[tokio::test]
    async fn placeholder_runbooks_save_without_opt_in() {
        let ctx = test_ctx();
        let res = runbook(
            ctx.clone(),
            json!({"action": "save", "key": "login-flow", "steps": [
                {"type": {"selector": "#pwd", "text": "{{mem:password}}"}}
            ]}),
            registry_slot(),
        )
        .await;
        assert!(!res.is_error);
    }

    #[tokio::test]
    async fn preview_is_sanitized() {
        let ctx = test_ctx();
        ctx.memory
            .set(
                "rb2",
                json!([{"type": {"selector": "#a", "text": "hunter2"}}]),
                0,
                0,
            )
            .unwrap();
        let res = runbook(
            ctx,
            json!({"action": "preview", "key": "rb2"}),
            registry_slot(),
        )
        .await;
        assert!(!res.is_error);
        let text = res.data.unwrap().to_string();
        assert!(!text.contains("hunter2"));
    }

    #[tokio::test]
    async fn run_fails_closed_on_missing_param() {
        let ctx = test_ctx();
        ctx.memory
            .set("rb3", json!([{"navigate": {"url": "{{param:base}}/x"}}]), 0, 0)
            .unwrap();
        let res = runbook(ctx, json!({"action": "run", "key": "rb3"}), registry_slot()).await;
        assert!(res.is_error);
        assert_eq!(
            res.data.as_ref().unwrap()["details"]["missing"],
            json!("base")
        );
    }
}

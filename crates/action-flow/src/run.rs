//! The `run` tool: the public batched runner built on the flow engine.
//!
//! Adds the reliability policy (heuristic levels + strict_params), the
//! irreversible-action guard, transparent resume after CDP-brick
//! recovery, and run-shaped output (actions + report instead of steps +
//! final).

use serde_json::{json, Map, Value};

use browsermcp_core_types::{ErrorKind, ToolContent, ToolError, ToolResult};
use browsermcp_registry::ToolCtx;
use policy_center::reliability::{parse_policy_args, policy_summary};
use policy_center::runbook::sanitize_runbook_steps;

use crate::engine::FlowEngine;

impl FlowEngine {
    pub async fn handle_run(&self, ctx: &ToolCtx, args: &Map<String, Value>) -> ToolResult {
        let actions_raw = args
            .get("actions")
            .and_then(Value::as_array)
            .filter(|a| !a.is_empty())
            .or_else(|| {
                // Deprecated alias.
                args.get("steps").and_then(Value::as_array).filter(|a| !a.is_empty())
            })
            .cloned();
        let Some(actions_raw) = actions_raw else {
            return ToolResult::failure(
                ToolError::new(ErrorKind::Validation, "Missing or empty 'actions' array")
                    .with_tool("run")
                    .with_suggestion(
                        "Provide actions=[{tool:'navigate', args:{url:'...'}}, ...] or actions=[{navigate:{url:'...'}}, ...]",
                    ),
            );
        };

        let (policy, args, warnings, errors) = parse_policy_args(args);
        if !errors.is_empty() {
            return ToolResult::failure(
                ToolError::new(
                    ErrorKind::Validation,
                    "Invalid run parameters (strict_params=true)",
                )
                .with_tool("run")
                .with_suggestion(errors.join("; "))
                .with_details(json!({"errors": errors})),
            );
        }

        // Default report: observe for v1, map (actions-first) for v2.
        let report = args
            .get("report")
            .and_then(Value::as_str)
            .map(str::to_string)
            .unwrap_or_else(|| {
                if ctx.config.toolset.is_v2() {
                    "map".to_string()
                } else {
                    "observe".to_string()
                }
            });

        let record_memory_key = args
            .get("record_memory_key")
            .and_then(Value::as_str)
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string);
        let record_mode = match args
            .get("record_mode")
            .and_then(Value::as_str)
            .unwrap_or("sanitized")
            .trim()
            .to_ascii_lowercase()
            .as_str()
        {
            "raw" => "raw",
            _ => "sanitized",
        };
        let record_on_failure = args
            .get("record_on_failure")
            .and_then(Value::as_bool)
            .unwrap_or(false);

        // Irreversible guard: refuse the whole run before any action runs.
        let confirm_irreversible = args
            .get("confirm_irreversible")
            .and_then(Value::as_bool)
            .unwrap_or(false);
        let blocked: Vec<Value> = actions_raw
            .iter()
            .enumerate()
            .filter(|(_, step)| {
                step.get("irreversible") == Some(&Value::Bool(true))
            })
            .map(|(i, step)| {
                let mut item = json!({"i": i});
                if let Some(tool) = step.get("tool").and_then(Value::as_str) {
                    item["tool"] = json!(tool);
                }
                item
            })
            .collect();
        if !blocked.is_empty() && !confirm_irreversible {
            return ToolResult::failure(
                ToolError::new(
                    ErrorKind::Policy,
                    "Blocked irreversible action(s) (confirmation required)",
                )
                .with_tool("run")
                .with_suggestion("Re-run with confirm_irreversible=true if you have explicit user approval")
                .with_details(json!({"blocked": blocked})),
            );
        }

        // Execute via flow: shared session, delta cursor, and proof wiring
        // are already there.
        let mut flow_args = Map::new();
        flow_args.insert("steps".into(), Value::Array(actions_raw.clone()));
        flow_args.insert(
            "stop_on_error".into(),
            json!(args.get("stop_on_error").and_then(Value::as_bool).unwrap_or(true)),
        );
        flow_args.insert(
            "delta_final".into(),
            json!(args.get("delta_report").and_then(Value::as_bool).unwrap_or(true)),
        );
        flow_args.insert(
            "steps_output".into(),
            args.get("actions_output").cloned().unwrap_or(json!("compact")),
        );
        flow_args.insert(
            "screenshot_on_error".into(),
            json!(args.get("screenshot_on_error").and_then(Value::as_bool).unwrap_or(false)),
        );
        flow_args.insert("triage_on_error".into(), json!(true));
        flow_args.insert("diagnostics_on_error".into(), json!(report == "diagnostics"));
        flow_args.insert("final".into(), json!(report));
        flow_args.insert(
            "final_limit".into(),
            args.get("report_limit").cloned().unwrap_or(json!(30)),
        );
        flow_args.insert(
            "with_screenshot".into(),
            json!(args.get("with_screenshot").and_then(Value::as_bool).unwrap_or(false)),
        );
        flow_args.insert(
            "step_proof".into(),
            json!(args.get("proof").and_then(Value::as_bool).unwrap_or(true)),
        );
        flow_args.insert(
            "proof_screenshot".into(),
            args.get("proof_screenshot").cloned().unwrap_or(json!("artifact")),
        );
        flow_args.insert(
            "screenshot_on_ambiguity".into(),
            json!(args
                .get("screenshot_on_ambiguity")
                .and_then(Value::as_bool)
                .unwrap_or(true)),
        );
        flow_args.insert(
            "auto_dialog".into(),
            args.get("auto_dialog").cloned().unwrap_or(json!("auto")),
        );
        flow_args.insert(
            "auto_recover".into(),
            json!(args.get("auto_recover").and_then(Value::as_bool).unwrap_or(true)),
        );
        flow_args.insert(
            "recover_hard".into(),
            json!(args.get("recover_hard").and_then(Value::as_bool).unwrap_or(false)),
        );
        flow_args.insert(
            "auto_tab".into(),
            json!(args.get("auto_tab").and_then(Value::as_bool).unwrap_or(false)),
        );
        flow_args.insert(
            "auto_affordances".into(),
            json!(args.get("auto_affordances").and_then(Value::as_bool).unwrap_or(true)),
        );
        flow_args.insert(
            "auto_download".into(),
            json!(args.get("auto_download").and_then(Value::as_bool).unwrap_or(false)),
        );
        for key in [
            "timeout_profile",
            "recover_timeout",
            "action_timeout",
            "auto_download_timeout",
        ] {
            if let Some(value) = args.get(key) {
                if !value.is_null() {
                    flow_args.insert(key.to_string(), value.clone());
                }
            }
        }

        let max_recoveries = args
            .get("max_recoveries")
            .and_then(Value::as_i64)
            .unwrap_or(1)
            .clamp(0, 5) as usize;

        let mut start_at = args
            .get("start_at")
            .and_then(Value::as_i64)
            .unwrap_or(0)
            .max(0) as usize;

        // Soft recovery loop: on a CDP brick, flow recovers and returns a
        // resume hint; run continues from the next action without an extra
        // round-trip. The failed action is never retried automatically.
        let mut recoveries: Vec<Value> = Vec::new();
        let mut flow_res: Option<ToolResult> = None;
        for _attempt in 0..=max_recoveries {
            flow_args.insert("start_at".into(), json!(start_at));
            let res = self.handle_flow(ctx, &flow_args).await;

            if !res.is_error && res.data.is_some() {
                flow_res = Some(res);
                break;
            }

            let Some(data) = res.data.clone() else {
                return res;
            };
            let err = data.get("error").and_then(Value::as_str).unwrap_or("");
            if !err.to_ascii_lowercase().contains("cdp brick detected") {
                return res;
            }
            let failed = data
                .pointer("/details/failedStep")
                .cloned()
                .unwrap_or(Value::Null);
            let Some(i) = failed.get("i").and_then(Value::as_i64) else {
                return res;
            };
            let i = i.max(0) as usize;

            let mut recovery = json!({"failedAction": {"i": i}});
            if let Some(tool) = failed.get("tool").and_then(Value::as_str) {
                recovery["failedAction"]["tool"] = json!(tool);
            }
            if let Some(rec) = data.pointer("/details/recovery") {
                if !rec.is_null() {
                    recovery["recovery"] = rec.clone();
                }
            }
            recoveries.push(recovery);

            start_at = i + 1;
            if start_at >= actions_raw.len() {
                return res;
            }
            flow_res = Some(res);
        }

        let Some(flow_res) = flow_res else {
            return ToolResult::error("run() failed to execute actions", ErrorKind::ToolFailure);
        };
        if flow_res.is_error || flow_res.data.is_none() {
            return flow_res;
        }
        let raw = flow_res.data.clone().unwrap_or(Value::Null);

        // Transform: flow → run.
        let mut out = json!({"ok": raw.get("ok").and_then(Value::as_bool).unwrap_or(false)});
        if let Some(goal) = args.get("goal").and_then(Value::as_str).map(str::trim) {
            if !goal.is_empty() {
                out["goal"] = json!(goal);
            }
        }

        let flow_stats = raw.get("flow").cloned().unwrap_or(json!({}));
        let mut run_stats = json!({
            "actions_total": flow_stats.get("steps_total").cloned().unwrap_or(Value::Null),
            "actions_executed": flow_stats.get("steps_executed").cloned().unwrap_or(Value::Null),
            "succeeded": flow_stats.get("succeeded").cloned().unwrap_or(Value::Null),
            "failed": flow_stats.get("failed").cloned().unwrap_or(Value::Null),
            "duration_ms": flow_stats.get("duration_ms").cloned().unwrap_or(Value::Null),
            "stopped_on_error": flow_stats.get("stopped_on_error").cloned().unwrap_or(Value::Null),
        });
        if let Some(tool_counts) = flow_stats.get("toolCounts") {
            run_stats["toolCounts"] = tool_counts.clone();
        }
        if let Some(dialogs) = flow_stats.get("dialogsAutoHandled") {
            run_stats["dialogsAutoHandled"] = dialogs.clone();
        }
        if !recoveries.is_empty() {
            run_stats["recoveries"] = json!(recoveries.len());
            run_stats["recoveryAttempts"] = json!(recoveries);
        }
        out["run"] = run_stats;

        for (src, dst) in [
            ("since", "since"),
            ("error", "error"),
            ("failed_step", "failed_action"),
            ("steps", "actions"),
            ("stepsArtifact", "actionsArtifact"),
            ("next", "next"),
            ("recording", "recording"),
        ] {
            if let Some(value) = raw.get(src) {
                out[dst] = value.clone();
            }
        }

        if let Some(observe) = raw.get("final").filter(|f| f.is_object()) {
            out["observe"] = observe.clone();
        }

        let mut report_payload = Map::new();
        if let Some(cursor) = raw.get("cursor") {
            report_payload.insert("cursor".into(), cursor.clone());
        }
        for key in ["triage", "diagnostics", "audit", "map", "graph"] {
            if let Some(section) = raw.get(key).filter(|s| s.is_object()) {
                report_payload.insert(key.to_string(), section.clone());
            }
        }
        if !report_payload.is_empty() {
            out["report"] = Value::Object(report_payload);
        }

        // Run-level recording (flow did not see record_memory_key).
        if let Some(key) = record_memory_key {
            let completed = out["ok"] == json!(true);
            let should_record = completed || record_on_failure;
            if should_record {
                let input: Vec<Value> =
                    actions_raw.iter().filter(|s| s.is_object()).cloned().collect();
                let (sanitized, redacted) = sanitize_runbook_steps(&input);
                let stored = if record_mode == "raw" { input } else { sanitized };
                match ctx.memory.set(&key, Value::Array(stored.clone()), 200_000, 500) {
                    Ok(meta) => {
                        let mut rec = json!({
                            "ok": true,
                            "key": key,
                            "mode": record_mode,
                            "steps": stored.len(),
                        });
                        if redacted > 0 {
                            rec["redacted"] = json!(redacted);
                        }
                        if meta.sensitive {
                            rec["sensitive"] = json!(true);
                        }
                        out["recording"] = rec;
                    }
                    Err(err) => {
                        out["recording"] = json!({
                            "ok": false,
                            "key": key,
                            "mode": record_mode,
                            "error": err.to_string(),
                            "suggestion": "Prefer {{mem:...}} / {{param:...}} placeholders and keep runbooks small",
                        });
                    }
                }
            } else {
                out["recording"] = json!({
                    "ok": false,
                    "key": key,
                    "mode": record_mode,
                    "skipped": true,
                    "reason": "run_failed",
                });
            }
        }

        if let Some(policy_info) = policy_summary(&policy, &warnings) {
            out["policy"] = policy_info;
        }

        // Preserve the screenshot if the final flow attempt attached one.
        let image = flow_res.content.iter().find_map(|c| match c {
            ToolContent::Image { data, mime_type } => Some((data.clone(), mime_type.clone())),
            _ => None,
        });
        match image {
            Some((data, mime_type)) => ToolResult::with_image(out, data, mime_type),
            None => ToolResult::json(out),
        }
    }
}

//! The flow engine: batched step execution under one shared session.

use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use serde_json::{json, Map, Value};
use tracing::{debug, warn};

use artifact_store::artifact_get_hint;
use browsermcp_core_types::{ErrorKind, PolicyMode, ToolError, ToolResult};
use browsermcp_registry::{RegistrySlot, ToolCtx, ToolRegistry};
use cdp_adapter::PageSession;
use session_center::{AutoDialogMode, dialogs::is_no_dialog_error};

use crate::classify::{is_cdp_brick, is_dialog_block, is_ui_transient};
use crate::conditions::best_effort_page_info;
use crate::interpolate::{
    flow_vars_hint, interpolate_flow_vars_step_args, interpolate_mem_vars_step_args,
};
use crate::timeouts::{resolve_timeout_defaults, resolve_timeout_profile, TimeoutDefaults};
use crate::types::{extract_path, is_scalar, normalize_step, step_note, StepMeta};
use crate::watchdog::{step_timeout_seconds, Watchdog};
use crate::MAX_TOTAL_STEPS;

#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub enum FinalKind {
    None,
    #[default]
    Observe,
    Audit,
    Triage,
    Diagnostics,
    Map,
    Graph,
}

impl FinalKind {
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "none" => Some(FinalKind::None),
            "observe" => Some(FinalKind::Observe),
            "audit" => Some(FinalKind::Audit),
            "triage" => Some(FinalKind::Triage),
            "diagnostics" => Some(FinalKind::Diagnostics),
            "map" => Some(FinalKind::Map),
            "graph" => Some(FinalKind::Graph),
            _ => None,
        }
    }
}

#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub enum StepsOutput {
    #[default]
    Compact,
    Errors,
    None,
}

#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub enum ProofScreenshot {
    #[default]
    None,
    Artifact,
}

/// Resolved auto-dialog behavior for this batch (`auto` already mapped
/// through the safety policy).
pub type AutoDialog = Option<AutoDialogMode>;

#[derive(Clone, Debug)]
pub struct FlowOptions {
    pub stop_on_error: bool,
    pub final_kind: FinalKind,
    pub delta_final: bool,
    pub with_screenshot: bool,
    pub steps_output: StepsOutput,
    pub screenshot_on_error: bool,
    pub triage_on_error: bool,
    pub diagnostics_on_error: bool,
    pub step_proof: bool,
    pub proof_screenshot: ProofScreenshot,
    pub screenshot_on_ambiguity: bool,
    pub start_at: usize,
    pub timeouts: TimeoutDefaults,
    pub auto_dialog: AutoDialog,
    pub auto_recover: bool,
    pub recover_hard: bool,
    pub recover_timeout_s: f64,
    pub action_timeout_s: f64,
    pub auto_download: bool,
    pub auto_download_timeout_s: f64,
    pub auto_tab: bool,
    pub auto_affordances: bool,
    pub final_limit: Option<i64>,
    pub record_memory_key: Option<String>,
    pub record_mode: String,
    pub record_on_failure: bool,
}

fn get_bool(args: &Map<String, Value>, key: &str, default: bool) -> bool {
    args.get(key).and_then(Value::as_bool).unwrap_or(default)
}

fn get_f64(args: &Map<String, Value>, key: &str, default: f64) -> f64 {
    args.get(key)
        .and_then(|v| v.as_f64().or_else(|| v.as_str().and_then(|s| s.trim().parse().ok())))
        .unwrap_or(default)
}

impl FlowOptions {
    pub fn parse(args: &Map<String, Value>, policy_mode: PolicyMode) -> Result<Self, Box<ToolResult>> {
        let final_raw = args
            .get("final")
            .and_then(Value::as_str)
            .filter(|s| !s.is_empty())
            .unwrap_or("observe");
        let Some(final_kind) = FinalKind::parse(final_raw) else {
            return Err(Box::new(ToolResult::failure(
                ToolError::new(ErrorKind::Validation, format!("Unknown final: {final_raw}"))
                    .with_tool("flow")
                    .with_suggestion(
                        "Use final='observe' (default), 'map', 'graph', 'audit', 'triage', 'diagnostics', or 'none'",
                    ),
            )));
        };

        let steps_output_raw = args
            .get("steps_output")
            .and_then(Value::as_str)
            .filter(|s| !s.is_empty())
            .unwrap_or("compact")
            .to_ascii_lowercase();
        let steps_output = match steps_output_raw.as_str() {
            "compact" => StepsOutput::Compact,
            "errors" => StepsOutput::Errors,
            "none" => StepsOutput::None,
            other => {
                return Err(Box::new(ToolResult::failure(
                    ToolError::new(ErrorKind::Validation, format!("Unknown steps_output: {other}"))
                        .with_tool("flow")
                        .with_suggestion("Use steps_output='compact' (default), 'errors', or 'none'"),
                )));
            }
        };

        let proof_screenshot = match args
            .get("proof_screenshot")
            .and_then(Value::as_str)
            .unwrap_or("none")
            .trim()
            .to_ascii_lowercase()
            .as_str()
        {
            "artifact" => ProofScreenshot::Artifact,
            _ => ProofScreenshot::None,
        };

        let record_mode = match args
            .get("record_mode")
            .and_then(Value::as_str)
            .unwrap_or("sanitized")
            .trim()
            .to_ascii_lowercase()
            .as_str()
        {
            "raw" => "raw".to_string(),
            _ => "sanitized".to_string(),
        };

        let profile = resolve_timeout_profile(
            args.get("timeout_profile").and_then(Value::as_str),
            "flow",
        );
        let timeouts = resolve_timeout_defaults(profile, "flow");

        // Safety-as-mode: strict disables implicit dialog actions.
        let auto_dialog = match args
            .get("auto_dialog")
            .and_then(Value::as_str)
            .unwrap_or("off")
            .trim()
            .to_ascii_lowercase()
            .as_str()
        {
            "accept" => Some(AutoDialogMode::Accept),
            "dismiss" => Some(AutoDialogMode::Dismiss),
            "auto" => {
                if policy_mode == PolicyMode::Strict {
                    None
                } else {
                    Some(AutoDialogMode::Dismiss)
                }
            }
            _ => None,
        };

        let start_at = args
            .get("start_at")
            .and_then(Value::as_i64)
            .unwrap_or(0)
            .max(0) as usize;

        Ok(Self {
            stop_on_error: get_bool(args, "stop_on_error", true),
            final_kind,
            delta_final: get_bool(args, "delta_final", true),
            with_screenshot: get_bool(args, "with_screenshot", false),
            steps_output,
            screenshot_on_error: get_bool(args, "screenshot_on_error", false),
            triage_on_error: get_bool(args, "triage_on_error", true),
            diagnostics_on_error: get_bool(args, "diagnostics_on_error", false),
            step_proof: get_bool(args, "step_proof", false),
            proof_screenshot,
            screenshot_on_ambiguity: get_bool(args, "screenshot_on_ambiguity", false),
            start_at,
            auto_dialog,
            auto_recover: get_bool(args, "auto_recover", false),
            recover_hard: get_bool(args, "recover_hard", false),
            recover_timeout_s: get_f64(args, "recover_timeout", timeouts.recover_timeout_s)
                .clamp(1.0, 30.0),
            action_timeout_s: get_f64(args, "action_timeout", timeouts.action_timeout_s)
                .clamp(0.2, 120.0),
            auto_download: get_bool(args, "auto_download", false),
            auto_download_timeout_s: get_f64(
                args,
                "auto_download_timeout",
                timeouts.auto_download_timeout_s,
            )
            .clamp(0.0, 60.0),
            auto_tab: get_bool(args, "auto_tab", false),
            auto_affordances: get_bool(args, "auto_affordances", true),
            final_limit: args.get("final_limit").and_then(Value::as_i64),
            record_memory_key: args
                .get("record_memory_key")
                .and_then(Value::as_str)
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(str::to_string),
            record_mode,
            record_on_failure: get_bool(args, "record_on_failure", false),
            timeouts,
        })
    }
}

fn now_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

/// Per-batch execution state. Everything the step loop and the internal
/// actions mutate lives here.
pub(crate) struct RunState<'a> {
    pub ctx: &'a ToolCtx,
    pub registry: Arc<ToolRegistry>,
    pub opts: FlowOptions,
    pub session: Arc<dyn PageSession>,
    pub tab_id: String,
    pub flow_vars: Map<String, Value>,
    pub summaries: Vec<Value>,
    pub first_error: Option<Value>,
    pub collected_next: Vec<String>,
    pub dialogs_auto_handled: u32,
    pub include_stack: Vec<String>,
}

pub(crate) enum DialogGuard {
    Clear,
    Blocked(Value),
}

impl<'a> RunState<'a> {
    pub fn note_first_error(&mut self, i: usize, tool: Option<&str>, error: &str) {
        if self.first_error.is_none() {
            self.first_error = Some(json!({"i": i, "tool": tool, "error": error}));
        }
    }

    pub fn collect_next(&mut self, payload: Option<&Value>) {
        let Some(next) = payload.and_then(|p| p.get("next")).and_then(Value::as_array) else {
            return;
        };
        for item in next {
            let Some(item) = item.as_str().map(str::trim).filter(|s| !s.is_empty()) else {
                continue;
            };
            if !self.collected_next.iter().any(|existing| existing == item) {
                self.collected_next.push(item.to_string());
            }
            if self.collected_next.len() >= 8 {
                break;
            }
        }
    }

    pub fn push_next_hint(&mut self, hint: &str) {
        if self.collected_next.len() < 8 && !self.collected_next.iter().any(|h| h == hint) {
            self.collected_next.push(hint.to_string());
        }
    }

    pub fn drain_ingest(&self) {
        self.ctx.sessions.drain_and_ingest(&self.session);
    }

    pub fn dialog_open(&self) -> bool {
        self.ctx
            .sessions
            .get_telemetry(&self.tab_id)
            .map(|t| t.dialog_open())
            .unwrap_or(false)
    }

    pub fn dialog_meta(&self) -> Value {
        self.ctx
            .sessions
            .get_telemetry(&self.tab_id)
            .and_then(|t| t.dialog_last())
            .unwrap_or(Value::Null)
    }

    /// Epoch-ms "now" that never touches the page while a dialog is open.
    pub async fn safe_js_now_ms(&self) -> i64 {
        self.drain_ingest();
        if self.dialog_open() {
            return now_ms();
        }
        match self
            .session
            .eval_js("Date.now()", Duration::from_secs(2))
            .await
        {
            Ok(Value::Number(n)) => n.as_i64().unwrap_or_else(now_ms),
            Ok(Value::String(s)) => s.trim().parse().unwrap_or_else(|_| now_ms()),
            _ => now_ms(),
        }
    }

    /// Dispatch one concrete tool under the per-step watchdog.
    pub async fn dispatch_guarded(&mut self, tool: &str, args: Value, timeout_s: f64) -> ToolResult {
        let watchdog = Watchdog::start(self.session.clone(), timeout_s);
        let result = if tool == "net" {
            self.handle_net_internal(args).await
        } else {
            self.registry.dispatch(tool, self.ctx, args).await
        };
        let fired = watchdog.as_ref().map(Watchdog::fired).unwrap_or(false);
        if let Some(watchdog) = &watchdog {
            watchdog.stop();
            if fired && result.is_error {
                return ToolResult::failure(
                    ToolError::new(ErrorKind::Timeout, watchdog.timeout_message()).with_tool(tool),
                );
            }
        }
        result
    }

    /// Close a blocking JS dialog with minimal wedge risk: schedule the
    /// out-of-band handler first, then attempt a fast direct close on the
    /// shared connection, polling Tier-0 until the dialog reads closed.
    ///
    /// A "no dialog" CDP error counts as closed only when a follow-up
    /// Tier-0 poll agrees; some browsers report it while the dialog is
    /// still up.
    pub async fn close_dialog_best_effort(&mut self, accept: bool, max_wait_s: f64) -> bool {
        let max_wait_s = max_wait_s.clamp(0.0, 10.0);
        self.ctx
            .sessions
            .schedule_auto_dialog_handle(&self.ctx.config, &self.tab_id, accept);

        let deadline = Instant::now() + Duration::from_secs_f64(max_wait_s.max(0.05));
        loop {
            self.drain_ingest();

            let remaining = deadline.saturating_duration_since(Instant::now());
            let attempt_budget = remaining.as_secs_f64().min(1.0).max(0.2);
            let watchdog = Watchdog::start(self.session.clone(), attempt_budget + 0.2);
            let res = self
                .session
                .send_with_deadline(
                    "Page.handleJavaScriptDialog",
                    json!({"accept": accept}),
                    Duration::from_secs_f64(attempt_budget),
                )
                .await;
            if let Some(watchdog) = watchdog {
                watchdog.stop();
            }

            match res {
                Ok(_) => {
                    self.ctx.sessions.note_dialog_closed(&self.tab_id, accept);
                    self.drain_ingest();
                    return true;
                }
                Err(err) if is_no_dialog_error(&err) => {
                    // Corroborate with telemetry before trusting it.
                    self.drain_ingest();
                    if !self.dialog_open() {
                        self.ctx.sessions.note_dialog_closed(&self.tab_id, accept);
                        return true;
                    }
                }
                Err(_) => {}
            }

            // The out-of-band handler may have won the race.
            if !self.dialog_open() {
                return true;
            }

            if Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    }

    /// Pre/post-step dialog guard. Auto-handles when configured; otherwise
    /// reports the blocking dialog.
    pub async fn dialog_guard(&mut self) -> DialogGuard {
        self.drain_ingest();
        if !self.dialog_open() {
            return DialogGuard::Clear;
        }
        if let Some(mode) = self.opts.auto_dialog {
            let budget = self.opts.action_timeout_s.min(2.0);
            if self.close_dialog_best_effort(mode.accept(), budget).await {
                self.dialogs_auto_handled += 1;
                return DialogGuard::Clear;
            }
        }
        DialogGuard::Blocked(self.dialog_meta())
    }

    pub fn dialog_block_entry(&mut self, i: usize, tool: &str, dialog: &Value) -> Value {
        let next_hint = if self.opts.auto_dialog == Some(AutoDialogMode::Dismiss) {
            "dialog(accept=false)"
        } else {
            "dialog(accept=true)"
        };
        let backup_hint = "tabs(action=\"rescue\")";
        let suggestion = if self.ctx.config.toolset.is_v2() {
            let accept = if self.opts.auto_dialog == Some(AutoDialogMode::Dismiss) {
                "false"
            } else {
                "true"
            };
            format!("Re-run with a dialog action: run(actions=[{{dialog:{{accept:{accept}}}}}])")
        } else {
            format!("Handle the dialog first: {next_hint} (backup: {backup_hint})")
        };
        self.push_next_hint(next_hint);
        self.push_next_hint(backup_hint);
        self.note_first_error(i, Some(tool), "Blocking JS dialog is open");
        json!({
            "i": i,
            "tool": tool,
            "ok": false,
            "error": "Blocking JS dialog is open",
            "details": {
                "type": dialog.get("type").cloned().unwrap_or(Value::Null),
                "message": dialog.get("message").cloned().unwrap_or(Value::Null),
                "url": dialog.get("url").cloned().unwrap_or(Value::Null),
            },
            "suggestion": suggestion,
            "next": [next_hint, backup_hint],
        })
    }

    /// Best-effort close of a blocking DOM overlay (cookie banners,
    /// onboarding modals). Conservative and bounded: hit-tests the
    /// viewport center, prefers close/dismiss over accept, does nothing
    /// when unsure.
    pub async fn dismiss_overlay_best_effort(&mut self, timeout_s: f64) -> bool {
        let js = recipes::dismiss_overlays_js();
        let res = self
            .session
            .eval_js(&js, Duration::from_secs_f64(timeout_s.clamp(0.2, 3.0)))
            .await;
        let Ok(Value::Object(hit)) = res else {
            return false;
        };
        let (Some(x), Some(y)) = (
            hit.get("x").and_then(Value::as_f64),
            hit.get("y").and_then(Value::as_f64),
        ) else {
            return false;
        };
        let clicked = self.session.click_xy(x, y).await.is_ok();
        if clicked {
            tokio::time::sleep(Duration::from_millis(80)).await;
        }
        clicked
    }

    pub fn current_tab_url(&self) -> Option<String> {
        let url = self.session.tab_url();
        (!url.is_empty()).then_some(url)
    }

    // ── net internal action ─────────────────────────────────────────

    /// Tier-0 network helper inside flows: a HAR-lite slice with delta
    /// (`since`/cursor), optional artifact store/export, optional clear.
    pub async fn handle_net_internal(&mut self, args: Value) -> ToolResult {
        let args = args.as_object().cloned().unwrap_or_default();
        let action_raw = args
            .get("action")
            .and_then(Value::as_str)
            .unwrap_or("harLite")
            .trim()
            .to_ascii_lowercase();
        let action = match action_raw.as_str() {
            "harlite" | "har-lite" | "har_lite" | "har" => "harLite",
            "trace" | "nettrace" | "networktrace" | "deep" => "trace",
            other => {
                return ToolResult::failure(
                    ToolError::new(ErrorKind::Validation, format!("Unknown net action: {other}"))
                        .with_tool("net")
                        .with_suggestion("Use net(action=\"harLite\") or net(action=\"trace\")"),
                );
            }
        };

        let since = args.get("since").and_then(Value::as_i64);
        let offset = args.get("offset").and_then(Value::as_u64).unwrap_or(0) as usize;
        let limit = args
            .get("limit")
            .and_then(Value::as_u64)
            .unwrap_or(20)
            .min(200) as usize;
        let export = get_bool(&args, "export", false);
        let store = get_bool(&args, "store", false) || export;
        let overwrite = get_bool(&args, "overwrite", false);
        let clear = get_bool(&args, "clear", false);

        self.drain_ingest();
        let Some(snap) = self.ctx.sessions.tier0_snapshot(&self.tab_id, since, 0, 0) else {
            return ToolResult::failure(
                ToolError::new(ErrorKind::ToolFailure, "Tier-0 telemetry not available for this tab")
                    .with_tool("net")
                    .with_suggestion("navigate(url=...) first, then retry"),
            );
        };

        let mut har_all = snap.har_lite.clone();
        if action == "trace" {
            // Trace narrows by URL substring and resource type; capture
            // stays meta-level (bodies belong to the concrete net tools).
            let include = args.get("include").and_then(Value::as_str);
            let exclude = args.get("exclude").and_then(Value::as_str);
            let types: Vec<String> = args
                .get("types")
                .and_then(Value::as_array)
                .map(|items| {
                    items
                        .iter()
                        .filter_map(Value::as_str)
                        .map(str::to_ascii_lowercase)
                        .collect()
                })
                .unwrap_or_default();
            har_all.retain(|entry| {
                let url = entry.get("url").and_then(Value::as_str).unwrap_or("");
                if let Some(include) = include {
                    if !url.contains(include) {
                        return false;
                    }
                }
                if let Some(exclude) = exclude {
                    if !exclude.is_empty() && url.contains(exclude) {
                        return false;
                    }
                }
                if !types.is_empty() {
                    let entry_type = entry
                        .get("type")
                        .and_then(Value::as_str)
                        .unwrap_or("")
                        .to_ascii_lowercase();
                    if !types.contains(&entry_type) {
                        return false;
                    }
                }
                true
            });
        }

        let total = har_all.len();
        let mut items: Vec<Value> = har_all.iter().skip(offset).cloned().collect();
        if limit > 0 {
            items.truncate(limit);
        }

        let mut payload = json!({
            "ok": true,
            "tool": "net",
            "action": action,
            "cursor": snap.cursor,
            "sessionTabId": self.tab_id.clone(),
            "harLite": {
                "total": total,
                "offset": offset,
                "limit": limit,
                "items": items,
            },
        });
        if let Some(since) = since {
            payload["since"] = json!(since);
        }

        if store {
            let reference = self.ctx.artifacts.put_json(
                if action == "trace" { "net_trace" } else { "net_harlite" },
                &json!({
                    "action": action,
                    "cursor": snap.cursor,
                    "since": since,
                    "harLite": har_all,
                }),
                json!({"total": total, "offset": offset, "limit": limit}),
            );
            payload["artifact"] = json!({
                "id": reference.id.clone(),
                "kind": reference.kind.clone(),
                "mimeType": reference.mime_type.clone(),
                "bytes": reference.bytes,
                "createdAt": reference.created_at,
            });
            let hint = artifact_get_hint(&reference.id, 0, 4000);
            payload["next"] = json!([hint]);

            if export {
                let name = args.get("name").and_then(Value::as_str).filter(|s| !s.trim().is_empty());
                match self.ctx.artifacts.export(&reference.id, None, name, overwrite) {
                    Ok(exported) => {
                        if let Some(export_obj) = exported.get("export") {
                            payload["export"] = export_obj.clone();
                            if let Some(path) = export_obj.get("path").and_then(Value::as_str) {
                                if let Some(next) = payload["next"].as_array_mut() {
                                    next.insert(0, json!(format!("Exported: {path}")));
                                }
                            }
                        }
                    }
                    Err(err) => {
                        debug!(target: "flow.net", error = %err, "net export failed");
                    }
                }
            }
        }

        if clear {
            self.ctx.sessions.clear_har_lite(&self.tab_id);
            payload["cleared"] = json!(true);
        }

        ToolResult::json(payload)
    }

    // ── downloads & tabs ────────────────────────────────────────────

    pub fn download_baseline(&self) -> Vec<String> {
        let dir = self.ctx.sessions.download_dir(&self.tab_id);
        std::fs::read_dir(&dir)
            .map(|entries| {
                entries
                    .filter_map(|e| e.ok())
                    .filter(|e| e.path().is_file())
                    .filter_map(|e| e.file_name().into_string().ok())
                    .collect()
            })
            .unwrap_or_default()
    }

    pub async fn list_tabs_snapshot(&self) -> Option<Vec<Value>> {
        self.ctx
            .sessions
            .list_tabs(&self.ctx.config)
            .await
            .ok()
            .map(|tabs| {
                tabs.into_iter()
                    .map(|t| json!({"id": t.id, "url": t.url, "title": t.title}))
                    .collect()
            })
    }

    /// Diff + switch after a click-like step. Exactly one new tab means
    /// switch; several means ambiguity (recorded, not acted on).
    pub async fn auto_tab_after(&mut self, before: &[Value]) -> Value {
        let Some(after) = self.list_tabs_snapshot().await else {
            return json!({"switched": false, "error": "tab list unavailable"});
        };
        let before_ids: Vec<&str> = before
            .iter()
            .filter_map(|t| t.get("id").and_then(Value::as_str))
            .collect();
        let new_tabs: Vec<&Value> = after
            .iter()
            .filter(|t| {
                t.get("id")
                    .and_then(Value::as_str)
                    .map(|id| !before_ids.contains(&id))
                    .unwrap_or(false)
            })
            .collect();

        match new_tabs.len() {
            0 => json!({"switched": false, "newCount": 0}),
            1 => {
                let tab = new_tabs[0];
                let tab_id = tab.get("id").and_then(Value::as_str).unwrap_or("");
                let switched = self
                    .ctx
                    .sessions
                    .switch_tab(&self.ctx.config, tab_id)
                    .await
                    .unwrap_or(false);
                if switched {
                    if let Some((session, target)) = self.ctx.sessions.active_session() {
                        self.session = session;
                        self.tab_id = target.id;
                        self.ctx.sessions.ensure_telemetry(&self.session).await;
                    }
                }
                let mut out = json!({"switched": switched, "tabId": tab_id});
                if let Some(url) = tab.get("url").and_then(Value::as_str) {
                    out["url"] = json!(url);
                }
                if let Some(title) = tab.get("title").and_then(Value::as_str) {
                    out["title"] = json!(title);
                }
                out
            }
            n => json!({"switched": false, "ambiguous": true, "newCount": n}),
        }
    }
}

/// Public engine facade registered as the `flow` (and via `run::RunTool`,
/// the `run`) handler.
pub struct FlowEngine {
    registry: RegistrySlot,
}

impl FlowEngine {
    pub fn new(registry: RegistrySlot) -> Self {
        Self { registry }
    }

    fn registry(&self) -> Option<Arc<ToolRegistry>> {
        self.registry.get().cloned()
    }

    pub async fn handle_flow(&self, ctx: &ToolCtx, args: &Map<String, Value>) -> ToolResult {
        let Some(steps_raw) = args
            .get("steps")
            .and_then(Value::as_array)
            .filter(|s| !s.is_empty())
            .cloned()
        else {
            return ToolResult::failure(
                ToolError::new(ErrorKind::Validation, "Missing or empty 'steps' array")
                    .with_tool("flow")
                    .with_suggestion(
                        "Provide steps=[{tool:'navigate', args:{url:'...'}}, ...] or steps=[{navigate:{url:'...'}}, ...]",
                    ),
            );
        };

        let opts = match FlowOptions::parse(args, ctx.policy.mode()) {
            Ok(opts) => opts,
            Err(result) => return *result,
        };

        let Some(registry) = self.registry() else {
            return ToolResult::error("Tool registry not initialized", ErrorKind::ToolFailure);
        };

        // One shared session for the whole batch.
        let guard = match ctx.sessions.shared_session(&ctx.config).await {
            Ok(guard) => guard,
            Err(err) => {
                return ToolResult::failure(
                    ToolError::new(ErrorKind::CdpBrick, err.to_string())
                        .with_tool("flow")
                        .with_suggestion("Try browser(action=\"recover\") then re-run"),
                );
            }
        };

        let tab_id = guard.target.id.clone();
        ctx.sessions.ensure_telemetry(&guard.session).await;

        // Async dialog handling directive for the batch (TTL-bounded).
        if let Some(mode) = opts.auto_dialog {
            ctx.sessions.set_auto_dialog(
                &tab_id,
                mode,
                Duration::from_secs_f64((opts.action_timeout_s * 2.0).max(10.0)),
            );
        } else {
            ctx.sessions.clear_auto_dialog(&tab_id);
        }

        let mut state = RunState {
            ctx,
            registry,
            opts,
            session: guard.session.clone(),
            tab_id: tab_id.clone(),
            flow_vars: Map::new(),
            summaries: Vec::new(),
            first_error: None,
            collected_next: Vec::new(),
            dialogs_auto_handled: 0,
            include_stack: Vec::new(),
        };

        let result = self.execute(&mut state, steps_raw).await;
        ctx.sessions.clear_auto_dialog(&tab_id);
        result
    }

    async fn execute(&self, state: &mut RunState<'_>, mut steps_raw: Vec<Value>) -> ToolResult {
        let started = Instant::now();
        let steps_input = steps_raw.clone();
        let start_at = state.opts.start_at.min(steps_raw.len());

        // Baseline cursor for delta reports; never probes the page while a
        // dialog is open (wall clock is close enough then).
        let need_baseline = state.opts.delta_final
            && (matches!(
                state.opts.final_kind,
                FinalKind::Observe | FinalKind::Triage | FinalKind::Diagnostics
            ) || state.opts.triage_on_error
                || state.opts.diagnostics_on_error
                || state.opts.step_proof);
        let baseline_cursor = if need_baseline {
            Some(state.safe_js_now_ms().await)
        } else {
            None
        };

        let mut i = 0usize;
        while i < steps_raw.len() {
            if i < start_at {
                i += 1;
                continue;
            }
            if steps_raw.len() > MAX_TOTAL_STEPS {
                state.summaries.push(json!({
                    "i": i,
                    "ok": false,
                    "error": "Expanded step list too large",
                    "details": {"steps": steps_raw.len(), "max_total_steps": MAX_TOTAL_STEPS},
                    "suggestion": "Reduce macro nesting/runbook size, or split into multiple runs",
                }));
                state.note_first_error(i, None, "Expanded step list too large");
                break;
            }

            let (tool_name, tool_args, meta) = normalize_step(&steps_raw[i]);
            let Some(mut tool_name) = tool_name else {
                state
                    .summaries
                    .push(json!({"i": i, "ok": false, "error": "Invalid step format"}));
                state.note_first_error(i, None, "Invalid step format");
                if state.opts.stop_on_error {
                    break;
                }
                i += 1;
                continue;
            };
            let meta = meta.unwrap_or_default();

            // Unwind marker injected by include_memory_steps expansion.
            if tool_name == "__macro_end" {
                if let Some(key) = tool_args.get("memory_key").and_then(Value::as_str) {
                    let key = key.trim();
                    if state.include_stack.last().map(String::as_str) == Some(key) {
                        state.include_stack.pop();
                    } else if let Some(pos) =
                        state.include_stack.iter().position(|k| k == key)
                    {
                        state.include_stack.remove(pos);
                    }
                }
                i += 1;
                continue;
            }

            // Flow vars, then memory refs; both fail the step closed with
            // the known keys as a hint.
            let mut tool_args =
                match interpolate_flow_vars_step_args(&tool_name, &tool_args, &state.flow_vars) {
                    Ok(args) => args,
                    Err(var) => {
                        state.summaries.push(json!({
                            "i": i,
                            "tool": tool_name.clone(),
                            "ok": false,
                            "error": "Missing flow variable",
                            "details": {"var": var, "known": flow_vars_hint(&state.flow_vars, 20)},
                            "suggestion": "Export a value from an earlier step via export={myVar:'path.to.scalar'} then reference it via {{myVar}} or ${myVar}",
                        }));
                        state.note_first_error(i, Some(&tool_name), "Missing flow variable");
                        if state.opts.stop_on_error {
                            break;
                        }
                        i += 1;
                        continue;
                    }
                };

            let (actual, note_args) =
                match interpolate_mem_vars_step_args(&tool_name, &tool_args, &state.ctx.memory) {
                    Ok(pair) => pair,
                    Err(key) => {
                        state.summaries.push(json!({
                            "i": i,
                            "tool": tool_name.clone(),
                            "ok": false,
                            "error": "Missing memory key",
                            "details": {"key": key, "known": state.ctx.memory.keys_hint(20)},
                            "suggestion": "Set it via browser(action='memory', memory_action='set', key='...', value=...) then reference it via {{mem:key}}",
                        }));
                        state.note_first_error(i, Some(&tool_name), "Missing memory key");
                        if state.opts.stop_on_error {
                            break;
                        }
                        i += 1;
                        continue;
                    }
                };
            tool_args = actual;
            let mut tool_args_note = note_args;

            // Fail-fast while a blocking dialog is open: anything that may
            // evaluate in the page would hang CDP.
            if tool_name != "dialog" && tool_name != "browser" {
                if let DialogGuard::Blocked(dialog) = state.dialog_guard().await {
                    let entry = state.dialog_block_entry(i, &tool_name, &dialog);
                    state.summaries.push(entry);
                    if state.opts.stop_on_error {
                        break;
                    }
                    i += 1;
                    continue;
                }
            }

            // Internal actions may splice more steps right after i.
            if crate::types::INTERNAL_ACTIONS.contains(&tool_name.as_str()) {
                let outcome = crate::internal::handle_internal(
                    state,
                    i,
                    &tool_name,
                    &tool_args,
                    &tool_args_note,
                    &meta,
                    &mut steps_raw,
                )
                .await;
                if outcome.should_break {
                    break;
                }
                i += 1;
                continue;
            }

            // `act`: resolve an affordance ref/label into a concrete call.
            let mut display_tool = tool_name.clone();
            let mut act_info: Option<Value> = None;
            if tool_name == "act" {
                match crate::internal::resolve_act(state, i, &tool_args).await {
                    Ok(resolved) => {
                        tool_name = resolved.tool;
                        let overrides = tool_args.get("args").and_then(Value::as_object).cloned();
                        let overrides_note =
                            tool_args_note.get("args").and_then(Value::as_object).cloned();
                        let mut merged = resolved.args.clone();
                        if let Some(overrides) = overrides {
                            for (k, v) in overrides {
                                merged.insert(k, v);
                            }
                        }
                        let mut merged_note = resolved.args;
                        if let Some(overrides_note) = overrides_note {
                            for (k, v) in overrides_note {
                                merged_note.insert(k, v);
                            }
                        }
                        tool_args = merged;
                        tool_args_note = merged_note;
                        display_tool = "act".to_string();
                        act_info = Some(resolved.info);
                    }
                    Err(entry) => {
                        let error = entry
                            .get("error")
                            .and_then(Value::as_str)
                            .unwrap_or("act failed")
                            .to_string();
                        state.summaries.push(entry);
                        state.note_first_error(i, Some("act"), &error);
                        if state.opts.stop_on_error {
                            break;
                        }
                        i += 1;
                        continue;
                    }
                }
            }

            if tool_name == "flow" || tool_name == "run" {
                state.summaries.push(json!({
                    "i": i, "tool": tool_name.clone(), "ok": false,
                    "error": "Nested flow/run is not allowed",
                }));
                state.note_first_error(i, Some(&tool_name), "Nested flow/run is not allowed");
                if state.opts.stop_on_error {
                    break;
                }
                i += 1;
                continue;
            }

            let step = crate::engine::execute_concrete_step(
                state,
                i,
                &display_tool,
                tool_name.clone(),
                tool_args,
                tool_args_note,
                &meta,
                act_info,
            )
            .await;

            match step {
                StepOutcome::Continue(entry) => {
                    state.summaries.push(entry);
                }
                StepOutcome::Stop(entry) => {
                    state.summaries.push(entry);
                    break;
                }
                StepOutcome::Brick(result) => return result,
            }

            // Post-step dialog guard: dialogs can open after a step
            // returns (setTimeout(alert)); the final report would hang.
            if tool_name != "dialog" && tool_name != "browser" {
                if let DialogGuard::Blocked(dialog) = state.dialog_guard().await {
                    let entry = state.dialog_block_entry(i, "dialog_guard", &dialog);
                    state.summaries.push(entry);
                    if state.opts.stop_on_error {
                        break;
                    }
                }
            }

            i += 1;
        }

        crate::engine::assemble_report(
            state,
            &steps_raw,
            &steps_input,
            start_at,
            started,
            baseline_cursor,
        )
        .await
    }
}

pub(crate) enum StepOutcome {
    Continue(Value),
    Stop(Value),
    Brick(ToolResult),
}

/// Execute one concrete (non-internal) step: watchdog, bounded retries,
/// auto-download, auto-tab, exports, proof, image capture.
#[allow(clippy::too_many_arguments)]
pub(crate) async fn execute_concrete_step(
    state: &mut RunState<'_>,
    i: usize,
    display_tool: &str,
    tool_name: String,
    mut tool_args: Map<String, Value>,
    tool_args_note: Map<String, Value>,
    meta: &StepMeta,
    act_info: Option<Value>,
) -> StepOutcome {
    // Auto-tab applies to click-like steps, or any step marked auto_tab.
    let auto_tab_requested = meta.auto_tab.unwrap_or(state.opts.auto_tab);
    let auto_tab_applicable =
        auto_tab_requested && matches!(tool_name.as_str(), "click" | "type" | "form");
    let auto_tab_before = if auto_tab_applicable {
        state.list_tabs_snapshot().await
    } else {
        None
    };

    // Download plan: snapshot the directory before click-like actions so
    // instant downloads are not missed.
    let download_plan = DownloadPlan::resolve(state, &tool_name, meta);
    if download_plan.wanted && tool_name == "click" && !tool_args.contains_key("wait_after") {
        // Auto-wait navigation can cancel or mask browser downloads.
        tool_args.insert("wait_after".into(), json!("none"));
    }
    let download_baseline = if download_plan.wanted {
        state.ctx.sessions.ensure_downloads(&state.session).await;
        Some(state.download_baseline())
    } else {
        None
    };

    let step_cursor = if state.opts.step_proof {
        Some(state.safe_js_now_ms().await)
    } else {
        None
    };

    // Bounded retries: dialog-blocked read-ish steps and UI-transient
    // interaction steps get exactly one extra attempt. Irreversible steps
    // never retry.
    let dialog_retryable = state.opts.auto_dialog.is_some()
        && matches!(tool_name.as_str(), "js" | "page" | "wait");
    let ui_retryable =
        matches!(tool_name.as_str(), "click" | "type") && !meta.irreversible;
    let max_attempts = if dialog_retryable || ui_retryable { 2 } else { 1 };

    let timeout_s = step_timeout_seconds(state.opts.action_timeout_s, &tool_args);
    let mut attempt = 0u32;
    let mut overlay_dismissed = false;
    let mut tool_result;
    loop {
        attempt += 1;
        tool_result = state
            .dispatch_guarded(&tool_name, Value::Object(tool_args.clone()), timeout_s)
            .await;

        if !tool_result.is_error || attempt >= max_attempts {
            break;
        }

        let err = tool_result.error_message().map(str::to_string);

        if ui_retryable && !overlay_dismissed && is_ui_transient(err.as_deref()) {
            overlay_dismissed = state
                .dismiss_overlay_best_effort(state.opts.action_timeout_s.min(0.9))
                .await;
            // Even a no-op dismiss earns one retry: the element may appear
            // a beat after the first probe.
            tokio::time::sleep(Duration::from_millis(120)).await;
            continue;
        }

        state.drain_ingest();
        let dialog_now = state.dialog_open();
        if !(is_dialog_block(err.as_deref()) || dialog_now) {
            break;
        }
        let Some(mode) = state.opts.auto_dialog else {
            break;
        };
        let budget = state.opts.action_timeout_s.min(2.0);
        if state.close_dialog_best_effort(mode.accept(), budget).await {
            state.dialogs_auto_handled += 1;
            continue;
        }
        break;
    }

    state.collect_next(tool_result.data.as_ref());

    // Auto-download capture runs after the main step so retries cannot
    // double-trigger it.
    let mut download_payload: Option<Value> = None;
    let mut download_error: Option<String> = None;
    let mut download_suggestion: Option<String> = None;
    if download_plan.wanted && !tool_result.is_error {
        let dl_args = json!({
            "timeout": download_plan.timeout_s,
            "store": download_plan.store,
            "sha256": download_plan.sha256,
            "sha256_max_bytes": download_plan.sha256_max_bytes,
            "poll_interval": download_plan.poll_interval_s,
            "stable_ms": download_plan.stable_ms,
            "_baseline": download_baseline.unwrap_or_default(),
        });
        let dl_timeout = step_timeout_seconds(
            state.opts.action_timeout_s,
            json!({"timeout": download_plan.timeout_s})
                .as_object()
                .unwrap(),
        );
        let dl_result = state.dispatch_guarded("download", dl_args, dl_timeout).await;
        if !dl_result.is_error {
            state.collect_next(dl_result.data.as_ref());
            download_payload = dl_result.data;
        } else {
            let message = dl_result
                .error_message()
                .unwrap_or("Download capture failed")
                .to_string();
            download_suggestion = dl_result.suggestion().map(str::to_string);
            // Best-effort mode: absence of a download is a no-op.
            if download_plan.required
                || !message.to_ascii_lowercase().contains("timed out waiting for a new download")
            {
                download_error = Some(message);
            } else {
                download_suggestion = None;
            }
        }
    }

    let auto_tab_result = match (&auto_tab_before, tool_result.is_error) {
        (Some(before), false) => Some(state.auto_tab_after(before).await),
        _ => None,
    };

    // CDP brick: recover and stop. Retrying the same action automatically
    // could double-click/type; the caller resumes deterministically.
    if tool_result.is_error && state.opts.auto_recover {
        let err = tool_result.error_message().map(str::to_string);
        if is_cdp_brick(err.as_deref()) {
            let recovery = state
                .registry
                .dispatch(
                    "browser",
                    state.ctx,
                    json!({
                        "action": "recover",
                        "hard": state.opts.recover_hard,
                        "timeout": state.opts.recover_timeout_s,
                    }),
                )
                .await;
            return StepOutcome::Brick(ToolResult::failure(
                ToolError::new(
                    ErrorKind::CdpBrick,
                    "CDP brick detected during flow; attempted recovery",
                )
                .with_tool("flow")
                .with_suggestion(format!(
                    "Re-run the same run/actions after recovery (resume hint: start_at={i})"
                ))
                .with_details(json!({
                    "failedStep": {"i": i, "tool": display_tool, "resolvedTool": tool_name},
                    "error": err,
                    "recovery": recovery.data,
                })),
            ));
        }
    }

    let download_detected = download_payload
        .as_ref()
        .and_then(|p| p.get("download"))
        .map(Value::is_object)
        .unwrap_or(false);
    let mut ok = !tool_result.is_error;
    if ok && download_plan.wanted && download_plan.required && !download_detected {
        ok = false;
    }

    let note = step_note(&tool_name, &tool_args_note);
    let mut entry = json!({"i": i, "tool": display_tool, "ok": ok});
    if !note.is_empty() {
        entry["note"] = json!(note);
    }
    if let Some(label) = &meta.label {
        entry["label"] = json!(label);
    }
    if let Some(info) = act_info {
        if let Value::Object(info) = info {
            for (k, v) in info {
                entry[k] = v;
            }
        }
        entry["resolvedTool"] = json!(tool_name.clone());
    }
    if let Some(auto_tab) = auto_tab_result {
        entry["autoTab"] = auto_tab;
    }
    if attempt > 1 {
        entry["attempts"] = json!(attempt);
        if overlay_dismissed {
            entry["overlayDismissed"] = json!(true);
        }
    }

    // Exports: scalars only, visible to every later step.
    if ok {
        if let (Some(export_spec), Some(payload)) = (&meta.export, tool_result.data.as_ref()) {
            let mut exported = Map::new();
            for (out_key, path) in export_spec {
                let out_key = out_key.trim();
                let Some(path) = path.as_str().map(str::trim).filter(|p| !p.is_empty()) else {
                    continue;
                };
                if out_key.is_empty() {
                    continue;
                }
                if let Some(value) = extract_path(payload, path) {
                    if is_scalar(value) {
                        exported.insert(out_key.to_string(), value.clone());
                    }
                }
            }
            if !exported.is_empty() {
                entry["export"] = Value::Object(exported.clone());
                for (k, v) in exported {
                    state.flow_vars.insert(k, v);
                }
            }
        }
    }

    let mut stop = false;
    if tool_result.is_error {
        let message = tool_result
            .error_message()
            .unwrap_or("Tool failed")
            .to_string();
        entry["error"] = json!(message);
        if let Some(suggestion) = tool_result.suggestion() {
            entry["suggestion"] = json!(suggestion);
        }
        if meta.optional {
            entry["optional"] = json!(true);
        } else {
            state.note_first_error(i, Some(&tool_name), &message);
            if state.opts.stop_on_error {
                stop = true;
            }
        }
    } else {
        if download_detected {
            if let Some(payload) = &download_payload {
                let mut dl_entry = Map::new();
                if let Some(dl) = payload.get("download").and_then(Value::as_object) {
                    for key in ["fileName", "bytes", "mimeType", "sha256"] {
                        if let Some(value) = dl.get(key) {
                            dl_entry.insert(key.to_string(), value.clone());
                        }
                    }
                }
                if let Some(artifact) = payload.get("artifact").and_then(Value::as_object) {
                    let mut art = Map::new();
                    for key in ["id", "mimeType", "bytes", "sha256"] {
                        if let Some(value) = artifact.get(key) {
                            art.insert(key.to_string(), value.clone());
                        }
                    }
                    if art.contains_key("id") {
                        dl_entry.insert("artifact".into(), Value::Object(art));
                    }
                }
                if !dl_entry.is_empty() {
                    entry["download"] = Value::Object(dl_entry);
                }
            }
        }

        if download_plan.wanted && download_plan.required && !download_detected {
            entry["error"] = json!("Download expected but not detected");
            if let Some(err) = &download_error {
                entry["details"] = json!({"downloadError": err});
            }
            if let Some(suggestion) = &download_suggestion {
                entry["suggestion"] = json!(suggestion);
            }
            state.note_first_error(i, Some(&tool_name), "Download expected but not detected");
            if state.opts.stop_on_error {
                stop = true;
            }
        }
    }

    // Per-step proof (cheap and bounded). Never probes under a dialog.
    if let Some(since) = step_cursor {
        state.drain_ingest();
        if state.dialog_open() {
            if let Some(mode) = state.opts.auto_dialog {
                let budget = state.opts.action_timeout_s.min(1.5);
                if state.close_dialog_best_effort(mode.accept(), budget).await {
                    state.dialogs_auto_handled += 1;
                }
            }
        }
        if let Some(proof) = crate::proof::build_step_proof(
            state,
            since,
            &tool_name,
            i,
            tool_result.data.as_ref(),
        )
        .await
        {
            entry["proof"] = proof;
        }
    }

    // Step images (captcha shots and the like) are stored off-context.
    if let Some(image) = tool_result.content.iter().find(|c| c.is_image()) {
        if let browsermcp_core_types::ToolContent::Image { data, mime_type } = image {
            match state.ctx.artifacts.put_image_b64(
                "step_image",
                data,
                mime_type,
                json!({"tool": display_tool, "i": i, "label": meta.label.clone()}),
            ) {
                Ok(reference) => {
                    let hint = artifact_get_hint(&reference.id, 0, 4000);
                    entry["imageArtifact"] = json!({
                        "id": reference.id.clone(),
                        "kind": reference.kind.clone(),
                        "mimeType": reference.mime_type.clone(),
                        "bytes": reference.bytes,
                        "createdAt": reference.created_at,
                    });
                    entry["next"] = json!([hint]);
                    state.push_next_hint(&hint);
                }
                Err(err) => {
                    warn!(target: "flow.engine", error = %err, "step image store failed");
                }
            }
        }
    }

    if stop {
        StepOutcome::Stop(entry)
    } else {
        StepOutcome::Continue(entry)
    }
}

struct DownloadPlan {
    wanted: bool,
    required: bool,
    timeout_s: f64,
    store: bool,
    sha256: bool,
    sha256_max_bytes: u64,
    poll_interval_s: f64,
    stable_ms: u64,
}

impl DownloadPlan {
    fn resolve(state: &RunState<'_>, tool_name: &str, meta: &StepMeta) -> Self {
        let mut plan = Self {
            wanted: false,
            required: false,
            timeout_s: state.opts.auto_download_timeout_s,
            store: true,
            sha256: true,
            sha256_max_bytes: 209_715_200,
            poll_interval_s: 0.2,
            stable_ms: 500,
        };

        let explicit = match &meta.download {
            Some(Value::Bool(enabled)) => Some(*enabled),
            Some(Value::Object(cfg)) => {
                plan.required = cfg.get("required").and_then(Value::as_bool).unwrap_or(false);
                if let Some(timeout) = cfg.get("timeout").and_then(Value::as_f64) {
                    plan.timeout_s = timeout.clamp(0.0, 180.0);
                }
                if let Some(store) = cfg.get("store").and_then(Value::as_bool) {
                    plan.store = store;
                }
                if let Some(sha256) = cfg.get("sha256").and_then(Value::as_bool) {
                    plan.sha256 = sha256;
                }
                if let Some(max) = cfg.get("sha256_max_bytes").and_then(Value::as_u64) {
                    plan.sha256_max_bytes = max.min(2_000_000_000);
                }
                if let Some(poll) = cfg.get("poll_interval").and_then(Value::as_f64) {
                    plan.poll_interval_s = poll.clamp(0.05, 1.0);
                }
                if let Some(stable) = cfg.get("stable_ms").and_then(Value::as_u64) {
                    plan.stable_ms = stable.min(30_000);
                }
                Some(cfg.get("enabled").and_then(Value::as_bool).unwrap_or(true))
            }
            _ => None,
        };

        plan.wanted = match explicit {
            Some(enabled) => enabled,
            None => state.opts.auto_download && tool_name == "click",
        };
        // Never auto-capture after an explicit download step.
        if tool_name == "download" {
            plan.wanted = false;
        }
        plan
    }
}

/// Keep flow outputs cognitively cheap: errors + first 2 + last 2, capped.
pub(crate) fn trim_step_summaries(steps: &[Value], max_items: usize) -> Vec<Value> {
    if steps.len() <= max_items {
        return steps.to_vec();
    }

    let mut chosen: std::collections::BTreeMap<i64, Value> = std::collections::BTreeMap::new();
    let errors = steps
        .iter()
        .filter(|s| s.get("ok") == Some(&Value::Bool(false)));
    let head = steps.iter().take(2);
    let tail = steps.iter().rev().take(2);
    for entry in errors.chain(head).chain(tail) {
        if let Some(i) = entry.get("i").and_then(Value::as_i64) {
            chosen.insert(i, entry.clone());
            if chosen.len() >= max_items * 2 {
                break;
            }
        }
    }
    let trimmed: Vec<Value> = chosen.into_values().take(max_items).collect();
    trimmed
}

/// Build the final payload: stats, trimmed step list, hints, final page
/// context, the requested report section, and the optional recording.
pub(crate) async fn assemble_report(
    state: &mut RunState<'_>,
    steps_raw: &[Value],
    steps_input: &[Value],
    start_at: usize,
    started: Instant,
    baseline_cursor: Option<i64>,
) -> ToolResult {
    let duration_ms = started.elapsed().as_millis() as i64;
    let executed = state.summaries.len();
    let succeeded = state
        .summaries
        .iter()
        .filter(|s| s.get("ok") == Some(&Value::Bool(true)))
        .count();

    let planned_total = steps_raw
        .iter()
        .enumerate()
        .filter(|(j, _)| *j >= start_at)
        .filter(|(_, step)| {
            let (tool, _, _) = normalize_step(step);
            tool.as_deref() != Some("__macro_end")
        })
        .count();

    let completed = executed == planned_total && state.first_error.is_none();

    let mut tool_counts: Map<String, Value> = Map::new();
    for summary in &state.summaries {
        if let Some(tool) = summary.get("tool").and_then(Value::as_str) {
            let count = tool_counts
                .get(tool)
                .and_then(Value::as_i64)
                .unwrap_or(0);
            tool_counts.insert(tool.to_string(), json!(count + 1));
        }
    }

    let mut flow_stats = json!({
        "steps_total": planned_total,
        "steps_executed": executed,
        "succeeded": succeeded,
        "failed": executed - succeeded,
        "duration_ms": duration_ms,
        "stopped_on_error": state.first_error.is_some() && state.opts.stop_on_error,
    });
    if !tool_counts.is_empty() {
        flow_stats["toolCounts"] = Value::Object(tool_counts);
    }
    if start_at > 0 {
        flow_stats["start_at"] = json!(start_at);
    }
    if state.dialogs_auto_handled > 0 {
        flow_stats["dialogsAutoHandled"] = json!(state.dialogs_auto_handled);
    }

    let mut out = json!({"ok": completed, "flow": flow_stats});

    if let Some(first_error) = &state.first_error {
        out["error"] = first_error.get("error").cloned().unwrap_or(Value::Null);
        out["failed_step"] = json!({
            "i": first_error.get("i").cloned().unwrap_or(Value::Null),
            "tool": first_error.get("tool").cloned().unwrap_or(Value::Null),
        });
    }

    match state.opts.steps_output {
        StepsOutput::Compact => {
            if state.summaries.len() > 8 {
                let reference = state.ctx.artifacts.put_json(
                    "flow_steps",
                    &json!({"steps": state.summaries.clone()}),
                    json!({
                        "stepsTotal": state.summaries.len(),
                        "stepsShown": 8,
                    }),
                );
                out["stepsArtifact"] = json!({
                    "id": reference.id.clone(),
                    "kind": reference.kind.clone(),
                    "mimeType": reference.mime_type.clone(),
                    "bytes": reference.bytes,
                    "createdAt": reference.created_at,
                });
                let hint = artifact_get_hint(&reference.id, 0, 4000);
                out["next"] = json!([hint]);
            }
            out["steps"] = Value::Array(trim_step_summaries(&state.summaries, 8));
        }
        StepsOutput::Errors => {
            let errors: Vec<Value> = state
                .summaries
                .iter()
                .filter(|s| s.get("ok") == Some(&Value::Bool(false)))
                .cloned()
                .collect();
            if !errors.is_empty() {
                out["steps"] = Value::Array(errors);
            }
        }
        StepsOutput::None => {}
    }

    if let Some(baseline) = baseline_cursor {
        out["since"] = json!(baseline);
    }

    // Merge step-level drilldown hints (cap 10).
    if !state.collected_next.is_empty() {
        let mut merged: Vec<String> = out
            .get("next")
            .and_then(Value::as_array)
            .map(|items| {
                items
                    .iter()
                    .filter_map(Value::as_str)
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default();
        for item in &state.collected_next {
            if !merged.contains(item) {
                merged.push(item.clone());
            }
            if merged.len() >= 10 {
                break;
            }
        }
        if !merged.is_empty() {
            out["next"] = json!(merged);
        }
    }

    // Final dialog guard: dialogs opened by async timers after the last
    // action must not hang the final snapshots.
    state.drain_ingest();
    if state.dialog_open() {
        if let Some(mode) = state.opts.auto_dialog {
            let budget = state.opts.action_timeout_s.min(2.0);
            if state.close_dialog_best_effort(mode.accept(), budget).await {
                state.dialogs_auto_handled += 1;
                if let Some(flow_stats) = out.get_mut("flow") {
                    flow_stats["dialogsAutoHandled"] = json!(state.dialogs_auto_handled);
                }
            }
        }
        if state.dialog_open() {
            out["final"] = json!({"dialogOpen": true});
        }
    }

    let dialog_still_open = state.dialog_open();

    // Final page context (cheap) unless a dialog still blocks evaluation.
    if !dialog_still_open {
        if let Some(info) = best_effort_page_info(&state.session, &state.ctx.sessions).await {
            out["final"] = json!({
                "url": info.get("url").cloned().unwrap_or(Value::Null),
                "title": info.get("title").cloned().unwrap_or(Value::Null),
                "readyState": info.get("readyState").cloned().unwrap_or(Value::Null),
            });
        }
    }

    let error_happened = state.first_error.is_some();
    let since_arg = if state.opts.delta_final {
        baseline_cursor
    } else {
        None
    };
    let final_limit_triage = state.opts.final_limit.unwrap_or(30);
    let final_limit_diag = state.opts.final_limit.unwrap_or(50);

    let want_triage =
        state.opts.final_kind == FinalKind::Triage || (error_happened && state.opts.triage_on_error);
    let want_diag = state.opts.final_kind == FinalKind::Diagnostics
        || (error_happened && state.opts.diagnostics_on_error);

    if !dialog_still_open {
        if want_triage {
            if let Some(payload) = safe_final_call(
                state,
                json!({"detail": "triage", "since": since_arg, "limit": final_limit_triage}),
                state.opts.action_timeout_s.min(10.0),
            )
            .await
            {
                let quiet = state.opts.final_kind == FinalKind::Triage
                    && !error_happened
                    && state.opts.delta_final
                    && !triage_has_signal(&payload);
                if quiet {
                    // Success path, delta-only, nothing new: keep the cursor.
                    if let Some(cursor) = payload.get("cursor") {
                        out["cursor"] = cursor.clone();
                    }
                } else {
                    out["triage"] = payload;
                }
            }
        }

        if want_diag {
            if let Some(payload) = safe_final_call(
                state,
                json!({"detail": "diagnostics", "since": since_arg, "limit": final_limit_diag}),
                state.opts.action_timeout_s.min(10.0),
            )
            .await
            {
                if state.opts.final_kind == FinalKind::Diagnostics
                    || error_happened
                    || diag_has_signal(&payload)
                {
                    out["diagnostics"] = payload;
                }
            }
        }

        if state.opts.final_kind == FinalKind::Audit {
            if let Some(payload) = safe_final_call(
                state,
                json!({"detail": "audit", "since": since_arg, "limit": final_limit_triage}),
                state.opts.action_timeout_s.min(15.0),
            )
            .await
            {
                out["audit"] = payload;
            }
        }

        if state.opts.final_kind == FinalKind::Map {
            if let Some(payload) = safe_final_call(
                state,
                json!({"detail": "map", "since": since_arg, "limit": final_limit_triage}),
                state.opts.action_timeout_s.min(15.0),
            )
            .await
            {
                out["map"] = payload;
            }
        }

        if state.opts.final_kind == FinalKind::Graph {
            if let Some(payload) = safe_final_call(
                state,
                json!({"detail": "graph", "limit": final_limit_triage}),
                state.opts.action_timeout_s.min(10.0),
            )
            .await
            {
                out["graph"] = payload;
            }
        }
    }

    // Observe bundle: Tier-0 counters + insights + resources + perf,
    // merged into `final`.
    if out.get("final").map(Value::is_object).unwrap_or(false) {
        crate::proof::enrich_observe(state, &mut out, since_arg).await;
    }

    // Error screenshot, stored off-context with a drilldown hint.
    if error_happened && state.opts.screenshot_on_error && !dialog_still_open {
        if let Ok(shot) = state.session.screenshot_b64().await {
            if let Ok(reference) = state.ctx.artifacts.put_image_b64(
                "flow_error_screenshot",
                &shot,
                "image/png",
                json!({"failedStep": state.first_error.clone()}),
            ) {
                out["errorScreenshot"] = json!({
                    "id": reference.id.clone(),
                    "mimeType": reference.mime_type.clone(),
                    "bytes": reference.bytes,
                });
                let hint = artifact_get_hint(&reference.id, 0, 4000);
                if let Some(next) = out.get_mut("next").and_then(Value::as_array_mut) {
                    if next.len() < 10 {
                        next.push(json!(hint));
                    }
                } else {
                    out["next"] = json!([hint]);
                }
            }
        }
    }

    // Recording: the original step list, not the interpolated one.
    if let Some(key) = state.opts.record_memory_key.clone() {
        let should_record = completed || state.opts.record_on_failure;
        out["recording"] = record_runbook(state, &key, steps_input, should_record);
    }

    if state.opts.with_screenshot && !state.dialog_open() {
        if let Ok(shot) = state.session.screenshot_b64().await {
            return ToolResult::with_image(out, shot, "image/png");
        }
    }

    ToolResult::json(out)
}

fn record_runbook(
    state: &mut RunState<'_>,
    key: &str,
    steps_input: &[Value],
    should_record: bool,
) -> Value {
    use policy_center::runbook::sanitize_runbook_steps;

    if !should_record {
        return json!({
            "ok": false,
            "key": key,
            "mode": state.opts.record_mode.clone(),
            "skipped": true,
            "reason": "flow_failed",
        });
    }

    let input: Vec<Value> = steps_input.iter().filter(|s| s.is_object()).cloned().collect();
    let (sanitized, redacted) = sanitize_runbook_steps(&input);
    let stored = if state.opts.record_mode == "raw" {
        input
    } else {
        sanitized
    };

    match state
        .ctx
        .memory
        .set(key, Value::Array(stored.clone()), 200_000, 500)
    {
        Ok(meta) => {
            let mut rec = json!({
                "ok": true,
                "key": key,
                "mode": state.opts.record_mode.clone(),
                "steps": stored.len(),
            });
            if redacted > 0 {
                rec["redacted"] = json!(redacted);
            }
            if meta.sensitive {
                rec["sensitive"] = json!(true);
            }
            rec
        }
        Err(err) => json!({
            "ok": false,
            "key": key,
            "mode": state.opts.record_mode.clone(),
            "error": err.to_string(),
            "suggestion": "Prefer {{mem:...}} / {{param:...}} placeholders and keep runbooks small",
        }),
    }
}

/// Run a final/report helper (a `page` call) under a bounded watchdog;
/// failures never abort the response.
async fn safe_final_call(
    state: &mut RunState<'_>,
    args: Value,
    timeout_s: f64,
) -> Option<Value> {
    let result = state.dispatch_guarded("page", args, timeout_s.max(1.0)).await;
    if result.is_error {
        return None;
    }
    result.data
}

fn triage_has_signal(payload: &Value) -> bool {
    let triage = payload.get("triage").unwrap_or(payload);
    if let Some(summary) = triage.get("summary").and_then(Value::as_object) {
        for key in [
            "consoleErrors",
            "consoleWarnings",
            "jsErrors",
            "resourceErrors",
            "unhandledRejections",
            "failedRequests",
        ] {
            if summary.get(key).and_then(Value::as_f64).unwrap_or(0.0) > 0.0 {
                return true;
            }
        }
    }
    triage
        .get("top")
        .and_then(Value::as_array)
        .map(|top| !top.is_empty())
        .unwrap_or(false)
}

fn diag_has_signal(payload: &Value) -> bool {
    let snap = payload.get("diagnostics").unwrap_or(payload);
    if let Some(delta) = snap.get("delta").and_then(Value::as_object) {
        for key in ["console", "errors", "unhandledRejections", "network"] {
            if delta.get(key).and_then(Value::as_f64).unwrap_or(0.0) > 0.0 {
                return true;
            }
        }
    }
    ["console", "errors", "unhandledRejections", "network"]
        .iter()
        .any(|key| {
            snap.get(*key)
                .and_then(Value::as_array)
                .map(|items| !items.is_empty())
                .unwrap_or(false)
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn final_kind_parse_covers_the_enum() {
        for (raw, expected) in [
            ("none", FinalKind::None),
            ("observe", FinalKind::Observe),
            ("AUDIT", FinalKind::Audit),
            ("triage", FinalKind::Triage),
            ("diagnostics", FinalKind::Diagnostics),
            ("map", FinalKind::Map),
            ("graph", FinalKind::Graph),
        ] {
            assert_eq!(FinalKind::parse(raw), Some(expected));
        }
        assert_eq!(FinalKind::parse("everything"), None);
    }

    #[test]
    fn options_reject_unknown_final() {
        let args = json!({"final": "everything"}).as_object().cloned().unwrap();
        assert!(FlowOptions::parse(&args, PolicyMode::Permissive).is_err());
    }

    #[test]
    fn auto_dialog_auto_maps_through_policy() {
        let args = json!({"auto_dialog": "auto"}).as_object().cloned().unwrap();
        let opts = FlowOptions::parse(&args, PolicyMode::Permissive).unwrap();
        assert_eq!(opts.auto_dialog, Some(AutoDialogMode::Dismiss));
        let opts = FlowOptions::parse(&args, PolicyMode::Strict).unwrap();
        assert_eq!(opts.auto_dialog, None);
    }

    #[test]
    fn action_timeout_is_clamped() {
        let args = json!({"action_timeout": 0.01}).as_object().cloned().unwrap();
        let opts = FlowOptions::parse(&args, PolicyMode::Permissive).unwrap();
        assert_eq!(opts.action_timeout_s, 0.2);
        let args = json!({"action_timeout": 999}).as_object().cloned().unwrap();
        let opts = FlowOptions::parse(&args, PolicyMode::Permissive).unwrap();
        assert_eq!(opts.action_timeout_s, 120.0);
    }

    #[test]
    fn trim_keeps_errors_and_edges() {
        let steps: Vec<Value> = (0..20)
            .map(|i| json!({"i": i, "tool": "wait", "ok": i != 11}))
            .collect();
        let trimmed = trim_step_summaries(&steps, 8);
        assert!(trimmed.len() <= 8);
        let kept: Vec<i64> = trimmed
            .iter()
            .map(|s| s["i"].as_i64().unwrap())
            .collect();
        assert!(kept.contains(&0));
        assert!(kept.contains(&1));
        assert!(kept.contains(&11), "error entry must survive trimming");
        assert!(kept.contains(&18));
        assert!(kept.contains(&19));
    }

    #[test]
    fn signal_probes_read_summaries() {
        assert!(triage_has_signal(&json!({"triage": {"summary": {"jsErrors": 2}}})));
        assert!(!triage_has_signal(&json!({"triage": {"summary": {"jsErrors": 0}}})));
        assert!(diag_has_signal(&json!({"diagnostics": {"network": [{"url": "x"}]}})));
        assert!(!diag_has_signal(&json!({"diagnostics": {"network": []}})));
    }
}

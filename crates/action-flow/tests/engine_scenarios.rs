//! End-to-end engine scenarios against a stub session and a mock tool
//! registry: exports and interpolation, act resolution, dialog handling,
//! auto-tab switching, bounded expansion, and the run wrapper's guards.

use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::{json, Map, Value};

use action_flow::FlowEngine;
use artifact_store::ArtifactStore;
use browsermcp_core_types::{ErrorKind, ToolError, ToolResult};
use browsermcp_registry::{registry_slot, sync_handler, RegistrySlot, ToolCtx, ToolRegistry};
use cdp_adapter::{AdapterError, BrowserConfig, Launcher, PageSession, StubSession, TargetInfo};
use memory_center::MemoryCenter;
use policy_center::SafetyPolicy;
use session_center::{SessionCenter, SessionFactory};

fn target(id: &str, url: &str) -> TargetInfo {
    TargetInfo {
        id: id.into(),
        url: url.into(),
        title: String::new(),
        target_type: "page".into(),
        ws_url: None,
        active: false,
    }
}

/// Factory whose tab list is test-controlled; `open_oob` hands out fresh
/// stub sessions so tab switching and OOB dialog closes work offline.
struct ScriptedFactory {
    tabs: Mutex<Vec<TargetInfo>>,
}

impl ScriptedFactory {
    fn new(tabs: Vec<TargetInfo>) -> Self {
        Self {
            tabs: Mutex::new(tabs),
        }
    }
}

#[async_trait]
impl SessionFactory for ScriptedFactory {
    async fn open(
        &self,
        _config: &BrowserConfig,
    ) -> Result<(Arc<dyn PageSession>, TargetInfo), AdapterError> {
        let tab = self.tabs.lock()[0].clone();
        Ok((Arc::new(StubSession::new(tab.id.clone(), tab.url.clone())), tab))
    }

    async fn open_oob(
        &self,
        _config: &BrowserConfig,
        tab_id: &str,
    ) -> Result<Arc<dyn PageSession>, AdapterError> {
        let url = self
            .tabs
            .lock()
            .iter()
            .find(|t| t.id == tab_id)
            .map(|t| t.url.clone())
            .unwrap_or_default();
        Ok(Arc::new(StubSession::new(tab_id.to_string(), url)))
    }

    async fn list_tabs(&self, _config: &BrowserConfig) -> Result<Vec<TargetInfo>, AdapterError> {
        Ok(self.tabs.lock().clone())
    }

    async fn activate(&self, _config: &BrowserConfig, _tab_id: &str) -> Result<(), AdapterError> {
        Ok(())
    }
}

struct Harness {
    ctx: ToolCtx,
    engine: FlowEngine,
    slot: RegistrySlot,
    stub: Arc<StubSession>,
    factory: Arc<ScriptedFactory>,
    calls: Arc<Mutex<Vec<(String, Value)>>>,
}

impl Harness {
    fn new() -> Self {
        let config = Arc::new(BrowserConfig::default());
        let factory = Arc::new(ScriptedFactory::new(vec![target("t1", "https://a.test/")]));
        let sessions = Arc::new(SessionCenter::new(
            factory.clone(),
            std::env::temp_dir().join("bmcp-engine-tests"),
        ));

        let stub = Arc::new(StubSession::new("t1", "https://a.test/"));
        let session: Arc<dyn PageSession> = stub.clone();
        sessions.install_session(session, target("t1", "https://a.test/"));

        let ctx = ToolCtx {
            launcher: Arc::new(Launcher::new(config.clone())),
            sessions,
            memory: Arc::new(MemoryCenter::new()),
            artifacts: Arc::new(ArtifactStore::new()),
            policy: Arc::new(SafetyPolicy::new()),
            config,
        };

        let slot = registry_slot();
        let engine = FlowEngine::new(slot.clone());
        let calls = Arc::new(Mutex::new(Vec::new()));

        Self {
            ctx,
            engine,
            slot,
            stub,
            factory,
            calls,
        }
    }

    /// Register a recording mock that answers with `result` (rotating
    /// through a list when several are given).
    fn mock_tool(&self, registry: &mut ToolRegistry, name: &str, results: Vec<Value>) {
        let calls = self.calls.clone();
        let name_owned = name.to_string();
        let queue = Arc::new(Mutex::new(results));
        registry.register(
            name,
            sync_handler(move |args| {
                calls.lock().push((name_owned.clone(), args));
                let mut queue = queue.lock();
                let payload = if queue.len() > 1 {
                    queue.remove(0)
                } else {
                    queue.first().cloned().unwrap_or(json!({"ok": true}))
                };
                if payload.get("__error").is_some() {
                    ToolResult::failure(ToolError::new(
                        ErrorKind::ToolFailure,
                        payload["__error"].as_str().unwrap_or("mock failure").to_string(),
                    ))
                } else {
                    ToolResult::json(payload)
                }
            }),
            false,
        );
    }

    fn install(&self, registry: ToolRegistry) {
        let _ = self.slot.set(Arc::new(registry));
    }

    fn calls_for(&self, tool: &str) -> Vec<Value> {
        self.calls
            .lock()
            .iter()
            .filter(|(name, _)| name == tool)
            .map(|(_, args)| args.clone())
            .collect()
    }

    async fn flow(&self, args: Value) -> Value {
        let args: Map<String, Value> = args.as_object().cloned().unwrap_or_default();
        let res = self.engine.handle_flow(&self.ctx, &args).await;
        res.data.unwrap_or(Value::Null)
    }
}

// S4: export scalars from one step, reuse them (typed) in later steps.
#[tokio::test]
async fn flow_vars_export_and_interpolate_preserving_types() {
    let h = Harness::new();
    let mut registry = ToolRegistry::new();
    h.mock_tool(
        &mut registry,
        "page",
        vec![json!({"ok": true, "cursor": 123, "artifact": {"id": "art_abc"}})],
    );
    h.mock_tool(&mut registry, "wait", vec![json!({"ok": true, "success": true})]);
    h.mock_tool(&mut registry, "navigate", vec![json!({"ok": true})]);
    h.install(registry);

    let out = h
        .flow(json!({
            "steps": [
                {"tool": "page", "args": {"detail": "triage"}, "export": {"cursor": "cursor", "artId": "artifact.id"}},
                {"tool": "wait", "args": {"for": "navigation", "timeout": "{{cursor}}"}},
                {"tool": "navigate", "args": {"url": "https://example.test/{{artId}}"}},
            ],
            "final": "none",
            "delta_final": false,
        }))
        .await;

    assert_eq!(out["ok"], json!(true));
    assert_eq!(out["flow"]["steps_executed"], json!(3));

    // Exact placeholder kept the integer type.
    let wait_calls = h.calls_for("wait");
    assert_eq!(wait_calls[0]["timeout"], json!(123));
    // Inline interpolation stringified.
    let nav_calls = h.calls_for("navigate");
    assert_eq!(nav_calls[0]["url"], json!("https://example.test/art_abc"));
}

// Property 1: executed == planned <=> ok and no first error.
#[tokio::test]
async fn completion_requires_all_steps_and_no_error() {
    let h = Harness::new();
    let mut registry = ToolRegistry::new();
    h.mock_tool(&mut registry, "wait", vec![json!({"ok": true})]);
    h.mock_tool(&mut registry, "js", vec![json!({"__error": "boom"})]);
    h.install(registry);

    let out = h
        .flow(json!({
            "steps": [
                {"wait": {"for": "time", "timeout": 0}},
                {"js": {"code": "1"}},
                {"wait": {"for": "time", "timeout": 0}},
            ],
            "final": "none",
            "delta_final": false,
        }))
        .await;

    assert_eq!(out["ok"], json!(false));
    assert_eq!(out["error"], json!("boom"));
    assert_eq!(out["failed_step"]["i"], json!(1));
    assert_eq!(out["flow"]["stopped_on_error"], json!(true));
    assert_eq!(out["flow"]["steps_executed"], json!(2));
}

#[tokio::test]
async fn optional_steps_absorb_failures() {
    let h = Harness::new();
    let mut registry = ToolRegistry::new();
    h.mock_tool(&mut registry, "js", vec![json!({"__error": "boom"})]);
    h.mock_tool(&mut registry, "wait", vec![json!({"ok": true})]);
    h.install(registry);

    let out = h
        .flow(json!({
            "steps": [
                {"js": {"code": "1"}, "optional": true},
                {"wait": {"for": "time", "timeout": 0}},
            ],
            "final": "none",
            "delta_final": false,
        }))
        .await;

    assert_eq!(out["ok"], json!(true));
    assert_eq!(out["flow"]["steps_executed"], json!(2));
    let steps = out["steps"].as_array().unwrap();
    assert_eq!(steps[0]["optional"], json!(true));
    assert_eq!(steps[0]["ok"], json!(false));
}

// S1: final="audit" calls the audit helper and echoes its payload.
#[tokio::test]
async fn final_audit_attaches_the_audit_section() {
    let h = Harness::new();
    let mut registry = ToolRegistry::new();
    h.mock_tool(
        &mut registry,
        "page",
        vec![
            json!({"ok": true, "pageInfo": {"url": "https://a.test/"}}),
            json!({"ok": true, "audit": {"page": {"url": "https://a.test/"}}, "cursor": 9}),
        ],
    );
    h.install(registry);

    let out = h
        .flow(json!({
            "steps": [{"page": {"info": true}}],
            "final": "audit",
            "delta_final": false,
        }))
        .await;

    assert_eq!(out["ok"], json!(true));
    assert_eq!(out["audit"]["audit"]["page"]["url"], json!("https://a.test/"));
}

// S2: ambiguous act label fails closed; click is never dispatched.
#[tokio::test]
async fn ambiguous_act_label_fails_closed() {
    let h = Harness::new();
    let mut registry = ToolRegistry::new();
    h.mock_tool(&mut registry, "click", vec![json!({"ok": true})]);
    h.install(registry);

    h.ctx.sessions.set_affordances(
        "t1",
        vec![
            session_center::AffordanceItem {
                ref_id: "aff:a1".into(),
                tool: "click".into(),
                args: json!({"selector": "#save-1"}),
                meta: json!({"kind": "button", "text": "Save"}),
            },
            session_center::AffordanceItem {
                ref_id: "aff:a2".into(),
                tool: "click".into(),
                args: json!({"selector": "#save-2"}),
                meta: json!({"kind": "button", "text": "Save"}),
            },
        ],
        "https://a.test/".into(),
        1,
    );

    let out = h
        .flow(json!({
            "steps": [{"tool": "act", "args": {"label": "Save", "kind": "button"}}],
            "final": "none",
            "delta_final": false,
        }))
        .await;

    let steps = out["steps"].as_array().unwrap();
    assert_eq!(steps[0]["ok"], json!(false));
    assert!(steps[0]["error"]
        .as_str()
        .unwrap()
        .to_ascii_lowercase()
        .contains("ambiguous"));
    assert!(h.calls_for("click").is_empty(), "click must never run");
    // Candidate previews are bounded and present.
    assert_eq!(steps[0]["details"]["matches"].as_array().unwrap().len(), 2);
}

#[tokio::test]
async fn act_by_ref_resolves_and_dispatches() {
    let h = Harness::new();
    let mut registry = ToolRegistry::new();
    h.mock_tool(&mut registry, "click", vec![json!({"ok": true})]);
    h.install(registry);

    h.ctx.sessions.set_affordances(
        "t1",
        vec![session_center::AffordanceItem {
            ref_id: "aff:save".into(),
            tool: "click".into(),
            args: json!({"selector": "#save"}),
            meta: json!({"kind": "button", "text": "Save"}),
        }],
        "https://a.test/".into(),
        1,
    );

    let out = h
        .flow(json!({
            "steps": [{"tool": "act", "args": {"ref": "aff:save", "args": {"double": true}}}],
            "final": "none",
            "delta_final": false,
        }))
        .await;

    assert_eq!(out["ok"], json!(true));
    let clicks = h.calls_for("click");
    assert_eq!(clicks[0]["selector"], json!("#save"));
    assert_eq!(clicks[0]["double"], json!(true), "act args merge atop resolved args");
    let steps = out["steps"].as_array().unwrap();
    assert_eq!(steps[0]["tool"], json!("act"));
    assert_eq!(steps[0]["resolvedTool"], json!("click"));
    assert_eq!(steps[0]["ref"], json!("aff:save"));
}

// Property 6: stale act map triggers exactly one locators refresh.
#[tokio::test]
async fn stale_act_ref_refreshes_affordances_once() {
    let h = Harness::new();
    let mut registry = ToolRegistry::new();
    h.mock_tool(&mut registry, "click", vec![json!({"ok": true})]);
    h.mock_tool(&mut registry, "page", vec![json!({"ok": true, "locators": {"count": 0}})]);
    h.install(registry);

    // Map stored for a different URL than the current tab.
    h.ctx.sessions.set_affordances(
        "t1",
        vec![session_center::AffordanceItem {
            ref_id: "aff:old".into(),
            tool: "click".into(),
            args: json!({"selector": "#old"}),
            meta: json!({"kind": "button", "text": "Old"}),
        }],
        "https://elsewhere.test/".into(),
        1,
    );

    let out = h
        .flow(json!({
            "steps": [{"tool": "act", "args": {"ref": "aff:old"}}],
            "final": "none",
            "delta_final": false,
            "auto_affordances": true,
        }))
        .await;

    let page_calls = h.calls_for("page");
    assert_eq!(page_calls.len(), 1, "exactly one refresh");
    assert_eq!(page_calls[0]["detail"], json!("locators"));
    // Refs are stable hashes: the re-resolve after the refresh still
    // points at the same semantic action, so the step heals and runs.
    let steps = out["steps"].as_array().unwrap();
    assert_eq!(steps[0]["ok"], json!(true));
    assert_eq!(steps[0]["stale"], json!(true));
    assert_eq!(steps[0]["healed"], json!(true));
    assert_eq!(h.calls_for("click").len(), 1);
}

// S6: memory values flow into tools but never into notes or recordings.
#[tokio::test]
async fn memory_interpolation_never_leaks_into_notes() {
    let h = Harness::new();
    h.ctx.memory.set("token", json!("sekret"), 0, 0).unwrap();

    let mut registry = ToolRegistry::new();
    h.mock_tool(&mut registry, "type", vec![json!({"ok": true})]);
    h.install(registry);

    let out = h
        .flow(json!({
            "steps": [{"type": {"selector": "#pwd", "text": "{{mem:token}}"}}],
            "final": "none",
            "delta_final": false,
            "record_memory_key": "login-rb",
        }))
        .await;

    // The tool saw the real value.
    let typed = h.calls_for("type");
    assert_eq!(typed[0]["text"], json!("sekret"));

    // Nothing visible carries it.
    let rendered = out.to_string();
    assert!(!rendered.contains("sekret"));

    // The recording preserves the placeholder verbatim (property 4).
    assert_eq!(out["recording"]["ok"], json!(true));
    let stored = h.ctx.memory.get("login-rb").unwrap();
    assert_eq!(
        stored.value[0]["type"]["text"],
        json!("{{mem:token}}")
    );
}

#[tokio::test]
async fn missing_memory_key_fails_with_known_keys() {
    let h = Harness::new();
    h.ctx.memory.set("present", json!(1), 0, 0).unwrap();
    let mut registry = ToolRegistry::new();
    h.mock_tool(&mut registry, "type", vec![json!({"ok": true})]);
    h.install(registry);

    let out = h
        .flow(json!({
            "steps": [{"type": {"text": "{{mem:absent}}"}}],
            "final": "none",
            "delta_final": false,
        }))
        .await;

    let steps = out["steps"].as_array().unwrap();
    assert_eq!(steps[0]["error"], json!("Missing memory key"));
    assert_eq!(steps[0]["details"]["known"], json!(["present"]));
    assert!(h.calls_for("type").is_empty());
}

// when: condition evaluated once, branch spliced right after the step.
#[tokio::test]
async fn when_splices_the_matching_branch() {
    let h = Harness::new();
    // Condition check reads page info off the stub session.
    h.stub.push_eval(json!({"url": "https://a.test/cart", "title": "Cart"}));

    let mut registry = ToolRegistry::new();
    h.mock_tool(&mut registry, "click", vec![json!({"ok": true})]);
    h.mock_tool(&mut registry, "navigate", vec![json!({"ok": true})]);
    h.install(registry);

    let out = h
        .flow(json!({
            "steps": [{
                "when": {
                    "if": {"url": "cart"},
                    "then": [{"click": {"selector": "#checkout"}}],
                    "else": [{"navigate": {"url": "https://a.test/cart"}}],
                }
            }],
            "final": "none",
            "delta_final": false,
        }))
        .await;

    assert_eq!(out["ok"], json!(true));
    assert_eq!(h.calls_for("click").len(), 1);
    assert!(h.calls_for("navigate").is_empty());
    let steps = out["steps"].as_array().unwrap();
    assert_eq!(steps[0]["branch"], json!("then"));
}

// repeat: until condition stops the loop; iterations stay bounded.
#[tokio::test]
async fn repeat_until_runs_body_then_stops() {
    let h = Harness::new();
    let mut registry = ToolRegistry::new();
    h.mock_tool(&mut registry, "scroll", vec![json!({"ok": true})]);
    // js condition: false, false, then true.
    h.mock_tool(
        &mut registry,
        "js",
        vec![
            json!({"ok": true, "result": false}),
            json!({"ok": true, "result": false}),
            json!({"ok": true, "result": true}),
        ],
    );
    h.install(registry);

    let out = h
        .flow(json!({
            "steps": [{
                "repeat": {
                    "max_iters": 10,
                    "until": {"js": "window.done"},
                    "steps": [{"scroll": {"direction": "down", "amount": 500}}],
                }
            }],
            "final": "none",
            "delta_final": false,
        }))
        .await;

    assert_eq!(out["ok"], json!(true));
    assert_eq!(h.calls_for("scroll").len(), 2, "two iterations before until hit");
    assert_eq!(h.calls_for("js").len(), 3, "condition checked every round");
}

// Property 7: repeat size caps refuse oversized specs up front.
#[tokio::test]
async fn repeat_size_caps_are_enforced() {
    let h = Harness::new();
    let mut registry = ToolRegistry::new();
    h.mock_tool(&mut registry, "wait", vec![json!({"ok": true})]);
    h.install(registry);

    let body: Vec<Value> = (0..20).map(|_| json!({"wait": {"for": "time"}})).collect();
    let out = h
        .flow(json!({
            "steps": [{"repeat": {"max_iters": 50, "steps": body}}],
            "final": "none",
            "delta_final": false,
        }))
        .await;

    let steps = out["steps"].as_array().unwrap();
    assert_eq!(steps[0]["error"], json!("Repeat too large"));
    assert_eq!(steps[0]["details"]["max_total"], json!(400));
    assert!(h.calls_for("wait").is_empty());
}

#[tokio::test]
async fn macro_dry_run_plans_without_splicing() {
    let h = Harness::new();
    let mut registry = ToolRegistry::new();
    h.mock_tool(&mut registry, "net", vec![json!({"ok": true})]);
    h.mock_tool(&mut registry, "screenshot", vec![json!({"ok": true})]);
    h.install(registry);

    let out = h
        .flow(json!({
            "steps": [{"macro": {"name": "trace_then_screenshot", "dry_run": true}}],
            "final": "none",
            "delta_final": false,
        }))
        .await;

    assert_eq!(out["ok"], json!(true));
    let steps = out["steps"].as_array().unwrap();
    assert_eq!(steps[0]["dry_run"], json!(true));
    assert_eq!(steps[0]["steps_total"], json!(2));
    assert!(h.calls_for("screenshot").is_empty(), "dry run executes nothing");
}

#[tokio::test]
async fn unknown_macro_fails_with_known_set() {
    let h = Harness::new();
    h.install(ToolRegistry::new());

    let out = h
        .flow(json!({
            "steps": [{"macro": {"name": "does_not_exist"}}],
            "final": "none",
            "delta_final": false,
        }))
        .await;

    let steps = out["steps"].as_array().unwrap();
    assert_eq!(steps[0]["error"], json!("Unknown macro"));
    assert!(steps[0]["suggestion"].as_str().unwrap().contains("login_basic"));
}

// Dialog guard: with auto_dialog=off a blocking dialog fails the step
// with a surgical hint; nothing is dispatched.
#[tokio::test]
async fn dialog_guard_blocks_steps_when_auto_off() {
    let h = Harness::new();
    h.stub.push_event(
        "Page.javascriptDialogOpening",
        json!({"type": "alert", "message": "hi", "url": "https://a.test/"}),
    );
    let mut registry = ToolRegistry::new();
    h.mock_tool(&mut registry, "js", vec![json!({"ok": true})]);
    h.install(registry);

    let out = h
        .flow(json!({
            "steps": [{"js": {"code": "1"}}],
            "final": "none",
            "delta_final": false,
            "auto_dialog": "off",
        }))
        .await;

    let steps = out["steps"].as_array().unwrap();
    assert_eq!(steps[0]["error"], json!("Blocking JS dialog is open"));
    assert!(h.calls_for("js").is_empty());
    let next = out["next"].as_array().unwrap();
    assert!(next.iter().any(|n| n.as_str().unwrap().contains("dialog(")));
}

// Property 8: auto_dialog=dismiss closes via Page.handleJavaScriptDialog
// with accept=false and counts the handling.
#[tokio::test]
async fn dialog_auto_dismiss_closes_and_continues() {
    let h = Harness::new();
    h.stub.push_event(
        "Page.javascriptDialogOpening",
        json!({"type": "confirm", "message": "sure?", "url": "https://a.test/"}),
    );
    let mut registry = ToolRegistry::new();
    h.mock_tool(&mut registry, "js", vec![json!({"ok": true})]);
    h.install(registry);

    let out = h
        .flow(json!({
            "steps": [{"js": {"code": "1"}}],
            "final": "none",
            "delta_final": false,
            "auto_dialog": "dismiss",
        }))
        .await;

    assert_eq!(out["ok"], json!(true));
    assert_eq!(out["flow"]["dialogsAutoHandled"], json!(1));
    assert_eq!(h.calls_for("js").len(), 1, "step ran after the close");

    let closes: Vec<(String, Value)> = h
        .stub
        .sent
        .lock()
        .iter()
        .filter(|(method, _)| method == "Page.handleJavaScriptDialog")
        .cloned()
        .collect();
    assert_eq!(closes.len(), 1);
    assert_eq!(closes[0].1["accept"], json!(false), "dismiss means accept=false");
}

// S3: exactly one new tab after a click switches the shared session.
#[tokio::test]
async fn auto_tab_switches_to_the_single_new_tab() {
    let h = Harness::new();
    let mut registry = ToolRegistry::new();

    // The click mock opens a second tab as its side effect.
    {
        let factory = h.factory.clone();
        let calls = h.calls.clone();
        registry.register(
            "click",
            sync_handler(move |args| {
                calls.lock().push(("click".into(), args));
                factory
                    .tabs
                    .lock()
                    .push(target("t2", "https://b.test/popup"));
                ToolResult::json(json!({"ok": true}))
            }),
            false,
        );
    }
    h.install(registry);

    let out = h
        .flow(json!({
            "steps": [{"click": {"selector": "#open"}, "auto_tab": true}],
            "final": "none",
            "delta_final": false,
        }))
        .await;

    let steps = out["steps"].as_array().unwrap();
    assert_eq!(steps[0]["autoTab"]["switched"], json!(true));
    assert_eq!(steps[0]["autoTab"]["tabId"], json!("t2"));
    assert_eq!(h.ctx.sessions.tab_id().as_deref(), Some("t2"));
}

#[tokio::test]
async fn nested_flow_is_rejected() {
    let h = Harness::new();
    h.install(ToolRegistry::new());

    let out = h
        .flow(json!({
            "steps": [{"flow": {"steps": []}}],
            "final": "none",
            "delta_final": false,
        }))
        .await;

    let steps = out["steps"].as_array().unwrap();
    assert_eq!(steps[0]["error"], json!("Nested flow/run is not allowed"));
}

#[tokio::test]
async fn long_step_lists_are_trimmed_and_archived() {
    let h = Harness::new();
    let mut registry = ToolRegistry::new();
    h.mock_tool(&mut registry, "wait", vec![json!({"ok": true})]);
    h.install(registry);

    let steps: Vec<Value> = (0..12).map(|_| json!({"wait": {"for": "time", "timeout": 0}})).collect();
    let out = h
        .flow(json!({"steps": steps, "final": "none", "delta_final": false}))
        .await;

    assert_eq!(out["ok"], json!(true));
    assert!(out["steps"].as_array().unwrap().len() <= 8);
    let artifact_id = out["stepsArtifact"]["id"].as_str().unwrap();
    let archived = h.ctx.artifacts.get(artifact_id, 0, 0).unwrap();
    assert!(archived["data"].as_str().unwrap().contains("\"i\":11"));
}

// run wrapper: irreversible refusal happens before any execution.
#[tokio::test]
async fn run_refuses_irreversible_without_confirmation() {
    let h = Harness::new();
    let mut registry = ToolRegistry::new();
    h.mock_tool(&mut registry, "click", vec![json!({"ok": true})]);
    h.install(registry);

    let args = json!({
        "actions": [
            {"tool": "click", "args": {"selector": "#delete"}, "irreversible": true},
        ],
    })
    .as_object()
    .cloned()
    .unwrap();
    let res = h.engine.handle_run(&h.ctx, &args).await;
    assert!(res.is_error);
    let data = res.data.unwrap();
    assert_eq!(data["kind"], json!("policy"));
    assert_eq!(data["details"]["blocked"][0]["i"], json!(0));
    assert!(h.calls_for("click").is_empty(), "refusal precedes execution");
}

#[tokio::test]
async fn run_strict_params_rejects_invalid_enums() {
    let h = Harness::new();
    h.install(ToolRegistry::new());

    let args = json!({
        "actions": [{"wait": {"for": "time", "timeout": 0}}],
        "strict_params": true,
        "report": "everything",
    })
    .as_object()
    .cloned()
    .unwrap();
    let res = h.engine.handle_run(&h.ctx, &args).await;
    assert!(res.is_error);
    assert!(res
        .error_message()
        .unwrap()
        .contains("strict_params"));
}

#[tokio::test]
async fn run_reshapes_flow_output() {
    let h = Harness::new();
    let mut registry = ToolRegistry::new();
    h.mock_tool(&mut registry, "wait", vec![json!({"ok": true})]);
    h.mock_tool(&mut registry, "page", vec![json!({"ok": true, "map": {"count": 0}})]);
    h.install(registry);

    let args = json!({
        "actions": [{"wait": {"for": "time", "timeout": 0}}],
        "report": "none",
        "proof": false,
        "goal": "smoke",
    })
    .as_object()
    .cloned()
    .unwrap();
    let res = h.engine.handle_run(&h.ctx, &args).await;
    assert!(!res.is_error);
    let data = res.data.unwrap();
    assert_eq!(data["ok"], json!(true));
    assert_eq!(data["goal"], json!("smoke"));
    assert_eq!(data["run"]["actions_total"], json!(1));
    assert_eq!(data["run"]["actions_executed"], json!(1));
    assert!(data.get("flow").is_none(), "run output is run-shaped");
}

// Expansion cap: a macro bomb cannot exceed the global step budget.
#[tokio::test]
async fn include_memory_steps_recursion_is_refused() {
    let h = Harness::new();
    h.ctx
        .memory
        .set(
            "loop-rb",
            json!([{"macro": {"name": "include_memory_steps", "args": {"memory_key": "loop-rb"}}}]),
            0,
            0,
        )
        .unwrap();
    h.install(ToolRegistry::new());

    let out = h
        .flow(json!({
            "steps": [{"macro": {"name": "include_memory_steps", "args": {"memory_key": "loop-rb"}}}],
            "final": "none",
            "delta_final": false,
        }))
        .await;

    assert_eq!(out["ok"], json!(false));
    let rendered = out.to_string();
    assert!(rendered.contains("Recursive include_memory_steps detected"));
}

//! The tool catalog: one JSON-Schema-shaped contract per tool.
//!
//! Kept as data (not derived from handler internals) so the wire surface
//! is reviewable in one place. The markdown contract and the regression
//! test in `contract.rs` keep this honest.

use serde_json::{json, Value};

fn tool(name: &str, description: &str, schema: Value) -> Value {
    json!({"name": name, "description": description, "inputSchema": schema})
}

fn obj(properties: Value) -> Value {
    json!({"type": "object", "properties": properties})
}

fn obj_req(properties: Value, required: &[&str]) -> Value {
    json!({"type": "object", "properties": properties, "required": required})
}

pub fn tool_catalog() -> Vec<Value> {
    vec![
        tool(
            "navigate",
            "Navigate the active tab to a URL, or go back/forward/reload.",
            obj(json!({
                "url": {"type": "string", "description": "Target URL (mutually exclusive with action)."},
                "action": {"type": "string", "enum": ["back", "forward", "reload"]},
                "wait": {"type": "string", "enum": ["navigation", "load", "domcontentloaded", "networkidle", "none"], "description": "What to wait for after navigating."},
                "timeout": {"type": "number", "description": "Wait budget in seconds."},
            })),
        ),
        tool(
            "click",
            "Click an element by text, selector, coordinates, or affordance ref.",
            obj(json!({
                "text": {"type": "string", "description": "Visible text to match."},
                "selector": {"type": "string", "description": "CSS selector."},
                "x": {"type": "number"},
                "y": {"type": "number"},
                "ref": {"type": "string", "description": "Affordance ref (aff:<hash>)."},
                "role": {"type": "string", "description": "Accessibility role filter for text matches."},
                "index": {"type": "integer", "description": "0-based pick when several elements match."},
                "double": {"type": "boolean"},
                "button": {"type": "string", "enum": ["left", "middle", "right"]},
                "wait_after": {"type": "string", "enum": ["auto", "navigation", "none"]},
            })),
        ),
        tool(
            "type",
            "Type text into an element (or the focused one), or press a key with modifiers.",
            obj(json!({
                "text": {"type": "string"},
                "selector": {"type": "string"},
                "ref": {"type": "string"},
                "key": {"type": "string", "description": "Named key (Enter, Tab, Escape, ArrowDown, ...)."},
                "ctrl": {"type": "boolean"},
                "alt": {"type": "boolean"},
                "meta": {"type": "boolean"},
                "shift": {"type": "boolean"},
                "clear": {"type": "boolean", "description": "Clear the field first."},
                "submit": {"type": "boolean", "description": "Submit the enclosing form after typing."},
            })),
        ),
        tool(
            "scroll",
            "Scroll the page or bring an element into view.",
            obj(json!({
                "direction": {"type": "string", "enum": ["up", "down", "left", "right"]},
                "amount": {"type": "number", "description": "Pixels to scroll."},
                "selector": {"type": "string", "description": "Scroll this element into view instead."},
            })),
        ),
        tool(
            "mouse",
            "Low-level mouse control at viewport coordinates.",
            obj_req(
                json!({
                    "action": {"type": "string", "enum": ["move", "down", "up", "wheel"]},
                    "x": {"type": "number"},
                    "y": {"type": "number"},
                    "delta_y": {"type": "number", "description": "Wheel delta."},
                }),
                &["action"],
            ),
        ),
        tool(
            "resize",
            "Resize the viewport (device metrics override).",
            obj_req(
                json!({
                    "width": {"type": "integer"},
                    "height": {"type": "integer"},
                }),
                &["width", "height"],
            ),
        ),
        tool(
            "screenshot",
            "Capture the viewport as PNG. Large captures are stored as artifacts.",
            obj(json!({
                "store": {"type": "boolean", "description": "Force artifact storage instead of inline image."},
            })),
        ),
        tool(
            "form",
            "Fill form fields by fuzzy key match (name/id/placeholder/label) and optionally submit.",
            obj_req(
                json!({
                    "fill": {"type": "object", "description": "field key -> value"},
                    "submit": {"type": "boolean"},
                    "selector": {"type": "string", "description": "Scope to one form."},
                }),
                &["fill"],
            ),
        ),
        tool(
            "upload",
            "Attach local files to a file input.",
            obj_req(
                json!({
                    "selector": {"type": "string"},
                    "files": {"type": "array", "items": {"type": "string"}, "description": "Absolute file paths."},
                }),
                &["selector", "files"],
            ),
        ),
        tool(
            "download",
            "Wait for a new file in the per-tab download directory and store it as an artifact.",
            obj(json!({
                "timeout": {"type": "number", "description": "Seconds to wait for a new file."},
                "store": {"type": "boolean"},
                "sha256": {"type": "boolean"},
                "sha256_max_bytes": {"type": "integer"},
                "poll_interval": {"type": "number"},
                "stable_ms": {"type": "integer", "description": "File size must be stable this long to count as complete."},
                "required": {"type": "boolean", "description": "Fail when nothing arrives."},
            })),
        ),
        tool(
            "dialog",
            "Handle the currently open JavaScript dialog.",
            obj(json!({
                "accept": {"type": "boolean"},
                "text": {"type": "string", "description": "Prompt text when accepting a prompt()."},
            })),
        ),
        tool(
            "totp",
            "Generate an RFC 6238 TOTP code. The secret is never echoed or logged.",
            obj_req(
                json!({
                    "secret": {"type": "string", "description": "Base32 secret."},
                    "digits": {"type": "integer"},
                    "period": {"type": "integer"},
                }),
                &["secret"],
            ),
        ),
        tool(
            "wait",
            "Wait for time, an element, text, navigation, or network idle.",
            obj_req(
                json!({
                    "for": {"type": "string", "enum": ["time", "element", "text", "navigation", "networkidle"]},
                    "selector": {"type": "string"},
                    "text": {"type": "string"},
                    "timeout": {"type": "number", "description": "Seconds."},
                }),
                &["for"],
            ),
        ),
        tool(
            "fetch",
            "HTTP request through the server (allow-list enforced); large bodies become artifacts.",
            obj_req(
                json!({
                    "url": {"type": "string"},
                    "method": {"type": "string"},
                    "headers": {"type": "object"},
                    "body": {"type": "string"},
                    "timeout": {"type": "number"},
                }),
                &["url"],
            ),
        ),
        tool(
            "http",
            "Like fetch, but returns full response metadata (status, headers, body).",
            obj_req(
                json!({
                    "url": {"type": "string"},
                    "method": {"type": "string"},
                    "headers": {"type": "object"},
                    "body": {"type": "string"},
                    "timeout": {"type": "number"},
                }),
                &["url"],
            ),
        ),
        tool(
            "js",
            "Evaluate a JavaScript expression in the page and return its JSON value.",
            obj_req(
                json!({
                    "code": {"type": "string"},
                    "timeout": {"type": "number"},
                }),
                &["code"],
            ),
        ),
        tool(
            "storage",
            "Read or mutate localStorage/sessionStorage.",
            obj_req(
                json!({
                    "action": {"type": "string", "enum": ["get", "set", "remove", "clear", "list"]},
                    "scope": {"type": "string", "enum": ["local", "session"]},
                    "key": {"type": "string"},
                    "value": {"type": "string"},
                    "items": {"type": "object"},
                }),
                &["action"],
            ),
        ),
        tool(
            "cookies",
            "Read or mutate cookies for the active tab.",
            obj_req(
                json!({
                    "action": {"type": "string", "enum": ["get", "set", "delete", "clear"]},
                    "name": {"type": "string"},
                    "value": {"type": "string"},
                    "domain": {"type": "string"},
                    "path": {"type": "string"},
                    "url": {"type": "string"},
                }),
                &["action"],
            ),
        ),
        tool(
            "captcha",
            "Detect captcha widgets on the page (best-effort; never solves them).",
            obj(json!({
                "screenshot": {"type": "boolean", "description": "Store a screenshot artifact when detected."},
            })),
        ),
        tool(
            "tabs",
            "List, open, switch, close, or rescue tabs.",
            obj_req(
                json!({
                    "action": {"type": "string", "enum": ["list", "new", "switch", "close", "rescue"]},
                    "url": {"type": "string", "description": "For action=new."},
                    "tab_id": {"type": "string"},
                }),
                &["action"],
            ),
        ),
        tool(
            "page",
            "Page perception: info, triage, diagnostics, audit, map, graph, or locators (refreshes the affordance registry).",
            obj(json!({
                "detail": {"type": "string", "enum": ["info", "triage", "diagnostics", "audit", "map", "graph", "locators"]},
                "info": {"type": "boolean", "description": "Shorthand for detail=info."},
                "since": {"type": "integer", "description": "Delta cursor (epoch-ms)."},
                "offset": {"type": "integer"},
                "limit": {"type": "integer"},
                "kind": {"type": "string", "enum": ["button", "link", "input", "all"], "description": "Locator kind filter."},
            })),
        ),
        tool(
            "extract_content",
            "Extract readable content (text, article, or HTML); large payloads become artifacts.",
            obj(json!({
                "mode": {"type": "string", "enum": ["text", "article", "html"]},
                "selector": {"type": "string"},
                "max_chars": {"type": "integer"},
            })),
        ),
        tool(
            "artifact",
            "Access off-context payloads: get (sliced), list, delete, export to disk.",
            obj_req(
                json!({
                    "action": {"type": "string", "enum": ["get", "list", "delete", "export"]},
                    "id": {"type": "string"},
                    "offset": {"type": "integer"},
                    "max_chars": {"type": "integer"},
                    "name": {"type": "string", "description": "Export file name."},
                    "path": {"type": "string", "description": "Export directory."},
                    "overwrite": {"type": "boolean"},
                    "limit": {"type": "integer"},
                }),
                &["action"],
            ),
        ),
        tool(
            "browser",
            "Browser/server control: status, policy, recover, and agent memory.",
            obj_req(
                json!({
                    "action": {"type": "string", "enum": ["status", "policy", "recover", "memory", "stop"]},
                    "mode": {"type": "string", "enum": ["permissive", "strict"], "description": "For action=policy."},
                    "hard": {"type": "boolean", "description": "For action=recover: restart the owned browser."},
                    "timeout": {"type": "number"},
                    "memory_action": {"type": "string", "enum": ["set", "get", "list", "delete", "save", "load"]},
                    "key": {"type": "string"},
                    "value": {"description": "Any JSON value (memory_action=set)."},
                    "reveal": {"type": "boolean"},
                    "max_chars": {"type": "integer"},
                    "allow_sensitive": {"type": "boolean"},
                }),
                &["action"],
            ),
        ),
        tool(
            "runbook",
            "Store, inspect, and replay step lists kept in agent memory.",
            obj_req(
                json!({
                    "action": {"type": "string", "enum": ["save", "get", "list", "delete", "preview", "run"]},
                    "key": {"type": "string"},
                    "steps": {"type": "array", "items": {"type": "object"}},
                    "params": {"type": "object", "description": "{{param:key}} values for action=run."},
                    "allow_sensitive": {"type": "boolean"},
                }),
                &["action"],
            ),
        ),
        tool(
            "flow",
            "Execute a list of steps under one shared browser session and return one compact report. Internal variant of run.",
            obj_req(
                json!({
                    "steps": {"type": "array", "items": {"type": "object"}},
                    "start_at": {"type": "integer"},
                    "stop_on_error": {"type": "boolean"},
                    "final": {"type": "string", "enum": ["none", "observe", "audit", "triage", "diagnostics", "map", "graph"]},
                    "delta_final": {"type": "boolean"},
                    "steps_output": {"type": "string", "enum": ["compact", "errors", "none"]},
                    "auto_dialog": {"type": "string", "enum": ["auto", "off", "dismiss", "accept"]},
                    "auto_recover": {"type": "boolean"},
                    "recover_hard": {"type": "boolean"},
                    "recover_timeout": {"type": "number"},
                    "action_timeout": {"type": "number"},
                    "timeout_profile": {"type": "string", "enum": ["fast", "default", "slow"]},
                    "auto_download": {"type": "boolean"},
                    "auto_download_timeout": {"type": "number"},
                    "auto_tab": {"type": "boolean"},
                    "auto_affordances": {"type": "boolean"},
                    "step_proof": {"type": "boolean"},
                    "proof_screenshot": {"type": "string", "enum": ["none", "artifact"]},
                    "screenshot_on_ambiguity": {"type": "boolean"},
                    "record_memory_key": {"type": "string"},
                    "record_mode": {"type": "string", "enum": ["sanitized", "raw"]},
                    "record_on_failure": {"type": "boolean"},
                    "final_limit": {"type": "integer"},
                    "with_screenshot": {"type": "boolean"},
                }),
                &["steps"],
            ),
        ),
        tool(
            "run",
            "Batched runner (observe-act-verify-report): executes actions with per-step proof, dialog auto-handling, download capture, tab auto-switching, and bounded recovery.",
            obj_req(
                json!({
                    "actions": {"type": "array", "items": {"type": "object"}},
                    "goal": {"type": "string"},
                    "start_at": {"type": "integer"},
                    "stop_on_error": {"type": "boolean"},
                    "report": {"type": "string", "enum": ["none", "observe", "audit", "triage", "diagnostics", "map", "graph"]},
                    "delta_report": {"type": "boolean"},
                    "actions_output": {"type": "string", "enum": ["compact", "errors", "none"]},
                    "proof": {"type": "boolean"},
                    "proof_screenshot": {"type": "string", "enum": ["none", "artifact"]},
                    "screenshot_on_ambiguity": {"type": "boolean"},
                    "auto_dialog": {"type": "string", "enum": ["auto", "off", "dismiss", "accept"]},
                    "auto_recover": {"type": "boolean"},
                    "max_recoveries": {"type": "integer"},
                    "recover_hard": {"type": "boolean"},
                    "recover_timeout": {"type": "number"},
                    "action_timeout": {"type": "number"},
                    "timeout_profile": {"type": "string", "enum": ["fast", "default", "slow"]},
                    "auto_download": {"type": "boolean"},
                    "auto_download_timeout": {"type": "number"},
                    "auto_tab": {"type": "boolean"},
                    "auto_affordances": {"type": "boolean"},
                    "confirm_irreversible": {"type": "boolean"},
                    "heuristic_level": {"type": "integer", "description": "0 minimal, 1 balanced, 2 robust, 3 diagnostic."},
                    "strict_params": {"type": "boolean"},
                    "report_limit": {"type": "integer"},
                    "record_memory_key": {"type": "string"},
                    "record_mode": {"type": "string", "enum": ["sanitized", "raw"]},
                    "record_on_failure": {"type": "boolean"},
                    "with_screenshot": {"type": "boolean"},
                }),
                &["actions"],
            ),
        ),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn every_tool_has_an_object_schema() {
        for tool in tool_catalog() {
            let name = tool["name"].as_str().unwrap();
            assert_eq!(
                tool["inputSchema"]["type"],
                json!("object"),
                "{name} schema must be an object"
            );
            assert!(
                tool["description"].as_str().map(|d| !d.is_empty()).unwrap_or(false),
                "{name} needs a description"
            );
        }
    }

    #[test]
    fn run_and_flow_expose_the_engine_knobs() {
        let tools = tool_catalog();
        let run = tools.iter().find(|t| t["name"] == json!("run")).unwrap();
        for knob in [
            "actions",
            "report",
            "auto_dialog",
            "max_recoveries",
            "confirm_irreversible",
            "heuristic_level",
            "strict_params",
        ] {
            assert!(
                run.pointer(&format!("/inputSchema/properties/{knob}")).is_some(),
                "run schema is missing {knob}"
            );
        }
        let flow = tools.iter().find(|t| t["name"] == json!("flow")).unwrap();
        assert!(flow
            .pointer("/inputSchema/properties/confirm_irreversible")
            .is_none(), "only run exposes confirm_irreversible");
    }
}

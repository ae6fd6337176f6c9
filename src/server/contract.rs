//! Protocol contract: version handshake, the tools/list payload, and the
//! human-readable markdown rendering.
//!
//! The catalog and the markdown must stay in lock-step; both are derived
//! from the same `catalog::tool_catalog()` source and a regression test
//! fails on drift.

use serde_json::{json, Value};

use crate::server::catalog;

pub const SUPPORTED_PROTOCOL_VERSIONS: &[&str] = &["2024-11-05", "2025-03-26", "2025-06-18"];
pub const LATEST_PROTOCOL_VERSION: &str = "2025-06-18";
pub const DEFAULT_PROTOCOL_VERSION: &str = "2025-03-26";

pub const SERVER_NAME: &str = "browsermcp";

/// Echo the client's version when supported; otherwise answer with ours.
pub fn select_protocol(client_version: Option<&str>) -> &'static str {
    match client_version {
        Some(version) => SUPPORTED_PROTOCOL_VERSIONS
            .iter()
            .find(|supported| **supported == version)
            .copied()
            .unwrap_or(DEFAULT_PROTOCOL_VERSION),
        None => DEFAULT_PROTOCOL_VERSION,
    }
}

pub fn initialize_result(client_version: Option<&str>) -> Value {
    json!({
        "protocolVersion": select_protocol(client_version),
        "capabilities": {"tools": {}},
        "serverInfo": {
            "name": SERVER_NAME,
            "version": env!("CARGO_PKG_VERSION"),
        },
        "instructions": "Browser automation for AI agents. Prefer run(actions=[...]) for multi-step work: it shares one browser session, auto-handles dialogs, captures downloads, and returns one compact report. Use page(detail=...) to perceive, act(ref=...) to execute affordances.",
    })
}

pub fn tools_list() -> Value {
    json!({"tools": catalog::tool_catalog()})
}

/// Human-readable rendering of the same catalog.
pub fn contract_markdown() -> String {
    let tools = catalog::tool_catalog();
    let mut out = String::new();
    out.push_str("# browsermcp tool contract\n\n");
    out.push_str(&format!(
        "Protocol versions: {} (default {})\n\n",
        SUPPORTED_PROTOCOL_VERSIONS.join(", "),
        DEFAULT_PROTOCOL_VERSION
    ));

    for tool in tools.iter() {
        let name = tool.get("name").and_then(Value::as_str).unwrap_or("?");
        let description = tool
            .get("description")
            .and_then(Value::as_str)
            .unwrap_or("");
        out.push_str(&format!("## {name}\n\n{description}\n\n"));

        let properties = tool
            .pointer("/inputSchema/properties")
            .and_then(Value::as_object);
        let required: Vec<&str> = tool
            .pointer("/inputSchema/required")
            .and_then(Value::as_array)
            .map(|items| items.iter().filter_map(Value::as_str).collect())
            .unwrap_or_default();

        if let Some(properties) = properties {
            if !properties.is_empty() {
                out.push_str("| arg | type | notes |\n|---|---|---|\n");
                for (arg, schema) in properties {
                    let arg_type = schema
                        .get("type")
                        .map(|t| match t {
                            Value::String(s) => s.clone(),
                            Value::Array(items) => items
                                .iter()
                                .filter_map(Value::as_str)
                                .collect::<Vec<_>>()
                                .join("|"),
                            _ => "any".to_string(),
                        })
                        .unwrap_or_else(|| "any".to_string());
                    let mut notes = schema
                        .get("description")
                        .and_then(Value::as_str)
                        .unwrap_or("")
                        .to_string();
                    if let Some(options) = schema.get("enum").and_then(Value::as_array) {
                        let rendered: Vec<String> =
                            options.iter().map(|o| o.to_string()).collect();
                        if !notes.is_empty() {
                            notes.push(' ');
                        }
                        notes.push_str(&format!("one of: {}", rendered.join(", ")));
                    }
                    if required.contains(&arg.as_str()) {
                        if !notes.is_empty() {
                            notes.push(' ');
                        }
                        notes.push_str("(required)");
                    }
                    out.push_str(&format!("| {arg} | {arg_type} | {notes} |\n"));
                }
                out.push('\n');
            }
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn protocol_selection_echoes_supported_versions() {
        assert_eq!(select_protocol(Some("2024-11-05")), "2024-11-05");
        assert_eq!(select_protocol(Some("1999-01-01")), DEFAULT_PROTOCOL_VERSION);
        assert_eq!(select_protocol(None), DEFAULT_PROTOCOL_VERSION);
        assert!(SUPPORTED_PROTOCOL_VERSIONS.contains(&LATEST_PROTOCOL_VERSION));
    }

    #[test]
    fn initialize_result_carries_server_info() {
        let init = initialize_result(Some("2025-06-18"));
        assert_eq!(init["protocolVersion"], json!("2025-06-18"));
        assert_eq!(init["serverInfo"]["name"], json!(SERVER_NAME));
    }

    /// The contract-snapshot invariant: markdown and catalog are derived
    /// from the same source and may never drift apart.
    #[test]
    fn markdown_stays_in_lock_step_with_catalog() {
        let markdown = contract_markdown();
        let tools = catalog::tool_catalog();
        assert!(!tools.is_empty());
        for tool in &tools {
            let name = tool["name"].as_str().unwrap();
            assert!(
                markdown.contains(&format!("## {name}")),
                "markdown is missing tool {name}"
            );
            for required in tool
                .pointer("/inputSchema/required")
                .and_then(Value::as_array)
                .into_iter()
                .flatten()
                .filter_map(Value::as_str)
            {
                assert!(
                    markdown.contains(&format!("| {required} |")),
                    "markdown for {name} is missing required arg {required}"
                );
            }
        }
    }

    #[test]
    fn catalog_covers_the_mandatory_surface() {
        let tools = tools_list();
        let names: Vec<&str> = tools["tools"]
            .as_array()
            .unwrap()
            .iter()
            .filter_map(|t| t["name"].as_str())
            .collect();
        for required in [
            "navigate", "click", "type", "scroll", "mouse", "resize", "screenshot", "form",
            "upload", "download", "dialog", "totp", "wait", "fetch", "http", "js", "storage",
            "cookies", "captcha", "tabs", "page", "extract_content", "artifact", "browser",
            "runbook", "flow", "run",
        ] {
            assert!(names.contains(&required), "catalog is missing {required}");
        }
    }
}

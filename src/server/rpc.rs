//! JSON-RPC over stdio: one JSON object per line in, one per line out.
//!
//! Supported methods: `initialize`, `notifications/initialized` (no-op),
//! `tools/list`, `tools/call`, `ping`. Unknown methods answer -32601.
//! Optional frame dumps (`MCP_DUMP_FRAMES`) pass through redaction first.

use std::io::Write as _;

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{debug, info, warn};

use policy_center::redact::{redact_jsonrpc_for_dump, redact_jsonrpc_for_log};

use crate::server::contract;
use crate::AppContext;

#[derive(Debug, Deserialize)]
struct JsonRpcRequest {
    #[allow(dead_code)]
    jsonrpc: Option<String>,
    id: Option<Value>,
    method: String,
    params: Option<Value>,
}

#[derive(Debug, Serialize)]
struct JsonRpcResponse {
    jsonrpc: &'static str,
    id: Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<JsonRpcError>,
}

#[derive(Debug, Serialize)]
struct JsonRpcError {
    code: i32,
    message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    data: Option<Value>,
}

fn response(id: Value, result: Value) -> JsonRpcResponse {
    JsonRpcResponse {
        jsonrpc: "2.0",
        id,
        result: Some(result),
        error: None,
    }
}

fn error_response(id: Value, code: i32, message: impl Into<String>) -> JsonRpcResponse {
    JsonRpcResponse {
        jsonrpc: "2.0",
        id,
        result: None,
        error: Some(JsonRpcError {
            code,
            message: message.into(),
            data: None,
        }),
    }
}

fn dump_frame(direction: &str, payload: &Value) {
    let Ok(path) = std::env::var("MCP_DUMP_FRAMES") else {
        return;
    };
    if path.trim().is_empty() {
        return;
    }
    let line = if std::env::var("MCP_DUMP_FRAMES_RAW").as_deref() == Ok("1") {
        payload.clone()
    } else {
        redact_jsonrpc_for_dump(payload, None)
    };
    if let Some(parent) = std::path::Path::new(&path).parent() {
        let _ = std::fs::create_dir_all(parent);
    }
    if let Ok(mut file) = std::fs::OpenOptions::new().create(true).append(true).open(&path) {
        let _ = writeln!(file, "--{direction}--");
        let _ = writeln!(file, "{line}");
    }
}

async fn handle_request(app: &AppContext, request: JsonRpcRequest) -> Option<JsonRpcResponse> {
    let id = request.id.clone().unwrap_or(json!(0));

    match request.method.as_str() {
        "initialize" => {
            let client_version = request
                .params
                .as_ref()
                .and_then(|p| p.get("protocolVersion"))
                .and_then(Value::as_str);
            Some(response(id, contract::initialize_result(client_version)))
        }
        "notifications/initialized" => {
            // Notification: no response on the wire.
            debug!("client initialized");
            None
        }
        "ping" => Some(response(id, json!({}))),
        "tools/list" => Some(response(id, contract::tools_list())),
        "tools/call" => {
            let params = request.params.unwrap_or(json!({}));
            let Some(name) = params.get("name").and_then(Value::as_str) else {
                return Some(error_response(id, -32602, "Missing tool name"));
            };
            let arguments = params.get("arguments").cloned().unwrap_or(json!({}));

            let result = app.registry.dispatch(name, &app.ctx, arguments).await;
            Some(response(
                id,
                json!({
                    "content": result.to_content_list(),
                    "isError": result.is_error,
                }),
            ))
        }
        other => Some(error_response(
            id,
            -32601,
            format!("Method not found: {other}"),
        )),
    }
}

/// Run the stdio loop until EOF.
pub async fn serve(app: &AppContext) -> anyhow::Result<()> {
    info!(
        tools = app.registry.len(),
        mode = app.ctx.config.mode.as_str(),
        "browsermcp serving on stdio"
    );

    let stdin = tokio::io::stdin();
    let mut lines = BufReader::new(stdin).lines();
    let mut stdout = std::io::stdout();

    while let Some(line) = lines.next_line().await? {
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }

        let parsed: Result<Value, _> = serde_json::from_str(trimmed);
        let frame = match parsed {
            Ok(frame) => frame,
            Err(err) => {
                let resp = error_response(json!(null), -32700, format!("Parse error: {err}"));
                writeln!(stdout, "{}", serde_json::to_string(&resp)?)?;
                stdout.flush()?;
                continue;
            }
        };
        dump_frame("in", &frame);
        if app.ctx.config.trace {
            debug!(frame = %redact_jsonrpc_for_log(&frame), "rpc in");
        }

        let request: JsonRpcRequest = match serde_json::from_value(frame) {
            Ok(request) => request,
            Err(err) => {
                warn!(error = %err, "malformed request");
                let resp = error_response(json!(null), -32600, format!("Invalid request: {err}"));
                writeln!(stdout, "{}", serde_json::to_string(&resp)?)?;
                stdout.flush()?;
                continue;
            }
        };

        if let Some(resp) = handle_request(app, request).await {
            let out = serde_json::to_value(&resp)?;
            dump_frame("out", &out);
            writeln!(stdout, "{}", serde_json::to_string(&resp)?)?;
            stdout.flush()?;
        }
    }

    info!("stdin closed, shutting down");
    Ok(())
}

//! Server-side HTTP: `fetch` (content-focused) and `http` (full
//! response metadata). Both honor the `MCP_ALLOW_HOSTS` allow-list and
//! the configured timeout/byte budgets; large bodies become artifacts.

use std::time::Duration;

use serde_json::{json, Map, Value};

use browsermcp_core_types::{ErrorKind, ToolError, ToolResult};
use browsermcp_registry::ToolCtx;

use super::support::{arg_f64, arg_str, args_obj, offload_large_text};

pub async fn fetch(ctx: ToolCtx, args: Value) -> ToolResult {
    request(ctx, args, false).await
}

pub async fn http(ctx: ToolCtx, args: Value) -> ToolResult {
    request(ctx, args, true).await
}

async fn request(ctx: ToolCtx, args: Value, full_meta: bool) -> ToolResult {
    let tool = if full_meta { "http" } else { "fetch" };
    let args = args_obj(&args);

    let Some(url) = arg_str(&args, "url") else {
        return ToolResult::failure(
            ToolError::new(ErrorKind::Validation, "Missing url").with_tool(tool),
        );
    };
    let parsed = match url::Url::parse(url) {
        Ok(parsed) => parsed,
        Err(err) => {
            return ToolResult::failure(
                ToolError::new(ErrorKind::Validation, format!("Invalid url: {err}"))
                    .with_tool(tool),
            );
        }
    };
    if !matches!(parsed.scheme(), "http" | "https") {
        return ToolResult::failure(
            ToolError::new(ErrorKind::Validation, "Only http(s) urls are allowed").with_tool(tool),
        );
    }
    let host = parsed.host_str().unwrap_or("");
    if !ctx.config.host_allowed(host) {
        return ToolResult::failure(
            ToolError::new(ErrorKind::Policy, format!("Host not allowed: {host}"))
                .with_tool(tool)
                .with_suggestion("Extend MCP_ALLOW_HOSTS or leave it empty to allow all hosts"),
        );
    }

    let method = arg_str(&args, "method").unwrap_or("GET").to_ascii_uppercase();
    let method = match reqwest::Method::from_bytes(method.as_bytes()) {
        Ok(method) => method,
        Err(_) => {
            return ToolResult::failure(
                ToolError::new(ErrorKind::Validation, format!("Invalid method: {method}"))
                    .with_tool(tool),
            );
        }
    };

    let timeout_s = arg_f64(&args, "timeout", ctx.config.http_timeout_s).clamp(0.5, 300.0);
    let client = match reqwest::Client::builder()
        .timeout(Duration::from_secs_f64(timeout_s))
        .build()
    {
        Ok(client) => client,
        Err(err) => {
            return ToolResult::failure(
                ToolError::new(ErrorKind::ToolFailure, err.to_string()).with_tool(tool),
            );
        }
    };

    let mut request = client.request(method.clone(), parsed);
    if let Some(headers) = args.get("headers").and_then(Value::as_object) {
        for (key, value) in headers {
            if let Some(value) = value.as_str() {
                request = request.header(key, value);
            }
        }
    }
    if let Some(body) = args.get("body").and_then(Value::as_str) {
        request = request.body(body.to_string());
    }

    let response = match request.send().await {
        Ok(response) => response,
        Err(err) => {
            return ToolResult::failure(
                ToolError::new(ErrorKind::ToolFailure, format!("Request failed: {err}"))
                    .with_tool(tool)
                    .with_suggestion("Check the URL, network reachability, and MCP_HTTP_TIMEOUT"),
            );
        }
    };

    let status = response.status().as_u16();
    let mut headers = Map::new();
    for (key, value) in response.headers() {
        if let Ok(value) = value.to_str() {
            headers.insert(key.to_string(), json!(value));
        }
    }
    let content_type = headers
        .get("content-type")
        .and_then(Value::as_str)
        .unwrap_or("application/octet-stream")
        .to_string();

    let max_bytes = ctx.config.http_max_bytes as usize;
    let bytes = match response.bytes().await {
        Ok(bytes) => bytes,
        Err(err) => {
            return ToolResult::failure(
                ToolError::new(ErrorKind::ToolFailure, format!("Body read failed: {err}"))
                    .with_tool(tool),
            );
        }
    };
    let truncated_body = bytes.len() > max_bytes;
    let body_slice = &bytes[..bytes.len().min(max_bytes)];
    let body_text = String::from_utf8_lossy(body_slice).to_string();

    let mut payload = json!({
        "ok": status < 400,
        "tool": tool,
        "status": status,
        "bytes": bytes.len(),
        "contentType": content_type,
    });
    if truncated_body {
        payload["bodyTruncatedToMaxBytes"] = json!(max_bytes);
    }
    if full_meta {
        // Redaction happens at log/dump time; the live response is the
        // caller's data.
        payload["headers"] = Value::Object(headers);
    }

    let payload = offload_large_text(&ctx, "http_body", body_text, &content_type, payload);
    ToolResult::json(payload)
}

//! Shared types for the browsermcp server crates.
//!
//! Everything here is wire-adjacent: the tool result envelope that travels
//! back over JSON-RPC, the closed error taxonomy every step failure is
//! folded into, and the process-wide safety mode.

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use thiserror::Error;

/// Closed error taxonomy. Every raw failure a step produces is translated
/// into exactly one of these kinds before it reaches a report.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Error, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    #[error("validation")]
    Validation,
    #[error("policy")]
    Policy,
    #[error("missing_ref")]
    MissingRef,
    #[error("ambiguous")]
    Ambiguous,
    #[error("dialog_block")]
    DialogBlock,
    #[error("ui_transient")]
    UiTransient,
    #[error("cdp_brick")]
    CdpBrick,
    #[error("timeout")]
    Timeout,
    #[error("tool_failure")]
    ToolFailure,
}

/// Structured tool error carried inside an error `ToolResult`.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ToolError {
    pub kind: ErrorKind,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub suggestion: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<Value>,
}

impl ToolError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            tool: None,
            suggestion: None,
            details: None,
        }
    }

    pub fn with_tool(mut self, tool: impl Into<String>) -> Self {
        self.tool = Some(tool.into());
        self
    }

    pub fn with_suggestion(mut self, suggestion: impl Into<String>) -> Self {
        self.suggestion = Some(suggestion.into());
        self
    }

    pub fn with_details(mut self, details: Value) -> Self {
        self.details = Some(details);
        self
    }
}

impl fmt::Display for ToolError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

/// Single content item in a tool response (MCP wire shape).
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ToolContent {
    Text { text: String },
    Image { data: String, mime_type: String },
}

impl ToolContent {
    pub fn to_wire(&self) -> Value {
        match self {
            ToolContent::Text { text } => json!({"type": "text", "text": text}),
            ToolContent::Image { data, mime_type } => {
                json!({"type": "image", "data": data, "mimeType": mime_type})
            }
        }
    }

    pub fn is_image(&self) -> bool {
        matches!(self, ToolContent::Image { .. })
    }
}

/// Result of a tool execution.
///
/// `data` is the raw payload used for internal orchestration (flow exports,
/// run reshaping). It never leaves the process; only `content` does.
#[derive(Clone, Debug, Default)]
pub struct ToolResult {
    pub content: Vec<ToolContent>,
    pub is_error: bool,
    pub data: Option<Value>,
}

impl ToolResult {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            content: vec![ToolContent::Text { text: text.into() }],
            is_error: false,
            data: None,
        }
    }

    /// JSON payload rendered as text content, with the raw value kept on
    /// the side for orchestration.
    pub fn json(data: Value) -> Self {
        let text = render_payload(&data);
        Self {
            content: vec![ToolContent::Text { text }],
            is_error: false,
            data: Some(data),
        }
    }

    pub fn image(data_b64: impl Into<String>, mime_type: impl Into<String>) -> Self {
        let data = data_b64.into();
        if data.is_empty() {
            return Self::failure(ToolError::new(
                ErrorKind::ToolFailure,
                "Screenshot data is empty",
            ));
        }
        Self {
            content: vec![ToolContent::Image {
                data,
                mime_type: mime_type.into(),
            }],
            is_error: false,
            data: None,
        }
    }

    pub fn with_image(
        data: Value,
        image_b64: impl Into<String>,
        mime_type: impl Into<String>,
    ) -> Self {
        let image = image_b64.into();
        let text = render_payload(&data);
        let mut content = vec![ToolContent::Text { text }];
        if !image.is_empty() {
            content.push(ToolContent::Image {
                data: image,
                mime_type: mime_type.into(),
            });
        }
        Self {
            content,
            is_error: false,
            data: Some(data),
        }
    }

    pub fn failure(err: ToolError) -> Self {
        let mut payload = json!({"ok": false, "error": err.message, "kind": err.kind});
        if let Some(obj) = payload.as_object_mut() {
            if let Some(tool) = &err.tool {
                obj.insert("tool".into(), json!(tool));
            }
            if let Some(suggestion) = &err.suggestion {
                obj.insert("suggestion".into(), json!(suggestion));
            }
            if let Some(details) = &err.details {
                obj.insert("details".into(), details.clone());
            }
        }
        let text = render_payload(&payload);
        Self {
            content: vec![ToolContent::Text { text }],
            is_error: true,
            data: Some(payload),
        }
    }

    /// Shorthand for the common failure shape.
    pub fn error(message: impl Into<String>, kind: ErrorKind) -> Self {
        Self::failure(ToolError::new(kind, message))
    }

    /// Message extracted from the error payload, if this is an error result.
    pub fn error_message(&self) -> Option<&str> {
        if !self.is_error {
            return None;
        }
        self.data
            .as_ref()
            .and_then(|d| d.get("error"))
            .and_then(Value::as_str)
    }

    pub fn suggestion(&self) -> Option<&str> {
        self.data
            .as_ref()
            .and_then(|d| d.get("suggestion"))
            .and_then(Value::as_str)
    }

    pub fn to_content_list(&self) -> Vec<Value> {
        self.content.iter().map(ToolContent::to_wire).collect()
    }
}

/// Render a JSON payload for the text channel. The AI-first context-markdown
/// renderer sits outside this core; pretty JSON is the stable fallback shape
/// every consumer can parse.
pub fn render_payload(data: &Value) -> String {
    serde_json::to_string_pretty(data).unwrap_or_else(|_| data.to_string())
}

/// Process-wide safety mode (see policy-center for the live handle).
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PolicyMode {
    #[default]
    Permissive,
    Strict,
}

impl PolicyMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            PolicyMode::Permissive => "permissive",
            PolicyMode::Strict => "strict",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "permissive" => Some(PolicyMode::Permissive),
            "strict" => Some(PolicyMode::Strict),
            _ => None,
        }
    }
}

/// Opaque artifact id (`art_<uuid>`), unique within a process.
pub fn new_artifact_id() -> String {
    format!("art_{}", uuid::Uuid::new_v4().simple())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_result_carries_structured_payload() {
        let res = ToolResult::failure(
            ToolError::new(ErrorKind::Validation, "Unknown tool: nope")
                .with_tool("nope")
                .with_suggestion("Check tools/list"),
        );
        assert!(res.is_error);
        assert_eq!(res.error_message(), Some("Unknown tool: nope"));
        assert_eq!(res.suggestion(), Some("Check tools/list"));
        let data = res.data.unwrap();
        assert_eq!(data["kind"], json!("validation"));
    }

    #[test]
    fn json_result_keeps_raw_data() {
        let res = ToolResult::json(json!({"ok": true, "cursor": 123}));
        assert!(!res.is_error);
        assert_eq!(res.data.as_ref().unwrap()["cursor"], json!(123));
        assert_eq!(res.content.len(), 1);
    }

    #[test]
    fn empty_image_degrades_to_error() {
        let res = ToolResult::image("", "image/png");
        assert!(res.is_error);
    }

    #[test]
    fn policy_mode_round_trips() {
        assert_eq!(PolicyMode::parse("STRICT"), Some(PolicyMode::Strict));
        assert_eq!(PolicyMode::parse("permissive"), Some(PolicyMode::Permissive));
        assert_eq!(PolicyMode::parse("other"), None);
    }

    #[test]
    fn artifact_ids_are_unique() {
        let a = new_artifact_id();
        let b = new_artifact_id();
        assert_ne!(a, b);
        assert!(a.starts_with("art_"));
    }
}

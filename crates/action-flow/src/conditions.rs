//! Condition evaluation shared by `assert`, `when`, and `repeat.until`.
//!
//! Cheap URL/title containment checks run first (no waits); selector,
//! text, and JS checks go through the `wait`/`js` tools with a bounded
//! timeout. An empty condition fails closed.

use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Map, Value};

use browsermcp_registry::{ToolCtx, ToolRegistry};
use cdp_adapter::PageSession;
use session_center::SessionCenter;

#[derive(Clone, Debug, Default)]
pub struct ConditionOutcome {
    pub matched: bool,
    pub details: Map<String, Value>,
    pub error: Option<String>,
    pub suggestion: Option<String>,
}

impl ConditionOutcome {
    fn failed(error: &str, suggestion: &str) -> Self {
        Self {
            matched: false,
            details: Map::new(),
            error: Some(error.to_string()),
            suggestion: Some(suggestion.to_string()),
        }
    }
}

/// Best-effort page info via the shared session. Never evaluated while a
/// dialog is open (Runtime.evaluate would hang).
pub async fn best_effort_page_info(
    session: &Arc<dyn PageSession>,
    sessions: &SessionCenter,
) -> Option<Value> {
    let tab_id = session.tab_id();
    if let Some(telemetry) = sessions.get_telemetry(&tab_id) {
        if telemetry.dialog_open() {
            return None;
        }
    }
    session
        .eval_js(
            "({url: location.href, title: document.title, readyState: document.readyState})",
            Duration::from_secs(3),
        )
        .await
        .ok()
        .filter(Value::is_object)
}

pub async fn condition_check(
    cond: &Value,
    timeout_s: f64,
    allow_wait: bool,
    registry: &ToolRegistry,
    ctx: &ToolCtx,
    session: &Arc<dyn PageSession>,
) -> ConditionOutcome {
    let Value::Object(cond) = cond else {
        return ConditionOutcome::failed("Invalid condition", "Provide if={...} as an object");
    };

    let has_any = ["url", "title", "selector", "text", "js"]
        .iter()
        .any(|key| cond.contains_key(*key));
    if !has_any {
        return ConditionOutcome::failed(
            "Empty condition",
            "Provide at least one of: url, title, selector, text, js",
        );
    }

    let mut details = Map::new();

    // Cheap checks first: URL/title containment, no waits.
    let url_expected = cond.get("url").and_then(Value::as_str).filter(|s| !s.is_empty());
    let title_expected = cond.get("title").and_then(Value::as_str).filter(|s| !s.is_empty());
    if url_expected.is_some() || title_expected.is_some() {
        let info = best_effort_page_info(session, &ctx.sessions).await;
        let current_url = info
            .as_ref()
            .and_then(|i| i.get("url"))
            .and_then(Value::as_str)
            .map(str::to_string);
        let current_title = info
            .as_ref()
            .and_then(|i| i.get("title"))
            .and_then(Value::as_str)
            .map(str::to_string);

        if let Some(expected) = url_expected {
            details.insert(
                "url".into(),
                json!({"expected": expected, "actual": current_url}),
            );
            if !current_url.as_deref().map_or(false, |u| u.contains(expected)) {
                return ConditionOutcome {
                    matched: false,
                    details,
                    error: None,
                    suggestion: None,
                };
            }
        }
        if let Some(expected) = title_expected {
            details.insert(
                "title".into(),
                json!({"expected": expected, "actual": current_title}),
            );
            if !current_title
                .as_deref()
                .map_or(false, |t| t.contains(expected))
            {
                return ConditionOutcome {
                    matched: false,
                    details,
                    error: None,
                    suggestion: None,
                };
            }
        }
    }

    if !allow_wait {
        return ConditionOutcome {
            matched: true,
            details,
            error: None,
            suggestion: None,
        };
    }

    let selector = cond
        .get("selector")
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|s| !s.is_empty());

    if let Some(selector) = selector {
        let res = registry
            .dispatch(
                "wait",
                ctx,
                json!({"for": "element", "selector": selector, "timeout": timeout_s}),
            )
            .await;
        if res.is_error {
            return ConditionOutcome {
                matched: false,
                details,
                error: Some("Condition wait failed".into()),
                suggestion: Some("Retry or reduce selector scope".into()),
            };
        }
        let payload = res.data.unwrap_or(Value::Null);
        let found = payload
            .get("found")
            .or_else(|| payload.get("success"))
            .and_then(Value::as_bool)
            .unwrap_or(false);
        details.insert("selector".into(), json!({"selector": selector, "found": found}));
        if !found {
            return ConditionOutcome {
                matched: false,
                details,
                error: None,
                suggestion: None,
            };
        }
    }

    if let Some(text) = cond
        .get("text")
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|s| !s.is_empty())
    {
        let mut args = json!({"for": "text", "text": text, "timeout": timeout_s});
        if let Some(selector) = selector {
            args["selector"] = json!(selector);
        }
        let res = registry.dispatch("wait", ctx, args).await;
        if res.is_error {
            return ConditionOutcome {
                matched: false,
                details,
                error: Some("Condition wait failed".into()),
                suggestion: Some("Retry or reduce text scope".into()),
            };
        }
        let payload = res.data.unwrap_or(Value::Null);
        if payload.get("reason").and_then(Value::as_str) == Some("dialog_open") {
            return ConditionOutcome {
                matched: false,
                details,
                error: Some("Blocking JS dialog is open".into()),
                suggestion: payload
                    .get("suggestion")
                    .and_then(Value::as_str)
                    .map(str::to_string),
            };
        }
        let ok = payload
            .get("success")
            .and_then(Value::as_bool)
            .unwrap_or(false);
        details.insert("text".into(), json!({"text": text, "success": ok}));
        if !ok {
            return ConditionOutcome {
                matched: false,
                details,
                error: None,
                suggestion: None,
            };
        }
    }

    if let Some(expr) = cond
        .get("js")
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|s| !s.is_empty())
    {
        let res = registry.dispatch("js", ctx, json!({"code": expr})).await;
        if res.is_error {
            return ConditionOutcome {
                matched: false,
                details,
                error: Some("Condition JS failed".into()),
                suggestion: Some("Check JS expression or page state".into()),
            };
        }
        let payload = res.data.unwrap_or(Value::Null);
        let result = payload.get("result").map(truthy).unwrap_or(false);
        let expr_note = if expr.len() > 120 {
            format!("{}…", &expr[..120])
        } else {
            expr.to_string()
        };
        details.insert("js".into(), json!({"expr": expr_note, "result": result}));
        if !result {
            return ConditionOutcome {
                matched: false,
                details,
                error: None,
                suggestion: None,
            };
        }
    }

    ConditionOutcome {
        matched: true,
        details,
        error: None,
        suggestion: None,
    }
}

fn truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().map(|f| f != 0.0).unwrap_or(false),
        Value::String(s) => !s.is_empty(),
        Value::Array(items) => !items.is_empty(),
        Value::Object(_) => true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn truthiness_follows_js() {
        assert!(!truthy(&json!(null)));
        assert!(!truthy(&json!(false)));
        assert!(!truthy(&json!(0)));
        assert!(!truthy(&json!("")));
        assert!(truthy(&json!("x")));
        assert!(truthy(&json!(1)));
        assert!(truthy(&json!({})));
        assert!(!truthy(&json!([])));
    }
}

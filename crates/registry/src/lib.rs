//! Tool registry: `name → (handler, requires_browser)` with O(1) dispatch.
//!
//! Registration is wiring-only; handlers live with their tools. Before a
//! browser-requiring handler runs, dispatch verifies the Chromium process
//! (launch mode), the extension gateway (extension mode), or plain CDP
//! reachability (attach mode), and turns failures into structured errors
//! with actionable next-hints instead of letting the tool hit a dead
//! socket.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};
use tracing::debug;

use artifact_store::ArtifactStore;
use browsermcp_core_types::{ErrorKind, ToolError, ToolResult};
use cdp_adapter::{BrowserConfig, BrowserMode, Launcher};
use memory_center::MemoryCenter;
use policy_center::SafetyPolicy;
use session_center::SessionCenter;

/// Everything a tool handler may need. Cheap to clone (all `Arc`s).
#[derive(Clone)]
pub struct ToolCtx {
    pub config: Arc<BrowserConfig>,
    pub launcher: Arc<Launcher>,
    pub sessions: Arc<SessionCenter>,
    pub memory: Arc<MemoryCenter>,
    pub artifacts: Arc<ArtifactStore>,
    pub policy: Arc<SafetyPolicy>,
}

#[async_trait]
pub trait ToolHandler: Send + Sync {
    async fn call(&self, ctx: &ToolCtx, args: Value) -> ToolResult;
}

/// Adapter so plain async closures can be registered (tests, small tools).
pub struct FnHandler<F>(pub F);

#[async_trait]
impl<F, Fut> ToolHandler for FnHandler<F>
where
    F: Fn(ToolCtx, Value) -> Fut + Send + Sync,
    Fut: Future<Output = ToolResult> + Send,
{
    async fn call(&self, ctx: &ToolCtx, args: Value) -> ToolResult {
        (self.0)(ctx.clone(), args).await
    }
}

/// Convenience for sync closures.
pub fn sync_handler<F>(f: F) -> Arc<dyn ToolHandler>
where
    F: Fn(Value) -> ToolResult + Send + Sync + 'static,
{
    struct SyncHandler<F>(F);

    #[async_trait]
    impl<F> ToolHandler for SyncHandler<F>
    where
        F: Fn(Value) -> ToolResult + Send + Sync,
    {
        async fn call(&self, _ctx: &ToolCtx, args: Value) -> ToolResult {
            (self.0)(args)
        }
    }

    Arc::new(SyncHandler(f))
}

/// Late-bound registry reference. The flow/run handlers are registered
/// into the same registry they dispatch through, so they hold this slot
/// and the wiring code fills it once the registry is complete.
pub type RegistrySlot = Arc<std::sync::OnceLock<Arc<ToolRegistry>>>;

pub fn registry_slot() -> RegistrySlot {
    Arc::new(std::sync::OnceLock::new())
}

#[derive(Default)]
pub struct ToolRegistry {
    handlers: HashMap<String, (Arc<dyn ToolHandler>, bool)>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(
        &mut self,
        name: impl Into<String>,
        handler: Arc<dyn ToolHandler>,
        requires_browser: bool,
    ) {
        self.handlers.insert(name.into(), (handler, requires_browser));
    }

    pub fn has(&self, name: &str) -> bool {
        self.handlers.contains_key(name)
    }

    pub fn tool_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.handlers.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }

    pub async fn dispatch(&self, name: &str, ctx: &ToolCtx, args: Value) -> ToolResult {
        let Some((handler, requires_browser)) = self.handlers.get(name) else {
            return ToolResult::failure(
                ToolError::new(ErrorKind::Validation, format!("Unknown tool: {name}"))
                    .with_tool(name)
                    .with_suggestion("Call tools/list for the catalog")
                    .with_details(json!({"known": self.tool_names()})),
            );
        };

        if *requires_browser {
            if let Some(gate_error) = self.gate_browser(name, ctx).await {
                return gate_error;
            }
        }

        debug!(target: "registry", tool = name, "dispatch");
        handler.call(ctx, args).await
    }

    /// Readiness gate for browser-requiring tools. Returns `Some(error)`
    /// when the call must not reach the handler.
    async fn gate_browser(&self, name: &str, ctx: &ToolCtx) -> Option<ToolResult> {
        match ctx.config.mode {
            BrowserMode::Extension => {
                // The extension gateway is the alternative transport; this
                // server recognizes the mode but ships no bridge, so the
                // gate is a structured refusal rather than a dead socket.
                Some(ToolResult::failure(
                    ToolError::new(
                        ErrorKind::ToolFailure,
                        "Extension is not connected (mode=extension)",
                    )
                    .with_tool(name)
                    .with_suggestion(
                        "Ensure the browser extension gateway is installed and connected, then retry (check via browser(action=\"status\"))",
                    ),
                ))
            }
            BrowserMode::Launch => {
                match ctx.launcher.ensure_running().await {
                    Ok(_) => {
                        if ctx.launcher.cdp_ready(Duration::from_millis(600)).await {
                            None
                        } else {
                            Some(self.cdp_unreachable(name, ctx))
                        }
                    }
                    Err(err) => Some(ToolResult::failure(
                        ToolError::new(ErrorKind::CdpBrick, err.to_string())
                            .with_tool(name)
                            .with_suggestion(
                                "Try browser(action=\"recover\") (hard restart if owned) or change MCP_BROWSER_PORT",
                            )
                            .with_details(json!({"cdpPort": ctx.launcher.active_port()})),
                    )),
                }
            }
            BrowserMode::Attach => {
                if ctx.launcher.cdp_ready(Duration::from_millis(600)).await {
                    None
                } else {
                    Some(self.cdp_unreachable(name, ctx))
                }
            }
        }
    }

    fn cdp_unreachable(&self, name: &str, ctx: &ToolCtx) -> ToolResult {
        ToolResult::failure(
            ToolError::new(
                ErrorKind::CdpBrick,
                "CDP endpoint not reachable (port may be in use or Chrome is hung)",
            )
            .with_tool(name)
            .with_suggestion(
                "Try browser(action=\"recover\") (hard restart if owned) or change MCP_BROWSER_PORT",
            )
            .with_details(json!({"cdpPort": ctx.launcher.active_port()})),
        )
    }
}

/// Test context: stub factory session center, default config, no browser.
pub fn test_ctx() -> ToolCtx {
    let config = Arc::new(BrowserConfig::default());
    ToolCtx {
        launcher: Arc::new(Launcher::new(config.clone())),
        sessions: Arc::new(SessionCenter::with_defaults(
            std::env::temp_dir().join("browsermcp-test"),
        )),
        memory: Arc::new(MemoryCenter::new()),
        artifacts: Arc::new(ArtifactStore::new()),
        policy: Arc::new(SafetyPolicy::new()),
        config,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn unknown_tool_is_a_validation_error() {
        let registry = ToolRegistry::new();
        let ctx = test_ctx();
        let res = registry.dispatch("nope", &ctx, json!({})).await;
        assert!(res.is_error);
        assert_eq!(res.error_message(), Some("Unknown tool: nope"));
        assert_eq!(res.data.as_ref().unwrap()["kind"], json!("validation"));
    }

    #[tokio::test]
    async fn registered_handler_runs_without_browser_gate() {
        let mut registry = ToolRegistry::new();
        registry.register(
            "echo",
            sync_handler(|args| ToolResult::json(json!({"ok": true, "echo": args}))),
            false,
        );
        let ctx = test_ctx();
        let res = registry.dispatch("echo", &ctx, json!({"x": 1})).await;
        assert!(!res.is_error);
        assert_eq!(res.data.unwrap()["echo"]["x"], json!(1));
    }

    #[tokio::test]
    async fn tool_names_are_sorted() {
        let mut registry = ToolRegistry::new();
        registry.register("b", sync_handler(|_| ToolResult::text("b")), false);
        registry.register("a", sync_handler(|_| ToolResult::text("a")), false);
        assert_eq!(registry.tool_names(), vec!["a", "b"]);
        assert_eq!(registry.len(), 2);
    }
}

//! Server surface: the stdio JSON-RPC loop, the protocol contract, and
//! registry wiring. Wiring stays small on purpose; handlers live in
//! `crate::tools`.

pub mod catalog;
pub mod contract;
pub mod rpc;

use std::sync::Arc;

use action_flow::FlowEngine;
use browsermcp_registry::{FnHandler, RegistrySlot, ToolRegistry};

/// Compose every handler into a registry. The flow/run/runbook handlers
/// dispatch through the same registry, so they receive the late-bound
/// slot and the caller fills it afterwards.
pub fn create_default_registry(slot: RegistrySlot) -> ToolRegistry {
    let mut registry = ToolRegistry::new();
    crate::tools::register_all(&mut registry, slot.clone());

    let flow_engine = Arc::new(FlowEngine::new(slot.clone()));
    {
        let engine = flow_engine.clone();
        registry.register(
            "flow",
            Arc::new(FnHandler(
                move |ctx: browsermcp_registry::ToolCtx, args: serde_json::Value| {
                    let engine = engine.clone();
                    async move {
                        let args = args.as_object().cloned().unwrap_or_default();
                        engine.handle_flow(&ctx, &args).await
                    }
                },
            )),
            true,
        );
    }
    {
        let engine = flow_engine;
        registry.register(
            "run",
            Arc::new(FnHandler(
                move |ctx: browsermcp_registry::ToolCtx, args: serde_json::Value| {
                    let engine = engine.clone();
                    async move {
                        let args = args.as_object().cloned().unwrap_or_default();
                        engine.handle_run(&ctx, &args).await
                    }
                },
            )),
            true,
        );
    }

    registry
}

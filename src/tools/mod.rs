//! Concrete tool handlers. Each submodule owns one surface area; this
//! module is registration wiring only.

pub mod artifacts;
pub mod browser;
pub mod data;
pub mod dialog_tabs;
pub mod download;
pub mod interact;
pub mod navigation;
pub mod net;
pub mod page;
pub mod runbook;
pub mod support;

use std::sync::Arc;

use browsermcp_registry::{FnHandler, RegistrySlot, ToolRegistry};

pub fn register_all(registry: &mut ToolRegistry, slot: RegistrySlot) {
    registry.register("navigate", Arc::new(FnHandler(navigation::navigate)), true);
    registry.register("wait", Arc::new(FnHandler(navigation::wait)), true);

    registry.register("click", Arc::new(FnHandler(interact::click)), true);
    registry.register("type", Arc::new(FnHandler(interact::type_text)), true);
    registry.register("scroll", Arc::new(FnHandler(interact::scroll)), true);
    registry.register("mouse", Arc::new(FnHandler(interact::mouse)), true);
    registry.register("resize", Arc::new(FnHandler(interact::resize)), true);

    registry.register("js", Arc::new(FnHandler(data::js)), true);
    registry.register("screenshot", Arc::new(FnHandler(data::screenshot)), true);
    registry.register("form", Arc::new(FnHandler(data::form)), true);
    registry.register("upload", Arc::new(FnHandler(data::upload)), true);
    registry.register("storage", Arc::new(FnHandler(data::storage)), true);
    registry.register("cookies", Arc::new(FnHandler(data::cookies)), true);
    registry.register("captcha", Arc::new(FnHandler(data::captcha)), true);
    registry.register("totp", Arc::new(FnHandler(data::totp)), false);

    registry.register("fetch", Arc::new(FnHandler(net::fetch)), false);
    registry.register("http", Arc::new(FnHandler(net::http)), false);

    registry.register("download", Arc::new(FnHandler(download::download)), true);

    registry.register("dialog", Arc::new(FnHandler(dialog_tabs::dialog)), true);
    registry.register("tabs", Arc::new(FnHandler(dialog_tabs::tabs)), true);

    registry.register("page", Arc::new(FnHandler(page::page)), true);
    registry.register(
        "extract_content",
        Arc::new(FnHandler(page::extract_content)),
        true,
    );

    registry.register("artifact", Arc::new(FnHandler(artifacts::artifact)), false);
    registry.register("browser", Arc::new(FnHandler(browser::browser)), false);

    {
        let slot = slot.clone();
        registry.register(
            "runbook",
            Arc::new(FnHandler(
                move |ctx: browsermcp_registry::ToolCtx, args: serde_json::Value| {
                    let slot = slot.clone();
                    async move { runbook::runbook(ctx, args, slot).await }
                },
            )),
            false,
        );
    }
}

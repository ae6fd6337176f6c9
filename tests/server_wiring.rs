//! Wiring-level checks: the default registry matches the published
//! catalog, and the no-browser tools answer without a Chromium around.

use serde_json::{json, Value};

use browsermcp_registry::{registry_slot, test_ctx};
use browsermcp_server::server::{catalog, contract, create_default_registry};

#[test]
fn registry_and_catalog_agree_on_the_tool_set() {
    let registry = create_default_registry(registry_slot());
    let mut registered = registry.tool_names();
    let mut cataloged: Vec<String> = catalog::tool_catalog()
        .iter()
        .filter_map(|t| t["name"].as_str().map(str::to_string))
        .collect();
    registered.sort();
    cataloged.sort();
    assert_eq!(registered, cataloged, "catalog drifted from the registry");
}

#[test]
fn contract_markdown_mentions_every_registered_tool() {
    let registry = create_default_registry(registry_slot());
    let markdown = contract::contract_markdown();
    for name in registry.tool_names() {
        assert!(markdown.contains(&format!("## {name}")), "missing {name}");
    }
}

#[tokio::test]
async fn memory_tool_round_trips_without_a_browser() {
    let slot = registry_slot();
    let registry = std::sync::Arc::new(create_default_registry(slot.clone()));
    let _ = slot.set(registry.clone());
    let ctx = test_ctx();

    let res = registry
        .dispatch(
            "browser",
            &ctx,
            json!({"action": "memory", "memory_action": "set", "key": "greeting", "value": "hello"}),
        )
        .await;
    assert!(!res.is_error);

    let res = registry
        .dispatch(
            "browser",
            &ctx,
            json!({"action": "memory", "memory_action": "get", "key": "greeting", "reveal": true}),
        )
        .await;
    assert!(!res.is_error);
    assert_eq!(res.data.unwrap()["memory"]["value"], json!("hello"));
}

#[tokio::test]
async fn totp_and_artifact_tools_work_offline() {
    let slot = registry_slot();
    let registry = std::sync::Arc::new(create_default_registry(slot.clone()));
    let _ = slot.set(registry.clone());
    let ctx = test_ctx();

    let res = registry
        .dispatch(
            "totp",
            &ctx,
            json!({"secret": "GEZDGNBVGY3TQOJQGEZDGNBVGY3TQOJQ"}),
        )
        .await;
    assert!(!res.is_error);
    assert_eq!(res.data.unwrap()["code"].as_str().unwrap().len(), 6);

    let reference = ctx.artifacts.put_json("probe", &json!({"k": 1}), json!({}));
    let res = registry
        .dispatch(
            "artifact",
            &ctx,
            json!({"action": "get", "id": reference.id, "offset": 0, "max_chars": 100}),
        )
        .await;
    assert!(!res.is_error);
    let data: Value = res.data.unwrap();
    assert_eq!(data["artifact"]["data"], json!("{\"k\":1}"));
}

#[tokio::test]
async fn unknown_tool_reports_validation_error() {
    let slot = registry_slot();
    let registry = std::sync::Arc::new(create_default_registry(slot.clone()));
    let _ = slot.set(registry.clone());
    let ctx = test_ctx();

    let res = registry.dispatch("teleport", &ctx, json!({})).await;
    assert!(res.is_error);
    assert_eq!(res.data.unwrap()["kind"], json!("validation"));
}

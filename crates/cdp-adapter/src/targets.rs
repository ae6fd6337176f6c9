//! DevTools HTTP endpoint helpers (`/json/*`): target listing and tab
//! lifecycle. These go over plain HTTP so they keep working even when a
//! page's CDP session is wedged.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::config::BrowserConfig;
use crate::error::{AdapterError, AdapterErrorKind};

/// A CDP target (tab) row as Chrome reports it.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TargetInfo {
    pub id: String,
    #[serde(default)]
    pub url: String,
    #[serde(default)]
    pub title: String,
    #[serde(rename = "type", default)]
    pub target_type: String,
    #[serde(rename = "webSocketDebuggerUrl", default)]
    pub ws_url: Option<String>,
    #[serde(skip_deserializing, default)]
    pub active: bool,
}

impl TargetInfo {
    pub fn is_page(&self) -> bool {
        self.target_type == "page"
    }
}

fn http_client(timeout: Duration) -> Result<reqwest::Client, AdapterError> {
    reqwest::Client::builder()
        .timeout(timeout)
        .build()
        .map_err(|err| {
            AdapterError::new(AdapterErrorKind::Internal)
                .with_hint(format!("http client build failed: {err}"))
        })
}

fn not_reachable(err: reqwest::Error) -> AdapterError {
    AdapterError::new(AdapterErrorKind::NotReachable)
        .with_hint(format!("cdp endpoint not reachable: {err}"))
        .retriable(true)
}

/// GET `/json/version`; used both as a readiness probe and for the
/// browser-level WebSocket URL.
pub async fn version(config: &BrowserConfig, timeout: Duration) -> Result<Value, AdapterError> {
    let client = http_client(timeout)?;
    let url = format!("{}/json/version", config.devtools_http_base());
    let resp = client.get(&url).send().await.map_err(not_reachable)?;
    resp.json().await.map_err(|err| {
        AdapterError::new(AdapterErrorKind::Internal)
            .with_hint(format!("bad /json/version payload: {err}"))
    })
}

/// GET `/json/list` filtered to page targets.
pub async fn list_pages(
    config: &BrowserConfig,
    timeout: Duration,
) -> Result<Vec<TargetInfo>, AdapterError> {
    let client = http_client(timeout)?;
    let url = format!("{}/json/list", config.devtools_http_base());
    let resp = client.get(&url).send().await.map_err(not_reachable)?;
    let targets: Vec<TargetInfo> = resp.json().await.map_err(|err| {
        AdapterError::new(AdapterErrorKind::Internal)
            .with_hint(format!("bad /json/list payload: {err}"))
    })?;
    Ok(targets.into_iter().filter(TargetInfo::is_page).collect())
}

/// PUT `/json/new?url`: open a tab and return its target row.
pub async fn new_tab(
    config: &BrowserConfig,
    url: &str,
    timeout: Duration,
) -> Result<TargetInfo, AdapterError> {
    let client = http_client(timeout)?;
    let endpoint = format!("{}/json/new?{}", config.devtools_http_base(), url);
    let resp = client.put(&endpoint).send().await.map_err(not_reachable)?;
    resp.json().await.map_err(|err| {
        AdapterError::new(AdapterErrorKind::Internal)
            .with_hint(format!("bad /json/new payload: {err}"))
    })
}

/// GET `/json/activate/<id>`: bring a tab to the foreground.
pub async fn activate(
    config: &BrowserConfig,
    target_id: &str,
    timeout: Duration,
) -> Result<(), AdapterError> {
    let client = http_client(timeout)?;
    let endpoint = format!(
        "{}/json/activate/{}",
        config.devtools_http_base(),
        target_id
    );
    client.get(&endpoint).send().await.map_err(not_reachable)?;
    Ok(())
}

/// GET `/json/close/<id>`.
pub async fn close(
    config: &BrowserConfig,
    target_id: &str,
    timeout: Duration,
) -> Result<(), AdapterError> {
    let client = http_client(timeout)?;
    let endpoint = format!("{}/json/close/{}", config.devtools_http_base(), target_id);
    client.get(&endpoint).send().await.map_err(not_reachable)?;
    Ok(())
}

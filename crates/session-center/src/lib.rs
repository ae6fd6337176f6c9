//! Session center: the process-wide owner of browser-session state.
//!
//! One shared CDP session serves a whole batched run; Tier-0 telemetry is
//! aggregated per tab from the raw event queue; the affordance registry
//! maps stable `aff:<hash>` refs to concrete tool calls; auto-dialog
//! directives and the out-of-band dialog closer live here because they
//! must outlive any single in-flight CDP request.

pub mod affordance;
pub mod dialogs;
pub mod telemetry;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::Mutex;
use serde_json::{json, Value};
use tokio::sync::OwnedMutexGuard;
use tracing::{debug, warn};

use cdp_adapter::{
    targets, AdapterError, AdapterErrorKind, BrowserConfig, CdpSession, PageSession, TargetInfo,
};

pub use affordance::{affordance_ref, AffordanceItem, AffordanceMap, AffordanceState, LabelMatch};
pub use dialogs::AutoDialogMode;
pub use telemetry::{TabTelemetry, Tier0Snapshot};

/// Seam for opening sessions/tabs. The real factory speaks CDP; tests
/// install a scripted one.
#[async_trait]
pub trait SessionFactory: Send + Sync {
    /// Open a session on the active page target.
    async fn open(
        &self,
        config: &BrowserConfig,
    ) -> Result<(Arc<dyn PageSession>, TargetInfo), AdapterError>;

    /// Open a second, fresh connection to the same tab (out-of-band work).
    async fn open_oob(
        &self,
        config: &BrowserConfig,
        tab_id: &str,
    ) -> Result<Arc<dyn PageSession>, AdapterError>;

    async fn list_tabs(&self, config: &BrowserConfig) -> Result<Vec<TargetInfo>, AdapterError>;

    async fn activate(&self, config: &BrowserConfig, tab_id: &str) -> Result<(), AdapterError>;
}

/// Default factory: per-tab WebSocket connections via the DevTools HTTP
/// endpoint.
pub struct CdpSessionFactory;

const HTTP_PROBE: Duration = Duration::from_secs(3);
const DEFAULT_DEADLINE: Duration = Duration::from_secs(30);

#[async_trait]
impl SessionFactory for CdpSessionFactory {
    async fn open(
        &self,
        config: &BrowserConfig,
    ) -> Result<(Arc<dyn PageSession>, TargetInfo), AdapterError> {
        let pages = targets::list_pages(config, HTTP_PROBE).await?;
        let target = pages
            .into_iter()
            .next()
            .ok_or_else(|| AdapterError::new(AdapterErrorKind::TargetNotFound).with_hint("no page targets"))?;
        let ws_url = target.ws_url.clone().ok_or_else(|| {
            AdapterError::new(AdapterErrorKind::TargetNotFound)
                .with_hint("target has no webSocketDebuggerUrl")
        })?;
        let session =
            CdpSession::connect(&ws_url, target.id.clone(), target.url.clone(), DEFAULT_DEADLINE)
                .await?;
        Ok((Arc::new(session), target))
    }

    async fn open_oob(
        &self,
        config: &BrowserConfig,
        tab_id: &str,
    ) -> Result<Arc<dyn PageSession>, AdapterError> {
        let pages = targets::list_pages(config, HTTP_PROBE).await?;
        let target = pages.into_iter().find(|t| t.id == tab_id).ok_or_else(|| {
            AdapterError::new(AdapterErrorKind::TargetNotFound)
                .with_hint(format!("tab {tab_id} not found"))
        })?;
        let ws_url = target.ws_url.clone().ok_or_else(|| {
            AdapterError::new(AdapterErrorKind::TargetNotFound)
                .with_hint("target has no webSocketDebuggerUrl")
        })?;
        let session =
            CdpSession::connect(&ws_url, target.id, target.url, Duration::from_secs(5)).await?;
        Ok(Arc::new(session))
    }

    async fn list_tabs(&self, config: &BrowserConfig) -> Result<Vec<TargetInfo>, AdapterError> {
        targets::list_pages(config, HTTP_PROBE).await
    }

    async fn activate(&self, config: &BrowserConfig, tab_id: &str) -> Result<(), AdapterError> {
        targets::activate(config, tab_id, HTTP_PROBE).await
    }
}

struct ActiveSession {
    session: Arc<dyn PageSession>,
    target: TargetInfo,
}

/// Exclusive borrow of the shared session for one batched run.
pub struct SharedSessionGuard {
    _borrow: OwnedMutexGuard<()>,
    pub session: Arc<dyn PageSession>,
    pub target: TargetInfo,
}

pub struct SessionCenter {
    factory: Arc<dyn SessionFactory>,
    borrow: Arc<tokio::sync::Mutex<()>>,
    active: Mutex<Option<ActiveSession>>,
    telemetry: DashMap<String, Arc<TabTelemetry>>,
    telemetry_enabled: DashMap<String, ()>,
    affordances: DashMap<String, AffordanceMap>,
    auto_dialog: DashMap<String, dialogs::AutoDialogDirective>,
    download_dirs: DashMap<String, PathBuf>,
    download_root: PathBuf,
}

impl SessionCenter {
    pub fn new(factory: Arc<dyn SessionFactory>, download_root: PathBuf) -> Self {
        Self {
            factory,
            borrow: Arc::new(tokio::sync::Mutex::new(())),
            active: Mutex::new(None),
            telemetry: DashMap::new(),
            telemetry_enabled: DashMap::new(),
            affordances: DashMap::new(),
            auto_dialog: DashMap::new(),
            download_dirs: DashMap::new(),
            download_root,
        }
    }

    pub fn with_defaults(download_root: PathBuf) -> Self {
        Self::new(Arc::new(CdpSessionFactory), download_root)
    }

    // ── shared session ──────────────────────────────────────────────

    /// Acquire the shared session for a whole batch. Only one caller may
    /// hold it at a time; release is unconditional on drop.
    pub async fn shared_session(
        &self,
        config: &BrowserConfig,
    ) -> Result<SharedSessionGuard, AdapterError> {
        let borrow = self.borrow.clone().lock_owned().await;
        let (session, target) = self.get_or_open(config).await?;
        Ok(SharedSessionGuard {
            _borrow: borrow,
            session,
            target,
        })
    }

    /// Current session, opening one if needed (single tool calls outside a
    /// batch use this path).
    pub async fn get_or_open(
        &self,
        config: &BrowserConfig,
    ) -> Result<(Arc<dyn PageSession>, TargetInfo), AdapterError> {
        {
            let guard = self.active.lock();
            if let Some(active) = guard.as_ref() {
                if active.session.is_alive() {
                    return Ok((active.session.clone(), active.target.clone()));
                }
            }
        }

        let (session, target) = self.factory.open(config).await?;
        *self.active.lock() = Some(ActiveSession {
            session: session.clone(),
            target: target.clone(),
        });
        debug!(target: "session.center", tab = %target.id, "session opened");
        Ok((session, target))
    }

    /// Active session without opening a new one.
    pub fn active_session(&self) -> Option<(Arc<dyn PageSession>, TargetInfo)> {
        let guard = self.active.lock();
        guard
            .as_ref()
            .map(|a| (a.session.clone(), a.target.clone()))
    }

    /// Install a session directly (tests, tab switching).
    pub fn install_session(&self, session: Arc<dyn PageSession>, target: TargetInfo) {
        *self.active.lock() = Some(ActiveSession { session, target });
    }

    pub fn tab_id(&self) -> Option<String> {
        self.active.lock().as_ref().map(|a| a.target.id.clone())
    }

    /// Drop the active session (brick recovery path).
    pub fn drop_session(&self) {
        if let Some(active) = self.active.lock().take() {
            active.session.abort();
        }
    }

    // ── telemetry ───────────────────────────────────────────────────

    pub fn telemetry(&self, tab_id: &str) -> Arc<TabTelemetry> {
        self.telemetry
            .entry(tab_id.to_string())
            .or_insert_with(|| Arc::new(TabTelemetry::new()))
            .clone()
    }

    pub fn get_telemetry(&self, tab_id: &str) -> Option<Arc<TabTelemetry>> {
        self.telemetry.get(tab_id).map(|entry| entry.clone())
    }

    /// Enable the CDP domains Tier-0 listens to (idempotent per tab).
    pub async fn ensure_telemetry(&self, session: &Arc<dyn PageSession>) {
        let tab_id = session.tab_id();
        if self.telemetry_enabled.contains_key(&tab_id) {
            return;
        }
        for domain in ["Page.enable", "Runtime.enable", "Network.enable", "Log.enable"] {
            if let Err(err) = session
                .send_with_deadline(domain, json!({}), Duration::from_secs(5))
                .await
            {
                warn!(target: "session.center", tab = %tab_id, domain, error = %err, "enable failed");
                return;
            }
        }
        self.telemetry_enabled.insert(tab_id.clone(), ());
        self.telemetry(&tab_id);
    }

    /// Drain the raw event queue and fold everything into Tier-0.
    ///
    /// Dialogs are the load-bearing case: they can open between steps
    /// (`setTimeout(alert)`) and wedge every later CDP call, so ingest has
    /// to happen at safe points rather than on a listener thread.
    pub fn drain_and_ingest(&self, session: &Arc<dyn PageSession>) {
        let tab_id = session.tab_id();
        let events = session.take_events(50);
        if events.is_empty() {
            return;
        }
        let telemetry = self.telemetry(&tab_id);
        for event in events {
            telemetry.ingest(&event.method, &event.params);
            if event.method == "Page.frameNavigated" {
                if let Some(url) = event
                    .params
                    .get("frame")
                    .and_then(|f| f.get("url"))
                    .and_then(Value::as_str)
                {
                    session.set_tab_url(url.to_string());
                }
            }
        }
    }

    pub fn tier0_snapshot(
        &self,
        tab_id: &str,
        since: Option<i64>,
        offset: usize,
        limit: usize,
    ) -> Option<Tier0Snapshot> {
        let telemetry = self.get_telemetry(tab_id)?;
        Some(telemetry.snapshot(since, offset, limit))
    }

    pub fn clear_har_lite(&self, tab_id: &str) {
        if let Some(telemetry) = self.get_telemetry(tab_id) {
            telemetry.clear_har();
        }
    }

    pub fn note_dialog_closed(&self, tab_id: &str, accepted: bool) {
        if let Some(telemetry) = self.get_telemetry(tab_id) {
            telemetry.note_dialog_closed(accepted);
        }
    }

    // ── auto-dialog ─────────────────────────────────────────────────

    pub fn set_auto_dialog(&self, tab_id: &str, mode: AutoDialogMode, ttl: Duration) {
        self.auto_dialog
            .insert(tab_id.to_string(), dialogs::AutoDialogDirective::new(mode, ttl));
    }

    pub fn auto_dialog_mode(&self, tab_id: &str) -> Option<AutoDialogMode> {
        let entry = self.auto_dialog.get(tab_id)?;
        if entry.expired() {
            drop(entry);
            self.auto_dialog.remove(tab_id);
            return None;
        }
        Some(entry.mode)
    }

    pub fn clear_auto_dialog(&self, tab_id: &str) {
        self.auto_dialog.remove(tab_id);
    }

    /// Close a dialog out-of-band on a fresh connection so the in-flight
    /// shared-session request cannot be wedged by the close itself.
    pub fn schedule_auto_dialog_handle(&self, config: &BrowserConfig, tab_id: &str, accept: bool) {
        let factory = self.factory.clone();
        let config = config.clone();
        let tab_id = tab_id.to_string();
        let telemetry = self.telemetry(&tab_id);
        tokio::spawn(async move {
            match factory.open_oob(&config, &tab_id).await {
                Ok(oob) => {
                    let res = oob
                        .send_with_deadline(
                            "Page.handleJavaScriptDialog",
                            json!({"accept": accept}),
                            Duration::from_secs(2),
                        )
                        .await;
                    match res {
                        Ok(_) => telemetry.note_dialog_closed(accept),
                        Err(err) if dialogs::is_no_dialog_error(&err) => {
                            telemetry.note_dialog_closed(accept)
                        }
                        Err(err) => {
                            debug!(target: "session.dialogs", tab = %tab_id, error = %err, "oob close failed")
                        }
                    }
                    oob.abort();
                }
                Err(err) => {
                    debug!(target: "session.dialogs", tab = %tab_id, error = %err, "oob connect failed")
                }
            }
        });
    }

    // ── affordances ─────────────────────────────────────────────────

    pub fn set_affordances(
        &self,
        tab_id: &str,
        items: Vec<AffordanceItem>,
        url: String,
        cursor: i64,
    ) {
        self.affordances
            .insert(tab_id.to_string(), AffordanceMap { url, cursor, items });
    }

    pub fn resolve_affordance(
        &self,
        tab_id: &str,
        ref_id: &str,
    ) -> (Option<AffordanceItem>, Option<AffordanceState>) {
        let Some(map) = self.affordances.get(tab_id) else {
            return (None, None);
        };
        let state = map.state();
        let item = map.items.iter().find(|item| item.ref_id == ref_id).cloned();
        (item, Some(state))
    }

    pub fn resolve_affordance_by_label(
        &self,
        tab_id: &str,
        label: &str,
        kind: Option<&str>,
        index: Option<usize>,
        max_matches: usize,
    ) -> (Option<AffordanceItem>, Option<AffordanceState>, Vec<LabelMatch>) {
        let Some(map) = self.affordances.get(tab_id) else {
            return (None, None, Vec::new());
        };
        let state = map.state();
        let (item, matches) = map.resolve_by_label(label, kind, index, max_matches);
        (item, Some(state), matches)
    }

    // ── tabs ────────────────────────────────────────────────────────

    pub async fn list_tabs(&self, config: &BrowserConfig) -> Result<Vec<TargetInfo>, AdapterError> {
        let mut tabs = self.factory.list_tabs(config).await?;
        let active = self.tab_id();
        for tab in &mut tabs {
            tab.active = Some(&tab.id) == active.as_ref();
        }
        Ok(tabs)
    }

    /// Switch the shared session to another tab.
    pub async fn switch_tab(
        &self,
        config: &BrowserConfig,
        tab_id: &str,
    ) -> Result<bool, AdapterError> {
        self.factory.activate(config, tab_id).await?;
        let session = self.factory.open_oob(config, tab_id).await?;
        let tabs = self.factory.list_tabs(config).await?;
        let Some(target) = tabs.into_iter().find(|t| t.id == tab_id) else {
            return Ok(false);
        };
        if let Some(old) = self.active.lock().take() {
            old.session.abort();
        }
        self.install_session(session, target);
        // New tab means new CDP domains to enable.
        self.telemetry_enabled.remove(tab_id);
        Ok(true)
    }

    // ── downloads ───────────────────────────────────────────────────

    pub fn download_dir(&self, tab_id: &str) -> PathBuf {
        self.download_dirs
            .entry(tab_id.to_string())
            .or_insert_with(|| self.download_root.join(tab_id))
            .clone()
    }

    /// Point Chromium's download behavior at the per-tab directory.
    pub async fn ensure_downloads(&self, session: &Arc<dyn PageSession>) {
        let dir = self.download_dir(&session.tab_id());
        if let Err(err) = std::fs::create_dir_all(&dir) {
            warn!(target: "session.center", error = %err, "download dir create failed");
            return;
        }
        let _ = session
            .send_with_deadline(
                "Page.setDownloadBehavior",
                json!({"behavior": "allow", "downloadPath": dir.to_string_lossy()}),
                Duration::from_secs(3),
            )
            .await;
    }

    // ── lifecycle ───────────────────────────────────────────────────

    /// Wipe per-tab state (tests and hard recovery).
    pub fn recover_reset(&self) {
        self.drop_session();
        self.telemetry.clear();
        self.telemetry_enabled.clear();
        self.affordances.clear();
        self.auto_dialog.clear();
        self.download_dirs.clear();
    }

    pub async fn shutdown(&self) {
        self.drop_session();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cdp_adapter::StubSession;

    fn target(id: &str, url: &str) -> TargetInfo {
        TargetInfo {
            id: id.into(),
            url: url.into(),
            title: String::new(),
            target_type: "page".into(),
            ws_url: None,
            active: false,
        }
    }

    struct NoFactory;

    #[async_trait]
    impl SessionFactory for NoFactory {
        async fn open(
            &self,
            _config: &BrowserConfig,
        ) -> Result<(Arc<dyn PageSession>, TargetInfo), AdapterError> {
            Err(AdapterError::new(AdapterErrorKind::NotReachable))
        }
        async fn open_oob(
            &self,
            _config: &BrowserConfig,
            _tab_id: &str,
        ) -> Result<Arc<dyn PageSession>, AdapterError> {
            Err(AdapterError::new(AdapterErrorKind::NotReachable))
        }
        async fn list_tabs(
            &self,
            _config: &BrowserConfig,
        ) -> Result<Vec<TargetInfo>, AdapterError> {
            Ok(Vec::new())
        }
        async fn activate(
            &self,
            _config: &BrowserConfig,
            _tab_id: &str,
        ) -> Result<(), AdapterError> {
            Ok(())
        }
    }

    fn center() -> SessionCenter {
        SessionCenter::new(Arc::new(NoFactory), std::env::temp_dir().join("bmcp-test-dl"))
    }

    #[tokio::test]
    async fn installed_session_is_reused() {
        let center = center();
        let stub: Arc<dyn PageSession> = Arc::new(StubSession::new("t1", "https://a.test/"));
        center.install_session(stub, target("t1", "https://a.test/"));
        let cfg = BrowserConfig::default();
        let (session, tgt) = center.get_or_open(&cfg).await.unwrap();
        assert_eq!(session.tab_id(), "t1");
        assert_eq!(tgt.id, "t1");
        assert_eq!(center.tab_id().as_deref(), Some("t1"));
    }

    #[tokio::test]
    async fn shared_session_is_exclusive() {
        let center = Arc::new(center());
        let stub: Arc<dyn PageSession> = Arc::new(StubSession::new("t1", "about:blank"));
        center.install_session(stub, target("t1", "about:blank"));
        let cfg = BrowserConfig::default();
        let guard = center.shared_session(&cfg).await.unwrap();

        let second = {
            let center = center.clone();
            let cfg = cfg.clone();
            tokio::time::timeout(Duration::from_millis(50), async move {
                center.shared_session(&cfg).await
            })
            .await
        };
        assert!(second.is_err(), "second borrow must block");
        drop(guard);
        assert!(center.shared_session(&cfg).await.is_ok());
    }

    #[tokio::test]
    async fn dialog_events_flow_into_telemetry() {
        let center = center();
        let stub = Arc::new(StubSession::new("t1", "about:blank"));
        stub.push_event(
            "Page.javascriptDialogOpening",
            serde_json::json!({"type": "alert", "message": "hey", "url": "https://a.test/"}),
        );
        let session: Arc<dyn PageSession> = stub.clone();
        center.install_session(session.clone(), target("t1", "about:blank"));
        center.drain_and_ingest(&session);
        let telemetry = center.get_telemetry("t1").unwrap();
        assert!(telemetry.dialog_open());
        center.note_dialog_closed("t1", false);
        assert!(!telemetry.dialog_open());
    }

    #[test]
    fn auto_dialog_directive_expires() {
        let center = center();
        center.set_auto_dialog("t1", AutoDialogMode::Dismiss, Duration::from_millis(0));
        assert_eq!(center.auto_dialog_mode("t1"), None);
        center.set_auto_dialog("t1", AutoDialogMode::Accept, Duration::from_secs(30));
        assert_eq!(center.auto_dialog_mode("t1"), Some(AutoDialogMode::Accept));
        center.clear_auto_dialog("t1");
        assert_eq!(center.auto_dialog_mode("t1"), None);
    }
}

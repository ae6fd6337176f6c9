//! Page sessions: the surface the engine and tools drive.
//!
//! `PageSession` is the seam between the run engine and the browser. The
//! real implementation wraps one `CdpTransport` connected to a tab's
//! WebSocket; `StubSession` is a scripted stand-in used across the
//! workspace's tests.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::{json, Value};

use crate::error::{AdapterError, AdapterErrorKind};
use crate::transport::{CdpTransport, TransportEvent};

/// One active CDP page connection.
#[async_trait]
pub trait PageSession: Send + Sync {
    async fn send(&self, method: &str, params: Value) -> Result<Value, AdapterError>;

    async fn send_with_deadline(
        &self,
        method: &str,
        params: Value,
        deadline: Duration,
    ) -> Result<Value, AdapterError>;

    /// Evaluate an expression and return its JSON value.
    async fn eval_js(&self, expression: &str, deadline: Duration) -> Result<Value, AdapterError>;

    /// Trusted click at viewport coordinates.
    async fn click_xy(&self, x: f64, y: f64) -> Result<(), AdapterError>;

    async fn screenshot_b64(&self) -> Result<String, AdapterError>;

    /// Pull already-buffered events off the socket (non-blocking).
    fn drain_events(&self, max: usize) -> usize;

    /// Remove and return the first buffered event with this method name.
    fn pop_event(&self, method: &str) -> Option<Value>;

    /// Drain up to `max` buffered events for Tier-0 ingest. Consumes them.
    fn take_events(&self, max: usize) -> Vec<TransportEvent>;

    /// Hard-break the underlying transport (watchdog escape hatch).
    fn abort(&self);

    fn is_alive(&self) -> bool;

    fn tab_id(&self) -> String;

    fn tab_url(&self) -> String;

    fn set_tab_url(&self, url: String);
}

/// Real session over one tab WebSocket.
pub struct CdpSession {
    transport: Arc<CdpTransport>,
    tab_id: String,
    tab_url: Mutex<String>,
    events: Mutex<VecDeque<TransportEvent>>,
}

impl CdpSession {
    pub async fn connect(
        ws_url: &str,
        tab_id: impl Into<String>,
        tab_url: impl Into<String>,
        default_deadline: Duration,
    ) -> Result<Self, AdapterError> {
        let transport = CdpTransport::connect(ws_url, default_deadline).await?;
        Ok(Self {
            transport: Arc::new(transport),
            tab_id: tab_id.into(),
            tab_url: Mutex::new(tab_url.into()),
            events: Mutex::new(VecDeque::new()),
        })
    }

    pub fn transport(&self) -> Arc<CdpTransport> {
        self.transport.clone()
    }
}

#[async_trait]
impl PageSession for CdpSession {
    async fn send(&self, method: &str, params: Value) -> Result<Value, AdapterError> {
        self.transport.send(method, params, None).await
    }

    async fn send_with_deadline(
        &self,
        method: &str,
        params: Value,
        deadline: Duration,
    ) -> Result<Value, AdapterError> {
        self.transport
            .send_with_deadline(method, params, None, deadline)
            .await
    }

    async fn eval_js(&self, expression: &str, deadline: Duration) -> Result<Value, AdapterError> {
        let resp = self
            .transport
            .send_with_deadline(
                "Runtime.evaluate",
                json!({
                    "expression": expression,
                    "returnByValue": true,
                    "awaitPromise": true,
                }),
                None,
                deadline,
            )
            .await?;

        if let Some(exc) = resp.get("exceptionDetails") {
            let text = exc
                .get("exception")
                .and_then(|e| e.get("description"))
                .and_then(Value::as_str)
                .or_else(|| exc.get("text").and_then(Value::as_str))
                .unwrap_or("evaluation threw");
            return Err(AdapterError::new(AdapterErrorKind::Internal)
                .with_hint(format!("js exception: {text}")));
        }

        Ok(resp
            .get("result")
            .and_then(|r| r.get("value"))
            .cloned()
            .unwrap_or(Value::Null))
    }

    async fn click_xy(&self, x: f64, y: f64) -> Result<(), AdapterError> {
        for (event_type, click_count) in [("mousePressed", 1), ("mouseReleased", 1)] {
            self.transport
                .send(
                    "Input.dispatchMouseEvent",
                    json!({
                        "type": event_type,
                        "x": x,
                        "y": y,
                        "button": "left",
                        "clickCount": click_count,
                    }),
                    None,
                )
                .await?;
        }
        Ok(())
    }

    async fn screenshot_b64(&self) -> Result<String, AdapterError> {
        let resp = self
            .transport
            .send("Page.captureScreenshot", json!({"format": "png"}), None)
            .await?;
        resp.get("data")
            .and_then(Value::as_str)
            .map(str::to_string)
            .ok_or_else(|| {
                AdapterError::new(AdapterErrorKind::Internal).with_hint("empty screenshot payload")
            })
    }

    fn drain_events(&self, max: usize) -> usize {
        let mut buffered = Vec::new();
        let pulled = self.transport.drain_events(max, &mut buffered);
        if pulled > 0 {
            let mut queue = self.events.lock();
            queue.extend(buffered);
            // Keep the local queue bounded; old events are superseded by
            // Tier-0 counters anyway.
            while queue.len() > 512 {
                queue.pop_front();
            }
        }
        pulled
    }

    fn pop_event(&self, method: &str) -> Option<Value> {
        let mut queue = self.events.lock();
        let pos = queue.iter().position(|event| event.method == method)?;
        queue.remove(pos).map(|event| event.params)
    }

    fn take_events(&self, max: usize) -> Vec<TransportEvent> {
        self.drain_events(max);
        let mut queue = self.events.lock();
        let take = max.min(queue.len());
        queue.drain(..take).collect()
    }

    fn abort(&self) {
        self.transport.abort();
    }

    fn is_alive(&self) -> bool {
        self.transport.is_alive()
    }

    fn tab_id(&self) -> String {
        self.tab_id.clone()
    }

    fn tab_url(&self) -> String {
        self.tab_url.lock().clone()
    }

    fn set_tab_url(&self, url: String) {
        *self.tab_url.lock() = url;
    }
}

/// Scripted session for tests: queued eval/send results, injectable
/// events, and full call recording.
#[derive(Default)]
pub struct StubSession {
    pub tab: Mutex<(String, String)>,
    pub sent: Mutex<Vec<(String, Value)>>,
    pub eval_calls: Mutex<Vec<String>>,
    eval_queue: Mutex<VecDeque<Result<Value, AdapterError>>>,
    send_queue: Mutex<VecDeque<Result<Value, AdapterError>>>,
    events: Mutex<VecDeque<TransportEvent>>,
    aborted: AtomicBool,
    clicks: Mutex<Vec<(f64, f64)>>,
}

impl StubSession {
    pub fn new(tab_id: impl Into<String>, tab_url: impl Into<String>) -> Self {
        Self {
            tab: Mutex::new((tab_id.into(), tab_url.into())),
            ..Self::default()
        }
    }

    pub fn push_eval(&self, result: Value) {
        self.eval_queue.lock().push_back(Ok(result));
    }

    pub fn push_eval_err(&self, err: AdapterError) {
        self.eval_queue.lock().push_back(Err(err));
    }

    pub fn push_send(&self, result: Value) {
        self.send_queue.lock().push_back(Ok(result));
    }

    pub fn push_send_err(&self, err: AdapterError) {
        self.send_queue.lock().push_back(Err(err));
    }

    pub fn push_event(&self, method: impl Into<String>, params: Value) {
        self.events.lock().push_back(TransportEvent {
            method: method.into(),
            params,
            session_id: None,
        });
    }

    pub fn was_aborted(&self) -> bool {
        self.aborted.load(Ordering::Relaxed)
    }

    pub fn sent_methods(&self) -> Vec<String> {
        self.sent.lock().iter().map(|(m, _)| m.clone()).collect()
    }

    pub fn clicks(&self) -> Vec<(f64, f64)> {
        self.clicks.lock().clone()
    }
}

#[async_trait]
impl PageSession for StubSession {
    async fn send(&self, method: &str, params: Value) -> Result<Value, AdapterError> {
        self.sent.lock().push((method.to_string(), params));
        self.send_queue
            .lock()
            .pop_front()
            .unwrap_or(Ok(Value::Null))
    }

    async fn send_with_deadline(
        &self,
        method: &str,
        params: Value,
        _deadline: Duration,
    ) -> Result<Value, AdapterError> {
        self.send(method, params).await
    }

    async fn eval_js(&self, expression: &str, _deadline: Duration) -> Result<Value, AdapterError> {
        self.eval_calls.lock().push(expression.to_string());
        self.eval_queue
            .lock()
            .pop_front()
            .unwrap_or(Ok(Value::Null))
    }

    async fn click_xy(&self, x: f64, y: f64) -> Result<(), AdapterError> {
        self.clicks.lock().push((x, y));
        Ok(())
    }

    async fn screenshot_b64(&self) -> Result<String, AdapterError> {
        Ok("aWJlc3RpbWFnZQ==".to_string())
    }

    fn drain_events(&self, _max: usize) -> usize {
        0
    }

    fn pop_event(&self, method: &str) -> Option<Value> {
        let mut queue = self.events.lock();
        let pos = queue.iter().position(|event| event.method == method)?;
        queue.remove(pos).map(|event| event.params)
    }

    fn take_events(&self, max: usize) -> Vec<TransportEvent> {
        let mut queue = self.events.lock();
        let take = max.min(queue.len());
        queue.drain(..take).collect()
    }

    fn abort(&self) {
        self.aborted.store(true, Ordering::Relaxed);
    }

    fn is_alive(&self) -> bool {
        !self.was_aborted()
    }

    fn tab_id(&self) -> String {
        self.tab.lock().0.clone()
    }

    fn tab_url(&self) -> String {
        self.tab.lock().1.clone()
    }

    fn set_tab_url(&self, url: String) {
        self.tab.lock().1 = url;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn stub_session_replays_queued_results() {
        let stub = StubSession::new("t1", "https://example.test/");
        stub.push_eval(json!(42));
        let out = stub.eval_js("6*7", Duration::from_secs(1)).await.unwrap();
        assert_eq!(out, json!(42));
        // Queue exhausted: defaults to null.
        let out = stub.eval_js("1", Duration::from_secs(1)).await.unwrap();
        assert_eq!(out, Value::Null);
        assert_eq!(stub.eval_calls.lock().len(), 2);
    }

    #[tokio::test]
    async fn stub_session_records_sends_and_abort() {
        let stub = StubSession::new("t1", "about:blank");
        stub.push_send(json!({"ok": true}));
        let out = stub.send("Page.enable", json!({})).await.unwrap();
        assert_eq!(out, json!({"ok": true}));
        assert_eq!(stub.sent_methods(), vec!["Page.enable"]);
        assert!(stub.is_alive());
        stub.abort();
        assert!(stub.was_aborted());
        assert!(!stub.is_alive());
    }

    #[test]
    fn stub_pop_event_is_fifo_per_method() {
        let stub = StubSession::new("t1", "about:blank");
        stub.push_event("Page.javascriptDialogOpening", json!({"message": "hi"}));
        stub.push_event("Page.javascriptDialogClosed", json!({"result": true}));
        assert_eq!(
            stub.pop_event("Page.javascriptDialogOpening").unwrap()["message"],
            json!("hi")
        );
        assert!(stub.pop_event("Page.javascriptDialogOpening").is_none());
        assert!(stub.pop_event("Page.javascriptDialogClosed").is_some());
    }
}

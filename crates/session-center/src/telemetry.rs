//! Tier-0 telemetry: lightweight per-tab aggregation of console, network
//! and dialog events, with a monotonic epoch-ms cursor for delta reports.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use parking_lot::Mutex;
use serde::Serialize;
use serde_json::{json, Value};

fn now_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

#[derive(Debug)]
struct BoundedRing<T> {
    capacity: usize,
    data: VecDeque<T>,
}

impl<T: Clone> BoundedRing<T> {
    fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            data: VecDeque::new(),
        }
    }

    fn push(&mut self, item: T) {
        if self.data.len() == self.capacity {
            self.data.pop_front();
        }
        self.data.push_back(item);
    }

    fn snapshot(&self) -> Vec<T> {
        self.data.iter().cloned().collect()
    }

    fn clear(&mut self) {
        self.data.clear();
    }
}

/// Counter summary inside a snapshot.
#[derive(Clone, Debug, Default, Serialize)]
pub struct Tier0Summary {
    #[serde(rename = "consoleErrors")]
    pub console_errors: u64,
    #[serde(rename = "consoleWarnings")]
    pub console_warnings: u64,
    #[serde(rename = "jsErrors")]
    pub js_errors: u64,
    #[serde(rename = "resourceErrors")]
    pub resource_errors: u64,
    #[serde(rename = "unhandledRejections")]
    pub unhandled_rejections: u64,
    #[serde(rename = "failedRequests")]
    pub failed_requests: u64,
    #[serde(rename = "lastError", skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
}

/// Bounded Tier-0 view handed back to the engine and the `net` action.
#[derive(Clone, Debug, Serialize)]
pub struct Tier0Snapshot {
    pub cursor: i64,
    pub summary: Tier0Summary,
    #[serde(rename = "harLite")]
    pub har_lite: Vec<Value>,
    pub network: Vec<Value>,
    pub console: Vec<Value>,
    #[serde(rename = "dialogOpen")]
    pub dialog_open: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dialog: Option<Value>,
}

impl Tier0Snapshot {
    pub fn to_value(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }
}

/// Per-tab event aggregate. Appended by ingest, read by snapshots.
pub struct TabTelemetry {
    cursor: AtomicI64,
    console_errors: AtomicU64,
    console_warnings: AtomicU64,
    js_errors: AtomicU64,
    resource_errors: AtomicU64,
    unhandled_rejections: AtomicU64,
    failed_requests: AtomicU64,
    last_error: Mutex<Option<String>>,
    dialog_open: AtomicBool,
    dialog_last: Mutex<Option<Value>>,
    console: Mutex<BoundedRing<Value>>,
    network: Mutex<BoundedRing<Value>>,
    har: Mutex<BoundedRing<Value>>,
    pending: Mutex<HashMap<String, Value>>,
}

impl Default for TabTelemetry {
    fn default() -> Self {
        Self::new()
    }
}

impl TabTelemetry {
    pub fn new() -> Self {
        Self {
            cursor: AtomicI64::new(now_ms()),
            console_errors: AtomicU64::new(0),
            console_warnings: AtomicU64::new(0),
            js_errors: AtomicU64::new(0),
            resource_errors: AtomicU64::new(0),
            unhandled_rejections: AtomicU64::new(0),
            failed_requests: AtomicU64::new(0),
            last_error: Mutex::new(None),
            dialog_open: AtomicBool::new(false),
            dialog_last: Mutex::new(None),
            console: Mutex::new(BoundedRing::new(100)),
            network: Mutex::new(BoundedRing::new(100)),
            har: Mutex::new(BoundedRing::new(200)),
            pending: Mutex::new(HashMap::new()),
        }
    }

    /// Monotonic: never goes backwards even if the wall clock does.
    fn bump_cursor(&self) -> i64 {
        let now = now_ms();
        let mut prev = self.cursor.load(Ordering::Relaxed);
        loop {
            let next = now.max(prev + 1);
            match self.cursor.compare_exchange_weak(
                prev,
                next,
                Ordering::Relaxed,
                Ordering::Relaxed,
            ) {
                Ok(_) => return next,
                Err(actual) => prev = actual,
            }
        }
    }

    pub fn cursor(&self) -> i64 {
        self.cursor.load(Ordering::Relaxed)
    }

    pub fn dialog_open(&self) -> bool {
        self.dialog_open.load(Ordering::Relaxed)
    }

    pub fn dialog_last(&self) -> Option<Value> {
        self.dialog_last.lock().clone()
    }

    pub fn note_dialog_closed(&self, accepted: bool) {
        if self.dialog_open.swap(false, Ordering::Relaxed) {
            let cursor = self.bump_cursor();
            let mut last = self.dialog_last.lock();
            if let Some(dialog) = last.as_mut() {
                dialog["open"] = json!(false);
                dialog["accepted"] = json!(accepted);
                dialog["closedCursor"] = json!(cursor);
            }
        }
    }

    /// Fold one raw CDP event into the aggregate.
    pub fn ingest(&self, method: &str, params: &Value) {
        let cursor = self.bump_cursor();
        match method {
            "Page.javascriptDialogOpening" => {
                self.dialog_open.store(true, Ordering::Relaxed);
                *self.dialog_last.lock() = Some(json!({
                    "open": true,
                    "type": params.get("type").cloned().unwrap_or(Value::Null),
                    "message": params.get("message").cloned().unwrap_or(Value::Null),
                    "url": params.get("url").cloned().unwrap_or(Value::Null),
                    "cursor": cursor,
                }));
            }
            "Page.javascriptDialogClosed" => {
                let accepted = params
                    .get("result")
                    .and_then(Value::as_bool)
                    .unwrap_or(false);
                self.dialog_open.store(false, Ordering::Relaxed);
                let mut last = self.dialog_last.lock();
                if let Some(dialog) = last.as_mut() {
                    dialog["open"] = json!(false);
                    dialog["accepted"] = json!(accepted);
                    dialog["closedCursor"] = json!(cursor);
                }
            }
            "Runtime.consoleAPICalled" => {
                let level = params.get("type").and_then(Value::as_str).unwrap_or("log");
                let text = console_args_text(params);
                match level {
                    "error" | "assert" => {
                        self.console_errors.fetch_add(1, Ordering::Relaxed);
                        *self.last_error.lock() = Some(text.clone());
                    }
                    "warning" => {
                        self.console_warnings.fetch_add(1, Ordering::Relaxed);
                    }
                    _ => {}
                }
                self.console.lock().push(json!({
                    "level": level,
                    "text": text,
                    "cursor": cursor,
                }));
            }
            "Runtime.exceptionThrown" => {
                let detail = params.get("exceptionDetails");
                let text = detail
                    .and_then(|d| d.get("exception"))
                    .and_then(|e| e.get("description"))
                    .and_then(Value::as_str)
                    .or_else(|| detail.and_then(|d| d.get("text")).and_then(Value::as_str))
                    .unwrap_or("uncaught exception")
                    .to_string();
                let rejection = text.contains("Unhandled") && text.contains("rejection");
                if rejection {
                    self.unhandled_rejections.fetch_add(1, Ordering::Relaxed);
                } else {
                    self.js_errors.fetch_add(1, Ordering::Relaxed);
                }
                *self.last_error.lock() = Some(text.clone());
                self.console.lock().push(json!({
                    "level": "exception",
                    "text": text,
                    "cursor": cursor,
                }));
            }
            "Log.entryAdded" => {
                let entry = params.get("entry");
                let level = entry
                    .and_then(|e| e.get("level"))
                    .and_then(Value::as_str)
                    .unwrap_or("info");
                if level == "error" {
                    self.resource_errors.fetch_add(1, Ordering::Relaxed);
                    if let Some(text) = entry.and_then(|e| e.get("text")).and_then(Value::as_str) {
                        *self.last_error.lock() = Some(text.to_string());
                    }
                }
            }
            "Network.requestWillBeSent" => {
                if let Some(request_id) = params.get("requestId").and_then(Value::as_str) {
                    let url = params
                        .get("request")
                        .and_then(|r| r.get("url"))
                        .cloned()
                        .unwrap_or(Value::Null);
                    self.pending.lock().insert(
                        request_id.to_string(),
                        json!({
                            "url": url,
                            "type": params.get("type").cloned().unwrap_or(Value::Null),
                            "startCursor": cursor,
                        }),
                    );
                }
            }
            "Network.responseReceived" => {
                if let Some(request_id) = params.get("requestId").and_then(Value::as_str) {
                    let status = params
                        .get("response")
                        .and_then(|r| r.get("status"))
                        .cloned()
                        .unwrap_or(Value::Null);
                    if let Some(entry) = self.pending.lock().get_mut(request_id) {
                        entry["status"] = status;
                    }
                }
            }
            "Network.loadingFinished" => {
                if let Some(request_id) = params.get("requestId").and_then(Value::as_str) {
                    if let Some(entry) = self.pending.lock().remove(request_id) {
                        self.finish_request(entry, params, cursor, true);
                    }
                }
            }
            "Network.loadingFailed" => {
                if let Some(request_id) = params.get("requestId").and_then(Value::as_str) {
                    self.failed_requests.fetch_add(1, Ordering::Relaxed);
                    let entry = self
                        .pending
                        .lock()
                        .remove(request_id)
                        .unwrap_or_else(|| json!({"url": Value::Null, "startCursor": cursor}));
                    let error_text = params
                        .get("errorText")
                        .cloned()
                        .unwrap_or(Value::String("loading failed".into()));
                    self.network.lock().push(json!({
                        "url": entry.get("url").cloned().unwrap_or(Value::Null),
                        "status": entry.get("status").cloned().unwrap_or(Value::Null),
                        "errorText": error_text,
                        "cursor": cursor,
                    }));
                    self.finish_request(entry, params, cursor, false);
                }
            }
            _ => {}
        }
    }

    fn finish_request(&self, entry: Value, params: &Value, cursor: i64, ok: bool) {
        let start = entry
            .get("startCursor")
            .and_then(Value::as_i64)
            .unwrap_or(cursor);
        let mut har = json!({
            "url": entry.get("url").cloned().unwrap_or(Value::Null),
            "type": entry.get("type").cloned().unwrap_or(Value::Null),
            "status": entry.get("status").cloned().unwrap_or(Value::Null),
            "durationMs": (cursor - start).max(0),
            "ok": ok,
            "cursor": cursor,
        });
        if let Some(bytes) = params.get("encodedDataLength").and_then(Value::as_f64) {
            har["encodedDataLength"] = json!(bytes as i64);
        }
        self.har.lock().push(har);
    }

    pub fn clear_har(&self) {
        self.har.lock().clear();
    }

    /// Bounded snapshot. With `since`, counters are recomputed from the
    /// buffered events inside the window so callers see a true delta;
    /// without it they are process-lifetime totals.
    pub fn snapshot(&self, since: Option<i64>, offset: usize, limit: usize) -> Tier0Snapshot {
        let in_window = |item: &Value| -> bool {
            match since {
                None => true,
                Some(since) => item
                    .get("cursor")
                    .and_then(Value::as_i64)
                    .map(|c| c >= since)
                    .unwrap_or(true),
            }
        };

        let console: Vec<Value> = self
            .console
            .lock()
            .snapshot()
            .into_iter()
            .filter(in_window)
            .collect();
        let network: Vec<Value> = self
            .network
            .lock()
            .snapshot()
            .into_iter()
            .filter(in_window)
            .collect();
        let har: Vec<Value> = self
            .har
            .lock()
            .snapshot()
            .into_iter()
            .filter(in_window)
            .collect();

        let summary = if since.is_some() {
            let mut summary = Tier0Summary::default();
            for item in &console {
                match item.get("level").and_then(Value::as_str) {
                    Some("error" | "assert") => summary.console_errors += 1,
                    Some("warning") => summary.console_warnings += 1,
                    Some("exception") => summary.js_errors += 1,
                    _ => {}
                }
                if matches!(
                    item.get("level").and_then(Value::as_str),
                    Some("error" | "assert" | "exception")
                ) {
                    if let Some(text) = item.get("text").and_then(Value::as_str) {
                        summary.last_error = Some(text.to_string());
                    }
                }
            }
            summary.failed_requests = network.len() as u64;
            summary
        } else {
            Tier0Summary {
                console_errors: self.console_errors.load(Ordering::Relaxed),
                console_warnings: self.console_warnings.load(Ordering::Relaxed),
                js_errors: self.js_errors.load(Ordering::Relaxed),
                resource_errors: self.resource_errors.load(Ordering::Relaxed),
                unhandled_rejections: self.unhandled_rejections.load(Ordering::Relaxed),
                failed_requests: self.failed_requests.load(Ordering::Relaxed),
                last_error: self.last_error.lock().clone(),
            }
        };

        let slice = |items: Vec<Value>| -> Vec<Value> {
            let skipped: Vec<Value> = items.into_iter().skip(offset).collect();
            if limit == 0 {
                skipped
            } else {
                skipped.into_iter().take(limit).collect()
            }
        };

        Tier0Snapshot {
            cursor: self.cursor(),
            summary,
            har_lite: slice(har),
            network: slice(network),
            console: slice(console),
            dialog_open: self.dialog_open(),
            dialog: self.dialog_last(),
        }
    }
}

fn console_args_text(params: &Value) -> String {
    let args = params.get("args").and_then(Value::as_array);
    let Some(args) = args else {
        return String::new();
    };
    let mut parts = Vec::new();
    for arg in args.iter().take(6) {
        if let Some(value) = arg.get("value") {
            match value {
                Value::String(s) => parts.push(s.clone()),
                other => parts.push(other.to_string()),
            }
        } else if let Some(desc) = arg.get("description").and_then(Value::as_str) {
            parts.push(desc.to_string());
        }
    }
    let text = parts.join(" ");
    if text.len() > 500 {
        format!("{}…", &text[..500])
    } else {
        text
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cursor_only_increases() {
        let t = TabTelemetry::new();
        let a = t.bump_cursor();
        let b = t.bump_cursor();
        let c = t.bump_cursor();
        assert!(a < b && b < c);
    }

    #[test]
    fn dialog_lifecycle_tracks_open_state() {
        let t = TabTelemetry::new();
        t.ingest(
            "Page.javascriptDialogOpening",
            &json!({"type": "confirm", "message": "sure?", "url": "https://a.test/"}),
        );
        assert!(t.dialog_open());
        let dialog = t.dialog_last().unwrap();
        assert_eq!(dialog["message"], json!("sure?"));

        t.ingest("Page.javascriptDialogClosed", &json!({"result": true}));
        assert!(!t.dialog_open());
        assert_eq!(t.dialog_last().unwrap()["accepted"], json!(true));
    }

    #[test]
    fn console_errors_count_and_set_last_error() {
        let t = TabTelemetry::new();
        t.ingest(
            "Runtime.consoleAPICalled",
            &json!({"type": "error", "args": [{"value": "boom"}]}),
        );
        let snap = t.snapshot(None, 0, 0);
        assert_eq!(snap.summary.console_errors, 1);
        assert_eq!(snap.summary.last_error.as_deref(), Some("boom"));
    }

    #[test]
    fn since_filter_excludes_older_events() {
        let t = TabTelemetry::new();
        t.ingest(
            "Runtime.consoleAPICalled",
            &json!({"type": "error", "args": [{"value": "early"}]}),
        );
        let mid = t.cursor() + 1;
        t.ingest(
            "Runtime.consoleAPICalled",
            &json!({"type": "error", "args": [{"value": "late"}]}),
        );

        let snap = t.snapshot(Some(mid), 0, 0);
        assert_eq!(snap.summary.console_errors, 1);
        assert_eq!(snap.console.len(), 1);
        assert_eq!(snap.console[0]["text"], json!("late"));
        // Full snapshot still carries both.
        assert_eq!(t.snapshot(None, 0, 0).console.len(), 2);
    }

    #[test]
    fn har_lite_tracks_request_lifecycle() {
        let t = TabTelemetry::new();
        t.ingest(
            "Network.requestWillBeSent",
            &json!({"requestId": "r1", "request": {"url": "https://a.test/x.js"}, "type": "Script"}),
        );
        t.ingest(
            "Network.responseReceived",
            &json!({"requestId": "r1", "response": {"status": 200}}),
        );
        t.ingest(
            "Network.loadingFinished",
            &json!({"requestId": "r1", "encodedDataLength": 1234.0}),
        );
        let snap = t.snapshot(None, 0, 0);
        assert_eq!(snap.har_lite.len(), 1);
        let entry = &snap.har_lite[0];
        assert_eq!(entry["status"], json!(200));
        assert_eq!(entry["ok"], json!(true));
        assert_eq!(entry["encodedDataLength"], json!(1234));
    }

    #[test]
    fn failed_requests_land_in_network_buffer() {
        let t = TabTelemetry::new();
        t.ingest(
            "Network.requestWillBeSent",
            &json!({"requestId": "r2", "request": {"url": "https://a.test/api"}}),
        );
        t.ingest(
            "Network.loadingFailed",
            &json!({"requestId": "r2", "errorText": "net::ERR_FAILED"}),
        );
        let snap = t.snapshot(None, 0, 0);
        assert_eq!(snap.summary.failed_requests, 1);
        assert_eq!(snap.network.len(), 1);
        assert_eq!(snap.network[0]["errorText"], json!("net::ERR_FAILED"));
    }
}

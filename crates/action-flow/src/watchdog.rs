//! Per-step watchdog.
//!
//! A background task that, on expiry, aborts the shared CDP transport so
//! the in-flight command resolves deterministically. Aborting (rather
//! than closing) matters: a graceful close can hang on a bricked peer,
//! which is exactly the state the watchdog exists to escape.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use cdp_adapter::PageSession;
use serde_json::{Map, Value};
use tokio_util::sync::CancellationToken;

pub struct Watchdog {
    pub timeout_s: f64,
    fired: Arc<AtomicBool>,
    cancel: CancellationToken,
}

impl Watchdog {
    pub fn start(session: Arc<dyn PageSession>, timeout_s: f64) -> Option<Self> {
        if timeout_s <= 0.0 {
            return None;
        }
        let fired = Arc::new(AtomicBool::new(false));
        let cancel = CancellationToken::new();

        let task_fired = fired.clone();
        let task_cancel = cancel.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = task_cancel.cancelled() => {}
                _ = tokio::time::sleep(Duration::from_secs_f64(timeout_s)) => {
                    task_fired.store(true, Ordering::Relaxed);
                    session.abort();
                }
            }
        });

        Some(Self {
            timeout_s,
            fired,
            cancel,
        })
    }

    pub fn fired(&self) -> bool {
        self.fired.load(Ordering::Relaxed)
    }

    pub fn stop(&self) {
        self.cancel.cancel();
    }

    pub fn timeout_message(&self) -> String {
        format!("Action timed out after {:.1}s", self.timeout_s)
    }
}

impl Drop for Watchdog {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

/// Watchdog budget for one step: the configured action timeout, widened
/// when the step itself declares a longer tool-level timeout (plus slack),
/// clamped to [1s, 300s].
pub fn step_timeout_seconds(action_timeout_s: f64, args: &Map<String, Value>) -> f64 {
    let mut t = action_timeout_s;
    if let Some(raw) = args.get("timeout") {
        if !raw.is_boolean() {
            if let Some(step_timeout) = raw.as_f64().or_else(|| {
                raw.as_str().and_then(|s| s.trim().parse().ok())
            }) {
                t = t.max(step_timeout + 2.0);
            }
        }
    }
    t.clamp(1.0, 300.0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use cdp_adapter::StubSession;
    use serde_json::json;

    #[tokio::test]
    async fn watchdog_aborts_the_session_on_expiry() {
        let stub = Arc::new(StubSession::new("t1", "about:blank"));
        let session: Arc<dyn PageSession> = stub.clone();
        let wd = Watchdog::start(session, 0.05).unwrap();
        tokio::time::sleep(Duration::from_millis(120)).await;
        assert!(wd.fired());
        assert!(stub.was_aborted());
    }

    #[tokio::test]
    async fn stopped_watchdog_never_fires() {
        let stub = Arc::new(StubSession::new("t1", "about:blank"));
        let session: Arc<dyn PageSession> = stub.clone();
        let wd = Watchdog::start(session, 0.05).unwrap();
        wd.stop();
        tokio::time::sleep(Duration::from_millis(120)).await;
        assert!(!wd.fired());
        assert!(!stub.was_aborted());
    }

    #[test]
    fn step_timeout_respects_declared_tool_timeout() {
        let args = json!({"timeout": 45}).as_object().cloned().unwrap();
        assert_eq!(step_timeout_seconds(30.0, &args), 47.0);
        // Caps apply.
        let args = json!({"timeout": 500}).as_object().cloned().unwrap();
        assert_eq!(step_timeout_seconds(30.0, &args), 300.0);
        let args = json!({}).as_object().cloned().unwrap();
        assert_eq!(step_timeout_seconds(0.2, &args), 1.0);
    }
}

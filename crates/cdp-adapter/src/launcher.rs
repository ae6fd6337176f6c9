//! Chromium process lifecycle: launch, readiness probing, recovery.

use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Value};
use tokio::process::{Child, Command};
use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::config::{ensure_profile_dir, BrowserConfig, BrowserMode};
use crate::error::{AdapterError, AdapterErrorKind};
use crate::targets;

/// Outcome of an `ensure_running` call.
#[derive(Clone, Debug)]
pub struct LaunchStatus {
    pub running: bool,
    pub launched: bool,
    pub port: u16,
    pub message: Option<String>,
}

/// Owns at most one Chromium child process (launch mode). In attach and
/// extension modes it only probes.
pub struct Launcher {
    config: Arc<BrowserConfig>,
    child: Mutex<Option<Child>>,
    active_port: AtomicU16,
}

impl Launcher {
    pub fn new(config: Arc<BrowserConfig>) -> Self {
        let port = config.cdp_port;
        Self {
            config,
            child: Mutex::new(None),
            active_port: AtomicU16::new(port),
        }
    }

    /// Port the browser actually listens on (after any fallback).
    pub fn active_port(&self) -> u16 {
        self.active_port.load(Ordering::Relaxed)
    }

    fn config_on_port(&self, port: u16) -> BrowserConfig {
        let mut cfg = (*self.config).clone();
        cfg.cdp_port = port;
        cfg
    }

    /// Whether the CDP HTTP endpoint answers within `timeout`.
    pub async fn cdp_ready(&self, timeout: Duration) -> bool {
        let cfg = self.config_on_port(self.active_port());
        targets::version(&cfg, timeout).await.is_ok()
    }

    /// Make sure a browser is reachable for the configured mode, spawning
    /// one in launch mode when needed.
    pub async fn ensure_running(&self) -> Result<LaunchStatus, AdapterError> {
        match self.config.mode {
            BrowserMode::Extension => Ok(LaunchStatus {
                running: false,
                launched: false,
                port: self.active_port(),
                message: Some("extension mode: gateway owns the browser".into()),
            }),
            BrowserMode::Attach => {
                let port = self.active_port();
                if self.cdp_ready(Duration::from_millis(800)).await {
                    Ok(LaunchStatus {
                        running: true,
                        launched: false,
                        port,
                        message: None,
                    })
                } else {
                    Err(AdapterError::new(AdapterErrorKind::NotReachable)
                        .with_hint(format!("no CDP endpoint on port {port} (mode=attach)"))
                        .with_data(json!({"cdpPort": port})))
                }
            }
            BrowserMode::Launch => self.ensure_launched().await,
        }
    }

    async fn ensure_launched(&self) -> Result<LaunchStatus, AdapterError> {
        if self.cdp_ready(Duration::from_millis(600)).await {
            return Ok(LaunchStatus {
                running: true,
                launched: false,
                port: self.active_port(),
                message: None,
            });
        }

        let binary = self.config.binary.clone().ok_or_else(|| {
            AdapterError::new(AdapterErrorKind::Internal)
                .with_hint("no Chromium executable found")
                .with_data(json!({
                    "hint": "Set MCP_BROWSER_BINARY to the full path of chrome/chromium"
                }))
        })?;

        ensure_profile_dir(&self.config.profile_dir).map_err(|err| {
            AdapterError::new(AdapterErrorKind::Internal)
                .with_hint(format!("failed to create profile dir: {err}"))
        })?;

        let mut last_err: Option<AdapterError> = None;
        for port in self.config.port_candidates() {
            match self.spawn_on_port(&binary, port).await {
                Ok(status) => return Ok(status),
                Err(err) => {
                    warn!(target: "cdp.launcher", port, error = %err, "launch attempt failed");
                    last_err = Some(err);
                }
            }
        }

        Err(last_err.unwrap_or_else(|| {
            AdapterError::new(AdapterErrorKind::Internal).with_hint("no launch ports to try")
        }))
    }

    async fn spawn_on_port(
        &self,
        binary: &std::path::Path,
        port: u16,
    ) -> Result<LaunchStatus, AdapterError> {
        let args = self.config.launch_args(port);
        let child = Command::new(binary)
            .args(&args)
            .stdout(std::process::Stdio::null())
            .stderr(std::process::Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(|err| {
                AdapterError::new(AdapterErrorKind::Internal)
                    .with_hint(format!("failed to launch chromium: {err}"))
            })?;

        {
            let mut guard = self.child.lock().await;
            if let Some(mut old) = guard.take() {
                let _ = old.start_kill();
            }
            *guard = Some(child);
        }
        self.active_port.store(port, Ordering::Relaxed);

        // Poll readiness; Chromium startup is the slow path here.
        let cfg = self.config_on_port(port);
        let deadline = tokio::time::Instant::now() + Duration::from_secs(20);
        while tokio::time::Instant::now() < deadline {
            if targets::version(&cfg, Duration::from_millis(500)).await.is_ok() {
                info!(target: "cdp.launcher", port, "chromium launched");
                return Ok(LaunchStatus {
                    running: true,
                    launched: true,
                    port,
                    message: None,
                });
            }
            tokio::time::sleep(Duration::from_millis(250)).await;
        }

        {
            let mut guard = self.child.lock().await;
            if let Some(mut child) = guard.take() {
                let _ = child.start_kill();
            }
        }
        Err(AdapterError::new(AdapterErrorKind::NotReachable)
            .with_hint(format!("chromium did not open CDP port {port} in time"))
            .retriable(true))
    }

    /// Recover the browser. Soft: re-ensure reachability (relaunch only if
    /// the endpoint is gone). Hard: kill the owned child first.
    pub async fn recover(&self, hard: bool, timeout: Duration) -> Result<Value, AdapterError> {
        if hard {
            let mut guard = self.child.lock().await;
            if let Some(mut child) = guard.take() {
                if let Err(err) = child.kill().await {
                    warn!(target: "cdp.launcher", error = %err, "failed to kill chromium child");
                }
            }
        }

        let ensure = tokio::time::timeout(timeout, self.ensure_running()).await;
        match ensure {
            Ok(Ok(status)) => Ok(json!({
                "ok": true,
                "hard": hard,
                "running": status.running,
                "launched": status.launched,
                "cdpPort": status.port,
            })),
            Ok(Err(err)) => Err(err),
            Err(_) => Err(AdapterError::new(AdapterErrorKind::Timeout)
                .with_hint(format!("recovery timed out after {:.1}s", timeout.as_secs_f64()))),
        }
    }

    /// Kill the owned child, if any.
    pub async fn stop(&self) {
        let mut guard = self.child.lock().await;
        if let Some(mut child) = guard.take() {
            if let Err(err) = child.kill().await {
                warn!(target: "cdp.launcher", error = %err, "failed to stop chromium child");
            }
        }
    }

    /// Whether this launcher owns a live child process.
    pub async fn owns_child(&self) -> bool {
        self.child.lock().await.is_some()
    }
}

//! Raw CDP WebSocket transport.
//!
//! One background loop owns the socket. Callers submit commands through an
//! mpsc channel and wait on a oneshot; events are forwarded into a bounded
//! channel the session drains at safe points. `abort()` is the watchdog's
//! escape hatch: it cancels the loop outright, failing every in-flight
//! command deterministically instead of waiting on a peer that may never
//! answer again.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use parking_lot::Mutex;
use serde_json::{json, Value};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::{AdapterError, AdapterErrorKind};

/// Raw event as it came off the wire.
#[derive(Clone, Debug)]
pub struct TransportEvent {
    pub method: String,
    pub params: Value,
    pub session_id: Option<String>,
}

struct ControlMessage {
    method: String,
    params: Value,
    session_id: Option<String>,
    responder: oneshot::Sender<Result<Value, AdapterError>>,
}

pub struct CdpTransport {
    command_tx: mpsc::Sender<ControlMessage>,
    events_rx: Mutex<mpsc::Receiver<TransportEvent>>,
    alive: Arc<AtomicBool>,
    cancel: CancellationToken,
    loop_task: JoinHandle<()>,
    default_deadline: Duration,
}

impl CdpTransport {
    pub async fn connect(ws_url: &str, default_deadline: Duration) -> Result<Self, AdapterError> {
        let (stream, _resp) = tokio_tungstenite::connect_async(ws_url)
            .await
            .map_err(|err| {
                AdapterError::new(AdapterErrorKind::NotReachable)
                    .with_hint(format!("websocket handshake failed: {err}"))
                    .retriable(true)
            })?;

        let (command_tx, command_rx) = mpsc::channel(128);
        let (events_tx, events_rx) = mpsc::channel(512);
        let alive = Arc::new(AtomicBool::new(true));
        let cancel = CancellationToken::new();

        let loop_alive = alive.clone();
        let loop_cancel = cancel.clone();
        let loop_task = tokio::spawn(async move {
            run_loop(stream, command_rx, events_tx, loop_cancel).await;
            loop_alive.store(false, Ordering::Relaxed);
        });

        debug!(target: "cdp.transport", url = %ws_url, "cdp connection established");

        Ok(Self {
            command_tx,
            events_rx: Mutex::new(events_rx),
            alive,
            cancel,
            loop_task,
            default_deadline,
        })
    }

    pub fn is_alive(&self) -> bool {
        self.alive.load(Ordering::Relaxed)
    }

    /// Break the transport. In-flight commands fail with `CdpIo`; the loop
    /// exits without attempting a graceful close (which can hang on a
    /// bricked peer).
    pub fn abort(&self) {
        if self.is_alive() {
            warn!(target: "cdp.transport", "transport aborted");
        }
        self.cancel.cancel();
        self.alive.store(false, Ordering::Relaxed);
    }

    pub async fn send(
        &self,
        method: &str,
        params: Value,
        session_id: Option<&str>,
    ) -> Result<Value, AdapterError> {
        self.send_with_deadline(method, params, session_id, self.default_deadline)
            .await
    }

    pub async fn send_with_deadline(
        &self,
        method: &str,
        params: Value,
        session_id: Option<&str>,
        deadline: Duration,
    ) -> Result<Value, AdapterError> {
        if !self.is_alive() {
            return Err(AdapterError::new(AdapterErrorKind::NotReachable)
                .with_hint("cdp connection is closed"));
        }

        let (resp_tx, resp_rx) = oneshot::channel();
        let message = ControlMessage {
            method: method.to_string(),
            params,
            session_id: session_id.map(str::to_string),
            responder: resp_tx,
        };

        self.command_tx.send(message).await.map_err(|_| {
            AdapterError::new(AdapterErrorKind::CdpIo).with_hint("command channel closed")
        })?;

        match tokio::time::timeout(deadline, resp_rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(AdapterError::new(AdapterErrorKind::CdpIo)
                .with_hint("command response channel closed")),
            Err(_) => Err(AdapterError::new(AdapterErrorKind::Timeout)
                .with_hint(format!("cdp response timed out: {method}"))
                .retriable(true)),
        }
    }

    /// Non-blocking: pull up to `max` buffered events off the channel.
    pub fn drain_events(&self, max: usize, into: &mut Vec<TransportEvent>) -> usize {
        let mut rx = self.events_rx.lock();
        let mut pulled = 0;
        while pulled < max {
            match rx.try_recv() {
                Ok(event) => {
                    into.push(event);
                    pulled += 1;
                }
                Err(_) => break,
            }
        }
        pulled
    }
}

impl Drop for CdpTransport {
    fn drop(&mut self) {
        self.cancel.cancel();
        self.loop_task.abort();
    }
}

type WsStream =
    tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>;

async fn run_loop(
    mut stream: WsStream,
    mut command_rx: mpsc::Receiver<ControlMessage>,
    events_tx: mpsc::Sender<TransportEvent>,
    cancel: CancellationToken,
) {
    let mut inflight: HashMap<u64, oneshot::Sender<Result<Value, AdapterError>>> = HashMap::new();
    let next_id = AtomicU64::new(1);

    let fail_inflight = |inflight: &mut HashMap<u64, _>, err: AdapterError| {
        for (_, sender) in inflight.drain() {
            let sender: oneshot::Sender<Result<Value, AdapterError>> = sender;
            let _ = sender.send(Err(err.clone()));
        }
    };

    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                fail_inflight(
                    &mut inflight,
                    AdapterError::new(AdapterErrorKind::CdpIo)
                        .with_hint("cdp connection aborted")
                        .retriable(true),
                );
                return;
            }
            cmd = command_rx.recv() => {
                let Some(cmd) = cmd else {
                    fail_inflight(
                        &mut inflight,
                        AdapterError::new(AdapterErrorKind::CdpIo).with_hint("command channel closed"),
                    );
                    return;
                };
                let id = next_id.fetch_add(1, Ordering::Relaxed);
                let mut frame = json!({"id": id, "method": cmd.method, "params": cmd.params});
                if let Some(session) = &cmd.session_id {
                    frame["sessionId"] = json!(session);
                }
                match stream.send(Message::Text(frame.to_string())).await {
                    Ok(()) => {
                        inflight.insert(id, cmd.responder);
                    }
                    Err(err) => {
                        let adapter_err = AdapterError::new(AdapterErrorKind::CdpIo)
                            .with_hint(format!("websocket send failed: {err}"))
                            .retriable(true);
                        let _ = cmd.responder.send(Err(adapter_err.clone()));
                        fail_inflight(&mut inflight, adapter_err);
                        return;
                    }
                }
            }
            message = stream.next() => {
                match message {
                    Some(Ok(Message::Text(text))) => {
                        handle_frame(&text, &mut inflight, &events_tx);
                    }
                    Some(Ok(Message::Ping(_) | Message::Pong(_) | Message::Binary(_) | Message::Frame(_))) => {}
                    Some(Ok(Message::Close(_))) | None => {
                        fail_inflight(
                            &mut inflight,
                            AdapterError::new(AdapterErrorKind::CdpIo)
                                .with_hint("websocket closed")
                                .retriable(true),
                        );
                        return;
                    }
                    Some(Err(err)) => {
                        fail_inflight(
                            &mut inflight,
                            AdapterError::new(AdapterErrorKind::CdpIo)
                                .with_hint(format!("websocket error: {err}"))
                                .retriable(true),
                        );
                        return;
                    }
                }
            }
        }
    }
}

fn handle_frame(
    text: &str,
    inflight: &mut HashMap<u64, oneshot::Sender<Result<Value, AdapterError>>>,
    events_tx: &mpsc::Sender<TransportEvent>,
) {
    let Ok(frame) = serde_json::from_str::<Value>(text) else {
        warn!(target: "cdp.transport", "undecodable cdp frame");
        return;
    };

    if let Some(id) = frame.get("id").and_then(Value::as_u64) {
        let Some(sender) = inflight.remove(&id) else {
            return;
        };
        let result = if let Some(error) = frame.get("error") {
            let code = error.get("code").and_then(Value::as_i64).unwrap_or(0);
            let message = error
                .get("message")
                .and_then(Value::as_str)
                .unwrap_or("unknown cdp error");
            Err(AdapterError::new(AdapterErrorKind::CdpIo)
                .with_hint(format!("cdp error {code}: {message}"))
                .retriable(code >= 500))
        } else {
            Ok(frame.get("result").cloned().unwrap_or(Value::Null))
        };
        let _ = sender.send(result);
        return;
    }

    if let Some(method) = frame.get("method").and_then(Value::as_str) {
        let event = TransportEvent {
            method: method.to_string(),
            params: frame.get("params").cloned().unwrap_or(Value::Null),
            session_id: frame
                .get("sessionId")
                .and_then(Value::as_str)
                .map(str::to_string),
        };
        // Event buffer is bounded; dropping under pressure is acceptable
        // for Tier-0 aggregation (counters re-sync on the next snapshot).
        if events_tx.try_send(event).is_err() {
            debug!(target: "cdp.transport", method, "event buffer full, dropping");
        }
    }
}

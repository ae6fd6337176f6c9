//! Chrome DevTools Protocol adapter.
//!
//! This crate owns everything that touches the browser process: static
//! configuration from the `MCP_*` environment, executable discovery, the
//! launcher (launch/attach/extension), the raw CDP WebSocket transport,
//! and the per-tab page session the higher layers drive.
//!
//! The transport deliberately speaks raw CDP over its own WebSocket
//! instead of a managed client: the per-step watchdog needs a hard
//! `abort()` that unwedges a bricked peer, and a managed client's
//! graceful `close()` can hang exactly when it is needed most.

pub mod config;
pub mod error;
pub mod launcher;
pub mod session;
pub mod targets;
pub mod transport;

pub use config::{BrowserConfig, BrowserMode, Toolset};
pub use error::{AdapterError, AdapterErrorKind};
pub use launcher::{Launcher, LaunchStatus};
pub use session::{CdpSession, PageSession, StubSession};
pub use targets::TargetInfo;
pub use transport::{CdpTransport, TransportEvent};

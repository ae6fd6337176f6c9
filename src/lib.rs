//! browsermcp-server: an AI-agent-facing browser automation server.
//!
//! An external agent speaks a JSON-RPC tool protocol over stdio and
//! drives a Chromium-family browser via the Chrome DevTools Protocol.
//! The heavy lifting lives in the workspace crates; this crate wires
//! them together, owns the stdio loop and the tool catalog, and hosts
//! the concrete tool handlers.

pub mod app_context;
pub mod server;
pub mod tools;

pub use app_context::AppContext;

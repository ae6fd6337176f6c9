//! Adapter error surface.

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// High-level error categories surfaced by the adapter.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Error, Serialize, Deserialize)]
pub enum AdapterErrorKind {
    #[error("cdp response timed out")]
    Timeout,
    #[error("cdp i/o failure")]
    CdpIo,
    #[error("cdp endpoint not reachable")]
    NotReachable,
    #[error("blocking js dialog is open")]
    DialogOpen,
    #[error("target not found")]
    TargetNotFound,
    #[error("internal error")]
    Internal,
}

/// Enriched error metadata passed back to higher layers.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AdapterError {
    pub kind: AdapterErrorKind,
    pub hint: Option<String>,
    pub retriable: bool,
    pub data: Option<serde_json::Value>,
}

impl AdapterError {
    pub fn new(kind: AdapterErrorKind) -> Self {
        Self {
            kind,
            hint: None,
            retriable: false,
            data: None,
        }
    }

    pub fn with_hint(mut self, hint: impl Into<String>) -> Self {
        self.hint = Some(hint.into());
        self
    }

    pub fn retriable(mut self, flag: bool) -> Self {
        self.retriable = flag;
        self
    }

    pub fn with_data(mut self, data: serde_json::Value) -> Self {
        self.data = Some(data);
        self
    }

    /// Whether this error means the transport itself is gone (a brick).
    pub fn is_brick(&self) -> bool {
        matches!(
            self.kind,
            AdapterErrorKind::Timeout | AdapterErrorKind::CdpIo | AdapterErrorKind::NotReachable
        )
    }
}

impl fmt::Display for AdapterError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.kind)?;
        if let Some(hint) = &self.hint {
            write!(f, ": {hint}")?;
        }
        Ok(())
    }
}

impl std::error::Error for AdapterError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_includes_hint() {
        let err = AdapterError::new(AdapterErrorKind::CdpIo).with_hint("websocket closed");
        assert_eq!(err.to_string(), "cdp i/o failure: websocket closed");
        assert!(err.is_brick());
    }

    #[test]
    fn dialog_open_is_not_a_brick() {
        assert!(!AdapterError::new(AdapterErrorKind::DialogOpen).is_brick());
    }
}

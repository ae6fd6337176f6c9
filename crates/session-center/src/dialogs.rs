//! Auto-dialog directives and dialog-close helpers.

use std::time::{Duration, Instant};

use cdp_adapter::AdapterError;
use serde::{Deserialize, Serialize};

/// Per-tab handling for JS dialogs while a batch executes.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AutoDialogMode {
    Dismiss,
    Accept,
}

impl AutoDialogMode {
    pub fn accept(&self) -> bool {
        matches!(self, AutoDialogMode::Accept)
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "dismiss" => Some(AutoDialogMode::Dismiss),
            "accept" => Some(AutoDialogMode::Accept),
            _ => None,
        }
    }
}

/// Directive with TTL; expired entries behave as absent.
#[derive(Clone, Debug)]
pub struct AutoDialogDirective {
    pub mode: AutoDialogMode,
    expires_at: Instant,
}

impl AutoDialogDirective {
    pub fn new(mode: AutoDialogMode, ttl: Duration) -> Self {
        Self {
            mode,
            expires_at: Instant::now() + ttl,
        }
    }

    pub fn expired(&self) -> bool {
        Instant::now() >= self.expires_at
    }
}

/// Some browsers answer `Page.handleJavaScriptDialog` with a "no dialog"
/// error even though one was visibly open a moment ago. Callers treat this
/// as closed only after a corroborating Tier-0 poll.
pub fn is_no_dialog_error(err: &AdapterError) -> bool {
    let text = err.to_string().to_ascii_lowercase();
    text.contains("no dialog")
        || text.contains("dialog is not showing")
        || text.contains("no javascript dialog")
}

#[cfg(test)]
mod tests {
    use super::*;
    use cdp_adapter::AdapterErrorKind;

    #[test]
    fn mode_parse() {
        assert_eq!(AutoDialogMode::parse("accept"), Some(AutoDialogMode::Accept));
        assert_eq!(AutoDialogMode::parse("DISMISS"), Some(AutoDialogMode::Dismiss));
        assert_eq!(AutoDialogMode::parse("auto"), None);
        assert!(AutoDialogMode::Accept.accept());
        assert!(!AutoDialogMode::Dismiss.accept());
    }

    #[test]
    fn no_dialog_errors_match() {
        let err = AdapterError::new(AdapterErrorKind::CdpIo)
            .with_hint("cdp error -32602: No dialog is showing");
        assert!(is_no_dialog_error(&err));
        let err = AdapterError::new(AdapterErrorKind::CdpIo).with_hint("websocket closed");
        assert!(!is_no_dialog_error(&err));
    }
}

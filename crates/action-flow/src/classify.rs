//! Error-string classification. The engine sees errors after they have
//! been folded into text, so classification is lexical and deliberately
//! matches the transport's known failure phrasings.

/// Transport/endpoint unresponsive: only recovery can make progress.
pub fn is_cdp_brick(error: Option<&str>) -> bool {
    let Some(error) = error else {
        return false;
    };
    let m = error.to_ascii_lowercase();
    m.contains("cdp response timed out")
        || m.contains("action timed out")
        || m.contains("cdp endpoint not reachable")
        || m.contains("cdp not reachable")
        || (m.contains("websocket")
            && (m.contains("closed") || m.contains("handshake") || m.contains("connection")))
        || m.contains("connection refused")
        || m.contains("broken pipe")
        || m.contains("connection aborted")
}

/// A blocking JS dialog stands between us and the page.
pub fn is_dialog_block(error: Option<&str>) -> bool {
    let Some(error) = error else {
        return false;
    };
    let m = error.to_ascii_lowercase();
    if m.contains("blocking js dialog") {
        return true;
    }
    m.contains("js dialog")
        && (m.contains("blocked") || m.contains("handle it via dialog") || m.contains("dialog() then retry"))
}

/// Missing element / overlay intercept / stale handle: worth one
/// overlay-dismiss retry.
pub fn is_ui_transient(error: Option<&str>) -> bool {
    let Some(error) = error else {
        return false;
    };
    let m = error.to_ascii_lowercase();
    m.contains("element not found")
        || m.contains("selector not found")
        || m.contains("missing element bounds")
        || m.contains("no matching accessibility node found")
        || m.contains("click evaluation returned null")
        || m.contains("index out of range")
        || m.contains("no candidates after filtering")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn brick_phrases() {
        assert!(is_cdp_brick(Some("CDP response timed out after 30s")));
        assert!(is_cdp_brick(Some("websocket closed")));
        assert!(is_cdp_brick(Some("Action timed out after 5.0s")));
        assert!(is_cdp_brick(Some("connection refused")));
        assert!(!is_cdp_brick(Some("element not found")));
        assert!(!is_cdp_brick(None));
    }

    #[test]
    fn dialog_phrases() {
        assert!(is_dialog_block(Some("Blocking JS dialog is open")));
        assert!(!is_dialog_block(Some("dialog closed")));
    }

    #[test]
    fn transient_phrases() {
        assert!(is_ui_transient(Some("Element not found: #save")));
        assert!(is_ui_transient(Some("no candidates after filtering")));
        assert!(!is_ui_transient(Some("connection refused")));
    }
}

//! Policy center: the process safety mode, reliability heuristics for
//! `run`, and every redaction rule applied to logs, frame dumps, and
//! recorded runbooks.

pub mod redact;
pub mod reliability;
pub mod runbook;

use arc_swap::ArcSwap;
use serde_json::{json, Value};
use std::sync::Arc;

use browsermcp_core_types::PolicyMode;

/// Live safety policy. `permissive` (default) permits mutation tools and
/// reveal-on-get; `strict` blocks sensitive mutation, persistence, reveal,
/// and implicit dialog handling.
pub struct SafetyPolicy {
    mode: ArcSwap<PolicyMode>,
}

impl Default for SafetyPolicy {
    fn default() -> Self {
        Self::new()
    }
}

impl SafetyPolicy {
    pub fn new() -> Self {
        Self {
            mode: ArcSwap::from_pointee(PolicyMode::Permissive),
        }
    }

    pub fn mode(&self) -> PolicyMode {
        **self.mode.load()
    }

    pub fn set_mode(&self, mode: PolicyMode) {
        self.mode.store(Arc::new(mode));
    }

    pub fn is_strict(&self) -> bool {
        self.mode() == PolicyMode::Strict
    }

    pub fn summary(&self) -> Value {
        json!({"mode": self.mode().as_str()})
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn policy_mode_swaps() {
        let policy = SafetyPolicy::new();
        assert!(!policy.is_strict());
        policy.set_mode(PolicyMode::Strict);
        assert!(policy.is_strict());
        assert_eq!(policy.summary(), json!({"mode": "strict"}));
    }
}

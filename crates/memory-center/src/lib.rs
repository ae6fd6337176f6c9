//! Agent memory: a safe key/value store with a sensitivity policy.
//!
//! Sensitivity is decided at write time (O(1) read-path checks) by a rule,
//! not a list alone: keys are normalized (lowercase, `_`/`-` stripped) and
//! matched against a closed lexical set plus any configured extensions.

pub mod sensitivity;

use std::fs;
use std::io;
use std::path::Path;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use thiserror::Error;
use tracing::warn;

use browsermcp_core_types::PolicyMode;

pub use sensitivity::is_sensitive_key;

#[derive(Debug, Error)]
pub enum MemoryError {
    #[error("value too large ({bytes} bytes > {max_bytes})")]
    ValueTooLarge { bytes: usize, max_bytes: usize },
    #[error("memory is full ({max_keys} keys)")]
    Full { max_keys: usize },
    #[error("persistence failed: {0}")]
    Io(#[from] io::Error),
    #[error("persistence failed: {0}")]
    Codec(#[from] serde_json::Error),
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct MemoryEntry {
    pub key: String,
    pub value: Value,
    pub bytes: usize,
    #[serde(rename = "updatedAt")]
    pub updated_at: DateTime<Utc>,
    pub sensitive: bool,
}

/// Metadata returned to callers on set (never the value).
#[derive(Clone, Debug, Serialize)]
pub struct SetMeta {
    pub key: String,
    pub bytes: usize,
    pub sensitive: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub evicted: Option<String>,
}

#[derive(Default)]
pub struct MemoryCenter {
    inner: DashMap<String, MemoryEntry>,
    extra_sensitive: RwLock<Vec<String>>,
}

impl MemoryCenter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Extend the sensitivity rule (user policy).
    pub fn add_sensitive_patterns(&self, patterns: Vec<String>) {
        let mut guard = self.extra_sensitive.write();
        for pattern in patterns {
            let normalized = sensitivity::normalize_key(&pattern);
            if !normalized.is_empty() && !guard.contains(&normalized) {
                guard.push(normalized);
            }
        }
    }

    fn key_is_sensitive(&self, key: &str) -> bool {
        if is_sensitive_key(key) {
            return true;
        }
        let normalized = sensitivity::normalize_key(key);
        self.extra_sensitive
            .read()
            .iter()
            .any(|pattern| normalized.contains(pattern.as_str()))
    }

    pub fn set(
        &self,
        key: &str,
        value: Value,
        max_bytes: usize,
        max_keys: usize,
    ) -> Result<SetMeta, MemoryError> {
        let bytes = serde_json::to_vec(&value).map(|v| v.len()).unwrap_or(0);
        if max_bytes > 0 && bytes > max_bytes {
            return Err(MemoryError::ValueTooLarge { bytes, max_bytes });
        }

        let mut evicted = None;
        if max_keys > 0 && !self.inner.contains_key(key) && self.inner.len() >= max_keys {
            // LRU by updated_at; refuse only if there is nothing to evict.
            let oldest = self
                .inner
                .iter()
                .min_by_key(|entry| entry.value().updated_at)
                .map(|entry| entry.key().clone());
            match oldest {
                Some(old_key) => {
                    self.inner.remove(&old_key);
                    evicted = Some(old_key);
                }
                None => return Err(MemoryError::Full { max_keys }),
            }
        }

        let sensitive = self.key_is_sensitive(key);
        let entry = MemoryEntry {
            key: key.to_string(),
            value,
            bytes,
            updated_at: Utc::now(),
            sensitive,
        };
        self.inner.insert(key.to_string(), entry);
        Ok(SetMeta {
            key: key.to_string(),
            bytes,
            sensitive,
            evicted,
        })
    }

    /// Full entry, value included. Internal consumers only (interpolation,
    /// include_memory_steps); the tool surface goes through `get_view`.
    pub fn get(&self, key: &str) -> Option<MemoryEntry> {
        self.inner.get(key).map(|entry| entry.clone())
    }

    /// Safe read for the tool surface. Sensitive values are revealed only
    /// when explicitly requested under a permissive policy.
    pub fn get_view(
        &self,
        key: &str,
        reveal: bool,
        max_chars: usize,
        policy: PolicyMode,
    ) -> Value {
        let Some(entry) = self.get(key) else {
            return json!({"found": false, "key": key, "known": self.keys_hint(20)});
        };

        let mut out = json!({
            "found": true,
            "key": entry.key,
            "bytes": entry.bytes,
            "updatedAt": entry.updated_at,
        });
        if entry.sensitive {
            out["sensitive"] = json!(true);
        }

        let may_reveal = reveal && (!entry.sensitive || policy == PolicyMode::Permissive);
        if may_reveal {
            out["value"] = clip_value(&entry.value, max_chars);
        } else if reveal && entry.sensitive {
            out["suggestion"] =
                json!("Sensitive value withheld (strict policy); use {{mem:key}} placeholders instead");
        }
        out
    }

    pub fn list(&self) -> Vec<Value> {
        let mut items: Vec<MemoryEntry> = self.inner.iter().map(|e| e.value().clone()).collect();
        items.sort_by(|a, b| a.key.cmp(&b.key));
        items
            .into_iter()
            .map(|entry| {
                json!({
                    "key": entry.key,
                    "bytes": entry.bytes,
                    "updatedAt": entry.updated_at,
                    "sensitive": entry.sensitive,
                })
            })
            .collect()
    }

    pub fn keys_hint(&self, limit: usize) -> Vec<String> {
        let mut keys: Vec<String> = self.inner.iter().map(|e| e.key().clone()).collect();
        keys.sort();
        keys.truncate(limit);
        keys
    }

    pub fn delete(&self, key: &str) -> bool {
        self.inner.remove(key).is_some()
    }

    pub fn clear(&self) {
        self.inner.clear();
    }

    pub fn len(&self) -> usize {
        self.inner.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }

    /// Persist to a JSON file. Sensitive entries are excluded unless
    /// `allow_sensitive` is set.
    pub fn save(&self, path: &Path, allow_sensitive: bool) -> Result<usize, MemoryError> {
        let mut entries: Vec<MemoryEntry> = self
            .inner
            .iter()
            .map(|e| e.value().clone())
            .filter(|entry| allow_sensitive || !entry.sensitive)
            .collect();
        entries.sort_by(|a, b| a.key.cmp(&b.key));

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let payload = serde_json::to_vec_pretty(&entries)?;
        fs::write(path, payload)?;
        Ok(entries.len())
    }

    /// Load entries from a JSON file (missing file loads nothing).
    /// Persisted sensitive entries are skipped unless `allow_sensitive`.
    pub fn load(&self, path: &Path, allow_sensitive: bool) -> Result<usize, MemoryError> {
        if !path.exists() {
            return Ok(0);
        }
        let bytes = fs::read(path)?;
        if bytes.is_empty() {
            return Ok(0);
        }
        let entries: Vec<MemoryEntry> = serde_json::from_slice(&bytes)?;
        let mut loaded = 0;
        for mut entry in entries {
            // Re-derive the flag: the rule may have changed since save.
            entry.sensitive = self.key_is_sensitive(&entry.key);
            if entry.sensitive && !allow_sensitive {
                warn!(target: "memory.center", key = %entry.key, "skipping sensitive entry on load");
                continue;
            }
            self.inner.insert(entry.key.clone(), entry);
            loaded += 1;
        }
        Ok(loaded)
    }
}

fn clip_value(value: &Value, max_chars: usize) -> Value {
    if max_chars == 0 {
        return value.clone();
    }
    match value {
        Value::String(s) if s.len() > max_chars => {
            Value::String(format!("{}…", &s[..floor_char_boundary(s, max_chars)]))
        }
        other => {
            let rendered = other.to_string();
            if rendered.len() > max_chars {
                Value::String(format!(
                    "{}…",
                    &rendered[..floor_char_boundary(&rendered, max_chars)]
                ))
            } else {
                other.clone()
            }
        }
    }
}

fn floor_char_boundary(s: &str, mut at: usize) -> usize {
    at = at.min(s.len());
    while at > 0 && !s.is_char_boundary(at) {
        at -= 1;
    }
    at
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sensitive_keys_are_flagged_at_write_time() {
        let mem = MemoryCenter::new();
        let meta = mem.set("github_token", json!("secret"), 0, 0).unwrap();
        assert!(meta.sensitive);
        let meta = mem.set("greeting", json!("hi"), 0, 0).unwrap();
        assert!(!meta.sensitive);
    }

    #[test]
    fn sensitive_values_hidden_by_default() {
        let mem = MemoryCenter::new();
        mem.set("api-key", json!("sk-123"), 0, 0).unwrap();

        let view = mem.get_view("api-key", false, 0, PolicyMode::Permissive);
        assert_eq!(view["found"], json!(true));
        assert!(view.get("value").is_none());

        let view = mem.get_view("api-key", true, 0, PolicyMode::Permissive);
        assert_eq!(view["value"], json!("sk-123"));

        let view = mem.get_view("api-key", true, 0, PolicyMode::Strict);
        assert!(view.get("value").is_none());
        assert!(view.get("suggestion").is_some());
    }

    #[test]
    fn missing_key_lists_known_keys() {
        let mem = MemoryCenter::new();
        mem.set("alpha", json!(1), 0, 0).unwrap();
        let view = mem.get_view("beta", false, 0, PolicyMode::Permissive);
        assert_eq!(view["found"], json!(false));
        assert_eq!(view["known"], json!(["alpha"]));
    }

    #[test]
    fn lru_eviction_drops_oldest() {
        let mem = MemoryCenter::new();
        mem.set("first", json!(1), 0, 2).unwrap();
        mem.set("second", json!(2), 0, 2).unwrap();
        let meta = mem.set("third", json!(3), 0, 2).unwrap();
        assert_eq!(meta.evicted.as_deref(), Some("first"));
        assert!(mem.get("first").is_none());
        assert_eq!(mem.len(), 2);
    }

    #[test]
    fn oversized_values_are_refused() {
        let mem = MemoryCenter::new();
        let big = json!("x".repeat(100));
        let err = mem.set("k", big, 10, 0).unwrap_err();
        assert!(matches!(err, MemoryError::ValueTooLarge { .. }));
    }

    #[test]
    fn save_excludes_sensitive_by_default() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("agent_memory.json");

        let mem = MemoryCenter::new();
        mem.set("password", json!("hunter2"), 0, 0).unwrap();
        mem.set("note", json!("plain"), 0, 0).unwrap();

        let saved = mem.save(&path, false).unwrap();
        assert_eq!(saved, 1);

        let restored = MemoryCenter::new();
        let loaded = restored.load(&path, false).unwrap();
        assert_eq!(loaded, 1);
        assert!(restored.get("note").is_some());
        assert!(restored.get("password").is_none());
    }

    #[test]
    fn save_and_load_sensitive_when_allowed() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("agent_memory.json");

        let mem = MemoryCenter::new();
        mem.set("auth-cookie", json!("abc"), 0, 0).unwrap();
        assert_eq!(mem.save(&path, true).unwrap(), 1);

        let restored = MemoryCenter::new();
        assert_eq!(restored.load(&path, true).unwrap(), 1);
        assert_eq!(restored.get("auth-cookie").unwrap().value, json!("abc"));
        assert!(restored.get("auth-cookie").unwrap().sensitive);
    }

    #[test]
    fn user_patterns_extend_the_rule() {
        let mem = MemoryCenter::new();
        assert!(!mem.set("employee-badge", json!(1), 0, 0).unwrap().sensitive);
        mem.add_sensitive_patterns(vec!["badge".into()]);
        assert!(mem.set("employee-badge", json!(1), 0, 0).unwrap().sensitive);
    }
}

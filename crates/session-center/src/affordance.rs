//! Affordance registry types: stable `aff:<hash>` refs pointing at
//! concrete `{tool, args}` pairs the engine can execute directly.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};

/// One resolvable action on a page.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AffordanceItem {
    #[serde(rename = "ref")]
    pub ref_id: String,
    pub tool: String,
    pub args: Value,
    #[serde(default)]
    pub meta: Value,
}

impl AffordanceItem {
    pub fn label(&self) -> Option<&str> {
        self.meta.get("text").and_then(Value::as_str)
    }

    pub fn kind(&self) -> Option<&str> {
        self.meta.get("kind").and_then(Value::as_str)
    }
}

/// Registry state returned alongside resolution results, so callers can
/// tell a miss from staleness.
#[derive(Clone, Debug, Serialize)]
pub struct AffordanceState {
    pub url: String,
    pub count: usize,
    pub cursor: i64,
}

/// Bounded preview row for ambiguous label matches.
#[derive(Clone, Debug, Serialize)]
pub struct LabelMatch {
    #[serde(rename = "ref")]
    pub ref_id: String,
    pub index: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
}

/// Per-tab affordance map, refreshed by `page(detail=locators|map)`.
#[derive(Clone, Debug)]
pub struct AffordanceMap {
    pub url: String,
    pub cursor: i64,
    pub items: Vec<AffordanceItem>,
}

impl AffordanceMap {
    pub fn state(&self) -> AffordanceState {
        AffordanceState {
            url: self.url.clone(),
            count: self.items.len(),
            cursor: self.cursor,
        }
    }

    /// Deterministic label resolution: exact match on the normalized label
    /// among stored items of the requested kind. Multiple matches without
    /// an index fail closed; so does an out-of-range index.
    pub fn resolve_by_label(
        &self,
        label: &str,
        kind: Option<&str>,
        index: Option<usize>,
        max_matches: usize,
    ) -> (Option<AffordanceItem>, Vec<LabelMatch>) {
        let wanted = normalize_label(label);
        if wanted.is_empty() {
            return (None, Vec::new());
        }

        let matched: Vec<&AffordanceItem> = self
            .items
            .iter()
            .filter(|item| match kind {
                None => true,
                Some(kind) => item.kind() == Some(kind),
            })
            .filter(|item| {
                item.label()
                    .map(|l| normalize_label(l) == wanted)
                    .unwrap_or(false)
            })
            .take(max_matches.max(1))
            .collect();

        let previews: Vec<LabelMatch> = matched
            .iter()
            .enumerate()
            .map(|(i, item)| LabelMatch {
                ref_id: item.ref_id.clone(),
                index: i,
                kind: item.kind().map(str::to_string),
                text: item.label().map(str::to_string),
            })
            .collect();

        let resolved = match (matched.len(), index) {
            (0, _) => None,
            (1, None) => Some(matched[0].clone()),
            (_, None) => None,
            (n, Some(i)) if i < n => Some(matched[i].clone()),
            (_, Some(_)) => None,
        };

        (resolved, previews)
    }
}

/// Stable ref hash: two snapshots of the same semantic action on the same
/// URL must produce the same ref.
pub fn affordance_ref(url: &str, tool: &str, args: &Value, label: Option<&str>) -> String {
    let mut hasher = Sha256::new();
    hasher.update(url.as_bytes());
    hasher.update([0]);
    hasher.update(tool.as_bytes());
    hasher.update([0]);
    hasher.update(canonical_json(args).as_bytes());
    if let Some(label) = label {
        hasher.update([0]);
        hasher.update(normalize_label(label).as_bytes());
    }
    let digest = hasher.finalize();
    let mut hex = String::with_capacity(12);
    for byte in digest.iter().take(6) {
        hex.push_str(&format!("{byte:02x}"));
    }
    format!("aff:{hex}")
}

fn normalize_label(label: &str) -> String {
    label.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Key-sorted rendering so hash input does not depend on map order.
fn canonical_json(value: &Value) -> String {
    match value {
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            let inner: Vec<String> = keys
                .into_iter()
                .map(|k| format!("{}:{}", k, canonical_json(&map[k])))
                .collect();
            format!("{{{}}}", inner.join(","))
        }
        Value::Array(items) => {
            let inner: Vec<String> = items.iter().map(canonical_json).collect();
            format!("[{}]", inner.join(","))
        }
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn item(ref_id: &str, kind: &str, text: &str) -> AffordanceItem {
        AffordanceItem {
            ref_id: ref_id.into(),
            tool: "click".into(),
            args: json!({"selector": format!("#{ref_id}")}),
            meta: json!({"kind": kind, "text": text}),
        }
    }

    fn map(items: Vec<AffordanceItem>) -> AffordanceMap {
        AffordanceMap {
            url: "https://a.test/".into(),
            cursor: 1,
            items,
        }
    }

    #[test]
    fn refs_are_stable_and_order_independent() {
        let a = affordance_ref(
            "https://a.test/",
            "click",
            &json!({"selector": "#x", "index": 1}),
            Some("Save"),
        );
        let b = affordance_ref(
            "https://a.test/",
            "click",
            &json!({"index": 1, "selector": "#x"}),
            Some("  Save "),
        );
        assert_eq!(a, b);
        assert!(a.starts_with("aff:"));

        let other_url = affordance_ref(
            "https://b.test/",
            "click",
            &json!({"selector": "#x", "index": 1}),
            Some("Save"),
        );
        assert_ne!(a, other_url);
    }

    #[test]
    fn unique_label_resolves() {
        let m = map(vec![item("a", "button", "Save"), item("b", "link", "Docs")]);
        let (resolved, matches) = m.resolve_by_label("save", None, None, 10);
        // Labels are case-sensitive exact matches after whitespace folding.
        assert!(resolved.is_none());
        assert!(matches.is_empty());

        let (resolved, matches) = m.resolve_by_label("Save", None, None, 10);
        assert_eq!(resolved.unwrap().ref_id, "a");
        assert_eq!(matches.len(), 1);
    }

    #[test]
    fn ambiguous_label_fails_closed_without_index() {
        let m = map(vec![item("a", "button", "Save"), item("b", "button", "Save")]);
        let (resolved, matches) = m.resolve_by_label("Save", Some("button"), None, 10);
        assert!(resolved.is_none());
        assert_eq!(matches.len(), 2);

        let (resolved, _) = m.resolve_by_label("Save", Some("button"), Some(1), 10);
        assert_eq!(resolved.unwrap().ref_id, "b");

        let (resolved, matches) = m.resolve_by_label("Save", Some("button"), Some(5), 10);
        assert!(resolved.is_none());
        assert_eq!(matches.len(), 2);
    }

    #[test]
    fn kind_filter_narrows_matches() {
        let m = map(vec![item("a", "button", "Save"), item("b", "link", "Save")]);
        let (resolved, _) = m.resolve_by_label("Save", Some("link"), None, 10);
        assert_eq!(resolved.unwrap().ref_id, "b");
    }
}

//! Artifact store: off-context payloads addressable by opaque id.
//!
//! Tool responses that would blow the caller's cognitive budget park the
//! full payload here and return a short summary plus a drilldown hint such
//! as `artifact(action="get", id="...", offset=0, max_chars=4000)`.

use std::path::{Path, PathBuf};

use base64::Engine;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::Serialize;
use serde_json::{json, Value};
use thiserror::Error;

use browsermcp_core_types::new_artifact_id;

#[derive(Debug, Error)]
pub enum ArtifactError {
    #[error("unknown artifact id: {0}")]
    NotFound(String),
    #[error("invalid base64 payload: {0}")]
    BadPayload(String),
    #[error("export target exists: {0} (pass overwrite=true)")]
    Exists(PathBuf),
    #[error("export failed: {0}")]
    Io(#[from] std::io::Error),
}

/// Stored payload bytes. JSON artifacts keep their text form so `get` can
/// slice by chars; binary artifacts stay as bytes.
#[derive(Clone, Debug)]
enum Payload {
    Text(String),
    Bytes(Vec<u8>),
}

#[derive(Clone, Debug)]
pub struct Artifact {
    pub id: String,
    pub kind: String,
    pub mime_type: String,
    pub bytes: usize,
    pub created_at: DateTime<Utc>,
    pub metadata: Value,
    payload: Payload,
}

/// Short reference handed back to tools (never the payload).
#[derive(Clone, Debug, Serialize)]
pub struct ArtifactRef {
    pub id: String,
    pub kind: String,
    #[serde(rename = "mimeType")]
    pub mime_type: String,
    pub bytes: usize,
    #[serde(rename = "createdAt")]
    pub created_at: DateTime<Utc>,
}

impl Artifact {
    fn to_ref(&self) -> ArtifactRef {
        ArtifactRef {
            id: self.id.clone(),
            kind: self.kind.clone(),
            mime_type: self.mime_type.clone(),
            bytes: self.bytes,
            created_at: self.created_at,
        }
    }
}

/// The drilldown hint format agents paste back verbatim.
pub fn artifact_get_hint(artifact_id: &str, offset: usize, max_chars: usize) -> String {
    format!("artifact(action=\"get\", id=\"{artifact_id}\", offset={offset}, max_chars={max_chars})")
}

#[derive(Default)]
pub struct ArtifactStore {
    inner: DashMap<String, Artifact>,
    export_dir: Option<PathBuf>,
}

impl ArtifactStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_export_dir(dir: PathBuf) -> Self {
        Self {
            inner: DashMap::new(),
            export_dir: Some(dir),
        }
    }

    pub fn put_json(&self, kind: &str, obj: &Value, metadata: Value) -> ArtifactRef {
        let text = serde_json::to_string(obj).unwrap_or_else(|_| obj.to_string());
        let artifact = Artifact {
            id: new_artifact_id(),
            kind: kind.to_string(),
            mime_type: "application/json".to_string(),
            bytes: text.len(),
            created_at: Utc::now(),
            metadata,
            payload: Payload::Text(text),
        };
        let reference = artifact.to_ref();
        self.inner.insert(artifact.id.clone(), artifact);
        reference
    }

    pub fn put_text(&self, kind: &str, text: String, mime_type: &str, metadata: Value) -> ArtifactRef {
        let artifact = Artifact {
            id: new_artifact_id(),
            kind: kind.to_string(),
            mime_type: mime_type.to_string(),
            bytes: text.len(),
            created_at: Utc::now(),
            metadata,
            payload: Payload::Text(text),
        };
        let reference = artifact.to_ref();
        self.inner.insert(artifact.id.clone(), artifact);
        reference
    }

    pub fn put_image_b64(
        &self,
        kind: &str,
        data_b64: &str,
        mime_type: &str,
        metadata: Value,
    ) -> Result<ArtifactRef, ArtifactError> {
        let bytes = base64::engine::general_purpose::STANDARD
            .decode(data_b64)
            .map_err(|err| ArtifactError::BadPayload(err.to_string()))?;
        let artifact = Artifact {
            id: new_artifact_id(),
            kind: kind.to_string(),
            mime_type: mime_type.to_string(),
            bytes: bytes.len(),
            created_at: Utc::now(),
            metadata,
            payload: Payload::Bytes(bytes),
        };
        let reference = artifact.to_ref();
        self.inner.insert(artifact.id.clone(), artifact);
        Ok(reference)
    }

    pub fn put_bytes(
        &self,
        kind: &str,
        bytes: Vec<u8>,
        mime_type: &str,
        metadata: Value,
    ) -> ArtifactRef {
        let artifact = Artifact {
            id: new_artifact_id(),
            kind: kind.to_string(),
            mime_type: mime_type.to_string(),
            bytes: bytes.len(),
            created_at: Utc::now(),
            metadata,
            payload: Payload::Bytes(bytes),
        };
        let reference = artifact.to_ref();
        self.inner.insert(artifact.id.clone(), artifact);
        reference
    }

    /// Sliced read. Text artifacts slice by chars; binary ones return
    /// base64 of the requested byte window.
    pub fn get(
        &self,
        artifact_id: &str,
        offset: usize,
        max_chars: usize,
    ) -> Result<Value, ArtifactError> {
        let entry = self
            .inner
            .get(artifact_id)
            .ok_or_else(|| ArtifactError::NotFound(artifact_id.to_string()))?;

        let (chunk, total, encoding) = match &entry.payload {
            Payload::Text(text) => {
                let start = floor_char_boundary(text, offset.min(text.len()));
                let end = if max_chars == 0 {
                    text.len()
                } else {
                    floor_char_boundary(text, (start + max_chars).min(text.len()))
                };
                (text[start..end].to_string(), text.len(), "text")
            }
            Payload::Bytes(bytes) => {
                let start = offset.min(bytes.len());
                let end = if max_chars == 0 {
                    bytes.len()
                } else {
                    (start + max_chars).min(bytes.len())
                };
                (
                    base64::engine::general_purpose::STANDARD.encode(&bytes[start..end]),
                    bytes.len(),
                    "base64",
                )
            }
        };

        let consumed = offset + if encoding == "text" { chunk.len() } else { 0 };
        Ok(json!({
            "id": entry.id.clone(),
            "kind": entry.kind.clone(),
            "mimeType": entry.mime_type.clone(),
            "bytes": entry.bytes,
            "createdAt": entry.created_at,
            "metadata": entry.metadata.clone(),
            "offset": offset,
            "total": total,
            "encoding": encoding,
            "data": chunk,
            "more": consumed < total && encoding == "text" || (encoding == "base64" && max_chars != 0 && offset + max_chars < total),
        }))
    }

    pub fn describe(&self, artifact_id: &str) -> Result<ArtifactRef, ArtifactError> {
        self.inner
            .get(artifact_id)
            .map(|entry| entry.to_ref())
            .ok_or_else(|| ArtifactError::NotFound(artifact_id.to_string()))
    }

    pub fn list(&self, limit: usize) -> Vec<ArtifactRef> {
        let mut refs: Vec<ArtifactRef> = self.inner.iter().map(|e| e.value().to_ref()).collect();
        refs.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        if limit > 0 {
            refs.truncate(limit);
        }
        refs
    }

    pub fn delete(&self, artifact_id: &str) -> bool {
        self.inner.remove(artifact_id).is_some()
    }

    /// Write the artifact to disk. `name` overrides the generated file
    /// name; refuses to clobber unless `overwrite` is set.
    pub fn export(
        &self,
        artifact_id: &str,
        dir: Option<&Path>,
        name: Option<&str>,
        overwrite: bool,
    ) -> Result<Value, ArtifactError> {
        let entry = self
            .inner
            .get(artifact_id)
            .ok_or_else(|| ArtifactError::NotFound(artifact_id.to_string()))?;

        let dir = dir
            .map(Path::to_path_buf)
            .or_else(|| self.export_dir.clone())
            .unwrap_or_else(|| std::env::temp_dir().join("browsermcp-artifacts"));
        std::fs::create_dir_all(&dir)?;

        let file_name = match name {
            Some(name) if !name.trim().is_empty() => sanitize_file_name(name.trim()),
            _ => format!("{}{}", entry.id, extension_for(&entry.mime_type)),
        };
        let path = dir.join(file_name);
        if path.exists() && !overwrite {
            return Err(ArtifactError::Exists(path));
        }

        match &entry.payload {
            Payload::Text(text) => std::fs::write(&path, text)?,
            Payload::Bytes(bytes) => std::fs::write(&path, bytes)?,
        }

        Ok(json!({
            "export": {
                "path": path.to_string_lossy(),
                "bytes": entry.bytes,
                "mimeType": entry.mime_type.clone(),
            }
        }))
    }

    pub fn len(&self) -> usize {
        self.inner.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }

    pub fn clear(&self) {
        self.inner.clear();
    }
}

fn extension_for(mime_type: &str) -> &'static str {
    match mime_type {
        "application/json" => ".json",
        "image/png" => ".png",
        "image/jpeg" => ".jpg",
        "text/html" => ".html",
        "text/plain" => ".txt",
        _ => ".bin",
    }
}

fn sanitize_file_name(name: &str) -> String {
    name.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_') {
                c
            } else {
                '_'
            }
        })
        .collect()
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
    fn put_json_and_sliced_get() {
        let store = ArtifactStore::new();
        let reference = store.put_json("flow_steps", &json!({"steps": [1, 2, 3]}), json!({}));
        assert!(reference.id.starts_with("art_"));

        let full = store.get(&reference.id, 0, 0).unwrap();
        assert_eq!(full["encoding"], json!("text"));
        assert_eq!(full["data"].as_str().unwrap(), "{\"steps\":[1,2,3]}");

        let slice = store.get(&reference.id, 2, 5).unwrap();
        assert_eq!(slice["data"].as_str().unwrap(), "steps");
        assert_eq!(slice["more"], json!(true));
    }

    #[test]
    fn ids_survive_until_deleted() {
        let store = ArtifactStore::new();
        let reference = store.put_json("x", &json!(1), json!({}));
        assert!(store.describe(&reference.id).is_ok());
        assert!(store.delete(&reference.id));
        assert!(matches!(
            store.get(&reference.id, 0, 0),
            Err(ArtifactError::NotFound(_))
        ));
    }

    #[test]
    fn image_round_trip() {
        let store = ArtifactStore::new();
        let reference = store
            .put_image_b64("step_image", "aGVsbG8=", "image/png", json!({"i": 0}))
            .unwrap();
        assert_eq!(reference.bytes, 5);
        let got = store.get(&reference.id, 0, 0).unwrap();
        assert_eq!(got["encoding"], json!("base64"));
        assert_eq!(got["data"], json!("aGVsbG8="));
    }

    #[test]
    fn bad_base64_is_refused() {
        let store = ArtifactStore::new();
        assert!(store
            .put_image_b64("step_image", "!!!", "image/png", json!({}))
            .is_err());
    }

    #[test]
    fn export_respects_overwrite() {
        let dir = tempfile::tempdir().unwrap();
        let store = ArtifactStore::new();
        let reference = store.put_json("trace", &json!({"a": 1}), json!({}));

        let out = store
            .export(&reference.id, Some(dir.path()), Some("trace.json"), false)
            .unwrap();
        let path = out["export"]["path"].as_str().unwrap().to_string();
        assert!(std::path::Path::new(&path).exists());

        let again = store.export(&reference.id, Some(dir.path()), Some("trace.json"), false);
        assert!(matches!(again, Err(ArtifactError::Exists(_))));
        assert!(store
            .export(&reference.id, Some(dir.path()), Some("trace.json"), true)
            .is_ok());
    }

    #[test]
    fn hint_format_is_stable() {
        assert_eq!(
            artifact_get_hint("art_1", 0, 4000),
            "artifact(action=\"get\", id=\"art_1\", offset=0, max_chars=4000)"
        );
    }
}

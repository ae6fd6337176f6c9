//! `download`: watch the per-tab download directory for a new, stable
//! file, hash it, and store it as an artifact.

use std::path::PathBuf;
use std::time::{Duration, Instant};

use serde_json::{json, Value};
use sha2::{Digest, Sha256};

use browsermcp_core_types::{ErrorKind, ToolError, ToolResult};
use browsermcp_registry::ToolCtx;

use super::support::{arg_bool, arg_f64, args_obj, page_session};

fn mime_for(path: &std::path::Path) -> &'static str {
    match path
        .extension()
        .and_then(|e| e.to_str())
        .map(str::to_ascii_lowercase)
        .as_deref()
    {
        Some("json") => "application/json",
        Some("pdf") => "application/pdf",
        Some("png") => "image/png",
        Some("jpg" | "jpeg") => "image/jpeg",
        Some("csv") => "text/csv",
        Some("txt") => "text/plain",
        Some("html") => "text/html",
        Some("zip") => "application/zip",
        _ => "application/octet-stream",
    }
}

fn list_files(dir: &std::path::Path) -> Vec<(String, u64)> {
    std::fs::read_dir(dir)
        .map(|entries| {
            entries
                .filter_map(|e| e.ok())
                .filter(|e| e.path().is_file())
                .filter_map(|e| {
                    let name = e.file_name().into_string().ok()?;
                    let size = e.metadata().ok()?.len();
                    Some((name, size))
                })
                .collect()
        })
        .unwrap_or_default()
}

pub async fn download(ctx: ToolCtx, args: Value) -> ToolResult {
    let args = args_obj(&args);
    let (session, tab_id) = match page_session(&ctx, "download").await {
        Ok(pair) => pair,
        Err(err) => return err,
    };
    ctx.sessions.ensure_downloads(&session).await;

    let timeout_s = arg_f64(&args, "timeout", 5.0).clamp(0.0, 180.0);
    let poll_interval = arg_f64(&args, "poll_interval", 0.2).clamp(0.05, 1.0);
    let stable_ms = args
        .get("stable_ms")
        .and_then(Value::as_u64)
        .unwrap_or(500)
        .min(30_000);
    let store = arg_bool(&args, "store", true);
    let want_sha256 = arg_bool(&args, "sha256", true);
    let sha256_max_bytes = args
        .get("sha256_max_bytes")
        .and_then(Value::as_u64)
        .unwrap_or(209_715_200);
    let required = arg_bool(&args, "required", false);

    let dir = ctx.sessions.download_dir(&tab_id);
    let _ = std::fs::create_dir_all(&dir);

    // The engine passes the pre-click snapshot as _baseline; standalone
    // calls baseline at entry.
    let baseline: Vec<String> = args
        .get("_baseline")
        .and_then(Value::as_array)
        .map(|items| {
            items
                .iter()
                .filter_map(Value::as_str)
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_else(|| list_files(&dir).into_iter().map(|(name, _)| name).collect());

    let is_partial = |name: &str| {
        name.ends_with(".crdownload") || name.ends_with(".part") || name.ends_with(".tmp")
    };

    let deadline = Instant::now() + Duration::from_secs_f64(timeout_s);
    let found: Option<PathBuf> = loop {
        let new_files: Vec<(String, u64)> = list_files(&dir)
            .into_iter()
            .filter(|(name, _)| !baseline.contains(name) && !is_partial(name))
            .collect();

        if let Some((name, size)) = new_files.into_iter().next() {
            // Complete = size stable for stable_ms.
            let path = dir.join(&name);
            tokio::time::sleep(Duration::from_millis(stable_ms)).await;
            let size_after = std::fs::metadata(&path).map(|m| m.len()).unwrap_or(0);
            if size_after == size {
                break Some(path);
            }
        }

        if Instant::now() >= deadline {
            break None;
        }
        tokio::time::sleep(Duration::from_secs_f64(poll_interval)).await;
    };

    let Some(path) = found else {
        let kind = if required {
            ErrorKind::ToolFailure
        } else {
            ErrorKind::Timeout
        };
        return ToolResult::failure(
            ToolError::new(kind, "Timed out waiting for a new download")
                .with_tool("download")
                .with_suggestion("Increase timeout, or verify the click actually triggers a download"),
        );
    };

    let file_name = path
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or("download")
        .to_string();
    let bytes = match std::fs::read(&path) {
        Ok(bytes) => bytes,
        Err(err) => {
            return ToolResult::failure(
                ToolError::new(ErrorKind::ToolFailure, format!("Read failed: {err}"))
                    .with_tool("download"),
            );
        }
    };
    let mime_type = mime_for(&path);

    let mut download_info = json!({
        "fileName": file_name,
        "bytes": bytes.len(),
        "mimeType": mime_type,
        "path": path.to_string_lossy(),
    });
    if want_sha256 && (bytes.len() as u64) <= sha256_max_bytes {
        let mut hasher = Sha256::new();
        hasher.update(&bytes);
        let digest = hasher.finalize();
        let hex: String = digest.iter().map(|b| format!("{b:02x}")).collect();
        download_info["sha256"] = json!(hex);
    }

    let mut payload = json!({"ok": true, "tool": "download", "download": download_info});
    if store {
        let reference = ctx.artifacts.put_bytes(
            "download",
            bytes,
            mime_type,
            json!({"fileName": payload["download"]["fileName"]}),
        );
        payload["artifact"] = json!({
            "id": reference.id.clone(),
            "kind": reference.kind.clone(),
            "mimeType": reference.mime_type.clone(),
            "bytes": reference.bytes,
        });
        if let Some(sha256) = payload["download"].get("sha256").cloned() {
            payload["artifact"]["sha256"] = sha256;
        }
        payload["next"] = json!([artifact_store::artifact_get_hint(&reference.id, 0, 4000)]);
    }
    ToolResult::json(payload)
}

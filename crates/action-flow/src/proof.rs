//! Per-step proof and the final observe bundle.
//!
//! A proof is a compact observation: the `since` cursor, a cheap after
//! state, a Tier-0 delta (non-zero counters only), one top insight
//! (dialog > js error > failed request), and possibly an ambiguity flag
//! with an off-context screenshot.

use serde_json::{json, Map, Value};

use artifact_store::artifact_get_hint;

use crate::conditions::best_effort_page_info;
use crate::engine::{ProofScreenshot, RunState};
use crate::watchdog::Watchdog;

fn trunc(value: Option<&Value>, n: usize) -> Option<String> {
    let s = value?.as_str()?.trim();
    if s.is_empty() {
        return None;
    }
    if s.len() > n {
        let mut cut = n;
        while cut > 0 && !s.is_char_boundary(cut) {
            cut -= 1;
        }
        Some(format!("{}…", &s[..cut]))
    } else {
        Some(s.to_string())
    }
}

async fn store_screenshot(state: &RunState<'_>, kind: &str, metadata: Value) -> Option<Value> {
    let data = state.session.screenshot_b64().await.ok()?;
    let reference = state
        .ctx
        .artifacts
        .put_image_b64(kind, &data, "image/png", metadata)
        .ok()?;
    Some(json!({
        "artifact": {
            "id": reference.id.clone(),
            "kind": reference.kind.clone(),
            "mimeType": reference.mime_type.clone(),
            "bytes": reference.bytes,
            "createdAt": reference.created_at,
        },
        "next": [artifact_get_hint(&reference.id, 0, 4000)],
    }))
}

fn extract_matches_found(payload: Option<&Value>) -> Option<i64> {
    let payload = payload?;
    if let Some(mf) = payload
        .get("result")
        .and_then(|r| r.get("matchesFound"))
        .and_then(Value::as_i64)
    {
        return Some(mf);
    }
    payload.get("matchesFound").and_then(Value::as_i64)
}

pub(crate) async fn build_step_proof(
    state: &mut RunState<'_>,
    since_ms: i64,
    tool_name: &str,
    i: usize,
    payload: Option<&Value>,
) -> Option<Value> {
    let mut proof = json!({"since": since_ms});

    // After-state (cheap, best-effort).
    if let Some(info) = best_effort_page_info(&state.session, &state.ctx.sessions).await {
        proof["after"] = json!({
            "url": info.get("url").cloned().unwrap_or(Value::Null),
            "title": info.get("title").cloned().unwrap_or(Value::Null),
            "readyState": info.get("readyState").cloned().unwrap_or(Value::Null),
        });
    }

    // Tier-0 delta: fast and deterministic, no per-step page injection.
    if let Some(snap) = state
        .ctx
        .sessions
        .tier0_snapshot(&state.tab_id, Some(since_ms), 0, 50)
    {
        proof["cursor"] = json!(snap.cursor);

        let mut delta = Map::new();
        for (key, value) in [
            ("consoleErrors", snap.summary.console_errors),
            ("consoleWarnings", snap.summary.console_warnings),
            ("jsErrors", snap.summary.js_errors),
            ("resourceErrors", snap.summary.resource_errors),
            ("unhandledRejections", snap.summary.unhandled_rejections),
            ("failedRequests", snap.summary.failed_requests),
        ] {
            if value > 0 {
                delta.insert(key.to_string(), json!(value));
            }
        }
        let last_error = snap
            .summary
            .last_error
            .as_deref()
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(|s| {
                if s.len() > 200 {
                    let mut cut = 200;
                    while cut > 0 && !s.is_char_boundary(cut) {
                        cut -= 1;
                    }
                    format!("{}…", &s[..cut])
                } else {
                    s.to_string()
                }
            });
        if let Some(last_error) = &last_error {
            delta.insert("lastError".into(), json!(last_error));
        }
        if !delta.is_empty() {
            proof["delta"] = Value::Object(delta);
        }

        // Dialog is the most common CDP brick trigger: always the top
        // insight when present.
        if snap.dialog_open {
            let dialog = snap.dialog.clone().unwrap_or(Value::Null);
            proof["dialog"] = json!({
                "open": true,
                "type": dialog.get("type").cloned().unwrap_or(Value::Null),
                "message": dialog.get("message").cloned().unwrap_or(Value::Null),
                "url": dialog.get("url").cloned().unwrap_or(Value::Null),
            });
            proof["top"] = json!({
                "severity": "error",
                "kind": "dialog_open",
                "message": dialog
                    .get("message")
                    .and_then(Value::as_str)
                    .unwrap_or("Dialog is open"),
            });
        } else if let Some(last_error) = last_error {
            proof["top"] = json!({
                "severity": "error",
                "kind": "js_error",
                "message": last_error,
            });
        } else if let Some(failed) = snap.network.first() {
            let url = failed.get("url").and_then(Value::as_str).unwrap_or("");
            let message = match failed.get("status").and_then(Value::as_i64) {
                Some(status) => format!("{status} {url}"),
                None => url.to_string(),
            };
            proof["top"] = json!({
                "severity": "error",
                "kind": "failed_request",
                "message": message,
            });
        }
    }

    // Ambiguity detection (high value for screenshot/debug).
    let mut ambiguous = None;
    if tool_name == "click" {
        if let Some(matches_found) = extract_matches_found(payload) {
            if matches_found > 1 {
                ambiguous = Some(json!({
                    "reason": "multiple_matches",
                    "matchesFound": matches_found,
                }));
            }
        }
    }
    if let Some(ambiguous) = &ambiguous {
        proof["ambiguous"] = ambiguous.clone();
    }

    // Optional screenshot stored off-context.
    let payload_error = payload
        .and_then(|p| p.get("error"))
        .map(|e| !e.is_null())
        .unwrap_or(false);
    let want_shot = (ambiguous.is_some() && state.opts.screenshot_on_ambiguity)
        || (payload_error && state.opts.proof_screenshot == ProofScreenshot::Artifact);
    if want_shot && state.opts.proof_screenshot == ProofScreenshot::Artifact {
        let reason = if ambiguous.is_some() { "ambiguity" } else { "error" };
        if let Some(stored) = store_screenshot(
            state,
            "run_proof_screenshot",
            json!({"tool": tool_name, "i": i, "reason": reason}),
        )
        .await
        {
            if let Value::Object(stored) = stored {
                for (k, v) in stored {
                    if k == "next" {
                        if let Some(hint) = v.as_array().and_then(|a| a.first()).and_then(Value::as_str)
                        {
                            state.push_next_hint(hint);
                        }
                    }
                    proof[k] = v;
                }
            }
        }
    }

    // Cheap decision bit for the caller.
    let signal = proof.get("delta").is_some()
        || proof.get("dialog").is_some()
        || proof.get("ambiguous").is_some();
    proof["signal"] = json!(signal);

    let keys = proof.as_object().map(Map::len).unwrap_or(0);
    (keys > 2).then_some(proof)
}

/// Enrich the final page context with Tier-0 counters, 1-3 prioritized
/// insights, a HAR-lite resource rollup, and best-effort perf vitals.
pub(crate) async fn enrich_observe(state: &mut RunState<'_>, out: &mut Value, since: Option<i64>) {
    let Some(snap) = state.ctx.sessions.tier0_snapshot(&state.tab_id, since, 0, 50) else {
        return;
    };

    if out.get("cursor").is_none() {
        out["cursor"] = json!(snap.cursor);
    }

    let Some(final_obj) = out.get_mut("final").filter(|f| f.is_object()) else {
        return;
    };

    let mut counts = Map::new();
    for (key, value) in [
        ("consoleErrors", snap.summary.console_errors),
        ("consoleWarnings", snap.summary.console_warnings),
        ("jsErrors", snap.summary.js_errors),
        ("resourceErrors", snap.summary.resource_errors),
        ("unhandledRejections", snap.summary.unhandled_rejections),
        ("failedRequests", snap.summary.failed_requests),
    ] {
        if value > 0 {
            counts.insert(key.to_string(), json!(value));
        }
    }
    let last_error = snap
        .summary
        .last_error
        .as_deref()
        .and_then(|s| trunc(Some(&json!(s)), 200));
    if let Some(last_error) = &last_error {
        counts.insert("lastError".into(), json!(last_error));
    }

    // Resources: approximate, bounded, high-signal.
    let mut bytes_total: i64 = 0;
    let mut failed_har = 0u64;
    let mut slowest: Option<&Value> = None;
    let mut largest: Option<&Value> = None;
    for item in &snap.har_lite {
        if item.get("ok") == Some(&Value::Bool(false)) {
            failed_har += 1;
        }
        if let Some(bytes) = item.get("encodedDataLength").and_then(Value::as_i64) {
            if bytes >= 0 {
                bytes_total += bytes;
                if largest
                    .and_then(|l| l.get("encodedDataLength").and_then(Value::as_i64))
                    .map_or(true, |best| bytes > best)
                {
                    largest = Some(item);
                }
            }
        }
        if let Some(duration) = item.get("durationMs").and_then(Value::as_i64) {
            if duration >= 0
                && slowest
                    .and_then(|s| s.get("durationMs").and_then(Value::as_i64))
                    .map_or(true, |best| duration > best)
            {
                slowest = Some(item);
            }
        }
    }

    let pick_req = |item: &Value, kind: &str| -> Option<Value> {
        let url = trunc(item.get("url"), 240)?;
        let mut out = json!({"kind": kind, "url": url});
        for key in ["type", "status", "durationMs", "encodedDataLength", "ok"] {
            if let Some(value) = item.get(key) {
                if !value.is_null() {
                    out[key] = value.clone();
                }
            }
        }
        Some(out)
    };

    let mut resources = Map::new();
    if !snap.har_lite.is_empty() {
        resources.insert("harLiteCount".into(), json!(snap.har_lite.len()));
    }
    if failed_har > 0 {
        resources.insert("failed".into(), json!(failed_har));
    }
    if bytes_total > 0 {
        resources.insert("bytesApprox".into(), json!(bytes_total));
    }
    // Only truly notable samples make the cut.
    if let Some(slowest) = slowest {
        if slowest.get("durationMs").and_then(Value::as_i64).unwrap_or(0) >= 500 {
            if let Some(picked) = pick_req(slowest, "slowest") {
                resources.insert("slowest".into(), picked);
            }
        }
    }
    if let Some(largest) = largest {
        if largest
            .get("encodedDataLength")
            .and_then(Value::as_i64)
            .unwrap_or(0)
            >= 100_000
        {
            if let Some(picked) = pick_req(largest, "largest") {
                resources.insert("largest".into(), picked);
            }
        }
    }

    // Insights: 1-3 prioritized items.
    let mut insights: Vec<Value> = Vec::new();
    if snap.dialog_open {
        let dialog = snap.dialog.clone().unwrap_or(Value::Null);
        let message = trunc(dialog.get("message"), 200);
        let dtype = trunc(dialog.get("type"), 40);
        let text = match (&dtype, &message) {
            (Some(t), Some(m)) => format!("{t}: {m}"),
            (_, Some(m)) => m.clone(),
            (Some(t), _) => t.clone(),
            _ => "Dialog is open".to_string(),
        };
        insights.push(json!({"severity": "error", "kind": "dialog_open", "message": text}));
        final_obj["dialog"] = dialog;
    }
    if let Some(last_error) = &last_error {
        insights.push(json!({"severity": "error", "kind": "js_error", "message": last_error}));
    }
    if let Some(failed) = snap.network.iter().find(|ev| ev.get("url").is_some()) {
        if let Some(url) = trunc(failed.get("url"), 240) {
            let status = failed.get("status").and_then(Value::as_i64);
            let err_text = trunc(failed.get("errorText"), 120);
            let mut message = match status {
                Some(status) => format!("{status} {url}"),
                None => url,
            };
            if let Some(err_text) = err_text {
                message = format!("{message} ({err_text})");
            }
            let mut insight = json!({
                "severity": "error",
                "kind": "failed_request",
                "message": trunc(Some(&json!(message)), 240),
            });
            if let Some(status) = status {
                insight["status"] = json!(status);
            }
            insights.push(insight);
        }
    }
    if !insights
        .iter()
        .any(|i| i.get("kind").and_then(Value::as_str) == Some("failed_request"))
    {
        if let Some(slowest) = resources.get("slowest") {
            let message = format!(
                "{}ms {}",
                slowest.get("durationMs").and_then(Value::as_i64).unwrap_or(0),
                slowest.get("url").and_then(Value::as_str).unwrap_or("")
            );
            insights.push(json!({
                "severity": "warn",
                "kind": "slow_request",
                "message": trunc(Some(&json!(message)), 240),
            }));
        }
    }

    // Performance: best-effort, never under a dialog, tiny watchdog so
    // the flow end can never hang here.
    let mut perf = Map::new();
    if !snap.dialog_open {
        let watchdog = Watchdog::start(state.session.clone(), 1.2);
        let nav = state
            .session
            .eval_js(PERF_PROBE_JS, std::time::Duration::from_secs_f64(1.0))
            .await;
        if let Some(watchdog) = watchdog {
            watchdog.stop();
        }
        if let Ok(Value::Object(nav)) = nav {
            if let Some(timing_src) = nav.get("nav").and_then(Value::as_object) {
                let mut timing = Map::new();
                for (src, dst) in [
                    ("ttfb", "ttfb_ms"),
                    ("dcl", "domContentLoaded_ms"),
                    ("load", "load_ms"),
                ] {
                    if let Some(v) = timing_src.get(src).and_then(Value::as_f64) {
                        if v >= 0.0 {
                            timing.insert(dst.to_string(), json!(v.round() as i64));
                        }
                    }
                }
                if !timing.is_empty() {
                    perf.insert("timing".into(), Value::Object(timing));
                }
            }
            if let Some(long_tasks) = nav.get("longTasks").and_then(Value::as_object) {
                let mut lt = Map::new();
                if let Some(count) = long_tasks.get("count").and_then(Value::as_i64) {
                    if count > 0 {
                        lt.insert("count".into(), json!(count));
                    }
                }
                for (src, dst) in [("total", "total_ms"), ("max", "max_ms")] {
                    if let Some(v) = long_tasks.get(src).and_then(Value::as_f64) {
                        if v >= 0.0 {
                            lt.insert(dst.to_string(), json!(v.round() as i64));
                        }
                    }
                }
                if !lt.is_empty() {
                    perf.insert("longTasks".into(), Value::Object(lt));
                }
            }
        }
    }

    let signal = !counts.is_empty() || !insights.is_empty() || !resources.is_empty()
        || !perf.is_empty()
        || snap.dialog_open;
    if !counts.is_empty() {
        final_obj["summary"] = Value::Object(counts);
    }
    if !insights.is_empty() {
        insights.truncate(3);
        final_obj["insights"] = Value::Array(insights);
    }
    if !resources.is_empty() {
        final_obj["resources"] = Value::Object(resources);
    }
    if !perf.is_empty() {
        final_obj["performance"] = Value::Object(perf);
    }
    final_obj["signal"] = json!(signal);
}

const PERF_PROBE_JS: &str = "(() => {\
  try {\
    const out = {};\
    const e = (performance && performance.getEntriesByType) ? performance.getEntriesByType('navigation') : [];\
    const n = e && e.length ? e[0] : null;\
    if (n) {\
      out.nav = {\
        ttfb: n.responseStart - n.startTime,\
        dcl: n.domContentLoadedEventEnd - n.startTime,\
        load: n.loadEventEnd - n.startTime,\
      };\
    }\
    try {\
      const lt = (performance && performance.getEntriesByType) ? performance.getEntriesByType('longtask') : [];\
      if (lt && lt.length) {\
        const last = lt.slice(-50);\
        let total = 0;\
        let max = 0;\
        for (const x of last) {\
          const d = (x && typeof x.duration === 'number') ? x.duration : 0;\
          total += d;\
          if (d > max) max = d;\
        }\
        out.longTasks = { count: last.length, total, max };\
      }\
    } catch (e) {}\
    return out;\
  } catch (e) {}\
  return null;\
})()";

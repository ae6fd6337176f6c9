//! Page data tools: `js`, `screenshot`, `form`, `upload`, `storage`,
//! `cookies`, `captcha`, `totp`.

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use hmac::{Hmac, Mac};
use serde_json::{json, Value};
use sha1::Sha1;

use browsermcp_core_types::{ErrorKind, ToolError, ToolResult};
use browsermcp_registry::ToolCtx;

use super::support::{
    arg_bool, arg_f64, arg_str, args_obj, dialog_guard, eval_deadline, offload_large_text,
    page_session, COGNITIVE_BUDGET_CHARS,
};

pub async fn js(ctx: ToolCtx, args: Value) -> ToolResult {
    let args = args_obj(&args);
    let Some(code) = arg_str(&args, "code") else {
        return ToolResult::failure(
            ToolError::new(ErrorKind::Validation, "Missing code")
                .with_tool("js")
                .with_suggestion("Provide code='...JS expression...'"),
        );
    };
    let (session, tab_id) = match page_session(&ctx, "js").await {
        Ok(pair) => pair,
        Err(err) => return err,
    };
    if let Some(blocked) = dialog_guard(&ctx, &tab_id, "js") {
        return blocked;
    }

    let timeout_s = arg_f64(&args, "timeout", 10.0);
    match session.eval_js(code, eval_deadline(timeout_s)).await {
        Ok(result) => {
            let rendered = result.to_string();
            if rendered.len() > COGNITIVE_BUDGET_CHARS {
                let payload = offload_large_text(
                    &ctx,
                    "js_result",
                    rendered,
                    "application/json",
                    json!({"ok": true, "tool": "js"}),
                );
                return ToolResult::json(payload);
            }
            ToolResult::json(json!({"ok": true, "tool": "js", "result": result}))
        }
        Err(err) => ToolResult::failure(
            ToolError::new(
                if err.is_brick() {
                    ErrorKind::CdpBrick
                } else {
                    ErrorKind::ToolFailure
                },
                err.to_string(),
            )
            .with_tool("js"),
        ),
    }
}

pub async fn screenshot(ctx: ToolCtx, args: Value) -> ToolResult {
    let args = args_obj(&args);
    let (session, tab_id) = match page_session(&ctx, "screenshot").await {
        Ok(pair) => pair,
        Err(err) => return err,
    };
    if let Some(blocked) = dialog_guard(&ctx, &tab_id, "screenshot") {
        return blocked;
    }

    let data = match session.screenshot_b64().await {
        Ok(data) => data,
        Err(err) => {
            return ToolResult::failure(
                ToolError::new(ErrorKind::CdpBrick, err.to_string()).with_tool("screenshot"),
            );
        }
    };

    if arg_bool(&args, "store", false) {
        return match ctx
            .artifacts
            .put_image_b64("screenshot", &data, "image/png", json!({"tab": tab_id}))
        {
            Ok(reference) => ToolResult::json(json!({
                "ok": true,
                "tool": "screenshot",
                "artifact": {
                    "id": reference.id.clone(),
                    "mimeType": reference.mime_type.clone(),
                    "bytes": reference.bytes,
                },
                "next": [artifact_store::artifact_get_hint(&reference.id, 0, 4000)],
            })),
            Err(err) => ToolResult::failure(
                ToolError::new(ErrorKind::ToolFailure, err.to_string()).with_tool("screenshot"),
            ),
        };
    }

    ToolResult::image(data, "image/png")
}

pub async fn form(ctx: ToolCtx, args: Value) -> ToolResult {
    let args = args_obj(&args);
    let Some(fill) = args.get("fill").and_then(Value::as_object).cloned() else {
        return ToolResult::failure(
            ToolError::new(ErrorKind::Validation, "Missing fill")
                .with_tool("form")
                .with_suggestion("Provide fill={fieldKey: value, ...}"),
        );
    };
    let (session, tab_id) = match page_session(&ctx, "form").await {
        Ok(pair) => pair,
        Err(err) => return err,
    };
    if let Some(blocked) = dialog_guard(&ctx, &tab_id, "form") {
        return blocked;
    }

    let submit = arg_bool(&args, "submit", false);
    let scope = arg_str(&args, "selector");
    let fill_json = serde_json::to_string(&fill).unwrap_or_else(|_| "{}".into());
    let scope_json = serde_json::to_string(&scope).unwrap_or_else(|_| "null".into());
    let code = format!(
        r#"(() => {{
  const fill = {fill_json};
  const scope = {scope_json};
  const root = scope ? document.querySelector(scope) : document;
  if (!root) return {{error: 'Element not found'}};
  const norm = (s) => (s || '').replace(/[\s_-]+/g, '').toLowerCase();
  const fields = Array.from(root.querySelectorAll('input, textarea, select'));
  const labelFor = (el) => {{
    if (el.id) {{
      const label = document.querySelector('label[for="' + el.id + '"]');
      if (label) return label.innerText || '';
    }}
    const wrap = el.closest ? el.closest('label') : null;
    return wrap ? (wrap.innerText || '') : '';
  }};
  const filled = [];
  const missing = [];
  let form = null;
  for (const [key, value] of Object.entries(fill)) {{
    const want = norm(key);
    let hit = null;
    for (const el of fields) {{
      if (el.type === 'hidden' || el.disabled) continue;
      const hay = [el.name, el.id, el.placeholder, el.getAttribute('aria-label'), el.autocomplete, labelFor(el), el.type]
        .map(norm);
      if (hay.some((h) => h && (h === want || h.includes(want)))) {{ hit = el; break; }}
    }}
    if (!hit) {{ missing.push(key); continue; }}
    if (hit.tagName === 'SELECT') {{
      hit.value = value;
    }} else if (hit.type === 'checkbox' || hit.type === 'radio') {{
      hit.checked = !!value;
    }} else {{
      const setter = Object.getOwnPropertyDescriptor(window.HTMLInputElement.prototype, 'value');
      if (setter && setter.set && hit instanceof HTMLInputElement) setter.set.call(hit, String(value));
      else hit.value = String(value);
    }}
    hit.dispatchEvent(new Event('input', {{bubbles: true}}));
    hit.dispatchEvent(new Event('change', {{bubbles: true}}));
    filled.push(key);
    if (!form && hit.form) form = hit.form;
  }}
  let submitted = false;
  if ({submit} && form) {{
    form.requestSubmit ? form.requestSubmit() : form.submit();
    submitted = true;
  }}
  return {{filled, missing, submitted}};
}})()"#,
        submit = submit,
    );

    match session.eval_js(&code, Duration::from_secs(8)).await {
        Ok(result) => {
            if result.get("error").is_some() {
                return ToolResult::failure(
                    ToolError::new(ErrorKind::UiTransient, "Element not found").with_tool("form"),
                );
            }
            // Field keys only in the payload; values never echo back.
            ToolResult::json(json!({"ok": true, "tool": "form", "result": result}))
        }
        Err(err) => ToolResult::failure(
            ToolError::new(ErrorKind::CdpBrick, err.to_string()).with_tool("form"),
        ),
    }
}

pub async fn upload(ctx: ToolCtx, args: Value) -> ToolResult {
    let args = args_obj(&args);
    let Some(selector) = arg_str(&args, "selector") else {
        return ToolResult::failure(
            ToolError::new(ErrorKind::Validation, "Missing selector").with_tool("upload"),
        );
    };
    let files: Vec<String> = args
        .get("files")
        .and_then(Value::as_array)
        .map(|items| {
            items
                .iter()
                .filter_map(Value::as_str)
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default();
    if files.is_empty() {
        return ToolResult::failure(
            ToolError::new(ErrorKind::Validation, "Missing files")
                .with_tool("upload")
                .with_suggestion("Provide files=['/absolute/path', ...]"),
        );
    }
    for file in &files {
        if !std::path::Path::new(file).exists() {
            return ToolResult::failure(
                ToolError::new(ErrorKind::Validation, format!("File not found: {file}"))
                    .with_tool("upload"),
            );
        }
    }

    let (session, tab_id) = match page_session(&ctx, "upload").await {
        Ok(pair) => pair,
        Err(err) => return err,
    };
    if let Some(blocked) = dialog_guard(&ctx, &tab_id, "upload") {
        return blocked;
    }

    // DOM.setFileInputFiles needs a node id for the input.
    let doc = match session
        .send_with_deadline("DOM.getDocument", json!({"depth": 0}), Duration::from_secs(5))
        .await
    {
        Ok(doc) => doc,
        Err(err) => {
            return ToolResult::failure(
                ToolError::new(ErrorKind::CdpBrick, err.to_string()).with_tool("upload"),
            );
        }
    };
    let root_id = doc
        .pointer("/root/nodeId")
        .and_then(Value::as_i64)
        .unwrap_or(0);
    let node = session
        .send_with_deadline(
            "DOM.querySelector",
            json!({"nodeId": root_id, "selector": selector}),
            Duration::from_secs(5),
        )
        .await;
    let node_id = node
        .ok()
        .and_then(|n| n.get("nodeId").and_then(Value::as_i64))
        .unwrap_or(0);
    if node_id == 0 {
        return ToolResult::failure(
            ToolError::new(ErrorKind::UiTransient, format!("Element not found: {selector}"))
                .with_tool("upload"),
        );
    }

    let file_count = files.len();
    match session
        .send_with_deadline(
            "DOM.setFileInputFiles",
            json!({"nodeId": node_id, "files": files}),
            Duration::from_secs(10),
        )
        .await
    {
        Ok(_) => ToolResult::json(json!({"ok": true, "tool": "upload", "files": file_count})),
        Err(err) => ToolResult::failure(
            ToolError::new(ErrorKind::ToolFailure, err.to_string()).with_tool("upload"),
        ),
    }
}

pub async fn storage(ctx: ToolCtx, args: Value) -> ToolResult {
    let args = args_obj(&args);
    let action = arg_str(&args, "action").unwrap_or("list");
    let scope = match arg_str(&args, "scope").unwrap_or("local") {
        "session" => "sessionStorage",
        _ => "localStorage",
    };
    let (session, tab_id) = match page_session(&ctx, "storage").await {
        Ok(pair) => pair,
        Err(err) => return err,
    };
    if let Some(blocked) = dialog_guard(&ctx, &tab_id, "storage") {
        return blocked;
    }

    let code = match action {
        "get" => {
            let Some(key) = arg_str(&args, "key") else {
                return ToolResult::failure(
                    ToolError::new(ErrorKind::Validation, "Missing key").with_tool("storage"),
                );
            };
            let key = serde_json::to_string(key).unwrap_or_default();
            format!("({{value: {scope}.getItem({key})}})")
        }
        "set" => {
            let (Some(key), Some(value)) = (arg_str(&args, "key"), args.get("value")) else {
                return ToolResult::failure(
                    ToolError::new(ErrorKind::Validation, "Missing key/value").with_tool("storage"),
                );
            };
            let key = serde_json::to_string(key).unwrap_or_default();
            let value = serde_json::to_string(&value_to_string(value)).unwrap_or_default();
            format!("({scope}.setItem({key}, {value}), {{ok: true}})")
        }
        "remove" => {
            let Some(key) = arg_str(&args, "key") else {
                return ToolResult::failure(
                    ToolError::new(ErrorKind::Validation, "Missing key").with_tool("storage"),
                );
            };
            let key = serde_json::to_string(key).unwrap_or_default();
            format!("({scope}.removeItem({key}), {{ok: true}})")
        }
        "clear" => format!("({scope}.clear(), {{ok: true}})"),
        "list" => format!("Object.keys({scope})"),
        other => {
            return ToolResult::failure(
                ToolError::new(ErrorKind::Validation, format!("Unknown storage action: {other}"))
                    .with_tool("storage")
                    .with_suggestion("Use action='get'|'set'|'remove'|'clear'|'list'"),
            );
        }
    };

    match session.eval_js(&code, Duration::from_secs(5)).await {
        Ok(result) => ToolResult::json(json!({
            "ok": true,
            "tool": "storage",
            "action": action,
            "scope": scope,
            "result": result,
        })),
        Err(err) => ToolResult::failure(
            ToolError::new(ErrorKind::ToolFailure, err.to_string()).with_tool("storage"),
        ),
    }
}

fn value_to_string(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

pub async fn cookies(ctx: ToolCtx, args: Value) -> ToolResult {
    let args = args_obj(&args);
    let action = arg_str(&args, "action").unwrap_or("get");
    let (session, _tab_id) = match page_session(&ctx, "cookies").await {
        Ok(pair) => pair,
        Err(err) => return err,
    };

    match action {
        "get" => match session
            .send_with_deadline("Network.getCookies", json!({}), Duration::from_secs(5))
            .await
        {
            Ok(resp) => {
                let count = resp
                    .get("cookies")
                    .and_then(Value::as_array)
                    .map(Vec::len)
                    .unwrap_or(0);
                ToolResult::json(json!({
                    "ok": true,
                    "tool": "cookies",
                    "count": count,
                    "cookies": resp.get("cookies").cloned().unwrap_or(json!([])),
                }))
            }
            Err(err) => ToolResult::failure(
                ToolError::new(ErrorKind::ToolFailure, err.to_string()).with_tool("cookies"),
            ),
        },
        "set" => {
            let (Some(name), Some(value)) = (arg_str(&args, "name"), arg_str(&args, "value"))
            else {
                return ToolResult::failure(
                    ToolError::new(ErrorKind::Validation, "Missing name/value").with_tool("cookies"),
                );
            };
            let mut params = json!({"name": name, "value": value});
            for key in ["domain", "path", "url"] {
                if let Some(v) = arg_str(&args, key) {
                    params[key] = json!(v);
                }
            }
            if params.get("url").is_none() && params.get("domain").is_none() {
                params["url"] = json!(session.tab_url());
            }
            match session
                .send_with_deadline("Network.setCookie", params, Duration::from_secs(5))
                .await
            {
                Ok(resp) => ToolResult::json(json!({
                    "ok": true,
                    "tool": "cookies",
                    "set": resp.get("success").cloned().unwrap_or(json!(true)),
                })),
                Err(err) => ToolResult::failure(
                    ToolError::new(ErrorKind::ToolFailure, err.to_string()).with_tool("cookies"),
                ),
            }
        }
        "delete" => {
            let Some(name) = arg_str(&args, "name") else {
                return ToolResult::failure(
                    ToolError::new(ErrorKind::Validation, "Missing name").with_tool("cookies"),
                );
            };
            let mut params = json!({"name": name});
            if let Some(domain) = arg_str(&args, "domain") {
                params["domain"] = json!(domain);
            } else {
                params["url"] = json!(session.tab_url());
            }
            match session
                .send_with_deadline("Network.deleteCookies", params, Duration::from_secs(5))
                .await
            {
                Ok(_) => ToolResult::json(json!({"ok": true, "tool": "cookies", "deleted": name})),
                Err(err) => ToolResult::failure(
                    ToolError::new(ErrorKind::ToolFailure, err.to_string()).with_tool("cookies"),
                ),
            }
        }
        "clear" => match session
            .send_with_deadline("Network.clearBrowserCookies", json!({}), Duration::from_secs(5))
            .await
        {
            Ok(_) => ToolResult::json(json!({"ok": true, "tool": "cookies", "cleared": true})),
            Err(err) => ToolResult::failure(
                ToolError::new(ErrorKind::ToolFailure, err.to_string()).with_tool("cookies"),
            ),
        },
        other => ToolResult::failure(
            ToolError::new(ErrorKind::Validation, format!("Unknown cookies action: {other}"))
                .with_tool("cookies")
                .with_suggestion("Use action='get'|'set'|'delete'|'clear'"),
        ),
    }
}

pub async fn captcha(ctx: ToolCtx, args: Value) -> ToolResult {
    let args = args_obj(&args);
    let (session, tab_id) = match page_session(&ctx, "captcha").await {
        Ok(pair) => pair,
        Err(err) => return err,
    };
    if let Some(blocked) = dialog_guard(&ctx, &tab_id, "captcha") {
        return blocked;
    }

    let probe = r#"(() => {
  const hits = [];
  const sources = Array.from(document.querySelectorAll('iframe[src]')).map((f) => f.src);
  for (const src of sources) {
    if (/recaptcha/i.test(src)) hits.push('recaptcha');
    else if (/hcaptcha/i.test(src)) hits.push('hcaptcha');
    else if (/turnstile|challenges\.cloudflare/i.test(src)) hits.push('turnstile');
  }
  if (document.querySelector('.g-recaptcha, [data-sitekey]')) hits.push('widget');
  return {detected: hits.length > 0, kinds: Array.from(new Set(hits))};
})()"#;

    let detection = session
        .eval_js(probe, Duration::from_secs(5))
        .await
        .unwrap_or(json!({"detected": false}));
    let detected = detection
        .get("detected")
        .and_then(Value::as_bool)
        .unwrap_or(false);

    let mut payload = json!({"ok": true, "tool": "captcha", "result": detection});
    if detected && arg_bool(&args, "screenshot", true) {
        if let Ok(data) = session.screenshot_b64().await {
            if let Ok(reference) =
                ctx.artifacts
                    .put_image_b64("captcha_screenshot", &data, "image/png", json!({}))
            {
                payload["artifact"] = json!({"id": reference.id.clone(), "bytes": reference.bytes});
                payload["next"] =
                    json!([artifact_store::artifact_get_hint(&reference.id, 0, 4000)]);
            }
        }
        payload["suggestion"] =
            json!("Captcha present: hand control back to the user; this server never solves captchas");
    }
    ToolResult::json(payload)
}

type HmacSha1 = Hmac<Sha1>;

/// RFC 6238 TOTP. The secret never appears in the payload, notes, or logs.
pub async fn totp(_ctx: ToolCtx, args: Value) -> ToolResult {
    let args = args_obj(&args);
    let Some(secret) = arg_str(&args, "secret") else {
        return ToolResult::failure(
            ToolError::new(ErrorKind::Validation, "Missing secret")
                .with_tool("totp")
                .with_suggestion("Provide secret='BASE32...' (prefer {{mem:...}} placeholders)"),
        );
    };
    let digits = args
        .get("digits")
        .and_then(Value::as_u64)
        .unwrap_or(6)
        .clamp(6, 10) as u32;
    let period = args
        .get("period")
        .and_then(Value::as_u64)
        .unwrap_or(30)
        .clamp(15, 120);

    let Some(key) = base32_decode(secret) else {
        return ToolResult::failure(
            ToolError::new(ErrorKind::Validation, "Invalid base32 secret").with_tool("totp"),
        );
    };

    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0);
    let counter = now / period;
    let remaining = period - (now % period);

    let mut mac = match HmacSha1::new_from_slice(&key) {
        Ok(mac) => mac,
        Err(_) => {
            return ToolResult::failure(
                ToolError::new(ErrorKind::Validation, "Invalid base32 secret").with_tool("totp"),
            );
        }
    };
    mac.update(&counter.to_be_bytes());
    let digest = mac.finalize().into_bytes();
    let offset = (digest[digest.len() - 1] & 0x0f) as usize;
    let binary = ((u32::from(digest[offset]) & 0x7f) << 24)
        | (u32::from(digest[offset + 1]) << 16)
        | (u32::from(digest[offset + 2]) << 8)
        | u32::from(digest[offset + 3]);
    let code = binary % 10u32.pow(digits);

    ToolResult::json(json!({
        "ok": true,
        "tool": "totp",
        "code": format!("{code:0width$}", width = digits as usize),
        "secondsRemaining": remaining,
    }))
}

fn base32_decode(input: &str) -> Option<Vec<u8>> {
    const ALPHABET: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZ234567";
    let mut bits: u32 = 0;
    let mut bit_count = 0;
    let mut out = Vec::new();
    for c in input.chars() {
        if c == '=' || c == ' ' || c == '-' {
            continue;
        }
        let upper = c.to_ascii_uppercase() as u8;
        let value = ALPHABET.iter().position(|a| *a == upper)? as u32;
        bits = (bits << 5) | value;
        bit_count += 5;
        if bit_count >= 8 {
            bit_count -= 8;
            out.push((bits >> bit_count) as u8);
            bits &= (1 << bit_count) - 1;
        }
    }
    (!out.is_empty()).then_some(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn base32_decodes_rfc_vector() {
        // "12345678901234567890" in base32.
        let decoded = base32_decode("GEZDGNBVGY3TQOJQGEZDGNBVGY3TQOJQ").unwrap();
        assert_eq!(decoded, b"12345678901234567890");
        assert!(base32_decode("18@#").is_none());
    }

    #[tokio::test]
    async fn totp_generates_six_digit_codes() {
        let ctx = browsermcp_registry::test_ctx();
        let res = totp(
            ctx,
            json!({"secret": "GEZDGNBVGY3TQOJQGEZDGNBVGY3TQOJQ"}),
        )
        .await;
        assert!(!res.is_error);
        let payload = res.data.unwrap();
        let code = payload["code"].as_str().unwrap();
        assert_eq!(code.len(), 6);
        assert!(code.chars().all(|c| c.is_ascii_digit()));
        // The secret is never echoed.
        assert!(!payload.to_string().contains("GEZDGNBV"));
    }
}

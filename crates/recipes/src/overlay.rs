//! Overlay dismissal: viewport-center hit-test with a prioritized
//! close > reject > accept button scoring.
//!
//! The scoring table is data so it can be tuned without touching the
//! engine or the generated JS shape.

/// `(label regex, score)` rows, highest score wins. A candidate below the
/// accept threshold is never clicked.
pub const OVERLAY_BUTTON_SCORES: &[(&str, u32)] = &[
    (
        r"(close|dismiss|cancel|skip|later|not now|×|x\b|закры|отмен|пропус|позже|не сейчас)",
        100,
    ),
    (r"(reject|decline|deny|no\b|отклон|нет|запрет)", 60),
    (
        r"(accept|agree|ok|got it|continue|allow|yes|соглас|принять|ок|продолж|разреш|да)",
        25,
    ),
];

/// Minimum score a button must reach to be clicked at all.
pub const OVERLAY_MIN_SCORE: u32 = 25;

/// Build the dismiss-overlays probe. Evaluates to `null` (nothing to do)
/// or `{x, y, score, label}` for the best candidate button.
pub fn dismiss_overlays_js() -> String {
    let rows: Vec<String> = OVERLAY_BUTTON_SCORES
        .iter()
        .map(|(pattern, score)| format!("[/{}/i, {}]", pattern.replace('/', r"\/"), score))
        .collect();
    let table = rows.join(", ");
    format!(
        r#"(() => {{
  const vw = window.innerWidth || 0;
  const vh = window.innerHeight || 0;
  if (!vw || !vh) return null;
  const clamp = (v, lo, hi) => Math.max(lo, Math.min(hi, v));
  const within = (r) => r && r.width > 2 && r.height > 2 && r.right > 0 && r.bottom > 0 && r.left < vw && r.top < vh;
  const isVisible = (el) => {{
    try {{
      const st = window.getComputedStyle(el);
      if (!st || st.display === 'none' || st.visibility === 'hidden' || st.opacity === '0' || st.pointerEvents === 'none') return false;
    }} catch (e) {{}}
    const r = el.getBoundingClientRect && el.getBoundingClientRect();
    return !!(r && within(r));
  }};
  const looksLikeOverlay = (el) => {{
    if (!el || !el.getBoundingClientRect) return false;
    const r = el.getBoundingClientRect();
    if (!within(r)) return false;
    const area = Math.max(0, r.width) * Math.max(0, r.height);
    const vp = vw * vh;
    const coversCenter = (vw * 0.5 >= r.left && vw * 0.5 <= r.right && vh * 0.5 >= r.top && vh * 0.5 <= r.bottom);
    let pos = '';
    let z = 0;
    try {{
      const st = window.getComputedStyle(el);
      pos = String(st.position || '');
      z = Number.parseInt(String(st.zIndex || '0'), 10);
      if (!Number.isFinite(z)) z = 0;
    }} catch (e) {{}}
    const role = String(el.getAttribute ? el.getAttribute('role') || '' : '').toLowerCase();
    const ariaModal = String(el.getAttribute ? el.getAttribute('aria-modal') || '' : '').toLowerCase();
    const hint = (String(el.id || '') + ' ' + String(el.className || '')).toLowerCase();
    if (role === 'dialog' || role === 'alertdialog' || ariaModal === 'true') return coversCenter;
    if ((pos === 'fixed' || pos === 'sticky') && coversCenter && area >= vp * 0.25) return true;
    if (coversCenter && area >= vp * 0.35) return true;
    if (coversCenter && area >= vp * 0.20 && (hint.includes('modal') || hint.includes('dialog') || hint.includes('overlay') || hint.includes('backdrop') || hint.includes('consent') || hint.includes('cookie'))) return true;
    if (coversCenter && z >= 1000 && area >= vp * 0.15) return true;
    return false;
  }};
  let el = document.elementFromPoint(clamp(Math.floor(vw * 0.5), 1, vw - 2), clamp(Math.floor(vh * 0.5), 1, vh - 2));
  if (!el) return null;
  let overlay = null;
  for (let i = 0; i < 10 && el; i++) {{
    if (looksLikeOverlay(el) && isVisible(el)) {{ overlay = el; break; }}
    el = el.parentElement;
  }}
  if (!overlay) return null;
  const labelOf = (b) => {{
    const pick = (s) => String(s || '').replace(/\s+/g, ' ').trim();
    const aria = pick(b.getAttribute ? b.getAttribute('aria-label') : '');
    const title = pick(b.getAttribute ? b.getAttribute('title') : '');
    const txt = pick(b.innerText || b.textContent || '');
    return (aria || title || txt).slice(0, 120);
  }};
  const scores = [{table}];
  const score = (label, hint) => {{
    const s = (String(label || '') + ' ' + String(hint || '')).toLowerCase();
    for (const [re, value] of scores) {{
      if (re.test(s)) return value;
    }}
    return 0;
  }};
  const nodes = overlay.querySelectorAll('button,[role="button"],a,input[type="button"],input[type="submit"],div[role="button"],span[role="button"]');
  let best = null;
  let bestScore = 0;
  for (const b of nodes) {{
    if (!b || !isVisible(b)) continue;
    const r = b.getBoundingClientRect ? b.getBoundingClientRect() : null;
    if (!within(r)) continue;
    const label = labelOf(b);
    const hint = (String(b.getAttribute ? b.getAttribute('data-testid') || '' : '') + ' ' + String(b.id || '') + ' ' + String(b.className || '')).slice(0, 200);
    const sc = score(label, hint);
    if (sc > bestScore) {{ bestScore = sc; best = b; }}
  }}
  if (!best || bestScore < {min_score}) return null;
  const r = best.getBoundingClientRect();
  return {{
    x: clamp(r.left + r.width * 0.5, 5, vw - 5),
    y: clamp(r.top + r.height * 0.5, 5, vh - 5),
    score: bestScore,
    label: labelOf(best) || null,
  }};
}})()"#,
        table = table,
        min_score = OVERLAY_MIN_SCORE,
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn js_embeds_the_scoring_table() {
        let js = dismiss_overlays_js();
        assert!(js.contains("close|dismiss"));
        assert!(js.contains("100"));
        assert!(js.contains("elementFromPoint"));
        // Min score appears as the clicked-at-all threshold.
        assert!(js.contains(&format!("bestScore < {OVERLAY_MIN_SCORE}")));
    }
}

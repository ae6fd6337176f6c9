//! Internal actions: `assert`, `when`, `repeat`, `macro`, and `act`
//! resolution. These are handled by the engine itself; `when`/`repeat`/
//! `macro` mutate the step queue by splicing immediately after the
//! current index, so ordering is preserved without a second scheduler.

use std::time::{SystemTime, UNIX_EPOCH};

use serde_json::{json, Map, Value};

use crate::conditions::condition_check;
use crate::engine::RunState;
use crate::types::StepMeta;
use crate::watchdog::step_timeout_seconds;
use crate::{MAX_INCLUDE_DEPTH, MAX_TOTAL_STEPS};

pub(crate) struct InternalOutcome {
    pub should_break: bool,
}

fn mono_secs() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0)
}

impl RunState<'_> {
    /// Record a failed internal-action entry; optional steps absorb the
    /// failure, everything else honors stop_on_error.
    fn fail_internal(&mut self, i: usize, tool: &str, mut entry: Value, meta: &StepMeta) -> bool {
        if meta.optional {
            entry["optional"] = json!(true);
            self.summaries.push(entry);
            return false;
        }
        let error = entry
            .get("error")
            .and_then(Value::as_str)
            .unwrap_or("error")
            .to_string();
        self.note_first_error(i, Some(tool), &error);
        self.summaries.push(entry);
        self.opts.stop_on_error
    }

    async fn check(&mut self, cond: &Value, timeout_s: f64) -> crate::conditions::ConditionOutcome {
        let registry = self.registry.clone();
        let session = self.session.clone();
        condition_check(cond, timeout_s, true, &registry, self.ctx, &session).await
    }
}

pub(crate) async fn handle_internal(
    state: &mut RunState<'_>,
    i: usize,
    tool: &str,
    args: &Map<String, Value>,
    args_note: &Map<String, Value>,
    meta: &StepMeta,
    steps_raw: &mut Vec<Value>,
) -> InternalOutcome {
    let should_break = match tool {
        "assert" => handle_assert(state, i, args, meta).await,
        "when" => handle_when(state, i, args, meta, steps_raw).await,
        "repeat" => handle_repeat(state, i, args, meta, steps_raw).await,
        "macro" => handle_macro(state, i, args, args_note, meta, steps_raw).await,
        _ => false,
    };
    InternalOutcome { should_break }
}

// ── assert ──────────────────────────────────────────────────────────

async fn handle_assert(
    state: &mut RunState<'_>,
    i: usize,
    args: &Map<String, Value>,
    meta: &StepMeta,
) -> bool {
    let timeout_s = args
        .get("timeout_s")
        .and_then(Value::as_f64)
        .unwrap_or(5.0)
        .clamp(0.0, 60.0);

    let outcome = state.check(&Value::Object(args.clone()), timeout_s).await;
    let ok = outcome.matched && outcome.error.is_none();

    let mut entry = json!({"i": i, "tool": "assert", "ok": ok});
    if !outcome.details.is_empty() {
        entry["details"] = Value::Object(outcome.details.clone());
    }
    if timeout_s > 0.0 {
        entry["note"] = json!(format!("timeout_s={timeout_s}"));
    }
    if ok {
        state.summaries.push(entry);
        return false;
    }

    entry["error"] = json!(outcome
        .error
        .as_deref()
        .unwrap_or("Assertion failed"));
    entry["suggestion"] = json!(outcome.suggestion.as_deref().unwrap_or(
        "Check conditions (url/title/selector/text) or increase timeout_s"
    ));
    state.fail_internal(i, "assert", entry, meta)
}

// ── when ────────────────────────────────────────────────────────────

async fn handle_when(
    state: &mut RunState<'_>,
    i: usize,
    args: &Map<String, Value>,
    meta: &StepMeta,
    steps_raw: &mut Vec<Value>,
) -> bool {
    let timeout_s = args
        .get("timeout_s")
        .and_then(Value::as_f64)
        .unwrap_or(state.opts.timeouts.condition_timeout_s)
        .clamp(0.0, 10.0);

    let cond = args.get("if").cloned().unwrap_or(json!({}));
    let outcome = state.check(&cond, timeout_s).await;

    if let Some(error) = &outcome.error {
        let mut entry = json!({"i": i, "tool": "when", "ok": false, "error": error});
        if !outcome.details.is_empty() {
            entry["details"] = Value::Object(outcome.details);
        }
        if let Some(suggestion) = &outcome.suggestion {
            entry["suggestion"] = json!(suggestion);
        }
        return state.fail_internal(i, "when", entry, meta);
    }

    let branch = if outcome.matched { "then" } else { "else" };
    let chosen: Vec<Value> = args
        .get(branch)
        .and_then(Value::as_array)
        .map(|items| items.iter().filter(|s| s.is_object()).cloned().collect())
        .unwrap_or_default();

    if chosen.len() > 50 {
        let entry = json!({
            "i": i, "tool": "when", "ok": false,
            "error": "Branch too large",
            "details": {"branch": branch, "steps": chosen.len(), "max": 50},
            "suggestion": "Reduce then/else size or split into multiple runs",
        });
        return state.fail_internal(i, "when", entry, meta);
    }

    let mut entry = json!({"i": i, "tool": "when", "ok": true, "branch": branch});
    if !outcome.details.is_empty() {
        entry["details"] = Value::Object(outcome.details);
    }
    state.summaries.push(entry);

    if !chosen.is_empty() {
        splice_after(steps_raw, i, chosen);
    }
    false
}

// ── repeat ──────────────────────────────────────────────────────────

struct RepeatBackoff {
    backoff_s: f64,
    backoff_factor: f64,
    backoff_max_s: f64,
    backoff_jitter: f64,
    jitter_seed: u32,
}

fn repeat_backoff(state: &RunState<'_>, args: &Map<String, Value>) -> RepeatBackoff {
    let defaults = &state.opts.timeouts.repeat;
    let get = |key: &str, default: f64| -> f64 {
        args.get(key).and_then(Value::as_f64).unwrap_or(default)
    };

    let backoff_s = get("backoff_s", defaults.backoff_s).clamp(0.0, 30.0);
    let mut backoff_factor = get("backoff_factor", defaults.backoff_factor);
    if backoff_factor <= 0.0 {
        backoff_factor = 1.0;
    }
    let mut backoff_max_s = get("backoff_max_s", defaults.backoff_max_s);
    if backoff_max_s <= 0.0 {
        backoff_max_s = backoff_s;
    }
    backoff_max_s = backoff_max_s.clamp(0.0, 60.0);
    let backoff_jitter = get("backoff_jitter", defaults.backoff_jitter).clamp(0.0, 1.0);
    let jitter_seed = args
        .get("jitter_seed")
        .and_then(Value::as_u64)
        .map(|v| v as u32)
        .unwrap_or(defaults.jitter_seed);

    RepeatBackoff {
        backoff_s,
        backoff_factor,
        backoff_max_s,
        backoff_jitter,
        jitter_seed,
    }
}

/// Deterministic backoff delay for iteration `iter_done` of step `i`.
/// Jitter is a seeded xorshift mapped to [-jitter, +jitter]; no RNG, so
/// replays are reproducible.
fn repeat_delay_s(backoff: &RepeatBackoff, i: usize, iter_done: u32) -> f64 {
    if backoff.backoff_s <= 0.0 || iter_done == 0 {
        return 0.0;
    }
    let mut delay = backoff.backoff_s * backoff.backoff_factor.powi(iter_done.saturating_sub(1) as i32);

    if backoff.backoff_jitter > 0.0 && delay > 0.0 {
        let mut x: u32 = backoff.jitter_seed
            ^ (i as u32).wrapping_mul(0x9E37_79B1)
            ^ iter_done.wrapping_mul(0x85EB_CA6B);
        x ^= x << 13;
        x ^= x >> 17;
        x ^= x << 5;
        let uniform = f64::from(x) / f64::from(u32::MAX);
        let jitter = (uniform * 2.0 - 1.0) * backoff.backoff_jitter;
        delay = (delay * (1.0 + jitter)).max(0.0);
    }

    if backoff.backoff_max_s > 0.0 {
        delay = delay.min(backoff.backoff_max_s);
    }
    delay
}

async fn handle_repeat(
    state: &mut RunState<'_>,
    i: usize,
    args: &Map<String, Value>,
    meta: &StepMeta,
    steps_raw: &mut Vec<Value>,
) -> bool {
    let max_iters = args
        .get("max_iters")
        .and_then(Value::as_i64)
        .unwrap_or(5);
    if max_iters < 1 {
        let entry = json!({
            "i": i, "tool": "repeat", "ok": false,
            "error": "Invalid max_iters",
            "details": {"max_iters": max_iters},
            "suggestion": "Use max_iters >= 1",
        });
        return state.fail_internal(i, "repeat", entry, meta);
    }
    if max_iters > 50 {
        let entry = json!({
            "i": i, "tool": "repeat", "ok": false,
            "error": "max_iters too large",
            "details": {"max_iters": max_iters, "max": 50},
            "suggestion": "Reduce max_iters (hard cap is 50) or split into multiple runs",
        });
        return state.fail_internal(i, "repeat", entry, meta);
    }
    let max_iters = max_iters as u32;

    let iter_done = args
        .get("__iter")
        .and_then(Value::as_i64)
        .unwrap_or(0)
        .max(0) as u32;

    let Some(body) = args.get("steps").and_then(Value::as_array) else {
        let entry = json!({
            "i": i, "tool": "repeat", "ok": false,
            "error": "Missing steps",
            "suggestion": "Provide repeat.steps=[{click:{...}}, {scroll:{...}}, ...]",
        });
        return state.fail_internal(i, "repeat", entry, meta);
    };
    let body_steps: Vec<Value> = body.iter().filter(|s| s.is_object()).cloned().collect();
    if body_steps.len() != body.len() {
        let entry = json!({
            "i": i, "tool": "repeat", "ok": false,
            "error": "Invalid step list (non-object entries)",
            "suggestion": "Ensure every step is an object like {click:{...}} or {tool:'click', args:{...}}",
        });
        return state.fail_internal(i, "repeat", entry, meta);
    }
    if body_steps.is_empty() {
        let entry = json!({
            "i": i, "tool": "repeat", "ok": false,
            "error": "Empty step list",
            "suggestion": "Provide repeat.steps with at least one step",
        });
        return state.fail_internal(i, "repeat", entry, meta);
    }
    if body_steps.len() > 25 {
        let entry = json!({
            "i": i, "tool": "repeat", "ok": false,
            "error": "Body too large",
            "details": {"steps": body_steps.len(), "max": 25},
            "suggestion": "Reduce repeat.steps size or use macros to keep it compact",
        });
        return state.fail_internal(i, "repeat", entry, meta);
    }
    if (max_iters as usize) * body_steps.len() > 400 {
        let entry = json!({
            "i": i, "tool": "repeat", "ok": false,
            "error": "Repeat too large",
            "details": {"max_iters": max_iters, "steps": body_steps.len(), "max_total": 400},
            "suggestion": "Reduce max_iters or body size, or split into multiple runs",
        });
        return state.fail_internal(i, "repeat", entry, meta);
    }

    let until = args.get("until").cloned();
    let timeout_s = args
        .get("timeout_s")
        .and_then(Value::as_f64)
        .unwrap_or(state.opts.timeouts.condition_timeout_s)
        .clamp(0.0, 10.0);
    let max_time_s = args
        .get("max_time_s")
        .and_then(Value::as_f64)
        .unwrap_or(0.0)
        .clamp(0.0, 300.0);

    // Time origin travels through the re-injected spec as __t0.
    let t0 = if max_time_s > 0.0 {
        Some(
            args.get("__t0")
                .and_then(Value::as_f64)
                .unwrap_or_else(mono_secs),
        )
    } else {
        None
    };
    let elapsed_s = t0.map(|t0| (mono_secs() - t0).max(0.0));

    let mut details: Option<Map<String, Value>> = None;
    if let Some(until) = &until {
        if !until.is_object() {
            let entry = json!({
                "i": i, "tool": "repeat", "ok": false,
                "error": "Invalid condition",
                "suggestion": "Provide until={url/title/selector/text}",
            });
            return state.fail_internal(i, "repeat", entry, meta);
        }

        let outcome = state.check(until, timeout_s).await;
        if let Some(error) = &outcome.error {
            let mut entry = json!({"i": i, "tool": "repeat", "ok": false, "error": error});
            if !outcome.details.is_empty() {
                entry["details"] = Value::Object(outcome.details);
            }
            if let Some(suggestion) = &outcome.suggestion {
                entry["suggestion"] = json!(suggestion);
            }
            return state.fail_internal(i, "repeat", entry, meta);
        }
        details = Some(outcome.details.clone());

        if outcome.matched {
            let mut entry = json!({"i": i, "tool": "repeat", "ok": true, "done": true, "iters": iter_done});
            if !outcome.details.is_empty() {
                entry["details"] = Value::Object(outcome.details);
            }
            state.summaries.push(entry);
            return false;
        }

        if iter_done >= max_iters {
            let mut last = json!({"iters": iter_done, "max_iters": max_iters});
            if let Some(details) = &details {
                if !details.is_empty() {
                    last["last"] = Value::Object(details.clone());
                }
            }
            let entry = json!({
                "i": i, "tool": "repeat", "ok": false,
                "error": "Repeat exhausted",
                "details": last,
                "suggestion": "Increase max_iters, adjust until condition, or split into multiple runs",
            });
            return state.fail_internal(i, "repeat", entry, meta);
        }
    } else if iter_done >= max_iters {
        state
            .summaries
            .push(json!({"i": i, "tool": "repeat", "ok": true, "done": true, "iters": iter_done}));
        return false;
    }

    if let (Some(elapsed), true) = (elapsed_s, max_time_s > 0.0) {
        if elapsed > max_time_s {
            let entry = json!({
                "i": i, "tool": "repeat", "ok": false,
                "error": "Repeat time budget exhausted",
                "details": {
                    "elapsed_s": elapsed,
                    "max_time_s": max_time_s,
                    "iters": iter_done,
                    "max_iters": max_iters,
                },
                "suggestion": "Increase max_time_s, reduce work per iteration, or split into multiple runs",
            });
            return state.fail_internal(i, "repeat", entry, meta);
        }
    }

    // Backoff sleep between iterations, clamped by the remaining time
    // budget and the step watchdog slack.
    let backoff = repeat_backoff(state, args);
    let mut delay_s = repeat_delay_s(&backoff, i, iter_done);
    if max_time_s > 0.0 {
        if let Some(elapsed) = elapsed_s {
            delay_s = delay_s.min((max_time_s - elapsed).max(0.0));
        }
    }
    let watchdog_budget = step_timeout_seconds(state.opts.action_timeout_s, args);
    delay_s = delay_s.min((watchdog_budget - 0.1).max(0.0));
    let slept = if delay_s > 0.0 {
        tokio::time::sleep(std::time::Duration::from_secs_f64(delay_s)).await;
        Some(delay_s)
    } else {
        None
    };

    let mut entry = json!({
        "i": i, "tool": "repeat", "ok": true,
        "iter": iter_done,
        "max_iters": max_iters,
        "until": until.is_some(),
    });
    if let Some(details) = details.filter(|d| !d.is_empty()) {
        entry["details"] = Value::Object(details);
    }
    if let Some(slept) = slept {
        entry["sleep_s"] = json!(slept);
    }
    if max_time_s > 0.0 {
        if let Some(elapsed) = elapsed_s {
            entry["time"] = json!({"elapsed_s": elapsed, "max_time_s": max_time_s});
        }
    }
    state.summaries.push(entry);

    // Self-injecting continuation: body copies, then the repeat itself
    // with the iteration bumped.
    let mut next_spec = args.clone();
    next_spec.insert("__iter".into(), json!(iter_done + 1));
    if let Some(t0) = t0 {
        next_spec.insert("__t0".into(), json!(t0));
    }
    let mut inject = body_steps;
    inject.push(json!({"repeat": next_spec}));
    splice_after(steps_raw, i, inject);
    false
}

// ── macro ───────────────────────────────────────────────────────────

async fn handle_macro(
    state: &mut RunState<'_>,
    i: usize,
    args: &Map<String, Value>,
    args_note: &Map<String, Value>,
    meta: &StepMeta,
    steps_raw: &mut Vec<Value>,
) -> bool {
    let name = args.get("name").and_then(Value::as_str).unwrap_or("");
    let macro_args = args.get("args").cloned().unwrap_or(json!({}));
    let macro_args_note = args_note.get("args").cloned().unwrap_or(json!({}));
    let dry_run = args.get("dry_run").and_then(Value::as_bool).unwrap_or(false);

    let expansion = recipes::expand_macro(
        name,
        &macro_args,
        &macro_args_note,
        dry_run,
        recipes::DEFAULT_MAX_STEPS,
        &state.ctx.memory,
    );

    let expansion = match expansion {
        Ok(expansion) => expansion,
        Err(err) => {
            let mut entry = json!({"i": i, "tool": "macro", "ok": false, "error": err.message});
            if let Some(suggestion) = &err.suggestion {
                entry["suggestion"] = json!(suggestion);
            }
            if let Some(details) = &err.details {
                entry["details"] = details.clone();
            }
            return state.fail_internal(i, "macro", entry, meta);
        }
    };

    let steps_total = expansion.steps_total();
    let mut entry = json!({
        "i": i, "tool": "macro", "ok": true,
        "name": expansion.name.clone(),
        "dry_run": dry_run,
        "plan": expansion.plan.clone(),
        "steps_total": steps_total,
    });

    if dry_run {
        state.summaries.push(entry);
        return false;
    }

    let mut gen_steps = expansion.steps;
    if !gen_steps.is_empty() {
        // include_memory_steps needs recursion bookkeeping: detect cycles
        // and bound the nesting depth before splicing.
        let include_key = if expansion.name == "include_memory_steps" {
            macro_args
                .get("memory_key")
                .and_then(Value::as_str)
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(str::to_string)
        } else {
            None
        };

        if let Some(key) = include_key {
            if state.include_stack.contains(&key) {
                entry = json!({
                    "i": i, "tool": "macro", "ok": false,
                    "error": "Recursive include_memory_steps detected",
                    "details": {"name": "include_memory_steps", "memory_key": key},
                    "suggestion": "Avoid including a runbook that (directly or indirectly) includes itself",
                });
                return state.fail_internal(i, "macro", entry, meta);
            }
            if state.include_stack.len() >= MAX_INCLUDE_DEPTH {
                entry = json!({
                    "i": i, "tool": "macro", "ok": false,
                    "error": "Macro nesting too deep",
                    "details": {
                        "name": "include_memory_steps",
                        "depth": state.include_stack.len(),
                        "max_depth": MAX_INCLUDE_DEPTH,
                    },
                    "suggestion": "Reduce nested include_memory_steps usage or split into multiple runs",
                });
                return state.fail_internal(i, "macro", entry, meta);
            }
            state.include_stack.push(key.clone());
            gen_steps.push(json!({"__macro_end": {"memory_key": key}}));
        }

        state.summaries.push(entry);
        splice_after(steps_raw, i, gen_steps);

        if steps_raw.len() > MAX_TOTAL_STEPS {
            state.summaries.push(json!({
                "i": i, "tool": "macro", "ok": false,
                "error": "Expanded step list too large",
                "details": {"steps": steps_raw.len(), "max_total_steps": MAX_TOTAL_STEPS},
                "suggestion": "Reduce macro nesting/runbook size, or split into multiple runs",
            }));
            state.note_first_error(i, Some("macro"), "Expanded step list too large");
            return true;
        }
        return false;
    }

    state.summaries.push(entry);
    false
}

fn splice_after(steps_raw: &mut Vec<Value>, i: usize, inject: Vec<Value>) {
    let at = (i + 1).min(steps_raw.len());
    steps_raw.splice(at..at, inject);
}

// ── act ─────────────────────────────────────────────────────────────

pub(crate) struct ResolvedAct {
    pub tool: String,
    pub args: Map<String, Value>,
    pub info: Value,
}

/// Resolve `act` into a concrete `{tool, args}` via the affordance
/// registry. On a miss or stale map (URL mismatch), refreshes affordances
/// once through `page(detail=locators)` (never while a dialog is open)
/// and then retries the same resolver mode.
pub(crate) async fn resolve_act(
    state: &mut RunState<'_>,
    i: usize,
    args: &Map<String, Value>,
) -> Result<ResolvedAct, Value> {
    let act_ref = args.get("ref").and_then(Value::as_str).map(str::to_string);
    let act_label = args.get("label").and_then(Value::as_str).map(str::to_string);
    let act_kind_raw = args.get("kind").and_then(Value::as_str).map(str::to_string);
    let act_index = args
        .get("index")
        .and_then(Value::as_i64)
        .and_then(|v| usize::try_from(v).ok());

    let kind = match act_kind_raw.as_deref().map(|k| k.trim().to_ascii_lowercase()) {
        None => None,
        Some(k) if k.is_empty() || k == "all" => None,
        Some(k) if matches!(k.as_str(), "button" | "link" | "input") => Some(k),
        Some(_) => {
            return Err(json!({
                "i": i, "tool": "act", "ok": false,
                "error": "Invalid act kind",
                "details": {"kind": act_kind_raw},
                "suggestion": "Use kind in {button, link, input} (or omit it)",
            }));
        }
    };

    let tab_id = state.tab_id.clone();
    let by_ref = act_ref.as_deref().map(|r| r.starts_with("aff:")).unwrap_or(false);
    let by_label = act_label.as_deref().map(|l| !l.trim().is_empty()).unwrap_or(false);

    let mut current_ref = act_ref.clone();
    let mut stale = false;
    let mut healed = false;

    fn resolve_once(
        state: &RunState<'_>,
        tab_id: &str,
        by_ref: bool,
        by_label: bool,
        reference: Option<&str>,
        label: Option<&str>,
        kind: Option<&str>,
        index: Option<usize>,
    ) -> (
        Option<session_center::AffordanceItem>,
        Option<session_center::AffordanceState>,
        Vec<session_center::LabelMatch>,
    ) {
        if by_ref {
            let (item, st) = state
                .ctx
                .sessions
                .resolve_affordance(tab_id, reference.unwrap_or(""));
            (item, st, Vec::new())
        } else if by_label {
            state
                .ctx
                .sessions
                .resolve_affordance_by_label(tab_id, label.unwrap_or(""), kind, index, 10)
        } else {
            (None, None, Vec::new())
        }
    }

    let (mut resolved, mut map_state, mut matches) = resolve_once(
        state,
        &tab_id,
        by_ref,
        by_label,
        current_ref.as_deref(),
        act_label.as_deref(),
        kind.as_deref(),
        act_index,
    );
    if let Some(item) = &resolved {
        current_ref = Some(item.ref_id.clone());
    }

    // Staleness: stored map belongs to a different URL.
    if state.opts.auto_affordances {
        if let Some(map_state) = &map_state {
            if !map_state.url.is_empty() {
                if let Some(current_url) = state.current_tab_url() {
                    if current_url != map_state.url {
                        stale = true;
                        resolved = None;
                    }
                }
            }
        }
    }

    if resolved.is_none() && state.opts.auto_affordances {
        // Self-heal: refs are stable hashes, so a successful re-resolve
        // still points at the same semantic action. Skip entirely when a
        // dialog is open (locators would hang in Runtime.evaluate).
        state.drain_ingest();
        if !state.dialog_open() {
            let timeout_s = state.opts.action_timeout_s.min(10.0);
            let _ = state
                .dispatch_guarded("page", json!({"detail": "locators", "limit": 80}), timeout_s)
                .await;

            let (item, st, m) = resolve_once(
                state,
                &tab_id,
                by_ref,
                by_label,
                current_ref.as_deref(),
                act_label.as_deref(),
                kind.as_deref(),
                act_index,
            );
            if !m.is_empty() {
                matches = m;
            }
            if let Some(item) = item {
                current_ref = Some(item.ref_id.clone());
                resolved = Some(item);
                map_state = st;
                healed = true;
            } else if st.is_some() {
                map_state = st;
            }
        }
    }

    let Some(item) = resolved else {
        // Label mode surfaces bounded ambiguity/miss details.
        if by_label && !matches.is_empty() {
            let previews: Vec<Value> = matches
                .iter()
                .take(5)
                .map(|m| serde_json::to_value(m).unwrap_or(Value::Null))
                .collect();
            let mut details = json!({
                "label": act_label.as_deref().unwrap_or("").split_whitespace().collect::<Vec<_>>().join(" "),
                "matches": previews,
            });
            if let Some(kind) = &kind {
                details["kind"] = json!(kind);
            }
            if let Some(map_state) = &map_state {
                details["knownCount"] = json!(map_state.count);
                details["url"] = json!(map_state.url);
            }
            let (error, suggestion) = if act_index.is_none() {
                (
                    "Ambiguous affordance label",
                    "Provide index (0-based) or use page(detail='map') to pick a ref",
                )
            } else {
                (
                    "Affordance label index out of range",
                    "Fix index (0-based) or use page(detail='map') to pick a ref",
                )
            };
            return Err(json!({
                "i": i, "tool": "act", "ok": false,
                "error": error,
                "details": details,
                "suggestion": suggestion,
            }));
        }

        let mut details = json!({"ref": act_ref});
        if let Some(map_state) = &map_state {
            details["knownCount"] = json!(map_state.count);
            details["url"] = json!(map_state.url);
        }
        return Err(json!({
            "i": i, "tool": "act", "ok": false,
            "error": "Unknown or stale affordance ref",
            "details": details,
            "suggestion": "Call page(detail='map') or page(detail='locators') to refresh affordances, then retry act(ref=...)",
        }));
    };

    if item.tool.is_empty() {
        return Err(json!({"i": i, "tool": "act", "ok": false, "error": "Invalid affordance spec"}));
    }

    let mut info = json!({});
    if let Some(current_ref) = current_ref {
        info["ref"] = json!(current_ref);
    }
    if stale {
        info["stale"] = json!(true);
    }
    if healed {
        info["healed"] = json!(true);
    }

    Ok(ResolvedAct {
        tool: item.tool.clone(),
        args: item.args.as_object().cloned().unwrap_or_default(),
        info,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn jitter_is_deterministic_and_bounded() {
        let backoff = RepeatBackoff {
            backoff_s: 1.0,
            backoff_factor: 2.0,
            backoff_max_s: 10.0,
            backoff_jitter: 0.2,
            jitter_seed: 42,
        };
        let a = repeat_delay_s(&backoff, 3, 2);
        let b = repeat_delay_s(&backoff, 3, 2);
        assert_eq!(a, b, "same seed + indices = same delay");
        // Base delay for iter 2 is 2.0s; jitter keeps it within ±20%.
        assert!((1.6..=2.4).contains(&a), "delay {a} outside jitter band");

        // First iteration never sleeps.
        assert_eq!(repeat_delay_s(&backoff, 3, 0), 0.0);
    }

    #[test]
    fn backoff_respects_max() {
        let backoff = RepeatBackoff {
            backoff_s: 1.0,
            backoff_factor: 10.0,
            backoff_max_s: 3.0,
            backoff_jitter: 0.0,
            jitter_seed: 0,
        };
        assert_eq!(repeat_delay_s(&backoff, 0, 5), 3.0);
    }

    #[test]
    fn splice_inserts_immediately_after_index() {
        let mut steps = vec![json!({"a": {}}), json!({"b": {}}), json!({"c": {}})];
        splice_after(&mut steps, 0, vec![json!({"x": {}}), json!({"y": {}})]);
        let keys: Vec<String> = steps
            .iter()
            .map(|s| s.as_object().unwrap().keys().next().unwrap().clone())
            .collect();
        assert_eq!(keys, vec!["a", "x", "y", "b", "c"]);
    }
}

//! Reliability policy: run-level UX heuristics.
//!
//! `heuristic_level` picks safer defaults (0 = minimal, 1 = balanced,
//! 2 = robust, 3 = diagnostic). `strict_params=true` turns coercion
//! failures into hard errors; otherwise invalid values warn and fall back
//! to the level defaults.

use serde_json::{json, Map, Value};

#[derive(Clone, Debug)]
pub struct ReliabilityPolicy {
    pub level: u8,
    pub strict_params: bool,
    pub applied: Map<String, Value>,
}

fn level_defaults(level: u8) -> Map<String, Value> {
    let value = match level {
        0 => json!({
            "auto_dialog": "off",
            "auto_recover": false,
            "max_recoveries": 0,
            "auto_tab": false,
            "auto_affordances": false,
            "proof": false,
            "screenshot_on_ambiguity": false,
        }),
        2 => json!({
            "auto_dialog": "auto",
            "auto_recover": true,
            "max_recoveries": 2,
            "auto_tab": true,
            "auto_affordances": true,
            "proof": true,
            "screenshot_on_ambiguity": true,
        }),
        3 => json!({
            "auto_dialog": "auto",
            "auto_recover": true,
            "max_recoveries": 3,
            "auto_tab": true,
            "auto_affordances": true,
            "proof": true,
            "screenshot_on_ambiguity": true,
            "report": "diagnostics",
            "actions_output": "errors",
        }),
        _ => json!({}),
    };
    match value {
        Value::Object(map) => map,
        _ => Map::new(),
    }
}

const BOOLISH_KEYS: &[&str] = &[
    "auto_recover",
    "auto_tab",
    "auto_affordances",
    "proof",
    "screenshot_on_ambiguity",
    "delta_report",
    "delta_final",
    "stop_on_error",
    "confirm_irreversible",
    "auto_download",
    "screenshot_on_error",
    "with_screenshot",
    "triage_on_error",
    "diagnostics_on_error",
    "step_proof",
];

const ENUM_KEYS: &[(&str, &[&str])] = &[
    ("auto_dialog", &["auto", "off", "dismiss", "accept"]),
    (
        "report",
        &["none", "observe", "audit", "triage", "diagnostics", "map", "graph"],
    ),
    ("actions_output", &["compact", "errors", "none"]),
    ("proof_screenshot", &["none", "artifact"]),
];

const INT_KEYS: &[(&str, i64, i64)] = &[("max_recoveries", 0, 5), ("report_limit", 1, 200)];

const FLOAT_KEYS: &[(&str, f64, f64)] = &[
    ("action_timeout", 0.1, 300.0),
    ("recover_timeout", 0.1, 60.0),
    ("auto_download_timeout", 0.1, 30.0),
];

/// Lenient bool coercion shared with the macro layer: accepts bools, 0/1,
/// and the usual yes/no strings.
pub fn coerce_boolish(value: &Value) -> Option<Option<bool>> {
    match value {
        Value::Null => Some(None),
        Value::Bool(b) => Some(Some(*b)),
        Value::Number(n) => match n.as_i64() {
            Some(0) => Some(Some(false)),
            Some(1) => Some(Some(true)),
            _ => None,
        },
        Value::String(s) => match s.trim().to_ascii_lowercase().as_str() {
            "true" | "1" | "yes" | "y" | "on" => Some(Some(true)),
            "false" | "0" | "no" | "n" | "off" => Some(Some(false)),
            _ => None,
        },
        _ => None,
    }
}

fn coerce_int(value: &Value, lo: i64, hi: i64) -> Option<i64> {
    let num = match value {
        Value::Bool(_) | Value::Null => return None,
        Value::Number(n) => n.as_i64().or_else(|| n.as_f64().map(|f| f as i64))?,
        Value::String(s) => s.trim().parse::<i64>().ok()?,
        _ => return None,
    };
    (lo..=hi).contains(&num).then_some(num)
}

fn coerce_float(value: &Value, lo: f64, hi: f64) -> Option<f64> {
    let num = match value {
        Value::Bool(_) | Value::Null => return None,
        Value::Number(n) => n.as_f64()?,
        Value::String(s) => s.trim().parse::<f64>().ok()?,
        _ => return None,
    };
    (num >= lo && num <= hi).then_some(num)
}

fn handle_invalid(
    key: &str,
    reason: &str,
    strict: bool,
    errors: &mut Vec<String>,
    warnings: &mut Vec<String>,
    defaults: &Map<String, Value>,
    args: &mut Map<String, Value>,
) {
    if strict {
        errors.push(format!("{key}: {reason}"));
        return;
    }
    if let Some(default) = defaults.get(key) {
        args.insert(key.to_string(), default.clone());
        warnings.push(format!("{key}: {reason}; defaulted to policy value"));
    } else {
        args.remove(key);
        warnings.push(format!("{key}: {reason}; using default"));
    }
}

/// Parse + normalize run arguments. Returns `(policy, normalized_args,
/// warnings, errors)`; a non-empty `errors` means the run must be refused
/// (strict_params).
pub fn parse_policy_args(
    args: &Map<String, Value>,
) -> (ReliabilityPolicy, Map<String, Value>, Vec<String>, Vec<String>) {
    let mut src = args.clone();
    let mut warnings = Vec::new();
    let mut errors = Vec::new();

    let strict = src
        .get("strict_params")
        .and_then(|v| coerce_boolish(v).flatten())
        .unwrap_or(false);

    let level = match src.get("heuristic_level") {
        None => 1,
        Some(raw) => match coerce_int(raw, 0, 3) {
            Some(level) => level as u8,
            None => {
                if strict {
                    errors.push("heuristic_level: expected integer 0-3".into());
                } else {
                    warnings.push("heuristic_level: invalid; defaulted to 1".into());
                }
                1
            }
        },
    };

    let defaults = level_defaults(level);
    let mut applied = Map::new();
    for (key, value) in &defaults {
        let absent = matches!(src.get(key), None | Some(Value::Null));
        if absent {
            src.insert(key.clone(), value.clone());
            applied.insert(key.clone(), value.clone());
        }
    }

    for key in BOOLISH_KEYS {
        let Some(value) = src.get(*key).cloned() else {
            continue;
        };
        if value.is_null() {
            src.remove(*key);
            continue;
        }
        match coerce_boolish(&value) {
            Some(Some(b)) => {
                src.insert((*key).to_string(), json!(b));
            }
            Some(None) => {
                src.remove(*key);
            }
            None => handle_invalid(
                key,
                "expected boolean",
                strict,
                &mut errors,
                &mut warnings,
                &defaults,
                &mut src,
            ),
        }
    }

    for (key, allowed) in ENUM_KEYS {
        let Some(value) = src.get(*key).cloned() else {
            continue;
        };
        if value.is_null() {
            src.remove(*key);
            continue;
        }
        let reason = format!("expected one of {allowed:?}");
        match value.as_str() {
            Some(raw) => {
                let normalized = raw.trim().to_ascii_lowercase();
                if allowed.contains(&normalized.as_str()) {
                    src.insert((*key).to_string(), json!(normalized));
                } else {
                    handle_invalid(
                        key,
                        &reason,
                        strict,
                        &mut errors,
                        &mut warnings,
                        &defaults,
                        &mut src,
                    );
                }
            }
            None => handle_invalid(
                key,
                &reason,
                strict,
                &mut errors,
                &mut warnings,
                &defaults,
                &mut src,
            ),
        }
    }

    for (key, lo, hi) in INT_KEYS {
        let Some(value) = src.get(*key).cloned() else {
            continue;
        };
        if value.is_null() {
            src.remove(*key);
            continue;
        }
        match coerce_int(&value, *lo, *hi) {
            Some(num) => {
                src.insert((*key).to_string(), json!(num));
            }
            None => handle_invalid(
                key,
                &format!("expected integer {lo}-{hi}"),
                strict,
                &mut errors,
                &mut warnings,
                &defaults,
                &mut src,
            ),
        }
    }

    for (key, lo, hi) in FLOAT_KEYS {
        let Some(value) = src.get(*key).cloned() else {
            continue;
        };
        if value.is_null() {
            src.remove(*key);
            continue;
        }
        match coerce_float(&value, *lo, *hi) {
            Some(num) => {
                src.insert((*key).to_string(), json!(num));
            }
            None => handle_invalid(
                key,
                &format!("expected number {lo}-{hi}"),
                strict,
                &mut errors,
                &mut warnings,
                &defaults,
                &mut src,
            ),
        }
    }

    let policy = ReliabilityPolicy {
        level,
        strict_params: strict,
        applied,
    };
    (policy, src, warnings, errors)
}

/// Compact summary block for the run report; `None` when nothing notable.
pub fn policy_summary(policy: &ReliabilityPolicy, warnings: &[String]) -> Option<Value> {
    if policy.level == 1 && !policy.strict_params && policy.applied.is_empty() && warnings.is_empty()
    {
        return None;
    }
    let mut out = json!({"heuristic_level": policy.level});
    if policy.strict_params {
        out["strict_params"] = json!(true);
    }
    if !policy.applied.is_empty() {
        out["applied"] = Value::Object(policy.applied.clone());
    }
    if !warnings.is_empty() {
        out["warnings"] = json!(warnings.iter().take(8).collect::<Vec<_>>());
    }
    Some(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(value: Value) -> Map<String, Value> {
        value.as_object().cloned().unwrap_or_default()
    }

    #[test]
    fn level_two_applies_robust_defaults() {
        let (policy, normalized, warnings, errors) =
            parse_policy_args(&args(json!({"heuristic_level": 2})));
        assert!(errors.is_empty());
        assert!(warnings.is_empty());
        assert_eq!(policy.level, 2);
        assert_eq!(normalized["auto_recover"], json!(true));
        assert_eq!(normalized["auto_dialog"], json!("auto"));
        assert_eq!(normalized["max_recoveries"], json!(2));
        assert!(policy.applied.contains_key("auto_tab"));
    }

    #[test]
    fn explicit_args_beat_level_defaults() {
        let (_, normalized, _, _) =
            parse_policy_args(&args(json!({"heuristic_level": 2, "auto_tab": false})));
        assert_eq!(normalized["auto_tab"], json!(false));
    }

    #[test]
    fn strict_params_rejects_bad_enum() {
        let (_, _, _, errors) =
            parse_policy_args(&args(json!({"strict_params": true, "report": "everything"})));
        assert_eq!(errors.len(), 1);
        assert!(errors[0].starts_with("report:"));
    }

    #[test]
    fn lenient_mode_warns_and_resets() {
        let (_, normalized, warnings, errors) =
            parse_policy_args(&args(json!({"report": "everything", "max_recoveries": 99})));
        assert!(errors.is_empty());
        assert_eq!(warnings.len(), 2);
        assert!(normalized.get("report").is_none());
        assert!(normalized.get("max_recoveries").is_none());
    }

    #[test]
    fn boolish_strings_are_coerced() {
        let (_, normalized, _, errors) =
            parse_policy_args(&args(json!({"auto_recover": "yes", "proof": 0})));
        assert!(errors.is_empty());
        assert_eq!(normalized["auto_recover"], json!(true));
        assert_eq!(normalized["proof"], json!(false));
    }

    #[test]
    fn level_one_summary_is_empty() {
        let (policy, _, warnings, _) = parse_policy_args(&args(json!({})));
        assert!(policy_summary(&policy, &warnings).is_none());

        let (policy, _, warnings, _) = parse_policy_args(&args(json!({"heuristic_level": 3})));
        let summary = policy_summary(&policy, &warnings).unwrap();
        assert_eq!(summary["heuristic_level"], json!(3));
    }
}

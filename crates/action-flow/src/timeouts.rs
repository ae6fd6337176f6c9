//! Timeout profiles: one cheap knob that selects safer defaults for slow
//! or fast sites without removing fine-grained overrides.
//!
//! Resolution order per field: explicit argument, then the scoped env
//! (`MCP_<SCOPE>_...`), then the global env, then the profile default.

use std::env;

use serde::{Deserialize, Serialize};

#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TimeoutProfile {
    Fast,
    #[default]
    Default,
    Slow,
}

impl TimeoutProfile {
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "fast" => Some(TimeoutProfile::Fast),
            "default" => Some(TimeoutProfile::Default),
            "slow" => Some(TimeoutProfile::Slow),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TimeoutProfile::Fast => "fast",
            TimeoutProfile::Default => "default",
            TimeoutProfile::Slow => "slow",
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct RepeatDefaults {
    pub backoff_s: f64,
    pub backoff_factor: f64,
    pub backoff_max_s: f64,
    pub backoff_jitter: f64,
    pub jitter_seed: u32,
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct TimeoutDefaults {
    pub action_timeout_s: f64,
    pub recover_timeout_s: f64,
    pub auto_download_timeout_s: f64,
    pub condition_timeout_s: f64,
    pub repeat: RepeatDefaults,
}

fn profile_defaults(profile: TimeoutProfile) -> TimeoutDefaults {
    match profile {
        TimeoutProfile::Fast => TimeoutDefaults {
            action_timeout_s: 20.0,
            recover_timeout_s: 4.0,
            auto_download_timeout_s: 2.0,
            condition_timeout_s: 0.2,
            repeat: RepeatDefaults {
                backoff_s: 0.0,
                backoff_factor: 1.0,
                backoff_max_s: 0.0,
                backoff_jitter: 0.0,
                jitter_seed: 0,
            },
        },
        TimeoutProfile::Default => TimeoutDefaults {
            action_timeout_s: 30.0,
            recover_timeout_s: 5.0,
            auto_download_timeout_s: 3.0,
            condition_timeout_s: 0.3,
            repeat: RepeatDefaults {
                backoff_s: 0.0,
                backoff_factor: 1.0,
                backoff_max_s: 0.0,
                backoff_jitter: 0.0,
                jitter_seed: 0,
            },
        },
        // Long/slow sites get a small deterministic backoff: repeat is an
        // explicit loop and a little spacing cuts flake and CPU churn.
        TimeoutProfile::Slow => TimeoutDefaults {
            action_timeout_s: 60.0,
            recover_timeout_s: 8.0,
            auto_download_timeout_s: 6.0,
            condition_timeout_s: 0.8,
            repeat: RepeatDefaults {
                backoff_s: 0.2,
                backoff_factor: 1.5,
                backoff_max_s: 2.0,
                backoff_jitter: 0.15,
                jitter_seed: 0,
            },
        },
    }
}

fn env_float(keys: &[String], fallback: f64) -> f64 {
    for key in keys {
        if let Ok(raw) = env::var(key) {
            if let Ok(value) = raw.trim().parse() {
                return value;
            }
        }
    }
    fallback
}

fn env_int(keys: &[String], fallback: u32) -> u32 {
    for key in keys {
        if let Ok(raw) = env::var(key) {
            if let Ok(value) = raw.trim().parse() {
                return value;
            }
        }
    }
    fallback
}

/// Pick the profile: explicit arg first, then scoped env, then global.
pub fn resolve_timeout_profile(args_profile: Option<&str>, scope: &str) -> TimeoutProfile {
    if let Some(profile) = args_profile.and_then(TimeoutProfile::parse) {
        return profile;
    }
    let scoped = format!("MCP_{}_TIMEOUT_PROFILE", scope.to_ascii_uppercase());
    if let Ok(raw) = env::var(&scoped) {
        return TimeoutProfile::parse(&raw).unwrap_or_default();
    }
    env::var("MCP_TIMEOUT_PROFILE")
        .ok()
        .and_then(|raw| TimeoutProfile::parse(&raw))
        .unwrap_or_default()
}

pub fn resolve_timeout_defaults(profile: TimeoutProfile, scope: &str) -> TimeoutDefaults {
    let base = profile_defaults(profile);
    let prefix = format!("MCP_{}_", scope.to_ascii_uppercase());
    let keys = |suffix: &str| -> Vec<String> {
        vec![format!("{prefix}{suffix}"), format!("MCP_{suffix}")]
    };

    TimeoutDefaults {
        action_timeout_s: env_float(&keys("ACTION_TIMEOUT"), base.action_timeout_s),
        recover_timeout_s: env_float(&keys("RECOVER_TIMEOUT"), base.recover_timeout_s),
        auto_download_timeout_s: env_float(
            &keys("AUTO_DOWNLOAD_TIMEOUT"),
            base.auto_download_timeout_s,
        ),
        condition_timeout_s: env_float(&keys("CONDITION_TIMEOUT"), base.condition_timeout_s),
        repeat: RepeatDefaults {
            backoff_s: env_float(&keys("REPEAT_BACKOFF_S"), base.repeat.backoff_s),
            backoff_factor: env_float(&keys("REPEAT_BACKOFF_FACTOR"), base.repeat.backoff_factor),
            backoff_max_s: env_float(&keys("REPEAT_BACKOFF_MAX_S"), base.repeat.backoff_max_s),
            backoff_jitter: env_float(&keys("REPEAT_BACKOFF_JITTER"), base.repeat.backoff_jitter),
            jitter_seed: env_int(&keys("REPEAT_JITTER_SEED"), base.repeat.jitter_seed),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn profiles_parse_and_fall_back() {
        assert_eq!(TimeoutProfile::parse("FAST"), Some(TimeoutProfile::Fast));
        assert_eq!(TimeoutProfile::parse("bogus"), None);
        assert_eq!(
            resolve_timeout_profile(Some("slow"), "flow"),
            TimeoutProfile::Slow
        );
        assert_eq!(
            resolve_timeout_profile(Some("bogus"), "flow"),
            TimeoutProfile::Default
        );
    }

    #[test]
    fn slow_profile_carries_repeat_backoff() {
        let slow = profile_defaults(TimeoutProfile::Slow);
        assert_eq!(slow.action_timeout_s, 60.0);
        assert_eq!(slow.repeat.backoff_s, 0.2);
        assert_eq!(slow.repeat.backoff_factor, 1.5);

        let fast = profile_defaults(TimeoutProfile::Fast);
        assert_eq!(fast.action_timeout_s, 20.0);
        assert_eq!(fast.repeat.backoff_s, 0.0);
    }
}

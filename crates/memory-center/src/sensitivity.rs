//! The sensitivity rule.
//!
//! Keys are normalized (lowercase, `_` and `-` stripped) and matched
//! against a closed lexical set. Substring matching is intentional:
//! `github_token` and `x-api-key` must both trip the rule.

/// Normalized forms of the closed set
/// {secret, password, pass, pwd, token, auth, authorization, cookie,
///  set-cookie, api-key, x-api-key, x-auth-token}.
const SENSITIVE_FRAGMENTS: &[&str] = &[
    "secret",
    "password",
    "passwd",
    "pass",
    "pwd",
    "token",
    "auth",
    "authorization",
    "cookie",
    "setcookie",
    "apikey",
    "xapikey",
    "xauthtoken",
    "credential",
    "totp",
    "otp",
];

pub fn normalize_key(key: &str) -> String {
    key.trim()
        .to_ascii_lowercase()
        .chars()
        .filter(|c| *c != '_' && *c != '-')
        .collect()
}

pub fn is_sensitive_key(key: &str) -> bool {
    let normalized = normalize_key(key);
    if normalized.is_empty() {
        return false;
    }
    SENSITIVE_FRAGMENTS
        .iter()
        .any(|fragment| normalized.contains(fragment))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn closed_set_members_match() {
        for key in [
            "secret",
            "password",
            "pass",
            "pwd",
            "token",
            "auth",
            "authorization",
            "cookie",
            "set-cookie",
            "api-key",
            "x-api-key",
            "x-auth-token",
        ] {
            assert!(is_sensitive_key(key), "{key} should be sensitive");
        }
    }

    #[test]
    fn normalization_catches_variants() {
        assert!(is_sensitive_key("GitHub_Token"));
        assert!(is_sensitive_key("X-API-KEY"));
        assert!(is_sensitive_key("session-cookie"));
        assert!(is_sensitive_key("TOTP_SECRET"));
    }

    #[test]
    fn ordinary_keys_pass() {
        for key in ["greeting", "runbook", "rb", "steps", "checkout-flow", "q"] {
            assert!(!is_sensitive_key(key), "{key} should not be sensitive");
        }
    }
}

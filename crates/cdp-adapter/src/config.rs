//! Static browser configuration resolved from the `MCP_*` environment.

use std::env;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use which::which;

/// How the server reaches a Chromium.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BrowserMode {
    /// Own the process: spawn, watch, and restart Chromium ourselves.
    #[default]
    Launch,
    /// Attach to an already-running CDP endpoint.
    Attach,
    /// Drive the browser through the extension gateway.
    Extension,
}

impl BrowserMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            BrowserMode::Launch => "launch",
            BrowserMode::Attach => "attach",
            BrowserMode::Extension => "extension",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "launch" => Some(BrowserMode::Launch),
            "attach" => Some(BrowserMode::Attach),
            "extension" => Some(BrowserMode::Extension),
            _ => None,
        }
    }
}

/// Toolset flavor: selects default report shapes and suggestion phrasing.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Toolset {
    #[default]
    V1,
    V2,
}

impl Toolset {
    pub fn is_v2(&self) -> bool {
        matches!(self, Toolset::V2)
    }
}

/// Immutable-after-construction configuration for the whole process.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct BrowserConfig {
    pub binary: Option<PathBuf>,
    pub profile_dir: PathBuf,
    pub cdp_port: u16,
    pub mode: BrowserMode,
    pub extra_flags: Vec<String>,
    pub allow_hosts: Vec<String>,
    pub headless: bool,
    pub window_size: Option<(u32, u32)>,
    pub auto_port_fallback: bool,
    pub toolset: Toolset,
    pub http_timeout_s: f64,
    pub http_max_bytes: u64,
    pub download_dir: Option<PathBuf>,
    pub agent_memory_dir: Option<PathBuf>,
    pub extension_connect_timeout_s: f64,
    pub trace: bool,
}

impl Default for BrowserConfig {
    fn default() -> Self {
        Self {
            binary: None,
            profile_dir: PathBuf::from("./.browsermcp-profile"),
            cdp_port: 9222,
            mode: BrowserMode::Launch,
            extra_flags: Vec::new(),
            allow_hosts: Vec::new(),
            headless: true,
            window_size: None,
            auto_port_fallback: false,
            toolset: Toolset::V1,
            http_timeout_s: 30.0,
            http_max_bytes: 2_000_000,
            download_dir: None,
            agent_memory_dir: None,
            extension_connect_timeout_s: 4.0,
            trace: false,
        }
    }
}

impl BrowserConfig {
    /// Resolve configuration from the process environment.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            binary: env_path("MCP_BROWSER_BINARY").or_else(detect_chrome_executable),
            profile_dir: env_path("MCP_BROWSER_PROFILE").unwrap_or(defaults.profile_dir),
            cdp_port: env_parse("MCP_BROWSER_PORT").unwrap_or(defaults.cdp_port),
            mode: env::var("MCP_BROWSER_MODE")
                .ok()
                .and_then(|v| BrowserMode::parse(&v))
                .unwrap_or_default(),
            extra_flags: env::var("MCP_BROWSER_FLAGS")
                .map(|v| v.split_whitespace().map(str::to_string).collect())
                .unwrap_or_default(),
            allow_hosts: env::var("MCP_ALLOW_HOSTS")
                .map(|v| {
                    v.split(',')
                        .map(str::trim)
                        .filter(|s| !s.is_empty())
                        .map(str::to_string)
                        .collect()
                })
                .unwrap_or_default(),
            headless: env_flag("MCP_HEADLESS").unwrap_or(defaults.headless),
            window_size: env::var("MCP_WINDOW_SIZE").ok().and_then(parse_window_size),
            auto_port_fallback: env_flag("MCP_AUTO_PORT_FALLBACK").unwrap_or(false),
            toolset: match env::var("MCP_TOOLSET")
                .unwrap_or_default()
                .trim()
                .to_ascii_lowercase()
                .as_str()
            {
                "v2" | "northstar" | "north-star" => Toolset::V2,
                _ => Toolset::V1,
            },
            http_timeout_s: env_parse("MCP_HTTP_TIMEOUT").unwrap_or(defaults.http_timeout_s),
            http_max_bytes: env_parse("MCP_HTTP_MAX_BYTES").unwrap_or(defaults.http_max_bytes),
            download_dir: env_path("MCP_DOWNLOAD_DIR"),
            agent_memory_dir: env_path("MCP_AGENT_MEMORY_DIR"),
            extension_connect_timeout_s: env_parse("MCP_EXTENSION_CONNECT_TIMEOUT")
                .map(|v: f64| v.clamp(0.0, 15.0))
                .unwrap_or(defaults.extension_connect_timeout_s),
            trace: env_flag("MCP_TRACE").unwrap_or(false),
        }
    }

    /// DevTools HTTP base for the configured port.
    pub fn devtools_http_base(&self) -> String {
        format!("http://127.0.0.1:{}", self.cdp_port)
    }

    /// Candidate ports, honoring `MCP_AUTO_PORT_FALLBACK`.
    pub fn port_candidates(&self) -> Vec<u16> {
        if self.auto_port_fallback {
            (0..4).map(|i| self.cdp_port.saturating_add(i)).collect()
        } else {
            vec![self.cdp_port]
        }
    }

    /// Chromium CLI flags for launch mode.
    pub fn launch_args(&self, port: u16) -> Vec<String> {
        let mut args = vec![
            format!("--remote-debugging-port={port}"),
            format!("--user-data-dir={}", self.profile_dir.display()),
            "--no-first-run".into(),
            "--no-default-browser-check".into(),
            "--disable-background-networking".into(),
            "--disable-background-timer-throttling".into(),
            "--disable-breakpad".into(),
            "--disable-component-update".into(),
            "--disable-default-apps".into(),
            "--disable-dev-shm-usage".into(),
            "--disable-hang-monitor".into(),
            "--disable-popup-blocking".into(),
            "--disable-prompt-on-repost".into(),
            "--disable-sync".into(),
            "--metrics-recording-only".into(),
            "--password-store=basic".into(),
            "--remote-allow-origins=*".into(),
            "--use-mock-keychain".into(),
        ];
        if self.headless {
            args.push("--headless=new".into());
            args.push("--hide-scrollbars".into());
            args.push("--mute-audio".into());
        }
        if let Some((w, h)) = self.window_size {
            args.push(format!("--window-size={w},{h}"));
        }
        args.extend(self.extra_flags.iter().cloned());
        args.push("about:blank".into());
        args
    }

    /// Whether an outgoing HTTP host passes the allow-list (empty = all).
    pub fn host_allowed(&self, host: &str) -> bool {
        if self.allow_hosts.is_empty() {
            return true;
        }
        let host = host.to_ascii_lowercase();
        self.allow_hosts.iter().any(|allowed| {
            let allowed = allowed.to_ascii_lowercase();
            host == allowed || host.ends_with(&format!(".{allowed}"))
        })
    }
}

fn env_path(key: &str) -> Option<PathBuf> {
    let raw = env::var(key).ok()?;
    let trimmed = raw.trim();
    (!trimmed.is_empty()).then(|| PathBuf::from(trimmed))
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    env::var(key).ok()?.trim().parse().ok()
}

fn env_flag(key: &str) -> Option<bool> {
    let raw = env::var(key).ok()?;
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

fn parse_window_size(raw: String) -> Option<(u32, u32)> {
    let (w, h) = raw.trim().split_once(['x', 'X', ','])?;
    Some((w.trim().parse().ok()?, h.trim().parse().ok()?))
}

/// Locate a Chromium-family executable: explicit env, then PATH, then the
/// usual OS install locations.
pub fn detect_chrome_executable() -> Option<PathBuf> {
    for name in chrome_executable_names() {
        if let Ok(path) = which(name) {
            return Some(path);
        }
    }
    os_specific_chrome_paths()
        .into_iter()
        .find(|candidate| candidate.exists())
}

fn chrome_executable_names() -> &'static [&'static str] {
    #[cfg(target_os = "windows")]
    {
        &["chrome.exe", "chromium.exe", "msedge.exe"]
    }

    #[cfg(not(target_os = "windows"))]
    {
        &[
            "google-chrome-stable",
            "google-chrome",
            "chromium",
            "chromium-browser",
        ]
    }
}

fn os_specific_chrome_paths() -> Vec<PathBuf> {
    #[cfg(target_os = "macos")]
    {
        vec![
            PathBuf::from("/Applications/Google Chrome.app/Contents/MacOS/Google Chrome"),
            PathBuf::from("/Applications/Chromium.app/Contents/MacOS/Chromium"),
        ]
    }

    #[cfg(target_os = "linux")]
    {
        vec![
            PathBuf::from("/usr/bin/google-chrome-stable"),
            PathBuf::from("/usr/bin/google-chrome"),
            PathBuf::from("/usr/bin/chromium-browser"),
            PathBuf::from("/usr/bin/chromium"),
        ]
    }

    #[cfg(not(any(target_os = "macos", target_os = "linux")))]
    {
        Vec::new()
    }
}

/// Ensure the profile directory exists (created lazily before launch).
pub fn ensure_profile_dir(dir: &Path) -> std::io::Result<()> {
    std::fs::create_dir_all(dir)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn window_size_accepts_x_and_comma() {
        assert_eq!(parse_window_size("1280x800".into()), Some((1280, 800)));
        assert_eq!(parse_window_size("1024, 768".into()), Some((1024, 768)));
        assert_eq!(parse_window_size("garbage".into()), None);
    }

    #[test]
    fn host_allow_list_matches_subdomains() {
        let cfg = BrowserConfig {
            allow_hosts: vec!["example.com".into()],
            ..BrowserConfig::default()
        };
        assert!(cfg.host_allowed("example.com"));
        assert!(cfg.host_allowed("api.example.com"));
        assert!(!cfg.host_allowed("evil-example.com"));
        let open = BrowserConfig::default();
        assert!(open.host_allowed("anything.test"));
    }

    #[test]
    fn port_candidates_respect_fallback() {
        let mut cfg = BrowserConfig::default();
        assert_eq!(cfg.port_candidates(), vec![9222]);
        cfg.auto_port_fallback = true;
        assert_eq!(cfg.port_candidates(), vec![9222, 9223, 9224, 9225]);
    }

    #[test]
    fn launch_args_cover_headless_and_profile() {
        let cfg = BrowserConfig {
            headless: true,
            window_size: Some((800, 600)),
            ..BrowserConfig::default()
        };
        let args = cfg.launch_args(9300);
        assert!(args.iter().any(|a| a == "--remote-debugging-port=9300"));
        assert!(args.iter().any(|a| a == "--headless=new"));
        assert!(args.iter().any(|a| a == "--window-size=800,600"));
    }
}

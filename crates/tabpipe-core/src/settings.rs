use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

pub const DEFAULT_ENGINE_URL: &str = "https://html.duckduckgo.com/html/?q={query}";

/// User-editable knobs. Missing fields fall back to their defaults, so a partial settings
/// file behaves like `{...defaults, ...stored}`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct Settings {
    /// Candidates beyond this count are dropped before any worker tab is opened.
    pub max_results: usize,
    /// How long a worker waits after page load before extracting.
    pub extract_delay_ms: u64,
    /// Open the engine window as a private window.
    pub private_mode: bool,
    /// Wildcard patterns (`*` matches anything) for pages where tool interception is active.
    pub url_patterns: Vec<String>,
    /// Submit a `ready` session automatically after `extract_timeout_s`.
    pub auto_close: bool,
    pub extract_timeout_s: u64,
    /// Global extraction deadline, measured from candidate receipt.
    pub deadline_ms: u64,
    /// How long `complete` stays visible before the session resets to idle.
    pub grace_ms: u64,
    /// How long a tool call waits for a search outcome before giving up.
    pub tool_timeout_ms: u64,
    /// Search-engine address; `{query}` is replaced by the url-encoded query.
    pub engine_url: String,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            max_results: 10,
            extract_delay_ms: 3_000,
            private_mode: false,
            url_patterns: vec![
                "http://127.0.0.1:*/*".to_string(),
                "http://localhost:*/*".to_string(),
            ],
            auto_close: false,
            extract_timeout_s: 10,
            deadline_ms: 600_000,
            grace_ms: 5_000,
            tool_timeout_ms: 600_000,
            engine_url: DEFAULT_ENGINE_URL.to_string(),
        }
    }
}

fn parse_bool(s: &str) -> Option<bool> {
    match s.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

impl Settings {
    pub fn from_json(raw: &str) -> Result<Self> {
        serde_json::from_str(raw).map_err(|e| Error::Config(e.to_string()))
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("{}: {e}", path.display())))?;
        Self::from_json(&raw)
    }

    /// Apply `TABPIPE_*` overrides from the process environment.
    pub fn apply_env(&mut self) {
        self.apply_env_with(|k| std::env::var(k).ok());
    }

    /// Apply overrides from an arbitrary lookup. Unparseable values are ignored.
    pub fn apply_env_with<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |k: &str| {
            lookup(k)
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
        };
        let get_u64 = |k: &str| get(k).and_then(|s| s.parse::<u64>().ok());

        if let Some(n) = get("TABPIPE_MAX_RESULTS").and_then(|s| s.parse::<usize>().ok()) {
            self.max_results = n;
        }
        if let Some(n) = get_u64("TABPIPE_EXTRACT_DELAY_MS") {
            self.extract_delay_ms = n;
        }
        if let Some(b) = get("TABPIPE_PRIVATE_MODE").and_then(|s| parse_bool(&s)) {
            self.private_mode = b;
        }
        if let Some(v) = get("TABPIPE_URL_PATTERNS") {
            self.url_patterns = v
                .split(',')
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect();
        }
        if let Some(b) = get("TABPIPE_AUTO_CLOSE").and_then(|s| parse_bool(&s)) {
            self.auto_close = b;
        }
        if let Some(n) = get_u64("TABPIPE_EXTRACT_TIMEOUT_S") {
            self.extract_timeout_s = n;
        }
        if let Some(n) = get_u64("TABPIPE_DEADLINE_MS") {
            self.deadline_ms = n;
        }
        if let Some(n) = get_u64("TABPIPE_GRACE_MS") {
            self.grace_ms = n;
        }
        if let Some(n) = get_u64("TABPIPE_TOOL_TIMEOUT_MS") {
            self.tool_timeout_ms = n;
        }
        if let Some(v) = get("TABPIPE_ENGINE_URL") {
            self.engine_url = v;
        }
    }

    pub fn deadline(&self) -> Duration {
        Duration::from_millis(self.deadline_ms)
    }

    pub fn grace(&self) -> Duration {
        Duration::from_millis(self.grace_ms)
    }

    pub fn tool_timeout(&self) -> Duration {
        Duration::from_millis(self.tool_timeout_ms)
    }

    pub fn extract_delay(&self) -> Duration {
        Duration::from_millis(self.extract_delay_ms)
    }

    pub fn auto_submit_after(&self) -> Option<Duration> {
        self.auto_close
            .then(|| Duration::from_secs(self.extract_timeout_s))
    }

    /// The engine address for `query`.
    pub fn engine_url_for(&self, query: &str) -> String {
        let encoded: String = url::form_urlencoded::byte_serialize(query.as_bytes()).collect();
        if self.engine_url.contains("{query}") {
            self.engine_url.replace("{query}", &encoded)
        } else {
            format!("{}{}", self.engine_url, encoded)
        }
    }

    /// Whether interception should be active for a page at `url`.
    pub fn activates_on(&self, url: &str) -> bool {
        url_matches(url, &self.url_patterns)
    }
}

/// Compile a wildcard pattern into an anchored regex. Only `*` is special.
pub fn pattern_to_regex(pattern: &str) -> Option<regex::Regex> {
    let escaped = regex::escape(pattern).replace(r"\*", ".*");
    regex::Regex::new(&format!("^{escaped}$")).ok()
}

pub fn url_matches(url: &str, patterns: &[String]) -> bool {
    patterns
        .iter()
        .filter_map(|p| pattern_to_regex(p))
        .any(|re| re.is_match(url))
}

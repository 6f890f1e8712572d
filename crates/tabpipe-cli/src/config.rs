use anyhow::Context;
use std::path::PathBuf;
use tabpipe_core::Settings;

/// Settings flags shared by every command that runs a session.
///
/// Precedence, lowest first: defaults, `--settings` file, `TABPIPE_*` env vars, these flags.
#[derive(clap::Args, Debug, Clone, Default)]
pub(crate) struct SettingsArgs {
    /// JSON settings file; missing fields keep their defaults.
    #[arg(long = "settings", env = "TABPIPE_SETTINGS")]
    pub(crate) settings_file: Option<PathBuf>,
    /// Maximum number of result pages to open.
    #[arg(long)]
    pub(crate) max_results: Option<usize>,
    /// Wait after page load before extracting (0 = extract on load).
    #[arg(long)]
    pub(crate) extract_delay_ms: Option<u64>,
    #[arg(long, action = clap::ArgAction::Set)]
    pub(crate) private_mode: Option<bool>,
    /// Page URL pattern where tool interception is active (repeatable; `*` wildcard).
    #[arg(long = "url-pattern")]
    pub(crate) url_patterns: Vec<String>,
    /// Submit a ready session automatically after --extract-timeout-s.
    #[arg(long, action = clap::ArgAction::Set)]
    pub(crate) auto_close: Option<bool>,
    #[arg(long)]
    pub(crate) extract_timeout_s: Option<u64>,
    #[arg(long)]
    pub(crate) deadline_ms: Option<u64>,
    #[arg(long)]
    pub(crate) grace_ms: Option<u64>,
    #[arg(long)]
    pub(crate) tool_timeout_ms: Option<u64>,
    /// Search-engine address; `{query}` is replaced by the encoded query.
    #[arg(long)]
    pub(crate) engine_url: Option<String>,
}

impl SettingsArgs {
    pub(crate) fn resolve(&self) -> anyhow::Result<Settings> {
        let mut s = match &self.settings_file {
            Some(p) => Settings::from_file(p)
                .with_context(|| format!("loading settings from {}", p.display()))?,
            None => Settings::default(),
        };
        s.apply_env();
        self.apply_to(&mut s);
        Ok(s)
    }

    fn apply_to(&self, s: &mut Settings) {
        if let Some(v) = self.max_results {
            s.max_results = v;
        }
        if let Some(v) = self.extract_delay_ms {
            s.extract_delay_ms = v;
        }
        if let Some(v) = self.private_mode {
            s.private_mode = v;
        }
        if !self.url_patterns.is_empty() {
            s.url_patterns = self.url_patterns.clone();
        }
        if let Some(v) = self.auto_close {
            s.auto_close = v;
        }
        if let Some(v) = self.extract_timeout_s {
            s.extract_timeout_s = v;
        }
        if let Some(v) = self.deadline_ms {
            s.deadline_ms = v;
        }
        if let Some(v) = self.grace_ms {
            s.grace_ms = v;
        }
        if let Some(v) = self.tool_timeout_ms {
            s.tool_timeout_ms = v;
        }
        if let Some(v) = &self.engine_url {
            s.engine_url = v.clone();
        }
    }
}

/// Opt-in env-file loader (`TABPIPE_ENV_FILE`).
///
/// Sets vars only if not already set in the process environment. Never logs values.
pub(crate) fn load_env_file() {
    let Ok(p) = std::env::var("TABPIPE_ENV_FILE") else {
        return;
    };
    let p = p.trim();
    if p.is_empty() {
        return;
    }
    let Ok(txt) = std::fs::read_to_string(p) else {
        return;
    };
    for (k, v) in parse_env_lines(&txt) {
        if std::env::var_os(k).is_none() {
            std::env::set_var(k, v);
        }
    }
}

fn parse_env_lines(txt: &str) -> Vec<(&str, &str)> {
    txt.lines()
        .map(str::trim)
        .filter(|s| !s.is_empty() && !s.starts_with('#'))
        .filter_map(|s| s.split_once('='))
        .map(|(k, v)| (k.trim(), v.trim()))
        .filter(|(k, _)| !k.is_empty())
        .collect()
}

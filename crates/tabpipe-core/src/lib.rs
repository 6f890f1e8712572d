use serde::{Deserialize, Serialize};
use std::fmt;

pub mod settings;

pub use settings::Settings;

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("invalid url: {0}")]
    InvalidUrl(String),
    #[error("tab host failed: {0}")]
    Host(String),
    #[error("upstream failed: {0}")]
    Upstream(String),
    #[error("protocol error: {0}")]
    Protocol(String),
    #[error("config error: {0}")]
    Config(String),
    #[error("not supported: {0}")]
    NotSupported(String),
    #[error("channel closed: {0}")]
    Closed(String),
}

pub type Result<T> = std::result::Result<T, Error>;

/// Opaque identity of a tab opened by a [`TabHost`].
///
/// Handles are never reused by a host, so a handle from an earlier session can never
/// alias a tab of the current one.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(transparent)]
pub struct TabHandle(pub u64);

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(transparent)]
pub struct WindowHandle(pub u64);

/// Correlation token carried by every message that belongs to one search invocation.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(transparent)]
pub struct SearchId(pub u64);

impl fmt::Display for TabHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "tab:{}", self.0)
    }
}

impl fmt::Display for WindowHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "window:{}", self.0)
    }
}

impl fmt::Display for SearchId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "search:{}", self.0)
    }
}

/// The window (and its first tab) that shows the search-engine results page.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct EngineTab {
    pub window: WindowHandle,
    pub tab: TabHandle,
}

/// One result link reported by the search-engine page.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Candidate {
    pub title: String,
    pub url: String,
}

/// What an extraction worker reports for the page loaded in its tab.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PageReport {
    pub url: String,
    pub title: String,
    pub content: String,
    pub blocked: bool,
    /// `blocked` (no article) or `error` (extraction failed). Only meaningful when blocked.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

impl PageReport {
    /// Non-blocked with non-empty text: the only reports that are submitted.
    pub fn is_usable(&self) -> bool {
        !self.blocked && !self.content.is_empty()
    }

    pub fn site_status(&self) -> SiteStatus {
        if !self.blocked {
            return SiteStatus::Loaded;
        }
        match self.reason.as_deref() {
            Some("error") => SiteStatus::Error,
            _ => SiteStatus::Blocked,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum SiteStatus {
    Pending,
    Loading,
    Loaded,
    Blocked,
    Error,
}

impl SiteStatus {
    pub fn label(self) -> &'static str {
        match self {
            SiteStatus::Pending => "Pending",
            SiteStatus::Loading => "Loading",
            SiteStatus::Loaded => "Loaded",
            SiteStatus::Blocked => "Blocked",
            SiteStatus::Error => "Error",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SiteRecord {
    pub url: String,
    pub title: String,
    pub tab: Option<TabHandle>,
    pub status: SiteStatus,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    #[default]
    Idle,
    Searching,
    Extracting,
    Ready,
    Error,
    Complete,
}

impl SessionStatus {
    pub fn label(self) -> &'static str {
        match self {
            SessionStatus::Idle => "Idle",
            SessionStatus::Searching => "Searching",
            SessionStatus::Extracting => "Extracting",
            SessionStatus::Ready => "Ready",
            SessionStatus::Error => "Error",
            SessionStatus::Complete => "Complete",
        }
    }
}

/// Read-only copy of the session, pushed to observers on every change.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct SessionSnapshot {
    pub status: SessionStatus,
    pub query: Option<String>,
    pub search_id: Option<SearchId>,
    pub candidates: Vec<Candidate>,
    pub sites: Vec<SiteRecord>,
    pub window: Option<WindowHandle>,
}

impl SessionSnapshot {
    pub fn loaded_count(&self) -> usize {
        self.sites
            .iter()
            .filter(|s| s.status == SiteStatus::Loaded)
            .count()
    }

    /// Whether a user-driven submit makes sense right now.
    pub fn can_submit(&self) -> bool {
        matches!(
            self.status,
            SessionStatus::Ready | SessionStatus::Extracting
        ) && self.loaded_count() > 0
    }

    /// One-line human summary, e.g. `Extracting "rust async" 2/5 loaded`.
    pub fn status_line(&self) -> String {
        let mut out = self.status.label().to_string();
        if let Some(q) = &self.query {
            out.push_str(&format!(" {q:?}"));
        }
        if !self.sites.is_empty() {
            out.push_str(&format!(
                " {}/{} loaded",
                self.loaded_count(),
                self.sites.len()
            ));
        }
        out
    }
}

/// One page worth of text handed back to the model.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SearchResult {
    pub title: String,
    pub url: String,
    pub content: String,
}

impl SearchResult {
    pub fn canceled() -> Self {
        Self {
            title: "Canceled".to_string(),
            url: String::new(),
            content: "Search was canceled by the user.".to_string(),
        }
    }

    pub fn timed_out() -> Self {
        Self {
            title: "Timeout".to_string(),
            url: String::new(),
            content: "Search timed out".to_string(),
        }
    }

    pub fn superseded() -> Self {
        Self {
            title: "Superseded".to_string(),
            url: String::new(),
            content: "Search was replaced by a newer search.".to_string(),
        }
    }
}

impl From<PageReport> for SearchResult {
    fn from(r: PageReport) -> Self {
        Self {
            title: r.title,
            url: r.url,
            content: r.content,
        }
    }
}

/// What a waiting tool call receives when a search ends (submitted, canceled, ...).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct SearchOutcome {
    pub results: Vec<SearchResult>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_note: Option<String>,
}

impl SearchOutcome {
    pub fn single(result: SearchResult) -> Self {
        Self {
            results: vec![result],
            user_note: None,
        }
    }
}

/// A [`SearchOutcome`] addressed to the caller that started `search_id`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SearchCompletion {
    pub search_id: SearchId,
    pub outcome: SearchOutcome,
}

/// The runtime that owns real tabs (a browser, or the headless host in `tabpipe-local`).
///
/// Pages loaded in opened tabs are expected to report back out-of-band (candidates from
/// the engine tab, one page report per worker tab), tagged with the tab's handle.
#[async_trait::async_trait]
pub trait TabHost: Send + Sync {
    fn name(&self) -> &'static str;

    /// Open a new window showing `url`; its first tab is the engine tab.
    async fn open_window(&self, url: &str, private: bool) -> Result<EngineTab>;

    async fn open_tab(&self, window: WindowHandle, url: &str, active: bool) -> Result<TabHandle>;

    /// Close a window and every tab in it.
    async fn close_window(&self, window: WindowHandle) -> Result<()>;

    /// Visually group tabs. Optional capability.
    async fn group_tabs(&self, _tabs: &[TabHandle]) -> Result<()> {
        Err(Error::NotSupported(format!("{}: tab grouping", self.name())))
    }

    /// Bring a tab to the front. Optional capability.
    async fn focus_tab(&self, _tab: TabHandle) -> Result<()> {
        Err(Error::NotSupported(format!("{}: tab focus", self.name())))
    }

    /// New settings; hosts that read pages themselves apply them from the next window on.
    fn update_settings(&self, _settings: &Settings) {}
}

/// Runs one web search on behalf of a tool call and waits for its outcome.
#[async_trait::async_trait]
pub trait ToolSearch: Send + Sync {
    async fn search(&self, query: &str) -> Result<SearchOutcome>;
}

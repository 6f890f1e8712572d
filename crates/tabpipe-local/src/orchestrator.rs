//! The search session state machine.
//!
//! `idle → searching → extracting → {ready | error} → complete → idle`
//!
//! Every mutation goes through one of the `on_*`/command methods below, called one at a
//! time by the relay loop. Timers and outcome delivery are not performed here: they are
//! queued as [`Effect`]s and enacted by the caller, which keeps the machine deterministic
//! under test.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tabpipe_core::{
    Candidate, EngineTab, PageReport, SearchCompletion, SearchId, SearchOutcome, SearchResult,
    SessionSnapshot, SessionStatus, Settings, SiteRecord, SiteStatus, TabHandle, TabHost,
    WindowHandle,
};
use tracing::{debug, info, warn};

/// Side effects requested by a transition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Effect {
    /// Hand an outcome to whoever is waiting on `search_id`.
    Deliver(SearchCompletion),
    /// Call back `on_deadline_elapsed(epoch)` after `after`.
    ArmDeadline { epoch: u64, after: Duration },
    DisarmDeadline,
    /// Call back `on_reset_elapsed(epoch)` after `after`.
    ScheduleReset { epoch: u64, after: Duration },
    /// Call back `on_auto_submit_elapsed(epoch)` after `after`.
    ScheduleAutoSubmit { epoch: u64, after: Duration },
}

pub struct Orchestrator {
    host: Arc<dyn TabHost>,
    settings: Settings,
    session: SessionSnapshot,
    engine: Option<EngineTab>,
    /// Latest report per worker tab.
    content: HashMap<TabHandle, PageReport>,
    tracked: HashSet<TabHandle>,
    expected: usize,
    /// Bumped on every start and reset; timer callbacks carrying an older epoch are stale.
    epoch: u64,
    deadline_armed: bool,
    /// Search id of a caller that has not received an outcome yet.
    awaiting: Option<SearchId>,
    effects: Vec<Effect>,
}

impl Orchestrator {
    pub fn new(host: Arc<dyn TabHost>, settings: Settings) -> Self {
        Self {
            host,
            settings,
            session: SessionSnapshot::default(),
            engine: None,
            content: HashMap::new(),
            tracked: HashSet::new(),
            expected: 0,
            epoch: 0,
            deadline_armed: false,
            awaiting: None,
            effects: Vec::new(),
        }
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        self.session.clone()
    }

    pub fn status(&self) -> SessionStatus {
        self.session.status
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    pub fn engine(&self) -> Option<EngineTab> {
        self.engine
    }

    pub fn is_tracked(&self, tab: TabHandle) -> bool {
        self.tracked.contains(&tab)
    }

    /// Number of distinct workers that have reported.
    pub fn collected(&self) -> usize {
        self.content.len()
    }

    pub fn take_effects(&mut self) -> Vec<Effect> {
        std::mem::take(&mut self.effects)
    }

    pub fn update_settings(&mut self, settings: Settings) {
        info!(max_results = settings.max_results, "settings updated");
        self.host.update_settings(&settings);
        self.settings = settings;
    }

    /// Start a new session, superseding any session in progress.
    pub async fn start(&mut self, query: &str, search_id: SearchId) {
        if let Some(prev) = self.awaiting.take() {
            if prev != search_id {
                info!(%prev, "search superseded");
                self.deliver(prev, SearchOutcome::single(SearchResult::superseded()));
            }
        }
        self.close_engine_window().await;
        self.reset();

        self.session.status = SessionStatus::Searching;
        self.session.query = Some(query.to_string());
        self.session.search_id = Some(search_id);
        self.awaiting = Some(search_id);
        info!(%search_id, query, "search started");

        let url = self.settings.engine_url_for(query);
        match self
            .host
            .open_window(&url, self.settings.private_mode)
            .await
        {
            Ok(engine) => {
                self.engine = Some(engine);
                self.session.window = Some(engine.window);
            }
            Err(e) => {
                warn!(error = %e, "engine window failed to open");
                self.session.status = SessionStatus::Error;
            }
        }
    }

    /// The engine page reported its result links.
    pub async fn on_candidates(&mut self, candidates: Vec<Candidate>, sender: TabHandle) {
        let Some(engine) = self.engine else {
            debug!(%sender, "ignoring candidates: no engine tab");
            return;
        };
        if engine.tab != sender || self.session.status != SessionStatus::Searching {
            debug!(%sender, "ignoring stale candidates");
            return;
        }

        let mut candidates = candidates;
        candidates.truncate(self.settings.max_results);
        info!(count = candidates.len(), "candidates received");

        self.session.candidates = candidates.clone();
        self.session.sites = candidates
            .iter()
            .map(|c| SiteRecord {
                url: c.url.clone(),
                title: c.title.clone(),
                tab: None,
                status: SiteStatus::Pending,
            })
            .collect();
        self.session.status = SessionStatus::Extracting;
        self.deadline_armed = true;
        self.effects.push(Effect::ArmDeadline {
            epoch: self.epoch,
            after: self.settings.deadline(),
        });

        let mut opened = Vec::with_capacity(candidates.len());
        for (i, c) in candidates.iter().enumerate() {
            match self.host.open_tab(engine.window, &c.url, i == 0).await {
                Ok(tab) => {
                    self.tracked.insert(tab);
                    opened.push(tab);
                    let site = &mut self.session.sites[i];
                    site.tab = Some(tab);
                    site.status = SiteStatus::Loading;
                }
                Err(e) => {
                    // The tab will never report, so it does not count toward coverage.
                    warn!(url = %c.url, error = %e, "worker tab failed to open");
                    self.session.sites[i].status = SiteStatus::Error;
                }
            }
        }
        self.expected = opened.len();

        if !opened.is_empty() {
            if let Err(e) = self.host.group_tabs(&opened).await {
                debug!(error = %e, "tab grouping unavailable");
            }
        }

        self.check_coverage();
    }

    /// The engine page failed to load; the session waits in `error` for a cancel or the
    /// tool timeout.
    pub fn on_engine_failed(&mut self, reason: &str, sender: TabHandle) {
        let Some(engine) = self.engine else {
            return;
        };
        if engine.tab != sender || self.session.status != SessionStatus::Searching {
            debug!(%sender, "ignoring stale engine failure");
            return;
        }
        warn!(reason, "engine page failed");
        self.session.status = SessionStatus::Error;
    }

    /// A worker tab reported its page.
    pub fn on_content(&mut self, report: PageReport, sender: TabHandle) {
        if !self.tracked.contains(&sender) {
            debug!(%sender, url = %report.url, "ignoring report from untracked tab");
            return;
        }

        let status = report.site_status();
        if let Some(site) = self.session.sites.iter_mut().find(|s| s.tab == Some(sender)) {
            site.status = status;
            site.title = report.title.clone();
        } else {
            debug!(%sender, "no site record for tab");
        }
        self.content.insert(sender, report);
        debug!(
            collected = self.content.len(),
            expected = self.expected,
            "report collected"
        );

        self.check_coverage();
    }

    /// The global extraction deadline fired.
    pub fn on_deadline_elapsed(&mut self, epoch: u64) {
        if epoch != self.epoch || !self.deadline_armed {
            debug!(epoch, "ignoring stale deadline");
            return;
        }
        info!(collected = self.content.len(), "deadline reached");
        self.finish_extraction();
    }

    /// Submit what has been collected. Valid from `ready` or `extracting`.
    pub async fn submit(&mut self, note: Option<String>) {
        if !matches!(
            self.session.status,
            SessionStatus::Ready | SessionStatus::Extracting
        ) {
            debug!(status = ?self.session.status, "ignoring submit");
            return;
        }

        let results = self.usable_results();
        info!(count = results.len(), "submitting results");
        let note = note.filter(|n| !n.trim().is_empty());
        if let Some(id) = self.awaiting.take() {
            self.deliver(
                id,
                SearchOutcome {
                    results,
                    user_note: note,
                },
            );
        }

        self.close_engine_window().await;
        self.disarm_deadline();
        self.tracked.clear();
        self.content.clear();
        self.expected = 0;
        self.session.status = SessionStatus::Complete;
        self.effects.push(Effect::ScheduleReset {
            epoch: self.epoch,
            after: self.settings.grace(),
        });
    }

    /// Abort the session from any state.
    pub async fn cancel(&mut self) {
        if let Some(id) = self.awaiting.take() {
            info!(%id, "search canceled");
            self.deliver(id, SearchOutcome::single(SearchResult::canceled()));
        }
        self.close_engine_window().await;
        self.disarm_deadline();
        self.reset();
    }

    /// The grace period after `complete` ran out.
    pub fn on_reset_elapsed(&mut self, epoch: u64) {
        if epoch == self.epoch && self.session.status == SessionStatus::Complete {
            self.reset();
        }
    }

    /// Auto-close timer for a `ready` session.
    pub async fn on_auto_submit_elapsed(&mut self, epoch: u64) {
        if epoch == self.epoch && self.session.status == SessionStatus::Ready {
            info!("auto-submitting ready session");
            self.submit(None).await;
        }
    }

    /// A window was closed by something other than this session.
    pub fn on_window_closed(&mut self, window: WindowHandle) {
        let Some(engine) = self.engine else {
            return;
        };
        if engine.window != window {
            return;
        }
        self.engine = None;
        self.session.window = None;
        if !matches!(
            self.session.status,
            SessionStatus::Complete | SessionStatus::Ready
        ) {
            info!("engine window closed externally, dropping session");
            self.disarm_deadline();
            self.reset();
        }
    }

    /// Bring a worker tab to the front.
    pub async fn focus(&mut self, tab: TabHandle) {
        if !self.tracked.contains(&tab) {
            return;
        }
        if let Err(e) = self.host.focus_tab(tab).await {
            debug!(%tab, error = %e, "tab focus unavailable");
        }
    }

    fn usable_results(&self) -> Vec<SearchResult> {
        // Candidate rank order, not arrival order.
        self.session
            .sites
            .iter()
            .filter_map(|s| s.tab)
            .filter_map(|tab| self.content.get(&tab))
            .filter(|r| r.is_usable())
            .cloned()
            .map(SearchResult::from)
            .collect()
    }

    fn check_coverage(&mut self) {
        if self.session.status == SessionStatus::Extracting && self.content.len() >= self.expected
        {
            info!(collected = self.content.len(), "all workers reported");
            self.finish_extraction();
        }
    }

    fn finish_extraction(&mut self) {
        if self.session.status != SessionStatus::Extracting {
            return;
        }
        self.disarm_deadline();
        self.session.status = SessionStatus::Ready;
        if let Some(after) = self.settings.auto_submit_after() {
            self.effects.push(Effect::ScheduleAutoSubmit {
                epoch: self.epoch,
                after,
            });
        }
    }

    fn disarm_deadline(&mut self) {
        if self.deadline_armed {
            self.deadline_armed = false;
            self.effects.push(Effect::DisarmDeadline);
        }
    }

    fn deliver(&mut self, search_id: SearchId, outcome: SearchOutcome) {
        self.effects
            .push(Effect::Deliver(SearchCompletion { search_id, outcome }));
    }

    async fn close_engine_window(&mut self) {
        if let Some(engine) = self.engine.take() {
            if let Err(e) = self.host.close_window(engine.window).await {
                debug!(window = %engine.window, error = %e, "window already gone");
            }
        }
    }

    fn reset(&mut self) {
        self.epoch += 1;
        self.session = SessionSnapshot::default();
        self.engine = None;
        self.content.clear();
        self.tracked.clear();
        self.expected = 0;
        self.deadline_armed = false;
        self.awaiting = None;
    }
}

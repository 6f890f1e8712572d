//! Message plumbing around the [`Orchestrator`].
//!
//! A single [`Relay`] task owns the orchestrator and applies inbound messages one at a
//! time. Pages (through the tab host), observers and the tool-call bridge talk to it
//! through a cloneable [`RelayHandle`].

use crate::orchestrator::{Effect, Orchestrator};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tabpipe_core::{
    Candidate, Error, PageReport, Result, SearchCompletion, SearchId, SearchOutcome,
    SearchResult, SessionSnapshot, Settings, TabHandle, ToolSearch, WindowHandle,
};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info};

#[derive(Debug)]
pub enum Inbound {
    StartSearch {
        query: String,
        search_id: SearchId,
    },
    CandidatesReady {
        candidates: Vec<Candidate>,
        sender: TabHandle,
    },
    ContentReady {
        report: PageReport,
        sender: TabHandle,
    },
    /// The engine page could not be loaded.
    EngineFailed {
        reason: String,
        sender: TabHandle,
    },
    Submit {
        note: Option<String>,
    },
    Cancel,
    FocusTab(TabHandle),
    GetState(oneshot::Sender<SessionSnapshot>),
    SettingsUpdated(Settings),
    WindowClosed(WindowHandle),
}

#[derive(Debug, Clone, Copy)]
enum Timer {
    Deadline(u64),
    Reset(u64),
    AutoSubmit(u64),
}

/// Create the inbound channel. The sender half is what tab hosts post page reports to.
pub fn channel() -> (mpsc::UnboundedSender<Inbound>, mpsc::UnboundedReceiver<Inbound>) {
    mpsc::unbounded_channel()
}

pub struct Relay {
    orchestrator: Orchestrator,
    inbound: mpsc::UnboundedReceiver<Inbound>,
    timers_tx: mpsc::UnboundedSender<Timer>,
    timers_rx: mpsc::UnboundedReceiver<Timer>,
    state: watch::Sender<SessionSnapshot>,
    completions: mpsc::UnboundedSender<SearchCompletion>,
    deadline: Option<JoinHandle<()>>,
}

/// Cloneable access to a running [`Relay`].
#[derive(Clone)]
pub struct RelayHandle {
    tx: mpsc::UnboundedSender<Inbound>,
    state: watch::Receiver<SessionSnapshot>,
}

impl Relay {
    /// Wire a relay around `orchestrator`.
    ///
    /// Returns the relay (to be driven with [`Relay::run`]), a handle for senders and
    /// observers, and the stream of search completions addressed to waiting callers.
    pub fn new(
        orchestrator: Orchestrator,
        tx: mpsc::UnboundedSender<Inbound>,
        inbound: mpsc::UnboundedReceiver<Inbound>,
    ) -> (Self, RelayHandle, mpsc::UnboundedReceiver<SearchCompletion>) {
        let (state, state_rx) = watch::channel(orchestrator.snapshot());
        let (completions, completions_rx) = mpsc::unbounded_channel();
        let (timers_tx, timers_rx) = mpsc::unbounded_channel();
        let relay = Self {
            orchestrator,
            inbound,
            timers_tx,
            timers_rx,
            state,
            completions,
            deadline: None,
        };
        let handle = RelayHandle {
            tx,
            state: state_rx,
        };
        (relay, handle, completions_rx)
    }

    /// Process messages until the inbound channel closes.
    ///
    /// A host that posts reports holds an inbound sender and is owned by the orchestrator,
    /// so with such a host (like `HeadlessHost`) this runs until the task is aborted or
    /// the runtime shuts down.
    pub async fn run(mut self) {
        loop {
            tokio::select! {
                msg = self.inbound.recv() => match msg {
                    Some(msg) => self.dispatch(msg).await,
                    None => break,
                },
                Some(timer) = self.timers_rx.recv() => self.fire(timer).await,
            }
            self.apply_effects();
            self.publish();
        }
        if let Some(t) = self.deadline.take() {
            t.abort();
        }
        debug!("relay stopped");
    }

    async fn dispatch(&mut self, msg: Inbound) {
        let o = &mut self.orchestrator;
        match msg {
            Inbound::StartSearch { query, search_id } => o.start(&query, search_id).await,
            Inbound::CandidatesReady { candidates, sender } => {
                o.on_candidates(candidates, sender).await
            }
            Inbound::ContentReady { report, sender } => o.on_content(report, sender),
            Inbound::EngineFailed { reason, sender } => o.on_engine_failed(&reason, sender),
            Inbound::Submit { note } => o.submit(note).await,
            Inbound::Cancel => o.cancel().await,
            Inbound::FocusTab(tab) => o.focus(tab).await,
            Inbound::GetState(reply) => {
                let _ = reply.send(o.snapshot());
            }
            Inbound::SettingsUpdated(settings) => o.update_settings(settings),
            Inbound::WindowClosed(window) => o.on_window_closed(window),
        }
    }

    async fn fire(&mut self, timer: Timer) {
        let o = &mut self.orchestrator;
        match timer {
            Timer::Deadline(epoch) => o.on_deadline_elapsed(epoch),
            Timer::Reset(epoch) => o.on_reset_elapsed(epoch),
            Timer::AutoSubmit(epoch) => o.on_auto_submit_elapsed(epoch).await,
        }
    }

    fn schedule(&self, after: Duration, timer: Timer) -> JoinHandle<()> {
        let tx = self.timers_tx.clone();
        tokio::spawn(async move {
            tokio::time::sleep(after).await;
            let _ = tx.send(timer);
        })
    }

    fn apply_effects(&mut self) {
        for effect in self.orchestrator.take_effects() {
            match effect {
                Effect::Deliver(completion) => {
                    if self.completions.send(completion).is_err() {
                        debug!("no completion listener");
                    }
                }
                Effect::ArmDeadline { epoch, after } => {
                    if let Some(t) = self.deadline.take() {
                        t.abort();
                    }
                    self.deadline = Some(self.schedule(after, Timer::Deadline(epoch)));
                }
                Effect::DisarmDeadline => {
                    if let Some(t) = self.deadline.take() {
                        t.abort();
                    }
                }
                Effect::ScheduleReset { epoch, after } => {
                    self.schedule(after, Timer::Reset(epoch));
                }
                Effect::ScheduleAutoSubmit { epoch, after } => {
                    self.schedule(after, Timer::AutoSubmit(epoch));
                }
            }
        }
    }

    fn publish(&self) {
        let snapshot = self.orchestrator.snapshot();
        self.state.send_if_modified(|current| {
            if *current == snapshot {
                return false;
            }
            *current = snapshot;
            true
        });
    }
}

impl RelayHandle {
    pub fn send(&self, msg: Inbound) -> Result<()> {
        self.tx
            .send(msg)
            .map_err(|_| Error::Closed("relay is not running".to_string()))
    }

    pub fn start_search(&self, query: &str, search_id: SearchId) -> Result<()> {
        self.send(Inbound::StartSearch {
            query: query.to_string(),
            search_id,
        })
    }

    pub fn submit(&self, note: Option<String>) -> Result<()> {
        self.send(Inbound::Submit { note })
    }

    pub fn cancel(&self) -> Result<()> {
        self.send(Inbound::Cancel)
    }

    pub fn focus(&self, tab: TabHandle) -> Result<()> {
        self.send(Inbound::FocusTab(tab))
    }

    pub fn update_settings(&self, settings: Settings) -> Result<()> {
        self.send(Inbound::SettingsUpdated(settings))
    }

    pub async fn get_state(&self) -> Result<SessionSnapshot> {
        let (tx, rx) = oneshot::channel();
        self.send(Inbound::GetState(tx))?;
        rx.await
            .map_err(|_| Error::Closed("relay dropped state request".to_string()))
    }

    /// Subscribe to state changes. The receiver starts at the latest snapshot.
    pub fn subscribe(&self) -> watch::Receiver<SessionSnapshot> {
        self.state.clone()
    }
}

type Pending = Arc<Mutex<HashMap<SearchId, oneshot::Sender<SearchOutcome>>>>;

/// [`ToolSearch`] over a relay: starts a search and waits for the completion carrying
/// its search id, or gives up after `timeout` with a single "Timeout" result.
#[derive(Clone)]
pub struct SearchBridge {
    relay: RelayHandle,
    pending: Pending,
    next_id: Arc<AtomicU64>,
    timeout: Duration,
}

impl SearchBridge {
    /// Must be called inside a tokio runtime: spawns the completion router.
    pub fn new(
        relay: RelayHandle,
        completions: mpsc::UnboundedReceiver<SearchCompletion>,
        timeout: Duration,
    ) -> Self {
        let pending: Pending = Arc::new(Mutex::new(HashMap::new()));
        tokio::spawn(route_completions(completions, pending.clone()));
        Self {
            relay,
            pending,
            next_id: Arc::new(AtomicU64::new(0)),
            timeout,
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<SearchId, oneshot::Sender<SearchOutcome>>> {
        self.pending.lock().unwrap_or_else(|e| e.into_inner())
    }
}

async fn route_completions(
    mut completions: mpsc::UnboundedReceiver<SearchCompletion>,
    pending: Pending,
) {
    while let Some(c) = completions.recv().await {
        let waiter = pending
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&c.search_id);
        match waiter {
            Some(tx) => {
                let _ = tx.send(c.outcome);
            }
            None => debug!(search_id = %c.search_id, "completion for unknown search"),
        }
    }
}

#[async_trait::async_trait]
impl ToolSearch for SearchBridge {
    async fn search(&self, query: &str) -> Result<SearchOutcome> {
        let id = SearchId(self.next_id.fetch_add(1, Ordering::SeqCst) + 1);
        let (tx, rx) = oneshot::channel();
        self.lock().insert(id, tx);

        if let Err(e) = self.relay.start_search(query, id) {
            self.lock().remove(&id);
            return Err(e);
        }

        match tokio::time::timeout(self.timeout, rx).await {
            Ok(Ok(outcome)) => Ok(outcome),
            Ok(Err(_)) => Err(Error::Closed("search completion dropped".to_string())),
            Err(_) => {
                self.lock().remove(&id);
                info!(search_id = %id, "search timed out");
                Ok(SearchOutcome::single(SearchResult::timed_out()))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::orchestrator::tests::{candidate, loaded, FakeHost};
    use tabpipe_core::{SessionStatus, SiteStatus};

    struct Rig {
        handle: RelayHandle,
        bridge: SearchBridge,
    }

    fn rig(settings: Settings) -> Rig {
        let host = Arc::new(FakeHost::default());
        let timeout = settings.tool_timeout();
        let (tx, rx) = channel();
        let (relay, handle, completions) =
            Relay::new(Orchestrator::new(host, settings), tx, rx);
        tokio::spawn(relay.run());
        let bridge = SearchBridge::new(handle.clone(), completions, timeout);
        Rig { handle, bridge }
    }

    async fn wait_for(
        rx: &mut watch::Receiver<SessionSnapshot>,
        status: SessionStatus,
    ) -> SessionSnapshot {
        rx.wait_for(|s| s.status == status).await.unwrap().clone()
    }

    async fn engine_tab(handle: &RelayHandle) -> TabHandle {
        // FakeHost hands out window 1 then tab 2 for the first engine window.
        let _ = handle.get_state().await.unwrap();
        TabHandle(2)
    }

    #[tokio::test(start_paused = true)]
    async fn deadline_elapses_into_ready_and_submit_resolves_the_search() {
        let r = rig(Settings {
            tool_timeout_ms: 3_600_000,
            ..Default::default()
        });
        let mut state = r.handle.subscribe();

        let bridge = r.bridge.clone();
        let search = tokio::spawn(async move { bridge.search("cats").await });

        wait_for(&mut state, SessionStatus::Searching).await;
        let engine = engine_tab(&r.handle).await;
        r.handle
            .send(Inbound::CandidatesReady {
                candidates: vec![candidate("a"), candidate("b")],
                sender: engine,
            })
            .unwrap();
        let snap = wait_for(&mut state, SessionStatus::Extracting).await;
        let tab_a = snap.sites[0].tab.unwrap();
        r.handle
            .send(Inbound::ContentReady {
                report: loaded("a", "hello"),
                sender: tab_a,
            })
            .unwrap();

        tokio::time::advance(Duration::from_millis(600_001)).await;
        let snap = wait_for(&mut state, SessionStatus::Ready).await;
        assert_eq!(snap.sites[1].status, SiteStatus::Loading);

        r.handle.submit(Some("be brief".to_string())).unwrap();
        let outcome = search.await.unwrap().unwrap();
        assert_eq!(outcome.results.len(), 1);
        assert_eq!(outcome.results[0].url, "a");
        assert_eq!(outcome.user_note.as_deref(), Some("be brief"));

        wait_for(&mut state, SessionStatus::Complete).await;
        tokio::time::advance(Duration::from_millis(5_001)).await;
        let snap = wait_for(&mut state, SessionStatus::Idle).await;
        assert_eq!(snap, SessionSnapshot::default());
    }

    #[tokio::test(start_paused = true)]
    async fn search_times_out_with_canned_result() {
        let r = rig(Settings {
            tool_timeout_ms: 1_000,
            ..Default::default()
        });
        let outcome = r.bridge.search("cats").await.unwrap();
        assert_eq!(outcome.results, vec![SearchResult::timed_out()]);
        assert!(r.bridge.lock().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_resolves_waiting_search_with_marker() {
        let r = rig(Settings::default());
        let mut state = r.handle.subscribe();
        let bridge = r.bridge.clone();
        let search = tokio::spawn(async move { bridge.search("cats").await });

        wait_for(&mut state, SessionStatus::Searching).await;
        r.handle.cancel().unwrap();
        let outcome = search.await.unwrap().unwrap();
        assert_eq!(outcome.results, vec![SearchResult::canceled()]);
        assert_eq!(r.handle.get_state().await.unwrap().status, SessionStatus::Idle);
    }

    #[tokio::test(start_paused = true)]
    async fn auto_close_submits_without_user_action() {
        let r = rig(Settings {
            auto_close: true,
            extract_timeout_s: 1,
            ..Default::default()
        });
        let mut state = r.handle.subscribe();
        let bridge = r.bridge.clone();
        let search = tokio::spawn(async move { bridge.search("cats").await });

        wait_for(&mut state, SessionStatus::Searching).await;
        let engine = engine_tab(&r.handle).await;
        r.handle
            .send(Inbound::CandidatesReady {
                candidates: vec![candidate("a")],
                sender: engine,
            })
            .unwrap();
        let snap = wait_for(&mut state, SessionStatus::Extracting).await;
        r.handle
            .send(Inbound::ContentReady {
                report: loaded("a", "hello"),
                sender: snap.sites[0].tab.unwrap(),
            })
            .unwrap();

        wait_for(&mut state, SessionStatus::Ready).await;
        tokio::time::advance(Duration::from_millis(1_001)).await;
        let outcome = search.await.unwrap().unwrap();
        assert_eq!(outcome.results.len(), 1);
    }

    #[tokio::test]
    async fn handle_reports_closed_relay() {
        let host = Arc::new(FakeHost::default());
        let (tx, rx) = channel();
        let (relay, handle, _completions) =
            Relay::new(Orchestrator::new(host, Settings::default()), tx, rx);
        drop(relay);
        assert!(matches!(handle.cancel(), Err(Error::Closed(_))));
    }
}

//! A [`TabHost`] without a browser: every "tab" is a tokio task that fetches its page with
//! `reqwest` and posts the page's report back to the relay.

use crate::relay::Inbound;
use crate::{engine, extract};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;
use tabpipe_core::{
    EngineTab, Error, PageReport, Result, Settings, TabHandle, TabHost, WindowHandle,
};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// When a worker reads its page, relative to the page having loaded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExtractWait {
    /// Wait a fixed delay after load (lets late content settle in a real browser).
    Fixed(Duration),
    /// Extract as soon as the page is loaded.
    OnLoad,
}

impl ExtractWait {
    /// `extract_delay_ms == 0` means extract on load.
    pub fn from_settings(settings: &Settings) -> Self {
        if settings.extract_delay_ms == 0 {
            ExtractWait::OnLoad
        } else {
            ExtractWait::Fixed(settings.extract_delay())
        }
    }

    async fn settle(self) {
        if let ExtractWait::Fixed(d) = self {
            tokio::time::sleep(d).await;
        }
    }
}

struct LoadedPage {
    url: String,
    status: u16,
    content_type: Option<String>,
    body: Vec<u8>,
}

async fn load(client: &reqwest::Client, url: &str) -> Result<LoadedPage> {
    let resp = client
        .get(url)
        .send()
        .await
        .map_err(|e| Error::Host(e.to_string()))?;
    let status = resp.status().as_u16();
    let final_url = resp.url().to_string();
    let content_type = resp
        .headers()
        .get(reqwest::header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .map(|s| s.to_string());
    let body = resp
        .bytes()
        .await
        .map_err(|e| Error::Host(e.to_string()))?
        .to_vec();
    Ok(LoadedPage {
        url: final_url,
        status,
        content_type,
        body,
    })
}

/// What an extraction worker reports for `url`.
async fn read_page(client: &reqwest::Client, url: &str, wait: ExtractWait) -> PageReport {
    let page = match load(client, url).await {
        Ok(p) => p,
        Err(e) => {
            debug!(url, error = %e, "worker page failed to load");
            return extract::error_report(url, "");
        }
    };
    wait.settle().await;
    match page.status {
        200..=299 => extract::report_from_body(&page.url, page.content_type.as_deref(), &page.body),
        401 | 403 | 429 => PageReport {
            reason: Some(extract::REASON_BLOCKED.to_string()),
            ..extract::error_report(&page.url, "")
        },
        status => {
            debug!(url = %page.url, status, "worker page returned an error status");
            extract::error_report(&page.url, "")
        }
    }
}

/// Load the engine page. Unreachable engines and error statuses fail the window.
async fn load_engine(client: &reqwest::Client, url: &str) -> Result<LoadedPage> {
    let page = load(client, url).await.map_err(|e| {
        warn!(url, error = %e, "engine page failed to load");
        e
    })?;
    if !(200..300).contains(&page.status) {
        warn!(url, status = page.status, "engine page returned an error status");
        return Err(Error::Host(format!("engine answered {} for {url}", page.status)));
    }
    Ok(page)
}

type Tabs = HashMap<WindowHandle, Vec<(TabHandle, JoinHandle<()>)>>;

pub struct HeadlessHost {
    client: reqwest::Client,
    events: mpsc::UnboundedSender<Inbound>,
    wait: Mutex<ExtractWait>,
    max_results: AtomicUsize,
    next_id: AtomicU64,
    windows: Mutex<Tabs>,
    focused: Mutex<Option<TabHandle>>,
}

impl HeadlessHost {
    /// `events` is the relay's inbound sender; page reports are posted there.
    pub fn new(
        client: reqwest::Client,
        events: mpsc::UnboundedSender<Inbound>,
        settings: &Settings,
    ) -> Self {
        Self {
            client,
            events,
            wait: Mutex::new(ExtractWait::from_settings(settings)),
            max_results: AtomicUsize::new(settings.max_results),
            next_id: AtomicU64::new(0),
            windows: Mutex::new(HashMap::new()),
            focused: Mutex::new(None),
        }
    }

    pub fn with_wait(self, wait: ExtractWait) -> Self {
        *self.wait.lock().unwrap_or_else(|e| e.into_inner()) = wait;
        self
    }

    fn wait(&self) -> ExtractWait {
        *self.wait.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn next(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::SeqCst) + 1
    }

    fn tabs(&self) -> MutexGuard<'_, Tabs> {
        self.windows.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Tabs still open, over all windows.
    pub fn open_tab_count(&self) -> usize {
        self.tabs().values().map(|t| t.len()).sum()
    }

    /// The tab most recently brought to the front.
    pub fn focused(&self) -> Option<TabHandle> {
        *self.focused.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[async_trait::async_trait]
impl TabHost for HeadlessHost {
    fn name(&self) -> &'static str {
        "headless"
    }

    fn update_settings(&self, settings: &Settings) {
        self.max_results.store(settings.max_results, Ordering::SeqCst);
        *self.wait.lock().unwrap_or_else(|e| e.into_inner()) = ExtractWait::from_settings(settings);
    }

    async fn open_window(&self, url: &str, private: bool) -> Result<EngineTab> {
        url::Url::parse(url).map_err(|e| Error::InvalidUrl(format!("{url}: {e}")))?;
        if private {
            debug!("headless windows keep no state; private mode is implicit");
        }
        let window = WindowHandle(self.next());
        let tab = TabHandle(self.next());

        // Events are queued behind the current relay message, so the orchestrator knows
        // the engine tab by the time they are read.
        let client = self.client.clone();
        let events = self.events.clone();
        let max_results = self.max_results.load(Ordering::SeqCst);
        let url = url.to_string();
        let task = tokio::spawn(async move {
            let msg = match load_engine(&client, &url).await {
                Ok(page) => {
                    let candidates = engine::parse_candidates(
                        &String::from_utf8_lossy(&page.body),
                        &page.url,
                        max_results,
                    );
                    debug!(%tab, count = candidates.len(), "engine page reported");
                    Inbound::CandidatesReady {
                        candidates,
                        sender: tab,
                    }
                }
                Err(e) => Inbound::EngineFailed {
                    reason: e.to_string(),
                    sender: tab,
                },
            };
            let _ = events.send(msg);
        });

        self.tabs().insert(window, vec![(tab, task)]);
        Ok(EngineTab { window, tab })
    }

    async fn open_tab(&self, window: WindowHandle, url: &str, _active: bool) -> Result<TabHandle> {
        url::Url::parse(url).map_err(|e| Error::InvalidUrl(format!("{url}: {e}")))?;
        let mut tabs = self.tabs();
        let slot = tabs
            .get_mut(&window)
            .ok_or_else(|| Error::Host(format!("{window} is not open")))?;
        let tab = TabHandle(self.next());

        let client = self.client.clone();
        let events = self.events.clone();
        let wait = self.wait();
        let url = url.to_string();
        let task = tokio::spawn(async move {
            let report = read_page(&client, &url, wait).await;
            debug!(%tab, blocked = report.blocked, "worker page reported");
            let _ = events.send(Inbound::ContentReady {
                report,
                sender: tab,
            });
        });
        slot.push((tab, task));
        Ok(tab)
    }

    async fn close_window(&self, window: WindowHandle) -> Result<()> {
        let tabs = self
            .tabs()
            .remove(&window)
            .ok_or_else(|| Error::Host(format!("{window} is not open")))?;
        for (_, task) in tabs {
            task.abort();
        }
        Ok(())
    }

    async fn focus_tab(&self, tab: TabHandle) -> Result<()> {
        let known = self
            .tabs()
            .values()
            .any(|t| t.iter().any(|(h, _)| *h == tab));
        if !known {
            return Err(Error::Host(format!("{tab} is not open")));
        }
        *self.focused.lock().unwrap_or_else(|e| e.into_inner()) = Some(tab);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::orchestrator::Orchestrator;
    use crate::relay::{channel, Relay, RelayHandle, SearchBridge};
    use axum::extract::Path;
    use axum::http::StatusCode;
    use axum::response::Html;
    use axum::routing::get;
    use std::sync::Arc;
    use tabpipe_core::{SessionSnapshot, SessionStatus, SiteStatus, ToolSearch};
    use tokio::sync::watch;

    const ARTICLE: &str = "Tokio is an asynchronous runtime for the Rust programming language. \
        It provides the building blocks needed for writing network applications.";

    async fn serve_fixture() -> String {
        let app = axum::Router::new()
            .route(
                "/html/",
                get(|| async {
                    Html(
                        r#"<html><body>
                          <a class="result__a" href="/page/good">Good page</a>
                          <a class="result__a" href="/page/short">Short page</a>
                          <a class="result__a" href="/page/forbidden">Forbidden</a>
                          <a class="result__a" href="/page/missing">Missing</a>
                        </body></html>"#,
                    )
                }),
            )
            .route(
                "/page/:name",
                get(|Path(name): Path<String>| async move {
                    match name.as_str() {
                        "good" => (
                            StatusCode::OK,
                            Html(format!(
                                "<html><head><title>Tokio</title></head><body><article>{ARTICLE}</article></body></html>"
                            )),
                        ),
                        "short" => (StatusCode::OK, Html("<html><body>hi</body></html>".to_string())),
                        "forbidden" => (StatusCode::FORBIDDEN, Html(String::new())),
                        _ => (StatusCode::NOT_FOUND, Html(String::new())),
                    }
                }),
            );
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        format!("http://{addr}")
    }

    struct Rig {
        host: Arc<HeadlessHost>,
        handle: RelayHandle,
        bridge: SearchBridge,
    }

    fn rig(settings: Settings) -> Rig {
        let (tx, rx) = channel();
        let host = Arc::new(HeadlessHost::new(reqwest::Client::new(), tx.clone(), &settings));
        let timeout = settings.tool_timeout();
        let (relay, handle, completions) =
            Relay::new(Orchestrator::new(host.clone(), settings), tx, rx);
        tokio::spawn(relay.run());
        let bridge = SearchBridge::new(handle.clone(), completions, timeout);
        Rig {
            host,
            handle,
            bridge,
        }
    }

    async fn wait_for(
        rx: &mut watch::Receiver<SessionSnapshot>,
        status: SessionStatus,
    ) -> SessionSnapshot {
        rx.wait_for(|s| s.status == status).await.unwrap().clone()
    }

    #[test]
    fn zero_delay_means_on_load() {
        let mut s = Settings::default();
        assert_eq!(
            ExtractWait::from_settings(&s),
            ExtractWait::Fixed(Duration::from_millis(3_000))
        );
        s.extract_delay_ms = 0;
        assert_eq!(ExtractWait::from_settings(&s), ExtractWait::OnLoad);
    }

    #[tokio::test]
    async fn full_search_against_fixture_pages() {
        let base = serve_fixture().await;
        let r = rig(Settings {
            engine_url: format!("{base}/html/?q={{query}}"),
            extract_delay_ms: 0,
            ..Default::default()
        });
        let mut state = r.handle.subscribe();
        let bridge = r.bridge.clone();
        let search = tokio::spawn(async move { bridge.search("tokio runtime").await });

        let snap = wait_for(&mut state, SessionStatus::Ready).await;
        let statuses: Vec<_> = snap.sites.iter().map(|s| s.status).collect();
        assert_eq!(
            statuses,
            [
                SiteStatus::Loaded,
                SiteStatus::Blocked,
                SiteStatus::Blocked,
                SiteStatus::Error
            ]
        );
        assert_eq!(snap.query.as_deref(), Some("tokio runtime"));

        let good = snap.sites[0].tab.unwrap();
        r.handle.focus(good).unwrap();
        let _ = r.handle.get_state().await.unwrap();
        assert_eq!(r.host.focused(), Some(good));

        r.handle.submit(None).unwrap();
        let outcome = search.await.unwrap().unwrap();
        assert_eq!(outcome.results.len(), 1);
        assert_eq!(outcome.results[0].title, "Tokio");
        assert_eq!(outcome.results[0].url, format!("{base}/page/good"));
        assert!(outcome.results[0].content.starts_with("Tokio is an asynchronous runtime"));

        wait_for(&mut state, SessionStatus::Complete).await;
        assert_eq!(r.host.open_tab_count(), 0);
    }

    #[tokio::test]
    async fn unreachable_engine_puts_the_session_in_error() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let dead = listener.local_addr().unwrap();
        drop(listener);
        let r = rig(Settings {
            engine_url: format!("http://{dead}/?q={{query}}"),
            ..Default::default()
        });
        let mut state = r.handle.subscribe();
        let bridge = r.bridge.clone();
        let search = tokio::spawn(async move { bridge.search("anything").await });

        let snap = wait_for(&mut state, SessionStatus::Error).await;
        assert!(snap.sites.is_empty());
        // Only the engine tab was ever opened.
        assert_eq!(r.host.open_tab_count(), 1);

        r.handle.cancel().unwrap();
        let outcome = search.await.unwrap().unwrap();
        assert_eq!(outcome.results, vec![tabpipe_core::SearchResult::canceled()]);
        assert_eq!(r.host.open_tab_count(), 0);
    }

    #[tokio::test]
    async fn engine_page_without_results_is_an_empty_ready_session() {
        let base = serve_fixture().await;
        let r = rig(Settings {
            engine_url: format!("{base}/page/short?q={{query}}"),
            auto_close: true,
            extract_timeout_s: 0,
            ..Default::default()
        });
        let outcome = r.bridge.search("anything").await.unwrap();
        assert!(outcome.results.is_empty());
        assert!(outcome.user_note.is_none());
    }

    #[tokio::test]
    async fn settings_update_reaches_the_host_before_the_next_search() {
        let base = serve_fixture().await;
        let initial = Settings {
            engine_url: format!("{base}/html/?q={{query}}"),
            max_results: 1,
            extract_delay_ms: 3_600_000,
            ..Default::default()
        };
        let r = rig(initial.clone());
        r.handle
            .update_settings(Settings {
                max_results: 3,
                extract_delay_ms: 0,
                ..initial
            })
            .unwrap();

        let mut state = r.handle.subscribe();
        let bridge = r.bridge.clone();
        tokio::spawn(async move { bridge.search("tokio runtime").await });

        // An hour-long wait left in the host would keep the session extracting.
        let snap = tokio::time::timeout(
            Duration::from_secs(20),
            wait_for(&mut state, SessionStatus::Ready),
        )
        .await
        .expect("new extraction wait applied");
        let statuses: Vec<SiteStatus> = snap.sites.iter().map(|s| s.status).collect();
        assert_eq!(
            statuses,
            [SiteStatus::Loaded, SiteStatus::Blocked, SiteStatus::Blocked]
        );
    }

    #[tokio::test]
    async fn closing_a_window_aborts_its_tabs() {
        let (tx, mut rx) = channel();
        let settings = Settings::default();
        let host = HeadlessHost::new(reqwest::Client::new(), tx, &settings)
            .with_wait(ExtractWait::Fixed(Duration::from_secs(3_600)));
        let base = serve_fixture().await;
        let engine = host
            .open_window(&format!("{base}/html/"), false)
            .await
            .unwrap();
        let tab = host
            .open_tab(engine.window, &format!("{base}/page/good"), false)
            .await
            .unwrap();
        assert_eq!(host.open_tab_count(), 2);
        assert!(host.open_tab(WindowHandle(999), &base, false).await.is_err());
        assert!(host.open_window("not a url", false).await.is_err());

        // The engine tab reports quickly; the worker is parked in its settle delay.
        match rx.recv().await.unwrap() {
            Inbound::CandidatesReady { candidates, sender } => {
                assert_eq!(sender, engine.tab);
                assert_eq!(candidates.len(), 4);
            }
            other => panic!("unexpected {other:?}"),
        }
        host.close_window(engine.window).await.unwrap();
        assert_eq!(host.open_tab_count(), 0);
        assert!(host.focus_tab(tab).await.is_err());
        assert!(host.close_window(engine.window).await.is_err());
        drop(host);
        assert!(rx.recv().await.is_none());
    }
}

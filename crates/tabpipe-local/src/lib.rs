pub mod engine;
pub mod extract;
pub mod headless;
pub mod interceptor;
pub mod manifest;
pub mod orchestrator;
pub mod relay;
pub mod sse;

use std::sync::Arc;
use std::time::Duration;
use tabpipe_core::{Error, Result, Settings};

pub use headless::{ExtractWait, HeadlessHost};
pub use interceptor::{ChatRequest, ChatResponse, ChatUpstream, Interceptor, ReqwestUpstream};
pub use manifest::ToolManifest;
pub use orchestrator::Orchestrator;
pub use relay::{Inbound, Relay, RelayHandle, SearchBridge};

const USER_AGENT: &str = concat!("tabpipe/", env!("CARGO_PKG_VERSION"));

/// Client used by headless tabs to load pages.
pub fn page_client() -> Result<reqwest::Client> {
    reqwest::Client::builder()
        .user_agent(USER_AGENT)
        .redirect(reqwest::redirect::Policy::limited(10))
        // Avoid "hang forever" on DNS/TLS/body stalls.
        .connect_timeout(Duration::from_secs(10))
        .timeout(Duration::from_secs(30))
        .build()
        .map_err(|e| Error::Host(e.to_string()))
}

/// Client used to reach the chat-completions upstream.
///
/// No overall timeout: streamed completions may legitimately run for minutes.
pub fn upstream_client() -> Result<reqwest::Client> {
    reqwest::Client::builder()
        .connect_timeout(Duration::from_secs(10))
        .build()
        .map_err(|e| Error::Upstream(e.to_string()))
}

/// A running headless session: relay task, tab host and tool-call bridge.
pub struct HeadlessSession {
    pub host: Arc<HeadlessHost>,
    pub relay: RelayHandle,
    pub bridge: SearchBridge,
}

impl HeadlessSession {
    /// Spawn the relay on the current tokio runtime.
    pub fn spawn(settings: Settings) -> Result<Self> {
        let client = page_client()?;
        let (tx, rx) = relay::channel();
        let host = Arc::new(HeadlessHost::new(client, tx.clone(), &settings));
        let timeout = settings.tool_timeout();
        let (relay, handle, completions) =
            Relay::new(Orchestrator::new(host.clone(), settings), tx, rx);
        tokio::spawn(relay.run());
        let bridge = SearchBridge::new(handle.clone(), completions, timeout);
        Ok(Self {
            host,
            relay: handle,
            bridge,
        })
    }
}

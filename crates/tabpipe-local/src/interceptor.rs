//! Tool-call interception for chat-completion traffic.
//!
//! Outbound requests get the tool manifest injected. Responses are drained and
//! reassembled; if the model asked for a web search, the search runs out of band and the
//! request is replayed with the tool result appended, and the replayed response is
//! returned instead of the first one.

use crate::manifest::{ToolManifest, SEARCH_TOOL};
use crate::sse::{StreamAccumulator, ToolCall};
use futures_util::future::BoxFuture;
use futures_util::stream::BoxStream;
use futures_util::StreamExt;
use std::sync::Arc;
use tabpipe_core::settings::url_matches;
use tabpipe_core::{Error, Result, SearchOutcome, ToolSearch};
use tracing::{debug, info, warn};

pub const CHAT_COMPLETIONS_PATH: &str = "/v1/chat/completions";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChatRequest {
    pub method: String,
    pub url: String,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
    /// The page that issued the request, used for the activation allowlist.
    pub page_url: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChatResponse {
    pub status: u16,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
}

pub struct UpstreamResponse {
    pub status: u16,
    pub headers: Vec<(String, String)>,
    pub body: BoxStream<'static, Result<Vec<u8>>>,
}

/// Where intercepted requests are actually sent.
#[async_trait::async_trait]
pub trait ChatUpstream: Send + Sync {
    async fn send(&self, req: &ChatRequest) -> Result<UpstreamResponse>;
}

fn is_hop_header(name: &str) -> bool {
    matches!(
        name.trim().to_ascii_lowercase().as_str(),
        "host"
            | "content-length"
            | "connection"
            | "keep-alive"
            | "transfer-encoding"
            | "te"
            | "trailer"
            | "upgrade"
            | "proxy-connection"
            | "accept-encoding"
            | "content-encoding"
    )
}

/// Drop headers that describe one hop's framing rather than the message.
pub fn end_to_end_headers(headers: &[(String, String)]) -> Vec<(String, String)> {
    headers
        .iter()
        .filter(|(k, _)| !is_hop_header(k))
        .cloned()
        .collect()
}

#[derive(Debug, Clone)]
pub struct ReqwestUpstream {
    client: reqwest::Client,
}

impl ReqwestUpstream {
    pub fn new(client: reqwest::Client) -> Self {
        Self { client }
    }
}

#[async_trait::async_trait]
impl ChatUpstream for ReqwestUpstream {
    async fn send(&self, req: &ChatRequest) -> Result<UpstreamResponse> {
        let method = reqwest::Method::from_bytes(req.method.as_bytes())
            .map_err(|e| Error::Upstream(format!("bad method {}: {e}", req.method)))?;
        let url = url::Url::parse(&req.url).map_err(|e| Error::InvalidUrl(e.to_string()))?;
        let mut rb = self.client.request(method, url);
        for (k, v) in end_to_end_headers(&req.headers) {
            if let (Ok(name), Ok(value)) = (
                reqwest::header::HeaderName::from_bytes(k.as_bytes()),
                reqwest::header::HeaderValue::from_str(&v),
            ) {
                rb = rb.header(name, value);
            }
        }
        if !req.body.is_empty() {
            rb = rb.body(req.body.clone());
        }
        let resp = rb.send().await.map_err(|e| Error::Upstream(e.to_string()))?;

        let status = resp.status().as_u16();
        let headers = resp
            .headers()
            .iter()
            .filter_map(|(k, v)| {
                v.to_str()
                    .ok()
                    .map(|s| (k.as_str().to_string(), s.to_string()))
            })
            .collect();
        let body = resp
            .bytes_stream()
            .map(|chunk| {
                chunk
                    .map(|b| b.to_vec())
                    .map_err(|e| Error::Upstream(e.to_string()))
            })
            .boxed();
        Ok(UpstreamResponse {
            status,
            headers,
            body,
        })
    }
}

pub fn is_chat_completions(url: &str) -> bool {
    url.contains(CHAT_COMPLETIONS_PATH)
}

/// True when some message already carries a tool result (this request is a replay).
pub fn has_tool_result(body: &serde_json::Value) -> bool {
    body.get("messages")
        .and_then(|m| m.as_array())
        .is_some_and(|msgs| {
            msgs.iter()
                .any(|m| m.get("role").and_then(|r| r.as_str()) == Some("tool"))
        })
}

/// Add `tools` to a request body unless it is already a tool-result replay.
///
/// Returns `None` when the body is not a JSON object; the caller forwards it untouched.
pub fn inject_tools(body: &[u8], manifest: &ToolManifest) -> Option<Vec<u8>> {
    let mut v: serde_json::Value = serde_json::from_slice(body).ok()?;
    let obj = v.as_object_mut()?;
    let replay = has_tool_result(&serde_json::Value::Object(obj.clone()));
    if !replay {
        obj.insert("tools".to_string(), manifest.as_value().clone());
    }
    serde_json::to_vec(&v).ok()
}

/// Render search results as the tool message text.
pub fn format_tool_results(outcome: &SearchOutcome) -> String {
    let prefix = match outcome.user_note.as_deref() {
        Some(note) if !note.is_empty() => format!("User note: {note}\n\n"),
        _ => String::new(),
    };
    let blocks: Vec<String> = outcome
        .results
        .iter()
        .enumerate()
        .map(|(i, r)| format!("[{}] {}\nURL: {}\n{}\n", i + 1, r.title, r.url, r.content))
        .collect();
    prefix + &blocks.join("\n---\n")
}

/// The original request plus the assistant's tool call and the tool's answer.
pub fn continuation_body(original: &[u8], call: &ToolCall, result_text: &str) -> Result<Vec<u8>> {
    let mut v: serde_json::Value =
        serde_json::from_slice(original).map_err(|e| Error::Protocol(e.to_string()))?;
    let obj = v
        .as_object_mut()
        .ok_or_else(|| Error::Protocol("request body is not an object".to_string()))?;
    let mut messages = obj
        .get("messages")
        .and_then(|m| m.as_array())
        .cloned()
        .unwrap_or_default();
    messages.push(serde_json::json!({
        "role": "assistant",
        "tool_calls": [{
            "id": call.id,
            "type": "function",
            "function": {
                "name": call.function.name,
                "arguments": call.function.arguments,
            }
        }]
    }));
    messages.push(serde_json::json!({
        "role": "tool",
        "tool_call_id": call.id,
        "content": result_text,
    }));
    obj.insert("messages".to_string(), serde_json::Value::Array(messages));
    serde_json::to_vec(&v).map_err(|e| Error::Protocol(e.to_string()))
}

fn search_query(call: &ToolCall) -> Option<String> {
    let args: serde_json::Value = serde_json::from_str(&call.function.arguments).ok()?;
    args.get("query")
        .and_then(|q| q.as_str())
        .map(|s| s.to_string())
}

/// Searches run for one chat request before the model's next tool call is returned as-is.
pub const MAX_SEARCH_ROUNDS: usize = 3;

pub struct Interceptor {
    upstream: Arc<dyn ChatUpstream>,
    search: Arc<dyn ToolSearch>,
    manifest: ToolManifest,
    url_patterns: Vec<String>,
}

impl Interceptor {
    pub fn new(
        upstream: Arc<dyn ChatUpstream>,
        search: Arc<dyn ToolSearch>,
        manifest: ToolManifest,
        url_patterns: Vec<String>,
    ) -> Self {
        Self {
            upstream,
            search,
            manifest,
            url_patterns,
        }
    }

    fn active_for(&self, req: &ChatRequest) -> bool {
        let page = req.page_url.as_deref().unwrap_or(&req.url);
        is_chat_completions(&req.url) && url_matches(page, &self.url_patterns)
    }

    /// Send `req` upstream, running any web search the model asks for.
    ///
    /// Network failures from the upstream are returned as-is.
    pub fn handle(&self, req: ChatRequest) -> BoxFuture<'_, Result<ChatResponse>> {
        self.handle_round(req, 0)
    }

    fn handle_round(&self, req: ChatRequest, round: usize) -> BoxFuture<'_, Result<ChatResponse>> {
        Box::pin(async move {
            if !self.active_for(&req) {
                return self.passthrough(&req).await;
            }

            let mut req = req;
            match inject_tools(&req.body, &self.manifest) {
                Some(body) => req.body = body,
                None => warn!(url = %req.url, "request body is not a JSON object, forwarding as-is"),
            }
            debug!(url = %req.url, "forwarding chat request");

            let resp = self.upstream.send(&req).await?;
            let status = resp.status;
            let headers = resp.headers;
            let mut acc = StreamAccumulator::new();
            let mut body = resp.body;
            while let Some(chunk) = body.next().await {
                acc.feed(&chunk?);
            }
            let (parsed, raw) = acc.finish();
            debug!(
                tool_calls = parsed.tool_calls.len(),
                content_chars = parsed.content.chars().count(),
                "response drained"
            );

            let call = parsed
                .tool_calls
                .iter()
                .find(|c| c.function.name == SEARCH_TOOL);
            if call.is_some() && round >= MAX_SEARCH_ROUNDS {
                warn!(round, "web_search requested again after the round limit, returning response");
            } else if let Some(call) = call {
                match search_query(call) {
                    Some(query) => {
                        info!(query = %query, "model requested web search");
                        let outcome = self.search.search(&query).await?;
                        let text = format_tool_results(&outcome);
                        let body = continuation_body(&req.body, call, &text)?;
                        info!(results = outcome.results.len(), "replaying request with tool results");
                        let next = ChatRequest {
                            body,
                            ..req.clone()
                        };
                        return self.handle_round(next, round + 1).await;
                    }
                    None => {
                        warn!(arguments = %call.function.arguments, "unreadable web_search arguments");
                    }
                }
            }

            Ok(ChatResponse {
                status,
                headers: end_to_end_headers(&headers),
                body: raw,
            })
        })
    }

    async fn passthrough(&self, req: &ChatRequest) -> Result<ChatResponse> {
        let resp = self.upstream.send(req).await?;
        let mut body = Vec::new();
        let mut stream = resp.body;
        while let Some(chunk) = stream.next().await {
            body.extend_from_slice(&chunk?);
        }
        Ok(ChatResponse {
            status: resp.status,
            headers: end_to_end_headers(&resp.headers),
            body,
        })
    }
}

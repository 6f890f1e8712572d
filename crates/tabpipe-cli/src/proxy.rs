//! HTTP front for an OpenAI-style server. Every request is forwarded to the upstream;
//! chat completions go through the tool-call interceptor on the way.

use crate::envelope::{error_obj, ErrorCode};
use axum::body::Body;
use axum::extract::{Request, State};
use axum::http::{HeaderName, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Router;
use std::sync::Arc;
use tabpipe_local::{ChatRequest, Interceptor};
use tracing::warn;

/// Request bodies larger than this are refused.
const MAX_BODY_BYTES: usize = 32 * 1024 * 1024;

pub(crate) struct ProxyState {
    pub(crate) interceptor: Interceptor,
    /// Scheme, host and optional path prefix of the upstream, e.g. `http://127.0.0.1:11434`.
    pub(crate) upstream_base: String,
}

pub(crate) fn router(state: Arc<ProxyState>) -> Router {
    Router::new().fallback(forward).with_state(state)
}

fn json_error(status: StatusCode, error: serde_json::Value) -> Response {
    (status, axum::Json(serde_json::json!({ "error": error }))).into_response()
}

/// The page a request came from, for the activation allowlist.
fn page_url(headers: &[(String, String)]) -> Option<String> {
    let find = |name: &str| {
        headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.clone())
    };
    find("referer").or_else(|| find("origin"))
}

async fn forward(State(state): State<Arc<ProxyState>>, req: Request) -> Response {
    let (parts, body) = req.into_parts();
    let body = match axum::body::to_bytes(body, MAX_BODY_BYTES).await {
        Ok(b) => b.to_vec(),
        Err(e) => {
            return json_error(
                StatusCode::PAYLOAD_TOO_LARGE,
                error_obj(ErrorCode::InvalidParams, e, "Request body could not be read."),
            )
        }
    };
    let path = parts
        .uri
        .path_and_query()
        .map(|p| p.as_str())
        .unwrap_or("/");
    let headers: Vec<(String, String)> = parts
        .headers
        .iter()
        .filter_map(|(k, v)| {
            v.to_str()
                .ok()
                .map(|s| (k.as_str().to_string(), s.to_string()))
        })
        .collect();

    let chat = ChatRequest {
        method: parts.method.as_str().to_string(),
        url: format!("{}{}", state.upstream_base.trim_end_matches('/'), path),
        page_url: page_url(&headers),
        headers,
        body,
    };

    match state.interceptor.handle(chat).await {
        Ok(resp) => {
            let mut out = Response::new(Body::from(resp.body));
            *out.status_mut() = StatusCode::from_u16(resp.status).unwrap_or(StatusCode::BAD_GATEWAY);
            for (k, v) in resp.headers {
                if let (Ok(name), Ok(value)) = (
                    HeaderName::from_bytes(k.as_bytes()),
                    HeaderValue::from_str(&v),
                ) {
                    out.headers_mut().append(name, value);
                }
            }
            out
        }
        Err(e) => {
            warn!(error = %e, "upstream request failed");
            json_error(
                StatusCode::BAD_GATEWAY,
                error_obj(
                    ErrorCode::from(&e),
                    &e,
                    "Check that the upstream server is running and reachable.",
                ),
            )
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn referer_wins_over_origin() {
        let h = vec![
            ("Origin".to_string(), "http://localhost:3000".to_string()),
            ("Referer".to_string(), "http://localhost:3000/c/1".to_string()),
        ];
        assert_eq!(page_url(&h).as_deref(), Some("http://localhost:3000/c/1"));
        assert_eq!(page_url(&h[..1]).as_deref(), Some("http://localhost:3000"));
        assert_eq!(page_url(&[]), None);
    }
}

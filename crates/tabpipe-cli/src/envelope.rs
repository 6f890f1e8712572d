use serde::Serialize;
use tabpipe_core::{SearchOutcome, SearchResult, SessionSnapshot, SiteStatus};

pub(crate) const SCHEMA_VERSION: u64 = 1;

pub(crate) fn warning_hint(code: &'static str) -> Option<&'static str> {
    match code {
        "no_results" => Some(
            "No page yielded readable text. The engine may have returned no links (check TABPIPE_ENGINE_URL), or every result page was blocked.",
        ),
        "sites_blocked" => Some(
            "Some result pages were blocked (challenge, paywall, too little text) or failed to load; their text is not included.",
        ),
        "search_timed_out" => Some(
            "No outcome arrived within tool_timeout_ms. Raise TABPIPE_TOOL_TIMEOUT_MS, or set TABPIPE_AUTO_CLOSE=1 so ready sessions submit themselves.",
        ),
        "engine_unreachable" => Some(
            "The search-engine page could not be loaded. Check network access and TABPIPE_ENGINE_URL.",
        ),
        "search_canceled" => Some("The search was canceled before results were submitted."),
        "search_superseded" => Some(
            "A newer search replaced this one before it finished. Only one search runs at a time.",
        ),
        _ => None,
    }
}

pub(crate) fn warning_hints_from(codes: &[&'static str]) -> serde_json::Value {
    let mut m = serde_json::Map::new();
    for c in codes {
        if let Some(h) = warning_hint(c) {
            m.insert((*c).to_string(), serde_json::json!(h));
        }
    }
    serde_json::Value::Object(m)
}

/// Warning codes describing how a search ended.
pub(crate) fn outcome_warnings(
    outcome: &SearchOutcome,
    sites: Option<&SessionSnapshot>,
) -> Vec<&'static str> {
    let mut out = Vec::new();
    match outcome.results.as_slice() {
        [only] if *only == SearchResult::timed_out() => out.push("search_timed_out"),
        [only] if *only == SearchResult::canceled() => out.push("search_canceled"),
        [only] if *only == SearchResult::superseded() => out.push("search_superseded"),
        [] => out.push("no_results"),
        _ => {}
    }
    if sites.is_some_and(|s| {
        s.sites
            .iter()
            .any(|site| matches!(site.status, SiteStatus::Blocked | SiteStatus::Error))
    }) {
        out.push("sites_blocked");
    }
    out
}

/// Whether an outcome carries real results rather than a terminal marker.
pub(crate) fn outcome_ok(outcome: &SearchOutcome) -> bool {
    !outcome_warnings(outcome, None)
        .iter()
        .any(|w| w.starts_with("search_"))
}

#[derive(Clone, Copy, Debug)]
pub(crate) enum ErrorCode {
    InvalidParams,
    InvalidUrl,
    NotConfigured,
    NotSupported,
    HostFailed,
    UpstreamFailed,
    UnexpectedError,
}

impl ErrorCode {
    pub(crate) fn as_str(self) -> &'static str {
        match self {
            Self::InvalidParams => "invalid_params",
            Self::InvalidUrl => "invalid_url",
            Self::NotConfigured => "not_configured",
            Self::NotSupported => "not_supported",
            Self::HostFailed => "host_failed",
            Self::UpstreamFailed => "upstream_failed",
            Self::UnexpectedError => "unexpected_error",
        }
    }

    pub(crate) fn retryable(self) -> bool {
        match self {
            Self::HostFailed | Self::UpstreamFailed => true,
            // Configuration + invalid input are not retryable without changing something.
            Self::InvalidParams
            | Self::InvalidUrl
            | Self::NotConfigured
            | Self::NotSupported
            | Self::UnexpectedError => false,
        }
    }
}

impl From<&tabpipe_core::Error> for ErrorCode {
    fn from(e: &tabpipe_core::Error) -> Self {
        use tabpipe_core::Error;
        match e {
            Error::InvalidUrl(_) => Self::InvalidUrl,
            Error::Host(_) => Self::HostFailed,
            Error::Upstream(_) | Error::Protocol(_) => Self::UpstreamFailed,
            Error::Config(_) => Self::NotConfigured,
            Error::NotSupported(_) => Self::NotSupported,
            Error::Closed(_) => Self::UnexpectedError,
        }
    }
}

pub(crate) fn add_envelope_fields(payload: &mut serde_json::Value, kind: &str, elapsed_ms: u128) {
    payload["schema_version"] = serde_json::json!(SCHEMA_VERSION);
    payload["kind"] = serde_json::json!(kind);
    payload["elapsed_ms"] = serde_json::json!(elapsed_ms);
    if payload.get("error").is_none() {
        payload["error"] = serde_json::Value::Null;
    }
}

pub(crate) fn error_obj(
    code: ErrorCode,
    message: impl ToString,
    hint: impl ToString,
) -> serde_json::Value {
    #[derive(Serialize)]
    struct ErrorObject {
        code: &'static str,
        message: String,
        hint: String,
        retryable: bool,
    }

    let e = ErrorObject {
        code: code.as_str(),
        message: message.to_string(),
        hint: hint.to_string(),
        retryable: code.retryable(),
    };
    match serde_json::to_value(e) {
        Ok(v) => v,
        Err(_) => serde_json::json!({
            "code": code.as_str(),
            "message": message.to_string(),
            "hint": hint.to_string(),
            "retryable": code.retryable()
        }),
    }
}

//! The closed error taxonomy the whole middleware stack returns and the router switches on.
//!
//! Every component hands errors upward as this enum; only [`crate::router`] ever turns one
//! into an HTTP status code. Nothing downstream of the router matches on error strings.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;

use crate::coalescer::LeaderCancelled;

#[derive(Debug, Clone, thiserror::Error)]
pub enum GatewayError {
    /// Not really an error: internal signal that a cache lookup found nothing usable.
    #[error("cache miss")]
    CacheMiss,

    /// Monthly quota has been exhausted; this call must not reach the upstream.
    #[error("monthly quota exceeded")]
    QuotaExceeded,

    /// The circuit breaker is not admitting calls right now.
    #[error("circuit breaker open")]
    BreakerOpen,

    /// Transport error, 5xx, 429, timeout, or malformed body from upstream. Recorded as a
    /// breaker failure. `rate_limited` distinguishes a 429 for the `api_calls_total` label.
    #[error("upstream transient failure: {0}")]
    UpstreamTransientFailure(String),

    /// Upstream 429 specifically; a transient failure for breaker purposes but labelled
    /// differently in metrics.
    #[error("upstream rate limited")]
    UpstreamRateLimited,

    /// Upstream 4xx (other than 429). Reflects bad caller input, not an upstream health signal.
    #[error("upstream rejected request: {status}: {body}")]
    UpstreamClientError { status: u16, body: String },

    /// The KV store is unreachable or timed out. Never mutates a counter.
    #[error("store unavailable: {0}")]
    StoreUnavailable(String),

    /// Structural query-parameter validation failed before any middleware ran.
    #[error("invalid parameter: {0}")]
    ParameterValidation(String),
}

impl GatewayError {
    pub fn kind(&self) -> &'static str {
        match self {
            GatewayError::CacheMiss => "CacheMiss",
            GatewayError::QuotaExceeded => "QuotaExceeded",
            GatewayError::BreakerOpen => "BreakerOpen",
            GatewayError::UpstreamTransientFailure(_) => "UpstreamTransientFailure",
            GatewayError::UpstreamRateLimited => "UpstreamTransientFailure",
            GatewayError::UpstreamClientError { .. } => "UpstreamClientError",
            GatewayError::StoreUnavailable(_) => "StoreUnavailable",
            GatewayError::ParameterValidation(_) => "ParameterValidation",
        }
    }
}

impl LeaderCancelled for GatewayError {
    /// Published to coalescer waiters if the leader task is ever dropped (panic, abort)
    /// before it settles the computation normally.
    fn leader_cancelled() -> Self {
        GatewayError::UpstreamTransientFailure(
            "coalescer leader task was cancelled before publishing a result".into(),
        )
    }
}

impl IntoResponse for GatewayError {
    fn into_response(self) -> Response {
        // Upstream 4xx (other than 429) is passed through verbatim with the upstream's own
        // body and status code; every other kind originates at the gateway and gets the
        // uniform { "error", "detail" } envelope.
        if let GatewayError::UpstreamClientError { status, body } = &self {
            let code = StatusCode::from_u16(*status).unwrap_or(StatusCode::BAD_REQUEST);
            let parsed: serde_json::Value =
                serde_json::from_str(body).unwrap_or_else(|_| json!({ "raw": body }));
            return (code, Json(parsed)).into_response();
        }

        let status = match &self {
            GatewayError::CacheMiss => StatusCode::INTERNAL_SERVER_ERROR,
            GatewayError::QuotaExceeded => StatusCode::TOO_MANY_REQUESTS,
            GatewayError::BreakerOpen => StatusCode::SERVICE_UNAVAILABLE,
            GatewayError::UpstreamTransientFailure(_) => StatusCode::BAD_GATEWAY,
            GatewayError::UpstreamRateLimited => StatusCode::TOO_MANY_REQUESTS,
            GatewayError::UpstreamClientError { .. } => unreachable!(),
            GatewayError::StoreUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            GatewayError::ParameterValidation(_) => StatusCode::BAD_REQUEST,
        };
        let body = Json(json!({ "error": self.kind(), "detail": self.to_string() }));
        (status, body).into_response()
    }
}

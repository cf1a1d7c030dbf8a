//! Request router: the thin HTTP surface.
//!
//! Handlers extract and structurally validate query parameters, hand off to
//! [`crate::upstream::UpstreamCaller::call`], and translate [`GatewayError`] into HTTP
//! responses. Nothing downstream of here knows about HTTP.

use std::sync::Arc;

use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::json;
use tower_http::trace::TraceLayer;

use crate::breaker::BreakerState;
use crate::error::GatewayError;
use crate::quota::next_month_reset_date;
use crate::upstream::UpstreamCaller;

#[derive(Clone)]
pub struct AppState {
    pub upstream: Arc<UpstreamCaller>,
}

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/airports", get(airports))
        .route("/flights", get(flights))
        .route("/health", get(health))
        .route("/stats", get(stats))
        .route("/usage", get(usage))
        .route("/metrics", get(metrics))
        .with_state(state)
        .layer(TraceLayer::new_for_http())
}

#[derive(Debug, Deserialize, Default)]
pub struct AirportsQuery {
    pub iata_code: Option<String>,
    pub search: Option<String>,
    pub country_iso2: Option<String>,
    pub limit: Option<String>,
}

#[derive(Debug, Deserialize, Default)]
pub struct FlightsQuery {
    pub flight_iata: Option<String>,
    pub dep_iata: Option<String>,
    pub arr_iata: Option<String>,
    pub airline_iata: Option<String>,
    pub flight_status: Option<String>,
    pub flight_date: Option<String>,
    pub limit: Option<String>,
}

async fn airports(
    State(state): State<AppState>,
    Query(q): Query<AirportsQuery>,
) -> Result<Response, GatewayError> {
    let limit = validate_limit(q.limit.as_deref())?;
    let iata_code = q.iata_code.map(|s| s.to_ascii_uppercase());
    let country_iso2 = q.country_iso2.map(|s| s.to_ascii_uppercase());

    let params: Vec<(&str, &str)> = vec![
        ("iata_code", iata_code.as_deref().unwrap_or("")),
        ("search", q.search.as_deref().unwrap_or("")),
        ("country_iso2", country_iso2.as_deref().unwrap_or("")),
        ("limit", limit.as_deref().unwrap_or("")),
    ];

    let payload = state.upstream.call("airports", &params).await?;
    Ok(Json(payload).into_response())
}

async fn flights(
    State(state): State<AppState>,
    Query(q): Query<FlightsQuery>,
) -> Result<Response, GatewayError> {
    let limit = validate_limit(q.limit.as_deref())?;
    if let Some(date) = &q.flight_date {
        validate_date(date)?;
    }
    let flight_iata = q.flight_iata.map(|s| s.to_ascii_uppercase());
    let dep_iata = q.dep_iata.map(|s| s.to_ascii_uppercase());
    let arr_iata = q.arr_iata.map(|s| s.to_ascii_uppercase());
    let airline_iata = q.airline_iata.map(|s| s.to_ascii_uppercase());

    let params: Vec<(&str, &str)> = vec![
        ("flight_iata", flight_iata.as_deref().unwrap_or("")),
        ("dep_iata", dep_iata.as_deref().unwrap_or("")),
        ("arr_iata", arr_iata.as_deref().unwrap_or("")),
        ("airline_iata", airline_iata.as_deref().unwrap_or("")),
        ("flight_status", q.flight_status.as_deref().unwrap_or("")),
        ("flight_date", q.flight_date.as_deref().unwrap_or("")),
        ("limit", limit.as_deref().unwrap_or("")),
    ];

    let payload = state.upstream.call("flights", &params).await?;
    Ok(Json(payload).into_response())
}

/// Clamps to `[1, 100]`, defaulting to 100. Anything non-numeric is a
/// `ParameterValidation` error surfaced before any middleware is consulted.
fn validate_limit(raw: Option<&str>) -> Result<Option<String>, GatewayError> {
    let Some(raw) = raw else {
        return Ok(Some("100".to_string()));
    };
    let parsed: i64 = raw
        .parse()
        .map_err(|_| GatewayError::ParameterValidation(format!("limit must be an integer: {raw}")))?;
    Ok(Some(parsed.clamp(1, 100).to_string()))
}

fn validate_date(raw: &str) -> Result<(), GatewayError> {
    let bytes = raw.as_bytes();
    let shape_ok = bytes.len() == 10
        && bytes[4] == b'-'
        && bytes[7] == b'-'
        && bytes
            .iter()
            .enumerate()
            .all(|(i, b)| i == 4 || i == 7 || b.is_ascii_digit());
    if !shape_ok {
        return Err(GatewayError::ParameterValidation(format!(
            "flight_date must match YYYY-MM-DD: {raw}"
        )));
    }
    Ok(())
}

async fn health(State(state): State<AppState>) -> Result<Json<serde_json::Value>, GatewayError> {
    let quota = state.upstream.quota().snapshot()?;
    let month = state.upstream.quota().month_tag()?;
    let breaker_state = state.upstream.breaker().state();
    refresh_gauges(&state, &quota, breaker_state);
    Ok(Json(json!({
        "status": "ok",
        "rate_limit": rate_limit_block(&month, &quota),
        "cache": { "enabled": true },
        "circuit_breaker": breaker_block(breaker_state),
    })))
}

async fn stats(State(state): State<AppState>) -> Result<Json<serde_json::Value>, GatewayError> {
    let quota = state.upstream.quota().snapshot()?;
    let month = state.upstream.quota().month_tag()?;
    let breaker_state = state.upstream.breaker().state();
    refresh_gauges(&state, &quota, breaker_state);
    Ok(Json(json!({
        "status": "ok",
        "rate_limit": rate_limit_block(&month, &quota),
        "cache": { "enabled": true },
        "circuit_breaker": breaker_block(breaker_state),
        "metrics_text": state.upstream.metrics().encode(),
    })))
}

async fn usage(State(state): State<AppState>) -> Result<Json<serde_json::Value>, GatewayError> {
    let quota = state.upstream.quota().snapshot()?;
    let month = state.upstream.quota().month_tag()?;
    refresh_gauges(&state, &quota, state.upstream.breaker().state());
    Ok(Json(json!({
        "rate_limit": rate_limit_block(&month, &quota),
        "reset_date": next_month_reset_date(),
    })))
}

async fn metrics(State(state): State<AppState>) -> Response {
    // Gauges are refreshed on read so `/metrics` reflects the current quota and breaker
    // state even between reservations.
    if let Ok(quota) = state.upstream.quota().snapshot() {
        refresh_gauges(&state, &quota, state.upstream.breaker().state());
    }

    let body = state.upstream.metrics().encode();
    (
        StatusCode::OK,
        [("content-type", "text/plain; version=0.0.4")],
        body,
    )
        .into_response()
}

/// Updates the `rate_limit_*` and `circuit_breaker_state` gauges. Shared by every
/// operational endpoint, since each one reads a live snapshot of the quota and breaker.
fn refresh_gauges(state: &AppState, quota: &crate::quota::QuotaSnapshot, breaker_state: BreakerState) {
    state
        .upstream
        .metrics()
        .set_rate_limit(quota.used, quota.remaining);
    state
        .upstream
        .metrics()
        .set_breaker_state(breaker_state.as_gauge());
}

fn rate_limit_block(month: &str, quota: &crate::quota::QuotaSnapshot) -> serde_json::Value {
    json!({
        "month": month,
        "used": quota.used,
        "limit": quota.ceiling,
        "remaining": quota.remaining,
    })
}

fn breaker_block(state: BreakerState) -> serde_json::Value {
    let label = match state {
        BreakerState::Closed => "closed",
        BreakerState::Open => "open",
        BreakerState::HalfOpen => "half_open",
    };
    json!({ "state": label, "gauge": state.as_gauge() })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn validate_limit_clamps_to_bounds() {
        assert_eq!(validate_limit(Some("500")).unwrap(), Some("100".into()));
        assert_eq!(validate_limit(Some("0")).unwrap(), Some("1".into()));
        assert_eq!(validate_limit(Some("42")).unwrap(), Some("42".into()));
        assert_eq!(validate_limit(None).unwrap(), Some("100".into()));
    }

    #[test]
    fn validate_limit_rejects_non_numeric() {
        assert!(validate_limit(Some("abc")).is_err());
    }

    #[test]
    fn validate_date_accepts_iso_shape_only() {
        assert!(validate_date("2025-11-03").is_ok());
        assert!(validate_date("2025/11/03").is_err());
        assert!(validate_date("not-a-date").is_err());
    }
}

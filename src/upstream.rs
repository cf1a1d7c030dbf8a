//! Upstream caller: the heart of the design — composes the cache, breaker, coalescer
//! and quota ledger around one raw HTTP call to the aviation provider.
//!
//! The `reqwest::Client` is built once at startup and held behind this struct, never
//! constructed per call — the one pattern borrowed wholesale from the teacher's own
//! `UpstreamClient`.

use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tracing::{debug, warn};

use crate::breaker::CircuitBreaker;
use crate::cache::{cache_key, Cache, CacheLookup};
use crate::coalescer::{Coalescer, Role};
use crate::error::GatewayError;
use crate::metrics::{CallStatus, Metrics};
use crate::quota::QuotaLedger;
use crate::store::Store;

#[derive(Clone)]
pub struct AviationClient {
    http: reqwest::Client,
    base_url: String,
    api_key: String,
    request_timeout: Duration,
}

impl AviationClient {
    pub fn new(base_url: String, api_key: String, request_timeout: Duration) -> Self {
        let http = reqwest::Client::builder()
            .user_agent("aviation-gateway/0.1")
            .connect_timeout(Duration::from_secs(10))
            .build()
            .expect("reqwest client");
        Self {
            http,
            base_url,
            api_key,
            request_timeout,
        }
    }

    async fn get_json(
        &self,
        endpoint: &str,
        params: &[(&str, &str)],
    ) -> Result<(u16, Value), reqwest::Error> {
        let url = format!("{}/{}", self.base_url.trim_end_matches('/'), endpoint);
        let mut query: Vec<(&str, &str)> = params.iter().filter(|(_, v)| !v.is_empty()).cloned().collect();
        query.push(("access_key", self.api_key.as_str()));

        let resp = self
            .http
            .get(url)
            .query(&query)
            .timeout(self.request_timeout)
            .send()
            .await?;
        let status = resp.status().as_u16();
        let body = resp.json::<Value>().await.unwrap_or(Value::Null);
        Ok((status, body))
    }
}

pub struct UpstreamCaller {
    client: AviationClient,
    cache: Cache,
    breaker: CircuitBreaker,
    coalescer: Coalescer<Value, GatewayError>,
    quota: Arc<QuotaLedger>,
    metrics: Arc<Metrics>,
    store: Arc<Store>,
}

impl UpstreamCaller {
    pub fn new(
        client: AviationClient,
        cache: Cache,
        breaker: CircuitBreaker,
        quota: Arc<QuotaLedger>,
        metrics: Arc<Metrics>,
        store: Arc<Store>,
    ) -> Self {
        Self {
            client,
            cache,
            breaker,
            coalescer: Coalescer::new(),
            quota,
            metrics,
            store,
        }
    }

    pub fn breaker(&self) -> &CircuitBreaker {
        &self.breaker
    }

    pub fn quota(&self) -> &QuotaLedger {
        &self.quota
    }

    pub fn metrics(&self) -> &Metrics {
        &self.metrics
    }

    /// `call(endpoint, params)` — the fixed ten-step composition: cache, breaker, coalescer,
    /// quota, upstream request, classify, cache, return.
    ///
    /// Takes `self: &Arc<Self>` so the leader's own computation (steps 5–10, run in
    /// [`UpstreamCaller::lead`]) can be spawned onto a detached task: the leader's caller
    /// abandoning this call (request timeout, client disconnect) must not cancel work that
    /// coalesced followers are waiting on.
    pub async fn call(self: &Arc<Self>, endpoint: &str, params: &[(&str, &str)]) -> Result<Value, GatewayError> {
        // 1. Compute cache key.
        let key = cache_key(endpoint, params);

        // 2. Cache precedes everything.
        if let CacheLookup::Hit(payload) = self.cache.get(&key)? {
            self.metrics.record_cache_hit(endpoint);
            debug!(endpoint, key = %key, "cache hit");
            return Ok(payload);
        }
        self.metrics.record_cache_miss(endpoint);

        // 3. Breaker admission gate.
        if !self.breaker.can_execute() {
            warn!(endpoint, "breaker open, refusing call without touching quota or upstream");
            return Err(GatewayError::BreakerOpen);
        }

        let owned_endpoint = endpoint.to_string();
        let owned_params: Vec<(String, String)> = params
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        let owned_key = key.clone();
        let this = Arc::clone(self);

        // 4. Coalesce on the cache key. The role the coalescer decided — leader or
        // follower — is reported back through `on_join`, in the same critical section
        // that decided it, so the coalesced-request counter can never race with it.
        let result = self
            .coalescer
            .execute(
                &key,
                move || async move { this.lead(owned_endpoint, owned_params, owned_key).await },
                |role| {
                    if role == Role::Follower {
                        self.metrics.record_coalesced(endpoint);
                    }
                },
            )
            .await?;

        Ok(result)
    }

    /// Steps 5–10: only ever run by the coalescer's leader for a given key, on a detached
    /// task (see [`UpstreamCaller::call`]).
    async fn lead(
        self: Arc<Self>,
        endpoint: String,
        params: Vec<(String, String)>,
        key: String,
    ) -> Result<Value, GatewayError> {
        // 5. Reserve quota. A policy gate, not an upstream failure: no breaker mutation.
        self.quota.reserve()?;

        // 6. Issue the HTTP call.
        let borrowed: Vec<(&str, &str)> = borrow_pairs(&params);
        let outcome = self.client.get_json(&endpoint, &borrowed).await;

        match outcome {
            Err(e) => {
                // 7. Transport error: breaker failure, not cached.
                self.breaker.record_failure();
                self.metrics.record_api_call(&endpoint, CallStatus::Error);
                warn!(endpoint, error = %e, "upstream transport error");
                Err(GatewayError::UpstreamTransientFailure(e.to_string()))
            }
            Ok((status, body)) => self.handle_response(&endpoint, &key, status, body),
        }
    }

    fn handle_response(
        &self,
        endpoint: &str,
        key: &str,
        status: u16,
        body: Value,
    ) -> Result<Value, GatewayError> {
        if status == 429 {
            // 7. Upstream 429 is a breaker failure with status label `rate_limited`.
            self.breaker.record_failure();
            self.metrics
                .record_api_call(endpoint, CallStatus::RateLimited);
            return Err(GatewayError::UpstreamRateLimited);
        }
        if status >= 500 {
            self.breaker.record_failure();
            self.metrics.record_api_call(endpoint, CallStatus::Error);
            return Err(GatewayError::UpstreamTransientFailure(format!(
                "upstream returned {status}"
            )));
        }
        if status >= 400 {
            // 4xx other than 429 reflects caller input, not upstream health: not a breaker
            // failure, not cached, surfaced to the caller as-is.
            self.metrics.record_api_call(endpoint, CallStatus::Error);
            return Err(GatewayError::UpstreamClientError {
                status,
                body: body.to_string(),
            });
        }
        if body.is_null() {
            // 2xx but a non-JSON or empty body is malformed: still a breaker failure.
            self.breaker.record_failure();
            self.metrics.record_api_call(endpoint, CallStatus::Error);
            return Err(GatewayError::UpstreamTransientFailure(
                "malformed (non-JSON) upstream body".into(),
            ));
        }

        // 8. Success.
        self.breaker.record_success();
        self.metrics.record_api_call(endpoint, CallStatus::Success);

        if endpoint == "flights" {
            self.populate_flight_history(&body);
        }

        // 9. Store in cache.
        self.cache.put(key, body.clone())?;

        // 10. Return payload.
        Ok(body)
    }

    /// Upserts one history record per flight object carrying both `flight.iata` and
    /// `flight_date`. Best-effort: a store failure here must not fail the proxy call that
    /// already succeeded.
    fn populate_flight_history(&self, body: &Value) {
        let Some(items) = body.get("data").and_then(Value::as_array) else {
            return;
        };
        for item in items {
            let flight_iata = item
                .get("flight")
                .and_then(|f| f.get("iata"))
                .and_then(Value::as_str);
            let flight_date = item.get("flight_date").and_then(Value::as_str);
            if let (Some(iata), Some(date)) = (flight_iata, flight_date) {
                if let Err(e) = self.store.history_upsert(iata, date, item.clone()) {
                    warn!(iata, date, error = %e, "failed to upsert flight history record");
                }
            }
        }
    }
}

fn borrow_pairs(owned: &[(String, String)]) -> Vec<(&str, &str)> {
    owned.iter().map(|(k, v)| (k.as_str(), v.as_str())).collect()
}

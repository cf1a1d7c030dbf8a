//! Metrics surface: counters and gauges in Prometheus text format.

use prometheus::{Encoder, IntCounterVec, IntGauge, Registry, TextEncoder};

pub struct Metrics {
    registry: Registry,
    cache_hits: IntCounterVec,
    cache_misses: IntCounterVec,
    api_calls: IntCounterVec,
    coalesced_requests: IntCounterVec,
    circuit_breaker_state: IntGauge,
    rate_limit_used: IntGauge,
    rate_limit_remaining: IntGauge,
}

pub enum CallStatus {
    Success,
    Error,
    RateLimited,
}

impl CallStatus {
    fn label(&self) -> &'static str {
        match self {
            CallStatus::Success => "success",
            CallStatus::Error => "error",
            CallStatus::RateLimited => "rate_limited",
        }
    }
}

impl Metrics {
    pub fn new() -> Self {
        let registry = Registry::new();

        let cache_hits = IntCounterVec::new(
            prometheus::Opts::new("cache_hits_total", "Cache hits"),
            &["endpoint"],
        )
        .expect("valid metric");
        let cache_misses = IntCounterVec::new(
            prometheus::Opts::new("cache_misses_total", "Cache misses"),
            &["endpoint"],
        )
        .expect("valid metric");
        let api_calls = IntCounterVec::new(
            prometheus::Opts::new("api_calls_total", "Upstream calls issued"),
            &["endpoint", "status"],
        )
        .expect("valid metric");
        let coalesced_requests = IntCounterVec::new(
            prometheus::Opts::new(
                "coalesced_requests_total",
                "Requests that joined an in-flight call instead of leading one",
            ),
            &["endpoint"],
        )
        .expect("valid metric");
        let circuit_breaker_state = IntGauge::new(
            "circuit_breaker_state",
            "0=CLOSED, 1=HALF_OPEN, 2=OPEN",
        )
        .expect("valid metric");
        let rate_limit_used = IntGauge::new("rate_limit_used", "Quota calls used this month")
            .expect("valid metric");
        let rate_limit_remaining = IntGauge::new(
            "rate_limit_remaining",
            "Quota calls remaining this month",
        )
        .expect("valid metric");

        registry
            .register(Box::new(cache_hits.clone()))
            .expect("register cache_hits");
        registry
            .register(Box::new(cache_misses.clone()))
            .expect("register cache_misses");
        registry
            .register(Box::new(api_calls.clone()))
            .expect("register api_calls");
        registry
            .register(Box::new(coalesced_requests.clone()))
            .expect("register coalesced_requests");
        registry
            .register(Box::new(circuit_breaker_state.clone()))
            .expect("register circuit_breaker_state");
        registry
            .register(Box::new(rate_limit_used.clone()))
            .expect("register rate_limit_used");
        registry
            .register(Box::new(rate_limit_remaining.clone()))
            .expect("register rate_limit_remaining");

        Self {
            registry,
            cache_hits,
            cache_misses,
            api_calls,
            coalesced_requests,
            circuit_breaker_state,
            rate_limit_used,
            rate_limit_remaining,
        }
    }

    pub fn record_cache_hit(&self, endpoint: &str) {
        self.cache_hits.with_label_values(&[endpoint]).inc();
    }

    pub fn record_cache_miss(&self, endpoint: &str) {
        self.cache_misses.with_label_values(&[endpoint]).inc();
    }

    pub fn record_api_call(&self, endpoint: &str, status: CallStatus) {
        self.api_calls
            .with_label_values(&[endpoint, status.label()])
            .inc();
    }

    pub fn record_coalesced(&self, endpoint: &str) {
        self.coalesced_requests.with_label_values(&[endpoint]).inc();
    }

    pub fn set_breaker_state(&self, gauge_value: i64) {
        self.circuit_breaker_state.set(gauge_value);
    }

    pub fn set_rate_limit(&self, used: u64, remaining: u64) {
        self.rate_limit_used.set(used as i64);
        self.rate_limit_remaining.set(remaining as i64);
    }

    /// Renders the registry in Prometheus text exposition format for `/metrics`.
    pub fn encode(&self) -> String {
        let families = self.registry.gather();
        let mut buf = Vec::new();
        TextEncoder::new()
            .encode(&families, &mut buf)
            .expect("prometheus text encoding cannot fail for well-formed metrics");
        String::from_utf8(buf).expect("prometheus output is valid utf-8")
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_start_at_zero_and_increment() {
        let m = Metrics::new();
        assert!(m.encode().contains("cache_hits_total"));
        m.record_cache_hit("airports");
        m.record_cache_hit("airports");
        m.record_cache_miss("flights");
        let text = m.encode();
        assert!(text.contains("cache_hits_total{endpoint=\"airports\"} 2"));
        assert!(text.contains("cache_misses_total{endpoint=\"flights\"} 1"));
    }

    #[test]
    fn gauges_reflect_last_set_value() {
        let m = Metrics::new();
        m.set_rate_limit(9_999, 1);
        m.set_breaker_state(2);
        let text = m.encode();
        assert!(text.contains("rate_limit_used 9999"));
        assert!(text.contains("rate_limit_remaining 1"));
        assert!(text.contains("circuit_breaker_state 2"));
    }

    #[test]
    fn api_calls_are_labelled_by_endpoint_and_status() {
        let m = Metrics::new();
        m.record_api_call("flights", CallStatus::Success);
        m.record_api_call("flights", CallStatus::RateLimited);
        let text = m.encode();
        assert!(text.contains("api_calls_total{endpoint=\"flights\",status=\"success\"} 1"));
        assert!(text.contains("api_calls_total{endpoint=\"flights\",status=\"rate_limited\"} 1"));
    }
}

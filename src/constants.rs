//! Default values for the middleware stack, overridable via environment (see [`crate::config`]).

pub const DEFAULT_CACHE_TTL_SECONDS: u64 = 300;
pub const DEFAULT_QUOTA_CEILING: u64 = 10_000;
pub const DEFAULT_BREAKER_FAILURE_THRESHOLD: u32 = 5;
pub const DEFAULT_BREAKER_RECOVERY_SECONDS: u64 = 30;
pub const DEFAULT_BREAKER_HALF_OPEN_PROBES: u32 = 3;
pub const DEFAULT_LISTEN_ADDR: &str = "127.0.0.1:8080";
pub const DEFAULT_REQUEST_TIMEOUT_SECONDS: u64 = 10;
pub const DEFAULT_STORE_PATH: &str = "./data/gateway-store";
pub const DEFAULT_UPSTREAM_BASE_URL: &str = "https://api.aviationstack.com/v1";
pub const DEFAULT_LOG_LEVEL: &str = "info";

/// Fixed document id for the singleton monthly quota ledger.
pub const QUOTA_LEDGER_ID: &str = "aviationstack_api_calls";

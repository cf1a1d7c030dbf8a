//! Library crate for the aviation data gateway. `src/main.rs` is a thin binary entrypoint;
//! everything else lives here so integration tests can exercise the router directly.

pub mod breaker;
pub mod cache;
pub mod coalescer;
pub mod config;
pub mod constants;
pub mod error;
pub mod metrics;
pub mod quota;
pub mod router;
pub mod store;
pub mod upstream;

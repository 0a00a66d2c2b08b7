//! Observability for Muxy: tracing initialization and the per-worker
//! proxy counters served over the memcached wire (`stats proxy`).

pub mod logger;
pub mod stats;

pub use stats::{ProxyStats, StatsRegistry};

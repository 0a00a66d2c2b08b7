//! Where cluster configs come from (REST polling, saved state) and how
//! the last-known-good one is kept across restarts.

pub mod persist;
pub mod source;

pub use source::{ConfigSource, RestSource, spawn_rest_poller};

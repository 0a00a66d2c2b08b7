//! Core types for the Muxy memcached proxy: cluster model, behavior
//! tunables, key routing, and the unified error type.

pub mod behavior;
pub mod cluster;
pub mod config;
pub mod error;
pub mod route;

pub use behavior::Behavior;
pub use cluster::{BackendKind, ClusterConfig, ServerSpec};
pub use error::MuxyError;
pub use route::{RouteTarget, Router};

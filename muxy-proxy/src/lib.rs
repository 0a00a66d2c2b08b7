//! The Muxy data plane: per-worker downstream pools, the upstream and
//! downstream connection drivers, the request engine, and the worker
//! scheduler.

pub mod downstream;
pub mod io;
pub mod pool;
pub mod request;
pub mod upstream;
pub mod worker;

pub use worker::{BucketShared, SharedState, WorkerCtx, spawn_workers};

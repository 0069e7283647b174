//! HTTP API layer
//!
//! Operator endpoints for the scheduler and node queues.

pub mod ops;

pub use ops::{create_ops_routes, OpsState};

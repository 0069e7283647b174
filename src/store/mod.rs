//! Persistence layer
//!
//! - `database`: SQLite pool and idempotent schema
//! - `entity`: canonical entity store behind the `EntityStore` trait
//! - `retry`: linear-backoff retry for single-row writes

pub mod database;
pub mod entity;
pub mod retry;

pub use database::Database;
pub use entity::{AttributeMap, Entity, EntityStore, SqliteEntityStore};
pub use retry::RetryPolicy;

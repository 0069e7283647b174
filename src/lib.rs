//! Magelink: node synchronization and routing engine
//!
//! Entities changed by one external system ("node") are run through transforms,
//! fanned out along router edges to subscriber nodes, and queued per node until that
//! node's gateway pushes them out during a scheduled sync pass.

// Configuration from environment and JSON files
pub mod config;

// Typed errors shared by all layers
pub mod error;

// Log service persisting records next to tracing output
pub mod logging;

// SQLite schema, entity store and write retry
pub mod store;

// Nodes, gateways, work queues and subscriptions
pub mod node;

// Transforms, edges and filters
pub mod router;

// Lock files, scheduled jobs and the scheduler tick
pub mod cron;

// Ops REST endpoints
pub mod api;

// Service wiring and server setup
pub mod server;

pub use config::Config;
pub use error::{ErrorKind, SyncError, SyncResult};
pub use node::{ChangeType, Node, NodeService};
pub use router::RouterService;
pub use server::{start_server, Services};

//! Node layer
//!
//! External systems ("nodes"), their gateways, and the per-node work queues that the
//! router fills and the gateways drain.

pub mod cache;
pub mod gateway;
pub mod http_push;
pub mod service;
pub mod types;

pub use cache::SubscriptionCache;
pub use gateway::{GatewayContext, GatewayRegistry, NodeGateway};
pub use service::{NodeService, SYSTEM_NODE_ID};
pub use types::{ChangeType, EntityUpdateLog, Node, PendingAction, PendingUpdate};

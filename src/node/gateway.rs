//! Node gateway abstraction
//!
//! Each external system is driven through a `NodeGateway`: `init` with the node
//! record, `retrieve` to pull changes in, `update` to push pending changes out,
//! `deinit` to release resources. Gateways are created by factories registered per
//! node type at startup.

use crate::{
    error::{SyncError, SyncResult},
    logging::LogService,
    node::{service::NodeService, types::Node},
    router::RouterService,
    store::EntityStore,
};
use async_trait::async_trait;
use std::{collections::HashMap, sync::Arc};

#[async_trait]
pub trait NodeGateway: Send {
    /// Prepare the gateway for `node`; `scheduled` is false for manual runs
    async fn init(&mut self, node: &Node, scheduled: bool) -> SyncResult<()>;

    /// Pull changes from the external system into the entity store
    async fn retrieve(&mut self) -> SyncResult<()>;

    /// Push this node's pending updates and actions to the external system
    async fn update(&mut self) -> SyncResult<()>;

    async fn deinit(&mut self) -> SyncResult<()> {
        Ok(())
    }
}

/// Services a gateway may use while it runs
#[derive(Clone)]
pub struct GatewayContext {
    pub nodes: Arc<NodeService>,
    pub router: Arc<RouterService>,
    pub entities: Arc<dyn EntityStore>,
    pub log: LogService,
}

pub type GatewayFactory = Arc<dyn Fn(GatewayContext) -> Box<dyn NodeGateway> + Send + Sync>;

/// Node type -> gateway factory
#[derive(Clone, Default)]
pub struct GatewayRegistry {
    factories: HashMap<String, GatewayFactory>,
}

impl GatewayRegistry {
    /// Empty registry; use `with_builtin` for the shipped gateways
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with the gateways shipped in this crate
    pub fn with_builtin() -> Self {
        let mut registry = Self::new();
        registry.register(crate::node::http_push::GATEWAY_TYPE, |ctx| {
            Box::new(crate::node::http_push::HttpPushGateway::new(ctx))
        });
        registry
    }

    /// Register (or replace) the factory for `node_type`
    pub fn register<F>(&mut self, node_type: &str, factory: F)
    where
        F: Fn(GatewayContext) -> Box<dyn NodeGateway> + Send + Sync + 'static,
    {
        tracing::debug!("🔌 Registered gateway type: {}", node_type);
        self.factories.insert(node_type.to_string(), Arc::new(factory));
    }

    pub fn contains(&self, node_type: &str) -> bool {
        self.factories.contains_key(node_type)
    }

    /// Registered node types, sorted
    pub fn types(&self) -> Vec<String> {
        let mut types: Vec<String> = self.factories.keys().cloned().collect();
        types.sort();
        types
    }

    /// Instantiate the gateway for `node`; an unregistered type is a configuration error
    pub fn create(&self, node: &Node, ctx: GatewayContext) -> SyncResult<Box<dyn NodeGateway>> {
        let factory = self.factories.get(&node.node_type).ok_or_else(|| {
            SyncError::config(format!(
                "No gateway registered for node type '{}' (node {})",
                node.node_type, node.id
            ))
        })?;
        Ok(factory(ctx))
    }
}

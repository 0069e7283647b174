//! Built-in outbound HTTP gateway
//!
//! Pushes a node's pending updates and actions as JSON to the endpoints configured in
//! its `node_data` (`url`, optional `action_url`, optional `timeout_secs`). An item is
//! marked complete only after a 2xx response; anything else stays pending for the next
//! run. The gateway has nothing to retrieve.

use crate::{
    error::{SyncError, SyncResult},
    logging::Related,
    node::{
        gateway::{GatewayContext, NodeGateway},
        types::{Node, PendingAction, PendingUpdate},
    },
    store::AttributeMap,
};
use async_trait::async_trait;
use serde_json::{json, Value};
use std::collections::HashSet;
use std::time::Duration;

pub const GATEWAY_TYPE: &str = "http_push";

pub struct HttpPushGateway {
    ctx: GatewayContext,
    client: Option<reqwest::Client>,
    node: Option<Node>,
}

impl HttpPushGateway {
    pub fn new(ctx: GatewayContext) -> Self {
        Self {
            ctx,
            client: None,
            node: None,
        }
    }

    fn session(&self) -> SyncResult<(&Node, &reqwest::Client)> {
        match (&self.node, &self.client) {
            (Some(node), Some(client)) => Ok((node, client)),
            _ => Err(SyncError::sync("http_push gateway used before init")),
        }
    }

    async fn update_payload(&self, node: &Node, update: &PendingUpdate) -> SyncResult<Value> {
        let subscribed = self
            .ctx
            .nodes
            .get_subscribed_attribute_codes(node.id, Some(&update.log.entity_type), false)
            .await?;
        let wanted: HashSet<&str> = if subscribed.is_empty() {
            update.log.affected_attributes.iter().map(String::as_str).collect()
        } else {
            update
                .log
                .affected_attributes
                .iter()
                .map(String::as_str)
                .filter(|code| subscribed.iter().any(|s| s == code))
                .collect()
        };

        let attributes: AttributeMap = update
            .entity
            .as_ref()
            .map(|entity| {
                entity
                    .data
                    .iter()
                    .filter(|(code, _)| wanted.contains(code.as_str()))
                    .map(|(code, value)| (code.clone(), value.clone()))
                    .collect()
            })
            .unwrap_or_default();

        Ok(json!({
            "log_id": update.log.id,
            "entity_id": update.log.entity_id,
            "entity_type": update.log.entity_type,
            "unique_id": update.entity.as_ref().and_then(|e| e.unique_id.clone()),
            "type": update.log.change_type,
            "source_node": update.log.source_node,
            "timestamp": update.log.timestamp,
            "attributes": attributes,
        }))
    }

    fn action_payload(action: &PendingAction) -> Value {
        json!({
            "action_id": action.action_id,
            "entity_id": action.entity_id,
            "entity_type": action.entity_type,
            "action_type": action.action_type,
            "source_node": action.source_node,
            "timestamp": action.timestamp,
            "data": action.data,
        })
    }

    async fn post(client: &reqwest::Client, url: &str, body: &Value) -> Result<(), String> {
        let response = client
            .post(url)
            .json(body)
            .send()
            .await
            .map_err(|e| e.to_string())?;
        if response.status().is_success() {
            Ok(())
        } else {
            Err(format!("HTTP {}", response.status()))
        }
    }
}

#[async_trait]
impl NodeGateway for HttpPushGateway {
    async fn init(&mut self, node: &Node, scheduled: bool) -> SyncResult<()> {
        if node.config_value("url").is_none() {
            return Err(SyncError::node(node.id, "http_push node has no 'url' configured"));
        }
        let timeout = node
            .config_value("timeout_secs")
            .and_then(|v| v.parse().ok())
            .unwrap_or(30);

        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(timeout))
            .build()
            .map_err(|e| SyncError::node(node.id, format!("HTTP client setup failed: {}", e)))?;

        tracing::debug!("🔌 http_push gateway ready for node {} (scheduled: {})", node.id, scheduled);
        self.client = Some(client);
        self.node = Some(node.clone());
        Ok(())
    }

    async fn retrieve(&mut self) -> SyncResult<()> {
        let (node, _) = self.session()?;
        tracing::debug!("📭 Node {} is push-only, nothing to retrieve", node.id);
        Ok(())
    }

    async fn update(&mut self) -> SyncResult<()> {
        let (node, client) = self.session()?;
        let url = node.config_value("url").unwrap_or_default();
        let mut failures = 0usize;

        let updates = self.ctx.nodes.get_pending_updates(node.id).await?;
        let mut touched_types = HashSet::new();
        for update in &updates {
            let body = self.update_payload(node, update).await?;
            match Self::post(client, url, &body).await {
                Ok(()) => {
                    self.ctx.nodes.set_update_status(node.id, update.log.id, true).await?;
                    touched_types.insert(update.log.entity_type.clone());
                }
                Err(e) => {
                    failures += 1;
                    self.ctx
                        .log
                        .warn(
                            "node_push",
                            &format!("Push of log {} to node {} failed: {}", update.log.id, node.id, e),
                            json!({ "log_id": update.log.id, "url": url }),
                            Related::entity(update.log.entity_id).with_node(node.id),
                        )
                        .await;
                }
            }
        }

        if let Some(action_url) = node.config_value("action_url") {
            let actions = self.ctx.nodes.get_pending_actions(node.id).await?;
            for action in &actions {
                match Self::post(client, action_url, &Self::action_payload(action)).await {
                    Ok(()) => {
                        self.ctx.nodes.set_action_status(node.id, action.action_id, true).await?;
                    }
                    Err(e) => {
                        failures += 1;
                        tracing::warn!(
                            "⚠️ Action {} to node {} failed: {}",
                            action.action_id,
                            node.id,
                            e
                        );
                    }
                }
            }
        }

        let now = chrono::Utc::now().timestamp();
        for entity_type in &touched_types {
            self.ctx.nodes.set_timestamp(node.id, entity_type, "update", now).await?;
        }

        if failures > 0 {
            return Err(SyncError::node(node.id, format!("{} items could not be pushed", failures)));
        }
        tracing::info!("📤 Node {} pushed {} updates", node.id, updates.len());
        Ok(())
    }

    async fn deinit(&mut self) -> SyncResult<()> {
        self.client = None;
        self.node = None;
        Ok(())
    }
}

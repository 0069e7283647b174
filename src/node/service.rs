//! Node service
//!
//! Per-node bookkeeping for the sync pipeline:
//! - node records and their key/value configuration
//! - pending update and action queues built from the audit trail
//! - per (node, entity type, action) high-water-mark timestamps
//! - attribute subscriptions, cached in an explicit `SubscriptionCache`

use crate::{
    error::{SyncError, SyncResult},
    node::{
        cache::{CacheKey, SubscriptionCache},
        types::{split_csv, ChangeType, EntityUpdateLog, Node, PendingAction, PendingUpdate},
    },
    store::{EntityStore, RetryPolicy},
};
use sqlx::{sqlite::SqlitePool, Row};
use std::{collections::HashMap, sync::Arc};

/// Node id used for system-level operations; it is subscribed to every attribute
pub const SYSTEM_NODE_ID: i64 = 0;

pub struct NodeService {
    pool: SqlitePool,
    entities: Arc<dyn EntityStore>,
    cache: Arc<SubscriptionCache>,
    retry: RetryPolicy,
}

impl NodeService {
    pub fn new(
        pool: SqlitePool,
        entities: Arc<dyn EntityStore>,
        cache: Arc<SubscriptionCache>,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            pool,
            entities,
            cache,
            retry,
        }
    }

    pub fn cache(&self) -> &Arc<SubscriptionCache> {
        &self.cache
    }

    // ---------------------------------------------------------------------
    // Nodes
    // ---------------------------------------------------------------------

    /// Register a node with its configuration
    pub async fn create_node(
        &self,
        node_type: &str,
        name: &str,
        config: &HashMap<String, String>,
    ) -> SyncResult<Node> {
        let result = sqlx::query("INSERT INTO node (type, name, active) VALUES (?, ?, 1)")
            .bind(node_type)
            .bind(name)
            .execute(&self.pool)
            .await?;
        let id = result.last_insert_rowid();

        for (key, value) in config {
            sqlx::query("INSERT INTO node_data (node_id, key, value) VALUES (?, ?, ?)")
                .bind(id)
                .bind(key)
                .bind(value)
                .execute(&self.pool)
                .await?;
        }

        tracing::info!("🆕 Registered node {} '{}' ({})", id, name, node_type);

        Ok(Node {
            id,
            node_type: node_type.to_string(),
            name: name.to_string(),
            active: true,
            config: config.clone(),
        })
    }

    /// Activate or deactivate a node
    ///
    /// Inactive nodes keep their queues but are skipped by the sync jobs.
    pub async fn set_node_active(&self, node_id: i64, active: bool) -> SyncResult<()> {
        sqlx::query("UPDATE node SET active = ? WHERE id = ?")
            .bind(active)
            .bind(node_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Load one node with its key/value configuration
    pub async fn load_node(&self, node_id: i64) -> SyncResult<Option<Node>> {
        let row = sqlx::query("SELECT id, type, name, active FROM node WHERE id = ?")
            .bind(node_id)
            .fetch_optional(&self.pool)
            .await?;

        match row {
            Some(row) => Ok(Some(self.node_from_row(row).await?)),
            None => Ok(None),
        }
    }

    /// Active nodes in id order; inactive nodes are never synchronized
    pub async fn get_active_nodes(&self) -> SyncResult<Vec<Node>> {
        let rows = sqlx::query("SELECT id, type, name, active FROM node WHERE active = 1 ORDER BY id")
            .fetch_all(&self.pool)
            .await?;

        let mut nodes = Vec::with_capacity(rows.len());
        for row in rows {
            nodes.push(self.node_from_row(row).await?);
        }
        Ok(nodes)
    }

    async fn node_from_row(&self, row: sqlx::sqlite::SqliteRow) -> SyncResult<Node> {
        let id: i64 = row.get("id");
        let config_rows = sqlx::query("SELECT key, value FROM node_data WHERE node_id = ?")
            .bind(id)
            .fetch_all(&self.pool)
            .await?;

        Ok(Node {
            id,
            node_type: row.get("type"),
            name: row.get("name"),
            active: row.get("active"),
            config: config_rows
                .iter()
                .map(|r| (r.get("key"), r.get("value")))
                .collect(),
        })
    }

    // ---------------------------------------------------------------------
    // Pending work queues
    // ---------------------------------------------------------------------

    /// Changes `node_id` has not consumed yet, oldest first
    ///
    /// Fails with an integrity error when an update row points at a log row that no
    /// longer exists; such rows are never silently dropped.
    pub async fn get_pending_updates(&self, node_id: i64) -> SyncResult<Vec<PendingUpdate>> {
        let rows = sqlx::query(
            r#"
            SELECT eu.id AS update_id, eu.log_id,
                   l.id AS found_log_id, l.entity_id, l.entity_type, l.timestamp,
                   l.source_node, l.affected_nodes, l.affected_attributes, l.type
            FROM entity_update eu
            LEFT JOIN entity_update_log l ON l.id = eu.log_id
            WHERE eu.node_id = ? AND eu.complete = 0
            ORDER BY eu.log_id, eu.id
            "#,
        )
        .bind(node_id)
        .fetch_all(&self.pool)
        .await?;

        let mut pending = Vec::with_capacity(rows.len());
        for row in rows {
            let update_id: i64 = row.get("update_id");
            let log_id: i64 = row.get("log_id");
            let found: Option<i64> = row.get("found_log_id");
            if found.is_none() {
                return Err(SyncError::integrity(format!(
                    "Update {} for node {} references missing log {}",
                    update_id, node_id, log_id
                )));
            }

            let raw_type: String = row.get("type");
            let change_type = raw_type
                .parse::<ChangeType>()
                .map_err(SyncError::integrity)?;
            let affected_nodes = split_csv(&row.get::<String, _>("affected_nodes"))
                .iter()
                .map(|id| {
                    id.parse::<i64>().map_err(|_| {
                        SyncError::integrity(format!("Log {} has invalid node id '{}'", log_id, id))
                    })
                })
                .collect::<SyncResult<Vec<_>>>()?;

            let log = EntityUpdateLog {
                id: log_id,
                entity_id: row.get("entity_id"),
                entity_type: row.get("entity_type"),
                timestamp: row.get("timestamp"),
                source_node: row.get("source_node"),
                affected_nodes,
                affected_attributes: split_csv(&row.get::<String, _>("affected_attributes")),
                change_type,
            };
            let entity = self.entities.load_entity(log.entity_id).await?;

            pending.push(PendingUpdate {
                update_id,
                log,
                entity,
            });
        }

        tracing::debug!("📬 Node {} has {} pending updates", node_id, pending.len());
        Ok(pending)
    }

    /// Actions `node_id` has not executed yet, oldest first
    pub async fn get_pending_actions(&self, node_id: i64) -> SyncResult<Vec<PendingAction>> {
        let rows = sqlx::query(
            r#"
            SELECT s.action_id, a.id AS found_action_id, a.entity_id, a.entity_type,
                   a.source_node, a.action_type, a.data, a.timestamp
            FROM entity_action_status s
            LEFT JOIN entity_action a ON a.id = s.action_id
            WHERE s.node_id = ? AND s.status = 0
            ORDER BY s.action_id
            "#,
        )
        .bind(node_id)
        .fetch_all(&self.pool)
        .await?;

        let mut pending = Vec::with_capacity(rows.len());
        for row in rows {
            let action_id: i64 = row.get("action_id");
            let found: Option<i64> = row.get("found_action_id");
            if found.is_none() {
                return Err(SyncError::integrity(format!(
                    "Action status for node {} references missing action {}",
                    node_id, action_id
                )));
            }

            let entity_id: i64 = row.get("entity_id");
            let raw_data: String = row.get("data");
            pending.push(PendingAction {
                action_id,
                entity_id,
                entity_type: row.get("entity_type"),
                source_node: row.get("source_node"),
                action_type: row.get("action_type"),
                data: serde_json::from_str(&raw_data)?,
                timestamp: row.get("timestamp"),
                entity: self.entities.load_entity(entity_id).await?,
            });
        }
        Ok(pending)
    }

    /// Mark the update for (`log_id`, `node_id`); returns false if no such row exists
    pub async fn set_update_status(&self, node_id: i64, log_id: i64, complete: bool) -> SyncResult<bool> {
        let pool = &self.pool;
        let result = self
            .retry
            .run("entity_update.complete", move || async move {
                sqlx::query("UPDATE entity_update SET complete = ? WHERE node_id = ? AND log_id = ?")
                    .bind(complete)
                    .bind(node_id)
                    .bind(log_id)
                    .execute(pool)
                    .await
            })
            .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Mark the action status for (`action_id`, `node_id`); returns false if no such row exists
    pub async fn set_action_status(&self, node_id: i64, action_id: i64, complete: bool) -> SyncResult<bool> {
        let pool = &self.pool;
        let result = self
            .retry
            .run("entity_action_status.status", move || async move {
                sqlx::query("UPDATE entity_action_status SET status = ? WHERE node_id = ? AND action_id = ?")
                    .bind(complete)
                    .bind(node_id)
                    .bind(action_id)
                    .execute(pool)
                    .await
            })
            .await?;
        Ok(result.rows_affected() > 0)
    }

    // ---------------------------------------------------------------------
    // Timestamps
    // ---------------------------------------------------------------------

    /// Last processed timestamp for (node, entity type, action); 0 when never set
    pub async fn get_timestamp(&self, node_id: i64, entity_type: &str, action: &str) -> SyncResult<i64> {
        let row = sqlx::query(
            "SELECT timestamp FROM node_status WHERE node_id = ? AND entity_type = ? AND action = ?",
        )
        .bind(node_id)
        .bind(entity_type)
        .bind(action)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(|r| r.get("timestamp")).unwrap_or(0))
    }

    /// Record the last processed timestamp for (node, entity type, action)
    ///
    /// Composite-key upsert, so repeated calls keep a single row.
    pub async fn set_timestamp(
        &self,
        node_id: i64,
        entity_type: &str,
        action: &str,
        timestamp: i64,
    ) -> SyncResult<()> {
        let pool = &self.pool;
        self.retry
            .run("node_status", move || async move {
                sqlx::query(
                    r#"
                    INSERT INTO node_status (node_id, entity_type, action, timestamp)
                    VALUES (?, ?, ?, ?)
                    ON CONFLICT(node_id, entity_type, action) DO UPDATE SET
                        timestamp = excluded.timestamp
                    "#,
                )
                .bind(node_id)
                .bind(entity_type)
                .bind(action)
                .bind(timestamp)
                .execute(pool)
                .await
            })
            .await?;

        tracing::debug!(
            "⏱️ Node {} {}/{} timestamp set to {}",
            node_id,
            entity_type,
            action,
            timestamp
        );
        Ok(())
    }

    // ---------------------------------------------------------------------
    // Attribute subscriptions
    // ---------------------------------------------------------------------

    /// Subscribe a node to an attribute of an entity type
    ///
    /// Re-subscribing updates `can_update` in place. Cached code lists for this
    /// (node, entity type) pair and the node's all-types lists are dropped.
    pub async fn subscribe_attribute(
        &self,
        node_id: i64,
        entity_type: &str,
        code: &str,
        can_update: bool,
    ) -> SyncResult<()> {
        sqlx::query(
            r#"
            INSERT INTO node_attribute (node_id, entity_type, attribute_code, can_update)
            VALUES (?, ?, ?, ?)
            ON CONFLICT(node_id, entity_type, attribute_code) DO UPDATE SET
                can_update = excluded.can_update
            "#,
        )
        .bind(node_id)
        .bind(entity_type)
        .bind(code)
        .bind(can_update)
        .execute(&self.pool)
        .await?;

        self.cache.invalidate(node_id, entity_type);
        Ok(())
    }

    /// Remove one subscription; a missing one is not an error
    pub async fn unsubscribe_attribute(&self, node_id: i64, entity_type: &str, code: &str) -> SyncResult<()> {
        sqlx::query(
            "DELETE FROM node_attribute WHERE node_id = ? AND entity_type = ? AND attribute_code = ?",
        )
        .bind(node_id)
        .bind(entity_type)
        .bind(code)
        .execute(&self.pool)
        .await?;

        self.cache.invalidate(node_id, entity_type);
        Ok(())
    }

    /// Subscribe to several attributes with the same `can_update` flag
    pub async fn bulk_subscribe_attributes(
        &self,
        node_id: i64,
        entity_type: &str,
        codes: &[String],
        can_update: bool,
    ) -> SyncResult<()> {
        for code in codes {
            self.subscribe_attribute(node_id, entity_type, code, can_update)
                .await?;
        }
        Ok(())
    }

    pub async fn bulk_unsubscribe_attributes(
        &self,
        node_id: i64,
        entity_type: &str,
        codes: &[String],
    ) -> SyncResult<()> {
        for code in codes {
            self.unsubscribe_attribute(node_id, entity_type, code).await?;
        }
        Ok(())
    }

    /// Attribute codes the node receives (or may update, with `update_only`)
    ///
    /// `SYSTEM_NODE_ID` is treated as subscribed to every defined attribute. Its list
    /// is read from the entity store on every call and never cached, since attributes
    /// can be defined through the store at any time without passing through here.
    pub async fn get_subscribed_attribute_codes(
        &self,
        node_id: i64,
        entity_type: Option<&str>,
        update_only: bool,
    ) -> SyncResult<Arc<Vec<String>>> {
        if node_id == SYSTEM_NODE_ID {
            return Ok(Arc::new(self.entities.list_attributes(entity_type).await?));
        }

        let key = CacheKey::new(node_id, entity_type, update_only);
        if let Some(codes) = self.cache.get(&key) {
            return Ok(codes);
        }

        let codes = {
            let mut sql = String::from(
                "SELECT DISTINCT attribute_code FROM node_attribute WHERE node_id = ?",
            );
            if entity_type.is_some() {
                sql.push_str(" AND entity_type = ?");
            }
            if update_only {
                sql.push_str(" AND can_update = 1");
            }
            sql.push_str(" ORDER BY attribute_code");

            let mut query = sqlx::query(&sql).bind(node_id);
            if let Some(entity_type) = entity_type {
                query = query.bind(entity_type);
            }
            query
                .fetch_all(&self.pool)
                .await?
                .iter()
                .map(|row| row.get("attribute_code"))
                .collect()
        };

        Ok(self.cache.insert(key, codes))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{Database, SqliteEntityStore};

    async fn service() -> (Database, NodeService) {
        let db = Database::in_memory().await.unwrap();
        let entities: Arc<dyn EntityStore> = Arc::new(SqliteEntityStore::new(db.pool().clone()));
        let nodes = NodeService::new(
            db.pool().clone(),
            entities,
            Arc::new(SubscriptionCache::new()),
            RetryPolicy::new(2, 1),
        );
        (db, nodes)
    }

    #[tokio::test]
    async fn test_timestamp_defaults_to_zero_and_upserts() {
        let (db, nodes) = service().await;

        assert_eq!(nodes.get_timestamp(1, "product", "retrieve").await.unwrap(), 0);
        nodes.set_timestamp(1, "product", "retrieve", 100).await.unwrap();
        nodes.set_timestamp(1, "product", "retrieve", 250).await.unwrap();
        assert_eq!(nodes.get_timestamp(1, "product", "retrieve").await.unwrap(), 250);
        assert_eq!(nodes.get_timestamp(1, "order", "retrieve").await.unwrap(), 0);

        let (rows,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM node_status")
            .fetch_one(db.pool())
            .await
            .unwrap();
        assert_eq!(rows, 1);
    }

    #[tokio::test]
    async fn test_active_nodes_skip_deactivated() {
        let (_db, nodes) = service().await;
        let mut config = HashMap::new();
        config.insert("url".to_string(), "http://erp.local".to_string());

        let erp = nodes.create_node("http_push", "ERP", &config).await.unwrap();
        let shop = nodes.create_node("http_push", "Shop", &HashMap::new()).await.unwrap();
        nodes.set_node_active(shop.id, false).await.unwrap();

        let active = nodes.get_active_nodes().await.unwrap();
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].id, erp.id);
        assert_eq!(active[0].config_value("url"), Some("http://erp.local"));
    }

    #[tokio::test]
    async fn test_subscriptions_are_cached_and_invalidated() {
        let (_db, nodes) = service().await;

        nodes.subscribe_attribute(3, "product", "price", true).await.unwrap();
        nodes.subscribe_attribute(3, "product", "name", false).await.unwrap();

        let all = nodes.get_subscribed_attribute_codes(3, Some("product"), false).await.unwrap();
        assert_eq!(*all, vec!["name".to_string(), "price".to_string()]);
        let writable = nodes.get_subscribed_attribute_codes(3, Some("product"), true).await.unwrap();
        assert_eq!(*writable, vec!["price".to_string()]);
        assert_eq!(nodes.cache().len(), 2);

        nodes.unsubscribe_attribute(3, "product", "price").await.unwrap();
        assert!(nodes.cache().is_empty());

        let all = nodes.get_subscribed_attribute_codes(3, None, false).await.unwrap();
        assert_eq!(*all, vec!["name".to_string()]);
    }

    #[tokio::test]
    async fn test_system_node_sees_all_attributes() {
        let (db, nodes) = service().await;
        let store = SqliteEntityStore::new(db.pool().clone());
        store.define_attribute("product", "price").await.unwrap();
        store.define_attribute("product", "sku").await.unwrap();
        store.define_attribute("order", "status").await.unwrap();

        let codes = nodes
            .get_subscribed_attribute_codes(SYSTEM_NODE_ID, Some("product"), false)
            .await
            .unwrap();
        assert_eq!(*codes, vec!["price".to_string(), "sku".to_string()]);
    }

    #[tokio::test]
    async fn test_system_node_picks_up_later_attributes() {
        let (db, nodes) = service().await;
        let store = SqliteEntityStore::new(db.pool().clone());
        store.define_attribute("product", "price").await.unwrap();

        let first = nodes
            .get_subscribed_attribute_codes(SYSTEM_NODE_ID, Some("product"), false)
            .await
            .unwrap();
        assert_eq!(*first, vec!["price".to_string()]);

        store.define_attribute("product", "sku").await.unwrap();
        let second = nodes
            .get_subscribed_attribute_codes(SYSTEM_NODE_ID, Some("product"), false)
            .await
            .unwrap();
        assert_eq!(*second, vec!["price".to_string(), "sku".to_string()]);
        assert!(nodes.cache().is_empty());
    }

    #[tokio::test]
    async fn test_orphaned_action_status_is_an_integrity_error() {
        let (db, nodes) = service().await;
        sqlx::query("INSERT INTO entity_action_status (action_id, node_id, status) VALUES (777, 2, 0)")
            .execute(db.pool())
            .await
            .unwrap();

        let err = nodes.get_pending_actions(2).await.unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::Integrity);
        assert!(nodes.get_pending_actions(3).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_orphaned_update_row_is_an_integrity_error() {
        let (db, nodes) = service().await;
        sqlx::query("INSERT INTO entity_update (entity_id, node_id, log_id, type, complete) VALUES (42, 2, 999, 'update', 0)")
            .execute(db.pool())
            .await
            .unwrap();

        let err = nodes.get_pending_updates(2).await.unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::Integrity);
    }
}

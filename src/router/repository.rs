//! SQL access for router rules, counters and the audit trail

use crate::{
    error::{SyncError, SyncResult},
    node::{types::join_csv, ChangeType},
    router::types::{ConfigMap, NewEdge, NewTransform, RouterEdge, RouterFilter, RouterTransform},
};
use serde_json::Value;
use sqlx::{sqlite::SqlitePool, Row};

// ---------------------------------------------------------------------------
// Column lists
// ---------------------------------------------------------------------------

const EDGE_COLUMNS: &str = "id, node_from, node_to, entity_type, action_type, enabled";

const TRANSFORM_COLUMNS: &str = "\
    id, entity_type, src_attribute, dest_attribute, transform_type, \
    change_type, enabled, config";

#[derive(Debug, Clone)]
pub struct RouterRepository {
    pool: SqlitePool,
}

fn parse_change_type(raw: &str) -> SyncResult<ChangeType> {
    raw.parse().map_err(SyncError::config)
}

fn parse_config(raw: &str) -> SyncResult<ConfigMap> {
    match serde_json::from_str::<Value>(raw)? {
        Value::Object(map) => Ok(map),
        Value::Null => Ok(ConfigMap::new()),
        other => Err(SyncError::config(format!("Rule config must be an object, got {}", other))),
    }
}

fn edge_from_row(row: &sqlx::sqlite::SqliteRow) -> SyncResult<RouterEdge> {
    Ok(RouterEdge {
        id: row.get("id"),
        node_from: row.get("node_from"),
        node_to: row.get("node_to"),
        entity_type: row.get("entity_type"),
        change_type: parse_change_type(&row.get::<String, _>("action_type"))?,
        enabled: row.get("enabled"),
    })
}

fn transform_from_row(row: &sqlx::sqlite::SqliteRow) -> SyncResult<RouterTransform> {
    let change_type: Option<String> = row.get("change_type");
    Ok(RouterTransform {
        id: row.get("id"),
        entity_type: row.get("entity_type"),
        src_attribute: row.get("src_attribute"),
        dest_attribute: row.get("dest_attribute"),
        transform_type: row.get("transform_type"),
        change_type: change_type.as_deref().map(parse_change_type).transpose()?,
        enabled: row.get("enabled"),
        config: parse_config(&row.get::<String, _>("config"))?,
    })
}

impl RouterRepository {
    /// Create a repository over the shared pool
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    // ---------------------------------------------------------------------
    // Rule definitions
    // ---------------------------------------------------------------------

    /// Register a routing edge, enabled
    ///
    /// The change type is stored in the `action_type` column. Returns the stored row
    /// with its assigned id.
    pub async fn add_edge(&self, edge: &NewEdge) -> SyncResult<RouterEdge> {
        let result = sqlx::query(
            "INSERT INTO router_edge (node_from, node_to, entity_type, action_type, enabled) VALUES (?, ?, ?, ?, 1)",
        )
        .bind(edge.node_from)
        .bind(edge.node_to)
        .bind(&edge.entity_type)
        .bind(edge.change_type.as_str())
        .execute(&self.pool)
        .await?;

        Ok(RouterEdge {
            id: result.last_insert_rowid(),
            node_from: edge.node_from,
            node_to: edge.node_to,
            entity_type: edge.entity_type.clone(),
            change_type: edge.change_type,
            enabled: true,
        })
    }

    /// Enable or disable an edge without deleting it
    pub async fn set_edge_enabled(&self, edge_id: i64, enabled: bool) -> SyncResult<()> {
        sqlx::query("UPDATE router_edge SET enabled = ? WHERE id = ?")
            .bind(enabled)
            .bind(edge_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Register a transform rule, enabled
    ///
    /// Rules run in id order, so insertion order is also evaluation order.
    pub async fn add_transform(&self, transform: &NewTransform) -> SyncResult<RouterTransform> {
        let config = Value::Object(transform.config.clone()).to_string();
        let result = sqlx::query(
            r#"
            INSERT INTO router_transform
                (entity_type, src_attribute, dest_attribute, transform_type, change_type, enabled, config)
            VALUES (?, ?, ?, ?, ?, 1, ?)
            "#,
        )
        .bind(&transform.entity_type)
        .bind(&transform.src_attribute)
        .bind(&transform.dest_attribute)
        .bind(&transform.transform_type)
        .bind(transform.change_type.map(|ct| ct.as_str()))
        .bind(&config)
        .execute(&self.pool)
        .await?;

        Ok(RouterTransform {
            id: result.last_insert_rowid(),
            entity_type: transform.entity_type.clone(),
            src_attribute: transform.src_attribute.clone(),
            dest_attribute: transform.dest_attribute.clone(),
            transform_type: transform.transform_type.clone(),
            change_type: transform.change_type,
            enabled: true,
            config: transform.config.clone(),
        })
    }

    /// Store a filter definition; it takes effect once attached
    pub async fn add_filter(&self, filter_type: &str, config: ConfigMap) -> SyncResult<RouterFilter> {
        let result = sqlx::query("INSERT INTO router_filter (filter_type, config) VALUES (?, ?)")
            .bind(filter_type)
            .bind(Value::Object(config.clone()).to_string())
            .execute(&self.pool)
            .await?;

        Ok(RouterFilter {
            id: result.last_insert_rowid(),
            filter_type: filter_type.to_string(),
            config,
        })
    }

    /// Attach a filter to an edge, or toggle an existing attachment
    ///
    /// Upserts on (edge, filter) so re-attaching only flips `enabled`.
    pub async fn attach_edge_filter(&self, edge_id: i64, filter_id: i64, enabled: bool) -> SyncResult<()> {
        sqlx::query(
            r#"
            INSERT INTO router_edge_filter (edge_id, filter_id, enabled) VALUES (?, ?, ?)
            ON CONFLICT(edge_id, filter_id) DO UPDATE SET enabled = excluded.enabled
            "#,
        )
        .bind(edge_id)
        .bind(filter_id)
        .bind(enabled)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Attach a filter to a transform, or toggle an existing attachment
    pub async fn attach_transform_filter(
        &self,
        transform_id: i64,
        filter_id: i64,
        enabled: bool,
    ) -> SyncResult<()> {
        sqlx::query(
            r#"
            INSERT INTO router_transform_filter (transform_id, filter_id, enabled) VALUES (?, ?, ?)
            ON CONFLICT(transform_id, filter_id) DO UPDATE SET enabled = excluded.enabled
            "#,
        )
        .bind(transform_id)
        .bind(filter_id)
        .bind(enabled)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    // ---------------------------------------------------------------------
    // Rule lookup
    // ---------------------------------------------------------------------

    /// Enabled edges fanning out from `node_from`, in table order
    pub async fn edges_from(
        &self,
        node_from: i64,
        entity_type: &str,
        change_type: ChangeType,
    ) -> SyncResult<Vec<RouterEdge>> {
        let rows = sqlx::query(&format!(
            "SELECT {EDGE_COLUMNS} FROM router_edge \
             WHERE node_from = ? AND entity_type = ? AND action_type = ? AND enabled = 1 \
             ORDER BY id"
        ))
        .bind(node_from)
        .bind(entity_type)
        .bind(change_type.as_str())
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(edge_from_row).collect()
    }

    /// Enabled transforms triggered by any of `changed`, in table order
    pub async fn transforms_for(
        &self,
        entity_type: &str,
        changed: &[String],
        change_type: ChangeType,
    ) -> SyncResult<Vec<RouterTransform>> {
        let rows = sqlx::query(&format!(
            "SELECT {TRANSFORM_COLUMNS} FROM router_transform \
             WHERE entity_type = ? AND enabled = 1 \
             AND (change_type IS NULL OR change_type = ?) \
             ORDER BY id"
        ))
        .bind(entity_type)
        .bind(change_type.as_str())
        .fetch_all(&self.pool)
        .await?;

        let mut transforms = Vec::new();
        for row in &rows {
            let transform = transform_from_row(row)?;
            if changed.iter().any(|code| code == &transform.src_attribute) {
                transforms.push(transform);
            }
        }
        Ok(transforms)
    }

    /// Enabled filters attached to `edge_id`, ordered by filter id
    pub async fn filters_for_edge(&self, edge_id: i64) -> SyncResult<Vec<RouterFilter>> {
        self.attached_filters(
            "SELECT f.id, f.filter_type, f.config FROM router_filter f \
             JOIN router_edge_filter ef ON ef.filter_id = f.id \
             WHERE ef.edge_id = ? AND ef.enabled = 1 ORDER BY f.id",
            edge_id,
        )
        .await
    }

    /// Enabled filters attached to `transform_id`, ordered by filter id
    pub async fn filters_for_transform(&self, transform_id: i64) -> SyncResult<Vec<RouterFilter>> {
        self.attached_filters(
            "SELECT f.id, f.filter_type, f.config FROM router_filter f \
             JOIN router_transform_filter tf ON tf.filter_id = f.id \
             WHERE tf.transform_id = ? AND tf.enabled = 1 ORDER BY f.id",
            transform_id,
        )
        .await
    }

    async fn attached_filters(&self, sql: &str, owner_id: i64) -> SyncResult<Vec<RouterFilter>> {
        let rows = sqlx::query(sql)
            .bind(owner_id)
            .fetch_all(&self.pool)
            .await?;

        rows.iter()
            .map(|row| {
                Ok(RouterFilter {
                    id: row.get("id"),
                    filter_type: row.get("filter_type"),
                    config: parse_config(&row.get::<String, _>("config"))?,
                })
            })
            .collect()
    }

    // ---------------------------------------------------------------------
    // Traffic counters
    // ---------------------------------------------------------------------

    /// Count one routed change on the edge
    ///
    /// Returns the raw sqlx error so callers can log and carry on.
    pub async fn increment_edge_counter(&self, edge_id: i64) -> Result<(), sqlx::Error> {
        sqlx::query(
            r#"
            INSERT INTO router_stat_edge (edge_id, count) VALUES (?, 1)
            ON CONFLICT(edge_id) DO UPDATE SET count = count + 1
            "#,
        )
        .bind(edge_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Count one routed change for (node, entity type, change type)
    pub async fn increment_node_counter(
        &self,
        node_id: i64,
        entity_type: &str,
        change_type: ChangeType,
    ) -> Result<(), sqlx::Error> {
        sqlx::query(
            r#"
            INSERT INTO router_stat_node (node_id, entity_type, change_type, count) VALUES (?, ?, ?, 1)
            ON CONFLICT(node_id, entity_type, change_type) DO UPDATE SET count = count + 1
            "#,
        )
        .bind(node_id)
        .bind(entity_type)
        .bind(change_type.as_str())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn edge_counter(&self, edge_id: i64) -> SyncResult<i64> {
        let row = sqlx::query("SELECT count FROM router_stat_edge WHERE edge_id = ?")
            .bind(edge_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(|r| r.get("count")).unwrap_or(0))
    }

    // ---------------------------------------------------------------------
    // Audit trail
    // ---------------------------------------------------------------------

    #[allow(clippy::too_many_arguments)]
    pub async fn insert_update_log(
        &self,
        entity_id: i64,
        entity_type: &str,
        timestamp: i64,
        source_node: i64,
        affected_nodes: &[i64],
        affected_attributes: &[String],
        change_type: ChangeType,
    ) -> Result<i64, sqlx::Error> {
        let result = sqlx::query(
            r#"
            INSERT INTO entity_update_log
                (entity_id, entity_type, timestamp, source_node, affected_nodes, affected_attributes, type)
            VALUES (?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(entity_id)
        .bind(entity_type)
        .bind(timestamp)
        .bind(source_node)
        .bind(join_csv(affected_nodes))
        .bind(join_csv(affected_attributes))
        .bind(change_type.as_str())
        .execute(&self.pool)
        .await?;
        Ok(result.last_insert_rowid())
    }

    /// Queue one incomplete work item for `node_id`
    pub async fn insert_update(
        &self,
        entity_id: i64,
        node_id: i64,
        log_id: i64,
        change_type: ChangeType,
    ) -> Result<i64, sqlx::Error> {
        let result = sqlx::query(
            "INSERT INTO entity_update (entity_id, node_id, log_id, type, complete) VALUES (?, ?, ?, ?, 0)",
        )
        .bind(entity_id)
        .bind(node_id)
        .bind(log_id)
        .bind(change_type.as_str())
        .execute(&self.pool)
        .await?;
        Ok(result.last_insert_rowid())
    }

    /// Store the action payload once; per-node status rows follow
    pub async fn insert_action(
        &self,
        entity_id: i64,
        entity_type: &str,
        source_node: i64,
        action_type: &str,
        data: &str,
        timestamp: i64,
    ) -> Result<i64, sqlx::Error> {
        let result = sqlx::query(
            r#"
            INSERT INTO entity_action (entity_id, entity_type, source_node, action_type, data, timestamp)
            VALUES (?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(entity_id)
        .bind(entity_type)
        .bind(source_node)
        .bind(action_type)
        .bind(data)
        .bind(timestamp)
        .execute(&self.pool)
        .await?;
        Ok(result.last_insert_rowid())
    }

    /// Queue the action for `node_id` (status 0 = pending)
    pub async fn insert_action_status(&self, action_id: i64, node_id: i64) -> Result<(), sqlx::Error> {
        sqlx::query("INSERT INTO entity_action_status (action_id, node_id, status) VALUES (?, ?, 0)")
            .bind(action_id)
            .bind(node_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

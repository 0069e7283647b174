//! SQLite database handle and schema
//!
//! One pool backs every table the sync core touches: cron state, nodes, the router
//! graph, the audit trail and the entity store. Schema creation is idempotent.

use anyhow::Result;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use std::path::Path;
use std::str::FromStr;

/// Database handle shared by all services
#[derive(Debug, Clone)]
pub struct Database {
    pool: SqlitePool,
}

impl Database {
    /// Open (or create) the database file and initialize the schema
    pub async fn connect(path: &str) -> Result<Self> {
        if let Some(parent) = Path::new(path).parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).map_err(|e| {
                    anyhow::anyhow!("Failed to create database directory '{}': {}", parent.display(), e)
                })?;
            }
        }

        tracing::info!("🗄️ Opening database: {}", path);

        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .busy_timeout(std::time::Duration::from_secs(5));
        let pool = SqlitePool::connect_with(options).await?;

        let db = Self { pool };
        db.init_schema().await?;
        Ok(db)
    }

    /// Private in-memory database (single connection so every query sees the same data)
    pub async fn in_memory() -> Result<Self> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")?;
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await?;

        let db = Self { pool };
        db.init_schema().await?;
        Ok(db)
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Create all tables and indexes (safe to call repeatedly)
    pub async fn init_schema(&self) -> Result<()> {
        for statement in SCHEMA {
            sqlx::query(statement).execute(&self.pool).await?;
        }
        tracing::debug!("✅ Schema ready ({} statements)", SCHEMA.len());
        Ok(())
    }
}

const SCHEMA: &[&str] = &[
    // Cron job state
    r#"
    CREATE TABLE IF NOT EXISTS cron (
        job_name TEXT PRIMARY KEY,
        overdue INTEGER NOT NULL DEFAULT 0,
        updated_at INTEGER NOT NULL
    )
    "#,
    // Nodes
    r#"
    CREATE TABLE IF NOT EXISTS node (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        type TEXT NOT NULL,
        name TEXT NOT NULL,
        active INTEGER NOT NULL DEFAULT 1
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS node_data (
        node_id INTEGER NOT NULL,
        key TEXT NOT NULL,
        value TEXT NOT NULL,
        PRIMARY KEY (node_id, key)
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS node_status (
        node_id INTEGER NOT NULL,
        entity_type TEXT NOT NULL,
        action TEXT NOT NULL,
        timestamp INTEGER NOT NULL,
        PRIMARY KEY (node_id, entity_type, action)
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS node_attribute (
        node_id INTEGER NOT NULL,
        entity_type TEXT NOT NULL,
        attribute_code TEXT NOT NULL,
        can_update INTEGER NOT NULL DEFAULT 0,
        PRIMARY KEY (node_id, entity_type, attribute_code)
    )
    "#,
    // Entity store
    r#"
    CREATE TABLE IF NOT EXISTS entity (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        entity_type TEXT NOT NULL,
        unique_id TEXT,
        node_id INTEGER,
        updated_at INTEGER NOT NULL
    )
    "#,
    "CREATE UNIQUE INDEX IF NOT EXISTS idx_entity_unique ON entity(entity_type, unique_id)",
    r#"
    CREATE TABLE IF NOT EXISTS entity_value (
        entity_id INTEGER NOT NULL,
        attribute TEXT NOT NULL,
        value TEXT NOT NULL,
        PRIMARY KEY (entity_id, attribute)
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS attribute (
        entity_type TEXT NOT NULL,
        code TEXT NOT NULL,
        PRIMARY KEY (entity_type, code)
    )
    "#,
    // Audit trail and per-node work queues
    r#"
    CREATE TABLE IF NOT EXISTS entity_update_log (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        entity_id INTEGER NOT NULL,
        entity_type TEXT NOT NULL,
        timestamp INTEGER NOT NULL,
        source_node INTEGER NOT NULL,
        affected_nodes TEXT NOT NULL,
        affected_attributes TEXT NOT NULL,
        type TEXT NOT NULL
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS entity_update (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        entity_id INTEGER NOT NULL,
        node_id INTEGER NOT NULL,
        log_id INTEGER NOT NULL,
        type TEXT NOT NULL,
        complete INTEGER NOT NULL DEFAULT 0
    )
    "#,
    "CREATE INDEX IF NOT EXISTS idx_entity_update_pending ON entity_update(node_id, complete)",
    r#"
    CREATE TABLE IF NOT EXISTS entity_action (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        entity_id INTEGER NOT NULL,
        entity_type TEXT NOT NULL,
        source_node INTEGER NOT NULL,
        action_type TEXT NOT NULL,
        data TEXT NOT NULL,
        timestamp INTEGER NOT NULL
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS entity_action_status (
        action_id INTEGER NOT NULL,
        node_id INTEGER NOT NULL,
        status INTEGER NOT NULL DEFAULT 0,
        PRIMARY KEY (action_id, node_id)
    )
    "#,
    // Router graph
    r#"
    CREATE TABLE IF NOT EXISTS router_edge (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        node_from INTEGER NOT NULL,
        node_to INTEGER NOT NULL,
        entity_type TEXT NOT NULL,
        action_type TEXT NOT NULL,
        enabled INTEGER NOT NULL DEFAULT 1
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS router_transform (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        entity_type TEXT NOT NULL,
        src_attribute TEXT NOT NULL,
        dest_attribute TEXT,
        transform_type TEXT NOT NULL,
        change_type TEXT,
        enabled INTEGER NOT NULL DEFAULT 1,
        config TEXT NOT NULL DEFAULT '{}'
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS router_filter (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        filter_type TEXT NOT NULL,
        config TEXT NOT NULL DEFAULT '{}'
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS router_edge_filter (
        edge_id INTEGER NOT NULL,
        filter_id INTEGER NOT NULL,
        enabled INTEGER NOT NULL DEFAULT 1,
        PRIMARY KEY (edge_id, filter_id)
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS router_transform_filter (
        transform_id INTEGER NOT NULL,
        filter_id INTEGER NOT NULL,
        enabled INTEGER NOT NULL DEFAULT 1,
        PRIMARY KEY (transform_id, filter_id)
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS router_stat_edge (
        edge_id INTEGER PRIMARY KEY,
        count INTEGER NOT NULL DEFAULT 0
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS router_stat_node (
        node_id INTEGER NOT NULL,
        entity_type TEXT NOT NULL,
        change_type TEXT NOT NULL,
        count INTEGER NOT NULL DEFAULT 0,
        PRIMARY KEY (node_id, entity_type, change_type)
    )
    "#,
    // Log service
    r#"
    CREATE TABLE IF NOT EXISTS log_entry (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        level TEXT NOT NULL,
        code TEXT NOT NULL,
        message TEXT NOT NULL,
        data TEXT NOT NULL,
        entity_id INTEGER,
        node_id INTEGER,
        created_at INTEGER NOT NULL
    )
    "#,
    "CREATE INDEX IF NOT EXISTS idx_log_entry_created ON log_entry(created_at)",
];

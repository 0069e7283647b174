//! Built-in job bodies
//!
//! - `Synchronizer`: every active node retrieves, then every node that retrieved
//!   successfully pushes its pending updates
//! - `Retrieval`: the retrieve pass alone
//! - `LogClear`: drops old log records and completed work items

use crate::{
    config::CronJobConfig,
    cron::runnable::{CronContext, CronTask},
    error::SyncResult,
    logging::Related,
    node::{Node, NodeGateway},
};
use async_trait::async_trait;
use serde_json::json;
use sqlx::sqlite::SqlitePool;
use std::sync::Arc;

pub const SYNCHRONIZER: &str = "synchronizer";
pub const RETRIEVAL: &str = "retrieval";
pub const LOG_CLEAR: &str = "logclear";

/// Job body for a configured job name
pub fn builtin_task(name: &str) -> Option<Arc<dyn CronTask>> {
    match name {
        SYNCHRONIZER => Some(Arc::new(Synchronizer)),
        RETRIEVAL => Some(Arc::new(Retrieval)),
        LOG_CLEAR => Some(Arc::new(LogClear)),
        _ => None,
    }
}

type Session = (Node, Box<dyn NodeGateway>);

/// Active nodes paired with fresh gateways; an unknown node type fails the whole run
async fn open_sessions(ctx: &CronContext) -> SyncResult<Vec<Session>> {
    let nodes = ctx.services.nodes.get_active_nodes().await?;
    let mut sessions = Vec::with_capacity(nodes.len());
    for node in nodes {
        let gateway = ctx.gateways.create(&node, ctx.services.clone())?;
        sessions.push((node, gateway));
    }
    Ok(sessions)
}

async fn node_failed(ctx: &CronContext, node: &Node, stage: &str, error: &crate::error::SyncError) {
    ctx.services
        .log
        .error(
            "node_failed",
            &format!("Node {} ({}) failed during {}: {}", node.id, node.name, stage, error),
            json!({ "stage": stage, "kind": error.code() }),
            Related::node(node.id),
        )
        .await;
}

/// init + retrieve for every session; failed nodes are deinitialised and dropped
async fn retrieve_all(ctx: &CronContext, sessions: Vec<Session>) -> Vec<Session> {
    let mut ready = Vec::with_capacity(sessions.len());
    for (node, mut gateway) in sessions {
        if let Err(e) = gateway.init(&node, true).await {
            node_failed(ctx, &node, "init", &e).await;
            continue;
        }
        match gateway.retrieve().await {
            Ok(()) => ready.push((node, gateway)),
            Err(e) => {
                node_failed(ctx, &node, "retrieve", &e).await;
                if let Err(e) = gateway.deinit().await {
                    node_failed(ctx, &node, "deinit", &e).await;
                }
            }
        }
    }
    ready
}

// ============================================================================
// Synchronizer
// ============================================================================

#[derive(Debug, Default)]
pub struct Synchronizer;

#[async_trait]
impl CronTask for Synchronizer {
    /// Every minute except the half-hour boundaries
    fn is_due(&self, _job: &CronJobConfig, minutes: i64) -> bool {
        minutes.rem_euclid(30) != 0
    }

    async fn run(&self, ctx: &CronContext) -> SyncResult<()> {
        let sessions = open_sessions(ctx).await?;
        let total = sessions.len();

        let ready = retrieve_all(ctx, sessions).await;
        let retrieved = ready.len();

        let mut updated = 0;
        for (node, mut gateway) in ready {
            match gateway.update().await {
                Ok(()) => updated += 1,
                Err(e) => node_failed(ctx, &node, "update", &e).await,
            }
            if let Err(e) = gateway.deinit().await {
                node_failed(ctx, &node, "deinit", &e).await;
            }
        }

        tracing::info!(
            "🔄 Synchronizer: {} nodes, {} retrieved, {} updated",
            total,
            retrieved,
            updated
        );
        Ok(())
    }
}

// ============================================================================
// Retrieval
// ============================================================================

#[derive(Debug, Default)]
pub struct Retrieval;

#[async_trait]
impl CronTask for Retrieval {
    async fn run(&self, ctx: &CronContext) -> SyncResult<()> {
        let sessions = open_sessions(ctx).await?;
        let total = sessions.len();

        let ready = retrieve_all(ctx, sessions).await;
        let retrieved = ready.len();
        for (node, mut gateway) in ready {
            if let Err(e) = gateway.deinit().await {
                node_failed(ctx, &node, "deinit", &e).await;
            }
        }

        tracing::info!("📥 Retrieval: {} of {} nodes retrieved", retrieved, total);
        Ok(())
    }
}

// ============================================================================
// LogClear
// ============================================================================

#[derive(Debug, Default, Clone, PartialEq)]
pub struct ClearStats {
    pub log_entries: u64,
    pub updates: u64,
    pub update_logs: u64,
    pub action_statuses: u64,
    pub actions: u64,
}

#[derive(Debug, Default)]
pub struct LogClear;

impl LogClear {
    /// Delete everything older than `cutoff` (unix seconds) that is no longer needed
    pub async fn clear(pool: &SqlitePool, cutoff: i64) -> SyncResult<ClearStats> {
        let mut stats = ClearStats::default();

        stats.log_entries = sqlx::query("DELETE FROM log_entry WHERE created_at < ?")
            .bind(cutoff)
            .execute(pool)
            .await?
            .rows_affected();

        stats.updates = sqlx::query(
            "DELETE FROM entity_update WHERE complete = 1 \
             AND log_id IN (SELECT id FROM entity_update_log WHERE timestamp < ?)",
        )
        .bind(cutoff)
        .execute(pool)
        .await?
        .rows_affected();

        stats.update_logs = sqlx::query(
            "DELETE FROM entity_update_log WHERE timestamp < ? \
             AND NOT EXISTS (SELECT 1 FROM entity_update u WHERE u.log_id = entity_update_log.id)",
        )
        .bind(cutoff)
        .execute(pool)
        .await?
        .rows_affected();

        stats.action_statuses = sqlx::query(
            "DELETE FROM entity_action_status WHERE status = 1 \
             AND action_id IN (SELECT id FROM entity_action WHERE timestamp < ?)",
        )
        .bind(cutoff)
        .execute(pool)
        .await?
        .rows_affected();

        stats.actions = sqlx::query(
            "DELETE FROM entity_action WHERE timestamp < ? \
             AND NOT EXISTS (SELECT 1 FROM entity_action_status s WHERE s.action_id = entity_action.id)",
        )
        .bind(cutoff)
        .execute(pool)
        .await?
        .rows_affected();

        Ok(stats)
    }
}

#[async_trait]
impl CronTask for LogClear {
    async fn run(&self, ctx: &CronContext) -> SyncResult<()> {
        let retention = i64::from(ctx.sync.log_retention_days) * 86_400;
        let cutoff = chrono::Utc::now().timestamp() - retention;
        let stats = Self::clear(&ctx.pool, cutoff).await?;

        ctx.services
            .log
            .info(
                "log_clear",
                &format!(
                    "Cleared {} log entries, {} updates, {} actions",
                    stats.log_entries, stats.updates, stats.action_statuses
                ),
                json!({
                    "cutoff": cutoff,
                    "log_entries": stats.log_entries,
                    "updates": stats.updates,
                    "update_logs": stats.update_logs,
                    "action_statuses": stats.action_statuses,
                    "actions": stats.actions,
                }),
                Related::default(),
            )
            .await;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        cron::runnable::test_context,
        error::{ErrorKind, SyncError},
        node::GatewayRegistry,
        store::Database,
    };
    use std::collections::HashMap;
    use std::sync::Mutex;

    /// Records every lifecycle call; fails `retrieve` for nodes named "broken"
    struct Recorder {
        events: Arc<Mutex<Vec<String>>>,
        node: String,
    }

    impl Recorder {
        fn record(&self, call: &str) {
            self.events.lock().unwrap().push(format!("{}:{}", self.node, call));
        }
    }

    #[async_trait]
    impl NodeGateway for Recorder {
        async fn init(&mut self, node: &Node, _scheduled: bool) -> SyncResult<()> {
            self.node = node.name.clone();
            self.record("init");
            Ok(())
        }

        async fn retrieve(&mut self) -> SyncResult<()> {
            self.record("retrieve");
            if self.node == "broken" {
                return Err(SyncError::node(0, "unreachable"));
            }
            Ok(())
        }

        async fn update(&mut self) -> SyncResult<()> {
            self.record("update");
            Ok(())
        }

        async fn deinit(&mut self) -> SyncResult<()> {
            self.record("deinit");
            Ok(())
        }
    }

    fn recording_registry(events: &Arc<Mutex<Vec<String>>>) -> GatewayRegistry {
        let mut registry = GatewayRegistry::new();
        let events = events.clone();
        registry.register("recorder", move |_ctx| {
            Box::new(Recorder {
                events: events.clone(),
                node: String::new(),
            })
        });
        registry
    }

    #[test]
    fn test_synchronizer_skips_half_hours() {
        let job = CronJobConfig::new(SYNCHRONIZER, 1, 0);
        assert!(Synchronizer.is_due(&job, 1));
        assert!(Synchronizer.is_due(&job, 29));
        assert!(!Synchronizer.is_due(&job, 30));
        assert!(!Synchronizer.is_due(&job, 60));
        assert!(Synchronizer.is_due(&job, 61));
    }

    #[tokio::test]
    async fn test_synchronizer_retrieves_everything_before_updating() {
        let db = Database::in_memory().await.unwrap();
        let events = Arc::new(Mutex::new(Vec::new()));
        let ctx = test_context(&db, recording_registry(&events));
        let nodes = &ctx.services.nodes;
        nodes.create_node("recorder", "erp", &HashMap::new()).await.unwrap();
        nodes.create_node("recorder", "broken", &HashMap::new()).await.unwrap();
        nodes.create_node("recorder", "shop", &HashMap::new()).await.unwrap();

        Synchronizer.run(&ctx).await.unwrap();

        let events = events.lock().unwrap().clone();
        assert_eq!(
            events,
            vec![
                "erp:init",
                "erp:retrieve",
                "broken:init",
                "broken:retrieve",
                "broken:deinit",
                "shop:init",
                "shop:retrieve",
                "erp:update",
                "erp:deinit",
                "shop:update",
                "shop:deinit",
            ]
        );
    }

    #[tokio::test]
    async fn test_unknown_node_type_aborts_before_any_node_runs() {
        let db = Database::in_memory().await.unwrap();
        let events = Arc::new(Mutex::new(Vec::new()));
        let ctx = test_context(&db, recording_registry(&events));
        ctx.services
            .nodes
            .create_node("recorder", "erp", &HashMap::new())
            .await
            .unwrap();
        ctx.services
            .nodes
            .create_node("soap", "legacy", &HashMap::new())
            .await
            .unwrap();

        let err = Synchronizer.run(&ctx).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Config);
        assert!(events.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_retrieval_never_updates() {
        let db = Database::in_memory().await.unwrap();
        let events = Arc::new(Mutex::new(Vec::new()));
        let ctx = test_context(&db, recording_registry(&events));
        ctx.services
            .nodes
            .create_node("recorder", "erp", &HashMap::new())
            .await
            .unwrap();

        Retrieval.run(&ctx).await.unwrap();
        assert_eq!(
            *events.lock().unwrap(),
            vec!["erp:init", "erp:retrieve", "erp:deinit"]
        );
    }

    #[tokio::test]
    async fn test_log_clear_keeps_pending_and_recent_rows() {
        let db = Database::in_memory().await.unwrap();
        let pool = db.pool();
        for statement in [
            "INSERT INTO log_entry (level, code, message, data, created_at) VALUES ('info', 'a', 'old', '{}', 100)",
            "INSERT INTO log_entry (level, code, message, data, created_at) VALUES ('info', 'b', 'new', '{}', 5000)",
            // Old log fully delivered
            "INSERT INTO entity_update_log (id, entity_id, entity_type, timestamp, source_node, affected_nodes, affected_attributes, type) VALUES (1, 1, 'product', 100, 1, '2', 'price', 'update')",
            "INSERT INTO entity_update (entity_id, node_id, log_id, type, complete) VALUES (1, 2, 1, 'update', 1)",
            // Old log still pending for one node
            "INSERT INTO entity_update_log (id, entity_id, entity_type, timestamp, source_node, affected_nodes, affected_attributes, type) VALUES (2, 1, 'product', 100, 1, '2,3', 'price', 'update')",
            "INSERT INTO entity_update (entity_id, node_id, log_id, type, complete) VALUES (1, 2, 2, 'update', 1)",
            "INSERT INTO entity_update (entity_id, node_id, log_id, type, complete) VALUES (1, 3, 2, 'update', 0)",
        ] {
            sqlx::query(statement).execute(pool).await.unwrap();
        }

        let stats = LogClear::clear(pool, 1000).await.unwrap();
        assert_eq!(
            stats,
            ClearStats {
                log_entries: 1,
                updates: 2,
                update_logs: 1,
                action_statuses: 0,
                actions: 0,
            }
        );

        let pending = pending_count(pool).await;
        assert_eq!(pending, 1);
    }

    async fn pending_count(pool: &SqlitePool) -> i64 {
        let (n,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM entity_update WHERE complete = 0")
            .fetch_one(pool)
            .await
            .unwrap();
        n
    }

    #[test]
    fn test_builtin_task_names() {
        assert!(builtin_task("synchronizer").is_some());
        assert!(builtin_task("retrieval").is_some());
        assert!(builtin_task("logclear").is_some());
        assert!(builtin_task("reindex").is_none());
    }
}

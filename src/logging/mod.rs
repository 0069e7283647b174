//! Log service
//!
//! Every record is emitted as a `tracing` event. Records whose level is enabled in
//! `LoggingConfig` are also written to the `log_entry` table so operators can audit a
//! run after the fact. Writing is fire-and-forget: a failed insert is reported through
//! `tracing` and never propagated.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use sqlx::sqlite::SqlitePool;
use std::collections::HashSet;

/// Severity of a log record, each level toggled independently
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogLevel {
    Error,
    Warn,
    Info,
    Debug,
    DebugExtra,
    DebugInternal,
}

impl LogLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            LogLevel::Error => "error",
            LogLevel::Warn => "warn",
            LogLevel::Info => "info",
            LogLevel::Debug => "debug",
            LogLevel::DebugExtra => "debug_extra",
            LogLevel::DebugInternal => "debug_internal",
        }
    }
}

/// Entities a record refers to
#[derive(Debug, Clone, Copy, Default)]
pub struct Related {
    pub entity_id: Option<i64>,
    pub node_id: Option<i64>,
}

impl Related {
    pub fn entity(entity_id: i64) -> Self {
        Self {
            entity_id: Some(entity_id),
            node_id: None,
        }
    }

    pub fn node(node_id: i64) -> Self {
        Self {
            entity_id: None,
            node_id: Some(node_id),
        }
    }

    pub fn with_node(mut self, node_id: i64) -> Self {
        self.node_id = Some(node_id);
        self
    }
}

#[derive(Debug, Clone)]
pub struct LogService {
    pool: SqlitePool,
    enabled: HashSet<LogLevel>,
}

impl LogService {
    /// Log service persisting only `enabled_levels`; tracing always gets every record
    pub fn new(pool: SqlitePool, enabled_levels: &[LogLevel]) -> Self {
        Self {
            pool,
            enabled: enabled_levels.iter().copied().collect(),
        }
    }

    pub fn is_enabled(&self, level: LogLevel) -> bool {
        self.enabled.contains(&level)
    }

    /// Emit a record; persists it when the level is enabled
    pub async fn log(
        &self,
        level: LogLevel,
        code: &str,
        message: &str,
        data: Value,
        related: Related,
    ) {
        match level {
            LogLevel::Error => tracing::error!(code, ?related, "{}", message),
            LogLevel::Warn => tracing::warn!(code, ?related, "{}", message),
            LogLevel::Info => tracing::info!(code, ?related, "{}", message),
            LogLevel::Debug => tracing::debug!(code, ?related, "{}", message),
            LogLevel::DebugExtra | LogLevel::DebugInternal => {
                tracing::trace!(code, ?related, level = level.as_str(), "{}", message)
            }
        }

        if !self.is_enabled(level) {
            return;
        }

        let result = sqlx::query(
            r#"
            INSERT INTO log_entry (level, code, message, data, entity_id, node_id, created_at)
            VALUES (?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(level.as_str())
        .bind(code)
        .bind(message)
        .bind(data.to_string())
        .bind(related.entity_id)
        .bind(related.node_id)
        .bind(chrono::Utc::now().timestamp())
        .execute(&self.pool)
        .await;

        if let Err(e) = result {
            tracing::warn!("⚠️ Failed to persist log record '{}': {}", code, e);
        }
    }

    pub async fn error(&self, code: &str, message: &str, data: Value, related: Related) {
        self.log(LogLevel::Error, code, message, data, related).await
    }

    pub async fn warn(&self, code: &str, message: &str, data: Value, related: Related) {
        self.log(LogLevel::Warn, code, message, data, related).await
    }

    pub async fn info(&self, code: &str, message: &str, data: Value, related: Related) {
        self.log(LogLevel::Info, code, message, data, related).await
    }

    pub async fn debug(&self, code: &str, message: &str, data: Value, related: Related) {
        self.log(LogLevel::Debug, code, message, data, related).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::Database;
    use serde_json::json;

    #[tokio::test]
    async fn test_only_enabled_levels_are_persisted() {
        let db = Database::in_memory().await.unwrap();
        let log = LogService::new(db.pool().clone(), &[LogLevel::Error, LogLevel::Info]);

        log.error("e1", "boom", json!({"a": 1}), Related::node(4)).await;
        log.debug("d1", "noise", json!(null), Related::default()).await;
        log.info("i1", "hello", json!(null), Related::entity(9)).await;

        let rows: Vec<(String, Option<i64>)> =
            sqlx::query_as("SELECT code, node_id FROM log_entry ORDER BY id")
                .fetch_all(db.pool())
                .await
                .unwrap();
        assert_eq!(rows, vec![("e1".to_string(), Some(4)), ("i1".to_string(), None)]);
    }
}

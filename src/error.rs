//! Error taxonomy for the sync core
//!
//! Every failure inside the scheduler, router and node layers is a `SyncError`.
//! Loop drivers match on `ErrorKind` to decide whether to skip a node, end a job
//! run early, or keep going with the next record.

use thiserror::Error;

/// Result alias used across the sync core
pub type SyncResult<T> = std::result::Result<T, SyncError>;

/// Coarse classification used by loop drivers
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Bad configuration: unknown node/transform/filter type, dangling reference
    Config,
    /// A single external system failed
    Node,
    /// A scheduled pass failed in a way not attributable to one node
    Sync,
    /// Audit tables are inconsistent (e.g. update row without its log row)
    Integrity,
    /// Database, filesystem or serialization failure
    Persistence,
}

#[derive(Debug, Error)]
pub enum SyncError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Node {node_id} error: {message}")]
    Node { node_id: i64, message: String },

    #[error("Sync error: {0}")]
    Sync(String),

    #[error("Integrity error: {0}")]
    Integrity(String),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Json(#[from] serde_json::Error),
}

impl SyncError {
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config(message.into())
    }

    pub fn node(node_id: i64, message: impl Into<String>) -> Self {
        Self::Node {
            node_id,
            message: message.into(),
        }
    }

    pub fn sync(message: impl Into<String>) -> Self {
        Self::Sync(message.into())
    }

    pub fn integrity(message: impl Into<String>) -> Self {
        Self::Integrity(message.into())
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            SyncError::Config(_) => ErrorKind::Config,
            SyncError::Node { .. } => ErrorKind::Node,
            SyncError::Sync(_) => ErrorKind::Sync,
            SyncError::Integrity(_) => ErrorKind::Integrity,
            SyncError::Database(_) | SyncError::Io(_) | SyncError::Json(_) => {
                ErrorKind::Persistence
            }
        }
    }

    /// Short code used in persisted log records
    pub fn code(&self) -> &'static str {
        match self.kind() {
            ErrorKind::Config => "config",
            ErrorKind::Node => "node",
            ErrorKind::Sync => "sync",
            ErrorKind::Integrity => "integrity",
            ErrorKind::Persistence => "persist",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_classification() {
        assert_eq!(SyncError::config("x").kind(), ErrorKind::Config);
        assert_eq!(SyncError::node(3, "down").kind(), ErrorKind::Node);
        assert_eq!(SyncError::sync("x").kind(), ErrorKind::Sync);
        assert_eq!(SyncError::integrity("x").kind(), ErrorKind::Integrity);
        let io = SyncError::from(std::io::Error::new(std::io::ErrorKind::Other, "disk"));
        assert_eq!(io.kind(), ErrorKind::Persistence);
    }

    #[test]
    fn test_node_error_message() {
        let err = SyncError::node(7, "timeout");
        assert_eq!(err.to_string(), "Node 7 error: timeout");
        assert_eq!(err.code(), "node");
    }
}

//! Node and work-queue type definitions

use crate::store::Entity;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

/// Kind of change being propagated
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChangeType {
    Create,
    Update,
    Delete,
    Action,
}

impl ChangeType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChangeType::Create => "create",
            ChangeType::Update => "update",
            ChangeType::Delete => "delete",
            ChangeType::Action => "action",
        }
    }
}

impl fmt::Display for ChangeType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ChangeType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "create" => Ok(ChangeType::Create),
            "update" => Ok(ChangeType::Update),
            "delete" => Ok(ChangeType::Delete),
            "action" => Ok(ChangeType::Action),
            other => Err(format!("Unknown change type: {}", other)),
        }
    }
}

/// An external system integrated with the platform
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Node {
    pub id: i64,
    /// Gateway key (e.g. "http_push")
    pub node_type: String,
    pub name: String,
    pub active: bool,
    /// Free-form key/value configuration from `node_data`
    pub config: HashMap<String, String>,
}

impl Node {
    pub fn config_value(&self, key: &str) -> Option<&str> {
        self.config.get(key).map(String::as_str)
    }
}

/// One row of the audit trail
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EntityUpdateLog {
    pub id: i64,
    pub entity_id: i64,
    pub entity_type: String,
    pub timestamp: i64,
    pub source_node: i64,
    pub affected_nodes: Vec<i64>,
    pub affected_attributes: Vec<String>,
    pub change_type: ChangeType,
}

/// A change a node has not yet consumed
#[derive(Debug, Clone, Serialize)]
pub struct PendingUpdate {
    pub update_id: i64,
    pub log: EntityUpdateLog,
    /// Live entity; `None` once the entity has been removed from the store
    pub entity: Option<Entity>,
}

/// A node-initiated command waiting to be executed by a node
#[derive(Debug, Clone, Serialize)]
pub struct PendingAction {
    pub action_id: i64,
    pub entity_id: i64,
    pub entity_type: String,
    pub source_node: i64,
    pub action_type: String,
    pub data: Value,
    pub timestamp: i64,
    pub entity: Option<Entity>,
}

pub(crate) fn join_csv<T: ToString>(values: &[T]) -> String {
    values
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(",")
}

pub(crate) fn split_csv(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_change_type_roundtrip_names() {
        for ct in [ChangeType::Create, ChangeType::Update, ChangeType::Delete, ChangeType::Action] {
            assert_eq!(ct.as_str().parse::<ChangeType>(), Ok(ct));
        }
        assert!("upsert".parse::<ChangeType>().is_err());
    }

    #[test]
    fn test_csv_helpers_skip_blanks() {
        assert_eq!(join_csv(&[3, 5]), "3,5");
        assert_eq!(split_csv(" price, ,list_price"), vec!["price", "list_price"]);
        assert!(split_csv("").is_empty());
    }
}

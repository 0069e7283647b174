//! Router rule definitions

use crate::node::ChangeType;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Simple key-value configuration attached to transforms and filters
pub type ConfigMap = serde_json::Map<String, Value>;

/// "Changes of `entity_type` from `node_from` propagate to `node_to`"
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RouterEdge {
    pub id: i64,
    pub node_from: i64,
    pub node_to: i64,
    pub entity_type: String,
    pub change_type: ChangeType,
    pub enabled: bool,
}

/// "When `src_attribute` changes on `entity_type`, recompute `dest_attribute`"
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RouterTransform {
    pub id: i64,
    pub entity_type: String,
    pub src_attribute: String,
    pub dest_attribute: Option<String>,
    /// Registry key of the transform implementation
    pub transform_type: String,
    /// Restrict the rule to one change type; `None` applies to all
    pub change_type: Option<ChangeType>,
    pub enabled: bool,
    pub config: ConfigMap,
}

impl RouterTransform {
    pub fn config_str(&self, key: &str) -> Option<&str> {
        self.config.get(key).and_then(Value::as_str).filter(|s| !s.is_empty())
    }
}

/// A veto gate, attached to edges and transforms
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RouterFilter {
    pub id: i64,
    /// Registry key of the filter implementation
    pub filter_type: String,
    pub config: ConfigMap,
}

/// New edge definition
#[derive(Debug, Clone)]
pub struct NewEdge {
    pub node_from: i64,
    pub node_to: i64,
    pub entity_type: String,
    pub change_type: ChangeType,
}

/// New transform definition
#[derive(Debug, Clone)]
pub struct NewTransform {
    pub entity_type: String,
    pub src_attribute: String,
    pub dest_attribute: Option<String>,
    pub transform_type: String,
    pub change_type: Option<ChangeType>,
    pub config: ConfigMap,
}

impl NewTransform {
    pub fn new(entity_type: &str, src: &str, dest: &str, transform_type: &str) -> Self {
        Self {
            entity_type: entity_type.to_string(),
            src_attribute: src.to_string(),
            dest_attribute: Some(dest.to_string()),
            transform_type: transform_type.to_string(),
            change_type: None,
            config: ConfigMap::new(),
        }
    }

    pub fn with_config(mut self, key: &str, value: Value) -> Self {
        self.config.insert(key.to_string(), value);
        self
    }
}

/// Result of fanning one change out to subscriber nodes
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct Distribution {
    /// Audit log row; `None` when no edge survived
    pub log_id: Option<i64>,
    /// Nodes that received an update row
    pub affected_nodes: Vec<i64>,
    /// Nodes whose update row could not be written
    pub failed_nodes: Vec<i64>,
    pub affected_attributes: Vec<String>,
}

/// Result of fanning one action out to subscriber nodes
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ActionDistribution {
    pub action_id: Option<i64>,
    pub affected_nodes: Vec<i64>,
    pub failed_nodes: Vec<i64>,
}

/// Result of the full mutation pipeline for one entity
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct UpdateOutcome {
    /// Entity with incoming and derived values applied
    pub entity: crate::store::Entity,
    /// Values computed by transforms
    pub derived: crate::store::AttributeMap,
    pub distribution: Distribution,
}

//! Veto gates for edges and transforms
//!
//! A filter is initialised with the entity being routed and then asked about one edge
//! or one transform. Both checks pass unless an implementation opts into blocking.

use crate::{
    error::{SyncError, SyncResult},
    node::ChangeType,
    router::types::ConfigMap,
    store::Entity,
};
use serde_json::Value;
use std::{collections::HashMap, sync::Arc};

pub trait Filter: Send {
    /// Attributes `init` reads from the entity
    ///
    /// The router loads any of these the entity does not carry yet before calling
    /// `init`, so a filter never judges a partially loaded entity.
    fn required_attributes(&self, _config: &ConfigMap) -> Vec<String> {
        Vec::new()
    }

    fn init(&mut self, entity: &Entity, change_type: ChangeType, config: &ConfigMap) -> SyncResult<()>;

    fn check_edge(&self, _node_from: i64, _node_to: i64, _changed: &[String]) -> bool {
        true
    }

    fn check_transform(&self, _src: &str, _dest: Option<&str>, _changed: &[String]) -> bool {
        true
    }
}

/// Read a list setting given either as a JSON array or a comma separated string
fn config_list(config: &ConfigMap, key: &str) -> Vec<String> {
    match config.get(key) {
        Some(Value::Array(items)) => items
            .iter()
            .filter_map(|v| match v {
                Value::String(s) => Some(s.trim().to_string()),
                Value::Null => None,
                other => Some(other.to_string()),
            })
            .filter(|s| !s.is_empty())
            .collect(),
        Some(Value::String(csv)) => csv
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(String::from)
            .collect(),
        _ => Vec::new(),
    }
}

fn config_flag(config: &ConfigMap, key: &str) -> bool {
    match config.get(key) {
        Some(Value::Bool(b)) => *b,
        Some(Value::Number(n)) => n.as_i64().unwrap_or(0) != 0,
        Some(Value::String(s)) => matches!(s.as_str(), "1" | "true" | "yes"),
        _ => false,
    }
}

/// Loose equality: "5" matches 5, so string configs can target numeric attributes
fn values_match(actual: &Value, expected: &Value) -> bool {
    if actual == expected {
        return true;
    }
    let as_text = |v: &Value| match v {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    };
    as_text(actual) == as_text(expected)
}

// ============================================================================
// attribute_changed
// ============================================================================

/// Passes only when one of the configured attributes is part of the change
#[derive(Debug, Default)]
pub struct AttributeChangedFilter {
    attributes: Vec<String>,
}

impl AttributeChangedFilter {
    fn matches(&self, changed: &[String]) -> bool {
        changed.iter().any(|code| self.attributes.contains(code))
    }
}

impl Filter for AttributeChangedFilter {
    fn init(&mut self, _entity: &Entity, _change_type: ChangeType, config: &ConfigMap) -> SyncResult<()> {
        self.attributes = config_list(config, "attributes");
        if self.attributes.is_empty() {
            return Err(SyncError::config("attribute_changed filter needs 'attributes'"));
        }
        Ok(())
    }

    fn check_edge(&self, _node_from: i64, _node_to: i64, changed: &[String]) -> bool {
        self.matches(changed)
    }

    fn check_transform(&self, _src: &str, _dest: Option<&str>, changed: &[String]) -> bool {
        self.matches(changed)
    }
}

// ============================================================================
// attribute_value
// ============================================================================

/// Passes only when the entity's stored value equals the configured one
#[derive(Debug, Default)]
pub struct AttributeValueFilter {
    pass: bool,
}

impl Filter for AttributeValueFilter {
    fn required_attributes(&self, config: &ConfigMap) -> Vec<String> {
        config
            .get("attribute")
            .and_then(Value::as_str)
            .map(|code| vec![code.to_string()])
            .unwrap_or_default()
    }

    fn init(&mut self, entity: &Entity, _change_type: ChangeType, config: &ConfigMap) -> SyncResult<()> {
        let attribute = config
            .get("attribute")
            .and_then(Value::as_str)
            .ok_or_else(|| SyncError::config("attribute_value filter needs 'attribute'"))?;
        let expected = config
            .get("value")
            .ok_or_else(|| SyncError::config("attribute_value filter needs 'value'"))?;

        let matched = entity
            .get(attribute)
            .map(|actual| values_match(actual, expected))
            .unwrap_or(false);
        self.pass = matched != config_flag(config, "negate");
        Ok(())
    }

    fn check_edge(&self, _node_from: i64, _node_to: i64, _changed: &[String]) -> bool {
        self.pass
    }

    fn check_transform(&self, _src: &str, _dest: Option<&str>, _changed: &[String]) -> bool {
        self.pass
    }
}

// ============================================================================
// Registry
// ============================================================================

pub type FilterFactory = Arc<dyn Fn() -> Box<dyn Filter> + Send + Sync>;

/// Filter type -> factory
#[derive(Clone, Default)]
pub struct FilterRegistry {
    factories: HashMap<String, FilterFactory>,
}

impl FilterRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_builtin() -> Self {
        let mut registry = Self::new();
        registry.register("attribute_changed", || Box::new(AttributeChangedFilter::default()));
        registry.register("attribute_value", || Box::new(AttributeValueFilter::default()));
        registry
    }

    /// Register (or replace) the factory for `filter_type`
    pub fn register<F>(&mut self, filter_type: &str, factory: F)
    where
        F: Fn() -> Box<dyn Filter> + Send + Sync + 'static,
    {
        self.factories.insert(filter_type.to_string(), Arc::new(factory));
    }

    /// Fresh filter instance for `filter_type`
    ///
    /// An unknown type is a configuration error.
    pub fn create(&self, filter_type: &str) -> SyncResult<Box<dyn Filter>> {
        self.factories
            .get(filter_type)
            .map(|factory| factory())
            .ok_or_else(|| SyncError::config(format!("Unknown filter type '{}'", filter_type)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn product(data: Value) -> Entity {
        Entity {
            id: 7,
            entity_type: "product".to_string(),
            unique_id: Some("SKU-7".to_string()),
            node_id: None,
            updated_at: 0,
            data: serde_json::from_value(data).unwrap(),
        }
    }

    fn config(value: Value) -> ConfigMap {
        match value {
            Value::Object(map) => map,
            _ => unreachable!(),
        }
    }

    #[test]
    fn test_attribute_changed_accepts_csv_and_arrays() {
        let entity = product(json!({}));
        let changed = vec!["price".to_string()];

        let mut csv = AttributeChangedFilter::default();
        csv.init(&entity, ChangeType::Update, &config(json!({"attributes": "name, price"})))
            .unwrap();
        assert!(csv.check_edge(1, 2, &changed));

        let mut array = AttributeChangedFilter::default();
        array
            .init(&entity, ChangeType::Update, &config(json!({"attributes": ["stock"]})))
            .unwrap();
        assert!(!array.check_edge(1, 2, &changed));
        assert!(!array.check_transform("price", Some("list_price"), &changed));
    }

    #[test]
    fn test_attribute_changed_without_attributes_is_config_error() {
        let mut filter = AttributeChangedFilter::default();
        let err = filter
            .init(&product(json!({})), ChangeType::Update, &ConfigMap::new())
            .unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::Config);
    }

    #[test]
    fn test_attribute_value_with_negate() {
        let entity = product(json!({"status": "enabled", "visibility": 4}));

        let mut filter = AttributeValueFilter::default();
        filter
            .init(&entity, ChangeType::Update, &config(json!({"attribute": "status", "value": "enabled"})))
            .unwrap();
        assert!(filter.check_edge(1, 2, &[]));

        let mut numeric = AttributeValueFilter::default();
        numeric
            .init(&entity, ChangeType::Update, &config(json!({"attribute": "visibility", "value": "4"})))
            .unwrap();
        assert!(numeric.check_transform("a", None, &[]));

        let mut negated = AttributeValueFilter::default();
        negated
            .init(
                &entity,
                ChangeType::Update,
                &config(json!({"attribute": "status", "value": "enabled", "negate": true})),
            )
            .unwrap();
        assert!(!negated.check_edge(1, 2, &[]));
    }

    #[test]
    fn test_default_checks_are_permissive() {
        struct Noop;
        impl Filter for Noop {
            fn init(&mut self, _: &Entity, _: ChangeType, _: &ConfigMap) -> SyncResult<()> {
                Ok(())
            }
        }
        let filter = Noop;
        assert!(filter.check_edge(1, 2, &[]));
        assert!(filter.check_transform("a", Some("b"), &[]));
    }

    #[test]
    fn test_registry_rejects_unknown_type() {
        let registry = FilterRegistry::with_builtin();
        assert!(registry.create("attribute_value").is_ok());
        assert!(registry.create("missing").is_err());
    }
}

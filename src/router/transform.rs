//! Derived-attribute transforms
//!
//! A transform is created per applicable rule, asked whether it wants to run
//! (`init`), and then produces attribute values for the entity (`apply`).

use crate::{
    error::{SyncError, SyncResult},
    router::types::RouterTransform,
    store::{AttributeMap, Entity, EntityStore},
};
use async_trait::async_trait;
use serde_json::Value;
use std::{collections::HashMap, sync::Arc};

/// Everything a transform may look at while deciding and computing
pub struct TransformContext<'a> {
    pub entity: &'a Entity,
    pub source_node: i64,
    pub rule: &'a RouterTransform,
    /// Incoming values of the mutation being routed
    pub updated_data: &'a AttributeMap,
    pub store: &'a dyn EntityStore,
}

impl TransformContext<'_> {
    /// Incoming value of `code`, falling back to the stored one
    pub fn current_value(&self, code: &str) -> Option<&Value> {
        self.updated_data.get(code).or_else(|| self.entity.get(code))
    }
}

#[async_trait]
pub trait Transform: Send {
    /// Returns false to abstain from this rule
    async fn init(&mut self, ctx: &TransformContext<'_>) -> SyncResult<bool>;

    fn apply(&self) -> AttributeMap;
}

/// Copies the source value to the destination attribute
#[derive(Debug, Default)]
pub struct CopyTransform {
    dest: String,
    value: Value,
}

#[async_trait]
impl Transform for CopyTransform {
    async fn init(&mut self, ctx: &TransformContext<'_>) -> SyncResult<bool> {
        let Some(dest) = ctx.rule.dest_attribute.as_deref().filter(|d| !d.is_empty()) else {
            return Ok(false);
        };
        self.dest = dest.to_string();
        self.value = ctx
            .current_value(&ctx.rule.src_attribute)
            .cloned()
            .unwrap_or(Value::Null);
        Ok(true)
    }

    fn apply(&self) -> AttributeMap {
        AttributeMap::from([(self.dest.clone(), self.value.clone())])
    }
}

/// Writes the configured static `value`; the source attribute only triggers it
#[derive(Debug, Default)]
pub struct SetTransform {
    dest: String,
    value: Value,
}

#[async_trait]
impl Transform for SetTransform {
    async fn init(&mut self, ctx: &TransformContext<'_>) -> SyncResult<bool> {
        let Some(dest) = ctx.rule.dest_attribute.as_deref().filter(|d| !d.is_empty()) else {
            return Ok(false);
        };
        let Some(value) = ctx.rule.config.get("value") else {
            return Ok(false);
        };
        self.dest = dest.to_string();
        self.value = value.clone();
        Ok(true)
    }

    fn apply(&self) -> AttributeMap {
        AttributeMap::from([(self.dest.clone(), self.value.clone())])
    }
}

/// Follows the source attribute to a foreign entity and copies one of its attributes
///
/// Config: `foreign_type` (entity type of the referenced entity) and
/// `foreign_attribute` (code to copy). A reference that resolves to nothing clears the
/// destination.
#[derive(Debug, Default)]
pub struct DenormalizeTransform {
    dest: String,
    value: Value,
}

#[async_trait]
impl Transform for DenormalizeTransform {
    async fn init(&mut self, ctx: &TransformContext<'_>) -> SyncResult<bool> {
        let Some(dest) = ctx.rule.dest_attribute.as_deref().filter(|d| !d.is_empty()) else {
            return Ok(false);
        };
        let (Some(foreign_type), Some(foreign_attribute)) = (
            ctx.rule.config_str("foreign_type"),
            ctx.rule.config_str("foreign_attribute"),
        ) else {
            return Ok(false);
        };
        self.dest = dest.to_string();

        // Resolve against the incoming reference, not the stored one
        let src = &ctx.rule.src_attribute;
        let mut lookup = ctx.entity.clone();
        if let Some(incoming) = ctx.updated_data.get(src) {
            lookup.data.insert(src.clone(), incoming.clone());
        }

        let Some(mut foreign) = ctx.store.resolve(&lookup, src, foreign_type).await? else {
            tracing::debug!(
                "🔗 Entity {} attribute '{}' resolves to nothing, clearing '{}'",
                ctx.entity.id,
                src,
                dest
            );
            self.value = Value::Null;
            return Ok(true);
        };

        if !foreign.has_attribute(foreign_attribute) {
            ctx.store
                .enhance_entity(&mut foreign, &[foreign_attribute.to_string()])
                .await?;
        }
        self.value = foreign.get(foreign_attribute).cloned().unwrap_or(Value::Null);
        Ok(true)
    }

    fn apply(&self) -> AttributeMap {
        AttributeMap::from([(self.dest.clone(), self.value.clone())])
    }
}

pub type TransformFactory = Arc<dyn Fn() -> Box<dyn Transform> + Send + Sync>;

/// Transform type -> factory
#[derive(Clone, Default)]
pub struct TransformRegistry {
    factories: HashMap<String, TransformFactory>,
}

impl TransformRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_builtin() -> Self {
        let mut registry = Self::new();
        registry.register("copy", || Box::new(CopyTransform::default()));
        registry.register("set", || Box::new(SetTransform::default()));
        registry.register("denormalize", || Box::new(DenormalizeTransform::default()));
        registry
    }

    /// Register (or replace) the factory for `transform_type`
    pub fn register<F>(&mut self, transform_type: &str, factory: F)
    where
        F: Fn() -> Box<dyn Transform> + Send + Sync + 'static,
    {
        self.factories.insert(transform_type.to_string(), Arc::new(factory));
    }

    /// Fresh transform instance for `transform_type`
    ///
    /// An unknown type is a configuration error; the rule cannot be skipped silently.
    pub fn create(&self, transform_type: &str) -> SyncResult<Box<dyn Transform>> {
        self.factories
            .get(transform_type)
            .map(|factory| factory())
            .ok_or_else(|| SyncError::config(format!("Unknown transform type '{}'", transform_type)))
    }
}

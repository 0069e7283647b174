//! Router service
//!
//! Central dispatcher for entity mutations. Transforms derive extra attribute values
//! from a change; edges fan the change out to subscriber nodes; filters may veto
//! either. Every distribution leaves an audit row plus one work item per target node,
//! which the node service later serves as pending updates.

use crate::{
    error::SyncResult,
    logging::{LogService, Related},
    node::ChangeType,
    router::{
        filter::FilterRegistry,
        repository::RouterRepository,
        transform::{TransformContext, TransformRegistry},
        types::{ActionDistribution, Distribution, RouterEdge, RouterTransform, UpdateOutcome},
    },
    store::{AttributeMap, Entity, EntityStore, RetryPolicy},
};
use serde_json::{json, Value};
use std::{borrow::Cow, sync::Arc};

pub struct RouterService {
    repo: RouterRepository,
    entities: Arc<dyn EntityStore>,
    transforms: TransformRegistry,
    filters: FilterRegistry,
    log: LogService,
    retry: RetryPolicy,
}

/// Codes of `updated` whose value differs from what `current` holds
fn changed_attributes(current: &Entity, updated: &AttributeMap) -> Vec<String> {
    updated
        .iter()
        .filter(|(code, value)| current.get(code) != Some(*value))
        .map(|(code, _)| code.clone())
        .collect()
}

impl RouterService {
    pub fn new(
        repo: RouterRepository,
        entities: Arc<dyn EntityStore>,
        transforms: TransformRegistry,
        filters: FilterRegistry,
        log: LogService,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            repo,
            entities,
            transforms,
            filters,
            log,
            retry,
        }
    }

    pub fn repository(&self) -> &RouterRepository {
        &self.repo
    }

    pub fn entities(&self) -> &Arc<dyn EntityStore> {
        &self.entities
    }

    /// Stored values for every incoming code, loaded onto a copy of `entity`
    async fn with_current_values(&self, entity: &Entity, updated: &AttributeMap) -> SyncResult<Entity> {
        let mut current = entity.clone();
        let codes: Vec<String> = updated.keys().cloned().collect();
        self.entities.enhance_entity(&mut current, &codes).await?;
        Ok(current)
    }

    // ========================================================================
    // Transforms
    // ========================================================================

    /// Compute derived attribute values for a mutation
    ///
    /// Only attributes whose incoming value differs from the stored one trigger rules.
    /// Rules run in table order and later results overwrite earlier ones.
    pub async fn process_transforms(
        &self,
        entity: &Entity,
        updated_data: &AttributeMap,
        source_node: i64,
        change_type: ChangeType,
    ) -> SyncResult<AttributeMap> {
        let current = self.with_current_values(entity, updated_data).await?;
        let changed = changed_attributes(&current, updated_data);
        if changed.is_empty() {
            return Ok(AttributeMap::new());
        }

        let rules = self
            .repo
            .transforms_for(&entity.entity_type, &changed, change_type)
            .await?;

        let mut derived = AttributeMap::new();
        for rule in &rules {
            if !self
                .check_filters_transform(&current, rule, &changed, change_type)
                .await?
            {
                self.log
                    .debug(
                        "router_transform_filtered",
                        &format!("Transform {} vetoed by filter for entity {}", rule.id, entity.id),
                        json!({ "transform_id": rule.id, "changed": changed }),
                        Related::entity(entity.id),
                    )
                    .await;
                continue;
            }

            let mut transform = self.transforms.create(&rule.transform_type)?;
            let ctx = TransformContext {
                entity: &current,
                source_node,
                rule,
                updated_data,
                store: self.entities.as_ref(),
            };
            if !transform.init(&ctx).await? {
                tracing::debug!("⏭️ Transform {} abstained for entity {}", rule.id, entity.id);
                continue;
            }

            let output = transform.apply();
            tracing::debug!(
                "🔧 Transform {} ({}) produced {:?} for entity {}",
                rule.id,
                rule.transform_type,
                output.keys().collect::<Vec<_>>(),
                entity.id
            );
            derived.extend(output);
        }

        Ok(derived)
    }

    // ========================================================================
    // Distribution
    // ========================================================================

    /// Nodes reachable from `source_node` for this change, after edge filters
    async fn route_targets(
        &self,
        entity: &Entity,
        changed: &[String],
        source_node: i64,
        change_type: ChangeType,
    ) -> SyncResult<Vec<i64>> {
        let edges = self
            .repo
            .edges_from(source_node, &entity.entity_type, change_type)
            .await?;

        let mut targets = Vec::new();
        for edge in &edges {
            if !self.check_filters_edge(entity, edge, changed, change_type).await? {
                self.log
                    .debug(
                        "router_edge_filtered",
                        &format!("Edge {} to node {} vetoed by filter", edge.id, edge.node_to),
                        json!({ "edge_id": edge.id }),
                        Related::entity(entity.id).with_node(edge.node_to),
                    )
                    .await;
                continue;
            }

            if let Err(e) = self.repo.increment_edge_counter(edge.id).await {
                tracing::warn!("⚠️ Edge counter {} not updated: {}", edge.id, e);
            }
            if !targets.contains(&edge.node_to) {
                targets.push(edge.node_to);
            }
        }

        for node_id in &targets {
            if let Err(e) = self
                .repo
                .increment_node_counter(*node_id, &entity.entity_type, change_type)
                .await
            {
                tracing::warn!("⚠️ Node counter {} not updated: {}", node_id, e);
            }
        }

        Ok(targets)
    }

    /// Fan an attribute change out to every subscribed node
    ///
    /// Writes one audit log row and one incomplete work item per target. A work item
    /// that cannot be written is logged and reported in `failed_nodes`; the others are
    /// still written. Repeated calls are not deduplicated.
    pub async fn distribute_update(
        &self,
        entity: &Entity,
        attributes: &[String],
        source_node: i64,
        change_type: ChangeType,
    ) -> SyncResult<Distribution> {
        let targets = self
            .route_targets(entity, attributes, source_node, change_type)
            .await?;

        let mut distribution = Distribution {
            affected_attributes: attributes.to_vec(),
            ..Default::default()
        };
        if targets.is_empty() {
            tracing::debug!(
                "📭 No subscribers for {} {} from node {}",
                entity.entity_type,
                entity.id,
                source_node
            );
            return Ok(distribution);
        }

        let repo = &self.repo;
        let entity_type = entity.entity_type.as_str();
        let nodes = targets.as_slice();
        let timestamp = chrono::Utc::now().timestamp();
        let log_id = self
            .retry
            .run("entity_update_log", move || {
                repo.insert_update_log(
                    entity.id,
                    entity_type,
                    timestamp,
                    source_node,
                    nodes,
                    attributes,
                    change_type,
                )
            })
            .await?;
        distribution.log_id = Some(log_id);

        for &node_id in &targets {
            let inserted = self
                .retry
                .run("entity_update", move || {
                    repo.insert_update(entity.id, node_id, log_id, change_type)
                })
                .await;
            match inserted {
                Ok(_) => distribution.affected_nodes.push(node_id),
                Err(e) => {
                    self.log
                        .error(
                            "router_update_insert",
                            &format!("Update for node {} (log {}) not stored: {}", node_id, log_id, e),
                            json!({ "log_id": log_id }),
                            Related::entity(entity.id).with_node(node_id),
                        )
                        .await;
                    distribution.failed_nodes.push(node_id);
                }
            }
        }

        self.log
            .info(
                "router_distribute",
                &format!(
                    "Distributed {} of {} {} to {} nodes",
                    change_type,
                    entity.entity_type,
                    entity.id,
                    distribution.affected_nodes.len()
                ),
                json!({
                    "log_id": log_id,
                    "nodes": distribution.affected_nodes,
                    "attributes": attributes,
                }),
                Related::entity(entity.id).with_node(source_node),
            )
            .await;

        Ok(distribution)
    }

    /// Fan a node-initiated action out to every subscribed node
    pub async fn distribute_action(
        &self,
        entity: &Entity,
        source_node: i64,
        action_type: &str,
        action_data: &Value,
    ) -> SyncResult<ActionDistribution> {
        let targets = self
            .route_targets(entity, &[], source_node, ChangeType::Action)
            .await?;

        let mut distribution = ActionDistribution::default();
        if targets.is_empty() {
            return Ok(distribution);
        }

        let repo = &self.repo;
        let entity_type = entity.entity_type.as_str();
        let data = action_data.to_string();
        let data = data.as_str();
        let timestamp = chrono::Utc::now().timestamp();
        let action_id = self
            .retry
            .run("entity_action", move || {
                repo.insert_action(entity.id, entity_type, source_node, action_type, data, timestamp)
            })
            .await?;
        distribution.action_id = Some(action_id);

        for &node_id in &targets {
            let inserted = self
                .retry
                .run("entity_action_status", move || {
                    repo.insert_action_status(action_id, node_id)
                })
                .await;
            match inserted {
                Ok(()) => distribution.affected_nodes.push(node_id),
                Err(e) => {
                    self.log
                        .error(
                            "router_action_insert",
                            &format!("Action {} for node {} not stored: {}", action_id, node_id, e),
                            json!({ "action_id": action_id }),
                            Related::entity(entity.id).with_node(node_id),
                        )
                        .await;
                    distribution.failed_nodes.push(node_id);
                }
            }
        }

        tracing::info!(
            "📨 Action '{}' on entity {} sent to {} nodes",
            action_type,
            entity.id,
            distribution.affected_nodes.len()
        );
        Ok(distribution)
    }

    /// Full mutation pipeline: transforms, write-back, distribution
    ///
    /// An update that changes nothing is dropped without touching the store.
    pub async fn update_entity(
        &self,
        entity: &Entity,
        updated_data: &AttributeMap,
        source_node: i64,
        change_type: ChangeType,
    ) -> SyncResult<UpdateOutcome> {
        let mut current = self.with_current_values(entity, updated_data).await?;
        let changed = changed_attributes(&current, updated_data);
        if changed.is_empty() && change_type == ChangeType::Update {
            return Ok(UpdateOutcome {
                entity: current,
                derived: AttributeMap::new(),
                distribution: Distribution::default(),
            });
        }

        let derived = self
            .process_transforms(&current, updated_data, source_node, change_type)
            .await?;

        let mut writes: AttributeMap = changed
            .iter()
            .filter_map(|code| updated_data.get(code).map(|v| (code.clone(), v.clone())))
            .collect();
        writes.extend(derived.clone());
        if !writes.is_empty() {
            self.entities.update_entity(entity.id, &writes).await?;
            current.data.extend(writes);
        }

        let mut attributes = changed;
        for code in derived.keys() {
            if !attributes.contains(code) {
                attributes.push(code.clone());
            }
        }

        let distribution = self
            .distribute_update(&current, &attributes, source_node, change_type)
            .await?;

        Ok(UpdateOutcome {
            entity: current,
            derived,
            distribution,
        })
    }

    // ========================================================================
    // Filters
    // ========================================================================

    /// `entity`, or a copy of it with the `needed` attributes loaded from the store
    async fn loaded_for<'a>(&self, entity: &'a Entity, needed: &[String]) -> SyncResult<Cow<'a, Entity>> {
        if needed.iter().all(|code| entity.has_attribute(code)) {
            return Ok(Cow::Borrowed(entity));
        }
        let mut loaded = entity.clone();
        self.entities.enhance_entity(&mut loaded, needed).await?;
        Ok(Cow::Owned(loaded))
    }

    /// All enabled filters on `edge` pass (stops at the first veto)
    ///
    /// Attributes a filter depends on are loaded when `entity` lacks them, so callers
    /// may pass a partially loaded entity.
    pub async fn check_filters_edge(
        &self,
        entity: &Entity,
        edge: &RouterEdge,
        changed: &[String],
        change_type: ChangeType,
    ) -> SyncResult<bool> {
        for row in self.repo.filters_for_edge(edge.id).await? {
            let mut filter = self.filters.create(&row.filter_type)?;
            let needed = filter.required_attributes(&row.config);
            let subject = self.loaded_for(entity, &needed).await?;
            filter.init(&subject, change_type, &row.config)?;
            if !filter.check_edge(edge.node_from, edge.node_to, changed) {
                tracing::debug!("🚫 Filter {} ({}) blocked edge {}", row.id, row.filter_type, edge.id);
                return Ok(false);
            }
        }
        Ok(true)
    }

    /// All enabled filters on `transform` pass (stops at the first veto)
    pub async fn check_filters_transform(
        &self,
        entity: &Entity,
        transform: &RouterTransform,
        changed: &[String],
        change_type: ChangeType,
    ) -> SyncResult<bool> {
        for row in self.repo.filters_for_transform(transform.id).await? {
            let mut filter = self.filters.create(&row.filter_type)?;
            let needed = filter.required_attributes(&row.config);
            let subject = self.loaded_for(entity, &needed).await?;
            filter.init(&subject, change_type, &row.config)?;
            if !filter.check_transform(
                &transform.src_attribute,
                transform.dest_attribute.as_deref(),
                changed,
            ) {
                tracing::debug!(
                    "🚫 Filter {} ({}) blocked transform {}",
                    row.id,
                    row.filter_type,
                    transform.id
                );
                return Ok(false);
            }
        }
        Ok(true)
    }
}

//! Attribute subscription cache
//!
//! Lock-free map from (node, entity type, update-only) to the attribute codes the
//! node is subscribed to. Reads load the current map; writes swap in a new one with
//! ArcSwap's read-copy-update. Invalidation is scoped to one (node, entity type) pair
//! plus the node's cross-type entries, which contain that type's codes too.

use arc_swap::ArcSwap;
use std::{collections::HashMap, sync::Arc};

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey {
    pub node_id: i64,
    /// `None` caches the node's subscriptions across all entity types
    pub entity_type: Option<String>,
    pub update_only: bool,
}

impl CacheKey {
    pub fn new(node_id: i64, entity_type: Option<&str>, update_only: bool) -> Self {
        Self {
            node_id,
            entity_type: entity_type.map(str::to_string),
            update_only,
        }
    }
}

#[derive(Debug, Default)]
pub struct SubscriptionCache {
    entries: ArcSwap<HashMap<CacheKey, Arc<Vec<String>>>>,
}

impl SubscriptionCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &CacheKey) -> Option<Arc<Vec<String>>> {
        self.entries.load().get(key).cloned()
    }

    pub fn insert(&self, key: CacheKey, codes: Vec<String>) -> Arc<Vec<String>> {
        let codes = Arc::new(codes);
        self.entries.rcu(|current| {
            let mut next = HashMap::clone(current);
            next.insert(key.clone(), Arc::clone(&codes));
            next
        });
        codes
    }

    /// Drop cached lists affected by a subscription change on (node, entity type)
    pub fn invalidate(&self, node_id: i64, entity_type: &str) {
        self.entries.rcu(|current| {
            let mut next = HashMap::clone(current);
            next.retain(|key, _| {
                key.node_id != node_id
                    || key
                        .entity_type
                        .as_deref()
                        .is_some_and(|cached| cached != entity_type)
            });
            next
        });
        tracing::debug!("🧹 Invalidated subscription cache for node {} / {}", node_id, entity_type);
    }

    pub fn clear(&self) {
        self.entries.store(Arc::new(HashMap::new()));
    }

    pub fn len(&self) -> usize {
        self.entries.load().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn codes(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_invalidation_is_scoped() {
        let cache = SubscriptionCache::new();
        cache.insert(CacheKey::new(1, Some("product"), false), codes(&["price"]));
        cache.insert(CacheKey::new(1, Some("order"), false), codes(&["status"]));
        cache.insert(CacheKey::new(1, None, false), codes(&["price", "status"]));
        cache.insert(CacheKey::new(2, Some("product"), false), codes(&["price"]));

        cache.invalidate(1, "product");

        assert!(cache.get(&CacheKey::new(1, Some("product"), false)).is_none());
        assert!(cache.get(&CacheKey::new(1, None, false)).is_none());
        assert!(cache.get(&CacheKey::new(1, Some("order"), false)).is_some());
        assert!(cache.get(&CacheKey::new(2, Some("product"), false)).is_some());
        assert_eq!(cache.len(), 2);
    }
}

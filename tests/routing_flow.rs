//! Entity change routed from one node to another, consumed by the receiving node

use magelink::{
    logging::LogService,
    node::{NodeService, SubscriptionCache},
    router::{FilterRegistry, NewEdge, NewTransform, RouterRepository, RouterService, TransformRegistry},
    store::{AttributeMap, Database, EntityStore, RetryPolicy, SqliteEntityStore},
    ChangeType,
};
use serde_json::json;
use sqlx::Row;
use std::{collections::HashMap, sync::Arc};

struct Harness {
    db: Database,
    entities: Arc<dyn EntityStore>,
    nodes: NodeService,
    router: RouterService,
}

async fn harness() -> Harness {
    let db = Database::in_memory().await.unwrap();
    let pool = db.pool().clone();
    let entities: Arc<dyn EntityStore> = Arc::new(SqliteEntityStore::new(pool.clone()));
    let retry = RetryPolicy::new(3, 1);
    let nodes = NodeService::new(
        pool.clone(),
        entities.clone(),
        Arc::new(SubscriptionCache::new()),
        retry,
    );
    let router = RouterService::new(
        RouterRepository::new(pool.clone()),
        entities.clone(),
        TransformRegistry::with_builtin(),
        FilterRegistry::with_builtin(),
        LogService::new(pool, &[]),
        retry,
    );
    Harness {
        db,
        entities,
        nodes,
        router,
    }
}

fn attrs(value: serde_json::Value) -> AttributeMap {
    serde_json::from_value(value).unwrap()
}

#[tokio::test]
async fn price_change_reaches_subscribed_node() {
    let h = harness().await;
    let node_a = h.nodes.create_node("http_push", "ERP", &HashMap::new()).await.unwrap();
    let node_b = h.nodes.create_node("http_push", "Shop", &HashMap::new()).await.unwrap();

    // Product 42 created by node A
    sqlx::query("INSERT INTO entity (id, entity_type, unique_id, node_id, updated_at) VALUES (42, 'product', 'SKU-42', ?, 0)")
        .bind(node_a.id)
        .execute(h.db.pool())
        .await
        .unwrap();
    h.entities.update_entity(42, &attrs(json!({"price": 10}))).await.unwrap();
    let product = h.entities.load_entity(42).await.unwrap().unwrap();

    let repo = h.router.repository();
    repo.add_transform(&NewTransform::new("product", "price", "list_price", "copy"))
        .await
        .unwrap();
    repo.add_edge(&NewEdge {
        node_from: node_a.id,
        node_to: node_b.id,
        entity_type: "product".to_string(),
        change_type: ChangeType::Update,
    })
    .await
    .unwrap();

    let incoming = attrs(json!({"price": 19.99}));
    let derived = h
        .router
        .process_transforms(&product, &incoming, node_a.id, ChangeType::Update)
        .await
        .unwrap();
    assert_eq!(derived, attrs(json!({"list_price": 19.99})));

    let distribution = h
        .router
        .distribute_update(
            &product,
            &["price".to_string(), "list_price".to_string()],
            node_a.id,
            ChangeType::Update,
        )
        .await
        .unwrap();
    assert_eq!(distribution.affected_nodes, vec![node_b.id]);

    let log = sqlx::query("SELECT source_node, affected_nodes, affected_attributes, type FROM entity_update_log")
        .fetch_all(h.db.pool())
        .await
        .unwrap();
    assert_eq!(log.len(), 1);
    assert_eq!(log[0].get::<i64, _>("source_node"), node_a.id);
    assert_eq!(log[0].get::<String, _>("affected_nodes"), node_b.id.to_string());
    assert_eq!(log[0].get::<String, _>("affected_attributes"), "price,list_price");
    assert_eq!(log[0].get::<String, _>("type"), "update");

    let updates = sqlx::query("SELECT node_id, complete FROM entity_update")
        .fetch_all(h.db.pool())
        .await
        .unwrap();
    assert_eq!(updates.len(), 1);
    assert_eq!(updates[0].get::<i64, _>("node_id"), node_b.id);
    assert_eq!(updates[0].get::<i64, _>("complete"), 0);

    let pending = h.nodes.get_pending_updates(node_b.id).await.unwrap();
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].log.entity_id, 42);
    assert_eq!(pending[0].entity.as_ref().map(|e| e.id), Some(42));
    assert!(h.nodes.get_pending_updates(node_a.id).await.unwrap().is_empty());

    // Consuming the update empties the queue; marking twice is harmless
    let log_id = pending[0].log.id;
    h.nodes.set_update_status(node_b.id, log_id, true).await.unwrap();
    h.nodes.set_update_status(node_b.id, log_id, true).await.unwrap();
    assert!(h.nodes.get_pending_updates(node_b.id).await.unwrap().is_empty());
}

#[tokio::test]
async fn full_pipeline_writes_back_derived_values() {
    let h = harness().await;
    let erp = h.nodes.create_node("http_push", "ERP", &HashMap::new()).await.unwrap();
    let shop = h.nodes.create_node("http_push", "Shop", &HashMap::new()).await.unwrap();
    let warehouse = h.nodes.create_node("http_push", "Warehouse", &HashMap::new()).await.unwrap();

    let customer = h
        .entities
        .create_entity("customer", Some("C-1"), Some(erp.id), &attrs(json!({"email": "c@example.com"})))
        .await
        .unwrap();
    let order = h
        .entities
        .create_entity("order", Some("O-1"), Some(erp.id), &attrs(json!({"status": "new"})))
        .await
        .unwrap();

    let repo = h.router.repository();
    repo.add_transform(
        &NewTransform::new("order", "customer", "customer_email", "denormalize")
            .with_config("foreign_type", json!("customer"))
            .with_config("foreign_attribute", json!("email")),
    )
    .await
    .unwrap();
    for target in [shop.id, warehouse.id] {
        repo.add_edge(&NewEdge {
            node_from: erp.id,
            node_to: target,
            entity_type: "order".to_string(),
            change_type: ChangeType::Update,
        })
        .await
        .unwrap();
    }

    let outcome = h
        .router
        .update_entity(&order, &attrs(json!({"customer": customer.id})), erp.id, ChangeType::Update)
        .await
        .unwrap();

    assert_eq!(outcome.derived, attrs(json!({"customer_email": "c@example.com"})));
    assert_eq!(outcome.distribution.affected_nodes, vec![shop.id, warehouse.id]);

    let stored = h.entities.load_entity(order.id).await.unwrap().unwrap();
    assert_eq!(stored.get("customer_email"), Some(&json!("c@example.com")));
    assert_eq!(h.nodes.get_pending_updates(warehouse.id).await.unwrap().len(), 1);
}

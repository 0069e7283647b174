//! Entity store
//!
//! The canonical attribute-value store for business entities. The router, node
//! service and transforms only talk to it through the `EntityStore` trait; the SQLite
//! implementation keeps one row per entity plus one JSON value per attribute.

use crate::error::{SyncError, SyncResult};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sqlx::{sqlite::SqlitePool, Row};
use std::collections::BTreeMap;

/// Attribute code -> value
pub type AttributeMap = BTreeMap<String, Value>;

/// A canonical business object (order, product, customer, stock item)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Entity {
    pub id: i64,
    pub entity_type: String,
    /// Natural key shared with external systems (SKU, order number, ...)
    pub unique_id: Option<String>,
    /// Node that created the entity
    pub node_id: Option<i64>,
    pub updated_at: i64,
    /// Loaded attribute values; attributes not loaded are simply absent
    pub data: AttributeMap,
}

impl Entity {
    pub fn get(&self, code: &str) -> Option<&Value> {
        self.data.get(code)
    }

    pub fn has_attribute(&self, code: &str) -> bool {
        self.data.contains_key(code)
    }

    /// Interpret an attribute as a reference to another entity id
    pub fn reference(&self, code: &str) -> Option<i64> {
        match self.data.get(code)? {
            Value::Number(n) => n.as_i64(),
            Value::String(s) => s.trim().parse().ok(),
            _ => None,
        }
    }
}

#[async_trait]
pub trait EntityStore: Send + Sync {
    async fn load_entity(&self, id: i64) -> SyncResult<Option<Entity>>;

    async fn locate_entity(&self, entity_type: &str, unique_id: &str) -> SyncResult<Option<Entity>>;

    async fn create_entity(
        &self,
        entity_type: &str,
        unique_id: Option<&str>,
        node_id: Option<i64>,
        data: &AttributeMap,
    ) -> SyncResult<Entity>;

    /// Write attribute values without routing them anywhere
    async fn update_entity(&self, entity_id: i64, data: &AttributeMap) -> SyncResult<()>;

    /// Make sure the listed attributes are loaded on `entity`
    async fn enhance_entity(&self, entity: &mut Entity, attributes: &[String]) -> SyncResult<()>;

    async fn list_attributes(&self, entity_type: Option<&str>) -> SyncResult<Vec<String>>;

    async fn define_attribute(&self, entity_type: &str, code: &str) -> SyncResult<()>;

    /// Follow a reference attribute to the entity it points at
    ///
    /// Returns `None` when the attribute is empty or the target does not exist. A
    /// target of the wrong type is a configuration error.
    async fn resolve(
        &self,
        entity: &Entity,
        code: &str,
        foreign_type: &str,
    ) -> SyncResult<Option<Entity>> {
        let Some(foreign_id) = entity.reference(code) else {
            return Ok(None);
        };
        match self.load_entity(foreign_id).await? {
            Some(foreign) if foreign.entity_type == foreign_type => Ok(Some(foreign)),
            Some(foreign) => Err(SyncError::config(format!(
                "Attribute '{}' of entity {} references {} {} (expected {})",
                code, entity.id, foreign.entity_type, foreign.id, foreign_type
            ))),
            None => Ok(None),
        }
    }
}

/// SQLite-backed entity store
#[derive(Debug, Clone)]
pub struct SqliteEntityStore {
    pool: SqlitePool,
}

impl SqliteEntityStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    async fn load_values(&self, entity_id: i64, only: Option<&[String]>) -> SyncResult<AttributeMap> {
        let rows = sqlx::query("SELECT attribute, value FROM entity_value WHERE entity_id = ?")
            .bind(entity_id)
            .fetch_all(&self.pool)
            .await?;

        let mut data = AttributeMap::new();
        for row in rows {
            let code: String = row.get("attribute");
            if let Some(only) = only {
                if !only.iter().any(|c| c == &code) {
                    continue;
                }
            }
            let raw: String = row.get("value");
            data.insert(code, serde_json::from_str(&raw)?);
        }
        Ok(data)
    }

    async fn entity_from_row(&self, row: sqlx::sqlite::SqliteRow) -> SyncResult<Entity> {
        let id: i64 = row.get("id");
        Ok(Entity {
            id,
            entity_type: row.get("entity_type"),
            unique_id: row.get("unique_id"),
            node_id: row.get("node_id"),
            updated_at: row.get("updated_at"),
            data: self.load_values(id, None).await?,
        })
    }
}

#[async_trait]
impl EntityStore for SqliteEntityStore {
    async fn load_entity(&self, id: i64) -> SyncResult<Option<Entity>> {
        let row = sqlx::query(
            "SELECT id, entity_type, unique_id, node_id, updated_at FROM entity WHERE id = ?",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some(row) => Ok(Some(self.entity_from_row(row).await?)),
            None => Ok(None),
        }
    }

    async fn locate_entity(&self, entity_type: &str, unique_id: &str) -> SyncResult<Option<Entity>> {
        let row = sqlx::query(
            r#"
            SELECT id, entity_type, unique_id, node_id, updated_at
            FROM entity WHERE entity_type = ? AND unique_id = ?
            "#,
        )
        .bind(entity_type)
        .bind(unique_id)
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some(row) => Ok(Some(self.entity_from_row(row).await?)),
            None => Ok(None),
        }
    }

    async fn create_entity(
        &self,
        entity_type: &str,
        unique_id: Option<&str>,
        node_id: Option<i64>,
        data: &AttributeMap,
    ) -> SyncResult<Entity> {
        let now = chrono::Utc::now().timestamp();
        let result = sqlx::query(
            "INSERT INTO entity (entity_type, unique_id, node_id, updated_at) VALUES (?, ?, ?, ?)",
        )
        .bind(entity_type)
        .bind(unique_id)
        .bind(node_id)
        .bind(now)
        .execute(&self.pool)
        .await?;

        let id = result.last_insert_rowid();
        self.update_entity(id, data).await?;

        tracing::debug!("➕ Created {} entity {}", entity_type, id);

        Ok(Entity {
            id,
            entity_type: entity_type.to_string(),
            unique_id: unique_id.map(str::to_string),
            node_id,
            updated_at: now,
            data: data.clone(),
        })
    }

    async fn update_entity(&self, entity_id: i64, data: &AttributeMap) -> SyncResult<()> {
        for (code, value) in data {
            sqlx::query(
                r#"
                INSERT INTO entity_value (entity_id, attribute, value)
                VALUES (?, ?, ?)
                ON CONFLICT(entity_id, attribute) DO UPDATE SET value = excluded.value
                "#,
            )
            .bind(entity_id)
            .bind(code)
            .bind(value.to_string())
            .execute(&self.pool)
            .await?;
        }

        sqlx::query("UPDATE entity SET updated_at = ? WHERE id = ?")
            .bind(chrono::Utc::now().timestamp())
            .bind(entity_id)
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    async fn enhance_entity(&self, entity: &mut Entity, attributes: &[String]) -> SyncResult<()> {
        let missing: Vec<String> = attributes
            .iter()
            .filter(|code| !entity.has_attribute(code))
            .cloned()
            .collect();
        if missing.is_empty() {
            return Ok(());
        }

        let loaded = self.load_values(entity.id, Some(&missing)).await?;
        entity.data.extend(loaded);
        Ok(())
    }

    async fn list_attributes(&self, entity_type: Option<&str>) -> SyncResult<Vec<String>> {
        let rows = match entity_type {
            Some(entity_type) => {
                sqlx::query("SELECT code FROM attribute WHERE entity_type = ? ORDER BY code")
                    .bind(entity_type)
                    .fetch_all(&self.pool)
                    .await?
            }
            None => {
                sqlx::query("SELECT DISTINCT code FROM attribute ORDER BY code")
                    .fetch_all(&self.pool)
                    .await?
            }
        };
        Ok(rows.iter().map(|row| row.get("code")).collect())
    }

    async fn define_attribute(&self, entity_type: &str, code: &str) -> SyncResult<()> {
        sqlx::query("INSERT OR IGNORE INTO attribute (entity_type, code) VALUES (?, ?)")
            .bind(entity_type)
            .bind(code)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::Database;
    use serde_json::json;

    fn attrs(pairs: &[(&str, Value)]) -> AttributeMap {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect()
    }

    #[tokio::test]
    async fn test_create_locate_and_update() {
        let db = Database::in_memory().await.unwrap();
        let store = SqliteEntityStore::new(db.pool().clone());

        let created = store
            .create_entity("product", Some("SKU-1"), Some(1), &attrs(&[("price", json!(10.5))]))
            .await
            .unwrap();

        store
            .update_entity(created.id, &attrs(&[("price", json!(12)), ("name", json!("Mug"))]))
            .await
            .unwrap();

        let found = store.locate_entity("product", "SKU-1").await.unwrap().unwrap();
        assert_eq!(found.id, created.id);
        assert_eq!(found.get("price"), Some(&json!(12)));
        assert_eq!(found.get("name"), Some(&json!("Mug")));
        assert!(store.locate_entity("product", "SKU-2").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_resolve_reference() {
        let db = Database::in_memory().await.unwrap();
        let store = SqliteEntityStore::new(db.pool().clone());

        let customer = store
            .create_entity("customer", Some("C1"), None, &attrs(&[("email", json!("a@b.c"))]))
            .await
            .unwrap();
        let order = store
            .create_entity("order", Some("O1"), None, &attrs(&[("customer", json!(customer.id))]))
            .await
            .unwrap();

        let resolved = store.resolve(&order, "customer", "customer").await.unwrap();
        assert_eq!(resolved.map(|c| c.id), Some(customer.id));

        assert!(store.resolve(&order, "missing", "customer").await.unwrap().is_none());
        assert!(store.resolve(&order, "customer", "product").await.is_err());
    }

    #[tokio::test]
    async fn test_enhance_loads_only_missing() {
        let db = Database::in_memory().await.unwrap();
        let store = SqliteEntityStore::new(db.pool().clone());

        let created = store
            .create_entity("product", None, None, &attrs(&[("a", json!(1)), ("b", json!(2))]))
            .await
            .unwrap();

        let mut partial = Entity {
            data: attrs(&[("a", json!(100))]),
            ..created
        };
        store
            .enhance_entity(&mut partial, &["a".to_string(), "b".to_string()])
            .await
            .unwrap();

        assert_eq!(partial.get("a"), Some(&json!(100)));
        assert_eq!(partial.get("b"), Some(&json!(2)));
    }
}

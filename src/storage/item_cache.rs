use anyhow::Result;
use std::sync::Arc;
use tokio::task::JoinHandle;

use super::schema::Database;
use super::types::CachedCategory;
use crate::feed::{CategoryKey, Item};

impl Database {
    // ========================================================================
    // Category Cache Operations
    // ========================================================================

    /// Store the item list for a category, replacing any previous entry.
    pub async fn store_category_items(&self, category: &str, items: &[Item]) -> Result<()> {
        let items_json = serde_json::to_string(items)?;

        sqlx::query(
            r#"
            INSERT INTO category_cache (category, items_json, item_count, saved_at)
            VALUES (?, ?, ?, datetime('now'))
            ON CONFLICT(category) DO UPDATE SET
                items_json = excluded.items_json,
                item_count = excluded.item_count,
                saved_at = excluded.saved_at
        "#,
        )
        .bind(category)
        .bind(&items_json)
        .bind(items.len() as i64)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Fetch the raw cache row for a category, if one exists.
    pub async fn get_category_items(&self, category: &str) -> Result<Option<CachedCategory>> {
        let row: Option<CachedCategory> = sqlx::query_as(
            r#"
            SELECT category, items_json, item_count, saved_at
            FROM category_cache
            WHERE category = ?
        "#,
        )
        .bind(category)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row)
    }

    /// Categories that currently have a cache entry, ordered by key.
    pub async fn cached_categories(&self) -> Result<Vec<(String, i64)>> {
        let rows: Vec<(String, i64)> =
            sqlx::query_as("SELECT category, item_count FROM category_cache ORDER BY category")
                .fetch_all(&self.pool)
                .await?;

        Ok(rows)
    }
}

/// Best-effort persistence of the last merged list per category.
///
/// Never authoritative and never fails: read errors and undecodable rows are
/// cache misses, write errors are logged and dropped.
#[derive(Clone)]
pub struct DiskCache {
    db: Option<Database>,
}

impl DiskCache {
    pub fn new(db: Database) -> Self {
        Self { db: Some(db) }
    }

    /// A cache that stores nothing and always misses.
    pub fn disabled() -> Self {
        Self { db: None }
    }

    /// Cached items for `category`, or an empty list on miss or error.
    pub async fn load(&self, category: &CategoryKey) -> Vec<Item> {
        let Some(db) = &self.db else {
            return Vec::new();
        };

        let row = match db.get_category_items(category.as_str()).await {
            Ok(Some(row)) => row,
            Ok(None) => return Vec::new(),
            Err(e) => {
                tracing::warn!(category = %category, error = %e, "Disk cache read failed, treating as miss");
                return Vec::new();
            }
        };

        match serde_json::from_str::<Vec<Item>>(&row.items_json) {
            Ok(items) => {
                tracing::debug!(
                    category = %category,
                    items = items.len(),
                    saved_at = %row.saved_at,
                    "Loaded items from disk cache"
                );
                items
            }
            Err(e) => {
                tracing::warn!(category = %category, error = %e, "Corrupt disk cache entry, treating as miss");
                Vec::new()
            }
        }
    }

    /// Writes `items` in the background.
    ///
    /// Returns the spawned task so an owner can wait for it on shutdown;
    /// `None` when the cache is disabled.
    pub fn save(&self, category: &CategoryKey, items: Arc<Vec<Item>>) -> Option<JoinHandle<()>> {
        let db = self.db.clone()?;
        let category = category.clone();

        Some(tokio::spawn(async move {
            match db.store_category_items(category.as_str(), &items).await {
                Ok(()) => {
                    tracing::debug!(category = %category, items = items.len(), "Saved items to disk cache");
                }
                Err(e) => {
                    tracing::warn!(category = %category, error = %e, "Disk cache write failed");
                }
            }
        }))
    }
}

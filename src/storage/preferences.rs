use anyhow::Result;

use super::schema::Database;

/// Preference key holding the last category the user had open.
pub const ACTIVE_CATEGORY_KEY: &str = "session.active_category";

impl Database {
    // ========================================================================
    // User Preferences Operations
    // ========================================================================

    /// Get a single preference value by key.
    ///
    /// Keys use dotted convention: `session.active_category`, `view.sort`, etc.
    pub async fn get_preference(&self, key: &str) -> Result<Option<String>> {
        let row: Option<(String,)> =
            sqlx::query_as("SELECT value FROM user_preferences WHERE key = ?")
                .bind(key)
                .fetch_optional(&self.pool)
                .await?;

        Ok(row.map(|(value,)| value))
    }

    /// Set a preference value (UPSERT).
    pub async fn set_preference(&self, key: &str, value: &str) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO user_preferences (key, value, updated_at)
            VALUES (?, ?, datetime('now'))
            ON CONFLICT(key) DO UPDATE SET value = excluded.value, updated_at = excluded.updated_at
        "#,
        )
        .bind(key)
        .bind(value)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// The category restored at startup, if one was saved.
    pub async fn active_category(&self) -> Result<Option<String>> {
        self.get_preference(ACTIVE_CATEGORY_KEY).await
    }

    pub async fn set_active_category(&self, category: &str) -> Result<()> {
        self.set_preference(ACTIVE_CATEGORY_KEY, category).await
    }
}

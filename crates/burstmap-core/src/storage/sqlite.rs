// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! SQLite-backed storage implementation.

use std::path::Path;

use async_trait::async_trait;
use sqlx::SqlitePool;
use sqlx::sqlite::SqlitePoolOptions;

use super::{Result, Storage, StorageError};

static MIGRATOR: sqlx::migrate::Migrator = sqlx::migrate!("./migrations/sqlite");

/// SQLite-backed object storage.
#[derive(Clone)]
pub struct SqliteStorage {
    pool: SqlitePool,
}

impl SqliteStorage {
    /// Create a storage from an existing, already migrated pool.
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Open (creating if needed) the database at `path` and run migrations.
    ///
    /// ```ignore
    /// let storage = SqliteStorage::from_path(".data/burstmap.db").await?;
    /// ```
    pub async fn from_path(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();

        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent)?;
        }

        let url = format!("sqlite:{}?mode=rwc", path.to_string_lossy());
        Self::connect(&url, 5).await
    }

    /// Open a private in-memory database.
    pub async fn in_memory() -> Result<Self> {
        // A single connection, otherwise every pooled connection gets its own database
        Self::connect("sqlite::memory:", 1).await
    }

    async fn connect(url: &str, max_connections: u32) -> Result<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect(url)
            .await?;

        MIGRATOR
            .run(&pool)
            .await
            .map_err(|e| StorageError::Migration(e.to_string()))?;

        Ok(Self { pool })
    }

    /// The underlying pool.
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

#[async_trait]
impl Storage for SqliteStorage {
    async fn put(&self, key: &str, body: Vec<u8>) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO objects (key, body, created_at)
            VALUES (?, ?, CURRENT_TIMESTAMP)
            ON CONFLICT(key) DO UPDATE SET body = excluded.body
            "#,
        )
        .bind(key)
        .bind(body)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let body: Option<(Vec<u8>,)> = sqlx::query_as("SELECT body FROM objects WHERE key = ?")
            .bind(key)
            .fetch_optional(&self.pool)
            .await?;

        Ok(body.map(|(b,)| b))
    }

    async fn delete(&self, key: &str) -> Result<()> {
        sqlx::query("DELETE FROM objects WHERE key = ?")
            .bind(key)
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    async fn list_keys(&self, prefix: &str) -> Result<Vec<String>> {
        // substr() instead of LIKE so '%' and '_' in keys match literally
        let rows: Vec<(String,)> = sqlx::query_as(
            r#"
            SELECT key FROM objects
            WHERE substr(key, 1, length(?)) = ?
            ORDER BY key
            "#,
        )
        .bind(prefix)
        .bind(prefix)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.into_iter().map(|(k,)| k).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_sqlite_put_overwrites() {
        let storage = SqliteStorage::in_memory().await.unwrap();
        storage.put("k", b"one".to_vec()).await.unwrap();
        storage.put("k", b"two".to_vec()).await.unwrap();

        assert_eq!(storage.get("k").await.unwrap(), Some(b"two".to_vec()));
    }

    #[tokio::test]
    async fn test_sqlite_prefix_is_literal() {
        let storage = SqliteStorage::in_memory().await.unwrap();
        storage.put("a_b/1", Vec::new()).await.unwrap();
        storage.put("axb/1", Vec::new()).await.unwrap();
        storage.put("a_b/2", Vec::new()).await.unwrap();

        let keys = storage.list_keys("a_b/").await.unwrap();
        assert_eq!(keys, vec!["a_b/1", "a_b/2"]);
    }

    #[tokio::test]
    async fn test_sqlite_from_path_creates_parent_dirs() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("objects.db");

        let storage = SqliteStorage::from_path(&path).await.unwrap();
        storage.put("x", b"1".to_vec()).await.unwrap();
        storage.delete("x").await.unwrap();

        assert!(path.exists());
        assert_eq!(storage.get("x").await.unwrap(), None);
    }
}

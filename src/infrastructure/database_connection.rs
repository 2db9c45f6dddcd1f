//! SQLite pool and schema for the product store

use anyhow::{Context, Result};
use sqlx::{SqlitePool, sqlite::SqlitePoolOptions};
use std::path::Path;

use crate::infrastructure::config::ConfigManager;

/// Statements applied by [`DatabaseConnection::migrate`], all idempotent.
/// `url` is the product key, `(page_id, index_in_page)` the oldest-anchored slot.
const SCHEMA: &[(&str, &str)] = &[
    (
        "products table",
        r"
        CREATE TABLE IF NOT EXISTS products (
            url            TEXT PRIMARY KEY,
            manufacturer   TEXT,
            model          TEXT,
            certificate_id TEXT,
            page_id        INTEGER NOT NULL,
            index_in_page  INTEGER NOT NULL,
            created_at     DATETIME NOT NULL DEFAULT CURRENT_TIMESTAMP,
            updated_at     DATETIME NOT NULL DEFAULT CURRENT_TIMESTAMP
        )",
    ),
    (
        "slot index",
        "CREATE INDEX IF NOT EXISTS idx_products_page_slot ON products (page_id, index_in_page)",
    ),
];

pub struct DatabaseConnection {
    pool: SqlitePool,
}

impl DatabaseConnection {
    /// Opens `database_url`, creating the file and its directory when missing.
    pub async fn new(database_url: &str) -> Result<Self> {
        let in_memory = database_url.contains(":memory:");
        if !in_memory {
            ensure_database_file(database_url).await?;
        }

        // :memory: 는 연결마다 서로 다른 DB 가 생기므로 풀을 1개로 고정
        let pool = SqlitePoolOptions::new()
            .max_connections(if in_memory { 1 } else { 10 })
            .connect(database_url)
            .await
            .with_context(|| format!("Could not open {database_url}"))?;
        Ok(Self { pool })
    }

    /// `sqlite:<data dir>/database/matter_certis.db`
    pub fn default_database_url() -> Result<String> {
        let file = ConfigManager::get_app_data_dir()?
            .join("database")
            .join("matter_certis.db");
        Ok(format!("sqlite:{}", file.display()))
    }

    pub const fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub async fn migrate(&self) -> Result<()> {
        for &(what, sql) in SCHEMA {
            sqlx::query(sql)
                .execute(&self.pool)
                .await
                .with_context(|| format!("Schema step '{what}' failed"))?;
        }
        Ok(())
    }
}

async fn ensure_database_file(database_url: &str) -> Result<()> {
    let path = database_url
        .trim_start_matches("sqlite://")
        .trim_start_matches("sqlite:");
    let path = Path::new(path.split('?').next().unwrap_or(path));

    if let Some(dir) = path.parent().filter(|dir| !dir.as_os_str().is_empty()) {
        tokio::fs::create_dir_all(dir)
            .await
            .with_context(|| format!("Could not create {}", dir.display()))?;
    }
    if !path.exists() {
        tokio::fs::File::create(path)
            .await
            .with_context(|| format!("Could not create {}", path.display()))?;
    }
    Ok(())
}

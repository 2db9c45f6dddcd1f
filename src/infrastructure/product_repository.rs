//! SQLite implementation of `ProductStore`

use async_trait::async_trait;
use sqlx::{Row, SqlitePool};
use std::collections::HashSet;
use tracing::{debug, warn};

use crate::domain::{ProductRecord, ProductStore, StoreError, StoredAddress, UpsertSummary};

fn backend(error: sqlx::Error) -> StoreError {
    StoreError::Backend(error.to_string())
}

#[derive(Clone)]
pub struct SqliteProductRepository {
    pool: SqlitePool,
}

impl SqliteProductRepository {
    pub const fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Records of one local page ordered by slot
    pub async fn find_by_page(&self, page_id: u32) -> Result<Vec<StoredAddress>, StoreError> {
        let rows = sqlx::query(
            "SELECT url, page_id, index_in_page FROM products WHERE page_id = ? ORDER BY index_in_page",
        )
        .bind(i64::from(page_id))
        .fetch_all(&self.pool)
        .await
        .map_err(backend)?;

        rows.iter().map(address_from_row).collect()
    }

    /// Returns true when a row was removed
    pub async fn delete_by_url(&self, url: &str) -> Result<bool, StoreError> {
        let result = sqlx::query("DELETE FROM products WHERE url = ?")
            .bind(url)
            .execute(&self.pool)
            .await
            .map_err(backend)?;
        if result.rows_affected() > 0 {
            debug!("🗑️ Deleted product {}", url);
        }
        Ok(result.rows_affected() > 0)
    }
}

fn address_from_row(row: &sqlx::sqlite::SqliteRow) -> Result<StoredAddress, StoreError> {
    let page_id: i64 = row.try_get("page_id").map_err(backend)?;
    let index_in_page: i64 = row.try_get("index_in_page").map_err(backend)?;
    Ok(StoredAddress {
        url: row.try_get("url").map_err(backend)?,
        page_id: u32::try_from(page_id)
            .map_err(|_| StoreError::InvalidRecord(format!("negative page_id {page_id}")))?,
        index_in_page: u32::try_from(index_in_page).map_err(|_| {
            StoreError::InvalidRecord(format!("negative index_in_page {index_in_page}"))
        })?,
    })
}

#[async_trait]
impl ProductStore for SqliteProductRepository {
    async fn existing_urls(&self) -> Result<HashSet<String>, StoreError> {
        let rows = sqlx::query("SELECT url FROM products")
            .fetch_all(&self.pool)
            .await
            .map_err(backend)?;
        rows.iter()
            .map(|row| row.try_get::<String, _>("url").map_err(backend))
            .collect()
    }

    async fn upsert(&self, records: &[ProductRecord]) -> Result<UpsertSummary, StoreError> {
        let mut summary = UpsertSummary::default();
        let mut tx = self.pool.begin().await.map_err(backend)?;

        for record in records {
            let existing = sqlx::query(
                "SELECT manufacturer, model, certificate_id, page_id, index_in_page FROM products WHERE url = ?",
            )
            .bind(&record.url)
            .fetch_optional(&mut *tx)
            .await
            .map_err(backend)?;

            let unchanged = existing.as_ref().is_some_and(|row| {
                row.try_get::<Option<String>, _>("manufacturer").ok().flatten() == record.manufacturer
                    && row.try_get::<Option<String>, _>("model").ok().flatten() == record.model
                    && row.try_get::<Option<String>, _>("certificate_id").ok().flatten()
                        == record.certificate_id
                    && row.try_get::<i64, _>("page_id").ok() == Some(i64::from(record.page_id))
                    && row.try_get::<i64, _>("index_in_page").ok()
                        == Some(i64::from(record.index_in_page))
            });
            if unchanged {
                summary.unchanged += 1;
                continue;
            }

            let result = sqlx::query(
                r"
                INSERT INTO products
                    (url, manufacturer, model, certificate_id, page_id, index_in_page, created_at, updated_at)
                VALUES (?, ?, ?, ?, ?, ?, ?, ?)
                ON CONFLICT(url) DO UPDATE SET
                    manufacturer = excluded.manufacturer,
                    model = excluded.model,
                    certificate_id = excluded.certificate_id,
                    page_id = excluded.page_id,
                    index_in_page = excluded.index_in_page,
                    updated_at = excluded.updated_at
                ",
            )
            .bind(&record.url)
            .bind(&record.manufacturer)
            .bind(&record.model)
            .bind(&record.certificate_id)
            .bind(i64::from(record.page_id))
            .bind(i64::from(record.index_in_page))
            .bind(record.crawled_at)
            .bind(record.crawled_at)
            .execute(&mut *tx)
            .await;

            match result {
                Ok(_) if existing.is_some() => summary.updated += 1,
                Ok(_) => summary.added += 1,
                Err(e) => {
                    warn!("⚠️ Failed to upsert {}: {}", record.url, e);
                    summary.failed += 1;
                }
            }
        }

        tx.commit().await.map_err(backend)?;
        debug!(
            "💾 Upsert: {} added, {} updated, {} unchanged, {} failed",
            summary.added, summary.updated, summary.unchanged, summary.failed
        );
        Ok(summary)
    }

    async fn indices_for_page(&self, page_id: u32) -> Result<Vec<u32>, StoreError> {
        let rows = sqlx::query(
            "SELECT DISTINCT index_in_page FROM products WHERE page_id = ? ORDER BY index_in_page",
        )
        .bind(i64::from(page_id))
        .fetch_all(&self.pool)
        .await
        .map_err(backend)?;

        rows.iter()
            .map(|row| {
                let index: i64 = row.try_get("index_in_page").map_err(backend)?;
                u32::try_from(index)
                    .map_err(|_| StoreError::InvalidRecord(format!("negative index_in_page {index}")))
            })
            .collect()
    }

    async fn max_page_id(&self) -> Result<Option<u32>, StoreError> {
        let max: Option<i64> = sqlx::query_scalar("SELECT MAX(page_id) FROM products")
            .fetch_one(&self.pool)
            .await
            .map_err(backend)?;
        max.map(|id| {
            u32::try_from(id).map_err(|_| StoreError::InvalidRecord(format!("negative page_id {id}")))
        })
        .transpose()
    }

    async fn list_addresses(&self) -> Result<Vec<StoredAddress>, StoreError> {
        let rows = sqlx::query(
            "SELECT url, page_id, index_in_page FROM products ORDER BY page_id, index_in_page",
        )
        .fetch_all(&self.pool)
        .await
        .map_err(backend)?;
        rows.iter().map(address_from_row).collect()
    }

    async fn count(&self) -> Result<u64, StoreError> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM products")
            .fetch_one(&self.pool)
            .await
            .map_err(backend)?;
        Ok(count.unsigned_abs())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::PagePosition;
    use crate::infrastructure::DatabaseConnection;
    use chrono::Utc;

    async fn repository() -> SqliteProductRepository {
        let db = DatabaseConnection::new("sqlite::memory:").await.unwrap();
        db.migrate().await.unwrap();
        SqliteProductRepository::new(db.pool().clone())
    }

    fn record(url: &str, page_id: u32, index: u32) -> ProductRecord {
        ProductRecord {
            id: ProductRecord::format_id(PagePosition::new(page_id, index)),
            url: url.into(),
            manufacturer: Some("Acme".into()),
            model: Some("Plug".into()),
            certificate_id: None,
            page_id,
            index_in_page: index,
            site_page_number: 1,
            crawled_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn upsert_classifies_added_updated_unchanged() {
        let repo = repository().await;

        let first = repo
            .upsert(&[record("a", 0, 0), record("b", 0, 1)])
            .await
            .unwrap();
        assert_eq!((first.added, first.updated, first.unchanged), (2, 0, 0));

        let mut moved = record("b", 0, 2);
        moved.model = Some("Plug v2".into());
        let second = repo.upsert(&[record("a", 0, 0), moved]).await.unwrap();
        assert_eq!((second.added, second.updated, second.unchanged), (0, 1, 1));

        assert_eq!(repo.count().await.unwrap(), 2);
        assert_eq!(repo.indices_for_page(0).await.unwrap(), vec![0, 2]);
    }

    #[tokio::test]
    async fn address_queries() {
        let repo = repository().await;
        assert_eq!(repo.max_page_id().await.unwrap(), None);

        repo.upsert(&[record("a", 0, 3), record("b", 2, 0), record("c", 2, 7)])
            .await
            .unwrap();

        assert_eq!(repo.max_page_id().await.unwrap(), Some(2));
        assert_eq!(repo.existing_urls().await.unwrap().len(), 3);
        let addresses = repo.list_addresses().await.unwrap();
        assert_eq!(addresses.first().map(|a| a.url.as_str()), Some("a"));
        assert_eq!(repo.find_by_page(2).await.unwrap().len(), 2);
        assert!(repo.indices_for_page(1).await.unwrap().is_empty());
    }
}

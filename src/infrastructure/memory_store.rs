//! In-memory `ProductStore` for dry runs and tests

use async_trait::async_trait;
use std::collections::{BTreeMap, HashSet};
use tokio::sync::RwLock;

use crate::domain::{ProductRecord, ProductStore, StoreError, StoredAddress, UpsertSummary};

/// Url-keyed map guarded by a tokio `RwLock`
#[derive(Debug, Default)]
pub struct InMemoryProductStore {
    records: RwLock<BTreeMap<String, ProductRecord>>,
}

impl InMemoryProductStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn snapshot(&self) -> Vec<ProductRecord> {
        let mut all: Vec<_> = self.records.read().await.values().cloned().collect();
        all.sort_by_key(ProductRecord::position);
        all
    }

    pub async fn remove(&self, url: &str) -> Option<ProductRecord> {
        self.records.write().await.remove(url)
    }
}

#[async_trait]
impl ProductStore for InMemoryProductStore {
    async fn existing_urls(&self) -> Result<HashSet<String>, StoreError> {
        Ok(self.records.read().await.keys().cloned().collect())
    }

    async fn upsert(&self, records: &[ProductRecord]) -> Result<UpsertSummary, StoreError> {
        let mut summary = UpsertSummary::default();
        let mut stored = self.records.write().await;
        for record in records {
            match stored.get_mut(&record.url) {
                Some(existing) if !record.differs_from(existing) => summary.unchanged += 1,
                Some(existing) => {
                    *existing = record.clone();
                    summary.updated += 1;
                }
                None => {
                    stored.insert(record.url.clone(), record.clone());
                    summary.added += 1;
                }
            }
        }
        Ok(summary)
    }

    async fn indices_for_page(&self, page_id: u32) -> Result<Vec<u32>, StoreError> {
        let indices: std::collections::BTreeSet<u32> = self
            .records
            .read()
            .await
            .values()
            .filter(|r| r.page_id == page_id)
            .map(|r| r.index_in_page)
            .collect();
        Ok(indices.into_iter().collect())
    }

    async fn max_page_id(&self) -> Result<Option<u32>, StoreError> {
        Ok(self.records.read().await.values().map(|r| r.page_id).max())
    }

    async fn list_addresses(&self) -> Result<Vec<StoredAddress>, StoreError> {
        let mut addresses: Vec<_> = self
            .records
            .read()
            .await
            .values()
            .map(|r| StoredAddress {
                url: r.url.clone(),
                page_id: r.page_id,
                index_in_page: r.index_in_page,
            })
            .collect();
        addresses.sort_by_key(|a| (a.page_id, a.index_in_page));
        Ok(addresses)
    }

    async fn count(&self) -> Result<u64, StoreError> {
        Ok(self.records.read().await.len() as u64)
    }
}

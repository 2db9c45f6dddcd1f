//! Collaborator contracts: page fetching, site probing and product storage.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::time::Duration;

use super::errors::{PageFetchError, StoreError};
use super::product::{ProductRecord, RawProductRecord};
use super::site_metadata::SiteMetadata;

/// One listing page as returned by a [`PageFetcher`]
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FetchedPage {
    pub page_number: u32,
    /// In site order, `site_index` 0 = newest
    pub records: Vec<RawProductRecord>,
    /// Largest page number visible in the page's pagination widget
    pub max_page_in_pagination: Option<u32>,
}

/// Retrieves listing pages from the catalog.
///
/// 구현체는 `timeout` 안에 끝나지 않으면 `Timeout` 오류를 돌려줘야 하지만,
/// 엔진도 자체적으로 같은 제한을 건다.
#[async_trait]
pub trait PageFetcher: Send + Sync {
    /// Prepares shared resources (browser context, HTTP client).
    async fn open(&self) -> Result<(), PageFetchError> {
        Ok(())
    }

    fn page_url(&self, page_number: u32) -> String;

    async fn fetch_page(
        &self,
        page_number: u32,
        timeout: Duration,
    ) -> Result<FetchedPage, PageFetchError>;

    /// Releases shared resources. Called once a crawl that opened the fetcher ends.
    async fn close(&self) {}
}

/// Discovers the current catalog shape
#[async_trait]
pub trait SiteProbe: Send + Sync {
    async fn probe(&self) -> Result<SiteMetadata, PageFetchError>;
}

/// Address of a stored product
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct StoredAddress {
    pub url: String,
    pub page_id: u32,
    pub index_in_page: u32,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpsertSummary {
    pub added: u32,
    pub updated: u32,
    pub unchanged: u32,
    pub failed: u32,
}

impl UpsertSummary {
    /// Records that ended up written (new or changed)
    pub const fn written(&self) -> u32 {
        self.added + self.updated
    }

    pub fn absorb(&mut self, other: Self) {
        self.added += other.added;
        self.updated += other.updated;
        self.unchanged += other.unchanged;
        self.failed += other.failed;
    }
}

/// Product persistence, keyed by product url
#[async_trait]
pub trait ProductStore: Send + Sync {
    async fn existing_urls(&self) -> Result<HashSet<String>, StoreError>;

    /// Inserts new urls and rewrites the address/fields of known ones.
    async fn upsert(&self, records: &[ProductRecord]) -> Result<UpsertSummary, StoreError>;

    /// Occupied `index_in_page` values of one local page, ascending
    async fn indices_for_page(&self, page_id: u32) -> Result<Vec<u32>, StoreError>;

    async fn max_page_id(&self) -> Result<Option<u32>, StoreError>;

    async fn list_addresses(&self) -> Result<Vec<StoredAddress>, StoreError>;

    async fn count(&self) -> Result<u64, StoreError>;
}

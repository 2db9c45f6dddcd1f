//! Decides which site pages an incremental crawl must visit.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use tracing::info;

use crate::domain::{CrawlError, CrawlRange, PageIndexMapper, ProductStore, SiteMetadata};

pub struct CrawlRangePlanner {
    mapper: PageIndexMapper,
    store: Arc<dyn ProductStore>,
}

impl CrawlRangePlanner {
    pub fn new(mapper: PageIndexMapper, store: Arc<dyn ProductStore>) -> Self {
        Self { mapper, store }
    }

    /// Oldest local page that does not yet hold every slot it should.
    ///
    /// Returns `total_site_pages` when every page up to the live edge is complete.
    pub async fn first_unverified_page_id(&self, site: &SiteMetadata) -> Result<u32, CrawlError> {
        let mut occupied: BTreeMap<u32, BTreeSet<u32>> = BTreeMap::new();
        for address in self.store.list_addresses().await? {
            occupied
                .entry(address.page_id)
                .or_default()
                .insert(address.index_in_page);
        }

        let first = (0..site.total_site_pages)
            .find(|&page_id| {
                let expected = self.mapper.expected_local_page_count(
                    page_id,
                    site.total_site_pages,
                    site.last_page_product_count,
                );
                // 범위 밖 index 는 빈 슬롯을 대신하지 못한다
                let stored = occupied
                    .get(&page_id)
                    .map_or(0, |indices| indices.range(..expected).count()) as u32;
                stored < expected
            })
            .unwrap_or(site.total_site_pages);
        Ok(first)
    }

    /// Range starting at the first unverified page, bounded by `page_limit` (0 = no bound)
    pub async fn plan(
        &self,
        site: &SiteMetadata,
        page_limit: u32,
    ) -> Result<Option<CrawlRange>, CrawlError> {
        let first = self.first_unverified_page_id(site).await?;
        let range = self.mapper.calculate_crawling_range_from(
            first,
            site.total_site_pages,
            site.last_page_product_count,
            page_limit,
        )?;

        match &range {
            Some(r) => info!(
                "📋 Crawl range: site pages {}..={} (local pages {}..={})",
                r.start_page, r.end_page, r.start_page_id, r.end_page_id
            ),
            None => info!("✅ All {} local pages are already verified", site.total_site_pages),
        }
        Ok(range)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{PagePosition, ProductRecord};
    use crate::infrastructure::InMemoryProductStore;
    use chrono::Utc;

    fn fill(page_id: u32, count: u32) -> Vec<ProductRecord> {
        (0..count)
            .map(|index| ProductRecord {
                id: ProductRecord::format_id(PagePosition::new(page_id, index)),
                url: format!("u-{page_id}-{index}"),
                manufacturer: None,
                model: None,
                certificate_id: None,
                page_id,
                index_in_page: index,
                site_page_number: 0,
                crawled_at: Utc::now(),
            })
            .collect()
    }

    #[tokio::test]
    async fn empty_store_starts_at_oldest_page() {
        let store = Arc::new(InMemoryProductStore::new());
        let planner = CrawlRangePlanner::new(PageIndexMapper::default(), store);
        let site = SiteMetadata::new(10, 5);

        let range = planner.plan(&site, 3).await.unwrap().unwrap();
        assert_eq!((range.start_page, range.end_page), (10, 8));
        assert_eq!(range.start_page_id, 0);
    }

    #[tokio::test]
    async fn verified_pages_are_skipped() {
        let store = Arc::new(InMemoryProductStore::new());
        store.upsert(&fill(0, 12)).await.unwrap();
        store.upsert(&fill(1, 12)).await.unwrap();
        store.upsert(&fill(2, 11)).await.unwrap();
        let planner = CrawlRangePlanner::new(PageIndexMapper::default(), store);
        let site = SiteMetadata::new(10, 5);

        assert_eq!(planner.first_unverified_page_id(&site).await.unwrap(), 2);
        let range = planner.plan(&site, 2).await.unwrap().unwrap();
        assert_eq!((range.start_page, range.end_page), (8, 7));
    }

    #[tokio::test]
    async fn out_of_range_index_does_not_verify_a_short_page() {
        let store = Arc::new(InMemoryProductStore::new());
        store.upsert(&fill(0, 12)).await.unwrap();
        // page 1 expects 3 slots; 0 and 1 are stored plus a stray index 7
        let mut newest = fill(1, 2);
        newest.extend(fill(1, 8).pop());
        store.upsert(&newest).await.unwrap();
        let planner = CrawlRangePlanner::new(PageIndexMapper::default(), store);

        let site = SiteMetadata::new(2, 3);
        assert_eq!(planner.first_unverified_page_id(&site).await.unwrap(), 1);
        let range = planner.plan(&site, 0).await.unwrap().unwrap();
        assert_eq!((range.start_page, range.end_page), (1, 1));
    }

    #[tokio::test]
    async fn fully_verified_catalog_has_no_range() {
        let store = Arc::new(InMemoryProductStore::new());
        store.upsert(&fill(0, 12)).await.unwrap();
        store.upsert(&fill(1, 3)).await.unwrap();
        let planner = CrawlRangePlanner::new(PageIndexMapper::default(), store);

        // 15 products: 2 pages, 3 on the last
        let site = SiteMetadata::new(2, 3);
        assert!(planner.plan(&site, 0).await.unwrap().is_none());
    }
}

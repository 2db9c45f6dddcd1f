//! Shared fixtures for integration tests

#![allow(dead_code)]

use async_trait::async_trait;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use matter_certis_crawler::application::{CrawlerSettings, ProductListCrawler, SiteMetadataCache};
use matter_certis_crawler::domain::{
    FetchedPage, PageFetchError, PageFetcher, ProductStore, RawProductRecord, SiteMetadata,
    SiteProbe,
};

pub const PAGE_SIZE: u32 = 12;

/// Newest-first catalog whose size can grow between crawls
#[derive(Debug, Default)]
pub struct GrowingCatalog {
    total: AtomicU32,
    requests: AtomicU32,
}

impl GrowingCatalog {
    pub fn new(total: u32) -> Arc<Self> {
        Arc::new(Self {
            total: AtomicU32::new(total),
            requests: AtomicU32::new(0),
        })
    }

    pub fn publish(&self, count: u32) {
        self.total.fetch_add(count, Ordering::SeqCst);
    }

    pub fn requests(&self) -> u32 {
        self.requests.load(Ordering::SeqCst)
    }

    pub fn url_of(publication_index: u32) -> String {
        format!("https://csa-iot.org/csa_product/device-{publication_index}/")
    }
}

#[async_trait]
impl PageFetcher for GrowingCatalog {
    fn page_url(&self, page_number: u32) -> String {
        format!("https://csa-iot.org/csa-iot_products/page/{page_number}/")
    }

    async fn fetch_page(&self, page_number: u32, _timeout: Duration) -> Result<FetchedPage, PageFetchError> {
        self.requests.fetch_add(1, Ordering::SeqCst);
        let total = self.total.load(Ordering::SeqCst);
        let start = page_number.saturating_sub(1) * PAGE_SIZE;
        let end = (page_number * PAGE_SIZE).min(total);
        let records = (start..end.max(start))
            .enumerate()
            .map(|(site_index, from_newest)| {
                let mut raw = RawProductRecord::new(Self::url_of(total - 1 - from_newest), site_index as u32);
                raw.manufacturer = Some("Acme".to_string());
                raw
            })
            .collect();
        Ok(FetchedPage {
            page_number,
            records,
            max_page_in_pagination: (total > 0).then(|| total.div_ceil(PAGE_SIZE)),
        })
    }
}

#[async_trait]
impl SiteProbe for GrowingCatalog {
    async fn probe(&self) -> Result<SiteMetadata, PageFetchError> {
        let total = self.total.load(Ordering::SeqCst);
        if total == 0 {
            return Err(PageFetchError::extraction("empty catalog"));
        }
        let pages = total.div_ceil(PAGE_SIZE);
        Ok(SiteMetadata::new(pages, total - (pages - 1) * PAGE_SIZE))
    }
}

pub fn settings() -> CrawlerSettings {
    let mut settings = CrawlerSettings::default();
    settings.batch_delay = Duration::ZERO;
    settings.retry_delay = Duration::ZERO;
    settings.gap.batch_delay = Duration::ZERO;
    settings.site_metadata_ttl = Duration::ZERO;
    settings
}

pub fn crawler(catalog: &Arc<GrowingCatalog>, store: Arc<dyn ProductStore>) -> ProductListCrawler {
    let settings = settings();
    let cache = Arc::new(SiteMetadataCache::new(
        catalog.clone(),
        settings.site_metadata_ttl,
        settings.page_size,
    ));
    ProductListCrawler::new(catalog.clone(), store, cache, settings).expect("valid settings")
}

//! Site metadata cache and pagination probe
//!
//! 사이트 상태(총 페이지 수, 마지막 페이지 제품 수)는 TTL 동안 캐시되고
//! 필요한 컴포넌트에 `Arc` 로 주입된다.

use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use crate::domain::{
    CrawlError, FetchedPage, PageFetchError, PageFetcher, SiteMetadata, SiteProbe,
};

/// TTL cache in front of a [`SiteProbe`]
pub struct SiteMetadataCache {
    probe: Arc<dyn SiteProbe>,
    ttl: Duration,
    page_size: u32,
    entry: RwLock<Option<SiteMetadata>>,
}

impl SiteMetadataCache {
    pub fn new(probe: Arc<dyn SiteProbe>, ttl: Duration, page_size: u32) -> Self {
        Self {
            probe,
            ttl,
            page_size,
            entry: RwLock::new(None),
        }
    }

    /// Cached metadata, probing the site when missing, expired or forced.
    pub async fn resolve(&self, force_refresh: bool) -> Result<SiteMetadata, CrawlError> {
        if !force_refresh {
            if let Some(cached) = self.fresh_entry().await {
                debug!("📦 Using cached site metadata ({} pages)", cached.total_site_pages);
                return Ok(cached);
            }
        }

        let mut entry = self.entry.write().await;
        // 다른 태스크가 먼저 갱신했을 수 있다
        if !force_refresh {
            if let Some(cached) = entry.as_ref().filter(|m| m.is_fresh(self.ttl)) {
                return Ok(cached.clone());
            }
        }

        info!("🔍 Probing site for current pagination");
        let fresh = self.probe.probe().await.map_err(CrawlError::SiteProbe)?;
        fresh.validate(self.page_size)?;
        info!(
            "✅ Site has {} pages, {} products on the last page",
            fresh.total_site_pages, fresh.last_page_product_count
        );
        *entry = Some(fresh.clone());
        Ok(fresh)
    }

    async fn fresh_entry(&self) -> Option<SiteMetadata> {
        self.entry
            .read()
            .await
            .as_ref()
            .filter(|m| m.is_fresh(self.ttl))
            .cloned()
    }

    pub async fn peek(&self) -> Option<SiteMetadata> {
        self.entry.read().await.clone()
    }

    pub async fn invalidate(&self) {
        *self.entry.write().await = None;
    }

    /// Seeds the cache (e.g. from persisted app state)
    pub async fn prime(&self, metadata: SiteMetadata) {
        *self.entry.write().await = Some(metadata);
    }
}

/// Discovers the last page by following the pagination widget.
///
/// Start at a hint page (1 by default), jump to the highest advertised page
/// while it grows, then count the items on the final page. A page past the
/// end (empty) steps back toward the advertised maximum.
pub struct PaginationProbe {
    fetcher: Arc<dyn PageFetcher>,
    page_size: u32,
    max_attempts: u32,
    page_timeout: Duration,
    start_page: u32,
}

impl PaginationProbe {
    pub fn new(
        fetcher: Arc<dyn PageFetcher>,
        page_size: u32,
        max_attempts: u32,
        page_timeout: Duration,
    ) -> Self {
        Self {
            fetcher,
            page_size,
            max_attempts: max_attempts.max(1),
            page_timeout,
            start_page: 1,
        }
    }

    /// Starts the search from a previously known last page
    #[must_use]
    pub fn with_start_page(mut self, start_page: Option<u32>) -> Self {
        self.start_page = start_page.unwrap_or(1).max(1);
        self
    }

    async fn fetch(&self, page: u32) -> Result<FetchedPage, PageFetchError> {
        tokio::time::timeout(self.page_timeout, self.fetcher.fetch_page(page, self.page_timeout))
            .await
            .map_err(|_| PageFetchError::timeout(format!("site probe timed out on page {page}")))?
    }
}

#[async_trait]
impl SiteProbe for PaginationProbe {
    async fn probe(&self) -> Result<SiteMetadata, PageFetchError> {
        let mut current = self.start_page;
        // 아래로 한 칸씩 내려가는 경우까지 고려한 상한
        let budget = self.max_attempts.saturating_mul(4);

        for attempt in 1..=budget {
            let page = self.fetch(current).await?;
            let advertised = page.max_page_in_pagination;
            debug!(
                "🔎 Probe attempt {}: page {} has {} items, pagination max {:?}",
                attempt,
                current,
                page.records.len(),
                advertised
            );

            match (page.records.is_empty(), advertised) {
                (_, Some(max)) if max > current => {
                    info!("➡️  Pagination advertises page {}, jumping from {}", max, current);
                    current = max;
                }
                (true, Some(max)) if max < current => current = max,
                (true, _) if current > 1 => current -= 1,
                (true, _) => {
                    return Err(PageFetchError::extraction("catalog has no products"));
                }
                (false, _) => {
                    let count = (page.records.len() as u32).min(self.page_size);
                    if page.records.len() as u32 > self.page_size {
                        warn!(
                            "⚠️ Last page returned {} items, more than page size {}",
                            page.records.len(),
                            self.page_size
                        );
                    }
                    return Ok(SiteMetadata::new(current, count));
                }
            }
        }

        Err(PageFetchError::generic(format!(
            "last page not found within {budget} probe requests"
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::SimulatedCatalog;
    use std::sync::atomic::{AtomicU32, Ordering};

    struct CountingProbe {
        calls: AtomicU32,
    }

    #[async_trait]
    impl SiteProbe for CountingProbe {
        async fn probe(&self) -> Result<SiteMetadata, PageFetchError> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(SiteMetadata::new(10 + n, 5))
        }
    }

    #[tokio::test]
    async fn cache_probes_once_within_ttl() {
        let probe = Arc::new(CountingProbe { calls: AtomicU32::new(0) });
        let cache = SiteMetadataCache::new(probe.clone(), Duration::from_secs(60), 12);

        let a = cache.resolve(false).await.unwrap();
        let b = cache.resolve(false).await.unwrap();
        assert_eq!(a.total_site_pages, b.total_site_pages);
        assert_eq!(probe.calls.load(Ordering::SeqCst), 1);

        let forced = cache.resolve(true).await.unwrap();
        assert_eq!(forced.total_site_pages, 11);

        cache.invalidate().await;
        assert!(cache.peek().await.is_none());
        cache.resolve(false).await.unwrap();
        assert_eq!(probe.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn expired_entry_is_refreshed() {
        let probe = Arc::new(CountingProbe { calls: AtomicU32::new(0) });
        let cache = SiteMetadataCache::new(probe.clone(), Duration::ZERO, 12);
        cache.resolve(false).await.unwrap();
        cache.resolve(false).await.unwrap();
        assert_eq!(probe.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn probe_follows_pagination_to_last_page() {
        // 113 products → 10 pages, 5 on the last
        let catalog = Arc::new(SimulatedCatalog::with_products(113));
        let probe = PaginationProbe::new(catalog.clone(), 12, 10, Duration::from_secs(1));

        let meta = probe.probe().await.unwrap();
        assert_eq!((meta.total_site_pages, meta.last_page_product_count), (10, 5));
    }

    #[tokio::test]
    async fn probe_recovers_from_stale_start_hint() {
        let catalog = Arc::new(SimulatedCatalog::with_products(30));
        let probe = PaginationProbe::new(catalog, 12, 10, Duration::from_secs(1))
            .with_start_page(Some(40));

        let meta = probe.probe().await.unwrap();
        assert_eq!((meta.total_site_pages, meta.last_page_product_count), (3, 6));
    }

    #[tokio::test]
    async fn empty_catalog_is_reported() {
        let catalog = Arc::new(SimulatedCatalog::with_products(0));
        let probe = PaginationProbe::new(catalog, 12, 3, Duration::from_secs(1));
        assert!(probe.probe().await.is_err());
    }
}

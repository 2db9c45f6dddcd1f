//! Test utilities: a simulated newest-first catalog with shifting pagination
//!
//! `SimulatedCatalog` 은 실제 사이트처럼 최신 제품을 1페이지에 두고, `publish`
//! 로 제품이 추가되면 기존 제품들의 사이트 페이지 번호가 밀려난다. 페이지별
//! 실패/절삭/지연을 주입해 엔진의 재시도 경로를 재현할 수 있다.

use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use crate::application::{CrawlerSettings, GapSettings, ProductListCrawler, SiteMetadataCache};
use crate::domain::{
    DEFAULT_PRODUCTS_PER_PAGE, FetchedPage, PageErrorKind, PageFetchError, PageFetcher,
    RawProductRecord, SiteMetadata, SiteProbe,
};
use crate::infrastructure::InMemoryProductStore;

#[derive(Debug, Default)]
struct CatalogState {
    /// Products in publication order, index 0 = oldest
    total: u32,
    failures: HashMap<u32, (u32, PageErrorKind)>,
    truncations: HashMap<u32, VecDeque<usize>>,
    /// Scripted `open()` results, `true` = success; empty means always succeed
    opens: VecDeque<bool>,
    /// Scripted site metadata lookups, same convention as `opens`
    site_lookups: VecDeque<bool>,
    delay: Duration,
    log: Vec<u32>,
}

#[derive(Debug)]
pub struct SimulatedCatalog {
    page_size: u32,
    state: Mutex<CatalogState>,
}

impl SimulatedCatalog {
    pub fn with_products(total: u32) -> Self {
        Self {
            page_size: DEFAULT_PRODUCTS_PER_PAGE,
            state: Mutex::new(CatalogState {
                total,
                ..CatalogState::default()
            }),
        }
    }

    fn state(&self) -> MutexGuard<'_, CatalogState> {
        // 테스트 중 패닉으로 poison 되어도 상태는 계속 사용
        self.state.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    /// Url of the product published `publication_index`-th (0 = oldest)
    pub fn product_url(&self, publication_index: u32) -> String {
        format!("https://csa-iot.org/csa_product/item-{publication_index:05}/")
    }

    /// Publishes `count` new products on top of page 1
    pub fn publish(&self, count: u32) {
        self.state().total += count;
    }

    /// Next `times` fetches of `page` fail with `kind`
    pub fn fail_page(&self, page: u32, times: u32, kind: PageErrorKind) {
        self.state().failures.insert(page, (times, kind));
    }

    /// Successive successful fetches of `page` return only the first `keep[n]` items
    pub fn truncate_page(&self, page: u32, keep: &[usize]) {
        self.state()
            .truncations
            .insert(page, keep.iter().copied().collect());
    }

    /// Successive `open()` calls succeed or fail as scripted
    pub fn script_opens(&self, results: &[bool]) {
        self.state().opens = results.iter().copied().collect();
    }

    /// Successive site metadata lookups succeed or fail as scripted
    pub fn script_site_lookups(&self, results: &[bool]) {
        self.state().site_lookups = results.iter().copied().collect();
    }

    pub fn set_delay(&self, delay: Duration) {
        self.state().delay = delay;
    }

    /// Site pages requested so far, in request order
    pub fn fetch_log(&self) -> Vec<u32> {
        self.state().log.clone()
    }

    pub fn fetch_count(&self, page: u32) -> usize {
        self.state().log.iter().filter(|&&p| p == page).count()
    }

    /// `(total_site_pages, last_page_product_count)` right now
    pub fn shape(&self) -> Option<(u32, u32)> {
        let total = self.state().total;
        if total == 0 {
            return None;
        }
        let pages = total.div_ceil(self.page_size);
        Some((pages, total - (pages - 1) * self.page_size))
    }

    fn render_page(&self, total: u32, page_number: u32) -> Vec<RawProductRecord> {
        if page_number == 0 {
            return Vec::new();
        }
        let start = (page_number - 1) * self.page_size;
        let end = (page_number * self.page_size).min(total);
        (start..end.max(start))
            .enumerate()
            .map(|(site_index, from_newest)| {
                let publication_index = total - 1 - from_newest;
                RawProductRecord {
                    url: self.product_url(publication_index),
                    manufacturer: Some(format!("Vendor {}", publication_index % 7)),
                    model: Some(format!("Model-{publication_index}")),
                    certificate_id: Some(format!("CSA{publication_index:05}")),
                    site_index: site_index as u32,
                }
            })
            .collect()
    }
}

#[async_trait]
impl PageFetcher for SimulatedCatalog {
    async fn open(&self) -> Result<(), PageFetchError> {
        let scripted = self.state().opens.pop_front();
        match scripted {
            Some(false) => Err(PageFetchError::initialization("simulated browser failed to start")),
            _ => Ok(()),
        }
    }

    fn page_url(&self, page_number: u32) -> String {
        format!("sim://catalog/page/{page_number}")
    }

    async fn fetch_page(
        &self,
        page_number: u32,
        _timeout: Duration,
    ) -> Result<FetchedPage, PageFetchError> {
        let (delay, failure, keep, total) = {
            let mut state = self.state();
            state.log.push(page_number);
            let failure = match state.failures.get_mut(&page_number) {
                Some((remaining, kind)) if *remaining > 0 => {
                    *remaining -= 1;
                    Some(*kind)
                }
                _ => None,
            };
            let keep = if failure.is_none() {
                state
                    .truncations
                    .get_mut(&page_number)
                    .and_then(VecDeque::pop_front)
            } else {
                None
            };
            (state.delay, failure, keep, state.total)
        };

        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        if let Some(kind) = failure {
            return Err(PageFetchError::new(kind, format!("injected failure on page {page_number}")));
        }

        let mut records = self.render_page(total, page_number);
        if let Some(keep) = keep {
            records.truncate(keep);
        }
        Ok(FetchedPage {
            page_number,
            records,
            max_page_in_pagination: (total > 0).then(|| total.div_ceil(self.page_size)),
        })
    }
}

#[async_trait]
impl SiteProbe for SimulatedCatalog {
    async fn probe(&self) -> Result<SiteMetadata, PageFetchError> {
        if self.state().site_lookups.pop_front() == Some(false) {
            return Err(PageFetchError::navigation("simulated catalog is unreachable"));
        }
        self.shape()
            .map(|(pages, last)| SiteMetadata::new(pages, last))
            .ok_or_else(|| PageFetchError::extraction("catalog has no products"))
    }
}

/// Settings with no delays and small retry budget
pub fn fast_settings() -> CrawlerSettings {
    CrawlerSettings {
        page_size: DEFAULT_PRODUCTS_PER_PAGE,
        page_range_limit: 0,
        initial_concurrency: 4,
        retry_concurrency: 2,
        page_timeout: Duration::from_secs(2),
        batch_size: 30,
        batch_delay: Duration::ZERO,
        retry_delay: Duration::ZERO,
        retry_cycles: 3,
        auto_add_to_local_db: true,
        site_metadata_ttl: Duration::from_secs(3600),
        max_search_attempts: 10,
        gap: GapSettings {
            batch_size: 10,
            concurrency: 4,
            batch_delay: Duration::ZERO,
        },
    }
}

/// Crawler wired to a simulated catalog (fetcher and probe) and an in-memory store
pub fn build_crawler(
    catalog: &Arc<SimulatedCatalog>,
    store: &Arc<InMemoryProductStore>,
    settings: CrawlerSettings,
) -> ProductListCrawler {
    let cache = Arc::new(SiteMetadataCache::new(
        catalog.clone(),
        settings.site_metadata_ttl,
        settings.page_size,
    ));
    ProductListCrawler::new(catalog.clone(), store.clone(), cache, settings)
        .expect("test settings use a valid page size")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn pages_shift_when_products_are_published() {
        let catalog = SimulatedCatalog::with_products(13);
        assert_eq!(catalog.shape(), Some((2, 1)));

        let page2 = catalog.fetch_page(2, Duration::from_secs(1)).await.unwrap();
        assert_eq!(page2.records.len(), 1);
        assert_eq!(page2.records[0].url, catalog.product_url(0));

        catalog.publish(2);
        let page2 = catalog.fetch_page(2, Duration::from_secs(1)).await.unwrap();
        assert_eq!(page2.records.len(), 3);
        assert_eq!(page2.records[2].url, catalog.product_url(0));
        assert_eq!(page2.max_page_in_pagination, Some(2));
    }

    #[tokio::test]
    async fn injected_failures_run_out() {
        let catalog = SimulatedCatalog::with_products(24);
        catalog.fail_page(1, 1, PageErrorKind::Navigation);

        let err = catalog.fetch_page(1, Duration::from_secs(1)).await.unwrap_err();
        assert_eq!(err.kind, PageErrorKind::Navigation);
        assert!(catalog.fetch_page(1, Duration::from_secs(1)).await.is_ok());
        assert_eq!(catalog.fetch_count(1), 2);
    }
}

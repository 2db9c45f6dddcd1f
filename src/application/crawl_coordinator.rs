//! One incremental run: plan → crawl → save → verify → backfill

use serde::{Deserialize, Serialize};
use std::ops::RangeInclusive;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::application::crawl_engine::{CollectOutcome, CollectRequest, ProductListCrawler};
use crate::application::gap_collector::{GapCollectionResult, GapCollector};
use crate::application::gap_detector::GapDetector;
use crate::domain::{CrawlError, PageGap, SiteMetadata};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IncrementalCrawlReport {
    pub crawl: CollectOutcome,
    /// Local pages whose every slot was on a crawled site page
    pub verified_pages: Option<RangeInclusive<u32>>,
    pub gaps: Vec<PageGap>,
    pub backfill: Option<GapCollectionResult>,
    pub elapsed: Duration,
}

impl IncrementalCrawlReport {
    pub fn remaining_missing_slots(&self) -> u32 {
        let detected: u32 = self.gaps.iter().map(PageGap::missing_count).sum();
        let healed = self.backfill.as_ref().map_or(0, |b| b.collected);
        detected.saturating_sub(healed)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VerificationReport {
    pub site: SiteMetadata,
    pub gaps: Vec<PageGap>,
    pub backfill: Option<GapCollectionResult>,
}

pub struct CrawlCoordinator {
    crawler: Arc<ProductListCrawler>,
    detector: GapDetector,
    collector: GapCollector,
}

impl CrawlCoordinator {
    pub fn new(crawler: Arc<ProductListCrawler>) -> Self {
        let detector = GapDetector::new(*crawler.mapper(), Arc::clone(crawler.store()));
        let collector = GapCollector::new(Arc::clone(&crawler));
        Self {
            crawler,
            detector,
            collector,
        }
    }

    pub fn crawler(&self) -> &Arc<ProductListCrawler> {
        &self.crawler
    }

    pub async fn run_incremental(
        &self,
        page_limit: u32,
        cancel: &CancellationToken,
    ) -> Result<IncrementalCrawlReport, CrawlError> {
        let started = Instant::now();
        let crawl = self
            .crawler
            .collect(CollectRequest::Incremental { page_limit }, cancel)
            .await?;

        let mut report = IncrementalCrawlReport {
            verified_pages: None,
            gaps: Vec::new(),
            backfill: None,
            elapsed: Duration::ZERO,
            crawl,
        };

        let Some(range) = report.crawl.range else {
            info!("✅ Nothing to crawl, local data is up to date");
            report.elapsed = started.elapsed();
            return Ok(report);
        };
        if report.crawl.cancelled {
            warn!("🛑 Crawl was cancelled, skipping verification");
            report.elapsed = started.elapsed();
            return Ok(report);
        }
        if let Some(save_error) = &report.crawl.save_error {
            warn!("⚠️ Skipping verification, products were not saved: {}", save_error);
            report.elapsed = started.elapsed();
            return Ok(report);
        }

        let site = report.crawl.site.clone();
        report.verified_pages = self.crawler.mapper().fully_covered_local_pages(
            &range,
            site.total_site_pages,
            site.last_page_product_count,
        )?;

        if let Some(pages) = report.verified_pages.clone() {
            info!("🔍 Verifying local pages {}..={}", pages.start(), pages.end());
            let (gaps, backfill) = self.detect_and_backfill(pages, &site, cancel).await?;
            report.gaps = gaps;
            report.backfill = backfill;
        }

        report.elapsed = started.elapsed();
        info!(
            "🏁 Incremental crawl finished in {:?}: {} records, {} gaps, {} slots still missing",
            report.elapsed,
            report.crawl.records.len(),
            report.gaps.len(),
            report.remaining_missing_slots()
        );
        Ok(report)
    }

    /// Gap check and backfill of `page_ids` without a preceding crawl
    pub async fn verify_and_backfill<I>(
        &self,
        page_ids: I,
        cancel: &CancellationToken,
    ) -> Result<VerificationReport, CrawlError>
    where
        I: IntoIterator<Item = u32>,
    {
        let site = self
            .crawler
            .site_cache()
            .resolve(false)
            .await
            .map_err(|e| CrawlError::RangePreparation(e.to_string()))?;
        let (gaps, backfill) = self.detect_and_backfill(page_ids, &site, cancel).await?;
        Ok(VerificationReport {
            site,
            gaps,
            backfill,
        })
    }

    async fn detect_and_backfill<I>(
        &self,
        page_ids: I,
        site: &SiteMetadata,
        cancel: &CancellationToken,
    ) -> Result<(Vec<PageGap>, Option<GapCollectionResult>), CrawlError>
    where
        I: IntoIterator<Item = u32>,
    {
        let gaps = self.detector.detect(page_ids, site).await?;
        if gaps.is_empty() || cancel.is_cancelled() {
            return Ok((gaps, None));
        }
        let backfill = self.collector.collect(gaps.clone(), cancel).await?;
        Ok((gaps, Some(backfill)))
    }
}

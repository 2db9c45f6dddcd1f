//! Targeted backfill of missing product slots
//!
//! 누락 슬롯마다 현재 사이트에서의 위치를 역산하고, 해당 사이트 페이지만
//! 다시 가져와 빠진 슬롯의 레코드만 저장한다.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::application::crawl_engine::{CollectOptions, CollectRequest, ProductListCrawler};
use crate::application::gap_detector::prioritize_gaps;
use crate::domain::{CrawlError, PageErrorKind, PageGap, PagePosition, ProductRecord};

/// Summary of one backfill run
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GapCollectionResult {
    /// Records written to the store
    pub collected: u32,
    /// Gap pages whose site pages could not be fetched
    pub failed: u32,
    /// Gap pages whose fetch yielded no usable record
    pub skipped: u32,
    pub collected_pages: Vec<u32>,
    pub failed_pages: Vec<u32>,
    pub errors: Vec<String>,
    pub cancelled: bool,
}

impl GapCollectionResult {
    pub fn processed_pages(&self) -> u32 {
        self.collected_pages.len() as u32 + self.failed + self.skipped
    }
}

pub struct GapCollector {
    crawler: Arc<ProductListCrawler>,
}

impl GapCollector {
    pub fn new(crawler: Arc<ProductListCrawler>) -> Self {
        Self { crawler }
    }

    /// Backfills `gaps` in priority order, `gap.batch_size` pages at a time.
    ///
    /// A batch that cannot be collected is counted as failed and the next
    /// batch still runs. Errors end up in [`GapCollectionResult::errors`].
    pub async fn collect(
        &self,
        mut gaps: Vec<PageGap>,
        cancel: &CancellationToken,
    ) -> Result<GapCollectionResult, CrawlError> {
        let mut result = GapCollectionResult::default();
        gaps.retain(|g| !g.missing_indices.is_empty());
        if gaps.is_empty() {
            return Ok(result);
        }
        prioritize_gaps(&mut gaps);

        let settings = self.crawler.settings();
        let options = CollectOptions::for_gap_collection(settings);
        let batch_size = settings.gap.batch_size.max(1);
        let missing_total: u32 = gaps.iter().map(PageGap::missing_count).sum();
        info!(
            "🩹 Backfilling {} missing slots on {} pages (batch size {})",
            missing_total,
            gaps.len(),
            batch_size
        );

        for (batch_index, batch) in gaps.chunks(batch_size).enumerate() {
            if batch_index > 0 && !settings.gap.batch_delay.is_zero() {
                tokio::select! {
                    () = tokio::time::sleep(settings.gap.batch_delay) => {},
                    () = cancel.cancelled() => {},
                }
            }
            if cancel.is_cancelled() {
                result.cancelled = true;
                break;
            }

            if let Err(e) = self.collect_batch(batch, &options, cancel, &mut result).await {
                error!("❌ Backfill batch {} failed: {}", batch_index + 1, e);
                let pages: Vec<u32> = batch.iter().map(|g| g.page_id).collect();
                result.errors.push(format!("batch {:?}: {}", pages, e));
                result.failed += pages.len() as u32;
                result.failed_pages.extend(pages);
                continue;
            }
            if result.cancelled {
                break;
            }
        }

        info!(
            "🩹 Backfill finished: {} records written, {} pages healed, {} failed, {} skipped",
            result.collected,
            result.collected_pages.len(),
            result.failed,
            result.skipped
        );
        Ok(result)
    }

    async fn collect_batch(
        &self,
        batch: &[PageGap],
        options: &CollectOptions,
        cancel: &CancellationToken,
        result: &mut GapCollectionResult,
    ) -> Result<(), CrawlError> {
        let slots: Vec<PagePosition> = batch
            .iter()
            .flat_map(|gap| {
                gap.missing_indices
                    .iter()
                    .map(move |&index| PagePosition::new(gap.page_id, index))
            })
            .collect();

        let outcome = self
            .crawler
            .collect_with(CollectRequest::Targeted(slots), options, cancel)
            .await?;
        result.cancelled = outcome.cancelled;

        let mapper = self.crawler.mapper();
        let failed_site_pages: BTreeSet<u32> =
            outcome.failures.iter().map(|f| f.page_number).collect();
        for failure in &outcome.failures {
            if outcome.cancelled && failure.kind == PageErrorKind::Abort {
                continue;
            }
            result.errors.push(failure.to_string());
        }

        let mut by_page: HashMap<u32, Vec<ProductRecord>> = HashMap::new();
        for record in outcome.records {
            by_page.entry(record.page_id).or_default().push(record);
        }

        let mut to_save = Vec::new();
        let mut healed = Vec::new();
        for gap in batch {
            let missing: BTreeSet<u32> = gap.missing_indices.iter().copied().collect();
            let records: Vec<ProductRecord> = by_page
                .remove(&gap.page_id)
                .unwrap_or_default()
                .into_iter()
                .filter(|r| missing.contains(&r.index_in_page))
                .collect();

            if !records.is_empty() {
                healed.push(gap.page_id);
                to_save.extend(records);
                continue;
            }

            let site_pages = match mapper.site_pages_for_slots(gap.page_id, &gap.missing_indices, &outcome.site) {
                Ok(pages) => pages,
                Err(e) => {
                    result.errors.push(format!("page {}: {}", gap.page_id, e));
                    result.skipped += 1;
                    continue;
                }
            };
            if outcome.cancelled {
                // 취소로 시도조차 못한 페이지는 실패로 치지 않는다
                continue;
            }
            if site_pages.iter().any(|p| failed_site_pages.contains(p)) {
                result.failed += 1;
                result.failed_pages.push(gap.page_id);
            } else {
                warn!("⚠️ Page {} yielded no usable records for its missing slots", gap.page_id);
                result.skipped += 1;
            }
        }

        if to_save.is_empty() {
            return Ok(());
        }
        match self.crawler.store().upsert(&to_save).await {
            Ok(summary) => {
                result.collected += summary.written();
                result.collected_pages.extend(healed);
            }
            Err(e) => {
                result.errors.push(format!("failed to save {} backfilled records: {}", to_save.len(), e));
                result.failed += healed.len() as u32;
                result.failed_pages.extend(healed);
            }
        }
        Ok(())
    }
}

//! Detects local pages whose stored slots fall short of the expected count

use std::cmp::Ordering;
use std::collections::BTreeSet;
use std::sync::Arc;
use tracing::{debug, info};

use crate::domain::{CrawlError, PageGap, PageIndexMapper, ProductStore, SiteMetadata};

pub struct GapDetector {
    mapper: PageIndexMapper,
    store: Arc<dyn ProductStore>,
}

impl GapDetector {
    pub fn new(mapper: PageIndexMapper, store: Arc<dyn ProductStore>) -> Self {
        Self { mapper, store }
    }

    /// Missing slots of one local page, `None` when the page is complete.
    pub async fn detect_page(
        &self,
        page_id: u32,
        site: &SiteMetadata,
    ) -> Result<Option<PageGap>, CrawlError> {
        let expected = self.mapper.expected_local_page_count(
            page_id,
            site.total_site_pages,
            site.last_page_product_count,
        );
        if expected == 0 {
            return Ok(None);
        }

        let present: BTreeSet<u32> = self
            .store
            .indices_for_page(page_id)
            .await?
            .into_iter()
            .filter(|&index| index < expected)
            .collect();

        let missing_indices: Vec<u32> = (0..expected).filter(|i| !present.contains(i)).collect();
        if missing_indices.is_empty() {
            return Ok(None);
        }

        let site_page = self
            .mapper
            .to_site_page_number(page_id, site.total_site_pages)
            .unwrap_or_default();
        debug!(
            "🕳️ Page {} (starts on site page {}) has {}/{} slots, missing {:?}",
            page_id,
            site_page,
            present.len(),
            expected,
            missing_indices
        );
        Ok(Some(PageGap {
            page_id,
            expected_count: expected,
            actual_count: present.len() as u32,
            missing_indices,
        }))
    }

    /// Gaps for every page id in `page_ids`, in input order
    pub async fn detect<I>(&self, page_ids: I, site: &SiteMetadata) -> Result<Vec<PageGap>, CrawlError>
    where
        I: IntoIterator<Item = u32>,
    {
        let mut gaps = Vec::new();
        let mut checked = 0u32;
        for page_id in page_ids {
            checked += 1;
            if let Some(gap) = self.detect_page(page_id, site).await? {
                gaps.push(gap);
            }
        }

        let missing: u32 = gaps.iter().map(PageGap::missing_count).sum();
        if gaps.is_empty() {
            info!("✅ All {} checked pages are complete", checked);
        } else {
            info!(
                "🔍 Found {} incomplete pages out of {} ({} missing slots)",
                gaps.len(),
                checked,
                missing
            );
        }
        Ok(gaps)
    }
}

/// Collection order: partially filled pages first, fewest missing slots first,
/// then ascending page id.
pub fn prioritize_gaps(gaps: &mut [PageGap]) {
    gaps.sort_by(|a, b| match (a.actual_count > 0, b.actual_count > 0) {
        (true, false) => Ordering::Less,
        (false, true) => Ordering::Greater,
        _ => a
            .missing_count()
            .cmp(&b.missing_count())
            .then(a.page_id.cmp(&b.page_id)),
    });
}

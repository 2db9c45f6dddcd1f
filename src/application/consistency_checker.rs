//! Verifies stored addresses against the current site shape

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{info, warn};

use crate::domain::{CrawlError, PageIndexMapper, PagePosition, ProductStore, SiteMetadata};

pub const DEFAULT_MAX_SAMPLES: usize = 20;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InconsistencyKind {
    /// Slot cannot exist under the current catalog shape
    OutOfRange,
    /// Reverse then forward mapping does not land on the same slot
    RoundTripMismatch,
    /// Another url already occupies the slot
    DuplicateSlot,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InconsistencySample {
    pub url: String,
    pub page_id: u32,
    pub index_in_page: u32,
    pub kind: InconsistencyKind,
    pub detail: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DataConsistencyReport {
    pub total_checked: u32,
    pub valid: u32,
    pub invalid: u32,
    pub duplicate_slots: u32,
    pub total_site_pages: u32,
    pub last_page_product_count: u32,
    pub samples: Vec<InconsistencySample>,
}

impl DataConsistencyReport {
    pub fn is_consistent(&self) -> bool {
        self.invalid == 0 && self.duplicate_slots == 0
    }
}

pub struct ConsistencyChecker {
    mapper: PageIndexMapper,
    store: Arc<dyn ProductStore>,
    max_samples: usize,
}

impl ConsistencyChecker {
    pub fn new(mapper: PageIndexMapper, store: Arc<dyn ProductStore>) -> Self {
        Self {
            mapper,
            store,
            max_samples: DEFAULT_MAX_SAMPLES,
        }
    }

    #[must_use]
    pub fn with_max_samples(mut self, max_samples: usize) -> Self {
        self.max_samples = max_samples;
        self
    }

    pub async fn check(&self, site: &SiteMetadata) -> Result<DataConsistencyReport, CrawlError> {
        let addresses = self.store.list_addresses().await?;
        let mut report = DataConsistencyReport {
            total_site_pages: site.total_site_pages,
            last_page_product_count: site.last_page_product_count,
            ..DataConsistencyReport::default()
        };
        let mut occupied: HashMap<PagePosition, String> = HashMap::with_capacity(addresses.len());

        for address in addresses {
            report.total_checked += 1;
            let position = PagePosition::new(address.page_id, address.index_in_page);

            if let Err((kind, detail)) = self.round_trip(position, site) {
                report.invalid += 1;
                self.sample(&mut report, &address.url, position, kind, detail);
                continue;
            }

            if let Some(owner) = occupied.get(&position) {
                report.duplicate_slots += 1;
                let detail = format!("slot already held by {owner}");
                self.sample(&mut report, &address.url, position, InconsistencyKind::DuplicateSlot, detail);
                continue;
            }
            occupied.insert(position, address.url);
            report.valid += 1;
        }

        if report.is_consistent() {
            info!("✅ {} stored addresses are consistent", report.total_checked);
        } else {
            warn!(
                "⚠️ Consistency check: {} invalid, {} duplicate slots out of {}",
                report.invalid, report.duplicate_slots, report.total_checked
            );
        }
        Ok(report)
    }

    fn round_trip(
        &self,
        position: PagePosition,
        site: &SiteMetadata,
    ) -> Result<(), (InconsistencyKind, String)> {
        let located = self
            .mapper
            .locate_slot(position, site.total_site_pages, site.last_page_product_count)
            .map_err(|e| (InconsistencyKind::OutOfRange, e.to_string()))?;
        let mapped = self
            .mapper
            .map_site_item(located.page_number, located.index, site)
            .map_err(|e| (InconsistencyKind::RoundTripMismatch, e.to_string()))?;
        if mapped != position {
            return Err((
                InconsistencyKind::RoundTripMismatch,
                format!(
                    "site page {} index {} maps back to ({}, {})",
                    located.page_number, located.index, mapped.page_id, mapped.index_in_page
                ),
            ));
        }
        Ok(())
    }

    fn sample(
        &self,
        report: &mut DataConsistencyReport,
        url: &str,
        position: PagePosition,
        kind: InconsistencyKind,
        detail: String,
    ) {
        if report.samples.len() < self.max_samples {
            report.samples.push(InconsistencySample {
                url: url.to_string(),
                page_id: position.page_id,
                index_in_page: position.index_in_page,
                kind,
                detail,
            });
        }
    }
}

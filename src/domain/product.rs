use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

use super::errors::PaginationError;
use super::pagination::{PageIndexMapper, PagePosition};
use super::site_metadata::SiteMetadata;

/// Row as it appears on a listing page, before it has a stable address
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawProductRecord {
    pub url: String,
    pub manufacturer: Option<String>,
    pub model: Option<String>,
    #[serde(rename = "certificateId")]
    pub certificate_id: Option<String>,
    /// 0 = newest item on the site page
    #[serde(rename = "siteIndex")]
    pub site_index: u32,
}

impl RawProductRecord {
    pub fn new(url: impl Into<String>, site_index: u32) -> Self {
        Self {
            url: url.into(),
            manufacturer: None,
            model: None,
            certificate_id: None,
            site_index,
        }
    }
}

/// Product basic information with its stable local address
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProductRecord {
    /// "p" + 4-digit page_id + "i" + 2-digit index_in_page
    pub id: String,
    pub url: String,
    pub manufacturer: Option<String>,
    pub model: Option<String>,
    #[serde(rename = "certificateId")]
    pub certificate_id: Option<String>,
    #[serde(rename = "pageId")]
    pub page_id: u32,
    #[serde(rename = "indexInPage")]
    pub index_in_page: u32,
    /// Site page the record was observed on (volatile, informational only)
    #[serde(rename = "sitePageNumber")]
    pub site_page_number: u32,
    #[serde(rename = "crawledAt")]
    pub crawled_at: DateTime<Utc>,
}

impl ProductRecord {
    pub fn format_id(position: PagePosition) -> String {
        format!("p{:04}i{:02}", position.page_id, position.index_in_page)
    }

    /// Assigns a stable address to a row fetched from `site_page_number`.
    pub fn from_raw(
        raw: RawProductRecord,
        site_page_number: u32,
        site: &SiteMetadata,
        mapper: &PageIndexMapper,
    ) -> Result<Self, PaginationError> {
        let position = mapper.map_site_item(site_page_number, raw.site_index, site)?;
        Ok(Self {
            id: Self::format_id(position),
            url: raw.url,
            manufacturer: raw.manufacturer,
            model: raw.model,
            certificate_id: raw.certificate_id,
            page_id: position.page_id,
            index_in_page: position.index_in_page,
            site_page_number,
            crawled_at: Utc::now(),
        })
    }

    pub const fn position(&self) -> PagePosition {
        PagePosition::new(self.page_id, self.index_in_page)
    }

    /// Whether persisting `self` over `stored` would change anything
    pub fn differs_from(&self, stored: &Self) -> bool {
        self.page_id != stored.page_id
            || self.index_in_page != stored.index_in_page
            || self.manufacturer != stored.manufacturer
            || self.model != stored.model
            || self.certificate_id != stored.certificate_id
    }
}

/// Appends records whose url is not already in `existing`.
///
/// Returns the number of records added. `existing` is never shrunk, so a page's
/// collected set only grows across attempts.
pub fn merge_by_url(existing: &mut Vec<ProductRecord>, incoming: Vec<ProductRecord>) -> usize {
    let mut seen: HashSet<String> = existing.iter().map(|r| r.url.clone()).collect();
    let before = existing.len();
    for record in incoming {
        if seen.insert(record.url.clone()) {
            existing.push(record);
        }
    }
    existing.len() - before
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(url: &str, page_id: u32, index: u32) -> ProductRecord {
        ProductRecord {
            id: ProductRecord::format_id(PagePosition::new(page_id, index)),
            url: url.into(),
            manufacturer: Some("Acme".into()),
            model: None,
            certificate_id: None,
            page_id,
            index_in_page: index,
            site_page_number: 1,
            crawled_at: Utc::now(),
        }
    }

    #[test]
    fn id_is_zero_padded() {
        assert_eq!(ProductRecord::format_id(PagePosition::new(7, 3)), "p0007i03");
    }

    #[test]
    fn from_raw_assigns_oldest_anchored_address() {
        let site = SiteMetadata::new(482, 4);
        let mapper = PageIndexMapper::default();
        let raw = RawProductRecord::new("https://csa-iot.org/csa_product/x/", 0);
        let rec = ProductRecord::from_raw(raw, 482, &site, &mapper).unwrap();
        assert_eq!((rec.page_id, rec.index_in_page), (0, 3));
        assert_eq!(rec.id, "p0000i03");
    }

    #[test]
    fn merge_keeps_first_occurrence() {
        let mut acc = vec![record("a", 0, 0)];
        let added = merge_by_url(&mut acc, vec![record("a", 0, 5), record("b", 0, 1), record("b", 0, 1)]);
        assert_eq!(added, 1);
        assert_eq!(acc.len(), 2);
        assert_eq!(acc[0].index_in_page, 0);
    }

    #[test]
    fn differs_from_ignores_observation_fields() {
        let a = record("a", 0, 0);
        let mut b = a.clone();
        b.site_page_number = 9;
        assert!(!b.differs_from(&a));
        b.index_in_page = 1;
        assert!(b.differs_from(&a));
    }
}

//! Matter Certis - incremental crawler for the CSA-IoT Matter product catalog
//!
//! The catalog is a newest-first paginated listing whose page numbers shift
//! every time a product is published. This crate gives every product a stable
//! local address `(page_id, index_in_page)`, crawls page ranges with a bounded
//! worker pool and retry cycles, and heals missing slots with targeted
//! re-fetches.
//!
//! Layering follows the usual split:
//! - [`domain`]: pure pagination arithmetic, records, events, collaborator traits
//! - [`application`]: crawl engine, range planning, gap detection/backfill
//! - [`infrastructure`]: config, logging, HTTP fetching, SQLite storage

pub mod application;
pub mod domain;
pub mod infrastructure;

#[cfg(any(test, feature = "test-utils"))]
pub mod test_utils;

pub use application::{
    CollectOutcome, CollectRequest, CrawlCoordinator, CrawlRangePlanner, GapCollectionResult,
    GapCollector, GapDetector, ProductListCrawler, SiteMetadataCache,
};
pub use domain::{
    CrawlError, CrawlEvent, CrawlRange, PageGap, PageIndexMapper, PageState, PageStatus,
    ProductRecord, SiteMetadata,
};

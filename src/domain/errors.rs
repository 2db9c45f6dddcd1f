//! Error taxonomy for page fetching, pagination arithmetic and crawl runs.
//!
//! 페이지 단위 실패(`PageFailure`)는 배치를 중단시키지 않고 결과에 누적된다.
//! 크롤링 자체를 중단시키는 것은 범위 준비 실패(`CrawlError`)뿐이다.

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Page-level failure classification
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PageErrorKind {
    /// Hard per-page timeout fired before the fetch finished
    Timeout,
    /// Cancelled by the shared cancellation token
    Abort,
    /// Navigation / HTTP level failure
    Navigation,
    /// DOM could not be parsed into records
    Extraction,
    /// Fetcher (browser context, HTTP client) could not be set up
    Initialization,
    Generic,
}

impl fmt::Display for PageErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::Timeout => "timeout",
            Self::Abort => "abort",
            Self::Navigation => "navigation",
            Self::Extraction => "extraction",
            Self::Initialization => "initialization",
            Self::Generic => "generic",
        };
        f.write_str(label)
    }
}

/// Error surfaced by a [`crate::domain::PageFetcher`] implementation
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("{kind} error: {message}")]
pub struct PageFetchError {
    pub kind: PageErrorKind,
    pub message: String,
}

impl PageFetchError {
    pub fn new(kind: PageErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn timeout(message: impl Into<String>) -> Self {
        Self::new(PageErrorKind::Timeout, message)
    }

    pub fn abort(message: impl Into<String>) -> Self {
        Self::new(PageErrorKind::Abort, message)
    }

    pub fn navigation(message: impl Into<String>) -> Self {
        Self::new(PageErrorKind::Navigation, message)
    }

    pub fn extraction(message: impl Into<String>) -> Self {
        Self::new(PageErrorKind::Extraction, message)
    }

    pub fn initialization(message: impl Into<String>) -> Self {
        Self::new(PageErrorKind::Initialization, message)
    }

    pub fn generic(message: impl Into<String>) -> Self {
        Self::new(PageErrorKind::Generic, message)
    }
}

/// A page that ended a crawl run as `failed` or `incomplete`
#[derive(Debug, Clone, Error, PartialEq, Eq, Serialize, Deserialize)]
#[error("page {page_number} (page_id {page_id}, attempt {attempt}) {kind}: {message}")]
pub struct PageFailure {
    pub page_id: u32,
    /// Site page number requested on the last attempt
    pub page_number: u32,
    pub attempt: u32,
    pub kind: PageErrorKind,
    pub message: String,
}

/// Invalid input to the page index arithmetic
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum PaginationError {
    #[error("page size must be greater than zero")]
    InvalidPageSize,

    #[error("catalog has no pages")]
    EmptyCatalog,

    #[error("last page product count {count} is outside 1..={page_size}")]
    InvalidLastPageCount { count: u32, page_size: u32 },

    #[error("site page {page_number} is outside 1..={total_pages}")]
    SitePageOutOfRange { page_number: u32, total_pages: u32 },

    #[error("local page id {page_id} is outside the catalog ({total_pages} pages)")]
    LocalPageOutOfRange { page_id: u32, total_pages: u32 },

    #[error("index {index} is outside page {page_number} ({capacity} items)")]
    SiteIndexOutOfRange {
        page_number: u32,
        index: u32,
        capacity: u32,
    },

    #[error("slot (page_id={page_id}, index_in_page={index_in_page}) does not exist in the catalog")]
    SlotOutOfRange { page_id: u32, index_in_page: u32 },
}

/// Datastore collaborator failure
#[derive(Debug, Clone, Error)]
pub enum StoreError {
    #[error("datastore backend error: {0}")]
    Backend(String),

    #[error("stored record is invalid: {0}")]
    InvalidRecord(String),
}

/// Hard failures of a crawl invocation
#[derive(Debug, Error)]
pub enum CrawlError {
    /// Scope of the crawl could not be determined
    #[error("crawl range could not be prepared: {0}")]
    RangePreparation(String),

    #[error("site probe failed: {0}")]
    SiteProbe(#[source] PageFetchError),

    #[error(transparent)]
    Pagination(#[from] PaginationError),

    #[error(transparent)]
    Store(#[from] StoreError),
}

//! Domain module - pagination arithmetic, records and collaborator contracts
//!
//! Nothing in here performs I/O. The crawl engine and the gap workflow in
//! `application` are written against the traits in [`repositories`].

pub mod errors;
pub mod events;
pub mod page_status;
pub mod pagination;
pub mod product;
pub mod repositories;
pub mod site_metadata;

pub use errors::{CrawlError, PageErrorKind, PageFailure, PageFetchError, PaginationError, StoreError};
pub use events::{
    CrawlEvent, CrawlProgress, CrawlStage, EventEmitter, EventReceiver, EventSender, TaskPayload,
    TaskStatus, TaskStatusEvent,
};
pub use page_status::{PageGap, PageState, PageStatus};
pub use pagination::{
    CrawlRange, DEFAULT_PRODUCTS_PER_PAGE, PageIndexMapper, PagePosition, SitePosition,
};
pub use product::{ProductRecord, RawProductRecord};
pub use repositories::{
    FetchedPage, PageFetcher, ProductStore, SiteProbe, StoredAddress, UpsertSummary,
};
pub use site_metadata::SiteMetadata;

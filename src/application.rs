//! Application layer: crawl orchestration on top of the domain contracts
//!
//! 엔진, 범위 계획, 누락 검출/재수집은 모두 `domain::repositories` 의 트레이트에만
//! 의존하므로 시뮬레이션 카탈로그로 그대로 테스트할 수 있다.

pub mod consistency_checker;
pub mod crawl_coordinator;
pub mod crawl_engine;
pub mod crawler_settings;
pub mod gap_collector;
pub mod gap_detector;
pub mod range_planner;
pub mod site_metadata;

pub use consistency_checker::{ConsistencyChecker, DataConsistencyReport, InconsistencyKind};
pub use crawl_coordinator::{CrawlCoordinator, IncrementalCrawlReport, VerificationReport};
pub use crawl_engine::{CollectOptions, CollectOutcome, CollectRequest, ProductListCrawler};
pub use crawler_settings::{CrawlerSettings, GapSettings};
pub use gap_collector::{GapCollectionResult, GapCollector};
pub use gap_detector::{GapDetector, prioritize_gaps};
pub use range_planner::CrawlRangePlanner;
pub use site_metadata::{PaginationProbe, SiteMetadataCache};

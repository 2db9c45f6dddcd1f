//! Infrastructure layer: configuration, logging, HTTP fetching and SQLite storage
//!
//! Everything here implements a `domain` trait or feeds the binary.

pub mod config; // Configuration tiers, defaults and CSA-IoT urls
pub mod database_connection;
pub mod html_parser;
pub mod http_client;
pub mod logging;
pub mod memory_store;
pub mod page_fetcher;
pub mod product_repository;

pub use config::{AppConfig, ConfigManager, csa_iot};
pub use database_connection::DatabaseConnection;
pub use html_parser::{ListPageExtractor, ListPageSelectors};
pub use http_client::{HttpClient, HttpClientConfig};
pub use logging::{get_log_directory, init_logging, init_logging_with_config};
pub use memory_store::InMemoryProductStore;
pub use page_fetcher::HttpPageFetcher;
pub use product_repository::SqliteProductRepository;

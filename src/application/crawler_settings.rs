use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::infrastructure::config::AppConfig;

/// Validated crawl settings consumed by the engine and the gap workflow
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CrawlerSettings {
    pub page_size: u32,
    /// Pages per run, 0 = whole catalog
    pub page_range_limit: u32,
    pub initial_concurrency: usize,
    pub retry_concurrency: usize,
    pub page_timeout: Duration,
    pub batch_size: usize,
    pub batch_delay: Duration,
    pub retry_delay: Duration,
    pub retry_cycles: u32,
    pub auto_add_to_local_db: bool,
    pub site_metadata_ttl: Duration,
    pub max_search_attempts: u32,
    pub gap: GapSettings,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GapSettings {
    pub batch_size: usize,
    pub concurrency: usize,
    pub batch_delay: Duration,
}

impl CrawlerSettings {
    /// Clamps user values into safe bounds
    pub fn from_app_config(config: &AppConfig) -> Self {
        let crawling = &config.user.crawling;
        let initial_concurrency = crawling.workers.list_page_max_concurrent.clamp(1, 32);

        Self {
            page_size: config.advanced.products_per_page.max(1),
            page_range_limit: crawling.page_range_limit,
            initial_concurrency,
            // 재시도는 초기 패스보다 보수적으로
            retry_concurrency: crawling.workers.retry_max_concurrent.clamp(1, initial_concurrency),
            page_timeout: Duration::from_secs(crawling.workers.request_timeout_seconds.clamp(1, 300)),
            batch_size: (config.user.batch.batch_size as usize).max(1),
            batch_delay: Duration::from_millis(config.user.batch.batch_delay_ms),
            retry_delay: Duration::from_millis(crawling.timing.retry_delay_ms),
            retry_cycles: crawling.product_list_retry_count.min(10),
            auto_add_to_local_db: crawling.auto_add_to_local_db,
            site_metadata_ttl: Duration::from_secs(config.advanced.site_metadata_ttl_seconds),
            max_search_attempts: config.advanced.max_search_attempts.max(1),
            gap: GapSettings {
                batch_size: (config.user.gap.batch_size as usize).max(1),
                concurrency: config.user.gap.concurrency.clamp(1, 16),
                batch_delay: Duration::from_millis(config.user.gap.batch_delay_ms),
            },
        }
    }
}

impl Default for CrawlerSettings {
    fn default() -> Self {
        Self::from_app_config(&AppConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn out_of_range_values_are_clamped() {
        let mut config = AppConfig::default();
        config.user.crawling.workers.list_page_max_concurrent = 0;
        config.user.crawling.workers.retry_max_concurrent = 50;
        config.user.batch.batch_size = 0;
        config.user.crawling.product_list_retry_count = 99;

        let settings = CrawlerSettings::from_app_config(&config);
        assert_eq!(settings.initial_concurrency, 1);
        assert_eq!(settings.retry_concurrency, 1);
        assert_eq!(settings.batch_size, 1);
        assert_eq!(settings.retry_cycles, 10);
    }

    #[test]
    fn defaults_follow_config_defaults() {
        let settings = CrawlerSettings::default();
        assert_eq!(settings.page_size, 12);
        assert!(settings.retry_concurrency <= settings.initial_concurrency);
    }
}

//! Persistent crawler settings
//!
//! 설정 파일은 세 구역으로 나뉜다.
//! - `user`: 사용자가 직접 조정하는 값 (페이지 예산, 동시성, 배치)
//! - `advanced`: 파일에서만 바꾸는 사이트/파서 관련 값
//! - `app_managed`: 크롤 후 앱이 기록하는 사이트 형태와 통계
//!
//! Loading goes through [`AppConfig::load_layered`] so that `MATTER_CERTIS__*`
//! environment variables can override any key without touching the file.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tokio::fs;
use tracing::{info, warn};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub user: UserConfig,
    /// Keys that are only meant to be edited by hand
    pub advanced: AdvancedConfig,
    /// Written back by the crawler after each run
    pub app_managed: AppManagedConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct UserConfig {
    /// Rate limiter spacing between two HTTP requests (ms)
    pub request_delay_ms: u64,
    /// `sqlite:` url, falls back to `<data dir>/database/matter_certis.db`
    pub database_url: Option<String>,
    pub logging: LoggingConfig,
    pub batch: BatchConfig,
    pub crawling: CrawlingConfig,
    pub gap: GapConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CrawlingConfig {
    /// 한 번의 실행에서 수집할 사이트 페이지 수 (0 이면 전체)
    pub page_range_limit: u32,
    /// Extra passes over failed or short pages after the first one
    pub product_list_retry_count: u32,
    /// When false the crawl only reports, nothing is upserted
    pub auto_add_to_local_db: bool,
    pub workers: WorkerConfig,
    pub timing: TimingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    pub list_page_max_concurrent: usize,
    /// Lower ceiling used once a page has already failed
    pub retry_max_concurrent: usize,
    pub request_timeout_seconds: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TimingConfig {
    pub retry_delay_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BatchConfig {
    /// Site pages dispatched together before the inter-batch pause
    pub batch_size: u32,
    pub batch_delay_ms: u64,
}

/// 누락 슬롯 재수집 설정
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GapConfig {
    pub batch_size: u32,
    pub concurrency: usize,
    pub batch_delay_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Base `EnvFilter` level (`trace` .. `error`)
    pub level: String,
    pub json_format: bool,
    pub console_output: bool,
    pub file_output: bool,
    /// Rotated files kept in the log directory
    pub max_files: u32,
    /// 시작 시 오래된 로그 파일 정리
    pub auto_cleanup_logs: bool,
    /// Cleanup leaves a single file behind
    pub keep_only_latest: bool,
    /// Per-target directives appended to the filter, e.g. `sqlx = warn`
    pub module_filters: HashMap<String, String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AdvancedConfig {
    /// Pagination hops the probe may take while looking for the real last page
    pub max_search_attempts: u32,
    pub products_per_page: u32,
    /// How long a probed site shape is trusted before probing again
    pub site_metadata_ttl_seconds: u64,
    pub user_agent: String,
    /// Tried in order, the first selector with matches wins
    pub product_selectors: Vec<String>,
    pub catalog: CatalogConfig,
}

/// Where the listing lives. Page `n > 1` is `{products_base}/page/{n}{query}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CatalogConfig {
    pub base_url: String,
    pub products_base: String,
    pub query: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AppManagedConfig {
    /// Total site pages seen by the latest probe, used as the next probe's start
    pub last_known_max_page: Option<u32>,
    pub last_page_product_count: Option<u32>,
    /// RFC 3339
    pub last_successful_crawl: Option<String>,
    pub last_crawl_product_count: Option<u32>,
    pub config_version: u32,
}

impl Default for UserConfig {
    fn default() -> Self {
        Self {
            request_delay_ms: defaults::REQUEST_DELAY_MS,
            database_url: None,
            logging: Default::default(),
            batch: Default::default(),
            crawling: Default::default(),
            gap: Default::default(),
        }
    }
}

impl Default for CrawlingConfig {
    fn default() -> Self {
        Self {
            page_range_limit: defaults::PAGE_RANGE_LIMIT,
            product_list_retry_count: defaults::PRODUCT_LIST_RETRY_COUNT,
            auto_add_to_local_db: defaults::AUTO_ADD_TO_LOCAL_DB,
            workers: Default::default(),
            timing: TimingConfig {
                retry_delay_ms: defaults::RETRY_DELAY_MS,
            },
        }
    }
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            list_page_max_concurrent: defaults::LIST_PAGE_MAX_CONCURRENT,
            retry_max_concurrent: defaults::RETRY_MAX_CONCURRENT,
            request_timeout_seconds: defaults::REQUEST_TIMEOUT_SECONDS,
        }
    }
}

impl Default for TimingConfig {
    fn default() -> Self {
        CrawlingConfig::default().timing
    }
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            batch_size: defaults::BATCH_SIZE,
            batch_delay_ms: defaults::BATCH_DELAY_MS,
        }
    }
}

impl Default for GapConfig {
    fn default() -> Self {
        Self {
            batch_size: defaults::GAP_BATCH_SIZE,
            concurrency: defaults::GAP_CONCURRENCY,
            batch_delay_ms: defaults::GAP_BATCH_DELAY_MS,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        let module_filters = defaults::MODULE_FILTERS
            .iter()
            .map(|&(target, level)| (target.to_owned(), level.to_owned()))
            .collect();

        Self {
            level: defaults::LOG_LEVEL.to_owned(),
            json_format: false,
            console_output: true,
            file_output: true,
            max_files: defaults::LOG_MAX_FILES,
            auto_cleanup_logs: true,
            keep_only_latest: false,
            module_filters,
        }
    }
}

impl Default for AdvancedConfig {
    fn default() -> Self {
        Self {
            max_search_attempts: defaults::MAX_SEARCH_ATTEMPTS,
            products_per_page: defaults::DEFAULT_PRODUCTS_PER_PAGE,
            site_metadata_ttl_seconds: defaults::SITE_METADATA_TTL_SECONDS,
            user_agent: defaults::USER_AGENT.to_owned(),
            product_selectors: defaults::PRODUCT_SELECTORS.iter().map(|s| s.to_string()).collect(),
            catalog: Default::default(),
        }
    }
}

impl Default for CatalogConfig {
    fn default() -> Self {
        Self {
            base_url: csa_iot::BASE_URL.to_owned(),
            products_base: csa_iot::PRODUCTS_BASE.to_owned(),
            query: csa_iot::MATTER_QUERY_PARAMS.to_owned(),
        }
    }
}

impl Default for AppManagedConfig {
    fn default() -> Self {
        Self {
            last_known_max_page: None,
            last_page_product_count: None,
            last_successful_crawl: None,
            last_crawl_product_count: None,
            config_version: CURRENT_CONFIG_VERSION,
        }
    }
}

pub const CURRENT_CONFIG_VERSION: u32 = 1;

/// `MATTER_CERTIS__USER__BATCH__BATCH_SIZE=5` overrides `user.batch.batch_size`
pub const ENV_PREFIX: &str = "MATTER_CERTIS";

impl AppConfig {
    /// Built-in defaults < JSON file (optional) < `MATTER_CERTIS__*` environment.
    pub fn load_layered(path: Option<&Path>) -> Result<Self> {
        let seed = ::config::Config::try_from(&Self::default())
            .context("Could not turn built-in defaults into a config source")?;

        let mut builder = ::config::Config::builder().add_source(seed);
        if let Some(path) = path {
            let file = ::config::File::from(path)
                .format(::config::FileFormat::Json)
                .required(false);
            builder = builder.add_source(file);
        }
        let env = ::config::Environment::with_prefix(ENV_PREFIX)
            .prefix_separator("__")
            .separator("__")
            .try_parsing(true);

        builder
            .add_source(env)
            .build()
            .context("Could not merge configuration layers")?
            .try_deserialize()
            .context("Merged configuration does not match the settings schema")
    }
}

impl CatalogConfig {
    /// Listing url of a site page. Page 1 has no `/page/` segment.
    pub fn page_url(&self, page: u32) -> String {
        match page {
            0 | 1 => format!("{}{}", self.products_base, self.query),
            n => format!("{}/page/{}{}", self.products_base, n, self.query),
        }
    }

    /// Absolute form of a product link found in listing markup
    pub fn resolve_url(&self, href: &str) -> String {
        if href.starts_with("http://") || href.starts_with("https://") {
            return href.to_owned();
        }
        let joined = url::Url::parse(&self.base_url).and_then(|base| base.join(href));
        match joined {
            Ok(absolute) => absolute.into(),
            Err(_) => {
                let base = self.base_url.trim_end_matches('/');
                format!("{}/{}", base, href.trim_start_matches('/'))
            }
        }
    }
}

/// Reads and writes the JSON settings file
pub struct ConfigManager {
    config_path: PathBuf,
}

impl ConfigManager {
    pub const APP_DIR_NAME: &'static str = "matter-certis";
    const FILE_NAME: &'static str = "matter_certis_config.json";

    pub fn get_config_dir() -> Result<PathBuf> {
        let base = dirs::config_dir().context("No per-user config directory on this platform")?;
        Ok(base.join(Self::APP_DIR_NAME))
    }

    /// Parent of the `database/` and `logs/` directories
    pub fn get_app_data_dir() -> Result<PathBuf> {
        let base = dirs::data_local_dir().context("No per-user data directory on this platform")?;
        Ok(base.join(Self::APP_DIR_NAME))
    }

    pub fn new() -> Result<Self> {
        Ok(Self::with_path(Self::get_config_dir()?.join(Self::FILE_NAME)))
    }

    pub fn with_path(config_path: impl Into<PathBuf>) -> Self {
        Self {
            config_path: config_path.into(),
        }
    }

    pub fn config_path(&self) -> &Path {
        &self.config_path
    }

    /// 설정 파일이 없으면 기본값을 쓰고 데이터 디렉터리를 만든다
    pub async fn initialize_on_first_run(&self) -> Result<AppConfig> {
        if self.config_path.exists() {
            return self.load_config().await;
        }

        info!("🆕 No settings at {}, writing defaults", self.config_path.display());
        let config = AppConfig::default();
        self.save_config(&config).await?;

        let data_dir = Self::get_app_data_dir()?;
        for sub in ["database", "logs"] {
            let dir = data_dir.join(sub);
            if dir.exists() {
                continue;
            }
            fs::create_dir_all(&dir)
                .await
                .with_context(|| format!("Could not create {}", dir.display()))?;
            info!("📁 {} ready", dir.display());
        }
        Ok(config)
    }

    /// Parses the settings file. A missing file is created from defaults and
    /// an unparsable one is moved aside to `*.json.corrupted` and replaced.
    pub async fn load_config(&self) -> Result<AppConfig> {
        if !self.config_path.exists() {
            return self.reset_to_defaults().await;
        }

        let raw = fs::read_to_string(&self.config_path)
            .await
            .with_context(|| format!("Could not read {}", self.config_path.display()))?;

        let parse_error = match serde_json::from_str::<AppConfig>(&raw) {
            Ok(mut config) => {
                self.migrate_config_if_needed(&mut config).await?;
                return Ok(config);
            }
            Err(e) => e,
        };

        warn!("⚠️ {} is not valid settings JSON: {}", self.config_path.display(), parse_error);
        let aside = self.config_path.with_extension("json.corrupted");
        if let Err(e) = fs::copy(&self.config_path, &aside).await {
            warn!("Could not keep a copy of the broken file: {}", e);
        } else {
            info!("💾 Broken settings kept at {}", aside.display());
        }
        self.reset_to_defaults().await
    }

    pub async fn save_config(&self, config: &AppConfig) -> Result<()> {
        if let Some(dir) = self.config_path.parent() {
            fs::create_dir_all(dir)
                .await
                .with_context(|| format!("Could not create {}", dir.display()))?;
        }

        let json = serde_json::to_string_pretty(config).context("Settings are not serializable")?;
        fs::write(&self.config_path, json)
            .await
            .with_context(|| format!("Could not write {}", self.config_path.display()))?;
        tracing::debug!("💾 Settings written to {}", self.config_path.display());
        Ok(())
    }

    /// Read-modify-write of the `app_managed` section
    pub async fn update_app_managed<F>(&self, updater: F) -> Result<()>
    where
        F: FnOnce(&mut AppManagedConfig),
    {
        let mut config = self.load_config().await?;
        updater(&mut config.app_managed);
        self.save_config(&config).await
    }

    pub async fn reset_to_defaults(&self) -> Result<AppConfig> {
        info!("🔄 Writing default settings to {}", self.config_path.display());
        let config = AppConfig::default();
        self.save_config(&config).await?;
        Ok(config)
    }

    /// Bumps an older `config_version`. Returns whether the file was rewritten.
    pub async fn migrate_config_if_needed(&self, config: &mut AppConfig) -> Result<bool> {
        let from = config.app_managed.config_version;
        if from >= CURRENT_CONFIG_VERSION {
            return Ok(false);
        }

        info!("⬆️ Settings v{} -> v{}", from, CURRENT_CONFIG_VERSION);
        // v0 파일에는 last_page_product_count 가 없다. serde default 로 채워진다.
        config.app_managed.config_version = CURRENT_CONFIG_VERSION;
        self.save_config(config).await?;
        Ok(true)
    }
}

/// CSA-IoT catalog location
pub mod csa_iot {
    pub const BASE_URL: &str = "https://csa-iot.org";

    pub const PRODUCTS_BASE: &str = "https://csa-iot.org/csa-iot_products";

    /// `p_type[0]=14` and `p_program_type[0]=1049` restrict the listing to Matter
    pub const MATTER_QUERY_PARAMS: &str = "/?p_keywords&p_type%5B0%5D=14&p_program_type%5B0%5D=1049&p_certificate&p_family&p_firmware_ver";
}

pub mod defaults {
    pub const REQUEST_DELAY_MS: u64 = 500;
    pub const RETRY_DELAY_MS: u64 = 2000;
    pub const MAX_SEARCH_ATTEMPTS: u32 = 10;
    pub const REQUEST_TIMEOUT_SECONDS: u64 = 30;

    /// Observed listing size on csa-iot.org
    pub const DEFAULT_PRODUCTS_PER_PAGE: u32 = 12;

    pub const SITE_METADATA_TTL_SECONDS: u64 = 3600;
    pub const USER_AGENT: &str = "Mozilla/5.0 (compatible; MatterCertis/0.3)";

    pub const LIST_PAGE_MAX_CONCURRENT: usize = 5;
    pub const RETRY_MAX_CONCURRENT: usize = 2;

    pub const PAGE_RANGE_LIMIT: u32 = 10;
    pub const PRODUCT_LIST_RETRY_COUNT: u32 = 3;
    pub const AUTO_ADD_TO_LOCAL_DB: bool = true;

    pub const BATCH_SIZE: u32 = 30;
    pub const BATCH_DELAY_MS: u64 = 1000;

    pub const GAP_BATCH_SIZE: u32 = 5;
    pub const GAP_CONCURRENCY: usize = 2;
    pub const GAP_BATCH_DELAY_MS: u64 = 1500;

    pub const LOG_LEVEL: &str = "info";
    pub const LOG_MAX_FILES: u32 = 5;
    pub const MODULE_FILTERS: &[(&str, &str)] = &[
        ("sqlx", "warn"),
        ("reqwest", "info"),
        ("hyper", "warn"),
        ("tokio", "info"),
        ("matter_certis_crawler", "info"),
    ];

    pub const PRODUCT_SELECTORS: &[&str] = &[
        "div.post-feed article.type-product",
        "article.type-product", // 레이아웃 변경 대비
    ];
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn page_url_matches_site_layout() {
        let catalog = CatalogConfig::default();
        assert_eq!(
            catalog.page_url(1),
            format!("{}{}", csa_iot::PRODUCTS_BASE, csa_iot::MATTER_QUERY_PARAMS)
        );
        assert!(catalog.page_url(7).starts_with("https://csa-iot.org/csa-iot_products/page/7/?"));
    }

    #[test]
    fn resolve_url_handles_relative_links() {
        let catalog = CatalogConfig::default();
        assert_eq!(
            catalog.resolve_url("/csa_product/abc/"),
            "https://csa-iot.org/csa_product/abc/"
        );
        assert_eq!(catalog.resolve_url("https://x.test/a"), "https://x.test/a");
    }

    #[tokio::test]
    async fn first_run_writes_defaults_and_round_trips() {
        let dir = TempDir::new().unwrap();
        let manager = ConfigManager::with_path(dir.path().join("cfg.json"));

        let mut config = manager.load_config().await.unwrap();
        assert!(manager.config_path().exists());
        assert_eq!(config.user.crawling.page_range_limit, defaults::PAGE_RANGE_LIMIT);

        config.user.batch.batch_size = 7;
        manager.save_config(&config).await.unwrap();
        manager
            .update_app_managed(|managed| managed.last_known_max_page = Some(482))
            .await
            .unwrap();

        let reloaded = manager.load_config().await.unwrap();
        assert_eq!(reloaded.user.batch.batch_size, 7);
        assert_eq!(reloaded.app_managed.last_known_max_page, Some(482));
    }

    #[tokio::test]
    async fn missing_sections_are_filled_from_defaults() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("cfg.json");
        std::fs::write(&path, r#"{"user":{"batch":{"batch_size":3}},"app_managed":{"config_version":0}}"#)
            .unwrap();

        let manager = ConfigManager::with_path(&path);
        let config = manager.load_config().await.unwrap();
        assert_eq!(config.user.batch.batch_size, 3);
        assert_eq!(config.user.batch.batch_delay_ms, defaults::BATCH_DELAY_MS);
        assert_eq!(config.user.crawling.timing.retry_delay_ms, defaults::RETRY_DELAY_MS);
        assert_eq!(config.app_managed.config_version, CURRENT_CONFIG_VERSION);
    }

    #[tokio::test]
    async fn corrupted_file_is_backed_up_and_reset() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("cfg.json");
        std::fs::write(&path, "{ not json").unwrap();

        let config = ConfigManager::with_path(&path).load_config().await.unwrap();
        assert_eq!(config.user.gap.concurrency, defaults::GAP_CONCURRENCY);
        assert!(path.with_extension("json.corrupted").exists());
    }

    #[test]
    fn layered_load_reads_file_over_defaults() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("cfg.json");
        std::fs::write(&path, r#"{"user":{"crawling":{"page_range_limit":42}}}"#).unwrap();

        let config = AppConfig::load_layered(Some(&path)).unwrap();
        assert_eq!(config.user.crawling.page_range_limit, 42);
        assert_eq!(config.advanced.products_per_page, defaults::DEFAULT_PRODUCTS_PER_PAGE);
    }
}

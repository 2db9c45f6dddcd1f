//! `matter-certis` command line entry point

use anyhow::{Context, Result};
use chrono::Utc;
use clap::{Parser, Subcommand};
use serde::Serialize;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use matter_certis_crawler::application::{
    CollectRequest, ConsistencyChecker, CrawlCoordinator, CrawlerSettings, GapDetector, PaginationProbe,
    ProductListCrawler, SiteMetadataCache, prioritize_gaps,
};
use matter_certis_crawler::domain::{
    CrawlEvent, EventEmitter, EventReceiver, PageFetcher, ProductStore, SiteMetadata, TaskStatus,
};
use matter_certis_crawler::infrastructure::logging::log_system_info;
use matter_certis_crawler::infrastructure::{
    AppConfig, ConfigManager, DatabaseConnection, HttpPageFetcher, InMemoryProductStore,
    SqliteProductRepository, get_log_directory, init_logging_with_config,
};

#[derive(Parser)]
#[command(name = "matter-certis")]
#[command(version, about = "Incremental crawler for the CSA-IoT Matter product catalog")]
struct Cli {
    /// Configuration file (defaults to the user config directory)
    #[arg(long, global = true, env = "MATTER_CERTIS_CONFIG")]
    config: Option<PathBuf>,

    /// SQLite url overriding the configured database
    #[arg(long, global = true)]
    database: Option<String>,

    /// Keep products in memory instead of the database
    #[arg(long, global = true)]
    dry_run: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Crawl unverified pages, then verify and backfill the crawled span
    Crawl {
        /// Maximum site pages to crawl (0 = whole catalog)
        #[arg(long)]
        pages: Option<u32>,

        /// Start from the oldest page instead of the first unverified one
        #[arg(long)]
        from_start: bool,
    },

    /// Report missing slots for local pages
    Gaps {
        #[arg(long)]
        from: Option<u32>,
        #[arg(long)]
        to: Option<u32>,
    },

    /// Re-fetch only the missing slots of local pages
    Backfill {
        #[arg(long)]
        from: Option<u32>,
        #[arg(long)]
        to: Option<u32>,
    },

    /// Verify stored addresses against the current site shape
    Check {
        #[arg(long, default_value_t = 20)]
        samples: usize,
    },

    /// Show the current catalog shape
    Site {
        #[arg(long)]
        refresh: bool,
    },
}

struct Runtime {
    manager: ConfigManager,
    crawler: Arc<ProductListCrawler>,
    cancel: CancellationToken,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let manager = match &cli.config {
        Some(path) => ConfigManager::with_path(path),
        None => ConfigManager::new()?,
    };
    manager.initialize_on_first_run().await?;
    let config = AppConfig::load_layered(Some(manager.config_path()))?;

    init_logging_with_config(&config.user.logging, &get_log_directory())?;
    log_system_info();

    let cancel = CancellationToken::new();
    let ctrl_c = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("🛑 Ctrl-C received, stopping after in-flight pages");
            ctrl_c.cancel();
        }
    });

    let (events, receiver) = EventEmitter::channel();
    let drain = tokio::spawn(drain_events(receiver));

    let store = open_store(&cli, &config).await?;
    let crawler = Arc::new(build_crawler(&config, store, &cancel, events)?);
    let runtime = Runtime {
        manager,
        crawler,
        cancel,
    };

    let result = run_command(cli.command, &runtime).await;
    drop(runtime);
    // 모든 송신측이 사라지면 드레인 태스크도 끝난다
    let _ = tokio::time::timeout(Duration::from_secs(1), drain).await;
    result
}

async fn open_store(cli: &Cli, config: &AppConfig) -> Result<Arc<dyn ProductStore>> {
    if cli.dry_run {
        info!("🧪 Dry run: products are kept in memory");
        return Ok(Arc::new(InMemoryProductStore::new()));
    }

    let url = match cli.database.clone().or_else(|| config.user.database_url.clone()) {
        Some(url) => url,
        None => DatabaseConnection::default_database_url()?,
    };
    info!("🗄️ Using database {}", url);
    let db = DatabaseConnection::new(&url).await?;
    db.migrate().await?;
    Ok(Arc::new(SqliteProductRepository::new(db.pool().clone())))
}

fn build_crawler(
    config: &AppConfig,
    store: Arc<dyn ProductStore>,
    cancel: &CancellationToken,
    events: EventEmitter,
) -> Result<ProductListCrawler> {
    let settings = CrawlerSettings::from_app_config(config);
    let fetcher: Arc<dyn PageFetcher> =
        Arc::new(HttpPageFetcher::from_config(config)?.with_shutdown(cancel.clone()));

    let probe = PaginationProbe::new(
        Arc::clone(&fetcher),
        settings.page_size,
        settings.max_search_attempts,
        settings.page_timeout,
    )
    .with_start_page(config.app_managed.last_known_max_page);
    let site_cache = Arc::new(SiteMetadataCache::new(
        Arc::new(probe),
        settings.site_metadata_ttl,
        settings.page_size,
    ));

    Ok(ProductListCrawler::new(fetcher, store, site_cache, settings)?.with_events(events))
}

async fn run_command(command: Command, rt: &Runtime) -> Result<()> {
    let crawler = &rt.crawler;
    match command {
        Command::Crawl { pages, from_start } => {
            let page_limit = pages.unwrap_or(crawler.settings().page_range_limit);
            if from_start {
                let outcome = crawler
                    .collect(CollectRequest::Latest { page_limit }, &rt.cancel)
                    .await?;
                remember_site(rt, &outcome.site, outcome.save_summary.map(|s| s.written())).await;
                print_json(&outcome)?;
            } else {
                let report = CrawlCoordinator::new(Arc::clone(crawler))
                    .run_incremental(page_limit, &rt.cancel)
                    .await?;
                let written = report.crawl.save_summary.map(|s| s.written());
                remember_site(rt, &report.crawl.site, written).await;
                print_json(&report)?;
            }
        }
        Command::Gaps { from, to } => {
            let site = crawler.site_cache().resolve(false).await?;
            let detector = GapDetector::new(*crawler.mapper(), Arc::clone(crawler.store()));
            let mut gaps = detector.detect(page_span(&site, from, to), &site).await?;
            prioritize_gaps(&mut gaps);
            print_json(&gaps)?;
        }
        Command::Backfill { from, to } => {
            let site = crawler.site_cache().resolve(false).await?;
            let report = CrawlCoordinator::new(Arc::clone(crawler))
                .verify_and_backfill(page_span(&site, from, to), &rt.cancel)
                .await?;
            print_json(&report)?;
        }
        Command::Check { samples } => {
            let site = crawler.site_cache().resolve(false).await?;
            let report = ConsistencyChecker::new(*crawler.mapper(), Arc::clone(crawler.store()))
                .with_max_samples(samples)
                .check(&site)
                .await?;
            print_json(&report)?;
        }
        Command::Site { refresh } => {
            let site = crawler.site_cache().resolve(refresh).await?;
            remember_site(rt, &site, None).await;
            print_json(&site)?;
        }
    }
    Ok(())
}

/// Local page ids `from..=to`, clamped to the catalog
fn page_span(site: &SiteMetadata, from: Option<u32>, to: Option<u32>) -> std::ops::RangeInclusive<u32> {
    let last = site.total_site_pages.saturating_sub(1);
    from.unwrap_or(0).min(last)..=to.unwrap_or(last).min(last)
}

/// Persists the observed site shape so the next probe starts near the end
async fn remember_site(rt: &Runtime, site: &SiteMetadata, written: Option<u32>) {
    let site = site.clone();
    let result = rt
        .manager
        .update_app_managed(move |managed| {
            managed.last_known_max_page = Some(site.total_site_pages);
            managed.last_page_product_count = Some(site.last_page_product_count);
            if let Some(written) = written {
                managed.last_successful_crawl = Some(Utc::now().to_rfc3339());
                managed.last_crawl_product_count = Some(written);
            }
        })
        .await;
    if let Err(e) = result {
        warn!("⚠️ Failed to persist site state: {:#}", e);
    }
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    let json = serde_json::to_string_pretty(value).context("Failed to serialize result")?;
    println!("{json}");
    Ok(())
}

async fn drain_events(mut receiver: EventReceiver) {
    while let Some(event) = receiver.recv().await {
        match event {
            CrawlEvent::Progress(progress) => {
                info!(
                    "📊 [{}] {}/{} pages ({:.1}%), retry cycle {}{}",
                    progress.stage,
                    progress.processed_successfully,
                    progress.total_pages,
                    progress.percentage(),
                    progress.retry_cycle,
                    if progress.stage_complete { ", complete" } else { "" }
                );
            }
            CrawlEvent::Task(task) => match task.status {
                TaskStatus::Error | TaskStatus::Stopped => {
                    warn!("❌ {} {}: {}", task.task_id, task.payload.url, task.message);
                }
                _ => debug!("{} {:?}: {}", task.task_id, task.status, task.message),
            },
        }
    }
}

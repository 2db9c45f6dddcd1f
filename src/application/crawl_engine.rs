//! Bounded concurrent crawl engine for product list pages
//!
//! 페이지 상태 머신: `waiting → attempting → {success | incomplete | failed}`.
//! `incomplete`/`failed` 페이지만 재시도 사이클에서 다시 `attempting` 으로 들어가고,
//! `success` 는 종료 상태다.
//!
//! 상태 테이블과 페이지별 레코드 캐시는 조정 태스크가 소유한다. 워커는 자기
//! 페이지 캐시의 스냅샷을 받아 병합한 결과를 돌려준다.

use chrono::Utc;
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::application::crawler_settings::CrawlerSettings;
use crate::application::range_planner::CrawlRangePlanner;
use crate::application::site_metadata::SiteMetadataCache;
use crate::domain::product::merge_by_url;
use crate::domain::{
    CrawlError, CrawlProgress, CrawlRange, CrawlStage, EventEmitter, PageErrorKind, PageFailure,
    PageFetchError, PageFetcher, PageIndexMapper, PagePosition, PageState, PageStatus,
    ProductRecord, ProductStore, SiteMetadata, TaskPayload, TaskStatus, UpsertSummary,
};

/// What a `collect()` call should fetch
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CollectRequest {
    /// Range from local page 0, bounded by `page_limit` (0 = whole catalog)
    Latest { page_limit: u32 },
    /// Range from the first not-yet-verified local page in the store
    Incremental { page_limit: u32 },
    Range(CrawlRange),
    /// Narrowed crawl: only the listed slots are kept, fetched from the site
    /// pages that currently hold them
    Targeted(Vec<PagePosition>),
}

/// Per-invocation knobs; defaults come from [`CrawlerSettings`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CollectOptions {
    pub stage: CrawlStage,
    pub initial_concurrency: usize,
    pub retry_concurrency: usize,
    pub batch_size: usize,
    pub batch_delay: Duration,
    /// Hand the final list to the store
    pub persist: bool,
}

impl CollectOptions {
    pub fn from_settings(settings: &CrawlerSettings) -> Self {
        Self {
            stage: CrawlStage::ProductList,
            initial_concurrency: settings.initial_concurrency.max(1),
            retry_concurrency: settings.retry_concurrency.max(1),
            batch_size: settings.batch_size.max(1),
            batch_delay: settings.batch_delay,
            persist: settings.auto_add_to_local_db,
        }
    }

    /// Gap backfill runs through the same engine with its own batching and no auto-save
    pub fn for_gap_collection(settings: &CrawlerSettings) -> Self {
        let concurrency = settings.gap.concurrency.max(1);
        Self {
            stage: CrawlStage::GapCollection,
            initial_concurrency: concurrency,
            retry_concurrency: settings.retry_concurrency.clamp(1, concurrency),
            batch_size: settings.gap.batch_size.max(1),
            batch_delay: settings.gap.batch_delay,
            persist: false,
        }
    }
}

/// Result of one `collect()` invocation
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CollectOutcome {
    pub session_id: String,
    /// Sorted by `(page_id, index_in_page)`, unique by url
    pub records: Vec<ProductRecord>,
    pub page_statuses: Vec<PageStatus>,
    /// Pages that ended `failed` or `incomplete`
    pub failures: Vec<PageFailure>,
    pub cancelled: bool,
    pub retry_cycles_run: u32,
    pub range: Option<CrawlRange>,
    pub site: SiteMetadata,
    pub save_summary: Option<UpsertSummary>,
    pub save_error: Option<String>,
    pub elapsed: Duration,
}

impl CollectOutcome {
    pub fn success_pages(&self) -> usize {
        self.page_statuses
            .iter()
            .filter(|s| s.state == PageState::Success)
            .count()
    }

    pub fn is_complete(&self) -> bool {
        !self.cancelled && self.failures.is_empty()
    }
}

#[derive(Debug, Clone)]
struct PageTask {
    /// Table key: local page id of the site page at plan time
    page_id: u32,
    site_page_number: u32,
    target: u32,
    filter: Option<BTreeSet<PagePosition>>,
}

/// Shared, read-only input of every worker in one invocation
struct WorkerContext {
    fetcher: Arc<dyn PageFetcher>,
    mapper: PageIndexMapper,
    site: SiteMetadata,
    timeout: Duration,
    events: EventEmitter,
    stage: CrawlStage,
    cancel: CancellationToken,
}

struct RunState {
    tasks: BTreeMap<u32, PageTask>,
    /// Dispatch order of the planned tasks (priority order for targeted runs)
    order: Vec<u32>,
    statuses: BTreeMap<u32, PageStatus>,
    cache: HashMap<u32, Vec<ProductRecord>>,
}

impl RunState {
    fn new(tasks: Vec<PageTask>) -> Self {
        let order = tasks.iter().map(|t| t.page_id).collect();
        let statuses = tasks
            .iter()
            .map(|t| {
                (
                    t.page_id,
                    PageStatus::waiting(t.page_id, t.site_page_number, t.target),
                )
            })
            .collect();
        Self {
            tasks: tasks.into_iter().map(|t| (t.page_id, t)).collect(),
            order,
            statuses,
            cache: HashMap::new(),
        }
    }

    fn apply(&mut self, page_id: u32, attempt: u32, result: Result<Vec<ProductRecord>, PageFetchError>) {
        let Some(status) = self.statuses.get_mut(&page_id) else {
            return;
        };
        status.attempt = attempt;
        match result {
            Ok(merged) => {
                status.collected = merged.len() as u32;
                status.error_kind = None;
                status.error = None;
                status.state = if status.collected >= status.target {
                    PageState::Success
                } else {
                    PageState::Incomplete
                };
                self.cache.insert(page_id, merged);
            }
            Err(e) => {
                status.state = PageState::Failed;
                status.error_kind = Some(e.kind);
                status.error = Some(e.message);
            }
        }
    }

    fn pending_retry(&self) -> Vec<u32> {
        self.order
            .iter()
            .copied()
            .filter(|id| self.statuses.get(id).is_some_and(|s| s.state.needs_retry()))
            .collect()
    }

    /// Every page that has not settled yet fails with `error`
    fn fail_unsettled(&mut self, error: &PageFetchError) {
        for status in self.statuses.values_mut() {
            if status.state.is_settled() {
                continue;
            }
            status.state = PageState::Failed;
            status.error_kind = Some(error.kind);
            status.error = Some(error.message.clone());
        }
    }

    fn success_count(&self) -> u32 {
        self.statuses
            .values()
            .filter(|s| s.state == PageState::Success)
            .count() as u32
    }

    fn failures(&self) -> Vec<PageFailure> {
        self.statuses
            .values()
            .filter(|s| s.state.needs_retry())
            .map(|s| PageFailure {
                page_id: s.page_id,
                page_number: s.page_number,
                attempt: s.attempt,
                kind: s.error_kind.unwrap_or(PageErrorKind::Extraction),
                message: s.error.clone().unwrap_or_else(|| {
                    format!("incomplete: {} of {} records", s.collected, s.target)
                }),
            })
            .collect()
    }

    /// Flattened result. After cancellation only `success` pages contribute.
    fn assemble(&self, cancelled: bool) -> Vec<ProductRecord> {
        let mut records: Vec<ProductRecord> = self
            .statuses
            .values()
            .filter(|s| !cancelled || s.state == PageState::Success)
            .filter_map(|s| self.cache.get(&s.page_id))
            .flatten()
            .cloned()
            .collect();
        records.sort_by_key(ProductRecord::position);
        let mut seen = HashSet::new();
        records.retain(|r| seen.insert(r.url.clone()));
        records
    }
}

/// Crawls list pages with a bounded worker pool and retry cycles
pub struct ProductListCrawler {
    fetcher: Arc<dyn PageFetcher>,
    store: Arc<dyn ProductStore>,
    site_cache: Arc<SiteMetadataCache>,
    mapper: PageIndexMapper,
    settings: CrawlerSettings,
    events: EventEmitter,
}

impl ProductListCrawler {
    pub fn new(
        fetcher: Arc<dyn PageFetcher>,
        store: Arc<dyn ProductStore>,
        site_cache: Arc<SiteMetadataCache>,
        settings: CrawlerSettings,
    ) -> Result<Self, CrawlError> {
        let mapper = PageIndexMapper::new(settings.page_size)?;
        Ok(Self {
            fetcher,
            store,
            site_cache,
            mapper,
            settings,
            events: EventEmitter::disabled(),
        })
    }

    #[must_use]
    pub fn with_events(mut self, events: EventEmitter) -> Self {
        self.events = events;
        self
    }

    pub const fn settings(&self) -> &CrawlerSettings {
        &self.settings
    }

    pub const fn mapper(&self) -> &PageIndexMapper {
        &self.mapper
    }

    pub fn site_cache(&self) -> &Arc<SiteMetadataCache> {
        &self.site_cache
    }

    pub fn store(&self) -> &Arc<dyn ProductStore> {
        &self.store
    }

    pub async fn collect(
        &self,
        request: CollectRequest,
        cancel: &CancellationToken,
    ) -> Result<CollectOutcome, CrawlError> {
        self.collect_with(request, &CollectOptions::from_settings(&self.settings), cancel)
            .await
    }

    pub async fn collect_with(
        &self,
        request: CollectRequest,
        options: &CollectOptions,
        cancel: &CancellationToken,
    ) -> Result<CollectOutcome, CrawlError> {
        let started = Instant::now();
        let session_id = uuid::Uuid::new_v4().to_string();

        let site = self
            .site_cache
            .resolve(false)
            .await
            .map_err(|e| CrawlError::RangePreparation(e.to_string()))?;
        let (range, tasks) = self
            .plan_tasks(request, &site)
            .await
            .map_err(|e| CrawlError::RangePreparation(e.to_string()))?;

        info!(
            "🚀 [{}] Collecting {} pages (stage: {}, concurrency {}/{})",
            session_id,
            tasks.len(),
            options.stage,
            options.initial_concurrency,
            options.retry_concurrency
        );

        let mut state = RunState::new(tasks);
        let mut cancelled = false;
        let mut retry_cycles_run = 0;

        if !state.tasks.is_empty() {
            if let Err(e) = self.fetcher.open().await {
                // 초기화 실패는 이번 호출의 모든 페이지에 대한 페이지 단위 실패다
                error!("❌ Page fetcher could not be opened: {}", e);
                let failure = PageFetchError::initialization(format!("fetcher initialization failed: {}", e.message));
                for status in state.statuses.values_mut() {
                    status.attempt = 1;
                }
                state.fail_unsettled(&failure);
                return Ok(self.finish(state, session_id, range, site, false, 0, options, started).await);
            }

            let ctx = Arc::new(WorkerContext {
                fetcher: Arc::clone(&self.fetcher),
                mapper: self.mapper,
                site: site.clone(),
                timeout: self.settings.page_timeout,
                events: self.events.clone(),
                stage: options.stage,
                cancel: cancel.clone(),
            });
            let stage_started_at = Utc::now();
            self.emit_progress(&state, &session_id, options.stage, 0, stage_started_at, false);

            let initial = state.order.clone();
            cancelled = self
                .run_pass(&mut state, &ctx, &initial, options.initial_concurrency, 1, options, &session_id, 0, stage_started_at)
                .await;

            for cycle in 1..=self.settings.retry_cycles {
                if cancelled {
                    break;
                }
                let pending = state.pending_retry();
                if pending.is_empty() {
                    break;
                }

                if !self.settings.retry_delay.is_zero() {
                    tokio::select! {
                        () = tokio::time::sleep(self.settings.retry_delay) => {},
                        () = cancel.cancelled() => {
                            cancelled = true;
                            break;
                        }
                    }
                }

                info!(
                    "🔄 Retry cycle {}/{}: {} pages",
                    cycle,
                    self.settings.retry_cycles,
                    pending.len()
                );
                retry_cycles_run = cycle;
                cancelled = self
                    .run_pass(&mut state, &ctx, &pending, options.retry_concurrency, cycle + 1, options, &session_id, cycle, stage_started_at)
                    .await;
            }

            self.fetcher.close().await;
            if cancelled {
                state.fail_unsettled(&PageFetchError::abort("cancelled before the page finished"));
            }
            self.emit_progress(&state, &session_id, options.stage, retry_cycles_run, stage_started_at, true);
        }

        Ok(self
            .finish(state, session_id, range, site, cancelled, retry_cycles_run, options, started)
            .await)
    }

    /// Flattens the run, saves it when asked and builds the outcome
    #[allow(clippy::too_many_arguments)]
    async fn finish(
        &self,
        state: RunState,
        session_id: String,
        range: Option<CrawlRange>,
        site: SiteMetadata,
        cancelled: bool,
        retry_cycles_run: u32,
        options: &CollectOptions,
        started: Instant,
    ) -> CollectOutcome {
        let records = state.assemble(cancelled);
        let failures = state.failures();
        if cancelled {
            warn!(
                "🛑 Crawl cancelled: keeping {} records from {} completed pages",
                records.len(),
                state.success_count()
            );
        } else if !failures.is_empty() {
            warn!("⚠️ {} pages still failed or incomplete after retries", failures.len());
            for failure in &failures {
                debug!("   {}", failure);
            }
        }

        let (save_summary, save_error) = if options.persist && !records.is_empty() {
            match self.store.upsert(&records).await {
                Ok(summary) => {
                    info!(
                        "💾 Saved products: {} new, {} updated, {} unchanged",
                        summary.added, summary.updated, summary.unchanged
                    );
                    (Some(summary), None)
                }
                Err(e) => {
                    error!("❌ Failed to save crawled products: {}", e);
                    (None, Some(e.to_string()))
                }
            }
        } else {
            (None, None)
        };

        let elapsed = started.elapsed();
        info!(
            "🏁 [{}] Done in {:?}: {} records, {}/{} pages succeeded",
            session_id,
            elapsed,
            records.len(),
            state.success_count(),
            state.statuses.len()
        );

        CollectOutcome {
            session_id,
            records,
            page_statuses: state.statuses.into_values().collect(),
            failures,
            cancelled,
            retry_cycles_run,
            range,
            site,
            save_summary,
            save_error,
            elapsed,
        }
    }

    async fn plan_tasks(
        &self,
        request: CollectRequest,
        site: &SiteMetadata,
    ) -> Result<(Option<CrawlRange>, Vec<PageTask>), CrawlError> {
        let total = site.total_site_pages;
        let last = site.last_page_product_count;

        let range = match request {
            CollectRequest::Latest { page_limit } => {
                Some(self.mapper.calculate_crawling_range(total, last, page_limit)?)
            }
            CollectRequest::Incremental { page_limit } => {
                CrawlRangePlanner::new(self.mapper, Arc::clone(&self.store))
                    .plan(site, page_limit)
                    .await?
            }
            CollectRequest::Range(range) => Some(range),
            CollectRequest::Targeted(targets) => {
                return Ok((None, self.targeted_tasks(targets, site)?));
            }
        };

        let Some(range) = range else {
            return Ok((None, Vec::new()));
        };

        let tasks = range
            .site_pages()
            .map(|site_page_number| -> Result<PageTask, CrawlError> {
                Ok(PageTask {
                    page_id: self.mapper.to_local_page_id(site_page_number, total)?,
                    site_page_number,
                    target: self.mapper.expected_site_page_count(site_page_number, total, last)?,
                    filter: None,
                })
            })
            .collect::<Result<Vec<_>, CrawlError>>()?;
        Ok((Some(range), tasks))
    }

    /// One task per site page holding any of `slots`, in order of first appearance
    fn targeted_tasks(
        &self,
        slots: Vec<PagePosition>,
        site: &SiteMetadata,
    ) -> Result<Vec<PageTask>, CrawlError> {
        let mut by_site_page: Vec<(u32, BTreeSet<PagePosition>)> = Vec::new();
        for slot in slots {
            let located = match self.mapper.locate_slot(slot, site.total_site_pages, site.last_page_product_count) {
                Ok(located) => located,
                Err(e) => {
                    warn!("⚠️ Skipping slot {:?}: {}", slot, e);
                    continue;
                }
            };
            match by_site_page.iter_mut().find(|(page, _)| *page == located.page_number) {
                Some((_, group)) => {
                    group.insert(slot);
                }
                None => by_site_page.push((located.page_number, BTreeSet::from([slot]))),
            }
        }

        by_site_page
            .into_iter()
            .map(|(site_page_number, slots)| -> Result<PageTask, CrawlError> {
                Ok(PageTask {
                    page_id: self
                        .mapper
                        .to_local_page_id(site_page_number, site.total_site_pages)?,
                    site_page_number,
                    target: slots.len() as u32,
                    filter: Some(slots),
                })
            })
            .collect()
    }

    /// Runs one pass over `page_ids` in batches. Returns true when cancelled.
    #[allow(clippy::too_many_arguments)]
    async fn run_pass(
        &self,
        state: &mut RunState,
        ctx: &Arc<WorkerContext>,
        page_ids: &[u32],
        concurrency: usize,
        attempt: u32,
        options: &CollectOptions,
        session_id: &str,
        cycle: u32,
        stage_started_at: chrono::DateTime<Utc>,
    ) -> bool {
        let semaphore = Arc::new(Semaphore::new(concurrency.max(1)));
        let batch_count = page_ids.len().div_ceil(options.batch_size);

        for (batch_index, batch) in page_ids.chunks(options.batch_size).enumerate() {
            if ctx.cancel.is_cancelled() {
                return true;
            }
            if batch_index > 0 && !options.batch_delay.is_zero() {
                tokio::select! {
                    () = tokio::time::sleep(options.batch_delay) => {},
                    () = ctx.cancel.cancelled() => return true,
                }
            }
            debug!(
                "📦 Batch {}/{} (attempt {}): {} pages",
                batch_index + 1,
                batch_count,
                attempt,
                batch.len()
            );

            let mut ids = Vec::with_capacity(batch.len());
            let mut joins = Vec::with_capacity(batch.len());
            for page_id in batch {
                let Some(task) = state.tasks.get(page_id).cloned() else {
                    continue;
                };
                if let Some(status) = state.statuses.get_mut(page_id) {
                    status.state = PageState::Attempting;
                    status.page_number = task.site_page_number;
                }
                let cached = state.cache.get(page_id).cloned().unwrap_or_default();
                let ctx = Arc::clone(ctx);
                let semaphore = Arc::clone(&semaphore);
                ids.push(*page_id);
                joins.push(tokio::spawn(async move {
                    let Ok(_permit) = semaphore.acquire_owned().await else {
                        return Err(PageFetchError::abort("worker pool closed"));
                    };
                    fetch_and_merge(&ctx, &task, attempt, cached).await
                }));
            }

            let results = join_all(joins).await;

            for (page_id, joined) in ids.into_iter().zip(results) {
                let result = joined.unwrap_or_else(|join_error| {
                    Err(PageFetchError::generic(format!("worker task failed: {join_error}")))
                });
                state.apply(page_id, attempt, result);
            }

            self.emit_progress(state, session_id, options.stage, cycle, stage_started_at, false);
        }

        ctx.cancel.is_cancelled()
    }

    fn emit_progress(
        &self,
        state: &RunState,
        session_id: &str,
        stage: CrawlStage,
        retry_cycle: u32,
        stage_started_at: chrono::DateTime<Utc>,
        stage_complete: bool,
    ) {
        if !self.events.is_enabled() {
            return;
        }
        self.events.progress(CrawlProgress {
            session_id: Some(session_id.to_string()),
            stage,
            processed_successfully: state.success_count(),
            total_pages: state.statuses.len() as u32,
            page_statuses: state.statuses.values().cloned().collect(),
            retry_cycle,
            stage_started_at,
            stage_complete,
        });
    }
}

/// Fetch one site page, map to stable addresses, filter and merge with the cached partial
async fn fetch_and_merge(
    ctx: &WorkerContext,
    task: &PageTask,
    attempt: u32,
    mut cached: Vec<ProductRecord>,
) -> Result<Vec<ProductRecord>, PageFetchError> {
    let url = ctx.fetcher.page_url(task.site_page_number);
    let mut payload = TaskPayload {
        stage: ctx.stage,
        page_id: task.page_id,
        page_number: task.site_page_number,
        url,
        attempt,
        started_at: Utc::now(),
        finished_at: None,
        error: None,
    };
    ctx.events
        .task(TaskStatus::Running, format!("page {} attempt {}", task.site_page_number, attempt), payload.clone());

    let fetched = tokio::select! {
        biased;
        () = ctx.cancel.cancelled() => Err(PageFetchError::abort(format!(
            "cancelled while fetching page {}", task.site_page_number
        ))),
        result = tokio::time::timeout(ctx.timeout, ctx.fetcher.fetch_page(task.site_page_number, ctx.timeout)) => {
            result.unwrap_or_else(|_| Err(PageFetchError::timeout(format!(
                "page {} exceeded {:?}", task.site_page_number, ctx.timeout
            ))))
        }
    };

    payload.finished_at = Some(Utc::now());
    let page = match fetched {
        Ok(page) => page,
        Err(e) => {
            let status = if e.kind == PageErrorKind::Abort {
                TaskStatus::Stopped
            } else {
                TaskStatus::Error
            };
            payload.error = Some(e.to_string());
            ctx.events.task(status, e.to_string(), payload);
            return Err(e);
        }
    };

    let mut mapped = Vec::with_capacity(page.records.len());
    for raw in page.records {
        match ProductRecord::from_raw(raw, task.site_page_number, &ctx.site, &ctx.mapper) {
            Ok(record) => mapped.push(record),
            Err(e) => debug!("Dropping unmappable record on page {}: {}", task.site_page_number, e),
        }
    }
    if let Some(filter) = &task.filter {
        mapped.retain(|r| filter.contains(&r.position()));
    }

    let added = merge_by_url(&mut cached, mapped);
    ctx.events.task(
        TaskStatus::Success,
        format!("{} records ({} new) of {}", cached.len(), added, task.target),
        payload,
    );
    Ok(cached)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::CrawlEvent;
    use crate::infrastructure::InMemoryProductStore;
    use crate::test_utils::{SimulatedCatalog, build_crawler, fast_settings};

    #[tokio::test]
    async fn scenario_first_three_pages() {
        // pageSize=12, last=5, total=10, limit=3
        let catalog = Arc::new(SimulatedCatalog::with_products(113));
        let store = Arc::new(InMemoryProductStore::new());
        let crawler = build_crawler(&catalog, &store, fast_settings());

        let outcome = crawler
            .collect(CollectRequest::Latest { page_limit: 3 }, &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(outcome.page_statuses.len(), 3);
        assert_eq!(outcome.success_pages(), 3);
        assert_eq!(outcome.page_statuses[0].target, 5);
        assert_eq!(outcome.page_statuses[0].page_number, 10);
        // 5 + 12 + 12 oldest products
        assert_eq!(outcome.records.len(), 29);
        assert!(outcome.records.windows(2).all(|w| w[0].position() < w[1].position()));
        assert_eq!(outcome.records[0].url, catalog.product_url(0));
        assert_eq!(outcome.records[0].position(), PagePosition::new(0, 0));
        assert_eq!(store.count().await.unwrap(), 29);
        let mut log = catalog.fetch_log();
        log.sort_unstable();
        assert_eq!(log, vec![8, 9, 10]);
    }

    #[tokio::test]
    async fn failed_pages_are_retried_and_successes_not_refetched() {
        let catalog = Arc::new(SimulatedCatalog::with_products(113));
        catalog.fail_page(9, 1, PageErrorKind::Navigation);
        let store = Arc::new(InMemoryProductStore::new());
        let crawler = build_crawler(&catalog, &store, fast_settings());

        let outcome = crawler
            .collect(CollectRequest::Latest { page_limit: 3 }, &CancellationToken::new())
            .await
            .unwrap();

        assert!(outcome.is_complete());
        assert_eq!(outcome.retry_cycles_run, 1);
        assert_eq!(catalog.fetch_count(10), 1);
        assert_eq!(catalog.fetch_count(9), 2);
        let page9 = outcome.page_statuses.iter().find(|s| s.page_number == 9).unwrap();
        assert_eq!(page9.attempt, 2);
    }

    #[tokio::test]
    async fn partial_pages_merge_without_shrinking() {
        let catalog = Arc::new(SimulatedCatalog::with_products(113));
        // first attempt returns 4 items, second only 2, third the full page
        catalog.truncate_page(8, &[4, 2]);
        let store = Arc::new(InMemoryProductStore::new());
        let crawler = build_crawler(&catalog, &store, fast_settings());

        let outcome = crawler
            .collect(CollectRequest::Latest { page_limit: 3 }, &CancellationToken::new())
            .await
            .unwrap();

        let page8 = outcome.page_statuses.iter().find(|s| s.page_number == 8).unwrap();
        assert_eq!(page8.state, PageState::Success);
        assert_eq!(page8.attempt, 3);
        assert_eq!(page8.collected, 12);
        assert_eq!(outcome.records.len(), 29);
    }

    #[tokio::test]
    async fn exhausted_retries_keep_partial_records_and_itemize_failures() {
        let catalog = Arc::new(SimulatedCatalog::with_products(113));
        catalog.truncate_page(8, &[3, 3, 3, 3, 3, 3]);
        catalog.fail_page(9, 10, PageErrorKind::Timeout);
        let store = Arc::new(InMemoryProductStore::new());
        let mut settings = fast_settings();
        settings.retry_cycles = 2;
        let crawler = build_crawler(&catalog, &store, settings);

        let outcome = crawler
            .collect(CollectRequest::Latest { page_limit: 3 }, &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(outcome.retry_cycles_run, 2);
        assert_eq!(outcome.failures.len(), 2);
        let timeout = outcome.failures.iter().find(|f| f.page_number == 9).unwrap();
        assert_eq!(timeout.kind, PageErrorKind::Timeout);
        assert_eq!(timeout.attempt, 3);
        // page 10 (5) + partial page 8 (3)
        assert_eq!(outcome.records.len(), 8);
    }

    #[tokio::test]
    async fn slow_page_hits_hard_timeout() {
        let catalog = Arc::new(SimulatedCatalog::with_products(24));
        catalog.set_delay(Duration::from_millis(300));
        let store = Arc::new(InMemoryProductStore::new());
        let mut settings = fast_settings();
        settings.page_timeout = Duration::from_millis(50);
        settings.retry_cycles = 0;
        let crawler = build_crawler(&catalog, &store, settings);

        let outcome = crawler
            .collect(CollectRequest::Latest { page_limit: 1 }, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(outcome.failures[0].kind, PageErrorKind::Timeout);
        assert!(outcome.records.is_empty());
    }

    #[tokio::test]
    async fn cancellation_keeps_only_successful_pages() {
        let catalog = Arc::new(SimulatedCatalog::with_products(12 * 6));
        let store = Arc::new(InMemoryProductStore::new());
        let mut settings = fast_settings();
        settings.batch_size = 2;
        settings.batch_delay = Duration::from_millis(400);
        let crawler = build_crawler(&catalog, &store, settings);

        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            trigger.cancel();
        });

        let outcome = crawler
            .collect(CollectRequest::Latest { page_limit: 6 }, &cancel)
            .await
            .unwrap();

        assert!(outcome.cancelled);
        assert_eq!(outcome.success_pages(), 2);
        assert_eq!(outcome.records.len(), 24);
        assert_eq!(store.count().await.unwrap(), 24);
        // pages that never started are itemized as aborted
        assert_eq!(outcome.failures.len(), 4);
        assert!(outcome.failures.iter().all(|f| f.kind == PageErrorKind::Abort));
        assert!(outcome
            .page_statuses
            .iter()
            .filter(|s| s.state != PageState::Success)
            .all(|s| s.state == PageState::Failed));
    }

    #[tokio::test]
    async fn fetcher_open_failure_fails_pages_instead_of_aborting() {
        let catalog = Arc::new(SimulatedCatalog::with_products(113));
        catalog.script_opens(&[false]);
        let store = Arc::new(InMemoryProductStore::new());
        let crawler = build_crawler(&catalog, &store, fast_settings());

        let outcome = crawler
            .collect(CollectRequest::Latest { page_limit: 3 }, &CancellationToken::new())
            .await
            .unwrap();

        assert!(!outcome.cancelled);
        assert!(outcome.records.is_empty());
        assert_eq!(outcome.failures.len(), 3);
        assert!(outcome.failures.iter().all(|f| f.kind == PageErrorKind::Initialization));
        assert!(catalog.fetch_log().is_empty());
        assert_eq!(store.count().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn targeted_pages_are_fetched_in_request_order() {
        let catalog = Arc::new(SimulatedCatalog::with_products(113));
        let store = Arc::new(InMemoryProductStore::new());
        let mut settings = fast_settings();
        settings.auto_add_to_local_db = false;
        settings.initial_concurrency = 1;
        let crawler = build_crawler(&catalog, &store, settings);

        // local page 6 first, then local page 3
        let request = CollectRequest::Targeted(vec![PagePosition::new(6, 9), PagePosition::new(3, 0)]);
        let outcome = crawler.collect(request, &CancellationToken::new()).await.unwrap();

        let site = &outcome.site;
        let m = crawler.mapper();
        let first = m
            .locate_slot(PagePosition::new(6, 9), site.total_site_pages, site.last_page_product_count)
            .unwrap();
        let second = m
            .locate_slot(PagePosition::new(3, 0), site.total_site_pages, site.last_page_product_count)
            .unwrap();
        assert!(first.page_number < second.page_number);
        assert_eq!(catalog.fetch_log(), vec![first.page_number, second.page_number]);
        assert_eq!(outcome.records.len(), 2);
    }

    #[tokio::test]
    async fn recrawl_is_idempotent() {
        let catalog = Arc::new(SimulatedCatalog::with_products(113));
        let store = Arc::new(InMemoryProductStore::new());
        let crawler = build_crawler(&catalog, &store, fast_settings());
        let cancel = CancellationToken::new();

        crawler.collect(CollectRequest::Latest { page_limit: 0 }, &cancel).await.unwrap();
        let before = store.snapshot().await;
        let second = crawler.collect(CollectRequest::Latest { page_limit: 0 }, &cancel).await.unwrap();

        let summary = second.save_summary.unwrap();
        assert_eq!((summary.added, summary.updated), (0, 0));
        assert_eq!(summary.unchanged, 113);
        let after = store.snapshot().await;
        assert_eq!(
            before.iter().map(|r| (&r.url, r.position())).collect::<Vec<_>>(),
            after.iter().map(|r| (&r.url, r.position())).collect::<Vec<_>>()
        );
    }

    #[tokio::test]
    async fn addresses_survive_publication_between_crawls() {
        let catalog = Arc::new(SimulatedCatalog::with_products(113));
        let store = Arc::new(InMemoryProductStore::new());
        let crawler = build_crawler(&catalog, &store, fast_settings());
        let cancel = CancellationToken::new();

        crawler.collect(CollectRequest::Latest { page_limit: 0 }, &cancel).await.unwrap();
        let before = store.snapshot().await;

        catalog.publish(17);
        crawler.site_cache().invalidate().await;
        let outcome = crawler.collect(CollectRequest::Latest { page_limit: 0 }, &cancel).await.unwrap();

        assert_eq!(outcome.site.total_site_pages, 11);
        let summary = outcome.save_summary.unwrap();
        assert_eq!(summary.added, 17);
        assert_eq!(summary.updated, 0);
        let after = store.snapshot().await;
        for record in &before {
            let same = after.iter().find(|r| r.url == record.url).unwrap();
            assert_eq!(same.position(), record.position());
        }
    }

    #[tokio::test]
    async fn targeted_request_keeps_only_filtered_slots() {
        let catalog = Arc::new(SimulatedCatalog::with_products(113));
        let store = Arc::new(InMemoryProductStore::new());
        let mut settings = fast_settings();
        settings.auto_add_to_local_db = false;
        let crawler = build_crawler(&catalog, &store, settings);

        // local page 0: slot 4 lives on site page 10, slot 6 on site page 9
        let request = CollectRequest::Targeted(vec![PagePosition::new(0, 4), PagePosition::new(0, 6)]);
        let outcome = crawler.collect(request, &CancellationToken::new()).await.unwrap();

        assert_eq!(outcome.records.len(), 2);
        assert_eq!(outcome.records[0].position(), PagePosition::new(0, 4));
        assert_eq!(outcome.records[1].url, catalog.product_url(6));
        assert_eq!(outcome.page_statuses.len(), 2);
        assert!(outcome.page_statuses.iter().all(|s| s.target == 1));
        assert!(outcome.save_summary.is_none());
        assert_eq!(store.count().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn progress_and_task_events_are_emitted() {
        let catalog = Arc::new(SimulatedCatalog::with_products(30));
        let store = Arc::new(InMemoryProductStore::new());
        let (events, mut rx) = EventEmitter::channel();
        let crawler = build_crawler(&catalog, &store, fast_settings()).with_events(events);

        crawler
            .collect(CollectRequest::Latest { page_limit: 0 }, &CancellationToken::new())
            .await
            .unwrap();
        drop(crawler);

        let mut tasks = 0;
        let mut last_progress = None;
        while let Ok(event) = rx.try_recv() {
            match event {
                CrawlEvent::Task(_) => tasks += 1,
                CrawlEvent::Progress(p) => last_progress = Some(p),
            }
        }
        // running + success for each of 3 pages
        assert_eq!(tasks, 6);
        let last = last_progress.unwrap();
        assert!(last.stage_complete);
        assert_eq!(last.processed_successfully, 3);
    }

    #[tokio::test]
    async fn probe_failure_aborts_with_range_preparation() {
        let catalog = Arc::new(SimulatedCatalog::with_products(0));
        let store = Arc::new(InMemoryProductStore::new());
        let crawler = build_crawler(&catalog, &store, fast_settings());

        let err = crawler
            .collect(CollectRequest::Latest { page_limit: 1 }, &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, CrawlError::RangePreparation(_)));
    }
}

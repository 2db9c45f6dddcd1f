//! `PageFetcher` over plain HTTP + DOM extraction

use async_trait::async_trait;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::domain::{FetchedPage, PageFetchError, PageFetcher};
use crate::infrastructure::config::{AppConfig, CatalogConfig};
use crate::infrastructure::html_parser::{ListPageExtractor, ListPageSelectors};
use crate::infrastructure::http_client::{
    HttpClient, HttpClientConfig, HttpStatusError, RequestCancelled,
};

pub struct HttpPageFetcher {
    client: HttpClient,
    extractor: ListPageExtractor,
    catalog: CatalogConfig,
    /// Process-wide shutdown; in-flight requests stop at the next await point
    shutdown: CancellationToken,
}

impl HttpPageFetcher {
    pub fn new(
        client: HttpClient,
        extractor: ListPageExtractor,
        catalog: CatalogConfig,
    ) -> Self {
        Self {
            client,
            extractor,
            catalog,
            shutdown: CancellationToken::new(),
        }
    }

    #[must_use]
    pub fn with_shutdown(mut self, shutdown: CancellationToken) -> Self {
        self.shutdown = shutdown;
        self
    }

    pub fn from_config(config: &AppConfig) -> anyhow::Result<Self> {
        let client = HttpClient::new(HttpClientConfig {
            user_agent: config.advanced.user_agent.clone(),
            timeout_seconds: config.user.crawling.workers.request_timeout_seconds,
            request_interval_ms: config.user.request_delay_ms,
            follow_redirects: true,
        })?;
        let selectors = ListPageSelectors {
            product_container: config.advanced.product_selectors.clone(),
            ..ListPageSelectors::default()
        };
        let catalog = config.advanced.catalog.clone();
        let extractor = ListPageExtractor::new(&selectors, catalog.clone())?;
        Ok(Self::new(client, extractor, catalog))
    }
}

/// Maps transport errors onto the page failure taxonomy
fn classify(error: &anyhow::Error) -> PageFetchError {
    let message = format!("{error:#}");
    if error.downcast_ref::<RequestCancelled>().is_some() {
        return PageFetchError::abort(message);
    }
    if error.downcast_ref::<HttpStatusError>().is_some() {
        return PageFetchError::navigation(message);
    }
    match error.downcast_ref::<reqwest::Error>() {
        Some(e) if e.is_timeout() => PageFetchError::timeout(message),
        Some(e) if e.is_builder() => PageFetchError::initialization(message),
        Some(_) => PageFetchError::navigation(message),
        None => PageFetchError::generic(message),
    }
}

#[async_trait]
impl PageFetcher for HttpPageFetcher {
    async fn open(&self) -> Result<(), PageFetchError> {
        if self.shutdown.is_cancelled() {
            return Err(PageFetchError::initialization("shutdown already requested"));
        }
        info!("🌐 HTTP page fetcher ready ({})", self.catalog.products_base);
        Ok(())
    }

    fn page_url(&self, page_number: u32) -> String {
        self.catalog.page_url(page_number)
    }

    async fn fetch_page(
        &self,
        page_number: u32,
        timeout: Duration,
    ) -> Result<FetchedPage, PageFetchError> {
        let url = self.page_url(page_number);
        let html = tokio::time::timeout(
            timeout,
            self.client.get_text_with_cancellation(&url, &self.shutdown),
        )
        .await
        .map_err(|_| PageFetchError::timeout(format!("no response within {timeout:?}: {url}")))?
        .map_err(|e| classify(&e))?;

        if !html.to_ascii_lowercase().contains("<html") {
            return Err(PageFetchError::extraction(format!(
                "response is not an HTML document: {url}"
            )));
        }

        let content = self.extractor.extract(&html);
        debug!(
            "📄 Page {} → {} records (max page in pagination: {:?})",
            page_number,
            content.records.len(),
            content.max_page_in_pagination
        );

        Ok(FetchedPage {
            page_number,
            records: content.records,
            max_page_in_pagination: content.max_page_in_pagination,
        })
    }

    async fn close(&self) {
        debug!("HTTP page fetcher released");
    }
}

//! reqwest client shared by every listing worker
//!
//! 모든 요청은 하나의 `governor` 리미터를 거치므로 워커 수와 무관하게 사이트에
//! 가해지는 요청 간격은 `request_interval_ms` 이상으로 유지된다.

use anyhow::{Context, Result};
use governor::{
    Quota, RateLimiter,
    clock::DefaultClock,
    state::{InMemoryState, direct::NotKeyed},
};
use reqwest::{
    Client,
    header::{ACCEPT, HeaderMap, HeaderValue, USER_AGENT},
    redirect::Policy,
};
use std::future::Future;
use std::num::NonZeroU32;
use std::time::Duration;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::infrastructure::config::defaults;

/// The shutdown token fired before the body was read
#[derive(Debug, Error)]
#[error("request cancelled: {0}")]
pub struct RequestCancelled(pub String);

#[derive(Debug, Error)]
#[error("{url} answered HTTP {status}")]
pub struct HttpStatusError {
    pub status: u16,
    pub url: String,
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct HttpClientConfig {
    pub user_agent: String,
    pub timeout_seconds: u64,
    pub request_interval_ms: u64,
    pub follow_redirects: bool,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            user_agent: defaults::USER_AGENT.to_owned(),
            timeout_seconds: defaults::REQUEST_TIMEOUT_SECONDS,
            request_interval_ms: defaults::REQUEST_DELAY_MS,
            follow_redirects: true,
        }
    }
}

type DirectLimiter = RateLimiter<NotKeyed, InMemoryState, DefaultClock>;

pub struct HttpClient {
    client: Client,
    limiter: DirectLimiter,
    config: HttpClientConfig,
}

impl HttpClient {
    pub fn new(config: HttpClientConfig) -> Result<Self> {
        let agent = HeaderValue::from_str(&config.user_agent)
            .with_context(|| format!("User agent '{}' is not a valid header", config.user_agent))?;
        let headers = HeaderMap::from_iter([
            (USER_AGENT, agent),
            (ACCEPT, HeaderValue::from_static("text/html,application/xhtml+xml")),
        ]);
        let redirects = if config.follow_redirects {
            Policy::limited(10)
        } else {
            Policy::none()
        };

        let client = Client::builder()
            .default_headers(headers)
            .timeout(Duration::from_secs(config.timeout_seconds))
            .redirect(redirects)
            .cookie_store(true)
            .gzip(true)
            .brotli(true)
            .build()
            .context("reqwest client could not be built")?;

        // 버스트 1: 동시에 깨어난 워커도 한 간격에 하나씩만 통과
        let period = Duration::from_millis(config.request_interval_ms.max(1));
        let quota = Quota::with_period(period)
            .context("Zero request interval")?
            .allow_burst(NonZeroU32::MIN);

        Ok(Self {
            client,
            limiter: RateLimiter::direct(quota),
            config,
        })
    }

    pub const fn config(&self) -> &HttpClientConfig {
        &self.config
    }

    /// GET `url` and return the body. Every await point (rate limiter, send,
    /// body) also watches `cancel` and yields [`RequestCancelled`] when it fires.
    pub async fn get_text_with_cancellation(&self, url: &str, cancel: &CancellationToken) -> Result<String> {
        if cancel.is_cancelled() {
            return Err(RequestCancelled(url.to_owned()).into());
        }

        race(cancel, url, "waiting for rate limiter", self.limiter.until_ready()).await?;
        debug!("🌐 GET {}", url);

        let response = race(cancel, url, "sending", self.client.get(url).send())
            .await?
            .with_context(|| format!("GET {url} failed"))?;

        let status = response.status();
        if !status.is_success() {
            return Err(HttpStatusError {
                status: status.as_u16(),
                url: url.to_owned(),
            }
            .into());
        }

        let body = race(cancel, url, "reading body", response.text())
            .await?
            .with_context(|| format!("Body of {url} could not be read"))?;
        debug!("📄 {} -> {} bytes", url, body.len());
        Ok(body)
    }
}

async fn race<F: Future>(
    cancel: &CancellationToken,
    url: &str,
    stage: &str,
    work: F,
) -> Result<F::Output, RequestCancelled> {
    tokio::select! {
        output = work => Ok(output),
        () = cancel.cancelled() => {
            warn!("🛑 Cancelled while {} {}", stage, url);
            Err(RequestCancelled(format!("{stage} {url}")))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builds_with_defaults() {
        let client = HttpClient::new(HttpClientConfig::default()).unwrap();
        assert_eq!(client.config().timeout_seconds, defaults::REQUEST_TIMEOUT_SECONDS);
    }

    #[test]
    fn rejects_header_breaking_user_agent() {
        let config = HttpClientConfig {
            user_agent: "bad\nagent".into(),
            ..HttpClientConfig::default()
        };
        assert!(HttpClient::new(config).is_err());
    }

    #[tokio::test]
    async fn cancelled_token_short_circuits() {
        let client = HttpClient::new(HttpClientConfig::default()).unwrap();
        let token = CancellationToken::new();
        token.cancel();

        let err = client
            .get_text_with_cancellation("http://127.0.0.1:9/never", &token)
            .await
            .unwrap_err();
        assert!(err.downcast_ref::<RequestCancelled>().is_some());
    }
}

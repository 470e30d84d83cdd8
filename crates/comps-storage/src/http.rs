//! Outbound HTTP with bounded retry/backoff, global concurrency and per-adapter pacing.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use reqwest::StatusCode;
use thiserror::Error;
use tokio::sync::{Mutex, Semaphore};
use tokio::time::Instant;
use tracing::{debug, info_span, Instrument};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDisposition {
    Retryable,
    NonRetryable,
}

pub fn classify_status(status: StatusCode) -> RetryDisposition {
    if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

pub fn classify_reqwest_error(err: &reqwest::Error) -> RetryDisposition {
    if err.is_timeout() || err.is_connect() || err.is_request() {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BackoffPolicy {
    pub max_retries: usize,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(250),
            max_delay: Duration::from_secs(5),
        }
    }
}

impl BackoffPolicy {
    pub fn none() -> Self {
        Self {
            max_retries: 0,
            ..Default::default()
        }
    }

    pub fn delay_for_attempt(&self, attempt_index: usize) -> Duration {
        let factor = 1u32.checked_shl(attempt_index as u32).unwrap_or(u32::MAX);
        let delay = self.base_delay.saturating_mul(factor);
        delay.min(self.max_delay)
    }
}

/// Runs `op` until it succeeds, fails with a non-retryable error, or the policy's
/// retries are spent. `op` receives the zero-based attempt index.
pub async fn retry_with_backoff<T, E, Op, Fut, C>(
    policy: &BackoffPolicy,
    classify: C,
    mut op: Op,
) -> Result<T, E>
where
    Op: FnMut(usize) -> Fut,
    Fut: Future<Output = Result<T, E>>,
    C: Fn(&E) -> RetryDisposition,
{
    let mut attempt = 0usize;
    loop {
        match op(attempt).await {
            Ok(value) => return Ok(value),
            Err(err) => {
                if classify(&err) == RetryDisposition::Retryable && attempt < policy.max_retries {
                    let delay = policy.delay_for_attempt(attempt);
                    debug!(attempt, delay_ms = delay.as_millis() as u64, "retrying after transient failure");
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                    continue;
                }
                return Err(err);
            }
        }
    }
}

/// Minimum spacing between consecutive outbound calls made by one adapter.
#[derive(Debug)]
pub struct RequestPacer {
    min_interval: Duration,
    last_call: Mutex<Option<Instant>>,
}

impl RequestPacer {
    pub fn new(min_interval: Duration) -> Self {
        Self {
            min_interval,
            last_call: Mutex::new(None),
        }
    }

    pub fn min_interval(&self) -> Duration {
        self.min_interval
    }

    pub async fn wait_turn(&self) {
        let mut last = self.last_call.lock().await;
        if let Some(previous) = *last {
            let elapsed = previous.elapsed();
            if elapsed < self.min_interval {
                tokio::time::sleep(self.min_interval - elapsed).await;
            }
        }
        *last = Some(Instant::now());
    }
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
    pub global_concurrency: usize,
    pub backoff: BackoffPolicy,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(20),
            user_agent: None,
            global_concurrency: 16,
            backoff: BackoffPolicy::default(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct FetchedResponse {
    pub status: StatusCode,
    pub final_url: String,
    pub body: Vec<u8>,
}

impl FetchedResponse {
    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
    #[error("response from {url} is not valid JSON: {reason}")]
    InvalidJson { url: String, reason: String },
    #[error("http client is shut down")]
    Closed,
}

pub fn classify_fetch_error(err: &FetchError) -> RetryDisposition {
    match err {
        FetchError::Request(e) => classify_reqwest_error(e),
        FetchError::HttpStatus { status, .. } => StatusCode::from_u16(*status)
            .map(classify_status)
            .unwrap_or(RetryDisposition::NonRetryable),
        FetchError::InvalidJson { .. } | FetchError::Closed => RetryDisposition::NonRetryable,
    }
}

/// Shared reqwest client. Adapters own their own pacing and retry policy.
#[derive(Debug)]
pub struct HttpFetcher {
    client: reqwest::Client,
    global_limit: Arc<Semaphore>,
    backoff: BackoffPolicy,
}

impl HttpFetcher {
    pub fn new(config: HttpClientConfig) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout);

        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }

        let client = builder.build().context("building reqwest client")?;

        Ok(Self {
            client,
            global_limit: Arc::new(Semaphore::new(config.global_concurrency.max(1))),
            backoff: config.backoff,
        })
    }

    pub fn default_backoff(&self) -> BackoffPolicy {
        self.backoff
    }

    pub async fn get(
        &self,
        source: &str,
        url: &str,
        backoff: Option<&BackoffPolicy>,
    ) -> Result<FetchedResponse, FetchError> {
        self.execute(source, url, backoff, |client| client.get(url))
            .await
    }

    pub async fn get_text(
        &self,
        source: &str,
        url: &str,
        backoff: Option<&BackoffPolicy>,
    ) -> Result<String, FetchError> {
        Ok(self.get(source, url, backoff).await?.text())
    }

    pub async fn post_json(
        &self,
        source: &str,
        url: &str,
        body: &serde_json::Value,
        bearer: Option<&str>,
        backoff: Option<&BackoffPolicy>,
    ) -> Result<serde_json::Value, FetchError> {
        let response = self
            .execute(source, url, backoff, |client| {
                let request = client.post(url).json(body);
                match bearer {
                    Some(token) => request.bearer_auth(token),
                    None => request,
                }
            })
            .await?;
        serde_json::from_slice(&response.body).map_err(|e| FetchError::InvalidJson {
            url: response.final_url.clone(),
            reason: e.to_string(),
        })
    }

    async fn execute<B>(
        &self,
        source: &str,
        url: &str,
        backoff: Option<&BackoffPolicy>,
        build: B,
    ) -> Result<FetchedResponse, FetchError>
    where
        B: Fn(&reqwest::Client) -> reqwest::RequestBuilder,
    {
        let _permit = self
            .global_limit
            .acquire()
            .await
            .map_err(|_| FetchError::Closed)?;
        let policy = backoff.copied().unwrap_or(self.backoff);
        let span = info_span!("http_fetch", source, url);

        retry_with_backoff(&policy, classify_fetch_error, |_attempt| {
            send_once(build(&self.client))
        })
        .instrument(span)
        .await
    }
}

async fn send_once(request: reqwest::RequestBuilder) -> Result<FetchedResponse, FetchError> {
    let resp = request.send().await?;
    let status = resp.status();
    let final_url = resp.url().to_string();
    if !status.is_success() {
        return Err(FetchError::HttpStatus {
            status: status.as_u16(),
            url: final_url,
        });
    }
    let body = resp.bytes().await?.to_vec();
    Ok(FetchedResponse {
        status,
        final_url,
        body,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Debug, PartialEq)]
    enum FakeError {
        Transient,
        Fatal,
    }

    fn classify_fake(err: &FakeError) -> RetryDisposition {
        match err {
            FakeError::Transient => RetryDisposition::Retryable,
            FakeError::Fatal => RetryDisposition::NonRetryable,
        }
    }

    #[test]
    fn backoff_logic_is_exponential_and_capped() {
        let policy = BackoffPolicy {
            max_retries: 5,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(350),
        };

        assert_eq!(policy.delay_for_attempt(0), Duration::from_millis(100));
        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(200));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_millis(350));
        assert_eq!(policy.delay_for_attempt(5), Duration::from_millis(350));
        assert_eq!(policy.delay_for_attempt(64), Duration::from_millis(350));
    }

    #[tokio::test(start_paused = true)]
    async fn retry_recovers_from_transient_failures() {
        let calls = AtomicUsize::new(0);
        let policy = BackoffPolicy::default();
        let result = retry_with_backoff(&policy, classify_fake, |attempt| {
            calls.fetch_add(1, Ordering::SeqCst);
            async move {
                if attempt < 2 {
                    Err(FakeError::Transient)
                } else {
                    Ok(attempt)
                }
            }
        })
        .await;
        assert_eq!(result, Ok(2));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn retry_stops_on_fatal_error_and_when_budget_is_spent() {
        let calls = AtomicUsize::new(0);
        let result: Result<(), FakeError> =
            retry_with_backoff(&BackoffPolicy::default(), classify_fake, |_| {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err(FakeError::Fatal) }
            })
            .await;
        assert_eq!(result, Err(FakeError::Fatal));
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        let calls = AtomicUsize::new(0);
        let policy = BackoffPolicy {
            max_retries: 2,
            ..Default::default()
        };
        let result: Result<(), FakeError> = retry_with_backoff(&policy, classify_fake, |_| {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(FakeError::Transient) }
        })
        .await;
        assert_eq!(result, Err(FakeError::Transient));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn pacer_spaces_consecutive_calls() {
        let pacer = RequestPacer::new(Duration::from_millis(500));
        let start = Instant::now();
        pacer.wait_turn().await;
        assert!(start.elapsed() < Duration::from_millis(500));
        pacer.wait_turn().await;
        assert!(start.elapsed() >= Duration::from_millis(500));
    }

    #[test]
    fn status_classification_matches_retry_policy() {
        assert_eq!(classify_status(StatusCode::BAD_GATEWAY), RetryDisposition::Retryable);
        assert_eq!(classify_status(StatusCode::TOO_MANY_REQUESTS), RetryDisposition::Retryable);
        assert_eq!(classify_status(StatusCode::UNAUTHORIZED), RetryDisposition::NonRetryable);
        let err = FetchError::HttpStatus {
            status: 503,
            url: "http://x".into(),
        };
        assert_eq!(classify_fetch_error(&err), RetryDisposition::Retryable);
    }
}

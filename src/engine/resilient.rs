// HTTP client guarded by a circuit breaker with bounded retries

//! # Resilient HTTP Client
//!
//! [`ResilientClient`] puts every outbound request behind one
//! [`CircuitBreaker`]. Inside a single breaker call it may retry, but only for
//! idempotent methods and only for transport errors or 5xx answers. However
//! many attempts happen, the breaker sees exactly one outcome per request.
//!
//! Status handling:
//! - 2xx: success
//! - 4xx: the request itself is wrong; not retried, not a breaker failure
//! - 5xx: upstream fault; retried when allowed, then surfaced as
//!   [`KainosError::Upstream`] and counted as a breaker failure

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue, AUTHORIZATION};
use reqwest::Method;
use serde::{de::DeserializeOwned, Serialize};
use tracing::{debug, warn};

use super::breaker::{CircuitBreaker, Counts, State};
use crate::{KainosError, Result};

/// Retry schedule applied inside one breaker call
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Total attempts, including the first one
    pub max_attempts: u32,
    pub initial_wait: Duration,
    pub max_wait: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_wait: Duration::from_secs(1),
            max_wait: Duration::from_secs(5),
        }
    }
}

impl RetryPolicy {
    pub fn none() -> Self {
        Self {
            max_attempts: 1,
            ..Default::default()
        }
    }

    /// Wait before the attempt following attempt number `attempt` (1-based)
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
        self.initial_wait
            .checked_mul(factor)
            .unwrap_or(self.max_wait)
            .min(self.max_wait)
    }
}

/// Methods safe to send more than once
pub fn is_idempotent(method: &Method) -> bool {
    matches!(
        *method,
        Method::GET | Method::HEAD | Method::PUT | Method::DELETE | Method::OPTIONS
    )
}

/// Status and body of a completed exchange
#[derive(Debug, Clone)]
pub struct HttpResponse {
    pub status: u16,
    pub body: Bytes,
}

impl HttpResponse {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    fn body_text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }

    /// Turn 4xx answers into typed errors
    pub fn error_for_status(self) -> Result<Self> {
        match self.status {
            200..=399 => Ok(self),
            401 | 403 => Err(KainosError::Unauthorized(self.body_text())),
            404 => Err(KainosError::NotFound(self.body_text())),
            409 => Err(KainosError::Conflict(self.body_text())),
            400..=499 => Err(KainosError::InvalidInput(format!(
                "upstream rejected request ({}): {}",
                self.status,
                self.body_text()
            ))),
            status => Err(KainosError::Upstream {
                status,
                body: self.body_text(),
            }),
        }
    }

    pub fn json<T: DeserializeOwned>(&self) -> Result<T> {
        Ok(serde_json::from_slice(&self.body)?)
    }
}

/// Breaker-gated HTTP client
///
/// ## Rust Learning Notes:
///
/// ### Cheap clones
/// `reqwest::Client` is an `Arc` internally and the breaker is shared through
/// an `Arc`, so cloning a `ResilientClient` shares both the connection pool
/// and the breaker state.
#[derive(Debug, Clone)]
pub struct ResilientClient {
    http: reqwest::Client,
    breaker: Arc<CircuitBreaker>,
    retry: RetryPolicy,
    base_url: Option<String>,
    headers: HeaderMap,
}

impl ResilientClient {
    /// Client with a per-request timeout and the default retry policy
    pub fn new(breaker: Arc<CircuitBreaker>, timeout: Duration) -> Result<Self> {
        let http = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self::from_client(http, breaker))
    }

    pub fn from_client(http: reqwest::Client, breaker: Arc<CircuitBreaker>) -> Self {
        Self {
            http,
            breaker,
            retry: RetryPolicy::default(),
            base_url: None,
            headers: HeaderMap::new(),
        }
    }

    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Prefix for relative paths passed to the request helpers
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = Some(base_url.into().trim_end_matches('/').to_string());
        self
    }

    /// Header sent with every request
    pub fn with_header(mut self, name: &str, value: &str) -> Result<Self> {
        let name = HeaderName::from_bytes(name.as_bytes())
            .map_err(|e| KainosError::InvalidInput(format!("bad header name '{}': {}", name, e)))?;
        let value = HeaderValue::from_str(value)
            .map_err(|e| KainosError::InvalidInput(format!("bad header value: {}", e)))?;
        self.headers.insert(name, value);
        Ok(self)
    }

    pub fn with_bearer_token(self, token: &str) -> Result<Self> {
        self.with_header(AUTHORIZATION.as_str(), &format!("Bearer {}", token))
    }

    pub fn breaker(&self) -> &Arc<CircuitBreaker> {
        &self.breaker
    }

    pub fn state(&self) -> State {
        self.breaker.state()
    }

    pub fn counts(&self) -> Counts {
        self.breaker.counts()
    }

    fn url(&self, path: &str) -> String {
        match &self.base_url {
            Some(base) if !path.starts_with("http://") && !path.starts_with("https://") => {
                format!("{}/{}", base, path.trim_start_matches('/'))
            }
            _ => path.to_string(),
        }
    }

    /// Perform one request as one breaker outcome
    pub async fn execute<B: Serialize + ?Sized>(
        &self,
        method: Method,
        path: &str,
        body: Option<&B>,
    ) -> Result<HttpResponse> {
        let url = self.url(path);
        let max_attempts = if is_idempotent(&method) {
            self.retry.max_attempts.max(1)
        } else {
            1
        };

        let outcome = self
            .breaker
            .execute(|| async {
                let mut attempt = 0;
                loop {
                    attempt += 1;
                    let error = match self.send_once(&method, &url, body).await {
                        Ok(response) if response.status < 500 => return Ok(response),
                        Ok(response) => KainosError::Upstream {
                            status: response.status,
                            body: response.body_text(),
                        },
                        Err(e) => e,
                    };

                    if attempt >= max_attempts {
                        warn!(
                            "❌ {} {} failed after {} attempt(s): {}",
                            method, url, attempt, error
                        );
                        return Err(error);
                    }

                    let wait = self.retry.backoff(attempt);
                    debug!(
                        "🔄 {} {} attempt {} failed ({}), retrying in {:?}",
                        method, url, attempt, error, wait
                    );
                    tokio::time::sleep(wait).await;
                }
            })
            .await;

        outcome.map_err(KainosError::from)
    }

    async fn send_once<B: Serialize + ?Sized>(
        &self,
        method: &Method,
        url: &str,
        body: Option<&B>,
    ) -> Result<HttpResponse> {
        let mut request = self
            .http
            .request(method.clone(), url)
            .headers(self.headers.clone());
        if let Some(body) = body {
            request = request.json(body);
        }
        let response = request.send().await?;
        let status = response.status().as_u16();
        let body = response.bytes().await?;
        Ok(HttpResponse { status, body })
    }

    pub async fn get_json<T: DeserializeOwned>(&self, path: &str) -> Result<T> {
        self.execute::<()>(Method::GET, path, None)
            .await?
            .error_for_status()?
            .json()
    }

    pub async fn post_json<B, T>(&self, path: &str, body: &B) -> Result<T>
    where
        B: Serialize + ?Sized,
        T: DeserializeOwned,
    {
        self.execute(Method::POST, path, Some(body))
            .await?
            .error_for_status()?
            .json()
    }

    pub async fn put_json<B, T>(&self, path: &str, body: &B) -> Result<T>
    where
        B: Serialize + ?Sized,
        T: DeserializeOwned,
    {
        self.execute(Method::PUT, path, Some(body))
            .await?
            .error_for_status()?
            .json()
    }

    pub async fn delete(&self, path: &str) -> Result<HttpResponse> {
        self.execute::<()>(Method::DELETE, path, None)
            .await?
            .error_for_status()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::breaker::BreakerSettings;
    use axum::{extract::State as AxumState, http::StatusCode, routing::get, Json, Router};
    use std::net::{SocketAddr, TcpListener};
    use std::sync::atomic::{AtomicU32, Ordering};

    async fn spawn_server(router: Router) -> SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let server = axum::Server::from_tcp(listener)
            .unwrap()
            .serve(router.into_make_service());
        tokio::spawn(server);
        addr
    }

    fn client(addr: SocketAddr, breaker: Arc<CircuitBreaker>) -> ResilientClient {
        ResilientClient::new(breaker, Duration::from_secs(5))
            .unwrap()
            .with_base_url(format!("http://{}", addr))
            .with_retry_policy(RetryPolicy {
                max_attempts: 3,
                initial_wait: Duration::from_millis(5),
                max_wait: Duration::from_millis(20),
            })
    }

    fn failing_router(hits: Arc<AtomicU32>) -> Router {
        async fn unavailable(AxumState(hits): AxumState<Arc<AtomicU32>>) -> StatusCode {
            hits.fetch_add(1, Ordering::SeqCst);
            StatusCode::SERVICE_UNAVAILABLE
        }
        Router::new()
            .route("/flaky", get(unavailable).post(unavailable))
            .with_state(hits)
    }

    #[test]
    fn test_backoff_doubles_and_caps() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.backoff(1), Duration::from_secs(1));
        assert_eq!(policy.backoff(2), Duration::from_secs(2));
        assert_eq!(policy.backoff(3), Duration::from_secs(4));
        assert_eq!(policy.backoff(4), Duration::from_secs(5));
        assert_eq!(policy.backoff(40), Duration::from_secs(5));
    }

    #[test]
    fn test_idempotent_methods() {
        assert!(is_idempotent(&Method::GET));
        assert!(is_idempotent(&Method::PUT));
        assert!(!is_idempotent(&Method::POST));
        assert!(!is_idempotent(&Method::PATCH));
    }

    #[tokio::test]
    async fn test_get_json_success() {
        let router = Router::new().route(
            "/agents/ping",
            get(|| async { Json(serde_json::json!({"ok": true})) }),
        );
        let addr = spawn_server(router).await;
        let breaker = Arc::new(CircuitBreaker::new(BreakerSettings::new("ping")));
        let client = client(addr, breaker);

        let value: serde_json::Value = client.get_json("/agents/ping").await.unwrap();
        assert_eq!(value["ok"], true);
        assert_eq!(client.counts().total_successes, 1);
    }

    #[tokio::test]
    async fn test_5xx_retries_inside_one_breaker_outcome() {
        let hits = Arc::new(AtomicU32::new(0));
        let addr = spawn_server(failing_router(hits.clone())).await;
        let breaker = Arc::new(CircuitBreaker::new(BreakerSettings::new("flaky")));
        let client = client(addr, breaker);

        let err = client.get_json::<serde_json::Value>("/flaky").await.unwrap_err();
        assert!(matches!(err, KainosError::Upstream { status: 503, .. }));
        assert_eq!(hits.load(Ordering::SeqCst), 3);

        let counts = client.counts();
        assert_eq!(counts.requests, 1);
        assert_eq!(counts.total_failures, 1);
    }

    #[tokio::test]
    async fn test_post_is_never_retried() {
        let hits = Arc::new(AtomicU32::new(0));
        let addr = spawn_server(failing_router(hits.clone())).await;
        let breaker = Arc::new(CircuitBreaker::new(BreakerSettings::new("flaky")));
        let client = client(addr, breaker);

        let result: Result<serde_json::Value> =
            client.post_json("/flaky", &serde_json::json!({})).await;
        assert!(result.is_err());
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_open_breaker_short_circuits() {
        let hits = Arc::new(AtomicU32::new(0));
        let addr = spawn_server(failing_router(hits.clone())).await;
        let breaker = Arc::new(CircuitBreaker::new(
            BreakerSettings::new("flaky").with_failure_threshold(1),
        ));
        let client = client(addr, breaker).with_retry_policy(RetryPolicy::none());

        let _ = client.get_json::<serde_json::Value>("/flaky").await;
        assert_eq!(client.state(), State::Open);

        let err = client.get_json::<serde_json::Value>("/flaky").await.unwrap_err();
        assert!(matches!(err, KainosError::CircuitOpen { .. }));
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_4xx_is_not_a_breaker_failure() {
        let router = Router::new().route("/missing", get(|| async { StatusCode::NOT_FOUND }));
        let addr = spawn_server(router).await;
        let breaker = Arc::new(CircuitBreaker::new(
            BreakerSettings::new("lookup").with_failure_threshold(1),
        ));
        let client = client(addr, breaker);

        let err = client.get_json::<serde_json::Value>("/missing").await.unwrap_err();
        assert!(matches!(err, KainosError::NotFound(_)));
        assert_eq!(client.state(), State::Closed);
    }
}

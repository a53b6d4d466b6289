// Connectivity-aware HTTP execution with latency probing and bounded retry

pub mod monitor;

use anyhow::Context;
use reqwest::{StatusCode, Url};
use std::time::{Duration, Instant};
use tracing::{debug, instrument, warn};

use crate::core::config::NetworkConfig;
use crate::core::errors::{NetworkError, NetworkResult};
use crate::utils::Metrics;

pub use monitor::{InterfaceType, PathMonitor, PathProbe, PathStatus, TcpPathProbe};

/// Per-request policy
#[derive(Debug, Clone)]
pub struct FetchOptions {
    pub timeout: Duration,
    /// Extra attempts after the first
    pub retries: u32,
    /// Fail fast with `SlowConnection` when the host's root answers slower than this
    pub slow_threshold: Option<Duration>,
}

impl FetchOptions {
    pub fn from_config(config: &NetworkConfig) -> Self {
        Self {
            timeout: config.content_timeout,
            retries: config.retries,
            slow_threshold: config.slow_threshold,
        }
    }
}

impl Default for FetchOptions {
    fn default() -> Self {
        Self::from_config(&NetworkConfig::default())
    }
}

#[derive(Clone, Copy)]
enum Method<'a> {
    Get,
    PostJson(&'a serde_json::Value),
}

/// Executes remote calls for the vision and translation providers
pub struct NetworkClient {
    http: reqwest::Client,
    monitor: PathMonitor,
    probe_timeout: Duration,
    backoff_base: Duration,
    metrics: Option<Metrics>,
}

impl NetworkClient {
    pub fn new(config: &NetworkConfig, monitor: PathMonitor, metrics: Option<Metrics>) -> anyhow::Result<Self> {
        let http = reqwest::Client::builder()
            .pool_max_idle_per_host(4)
            .pool_idle_timeout(Duration::from_secs(90))
            .connect_timeout(config.content_timeout)
            .build()
            .context("Failed to create HTTP client")?;

        Ok(Self {
            http,
            monitor,
            probe_timeout: config.probe_timeout,
            backoff_base: config.backoff_base,
            metrics,
        })
    }

    pub fn path_status(&self) -> PathStatus {
        self.monitor.current()
    }

    pub fn is_connected(&self) -> bool {
        self.monitor.current().connected
    }

    /// Wait before the attempt following `attempt` (0-based): base * 2^attempt / 2
    pub fn backoff_delay(&self, attempt: u32) -> Duration {
        self.backoff_base.saturating_mul(1u32 << attempt.min(16)) / 2
    }

    /// GET `url`, returning the body bytes
    #[instrument(skip(self, options), fields(retries = options.retries))]
    pub async fn fetch(&self, url: &str, options: &FetchOptions) -> NetworkResult<Vec<u8>> {
        self.execute(url, Method::Get, options).await
    }

    /// POST a JSON body to `url`, returning the response bytes
    #[instrument(skip(self, body, options), fields(retries = options.retries))]
    pub async fn post_json(
        &self,
        url: &str,
        body: &serde_json::Value,
        options: &FetchOptions,
    ) -> NetworkResult<Vec<u8>> {
        self.execute(url, Method::PostJson(body), options).await
    }

    /// Round-trip time of a GET to `url`; 2xx and 3xx count as reachable
    pub async fn measure_latency(&self, url: &str, timeout: Duration) -> NetworkResult<Duration> {
        let start = Instant::now();
        let response = self
            .http
            .get(url)
            .timeout(timeout)
            .send()
            .await
            .map_err(map_reqwest_error)?;
        let elapsed = start.elapsed();
        let status = response.status();
        if status.is_success() || status.is_redirection() {
            Ok(elapsed)
        } else {
            Err(NetworkError::Http {
                status: status.as_u16(),
            })
        }
    }

    async fn execute(&self, url: &str, method: Method<'_>, options: &FetchOptions) -> NetworkResult<Vec<u8>> {
        if !self.is_connected() {
            return Err(NetworkError::NoConnection);
        }

        let parsed = Url::parse(url).map_err(|e| NetworkError::InvalidUrl(format!("{}: {}", url, e)))?;

        if let Some(threshold) = options.slow_threshold {
            let root = host_root(&parsed);
            match self.measure_latency(&root, self.probe_timeout).await {
                Ok(latency) if latency >= threshold => {
                    warn!(
                        "Slow connection to {}: {}ms >= {}ms",
                        root,
                        latency.as_millis(),
                        threshold.as_millis()
                    );
                    return Err(NetworkError::SlowConnection { latency });
                }
                Ok(latency) => debug!("Latency to {}: {}ms", root, latency.as_millis()),
                Err(e) => warn!("Latency probe to {} failed, continuing: {}", root, e),
            }
        }

        let mut last_error: Option<NetworkError> = None;
        for attempt in 0..=options.retries {
            let start = Instant::now();
            let request = match method {
                Method::Get => self.http.get(parsed.clone()),
                Method::PostJson(body) => self.http.post(parsed.clone()).json(body),
            };

            let outcome = match request.timeout(options.timeout).send().await {
                Ok(response) => {
                    let status = response.status();
                    if status.is_success() {
                        response.bytes().await.map(|b| b.to_vec()).map_err(map_reqwest_error)
                    } else {
                        Err(http_error(status))
                    }
                }
                Err(e) => Err(map_reqwest_error(e)),
            };

            if let Some(metrics) = &self.metrics {
                metrics.record_remote_call(outcome.is_ok(), start.elapsed());
            }

            match outcome {
                Ok(body) => {
                    debug!(
                        "{} succeeded on attempt {} ({} bytes)",
                        parsed.path(),
                        attempt + 1,
                        body.len()
                    );
                    return Ok(body);
                }
                Err(e) => {
                    warn!("Attempt {}/{} failed: {}", attempt + 1, options.retries + 1, e);
                    last_error = Some(e);
                }
            }

            if attempt < options.retries {
                tokio::time::sleep(self.backoff_delay(attempt)).await;
            }
        }

        Err(last_error.unwrap_or(NetworkError::NoConnection))
    }
}

fn host_root(url: &Url) -> String {
    match url.port() {
        Some(port) => format!("{}://{}:{}/", url.scheme(), url.host_str().unwrap_or_default(), port),
        None => format!("{}://{}/", url.scheme(), url.host_str().unwrap_or_default()),
    }
}

fn http_error(status: StatusCode) -> NetworkError {
    NetworkError::Http {
        status: status.as_u16(),
    }
}

fn map_reqwest_error(e: reqwest::Error) -> NetworkError {
    if e.is_timeout() {
        NetworkError::Timeout
    } else if let Some(status) = e.status() {
        http_error(status)
    } else {
        NetworkError::Request(e.to_string())
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use axum::{extract::State, http::StatusCode as AxumStatus, routing::get, Router};
    use parking_lot::Mutex;
    use std::sync::Arc;

    /// Serve `router` on an ephemeral local port
    pub(crate) async fn serve(router: Router) -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, router).await.unwrap();
        });
        format!("http://{}", addr)
    }

    pub(crate) fn test_client(backoff_base: Duration) -> NetworkClient {
        let config = NetworkConfig {
            backoff_base,
            probe_timeout: Duration::from_millis(500),
            ..NetworkConfig::default()
        };
        NetworkClient::new(&config, PathMonitor::fixed(PathStatus::online(InterfaceType::Wired)), None)
            .unwrap()
    }

    fn options(timeout_ms: u64, retries: u32) -> FetchOptions {
        FetchOptions {
            timeout: Duration::from_millis(timeout_ms),
            retries,
            slow_threshold: None,
        }
    }

    type Hits = Arc<Mutex<Vec<Instant>>>;

    async fn slow(State(hits): State<Hits>) -> &'static str {
        hits.lock().push(Instant::now());
        tokio::time::sleep(Duration::from_secs(2)).await;
        "late"
    }

    async fn flaky(State(hits): State<Hits>) -> (AxumStatus, &'static str) {
        let n = {
            let mut hits = hits.lock();
            hits.push(Instant::now());
            hits.len()
        };
        if n < 3 {
            (AxumStatus::SERVICE_UNAVAILABLE, "busy")
        } else {
            (AxumStatus::OK, "ok")
        }
    }

    async fn forbidden(State(hits): State<Hits>) -> AxumStatus {
        hits.lock().push(Instant::now());
        AxumStatus::FORBIDDEN
    }

    async fn spawn_server() -> (String, Hits) {
        let hits: Hits = Arc::new(Mutex::new(Vec::new()));
        let router = Router::new()
            .route("/", get(|| async { "root" }))
            .route("/slow", get(slow))
            .route("/flaky", get(flaky))
            .route("/forbidden", get(forbidden))
            .with_state(hits.clone());
        (serve(router).await, hits)
    }

    #[tokio::test]
    async fn test_timeouts_retry_with_increasing_backoff() {
        let (base, hits) = spawn_server().await;
        let client = test_client(Duration::from_millis(200));

        let err = client
            .fetch(&format!("{}/slow", base), &options(50, 2))
            .await
            .unwrap_err();

        assert_eq!(err, NetworkError::Timeout);
        let hits = hits.lock().clone();
        assert_eq!(hits.len(), 3);
        let first_gap = hits[1] - hits[0];
        let second_gap = hits[2] - hits[1];
        assert!(second_gap > first_gap, "{:?} !> {:?}", second_gap, first_gap);
    }

    #[tokio::test]
    async fn test_non_success_status_is_retried() {
        let (base, hits) = spawn_server().await;
        let client = test_client(Duration::from_millis(10));

        let body = client
            .fetch(&format!("{}/flaky", base), &options(1000, 2))
            .await
            .unwrap();
        assert_eq!(body, b"ok");
        assert_eq!(hits.lock().len(), 3);
    }

    #[tokio::test]
    async fn test_exhausted_retries_surface_http_status() {
        let (base, hits) = spawn_server().await;
        let client = test_client(Duration::from_millis(10));

        let err = client
            .fetch(&format!("{}/forbidden", base), &options(1000, 1))
            .await
            .unwrap_err();
        assert_eq!(err, NetworkError::Http { status: 403 });
        assert_eq!(hits.lock().len(), 2);
    }

    #[tokio::test]
    async fn test_offline_fails_without_attempt() {
        let (base, hits) = spawn_server().await;
        let client = NetworkClient::new(
            &NetworkConfig::default(),
            PathMonitor::fixed(PathStatus::offline()),
            None,
        )
        .unwrap();

        let err = client
            .fetch(&format!("{}/flaky", base), &options(1000, 3))
            .await
            .unwrap_err();
        assert_eq!(err, NetworkError::NoConnection);
        assert!(hits.lock().is_empty());
    }

    #[tokio::test]
    async fn test_slow_link_detected_before_request() {
        let hits: Hits = Arc::new(Mutex::new(Vec::new()));
        let router = Router::new()
            .route(
                "/",
                get(|| async {
                    tokio::time::sleep(Duration::from_millis(150)).await;
                    "root"
                }),
            )
            .route("/flaky", get(flaky))
            .with_state(hits.clone());
        let base = serve(router).await;
        let client = test_client(Duration::from_millis(10));

        let mut opts = options(1000, 0);
        opts.slow_threshold = Some(Duration::from_millis(100));
        let err = client.fetch(&format!("{}/flaky", base), &opts).await.unwrap_err();

        match err {
            NetworkError::SlowConnection { latency } => assert!(latency >= Duration::from_millis(100)),
            other => panic!("expected slow connection, got {:?}", other),
        }
        assert!(hits.lock().is_empty());
    }

    #[tokio::test]
    async fn test_probe_failure_does_not_block_request() {
        let hits: Hits = Arc::new(Mutex::new(Vec::new()));
        // No root route: the probe sees 404 and is ignored
        let router = Router::new().route("/flaky", get(flaky)).with_state(hits.clone());
        let base = serve(router).await;
        let client = test_client(Duration::from_millis(10));

        let mut opts = options(1000, 2);
        opts.slow_threshold = Some(Duration::from_millis(100));
        let body = client.fetch(&format!("{}/flaky", base), &opts).await.unwrap();
        assert_eq!(body, b"ok");
    }

    #[tokio::test]
    async fn test_post_json_and_metrics() {
        let router = Router::new().route(
            "/echo",
            axum::routing::post(|axum::Json(v): axum::Json<serde_json::Value>| async move { axum::Json(v) }),
        );
        let base = serve(router).await;
        let metrics = Metrics::new();
        let client = NetworkClient::new(
            &NetworkConfig::default(),
            PathMonitor::fixed(PathStatus::online(InterfaceType::Wired)),
            Some(metrics.clone()),
        )
        .unwrap();

        let body = serde_json::json!({"q": ["apple"]});
        let bytes = client
            .post_json(&format!("{}/echo", base), &body, &options(1000, 0))
            .await
            .unwrap();
        let echoed: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(echoed, body);
        assert_eq!(metrics.snapshot().remote_calls_success, 1);
    }

    #[tokio::test]
    async fn test_measure_latency() {
        let (base, _) = spawn_server().await;
        let client = test_client(Duration::from_millis(10));
        assert!(client.measure_latency(&base, Duration::from_secs(1)).await.is_ok());
        assert_eq!(
            client
                .measure_latency(&format!("{}/forbidden", base), Duration::from_secs(1))
                .await,
            Err(NetworkError::Http { status: 403 })
        );
    }

    #[test]
    fn test_backoff_doubles() {
        let client = NetworkClient {
            http: reqwest::Client::new(),
            monitor: PathMonitor::fixed(PathStatus::offline()),
            probe_timeout: Duration::from_secs(1),
            backoff_base: Duration::from_secs(1),
            metrics: None,
        };
        assert_eq!(client.backoff_delay(0), Duration::from_millis(500));
        assert_eq!(client.backoff_delay(1), Duration::from_secs(1));
        assert_eq!(client.backoff_delay(2), Duration::from_secs(2));
    }

    #[test]
    fn test_host_root_keeps_port() {
        let url = Url::parse("http://127.0.0.1:8080/a/b?key=1").unwrap();
        assert_eq!(host_root(&url), "http://127.0.0.1:8080/");
        let url = Url::parse("https://translation.googleapis.com/language/translate/v2").unwrap();
        assert_eq!(host_root(&url), "https://translation.googleapis.com/");
    }
}

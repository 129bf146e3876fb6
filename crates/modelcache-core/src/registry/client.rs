//! HTTP client for the CivitAI lookup-by-hash endpoint.

use super::types::{parse_version_payload, LookupOutcome};
use crate::cancel::CancellationToken;
use crate::config::{RegistryConfig, RegistryDefaults};
use crate::error::{CacheError, Result};
use async_trait::async_trait;
use governor::{Quota, RateLimiter};
use reqwest::{header, Client, StatusCode};
use std::num::NonZeroU32;
use std::time::Duration;
use tracing::{debug, instrument};

/// A source of registry metadata keyed by content hash.
///
/// Implementations report transport problems as errors; `is_retryable()`
/// decides whether the resolver tries again. `cancel` belongs to the job the
/// lookup serves: once it fires, no new request may be sent and the call
/// returns `Cancelled`.
#[async_trait]
pub trait RegistryLookup: Send + Sync {
    async fn lookup_by_hash(
        &self,
        hash: &str,
        cancel: &CancellationToken,
    ) -> Result<LookupOutcome>;
}

type DirectLimiter = RateLimiter<
    governor::state::NotKeyed,
    governor::state::InMemoryState,
    governor::clock::DefaultClock,
>;

/// Rate-limited CivitAI client.
pub struct CivitaiClient {
    http: Client,
    base_url: String,
    api_key: Option<String>,
    timeout: Duration,
    rate_limiter: DirectLimiter,
}

impl std::fmt::Debug for CivitaiClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CivitaiClient")
            .field("base_url", &self.base_url)
            .field("has_api_key", &self.api_key.is_some())
            .finish()
    }
}

impl CivitaiClient {
    pub fn new(config: &RegistryConfig) -> Result<Self> {
        let http = Client::builder()
            .timeout(config.timeout())
            .user_agent(RegistryDefaults::USER_AGENT)
            .build()
            .map_err(|e| CacheError::Network {
                message: format!("Failed to create HTTP client: {}", e),
                cause: None,
            })?;

        Ok(Self {
            http,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            api_key: config.api_key.clone().filter(|k| !k.is_empty()),
            timeout: config.timeout(),
            rate_limiter: RateLimiter::direct(quota_for(config)),
        })
    }

    fn by_hash_url(&self, hash: &str) -> String {
        format!("{}/model-versions/by-hash/{}", self.base_url, hash)
    }
}

/// Token bucket of `requests_per_window` tokens refilled evenly over the window.
fn quota_for(config: &RegistryConfig) -> Quota {
    let burst = NonZeroU32::new(config.requests_per_window).unwrap_or(NonZeroU32::MIN);
    let period = config.window() / burst.get();
    Quota::with_period(period)
        .unwrap_or_else(|| Quota::per_second(burst))
        .allow_burst(burst)
}

fn retry_after_secs(response: &reqwest::Response) -> Option<u64> {
    response
        .headers()
        .get(header::RETRY_AFTER)
        .and_then(|v| v.to_str().ok())
        .and_then(|s| s.trim().parse().ok())
}

#[async_trait]
impl RegistryLookup for CivitaiClient {
    #[instrument(skip(self, cancel), fields(registry = "civitai"))]
    async fn lookup_by_hash(
        &self,
        hash: &str,
        cancel: &CancellationToken,
    ) -> Result<LookupOutcome> {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(CacheError::Cancelled),
            _ = self.rate_limiter.until_ready() => {}
        }
        cancel.check()?;

        let url = self.by_hash_url(hash);
        debug!(url = %url, "Registry lookup");

        let mut request = self.http.get(&url);
        if let Some(key) = &self.api_key {
            request = request.header(header::AUTHORIZATION, format!("Bearer {}", key));
        }

        let response = request.send().await.map_err(|e| {
            if e.is_timeout() {
                CacheError::Timeout(self.timeout)
            } else {
                CacheError::from(e)
            }
        })?;

        let status = response.status();
        match status {
            StatusCode::NOT_FOUND => return Ok(LookupOutcome::NotFound),
            StatusCode::TOO_MANY_REQUESTS => {
                return Err(CacheError::RateLimited {
                    retry_after_secs: retry_after_secs(&response),
                })
            }
            s if s.is_server_error() => {
                let message = response.text().await.unwrap_or_default();
                return Err(CacheError::RegistryUnavailable {
                    status: s.as_u16(),
                    message,
                });
            }
            s if !s.is_success() => {
                return Err(CacheError::RegistryRejected { status: s.as_u16() });
            }
            _ => {}
        }

        let body = response.bytes().await.map_err(|e| {
            if e.is_timeout() {
                CacheError::Timeout(self.timeout)
            } else {
                CacheError::from(e)
            }
        })?;
        Ok(parse_version_payload(&body))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{header as match_header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    const HASH: &str = "aaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaa";

    fn client_for(server: &MockServer, api_key: Option<&str>) -> CivitaiClient {
        let config = RegistryConfig {
            base_url: format!("{}/api/v1/", server.uri()),
            api_key: api_key.map(str::to_string),
            requests_per_window: 100,
            ..RegistryConfig::default()
        };
        CivitaiClient::new(&config).unwrap()
    }

    #[tokio::test]
    async fn test_found_with_bearer() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path(format!("/api/v1/model-versions/by-hash/{}", HASH)))
            .and(match_header("authorization", "Bearer sekrit"))
            .respond_with(
                ResponseTemplate::new(200).set_body_json(serde_json::json!({
                    "id": 9, "modelId": 42, "name": "X"
                })),
            )
            .expect(1)
            .mount(&server)
            .await;

        let outcome = client_for(&server, Some("sekrit"))
            .lookup_by_hash(HASH, &CancellationToken::new())
            .await
            .unwrap();
        let LookupOutcome::Found(model) = outcome else {
            panic!("expected found, got {:?}", outcome);
        };
        assert_eq!(model.model_id, 42);
    }

    #[tokio::test]
    async fn test_status_mapping() {
        let server = MockServer::start().await;
        let client = client_for(&server, None);

        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(404))
            .up_to_n_times(1)
            .mount(&server)
            .await;
        assert_eq!(
            client
                .lookup_by_hash(HASH, &CancellationToken::new())
                .await
                .unwrap(),
            LookupOutcome::NotFound
        );
        server.reset().await;

        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(429).insert_header("Retry-After", "7"))
            .mount(&server)
            .await;
        assert!(matches!(
            client.lookup_by_hash(HASH, &CancellationToken::new()).await,
            Err(CacheError::RateLimited {
                retry_after_secs: Some(7)
            })
        ));
        server.reset().await;

        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(502))
            .mount(&server)
            .await;
        let err = client
            .lookup_by_hash(HASH, &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(err.is_retryable());
        server.reset().await;

        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(401))
            .mount(&server)
            .await;
        let err = client
            .lookup_by_hash(HASH, &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, CacheError::RegistryRejected { status: 401 }));
        assert!(!err.is_retryable());
    }

    #[tokio::test]
    async fn test_malformed_body() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_string("not json"))
            .mount(&server)
            .await;

        let outcome = client_for(&server, None)
            .lookup_by_hash(HASH, &CancellationToken::new())
            .await
            .unwrap();
        assert!(matches!(outcome, LookupOutcome::Malformed(_)));
    }

    #[tokio::test]
    async fn test_cancel_while_rate_limited_sends_nothing() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(404))
            .expect(1)
            .mount(&server)
            .await;
        let config = RegistryConfig {
            base_url: format!("{}/api/v1", server.uri()),
            requests_per_window: 1,
            window_secs: 3600,
            ..RegistryConfig::default()
        };
        let client = CivitaiClient::new(&config).unwrap();
        let cancel = CancellationToken::new();

        // Spends the only token in the bucket.
        assert_eq!(
            client.lookup_by_hash(HASH, &cancel).await.unwrap(),
            LookupOutcome::NotFound
        );

        let waiting = {
            let cancel = cancel.clone();
            async move { client.lookup_by_hash(HASH, &cancel).await }
        };
        let canceller = async {
            tokio::time::sleep(Duration::from_millis(50)).await;
            cancel.cancel();
        };
        let (result, ()) = tokio::time::timeout(
            Duration::from_secs(10),
            async { tokio::join!(waiting, canceller) },
        )
        .await
        .unwrap();
        assert!(matches!(result, Err(CacheError::Cancelled)));
        assert_eq!(server.received_requests().await.unwrap().len(), 1);
    }

    #[test]
    fn test_quota_from_config() {
        let config = RegistryConfig {
            requests_per_window: 5,
            window_secs: 10,
            ..RegistryConfig::default()
        };
        let limiter: DirectLimiter = RateLimiter::direct(quota_for(&config));
        for _ in 0..5 {
            assert!(limiter.check().is_ok());
        }
        assert!(limiter.check().is_err());
    }
}

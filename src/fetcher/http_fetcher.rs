use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderValue, CONTENT_LENGTH, IF_MODIFIED_SINCE, IF_NONE_MATCH};
use reqwest::{Client, Response, StatusCode};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::debug;
use url::Url;

use crate::domain::{AuthConfig, RawFeedPayload, SourceConfig, Validators};
use crate::fetcher::{FetchConfig, FetchError, Fetcher, TimeoutStage};

pub struct HttpFetcher {
    client: Client,
    config: FetchConfig,
    limiter: ConnectionLimiter,
}

impl HttpFetcher {
    pub fn new(config: FetchConfig) -> Result<Self, FetchError> {
        let client = Client::builder()
            .connect_timeout(config.connect_timeout())
            .read_timeout(config.read_timeout())
            .pool_max_idle_per_host(config.pool_idle_per_host)
            .gzip(true)
            .brotli(true)
            .user_agent(config.user_agent.clone())
            .build()
            .map_err(|e| FetchError::transient(format!("failed to build HTTP client: {}", e)))?;

        let limiter = ConnectionLimiter::new(config.max_connections, config.max_connections_per_host);

        Ok(Self {
            client,
            config,
            limiter,
        })
    }

    async fn fetch_url(
        &self,
        source: &SourceConfig,
        url: &str,
        previous: &Validators,
    ) -> Result<RawFeedPayload, FetchError> {
        let host = Url::parse(url)
            .ok()
            .and_then(|u| u.host_str().map(String::from))
            .unwrap_or_default();
        let _permits = self.limiter.acquire(&host).await?;

        let mut headers = HeaderMap::new();

        // Validators only count once the data they describe was committed.
        if previous.content_hash.is_some() {
            if let Some(etag) = previous.etag.as_deref() {
                if let Ok(value) = HeaderValue::from_str(etag) {
                    headers.insert(IF_NONE_MATCH, value);
                }
            }

            if let Some(last_modified) = previous.last_modified.as_deref() {
                if let Ok(value) = HeaderValue::from_str(last_modified) {
                    headers.insert(IF_MODIFIED_SINCE, value);
                }
            }
        }

        let mut request = self.client.get(url).headers(headers);
        request = match &source.auth {
            AuthConfig::None => request,
            AuthConfig::Basic { username, password } => {
                request.basic_auth(username, password.as_ref())
            }
            AuthConfig::Bearer { token } => request.bearer_auth(token),
        };

        let response = tokio::time::timeout(self.config.write_timeout(), request.send())
            .await
            .map_err(|_| FetchError::Timeout {
                stage: TimeoutStage::Write,
            })?
            .map_err(classify)?;

        let status = response.status();
        if status == StatusCode::NOT_MODIFIED {
            if previous.content_hash.is_none() {
                return Err(FetchError::transient("304 without a cached representation"));
            }
            debug!(source = %source.id, "not modified");
            return Ok(RawFeedPayload::unchanged(&source.id, previous));
        }
        if !status.is_success() {
            return Err(FetchError::from_status(status.as_u16()));
        }

        let etag = header_string(&response, "etag");
        let last_modified = header_string(&response, "last-modified");
        let body = self.read_body(response).await?;

        debug!(source = %source.id, bytes = body.len(), "fetched");
        Ok(RawFeedPayload::from_bytes(
            &source.id,
            body,
            etag,
            last_modified,
        ))
    }

    async fn read_body(&self, mut response: Response) -> Result<Vec<u8>, FetchError> {
        let limit = self.config.max_body_bytes;

        let declared = response
            .headers()
            .get(CONTENT_LENGTH)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse::<u64>().ok());
        if declared.is_some_and(|len| len > limit) {
            return Err(FetchError::TooLarge { limit });
        }

        let mut body = Vec::with_capacity(declared.unwrap_or(0) as usize);
        while let Some(chunk) = response.chunk().await.map_err(classify)? {
            if (body.len() + chunk.len()) as u64 > limit {
                return Err(FetchError::TooLarge { limit });
            }
            body.extend_from_slice(&chunk);
        }
        Ok(body)
    }
}

#[async_trait]
impl Fetcher for HttpFetcher {
    async fn fetch(
        &self,
        source: &SourceConfig,
        previous: &Validators,
    ) -> Result<RawFeedPayload, FetchError> {
        let url = source
            .kind
            .request_url()
            .ok_or_else(|| FetchError::transient(format!("{} is not a network source", source.id)))?;

        let deadline = source.fetch_timeout.unwrap_or(self.config.deadline());
        match tokio::time::timeout(deadline, self.fetch_url(source, &url, previous)).await {
            Ok(result) => result,
            Err(_) => Err(FetchError::Timeout {
                stage: TimeoutStage::Deadline,
            }),
        }
    }
}

fn header_string(response: &Response, name: &str) -> Option<String> {
    response
        .headers()
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(String::from)
}

fn classify(err: reqwest::Error) -> FetchError {
    if err.is_timeout() {
        let stage = if err.is_connect() {
            TimeoutStage::Connect
        } else {
            TimeoutStage::Read
        };
        return FetchError::Timeout { stage };
    }
    if let Some(status) = err.status() {
        return FetchError::from_status(status.as_u16());
    }
    FetchError::transient(err.to_string())
}

/// Caps connections globally and per host.
struct ConnectionLimiter {
    total: Arc<Semaphore>,
    per_host: Mutex<HashMap<String, Arc<Semaphore>>>,
    per_host_limit: usize,
}

impl ConnectionLimiter {
    fn new(total: usize, per_host_limit: usize) -> Self {
        Self {
            total: Arc::new(Semaphore::new(total)),
            per_host: Mutex::new(HashMap::new()),
            per_host_limit,
        }
    }

    fn host_semaphore(&self, host: &str) -> Result<Arc<Semaphore>, FetchError> {
        let mut map = self
            .per_host
            .lock()
            .map_err(|_| FetchError::transient("connection limiter poisoned"))?;
        Ok(map
            .entry(host.to_string())
            .or_insert_with(|| Arc::new(Semaphore::new(self.per_host_limit)))
            .clone())
    }

    /// Host permit first so a busy host does not hold global slots while waiting.
    async fn acquire(
        &self,
        host: &str,
    ) -> Result<(OwnedSemaphorePermit, OwnedSemaphorePermit), FetchError> {
        let closed = |_| FetchError::transient("connection limiter closed");
        let host_permit = self.host_semaphore(host)?.acquire_owned().await.map_err(closed)?;
        let total_permit = self.total.clone().acquire_owned().await.map_err(closed)?;
        Ok((host_permit, total_permit))
    }
}

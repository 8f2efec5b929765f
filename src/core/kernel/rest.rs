use crate::core::config::{ClientConfig, SendCap};
use crate::core::errors::ClientError;
use crate::core::kernel::rate_limit::{route_for, CredentialKey, RestRateLimiter};
use crate::core::kernel::signer::Signer;
use async_trait::async_trait;
use reqwest::header::HeaderMap;
use reqwest::{Client, Method, Response};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::Value;
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;
use tracing::{debug, instrument, trace, warn};

/// HTTP methods accepted by the API
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HttpMethod {
    Get,
    Post,
    Put,
    Patch,
    Delete,
}

impl HttpMethod {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Get => "GET",
            Self::Post => "POST",
            Self::Put => "PUT",
            Self::Patch => "PATCH",
            Self::Delete => "DELETE",
        }
    }

    fn to_reqwest(self) -> Method {
        match self {
            Self::Get => Method::GET,
            Self::Post => Method::POST,
            Self::Put => Method::PUT,
            Self::Patch => Method::PATCH,
            Self::Delete => Method::DELETE,
        }
    }
}

impl FromStr for HttpMethod {
    type Err = ClientError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "GET" => Ok(Self::Get),
            "POST" => Ok(Self::Post),
            "PUT" => Ok(Self::Put),
            "PATCH" => Ok(Self::Patch),
            "DELETE" => Ok(Self::Delete),
            other => Err(ClientError::InvalidParameters(format!(
                "Unsupported HTTP method: {}",
                other
            ))),
        }
    }
}

impl std::fmt::Display for HttpMethod {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One outbound API request
#[derive(Debug, Clone, PartialEq)]
pub struct RestRequest {
    pub method: HttpMethod,
    pub path: String,
    pub body: Option<Value>,
    pub headers: Vec<(String, String)>,
}

impl RestRequest {
    /// Create a request; the path must start with `/`
    pub fn new(method: HttpMethod, path: impl Into<String>) -> Result<Self, ClientError> {
        let path = path.into();
        if !path.starts_with('/') {
            return Err(ClientError::InvalidParameters(format!(
                "Request path must start with '/': {}",
                path
            )));
        }
        Ok(Self {
            method,
            path,
            body: None,
            headers: Vec::new(),
        })
    }

    pub fn json(mut self, body: Value) -> Self {
        self.body = Some(body);
        self
    }

    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    /// Rate-limit route of this request, if it is tracked
    pub fn route(&self) -> Option<String> {
        route_for(&self.path)
    }
}

/// REST client trait for making HTTP requests
#[async_trait]
pub trait RestClient: Send + Sync {
    /// Send a request and return the decoded JSON body
    ///
    /// An empty 2xx body decodes to `Value::Null`.
    async fn request(&self, request: RestRequest) -> Result<Value, ClientError>;

    async fn get(&self, path: &str) -> Result<Value, ClientError> {
        self.request(RestRequest::new(HttpMethod::Get, path)?).await
    }

    /// Make a GET request with strongly-typed response
    async fn get_json<T: DeserializeOwned>(&self, path: &str) -> Result<T, ClientError> {
        let value = self.get(path).await?;
        Ok(serde_json::from_value(value)?)
    }

    async fn post(&self, path: &str, body: Value) -> Result<Value, ClientError> {
        self.request(RestRequest::new(HttpMethod::Post, path)?.json(body))
            .await
    }

    async fn put(&self, path: &str, body: Value) -> Result<Value, ClientError> {
        self.request(RestRequest::new(HttpMethod::Put, path)?.json(body))
            .await
    }

    async fn patch(&self, path: &str, body: Value) -> Result<Value, ClientError> {
        self.request(RestRequest::new(HttpMethod::Patch, path)?.json(body))
            .await
    }

    async fn delete(&self, path: &str) -> Result<Value, ClientError> {
        self.request(RestRequest::new(HttpMethod::Delete, path)?)
            .await
    }
}

/// Configuration for the REST client
#[derive(Clone, Debug)]
pub struct RestClientConfig {
    /// Versioned API root, e.g. `https://discord.com/api/v6`
    pub base_url: String,
    /// Upper bound on a single request, connect through body read
    pub timeout: Duration,
    pub user_agent: String,
    /// Local burst cap per (credential, route)
    pub burst: SendCap,
}

impl RestClientConfig {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            timeout: Duration::from_secs(30),
            user_agent: format!("cordkit/{}", env!("CARGO_PKG_VERSION")),
            burst: SendCap::rest_default(),
        }
    }

    pub fn from_client_config(config: &ClientConfig) -> Self {
        Self {
            base_url: format!(
                "{}/v{}",
                config.api_base.trim_end_matches('/'),
                config.api_version
            ),
            timeout: config.request_timeout,
            user_agent: config.user_agent.clone(),
            burst: config.rest_burst,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_user_agent(mut self, user_agent: impl Into<String>) -> Self {
        self.user_agent = user_agent.into();
        self
    }

    pub fn with_burst(mut self, burst: SendCap) -> Self {
        self.burst = burst;
        self
    }
}

/// Builder for creating REST client instances
pub struct RestClientBuilder {
    config: RestClientConfig,
    signer: Option<Arc<dyn Signer>>,
    limiter: Option<Arc<RestRateLimiter>>,
}

impl RestClientBuilder {
    pub fn new(config: RestClientConfig) -> Self {
        Self {
            config,
            signer: None,
            limiter: None,
        }
    }

    /// Set the signer for authenticated requests
    pub fn with_signer(mut self, signer: Arc<dyn Signer>) -> Self {
        self.signer = Some(signer);
        self
    }

    /// Share an existing limiter, e.g. between shards of one credential
    pub fn with_rate_limiter(mut self, limiter: Arc<RestRateLimiter>) -> Self {
        self.limiter = Some(limiter);
        self
    }

    pub fn build(self) -> Result<ReqwestRest, ClientError> {
        let client = Client::builder()
            .timeout(self.config.timeout)
            .user_agent(&self.config.user_agent)
            .build()
            .map_err(|e| ClientError::NetworkError(format!("Failed to build HTTP client: {}", e)))?;

        let limiter = self
            .limiter
            .unwrap_or_else(|| Arc::new(RestRateLimiter::new(self.config.burst)));

        Ok(ReqwestRest {
            client,
            config: self.config,
            signer: self.signer,
            limiter,
            next_id: Arc::new(AtomicU64::new(1)),
        })
    }
}

/// Implementation of `RestClient` using reqwest
#[derive(Clone)]
pub struct ReqwestRest {
    client: Client,
    config: RestClientConfig,
    signer: Option<Arc<dyn Signer>>,
    limiter: Arc<RestRateLimiter>,
    next_id: Arc<AtomicU64>,
}

impl std::fmt::Debug for ReqwestRest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReqwestRest")
            .field("config", &self.config)
            .field("has_signer", &self.signer.is_some())
            .finish_non_exhaustive()
    }
}

/// Response of `GET /gateway`
#[derive(Debug, Clone, Deserialize)]
pub struct GatewayInfo {
    pub url: String,
}

impl ReqwestRest {
    pub fn rate_limiter(&self) -> &Arc<RestRateLimiter> {
        &self.limiter
    }

    fn credential(&self) -> CredentialKey {
        self.signer
            .as_ref()
            .map_or_else(|| CredentialKey::from_token(""), |s| s.fingerprint())
    }

    fn build_url(&self, path: &str) -> String {
        format!("{}{}", self.config.base_url, path)
    }

    /// Refresh the limiter from `X-RateLimit-*` headers, when present
    fn record_rate_limit(&self, route: &str, headers: &HeaderMap) {
        fn header<T: FromStr>(headers: &HeaderMap, name: &str) -> Option<T> {
            headers.get(name)?.to_str().ok()?.trim().parse().ok()
        }

        let remaining = header::<i64>(headers, "X-RateLimit-Remaining");
        let reset = header::<f64>(headers, "X-RateLimit-Reset");
        if let (Some(remaining), Some(reset)) = (remaining, reset) {
            let limit = header::<u32>(headers, "X-RateLimit-Limit");
            self.limiter
                .record(self.credential(), route, limit, remaining, reset);
        }
    }

    /// Handle the response and extract JSON
    #[instrument(skip(self, response), fields(status = %response.status()))]
    async fn handle_response(&self, response: Response) -> Result<Value, ClientError> {
        let status = response.status();
        let response_text = response
            .text()
            .await
            .map_err(|e| ClientError::NetworkError(format!("Failed to read response body: {}", e)))?;

        trace!("Response body: {}", response_text);

        if status.is_success() {
            if response_text.trim().is_empty() {
                return Ok(Value::Null);
            }
            Ok(serde_json::from_str(&response_text)?)
        } else {
            Err(ClientError::ApiError {
                code: status.as_u16(),
                message: response_text,
            })
        }
    }

    #[instrument(skip(self, request), fields(method = %request.method, path = %request.path))]
    async fn make_request(&self, request: RestRequest) -> Result<Value, ClientError> {
        let route = request.route();
        if let Some(route) = &route {
            self.limiter.allow(self.credential(), route)?;
        }

        let url = self.build_url(&request.path);
        let mut builder = self.client.request(request.method.to_reqwest(), &url);

        if let Some(signer) = &self.signer {
            for (key, value) in signer.sign_request(request.method.as_str(), &request.path)? {
                builder = builder.header(&key, &value);
            }
        }
        for (key, value) in &request.headers {
            builder = builder.header(key, value);
        }
        if let Some(body) = &request.body {
            builder = builder.json(body);
        }

        let response = tokio::time::timeout(self.config.timeout, builder.send())
            .await
            .map_err(|_| {
                ClientError::NetworkError(format!(
                    "Request timed out after {:?}",
                    self.config.timeout
                ))
            })?
            .map_err(|e| ClientError::NetworkError(format!("Request failed: {}", e)))?;

        if let Some(route) = &route {
            self.record_rate_limit(route, response.headers());
        }

        self.handle_response(response).await
    }

    /// Send a request in the background and return a handle to its result
    pub fn send_deferred(&self, request: RestRequest) -> PendingRequest {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let route = request.route();
        let (tx, rx) = oneshot::channel();
        let this = self.clone();
        tokio::spawn(async move {
            let result = this.request(request).await;
            if tx.send(result).is_err() {
                debug!(id, "Pending request dropped before completion");
            }
        });
        PendingRequest { id, route, rx }
    }

    /// Send a request in the background; `callback` runs exactly once with
    /// the outcome. Returns the request id.
    pub fn send_with_callback<F>(&self, request: RestRequest, callback: F) -> u64
    where
        F: FnOnce(Result<Value, ClientError>) + Send + 'static,
    {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let this = self.clone();
        tokio::spawn(async move {
            let result = this.request(request).await;
            if let Err(e) = &result {
                warn!(id, error = %e, "Request failed");
            }
            callback(result);
        });
        id
    }

    /// Look up the gateway WebSocket URL
    pub async fn get_gateway_url(&self) -> Result<String, ClientError> {
        let info: GatewayInfo = self.get_json("/gateway").await?;
        Ok(info.url)
    }
}

#[async_trait]
impl RestClient for ReqwestRest {
    async fn request(&self, request: RestRequest) -> Result<Value, ClientError> {
        self.make_request(request).await
    }
}

/// Handle to an in-flight request started with `send_deferred`
#[derive(Debug)]
pub struct PendingRequest {
    id: u64,
    route: Option<String>,
    rx: oneshot::Receiver<Result<Value, ClientError>>,
}

impl PendingRequest {
    pub const fn id(&self) -> u64 {
        self.id
    }

    pub fn route(&self) -> Option<&str> {
        self.route.as_deref()
    }

    /// Wait for the outcome; resolves at most once
    pub async fn wait(self) -> Result<Value, ClientError> {
        self.rx.await.map_err(|_| {
            ClientError::NetworkError("Request task ended without a result".to_string())
        })?
    }
}

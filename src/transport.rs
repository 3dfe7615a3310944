// Wire-level request/response types and the HTTP transport

use anyhow::Context;
use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use reqwest::header::{HeaderMap, HeaderName, HeaderValue, AUTHORIZATION, RETRY_AFTER};
use reqwest::{Client, Method, StatusCode};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use std::time::Duration;

use crate::error::ClientError;

/// An outbound API call
///
/// Requests are plain data so they can be replayed after a token refresh.
#[derive(Debug, Clone)]
pub struct ApiRequest {
    pub method: Method,
    /// Path relative to the API base URL, e.g. `/reports`
    pub path: String,
    pub query: Vec<(String, String)>,
    pub headers: HeaderMap,
    pub body: Option<Value>,
    pub(crate) refresh_on_unauthorized: bool,
    pub(crate) retried: bool,
}

impl ApiRequest {
    pub fn new(method: Method, path: impl Into<String>) -> Self {
        Self {
            method,
            path: path.into(),
            query: Vec::new(),
            headers: HeaderMap::new(),
            body: None,
            refresh_on_unauthorized: true,
            retried: false,
        }
    }

    pub fn get(path: impl Into<String>) -> Self {
        Self::new(Method::GET, path)
    }

    pub fn post(path: impl Into<String>) -> Self {
        Self::new(Method::POST, path)
    }

    pub fn put(path: impl Into<String>) -> Self {
        Self::new(Method::PUT, path)
    }

    pub fn delete(path: impl Into<String>) -> Self {
        Self::new(Method::DELETE, path)
    }

    /// Attach a JSON body
    pub fn json<T: Serialize + ?Sized>(mut self, body: &T) -> Result<Self, ClientError> {
        let value = serde_json::to_value(body)
            .map_err(|e| ClientError::InvalidRequest(format!("Failed to encode body: {}", e)))?;
        self.body = Some(value);
        Ok(self)
    }

    pub fn query(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.query.push((key.into(), value.into()));
        self
    }

    pub fn header(mut self, name: &str, value: &str) -> Result<Self, ClientError> {
        let name = HeaderName::from_bytes(name.as_bytes())
            .map_err(|e| ClientError::InvalidRequest(format!("Invalid header name: {}", e)))?;
        let value = HeaderValue::from_str(value)
            .map_err(|e| ClientError::InvalidRequest(format!("Invalid header value: {}", e)))?;
        self.headers.insert(name, value);
        Ok(self)
    }

    /// A 401 from this request means bad credentials, not a stale token
    pub fn without_refresh(mut self) -> Self {
        self.refresh_on_unauthorized = false;
        self
    }

    /// Whether this request has already been replayed once
    pub fn is_retried(&self) -> bool {
        self.retried
    }

    /// Replace (or remove) the bearer credential
    pub fn set_bearer(&mut self, token: Option<&str>) -> Result<(), ClientError> {
        match token {
            Some(token) => {
                let mut value = HeaderValue::from_str(&format!("Bearer {}", token))
                    .map_err(|_| ClientError::InvalidRequest("Access token is not a valid header value".to_string()))?;
                value.set_sensitive(true);
                self.headers.insert(AUTHORIZATION, value);
            }
            None => {
                self.headers.remove(AUTHORIZATION);
            }
        }
        Ok(())
    }

    /// Bearer token currently attached, if any
    pub fn bearer(&self) -> Option<&str> {
        self.headers
            .get(AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.strip_prefix("Bearer "))
    }
}

/// A received HTTP response, body fully buffered
#[derive(Debug, Clone)]
pub struct ApiResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Bytes,
}

impl ApiResponse {
    pub fn new(status: StatusCode, body: impl Into<Bytes>) -> Self {
        Self {
            status,
            headers: HeaderMap::new(),
            body: body.into(),
        }
    }

    /// JSON response with the given status
    pub fn json_body(status: StatusCode, body: &Value) -> Self {
        Self::new(status, body.to_string())
    }

    pub fn is_success(&self) -> bool {
        self.status.is_success()
    }

    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }

    pub fn json<T: DeserializeOwned>(&self) -> Result<T, ClientError> {
        serde_json::from_slice(&self.body)
            .map_err(|e| ClientError::Decode(format!("{} ({})", e, self.status)))
    }

    /// User-facing error text: `message`, then `error`, then the raw body
    pub fn error_message(&self) -> String {
        extract_error_message(self.status, &self.text())
    }

    /// Map non-success statuses to the client error taxonomy
    pub fn error_for_status(self) -> Result<Self, ClientError> {
        if self.status.is_success() || self.status.is_redirection() {
            return Ok(self);
        }

        let message = self.error_message();
        let err = match self.status {
            StatusCode::UNAUTHORIZED => ClientError::Unauthorized { message },
            StatusCode::FORBIDDEN => {
                tracing::warn!(message = %message, "Access denied");
                ClientError::Forbidden { message }
            }
            StatusCode::TOO_MANY_REQUESTS => {
                let retry_after = self
                    .headers
                    .get(RETRY_AFTER)
                    .and_then(|v| v.to_str().ok())
                    .and_then(parse_retry_after);
                tracing::warn!(retry_after = ?retry_after, "Rate limited");
                ClientError::RateLimited {
                    retry_after,
                    message,
                }
            }
            status => ClientError::Api {
                status: status.as_u16(),
                message,
            },
        };
        Err(err)
    }
}

/// Sends requests to the backend
///
/// The seam between the session logic and the network.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn send(&self, request: ApiRequest) -> Result<ApiResponse, ClientError>;
}

/// reqwest-backed transport with connection pooling
pub struct HttpTransport {
    client: Client,
    base_url: String,
}

impl HttpTransport {
    pub fn new(
        base_url: &str,
        max_connections: usize,
        connect_timeout: Duration,
        request_timeout: Duration,
    ) -> anyhow::Result<Self> {
        let client = Client::builder()
            .pool_max_idle_per_host(max_connections)
            .connect_timeout(connect_timeout)
            .timeout(request_timeout)
            .user_agent(user_agent())
            .build()
            .context("Failed to create HTTP client")?;

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn url_for(&self, path: &str) -> String {
        if path.starts_with('/') {
            format!("{}{}", self.base_url, path)
        } else {
            format!("{}/{}", self.base_url, path)
        }
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn send(&self, request: ApiRequest) -> Result<ApiResponse, ClientError> {
        let url = self.url_for(&request.path);

        let mut builder = self
            .client
            .request(request.method.clone(), &url)
            .headers(request.headers);
        if !request.query.is_empty() {
            builder = builder.query(&request.query);
        }
        if let Some(ref body) = request.body {
            builder = builder.json(body);
        }

        let response = builder.send().await.map_err(|e| network_error(e, &url))?;

        let status = response.status();
        let headers = response.headers().clone();
        let body = response.bytes().await.map_err(|e| network_error(e, &url))?;

        tracing::debug!(status = %status, url = %url, "Received HTTP response");

        Ok(ApiResponse {
            status,
            headers,
            body,
        })
    }
}

fn network_error(e: reqwest::Error, url: &str) -> ClientError {
    let kind = if e.is_timeout() {
        "timeout"
    } else if e.is_connect() {
        "connection_failed"
    } else if e.is_request() {
        "request_error"
    } else if e.is_body() {
        "body_error"
    } else if e.is_decode() {
        "decode_error"
    } else {
        "unknown"
    };

    tracing::warn!(
        error_kind = kind,
        error = %e,
        url = %url,
        "HTTP request error"
    );

    ClientError::Network {
        kind,
        message: e.to_string(),
    }
}

/// User-Agent with a hashed host fingerprint
fn user_agent() -> String {
    use std::collections::hash_map::DefaultHasher;
    use std::hash::{Hash, Hasher};

    let hostname = hostname::get()
        .ok()
        .and_then(|h| h.into_string().ok())
        .unwrap_or_else(|| "unknown".to_string());

    let mut hasher = DefaultHasher::new();
    hostname.hash(&mut hasher);
    format!(
        "recon-session/{}-{:x}",
        env!("CARGO_PKG_VERSION"),
        hasher.finish()
    )
}

/// Pick the user-facing message out of an error body
pub fn extract_error_message(status: StatusCode, body: &str) -> String {
    if let Ok(json) = serde_json::from_str::<Value>(body) {
        for field in ["message", "error"] {
            if let Some(text) = json.get(field).and_then(|v| v.as_str()) {
                if !text.is_empty() {
                    return text.to_string();
                }
            }
        }
    }

    let trimmed = body.trim();
    if !trimmed.is_empty() {
        return trimmed.to_string();
    }

    status
        .canonical_reason()
        .unwrap_or("Unknown error")
        .to_string()
}

/// Parse a `Retry-After` value: delta-seconds or an HTTP-date
pub fn parse_retry_after(value: &str) -> Option<Duration> {
    let value = value.trim();
    if let Ok(seconds) = value.parse::<u64>() {
        return Some(Duration::from_secs(seconds));
    }

    let at = DateTime::parse_from_rfc2822(value).ok()?.with_timezone(&Utc);
    let wait = (at - Utc::now()).to_std().unwrap_or(Duration::ZERO);
    Some(wait)
}

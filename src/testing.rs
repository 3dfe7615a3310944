// Scripted transport for exercising the session logic without a network

use async_trait::async_trait;
use futures::future::BoxFuture;
use std::sync::{Arc, Mutex};

use crate::error::ClientError;
use crate::transport::{ApiRequest, ApiResponse, Transport};

type Handler =
    dyn Fn(ApiRequest) -> BoxFuture<'static, Result<ApiResponse, ClientError>> + Send + Sync;

/// Transport that answers through a user-supplied async handler
///
/// Every request is recorded before the handler runs, so the log reflects
/// submission order.
pub struct MockTransport {
    handler: Box<Handler>,
    log: Arc<Mutex<Vec<ApiRequest>>>,
}

impl MockTransport {
    pub fn new<F>(handler: F) -> Self
    where
        F: Fn(ApiRequest) -> BoxFuture<'static, Result<ApiResponse, ClientError>>
            + Send
            + Sync
            + 'static,
    {
        Self {
            handler: Box::new(handler),
            log: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// All requests seen so far, in submission order
    pub fn requests(&self) -> Vec<ApiRequest> {
        self.log.lock().map(|log| log.clone()).unwrap_or_default()
    }

    /// Requests sent to `path`
    pub fn requests_to(&self, path: &str) -> Vec<ApiRequest> {
        self.requests()
            .into_iter()
            .filter(|r| r.path == path)
            .collect()
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn send(&self, request: ApiRequest) -> Result<ApiResponse, ClientError> {
        if let Ok(mut log) = self.log.lock() {
            log.push(request.clone());
        }
        (self.handler)(request).await
    }
}

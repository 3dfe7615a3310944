use anyhow::Result;
use reqwest::StatusCode;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;

use crate::auth::{AuthEndpoints, CredentialStore, RefreshCoordinator, SessionState};
use crate::config::Config;
use crate::error::ClientError;
use crate::transport::{ApiRequest, ApiResponse, HttpTransport, Transport};

/// Authenticated API client
///
/// Attaches the stored access token to every request and routes 401s
/// through the refresh coordinator, so callers never see a refresh that
/// succeeded.
#[derive(Clone)]
pub struct ApiClient {
    /// Underlying transport
    transport: Arc<dyn Transport>,

    /// Credential store
    store: Arc<CredentialStore>,

    /// Session view shared with the controller
    session: Arc<SessionState>,

    /// Single-flight refresh
    coordinator: Arc<RefreshCoordinator>,

    endpoints: AuthEndpoints,
}

impl ApiClient {
    /// Create a client over an existing transport and store
    pub fn new(
        transport: Arc<dyn Transport>,
        store: Arc<CredentialStore>,
        endpoints: AuthEndpoints,
    ) -> Self {
        let session = Arc::new(SessionState::new());
        let coordinator = Arc::new(RefreshCoordinator::new(
            transport.clone(),
            store.clone(),
            session.clone(),
            endpoints.refresh.clone(),
        ));

        Self {
            transport,
            store,
            session,
            coordinator,
            endpoints,
        }
    }

    /// Build the HTTP transport and open the credential database from config
    pub fn from_config(config: &Config) -> Result<Self> {
        let transport = HttpTransport::new(
            &config.api_base_url,
            config.http_max_connections,
            Duration::from_secs(config.http_connect_timeout),
            Duration::from_secs(config.http_request_timeout),
        )?;
        let store = CredentialStore::open(&config.credentials_db)?;

        Ok(Self::new(
            Arc::new(transport),
            Arc::new(store),
            AuthEndpoints::with_prefix(&config.auth_path_prefix),
        ))
    }

    /// Attach the current access token, if any
    ///
    /// Returns the token that was attached.
    fn intercept(&self, request: &mut ApiRequest) -> Result<Option<String>, ClientError> {
        let token = self.store.access()?;
        request.set_bearer(token.as_deref())?;
        Ok(token)
    }

    /// Send a request
    ///
    /// 401 is resolved by refreshing and replaying once. 403 and 429 are
    /// surfaced immediately, as is every other non-success status.
    pub async fn execute(&self, request: ApiRequest) -> Result<ApiResponse, ClientError> {
        let request_id = uuid::Uuid::new_v4().to_string()[..8].to_string();
        tracing::debug!(
            request_id = %request_id,
            method = %request.method,
            path = %request.path,
            "Sending API request"
        );

        let mut outbound = request.clone();
        let sent_with = self.intercept(&mut outbound)?;
        let response = self.transport.send(outbound).await?;

        tracing::debug!(
            request_id = %request_id,
            status = %response.status,
            authenticated = sent_with.is_some(),
            "Received API response"
        );

        if response.status == StatusCode::UNAUTHORIZED
            && request.refresh_on_unauthorized
            && !request.retried
        {
            tracing::debug!(request_id = %request_id, "Unauthorized, handing off to refresh");
            return self.coordinator.recover(request, sent_with).await;
        }

        let result = match response.error_for_status() {
            // Login-style calls: the credentials in the body were rejected
            Err(ClientError::Unauthorized { message }) if !request.refresh_on_unauthorized => {
                Err(ClientError::InvalidCredentials { message })
            }
            other => other,
        };

        result.map_err(|e| {
            tracing::debug!(request_id = %request_id, error = %e, "API request failed");
            e
        })
    }

    /// Send a request and decode the JSON response
    pub async fn send_json<T: DeserializeOwned>(&self, request: ApiRequest) -> Result<T, ClientError> {
        self.execute(request).await?.json()
    }

    /// GET `path` and decode the JSON response
    pub async fn get_json<T: DeserializeOwned>(&self, path: &str) -> Result<T, ClientError> {
        self.send_json(ApiRequest::get(path)).await
    }

    /// POST a JSON body to `path` and decode the JSON response
    pub async fn post_json<B, T>(&self, path: &str, body: &B) -> Result<T, ClientError>
    where
        B: Serialize + ?Sized,
        T: DeserializeOwned,
    {
        self.send_json(ApiRequest::post(path).json(body)?).await
    }

    pub fn store(&self) -> &Arc<CredentialStore> {
        &self.store
    }

    pub fn session_state(&self) -> &Arc<SessionState> {
        &self.session
    }

    pub fn endpoints(&self) -> &AuthEndpoints {
        &self.endpoints
    }

    /// Whether a token refresh is in flight
    pub fn is_refreshing(&self) -> bool {
        self.coordinator.is_refreshing()
    }
}

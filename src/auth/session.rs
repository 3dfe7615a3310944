// Session lifecycle: login, logout, bootstrap and observable session state

use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;

use super::credentials::CredentialStore;
use super::types::{
    AuthEndpoints, AuthResponse, ChangePasswordRequest, LoginRequest, MessageResponse,
    RegisterRequest, TokenValidation, TokenValidationRequest, UserProfile,
};
use crate::error::Result;
use crate::http_client::ApiClient;
use crate::transport::ApiRequest;

const EVENT_CAPACITY: usize = 16;

/// Derived view of the current session
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Session {
    pub user: Option<UserProfile>,
    pub is_authenticated: bool,
    /// False while a bootstrapped session is still being checked
    pub verified: bool,
}

/// Session transitions other parts of the application react to
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    LoggedIn { user: UserProfile },
    LoggedOut,
    /// The session could not be recovered; send the user to the login entry
    /// point, optionally back to `return_to` afterwards
    ForcedLogout {
        reason: String,
        return_to: Option<String>,
    },
}

/// Observable session state shared by the controller and the refresh
/// coordinator
pub struct SessionState {
    current: watch::Sender<Session>,
    events: broadcast::Sender<SessionEvent>,
    location: Mutex<Option<String>>,
}

impl SessionState {
    pub fn new() -> Self {
        let (current, _) = watch::channel(Session::default());
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            current,
            events,
            location: Mutex::new(None),
        }
    }

    pub fn current(&self) -> Session {
        self.current.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<Session> {
        self.current.subscribe()
    }

    pub fn events(&self) -> broadcast::Receiver<SessionEvent> {
        self.events.subscribe()
    }

    /// Remember where the user is, for the redirect after a forced logout
    pub fn set_location(&self, location: Option<String>) {
        if let Ok(mut current) = self.location.lock() {
            *current = location;
        }
    }

    fn location(&self) -> Option<String> {
        self.location.lock().ok().and_then(|l| l.clone())
    }

    pub(crate) fn publish(&self, session: Session) {
        self.current.send_replace(session);
    }

    fn emit(&self, event: SessionEvent) {
        // No subscribers is fine
        let _ = self.events.send(event);
    }

    /// Drop the session view and ask the application to re-authenticate
    ///
    /// Stored credentials must already be cleared by the caller.
    pub(crate) fn force_logout(&self, reason: &str) {
        tracing::warn!("Forcing logout: {}", reason);
        self.publish(Session::default());
        self.emit(SessionEvent::ForcedLogout {
            reason: reason.to_string(),
            return_to: self.location(),
        });
    }
}

impl Default for SessionState {
    fn default() -> Self {
        Self::new()
    }
}

/// Facade over login, logout, registration and the current user
#[derive(Clone)]
pub struct SessionController {
    client: ApiClient,
    store: Arc<CredentialStore>,
    state: Arc<SessionState>,
    endpoints: AuthEndpoints,
    logout_timeout: Duration,
}

impl SessionController {
    pub fn new(client: ApiClient, logout_timeout: Duration) -> Self {
        Self {
            store: client.store().clone(),
            state: client.session_state().clone(),
            endpoints: client.endpoints().clone(),
            client,
            logout_timeout,
        }
    }

    pub fn client(&self) -> &ApiClient {
        &self.client
    }

    /// Snapshot of the session view
    pub fn session(&self) -> Session {
        self.state.current()
    }

    pub fn subscribe(&self) -> watch::Receiver<Session> {
        self.state.subscribe()
    }

    pub fn events(&self) -> broadcast::Receiver<SessionEvent> {
        self.state.events()
    }

    pub fn set_location(&self, location: Option<String>) {
        self.state.set_location(location);
    }

    /// True iff an access token is stored
    pub fn is_authenticated(&self) -> Result<bool> {
        self.store.has_session()
    }

    /// Cached user profile
    pub fn user(&self) -> Result<Option<UserProfile>> {
        self.store.cached_user()
    }

    pub async fn login(&self, credentials: &LoginRequest) -> Result<AuthResponse> {
        let request = ApiRequest::post(self.endpoints.login.as_str())
            .json(credentials)?
            .without_refresh();
        self.authenticate(request).await
    }

    pub async fn register(&self, data: &RegisterRequest) -> Result<AuthResponse> {
        let request = ApiRequest::post(self.endpoints.register.as_str())
            .json(data)?
            .without_refresh();
        self.authenticate(request).await
    }

    async fn authenticate(&self, request: ApiRequest) -> Result<AuthResponse> {
        let response: AuthResponse = self.client.send_json(request).await?;

        self.store
            .set(&response.access_token, &response.refresh_token)?;
        self.store.set_user(&response.user)?;

        tracing::info!(user = %response.user.username, "Signed in");
        self.state.publish(Session {
            user: Some(response.user.clone()),
            is_authenticated: true,
            verified: true,
        });
        self.state.emit(SessionEvent::LoggedIn {
            user: response.user.clone(),
        });

        Ok(response)
    }

    /// End the session
    ///
    /// The server call is best effort; local credentials are cleared
    /// regardless of its outcome.
    pub async fn logout(&self) -> Result<()> {
        let request = ApiRequest::post(self.endpoints.logout.as_str()).without_refresh();

        match tokio::time::timeout(self.logout_timeout, self.client.execute(request)).await {
            Ok(Ok(_)) => tracing::debug!("Server-side logout acknowledged"),
            Ok(Err(e)) => tracing::warn!("Server-side logout failed: {}", e),
            Err(_) => tracing::warn!(
                "Server-side logout timed out after {:?}",
                self.logout_timeout
            ),
        }

        let cleared = self.store.clear();
        self.state.publish(Session::default());
        self.state.emit(SessionEvent::LoggedOut);
        cleared.map(|_| ())
    }

    /// Fetch the current user from the server
    pub async fn current_user(&self) -> Result<UserProfile> {
        self.client.get_json(&self.endpoints.me).await
    }

    /// Re-fetch the profile and update the cache
    ///
    /// A failure leaves the session in place.
    pub async fn refresh_user(&self) -> Result<UserProfile> {
        let user = self.current_user().await.map_err(|e| {
            tracing::warn!("Failed to refresh user: {}", e);
            e
        })?;
        self.store.set_user(&user)?;

        let mut session = self.state.current();
        session.user = Some(user.clone());
        self.state.publish(session);
        Ok(user)
    }

    /// Restore a stored session at startup
    ///
    /// With a stored access token the session is marked authenticated
    /// immediately and verified in the background; the returned handle
    /// resolves to whether verification succeeded. Without one this is a
    /// no-op.
    ///
    /// A cached user profile is not required; when it is missing the
    /// session starts with `user: None` until verification fills it in.
    pub fn bootstrap(&self) -> Result<Option<JoinHandle<bool>>> {
        let stored = self.store.snapshot()?;
        if stored.access_token.is_none() {
            tracing::debug!("No stored session to restore");
            return Ok(None);
        }

        tracing::info!("Restoring stored session, verifying in background");
        self.state.publish(Session {
            user: stored.user,
            is_authenticated: true,
            verified: false,
        });

        let controller = self.clone();
        Ok(Some(tokio::spawn(async move { controller.verify().await })))
    }

    async fn verify(&self) -> bool {
        match self.current_user().await {
            Ok(user) => {
                if let Err(e) = self.store.set_user(&user) {
                    tracing::warn!("Failed to cache verified user: {}", e);
                }
                self.state.publish(Session {
                    user: Some(user),
                    is_authenticated: true,
                    verified: true,
                });
                true
            }
            Err(e) => {
                tracing::warn!("Stored session is no longer valid: {}", e);
                if let Err(e) = self.store.clear() {
                    tracing::error!("Failed to clear credentials: {}", e);
                }
                self.state.publish(Session::default());
                false
            }
        }
    }

    /// Change the password; returns the server's confirmation message
    pub async fn change_password(&self, current_password: &str, new_password: &str) -> Result<String> {
        let request = ApiRequest::post(self.endpoints.change_password.as_str()).json(
            &ChangePasswordRequest {
                current_password: current_password.to_string(),
                new_password: new_password.to_string(),
            },
        )?;
        let response: MessageResponse = self.client.send_json(request).await?;
        Ok(response
            .message
            .unwrap_or_else(|| "Password changed".to_string()))
    }

    /// Ask the server whether `token` is valid
    pub async fn validate_token(&self, token: &str) -> Result<TokenValidation> {
        let request = ApiRequest::post(self.endpoints.validate.as_str())
            .json(&TokenValidationRequest {
                token: token.to_string(),
            })?
            .without_refresh();
        self.client.send_json(request).await
    }
}

impl std::fmt::Debug for SessionController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionController")
            .field("session", &self.state.current())
            .finish()
    }
}

// Single-flight token refresh and replay of requests parked on it

use std::sync::{Arc, Mutex, MutexGuard};

use futures::future::join_all;
use reqwest::StatusCode;
use tokio::sync::oneshot;

use super::credentials::CredentialStore;
use super::session::SessionState;
use super::types::{RefreshRequest, TokenResponse};
use crate::error::{ClientError, RefreshFailure};
use crate::transport::{ApiRequest, ApiResponse, Transport};

/// A request that got 401 and is waiting for the refresh outcome
struct PendingRequest {
    request: ApiRequest,
    reply: oneshot::Sender<Result<ApiResponse, ClientError>>,
}

/// Coordinator state
///
/// The queue only exists while a refresh is in flight, so an idle
/// coordinator cannot hold parked requests.
enum RefreshState {
    Idle,
    Refreshing { queue: Vec<PendingRequest> },
}

/// What `recover` decided under the lock
enum Admission {
    /// Opened a new refresh; the caller is first in the queue
    Leader,
    /// Joined the in-flight refresh
    Queued,
    /// The store already holds a newer token than the one the request used
    Stale(ApiRequest, String),
    /// The session was cleared while the request was in flight
    Ended,
}

/// Deduplicates token refreshes across concurrent requests
///
/// The first 401 opens a refresh; every 401 that arrives while it is in
/// flight is parked behind it. When the refresh settles the queue is drained
/// in arrival order: replayed with the new token on success, rejected with
/// the refresh error on failure.
pub struct RefreshCoordinator {
    state: Mutex<RefreshState>,
    transport: Arc<dyn Transport>,
    store: Arc<CredentialStore>,
    session: Arc<SessionState>,
    refresh_path: String,
}

impl RefreshCoordinator {
    pub fn new(
        transport: Arc<dyn Transport>,
        store: Arc<CredentialStore>,
        session: Arc<SessionState>,
        refresh_path: impl Into<String>,
    ) -> Self {
        Self {
            state: Mutex::new(RefreshState::Idle),
            transport,
            store,
            session,
            refresh_path: refresh_path.into(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, RefreshState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Whether a refresh is in flight
    pub fn is_refreshing(&self) -> bool {
        matches!(*self.lock(), RefreshState::Refreshing { .. })
    }

    /// Number of requests parked on the in-flight refresh
    pub fn pending(&self) -> usize {
        match &*self.lock() {
            RefreshState::Idle => 0,
            RefreshState::Refreshing { queue } => queue.len(),
        }
    }

    /// Resolve a request that received 401
    ///
    /// `sent_with` is the access token the failed attempt carried. The
    /// request is retried at most once; a second 401 is terminal.
    pub async fn recover(
        self: &Arc<Self>,
        mut request: ApiRequest,
        sent_with: Option<String>,
    ) -> Result<ApiResponse, ClientError> {
        request.retried = true;
        let (reply, outcome) = oneshot::channel();

        let admission = {
            let mut state = self.lock();
            match &mut *state {
                RefreshState::Refreshing { queue } => {
                    queue.push(PendingRequest { request, reply });
                    tracing::debug!(queued = queue.len(), "Parked request behind in-flight refresh");
                    Admission::Queued
                }
                RefreshState::Idle => match (self.store.access()?, sent_with) {
                    (Some(current), used) if used.as_deref() != Some(current.as_str()) => {
                        Admission::Stale(request, current)
                    }
                    (None, Some(_)) => Admission::Ended,
                    _ => {
                        *state = RefreshState::Refreshing {
                            queue: vec![PendingRequest { request, reply }],
                        };
                        Admission::Leader
                    }
                },
            }
        };

        match admission {
            Admission::Leader => {
                tracing::info!("Access token rejected, refreshing session");
                // Detached so a dropped caller cannot strand the queue
                tokio::spawn(Arc::clone(self).run_refresh());
            }
            Admission::Queued => {}
            Admission::Stale(request, token) => {
                tracing::debug!("Token already rotated, replaying with current token");
                return self.replay(request, &token).await;
            }
            Admission::Ended => {
                return Err(ClientError::Unauthorized {
                    message: "Session ended while the request was in flight".to_string(),
                });
            }
        }

        outcome.await.map_err(|_| {
            ClientError::Internal(anyhow::anyhow!(
                "Refresh coordinator dropped a pending request"
            ))
        })?
    }

    /// Perform the refresh and settle every parked request
    async fn run_refresh(self: Arc<Self>) {
        let exchanged = self.exchange().await;

        let (queue, outcome) = {
            let mut state = self.lock();
            let outcome = match exchanged {
                Ok(tokens) => self.commit(&tokens).map(|()| tokens.access_token),
                Err(failure) => Err(failure),
            };
            if outcome.is_err() {
                if let Err(e) = self.store.clear() {
                    tracing::error!("Failed to clear credentials after refresh failure: {}", e);
                }
            }
            let queue = match std::mem::replace(&mut *state, RefreshState::Idle) {
                RefreshState::Refreshing { queue } => queue,
                RefreshState::Idle => Vec::new(),
            };
            (queue, outcome)
        };

        match outcome {
            Ok(token) => {
                tracing::info!(queued = queue.len(), "Session refreshed, replaying requests");
                let replays = queue.into_iter().map(|pending| {
                    let token = token.as_str();
                    let this = &self;
                    async move {
                        let result = this.replay(pending.request, token).await;
                        let _ = pending.reply.send(result);
                    }
                });
                join_all(replays).await;
            }
            Err(failure) => {
                tracing::warn!(
                    queued = queue.len(),
                    "Session refresh failed: {}",
                    failure
                );
                for pending in queue {
                    let _ = pending
                        .reply
                        .send(Err(ClientError::RefreshFailed(failure.clone())));
                }
                self.session.force_logout(&failure.to_string());
            }
        }
    }

    /// Exchange the stored refresh token for a new pair
    async fn exchange(&self) -> Result<TokenResponse, RefreshFailure> {
        let refresh_token = match self.store.refresh() {
            Ok(Some(token)) => token,
            Ok(None) => return Err(RefreshFailure::missing_token()),
            Err(e) => return Err(RefreshFailure::new(None, e.to_string())),
        };

        let request = ApiRequest::post(self.refresh_path.as_str())
            .json(&RefreshRequest { refresh_token })
            .map_err(|e| RefreshFailure::new(None, e.to_string()))?
            .without_refresh();

        let response = self
            .transport
            .send(request)
            .await
            .map_err(|e| RefreshFailure::new(e.status(), e.to_string()))?;

        if !response.is_success() {
            return Err(RefreshFailure::new(
                Some(response.status.as_u16()),
                response.error_message(),
            ));
        }

        let tokens: TokenResponse = response
            .json()
            .map_err(|e| RefreshFailure::new(Some(response.status.as_u16()), e.to_string()))?;

        if tokens.access_token.is_empty() || tokens.refresh_token.is_empty() {
            return Err(RefreshFailure::new(
                Some(response.status.as_u16()),
                "Refresh response does not contain a token pair",
            ));
        }

        Ok(tokens)
    }

    /// Persist a refreshed pair; called with the state lock held
    fn commit(&self, tokens: &TokenResponse) -> Result<(), RefreshFailure> {
        self.store
            .set(&tokens.access_token, &tokens.refresh_token)
            .map_err(|e| RefreshFailure::new(None, e.to_string()))?;

        if let Some(ref user) = tokens.user {
            if let Err(e) = self.store.set_user(user) {
                tracing::warn!("Failed to cache refreshed user profile: {}", e);
            }

            let mut session = self.session.current();
            if session.is_authenticated {
                session.user = Some(user.clone());
                self.session.publish(session);
            }
        }
        Ok(())
    }

    /// Resend a request with `token`; a 401 here is terminal
    async fn replay(&self, mut request: ApiRequest, token: &str) -> Result<ApiResponse, ClientError> {
        request.set_bearer(Some(token))?;
        let response = self.transport.send(request).await?;

        if response.status == StatusCode::UNAUTHORIZED && self.end_session_for(token)? {
            tracing::warn!("Request rejected again after refresh, ending session");
            self.session.force_logout("Access token rejected after refresh");
        }

        response.error_for_status()
    }

    /// Clear the store after a replay with `token` was rejected
    ///
    /// Leaves newer credentials alone: if a refresh is in flight or the
    /// stored token has already moved on, that session is not ours to end.
    /// Returns whether this call removed the session.
    fn end_session_for(&self, token: &str) -> Result<bool, ClientError> {
        let state = self.lock();
        if matches!(*state, RefreshState::Refreshing { .. }) {
            return Ok(false);
        }
        match self.store.access()? {
            Some(current) if current == token => Ok(self.store.clear()?),
            _ => Ok(false),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::session::{Session, SessionEvent};
    use crate::testing::MockTransport;
    use futures::FutureExt;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;
    use tokio::sync::Notify;

    const REFRESH: &str = "/auth/refresh";

    fn tokens_response(access: &str, refresh: &str) -> ApiResponse {
        ApiResponse::json_body(
            StatusCode::OK,
            &json!({ "accessToken": access, "refreshToken": refresh, "expiresIn": 900 }),
        )
    }

    /// `/data` accepts only `A2`; refresh waits on `gate` then answers with `refresh_reply`
    fn backend(gate: Arc<Notify>, refresh_reply: ApiResponse) -> MockTransport {
        MockTransport::new(move |request| {
            let gate = gate.clone();
            let refresh_reply = refresh_reply.clone();
            async move {
                if request.path == REFRESH {
                    gate.notified().await;
                    return Ok(refresh_reply);
                }
                match request.bearer() {
                    Some("A2") => Ok(ApiResponse::json_body(
                        StatusCode::OK,
                        &json!({ "path": request.path }),
                    )),
                    _ => Ok(ApiResponse::new(StatusCode::UNAUTHORIZED, "")),
                }
            }
            .boxed()
        })
    }

    fn setup(
        transport: MockTransport,
    ) -> (Arc<MockTransport>, Arc<CredentialStore>, Arc<SessionState>, Arc<RefreshCoordinator>) {
        let transport = Arc::new(transport);
        let store = Arc::new(CredentialStore::in_memory().unwrap());
        store.set("A1", "R1").unwrap();
        let session = Arc::new(SessionState::new());
        let coordinator = Arc::new(RefreshCoordinator::new(
            transport.clone(),
            store.clone(),
            session.clone(),
            REFRESH,
        ));
        (transport, store, session, coordinator)
    }

    async fn wait_for_pending(coordinator: &RefreshCoordinator, n: usize) {
        tokio::time::timeout(Duration::from_secs(5), async {
            while coordinator.pending() < n {
                tokio::task::yield_now().await;
            }
        })
        .await
        .expect("requests were not parked in time");
    }

    #[tokio::test]
    async fn test_single_flight_and_fifo_replay() {
        let gate = Arc::new(Notify::new());
        let (transport, store, _session, coordinator) =
            setup(backend(gate.clone(), tokens_response("A2", "R2")));

        let mut handles = Vec::new();
        for (i, path) in ["/a", "/b", "/c", "/d"].iter().enumerate() {
            let worker = coordinator.clone();
            let request = ApiRequest::get(*path);
            handles.push(tokio::spawn(async move {
                worker.recover(request, Some("A1".to_string())).await
            }));
            wait_for_pending(&coordinator, i + 1).await;
        }

        assert!(coordinator.is_refreshing());
        gate.notify_one();

        for handle in handles {
            let response = handle.await.unwrap().unwrap();
            assert_eq!(response.status, StatusCode::OK);
        }

        let refreshes = transport.requests_to(REFRESH);
        assert_eq!(refreshes.len(), 1);
        assert_eq!(refreshes[0].body, Some(json!({ "refreshToken": "R1" })));
        assert_eq!(refreshes[0].bearer(), None);

        let replayed: Vec<_> = transport
            .requests()
            .into_iter()
            .filter(|r| r.path != REFRESH)
            .collect();
        let order: Vec<_> = replayed.iter().map(|r| r.path.as_str()).collect();
        assert_eq!(order, vec!["/a", "/b", "/c", "/d"]);
        assert!(replayed.iter().all(|r| r.bearer() == Some("A2") && r.is_retried()));

        assert_eq!(store.access().unwrap().as_deref(), Some("A2"));
        assert_eq!(store.refresh().unwrap().as_deref(), Some("R2"));
        assert!(!coordinator.is_refreshing());
        assert_eq!(coordinator.pending(), 0);
    }

    #[tokio::test]
    async fn test_refresh_failure_rejects_all_and_logs_out_once() {
        let gate = Arc::new(Notify::new());
        let failure = ApiResponse::json_body(
            StatusCode::BAD_REQUEST,
            &json!({ "error": "invalid_refresh_token" }),
        );
        let (transport, store, session, coordinator) = setup(backend(gate.clone(), failure));
        let mut events = session.events();

        let mut handles = Vec::new();
        for (i, path) in ["/a", "/b", "/c"].iter().enumerate() {
            let worker = coordinator.clone();
            let request = ApiRequest::get(*path);
            handles.push(tokio::spawn(async move {
                worker.recover(request, Some("A1".to_string())).await
            }));
            wait_for_pending(&coordinator, i + 1).await;
        }
        gate.notify_one();

        for handle in handles {
            match handle.await.unwrap() {
                Err(ClientError::RefreshFailed(failure)) => {
                    assert_eq!(failure.status, Some(400));
                    assert_eq!(failure.message, "invalid_refresh_token");
                }
                other => panic!("expected refresh failure, got {:?}", other),
            }
        }

        // Nothing replayed, exactly one refresh
        assert_eq!(transport.requests().len(), 1);
        assert!(!store.has_session().unwrap());
        assert_eq!(store.refresh().unwrap(), None);

        assert!(matches!(
            events.try_recv(),
            Ok(SessionEvent::ForcedLogout { .. })
        ));
        assert!(events.try_recv().is_err());
        assert!(!session.current().is_authenticated);
    }

    #[tokio::test]
    async fn test_missing_refresh_token_fails_without_network() {
        let (transport, store, session, coordinator) =
            setup(backend(Arc::new(Notify::new()), tokens_response("A2", "R2")));
        store.clear().unwrap();
        let mut events = session.events();

        let err = coordinator
            .recover(ApiRequest::get("/a"), None)
            .await
            .unwrap_err();

        assert!(matches!(err, ClientError::RefreshFailed(ref f) if f.status.is_none()));
        assert!(transport.requests().is_empty());
        assert!(matches!(
            events.try_recv(),
            Ok(SessionEvent::ForcedLogout { .. })
        ));
    }

    #[tokio::test]
    async fn test_second_unauthorized_is_terminal() {
        let refreshes = Arc::new(AtomicUsize::new(0));
        let counter = refreshes.clone();
        let transport = MockTransport::new(move |request| {
            let counter = counter.clone();
            async move {
                if request.path == REFRESH {
                    counter.fetch_add(1, Ordering::SeqCst);
                    return Ok(tokens_response("A2", "R2"));
                }
                // Backend rejects every token
                Ok(ApiResponse::json_body(
                    StatusCode::UNAUTHORIZED,
                    &json!({ "message": "token revoked" }),
                ))
            }
            .boxed()
        });
        let (transport, store, session, coordinator) = setup(transport);
        let mut events = session.events();

        let err = coordinator
            .recover(ApiRequest::get("/a"), Some("A1".to_string()))
            .await
            .unwrap_err();

        assert!(matches!(err, ClientError::Unauthorized { ref message } if message == "token revoked"));
        assert_eq!(refreshes.load(Ordering::SeqCst), 1);
        // One refresh, one replay, no third attempt
        assert_eq!(transport.requests().len(), 2);
        assert!(!store.has_session().unwrap());
        assert!(matches!(
            events.try_recv(),
            Ok(SessionEvent::ForcedLogout { .. })
        ));
    }

    #[tokio::test]
    async fn test_stale_token_replays_without_refresh() {
        let (transport, store, _session, coordinator) =
            setup(backend(Arc::new(Notify::new()), tokens_response("A3", "R3")));
        store.set("A2", "R2").unwrap();

        let response = coordinator
            .recover(ApiRequest::get("/late"), Some("A1".to_string()))
            .await
            .unwrap();

        assert_eq!(response.status, StatusCode::OK);
        assert!(transport.requests_to(REFRESH).is_empty());
        assert_eq!(transport.requests()[0].bearer(), Some("A2"));
    }

    #[tokio::test]
    async fn test_request_after_session_ended_fails_quietly() {
        let (transport, store, session, coordinator) =
            setup(backend(Arc::new(Notify::new()), tokens_response("A2", "R2")));
        store.clear().unwrap();
        let mut events = session.events();

        let err = coordinator
            .recover(ApiRequest::get("/late"), Some("A1".to_string()))
            .await
            .unwrap_err();

        assert!(matches!(err, ClientError::Unauthorized { .. }));
        assert!(transport.requests().is_empty());
        assert!(events.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_refresh_network_error_is_failure() {
        let gate = Arc::new(Notify::new());
        let backend_gate = gate.clone();
        let transport = MockTransport::new(move |request| {
            let gate = backend_gate.clone();
            async move {
                if request.path == REFRESH {
                    gate.notified().await;
                    return Err(ClientError::Network {
                        kind: "timeout",
                        message: "operation timed out".to_string(),
                    });
                }
                Ok(ApiResponse::new(StatusCode::UNAUTHORIZED, ""))
            }
            .boxed()
        });
        let (_transport, store, session, coordinator) = setup(transport);
        let mut events = session.events();

        let mut handles = Vec::new();
        for (i, path) in ["/a", "/b", "/c"].iter().enumerate() {
            let worker = coordinator.clone();
            let request = ApiRequest::get(*path);
            handles.push(tokio::spawn(async move {
                worker.recover(request, Some("A1".to_string())).await
            }));
            wait_for_pending(&coordinator, i + 1).await;
        }
        gate.notify_one();

        for handle in handles {
            match handle.await.unwrap() {
                Err(ClientError::RefreshFailed(failure)) => {
                    assert_eq!(failure.status, None);
                    assert_eq!(failure.message, "Network error (timeout): operation timed out");
                }
                other => panic!("expected refresh failure, got {:?}", other),
            }
        }

        assert!(!store.has_session().unwrap());
        assert_eq!(store.refresh().unwrap(), None);
        assert!(matches!(
            events.try_recv(),
            Ok(SessionEvent::ForcedLogout { .. })
        ));
        assert!(events.try_recv().is_err());
        assert!(!coordinator.is_refreshing());
    }

    #[tokio::test]
    async fn test_refreshed_profile_is_published() {
        let transport = MockTransport::new(|request| {
            async move {
                if request.path == REFRESH {
                    return Ok(ApiResponse::json_body(
                        StatusCode::OK,
                        &json!({
                            "accessToken": "A2",
                            "refreshToken": "R2",
                            "user": {
                                "id": "42",
                                "username": "alice",
                                "email": "alice@example.com",
                                "fullName": "Alice Renamed"
                            }
                        }),
                    ));
                }
                match request.bearer() {
                    Some("A2") => Ok(ApiResponse::new(StatusCode::OK, "{}")),
                    _ => Ok(ApiResponse::new(StatusCode::UNAUTHORIZED, "")),
                }
            }
            .boxed()
        });
        let (_transport, store, session, coordinator) = setup(transport);
        session.publish(Session {
            user: None,
            is_authenticated: true,
            verified: true,
        });

        coordinator
            .recover(ApiRequest::get("/a"), Some("A1".to_string()))
            .await
            .unwrap();

        let published = session.current().user.unwrap();
        assert_eq!(published.full_name.as_deref(), Some("Alice Renamed"));
        assert_eq!(store.cached_user().unwrap(), Some(published));
        assert!(session.current().is_authenticated);
    }

    #[tokio::test]
    async fn test_rejected_replay_keeps_newer_credentials() {
        let store = Arc::new(CredentialStore::in_memory().unwrap());
        store.set("A2", "R2").unwrap();
        let rotated = store.clone();
        let transport = Arc::new(MockTransport::new(move |_| {
            let rotated = rotated.clone();
            async move {
                // Another caller rotated the pair while this replay was in flight
                rotated.set("A3", "R3").unwrap();
                Ok(ApiResponse::new(StatusCode::UNAUTHORIZED, ""))
            }
            .boxed()
        }));
        let session = Arc::new(SessionState::new());
        let mut events = session.events();
        let coordinator = Arc::new(RefreshCoordinator::new(
            transport.clone(),
            store.clone(),
            session,
            REFRESH,
        ));

        let err = coordinator
            .recover(ApiRequest::get("/late"), Some("A1".to_string()))
            .await
            .unwrap_err();

        assert!(matches!(err, ClientError::Unauthorized { .. }));
        assert_eq!(transport.requests()[0].bearer(), Some("A2"));
        assert_eq!(store.access().unwrap().as_deref(), Some("A3"));
        assert_eq!(store.refresh().unwrap().as_deref(), Some("R3"));
        assert!(events.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_dropped_leader_does_not_strand_queue() {
        let gate = Arc::new(Notify::new());
        let (_transport, _store, _session, coordinator) =
            setup(backend(gate.clone(), tokens_response("A2", "R2")));

        let leader = {
            let coordinator = coordinator.clone();
            tokio::spawn(async move {
                coordinator
                    .recover(ApiRequest::get("/leader"), Some("A1".to_string()))
                    .await
            })
        };
        wait_for_pending(&coordinator, 1).await;

        let follower = {
            let coordinator = coordinator.clone();
            tokio::spawn(async move {
                coordinator
                    .recover(ApiRequest::get("/follower"), Some("A1".to_string()))
                    .await
            })
        };
        wait_for_pending(&coordinator, 2).await;

        leader.abort();
        gate.notify_one();

        let response = follower.await.unwrap().unwrap();
        assert_eq!(response.status, StatusCode::OK);
        assert!(!coordinator.is_refreshing());
    }
}

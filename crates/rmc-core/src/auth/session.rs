//! Session manager for the rmc API.
//!
//! Owns the access/refresh token pair, mirrors every change into a
//! `TokenStore`, and issues authenticated requests. A request answered
//! with 401 triggers one refresh and one resend; if the refresh fails the
//! original 401 response is returned as-is.
//!
//! Concurrent refreshes are coalesced: while an exchange is in flight,
//! every other caller awaits that same exchange and sees its outcome.

use std::sync::Arc;

use futures::future::{BoxFuture, FutureExt, Shared};
use parking_lot::{Mutex, RwLock};
use reqwest::{Method, StatusCode};
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::{debug, info, warn};

use super::store::{TokenStore, ACCESS_TOKEN_KEY, REFRESH_TOKEN_KEY};
use crate::api::{HttpRequest, HttpResponse, SessionError, Transport};

// ============================================================================
// Constants
// ============================================================================

/// Asks the API to email a login link
const REQUEST_LOGIN_PATH: &str = "/auth/request";

/// Exchanges a verification uid/token for a token pair
const REQUEST_TOKENS_PATH: &str = "/auth/requestTokens";

/// Exchanges the refresh token for a new access token
const REFRESH_PATH: &str = "/auth/refresh";

// ============================================================================
// State
// ============================================================================

/// Access/refresh token pair. An empty access token means logged out.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Tokens {
    pub access_token: String,
    pub refresh_token: String,
}

impl Tokens {
    pub fn is_logged_in(&self) -> bool {
        !self.access_token.is_empty()
    }
}

#[derive(Debug, Deserialize)]
struct ResultEnvelope<T> {
    result: T,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct TokenPair {
    access_token: String,
    refresh_token: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RefreshedToken {
    access_token: String,
}

type RefreshFuture = Shared<BoxFuture<'static, Result<(), SessionError>>>;

struct Inner<T, S> {
    transport: T,
    store: S,
    base_url: String,
    tokens: RwLock<Tokens>,
    refresh: Mutex<Option<RefreshFuture>>,
}

impl<T: Transport, S: TokenStore> Inner<T, S> {
    fn url(&self, endpoint: &str) -> String {
        if endpoint.starts_with('/') {
            format!("{}{}", self.base_url, endpoint)
        } else {
            format!("{}/{}", self.base_url, endpoint)
        }
    }

    fn access_token(&self) -> String {
        self.tokens.read().access_token.clone()
    }

    fn update_access_token(&self, access_token: &str) -> Result<(), SessionError> {
        self.tokens.write().access_token = access_token.to_string();
        self.store.set(ACCESS_TOKEN_KEY, access_token)?;
        Ok(())
    }

    async fn refresh_exchange(self: Arc<Self>) -> Result<(), SessionError> {
        let refresh_token = self.tokens.read().refresh_token.clone();
        let request = HttpRequest::new(Method::POST, self.url(REFRESH_PATH))
            .json(json!({ "refreshToken": refresh_token }));

        let response = self.transport.send(request).await?;
        if response.status != StatusCode::OK {
            return Err(SessionError::from_failure(response.status, &response.body));
        }

        let refreshed: ResultEnvelope<RefreshedToken> = response.json()?;
        {
            // Held through the store write so a concurrent logout cannot
            // land between the check and the write.
            let mut tokens = self.tokens.write();
            if tokens.refresh_token.is_empty() || tokens.refresh_token != refresh_token {
                debug!("Session changed during refresh, discarding new access token");
                return Err(SessionError::SessionChanged);
            }
            tokens.access_token = refreshed.result.access_token.clone();
            self.store
                .set(ACCESS_TOKEN_KEY, &refreshed.result.access_token)?;
        }
        info!("Access token refreshed");
        Ok(())
    }
}

// ============================================================================
// Session manager
// ============================================================================

/// Handle to a customer session.
/// Clone is cheap - all clones share the same token state and refresh slot.
pub struct SessionManager<T, S> {
    inner: Arc<Inner<T, S>>,
}

impl<T, S> Clone for SessionManager<T, S> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T: Transport, S: TokenStore> SessionManager<T, S> {
    /// Create a session manager, loading any tokens already in `store`
    pub fn new(transport: T, store: S, base_url: impl Into<String>) -> Result<Self, SessionError> {
        Self::with_initial_token(transport, store, base_url, None)
    }

    /// Like `new`, but seeds the access token with `initial_token` when the
    /// store has none. The seeded token is not written to the store.
    pub fn with_initial_token(
        transport: T,
        store: S,
        base_url: impl Into<String>,
        initial_token: Option<&str>,
    ) -> Result<Self, SessionError> {
        let mut access_token = store.get(ACCESS_TOKEN_KEY)?.unwrap_or_default();
        let refresh_token = store.get(REFRESH_TOKEN_KEY)?.unwrap_or_default();

        if access_token.is_empty() {
            if let Some(token) = initial_token.filter(|t| !t.is_empty()) {
                debug!("Using predefined bearer token");
                access_token = token.to_string();
            }
        }

        let base_url = base_url.into().trim_end_matches('/').to_string();
        debug!(%base_url, logged_in = !access_token.is_empty(), "Session loaded");

        Ok(Self {
            inner: Arc::new(Inner {
                transport,
                store,
                base_url,
                tokens: RwLock::new(Tokens {
                    access_token,
                    refresh_token,
                }),
                refresh: Mutex::new(None),
            }),
        })
    }

    pub fn base_url(&self) -> &str {
        &self.inner.base_url
    }

    pub fn is_logged_in(&self) -> bool {
        self.inner.tokens.read().is_logged_in()
    }

    /// Snapshot of the current token pair
    pub fn tokens(&self) -> Tokens {
        self.inner.tokens.read().clone()
    }

    /// Replace both tokens and persist them before returning
    pub fn set_tokens(&self, access_token: &str, refresh_token: &str) -> Result<(), SessionError> {
        {
            let mut tokens = self.inner.tokens.write();
            tokens.access_token = access_token.to_string();
            tokens.refresh_token = refresh_token.to_string();
        }
        self.inner.store.set(ACCESS_TOKEN_KEY, access_token)?;
        self.inner.store.set(REFRESH_TOKEN_KEY, refresh_token)?;
        Ok(())
    }

    /// Replace only the access token; the refresh token is left untouched
    pub fn update_access_token(&self, access_token: &str) -> Result<(), SessionError> {
        self.inner.update_access_token(access_token)
    }

    /// Ask the API to email a login link to `email`
    pub async fn request_login_link(&self, email: &str) -> Result<(), SessionError> {
        let request = HttpRequest::new(Method::POST, self.inner.url(REQUEST_LOGIN_PATH))
            .json(json!({ "email": email }));

        let response = self.inner.transport.send(request).await?;
        if !response.status.is_success() {
            return Err(SessionError::from_failure(response.status, &response.body));
        }
        info!("Login link requested");
        Ok(())
    }

    /// Exchange the uid/token pair from a login link for a session.
    /// One shot: on failure the caller has to request a new link.
    pub async fn request_tokens(&self, uid: &str, token: &str) -> Result<(), SessionError> {
        let request = HttpRequest::new(Method::POST, self.inner.url(REQUEST_TOKENS_PATH))
            .json(json!({ "uid": uid, "token": token }));

        let response = self.inner.transport.send(request).await?;
        if response.status != StatusCode::OK {
            return Err(SessionError::from_failure(response.status, &response.body));
        }

        let pair: ResultEnvelope<TokenPair> = response.json()?;
        self.set_tokens(&pair.result.access_token, &pair.result.refresh_token)?;
        info!("Session established");
        Ok(())
    }

    /// Mint a new access token from the refresh token.
    ///
    /// Joins the in-flight exchange if there is one. Tokens are left as they
    /// were when the exchange fails. If the session was logged out or
    /// replaced while the exchange was in flight, the new access token is
    /// discarded and `SessionError::SessionChanged` is returned.
    pub async fn refresh_session(&self) -> Result<(), SessionError> {
        let refresh = self.shared_refresh();
        let result = refresh.clone().await;

        {
            let mut slot = self.inner.refresh.lock();
            if slot.as_ref().is_some_and(|f| f.ptr_eq(&refresh)) {
                *slot = None;
            }
        }
        result
    }

    fn shared_refresh(&self) -> RefreshFuture {
        let mut slot = self.inner.refresh.lock();
        if let Some(ref in_flight) = *slot {
            debug!("Joining in-flight refresh");
            return in_flight.clone();
        }

        let inner = Arc::clone(&self.inner);
        let refresh = inner.refresh_exchange().boxed().shared();
        *slot = Some(refresh.clone());
        refresh
    }

    /// Clear both tokens in memory and in the store.
    ///
    /// Memory is cleared even when the store fails. Navigating away is up
    /// to the caller (see `router::after_logout`).
    pub fn logout(&self) -> Result<(), SessionError> {
        *self.inner.tokens.write() = Tokens::default();

        let access = self.inner.store.remove(ACCESS_TOKEN_KEY);
        let refresh = self.inner.store.remove(REFRESH_TOKEN_KEY);
        info!("Logged out");

        access.and(refresh).map_err(|e| {
            let err = SessionError::from(e);
            warn!(error = %err, "Failed to clear stored tokens");
            err
        })
    }

    /// GET `endpoint` with the current bearer token
    pub async fn get(&self, endpoint: &str) -> Result<HttpResponse, SessionError> {
        self.make_authenticated_request(endpoint, Method::GET, None)
            .await
    }

    /// Send an authenticated request, refreshing once on 401.
    ///
    /// Only transport failures are errors. A 401 that survives the refresh
    /// comes back as a response: the resent one when the refresh worked,
    /// otherwise the original.
    pub async fn make_authenticated_request(
        &self,
        endpoint: &str,
        method: Method,
        body: Option<Value>,
    ) -> Result<HttpResponse, SessionError> {
        let token_used = self.inner.access_token();
        let request = self.build_request(endpoint, &method, body.as_ref(), &token_used);

        let response = self.inner.transport.send(request).await?;
        if !response.is_unauthorized() {
            return Ok(response);
        }

        let current = self.inner.access_token();
        if current != token_used {
            if current.is_empty() {
                debug!(endpoint, "Logged out while request was in flight");
                return Ok(response);
            }
            debug!(endpoint, "Access token changed while request was in flight");
        } else {
            debug!(endpoint, "Unauthorized, refreshing session");
            if let Err(e) = self.refresh_session().await {
                warn!(endpoint, error = %e, "Refresh failed, returning original response");
                return Ok(response);
            }
        }

        let retry = self.build_request(endpoint, &method, body.as_ref(), &self.inner.access_token());
        self.inner.transport.send(retry).await
    }

    fn build_request(
        &self,
        endpoint: &str,
        method: &Method,
        body: Option<&Value>,
        access_token: &str,
    ) -> HttpRequest {
        let mut request =
            HttpRequest::new(method.clone(), self.inner.url(endpoint)).bearer(access_token);
        if *method != Method::GET {
            if let Some(body) = body {
                request = request.json(body.clone());
            }
        }
        request
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::{FileTokenStore, MemoryTokenStore};

    const BASE: &str = "http://api.test";

    type Handler = Box<dyn Fn(&HttpRequest) -> Result<HttpResponse, SessionError> + Send + Sync>;

    /// Scripted transport that records every request it sees
    struct MockTransport {
        handler: Handler,
        sent: Mutex<Vec<HttpRequest>>,
        slow_refresh: bool,
    }

    impl MockTransport {
        fn new(
            handler: impl Fn(&HttpRequest) -> Result<HttpResponse, SessionError> + Send + Sync + 'static,
        ) -> Arc<Self> {
            Arc::new(Self {
                handler: Box::new(handler),
                sent: Mutex::new(Vec::new()),
                slow_refresh: false,
            })
        }

        /// Like `new`, but refresh exchanges answer as late as "/slow" ones
        fn with_slow_refresh(
            handler: impl Fn(&HttpRequest) -> Result<HttpResponse, SessionError> + Send + Sync + 'static,
        ) -> Arc<Self> {
            Arc::new(Self {
                handler: Box::new(handler),
                sent: Mutex::new(Vec::new()),
                slow_refresh: true,
            })
        }

        fn sent(&self) -> Vec<HttpRequest> {
            self.sent.lock().clone()
        }

        fn count(&self, path: &str) -> usize {
            self.sent().iter().filter(|r| r.url.ends_with(path)).count()
        }
    }

    impl Transport for MockTransport {
        async fn send(&self, request: HttpRequest) -> Result<HttpResponse, SessionError> {
            // "/slow" endpoints answer after the others have moved on
            let slow = request.url.ends_with("/slow")
                || (self.slow_refresh && request.url.ends_with(REFRESH_PATH));
            let yields = if slow { 6 } else { 1 };
            for _ in 0..yields {
                tokio::task::yield_now().await;
            }
            self.sent.lock().push(request.clone());
            (self.handler)(&request)
        }
    }

    fn ok_json(body: Value) -> Result<HttpResponse, SessionError> {
        Ok(HttpResponse::new(StatusCode::OK, body.to_string()))
    }

    fn unauthorized(tag: &str) -> Result<HttpResponse, SessionError> {
        Ok(HttpResponse::new(StatusCode::UNAUTHORIZED, tag.to_string()))
    }

    fn refresh_fails() -> Result<HttpResponse, SessionError> {
        Ok(HttpResponse::new(
            StatusCode::UNAUTHORIZED,
            json!({"error": "Unauthorized", "messages": ["refresh token expired"]}).to_string(),
        ))
    }

    /// Accepts only the "fresh" token; refresh always mints "fresh"
    fn fresh_only(req: &HttpRequest) -> Result<HttpResponse, SessionError> {
        if req.url.ends_with(REFRESH_PATH) {
            return ok_json(json!({"result": {"accessToken": "fresh"}}));
        }
        match req.bearer.as_deref() {
            Some("fresh") => Ok(HttpResponse::new(StatusCode::OK, "ok")),
            _ => unauthorized("stale"),
        }
    }

    fn manager<T: Transport>(
        transport: T,
        store: Arc<MemoryTokenStore>,
    ) -> SessionManager<T, Arc<MemoryTokenStore>> {
        SessionManager::new(transport, store, BASE).unwrap()
    }

    fn logged_in_store() -> Arc<MemoryTokenStore> {
        Arc::new(MemoryTokenStore::with_tokens("stale", "refresh-1"))
    }

    #[test]
    fn test_is_logged_in_tracks_access_token() {
        let transport = MockTransport::new(fresh_only);
        let session = manager(transport, Arc::new(MemoryTokenStore::new()));
        assert!(!session.is_logged_in());

        session.set_tokens("a", "r").unwrap();
        assert!(session.is_logged_in());

        session.set_tokens("", "r").unwrap();
        assert!(!session.is_logged_in());
    }

    #[test]
    fn test_startup_reads_store_and_initial_token() {
        let transport = MockTransport::new(fresh_only);

        let session = manager(transport.clone(), logged_in_store());
        assert_eq!(
            session.tokens(),
            Tokens {
                access_token: "stale".into(),
                refresh_token: "refresh-1".into()
            }
        );

        // Predefined token only fills an empty slot, and is not persisted
        let store = Arc::new(MemoryTokenStore::new());
        let seeded =
            SessionManager::with_initial_token(transport.clone(), store.clone(), BASE, Some("dev"))
                .unwrap();
        assert_eq!(seeded.tokens().access_token, "dev");
        assert!(!store.contains(ACCESS_TOKEN_KEY));

        let kept =
            SessionManager::with_initial_token(transport, logged_in_store(), BASE, Some("dev"))
                .unwrap();
        assert_eq!(kept.tokens().access_token, "stale");
    }

    #[test]
    fn test_set_tokens_persists_pair() {
        let dir = tempfile::tempdir().unwrap();
        let session = SessionManager::new(
            MockTransport::new(fresh_only),
            FileTokenStore::new(dir.path()),
            BASE,
        )
        .unwrap();

        session.set_tokens("access-1", "refresh-1").unwrap();

        let fresh = FileTokenStore::new(dir.path());
        assert_eq!(fresh.get(ACCESS_TOKEN_KEY).unwrap().as_deref(), Some("access-1"));
        assert_eq!(fresh.get(REFRESH_TOKEN_KEY).unwrap().as_deref(), Some("refresh-1"));

        // And a new manager over the same directory starts logged in
        let reloaded =
            SessionManager::new(MockTransport::new(fresh_only), fresh, BASE).unwrap();
        assert!(reloaded.is_logged_in());
    }

    #[test]
    fn test_update_access_token_keeps_refresh_token() {
        let store = logged_in_store();
        let session = manager(MockTransport::new(fresh_only), store.clone());

        session.update_access_token("access-2").unwrap();

        assert_eq!(session.tokens().access_token, "access-2");
        assert_eq!(session.tokens().refresh_token, "refresh-1");
        assert_eq!(store.get(ACCESS_TOKEN_KEY).unwrap().as_deref(), Some("access-2"));
        assert_eq!(store.get(REFRESH_TOKEN_KEY).unwrap().as_deref(), Some("refresh-1"));
    }

    #[test]
    fn test_logout_clears_memory_and_store() {
        let store = logged_in_store();
        let session = manager(MockTransport::new(fresh_only), store.clone());

        session.logout().unwrap();

        assert_eq!(session.tokens(), Tokens::default());
        assert!(!session.is_logged_in());
        assert!(!store.contains(ACCESS_TOKEN_KEY));
        assert!(!store.contains(REFRESH_TOKEN_KEY));
    }

    #[tokio::test]
    async fn test_unauthorized_then_refresh_then_success() {
        let transport = MockTransport::new(fresh_only);
        let store = logged_in_store();
        let session = manager(transport.clone(), store.clone());

        let response = session.get("/instances").await.unwrap();

        assert_eq!(response.status, StatusCode::OK);
        assert_eq!(response.text(), "ok");
        assert_eq!(session.tokens().access_token, "fresh");
        assert_eq!(session.tokens().refresh_token, "refresh-1");
        assert_eq!(store.get(ACCESS_TOKEN_KEY).unwrap().as_deref(), Some("fresh"));

        let sent = transport.sent();
        assert_eq!(sent.len(), 3);
        assert_eq!(sent[0].bearer.as_deref(), Some("stale"));
        assert_eq!(sent[1].url, format!("{}{}", BASE, REFRESH_PATH));
        assert_eq!(sent[1].body, Some(json!({"refreshToken": "refresh-1"})));
        assert_eq!(sent[2].bearer.as_deref(), Some("fresh"));
    }

    #[tokio::test]
    async fn test_failed_refresh_returns_original_response() {
        let transport = MockTransport::new(|req| {
            if req.url.ends_with(REFRESH_PATH) {
                refresh_fails()
            } else {
                unauthorized("original")
            }
        });
        let session = manager(transport.clone(), logged_in_store());

        let response = session.get("/instances").await.unwrap();

        assert_eq!(response.status, StatusCode::UNAUTHORIZED);
        assert_eq!(response.text(), "original");
        assert_eq!(transport.count("/instances"), 1);
        assert_eq!(transport.count(REFRESH_PATH), 1);
        // Stale tokens stay in place
        assert_eq!(session.tokens().access_token, "stale");
    }

    #[tokio::test]
    async fn test_second_unauthorized_is_returned_without_another_refresh() {
        let transport = MockTransport::new(|req| {
            if req.url.ends_with(REFRESH_PATH) {
                ok_json(json!({"result": {"accessToken": "fresh"}}))
            } else {
                unauthorized(req.bearer.as_deref().unwrap_or_default())
            }
        });
        let session = manager(transport.clone(), logged_in_store());

        let response = session.get("/instances").await.unwrap();

        assert_eq!(response.status, StatusCode::UNAUTHORIZED);
        assert_eq!(response.text(), "fresh");
        assert_eq!(transport.count("/instances"), 2);
        assert_eq!(transport.count(REFRESH_PATH), 1);
    }

    #[tokio::test]
    async fn test_request_shape_get_and_post() {
        let transport = MockTransport::new(|_| Ok(HttpResponse::new(StatusCode::OK, "")));
        let session = manager(transport.clone(), logged_in_store());

        session
            .make_authenticated_request("/instances", Method::GET, Some(json!({"ignored": true})))
            .await
            .unwrap();
        session
            .make_authenticated_request(
                "subscriptions",
                Method::POST,
                Some(json!({"planID": "basic"})),
            )
            .await
            .unwrap();
        session
            .make_authenticated_request("/instances/1", Method::DELETE, None)
            .await
            .unwrap();

        let sent = transport.sent();
        assert_eq!(sent[0].method, Method::GET);
        assert_eq!(sent[0].url, "http://api.test/instances");
        assert_eq!(sent[0].bearer.as_deref(), Some("stale"));
        assert_eq!(sent[0].body, None);

        assert_eq!(sent[1].method, Method::POST);
        assert_eq!(sent[1].url, "http://api.test/subscriptions");
        assert_eq!(sent[1].body, Some(json!({"planID": "basic"})));

        assert_eq!(sent[2].method, Method::DELETE);
        assert_eq!(sent[2].body, None);
    }

    #[tokio::test]
    async fn test_non_unauthorized_errors_pass_through() {
        let transport =
            MockTransport::new(|_| Ok(HttpResponse::new(StatusCode::FORBIDDEN, "nope")));
        let session = manager(transport.clone(), logged_in_store());

        let response = session.get("/instances").await.unwrap();

        assert_eq!(response.status, StatusCode::FORBIDDEN);
        assert_eq!(transport.sent().len(), 1);
    }

    #[tokio::test]
    async fn test_transport_error_propagates() {
        let transport =
            MockTransport::new(|_| Err(SessionError::Transport("connection refused".into())));
        let session = manager(transport, logged_in_store());

        let err = session.get("/instances").await.unwrap_err();
        assert_eq!(err, SessionError::Transport("connection refused".into()));
    }

    #[tokio::test]
    async fn test_request_tokens_success() {
        let transport = MockTransport::new(|req| {
            assert_eq!(req.body, Some(json!({"uid": "dXNlcg==", "token": "123456"})));
            ok_json(json!({"result": {"accessToken": "a1", "refreshToken": "r1"}}))
        });
        let store = Arc::new(MemoryTokenStore::new());
        let session = manager(transport.clone(), store.clone());

        session.request_tokens("dXNlcg==", "123456").await.unwrap();

        assert!(session.is_logged_in());
        assert_eq!(store.get(ACCESS_TOKEN_KEY).unwrap().as_deref(), Some("a1"));
        assert_eq!(store.get(REFRESH_TOKEN_KEY).unwrap().as_deref(), Some("r1"));
        assert_eq!(transport.sent()[0].url, "http://api.test/auth/requestTokens");
    }

    #[tokio::test]
    async fn test_request_tokens_failure_joins_messages() {
        let transport = MockTransport::new(|_| {
            Ok(HttpResponse::new(
                StatusCode::BAD_REQUEST,
                json!({"error": "E1", "messages": ["a", "b"]}).to_string(),
            ))
        });
        let session = manager(transport, Arc::new(MemoryTokenStore::new()));

        let err = session.request_tokens("uid", "token").await.unwrap_err();

        assert_eq!(err.to_string(), "a - b");
        assert_eq!(err.code(), Some("E1"));
        assert!(!session.is_logged_in());
    }

    #[tokio::test]
    async fn test_request_tokens_malformed_success_body() {
        let transport = MockTransport::new(|_| ok_json(json!({"result": {}})));
        let session = manager(transport, Arc::new(MemoryTokenStore::new()));

        let err = session.request_tokens("uid", "token").await.unwrap_err();
        assert!(matches!(err, SessionError::InvalidResponse(_)));
        assert!(!session.is_logged_in());
    }

    #[tokio::test]
    async fn test_request_login_link() {
        let transport = MockTransport::new(|req| {
            if req.body == Some(json!({"email": "steve@example.com"})) {
                Ok(HttpResponse::new(StatusCode::NO_CONTENT, ""))
            } else {
                Ok(HttpResponse::new(StatusCode::BAD_REQUEST, "invalid email"))
            }
        });
        let session = manager(transport.clone(), Arc::new(MemoryTokenStore::new()));

        session.request_login_link("steve@example.com").await.unwrap();
        assert_eq!(transport.sent()[0].url, "http://api.test/auth/request");
        assert_eq!(transport.sent()[0].bearer, None);

        let err = session.request_login_link("steve").await.unwrap_err();
        assert_eq!(err.to_string(), "invalid email");
    }

    #[tokio::test]
    async fn test_refresh_failure_leaves_tokens() {
        let transport = MockTransport::new(|_| refresh_fails());
        let store = logged_in_store();
        let session = manager(transport, store.clone());

        let err = session.refresh_session().await.unwrap_err();

        assert_eq!(err.to_string(), "refresh token expired");
        assert_eq!(session.tokens().access_token, "stale");
        assert_eq!(store.get(ACCESS_TOKEN_KEY).unwrap().as_deref(), Some("stale"));
    }

    #[tokio::test]
    async fn test_concurrent_unauthorized_share_one_refresh() {
        let transport = MockTransport::new(fresh_only);
        let session = manager(transport.clone(), logged_in_store());

        let (a, b) = tokio::join!(session.get("/instances"), session.get("/subscriptions"));

        assert_eq!(a.unwrap().status, StatusCode::OK);
        assert_eq!(b.unwrap().status, StatusCode::OK);
        assert_eq!(transport.count(REFRESH_PATH), 1);
    }

    #[tokio::test]
    async fn test_late_unauthorized_reuses_refreshed_token() {
        let transport = MockTransport::new(fresh_only);
        let session = manager(transport.clone(), logged_in_store());

        let (fast, slow) = tokio::join!(session.get("/fast"), session.get("/slow"));

        assert_eq!(fast.unwrap().status, StatusCode::OK);
        assert_eq!(slow.unwrap().status, StatusCode::OK);
        assert_eq!(transport.count(REFRESH_PATH), 1);
        assert_eq!(transport.count("/slow"), 2);
    }

    #[tokio::test]
    async fn test_concurrent_refresh_failures_share_outcome() {
        let transport = MockTransport::new(|_| refresh_fails());
        let session = manager(transport.clone(), logged_in_store());

        let (a, b) = tokio::join!(session.refresh_session(), session.refresh_session());

        assert_eq!(a.unwrap_err(), b.unwrap_err());
        assert_eq!(transport.count(REFRESH_PATH), 1);

        // The slot is emptied, so a later call performs a new exchange
        let _ = session.refresh_session().await;
        assert_eq!(transport.count(REFRESH_PATH), 2);
    }

    #[tokio::test]
    async fn test_logout_during_request_returns_original() {
        let transport = MockTransport::new(fresh_only);
        let session = manager(transport.clone(), logged_in_store());

        let request = session.get("/slow");
        let logout = async {
            tokio::task::yield_now().await;
            session.logout().unwrap();
        };
        let (response, ()) = tokio::join!(request, logout);

        assert_eq!(response.unwrap().status, StatusCode::UNAUTHORIZED);
        assert_eq!(transport.count(REFRESH_PATH), 0);
    }

    #[tokio::test]
    async fn test_logout_during_refresh_stays_logged_out() {
        let transport = MockTransport::with_slow_refresh(fresh_only);
        let store = logged_in_store();
        let session = manager(transport.clone(), store.clone());

        let logout = async {
            tokio::task::yield_now().await;
            session.logout().unwrap();
        };
        let (refresh, ()) = tokio::join!(session.refresh_session(), logout);

        assert_eq!(refresh.unwrap_err(), SessionError::SessionChanged);
        assert_eq!(transport.count(REFRESH_PATH), 1);
        assert!(!session.is_logged_in());
        assert_eq!(session.tokens(), Tokens::default());
        assert!(!store.contains(ACCESS_TOKEN_KEY));
        assert!(!store.contains(REFRESH_TOKEN_KEY));
    }

    #[tokio::test]
    async fn test_relogin_during_refresh_keeps_new_session() {
        let transport = MockTransport::with_slow_refresh(fresh_only);
        let store = logged_in_store();
        let session = manager(transport.clone(), store.clone());

        let relogin = async {
            tokio::task::yield_now().await;
            session.set_tokens("access-2", "refresh-2").unwrap();
        };
        let (refresh, ()) = tokio::join!(session.refresh_session(), relogin);

        assert_eq!(refresh.unwrap_err(), SessionError::SessionChanged);
        assert_eq!(
            session.tokens(),
            Tokens {
                access_token: "access-2".into(),
                refresh_token: "refresh-2".into()
            }
        );
        assert_eq!(store.get(ACCESS_TOKEN_KEY).unwrap().as_deref(), Some("access-2"));
    }
}

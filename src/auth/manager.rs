use chrono::{DateTime, Duration, Utc};
use futures::future::{self, BoxFuture, Either, FutureExt, Ready, Shared};
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use crate::error::{AuthError, Result, TransportError};
use crate::http_client::{RequestSpec, RequestTransport, TransportResponse};

use super::expiry::{ExpiryExtractor, JwtExpiry};
use super::refresh::RefreshTransport;
use super::store::{CredentialStore, MemoryStore};
use super::types::{CredentialPair, TokenInfo, TokenKind, TokenStatus};

type RefreshOutcome = std::result::Result<String, AuthError>;
type SharedRefresh = Shared<BoxFuture<'static, RefreshOutcome>>;

/// Outcome bound at call time: either already known, or the in-flight refresh
type PendingRefresh = Either<Ready<RefreshOutcome>, SharedRefresh>;

/// Refresh currently being driven; every caller that finds it attaches to `handle`
struct InFlight {
    id: u64,
    handle: SharedRefresh,
}

struct SessionState {
    pair: CredentialPair,
    /// Bumped whenever the session is replaced or cleared.
    /// A refresh only applies its result if this is unchanged.
    generation: u64,
    in_flight: Option<InFlight>,
    next_refresh_id: u64,
}

struct Inner {
    state: Mutex<SessionState>,
    /// Serializes store writes, which happen outside `state`
    persist_lock: Mutex<()>,
    refresher: Arc<dyn RefreshTransport>,
    requester: Arc<dyn RequestTransport>,
    expiry: Arc<dyn ExpiryExtractor>,
    store: Arc<dyn CredentialStore>,
}

/// Credential refresh coordinator
///
/// Holds the access/refresh token pair and guarantees that at most one
/// refresh call is outstanding at a time. Concurrent callers that need a
/// refresh attach to the one already running and all observe its outcome.
///
/// Cloning is cheap and every clone shares the same session.
#[derive(Clone)]
pub struct CredentialRefreshCoordinator {
    inner: Arc<Inner>,
}

/// Builder for [`CredentialRefreshCoordinator`]
pub struct CoordinatorBuilder {
    refresher: Arc<dyn RefreshTransport>,
    requester: Arc<dyn RequestTransport>,
    expiry: Arc<dyn ExpiryExtractor>,
    store: Option<Arc<dyn CredentialStore>>,
}

impl CoordinatorBuilder {
    /// Token expiry decoder (defaults to [`JwtExpiry`])
    pub fn expiry(mut self, expiry: Arc<dyn ExpiryExtractor>) -> Self {
        self.expiry = expiry;
        self
    }

    /// Persistence collaborator (defaults to an in-memory store)
    pub fn store(mut self, store: Arc<dyn CredentialStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn build(self) -> CredentialRefreshCoordinator {
        CredentialRefreshCoordinator {
            inner: Arc::new(Inner {
                state: Mutex::new(SessionState {
                    pair: CredentialPair::empty(),
                    generation: 0,
                    in_flight: None,
                    next_refresh_id: 0,
                }),
                persist_lock: Mutex::new(()),
                refresher: self.refresher,
                requester: self.requester,
                expiry: self.expiry,
                store: self.store.unwrap_or_else(|| Arc::new(MemoryStore::new())),
            }),
        }
    }
}

impl CredentialRefreshCoordinator {
    pub fn builder(
        refresher: Arc<dyn RefreshTransport>,
        requester: Arc<dyn RequestTransport>,
    ) -> CoordinatorBuilder {
        CoordinatorBuilder {
            refresher,
            requester,
            expiry: Arc::new(JwtExpiry),
            store: None,
        }
    }

    pub fn new(
        refresher: Arc<dyn RefreshTransport>,
        requester: Arc<dyn RequestTransport>,
        expiry: Arc<dyn ExpiryExtractor>,
    ) -> Self {
        Self::builder(refresher, requester).expiry(expiry).build()
    }

    /// Load a previously persisted pair into memory
    ///
    /// Returns whether a complete pair was found.
    pub fn restore(&self) -> bool {
        match self.inner.store.load() {
            Ok(Some(pair)) if pair.is_complete() => {
                Inner::replace_locked(&mut self.inner.lock(), pair);
                tracing::info!("Restored credentials from store");
                true
            }
            Ok(Some(_)) => {
                tracing::warn!("Stored credentials are incomplete, ignoring");
                false
            }
            Ok(None) => false,
            Err(e) => {
                tracing::warn!("Failed to load stored credentials: {}", e);
                false
            }
        }
    }

    /// Replace the current pair and persist it
    pub fn set_credentials(&self, pair: CredentialPair) {
        Inner::replace_locked(&mut self.inner.lock(), pair);
        self.inner.persist();
    }

    /// Drop the session
    ///
    /// A refresh already in flight still completes, but its result is not applied.
    pub fn clear(&self) {
        Inner::replace_locked(&mut self.inner.lock(), CredentialPair::empty());
        self.inner.persist();
    }

    /// Current pair, complete or not
    pub fn credentials(&self) -> CredentialPair {
        self.inner.lock().pair.clone()
    }

    /// Both tokens are held
    pub fn is_authenticated(&self) -> bool {
        self.inner.lock().pair.is_complete()
    }

    /// Token is absent, has no known expiry, or expires at or before now
    pub fn is_expired(&self, kind: TokenKind) -> bool {
        self.is_expired_at(kind, Utc::now())
    }

    pub fn is_expired_at(&self, kind: TokenKind, now: DateTime<Utc>) -> bool {
        let state = self.inner.lock();
        self.inner.token_expired(state.pair.token(kind), now)
    }

    /// Access token is missing, undecodable, or expires within `threshold`
    ///
    /// A window reaching past the representable range covers every expiry.
    pub fn needs_refresh_within(&self, threshold: Duration) -> bool {
        let state = self.inner.lock();
        match state
            .pair
            .token(TokenKind::Access)
            .and_then(|t| self.inner.expiry.expires_at(t))
        {
            None => true,
            Some(exp) => Utc::now()
                .checked_add_signed(threshold)
                .map_or(true, |deadline| exp <= deadline),
        }
    }

    pub fn token_info(&self) -> TokenInfo {
        let state = self.inner.lock();
        let pair = &state.pair;
        let expires = |t: &Option<String>| t.as_deref().and_then(|t| self.inner.expiry.expires_at(t));
        TokenInfo {
            has_access_token: pair.access_token.is_some(),
            has_refresh_token: pair.refresh_token.is_some(),
            is_authenticated: pair.is_complete(),
            access_expires_at: expires(&pair.access_token),
            refresh_expires_at: expires(&pair.refresh_token),
        }
    }

    /// Ask the backend how it sees the current access token
    ///
    /// The token is sent as it is, without refreshing it first.
    pub async fn server_token_status(&self) -> Result<TokenStatus> {
        let access_token = self
            .inner
            .lock()
            .pair
            .token(TokenKind::Access)
            .map(str::to_string);
        let Some(access_token) = access_token else {
            return Err(AuthError::SessionExpired);
        };

        self.inner
            .refresher
            .token_status(&access_token)
            .await
            .map_err(AuthError::RequestFailed)
    }

    /// Obtain a pair from username and password and store it
    pub async fn login(&self, username: &str, password: &str) -> Result<()> {
        let pair = self
            .inner
            .refresher
            .login(username, password)
            .await
            .map_err(|e| {
                tracing::error!("Login failed: {}", e);
                AuthError::LoginFailed(e)
            })?;

        self.set_credentials(pair);
        tracing::info!(username = %username, "Login successful, tokens saved");
        Ok(())
    }

    /// Revoke the session server-side (best effort) and clear it locally
    pub async fn logout(&self) {
        let access_token = self.inner.lock().pair.access_token.clone();
        if let Some(token) = access_token {
            if let Err(e) = self.inner.refresher.logout(&token).await {
                tracing::warn!("Logout API call failed: {}", e);
            }
        }
        self.clear();
        tracing::info!("Logged out");
    }

    /// Current access token, refreshing it first if it has expired
    ///
    /// Whether to refresh is decided by this call, not by the first poll of
    /// the returned future: a caller that finds a refresh in flight gets that
    /// refresh's outcome even if it only awaits after it settled.
    pub fn get_valid_access_token(&self) -> impl Future<Output = Result<String>> + Send + 'static {
        let state = self.inner.lock();
        if let Some(token) = state.pair.token(TokenKind::Access) {
            if !self.inner.token_expired(Some(token), Utc::now()) {
                return Either::Left(future::ready(Ok(token.to_string())));
            }
        }
        self.inner.begin_refresh(state)
    }

    /// Refresh the access token, joining a refresh already in flight
    ///
    /// Bound at call time like [`get_valid_access_token`](Self::get_valid_access_token).
    /// The refresh runs on its own task and completes even if every caller
    /// drops its future.
    pub fn refresh(&self) -> impl Future<Output = Result<String>> + Send + 'static {
        self.inner.begin_refresh(self.inner.lock())
    }

    /// Send `spec` with a bearer token, refreshing and retrying once on 401
    ///
    /// Non-401 responses are returned as they are, whatever their status.
    pub async fn authorized_request(&self, spec: &RequestSpec) -> Result<TransportResponse> {
        let token = self.get_valid_access_token().await?;
        let response = self.send(spec, &token).await?;
        if !response.is_unauthorized() {
            return Ok(response);
        }

        tracing::warn!("Received 401, refreshing token and retrying...");
        let token = self.renew_after_rejection(&token).await?;

        let response = self.send(spec, &token).await?;
        if response.is_unauthorized() {
            tracing::error!("Request still unauthorized after token refresh, clearing session");
            self.clear();
            return Err(AuthError::Unauthorized);
        }
        Ok(response)
    }

    /// Token to retry with after `rejected` got a 401
    ///
    /// Another request may already have rotated the pair; in that case the
    /// newer token is used instead of starting another refresh.
    fn renew_after_rejection(&self, rejected: &str) -> PendingRefresh {
        let state = self.inner.lock();
        if let Some(current) = state.pair.token(TokenKind::Access) {
            if current != rejected && !self.inner.token_expired(Some(current), Utc::now()) {
                tracing::debug!("Token already rotated by a concurrent refresh");
                return Either::Left(future::ready(Ok(current.to_string())));
            }
        }
        self.inner.begin_refresh(state)
    }

    async fn send(&self, spec: &RequestSpec, token: &str) -> Result<TransportResponse> {
        let refresh_token = self
            .inner
            .lock()
            .pair
            .token(TokenKind::Refresh)
            .map(str::to_string);
        let response = self
            .inner
            .requester
            .send(spec, token, refresh_token.as_deref())
            .await
            .map_err(AuthError::RequestFailed)?;

        if let Some(pair) = response.rotated_credentials() {
            tracing::info!("Tokens refreshed automatically by server");
            self.set_credentials(pair);
        }
        Ok(response)
    }
}

impl Inner {
    fn lock(&self) -> MutexGuard<'_, SessionState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn token_expired(&self, token: Option<&str>, now: DateTime<Utc>) -> bool {
        match token.and_then(|t| self.expiry.expires_at(t)) {
            None => true,
            Some(exp) => exp <= now,
        }
    }

    /// Start a new session epoch; any in-flight refresh is orphaned
    fn replace_locked(state: &mut SessionState, pair: CredentialPair) {
        state.pair = pair;
        state.generation += 1;
        state.in_flight = None;
    }

    /// Write the current pair to the store
    ///
    /// Called without the state lock held. Writers are serialized and always
    /// write the latest pair, so the store never ends up behind memory.
    fn persist(&self) {
        let _writer = self
            .persist_lock
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        let pair = self.lock().pair.clone();
        let result = if pair == CredentialPair::empty() {
            self.store.erase()
        } else {
            self.store.save(&pair)
        };
        if let Err(e) = result {
            tracing::warn!("Failed to persist credentials: {}", e);
        }
    }

    /// Attach to the in-flight refresh, or start one
    ///
    /// Takes the guard so the check and the install happen in one critical
    /// section.
    fn begin_refresh(self: &Arc<Self>, mut state: MutexGuard<'_, SessionState>) -> PendingRefresh {
        if let Some(in_flight) = &state.in_flight {
            tracing::debug!(refresh_id = in_flight.id, "Attaching to in-flight refresh");
            return Either::Right(in_flight.handle.clone());
        }

        let refresh_token = state
            .pair
            .token(TokenKind::Refresh)
            .filter(|t| !self.token_expired(Some(*t), Utc::now()))
            .map(str::to_string);
        let Some(refresh_token) = refresh_token else {
            tracing::warn!("Refresh token expired or not available, clearing session");
            Self::replace_locked(&mut state, CredentialPair::empty());
            drop(state);
            self.persist();
            return Either::Left(future::ready(Err(AuthError::SessionExpired)));
        };

        state.next_refresh_id += 1;
        let id = state.next_refresh_id;
        let body = Self::run_refresh(
            Arc::downgrade(self),
            Arc::clone(&self.refresher),
            id,
            state.generation,
            refresh_token,
        );
        let handle = Self::drive(Arc::downgrade(self), id, body);

        tracing::debug!(refresh_id = id, "Starting token refresh");
        state.in_flight = Some(InFlight {
            id,
            handle: handle.clone(),
        });
        Either::Right(handle)
    }

    /// Spawn the refresh so it runs to completion regardless of its waiters
    fn drive(
        inner: Weak<Inner>,
        id: u64,
        body: impl Future<Output = RefreshOutcome> + Send + 'static,
    ) -> SharedRefresh {
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            // No runtime: the waiters poll it themselves
            return body.boxed().shared();
        };

        let task = runtime.spawn(body);
        async move {
            task.await.unwrap_or_else(|e| {
                tracing::error!(refresh_id = id, "Refresh task did not complete: {}", e);
                if let Some(inner) = inner.upgrade() {
                    let mut state = inner.lock();
                    if state.in_flight.as_ref().is_some_and(|f| f.id == id) {
                        state.in_flight = None;
                    }
                }
                Err(AuthError::RefreshFailed(TransportError::Network(format!(
                    "Refresh task did not complete: {}",
                    e
                ))))
            })
        }
        .boxed()
        .shared()
    }

    /// Body of the refresh task
    async fn run_refresh(
        inner: Weak<Inner>,
        refresher: Arc<dyn RefreshTransport>,
        id: u64,
        generation: u64,
        refresh_token: String,
    ) -> RefreshOutcome {
        let result = refresher.refresh(&refresh_token).await;

        let Some(inner) = inner.upgrade() else {
            return result
                .map(|pair| pair.access_token.unwrap_or_default())
                .map_err(AuthError::RefreshFailed);
        };

        let (outcome, changed) = inner.settle(id, generation, result);
        if changed {
            inner.persist();
        }
        outcome
    }

    /// Apply a finished refresh to the session; reports whether the pair changed
    fn settle(
        &self,
        id: u64,
        generation: u64,
        result: std::result::Result<CredentialPair, TransportError>,
    ) -> (RefreshOutcome, bool) {
        let mut state = self.lock();
        if state.in_flight.as_ref().is_some_and(|f| f.id == id) {
            state.in_flight = None;
        }

        // Cleared or replaced while the call was out: never apply the result.
        // Waiters continue with the replacement session if there is one.
        if state.generation != generation {
            tracing::debug!(
                refresh_id = id,
                "Session changed while refreshing, discarding refresh result"
            );
            let outcome = match (state.pair.token(TokenKind::Access), result) {
                (Some(current), _) => Ok(current.to_string()),
                (None, Ok(_)) => Err(AuthError::SessionExpired),
                (None, Err(e)) => Err(AuthError::RefreshFailed(e)),
            };
            return (outcome, false);
        }

        match result {
            Ok(pair) => match pair.access_token.clone().filter(|_| pair.is_complete()) {
                Some(access_token) => {
                    Self::replace_locked(&mut state, pair);
                    tracing::info!(refresh_id = id, "Tokens refreshed successfully");
                    (Ok(access_token), true)
                }
                None => {
                    tracing::error!(refresh_id = id, "Refresh returned an incomplete token pair");
                    Self::replace_locked(&mut state, CredentialPair::empty());
                    let cause = TransportError::Malformed(
                        "Refresh returned an incomplete token pair".to_string(),
                    );
                    (Err(AuthError::RefreshFailed(cause)), true)
                }
            },
            Err(e) => {
                tracing::error!(refresh_id = id, "Token refresh failed: {}", e);
                Self::replace_locked(&mut state, CredentialPair::empty());
                (Err(AuthError::RefreshFailed(e)), true)
            }
        }
    }
}

//! The session client.
//!
//! Owns authentication status, the signed-in user, the API token cache and
//! the event bus UI consumers subscribe to. One instance per application,
//! constructed at the composition root and cloned into consumers (clones
//! share state).
//!
//! ```text
//! init() ──→ [Initializing] ──silent sign-in ok──→ [Authorized] ──→ poller, expiry timer
//!                  │                                   │  ▲
//!                  └──login required / failure──→ [Unauthorized]   (token expired, logout)
//! ```

use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::task::{Context, Poll};
use std::time::Duration;

use futures_util::FutureExt;
use futures_util::future::{BoxFuture, Shared};
use parking_lot::Mutex;
use tokio::task::{JoinError, JoinHandle};
use url::Url;

use crate::config::SessionConfig;
use crate::error::Error;
use crate::events::{Disposer, EventBus, EventKind, Listener, SessionEvent};
use crate::poller::{PollDirective, Poller, PollerConfig};
use crate::provider::IdentityProvider;
use crate::state::{self, Action, SessionState};
use crate::storage::{MemoryStorage, SessionStorage};
use crate::token::{self, ApiTokenCache, ApiTokenRequest, ApiTokens, FetchError};
use crate::types::{ErrorKind, SessionError, Status, User};
use crate::user::OidcUser;

/// Result of an initialization or callback operation: the user when signed in,
/// `None` when the user simply is not logged in.
pub type InitOutcome = Result<Option<User>, SessionError>;

/// Handle to the single in-flight (or finished) initialization.
///
/// Every caller of [`SessionClient::init`] gets a clone of the same handle;
/// awaiting any clone yields the same outcome.
#[derive(Clone)]
pub struct PendingInit(Shared<BoxFuture<'static, InitOutcome>>);

impl PendingInit {
    /// Whether both handles refer to the same operation.
    #[must_use]
    pub fn ptr_eq(&self, other: &Self) -> bool {
        self.0.ptr_eq(&other.0)
    }

    /// The outcome, if the operation has finished.
    #[must_use]
    pub fn peek(&self) -> Option<&InitOutcome> {
        self.0.peek()
    }
}

impl Future for PendingInit {
    type Output = InitOutcome;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        self.0.poll_unpin(cx)
    }
}

impl std::fmt::Debug for PendingInit {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("PendingInit")
            .field(&if self.peek().is_some() { "done" } else { "pending" })
            .finish()
    }
}

enum InitPhase {
    NotStarted,
    Started(PendingInit),
}

/// Where a user record came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Origin {
    SignIn,
    Renewal,
    Reload,
}

struct Inner<P> {
    config: SessionConfig,
    provider: P,
    storage: Arc<dyn SessionStorage>,
    http: reqwest::Client,
    events: EventBus,
    state: Mutex<SessionState>,
    oidc_user: Mutex<Option<OidcUser>>,
    api_tokens: Mutex<ApiTokenCache>,
    phase: Mutex<InitPhase>,
    /// Bumped whenever the local session ends. Operations started under an
    /// older generation drop their result.
    generation: AtomicU64,
    poller: Poller,
    expiry_timer: Mutex<Option<JoinHandle<()>>>,
}

impl<P> Drop for Inner<P> {
    fn drop(&mut self) {
        if let Some(timer) = self.expiry_timer.get_mut().take() {
            timer.abort();
        }
    }
}

impl<P: IdentityProvider> Inner<P> {
    /// Apply `action`; publish its event after the state lock is released.
    /// Returns whether anything changed.
    fn dispatch(&self, action: Action) -> bool {
        let event = {
            let mut state = self.state.lock();
            let Some(transition) = state::reduce(&state, action) else {
                return false;
            };
            *state = transition.state;
            transition.event
        };
        if let Some(event) = event {
            tracing::debug!(?event, "Session state changed");
            self.events.publish(&event);
        }
        true
    }

    fn set_status(&self, status: Status) -> bool {
        self.dispatch(Action::SetStatus(status))
    }

    fn set_error(&self, error: SessionError) -> bool {
        self.dispatch(Action::SetError(error))
    }

    fn is_authenticated(&self) -> bool {
        self.state.lock().is_authenticated()
    }

    fn access_token(&self) -> Option<String> {
        self.oidc_user
            .lock()
            .as_ref()
            .map(|user| user.access_token.clone())
    }

    /// Record `error` under `kind` and hand it back for the caller.
    fn record(&self, kind: ErrorKind, error: &Error) -> SessionError {
        tracing::warn!(kind = %kind, error = %error, "Session operation failed");
        let recorded = SessionError::new(kind, error.to_string());
        self.set_error(recorded.clone());
        recorded
    }

    /// Record a sign-in failure and fall back to `Unauthorized`.
    fn fail_auth(&self, error: &Error) -> SessionError {
        let recorded = self.record(ErrorKind::AuthError, error);
        self.set_status(Status::Unauthorized);
        recorded
    }

    fn fail_init(&self, join_error: &JoinError) -> SessionError {
        tracing::error!(error = %join_error, "Session initialization task failed");
        let recorded = SessionError::new(ErrorKind::InitError, join_error.to_string());
        self.set_error(recorded.clone());
        self.set_status(Status::Unauthorized);
        recorded
    }

    async fn check_session(&self) -> Result<(), FetchError> {
        let Some(access_token) = self.access_token() else {
            return Ok(());
        };
        token::check_user_info(&self.http, self.config.oidc.userinfo_url(), &access_token).await
    }

    fn on_poll_error(&self, error: &FetchError) -> PollDirective {
        if error.is_auth_rejection() && self.is_authenticated() {
            tracing::warn!(status = ?error.status, "Session ended outside this client");
            self.set_error(SessionError::new(
                ErrorKind::UnexpectedAuthChange,
                error.message.clone().unwrap_or_default(),
            ));
            return PollDirective::STOP;
        }
        tracing::debug!(status = ?error.status, error = %error, "Transient session check failure");
        PollDirective::CONTINUE
    }

    fn token_expired(&self) {
        tracing::info!("Access token expired");
        self.events.publish(&SessionEvent::TokenExpired);
        self.poller.stop();
        self.api_tokens.lock().clear();
        *self.oidc_user.lock() = None;
        self.set_status(Status::Unauthorized);
    }

    fn cancel_expiry_timer(&self) {
        if let Some(timer) = self.expiry_timer.lock().take() {
            timer.abort();
        }
    }

    fn generation(&self) -> u64 {
        self.generation.load(Ordering::SeqCst)
    }

    fn is_current(&self, generation: u64) -> bool {
        self.generation() == generation
    }

    /// Tear down everything hanging off the signed-in user and invalidate
    /// operations still in flight. Returns the dropped user record.
    fn end_session(&self) -> Option<OidcUser> {
        self.poller.stop();
        self.cancel_expiry_timer();
        let user = {
            let mut slot = self.oidc_user.lock();
            self.generation.fetch_add(1, Ordering::SeqCst);
            slot.take()
        };
        self.api_tokens.lock().clear();
        *self.phase.lock() = InitPhase::NotStarted;
        user
    }

    /// An operation finished after the session it belonged to ended.
    fn discard_stale(&self, operation: &'static str) {
        tracing::debug!(operation, "Discarding result of an operation from an ended session");
        // The provider may have persisted the user it produced; after a
        // logout that record must not outlive it.
        if self.state.lock().status == Status::Unauthorized {
            self.storage.remove(&self.config.oidc.user_storage_key());
        }
    }
}

fn session_poller<P: IdentityProvider>(inner: &Weak<Inner<P>>, interval: Duration) -> PollerConfig {
    let poll_inner = inner.clone();
    let should_inner = inner.clone();
    let error_inner = inner.clone();
    PollerConfig {
        interval,
        poll: Arc::new(move || {
            let inner = poll_inner.clone();
            async move {
                match inner.upgrade() {
                    Some(inner) => inner.check_session().await,
                    None => Ok(()),
                }
            }
            .boxed()
        }),
        should_poll: Arc::new(move || {
            should_inner
                .upgrade()
                .is_some_and(|inner| inner.is_authenticated())
        }),
        on_error: Arc::new(move |error: &FetchError| match error_inner.upgrade() {
            Some(inner) => inner.on_poll_error(error),
            None => PollDirective::STOP,
        }),
    }
}

/// Outcome of an operation whose session ended before it completed. Not
/// recorded on the session.
fn ended_during(kind: ErrorKind, operation: &str) -> SessionError {
    SessionError::new(kind, format!("session ended during {operation}"))
}

/// Builder for [`SessionClient`].
pub struct SessionClientBuilder<P> {
    config: SessionConfig,
    provider: P,
    storage: Option<Arc<dyn SessionStorage>>,
    http: Option<reqwest::Client>,
}

impl<P: IdentityProvider> SessionClientBuilder<P> {
    /// Storage shared with the provider. Defaults to a fresh [`MemoryStorage`].
    #[must_use]
    pub fn with_storage(mut self, storage: Arc<dyn SessionStorage>) -> Self {
        self.storage = Some(storage);
        self
    }

    /// Use a custom HTTP client (for connection pool reuse or testing).
    #[must_use]
    pub fn with_http_client(mut self, client: reqwest::Client) -> Self {
        self.http = Some(client);
        self
    }

    #[must_use]
    pub fn build(self) -> SessionClient<P> {
        let Self {
            config,
            provider,
            storage,
            http,
        } = self;
        let inner = Arc::new_cyclic(|weak| Inner {
            poller: Poller::new(session_poller(weak, config.poll_interval)),
            config,
            provider,
            storage: storage.unwrap_or_else(|| Arc::new(MemoryStorage::new())),
            http: http.unwrap_or_default(),
            events: EventBus::new(),
            state: Mutex::new(SessionState::default()),
            oidc_user: Mutex::new(None),
            api_tokens: Mutex::new(ApiTokenCache::default()),
            phase: Mutex::new(InitPhase::NotStarted),
            generation: AtomicU64::new(0),
            expiry_timer: Mutex::new(None),
        });
        SessionClient { inner }
    }
}

/// Authentication session shared by the whole application.
pub struct SessionClient<P> {
    inner: Arc<Inner<P>>,
}

// Manual Clone: avoid derive adding a `P: Clone` bound.
impl<P> Clone for SessionClient<P> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<P> std::fmt::Debug for SessionClient<P> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionClient")
            .field("state", &*self.inner.state.lock())
            .field("polling", &self.inner.poller.is_running())
            .finish_non_exhaustive()
    }
}

impl SessionClient<crate::oidc::OidcClient> {
    /// HTTP OIDC client over in-memory session storage.
    #[must_use]
    pub fn from_config(config: SessionConfig) -> Self {
        let storage: Arc<dyn SessionStorage> = Arc::new(MemoryStorage::new());
        let provider = crate::oidc::OidcClient::new(config.oidc.clone(), Arc::clone(&storage));
        Self::builder(config, provider).with_storage(storage).build()
    }
}

impl<P: IdentityProvider> SessionClient<P> {
    #[must_use]
    pub fn builder(config: SessionConfig, provider: P) -> SessionClientBuilder<P> {
        SessionClientBuilder {
            config,
            provider,
            storage: None,
            http: None,
        }
    }

    #[must_use]
    pub fn new(config: SessionConfig, provider: P, storage: Arc<dyn SessionStorage>) -> Self {
        Self::builder(config, provider).with_storage(storage).build()
    }

    // ── Initialization ─────────────────────────────────────────────

    /// Resume the session on application load.
    ///
    /// Tries silent sign-in (or, with auto-sign-in disabled, the cached
    /// user). While an operation is pending, or after it finished, every call
    /// returns the same [`PendingInit`]. Must be called inside a tokio runtime.
    ///
    /// The outcome is `Ok(None)` when the provider says login is required,
    /// or when [`logout`](Self::logout) or [`login`](Self::login) ran while
    /// the operation was pending; other failures are recorded as
    /// [`ErrorKind::AuthError`] and returned.
    pub fn init(&self) -> PendingInit {
        self.start_operation(Self::run_init)
    }

    /// Complete the identity provider's redirect back to the application.
    ///
    /// # Errors
    ///
    /// Returns [`Error::AlreadyInitialized`] if the client is already
    /// initialized, which means the callback ran twice.
    pub fn handle_callback(&self, callback_url: Url) -> Result<PendingInit, Error> {
        if self.is_initialized() {
            tracing::error!("Redirect callback received by an initialized session client");
            return Err(Error::AlreadyInitialized);
        }
        Ok(self.start_operation(move |client, generation| {
            client.run_callback(callback_url, generation)
        }))
    }

    /// Begin interactive sign-in. Returns the URL to redirect the user to and
    /// prepares the client to handle the callback.
    ///
    /// Any current session ends locally: tokens, polling and the expiry timer
    /// are dropped. Stored session data is kept.
    ///
    /// # Errors
    ///
    /// Propagates the provider's failure to build the authorization request.
    pub fn login(&self) -> Result<Url, Error> {
        let url = self.inner.provider.authorization_url()?;
        self.inner.end_session();
        self.inner.set_status(Status::None);
        tracing::info!("Redirecting to identity provider");
        Ok(url)
    }

    fn start_operation<F, Fut>(&self, operation: F) -> PendingInit
    where
        F: FnOnce(Self, u64) -> Fut,
        Fut: Future<Output = InitOutcome> + Send + 'static,
    {
        let mut phase = self.inner.phase.lock();
        if let InitPhase::Started(pending) = &*phase {
            return pending.clone();
        }

        let task = tokio::spawn(operation(self.clone(), self.inner.generation()));
        let inner = Arc::downgrade(&self.inner);
        let pending = PendingInit(
            async move {
                match task.await {
                    Ok(outcome) => outcome,
                    Err(join_error) => Err(match inner.upgrade() {
                        Some(inner) => inner.fail_init(&join_error),
                        None => SessionError::new(ErrorKind::InitError, join_error.to_string()),
                    }),
                }
            }
            .boxed()
            .shared(),
        );
        *phase = InitPhase::Started(pending.clone());
        pending
    }

    async fn run_init(self, generation: u64) -> InitOutcome {
        let inner = &self.inner;
        if !inner.is_current(generation) {
            return Ok(None);
        }
        inner.set_status(Status::Initializing);

        let attempt = if inner.config.auto_sign_in {
            inner.provider.signin_silent().await.map(Some)
        } else {
            inner.provider.get_user().await
        };
        if !inner.is_current(generation) {
            inner.discard_stale("init");
            return Ok(None);
        }

        match attempt {
            Ok(Some(oidc_user)) => Ok(self.authorize(oidc_user, Origin::SignIn, generation).await),
            Ok(None) => {
                tracing::debug!("No cached user");
                inner.set_status(Status::Unauthorized);
                Ok(None)
            }
            Err(e) if e.is_login_required() => {
                tracing::debug!("Login required");
                inner.set_status(Status::Unauthorized);
                Ok(None)
            }
            Err(e) => Err(inner.fail_auth(&e)),
        }
    }

    async fn run_callback(self, callback_url: Url, generation: u64) -> InitOutcome {
        if !self.inner.is_current(generation) {
            return Ok(None);
        }
        self.inner.set_status(Status::Initializing);
        let result = self.inner.provider.signin_callback(&callback_url).await;
        if !self.inner.is_current(generation) {
            self.inner.discard_stale("callback");
            return Ok(None);
        }
        match result {
            Ok(oidc_user) => Ok(self.authorize(oidc_user, Origin::SignIn, generation).await),
            Err(e) => Err(self.inner.fail_auth(&e)),
        }
    }

    /// Install a user record and everything that hangs off it. `None` when
    /// the session of `generation` has ended in the meantime.
    async fn authorize(&self, oidc_user: OidcUser, origin: Origin, generation: u64) -> Option<User> {
        let user = oidc_user.user();
        let expires_in = oidc_user.expires_in();
        {
            let mut slot = self.inner.oidc_user.lock();
            if !self.inner.is_current(generation) {
                drop(slot);
                self.inner.discard_stale("authorize");
                return None;
            }
            *slot = Some(oidc_user);
        }
        self.inner.dispatch(Action::Authorize(user.clone()));

        if origin == Origin::SignIn {
            tracing::info!(email = ?user.email, "Session authorized");
            self.inner
                .events
                .publish(&SessionEvent::AuthSuccess(user.clone()));
        }
        self.schedule_expiry(expires_in);
        self.inner.poller.start();

        if origin != Origin::Reload {
            self.fetch_default_api_token().await;
        }
        Some(user)
    }

    // ── Token lifecycle ────────────────────────────────────────────

    fn schedule_expiry(&self, expires_in: Option<Duration>) {
        let mut slot = self.inner.expiry_timer.lock();
        if let Some(previous) = slot.take() {
            previous.abort();
        }
        let Some(expires_in) = expires_in else {
            return;
        };

        let renew_in = expires_in.saturating_sub(self.inner.config.expiring_notice);
        let weak = Arc::downgrade(&self.inner);
        *slot = Some(tokio::spawn(async move {
            tokio::time::sleep(renew_in).await;
            if let Some(inner) = weak.upgrade() {
                tokio::spawn(SessionClient { inner }.on_token_expiring());
            }
            // Renewal replaces this timer; reaching the end means it did not happen.
            tokio::time::sleep(expires_in - renew_in).await;
            if let Some(inner) = weak.upgrade() {
                inner.token_expired();
            }
        }));
    }

    async fn on_token_expiring(self) {
        tracing::debug!("Access token expiring");
        self.inner.events.publish(&SessionEvent::TokenExpiring);
        self.inner.poller.stop();
        if self.inner.config.auto_silent_renew {
            // Failure is already recorded as AuthRefreshError.
            let _ = self.renew().await;
        }
    }

    /// Silently refresh the tokens now.
    ///
    /// On success the API tokens are re-fetched and session polling resumes.
    /// Failures are recorded as [`ErrorKind::AuthRefreshError`]; the status is
    /// left alone until the token actually expires.
    pub async fn renew(&self) -> Result<User, SessionError> {
        let generation = self.inner.generation();
        match self.inner.provider.signin_silent().await {
            Ok(oidc_user) => {
                let user = self
                    .authorize(oidc_user, Origin::Renewal, generation)
                    .await
                    .ok_or_else(|| ended_during(ErrorKind::AuthRefreshError, "renewal"))?;
                tracing::info!("Session tokens renewed");
                Ok(user)
            }
            Err(_) if !self.inner.is_current(generation) => {
                Err(ended_during(ErrorKind::AuthRefreshError, "renewal"))
            }
            Err(e) => Err(self.inner.record(ErrorKind::AuthRefreshError, &e)),
        }
    }

    /// Re-read the user from the provider's cache.
    ///
    /// Failures and a missing user are recorded as [`ErrorKind::LoadError`].
    pub async fn reload_user(&self) -> Result<User, SessionError> {
        let generation = self.inner.generation();
        match self.inner.provider.get_user().await {
            Ok(Some(oidc_user)) => self
                .authorize(oidc_user, Origin::Reload, generation)
                .await
                .ok_or_else(|| ended_during(ErrorKind::LoadError, "reload")),
            Ok(None) => Err(self.inner.record(
                ErrorKind::LoadError,
                &Error::Storage("no stored user".into()),
            )),
            Err(e) => Err(self.inner.record(ErrorKind::LoadError, &e)),
        }
    }

    // ── API tokens ─────────────────────────────────────────────────

    /// Exchange the current access token for API tokens and cache them.
    ///
    /// # Errors
    ///
    /// Returns the [`FetchError`] describing the failed exchange, or one with
    /// only a message when no user is signed in.
    pub async fn fetch_api_token(&self, request: &ApiTokenRequest) -> Result<ApiTokens, FetchError> {
        let generation = self.inner.generation();
        let access_token = self
            .inner
            .access_token()
            .ok_or_else(|| FetchError::message("No access token available"))?;
        let tokens = token::fetch_api_token(
            &self.inner.http,
            &self.inner.config.token_exchange_url,
            request,
            &access_token,
        )
        .await?;
        if !self.inner.is_current(generation) {
            return Err(FetchError::message("Session ended during token fetch"));
        }
        self.inner.api_tokens.lock().merge(tokens.clone());
        tracing::debug!(audience = %request.audience, count = tokens.len(), "API tokens cached");
        Ok(tokens)
    }

    async fn fetch_default_api_token(&self) {
        let Some(request) = self.inner.config.api_token.clone() else {
            return;
        };
        let generation = self.inner.generation();
        if let Err(error) = self.fetch_api_token(&request).await {
            if !self.inner.is_current(generation) {
                return;
            }
            tracing::warn!(
                audience = %request.audience,
                status = ?error.status,
                error = %error,
                "Automatic API token fetch failed"
            );
            self.inner
                .set_error(SessionError::new(ErrorKind::AuthError, error.to_string()));
        }
    }

    #[must_use]
    pub fn api_token(&self, name: &str) -> Option<String> {
        self.inner.api_tokens.lock().get(name).map(str::to_owned)
    }

    #[must_use]
    pub fn api_tokens(&self) -> ApiTokens {
        self.inner.api_tokens.lock().all().clone()
    }

    pub fn remove_api_token(&self, name: &str) -> Option<String> {
        self.inner.api_tokens.lock().remove(name)
    }

    // ── Logout ─────────────────────────────────────────────────────

    /// End the session locally and return the provider's end-session URL.
    ///
    /// Clears the API tokens and the whole session storage.
    pub fn logout(&self) -> Url {
        let inner = &self.inner;
        inner.events.publish(&SessionEvent::LoggingOut);

        let id_token = inner.end_session().and_then(|user| user.id_token);
        inner.storage.clear();
        inner.set_status(Status::Unauthorized);

        tracing::info!("Logged out");
        inner.provider.signout_url(id_token.as_deref())
    }

    // ── Read access ────────────────────────────────────────────────

    #[must_use]
    pub fn status(&self) -> Status {
        self.inner.state.lock().status
    }

    #[must_use]
    pub fn error(&self) -> Option<SessionError> {
        self.inner.state.lock().error.clone()
    }

    /// Forget the current error, e.g. when its notification is dismissed.
    pub fn clear_error(&self) {
        self.inner.dispatch(Action::ClearError);
    }

    #[must_use]
    pub fn user(&self) -> Option<User> {
        self.inner.state.lock().user.clone()
    }

    #[must_use]
    pub fn state(&self) -> SessionState {
        self.inner.state.lock().clone()
    }

    #[must_use]
    pub fn is_authenticated(&self) -> bool {
        self.inner.is_authenticated()
    }

    #[must_use]
    pub fn is_initialized(&self) -> bool {
        self.inner.state.lock().is_initialized()
    }

    /// Bearer token for calls to the identity provider itself.
    #[must_use]
    pub fn access_token(&self) -> Option<String> {
        self.inner.access_token()
    }

    #[must_use]
    pub fn is_polling(&self) -> bool {
        self.inner.poller.is_running()
    }

    #[must_use]
    pub fn config(&self) -> &SessionConfig {
        &self.inner.config
    }

    #[must_use]
    pub fn events(&self) -> &EventBus {
        &self.inner.events
    }

    pub fn subscribe(&self, kind: EventKind, listener: Listener) -> Disposer {
        self.inner.events.subscribe(kind, listener)
    }

    pub fn on<F>(&self, kind: EventKind, listener: F) -> Disposer
    where
        F: Fn(&SessionEvent) + Send + Sync + 'static,
    {
        self.inner.events.on(kind, listener)
    }
}

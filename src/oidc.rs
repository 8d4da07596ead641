use std::sync::Arc;

use parking_lot::Mutex;
use serde::Deserialize;
use url::Url;

use crate::error::Error;
use crate::pkce::{self, PkcePair};
use crate::provider::IdentityProvider;
use crate::storage::{self, SessionStorage};
use crate::user::{OidcUser, Profile};

/// OIDC client configuration.
///
/// Endpoints default to the Keycloak layout under the authority
/// (`<authority>/protocol/openid-connect/...`); override with `with_*`.
///
/// ```rust,ignore
/// let config = OidcConfig::new(
///     "https://sso.example.com/realms/helsinki".parse()?,
///     "housing-admin-ui",
///     "https://admin.example.com/callback".parse()?,
/// )
/// .with_scope("openid profile email");
/// ```
#[derive(Debug, Clone)]
#[non_exhaustive]
pub struct OidcConfig {
    pub(crate) authority: Url,
    pub(crate) client_id: String,
    pub(crate) redirect_uri: Url,
    pub(crate) silent_redirect_uri: Option<Url>,
    pub(crate) post_logout_redirect_uri: Option<Url>,
    pub(crate) response_type: String,
    pub(crate) scope: String,
    pub(crate) auth_url: Url,
    pub(crate) token_url: Url,
    pub(crate) userinfo_url: Url,
    pub(crate) end_session_url: Url,
}

/// `base` with `path` appended, keeping any path `base` already has.
pub(crate) fn join_path(base: &Url, path: &str) -> Url {
    let mut url = base.clone();
    let joined = format!(
        "{}/{}",
        base.path().trim_end_matches('/'),
        path.trim_start_matches('/')
    );
    url.set_path(&joined);
    url
}

impl OidcConfig {
    /// Required fields are parameters; everything else has a default.
    #[must_use]
    pub fn new(authority: Url, client_id: impl Into<String>, redirect_uri: Url) -> Self {
        Self {
            auth_url: join_path(&authority, "protocol/openid-connect/auth"),
            token_url: join_path(&authority, "protocol/openid-connect/token"),
            userinfo_url: join_path(&authority, "protocol/openid-connect/userinfo"),
            end_session_url: join_path(&authority, "protocol/openid-connect/logout"),
            authority,
            client_id: client_id.into(),
            redirect_uri,
            silent_redirect_uri: None,
            post_logout_redirect_uri: None,
            response_type: "code".into(),
            scope: "openid profile email".into(),
        }
    }

    /// Page the host serves for iframe-based silent renewal. This client
    /// renews with the refresh token and never navigates there itself.
    #[must_use]
    pub fn with_silent_redirect_uri(mut self, url: Url) -> Self {
        self.silent_redirect_uri = Some(url);
        self
    }

    #[must_use]
    pub fn with_post_logout_redirect_uri(mut self, url: Url) -> Self {
        self.post_logout_redirect_uri = Some(url);
        self
    }

    #[must_use]
    pub fn with_response_type(mut self, response_type: impl Into<String>) -> Self {
        self.response_type = response_type.into();
        self
    }

    #[must_use]
    pub fn with_scope(mut self, scope: impl Into<String>) -> Self {
        self.scope = scope.into();
        self
    }

    #[must_use]
    pub fn with_token_url(mut self, url: Url) -> Self {
        self.token_url = url;
        self
    }

    #[must_use]
    pub fn with_userinfo_url(mut self, url: Url) -> Self {
        self.userinfo_url = url;
        self
    }

    #[must_use]
    pub fn authority(&self) -> &Url {
        &self.authority
    }

    #[must_use]
    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    #[must_use]
    pub fn redirect_uri(&self) -> &Url {
        &self.redirect_uri
    }

    /// Redirect target for hosts that run iframe-based silent renewal.
    /// Carried for them only; [`OidcClient`](crate::OidcClient) does not read it.
    #[must_use]
    pub fn silent_redirect_uri(&self) -> Option<&Url> {
        self.silent_redirect_uri.as_ref()
    }

    #[must_use]
    pub fn scope(&self) -> &str {
        &self.scope
    }

    #[must_use]
    pub fn token_url(&self) -> &Url {
        &self.token_url
    }

    #[must_use]
    pub fn userinfo_url(&self) -> &Url {
        &self.userinfo_url
    }

    /// Session-storage key of the user record.
    #[must_use]
    pub fn user_storage_key(&self) -> String {
        storage::user_key(self.authority.as_str().trim_end_matches('/'), &self.client_id)
    }
}

/// Token endpoint response.
#[derive(Debug, Clone, Deserialize)]
#[non_exhaustive]
pub struct TokenResponse {
    pub access_token: String,
    #[serde(default)]
    pub token_type: Option<String>,
    #[serde(default)]
    pub expires_in: Option<u64>,
    #[serde(default)]
    pub refresh_token: Option<String>,
    #[serde(default)]
    pub id_token: Option<String>,
    #[serde(default)]
    pub scope: Option<String>,
}

#[derive(Debug, Deserialize)]
struct OAuthErrorBody {
    error: String,
    #[serde(default)]
    error_description: Option<String>,
}

/// Redirect in progress: what the callback must match.
#[derive(Debug, Clone)]
struct PendingSignin {
    state: String,
    code_verifier: String,
}

/// HTTP [`IdentityProvider`]: authorization code + PKCE, refresh-token silent
/// sign-in, user record kept in [`SessionStorage`].
pub struct OidcClient {
    config: OidcConfig,
    http: reqwest::Client,
    storage: Arc<dyn SessionStorage>,
    pending: Mutex<Option<PendingSignin>>,
}

impl std::fmt::Debug for OidcClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OidcClient")
            .field("authority", &self.config.authority.as_str())
            .field("client_id", &self.config.client_id)
            .finish_non_exhaustive()
    }
}

impl OidcClient {
    #[must_use]
    pub fn new(config: OidcConfig, storage: Arc<dyn SessionStorage>) -> Self {
        Self {
            config,
            http: reqwest::Client::new(),
            storage,
            pending: Mutex::new(None),
        }
    }

    /// Use a custom HTTP client (for connection pool reuse or testing).
    #[must_use]
    pub fn with_http_client(mut self, client: reqwest::Client) -> Self {
        self.http = client;
        self
    }

    #[must_use]
    pub fn config(&self) -> &OidcConfig {
        &self.config
    }

    /// Exchange an authorization code for tokens using PKCE.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Http`] on network failure, or
    /// [`Error::OAuth`] if the token endpoint returns an error.
    pub async fn exchange_code(
        &self,
        code: &str,
        code_verifier: &str,
    ) -> Result<TokenResponse, Error> {
        let params = [
            ("grant_type", "authorization_code"),
            ("code", code),
            ("redirect_uri", self.config.redirect_uri.as_str()),
            ("client_id", self.config.client_id.as_str()),
            ("code_verifier", code_verifier),
        ];
        self.token_request(&params, "token exchange").await
    }

    /// Trade a refresh token for a fresh access token.
    ///
    /// # Errors
    ///
    /// Returns [`Error::LoginRequired`] when the provider no longer honours the
    /// refresh token, otherwise as [`exchange_code`](Self::exchange_code).
    pub async fn refresh(&self, refresh_token: &str) -> Result<TokenResponse, Error> {
        let params = [
            ("grant_type", "refresh_token"),
            ("refresh_token", refresh_token),
            ("client_id", self.config.client_id.as_str()),
            ("scope", self.config.scope.as_str()),
        ];
        self.token_request(&params, "token refresh").await
    }

    /// Fetch profile claims using an access token.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Http`] on network failure, or
    /// [`Error::OAuth`] if the userinfo endpoint returns an error.
    pub async fn get_user_info(&self, access_token: &str) -> Result<Profile, Error> {
        let response = self
            .http
            .get(self.config.userinfo_url.clone())
            .bearer_auth(access_token)
            .send()
            .await?;

        let response = Self::ensure_success(response, "userinfo request").await?;
        response.json::<Profile>().await.map_err(Into::into)
    }

    async fn token_request(
        &self,
        params: &[(&str, &str)],
        operation: &'static str,
    ) -> Result<TokenResponse, Error> {
        let response = self
            .http
            .post(self.config.token_url.clone())
            .form(params)
            .send()
            .await?;

        let response = Self::ensure_success(response, operation).await?;
        response.json::<TokenResponse>().await.map_err(Into::into)
    }

    /// Checks HTTP response status; returns the response on success or an error with details.
    async fn ensure_success(
        response: reqwest::Response,
        operation: &'static str,
    ) -> Result<reqwest::Response, Error> {
        if response.status().is_success() {
            return Ok(response);
        }
        let status = response.status().as_u16();
        let body = response.text().await.unwrap_or_default();
        if let Ok(parsed) = serde_json::from_str::<OAuthErrorBody>(&body) {
            let detail = parsed.error_description.unwrap_or_else(|| parsed.error.clone());
            return Err(match Error::from_oauth_code(&parsed.error, detail, operation) {
                Error::OAuth {
                    operation, detail, ..
                } => Error::OAuth {
                    operation,
                    status: Some(status),
                    detail,
                },
                other => other,
            });
        }
        Err(Error::OAuth {
            operation,
            status: Some(status),
            detail: body,
        })
    }

    /// Build the stored user from a token response. Profile claims come from
    /// userinfo; on refresh the previous profile is kept if userinfo fails.
    async fn user_from_tokens(
        &self,
        tokens: TokenResponse,
        previous: Option<&OidcUser>,
    ) -> Result<OidcUser, Error> {
        let profile = match (self.get_user_info(&tokens.access_token).await, previous) {
            (Ok(profile), _) => profile,
            (Err(e), Some(previous)) => {
                tracing::warn!(error = %e, "Userinfo failed after refresh, keeping cached profile");
                previous.profile.clone()
            }
            (Err(e), None) => return Err(e),
        };

        let mut user = OidcUser::new(tokens.access_token, profile);
        if let Some(token_type) = tokens.token_type {
            user.token_type = token_type;
        }
        user.refresh_token = tokens
            .refresh_token
            .or_else(|| previous.and_then(|p| p.refresh_token.clone()));
        user.id_token = tokens
            .id_token
            .or_else(|| previous.and_then(|p| p.id_token.clone()));
        user.scope = tokens.scope;
        if let Some(secs) = tokens.expires_in {
            user = user.expiring_in(std::time::Duration::from_secs(secs));
        }
        Ok(user)
    }

    fn store(&self, user: &OidcUser) -> Result<(), Error> {
        storage::store_user(self.storage.as_ref(), &self.config.user_storage_key(), user)
    }

    fn stored_user(&self) -> Option<OidcUser> {
        storage::load_user(self.storage.as_ref(), &self.config.user_storage_key())
    }
}

impl IdentityProvider for OidcClient {
    fn authorization_url(&self) -> Result<Url, Error> {
        let state = pkce::generate_state();
        let pkce = PkcePair::generate();

        let mut url = self.config.auth_url.clone();
        url.query_pairs_mut()
            .append_pair("response_type", &self.config.response_type)
            .append_pair("client_id", &self.config.client_id)
            .append_pair("redirect_uri", self.config.redirect_uri.as_str())
            .append_pair("scope", &self.config.scope)
            .append_pair("state", &state)
            .append_pair("nonce", &pkce::generate_nonce())
            .append_pair("code_challenge", &pkce.challenge)
            .append_pair("code_challenge_method", "S256");

        *self.pending.lock() = Some(PendingSignin {
            state,
            code_verifier: pkce.verifier,
        });
        Ok(url)
    }

    async fn signin_silent(&self) -> Result<OidcUser, Error> {
        let previous = self.stored_user().ok_or(Error::LoginRequired)?;
        let refresh_token = previous
            .refresh_token
            .clone()
            .ok_or(Error::LoginRequired)?;

        let tokens = self.refresh(&refresh_token).await?;
        let user = self.user_from_tokens(tokens, Some(&previous)).await?;
        self.store(&user)?;
        tracing::debug!(sub = %user.profile.sub, "Silent sign-in succeeded");
        Ok(user)
    }

    async fn get_user(&self) -> Result<Option<OidcUser>, Error> {
        Ok(self.stored_user().filter(|user| !user.is_expired()))
    }

    async fn signin_callback(&self, callback_url: &Url) -> Result<OidcUser, Error> {
        let mut code = None;
        let mut state = None;
        let mut error = None;
        let mut error_description = None;
        for (key, value) in callback_url.query_pairs() {
            match key.as_ref() {
                "code" => code = Some(value.into_owned()),
                "state" => state = Some(value.into_owned()),
                "error" => error = Some(value.into_owned()),
                "error_description" => error_description = Some(value.into_owned()),
                _ => {}
            }
        }

        if let Some(error) = error {
            let detail = error_description.unwrap_or_else(|| error.clone());
            tracing::warn!(error = %error, description = %detail, "OAuth2 error from provider");
            return Err(Error::from_oauth_code(&error, detail, "callback"));
        }

        let code = code.ok_or_else(|| Error::Callback("missing_code".into()))?;
        let received_state = state.ok_or_else(|| Error::Callback("state_mismatch".into()))?;
        let pending = self
            .pending
            .lock()
            .take()
            .ok_or_else(|| Error::Callback("no_pending_signin".into()))?;
        if received_state != pending.state {
            tracing::warn!("OAuth state mismatch");
            return Err(Error::Callback("state_mismatch".into()));
        }

        let tokens = self.exchange_code(&code, &pending.code_verifier).await?;
        let user = self.user_from_tokens(tokens, None).await?;
        self.store(&user)?;
        tracing::info!(sub = %user.profile.sub, "OIDC sign-in successful");
        Ok(user)
    }

    fn signout_url(&self, id_token_hint: Option<&str>) -> Url {
        let mut url = self.config.end_session_url.clone();
        {
            let mut query = url.query_pairs_mut();
            query.append_pair("client_id", &self.config.client_id);
            if let Some(hint) = id_token_hint {
                query.append_pair("id_token_hint", hint);
            }
            if let Some(redirect) = &self.config.post_logout_redirect_uri {
                query.append_pair("post_logout_redirect_uri", redirect.as_str());
            }
        }
        url
    }
}

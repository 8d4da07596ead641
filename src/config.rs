use std::time::Duration;

use url::Url;

use crate::error::Error;
use crate::idle::IdleConfig;
use crate::oidc::{OidcConfig, join_path};
use crate::token::ApiTokenRequest;
use crate::types::Audience;

/// Session client configuration.
///
/// Use [`from_env()`](SessionConfig::from_env) for convention-based setup,
/// or [`new()`](SessionConfig::new) with `with_*` methods for full control.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub(crate) oidc: OidcConfig,
    pub(crate) auto_sign_in: bool,
    pub(crate) auto_silent_renew: bool,
    pub(crate) logging: bool,
    pub(crate) token_exchange_url: Url,
    pub(crate) api_token: Option<ApiTokenRequest>,
    pub(crate) idle: IdleConfig,
    pub(crate) poll_interval: Duration,
    pub(crate) expiring_notice: Duration,
}

impl SessionConfig {
    pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(60);
    pub const DEFAULT_EXPIRING_NOTICE: Duration = Duration::from_secs(60);

    /// Create config from the OIDC settings; everything else uses defaults.
    #[must_use]
    pub fn new(oidc: OidcConfig) -> Self {
        Self {
            token_exchange_url: oidc.token_url.clone(),
            oidc,
            auto_sign_in: true,
            auto_silent_renew: true,
            logging: false,
            api_token: None,
            idle: IdleConfig::default(),
            poll_interval: Self::DEFAULT_POLL_INTERVAL,
            expiring_notice: Self::DEFAULT_EXPIRING_NOTICE,
        }
    }

    /// Create config from environment variables.
    ///
    /// # Required env vars
    /// - `OIDC_BASE_URL`: identity provider base URL
    /// - `OIDC_REALM`: realm name; the authority is `<base>/realms/<realm>`
    /// - `OIDC_CLIENT_ID`: OAuth2 client ID
    /// - `OIDC_APP_URL`: origin the redirect paths are resolved against
    ///
    /// # Optional env vars
    /// - `OIDC_CALLBACK_PATH` (`/callback`), `OIDC_LOGOUT_PATH` (`/logout`),
    ///   `OIDC_SILENT_AUTH_PATH` (`/silent-renew`)
    /// - `OIDC_RESPONSE_TYPE` (`code`), `OIDC_SCOPE` (`openid profile email`)
    /// - `OIDC_AUTO_SIGN_IN`, `OIDC_AUTO_SILENT_RENEW` (both `true`),
    ///   `OIDC_LOGGING` (`false`)
    /// - `OIDC_TOKEN_EXCHANGE_PATH` (`/protocol/openid-connect/token`), relative to the authority
    /// - `IDLE_TIMEOUT_MINUTES` (`15`)
    /// - `OIDC_API_TOKEN_AUDIENCE`: enables the automatic API token fetch;
    ///   `OIDC_API_TOKEN_PERMISSION` and `OIDC_API_TOKEN_GRANT_TYPE` refine it
    /// - `SESSION_POLL_INTERVAL_SECONDS` (`60`)
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] if required vars are missing or values are invalid.
    pub fn from_env() -> Result<Self, Error> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Same as [`from_env`](Self::from_env) with an arbitrary key lookup.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] if required keys are missing or values are invalid.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, Error>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());
        let require =
            |key: &str| get(key).ok_or_else(|| Error::Config(format!("{key} is required")));
        let parse_url = |key: &str, raw: &str| {
            raw.parse::<Url>()
                .map_err(|e| Error::Config(format!("{key}: {e}")))
        };
        let flag = |key: &str, default: bool| -> Result<bool, Error> {
            match get(key).as_deref().map(str::trim) {
                None => Ok(default),
                Some("1" | "true" | "TRUE" | "True") => Ok(true),
                Some("0" | "false" | "FALSE" | "False") => Ok(false),
                Some(other) => Err(Error::Config(format!("{key}: expected a boolean, got '{other}'"))),
            }
        };
        let number = |key: &str, default: u64| -> Result<u64, Error> {
            get(key).map_or(Ok(default), |raw| {
                raw.trim()
                    .parse::<u64>()
                    .map_err(|e| Error::Config(format!("{key}: {e}")))
            })
        };

        let base_url = parse_url("OIDC_BASE_URL", &require("OIDC_BASE_URL")?)?;
        let realm = require("OIDC_REALM")?;
        let client_id = require("OIDC_CLIENT_ID")?;
        let app_url = parse_url("OIDC_APP_URL", &require("OIDC_APP_URL")?)?;

        let authority = join_path(&base_url, &format!("realms/{realm}"));
        let path = |key: &str, default: &str| get(key).unwrap_or_else(|| default.to_owned());
        let callback = join_path(&app_url, &path("OIDC_CALLBACK_PATH", "/callback"));
        let logout = join_path(&app_url, &path("OIDC_LOGOUT_PATH", "/logout"));
        let silent = join_path(&app_url, &path("OIDC_SILENT_AUTH_PATH", "/silent-renew"));

        let mut oidc = OidcConfig::new(authority.clone(), client_id, callback)
            .with_post_logout_redirect_uri(logout)
            .with_silent_redirect_uri(silent);
        if let Some(response_type) = get("OIDC_RESPONSE_TYPE") {
            oidc = oidc.with_response_type(response_type);
        }
        if let Some(scope) = get("OIDC_SCOPE") {
            oidc = oidc.with_scope(scope);
        }

        let mut config = Self::new(oidc)
            .with_auto_sign_in(flag("OIDC_AUTO_SIGN_IN", true)?)
            .with_auto_silent_renew(flag("OIDC_AUTO_SILENT_RENEW", true)?)
            .with_logging(flag("OIDC_LOGGING", false)?)
            .with_idle(IdleConfig::default().with_timeout(Duration::from_secs(
                number("IDLE_TIMEOUT_MINUTES", 15)? * 60,
            )))
            .with_poll_interval(Duration::from_secs(number(
                "SESSION_POLL_INTERVAL_SECONDS",
                Self::DEFAULT_POLL_INTERVAL.as_secs(),
            )?));

        if let Some(exchange_path) = get("OIDC_TOKEN_EXCHANGE_PATH") {
            config = config.with_token_exchange_url(join_path(&authority, &exchange_path));
        }

        if let Some(audience) = get("OIDC_API_TOKEN_AUDIENCE") {
            let mut request = ApiTokenRequest::new(Audience(audience));
            if let Some(permission) = get("OIDC_API_TOKEN_PERMISSION") {
                request = request.with_permission(permission);
            }
            if let Some(grant_type) = get("OIDC_API_TOKEN_GRANT_TYPE") {
                request = request.with_grant_type(grant_type);
            }
            config = config.with_api_token(request);
        }

        Ok(config)
    }

    /// Try silent sign-in on `init`; when off, only a cached user is used.
    #[must_use]
    pub fn with_auto_sign_in(mut self, enabled: bool) -> Self {
        self.auto_sign_in = enabled;
        self
    }

    #[must_use]
    pub fn with_auto_silent_renew(mut self, enabled: bool) -> Self {
        self.auto_silent_renew = enabled;
        self
    }

    #[must_use]
    pub fn with_logging(mut self, enabled: bool) -> Self {
        self.logging = enabled;
        self
    }

    #[must_use]
    pub fn with_token_exchange_url(mut self, url: Url) -> Self {
        self.token_exchange_url = url;
        self
    }

    /// API tokens fetched automatically after every sign-in and renewal.
    #[must_use]
    pub fn with_api_token(mut self, request: ApiTokenRequest) -> Self {
        self.api_token = Some(request);
        self
    }

    #[must_use]
    pub fn with_idle(mut self, idle: IdleConfig) -> Self {
        self.idle = idle;
        self
    }

    #[must_use]
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// How long before access-token expiry renewal starts.
    #[must_use]
    pub fn with_expiring_notice(mut self, notice: Duration) -> Self {
        self.expiring_notice = notice;
        self
    }

    #[must_use]
    pub fn oidc(&self) -> &OidcConfig {
        &self.oidc
    }

    #[must_use]
    pub fn logging(&self) -> bool {
        self.logging
    }

    #[must_use]
    pub fn idle(&self) -> &IdleConfig {
        &self.idle
    }

    #[must_use]
    pub fn api_token(&self) -> Option<&ApiTokenRequest> {
        self.api_token.as_ref()
    }

    #[must_use]
    pub fn token_exchange_url(&self) -> &Url {
        &self.token_exchange_url
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| ((*k).to_owned(), (*v).to_owned()))
            .collect();
        move |key| map.get(key).cloned()
    }

    const REQUIRED: [(&str, &str); 4] = [
        ("OIDC_BASE_URL", "https://sso.example.com"),
        ("OIDC_REALM", "helsinki"),
        ("OIDC_CLIENT_ID", "housing-ui"),
        ("OIDC_APP_URL", "https://admin.example.com"),
    ];

    #[test]
    fn defaults_from_required_keys() {
        let config = SessionConfig::from_lookup(lookup(&REQUIRED)).unwrap();

        assert_eq!(
            config.oidc().authority().as_str(),
            "https://sso.example.com/realms/helsinki"
        );
        assert_eq!(
            config.oidc().redirect_uri().as_str(),
            "https://admin.example.com/callback"
        );
        assert_eq!(
            config.oidc().silent_redirect_uri().map(Url::as_str),
            Some("https://admin.example.com/silent-renew")
        );
        assert_eq!(
            config.token_exchange_url().as_str(),
            "https://sso.example.com/realms/helsinki/protocol/openid-connect/token"
        );
        assert!(config.auto_sign_in);
        assert!(config.auto_silent_renew);
        assert!(!config.logging());
        assert!(config.api_token().is_none());
        assert_eq!(config.idle().timeout, Duration::from_secs(15 * 60));
        assert_eq!(config.idle().prompt_before_idle, Duration::from_secs(60));
        assert_eq!(config.poll_interval, Duration::from_secs(60));
    }

    #[test]
    fn missing_required_key() {
        let err = SessionConfig::from_lookup(lookup(&REQUIRED[..3])).unwrap_err();
        assert!(matches!(err, Error::Config(ref m) if m.contains("OIDC_APP_URL")));
    }

    #[test]
    fn invalid_url() {
        let mut pairs = REQUIRED.to_vec();
        pairs[0] = ("OIDC_BASE_URL", "not a url");
        let err = SessionConfig::from_lookup(lookup(&pairs)).unwrap_err();
        assert!(matches!(err, Error::Config(ref m) if m.starts_with("OIDC_BASE_URL")));
    }

    #[test]
    fn optional_overrides() {
        let mut pairs = REQUIRED.to_vec();
        pairs.extend([
            ("OIDC_AUTO_SIGN_IN", "false"),
            ("OIDC_LOGGING", "1"),
            ("OIDC_SCOPE", "openid"),
            ("IDLE_TIMEOUT_MINUTES", "30"),
            ("OIDC_TOKEN_EXCHANGE_PATH", "/protocol/openid-connect/token/exchange"),
            ("OIDC_API_TOKEN_AUDIENCE", "housing-api"),
            ("OIDC_API_TOKEN_PERMISSION", "#read"),
            ("SESSION_POLL_INTERVAL_SECONDS", "5"),
        ]);
        let config = SessionConfig::from_lookup(lookup(&pairs)).unwrap();

        assert!(!config.auto_sign_in);
        assert!(config.logging());
        assert_eq!(config.oidc().scope(), "openid");
        assert_eq!(config.idle().timeout, Duration::from_secs(30 * 60));
        assert_eq!(config.poll_interval, Duration::from_secs(5));
        assert!(config.token_exchange_url().path().ends_with("/token/exchange"));
        let api = config.api_token().unwrap();
        assert_eq!(api.audience.as_str(), "housing-api");
        assert_eq!(api.permission, "#read");
        assert_eq!(api.grant_type, ApiTokenRequest::DEFAULT_GRANT_TYPE);
    }

    #[test]
    fn bad_boolean_and_number() {
        let mut pairs = REQUIRED.to_vec();
        pairs.push(("OIDC_AUTO_SILENT_RENEW", "sometimes"));
        assert!(SessionConfig::from_lookup(lookup(&pairs)).is_err());

        let mut pairs = REQUIRED.to_vec();
        pairs.push(("IDLE_TIMEOUT_MINUTES", "soon"));
        assert!(SessionConfig::from_lookup(lookup(&pairs)).is_err());
    }
}

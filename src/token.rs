use std::collections::BTreeMap;

use serde_json::Value as JsonValue;
use url::Url;

use crate::types::Audience;

/// Message for requests that never produced an HTTP response.
pub const NETWORK_ERROR_MESSAGE: &str = "Network or CORS error occurred";
/// Message for a successful response whose body is not a JSON object.
pub const INVALID_JSON_MESSAGE: &str = "Returned data is not valid json";

/// API tokens keyed by claim name (usually the audience).
pub type ApiTokens = BTreeMap<String, String>;

/// Failed token or userinfo request, returned as a value.
///
/// - network failure: `error` + `message`, no `status`
/// - HTTP failure: `status`, `message` (reason phrase), `error` (body text)
/// - unreadable body: `message`
#[derive(Debug, Clone, Default, PartialEq, Eq, thiserror::Error)]
#[error("{}", self.message.as_deref().unwrap_or("API token request failed"))]
#[non_exhaustive]
pub struct FetchError {
    pub status: Option<u16>,
    pub error: Option<String>,
    pub message: Option<String>,
}

impl FetchError {
    #[must_use]
    pub fn network(cause: impl std::fmt::Display) -> Self {
        Self {
            status: None,
            error: Some(cause.to_string()),
            message: Some(NETWORK_ERROR_MESSAGE.into()),
        }
    }

    #[must_use]
    pub fn http(status: reqwest::StatusCode, body: String) -> Self {
        Self {
            status: Some(status.as_u16()),
            error: Some(body),
            message: Some(status.canonical_reason().unwrap_or("").to_owned()),
        }
    }

    #[must_use]
    pub fn invalid_json() -> Self {
        Self {
            status: None,
            error: None,
            message: Some(INVALID_JSON_MESSAGE.into()),
        }
    }

    #[must_use]
    pub fn message(message: impl Into<String>) -> Self {
        Self {
            status: None,
            error: None,
            message: Some(message.into()),
        }
    }

    /// The server rejected the credentials (401/403).
    #[must_use]
    pub fn is_auth_rejection(&self) -> bool {
        matches!(self.status, Some(401 | 403))
    }
}

/// Parameters of an API token exchange.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApiTokenRequest {
    pub audience: Audience,
    pub permission: String,
    pub grant_type: String,
}

impl ApiTokenRequest {
    pub const DEFAULT_PERMISSION: &'static str = "#access";
    pub const DEFAULT_GRANT_TYPE: &'static str = "urn:ietf:params:oauth:grant-type:uma-ticket";

    #[must_use]
    pub fn new(audience: impl Into<Audience>) -> Self {
        Self {
            audience: audience.into(),
            permission: Self::DEFAULT_PERMISSION.into(),
            grant_type: Self::DEFAULT_GRANT_TYPE.into(),
        }
    }

    #[must_use]
    pub fn with_permission(mut self, permission: impl Into<String>) -> Self {
        self.permission = permission.into();
        self
    }

    #[must_use]
    pub fn with_grant_type(mut self, grant_type: impl Into<String>) -> Self {
        self.grant_type = grant_type.into();
        self
    }
}

/// Exchange the user's access token for audience-scoped API tokens.
///
/// Never fails with a panic or a transport error type: every failure is a
/// [`FetchError`] the caller can inspect.
///
/// # Errors
///
/// See [`FetchError`] for the three failure shapes.
pub async fn fetch_api_token(
    http: &reqwest::Client,
    token_uri: &Url,
    request: &ApiTokenRequest,
    access_token: &str,
) -> Result<ApiTokens, FetchError> {
    let params = [
        ("grant_type", request.grant_type.as_str()),
        ("audience", request.audience.as_str()),
        ("permission", request.permission.as_str()),
    ];
    let response = send(
        http.post(token_uri.clone())
            .bearer_auth(access_token)
            .form(&params),
    )
    .await?;

    let body = response
        .text()
        .await
        .map_err(|_| FetchError::invalid_json())?;
    parse_tokens(&body)
}

/// Bearer `GET` against the userinfo endpoint; only the status matters.
///
/// # Errors
///
/// Returns a [`FetchError`] for network failures and non-success statuses.
pub async fn check_user_info(
    http: &reqwest::Client,
    user_info_uri: &Url,
    access_token: &str,
) -> Result<(), FetchError> {
    send(http.get(user_info_uri.clone()).bearer_auth(access_token))
        .await
        .map(drop)
}

async fn send(request: reqwest::RequestBuilder) -> Result<reqwest::Response, FetchError> {
    let response = request.send().await.map_err(FetchError::network)?;
    if response.status().is_success() {
        return Ok(response);
    }
    let status = response.status();
    let body = response.text().await.unwrap_or_default();
    Err(FetchError::http(status, body))
}

/// Token responses are JSON objects; non-string values keep their JSON text.
fn parse_tokens(body: &str) -> Result<ApiTokens, FetchError> {
    let JsonValue::Object(map) =
        serde_json::from_str::<JsonValue>(body).map_err(|_| FetchError::invalid_json())?
    else {
        return Err(FetchError::invalid_json());
    };
    Ok(map
        .into_iter()
        .map(|(name, value)| {
            let token = match value {
                JsonValue::String(s) => s,
                other => other.to_string(),
            };
            (name, token)
        })
        .collect())
}

/// Audience-keyed API tokens held by the session.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ApiTokenCache {
    tokens: ApiTokens,
}

impl ApiTokenCache {
    /// Add new names and overwrite existing ones.
    pub fn merge(&mut self, tokens: ApiTokens) {
        self.tokens.extend(tokens);
    }

    #[must_use]
    pub fn get(&self, name: &str) -> Option<&str> {
        self.tokens.get(name).map(String::as_str)
    }

    pub fn remove(&mut self, name: &str) -> Option<String> {
        self.tokens.remove(name)
    }

    #[must_use]
    pub fn all(&self) -> &ApiTokens {
        &self.tokens
    }

    pub fn clear(&mut self) {
        self.tokens.clear();
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.tokens.is_empty()
    }
}

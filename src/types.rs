use derive_more::{Display, From, FromStr, Into};
use serde::{Deserialize, Serialize};

/// Authentication status of the session.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Status {
    #[default]
    None,
    Initializing,
    Authorized,
    Unauthorized,
}

impl Status {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::None => "NONE",
            Self::Initializing => "INITIALIZING",
            Self::Authorized => "AUTHORIZED",
            Self::Unauthorized => "UNAUTHORIZED",
        }
    }

    /// Initialization has finished one way or the other.
    #[must_use]
    pub fn is_settled(self) -> bool {
        matches!(self, Self::Authorized | Self::Unauthorized)
    }
}

impl std::fmt::Display for Status {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Classification of session errors.
///
/// Errors are deduplicated by kind: a second error of the kind already
/// recorded is dropped, whatever its message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorKind {
    InitError,
    AuthError,
    AuthRefreshError,
    LoadError,
    UnexpectedAuthChange,
    UserDataError,
}

impl ErrorKind {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::InitError => "INIT_ERROR",
            Self::AuthError => "AUTH_ERROR",
            Self::AuthRefreshError => "AUTH_REFRESH_ERROR",
            Self::LoadError => "LOAD_ERROR",
            Self::UnexpectedAuthChange => "UNEXPECTED_AUTH_CHANGE",
            Self::UserDataError => "USER_DATA_ERROR",
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A recorded session error, as published to `Error` listeners.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, thiserror::Error)]
#[error("{kind}: {message}")]
pub struct SessionError {
    pub kind: ErrorKind,
    pub message: String,
}

impl SessionError {
    #[must_use]
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }
}

/// Identity of the signed-in user, taken from the provider's profile claims.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct User {
    pub name: Option<String>,
    pub given_name: Option<String>,
    pub family_name: Option<String>,
    pub email: Option<String>,
}

/// Audience identifier for an API access token exchange.
#[derive(
    Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize, Display, FromStr, From, Into,
)]
#[serde(transparent)]
pub struct Audience(pub String);

impl Audience {
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum Error {
    #[error("OAuth2 error during {operation}: {detail}")]
    OAuth {
        operation: &'static str,
        status: Option<u16>,
        detail: String,
    },
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
    /// The identity provider has no session for this user. Not a failure:
    /// the user is simply not logged in.
    #[error("Login required")]
    LoginRequired,
    #[error("Invalid callback: {0}")]
    Callback(String),
    /// A redirect callback arrived for a client that is already initialized.
    #[error("Cannot handle callback: session client is already initialized")]
    AlreadyInitialized,
    #[error("Configuration error: {0}")]
    Config(String),
    #[error("Storage error: {0}")]
    Storage(String),
}

impl Error {
    /// Whether this is the expected "user is not logged in" outcome.
    #[must_use]
    pub fn is_login_required(&self) -> bool {
        matches!(self, Self::LoginRequired)
    }

    /// OAuth2 error codes the provider uses to say there is no live session.
    pub(crate) fn from_oauth_code(code: &str, detail: String, operation: &'static str) -> Self {
        match code {
            "login_required" | "interaction_required" | "invalid_grant" => Self::LoginRequired,
            _ => Self::OAuth {
                operation,
                status: None,
                detail,
            },
        }
    }
}

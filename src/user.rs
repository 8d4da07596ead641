use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

use crate::types::User;

/// Profile claims from the identity provider's userinfo endpoint.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[non_exhaustive]
pub struct Profile {
    pub sub: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub given_name: Option<String>,
    #[serde(default)]
    pub family_name: Option<String>,
    #[serde(default)]
    pub email: Option<String>,
    /// Claims the session does not interpret.
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

impl Profile {
    #[must_use]
    pub fn new(sub: impl Into<String>) -> Self {
        Self {
            sub: sub.into(),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn with_name(mut self, given_name: &str, family_name: &str) -> Self {
        self.given_name = Some(given_name.to_owned());
        self.family_name = Some(family_name.to_owned());
        self.name = Some(format!("{given_name} {family_name}"));
        self
    }

    #[must_use]
    pub fn with_email(mut self, email: impl Into<String>) -> Self {
        self.email = Some(email.into());
        self
    }
}

impl From<&Profile> for User {
    fn from(profile: &Profile) -> Self {
        Self {
            name: profile.name.clone(),
            given_name: profile.given_name.clone(),
            family_name: profile.family_name.clone(),
            email: profile.email.clone(),
        }
    }
}

/// Signed-in user as held by the identity provider: tokens plus profile.
///
/// This is the record persisted in session storage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[non_exhaustive]
pub struct OidcUser {
    pub access_token: String,
    #[serde(default = "default_token_type")]
    pub token_type: String,
    #[serde(default)]
    pub refresh_token: Option<String>,
    #[serde(default)]
    pub id_token: Option<String>,
    #[serde(default)]
    pub scope: Option<String>,
    /// Access token expiry, seconds since the Unix epoch.
    #[serde(default, with = "time::serde::timestamp::option")]
    pub expires_at: Option<OffsetDateTime>,
    pub profile: Profile,
}

fn default_token_type() -> String {
    "Bearer".into()
}

impl OidcUser {
    #[must_use]
    pub fn new(access_token: impl Into<String>, profile: Profile) -> Self {
        Self {
            access_token: access_token.into(),
            token_type: default_token_type(),
            refresh_token: None,
            id_token: None,
            scope: None,
            expires_at: None,
            profile,
        }
    }

    #[must_use]
    pub fn with_refresh_token(mut self, token: impl Into<String>) -> Self {
        self.refresh_token = Some(token.into());
        self
    }

    #[must_use]
    pub fn with_id_token(mut self, token: impl Into<String>) -> Self {
        self.id_token = Some(token.into());
        self
    }

    /// Set expiry relative to now.
    #[must_use]
    pub fn expiring_in(mut self, expires_in: std::time::Duration) -> Self {
        self.expires_at = Some(OffsetDateTime::now_utc() + expires_in);
        self
    }

    /// Time left until the access token expires. `None` if no expiry is known,
    /// zero if it already passed.
    #[must_use]
    pub fn expires_in(&self) -> Option<std::time::Duration> {
        let remaining = self.expires_at? - OffsetDateTime::now_utc();
        Some(remaining.try_into().unwrap_or(std::time::Duration::ZERO))
    }

    #[must_use]
    pub fn is_expired(&self) -> bool {
        self.expires_in().is_some_and(|left| left.is_zero())
    }

    /// Identity record derived from the profile claims.
    #[must_use]
    pub fn user(&self) -> User {
        User::from(&self.profile)
    }
}

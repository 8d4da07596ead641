use std::future::Future;

use url::Url;

use crate::error::Error;
use crate::user::OidcUser;

/// The OIDC protocol side of the session.
///
/// The session client never speaks the authorization protocol itself; it
/// drives an `IdentityProvider` and reacts to the outcomes.
/// [`OidcClient`](crate::OidcClient) is the HTTP implementation.
///
/// # Example
///
/// ```rust,ignore
/// impl IdentityProvider for ScriptedProvider {
///     fn authorization_url(&self) -> Result<Url, Error> {
///         Ok("https://sso.example.com/auth".parse().unwrap())
///     }
///
///     async fn signin_silent(&self) -> Result<OidcUser, Error> {
///         Err(Error::LoginRequired)
///     }
///
///     // ...
/// }
/// ```
pub trait IdentityProvider: Send + Sync + 'static {
    /// Start an interactive sign-in. Returns the URL to redirect the user to.
    fn authorization_url(&self) -> Result<Url, Error>;

    /// Re-establish a session without user interaction.
    ///
    /// Must return [`Error::LoginRequired`] when there is no session to resume.
    fn signin_silent(&self) -> impl Future<Output = Result<OidcUser, Error>> + Send;

    /// Cached user, if one is stored and still valid.
    fn get_user(&self) -> impl Future<Output = Result<Option<OidcUser>, Error>> + Send;

    /// Complete the redirect flow from the callback URL's parameters.
    fn signin_callback(
        &self,
        callback_url: &Url,
    ) -> impl Future<Output = Result<OidcUser, Error>> + Send;

    /// End-session URL to send the user to after local logout.
    fn signout_url(&self, id_token_hint: Option<&str>) -> Url;
}

//! Local identity provider for integration tests.
#![allow(dead_code)]

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use axum::Json;
use axum::Router;
use axum::extract::{Form, State};
use axum::http::{HeaderMap, StatusCode, header};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use housing_sales_auth::storage::store_user;
use housing_sales_auth::{OidcUser, Profile, SessionConfig, SessionStorage};
use serde_json::json;
use url::Url;

pub const UMA_GRANT: &str = "urn:ietf:params:oauth:grant-type:uma-ticket";
pub const REFRESH_TOKEN: &str = "refresh-1";

/// Knobs and counters shared with the running server.
#[derive(Default)]
pub struct IdpState {
    /// Userinfo answers 401.
    pub revoked: AtomicBool,
    /// API token exchange answers 403.
    pub deny_api: AtomicBool,
    /// API token exchange answers 200 with a non-JSON body.
    pub broken_json: AtomicBool,
    pub refreshes: AtomicUsize,
    pub userinfo_calls: AtomicUsize,
}

pub struct FakeIdp {
    pub base_url: Url,
    pub state: Arc<IdpState>,
}

impl FakeIdp {
    pub async fn start() -> Self {
        let state = Arc::new(IdpState::default());
        let app = Router::new()
            .route("/realms/test/protocol/openid-connect/token", post(token))
            .route("/realms/test/protocol/openid-connect/userinfo", get(userinfo))
            .with_state(Arc::clone(&state));

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        Self {
            base_url: format!("http://{addr}/").parse().unwrap(),
            state,
        }
    }

    pub fn realm_url(&self, path: &str) -> Url {
        self.base_url
            .join(&format!("realms/test/{}", path.trim_start_matches('/')))
            .unwrap()
    }

    pub fn token_url(&self) -> Url {
        self.realm_url("protocol/openid-connect/token")
    }

    /// Session config pointing at this server.
    pub fn config(&self) -> SessionConfig {
        config_for(&self.base_url)
    }
}

pub fn config_for(base_url: &Url) -> SessionConfig {
    let base = base_url.to_string();
    SessionConfig::from_lookup(move |key| match key {
        "OIDC_BASE_URL" => Some(base.clone()),
        "OIDC_REALM" => Some("test".into()),
        "OIDC_CLIENT_ID" => Some("housing-ui".into()),
        "OIDC_APP_URL" => Some("https://admin.example.com".into()),
        _ => None,
    })
    .unwrap()
}

/// Put a user record with `refresh_token` where the OIDC client looks for it.
pub fn seed_user(storage: &dyn SessionStorage, config: &SessionConfig, refresh_token: &str) {
    let user = OidcUser::new("access-0", Profile::new("user-1"))
        .with_refresh_token(refresh_token)
        .with_id_token("id-0");
    store_user(storage, &config.oidc().user_storage_key(), &user).unwrap();
}

/// Wait up to five seconds for `condition`.
pub async fn eventually<F, Fut>(mut condition: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    for _ in 0..100 {
        if condition().await {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    false
}

async fn token(
    State(state): State<Arc<IdpState>>,
    headers: HeaderMap,
    Form(form): Form<HashMap<String, String>>,
) -> Response {
    match form.get("grant_type").map(String::as_str) {
        Some("refresh_token") => {
            state.refreshes.fetch_add(1, Ordering::SeqCst);
            if form.get("refresh_token").map(String::as_str) != Some(REFRESH_TOKEN) {
                return (
                    StatusCode::BAD_REQUEST,
                    Json(json!({ "error": "invalid_grant", "error_description": "Token is not active" })),
                )
                    .into_response();
            }
            Json(json!({
                "access_token": "access-2",
                "token_type": "Bearer",
                "expires_in": 300,
                "refresh_token": REFRESH_TOKEN,
                "id_token": "id-2",
            }))
            .into_response()
        }
        Some("authorization_code") => {
            if form.get("code_verifier").is_none_or(String::is_empty) {
                return (StatusCode::BAD_REQUEST, Json(json!({ "error": "invalid_request" })))
                    .into_response();
            }
            Json(json!({
                "access_token": "access-1",
                "expires_in": 300,
                "refresh_token": REFRESH_TOKEN,
                "id_token": "id-1",
            }))
            .into_response()
        }
        Some(UMA_GRANT) => {
            let authorized = headers
                .get(header::AUTHORIZATION)
                .and_then(|v| v.to_str().ok())
                .is_some_and(|v| v.starts_with("Bearer access-"));
            if !authorized {
                return StatusCode::UNAUTHORIZED.into_response();
            }
            if state.deny_api.load(Ordering::SeqCst) {
                return (StatusCode::FORBIDDEN, "access denied").into_response();
            }
            if state.broken_json.load(Ordering::SeqCst) {
                return "<html>maintenance</html>".into_response();
            }
            let audience = form.get("audience").cloned().unwrap_or_default();
            let mut body = serde_json::Map::new();
            body.insert(audience.clone(), json!(format!("api-for-{audience}")));
            body.insert("expires_in".into(), json!(300));
            Json(body).into_response()
        }
        _ => (StatusCode::BAD_REQUEST, Json(json!({ "error": "unsupported_grant_type" })))
            .into_response(),
    }
}

async fn userinfo(State(state): State<Arc<IdpState>>) -> Response {
    state.userinfo_calls.fetch_add(1, Ordering::SeqCst);
    if state.revoked.load(Ordering::SeqCst) {
        return StatusCode::UNAUTHORIZED.into_response();
    }
    Json(json!({
        "sub": "user-1",
        "name": "Test User",
        "given_name": "Test",
        "family_name": "User",
        "email": "test.user@example.com",
    }))
    .into_response()
}

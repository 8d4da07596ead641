mod common;

use std::sync::atomic::Ordering;

use common::FakeIdp;
use housing_sales_auth::token::{INVALID_JSON_MESSAGE, NETWORK_ERROR_MESSAGE, fetch_api_token};
use housing_sales_auth::{ApiTokenRequest, Audience};

fn request(audience: &str) -> ApiTokenRequest {
    ApiTokenRequest::new(Audience(audience.to_owned()))
}

#[tokio::test]
async fn success_returns_every_claim_as_text() {
    let idp = FakeIdp::start().await;
    let http = reqwest::Client::new();

    let tokens = fetch_api_token(&http, &idp.token_url(), &request("housing-api"), "access-1")
        .await
        .unwrap();

    assert_eq!(tokens.get("housing-api").map(String::as_str), Some("api-for-housing-api"));
    assert_eq!(tokens.get("expires_in").map(String::as_str), Some("300"));
}

#[tokio::test]
async fn http_failure_carries_status_reason_and_body() {
    let idp = FakeIdp::start().await;
    idp.state.deny_api.store(true, Ordering::SeqCst);

    let err = fetch_api_token(
        &reqwest::Client::new(),
        &idp.token_url(),
        &request("housing-api"),
        "access-1",
    )
    .await
    .unwrap_err();

    assert_eq!(err.status, Some(403));
    assert_eq!(err.message.as_deref(), Some("Forbidden"));
    assert_eq!(err.error.as_deref(), Some("access denied"));
    assert!(err.is_auth_rejection());
}

#[tokio::test]
async fn missing_bearer_is_unauthorized() {
    let idp = FakeIdp::start().await;
    let err = fetch_api_token(&reqwest::Client::new(), &idp.token_url(), &request("housing-api"), "")
        .await
        .unwrap_err();
    assert_eq!(err.status, Some(401));
    assert_eq!(err.message.as_deref(), Some("Unauthorized"));
}

#[tokio::test]
async fn non_json_body_is_invalid_json() {
    let idp = FakeIdp::start().await;
    idp.state.broken_json.store(true, Ordering::SeqCst);

    let err = fetch_api_token(
        &reqwest::Client::new(),
        &idp.token_url(),
        &request("housing-api"),
        "access-1",
    )
    .await
    .unwrap_err();

    assert_eq!(err.status, None);
    assert_eq!(err.message.as_deref(), Some(INVALID_JSON_MESSAGE));
}

#[tokio::test]
async fn unreachable_endpoint_is_network_error() {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);
    let token_uri = format!("http://{addr}/token").parse().unwrap();

    let err = fetch_api_token(&reqwest::Client::new(), &token_uri, &request("housing-api"), "access-1")
        .await
        .unwrap_err();

    assert_eq!(err.status, None);
    assert_eq!(err.message.as_deref(), Some(NETWORK_ERROR_MESSAGE));
    assert!(err.error.is_some());
}

//! HTTP API integration tests for the items service.

#![allow(clippy::unwrap_used)] // Test code can use unwrap

use axum::{
    body::Body,
    http::{Method, Request, StatusCode, header},
    response::Response,
};
use http_body_util::BodyExt;
use items_api::{ITEM_PREFIX, Item, LAST_VIEWED_KEY, app};
use safe_persist_core::{GuardConfig, ViolationCause};
use safe_persist_testing::InMemoryStore;
use tower::ServiceExt;

fn json_request(method: Method, uri: &str, body: &serde_json::Value) -> Request<Body> {
    Request::builder()
        .method(method)
        .uri(uri)
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

fn empty_request(method: Method, uri: &str) -> Request<Body> {
    Request::builder()
        .method(method)
        .uri(uri)
        .body(Body::empty())
        .unwrap()
}

async fn json_body(response: Response) -> serde_json::Value {
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    serde_json::from_slice(&bytes).unwrap()
}

#[tokio::test]
async fn test_create_then_list_and_get() {
    let store = InMemoryStore::new();
    let router = app(store.clone(), GuardConfig::default());

    let response = router
        .clone()
        .oneshot(json_request(Method::POST, "/items", &serde_json::json!({ "name": "apple" })))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::CREATED);
    let created: Item = serde_json::from_value(json_body(response).await).unwrap();
    assert_eq!(created.name, "apple");
    assert_eq!(store.get(&format!("{ITEM_PREFIX}{}", created.id)), Some("apple".to_string()));

    let response = router.clone().oneshot(empty_request(Method::GET, "/items")).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let items: Vec<Item> = serde_json::from_value(json_body(response).await).unwrap();
    assert_eq!(items, vec![created.clone()]);

    let response = router
        .oneshot(empty_request(Method::GET, &format!("/items/{}", created.id)))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let fetched: Item = serde_json::from_value(json_body(response).await).unwrap();
    assert_eq!(fetched, created);
}

#[tokio::test]
async fn test_unknown_item_is_not_found() {
    let router = app(InMemoryStore::new(), GuardConfig::default());

    let response = router.oneshot(empty_request(Method::GET, "/items/nope")).await.unwrap();

    assert_eq!(response.status(), StatusCode::NOT_FOUND);
    assert_eq!(json_body(response).await["code"], "NOT_FOUND");
}

#[tokio::test]
async fn test_blank_name_is_rejected_without_violation() {
    let store = InMemoryStore::new();
    let router = app(store.clone(), GuardConfig::default());

    let response = router
        .oneshot(json_request(Method::POST, "/items", &serde_json::json!({ "name": "  " })))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    assert!(store.is_empty());
}

#[tokio::test]
async fn test_touch_is_forbidden() {
    let store = InMemoryStore::new();
    let router = app(store.clone(), GuardConfig::default());

    let response = router.oneshot(empty_request(Method::GET, "/items/touch")).await.unwrap();

    assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    assert_eq!(json_body(response).await["detailed"], ViolationCause::Forbidden.detail());
    assert_eq!(store.get(LAST_VIEWED_KEY), None);
}

#[tokio::test]
async fn test_draft_post_is_unsafed() {
    let store = InMemoryStore::new();
    let router = app(store.clone(), GuardConfig::default());

    let response = router.oneshot(empty_request(Method::POST, "/items/draft")).await.unwrap();

    assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    let json = json_body(response).await;
    assert_eq!(json["detailed"], ViolationCause::UnsafedData.detail());
    assert!(json.get("id").is_none());
    assert!(store.is_empty());
}

#[tokio::test]
async fn test_draft_get_is_modified() {
    let store = InMemoryStore::new();
    let router = app(store.clone(), GuardConfig::default());

    let response = router.oneshot(empty_request(Method::GET, "/items/draft")).await.unwrap();

    assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    assert_eq!(json_body(response).await["detailed"], ViolationCause::ModifiedData.detail());
    assert!(store.is_empty());
}

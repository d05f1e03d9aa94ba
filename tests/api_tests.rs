//! API integration tests.

use axum::{
    body::Body,
    http::{Method, Request, StatusCode, header},
};
use serde_json::{Value, json};
use tower::ServiceExt;

mod common;
use common::test_app;

async fn body_json(response: axum::response::Response) -> Value {
    let body = axum::body::to_bytes(response.into_body(), 1024 * 1024)
        .await
        .unwrap();
    serde_json::from_slice(&body).unwrap()
}

/// Health endpoint reports ok and a version.
#[tokio::test]
async fn test_health_endpoint() {
    let app = test_app().await;

    let response = app
        .oneshot(
            Request::builder()
                .uri("/health")
                .method(Method::GET)
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);

    let json = body_json(response).await;
    assert_eq!(json["status"], "ok");
    assert!(json["version"].is_string());
}

/// Leasing a container returns its SSH endpoint.
#[tokio::test]
async fn test_create_container() {
    let app = test_app().await;

    let response = app
        .oneshot(
            Request::builder()
                .uri("/containers")
                .method(Method::POST)
                .header(header::CONTENT_TYPE, "application/json")
                .body(Body::from(
                    serde_json::to_string(&json!({"profile": "ssh-terminal"})).unwrap(),
                ))
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);

    let json = body_json(response).await;
    assert!(json["id"].as_str().unwrap().starts_with("fake-"));
    assert_eq!(json["profile"], "ssh-terminal");
    assert!(json["ssh_port"].as_u64().unwrap() >= 42100);
}

/// An invalid image override is rejected before any container is created.
#[tokio::test]
async fn test_create_container_invalid_image() {
    let app = test_app().await;

    let response = app
        .oneshot(
            Request::builder()
                .uri("/containers")
                .method(Method::POST)
                .header(header::CONTENT_TYPE, "application/json")
                .body(Body::from(
                    serde_json::to_string(&json!({
                        "profile": "ssh-terminal",
                        "options": {"image": "bad image;rm -rf /"}
                    }))
                    .unwrap(),
                ))
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

/// Leased containers appear in the listing until released.
#[tokio::test]
async fn test_list_and_stop_container() {
    let app = test_app().await;

    let response = app
        .clone()
        .oneshot(
            Request::builder()
                .uri("/containers")
                .method(Method::POST)
                .header(header::CONTENT_TYPE, "application/json")
                .body(Body::from("{}"))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let created = body_json(response).await;
    let container_id = created["id"].as_str().unwrap().to_string();

    let response = app
        .clone()
        .oneshot(
            Request::builder()
                .uri("/containers")
                .method(Method::GET)
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let listed = body_json(response).await;
    let leased: Vec<&Value> = listed
        .as_array()
        .unwrap()
        .iter()
        .filter(|c| c["leased"] == true)
        .collect();
    assert!(leased.iter().any(|c| c["id"] == container_id.as_str()));

    let response = app
        .oneshot(
            Request::builder()
                .uri(format!("/containers/{container_id}"))
                .method(Method::DELETE)
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NO_CONTENT);
}

/// Restoring with an unknown key is a definitive "reconnect fresh".
#[tokio::test]
async fn test_restore_unknown_key_gone() {
    let app = test_app().await;

    let response = app
        .oneshot(
            Request::builder()
                .uri("/sessions/restore")
                .method(Method::POST)
                .header(header::CONTENT_TYPE, "application/json")
                .body(Body::from(
                    serde_json::to_string(&json!({"restoreKey": "no-such-key"})).unwrap(),
                ))
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::GONE);
}

/// An empty restore key is a validation error.
#[tokio::test]
async fn test_restore_empty_key_rejected() {
    let app = test_app().await;

    let response = app
        .oneshot(
            Request::builder()
                .uri("/sessions/restore")
                .method(Method::POST)
                .header(header::CONTENT_TYPE, "application/json")
                .body(Body::from(
                    serde_json::to_string(&json!({"restoreKey": ""})).unwrap(),
                ))
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

/// Session listing starts empty.
#[tokio::test]
async fn test_list_sessions_empty() {
    let app = test_app().await;

    let response = app
        .oneshot(
            Request::builder()
                .uri("/sessions")
                .method(Method::GET)
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(body_json(response).await, json!([]));
}

/// Alerts endpoint responds with empty lists before any tick.
#[tokio::test]
async fn test_alerts_endpoint() {
    let app = test_app().await;

    let response = app
        .oneshot(
            Request::builder()
                .uri("/alerts")
                .method(Method::GET)
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let json = body_json(response).await;
    assert_eq!(json["active"], json!([]));
    assert_eq!(json["recent"], json!([]));
}

/// Latest metrics are null before the first collection tick.
#[tokio::test]
async fn test_latest_metrics_empty() {
    let app = test_app().await;

    let response = app
        .oneshot(
            Request::builder()
                .uri("/metrics/latest")
                .method(Method::GET)
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let json = body_json(response).await;
    assert!(json["pool"].is_null());
    assert!(json["sessions"].is_null());
}

/// Unknown session log listing is an empty array, not an error.
#[tokio::test]
async fn test_session_logs_empty() {
    let app = test_app().await;

    let response = app
        .oneshot(
            Request::builder()
                .uri("/sessions/unknown/logs")
                .method(Method::GET)
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(body_json(response).await, json!([]));
}

mod common;

use axum::body::{to_bytes, Body};
use axum::http::{header, Request, StatusCode};
use common::{model_config, ScriptedProvider};
use parley_server::router;
use parley_shared::{ChatMessage, Completion, CompletionRequest, ErrorBody, ErrorCode};
use std::sync::Arc;
use tower::ServiceExt;

fn chat_request(api_key: &str) -> Request<Body> {
    let body = CompletionRequest {
        model_config: model_config(api_key),
        messages: vec![ChatMessage::user("Hel|lo!")],
    };
    Request::builder()
        .method("POST")
        .uri("/chat")
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(serde_json::to_vec(&body).unwrap()))
        .unwrap()
}

#[tokio::test]
async fn health_reports_ok() {
    let response = router(Arc::new(ScriptedProvider))
        .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    assert_eq!(&body[..], b"OK");
}

#[tokio::test]
async fn chat_returns_one_shot_completion() {
    let response = router(Arc::new(ScriptedProvider))
        .oneshot(chat_request("sk-test"))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    let completion: Completion = serde_json::from_slice(&body).unwrap();
    assert_eq!(completion.content, "Hello!");
    assert_eq!(completion.finish_reason, "stop");
    assert_eq!(completion.usage.map(|u| u.total_tokens), Some(12));
}

#[tokio::test]
async fn chat_without_key_is_a_bad_request() {
    let response = router(Arc::new(ScriptedProvider))
        .oneshot(chat_request(""))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    let error: ErrorBody = serde_json::from_slice(&body).unwrap();
    assert_eq!(error.code, ErrorCode::MissingCredential);
}

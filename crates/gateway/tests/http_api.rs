//! HTTP surface: routing, auth and JSON shapes, driven through
//! `tower::ServiceExt::oneshot` without binding a socket.

mod support;

use std::sync::Arc;
use std::time::Instant;

use axum::body::Body;
use axum::http::{header, Method, Request, StatusCode};
use axum::Router;
use serde_json::{json, Value};
use sha2::{Digest, Sha256};
use tower::ServiceExt;

use tw_domain::config::Config;
use tw_gateway::api;
use tw_gateway::state::AppState;

use support::{harness, ScriptedBackend};

const TOKEN: &str = "s3cret";

fn app(token: Option<&str>) -> (Router, AppState) {
    let config = Config::default();
    let h = harness(&config, ScriptedBackend::default());
    let state = AppState {
        config: Arc::new(config),
        orchestrator: h.orchestrator,
        threads: h.threads,
        api_token_hash: token.map(|t| Sha256::digest(t.as_bytes()).to_vec()),
        started_at: Instant::now(),
    };
    (api::router(state.clone()).with_state(state.clone()), state)
}

fn request(method: Method, uri: &str, body: Option<Value>, token: Option<&str>) -> Request<Body> {
    let mut builder = Request::builder().method(method).uri(uri);
    if let Some(token) = token {
        builder = builder.header(header::AUTHORIZATION, format!("Bearer {token}"));
    }
    match body {
        Some(body) => builder
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(body.to_string()))
            .unwrap(),
        None => builder.body(Body::empty()).unwrap(),
    }
}

async fn json_body(resp: axum::response::Response) -> Value {
    let bytes = axum::body::to_bytes(resp.into_body(), usize::MAX).await.unwrap();
    serde_json::from_slice(&bytes).unwrap()
}

#[tokio::test]
async fn health_is_public() {
    let (app, _) = app(Some(TOKEN));
    let resp = app
        .oneshot(request(Method::GET, "/v1/health", None, None))
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    assert_eq!(json_body(resp).await["status"], "ok");
}

#[tokio::test]
async fn protected_routes_require_the_token() {
    let (app, _) = app(Some(TOKEN));

    let resp = app
        .clone()
        .oneshot(request(Method::GET, "/v1/stats", None, None))
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);

    let resp = app
        .clone()
        .oneshot(request(Method::GET, "/v1/stats", None, Some("wrong")))
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);

    let resp = app
        .oneshot(request(Method::GET, "/v1/stats", None, Some(TOKEN)))
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    let body = json_body(resp).await;
    assert_eq!(body["runtime"]["pending_batches"], 0);
    assert_eq!(body["threads"], 0);
}

#[tokio::test]
async fn inbound_message_is_buffered() {
    let (app, state) = app(None);

    let msg = json!({
        "message_id": "wamid-1",
        "chat_id": "573001234567@s.whatsapp.net",
        "text": "hola"
    });
    let resp = app
        .clone()
        .oneshot(request(Method::POST, "/v1/inbound", Some(msg.clone()), None))
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::ACCEPTED);
    let body = json_body(resp).await;
    assert_eq!(body["outcome"], "buffered");
    assert_eq!(body["pending"], 1);
    assert_eq!(
        state.orchestrator.buffer().pending_messages("573001234567"),
        vec!["hola"]
    );

    // Same message again: re-delivery.
    let resp = app
        .oneshot(request(Method::POST, "/v1/inbound", Some(msg), None))
        .await
        .unwrap();
    assert_eq!(json_body(resp).await["outcome"], "duplicate");
}

#[tokio::test]
async fn inbound_without_ids_is_rejected() {
    let (app, _) = app(None);
    let resp = app
        .oneshot(request(
            Method::POST,
            "/v1/inbound",
            Some(json!({ "message_id": "", "chat_id": "x", "text": "hola" })),
            None,
        ))
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn buffering_can_be_toggled_at_runtime() {
    let (app, state) = app(None);

    let resp = app
        .oneshot(request(
            Method::PUT,
            "/v1/admin/buffering",
            Some(json!({ "disabled": true })),
            None,
        ))
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    assert!(state.orchestrator.stats().buffering_disabled);
}

#[tokio::test]
async fn outbound_report_feeds_echo_suppression() {
    let (app, state) = app(None);

    let resp = app
        .clone()
        .oneshot(request(
            Method::POST,
            "/v1/outbound/sent",
            Some(json!({
                "chat_id": "5511@s.whatsapp.net",
                "message_id": "wamid-77",
                "content": "Listo, te esperamos"
            })),
            None,
        ))
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    assert!(state.orchestrator.echo().is_bot_sent_message("wamid-77"));

    let echo = json!({
        "message_id": "wamid-77",
        "chat_id": "5511@s.whatsapp.net",
        "from_self": true,
        "text": "Listo, te esperamos"
    });
    let resp = app
        .oneshot(request(Method::POST, "/v1/inbound", Some(echo), None))
        .await
        .unwrap();
    let body = json_body(resp).await;
    assert_eq!(body["outcome"], "echo_suppressed");
    assert_eq!(body["matched_by"], "message_id");
}

#[tokio::test]
async fn unknown_thread_is_not_found() {
    let (app, _) = app(None);
    let resp = app
        .oneshot(request(Method::GET, "/v1/threads/nobody", None, None))
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::NOT_FOUND);
}

//! Transport webhooks.
//!
//! The chat transport posts normalized events here.  Handlers never wait
//! for a turn: they return as soon as the message is filtered, buffered or
//! handed to the user's lock.  Turn failures are logged, never surfaced.

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json};
use serde_json::json;

use tw_domain::event::{InboundMessage, PresenceEvent, SentMessage};

use crate::state::AppState;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// POST /v1/inbound
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub async fn inbound(
    State(state): State<AppState>,
    Json(msg): Json<InboundMessage>,
) -> impl IntoResponse {
    if msg.message_id.trim().is_empty() || msg.chat_id.trim().is_empty() {
        return (
            StatusCode::BAD_REQUEST,
            Json(json!({ "error": "message_id and chat_id are required" })),
        )
            .into_response();
    }

    let message_id = msg.message_id.clone();
    let outcome = state.orchestrator.handle_message(msg);
    tracing::debug!(message_id = %message_id, outcome = ?outcome, "inbound handled");
    (StatusCode::ACCEPTED, Json(outcome)).into_response()
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// POST /v1/presence
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub async fn presence(
    State(state): State<AppState>,
    Json(ev): Json<PresenceEvent>,
) -> impl IntoResponse {
    let extended = state.orchestrator.handle_presence(ev);
    Json(json!({ "extended": extended }))
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// POST /v1/outbound/sent
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// The outbound transport reports a message it sent for us, so its echo
/// can be recognised.
pub async fn outbound_sent(
    State(state): State<AppState>,
    Json(sent): Json<SentMessage>,
) -> impl IntoResponse {
    if sent.message_id.is_none() && sent.content.is_none() {
        return (
            StatusCode::BAD_REQUEST,
            Json(json!({ "error": "message_id or content is required" })),
        )
            .into_response();
    }
    state.orchestrator.record_outbound(&sent);
    Json(json!({ "recorded": true })).into_response()
}

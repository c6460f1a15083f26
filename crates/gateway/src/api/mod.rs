pub mod admin;
pub mod auth;
pub mod inbound;

use axum::middleware;
use axum::routing::{delete, get, post, put};
use axum::Router;
use tower_http::trace::TraceLayer;

use crate::state::AppState;

/// Build the full API router.
///
/// Routes are split into **public** (health probe) and **protected**
/// (gated behind the `TW_API_TOKEN` bearer-token middleware).
///
/// `state` is needed to wire up the auth middleware at build time.
pub fn router(state: AppState) -> Router<AppState> {
    let public = Router::new().route("/v1/health", get(admin::health));

    let protected = Router::new()
        // Transport webhooks
        .route("/v1/inbound", post(inbound::inbound))
        .route("/v1/presence", post(inbound::presence))
        .route("/v1/outbound/sent", post(inbound::outbound_sent))
        // Introspection
        .route("/v1/stats", get(admin::stats))
        .route("/v1/threads/:user_id", get(admin::get_thread))
        .route("/v1/threads/:user_id", delete(admin::reset_thread))
        // Operational overrides
        .route("/v1/admin/buffering", put(admin::set_buffering))
        .route("/v1/admin/flush/:user_id", post(admin::flush_user))
        .route_layer(middleware::from_fn_with_state(
            state,
            auth::require_api_token,
        ));

    public.merge(protected).layer(TraceLayer::new_for_http())
}

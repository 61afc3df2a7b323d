use super::handlers::{authors, comments, sse};
use crate::state::AppState;
use axum::{
    http::{HeaderValue, Method},
    routing::{delete, get, post},
    Router,
};
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

const METHODS: [Method; 4] = [Method::GET, Method::POST, Method::PUT, Method::DELETE];

pub fn build_router(state: AppState, allowed_origins: &str) -> Router {
    let cors = if allowed_origins == "*" {
        CorsLayer::new()
            .allow_methods(METHODS)
            .allow_origin(Any)
            .allow_headers(Any)
    } else {
        let origins: Vec<HeaderValue> = allowed_origins
            .split(',')
            .map(|s| s.trim())
            .filter(|s| !s.is_empty())
            .filter_map(|s| s.parse::<HeaderValue>().ok())
            .collect();

        if origins.is_empty() {
            tracing::warn!("CORS config is invalid or empty, falling back to allow ANY.");
            CorsLayer::new()
                .allow_methods(METHODS)
                .allow_origin(Any)
                .allow_headers(Any)
        } else {
            tracing::info!("CORS enabled for origins: {:?}", origins);
            CorsLayer::new()
                .allow_methods(METHODS)
                .allow_origin(origins)
                .allow_headers(Any)
        }
    };

    Router::new()
        .route("/api/discussions/:discussion_id/tree", get(comments::get_tree))
        .route("/api/discussions/:discussion_id/view", get(comments::get_view))
        .route("/api/discussions/:discussion_id/phase", get(comments::get_phase))
        .route("/api/discussions/:discussion_id/comments", post(comments::post_comment))
        .route(
            "/api/discussions/:discussion_id/comments/:comment_id/like",
            post(comments::toggle_like),
        )
        .route(
            "/api/discussions/:discussion_id/reply-target",
            get(comments::get_reply_target).put(comments::set_reply_target),
        )
        .route("/api/discussions/:discussion_id/retry", post(comments::retry))
        .route("/api/discussions/:discussion_id/session", delete(comments::close_session))
        .route("/api/discussions/:discussion_id/events", get(sse::sse_handler))
        .route("/api/authors", post(authors::register_author))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}

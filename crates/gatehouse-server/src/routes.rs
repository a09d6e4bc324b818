//! HTTP routing

use crate::handler::{knowledge_chat, knowledge_chat_conversation};
use crate::state::AppState;
use axum::routing::{get, post};
use axum::Router;
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

/// Build the application router.
pub fn router(state: Arc<AppState>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/api/knowledge_chat", post(knowledge_chat))
        .route(
            "/api/knowledge_chat_conversation",
            post(knowledge_chat_conversation),
        )
        .route("/health", get(health))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn health() -> &'static str {
    concat!("gatehouse ", env!("CARGO_PKG_VERSION"))
}

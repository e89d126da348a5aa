pub mod api;
pub mod redirect;

use crate::AppState;
use axum::{
    routing::{get, post},
    Router,
};
use std::sync::Arc;
use tower_http::trace::TraceLayer;

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(|| async { axum::http::StatusCode::OK }))
        .route("/shorten", post(api::shorten))
        .route("/shorten/:token/stats", get(api::stats))
        // Token routes last so the static paths above take priority
        .route(
            "/:token",
            get(redirect::redirect).put(api::update).delete(api::delete),
        )
        .with_state(state)
        .layer(TraceLayer::new_for_http())
}

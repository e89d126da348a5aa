use crate::{error::AppError, AppState};
use axum::{
    extract::{rejection::JsonRejection, Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Deserialize;
use std::sync::Arc;

#[derive(Deserialize)]
pub struct UrlBody {
    url: String,
}

/// Any body that is not `{"url": "..."}` is a 400, whatever axum's reason.
fn url_from(body: Result<Json<UrlBody>, JsonRejection>) -> Result<String, AppError> {
    body.map(|Json(b)| b.url).map_err(|e| {
        tracing::debug!("Rejected request body: {}", e);
        AppError::InvalidInput("invalid request payload".into())
    })
}

/// POST /shorten
pub async fn shorten(
    State(state): State<Arc<AppState>>,
    body: Result<Json<UrlBody>, JsonRejection>,
) -> Response {
    let url = match url_from(body) {
        Ok(url) => url,
        Err(e) => return e.into_response(),
    };

    match state.resolver.shorten(&url).await {
        Ok(record) => (StatusCode::CREATED, Json(record)).into_response(),
        Err(e) => e.into_response(),
    }
}

/// PUT /:token
pub async fn update(
    State(state): State<Arc<AppState>>,
    Path(token): Path<String>,
    body: Result<Json<UrlBody>, JsonRejection>,
) -> Response {
    let url = match url_from(body) {
        Ok(url) => url,
        Err(e) => return e.into_response(),
    };

    match state.resolver.update_url_mapping(&token, &url).await {
        Ok(record) => Json(record).into_response(),
        Err(e) => e.into_response(),
    }
}

/// DELETE /:token
pub async fn delete(State(state): State<Arc<AppState>>, Path(token): Path<String>) -> Response {
    match state.resolver.delete_url(&token).await {
        Ok(()) => StatusCode::NO_CONTENT.into_response(),
        Err(e) => e.into_response(),
    }
}

/// GET /shorten/:token/stats
pub async fn stats(State(state): State<Arc<AppState>>, Path(token): Path<String>) -> Response {
    match state.stats.calculate_statistics(&token).await {
        Ok(stats) => Json(stats).into_response(),
        Err(e) => e.into_response(),
    }
}

use crate::{models::RawStatsEvent, AppState};
use axum::{
    extract::{ConnectInfo, Path, State},
    http::{header::LOCATION, HeaderMap, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
};
use std::{net::SocketAddr, sync::Arc};

/// GET /:token
///
/// 1. Resolve the token through the cache-aside resolver.
/// 2. Publish a raw stats event from a background task so the redirect is
///    never blocked or failed by the bus.
/// 3. Return a 307 redirect to the original URL.
pub async fn redirect(
    State(state): State<Arc<AppState>>,
    Path(token): Path<String>,
    connect_info: Option<ConnectInfo<SocketAddr>>,
    headers: HeaderMap,
) -> Response {
    // ── 1. Resolve URL ─────────────────────────────────────────────────────
    let original_url = match state.resolver.get_original_url(&token).await {
        Ok(url) => url,
        Err(e) => return e.into_response(),
    };

    // Rows written before URLs were normalized may not be valid header values
    let location = match HeaderValue::try_from(original_url.as_str()) {
        Ok(location) => location,
        Err(e) => {
            tracing::error!("Stored URL for '{}' is not a valid Location: {}", token, e);
            return (StatusCode::INTERNAL_SERVER_ERROR, "Internal server error").into_response();
        }
    };

    // ── 2. Publish the click in the background ─────────────────────────────
    let event = RawStatsEvent::new(
        token,
        extract_ip(&headers, connect_info.map(|ConnectInfo(addr)| addr)).unwrap_or_default(),
        header_value(&headers, "user-agent"),
        header_value(&headers, "referer"),
    );

    let publisher = state.publisher.clone();
    tokio::spawn(async move {
        if let Err(e) = publisher.send_event(&event).await {
            tracing::warn!(
                "Failed to send stats event for '{}': {}",
                event.url_token,
                e
            );
        }
    });

    // ── 3. Redirect ────────────────────────────────────────────────────────
    (StatusCode::TEMPORARY_REDIRECT, [(LOCATION, location)]).into_response()
}

// ── Helpers ────────────────────────────────────────────────────────────────

fn header_value(headers: &HeaderMap, name: &str) -> String {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default()
        .to_owned()
}

/// Determine the real client IP, preferring common proxy headers.
fn extract_ip(headers: &HeaderMap, addr: Option<SocketAddr>) -> Option<String> {
    // X-Forwarded-For can be a comma-separated list; take the first entry.
    if let Some(xff) = headers.get("x-forwarded-for").and_then(|v| v.to_str().ok()) {
        if let Some(ip) = xff.split(',').next().map(str::trim) {
            if !ip.is_empty() {
                return Some(ip.to_owned());
            }
        }
    }

    if let Some(real_ip) = headers.get("x-real-ip").and_then(|v| v.to_str().ok()) {
        if !real_ip.is_empty() {
            return Some(real_ip.to_owned());
        }
    }

    addr.map(|a| a.ip().to_string())
}

use axum::{
    extract::{Request, State},
    http::{HeaderName, HeaderValue, Method, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
};
use shared::protocol::APPLICATION_ID_HEADER;
use tower_http::cors::{Any, CorsLayer};
use crate::api::client_error;
use crate::api::routes::AppState;
use crate::config::CorsConfig;

/// Reject callers whose `application-id` is not on the allow list.
/// An empty list lets everyone through.
pub async fn require_known_caller(
    State(state): State<AppState>,
    request: Request,
    next: Next,
) -> Response {
    if state.allowed_callers.is_empty() {
        return next.run(request).await;
    }

    let caller = request
        .headers()
        .get(APPLICATION_ID_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);

    match caller {
        None => client_error(
            StatusCode::UNAUTHORIZED,
            "Unauthorized",
            "No application id provided",
        )
        .into_response(),
        Some(id) if !state.allowed_callers.iter().any(|allowed| *allowed == id) => {
            tracing::warn!("Rejected request from unknown application {}", id);
            client_error(StatusCode::UNAUTHORIZED, "Unauthorized", "Unknown application id")
                .into_response()
        }
        Some(id) => {
            tracing::debug!("Received request from {}", id);
            next.run(request).await
        }
    }
}

/// CORS policy from configuration. Without configured origins no CORS
/// headers are added.
pub fn cors_layer(config: &CorsConfig) -> CorsLayer {
    if config.allowed_origins.is_empty() {
        return CorsLayer::new();
    }

    let mut cors = if config.allowed_origins.iter().any(|o| o == "*") {
        CorsLayer::new().allow_origin(Any)
    } else {
        CorsLayer::new().allow_origin(parse_all::<HeaderValue>(&config.allowed_origins, "origin"))
    };

    if !config.allowed_methods.is_empty() {
        cors = cors.allow_methods(parse_all::<Method>(&config.allowed_methods, "method"));
    }
    if !config.allowed_headers.is_empty() {
        cors = cors.allow_headers(parse_all::<HeaderName>(&config.allowed_headers, "header"));
    }

    cors
}

fn parse_all<T>(values: &[String], kind: &str) -> Vec<T>
where
    T: std::str::FromStr,
{
    values
        .iter()
        .filter_map(|value| match value.parse::<T>() {
            Ok(parsed) => Some(parsed),
            Err(_) => {
                tracing::warn!("CORS: ignoring invalid {} '{}'", kind, value);
                None
            }
        })
        .collect()
}

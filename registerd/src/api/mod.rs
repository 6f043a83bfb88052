//! HTTP surface: account registration, verification and health.

mod health;
mod middleware;
mod register;
pub mod routes;
mod verify;

use axum::{http::StatusCode, Json};
use shared::types::ErrorResponse;

/// Error half of every handler result
type ApiError = (StatusCode, Json<ErrorResponse>);

fn client_error(status: StatusCode, error: &str, message: &str) -> ApiError {
    (
        status,
        Json(ErrorResponse {
            error: error.to_string(),
            message: message.to_string(),
            fields: None,
        }),
    )
}

/// Log the cause, return a generic body. Internal error text never reaches the caller.
fn internal_error<E>(err: E) -> ApiError
where
    E: std::fmt::Display,
{
    tracing::error!("Internal error: {}", err);
    client_error(
        StatusCode::INTERNAL_SERVER_ERROR,
        "Internal server error",
        "Something went wrong",
    )
}

use axum::{
    extract::{Query, State},
    http::StatusCode,
    routing::get,
    Json, Router,
};
use serde::Deserialize;
use shared::types::{ErrorResponse, VerifyResponse};
use crate::api::routes::AppState;
use crate::api::{client_error, internal_error, ApiError};

#[derive(Deserialize)]
pub struct VerifyQuery {
    pub id: Option<String>,
}

pub fn routes() -> Router<AppState> {
    Router::new().route("/", get(verify))
}

async fn verify(
    State(state): State<AppState>,
    Query(params): Query<VerifyQuery>,
) -> Result<Json<VerifyResponse>, ApiError> {
    let Some(id) = params.id.filter(|id| !id.is_empty()) else {
        return Err((
            StatusCode::BAD_REQUEST,
            Json(ErrorResponse {
                error: "Missing fields".to_string(),
                message: "Please provide an id".to_string(),
                fields: Some(vec!["id".to_string()]),
            }),
        ));
    };

    let user = state
        .users
        .store()
        .await
        .map_err(internal_error)?
        .find_user(&id)
        .await
        .map_err(internal_error)?
        .ok_or_else(|| client_error(StatusCode::NOT_FOUND, "Not found", "No user with this id"))?;

    Ok(Json(VerifyResponse {
        uuid: user.uuid,
        username: user.username,
        status: user.status,
    }))
}

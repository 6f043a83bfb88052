use axum::{extract::State, http::StatusCode, routing::post, Json, Router};
use shared::types::{ErrorResponse, RegisterRequest, RegisterResponse};
use crate::accounts;
use crate::api::routes::AppState;
use crate::api::{client_error, internal_error, ApiError};
use crate::db::{DbError, UserKey};

pub fn routes() -> Router<AppState> {
    Router::new().route("/", post(register))
}

fn non_empty(value: &Option<String>) -> Option<&str> {
    value.as_deref().filter(|v| !v.is_empty())
}

fn username_in_use() -> ApiError {
    client_error(StatusCode::BAD_REQUEST, "Username in use", "Please choose another Username")
}

fn email_in_use() -> ApiError {
    client_error(StatusCode::BAD_REQUEST, "Email in use", "Please choose another email")
}

async fn register(
    State(state): State<AppState>,
    Json(body): Json<RegisterRequest>,
) -> Result<Json<RegisterResponse>, ApiError> {
    let (Some(username), Some(email), Some(password)) = (
        non_empty(&body.username),
        non_empty(&body.email),
        non_empty(&body.password),
    ) else {
        return Err((
            StatusCode::BAD_REQUEST,
            Json(ErrorResponse {
                error: "Missing fields".to_string(),
                message: "Please fill in all the fields".to_string(),
                fields: Some(vec![
                    "username".to_string(),
                    "email".to_string(),
                    "password".to_string(),
                ]),
            }),
        ));
    };

    let store = state.users.store().await.map_err(internal_error)?;

    if store
        .find_user_by_username(username)
        .await
        .map_err(internal_error)?
        .is_some()
    {
        return Err(username_in_use());
    }

    if store
        .find_user_by_email(email)
        .await
        .map_err(internal_error)?
        .is_some()
    {
        return Err(email_in_use());
    }

    let account = accounts::new_account(username, email, password);

    match store.insert_user(&account).await {
        Ok(()) => {}
        // Lost a race against a concurrent registration
        Err(DbError::UserTaken(UserKey::Email)) => return Err(email_in_use()),
        Err(DbError::UserTaken(_)) => return Err(username_in_use()),
        Err(e) => return Err(internal_error(e)),
    }

    tracing::info!(uuid = %account.uuid, "Created user {}", account.username);

    Ok(Json(RegisterResponse {
        message: "User created successfully".to_string(),
        username: account.username,
        uuid: account.uuid,
    }))
}

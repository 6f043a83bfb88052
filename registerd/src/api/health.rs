use axum::{extract::State, routing::get, Json, Router};
use shared::protocol::HEALTH_SERVICE_NAME;
use shared::types::HealthResponse;
use crate::api::routes::AppState;

pub fn routes() -> Router<AppState> {
    Router::new().route("/", get(health))
}

async fn health(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        service: HEALTH_SERVICE_NAME.to_string(),
        healthy: true,
        uptime: state.started.elapsed().as_secs_f64(),
    })
}

use std::sync::Arc;
use std::time::Instant;
use axum::{middleware, Router};
use tower_http::trace::TraceLayer;
use crate::api::middleware::{cors_layer, require_known_caller};
use crate::api::{health, register, verify};
use crate::config::ApiConfig;
use crate::db::Database;

#[derive(Clone)]
pub struct AppState {
    /// User data connection; handlers use it but never open or close it
    pub users: Arc<Database>,
    pub started: Instant,
    pub allowed_callers: Arc<Vec<String>>,
}

impl AppState {
    pub fn new(users: Arc<Database>, config: &ApiConfig) -> Self {
        Self {
            users,
            started: Instant::now(),
            allowed_callers: Arc::new(config.allowed_callers.clone()),
        }
    }
}

struct RouteEntry {
    name: &'static str,
    routes: fn() -> Router<AppState>,
    /// Whether callers must identify themselves
    restricted: bool,
}

/// Every route the service exposes, mounted under `/<name>`
const ROUTES: &[RouteEntry] = &[
    RouteEntry {
        name: "register",
        routes: register::routes,
        restricted: true,
    },
    RouteEntry {
        name: "verify",
        routes: verify::routes,
        restricted: true,
    },
    RouteEntry {
        name: "health",
        routes: health::routes,
        restricted: false,
    },
];

pub fn router(state: AppState, config: &ApiConfig) -> Router {
    let mut app = Router::new();

    for entry in ROUTES {
        tracing::debug!("Loading route /{}", entry.name);

        let mut routes = (entry.routes)();
        if entry.restricted {
            routes = routes.route_layer(middleware::from_fn_with_state(
                state.clone(),
                require_known_caller,
            ));
        }
        app = app.nest(&format!("/{}", entry.name), routes);
    }

    tracing::info!("Loaded {} routes", ROUTES.len());

    app.layer(cors_layer(&config.cors))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

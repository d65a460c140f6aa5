// API route aggregation, split by domain.
pub mod admin;
pub mod agents;
pub mod auth;
pub mod dashboard;
pub mod errors;
pub mod feedback;
pub mod integrations;
pub mod projects;
pub mod settings;
pub mod tasks;
pub mod user_context;
pub mod users;

use crate::core::state::AppState;
use crate::core::time_utils::{format_ts, now_ts};
use axum::extract::State;
use axum::{routing::get, Json, Router};
use serde_json::{json, Value};
use std::sync::Arc;

pub fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/", get(root))
        .route("/health", get(health))
        .merge(auth::router())
        .merge(users::router())
        .merge(dashboard::router())
        .merge(tasks::router())
        .merge(projects::router())
        .merge(agents::router())
        .merge(integrations::router())
        .merge(settings::router())
        .merge(feedback::router())
        .merge(admin::router())
        .with_state(state)
}

async fn root(State(state): State<Arc<AppState>>) -> Json<Value> {
    Json(json!({
        "name": "Aigentic API",
        "version": env!("CARGO_PKG_VERSION"),
        "status": "running",
        "environment": state.config.environment,
    }))
}

async fn health() -> Json<Value> {
    Json(json!({ "status": "healthy", "timestamp": format_ts(now_ts()) }))
}

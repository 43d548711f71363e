use axum::{
    http::{Method, StatusCode},
    response::Json,
    routing::get,
    Router,
};
use serde_json::json;
use std::sync::Arc;
use tower::ServiceBuilder;
use tower_http::{
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};

use crate::AppState;

pub mod automations;
pub mod jobs;

pub use automations::{automation_routes, event_routes};
pub use jobs::job_routes;

pub async fn health_check() -> (StatusCode, Json<serde_json::Value>) {
    (StatusCode::OK, Json(json!({"status": "healthy", "service": "cadence-engine"})))
}

/// Full HTTP surface
pub fn router(state: Arc<AppState>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET, Method::POST, Method::PUT, Method::DELETE])
        .allow_headers(Any);

    Router::new()
        .route("/", get(|| async { "Cadence Automation Engine API v1.0.0" }))
        .route("/health", get(health_check))
        .nest("/api/v1/automations", automation_routes())
        .nest("/api/v1/events", event_routes())
        .nest("/api/v1/jobs", job_routes())
        .layer(ServiceBuilder::new().layer(TraceLayer::new_for_http()).layer(cors))
        .with_state(state)
}

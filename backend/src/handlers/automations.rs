//! Automations - Publish, toggle, run and inspect lead automations

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::Json,
    routing::{get, post, put},
    Router,
};
use cadence_shared::{
    AutomationAnalytics, AutomationFilter, EventAccepted, ExecuteAutomationRequest, ExecuteAutomationResponse,
    ReEnrollRequest, ReEnrollResult, ToggleAutomationRequest,
};
use serde_json::{json, Value};
use std::sync::Arc;
use tracing::{error, info};
use uuid::Uuid;

use crate::workflows::{Automation, AutomationDraft, AutomationSummary, TriggerEvent};
use crate::{ApiError, ApiResult, AppState};

/// Bulk re-enrollment requests larger than this are rejected outright
const MAX_BULK_LEADS: usize = 10_000;

pub fn automation_routes() -> Router<Arc<AppState>> {
    Router::new()
        .route("/", get(list_automations).post(publish_automation))
        .route("/:id", get(get_automation).delete(delete_automation))
        .route("/:id/toggle", put(toggle_automation))
        .route("/:id/execute", post(execute_automation))
        .route("/:id/re-enroll", post(re_enroll_leads))
        .route("/:id/analytics", get(get_analytics))
}

pub fn event_routes() -> Router<Arc<AppState>> {
    Router::new().route("/", post(submit_event))
}

// ==================== Definitions ====================

async fn list_automations(
    State(state): State<Arc<AppState>>,
    Query(filter): Query<AutomationFilter>,
) -> ApiResult<Json<Vec<AutomationSummary>>> {
    Ok(Json(state.engine.list_automations(&filter).await?))
}

async fn publish_automation(
    State(state): State<Arc<AppState>>,
    Json(draft): Json<AutomationDraft>,
) -> ApiResult<(StatusCode, Json<Automation>)> {
    let automation = state.engine.publish_automation(draft).await?;
    Ok((StatusCode::CREATED, Json(automation)))
}

async fn get_automation(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<Automation>> {
    Ok(Json(state.engine.get_automation(id).await?))
}

async fn toggle_automation(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
    Json(payload): Json<ToggleAutomationRequest>,
) -> ApiResult<Json<Automation>> {
    Ok(Json(state.engine.toggle_automation(id, payload.active).await?))
}

async fn delete_automation(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<Value>> {
    let exited = state.engine.delete_automation(id).await?;
    Ok(Json(json!({ "deleted": true, "exited_enrollments": exited })))
}

// ==================== Runs ====================

async fn execute_automation(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
    Json(payload): Json<ExecuteAutomationRequest>,
) -> ApiResult<Json<ExecuteAutomationResponse>> {
    Ok(Json(state.engine.execute_automation(id, payload.lead_id).await?))
}

async fn re_enroll_leads(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
    Json(payload): Json<ReEnrollRequest>,
) -> ApiResult<Json<ReEnrollResult>> {
    if payload.lead_ids.is_empty() {
        return Err(ApiError::validation_single("lead_ids", "At least one lead is required"));
    }
    if payload.lead_ids.len() > MAX_BULK_LEADS {
        return Err(ApiError::validation_single(
            "lead_ids",
            format!("At most {} leads per request", MAX_BULK_LEADS),
        ));
    }

    let result = state
        .engine
        .re_enroll_leads(id, payload.lead_ids, payload.remove_existing)
        .await?;
    Ok(Json(result))
}

async fn get_analytics(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<AutomationAnalytics>> {
    Ok(Json(state.engine.get_automation_analytics(id).await?))
}

// ==================== Events ====================

/// Accepts the event and evaluates triggers in the background.
async fn submit_event(
    State(state): State<Arc<AppState>>,
    Json(event): Json<TriggerEvent>,
) -> (StatusCode, Json<EventAccepted>) {
    let event_id = event.event_id;
    let engine = state.engine.clone();

    tokio::spawn(async move {
        match engine.process_event(&event).await {
            Ok(created) => info!(event_id = %event.event_id, enrolled = created.len(), "Event handled"),
            Err(e) => error!(event_id = %event.event_id, "Event processing failed: {}", e),
        }
    });

    (StatusCode::ACCEPTED, Json(EventAccepted { event_id, accepted: true }))
}

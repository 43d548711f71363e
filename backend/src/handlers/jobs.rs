//! Jobs - Inspect and trigger the background sweeps

use axum::{
    extract::{Path, State},
    response::Json,
    routing::{get, post},
    Router,
};
use std::sync::Arc;

use crate::jobs::JobExecutionLog;
use crate::{ApiResult, AppState};

pub fn job_routes() -> Router<Arc<AppState>> {
    Router::new()
        .route("/runs", get(list_runs))
        .route("/:name/run", post(run_job))
}

/// Most recent sweeps, oldest first
async fn list_runs(State(state): State<Arc<AppState>>) -> Json<Vec<JobExecutionLog>> {
    Json(state.jobs.get_execution_logs().await)
}

async fn run_job(
    State(state): State<Arc<AppState>>,
    Path(name): Path<String>,
) -> ApiResult<Json<JobExecutionLog>> {
    Ok(Json(state.jobs.run_job_now(&name).await?))
}

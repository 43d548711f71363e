use axum::{
    body::Body,
    http::{Request, StatusCode},
    response::Response,
    Router,
};
use serde_json::{json, Value};
use tower::ServiceExt;
use uuid::Uuid;

use crate::tests::fixtures::{draft, nurture_graph, simple_graph};
use crate::tests::helpers::TestEngine;
use crate::workflows::conditions::presets;
use crate::workflows::steps::{Step, StepGraph, StepKind, WaitSpec};
use crate::workflows::{ConditionGroup, LogicMode, ReEnrollmentPolicy};

async fn send(app: &Router, method: &str, uri: &str, body: Option<Value>) -> Response {
    let builder = Request::builder().uri(uri).method(method);
    let request = match body {
        Some(body) => builder
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap(),
        None => builder.body(Body::empty()).unwrap(),
    };
    app.clone().oneshot(request).await.unwrap()
}

async fn json_body(response: Response) -> Value {
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
    serde_json::from_slice(&bytes).unwrap()
}

#[tokio::test]
async fn test_health_endpoint() {
    let t = TestEngine::new();
    let response = send(&t.router().await, "GET", "/health", None).await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(json_body(response).await["status"], "healthy");
}

#[tokio::test]
async fn test_publish_list_and_get_automation() {
    let t = TestEngine::new();
    let app = t.router().await;

    let payload = serde_json::to_value(draft("Open day follow-up", nurture_graph(), ReEnrollmentPolicy::disallowed())).unwrap();
    let response = send(&app, "POST", "/api/v1/automations", Some(payload)).await;
    assert_eq!(response.status(), StatusCode::CREATED);
    let created = json_body(response).await;
    assert_eq!(created["version"], 1);
    assert_eq!(created["status"], "active");
    let id = created["id"].as_str().unwrap().to_string();

    let response = send(&app, "GET", "/api/v1/automations?search=open%20day", None).await;
    assert_eq!(response.status(), StatusCode::OK);
    let listed = json_body(response).await;
    assert_eq!(listed.as_array().unwrap().len(), 1);
    assert_eq!(listed[0]["id"], id.as_str());
    assert_eq!(listed[0]["stats"]["total_enrollments"], 0);

    let response = send(&app, "GET", "/api/v1/automations?status=paused", None).await;
    assert!(json_body(response).await.as_array().unwrap().is_empty());

    let response = send(&app, "GET", &format!("/api/v1/automations/{}", id), None).await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(json_body(response).await["name"], "Open day follow-up");
}

#[tokio::test]
async fn test_invalid_definition_returns_422_with_details() {
    let t = TestEngine::new();
    let broken = StepGraph::new(vec![Step::trigger("start").then("ghost")]);
    let payload = serde_json::to_value(draft("Broken", broken, ReEnrollmentPolicy::disallowed())).unwrap();

    let response = send(&t.router().await, "POST", "/api/v1/automations", Some(payload)).await;
    assert_eq!(response.status(), StatusCode::UNPROCESSABLE_ENTITY);
    let body = json_body(response).await;
    assert_eq!(body["code"], "VALIDATION_ERROR");
    assert!(body["details"]["steps.start"].is_array());
}

#[tokio::test]
async fn test_unbounded_durations_return_422() {
    let t = TestEngine::new();
    let graph = StepGraph::new(vec![
        Step::trigger("start").then("watch"),
        Step::new(
            "watch",
            StepKind::Wait(WaitSpec::UntilCondition {
                groups: vec![ConditionGroup::and(vec![presets::converted()])],
                logic: LogicMode::And,
                poll_interval_seconds: None,
                max_wait_seconds: Some(u64::MAX),
                timeout_next: None,
            }),
        )
        .then("done"),
        Step::end("done", cadence_shared::ExitReason::Completed),
    ]);
    let policy = ReEnrollmentPolicy { allowed: true, min_delay_seconds: u64::MAX };
    let payload = serde_json::to_value(draft("Forever", graph, policy)).unwrap();

    let response = send(&t.router().await, "POST", "/api/v1/automations", Some(payload)).await;
    assert_eq!(response.status(), StatusCode::UNPROCESSABLE_ENTITY);
    let body = json_body(response).await;
    assert!(body["details"]["steps.watch"][0].as_str().unwrap().contains("exceeds"));
    assert!(body["details"]["re_enrollment.min_delay_seconds"].is_array());
}

#[tokio::test]
async fn test_job_routes_run_and_list_sweeps() {
    let t = TestEngine::new();
    let app = t.router().await;

    let response = send(&app, "POST", "/api/v1/jobs/resume_waiting/run", None).await;
    assert_eq!(response.status(), StatusCode::OK);
    let run = json_body(response).await;
    assert_eq!(run["status"], "Completed");
    assert_eq!(run["items_processed"], 0);

    let response = send(&app, "GET", "/api/v1/jobs/runs", None).await;
    assert_eq!(response.status(), StatusCode::OK);
    let runs = json_body(response).await;
    assert_eq!(runs.as_array().unwrap().len(), 1);
    assert_eq!(runs[0]["id"], run["id"]);

    let response = send(&app, "POST", "/api/v1/jobs/nightly/run", None).await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    assert_eq!(json_body(response).await["code"], "BAD_REQUEST");
}

#[tokio::test]
async fn test_unknown_automation_returns_404() {
    let t = TestEngine::new();
    let response = send(&t.router().await, "GET", &format!("/api/v1/automations/{}", Uuid::new_v4()), None).await;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
    assert_eq!(json_body(response).await["code"], "NOT_FOUND");
}

#[tokio::test]
async fn test_execute_then_analytics() {
    let t = TestEngine::new();
    let automation = t.publish(nurture_graph(), ReEnrollmentPolicy::disallowed()).await;
    let lead = t.lead().await;
    let app = t.router().await;

    let response = send(
        &app,
        "POST",
        &format!("/api/v1/automations/{}/execute", automation.id),
        Some(json!({ "lead_id": lead })),
    )
    .await;
    assert_eq!(response.status(), StatusCode::OK);
    let executed = json_body(response).await;
    assert_eq!(executed["status"], "waiting");
    assert!(executed["enrollment_id"].is_string());

    let response = send(&app, "GET", &format!("/api/v1/automations/{}/analytics", automation.id), None).await;
    assert_eq!(response.status(), StatusCode::OK);
    let analytics = json_body(response).await;
    assert_eq!(analytics["total_enrollments"], 1);
    assert_eq!(analytics["active_enrollments"], 1);
    assert_eq!(analytics["step_distribution"]["pause"], 1);
    assert_eq!(analytics["enrolled_leads"][0]["lead_id"], lead.to_string());
    assert!(!analytics["recent_activity"].as_array().unwrap().is_empty());
}

#[tokio::test]
async fn test_execute_for_unknown_lead_returns_404() {
    let t = TestEngine::new();
    let automation = t.publish(simple_graph(), ReEnrollmentPolicy::disallowed()).await;

    let response = send(
        &t.router().await,
        "POST",
        &format!("/api/v1/automations/{}/execute", automation.id),
        Some(json!({ "lead_id": Uuid::new_v4() })),
    )
    .await;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_re_enroll_endpoint() {
    let t = TestEngine::new();
    let automation = t.publish(simple_graph(), ReEnrollmentPolicy::disallowed()).await;
    let lead = t.lead().await;
    let app = t.router().await;
    let uri = format!("/api/v1/automations/{}/re-enroll", automation.id);

    let response = send(&app, "POST", &uri, Some(json!({ "lead_ids": [] }))).await;
    assert_eq!(response.status(), StatusCode::UNPROCESSABLE_ENTITY);

    let response = send(
        &app,
        "POST",
        &uri,
        Some(json!({ "lead_ids": [lead, Uuid::new_v4()], "remove_existing": true })),
    )
    .await;
    assert_eq!(response.status(), StatusCode::OK);
    let result = json_body(response).await;
    assert_eq!(result["success"], 1);
    assert_eq!(result["failed"], 1);
    assert_eq!(result["errors"].as_array().unwrap().len(), 1);
}

#[tokio::test]
async fn test_toggle_and_delete() {
    let t = TestEngine::new();
    let automation = t.publish(simple_graph(), ReEnrollmentPolicy::disallowed()).await;
    let app = t.router().await;
    let uri = format!("/api/v1/automations/{}", automation.id);

    let response = send(&app, "PUT", &format!("{}/toggle", uri), Some(json!({ "active": false }))).await;
    assert_eq!(response.status(), StatusCode::OK);
    let toggled = json_body(response).await;
    assert_eq!(toggled["is_active"], false);
    assert_eq!(toggled["status"], "paused");

    let response = send(&app, "DELETE", &uri, None).await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(json_body(response).await["deleted"], true);

    let response = send(&app, "GET", &uri, None).await;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
    let response = send(&app, "DELETE", &uri, None).await;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_event_submission_is_accepted() {
    let t = TestEngine::new();
    let automation = t.publish(simple_graph(), ReEnrollmentPolicy::disallowed()).await;
    let lead = t.lead().await;

    let response = send(
        &t.router().await,
        "POST",
        "/api/v1/events",
        Some(json!({ "event_type": "lead_created", "lead_id": lead, "payload": { "source": "landing" } })),
    )
    .await;
    assert_eq!(response.status(), StatusCode::ACCEPTED);
    assert_eq!(json_body(response).await["accepted"], true);

    // Evaluation runs in the background
    let mut enrolled = 0;
    for _ in 0..50 {
        enrolled = t.enrollments_for_lead(automation.id, lead).await.len();
        if enrolled > 0 {
            break;
        }
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
    }
    assert_eq!(enrolled, 1);
}

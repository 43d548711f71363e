use std::sync::Arc;

use async_trait::async_trait;
use cadence_shared::{EnrollmentStatus, ExitReason, StepOutcome};
use chrono::Duration;

use crate::jobs::{JobConfig, JobError, JobScheduler, JobStatus};
use crate::services::{CollaboratorResult, HttpCaller, HttpRequest, HttpResponse};
use crate::tests::fixtures::{nurture_graph, simple_graph};
use crate::tests::helpers::{test_config, TestEngine};
use crate::workflows::steps::{DelaySpec, Step, StepGraph};
use crate::workflows::triggers::EventSource;
use crate::workflows::{ReEnrollmentPolicy, TriggerEvent};

async fn scheduler_for(t: &TestEngine, batch_size: usize) -> JobScheduler {
    let config = JobConfig {
        resume_batch_size: batch_size,
        ..JobConfig::from(&test_config())
    };
    JobScheduler::new(t.engine.clone(), config).await.unwrap()
}

#[tokio::test]
async fn test_sweep_with_nothing_due() {
    let t = TestEngine::new();
    let scheduler = scheduler_for(&t, 50).await;

    let log = scheduler.run_job_now("resume_waiting").await.unwrap();
    assert_eq!(log.status, JobStatus::Completed);
    assert_eq!(log.items_processed, 0);
    assert!(log.errors.is_empty());
    assert!(log.completed_at.is_some());

    let logs = scheduler.get_execution_logs().await;
    assert_eq!(logs.len(), 1);
    assert_eq!(logs[0].id, log.id);
}

#[tokio::test]
async fn test_sweep_resumes_due_runs_in_batches() {
    let t = TestEngine::new();
    let automation = t.publish(nurture_graph(), ReEnrollmentPolicy::disallowed()).await;

    let mut runs = Vec::new();
    for _ in 0..5 {
        let lead = t.lead().await;
        let response = t.engine.execute_automation(automation.id, lead).await.unwrap();
        runs.push(response.enrollment_id.unwrap());
    }
    // Only four have waited long enough
    for run_id in &runs[..4] {
        t.elapse(*run_id, Duration::days(2) + Duration::minutes(1)).await;
    }

    let scheduler = scheduler_for(&t, 3).await;
    assert_eq!(scheduler.run_job_now("resume_waiting").await.unwrap().items_processed, 3);
    assert_eq!(scheduler.run_job_now("resume_waiting").await.unwrap().items_processed, 1);
    assert_eq!(scheduler.run_job_now("resume_waiting").await.unwrap().items_processed, 0);

    for run_id in &runs[..4] {
        assert_eq!(t.enrollment(*run_id).await.status, EnrollmentStatus::Completed);
    }
    assert_eq!(t.enrollment(runs[4]).await.status, EnrollmentStatus::Waiting);
    assert_eq!(scheduler.get_execution_logs().await.len(), 3);
}

#[tokio::test]
async fn test_sweep_recovers_orphaned_runs() {
    let t = TestEngine::new();
    t.publish(simple_graph(), ReEnrollmentPolicy::disallowed()).await;
    let lead = t.lead().await;

    // Enrolled but never picked up by a worker
    let created = t
        .engine
        .process_event(&TriggerEvent::lead_created(lead, EventSource::Integration("crm-import".to_string())))
        .await
        .unwrap();
    let run_id = created[0];
    assert_eq!(t.enrollment(run_id).await.status, EnrollmentStatus::Active);

    let scheduler = scheduler_for(&t, 50).await;
    assert_eq!(scheduler.run_job_now("resume_waiting").await.unwrap().items_processed, 0);

    t.elapse(run_id, Duration::minutes(10)).await;
    let log = scheduler.run_job_now("resume_waiting").await.unwrap();
    assert_eq!(log.items_processed, 1);
    assert_eq!(t.enrollment(run_id).await.status, EnrollmentStatus::Completed);
    assert_eq!(t.sender.sent_to(lead).await.len(), 1);
}

struct CrashingCaller;

#[async_trait]
impl HttpCaller for CrashingCaller {
    async fn call(&self, request: &HttpRequest) -> CollaboratorResult<HttpResponse> {
        panic!("adapter crashed on {}", request.url);
    }
}

#[tokio::test]
async fn test_crashing_run_does_not_stop_the_sweep() {
    let t = TestEngine::with_http(Arc::new(CrashingCaller));
    let healthy = t.publish(nurture_graph(), ReEnrollmentPolicy::disallowed()).await;
    let crashing = t
        .publish(
            StepGraph::new(vec![
                Step::trigger("start").then("pause"),
                Step::wait("pause", DelaySpec::days(1)).then("notify"),
                Step::webhook("notify", "http://crm.invalid/hook", None, None).then("done"),
                Step::end("done", ExitReason::Completed),
            ]),
            ReEnrollmentPolicy::disallowed(),
        )
        .await;

    let lead = t.lead().await;
    let healthy_run = t.engine.execute_automation(healthy.id, lead).await.unwrap().enrollment_id.unwrap();
    let crashing_run = t.engine.execute_automation(crashing.id, lead).await.unwrap().enrollment_id.unwrap();
    for run_id in [healthy_run, crashing_run] {
        t.elapse(run_id, Duration::days(3)).await;
    }

    let scheduler = scheduler_for(&t, 50).await;
    let log = scheduler.run_job_now("resume_waiting").await.unwrap();
    assert_eq!(log.items_processed, 2);
    assert_eq!(t.enrollment(healthy_run).await.status, EnrollmentStatus::Completed);

    let crashed = t.enrollment(crashing_run).await;
    assert_eq!(crashed.status, EnrollmentStatus::Failed);
    assert!(crashed.last_error.unwrap().contains("adapter crashed"));
    assert!(t
        .logs(crashing_run)
        .await
        .iter()
        .any(|l| l.step_id == "notify" && l.outcome == StepOutcome::Failed));

    // The failed run is released, not left claimed for the next sweep
    assert_eq!(scheduler.run_job_now("resume_waiting").await.unwrap().items_processed, 0);
}

#[tokio::test]
async fn test_unknown_job_and_bad_config() {
    let t = TestEngine::new();
    let scheduler = scheduler_for(&t, 50).await;
    assert!(matches!(
        scheduler.run_job_now("nightly_digest").await,
        Err(JobError::ConfigError(_))
    ));
    assert!(scheduler.get_execution_logs().await.is_empty());

    let zero_tick = JobConfig {
        tick_seconds: 0,
        ..JobConfig::default()
    };
    assert!(matches!(
        JobScheduler::new(t.engine.clone(), zero_tick).await,
        Err(JobError::ConfigError(_))
    ));
}

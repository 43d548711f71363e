use cadence_shared::{EnrollmentStatus, ExitReason};
use chrono::Duration;
use futures::future::join_all;
use serde_json::json;
use uuid::Uuid;

use crate::tests::fixtures::{nurture_graph, simple_graph};
use crate::tests::helpers::TestEngine;
use crate::workflows::triggers::EventSource;
use crate::workflows::{
    Condition, ConditionGroup, EngineError, LeadEventType, LogicMode, ReEnrollmentPolicy, TriggerEvent, TriggerSpec,
};

#[tokio::test]
async fn test_disallowed_reenrollment_keeps_one_enrollment() {
    let mut t = TestEngine::new();
    let automation = t.publish(simple_graph(), ReEnrollmentPolicy::disallowed()).await;
    let lead = t.lead().await;

    let event = TriggerEvent::lead_created(lead, EventSource::Form);
    assert_eq!(t.engine.process_event(&event).await.unwrap().len(), 1);
    t.run_queued().await;

    for _ in 0..3 {
        let again = TriggerEvent::lead_created(lead, EventSource::Form);
        assert!(t.engine.process_event(&again).await.unwrap().is_empty());
    }
    let manual = t.engine.execute_automation(automation.id, lead).await.unwrap();
    assert!(manual.enrollment_id.is_none());
    assert!(manual.message.contains("disabled"));

    let runs = t.enrollments_for_lead(automation.id, lead).await;
    assert_eq!(runs.len(), 1);
    assert_eq!(runs[0].status, EnrollmentStatus::Completed);
}

#[tokio::test]
async fn test_concurrent_events_enroll_once() {
    let t = TestEngine::new();
    let automation = t.publish(nurture_graph(), ReEnrollmentPolicy::disallowed()).await;
    let lead = t.lead().await;

    let events: Vec<_> = (0..10)
        .map(|_| TriggerEvent::lead_created(lead, EventSource::Api))
        .collect();
    let created: usize = join_all(events.iter().map(|e| t.engine.process_event(e)))
        .await
        .into_iter()
        .map(|r| r.unwrap().len())
        .sum();

    assert_eq!(created, 1);
    assert_eq!(t.enrollments_for_lead(automation.id, lead).await.len(), 1);
}

#[tokio::test]
async fn test_reenrollment_waits_for_min_delay() {
    let t = TestEngine::new();
    let automation = t.publish(simple_graph(), ReEnrollmentPolicy::after(Duration::days(1))).await;
    let lead = t.lead().await;

    let first = t.engine.execute_automation(automation.id, lead).await.unwrap();
    let first_id = first.enrollment_id.unwrap();

    let too_soon = t.engine.execute_automation(automation.id, lead).await.unwrap();
    assert!(too_soon.enrollment_id.is_none());
    assert!(too_soon.message.contains("delay"));

    t.elapse(first_id, Duration::days(1) + Duration::minutes(1)).await;
    let later = t.engine.execute_automation(automation.id, lead).await.unwrap();
    assert!(later.enrollment_id.is_some());
    assert_eq!(t.enrollments_for_lead(automation.id, lead).await.len(), 2);
}

#[tokio::test]
async fn test_reenroll_with_remove_existing_leaves_one_running() {
    let mut t = TestEngine::new();
    let automation = t.publish(nurture_graph(), ReEnrollmentPolicy::disallowed()).await;
    let lead = t.lead().await;
    let old_id = t
        .engine
        .execute_automation(automation.id, lead)
        .await
        .unwrap()
        .enrollment_id
        .unwrap();

    let result = t.engine.re_enroll_leads(automation.id, vec![lead], true).await.unwrap();
    assert_eq!((result.success, result.failed), (1, 0));

    let old = t.enrollment(old_id).await;
    assert_eq!(old.status, EnrollmentStatus::Exited);
    assert_eq!(old.exit_reason, Some(ExitReason::ReEnrolled));

    t.run_queued().await;
    let runs = t.enrollments_for_lead(automation.id, lead).await;
    assert_eq!(runs.len(), 2);
    assert_eq!(runs.iter().filter(|r| r.is_running()).count(), 1);
    assert_eq!(t.sender.sent_to(lead).await.len(), 2, "the new run starts from the top");
}

#[tokio::test]
async fn test_reenroll_without_remove_keeps_running_enrollment() {
    let t = TestEngine::new();
    let automation = t.publish(nurture_graph(), ReEnrollmentPolicy::disallowed()).await;
    let lead = t.lead().await;
    t.engine.execute_automation(automation.id, lead).await.unwrap();

    let result = t.engine.re_enroll_leads(automation.id, vec![lead], false).await.unwrap();
    assert_eq!(result.success, 1);

    let runs = t.enrollments_for_lead(automation.id, lead).await;
    assert_eq!(runs.len(), 1);
    assert!(runs[0].is_running());
}

#[tokio::test]
async fn test_bulk_reenroll_counts_missing_leads() {
    let t = TestEngine::new();
    let automation = t.publish(simple_graph(), ReEnrollmentPolicy::disallowed()).await;

    let mut lead_ids = Vec::new();
    for _ in 0..7 {
        lead_ids.push(t.lead().await);
    }
    let missing = vec![Uuid::new_v4(), Uuid::new_v4(), Uuid::new_v4()];
    lead_ids.extend(missing.iter().copied());

    let result = t.engine.re_enroll_leads(automation.id, lead_ids, false).await.unwrap();
    assert_eq!(result.success, 7);
    assert_eq!(result.failed, 3);

    let mut failed: Vec<Uuid> = result.errors.iter().map(|e| e.lead_id).collect();
    failed.sort();
    let mut expected = missing.clone();
    expected.sort();
    assert_eq!(failed, expected);
    assert!(result.errors.iter().all(|e| e.message.contains("not found")));
}

#[tokio::test]
async fn test_inactive_automation_rejects_enrollment() {
    let t = TestEngine::new();
    let automation = t.publish(simple_graph(), ReEnrollmentPolicy::disallowed()).await;
    t.engine.toggle_automation(automation.id, false).await.unwrap();
    let lead = t.lead().await;

    let err = t.engine.execute_automation(automation.id, lead).await.unwrap_err();
    assert!(matches!(err, EngineError::Validation { .. }));

    let event = TriggerEvent::lead_created(lead, EventSource::Api);
    assert!(t.engine.process_event(&event).await.unwrap().is_empty());

    let err = t.engine.re_enroll_leads(automation.id, vec![lead], false).await.unwrap_err();
    assert!(matches!(err, EngineError::Validation { .. }));
}

#[tokio::test]
async fn test_unknown_lead_is_not_found() {
    let t = TestEngine::new();
    let automation = t.publish(simple_graph(), ReEnrollmentPolicy::disallowed()).await;

    let err = t.engine.execute_automation(automation.id, Uuid::new_v4()).await.unwrap_err();
    assert!(matches!(err, EngineError::NotFound(ref what) if what.starts_with("Lead")));
}

#[tokio::test]
async fn test_trigger_conditions_gate_events() {
    let t = TestEngine::new();
    let mut draft = crate::tests::fixtures::draft("Tagged leads", simple_graph(), ReEnrollmentPolicy::disallowed());
    draft.trigger = TriggerSpec::on(LeadEventType::TagAdded)
        .with_payload("tag", json!("vip"))
        .when(
            vec![ConditionGroup::or(vec![
                Condition::equals("stage", json!("inquiry")),
                Condition::has_tag("priority"),
            ])],
            LogicMode::And,
        );
    let automation = t.engine.publish_automation(draft).await.unwrap();

    let lead = t.lead().await;
    let other_tag = TriggerEvent::tag_added(lead, "newsletter");
    assert!(t.engine.process_event(&other_tag).await.unwrap().is_empty());

    let wrong_type = TriggerEvent::lead_created(lead, EventSource::Api);
    assert!(t.engine.process_event(&wrong_type).await.unwrap().is_empty());

    t.leads.set_field(lead, "stage", json!("applicant")).await;
    let vip = TriggerEvent::tag_added(lead, "vip");
    assert!(t.engine.process_event(&vip).await.unwrap().is_empty());

    t.leads.set_field(lead, "tags", json!(["priority"])).await;
    let vip = TriggerEvent::tag_added(lead, "vip");
    assert_eq!(t.engine.process_event(&vip).await.unwrap().len(), 1);
    assert_eq!(t.enrollments_for_lead(automation.id, lead).await.len(), 1);
}

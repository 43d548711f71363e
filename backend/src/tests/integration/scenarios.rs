use cadence_shared::{EnrollmentStatus, ExitReason, StepOutcome};
use chrono::Duration;
use serde_json::json;

use crate::tests::fixtures::{draft, nurture_graph, simple_graph};
use crate::tests::helpers::{events_of, TestEngine};
use crate::workflows::executor::{pick_branch, split_bucket};
use crate::workflows::steps::{MessageChannel, Step, StepGraph, StepKind};
use crate::workflows::{AdvanceOutcome, EngineError, ReEnrollmentPolicy};

#[tokio::test]
async fn test_converted_lead_ends_with_goal_and_no_sms() {
    let t = TestEngine::new();
    let automation = t.publish(nurture_graph(), ReEnrollmentPolicy::disallowed()).await;
    let lead = t.lead().await;

    let response = t.engine.execute_automation(automation.id, lead).await.unwrap();
    let run_id = response.enrollment_id.expect("enrolled");
    assert_eq!(response.status, Some(EnrollmentStatus::Waiting));

    let sent = t.sender.sent_to(lead).await;
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].channel, MessageChannel::Email);

    t.leads.set_field(lead, "status", json!("converted")).await;
    t.elapse(run_id, Duration::days(2) + Duration::minutes(1)).await;

    let outcome = t.advance(run_id).await;
    assert_eq!(outcome, AdvanceOutcome::Finished { status: EnrollmentStatus::Completed });

    let run = t.enrollment(run_id).await;
    assert_eq!(run.exit_reason, Some(ExitReason::GoalAchieved));
    assert_eq!(run.current_step_id.as_deref(), Some("won"));
    assert_eq!(t.sender.sent_to(lead).await.len(), 1, "no SMS for a converted lead");
}

#[tokio::test]
async fn test_unconverted_lead_gets_sms_then_completes() {
    let t = TestEngine::new();
    let automation = t.publish(nurture_graph(), ReEnrollmentPolicy::disallowed()).await;
    let lead = t.lead().await;

    let run_id = t
        .engine
        .execute_automation(automation.id, lead)
        .await
        .unwrap()
        .enrollment_id
        .unwrap();
    t.elapse(run_id, Duration::days(2) + Duration::minutes(1)).await;

    let outcome = t.advance(run_id).await;
    assert_eq!(outcome, AdvanceOutcome::Finished { status: EnrollmentStatus::Completed });

    let run = t.enrollment(run_id).await;
    assert_eq!(run.exit_reason, Some(ExitReason::Completed));

    let sent = t.sender.sent_to(lead).await;
    assert_eq!(sent.len(), 2);
    assert_eq!(sent[1].channel, MessageChannel::Sms);
    let first_name = t.leads.get(lead).await.unwrap().attributes["firstName"].as_str().unwrap().to_string();
    assert!(sent[1].body.as_deref().unwrap().contains(&first_name));

    let logs = t.logs(run_id).await;
    assert_eq!(events_of(&logs, "waiting"), 1);
    assert_eq!(events_of(&logs, "resumed"), 1);
    assert_eq!(events_of(&logs, "ended"), 1);
}

#[tokio::test]
async fn test_split_assignment_is_deterministic_per_lead() {
    let t = TestEngine::new();
    let graph = StepGraph::new(vec![
        Step::trigger("start").then("ab"),
        Step::split("ab", vec![("A", 50, "send_a"), ("B", 50, "send_b")]),
        Step::send_email("send_a", "Variant A", "Short copy").then("done"),
        Step::send_email("send_b", "Variant B", "Long copy").then("done"),
        Step::end("done", ExitReason::Completed),
    ]);
    let automation = t.publish(graph, ReEnrollmentPolicy::after(Duration::zero())).await;

    let StepKind::Split(split) = &automation.steps.get("ab").unwrap().kind else {
        unreachable!("ab is a split step");
    };

    for _ in 0..20 {
        let lead = t.lead().await;
        let expected = pick_branch(&split.branches, split_bucket(lead, automation.id, "ab"))
            .unwrap()
            .label
            .clone();

        for _ in 0..2 {
            let run_id = t
                .engine
                .execute_automation(automation.id, lead)
                .await
                .unwrap()
                .enrollment_id
                .expect("immediate re-enrollment is allowed");
            let run = t.enrollment(run_id).await;
            assert_eq!(run.variant_assignments.get("ab"), Some(&expected));
        }

        let subjects: Vec<_> = t
            .sender
            .sent_to(lead)
            .await
            .into_iter()
            .filter_map(|m| m.subject)
            .collect();
        assert_eq!(subjects, vec![format!("Variant {}", expected); 2]);
    }
}

#[tokio::test]
async fn test_go_to_workflow_transfers_lead() {
    let mut t = TestEngine::new();
    let target = t.publish(simple_graph(), ReEnrollmentPolicy::disallowed()).await;
    let source = t
        .publish(
            StepGraph::new(vec![Step::trigger("start").then("hand_off"), Step::go_to("hand_off", target.id)]),
            ReEnrollmentPolicy::disallowed(),
        )
        .await;
    let lead = t.lead().await;

    let response = t.engine.execute_automation(source.id, lead).await.unwrap();
    assert_eq!(response.status, Some(EnrollmentStatus::Exited));
    let source_run = t.enrollment(response.enrollment_id.unwrap()).await;
    assert_eq!(source_run.exit_reason, Some(ExitReason::Transferred));

    assert_eq!(t.run_queued().await, 1);
    let target_runs = t.enrollments_for_lead(target.id, lead).await;
    assert_eq!(target_runs.len(), 1);
    assert_eq!(target_runs[0].status, EnrollmentStatus::Completed);
    assert_eq!(t.sender.sent_to(lead).await.len(), 1);
}

#[tokio::test]
async fn test_transfer_outcome_is_logged_on_source_run() {
    let mut t = TestEngine::new();
    let target = t.publish(simple_graph(), ReEnrollmentPolicy::disallowed()).await;
    let source = t
        .publish(
            StepGraph::new(vec![Step::trigger("start").then("hand_off"), Step::go_to("hand_off", target.id)]),
            ReEnrollmentPolicy::after(Duration::zero()),
        )
        .await;
    let lead = t.lead().await;
    let transfer_entry = |logs: Vec<crate::workflows::StepExecutionLog>, event: &str| {
        logs.into_iter().find(|l| l.detail["event"] == event)
    };

    let first = t.engine.execute_automation(source.id, lead).await.unwrap().enrollment_id.unwrap();
    let enrolled = transfer_entry(t.logs(first).await, "transfer_enrolled").expect("transfer logged");
    assert_eq!(enrolled.step_id, "hand_off");
    assert_eq!(enrolled.outcome, StepOutcome::Completed);
    assert_eq!(t.run_queued().await, 1);

    // The target never takes the same lead twice
    let second = t.engine.execute_automation(source.id, lead).await.unwrap().enrollment_id.unwrap();
    let skipped = transfer_entry(t.logs(second).await, "transfer_skipped").expect("skip logged");
    assert_eq!(skipped.outcome, StepOutcome::Skipped);
    assert!(skipped.detail["reason"].as_str().unwrap().contains("disabled"));

    t.engine.toggle_automation(target.id, false).await.unwrap();
    let third = t.engine.execute_automation(source.id, lead).await.unwrap().enrollment_id.unwrap();
    let failed = transfer_entry(t.logs(third).await, "transfer_failed").expect("failure logged");
    assert_eq!(failed.outcome, StepOutcome::Failed);
    assert!(failed.error.is_some());
    assert_eq!(t.enrollments_for_lead(target.id, lead).await.len(), 1);
}

#[tokio::test]
async fn test_running_enrollments_stay_on_their_version() {
    let t = TestEngine::new();
    let automation = t.publish(nurture_graph(), ReEnrollmentPolicy::disallowed()).await;
    let lead = t.lead().await;
    let run_id = t
        .engine
        .execute_automation(automation.id, lead)
        .await
        .unwrap()
        .enrollment_id
        .unwrap();

    let mut next = draft("Shorter nurture", simple_graph(), ReEnrollmentPolicy::disallowed());
    next.id = Some(automation.id);
    let republished = t.engine.publish_automation(next).await.unwrap();
    assert_eq!(republished.version, 2);
    assert_eq!(republished.created_at, automation.created_at);

    t.elapse(run_id, Duration::days(3)).await;
    t.advance(run_id).await;

    let run = t.enrollment(run_id).await;
    assert_eq!(run.automation_version, 1);
    assert_eq!(run.status, EnrollmentStatus::Completed);
    // The SMS branch only exists in version 1.
    assert_eq!(t.sender.sent_to(lead).await.last().unwrap().channel, MessageChannel::Sms);
}

#[tokio::test]
async fn test_failed_step_fails_the_run_and_logs_it() {
    let t = TestEngine::new();
    let automation = t.publish(simple_graph(), ReEnrollmentPolicy::disallowed()).await;
    t.sender.fail_channel(MessageChannel::Email).await;
    let lead = t.lead().await;

    let response = t.engine.execute_automation(automation.id, lead).await.unwrap();
    assert_eq!(response.status, Some(EnrollmentStatus::Failed));

    let run = t.enrollment(response.enrollment_id.unwrap()).await;
    assert!(run.last_error.unwrap().contains("email provider down"));
    let failed = t
        .logs(run.id)
        .await
        .into_iter()
        .filter(|l| l.step_id == "welcome")
        .collect::<Vec<_>>();
    assert_eq!(failed.len(), 1);
    assert!(failed[0].error.is_some());
}

#[tokio::test]
async fn test_delete_exits_running_enrollments() {
    let t = TestEngine::new();
    let automation = t.publish(nurture_graph(), ReEnrollmentPolicy::disallowed()).await;
    let lead = t.lead().await;
    let run_id = t
        .engine
        .execute_automation(automation.id, lead)
        .await
        .unwrap()
        .enrollment_id
        .unwrap();

    assert_eq!(t.engine.delete_automation(automation.id).await.unwrap(), 1);

    let run = t.enrollment(run_id).await;
    assert_eq!(run.status, EnrollmentStatus::Exited);
    assert_eq!(run.exit_reason, Some(ExitReason::AutomationDeleted));

    t.elapse(run_id, Duration::days(3)).await;
    assert_eq!(t.advance(run_id).await, AdvanceOutcome::NotClaimed);
    assert!(matches!(
        t.engine.get_automation(automation.id).await,
        Err(EngineError::NotFound(_))
    ));
    assert!(matches!(
        t.engine.delete_automation(automation.id).await,
        Err(EngineError::NotFound(_))
    ));
}

#[tokio::test]
async fn test_invalid_graph_is_rejected_at_publish() {
    let t = TestEngine::new();
    let broken = StepGraph::new(vec![Step::trigger("start").then("missing")]);

    let err = t
        .engine
        .publish_automation(draft("Broken", broken, ReEnrollmentPolicy::disallowed()))
        .await
        .unwrap_err();
    let EngineError::Validation { details } = err else {
        panic!("expected validation error, got {:?}", err);
    };
    assert!(details.contains_key("steps.start"));
    assert!(details.contains_key("steps.steps"));
}

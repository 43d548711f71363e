use cadence_shared::{EnrollmentStatus, ExitReason};
use chrono::{Duration, Utc};
use serde_json::{json, Map};
use uuid::Uuid;

use crate::services::{ListMembershipStore, TaskKind};
use crate::tests::helpers::TestEngine;
use crate::workflows::executor::split_bucket;
use crate::workflows::steps::{
    AdvisorStrategy, AssignAdvisorConfig, ChangeStageConfig, CreateCalendarEventConfig, CreateTaskConfig, DelaySpec,
    EndWorkflowConfig, ListConfig, MessageChannel, ScheduleFollowupConfig, Step, StepGraph, StepKind, TimeUnit,
    UpdateLeadConfig,
};
use crate::workflows::{Automation, ReEnrollmentPolicy};

/// trigger → `actions` in order → end
fn chain(actions: Vec<(&str, StepKind)>) -> StepGraph {
    let mut steps = Vec::new();
    let first = actions.first().map(|(id, _)| *id).unwrap_or("done");
    steps.push(Step::trigger("start").then(first));

    for (i, (id, kind)) in actions.iter().enumerate() {
        let next = actions.get(i + 1).map(|(id, _)| *id).unwrap_or("done");
        steps.push(Step::new(id, kind.clone()).then(next));
    }
    steps.push(Step::end("done", ExitReason::Completed));
    StepGraph::new(steps)
}

async fn run_once(t: &TestEngine, automation: &Automation, lead: Uuid) -> Uuid {
    let response = t.engine.execute_automation(automation.id, lead).await.unwrap();
    assert_eq!(response.status, Some(EnrollmentStatus::Completed), "{}", response.message);
    response.enrollment_id.unwrap()
}

#[tokio::test]
async fn test_update_lead_applies_fields_tags_and_score() {
    let t = TestEngine::new();
    let mut fields = Map::new();
    fields.insert("programInterest".to_string(), json!("{{stage}} track"));
    fields.insert("source".to_string(), json!("open day"));

    let automation = t
        .publish(
            chain(vec![(
                "enrich",
                StepKind::UpdateLead(UpdateLeadConfig {
                    fields,
                    add_tags: vec!["engaged".to_string(), "WEBINAR".to_string()],
                    remove_tags: vec!["webinar".to_string()],
                    score_delta: Some(5),
                    status: Some("contacted".to_string()),
                }),
            )]),
            ReEnrollmentPolicy::disallowed(),
        )
        .await;
    let lead = t.lead().await;
    run_once(&t, &automation, lead).await;

    let attributes = t.leads.get(lead).await.unwrap().attributes;
    assert_eq!(attributes["programInterest"], json!("inquiry track"));
    assert_eq!(attributes["source"], json!("open day"));
    assert_eq!(attributes["score"], json!(15));
    assert_eq!(attributes["status"], json!("contacted"));
    assert_eq!(attributes["tags"], json!(["engaged"]));
}

#[tokio::test]
async fn test_distributed_advisor_assignment_is_stable() {
    let t = TestEngine::new();
    let advisors = vec!["adv-ana".to_string(), "adv-luis".to_string(), "adv-mei".to_string()];
    let automation = t
        .publish(
            chain(vec![
                (
                    "assign",
                    StepKind::AssignAdvisor(AssignAdvisorConfig {
                        advisor_ids: advisors.clone(),
                        strategy: AdvisorStrategy::Distributed,
                    }),
                ),
                (
                    "call",
                    StepKind::CreateTask(CreateTaskConfig {
                        title: "Call {{firstName}}".to_string(),
                        description: None,
                        due_in: None,
                        assignee: None,
                        priority: Some("high".to_string()),
                    }),
                ),
            ]),
            ReEnrollmentPolicy::disallowed(),
        )
        .await;

    let mut seen = std::collections::HashSet::new();
    for _ in 0..30 {
        let lead = t.lead().await;
        run_once(&t, &automation, lead).await;

        let expected = &advisors[split_bucket(lead, automation.id, "assign") as usize % advisors.len()];
        let attributes = t.leads.get(lead).await.unwrap().attributes;
        assert_eq!(attributes["advisor"].as_str(), Some(expected.as_str()));

        // The follow-up task goes to whoever was just assigned
        let task = t.tasks.tasks().await.into_iter().find(|task| task.lead_id == lead).unwrap();
        assert_eq!(task.assignee.as_deref(), Some(expected.as_str()));
        seen.insert(expected.clone());
    }
    assert!(seen.len() > 1, "thirty leads should not all land on one advisor");
}

#[tokio::test]
async fn test_fixed_advisor_and_stage_change() {
    let t = TestEngine::new();
    let automation = t
        .publish(
            chain(vec![
                (
                    "assign",
                    StepKind::AssignAdvisor(AssignAdvisorConfig {
                        advisor_ids: vec!["adv-ana".to_string(), "adv-luis".to_string()],
                        strategy: AdvisorStrategy::Fixed,
                    }),
                ),
                ("promote", StepKind::ChangeStage(ChangeStageConfig { stage: "application".to_string() })),
            ]),
            ReEnrollmentPolicy::disallowed(),
        )
        .await;
    let lead = t.lead().await;
    let run_id = run_once(&t, &automation, lead).await;

    let attributes = t.leads.get(lead).await.unwrap().attributes;
    assert_eq!(attributes["advisor"], json!("adv-ana"));
    assert_eq!(attributes["stage"], json!("application"));

    let logs = t.logs(run_id).await;
    let promote = logs.iter().find(|l| l.step_id == "promote").unwrap();
    assert_eq!(promote.step_kind, "change_stage");
    assert_eq!(promote.detail["stage"], json!("application"));
}

#[tokio::test]
async fn test_task_and_calendar_event_timing() {
    let t = TestEngine::new();
    let automation = t
        .publish(
            chain(vec![
                (
                    "task",
                    StepKind::CreateTask(CreateTaskConfig {
                        title: "Review {{firstName}}'s transcript".to_string(),
                        description: Some("Lead is in {{stage}}".to_string()),
                        due_in: Some(DelaySpec::days(1)),
                        assignee: Some("registrar".to_string()),
                        priority: None,
                    }),
                ),
                (
                    "tour",
                    StepKind::CreateCalendarEvent(CreateCalendarEventConfig {
                        title: "Campus tour with {{firstName}}".to_string(),
                        description: None,
                        starts_in: DelaySpec::hours(2),
                        duration_minutes: 45,
                        location: Some("Main hall".to_string()),
                        attendees: vec!["{{email}}".to_string(), "tours@cadence.test".to_string()],
                    }),
                ),
            ]),
            ReEnrollmentPolicy::disallowed(),
        )
        .await;
    let lead = t.lead().await;
    let attributes = t.leads.get(lead).await.unwrap().attributes;
    let first_name = attributes["firstName"].as_str().unwrap().to_string();

    let before = Utc::now();
    run_once(&t, &automation, lead).await;
    let after = Utc::now();

    let tasks = t.tasks.tasks().await;
    assert_eq!(tasks.len(), 1);
    let task = &tasks[0];
    assert_eq!(task.kind, TaskKind::Task);
    assert_eq!(task.title, format!("Review {}'s transcript", first_name));
    assert_eq!(task.description.as_deref(), Some("Lead is in inquiry"));
    assert_eq!(task.assignee.as_deref(), Some("registrar"));
    assert_eq!(task.automation_id, Some(automation.id));
    let due = task.due_at.unwrap();
    assert!(due >= before + Duration::days(1) && due <= after + Duration::days(1));

    let events = t.tasks.events().await;
    assert_eq!(events.len(), 1);
    let event = &events[0];
    assert_eq!(event.title, format!("Campus tour with {}", first_name));
    assert_eq!(event.ends_at - event.starts_at, Duration::minutes(45));
    assert!(event.starts_at >= before + Duration::hours(2));
    assert_eq!(event.attendees[0], attributes["email"].as_str().unwrap());
}

#[tokio::test]
async fn test_list_membership_steps() {
    let t = TestEngine::new();
    let automation = t
        .publish(
            chain(vec![
                ("join", StepKind::ListAdd(ListConfig { list_id: "open-day-2026".to_string() })),
                ("leave", StepKind::ListRemove(ListConfig { list_id: "cold-leads".to_string() })),
            ]),
            ReEnrollmentPolicy::after(Duration::zero()),
        )
        .await;
    let lead = t.lead().await;
    t.lists.add("cold-leads", lead).await.unwrap();

    let first = run_once(&t, &automation, lead).await;
    assert_eq!(t.lists.members("open-day-2026").await.unwrap(), vec![lead]);
    assert!(t.lists.members("cold-leads").await.unwrap().is_empty());

    let logs = t.logs(first).await;
    assert!(logs.iter().filter(|l| l.step_id != "start" && l.step_id != "done").all(|l| l.detail["changed"] == json!(true)));

    // A second pass is a no-op on the lists but still succeeds
    let second = run_once(&t, &automation, lead).await;
    assert_eq!(t.lists.members("open-day-2026").await.unwrap(), vec![lead]);
    let join = t.logs(second).await.into_iter().find(|l| l.step_id == "join").unwrap();
    assert_eq!(join.detail["changed"], json!(false));
}

#[tokio::test]
async fn test_schedule_followup_creates_channel_task() {
    let t = TestEngine::new();
    let automation = t
        .publish(
            chain(vec![(
                "followup",
                StepKind::ScheduleFollowup(ScheduleFollowupConfig {
                    after: DelaySpec::new(3, TimeUnit::Days),
                    channel: Some(MessageChannel::Whatsapp),
                    note: "Check in with {{firstName}} about the deposit".to_string(),
                    assignee: None,
                }),
            )]),
            ReEnrollmentPolicy::disallowed(),
        )
        .await;
    let lead = t.lead().await;
    t.leads.set_field(lead, "advisor", json!("adv-mei")).await;

    let before = Utc::now();
    run_once(&t, &automation, lead).await;

    let tasks = t.tasks.tasks().await;
    assert_eq!(tasks.len(), 1);
    assert_eq!(tasks[0].kind, TaskKind::Followup);
    assert_eq!(tasks[0].channel, Some(MessageChannel::Whatsapp));
    assert_eq!(tasks[0].assignee.as_deref(), Some("adv-mei"));
    assert!(tasks[0].title.starts_with("Check in with "));
    assert!(tasks[0].due_at.unwrap() >= before + Duration::days(3));
}

#[tokio::test]
async fn test_end_step_writes_final_lead_status() {
    let t = TestEngine::new();
    let automation = t
        .publish(
            StepGraph::new(vec![
                Step::trigger("start").then("done"),
                Step::new(
                    "done",
                    StepKind::EndWorkflow(EndWorkflowConfig {
                        reason: ExitReason::Disqualified,
                        lead_status: Some("nurture_closed".to_string()),
                    }),
                ),
            ]),
            ReEnrollmentPolicy::disallowed(),
        )
        .await;
    let lead = t.lead().await;

    let response = t.engine.execute_automation(automation.id, lead).await.unwrap();
    let run = t.enrollment(response.enrollment_id.unwrap()).await;
    assert_eq!(run.exit_reason, Some(ExitReason::Disqualified));
    assert_eq!(t.leads.get(lead).await.unwrap().attributes["status"], json!("nurture_closed"));
}

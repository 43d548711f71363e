// Workflow Steps - The closed set of step kinds an automation graph is built from

use cadence_shared::ExitReason;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, HashMap, HashSet};
use uuid::Uuid;

use super::conditions::{ConditionGroup, LogicMode};
use super::error::ValidationBuilder;

pub type StepId = String;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageChannel {
    Email,
    Sms,
    Whatsapp,
    Notification,
}

impl MessageChannel {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Email => "email",
            Self::Sms => "sms",
            Self::Whatsapp => "whatsapp",
            Self::Notification => "notification",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TimeUnit {
    Minutes,
    Hours,
    Days,
    Weeks,
}

/// A relative offset such as "2 days"
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DelaySpec {
    pub amount: u32,
    pub unit: TimeUnit,
}

impl DelaySpec {
    pub fn new(amount: u32, unit: TimeUnit) -> Self {
        Self { amount, unit }
    }

    pub fn days(amount: u32) -> Self {
        Self::new(amount, TimeUnit::Days)
    }

    pub fn hours(amount: u32) -> Self {
        Self::new(amount, TimeUnit::Hours)
    }

    pub fn as_seconds(&self) -> u64 {
        let unit = match self.unit {
            TimeUnit::Minutes => 60,
            TimeUnit::Hours => 60 * 60,
            TimeUnit::Days => 24 * 60 * 60,
            TimeUnit::Weeks => 7 * 24 * 60 * 60,
        };
        u64::from(self.amount) * unit
    }

    pub fn to_duration(&self) -> Duration {
        bounded_seconds(self.as_seconds())
    }
}

/// Longest delay, wait or re-enrollment gap a definition may ask for
pub const MAX_DELAY_SECONDS: u64 = 10 * 366 * 24 * 60 * 60;

/// Most retries a webhook step may declare
pub const MAX_WEBHOOK_RETRIES: u32 = 10;

/// Configured seconds as a duration, clamped to [`MAX_DELAY_SECONDS`]
pub fn bounded_seconds(secs: u64) -> Duration {
    Duration::seconds(secs.min(MAX_DELAY_SECONDS) as i64)
}

/// `at + delay`, saturating at the latest representable instant
pub fn add_saturating(at: DateTime<Utc>, delay: Duration) -> DateTime<Utc> {
    at.checked_add_signed(delay).unwrap_or(DateTime::<Utc>::MAX_UTC)
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SendMessageConfig {
    pub channel: MessageChannel,
    /// Recipient override; defaults to the lead's email or phone for the channel.
    #[serde(default)]
    pub to: Option<String>,
    #[serde(default)]
    pub subject: Option<String>,
    #[serde(default)]
    pub body: Option<String>,
    /// Provider-side template, rendered by the sender with `variables`.
    #[serde(default)]
    pub template_id: Option<String>,
    #[serde(default)]
    pub variables: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct UpdateLeadConfig {
    #[serde(default)]
    pub fields: serde_json::Map<String, Value>,
    #[serde(default)]
    pub add_tags: Vec<String>,
    #[serde(default)]
    pub remove_tags: Vec<String>,
    #[serde(default)]
    pub score_delta: Option<i64>,
    #[serde(default)]
    pub status: Option<String>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AdvisorStrategy {
    /// Always the first advisor in the pool
    #[default]
    Fixed,
    /// Stable spread of leads across the pool
    Distributed,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AssignAdvisorConfig {
    pub advisor_ids: Vec<String>,
    #[serde(default)]
    pub strategy: AdvisorStrategy,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeStageConfig {
    pub stage: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CreateTaskConfig {
    pub title: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub due_in: Option<DelaySpec>,
    #[serde(default)]
    pub assignee: Option<String>,
    #[serde(default)]
    pub priority: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CreateCalendarEventConfig {
    pub title: String,
    #[serde(default)]
    pub description: Option<String>,
    pub starts_in: DelaySpec,
    pub duration_minutes: u32,
    #[serde(default)]
    pub location: Option<String>,
    #[serde(default)]
    pub attendees: Vec<String>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum HttpMethod {
    Get,
    #[default]
    Post,
    Put,
    Patch,
    Delete,
}

impl HttpMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Get => "GET",
            Self::Post => "POST",
            Self::Put => "PUT",
            Self::Patch => "PATCH",
            Self::Delete => "DELETE",
        }
    }
}

/// Retries after the first attempt; the delay doubles on each retry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub backoff_seconds: u64,
}

impl RetryPolicy {
    pub fn delay_for(&self, retry: u32) -> std::time::Duration {
        let factor = 2u64.saturating_pow(retry.saturating_sub(1));
        std::time::Duration::from_secs(self.backoff_seconds.saturating_mul(factor))
    }

    /// Time spent sleeping between attempts when every retry is used
    pub fn total_backoff(&self) -> std::time::Duration {
        // Past 64 retries the sum has already saturated
        (1..=self.max_retries.min(64))
            .map(|retry| self.delay_for(retry))
            .fold(std::time::Duration::ZERO, |total, delay| total.saturating_add(delay))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WebhookConfig {
    pub url: String,
    #[serde(default)]
    pub method: HttpMethod,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    #[serde(default)]
    pub body: Option<Value>,
    /// Falls back to the engine's webhook retry defaults when absent.
    #[serde(default)]
    pub retry: Option<RetryPolicy>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ListConfig {
    pub list_id: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScheduleFollowupConfig {
    pub after: DelaySpec,
    #[serde(default)]
    pub channel: Option<MessageChannel>,
    pub note: String,
    #[serde(default)]
    pub assignee: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConditionConfig {
    pub groups: Vec<ConditionGroup>,
    #[serde(default)]
    pub mode: LogicMode,
    pub true_next: StepId,
    pub false_next: StepId,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SplitBranch {
    pub label: String,
    pub percentage: u8,
    pub next: StepId,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SplitConfig {
    pub branches: Vec<SplitBranch>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum WaitSpec {
    Duration {
        amount: u32,
        unit: TimeUnit,
    },
    Until {
        at: chrono::DateTime<chrono::Utc>,
    },
    UntilCondition {
        groups: Vec<ConditionGroup>,
        #[serde(default)]
        logic: LogicMode,
        /// Engine default when absent
        #[serde(default)]
        poll_interval_seconds: Option<u64>,
        /// Engine default when absent
        #[serde(default)]
        max_wait_seconds: Option<u64>,
        /// Where to go when the ceiling is hit; `next` otherwise
        #[serde(default)]
        timeout_next: Option<StepId>,
    },
    BusinessHours {
        /// IANA name, e.g. "America/Bogota"; the engine default when absent
        #[serde(default)]
        timezone: Option<String>,
        start_hour: u32,
        end_hour: u32,
        #[serde(default = "default_business_days")]
        days: Vec<chrono::Weekday>,
    },
}

fn default_business_days() -> Vec<chrono::Weekday> {
    use chrono::Weekday::*;
    vec![Mon, Tue, Wed, Thu, Fri]
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GoToWorkflowConfig {
    pub automation_id: Uuid,
    #[serde(default = "default_true")]
    pub preserve_history: bool,
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EndWorkflowConfig {
    #[serde(default = "default_end_reason")]
    pub reason: ExitReason,
    /// Final status written to the lead record
    #[serde(default)]
    pub lead_status: Option<String>,
}

fn default_end_reason() -> ExitReason {
    ExitReason::Completed
}

/// One variant per step kind; the executor matches on this exhaustively.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StepKind {
    Trigger,
    SendMessage(SendMessageConfig),
    UpdateLead(UpdateLeadConfig),
    AssignAdvisor(AssignAdvisorConfig),
    ChangeStage(ChangeStageConfig),
    CreateTask(CreateTaskConfig),
    CreateCalendarEvent(CreateCalendarEventConfig),
    Webhook(WebhookConfig),
    ListAdd(ListConfig),
    ListRemove(ListConfig),
    ScheduleFollowup(ScheduleFollowupConfig),
    Condition(ConditionConfig),
    Split(SplitConfig),
    Wait(WaitSpec),
    GoToWorkflow(GoToWorkflowConfig),
    EndWorkflow(EndWorkflowConfig),
}

impl StepKind {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Trigger => "trigger",
            Self::SendMessage(_) => "send_message",
            Self::UpdateLead(_) => "update_lead",
            Self::AssignAdvisor(_) => "assign_advisor",
            Self::ChangeStage(_) => "change_stage",
            Self::CreateTask(_) => "create_task",
            Self::CreateCalendarEvent(_) => "create_calendar_event",
            Self::Webhook(_) => "webhook",
            Self::ListAdd(_) => "list_add",
            Self::ListRemove(_) => "list_remove",
            Self::ScheduleFollowup(_) => "schedule_followup",
            Self::Condition(_) => "condition",
            Self::Split(_) => "split",
            Self::Wait(_) => "wait",
            Self::GoToWorkflow(_) => "go_to_workflow",
            Self::EndWorkflow(_) => "end_workflow",
        }
    }

    /// Steps that end the current run and need no successor
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::EndWorkflow(_) | Self::GoToWorkflow(_))
    }

    /// Steps whose successors live in their own configuration
    fn is_branching(&self) -> bool {
        matches!(self, Self::Condition(_) | Self::Split(_))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Step {
    pub id: StepId,
    #[serde(default)]
    pub name: String,
    pub kind: StepKind,
    #[serde(default)]
    pub next: Option<StepId>,
}

impl Step {
    pub fn new(id: &str, kind: StepKind) -> Self {
        Self {
            id: id.to_string(),
            name: kind.name().replace('_', " "),
            kind,
            next: None,
        }
    }

    pub fn then(mut self, next: &str) -> Self {
        self.next = Some(next.to_string());
        self
    }

    pub fn named(mut self, name: &str) -> Self {
        self.name = name.to_string();
        self
    }

    /// Every step id this step can hand control to
    pub fn successors(&self) -> Vec<&StepId> {
        let mut out: Vec<&StepId> = Vec::new();
        match &self.kind {
            StepKind::Condition(c) => {
                out.push(&c.true_next);
                out.push(&c.false_next);
            }
            StepKind::Split(s) => out.extend(s.branches.iter().map(|b| &b.next)),
            StepKind::Wait(WaitSpec::UntilCondition {
                timeout_next: Some(t), ..
            }) => out.push(t),
            _ => {}
        }
        if let Some(next) = &self.next {
            out.push(next);
        }
        out
    }

    // ===== Builders =====

    pub fn trigger(id: &str) -> Self {
        Self::new(id, StepKind::Trigger)
    }

    pub fn send_email(id: &str, subject: &str, body: &str) -> Self {
        Self::send_message(id, MessageChannel::Email, Some(subject), body)
    }

    pub fn send_sms(id: &str, body: &str) -> Self {
        Self::send_message(id, MessageChannel::Sms, None, body)
    }

    pub fn send_message(id: &str, channel: MessageChannel, subject: Option<&str>, body: &str) -> Self {
        Self::new(
            id,
            StepKind::SendMessage(SendMessageConfig {
                channel,
                to: None,
                subject: subject.map(str::to_string),
                body: Some(body.to_string()),
                template_id: None,
                variables: BTreeMap::new(),
            }),
        )
    }

    pub fn wait(id: &str, delay: DelaySpec) -> Self {
        Self::new(
            id,
            StepKind::Wait(WaitSpec::Duration {
                amount: delay.amount,
                unit: delay.unit,
            }),
        )
    }

    pub fn condition(id: &str, groups: Vec<ConditionGroup>, mode: LogicMode, true_next: &str, false_next: &str) -> Self {
        Self::new(
            id,
            StepKind::Condition(ConditionConfig {
                groups,
                mode,
                true_next: true_next.to_string(),
                false_next: false_next.to_string(),
            }),
        )
    }

    pub fn split(id: &str, branches: Vec<(&str, u8, &str)>) -> Self {
        Self::new(
            id,
            StepKind::Split(SplitConfig {
                branches: branches
                    .into_iter()
                    .map(|(label, percentage, next)| SplitBranch {
                        label: label.to_string(),
                        percentage,
                        next: next.to_string(),
                    })
                    .collect(),
            }),
        )
    }

    pub fn end(id: &str, reason: ExitReason) -> Self {
        Self::new(
            id,
            StepKind::EndWorkflow(EndWorkflowConfig {
                reason,
                lead_status: None,
            }),
        )
    }

    pub fn go_to(id: &str, automation_id: Uuid) -> Self {
        Self::new(
            id,
            StepKind::GoToWorkflow(GoToWorkflowConfig {
                automation_id,
                preserve_history: true,
            }),
        )
    }

    pub fn webhook(id: &str, url: &str, body: Option<Value>, retry: Option<RetryPolicy>) -> Self {
        Self::new(
            id,
            StepKind::Webhook(WebhookConfig {
                url: url.to_string(),
                method: HttpMethod::Post,
                headers: BTreeMap::new(),
                body,
                retry,
            }),
        )
    }
}

/// The ordered step collection of one automation version
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StepGraph {
    pub steps: Vec<Step>,
}

impl StepGraph {
    pub fn new(steps: Vec<Step>) -> Self {
        Self { steps }
    }

    pub fn get(&self, id: &str) -> Option<&Step> {
        self.steps.iter().find(|s| s.id == id)
    }

    pub fn entry(&self) -> Option<&Step> {
        self.steps.iter().find(|s| matches!(s.kind, StepKind::Trigger))
    }

    /// Where a fresh enrollment is positioned
    pub fn first_after_trigger(&self) -> Option<&StepId> {
        self.entry().and_then(|t| t.next.as_ref())
    }

    /// Structural checks run at authoring time. Returns field → messages on failure.
    pub fn validate(&self) -> Result<(), HashMap<String, Vec<String>>> {
        let mut errors = ValidationBuilder::new();

        if self.steps.is_empty() {
            return Err(errors.error("steps", "an automation needs at least one step").into_details());
        }

        let mut seen = HashSet::new();
        for step in &self.steps {
            if !seen.insert(step.id.as_str()) {
                errors = errors.error(&step.id, "duplicate step id");
            }
        }

        let triggers = self.steps.iter().filter(|s| matches!(s.kind, StepKind::Trigger)).count();
        if triggers != 1 {
            errors = errors.error("steps", &format!("expected exactly one trigger step, found {}", triggers));
        }

        if !self.steps.iter().any(|s| s.kind.is_terminal()) {
            errors = errors.error("steps", "at least one end_workflow or go_to_workflow step is required");
        }

        for step in &self.steps {
            for target in step.successors() {
                if self.get(target).is_none() {
                    errors = errors.error(&step.id, &format!("successor '{}' does not exist", target));
                } else if self.get(target).is_some_and(|t| matches!(t.kind, StepKind::Trigger)) {
                    errors = errors.error(&step.id, "the trigger step cannot be a successor");
                }
            }

            if !step.kind.is_terminal() && !step.kind.is_branching() && step.next.is_none() {
                errors = errors.error(&step.id, "non-terminal step has no successor");
            }

            for message in step_config_problems(&step.kind) {
                errors = errors.error(&step.id, &message);
            }
        }

        match errors.build_details() {
            Some(details) => Err(details),
            None => Ok(()),
        }
    }
}

fn step_config_problems(kind: &StepKind) -> Vec<String> {
    let mut problems = Vec::new();

    match kind {
        StepKind::SendMessage(c) => {
            if c.body.as_deref().is_none_or(|b| b.trim().is_empty()) && c.template_id.is_none() {
                problems.push("send_message needs a body or a template_id".to_string());
            }
        }
        StepKind::AssignAdvisor(c) if c.advisor_ids.is_empty() => {
            problems.push("assign_advisor needs at least one advisor".to_string());
        }
        StepKind::Webhook(c) => {
            if !(c.url.starts_with("http://") || c.url.starts_with("https://")) {
                problems.push(format!("webhook url '{}' must be http(s)", c.url));
            }
            if let Some(retry) = c.retry {
                if retry.max_retries > MAX_WEBHOOK_RETRIES {
                    problems.push(format!("webhook retries are capped at {}", MAX_WEBHOOK_RETRIES));
                }
                problems.extend(delay_problem("retry backoff", retry.backoff_seconds));
            }
        }
        StepKind::CreateTask(c) => {
            problems.extend(c.due_in.and_then(|d| delay_problem("task due_in", d.as_seconds())));
        }
        StepKind::CreateCalendarEvent(c) => {
            problems.extend(delay_problem("event starts_in", c.starts_in.as_seconds()));
        }
        StepKind::ScheduleFollowup(c) => {
            problems.extend(delay_problem("follow-up delay", c.after.as_seconds()));
        }
        StepKind::Split(s) => {
            if s.branches.is_empty() {
                problems.push("split needs at least one branch".to_string());
            }
            let total: u32 = s.branches.iter().map(|b| u32::from(b.percentage)).sum();
            if total != 100 {
                problems.push(format!("split percentages must sum to 100, got {}", total));
            }
        }
        StepKind::Wait(WaitSpec::Duration { amount, unit }) => {
            if *amount == 0 {
                problems.push("wait duration must be positive".to_string());
            }
            problems.extend(delay_problem("wait duration", DelaySpec::new(*amount, *unit).as_seconds()));
        }
        StepKind::Wait(WaitSpec::UntilCondition {
            poll_interval_seconds,
            max_wait_seconds,
            ..
        }) => {
            if *poll_interval_seconds == Some(0) {
                problems.push("poll interval must be positive".to_string());
            }
            problems.extend(poll_interval_seconds.and_then(|s| delay_problem("poll interval", s)));
            problems.extend(max_wait_seconds.and_then(|s| delay_problem("max wait", s)));
        }
        StepKind::Wait(WaitSpec::BusinessHours {
            timezone,
            start_hour,
            end_hour,
            days,
        }) => {
            if let Some(tz) = timezone
                && tz.parse::<chrono_tz::Tz>().is_err()
            {
                problems.push(format!("unknown timezone '{}'", tz));
            }
            if start_hour >= end_hour || *end_hour > 24 {
                problems.push("business hours need start_hour < end_hour <= 24".to_string());
            }
            if days.is_empty() {
                problems.push("business hours need at least one day".to_string());
            }
        }
        _ => {}
    }

    problems
}

/// Out-of-range delays are rejected here and clamped at run time
pub fn delay_problem(what: &str, secs: u64) -> Option<String> {
    (secs > MAX_DELAY_SECONDS).then(|| format!("{} exceeds {} days", what, MAX_DELAY_SECONDS / (24 * 60 * 60)))
}

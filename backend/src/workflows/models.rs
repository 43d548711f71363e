// Workflow Models - Automations, their pinned versions, enrollments and the step log

use cadence_shared::{AutomationKind, AutomationStatus, EnrollmentStatus, ExitReason, StepOutcome};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use uuid::Uuid;

use super::error::{EngineError, ValidationBuilder};
use super::steps::{bounded_seconds, delay_problem, RetryPolicy, StepGraph, StepId, StepKind};
use super::triggers::TriggerSpec;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReEnrollmentPolicy {
    #[serde(default)]
    pub allowed: bool,
    /// Minimum gap between one run and the next for the same lead
    #[serde(default)]
    pub min_delay_seconds: u64,
}

impl ReEnrollmentPolicy {
    pub fn disallowed() -> Self {
        Self::default()
    }

    pub fn after(min_delay: Duration) -> Self {
        Self {
            allowed: true,
            min_delay_seconds: min_delay.num_seconds().max(0) as u64,
        }
    }

    pub fn min_delay(&self) -> Duration {
        bounded_seconds(self.min_delay_seconds)
    }
}

/// Current state of an automation definition
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Automation {
    pub id: Uuid,
    pub name: String,
    pub description: Option<String>,
    pub kind: AutomationKind,
    pub trigger: TriggerSpec,
    pub steps: StepGraph,
    pub is_active: bool,
    pub status: AutomationStatus,
    pub re_enrollment: ReEnrollmentPolicy,
    pub version: i32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub deleted_at: Option<DateTime<Utc>>,
}

impl Automation {
    /// Enrollments are only created while this holds; read fresh per decision.
    pub fn accepts_enrollments(&self) -> bool {
        self.is_active && self.status == AutomationStatus::Active && self.deleted_at.is_none()
    }

    pub fn is_paused(&self) -> bool {
        !self.accepts_enrollments() && self.deleted_at.is_none()
    }

    pub fn current_version(&self) -> AutomationVersion {
        AutomationVersion {
            automation_id: self.id,
            version: self.version,
            trigger: self.trigger.clone(),
            steps: self.steps.clone(),
            created_at: self.updated_at,
        }
    }
}

/// Immutable snapshot of a published definition. Enrollments execute against the
/// version they were created with.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AutomationVersion {
    pub automation_id: Uuid,
    pub version: i32,
    pub trigger: TriggerSpec,
    pub steps: StepGraph,
    pub created_at: DateTime<Utc>,
}

/// Authoring input for publishing a new automation or a new version of one
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AutomationDraft {
    #[serde(default)]
    pub id: Option<Uuid>,
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub kind: AutomationKind,
    pub trigger: TriggerSpec,
    pub steps: StepGraph,
    #[serde(default)]
    pub re_enrollment: ReEnrollmentPolicy,
    #[serde(default)]
    pub activate: bool,
}

impl AutomationDraft {
    pub fn validate(&self) -> Result<(), EngineError> {
        let mut errors = ValidationBuilder::new();

        if self.name.trim().is_empty() {
            errors = errors.error("name", "Name is required");
        }
        if let Some(message) = delay_problem("minimum re-enrollment delay", self.re_enrollment.min_delay_seconds) {
            errors = errors.error("re_enrollment.min_delay_seconds", &message);
        }
        if let Err(details) = self.steps.validate() {
            for (field, messages) in details {
                for message in messages {
                    errors = errors.error(&format!("steps.{}", field), &message);
                }
            }
        }

        match errors.build() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    /// A webhook step that sleeps between retries must finish inside one claim.
    /// `fallback` is the policy used by steps without their own.
    pub fn check_retry_budget(&self, fallback: RetryPolicy, claim_ttl: Duration) -> Result<(), EngineError> {
        let ttl = claim_ttl.to_std().unwrap_or_default();
        let mut errors = ValidationBuilder::new();

        for step in &self.steps.steps {
            let StepKind::Webhook(config) = &step.kind else {
                continue;
            };
            let backoff = config.retry.unwrap_or(fallback).total_backoff();
            if !backoff.is_zero() && backoff >= ttl {
                errors = errors.error(
                    &format!("steps.{}", step.id),
                    &format!(
                        "retries back off for {}s in total; must stay under the {}s claim ttl",
                        backoff.as_secs(),
                        ttl.as_secs()
                    ),
                );
            }
        }

        match errors.build() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

/// The wait step currently suspending a run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WaitState {
    pub step_id: StepId,
    pub started_at: DateTime<Utc>,
    /// Ceiling for condition waits
    pub deadline: Option<DateTime<Utc>>,
}

/// One lead's run through one automation version
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Enrollment {
    pub id: Uuid,
    pub automation_id: Uuid,
    pub automation_version: i32,
    pub lead_id: Uuid,
    pub current_step_id: Option<StepId>,
    pub status: EnrollmentStatus,
    pub enrolled_at: DateTime<Utc>,
    pub last_advanced_at: Option<DateTime<Utc>>,
    pub resumes_at: Option<DateTime<Utc>>,
    pub terminated_at: Option<DateTime<Utc>>,
    pub exit_reason: Option<ExitReason>,
    /// split step id → branch label
    pub variant_assignments: BTreeMap<StepId, String>,
    pub wait_state: Option<WaitState>,
    pub claim_token: Option<Uuid>,
    pub claimed_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
}

impl Enrollment {
    pub fn new(automation: &Automation, lead_id: Uuid, now: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4(),
            automation_id: automation.id,
            automation_version: automation.version,
            lead_id,
            current_step_id: automation.steps.first_after_trigger().cloned(),
            status: EnrollmentStatus::Active,
            enrolled_at: now,
            last_advanced_at: None,
            resumes_at: None,
            terminated_at: None,
            exit_reason: None,
            variant_assignments: BTreeMap::new(),
            wait_state: None,
            claim_token: None,
            claimed_at: None,
            last_error: None,
        }
    }

    pub fn is_running(&self) -> bool {
        self.status.is_running()
    }

    /// Whether a worker may take ownership at `now`
    pub fn is_claimable(&self, now: DateTime<Utc>, stale_before: DateTime<Utc>) -> bool {
        let runnable = match self.status {
            EnrollmentStatus::Active => true,
            EnrollmentStatus::Waiting => self.resumes_at.is_some_and(|at| at <= now),
            _ => false,
        };
        let unclaimed = match (self.claim_token, self.claimed_at) {
            (None, _) => true,
            (Some(_), Some(at)) => at < stale_before,
            (Some(_), None) => true,
        };
        runnable && unclaimed
    }

    pub fn terminate(&mut self, reason: ExitReason, now: DateTime<Utc>) {
        self.status = reason.terminal_status();
        self.exit_reason = Some(reason);
        self.terminated_at = Some(now);
        self.resumes_at = None;
        self.wait_state = None;
    }

    pub fn fail(&mut self, error: impl Into<String>, now: DateTime<Utc>) {
        self.status = EnrollmentStatus::Failed;
        self.last_error = Some(error.into());
        self.terminated_at = Some(now);
        self.resumes_at = None;
        self.wait_state = None;
    }

    pub fn suspend_until(&mut self, resumes_at: DateTime<Utc>, wait_state: Option<WaitState>) {
        self.status = EnrollmentStatus::Waiting;
        self.resumes_at = Some(resumes_at);
        self.wait_state = wait_state;
    }

    /// Moment the previous run stopped counting toward the re-enrollment delay
    pub fn delay_anchor(&self) -> DateTime<Utc> {
        self.terminated_at.unwrap_or(self.enrolled_at)
    }
}

/// Append-only audit record of one step execution
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepExecutionLog {
    pub id: Uuid,
    pub enrollment_id: Uuid,
    pub automation_id: Uuid,
    pub lead_id: Uuid,
    pub step_id: StepId,
    pub step_kind: String,
    pub outcome: StepOutcome,
    pub detail: Value,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl StepExecutionLog {
    pub fn new(enrollment: &Enrollment, step_id: &str, step_kind: &str, outcome: StepOutcome, now: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4(),
            enrollment_id: enrollment.id,
            automation_id: enrollment.automation_id,
            lead_id: enrollment.lead_id,
            step_id: step_id.to_string(),
            step_kind: step_kind.to_string(),
            outcome,
            detail: Value::Null,
            error: None,
            created_at: now,
        }
    }

    pub fn with_detail(mut self, detail: Value) -> Self {
        self.detail = detail;
        self
    }
}

// Enrollment Manager - Creates and terminates runs, enforces re-enrollment policy

use cadence_shared::{AutomationStatus, ExitReason, ReEnrollError, ReEnrollResult, StepOutcome};
use chrono::{DateTime, Utc};
use futures::stream::{self, StreamExt};
use std::sync::Arc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::error::{EngineError, EngineResult};
use super::models::{Automation, Enrollment, ReEnrollmentPolicy, StepExecutionLog};
use super::queue::RunQueue;
use super::steps::add_saturating;
use super::store::{EngineStore, EnrollOutcome};
use crate::services::LeadStore;

/// How strictly a new run is gated
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnrollMode {
    /// Trigger or manual enrollment: the automation's re-enrollment policy applies.
    Policy,
    /// Bulk re-enrollment: prior terminated runs are ignored, a running one still blocks.
    Forced,
}

/// Why an enrollment was or was not created
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EnrollDecision {
    Create,
    AlreadyRunning(Uuid),
    TooSoon { eligible_at: DateTime<Utc> },
    NotAllowed,
}

impl EnrollDecision {
    pub fn describe(&self) -> String {
        match self {
            Self::Create => "enrolled".to_string(),
            Self::AlreadyRunning(id) => format!("lead already has a running enrollment ({})", id),
            Self::TooSoon { eligible_at } => {
                format!("re-enrollment delay has not elapsed (eligible at {})", eligible_at.to_rfc3339())
            }
            Self::NotAllowed => "re-enrollment is disabled for this automation".to_string(),
        }
    }
}

/// Pure decision over a lead's history in one automation. Stores evaluate it
/// inside their critical section so the check and the insert are one step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EnrollmentGuard {
    pub policy: ReEnrollmentPolicy,
    pub mode: EnrollMode,
}

impl EnrollmentGuard {
    pub fn triggered(policy: ReEnrollmentPolicy) -> Self {
        Self { policy, mode: EnrollMode::Policy }
    }

    pub fn forced() -> Self {
        Self {
            policy: ReEnrollmentPolicy::disallowed(),
            mode: EnrollMode::Forced,
        }
    }

    pub fn decide<'a>(&self, history: impl IntoIterator<Item = &'a Enrollment>, now: DateTime<Utc>) -> EnrollDecision {
        let history: Vec<&Enrollment> = history.into_iter().collect();
        let running = history.iter().filter(|e| e.is_running()).max_by_key(|e| e.enrolled_at);
        let latest = history.iter().max_by_key(|e| e.enrolled_at);

        if self.mode == EnrollMode::Forced {
            return match running {
                Some(run) => EnrollDecision::AlreadyRunning(run.id),
                None => EnrollDecision::Create,
            };
        }

        let Some(latest) = latest else {
            return EnrollDecision::Create;
        };

        if !self.policy.allowed {
            return match running {
                Some(run) => EnrollDecision::AlreadyRunning(run.id),
                None => EnrollDecision::NotAllowed,
            };
        }

        let eligible_at = add_saturating(latest.delay_anchor(), self.policy.min_delay());
        if now < eligible_at {
            return match running {
                Some(run) => EnrollDecision::AlreadyRunning(run.id),
                None => EnrollDecision::TooSoon { eligible_at },
            };
        }

        EnrollDecision::Create
    }
}

/// Outcome of an enroll call
#[derive(Debug, Clone, PartialEq)]
pub enum EnrollResult {
    Enrolled(Enrollment),
    Skipped(EnrollDecision),
}

pub struct EnrollmentManager {
    store: Arc<dyn EngineStore>,
    leads: Arc<dyn LeadStore>,
    queue: RunQueue,
    bulk_concurrency: usize,
}

impl EnrollmentManager {
    pub fn new(store: Arc<dyn EngineStore>, leads: Arc<dyn LeadStore>, queue: RunQueue, bulk_concurrency: usize) -> Self {
        Self {
            store,
            leads,
            queue,
            bulk_concurrency: bulk_concurrency.max(1),
        }
    }

    async fn load_automation(&self, automation_id: Uuid) -> EngineResult<Automation> {
        self.store
            .get_automation(automation_id)
            .await?
            .filter(|a| a.deleted_at.is_none())
            .ok_or_else(|| EngineError::NotFound(format!("Automation {}", automation_id)))
    }

    /// Enroll a lead and queue the new run for execution
    pub async fn enroll(&self, automation_id: Uuid, lead_id: Uuid, mode: EnrollMode) -> EngineResult<EnrollResult> {
        self.enroll_with(automation_id, lead_id, mode, true).await
    }

    /// Enroll without queueing; the caller advances the run itself.
    pub(crate) async fn enroll_with(
        &self,
        automation_id: Uuid,
        lead_id: Uuid,
        mode: EnrollMode,
        dispatch: bool,
    ) -> EngineResult<EnrollResult> {
        // Active state is read per decision, never cached.
        let automation = self.load_automation(automation_id).await?;
        if !automation.accepts_enrollments() {
            return Err(EngineError::validation(
                "automation",
                &format!("automation '{}' is not active", automation.name),
            ));
        }

        let now = Utc::now();
        let guard = match mode {
            EnrollMode::Policy => EnrollmentGuard::triggered(automation.re_enrollment),
            EnrollMode::Forced => EnrollmentGuard::forced(),
        };
        let candidate = Enrollment::new(&automation, lead_id, now);

        match self.store.insert_enrollment_guarded(candidate, guard, now).await? {
            EnrollOutcome::Created(enrollment) => {
                info!(
                    enrollment_id = %enrollment.id,
                    automation_id = %automation.id,
                    lead_id = %lead_id,
                    version = enrollment.automation_version,
                    "Lead enrolled"
                );

                let entry = StepExecutionLog::new(&enrollment, &entry_step_id(&automation), "trigger", StepOutcome::Completed, now)
                    .with_detail(serde_json::json!({ "event": "enrolled", "mode": format!("{:?}", mode) }));
                self.store.append_log(&entry).await?;

                if dispatch {
                    self.queue.push(enrollment.id);
                }
                Ok(EnrollResult::Enrolled(enrollment))
            }
            EnrollOutcome::Skipped(decision) => {
                debug!(automation_id = %automation.id, lead_id = %lead_id, "Enrollment skipped: {}", decision.describe());
                Ok(EnrollResult::Skipped(decision))
            }
        }
    }

    /// Re-enroll many leads independently. One lead's failure never stops the others.
    pub async fn bulk_re_enroll(
        &self,
        automation_id: Uuid,
        lead_ids: Vec<Uuid>,
        remove_existing: bool,
    ) -> EngineResult<ReEnrollResult> {
        let automation = self.load_automation(automation_id).await?;
        if !automation.accepts_enrollments() {
            return Err(EngineError::validation(
                "automation",
                &format!("automation '{}' is not active", automation.name),
            ));
        }

        let outcomes: Vec<(Uuid, Result<(), String>)> = stream::iter(lead_ids)
            .map(|lead_id| async move {
                let outcome = self.re_enroll_one(automation_id, lead_id, remove_existing).await;
                (lead_id, outcome)
            })
            .buffer_unordered(self.bulk_concurrency)
            .collect()
            .await;

        let mut result = ReEnrollResult::default();
        for (lead_id, outcome) in outcomes {
            match outcome {
                Ok(()) => result.success += 1,
                Err(message) => {
                    result.failed += 1;
                    result.errors.push(ReEnrollError { lead_id, message });
                }
            }
        }

        info!(
            automation_id = %automation_id,
            success = result.success,
            failed = result.failed,
            "Bulk re-enrollment finished"
        );
        Ok(result)
    }

    async fn re_enroll_one(&self, automation_id: Uuid, lead_id: Uuid, remove_existing: bool) -> Result<(), String> {
        match self.leads.get_lead(lead_id).await {
            Ok(Some(_)) => {}
            Ok(None) => return Err("lead not found".to_string()),
            Err(e) => return Err(e.to_string()),
        }

        if remove_existing {
            let exited = self
                .store
                .exit_running(automation_id, Some(lead_id), ExitReason::ReEnrolled, Utc::now())
                .await
                .map_err(|e| e.to_string())?;
            self.log_exits(&exited, ExitReason::ReEnrolled).await;
        }

        match self.enroll(automation_id, lead_id, EnrollMode::Forced).await {
            Ok(EnrollResult::Enrolled(_)) | Ok(EnrollResult::Skipped(EnrollDecision::AlreadyRunning(_))) => Ok(()),
            Ok(EnrollResult::Skipped(decision)) => Err(decision.describe()),
            Err(e) => Err(e.to_string()),
        }
    }

    pub async fn toggle(&self, automation_id: Uuid, active: bool) -> EngineResult<Automation> {
        let status = if active { AutomationStatus::Active } else { AutomationStatus::Paused };
        let automation = self
            .store
            .set_active(automation_id, active, status, Utc::now())
            .await?
            .ok_or_else(|| EngineError::NotFound(format!("Automation {}", automation_id)))?;

        info!(automation_id = %automation_id, active, "Automation toggled");
        Ok(automation)
    }

    /// Soft-delete and exit every running enrollment. Returns how many runs were exited.
    pub async fn delete(&self, automation_id: Uuid) -> EngineResult<usize> {
        let now = Utc::now();
        if !self.store.soft_delete(automation_id, now).await? {
            return Err(EngineError::NotFound(format!("Automation {}", automation_id)));
        }

        let exited = self
            .store
            .exit_running(automation_id, None, ExitReason::AutomationDeleted, now)
            .await?;
        self.log_exits(&exited, ExitReason::AutomationDeleted).await;

        info!(automation_id = %automation_id, exited = exited.len(), "Automation deleted");
        Ok(exited.len())
    }

    /// Append an exit entry for each run a cascade terminated
    pub async fn log_exits(&self, exited: &[Enrollment], reason: ExitReason) {
        for enrollment in exited {
            let entry = StepExecutionLog::new(
                enrollment,
                enrollment.current_step_id.as_deref().unwrap_or("-"),
                "exit",
                StepOutcome::Skipped,
                enrollment.terminated_at.unwrap_or_else(Utc::now),
            )
            .with_detail(serde_json::json!({ "event": "exited", "reason": reason.as_str() }));

            if let Err(e) = self.store.append_log(&entry).await {
                warn!(enrollment_id = %enrollment.id, "Failed to log exit: {}", e);
            }
        }
    }
}

fn entry_step_id(automation: &Automation) -> String {
    automation
        .steps
        .entry()
        .map(|s| s.id.clone())
        .unwrap_or_else(|| "trigger".to_string())
}

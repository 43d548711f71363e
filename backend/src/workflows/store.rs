// Engine Store - Persistence seam for automations, enrollments and the step log

use async_trait::async_trait;
use cadence_shared::{AutomationFilter, AutomationStatus, EnrollmentStatus, ExitReason};
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::RwLock;
use uuid::Uuid;

use super::enrollment::{EnrollDecision, EnrollmentGuard};
use super::models::{Automation, AutomationVersion, Enrollment, StepExecutionLog};
use super::triggers::LeadEventType;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("Migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("Corrupt record: {0}")]
    Corrupt(String),
}

impl StoreError {
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::Database(sqlx::Error::PoolTimedOut | sqlx::Error::Io(_) | sqlx::Error::PoolClosed)
        )
    }
}

pub type StoreResult<T> = Result<T, StoreError>;

/// Result of a guarded enrollment insert
#[derive(Debug, Clone, PartialEq)]
pub enum EnrollOutcome {
    Created(Enrollment),
    Skipped(EnrollDecision),
}

#[async_trait]
pub trait AutomationStore: Send + Sync {
    /// Upsert the current row and record its version snapshot
    async fn save_automation(&self, automation: &Automation) -> StoreResult<()>;

    /// Includes soft-deleted rows; callers check `deleted_at`
    async fn get_automation(&self, id: Uuid) -> StoreResult<Option<Automation>>;

    async fn get_version(&self, id: Uuid, version: i32) -> StoreResult<Option<AutomationVersion>>;

    /// Non-deleted automations matching the filter, newest first
    async fn list_automations(&self, filter: &AutomationFilter) -> StoreResult<Vec<Automation>>;

    async fn set_active(
        &self,
        id: Uuid,
        active: bool,
        status: AutomationStatus,
        now: DateTime<Utc>,
    ) -> StoreResult<Option<Automation>>;

    /// Returns false when the automation does not exist or is already deleted
    async fn soft_delete(&self, id: Uuid, now: DateTime<Utc>) -> StoreResult<bool>;

    async fn active_automations_for(&self, event_type: LeadEventType) -> StoreResult<Vec<Automation>>;
}

#[async_trait]
pub trait EnrollmentStore: Send + Sync {
    /// Atomically consult the lead's history for this automation and insert
    /// `candidate` only if the guard allows it.
    async fn insert_enrollment_guarded(
        &self,
        candidate: Enrollment,
        guard: EnrollmentGuard,
        now: DateTime<Utc>,
    ) -> StoreResult<EnrollOutcome>;

    async fn get_enrollment(&self, id: Uuid) -> StoreResult<Option<Enrollment>>;

    async fn enrollments_for(&self, automation_id: Uuid) -> StoreResult<Vec<Enrollment>>;

    async fn enrollments_for_lead(&self, automation_id: Uuid, lead_id: Uuid) -> StoreResult<Vec<Enrollment>>;

    /// Compare-and-swap ownership. Succeeds only for a runnable enrollment whose
    /// claim is empty or older than `stale_before`.
    async fn claim(
        &self,
        id: Uuid,
        token: Uuid,
        now: DateTime<Utc>,
        stale_before: DateTime<Utc>,
    ) -> StoreResult<Option<Enrollment>>;

    /// Write the run's progress if `token` still owns it; `release` clears the claim.
    /// Returns false when ownership was lost.
    async fn update_claimed(&self, enrollment: &Enrollment, token: Uuid, release: bool) -> StoreResult<bool>;

    /// Ids of runs a worker should pick up: waiting runs whose `resumes_at` has
    /// passed, plus active runs left unclaimed (or with a stale claim) since before
    /// `stale_before`. Oldest first.
    async fn due_runnable(&self, now: DateTime<Utc>, stale_before: DateTime<Utc>, limit: usize) -> StoreResult<Vec<Uuid>>;

    /// Terminate every running enrollment of the automation (optionally for one lead),
    /// clearing claims. Returns the enrollments as they ended.
    async fn exit_running(
        &self,
        automation_id: Uuid,
        lead_id: Option<Uuid>,
        reason: ExitReason,
        now: DateTime<Utc>,
    ) -> StoreResult<Vec<Enrollment>>;
}

#[async_trait]
pub trait ExecutionLogStore: Send + Sync {
    async fn append_log(&self, entry: &StepExecutionLog) -> StoreResult<()>;

    async fn logs_for_enrollment(&self, enrollment_id: Uuid) -> StoreResult<Vec<StepExecutionLog>>;

    /// Newest first
    async fn recent_logs(&self, automation_id: Uuid, limit: usize) -> StoreResult<Vec<StepExecutionLog>>;

    async fn delete_logs_for_enrollment(&self, enrollment_id: Uuid) -> StoreResult<u64>;
}

/// Everything the engine persists
pub trait EngineStore: AutomationStore + EnrollmentStore + ExecutionLogStore {}

impl<T: AutomationStore + EnrollmentStore + ExecutionLogStore> EngineStore for T {}

pub(crate) fn matches_filter(automation: &Automation, filter: &AutomationFilter) -> bool {
    if automation.deleted_at.is_some() {
        return false;
    }
    if filter.status.is_some_and(|s| s != automation.status) {
        return false;
    }
    if filter.kind.is_some_and(|k| k != automation.kind) {
        return false;
    }
    if filter.active.is_some_and(|a| a != automation.is_active) {
        return false;
    }
    match filter.search.as_deref().map(str::trim).filter(|s| !s.is_empty()) {
        Some(term) => automation.name.to_lowercase().contains(&term.to_lowercase()),
        None => true,
    }
}

// ==================== In-memory store ====================

#[derive(Debug, Default)]
struct MemoryState {
    automations: HashMap<Uuid, Automation>,
    versions: HashMap<(Uuid, i32), AutomationVersion>,
    enrollments: HashMap<Uuid, Enrollment>,
    logs: Vec<StepExecutionLog>,
}

/// Single-lock store. Holding the write lock makes guarded inserts and claims atomic.
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    state: Arc<RwLock<MemoryState>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Shift every timestamp of a run into the past, as if `by` had elapsed.
    #[cfg(test)]
    pub async fn rewind(&self, enrollment_id: Uuid, by: chrono::Duration) {
        let mut state = self.state.write().await;
        let Some(run) = state.enrollments.get_mut(&enrollment_id) else { return };
        run.enrolled_at -= by;
        run.last_advanced_at = run.last_advanced_at.map(|t| t - by);
        run.resumes_at = run.resumes_at.map(|t| t - by);
        run.terminated_at = run.terminated_at.map(|t| t - by);
        run.claimed_at = run.claimed_at.map(|t| t - by);
        if let Some(wait) = run.wait_state.as_mut() {
            wait.started_at -= by;
            wait.deadline = wait.deadline.map(|t| t - by);
        }
    }
}

#[async_trait]
impl AutomationStore for MemoryStore {
    async fn save_automation(&self, automation: &Automation) -> StoreResult<()> {
        let mut state = self.state.write().await;
        state
            .versions
            .entry((automation.id, automation.version))
            .or_insert_with(|| automation.current_version());
        state.automations.insert(automation.id, automation.clone());
        Ok(())
    }

    async fn get_automation(&self, id: Uuid) -> StoreResult<Option<Automation>> {
        Ok(self.state.read().await.automations.get(&id).cloned())
    }

    async fn get_version(&self, id: Uuid, version: i32) -> StoreResult<Option<AutomationVersion>> {
        Ok(self.state.read().await.versions.get(&(id, version)).cloned())
    }

    async fn list_automations(&self, filter: &AutomationFilter) -> StoreResult<Vec<Automation>> {
        let state = self.state.read().await;
        let mut found: Vec<Automation> = state
            .automations
            .values()
            .filter(|a| matches_filter(a, filter))
            .cloned()
            .collect();
        found.sort_by(|a, b| b.created_at.cmp(&a.created_at).then_with(|| a.name.cmp(&b.name)));
        Ok(found)
    }

    async fn set_active(
        &self,
        id: Uuid,
        active: bool,
        status: AutomationStatus,
        now: DateTime<Utc>,
    ) -> StoreResult<Option<Automation>> {
        let mut state = self.state.write().await;
        let Some(automation) = state.automations.get_mut(&id).filter(|a| a.deleted_at.is_none()) else {
            return Ok(None);
        };
        automation.is_active = active;
        automation.status = status;
        automation.updated_at = now;
        Ok(Some(automation.clone()))
    }

    async fn soft_delete(&self, id: Uuid, now: DateTime<Utc>) -> StoreResult<bool> {
        let mut state = self.state.write().await;
        match state.automations.get_mut(&id) {
            Some(automation) if automation.deleted_at.is_none() => {
                automation.deleted_at = Some(now);
                automation.is_active = false;
                automation.status = AutomationStatus::Paused;
                automation.updated_at = now;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn active_automations_for(&self, event_type: LeadEventType) -> StoreResult<Vec<Automation>> {
        Ok(self
            .state
            .read()
            .await
            .automations
            .values()
            .filter(|a| a.accepts_enrollments() && a.trigger.event_type == event_type)
            .cloned()
            .collect())
    }
}

#[async_trait]
impl EnrollmentStore for MemoryStore {
    async fn insert_enrollment_guarded(
        &self,
        candidate: Enrollment,
        guard: EnrollmentGuard,
        now: DateTime<Utc>,
    ) -> StoreResult<EnrollOutcome> {
        let mut state = self.state.write().await;
        let history: Vec<&Enrollment> = state
            .enrollments
            .values()
            .filter(|e| e.automation_id == candidate.automation_id && e.lead_id == candidate.lead_id)
            .collect();

        match guard.decide(history, now) {
            EnrollDecision::Create => {
                state.enrollments.insert(candidate.id, candidate.clone());
                Ok(EnrollOutcome::Created(candidate))
            }
            skipped => Ok(EnrollOutcome::Skipped(skipped)),
        }
    }

    async fn get_enrollment(&self, id: Uuid) -> StoreResult<Option<Enrollment>> {
        Ok(self.state.read().await.enrollments.get(&id).cloned())
    }

    async fn enrollments_for(&self, automation_id: Uuid) -> StoreResult<Vec<Enrollment>> {
        let state = self.state.read().await;
        let mut found: Vec<Enrollment> = state
            .enrollments
            .values()
            .filter(|e| e.automation_id == automation_id)
            .cloned()
            .collect();
        found.sort_by(|a, b| b.enrolled_at.cmp(&a.enrolled_at));
        Ok(found)
    }

    async fn enrollments_for_lead(&self, automation_id: Uuid, lead_id: Uuid) -> StoreResult<Vec<Enrollment>> {
        let mut found: Vec<Enrollment> = self
            .state
            .read()
            .await
            .enrollments
            .values()
            .filter(|e| e.automation_id == automation_id && e.lead_id == lead_id)
            .cloned()
            .collect();
        found.sort_by(|a, b| b.enrolled_at.cmp(&a.enrolled_at));
        Ok(found)
    }

    async fn claim(
        &self,
        id: Uuid,
        token: Uuid,
        now: DateTime<Utc>,
        stale_before: DateTime<Utc>,
    ) -> StoreResult<Option<Enrollment>> {
        let mut state = self.state.write().await;
        match state.enrollments.get_mut(&id) {
            Some(enrollment) if enrollment.is_claimable(now, stale_before) => {
                enrollment.claim_token = Some(token);
                enrollment.claimed_at = Some(now);
                Ok(Some(enrollment.clone()))
            }
            _ => Ok(None),
        }
    }

    async fn update_claimed(&self, enrollment: &Enrollment, token: Uuid, release: bool) -> StoreResult<bool> {
        let mut state = self.state.write().await;
        let Some(stored) = state.enrollments.get_mut(&enrollment.id) else {
            return Ok(false);
        };
        if stored.claim_token != Some(token) {
            return Ok(false);
        }

        *stored = enrollment.clone();
        if release {
            stored.claim_token = None;
            stored.claimed_at = None;
        } else {
            stored.claim_token = Some(token);
        }
        Ok(true)
    }

    async fn due_runnable(&self, now: DateTime<Utc>, stale_before: DateTime<Utc>, limit: usize) -> StoreResult<Vec<Uuid>> {
        let state = self.state.read().await;
        let mut due: Vec<&Enrollment> = state
            .enrollments
            .values()
            .filter(|e| e.is_claimable(now, stale_before))
            .filter(|e| match e.status {
                EnrollmentStatus::Waiting => true,
                _ => e.last_advanced_at.unwrap_or(e.enrolled_at) < stale_before,
            })
            .collect();
        due.sort_by_key(|e| e.resumes_at.unwrap_or(e.enrolled_at));
        Ok(due.into_iter().take(limit).map(|e| e.id).collect())
    }

    async fn exit_running(
        &self,
        automation_id: Uuid,
        lead_id: Option<Uuid>,
        reason: ExitReason,
        now: DateTime<Utc>,
    ) -> StoreResult<Vec<Enrollment>> {
        let mut state = self.state.write().await;
        let mut exited = Vec::new();
        for enrollment in state.enrollments.values_mut() {
            let in_scope = enrollment.automation_id == automation_id
                && lead_id.is_none_or(|lead| enrollment.lead_id == lead)
                && enrollment.is_running();
            if in_scope {
                enrollment.terminate(reason, now);
                enrollment.claim_token = None;
                enrollment.claimed_at = None;
                exited.push(enrollment.clone());
            }
        }
        Ok(exited)
    }
}

#[async_trait]
impl ExecutionLogStore for MemoryStore {
    async fn append_log(&self, entry: &StepExecutionLog) -> StoreResult<()> {
        self.state.write().await.logs.push(entry.clone());
        Ok(())
    }

    async fn logs_for_enrollment(&self, enrollment_id: Uuid) -> StoreResult<Vec<StepExecutionLog>> {
        Ok(self
            .state
            .read()
            .await
            .logs
            .iter()
            .filter(|l| l.enrollment_id == enrollment_id)
            .cloned()
            .collect())
    }

    async fn recent_logs(&self, automation_id: Uuid, limit: usize) -> StoreResult<Vec<StepExecutionLog>> {
        Ok(self
            .state
            .read()
            .await
            .logs
            .iter()
            .rev()
            .filter(|l| l.automation_id == automation_id)
            .take(limit)
            .cloned()
            .collect())
    }

    async fn delete_logs_for_enrollment(&self, enrollment_id: Uuid) -> StoreResult<u64> {
        let mut state = self.state.write().await;
        let before = state.logs.len();
        state.logs.retain(|l| l.enrollment_id != enrollment_id);
        Ok((before - state.logs.len()) as u64)
    }
}

// PostgreSQL Store - sqlx implementation of the engine's persistence seam

use async_trait::async_trait;
use cadence_shared::{AutomationFilter, AutomationKind, AutomationStatus, EnrollmentStatus, ExitReason, StepOutcome};
use chrono::{DateTime, Utc};
use sqlx::types::Json;
use sqlx::{FromRow, PgPool};
use std::collections::BTreeMap;
use uuid::Uuid;

use super::enrollment::{EnrollDecision, EnrollmentGuard};
use super::models::{Automation, AutomationVersion, Enrollment, ReEnrollmentPolicy, StepExecutionLog, WaitState};
use super::steps::{StepGraph, StepId};
use super::store::{
    AutomationStore, EnrollOutcome, EnrollmentStore, ExecutionLogStore, StoreResult,
};
use super::triggers::{LeadEventType, TriggerSpec};

const AUTOMATION_COLUMNS: &str = r#"
    id, name, description, kind, trigger, steps, is_active, status,
    re_enrollment, version, created_at, updated_at, deleted_at
"#;

const ENROLLMENT_COLUMNS: &str = r#"
    id, automation_id, automation_version, lead_id, current_step_id, status,
    enrolled_at, last_advanced_at, resumes_at, terminated_at, exit_reason,
    variant_assignments, wait_state, claim_token, claimed_at, last_error
"#;

const LOG_COLUMNS: &str = r#"
    id, enrollment_id, automation_id, lead_id, step_id, step_kind,
    outcome, detail, error, created_at
"#;

#[derive(Debug, FromRow)]
struct AutomationRow {
    id: Uuid,
    name: String,
    description: Option<String>,
    kind: AutomationKind,
    trigger: Json<TriggerSpec>,
    steps: Json<StepGraph>,
    is_active: bool,
    status: AutomationStatus,
    re_enrollment: Json<ReEnrollmentPolicy>,
    version: i32,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
    deleted_at: Option<DateTime<Utc>>,
}

impl From<AutomationRow> for Automation {
    fn from(row: AutomationRow) -> Self {
        Self {
            id: row.id,
            name: row.name,
            description: row.description,
            kind: row.kind,
            trigger: row.trigger.0,
            steps: row.steps.0,
            is_active: row.is_active,
            status: row.status,
            re_enrollment: row.re_enrollment.0,
            version: row.version,
            created_at: row.created_at,
            updated_at: row.updated_at,
            deleted_at: row.deleted_at,
        }
    }
}

#[derive(Debug, FromRow)]
struct VersionRow {
    automation_id: Uuid,
    version: i32,
    trigger: Json<TriggerSpec>,
    steps: Json<StepGraph>,
    created_at: DateTime<Utc>,
}

#[derive(Debug, FromRow)]
struct EnrollmentRow {
    id: Uuid,
    automation_id: Uuid,
    automation_version: i32,
    lead_id: Uuid,
    current_step_id: Option<String>,
    status: EnrollmentStatus,
    enrolled_at: DateTime<Utc>,
    last_advanced_at: Option<DateTime<Utc>>,
    resumes_at: Option<DateTime<Utc>>,
    terminated_at: Option<DateTime<Utc>>,
    exit_reason: Option<ExitReason>,
    variant_assignments: Json<BTreeMap<StepId, String>>,
    wait_state: Option<Json<WaitState>>,
    claim_token: Option<Uuid>,
    claimed_at: Option<DateTime<Utc>>,
    last_error: Option<String>,
}

impl From<EnrollmentRow> for Enrollment {
    fn from(row: EnrollmentRow) -> Self {
        Self {
            id: row.id,
            automation_id: row.automation_id,
            automation_version: row.automation_version,
            lead_id: row.lead_id,
            current_step_id: row.current_step_id,
            status: row.status,
            enrolled_at: row.enrolled_at,
            last_advanced_at: row.last_advanced_at,
            resumes_at: row.resumes_at,
            terminated_at: row.terminated_at,
            exit_reason: row.exit_reason,
            variant_assignments: row.variant_assignments.0,
            wait_state: row.wait_state.map(|w| w.0),
            claim_token: row.claim_token,
            claimed_at: row.claimed_at,
            last_error: row.last_error,
        }
    }
}

#[derive(Debug, FromRow)]
struct LogRow {
    id: Uuid,
    enrollment_id: Uuid,
    automation_id: Uuid,
    lead_id: Uuid,
    step_id: String,
    step_kind: String,
    outcome: StepOutcome,
    detail: serde_json::Value,
    error: Option<String>,
    created_at: DateTime<Utc>,
}

impl From<LogRow> for StepExecutionLog {
    fn from(row: LogRow) -> Self {
        Self {
            id: row.id,
            enrollment_id: row.enrollment_id,
            automation_id: row.automation_id,
            lead_id: row.lead_id,
            step_id: row.step_id,
            step_kind: row.step_kind,
            outcome: row.outcome,
            detail: row.detail,
            error: row.error,
            created_at: row.created_at,
        }
    }
}

#[derive(Debug, Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl AutomationStore for PgStore {
    async fn save_automation(&self, automation: &Automation) -> StoreResult<()> {
        let mut tx = self.pool.begin().await?;

        sqlx::query(
            r#"
            INSERT INTO automations (
                id, name, description, kind, trigger_event, trigger, steps,
                is_active, status, re_enrollment, version, created_at, updated_at, deleted_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14)
            ON CONFLICT (id) DO UPDATE SET
                name = EXCLUDED.name,
                description = EXCLUDED.description,
                kind = EXCLUDED.kind,
                trigger_event = EXCLUDED.trigger_event,
                trigger = EXCLUDED.trigger,
                steps = EXCLUDED.steps,
                is_active = EXCLUDED.is_active,
                status = EXCLUDED.status,
                re_enrollment = EXCLUDED.re_enrollment,
                version = EXCLUDED.version,
                updated_at = EXCLUDED.updated_at,
                deleted_at = EXCLUDED.deleted_at
            "#,
        )
        .bind(automation.id)
        .bind(&automation.name)
        .bind(&automation.description)
        .bind(automation.kind)
        .bind(automation.trigger.event_type.as_str())
        .bind(Json(&automation.trigger))
        .bind(Json(&automation.steps))
        .bind(automation.is_active)
        .bind(automation.status)
        .bind(Json(&automation.re_enrollment))
        .bind(automation.version)
        .bind(automation.created_at)
        .bind(automation.updated_at)
        .bind(automation.deleted_at)
        .execute(&mut *tx)
        .await?;

        // Versions are immutable once written
        sqlx::query(
            r#"
            INSERT INTO automation_versions (automation_id, version, trigger, steps, created_at)
            VALUES ($1, $2, $3, $4, $5)
            ON CONFLICT (automation_id, version) DO NOTHING
            "#,
        )
        .bind(automation.id)
        .bind(automation.version)
        .bind(Json(&automation.trigger))
        .bind(Json(&automation.steps))
        .bind(automation.updated_at)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(())
    }

    async fn get_automation(&self, id: Uuid) -> StoreResult<Option<Automation>> {
        let row: Option<AutomationRow> =
            sqlx::query_as(&format!("SELECT {} FROM automations WHERE id = $1", AUTOMATION_COLUMNS))
                .bind(id)
                .fetch_optional(&self.pool)
                .await?;
        Ok(row.map(Automation::from))
    }

    async fn get_version(&self, id: Uuid, version: i32) -> StoreResult<Option<AutomationVersion>> {
        let row: Option<VersionRow> = sqlx::query_as(
            r#"
            SELECT automation_id, version, trigger, steps, created_at
            FROM automation_versions
            WHERE automation_id = $1 AND version = $2
            "#,
        )
        .bind(id)
        .bind(version)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(|r| AutomationVersion {
            automation_id: r.automation_id,
            version: r.version,
            trigger: r.trigger.0,
            steps: r.steps.0,
            created_at: r.created_at,
        }))
    }

    async fn list_automations(&self, filter: &AutomationFilter) -> StoreResult<Vec<Automation>> {
        let search = filter
            .search
            .as_deref()
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(|s| format!("%{}%", s));

        let rows: Vec<AutomationRow> = sqlx::query_as(&format!(
            r#"
            SELECT {}
            FROM automations
            WHERE deleted_at IS NULL
              AND ($1::automation_status IS NULL OR status = $1)
              AND ($2::automation_kind IS NULL OR kind = $2)
              AND ($3::boolean IS NULL OR is_active = $3)
              AND ($4::text IS NULL OR name ILIKE $4)
            ORDER BY created_at DESC, name ASC
            "#,
            AUTOMATION_COLUMNS
        ))
        .bind(filter.status)
        .bind(filter.kind)
        .bind(filter.active)
        .bind(search)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.into_iter().map(Automation::from).collect())
    }

    async fn set_active(
        &self,
        id: Uuid,
        active: bool,
        status: AutomationStatus,
        now: DateTime<Utc>,
    ) -> StoreResult<Option<Automation>> {
        let row: Option<AutomationRow> = sqlx::query_as(&format!(
            r#"
            UPDATE automations
            SET is_active = $2, status = $3, updated_at = $4
            WHERE id = $1 AND deleted_at IS NULL
            RETURNING {}
            "#,
            AUTOMATION_COLUMNS
        ))
        .bind(id)
        .bind(active)
        .bind(status)
        .bind(now)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(Automation::from))
    }

    async fn soft_delete(&self, id: Uuid, now: DateTime<Utc>) -> StoreResult<bool> {
        let result = sqlx::query(
            r#"
            UPDATE automations
            SET deleted_at = $2, is_active = false, status = 'paused', updated_at = $2
            WHERE id = $1 AND deleted_at IS NULL
            "#,
        )
        .bind(id)
        .bind(now)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn active_automations_for(&self, event_type: LeadEventType) -> StoreResult<Vec<Automation>> {
        let rows: Vec<AutomationRow> = sqlx::query_as(&format!(
            r#"
            SELECT {}
            FROM automations
            WHERE trigger_event = $1
              AND is_active = true
              AND status = 'active'
              AND deleted_at IS NULL
            "#,
            AUTOMATION_COLUMNS
        ))
        .bind(event_type.as_str())
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.into_iter().map(Automation::from).collect())
    }
}

#[async_trait]
impl EnrollmentStore for PgStore {
    async fn insert_enrollment_guarded(
        &self,
        candidate: Enrollment,
        guard: EnrollmentGuard,
        now: DateTime<Utc>,
    ) -> StoreResult<EnrollOutcome> {
        let mut tx = self.pool.begin().await?;

        // Serializes concurrent enrollment decisions for one (automation, lead) pair
        sqlx::query("SELECT pg_advisory_xact_lock(hashtext($1::text || ':' || $2::text))")
            .bind(candidate.automation_id)
            .bind(candidate.lead_id)
            .execute(&mut *tx)
            .await?;

        let history: Vec<EnrollmentRow> = sqlx::query_as(&format!(
            "SELECT {} FROM enrollments WHERE automation_id = $1 AND lead_id = $2",
            ENROLLMENT_COLUMNS
        ))
        .bind(candidate.automation_id)
        .bind(candidate.lead_id)
        .fetch_all(&mut *tx)
        .await?;
        let history: Vec<Enrollment> = history.into_iter().map(Enrollment::from).collect();

        match guard.decide(&history, now) {
            EnrollDecision::Create => {
                insert_enrollment(&mut tx, &candidate).await?;
                tx.commit().await?;
                Ok(EnrollOutcome::Created(candidate))
            }
            skipped => {
                tx.rollback().await?;
                Ok(EnrollOutcome::Skipped(skipped))
            }
        }
    }

    async fn get_enrollment(&self, id: Uuid) -> StoreResult<Option<Enrollment>> {
        let row: Option<EnrollmentRow> =
            sqlx::query_as(&format!("SELECT {} FROM enrollments WHERE id = $1", ENROLLMENT_COLUMNS))
                .bind(id)
                .fetch_optional(&self.pool)
                .await?;
        Ok(row.map(Enrollment::from))
    }

    async fn enrollments_for(&self, automation_id: Uuid) -> StoreResult<Vec<Enrollment>> {
        let rows: Vec<EnrollmentRow> = sqlx::query_as(&format!(
            "SELECT {} FROM enrollments WHERE automation_id = $1 ORDER BY enrolled_at DESC",
            ENROLLMENT_COLUMNS
        ))
        .bind(automation_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(Enrollment::from).collect())
    }

    async fn enrollments_for_lead(&self, automation_id: Uuid, lead_id: Uuid) -> StoreResult<Vec<Enrollment>> {
        let rows: Vec<EnrollmentRow> = sqlx::query_as(&format!(
            r#"
            SELECT {}
            FROM enrollments
            WHERE automation_id = $1 AND lead_id = $2
            ORDER BY enrolled_at DESC
            "#,
            ENROLLMENT_COLUMNS
        ))
        .bind(automation_id)
        .bind(lead_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(Enrollment::from).collect())
    }

    async fn claim(
        &self,
        id: Uuid,
        token: Uuid,
        now: DateTime<Utc>,
        stale_before: DateTime<Utc>,
    ) -> StoreResult<Option<Enrollment>> {
        let row: Option<EnrollmentRow> = sqlx::query_as(&format!(
            r#"
            UPDATE enrollments
            SET claim_token = $2, claimed_at = $3
            WHERE id = $1
              AND (status = 'active' OR (status = 'waiting' AND resumes_at <= $3))
              AND (claim_token IS NULL OR claimed_at IS NULL OR claimed_at < $4)
            RETURNING {}
            "#,
            ENROLLMENT_COLUMNS
        ))
        .bind(id)
        .bind(token)
        .bind(now)
        .bind(stale_before)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(Enrollment::from))
    }

    async fn update_claimed(&self, enrollment: &Enrollment, token: Uuid, release: bool) -> StoreResult<bool> {
        let result = sqlx::query(
            r#"
            UPDATE enrollments SET
                current_step_id = $3,
                status = $4,
                last_advanced_at = $5,
                resumes_at = $6,
                terminated_at = $7,
                exit_reason = $8,
                variant_assignments = $9,
                wait_state = $10,
                last_error = $11,
                claim_token = CASE WHEN $12 THEN NULL ELSE claim_token END,
                claimed_at = CASE WHEN $12 THEN NULL ELSE $13 END
            WHERE id = $1 AND claim_token = $2
            "#,
        )
        .bind(enrollment.id)
        .bind(token)
        .bind(&enrollment.current_step_id)
        .bind(enrollment.status)
        .bind(enrollment.last_advanced_at)
        .bind(enrollment.resumes_at)
        .bind(enrollment.terminated_at)
        .bind(enrollment.exit_reason)
        .bind(Json(&enrollment.variant_assignments))
        .bind(enrollment.wait_state.as_ref().map(Json))
        .bind(&enrollment.last_error)
        .bind(release)
        .bind(enrollment.claimed_at)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn due_runnable(&self, now: DateTime<Utc>, stale_before: DateTime<Utc>, limit: usize) -> StoreResult<Vec<Uuid>> {
        let ids: Vec<(Uuid,)> = sqlx::query_as(
            r#"
            SELECT id
            FROM enrollments
            WHERE (claim_token IS NULL OR claimed_at IS NULL OR claimed_at < $2)
              AND (
                    (status = 'waiting' AND resumes_at <= $1)
                 OR (status = 'active' AND COALESCE(last_advanced_at, enrolled_at) < $2)
              )
            ORDER BY COALESCE(resumes_at, enrolled_at) ASC
            LIMIT $3
            "#,
        )
        .bind(now)
        .bind(stale_before)
        .bind(i64::try_from(limit).unwrap_or(i64::MAX))
        .fetch_all(&self.pool)
        .await?;

        Ok(ids.into_iter().map(|(id,)| id).collect())
    }

    async fn exit_running(
        &self,
        automation_id: Uuid,
        lead_id: Option<Uuid>,
        reason: ExitReason,
        now: DateTime<Utc>,
    ) -> StoreResult<Vec<Enrollment>> {
        let rows: Vec<EnrollmentRow> = sqlx::query_as(&format!(
            r#"
            UPDATE enrollments
            SET status = $3,
                exit_reason = $4,
                terminated_at = $5,
                resumes_at = NULL,
                claim_token = NULL,
                claimed_at = NULL
            WHERE automation_id = $1
              AND ($2::uuid IS NULL OR lead_id = $2)
              AND status IN ('active', 'waiting')
            RETURNING {}
            "#,
            ENROLLMENT_COLUMNS
        ))
        .bind(automation_id)
        .bind(lead_id)
        .bind(reason.terminal_status())
        .bind(reason)
        .bind(now)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.into_iter().map(Enrollment::from).collect())
    }
}

async fn insert_enrollment(tx: &mut sqlx::Transaction<'_, sqlx::Postgres>, e: &Enrollment) -> StoreResult<()> {
    sqlx::query(
        r#"
        INSERT INTO enrollments (
            id, automation_id, automation_version, lead_id, current_step_id, status,
            enrolled_at, last_advanced_at, resumes_at, terminated_at, exit_reason,
            variant_assignments, wait_state, claim_token, claimed_at, last_error
        )
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16)
        "#,
    )
    .bind(e.id)
    .bind(e.automation_id)
    .bind(e.automation_version)
    .bind(e.lead_id)
    .bind(&e.current_step_id)
    .bind(e.status)
    .bind(e.enrolled_at)
    .bind(e.last_advanced_at)
    .bind(e.resumes_at)
    .bind(e.terminated_at)
    .bind(e.exit_reason)
    .bind(Json(&e.variant_assignments))
    .bind(e.wait_state.as_ref().map(Json))
    .bind(e.claim_token)
    .bind(e.claimed_at)
    .bind(&e.last_error)
    .execute(&mut **tx)
    .await?;
    Ok(())
}

#[async_trait]
impl ExecutionLogStore for PgStore {
    async fn append_log(&self, entry: &StepExecutionLog) -> StoreResult<()> {
        sqlx::query(
            r#"
            INSERT INTO step_execution_logs (
                id, enrollment_id, automation_id, lead_id, step_id, step_kind,
                outcome, detail, error, created_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
            "#,
        )
        .bind(entry.id)
        .bind(entry.enrollment_id)
        .bind(entry.automation_id)
        .bind(entry.lead_id)
        .bind(&entry.step_id)
        .bind(&entry.step_kind)
        .bind(entry.outcome)
        .bind(&entry.detail)
        .bind(&entry.error)
        .bind(entry.created_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn logs_for_enrollment(&self, enrollment_id: Uuid) -> StoreResult<Vec<StepExecutionLog>> {
        let rows: Vec<LogRow> = sqlx::query_as(&format!(
            "SELECT {} FROM step_execution_logs WHERE enrollment_id = $1 ORDER BY created_at ASC",
            LOG_COLUMNS
        ))
        .bind(enrollment_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(StepExecutionLog::from).collect())
    }

    async fn recent_logs(&self, automation_id: Uuid, limit: usize) -> StoreResult<Vec<StepExecutionLog>> {
        let rows: Vec<LogRow> = sqlx::query_as(&format!(
            r#"
            SELECT {}
            FROM step_execution_logs
            WHERE automation_id = $1
            ORDER BY created_at DESC
            LIMIT $2
            "#,
            LOG_COLUMNS
        ))
        .bind(automation_id)
        .bind(i64::try_from(limit).unwrap_or(i64::MAX))
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(StepExecutionLog::from).collect())
    }

    async fn delete_logs_for_enrollment(&self, enrollment_id: Uuid) -> StoreResult<u64> {
        let result = sqlx::query("DELETE FROM step_execution_logs WHERE enrollment_id = $1")
            .bind(enrollment_id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }
}

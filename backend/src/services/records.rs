// Record Services - Lead, task and list tables in PostgreSQL

use async_trait::async_trait;
use chrono::Utc;
use serde_json::Value;
use sqlx::PgPool;
use tracing::debug;
use uuid::Uuid;

use super::{
    CollaboratorError, CollaboratorResult, Lead, LeadStore, LeadUpdate, ListMembershipStore, NewCalendarEvent,
    NewTask, TaskService,
};

#[derive(Debug, Clone)]
pub struct PgLeadStore {
    pool: PgPool,
}

impl PgLeadStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl LeadStore for PgLeadStore {
    async fn get_lead(&self, lead_id: Uuid) -> CollaboratorResult<Option<Lead>> {
        let row: Option<(Uuid, Value)> = sqlx::query_as("SELECT id, attributes FROM leads WHERE id = $1")
            .bind(lead_id)
            .fetch_optional(&self.pool)
            .await?;

        Ok(row.map(|(id, attributes)| Lead::new(id, attributes)))
    }

    async fn update_lead(&self, lead_id: Uuid, update: &LeadUpdate) -> CollaboratorResult<Lead> {
        let mut tx = self.pool.begin().await?;

        // Row lock so concurrent steps on the same lead do not lose each other's changes
        let row: Option<(Value,)> = sqlx::query_as("SELECT attributes FROM leads WHERE id = $1 FOR UPDATE")
            .bind(lead_id)
            .fetch_optional(&mut *tx)
            .await?;
        let Some((mut attributes,)) = row else {
            return Err(CollaboratorError::LeadNotFound(lead_id));
        };

        update.apply_to(&mut attributes);

        sqlx::query("UPDATE leads SET attributes = $2, updated_at = $3 WHERE id = $1")
            .bind(lead_id)
            .bind(&attributes)
            .bind(Utc::now())
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;

        debug!(lead_id = %lead_id, "Lead updated");
        Ok(Lead::new(lead_id, attributes))
    }
}

#[derive(Debug, Clone)]
pub struct PgTaskService {
    pool: PgPool,
}

impl PgTaskService {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl TaskService for PgTaskService {
    async fn create_task(&self, task: &NewTask) -> CollaboratorResult<Uuid> {
        let id: (Uuid,) = sqlx::query_as(
            r#"
            INSERT INTO lead_tasks (
                id, lead_id, automation_id, kind, title, description,
                due_at, assignee, priority, channel
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
            RETURNING id
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(task.lead_id)
        .bind(task.automation_id)
        .bind(task.kind.as_str())
        .bind(&task.title)
        .bind(&task.description)
        .bind(task.due_at)
        .bind(&task.assignee)
        .bind(&task.priority)
        .bind(task.channel.map(|c| c.as_str()))
        .fetch_one(&self.pool)
        .await?;

        Ok(id.0)
    }

    async fn create_calendar_event(&self, event: &NewCalendarEvent) -> CollaboratorResult<Uuid> {
        if event.ends_at < event.starts_at {
            return Err(CollaboratorError::rejected("calendar", "event ends before it starts"));
        }

        let id: (Uuid,) = sqlx::query_as(
            r#"
            INSERT INTO calendar_events (
                id, lead_id, title, description, starts_at, ends_at, location, attendees
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            RETURNING id
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(event.lead_id)
        .bind(&event.title)
        .bind(&event.description)
        .bind(event.starts_at)
        .bind(event.ends_at)
        .bind(&event.location)
        .bind(&event.attendees)
        .fetch_one(&self.pool)
        .await?;

        Ok(id.0)
    }
}

#[derive(Debug, Clone)]
pub struct PgListStore {
    pool: PgPool,
}

impl PgListStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl ListMembershipStore for PgListStore {
    async fn add(&self, list_id: &str, lead_id: Uuid) -> CollaboratorResult<bool> {
        let result = sqlx::query(
            r#"
            INSERT INTO list_memberships (list_id, lead_id)
            VALUES ($1, $2)
            ON CONFLICT (list_id, lead_id) DO NOTHING
            "#,
        )
        .bind(list_id)
        .bind(lead_id)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn remove(&self, list_id: &str, lead_id: Uuid) -> CollaboratorResult<bool> {
        let result = sqlx::query("DELETE FROM list_memberships WHERE list_id = $1 AND lead_id = $2")
            .bind(list_id)
            .bind(lead_id)
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn members(&self, list_id: &str) -> CollaboratorResult<Vec<Uuid>> {
        let rows: Vec<(Uuid,)> =
            sqlx::query_as("SELECT lead_id FROM list_memberships WHERE list_id = $1 ORDER BY added_at ASC")
                .bind(list_id)
                .fetch_all(&self.pool)
                .await?;

        Ok(rows.into_iter().map(|(id,)| id).collect())
    }
}

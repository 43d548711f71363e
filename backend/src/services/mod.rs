// Collaborator Services - Interfaces the engine drives and their adapters
//
// The engine treats message delivery, lead records, tasks, webhooks and list
// membership as opaque collaborators. Each has a production adapter and an
// in-memory implementation used in development and tests.

pub mod email;
pub mod memory;
pub mod messaging;
pub mod records;
pub mod webhook;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::sync::Arc;
use thiserror::Error;
use uuid::Uuid;

use crate::workflows::steps::{HttpMethod, MessageChannel};

pub use email::SmtpSender;
pub use memory::{MemoryLeadStore, MemoryListStore, MemoryTaskService};
#[cfg(test)]
pub use memory::RecordingSender;
pub use messaging::{ChannelRouter, LoggingSender};
pub use records::{PgLeadStore, PgListStore, PgTaskService};
pub use webhook::ReqwestHttpCaller;

#[derive(Error, Debug)]
pub enum CollaboratorError {
    #[error("{service} unavailable: {message}")]
    Unavailable { service: &'static str, message: String },
    #[error("{service} rejected the request: {message}")]
    Rejected { service: &'static str, message: String },
    #[error("Lead {0} not found")]
    LeadNotFound(Uuid),
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),
}

impl CollaboratorError {
    pub fn unavailable(service: &'static str, message: impl Into<String>) -> Self {
        Self::Unavailable { service, message: message.into() }
    }

    pub fn rejected(service: &'static str, message: impl Into<String>) -> Self {
        Self::Rejected { service, message: message.into() }
    }

    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Unavailable { .. } | Self::Database(_))
    }
}

pub type CollaboratorResult<T> = Result<T, CollaboratorError>;

// ==================== Leads ====================

/// A lead record as the engine sees it: an id plus free-form attributes
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Lead {
    pub id: Uuid,
    pub attributes: Value,
}

impl Lead {
    pub fn new(id: Uuid, attributes: Value) -> Self {
        let attributes = if attributes.is_object() { attributes } else { Value::Object(Map::new()) };
        Self { id, attributes }
    }

    pub fn get(&self, path: &str) -> Option<&Value> {
        crate::workflows::conditions::lookup(&self.attributes, path)
    }

    pub fn str_field(&self, path: &str) -> Option<&str> {
        self.get(path).and_then(Value::as_str)
    }

    /// Default address for a channel
    pub fn address_for(&self, channel: MessageChannel) -> Option<String> {
        match channel {
            MessageChannel::Email => self.str_field("email").map(str::to_string),
            MessageChannel::Sms | MessageChannel::Whatsapp => self.str_field("phone").map(str::to_string),
            MessageChannel::Notification => Some(
                self.str_field("advisor")
                    .map(str::to_string)
                    .unwrap_or_else(|| self.id.to_string()),
            ),
        }
    }

    /// Attributes plus the lead id, as seen by conditions and templates
    pub fn snapshot(&self) -> Value {
        let mut snapshot = self.attributes.clone();
        if let Value::Object(map) = &mut snapshot {
            map.entry("id").or_insert_with(|| Value::String(self.id.to_string()));
        }
        snapshot
    }

    /// Snapshot with the triggering event's payload under `event`
    pub fn snapshot_with_event(&self, payload: &Value) -> Value {
        let mut snapshot = self.snapshot();
        if let Value::Object(map) = &mut snapshot {
            map.insert("event".to_string(), payload.clone());
        }
        snapshot
    }
}

/// Changes a step applies to a lead record
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LeadUpdate {
    #[serde(default)]
    pub fields: Map<String, Value>,
    #[serde(default)]
    pub add_tags: Vec<String>,
    #[serde(default)]
    pub remove_tags: Vec<String>,
    #[serde(default)]
    pub score_delta: Option<i64>,
    #[serde(default)]
    pub stage: Option<String>,
    #[serde(default)]
    pub advisor: Option<String>,
    #[serde(default)]
    pub status: Option<String>,
}

impl LeadUpdate {
    pub fn status(status: &str) -> Self {
        Self { status: Some(status.to_string()), ..Default::default() }
    }

    pub fn stage(stage: &str) -> Self {
        Self { stage: Some(stage.to_string()), ..Default::default() }
    }

    pub fn advisor(advisor: &str) -> Self {
        Self { advisor: Some(advisor.to_string()), ..Default::default() }
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
            && self.add_tags.is_empty()
            && self.remove_tags.is_empty()
            && self.score_delta.is_none()
            && self.stage.is_none()
            && self.advisor.is_none()
            && self.status.is_none()
    }

    /// Apply onto a JSON attribute object. Tags stay unique; score starts at 0.
    pub fn apply_to(&self, attributes: &mut Value) {
        if !attributes.is_object() {
            *attributes = Value::Object(Map::new());
        }
        let Some(map) = attributes.as_object_mut() else { return };

        for (key, value) in &self.fields {
            map.insert(key.clone(), value.clone());
        }
        if let Some(stage) = &self.stage {
            map.insert("stage".to_string(), Value::String(stage.clone()));
        }
        if let Some(advisor) = &self.advisor {
            map.insert("advisor".to_string(), Value::String(advisor.clone()));
        }
        if let Some(status) = &self.status {
            map.insert("status".to_string(), Value::String(status.clone()));
        }
        if let Some(delta) = self.score_delta {
            let current = map.get("score").and_then(Value::as_i64).unwrap_or(0);
            map.insert("score".to_string(), Value::from(current.saturating_add(delta)));
        }

        if !self.add_tags.is_empty() || !self.remove_tags.is_empty() {
            let mut tags: Vec<String> = map
                .get("tags")
                .and_then(Value::as_array)
                .map(|items| items.iter().filter_map(|t| t.as_str().map(str::to_string)).collect())
                .unwrap_or_default();
            for tag in &self.add_tags {
                if !tags.iter().any(|t| t.eq_ignore_ascii_case(tag)) {
                    tags.push(tag.clone());
                }
            }
            tags.retain(|t| !self.remove_tags.iter().any(|r| r.eq_ignore_ascii_case(t)));
            map.insert("tags".to_string(), Value::from(tags));
        }
    }
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait LeadStore: Send + Sync {
    async fn get_lead(&self, lead_id: Uuid) -> CollaboratorResult<Option<Lead>>;

    /// Apply `update` and return the lead as stored afterwards
    async fn update_lead(&self, lead_id: Uuid, update: &LeadUpdate) -> CollaboratorResult<Lead>;
}

// ==================== Messaging ====================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutboundMessage {
    pub lead_id: Uuid,
    pub channel: MessageChannel,
    pub to: String,
    pub subject: Option<String>,
    pub body: Option<String>,
    pub template_id: Option<String>,
    pub variables: BTreeMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeliveryReceipt {
    pub provider_message_id: String,
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait MessageSender: Send + Sync {
    async fn send(&self, message: &OutboundMessage) -> CollaboratorResult<DeliveryReceipt>;
}

// ==================== Tasks & calendar ====================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskKind {
    Task,
    Followup,
}

impl TaskKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Task => "task",
            Self::Followup => "followup",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewTask {
    pub lead_id: Uuid,
    pub automation_id: Option<Uuid>,
    pub kind: TaskKind,
    pub title: String,
    pub description: Option<String>,
    pub due_at: Option<DateTime<Utc>>,
    pub assignee: Option<String>,
    pub priority: Option<String>,
    pub channel: Option<MessageChannel>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewCalendarEvent {
    pub lead_id: Uuid,
    pub title: String,
    pub description: Option<String>,
    pub starts_at: DateTime<Utc>,
    pub ends_at: DateTime<Utc>,
    pub location: Option<String>,
    pub attendees: Vec<String>,
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait TaskService: Send + Sync {
    async fn create_task(&self, task: &NewTask) -> CollaboratorResult<Uuid>;

    async fn create_calendar_event(&self, event: &NewCalendarEvent) -> CollaboratorResult<Uuid>;
}

// ==================== Webhooks ====================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HttpRequest {
    pub method: HttpMethod,
    pub url: String,
    pub headers: BTreeMap<String, String>,
    pub body: Option<Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HttpResponse {
    pub status: u16,
    pub body: Option<Value>,
}

/// Non-2xx responses come back as errors: 5xx and transport failures as
/// `Unavailable`, 4xx as `Rejected`.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait HttpCaller: Send + Sync {
    async fn call(&self, request: &HttpRequest) -> CollaboratorResult<HttpResponse>;
}

// ==================== Lists ====================

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ListMembershipStore: Send + Sync {
    /// Returns false when the lead was already a member
    async fn add(&self, list_id: &str, lead_id: Uuid) -> CollaboratorResult<bool>;

    /// Returns false when the lead was not a member
    async fn remove(&self, list_id: &str, lead_id: Uuid) -> CollaboratorResult<bool>;

    async fn members(&self, list_id: &str) -> CollaboratorResult<Vec<Uuid>>;
}

/// Everything the executor calls out to
#[derive(Clone)]
pub struct Collaborators {
    pub messages: Arc<dyn MessageSender>,
    pub leads: Arc<dyn LeadStore>,
    pub tasks: Arc<dyn TaskService>,
    pub http: Arc<dyn HttpCaller>,
    pub lists: Arc<dyn ListMembershipStore>,
}

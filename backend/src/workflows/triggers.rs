// Workflow Triggers - Lead events and the eligibility check that gates enrollment

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use tracing::{debug, warn};
use uuid::Uuid;

use super::conditions::{try_evaluate_groups, ConditionGroup, LogicMode};
use super::error::EngineError;
use crate::services::Lead;

/// Lead events an automation can be triggered by
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum LeadEventType {
    // Record lifecycle
    LeadCreated,
    LeadUpdated,
    StatusChanged,
    StageChanged,

    // Tagging and segments
    TagAdded,
    TagRemoved,
    ListJoined,

    // Submissions
    FormSubmitted,
    ApplicationSubmitted,
    DocumentUploaded,

    // Time based
    DateReached,

    // Operator initiated
    Manual,
}

impl LeadEventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::LeadCreated => "lead_created",
            Self::LeadUpdated => "lead_updated",
            Self::StatusChanged => "status_changed",
            Self::StageChanged => "stage_changed",
            Self::TagAdded => "tag_added",
            Self::TagRemoved => "tag_removed",
            Self::ListJoined => "list_joined",
            Self::FormSubmitted => "form_submitted",
            Self::ApplicationSubmitted => "application_submitted",
            Self::DocumentUploaded => "document_uploaded",
            Self::DateReached => "date_reached",
            Self::Manual => "manual",
        }
    }
}

/// Where an event came from
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum EventSource {
    #[default]
    System,
    User(Uuid),
    Api,
    Form,
    Scheduler,
    Integration(String),
}

/// A lead event that may enroll the lead into automations
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TriggerEvent {
    #[serde(default = "Uuid::new_v4")]
    pub event_id: Uuid,
    pub event_type: LeadEventType,
    pub lead_id: Uuid,
    #[serde(default)]
    pub payload: Value,
    #[serde(default)]
    pub source: EventSource,
    #[serde(default = "Utc::now")]
    pub occurred_at: DateTime<Utc>,
    #[serde(default)]
    pub correlation_id: Option<Uuid>,
}

impl TriggerEvent {
    pub fn new(event_type: LeadEventType, lead_id: Uuid, payload: Value, source: EventSource) -> Self {
        Self {
            event_id: Uuid::new_v4(),
            event_type,
            lead_id,
            payload,
            source,
            occurred_at: Utc::now(),
            correlation_id: None,
        }
    }

    pub fn lead_created(lead_id: Uuid, source: EventSource) -> Self {
        Self::new(LeadEventType::LeadCreated, lead_id, Value::Null, source)
    }

    pub fn status_changed(lead_id: Uuid, old_status: &str, new_status: &str, changed_by: Option<Uuid>) -> Self {
        Self::new(
            LeadEventType::StatusChanged,
            lead_id,
            serde_json::json!({
                "old_status": old_status,
                "new_status": new_status,
            }),
            changed_by.map(EventSource::User).unwrap_or_default(),
        )
    }

    pub fn stage_changed(lead_id: Uuid, old_stage: &str, new_stage: &str) -> Self {
        Self::new(
            LeadEventType::StageChanged,
            lead_id,
            serde_json::json!({
                "old_stage": old_stage,
                "new_stage": new_stage,
            }),
            EventSource::System,
        )
    }

    pub fn tag_added(lead_id: Uuid, tag: &str) -> Self {
        Self::new(LeadEventType::TagAdded, lead_id, serde_json::json!({ "tag": tag }), EventSource::System)
    }

    pub fn form_submitted(lead_id: Uuid, form_id: &str, answers: Value) -> Self {
        Self::new(
            LeadEventType::FormSubmitted,
            lead_id,
            serde_json::json!({
                "form_id": form_id,
                "answers": answers,
            }),
            EventSource::Form,
        )
    }

    pub fn application_submitted(lead_id: Uuid, program: &str) -> Self {
        Self::new(
            LeadEventType::ApplicationSubmitted,
            lead_id,
            serde_json::json!({ "program": program }),
            EventSource::Form,
        )
    }

    pub fn manual(lead_id: Uuid, requested_by: Option<Uuid>) -> Self {
        Self::new(
            LeadEventType::Manual,
            lead_id,
            Value::Null,
            requested_by.map(EventSource::User).unwrap_or(EventSource::Api),
        )
    }

    pub fn with_correlation_id(mut self, correlation_id: Uuid) -> Self {
        self.correlation_id = Some(correlation_id);
        self
    }
}

/// Entry condition of an automation
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TriggerSpec {
    pub event_type: LeadEventType,
    #[serde(default)]
    pub groups: Vec<ConditionGroup>,
    #[serde(default)]
    pub mode: LogicMode,
    /// Exact key/value matches against the event payload, checked before conditions.
    #[serde(default)]
    pub payload_filter: BTreeMap<String, Value>,
}

impl TriggerSpec {
    pub fn on(event_type: LeadEventType) -> Self {
        Self {
            event_type,
            groups: Vec::new(),
            mode: LogicMode::And,
            payload_filter: BTreeMap::new(),
        }
    }

    pub fn when(mut self, groups: Vec<ConditionGroup>, mode: LogicMode) -> Self {
        self.groups = groups;
        self.mode = mode;
        self
    }

    pub fn with_payload(mut self, key: &str, value: Value) -> Self {
        self.payload_filter.insert(key.to_string(), value);
        self
    }
}

/// Decides whether an event makes a lead eligible for an automation.
///
/// Stateless; the engine calls it concurrently for many events.
pub struct TriggerEvaluator;

impl TriggerEvaluator {
    pub fn try_evaluate(
        trigger: &TriggerSpec,
        event: &TriggerEvent,
        lead: &Lead,
        now: DateTime<Utc>,
    ) -> Result<bool, EngineError> {
        if trigger.event_type != event.event_type {
            return Ok(false);
        }

        let payload_matches = trigger
            .payload_filter
            .iter()
            .all(|(key, expected)| event.payload.get(key) == Some(expected));
        if !payload_matches {
            debug!(event_id = %event.event_id, "Payload filter rejected event");
            return Ok(false);
        }

        let snapshot = lead.snapshot_with_event(&event.payload);
        try_evaluate_groups(&trigger.groups, trigger.mode, &snapshot, now)
            .map_err(|e| EngineError::TriggerEvaluation(e.to_string()))
    }

    /// Infallible form: evaluation errors are logged and count as non-match.
    pub fn evaluate(trigger: &TriggerSpec, event: &TriggerEvent, lead: &Lead, now: DateTime<Utc>) -> bool {
        match Self::try_evaluate(trigger, event, lead, now) {
            Ok(matched) => matched,
            Err(e) => {
                warn!(
                    event_id = %event.event_id,
                    lead_id = %lead.id,
                    error = %e,
                    "Trigger evaluation failed, treating as non-match"
                );
                false
            }
        }
    }
}

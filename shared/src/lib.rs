//! Types shared between the automation engine and the product surfaces that call it.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use uuid::Uuid;

#[cfg_attr(feature = "sqlx", derive(sqlx::Type))]
#[cfg_attr(feature = "sqlx", sqlx(type_name = "automation_status", rename_all = "snake_case"))]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AutomationStatus {
    #[default]
    Draft,
    Active,
    Paused,
}

#[cfg_attr(feature = "sqlx", derive(sqlx::Type))]
#[cfg_attr(feature = "sqlx", sqlx(type_name = "automation_kind", rename_all = "snake_case"))]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AutomationKind {
    #[default]
    Sequence,
    Workflow,
}

#[cfg_attr(feature = "sqlx", derive(sqlx::Type))]
#[cfg_attr(feature = "sqlx", sqlx(type_name = "enrollment_status", rename_all = "snake_case"))]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EnrollmentStatus {
    Active,
    Waiting,
    Completed,
    Exited,
    Failed,
}

impl EnrollmentStatus {
    /// Active or waiting: the run still owns the lead's slot in the automation.
    pub fn is_running(&self) -> bool {
        matches!(self, Self::Active | Self::Waiting)
    }

    pub fn is_terminal(&self) -> bool {
        !self.is_running()
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Waiting => "waiting",
            Self::Completed => "completed",
            Self::Exited => "exited",
            Self::Failed => "failed",
        }
    }
}

/// Why a run stopped. Terminal steps carry one of these as their configured reason.
#[cfg_attr(feature = "sqlx", derive(sqlx::Type))]
#[cfg_attr(feature = "sqlx", sqlx(type_name = "exit_reason", rename_all = "snake_case"))]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExitReason {
    Completed,
    GoalAchieved,
    Unsubscribed,
    Disqualified,
    Transferred,
    ReEnrolled,
    AutomationDeleted,
    Manual,
}

impl ExitReason {
    /// Status an enrollment ends in when it stops for this reason.
    pub fn terminal_status(&self) -> EnrollmentStatus {
        match self {
            Self::Completed | Self::GoalAchieved => EnrollmentStatus::Completed,
            _ => EnrollmentStatus::Exited,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Completed => "completed",
            Self::GoalAchieved => "goal_achieved",
            Self::Unsubscribed => "unsubscribed",
            Self::Disqualified => "disqualified",
            Self::Transferred => "transferred",
            Self::ReEnrolled => "re_enrolled",
            Self::AutomationDeleted => "automation_deleted",
            Self::Manual => "manual",
        }
    }
}

#[cfg_attr(feature = "sqlx", derive(sqlx::Type))]
#[cfg_attr(feature = "sqlx", sqlx(type_name = "step_outcome", rename_all = "snake_case"))]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepOutcome {
    Completed,
    Failed,
    Skipped,
}

// ==================== Listing ====================

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AutomationFilter {
    pub status: Option<AutomationStatus>,
    pub kind: Option<AutomationKind>,
    pub active: Option<bool>,
    /// Case-insensitive substring match on the name.
    pub search: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct AutomationStats {
    pub total_enrollments: u64,
    pub active_enrollments: u64,
    pub completed_enrollments: u64,
    pub completion_rate: Decimal,
}

// ==================== Analytics ====================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EnrolledLead {
    pub lead_id: Uuid,
    pub enrollment_id: Uuid,
    pub status: EnrollmentStatus,
    pub current_step_id: Option<String>,
    pub enrolled_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActivityEntry {
    pub enrollment_id: Uuid,
    pub lead_id: Uuid,
    pub step_id: String,
    pub step_kind: String,
    pub outcome: StepOutcome,
    pub error: Option<String>,
    pub occurred_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AutomationAnalytics {
    pub automation_id: Uuid,
    pub total_enrollments: u64,
    pub active_enrollments: u64,
    pub completed_enrollments: u64,
    pub exited_enrollments: u64,
    pub failed_enrollments: u64,
    pub completion_rate: Decimal,
    pub step_distribution: BTreeMap<String, u64>,
    pub enrolled_leads: Vec<EnrolledLead>,
    pub recent_activity: Vec<ActivityEntry>,
}

/// Percentage of runs that completed, rounded to two decimal places.
pub fn completion_rate(completed: u64, total: u64) -> Decimal {
    if total == 0 {
        return Decimal::ZERO;
    }
    (Decimal::from(completed) * Decimal::ONE_HUNDRED / Decimal::from(total)).round_dp(2)
}

// ==================== Requests ====================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToggleAutomationRequest {
    pub active: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecuteAutomationRequest {
    pub lead_id: Uuid,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecuteAutomationResponse {
    pub enrollment_id: Option<Uuid>,
    pub status: Option<EnrollmentStatus>,
    pub message: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReEnrollRequest {
    pub lead_ids: Vec<Uuid>,
    #[serde(default)]
    pub remove_existing: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ReEnrollError {
    pub lead_id: Uuid,
    pub message: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ReEnrollResult {
    pub success: u32,
    pub failed: u32,
    pub errors: Vec<ReEnrollError>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventAccepted {
    pub event_id: Uuid,
    pub accepted: bool,
}

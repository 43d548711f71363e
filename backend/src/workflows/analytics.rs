// Analytics - Read-only aggregates over enrollments and execution logs

use cadence_shared::{
    completion_rate, ActivityEntry, AutomationAnalytics, AutomationStats, EnrolledLead, EnrollmentStatus,
};
use std::collections::BTreeMap;
use std::sync::Arc;
use uuid::Uuid;

use super::error::{EngineError, EngineResult};
use super::models::{Enrollment, StepExecutionLog};
use super::store::EngineStore;

pub struct AnalyticsAggregator {
    store: Arc<dyn EngineStore>,
    recent_activity_limit: usize,
}

impl AnalyticsAggregator {
    pub fn new(store: Arc<dyn EngineStore>, recent_activity_limit: usize) -> Self {
        Self {
            store,
            recent_activity_limit,
        }
    }

    /// Computed on every call from committed state; nothing is cached.
    pub async fn get_analytics(&self, automation_id: Uuid) -> EngineResult<AutomationAnalytics> {
        let exists = self
            .store
            .get_automation(automation_id)
            .await?
            .is_some_and(|a| a.deleted_at.is_none());
        if !exists {
            return Err(EngineError::NotFound(format!("Automation {}", automation_id)));
        }

        let enrollments = self.store.enrollments_for(automation_id).await?;
        let recent = self
            .store
            .recent_logs(automation_id, self.recent_activity_limit)
            .await?;

        Ok(aggregate(automation_id, &enrollments, &recent))
    }
}

pub fn aggregate(automation_id: Uuid, enrollments: &[Enrollment], recent: &[StepExecutionLog]) -> AutomationAnalytics {
    let count = |status: EnrollmentStatus| enrollments.iter().filter(|e| e.status == status).count() as u64;

    let total = enrollments.len() as u64;
    let completed = count(EnrollmentStatus::Completed);

    let mut step_distribution = BTreeMap::new();
    for enrollment in enrollments.iter().filter(|e| e.is_running()) {
        if let Some(step_id) = &enrollment.current_step_id {
            *step_distribution.entry(step_id.clone()).or_insert(0u64) += 1;
        }
    }

    AutomationAnalytics {
        automation_id,
        total_enrollments: total,
        active_enrollments: count(EnrollmentStatus::Active) + count(EnrollmentStatus::Waiting),
        completed_enrollments: completed,
        exited_enrollments: count(EnrollmentStatus::Exited),
        failed_enrollments: count(EnrollmentStatus::Failed),
        completion_rate: completion_rate(completed, total),
        step_distribution,
        enrolled_leads: enrollments
            .iter()
            .map(|e| EnrolledLead {
                lead_id: e.lead_id,
                enrollment_id: e.id,
                status: e.status,
                current_step_id: e.current_step_id.clone(),
                enrolled_at: e.enrolled_at,
            })
            .collect(),
        recent_activity: recent
            .iter()
            .map(|log| ActivityEntry {
                enrollment_id: log.enrollment_id,
                lead_id: log.lead_id,
                step_id: log.step_id.clone(),
                step_kind: log.step_kind.clone(),
                outcome: log.outcome,
                error: log.error.clone(),
                occurred_at: log.created_at,
            })
            .collect(),
    }
}

/// Headline numbers shown next to each automation in listings
pub fn summarize(enrollments: &[Enrollment]) -> AutomationStats {
    let total = enrollments.len() as u64;
    let active = enrollments.iter().filter(|e| e.is_running()).count() as u64;
    let completed = enrollments
        .iter()
        .filter(|e| e.status == EnrollmentStatus::Completed)
        .count() as u64;

    AutomationStats {
        total_enrollments: total,
        active_enrollments: active,
        completed_enrollments: completed,
        completion_rate: completion_rate(completed, total),
    }
}

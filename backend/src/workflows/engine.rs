// Workflow Engine - Facade over enrollment, execution and analytics

use cadence_shared::{
    AutomationAnalytics, AutomationFilter, AutomationStats, AutomationStatus, ExecuteAutomationResponse,
    ReEnrollResult,
};
use chrono::Utc;
use futures::future::join_all;
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::{mpsc, Semaphore};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::analytics::{summarize, AnalyticsAggregator};
use super::enrollment::{EnrollMode, EnrollResult, EnrollmentManager};
use super::error::{EngineError, EngineResult};
use super::executor::{AdvanceOutcome, StepExecutor};
use super::models::{Automation, AutomationDraft};
use super::queue::RunQueue;
use super::store::EngineStore;
use super::triggers::{TriggerEvaluator, TriggerEvent};
use crate::config::EngineConfig;
use crate::services::Collaborators;

/// An automation as listed, with its headline numbers
#[derive(Debug, Clone, Serialize)]
pub struct AutomationSummary {
    #[serde(flatten)]
    pub automation: Automation,
    pub stats: AutomationStats,
}

pub struct AutomationEngine {
    store: Arc<dyn EngineStore>,
    collaborators: Collaborators,
    enrollments: Arc<EnrollmentManager>,
    executor: Arc<StepExecutor>,
    analytics: AnalyticsAggregator,
    config: EngineConfig,
}

impl AutomationEngine {
    /// Build the engine. The receiver is the run queue; hand it to
    /// [`AutomationEngine::spawn_worker`] (or drain it manually in tests).
    pub fn new(
        store: Arc<dyn EngineStore>,
        collaborators: Collaborators,
        config: EngineConfig,
    ) -> (Arc<Self>, mpsc::UnboundedReceiver<Uuid>) {
        let (queue, rx) = RunQueue::channel();
        let enrollments = Arc::new(EnrollmentManager::new(
            store.clone(),
            collaborators.leads.clone(),
            queue,
            config.bulk_reenroll_concurrency,
        ));
        let executor = Arc::new(StepExecutor::new(
            store.clone(),
            collaborators.clone(),
            enrollments.clone(),
            config.executor_settings(),
        ));
        let analytics = AnalyticsAggregator::new(store.clone(), config.recent_activity_limit);

        let engine = Arc::new(Self {
            store,
            collaborators,
            enrollments,
            executor,
            analytics,
            config,
        });
        (engine, rx)
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Consume the run queue, advancing up to `max_concurrent_advances` runs at once.
    pub fn spawn_worker(self: &Arc<Self>, mut rx: mpsc::UnboundedReceiver<Uuid>) -> JoinHandle<()> {
        let engine = self.clone();
        let permits = Arc::new(Semaphore::new(engine.config.max_concurrent_advances));

        tokio::spawn(async move {
            info!("Run queue worker started");
            while let Some(enrollment_id) = rx.recv().await {
                let Ok(permit) = permits.clone().acquire_owned().await else {
                    break;
                };
                let executor = engine.executor.clone();
                tokio::spawn(async move {
                    if let Err(e) = executor.advance(enrollment_id).await {
                        error!(enrollment_id = %enrollment_id, "Queued advance failed: {}", e);
                    }
                    drop(permit);
                });
            }
            info!("Run queue worker stopped");
        })
    }

    /// Advance every queued run in order until the queue is empty.
    pub async fn drain_queue(&self, rx: &mut mpsc::UnboundedReceiver<Uuid>) -> usize {
        let mut advanced = 0;
        while let Ok(enrollment_id) = rx.try_recv() {
            if let Err(e) = self.executor.advance(enrollment_id).await {
                error!(enrollment_id = %enrollment_id, "Queued advance failed: {}", e);
            }
            advanced += 1;
        }
        advanced
    }

    pub async fn advance(&self, enrollment_id: Uuid) -> EngineResult<AdvanceOutcome> {
        self.executor.advance(enrollment_id).await
    }

    /// Runs the resume sweep should pick up now
    pub async fn due_runs(&self, limit: usize) -> EngineResult<Vec<Uuid>> {
        let now = Utc::now();
        Ok(self
            .store
            .due_runnable(now, now - self.config.claim_ttl(), limit)
            .await?)
    }

    pub async fn list_automations(&self, filter: &AutomationFilter) -> EngineResult<Vec<AutomationSummary>> {
        let automations = self.store.list_automations(filter).await?;
        let mut summaries = Vec::with_capacity(automations.len());
        for automation in automations {
            let enrollments = self.store.enrollments_for(automation.id).await?;
            summaries.push(AutomationSummary {
                stats: summarize(&enrollments),
                automation,
            });
        }
        Ok(summaries)
    }

    pub async fn get_automation(&self, automation_id: Uuid) -> EngineResult<Automation> {
        self.store
            .get_automation(automation_id)
            .await?
            .filter(|a| a.deleted_at.is_none())
            .ok_or_else(|| EngineError::NotFound(format!("Automation {}", automation_id)))
    }

    /// Validate and store a definition. Republishing an existing id bumps its
    /// version; running enrollments stay on the version they started with.
    pub async fn publish_automation(&self, draft: AutomationDraft) -> EngineResult<Automation> {
        draft.validate()?;
        draft.check_retry_budget(self.config.executor_settings().webhook_retry, self.config.claim_ttl())?;
        let now = Utc::now();

        let existing = match draft.id {
            Some(id) => self.store.get_automation(id).await?,
            None => None,
        };
        if existing.as_ref().is_some_and(|a| a.deleted_at.is_some()) {
            return Err(EngineError::NotFound(format!("Automation {}", draft.id.unwrap_or_default())));
        }

        let (is_active, status) = if draft.activate {
            (true, AutomationStatus::Active)
        } else {
            match &existing {
                Some(current) => (current.is_active, current.status),
                None => (false, AutomationStatus::Draft),
            }
        };

        let automation = Automation {
            id: existing.as_ref().map(|a| a.id).or(draft.id).unwrap_or_else(Uuid::new_v4),
            name: draft.name.trim().to_string(),
            description: draft.description,
            kind: draft.kind,
            trigger: draft.trigger,
            steps: draft.steps,
            is_active,
            status,
            re_enrollment: draft.re_enrollment,
            version: existing.as_ref().map(|a| a.version + 1).unwrap_or(1),
            created_at: existing.as_ref().map(|a| a.created_at).unwrap_or(now),
            updated_at: now,
            deleted_at: None,
        };

        self.store.save_automation(&automation).await?;
        info!(
            automation_id = %automation.id,
            version = automation.version,
            active = automation.is_active,
            "Automation published"
        );
        Ok(automation)
    }

    pub async fn toggle_automation(&self, automation_id: Uuid, active: bool) -> EngineResult<Automation> {
        self.enrollments.toggle(automation_id, active).await
    }

    /// Returns how many running enrollments were exited
    pub async fn delete_automation(&self, automation_id: Uuid) -> EngineResult<usize> {
        self.enrollments.delete(automation_id).await
    }

    /// Enroll one lead outside any trigger and run it up to its first suspension.
    pub async fn execute_automation(&self, automation_id: Uuid, lead_id: Uuid) -> EngineResult<ExecuteAutomationResponse> {
        if self
            .collaborators
            .leads
            .get_lead(lead_id)
            .await?
            .is_none()
        {
            return Err(EngineError::NotFound(format!("Lead {}", lead_id)));
        }

        match self
            .enrollments
            .enroll_with(automation_id, lead_id, EnrollMode::Policy, false)
            .await?
        {
            EnrollResult::Enrolled(enrollment) => {
                let outcome = self.executor.advance(enrollment.id).await?;
                let status = self
                    .store
                    .get_enrollment(enrollment.id)
                    .await?
                    .map(|e| e.status);

                let message = match outcome {
                    AdvanceOutcome::Suspended { resumes_at } => {
                        format!("enrolled; waiting until {}", resumes_at.to_rfc3339())
                    }
                    AdvanceOutcome::Finished { status } => format!("enrolled; run {}", status.as_str()),
                    AdvanceOutcome::NotClaimed | AdvanceOutcome::Conflict => {
                        "enrolled; run is being advanced by another worker".to_string()
                    }
                };
                Ok(ExecuteAutomationResponse {
                    enrollment_id: Some(enrollment.id),
                    status,
                    message,
                })
            }
            EnrollResult::Skipped(decision) => Ok(ExecuteAutomationResponse {
                enrollment_id: None,
                status: None,
                message: decision.describe(),
            }),
        }
    }

    pub async fn re_enroll_leads(
        &self,
        automation_id: Uuid,
        lead_ids: Vec<Uuid>,
        remove_existing: bool,
    ) -> EngineResult<ReEnrollResult> {
        self.enrollments
            .bulk_re_enroll(automation_id, lead_ids, remove_existing)
            .await
    }

    pub async fn get_automation_analytics(&self, automation_id: Uuid) -> EngineResult<AutomationAnalytics> {
        self.analytics.get_analytics(automation_id).await
    }

    /// Evaluate an event against every active automation listening for its type.
    /// Returns the ids of enrollments created.
    pub async fn process_event(&self, event: &TriggerEvent) -> EngineResult<Vec<Uuid>> {
        let automations = self.store.active_automations_for(event.event_type).await?;
        if automations.is_empty() {
            debug!(event_id = %event.event_id, "No automations listen for {:?}", event.event_type);
            return Ok(Vec::new());
        }

        let Some(lead) = self.collaborators.leads.get_lead(event.lead_id).await? else {
            warn!(event_id = %event.event_id, lead_id = %event.lead_id, "Event for unknown lead ignored");
            return Ok(Vec::new());
        };

        let now = Utc::now();
        let lead = &lead;
        let results = join_all(
            automations
                .iter()
                .filter(|a| TriggerEvaluator::evaluate(&a.trigger, event, lead, now))
                .map(|automation| async move {
                    let result = self
                        .enrollments
                        .enroll(automation.id, lead.id, EnrollMode::Policy)
                        .await;
                    (automation.id, result)
                }),
        )
        .await;

        let mut created = Vec::new();
        for (automation_id, result) in results {
            match result {
                Ok(EnrollResult::Enrolled(enrollment)) => created.push(enrollment.id),
                Ok(EnrollResult::Skipped(decision)) => {
                    debug!(automation_id = %automation_id, lead_id = %lead.id, "Trigger matched but {}", decision.describe());
                }
                Err(e) => warn!(automation_id = %automation_id, lead_id = %lead.id, "Enrollment from event failed: {}", e),
            }
        }

        info!(
            event_id = %event.event_id,
            event_type = ?event.event_type,
            matched = created.len(),
            "Event processed"
        );
        Ok(created)
    }
}

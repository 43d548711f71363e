use axum::Router;
use chrono::Duration;
use serde_json::Value;
use std::sync::Arc;
use tokio::sync::mpsc::UnboundedReceiver;
use uuid::Uuid;

use super::fixtures::{draft, lead_attributes};
use crate::config::EngineConfig;
use crate::jobs::{JobConfig, JobScheduler};
use crate::services::{
    Collaborators, HttpCaller, MemoryLeadStore, MemoryListStore, MemoryTaskService, MockHttpCaller, RecordingSender,
};
use crate::workflows::steps::StepGraph;
use crate::workflows::store::{EnrollmentStore, ExecutionLogStore};
use crate::workflows::{
    AdvanceOutcome, Automation, AutomationEngine, Enrollment, MemoryStore, ReEnrollmentPolicy, StepExecutionLog,
};
use crate::AppState;

/// An engine over in-memory collaborators, with handles to inspect each one
pub struct TestEngine {
    pub engine: Arc<AutomationEngine>,
    pub run_queue: UnboundedReceiver<Uuid>,
    pub store: MemoryStore,
    pub leads: MemoryLeadStore,
    pub sender: RecordingSender,
    pub tasks: MemoryTaskService,
    pub lists: MemoryListStore,
}

impl TestEngine {
    pub fn new() -> Self {
        Self::build(Arc::new(MockHttpCaller::new()), test_config())
    }

    pub fn with_http(http: Arc<dyn HttpCaller>) -> Self {
        Self::build(http, test_config())
    }

    pub fn build(http: Arc<dyn HttpCaller>, config: EngineConfig) -> Self {
        super::init_tracing();

        let store = MemoryStore::new();
        let leads = MemoryLeadStore::new();
        let sender = RecordingSender::new();
        let tasks = MemoryTaskService::new();
        let lists = MemoryListStore::new();

        let collaborators = Collaborators {
            messages: Arc::new(sender.clone()),
            leads: Arc::new(leads.clone()),
            tasks: Arc::new(tasks.clone()),
            http,
            lists: Arc::new(lists.clone()),
        };
        let (engine, run_queue) = AutomationEngine::new(Arc::new(store.clone()), collaborators, config);

        Self {
            engine,
            run_queue,
            store,
            leads,
            sender,
            tasks,
            lists,
        }
    }

    /// Publish and activate an automation built from `steps`
    pub async fn publish(&self, steps: StepGraph, re_enrollment: ReEnrollmentPolicy) -> Automation {
        self.engine
            .publish_automation(draft("Test automation", steps, re_enrollment))
            .await
            .expect("publish automation")
    }

    pub async fn lead(&self) -> Uuid {
        self.leads.create(lead_attributes()).await
    }

    pub async fn lead_with(&self, field: &str, value: Value) -> Uuid {
        let id = self.lead().await;
        self.leads.set_field(id, field, value).await;
        id
    }

    /// Advance every queued run
    pub async fn run_queued(&mut self) -> usize {
        self.engine.drain_queue(&mut self.run_queue).await
    }

    pub async fn advance(&self, enrollment_id: Uuid) -> AdvanceOutcome {
        self.engine.advance(enrollment_id).await.expect("advance")
    }

    pub async fn enrollment(&self, enrollment_id: Uuid) -> Enrollment {
        self.store
            .get_enrollment(enrollment_id)
            .await
            .expect("store read")
            .expect("enrollment exists")
    }

    pub async fn enrollments_for_lead(&self, automation_id: Uuid, lead_id: Uuid) -> Vec<Enrollment> {
        self.store
            .enrollments_for_lead(automation_id, lead_id)
            .await
            .expect("store read")
    }

    pub async fn logs(&self, enrollment_id: Uuid) -> Vec<StepExecutionLog> {
        self.store.logs_for_enrollment(enrollment_id).await.expect("store read")
    }

    /// Pretend `elapsed` has passed for one run
    pub async fn elapse(&self, enrollment_id: Uuid, elapsed: Duration) {
        self.store.rewind(enrollment_id, elapsed).await;
    }

    pub async fn router(&self) -> Router {
        let jobs = JobScheduler::new(self.engine.clone(), JobConfig::from(self.engine.config()))
            .await
            .expect("job scheduler");
        crate::handlers::router(Arc::new(AppState {
            engine: self.engine.clone(),
            jobs: Arc::new(jobs),
        }))
    }
}

/// Defaults with retries that do not sleep
pub fn test_config() -> EngineConfig {
    EngineConfig {
        webhook_backoff_seconds: 0,
        ..EngineConfig::default()
    }
}

pub fn events_of(logs: &[StepExecutionLog], event: &str) -> usize {
    logs.iter().filter(|l| l.detail["event"] == event).count()
}

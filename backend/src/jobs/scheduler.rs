// Job Scheduler - Drives the resume sweep on a fixed tick

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::RwLock;
use tokio_cron_scheduler::{Job, JobScheduler as TokioScheduler, JobSchedulerError};
use tracing::{error, info};
use uuid::Uuid;

use super::ResumeWaitingJob;
use crate::workflows::{AutomationEngine, EngineError};

const MAX_EXECUTION_LOGS: usize = 100;

#[derive(Error, Debug)]
pub enum JobError {
    #[error("Scheduler error: {0}")]
    SchedulerError(#[from] JobSchedulerError),
    #[error("Job execution error: {0}")]
    ExecutionError(#[from] EngineError),
    #[error("Configuration error: {0}")]
    ConfigError(String),
}

pub type JobResult<T> = Result<T, JobError>;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobConfig {
    pub tick_seconds: u64,
    pub resume_batch_size: usize,
    pub resume_concurrency: usize,
}

impl Default for JobConfig {
    fn default() -> Self {
        Self {
            tick_seconds: 30,
            resume_batch_size: 200,
            resume_concurrency: 16,
        }
    }
}

impl From<&crate::config::EngineConfig> for JobConfig {
    fn from(config: &crate::config::EngineConfig) -> Self {
        Self {
            tick_seconds: config.scheduler_tick_seconds,
            resume_batch_size: config.resume_batch_size,
            resume_concurrency: config.resume_concurrency,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobExecutionLog {
    pub id: Uuid,
    pub job_name: String,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub status: JobStatus,
    pub items_processed: i32,
    pub errors: Vec<String>,
    pub duration_ms: Option<i64>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub enum JobStatus {
    Running,
    Completed,
    Failed,
    PartialFailure,
}

pub struct JobScheduler {
    scheduler: TokioScheduler,
    engine: Arc<AutomationEngine>,
    config: JobConfig,
    execution_logs: Arc<RwLock<Vec<JobExecutionLog>>>,
}

impl JobScheduler {
    pub async fn new(engine: Arc<AutomationEngine>, config: JobConfig) -> JobResult<Self> {
        if config.tick_seconds == 0 {
            return Err(JobError::ConfigError("tick_seconds must be positive".to_string()));
        }
        let scheduler = TokioScheduler::new().await?;

        Ok(Self {
            scheduler,
            engine,
            config,
            execution_logs: Arc::new(RwLock::new(Vec::new())),
        })
    }

    pub async fn start(&self) -> JobResult<()> {
        info!("Starting background job scheduler");

        self.schedule_resume_waiting().await?;
        self.scheduler.start().await?;

        info!("Background job scheduler started successfully");
        Ok(())
    }

    pub async fn shutdown(&self) -> JobResult<()> {
        info!("Shutting down background job scheduler");
        // Clones share one scheduler context
        let mut scheduler = self.scheduler.clone();
        scheduler.shutdown().await?;
        Ok(())
    }

    async fn schedule_resume_waiting(&self) -> JobResult<()> {
        let interval = self.config.tick_seconds;
        let engine = self.engine.clone();
        let config = self.config.clone();
        let logs = self.execution_logs.clone();

        let job = Job::new_repeated_async(Duration::from_secs(interval), move |_uuid, _lock| {
            let engine = engine.clone();
            let config = config.clone();
            let logs = logs.clone();

            Box::pin(async move {
                let job = ResumeWaitingJob::new(engine, config.resume_batch_size, config.resume_concurrency);
                let log = run_logged(&job).await;
                record(&logs, log).await;
            })
        })?;

        self.scheduler.add(job).await?;
        info!("Scheduled resume sweep to run every {} seconds", interval);

        Ok(())
    }

    pub async fn get_execution_logs(&self) -> Vec<JobExecutionLog> {
        self.execution_logs.read().await.clone()
    }

    /// Run one sweep immediately, outside the tick
    pub async fn run_job_now(&self, job_name: &str) -> JobResult<JobExecutionLog> {
        match job_name {
            "resume_waiting" => {
                let job = ResumeWaitingJob::new(
                    self.engine.clone(),
                    self.config.resume_batch_size,
                    self.config.resume_concurrency,
                );
                let log = run_logged(&job).await;
                record(&self.execution_logs, log.clone()).await;
                Ok(log)
            }
            _ => Err(JobError::ConfigError(format!("Unknown job: {}", job_name))),
        }
    }
}

async fn run_logged(job: &ResumeWaitingJob) -> JobExecutionLog {
    let started_at = Utc::now();
    let mut log = JobExecutionLog {
        id: Uuid::new_v4(),
        job_name: "Resume Waiting".to_string(),
        started_at,
        completed_at: None,
        status: JobStatus::Running,
        items_processed: 0,
        errors: Vec::new(),
        duration_ms: None,
    };

    match job.run().await {
        Ok(result) => {
            log.status = if result.errors.is_empty() {
                JobStatus::Completed
            } else {
                JobStatus::PartialFailure
            };
            log.items_processed = result.resumed;
            log.errors = result.errors;
        }
        Err(e) => {
            error!("Resume sweep failed: {}", e);
            log.status = JobStatus::Failed;
            log.errors.push(e.to_string());
        }
    }

    let completed_at = Utc::now();
    log.completed_at = Some(completed_at);
    log.duration_ms = Some((completed_at - started_at).num_milliseconds());
    log
}

async fn record(logs: &RwLock<Vec<JobExecutionLog>>, log: JobExecutionLog) {
    let mut logs = logs.write().await;
    logs.push(log);
    // Keep only the most recent runs
    if logs.len() > MAX_EXECUTION_LOGS {
        let excess = logs.len() - MAX_EXECUTION_LOGS;
        logs.drain(..excess);
    }
}

// Resume Waiting Job - Wakes due runs and advances them

use futures::stream::{self, StreamExt};
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::workflows::{AdvanceOutcome, AutomationEngine, EngineError};

pub struct ResumeWaitingJob {
    engine: Arc<AutomationEngine>,
    batch_size: usize,
    concurrency: usize,
}

#[derive(Debug, Default, Clone, PartialEq)]
pub struct ResumeResult {
    pub runs_due: i32,
    pub resumed: i32,
    /// Another worker claimed the run first; it was not touched
    pub conflicts: i32,
    pub errors: Vec<String>,
}

impl ResumeWaitingJob {
    pub fn new(engine: Arc<AutomationEngine>, batch_size: usize, concurrency: usize) -> Self {
        Self {
            engine,
            batch_size: batch_size.max(1),
            concurrency: concurrency.max(1),
        }
    }

    /// One sweep: every due run in the batch is advanced at most once by this tick.
    pub async fn run(&self) -> Result<ResumeResult, EngineError> {
        let due = self.engine.due_runs(self.batch_size).await?;
        let mut result = ResumeResult {
            runs_due: due.len() as i32,
            ..Default::default()
        };
        if due.is_empty() {
            debug!("No runs due");
            return Ok(result);
        }

        // One task per advance; an aborted task fails only its own run
        let outcomes: Vec<_> = stream::iter(due)
            .map(|enrollment_id| {
                let engine = self.engine.clone();
                async move {
                    let outcome = tokio::spawn(async move { engine.advance(enrollment_id).await })
                        .await
                        .unwrap_or_else(|e| Err(EngineError::Scheduling(format!("advance task aborted: {}", e))));
                    (enrollment_id, outcome)
                }
            })
            .buffer_unordered(self.concurrency)
            .collect()
            .await;

        for (enrollment_id, outcome) in outcomes {
            match outcome {
                Ok(AdvanceOutcome::NotClaimed) | Ok(AdvanceOutcome::Conflict) => result.conflicts += 1,
                Ok(_) => result.resumed += 1,
                Err(e) => {
                    warn!(enrollment_id = %enrollment_id, "Resume failed: {}", e);
                    result.errors.push(format!("{}: {}", enrollment_id, e));
                }
            }
        }

        info!(
            "Resume sweep: {} due, {} resumed, {} conflicts, {} errors",
            result.runs_due,
            result.resumed,
            result.conflicts,
            result.errors.len()
        );
        Ok(result)
    }
}

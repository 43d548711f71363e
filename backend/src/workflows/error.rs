// Engine Errors - Failure taxonomy shared by every workflow component

use std::collections::HashMap;
use thiserror::Error;

use super::store::StoreError;
use crate::services::CollaboratorError;

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("Validation failed")]
    Validation { details: HashMap<String, Vec<String>> },
    #[error("Trigger evaluation error: {0}")]
    TriggerEvaluation(String),
    #[error("Step '{step_id}' failed: {message}")]
    StepExecution { step_id: String, message: String },
    #[error("Scheduling error: {0}")]
    Scheduling(String),
    #[error("Concurrency conflict: {0}")]
    ConcurrencyConflict(String),
    #[error("{0} not found")]
    NotFound(String),
    #[error("Store error: {0}")]
    Store(#[from] StoreError),
    #[error("Collaborator error: {0}")]
    Collaborator(#[from] CollaboratorError),
}

pub type EngineResult<T> = Result<T, EngineError>;

impl EngineError {
    pub fn validation(field: &str, message: &str) -> Self {
        ValidationBuilder::new().error(field, message).into_error()
    }

    pub fn step(step_id: &str, message: impl Into<String>) -> Self {
        Self::StepExecution {
            step_id: step_id.to_string(),
            message: message.into(),
        }
    }

    /// Failures that a later retry could plausibly get past
    pub fn is_transient(&self) -> bool {
        match self {
            Self::ConcurrencyConflict(_) | Self::Scheduling(_) => true,
            Self::Store(e) => e.is_transient(),
            Self::Collaborator(e) => e.is_transient(),
            _ => false,
        }
    }
}

/// Collects field-level problems into one validation failure
#[derive(Debug, Default)]
pub struct ValidationBuilder {
    details: HashMap<String, Vec<String>>,
}

impl ValidationBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn error(mut self, field: &str, message: &str) -> Self {
        self.details
            .entry(field.to_string())
            .or_default()
            .push(message.to_string());
        self
    }

    pub fn build_details(self) -> Option<HashMap<String, Vec<String>>> {
        if self.details.is_empty() {
            None
        } else {
            Some(self.details)
        }
    }

    pub fn into_details(self) -> HashMap<String, Vec<String>> {
        self.details
    }

    pub fn build(self) -> Option<EngineError> {
        self.build_details().map(|details| EngineError::Validation { details })
    }

    fn into_error(self) -> EngineError {
        EngineError::Validation { details: self.details }
    }
}

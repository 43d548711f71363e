// Workflow Automation Engine
//
// Enrolls leads into versioned automations and walks each run through its
// step graph: messages, record updates, branches, splits and durable waits.

pub mod analytics;
pub mod conditions;
pub mod engine;
pub mod enrollment;
pub mod error;
pub mod executor;
pub mod models;
pub mod pg_store;
pub mod queue;
pub mod steps;
pub mod store;
pub mod templates;
pub mod triggers;
pub mod wait;

pub use conditions::{Condition, ConditionGroup, ConditionOperator, LogicMode};
pub use engine::{AutomationEngine, AutomationSummary};
pub use error::EngineError;
pub use executor::AdvanceOutcome;
pub use models::{Automation, AutomationDraft, Enrollment, ReEnrollmentPolicy, StepExecutionLog};
pub use pg_store::PgStore;
pub use store::{EngineStore, MemoryStore};
pub use triggers::{LeadEventType, TriggerEvent, TriggerSpec};

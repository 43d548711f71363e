// Background Jobs Service
//
// Scheduled work for the automation engine. The resume sweep wakes waiting
// runs whose time has come and recovers runs whose worker disappeared.

pub mod resume_waiting;
pub mod scheduler;

pub use resume_waiting::{ResumeResult, ResumeWaitingJob};
pub use scheduler::{JobConfig, JobError, JobExecutionLog, JobResult, JobScheduler, JobStatus};

// Run Queue - In-process hand-off of enrollment ids to the advance worker

use tokio::sync::mpsc;
use tracing::warn;
use uuid::Uuid;

/// Sending half of the run queue. Cheap to clone.
///
/// The queue is an accelerator only: a run whose id is lost here (worker gone,
/// process restart) is still picked up by the resume sweep once its claim TTL passes.
#[derive(Debug, Clone)]
pub struct RunQueue {
    tx: mpsc::UnboundedSender<Uuid>,
}

impl RunQueue {
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<Uuid>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    pub fn push(&self, enrollment_id: Uuid) {
        if self.tx.send(enrollment_id).is_err() {
            warn!(enrollment_id = %enrollment_id, "Run queue closed; enrollment left for the resume sweep");
        }
    }
}

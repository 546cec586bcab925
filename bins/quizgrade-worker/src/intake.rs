// Job intake: moves evaluation jobs from the shared job list into the
// in-process queue

use crate::queue::EvaluationQueue;
use crate::services::JobSource;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument};

/// Pause after a failed poll before trying again
const RETRY_DELAY: Duration = Duration::from_secs(1);

pub struct JobIntake {
    source: Arc<dyn JobSource>,
    queue: Arc<EvaluationQueue>,
}

impl JobIntake {
    pub fn new(source: Arc<dyn JobSource>, queue: Arc<EvaluationQueue>) -> Self {
        Self { source, queue }
    }

    /// Poll until `token` is cancelled. Cancellation is only checked between
    /// polls so a popped job is never dropped on the floor.
    #[instrument(skip(self, token))]
    pub async fn run(&self, token: CancellationToken) {
        info!("Job intake started");

        while !token.is_cancelled() {
            match self.source.next_job().await {
                Ok(Some(job)) => {
                    let attempt_id = job.attempt_id;
                    debug!(attempt_id = %attempt_id, quiz_id = %job.quiz_id, "Evaluation job received");
                    if let Err(e) = self.queue.enqueue(job) {
                        error!(attempt_id = %attempt_id, error = %e, "Failed to enqueue evaluation");
                        break;
                    }
                }
                // Poll timed out
                Ok(None) => continue,
                Err(e) => {
                    error!(error = %format!("{:#}", e), "Job intake poll failed");
                    tokio::select! {
                        _ = token.cancelled() => break,
                        _ = tokio::time::sleep(RETRY_DELAY) => {}
                    }
                }
            }
        }

        info!("Job intake stopped");
    }
}

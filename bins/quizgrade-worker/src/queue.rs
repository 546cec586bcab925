// In-process evaluation queue: many producers, many consumers, FIFO

use quizgrade_common::types::EvaluationJob;
use thiserror::Error;
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;

#[derive(Debug, Error)]
pub enum QueueError {
    #[error("evaluation queue is closed")]
    Closed,
}

pub struct EvaluationQueue {
    sender: mpsc::UnboundedSender<EvaluationJob>,
    receiver: Mutex<mpsc::UnboundedReceiver<EvaluationJob>>,
}

impl EvaluationQueue {
    pub fn new() -> Self {
        let (sender, receiver) = mpsc::unbounded_channel();
        Self {
            sender,
            receiver: Mutex::new(receiver),
        }
    }

    /// Never blocks
    pub fn enqueue(&self, job: EvaluationJob) -> Result<(), QueueError> {
        self.sender.send(job).map_err(|_| QueueError::Closed)
    }

    /// Next job in arrival order, or `None` once `token` is cancelled
    pub async fn dequeue(&self, token: &CancellationToken) -> Option<EvaluationJob> {
        tokio::select! {
            biased;
            _ = token.cancelled() => None,
            job = async { self.receiver.lock().await.recv().await } => job,
        }
    }

    /// Stop accepting jobs; already queued jobs can still be drained
    pub async fn close(&self) {
        self.receiver.lock().await.close();
    }
}

impl Default for EvaluationQueue {
    fn default() -> Self {
        Self::new()
    }
}

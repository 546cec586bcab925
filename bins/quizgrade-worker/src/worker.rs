/// Evaluation Worker
///
/// Consumes `EvaluationJob`s and drives each attempt through:
///
/// ```text
/// EvaluationStarted -> SystemGradingComplete -> AiAssessmentComplete -> done
///         \__________________\________________________\-> EvaluationFailed
/// ```
///
/// **Per-job guarantees:**
/// - Test cases run sequentially in authored order; results are stored in that order
/// - One solution's AI failure never aborts the job
/// - Any other failure ends the job with `EvaluationFailed`; the loop continues
/// - Shutdown is checked between solutions and test cases and ends the job silently
/// - Notification delivery failures are logged only

use crate::queue::EvaluationQueue;
use crate::services::{notify, AttemptStore, Mailer, NotificationSink, SolutionAssessor};
use anyhow::{anyhow, Context};
use quizgrade_common::types::{
    Attempt, EvaluationJob, EventKind, FeedbackEmail, Notification, Question, QuizStatistics,
    Solution, Topic, SYSTEM_EVALUATOR,
};
use quizgrade_sandbox::evaluator::Evaluator;
use std::sync::Arc;
use std::time::Instant;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

#[derive(Debug, Error)]
enum JobError {
    #[error("job cancelled")]
    Cancelled,

    #[error(transparent)]
    Failed(#[from] anyhow::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobOutcome {
    Completed,
    Failed,
    Cancelled,
}

pub struct EvaluationWorker {
    queue: Arc<EvaluationQueue>,
    evaluator: Arc<Evaluator>,
    store: Arc<dyn AttemptStore>,
    notifier: Arc<dyn NotificationSink>,
    mailer: Arc<dyn Mailer>,
    assessor: Option<Arc<dyn SolutionAssessor>>,
}

impl EvaluationWorker {
    pub fn new(
        queue: Arc<EvaluationQueue>,
        evaluator: Arc<Evaluator>,
        store: Arc<dyn AttemptStore>,
        notifier: Arc<dyn NotificationSink>,
        mailer: Arc<dyn Mailer>,
        assessor: Option<Arc<dyn SolutionAssessor>>,
    ) -> Self {
        Self {
            queue,
            evaluator,
            store,
            notifier,
            mailer,
            assessor,
        }
    }

    #[instrument(skip(self, token))]
    pub async fn run(&self, consumer: usize, token: CancellationToken) {
        info!("Evaluation worker started");

        while let Some(job) = self.queue.dequeue(&token).await {
            self.process(&job, &token).await;
        }

        info!("Evaluation worker stopped");
    }

    pub async fn process(&self, job: &EvaluationJob, token: &CancellationToken) -> JobOutcome {
        let start = Instant::now();
        info!(
            attempt_id = %job.attempt_id,
            quiz_id = %job.quiz_id,
            queued_ms = (chrono::Utc::now() - job.enqueued_at).num_milliseconds(),
            "Received job"
        );

        self.broadcast(job, Notification::new(EventKind::EvaluationStarted, job.quiz_id, Some(job.attempt_id)))
            .await;

        match self.evaluate_attempt(job, token).await {
            Ok(()) => {
                info!(
                    attempt_id = %job.attempt_id,
                    execution_ms = start.elapsed().as_millis() as u64,
                    "Evaluation completed"
                );
                JobOutcome::Completed
            }
            Err(JobError::Cancelled) => {
                warn!(attempt_id = %job.attempt_id, "Evaluation interrupted by shutdown");
                JobOutcome::Cancelled
            }
            Err(JobError::Failed(e)) => {
                error!(attempt_id = %job.attempt_id, error = %format!("{:#}", e), "Evaluation failed");
                let failure = Notification::new(EventKind::EvaluationFailed, job.quiz_id, Some(job.attempt_id))
                    .with_message(e.to_string());
                self.broadcast(job, failure).await;
                JobOutcome::Failed
            }
        }
    }

    async fn evaluate_attempt(&self, job: &EvaluationJob, token: &CancellationToken) -> Result<(), JobError> {
        let mut attempt = self
            .store
            .load_attempt(job.attempt_id)
            .await?
            .ok_or_else(|| anyhow!("Attempt {} not found", job.attempt_id))?;

        if !attempt.is_submitted() {
            return Err(anyhow!("Attempt {} has not been submitted", job.attempt_id).into());
        }

        self.grade_attempt(&mut attempt, token).await?;
        self.store.save_attempt(&attempt).await?;
        self.publish_projections(job, &attempt, EventKind::SystemGradingComplete).await;

        self.assess_attempt(&mut attempt, token).await?;
        self.publish_projections(job, &attempt, EventKind::AiAssessmentComplete).await;

        if attempt.is_fully_graded() {
            if let Some(email) = FeedbackEmail::for_attempt(&attempt) {
                self.mailer.send_attempt_feedback(&email).await?;
                debug!(attempt_id = %attempt.id, "Feedback email requested");
            }
        }

        let attempts = self.store.load_quiz_attempts(attempt.quiz.id).await?;
        let statistics = QuizStatistics::from_attempts(attempt.quiz.id, &attempts);
        let update = Notification::new(EventKind::QuizUpdated, attempt.quiz.id, Some(attempt.id))
            .with_statistics(statistics);
        notify(self.notifier.as_ref(), &Topic::User(job.examiner_id), &update).await;
        notify(self.notifier.as_ref(), &Topic::Quiz(attempt.quiz.id), &update).await;

        Ok(())
    }

    async fn grade_attempt(&self, attempt: &mut Attempt, token: &CancellationToken) -> Result<(), JobError> {
        for solution in attempt.solutions.iter_mut() {
            if token.is_cancelled() {
                return Err(JobError::Cancelled);
            }

            let Some(question) = attempt.quiz.question(solution.question_id) else {
                warn!(solution_id = %solution.id, question_id = %solution.question_id, "Solution refers to unknown question; skipped");
                continue;
            };

            self.grade_solution(solution, question, token).await?;
        }
        Ok(())
    }

    async fn grade_solution(
        &self,
        solution: &mut Solution,
        question: &Question,
        token: &CancellationToken,
    ) -> Result<(), JobError> {
        if question.test_cases.is_empty() {
            debug!(question_id = %question.id, "Question has no test cases; left for manual grading");
            return Ok(());
        }

        let mut results = Vec::with_capacity(question.test_cases.len());
        for test_case in &question.test_cases {
            if token.is_cancelled() {
                return Err(JobError::Cancelled);
            }

            let result = self
                .evaluator
                .evaluate(&question.language, &solution.code, test_case)
                .await
                .with_context(|| format!("Cannot grade question \"{}\"", question.title))?;
            results.push(result);
        }

        let passed = results.iter().filter(|r| r.is_successful).count();
        let grade = passed as f64 / results.len() as f64 * question.points;

        info!(
            solution_id = %solution.id,
            passed = passed,
            total = results.len(),
            grade = grade,
            "Solution graded"
        );

        solution.evaluation_results = results;
        solution.received_grade = Some(grade);
        solution.evaluated_by = Some(SYSTEM_EVALUATOR.to_string());
        Ok(())
    }

    async fn assess_attempt(&self, attempt: &mut Attempt, token: &CancellationToken) -> Result<(), JobError> {
        let Some(assessor) = &self.assessor else {
            debug!(attempt_id = %attempt.id, "No assessor configured; skipping AI assessment");
            return Ok(());
        };

        let mut assessed = 0;
        for solution in attempt.solutions.iter_mut() {
            if token.is_cancelled() {
                return Err(JobError::Cancelled);
            }
            if solution.evaluation_results.is_empty() {
                continue;
            }
            let Some(question) = attempt.quiz.question(solution.question_id) else {
                continue;
            };
            if !question.config.ai_assessment {
                continue;
            }

            match assessor.assess(solution, question, &question.config).await {
                Ok(assessment) => {
                    solution.ai_assessment = Some(assessment);
                    assessed += 1;
                }
                Err(e) => {
                    warn!(solution_id = %solution.id, error = %format!("{:#}", e), "AI assessment failed; solution left unassessed");
                }
            }
        }

        if assessed > 0 {
            self.store.save_attempt(attempt).await?;
        }
        Ok(())
    }

    /// Examiner gets the full view, examinee the reduced one
    async fn publish_projections(&self, job: &EvaluationJob, attempt: &Attempt, event: EventKind) {
        let base = Notification::new(event, job.quiz_id, Some(job.attempt_id));

        let examiner = base.clone().with_attempt(attempt.examiner_view());
        notify(self.notifier.as_ref(), &Topic::User(job.examiner_id), &examiner).await;

        let examinee = base.with_attempt(attempt.examinee_view());
        notify(self.notifier.as_ref(), &Topic::User(job.examinee_id), &examinee).await;
    }

    async fn broadcast(&self, job: &EvaluationJob, notification: Notification) {
        notify(self.notifier.as_ref(), &Topic::User(job.examinee_id), &notification).await;
        notify(self.notifier.as_ref(), &Topic::User(job.examiner_id), &notification).await;
    }
}

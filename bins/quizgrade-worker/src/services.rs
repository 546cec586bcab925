/// Collaborators of the grading pipeline
///
/// Each seam is a trait so the worker and monitor can be driven against
/// in-memory fakes; the shipped adapters talk to Redis (storage, pub/sub,
/// mail hand-off) and to an HTTP assessment endpoint.

use anyhow::{Context, Result};
use async_trait::async_trait;
use quizgrade_common::redis as store;
use chrono::{DateTime, Utc};
use quizgrade_common::types::{
    AiAssessment, Attempt, EvaluationJob, FeedbackEmail, Notification, Question, QuestionConfig,
    Solution, Topic,
};
use redis::aio::ConnectionManager;
use reqwest::{Client, StatusCode};
use serde::Serialize;
use std::time::Duration;
use tracing::{debug, warn};
use uuid::Uuid;

#[async_trait]
pub trait AttemptStore: Send + Sync {
    async fn load_attempt(&self, attempt_id: Uuid) -> Result<Option<Attempt>>;

    async fn save_attempt(&self, attempt: &Attempt) -> Result<()>;

    /// Attempts without an end time
    async fn load_open_attempts(&self) -> Result<Vec<Attempt>>;

    /// Set each attempt's end time in one all-or-nothing step, skipping any
    /// attempt that is no longer open; returns the ids actually closed
    async fn close_attempts(&self, closures: &[(Uuid, DateTime<Utc>)]) -> Result<Vec<Uuid>>;

    async fn load_quiz_attempts(&self, quiz_id: Uuid) -> Result<Vec<Attempt>>;
}

/// Where evaluation jobs for explicitly submitted attempts come from
#[async_trait]
pub trait JobSource: Send + Sync {
    /// Next job, or `None` when nothing arrived within one poll
    async fn next_job(&self) -> Result<Option<EvaluationJob>>;
}

#[async_trait]
pub trait NotificationSink: Send + Sync {
    async fn publish(&self, topic: &Topic, notification: &Notification) -> Result<()>;
}

#[async_trait]
pub trait Mailer: Send + Sync {
    async fn send_attempt_feedback(&self, email: &FeedbackEmail) -> Result<()>;
}

#[async_trait]
pub trait SolutionAssessor: Send + Sync {
    async fn assess(
        &self,
        solution: &Solution,
        question: &Question,
        config: &QuestionConfig,
    ) -> Result<AiAssessment>;
}

/// Publish and swallow failures: delivery never decides a job's outcome
pub async fn notify(sink: &dyn NotificationSink, topic: &Topic, notification: &Notification) {
    match sink.publish(topic, notification).await {
        Ok(()) => debug!(topic = %topic, event = %notification.event, "Notification published"),
        Err(e) => warn!(topic = %topic, event = %notification.event, error = %e, "Failed to publish notification"),
    }
}

#[derive(Clone)]
pub struct RedisStore {
    conn: ConnectionManager,
}

impl RedisStore {
    pub fn new(conn: ConnectionManager) -> Self {
        Self { conn }
    }
}

#[async_trait]
impl AttemptStore for RedisStore {
    async fn load_attempt(&self, attempt_id: Uuid) -> Result<Option<Attempt>> {
        let mut conn = self.conn.clone();
        store::get_attempt(&mut conn, &attempt_id)
            .await
            .with_context(|| format!("Failed to load attempt {}", attempt_id))
    }

    async fn save_attempt(&self, attempt: &Attempt) -> Result<()> {
        let mut conn = self.conn.clone();
        store::store_attempt(&mut conn, attempt)
            .await
            .with_context(|| format!("Failed to save attempt {}", attempt.id))
    }

    async fn load_open_attempts(&self) -> Result<Vec<Attempt>> {
        let mut conn = self.conn.clone();
        store::get_open_attempts(&mut conn)
            .await
            .context("Failed to load open attempts")
    }

    async fn close_attempts(&self, closures: &[(Uuid, DateTime<Utc>)]) -> Result<Vec<Uuid>> {
        let mut conn = self.conn.clone();
        store::close_attempts(&mut conn, closures)
            .await
            .with_context(|| format!("Failed to close batch of {} attempts", closures.len()))
    }

    async fn load_quiz_attempts(&self, quiz_id: Uuid) -> Result<Vec<Attempt>> {
        let mut conn = self.conn.clone();
        store::get_quiz_attempts(&mut conn, &quiz_id)
            .await
            .with_context(|| format!("Failed to load attempts of quiz {}", quiz_id))
    }
}

/// Polls the shared job list; BLPOP blocks its connection, so this source
/// needs a connection of its own
pub struct RedisJobSource {
    conn: ConnectionManager,
    poll_timeout: Duration,
}

impl RedisJobSource {
    pub fn new(conn: ConnectionManager, poll_timeout: Duration) -> Self {
        Self { conn, poll_timeout }
    }
}

#[async_trait]
impl JobSource for RedisJobSource {
    async fn next_job(&self) -> Result<Option<EvaluationJob>> {
        let mut conn = self.conn.clone();
        store::pop_evaluation_job(&mut conn, self.poll_timeout.as_secs_f64())
            .await
            .context("Failed to pop evaluation job")
    }
}

#[derive(Clone)]
pub struct RedisNotifier {
    conn: ConnectionManager,
}

impl RedisNotifier {
    pub fn new(conn: ConnectionManager) -> Self {
        Self { conn }
    }
}

#[async_trait]
impl NotificationSink for RedisNotifier {
    async fn publish(&self, topic: &Topic, notification: &Notification) -> Result<()> {
        let mut conn = self.conn.clone();
        store::publish_notification(&mut conn, topic, notification)
            .await
            .with_context(|| format!("Failed to publish {} on {}", notification.event, topic))
    }
}

/// Hands feedback requests to the mail service through a Redis list
#[derive(Clone)]
pub struct RedisMailer {
    conn: ConnectionManager,
}

impl RedisMailer {
    pub fn new(conn: ConnectionManager) -> Self {
        Self { conn }
    }
}

#[async_trait]
impl Mailer for RedisMailer {
    async fn send_attempt_feedback(&self, email: &FeedbackEmail) -> Result<()> {
        let mut conn = self.conn.clone();
        store::push_feedback_email(&mut conn, email)
            .await
            .with_context(|| format!("Failed to queue feedback email for {}", email.email))
    }
}

const ASSESSMENT_TIMEOUT: Duration = Duration::from_secs(60);

#[derive(Serialize)]
struct AssessmentRequest<'a> {
    question_title: &'a str,
    language: &'a str,
    points: f64,
    code: &'a str,
    rubric: Option<&'a str>,
    passed: usize,
    total: usize,
}

/// Sends each solution to an external assessment service as JSON
pub struct HttpAssessor {
    client: Client,
    url: String,
}

impl HttpAssessor {
    pub fn new(url: &str) -> Result<Self> {
        let client = Client::builder()
            .timeout(ASSESSMENT_TIMEOUT)
            .build()
            .context("Failed to build HTTP client")?;
        Ok(Self {
            client,
            url: url.to_string(),
        })
    }
}

#[async_trait]
impl SolutionAssessor for HttpAssessor {
    async fn assess(
        &self,
        solution: &Solution,
        question: &Question,
        config: &QuestionConfig,
    ) -> Result<AiAssessment> {
        let request = AssessmentRequest {
            question_title: &question.title,
            language: &question.language,
            points: question.points,
            code: &solution.code,
            rubric: config.rubric.as_deref(),
            passed: solution.passed_count(),
            total: solution.evaluation_results.len(),
        };

        let response = self
            .client
            .post(&self.url)
            .json(&request)
            .send()
            .await
            .with_context(|| format!("Assessment request to {} failed", self.url))?;

        match response.status() {
            StatusCode::OK => response
                .json::<AiAssessment>()
                .await
                .context("Malformed assessment response"),
            status => anyhow::bail!("Assessment service returned {}", status),
        }
    }
}

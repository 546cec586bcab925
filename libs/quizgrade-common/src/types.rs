use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Marker stored in `Solution::evaluated_by` after test-case grading
pub const SYSTEM_EVALUATOR: &str = "System";

/// One hidden test case of a coding question
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TestCase {
    pub number: u32,
    pub input: Vec<String>,
    pub expected_output: String,
}

/// Outcome of running one solution against one test case
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EvaluationResult {
    pub test_case: TestCase,
    pub output: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub is_successful: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AiAssessment {
    pub is_valid: bool,
    pub confidence_score: f64,
    pub reasoning: String,
    #[serde(default)]
    pub flags: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub suggested_grade: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Participant {
    pub id: Uuid,
    pub name: String,
    pub email: String,
}

/// Per-question settings forwarded to the AI assessor
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QuestionConfig {
    #[serde(default = "default_ai_enabled")]
    pub ai_assessment: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rubric: Option<String>,
}

fn default_ai_enabled() -> bool {
    true
}

impl Default for QuestionConfig {
    fn default() -> Self {
        Self {
            ai_assessment: true,
            rubric: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Question {
    pub id: Uuid,
    pub title: String,
    pub points: f64,
    pub language: String,
    #[serde(default)]
    pub test_cases: Vec<TestCase>,
    #[serde(default)]
    pub config: QuestionConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Quiz {
    pub id: Uuid,
    pub title: String,
    pub examiner_id: Uuid,
    pub duration_minutes: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end_date: Option<DateTime<Utc>>,
    pub questions: Vec<Question>,
}

impl Quiz {
    pub fn total_points(&self) -> f64 {
        self.questions.iter().map(|q| q.points).sum()
    }

    pub fn question(&self, id: Uuid) -> Option<&Question> {
        self.questions.iter().find(|q| q.id == id)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Solution {
    pub id: Uuid,
    pub question_id: Uuid,
    pub code: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub received_grade: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub evaluated_by: Option<String>,
    #[serde(default)]
    pub evaluation_results: Vec<EvaluationResult>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ai_assessment: Option<AiAssessment>,
}

impl Solution {
    pub fn passed_count(&self) -> usize {
        self.evaluation_results
            .iter()
            .filter(|r| r.is_successful)
            .count()
    }
}

/// An examinee's timed attempt, loaded together with its quiz
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Attempt {
    pub id: Uuid,
    pub quiz: Quiz,
    pub examinee: Participant,
    pub start_time: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end_time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub solutions: Vec<Solution>,
}

impl Attempt {
    /// The moment the attempt should end: the earlier of its time allowance
    /// running out and the quiz closing. `None` when the allowance does not
    /// fit in a timestamp.
    pub fn deadline(&self) -> Option<DateTime<Utc>> {
        let by_duration = Duration::try_minutes(self.quiz.duration_minutes)
            .and_then(|allowance| self.start_time.checked_add_signed(allowance))?;
        match self.quiz.end_date {
            Some(end_date) if end_date < by_duration => Some(end_date),
            _ => Some(by_duration),
        }
    }

    pub fn is_submitted(&self) -> bool {
        self.end_time.is_some()
    }

    pub fn total_grade(&self) -> f64 {
        self.solutions.iter().filter_map(|s| s.received_grade).sum()
    }

    pub fn is_fully_graded(&self) -> bool {
        !self.solutions.is_empty() && self.solutions.iter().all(|s| s.received_grade.is_some())
    }

    pub fn job(&self) -> EvaluationJob {
        EvaluationJob::new(self.id, self.examinee.id, self.quiz.examiner_id, self.quiz.id)
    }

    /// Full view for the quiz author, including AI assessments and outputs
    pub fn examiner_view(&self) -> AttemptView {
        AttemptView::Examiner(ExaminerAttemptView {
            attempt_id: self.id,
            quiz_id: self.quiz.id,
            examinee: self.examinee.clone(),
            start_time: self.start_time,
            end_time: self.end_time,
            grade: self.total_grade(),
            total_grade: self.quiz.total_points(),
            solutions: self.solutions.clone(),
        })
    }

    /// Reduced view for the examinee: hidden test cases stay hidden
    pub fn examinee_view(&self) -> AttemptView {
        let solutions = self
            .solutions
            .iter()
            .map(|s| ExamineeSolutionView {
                solution_id: s.id,
                question_id: s.question_id,
                received_grade: s.received_grade,
                passed: s.passed_count(),
                total: s.evaluation_results.len(),
                results: s
                    .evaluation_results
                    .iter()
                    .map(|r| ExamineeCaseView {
                        number: r.test_case.number,
                        is_successful: r.is_successful,
                    })
                    .collect(),
            })
            .collect();

        AttemptView::Examinee(ExamineeAttemptView {
            attempt_id: self.id,
            quiz_id: self.quiz.id,
            quiz_title: self.quiz.title.clone(),
            start_time: self.start_time,
            end_time: self.end_time,
            grade: self.total_grade(),
            total_grade: self.quiz.total_points(),
            solutions,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExaminerAttemptView {
    pub attempt_id: Uuid,
    pub quiz_id: Uuid,
    pub examinee: Participant,
    pub start_time: DateTime<Utc>,
    pub end_time: Option<DateTime<Utc>>,
    pub grade: f64,
    pub total_grade: f64,
    pub solutions: Vec<Solution>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExamineeCaseView {
    pub number: u32,
    pub is_successful: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExamineeSolutionView {
    pub solution_id: Uuid,
    pub question_id: Uuid,
    pub received_grade: Option<f64>,
    pub passed: usize,
    pub total: usize,
    pub results: Vec<ExamineeCaseView>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExamineeAttemptView {
    pub attempt_id: Uuid,
    pub quiz_id: Uuid,
    pub quiz_title: String,
    pub start_time: DateTime<Utc>,
    pub end_time: Option<DateTime<Utc>>,
    pub grade: f64,
    pub total_grade: f64,
    pub solutions: Vec<ExamineeSolutionView>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "audience", rename_all = "snake_case")]
pub enum AttemptView {
    Examiner(ExaminerAttemptView),
    Examinee(ExamineeAttemptView),
}

/// "Grade this submitted attempt"
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EvaluationJob {
    pub attempt_id: Uuid,
    pub examinee_id: Uuid,
    pub examiner_id: Uuid,
    pub quiz_id: Uuid,
    pub enqueued_at: DateTime<Utc>,
}

impl EvaluationJob {
    pub fn new(attempt_id: Uuid, examinee_id: Uuid, examiner_id: Uuid, quiz_id: Uuid) -> Self {
        Self {
            attempt_id,
            examinee_id,
            examiner_id,
            quiz_id,
            enqueued_at: Utc::now(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QuizStatistics {
    pub quiz_id: Uuid,
    pub attempt_count: usize,
    pub submitted_count: usize,
    pub average_score: Option<f64>,
}

impl QuizStatistics {
    /// Average is taken over submitted attempts that have at least one grade
    pub fn from_attempts(quiz_id: Uuid, attempts: &[Attempt]) -> Self {
        let submitted: Vec<&Attempt> = attempts.iter().filter(|a| a.is_submitted()).collect();
        let graded: Vec<f64> = submitted
            .iter()
            .filter(|a| a.solutions.iter().any(|s| s.received_grade.is_some()))
            .map(|a| a.total_grade())
            .collect();

        let average_score = if graded.is_empty() {
            None
        } else {
            Some(graded.iter().sum::<f64>() / graded.len() as f64)
        };

        Self {
            quiz_id,
            attempt_count: attempts.len(),
            submitted_count: submitted.len(),
            average_score,
        }
    }
}

/// Events published to the real-time notification sink
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EventKind {
    EvaluationStarted,
    SystemGradingComplete,
    AiAssessmentComplete,
    EvaluationFailed,
    AttemptAutoSubmitted,
    QuizUpdated,
}

impl EventKind {
    pub fn status(&self) -> &'static str {
        match self {
            EventKind::EvaluationStarted => "evaluating",
            EventKind::SystemGradingComplete => "system_graded",
            EventKind::AiAssessmentComplete => "ai_assessed",
            EventKind::EvaluationFailed => "failed",
            EventKind::AttemptAutoSubmitted => "auto_submitted",
            EventKind::QuizUpdated => "updated",
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let name = match self {
            EventKind::EvaluationStarted => "EvaluationStarted",
            EventKind::SystemGradingComplete => "SystemGradingComplete",
            EventKind::AiAssessmentComplete => "AiAssessmentComplete",
            EventKind::EvaluationFailed => "EvaluationFailed",
            EventKind::AttemptAutoSubmitted => "AttemptAutoSubmitted",
            EventKind::QuizUpdated => "QuizUpdated",
        };
        write!(f, "{}", name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Topic {
    User(Uuid),
    Quiz(Uuid),
}

impl fmt::Display for Topic {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Topic::User(id) => write!(f, "user:{}", id),
            Topic::Quiz(id) => write!(f, "quiz:{}", id),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Notification {
    pub event: EventKind,
    pub quiz_id: Uuid,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attempt_id: Option<Uuid>,
    pub status: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attempt: Option<AttemptView>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub statistics: Option<QuizStatistics>,
}

impl Notification {
    pub fn new(event: EventKind, quiz_id: Uuid, attempt_id: Option<Uuid>) -> Self {
        Self {
            event,
            quiz_id,
            attempt_id,
            status: event.status().to_string(),
            message: None,
            attempt: None,
            statistics: None,
        }
    }

    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }

    pub fn with_attempt(mut self, view: AttemptView) -> Self {
        self.attempt = Some(view);
        self
    }

    pub fn with_statistics(mut self, statistics: QuizStatistics) -> Self {
        self.statistics = Some(statistics);
        self
    }
}

/// Request handed to the mail collaborator once an attempt is fully graded
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeedbackEmail {
    pub email: String,
    pub name: String,
    pub quiz_title: String,
    pub grade: f64,
    pub total_grade: f64,
    pub start: DateTime<Utc>,
    pub finish: DateTime<Utc>,
}

impl FeedbackEmail {
    /// `None` while the attempt has no end time
    pub fn for_attempt(attempt: &Attempt) -> Option<Self> {
        let finish = attempt.end_time?;
        Some(Self {
            email: attempt.examinee.email.clone(),
            name: attempt.examinee.name.clone(),
            quiz_title: attempt.quiz.title.clone(),
            grade: attempt.total_grade(),
            total_grade: attempt.quiz.total_points(),
            start: attempt.start_time,
            finish,
        })
    }
}

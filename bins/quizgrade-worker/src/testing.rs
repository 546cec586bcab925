// In-memory collaborators and fixtures for worker and monitor tests

use crate::services::{AttemptStore, JobSource, Mailer, NotificationSink, SolutionAssessor};
use anyhow::{anyhow, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use quizgrade_common::types::{
    AiAssessment, Attempt, EvaluationJob, EventKind, FeedbackEmail, Notification, Participant,
    Question, QuestionConfig, Quiz, Solution, TestCase, Topic,
};
use quizgrade_sandbox::error::RunnerError;
use quizgrade_sandbox::evaluator::Evaluator;
use quizgrade_sandbox::factory::RunnerFactory;
use quizgrade_sandbox::runner::{CodeRunner, CodeRunnerOptions, CodeRunnerResult};
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex};
use uuid::Uuid;

#[derive(Default)]
pub struct MemoryStore {
    attempts: Mutex<HashMap<Uuid, Attempt>>,
    pub batches: Mutex<Vec<Vec<Uuid>>>,
    racing_writes: Mutex<Vec<Attempt>>,
}

impl MemoryStore {
    pub fn with(attempts: impl IntoIterator<Item = Attempt>) -> Arc<Self> {
        let store = Self::default();
        {
            let mut map = store.attempts.lock().unwrap();
            for attempt in attempts {
                map.insert(attempt.id, attempt);
            }
        }
        Arc::new(store)
    }

    pub fn get(&self, id: Uuid) -> Option<Attempt> {
        self.attempts.lock().unwrap().get(&id).cloned()
    }

    /// Store `attempt` right after the next open-attempt scan has been read,
    /// as a write racing the scan would
    pub fn write_after_next_scan(&self, attempt: Attempt) {
        self.racing_writes.lock().unwrap().push(attempt);
    }
}

#[async_trait]
impl AttemptStore for MemoryStore {
    async fn load_attempt(&self, attempt_id: Uuid) -> Result<Option<Attempt>> {
        Ok(self.get(attempt_id))
    }

    async fn save_attempt(&self, attempt: &Attempt) -> Result<()> {
        self.attempts.lock().unwrap().insert(attempt.id, attempt.clone());
        Ok(())
    }

    async fn load_open_attempts(&self) -> Result<Vec<Attempt>> {
        let mut map = self.attempts.lock().unwrap();
        let open = map.values().filter(|a| a.end_time.is_none()).cloned().collect();
        for attempt in self.racing_writes.lock().unwrap().drain(..) {
            map.insert(attempt.id, attempt);
        }
        Ok(open)
    }

    async fn close_attempts(&self, closures: &[(Uuid, DateTime<Utc>)]) -> Result<Vec<Uuid>> {
        let mut map = self.attempts.lock().unwrap();
        let mut closed = Vec::new();
        for (id, end_time) in closures {
            if let Some(attempt) = map.get_mut(id).filter(|a| a.end_time.is_none()) {
                attempt.end_time = Some(*end_time);
                closed.push(*id);
            }
        }
        self.batches.lock().unwrap().push(closures.iter().map(|(id, _)| *id).collect());
        Ok(closed)
    }

    async fn load_quiz_attempts(&self, quiz_id: Uuid) -> Result<Vec<Attempt>> {
        Ok(self
            .attempts
            .lock()
            .unwrap()
            .values()
            .filter(|a| a.quiz.id == quiz_id)
            .cloned()
            .collect())
    }
}

/// Hands out a fixed list of jobs, then reports empty polls
#[derive(Default)]
pub struct ScriptedJobSource {
    jobs: Mutex<VecDeque<Result<EvaluationJob>>>,
    pub polls: Mutex<usize>,
}

impl ScriptedJobSource {
    pub fn with(jobs: impl IntoIterator<Item = Result<EvaluationJob>>) -> Arc<Self> {
        Arc::new(Self {
            jobs: Mutex::new(jobs.into_iter().collect()),
            polls: Mutex::new(0),
        })
    }
}

#[async_trait]
impl JobSource for ScriptedJobSource {
    async fn next_job(&self) -> Result<Option<EvaluationJob>> {
        *self.polls.lock().unwrap() += 1;
        let next = self.jobs.lock().unwrap().pop_front();
        match next {
            Some(job) => job.map(Some),
            None => {
                // An empty BLPOP returns after its poll timeout
                tokio::time::sleep(std::time::Duration::from_millis(50)).await;
                Ok(None)
            }
        }
    }
}

#[derive(Default)]
pub struct RecordingSink {
    pub published: Mutex<Vec<(Topic, Notification)>>,
    pub fail: bool,
}

impl RecordingSink {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn failing() -> Arc<Self> {
        Arc::new(Self {
            fail: true,
            ..Default::default()
        })
    }

    pub fn events_for(&self, topic: Topic) -> Vec<EventKind> {
        self.published
            .lock()
            .unwrap()
            .iter()
            .filter(|(t, _)| *t == topic)
            .map(|(_, n)| n.event)
            .collect()
    }

    pub fn last(&self, topic: Topic, event: EventKind) -> Option<Notification> {
        self.published
            .lock()
            .unwrap()
            .iter()
            .rev()
            .find(|(t, n)| *t == topic && n.event == event)
            .map(|(_, n)| n.clone())
    }
}

#[async_trait]
impl NotificationSink for RecordingSink {
    async fn publish(&self, topic: &Topic, notification: &Notification) -> Result<()> {
        if self.fail {
            return Err(anyhow!("hub unavailable"));
        }
        self.published
            .lock()
            .unwrap()
            .push((*topic, notification.clone()));
        Ok(())
    }
}

#[derive(Default)]
pub struct RecordingMailer {
    pub sent: Mutex<Vec<FeedbackEmail>>,
}

#[async_trait]
impl Mailer for RecordingMailer {
    async fn send_attempt_feedback(&self, email: &FeedbackEmail) -> Result<()> {
        self.sent.lock().unwrap().push(email.clone());
        Ok(())
    }
}

/// Approves every solution except the ones it is told to fail on
#[derive(Default)]
pub struct ScriptedAssessor {
    pub failing: HashSet<Uuid>,
    pub calls: Mutex<Vec<Uuid>>,
}

impl ScriptedAssessor {
    pub fn failing_for(ids: impl IntoIterator<Item = Uuid>) -> Arc<Self> {
        Arc::new(Self {
            failing: ids.into_iter().collect(),
            ..Default::default()
        })
    }
}

#[async_trait]
impl SolutionAssessor for ScriptedAssessor {
    async fn assess(
        &self,
        solution: &Solution,
        _question: &Question,
        _config: &QuestionConfig,
    ) -> Result<AiAssessment> {
        self.calls.lock().unwrap().push(solution.id);
        if self.failing.contains(&solution.id) {
            return Err(anyhow!("assessment service timed out"));
        }
        Ok(AiAssessment {
            is_valid: true,
            confidence_score: 0.9,
            reasoning: "Solution reads input and prints the expected result".to_string(),
            flags: Vec::new(),
            suggested_grade: None,
        })
    }
}

/// "python" runner answering from a table of known programs
#[derive(Default)]
pub struct ScriptedRunner {
    programs: HashMap<String, CodeRunnerResult>,
    pub runs: Mutex<Vec<(String, Vec<String>)>>,
}

impl ScriptedRunner {
    pub fn program(mut self, code: &str, result: CodeRunnerResult) -> Self {
        self.programs.insert(code.to_string(), result);
        self
    }
}

#[async_trait]
impl CodeRunner for ScriptedRunner {
    fn language(&self) -> &str {
        "python"
    }

    fn extension(&self) -> &str {
        ".py"
    }

    async fn run_code(
        &self,
        code: &str,
        options: &CodeRunnerOptions,
    ) -> Result<CodeRunnerResult, RunnerError> {
        self.runs
            .lock()
            .unwrap()
            .push((code.to_string(), options.input.clone()));
        Ok(self
            .programs
            .get(code)
            .cloned()
            .unwrap_or_else(|| CodeRunnerResult::failed("NameError: name is not defined")))
    }
}

pub fn evaluator(runner: Arc<ScriptedRunner>) -> Arc<Evaluator> {
    let runners: Vec<Arc<dyn CodeRunner>> = vec![runner];
    Arc::new(Evaluator::new(Arc::new(RunnerFactory::unsandboxed(runners))))
}

pub fn test_case(number: u32, input: &[&str], expected_output: &str) -> TestCase {
    TestCase {
        number,
        input: input.iter().map(|s| s.to_string()).collect(),
        expected_output: expected_output.to_string(),
    }
}

pub fn question(language: &str, points: f64, test_cases: Vec<TestCase>) -> Question {
    Question {
        id: Uuid::new_v4(),
        title: "Echo".to_string(),
        points,
        language: language.to_string(),
        test_cases,
        config: QuestionConfig::default(),
    }
}

pub fn quiz(duration_minutes: i64, questions: Vec<Question>) -> Quiz {
    Quiz {
        id: Uuid::new_v4(),
        title: "Intro to Programming".to_string(),
        examiner_id: Uuid::new_v4(),
        duration_minutes,
        end_date: None,
        questions,
    }
}

pub fn solution(question: &Question, code: &str) -> Solution {
    Solution {
        id: Uuid::new_v4(),
        question_id: question.id,
        code: code.to_string(),
        received_grade: None,
        evaluated_by: None,
        evaluation_results: Vec::new(),
        ai_assessment: None,
    }
}

pub fn attempt(
    quiz: Quiz,
    solutions: Vec<Solution>,
    start_time: DateTime<Utc>,
    end_time: Option<DateTime<Utc>>,
) -> Attempt {
    Attempt {
        id: Uuid::new_v4(),
        quiz,
        examinee: Participant {
            id: Uuid::new_v4(),
            name: "Ada".to_string(),
            email: "ada@example.com".to_string(),
        },
        start_time,
        end_time,
        solutions,
    }
}

/// Test Evaluator - Per-Test-Case Judging
///
/// **Core Responsibility:**
/// Run one solution against one test case through a sandboxed runner and
/// decide pass/fail.
///
/// **Judging Rule:**
/// A test case passes iff the runner reports success AND the trimmed output
/// equals the trimmed expected output.
/// - Trim leading/trailing whitespace: YES
/// - Case sensitivity: YES (exact match required)
/// - Floating-point tolerance: NO
///
/// Execution failures (non-zero exit, timeout, sandbox fault) never escape as
/// errors; they become a failed `EvaluationResult` carrying whatever was
/// captured. Only an unknown language is reported as an error.

use crate::error::RunnerError;
use crate::factory::RunnerFactory;
use crate::runner::{CodeRunnerOptions, CodeRunnerResult};
use quizgrade_common::types::{EvaluationResult, TestCase};
use std::sync::Arc;
use tracing::{debug, warn};

fn normalize_output(output: &str) -> &str {
    output.trim()
}

/// Pure judging step: runner result + test case -> evaluation result
pub fn judge(test_case: &TestCase, result: &CodeRunnerResult) -> EvaluationResult {
    let output = result.output.clone().unwrap_or_default();
    let is_successful = result.success
        && normalize_output(&output) == normalize_output(&test_case.expected_output);

    EvaluationResult {
        test_case: test_case.clone(),
        output,
        error: result.error.clone(),
        is_successful,
    }
}

pub struct Evaluator {
    factory: Arc<RunnerFactory>,
}

impl Evaluator {
    pub fn new(factory: Arc<RunnerFactory>) -> Self {
        Self { factory }
    }

    pub fn factory(&self) -> &RunnerFactory {
        &self.factory
    }

    pub async fn evaluate(
        &self,
        language: &str,
        code: &str,
        test_case: &TestCase,
    ) -> Result<EvaluationResult, RunnerError> {
        let runner = self.factory.create(language, true)?;
        let options = CodeRunnerOptions::with_input(test_case.input.clone());

        let result = match runner.run_code(code, &options).await {
            Ok(result) => result,
            Err(e) => {
                warn!(language = %language, test_case = test_case.number, error = %e, "Execution failed; test case marked as failed");
                CodeRunnerResult::failed(e.to_string())
            }
        };

        let evaluation = judge(test_case, &result);
        debug!(
            language = %language,
            test_case = test_case.number,
            passed = evaluation.is_successful,
            timed_out = result.timed_out,
            "Test case evaluated"
        );

        Ok(evaluation)
    }
}

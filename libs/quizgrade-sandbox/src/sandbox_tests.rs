/// End-to-end sandbox tests against a real Docker daemon
///
/// These exercise the whole path: staging, container creation, stdin
/// feeding, deadline enforcement and cleanup.

#[cfg(test)]
mod docker_sandbox_tests {
    use crate::docker::DockerRuntime;
    use crate::evaluator::Evaluator;
    use crate::factory::RunnerFactory;
    use crate::runner::{builtin_runners, CodeRunnerOptions};
    use crate::sandbox::{SandboxExecutor, SandboxedCodeRunner};
    use quizgrade_common::config::SandboxConfiguration;
    use quizgrade_common::types::TestCase;
    use std::sync::Arc;

    fn docker_factory(timeout_seconds: u64) -> (Arc<RunnerFactory>, tempfile::TempDir) {
        let staging = tempfile::tempdir().expect("Failed to create staging dir");

        let config_path = std::path::Path::new(env!("CARGO_MANIFEST_DIR")).join("../../config/sandbox.json");
        let mut config = SandboxConfiguration::load(&config_path)
            .expect("Failed to load sandbox config")
            .with_temp_directory(staging.path().to_path_buf());
        config.timeout_seconds = timeout_seconds;

        let runtime = DockerRuntime::connect().expect("Failed to connect to Docker");
        let executor = Arc::new(SandboxExecutor::new(Arc::new(runtime), Arc::new(config)));
        let factory = RunnerFactory::new(
            builtin_runners(staging.path(), None),
            SandboxedCodeRunner::wrapper(executor),
        );

        (Arc::new(factory), staging)
    }

    /// Test: stdin lines reach the program and stdout comes back
    #[tokio::test]
    #[ignore] // Requires Docker
    async fn test_python_reads_input() {
        let (factory, _staging) = docker_factory(5);
        let evaluator = Evaluator::new(factory);

        let test_case = TestCase {
            number: 1,
            input: vec!["5".to_string(), "7".to_string()],
            expected_output: "12".to_string(),
        };

        let result = evaluator
            .evaluate("python", "a = int(input())\nb = int(input())\nprint(a + b)\n", &test_case)
            .await
            .expect("Evaluation failed");

        assert!(result.is_successful, "unexpected result: {:?}", result);
    }

    /// Test: runtime errors surface stderr and fail the run
    #[tokio::test]
    #[ignore] // Requires Docker
    async fn test_python_runtime_error() {
        let (factory, _staging) = docker_factory(5);
        let runner = factory.create("python", true).expect("python registered");

        let result = runner
            .run_code("raise ValueError('boom')", &CodeRunnerOptions::default())
            .await
            .expect("Run failed");

        assert!(!result.success);
        assert!(result.error.unwrap_or_default().contains("ValueError"));
    }

    /// Test: an infinite loop is cut off at the deadline
    #[tokio::test]
    #[ignore] // Requires Docker
    async fn test_infinite_loop_times_out() {
        let (factory, staging) = docker_factory(1);
        let runner = factory.create("python", true).expect("python registered");

        let result = runner
            .run_code("while True:\n    pass\n", &CodeRunnerOptions::default())
            .await
            .expect("Run failed");

        assert!(!result.success);
        assert!(result.timed_out);

        // Staged file is gone once the run returns
        let leftover = std::fs::read_dir(staging.path()).expect("staging dir").count();
        assert_eq!(leftover, 0);
    }

    /// Test: no network inside the container
    #[tokio::test]
    #[ignore] // Requires Docker
    async fn test_network_is_disabled() {
        let (factory, _staging) = docker_factory(5);
        let runner = factory.create("python", true).expect("python registered");

        let code = r#"
import socket
try:
    socket.create_connection(("1.1.1.1", 53), timeout=2)
    print("connected")
except OSError:
    print("blocked")
"#;
        let result = runner
            .run_code(code, &CodeRunnerOptions::default())
            .await
            .expect("Run failed");

        assert_eq!(result.output.as_deref(), Some("blocked"));
    }
}

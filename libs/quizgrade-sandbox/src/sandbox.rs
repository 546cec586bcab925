/// Sandbox Executor - Isolated Code Execution
///
/// **Responsibility:**
/// Run a runner's code inside an isolated, resource-capped, time-capped
/// container and report the outcome as a `SandboxResult`.
///
/// **Lifecycle per execution:**
/// 1. Stage the code file (language prefix applied) under a unique name
/// 2. Create a container with the staged file bind-mounted read-only
/// 3. Feed stdin, collect output under a hard wall-clock deadline
/// 4. Force-remove the container and delete the staged file, whatever happened
///
/// Sandboxing is opportunistic per language: a runner whose language has no
/// `LanguageSandboxConfig` falls back to running directly.

use crate::error::{RunnerError, SandboxError};
use crate::factory::RunnerWrapper;
use crate::runner::{output_limit_message, CodeRunner, CodeRunnerOptions, CodeRunnerResult, TIMEOUT_MESSAGE};
use async_trait::async_trait;
use quizgrade_common::config::{LanguageSandboxConfig, SandboxConfiguration};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Added to the configured timeout to absorb container start-up latency
pub const STARTUP_GRACE: Duration = Duration::from_secs(10);

/// Directory inside the container where the staged file is mounted
pub const SANDBOX_MOUNT_DIR: &str = "/sandbox";

/// Safety limits to keep pathological submissions away from the runtime
pub const MAX_SOURCE_CODE_BYTES: usize = 1024 * 1024; // 1MB
pub const MAX_TEST_INPUT_BYTES: usize = 10 * 1024 * 1024; // 10MB
pub const MAX_OUTPUT_BYTES: usize = 1024 * 1024; // 1MB per stream

/// What the executor asks of the container runtime
#[derive(Debug, Clone, PartialEq)]
pub struct SandboxRequest {
    pub image: String,
    pub command: String,
    pub arguments: Vec<String>,
    pub host_path: PathBuf,
    pub container_path: String,
    pub input: Vec<String>,
    pub timeout: Duration,
    pub memory_limit_bytes: i64,
    pub cpu_quota_nanos: i64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SandboxResult {
    pub success: bool,
    pub output: Option<String>,
    pub error: Option<String>,
    pub timed_out: bool,
}

impl SandboxResult {
    pub fn timed_out() -> Self {
        Self {
            success: false,
            output: None,
            error: Some(TIMEOUT_MESSAGE.to_string()),
            timed_out: true,
        }
    }

    /// Classify a finished container by its exit code
    pub fn from_output(output: ContainerOutput) -> Self {
        let stdout = output.stdout.trim().to_string();
        let stderr = output.stderr.trim().to_string();

        if output.truncated {
            return Self {
                success: false,
                output: Some(stdout),
                error: Some(output_limit_message()),
                timed_out: false,
            };
        }

        if output.exit_code == 0 {
            return Self {
                success: true,
                output: Some(stdout),
                error: None,
                timed_out: false,
            };
        }

        let mut error = if stderr.is_empty() { stdout.clone() } else { stderr };
        if output.exit_code == 137 {
            error.push_str("\n[Container killed: likely exceeded memory limit]");
        }

        Self {
            success: false,
            output: Some(stdout),
            error: Some(error),
            timed_out: false,
        }
    }
}

impl From<SandboxResult> for CodeRunnerResult {
    fn from(result: SandboxResult) -> Self {
        CodeRunnerResult {
            success: result.success,
            output: result.output,
            error: result.error,
            timed_out: result.timed_out,
        }
    }
}

/// Raw streams and exit code of a container that ran to completion
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerOutput {
    pub exit_code: i64,
    pub stdout: String,
    pub stderr: String,
    /// A stream went past `MAX_OUTPUT_BYTES` and was cut
    pub truncated: bool,
}

/// Contract the executor needs from an isolation backend
#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    /// Create (but do not start) an isolated environment; returns its id
    async fn create(&self, request: &SandboxRequest) -> Result<String, SandboxError>;

    /// Attach, start, stream `input` to stdin, collect output and wait for exit
    async fn execute(&self, container_id: &str, input: &[String]) -> Result<ContainerOutput, SandboxError>;

    /// Forced removal; may fail if the environment already removed itself
    async fn remove(&self, container_id: &str) -> Result<(), SandboxError>;
}

pub struct SandboxExecutor {
    runtime: Arc<dyn ContainerRuntime>,
    config: Arc<SandboxConfiguration>,
    startup_grace: Duration,
}

impl SandboxExecutor {
    pub fn new(runtime: Arc<dyn ContainerRuntime>, config: Arc<SandboxConfiguration>) -> Self {
        Self {
            runtime,
            config,
            startup_grace: STARTUP_GRACE,
        }
    }

    pub fn config(&self) -> &SandboxConfiguration {
        &self.config
    }

    pub fn language_config(&self, language: &str) -> Option<&LanguageSandboxConfig> {
        self.config.language_config(language)
    }

    /// Wall-clock ceiling for one execution
    pub fn deadline(&self) -> Duration {
        Duration::from_secs(self.config.timeout_seconds) + self.startup_grace
    }

    /// Stage `code` and run it in a fresh container
    pub async fn run(
        &self,
        language: &LanguageSandboxConfig,
        code: &str,
        input: &[String],
    ) -> Result<SandboxResult, SandboxError> {
        if code.len() > MAX_SOURCE_CODE_BYTES {
            return Err(SandboxError::Rejected(format!(
                "source code exceeds {} bytes",
                MAX_SOURCE_CODE_BYTES
            )));
        }
        let input_bytes: usize = input.iter().map(|line| line.len() + 1).sum();
        if input_bytes > MAX_TEST_INPUT_BYTES {
            return Err(SandboxError::Rejected(format!(
                "test input exceeds {} bytes",
                MAX_TEST_INPUT_BYTES
            )));
        }

        let host_path = self.stage(language, code).await?;
        let request = self.request_for(language, &host_path, input);
        let result = self.execute(&request).await;

        if let Err(e) = tokio::fs::remove_file(&host_path).await {
            warn!(path = %host_path.display(), error = %e, "Failed to delete staged code file");
        }

        result
    }

    async fn stage(&self, language: &LanguageSandboxConfig, code: &str) -> Result<PathBuf, SandboxError> {
        let dir = &self.config.temp_directory;
        tokio::fs::create_dir_all(dir).await?;

        let path = dir.join(format!("{}{}", uuid::Uuid::new_v4().simple(), language.file_extension));
        if let Err(e) = tokio::fs::write(&path, language.staged_source(code)).await {
            // A failed write can leave a partial file behind
            if let Err(cleanup) = tokio::fs::remove_file(&path).await {
                debug!(path = %path.display(), error = %cleanup, "No partial staged file to remove");
            }
            return Err(e.into());
        }
        Ok(path)
    }

    pub fn request_for(
        &self,
        language: &LanguageSandboxConfig,
        host_path: &Path,
        input: &[String],
    ) -> SandboxRequest {
        let file_name = host_path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_default();
        let container_path = format!("{}/{}", SANDBOX_MOUNT_DIR, file_name);

        SandboxRequest {
            image: language.image.clone(),
            command: language.command.clone(),
            arguments: language.render_arguments(&container_path),
            host_path: host_path.to_path_buf(),
            container_path,
            input: input.to_vec(),
            timeout: Duration::from_secs(self.config.timeout_seconds),
            memory_limit_bytes: self.config.memory_limit_bytes,
            cpu_quota_nanos: self.config.cpu_quota_nanos,
        }
    }

    /// Container lifecycle with a hard deadline and guaranteed removal
    pub async fn execute(&self, request: &SandboxRequest) -> Result<SandboxResult, SandboxError> {
        let container_id = self.runtime.create(request).await?;
        let deadline = request.timeout + self.startup_grace;
        debug!(container_id = %container_id, image = %request.image, deadline_ms = deadline.as_millis() as u64, "Sandbox container created");

        let outcome = tokio::time::timeout(deadline, self.runtime.execute(&container_id, &request.input)).await;

        // The container may already be gone; nothing to do about it here
        if let Err(e) = self.runtime.remove(&container_id).await {
            debug!(container_id = %container_id, error = %e, "Container removal failed");
        }

        match outcome {
            Ok(Ok(output)) => {
                debug!(container_id = %container_id, exit_code = output.exit_code, "Sandbox execution finished");
                Ok(SandboxResult::from_output(output))
            }
            Ok(Err(e)) => Err(e),
            Err(_) => {
                warn!(container_id = %container_id, deadline_ms = deadline.as_millis() as u64, "Sandbox execution timed out");
                Ok(SandboxResult::timed_out())
            }
        }
    }

    #[cfg(test)]
    fn with_startup_grace(mut self, grace: Duration) -> Self {
        self.startup_grace = grace;
        self
    }
}

/// Decorator running an inner runner's language inside the sandbox
pub struct SandboxedCodeRunner {
    inner: Arc<dyn CodeRunner>,
    executor: Arc<SandboxExecutor>,
}

impl SandboxedCodeRunner {
    pub fn new(inner: Arc<dyn CodeRunner>, executor: Arc<SandboxExecutor>) -> Self {
        Self { inner, executor }
    }

    /// Wrapper for `RunnerFactory::new`
    pub fn wrapper(executor: Arc<SandboxExecutor>) -> RunnerWrapper {
        Arc::new(move |inner: Arc<dyn CodeRunner>| {
            Arc::new(SandboxedCodeRunner::new(inner, executor.clone())) as Arc<dyn CodeRunner>
        })
    }
}

#[async_trait]
impl CodeRunner for SandboxedCodeRunner {
    fn language(&self) -> &str {
        self.inner.language()
    }

    fn extension(&self) -> &str {
        self.inner.extension()
    }

    async fn run_code(
        &self,
        code: &str,
        options: &CodeRunnerOptions,
    ) -> Result<CodeRunnerResult, RunnerError> {
        let language = self.inner.language();

        let Some(config) = self.executor.language_config(language) else {
            warn!(language = %language, "No sandbox configured for language; running without isolation");
            return self.inner.run_code(code, options).await;
        };

        info!(language = %language, image = %config.image, input_lines = options.input.len(), "Running code in sandbox");

        let result = self
            .executor
            .run(config, code, &options.input)
            .await
            .map_err(|e| RunnerError::execution(language, e))?;

        Ok(CodeRunnerResult::from(result).captured(options.capture_output))
    }
}

/// Language Runners - Local Process Execution
///
/// A runner executes one language's source code as a child process:
/// stage the code in a uniquely named file, spawn the interpreter, feed stdin,
/// collect trimmed stdout/stderr, then delete the file.
///
/// Runners are data-driven. Each built-in language is a `ProcessSpec`
/// registered with the factory, so a new language never touches the factory.

use crate::error::RunnerError;
use crate::sandbox::MAX_OUTPUT_BYTES;
use async_trait::async_trait;
use serde::Serialize;
use std::io;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::process::{ChildStdin, Command};
use tracing::{debug, warn};

pub const TIMEOUT_MESSAGE: &str = "Execution timed out";

pub fn output_limit_message() -> String {
    format!("Output exceeded {} bytes", MAX_OUTPUT_BYTES)
}

/// One output stream, kept up to `MAX_OUTPUT_BYTES`; the rest is dropped
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct CappedOutput {
    bytes: Vec<u8>,
    truncated: bool,
}

impl CappedOutput {
    pub fn push(&mut self, chunk: &[u8]) {
        let room = MAX_OUTPUT_BYTES.saturating_sub(self.bytes.len());
        if chunk.len() > room {
            self.truncated = true;
        }
        self.bytes.extend_from_slice(&chunk[..chunk.len().min(room)]);
    }

    pub fn is_truncated(&self) -> bool {
        self.truncated
    }

    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.bytes).to_string()
    }
}

/// Read a stream to EOF, keeping at most `MAX_OUTPUT_BYTES`. Reading goes on
/// past the cap so the writer never blocks on a full pipe.
async fn read_capped<R: AsyncRead + Unpin>(reader: Option<R>) -> io::Result<CappedOutput> {
    let mut captured = CappedOutput::default();
    let Some(mut reader) = reader else {
        return Ok(captured);
    };

    let mut buf = [0u8; 8192];
    loop {
        let n = reader.read(&mut buf).await?;
        if n == 0 {
            return Ok(captured);
        }
        captured.push(&buf[..n]);
    }
}

/// Per-execution options
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CodeRunnerOptions {
    pub capture_output: bool,
    pub input: Vec<String>,
}

impl Default for CodeRunnerOptions {
    fn default() -> Self {
        Self {
            capture_output: true,
            input: Vec::new(),
        }
    }
}

impl CodeRunnerOptions {
    pub fn with_input(input: Vec<String>) -> Self {
        Self {
            capture_output: true,
            input,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CodeRunnerResult {
    pub success: bool,
    pub output: Option<String>,
    pub error: Option<String>,
    pub timed_out: bool,
}

impl CodeRunnerResult {
    pub fn succeeded(output: impl Into<String>) -> Self {
        Self {
            success: true,
            output: Some(output.into()),
            error: None,
            timed_out: false,
        }
    }

    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            success: false,
            output: None,
            error: Some(error.into()),
            timed_out: false,
        }
    }

    pub fn timed_out() -> Self {
        Self {
            success: false,
            output: None,
            error: Some(TIMEOUT_MESSAGE.to_string()),
            timed_out: true,
        }
    }

    /// Drop captured streams when the caller did not ask for them
    pub fn captured(mut self, capture: bool) -> Self {
        if !capture {
            self.output = None;
            self.error = None;
        }
        self
    }
}

/// Executes code for exactly one language
#[async_trait]
pub trait CodeRunner: Send + Sync {
    fn language(&self) -> &str;

    fn extension(&self) -> &str;

    async fn run_code(
        &self,
        code: &str,
        options: &CodeRunnerOptions,
    ) -> Result<CodeRunnerResult, RunnerError>;
}

/// Which stream becomes `error` on a non-zero exit
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorStream {
    Stdout,
    Stderr,
}

#[derive(Debug, Clone)]
pub struct ProcessSpec {
    pub language: String,
    pub extension: String,
    pub program: String,
    pub args: Vec<String>,
    pub code_prefix: Option<String>,
    pub error_stream: ErrorStream,
}

impl ProcessSpec {
    pub fn new(language: &str, extension: &str, program: &str) -> Self {
        Self {
            language: language.to_string(),
            extension: extension.to_string(),
            program: program.to_string(),
            args: Vec::new(),
            code_prefix: None,
            error_stream: ErrorStream::Stderr,
        }
    }

    pub fn arg(mut self, arg: &str) -> Self {
        self.args.push(arg.to_string());
        self
    }

    pub fn prefix(mut self, prefix: &str) -> Self {
        self.code_prefix = Some(prefix.to_string());
        self
    }

    pub fn errors_on(mut self, stream: ErrorStream) -> Self {
        self.error_stream = stream;
        self
    }
}

/// Built-in languages
pub fn builtin_specs() -> Vec<ProcessSpec> {
    vec![
        ProcessSpec::new("python", ".py", "python3").arg("-u"),
        // dotnet-script reports compilation errors on stdout
        ProcessSpec::new("csharp", ".csx", "dotnet-script")
            .prefix("#pragma warning disable CS1998, CS0168, CS0219")
            .errors_on(ErrorStream::Stdout),
        ProcessSpec::new("javascript", ".js", "node"),
        ProcessSpec::new("java", ".java", "java"),
    ]
}

pub fn builtin_runners(staging_dir: &Path, timeout: Option<Duration>) -> Vec<Arc<dyn CodeRunner>> {
    builtin_specs()
        .into_iter()
        .map(|spec| Arc::new(ProcessRunner::new(spec, staging_dir, timeout)) as Arc<dyn CodeRunner>)
        .collect()
}

/// Runs code as a local child process, without isolation
pub struct ProcessRunner {
    spec: ProcessSpec,
    staging_dir: PathBuf,
    timeout: Option<Duration>,
}

impl ProcessRunner {
    pub fn new(spec: ProcessSpec, staging_dir: &Path, timeout: Option<Duration>) -> Self {
        Self {
            spec,
            staging_dir: staging_dir.to_path_buf(),
            timeout,
        }
    }

    fn staged_path(&self) -> PathBuf {
        self.staging_dir
            .join(format!("{}{}", uuid::Uuid::new_v4().simple(), self.spec.extension))
    }

    async fn execute(
        &self,
        path: &Path,
        code: &str,
        options: &CodeRunnerOptions,
    ) -> io::Result<CodeRunnerResult> {
        tokio::fs::create_dir_all(&self.staging_dir).await?;
        let source = match &self.spec.code_prefix {
            Some(prefix) => format!("{}\n{}", prefix, code),
            None => code.to_string(),
        };
        tokio::fs::write(path, source).await?;

        let mut child = Command::new(&self.spec.program)
            .args(&self.spec.args)
            .arg(path)
            .current_dir(&self.staging_dir)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()?;

        // Feed stdin concurrently so a chatty child cannot deadlock on a full pipe
        let feeder = tokio::spawn(feed_input(child.stdin.take(), options.input.clone()));

        let stdout = child.stdout.take();
        let stderr = child.stderr.take();
        let collect = async {
            let (stdout, stderr) = tokio::try_join!(read_capped(stdout), read_capped(stderr))?;
            let status = child.wait().await?;
            Ok::<_, io::Error>((status, stdout, stderr))
        };

        let (status, stdout, stderr) = match self.timeout {
            Some(limit) => match tokio::time::timeout(limit, collect).await {
                Ok(collected) => collected?,
                Err(_) => {
                    warn!(language = %self.spec.language, timeout_ms = limit.as_millis() as u64, "Local execution timed out");
                    return Ok(CodeRunnerResult::timed_out());
                }
            },
            None => collect.await?,
        };

        match feeder.await {
            Ok(Err(e)) => debug!(language = %self.spec.language, error = %e, "Failed to write stdin"),
            Err(e) => debug!(language = %self.spec.language, error = %e, "Stdin feeder aborted"),
            Ok(Ok(())) => {}
        }

        let truncated = stdout.is_truncated() || stderr.is_truncated();
        let stdout = stdout.text().trim().to_string();
        let stderr = stderr.text().trim().to_string();

        let result = if truncated {
            warn!(language = %self.spec.language, limit = MAX_OUTPUT_BYTES, "Output limit exceeded");
            CodeRunnerResult {
                success: false,
                output: Some(stdout),
                error: Some(output_limit_message()),
                timed_out: false,
            }
        } else if status.success() {
            CodeRunnerResult::succeeded(stdout)
        } else {
            let (primary, fallback) = match self.spec.error_stream {
                ErrorStream::Stdout => (&stdout, &stderr),
                ErrorStream::Stderr => (&stderr, &stdout),
            };
            let error = if primary.is_empty() { fallback } else { primary };
            CodeRunnerResult {
                success: false,
                output: Some(stdout.clone()),
                error: Some(error.clone()),
                timed_out: false,
            }
        };

        Ok(result.captured(options.capture_output))
    }
}

/// Write every input line, then close stdin so the child sees EOF
async fn feed_input(stdin: Option<ChildStdin>, lines: Vec<String>) -> io::Result<()> {
    let Some(mut stdin) = stdin else {
        return Ok(());
    };

    for line in &lines {
        let written = async {
            stdin.write_all(line.as_bytes()).await?;
            stdin.write_all(b"\n").await
        }
        .await;

        match written {
            // The child may exit without reading its input
            Err(e) if e.kind() == io::ErrorKind::BrokenPipe => return Ok(()),
            other => other?,
        }
    }

    stdin.shutdown().await.or_else(|e| {
        if e.kind() == io::ErrorKind::BrokenPipe {
            Ok(())
        } else {
            Err(e)
        }
    })
}

#[async_trait]
impl CodeRunner for ProcessRunner {
    fn language(&self) -> &str {
        &self.spec.language
    }

    fn extension(&self) -> &str {
        &self.spec.extension
    }

    async fn run_code(
        &self,
        code: &str,
        options: &CodeRunnerOptions,
    ) -> Result<CodeRunnerResult, RunnerError> {
        let path = self.staged_path();
        let result = self.execute(&path, code, options).await;

        if let Err(e) = tokio::fs::remove_file(&path).await {
            if e.kind() != io::ErrorKind::NotFound {
                warn!(path = %path.display(), error = %e, "Failed to delete staged code file");
            }
        }

        result.map_err(|e| RunnerError::execution(&self.spec.language, e))
    }
}

use thiserror::Error;

type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Errors surfaced by language runners and the runner factory
#[derive(Debug, Error)]
pub enum RunnerError {
    #[error("unsupported language: {0}")]
    UnsupportedLanguage(String),

    #[error("failed to execute {language} code")]
    Execution {
        language: String,
        #[source]
        source: BoxError,
    },
}

impl RunnerError {
    pub fn execution(language: &str, source: impl Into<BoxError>) -> Self {
        RunnerError::Execution {
            language: language.to_string(),
            source: source.into(),
        }
    }
}

/// Infrastructure faults of the sandbox layer
///
/// Timeouts and non-zero exits are not errors: they come back as a
/// `SandboxResult` with `success == false`.
#[derive(Debug, Error)]
pub enum SandboxError {
    #[error("failed to stage code file: {0}")]
    Staging(#[from] std::io::Error),

    #[error("sandbox request rejected: {0}")]
    Rejected(String),

    #[error("container runtime error: {0}")]
    Runtime(String),

    #[error("docker error: {0}")]
    Docker(#[from] bollard::errors::Error),
}

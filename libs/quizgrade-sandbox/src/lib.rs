pub mod docker;
pub mod error;
pub mod evaluator;
pub mod factory;
pub mod runner;
pub mod sandbox;

#[cfg(test)]
mod sandbox_tests;

pub use error::{RunnerError, SandboxError};
pub use evaluator::Evaluator;
pub use factory::{LanguageInfo, RunnerFactory, RunnerWrapper};
pub use runner::{CodeRunner, CodeRunnerOptions, CodeRunnerResult};
pub use sandbox::{SandboxExecutor, SandboxedCodeRunner};

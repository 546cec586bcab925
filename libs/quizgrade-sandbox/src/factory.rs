// Runner factory: language name -> runner, optionally wrapped by the sandbox

use crate::error::RunnerError;
use crate::runner::CodeRunner;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::warn;

/// Decorator constructor applied when a sandboxed runner is requested
pub type RunnerWrapper = Arc<dyn Fn(Arc<dyn CodeRunner>) -> Arc<dyn CodeRunner> + Send + Sync>;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LanguageInfo {
    pub name: String,
    pub extension: String,
}

/// Registry of every runner known to the process
///
/// Built once from the full set of registered runners and read-only after
/// that, so it is shared freely behind an `Arc`.
pub struct RunnerFactory {
    runners: HashMap<String, Arc<dyn CodeRunner>>,
    wrap: RunnerWrapper,
}

impl RunnerFactory {
    pub fn new(runners: impl IntoIterator<Item = Arc<dyn CodeRunner>>, wrap: RunnerWrapper) -> Self {
        let mut registry = HashMap::new();
        for runner in runners {
            let key = runner.language().to_lowercase();
            if registry.insert(key.clone(), runner).is_some() {
                warn!(language = %key, "Language registered twice; keeping the last runner");
            }
        }

        Self {
            runners: registry,
            wrap,
        }
    }

    /// Factory whose "sandboxed" runners are the bare runners
    pub fn unsandboxed(runners: impl IntoIterator<Item = Arc<dyn CodeRunner>>) -> Self {
        Self::new(runners, Arc::new(|runner: Arc<dyn CodeRunner>| runner))
    }

    pub fn create(&self, language: &str, sandbox: bool) -> Result<Arc<dyn CodeRunner>, RunnerError> {
        let runner = self
            .runners
            .get(&language.to_lowercase())
            .cloned()
            .ok_or_else(|| RunnerError::UnsupportedLanguage(language.to_string()))?;

        if sandbox {
            Ok((self.wrap)(runner))
        } else {
            Ok(runner)
        }
    }

    /// Registered languages, sorted by name
    pub fn supported_languages(&self) -> Vec<LanguageInfo> {
        let mut languages: Vec<LanguageInfo> = self
            .runners
            .values()
            .map(|r| LanguageInfo {
                name: r.language().to_string(),
                extension: r.extension().to_string(),
            })
            .collect();
        languages.sort_by(|a, b| a.name.cmp(&b.name));
        languages
    }
}

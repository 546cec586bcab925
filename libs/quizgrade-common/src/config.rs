// Sandbox configuration for the evaluation pipeline
// Loaded once from config/sandbox.json, read-only afterwards

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

/// Placeholder in `LanguageSandboxConfig::arguments` replaced by the staged file path
pub const FILE_PLACEHOLDER: &str = "{file}";

pub const DEFAULT_CONFIG_PATH: &str = "config/sandbox.json";

/// How one language is executed inside the sandbox
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LanguageSandboxConfig {
    pub image: String,
    pub command: String,
    pub file_extension: String,
    pub arguments: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code_prefix: Option<String>,
}

impl LanguageSandboxConfig {
    /// Expand the argument template for a file located at `path`
    pub fn render_arguments(&self, path: &str) -> Vec<String> {
        self.arguments
            .iter()
            .map(|arg| arg.replace(FILE_PLACEHOLDER, path))
            .collect()
    }

    /// Source as written to disk, with the language prefix applied
    pub fn staged_source(&self, code: &str) -> String {
        match &self.code_prefix {
            Some(prefix) => format!("{}\n{}", prefix, code),
            None => code.to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SandboxConfiguration {
    pub timeout_seconds: u64,
    pub memory_limit_bytes: i64,
    #[serde(default = "default_cpu_quota")]
    pub cpu_quota_nanos: i64,
    #[serde(default = "default_temp_directory")]
    pub temp_directory: PathBuf,
    #[serde(default, rename = "languages")]
    language_configs: HashMap<String, LanguageSandboxConfig>,
}

fn default_cpu_quota() -> i64 {
    500_000_000 // 0.5 CPU
}

fn default_temp_directory() -> PathBuf {
    std::env::temp_dir().join("quizgrade")
}

impl Default for SandboxConfiguration {
    fn default() -> Self {
        Self {
            timeout_seconds: 5,
            memory_limit_bytes: 256 * 1024 * 1024,
            cpu_quota_nanos: default_cpu_quota(),
            temp_directory: default_temp_directory(),
            language_configs: HashMap::new(),
        }
    }
}

impl SandboxConfiguration {
    /// Load and validate a configuration file
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            bail!("Sandbox config file not found: {}", path.display());
        }

        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read {}", path.display()))?;

        Self::from_json(&content).with_context(|| format!("Invalid sandbox config {}", path.display()))
    }

    pub fn load_default() -> Result<Self> {
        Self::load(Path::new(DEFAULT_CONFIG_PATH))
    }

    pub fn from_json(content: &str) -> Result<Self> {
        let parsed: SandboxConfiguration =
            serde_json::from_str(content).context("Failed to parse sandbox configuration")?;
        let config = parsed.normalized();
        config.validate()?;
        Ok(config)
    }

    /// Language keys are matched case-insensitively
    fn normalized(mut self) -> Self {
        self.language_configs = self
            .language_configs
            .into_iter()
            .map(|(name, config)| (name.to_lowercase(), config))
            .collect();
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.timeout_seconds == 0 {
            bail!("timeout_seconds must be greater than zero");
        }
        if self.memory_limit_bytes <= 0 {
            bail!("memory_limit_bytes must be greater than zero");
        }
        if self.cpu_quota_nanos <= 0 {
            bail!("cpu_quota_nanos must be greater than zero");
        }

        for (name, lang) in &self.language_configs {
            if lang.image.trim().is_empty() {
                bail!("Language '{}' has no container image", name);
            }
            if lang.command.trim().is_empty() {
                bail!("Language '{}' has no command", name);
            }
            if !lang.arguments.iter().any(|a| a.contains(FILE_PLACEHOLDER)) {
                bail!("Language '{}' arguments never reference {}", name, FILE_PLACEHOLDER);
            }
        }

        Ok(())
    }

    pub fn with_language(mut self, name: &str, config: LanguageSandboxConfig) -> Self {
        self.language_configs.insert(name.to_lowercase(), config);
        self
    }

    pub fn with_temp_directory(mut self, dir: impl Into<PathBuf>) -> Self {
        self.temp_directory = dir.into();
        self
    }

    pub fn language_config(&self, language: &str) -> Option<&LanguageSandboxConfig> {
        self.language_configs.get(&language.to_lowercase())
    }

    pub fn list_languages(&self) -> Vec<String> {
        let mut names: Vec<String> = self.language_configs.keys().cloned().collect();
        names.sort();
        names
    }
}

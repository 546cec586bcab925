// CLI commands for inspecting and exercising the grading sandbox
use anyhow::{Context, Result};
use quizgrade_common::config::SandboxConfiguration;
use quizgrade_common::types::TestCase;
use quizgrade_sandbox::docker::DockerRuntime;
use quizgrade_sandbox::evaluator::Evaluator;
use quizgrade_sandbox::factory::RunnerFactory;
use quizgrade_sandbox::runner::{builtin_runners, CodeRunnerOptions};
use quizgrade_sandbox::sandbox::{SandboxExecutor, SandboxedCodeRunner};
use serde::Serialize;
use std::fs;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

#[derive(Debug, Serialize, PartialEq)]
pub struct LanguageRow {
    pub name: String,
    pub extension: String,
    pub image: Option<String>,
}

fn load_config(path: &Path) -> Result<Arc<SandboxConfiguration>> {
    let config = SandboxConfiguration::load(path)
        .with_context(|| format!("Cannot use sandbox configuration {}", path.display()))?;
    Ok(Arc::new(config))
}

fn build_factory(config: Arc<SandboxConfiguration>, sandbox: bool) -> Result<RunnerFactory> {
    let runners = builtin_runners(
        &config.temp_directory,
        Some(Duration::from_secs(config.timeout_seconds)),
    );

    if !sandbox {
        return Ok(RunnerFactory::unsandboxed(runners));
    }

    let runtime = DockerRuntime::connect().context("Failed to connect to Docker")?;
    let executor = Arc::new(SandboxExecutor::new(Arc::new(runtime), config));
    Ok(RunnerFactory::new(runners, SandboxedCodeRunner::wrapper(executor)))
}

/// Registered languages joined with their container image, if any
pub fn language_rows(factory: &RunnerFactory, config: &SandboxConfiguration) -> Vec<LanguageRow> {
    factory
        .supported_languages()
        .into_iter()
        .map(|lang| LanguageRow {
            image: config.language_config(&lang.name).map(|c| c.image.clone()),
            name: lang.name,
            extension: lang.extension,
        })
        .collect()
}

pub fn list_languages(config_path: &Path) -> Result<()> {
    let config = load_config(config_path)?;
    let factory = build_factory(config.clone(), false)?;

    println!("📚 Supported languages:");
    for row in language_rows(&factory, &config) {
        match &row.image {
            Some(image) => println!("  {:<12} {:<6} 🐳 {}", row.name, row.extension, image),
            None => println!("  {:<12} {:<6} ⚠️  no sandbox image, runs on host", row.name, row.extension),
        }
    }
    Ok(())
}

fn read_source(file: &Path) -> Result<String> {
    fs::read_to_string(file).with_context(|| format!("Failed to read {}", file.display()))
}

pub async fn run_file(
    config_path: &Path,
    language: &str,
    file: &Path,
    input: Vec<String>,
    sandbox: bool,
) -> Result<()> {
    let code = read_source(file)?;
    let factory = build_factory(load_config(config_path)?, sandbox)?;
    let runner = factory.create(language, sandbox)?;

    println!("🚀 Running {} ({})...", file.display(), runner.language());
    let result = runner
        .run_code(&code, &CodeRunnerOptions::with_input(input))
        .await?;

    println!("{}", serde_json::to_string_pretty(&result)?);
    Ok(())
}

pub async fn check_file(
    config_path: &Path,
    language: &str,
    file: &Path,
    input: Vec<String>,
    expected: &str,
    sandbox: bool,
) -> Result<()> {
    let code = read_source(file)?;
    let factory = build_factory(load_config(config_path)?, sandbox)?;
    let evaluator = Evaluator::new(Arc::new(factory));

    let test_case = TestCase {
        number: 1,
        input,
        expected_output: expected.to_string(),
    };

    let result = evaluator.evaluate(language, &code, &test_case).await?;
    println!("{}", serde_json::to_string_pretty(&result)?);

    if result.is_successful {
        println!("✅ Passed");
    } else {
        println!("❌ Failed");
    }
    Ok(())
}

pub fn validate_config(path: &Path) -> Result<()> {
    let config = load_config(path)?;
    println!("✅ {} is valid", path.display());
    println!("  timeout: {}s, memory: {} bytes", config.timeout_seconds, config.memory_limit_bytes);
    for name in config.list_languages() {
        println!("  - {}", name);
    }
    Ok(())
}

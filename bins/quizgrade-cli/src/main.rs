mod commands;

use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "quizgrade-cli")]
#[command(about = "Quizgrade CLI - Inspect languages and run code through the grading sandbox", long_about = None)]
struct Cli {
    /// Sandbox configuration file
    #[arg(long, global = true, default_value = quizgrade_common::config::DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List supported languages and how each one is isolated
    Languages,

    /// Run a source file and print the raw runner result
    Run {
        /// Language name (e.g., python, csharp)
        #[arg(short, long)]
        language: String,

        /// Source file to run
        #[arg(short, long)]
        file: PathBuf,

        /// Standard input line, repeatable
        #[arg(short, long)]
        input: Vec<String>,

        /// Run directly on the host instead of in a container
        #[arg(long, default_value = "false")]
        no_sandbox: bool,
    },

    /// Judge a source file against one ad-hoc test case
    Check {
        /// Language name (e.g., python, csharp)
        #[arg(short, long)]
        language: String,

        /// Source file to judge
        #[arg(short, long)]
        file: PathBuf,

        /// Standard input line, repeatable
        #[arg(short, long)]
        input: Vec<String>,

        /// Expected output
        #[arg(short, long)]
        expected: String,

        /// Run directly on the host instead of in a container
        #[arg(long, default_value = "false")]
        no_sandbox: bool,
    },

    /// Load and validate a sandbox configuration file
    ValidateConfig {
        /// Path to check (defaults to --config)
        #[arg(short, long)]
        path: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Languages => {
            commands::list_languages(&cli.config)?;
        }
        Commands::Run {
            language,
            file,
            input,
            no_sandbox,
        } => {
            commands::run_file(&cli.config, &language, &file, input, !no_sandbox).await?;
        }
        Commands::Check {
            language,
            file,
            input,
            expected,
            no_sandbox,
        } => {
            commands::check_file(&cli.config, &language, &file, input, &expected, !no_sandbox).await?;
        }
        Commands::ValidateConfig { path } => {
            commands::validate_config(path.as_deref().unwrap_or(&cli.config))?;
        }
    }

    Ok(())
}

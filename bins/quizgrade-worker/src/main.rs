mod config;
mod intake;
mod monitor;
mod queue;
mod services;
#[cfg(test)]
mod testing;
mod worker;

use config::{LogFormat, WorkerSettings};
use intake::JobIntake;
use monitor::ExpiryMonitor;
use queue::EvaluationQueue;
use quizgrade_common::config::SandboxConfiguration;
use quizgrade_sandbox::docker::DockerRuntime;
use quizgrade_sandbox::evaluator::Evaluator;
use quizgrade_sandbox::factory::RunnerFactory;
use quizgrade_sandbox::runner::builtin_runners;
use quizgrade_sandbox::sandbox::{SandboxExecutor, SandboxedCodeRunner};
use services::{
    AttemptStore, HttpAssessor, JobSource, Mailer, NotificationSink, RedisJobSource, RedisMailer,
    RedisNotifier, RedisStore, SolutionAssessor,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use worker::EvaluationWorker;

/// BLPOP timeout; bounds how long shutdown waits on the intake
const JOB_POLL_TIMEOUT: Duration = Duration::from_secs(5);

fn init_tracing(format: LogFormat) {
    let builder = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_target(false)
        .with_thread_ids(true)
        .with_line_number(true);

    match format {
        LogFormat::Json => builder.json().init(),
        LogFormat::Text => builder.init(),
    }
}

fn build_factory(settings: &WorkerSettings, config: Arc<SandboxConfiguration>) -> anyhow::Result<RunnerFactory> {
    let runners = builtin_runners(
        &config.temp_directory,
        Some(Duration::from_secs(config.timeout_seconds)),
    );

    if !settings.sandbox_enabled {
        warn!("Sandbox disabled: submitted code runs directly on this host");
        return Ok(RunnerFactory::unsandboxed(runners));
    }

    let runtime = DockerRuntime::connect().map_err(|e| {
        error!("Failed to connect to Docker: {}", e);
        e
    })?;
    let executor = Arc::new(SandboxExecutor::new(Arc::new(runtime), config));
    Ok(RunnerFactory::new(runners, SandboxedCodeRunner::wrapper(executor)))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let settings = WorkerSettings::from_env()?;
    init_tracing(settings.log_format);

    info!("Quizgrade worker booting...");

    let sandbox_config = SandboxConfiguration::load(&settings.sandbox_config).map_err(|e| {
        error!("Failed to load sandbox configuration: {:#}", e);
        error!("Make sure {} exists or set SANDBOX_CONFIG", settings.sandbox_config.display());
        e
    })?;
    info!(
        languages = ?sandbox_config.list_languages(),
        timeout_secs = sandbox_config.timeout_seconds,
        memory_bytes = sandbox_config.memory_limit_bytes,
        "Loaded sandbox configuration"
    );

    let factory = build_factory(&settings, Arc::new(sandbox_config))?;
    info!(
        languages = ?factory.supported_languages().iter().map(|l| l.name.as_str()).collect::<Vec<_>>(),
        sandboxed = settings.sandbox_enabled,
        "Runner factory ready"
    );
    let evaluator = Arc::new(Evaluator::new(Arc::new(factory)));

    let client = ::redis::Client::open(settings.redis_url.as_str())?;
    let redis_conn = ::redis::aio::ConnectionManager::new(client.clone()).await?;
    let intake_conn = ::redis::aio::ConnectionManager::new(client).await?;
    info!("Connected to Redis: {}", settings.redis_url);

    let store: Arc<dyn AttemptStore> = Arc::new(RedisStore::new(redis_conn.clone()));
    let notifier: Arc<dyn NotificationSink> = Arc::new(RedisNotifier::new(redis_conn.clone()));
    let mailer: Arc<dyn Mailer> = Arc::new(RedisMailer::new(redis_conn));
    let assessor: Option<Arc<dyn SolutionAssessor>> = match &settings.assessment_url {
        Some(url) => {
            info!("AI assessment endpoint: {}", url);
            Some(Arc::new(HttpAssessor::new(url)?))
        }
        None => {
            warn!("ASSESSMENT_URL not set; AI assessment disabled");
            None
        }
    };

    let queue = Arc::new(EvaluationQueue::new());
    let token = CancellationToken::new();
    let mut tasks = Vec::with_capacity(settings.consumers + 2);

    let source: Arc<dyn JobSource> = Arc::new(RedisJobSource::new(intake_conn, JOB_POLL_TIMEOUT));
    let intake = JobIntake::new(source, queue.clone());
    {
        let token = token.clone();
        tasks.push(tokio::spawn(async move { intake.run(token).await }));
    }

    let monitor = ExpiryMonitor::new(
        store.clone(),
        notifier.clone(),
        queue.clone(),
        settings.poll_interval,
        settings.grace_period,
    );
    {
        let token = token.clone();
        tasks.push(tokio::spawn(async move { monitor.run(token).await }));
    }

    let worker = Arc::new(EvaluationWorker::new(
        queue.clone(),
        evaluator,
        store,
        notifier,
        mailer,
        assessor,
    ));
    for consumer in 0..settings.consumers {
        let worker = worker.clone();
        let token = token.clone();
        tasks.push(tokio::spawn(async move { worker.run(consumer, token).await }));
    }

    info!(consumers = settings.consumers, "Worker running");

    signal::ctrl_c().await?;
    warn!("Received shutdown signal, stopping background tasks...");
    token.cancel();
    queue.close().await;

    for task in tasks {
        if let Err(e) = task.await {
            error!(error = %e, "Background task panicked");
        }
    }

    info!("Worker shutdown complete");
    Ok(())
}

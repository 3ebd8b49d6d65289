//! Tollgate Server - Main entry point
//!
//! Serves the HTTP API and runs the worker pool against Redis.

use std::net::SocketAddr;
use std::sync::Arc;

use clap::Parser;
use serde_json::json;
use tokio::sync::broadcast::error::RecvError;

use tollgate_core::{
    admission::{AdmissionConfig, AdmissionGate},
    api::{self, AppState},
    clock::{Clock, SystemClock},
    config::Config,
    jobs::{
        handler_fn, HandlerOptions, JobContext, JobEvent, JobHandler, JobOptions, JobQueue,
        JobResult, JobStore, RedisJobStore, WorkerConfig, WorkerPool,
    },
    store::{RedisStore, SharedStore},
    telemetry::{self, SensitiveFieldRedactor},
};

#[derive(Debug, Parser)]
#[command(name = "tollgate-server", version, about = "Tollgate admission control and job server")]
struct Args {
    /// Configuration file (TOML, YAML or JSON); environment overrides it
    #[arg(long, short, env = "TOLLGATE_CONFIG")]
    config: Option<String>,

    /// Enqueue one demo email to this address on startup
    #[arg(long, value_name = "ADDRESS")]
    demo_email: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let args = Args::parse();

    let config = match &args.config {
        Some(path) => Config::from_file(path)?,
        None => Config::load()?,
    };

    telemetry::init_logging(&config.logging, &config.server.environment)?;
    let metrics = telemetry::init_metrics(&config.metrics, "tollgate-server")?;

    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        environment = %config.server.environment,
        "Starting Tollgate server"
    );

    let redis = RedisStore::connect(&config.redis).await?;
    let shared: Arc<dyn SharedStore> = Arc::new(redis.clone());
    let job_store: Arc<dyn JobStore> = Arc::new(RedisJobStore::new(&redis));
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);

    let gate = AdmissionGate::new(shared, AdmissionConfig::from(&config.admission));
    let queue = JobQueue::new(job_store.clone(), clock.clone());

    let pool = WorkerPool::new(job_store, WorkerConfig::from(&config.worker), clock);
    pool.register_handler(
        config.queue.default_queue.clone(),
        email_handler(),
        HandlerOptions::new(config.worker.concurrency),
    )?;
    let event_log = tokio::spawn(log_events(pool.subscribe()));
    let workers = pool.start()?;

    if let Some(to) = &args.demo_email {
        let id = queue
            .enqueue(
                &config.queue.default_queue,
                json!({"to": to, "subject": "Welcome to Tollgate"}),
                JobOptions::standard(),
            )
            .await?;
        tracing::info!(job_id = %id, "Demo email enqueued");
    }

    let app = api::build_router(AppState {
        queue,
        gate,
        metrics,
        admission: config.admission.clone(),
    });

    let addr: SocketAddr = format!("{}:{}", config.server.host, config.server.port).parse()?;
    tracing::info!(address = %addr, "Starting HTTP server");
    let listener = tokio::net::TcpListener::bind(addr).await?;

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await?;

    let report = workers.shutdown(config.worker.drain_timeout).await;
    event_log.abort();
    tracing::info!(
        drained = report.drained,
        aborted = report.aborted,
        "Server shutdown complete"
    );

    Ok(())
}

/// Demo handler for the default queue: logs the (redacted) payload and
/// reports the send time.
fn email_handler() -> Arc<dyn JobHandler> {
    handler_fn(|ctx: JobContext| async move { send_email(ctx).await })
}

async fn send_email(ctx: JobContext) -> JobResult {
    let redacted = SensitiveFieldRedactor::global().redact_json(ctx.payload());
    tracing::info!(
        job_id = %ctx.job_id(),
        attempt = ctx.attempt(),
        payload = %redacted,
        "Sending email"
    );

    Ok(json!({
        "message": "Email sent successfully",
        "sent_at": chrono::Utc::now().to_rfc3339(),
    }))
}

/// Log every lifecycle event until the pool is dropped.
async fn log_events(mut events: tokio::sync::broadcast::Receiver<JobEvent>) {
    loop {
        match events.recv().await {
            Ok(JobEvent::Active { job_id, queue, attempt, .. }) => {
                tracing::info!(%job_id, %queue, attempt, "Job active");
            }
            Ok(JobEvent::Completed { job_id, queue, .. }) => {
                tracing::info!(%job_id, %queue, "Job completed");
            }
            Ok(JobEvent::Failed { job_id, queue, error, will_retry, attempts_made, .. }) => {
                tracing::warn!(%job_id, %queue, %error, will_retry, attempts_made, "Job failed");
            }
            Ok(JobEvent::Stalled { job_id, queue, stalled_count, failed, .. }) => {
                tracing::warn!(%job_id, %queue, stalled_count, failed, "Job stalled");
            }
            Err(RecvError::Lagged(missed)) => {
                tracing::warn!(missed, "Event log fell behind");
            }
            Err(RecvError::Closed) => break,
        }
    }
}

/// Wait for shutdown signal.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    tracing::info!("Shutdown signal received");
}

mod metrics;
mod server;

use grader_common::redis;
use grader_common::types::{GradingJob, GradingOutcome};
use grader_core::{GradeRequest, Grader, GraderConfig};
use std::sync::Arc;
use std::time::Instant;
use tokio::net::TcpListener;
use tokio::signal;
use tokio::sync::watch;
use tracing::{debug, error, info, instrument, warn};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing subscriber
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_target(false)
        .with_thread_ids(true)
        .with_line_number(true)
        .init();

    info!("Grader worker booting...");

    let config = GraderConfig::from_env().map_err(|e| {
        error!("Invalid grader configuration: {:#}", e);
        e
    })?;

    let grader = Arc::new(Grader::from_config(&config).map_err(|e| {
        error!("Failed to build grading pipeline: {:#}", e);
        error!("Make sure config/languages.json is valid or GRADER_LANGUAGES_CONFIG points at a valid file");
        e
    })?);

    info!(
        languages = ?grader.registry().languages().list_languages(),
        sandbox = grader.orchestrator().sandbox_name(),
        "Loaded language configurations"
    );

    metrics::register()?;
    let metrics_addr =
        std::env::var("GRADER_WORKER_METRICS_ADDR").unwrap_or_else(|_| "0.0.0.0:9100".to_string());
    let listener = TcpListener::bind(&metrics_addr).await?;
    info!("Metrics server listening on {}", metrics_addr);
    tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, server::router()).await {
            error!(error = %e, "Metrics server stopped");
        }
    });

    // Connect to Redis
    let redis_url = std::env::var("REDIS_URL").unwrap_or_else(|_| "redis://127.0.0.1:6379".to_string());

    let client = ::redis::Client::open(redis_url.as_str())?;
    let mut redis_conn = ::redis::aio::ConnectionManager::new(client).await?;

    info!("Connected to Redis: {}", redis_url);

    // Setup graceful shutdown: the loop finishes the job in hand before exiting
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        match signal::ctrl_c().await {
            Ok(()) => {
                warn!("Received shutdown signal, finishing the current job...");
                let _ = shutdown_tx.send(true);
            }
            Err(e) => error!(error = %e, "Failed to listen for shutdown signal"),
        }
    });

    worker_loop(&mut redis_conn, &grader, shutdown_rx).await?;

    info!("Worker shutdown complete");
    Ok(())
}

#[instrument(skip_all)]
async fn worker_loop(
    redis_conn: &mut ::redis::aio::ConnectionManager,
    grader: &Grader,
    shutdown: watch::Receiver<bool>,
) -> anyhow::Result<()> {
    // A BLPOP is never cancelled mid-flight, so a popped job is always stored
    while !*shutdown.borrow() {
        // BLPOP with 5 second timeout for graceful shutdown
        match redis::pop_job(redis_conn, 5.0).await {
            Ok(Some(job)) => {
                let job_id = job.id;
                info!(
                    job_id = %job_id,
                    language = %job.language,
                    definitions = job.definitions.len(),
                    source_size = job.submission_source.len(),
                    "Received job"
                );

                let start = Instant::now();
                let outcome = grade_job(grader, job).await;
                let elapsed = start.elapsed();

                metrics::record_outcome(&outcome, elapsed);
                metrics::record_sandbox_stats(grader.orchestrator().stats());

                match redis::store_outcome(redis_conn, &outcome).await {
                    Ok(_) => {
                        info!(job_id = %job_id, elapsed_ms = elapsed.as_millis() as u64, "Outcome persisted to Redis");
                    }
                    Err(e) => {
                        // Non-fatal - worker continues
                        error!(job_id = %job_id, error = %e, "Failed to persist outcome");
                    }
                }
            }
            Ok(None) => {
                // Timeout - check for shutdown
                continue;
            }
            Err(e) => {
                error!(error = %e, "Redis error");
                tokio::time::sleep(tokio::time::Duration::from_secs(1)).await;
            }
        }
    }

    Ok(())
}

/// Run one job through the pipeline; pipeline-level failures become a rejection
async fn grade_job(grader: &Grader, job: GradingJob) -> GradingOutcome {
    let job_id = job.id;
    let request = GradeRequest::new(job.submission_source, job.language, job.definitions)
        .with_submission_id(job_id);

    match grader.grade(request).await {
        Ok(grade) => {
            info!(
                job_id = %job_id,
                earned = grade.total_earned,
                possible = grade.total_possible,
                passed = grade.passed_count(),
                failed = grade.failed_count(),
                anomalous = grade.is_anomalous(),
                "Grading completed"
            );

            for result in &grade.results {
                debug!(
                    job_id = %job_id,
                    unit = %result.unit_name,
                    status = %result.status,
                    points = result.points_earned,
                    duration_ms = result.duration_ms,
                    "Unit result"
                );
            }

            GradingOutcome::Graded(grade)
        }
        Err(e) => {
            warn!(job_id = %job_id, error = %e, "Job rejected");
            GradingOutcome::Rejected {
                job_id,
                reason: e.to_string(),
            }
        }
    }
}

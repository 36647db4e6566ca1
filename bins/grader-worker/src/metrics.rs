// Prometheus metrics for the grading worker
use grader_common::types::{GradingOutcome, SubmissionGrade};
use grader_core::orchestrator::RetrySnapshot;
use lazy_static::lazy_static;
use prometheus::{
    Encoder, Histogram, HistogramOpts, IntCounterVec, IntGaugeVec, Opts, Registry, TextEncoder,
};
use std::time::Duration;

lazy_static! {
    pub static ref REGISTRY: Registry = Registry::new();

    pub static ref JOBS_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("grader_jobs_total", "Grading jobs processed, by outcome"),
        &["outcome"]
    )
    .unwrap();

    pub static ref UNITS_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("grader_units_total", "Test units scored, by status"),
        &["status"]
    )
    .unwrap();

    pub static ref ANOMALIES_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("grader_anomalies_total", "Grading anomalies raised, by kind"),
        &["kind"]
    )
    .unwrap();

    /// Cumulative orchestrator counters, mirrored from `RetryStats`
    pub static ref SANDBOX_CALLS: IntGaugeVec = IntGaugeVec::new(
        Opts::new("grader_sandbox_calls", "Sandbox attempts, retries, exhausted retries and timeouts"),
        &["kind"]
    )
    .unwrap();

    pub static ref GRADING_DURATION: Histogram = Histogram::with_opts(
        HistogramOpts::new("grader_grading_duration_seconds", "Wall-clock time to grade one submission")
            .buckets(vec![0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0, 120.0])
    )
    .unwrap();
}

pub fn register() -> prometheus::Result<()> {
    REGISTRY.register(Box::new(JOBS_TOTAL.clone()))?;
    REGISTRY.register(Box::new(UNITS_TOTAL.clone()))?;
    REGISTRY.register(Box::new(ANOMALIES_TOTAL.clone()))?;
    REGISTRY.register(Box::new(SANDBOX_CALLS.clone()))?;
    REGISTRY.register(Box::new(GRADING_DURATION.clone()))?;
    Ok(())
}

fn anomaly_kinds(grade: &SubmissionGrade) -> Vec<String> {
    grade
        .anomalies
        .iter()
        .filter_map(|anomaly| {
            serde_json::to_value(anomaly)
                .ok()
                .and_then(|value| value.get("kind").and_then(|k| k.as_str()).map(str::to_string))
        })
        .collect()
}

pub fn record_outcome(outcome: &GradingOutcome, elapsed: Duration) {
    match outcome {
        GradingOutcome::Graded(grade) => {
            JOBS_TOTAL.with_label_values(&["graded"]).inc();
            GRADING_DURATION.observe(elapsed.as_secs_f64());
            for (status, count) in &grade.by_kind {
                UNITS_TOTAL.with_label_values(&[status.as_str()]).inc_by(*count as u64);
            }
            for kind in anomaly_kinds(grade) {
                ANOMALIES_TOTAL.with_label_values(&[kind.as_str()]).inc();
            }
        }
        GradingOutcome::Rejected { .. } => {
            JOBS_TOTAL.with_label_values(&["rejected"]).inc();
        }
    }
}

pub fn record_sandbox_stats(stats: RetrySnapshot) {
    SANDBOX_CALLS.with_label_values(&["attempts"]).set(stats.attempts as i64);
    SANDBOX_CALLS.with_label_values(&["retries"]).set(stats.retries as i64);
    SANDBOX_CALLS.with_label_values(&["exhausted"]).set(stats.exhausted as i64);
    SANDBOX_CALLS.with_label_values(&["timeouts"]).set(stats.timeouts as i64);
}

/// Prometheus text exposition of everything registered
pub fn render() -> anyhow::Result<String> {
    let mut buffer = Vec::new();
    TextEncoder::new().encode(&REGISTRY.gather(), &mut buffer)?;
    Ok(String::from_utf8(buffer)?)
}

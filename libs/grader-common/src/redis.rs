use crate::types::{GradingJob, GradingOutcome};
use redis::{AsyncCommands, RedisResult};
use uuid::Uuid;

/// Redis queue semantics - defines only semantics, not runtime logic
/// Keeps API and worker agreeing on key names and payload shapes

pub const QUEUE_NAME: &str = "grader:queue";
pub const RESULT_PREFIX: &str = "grader:result";
pub const STATUS_PREFIX: &str = "grader:status";

/// Results expire after 24 hours
pub const RESULT_TTL_SECONDS: u64 = 86400;

/// Generate result key for a job
pub fn result_key(job_id: &Uuid) -> String {
    format!("{}:{}", RESULT_PREFIX, job_id)
}

/// Generate status key for a job
pub fn status_key(job_id: &Uuid) -> String {
    format!("{}:{}", STATUS_PREFIX, job_id)
}

fn serialization_error(e: serde_json::Error) -> redis::RedisError {
    redis::RedisError::from((redis::ErrorKind::TypeError, "serialization error", e.to_string()))
}

/// Push a grading job to the queue
/// Uses RPUSH for FIFO semantics and marks the job as queued
pub async fn push_job(
    conn: &mut redis::aio::ConnectionManager,
    job: &GradingJob,
) -> RedisResult<()> {
    let payload = serde_json::to_string(job).map_err(serialization_error)?;
    let status = serde_json::to_string(&crate::types::JobStatus::Queued).map_err(serialization_error)?;

    let _: () = conn.set_ex(status_key(&job.id), status, RESULT_TTL_SECONDS).await?;
    conn.rpush(QUEUE_NAME, payload).await
}

/// Pop a grading job from the queue
/// Uses BLPOP with timeout for graceful shutdown
pub async fn pop_job(
    conn: &mut redis::aio::ConnectionManager,
    timeout_seconds: f64,
) -> RedisResult<Option<GradingJob>> {
    let result: Option<(String, String)> = conn.blpop(QUEUE_NAME, timeout_seconds).await?;

    match result {
        Some((_key, payload)) => {
            let job: GradingJob = serde_json::from_str(&payload).map_err(|e| {
                redis::RedisError::from((redis::ErrorKind::TypeError, "deserialization error", e.to_string()))
            })?;
            Ok(Some(job))
        }
        None => Ok(None),
    }
}

/// Store a grading outcome together with its status
pub async fn store_outcome(
    conn: &mut redis::aio::ConnectionManager,
    outcome: &GradingOutcome,
) -> RedisResult<()> {
    let job_id = outcome.job_id();
    let payload = serde_json::to_string(outcome).map_err(serialization_error)?;
    let _: () = conn.set_ex(result_key(&job_id), payload, RESULT_TTL_SECONDS).await?;

    let status = serde_json::to_string(&outcome.status()).map_err(serialization_error)?;
    let _: () = conn.set_ex(status_key(&job_id), status, RESULT_TTL_SECONDS).await?;

    Ok(())
}

/// Retrieve a grading outcome, `None` while the job is pending or unknown
pub async fn get_outcome(
    conn: &mut redis::aio::ConnectionManager,
    job_id: &Uuid,
) -> RedisResult<Option<GradingOutcome>> {
    let payload: Option<String> = conn.get(result_key(job_id)).await?;

    match payload {
        Some(data) => {
            let outcome: GradingOutcome = serde_json::from_str(&data).map_err(|e| {
                redis::RedisError::from((redis::ErrorKind::TypeError, "deserialization error", e.to_string()))
            })?;
            Ok(Some(outcome))
        }
        None => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_result_key_deterministic() {
        let id = Uuid::new_v4();
        let key1 = result_key(&id);
        let key2 = result_key(&id);
        assert_eq!(key1, key2);
        assert!(key1.starts_with("grader:result:"));
    }

    #[test]
    fn test_status_key_format() {
        let id = Uuid::new_v4();
        let key = status_key(&id);
        assert!(key.starts_with("grader:status:"));
        assert!(key.contains(&id.to_string()));
    }
}

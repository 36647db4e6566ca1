// HTTP route handlers for the Grader API

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Json, Response},
};
use grader_common::redis;
use grader_common::types::{GradingJob, GradingOutcome, JobMetadata, Language, TestDefinition};
use grader_core::LanguageConfigManager;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::sync::Arc;
use tracing::{error, info};
use uuid::Uuid;

use crate::AppState;

#[derive(Debug, Deserialize)]
pub struct SubmitGradeRequest {
    pub language: Language,
    pub submission_source: String,
    pub definitions: Vec<TestDefinition>,
    #[serde(default)]
    pub metadata: JobMetadata,
}

#[derive(Debug, Serialize)]
pub struct SubmitGradeResponse {
    pub job_id: Uuid,
    pub status: &'static str,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GradeView {
    /// Visible units only, no anomaly flags
    #[default]
    Student,
    Faculty,
}

#[derive(Debug, Deserialize)]
pub struct GradeQuery {
    #[serde(default)]
    pub view: GradeView,
}

/// Reject what the worker would reject anyway, before it reaches the queue
fn validate(request: &SubmitGradeRequest, languages: &LanguageConfigManager) -> Result<(), String> {
    if !languages.supports(&request.language) {
        return Err(format!(
            "unsupported language: {} (available: {})",
            request.language,
            languages.list_languages().join(", ")
        ));
    }
    if request.submission_source.trim().is_empty() {
        return Err("submission is empty".to_string());
    }
    if request.definitions.is_empty() {
        return Err("at least one test definition is required".to_string());
    }
    Ok(())
}

fn error_body(status: StatusCode, message: impl Into<String>) -> Response {
    (status, Json(json!({ "error": message.into() }))).into_response()
}

/// Shape a stored outcome for the requested audience
fn render_outcome(outcome: GradingOutcome, view: GradeView) -> Result<Value, serde_json::Error> {
    match outcome {
        GradingOutcome::Graded(grade) => {
            let status = json!("completed");
            let mut body = match view {
                GradeView::Student => serde_json::to_value(grade.student_view())?,
                GradeView::Faculty => {
                    let mut body = serde_json::to_value(&grade)?;
                    body["score_pct"] = json!(grade.score_pct());
                    body
                }
            };
            body["status"] = status;
            Ok(body)
        }
        GradingOutcome::Rejected { job_id, reason } => Ok(json!({
            "job_id": job_id,
            "status": "rejected",
            "reason": reason,
        })),
    }
}

/// POST /grade - Queue a submission for grading
pub async fn submit_grade(
    State(state): State<Arc<AppState>>,
    Json(payload): Json<SubmitGradeRequest>,
) -> Response {
    if let Err(message) = validate(&payload, &state.languages) {
        return error_body(StatusCode::BAD_REQUEST, message);
    }

    let job = GradingJob {
        id: Uuid::new_v4(),
        language: payload.language,
        submission_source: payload.submission_source,
        definitions: payload.definitions,
        metadata: payload.metadata,
    };

    let mut conn = state.redis.clone();
    match redis::push_job(&mut conn, &job).await {
        Ok(_) => {
            info!(
                job_id = %job.id,
                language = %job.language,
                definitions = job.definitions.len(),
                "Grading job queued"
            );
            (
                StatusCode::ACCEPTED,
                Json(SubmitGradeResponse {
                    job_id: job.id,
                    status: "queued",
                }),
            )
                .into_response()
        }
        Err(e) => {
            error!(job_id = %job.id, error = %e, "Failed to queue grading job");
            error_body(StatusCode::INTERNAL_SERVER_ERROR, format!("Failed to queue job: {}", e))
        }
    }
}

/// GET /grade/{job_id}?view=student|faculty - Fetch a grade
pub async fn get_grade(
    State(state): State<Arc<AppState>>,
    Path(job_id): Path<String>,
    Query(query): Query<GradeQuery>,
) -> Response {
    let job_uuid = match Uuid::parse_str(&job_id) {
        Ok(id) => id,
        Err(_) => return error_body(StatusCode::BAD_REQUEST, "Invalid job ID format"),
    };

    let mut conn = state.redis.clone();
    match redis::get_outcome(&mut conn, &job_uuid).await {
        Ok(Some(outcome)) => {
            info!(job_id = %job_id, status = ?outcome.status(), view = ?query.view, "Grade retrieved");
            match render_outcome(outcome, query.view) {
                Ok(body) => (StatusCode::OK, Json(body)).into_response(),
                Err(e) => error_body(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()),
            }
        }
        Ok(None) => (
            StatusCode::ACCEPTED,
            Json(json!({
                "job_id": job_id,
                "status": "pending",
                "message": "Submission is queued or still being graded"
            })),
        )
            .into_response(),
        Err(e) => {
            error!(job_id = %job_id, error = %e, "Failed to fetch grade");
            error_body(
                StatusCode::INTERNAL_SERVER_ERROR,
                format!("Failed to query grade: {}", e),
            )
        }
    }
}

/// GET /languages - Languages the pipeline accepts
pub async fn list_languages(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(json!({ "languages": state.languages.list_languages() }))
}

/// GET /health - Health check endpoint
pub async fn health_check() -> impl IntoResponse {
    (StatusCode::OK, "OK")
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use grader_common::types::{SubmissionGrade, TestResult, UnitStatus};
    use std::collections::BTreeMap;

    fn request(language: Language, source: &str) -> SubmitGradeRequest {
        SubmitGradeRequest {
            language,
            submission_source: source.to_string(),
            definitions: vec![TestDefinition {
                code: "assert add(1, 1) == 2".to_string(),
                visible: true,
                points: 5,
                order: 0,
            }],
            metadata: JobMetadata::default(),
        }
    }

    fn result(name: &str, visible: bool) -> TestResult {
        TestResult {
            unit_name: name.to_string(),
            definition_index: 0,
            definition_order: 0,
            status: UnitStatus::Passed,
            passed: true,
            points_earned: 5,
            points_possible: 5,
            visible,
            display_text: name.to_string(),
            console_output: None,
            stdout: String::new(),
            stderr: String::new(),
            duration_ms: 10,
            attempts: 1,
        }
    }

    #[test]
    fn test_validate() {
        let languages = LanguageConfigManager::embedded().unwrap();

        assert!(validate(&request(Language::Python, "def add(a, b): return a + b"), &languages).is_ok());
        assert_eq!(
            validate(&request(Language::Python, "  "), &languages).unwrap_err(),
            "submission is empty"
        );

        let mut no_tests = request(Language::Java, "class Solution {}");
        no_tests.definitions.clear();
        assert!(validate(&no_tests, &languages).is_err());
    }

    #[test]
    fn test_submit_payload_accepts_language_aliases() {
        let payload: SubmitGradeRequest = serde_json::from_str(
            r#"{"language":"c++","submission_source":"int add(int a,int b){return a+b;}","definitions":[{"code":"assert(add(1,1)==2);","points":3}]}"#,
        )
        .unwrap();
        assert_eq!(payload.language, Language::Cpp);
        assert_eq!(payload.definitions[0].points, 3);
        assert!(!payload.definitions[0].visible);
    }

    #[test]
    fn test_student_view_hides_hidden_results() {
        let grade = SubmissionGrade {
            submission_id: Uuid::new_v4(),
            language: Language::Python,
            total_earned: 10,
            total_possible: 10,
            results: vec![result("test_visible", true), result("test_hidden", false)],
            anomalies: Vec::new(),
            by_kind: BTreeMap::new(),
            graded_at: Utc::now(),
        };

        let student = render_outcome(GradingOutcome::Graded(grade.clone()), GradeView::Student).unwrap();
        assert_eq!(student["status"], "completed");
        assert_eq!(student["results"].as_array().unwrap().len(), 1);
        assert_eq!(student["total_possible"], 5);
        assert!(student.get("anomalies").is_none());

        let faculty = render_outcome(GradingOutcome::Graded(grade), GradeView::Faculty).unwrap();
        assert_eq!(faculty["results"].as_array().unwrap().len(), 2);
        assert_eq!(faculty["score_pct"], 100.0);
    }

    #[test]
    fn test_rejected_outcome() {
        let job_id = Uuid::new_v4();
        let body = render_outcome(
            GradingOutcome::Rejected {
                job_id,
                reason: "submission is empty".to_string(),
            },
            GradeView::Faculty,
        )
        .unwrap();
        assert_eq!(body["status"], "rejected");
        assert_eq!(body["reason"], "submission is empty");
    }

    #[test]
    fn test_view_defaults_to_student() {
        let query: GradeQuery = serde_json::from_str("{}").unwrap();
        assert_eq!(query.view, GradeView::Student);
    }
}

use super::{http_client, CompileStage, ExecutionOutcome, SandboxClient, SandboxError, SandboxRequest};
use crate::config::{LanguageConfig, LanguageConfigManager};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Instant;
use tracing::debug;

/// Piston v2 (`POST /api/v2/execute`)
pub struct PistonClient {
    http: reqwest::Client,
    base_url: String,
    languages: LanguageConfigManager,
}

#[derive(Debug, Serialize)]
struct PistonFile<'a> {
    name: &'a str,
    content: &'a str,
}

#[derive(Debug, Serialize)]
struct PistonRequest<'a> {
    language: &'a str,
    version: &'a str,
    files: Vec<PistonFile<'a>>,
    stdin: &'a str,
    args: Vec<String>,
    compile_timeout: u64,
    run_timeout: u64,
    compile_memory_limit: i64,
    run_memory_limit: i64,
}

#[derive(Debug, Deserialize)]
struct PistonStage {
    #[serde(default)]
    stdout: String,
    #[serde(default)]
    stderr: String,
    code: Option<i32>,
    signal: Option<String>,
    #[serde(default)]
    status: Option<String>,
    #[serde(default)]
    wall_time: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct PistonResponse {
    run: Option<PistonStage>,
    compile: Option<PistonStage>,
    message: Option<String>,
}

impl PistonClient {
    pub fn new(base_url: &str, languages: LanguageConfigManager) -> Result<Self, SandboxError> {
        Ok(Self {
            http: http_client()?,
            base_url: base_url.trim_end_matches('/').to_string(),
            languages,
        })
    }

    fn language_config(&self, request: &SandboxRequest) -> Result<&LanguageConfig, SandboxError> {
        self.languages
            .get_config(&request.language)
            .map_err(|_| SandboxError::UnsupportedLanguage(request.language))
    }
}

fn build_request<'a>(config: &'a LanguageConfig, request: &'a SandboxRequest) -> PistonRequest<'a> {
    let memory_bytes = i64::from(config.memory_limit_mb) * 1024 * 1024;
    PistonRequest {
        language: &config.piston_language,
        version: &config.version,
        files: vec![PistonFile {
            name: &request.file_name,
            content: &request.source,
        }],
        stdin: request.stdin.as_deref().unwrap_or(""),
        args: Vec::new(),
        compile_timeout: config.compile_timeout_ms,
        run_timeout: config.run_timeout_ms,
        compile_memory_limit: -1,
        run_memory_limit: memory_bytes,
    }
}

fn into_outcome(response: PistonResponse, measured_ms: u64) -> Result<ExecutionOutcome, SandboxError> {
    let compile = response.compile.map(|stage| CompileStage {
        stdout: stage.stdout,
        stderr: stage.stderr,
        exit_code: stage.code,
    });

    let Some(run) = response.run else {
        // A failed compile stage is reported without a run stage by some versions
        if compile.as_ref().is_some_and(CompileStage::failed) {
            return Ok(ExecutionOutcome {
                duration_ms: measured_ms,
                compile,
                ..Default::default()
            });
        }
        let reason = response.message.unwrap_or_else(|| "response has no run stage".to_string());
        return Err(SandboxError::Malformed(reason));
    };

    // memory and output limits are also enforced with SIGKILL; only older
    // versions that report no status leave the signal as the sole hint
    let timed_out = match run.status.as_deref() {
        Some(status) => status == "TO",
        None => run.signal.as_deref() == Some("SIGKILL"),
    };

    Ok(ExecutionOutcome {
        stdout: run.stdout,
        stderr: run.stderr,
        exit_code: run.code,
        signal: run.signal,
        duration_ms: run.wall_time.unwrap_or(measured_ms),
        timed_out,
        compile,
    })
}

#[async_trait]
impl SandboxClient for PistonClient {
    fn name(&self) -> &'static str {
        "piston"
    }

    async fn execute(&self, request: &SandboxRequest) -> Result<ExecutionOutcome, SandboxError> {
        let config = self.language_config(request)?;
        let body = build_request(config, request);
        let url = format!("{}/api/v2/execute", self.base_url);

        let started = Instant::now();
        let response = self.http.post(&url).json(&body).send().await?;
        let status = response.status();

        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            if status.as_u16() == 400 && text.contains("runtime is unknown") {
                return Err(SandboxError::UnsupportedLanguage(request.language));
            }
            return Err(SandboxError::Http {
                status: status.as_u16(),
                body: text,
            });
        }

        let payload: PistonResponse = response
            .json()
            .await
            .map_err(|e| SandboxError::Malformed(e.to_string()))?;
        let measured_ms = started.elapsed().as_millis() as u64;

        debug!(
            language = %request.language,
            duration_ms = measured_ms,
            "Piston execution finished"
        );

        into_outcome(payload, measured_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use grader_common::types::Language;

    fn python_config() -> LanguageConfig {
        LanguageConfigManager::embedded()
            .unwrap()
            .get_config(&Language::Python)
            .unwrap()
            .clone()
    }

    #[test]
    fn test_request_shape() {
        let config = python_config();
        let request = SandboxRequest {
            language: Language::Python,
            file_name: "main.py".to_string(),
            source: "print(1)".to_string(),
            stdin: None,
        };

        let body = serde_json::to_value(build_request(&config, &request)).unwrap();

        assert_eq!(body["language"], "python");
        assert_eq!(body["files"][0]["name"], "main.py");
        assert_eq!(body["files"][0]["content"], "print(1)");
        assert_eq!(body["stdin"], "");
        assert_eq!(body["run_memory_limit"], 256 * 1024 * 1024);
    }

    #[test]
    fn test_successful_run() {
        let response: PistonResponse = serde_json::from_str(
            r#"{"language":"python","version":"3.12.0","run":{"stdout":"PASSED: test_add:10\n","stderr":"","output":"","code":0,"signal":null}}"#,
        )
        .unwrap();

        let outcome = into_outcome(response, 42).unwrap();
        assert_eq!(outcome.exit_code, Some(0));
        assert_eq!(outcome.duration_ms, 42);
        assert!(!outcome.timed_out);
        assert!(outcome.exited_normally());
    }

    #[test]
    fn test_killed_run_is_timeout() {
        let response: PistonResponse = serde_json::from_str(
            r#"{"run":{"stdout":"","stderr":"","code":null,"signal":"SIGKILL","wall_time":3012}}"#,
        )
        .unwrap();

        let outcome = into_outcome(response, 3100).unwrap();
        assert!(outcome.timed_out);
        assert_eq!(outcome.duration_ms, 3012);
    }

    #[test]
    fn test_status_decides_timeout_over_signal() {
        let limit_kill: PistonResponse = serde_json::from_str(
            r#"{"run":{"stdout":"","stderr":"","code":null,"signal":"SIGKILL","status":"SG","wall_time":40}}"#,
        )
        .unwrap();
        let outcome = into_outcome(limit_kill, 50).unwrap();
        assert!(!outcome.timed_out);
        assert!(!outcome.exited_normally());

        let wall_clock: PistonResponse = serde_json::from_str(
            r#"{"run":{"stdout":"","stderr":"","code":null,"signal":"SIGKILL","status":"TO","wall_time":3001}}"#,
        )
        .unwrap();
        assert!(into_outcome(wall_clock, 3100).unwrap().timed_out);
    }

    #[test]
    fn test_compile_failure_without_run_stage() {
        let response: PistonResponse = serde_json::from_str(
            r#"{"compile":{"stdout":"","stderr":"main.cpp:1: error","code":1,"signal":null}}"#,
        )
        .unwrap();

        let outcome = into_outcome(response, 10).unwrap();
        assert!(outcome.compile_failed());
        assert_eq!(outcome.compile.unwrap().stderr, "main.cpp:1: error");
    }

    #[test]
    fn test_missing_run_stage_is_malformed() {
        let response: PistonResponse = serde_json::from_str(r#"{"message":"oops"}"#).unwrap();
        let error = into_outcome(response, 0).unwrap_err();
        assert!(matches!(error, SandboxError::Malformed(ref m) if m == "oops"));
        assert!(error.is_transient());
    }

    #[tokio::test]
    #[ignore] // Requires a running Piston instance on localhost:2000
    async fn test_live_python_execution() {
        let client = PistonClient::new("http://localhost:2000", LanguageConfigManager::embedded().unwrap()).unwrap();
        let request = SandboxRequest {
            language: Language::Python,
            file_name: "main.py".to_string(),
            source: "print('hello')".to_string(),
            stdin: None,
        };

        let outcome = client.execute(&request).await.unwrap();
        assert_eq!(outcome.stdout.trim(), "hello");
    }
}

use super::{http_client, CompileStage, ExecutionOutcome, SandboxClient, SandboxError, SandboxRequest};
use crate::config::{LanguageConfig, LanguageConfigManager};
use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant};
use tracing::debug;

const STATUS_ACCEPTED: u32 = 3;
const STATUS_TIME_LIMIT: u32 = 5;
const STATUS_COMPILATION_ERROR: u32 = 6;
const STATUS_INTERNAL_ERROR: u32 = 13;
const STATUS_EXEC_FORMAT_ERROR: u32 = 14;

const RESULT_FIELDS: &str = "stdout,stderr,compile_output,message,status,time,exit_code,exit_signal";

/// Judge0 CE: submit asynchronously, then poll the token until it settles
pub struct Judge0Client {
    http: reqwest::Client,
    base_url: String,
    languages: LanguageConfigManager,
    poll_interval: Duration,
    max_polls: u32,
}

#[derive(Debug, Serialize)]
struct Judge0Submission {
    source_code: String,
    language_id: u32,
    stdin: String,
    cpu_time_limit: f64,
    wall_time_limit: f64,
    /// Kilobytes
    memory_limit: u64,
}

#[derive(Debug, Deserialize)]
struct Judge0Token {
    token: String,
}

#[derive(Debug, Deserialize)]
struct Judge0Status {
    id: u32,
    #[serde(default)]
    description: String,
}

#[derive(Debug, Deserialize)]
struct Judge0Result {
    stdout: Option<String>,
    stderr: Option<String>,
    compile_output: Option<String>,
    message: Option<String>,
    status: Judge0Status,
    time: Option<String>,
    exit_code: Option<i32>,
    exit_signal: Option<i32>,
}

impl Judge0Client {
    pub fn new(base_url: &str, languages: LanguageConfigManager) -> Result<Self, SandboxError> {
        Ok(Self {
            http: http_client()?,
            base_url: base_url.trim_end_matches('/').to_string(),
            languages,
            poll_interval: Duration::from_millis(300),
            max_polls: 200,
        })
    }

    pub fn with_polling(mut self, interval: Duration, max_polls: u32) -> Self {
        self.poll_interval = interval;
        self.max_polls = max_polls.max(1);
        self
    }

    async fn submit(&self, body: &Judge0Submission) -> Result<String, SandboxError> {
        let url = format!("{}/submissions?base64_encoded=true&wait=false", self.base_url);
        let response = self.http.post(&url).json(body).send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(SandboxError::Http {
                status: status.as_u16(),
                body: response.text().await.unwrap_or_default(),
            });
        }

        let token: Judge0Token = response
            .json()
            .await
            .map_err(|e| SandboxError::Malformed(e.to_string()))?;
        Ok(token.token)
    }

    async fn fetch(&self, token: &str) -> Result<Judge0Result, SandboxError> {
        let url = format!(
            "{}/submissions/{}?base64_encoded=true&fields={}",
            self.base_url, token, RESULT_FIELDS
        );
        let response = self.http.get(&url).send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(SandboxError::Http {
                status: status.as_u16(),
                body: response.text().await.unwrap_or_default(),
            });
        }

        response
            .json()
            .await
            .map_err(|e| SandboxError::Malformed(e.to_string()))
    }
}

fn encode_submission(config: &LanguageConfig, request: &SandboxRequest) -> Judge0Submission {
    let run_seconds = config.run_timeout_ms as f64 / 1000.0;
    Judge0Submission {
        source_code: STANDARD.encode(&request.source),
        language_id: config.judge0_language_id,
        stdin: STANDARD.encode(request.stdin.as_deref().unwrap_or("")),
        cpu_time_limit: run_seconds,
        wall_time_limit: run_seconds * 2.0,
        memory_limit: u64::from(config.memory_limit_mb) * 1024,
    }
}

fn decode_field(value: Option<String>) -> Result<String, SandboxError> {
    match value {
        None => Ok(String::new()),
        Some(encoded) => {
            // Judge0 wraps base64 output every 60 characters
            let compact: String = encoded.chars().filter(|c| !c.is_whitespace()).collect();
            let bytes = STANDARD
                .decode(compact)
                .map_err(|e| SandboxError::Malformed(format!("invalid base64: {}", e)))?;
            Ok(String::from_utf8_lossy(&bytes).into_owned())
        }
    }
}

fn signal_name(signal: i32) -> String {
    match signal {
        6 => "SIGABRT".to_string(),
        8 => "SIGFPE".to_string(),
        9 => "SIGKILL".to_string(),
        11 => "SIGSEGV".to_string(),
        25 => "SIGXFSZ".to_string(),
        other => format!("SIG{}", other),
    }
}

/// `Ok(None)` while the submission is still queued or running
fn decode_result(result: Judge0Result, measured_ms: u64) -> Result<Option<ExecutionOutcome>, SandboxError> {
    let status = result.status.id;
    if status < STATUS_ACCEPTED {
        return Ok(None);
    }
    if status == STATUS_INTERNAL_ERROR || status == STATUS_EXEC_FORMAT_ERROR {
        let detail = decode_field(result.message)?;
        return Err(SandboxError::Internal(format!(
            "{} ({})",
            result.status.description,
            detail.trim()
        )));
    }

    let duration_ms = result
        .time
        .as_deref()
        .and_then(|t| t.trim().parse::<f64>().ok())
        .map(|seconds| (seconds * 1000.0).round() as u64)
        .unwrap_or(measured_ms);

    let stdout = decode_field(result.stdout)?;
    let stderr = decode_field(result.stderr)?;

    if status == STATUS_COMPILATION_ERROR {
        return Ok(Some(ExecutionOutcome {
            stdout,
            stderr,
            duration_ms,
            compile: Some(CompileStage {
                stdout: decode_field(result.compile_output)?,
                stderr: String::new(),
                exit_code: Some(1),
            }),
            ..Default::default()
        }));
    }

    let timed_out = status == STATUS_TIME_LIMIT;
    let exit_code = match (status, result.exit_code) {
        (_, Some(code)) => Some(code),
        (STATUS_ACCEPTED, None) => Some(0),
        (_, None) if result.exit_signal.is_none() && !timed_out => Some(1),
        _ => None,
    };

    Ok(Some(ExecutionOutcome {
        stdout,
        stderr,
        exit_code,
        signal: result.exit_signal.map(signal_name),
        duration_ms,
        timed_out,
        compile: None,
    }))
}

#[async_trait]
impl SandboxClient for Judge0Client {
    fn name(&self) -> &'static str {
        "judge0"
    }

    async fn execute(&self, request: &SandboxRequest) -> Result<ExecutionOutcome, SandboxError> {
        let config = self
            .languages
            .get_config(&request.language)
            .map_err(|_| SandboxError::UnsupportedLanguage(request.language))?;

        let started = Instant::now();
        let token = self.submit(&encode_submission(config, request)).await?;

        for poll in 1..=self.max_polls {
            tokio::time::sleep(self.poll_interval).await;

            let result = self.fetch(&token).await?;
            let measured_ms = started.elapsed().as_millis() as u64;
            if let Some(outcome) = decode_result(result, measured_ms)? {
                debug!(
                    language = %request.language,
                    token = %token,
                    polls = poll,
                    "Judge0 submission settled"
                );
                return Ok(outcome);
            }
        }

        Err(SandboxError::PollBudgetExhausted(self.max_polls))
    }
}

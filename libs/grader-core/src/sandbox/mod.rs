/// Sandbox Clients - Assembled Program → Raw Execution Outcome
///
/// **Core Responsibility:**
/// Ship one complete program to the external execution service and bring back
/// what happened: stdout, stderr, exit status, signal, elapsed time.
///
/// **Critical Architectural Boundary:**
/// - Clients know HOW to talk to a sandbox (Piston, Judge0)
/// - Clients do NOT retry, time out or score; the orchestrator and
///   evaluator own those decisions
/// - Errors are classified transient or permanent so retries stay bounded

mod judge0;
mod piston;
#[cfg(test)]
pub(crate) mod scripted;

pub use judge0::Judge0Client;
pub use piston::PistonClient;

use crate::config::{GraderConfig, LanguageConfigManager, SandboxBackend};
use async_trait::async_trait;
use grader_common::types::Language;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

/// Compile step reported by compiled-language backends
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompileStage {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: Option<i32>,
}

impl CompileStage {
    pub fn failed(&self) -> bool {
        self.exit_code != Some(0)
    }

    /// Everything the compiler said, for classification and display
    pub fn diagnostics(&self) -> String {
        match (self.stdout.trim().is_empty(), self.stderr.trim().is_empty()) {
            (true, _) => self.stderr.clone(),
            (false, true) => self.stdout.clone(),
            (false, false) => format!("{}\n{}", self.stdout, self.stderr),
        }
    }
}

/// Raw result of one sandbox run. Immutable once received.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionOutcome {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: Option<i32>,
    pub signal: Option<String>,
    pub duration_ms: u64,
    pub timed_out: bool,
    pub compile: Option<CompileStage>,
}

impl ExecutionOutcome {
    /// Outcome recorded when the orchestrator's own deadline expired
    pub fn timed_out_after(limit: Duration) -> Self {
        Self {
            duration_ms: limit.as_millis() as u64,
            timed_out: true,
            ..Self::default()
        }
    }

    pub fn compile_failed(&self) -> bool {
        self.compile.as_ref().is_some_and(CompileStage::failed)
    }

    /// Exit code 0, no signal, compiled fine, finished in time
    pub fn exited_normally(&self) -> bool {
        self.exit_code == Some(0) && self.signal.is_none() && !self.compile_failed() && !self.timed_out
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SandboxRequest {
    pub language: Language,
    pub file_name: String,
    pub source: String,
    pub stdin: Option<String>,
}

#[derive(Debug, Error)]
pub enum SandboxError {
    #[error("sandbox transport error: {0}")]
    Transport(String),

    #[error("sandbox returned HTTP {status}: {body}")]
    Http { status: u16, body: String },

    #[error("malformed sandbox response: {0}")]
    Malformed(String),

    #[error("sandbox internal error: {0}")]
    Internal(String),

    #[error("sandbox does not support language: {0}")]
    UnsupportedLanguage(Language),

    #[error("sandbox result not ready after {0} polls")]
    PollBudgetExhausted(u32),
}

impl SandboxError {
    /// Worth another attempt: the sandbox, not the request, was at fault
    pub fn is_transient(&self) -> bool {
        match self {
            SandboxError::Transport(_)
            | SandboxError::Malformed(_)
            | SandboxError::Internal(_)
            | SandboxError::PollBudgetExhausted(_) => true,
            SandboxError::Http { status, .. } => *status >= 500 || *status == 429,
            SandboxError::UnsupportedLanguage(_) => false,
        }
    }
}

impl From<reqwest::Error> for SandboxError {
    fn from(error: reqwest::Error) -> Self {
        if error.is_decode() {
            SandboxError::Malformed(error.to_string())
        } else if let Some(status) = error.status() {
            SandboxError::Http {
                status: status.as_u16(),
                body: error.to_string(),
            }
        } else {
            SandboxError::Transport(error.to_string())
        }
    }
}

/// The external execution service as the pipeline sees it
#[async_trait]
pub trait SandboxClient: Send + Sync {
    fn name(&self) -> &'static str;

    async fn execute(&self, request: &SandboxRequest) -> Result<ExecutionOutcome, SandboxError>;
}

/// Build the configured backend
pub fn client_for(
    config: &GraderConfig,
    languages: LanguageConfigManager,
) -> Result<Arc<dyn SandboxClient>, SandboxError> {
    let client: Arc<dyn SandboxClient> = match config.backend {
        SandboxBackend::Piston => Arc::new(PistonClient::new(&config.sandbox_url, languages)?),
        SandboxBackend::Judge0 => Arc::new(Judge0Client::new(&config.sandbox_url, languages)?),
    };
    Ok(client)
}

pub(crate) fn http_client() -> Result<reqwest::Client, SandboxError> {
    reqwest::Client::builder()
        .connect_timeout(Duration::from_secs(5))
        .build()
        .map_err(SandboxError::from)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_classification() {
        assert!(SandboxError::Transport("refused".into()).is_transient());
        assert!(SandboxError::Http { status: 503, body: String::new() }.is_transient());
        assert!(SandboxError::Http { status: 429, body: String::new() }.is_transient());
        assert!(!SandboxError::Http { status: 400, body: String::new() }.is_transient());
        assert!(!SandboxError::UnsupportedLanguage(Language::Rust).is_transient());
        assert!(SandboxError::Internal("status 13".into()).is_transient());
    }

    #[test]
    fn test_exited_normally() {
        let ok = ExecutionOutcome {
            exit_code: Some(0),
            ..Default::default()
        };
        assert!(ok.exited_normally());

        let signalled = ExecutionOutcome {
            signal: Some("SIGKILL".into()),
            ..ok.clone()
        };
        assert!(!signalled.exited_normally());

        let broken_build = ExecutionOutcome {
            compile: Some(CompileStage {
                stderr: "error".into(),
                exit_code: Some(1),
                ..Default::default()
            }),
            ..ok.clone()
        };
        assert!(broken_build.compile_failed());
        assert!(!broken_build.exited_normally());

        assert!(!ExecutionOutcome::timed_out_after(Duration::from_secs(1)).exited_normally());
    }
}

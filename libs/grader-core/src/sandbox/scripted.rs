// In-process sandbox for exercising the pipeline without a live service
use super::{ExecutionOutcome, SandboxClient, SandboxError, SandboxRequest};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

pub(crate) enum Script {
    Reply(Result<ExecutionOutcome, SandboxError>),
    After(Duration, Result<ExecutionOutcome, SandboxError>),
    Hang,
}

type Responder = Box<dyn Fn(&SandboxRequest, u32) -> Script + Send + Sync>;

/// Answers each request from a closure given the request and its attempt
/// number (1-based, counted per program source)
pub(crate) struct ScriptedSandbox {
    respond: Responder,
    attempts: Mutex<HashMap<String, u32>>,
    in_flight: AtomicUsize,
    peak: AtomicUsize,
    calls: AtomicUsize,
}

impl ScriptedSandbox {
    pub fn new<F>(respond: F) -> Self
    where
        F: Fn(&SandboxRequest, u32) -> Script + Send + Sync + 'static,
    {
        Self {
            respond: Box::new(respond),
            attempts: Mutex::new(HashMap::new()),
            in_flight: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
            calls: AtomicUsize::new(0),
        }
    }

    pub fn peak_in_flight(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

pub(crate) fn stdout(text: &str) -> Result<ExecutionOutcome, SandboxError> {
    Ok(ExecutionOutcome {
        stdout: text.to_string(),
        exit_code: Some(0),
        duration_ms: 5,
        ..Default::default()
    })
}

pub(crate) fn failure(stdout: &str, stderr: &str, exit_code: i32) -> Result<ExecutionOutcome, SandboxError> {
    Ok(ExecutionOutcome {
        stdout: stdout.to_string(),
        stderr: stderr.to_string(),
        exit_code: Some(exit_code),
        duration_ms: 5,
        ..Default::default()
    })
}

struct InFlight<'a>(&'a AtomicUsize);

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl SandboxClient for ScriptedSandbox {
    fn name(&self) -> &'static str {
        "scripted"
    }

    async fn execute(&self, request: &SandboxRequest) -> Result<ExecutionOutcome, SandboxError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let attempt = {
            let mut attempts = self.attempts.lock().unwrap();
            let counter = attempts.entry(request.source.clone()).or_insert(0);
            *counter += 1;
            *counter
        };

        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        let _guard = InFlight(&self.in_flight);

        match (self.respond)(request, attempt) {
            Script::Reply(result) => {
                tokio::task::yield_now().await;
                result
            }
            Script::After(delay, result) => {
                tokio::time::sleep(delay).await;
                result
            }
            Script::Hang => {
                std::future::pending::<()>().await;
                Err(SandboxError::Internal("unreachable".to_string()))
            }
        }
    }
}

/// Execution Orchestrator - Assembled Programs → Unit Executions
///
/// **Core Responsibility:**
/// Dispatch every assembled program to the sandbox and hand back exactly one
/// execution per program, in input order, no matter what went wrong.
///
/// **Guarantees:**
/// - Bounded parallelism: a semaphore owned by this orchestrator instance
/// - Per-attempt timeout: expiry becomes a timed-out outcome for that unit only
/// - Transient sandbox errors retried with capped exponential backoff
/// - Optional batch ceiling: still-pending units become system failures
/// - Results re-associated by position, never by arrival order
///
/// **Shared State:**
/// Only the semaphore and the atomic `RetryStats` counters.

use crate::config::GraderConfig;
use crate::harness::AssembledProgram;
use crate::sandbox::{ExecutionOutcome, SandboxClient, SandboxRequest};
use futures_util::stream::{FuturesUnordered, StreamExt};
use futures_util::FutureExt;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio::time::Instant;
use tracing::{debug, instrument, warn};

pub const BATCH_DEADLINE_MESSAGE: &str = "batch deadline exceeded";

/// Why a unit has no execution outcome: the infrastructure, not the student, failed
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SystemFailure {
    pub message: String,
    pub attempts: u32,
    pub transient: bool,
}

pub type UnitExecution = Result<ExecutionOutcome, SystemFailure>;

#[derive(Debug, Clone)]
pub struct UnitRun {
    pub unit_index: usize,
    pub execution: UnitExecution,
    pub attempts: u32,
}

#[derive(Debug, Clone)]
pub struct BatchReport {
    /// One entry per input program, in input order
    pub runs: Vec<UnitRun>,
    /// Units cut off by the batch ceiling
    pub curtailed: usize,
}

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_backoff: Duration,
    pub max_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_backoff: Duration::from_millis(200),
            max_backoff: Duration::from_millis(2_000),
        }
    }
}

impl RetryPolicy {
    /// Delay before the attempt following `attempt` (1-based)
    pub fn backoff_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(16);
        self.base_backoff
            .saturating_mul(1u32 << exponent)
            .min(self.max_backoff)
    }
}

#[derive(Debug, Default)]
pub struct RetryStats {
    attempts: AtomicU64,
    retries: AtomicU64,
    exhausted: AtomicU64,
    timeouts: AtomicU64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct RetrySnapshot {
    pub attempts: u64,
    pub retries: u64,
    pub exhausted: u64,
    pub timeouts: u64,
}

impl RetryStats {
    pub fn snapshot(&self) -> RetrySnapshot {
        RetrySnapshot {
            attempts: self.attempts.load(Ordering::Relaxed),
            retries: self.retries.load(Ordering::Relaxed),
            exhausted: self.exhausted.load(Ordering::Relaxed),
            timeouts: self.timeouts.load(Ordering::Relaxed),
        }
    }
}

/// Everything a dispatch task needs, shared by all tasks of this orchestrator
struct Dispatch {
    client: Arc<dyn SandboxClient>,
    permits: Arc<Semaphore>,
    unit_timeout: Duration,
    retry: RetryPolicy,
    stats: RetryStats,
}

pub struct Orchestrator {
    dispatch: Arc<Dispatch>,
    batch_timeout: Option<Duration>,
}

impl Orchestrator {
    pub fn new(
        client: Arc<dyn SandboxClient>,
        max_parallel: usize,
        unit_timeout: Duration,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            dispatch: Arc::new(Dispatch {
                client,
                permits: Arc::new(Semaphore::new(max_parallel.max(1))),
                unit_timeout,
                retry,
                stats: RetryStats::default(),
            }),
            batch_timeout: None,
        }
    }

    pub fn from_config(client: Arc<dyn SandboxClient>, config: &GraderConfig) -> Self {
        let retry = RetryPolicy {
            max_attempts: config.retry_attempts.max(1),
            base_backoff: config.retry_backoff,
            max_backoff: config.retry_max_backoff,
        };
        Self::new(client, config.max_parallel, config.unit_timeout, retry)
            .with_batch_timeout(config.batch_timeout)
    }

    pub fn with_batch_timeout(mut self, batch_timeout: Option<Duration>) -> Self {
        self.batch_timeout = batch_timeout;
        self
    }

    pub fn stats(&self) -> RetrySnapshot {
        self.dispatch.stats.snapshot()
    }

    pub fn sandbox_name(&self) -> &'static str {
        self.dispatch.client.name()
    }

    /// Execute every program; the report always has one run per program
    #[instrument(skip_all, fields(units = programs.len(), sandbox = self.sandbox_name()))]
    pub async fn run_batch(&self, programs: Vec<AssembledProgram>) -> BatchReport {
        let total = programs.len();
        let unit_indices: Vec<usize> = programs.iter().map(|p| p.unit_index).collect();
        let mut slots: Vec<Option<UnitRun>> = vec![None; total];
        let mut abort_handles = Vec::with_capacity(total);

        let mut pending: FuturesUnordered<_> = programs
            .into_iter()
            .enumerate()
            .map(|(position, program)| {
                let handle = tokio::spawn(run_unit(self.dispatch.clone(), program));
                abort_handles.push(handle.abort_handle());
                handle.map(move |joined| (position, joined))
            })
            .collect();

        let deadline = self.batch_timeout.map(|limit| Instant::now() + limit);

        loop {
            let next = match deadline {
                Some(deadline) => match tokio::time::timeout_at(deadline, pending.next()).await {
                    Ok(next) => next,
                    Err(_) => {
                        warn!(pending = pending.len(), "Batch deadline reached, aborting pending units");
                        for handle in &abort_handles {
                            handle.abort();
                        }
                        break;
                    }
                },
                None => pending.next().await,
            };

            let Some((position, joined)) = next else {
                break;
            };

            let run = match joined {
                Ok(run) => run,
                Err(join_error) => UnitRun {
                    unit_index: unit_indices[position],
                    execution: Err(SystemFailure {
                        message: format!("dispatch task failed: {}", join_error),
                        attempts: 0,
                        transient: false,
                    }),
                    attempts: 0,
                },
            };
            slots[position] = Some(run);
        }

        let mut curtailed = 0;
        let runs = slots
            .into_iter()
            .enumerate()
            .map(|(position, slot)| {
                slot.unwrap_or_else(|| {
                    curtailed += 1;
                    UnitRun {
                        unit_index: unit_indices[position],
                        execution: Err(SystemFailure {
                            message: BATCH_DEADLINE_MESSAGE.to_string(),
                            attempts: 0,
                            transient: true,
                        }),
                        attempts: 0,
                    }
                })
            })
            .collect();

        BatchReport { runs, curtailed }
    }
}

async fn run_unit(dispatch: Arc<Dispatch>, program: AssembledProgram) -> UnitRun {
    let unit_index = program.unit_index;
    let unit_name = program.unit.name.clone();

    let _permit = match dispatch.permits.clone().acquire_owned().await {
        Ok(permit) => permit,
        Err(_) => {
            return UnitRun {
                unit_index,
                execution: Err(SystemFailure {
                    message: "worker pool closed".to_string(),
                    attempts: 0,
                    transient: false,
                }),
                attempts: 0,
            }
        }
    };

    let request = SandboxRequest {
        language: program.language,
        file_name: program.file_name,
        source: program.source,
        stdin: None,
    };

    let mut attempt = 0;
    loop {
        attempt += 1;
        dispatch.stats.attempts.fetch_add(1, Ordering::Relaxed);

        let result = tokio::time::timeout(dispatch.unit_timeout, dispatch.client.execute(&request)).await;

        let execution = match result {
            Err(_) => {
                dispatch.stats.timeouts.fetch_add(1, Ordering::Relaxed);
                warn!(unit = %unit_name, attempt, timeout_ms = dispatch.unit_timeout.as_millis() as u64, "Unit timed out");
                Ok(ExecutionOutcome::timed_out_after(dispatch.unit_timeout))
            }
            Ok(Ok(outcome)) => {
                if outcome.timed_out {
                    dispatch.stats.timeouts.fetch_add(1, Ordering::Relaxed);
                }
                debug!(unit = %unit_name, attempt, exit_code = ?outcome.exit_code, "Unit executed");
                Ok(outcome)
            }
            Ok(Err(error)) => {
                let transient = error.is_transient();
                if transient && attempt < dispatch.retry.max_attempts {
                    let delay = dispatch.retry.backoff_for(attempt);
                    dispatch.stats.retries.fetch_add(1, Ordering::Relaxed);
                    warn!(
                        unit = %unit_name,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %error,
                        "Transient sandbox error, retrying"
                    );
                    tokio::time::sleep(delay).await;
                    continue;
                }

                if transient {
                    dispatch.stats.exhausted.fetch_add(1, Ordering::Relaxed);
                }
                warn!(unit = %unit_name, attempt, transient, error = %error, "Sandbox failure");
                Err(SystemFailure {
                    message: error.to_string(),
                    attempts: attempt,
                    transient,
                })
            }
        };

        return UnitRun {
            unit_index,
            execution,
            attempts: attempt,
        };
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sandbox::scripted::{self, Script, ScriptedSandbox};
    use crate::sandbox::SandboxError;
    use crate::splitter::{TestUnit, UnitShape};
    use grader_common::types::Language;

    fn program(index: usize, source: &str) -> AssembledProgram {
        AssembledProgram {
            unit_index: index,
            unit: Arc::new(TestUnit {
                name: format!("test_{}", index),
                shape: UnitShape::Verbatim,
                prelude: Vec::new(),
                declarations: Vec::new(),
                statements: Vec::new(),
                body: String::new(),
                source_points: 1,
                source_visible: true,
                definition_index: 0,
                definition_order: 0,
                position: index,
            }),
            language: Language::Python,
            file_name: "main.py".to_string(),
            source: source.to_string(),
        }
    }

    fn fast_retry(max_attempts: u32) -> RetryPolicy {
        RetryPolicy {
            max_attempts,
            base_backoff: Duration::from_millis(10),
            max_backoff: Duration::from_millis(40),
        }
    }

    #[test]
    fn test_backoff_is_capped() {
        let policy = fast_retry(5);
        assert_eq!(policy.backoff_for(1), Duration::from_millis(10));
        assert_eq!(policy.backoff_for(2), Duration::from_millis(20));
        assert_eq!(policy.backoff_for(3), Duration::from_millis(40));
        assert_eq!(policy.backoff_for(9), Duration::from_millis(40));
    }

    #[tokio::test(start_paused = true)]
    async fn test_results_keep_input_order() {
        // earlier units finish last
        let sandbox = Arc::new(ScriptedSandbox::new(|request, _| {
            let delay: u64 = request.source.parse().unwrap();
            Script::After(Duration::from_millis(delay), scripted::stdout(&request.source))
        }));
        let orchestrator = Orchestrator::new(sandbox, 4, Duration::from_secs(5), fast_retry(1));

        let programs = vec![program(0, "300"), program(1, "200"), program(2, "100")];
        let report = orchestrator.run_batch(programs).await;

        let outputs: Vec<String> = report
            .runs
            .iter()
            .map(|run| run.execution.as_ref().unwrap().stdout.clone())
            .collect();
        assert_eq!(outputs, vec!["300", "200", "100"]);
        assert_eq!(report.runs.iter().map(|r| r.unit_index).collect::<Vec<_>>(), vec![0, 1, 2]);
        assert_eq!(report.curtailed, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_parallelism_is_bounded() {
        let sandbox = Arc::new(ScriptedSandbox::new(|_, _| {
            Script::After(Duration::from_millis(50), scripted::stdout("ok"))
        }));
        let orchestrator = Orchestrator::new(sandbox.clone(), 2, Duration::from_secs(5), fast_retry(1));

        let programs = (0..6).map(|i| program(i, &i.to_string())).collect();
        let report = orchestrator.run_batch(programs).await;

        assert_eq!(report.runs.len(), 6);
        assert!(sandbox.peak_in_flight() <= 2);
        assert_eq!(sandbox.calls(), 6);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_affects_only_that_unit() {
        let sandbox = Arc::new(ScriptedSandbox::new(|request, _| {
            if request.source == "slow" {
                Script::Hang
            } else {
                Script::Reply(scripted::stdout("ok"))
            }
        }));
        let orchestrator = Orchestrator::new(sandbox, 4, Duration::from_secs(2), fast_retry(3));

        let report = orchestrator
            .run_batch(vec![program(0, "a"), program(1, "slow"), program(2, "b")])
            .await;

        let timed_out: Vec<bool> = report
            .runs
            .iter()
            .map(|run| run.execution.as_ref().unwrap().timed_out)
            .collect();
        assert_eq!(timed_out, vec![false, true, false]);
        assert_eq!(report.runs[1].attempts, 1);
        assert_eq!(orchestrator.stats().timeouts, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_transient_errors_are_retried() {
        let sandbox = Arc::new(ScriptedSandbox::new(|_, attempt| {
            if attempt < 3 {
                Script::Reply(Err(SandboxError::Http {
                    status: 502,
                    body: "bad gateway".to_string(),
                }))
            } else {
                Script::Reply(scripted::stdout("ok"))
            }
        }));
        let orchestrator = Orchestrator::new(sandbox, 1, Duration::from_secs(5), fast_retry(3));

        let report = orchestrator.run_batch(vec![program(0, "x")]).await;

        assert!(report.runs[0].execution.is_ok());
        assert_eq!(report.runs[0].attempts, 3);
        let stats = orchestrator.stats();
        assert_eq!(stats.attempts, 3);
        assert_eq!(stats.retries, 2);
        assert_eq!(stats.exhausted, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhausted_retries_become_system_failure() {
        let sandbox = Arc::new(ScriptedSandbox::new(|_, _| {
            Script::Reply(Err(SandboxError::Transport("connection refused".to_string())))
        }));
        let orchestrator = Orchestrator::new(sandbox, 1, Duration::from_secs(5), fast_retry(3));

        let report = orchestrator.run_batch(vec![program(0, "x")]).await;

        let failure = report.runs[0].execution.as_ref().unwrap_err();
        assert!(failure.transient);
        assert_eq!(failure.attempts, 3);
        assert!(failure.message.contains("connection refused"));
        assert_eq!(orchestrator.stats().exhausted, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_permanent_errors_are_not_retried() {
        let sandbox = Arc::new(ScriptedSandbox::new(|_, _| {
            Script::Reply(Err(SandboxError::UnsupportedLanguage(Language::Python)))
        }));
        let orchestrator = Orchestrator::new(sandbox.clone(), 1, Duration::from_secs(5), fast_retry(3));

        let report = orchestrator.run_batch(vec![program(0, "x")]).await;

        let failure = report.runs[0].execution.as_ref().unwrap_err();
        assert!(!failure.transient);
        assert_eq!(failure.attempts, 1);
        assert_eq!(sandbox.calls(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_batch_deadline_curtails_pending_units() {
        let sandbox = Arc::new(ScriptedSandbox::new(|request, _| {
            if request.source == "quick" {
                Script::Reply(scripted::stdout("ok"))
            } else {
                Script::After(Duration::from_secs(60), scripted::stdout("late"))
            }
        }));
        let orchestrator = Orchestrator::new(sandbox, 4, Duration::from_secs(120), fast_retry(1))
            .with_batch_timeout(Some(Duration::from_secs(1)));

        let report = orchestrator
            .run_batch(vec![program(0, "quick"), program(1, "slow"), program(2, "slower")])
            .await;

        assert_eq!(report.runs.len(), 3);
        assert!(report.runs[0].execution.is_ok());
        for run in &report.runs[1..] {
            let failure = run.execution.as_ref().unwrap_err();
            assert_eq!(failure.message, BATCH_DEADLINE_MESSAGE);
        }
        assert_eq!(report.curtailed, 2);
    }

    #[tokio::test]
    async fn test_empty_batch() {
        let sandbox = Arc::new(ScriptedSandbox::new(|_, _| Script::Reply(scripted::stdout(""))));
        let orchestrator = Orchestrator::new(sandbox, 2, Duration::from_secs(1), RetryPolicy::default());

        let report = orchestrator.run_batch(Vec::new()).await;
        assert!(report.runs.is_empty());
        assert_eq!(report.curtailed, 0);
    }
}

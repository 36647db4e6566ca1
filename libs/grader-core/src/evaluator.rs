/// Result Interpreter & Scorer - Unit Executions → Submission Grade
///
/// **Core Responsibility:**
/// Read what the sandbox brought back for each unit, decide pass/fail and
/// the failure kind, and aggregate the units into one grade.
///
/// **Critical Properties:**
/// - Knows nothing about HTTP, Redis or sandbox protocols
/// - Knows the harness output format, nothing about language runtimes
///   (compile diagnostics are classified by the unit's `LanguageHarness`)
/// - Pure functions: (unit, execution) → result, results → grade
///
/// **Scoring Rules:**
/// - A unit passes iff it exited normally, did not time out, and the harness
///   reported a passing verdict with no failures in its summary
/// - Units are atomic: pass earns `source_points`, anything else earns zero
/// - total_earned = Σ points_earned, total_possible = Σ source_points
/// - Zero possible points is an anomaly, never a perfect score
///
/// **Display Text Priority:**
/// 1. Harness marker line (`MESSAGE:` / `MISSING:` / `LOAD_ERROR:` / `ERROR:`)
/// 2. Last recognisable error line in stderr or compiler output
/// 3. The unit's display name
/// 4. "execution failed"

use crate::harness::{LanguageHarness, EXIT_LOAD_ERROR, EXIT_MISSING_SYMBOL};
use crate::orchestrator::{SystemFailure, UnitRun};
use crate::sandbox::ExecutionOutcome;
use crate::splitter::{extract_display_name, TestUnit};
use chrono::Utc;
use grader_common::types::{total_points, GradingAnomaly, Language, SubmissionGrade, TestResult, UnitStatus};
use lazy_static::lazy_static;
use regex::Regex;
use std::collections::BTreeMap;
use tracing::{debug, info, warn};
use uuid::Uuid;

pub const CONSOLE_START: &str = "=== Console Output ===";
pub const CONSOLE_END: &str = "=== End Console Output ===";
pub const SUMMARY_HEADER: &str = "=== Test Results ===";
pub const EXECUTION_FAILED: &str = "execution failed";

const MAX_DISPLAY_CHARS: usize = 300;

/// Two or more timeouts in one submission points at the sandbox, not the student
const REPEATED_TIMEOUT_THRESHOLD: usize = 2;

lazy_static! {
    static ref ERROR_LINE: Regex = Regex::new(
        r"(?i)(\b\w*(error|exception)\b|panicked at|assertion\b.*\bfailed|exception in thread|^error(\[E\d{4}\])?:)"
    )
    .unwrap();
}

const MEMORY_PATTERNS: &[&str] = &[
    "MemoryError",
    "std::bad_alloc",
    "OutOfMemoryError",
    "memory allocation of",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Verdict {
    pub passed: bool,
    pub points: u32,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SummaryCounts {
    pub passed: u32,
    pub failed: u32,
    pub total: u32,
    pub earned: u32,
    pub total_points: u32,
}

impl SummaryCounts {
    pub fn is_consistent(&self) -> bool {
        self.passed + self.failed == self.total && self.earned <= self.total_points
    }
}

/// Everything the harness printed, recovered from stdout
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HarnessReport {
    pub console: Option<String>,
    pub verdict: Option<Verdict>,
    pub message: Option<String>,
    pub missing: Option<String>,
    pub load_error: Option<String>,
    pub error: Option<String>,
    pub summary: Option<SummaryCounts>,
}

impl HarnessReport {
    /// The marker line explaining a failure, formatted for students
    pub fn failure_text(&self) -> Option<String> {
        if let Some(symbol) = &self.missing {
            return Some(format!("Missing implementation: {}", symbol));
        }
        if let Some(message) = &self.load_error {
            return Some(format!("Submission failed to load: {}", message));
        }
        self.message.clone().or_else(|| self.error.clone())
    }
}

/// Parse harness stdout. Later marker lines win over earlier ones, since the
/// harness reports after the unit's own output.
pub fn parse_harness_output(stdout: &str) -> HarnessReport {
    let mut report = HarnessReport::default();
    let mut console: Option<Vec<&str>> = None;
    let mut in_summary = false;
    let mut summary = SummaryCounts::default();

    for line in stdout.lines() {
        let line = line.trim_end_matches('\r');

        if console.is_some() {
            if line == CONSOLE_END {
                report.console = console.take().map(|lines| lines.join("\n"));
            } else if let Some(buffer) = console.as_mut() {
                buffer.push(line);
            }
            continue;
        }

        if line == CONSOLE_START {
            console = Some(Vec::new());
            continue;
        }

        if line == SUMMARY_HEADER {
            in_summary = true;
            summary = SummaryCounts::default();
            continue;
        }

        if in_summary {
            if let Some((key, value)) = line.split_once(':') {
                if let Ok(value) = value.trim().parse::<u32>() {
                    match key.trim() {
                        "Passed" => summary.passed = value,
                        "Failed" => summary.failed = value,
                        "Total" => summary.total = value,
                        "Earned" => summary.earned = value,
                        "TotalPoints" => {
                            summary.total_points = value;
                            report.summary = Some(summary);
                            in_summary = false;
                        }
                        _ => {}
                    }
                    continue;
                }
            }
            in_summary = false;
        }

        if let Some(rest) = line.strip_prefix("PASSED: ") {
            report.verdict = Some(Verdict {
                passed: true,
                points: trailing_points(rest),
            });
        } else if line.starts_with("FAILED: ") {
            report.verdict = Some(Verdict {
                passed: false,
                points: 0,
            });
        } else if let Some(rest) = line.strip_prefix("MESSAGE: ") {
            report.message = Some(rest.trim().to_string());
        } else if let Some(rest) = line.strip_prefix("MISSING: ") {
            report.missing = Some(rest.trim().to_string());
        } else if let Some(rest) = line.strip_prefix("LOAD_ERROR: ") {
            report.load_error = Some(rest.trim().to_string());
        } else if let Some(rest) = line.strip_prefix("ERROR: ") {
            report.error = Some(rest.trim().to_string());
        }
    }

    // Unterminated console block: keep what was printed
    if let Some(lines) = console {
        report.console = Some(lines.join("\n"));
    }

    report
}

fn trailing_points(verdict: &str) -> u32 {
    verdict
        .rsplit_once(':')
        .and_then(|(_, points)| points.trim().parse().ok())
        .unwrap_or(0)
}

fn truncate(text: &str) -> String {
    let text = text.trim();
    if text.chars().count() <= MAX_DISPLAY_CHARS {
        return text.to_string();
    }
    let cut: String = text.chars().take(MAX_DISPLAY_CHARS).collect();
    format!("{}...", cut)
}

fn last_error_line(text: &str) -> Option<String> {
    text.lines()
        .rev()
        .map(str::trim)
        .find(|line| !line.is_empty() && ERROR_LINE.is_match(line))
        .map(truncate)
}

/// Compilers lead with the root cause
fn first_error_line(text: &str) -> Option<String> {
    text.lines()
        .map(str::trim)
        .find(|line| !line.is_empty() && ERROR_LINE.is_match(line))
        .map(truncate)
}

fn is_memory_failure(outcome: &ExecutionOutcome) -> bool {
    MEMORY_PATTERNS
        .iter()
        .any(|pattern| outcome.stderr.contains(pattern) || outcome.stdout.contains(pattern))
}

fn fallback_text(unit: &TestUnit) -> String {
    let name = extract_display_name(unit);
    if name.trim().is_empty() {
        EXECUTION_FAILED.to_string()
    } else {
        name
    }
}

/// Classify a completed execution
fn classify(
    outcome: &ExecutionOutcome,
    report: &HarnessReport,
    harness: &dyn LanguageHarness,
) -> UnitStatus {
    if outcome.timed_out {
        return UnitStatus::Timeout;
    }
    if let Some(compile) = outcome.compile.as_ref().filter(|c| c.failed()) {
        return harness.classify_compile_failure(&compile.diagnostics());
    }

    let summary_clean = report.summary.map_or(true, |s| s.failed == 0);
    let verdict_passed = report.verdict.is_some_and(|v| v.passed);
    if outcome.exited_normally() && summary_clean && verdict_passed {
        return UnitStatus::Passed;
    }

    if report.missing.is_some() || outcome.exit_code == Some(EXIT_MISSING_SYMBOL) {
        UnitStatus::MissingSymbol
    } else if report.load_error.is_some() || outcome.exit_code == Some(EXIT_LOAD_ERROR) {
        UnitStatus::LoadError
    } else if report.message.is_some() {
        UnitStatus::AssertionFailed
    } else if is_memory_failure(outcome) {
        UnitStatus::MemoryLimit
    } else {
        UnitStatus::RuntimeError
    }
}

fn display_text(
    status: UnitStatus,
    unit: &TestUnit,
    outcome: &ExecutionOutcome,
    report: &HarnessReport,
) -> String {
    match status {
        UnitStatus::Passed => fallback_text(unit),
        UnitStatus::Timeout => format!("Timed out after {} ms", outcome.duration_ms),
        UnitStatus::CompileError | UnitStatus::MissingSymbol if outcome.compile_failed() => outcome
            .compile
            .as_ref()
            .and_then(|compile| first_error_line(&compile.diagnostics()))
            .unwrap_or_else(|| fallback_text(unit)),
        UnitStatus::MemoryLimit => last_error_line(&outcome.stderr)
            .unwrap_or_else(|| "Memory limit exceeded".to_string()),
        _ => report
            .failure_text()
            .map(|text| truncate(&text))
            .or_else(|| last_error_line(&outcome.stderr))
            .unwrap_or_else(|| fallback_text(unit)),
    }
}

/// Turn one unit's execution into its scored result
pub fn interpret(unit: &TestUnit, run: &UnitRun, harness: &dyn LanguageHarness) -> TestResult {
    match &run.execution {
        Ok(outcome) => interpret_outcome(unit, outcome, run.attempts, harness),
        Err(failure) => system_error_result(unit, failure, run.attempts),
    }
}

fn interpret_outcome(
    unit: &TestUnit,
    outcome: &ExecutionOutcome,
    attempts: u32,
    harness: &dyn LanguageHarness,
) -> TestResult {
    let report = parse_harness_output(&outcome.stdout);

    if let Some(summary) = report.summary.filter(|s| !s.is_consistent()) {
        warn!(unit = %unit.name, ?summary, "Harness summary is inconsistent");
    }

    let status = classify(outcome, &report, harness);
    let passed = status.is_passed();
    let display_text = display_text(status, unit, outcome, &report);

    debug!(
        unit = %unit.name,
        status = %status,
        exit_code = ?outcome.exit_code,
        duration_ms = outcome.duration_ms,
        "Unit interpreted"
    );

    let stderr = match outcome.compile.as_ref().filter(|c| c.failed()) {
        Some(compile) => compile.diagnostics(),
        None => outcome.stderr.clone(),
    };

    TestResult {
        unit_name: unit.name.clone(),
        definition_index: unit.definition_index,
        definition_order: unit.definition_order,
        status,
        passed,
        points_earned: if passed { unit.source_points } else { 0 },
        points_possible: unit.source_points,
        visible: unit.source_visible,
        display_text,
        console_output: report.console,
        stdout: outcome.stdout.clone(),
        stderr,
        duration_ms: outcome.duration_ms,
        attempts,
    }
}

/// The infrastructure failed; the student gets no points but a clear flag
pub fn system_error_result(unit: &TestUnit, failure: &SystemFailure, attempts: u32) -> TestResult {
    TestResult {
        unit_name: unit.name.clone(),
        definition_index: unit.definition_index,
        definition_order: unit.definition_order,
        status: UnitStatus::SystemError,
        passed: false,
        points_earned: 0,
        points_possible: unit.source_points,
        visible: unit.source_visible,
        display_text: "Could not be graded because of a system error".to_string(),
        console_output: None,
        stdout: String::new(),
        stderr: failure.message.clone(),
        duration_ms: 0,
        attempts,
    }
}

/// Aggregate unit results into the submission grade
///
/// `empty_definitions` holds the `order` of each definition that produced no
/// units; `curtailed` is how many units the batch ceiling cut off.
pub fn aggregate(
    submission_id: Uuid,
    language: Language,
    results: Vec<TestResult>,
    empty_definitions: &[i32],
    curtailed: usize,
) -> SubmissionGrade {
    let total_earned = total_points(results.iter().map(|r| r.points_earned));
    let total_possible = total_points(results.iter().map(|r| r.points_possible));

    let mut by_kind: BTreeMap<String, usize> = BTreeMap::new();
    let mut names: BTreeMap<&str, usize> = BTreeMap::new();
    for result in &results {
        *by_kind.entry(result.status.label().to_string()).or_default() += 1;
        *names.entry(result.unit_name.as_str()).or_default() += 1;
    }

    let mut anomalies: Vec<GradingAnomaly> = empty_definitions
        .iter()
        .map(|&definition_order| GradingAnomaly::NoTestUnits { definition_order })
        .collect();

    if total_possible == 0 {
        anomalies.push(GradingAnomaly::NoPossiblePoints);
    }

    anomalies.extend(
        names
            .into_iter()
            .filter(|(_, count)| *count > 1)
            .map(|(name, count)| GradingAnomaly::DuplicateUnitName {
                name: name.to_string(),
                count,
            }),
    );

    let timeouts = by_kind.get(UnitStatus::Timeout.label()).copied().unwrap_or(0);
    if timeouts >= REPEATED_TIMEOUT_THRESHOLD {
        anomalies.push(GradingAnomaly::RepeatedTimeouts { count: timeouts });
    }

    let system_failures = by_kind.get(UnitStatus::SystemError.label()).copied().unwrap_or(0);
    if system_failures > 0 {
        anomalies.push(GradingAnomaly::SystemFailures {
            count: system_failures,
        });
    }

    if curtailed > 0 {
        anomalies.push(GradingAnomaly::BatchCurtailed { pending: curtailed });
    }

    info!(
        submission_id = %submission_id,
        units = results.len(),
        earned = total_earned,
        possible = total_possible,
        anomalies = anomalies.len(),
        "Evaluation complete"
    );
    for anomaly in &anomalies {
        warn!(submission_id = %submission_id, ?anomaly, "Grading anomaly");
    }

    SubmissionGrade {
        submission_id,
        language,
        total_earned,
        total_possible,
        results,
        anomalies,
        by_kind,
        graded_at: Utc::now(),
    }
}

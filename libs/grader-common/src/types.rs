use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// Target languages the grading pipeline can split, assemble and score.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Language {
    #[serde(alias = "py", alias = "python3")]
    Python,
    Java,
    #[serde(alias = "c++", alias = "cxx", alias = "cc")]
    Cpp,
    #[serde(alias = "rs")]
    Rust,
}

impl Language {
    pub const ALL: [Language; 4] = [Language::Python, Language::Java, Language::Cpp, Language::Rust];

    /// Canonical lowercase identifier, also used as the `languages.json` key
    pub fn as_str(&self) -> &'static str {
        match self {
            Language::Python => "python",
            Language::Java => "java",
            Language::Cpp => "cpp",
            Language::Rust => "rust",
        }
    }
}

impl fmt::Display for Language {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnknownLanguage(pub String);

impl fmt::Display for UnknownLanguage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "unsupported language: {}", self.0)
    }
}

impl std::error::Error for UnknownLanguage {}

impl FromStr for Language {
    type Err = UnknownLanguage;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "python" | "py" | "python3" => Ok(Language::Python),
            "java" => Ok(Language::Java),
            "cpp" | "c++" | "cxx" | "cc" => Ok(Language::Cpp),
            "rust" | "rs" => Ok(Language::Rust),
            other => Err(UnknownLanguage(other.to_string())),
        }
    }
}

/// Instructor-authored source of one gradable check, as persisted by the CRUD layer
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TestDefinition {
    pub code: String,
    #[serde(default)]
    pub visible: bool,
    #[serde(default)]
    pub points: u32,
    #[serde(default)]
    pub order: i32,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobMetadata {
    #[serde(default)]
    pub assignment_id: Option<String>,
    #[serde(default)]
    pub student_id: Option<String>,
    #[serde(default)]
    pub submitted_at: Option<DateTime<Utc>>,
}

/// A queued request to grade one submission against an assignment's tests
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GradingJob {
    pub id: Uuid,
    pub language: Language,
    pub submission_source: String,
    pub definitions: Vec<TestDefinition>,
    #[serde(default)]
    pub metadata: JobMetadata,
}

/// Verdict for a single test unit
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum UnitStatus {
    Passed,
    /// Wrong answer: an assertion or check in the test failed
    AssertionFailed,
    RuntimeError,
    /// The submission does not implement the interface the test calls
    MissingSymbol,
    CompileError,
    /// The submission raised while being loaded
    LoadError,
    Timeout,
    MemoryLimit,
    /// The sandbox could not be reached or answered garbage; not the student's fault
    SystemError,
}

impl UnitStatus {
    pub fn is_passed(&self) -> bool {
        matches!(self, UnitStatus::Passed)
    }

    pub fn label(&self) -> &'static str {
        match self {
            UnitStatus::Passed => "PASSED",
            UnitStatus::AssertionFailed => "ASSERTION_FAILED",
            UnitStatus::RuntimeError => "RUNTIME_ERROR",
            UnitStatus::MissingSymbol => "MISSING_SYMBOL",
            UnitStatus::CompileError => "COMPILE_ERROR",
            UnitStatus::LoadError => "LOAD_ERROR",
            UnitStatus::Timeout => "TIMEOUT",
            UnitStatus::MemoryLimit => "MEMORY_LIMIT",
            UnitStatus::SystemError => "SYSTEM_ERROR",
        }
    }
}

impl fmt::Display for UnitStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TestResult {
    pub unit_name: String,
    /// Index of the originating definition after ordering by `order`
    pub definition_index: usize,
    pub definition_order: i32,
    pub status: UnitStatus,
    pub passed: bool,
    pub points_earned: u32,
    pub points_possible: u32,
    pub visible: bool,
    pub display_text: String,
    #[serde(default)]
    pub console_output: Option<String>,
    pub stdout: String,
    pub stderr: String,
    pub duration_ms: u64,
    pub attempts: u32,
}

/// Grading problems that are not the student's fault and need faculty attention
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum GradingAnomaly {
    /// A test definition produced no executable unit
    NoTestUnits { definition_order: i32 },
    /// Nothing was gradable, so a score would be meaningless
    NoPossiblePoints,
    DuplicateUnitName { name: String, count: usize },
    RepeatedTimeouts { count: usize },
    SystemFailures { count: usize },
    BatchCurtailed { pending: usize },
}

/// Aggregate outcome of one grading run. Never mutated; a regrade produces a new one.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubmissionGrade {
    pub submission_id: Uuid,
    pub language: Language,
    pub total_earned: u32,
    pub total_possible: u32,
    pub results: Vec<TestResult>,
    pub anomalies: Vec<GradingAnomaly>,
    /// Number of results per status label
    pub by_kind: BTreeMap<String, usize>,
    pub graded_at: DateTime<Utc>,
}

impl SubmissionGrade {
    /// Percentage of possible points earned, 0.0 when nothing was gradable
    pub fn score_pct(&self) -> f64 {
        if self.total_possible == 0 {
            return 0.0;
        }
        let pct = 100.0 * self.total_earned as f64 / self.total_possible as f64;
        (pct * 100.0).round() / 100.0
    }

    pub fn passed_count(&self) -> usize {
        self.results.iter().filter(|r| r.passed).count()
    }

    pub fn failed_count(&self) -> usize {
        self.results.len() - self.passed_count()
    }

    pub fn all_passed(&self) -> bool {
        !self.results.is_empty() && self.results.iter().all(|r| r.passed)
    }

    pub fn is_anomalous(&self) -> bool {
        !self.anomalies.is_empty()
    }

    pub fn visible_results(&self) -> impl Iterator<Item = &TestResult> {
        self.results.iter().filter(|r| r.visible)
    }

    pub fn visible_earned(&self) -> u32 {
        total_points(self.visible_results().map(|r| r.points_earned))
    }

    pub fn visible_possible(&self) -> u32 {
        total_points(self.visible_results().map(|r| r.points_possible))
    }

    /// What a student may see: visible units only, no anomaly flags
    pub fn student_view(&self) -> StudentGrade {
        StudentGrade {
            submission_id: self.submission_id,
            total_earned: self.visible_earned(),
            total_possible: self.visible_possible(),
            results: self.visible_results().cloned().collect(),
            graded_at: self.graded_at,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StudentGrade {
    pub submission_id: Uuid,
    pub total_earned: u32,
    pub total_possible: u32,
    pub results: Vec<TestResult>,
    pub graded_at: DateTime<Utc>,
}

/// What the worker stores for a job
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum GradingOutcome {
    Graded(SubmissionGrade),
    /// Pipeline-level failure: the job could not be graded at all
    Rejected { job_id: Uuid, reason: String },
}

impl GradingOutcome {
    pub fn job_id(&self) -> Uuid {
        match self {
            GradingOutcome::Graded(grade) => grade.submission_id,
            GradingOutcome::Rejected { job_id, .. } => *job_id,
        }
    }

    pub fn status(&self) -> JobStatus {
        match self {
            GradingOutcome::Graded(_) => JobStatus::Completed,
            GradingOutcome::Rejected { .. } => JobStatus::Rejected,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Queued,
    Completed,
    Rejected,
}

/// Sum of unit points, saturating instead of overflowing
pub fn total_points(points: impl IntoIterator<Item = u32>) -> u32 {
    points.into_iter().fold(0, u32::saturating_add)
}

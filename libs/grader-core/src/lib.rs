//! Grading pipeline: split instructor tests into units, wrap each unit with the
//! student submission, run the programs in an external sandbox and score them.

pub mod config;
pub mod evaluator;
pub mod grader;
pub mod harness;
pub mod orchestrator;
pub mod sandbox;
pub mod splitter;


pub use config::{GraderConfig, LanguageConfigManager, SandboxBackend};
pub use grader::{GradeError, GradeRequest, Grader};
pub use splitter::WeightPolicy;

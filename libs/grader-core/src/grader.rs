/// Grader - The Grading Invocation
///
/// **Pipeline:**
/// definitions → Splitter → units → Assembler → programs → Orchestrator →
/// executions → Interpreter → results → Scorer → SubmissionGrade
///
/// Only two things abort a grading run: an empty submission and a language
/// nothing can run. Everything else lands in a per-unit result or an anomaly.

use crate::config::{GraderConfig, LanguageConfigManager};
use crate::evaluator::{aggregate, interpret, system_error_result};
use crate::harness::HarnessRegistry;
use crate::orchestrator::{Orchestrator, SystemFailure};
use crate::sandbox::client_for;
use crate::splitter::{split_definition, TestUnit, WeightPolicy};
use anyhow::Context;
use grader_common::types::{Language, SubmissionGrade, TestDefinition, TestResult};
use std::sync::Arc;
use thiserror::Error;
use tracing::{info, instrument, warn};
use uuid::Uuid;

#[derive(Debug, Clone)]
pub struct GradeRequest {
    pub submission_id: Uuid,
    pub submission_source: String,
    pub language: Language,
    pub definitions: Vec<TestDefinition>,
}

impl GradeRequest {
    pub fn new(
        submission_source: impl Into<String>,
        language: Language,
        definitions: Vec<TestDefinition>,
    ) -> Self {
        Self {
            submission_id: Uuid::new_v4(),
            submission_source: submission_source.into(),
            language,
            definitions,
        }
    }

    pub fn with_submission_id(mut self, submission_id: Uuid) -> Self {
        self.submission_id = submission_id;
        self
    }
}

/// Pipeline-level failures: the submission could not be graded at all
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum GradeError {
    #[error("submission is empty")]
    EmptySubmission,

    #[error("unsupported language: {0}")]
    UnsupportedLanguage(Language),
}

/// Units of every definition, in `order` then source order, plus the `order`
/// of each definition that yielded none
pub fn split_definitions(
    definitions: &[TestDefinition],
    language: Language,
    policy: WeightPolicy,
) -> (Vec<TestUnit>, Vec<i32>) {
    let mut ordered: Vec<&TestDefinition> = definitions.iter().collect();
    ordered.sort_by_key(|definition| definition.order);

    let mut units = Vec::new();
    let mut empty = Vec::new();
    for (index, definition) in ordered.into_iter().enumerate() {
        let split = split_definition(definition, index, language, policy);
        if split.is_empty() {
            empty.push(definition.order);
        }
        units.extend(split);
    }

    (units, empty)
}

pub struct Grader {
    registry: Arc<HarnessRegistry>,
    orchestrator: Orchestrator,
    policy: WeightPolicy,
}

impl Grader {
    pub fn new(registry: Arc<HarnessRegistry>, orchestrator: Orchestrator, policy: WeightPolicy) -> Self {
        Self {
            registry,
            orchestrator,
            policy,
        }
    }

    /// Languages file, harness registry and sandbox client from configuration
    pub fn from_config(config: &GraderConfig) -> anyhow::Result<Self> {
        let languages = LanguageConfigManager::resolve(config.languages_config.as_deref())
            .context("Failed to load language configuration")?;
        let registry = HarnessRegistry::new(languages.clone()).context("Failed to build harnesses")?;
        let client = client_for(config, languages).context("Failed to create sandbox client")?;

        info!(
            backend = %config.backend,
            sandbox_url = %config.sandbox_url,
            max_parallel = config.max_parallel,
            unit_timeout_ms = config.unit_timeout.as_millis() as u64,
            policy = %config.weight_policy,
            "Grader configured"
        );

        Ok(Self::new(
            Arc::new(registry),
            Orchestrator::from_config(client, config),
            config.weight_policy,
        ))
    }

    pub fn orchestrator(&self) -> &Orchestrator {
        &self.orchestrator
    }

    pub fn registry(&self) -> &HarnessRegistry {
        &self.registry
    }

    #[instrument(skip_all, fields(submission_id = %request.submission_id, language = %request.language))]
    pub async fn grade(&self, request: GradeRequest) -> Result<SubmissionGrade, GradeError> {
        if request.submission_source.trim().is_empty() {
            return Err(GradeError::EmptySubmission);
        }
        if !self.registry.supports(request.language) {
            return Err(GradeError::UnsupportedLanguage(request.language));
        }
        let harness = self
            .registry
            .get(request.language)
            .map_err(|_| GradeError::UnsupportedLanguage(request.language))?;

        let (units, empty_definitions) =
            split_definitions(&request.definitions, request.language, self.policy);
        let units: Vec<Arc<TestUnit>> = units.into_iter().map(Arc::new).collect();

        info!(
            definitions = request.definitions.len(),
            units = units.len(),
            "Test definitions split"
        );

        let mut results: Vec<Option<TestResult>> = vec![None; units.len()];
        let mut programs = Vec::with_capacity(units.len());

        for (index, unit) in units.iter().enumerate() {
            match self
                .registry
                .assemble(request.language, &request.submission_source, index, unit.clone())
            {
                Ok(program) => programs.push(program),
                Err(e) => {
                    warn!(unit = %unit.name, error = %e, "Failed to assemble harness");
                    let failure = SystemFailure {
                        message: format!("harness assembly failed: {}", e),
                        attempts: 0,
                        transient: false,
                    };
                    results[index] = Some(system_error_result(unit, &failure, 0));
                }
            }
        }

        let report = self.orchestrator.run_batch(programs).await;

        for run in &report.runs {
            let unit = &units[run.unit_index];
            results[run.unit_index] = Some(interpret(unit, run, harness.as_ref()));
        }

        let results: Vec<TestResult> = results
            .into_iter()
            .zip(&units)
            .map(|(result, unit)| {
                result.unwrap_or_else(|| {
                    let failure = SystemFailure {
                        message: "unit was never executed".to_string(),
                        attempts: 0,
                        transient: false,
                    };
                    system_error_result(unit, &failure, 0)
                })
            })
            .collect();

        Ok(aggregate(
            request.submission_id,
            request.language,
            results,
            &empty_definitions,
            report.curtailed,
        ))
    }
}

use super::{template_engine, HarnessError, LanguageHarness};
use super::{EXIT_FAILED, EXIT_LOAD_ERROR, EXIT_MISSING_SYMBOL, EXIT_PASSED};
use crate::splitter::TestUnit;
use grader_common::types::Language;
use handlebars::Handlebars;
use serde_json::json;

const TEMPLATE_NAME: &str = "python";
const TEMPLATE: &str = include_str!("../../templates/python.hbs");

/// Submission and unit travel as JSON string literals (valid Python), are
/// registered with `linecache` for readable tracebacks, and run through `exec`
/// in a namespace named `submission` so a `__main__` guard stays dormant
pub struct PythonHarness {
    templates: Handlebars<'static>,
}

impl PythonHarness {
    pub fn new() -> Result<Self, HarnessError> {
        Ok(Self {
            templates: template_engine(TEMPLATE_NAME, TEMPLATE)?,
        })
    }
}

impl LanguageHarness for PythonHarness {
    fn language(&self) -> Language {
        Language::Python
    }

    fn assemble(&self, submission: &str, unit: &TestUnit) -> Result<String, HarnessError> {
        let data = json!({
            "submission": serde_json::to_string(submission)?,
            "test_source": serde_json::to_string(&unit.body)?,
            "prelude": serde_json::to_string(&unit.prelude)?,
            "unit_name": serde_json::to_string(&unit.name)?,
            "points": unit.source_points,
            "exit_passed": EXIT_PASSED,
            "exit_failed": EXIT_FAILED,
            "exit_missing": EXIT_MISSING_SYMBOL,
            "exit_load_error": EXIT_LOAD_ERROR,
        });

        Ok(self.templates.render(TEMPLATE_NAME, &data)?)
    }
}

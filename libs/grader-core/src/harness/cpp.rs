use super::{mentions_any, rename_entry_point, string_literal, template_engine, HarnessError, LanguageHarness};
use super::{EXIT_FAILED, EXIT_PASSED};
use crate::splitter::TestUnit;
use grader_common::types::{Language, UnitStatus};
use handlebars::Handlebars;
use lazy_static::lazy_static;
use regex::Regex;
use serde_json::json;

const TEMPLATE_NAME: &str = "cpp";
const TEMPLATE: &str = include_str!("../../templates/cpp.hbs");

lazy_static! {
    static ref STUDENT_MAIN: Regex = Regex::new(r"\bint\s+main\s*\(").unwrap();
}

const MISSING_SYMBOL_DIAGNOSTICS: &[&str] = &[
    "was not declared in this scope",
    "undeclared identifier",
    "has no member named",
    "no member named",
    "is not a member of",
    "undefined reference to",
];

/// Output capture is installed by a static object defined ahead of the
/// submission; `assert` is redefined after it to throw instead of abort
pub struct CppHarness {
    templates: Handlebars<'static>,
}

impl CppHarness {
    pub fn new() -> Result<Self, HarnessError> {
        Ok(Self {
            templates: template_engine(TEMPLATE_NAME, TEMPLATE)?,
        })
    }
}

impl LanguageHarness for CppHarness {
    fn language(&self) -> Language {
        Language::Cpp
    }

    fn assemble(&self, submission: &str, unit: &TestUnit) -> Result<String, HarnessError> {
        let submission = rename_entry_point(submission, &STUDENT_MAIN, "int student_main_(", false);

        let data = json!({
            "prelude": unit.prelude,
            "submission": submission,
            "declarations": unit.declarations,
            "statements": unit.statements,
            "unit_name": string_literal(&unit.name),
            "points": unit.source_points,
            "exit_passed": EXIT_PASSED,
            "exit_failed": EXIT_FAILED,
        });

        Ok(self.templates.render(TEMPLATE_NAME, &data)?)
    }

    fn classify_compile_failure(&self, diagnostics: &str) -> UnitStatus {
        if mentions_any(diagnostics, MISSING_SYMBOL_DIAGNOSTICS) {
            UnitStatus::MissingSymbol
        } else {
            UnitStatus::CompileError
        }
    }
}

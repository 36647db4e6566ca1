use super::{mentions_any, rename_entry_point, string_literal, template_engine, HarnessError, LanguageHarness};
use super::{EXIT_FAILED, EXIT_PASSED};
use crate::splitter::TestUnit;
use grader_common::types::{Language, UnitStatus};
use handlebars::Handlebars;
use lazy_static::lazy_static;
use regex::Regex;
use serde_json::json;

const TEMPLATE_NAME: &str = "rust";
const TEMPLATE: &str = include_str!("../../templates/rust.hbs");

lazy_static! {
    static ref STUDENT_MAIN: Regex = Regex::new(r"\bfn\s+main\s*\(").unwrap();
    static ref INNER_ATTRIBUTE: Regex = Regex::new(r"(?m)^[ \t]*#!\[[^\]]*\][ \t]*\r?\n?").unwrap();
    static ref TEST_ATTRIBUTE: Regex = Regex::new(r"#\[\s*test\s*\]\s*").unwrap();
}

const MISSING_SYMBOL_DIAGNOSTICS: &[&str] = &[
    "cannot find function",
    "cannot find value",
    "cannot find type",
    "cannot find struct",
    "cannot find macro",
    "unresolved import",
    "no method named",
    "no function or associated item named",
    "error[E0425]",
    "error[E0433]",
    "error[E0412]",
    "error[E0432]",
    "error[E0599]",
];

/// No implicit initialisation runs before `main`, so there is no console
/// block; the unit runs under `catch_unwind` with the panic hook silenced
pub struct RustHarness {
    templates: Handlebars<'static>,
}

impl RustHarness {
    pub fn new() -> Result<Self, HarnessError> {
        Ok(Self {
            templates: template_engine(TEMPLATE_NAME, TEMPLATE)?,
        })
    }
}

impl LanguageHarness for RustHarness {
    fn language(&self) -> Language {
        Language::Rust
    }

    fn assemble(&self, submission: &str, unit: &TestUnit) -> Result<String, HarnessError> {
        // inner attributes must precede every item in the crate
        let inner_attributes: Vec<String> = INNER_ATTRIBUTE
            .find_iter(submission)
            .map(|m| m.as_str().trim().to_string())
            .collect();
        let submission = INNER_ATTRIBUTE.replace_all(submission, "");
        let submission = rename_entry_point(&submission, &STUDENT_MAIN, "fn student_main_(", true);

        // `#[test]` functions vanish outside `cargo test`, so the call would not resolve
        let declarations: Vec<String> = unit
            .declarations
            .iter()
            .map(|d| TEST_ATTRIBUTE.replace_all(d, "").into_owned())
            .collect();

        let data = json!({
            "inner_attributes": inner_attributes,
            "prelude": unit.prelude,
            "submission": submission,
            "declarations": declarations,
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

#[cfg(test)]
mod tests {
    use super::*;
    use crate::harness::tests::unit_for;

    #[test]
    fn test_rust_program_layout() {
        let harness = RustHarness::new().unwrap();
        let unit = unit_for(
            "use std::collections::HashMap;\n\n#[test]\nfn test_add() {\n    assert_eq!(add(2, 3), 5);\n}\n",
            Language::Rust,
        );
        let submission = "#![allow(unused)]\npub fn add(a: i32, b: i32) -> i32 { a + b }\n\nfn main() {\n    println!(\"fn main() {{}}\");\n}\n";

        let program = harness.assemble(submission, &unit).unwrap();

        assert!(program.find("#![allow(unused)]").unwrap() < program.find("use std::collections::HashMap;").unwrap());
        assert!(program.contains("fn student_main_() {"));
        assert!(program.contains("println!(\"fn main() {{}}\");"));
        assert!(!program.contains("#[test]"));
        assert!(program.contains("fn test_add() {"));
        assert!(program.contains("test_add();"));
        assert_eq!(program.matches("\nfn main() {").count(), 1);
    }

    #[test]
    fn test_compile_classification() {
        let harness = RustHarness::new().unwrap();
        let missing = "error[E0425]: cannot find function `add` in this scope\n --> main.rs:12:16";
        assert_eq!(harness.classify_compile_failure(missing), UnitStatus::MissingSymbol);
        assert_eq!(
            harness.classify_compile_failure("error[E0308]: mismatched types"),
            UnitStatus::CompileError
        );
    }

    #[test]
    fn test_let_statements_run_inside_main() {
        let harness = RustHarness::new().unwrap();
        let unit = unit_for(
            "struct Point { x: i32, y: i32 }\nlet p = Point { x: 1, y: 2 };\nassert_eq!(add(p.x, p.y), 3);\n",
            Language::Rust,
        );
        assert_eq!(unit.declarations, vec!["struct Point { x: i32, y: i32 }".to_string()]);

        let program = harness
            .assemble("pub fn add(a: i32, b: i32) -> i32 { a + b }\n", &unit)
            .unwrap();

        let main = program.find("\nfn main() {").unwrap();
        assert!(program.find("struct Point").unwrap() < main);
        assert!(program.find("let p = Point { x: 1, y: 2 };").unwrap() > main);
    }
}

/// Harness Assembler - Test Unit + Submission → One Self-Contained Program
///
/// **Core Responsibility:**
/// Wrap exactly one test unit and the full submission into a program whose
/// exit status is the unit's verdict.
///
/// **Harness Contract (all languages):**
/// - Submission declarations are visible to the unit's call
/// - Console output produced while the submission initialises is echoed
///   between `=== Console Output ===` and `=== End Console Output ===`
/// - Exactly one verdict: `PASSED: <name>:<points>` or `FAILED: <name>:0`,
///   followed by the summary block
/// - Exit code 0 = pass, 1 = test failure, 2 = missing symbol, 3 = load error
/// - Entry-point types needed by compiled languages come first
///
/// **Why This Exists:**
/// Adding a language means adding one `LanguageHarness` and a template;
/// splitting, dispatch and scoring stay untouched.

mod cpp;
mod java;
mod python;
mod rust;

pub use cpp::CppHarness;
pub use java::JavaHarness;
pub use python::PythonHarness;
pub use rust::RustHarness;

use crate::config::LanguageConfigManager;
use crate::splitter::TestUnit;
use grader_common::types::{Language, UnitStatus};
use handlebars::Handlebars;
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;

pub const EXIT_PASSED: i32 = 0;
pub const EXIT_FAILED: i32 = 1;
pub const EXIT_MISSING_SYMBOL: i32 = 2;
pub const EXIT_LOAD_ERROR: i32 = 3;

#[derive(Debug, Error)]
pub enum HarnessError {
    #[error("no harness registered for language: {0}")]
    UnsupportedLanguage(Language),

    #[error("invalid harness template '{name}': {message}")]
    Template { name: String, message: String },

    #[error("failed to render harness: {0}")]
    Render(#[from] handlebars::RenderError),

    #[error("failed to encode harness data: {0}")]
    Encode(#[from] serde_json::Error),

    #[error("language configuration: {0}")]
    Config(String),
}

/// A unit ready to ship to the sandbox
#[derive(Debug, Clone)]
pub struct AssembledProgram {
    /// Position of the unit in the batch; results are matched back on this
    pub unit_index: usize,
    pub unit: Arc<TestUnit>,
    pub language: Language,
    pub file_name: String,
    pub source: String,
}

/// One target language's way of turning a unit into a runnable program
pub trait LanguageHarness: Send + Sync {
    fn language(&self) -> Language;

    /// Render the complete program source for one unit
    fn assemble(&self, submission: &str, unit: &TestUnit) -> Result<String, HarnessError>;

    /// Decide whether a failed compile stage means the submission lacks
    /// something the test calls, or is simply broken
    fn classify_compile_failure(&self, diagnostics: &str) -> UnitStatus {
        let _ = diagnostics;
        UnitStatus::CompileError
    }
}

/// Harnesses keyed by language
pub struct HarnessRegistry {
    harnesses: HashMap<Language, Arc<dyn LanguageHarness>>,
    languages: LanguageConfigManager,
}

impl HarnessRegistry {
    /// Registry with the built-in Python, Java, C++ and Rust harnesses
    pub fn new(languages: LanguageConfigManager) -> Result<Self, HarnessError> {
        let entry_class = languages
            .get_config(&Language::Java)
            .ok()
            .and_then(|config| config.entry_class.clone())
            .unwrap_or_else(|| "Main".to_string());

        let mut registry = Self {
            harnesses: HashMap::new(),
            languages,
        };
        registry.register(Arc::new(PythonHarness::new()?));
        registry.register(Arc::new(JavaHarness::new(entry_class)?));
        registry.register(Arc::new(CppHarness::new()?));
        registry.register(Arc::new(RustHarness::new()?));

        Ok(registry)
    }

    pub fn register(&mut self, harness: Arc<dyn LanguageHarness>) {
        self.harnesses.insert(harness.language(), harness);
    }

    pub fn get(&self, language: Language) -> Result<Arc<dyn LanguageHarness>, HarnessError> {
        self.harnesses
            .get(&language)
            .cloned()
            .ok_or(HarnessError::UnsupportedLanguage(language))
    }

    pub fn supports(&self, language: Language) -> bool {
        self.harnesses.contains_key(&language) && self.languages.supports(&language)
    }

    pub fn languages(&self) -> &LanguageConfigManager {
        &self.languages
    }

    pub fn assemble(
        &self,
        language: Language,
        submission: &str,
        unit_index: usize,
        unit: Arc<TestUnit>,
    ) -> Result<AssembledProgram, HarnessError> {
        let harness = self.get(language)?;
        let config = self
            .languages
            .get_config(&language)
            .map_err(|e| HarnessError::Config(e.to_string()))?;

        let source = harness.assemble(submission, &unit)?;

        Ok(AssembledProgram {
            unit_index,
            unit,
            language,
            file_name: config.file_name.clone(),
            source,
        })
    }
}

/// Handlebars instance with one registered template. Harness output is source
/// code, so HTML escaping is off and missing fields are errors.
pub(crate) fn template_engine(
    name: &str,
    source: &str,
) -> Result<Handlebars<'static>, HarnessError> {
    let mut handlebars = Handlebars::new();
    handlebars.set_strict_mode(true);
    handlebars.register_escape_fn(handlebars::no_escape);
    handlebars
        .register_template_string(name, source)
        .map_err(|e| HarnessError::Template {
            name: name.to_string(),
            message: e.to_string(),
        })?;
    Ok(handlebars)
}

/// Double-quoted literal accepted by Java, C++ and Rust alike
pub(crate) fn string_literal(value: &str) -> String {
    let mut out = String::with_capacity(value.len() + 2);
    out.push('"');
    for c in value.chars() {
        match c {
            '\\' => out.push_str("\\\\"),
            '"' => out.push_str("\\\""),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '\t' => out.push_str("\\t"),
            c if c.is_control() => out.push(' '),
            c => out.push(c),
        }
    }
    out.push('"');
    out
}

/// Diagnostics that mean "the test called something the submission lacks"
pub(crate) fn mentions_any(diagnostics: &str, needles: &[&str]) -> bool {
    needles.iter().any(|needle| diagnostics.contains(needle))
}

/// Rename a student entry point matched by `pattern` so the harness owns `main`.
/// Matches inside strings and comments are left alone.
pub(crate) fn rename_entry_point(
    source: &str,
    pattern: &regex::Regex,
    replacement: &str,
    rust_syntax: bool,
) -> String {
    let mask = crate::splitter::code_mask(source, rust_syntax);
    let mut out = String::with_capacity(source.len());
    let mut last = 0;

    for m in pattern.find_iter(source) {
        if !mask.get(m.start()).copied().unwrap_or(false) {
            continue;
        }
        out.push_str(&source[last..m.start()]);
        out.push_str(replacement);
        last = m.end();
    }
    out.push_str(&source[last..]);
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::splitter::{split_definition, WeightPolicy};
    use grader_common::types::TestDefinition;

    pub(crate) fn unit_for(code: &str, language: Language) -> TestUnit {
        let definition = TestDefinition {
            code: code.to_string(),
            visible: true,
            points: 5,
            order: 0,
        };
        split_definition(&definition, 0, language, WeightPolicy::Duplicate)
            .into_iter()
            .next()
            .expect("definition yields a unit")
    }

    #[test]
    fn test_string_literal_escaping() {
        assert_eq!(string_literal("plain"), "\"plain\"");
        assert_eq!(string_literal("a \"b\"\n\\"), "\"a \\\"b\\\"\\n\\\\\"");
        assert_eq!(string_literal("bell\u{7}"), "\"bell \"");
    }

    #[test]
    fn test_rename_entry_point_skips_strings() {
        let pattern = regex::Regex::new(r"\bint\s+main\s*\(").unwrap();
        let source = "const char* s = \"int main()\";\nint main() { return 0; }\n";
        let renamed = rename_entry_point(source, &pattern, "int student_main_(", false);

        assert!(renamed.contains("\"int main()\""));
        assert!(renamed.contains("int student_main_() { return 0; }"));
    }

    #[test]
    fn test_registry_assembles_every_language() {
        let registry = HarnessRegistry::new(LanguageConfigManager::embedded().unwrap()).unwrap();
        let cases = [
            (Language::Python, "def test_a():\n    assert add(1, 1) == 2\n", "main.py"),
            (Language::Java, "void testA() { assert Solution.add(1, 1) == 2; }", "Main.java"),
            (Language::Cpp, "void test_a() { assert(add(1, 1) == 2); }", "main.cpp"),
            (Language::Rust, "fn test_a() { assert_eq!(add(1, 1), 2); }", "main.rs"),
        ];

        for (index, (language, code, file_name)) in cases.into_iter().enumerate() {
            let unit = Arc::new(unit_for(code, language));
            let program = registry
                .assemble(language, "// submission", index, unit)
                .unwrap();

            assert_eq!(program.unit_index, index);
            assert_eq!(program.file_name, file_name);
            assert!(program.source.contains("=== Test Results ==="), "{}", language);
        }
    }
}

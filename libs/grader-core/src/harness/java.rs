use super::{mentions_any, string_literal, template_engine, HarnessError, LanguageHarness};
use super::{EXIT_FAILED, EXIT_LOAD_ERROR, EXIT_MISSING_SYMBOL, EXIT_PASSED};
use crate::splitter::{code_mask, dialect_for, ItemKind, TestUnit};
use grader_common::types::{Language, UnitStatus};
use handlebars::Handlebars;
use lazy_static::lazy_static;
use regex::Regex;
use serde_json::json;

const TEMPLATE_NAME: &str = "java";
const TEMPLATE: &str = include_str!("../../templates/java.hbs");

lazy_static! {
    static ref LEADING_ANNOTATIONS: Regex = Regex::new(r"^(?:@[\w.]+(?:\([^)]*\))?\s*)+").unwrap();
    static ref PUBLIC_TYPE: Regex = Regex::new(r"^((?:@[\w.]+(?:\([^)]*\))?\s*)*)public\s+").unwrap();
    static ref TYPE_NAME: Regex =
        Regex::new(r"\b(?:class|interface|enum|record)\s+([A-Za-z_$][\w$]*)").unwrap();
    static ref STATIC_KEYWORD: Regex = Regex::new(r"\bstatic\b").unwrap();
    static ref ASSERT_KEYWORD: Regex = Regex::new(r"\bassert\b").unwrap();
}

const MISSING_SYMBOL_DIAGNOSTICS: &[&str] = &["cannot find symbol", "does not exist"];

/// Entry class first (single-file launchers run the first top-level class),
/// test methods forced `static` inside it, then the submission with `public`
/// stripped from its top-level types
pub struct JavaHarness {
    templates: Handlebars<'static>,
    entry_class: String,
}

impl JavaHarness {
    pub fn new(entry_class: impl Into<String>) -> Result<Self, HarnessError> {
        Ok(Self {
            templates: template_engine(TEMPLATE_NAME, TEMPLATE)?,
            entry_class: entry_class.into(),
        })
    }
}

impl LanguageHarness for JavaHarness {
    fn language(&self) -> Language {
        Language::Java
    }

    fn assemble(&self, submission: &str, unit: &TestUnit) -> Result<String, HarnessError> {
        let items = dialect_for(Language::Java).items(submission);

        let mut imports: Vec<String> = Vec::new();
        for line in unit
            .prelude
            .iter()
            .chain(items.iter().filter(|i| i.kind == ItemKind::Prelude).map(|i| &i.text))
        {
            if !imports.contains(line) {
                imports.push(line.clone());
            }
        }

        let student_items: Vec<String> = items
            .iter()
            .filter(|i| !matches!(i.kind, ItemKind::Prelude | ItemKind::Ignored))
            .map(|i| PUBLIC_TYPE.replace(&i.text, "$1").into_owned())
            .collect();

        let student_types: Vec<String> = student_items
            .iter()
            .filter_map(|text| {
                let header = text.split('{').next().unwrap_or("");
                TYPE_NAME.captures(header).map(|caps| string_literal(&caps[1]))
            })
            .collect();

        let declarations: Vec<String> = unit
            .declarations
            .iter()
            .map(|d| force_static(&rewrite_asserts(d)))
            .collect();
        let statements: Vec<String> = unit.statements.iter().map(|s| rewrite_asserts(s)).collect();

        let data = json!({
            "imports": imports,
            "entry_class": self.entry_class,
            "unit_name": string_literal(&unit.name),
            "points": unit.source_points,
            "declarations": declarations,
            "statements": statements,
            "student_types": student_types,
            "submission": student_items.join("\n\n"),
            "exit_passed": EXIT_PASSED,
            "exit_failed": EXIT_FAILED,
            "exit_missing": EXIT_MISSING_SYMBOL,
            "exit_load_error": EXIT_LOAD_ERROR,
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

/// Members of the entry class are reached from `static main`
fn force_static(declaration: &str) -> String {
    let stripped = LEADING_ANNOTATIONS.replace(declaration.trim_start(), "");
    let header_end = stripped
        .find(|c: char| c == '(' || c == '{' || c == '=')
        .unwrap_or(stripped.len());

    if STATIC_KEYWORD.is_match(&stripped[..header_end]) {
        stripped.into_owned()
    } else {
        format!("static {}", stripped)
    }
}

/// Rewrite `assert cond [: message];` into an explicit throw so it fires
/// without `-ea`
fn rewrite_asserts(code: &str) -> String {
    let mask = code_mask(code, false);
    let mut out = String::with_capacity(code.len());
    let mut last = 0;

    for m in ASSERT_KEYWORD.find_iter(code) {
        let start = m.start();
        if start < last || !mask[start] {
            continue;
        }
        let followed_ok = code[m.end()..]
            .chars()
            .next()
            .is_some_and(|c| c.is_whitespace() || c == '(');
        if !followed_ok || !at_statement_start(code, &mask, start) {
            continue;
        }
        let Some(end) = statement_end(code, &mask, m.end()) else {
            continue;
        };

        let (condition, message) = split_assert(code, &mask, m.end(), end);
        let condition = condition.trim();
        let message = match message {
            Some(message) => message.trim().to_string(),
            None => string_literal(&format!(
                "assert {}",
                condition.split_whitespace().collect::<Vec<_>>().join(" ")
            )),
        };

        out.push_str(&code[last..start]);
        out.push_str(&format!(
            "{{ if (!({})) throw new AssertionError({}); }}",
            condition, message
        ));
        last = end + 1;
    }

    out.push_str(&code[last..]);
    out
}

fn at_statement_start(code: &str, mask: &[bool], start: usize) -> bool {
    let bytes = code.as_bytes();
    let mut i = start;
    while i > 0 {
        i -= 1;
        if !mask[i] || bytes[i].is_ascii_whitespace() {
            continue;
        }
        return match bytes[i] {
            b';' | b'{' | b'}' | b')' | b':' => true,
            b'e' => code[..=i].ends_with("else"),
            _ => false,
        };
    }
    true
}

/// Byte index of the `;` ending the statement that starts at `from`
fn statement_end(code: &str, mask: &[bool], from: usize) -> Option<usize> {
    let mut depth: i32 = 0;
    for (i, b) in code.bytes().enumerate().skip(from) {
        if !mask[i] {
            continue;
        }
        match b {
            b'(' | b'[' | b'{' => depth += 1,
            b')' | b']' | b'}' => depth -= 1,
            b';' if depth == 0 => return Some(i),
            _ => {}
        }
    }
    None
}

/// Split an assert body at the `:` introducing its message, skipping ternaries
/// and method references
fn split_assert<'a>(code: &'a str, mask: &[bool], from: usize, to: usize) -> (&'a str, Option<&'a str>) {
    let bytes = code.as_bytes();
    let mut depth: i32 = 0;
    let mut ternaries = 0;

    for i in from..to {
        if !mask[i] {
            continue;
        }
        match bytes[i] {
            b'(' | b'[' | b'{' => depth += 1,
            b')' | b']' | b'}' => depth -= 1,
            b'?' if depth == 0 => ternaries += 1,
            b':' if depth == 0 => {
                let method_ref = bytes.get(i + 1) == Some(&b':') || (i > from && bytes[i - 1] == b':');
                if method_ref {
                    continue;
                }
                if ternaries > 0 {
                    ternaries -= 1;
                } else {
                    return (&code[from..i], Some(&code[i + 1..to]));
                }
            }
            _ => {}
        }
    }
    (&code[from..to], None)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::harness::tests::unit_for;

    #[test]
    fn test_assert_without_message() {
        assert_eq!(
            rewrite_asserts("assert add(2, 3) == 5;"),
            "{ if (!(add(2, 3) == 5)) throw new AssertionError(\"assert add(2, 3) == 5\"); }"
        );
    }

    #[test]
    fn test_assert_with_message_and_ternary() {
        let rewritten = rewrite_asserts("assert (x > 0 ? a : b) == 1 : \"bad: \" + x;");
        assert_eq!(
            rewritten,
            "{ if (!((x > 0 ? a : b) == 1)) throw new AssertionError(\"bad: \" + x); }"
        );

        let bare_ternary = rewrite_asserts("assert flag ? a : b : msg;");
        assert_eq!(bare_ternary, "{ if (!(flag ? a : b)) throw new AssertionError(msg); }");
    }

    #[test]
    fn test_asserts_in_strings_and_calls_untouched() {
        let code = "String s = \"assert x;\";\nassertEquals(1, one());\n";
        assert_eq!(rewrite_asserts(code), code);
    }

    #[test]
    fn test_nested_assert_in_method_body() {
        let code = "void testLoop() {\n    for (int i = 0; i < 3; i++) assert i >= 0;\n}";
        let rewritten = rewrite_asserts(code);
        assert!(rewritten.contains("for (int i = 0; i < 3; i++) { if (!(i >= 0)) throw new AssertionError(\"assert i >= 0\"); }"));
    }

    #[test]
    fn test_force_static() {
        assert_eq!(force_static("@Test\nvoid testA() { }"), "static void testA() { }");
        assert_eq!(force_static("public static void testB() { }"), "public static void testB() { }");
        assert_eq!(force_static("int counter = 0;"), "static int counter = 0;");
        assert_eq!(force_static("class Helper { }"), "static class Helper { }");
    }

    #[test]
    fn test_entry_class_comes_first() {
        let harness = JavaHarness::new("Main").unwrap();
        let unit = unit_for(
            "import java.util.List;\n\nvoid testAdd() {\n    assert Solution.add(2, 3) == 5;\n}\n",
            Language::Java,
        );
        let submission = "package hw;\nimport java.util.List;\nimport java.util.Map;\n\npublic class Solution {\n    static { System.out.println(\"loading\"); }\n    public static int add(int a, int b) { return a + b; }\n}\n";

        let program = harness.assemble(submission, &unit).unwrap();

        let entry = program.find("public class Main").unwrap();
        let student = program.find("class Solution").unwrap();
        assert!(entry < student);
        assert!(!program.contains("public class Solution"));
        assert!(!program.contains("package hw;"));
        assert_eq!(program.matches("import java.util.List;").count(), 1);
        assert!(program.find("import java.util.Map;").unwrap() < entry);
        assert!(program.contains("Class.forName(\"Solution\");"));
        assert!(program.contains("static void testAdd()"));
        assert!(program.contains("testAdd();"));
        assert!(program.contains("throw new AssertionError(\"assert Solution.add(2, 3) == 5\")"));
        assert!(program.contains("public static int add(int a, int b)"));
    }

    #[test]
    fn test_compile_classification() {
        let harness = JavaHarness::new("Main").unwrap();
        let missing = "Main.java:12: error: cannot find symbol\n    Solution.add(2, 3)\n  symbol:   method add(int,int)";
        assert_eq!(harness.classify_compile_failure(missing), UnitStatus::MissingSymbol);
        assert_eq!(
            harness.classify_compile_failure("Main.java:3: error: ';' expected"),
            UnitStatus::CompileError
        );
    }

    #[test]
    fn test_modifier_fields_stay_at_class_scope() {
        let harness = JavaHarness::new("Main").unwrap();
        let unit = unit_for(
            "static final double EPS = 1e-9;\nassert Math.abs(Solution.ratio(1, 3) - 0.3333333333) < EPS;\n",
            Language::Java,
        );
        assert_eq!(unit.declarations, vec!["static final double EPS = 1e-9;".to_string()]);

        let program = harness
            .assemble("public class Solution { static double ratio(int a, int b) { return (double) a / b; } }", &unit)
            .unwrap();

        let field = program.find("static final double EPS = 1e-9;").unwrap();
        assert!(field < program.find("public static void main").unwrap());
        assert_eq!(program.matches("double EPS").count(), 1);
    }
}

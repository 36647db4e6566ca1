/// Test Unit Splitter - Test Definition → Independently Executable Units
///
/// **Core Responsibility:**
/// Turn one instructor-authored test definition into an ordered list of
/// test units, each of which signals pass/fail on its own when executed.
///
/// **Shape Rules (resolved once per definition):**
/// 1. Named test functions at top level → one unit per function, each being
///    the definition followed by an explicit no-argument call
/// 2. Otherwise top-level assertion statements → one unit per assertion
/// 3. Otherwise the whole text → one verbatim unit
/// 4. Empty text → no units
///
/// Helper declarations (non-test functions, types, constants) and import-like
/// lines travel with every unit so a unit never depends on a sibling.
///
/// **Ordering:**
/// Units come back in source order; ties are broken by byte position,
/// never by name. Duplicate function names each produce their own unit.

mod braces;
mod python;

pub(crate) use braces::code_mask;

use grader_common::types::{Language, TestDefinition};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// How a definition's points are distributed over the units split from it
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WeightPolicy {
    /// Every unit carries the definition's full weight
    #[default]
    Duplicate,
    /// The weight is divided across units; remainders go to the earliest units
    Divide,
}

impl FromStr for WeightPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "duplicate" => Ok(WeightPolicy::Duplicate),
            "divide" => Ok(WeightPolicy::Divide),
            other => Err(format!("unknown weight policy: {}", other)),
        }
    }
}

impl fmt::Display for WeightPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WeightPolicy::Duplicate => f.write_str("duplicate"),
            WeightPolicy::Divide => f.write_str("divide"),
        }
    }
}

/// Lexical category of one top-level item of a test definition
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum ItemKind {
    /// Import-like line hoisted to the top of the harness
    Prelude,
    TestFunction { name: String },
    Assertion,
    /// Helper function, type, or other block-level declaration
    Declaration,
    /// Any other top-level statement
    Statement,
    /// Dropped entirely (e.g. a Java `package` line)
    Ignored,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct SourceItem {
    pub kind: ItemKind,
    pub text: String,
    /// Byte offset of the item in the definition text
    pub position: usize,
}

/// Language-specific lexical rules for finding top-level items
pub(crate) trait Dialect: Send + Sync {
    fn items(&self, source: &str) -> Vec<SourceItem>;

    /// Explicit call of a discovered test function
    fn invocation(&self, name: &str, definition: &str) -> String;

    /// Whether a top-level statement may sit next to the test functions, at
    /// file or class scope, rather than only inside the harness entry point
    fn valid_at_item_scope(&self, _statement: &str) -> bool {
        true
    }
}

pub(crate) fn dialect_for(language: Language) -> Box<dyn Dialect> {
    match language {
        Language::Python => Box::new(python::PythonDialect),
        Language::Java => Box::new(braces::BraceDialect::java()),
        Language::Cpp => Box::new(braces::BraceDialect::cpp()),
        Language::Rust => Box::new(braces::BraceDialect::rust()),
    }
}

/// How a definition turns into units, decided once before any unit is built
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TestShape {
    Empty,
    NamedFunctions,
    TopLevelAsserts,
    Verbatim,
}

/// Which rule produced a unit
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "shape", rename_all = "snake_case")]
pub enum UnitShape {
    NamedFunction { function: String },
    TopLevelAssert { statement: String },
    Verbatim,
}

/// One independently executable, independently scored piece of a test definition
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TestUnit {
    pub name: String,
    pub shape: UnitShape,
    /// Import-like lines that belong at the very top of the harness
    pub prelude: Vec<String>,
    /// File- or class-level code: helpers and, for named units, the test function itself
    pub declarations: Vec<String>,
    /// Executed in order by the harness entry point; ends with the call or assertion
    pub statements: Vec<String>,
    /// Self-contained snippet: declarations followed by statements
    pub body: String,
    pub source_points: u32,
    pub source_visible: bool,
    pub definition_index: usize,
    pub definition_order: i32,
    pub position: usize,
}

/// Human label for a unit: function name, single-line statement, or definition label
pub fn extract_display_name(unit: &TestUnit) -> String {
    match &unit.shape {
        UnitShape::NamedFunction { function } => function.clone(),
        UnitShape::TopLevelAssert { statement } => statement_label(statement),
        UnitShape::Verbatim => unit.name.clone(),
    }
}

impl TestUnit {
    /// The test function a named unit invokes
    pub fn function(&self) -> Option<&str> {
        match &self.shape {
            UnitShape::NamedFunction { function } => Some(function),
            _ => None,
        }
    }
}

/// Decide the shape of a definition from its top-level items
pub(crate) fn classify(items: &[SourceItem]) -> TestShape {
    let has_code = items
        .iter()
        .any(|item| !matches!(item.kind, ItemKind::Prelude | ItemKind::Ignored));

    if items.iter().any(|item| matches!(item.kind, ItemKind::TestFunction { .. })) {
        TestShape::NamedFunctions
    } else if items.iter().any(|item| item.kind == ItemKind::Assertion) {
        TestShape::TopLevelAsserts
    } else if has_code {
        TestShape::Verbatim
    } else {
        TestShape::Empty
    }
}

/// Resolve the shape of raw test text without building units
pub fn shape_of(code: &str, language: Language) -> TestShape {
    if code.trim().is_empty() {
        return TestShape::Empty;
    }
    classify(&dialect_for(language).items(code))
}

/// Split one test definition into units
///
/// `definition_index` is the definition's position after ordering by `order`;
/// it is carried on each unit so results can be traced back to their source.
pub fn split_definition(
    definition: &TestDefinition,
    definition_index: usize,
    language: Language,
    policy: WeightPolicy,
) -> Vec<TestUnit> {
    if definition.code.trim().is_empty() {
        return Vec::new();
    }

    let dialect = dialect_for(language);
    let items = dialect.items(&definition.code);
    let shape = classify(&items);

    let prelude: Vec<String> = items
        .iter()
        .filter(|item| item.kind == ItemKind::Prelude)
        .map(|item| item.text.clone())
        .collect();

    let drafts = match shape {
        TestShape::Empty => Vec::new(),
        TestShape::NamedFunctions => named_function_drafts(&items, dialect.as_ref()),
        TestShape::TopLevelAsserts => assertion_drafts(&items),
        TestShape::Verbatim => vec![verbatim_draft(&items, definition_index)],
    };

    let weights = distribute_points(definition.points, drafts.len(), policy);

    drafts
        .into_iter()
        .zip(weights)
        .map(|(draft, points)| {
            let body = draft
                .declarations
                .iter()
                .chain(draft.statements.iter())
                .cloned()
                .collect::<Vec<_>>()
                .join("\n\n");

            TestUnit {
                name: draft.name,
                shape: draft.shape,
                prelude: prelude.clone(),
                declarations: draft.declarations,
                statements: draft.statements,
                body,
                source_points: points,
                source_visible: definition.visible,
                definition_index,
                definition_order: definition.order,
                position: draft.position,
            }
        })
        .collect()
}

struct UnitDraft {
    name: String,
    shape: UnitShape,
    declarations: Vec<String>,
    statements: Vec<String>,
    position: usize,
}

/// Every top-level test function becomes its own unit. Non-test declarations and
/// item-scope statements are shared support code. Statements that call a test
/// function are dropped: each unit invokes its own function exactly once.
fn named_function_drafts(items: &[SourceItem], dialect: &dyn Dialect) -> Vec<UnitDraft> {
    let test_names: Vec<&str> = items
        .iter()
        .filter_map(|item| match &item.kind {
            ItemKind::TestFunction { name } => Some(name.as_str()),
            _ => None,
        })
        .collect();

    let support: Vec<&SourceItem> = items
        .iter()
        .filter(|item| match item.kind {
            ItemKind::Declaration => true,
            ItemKind::Statement => {
                dialect.valid_at_item_scope(&item.text)
                    && !test_names.iter().any(|name| calls_function(&item.text, name))
            }
            _ => false,
        })
        .collect();

    let mut drafts: Vec<UnitDraft> = items
        .iter()
        .filter_map(|item| match &item.kind {
            ItemKind::TestFunction { name } => {
                let mut declarations: Vec<String> = support
                    .iter()
                    .filter(|s| s.position < item.position)
                    .map(|s| s.text.clone())
                    .collect();
                declarations.push(item.text.clone());
                declarations.extend(
                    support
                        .iter()
                        .filter(|s| s.position > item.position)
                        .map(|s| s.text.clone()),
                );

                Some(UnitDraft {
                    name: name.clone(),
                    shape: UnitShape::NamedFunction { function: name.clone() },
                    declarations,
                    statements: vec![dialect.invocation(name, &item.text)],
                    position: item.position,
                })
            }
            _ => None,
        })
        .collect();

    drafts.sort_by_key(|draft| draft.position);
    drafts
}

/// Every top-level assertion becomes its own unit, replaying the statements that
/// precede it so the assertion sees the same state it would in the original file
fn assertion_drafts(items: &[SourceItem]) -> Vec<UnitDraft> {
    let declarations: Vec<String> = items
        .iter()
        .filter(|item| item.kind == ItemKind::Declaration)
        .map(|item| item.text.clone())
        .collect();

    let mut drafts: Vec<UnitDraft> = items
        .iter()
        .filter(|item| item.kind == ItemKind::Assertion)
        .map(|assertion| {
            let mut statements: Vec<String> = items
                .iter()
                .filter(|item| item.kind == ItemKind::Statement && item.position < assertion.position)
                .map(|item| item.text.clone())
                .collect();
            statements.push(assertion.text.clone());

            UnitDraft {
                name: statement_label(&assertion.text),
                shape: UnitShape::TopLevelAssert { statement: assertion.text.clone() },
                declarations: declarations.clone(),
                statements,
                position: assertion.position,
            }
        })
        .collect();

    drafts.sort_by_key(|draft| draft.position);
    drafts
}

fn verbatim_draft(items: &[SourceItem], definition_index: usize) -> UnitDraft {
    let code: Vec<String> = items
        .iter()
        .filter(|item| !matches!(item.kind, ItemKind::Prelude | ItemKind::Ignored))
        .map(|item| item.text.clone())
        .collect();
    let position = items
        .iter()
        .find(|item| !matches!(item.kind, ItemKind::Prelude | ItemKind::Ignored))
        .map(|item| item.position)
        .unwrap_or(0);

    UnitDraft {
        name: format!("<definition {}>", definition_index + 1),
        shape: UnitShape::Verbatim,
        declarations: Vec::new(),
        statements: vec![code.join("\n\n")],
        position,
    }
}

/// `name` followed by an opening parenthesis, as a whole identifier
fn calls_function(text: &str, name: &str) -> bool {
    let is_ident = |c: char| c.is_alphanumeric() || c == '_';
    text.match_indices(name).any(|(at, _)| {
        let standalone = !text[..at].chars().next_back().is_some_and(is_ident);
        let rest = &text[at + name.len()..];
        standalone && !rest.starts_with(is_ident) && rest.trim_start().starts_with('(')
    })
}

const MAX_LABEL_CHARS: usize = 120;

/// Single-line, whitespace-collapsed label for an assertion unit
fn statement_label(statement: &str) -> String {
    let collapsed = statement.split_whitespace().collect::<Vec<_>>().join(" ");
    if collapsed.chars().count() <= MAX_LABEL_CHARS {
        return collapsed;
    }
    let truncated: String = collapsed.chars().take(MAX_LABEL_CHARS - 3).collect();
    format!("{}...", truncated)
}

/// Points for each of `count` units split from a definition worth `points`
pub fn distribute_points(points: u32, count: usize, policy: WeightPolicy) -> Vec<u32> {
    if count == 0 {
        return Vec::new();
    }
    match policy {
        WeightPolicy::Duplicate => vec![points; count],
        WeightPolicy::Divide => {
            let n = count as u32;
            let base = points / n;
            let remainder = (points % n) as usize;
            (0..count)
                .map(|i| if i < remainder { base + 1 } else { base })
                .collect()
        }
    }
}

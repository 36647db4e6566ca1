use super::{Dialect, ItemKind, SourceItem};
use lazy_static::lazy_static;
use regex::Regex;

lazy_static! {
    static ref TEST_FUNCTION: Regex = Regex::new(r"^(?:async\s+)?def\s+(test\w*)\s*\(").unwrap();
    static ref DECLARATION: Regex = Regex::new(r"^(?:async\s+def|def|class)\b").unwrap();
}

/// Indentation-scoped items: a top-level item starts at column 0 and runs
/// until the next column-0 line that is not a continuation
pub(crate) struct PythonDialect;

impl Dialect for PythonDialect {
    fn items(&self, source: &str) -> Vec<SourceItem> {
        let mut items = Vec::new();
        let mut current: Option<(usize, Vec<&str>)> = None;
        let mut state = LineState::default();
        let mut offset = 0;

        for raw in source.split_inclusive('\n') {
            let line_start = offset;
            offset += raw.len();
            let line = raw.trim_end_matches(['\n', '\r']);

            let starts_item = !state.continues()
                && starts_at_column_zero(line)
                && !joins_previous(line, current.as_ref().map(|(_, lines)| lines.as_slice()));

            if starts_item {
                if let Some((position, lines)) = current.take() {
                    items.extend(finish_item(position, &lines));
                }
                current = Some((line_start, vec![line]));
            } else if let Some((_, lines)) = current.as_mut() {
                lines.push(line);
            }

            state.feed(line);
        }

        if let Some((position, lines)) = current.take() {
            items.extend(finish_item(position, &lines));
        }

        items
    }

    fn invocation(&self, name: &str, _definition: &str) -> String {
        format!("{}()", name)
    }
}

fn starts_at_column_zero(line: &str) -> bool {
    !line.trim().is_empty() && !line.starts_with([' ', '\t']) && !line.starts_with('#')
}

/// Column-0 lines that still belong to the previous compound statement
fn joins_previous(line: &str, previous: Option<&[&str]>) -> bool {
    let Some(previous) = previous else {
        return false;
    };

    let decorators_only = previous
        .iter()
        .filter(|l| !l.trim().is_empty())
        .all(|l| l.starts_with('@'));
    if decorators_only {
        return true;
    }

    let keyword: String = line.chars().take_while(|c| c.is_alphanumeric() || *c == '_').collect();
    matches!(keyword.as_str(), "else" | "elif" | "except" | "finally")
}

fn finish_item(position: usize, lines: &[&str]) -> Option<SourceItem> {
    let mut end = lines.len();
    while end > 0 {
        let trimmed = lines[end - 1].trim();
        if trimmed.is_empty() || trimmed.starts_with('#') {
            end -= 1;
        } else {
            break;
        }
    }
    if end == 0 {
        return None;
    }

    let text = lines[..end].join("\n");
    Some(SourceItem {
        kind: classify_item(&lines[..end]),
        text,
        position,
    })
}

fn classify_item(lines: &[&str]) -> ItemKind {
    let head = lines
        .iter()
        .find(|l| !l.starts_with('@') && !l.trim().is_empty())
        .copied()
        .unwrap_or("");
    let decorated = lines.first().is_some_and(|l| l.starts_with('@'));

    if head.starts_with("import ") || (head.starts_with("from ") && head.contains(" import ")) {
        return ItemKind::Prelude;
    }
    if let Some(caps) = TEST_FUNCTION.captures(head) {
        return ItemKind::TestFunction {
            name: caps[1].to_string(),
        };
    }
    if head.starts_with("assert ") || head.starts_with("assert(") {
        return ItemKind::Assertion;
    }
    if decorated || DECLARATION.is_match(head) {
        return ItemKind::Declaration;
    }
    ItemKind::Statement
}

/// Bracket and string state carried from one physical line to the next
#[derive(Debug, Default)]
struct LineState {
    depth: usize,
    triple: Option<char>,
    backslash: bool,
}

impl LineState {
    fn continues(&self) -> bool {
        self.depth > 0 || self.triple.is_some() || self.backslash
    }

    fn feed(&mut self, line: &str) {
        let chars: Vec<char> = line.chars().collect();
        let mut i = 0;
        self.backslash = false;

        while i < chars.len() {
            let c = chars[i];

            if let Some(quote) = self.triple {
                if c == '\\' {
                    i += 2;
                } else if is_triple(&chars, i, quote) {
                    self.triple = None;
                    i += 3;
                } else {
                    i += 1;
                }
                continue;
            }

            match c {
                '#' => break,
                '"' | '\'' if is_triple(&chars, i, c) => {
                    self.triple = Some(c);
                    i += 3;
                    continue;
                }
                '"' | '\'' => {
                    i += 1;
                    while i < chars.len() && chars[i] != c {
                        if chars[i] == '\\' {
                            i += 1;
                        }
                        i += 1;
                    }
                }
                '(' | '[' | '{' => self.depth += 1,
                ')' | ']' | '}' => self.depth = self.depth.saturating_sub(1),
                '\\' if i + 1 == chars.len() => self.backslash = true,
                _ => {}
            }
            i += 1;
        }
    }
}

fn is_triple(chars: &[char], i: usize, quote: char) -> bool {
    i + 2 < chars.len() && chars[i] == quote && chars[i + 1] == quote && chars[i + 2] == quote
}

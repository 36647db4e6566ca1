use super::{Dialect, ItemKind, SourceItem};
use lazy_static::lazy_static;
use regex::Regex;

lazy_static! {
    static ref JAVA_TEST: Regex = Regex::new(
        r"^(?:@[\w.]+(?:\([^)]*\))?\s*)*(?:(?:public|private|protected|static|final|synchronized)\s+)*void\s+(test\w*)\s*\(\s*\)(?:\s*throws\s+[\w.,\s]+)?$"
    )
    .unwrap();
    static ref CPP_TEST: Regex =
        Regex::new(r"^(?:(?:static|inline)\s+)*void\s+(test\w*)\s*\(\s*(?:void)?\s*\)$").unwrap();
    static ref RUST_TEST: Regex =
        Regex::new(r"^(?:pub(?:\([^)]*\))?\s+)?fn\s+(test\w*)\s*\(\s*\)(\s*->\s*.+)?$").unwrap();
    static ref RUST_ATTRIBUTE: Regex = Regex::new(r"^#\[[^\]]*\]\s*").unwrap();
    static ref JAVA_MEMBER: Regex =
        Regex::new(r"^(?:@[\w.]+(?:\([^)]*\))?\s*)*(?:public|private|protected|static|final)\s").unwrap();
    static ref JAVA_FIELD: Regex = Regex::new(
        r"^(?:@[\w.]+(?:\([^)]*\))?\s*)*(?:(?:public|private|protected|static|final|transient|volatile)\s+)*[A-Za-z_$][\w$.]*(?:\s*<[^;=()]*>)?(?:\s*\[\s*\])*\s+[A-Za-z_$][\w$]*\s*(?:=|;)"
    )
    .unwrap();
    static ref CPP_GLOBAL: Regex = Regex::new(
        r"^(?:(?:typedef|using|template|struct|class|enum|union)\b|(?:(?:static|const|constexpr|inline|extern|unsigned|signed|long|short|volatile)\s+)*[A-Za-z_][\w:]*(?:\s*<[^;=]*>)?(?:\s*(?:\*|&|\bconst\b))*\s+[\*&]*[A-Za-z_]\w*\s*(?:\[[^\]]*\]\s*)*(?:=|;|\{|\(|,))"
    )
    .unwrap();
    static ref RUST_ITEM: Regex = Regex::new(
        r"^(?:pub(?:\([^)]*\))?\s+)?(?:const|static|type|struct|enum|union|mod|extern|trait|impl)\b"
    )
    .unwrap();
}

/// First words that make a `Type name ...` lookalike an executable statement
const STATEMENT_KEYWORDS: &[&str] = &[
    "return", "throw", "delete", "new", "goto", "co_return", "co_yield", "else", "do", "case", "yield",
];

/// Lexical rules shared by the brace-scoped languages. Top-level items end at a
/// `;` or a closing `}` at depth zero; strings, character literals and comments
/// never affect depth.
pub(crate) struct BraceDialect {
    test_header: &'static Regex,
    assertion_prefixes: &'static [&'static str],
    prelude_prefixes: &'static [&'static str],
    ignored_prefixes: &'static [&'static str],
    /// Leading words that always start a statement, even when the item ends in a block
    statement_prefixes: &'static [&'static str],
    /// Member modifiers that make a `;`-terminated item a declaration
    member_modifiers: Option<&'static Regex>,
    /// Statements that are also valid at file or class scope
    item_scope: &'static Regex,
    /// `#` at depth zero starts a line-scoped preprocessor directive
    line_directives: bool,
    nested_comments: bool,
    raw_strings: bool,
    result_returns: bool,
}

impl BraceDialect {
    pub fn java() -> Self {
        Self {
            test_header: &JAVA_TEST,
            assertion_prefixes: &[
                "assert ",
                "assert(",
                "assertEquals(",
                "assertNotEquals(",
                "assertTrue(",
                "assertFalse(",
                "assertNull(",
                "assertNotNull(",
            ],
            prelude_prefixes: &["import "],
            ignored_prefixes: &["package "],
            statement_prefixes: &[],
            member_modifiers: Some(&*JAVA_MEMBER),
            item_scope: &JAVA_FIELD,
            line_directives: false,
            nested_comments: false,
            raw_strings: false,
            result_returns: false,
        }
    }

    pub fn cpp() -> Self {
        Self {
            test_header: &CPP_TEST,
            assertion_prefixes: &["assert(", "assert (", "test_assert(", "test_assert ("],
            prelude_prefixes: &["#", "using namespace "],
            ignored_prefixes: &[],
            statement_prefixes: &[],
            member_modifiers: None,
            item_scope: &CPP_GLOBAL,
            line_directives: true,
            nested_comments: false,
            raw_strings: false,
            result_returns: false,
        }
    }

    pub fn rust() -> Self {
        Self {
            test_header: &RUST_TEST,
            assertion_prefixes: &[
                "assert!",
                "assert_eq!",
                "assert_ne!",
                "debug_assert!",
                "debug_assert_eq!",
                "debug_assert_ne!",
            ],
            prelude_prefixes: &["use ", "extern crate ", "#!"],
            ignored_prefixes: &[],
            statement_prefixes: &["let ", "let("],
            member_modifiers: None,
            item_scope: &RUST_ITEM,
            line_directives: false,
            nested_comments: true,
            raw_strings: true,
            result_returns: true,
        }
    }

    fn classify(&self, text: &str) -> ItemKind {
        if self.ignored_prefixes.iter().any(|p| text.starts_with(p)) {
            return ItemKind::Ignored;
        }
        if self.prelude_prefixes.iter().any(|p| text.starts_with(p)) {
            return ItemKind::Prelude;
        }
        if self.statement_prefixes.iter().any(|p| text.starts_with(p)) {
            return ItemKind::Statement;
        }

        let is_block = text.ends_with('}') || text.ends_with("};");
        if is_block {
            if let Some(name) = self.test_name(text) {
                return ItemKind::TestFunction { name };
            }
            return ItemKind::Declaration;
        }

        if text.ends_with(';') && self.assertion_prefixes.iter().any(|p| text.starts_with(p)) {
            return ItemKind::Assertion;
        }
        if self.member_modifiers.is_some_and(|re| re.is_match(text)) {
            return ItemKind::Declaration;
        }
        ItemKind::Statement
    }

    fn header(text: &str) -> String {
        let mut header = text.split('{').next().unwrap_or("").trim();
        while let Some(m) = RUST_ATTRIBUTE.find(header) {
            header = &header[m.end()..];
        }
        header.split_whitespace().collect::<Vec<_>>().join(" ")
    }

    fn test_name(&self, text: &str) -> Option<String> {
        let header = strip_comments(&Self::header(text));
        self.test_header
            .captures(&header)
            .map(|caps| caps[1].to_string())
    }

    /// Byte ranges of the top-level items in `source`
    fn spans(&self, source: &str) -> Vec<(usize, usize)> {
        let chars: Vec<(usize, char)> = source.char_indices().collect();
        let n = chars.len();
        let byte_at = |i: usize| if i < n { chars[i].0 } else { source.len() };

        let mut spans = Vec::new();
        let mut depth: usize = 0;
        let mut parens: usize = 0;
        let mut start: Option<usize> = None;
        let mut i = 0;

        while i < n {
            let c = chars[i].1;
            let next = chars.get(i + 1).map(|&(_, c)| c);

            if c == '/' && next == Some('/') {
                i = skip_line(&chars, i);
                continue;
            }
            if c == '/' && next == Some('*') {
                i = skip_block_comment(&chars, i, self.nested_comments);
                continue;
            }
            if c.is_whitespace() {
                i += 1;
                continue;
            }

            if start.is_none() {
                start = Some(chars[i].0);
                if self.line_directives && depth == 0 && c == '#' {
                    let end = skip_directive(&chars, i);
                    spans.push((chars[i].0, byte_at(end)));
                    start = None;
                    i = end;
                    continue;
                }
            }

            match c {
                '"' => {
                    i = skip_string(&chars, i);
                    continue;
                }
                '\'' => {
                    i = skip_char_literal(&chars, i);
                    continue;
                }
                'r' if self.raw_strings && starts_raw_string(&chars, i) => {
                    i = skip_raw_string(&chars, i);
                    continue;
                }
                '{' => depth += 1,
                '}' => {
                    depth = depth.saturating_sub(1);
                    let open_statement = start.is_some_and(|s| {
                        self.statement_prefixes.iter().any(|p| source[s..].starts_with(p))
                    });
                    if depth == 0 && parens == 0 && !open_statement {
                        let mut j = i + 1;
                        while j < n && chars[j].1.is_whitespace() {
                            j += 1;
                        }
                        if j < n && chars[j].1 == ';' {
                            i = j;
                        }
                        if let Some(s) = start.take() {
                            spans.push((s, byte_at(i + 1)));
                        }
                    }
                }
                '(' | '[' => parens += 1,
                ')' | ']' => {
                    parens = parens.saturating_sub(1);
                    if c == ']' && depth == 0 && parens == 0 {
                        if let Some(s) = start {
                            if source[s..].starts_with("#!") {
                                spans.push((s, byte_at(i + 1)));
                                start = None;
                            }
                        }
                    }
                }
                ';' if depth == 0 && parens == 0 => {
                    if let Some(s) = start.take() {
                        spans.push((s, byte_at(i + 1)));
                    }
                }
                _ => {}
            }
            i += 1;
        }

        if let Some(s) = start {
            spans.push((s, source.len()));
        }
        spans
    }
}

impl Dialect for BraceDialect {
    fn items(&self, source: &str) -> Vec<SourceItem> {
        self.spans(source)
            .into_iter()
            .filter_map(|(start, end)| {
                let text = source[start..end].trim_end();
                if text.is_empty() {
                    return None;
                }
                Some(SourceItem {
                    kind: self.classify(text),
                    text: text.to_string(),
                    position: start,
                })
            })
            .collect()
    }

    fn invocation(&self, name: &str, definition: &str) -> String {
        let returns_value = self.result_returns && Self::header(definition).contains("->");
        if returns_value {
            format!("{}().unwrap();", name)
        } else {
            format!("{}();", name)
        }
    }

    fn valid_at_item_scope(&self, statement: &str) -> bool {
        let first_word = statement
            .split(|c: char| !(c.is_alphanumeric() || c == '_'))
            .next()
            .unwrap_or("");
        !STATEMENT_KEYWORDS.contains(&first_word) && self.item_scope.is_match(statement)
    }
}

/// Per-byte flags marking which bytes of `source` are code rather than part of
/// a string, character literal or comment
pub(crate) fn code_mask(source: &str, rust_syntax: bool) -> Vec<bool> {
    let chars: Vec<(usize, char)> = source.char_indices().collect();
    let n = chars.len();
    let byte_at = |i: usize| if i < n { chars[i].0 } else { source.len() };
    let mut mask = vec![true; source.len()];
    let mut i = 0;

    while i < n {
        let c = chars[i].1;
        let next = chars.get(i + 1).map(|&(_, c)| c);
        let end = if c == '/' && next == Some('/') {
            skip_line(&chars, i)
        } else if c == '/' && next == Some('*') {
            skip_block_comment(&chars, i, rust_syntax)
        } else if c == '"' {
            skip_string(&chars, i)
        } else if c == '\'' {
            skip_char_literal(&chars, i)
        } else if rust_syntax && c == 'r' && starts_raw_string(&chars, i) {
            skip_raw_string(&chars, i)
        } else {
            i += 1;
            continue;
        };

        let end = end.min(n);
        for flag in &mut mask[chars[i].0..byte_at(end)] {
            *flag = false;
        }
        i = end.max(i + 1);
    }
    mask
}

fn strip_comments(header: &str) -> String {
    let without_block = header
        .split("/*")
        .enumerate()
        .map(|(idx, part)| {
            if idx == 0 {
                part
            } else {
                part.split_once("*/").map(|(_, rest)| rest).unwrap_or("")
            }
        })
        .collect::<String>();
    without_block.split_whitespace().collect::<Vec<_>>().join(" ")
}

fn skip_line(chars: &[(usize, char)], mut i: usize) -> usize {
    while i < chars.len() && chars[i].1 != '\n' {
        i += 1;
    }
    i
}

fn skip_directive(chars: &[(usize, char)], mut i: usize) -> usize {
    while i < chars.len() {
        if chars[i].1 == '\n' {
            let continued = i > 0 && chars[i - 1].1 == '\\';
            if !continued {
                break;
            }
        }
        i += 1;
    }
    i
}

fn skip_block_comment(chars: &[(usize, char)], mut i: usize, nested: bool) -> usize {
    let mut level = 0usize;
    while i < chars.len() {
        let c = chars[i].1;
        let next = chars.get(i + 1).map(|&(_, c)| c);
        if c == '/' && next == Some('*') {
            if level == 0 || nested {
                level += 1;
            }
            i += 2;
        } else if c == '*' && next == Some('/') {
            level = level.saturating_sub(1);
            i += 2;
            if level == 0 {
                return i;
            }
        } else {
            i += 1;
        }
    }
    i
}

fn skip_string(chars: &[(usize, char)], mut i: usize) -> usize {
    i += 1;
    while i < chars.len() {
        match chars[i].1 {
            '\\' => i += 2,
            '"' => return i + 1,
            _ => i += 1,
        }
    }
    i
}

/// A quote is a character literal only when it closes within one (possibly
/// escaped) character; otherwise it is a Rust lifetime or label
fn skip_char_literal(chars: &[(usize, char)], i: usize) -> usize {
    match chars.get(i + 1).map(|&(_, c)| c) {
        Some('\\') => {
            let mut j = i + 3;
            while j < chars.len() && chars[j].1 != '\'' && chars[j].1 != '\n' {
                j += 1;
            }
            j + 1
        }
        Some(_) if chars.get(i + 2).map(|&(_, c)| c) == Some('\'') => i + 3,
        _ => i + 1,
    }
}

fn starts_raw_string(chars: &[(usize, char)], i: usize) -> bool {
    let prev_is_ident = i > 0 && {
        let p = chars[i - 1].1;
        (p.is_alphanumeric() || p == '_') && p != 'b'
    };
    if prev_is_ident {
        return false;
    }
    let mut j = i + 1;
    while j < chars.len() && chars[j].1 == '#' {
        j += 1;
    }
    j < chars.len() && chars[j].1 == '"'
}

fn skip_raw_string(chars: &[(usize, char)], i: usize) -> usize {
    let mut j = i + 1;
    let mut hashes = 0;
    while j < chars.len() && chars[j].1 == '#' {
        hashes += 1;
        j += 1;
    }
    j += 1;
    while j < chars.len() {
        if chars[j].1 == '"' {
            let closes = (1..=hashes).all(|k| chars.get(j + k).map(|&(_, c)| c) == Some('#'));
            if closes {
                return j + 1 + hashes;
            }
        }
        j += 1;
    }
    j
}

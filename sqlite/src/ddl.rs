//! Token-level reading of stored DDL.
//!
//! `sqlite_master` keeps every `CREATE` statement as it was written. The
//! pragmas report columns, keys, unique sets and foreign keys, but not
//! `CHECK` expressions, declared collations, or table options such as
//! `WITHOUT ROWID`; those are recovered from the stored text here. The same
//! scanner rewrites column references in index and trigger statements when
//! a rebuild renames or removes columns.
//!
//! The scanner only distinguishes what these jobs need:
//!
//! - **words**: bare identifiers, keywords and numbers
//! - **quoted identifiers**: `"x"`, `` `x` `` and `[x]`
//! - **literals**: `'text'` and `x'blob'`
//! - **punctuation**: any other single character
//!
//! Whitespace and comments are skipped. Every token keeps its byte span, so
//! rewrites splice the original text and never reformat it.

use relforge_core::same_identifier;

use crate::schema::quote_ident;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum TokenKind {
    Word,
    Quoted,
    Literal,
    Punct(char),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Token {
    pub kind: TokenKind,
    pub start: usize,
    pub end: usize,
    /// Unquoted name for identifiers, raw text otherwise.
    pub value: String,
}

impl Token {
    /// Identifier name, if the token can name a column or table.
    pub fn ident(&self) -> Option<&str> {
        match self.kind {
            TokenKind::Quoted => Some(&self.value),
            TokenKind::Word if !self.value.starts_with(|c: char| c.is_ascii_digit()) => {
                Some(&self.value)
            }
            _ => None,
        }
    }

    /// Bare word equal to `keyword`, ignoring case.
    pub fn is_keyword(&self, keyword: &str) -> bool {
        self.kind == TokenKind::Word && self.value.eq_ignore_ascii_case(keyword)
    }

    pub fn is_punct(&self, ch: char) -> bool {
        self.kind == TokenKind::Punct(ch)
    }
}

fn is_word_byte(b: u8) -> bool {
    b.is_ascii_alphanumeric() || b == b'_' || b == b'$' || b >= 0x80
}

/// Index just past the closing `quote`, honoring doubled quotes.
fn quoted_end(bytes: &[u8], start: usize, quote: u8) -> usize {
    let mut i = start + 1;
    while i < bytes.len() {
        if bytes[i] == quote {
            if bytes.get(i + 1) == Some(&quote) {
                i += 2;
                continue;
            }
            return i + 1;
        }
        i += 1;
    }
    bytes.len()
}

/// Splits `sql` into tokens.
pub(crate) fn tokenize(sql: &str) -> Vec<Token> {
    let bytes = sql.as_bytes();
    let mut tokens = Vec::new();
    let mut i = 0;

    while i < bytes.len() {
        let b = bytes[i];
        match b {
            b if b.is_ascii_whitespace() => i += 1,
            b'-' if bytes.get(i + 1) == Some(&b'-') => {
                i = sql[i..].find('\n').map_or(bytes.len(), |n| i + n + 1);
            }
            b'/' if bytes.get(i + 1) == Some(&b'*') => {
                i = sql[i + 2..].find("*/").map_or(bytes.len(), |n| i + n + 4);
            }
            b'\'' => {
                let end = quoted_end(bytes, i, b'\'');
                tokens.push(Token {
                    kind: TokenKind::Literal,
                    start: i,
                    end,
                    value: sql[i..end].to_string(),
                });
                i = end;
            }
            b'"' | b'`' | b'[' => {
                let close = if b == b'[' { b']' } else { b };
                let end = if b == b'[' {
                    sql[i..].find(']').map_or(bytes.len(), |n| i + n + 1)
                } else {
                    quoted_end(bytes, i, b)
                };
                let inner_end = if end > i + 1 && bytes[end - 1] == close {
                    end - 1
                } else {
                    end
                };
                let inner = &sql[i + 1..inner_end];
                let value = if b == b'[' {
                    inner.to_string()
                } else {
                    let q = (b as char).to_string();
                    inner.replace(&q.repeat(2), &q)
                };
                tokens.push(Token {
                    kind: TokenKind::Quoted,
                    start: i,
                    end,
                    value,
                });
                i = end;
            }
            b if is_word_byte(b) => {
                let start = i;
                while i < bytes.len() && is_word_byte(bytes[i]) {
                    i += 1;
                }
                // x'ABCD' blob literal
                if i - start == 1 && matches!(b, b'x' | b'X') && bytes.get(i) == Some(&b'\'') {
                    let end = quoted_end(bytes, i, b'\'');
                    tokens.push(Token {
                        kind: TokenKind::Literal,
                        start,
                        end,
                        value: sql[start..end].to_string(),
                    });
                    i = end;
                    continue;
                }
                tokens.push(Token {
                    kind: TokenKind::Word,
                    start,
                    end: i,
                    value: sql[start..i].to_string(),
                });
            }
            _ => {
                tokens.push(Token {
                    kind: TokenKind::Punct(b as char),
                    start: i,
                    end: i + 1,
                    value: (b as char).to_string(),
                });
                i += 1;
            }
        }
    }
    tokens
}

/// Index of the `)` closing the `(` at `open`.
fn matching_paren(tokens: &[Token], open: usize) -> Option<usize> {
    let mut depth = 0usize;
    for (idx, token) in tokens.iter().enumerate().skip(open) {
        if token.is_punct('(') {
            depth += 1;
        } else if token.is_punct(')') {
            depth = depth.saturating_sub(1);
            if depth == 0 {
                return Some(idx);
            }
        }
    }
    None
}

/// Parts of a stored `CREATE TABLE` the pragmas do not report.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub(crate) struct TableDdl {
    /// `CHECK` expressions, column- and table-level, as written.
    pub checks: Vec<String>,
    /// Declared collation per column.
    pub collations: Vec<(String, String)>,
    /// Text after the column list, e.g. `WITHOUT ROWID`.
    pub options: String,
}

const TABLE_CONSTRAINT_STARTERS: [&str; 5] = ["CONSTRAINT", "PRIMARY", "UNIQUE", "CHECK", "FOREIGN"];

/// Reads checks, collations and table options from a `CREATE TABLE`.
///
/// Returns `None` if the statement has no column list.
pub(crate) fn parse_create_table(sql: &str) -> Option<TableDdl> {
    let tokens = tokenize(sql);
    let open = tokens.iter().position(|t| t.is_punct('('))?;
    let close = matching_paren(&tokens, open)?;

    let mut ddl = TableDdl {
        options: sql[tokens[close].end..]
            .trim()
            .trim_end_matches(';')
            .trim()
            .to_string(),
        ..TableDdl::default()
    };

    let body = &tokens[open + 1..close];
    let mut parts: Vec<&[Token]> = Vec::new();
    let mut depth = 0usize;
    let mut part_start = 0;
    for (idx, token) in body.iter().enumerate() {
        match token.kind {
            TokenKind::Punct('(') => depth += 1,
            TokenKind::Punct(')') => depth = depth.saturating_sub(1),
            TokenKind::Punct(',') if depth == 0 => {
                parts.push(&body[part_start..idx]);
                part_start = idx + 1;
            }
            _ => {}
        }
    }
    parts.push(&body[part_start..]);

    for part in parts.into_iter().filter(|p| !p.is_empty()) {
        let column = if TABLE_CONSTRAINT_STARTERS
            .iter()
            .any(|kw| part[0].is_keyword(kw))
        {
            None
        } else {
            part[0].ident()
        };

        let mut idx = 1;
        while idx < part.len() {
            let token = &part[idx];
            if token.is_keyword("CHECK") && part.get(idx + 1).is_some_and(|t| t.is_punct('(')) {
                if let Some(end) = matching_paren(part, idx + 1) {
                    let expr = &sql[part[idx + 1].end..part[end].start];
                    ddl.checks.push(expr.trim().to_string());
                    idx = end + 1;
                    continue;
                }
            }
            if token.is_keyword("COLLATE") {
                if let (Some(column), Some(name)) = (column, part.get(idx + 1).and_then(Token::ident))
                {
                    ddl.collations.push((column.to_string(), name.to_string()));
                }
            }
            idx += 1;
        }
        // A table-level CHECK starts the part
        if column.is_none() && part[0].is_keyword("CHECK") {
            if let Some(end) = matching_paren(part, 1) {
                ddl.checks.push(sql[part[1].end..part[end].start].trim().to_string());
            }
        }
    }
    Some(ddl)
}

/// Returns `true` for `CREATE VIRTUAL TABLE` statements.
pub(crate) fn is_virtual_table(sql: &str) -> bool {
    let tokens = tokenize(sql);
    tokens.len() > 1 && tokens[0].is_keyword("CREATE") && tokens[1].is_keyword("VIRTUAL")
}

/// Column renames and removals applied by a rebuild.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub(crate) struct ColumnChanges {
    /// `(old, new)` pairs.
    pub renamed: Vec<(String, String)>,
    pub removed: Vec<String>,
}

impl ColumnChanges {
    pub fn is_empty(&self) -> bool {
        self.renamed.is_empty() && self.removed.is_empty()
    }

    pub fn new_name(&self, column: &str) -> Option<&str> {
        self.renamed
            .iter()
            .find(|(old, _)| same_identifier(old, column))
            .map(|(_, new)| new.as_str())
    }

    pub fn is_removed(&self, column: &str) -> bool {
        self.removed.iter().any(|c| same_identifier(c, column))
    }
}

/// Splices `replacements` (token index, new text) into `sql`.
fn splice(sql: &str, tokens: &[Token], replacements: &[(usize, String)]) -> String {
    let mut out = String::with_capacity(sql.len());
    let mut cursor = 0;
    for (idx, text) in replacements {
        out.push_str(&sql[cursor..tokens[*idx].start]);
        out.push_str(text);
        cursor = tokens[*idx].end;
    }
    out.push_str(&sql[cursor..]);
    out
}

/// Rewrites unqualified column references in `sql`, starting at token
/// `from`.
///
/// Returns `None` if `sql` references a removed column. Function names
/// (identifiers followed by `(`) are left alone.
fn rewrite_unqualified(sql: &str, from: usize, changes: &ColumnChanges) -> Option<String> {
    let tokens = tokenize(sql);
    let mut replacements = Vec::new();
    for (idx, token) in tokens.iter().enumerate().skip(from) {
        let Some(name) = token.ident() else {
            continue;
        };
        if tokens.get(idx + 1).is_some_and(|t| t.is_punct('(')) {
            continue;
        }
        if changes.is_removed(name) {
            return None;
        }
        if let Some(new) = changes.new_name(name) {
            replacements.push((idx, quote_ident(new)));
        }
    }
    Some(splice(sql, &tokens, &replacements))
}

/// Applies `changes` to a `CHECK` expression over the table's own columns.
pub(crate) fn rewrite_check(expr: &str, changes: &ColumnChanges) -> Option<String> {
    rewrite_unqualified(expr, 0, changes)
}

/// Applies `changes` to a `CREATE INDEX` statement. Only the column list
/// and an optional `WHERE` clause are rewritten; the index and table names
/// are not.
pub(crate) fn rewrite_index(sql: &str, changes: &ColumnChanges) -> Option<String> {
    let tokens = tokenize(sql);
    let open = tokens.iter().position(|t| t.is_punct('('))?;
    rewrite_unqualified(sql, open, changes)
}

/// Applies `changes` to a trigger on `table`.
///
/// References qualified by `NEW`, `OLD` or the table name are renamed.
/// Returns `None` when the trigger names a removed column, or names a
/// renamed column without qualification (the reference could belong to
/// another table, so it cannot be rewritten safely).
pub(crate) fn rewrite_trigger(sql: &str, table: &str, changes: &ColumnChanges) -> Option<String> {
    if changes.is_empty() {
        return Some(sql.to_string());
    }
    let tokens = tokenize(sql);
    let mut replacements = Vec::new();
    for (idx, token) in tokens.iter().enumerate() {
        let Some(name) = token.ident() else {
            continue;
        };
        let next = tokens.get(idx + 1);
        if next.is_some_and(|t| t.is_punct('(') || t.is_punct('.')) {
            continue;
        }
        let qualifier = if idx >= 2 && tokens[idx - 1].is_punct('.') {
            tokens[idx - 2].ident()
        } else {
            None
        };
        match qualifier {
            Some(q)
                if q.eq_ignore_ascii_case("NEW")
                    || q.eq_ignore_ascii_case("OLD")
                    || same_identifier(q, table) =>
            {
                if changes.is_removed(name) {
                    return None;
                }
                if let Some(new) = changes.new_name(name) {
                    replacements.push((idx, quote_ident(new)));
                }
            }
            Some(_) => {}
            None => {
                if changes.is_removed(name) || changes.new_name(name).is_some() {
                    return None;
                }
            }
        }
    }
    Some(splice(sql, &tokens, &replacements))
}

//! Statement text helpers: splitting, classification and literal quoting.
//!
//! [`StatementSplitter`] separates a script on top-level `;` while respecting
//! quoted strings, quoted identifiers, comments and PostgreSQL dollar quotes.
//! It keeps state between calls so a restore stream can be fed line by line.

use crate::error::{Result, SchemaflowError};

#[derive(Debug, Clone, PartialEq, Eq)]
enum SplitState {
    Normal,
    SingleQuote,
    DoubleQuote,
    Backtick,
    LineComment,
    BlockComment(usize),
    Dollar(String),
}

#[derive(Debug, Clone)]
pub struct StatementSplitter {
    current: String,
    state: SplitState,
    backslash_escapes: bool,
}

impl StatementSplitter {
    /// `backslash_escapes` treats `\'` inside strings as an escaped quote
    pub fn new(backslash_escapes: bool) -> Self {
        Self {
            current: String::new(),
            state: SplitState::Normal,
            backslash_escapes,
        }
    }

    /// Feed more text, returning the statements completed by it.
    ///
    /// Lookahead never crosses a chunk boundary, so chunks should end on a
    /// line break.
    pub fn push(&mut self, chunk: &str) -> Vec<String> {
        let mut completed = Vec::new();
        let mut chars = chunk.char_indices().peekable();

        while let Some((i, c)) = chars.next() {
            let rest = &chunk[i..];
            match &self.state {
                SplitState::Normal => match c {
                    ';' => {
                        self.flush(&mut completed);
                        continue;
                    }
                    '-' if rest.starts_with("--") => {
                        chars.next();
                        self.state = SplitState::LineComment;
                        continue;
                    }
                    '/' if rest.starts_with("/*") => {
                        chars.next();
                        self.state = SplitState::BlockComment(1);
                        continue;
                    }
                    '\'' => self.state = SplitState::SingleQuote,
                    '"' => self.state = SplitState::DoubleQuote,
                    '`' => self.state = SplitState::Backtick,
                    '$' => {
                        if let Some(tag) = dollar_tag(rest) {
                            for _ in 1..tag.chars().count() {
                                chars.next();
                            }
                            self.current.push_str(tag);
                            self.state = SplitState::Dollar(tag.to_string());
                            continue;
                        }
                    }
                    _ => {}
                },
                SplitState::SingleQuote => {
                    if c == '\\' && self.backslash_escapes {
                        self.current.push(c);
                        if let Some((_, escaped)) = chars.next() {
                            self.current.push(escaped);
                        }
                        continue;
                    }
                    if c == '\'' {
                        if rest.starts_with("''") {
                            chars.next();
                            self.current.push_str("''");
                            continue;
                        }
                        self.state = SplitState::Normal;
                    }
                }
                SplitState::DoubleQuote => {
                    if c == '"' {
                        self.state = SplitState::Normal;
                    }
                }
                SplitState::Backtick => {
                    if c == '`' {
                        self.state = SplitState::Normal;
                    }
                }
                SplitState::LineComment => {
                    if c == '\n' {
                        self.state = SplitState::Normal;
                        self.current.push('\n');
                    }
                    continue;
                }
                SplitState::BlockComment(depth) => {
                    let depth = *depth;
                    if rest.starts_with("*/") {
                        chars.next();
                        self.state = if depth == 1 {
                            self.current.push(' ');
                            SplitState::Normal
                        } else {
                            SplitState::BlockComment(depth - 1)
                        };
                    } else if rest.starts_with("/*") {
                        chars.next();
                        self.state = SplitState::BlockComment(depth + 1);
                    }
                    continue;
                }
                SplitState::Dollar(tag) => {
                    if rest.starts_with(tag.as_str()) {
                        let tag = tag.clone();
                        for _ in 1..tag.chars().count() {
                            chars.next();
                        }
                        self.current.push_str(&tag);
                        self.state = SplitState::Normal;
                        continue;
                    }
                }
            }
            self.current.push(c);
        }

        completed
    }

    /// Flush the trailing statement; an unterminated quote is an error
    pub fn finish(mut self) -> Result<Option<String>> {
        match self.state {
            SplitState::SingleQuote
            | SplitState::DoubleQuote
            | SplitState::Backtick
            | SplitState::Dollar(_) => Err(SchemaflowError::Validation(
                "Statement stream ends inside a quoted section".to_string(),
            )),
            _ => {
                let mut completed = Vec::new();
                self.flush(&mut completed);
                Ok(completed.pop())
            }
        }
    }

    fn flush(&mut self, completed: &mut Vec<String>) {
        let statement = self.current.trim();
        if !statement.is_empty() {
            completed.push(statement.to_string());
        }
        self.current.clear();
    }
}

/// `$tag$` at the start of `text`, if it is one
fn dollar_tag(text: &str) -> Option<&str> {
    let body = &text[1..];
    let end = body.find('$')?;
    let tag = &body[..end];
    let valid = tag
        .chars()
        .enumerate()
        .all(|(i, c)| c == '_' || c.is_alphabetic() || (i > 0 && c.is_ascii_digit()));
    valid.then(|| &text[..end + 2])
}

/// Split a whole script into statements without their terminating `;`
pub fn split_statements(script: &str, backslash_escapes: bool) -> Result<Vec<String>> {
    let mut splitter = StatementSplitter::new(backslash_escapes);
    let mut statements = splitter.push(script);
    if let Some(last) = splitter.finish()? {
        statements.push(last);
    }
    Ok(statements)
}

/// Leading keyword, upper-cased; `UNKNOWN` when there is none
pub fn statement_kind(sql: &str) -> String {
    let token = sql
        .split_whitespace()
        .next()
        .unwrap_or("")
        .trim_matches(|c: char| !c.is_ascii_alphabetic());

    if token.is_empty() {
        return "UNKNOWN".to_string();
    }
    token.to_ascii_uppercase()
}

/// Statements that move rows rather than change schema
pub fn is_data_statement(sql: &str) -> bool {
    matches!(
        statement_kind(sql).as_str(),
        "INSERT" | "UPDATE" | "DELETE" | "COPY" | "MERGE"
    )
}

pub fn is_transaction_control(sql: &str) -> bool {
    matches!(
        statement_kind(sql).as_str(),
        "BEGIN" | "COMMIT" | "ROLLBACK" | "START" | "END" | "SAVEPOINT"
    )
}

/// Single-quoted string literal with embedded quotes doubled
pub fn quote_literal(value: &str) -> String {
    format!("'{}'", value.replace('\'', "''"))
}

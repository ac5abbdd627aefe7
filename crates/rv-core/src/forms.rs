//! Top-level form segmentation
//!
//! Splits a program into the top-level forms that are sent for evaluation
//! one unit at a time. The scanner understands just enough of the reader
//! syntax to find form boundaries:
//!
//! - string literals (with `\` escapes) are copied verbatim and never affect
//!   nesting or comment detection
//! - `;` outside a string starts a line comment, which is dropped
//! - a backslash outside a string escapes the next character, so character
//!   literals such as `\(` or `\"` are inert
//! - a form ends when a closing delimiter brings the nesting depth back to
//!   zero, so a `)` inside a top-level `[...]` does not split it
//!
//! Separate counters for `()`, `[]` and `{}` are checked when input ends; any
//! imbalance rejects the whole program.

use std::fmt;

use thiserror::Error;

/// Why a program could not be segmented
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum UnbalancedSource {
    /// Input ended inside a string literal
    #[error("unterminated string starting on line {line}")]
    UnterminatedString { line: usize },

    /// A closing delimiter with no matching opener
    #[error("unmatched '{delimiter}' on line {line}")]
    UnmatchedClose { delimiter: char, line: usize },

    /// An opening delimiter that is never closed
    #[error("unclosed '{delimiter}' opened on line {line}")]
    Unclosed { delimiter: char, line: usize },
}

/// One top-level unit of source code
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Form(String);

impl Form {
    fn new(text: impl Into<String>) -> Self {
        Self(text.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn into_string(self) -> String {
        self.0
    }

    /// Namespace name if this form is an `(ns name ...)` declaration
    pub fn namespace(&self) -> Option<&str> {
        let rest = self.0.trim_start().strip_prefix("(ns")?;
        if !rest.starts_with(|c: char| c.is_whitespace() || c == ',') {
            return None;
        }

        rest.split(|c: char| c.is_whitespace() || c == ',')
            .filter(|token| !token.is_empty())
            // Skip reader metadata such as ^:no-doc
            .find(|token| !token.starts_with('^'))
            .map(|token| token.trim_end_matches(')'))
            .filter(|name| !name.is_empty())
    }
}

impl fmt::Display for Form {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Open delimiters, recorded by the line they appeared on
#[derive(Debug, Default)]
struct Balance {
    parens: Vec<usize>,
    brackets: Vec<usize>,
    braces: Vec<usize>,
}

impl Balance {
    fn stack(&mut self, delimiter: char) -> &mut Vec<usize> {
        match delimiter {
            '(' | ')' => &mut self.parens,
            '[' | ']' => &mut self.brackets,
            _ => &mut self.braces,
        }
    }

    fn open(&mut self, delimiter: char, line: usize) {
        self.stack(delimiter).push(line);
    }

    fn close(&mut self, delimiter: char, line: usize) -> Result<(), UnbalancedSource> {
        self.stack(delimiter)
            .pop()
            .map(|_| ())
            .ok_or(UnbalancedSource::UnmatchedClose { delimiter, line })
    }

    /// No delimiter of any kind is open
    fn is_empty(&self) -> bool {
        self.parens.is_empty() && self.brackets.is_empty() && self.braces.is_empty()
    }

    fn finish(&self) -> Result<(), UnbalancedSource> {
        let unclosed = [('(', &self.parens), ('[', &self.brackets), ('{', &self.braces)];
        for (delimiter, lines) in unclosed {
            if let Some(&line) = lines.first() {
                return Err(UnbalancedSource::Unclosed { delimiter, line });
            }
        }
        Ok(())
    }
}

/// Split `source` into top-level forms
///
/// Whitespace between forms is dropped and comments are removed; any text
/// left after the last form (such as a bare symbol) becomes a final form.
/// A `#_` discard marker stays attached to the form that follows it.
///
/// # Arguments
/// * `source` - Program text as read from a file, `-e` or stdin
///
/// # Returns
/// The forms in source order, or an empty vector when the source holds only
/// whitespace and comments.
///
/// # Errors
/// [`UnbalancedSource`] when a string is left open or any `()`, `[]` or `{}`
/// pair does not match. No partial result is returned.
///
/// # Example
/// ```
/// use rv_core::segment;
///
/// let forms = segment("(ns app) ; entry\n(println \")\")").unwrap();
/// assert_eq!(forms.len(), 2);
/// assert_eq!(forms[0].namespace(), Some("app"));
/// ```
pub fn segment(source: &str) -> Result<Vec<Form>, UnbalancedSource> {
    let mut forms = Vec::new();
    let mut chunk = String::new();
    let mut balance = Balance::default();
    let mut line = 1;
    let mut in_string = false;
    let mut escaped = false;
    let mut string_line = 0;
    let mut chars = source.chars();

    while let Some(c) = chars.next() {
        if c == '\n' {
            line += 1;
        }

        if in_string {
            chunk.push(c);
            if escaped {
                escaped = false;
            } else if c == '\\' {
                escaped = true;
            } else if c == '"' {
                in_string = false;
            }
            continue;
        }

        match c {
            '"' => {
                in_string = true;
                string_line = line;
                chunk.push(c);
            }
            '\\' => {
                chunk.push(c);
                if let Some(next) = chars.next() {
                    if next == '\n' {
                        line += 1;
                    }
                    chunk.push(next);
                }
            }
            ';' => {
                for skipped in chars.by_ref() {
                    if skipped == '\n' {
                        line += 1;
                        break;
                    }
                }
                // Keep tokens on either side of the comment apart
                if !chunk.is_empty() {
                    chunk.push(' ');
                }
            }
            '(' | '[' | '{' => {
                balance.open(c, line);
                chunk.push(c);
            }
            ')' | ']' | '}' => {
                balance.close(c, line)?;
                chunk.push(c);
                if balance.is_empty() {
                    forms.push(Form::new(std::mem::take(&mut chunk)));
                }
            }
            c if c.is_whitespace() || c == ',' => {
                if !chunk.is_empty() {
                    chunk.push(c);
                }
            }
            _ => chunk.push(c),
        }
    }

    if in_string {
        return Err(UnbalancedSource::UnterminatedString { line: string_line });
    }
    balance.finish()?;

    let rest = chunk.trim();
    if !rest.is_empty() {
        forms.push(Form::new(rest));
    }

    tracing::trace!(count = forms.len(), "Segmented source");
    Ok(forms)
}

/// Render `s` as a double-quoted string literal
pub fn string_literal(s: &str) -> String {
    let mut out = String::with_capacity(s.len() + 2);
    out.push('"');
    for c in s.chars() {
        match c {
            '"' => out.push_str("\\\""),
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '\t' => out.push_str("\\t"),
            c => out.push(c),
        }
    }
    out.push('"');
    out
}

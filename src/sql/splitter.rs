//! Statement splitting.
//!
//! Partitions a block of SQL text into statement spans. The scanner only
//! tracks enough lexical state to find statement boundaries: quoted strings
//! and comments hide the delimiter, everything else is passed through as-is.
//! Malformed input never fails; an unterminated string or block comment is
//! folded into the final statement.

use serde::Serialize;

/// The conventional statement delimiter.
pub const DEFAULT_DELIMITER: char = ';';

/// One statement detected in the input text.
///
/// `text` is trimmed and excludes the delimiter as well as any comments
/// before or after the statement. `start_offset` is the byte offset where
/// `text` begins in the original input and `end_offset` is one past the
/// terminating delimiter, so `&input[start_offset..end_offset]` is the
/// statement source as the user typed it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StatementSpan {
    /// Trimmed statement text, without the delimiter.
    pub text: String,
    /// Byte offset of the first character of `text`.
    pub start_offset: usize,
    /// Byte offset one past the delimiter (or end of the statement at end of input).
    pub end_offset: usize,
    /// 1-based line on which the statement starts.
    pub source_line: usize,
}

impl StatementSpan {
    /// Returns the original source slice covered by this span, delimiter included.
    pub fn source<'a>(&self, input: &'a str) -> Option<&'a str> {
        input.get(self.start_offset..self.end_offset)
    }
}

/// Lexical mode of the scanner. Exactly one is active at a time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mode {
    Normal,
    SingleQuote,
    DoubleQuote,
    LineComment,
    BlockComment,
}

/// A statement that has started but not yet been terminated.
#[derive(Debug)]
struct Pending {
    start: usize,
    /// One past the last character that belongs to the statement.
    end: usize,
    line: usize,
}

impl Pending {
    fn into_span(self, input: &str, end_offset: usize) -> Option<StatementSpan> {
        let text = input.get(self.start..self.end)?.trim_end();
        if text.is_empty() {
            return None;
        }
        Some(StatementSpan {
            text: text.to_string(),
            start_offset: self.start,
            end_offset,
            source_line: self.line,
        })
    }
}

/// Splits SQL text into statements on a configurable delimiter.
#[derive(Debug, Clone, Copy)]
pub struct Splitter {
    delimiter: char,
}

impl Default for Splitter {
    fn default() -> Self {
        Self::new()
    }
}

impl Splitter {
    /// Creates a splitter using `;` as the delimiter.
    pub fn new() -> Self {
        Self::with_delimiter(DEFAULT_DELIMITER)
    }

    /// Creates a splitter with a custom statement delimiter.
    pub fn with_delimiter(delimiter: char) -> Self {
        Self { delimiter }
    }

    /// Returns the delimiter this splitter terminates statements on.
    pub fn delimiter(&self) -> char {
        self.delimiter
    }

    /// Splits `input` into statement spans, in source order.
    ///
    /// Whitespace-only and comment-only segments are discarded.
    pub fn split(&self, input: &str) -> Vec<StatementSpan> {
        let mut spans = Vec::new();
        let mut mode = Mode::Normal;
        let mut line = 1;
        let mut current: Option<Pending> = None;
        let mut chars = input.char_indices().peekable();

        while let Some((i, c)) = chars.next() {
            let next = chars.peek().map(|&(_, n)| n);

            match mode {
                Mode::Normal => {
                    if c == self.delimiter {
                        if let Some(pending) = current.take() {
                            spans.extend(pending.into_span(input, i + c.len_utf8()));
                        }
                    } else if c == '-' && next == Some('-') {
                        chars.next();
                        mode = Mode::LineComment;
                    } else if c == '/' && next == Some('*') {
                        chars.next();
                        mode = Mode::BlockComment;
                    } else {
                        // A doubled quote closes the literal and reopens it here,
                        // so an escaped quote never exposes the delimiter.
                        if c == '\'' {
                            mode = Mode::SingleQuote;
                        } else if c == '"' {
                            mode = Mode::DoubleQuote;
                        }
                        if !c.is_whitespace() {
                            mark(&mut current, i, c, line);
                        }
                    }
                }
                Mode::SingleQuote | Mode::DoubleQuote => {
                    mark(&mut current, i, c, line);
                    let quote = if mode == Mode::SingleQuote { '\'' } else { '"' };
                    if c == quote {
                        mode = Mode::Normal;
                    }
                }
                Mode::LineComment => {
                    if c == '\n' {
                        mode = Mode::Normal;
                    }
                }
                Mode::BlockComment => {
                    if c == '*' && next == Some('/') {
                        chars.next();
                        mode = Mode::Normal;
                    }
                }
            }

            if c == '\n' {
                line += 1;
            }
        }

        if let Some(mut pending) = current {
            if mode == Mode::BlockComment {
                pending.end = pending.end.max(input.trim_end().len());
            }
            let end = pending.end;
            spans.extend(pending.into_span(input, end));
        }

        spans
    }
}

/// Extends the pending statement to cover the character at `offset`,
/// starting a new one if none is open.
fn mark(current: &mut Option<Pending>, offset: usize, c: char, line: usize) {
    let pending = current.get_or_insert(Pending {
        start: offset,
        end: offset,
        line,
    });
    pending.end = offset + c.len_utf8();
}

/// Splits SQL text on `;` without creating a splitter instance.
pub fn split(input: &str) -> Vec<StatementSpan> {
    Splitter::new().split(input)
}

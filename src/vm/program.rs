//! Statement and label tables built from script text.
//!
//! The source buffer is never modified. Each statement is recorded as a byte
//! range into it, and each label as the range of its name plus the index of the
//! statement that follows it.
//!
//! # Syntax
//!
//! ```text
//! loop: DWRITE 13 HIGH; DELAY 100   # comment
//! DWRITE 13 LOW ; DELAY 100         // comment
//! GOTO loop
//! ```
//!
//! - physical lines end at `\n`; statements split on `;`
//! - `#` and `//` start a comment; neither `;` nor comments apply inside `"..."`
//! - `name:` at the start of a statement labels the next statement
//! - everything after the first NUL byte is ignored

use crate::vm::errors::VmError;
use std::ops::Range;

const LABEL_SUFFIX: u8 = b':';
const QUOTE: u8 = b'"';
const SEPARATOR: u8 = b';';

/// Table bounds applied while building a [`Program`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct VmLimits {
    pub max_lines: usize,
    pub max_labels: usize,
}

impl Default for VmLimits {
    fn default() -> Self {
        Self {
            max_lines: 256,
            max_labels: 64,
        }
    }
}

#[derive(Clone, Debug)]
struct Label {
    name: Range<usize>,
    target: usize,
}

/// Tokenized script: statement spans and label bindings over borrowed text.
#[derive(Debug)]
pub struct Program<'a> {
    src: &'a [u8],
    lines: Vec<Range<usize>>,
    labels: Vec<Label>,
    limits: VmLimits,
}

impl<'a> Program<'a> {
    /// Builds the statement and label tables for `src`.
    pub fn parse(src: &'a [u8], limits: VmLimits) -> Result<Self, VmError> {
        let end = src.iter().position(|&b| b == 0).unwrap_or(src.len());
        let mut program = Program {
            src: &src[..end],
            lines: Vec::new(),
            labels: Vec::new(),
            limits,
        };

        let mut line_start = 0;
        while line_start < end {
            let line_end = program.src[line_start..]
                .iter()
                .position(|&b| b == b'\n')
                .map_or(end, |i| line_start + i);
            program.split_line(line_start..line_end)?;
            line_start = line_end + 1;
        }

        Ok(program)
    }

    /// Splits one physical line into statements.
    fn split_line(&mut self, line: Range<usize>) -> Result<(), VmError> {
        let src = self.src;
        let mut in_str = false;
        let mut start = line.start;
        let mut i = line.start;

        while i < line.end {
            match src[i] {
                QUOTE => in_str = !in_str,
                b'#' if !in_str => break,
                b'/' if !in_str && src.get(i + 1) == Some(&b'/') && i + 1 < line.end => break,
                SEPARATOR if !in_str => {
                    self.push_statement(start..i)?;
                    start = i + 1;
                }
                _ => {}
            }
            i += 1;
        }

        self.push_statement(start..i)
    }

    /// Records a raw statement, peeling off any leading labels.
    fn push_statement(&mut self, raw: Range<usize>) -> Result<(), VmError> {
        let mut span = trim(self.src, raw);

        while let Some(name_len) = label_prefix(&self.src[span.clone()]) {
            let name = span.start..span.start + name_len;
            self.define_label(name)?;
            span = trim(self.src, span.start + name_len + 1..span.end);
        }

        if span.is_empty() {
            return Ok(());
        }
        if self.lines.len() >= self.limits.max_lines {
            return Err(VmError::TooManyLines {
                max: self.limits.max_lines,
            });
        }
        self.lines.push(span);
        Ok(())
    }

    fn define_label(&mut self, name: Range<usize>) -> Result<(), VmError> {
        // first definition wins
        if self.resolve(&self.src[name.clone()]).is_some() {
            return Ok(());
        }
        if self.labels.len() >= self.limits.max_labels {
            return Err(VmError::TooManyLabels {
                max: self.limits.max_labels,
            });
        }
        self.labels.push(Label {
            name,
            target: self.lines.len(),
        });
        Ok(())
    }

    /// Statement index bound to `name`, compared case-insensitively.
    pub fn resolve(&self, name: &[u8]) -> Option<usize> {
        self.labels
            .iter()
            .find(|label| self.src[label.name.clone()].eq_ignore_ascii_case(name))
            .map(|label| label.target)
    }

    /// Text of statement `index`.
    pub fn statement(&self, index: usize) -> Option<&'a [u8]> {
        let src = self.src;
        self.lines.get(index).map(|span| &src[span.clone()])
    }

    pub fn len(&self) -> usize {
        self.lines.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lines.is_empty()
    }

    pub fn label_count(&self) -> usize {
        self.labels.len()
    }
}

fn trim(src: &[u8], mut span: Range<usize>) -> Range<usize> {
    while span.start < span.end && src[span.start].is_ascii_whitespace() {
        span.start += 1;
    }
    while span.end > span.start && src[span.end - 1].is_ascii_whitespace() {
        span.end -= 1;
    }
    span
}

/// Length of `ident` when `text` starts with `ident:`.
fn label_prefix(text: &[u8]) -> Option<usize> {
    let first = *text.first()?;
    if !(first.is_ascii_alphabetic() || first == b'_') {
        return None;
    }
    let len = text
        .iter()
        .position(|&b| !(b.is_ascii_alphanumeric() || b == b'_'))?;
    (text[len] == LABEL_SUFFIX).then_some(len)
}

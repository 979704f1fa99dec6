use crate::error::ParseError;

pub const OPEN: &[u8] = b"<!--#";
pub const CLOSE: &[u8] = b"-->";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SpanKind {
    Literal,
    Directive,
}

/// Half-open byte range `[start, end)` into the scanned input.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Span {
    pub start: usize,
    pub end: usize,
    pub kind: SpanKind,
}

impl Span {
    pub fn len(&self) -> usize {
        self.end - self.start
    }

    pub fn is_empty(&self) -> bool {
        self.start == self.end
    }

    /// The bytes between `<!--#` and `-->` for a directive span, the whole
    /// range for a literal one.
    pub fn body<'a>(&self, input: &'a [u8]) -> &'a [u8] {
        match self.kind {
            SpanKind::Literal => &input[self.start..self.end],
            SpanKind::Directive => &input[self.start + OPEN.len()..self.end - CLOSE.len()],
        }
    }
}

/// Splits raw input into literal and directive spans.
///
/// The scanner only delimits. A `-->` inside a double-quoted attribute value
/// does not close the tag; inside quotes a backslash protects the next byte.
#[derive(Clone)]
pub struct Scanner<'a> {
    input: &'a [u8],
    cursor: usize,
    failed: bool,
}

impl<'a> Scanner<'a> {
    pub fn new(input: &'a [u8]) -> Self {
        Self {
            input,
            cursor: 0,
            failed: false,
        }
    }

    fn remaining(&self) -> &'a [u8] {
        &self.input[self.cursor..]
    }

    fn advance(&mut self, n: usize) {
        self.cursor += n;
    }

    /// Position of the byte just past the closing `-->` of the tag opened at
    /// `start`, or `None` when the input runs out first.
    fn find_close(&self, start: usize) -> Option<usize> {
        let mut idx = start + OPEN.len();
        let mut quoted = false;
        while idx < self.input.len() {
            let b = self.input[idx];
            if quoted {
                match b {
                    b'\\' => idx += 1,
                    b'"' => quoted = false,
                    _ => {}
                }
            } else if b == b'"' {
                quoted = true;
            } else if self.input[idx..].starts_with(CLOSE) {
                return Some(idx + CLOSE.len());
            }
            idx += 1;
        }
        None
    }

    pub fn next_span(&mut self) -> Option<Result<Span, ParseError>> {
        if self.failed {
            return None;
        }
        let rest = self.remaining();
        if rest.is_empty() {
            return None;
        }

        let start = self.cursor;
        match find(rest, OPEN) {
            Some(0) => match self.find_close(start) {
                Some(end) => {
                    self.advance(end - start);
                    Some(Ok(Span {
                        start,
                        end,
                        kind: SpanKind::Directive,
                    }))
                }
                None => {
                    self.failed = true;
                    Some(Err(ParseError::UnterminatedDirective { offset: start }))
                }
            },
            Some(idx) => {
                self.advance(idx);
                Some(Ok(Span {
                    start,
                    end: start + idx,
                    kind: SpanKind::Literal,
                }))
            }
            None => {
                self.advance(rest.len());
                Some(Ok(Span {
                    start,
                    end: self.cursor,
                    kind: SpanKind::Literal,
                }))
            }
        }
    }
}

impl Iterator for Scanner<'_> {
    type Item = Result<Span, ParseError>;

    fn next(&mut self) -> Option<Self::Item> {
        self.next_span()
    }
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack
        .windows(needle.len())
        .position(|window| window == needle)
}

//! Deferred `$name` / `${name}` substitution inside attribute values.
//!
//! Values are split into text and variable markers when the document is
//! parsed and only resolved against a live context during evaluation, so one
//! tree can be rendered against many contexts. Resolved text is appended
//! as-is and never scanned for further markers.

use std::fmt;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Segment {
    Text(String),
    Var(String),
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ValueTemplate {
    segments: Vec<Segment>,
}

/// A `${` marker that cannot be read; `position` is its byte offset in
/// the value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MarkerError {
    /// `${` without its closing `}`.
    Unclosed { position: usize },
    /// `${}`.
    Empty { position: usize },
}

impl MarkerError {
    pub fn position(&self) -> usize {
        match self {
            Self::Unclosed { position } | Self::Empty { position } => *position,
        }
    }
}

impl fmt::Display for MarkerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Unclosed { .. } => f.write_str("unclosed `${` marker"),
            Self::Empty { .. } => f.write_str("empty `${}` marker"),
        }
    }
}

pub(crate) fn is_ident_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || c == '_'
}

impl ValueTemplate {
    pub fn literal(text: impl Into<String>) -> Self {
        let text = text.into();
        if text.is_empty() {
            return Self::default();
        }
        Self {
            segments: vec![Segment::Text(text)],
        }
    }

    pub fn parse(raw: &str) -> Result<Self, MarkerError> {
        let mut segments = Vec::new();
        let mut text = String::new();
        let mut chars = raw.char_indices().peekable();

        while let Some((idx, c)) = chars.next() {
            match c {
                '\\' if matches!(chars.peek(), Some((_, '$'))) => {
                    chars.next();
                    text.push('$');
                }
                '$' => match chars.peek() {
                    Some((_, '{')) => {
                        chars.next();
                        let mut name = String::new();
                        let mut closed = false;
                        for (_, c) in chars.by_ref() {
                            if c == '}' {
                                closed = true;
                                break;
                            }
                            name.push(c);
                        }
                        if !closed {
                            return Err(MarkerError::Unclosed { position: idx });
                        }
                        if name.is_empty() {
                            return Err(MarkerError::Empty { position: idx });
                        }
                        flush(&mut segments, &mut text);
                        segments.push(Segment::Var(name));
                    }
                    Some(&(_, next)) if is_ident_char(next) => {
                        let mut name = String::new();
                        while let Some(&(_, c)) = chars.peek() {
                            if !is_ident_char(c) {
                                break;
                            }
                            name.push(c);
                            chars.next();
                        }
                        flush(&mut segments, &mut text);
                        segments.push(Segment::Var(name));
                    }
                    _ => text.push('$'),
                },
                _ => text.push(c),
            }
        }
        flush(&mut segments, &mut text);

        Ok(Self { segments })
    }

    pub fn segments(&self) -> &[Segment] {
        &self.segments
    }

    pub fn is_empty(&self) -> bool {
        self.segments.is_empty()
    }

    /// The value when it holds no markers at all.
    pub fn as_literal(&self) -> Option<&str> {
        match self.segments.as_slice() {
            [] => Some(""),
            [Segment::Text(s)] => Some(s),
            _ => None,
        }
    }

    /// Resolves every marker through `lookup`; unknown names become empty.
    pub fn render<F>(&self, mut lookup: F) -> String
    where
        F: FnMut(&str) -> Option<String>,
    {
        let mut out = String::new();
        for segment in &self.segments {
            match segment {
                Segment::Text(s) => out.push_str(s),
                Segment::Var(name) => {
                    if let Some(value) = lookup(name) {
                        out.push_str(&value);
                    }
                }
            }
        }
        out
    }
}

fn flush(segments: &mut Vec<Segment>, text: &mut String) {
    if !text.is_empty() {
        segments.push(Segment::Text(std::mem::take(text)));
    }
}

impl fmt::Display for ValueTemplate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for segment in &self.segments {
            match segment {
                Segment::Text(s) => f.write_str(&s.replace('$', "\\$"))?,
                Segment::Var(name) => write!(f, "${{{name}}}")?,
            }
        }
        Ok(())
    }
}

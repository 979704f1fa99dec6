use crate::resolver::ResolveError;

/// Fatal errors raised while turning SSI markup into a [`Block`](crate::Block).
///
/// Every variant carries the byte offset of the offending directive tag
/// (the `<` of `<!--#`). No partial tree is ever returned alongside one.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ParseError {
    #[error("unterminated directive opened at byte {offset}")]
    UnterminatedDirective { offset: usize },

    #[error("malformed directive at byte {offset}: {message}")]
    MalformedDirective { offset: usize, message: String },

    #[error("malformed attribute in `{directive}` at byte {offset}: {message}")]
    MalformedAttribute {
        directive: String,
        offset: usize,
        message: String,
    },

    #[error("`{directive}` at byte {offset} is missing required attribute `{attribute}`")]
    MissingAttribute {
        directive: String,
        attribute: String,
        offset: usize,
    },

    #[error("`{directive}` at byte {offset}: invalid value {value:?} for `{attribute}`")]
    InvalidAttributeValue {
        directive: String,
        attribute: String,
        value: String,
        offset: usize,
    },

    #[error("`{directive}` at byte {offset} repeats attribute `{attribute}`")]
    DuplicateAttribute {
        directive: String,
        attribute: String,
        offset: usize,
    },

    #[error("`{directive}` at byte {offset} does not accept attribute `{attribute}`")]
    UnknownAttribute {
        directive: String,
        attribute: String,
        offset: usize,
    },

    #[error("`{directive}` at byte {offset}: {message}")]
    ConflictingAttributes {
        directive: String,
        offset: usize,
        message: String,
    },

    #[error("{message} in `{directive}` at byte {offset}")]
    MalformedMarker {
        directive: String,
        offset: usize,
        message: String,
    },

    #[error("malformed expression in `{directive}` at byte {offset} (column {column}): {message}")]
    MalformedExpression {
        directive: String,
        offset: usize,
        column: usize,
        message: String,
    },

    #[error("invalid regular expression /{pattern}/ in `{directive}` at byte {offset}: {message}")]
    InvalidRegex {
        directive: String,
        pattern: String,
        offset: usize,
        message: String,
    },

    #[error("`{directive}` at byte {offset} has no matching `{expected}`")]
    Unmatched {
        directive: String,
        expected: String,
        offset: usize,
    },

    #[error("`{directive}` at byte {offset} cannot close `{opener}` opened at byte {opener_offset}")]
    Mismatched {
        directive: String,
        offset: usize,
        opener: String,
        opener_offset: usize,
    },

    #[error("`{directive}` at byte {offset} follows `else` of the `if` opened at byte {opener_offset}")]
    AfterElse {
        directive: String,
        offset: usize,
        opener_offset: usize,
    },

    #[error("`{directive}` opened at byte {offset} is never closed")]
    Unclosed { directive: String, offset: usize },
}

impl ParseError {
    /// Byte offset of the directive this error is about.
    pub fn offset(&self) -> usize {
        match self {
            Self::UnterminatedDirective { offset }
            | Self::MalformedDirective { offset, .. }
            | Self::MalformedAttribute { offset, .. }
            | Self::MissingAttribute { offset, .. }
            | Self::InvalidAttributeValue { offset, .. }
            | Self::DuplicateAttribute { offset, .. }
            | Self::UnknownAttribute { offset, .. }
            | Self::ConflictingAttributes { offset, .. }
            | Self::MalformedMarker { offset, .. }
            | Self::MalformedExpression { offset, .. }
            | Self::InvalidRegex { offset, .. }
            | Self::Unmatched { offset, .. }
            | Self::Mismatched { offset, .. }
            | Self::AfterElse { offset, .. }
            | Self::Unclosed { offset, .. } => *offset,
        }
    }
}

/// Errors that abort an evaluation run.
///
/// Ordinary resolver failures never end up here; they become
/// [`RecoverableError`](crate::RecoverableError)s. Only a resolver that
/// reports [`ResolveError::Fatal`] stops the walk.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum EvalError {
    #[error("fatal resolver failure in `{directive}` at byte {offset}: {source}")]
    Resolver {
        directive: String,
        offset: usize,
        #[source]
        source: ResolveError,
    },
}

/// Umbrella error for [`render`](crate::render).
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum Error {
    #[error(transparent)]
    Parse(#[from] ParseError),
    #[error(transparent)]
    Eval(#[from] EvalError),
}

pub type Result<T> = std::result::Result<T, Error>;

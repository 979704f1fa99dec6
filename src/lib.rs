//! shimmyssi: a small Server Side Includes (SSI) engine.
//!
//! Documents are parsed once into a tree of [`Node`]s and can then be
//! evaluated any number of times against an [`EvaluationContext`]. All I/O
//! goes through a caller-supplied [`Resolver`]; the engine itself never
//! reads files or makes requests.
//!
//! Supported directives:
//! - `echo var= [encoding=] [default=]`, `set var= value=`, `printenv`.
//! - `include virtual=|file= [onerror=] [set=] [stub=]`.
//! - `config [errmsg=] [echomsg=] [sizefmt=] [timefmt=]`.
//! - `flastmod` / `fsize` with `virtual=` or `file=`.
//! - `if expr=` / `elif expr=` / `else` / `endif`, arbitrarily nested.
//! - `block name=` / `endblock`, used as include stubs.
//! - `comment`; any other directive name is kept as a no-op.
//!
//! Error model:
//! - Malformed markup is a fatal [`ParseError`] carrying the byte offset of
//!   the offending tag. No partial tree is returned.
//! - Evaluation problems (undefined variables, missing includes) are
//!   [`RecoverableError`]s: the directive emits its fallback text and the
//!   rest of the document is still rendered.
//! - Only a resolver reporting [`ResolveError::Fatal`] aborts evaluation.
//!
//! Output is byte-oriented: literal text passes through unchanged, so a
//! document without directives renders to exactly its input.

mod ast;
mod config;
mod context;
mod error;
mod eval;
mod expr;
mod interp;
mod lexer;
mod parser;
mod resolver;

pub use ast::{Block, Encoding, Expr, IncludeTarget, Node, NodeKind, Pattern, SizeFmt};
pub use config::{ConfigError, EngineConfig};
pub use context::{
    DirectiveConfig, EvaluationContext, DEFAULT_ECHOMSG, DEFAULT_ERRMSG, DEFAULT_TIMEFMT,
};
pub use error::{Error, EvalError, ParseError, Result};
pub use eval::{
    encode, evaluate, format_size, EvaluationResult, Evaluator, RecoverableError, RecoverableKind,
};
pub use expr::{parse_expr, ExprError};
pub use interp::{MarkerError, Segment, ValueTemplate};
pub use lexer::{Scanner, Span, SpanKind};
pub use parser::{AttributePolicy, ParseOptions, Parser};
pub use resolver::{MemoryResolver, Metadata, ResolveError, Resolver};

/// Parses `input` with the default (lenient) options.
pub fn parse(input: &[u8]) -> std::result::Result<Block, ParseError> {
    parse_with(input, &ParseOptions::default())
}

#[tracing::instrument(level = "debug", skip_all, fields(len = input.len()))]
pub fn parse_with(input: &[u8], options: &ParseOptions) -> std::result::Result<Block, ParseError> {
    let tree = Parser::new(input, options.clone()).parse()?;
    tracing::debug!(nodes = tree.len(), "parsed document");
    Ok(tree)
}

/// Parses and evaluates in one step.
pub fn render<R: Resolver + ?Sized>(
    input: &[u8],
    context: EvaluationContext,
    resolver: &R,
) -> Result<EvaluationResult> {
    let tree = parse(input)?;
    Ok(evaluate(&tree, context, resolver)?)
}

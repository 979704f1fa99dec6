use crate::ast::*;
use crate::context::is_valid_timefmt;
use crate::error::ParseError;
use crate::expr::{parse_expr, ExprError};
use crate::interp::ValueTemplate;
use crate::lexer::{Scanner, Span, SpanKind};
use tracing::{debug, trace, warn};

/// What to do with attributes a directive does not expect, or repeats.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AttributePolicy {
    /// Unknown attributes are ignored and the last duplicate wins.
    #[default]
    Lenient,
    /// Both are fatal parse errors.
    Strict,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Deserialize)]
#[serde(default)]
pub struct ParseOptions {
    pub attributes: AttributePolicy,
}

impl ParseOptions {
    pub fn strict() -> Self {
        Self {
            attributes: AttributePolicy::Strict,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct Attribute {
    name: String,
    raw: String,
}

struct Cursor<'a> {
    input: &'a str,
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn peek(&self) -> Option<char> {
        self.input[self.pos..].chars().next()
    }

    fn bump(&mut self) -> Option<char> {
        let c = self.peek()?;
        self.pos += c.len_utf8();
        Some(c)
    }

    fn skip_ws(&mut self) {
        while matches!(self.peek(), Some(c) if c.is_whitespace()) {
            self.bump();
        }
    }

    fn take_while<F: Fn(char) -> bool>(&mut self, f: F) -> &'a str {
        let start = self.pos;
        while matches!(self.peek(), Some(c) if f(c)) {
            self.bump();
        }
        &self.input[start..self.pos]
    }
}

/// Splits a tag body (the text between `<!--#` and `-->`) into the
/// directive name and its attributes.
fn split_tag(body: &str, offset: usize) -> Result<(String, Vec<Attribute>), ParseError> {
    let mut cursor = Cursor {
        input: body,
        pos: 0,
    };
    cursor.skip_ws();
    let name = cursor.take_while(|c| c.is_ascii_alphabetic());
    if name.is_empty() {
        return Err(ParseError::MalformedDirective {
            offset,
            message: "missing directive name".to_string(),
        });
    }

    let malformed = |message: String| ParseError::MalformedAttribute {
        directive: name.to_ascii_lowercase(),
        offset,
        message,
    };

    let mut attrs = Vec::new();
    loop {
        cursor.skip_ws();
        let first = match cursor.peek() {
            Some(c) => c,
            None => break,
        };
        let attr = cursor.take_while(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-');
        if attr.is_empty() {
            return Err(malformed(format!("unexpected character `{first}`")));
        }
        cursor.skip_ws();
        if cursor.peek() != Some('=') {
            return Err(malformed(format!("expected `=` after `{attr}`")));
        }
        cursor.bump();
        cursor.skip_ws();
        match cursor.bump() {
            Some('"') => {}
            Some(_) => return Err(malformed(format!("value of `{attr}` must be double-quoted"))),
            None => return Err(malformed(format!("missing value for `{attr}`"))),
        }

        let mut raw = String::new();
        let mut closed = false;
        while let Some(c) = cursor.bump() {
            match c {
                '"' => {
                    closed = true;
                    break;
                }
                '\\' => match cursor.bump() {
                    Some('"') => raw.push('"'),
                    Some(other) => {
                        raw.push('\\');
                        raw.push(other);
                    }
                    None => raw.push('\\'),
                },
                _ => raw.push(c),
            }
        }
        if !closed {
            return Err(malformed(format!("unterminated value for `{attr}`")));
        }
        attrs.push(Attribute {
            name: attr.to_ascii_lowercase(),
            raw,
        });
    }

    Ok((name.to_ascii_lowercase(), attrs))
}

/// The validated attribute set of one directive.
struct Attributes<'n> {
    directive: &'n str,
    offset: usize,
    items: Vec<Attribute>,
}

impl<'n> Attributes<'n> {
    fn new(
        directive: &'n str,
        offset: usize,
        list: Vec<Attribute>,
        allowed: &[&str],
        policy: AttributePolicy,
    ) -> Result<Self, ParseError> {
        let mut items: Vec<Attribute> = Vec::with_capacity(list.len());
        for attr in list {
            if !allowed.contains(&attr.name.as_str()) {
                if policy == AttributePolicy::Strict {
                    return Err(ParseError::UnknownAttribute {
                        directive: directive.to_string(),
                        attribute: attr.name,
                        offset,
                    });
                }
                debug!(directive, attribute = %attr.name, offset, "ignoring unknown attribute");
                continue;
            }
            match items.iter_mut().find(|a| a.name == attr.name) {
                Some(_) if policy == AttributePolicy::Strict => {
                    return Err(ParseError::DuplicateAttribute {
                        directive: directive.to_string(),
                        attribute: attr.name,
                        offset,
                    });
                }
                Some(existing) => existing.raw = attr.raw,
                None => items.push(attr),
            }
        }
        Ok(Self {
            directive,
            offset,
            items,
        })
    }

    fn take(&mut self, name: &str) -> Option<String> {
        let idx = self.items.iter().position(|a| a.name == name)?;
        Some(self.items.remove(idx).raw)
    }

    fn require(&mut self, name: &str) -> Result<String, ParseError> {
        self.take(name).ok_or_else(|| ParseError::MissingAttribute {
            directive: self.directive.to_string(),
            attribute: name.to_string(),
            offset: self.offset,
        })
    }

    fn template(&self, raw: &str) -> Result<ValueTemplate, ParseError> {
        ValueTemplate::parse(raw).map_err(|e| ParseError::MalformedMarker {
            directive: self.directive.to_string(),
            offset: self.offset,
            message: e.to_string(),
        })
    }

    fn take_template(&mut self, name: &str) -> Result<Option<ValueTemplate>, ParseError> {
        self.take(name).map(|raw| self.template(&raw)).transpose()
    }

    fn invalid(&self, attribute: &str, value: String) -> ParseError {
        ParseError::InvalidAttributeValue {
            directive: self.directive.to_string(),
            attribute: attribute.to_string(),
            value,
            offset: self.offset,
        }
    }

    /// Exactly one of `virtual` / `file`.
    fn target(&mut self) -> Result<IncludeTarget<ValueTemplate>, ParseError> {
        match (self.take("virtual"), self.take("file")) {
            (Some(v), None) => Ok(IncludeTarget::Virtual(self.template(&v)?)),
            (None, Some(f)) => Ok(IncludeTarget::File(self.template(&f)?)),
            (Some(_), Some(_)) => Err(ParseError::ConflictingAttributes {
                directive: self.directive.to_string(),
                offset: self.offset,
                message: "`virtual` and `file` are mutually exclusive".to_string(),
            }),
            (None, None) => Err(ParseError::MissingAttribute {
                directive: self.directive.to_string(),
                attribute: "virtual` or `file".to_string(),
                offset: self.offset,
            }),
        }
    }
}

struct IfBuilder {
    span: Span,
    condition: Expr,
    then_branch: Block,
    elif_branches: Vec<(Expr, Block)>,
    else_branch: Option<Block>,
}

impl IfBuilder {
    fn active(&mut self) -> &mut Block {
        match (&mut self.else_branch, self.elif_branches.last_mut()) {
            (Some(block), _) => block,
            (None, Some((_, block))) => block,
            (None, None) => &mut self.then_branch,
        }
    }
}

enum Frame {
    If(IfBuilder),
    Block { span: Span, name: String, body: Block },
}

impl Frame {
    fn directive(&self) -> &'static str {
        match self {
            Frame::If(_) => "if",
            Frame::Block { .. } => "block",
        }
    }

    fn offset(&self) -> usize {
        match self {
            Frame::If(b) => b.span.start,
            Frame::Block { span, .. } => span.start,
        }
    }
}

/// Assembles scanned spans into a tree, keeping an explicit stack of open
/// `if` and `block` frames.
pub struct Parser<'a> {
    input: &'a [u8],
    options: ParseOptions,
    root: Block,
    stack: Vec<Frame>,
}

impl<'a> Parser<'a> {
    pub fn new(input: &'a [u8], options: ParseOptions) -> Self {
        Self {
            input,
            options,
            root: Vec::new(),
            stack: Vec::new(),
        }
    }

    fn current(&mut self) -> &mut Block {
        match self.stack.last_mut() {
            Some(Frame::If(builder)) => builder.active(),
            Some(Frame::Block { body, .. }) => body,
            None => &mut self.root,
        }
    }

    pub fn parse(mut self) -> Result<Block, ParseError> {
        for span in Scanner::new(self.input) {
            let span = span?;
            match span.kind {
                SpanKind::Literal => {
                    let bytes = span.body(self.input).to_vec();
                    self.current().push(Node {
                        span,
                        kind: NodeKind::Literal(bytes),
                    });
                }
                SpanKind::Directive => self.directive(span)?,
            }
        }

        if let Some(frame) = self.stack.last() {
            return Err(ParseError::Unclosed {
                directive: frame.directive().to_string(),
                offset: frame.offset(),
            });
        }
        Ok(self.root)
    }

    fn attributes<'n>(
        &self,
        directive: &'n str,
        offset: usize,
        list: Vec<Attribute>,
        allowed: &[&str],
    ) -> Result<Attributes<'n>, ParseError> {
        Attributes::new(directive, offset, list, allowed, self.options.attributes)
    }

    fn condition(&self, directive: &str, offset: usize, list: Vec<Attribute>) -> Result<Expr, ParseError> {
        let mut attrs = self.attributes(directive, offset, list, &["expr"])?;
        let raw = attrs.require("expr")?;
        parse_expr(&raw).map_err(|e| match e {
            ExprError::Syntax { column, message } => ParseError::MalformedExpression {
                directive: directive.to_string(),
                offset,
                column,
                message,
            },
            ExprError::Regex { pattern, message } => ParseError::InvalidRegex {
                directive: directive.to_string(),
                pattern,
                offset,
                message,
            },
        })
    }

    /// Structural error for a closing or chaining directive whose frame is
    /// missing or of the wrong kind.
    fn unexpected(&self, directive: &str, expected: &str, offset: usize) -> ParseError {
        // an open frame of another kind is the likelier culprit, so name it;
        // with nothing open the directive is simply stray
        match self.stack.last() {
            Some(frame) => ParseError::Mismatched {
                directive: directive.to_string(),
                offset,
                opener: frame.directive().to_string(),
                opener_offset: frame.offset(),
            },
            None => ParseError::Unmatched {
                directive: directive.to_string(),
                expected: expected.to_string(),
                offset,
            },
        }
    }

    fn directive(&mut self, span: Span) -> Result<(), ParseError> {
        let offset = span.start;
        let body = std::str::from_utf8(span.body(self.input)).map_err(|_| {
            ParseError::MalformedDirective {
                offset,
                message: "directive is not valid UTF-8".to_string(),
            }
        })?;
        let (name, list) = split_tag(body, offset)?;
        trace!(directive = %name, offset, "parsing directive");

        match name.as_str() {
            "if" => {
                let condition = self.condition(&name, offset, list)?;
                self.stack.push(Frame::If(IfBuilder {
                    span,
                    condition,
                    then_branch: Vec::new(),
                    elif_branches: Vec::new(),
                    else_branch: None,
                }));
            }
            "elif" => {
                match self.stack.last() {
                    Some(Frame::If(builder)) if builder.else_branch.is_some() => {
                        return Err(ParseError::AfterElse {
                            directive: name,
                            offset,
                            opener_offset: builder.span.start,
                        });
                    }
                    Some(Frame::If(_)) => {}
                    _ => return Err(self.unexpected(&name, "if", offset)),
                }
                // later directives land in the new branch via `current()`
                let condition = self.condition(&name, offset, list)?;
                if let Some(Frame::If(builder)) = self.stack.last_mut() {
                    builder.elif_branches.push((condition, Vec::new()));
                }
            }
            "else" => {
                self.attributes(&name, offset, list, &[])?;
                match self.stack.last() {
                    Some(Frame::If(builder)) if builder.else_branch.is_some() => {
                        return Err(ParseError::AfterElse {
                            directive: name,
                            offset,
                            opener_offset: builder.span.start,
                        });
                    }
                    Some(Frame::If(_)) => {}
                    _ => return Err(self.unexpected(&name, "if", offset)),
                }
                if let Some(Frame::If(builder)) = self.stack.last_mut() {
                    builder.else_branch = Some(Vec::new());
                }
            }
            "endif" => {
                self.attributes(&name, offset, list, &[])?;
                let builder = match self.stack.pop() {
                    Some(Frame::If(builder)) => builder,
                    other => {
                        // restore the frame so `unexpected` can report it
                        self.stack.extend(other);
                        return Err(self.unexpected(&name, "if", offset));
                    }
                };
                let node = Node {
                    span: Span {
                        start: builder.span.start,
                        end: span.end,
                        kind: SpanKind::Directive,
                    },
                    kind: NodeKind::If {
                        condition: builder.condition,
                        then_branch: builder.then_branch,
                        elif_branches: builder.elif_branches,
                        else_branch: builder.else_branch,
                    },
                };
                self.current().push(node);
            }
            "block" => {
                let mut attrs = self.attributes(&name, offset, list, &["name"])?;
                let block_name = attrs.require("name")?;
                self.stack.push(Frame::Block {
                    span,
                    name: block_name,
                    body: Vec::new(),
                });
            }
            "endblock" => {
                self.attributes(&name, offset, list, &[])?;
                let (start, block_name, body) = match self.stack.pop() {
                    Some(Frame::Block { span, name, body }) => (span.start, name, body),
                    other => {
                        // restore the frame so `unexpected` can report it
                        self.stack.extend(other);
                        return Err(self.unexpected(&name, "block", offset));
                    }
                };
                self.current().push(Node {
                    span: Span {
                        start,
                        end: span.end,
                        kind: SpanKind::Directive,
                    },
                    kind: NodeKind::BlockDef {
                        name: block_name,
                        body,
                    },
                });
            }
            _ => {
                let kind = self.simple(&name, offset, list)?;
                self.current().push(Node { span, kind });
            }
        }
        Ok(())
    }

    /// Directives that produce a single leaf node.
    fn simple(&self, name: &str, offset: usize, list: Vec<Attribute>) -> Result<NodeKind, ParseError> {
        let kind = match name {
            "echo" => {
                let mut attrs = self.attributes(name, offset, list, &["var", "encoding", "default"])?;
                let var = attrs.require("var")?;
                let encoding = match attrs.take("encoding") {
                    Some(raw) => Some(
                        Encoding::from_name(&raw).ok_or_else(|| attrs.invalid("encoding", raw))?,
                    ),
                    None => None,
                };
                let default = attrs.take_template("default")?;
                NodeKind::Echo {
                    var,
                    encoding,
                    default,
                }
            }
            "set" => {
                let mut attrs = self.attributes(name, offset, list, &["var", "value"])?;
                let var = attrs.require("var")?;
                let raw = attrs.require("value")?;
                NodeKind::Set {
                    var,
                    value: attrs.template(&raw)?,
                }
            }
            "include" => {
                let mut attrs = self.attributes(
                    name,
                    offset,
                    list,
                    &["virtual", "file", "onerror", "set", "stub", "wait"],
                )?;
                let target = attrs.target()?;
                let on_error = attrs.take_template("onerror")?;
                let set = attrs.take("set");
                let stub = attrs.take("stub");
                // evaluation is synchronous, so `wait` has nothing to change
                attrs.take("wait");
                NodeKind::Include {
                    target,
                    on_error,
                    set,
                    stub,
                }
            }
            "config" => {
                let mut attrs = self.attributes(
                    name,
                    offset,
                    list,
                    &["errmsg", "echomsg", "sizefmt", "timefmt"],
                )?;
                let errmsg = attrs.take_template("errmsg")?;
                let echomsg = attrs.take_template("echomsg")?;
                let sizefmt = match attrs.take("sizefmt") {
                    Some(raw) => Some(
                        SizeFmt::from_name(&raw).ok_or_else(|| attrs.invalid("sizefmt", raw))?,
                    ),
                    None => None,
                };
                let timefmt = match attrs.take("timefmt") {
                    Some(raw) if !is_valid_timefmt(&raw) => {
                        return Err(attrs.invalid("timefmt", raw));
                    }
                    other => other,
                };
                NodeKind::Config {
                    errmsg,
                    echomsg,
                    sizefmt,
                    timefmt,
                }
            }
            "flastmod" => {
                let mut attrs = self.attributes(name, offset, list, &["virtual", "file"])?;
                NodeKind::FlastMod {
                    target: attrs.target()?,
                }
            }
            "fsize" => {
                let mut attrs = self.attributes(name, offset, list, &["virtual", "file"])?;
                NodeKind::Fsize {
                    target: attrs.target()?,
                }
            }
            "printenv" => {
                self.attributes(name, offset, list, &[])?;
                NodeKind::PrintEnv
            }
            "comment" => NodeKind::Comment,
            _ => {
                warn!(directive = %name, offset, "unknown directive treated as no-op");
                NodeKind::Unknown {
                    name: name.to_string(),
                }
            }
        };
        Ok(kind)
    }
}

use crate::ast::*;
use crate::context::{format_time, EvaluationContext};
use crate::error::EvalError;
use crate::interp::ValueTemplate;
use crate::resolver::{ResolveError, Resolver};
use std::borrow::Cow;
use std::collections::HashMap;
use std::fmt;
use tracing::{debug, trace, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecoverableKind {
    /// `echo` of a variable that is not defined.
    UndefinedVariable,
    /// The resolver could not produce bytes or metadata.
    Resolve,
    /// `include stub="…"` names a block that was never defined.
    UnknownBlock,
    /// A block was reached again while it was still being rendered.
    RecursiveBlock,
}

/// A fault that degraded one directive's output without stopping the run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecoverableError {
    pub offset: usize,
    pub directive: String,
    pub kind: RecoverableKind,
    pub message: String,
}

impl fmt::Display for RecoverableError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "`{}` at byte {}: {}", self.directive, self.offset, self.message)
    }
}

#[derive(Debug, Clone)]
pub struct EvaluationResult {
    pub output: Vec<u8>,
    pub errors: Vec<RecoverableError>,
    /// The context as the run left it, including `set` and `config` effects.
    pub context: EvaluationContext,
}

impl EvaluationResult {
    pub fn output_lossy(&self) -> Cow<'_, str> {
        String::from_utf8_lossy(&self.output)
    }
}

pub fn encode(value: &str, encoding: Encoding) -> Cow<'_, str> {
    match encoding {
        Encoding::None => Cow::Borrowed(value),
        Encoding::Entity => escape_entities(value),
        Encoding::Url => urlencoding::encode(value),
    }
}

fn escape_entities(value: &str) -> Cow<'_, str> {
    if !value.contains(|c| matches!(c, '<' | '>' | '&' | '"' | '\'')) {
        return Cow::Borrowed(value);
    }
    let mut out = String::with_capacity(value.len() + 16);
    for c in value.chars() {
        match c {
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '&' => out.push_str("&amp;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#39;"),
            _ => out.push(c),
        }
    }
    Cow::Owned(out)
}

pub fn format_size(size: u64, fmt: SizeFmt) -> String {
    match fmt {
        SizeFmt::Bytes => {
            let digits = size.to_string();
            let mut out = String::with_capacity(digits.len() + digits.len() / 3);
            for (i, c) in digits.chars().enumerate() {
                if i > 0 && (digits.len() - i) % 3 == 0 {
                    out.push(',');
                }
                out.push(c);
            }
            out
        }
        SizeFmt::Abbrev => abbreviate(size),
    }
}

// One decimal below 10 units, whole units above; 973 and up rolls over.
fn abbreviate(size: u64) -> String {
    const UNITS: [char; 6] = ['K', 'M', 'G', 'T', 'P', 'E'];
    if size < 973 {
        return size.to_string();
    }
    let mut size = size;
    let mut unit = 0;
    loop {
        let remain = size & 1023;
        size >>= 10;
        if size >= 973 {
            unit += 1;
            continue;
        }
        let suffix = UNITS.get(unit).copied().unwrap_or('E');
        if size < 9 || (size == 9 && remain < 973) {
            let mut tenths = (remain * 5 + 256) / 512;
            let mut whole = size;
            if tenths >= 10 {
                whole += 1;
                tenths = 0;
            }
            return format!("{whole}.{tenths}{suffix}");
        }
        let whole = if remain >= 512 { size + 1 } else { size };
        return format!("{whole}{suffix}");
    }
}

/// Walks a parsed tree, threading one mutable context.
pub struct Evaluator<'t, 'r, R: Resolver + ?Sized> {
    ctx: EvaluationContext,
    resolver: &'r R,
    errors: Vec<RecoverableError>,
    blocks: HashMap<&'t str, &'t Block>,
    // names of the blocks currently being rendered, innermost last
    expanding: Vec<&'t str>,
}

impl<'t, 'r, R: Resolver + ?Sized> Evaluator<'t, 'r, R> {
    pub fn new(context: EvaluationContext, resolver: &'r R) -> Self {
        Self {
            ctx: context,
            resolver,
            errors: Vec::new(),
            blocks: HashMap::new(),
            expanding: Vec::new(),
        }
    }

    pub fn context(&self) -> &EvaluationContext {
        &self.ctx
    }

    pub fn finish(self, output: Vec<u8>) -> EvaluationResult {
        EvaluationResult {
            output,
            errors: self.errors,
            context: self.ctx,
        }
    }

    fn substitute(&self, template: &ValueTemplate) -> String {
        template.render(|name| self.ctx.get(name))
    }

    fn recoverable(&mut self, node: &Node, kind: RecoverableKind, message: String) {
        warn!(directive = node.kind.name(), offset = node.span.start, %message, "recoverable error");
        self.errors.push(RecoverableError {
            offset: node.span.start,
            directive: node.kind.name().to_string(),
            kind,
            message,
        });
    }

    /// Records a resolver failure, or aborts if the resolver says so.
    fn resolver_failed(&mut self, node: &Node, err: ResolveError) -> Result<(), EvalError> {
        if err.is_fatal() {
            return Err(EvalError::Resolver {
                directive: node.kind.name().to_string(),
                offset: node.span.start,
                source: err,
            });
        }
        self.recoverable(node, RecoverableKind::Resolve, err.to_string());
        Ok(())
    }

    fn errmsg(&self) -> Vec<u8> {
        self.ctx.config().errmsg.clone().into_bytes()
    }

    /// Renders the block registered under `name` into a fresh buffer.
    ///
    /// Returns `None` for an unknown name, and for a block that is already
    /// being rendered further up; the latter is recorded as
    /// [`RecoverableKind::RecursiveBlock`].
    fn expand(&mut self, node: &Node, name: &str) -> Result<Option<Vec<u8>>, EvalError> {
        let (name, block) = match self.blocks.get_key_value(name) {
            Some((name, block)) => (*name, *block),
            None => return Ok(None),
        };
        if self.expanding.contains(&name) {
            self.recoverable(
                node,
                RecoverableKind::RecursiveBlock,
                format!("block `{name}` is already being rendered"),
            );
            return Ok(None);
        }
        self.expanding.push(name);
        let mut buf = Vec::new();
        let rendered = self.render(block, &mut buf);
        self.expanding.pop();
        rendered?;
        Ok(Some(buf))
    }

    pub fn render(&mut self, block: &'t Block, out: &mut Vec<u8>) -> Result<(), EvalError> {
        for node in block {
            trace!(directive = node.kind.name(), offset = node.span.start, "evaluating");
            match &node.kind {
                NodeKind::Literal(bytes) => out.extend_from_slice(bytes),
                NodeKind::Echo {
                    var,
                    encoding,
                    default,
                } => match self.ctx.get(var) {
                    Some(value) => {
                        let encoding = encoding.unwrap_or(self.ctx.config().encoding);
                        out.extend_from_slice(encode(&value, encoding).as_bytes());
                    }
                    // a block of that name stands in for the variable, as markup
                    None if self.blocks.contains_key(var.as_str()) => {
                        match self.expand(node, var)? {
                            Some(bytes) => out.extend(bytes),
                            None => out.extend(self.errmsg()),
                        }
                    }
                    None => match default {
                        Some(default) => out.extend_from_slice(self.substitute(default).as_bytes()),
                        None => {
                            out.extend_from_slice(self.ctx.config().echomsg.as_bytes());
                            self.recoverable(
                                node,
                                RecoverableKind::UndefinedVariable,
                                format!("variable `{var}` is not defined"),
                            );
                        }
                    },
                },
                NodeKind::Set { var, value } => {
                    let value = self.substitute(value);
                    debug!(%var, %value, "set");
                    self.ctx.set(var.clone(), value);
                }
                NodeKind::Config {
                    errmsg,
                    echomsg,
                    sizefmt,
                    timefmt,
                } => {
                    let errmsg = errmsg.as_ref().map(|t| self.substitute(t));
                    let echomsg = echomsg.as_ref().map(|t| self.substitute(t));
                    let config = self.ctx.config_mut();
                    if let Some(errmsg) = errmsg {
                        config.errmsg = errmsg;
                    }
                    if let Some(echomsg) = echomsg {
                        config.echomsg = echomsg;
                    }
                    if let Some(sizefmt) = sizefmt {
                        config.sizefmt = *sizefmt;
                    }
                    if let Some(timefmt) = timefmt {
                        config.timefmt = timefmt.clone();
                    }
                }
                NodeKind::If {
                    condition,
                    then_branch,
                    elif_branches,
                    else_branch,
                } => {
                    if self.truth(condition) {
                        self.render(then_branch, out)?;
                        continue;
                    }
                    let mut matched = false;
                    for (cond, body) in elif_branches {
                        if self.truth(cond) {
                            self.render(body, out)?;
                            matched = true;
                            break;
                        }
                    }
                    if !matched {
                        if let Some(body) = else_branch {
                            self.render(body, out)?;
                        }
                    }
                }
                NodeKind::Include {
                    target,
                    on_error,
                    set,
                    stub,
                } => self.include(node, target, on_error.as_ref(), set.as_deref(), stub.as_deref(), out)?,
                NodeKind::FlastMod { target } => {
                    let target = target.map(|p| self.substitute(p));
                    match self.resolver.metadata(&target) {
                        Ok(meta) => {
                            let text = format_time(&meta.modified_at, &self.ctx.config().timefmt);
                            out.extend_from_slice(text.as_bytes());
                        }
                        Err(err) => {
                            self.resolver_failed(node, err)?;
                            out.extend(self.errmsg());
                        }
                    }
                }
                NodeKind::Fsize { target } => {
                    let target = target.map(|p| self.substitute(p));
                    match self.resolver.metadata(&target) {
                        Ok(meta) => {
                            let text = format_size(meta.size_bytes, self.ctx.config().sizefmt);
                            out.extend_from_slice(text.as_bytes());
                        }
                        Err(err) => {
                            self.resolver_failed(node, err)?;
                            out.extend(self.errmsg());
                        }
                    }
                }
                NodeKind::BlockDef { name, body } => {
                    self.blocks.insert(name.as_str(), body);
                }
                NodeKind::PrintEnv => {
                    let mut vars: Vec<_> = self.ctx.vars().iter().collect();
                    vars.sort();
                    for (name, value) in vars {
                        out.extend_from_slice(encode(name, Encoding::Entity).as_bytes());
                        out.push(b'=');
                        out.extend_from_slice(encode(value, Encoding::Entity).as_bytes());
                        out.push(b'\n');
                    }
                }
                NodeKind::Comment => {}
                NodeKind::Unknown { name } => debug!(directive = %name, "skipping unknown directive"),
            }
        }
        Ok(())
    }

    fn include(
        &mut self,
        node: &Node,
        target: &IncludeTarget<ValueTemplate>,
        on_error: Option<&ValueTemplate>,
        set: Option<&str>,
        stub: Option<&str>,
        out: &mut Vec<u8>,
    ) -> Result<(), EvalError> {
        let target = target.map(|p| self.substitute(p));
        // fallback order: the target, then `onerror`, then the `stub` block,
        // then errmsg
        let mut content = match self.resolver.resolve(&target) {
            Ok(bytes) => Some(bytes),
            Err(err) => {
                // only a fatal resolver error leaves the chain early
                self.resolver_failed(node, err)?;
                match on_error {
                    Some(fallback) => {
                        let fallback = IncludeTarget::Virtual(self.substitute(fallback));
                        match self.resolver.resolve(&fallback) {
                            Ok(bytes) => Some(bytes),
                            Err(err) => {
                                self.resolver_failed(node, err)?;
                                None
                            }
                        }
                    }
                    None => None,
                }
            }
        };

        // an empty document counts as missing when a stub is on hand
        if content.as_ref().map_or(true, |c| c.is_empty()) {
            if let Some(stub) = stub {
                if self.blocks.contains_key(stub) {
                    // `None` here means the stub is already being rendered
                    content = self.expand(node, stub)?;
                } else {
                    self.recoverable(
                        node,
                        RecoverableKind::UnknownBlock,
                        format!("stub block `{stub}` is not defined"),
                    );
                }
            }
        }

        match (content, set) {
            (Some(bytes), Some(var)) => {
                let value = String::from_utf8_lossy(&bytes).into_owned();
                self.ctx.set(var, value);
            }
            (Some(bytes), None) => out.extend(bytes),
            (None, _) => out.extend(self.errmsg()),
        }
        Ok(())
    }

    pub fn truth(&mut self, expr: &Expr) -> bool {
        match expr {
            Expr::StringLiteral(_) | Expr::VarRef(_) => !self.value(expr).is_empty(),
            Expr::Eq(a, b) => self.value(a) == self.value(b),
            Expr::Ne(a, b) => self.value(a) != self.value(b),
            Expr::Lt(a, b) => self.value(a) < self.value(b),
            Expr::Le(a, b) => self.value(a) <= self.value(b),
            Expr::Gt(a, b) => self.value(a) > self.value(b),
            Expr::Ge(a, b) => self.value(a) >= self.value(b),
            Expr::RegexMatch(subject, pattern) => self.matches(subject, pattern),
            Expr::RegexNotMatch(subject, pattern) => !self.matches(subject, pattern),
            Expr::Not(inner) => !self.truth(inner),
            Expr::And(a, b) => self.truth(a) && self.truth(b),
            Expr::Or(a, b) => self.truth(a) || self.truth(b),
            Expr::Group(inner) => self.truth(inner),
        }
    }

    /// String value of an operand; conditions used as operands read as
    /// `"1"` or `""`.
    fn value(&mut self, expr: &Expr) -> String {
        match expr {
            Expr::StringLiteral(template) => self.substitute(template),
            Expr::VarRef(name) => self.ctx.get(name).unwrap_or_default(),
            Expr::Group(inner) => self.value(inner),
            other => {
                if self.truth(other) {
                    "1".to_string()
                } else {
                    String::new()
                }
            }
        }
    }

    /// Unanchored search; a hit stores `$0`–`$9` and named groups.
    fn matches(&mut self, subject: &Expr, pattern: &Pattern) -> bool {
        let subject = self.value(subject);
        let captures = match pattern.regex().captures(&subject) {
            Some(captures) => captures,
            None => return false,
        };
        for (idx, group) in captures.iter().enumerate().take(10) {
            if let Some(group) = group {
                self.ctx.set(idx.to_string(), group.as_str());
            }
        }
        for name in pattern.regex().capture_names().flatten() {
            if let Some(group) = captures.name(name) {
                self.ctx.set(name, group.as_str());
            }
        }
        true
    }
}

/// Evaluates `tree` against `context`, resetting its configuration first.
#[tracing::instrument(level = "debug", skip_all, fields(nodes = tree.len()))]
pub fn evaluate<R: Resolver + ?Sized>(
    tree: &Block,
    mut context: EvaluationContext,
    resolver: &R,
) -> Result<EvaluationResult, EvalError> {
    context.reset_config();
    let mut evaluator = Evaluator::new(context, resolver);
    let mut output = Vec::new();
    evaluator.render(tree, &mut output)?;
    let result = evaluator.finish(output);
    debug!(
        bytes = result.output.len(),
        errors = result.errors.len(),
        "evaluation finished"
    );
    Ok(result)
}

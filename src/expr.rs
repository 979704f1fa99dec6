//! Tokenizer and recursive-descent parser for `if`/`elif` conditions.
//!
//! Precedence, tightest first: primary, unary `!`, comparison
//! (non-associative), `&&`, `||`. Both logical operators associate left.

use crate::ast::{Expr, Pattern};
use crate::interp::{is_ident_char, ValueTemplate};
use std::collections::VecDeque;

#[derive(Debug, Clone, PartialEq)]
pub enum Token {
    Str(String),
    Var(String),
    Word(String),
    Regex(String),

    EqEq,     // = or ==
    NotEq,    // !=
    Match,    // =~
    NotMatch, // !~
    Lt,
    Le,
    Gt,
    Ge,
    Not,    // !
    And,    // &&
    Or,     // ||
    LParen, // (
    RParen, // )
}

/// Why a condition could not be parsed. `column` is a byte position inside
/// the expression text.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExprError {
    Syntax { column: usize, message: String },
    Regex { pattern: String, message: String },
}

impl ExprError {
    fn syntax(column: usize, message: impl Into<String>) -> Self {
        Self::Syntax {
            column,
            message: message.into(),
        }
    }
}

#[derive(Clone)]
pub struct Tokenizer<'a> {
    input: &'a str,
    cursor: usize,
}

fn is_word_char(c: char) -> bool {
    !c.is_whitespace() && !matches!(c, '(' | ')' | '!' | '=' | '&' | '|' | '<' | '>' | '"' | '\'')
}

impl<'a> Tokenizer<'a> {
    pub fn new(input: &'a str) -> Self {
        Self { input, cursor: 0 }
    }

    fn remaining(&self) -> &'a str {
        &self.input[self.cursor..]
    }

    fn advance(&mut self, n: usize) {
        self.cursor += n;
    }

    pub fn next_token(&mut self) -> Result<Option<(usize, Token)>, ExprError> {
        let rest = self.remaining();
        let trimmed = rest.trim_start();
        self.advance(rest.len() - trimmed.len());

        let start = self.cursor;
        let rest = self.remaining();
        let first = match rest.chars().next() {
            Some(c) => c,
            None => return Ok(None),
        };

        const SYMBOLS: [(&str, Token); 13] = [
            ("==", Token::EqEq),
            ("!=", Token::NotEq),
            ("=~", Token::Match),
            ("!~", Token::NotMatch),
            ("<=", Token::Le),
            (">=", Token::Ge),
            ("&&", Token::And),
            ("||", Token::Or),
            ("=", Token::EqEq),
            ("<", Token::Lt),
            (">", Token::Gt),
            ("(", Token::LParen),
            (")", Token::RParen),
        ];
        for (symbol, token) in SYMBOLS {
            if rest.starts_with(symbol) {
                self.advance(symbol.len());
                return Ok(Some((start, token)));
            }
        }
        if first == '!' {
            self.advance(1);
            return Ok(Some((start, Token::Not)));
        }
        if first == '&' || first == '|' {
            return Err(ExprError::syntax(
                start,
                format!("`{first}` must be doubled (`{first}{first}`)"),
            ));
        }

        if first == '"' || first == '\'' {
            let quote = first;
            let mut s = String::new();
            let mut chars = rest.char_indices().skip(1);
            while let Some((idx, c)) = chars.next() {
                if c == quote {
                    self.advance(idx + 1);
                    return Ok(Some((start, Token::Str(s))));
                }
                if c == '\\' {
                    match chars.next() {
                        Some((_, esc)) if esc == quote || esc == '\\' => s.push(esc),
                        // `\$` stays escaped for the marker parser
                        Some((_, esc)) => {
                            s.push('\\');
                            s.push(esc);
                        }
                        None => break,
                    }
                } else {
                    s.push(c);
                }
            }
            return Err(ExprError::syntax(start, "unterminated string"));
        }

        if first == '/' {
            let mut pattern = String::new();
            let mut chars = rest.char_indices().skip(1);
            while let Some((idx, c)) = chars.next() {
                match c {
                    '/' => {
                        self.advance(idx + 1);
                        return Ok(Some((start, Token::Regex(pattern))));
                    }
                    '\\' => match chars.next() {
                        Some((_, '/')) => pattern.push('/'),
                        Some((_, esc)) => {
                            pattern.push('\\');
                            pattern.push(esc);
                        }
                        None => break,
                    },
                    _ => pattern.push(c),
                }
            }
            return Err(ExprError::syntax(start, "unterminated regular expression"));
        }

        if first == '$' {
            let after = &rest[1..];
            if let Some(inner) = after.strip_prefix('{') {
                let close = inner
                    .find('}')
                    .ok_or_else(|| ExprError::syntax(start, "unclosed `${` marker"))?;
                let name = &inner[..close];
                if name.is_empty() {
                    return Err(ExprError::syntax(start, "empty `${}` marker"));
                }
                self.advance(close + 3);
                return Ok(Some((start, Token::Var(name.to_string()))));
            }
            let len = after
                .find(|c: char| !is_ident_char(c))
                .unwrap_or(after.len());
            if len == 0 {
                return Err(ExprError::syntax(start, "`$` must be followed by a variable name"));
            }
            self.advance(len + 1);
            return Ok(Some((start, Token::Var(after[..len].to_string()))));
        }

        let len = rest.find(|c: char| !is_word_char(c)).unwrap_or(rest.len());
        self.advance(len);
        Ok(Some((start, Token::Word(rest[..len].to_string()))))
    }
}

/// Deepest tree the parser will build. Every `(`, `!`, `&&` and `||`
/// adds a level; evaluation recurses once per level.
pub const MAX_DEPTH: usize = 256;

pub struct Parser<'a> {
    lexer: Tokenizer<'a>,
    buffer: VecDeque<(usize, Token)>,
    len: usize,
    depth: usize,
}

/// Which rule produced a primary; a bare word may not stand alone.
enum Operand {
    Bare(usize, String),
    Expr(Expr),
}

impl Operand {
    fn into_expr(self) -> Result<Expr, ExprError> {
        match self {
            Operand::Expr(e) => Ok(e),
            Operand::Bare(column, word) => Err(ExprError::syntax(
                column,
                format!("bare word `{word}` is not a condition (use `${word}` or quote it)"),
            )),
        }
    }

    fn into_value(self) -> Result<Expr, ExprError> {
        match self {
            Operand::Expr(e) => Ok(e),
            Operand::Bare(column, word) => template(column, &word).map(Expr::StringLiteral),
        }
    }
}

fn template(column: usize, raw: &str) -> Result<ValueTemplate, ExprError> {
    ValueTemplate::parse(raw)
        .map_err(|e| ExprError::syntax(column + e.position(), format!("{e} in string")))
}

fn compile(source: &str) -> Result<Pattern, ExprError> {
    Pattern::new(source).map_err(|e| ExprError::Regex {
        pattern: source.to_string(),
        message: e.to_string(),
    })
}

impl<'a> Parser<'a> {
    pub fn new(input: &'a str) -> Self {
        Self {
            lexer: Tokenizer::new(input),
            buffer: VecDeque::new(),
            len: input.len(),
            depth: 0,
        }
    }

    fn peek(&mut self) -> Result<Option<&Token>, ExprError> {
        if self.buffer.is_empty() {
            if let Some(token) = self.lexer.next_token()? {
                self.buffer.push_back(token);
            }
        }
        Ok(self.buffer.front().map(|(_, t)| t))
    }

    fn consume(&mut self) -> Result<Option<(usize, Token)>, ExprError> {
        match self.buffer.pop_front() {
            Some(token) => Ok(Some(token)),
            None => self.lexer.next_token(),
        }
    }

    /// Consumes the operator just peeked and enters one more level.
    fn descend(&mut self) -> Result<(), ExprError> {
        let column = self.consume()?.map_or(self.len, |(c, _)| c);
        self.depth += 1;
        if self.depth > MAX_DEPTH {
            return Err(ExprError::syntax(column, "expression nested too deeply"));
        }
        Ok(())
    }

    pub fn parse(&mut self) -> Result<Expr, ExprError> {
        if self.peek()?.is_none() {
            return Err(ExprError::syntax(0, "empty expression"));
        }
        let expr = self.parse_or()?;
        match self.consume()? {
            None => Ok(expr),
            Some((column, t)) => Err(ExprError::syntax(column, format!("unexpected {t:?}"))),
        }
    }

    fn parse_or(&mut self) -> Result<Expr, ExprError> {
        let mut lhs = self.parse_and()?;
        let entered = self.depth;
        // `a || b || c` nests to the left, one level per operator
        while let Some(Token::Or) = self.peek()? {
            self.descend()?;
            let rhs = self.parse_and()?;
            lhs = Expr::Or(Box::new(lhs), Box::new(rhs));
        }
        self.depth = entered;
        Ok(lhs)
    }

    fn parse_and(&mut self) -> Result<Expr, ExprError> {
        let mut lhs = self.parse_comparison()?;
        let entered = self.depth;
        while let Some(Token::And) = self.peek()? {
            self.descend()?;
            let rhs = self.parse_comparison()?;
            lhs = Expr::And(Box::new(lhs), Box::new(rhs));
        }
        self.depth = entered;
        Ok(lhs)
    }

    fn parse_comparison(&mut self) -> Result<Expr, ExprError> {
        let lhs = self.parse_unary()?;
        let op = match self.peek()? {
            Some(
                t @ (Token::EqEq
                | Token::NotEq
                | Token::Match
                | Token::NotMatch
                | Token::Lt
                | Token::Le
                | Token::Gt
                | Token::Ge),
            ) => t.clone(),
            _ => return lhs.into_expr(),
        };
        self.consume()?;
        let lhs = Box::new(lhs.into_value()?);

        let expr = match op {
            Token::Match | Token::NotMatch => {
                let pattern = self.parse_pattern()?;
                if op == Token::Match {
                    Expr::RegexMatch(lhs, pattern)
                } else {
                    Expr::RegexNotMatch(lhs, pattern)
                }
            }
            Token::EqEq | Token::NotEq if matches!(self.peek()?, Some(Token::Regex(_))) => {
                let pattern = self.parse_pattern()?;
                if op == Token::EqEq {
                    Expr::RegexMatch(lhs, pattern)
                } else {
                    Expr::RegexNotMatch(lhs, pattern)
                }
            }
            _ => {
                let rhs = Box::new(self.parse_unary()?.into_value()?);
                match op {
                    Token::EqEq => Expr::Eq(lhs, rhs),
                    Token::NotEq => Expr::Ne(lhs, rhs),
                    Token::Lt => Expr::Lt(lhs, rhs),
                    Token::Le => Expr::Le(lhs, rhs),
                    Token::Gt => Expr::Gt(lhs, rhs),
                    _ => Expr::Ge(lhs, rhs),
                }
            }
        };

        if let Some(
            Token::EqEq
            | Token::NotEq
            | Token::Match
            | Token::NotMatch
            | Token::Lt
            | Token::Le
            | Token::Gt
            | Token::Ge,
        ) = self.peek()?
        {
            let column = self.buffer.front().map(|(c, _)| *c).unwrap_or(self.len);
            return Err(ExprError::syntax(
                column,
                "comparisons do not chain; add parentheses",
            ));
        }
        Ok(expr)
    }

    fn parse_pattern(&mut self) -> Result<Pattern, ExprError> {
        match self.consume()? {
            Some((_, Token::Regex(source))) | Some((_, Token::Str(source))) => compile(&source),
            Some((column, t)) => Err(ExprError::syntax(
                column,
                format!("expected a regular expression, got {t:?}"),
            )),
            None => Err(ExprError::syntax(self.len, "expected a regular expression")),
        }
    }

    fn parse_unary(&mut self) -> Result<Operand, ExprError> {
        if let Some(Token::Not) = self.peek()? {
            self.descend()?;
            let inner = self.parse_unary()?.into_expr()?;
            self.depth -= 1;
            return Ok(Operand::Expr(Expr::Not(Box::new(inner))));
        }
        self.parse_primary()
    }

    fn parse_primary(&mut self) -> Result<Operand, ExprError> {
        if let Some(Token::LParen) = self.peek()? {
            self.descend()?;
            let inner = self.parse_or()?;
            self.depth -= 1;
            return match self.consume()? {
                Some((_, Token::RParen)) => Ok(Operand::Expr(Expr::Group(Box::new(inner)))),
                Some((column, t)) => {
                    Err(ExprError::syntax(column, format!("expected `)`, got {t:?}")))
                }
                None => Err(ExprError::syntax(self.len, "unbalanced `(`")),
            };
        }
        match self.consume()? {
            Some((column, Token::Str(s))) => {
                Ok(Operand::Expr(Expr::StringLiteral(template(column + 1, &s)?)))
            }
            Some((_, Token::Var(name))) => Ok(Operand::Expr(Expr::VarRef(name))),
            Some((column, Token::Word(w))) => Ok(Operand::Bare(column, w)),
            Some((column, t)) => Err(ExprError::syntax(
                column,
                format!("expected an operand, got {t:?}"),
            )),
            None => Err(ExprError::syntax(self.len, "missing operand")),
        }
    }
}

pub fn parse_expr(input: &str) -> Result<Expr, ExprError> {
    Parser::new(input).parse()
}

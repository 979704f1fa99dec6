use crate::interp::ValueTemplate;
use crate::lexer::Span;
use regex::Regex;
use std::fmt;

/// Where an `include`, `flastmod` or `fsize` directive points.
///
/// The tree stores targets as [`ValueTemplate`]s; the resolver receives them
/// with every variable marker already substituted.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum IncludeTarget<P = String> {
    Virtual(P),
    File(P),
}

impl<P> IncludeTarget<P> {
    pub fn path(&self) -> &P {
        match self {
            Self::Virtual(p) | Self::File(p) => p,
        }
    }

    pub fn map<Q, F: FnOnce(&P) -> Q>(&self, f: F) -> IncludeTarget<Q> {
        match self {
            Self::Virtual(p) => IncludeTarget::Virtual(f(p)),
            Self::File(p) => IncludeTarget::File(f(p)),
        }
    }
}

impl<P: fmt::Display> fmt::Display for IncludeTarget<P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Virtual(p) => write!(f, "virtual \"{p}\""),
            Self::File(p) => write!(f, "file \"{p}\""),
        }
    }
}

/// Output encoding applied by `echo`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Encoding {
    None,
    #[default]
    Entity,
    Url,
}

impl Encoding {
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "none" => Some(Self::None),
            "entity" => Some(Self::Entity),
            "url" => Some(Self::Url),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SizeFmt {
    Bytes,
    #[default]
    Abbrev,
}

impl SizeFmt {
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "bytes" => Some(Self::Bytes),
            "abbrev" => Some(Self::Abbrev),
            _ => None,
        }
    }
}

/// A compiled regular expression together with the text it came from.
#[derive(Debug, Clone)]
pub struct Pattern {
    source: String,
    regex: Regex,
}

impl Pattern {
    pub fn new(source: &str) -> Result<Self, regex::Error> {
        Ok(Self {
            source: source.to_string(),
            regex: Regex::new(source)?,
        })
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    pub fn regex(&self) -> &Regex {
        &self.regex
    }
}

impl PartialEq for Pattern {
    fn eq(&self, other: &Self) -> bool {
        self.source == other.source
    }
}

impl Eq for Pattern {}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Expr {
    StringLiteral(ValueTemplate),
    VarRef(String),
    Eq(Box<Expr>, Box<Expr>),
    Ne(Box<Expr>, Box<Expr>),
    Lt(Box<Expr>, Box<Expr>),
    Le(Box<Expr>, Box<Expr>),
    Gt(Box<Expr>, Box<Expr>),
    Ge(Box<Expr>, Box<Expr>),
    RegexMatch(Box<Expr>, Pattern),
    RegexNotMatch(Box<Expr>, Pattern),
    Not(Box<Expr>),
    And(Box<Expr>, Box<Expr>),
    Or(Box<Expr>, Box<Expr>),
    Group(Box<Expr>),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Node {
    pub span: Span,
    pub kind: NodeKind,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NodeKind {
    Literal(Vec<u8>),
    Echo {
        var: String,
        encoding: Option<Encoding>, // None: the context's default
        default: Option<ValueTemplate>,
    },
    Set {
        var: String,
        value: ValueTemplate,
    },
    Include {
        target: IncludeTarget<ValueTemplate>,
        on_error: Option<ValueTemplate>,
        set: Option<String>,
        stub: Option<String>,
    },
    Config {
        errmsg: Option<ValueTemplate>,
        echomsg: Option<ValueTemplate>,
        sizefmt: Option<SizeFmt>,
        timefmt: Option<String>,
    },
    If {
        condition: Expr,
        then_branch: Block,
        elif_branches: Vec<(Expr, Block)>,
        else_branch: Option<Block>,
    },
    BlockDef {
        name: String,
        body: Block,
    },
    FlastMod {
        target: IncludeTarget<ValueTemplate>,
    },
    Fsize {
        target: IncludeTarget<ValueTemplate>,
    },
    PrintEnv,
    Comment,
    Unknown {
        name: String,
    },
}

impl NodeKind {
    /// Directive name as written in markup; `"text"` for literals.
    pub fn name(&self) -> &str {
        match self {
            Self::Literal(_) => "text",
            Self::Echo { .. } => "echo",
            Self::Set { .. } => "set",
            Self::Include { .. } => "include",
            Self::Config { .. } => "config",
            Self::If { .. } => "if",
            Self::BlockDef { .. } => "block",
            Self::FlastMod { .. } => "flastmod",
            Self::Fsize { .. } => "fsize",
            Self::PrintEnv => "printenv",
            Self::Comment => "comment",
            Self::Unknown { name } => name,
        }
    }
}

pub type Block = Vec<Node>;

use crate::span::Spanned;

/// A parsed `.weft` source: a flat list of declarations.
#[derive(Clone, Debug, Default)]
pub struct SourceFile {
    pub decls: Vec<Spanned<Decl>>,
}

#[derive(Clone, Debug)]
pub enum Decl {
    Bundle(BundleDecl),
    Spindle(SpindleDecl),
}

/// `name[outputs] = expr`, `name.field = expr`, or `name = expr`.
#[derive(Clone, Debug)]
pub struct BundleDecl {
    pub name: Spanned<String>,
    pub target: BundleTarget,
    pub value: Spanned<Expr>,
}

#[derive(Clone, Debug)]
pub enum BundleTarget {
    /// `name = expr` — width inferred from the right-hand side.
    Inferred,
    /// `name[r, g, b] = expr` or `name[0, 1] = expr`.
    Outputs(Vec<Spanned<OutputName>>),
    /// `name.field = expr` or `name.0 = expr` — one strand.
    Strand(Spanned<OutputName>),
}

/// A declared strand label: positional or named.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum OutputName {
    Index(u32),
    Name(String),
}

impl OutputName {
    /// The strand name this label binds (`"0"` for positional labels).
    pub fn strand_name(&self) -> String {
        match self {
            OutputName::Index(i) => i.to_string(),
            OutputName::Name(n) => n.clone(),
        }
    }
}

/// `spindle name(p1, p2) { body }`.
#[derive(Clone, Debug)]
pub struct SpindleDecl {
    pub name: Spanned<String>,
    pub params: Vec<Spanned<String>>,
    pub body: Body,
}

/// A brace-delimited body: spindle definitions and full chain patterns
/// share this shape (local bundle declarations plus return statements).
#[derive(Clone, Debug, Default)]
pub struct Body {
    pub items: Vec<Spanned<BodyItem>>,
}

#[derive(Clone, Debug)]
pub enum BodyItem {
    Local(BundleDecl),
    /// `return.N = expr`
    ReturnIndexed { index: u32, value: Spanned<Expr> },
    /// `return = expr` (commonly a tuple literal)
    Return { value: Spanned<Expr> },
}

/// A strand selector after `.`: `.field`, `.0`, or `.(expr)`.
#[derive(Clone, Debug)]
pub enum Selector {
    Index(u32),
    Name(String),
    Dynamic(Box<Spanned<Expr>>),
}

/// One `key ~ value` arm of a remap.
#[derive(Clone, Debug)]
pub struct RemapArm {
    /// Qualified key: `bundle.field`, `bundle.N`, or `me.t`.
    pub bundle: Spanned<String>,
    pub sel: Spanned<OutputName>,
    pub value: Spanned<Expr>,
}

/// One step of a chain: an inline tuple of expressions or a full body.
#[derive(Clone, Debug)]
pub enum ChainPattern {
    Inline(Vec<Spanned<Expr>>),
    Body(Body),
}

/// Surface expressions.
#[derive(Clone, Debug)]
pub enum Expr {
    Number(f64),
    Str(String),
    /// Bare identifier: a bundle, a spindle parameter, or a pattern slot name.
    Ident(String),
    /// `me.x`, `me.t`, ... — reserved coordinates.
    Me(Spanned<String>),
    /// `$name` or `$name(expr)`.
    Tag {
        name: Spanned<String>,
        arg: Option<Box<Spanned<Expr>>>,
    },
    /// `base.field` / `base.N` / `base.(expr)`; base is `None` for the bare
    /// pattern forms `.field` / `.N` / `.(expr)`.
    Access {
        base: Option<Box<Spanned<Expr>>>,
        sel: Selector,
    },
    Binary {
        op: BinOp,
        lhs: Box<Spanned<Expr>>,
        rhs: Box<Spanned<Expr>>,
    },
    Unary {
        op: UnOp,
        operand: Box<Spanned<Expr>>,
    },
    /// `name(args)` — a spindle call or a builtin; resolved during lowering.
    Call {
        name: Spanned<String>,
        args: Vec<Spanned<Expr>>,
    },
    /// `[e1, e2, ...]` — widths concatenate.
    Tuple(Vec<Spanned<Expr>>),
    /// `base | pattern | pattern ...`
    Chain {
        base: Box<Spanned<Expr>>,
        patterns: Vec<Spanned<ChainPattern>>,
    },
    /// `base[key ~ value, ...]`
    Remap {
        base: Box<Spanned<Expr>>,
        subs: Vec<RemapArm>,
    },
    /// `a..b` — legal only inside chain patterns; unrolled during lowering.
    Range {
        start: Box<Spanned<Expr>>,
        end: Box<Spanned<Expr>>,
    },
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BinOp {
    Add, // +
    Sub, // -
    Mul, // *
    Div, // /
    Rem, // %
    Pow, // ^
    Lt,  // <
    Gt,  // >
    Le,  // <=
    Ge,  // >=
    Eq,  // ==
    Ne,  // !=
    And, // &&
    Or,  // ||
}

impl BinOp {
    pub fn as_str(&self) -> &'static str {
        match self {
            BinOp::Add => "+",
            BinOp::Sub => "-",
            BinOp::Mul => "*",
            BinOp::Div => "/",
            BinOp::Rem => "%",
            BinOp::Pow => "^",
            BinOp::Lt => "<",
            BinOp::Gt => ">",
            BinOp::Le => "<=",
            BinOp::Ge => ">=",
            BinOp::Eq => "==",
            BinOp::Ne => "!=",
            BinOp::And => "&&",
            BinOp::Or => "||",
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum UnOp {
    Neg, // -
    Not, // !
}

impl UnOp {
    pub fn as_str(&self) -> &'static str {
        match self {
            UnOp::Neg => "-",
            UnOp::Not => "!",
        }
    }
}

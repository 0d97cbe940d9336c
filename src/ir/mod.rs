//! WEFT intermediate representation.
//!
//! Lowering turns the surface AST into per-strand scalar expression trees.
//! Every strand expression has width 1; multi-width surface expressions are
//! flattened during lowering. IR trees are immutable after lowering (the
//! cache extractor is the one pass that rewrites them, before code
//! generation).
//!
//! Pipeline:
//! ```text
//! AST → IR ─→ sched     → execution order
//!          ├→ annotate  → per-bundle signal annotations
//!          ├→ swatch    → per-backend compilation units
//!          ├→ cache     → history-buffer descriptors
//!          └→ codegen   → WGSL kernels (visual) / IR trees (audio)
//! ```

pub mod lower;
pub mod sched;

use std::collections::BTreeMap;
use std::fmt;

pub use crate::ast::{BinOp, UnOp};
use crate::span::Span;

// ─── Expressions ──────────────────────────────────────────────────

/// An IR expression: a variant tag plus the span it was lowered from.
/// Spans are for diagnostics only and never affect execution.
#[derive(Clone, Debug, PartialEq)]
pub struct Expr {
    pub kind: ExprKind,
    pub span: Span,
}

impl Expr {
    pub fn new(kind: ExprKind, span: Span) -> Self {
        Self { kind, span }
    }

    pub fn num(value: f64, span: Span) -> Self {
        Self::new(ExprKind::Num(value), span)
    }

    /// Number of nodes in this tree (pre-materialization heuristic).
    pub fn node_count(&self) -> usize {
        let mut count = 0;
        self.walk(&mut |_| count += 1);
        count
    }

    /// True if the tree contains a `cache` builtin or a `CacheRead`.
    pub fn is_stateful(&self) -> bool {
        let mut found = false;
        self.walk(&mut |e| {
            if matches!(
                e.kind,
                ExprKind::CacheRead { .. }
                    | ExprKind::Builtin {
                        name: BuiltinFn::Cache,
                        ..
                    }
            ) {
                found = true;
            }
        });
        found
    }

    /// True if the tree contains a spindle call.
    pub fn has_call(&self) -> bool {
        let mut found = false;
        self.walk(&mut |e| {
            if matches!(e.kind, ExprKind::Call { .. }) {
                found = true;
            }
        });
        found
    }

    /// Pre-order walk over this node and all children.
    pub fn walk<'a>(&'a self, f: &mut impl FnMut(&'a Expr)) {
        f(self);
        match &self.kind {
            ExprKind::Num(_) | ExprKind::Param(_) | ExprKind::Index { .. } => {}
            ExprKind::Binary { lhs, rhs, .. } => {
                lhs.walk(f);
                rhs.walk(f);
            }
            ExprKind::Unary { operand, .. } => operand.walk(f),
            ExprKind::Call { args, .. } | ExprKind::Builtin { args, .. } => {
                for arg in args {
                    arg.walk(f);
                }
            }
            ExprKind::Extract { call, .. } => call.walk(f),
            ExprKind::Remap { base, subs, .. } => {
                base.walk(f);
                for (_, value) in subs {
                    value.walk(f);
                }
            }
            ExprKind::CacheRead { tap, .. } => tap.walk(f),
        }
    }
}

/// The fixed expression variant set.
#[derive(Clone, Debug, PartialEq)]
pub enum ExprKind {
    /// Literal.
    Num(f64),
    /// Spindle parameter reference, valid only inside a spindle body.
    Param(String),
    /// Read a strand of `bundle`. Positional for ordinary bundles; the
    /// reserved `me` coordinates read by field name.
    Index { bundle: String, index: IndexKey },
    Binary {
        op: BinOp,
        lhs: Box<Expr>,
        rhs: Box<Expr>,
    },
    Unary {
        op: UnOp,
        operand: Box<Expr>,
    },
    /// Call a user spindle; evaluates to a tuple of the spindle's returns.
    Call { spindle: String, args: Vec<Expr> },
    /// Primitive call. Resource builtins carry `[resource_id, ..., channel]`.
    Builtin { name: BuiltinFn, args: Vec<Expr> },
    /// Project the i-th return of a call.
    Extract { call: Box<Expr>, index: u32 },
    /// Evaluate `base` with coordinate substitutions. Keys are qualified
    /// strand names (`bundle.field`); `temporal` is set when the keys
    /// contain `me.t`, which turns the base dependency into a
    /// previous-tick edge.
    Remap {
        base: Box<Expr>,
        subs: Vec<(String, Expr)>,
        temporal: bool,
    },
    /// Read one tap of a history buffer. Emitted by the cache extractor.
    CacheRead { id: String, tap: Box<Expr> },
}

/// How a strand is addressed in an `Index` node.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum IndexKey {
    Pos(u32),
    /// Reserved `me` coordinates only; ordinary bundle accesses are
    /// resolved to positions during lowering.
    Field(String),
}

impl fmt::Display for IndexKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IndexKey::Pos(i) => write!(f, "{}", i),
            IndexKey::Field(name) => write!(f, "{}", name),
        }
    }
}

// ─── Builtins ─────────────────────────────────────────────────────

/// The primitive set, with widths per the resource table.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum BuiltinFn {
    // Math, one argument
    Sin,
    Cos,
    Tan,
    Asin,
    Acos,
    Atan,
    Abs,
    Floor,
    Ceil,
    Round,
    Sqrt,
    Exp,
    Log,
    Log2,
    Sign,
    Fract,
    // Math, two arguments
    Atan2,
    Pow,
    Mod,
    Min,
    Max,
    Step,
    // Math, three arguments
    Clamp,
    Lerp,
    Smoothstep,
    // Variadic
    Select,
    // Signal generators
    Osc,
    Noise,
    // Hardware and resources
    Camera,
    Microphone,
    Texture,
    Load,
    Sample,
    Mouse,
    Text,
    Key,
    // History buffers (rewritten to CacheRead by the extractor)
    Cache,
}

impl BuiltinFn {
    pub fn from_name(name: &str) -> Option<BuiltinFn> {
        use BuiltinFn::*;
        match name {
            "sin" => Some(Sin),
            "cos" => Some(Cos),
            "tan" => Some(Tan),
            "asin" => Some(Asin),
            "acos" => Some(Acos),
            "atan" => Some(Atan),
            "abs" => Some(Abs),
            "floor" => Some(Floor),
            "ceil" => Some(Ceil),
            "round" => Some(Round),
            "sqrt" => Some(Sqrt),
            "exp" => Some(Exp),
            "log" => Some(Log),
            "log2" => Some(Log2),
            "sign" => Some(Sign),
            "fract" => Some(Fract),
            "atan2" => Some(Atan2),
            "pow" => Some(Pow),
            "mod" => Some(Mod),
            "min" => Some(Min),
            "max" => Some(Max),
            "step" => Some(Step),
            "clamp" => Some(Clamp),
            "lerp" | "mix" => Some(Lerp),
            "smoothstep" => Some(Smoothstep),
            "select" => Some(Select),
            "osc" => Some(Osc),
            "noise" => Some(Noise),
            "camera" => Some(Camera),
            "microphone" => Some(Microphone),
            "texture" => Some(Texture),
            "load" => Some(Load),
            "sample" => Some(Sample),
            "mouse" => Some(Mouse),
            "text" => Some(Text),
            "key" => Some(Key),
            "cache" => Some(Cache),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        use BuiltinFn::*;
        match self {
            Sin => "sin",
            Cos => "cos",
            Tan => "tan",
            Asin => "asin",
            Acos => "acos",
            Atan => "atan",
            Abs => "abs",
            Floor => "floor",
            Ceil => "ceil",
            Round => "round",
            Sqrt => "sqrt",
            Exp => "exp",
            Log => "log",
            Log2 => "log2",
            Sign => "sign",
            Fract => "fract",
            Atan2 => "atan2",
            Pow => "pow",
            Mod => "mod",
            Min => "min",
            Max => "max",
            Step => "step",
            Clamp => "clamp",
            Lerp => "lerp",
            Smoothstep => "smoothstep",
            Select => "select",
            Osc => "osc",
            Noise => "noise",
            Camera => "camera",
            Microphone => "microphone",
            Texture => "texture",
            Load => "load",
            Sample => "sample",
            Mouse => "mouse",
            Text => "text",
            Key => "key",
            Cache => "cache",
        }
    }

    /// Result width before per-channel expansion.
    pub fn width(&self) -> usize {
        use BuiltinFn::*;
        match self {
            Camera | Texture | Load | Mouse => 3,
            Microphone | Sample => 2,
            _ => 1,
        }
    }

    /// (min, max) argument count as written in source.
    pub fn arity(&self) -> (usize, usize) {
        use BuiltinFn::*;
        match self {
            Sin | Cos | Tan | Asin | Acos | Atan | Abs | Floor | Ceil | Round | Sqrt | Exp
            | Log | Log2 | Sign | Fract | Osc | Microphone | Key => (1, 1),
            Atan2 | Pow | Mod | Min | Max | Step | Camera => (2, 2),
            Clamp | Lerp | Smoothstep | Texture | Text => (3, 3),
            Select => (2, usize::MAX),
            Noise => (1, 2),
            Load => (1, 3),
            Sample => (1, 2),
            Mouse => (0, 0),
            Cache => (4, 4),
        }
    }

    /// True if the first source argument is an interned string resource.
    pub fn is_resource(&self) -> bool {
        matches!(
            self,
            BuiltinFn::Texture | BuiltinFn::Load | BuiltinFn::Sample | BuiltinFn::Text
        )
    }
}

// ─── Program structure ────────────────────────────────────────────

/// One element of a bundle.
#[derive(Clone, Debug)]
pub struct Strand {
    pub name: String,
    pub index: u32,
    pub expr: Expr,
}

/// A named tuple of strands. Strand order is significant.
#[derive(Clone, Debug)]
pub struct Bundle {
    pub name: String,
    pub strands: Vec<Strand>,
    pub span: Span,
}

impl Bundle {
    pub fn width(&self) -> usize {
        self.strands.len()
    }

    pub fn strand_index(&self, name: &str) -> Option<u32> {
        self.strands
            .iter()
            .find(|s| s.name == name)
            .map(|s| s.index)
    }
}

/// A user-defined function: ordered params, local bundles (mini-scope),
/// and a contiguous 0-based return tuple.
#[derive(Clone, Debug)]
pub struct Spindle {
    pub name: String,
    pub params: Vec<String>,
    pub locals: Vec<Bundle>,
    pub returns: Vec<Expr>,
    pub span: Span,
}

impl Spindle {
    pub fn width(&self) -> usize {
        self.returns.len()
    }

    pub fn local(&self, name: &str) -> Option<&Bundle> {
        self.locals.iter().find(|b| b.name == name)
    }
}

/// One scheduled step: the strands of `bundle` that a single source
/// declaration produced, in execution order.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ExecEntry {
    pub bundle: String,
    pub strands: Vec<u32>,
}

/// The lowered program: the §3 data model.
#[derive(Clone, Debug, Default)]
pub struct Program {
    pub bundles: BTreeMap<String, Bundle>,
    pub spindles: BTreeMap<String, Spindle>,
    /// Topological execution order over current-tick dependencies.
    pub order: Vec<ExecEntry>,
    /// Image/audio file paths, interned by path.
    pub resources: Vec<String>,
    /// Inline text resources, interned by content.
    pub text_resources: Vec<String>,
}

impl Program {
    /// Resolve a bundle name, checking the spindle mini-scope first.
    pub fn resolve_bundle<'a>(
        &'a self,
        scope: Option<&'a Spindle>,
        name: &str,
    ) -> Option<&'a Bundle> {
        if let Some(spindle) = scope {
            if let Some(local) = spindle.local(name) {
                return Some(local);
            }
        }
        self.bundles.get(name)
    }
}

/// Intern a string in a resource table, returning its id.
pub fn intern(table: &mut Vec<String>, value: &str) -> u32 {
    if let Some(i) = table.iter().position(|r| r == value) {
        return i as u32;
    }
    table.push(value.to_string());
    (table.len() - 1) as u32
}

// ─── Display ──────────────────────────────────────────────────────

impl fmt::Display for Expr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.kind {
            ExprKind::Num(n) => write!(f, "{}", n),
            ExprKind::Param(name) => write!(f, "{}", name),
            ExprKind::Index { bundle, index } => write!(f, "{}.{}", bundle, index),
            ExprKind::Binary { op, lhs, rhs } => {
                write!(f, "({} {} {})", lhs, op.as_str(), rhs)
            }
            ExprKind::Unary { op, operand } => write!(f, "{}{}", op.as_str(), operand),
            ExprKind::Call { spindle, args } => {
                write!(f, "{}(", spindle)?;
                for (i, arg) in args.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{}", arg)?;
                }
                write!(f, ")")
            }
            ExprKind::Builtin { name, args } => {
                write!(f, "{}(", name.as_str())?;
                for (i, arg) in args.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{}", arg)?;
                }
                write!(f, ")")
            }
            ExprKind::Extract { call, index } => write!(f, "{}.{}", call, index),
            ExprKind::Remap { base, subs, .. } => {
                write!(f, "{}[", base)?;
                for (i, (key, value)) in subs.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{} ~ {}", key, value)?;
                }
                write!(f, "]")
            }
            ExprKind::CacheRead { id, tap } => write!(f, "cache[{}][{}]", id, tap),
        }
    }
}

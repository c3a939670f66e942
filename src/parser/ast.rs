//! Abstract Syntax Tree definitions for the Python subset.

use std::fmt;

/// Source span for tracking positions in error messages
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Span {
    /// Byte offset from start of source
    pub offset: usize,
    /// Length in bytes
    pub length: usize,
}

impl Span {
    pub fn new(offset: usize, length: usize) -> Self {
        Self { offset, length }
    }

    /// Offset one past the last byte
    pub fn end(&self) -> usize {
        self.offset + self.length
    }

    /// Create a span that covers both self and other
    pub fn merge(&self, other: &Span) -> Span {
        let start = self.offset.min(other.offset);
        let end = (self.offset + self.length).max(other.offset + other.length);
        Span::new(start, end - start)
    }
}

/// The root of the AST: one source file
#[derive(Debug, Clone, Default)]
pub struct Module {
    pub body: Vec<Stmt>,
}

#[derive(Debug, Clone)]
pub struct Stmt {
    pub kind: StmtKind,
    pub span: Span,
}

impl Stmt {
    pub fn new(kind: StmtKind, span: Span) -> Self {
        Self { kind, span }
    }
}

/// Statements
#[derive(Debug, Clone)]
pub enum StmtKind {
    FunctionDef(FunctionDef),

    /// `target = value`; the target may be a tuple for unpacking
    Assign {
        target: Expr,
        value: Expr,
    },

    /// `name: annotation [= value]`
    AnnAssign {
        target: Expr,
        annotation: Annotation,
        value: Option<Expr>,
    },

    AugAssign {
        target: Expr,
        op: BinaryOp,
        value: Expr,
    },

    Expr(Expr),

    Return(Option<Expr>),

    /// `if` / `elif` chains are flattened into branches
    If {
        branches: Vec<(Expr, Vec<Stmt>)>,
        orelse: Vec<Stmt>,
    },

    For {
        target: Expr,
        iter: Expr,
        body: Vec<Stmt>,
        pragma: Option<Pragma>,
    },

    While {
        condition: Expr,
        body: Vec<Stmt>,
    },

    Break,
    Continue,
    Pass,

    /// `import a [as b], c`
    Import(Vec<ImportAlias>),

    /// `from m import a [as b], c`
    FromImport {
        module: String,
        names: Vec<ImportAlias>,
    },

    /// A directive comment that is not attached to a loop
    Pragma(Pragma),

    /// Grammar-level construct outside the compiled subset
    Unsupported(String),
}

/// Function definition
#[derive(Debug, Clone)]
pub struct FunctionDef {
    pub name: String,
    pub name_span: Span,
    pub params: Vec<Param>,
    pub returns: Option<Annotation>,
    pub body: Vec<Stmt>,
    pub decorators: Vec<Decorator>,
}

impl FunctionDef {
    /// Header stubs have a body made only of `...`, `pass` or a docstring.
    pub fn is_stub(&self) -> bool {
        self.body.iter().all(|stmt| match &stmt.kind {
            StmtKind::Pass => true,
            StmtKind::Expr(expr) => matches!(expr.kind, ExprKind::Ellipsis | ExprKind::Str(_)),
            _ => false,
        })
    }
}

/// Function parameter
#[derive(Debug, Clone)]
pub struct Param {
    pub name: String,
    pub span: Span,
    pub annotation: Option<Annotation>,
    pub default: Option<Expr>,
}

#[derive(Debug, Clone)]
pub struct Decorator {
    pub name: String,
    pub span: Span,
}

#[derive(Debug, Clone)]
pub struct ImportAlias {
    pub name: String,
    pub alias: Option<String>,
    pub span: Span,
}

impl ImportAlias {
    /// Name bound in the importing scope
    pub fn bound_name(&self) -> &str {
        self.alias.as_deref().unwrap_or(&self.name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PragmaFamily {
    OpenMp,
    OpenAcc,
}

impl fmt::Display for PragmaFamily {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PragmaFamily::OpenMp => write!(f, "omp"),
            PragmaFamily::OpenAcc => write!(f, "acc"),
        }
    }
}

/// `#$ omp parallel for` => family OpenMp, directive "parallel for"
#[derive(Debug, Clone, PartialEq)]
pub struct Pragma {
    pub family: PragmaFamily,
    pub directive: String,
    pub span: Span,
}

impl Pragma {
    /// Directives that apply to the loop written right after them
    pub fn is_loop_directive(&self) -> bool {
        self.directive
            .split_whitespace()
            .any(|word| matches!(word, "for" | "do" | "loop" | "simd" | "taskloop"))
    }
}

/// A parsed type annotation. Several alternatives make the function generic.
#[derive(Debug, Clone, PartialEq)]
pub struct Annotation {
    pub alternatives: Vec<AnnotatedType>,
    pub span: Span,
}

#[derive(Debug, Clone, PartialEq)]
pub struct AnnotatedType {
    /// Dtype name as written: `int`, `float64`, `complex`, ...
    pub dtype: String,
    pub rank: usize,
    pub order: Option<ArrayOrder>,
    pub is_const: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ArrayOrder {
    C,
    F,
}

/// Expressions
#[derive(Debug, Clone)]
pub struct Expr {
    pub kind: ExprKind,
    pub span: Span,
}

impl Expr {
    pub fn new(kind: ExprKind, span: Span) -> Self {
        Self { kind, span }
    }

    pub fn as_name(&self) -> Option<&str> {
        match &self.kind {
            ExprKind::Name(name) => Some(name),
            _ => None,
        }
    }

    /// `np.zeros` => Some("np.zeros")
    pub fn dotted_name(&self) -> Option<String> {
        match &self.kind {
            ExprKind::Name(name) => Some(name.clone()),
            ExprKind::Attribute { value, attr } => {
                value.dotted_name().map(|base| format!("{}.{}", base, attr))
            }
            _ => None,
        }
    }
}

#[derive(Debug, Clone)]
pub enum ExprKind {
    Int(i64),
    Float(f64),
    /// Imaginary literal `2j`; holds the imaginary part
    Imaginary(f64),
    Str(String),
    Bool(bool),
    None,
    Ellipsis,

    Name(String),

    Attribute {
        value: Box<Expr>,
        attr: String,
    },

    Call {
        func: Box<Expr>,
        args: Vec<Expr>,
        keywords: Vec<Keyword>,
    },

    Subscript {
        value: Box<Expr>,
        indices: Vec<SubscriptItem>,
    },

    Binary {
        left: Box<Expr>,
        op: BinaryOp,
        right: Box<Expr>,
    },

    Unary {
        op: UnaryOp,
        operand: Box<Expr>,
    },

    /// `body if test else orelse`
    IfExp {
        test: Box<Expr>,
        body: Box<Expr>,
        orelse: Box<Expr>,
    },

    List(Vec<Expr>),
    Tuple(Vec<Expr>),

    /// Grammar-level construct outside the compiled subset
    Unsupported(String),
}

#[derive(Debug, Clone)]
pub struct Keyword {
    pub name: String,
    pub value: Expr,
    pub span: Span,
}

#[derive(Debug, Clone)]
pub enum SubscriptItem {
    Index(Expr),
    Slice {
        lower: Option<Expr>,
        upper: Option<Expr>,
        step: Option<Expr>,
    },
}

/// Binary operators
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BinaryOp {
    // Arithmetic
    Add,
    Sub,
    Mul,
    Div,
    FloorDiv,
    Mod,
    Pow,
    MatMul,

    // Bitwise
    BitAnd,
    BitOr,
    BitXor,
    Shl,
    Shr,

    // Comparison
    Eq,
    NotEq,
    Lt,
    LtE,
    Gt,
    GtE,
    Is,
    IsNot,

    // Logical
    And,
    Or,
}

impl BinaryOp {
    pub fn is_comparison(&self) -> bool {
        matches!(self,
            BinaryOp::Eq | BinaryOp::NotEq | BinaryOp::Lt | BinaryOp::LtE |
            BinaryOp::Gt | BinaryOp::GtE | BinaryOp::Is | BinaryOp::IsNot
        )
    }

    pub fn is_bitwise(&self) -> bool {
        matches!(self,
            BinaryOp::BitAnd | BinaryOp::BitOr | BinaryOp::BitXor | BinaryOp::Shl | BinaryOp::Shr
        )
    }

    /// Python spelling of the operator
    pub fn symbol(&self) -> &'static str {
        match self {
            BinaryOp::Add => "+",
            BinaryOp::Sub => "-",
            BinaryOp::Mul => "*",
            BinaryOp::Div => "/",
            BinaryOp::FloorDiv => "//",
            BinaryOp::Mod => "%",
            BinaryOp::Pow => "**",
            BinaryOp::MatMul => "@",
            BinaryOp::BitAnd => "&",
            BinaryOp::BitOr => "|",
            BinaryOp::BitXor => "^",
            BinaryOp::Shl => "<<",
            BinaryOp::Shr => ">>",
            BinaryOp::Eq => "==",
            BinaryOp::NotEq => "!=",
            BinaryOp::Lt => "<",
            BinaryOp::LtE => "<=",
            BinaryOp::Gt => ">",
            BinaryOp::GtE => ">=",
            BinaryOp::Is => "is",
            BinaryOp::IsNot => "is not",
            BinaryOp::And => "and",
            BinaryOp::Or => "or",
        }
    }
}

impl fmt::Display for BinaryOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.symbol())
    }
}

/// Unary operators
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum UnaryOp {
    Neg,    // -x
    Pos,    // +x
    Not,    // not x
    Invert, // ~x
}

impl UnaryOp {
    pub fn symbol(&self) -> &'static str {
        match self {
            UnaryOp::Neg => "-",
            UnaryOp::Pos => "+",
            UnaryOp::Not => "not ",
            UnaryOp::Invert => "~",
        }
    }
}

//! Typed AST. Expressions live in one arena per module and refer to their
//! operands by [`ExprId`]; every node carries its resolved type.

use super::symbol_table::{ScopeId, SymbolId, SymbolTable};
use super::types::TypeDescriptor;
use crate::index_vec::IndexVec;
use crate::parser::{BinaryOp, PragmaFamily, Span, UnaryOp};

crate::define_id!(ExprId, "expr");
crate::define_id!(
    /// One concrete instance of a (possibly generic) function
    FuncId,
    "fn"
);

#[derive(Debug, Clone)]
pub struct TypedExpr {
    pub kind: TExprKind,
    pub ty: TypeDescriptor,
    pub span: Span,
}

/// Elementwise math functions
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MathFunc {
    Sqrt,
    Exp,
    Log,
    Sin,
    Cos,
    Tan,
    Floor,
    Ceil,
    Abs,
}

impl MathFunc {
    pub fn name(self) -> &'static str {
        match self {
            MathFunc::Sqrt => "sqrt",
            MathFunc::Exp => "exp",
            MathFunc::Log => "log",
            MathFunc::Sin => "sin",
            MathFunc::Cos => "cos",
            MathFunc::Tan => "tan",
            MathFunc::Floor => "floor",
            MathFunc::Ceil => "ceil",
            MathFunc::Abs => "abs",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reduction {
    Sum,
    Max,
    Min,
}

impl Reduction {
    pub fn name(self) -> &'static str {
        match self {
            Reduction::Sum => "sum",
            Reduction::Max => "max",
            Reduction::Min => "min",
        }
    }
}

/// Initial contents of a freshly allocated array
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Fill {
    Zeros,
    Ones,
    Empty,
    Value(ExprId),
}

#[derive(Debug, Clone, PartialEq)]
pub enum Callee {
    Local(FuncId),
    /// A function declared in an imported header; `symbol` is its link name
    External { module: String, symbol: String },
}

/// Subscript component. Slices are normalised: bounds are always present
/// and a missing step means 1.
#[derive(Debug, Clone, PartialEq)]
pub enum IndexItem {
    Scalar(ExprId),
    Slice {
        lower: ExprId,
        upper: ExprId,
        step: Option<ExprId>,
    },
}

impl IndexItem {
    pub fn is_slice(&self) -> bool {
        matches!(self, IndexItem::Slice { .. })
    }
}

#[derive(Debug, Clone)]
pub enum TExprKind {
    Int(i64),
    Float(f64),
    Complex { re: f64, im: f64 },
    Bool(bool),
    Str(String),
    Var(SymbolId),
    Binary { left: ExprId, op: BinaryOp, right: ExprId },
    Unary { op: UnaryOp, operand: ExprId },
    /// Conversion to the node's own type
    Cast(ExprId),
    Call { callee: Callee, args: Vec<ExprId> },
    Math { func: MathFunc, arg: ExprId },
    /// Scalar `min`/`max` over two or more values
    MinMax { op: Reduction, args: Vec<ExprId> },
    Reduce { op: Reduction, value: ExprId, axis: Option<usize> },
    Index { base: ExprId, indices: Vec<IndexItem> },
    /// Elements in row-major order; the node's type carries the shape
    ArrayLiteral(Vec<ExprId>),
    Alloc { fill: Fill, shape: Vec<ExprId> },
    /// Extent of `base` along `axis`
    Shape { base: ExprId, axis: usize },
    Size(ExprId),
    Tuple(Vec<ExprId>),
    Ternary { test: ExprId, body: ExprId, orelse: ExprId },
}

#[derive(Debug, Clone, PartialEq)]
pub enum LValue {
    Var(SymbolId),
    Element { base: SymbolId, indices: Vec<IndexItem> },
}

impl LValue {
    pub fn symbol(&self) -> SymbolId {
        match self {
            LValue::Var(id) | LValue::Element { base: id, .. } => *id,
        }
    }
}

/// Accelerator directive text, e.g. family OpenMp with `parallel for`
#[derive(Debug, Clone, PartialEq)]
pub struct Directive {
    pub family: PragmaFamily,
    pub text: String,
}

#[derive(Debug, Clone)]
pub struct TStmt {
    pub kind: TStmtKind,
    pub span: Span,
}

impl TStmt {
    pub fn new(kind: TStmtKind, span: Span) -> Self {
        Self { kind, span }
    }
}

#[derive(Debug, Clone)]
pub enum TStmtKind {
    Assign { target: LValue, value: ExprId },
    /// `a, b = f(x)` for a call with several results
    Unpack { targets: Vec<SymbolId>, value: ExprId },
    AugAssign { target: LValue, op: BinaryOp, value: ExprId },
    Expr(ExprId),
    If { branches: Vec<(ExprId, Vec<TStmt>)>, orelse: Vec<TStmt> },
    /// `for var in range(start, stop, step)`
    For {
        var: SymbolId,
        start: ExprId,
        stop: ExprId,
        step: ExprId,
        body: Vec<TStmt>,
        directive: Option<Directive>,
    },
    While { condition: ExprId, body: Vec<TStmt> },
    Return(Vec<ExprId>),
    Break,
    Continue,
    Pass,
    Print(Vec<ExprId>),
    Directive(Directive),
}

#[derive(Debug, Clone)]
pub struct TypedFunction {
    /// Name as written in the source
    pub name: String,
    /// Unique native name of this instance
    pub mangled: String,
    pub params: Vec<SymbolId>,
    pub results: Vec<TypeDescriptor>,
    pub body: Vec<TStmt>,
    pub scope: ScopeId,
    /// Local variables in declaration order, arguments excluded
    pub locals: Vec<SymbolId>,
    pub is_pure: bool,
    pub is_inline: bool,
    pub is_stub: bool,
    pub span: Span,
}

impl TypedFunction {
    pub fn is_exported(&self) -> bool {
        !self.is_inline
    }
}

/// An imported header module the generated code links against
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HeaderImport {
    pub module: String,
}

/// Result of semantic analysis of one source file
#[derive(Debug, Clone)]
pub struct TypedModule {
    pub name: String,
    pub exprs: IndexVec<ExprId, TypedExpr>,
    pub symbols: SymbolTable,
    pub functions: IndexVec<FuncId, TypedFunction>,
    /// Source function name to its instances, in definition order
    pub overloads: Vec<(String, Vec<FuncId>)>,
    /// Module variables in definition order
    pub globals: Vec<SymbolId>,
    pub init_body: Vec<TStmt>,
    pub headers: Vec<HeaderImport>,
    pub is_header: bool,
}

impl TypedModule {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            exprs: IndexVec::new(),
            symbols: SymbolTable::new(name),
            functions: IndexVec::new(),
            overloads: Vec::new(),
            globals: Vec::new(),
            init_body: Vec::new(),
            headers: Vec::new(),
            is_header: false,
        }
    }

    pub fn expr(&self, id: ExprId) -> &TypedExpr {
        &self.exprs[id]
    }

    pub fn ty(&self, id: ExprId) -> &TypeDescriptor {
        &self.exprs[id].ty
    }

    pub fn function(&self, id: FuncId) -> &TypedFunction {
        &self.functions[id]
    }

    pub fn instances(&self, name: &str) -> &[FuncId] {
        self.overloads
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, ids)| ids.as_slice())
            .unwrap_or(&[])
    }

    /// Exported function instances in definition order
    pub fn exported_functions(&self) -> impl Iterator<Item = (FuncId, &TypedFunction)> {
        self.overloads
            .iter()
            .flat_map(|(_, ids)| ids.iter().copied())
            .map(move |id| (id, &self.functions[id]))
            .filter(|(_, func)| func.is_exported())
    }

    /// Literal integer value of an expression, looking through unary minus
    pub fn literal_int(&self, id: ExprId) -> Option<i64> {
        match &self.exprs[id].kind {
            TExprKind::Int(value) => Some(*value),
            TExprKind::Unary { op: UnaryOp::Neg, operand } => self.literal_int(*operand).map(|v| -v),
            _ => None,
        }
    }

    /// Visit every expression reachable from a statement list, operands
    /// before the expressions using them.
    pub fn walk_stmts(&self, stmts: &[TStmt], visit: &mut dyn FnMut(ExprId)) {
        for stmt in stmts {
            self.walk_stmt(stmt, visit);
        }
    }

    fn walk_stmt(&self, stmt: &TStmt, visit: &mut dyn FnMut(ExprId)) {
        match &stmt.kind {
            TStmtKind::Assign { target, value } | TStmtKind::AugAssign { target, value, .. } => {
                if let LValue::Element { indices, .. } = target {
                    self.walk_indices(indices, visit);
                }
                self.walk_expr(*value, visit);
            }
            TStmtKind::Unpack { value, .. } | TStmtKind::Expr(value) => self.walk_expr(*value, visit),
            TStmtKind::If { branches, orelse } => {
                for (condition, body) in branches {
                    self.walk_expr(*condition, visit);
                    self.walk_stmts(body, visit);
                }
                self.walk_stmts(orelse, visit);
            }
            TStmtKind::For { start, stop, step, body, .. } => {
                self.walk_expr(*start, visit);
                self.walk_expr(*stop, visit);
                self.walk_expr(*step, visit);
                self.walk_stmts(body, visit);
            }
            TStmtKind::While { condition, body } => {
                self.walk_expr(*condition, visit);
                self.walk_stmts(body, visit);
            }
            TStmtKind::Return(values) | TStmtKind::Print(values) => {
                for value in values {
                    self.walk_expr(*value, visit);
                }
            }
            TStmtKind::Break | TStmtKind::Continue | TStmtKind::Pass | TStmtKind::Directive(_) => {}
        }
    }

    fn walk_indices(&self, indices: &[IndexItem], visit: &mut dyn FnMut(ExprId)) {
        for item in indices {
            match item {
                IndexItem::Scalar(index) => self.walk_expr(*index, visit),
                IndexItem::Slice { lower, upper, step } => {
                    self.walk_expr(*lower, visit);
                    self.walk_expr(*upper, visit);
                    if let Some(step) = step {
                        self.walk_expr(*step, visit);
                    }
                }
            }
        }
    }

    pub fn walk_expr(&self, id: ExprId, visit: &mut dyn FnMut(ExprId)) {
        match &self.exprs[id].kind {
            TExprKind::Binary { left, right, .. } => {
                self.walk_expr(*left, visit);
                self.walk_expr(*right, visit);
            }
            TExprKind::Unary { operand: inner, .. }
            | TExprKind::Cast(inner)
            | TExprKind::Math { arg: inner, .. }
            | TExprKind::Reduce { value: inner, .. }
            | TExprKind::Shape { base: inner, .. }
            | TExprKind::Size(inner) => self.walk_expr(*inner, visit),
            TExprKind::Call { args: items, .. }
            | TExprKind::MinMax { args: items, .. }
            | TExprKind::ArrayLiteral(items)
            | TExprKind::Tuple(items) => {
                for item in items {
                    self.walk_expr(*item, visit);
                }
            }
            TExprKind::Index { base, indices } => {
                self.walk_expr(*base, visit);
                self.walk_indices(indices, visit);
            }
            TExprKind::Alloc { fill, shape } => {
                if let Fill::Value(value) = fill {
                    self.walk_expr(*value, visit);
                }
                for extent in shape {
                    self.walk_expr(*extent, visit);
                }
            }
            TExprKind::Ternary { test, body, orelse } => {
                self.walk_expr(*test, visit);
                self.walk_expr(*body, visit);
                self.walk_expr(*orelse, visit);
            }
            TExprKind::Int(_)
            | TExprKind::Float(_)
            | TExprKind::Complex { .. }
            | TExprKind::Bool(_)
            | TExprKind::Str(_)
            | TExprKind::Var(_) => {}
        }
        visit(id);
    }
}

//! Python backend: prints the typed module back as annotated Python with
//! every implicit conversion made explicit. Function instances keep their
//! mangled names; module statements run at import.

use super::{Backend, Capability, FileKind, GeneratedFile, Language, NameTable};
use crate::config::Accelerators;
use crate::parser::{BinaryOp, UnaryOp};
use crate::semantic::tast::*;
use crate::semantic::{BaseKind, Dim, Order, SymbolId, SymbolRole, TypeDescriptor, TypedModule};

pub struct PythonEmitter {
    output: String,
    indent: usize,
}

impl PythonEmitter {
    pub fn new() -> Self {
        Self {
            output: String::new(),
            indent: 0,
        }
    }

    fn emit_module(&mut self, m: &TypedModule) -> String {
        let extension = if m.is_header { "pyh" } else { "py" };
        self.line(&format!("# Generated by pyaot from {}.{}. Do not edit.", m.name, extension));
        self.line("import numpy as np");
        for header in &m.headers {
            self.line(&format!("import {}", header.module));
        }

        for function in m.functions.iter() {
            self.newline();
            self.newline();
            self.emit_function(m, function);
        }

        if !m.init_body.is_empty() {
            self.newline();
            self.newline();
            self.emit_block(m, &m.init_body);
        }
        std::mem::take(&mut self.output)
    }

    fn emit_function(&mut self, m: &TypedModule, function: &TypedFunction) {
        let params: Vec<String> = function
            .params
            .iter()
            .map(|&id| {
                let symbol = m.symbols.symbol(id);
                format!("{}: '{}'", symbol.name, symbol.ty.annotation())
            })
            .collect();
        let result = match function.results.as_slice() {
            [] => String::new(),
            [single] => format!(" -> '{}'", single.annotation()),
            several => format!(" -> '{}'", TypeDescriptor::tuple(several.to_vec()).annotation()),
        };
        self.line(&format!("def {}({}){}:", function.mangled, params.join(", "), result));
        self.indent += 1;
        if function.is_stub || function.body.is_empty() {
            self.line("pass");
        } else {
            self.emit_block(m, &function.body);
        }
        self.indent -= 1;
    }

    fn emit_block(&mut self, m: &TypedModule, stmts: &[TStmt]) {
        if stmts.is_empty() {
            self.line("pass");
        }
        for stmt in stmts {
            self.emit_stmt(m, stmt);
        }
    }

    fn emit_stmt(&mut self, m: &TypedModule, stmt: &TStmt) {
        match &stmt.kind {
            TStmtKind::Assign { target, value } => {
                let target = self.lvalue(m, target);
                let value = self.expr(m, *value);
                self.line(&format!("{} = {}", target, value));
            }
            TStmtKind::Unpack { targets, value } => {
                let names: Vec<String> = targets.iter().map(|&id| var_name(m, id)).collect();
                let value = self.expr(m, *value);
                self.line(&format!("{} = {}", names.join(", "), value));
            }
            TStmtKind::AugAssign { target, op, value } => {
                let target = self.lvalue(m, target);
                let value = self.expr(m, *value);
                self.line(&format!("{} {}= {}", target, op.symbol(), value));
            }
            TStmtKind::Expr(value) => {
                let value = self.expr(m, *value);
                self.line(&value);
            }
            TStmtKind::If { branches, orelse } => {
                for (index, (condition, body)) in branches.iter().enumerate() {
                    let keyword = if index == 0 { "if" } else { "elif" };
                    let condition = self.expr(m, *condition);
                    self.line(&format!("{} {}:", keyword, condition));
                    self.indent += 1;
                    self.emit_block(m, body);
                    self.indent -= 1;
                }
                if !orelse.is_empty() {
                    self.line("else:");
                    self.indent += 1;
                    self.emit_block(m, orelse);
                    self.indent -= 1;
                }
            }
            TStmtKind::For { var, start, stop, step, body, directive } => {
                if let Some(directive) = directive {
                    self.line(&format!("#$ {} {}", directive.family, directive.text));
                }
                let stop_text = self.expr(m, *stop);
                let range = match (m.literal_int(*start), m.literal_int(*step)) {
                    (Some(0), Some(1)) => stop_text,
                    (_, Some(1)) => format!("{}, {}", self.expr(m, *start), stop_text),
                    _ => format!("{}, {}, {}", self.expr(m, *start), stop_text, self.expr(m, *step)),
                };
                self.line(&format!("for {} in range({}):", var_name(m, *var), range));
                self.indent += 1;
                self.emit_block(m, body);
                self.indent -= 1;
            }
            TStmtKind::While { condition, body } => {
                let condition = self.expr(m, *condition);
                self.line(&format!("while {}:", condition));
                self.indent += 1;
                self.emit_block(m, body);
                self.indent -= 1;
            }
            TStmtKind::Return(values) => {
                let values: Vec<String> = values.iter().map(|&v| self.expr(m, v)).collect();
                if values.is_empty() {
                    self.line("return");
                } else {
                    self.line(&format!("return {}", values.join(", ")));
                }
            }
            TStmtKind::Break => self.line("break"),
            TStmtKind::Continue => self.line("continue"),
            TStmtKind::Pass => self.line("pass"),
            TStmtKind::Print(values) => {
                let values: Vec<String> = values.iter().map(|&v| self.expr(m, v)).collect();
                self.line(&format!("print({})", values.join(", ")));
            }
            TStmtKind::Directive(directive) => {
                self.line(&format!("#$ {} {}", directive.family, directive.text));
            }
        }
    }

    fn lvalue(&mut self, m: &TypedModule, target: &LValue) -> String {
        match target {
            LValue::Var(id) => var_name(m, *id),
            LValue::Element { base, indices } => {
                let subscripts = self.subscripts(m, indices);
                format!("{}[{}]", var_name(m, *base), subscripts)
            }
        }
    }

    fn subscripts(&mut self, m: &TypedModule, indices: &[IndexItem]) -> String {
        let mut parts = Vec::with_capacity(indices.len());
        for (axis, item) in indices.iter().enumerate() {
            let part = match item {
                IndexItem::Scalar(index) => self.expr(m, *index),
                IndexItem::Slice { lower, upper, step } => {
                    let lower = match m.literal_int(*lower) {
                        Some(0) => String::new(),
                        _ => self.expr(m, *lower),
                    };
                    let upper = match m.expr(*upper).kind {
                        TExprKind::Shape { axis: a, .. } if a == axis => String::new(),
                        _ => self.expr(m, *upper),
                    };
                    match step {
                        Some(step) => format!("{}:{}:{}", lower, upper, self.expr(m, *step)),
                        None => format!("{}:{}", lower, upper),
                    }
                }
            };
            parts.push(part);
        }
        parts.join(", ")
    }

    fn expr(&mut self, m: &TypedModule, id: ExprId) -> String {
        let node = m.expr(id);
        match &node.kind {
            TExprKind::Int(value) => value.to_string(),
            TExprKind::Float(value) => float_literal(*value),
            TExprKind::Complex { re, im } => format!("complex({}, {})", float_literal(*re), float_literal(*im)),
            TExprKind::Bool(value) => if *value { "True" } else { "False" }.to_string(),
            TExprKind::Str(text) => format!("'{}'", text.replace('\\', "\\\\").replace('\'', "\\'").replace('\n', "\\n")),
            TExprKind::Var(symbol) => var_name(m, *symbol),
            TExprKind::Binary { left, op, right } => {
                let left = self.expr(m, *left);
                let right = self.expr(m, *right);
                format!("({} {} {})", left, op.symbol(), right)
            }
            TExprKind::Unary { op, operand } => {
                let operand = self.expr(m, *operand);
                match op {
                    UnaryOp::Not => format!("(not {})", operand),
                    other => format!("({}{})", other.symbol(), operand),
                }
            }
            TExprKind::Cast(inner) => {
                let text = self.expr(m, *inner);
                if node.ty.is_array() {
                    format!("{}.astype({})", text, numpy_dtype(&node.ty))
                } else {
                    scalar_cast(&text, &node.ty)
                }
            }
            TExprKind::Call { callee, args } => {
                let args: Vec<String> = args.iter().map(|&a| self.expr(m, a)).collect();
                let name = match callee {
                    Callee::Local(fid) => m.function(*fid).mangled.clone(),
                    Callee::External { module, symbol } => format!("{}.{}", module, symbol),
                };
                format!("{}({})", name, args.join(", "))
            }
            TExprKind::Math { func, arg } => {
                let arg = self.expr(m, *arg);
                format!("np.{}({})", func.name(), arg)
            }
            TExprKind::MinMax { op, args } => {
                let args: Vec<String> = args.iter().map(|&a| self.expr(m, a)).collect();
                format!("{}({})", op.name(), args.join(", "))
            }
            TExprKind::Reduce { op, value, axis } => {
                let value = self.expr(m, *value);
                match axis {
                    Some(axis) => format!("np.{}({}, axis={})", op.name(), value, axis),
                    None => format!("np.{}({})", op.name(), value),
                }
            }
            TExprKind::Index { base, indices } => {
                let base = self.expr(m, *base);
                let subscripts = self.subscripts(m, indices);
                format!("{}[{}]", base, subscripts)
            }
            TExprKind::ArrayLiteral(items) => {
                let values: Vec<String> = items.iter().map(|&i| self.expr(m, i)).collect();
                let extents: Vec<usize> = node
                    .ty
                    .shape
                    .iter()
                    .map(|d| match d {
                        Dim::Known(n) => *n as usize,
                        Dim::Unknown => values.len(),
                    })
                    .collect();
                format!(
                    "np.array({}, dtype={}{})",
                    nested(&values, &extents),
                    numpy_dtype(&node.ty),
                    order_argument(&node.ty)
                )
            }
            TExprKind::Alloc { fill, shape } => {
                let extents: Vec<String> = shape.iter().map(|&e| self.expr(m, e)).collect();
                let shape = if extents.len() == 1 {
                    extents[0].clone()
                } else {
                    format!("({})", extents.join(", "))
                };
                let dtype = numpy_dtype(&node.ty);
                let order = order_argument(&node.ty);
                match fill {
                    Fill::Zeros => format!("np.zeros({}, dtype={}{})", shape, dtype, order),
                    Fill::Ones => format!("np.ones({}, dtype={}{})", shape, dtype, order),
                    Fill::Empty => format!("np.empty({}, dtype={}{})", shape, dtype, order),
                    Fill::Value(value) => {
                        let value = self.expr(m, *value);
                        format!("np.full({}, {}, dtype={}{})", shape, value, dtype, order)
                    }
                }
            }
            TExprKind::Shape { base, axis } => format!("{}.shape[{}]", self.expr(m, *base), axis),
            TExprKind::Size(base) => format!("{}.size", self.expr(m, *base)),
            TExprKind::Tuple(items) => {
                let items: Vec<String> = items.iter().map(|&i| self.expr(m, i)).collect();
                format!("({},)", items.join(", "))
            }
            TExprKind::Ternary { test, body, orelse } => {
                let test = self.expr(m, *test);
                let body = self.expr(m, *body);
                let orelse = self.expr(m, *orelse);
                format!("({} if {} else {})", body, test, orelse)
            }
        }
    }

    fn line(&mut self, s: &str) {
        for _ in 0..self.indent {
            self.output.push_str("    ");
        }
        self.output.push_str(s);
        self.newline();
    }

    fn newline(&mut self) {
        self.output.push('\n');
    }
}

impl Default for PythonEmitter {
    fn default() -> Self {
        Self::new()
    }
}

impl Backend for PythonEmitter {
    fn language(&self) -> Language {
        Language::Python
    }

    fn supports(&self, _capability: Capability) -> bool {
        true
    }

    fn emit(&mut self, module: &TypedModule, _names: &NameTable, _accelerators: Accelerators) -> Vec<GeneratedFile> {
        self.output.clear();
        self.indent = 0;
        vec![GeneratedFile {
            name: format!("{}.py", module.name),
            kind: FileKind::Source,
            contents: self.emit_module(module),
        }]
    }
}

fn var_name(m: &TypedModule, id: SymbolId) -> String {
    let symbol = m.symbols.symbol(id);
    match &symbol.role {
        SymbolRole::Imported { module, name } => format!("{}.{}", module, name),
        _ => symbol.name.clone(),
    }
}

fn numpy_dtype(ty: &TypeDescriptor) -> String {
    match ty.dtype() {
        Some(dtype) => format!("np.{}", dtype.name()),
        None => "object".to_string(),
    }
}

fn order_argument(ty: &TypeDescriptor) -> &'static str {
    if ty.rank > 1 && ty.order == Order::F {
        ", order='F'"
    } else {
        ""
    }
}

fn scalar_cast(text: &str, ty: &TypeDescriptor) -> String {
    let builtin = match ty.kind {
        BaseKind::Bool => "bool",
        BaseKind::Int => "int",
        BaseKind::Float => "float",
        BaseKind::Complex => "complex",
        _ => return text.to_string(),
    };
    if ty.precision == ty.kind.default_precision() || ty.kind == BaseKind::Bool {
        format!("{}({})", builtin, text)
    } else {
        format!("{}({})", numpy_dtype(ty), text)
    }
}

/// Row-major values regrouped into nested lists
fn nested(values: &[String], extents: &[usize]) -> String {
    match extents {
        [] | [_] => format!("[{}]", values.join(", ")),
        [first, rest @ ..] => {
            let stride = values.len() / (*first).max(1);
            let rows: Vec<String> = values
                .chunks(stride.max(1))
                .map(|row| nested(row, rest))
                .collect();
            format!("[{}]", rows.join(", "))
        }
    }
}

fn float_literal(value: f64) -> String {
    if value.is_nan() {
        "np.nan".to_string()
    } else if value.is_infinite() {
        if value > 0.0 { "np.inf" } else { "(-np.inf)" }.to_string()
    } else {
        format!("{:?}", value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::diagnostics::DiagnosticReporter;
    use crate::parser::parse_source;
    use crate::semantic::{analyze, SearchPathResolver};

    fn emit(source: &str) -> String {
        let mut reporter = DiagnosticReporter::new("m.py", source);
        let ast = parse_source(source, &mut reporter);
        let mut resolver = SearchPathResolver::new(Vec::new());
        let module = analyze(&ast, "m", false, &mut resolver, &mut reporter)
            .unwrap_or_else(|| panic!("{:?}", reporter.diagnostics()));
        let names = NameTable::new(&module, Language::Python);
        PythonEmitter::new().emit(&module, &names, Accelerators::default()).remove(0).contents
    }

    #[test]
    fn conversions_are_spelled_out() {
        let py = emit("\
def mean(a: int, b: int) -> float:
    return (a + b) / 2
");
        assert!(py.contains("def mean(a: 'int64', b: 'int64') -> 'float64':"), "{}", py);
        assert!(py.contains("float("), "{}", py);
    }

    #[test]
    fn instances_keep_mangled_names() {
        let py = emit("\
def twice(x: 'int | float'):
    return x + x
");
        assert!(py.contains("def twice__0(x: 'int64') -> 'int64':"), "{}", py);
        assert!(py.contains("def twice__1(x: 'float64') -> 'float64':"), "{}", py);
    }

    #[test]
    fn arrays_use_numpy() {
        let py = emit("\
import numpy as np

def f(n: int) -> float:
    a = np.zeros((n, 3), order='F')
    b = np.array([[1, 2], [3, 4]])
    return np.sum(a) + np.sum(b[0, :]) * 1.0
");
        assert!(py.contains("a = np.zeros((n, 3), dtype=np.float64, order='F')"), "{}", py);
        assert!(py.contains("b = np.array([[1, 2], [3, 4]], dtype=np.int64)"), "{}", py);
        assert!(py.contains("b[0, :]"), "{}", py);
    }

    #[test]
    fn directives_survive_as_comments() {
        let py = emit("\
def scale(a: 'float[:]', k: float):
    #$ omp parallel for
    for i in range(len(a)):
        a[i] = a[i] * k
");
        assert!(py.contains("    #$ omp parallel for\n    for i in range(a.shape[0]):"), "{}", py);
    }

    #[test]
    fn module_statements_follow_functions() {
        let py = emit("\
def f(x: int) -> int:
    return x + 1

y = f(2)
print(y)
");
        let def = py.find("def f").unwrap();
        let assign = py.find("y = f(2)").unwrap();
        assert!(def < assign);
        assert!(py.ends_with("print(y)\n"));
    }
}

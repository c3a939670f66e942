//! C backend: one `.c` translation unit plus a `.h` with the prototypes
//! and module variables.
//!
//! Arrays are passed as a data pointer followed by one `int64_t` extent per
//! dimension (`a`, `a_shape0`, ...). Array locals are heap allocated and
//! released on every return path. Whole-array expressions are evaluated
//! element by element over the flat storage of their operands.

use super::{active_directive, loop_directive, Backend, Capability, FileKind, GeneratedFile, Language, NameTable};
use crate::config::Accelerators;
use crate::parser::{BinaryOp, PragmaFamily, UnaryOp};
use crate::semantic::tast::*;
use crate::semantic::{BaseKind, Dim, Dtype, Order, SymbolId, TypeDescriptor, TypedModule};
use std::collections::BTreeMap;

/// Emits C code from a typed module
pub struct CEmitter {
    output: String,
    indent: usize,
    accelerators: Accelerators,
    /// Support routines used by the module, by name
    helpers: BTreeMap<String, String>,
    /// Array locals of the function being emitted
    owned_arrays: Vec<SymbolId>,
    /// Results of the function being emitted
    results: Vec<TypeDescriptor>,
    names: NameTable,
    /// Range loops enclosing the statement being emitted
    loop_depth: usize,
    /// Outlined reductions of array expressions
    kernels: Vec<String>,
}

/// An array expression evaluated at flat index `pyaot_k`. Array operands
/// are bound to `pyaot_a<i>` and scalar operands are evaluated once into
/// `pyaot_s<j>`.
#[derive(Debug, Default)]
struct Kernel {
    element: String,
    arrays: Vec<ArrayOperand>,
    scalars: Vec<(String, &'static str)>,
    /// Extents of the result; `None` until an operand fixes them
    extents: Option<Vec<Extent>>,
}

#[derive(Debug)]
struct ArrayOperand {
    data: String,
    shape: Vec<String>,
    ty: &'static str,
}

#[derive(Debug, Clone)]
struct Extent {
    /// Spelled with the kernel's operand names
    bound: String,
    /// Spelled with the caller's names
    source: String,
}

impl Kernel {
    fn extents(&self) -> &[Extent] {
        self.extents.as_deref().unwrap_or_default()
    }

    fn count(&self) -> String {
        let bounds: Vec<&str> = self.extents().iter().map(|e| e.bound.as_str()).collect();
        match bounds.as_slice() {
            [] => "1".to_string(),
            [single] => single.to_string(),
            several => format!("({})", several.join(" * ")),
        }
    }
}

impl CEmitter {
    pub fn new() -> Self {
        Self {
            output: String::new(),
            indent: 0,
            accelerators: Accelerators::default(),
            helpers: BTreeMap::new(),
            owned_arrays: Vec::new(),
            results: Vec::new(),
            names: NameTable::default(),
            loop_depth: 0,
            kernels: Vec::new(),
        }
    }

    fn emit_source(&mut self, m: &TypedModule) -> String {
        for &id in &m.globals {
            self.emit_global(m, id);
        }
        if !m.globals.is_empty() {
            self.newline();
        }

        let inline: Vec<_> = m.functions.iter().filter(|f| f.is_inline && !f.is_stub).collect();
        for function in &inline {
            self.writeln(&format!("{};", self.signature(m, function)));
        }
        if !inline.is_empty() {
            self.newline();
        }

        for function in m.functions.iter().filter(|f| !f.is_stub) {
            self.emit_function(m, function);
            self.newline();
        }

        self.writeln(&format!("void {}(void)", self.names.init()));
        self.writeln("{");
        self.indent += 1;
        self.owned_arrays.clear();
        self.results.clear();
        self.emit_block(m, &m.init_body);
        self.indent -= 1;
        self.writeln("}");

        let body = std::mem::take(&mut self.output);
        self.writeln(&format!("/* Generated by pyaot from {}.py. Do not edit. */", m.name));
        self.newline();
        for include in ["stdint.h", "stdbool.h", "stdlib.h", "stdio.h", "string.h", "math.h", "complex.h"] {
            self.writeln(&format!("#include <{}>", include));
        }
        self.writeln(&format!("#include \"{}.h\"", m.name));
        for header in &m.headers {
            self.writeln(&format!("#include \"{}.h\"", header.module));
        }
        self.newline();
        let helpers = std::mem::take(&mut self.helpers);
        for code in helpers.values() {
            self.write(code);
            self.newline();
        }
        for code in std::mem::take(&mut self.kernels) {
            self.write(&code);
            self.newline();
        }
        self.write(&body);
        std::mem::take(&mut self.output)
    }

    fn emit_header(&mut self, m: &TypedModule) -> String {
        let guard = format!("PYAOT_{}_H", m.name.to_ascii_uppercase().replace('.', "_"));
        self.writeln(&format!("/* Generated by pyaot from {}.py. Do not edit. */", m.name));
        self.writeln(&format!("#ifndef {}", guard));
        self.writeln(&format!("#define {}", guard));
        self.newline();
        self.writeln("#include <stdint.h>");
        self.writeln("#include <stdbool.h>");
        self.writeln("#include <complex.h>");
        self.newline();

        for &id in &m.globals {
            let symbol = m.symbols.symbol(id);
            let name = self.names.symbol(m, id);
            let ty = c_type(&symbol.ty);
            if symbol.ty.is_array() {
                self.writeln(&format!("extern {} *{};", ty, name));
                for axis in 0..symbol.ty.rank {
                    self.writeln(&format!("extern int64_t {}_shape{};", name, axis));
                }
            } else {
                self.writeln(&format!("extern {} {};", ty, name));
            }
        }
        for function in m.functions.iter().filter(|f| !f.is_inline) {
            self.writeln(&format!("{};", self.signature(m, function)));
        }
        if !m.is_header {
            self.writeln(&format!("void {}(void);", self.names.init()));
        }
        self.newline();
        self.writeln(&format!("#endif /* {} */", guard));
        std::mem::take(&mut self.output)
    }

    fn emit_global(&mut self, m: &TypedModule, id: SymbolId) {
        let symbol = m.symbols.symbol(id);
        let name = self.names.symbol(m, id);
        let ty = c_type(&symbol.ty);
        if symbol.ty.is_array() {
            self.writeln(&format!("{} *{} = NULL;", ty, name));
            for axis in 0..symbol.ty.rank {
                self.writeln(&format!("int64_t {}_shape{} = 0;", name, axis));
            }
        } else {
            self.writeln(&format!("{} {};", ty, name));
        }
    }

    fn signature(&self, m: &TypedModule, function: &TypedFunction) -> String {
        let mut params = Vec::new();
        for &id in &function.params {
            let symbol = m.symbols.symbol(id);
            let name = self.names.symbol(m, id);
            if symbol.ty.is_array() {
                params.push(format!("{} *{}", c_type(&symbol.ty), name));
                for axis in 0..symbol.ty.rank {
                    params.push(format!("int64_t {}_shape{}", name, axis));
                }
            } else {
                params.push(format!("{} {}", c_type(&symbol.ty), name));
            }
        }
        let returns = match function.results.as_slice() {
            [single] => c_type(single),
            results => {
                if results.len() > 1 {
                    for (k, result) in results.iter().enumerate() {
                        params.push(format!("{} *pyaot_out{}", c_type(result), k));
                    }
                }
                "void"
            }
        };
        let params = if params.is_empty() {
            "void".to_string()
        } else {
            params.join(", ")
        };
        let storage = if function.is_inline { "static inline " } else { "" };
        format!("{}{} {}({})", storage, returns, self.names.function(&function.mangled), params)
    }

    fn emit_function(&mut self, m: &TypedModule, function: &TypedFunction) {
        self.writeln(&self.signature(m, function));
        self.writeln("{");
        self.indent += 1;

        self.owned_arrays.clear();
        self.results = function.results.clone();
        for &id in &function.locals {
            let symbol = m.symbols.symbol(id);
            let name = self.names.symbol(m, id);
            let ty = c_type(&symbol.ty);
            if symbol.ty.is_array() {
                self.line(&format!("{} *{} = NULL;", ty, name));
                for axis in 0..symbol.ty.rank {
                    self.line(&format!("int64_t {}_shape{} = 0;", name, axis));
                }
                self.owned_arrays.push(id);
            } else {
                self.line(&format!("{} {};", ty, name));
            }
        }
        if !function.locals.is_empty() {
            self.newline();
        }

        self.emit_block(m, &function.body);
        let returns_last = matches!(function.body.last().map(|s| &s.kind), Some(TStmtKind::Return(_)));
        if !returns_last {
            self.release_arrays(m);
        }
        self.indent -= 1;
        self.writeln("}");
    }

    fn release_arrays(&mut self, m: &TypedModule) {
        for id in self.owned_arrays.clone() {
            let name = self.names.symbol(m, id);
            self.line(&format!("free({});", name));
        }
    }

    fn emit_block(&mut self, m: &TypedModule, stmts: &[TStmt]) {
        for stmt in stmts {
            self.emit_stmt(m, stmt);
        }
    }

    fn emit_stmt(&mut self, m: &TypedModule, stmt: &TStmt) {
        match &stmt.kind {
            TStmtKind::Assign { target, value } => self.emit_assign(m, target, *value),
            TStmtKind::Unpack { targets, value } => {
                let outs: Vec<String> = targets
                    .iter()
                    .map(|&id| format!("&{}", self.names.symbol(m, id)))
                    .collect();
                match &m.expr(*value).kind {
                    TExprKind::Call { callee, args } => {
                        let call = self.call(m, callee, args, &outs);
                        self.line(&format!("{};", call));
                    }
                    TExprKind::Tuple(items) => {
                        for (&id, &item) in targets.iter().zip(items) {
                            let value = self.expr(m, item);
                            let name = self.names.symbol(m, id);
                            self.line(&format!("{} = {};", name, value));
                        }
                    }
                    _ => {}
                }
            }
            TStmtKind::AugAssign { target: LValue::Var(id), op, value } if m.symbols.symbol(*id).ty.is_array() => {
                self.emit_array_update(m, *id, *op, *value);
            }
            TStmtKind::AugAssign { target, op, value } => {
                let slot = self.lvalue(m, target);
                let element = m.symbols.symbol(target.symbol()).ty.element();
                let value = self.expr(m, *value);
                match compound_operator(*op, &element) {
                    Some(operator) => self.line(&format!("{} {}= {};", slot, operator, value)),
                    None => {
                        let combined = self.binary_text(*op, slot.clone(), value, &element);
                        self.line(&format!("{} = {};", slot, combined));
                    }
                }
            }
            TStmtKind::Expr(value) if m.ty(*value).is_array() && !matches!(m.expr(*value).kind, TExprKind::Call { .. }) => {
                // Only the scalar operands can have effects
                let kernel = self.kernel(m, *value);
                self.open_kernel(&kernel);
                self.close_block();
            }
            TStmtKind::Expr(value) => {
                let value = self.expr(m, *value);
                self.line(&format!("{};", value));
            }
            TStmtKind::If { branches, orelse } => {
                for (index, (condition, body)) in branches.iter().enumerate() {
                    let condition = self.expr(m, *condition);
                    if index == 0 {
                        self.line(&format!("if ({}) {{", condition));
                    } else {
                        self.line(&format!("}} else if ({}) {{", condition));
                    }
                    self.indent += 1;
                    self.emit_block(m, body);
                    self.indent -= 1;
                }
                if !orelse.is_empty() {
                    self.line("} else {");
                    self.indent += 1;
                    self.emit_block(m, orelse);
                    self.indent -= 1;
                }
                self.line("}");
            }
            TStmtKind::For { var, start, stop, step, body, directive } => {
                self.emit_for(m, *var, *start, *stop, *step, body, directive.as_ref());
            }
            TStmtKind::While { condition, body } => {
                let condition = self.expr(m, *condition);
                self.line(&format!("while ({}) {{", condition));
                self.indent += 1;
                self.emit_block(m, body);
                self.indent -= 1;
                self.line("}");
            }
            TStmtKind::Return(values) => self.emit_return(m, values),
            TStmtKind::Break => self.line("break;"),
            TStmtKind::Continue => self.line("continue;"),
            TStmtKind::Pass => {}
            TStmtKind::Print(values) => self.emit_print(m, values),
            TStmtKind::Directive(directive) => self.emit_directive(directive),
        }
    }

    fn emit_assign(&mut self, m: &TypedModule, target: &LValue, value: ExprId) {
        let id = target.symbol();
        let ty = m.symbols.symbol(id).ty.clone();
        if let (LValue::Var(_), true) = (target, ty.is_array()) {
            let name = self.names.symbol(m, id);
            match &m.expr(value).kind {
                TExprKind::Alloc { fill, shape } => self.emit_alloc(m, &name, &ty, *fill, shape),
                TExprKind::ArrayLiteral(items) => {
                    let shape = m.ty(value).shape.clone();
                    self.emit_literal(m, &name, &ty, items, &shape);
                }
                _ => self.emit_array_store(m, &name, &ty, value),
            }
            return;
        }
        let slot = self.lvalue(m, target);
        let value = self.expr(m, value);
        self.line(&format!("{} = {};", slot, value));
    }

    fn emit_alloc(&mut self, m: &TypedModule, name: &str, ty: &TypeDescriptor, fill: Fill, shape: &[ExprId]) {
        let element = c_type(ty);
        self.line("{");
        self.indent += 1;
        let mut extents = Vec::with_capacity(shape.len());
        for (axis, &extent) in shape.iter().enumerate() {
            let value = self.expr(m, extent);
            self.line(&format!("const int64_t pyaot_n{} = {};", axis, value));
            extents.push(format!("pyaot_n{}", axis));
        }
        let count = extents.join(" * ");
        if let Fill::Value(value) = fill {
            let value = self.expr(m, value);
            self.line(&format!("const {} pyaot_fill = {};", element, value));
        }
        self.line(&format!("free({});", name));
        match fill {
            Fill::Zeros => self.line(&format!(
                "{} = ({} *)calloc((size_t)({}), sizeof({}));",
                name, element, count, element
            )),
            _ => self.line(&format!(
                "{} = ({} *)malloc(sizeof({}) * (size_t)({}));",
                name, element, element, count
            )),
        }
        for (axis, extent) in extents.iter().enumerate() {
            self.line(&format!("{}_shape{} = {};", name, axis, extent));
        }
        let initial = match fill {
            Fill::Ones => Some("1".to_string()),
            Fill::Value(_) => Some("pyaot_fill".to_string()),
            Fill::Zeros | Fill::Empty => None,
        };
        if let Some(initial) = initial {
            self.line(&format!("for (int64_t pyaot_k = 0; pyaot_k < {}; pyaot_k++) {{", count));
            self.line(&format!("    {}[pyaot_k] = {};", name, initial));
            self.line("}");
        }
        self.indent -= 1;
        self.line("}");
    }

    fn emit_literal(&mut self, m: &TypedModule, name: &str, ty: &TypeDescriptor, items: &[ExprId], shape: &[Dim]) {
        let element = c_type(ty);
        let extents = known_extents(shape);
        let mut values = Vec::with_capacity(items.len());
        for position in storage_order(&extents, ty.order) {
            if let Some(&item) = items.get(position) {
                values.push(self.expr(m, item));
            }
        }

        self.line("{");
        self.indent += 1;
        self.line(&format!("{} pyaot_items[{}] = {{{}}};", element, values.len(), values.join(", ")));
        self.line(&format!("free({});", name));
        self.line(&format!("{} = ({} *)malloc(sizeof pyaot_items);", name, element));
        self.line(&format!("memcpy({}, pyaot_items, sizeof pyaot_items);", name));
        for (axis, extent) in extents.iter().enumerate() {
            self.line(&format!("{}_shape{} = {};", name, axis, extent));
        }
        self.indent -= 1;
        self.line("}");
    }

    /// Range loops run on a hidden counter; the loop variable is assigned
    /// from it at the top of each iteration, so the body may rebind it and
    /// it keeps the last value after the loop.
    #[allow(clippy::too_many_arguments)]
    fn emit_for(
        &mut self,
        m: &TypedModule,
        var: SymbolId,
        start: ExprId,
        stop: ExprId,
        step: ExprId,
        body: &[TStmt],
        directive: Option<&Directive>,
    ) {
        let name = self.names.symbol(m, var);
        let counter = format!("pyaot_i{}", self.loop_depth);
        let start = self.expr(m, start);
        let invariant = matches!(
            m.expr(stop).kind,
            TExprKind::Int(_) | TExprKind::Var(_) | TExprKind::Shape { .. } | TExprKind::Size(_)
        );
        let stop_text = self.expr(m, stop);
        let scoped = !invariant;
        let bound = if scoped {
            self.line("{");
            self.indent += 1;
            let stop = format!("pyaot_stop{}", self.loop_depth);
            self.line(&format!("const int64_t {} = {};", stop, stop_text));
            stop
        } else {
            stop_text
        };

        let literal_step = m.literal_int(step);
        let step_text = self.expr(m, step);
        let test = match literal_step {
            Some(s) if s > 0 => format!("{} < {}", counter, bound),
            Some(_) => format!("{} > {}", counter, bound),
            None => format!(
                "({step} > 0 ? {i} < {bound} : {i} > {bound})",
                step = step_text,
                i = counter,
                bound = bound
            ),
        };
        let update = match literal_step {
            Some(1) => format!("{}++", counter),
            Some(-1) => format!("{}--", counter),
            _ => format!("{} += {}", counter, step_text),
        };

        if let Some(directive) = directive {
            if let Some(text) = loop_directive(directive, self.accelerators, &name) {
                self.line(&format!("#pragma {} {}", pragma_prefix(directive.family), text));
            }
        }
        self.line(&format!("for (int64_t {} = {}; {}; {}) {{", counter, start, test, update));
        self.indent += 1;
        self.line(&format!("{} = {};", name, counter));
        self.loop_depth += 1;
        self.emit_block(m, body);
        self.loop_depth -= 1;
        self.indent -= 1;
        self.line("}");
        if scoped {
            self.indent -= 1;
            self.line("}");
        }
    }

    /// Region directives open a block closed by the matching `end` directive
    fn emit_directive(&mut self, directive: &Directive) {
        let Some(text) = active_directive(directive, self.accelerators) else {
            return;
        };
        let first = text.split_whitespace().next().unwrap_or_default();
        if first == "end" {
            self.indent = self.indent.saturating_sub(1);
            self.line("}");
            return;
        }
        self.line(&format!("#pragma {} {}", pragma_prefix(directive.family), text));
        if !is_standalone_directive(first) {
            self.line("{");
            self.indent += 1;
        }
    }

    fn emit_return(&mut self, m: &TypedModule, values: &[ExprId]) {
        let results = self.results.clone();
        match (values, results.as_slice()) {
            ([], _) => {
                self.release_arrays(m);
                self.line("return;");
            }
            ([value], [result]) => {
                let text = self.expr(m, *value);
                if self.owned_arrays.is_empty() {
                    self.line(&format!("return {};", text));
                } else {
                    self.line("{");
                    self.indent += 1;
                    self.line(&format!("const {} pyaot_result = {};", c_type(result), text));
                    self.release_arrays(m);
                    self.line("return pyaot_result;");
                    self.indent -= 1;
                    self.line("}");
                }
            }
            ([value], _) if results.len() > 1 => {
                // Forwarding another function's results
                let outs: Vec<String> = (0..results.len()).map(|k| format!("pyaot_out{}", k)).collect();
                if let TExprKind::Call { callee, args } = &m.expr(*value).kind {
                    let call = self.call(m, callee, args, &outs);
                    self.line(&format!("{};", call));
                }
                self.release_arrays(m);
                self.line("return;");
            }
            _ => {
                for (k, value) in values.iter().enumerate() {
                    let text = self.expr(m, *value);
                    self.line(&format!("*pyaot_out{} = {};", k, text));
                }
                self.release_arrays(m);
                self.line("return;");
            }
        }
    }

    fn emit_print(&mut self, m: &TypedModule, values: &[ExprId]) {
        for (index, &value) in values.iter().enumerate() {
            if index > 0 {
                self.line("printf(\" \");");
            }
            let ty = m.ty(value).clone();
            if ty.is_array() && !matches!(m.expr(value).kind, TExprKind::Var(_)) {
                let kernel = self.kernel(m, value);
                self.open_kernel(&kernel);
                self.fill_temporary(&kernel, &ty);
                for axis in 0..ty.rank {
                    self.line(&format!("const int64_t pyaot_tmp_shape{} = pyaot_n{};", axis, axis));
                }
                self.print_array("pyaot_tmp", &ty, 0, &mut Vec::new());
                self.line("free(pyaot_tmp);");
                self.close_block();
            } else if ty.is_array() {
                let name = self.expr(m, value);
                self.print_array(&name, &ty, 0, &mut Vec::new());
            } else {
                let text = self.expr(m, value);
                self.print_scalar(&text, &ty);
            }
        }
        self.line("printf(\"\\n\");");
    }

    fn print_scalar(&mut self, text: &str, ty: &TypeDescriptor) {
        match ty.kind {
            BaseKind::Bool => self.line(&format!("printf(\"%s\", ({}) ? \"True\" : \"False\");", text)),
            BaseKind::Int => self.line(&format!("printf(\"%lld\", (long long)({}));", text)),
            BaseKind::Float => {
                self.require_print_helpers();
                self.line(&format!("pyaot_print_float((double)({}));", text));
            }
            BaseKind::Complex => {
                self.require_print_helpers();
                self.line(&format!("pyaot_print_complex((double complex)({}));", text));
            }
            _ => self.line(&format!("printf(\"%s\", {});", text)),
        }
    }

    /// Nested loops printing `[[a b] [c d]]`
    fn print_array(&mut self, name: &str, ty: &TypeDescriptor, axis: usize, indices: &mut Vec<String>) {
        if axis == ty.rank {
            let element = format!("{}[{}]", name, offset(name, ty.order, indices));
            self.print_scalar(&element, &ty.element());
            return;
        }
        let index = format!("pyaot_p{}", axis);
        self.line("printf(\"[\");");
        self.line(&format!(
            "for (int64_t {i} = 0; {i} < {name}_shape{axis}; {i}++) {{",
            i = index,
            name = name,
            axis = axis
        ));
        self.indent += 1;
        self.line(&format!("if ({} > 0) printf(\" \");", index));
        indices.push(index);
        self.print_array(name, ty, axis + 1, indices);
        indices.pop();
        self.indent -= 1;
        self.line("}");
        self.line("printf(\"]\");");
    }

    fn lvalue(&mut self, m: &TypedModule, target: &LValue) -> String {
        match target {
            LValue::Var(id) => self.names.symbol(m, *id),
            LValue::Element { base, indices } => {
                let name = self.names.symbol(m, *base);
                let order = m.symbols.symbol(*base).ty.order;
                let indices = self.scalar_indices(m, indices);
                format!("{}[{}]", name, offset(&name, order, &indices))
            }
        }
    }

    fn scalar_indices(&mut self, m: &TypedModule, indices: &[IndexItem]) -> Vec<String> {
        indices
            .iter()
            .map(|item| match item {
                IndexItem::Scalar(index) | IndexItem::Slice { lower: index, .. } => self.expr(m, *index),
            })
            .collect()
    }

    // ----- expressions -----

    fn expr(&mut self, m: &TypedModule, id: ExprId) -> String {
        let node = m.expr(id);
        match &node.kind {
            TExprKind::Int(value) => int_literal(*value),
            TExprKind::Float(value) => float_literal(*value),
            TExprKind::Complex { re, im } => format!("({} + {} * I)", float_literal(*re), float_literal(*im)),
            TExprKind::Bool(value) => if *value { "true" } else { "false" }.to_string(),
            TExprKind::Str(text) => format!("\"{}\"", escape_string(text)),
            TExprKind::Var(symbol) => self.names.symbol(m, *symbol),
            TExprKind::Binary { left, op, right } => {
                let operand = m.ty(*left).element();
                let left = self.expr(m, *left);
                let right = self.expr(m, *right);
                self.binary_text(*op, left, right, &operand)
            }
            TExprKind::Unary { op, operand } => {
                let operand = self.expr(m, *operand);
                format!("({}{})", unary_operator(*op), operand)
            }
            TExprKind::Cast(inner) => {
                let text = self.expr(m, *inner);
                cast_text(&text, &node.ty)
            }
            TExprKind::Call { callee, args } => self.call(m, callee, args, &[]),
            TExprKind::Math { func, arg } => {
                let arg_ty = m.ty(*arg).element();
                let arg = self.expr(m, *arg);
                format!("{}({})", math_function(*func, &arg_ty), arg)
            }
            TExprKind::MinMax { op, args } => {
                let function = self.min_max_function(*op, &node.ty);
                let mut texts: Vec<String> = args.iter().map(|&a| self.expr(m, a)).collect();
                let mut combined = texts.pop().unwrap_or_default();
                while let Some(next) = texts.pop() {
                    combined = format!("{}({}, {})", function, next, combined);
                }
                combined
            }
            TExprKind::Reduce { op, value, .. } if !is_variable(m, *value) => {
                self.reduction_kernel(m, *op, *value, &node.ty)
            }
            TExprKind::Reduce { op, value, .. } => {
                let array = m.ty(*value).clone();
                let name = self.expr(m, *value);
                let function = self.reduction_helper(*op, &array, &node.ty);
                format!("{}({}, {})", function, name, size(&name, array.rank))
            }
            TExprKind::Index { base, indices } => {
                let order = m.ty(*base).order;
                let name = self.expr(m, *base);
                let indices = self.scalar_indices(m, indices);
                format!("{}[{}]", name, offset(&name, order, &indices))
            }
            TExprKind::Shape { base, axis } if !is_variable(m, *base) => {
                let kernel = self.kernel(m, *base);
                kernel
                    .extents()
                    .get(*axis)
                    .map(|e| e.source.clone())
                    .unwrap_or_else(|| "0".to_string())
            }
            TExprKind::Size(base) if !is_variable(m, *base) => {
                let kernel = self.kernel(m, *base);
                let sources: Vec<String> = kernel.extents().iter().map(|e| format!("({})", e.source)).collect();
                format!("({})", sources.join(" * "))
            }
            TExprKind::Shape { base, axis } => {
                let name = self.expr(m, *base);
                format!("{}_shape{}", name, axis)
            }
            TExprKind::Size(base) => {
                let rank = m.ty(*base).rank;
                let name = self.expr(m, *base);
                size(&name, rank)
            }
            TExprKind::Tuple(items) | TExprKind::ArrayLiteral(items) => {
                let items: Vec<String> = items.iter().map(|&i| self.expr(m, i)).collect();
                format!("{{{}}}", items.join(", "))
            }
            TExprKind::Alloc { .. } => "NULL".to_string(),
            TExprKind::Ternary { test, body, orelse } => {
                let test = self.expr(m, *test);
                let body = self.expr(m, *body);
                let orelse = self.expr(m, *orelse);
                format!("({} ? {} : {})", test, body, orelse)
            }
        }
    }

    /// Render `left op right`; `operand` is the element type both sides
    /// were converted to
    fn binary_text(&mut self, op: BinaryOp, left: String, right: String, operand: &TypeDescriptor) -> String {
        let integral = operand.kind <= BaseKind::Int;
        let single = operand.precision == 32 && operand.kind == BaseKind::Float
            || operand.precision == 64 && operand.kind == BaseKind::Complex;
        let suffix = if single { "f" } else { "" };
        match op {
            BinaryOp::FloorDiv if integral => {
                self.require_helper("pyaot_floordiv", FLOORDIV_HELPER);
                format!("pyaot_floordiv({}, {})", left, right)
            }
            BinaryOp::FloorDiv => format!("floor{}({} / {})", suffix, left, right),
            BinaryOp::Mod if integral => {
                self.require_helper("pyaot_mod", MOD_HELPER);
                format!("pyaot_mod({}, {})", left, right)
            }
            BinaryOp::Mod => {
                self.require_helper("pyaot_fmod", FMOD_HELPER);
                format!("pyaot_fmod{}({}, {})", suffix, left, right)
            }
            BinaryOp::Pow if integral => {
                self.require_helper("pyaot_ipow", IPOW_HELPER);
                format!("pyaot_ipow({}, {})", left, right)
            }
            BinaryOp::Pow if operand.kind == BaseKind::Complex => format!("cpow{}({}, {})", suffix, left, right),
            BinaryOp::Pow => format!("pow{}({}, {})", suffix, left, right),
            _ => format!("({} {} {})", left, c_operator(op), right),
        }
    }

    fn call(&mut self, m: &TypedModule, callee: &Callee, args: &[ExprId], outs: &[String]) -> String {
        let name = match callee {
            Callee::Local(fid) => self.names.function(&m.function(*fid).mangled),
            Callee::External { symbol, .. } => self.names.external(symbol),
        };
        let mut texts = Vec::with_capacity(args.len() + outs.len());
        for &arg in args {
            let ty = m.ty(arg).clone();
            let text = self.expr(m, arg);
            texts.push(text.clone());
            for axis in 0..ty.rank {
                texts.push(format!("{}_shape{}", text, axis));
            }
        }
        texts.extend(outs.iter().cloned());
        format!("{}({})", name, texts.join(", "))
    }

    // ----- whole-array expressions -----

    fn kernel(&mut self, m: &TypedModule, id: ExprId) -> Kernel {
        let mut kernel = Kernel::default();
        kernel.element = self.kernel_element(m, id, &mut kernel);
        kernel
    }

    fn kernel_element(&mut self, m: &TypedModule, id: ExprId, kernel: &mut Kernel) -> String {
        let node = m.expr(id);
        if !node.ty.is_array() {
            return self.kernel_scalar(m, id, kernel);
        }
        match &node.kind {
            TExprKind::Var(symbol) => {
                let name = self.names.symbol(m, *symbol);
                let shape = (0..node.ty.rank).map(|axis| format!("{}_shape{}", name, axis)).collect();
                kernel_array(kernel, name, shape, &node.ty)
            }
            TExprKind::ArrayLiteral(items) => {
                let extents = known_extents(&node.ty.shape);
                let mut values = Vec::with_capacity(items.len());
                for position in storage_order(&extents, node.ty.order) {
                    if let Some(&item) = items.get(position) {
                        values.push(self.expr(m, item));
                    }
                }
                let data = format!("({}[]){{{}}}", c_type(&node.ty), values.join(", "));
                let shape = extents.iter().map(|n| n.to_string()).collect();
                kernel_array(kernel, data, shape, &node.ty)
            }
            TExprKind::Alloc { fill, shape } => {
                if kernel.extents.is_none() {
                    let mut extents = Vec::with_capacity(shape.len());
                    for &extent in shape {
                        let source = self.expr(m, extent);
                        let bound = self.kernel_scalar(m, extent, kernel);
                        extents.push(Extent { bound, source });
                    }
                    kernel.extents = Some(extents);
                }
                match fill {
                    Fill::Value(value) => self.kernel_scalar(m, *value, kernel),
                    Fill::Ones => "1".to_string(),
                    Fill::Zeros | Fill::Empty => "0".to_string(),
                }
            }
            TExprKind::Binary { left, op, right } => {
                let operand = m.ty(*left).element();
                let left = self.kernel_element(m, *left, kernel);
                let right = self.kernel_element(m, *right, kernel);
                self.binary_text(*op, left, right, &operand)
            }
            TExprKind::Unary { op, operand } => {
                let operand = self.kernel_element(m, *operand, kernel);
                format!("({}{})", unary_operator(*op), operand)
            }
            TExprKind::Cast(inner) => {
                let text = self.kernel_element(m, *inner, kernel);
                cast_text(&text, &node.ty)
            }
            TExprKind::Math { func, arg } => {
                let arg_ty = m.ty(*arg).element();
                let arg = self.kernel_element(m, *arg, kernel);
                format!("{}({})", math_function(*func, &arg_ty), arg)
            }
            TExprKind::Ternary { test, body, orelse } => {
                let test = self.kernel_scalar(m, *test, kernel);
                let body = self.kernel_element(m, *body, kernel);
                let orelse = self.kernel_element(m, *orelse, kernel);
                format!("({} ? {} : {})", test, body, orelse)
            }
            _ => self.expr(m, id),
        }
    }

    fn kernel_scalar(&mut self, m: &TypedModule, id: ExprId, kernel: &mut Kernel) -> String {
        let text = self.expr(m, id);
        if matches!(m.expr(id).kind, TExprKind::Int(_) | TExprKind::Float(_) | TExprKind::Bool(_)) {
            return text;
        }
        let name = format!("pyaot_s{}", kernel.scalars.len());
        kernel.scalars.push((text, c_type(m.ty(id))));
        name
    }

    /// Open a block binding the kernel's operands and its extents
    /// `pyaot_n<axis>`
    fn open_kernel(&mut self, kernel: &Kernel) {
        self.line("{");
        self.indent += 1;
        for (j, (text, ty)) in kernel.scalars.iter().enumerate() {
            self.line(&format!("const {} pyaot_s{} = {};", ty, j, text));
        }
        for (i, array) in kernel.arrays.iter().enumerate() {
            self.line(&format!("const {} *pyaot_a{} = {};", array.ty, i, array.data));
            for (axis, extent) in array.shape.iter().enumerate() {
                self.line(&format!("const int64_t pyaot_a{}_shape{} = {};", i, axis, extent));
            }
        }
        for (axis, extent) in kernel.extents().iter().enumerate() {
            self.line(&format!("const int64_t pyaot_n{} = {};", axis, extent.bound));
        }
    }

    fn close_block(&mut self) {
        self.indent -= 1;
        self.line("}");
    }

    /// Evaluate an open kernel into a fresh `pyaot_tmp` buffer
    fn fill_temporary(&mut self, kernel: &Kernel, ty: &TypeDescriptor) {
        let element = c_type(ty);
        let count = kernel.count();
        self.line(&format!(
            "{t} *pyaot_tmp = ({t} *)malloc(sizeof({t}) * (size_t)({n}));",
            t = element,
            n = count
        ));
        self.line(&format!("for (int64_t pyaot_k = 0; pyaot_k < {}; pyaot_k++) {{", count));
        self.line(&format!("    pyaot_tmp[pyaot_k] = {};", kernel.element));
        self.line("}");
    }

    /// `name = <array expression>`: the result replaces the variable's
    /// buffer once every element has been computed from the old one
    fn emit_array_store(&mut self, m: &TypedModule, name: &str, ty: &TypeDescriptor, value: ExprId) {
        let kernel = self.kernel(m, value);
        self.open_kernel(&kernel);
        self.fill_temporary(&kernel, ty);
        self.line(&format!("free({});", name));
        self.line(&format!("{} = pyaot_tmp;", name));
        for axis in 0..ty.rank {
            self.line(&format!("{}_shape{} = pyaot_n{};", name, axis, axis));
        }
        self.close_block();
    }

    /// `name op= value` on every element of an array variable
    fn emit_array_update(&mut self, m: &TypedModule, id: SymbolId, op: BinaryOp, value: ExprId) {
        let name = self.names.symbol(m, id);
        let ty = m.symbols.symbol(id).ty.clone();
        let element = ty.element();
        let kernel = self.kernel(m, value);
        self.open_kernel(&kernel);
        let count = size(&name, ty.rank);
        let slot = format!("{}[pyaot_k]", name);
        let update = match compound_operator(op, &element) {
            Some(operator) => format!("{} {}= {};", slot, operator, kernel.element),
            None => {
                let combined = self.binary_text(op, slot.clone(), kernel.element.clone(), &element);
                format!("{} = {};", slot, combined)
            }
        };
        self.line(&format!("for (int64_t pyaot_k = 0; pyaot_k < {}; pyaot_k++) {{", count));
        self.line(&format!("    {}", update));
        self.line("}");
        self.close_block();
    }

    /// Reduction of an array expression, outlined into a static function
    /// taking the expression's operands
    fn reduction_kernel(&mut self, m: &TypedModule, op: Reduction, value: ExprId, result: &TypeDescriptor) -> String {
        let kernel = self.kernel(m, value);
        let name = format!("pyaot_kernel{}", self.kernels.len());
        let mut params = Vec::new();
        let mut args = Vec::new();
        for (i, array) in kernel.arrays.iter().enumerate() {
            params.push(format!("const {} *pyaot_a{}", array.ty, i));
            args.push(array.data.clone());
            for (axis, extent) in array.shape.iter().enumerate() {
                params.push(format!("int64_t pyaot_a{}_shape{}", i, axis));
                args.push(extent.clone());
            }
        }
        for (j, (text, ty)) in kernel.scalars.iter().enumerate() {
            params.push(format!("{} pyaot_s{}", ty, j));
            args.push(text.clone());
        }
        let params = if params.is_empty() { "void".to_string() } else { params.join(", ") };

        let element = c_type(m.ty(value));
        let count = kernel.count();
        let body = match op {
            Reduction::Sum => format!(
                "    {acc} pyaot_total = 0;\n    for (int64_t pyaot_k = 0; pyaot_k < {n}; pyaot_k++) {{\n        pyaot_total += {e};\n    }}\n    return pyaot_total;\n",
                acc = c_type(result),
                n = count,
                e = kernel.element
            ),
            Reduction::Max | Reduction::Min => format!(
                "    {t} pyaot_best = 0;\n    for (int64_t pyaot_k = 0; pyaot_k < {n}; pyaot_k++) {{\n        const {t} pyaot_v = {e};\n        if (pyaot_k == 0 || pyaot_v {cmp} pyaot_best) {{\n            pyaot_best = pyaot_v;\n        }}\n    }}\n    return pyaot_best;\n",
                t = element,
                n = count,
                e = kernel.element,
                cmp = if op == Reduction::Max { ">" } else { "<" }
            ),
        };
        let returns = match op {
            Reduction::Sum => c_type(result),
            _ => element,
        };
        self.kernels
            .push(format!("static {} {}({})\n{{\n{}}}\n", returns, name, params, body));
        format!("{}({})", name, args.join(", "))
    }

    fn min_max_function(&mut self, op: Reduction, ty: &TypeDescriptor) -> String {
        if ty.kind <= BaseKind::Int {
            let name = format!("pyaot_i{}", op.name());
            let comparison = if op == Reduction::Max { ">" } else { "<" };
            self.require_helper(
                &name,
                &format!(
                    "static inline int64_t {}(int64_t a, int64_t b)\n{{\n    return a {} b ? a : b;\n}}\n",
                    name, comparison
                ),
            );
            name
        } else {
            let suffix = if ty.precision == 32 { "f" } else { "" };
            format!("f{}{}", op.name(), suffix)
        }
    }

    fn reduction_helper(&mut self, op: Reduction, array: &TypeDescriptor, result: &TypeDescriptor) -> String {
        let dtype = array.dtype().unwrap_or(Dtype::Float64);
        let name = format!("pyaot_{}_{}", op.name(), dtype.name());
        let element = c_type(array);
        let accumulator = c_type(result);
        let code = match op {
            Reduction::Sum => format!(
                "static {acc} {name}(const {t} *data, int64_t n)\n{{\n    {acc} total = 0;\n    for (int64_t i = 0; i < n; i++) {{\n        total += data[i];\n    }}\n    return total;\n}}\n",
                acc = accumulator,
                name = name,
                t = element
            ),
            Reduction::Max | Reduction::Min => format!(
                "static {t} {name}(const {t} *data, int64_t n)\n{{\n    {t} best = data[0];\n    for (int64_t i = 1; i < n; i++) {{\n        if (data[i] {cmp} best) {{\n            best = data[i];\n        }}\n    }}\n    return best;\n}}\n",
                t = element,
                name = name,
                cmp = if op == Reduction::Max { ">" } else { "<" }
            ),
        };
        self.require_helper(&name, &code);
        name
    }

    fn require_print_helpers(&mut self) {
        self.require_helper("pyaot_print", PRINT_HELPERS);
    }

    fn require_helper(&mut self, name: &str, code: &str) {
        self.helpers.entry(name.to_string()).or_insert_with(|| code.to_string());
    }

    // ----- output -----

    fn line(&mut self, s: &str) {
        self.write_indent();
        self.writeln(s);
    }

    fn write(&mut self, s: &str) {
        self.output.push_str(s);
    }

    fn writeln(&mut self, s: &str) {
        self.output.push_str(s);
        self.output.push('\n');
    }

    fn newline(&mut self) {
        self.output.push('\n');
    }

    fn write_indent(&mut self) {
        for _ in 0..self.indent {
            self.output.push_str("    ");
        }
    }
}

impl Default for CEmitter {
    fn default() -> Self {
        Self::new()
    }
}

impl Backend for CEmitter {
    fn language(&self) -> Language {
        Language::C
    }

    fn supports(&self, capability: Capability) -> bool {
        matches!(capability, Capability::StringVariables | Capability::ArrayExpressions)
    }

    fn emit(&mut self, module: &TypedModule, names: &NameTable, accelerators: Accelerators) -> Vec<GeneratedFile> {
        self.accelerators = accelerators;
        self.names = names.clone();
        self.output.clear();
        self.helpers.clear();
        self.kernels.clear();
        self.indent = 0;
        self.loop_depth = 0;

        let header = GeneratedFile {
            name: format!("{}.h", module.name),
            kind: FileKind::Header,
            contents: self.emit_header(module),
        };
        if module.is_header {
            return vec![header];
        }
        let source = GeneratedFile {
            name: format!("{}.c", module.name),
            kind: FileKind::Source,
            contents: self.emit_source(module),
        };
        vec![source, header]
    }
}

const FLOORDIV_HELPER: &str = "\
static inline int64_t pyaot_floordiv(int64_t a, int64_t b)
{
    int64_t q = a / b;
    if (a % b != 0 && ((a < 0) != (b < 0))) {
        q -= 1;
    }
    return q;
}
";

const MOD_HELPER: &str = "\
static inline int64_t pyaot_mod(int64_t a, int64_t b)
{
    int64_t r = a % b;
    if (r != 0 && ((r < 0) != (b < 0))) {
        r += b;
    }
    return r;
}
";

const FMOD_HELPER: &str = "\
static inline double pyaot_fmod(double a, double b)
{
    double r = fmod(a, b);
    if (r != 0.0 && ((r < 0.0) != (b < 0.0))) {
        r += b;
    }
    return r;
}

static inline float pyaot_fmodf(float a, float b)
{
    float r = fmodf(a, b);
    if (r != 0.0f && ((r < 0.0f) != (b < 0.0f))) {
        r += b;
    }
    return r;
}
";

const IPOW_HELPER: &str = "\
static inline int64_t pyaot_ipow(int64_t base, int64_t exponent)
{
    int64_t result = 1;
    if (exponent < 0) {
        return base == 1 ? 1 : 0;
    }
    while (exponent > 0) {
        if (exponent & 1) {
            result *= base;
        }
        base *= base;
        exponent >>= 1;
    }
    return result;
}
";

/// Shortest round-tripping decimal form, as Python's `repr` prints floats
const PRINT_HELPERS: &str = "\
static void pyaot_format_float(char *buffer, size_t size, double value)
{
    if (isnan(value)) {
        snprintf(buffer, size, \"nan\");
        return;
    }
    if (isinf(value)) {
        snprintf(buffer, size, value > 0 ? \"inf\" : \"-inf\");
        return;
    }
    for (int precision = 15; precision <= 17; precision++) {
        snprintf(buffer, size, \"%.*g\", precision, value);
        if (strtod(buffer, NULL) == value) {
            break;
        }
    }
}

static void pyaot_print_float(double value)
{
    char buffer[40];
    pyaot_format_float(buffer, sizeof buffer, value);
    printf(\"%s\", buffer);
    if (!strpbrk(buffer, \".eni\")) {
        printf(\".0\");
    }
}

static void pyaot_print_complex(double complex value)
{
    char re[40];
    char im[40];
    pyaot_format_float(im, sizeof im, fabs(cimag(value)));
    if (creal(value) == 0.0 && !signbit(creal(value))) {
        printf(\"%s%sj\", signbit(cimag(value)) ? \"-\" : \"\", im);
        return;
    }
    pyaot_format_float(re, sizeof re, creal(value));
    printf(\"(%s%s%sj)\", re, signbit(cimag(value)) ? \"-\" : \"+\", im);
}
";

fn is_variable(m: &TypedModule, id: ExprId) -> bool {
    matches!(m.expr(id).kind, TExprKind::Var(_))
}

/// Bind an array operand of a kernel; the first one fixes the extents
fn kernel_array(kernel: &mut Kernel, data: String, shape: Vec<String>, ty: &TypeDescriptor) -> String {
    let name = format!("pyaot_a{}", kernel.arrays.len());
    if kernel.extents.is_none() {
        let extents = shape
            .iter()
            .enumerate()
            .map(|(axis, source)| Extent {
                bound: format!("{}_shape{}", name, axis),
                source: source.clone(),
            })
            .collect();
        kernel.extents = Some(extents);
    }
    kernel.arrays.push(ArrayOperand {
        data,
        shape,
        ty: c_type(ty),
    });
    format!("{}[pyaot_k]", name)
}

fn known_extents(shape: &[Dim]) -> Vec<usize> {
    shape
        .iter()
        .map(|d| match d {
            Dim::Known(n) => *n as usize,
            Dim::Unknown => 0,
        })
        .collect()
}

fn unary_operator(op: UnaryOp) -> &'static str {
    match op {
        UnaryOp::Neg => "-",
        UnaryOp::Pos => "+",
        UnaryOp::Not => "!",
        UnaryOp::Invert => "~",
    }
}

fn cast_text(text: &str, target: &TypeDescriptor) -> String {
    if target.kind == BaseKind::Bool {
        format!("(({}) != 0)", text)
    } else {
        format!("(({})({}))", c_type(target), text)
    }
}

pub(super) fn c_type(ty: &TypeDescriptor) -> &'static str {
    match ty.dtype() {
        Some(Dtype::Bool) => "bool",
        Some(Dtype::Int8) => "int8_t",
        Some(Dtype::Int16) => "int16_t",
        Some(Dtype::Int32) => "int32_t",
        Some(Dtype::Int64) => "int64_t",
        Some(Dtype::Float32) => "float",
        Some(Dtype::Float64) => "double",
        Some(Dtype::Complex64) => "float complex",
        Some(Dtype::Complex128) => "double complex",
        None if ty.kind == BaseKind::Str => "const char *",
        None => "void",
    }
}

fn c_operator(op: BinaryOp) -> &'static str {
    match op {
        BinaryOp::And => "&&",
        BinaryOp::Or => "||",
        BinaryOp::Eq => "==",
        BinaryOp::NotEq => "!=",
        BinaryOp::Lt => "<",
        BinaryOp::LtE => "<=",
        BinaryOp::Gt => ">",
        BinaryOp::GtE => ">=",
        BinaryOp::BitAnd => "&",
        BinaryOp::BitOr => "|",
        BinaryOp::BitXor => "^",
        BinaryOp::Shl => "<<",
        BinaryOp::Shr => ">>",
        other => other.symbol(),
    }
}

/// Operators that have a C compound assignment with Python's meaning
fn compound_operator(op: BinaryOp, element: &TypeDescriptor) -> Option<&'static str> {
    match op {
        BinaryOp::Add
        | BinaryOp::Sub
        | BinaryOp::Mul
        | BinaryOp::BitAnd
        | BinaryOp::BitOr
        | BinaryOp::BitXor
        | BinaryOp::Shl
        | BinaryOp::Shr => Some(c_operator(op)),
        BinaryOp::Div if element.kind >= BaseKind::Float => Some("/"),
        _ => None,
    }
}

fn math_function(func: MathFunc, arg: &TypeDescriptor) -> String {
    let (prefix, suffix) = match (arg.kind, arg.precision) {
        (BaseKind::Complex, 64) => ("c", "f"),
        (BaseKind::Complex, _) => ("c", ""),
        (BaseKind::Float, 32) => ("", "f"),
        _ => ("", ""),
    };
    match func {
        MathFunc::Abs if arg.kind <= BaseKind::Int => "llabs".to_string(),
        MathFunc::Abs if arg.kind == BaseKind::Float => format!("fabs{}", suffix),
        _ => format!("{}{}{}", prefix, func.name(), suffix),
    }
}

fn pragma_prefix(family: PragmaFamily) -> &'static str {
    match family {
        PragmaFamily::OpenMp => "omp",
        PragmaFamily::OpenAcc => "acc",
    }
}

fn is_standalone_directive(first: &str) -> bool {
    matches!(
        first,
        "barrier" | "taskwait" | "taskyield" | "flush" | "atomic" | "wait" | "update" | "cache" | "declare"
    )
}

/// Linear offset of an element; indices are already rendered
fn offset(name: &str, order: Order, indices: &[String]) -> String {
    match indices {
        [] => "0".to_string(),
        [single] => single.clone(),
        _ => match order {
            Order::C => {
                let mut text = indices[0].clone();
                for (axis, index) in indices.iter().enumerate().skip(1) {
                    text = format!("({}) * {}_shape{} + {}", text, name, axis, index);
                }
                text
            }
            Order::F => {
                let last = indices.len() - 1;
                let mut text = indices[last].clone();
                for axis in (0..last).rev() {
                    text = format!("{} + {}_shape{} * ({})", indices[axis], name, axis, text);
                }
                text
            }
        },
    }
}

fn size(name: &str, rank: usize) -> String {
    let extents: Vec<String> = (0..rank).map(|axis| format!("{}_shape{}", name, axis)).collect();
    match extents.len() {
        1 => extents.join(""),
        _ => format!("({})", extents.join(" * ")),
    }
}

/// Row-major positions in the order they are stored in memory
fn storage_order(extents: &[usize], order: Order) -> Vec<usize> {
    let total: usize = extents.iter().product();
    if order == Order::C || extents.len() < 2 {
        return (0..total).collect();
    }
    let mut positions = Vec::with_capacity(total);
    let mut index = vec![0usize; extents.len()];
    for _ in 0..total {
        let row_major = index.iter().zip(extents).fold(0, |acc, (i, n)| acc * n + i);
        positions.push(row_major);
        for (axis, extent) in extents.iter().enumerate() {
            index[axis] += 1;
            if index[axis] < *extent {
                break;
            }
            index[axis] = 0;
        }
    }
    positions
}

fn int_literal(value: i64) -> String {
    if i32::try_from(value).is_ok() {
        value.to_string()
    } else if value == i64::MIN {
        "INT64_MIN".to_string()
    } else {
        format!("INT64_C({})", value)
    }
}

fn float_literal(value: f64) -> String {
    if value.is_nan() {
        "NAN".to_string()
    } else if value.is_infinite() {
        if value > 0.0 { "INFINITY" } else { "(-INFINITY)" }.to_string()
    } else {
        format!("{:?}", value)
    }
}

/// Escape a string for C output
fn escape_string(s: &str) -> String {
    let mut result = String::new();
    for c in s.chars() {
        match c {
            '\n' => result.push_str("\\n"),
            '\r' => result.push_str("\\r"),
            '\t' => result.push_str("\\t"),
            '\\' => result.push_str("\\\\"),
            '"' => result.push_str("\\\""),
            c if c.is_ascii_control() => result.push_str(&format!("\\x{:02x}", c as u32)),
            c => result.push(c),
        }
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::diagnostics::DiagnosticReporter;
    use crate::parser::parse_source;
    use crate::semantic::{analyze, SearchPathResolver};

    fn emit_with(source: &str, accelerators: Accelerators) -> (String, String) {
        let mut reporter = DiagnosticReporter::new("m.py", source);
        let ast = parse_source(source, &mut reporter);
        let mut resolver = SearchPathResolver::new(Vec::new());
        let module = analyze(&ast, "m", false, &mut resolver, &mut reporter)
            .unwrap_or_else(|| panic!("{:?}", reporter.diagnostics()));
        let names = NameTable::new(&module, Language::C);
        let files = CEmitter::new().emit(&module, &names, accelerators);
        (files[0].contents.clone(), files[1].contents.clone())
    }

    fn emit(source: &str) -> (String, String) {
        emit_with(source, Accelerators::default())
    }

    #[test]
    fn arrays_travel_with_their_extents() {
        let (c, h) = emit("\
def array_max(a: 'float[:]') -> float:
    m = a[0]
    for i in range(1, len(a)):
        if a[i] > m:
            m = a[i]
    return m
");
        assert!(h.contains("double array_max(double *a, int64_t a_shape0);"), "{}", h);
        assert!(
            c.contains("for (int64_t pyaot_i0 = 1; pyaot_i0 < a_shape0; pyaot_i0++) {\n        i = pyaot_i0;"),
            "{}",
            c
        );
        assert!(c.contains("if ((a[i] > m)) {"), "{}", c);
        assert!(c.contains("return m;"));
    }

    #[test]
    fn local_arrays_are_released_before_returning() {
        let (c, _) = emit("\
import numpy as np

def total(n: int) -> float:
    a = np.ones(n)
    return np.sum(a)
");
        assert!(c.contains("a = (double *)malloc(sizeof(double) * (size_t)(pyaot_n0));"), "{}", c);
        assert!(c.contains("const double pyaot_result = pyaot_sum_float64(a, a_shape0);"), "{}", c);
        let free = c.find("free(a);\n        return pyaot_result;");
        assert!(free.is_some(), "{}", c);
        assert!(c.contains("static double pyaot_sum_float64(const double *data, int64_t n)"));
    }

    #[test]
    fn python_division_rules_use_helpers() {
        let (c, _) = emit("\
def f(a: int, b: int) -> int:
    return a // b + a % b
");
        assert!(c.contains("(pyaot_floordiv(a, b) + pyaot_mod(a, b))"), "{}", c);
        assert!(c.contains("static inline int64_t pyaot_floordiv"));
        assert!(!c.contains("pyaot_ipow"));
    }

    #[test]
    fn several_results_use_out_parameters() {
        let (c, h) = emit("\
def divmod_(a: int, b: int):
    return a // b, a % b

def use(a: int) -> int:
    q, r = divmod_(a, 3)
    return q + r
");
        assert!(
            h.contains("void divmod_(int64_t a, int64_t b, int64_t *pyaot_out0, int64_t *pyaot_out1);"),
            "{}",
            h
        );
        assert!(c.contains("divmod_(a, 3, &q, &r);"), "{}", c);
    }

    #[test]
    fn pragmas_follow_enabled_accelerators() {
        let source = "\
def scale(a: 'float[:]', k: float):
    #$ omp parallel for
    for i in range(len(a)):
        a[i] = a[i] * k
";
        let (plain, _) = emit(source);
        assert!(!plain.contains("#pragma"));
        let accelerators = Accelerators {
            openmp: true,
            ..Accelerators::default()
        };
        let (threaded, _) = emit_with(source, accelerators);
        assert!(
            threaded.contains("#pragma omp parallel for private(i)\n    for (int64_t pyaot_i0 = 0; pyaot_i0 < a_shape0; pyaot_i0++)"),
            "{}",
            threaded
        );
    }

    #[test]
    fn module_variables_are_initialised_at_load() {
        let (c, h) = emit("\
import numpy as np
n = 3
grid = np.array([[1, 2], [3, 4]], order='F')
");
        assert!(h.contains("extern int64_t n;"));
        assert!(h.contains("extern int64_t *grid;"));
        assert!(h.contains("void m__init(void);"));
        assert!(c.contains("void m__init(void)\n{\n    n = 3;"), "{}", c);
        assert!(c.contains("int64_t pyaot_items[4] = {1, 3, 2, 4};"), "{}", c);
    }

    #[test]
    fn rebinding_the_loop_variable_leaves_the_counter_alone() {
        let (c, _) = emit("\
def shadow(n: int) -> int:
    x = 0
    for i in range(n):
        i = i * 2
        x += i
    return x
");
        assert!(c.contains("for (int64_t pyaot_i0 = 0; pyaot_i0 < n; pyaot_i0++) {"), "{}", c);
        assert!(c.contains("i = pyaot_i0;\n        i = (i * 2);"), "{}", c);
    }

    #[test]
    fn nested_loops_get_their_own_counters() {
        let (c, _) = emit("\
def pairs(n: int) -> int:
    t = 0
    for i in range(n):
        for j in range(i, n):
            t += j - i
    return t
");
        assert!(c.contains("for (int64_t pyaot_i1 = i; pyaot_i1 < n; pyaot_i1++) {"), "{}", c);
        assert!(c.contains("j = pyaot_i1;"), "{}", c);
    }

    #[test]
    fn awkward_names_are_spelled_legally() {
        let (c, h) = emit("\
def fmod(a: int, b: int) -> int:
    return a - b

def caller(int_: int) -> int:
    double = int_ + 1
    return fmod(double, 2)
");
        assert!(h.contains("int64_t fmod_(int64_t a, int64_t b);"), "{}", h);
        assert!(c.contains("double_ = (int_ + 1);"), "{}", c);
        assert!(c.contains("return fmod_(double_, 2);"), "{}", c);
    }

    #[test]
    fn whole_array_arithmetic_runs_elementwise() {
        let (c, _) = emit("\
import numpy as np

def axpy(n: int, k: float) -> float:
    x = np.ones(n)
    y = np.zeros(n)
    y = k * x + y
    y += 1.0
    return np.sum(y * y)
");
        assert!(c.contains("const double pyaot_s0 = k;"), "{}", c);
        assert!(c.contains("pyaot_tmp[pyaot_k] = ((pyaot_s0 * pyaot_a0[pyaot_k]) + pyaot_a1[pyaot_k]);"), "{}", c);
        assert!(c.contains("free(y);\n        y = pyaot_tmp;\n        y_shape0 = pyaot_n0;"), "{}", c);
        assert!(c.contains("y[pyaot_k] += 1.0;"), "{}", c);
        assert!(c.contains("static double pyaot_kernel0(const double *pyaot_a0, int64_t pyaot_a0_shape0, const double *pyaot_a1, int64_t pyaot_a1_shape0)"), "{}", c);
        assert!(c.contains("pyaot_kernel0(y, y_shape0, y, y_shape0)"), "{}", c);
    }

    #[test]
    fn printing_an_array_expression_uses_a_temporary() {
        let (c, _) = emit("\
import numpy as np

def show(n: int):
    a = np.ones(n)
    print(a * 2)
");
        assert!(c.contains("const int64_t pyaot_tmp_shape0 = pyaot_n0;"), "{}", c);
        assert!(c.contains("free(pyaot_tmp);"), "{}", c);
    }

    #[test]
    fn column_major_offsets() {
        let indices = vec!["i".to_string(), "j".to_string()];
        assert_eq!(offset("a", Order::C, &indices), "(i) * a_shape1 + j");
        assert_eq!(offset("a", Order::F, &indices), "i + a_shape0 * (j)");
        assert_eq!(storage_order(&[2, 3], Order::F), vec![0, 3, 1, 4, 2, 5]);
    }
}

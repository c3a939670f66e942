//! Fortran backend: one free-form module using `iso_c_binding` kinds.
//!
//! Dummy arrays are assumed-shape with zero lower bounds. C-ordered arrays
//! are stored with their dimensions reversed, so `a[i, j]` becomes
//! `a(j, i)` and Python axis `k` of a rank `r` array is Fortran dimension
//! `r - k`. Array results are allocatable and allocated with zero lower
//! bounds, like every other owned array.

use super::names::escape;
use super::{active_directive, loop_directive, Backend, Capability, FileKind, GeneratedFile, Language, NameTable};
use crate::config::Accelerators;
use crate::parser::{BinaryOp, PragmaFamily, UnaryOp};
use crate::semantic::tast::*;
use crate::semantic::{BaseKind, Dim, Dtype, Order, SymbolId, TypeDescriptor, TypedModule};

/// Longest line written before continuing with `&`
const LINE_WIDTH: usize = 100;

pub struct FortranEmitter {
    output: String,
    indent: usize,
    accelerators: Accelerators,
    /// Result variables of the procedure being emitted
    results: Vec<String>,
    /// Scratch variables receiving discarded or staged function results,
    /// by spelled type and rank
    discards: Vec<(String, String)>,
    names: NameTable,
    /// Range loops enclosing the statement being emitted
    loop_depth: usize,
}

impl FortranEmitter {
    pub fn new() -> Self {
        Self {
            output: String::new(),
            indent: 0,
            accelerators: Accelerators::default(),
            results: Vec::new(),
            discards: Vec::new(),
            names: NameTable::default(),
            loop_depth: 0,
        }
    }

    fn emit_module(&mut self, m: &TypedModule) -> String {
        let name = self.names.module().to_string();
        self.line(&format!("! Generated by pyaot from {}.py. Do not edit.", m.name));
        self.line(&format!("module {}", name));
        self.newline();
        self.indent += 1;
        self.line("use iso_c_binding");
        for header in &m.headers {
            self.line(&format!("use {}", escape(&header.module, Language::Fortran)));
        }
        self.newline();
        self.line("implicit none");
        self.newline();
        for &id in &m.globals {
            let symbol = m.symbols.symbol(id);
            let variable = self.names.symbol(m, id);
            let declaration = if symbol.ty.is_array() {
                format!(
                    "{}, allocatable, target :: {}({})",
                    f_type(&symbol.ty),
                    variable,
                    deferred_shape(symbol.ty.rank)
                )
            } else {
                format!("{}, target :: {}", f_type(&symbol.ty), variable)
            };
            self.line(&declaration);
        }
        self.indent -= 1;
        self.newline();
        self.line("contains");
        self.newline();
        self.indent += 1;

        for function in m.functions.iter().filter(|f| !f.is_stub) {
            self.emit_procedure(m, function);
            self.newline();
        }

        let init = self.names.init();
        self.line(&format!("subroutine {}()", init));
        self.indent += 1;
        self.line("implicit none");
        self.results.clear();
        self.declare_counters(&m.init_body);
        self.declare_discards(m, &m.init_body);
        self.emit_block(m, &m.init_body);
        self.indent -= 1;
        self.line(&format!("end subroutine {}", init));

        self.indent -= 1;
        self.newline();
        self.line(&format!("end module {}", name));
        std::mem::take(&mut self.output)
    }

    /// Interface module for a header: declarations only
    fn emit_interfaces(&mut self, m: &TypedModule) -> String {
        let name = self.names.module().to_string();
        self.line(&format!("! Generated by pyaot from {}.pyh. Do not edit.", m.name));
        self.line(&format!("module {}", name));
        self.newline();
        self.indent += 1;
        self.line("use iso_c_binding");
        self.newline();
        self.line("implicit none");
        self.newline();
        for &id in &m.globals {
            let symbol = m.symbols.symbol(id);
            let variable = self.names.symbol(m, id);
            self.line(&format!(
                "{}, bind(c, name=\"{}\") :: {}",
                f_type(&symbol.ty),
                symbol.name,
                variable
            ));
        }
        if !m.functions.is_empty() {
            self.newline();
            self.line("interface");
            self.indent += 1;
            for function in m.functions.iter() {
                let (header, footer) = self.procedure_header(m, function);
                self.line(&format!("{} bind(c, name=\"{}\")", header, function.mangled));
                self.indent += 1;
                self.line("import");
                self.declare_dummies(m, function);
                self.indent -= 1;
                self.line(&footer);
            }
            self.indent -= 1;
            self.line("end interface");
        }
        self.indent -= 1;
        self.newline();
        self.line(&format!("end module {}", name));
        std::mem::take(&mut self.output)
    }

    /// Opening and closing line of a procedure
    fn procedure_header(&mut self, m: &TypedModule, function: &TypedFunction) -> (String, String) {
        let name = self.names.function(&function.mangled);
        let mut dummies: Vec<String> = function.params.iter().map(|&id| self.names.symbol(m, id)).collect();
        self.results = match function.results.len() {
            0 => Vec::new(),
            1 => vec!["pyaot_result".to_string()],
            n => (0..n).map(|k| format!("pyaot_out{}", k)).collect(),
        };
        if function.results.len() > 1 {
            dummies.extend(self.results.iter().cloned());
        }
        let dummies = dummies.join(", ");
        if function.results.len() == 1 {
            (
                format!("recursive function {}({}) result(pyaot_result)", name, dummies),
                format!("end function {}", name),
            )
        } else {
            (
                format!("recursive subroutine {}({})", name, dummies),
                format!("end subroutine {}", name),
            )
        }
    }

    fn declare_dummies(&mut self, m: &TypedModule, function: &TypedFunction) {
        for &id in &function.params {
            let symbol = m.symbols.symbol(id);
            let name = self.names.symbol(m, id);
            if symbol.ty.is_array() {
                let intent = if symbol.mutated { "inout" } else { "in" };
                self.line(&format!(
                    "{}, intent({}) :: {}({})",
                    f_type(&symbol.ty),
                    intent,
                    name,
                    assumed_shape(symbol.ty.rank)
                ));
            } else {
                self.line(&format!("{}, value :: {}", f_type(&symbol.ty), name));
            }
        }
        match function.results.as_slice() {
            [] => {}
            [single] if single.is_array() => self.line(&format!(
                "{}, allocatable :: pyaot_result({})",
                f_type(single),
                deferred_shape(single.rank)
            )),
            [single] => self.line(&format!("{} :: pyaot_result", f_type(single))),
            results => {
                for (k, result) in results.iter().enumerate() {
                    if result.is_array() {
                        self.line(&format!(
                            "{}, allocatable, intent(out) :: pyaot_out{}({})",
                            f_type(result),
                            k,
                            deferred_shape(result.rank)
                        ));
                    } else {
                        self.line(&format!("{}, intent(out) :: pyaot_out{}", f_type(result), k));
                    }
                }
            }
        }
    }

    fn emit_procedure(&mut self, m: &TypedModule, function: &TypedFunction) {
        let (header, footer) = self.procedure_header(m, function);
        self.line(&header);
        self.indent += 1;
        self.line("implicit none");
        self.declare_dummies(m, function);
        for &id in &function.locals {
            let symbol = m.symbols.symbol(id);
            let name = self.names.symbol(m, id);
            if symbol.ty.is_array() {
                self.line(&format!(
                    "{}, allocatable :: {}({})",
                    f_type(&symbol.ty),
                    name,
                    deferred_shape(symbol.ty.rank)
                ));
            } else {
                self.line(&format!("{} :: {}", f_type(&symbol.ty), name));
            }
        }
        self.declare_counters(&function.body);
        self.declare_discards(m, &function.body);
        self.newline();
        self.emit_block(m, &function.body);
        self.indent -= 1;
        self.line(&footer);
    }

    /// Hidden counters `pyaot_i<depth>` of the range loops in a body
    fn declare_counters(&mut self, body: &[TStmt]) {
        let depth = loop_nesting(body);
        if depth > 0 {
            let counters: Vec<String> = (0..depth).map(|d| format!("pyaot_i{}", d)).collect();
            self.line(&format!("integer(c_int64_t) :: {}", counters.join(", ")));
        }
    }

    /// Fortran cannot ignore a function result; calls used as statements
    /// store theirs in a scratch variable. Array results assigned to a
    /// variable are staged in one too.
    fn declare_discards(&mut self, m: &TypedModule, body: &[TStmt]) {
        self.discards.clear();
        let mut types = Vec::new();
        collect_discarded(m, body, &mut types);
        for ty in types {
            let spelled = scratch_type(&ty);
            if !self.discards.iter().any(|(t, _)| *t == spelled) {
                let name = format!("pyaot_discard{}", self.discards.len());
                if ty.is_array() {
                    self.line(&format!(
                        "{}, allocatable :: {}({})",
                        f_type(&ty),
                        name,
                        deferred_shape(ty.rank)
                    ));
                } else {
                    self.line(&format!("{} :: {}", spelled, name));
                }
                self.discards.push((spelled, name));
            }
        }
    }

    fn scratch(&self, ty: &TypeDescriptor) -> String {
        let spelled = scratch_type(ty);
        self.discards
            .iter()
            .find(|(t, _)| *t == spelled)
            .map(|(_, n)| n.clone())
            .unwrap_or_else(|| "pyaot_discard0".to_string())
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
                let outs: Vec<String> = targets.iter().map(|&id| self.names.symbol(m, id)).collect();
                match &m.expr(*value).kind {
                    TExprKind::Call { callee, args } => {
                        let call = self.call(m, callee, args, &outs);
                        self.line(&format!("call {}", call));
                    }
                    TExprKind::Tuple(items) => {
                        for (name, &item) in outs.iter().zip(items) {
                            let value = self.expr(m, item);
                            self.line(&format!("{} = {}", name, value));
                        }
                    }
                    _ => {}
                }
            }
            TStmtKind::AugAssign { target, op, value } => {
                let slot = self.lvalue(m, target);
                let element = m.symbols.symbol(target.symbol()).ty.element();
                let value = self.expr(m, *value);
                let combined = self.binary_text(*op, slot.clone(), value, &element);
                self.line(&format!("{} = {}", slot, combined));
            }
            TStmtKind::Expr(value) => {
                if let TExprKind::Call { callee, args } = &m.expr(*value).kind {
                    let call = self.call(m, callee, args, &[]);
                    let ty = m.ty(*value);
                    if ty.kind == BaseKind::Void {
                        self.line(&format!("call {}", call));
                    } else {
                        let scratch = self.scratch(ty);
                        self.line(&format!("{} = {}", scratch, call));
                    }
                }
            }
            TStmtKind::If { branches, orelse } => {
                for (index, (condition, body)) in branches.iter().enumerate() {
                    let condition = self.expr(m, *condition);
                    if index == 0 {
                        self.line(&format!("if ({}) then", condition));
                    } else {
                        self.line(&format!("else if ({}) then", condition));
                    }
                    self.indent += 1;
                    self.emit_block(m, body);
                    self.indent -= 1;
                }
                if !orelse.is_empty() {
                    self.line("else");
                    self.indent += 1;
                    self.emit_block(m, orelse);
                    self.indent -= 1;
                }
                self.line("end if");
            }
            TStmtKind::For { var, start, stop, step, body, directive } => {
                let name = self.names.symbol(m, *var);
                let counter = format!("pyaot_i{}", self.loop_depth);
                let start = self.expr(m, *start);
                let stop_text = self.expr(m, *stop);
                let bounds = match m.literal_int(*step) {
                    Some(1) => format!("{}, {} - 1", start, stop_text),
                    Some(s) if s > 0 => format!("{}, {} - 1, {}", start, stop_text, self.expr(m, *step)),
                    Some(_) => format!("{}, {} + 1, {}", start, stop_text, self.expr(m, *step)),
                    None => {
                        let step = self.expr(m, *step);
                        format!("{}, {} - sign(1_c_int64_t, {}), {}", start, stop_text, step, step)
                    }
                };
                if let Some(directive) = directive {
                    if let Some(text) = loop_directive(directive, self.accelerators, &name) {
                        self.directive_line(directive.family, &text);
                    }
                }
                // The body may rebind the loop variable; the counter drives
                // the iteration
                self.line(&format!("do {} = {}", counter, bounds));
                self.indent += 1;
                self.line(&format!("{} = {}", name, counter));
                self.loop_depth += 1;
                self.emit_block(m, body);
                self.loop_depth -= 1;
                self.indent -= 1;
                self.line("end do");
            }
            TStmtKind::While { condition, body } => {
                let condition = self.expr(m, *condition);
                self.line(&format!("do while ({})", condition));
                self.indent += 1;
                self.emit_block(m, body);
                self.indent -= 1;
                self.line("end do");
            }
            TStmtKind::Return(values) => self.emit_return(m, values),
            TStmtKind::Break => self.line("exit"),
            TStmtKind::Continue => self.line("cycle"),
            TStmtKind::Pass => self.line("continue"),
            TStmtKind::Print(values) => {
                let items: Vec<String> = values.iter().map(|&v| self.expr(m, v)).collect();
                if items.is_empty() {
                    self.line("write(*, '(a)') ''");
                } else {
                    self.line(&format!("write(*, '(*(g0,:,\" \"))') {}", items.join(", ")));
                }
            }
            TStmtKind::Directive(directive) => self.emit_directive(directive),
        }
    }

    fn emit_directive(&mut self, directive: &Directive) {
        if let Some(text) = active_directive(directive, self.accelerators) {
            self.directive_line(directive.family, text);
        }
    }

    fn directive_line(&mut self, family: PragmaFamily, text: &str) {
        let sentinel = match family {
            PragmaFamily::OpenMp => "!$omp",
            PragmaFamily::OpenAcc => "!$acc",
        };
        let words: Vec<&str> = text
            .split_whitespace()
            .map(|word| if word == "for" { "do" } else { word })
            .collect();
        self.line(&format!("{} {}", sentinel, words.join(" ")));
    }

    fn emit_return(&mut self, m: &TypedModule, values: &[ExprId]) {
        let results = self.results.clone();
        match (values, results.as_slice()) {
            ([], _) => {}
            ([value], [single]) if m.ty(*value).is_array() => {
                let ty = m.ty(*value).clone();
                self.store_array(m, single, &ty, *value, None);
            }
            ([value], [single]) => {
                let text = self.expr(m, *value);
                self.line(&format!("{} = {}", single, text));
            }
            ([value], outs) if outs.len() > 1 => {
                if let TExprKind::Call { callee, args } = &m.expr(*value).kind {
                    let call = self.call(m, callee, args, outs);
                    self.line(&format!("call {}", call));
                }
            }
            _ => {
                for (out, value) in results.iter().zip(values) {
                    let ty = m.ty(*value).clone();
                    if ty.is_array() {
                        self.store_array(m, out, &ty, *value, None);
                    } else {
                        let text = self.expr(m, *value);
                        self.line(&format!("{} = {}", out, text));
                    }
                }
            }
        }
        self.line("return");
    }

    fn emit_assign(&mut self, m: &TypedModule, target: &LValue, value: ExprId) {
        let id = target.symbol();
        let symbol = m.symbols.symbol(id);
        let ty = symbol.ty.clone();
        if let (LValue::Var(_), true) = (target, ty.is_array()) {
            let name = self.names.symbol(m, id);
            if symbol.is_argument() {
                // Dummy arguments keep the caller's allocation
                let text = self.expr(m, value);
                self.line(&format!("{} = {}", name, text));
            } else {
                self.store_array(m, &name, &ty, value, Some(id));
            }
            return;
        }
        let slot = self.lvalue(m, target);
        let value = self.expr(m, value);
        self.line(&format!("{} = {}", slot, value));
    }

    /// Assign an array value to an allocatable, allocating it with zero
    /// lower bounds. `target` is the assigned variable, if any.
    fn store_array(&mut self, m: &TypedModule, name: &str, ty: &TypeDescriptor, value: ExprId, target: Option<SymbolId>) {
        match &m.expr(value).kind {
            TExprKind::Alloc { fill, shape } => {
                let extents: Vec<String> = shape.iter().map(|&e| self.expr(m, e)).collect();
                self.allocate(name, ty, &extents);
                let initial = match fill {
                    Fill::Zeros => Some(typed_literal(ty, 0)),
                    Fill::Ones => Some(typed_literal(ty, 1)),
                    Fill::Value(fill) => Some(self.expr(m, *fill)),
                    Fill::Empty => None,
                };
                if let Some(initial) = initial {
                    self.line(&format!("{} = {}", name, initial));
                }
            }
            TExprKind::ArrayLiteral(items) => {
                let shape = m.ty(value).shape.clone();
                let extents: Vec<String> = shape
                    .iter()
                    .map(|d| match d {
                        Dim::Known(n) => format!("{}_c_int64_t", n),
                        Dim::Unknown => "0_c_int64_t".to_string(),
                    })
                    .collect();
                self.allocate(name, ty, &extents);
                let literal = self.array_literal(m, ty, items, &shape);
                self.line(&format!("{} = {}", name, literal));
            }
            _ if calls_array_function(m, value) => {
                // A function result has lower bounds of one; it is staged
                // and copied into a zero-based allocation
                let text = self.expr(m, value);
                let scratch = self.scratch(ty);
                self.line(&format!("{} = {}", scratch, text));
                let bounds: Vec<String> = (1..=ty.rank)
                    .map(|d| format!("0:size({}, {}) - 1", scratch, d))
                    .collect();
                self.line(&format!("if (allocated({})) deallocate({})", name, name));
                self.line(&format!("allocate({}({}))", name, bounds.join(", ")));
                self.line(&format!("{} = {}", name, scratch));
            }
            _ => {
                let text = self.expr(m, value);
                if target.map_or(true, |id| !references(m, value, id)) {
                    let extents = self.extents(m, value);
                    self.allocate(name, ty, &extents);
                }
                self.line(&format!("{} = {}", name, text));
            }
        }
    }

    /// (Re)allocate an array with zero lower bounds; extents are in Python
    /// axis order
    fn allocate(&mut self, name: &str, ty: &TypeDescriptor, extents: &[String]) {
        let mut bounds: Vec<String> = extents.iter().map(|e| format!("0:{} - 1", e)).collect();
        if ty.order == Order::C {
            bounds.reverse();
        }
        self.line(&format!("if (allocated({})) deallocate({})", name, name));
        self.line(&format!("allocate({}({}))", name, bounds.join(", ")));
    }

    fn array_literal(&mut self, m: &TypedModule, ty: &TypeDescriptor, items: &[ExprId], shape: &[Dim]) -> String {
        let values: Vec<String> = items.iter().map(|&i| self.expr(m, i)).collect();
        let constructor = format!("[{} :: {}]", f_type(ty), values.join(", "));
        if shape.len() < 2 {
            return constructor;
        }
        let mut dims: Vec<String> = shape
            .iter()
            .map(|d| match d {
                Dim::Known(n) => n.to_string(),
                Dim::Unknown => "0".to_string(),
            })
            .collect();
        match ty.order {
            // Reversed dimensions filled column-major are row-major
            Order::C => {
                dims.reverse();
                format!("reshape({}, [{}])", constructor, dims.join(", "))
            }
            Order::F => {
                let order: Vec<String> = (1..=dims.len()).rev().map(|d| d.to_string()).collect();
                format!("reshape({}, [{}], order=[{}])", constructor, dims.join(", "), order.join(", "))
            }
        }
    }

    /// Extents of an array-valued expression, in Python axis order
    fn extents(&mut self, m: &TypedModule, id: ExprId) -> Vec<String> {
        let ty = m.ty(id).clone();
        match &m.expr(id).kind {
            TExprKind::Index { indices, .. } => {
                let mut extents = Vec::new();
                for item in indices {
                    if let IndexItem::Slice { lower, upper, step } = item {
                        let lower = self.expr(m, *lower);
                        let upper = self.expr(m, *upper);
                        let extent = match step {
                            Some(step) => {
                                let step = self.expr(m, *step);
                                format!("max(0_c_int64_t, ({} - {} + {} - 1) / {})", upper, lower, step, step)
                            }
                            None => format!("max(0_c_int64_t, {} - {})", upper, lower),
                        };
                        extents.push(extent);
                    }
                }
                extents
            }
            TExprKind::Binary { left, right, .. } => {
                if m.ty(*left).is_array() {
                    self.extents(m, *left)
                } else {
                    self.extents(m, *right)
                }
            }
            TExprKind::Unary { operand: inner, .. } | TExprKind::Cast(inner) | TExprKind::Math { arg: inner, .. } => {
                self.extents(m, *inner)
            }
            TExprKind::Reduce { value, axis: Some(axis), .. } => {
                let mut extents = self.extents(m, *value);
                if *axis < extents.len() {
                    extents.remove(*axis);
                }
                extents
            }
            TExprKind::Alloc { shape, .. } => shape.iter().map(|&e| self.expr(m, e)).collect(),
            _ => {
                let text = self.expr(m, id);
                (0..ty.rank)
                    .map(|axis| format!("size({}, {}, c_int64_t)", text, fortran_dim(&ty, axis)))
                    .collect()
            }
        }
    }

    fn lvalue(&mut self, m: &TypedModule, target: &LValue) -> String {
        match target {
            LValue::Var(id) => self.names.symbol(m, *id),
            LValue::Element { base, indices } => {
                let ty = m.symbols.symbol(*base).ty.clone();
                let name = self.names.symbol(m, *base);
                let subscripts = self.subscripts(m, &ty, indices);
                format!("{}({})", name, subscripts)
            }
        }
    }

    fn subscripts(&mut self, m: &TypedModule, ty: &TypeDescriptor, indices: &[IndexItem]) -> String {
        let mut parts = Vec::with_capacity(indices.len());
        for (axis, item) in indices.iter().enumerate() {
            let part = match item {
                IndexItem::Scalar(index) => self.expr(m, *index),
                IndexItem::Slice { lower, upper, step } => {
                    let whole = m.literal_int(*lower) == Some(0)
                        && step.is_none()
                        && matches!(m.expr(*upper).kind, TExprKind::Shape { axis: a, .. } if a == axis);
                    if whole {
                        ":".to_string()
                    } else {
                        let lower = self.expr(m, *lower);
                        let upper = self.expr(m, *upper);
                        match step {
                            Some(step) => format!("{}:{} - 1:{}", lower, upper, self.expr(m, *step)),
                            None => format!("{}:{} - 1", lower, upper),
                        }
                    }
                }
            };
            parts.push(part);
        }
        if ty.order == Order::C {
            parts.reverse();
        }
        parts.join(", ")
    }

    // ----- expressions -----

    fn expr(&mut self, m: &TypedModule, id: ExprId) -> String {
        let node = m.expr(id);
        match &node.kind {
            TExprKind::Int(value) => int_literal(*value),
            TExprKind::Float(value) => float_literal(*value, "c_double"),
            TExprKind::Complex { re, im } => {
                format!("({}, {})", float_literal(*re, "c_double"), float_literal(*im, "c_double"))
            }
            TExprKind::Bool(value) => if *value { ".true._c_bool" } else { ".false._c_bool" }.to_string(),
            TExprKind::Str(text) => format!("'{}'", text.replace('\'', "''")),
            TExprKind::Var(symbol) => self.names.symbol(m, *symbol),
            TExprKind::Binary { left, op, right } => {
                let operand = m.ty(*left).element();
                let left = self.expr(m, *left);
                let right = self.expr(m, *right);
                self.binary_text(*op, left, right, &operand)
            }
            TExprKind::Unary { op, operand } => {
                let operand = self.expr(m, *operand);
                match op {
                    UnaryOp::Neg => format!("(-{})", operand),
                    UnaryOp::Pos => operand,
                    UnaryOp::Not => format!("(.not. {})", operand),
                    UnaryOp::Invert => format!("not({})", operand),
                }
            }
            TExprKind::Cast(inner) => {
                let source = m.ty(*inner).element();
                let text = self.expr(m, *inner);
                cast_text(&text, &source, &node.ty)
            }
            TExprKind::Call { callee, args } => self.call(m, callee, args, &[]),
            TExprKind::Math { func, arg } => {
                let text = self.expr(m, *arg);
                match func {
                    MathFunc::Floor | MathFunc::Ceil => format!(
                        "real({}({}, c_int64_t), {})",
                        if *func == MathFunc::Floor { "floor" } else { "ceiling" },
                        text,
                        kind(&node.ty)
                    ),
                    _ => format!("{}({})", func.name(), text),
                }
            }
            TExprKind::MinMax { op, args } => {
                let texts: Vec<String> = args.iter().map(|&a| self.expr(m, a)).collect();
                format!("{}({})", op.name(), texts.join(", "))
            }
            TExprKind::Reduce { op, value, axis } => {
                let array = m.ty(*value).clone();
                let text = self.expr(m, *value);
                let dim = axis.map(|a| format!(", dim={}", fortran_dim(&array, a))).unwrap_or_default();
                match (op, array.kind) {
                    (Reduction::Sum, BaseKind::Bool) => format!("count({}{}, kind=c_int64_t)", text, dim),
                    (Reduction::Sum, BaseKind::Int) if array.precision < 64 => {
                        format!("sum(int({}, c_int64_t){})", text, dim)
                    }
                    (Reduction::Sum, _) => format!("sum({}{})", text, dim),
                    (Reduction::Max, BaseKind::Bool) => format!("any({}{})", text, dim),
                    (Reduction::Min, BaseKind::Bool) => format!("all({}{})", text, dim),
                    (Reduction::Max, _) => format!("maxval({}{})", text, dim),
                    (Reduction::Min, _) => format!("minval({}{})", text, dim),
                }
            }
            TExprKind::Index { base, indices } => {
                let ty = m.ty(*base).clone();
                let name = self.expr(m, *base);
                let subscripts = self.subscripts(m, &ty, indices);
                format!("{}({})", name, subscripts)
            }
            TExprKind::Shape { base, axis } => {
                let ty = m.ty(*base).clone();
                let name = self.expr(m, *base);
                format!("size({}, {}, c_int64_t)", name, fortran_dim(&ty, *axis))
            }
            TExprKind::Size(base) => {
                let name = self.expr(m, *base);
                format!("size({}, kind=c_int64_t)", name)
            }
            TExprKind::ArrayLiteral(items) => {
                let shape = node.ty.shape.clone();
                let ty = node.ty.clone();
                self.array_literal(m, &ty, items, &shape)
            }
            TExprKind::Alloc { fill, .. } => {
                // Only reachable through array expressions; allocation itself
                // happens at the assignment
                match fill {
                    Fill::Value(value) => self.expr(m, *value),
                    Fill::Ones => typed_literal(&node.ty, 1),
                    Fill::Zeros | Fill::Empty => typed_literal(&node.ty, 0),
                }
            }
            TExprKind::Tuple(items) => {
                let items: Vec<String> = items.iter().map(|&i| self.expr(m, i)).collect();
                items.join(", ")
            }
            TExprKind::Ternary { test, body, orelse } => {
                let test = self.expr(m, *test);
                let body = self.expr(m, *body);
                let orelse = self.expr(m, *orelse);
                format!("merge({}, {}, {})", body, orelse, test)
            }
        }
    }

    fn binary_text(&mut self, op: BinaryOp, left: String, right: String, operand: &TypeDescriptor) -> String {
        let logical = operand.kind == BaseKind::Bool;
        match op {
            BinaryOp::FloorDiv => format!("(({} - modulo({}, {})) / {})", left, left, right, right),
            BinaryOp::Mod => format!("modulo({}, {})", left, right),
            BinaryOp::Pow => format!("({} ** {})", left, right),
            BinaryOp::And => format!("({} .and. {})", left, right),
            BinaryOp::Or => format!("({} .or. {})", left, right),
            BinaryOp::BitAnd if logical => format!("({} .and. {})", left, right),
            BinaryOp::BitOr if logical => format!("({} .or. {})", left, right),
            BinaryOp::BitXor if logical => format!("({} .neqv. {})", left, right),
            BinaryOp::BitAnd => format!("iand({}, {})", left, right),
            BinaryOp::BitOr => format!("ior({}, {})", left, right),
            BinaryOp::BitXor => format!("ieor({}, {})", left, right),
            BinaryOp::Shl => format!("shiftl({}, int({}))", left, right),
            BinaryOp::Shr => format!("shifta({}, int({}))", left, right),
            BinaryOp::Eq if logical => format!("({} .eqv. {})", left, right),
            BinaryOp::NotEq if logical => format!("({} .neqv. {})", left, right),
            _ if logical && op.is_comparison() => format!(
                "(merge(1, 0, {}) {} merge(1, 0, {}))",
                left,
                fortran_operator(op),
                right
            ),
            _ => format!("({} {} {})", left, fortran_operator(op), right),
        }
    }

    fn call(&mut self, m: &TypedModule, callee: &Callee, args: &[ExprId], outs: &[String]) -> String {
        let name = match callee {
            Callee::Local(fid) => self.names.function(&m.function(*fid).mangled),
            Callee::External { symbol, .. } => self.names.external(symbol),
        };
        let mut texts: Vec<String> = args.iter().map(|&a| self.expr(m, a)).collect();
        texts.extend(outs.iter().cloned());
        format!("{}({})", name, texts.join(", "))
    }

    // ----- output -----

    /// Write one statement, continuing it with `&` when it is too long
    fn line(&mut self, s: &str) {
        let pieces = if s.starts_with('!') {
            vec![s.to_string()]
        } else {
            split_line(s, LINE_WIDTH.saturating_sub(self.indent * 2))
        };
        let last = pieces.len() - 1;
        for (index, piece) in pieces.iter().enumerate() {
            self.write_indent();
            if index > 0 {
                self.output.push_str("    & ");
            }
            self.output.push_str(piece);
            if index < last {
                self.output.push_str(" &");
            }
            self.newline();
        }
    }

    fn newline(&mut self) {
        self.output.push('\n');
    }

    fn write_indent(&mut self) {
        for _ in 0..self.indent {
            self.output.push_str("  ");
        }
    }
}

impl Default for FortranEmitter {
    fn default() -> Self {
        Self::new()
    }
}

impl Backend for FortranEmitter {
    fn language(&self) -> Language {
        Language::Fortran
    }

    fn supports(&self, capability: Capability) -> bool {
        !matches!(capability, Capability::StringVariables | Capability::ExpressionSubscripts)
    }

    fn emit(&mut self, module: &TypedModule, names: &NameTable, accelerators: Accelerators) -> Vec<GeneratedFile> {
        self.accelerators = accelerators;
        self.names = names.clone();
        self.output.clear();
        self.indent = 0;
        self.loop_depth = 0;
        // Header interface modules are compiled too: `use` needs their .mod
        if module.is_header {
            return vec![GeneratedFile {
                name: format!("{}.f90", module.name),
                kind: FileKind::Source,
                contents: self.emit_interfaces(module),
            }];
        }
        vec![GeneratedFile {
            name: format!("{}.f90", module.name),
            kind: FileKind::Source,
            contents: self.emit_module(module),
        }]
    }
}

fn collect_discarded(m: &TypedModule, stmts: &[TStmt], types: &mut Vec<TypeDescriptor>) {
    for stmt in stmts {
        match &stmt.kind {
            TStmtKind::Expr(value) => {
                let ty = m.ty(*value);
                if matches!(m.expr(*value).kind, TExprKind::Call { .. }) && ty.kind != BaseKind::Void {
                    types.push(ty.clone());
                }
            }
            TStmtKind::Assign { value, .. } if m.ty(*value).is_array() && calls_array_function(m, *value) => {
                types.push(m.ty(*value).clone());
            }
            TStmtKind::Return(values) => {
                for &value in values {
                    if m.ty(value).is_array() && calls_array_function(m, value) {
                        types.push(m.ty(value).clone());
                    }
                }
            }
            TStmtKind::If { branches, orelse } => {
                for (_, body) in branches {
                    collect_discarded(m, body, types);
                }
                collect_discarded(m, orelse, types);
            }
            TStmtKind::For { body, .. } | TStmtKind::While { body, .. } => collect_discarded(m, body, types),
            _ => {}
        }
    }
}

/// Deepest nesting of range loops in a body
fn loop_nesting(stmts: &[TStmt]) -> usize {
    stmts
        .iter()
        .map(|stmt| match &stmt.kind {
            TStmtKind::For { body, .. } => 1 + loop_nesting(body),
            TStmtKind::While { body, .. } => loop_nesting(body),
            TStmtKind::If { branches, orelse } => branches
                .iter()
                .map(|(_, body)| loop_nesting(body))
                .chain(std::iter::once(loop_nesting(orelse)))
                .max()
                .unwrap_or(0),
            _ => 0,
        })
        .max()
        .unwrap_or(0)
}

/// Whether the expression calls a function returning an array
fn calls_array_function(m: &TypedModule, id: ExprId) -> bool {
    let mut found = false;
    m.walk_expr(id, &mut |node| {
        let node = m.expr(node);
        found |= matches!(node.kind, TExprKind::Call { .. }) && node.ty.is_array();
    });
    found
}

fn scratch_type(ty: &TypeDescriptor) -> String {
    format!("{}/{}", f_type(ty), ty.rank)
}

/// Whether `symbol` appears anywhere in the expression
fn references(m: &TypedModule, id: ExprId, symbol: SymbolId) -> bool {
    let mut found = false;
    m.walk_expr(id, &mut |node| {
        if let TExprKind::Var(var) = m.expr(node).kind {
            found |= var == symbol;
        }
    });
    found
}

/// Split a statement at commas or spaces outside string literals
fn split_line(text: &str, width: usize) -> Vec<String> {
    if text.len() <= width || width < 20 {
        return vec![text.to_string()];
    }
    let mut pieces = Vec::new();
    let mut start = 0;
    let mut last_break = None;
    let mut quoted = false;
    for (index, c) in text.char_indices() {
        match c {
            '\'' | '"' => quoted = !quoted,
            ',' | ' ' if !quoted => last_break = Some(index + 1),
            _ => {}
        }
        if index - start >= width {
            if let Some(cut) = last_break.filter(|&b| b > start) {
                pieces.push(text[start..cut].trim_end().to_string());
                start = cut;
                last_break = None;
            }
        }
    }
    pieces.push(text[start..].trim_start().to_string());
    pieces
}

/// Fortran dimension (1-based) holding Python axis `axis`
fn fortran_dim(ty: &TypeDescriptor, axis: usize) -> usize {
    match ty.order {
        Order::C => ty.rank - axis,
        Order::F => axis + 1,
    }
}

fn kind(ty: &TypeDescriptor) -> &'static str {
    match ty.dtype() {
        Some(Dtype::Bool) => "c_bool",
        Some(Dtype::Int8) => "c_int8_t",
        Some(Dtype::Int16) => "c_int16_t",
        Some(Dtype::Int32) => "c_int32_t",
        Some(Dtype::Int64) | None => "c_int64_t",
        Some(Dtype::Float32) => "c_float",
        Some(Dtype::Float64) => "c_double",
        Some(Dtype::Complex64) => "c_float_complex",
        Some(Dtype::Complex128) => "c_double_complex",
    }
}

/// Kind of the real parts of a float or complex type
fn real_kind(ty: &TypeDescriptor) -> &'static str {
    match (ty.kind, ty.precision) {
        (BaseKind::Complex, 64) | (BaseKind::Float, 32) => "c_float",
        _ => "c_double",
    }
}

pub(super) fn f_type(ty: &TypeDescriptor) -> String {
    let base = match ty.kind {
        BaseKind::Bool => "logical",
        BaseKind::Int => "integer",
        BaseKind::Float => "real",
        BaseKind::Complex => "complex",
        _ => return "character(len=:), allocatable".to_string(),
    };
    format!("{}({})", base, kind(ty))
}

fn deferred_shape(rank: usize) -> String {
    vec![":"; rank].join(",")
}

fn assumed_shape(rank: usize) -> String {
    vec!["0:"; rank].join(",")
}

fn typed_literal(ty: &TypeDescriptor, value: i64) -> String {
    match ty.kind {
        BaseKind::Bool => if value != 0 { ".true._c_bool" } else { ".false._c_bool" }.to_string(),
        BaseKind::Float => format!("{}.0_{}", value, kind(ty)),
        BaseKind::Complex => {
            let real = real_kind(ty);
            format!("({}.0_{}, 0.0_{})", value, real, real)
        }
        _ => format!("{}_{}", value, kind(ty)),
    }
}

fn cast_text(text: &str, source: &TypeDescriptor, target: &TypeDescriptor) -> String {
    if source.kind == BaseKind::Bool && target.kind != BaseKind::Bool {
        return format!("merge({}, {}, {})", typed_literal(target, 1), typed_literal(target, 0), text);
    }
    match target.kind {
        BaseKind::Bool => format!("({} /= 0)", text),
        BaseKind::Int => format!("int({}, {})", text, kind(target)),
        BaseKind::Float => format!("real({}, {})", text, kind(target)),
        BaseKind::Complex => format!("cmplx({}, kind={})", text, real_kind(target)),
        _ => text.to_string(),
    }
}

fn fortran_operator(op: BinaryOp) -> &'static str {
    match op {
        BinaryOp::Eq => "==",
        BinaryOp::NotEq => "/=",
        BinaryOp::Lt => "<",
        BinaryOp::LtE => "<=",
        BinaryOp::Gt => ">",
        BinaryOp::GtE => ">=",
        other => other.symbol(),
    }
}

fn int_literal(value: i64) -> String {
    if value == i64::MIN {
        "(-9223372036854775807_c_int64_t - 1_c_int64_t)".to_string()
    } else {
        format!("{}_c_int64_t", value)
    }
}

fn float_literal(value: f64, kind: &str) -> String {
    if value.is_finite() {
        let text = format!("{:?}", value);
        let text = if text.contains(['.', 'e']) { text } else { format!("{}.0", text) };
        format!("{}_{}", text, kind)
    } else if value.is_nan() {
        format!("ieee_value(0.0_{}, ieee_quiet_nan)", kind)
    } else {
        format!("huge(0.0_{})", kind)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::diagnostics::DiagnosticReporter;
    use crate::parser::parse_source;
    use crate::semantic::{analyze, SearchPathResolver};

    fn emit_with(source: &str, accelerators: Accelerators) -> String {
        let mut reporter = DiagnosticReporter::new("m.py", source);
        let ast = parse_source(source, &mut reporter);
        let mut resolver = SearchPathResolver::new(Vec::new());
        let module = analyze(&ast, "m", false, &mut resolver, &mut reporter)
            .unwrap_or_else(|| panic!("{:?}", reporter.diagnostics()));
        let names = NameTable::new(&module, Language::Fortran);
        FortranEmitter::new().emit(&module, &names, accelerators).remove(0).contents
    }

    fn emit(source: &str) -> String {
        emit_with(source, Accelerators::default())
    }

    #[test]
    fn procedures_use_zero_based_assumed_shape() {
        let f90 = emit("\
def array_max(a: 'float[:]') -> float:
    m = a[0]
    for i in range(1, len(a)):
        if a[i] > m:
            m = a[i]
    return m
");
        assert!(f90.contains("recursive function array_max(a) result(pyaot_result)"), "{}", f90);
        assert!(f90.contains("real(c_double), intent(in) :: a(0:)"));
        assert!(f90.contains("integer(c_int64_t) :: pyaot_i0\n"), "{}", f90);
        assert!(
            f90.contains("do pyaot_i0 = 1_c_int64_t, size(a, 1, c_int64_t) - 1\n      i = pyaot_i0\n"),
            "{}",
            f90
        );
        assert!(f90.contains("pyaot_result = m"));
    }

    #[test]
    fn c_ordered_arrays_reverse_their_subscripts() {
        let f90 = emit("\
def trace(a: 'float[:,:]') -> float:
    t = 0.0
    for i in range(a.shape[0]):
        t += a[i, i + 1]
    return t
");
        assert!(f90.contains("size(a, 2, c_int64_t)"), "{}", f90);
        assert!(f90.contains("a((i + 1_c_int64_t), i)"), "{}", f90);
    }

    #[test]
    fn slices_become_sections() {
        let f90 = emit("\
def double_head(a: 'float[:]', b: 'float[:]'):
    b[:] = a[0:2] * 2.0
");
        assert!(f90.contains("b(:) = (a(0_c_int64_t:2_c_int64_t - 1) * 2.0_c_double)"), "{}", f90);
        assert!(f90.contains("real(c_double), intent(inout) :: b(0:)"));
    }

    #[test]
    fn python_integer_division_is_floored() {
        let f90 = emit("\
def f(a: int, b: int) -> int:
    return a // b + a % b
");
        assert!(f90.contains("(((a - modulo(a, b)) / b) + modulo(a, b))"), "{}", f90);
    }

    #[test]
    fn module_arrays_are_allocatable_targets() {
        let f90 = emit("\
import numpy as np
a = np.array([1, 2, 3, 4, 5])
");
        assert!(f90.contains("integer(c_int64_t), allocatable, target :: a(:)"), "{}", f90);
        assert!(f90.contains("allocate(a(0:5_c_int64_t - 1))"));
        assert!(f90.contains("a = [integer(c_int64_t) :: 1_c_int64_t, 2_c_int64_t"));
        assert!(f90.contains("subroutine m__init()"));
    }

    #[test]
    fn loop_directives_use_fortran_spelling() {
        let source = "\
def scale(a: 'float[:]', k: float):
    #$ omp parallel for
    for i in range(len(a)):
        a[i] = a[i] * k
";
        assert!(!emit(source).contains("!$omp"));
        let accelerators = Accelerators {
            openmp: true,
            ..Accelerators::default()
        };
        let f90 = emit_with(source, accelerators);
        assert!(f90.contains("!$omp parallel do private(i)\n"), "{}", f90);
    }

    #[test]
    fn rebinding_the_loop_variable_leaves_the_counter_alone() {
        let f90 = emit("\
def shadow(n: int) -> int:
    x = 0
    for i in range(n):
        for j in range(i):
            x += j
        i = i * 2
        x += i
    return x
");
        assert!(f90.contains("integer(c_int64_t) :: pyaot_i0, pyaot_i1\n"), "{}", f90);
        assert!(f90.contains("do pyaot_i1 = 0_c_int64_t, i - 1\n"), "{}", f90);
        assert!(f90.contains("j = pyaot_i1\n"), "{}", f90);
        assert!(f90.contains("i = (i * 2_c_int64_t)"), "{}", f90);
    }

    #[test]
    fn keywords_and_case_twins_are_renamed() {
        let f90 = emit("\
def function(pure: int) -> int:
    allocate = pure + 1
    return allocate

def twins(a: int, A: int) -> int:
    return a - A
");
        assert!(f90.contains("recursive function function_(pure_) result(pyaot_result)"), "{}", f90);
        assert!(f90.contains("allocate_ = (pure_ + 1_c_int64_t)"), "{}", f90);
        assert!(f90.contains("recursive function twins(a, A_1) result(pyaot_result)"), "{}", f90);
        assert!(f90.contains("pyaot_result = (a - A_1)"), "{}", f90);
    }

    #[test]
    fn array_results_are_allocatable() {
        let f90 = emit("\
import numpy as np

def twice(a: 'float[:]'):
    b = a * 2.0
    return b

def total(a: 'float[:]') -> float:
    c = twice(a)
    return np.sum(c)
");
        assert!(f90.contains("real(c_double), allocatable :: pyaot_result(:)"), "{}", f90);
        assert!(f90.contains("allocate(pyaot_result(0:size(b, 1, c_int64_t) - 1))"), "{}", f90);
        assert!(f90.contains("real(c_double), allocatable :: pyaot_discard0(:)"), "{}", f90);
        assert!(f90.contains("pyaot_discard0 = twice(a)\n"), "{}", f90);
        assert!(f90.contains("allocate(c(0:size(pyaot_discard0, 1) - 1))"), "{}", f90);
    }

    #[test]
    fn long_statements_are_continued() {
        let text = format!("x = {}", vec!["1_c_int64_t"; 20].join(" + "));
        let pieces = split_line(&text, 60);
        assert!(pieces.len() > 1);
        assert!(pieces.iter().all(|p| p.len() <= 72), "{:?}", pieces);
        assert_eq!(pieces.join(" ").replace("  ", " "), text);
    }
}

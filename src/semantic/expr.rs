//! Expression typing: literals, names, operators, subscripts and calls.

use super::analyzer::{Analyzer, ModuleMember};
use super::builtins::{self, Intrinsic, Member};
use super::resolver::HeaderModule;
use super::symbol_table::SymbolRole;
use super::tast::*;
use super::types::{dtype_from_name, BaseKind, Dim, Order, Storage, TypeDescriptor};
use crate::diagnostics::{codes, Diagnostic};
use crate::parser::{BinaryOp, Expr, ExprKind, Keyword, Span, SubscriptItem, UnaryOp};
use std::rc::Rc;

enum CallTarget {
    Intrinsic(Intrinsic),
    Dtype(TypeDescriptor),
    Local(String),
    Header(Rc<HeaderModule>, String),
}

impl<'a> Analyzer<'a> {
    pub(super) fn push(&mut self, kind: TExprKind, ty: TypeDescriptor, span: Span) -> ExprId {
        self.module.exprs.push(TypedExpr { kind, ty, span })
    }

    pub(super) fn int_literal(&mut self, value: i64, span: Span) -> ExprId {
        self.push(TExprKind::Int(value), TypeDescriptor::int(), span)
    }

    /// Convert the elements of `id` to the element type of `target`
    pub(super) fn cast(&mut self, id: ExprId, target: &TypeDescriptor) -> ExprId {
        let source = self.module.ty(id).clone();
        if source.kind == target.kind && source.precision == target.precision {
            return id;
        }
        let span = self.module.expr(id).span;
        if let TExprKind::Int(value) = self.module.expr(id).kind {
            if target.kind == BaseKind::Float && target.precision == 64 {
                return self.push(TExprKind::Float(value as f64), TypeDescriptor::float(), span);
            }
        }
        let mut ty = target.element();
        ty.rank = source.rank;
        ty.shape = source.shape;
        ty.order = source.order;
        self.push(TExprKind::Cast(id), ty, span)
    }

    pub(super) fn expr(&mut self, expr: &'a Expr) -> Option<ExprId> {
        let span = expr.span;
        match &expr.kind {
            ExprKind::Int(value) => Some(self.int_literal(*value, span)),
            ExprKind::Float(value) => Some(self.push(TExprKind::Float(*value), TypeDescriptor::float(), span)),
            ExprKind::Imaginary(im) => Some(self.push(
                TExprKind::Complex { re: 0.0, im: *im },
                TypeDescriptor::complex(),
                span,
            )),
            ExprKind::Str(text) => Some(self.push(TExprKind::Str(text.clone()), TypeDescriptor::str(), span)),
            ExprKind::Bool(value) => Some(self.push(TExprKind::Bool(*value), TypeDescriptor::bool(), span)),
            ExprKind::None => {
                self.unsupported("None used as a value", span);
                None
            }
            ExprKind::Ellipsis => {
                self.unsupported("ellipsis used as a value", span);
                None
            }
            ExprKind::Name(name) => self.name(name, span),
            ExprKind::Attribute { value, attr } => self.attribute(value, attr, span),
            ExprKind::Call { func, args, keywords } => self.call(func, args, keywords, span),
            ExprKind::Subscript { value, indices } => self.subscript(value, indices, span),
            ExprKind::Binary { left, op, right } => {
                let left = self.expr(left);
                let right = self.expr(right);
                self.binary(left?, *op, right?, span)
            }
            ExprKind::Unary { op, operand } => {
                let operand = self.expr(operand)?;
                self.unary(*op, operand, span)
            }
            ExprKind::IfExp { test, body, orelse } => {
                let test = self.condition(test);
                let body = self.expr(body);
                let orelse = self.expr(orelse);
                self.ternary(test?, body?, orelse?, span)
            }
            ExprKind::List(_) => self.array_literal(expr, None, Order::C),
            ExprKind::Tuple(items) => {
                let mut ids = Vec::with_capacity(items.len());
                let mut types = Vec::with_capacity(items.len());
                for item in items {
                    let id = self.expr(item)?;
                    types.push(self.module.ty(id).clone());
                    ids.push(id);
                }
                Some(self.push(TExprKind::Tuple(ids), TypeDescriptor::tuple(types), span))
            }
            ExprKind::Unsupported(construct) => {
                self.unsupported(construct.clone(), span);
                None
            }
        }
    }

    pub(super) fn condition(&mut self, expr: &'a Expr) -> Option<ExprId> {
        let id = self.expr(expr)?;
        self.to_bool(id)
    }

    fn to_bool(&mut self, id: ExprId) -> Option<ExprId> {
        let ty = self.module.ty(id).clone();
        if ty.is_scalar() && ty.is_numeric() {
            return Some(self.cast(id, &TypeDescriptor::bool()));
        }
        let span = self.module.expr(id).span;
        self.report(
            Diagnostic::error(codes::TYPE_MISMATCH, "value has no truth value").with_note(format!("found {}", ty)),
            span,
        );
        None
    }

    // ----- names and attributes -----

    fn name(&mut self, name: &str, span: Span) -> Option<ExprId> {
        if self.is_poisoned(name) {
            return None;
        }
        let Some(id) = self.module.symbols.lookup(name) else {
            if builtins::builtin(name).is_some() {
                self.unsupported(format!("builtin '{}' used as a value", name), span);
            } else {
                self.report(
                    Diagnostic::fatal(codes::UNDEFINED_NAME, "undefined name").with_symbol(name.to_string()),
                    span,
                );
                self.poison(name);
            }
            return None;
        };

        let symbol = self.module.symbols.symbol(id).clone();
        match &symbol.role {
            SymbolRole::Variable | SymbolRole::Argument | SymbolRole::Constant => {
                self.module.symbols.mark_used(id);
                Some(self.push(TExprKind::Var(id), symbol.ty, span))
            }
            SymbolRole::Imported { module, name: member } => {
                self.module.symbols.mark_used(id);
                match self.member(module, member, span)? {
                    ModuleMember::Builtin(Member::Constant(value)) => {
                        Some(self.push(TExprKind::Float(value), TypeDescriptor::float(), span))
                    }
                    ModuleMember::Header(..) if symbol.ty.is_numeric() => {
                        Some(self.push(TExprKind::Var(id), symbol.ty, span))
                    }
                    _ => {
                        self.unsupported(format!("'{}' used as a value", name), span);
                        None
                    }
                }
            }
            SymbolRole::Function | SymbolRole::Module(_) => {
                self.unsupported(format!("'{}' used as a value", name), span);
                None
            }
        }
    }

    /// Module path bound to a plain name, if any
    fn module_path(&self, expr: &Expr) -> Option<String> {
        let name = expr.as_name()?;
        let id = self.module.symbols.lookup(name)?;
        match &self.module.symbols.symbol(id).role {
            SymbolRole::Module(path) => Some(path.clone()),
            _ => None,
        }
    }

    fn attribute(&mut self, value: &'a Expr, attr: &str, span: Span) -> Option<ExprId> {
        if value.as_name().map(|n| self.is_poisoned(n)).unwrap_or(false) {
            return None;
        }
        if let Some(module) = self.module_path(value) {
            return match self.member(&module, attr, span)? {
                ModuleMember::Builtin(Member::Constant(v)) => {
                    Some(self.push(TExprKind::Float(v), TypeDescriptor::float(), span))
                }
                ModuleMember::Header(..) => {
                    self.unsupported(
                        format!("header constant '{}.{}'; import it with 'from {} import {}'", module, attr, module, attr),
                        span,
                    );
                    None
                }
                _ => {
                    self.unsupported(format!("'{}.{}' used as a value", module, attr), span);
                    None
                }
            };
        }

        let base = self.expr(value)?;
        let ty = self.module.ty(base).clone();
        match attr {
            "shape" if ty.is_array() => Some(self.shape_tuple(base, span)),
            "size" if ty.is_array() => Some(self.push(TExprKind::Size(base), TypeDescriptor::int(), span)),
            _ => {
                self.unsupported(format!("attribute '{}' of {}", attr, ty), span);
                None
            }
        }
    }

    fn shape_tuple(&mut self, base: ExprId, span: Span) -> ExprId {
        let rank = self.module.ty(base).rank;
        let items: Vec<ExprId> = (0..rank)
            .map(|axis| self.push(TExprKind::Shape { base, axis }, TypeDescriptor::int(), span))
            .collect();
        self.push(
            TExprKind::Tuple(items),
            TypeDescriptor::tuple(vec![TypeDescriptor::int(); rank]),
            span,
        )
    }

    // ----- operators -----

    pub(super) fn binary(&mut self, left: ExprId, op: BinaryOp, right: ExprId, span: Span) -> Option<ExprId> {
        let lt = self.module.ty(left).clone();
        let rt = self.module.ty(right).clone();
        match op {
            BinaryOp::MatMul => {
                self.unsupported("matrix multiplication", span);
                return None;
            }
            BinaryOp::Is | BinaryOp::IsNot => {
                self.unsupported("identity comparison", span);
                return None;
            }
            BinaryOp::And | BinaryOp::Or => {
                let left = self.to_bool(left)?;
                let right = self.to_bool(right)?;
                return Some(self.push(TExprKind::Binary { left, op, right }, TypeDescriptor::bool(), span));
            }
            _ => {}
        }

        if !lt.is_numeric() || !rt.is_numeric() {
            self.report(
                Diagnostic::error(codes::TYPE_MISMATCH, "unsupported operand types")
                    .with_symbol(op.symbol())
                    .with_note(format!("found {} and {}", lt, rt)),
                span,
            );
            return None;
        }

        let Some(mut element) = TypeDescriptor::promote(&lt.element(), &rt.element()) else {
            return None;
        };

        if op.is_comparison() {
            if lt.is_array() || rt.is_array() {
                self.unsupported("comparison of arrays", span);
                return None;
            }
            if element.kind == BaseKind::Complex && !matches!(op, BinaryOp::Eq | BinaryOp::NotEq) {
                self.report(
                    Diagnostic::error(codes::TYPE_MISMATCH, "complex numbers are not ordered").with_symbol(op.symbol()),
                    span,
                );
                return None;
            }
            let left = self.cast(left, &element);
            let right = self.cast(right, &element);
            return Some(self.push(TExprKind::Binary { left, op, right }, TypeDescriptor::bool(), span));
        }

        if lt.rank != rt.rank && lt.rank != 0 && rt.rank != 0 {
            self.report(
                Diagnostic::error(codes::RANK_MISMATCH, "operands have different ranks")
                    .with_symbol(op.symbol())
                    .with_note(format!("found {} and {}", lt, rt)),
                span,
            );
            return None;
        }
        let (rank, shape, order) = match TypeDescriptor::broadcast(&lt, &rt) {
            Ok(combined) => combined,
            Err(message) => {
                self.error(codes::SHAPE_MISMATCH, message, span);
                return None;
            }
        };

        match op {
            BinaryOp::Div if element.kind <= BaseKind::Int => element = TypeDescriptor::float(),
            BinaryOp::FloorDiv | BinaryOp::Mod if element.kind == BaseKind::Complex => {
                self.report(
                    Diagnostic::error(codes::TYPE_MISMATCH, "operator is not defined for complex numbers")
                        .with_symbol(op.symbol()),
                    span,
                );
                return None;
            }
            BinaryOp::Pow if element.kind <= BaseKind::Int => {
                if self.module.literal_int(right).map(|v| v < 0).unwrap_or(false) {
                    element = TypeDescriptor::float();
                }
            }
            _ if op.is_bitwise() => {
                if element.kind > BaseKind::Int {
                    self.report(
                        Diagnostic::error(codes::TYPE_MISMATCH, "bitwise operators need integer operands")
                            .with_symbol(op.symbol())
                            .with_note(format!("found {} and {}", lt, rt)),
                        span,
                    );
                    return None;
                }
                if matches!(op, BinaryOp::Shl | BinaryOp::Shr) && element.kind == BaseKind::Bool {
                    element = TypeDescriptor::int();
                }
            }
            _ => {}
        }
        if element.kind == BaseKind::Bool && !op.is_bitwise() {
            element = TypeDescriptor::int();
        }

        let left = self.cast(left, &element);
        let right = self.cast(right, &element);
        let mut ty = element.with_shape(shape);
        ty.rank = rank;
        ty.order = order;
        Some(self.push(TExprKind::Binary { left, op, right }, ty, span))
    }

    fn unary(&mut self, op: UnaryOp, operand: ExprId, span: Span) -> Option<ExprId> {
        let ty = self.module.ty(operand).clone();
        match op {
            UnaryOp::Not => {
                let operand = self.to_bool(operand)?;
                Some(self.push(TExprKind::Unary { op, operand }, TypeDescriptor::bool(), span))
            }
            UnaryOp::Neg | UnaryOp::Pos | UnaryOp::Invert => {
                let valid = match op {
                    UnaryOp::Invert => matches!(ty.kind, BaseKind::Bool | BaseKind::Int),
                    _ => ty.is_numeric(),
                };
                if !valid {
                    self.report(
                        Diagnostic::error(codes::TYPE_MISMATCH, "bad operand type for unary operator")
                            .with_symbol(op.symbol().trim())
                            .with_note(format!("found {}", ty)),
                        span,
                    );
                    return None;
                }
                let operand = if ty.kind == BaseKind::Bool {
                    self.cast(operand, &TypeDescriptor::int())
                } else {
                    operand
                };
                let result = self.module.ty(operand).clone();
                Some(self.push(TExprKind::Unary { op, operand }, result, span))
            }
        }
    }

    fn ternary(&mut self, test: ExprId, body: ExprId, orelse: ExprId, span: Span) -> Option<ExprId> {
        let bt = self.module.ty(body).clone();
        let ot = self.module.ty(orelse).clone();
        if !(bt.is_scalar() && ot.is_scalar()) {
            self.unsupported("conditional expression on arrays", span);
            return None;
        }
        let Some(common) = TypeDescriptor::promote(&bt, &ot) else {
            self.report(
                Diagnostic::error(codes::TYPE_MISMATCH, "branches of a conditional expression differ")
                    .with_note(format!("found {} and {}", bt, ot)),
                span,
            );
            return None;
        };
        let body = self.cast(body, &common);
        let orelse = self.cast(orelse, &common);
        Some(self.push(TExprKind::Ternary { test, body, orelse }, common, span))
    }

    // ----- subscripts -----

    fn subscript(&mut self, value: &'a Expr, indices: &'a [SubscriptItem], span: Span) -> Option<ExprId> {
        let base = self.expr(value)?;
        let base_ty = self.module.ty(base).clone();

        if base_ty.kind == BaseKind::Tuple {
            if let (TExprKind::Tuple(items), [SubscriptItem::Index(index)]) = (&self.module.expr(base).kind, indices) {
                if let ExprKind::Int(k) = index.kind {
                    let len = items.len() as i64;
                    let k = if k < 0 { len + k } else { k };
                    if (0..len).contains(&k) {
                        return Some(items[k as usize]);
                    }
                }
            }
            self.error(codes::INVALID_INDEX, "tuples can only be indexed with an integer literal in range", span);
            return None;
        }
        if !base_ty.is_array() {
            self.report(
                Diagnostic::error(codes::INVALID_INDEX, "cannot index a scalar").with_note(format!("found {}", base_ty)),
                value.span,
            );
            return None;
        }

        let (items, rank) = self.index_items(base, &base_ty, indices, span)?;
        let ty = if rank == 0 {
            base_ty.element()
        } else {
            base_ty.element().array(rank, base_ty.order)
        };
        Some(self.push(TExprKind::Index { base, indices: items }, ty, span))
    }

    /// Type and normalise subscript items. Returns the items and the rank
    /// of the selection.
    pub(super) fn index_items(
        &mut self,
        base: ExprId,
        base_ty: &TypeDescriptor,
        indices: &'a [SubscriptItem],
        span: Span,
    ) -> Option<(Vec<IndexItem>, usize)> {
        if indices.len() != base_ty.rank {
            self.report(
                Diagnostic::error(
                    codes::INVALID_INDEX,
                    format!("expected {} indices, found {}", base_ty.rank, indices.len()),
                ),
                span,
            );
            return None;
        }

        let mut items = Vec::with_capacity(indices.len());
        let mut rank = 0;
        for (axis, item) in indices.iter().enumerate() {
            match item {
                SubscriptItem::Index(index) => {
                    let id = self.index_value(index)?;
                    items.push(IndexItem::Scalar(self.wrap_negative(base, axis, id)));
                }
                SubscriptItem::Slice { lower, upper, step } => {
                    let step = match step {
                        Some(step) => {
                            let id = self.index_value(step)?;
                            match self.module.literal_int(id) {
                                Some(value) if value <= 0 => {
                                    self.unsupported("slice with a non-positive step", step.span);
                                    return None;
                                }
                                Some(1) => None,
                                _ => Some(id),
                            }
                        }
                        None => None,
                    };
                    let lower = match lower {
                        Some(lower) => {
                            let id = self.index_value(lower)?;
                            self.wrap_negative(base, axis, id)
                        }
                        None => self.int_literal(0, span),
                    };
                    let upper = match upper {
                        Some(upper) => {
                            let id = self.index_value(upper)?;
                            self.wrap_negative(base, axis, id)
                        }
                        None => self.push(TExprKind::Shape { base, axis }, TypeDescriptor::int(), span),
                    };
                    items.push(IndexItem::Slice { lower, upper, step });
                    rank += 1;
                }
            }
        }
        Some((items, rank))
    }

    fn index_value(&mut self, expr: &'a Expr) -> Option<ExprId> {
        let id = self.expr(expr)?;
        let ty = self.module.ty(id);
        if ty.is_scalar() && ty.kind == BaseKind::Int {
            return Some(id);
        }
        let found = ty.to_string();
        self.report(
            Diagnostic::error(codes::INVALID_INDEX, "indices must be integers").with_note(format!("found {}", found)),
            expr.span,
        );
        None
    }

    /// `a[-k]` reads `a[n - k]`
    fn wrap_negative(&mut self, base: ExprId, axis: usize, index: ExprId) -> ExprId {
        match self.module.literal_int(index) {
            Some(value) if value < 0 => {
                let span = self.module.expr(index).span;
                let extent = self.push(TExprKind::Shape { base, axis }, TypeDescriptor::int(), span);
                let offset = self.int_literal(-value, span);
                self.push(
                    TExprKind::Binary { left: extent, op: BinaryOp::Sub, right: offset },
                    TypeDescriptor::int(),
                    span,
                )
            }
            _ => index,
        }
    }

    // ----- calls -----

    fn call(&mut self, func: &'a Expr, args: &'a [Expr], keywords: &'a [Keyword], span: Span) -> Option<ExprId> {
        match self.call_target(func)? {
            CallTarget::Intrinsic(intrinsic) => self.intrinsic(intrinsic, args, keywords, span),
            CallTarget::Dtype(ty) => {
                let params = self.arguments("dtype conversion", args, keywords, &["x"], 1, span)?;
                self.conversion(ty, params[0]?, span)
            }
            CallTarget::Local(name) => self.local_call(&name, args, keywords, span),
            CallTarget::Header(header, name) => self.header_call(&header, &name, args, keywords, span),
        }
    }

    fn call_target(&mut self, func: &Expr) -> Option<CallTarget> {
        match &func.kind {
            ExprKind::Name(name) => {
                if self.is_poisoned(name) {
                    return None;
                }
                let Some(id) = self.module.symbols.lookup(name) else {
                    return match builtins::builtin(name) {
                        Some(intrinsic) => Some(CallTarget::Intrinsic(intrinsic)),
                        None => {
                            self.report(
                                Diagnostic::fatal(codes::UNDEFINED_FUNCTION, "undefined function")
                                    .with_symbol(name.clone()),
                                func.span,
                            );
                            self.poison(name);
                            None
                        }
                    };
                };
                match self.module.symbols.symbol(id).role.clone() {
                    SymbolRole::Function => Some(CallTarget::Local(name.clone())),
                    SymbolRole::Imported { module, name: member } => self.member_target(&module, &member, func.span),
                    _ => {
                        self.unsupported(format!("call of non-function '{}'", name), func.span);
                        None
                    }
                }
            }
            ExprKind::Attribute { value, attr } => {
                if value.as_name().map(|n| self.is_poisoned(n)).unwrap_or(false) {
                    return None;
                }
                match self.module_path(value) {
                    Some(module) => self.member_target(&module, attr, func.span),
                    None => {
                        self.unsupported(format!("method call '{}'", attr), func.span);
                        None
                    }
                }
            }
            _ => {
                self.unsupported("call of a computed function", func.span);
                None
            }
        }
    }

    fn member_target(&mut self, module: &str, member: &str, span: Span) -> Option<CallTarget> {
        match self.member(module, member, span)? {
            ModuleMember::Builtin(Member::Function(intrinsic)) => Some(CallTarget::Intrinsic(intrinsic)),
            ModuleMember::Builtin(Member::Dtype(ty)) => Some(CallTarget::Dtype(ty)),
            ModuleMember::Header(header, name) if header.instances(&name).next().is_some() => {
                Some(CallTarget::Header(header, name))
            }
            _ => {
                self.unsupported(format!("call of non-function '{}.{}'", module, member), span);
                None
            }
        }
    }

    /// Map positional and keyword arguments onto named parameters
    fn arguments(
        &mut self,
        callee: &str,
        args: &'a [Expr],
        keywords: &'a [Keyword],
        params: &[&str],
        required: usize,
        span: Span,
    ) -> Option<Vec<Option<&'a Expr>>> {
        if args.len() > params.len() {
            self.report(
                Diagnostic::error(
                    codes::ARGUMENT_COUNT_MISMATCH,
                    format!("expected at most {} arguments, found {}", params.len(), args.len()),
                )
                .with_symbol(callee.to_string()),
                span,
            );
            return None;
        }
        let mut slots: Vec<Option<&'a Expr>> = args.iter().map(Some).collect();
        slots.resize(params.len(), None);
        for keyword in keywords {
            let Some(position) = params.iter().position(|p| *p == keyword.name) else {
                self.report(
                    Diagnostic::error(codes::ARGUMENT_COUNT_MISMATCH, "unexpected keyword argument")
                        .with_symbol(keyword.name.clone()),
                    keyword.span,
                );
                return None;
            };
            if slots[position].is_some() {
                self.report(
                    Diagnostic::error(codes::ARGUMENT_COUNT_MISMATCH, "argument given twice")
                        .with_symbol(keyword.name.clone()),
                    keyword.span,
                );
                return None;
            }
            slots[position] = Some(&keyword.value);
        }
        if let Some(missing) = slots.iter().take(required).position(Option::is_none) {
            self.report(
                Diagnostic::error(codes::ARGUMENT_COUNT_MISMATCH, "missing argument")
                    .with_symbol(format!("{}: {}", callee, params[missing])),
                span,
            );
            return None;
        }
        Some(slots)
    }

    fn local_call(&mut self, name: &str, args: &'a [Expr], keywords: &'a [Keyword], span: Span) -> Option<ExprId> {
        let instances = self.module.instances(name).to_vec();
        let first = *instances.first()?;
        let def = self.signatures[first].def;

        let param_names: Vec<&str> = def.params.iter().map(|p| p.name.as_str()).collect();
        let slots = self.arguments(name, args, keywords, &param_names, 0, span)?;
        let mut values = Vec::with_capacity(slots.len());
        for (param, slot) in def.params.iter().zip(slots) {
            let expr = match (slot, &param.default) {
                (Some(expr), _) | (None, Some(expr)) => expr,
                (None, None) => {
                    self.report(
                        Diagnostic::error(codes::ARGUMENT_COUNT_MISMATCH, "missing argument")
                            .with_symbol(format!("{}: {}", name, param.name)),
                        span,
                    );
                    return None;
                }
            };
            values.push(self.expr(expr)?);
        }

        let candidates: Vec<Vec<TypeDescriptor>> =
            instances.iter().map(|&f| self.signatures[f].params.clone()).collect();
        let (index, values) = self.select_overload(name, &candidates, values, span)?;
        let fid = instances[index];

        if self.in_pure_function() && !self.module.functions[fid].is_pure {
            self.unsupported(format!("call of impure function '{}' from a pure function", name), span);
            return None;
        }
        let results = self.function_results(fid, span)?;
        Some(self.push(
            TExprKind::Call { callee: Callee::Local(fid), args: values },
            result_type(results),
            span,
        ))
    }

    fn header_call(
        &mut self,
        header: &HeaderModule,
        name: &str,
        args: &'a [Expr],
        keywords: &'a [Keyword],
        span: Span,
    ) -> Option<ExprId> {
        if let Some(keyword) = keywords.first() {
            self.unsupported("keyword arguments to a header function", keyword.span);
            return None;
        }
        let mut values = Vec::with_capacity(args.len());
        for arg in args {
            values.push(self.expr(arg)?);
        }
        let instances: Vec<_> = header.instances(name).collect();
        let candidates: Vec<Vec<TypeDescriptor>> = instances.iter().map(|f| f.params.clone()).collect();
        let (index, values) = self.select_overload(name, &candidates, values, span)?;
        let function = instances[index];
        Some(self.push(
            TExprKind::Call {
                callee: Callee::External {
                    module: header.name.clone(),
                    symbol: function.link_name.clone(),
                },
                args: values,
            },
            result_type(function.results.clone()),
            span,
        ))
    }

    /// Pick the first instance accepting the arguments exactly, else the
    /// first accepting them after scalar widening.
    fn select_overload(
        &mut self,
        name: &str,
        candidates: &[Vec<TypeDescriptor>],
        args: Vec<ExprId>,
        span: Span,
    ) -> Option<(usize, Vec<ExprId>)> {
        let arg_types: Vec<TypeDescriptor> = args.iter().map(|&a| self.module.ty(a).clone()).collect();
        let mut chosen = None;
        for (index, params) in candidates.iter().enumerate() {
            if params.len() != arg_types.len() {
                continue;
            }
            let matches: Vec<Storage> = params.iter().zip(&arg_types).map(|(p, a)| param_match(p, a)).collect();
            if matches.contains(&Storage::Incompatible) {
                continue;
            }
            let exact = matches.iter().all(|m| *m == Storage::Exact);
            if exact {
                chosen = Some(index);
                break;
            }
            if chosen.is_none() {
                chosen = Some(index);
            }
        }

        let Some(index) = chosen else {
            let shown: Vec<String> = arg_types.iter().map(|t| t.to_string()).collect();
            let mut diagnostic = Diagnostic::error(codes::NO_MATCHING_OVERLOAD, "no matching overload")
                .with_symbol(format!("{}({})", name, shown.join(", ")));
            for params in candidates {
                let shown: Vec<String> = params.iter().map(|t| t.to_string()).collect();
                diagnostic = diagnostic.with_note(format!("candidate: {}({})", name, shown.join(", ")));
            }
            self.report(diagnostic, span);
            return None;
        };

        let converted = args
            .into_iter()
            .zip(&candidates[index])
            .map(|(arg, param)| self.cast(arg, param))
            .collect();
        Some((index, converted))
    }

    // ----- intrinsics -----

    fn intrinsic(
        &mut self,
        intrinsic: Intrinsic,
        args: &'a [Expr],
        keywords: &'a [Keyword],
        span: Span,
    ) -> Option<ExprId> {
        match intrinsic {
            Intrinsic::Range => {
                self.error(codes::UNSUPPORTED_BUILTIN, "range is only supported as a for loop iterable", span);
                None
            }
            Intrinsic::Print => {
                self.error(codes::UNSUPPORTED_BUILTIN, "print is only supported as a statement", span);
                None
            }
            Intrinsic::Len => {
                let params = self.arguments("len", args, keywords, &["obj"], 1, span)?;
                let value = self.array_argument("len", params[0]?)?;
                Some(self.push(TExprKind::Shape { base: value, axis: 0 }, TypeDescriptor::int(), span))
            }
            Intrinsic::MinMax(op) => self.min_max(op, args, keywords, span),
            Intrinsic::BuiltinSum => {
                let params = self.arguments("sum", args, keywords, &["iterable"], 1, span)?;
                let value = self.array_argument("sum", params[0]?)?;
                let axis = if self.module.ty(value).rank > 1 { Some(0) } else { None };
                self.reduction(Reduction::Sum, value, axis, span)
            }
            Intrinsic::Reduce(op) => {
                let params = self.arguments(op.name(), args, keywords, &["a", "axis"], 1, span)?;
                let value = self.array_argument(op.name(), params[0]?)?;
                let axis = match params[1] {
                    Some(axis) => Some(self.axis_argument(value, axis)?),
                    None => None,
                };
                self.reduction(op, value, axis, span)
            }
            Intrinsic::Math(func) => {
                let params = self.arguments(func.name(), args, keywords, &["x"], 1, span)?;
                let arg = self.numeric_argument(func.name(), params[0]?)?;
                self.math(func, arg, span)
            }
            Intrinsic::IntegerMath(func) => {
                let params = self.arguments(func.name(), args, keywords, &["x"], 1, span)?;
                let arg = self.numeric_argument(func.name(), params[0]?)?;
                if !self.module.ty(arg).is_scalar() {
                    self.error(codes::UNSUPPORTED_BUILTIN, "math functions take scalar arguments", span);
                    return None;
                }
                let value = self.math(func, arg, span)?;
                Some(self.cast(value, &TypeDescriptor::int()))
            }
            Intrinsic::Cast(target) => {
                let params = self.arguments("conversion", args, keywords, &["x"], 1, span)?;
                self.conversion(target.descriptor(), params[0]?, span)
            }
            Intrinsic::Complex => {
                let params = self.arguments("complex", args, keywords, &["real", "imag"], 1, span)?;
                let real = self.conversion(TypeDescriptor::complex(), params[0]?, span)?;
                let Some(imag) = params[1] else { return Some(real) };
                let imag = self.numeric_argument("complex", imag)?;
                if self.module.ty(imag).kind == BaseKind::Complex || !self.module.ty(imag).is_scalar() {
                    self.error(codes::TYPE_MISMATCH, "imaginary part must be a real scalar", span);
                    return None;
                }
                let imag = self.cast(imag, &TypeDescriptor::complex());
                let unit = self.push(TExprKind::Complex { re: 0.0, im: 1.0 }, TypeDescriptor::complex(), span);
                let scaled = self.push(
                    TExprKind::Binary { left: imag, op: BinaryOp::Mul, right: unit },
                    TypeDescriptor::complex(),
                    span,
                );
                Some(self.push(
                    TExprKind::Binary { left: real, op: BinaryOp::Add, right: scaled },
                    TypeDescriptor::complex(),
                    span,
                ))
            }
            Intrinsic::Zeros | Intrinsic::Ones | Intrinsic::Empty => {
                let params = self.arguments("array creation", args, keywords, &["shape", "dtype", "order"], 1, span)?;
                let fill = match intrinsic {
                    Intrinsic::Zeros => Fill::Zeros,
                    Intrinsic::Ones => Fill::Ones,
                    _ => Fill::Empty,
                };
                self.allocation(fill, params[0]?, params[1], params[2], None, span)
            }
            Intrinsic::Full => {
                let params = self.arguments(
                    "full",
                    args,
                    keywords,
                    &["shape", "fill_value", "dtype", "order"],
                    2,
                    span,
                )?;
                let value = self.numeric_argument("full", params[1]?)?;
                if !self.module.ty(value).is_scalar() {
                    self.error(codes::TYPE_MISMATCH, "fill value must be a scalar", span);
                    return None;
                }
                self.allocation(Fill::Value(value), params[0]?, params[2], params[3], Some(value), span)
            }
            Intrinsic::Array => {
                let params = self.arguments("array", args, keywords, &["object", "dtype", "order"], 1, span)?;
                let dtype = match params[1] {
                    Some(dtype) => Some(self.dtype_argument(dtype)?),
                    None => None,
                };
                let order = match params[2] {
                    Some(order) => self.order_argument(order)?,
                    None => Order::C,
                };
                let object = params[0]?;
                if !matches!(object.kind, ExprKind::List(_) | ExprKind::Tuple(_)) {
                    self.unsupported("array() of a non-literal value", object.span);
                    return None;
                }
                self.array_literal(object, dtype, order)
            }
            Intrinsic::Shape => {
                let params = self.arguments("shape", args, keywords, &["a"], 1, span)?;
                let value = self.array_argument("shape", params[0]?)?;
                Some(self.shape_tuple(value, span))
            }
            Intrinsic::Size => {
                let params = self.arguments("size", args, keywords, &["a"], 1, span)?;
                let value = self.array_argument("size", params[0]?)?;
                Some(self.push(TExprKind::Size(value), TypeDescriptor::int(), span))
            }
        }
    }

    fn numeric_argument(&mut self, callee: &str, expr: &'a Expr) -> Option<ExprId> {
        let id = self.expr(expr)?;
        if self.module.ty(id).is_numeric() {
            return Some(id);
        }
        let found = self.module.ty(id).to_string();
        self.report(
            Diagnostic::error(codes::TYPE_MISMATCH, "expected a numeric argument")
                .with_symbol(callee.to_string())
                .with_note(format!("found {}", found)),
            expr.span,
        );
        None
    }

    fn array_argument(&mut self, callee: &str, expr: &'a Expr) -> Option<ExprId> {
        let id = self.numeric_argument(callee, expr)?;
        if self.module.ty(id).is_array() {
            return Some(id);
        }
        self.report(
            Diagnostic::error(codes::UNSUPPORTED_BUILTIN, "expected an array argument").with_symbol(callee.to_string()),
            expr.span,
        );
        None
    }

    fn axis_argument(&mut self, value: ExprId, expr: &Expr) -> Option<usize> {
        let rank = self.module.ty(value).rank as i64;
        if let ExprKind::Int(axis) = expr.kind {
            let axis = if axis < 0 { rank + axis } else { axis };
            if (0..rank).contains(&axis) {
                return Some(axis as usize);
            }
        }
        self.error(codes::INVALID_INDEX, "axis must be an integer literal within the array rank", expr.span);
        None
    }

    fn reduction(&mut self, op: Reduction, value: ExprId, axis: Option<usize>, span: Span) -> Option<ExprId> {
        let ty = self.module.ty(value).clone();
        let mut element = ty.element();
        match op {
            Reduction::Sum if element.kind <= BaseKind::Int => element = TypeDescriptor::int(),
            Reduction::Max | Reduction::Min if element.kind == BaseKind::Complex => {
                self.report(
                    Diagnostic::error(codes::TYPE_MISMATCH, "complex numbers are not ordered").with_symbol(op.name()),
                    span,
                );
                return None;
            }
            _ => {}
        }
        let axis = axis.filter(|_| ty.rank > 1);
        let result = match axis {
            Some(axis) => {
                let mut shape = ty.shape.clone();
                shape.remove(axis);
                let mut result = element.with_shape(shape);
                result.order = ty.order;
                result
            }
            None => element,
        };
        Some(self.push(TExprKind::Reduce { op, value, axis }, result, span))
    }

    fn min_max(&mut self, op: Reduction, args: &'a [Expr], keywords: &'a [Keyword], span: Span) -> Option<ExprId> {
        if let Some(keyword) = keywords.first() {
            self.report(
                Diagnostic::error(codes::UNSUPPORTED_BUILTIN, "unsupported keyword argument")
                    .with_symbol(keyword.name.clone()),
                keyword.span,
            );
            return None;
        }
        match args {
            [] => {
                self.error(codes::ARGUMENT_COUNT_MISMATCH, format!("{} expects at least one argument", op.name()), span);
                None
            }
            [single] => {
                let value = self.array_argument(op.name(), single)?;
                if self.module.ty(value).rank > 1 {
                    self.error(codes::UNSUPPORTED_BUILTIN, "builtin min/max of a multi-dimensional array", span);
                    return None;
                }
                self.reduction(op, value, None, span)
            }
            _ => {
                let mut values = Vec::with_capacity(args.len());
                let mut common: Option<TypeDescriptor> = None;
                for arg in args {
                    let id = self.numeric_argument(op.name(), arg)?;
                    let ty = self.module.ty(id).clone();
                    if !ty.is_scalar() || ty.kind == BaseKind::Complex {
                        self.report(
                            Diagnostic::error(codes::TYPE_MISMATCH, "expected real scalar arguments")
                                .with_symbol(op.name())
                                .with_note(format!("found {}", ty)),
                            arg.span,
                        );
                        return None;
                    }
                    common = match common {
                        Some(current) => TypeDescriptor::promote(&current, &ty),
                        None => Some(ty),
                    };
                    values.push(id);
                }
                let common = common?;
                let values = values.into_iter().map(|v| self.cast(v, &common)).collect();
                Some(self.push(TExprKind::MinMax { op, args: values }, common, span))
            }
        }
    }

    fn math(&mut self, func: MathFunc, arg: ExprId, span: Span) -> Option<ExprId> {
        let ty = self.module.ty(arg).clone();
        let element = match func {
            MathFunc::Abs if ty.kind == BaseKind::Complex => TypeDescriptor::scalar(BaseKind::Float, ty.precision / 2),
            MathFunc::Abs if ty.kind == BaseKind::Bool => TypeDescriptor::int(),
            MathFunc::Abs => ty.element(),
            MathFunc::Floor | MathFunc::Ceil if ty.kind == BaseKind::Complex => {
                self.report(
                    Diagnostic::error(codes::TYPE_MISMATCH, "complex numbers have no floor").with_symbol(func.name()),
                    span,
                );
                return None;
            }
            _ if ty.kind <= BaseKind::Int => TypeDescriptor::float(),
            _ => ty.element(),
        };
        let arg = if func == MathFunc::Abs && ty.kind != BaseKind::Bool {
            arg
        } else {
            self.cast(arg, &element)
        };
        let mut result = element.with_shape(ty.shape.clone());
        result.order = ty.order;
        Some(self.push(TExprKind::Math { func, arg }, result, span))
    }

    fn conversion(&mut self, target: TypeDescriptor, expr: &'a Expr, span: Span) -> Option<ExprId> {
        let value = self.numeric_argument("conversion", expr)?;
        let ty = self.module.ty(value);
        if ty.kind == BaseKind::Complex && target.kind != BaseKind::Complex {
            let found = ty.to_string();
            self.report(
                Diagnostic::error(codes::TYPE_MISMATCH, "cannot convert a complex number")
                    .with_note(format!("found {}, target {}", found, target)),
                span,
            );
            return None;
        }
        Some(self.cast(value, &target))
    }

    fn allocation(
        &mut self,
        fill: Fill,
        shape: &'a Expr,
        dtype: Option<&'a Expr>,
        order: Option<&'a Expr>,
        fill_value: Option<ExprId>,
        span: Span,
    ) -> Option<ExprId> {
        let extents = self.shape_argument(shape)?;
        let element = match (dtype, fill_value) {
            (Some(dtype), _) => self.dtype_argument(dtype)?,
            (None, Some(value)) => self.module.ty(value).element(),
            (None, None) => TypeDescriptor::float(),
        };
        let order = match order {
            Some(order) => self.order_argument(order)?,
            None => Order::C,
        };
        let fill = match fill {
            Fill::Value(value) => Fill::Value(self.cast(value, &element)),
            other => other,
        };
        let dims = extents
            .iter()
            .map(|&e| self.module.literal_int(e).map(Dim::Known).unwrap_or(Dim::Unknown))
            .collect();
        let mut ty = element.with_shape(dims);
        if ty.rank > 1 {
            ty.order = order;
        }
        Some(self.push(TExprKind::Alloc { fill, shape: extents }, ty, span))
    }

    fn shape_argument(&mut self, expr: &'a Expr) -> Option<Vec<ExprId>> {
        let id = self.expr(expr)?;
        let items = match &self.module.expr(id).kind {
            TExprKind::Tuple(items) => items.clone(),
            _ => vec![id],
        };
        let mut extents = Vec::with_capacity(items.len());
        for item in items {
            let ty = self.module.ty(item);
            if !(ty.is_scalar() && ty.kind == BaseKind::Int) {
                let found = ty.to_string();
                self.report(
                    Diagnostic::error(codes::TYPE_MISMATCH, "shape must be an integer or a tuple of integers")
                        .with_note(format!("found {}", found)),
                    expr.span,
                );
                return None;
            }
            extents.push(self.cast(item, &TypeDescriptor::int()));
        }
        if extents.is_empty() {
            self.error(codes::TYPE_MISMATCH, "shape must not be empty", expr.span);
            return None;
        }
        Some(extents)
    }

    fn dtype_argument(&mut self, expr: &Expr) -> Option<TypeDescriptor> {
        let name = match &expr.kind {
            ExprKind::Str(text) => Some(text.clone()),
            ExprKind::Name(_) | ExprKind::Attribute { .. } => {
                expr.dotted_name().and_then(|d| d.rsplit('.').next().map(str::to_string))
            }
            _ => None,
        };
        match name.as_deref().and_then(dtype_from_name) {
            Some(ty) if ty.is_numeric() => Some(ty),
            _ => {
                self.error(codes::TYPE_MISMATCH, "unknown dtype", expr.span);
                None
            }
        }
    }

    fn order_argument(&mut self, expr: &Expr) -> Option<Order> {
        match &expr.kind {
            ExprKind::Str(text) if text == "C" => Some(Order::C),
            ExprKind::Str(text) if text == "F" => Some(Order::F),
            _ => {
                self.error(codes::TYPE_MISMATCH, "order must be 'C' or 'F'", expr.span);
                None
            }
        }
    }

    /// Nested list literal to a flat array literal with a known shape
    fn array_literal(&mut self, expr: &'a Expr, dtype: Option<TypeDescriptor>, order: Order) -> Option<ExprId> {
        let mut dims = Vec::new();
        let mut leaves = Vec::new();
        if !flatten(expr, 0, &mut dims, &mut leaves) {
            self.error(codes::SHAPE_MISMATCH, "nested lists must be rectangular", expr.span);
            return None;
        }
        if leaves.is_empty() {
            self.error(codes::TYPE_MISMATCH, "cannot infer the type of an empty list", expr.span);
            return None;
        }

        let mut values = Vec::with_capacity(leaves.len());
        let mut common: Option<TypeDescriptor> = None;
        for leaf in leaves {
            let id = self.numeric_argument("array", leaf)?;
            let ty = self.module.ty(id).clone();
            if !ty.is_scalar() {
                self.unsupported("array literal of arrays", leaf.span);
                return None;
            }
            common = match common {
                Some(current) => TypeDescriptor::promote(&current, &ty),
                None => Some(ty),
            };
            values.push(id);
        }
        let element = dtype.or(common)?;
        let values = values.into_iter().map(|v| self.cast(v, &element)).collect();
        let mut ty = element.with_shape(dims.into_iter().map(|d| Dim::Known(d as i64)).collect());
        if ty.rank > 1 {
            ty.order = order;
        }
        Some(self.push(TExprKind::ArrayLiteral(values), ty, expr.span))
    }
}

fn flatten<'e>(expr: &'e Expr, depth: usize, dims: &mut Vec<usize>, leaves: &mut Vec<&'e Expr>) -> bool {
    match &expr.kind {
        ExprKind::List(items) | ExprKind::Tuple(items) => {
            match dims.get(depth) {
                Some(&len) if len != items.len() => return false,
                Some(_) => {}
                None if depth == dims.len() && leaves.is_empty() => dims.push(items.len()),
                None => return false,
            }
            items.iter().all(|item| flatten(item, depth + 1, dims, leaves))
        }
        _ => {
            if depth != dims.len() {
                return false;
            }
            leaves.push(expr);
            true
        }
    }
}

fn param_match(param: &TypeDescriptor, arg: &TypeDescriptor) -> Storage {
    if param.is_array() || arg.is_array() {
        if param.compatible(arg) && (param.rank < 2 || param.order == arg.order) {
            Storage::Exact
        } else {
            Storage::Incompatible
        }
    } else {
        param.accepts(arg)
    }
}

fn result_type(results: Vec<TypeDescriptor>) -> TypeDescriptor {
    match results.len() {
        0 => TypeDescriptor::void(),
        1 => results.into_iter().next().unwrap_or_else(TypeDescriptor::void),
        _ => TypeDescriptor::tuple(results),
    }
}

//! Semantic analyzer: resolves names against scopes, infers types and
//! lowers the AST into the typed AST.
//!
//! Analysis runs in three passes over the module body:
//! 1. functions and imports are registered so forward references resolve,
//! 2. module-level statements are analysed in program order,
//! 3. every function instance not yet reached on demand is analysed.

use super::resolver::{expand_alternatives, mangle, ModuleResolver, ResolvedModule};
use super::symbol_table::{ScopeId, Symbol, SymbolId, SymbolRole};
use super::tast::*;
use super::types::{BaseKind, Storage, TypeDescriptor};
use super::builtins::{self, Member};
use crate::diagnostics::{codes, Diagnostic, DiagnosticReporter};
use crate::index_vec::IndexVec;
use crate::parser::{
    Annotation, BinaryOp, Expr, ExprKind, FunctionDef, ImportAlias, Module, Pragma, Span, Stmt,
    StmtKind, SubscriptItem,
};
use std::collections::{HashMap, HashSet};
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(super) enum FunctionState {
    Pending,
    InProgress,
    Done,
}

/// Parameter types of one function instance, known before its body is analysed
pub(super) struct Signature<'a> {
    pub(super) def: &'a FunctionDef,
    pub(super) params: Vec<TypeDescriptor>,
    pub(super) declared_results: Option<Vec<TypeDescriptor>>,
    pub(super) state: FunctionState,
}

/// State of the function body being analysed
struct FunctionContext {
    scope: ScopeId,
    results: Option<Vec<TypeDescriptor>>,
    locals: Vec<SymbolId>,
    is_pure: bool,
    side_effects: bool,
}

pub struct Analyzer<'a> {
    ast: &'a Module,
    reporter: &'a mut DiagnosticReporter,
    resolver: &'a mut dyn ModuleResolver,
    pub(super) module: TypedModule,
    pub(super) signatures: IndexVec<FuncId, Signature<'a>>,
    context: Option<FunctionContext>,
    loop_depth: usize,
    poisoned: HashSet<String>,
    modules: HashMap<String, ResolvedModule>,
    temp_count: usize,
}

impl<'a> Analyzer<'a> {
    pub fn new(
        ast: &'a Module,
        module_name: &str,
        is_header: bool,
        resolver: &'a mut dyn ModuleResolver,
        reporter: &'a mut DiagnosticReporter,
    ) -> Self {
        let mut module = TypedModule::new(module_name);
        module.is_header = is_header;
        Self {
            ast,
            reporter,
            resolver,
            module,
            signatures: IndexVec::new(),
            context: None,
            loop_depth: 0,
            poisoned: HashSet::new(),
            modules: HashMap::new(),
            temp_count: 0,
        }
    }

    /// Analyse the whole module. Returns no typed module when any error
    /// was reported.
    pub fn analyze(mut self) -> Option<TypedModule> {
        let ast = self.ast;
        for stmt in &ast.body {
            match &stmt.kind {
                StmtKind::FunctionDef(def) => self.register_function(def),
                StmtKind::Import(aliases) => self.import_modules(aliases),
                StmtKind::FromImport { module, names } => self.import_names(module, names),
                _ => {}
            }
        }

        let mut init = Vec::new();
        for stmt in &ast.body {
            match &stmt.kind {
                StmtKind::FunctionDef(_) | StmtKind::Import(_) | StmtKind::FromImport { .. } => {}
                _ if self.module.is_header => self.header_statement(stmt),
                _ if is_main_guard(stmt) => self.report(
                    Diagnostic::warning(codes::IGNORED_DIRECTIVE, "ignoring the main program block"),
                    stmt.span,
                ),
                _ => self.statement(stmt, &mut init),
            }
        }
        self.module.init_body = init;

        for index in 0..self.signatures.len() {
            let fid = FuncId(index as u32);
            if self.signatures[fid].state == FunctionState::Pending {
                self.analyze_function(fid);
            }
        }

        debug!(
            module = %self.module.name,
            functions = self.module.functions.len(),
            globals = self.module.globals.len(),
            "semantic analysis finished"
        );
        if self.reporter.has_errors() {
            None
        } else {
            Some(self.module)
        }
    }

    // ----- diagnostics -----

    pub(super) fn report(&mut self, diagnostic: Diagnostic, span: Span) {
        self.reporter.report(diagnostic, span.offset, span.length);
    }

    #[track_caller]
    pub(super) fn error(&mut self, code: &str, message: impl Into<String>, span: Span) {
        self.report(Diagnostic::error(code, message), span);
    }

    #[track_caller]
    pub(super) fn unsupported(&mut self, construct: impl Into<String>, span: Span) {
        self.report(
            Diagnostic::error(codes::UNSUPPORTED_CONSTRUCT, "unsupported construct").with_symbol(construct),
            span,
        );
    }

    pub(super) fn poison(&mut self, name: &str) {
        self.poisoned.insert(name.to_string());
    }

    pub(super) fn is_poisoned(&self, name: &str) -> bool {
        self.poisoned.contains(name)
    }

    // ----- registration -----

    fn register_function(&mut self, def: &'a FunctionDef) {
        if self.module.symbols.lookup_global(&def.name).is_some() {
            self.report(
                Diagnostic::error(codes::REDEFINITION, "name is already defined").with_symbol(def.name.clone()),
                def.name_span,
            );
            return;
        }

        let mut is_pure = false;
        let mut is_inline = false;
        for decorator in &def.decorators {
            match decorator.name.rsplit('.').next().unwrap_or_default() {
                "pure" => is_pure = true,
                "inline" => is_inline = true,
                _ => self.unsupported(format!("decorator '{}'", decorator.name), decorator.span),
            }
        }

        let mut annotations = Vec::with_capacity(def.params.len());
        let mut complete = true;
        for param in &def.params {
            match &param.annotation {
                Some(annotation) => annotations.push(annotation),
                None => {
                    self.report(
                        Diagnostic::error(codes::MISSING_ANNOTATION, "parameter needs a type annotation")
                            .with_symbol(param.name.clone()),
                        param.span,
                    );
                    complete = false;
                }
            }
            if let Some(default) = &param.default {
                if !is_literal(default) {
                    self.unsupported("non-literal default value", default.span);
                    complete = false;
                }
            }
        }

        let declared_results = match &def.returns {
            Some(annotation) => match self.result_types(annotation) {
                Some(results) => Some(results),
                None => {
                    complete = false;
                    None
                }
            },
            None if self.module.is_header => Some(Vec::new()),
            None => None,
        };

        let instances = match expand_alternatives(&annotations) {
            Ok(instances) if complete => instances,
            Ok(_) => {
                self.poison(&def.name);
                return;
            }
            Err(message) => {
                let span = annotations.first().map(|a| a.span).unwrap_or(def.name_span);
                self.error(codes::INVALID_ANNOTATION, message, span);
                self.poison(&def.name);
                return;
            }
        };

        let count = instances.len();
        let mut ids = Vec::with_capacity(count);
        for (index, params) in instances.into_iter().enumerate() {
            let fid = self.module.functions.push(TypedFunction {
                name: def.name.clone(),
                mangled: mangle(&def.name, index, count),
                params: Vec::new(),
                results: declared_results.clone().unwrap_or_default(),
                body: Vec::new(),
                scope: self.module.symbols.root(),
                locals: Vec::new(),
                is_pure,
                is_inline,
                is_stub: self.module.is_header,
                span: def.name_span,
            });
            self.signatures.push(Signature {
                def,
                params,
                declared_results: declared_results.clone(),
                state: FunctionState::Pending,
            });
            ids.push(fid);
        }
        self.module.overloads.push((def.name.clone(), ids));

        let symbol = Symbol::new(def.name.clone(), TypeDescriptor::void(), SymbolRole::Function, def.name_span);
        let _ = self.module.symbols.define(symbol);
    }

    fn result_types(&mut self, annotation: &Annotation) -> Option<Vec<TypeDescriptor>> {
        let [single] = annotation.alternatives.as_slice() else {
            self.error(
                codes::INVALID_ANNOTATION,
                "a return annotation cannot be a union",
                annotation.span,
            );
            return None;
        };
        match TypeDescriptor::from_annotated(single) {
            Ok(ty) if ty.kind == BaseKind::Void => Some(Vec::new()),
            Ok(mut ty) => {
                ty.is_const = false;
                Some(vec![ty])
            }
            Err(message) => {
                self.error(codes::INVALID_ANNOTATION, message, annotation.span);
                None
            }
        }
    }

    pub(super) fn single_type(&mut self, annotation: &Annotation) -> Option<TypeDescriptor> {
        let [single] = annotation.alternatives.as_slice() else {
            self.error(
                codes::INVALID_ANNOTATION,
                "a variable annotation cannot be a union",
                annotation.span,
            );
            return None;
        };
        match TypeDescriptor::from_annotated(single) {
            Ok(ty) => Some(ty),
            Err(message) => {
                self.error(codes::INVALID_ANNOTATION, message, annotation.span);
                None
            }
        }
    }

    // ----- imports -----

    pub(super) fn resolve_module(&mut self, module: &str, span: Span) -> Option<ResolvedModule> {
        if let Some(resolved) = self.modules.get(module) {
            return Some(resolved.clone());
        }
        match self.resolver.resolve(module) {
            Ok(resolved) => {
                if let ResolvedModule::Header(_) = &resolved {
                    let import = HeaderImport { module: module.to_string() };
                    if !self.module.headers.contains(&import) {
                        self.module.headers.push(import);
                    }
                }
                self.modules.insert(module.to_string(), resolved.clone());
                Some(resolved)
            }
            Err(message) => {
                self.report(
                    Diagnostic::fatal(codes::UNRESOLVED_IMPORT, message).with_symbol(module.to_string()),
                    span,
                );
                None
            }
        }
    }

    fn import_modules(&mut self, aliases: &[ImportAlias]) {
        for alias in aliases {
            let bound = alias.bound_name().to_string();
            if alias.alias.is_none() && alias.name.contains('.') {
                self.unsupported("import of a submodule without an alias", alias.span);
                self.poison(&bound);
                continue;
            }
            if self.resolve_module(&alias.name, alias.span).is_none() {
                self.poison(&bound);
                continue;
            }
            let symbol = Symbol::new(
                bound.clone(),
                TypeDescriptor::void(),
                SymbolRole::Module(alias.name.clone()),
                alias.span,
            );
            self.define_import(symbol);
        }
    }

    fn import_names(&mut self, module: &str, names: &[ImportAlias]) {
        let span = names.first().map(|n| n.span).unwrap_or_default();
        let Some(resolved) = self.resolve_module(module, span) else {
            for name in names {
                self.poison(name.bound_name());
            }
            return;
        };

        for alias in names {
            let ty = match &resolved {
                ResolvedModule::Numpy => builtins::numpy_member(&alias.name).map(member_type),
                ResolvedModule::Math => builtins::math_member(&alias.name).map(member_type),
                ResolvedModule::Header(header) => {
                    if let Some(ty) = header.constant(&alias.name) {
                        Some(ty.clone())
                    } else if header.has_member(&alias.name) {
                        Some(TypeDescriptor::void())
                    } else {
                        None
                    }
                }
            };
            let Some(ty) = ty else {
                self.report(
                    Diagnostic::fatal(codes::UNRESOLVED_IMPORT, format!("module '{}' has no member", module))
                        .with_symbol(alias.name.clone()),
                    alias.span,
                );
                self.poison(alias.bound_name());
                continue;
            };
            let role = SymbolRole::Imported {
                module: module.to_string(),
                name: alias.name.clone(),
            };
            self.define_import(Symbol::new(alias.bound_name().to_string(), ty, role, alias.span));
        }
    }

    fn define_import(&mut self, symbol: Symbol) {
        let span = symbol.span;
        let name = symbol.name.clone();
        if let Err(existing) = self.module.symbols.define(symbol.clone()) {
            // Importing the same binding twice is harmless
            if self.module.symbols.symbol(existing).role != symbol.role {
                self.report(
                    Diagnostic::error(codes::REDEFINITION, "name is already defined").with_symbol(name),
                    span,
                );
            }
        }
    }

    // ----- functions -----

    pub(super) fn analyze_function(&mut self, fid: FuncId) {
        let def = self.signatures[fid].def;
        let param_types = self.signatures[fid].params.clone();
        let declared = self.signatures[fid].declared_results.clone();
        self.signatures[fid].state = FunctionState::InProgress;
        debug!(function = %self.module.functions[fid].mangled, "analysing function");

        let root = self.module.symbols.root();
        let previous_scope = self.module.symbols.set_current(root);
        let scope = self.module.symbols.enter_function(&self.module.functions[fid].mangled.clone());

        let mut params = Vec::with_capacity(param_types.len());
        for (param, ty) in def.params.iter().zip(param_types) {
            let symbol = Symbol::new(param.name.clone(), ty, SymbolRole::Argument, param.span);
            match self.module.symbols.define(symbol) {
                Ok(id) => params.push(id),
                Err(_) => self.report(
                    Diagnostic::error(codes::REDEFINITION, "duplicate parameter").with_symbol(param.name.clone()),
                    param.span,
                ),
            }
        }

        let is_pure = self.module.functions[fid].is_pure;
        let saved_context = self.context.replace(FunctionContext {
            scope,
            results: declared,
            locals: Vec::new(),
            is_pure,
            side_effects: false,
        });
        let saved_loops = std::mem::take(&mut self.loop_depth);

        let body = if self.module.is_header {
            Vec::new()
        } else {
            self.block(&def.body)
        };

        self.loop_depth = saved_loops;
        let context = std::mem::replace(&mut self.context, saved_context);
        let (results, locals) = match context {
            Some(context) => {
                if context.is_pure && context.side_effects {
                    self.unsupported(format!("side effects in pure function '{}'", def.name), def.name_span);
                }
                (context.results.unwrap_or_default(), context.locals)
            }
            None => (Vec::new(), Vec::new()),
        };

        for unused in self.module.symbols.close(scope) {
            let symbol = self.module.symbols.symbol(unused);
            let (name, span) = (symbol.name.clone(), symbol.span);
            self.report(
                Diagnostic::warning(codes::UNUSED_VARIABLE, "unused variable").with_symbol(name),
                span,
            );
        }
        self.module.symbols.set_current(previous_scope);

        let function = &mut self.module.functions[fid];
        function.params = params;
        function.results = results;
        function.body = body;
        function.scope = scope;
        function.locals = locals;
        self.signatures[fid].state = FunctionState::Done;
    }

    /// Results of a local function instance, analysing it first if needed
    pub(super) fn function_results(&mut self, fid: FuncId, span: Span) -> Option<Vec<TypeDescriptor>> {
        match self.signatures[fid].state {
            FunctionState::Pending => {
                self.analyze_function(fid);
                Some(self.module.functions[fid].results.clone())
            }
            FunctionState::Done => Some(self.module.functions[fid].results.clone()),
            FunctionState::InProgress => match &self.signatures[fid].declared_results {
                Some(results) => Some(results.clone()),
                None => {
                    let name = self.module.functions[fid].name.clone();
                    self.report(
                        Diagnostic::error(
                            codes::RECURSIVE_INFERENCE,
                            "recursive function needs a return annotation",
                        )
                        .with_symbol(name),
                        span,
                    );
                    None
                }
            },
        }
    }

    pub(super) fn in_function(&self) -> bool {
        self.context.is_some()
    }

    pub(super) fn in_pure_function(&self) -> bool {
        self.context.as_ref().map(|c| c.is_pure).unwrap_or(false)
    }

    fn note_side_effect(&mut self) {
        if let Some(context) = self.context.as_mut() {
            context.side_effects = true;
        }
    }

    // ----- statements -----

    pub(super) fn block(&mut self, stmts: &'a [Stmt]) -> Vec<TStmt> {
        let mut out = Vec::with_capacity(stmts.len());
        for stmt in stmts {
            self.statement(stmt, &mut out);
        }
        out
    }

    fn statement(&mut self, stmt: &'a Stmt, out: &mut Vec<TStmt>) {
        let span = stmt.span;
        match &stmt.kind {
            StmtKind::FunctionDef(def) => {
                self.unsupported(format!("nested function '{}'", def.name), def.name_span)
            }
            StmtKind::Assign { target, value } => self.assignment(target, value, span, out),
            StmtKind::AnnAssign { target, annotation, value } => {
                self.annotated_assignment(target, annotation, value.as_ref(), span, out)
            }
            StmtKind::AugAssign { target, op, value } => {
                if let Some(stmt) = self.augmented_assignment(target, *op, value, span) {
                    out.push(stmt);
                }
            }
            StmtKind::Expr(expr) => self.expression_statement(expr, span, out),
            StmtKind::Return(value) => {
                if let Some(stmt) = self.return_statement(value.as_ref(), span) {
                    out.push(stmt);
                }
            }
            StmtKind::If { branches, orelse } => {
                let mut typed = Vec::with_capacity(branches.len());
                let mut valid = true;
                for (condition, body) in branches {
                    let condition = self.condition(condition);
                    let body = self.block(body);
                    match condition {
                        Some(condition) => typed.push((condition, body)),
                        None => valid = false,
                    }
                }
                let orelse = self.block(orelse);
                if valid {
                    out.push(TStmt::new(TStmtKind::If { branches: typed, orelse }, span));
                }
            }
            StmtKind::For { target, iter, body, pragma } => {
                if let Some(stmt) = self.for_statement(target, iter, body, pragma.as_ref(), span) {
                    out.push(stmt);
                }
            }
            StmtKind::While { condition, body } => {
                let condition = self.condition(condition);
                self.loop_depth += 1;
                let body = self.block(body);
                self.loop_depth -= 1;
                if let Some(condition) = condition {
                    out.push(TStmt::new(TStmtKind::While { condition, body }, span));
                }
            }
            StmtKind::Break | StmtKind::Continue => {
                if self.loop_depth == 0 {
                    let keyword = if matches!(stmt.kind, StmtKind::Break) { "break" } else { "continue" };
                    self.report(
                        Diagnostic::error(codes::OUTSIDE_LOOP, "statement outside of a loop").with_symbol(keyword),
                        span,
                    );
                } else if matches!(stmt.kind, StmtKind::Break) {
                    out.push(TStmt::new(TStmtKind::Break, span));
                } else {
                    out.push(TStmt::new(TStmtKind::Continue, span));
                }
            }
            StmtKind::Pass => out.push(TStmt::new(TStmtKind::Pass, span)),
            StmtKind::Import(aliases) => self.import_modules(aliases),
            StmtKind::FromImport { module, names } => self.import_names(module, names),
            StmtKind::Pragma(pragma) => {
                if let Some(directive) = self.standalone_directive(pragma) {
                    out.push(TStmt::new(TStmtKind::Directive(directive), span));
                }
            }
            StmtKind::Unsupported(construct) => self.unsupported(construct.clone(), span),
        }
    }

    /// Module-level statements of a header only declare variables
    fn header_statement(&mut self, stmt: &'a Stmt) {
        match &stmt.kind {
            StmtKind::AnnAssign { target, annotation, .. } => {
                let Some(name) = target.as_name() else { return };
                if let Some(ty) = self.single_type(annotation) {
                    self.define_variable(name, ty, target.span);
                }
            }
            StmtKind::Expr(expr) if matches!(expr.kind, ExprKind::Str(_) | ExprKind::Ellipsis) => {}
            StmtKind::Pass => {}
            _ => self.unsupported("executable statement in a header", stmt.span),
        }
    }

    fn standalone_directive(&mut self, pragma: &Pragma) -> Option<Directive> {
        if pragma.is_loop_directive() {
            self.report(
                Diagnostic::error(codes::INVALID_PRAGMA, "loop directive is not followed by a for loop")
                    .with_symbol(pragma.directive.clone()),
                pragma.span,
            );
            return None;
        }
        if !self.in_function() {
            self.report(
                Diagnostic::error(codes::INVALID_PRAGMA, "directives are only allowed inside functions")
                    .with_symbol(pragma.directive.clone()),
                pragma.span,
            );
            return None;
        }
        Some(Directive {
            family: pragma.family,
            text: pragma.directive.clone(),
        })
    }

    fn expression_statement(&mut self, expr: &'a Expr, span: Span, out: &mut Vec<TStmt>) {
        match &expr.kind {
            // Docstrings and stub bodies
            ExprKind::Str(_) | ExprKind::Ellipsis => {}
            ExprKind::Call { func, args, keywords } if self.names_builtin(func, "print") => {
                if let Some(keyword) = keywords.first() {
                    self.report(
                        Diagnostic::error(codes::UNSUPPORTED_BUILTIN, "unsupported print argument")
                            .with_symbol(keyword.name.clone()),
                        keyword.span,
                    );
                    return;
                }
                let mut values = Vec::with_capacity(args.len());
                for arg in args {
                    let Some(id) = self.expr(arg) else { return };
                    let ty = self.module.ty(id);
                    if !(ty.is_scalar() && (ty.is_numeric() || ty.kind == BaseKind::Str)) {
                        let found = ty.to_string();
                        self.report(
                            Diagnostic::error(codes::UNSUPPORTED_BUILTIN, "print only accepts scalars and strings")
                                .with_note(format!("found {}", found)),
                            arg.span,
                        );
                        return;
                    }
                    values.push(id);
                }
                self.note_side_effect();
                out.push(TStmt::new(TStmtKind::Print(values), span));
            }
            ExprKind::Call { .. } => {
                if let Some(id) = self.expr(expr) {
                    out.push(TStmt::new(TStmtKind::Expr(id), span));
                }
            }
            _ => {
                let _ = self.expr(expr);
            }
        }
    }

    fn return_statement(&mut self, value: Option<&'a Expr>, span: Span) -> Option<TStmt> {
        if !self.in_function() {
            self.unsupported("return outside of a function", span);
            return None;
        }

        let mut values = match value {
            None => Vec::new(),
            Some(expr) if matches!(expr.kind, ExprKind::None) => Vec::new(),
            Some(Expr { kind: ExprKind::Tuple(items), .. }) => {
                let mut values = Vec::with_capacity(items.len());
                for item in items {
                    values.push(self.expr(item)?);
                }
                values
            }
            Some(expr) => vec![self.expr(expr)?],
        };
        if let [single] = values.as_slice() {
            if let TExprKind::Tuple(items) = &self.module.expr(*single).kind {
                values = items.clone();
            }
        }

        let mut types = Vec::with_capacity(values.len());
        for &value in &values {
            let ty = self.module.ty(value).clone();
            if !(ty.is_numeric() || ty.kind == BaseKind::Str) {
                let span = self.module.expr(value).span;
                self.report(
                    Diagnostic::error(codes::RETURN_TYPE_MISMATCH, "cannot return this value")
                        .with_note(format!("found {}", ty)),
                    span,
                );
                return None;
            }
            types.push(ty);
        }

        let expected = self.context.as_ref().and_then(|c| c.results.clone());
        match expected {
            Some(expected) => {
                if expected.len() != values.len() {
                    self.report(
                        Diagnostic::error(
                            codes::RETURN_TYPE_MISMATCH,
                            format!("function returns {} value(s), found {}", expected.len(), values.len()),
                        ),
                        span,
                    );
                    return None;
                }
                for (value, slot) in values.iter_mut().zip(&expected) {
                    *value = self.store(slot, *value, false, codes::RETURN_TYPE_MISMATCH, "return")?;
                }
            }
            None => {
                if let Some(context) = self.context.as_mut() {
                    context.results = Some(
                        types
                            .into_iter()
                            .map(|mut ty| {
                                ty.is_const = false;
                                ty
                            })
                            .collect(),
                    );
                }
            }
        }
        Some(TStmt::new(TStmtKind::Return(values), span))
    }

    fn for_statement(
        &mut self,
        target: &'a Expr,
        iter: &'a Expr,
        body: &'a [Stmt],
        pragma: Option<&Pragma>,
        span: Span,
    ) -> Option<TStmt> {
        let Some(name) = target.as_name() else {
            self.unsupported("loop over several targets", target.span);
            return None;
        };
        let ExprKind::Call { func, args, keywords } = &iter.kind else {
            self.unsupported("iteration over a non-range iterable", iter.span);
            return None;
        };
        if !self.names_builtin(func, "range") {
            self.unsupported("iteration over a non-range iterable", iter.span);
            return None;
        }
        if !keywords.is_empty() {
            self.error(codes::UNSUPPORTED_BUILTIN, "range takes no keyword arguments", iter.span);
            return None;
        }
        if args.is_empty() || args.len() > 3 {
            self.report(
                Diagnostic::error(codes::ARGUMENT_COUNT_MISMATCH, "range expects 1 to 3 arguments")
                    .with_note(format!("found {}", args.len())),
                iter.span,
            );
            return None;
        }

        let mut bounds = Vec::with_capacity(3);
        for arg in args {
            let id = self.expr(arg)?;
            let ty = self.module.ty(id);
            if !(ty.is_scalar() && matches!(ty.kind, BaseKind::Int | BaseKind::Bool)) {
                let found = ty.to_string();
                self.report(
                    Diagnostic::error(codes::TYPE_MISMATCH, "range bounds must be integers")
                        .with_note(format!("found {}", found)),
                    arg.span,
                );
                return None;
            }
            bounds.push(self.cast(id, &TypeDescriptor::int()));
        }
        let (start, stop, step) = match bounds.as_slice() {
            [stop] => (self.int_literal(0, iter.span), *stop, self.int_literal(1, iter.span)),
            [start, stop] => (*start, *stop, self.int_literal(1, iter.span)),
            [start, stop, step] => (*start, *stop, *step),
            _ => return None,
        };
        if self.module.literal_int(step) == Some(0) {
            self.error(codes::TYPE_MISMATCH, "range step must not be zero", iter.span);
            return None;
        }

        let var = match self.module.symbols.lookup_local(name) {
            Some(id) => {
                let symbol = self.module.symbols.symbol(id);
                if !(symbol.is_value() && symbol.ty.is_integer() && symbol.ty.is_scalar()) {
                    let found = symbol.ty.to_string();
                    self.report(
                        Diagnostic::error(codes::INCOMPATIBLE_REASSIGNMENT, "loop variable must be an integer")
                            .with_symbol(name.to_string())
                            .with_note(format!("found {}", found)),
                        target.span,
                    );
                    return None;
                }
                self.module.symbols.mark_mutated(id);
                id
            }
            None => self.define_variable(name, TypeDescriptor::int(), target.span)?,
        };

        let directive = pragma.map(|p| Directive {
            family: p.family,
            text: p.directive.clone(),
        });
        self.loop_depth += 1;
        let body = self.block(body);
        self.loop_depth -= 1;
        Some(TStmt::new(
            TStmtKind::For { var, start, stop, step, body, directive },
            span,
        ))
    }

    /// Whether `func` names a builtin that is not shadowed by a binding
    pub(super) fn names_builtin(&self, func: &Expr, builtin: &str) -> bool {
        func.as_name() == Some(builtin) && self.module.symbols.lookup(builtin).is_none()
    }

    // ----- assignments -----

    fn assignment(&mut self, target: &'a Expr, value: &'a Expr, span: Span, out: &mut Vec<TStmt>) {
        match &target.kind {
            ExprKind::Tuple(items) | ExprKind::List(items) => self.unpack(items, value, span, out),
            _ => {
                let Some(value) = self.expr(value) else {
                    self.poison_target(target);
                    return;
                };
                if let Some(stmt) = self.assign_target(target, value, None, span) {
                    out.push(stmt);
                }
            }
        }
    }

    fn annotated_assignment(
        &mut self,
        target: &'a Expr,
        annotation: &Annotation,
        value: Option<&'a Expr>,
        span: Span,
        out: &mut Vec<TStmt>,
    ) {
        let Some(name) = target.as_name() else { return };
        let Some(ty) = self.single_type(annotation) else {
            self.poison(name);
            return;
        };
        match value {
            Some(value) => {
                let Some(value) = self.expr(value) else {
                    self.poison(name);
                    return;
                };
                if let Some(stmt) = self.assign_name(name, value, Some(ty), target.span, span) {
                    out.push(stmt);
                }
            }
            None => match self.module.symbols.lookup_local(name) {
                Some(id) => {
                    let existing = self.module.symbols.symbol(id).ty.clone();
                    if !existing.compatible(&ty) {
                        self.annotation_conflict(name, &existing, &ty, target.span);
                    }
                }
                None => {
                    self.define_variable(name, ty, target.span);
                }
            },
        }
    }

    fn annotation_conflict(&mut self, name: &str, existing: &TypeDescriptor, ty: &TypeDescriptor, span: Span) {
        self.report(
            Diagnostic::error(codes::ANNOTATION_CONFLICT, "annotation conflicts with an earlier type")
                .with_symbol(name.to_string())
                .with_note(format!("declared as {}, annotated as {}", existing, ty)),
            span,
        );
    }

    fn poison_target(&mut self, target: &Expr) {
        if let Some(name) = target.as_name() {
            if self.module.symbols.lookup_local(name).is_none() {
                self.poison(name);
            }
        }
    }

    fn assign_target(
        &mut self,
        target: &'a Expr,
        value: ExprId,
        annotation: Option<TypeDescriptor>,
        span: Span,
    ) -> Option<TStmt> {
        match &target.kind {
            ExprKind::Name(name) => self.assign_name(name, value, annotation, target.span, span),
            ExprKind::Subscript { value: base, indices } => self.assign_element(base, indices, value, span),
            ExprKind::Tuple(_) | ExprKind::List(_) => {
                self.error(codes::INVALID_UNPACK, "nested unpacking is not supported", target.span);
                None
            }
            _ => {
                self.unsupported("assignment to an attribute", target.span);
                None
            }
        }
    }

    fn unpack(&mut self, targets: &'a [Expr], value: &'a Expr, span: Span, out: &mut Vec<TStmt>) {
        let mut items = match &value.kind {
            ExprKind::Tuple(items) | ExprKind::List(items) => {
                let mut typed = Vec::with_capacity(items.len());
                for item in items {
                    match self.expr(item) {
                        Some(id) => typed.push(id),
                        None => {
                            targets.iter().for_each(|t| self.poison_target(t));
                            return;
                        }
                    }
                }
                typed
            }
            _ => {
                let Some(id) = self.expr(value) else {
                    targets.iter().for_each(|t| self.poison_target(t));
                    return;
                };
                let expr = self.module.expr(id);
                let is_call = matches!(expr.kind, TExprKind::Call { .. });
                match &expr.kind {
                    TExprKind::Tuple(items) => items.clone(),
                    _ if is_call && expr.ty.kind == BaseKind::Tuple => {
                        if let Some(stmt) = self.unpack_call(targets, id, span) {
                            out.push(stmt);
                        }
                        return;
                    }
                    _ => {
                        let found = expr.ty.to_string();
                        self.report(
                            Diagnostic::error(codes::INVALID_UNPACK, "cannot unpack this value")
                                .with_note(format!("found {}", found)),
                            value.span,
                        );
                        return;
                    }
                }
            }
        };

        if items.len() != targets.len() {
            self.report(
                Diagnostic::error(
                    codes::INVALID_UNPACK,
                    format!("expected {} values to unpack, found {}", targets.len(), items.len()),
                ),
                span,
            );
            return;
        }

        // `a, b = b, a` must read every value before writing any target
        let written: HashSet<SymbolId> = targets
            .iter()
            .filter_map(|t| t.as_name().or_else(|| subscript_base(t)))
            .filter_map(|name| self.module.symbols.lookup(name))
            .collect();
        let mut read = HashSet::new();
        for &item in &items {
            self.module.walk_expr(item, &mut |id| {
                if let TExprKind::Var(symbol) = self.module.exprs[id].kind {
                    read.insert(symbol);
                }
            });
        }
        if items.len() > 1 && !written.is_disjoint(&read) {
            for item in items.iter_mut() {
                let ty = self.module.ty(*item).clone();
                let item_span = self.module.expr(*item).span;
                let Some(temp) = self.temporary(ty.clone(), item_span) else { return };
                out.push(TStmt::new(TStmtKind::Assign { target: LValue::Var(temp), value: *item }, span));
                self.module.symbols.mark_used(temp);
                *item = self.push(TExprKind::Var(temp), ty, item_span);
            }
        }

        for (target, item) in targets.iter().zip(items) {
            if let Some(stmt) = self.assign_target(target, item, None, span) {
                out.push(stmt);
            }
        }
    }

    fn unpack_call(&mut self, targets: &'a [Expr], call: ExprId, span: Span) -> Option<TStmt> {
        let results = self.module.ty(call).elements.clone();
        if results.len() != targets.len() {
            self.report(
                Diagnostic::error(
                    codes::INVALID_UNPACK,
                    format!("expected {} values to unpack, found {}", targets.len(), results.len()),
                ),
                span,
            );
            return None;
        }
        let mut symbols = Vec::with_capacity(targets.len());
        for (target, ty) in targets.iter().zip(results) {
            let Some(name) = target.as_name() else {
                self.unsupported("unpacking call results into an element", target.span);
                return None;
            };
            let id = match self.module.symbols.lookup_local(name) {
                Some(id) => {
                    let symbol = self.module.symbols.symbol(id).clone();
                    if !symbol.is_value() || symbol.ty.accepts(&ty) != Storage::Exact {
                        self.report(
                            Diagnostic::error(codes::INCOMPATIBLE_REASSIGNMENT, "incompatible types in assignment")
                                .with_symbol(name.to_string())
                                .with_note(format!("declared as {}, found {}", symbol.ty, ty)),
                            target.span,
                        );
                        return None;
                    }
                    self.module.symbols.mark_mutated(id);
                    id
                }
                None => self.define_variable(name, ty, target.span)?,
            };
            symbols.push(id);
        }
        Some(TStmt::new(TStmtKind::Unpack { targets: symbols, value: call }, span))
    }

    /// Bind `name` to a value. A name left unbound by a failed binding is
    /// poisoned so later uses do not report it again.
    fn assign_name(
        &mut self,
        name: &str,
        value: ExprId,
        annotation: Option<TypeDescriptor>,
        target_span: Span,
        span: Span,
    ) -> Option<TStmt> {
        let stmt = self.bind_name(name, value, annotation, target_span, span);
        if stmt.is_none() && self.module.symbols.lookup_local(name).is_none() {
            self.poison(name);
        }
        stmt
    }

    fn bind_name(
        &mut self,
        name: &str,
        value: ExprId,
        annotation: Option<TypeDescriptor>,
        target_span: Span,
        span: Span,
    ) -> Option<TStmt> {
        let value_ty = self.module.ty(value).clone();
        if !(value_ty.is_numeric() || value_ty.kind == BaseKind::Str) {
            self.report(
                Diagnostic::error(codes::TYPE_MISMATCH, "cannot assign this value")
                    .with_symbol(name.to_string())
                    .with_note(format!("found {}", value_ty)),
                span,
            );
            self.poison_target(&Expr::new(ExprKind::Name(name.to_string()), target_span));
            return None;
        }
        if value_ty.is_array() && !self.check_array_source(value) {
            return None;
        }

        match self.module.symbols.lookup_local(name) {
            Some(id) => {
                let symbol = self.module.symbols.symbol(id).clone();
                if !symbol.is_value() {
                    self.report(
                        Diagnostic::error(codes::REDEFINITION, "cannot assign to a function or module")
                            .with_symbol(name.to_string()),
                        target_span,
                    );
                    return None;
                }
                if symbol.ty.is_const || symbol.role == SymbolRole::Constant {
                    self.report(
                        Diagnostic::error(codes::CONSTANT_MUTATION, "cannot assign to a constant")
                            .with_symbol(name.to_string()),
                        target_span,
                    );
                    return None;
                }
                if symbol.is_argument() && symbol.ty.is_array() {
                    self.unsupported(format!("rebinding array argument '{}'", name), target_span);
                    return None;
                }
                if let Some(annotation) = &annotation {
                    if !annotation.compatible(&symbol.ty) {
                        self.annotation_conflict(name, &symbol.ty, annotation, target_span);
                        return None;
                    }
                }
                let value = self.store(&symbol.ty, value, false, codes::INCOMPATIBLE_REASSIGNMENT, name)?;
                if symbol.ty.is_array() && symbol.ty.shape != value_ty.shape {
                    let stored = &mut self.module.symbols.symbol_mut(id).ty;
                    stored.shape = vec![super::types::Dim::Unknown; stored.rank];
                }
                self.module.symbols.mark_mutated(id);
                Some(TStmt::new(TStmtKind::Assign { target: LValue::Var(id), value }, span))
            }
            None => {
                let (ty, value) = match annotation {
                    Some(annotation) => {
                        let value = self.store(&annotation, value, false, codes::ANNOTATION_CONFLICT, name)?;
                        (annotation, value)
                    }
                    None => {
                        let mut ty = value_ty;
                        ty.is_const = false;
                        (ty, value)
                    }
                };
                let id = self.define_variable(name, ty, target_span)?;
                Some(TStmt::new(TStmtKind::Assign { target: LValue::Var(id), value }, span))
            }
        }
    }

    /// Arrays are only assigned from freshly created values
    fn check_array_source(&mut self, value: ExprId) -> bool {
        let expr = self.module.expr(value);
        let span = expr.span;
        match &expr.kind {
            TExprKind::Var(_) => {
                self.unsupported("assignment creating an array alias", span);
                false
            }
            TExprKind::Index { indices, .. } if indices.iter().any(IndexItem::is_slice) => {
                self.unsupported("assignment of an array view", span);
                false
            }
            _ => true,
        }
    }

    fn assign_element(
        &mut self,
        base: &'a Expr,
        indices: &'a [SubscriptItem],
        value: ExprId,
        span: Span,
    ) -> Option<TStmt> {
        let Some(name) = base.as_name() else {
            self.unsupported("assignment to a subscript of an expression", base.span);
            return None;
        };
        let id = self.lookup_value(name, base.span)?;
        let symbol = self.module.symbols.symbol(id).clone();
        if !symbol.ty.is_array() {
            self.report(
                Diagnostic::error(codes::INVALID_INDEX, "cannot index a scalar").with_symbol(name.to_string()),
                base.span,
            );
            return None;
        }
        let writable = matches!(symbol.role, SymbolRole::Variable | SymbolRole::Argument);
        if symbol.ty.is_const || !writable {
            self.report(
                Diagnostic::error(codes::CONSTANT_MUTATION, "cannot modify a constant array")
                    .with_symbol(name.to_string()),
                base.span,
            );
            return None;
        }

        let base_expr = self.push(TExprKind::Var(id), symbol.ty.clone(), base.span);
        let (items, rank) = self.index_items(base_expr, &symbol.ty, indices, base.span)?;
        let slot = if rank == 0 {
            symbol.ty.element()
        } else {
            symbol.ty.element().array(rank, symbol.ty.order)
        };
        let value = self.store(&slot, value, true, codes::TYPE_MISMATCH, name)?;

        self.module.symbols.mark_mutated(id);
        if symbol.scope == self.module.symbols.root() && self.in_function() {
            self.note_side_effect();
        }
        Some(TStmt::new(
            TStmtKind::Assign {
                target: LValue::Element { base: id, indices: items },
                value,
            },
            span,
        ))
    }

    fn augmented_assignment(&mut self, target: &'a Expr, op: BinaryOp, value: &'a Expr, span: Span) -> Option<TStmt> {
        let value = self.expr(value)?;
        let (lvalue, current, name) = match &target.kind {
            ExprKind::Name(name) => {
                let id = self.lookup_value(name, target.span)?;
                let ty = self.module.symbols.symbol(id).ty.clone();
                self.module.symbols.mark_used(id);
                let current = self.push(TExprKind::Var(id), ty, target.span);
                (LValue::Var(id), current, name.as_str())
            }
            ExprKind::Subscript { value: base, indices } => {
                let Some(name) = base.as_name() else {
                    self.unsupported("assignment to a subscript of an expression", base.span);
                    return None;
                };
                let id = self.lookup_value(name, base.span)?;
                let ty = self.module.symbols.symbol(id).ty.clone();
                if !ty.is_array() {
                    self.report(
                        Diagnostic::error(codes::INVALID_INDEX, "cannot index a scalar").with_symbol(name.to_string()),
                        base.span,
                    );
                    return None;
                }
                let base_expr = self.push(TExprKind::Var(id), ty.clone(), base.span);
                let (items, rank) = self.index_items(base_expr, &ty, indices, base.span)?;
                let element_ty = if rank == 0 { ty.element() } else { ty.element().array(rank, ty.order) };
                let current = self.push(
                    TExprKind::Index { base: base_expr, indices: items.clone() },
                    element_ty,
                    target.span,
                );
                (LValue::Element { base: id, indices: items }, current, name)
            }
            _ => {
                self.error(codes::INVALID_TARGET, "cannot assign to expression", target.span);
                return None;
            }
        };

        let id = lvalue.symbol();
        let symbol = self.module.symbols.symbol(id).clone();
        if symbol.ty.is_const || !symbol.is_value() || symbol.role == SymbolRole::Constant {
            self.report(
                Diagnostic::error(codes::CONSTANT_MUTATION, "cannot modify a constant").with_symbol(name.to_string()),
                target.span,
            );
            return None;
        }

        let slot = self.module.ty(current).clone();
        let result = self.binary(current, op, value, span)?;
        let result_ty = self.module.ty(result).clone();
        if result_ty.rank != slot.rank || slot.accepts(&result_ty) == Storage::Incompatible {
            self.report(
                Diagnostic::error(codes::INCOMPATIBLE_REASSIGNMENT, "incompatible types in assignment")
                    .with_symbol(name.to_string())
                    .with_note(format!("declared as {}, result is {}", slot, result_ty)),
                span,
            );
            return None;
        }
        let value = self.cast(value, &slot.element());

        self.module.symbols.mark_mutated(id);
        if symbol.scope == self.module.symbols.root() && self.in_function() {
            self.note_side_effect();
        }
        Some(TStmt::new(TStmtKind::AugAssign { target: lvalue, op, value }, span))
    }

    /// Check that `value` fits in `slot`, inserting a widening cast. Scalars
    /// broadcast into array slots only when `broadcast` is set.
    pub(super) fn store(
        &mut self,
        slot: &TypeDescriptor,
        value: ExprId,
        broadcast: bool,
        code: &str,
        name: &str,
    ) -> Option<ExprId> {
        let value_ty = self.module.ty(value).clone();
        let rank_ok = value_ty.rank == slot.rank || (broadcast && value_ty.rank == 0);
        match slot.accepts(&value_ty) {
            Storage::Exact if rank_ok => Some(value),
            Storage::Promote if rank_ok => Some(self.cast(value, &slot.element())),
            _ => {
                let span = self.module.expr(value).span;
                self.report(
                    Diagnostic::error(code, "incompatible types in assignment")
                        .with_symbol(name.to_string())
                        .with_note(format!("expected {}, found {}", slot, value_ty)),
                    span,
                );
                None
            }
        }
    }

    pub(super) fn define_variable(&mut self, name: &str, ty: TypeDescriptor, span: Span) -> Option<SymbolId> {
        if self.module.symbols.shadows(name) {
            self.report(
                Diagnostic::warning(codes::SHADOWED_VARIABLE, "local variable shadows a module variable")
                    .with_symbol(name.to_string()),
                span,
            );
        }
        match self.module.symbols.define(Symbol::new(name, ty, SymbolRole::Variable, span)) {
            Ok(id) => {
                match self.context.as_mut() {
                    Some(context) => context.locals.push(id),
                    None => self.module.globals.push(id),
                }
                Some(id)
            }
            Err(_) => {
                self.report(
                    Diagnostic::error(codes::REDEFINITION, "name is already defined").with_symbol(name.to_string()),
                    span,
                );
                None
            }
        }
    }

    fn temporary(&mut self, ty: TypeDescriptor, span: Span) -> Option<SymbolId> {
        let name = format!("_tmp{}", self.temp_count);
        self.temp_count += 1;
        self.define_variable(&name, ty, span)
    }

    /// Resolve a name that must denote a value, reporting otherwise
    pub(super) fn lookup_value(&mut self, name: &str, span: Span) -> Option<SymbolId> {
        if self.is_poisoned(name) {
            return None;
        }
        match self.module.symbols.lookup(name) {
            Some(id) if self.module.symbols.symbol(id).is_value() => Some(id),
            Some(id) => {
                let role = self.module.symbols.symbol(id).role.clone();
                match role {
                    SymbolRole::Imported { .. } if self.module.symbols.symbol(id).ty.is_numeric() => Some(id),
                    _ => {
                        self.unsupported(format!("'{}' used as a value", name), span);
                        None
                    }
                }
            }
            None => {
                self.report(
                    Diagnostic::fatal(codes::UNDEFINED_NAME, "undefined name").with_symbol(name.to_string()),
                    span,
                );
                self.poison(name);
                None
            }
        }
    }

    pub(super) fn member(&mut self, module: &str, name: &str, span: Span) -> Option<ModuleMember> {
        let resolved = self.resolve_module(module, span)?;
        let member = match &resolved {
            ResolvedModule::Numpy => builtins::numpy_member(name).map(ModuleMember::Builtin),
            ResolvedModule::Math => builtins::math_member(name).map(ModuleMember::Builtin),
            ResolvedModule::Header(header) if header.has_member(name) => {
                Some(ModuleMember::Header(header.clone(), name.to_string()))
            }
            ResolvedModule::Header(_) => None,
        };
        if member.is_none() {
            self.report(
                Diagnostic::fatal(codes::UNRESOLVED_IMPORT, format!("module '{}' has no member", module))
                    .with_symbol(name.to_string()),
                span,
            );
        }
        member
    }
}

/// Member of an imported module, resolved
pub(super) enum ModuleMember {
    Builtin(Member),
    Header(std::rc::Rc<super::resolver::HeaderModule>, String),
}

fn member_type(member: Member) -> TypeDescriptor {
    match member {
        Member::Constant(_) => {
            let mut ty = TypeDescriptor::float();
            ty.is_const = true;
            ty
        }
        Member::Function(_) | Member::Dtype(_) => TypeDescriptor::void(),
    }
}

fn subscript_base(expr: &Expr) -> Option<&str> {
    match &expr.kind {
        ExprKind::Subscript { value, .. } => value.as_name(),
        _ => None,
    }
}

pub(super) fn is_literal(expr: &Expr) -> bool {
    match &expr.kind {
        ExprKind::Int(_) | ExprKind::Float(_) | ExprKind::Imaginary(_) | ExprKind::Bool(_) | ExprKind::Str(_) => true,
        ExprKind::Unary { operand, .. } => is_literal(operand),
        _ => false,
    }
}

/// `if __name__ == '__main__':`
fn is_main_guard(stmt: &Stmt) -> bool {
    let StmtKind::If { branches, .. } = &stmt.kind else { return false };
    let Some((condition, _)) = branches.first() else { return false };
    match &condition.kind {
        ExprKind::Binary { left, op: BinaryOp::Eq, right } => {
            left.as_name() == Some("__name__") && matches!(&right.kind, ExprKind::Str(s) if s == "__main__")
        }
        _ => false,
    }
}

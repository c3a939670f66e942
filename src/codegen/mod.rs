//! Code generation: renders a typed module into backend source text plus
//! the wrapper that exposes it through the `pyaot_*` calling convention.

mod c_emitter;
mod c_wrapper;
mod fortran_emitter;
mod fortran_wrapper;
pub mod interface;
mod names;
mod python_emitter;

pub use c_emitter::CEmitter;
pub use fortran_emitter::FortranEmitter;
pub use interface::WrapperInterface;
pub use names::{NameCollision, NameTable};
pub use python_emitter::PythonEmitter;

use crate::config::Accelerators;
use crate::diagnostics::{codes, Diagnostic, DiagnosticReporter};
use crate::parser::{PragmaFamily, Span};
use crate::semantic::tast::*;
use crate::semantic::{BaseKind, TypedModule};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use tracing::{debug, info};

/// Target language of the generated code
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Language {
    C,
    #[default]
    Fortran,
    Python,
}

impl Language {
    /// Backends whose output goes through the native toolchain
    pub fn is_compiled(self) -> bool {
        !matches!(self, Language::Python)
    }
}

impl fmt::Display for Language {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Language::C => "c",
            Language::Fortran => "fortran",
            Language::Python => "python",
        };
        f.write_str(name)
    }
}

impl FromStr for Language {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "c" => Ok(Language::C),
            "fortran" | "f90" => Ok(Language::Fortran),
            "python" | "py" => Ok(Language::Python),
            other => Err(format!("unknown language '{}' (expected c, fortran or python)", other)),
        }
    }
}

/// Constructs that not every backend can render
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Capability {
    /// Slices in subscripts, read or written
    Slicing,
    /// Array-valued operators, casts and math calls; reductions of
    /// anything but a variable
    ArrayExpressions,
    /// Array arguments that are not plain variables
    ArrayArguments,
    /// Functions returning arrays
    ArrayReturns,
    /// Reductions along one axis
    AxisReductions,
    /// Variables holding strings
    StringVariables,
    /// Subscripts applied to an array expression rather than a variable
    ExpressionSubscripts,
}

impl Capability {
    pub fn description(self) -> &'static str {
        match self {
            Capability::Slicing => "array slicing",
            Capability::ArrayExpressions => "whole-array expressions",
            Capability::ArrayArguments => "array expressions as call arguments",
            Capability::ArrayReturns => "functions returning arrays",
            Capability::AxisReductions => "reductions along an axis",
            Capability::StringVariables => "string variables",
            Capability::ExpressionSubscripts => "subscripts of array expressions",
        }
    }
}

/// Kind of a generated file
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileKind {
    Source,
    Header,
    Wrapper,
}

#[derive(Debug, Clone)]
pub struct GeneratedFile {
    pub name: String,
    pub kind: FileKind,
    pub contents: String,
}

/// Everything produced for one module
#[derive(Debug, Clone)]
pub struct GeneratedCode {
    pub module: String,
    pub language: Language,
    pub files: Vec<GeneratedFile>,
    /// Present when the module has a native wrapper
    pub interface: Option<WrapperInterface>,
}

impl GeneratedCode {
    /// Files handed to the native compiler, in compilation order
    pub fn compiled_files(&self) -> impl Iterator<Item = &GeneratedFile> {
        self.files.iter().filter(|f| f.kind != FileKind::Header)
    }
}

/// A code generator for one target language
pub trait Backend {
    fn language(&self) -> Language;

    fn supports(&self, capability: Capability) -> bool;

    /// Render the module with the native spellings in `names`. Called only
    /// after the capability check passed.
    fn emit(&mut self, module: &TypedModule, names: &NameTable, accelerators: Accelerators) -> Vec<GeneratedFile>;
}

pub fn backend_for(language: Language) -> Box<dyn Backend> {
    match language {
        Language::C => Box::new(CEmitter::new()),
        Language::Fortran => Box::new(FortranEmitter::new()),
        Language::Python => Box::new(PythonEmitter::new()),
    }
}

/// Check the module against the backend's capabilities, then emit it.
/// Unsupported constructs are reported and nothing is generated.
pub fn generate(
    module: &TypedModule,
    language: Language,
    accelerators: Accelerators,
    reporter: &mut DiagnosticReporter,
) -> Option<GeneratedCode> {
    let mut backend = backend_for(language);
    let before = reporter.error_count();
    for (capability, span) in required_capabilities(module) {
        if !backend.supports(capability) {
            reporter.report_with_label(
                Diagnostic::error(
                    codes::BACKEND_UNSUPPORTED,
                    format!("construct is not supported by the {} backend", language),
                )
                .with_symbol(capability.description()),
                span.offset,
                span.length,
                "used here",
            );
        }
    }
    if reporter.error_count() > before {
        return None;
    }

    let names = NameTable::new(module, language);
    for collision in names.collisions() {
        reporter.report_with_label(
            Diagnostic::error(
                codes::NAME_COLLISION,
                format!("header name collides with another one in the {} backend", language),
            )
            .with_symbol(collision.name.clone())
            .with_note(format!("both are spelled '{}'", collision.native)),
            collision.span.offset,
            collision.span.length,
            "declared here",
        );
    }
    if reporter.error_count() > before {
        return None;
    }

    info!(module = %module.name, %language, "generating code");
    let mut files = backend.emit(module, &names, accelerators);
    let interface = if language.is_compiled() && !module.is_header {
        let interface = WrapperInterface::from_module(module, language);
        let wrapper = match language {
            Language::C => c_wrapper::emit(module, &interface, &names),
            _ => fortran_wrapper::emit(module, &interface, &names),
        };
        files.push(wrapper);
        Some(interface)
    } else {
        None
    };
    for file in &files {
        debug!(file = %file.name, bytes = file.contents.len(), "generated");
    }
    Some(GeneratedCode {
        module: module.name.clone(),
        language,
        files,
        interface,
    })
}

/// Every capability the module needs, once per offending construct
pub fn required_capabilities(module: &TypedModule) -> Vec<(Capability, Span)> {
    let mut walker = CapabilityWalker {
        module,
        found: Vec::new(),
    };
    for (_, symbol) in module.symbols.symbols() {
        if symbol.is_value() && symbol.ty.kind == BaseKind::Str {
            walker.require(Capability::StringVariables, symbol.span);
        }
    }
    for (_, function) in module.functions.iter_enumerated() {
        if function.results.iter().any(|r| r.is_array()) {
            walker.require(Capability::ArrayReturns, function.span);
        }
        walker.stmts(&function.body);
    }
    walker.stmts(&module.init_body);
    walker.found
}

struct CapabilityWalker<'m> {
    module: &'m TypedModule,
    found: Vec<(Capability, Span)>,
}

impl CapabilityWalker<'_> {
    /// Record a use; nested nodes of a construct already recorded for the
    /// same capability are not reported again
    fn require(&mut self, capability: Capability, span: Span) {
        let covered = self
            .found
            .iter()
            .any(|(c, s)| *c == capability && s.offset <= span.offset && span.end() <= s.end());
        if !covered {
            self.found.push((capability, span));
        }
    }

    fn stmts(&mut self, stmts: &[TStmt]) {
        for stmt in stmts {
            self.stmt(stmt);
        }
    }

    fn stmt(&mut self, stmt: &TStmt) {
        let module = self.module;
        match &stmt.kind {
            TStmtKind::Assign { target, value } => {
                self.target(target, stmt.span);
                if matches!(target, LValue::Var(_)) && is_fresh_array(module, *value) {
                    self.operands(*value);
                } else {
                    self.expr(*value);
                }
            }
            TStmtKind::AugAssign { target, value, .. } => {
                self.target(target, stmt.span);
                if module.symbols.symbol(target.symbol()).ty.is_array() && matches!(target, LValue::Var(_)) {
                    self.require(Capability::ArrayExpressions, stmt.span);
                }
                self.expr(*value);
            }
            TStmtKind::Unpack { value, .. } => self.expr(*value),
            TStmtKind::Expr(value) => self.expr(*value),
            TStmtKind::If { branches, orelse } => {
                for (condition, body) in branches {
                    self.expr(*condition);
                    self.stmts(body);
                }
                self.stmts(orelse);
            }
            TStmtKind::For { start, stop, step, body, .. } => {
                for id in [start, stop, step] {
                    self.expr(*id);
                }
                self.stmts(body);
            }
            TStmtKind::While { condition, body } => {
                self.expr(*condition);
                self.stmts(body);
            }
            TStmtKind::Return(values) | TStmtKind::Print(values) => {
                for value in values {
                    self.expr(*value);
                }
            }
            TStmtKind::Break | TStmtKind::Continue | TStmtKind::Pass | TStmtKind::Directive(_) => {}
        }
    }

    fn target(&mut self, target: &LValue, span: Span) {
        if let LValue::Element { indices, .. } = target {
            if indices.iter().any(IndexItem::is_slice) {
                self.require(Capability::Slicing, span);
            }
            for item in indices {
                match item {
                    IndexItem::Scalar(index) => self.expr(*index),
                    IndexItem::Slice { lower, upper, step } => {
                        self.expr(*lower);
                        self.expr(*upper);
                        if let Some(step) = step {
                            self.expr(*step);
                        }
                    }
                }
            }
        }
    }

    /// Visit the operands of an allocation or literal without flagging the
    /// node itself
    fn operands(&mut self, id: ExprId) {
        let module = self.module;
        match &module.expr(id).kind {
            TExprKind::ArrayLiteral(items) => items.iter().for_each(|&i| self.expr(i)),
            TExprKind::Alloc { fill, shape } => {
                if let Fill::Value(value) = fill {
                    self.expr(*value);
                }
                shape.iter().for_each(|&e| self.expr(e));
            }
            _ => self.expr(id),
        }
    }

    fn expr(&mut self, id: ExprId) {
        let module = self.module;
        module.walk_expr(id, &mut |node| {
            let expr = module.expr(node);
            let span = expr.span;
            match &expr.kind {
                TExprKind::Index { base, indices } => {
                    if indices.iter().any(IndexItem::is_slice) {
                        self.require(Capability::Slicing, span);
                    }
                    if !is_variable(module, *base) {
                        self.require(Capability::ExpressionSubscripts, span);
                    }
                }
                TExprKind::Binary { .. }
                | TExprKind::Unary { .. }
                | TExprKind::Cast(_)
                | TExprKind::Math { .. }
                | TExprKind::Alloc { .. }
                | TExprKind::ArrayLiteral(_)
                    if expr.ty.is_array() =>
                {
                    self.require(Capability::ArrayExpressions, span)
                }
                TExprKind::Reduce { value, axis, .. } => {
                    if axis.is_some() {
                        self.require(Capability::AxisReductions, span);
                    }
                    if !is_variable(module, *value) {
                        self.require(Capability::ArrayExpressions, span);
                    }
                }
                TExprKind::Shape { base, .. } | TExprKind::Size(base) if !is_variable(module, *base) => {
                    self.require(Capability::ArrayExpressions, span)
                }
                TExprKind::Call { args, .. } => {
                    if args.iter().any(|&a| module.ty(a).is_array() && !is_variable(module, a)) {
                        self.require(Capability::ArrayArguments, span);
                    }
                    if module.ty(node).elements.iter().any(|e| e.is_array()) || expr.ty.is_array() {
                        self.require(Capability::ArrayReturns, span);
                    }
                }
                _ => {}
            }
        });
    }
}

fn is_variable(module: &TypedModule, id: ExprId) -> bool {
    matches!(module.expr(id).kind, TExprKind::Var(_))
}

/// Allocation or literal, which every backend can store into a variable
pub(crate) fn is_fresh_array(module: &TypedModule, id: ExprId) -> bool {
    matches!(module.expr(id).kind, TExprKind::Alloc { .. } | TExprKind::ArrayLiteral(_))
}

/// Directive text to emit for the enabled accelerators, if any
pub(crate) fn active_directive(directive: &Directive, accelerators: Accelerators) -> Option<&str> {
    let enabled = match directive.family {
        PragmaFamily::OpenMp => accelerators.openmp,
        PragmaFamily::OpenAcc => accelerators.openacc,
    };
    enabled.then_some(directive.text.as_str())
}

/// Text of an active loop directive; the loop variable is made private
/// since every iteration assigns it from the hidden counter
pub(crate) fn loop_directive(directive: &Directive, accelerators: Accelerators, variable: &str) -> Option<String> {
    let text = active_directive(directive, accelerators)?;
    let mentioned = text
        .split(|c: char| !(c.is_alphanumeric() || c == '_'))
        .any(|word| word.eq_ignore_ascii_case(variable));
    if mentioned || !(text.contains(" for") || text.contains(" do") || text.contains("loop")) {
        Some(text.to_string())
    } else {
        Some(format!("{} private({})", text, variable))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parser::parse_source;
    use crate::semantic::{analyze, SearchPathResolver};

    fn typed(source: &str) -> TypedModule {
        let mut reporter = DiagnosticReporter::new("mod.py", source);
        let ast = parse_source(source, &mut reporter);
        let mut resolver = SearchPathResolver::new(Vec::new());
        analyze(&ast, "mod", false, &mut resolver, &mut reporter)
            .unwrap_or_else(|| panic!("{:?}", reporter.diagnostics()))
    }

    #[test]
    fn slicing_is_rejected_by_c_only() {
        let source = "\
def first_half(a: 'float[:]', b: 'float[:]'):
    b[:] = a[0:2] * 2.0
";
        let module = typed(source);
        let needed: Vec<_> = required_capabilities(&module).into_iter().map(|(c, _)| c).collect();
        assert!(needed.contains(&Capability::Slicing));
        assert!(needed.contains(&Capability::ArrayExpressions));

        let mut reporter = DiagnosticReporter::new("mod.py", source);
        assert!(generate(&module, Language::C, Accelerators::default(), &mut reporter).is_none());
        assert!(reporter.diagnostics().iter().all(|d| d.code == codes::BACKEND_UNSUPPORTED));

        let mut reporter = DiagnosticReporter::new("mod.py", source);
        let code = generate(&module, Language::Fortran, Accelerators::default(), &mut reporter).unwrap();
        assert_eq!(code.files.len(), 2);
        assert!(code.interface.is_some());
    }

    #[test]
    fn allocations_need_no_capability() {
        let module = typed("\
import numpy as np

def fill(n: int) -> float:
    a = np.zeros(n)
    for i in range(n):
        a[i] = i * 0.5
    return np.sum(a)
");
        assert!(required_capabilities(&module).is_empty());
    }

    #[test]
    fn string_variables_are_a_capability() {
        let module = typed("greeting = 'hello'\n");
        let needed: Vec<_> = required_capabilities(&module).into_iter().map(|(c, _)| c).collect();
        assert_eq!(needed, vec![Capability::StringVariables]);
    }

    #[test]
    fn names_are_escaped_per_backend() {
        assert_eq!(names::escape("double", Language::C), "double_");
        assert_eq!(names::escape("x", Language::C), "x");
        assert_eq!(names::escape("_tmp0", Language::Fortran), "v_tmp0");
        assert_eq!(names::escape("sum", Language::Fortran), "sum_");
    }

    #[test]
    fn every_unsupported_site_is_reported() {
        let source = "\
def scale(a: 'float[:]', b: 'float[:]', out: 'float[:]'):
    out[0:2] = a[0:2]
    x = 1.0
    y = 2.0
    out[2:4] = b[2:4]
";
        let module = typed(source);
        let slicing: Vec<_> = required_capabilities(&module)
            .into_iter()
            .filter(|(c, _)| *c == Capability::Slicing)
            .collect();
        assert_eq!(slicing.len(), 2);

        let mut reporter = DiagnosticReporter::new("mod.py", source);
        assert!(generate(&module, Language::C, Accelerators::default(), &mut reporter).is_none());
        let lines: Vec<usize> = reporter
            .diagnostics()
            .iter()
            .filter_map(|d| d.location.as_ref().map(|l| l.line))
            .collect();
        assert_eq!(lines, vec![2, 5]);
    }

    #[test]
    fn language_parses_from_flags() {
        assert_eq!("Fortran".parse::<Language>(), Ok(Language::Fortran));
        assert_eq!("c".parse::<Language>(), Ok(Language::C));
        assert!("rust".parse::<Language>().is_err());
    }
}

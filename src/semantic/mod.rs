//! Semantic analysis: name resolution, type inference and lowering of the
//! AST into the typed AST consumed by the code generators.

mod analyzer;
pub mod builtins;
mod expr;
pub mod resolver;
pub mod symbol_table;
pub mod tast;
pub mod types;

pub use analyzer::Analyzer;
pub use resolver::{HeaderModule, ModuleResolver, ResolvedModule, SearchPathResolver};
pub use symbol_table::{Symbol, SymbolId, SymbolRole, SymbolTable};
pub use tast::{ExprId, FuncId, TypedFunction, TypedModule};
pub use types::{BaseKind, Dim, Dtype, Order, TypeDescriptor};

use crate::diagnostics::DiagnosticReporter;
use crate::parser::Module;

/// Analyse a parsed module. Diagnostics go to `reporter`; no typed module
/// is returned when any of them is an error.
pub fn analyze(
    ast: &Module,
    module_name: &str,
    is_header: bool,
    resolver: &mut dyn ModuleResolver,
    reporter: &mut DiagnosticReporter,
) -> Option<TypedModule> {
    Analyzer::new(ast, module_name, is_header, resolver, reporter).analyze()
}

#[cfg(test)]
mod tests {
    use super::tast::{Callee, TExprKind, TStmtKind};
    use super::*;
    use crate::diagnostics::codes;
    use crate::parser::parse_source;

    fn run(source: &str) -> (Option<TypedModule>, DiagnosticReporter) {
        let mut reporter = DiagnosticReporter::new("test.py", source);
        let ast = parse_source(source, &mut reporter);
        assert!(!reporter.has_errors(), "parse errors: {:?}", reporter.diagnostics());
        let mut resolver = SearchPathResolver::new(Vec::new());
        let module = analyze(&ast, "test", false, &mut resolver, &mut reporter);
        (module, reporter)
    }

    fn codes_of(reporter: &DiagnosticReporter) -> Vec<String> {
        reporter.diagnostics().iter().map(|d| d.code.clone()).collect()
    }

    #[test]
    fn array_maximum_is_typed() {
        let source = "\
def array_max(a: 'float[:]') -> float:
    m = a[0]
    for i in range(1, len(a)):
        if a[i] > m:
            m = a[i]
    return m
";
        let (module, reporter) = run(source);
        let module = module.unwrap_or_else(|| panic!("{:?}", reporter.diagnostics()));
        let (_, function) = module.exported_functions().next().unwrap();
        assert_eq!(function.mangled, "array_max");
        assert_eq!(function.results, vec![TypeDescriptor::float()]);
        let param = module.symbols.symbol(function.params[0]);
        assert_eq!(param.ty.rank, 1);
        let local = module.symbols.symbol(function.locals[0]);
        assert_eq!((local.name.as_str(), local.ty.clone()), ("m", TypeDescriptor::float()));
    }

    #[test]
    fn union_annotations_create_instances() {
        let source = "\
def twice(x: 'int | float') -> 'int | float':
    return x + x
";
        let (module, reporter) = run(source);
        assert!(module.is_none());
        assert!(codes_of(&reporter).contains(&codes::INVALID_ANNOTATION.to_string()));

        let source = "\
def twice(x: 'int | float'):
    return x + x

def use() -> float:
    return twice(1.5)
";
        let (module, reporter) = run(source);
        let module = module.unwrap_or_else(|| panic!("{:?}", reporter.diagnostics()));
        let names: Vec<_> = module.exported_functions().map(|(_, f)| f.mangled.clone()).collect();
        assert_eq!(names, vec!["twice__0", "twice__1", "use"]);
        let instances = module.instances("twice");
        assert_eq!(module.function(instances[0]).results, vec![TypeDescriptor::int()]);
        assert_eq!(module.function(instances[1]).results, vec![TypeDescriptor::float()]);

        let (_, caller) = module.exported_functions().last().unwrap();
        let TStmtKind::Return(values) = &caller.body[0].kind else { panic!("expected a return") };
        match &module.expr(values[0]).kind {
            TExprKind::Call { callee: Callee::Local(fid), .. } => assert_eq!(*fid, instances[1]),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn integer_argument_prefers_exact_overload() {
        let source = "\
def scale(x: 'int | float') -> float:
    return 2.0 * x

def use() -> float:
    return scale(3)
";
        let (module, _) = run(source);
        let module = module.unwrap();
        let (_, caller) = module.exported_functions().last().unwrap();
        let TStmtKind::Return(values) = &caller.body[0].kind else { panic!("expected a return") };
        let TExprKind::Call { callee: Callee::Local(fid), .. } = &module.expr(values[0]).kind else {
            panic!("expected a call")
        };
        assert_eq!(module.function(*fid).mangled, "scale__0");
    }

    #[test]
    fn undefined_name_is_reported_once() {
        let source = "\
def f() -> int:
    x = y + 1
    z = y * 2
    return x + z
";
        let (module, reporter) = run(source);
        assert!(module.is_none());
        let undefined = codes_of(&reporter)
            .iter()
            .filter(|c| c.as_str() == codes::UNDEFINED_NAME)
            .count();
        assert_eq!(undefined, 1);
    }

    #[test]
    fn failed_binding_is_not_reported_again() {
        let source = "\
def f(x: 'float[:]'):
    w = x[1:3]
    print(w[0])
    print(w[1])
";
        let (module, reporter) = run(source);
        assert!(module.is_none());
        assert_eq!(codes_of(&reporter), vec![codes::UNSUPPORTED_CONSTRUCT.to_string()]);
    }

    #[test]
    fn reassignment_must_keep_the_type() {
        let source = "\
def f() -> int:
    x = 1
    x = 2.5
    return x
";
        let (module, reporter) = run(source);
        assert!(module.is_none());
        assert!(codes_of(&reporter).contains(&codes::INCOMPATIBLE_REASSIGNMENT.to_string()));
    }

    #[test]
    fn widening_reassignment_is_accepted() {
        let source = "\
def f() -> float:
    x = 1.0
    x = 2
    return x
";
        let (module, reporter) = run(source);
        assert!(module.is_some(), "{:?}", reporter.diagnostics());
    }

    #[test]
    fn shadowing_and_unused_variables_warn() {
        let source = "\
n = 10

def f() -> int:
    n = 3
    unused = 4
    return n
";
        let (module, reporter) = run(source);
        assert!(module.is_some());
        let codes = codes_of(&reporter);
        assert!(codes.contains(&codes::SHADOWED_VARIABLE.to_string()));
        assert!(codes.contains(&codes::UNUSED_VARIABLE.to_string()));
        assert_eq!(reporter.error_count(), 0);
    }

    #[test]
    fn swap_goes_through_temporaries() {
        let source = "\
def f(a: int, b: int) -> int:
    a, b = b, a
    return a - b
";
        let (module, reporter) = run(source);
        let module = module.unwrap_or_else(|| panic!("{:?}", reporter.diagnostics()));
        let (_, function) = module.exported_functions().next().unwrap();
        let temporaries = function
            .locals
            .iter()
            .filter(|&&id| module.symbols.symbol(id).name.starts_with("_tmp"))
            .count();
        assert_eq!(temporaries, 2);
    }

    #[test]
    fn integer_division_yields_float() {
        let source = "\
def f(a: int, b: int):
    return a / b, a // b
";
        let (module, _) = run(source);
        let module = module.unwrap();
        let (_, function) = module.exported_functions().next().unwrap();
        assert_eq!(function.results, vec![TypeDescriptor::float(), TypeDescriptor::int()]);
    }

    #[test]
    fn overload_mismatch_lists_candidates() {
        let source = "\
def f(x: 'float[:]') -> float:
    return x[0]

def g() -> float:
    return f(3)
";
        let (module, reporter) = run(source);
        assert!(module.is_none());
        let diagnostic = reporter
            .diagnostics()
            .iter()
            .find(|d| d.code == codes::NO_MATCHING_OVERLOAD)
            .unwrap();
        assert!(diagnostic.notes.iter().any(|n| n.contains("candidate")));
    }

    #[test]
    fn recursion_needs_a_return_annotation() {
        let source = "\
def fact(n: int):
    if n <= 1:
        return 1
    return n * fact(n - 1)
";
        let (module, reporter) = run(source);
        assert!(module.is_none());
        assert!(codes_of(&reporter).contains(&codes::RECURSIVE_INFERENCE.to_string()));
    }

    #[test]
    fn numpy_allocation_carries_shape_and_order() {
        let source = "\
import numpy as np

def f() -> float:
    a = np.zeros((3, 4), dtype=np.int32, order='F')
    return np.sum(a) * 1.0
";
        let (module, reporter) = run(source);
        let module = module.unwrap_or_else(|| panic!("{:?}", reporter.diagnostics()));
        let (_, function) = module.exported_functions().next().unwrap();
        let a = module.symbols.symbol(function.locals[0]);
        assert_eq!(a.ty.dtype(), Some(Dtype::Int32));
        assert_eq!(a.ty.shape, vec![Dim::Known(3), Dim::Known(4)]);
        assert_eq!(a.ty.order, Order::F);
    }

    #[test]
    fn pure_functions_cannot_print() {
        let source = "\
@pure
def f(x: int) -> int:
    print(x)
    return x
";
        let (module, reporter) = run(source);
        assert!(module.is_none());
        assert!(codes_of(&reporter).contains(&codes::UNSUPPORTED_CONSTRUCT.to_string()));
    }
}

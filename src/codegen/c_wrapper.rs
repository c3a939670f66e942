//! Wrapper translation unit for the C backend: one `pyaot_wrap_*` entry per
//! function instance, one `pyaot_global_*` accessor per module variable, the
//! run-once module initialiser and the release routine for result buffers.

use super::c_emitter::c_type;
use super::interface::{ArgSpec, InstanceInterface, WrapperInterface};
use super::{FileKind, GeneratedFile, NameTable};
use crate::semantic::{TypeDescriptor, TypedModule};
use crate::wrapper::abi::{self, order_code};
use std::fmt::Write;

pub(super) fn emit(module: &TypedModule, interface: &WrapperInterface, names: &NameTable) -> GeneratedFile {
    let mut out = String::new();
    let _ = writeln!(out, "/* Generated by pyaot from {}.py. Do not edit. */", module.name);
    out.push('\n');
    for include in ["stdint.h", "stdbool.h", "stdlib.h", "complex.h"] {
        let _ = writeln!(out, "#include <{}>", include);
    }
    let _ = writeln!(out, "#include \"{}.h\"", module.name);
    out.push('\n');
    out.push_str(abi::C_DECLARATIONS);

    for instance in interface.instances() {
        out.push('\n');
        emit_instance(&mut out, instance, names);
    }

    for global in &interface.globals {
        let ty = element_type(global.dtype);
        let name = names.global(module, &global.name);
        out.push('\n');
        let _ = writeln!(out, "int32_t {}(pyaot_arg *out)", global.symbol);
        out.push_str("{\n");
        if global.rank == 0 {
            let _ = writeln!(out, "    out->data = (void *)&{};", name);
        } else {
            let _ = writeln!(out, "    out->data = (void *){};", name);
            for axis in 0..global.rank {
                let _ = writeln!(out, "    out->shape[{}] = {}_shape{};", axis, name, axis);
            }
        }
        let _ = writeln!(out, "    out->dtype = {};", global.dtype.code());
        let _ = writeln!(out, "    out->rank = {};", global.rank);
        let _ = writeln!(out, "    out->order = {};", order_code(global.order));
        let _ = writeln!(out, "    pyaot_fill_strides(out, (int64_t)sizeof({}));", ty);
        let _ = writeln!(out, "    return {};", abi::STATUS_OK);
        out.push_str("}\n");
    }

    out.push('\n');
    let _ = writeln!(out, "void {}(void)", interface.init_symbol);
    out.push_str("{\n");
    out.push_str("    static bool done = false;\n");
    out.push_str("    if (done) {\n        return;\n    }\n");
    out.push_str("    done = true;\n");
    let _ = writeln!(out, "    {}();", names.init());
    out.push_str("}\n");

    out.push('\n');
    let _ = writeln!(out, "void {}(void *data)", interface.release_symbol);
    out.push_str("{\n    free(data);\n}\n");

    GeneratedFile {
        name: format!("{}_wrapper.c", module.name),
        kind: FileKind::Wrapper,
        contents: out,
    }
}

fn emit_instance(out: &mut String, instance: &InstanceInterface, names: &NameTable) {
    let _ = writeln!(
        out,
        "int32_t {}(pyaot_arg *args, int64_t nargs, pyaot_arg *results)",
        instance.symbol
    );
    out.push_str("{\n");
    if instance.params.is_empty() {
        out.push_str("    (void)args;\n");
    }
    if instance.results.is_empty() {
        out.push_str("    (void)results;\n");
    }
    let _ = writeln!(
        out,
        "    if (nargs != {}) {{\n        return {};\n    }}",
        instance.params.len(),
        abi::STATUS_BAD_COUNT
    );
    for (k, param) in instance.params.iter().enumerate() {
        check(out, &format!("args[{}]", k), param);
    }

    let mut call_args = Vec::new();
    for (k, param) in instance.params.iter().enumerate() {
        let ty = element_type(param.dtype);
        if param.rank == 0 {
            call_args.push(format!("*(const {} *)args[{}].data", ty, k));
        } else {
            call_args.push(format!("({} *)args[{}].data", ty, k));
            for axis in 0..param.rank {
                call_args.push(format!("args[{}].shape[{}]", k, axis));
            }
        }
    }

    for (k, result) in instance.results.iter().enumerate() {
        let _ = writeln!(out, "    results[{}].dtype = {};", k, result.dtype.code());
        let _ = writeln!(out, "    results[{}].rank = 0;", k);
    }
    let callee = names.function(&instance.mangled);
    match instance.results.as_slice() {
        [] => {
            let _ = writeln!(out, "    {}({});", callee, call_args.join(", "));
        }
        [single] => {
            let _ = writeln!(
                out,
                "    *({} *)results[0].data = {}({});",
                element_type(single.dtype),
                callee,
                call_args.join(", ")
            );
        }
        several => {
            for (k, result) in several.iter().enumerate() {
                call_args.push(format!("({} *)results[{}].data", element_type(result.dtype), k));
            }
            let _ = writeln!(out, "    {}({});", callee, call_args.join(", "));
        }
    }
    let _ = writeln!(out, "    return {};", abi::STATUS_OK);
    out.push_str("}\n");
}

/// Reject a descriptor that does not match the parameter
fn check(out: &mut String, arg: &str, spec: &ArgSpec) {
    let _ = writeln!(
        out,
        "    if ({}.dtype != {}) {{\n        return {};\n    }}",
        arg,
        spec.dtype.code(),
        abi::STATUS_BAD_DTYPE
    );
    let _ = writeln!(
        out,
        "    if ({}.rank != {}) {{\n        return {};\n    }}",
        arg,
        spec.rank,
        abi::STATUS_BAD_RANK
    );
    if spec.order_matters() {
        let _ = writeln!(
            out,
            "    if ({}.order != {}) {{\n        return {};\n    }}",
            arg,
            order_code(spec.order),
            abi::STATUS_BAD_ORDER
        );
    }
}

fn element_type(dtype: crate::semantic::Dtype) -> &'static str {
    c_type(&TypeDescriptor::from_dtype(dtype))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codegen::Language;
    use crate::diagnostics::DiagnosticReporter;
    use crate::parser::parse_source;
    use crate::semantic::{analyze, SearchPathResolver};

    fn wrapper(source: &str) -> String {
        let mut reporter = DiagnosticReporter::new("m.py", source);
        let ast = parse_source(source, &mut reporter);
        let mut resolver = SearchPathResolver::new(Vec::new());
        let module = analyze(&ast, "m", false, &mut resolver, &mut reporter)
            .unwrap_or_else(|| panic!("{:?}", reporter.diagnostics()));
        let interface = WrapperInterface::from_module(&module, Language::C);
        let names = NameTable::new(&module, Language::C);
        emit(&module, &interface, &names).contents
    }

    #[test]
    fn arrays_are_checked_then_forwarded() {
        let c = wrapper("\
def total(a: 'float[:,:](order=F)') -> float:
    s = 0.0
    for j in range(a.shape[1]):
        for i in range(a.shape[0]):
            s += a[i, j]
    return s
");
        assert!(c.contains("int32_t pyaot_wrap_total(pyaot_arg *args, int64_t nargs, pyaot_arg *results)"));
        assert!(c.contains("if (args[0].dtype != 6) {"), "{}", c);
        assert!(c.contains("if (args[0].rank != 2) {"));
        assert!(c.contains("if (args[0].order != 1) {"));
        assert!(c.contains("*(double *)results[0].data = total((double *)args[0].data, args[0].shape[0], args[0].shape[1]);"), "{}", c);
    }

    #[test]
    fn module_variables_have_accessors() {
        let c = wrapper("\
import numpy as np
a = np.array([1, 2, 3, 4, 5])
n = 3
");
        assert!(c.contains("int32_t pyaot_global_a(pyaot_arg *out)"));
        assert!(c.contains("out->shape[0] = a_shape0;"));
        assert!(c.contains("out->data = (void *)&n;"));
        assert!(c.contains("void pyaot_init_m(void)"));
        assert!(c.contains("m__init();"));
        assert!(c.contains("void pyaot_release_m(void *data)\n{\n    free(data);\n}"), "{}", c);
    }

    #[test]
    fn wrappers_call_the_escaped_names() {
        let c = wrapper("\
def fmod(a: int, b: int) -> int:
    return a - b

long = 3
");
        assert!(c.contains("int32_t pyaot_wrap_fmod(pyaot_arg *args"), "{}", c);
        assert!(c.contains("= fmod_(*(const int64_t *)args[0].data"), "{}", c);
        assert!(c.contains("int32_t pyaot_global_long(pyaot_arg *out)"), "{}", c);
        assert!(c.contains("out->data = (void *)&long_;"), "{}", c);
    }

    #[test]
    fn several_results_are_written_through_pointers() {
        let c = wrapper("\
def divmod_(a: int, b: int):
    return a // b, a % b
");
        assert!(c.contains("divmod_(*(const int64_t *)args[0].data, *(const int64_t *)args[1].data, (int64_t *)results[0].data, (int64_t *)results[1].data);"), "{}", c);
    }
}

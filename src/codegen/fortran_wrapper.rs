//! Wrapper module for the Fortran backend. Entry points are `bind(c)` so
//! the loader can resolve them by their plain names; inside the module they
//! carry positional names, which cannot clash whatever the case of the
//! exported ones. Array descriptors are turned into Fortran pointers with
//! `c_f_pointer`; C-ordered data gets its extents reversed to match the
//! emitter's storage convention. Array results are copied into `malloc`ed
//! buffers the loader frees through the release routine.

use super::interface::{ArgSpec, InstanceInterface, WrapperInterface};
use super::{FileKind, GeneratedFile, NameTable};
use crate::semantic::{Dtype, Order, TypeDescriptor, TypedModule};
use crate::wrapper::abi::{self, order_code};
use std::fmt::Write;

/// C allocator entry points used for array results
const ALLOCATOR_INTERFACES: &str = "\
interface
  function pyaot_malloc(size) result(data) bind(c, name=\"malloc\")
    import :: c_ptr, c_size_t
    integer(c_size_t), value :: size
    type(c_ptr) :: data
  end function pyaot_malloc
  subroutine pyaot_free(data) bind(c, name=\"free\")
    import :: c_ptr
    type(c_ptr), value :: data
  end subroutine pyaot_free
end interface
";

pub(super) fn emit(module: &TypedModule, interface: &WrapperInterface, names: &NameTable) -> GeneratedFile {
    let name = names.module();
    let mut out = String::new();
    let _ = writeln!(out, "! Generated by pyaot from {}.py. Do not edit.", module.name);
    let _ = writeln!(out, "module {}_wrapper", name);
    out.push('\n');
    out.push_str("  use iso_c_binding\n");
    let _ = writeln!(out, "  use {}", name);
    out.push('\n');
    out.push_str("  implicit none\n\n");
    for line in abi::FORTRAN_DECLARATIONS.lines().chain(ALLOCATOR_INTERFACES.lines()) {
        let _ = writeln!(out, "  {}", line);
    }
    out.push_str("\ncontains\n");

    for (k, instance) in interface.instances().enumerate() {
        out.push('\n');
        emit_instance(&mut out, k, instance, names);
    }

    for (k, global) in interface.globals.iter().enumerate() {
        let procedure = format!("pyaot_g{}", k);
        let variable = names.global(module, &global.name);
        out.push('\n');
        let _ = writeln!(
            out,
            "  function {}(out) result(status) bind(c, name=\"{}\")",
            procedure, global.symbol
        );
        out.push_str("    type(pyaot_arg), intent(inout) :: out\n");
        out.push_str("    integer(c_int32_t) :: status\n");
        if global.rank == 0 {
            let _ = writeln!(out, "    out%data = c_loc({})", variable);
        } else {
            let _ = writeln!(out, "    if (allocated({})) then", variable);
            let _ = writeln!(out, "      out%data = c_loc({})", variable);
            for axis in 0..global.rank {
                let dim = storage_dim(global.rank, global.order, axis);
                let _ = writeln!(out, "      out%shape({}) = size({}, {}, c_int64_t)", axis + 1, variable, dim);
            }
            out.push_str("    else\n");
            out.push_str("      out%data = c_null_ptr\n");
            out.push_str("      out%shape = 0\n");
            out.push_str("    end if\n");
        }
        let _ = writeln!(out, "    out%dtype = {}", global.dtype.code());
        let _ = writeln!(out, "    out%rank = {}", global.rank);
        let _ = writeln!(out, "    out%order = {}", order_code(global.order));
        let _ = writeln!(out, "    call pyaot_fill_strides(out, {}_c_int64_t)", global.dtype.size());
        let _ = writeln!(out, "    status = {}", abi::STATUS_OK);
        let _ = writeln!(out, "  end function {}", procedure);
    }

    out.push('\n');
    out.push_str("  subroutine pyaot_fill_strides(arg, itemsize)\n");
    out.push_str("    type(pyaot_arg), intent(inout) :: arg\n");
    out.push_str("    integer(c_int64_t), value :: itemsize\n");
    out.push_str("    integer(c_int64_t) :: step\n");
    out.push_str("    integer :: k, axis\n");
    out.push_str("    step = itemsize\n");
    out.push_str("    do k = 1, arg%rank\n");
    let _ = writeln!(out, "      if (arg%order == {}) then", abi::ORDER_C);
    out.push_str("        axis = arg%rank + 1 - k\n");
    out.push_str("      else\n");
    out.push_str("        axis = k\n");
    out.push_str("      end if\n");
    out.push_str("      arg%strides(axis) = step\n");
    out.push_str("      step = step * arg%shape(axis)\n");
    out.push_str("    end do\n");
    out.push_str("  end subroutine pyaot_fill_strides\n");

    out.push('\n');
    let _ = writeln!(
        out,
        "  subroutine pyaot_init() bind(c, name=\"{}\")",
        interface.init_symbol
    );
    out.push_str("    logical, save :: done = .false.\n");
    out.push_str("    if (done) return\n");
    out.push_str("    done = .true.\n");
    let _ = writeln!(out, "    call {}()", names.init());
    out.push_str("  end subroutine pyaot_init\n");

    out.push('\n');
    let _ = writeln!(
        out,
        "  subroutine pyaot_release(data) bind(c, name=\"{}\")",
        interface.release_symbol
    );
    out.push_str("    type(c_ptr), value :: data\n");
    out.push_str("    call pyaot_free(data)\n");
    out.push_str("  end subroutine pyaot_release\n");

    let _ = writeln!(out, "\nend module {}_wrapper", name);

    GeneratedFile {
        name: format!("{}_wrapper.f90", module.name),
        kind: FileKind::Wrapper,
        contents: out,
    }
}

fn emit_instance(out: &mut String, position: usize, instance: &InstanceInterface, names: &NameTable) {
    let procedure = format!("pyaot_w{}", position);
    let _ = writeln!(
        out,
        "  function {}(args, nargs, results) result(status) bind(c, name=\"{}\")",
        procedure, instance.symbol
    );
    out.push_str("    type(pyaot_arg), intent(inout) :: args(*)\n");
    out.push_str("    integer(c_int64_t), value :: nargs\n");
    out.push_str("    type(pyaot_arg), intent(inout) :: results(*)\n");
    out.push_str("    integer(c_int32_t) :: status\n");
    for (k, param) in instance.params.iter().enumerate() {
        let _ = writeln!(out, "    {}, pointer :: pyaot_a{}{}", element_type(param.dtype), k, pointer_shape(param.rank));
    }
    for (k, result) in instance.results.iter().enumerate() {
        let element = element_type(result.dtype);
        let shape = pointer_shape(result.rank);
        if result.rank > 0 {
            let _ = writeln!(out, "    {}, allocatable :: pyaot_v{}{}", element, k, shape);
        }
        let _ = writeln!(out, "    {}, pointer :: pyaot_r{}{}", element, k, shape);
    }

    let _ = writeln!(out, "    status = {}", abi::STATUS_BAD_COUNT);
    let _ = writeln!(out, "    if (nargs /= {}) return", instance.params.len());
    for (k, param) in instance.params.iter().enumerate() {
        check(out, k + 1, param);
    }

    for (k, param) in instance.params.iter().enumerate() {
        if param.rank == 0 {
            let _ = writeln!(out, "    call c_f_pointer(args({})%data, pyaot_a{})", k + 1, k);
        } else {
            let extents: Vec<String> = (0..param.rank)
                .map(|axis| format!("args({})%shape({})", k + 1, storage_axis(param, axis) + 1))
                .collect();
            let _ = writeln!(
                out,
                "    call c_f_pointer(args({})%data, pyaot_a{}, [{}])",
                k + 1,
                k,
                extents.join(", ")
            );
        }
    }
    for (k, result) in instance.results.iter().enumerate() {
        let _ = writeln!(out, "    results({})%dtype = {}", k + 1, result.dtype.code());
        let _ = writeln!(out, "    results({})%rank = 0", k + 1);
        if result.rank == 0 {
            let _ = writeln!(out, "    call c_f_pointer(results({})%data, pyaot_r{})", k + 1, k);
        }
    }

    // Array results arrive in `pyaot_v<k>`, scalars straight in the
    // caller's storage
    let receiver = |k: usize, result: &ArgSpec| {
        if result.rank > 0 {
            format!("pyaot_v{}", k)
        } else {
            format!("pyaot_r{}", k)
        }
    };
    let callee = names.function(&instance.mangled);
    let mut call_args: Vec<String> = (0..instance.params.len()).map(|k| format!("pyaot_a{}", k)).collect();
    match instance.results.as_slice() {
        [] => {
            let _ = writeln!(out, "    call {}({})", callee, call_args.join(", "));
        }
        [single] => {
            let _ = writeln!(out, "    {} = {}({})", receiver(0, single), callee, call_args.join(", "));
        }
        several => {
            call_args.extend(several.iter().enumerate().map(|(k, r)| receiver(k, r)));
            let _ = writeln!(out, "    call {}({})", callee, call_args.join(", "));
        }
    }
    for (k, result) in instance.results.iter().enumerate().filter(|(_, r)| r.rank > 0) {
        emit_array_result(out, k, result);
    }
    let _ = writeln!(out, "    status = {}", abi::STATUS_OK);
    let _ = writeln!(out, "  end function {}", procedure);
}

/// Copy `pyaot_v<k>` into a fresh buffer described by `results(k + 1)`
fn emit_array_result(out: &mut String, k: usize, result: &ArgSpec) {
    let position = k + 1;
    let size = result.dtype.size();
    let _ = writeln!(
        out,
        "    results({})%data = pyaot_malloc(int(max(1_c_int64_t, size(pyaot_v{}, kind=c_int64_t)) * {}_c_int64_t, c_size_t))",
        position, k, size
    );
    let _ = writeln!(
        out,
        "    call c_f_pointer(results({})%data, pyaot_r{}, shape(pyaot_v{}))",
        position, k, k
    );
    let _ = writeln!(out, "    pyaot_r{} = pyaot_v{}", k, k);
    for axis in 0..result.rank {
        let dim = storage_dim(result.rank, result.order, axis);
        let _ = writeln!(
            out,
            "    results({})%shape({}) = size(pyaot_v{}, {}, c_int64_t)",
            position,
            axis + 1,
            k,
            dim
        );
    }
    let _ = writeln!(out, "    results({})%rank = {}", position, result.rank);
    let _ = writeln!(out, "    results({})%order = {}", position, order_code(result.order));
    let _ = writeln!(out, "    call pyaot_fill_strides(results({}), {}_c_int64_t)", position, size);
}

/// Status-setting checks for the 1-based argument `position`
fn check(out: &mut String, position: usize, spec: &ArgSpec) {
    let _ = writeln!(out, "    status = {}", abi::STATUS_BAD_DTYPE);
    let _ = writeln!(out, "    if (args({})%dtype /= {}) return", position, spec.dtype.code());
    let _ = writeln!(out, "    status = {}", abi::STATUS_BAD_RANK);
    let _ = writeln!(out, "    if (args({})%rank /= {}) return", position, spec.rank);
    if spec.order_matters() {
        let _ = writeln!(out, "    status = {}", abi::STATUS_BAD_ORDER);
        let _ = writeln!(out, "    if (args({})%order /= {}) return", position, order_code(spec.order));
    }
}

/// Python axis stored as Fortran dimension `dim` (0-based) of the pointer
fn storage_axis(spec: &ArgSpec, dim: usize) -> usize {
    match spec.order {
        Order::C => spec.rank - 1 - dim,
        Order::F => dim,
    }
}

/// Fortran dimension (1-based) holding Python axis `axis`
fn storage_dim(rank: usize, order: Order, axis: usize) -> usize {
    match order {
        Order::C => rank - axis,
        Order::F => axis + 1,
    }
}

fn pointer_shape(rank: usize) -> String {
    if rank == 0 {
        String::new()
    } else {
        format!("({})", vec![":"; rank].join(","))
    }
}

fn element_type(dtype: Dtype) -> String {
    super::fortran_emitter::f_type(&TypeDescriptor::from_dtype(dtype))
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
        let interface = WrapperInterface::from_module(&module, Language::Fortran);
        let names = NameTable::new(&module, Language::Fortran);
        emit(&module, &interface, &names).contents
    }

    #[test]
    fn c_ordered_arguments_get_reversed_extents() {
        let f90 = wrapper("\
def trace(a: 'float[:,:]') -> float:
    t = 0.0
    for i in range(a.shape[0]):
        t += a[i, i]
    return t
");
        assert!(
            f90.contains("function pyaot_w0(args, nargs, results) result(status) bind(c, name=\"pyaot_wrap_trace\")"),
            "{}",
            f90
        );
        assert!(f90.contains("real(c_double), pointer :: pyaot_a0(:,:)"));
        assert!(f90.contains("call c_f_pointer(args(1)%data, pyaot_a0, [args(1)%shape(2), args(1)%shape(1)])"), "{}", f90);
        assert!(f90.contains("pyaot_r0 = trace(pyaot_a0)"));
        assert!(f90.contains("if (args(1)%order /= 0) return"));
    }

    #[test]
    fn init_runs_once() {
        let f90 = wrapper("x = 2.5\n");
        assert!(f90.contains("subroutine pyaot_init() bind(c, name=\"pyaot_init_m\")"), "{}", f90);
        assert!(f90.contains("logical, save :: done = .false."));
        assert!(f90.contains("call m__init()"));
        assert!(f90.contains("out%data = c_loc(x)"));
        assert!(f90.contains("subroutine pyaot_release(data) bind(c, name=\"pyaot_release_m\")"));
    }

    #[test]
    fn case_twins_export_distinct_procedures() {
        let f90 = wrapper("\
def f(a: int) -> int:
    return a + 1

def F(a: int) -> int:
    return a - 1
");
        assert!(f90.contains("function pyaot_w0(args, nargs, results) result(status) bind(c, name=\"pyaot_wrap_f\")"), "{}", f90);
        assert!(f90.contains("function pyaot_w1(args, nargs, results) result(status) bind(c, name=\"pyaot_wrap_F\")"), "{}", f90);
        assert!(f90.contains("pyaot_r0 = f(pyaot_a0)"), "{}", f90);
        assert!(f90.contains("pyaot_r0 = F_1(pyaot_a0)"), "{}", f90);
    }

    #[test]
    fn array_results_are_copied_into_malloc_buffers() {
        let f90 = wrapper("\
def twice(a: 'float[:,:]'):
    b = a * 2.0
    return b
");
        assert!(f90.contains("real(c_double), allocatable :: pyaot_v0(:,:)"), "{}", f90);
        assert!(f90.contains("pyaot_v0 = twice(pyaot_a0)"), "{}", f90);
        assert!(
            f90.contains("results(1)%data = pyaot_malloc(int(max(1_c_int64_t, size(pyaot_v0, kind=c_int64_t)) * 8_c_int64_t, c_size_t))"),
            "{}",
            f90
        );
        assert!(f90.contains("call c_f_pointer(results(1)%data, pyaot_r0, shape(pyaot_v0))"));
        assert!(f90.contains("results(1)%shape(1) = size(pyaot_v0, 2, c_int64_t)"), "{}", f90);
        assert!(f90.contains("results(1)%rank = 2\n    results(1)%order = 0"), "{}", f90);
    }
}

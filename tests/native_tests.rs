//! Round trips through the native toolchain and the loader. Each test is
//! skipped when the compiler it needs is not on PATH.

use pyaot::semantic::Order;
use pyaot::wrapper::{Module, NdArray, Scalar, Value};
use pyaot::{CompileRequest, Driver, Language, PipelineState};
use std::fs;
use std::path::Path;

fn has(tool: &str) -> bool {
    let found = which::which(tool).is_ok();
    if !found {
        eprintln!("skipping: `{}` not found on PATH", tool);
    }
    found
}

fn load(dir: &Path, name: &str, source: &str, language: Language) -> Module {
    let path = dir.join(name);
    fs::write(&path, source).unwrap();
    let mut request = CompileRequest::new(path);
    request.set_language(language).set_compiler("GNU");
    let (compilation, module) = Driver::new(request)
        .compile_and_load()
        .unwrap_or_else(|e| panic!("compilation failed: {}", e));
    assert_eq!(compilation.state, PipelineState::Wrapped);
    module
}

const ARRAY_MAX: &str = "\
def array_max(a: 'float[:]') -> float:
    m = a[0]
    for i in range(1, len(a)):
        if a[i] > m:
            m = a[i]
    return m
";

const MODULE_ARRAY: &str = "\
import numpy as np

a = np.array([1, 2, 3, 4, 5])

def set_a():
    a[3] = 10

def get_a(i: int) -> int:
    return a[i]
";

const SCALE: &str = "\
def scale(x: 'float[:]', factor: float):
    for i in range(len(x)):
        x[i] = x[i] * factor
";

const TWICE: &str = "\
def twice(x: 'int | float'):
    return x + x
";

const SHADOW: &str = "\
def shadow(n: int) -> int:
    x = 0
    for i in range(n):
        i = i * 2
        x += i
    return x

def last(n: int) -> int:
    i = -1
    for i in range(n):
        pass
    return i
";

const AXPY: &str = "\
import numpy as np

def axpy(k: float, x: 'float[:]', y: 'float[:]') -> float:
    z = k * x + y
    z += 1.0
    return np.sum(z) + np.max(z * 2.0)
";

const DOUBLED: &str = "\
def doubled(a: 'float[:,:]'):
    b = a * 2.0
    return b

def halves(a: 'float[:]'):
    return a * 0.5, a * 0.25
";

const AWKWARD: &str = "\
def fmod(double: int, int_: int) -> int:
    return double - int_

def result(function: int) -> int:
    allocate = fmod(function, 1)
    return allocate
";

fn array_max(language: Language, tool: &str, name: &str) {
    if !has(tool) {
        return;
    }
    let dir = tempfile::tempdir().unwrap();
    let module = load(dir.path(), name, ARRAY_MAX, language);
    let mut args = [Value::from(vec![3.0f64, 1.0, 4.0, 1.5])];
    let result = module.call("array_max", &mut args).unwrap();
    assert_eq!(result.as_f64(), Some(4.0));
}

#[test]
fn array_max_in_c() {
    array_max(Language::C, "gcc", "max_c.py");
}

#[test]
fn array_max_in_fortran() {
    array_max(Language::Fortran, "gfortran", "max_f.py");
}

fn module_array_round_trip(language: Language, tool: &str, name: &str) {
    if !has(tool) {
        return;
    }
    let dir = tempfile::tempdir().unwrap();
    let module = load(dir.path(), name, MODULE_ARRAY, language);

    let before = module.global("a").unwrap();
    let array = before.as_array().unwrap();
    assert_eq!(array.shape(), &[5]);
    assert_eq!(array.to_vec::<i64>().unwrap(), vec![1, 2, 3, 4, 5]);

    module.call("set_a", &mut []).unwrap();
    let value = module.call("get_a", &mut [Value::from(3i64)]).unwrap();
    assert_eq!(value.as_i64(), Some(10));

    let mut view = module.global_view("a").unwrap();
    assert_eq!(view.get(&[3]), Some(Scalar::Int64(10)));
    view.set(&[0], Scalar::Int64(-1)).unwrap();
    assert_eq!(module.call("get_a", &mut [Value::from(0i64)]).unwrap().as_i64(), Some(-1));
    assert!(view.set(&[5], Scalar::Int64(0)).is_err());
}

#[test]
fn module_array_round_trip_in_c() {
    module_array_round_trip(Language::C, "gcc", "globals_c.py");
}

#[test]
fn module_array_round_trip_in_fortran() {
    module_array_round_trip(Language::Fortran, "gfortran", "globals_f.py");
}

#[test]
fn array_arguments_are_updated_in_place() {
    if !has("gcc") {
        return;
    }
    let dir = tempfile::tempdir().unwrap();
    let module = load(dir.path(), "scale.py", SCALE, Language::C);
    let mut args = [Value::from(vec![1.0f64, 2.0, 3.0]), Value::from(2i64)];
    assert_eq!(module.call("scale", &mut args).unwrap(), Value::None);
    assert_eq!(args[0].as_array().unwrap().to_vec::<f64>().unwrap(), vec![2.0, 4.0, 6.0]);
}

#[test]
fn overloads_are_chosen_by_argument_dtype() {
    if !has("gcc") {
        return;
    }
    let dir = tempfile::tempdir().unwrap();
    let module = load(dir.path(), "twice.py", TWICE, Language::C);
    let int = module.call("twice", &mut [Value::from(21i64)]).unwrap();
    assert_eq!(int.as_scalar(), Some(&Scalar::Int64(42)));
    let float = module.call("twice", &mut [Value::from(1.25f64)]).unwrap();
    assert_eq!(float.as_scalar(), Some(&Scalar::Float64(2.5)));

    let error = module
        .call("twice", &mut [Value::from(NdArray::from(vec![1i64]))])
        .unwrap_err();
    assert!(error.to_string().contains("no instance of `twice`"));
}

#[test]
fn toolchain_errors_keep_the_compiler_output() {
    if !has("gcc") {
        return;
    }
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("flags.py");
    fs::write(&path, ARRAY_MAX).unwrap();
    let mut request = CompileRequest::new(path);
    request
        .set_language(Language::C)
        .set_compiler("GNU")
        .add_flag("-fno-such-flag-for-pyaot");
    let compilation = Driver::new(request).run();
    assert!(!compilation.succeeded());
    let diagnostic = compilation
        .diagnostics
        .iter()
        .find(|d| d.code == pyaot::diagnostics::codes::TOOLCHAIN_FAILED)
        .unwrap();
    assert!(diagnostic.notes.iter().any(|n| n.contains("fno-such-flag-for-pyaot")));
}

#[test]
fn concurrent_builds_keep_the_working_directory() {
    if !has("gcc") {
        return;
    }
    let before = std::env::current_dir().unwrap();
    let handles: Vec<_> = (0..4)
        .map(|i| {
            std::thread::spawn(move || {
                let dir = tempfile::tempdir().unwrap();
                let module = load(dir.path(), &format!("max_{}.py", i), ARRAY_MAX, Language::C);
                let mut args = [Value::from(vec![1.0f64, 2.0 + i as f64])];
                module.call("array_max", &mut args).unwrap().as_f64()
            })
        })
        .collect();
    for (i, handle) in handles.into_iter().enumerate() {
        assert_eq!(handle.join().unwrap(), Some(2.0 + i as f64));
    }
    assert_eq!(std::env::current_dir().unwrap(), before);
}

fn rebound_loop_variable(language: Language, tool: &str, name: &str) {
    if !has(tool) {
        return;
    }
    let dir = tempfile::tempdir().unwrap();
    let module = load(dir.path(), name, SHADOW, language);
    assert_eq!(module.call("shadow", &mut [Value::from(5i64)]).unwrap().as_i64(), Some(20));
    assert_eq!(module.call("last", &mut [Value::from(4i64)]).unwrap().as_i64(), Some(3));
    assert_eq!(module.call("last", &mut [Value::from(0i64)]).unwrap().as_i64(), Some(-1));
}

#[test]
fn rebound_loop_variable_in_c() {
    rebound_loop_variable(Language::C, "gcc", "shadow_c.py");
}

#[test]
fn rebound_loop_variable_in_fortran() {
    rebound_loop_variable(Language::Fortran, "gfortran", "shadow_f.py");
}

#[test]
fn whole_array_arithmetic_in_c() {
    if !has("gcc") {
        return;
    }
    let dir = tempfile::tempdir().unwrap();
    let module = load(dir.path(), "axpy.py", AXPY, Language::C);
    let mut args = [
        Value::from(2.0f64),
        Value::from(vec![1.0f64, 2.0, 3.0]),
        Value::from(vec![0.5f64, 0.5, 0.5]),
    ];
    // z = [3.5, 5.5, 7.5]
    let result = module.call("axpy", &mut args).unwrap();
    assert_eq!(result.as_f64(), Some(16.5 + 15.0));
}

#[test]
fn array_results_in_fortran() {
    if !has("gfortran") {
        return;
    }
    let dir = tempfile::tempdir().unwrap();
    let module = load(dir.path(), "doubled.py", DOUBLED, Language::Fortran);

    let input = NdArray::from_vec(vec![1.0f64, 2.0, 3.0, 4.0, 5.0, 6.0], &[2, 3], Order::C).unwrap();
    let result = module.call("doubled", &mut [Value::from(input)]).unwrap();
    let array = result.as_array().unwrap();
    assert_eq!(array.shape(), &[2, 3]);
    assert_eq!(array.to_vec::<f64>().unwrap(), vec![2.0, 4.0, 6.0, 8.0, 10.0, 12.0]);

    let result = module.call("halves", &mut [Value::from(vec![4.0f64, 8.0])]).unwrap();
    let Value::Tuple(parts) = result else { panic!("expected two results, got {:?}", result) };
    assert_eq!(parts[0].as_array().unwrap().to_vec::<f64>().unwrap(), vec![2.0, 4.0]);
    assert_eq!(parts[1].as_array().unwrap().to_vec::<f64>().unwrap(), vec![1.0, 2.0]);
}

fn awkward_names(language: Language, tool: &str, name: &str) {
    if !has(tool) {
        return;
    }
    let dir = tempfile::tempdir().unwrap();
    let module = load(dir.path(), name, AWKWARD, language);
    assert_eq!(module.call("fmod", &mut [Value::from(7i64), Value::from(2i64)]).unwrap().as_i64(), Some(5));
    assert_eq!(module.call("result", &mut [Value::from(3i64)]).unwrap().as_i64(), Some(2));
}

#[test]
fn awkward_names_in_c() {
    awkward_names(Language::C, "gcc", "awkward_c.py");
}

#[test]
fn awkward_names_in_fortran() {
    awkward_names(Language::Fortran, "gfortran", "awkward_f.py");
}

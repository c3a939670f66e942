//! Pipeline tests that never reach the native toolchain

use pyaot::build::BUILD_DIR;
use pyaot::codegen::FileKind;
use pyaot::diagnostics::{codes, Stage};
use pyaot::{CompileRequest, Driver, Language, PipelineState, StopPoint};
use std::fs;
use std::path::{Path, PathBuf};

fn write(dir: &Path, name: &str, source: &str) -> PathBuf {
    let path = dir.join(name);
    fs::write(&path, source).unwrap();
    path
}

const KERNELS: &str = "\
import numpy as np

weights = np.array([0.5, 0.25, 0.25])

def dot(x: 'float[:]', y: 'float[:]') -> float:
    total = 0.0
    for i in range(len(x)):
        total += x[i] * y[i]
    return total

def smooth(x: 'float[:]') -> float:
    return dot(x, weights)
";

#[test]
fn stop_points_never_produce_later_outputs() {
    let dir = tempfile::tempdir().unwrap();
    let path = write(dir.path(), "kernels.py", KERNELS);

    for (stop, state) in [
        (StopPoint::Syntax, PipelineState::Parsed),
        (StopPoint::Semantic, PipelineState::Analyzed),
        (StopPoint::Convert, PipelineState::Generated),
    ] {
        let mut request = CompileRequest::new(&path);
        request.set_stop(stop).set_language(Language::C);
        let compilation = Driver::new(request).run();
        assert!(compilation.succeeded(), "{:?}: {:?}", stop, compilation.diagnostics);
        assert_eq!(compilation.state, state);
        assert!(compilation.artifact.is_none());
        assert_eq!(compilation.typed.is_some(), stop >= StopPoint::Semantic);
        assert_eq!(compilation.code.is_some(), stop == StopPoint::Convert);
        assert_eq!(dir.path().join(BUILD_DIR).exists(), stop == StopPoint::Convert);
    }
}

#[test]
fn both_compiled_backends_emit_a_wrapper() {
    for language in [Language::C, Language::Fortran] {
        let dir = tempfile::tempdir().unwrap();
        let path = write(dir.path(), "kernels.py", KERNELS);
        let mut request = CompileRequest::new(path);
        request.set_stop(StopPoint::Convert).set_language(language);
        let compilation = Driver::new(request).run();
        assert!(compilation.succeeded(), "{}: {:?}", language, compilation.diagnostics);

        let code = compilation.code.unwrap();
        let wrapper = code.files.iter().find(|f| f.kind == FileKind::Wrapper).unwrap();
        assert!(wrapper.contents.contains("pyaot_wrap_dot"));
        assert!(wrapper.contents.contains("pyaot_global_weights"));
        assert!(wrapper.contents.contains("pyaot_init_kernels"));

        let interface = code.interface.unwrap();
        assert_eq!(interface.functions.len(), 2);
        assert_eq!(interface.globals[0].name, "weights");
        assert_eq!(interface.globals[0].rank, 1);
    }
}

#[test]
fn python_backend_needs_a_separate_output_directory() {
    let dir = tempfile::tempdir().unwrap();
    let path = write(dir.path(), "kernels.py", KERNELS);

    let mut request = CompileRequest::new(&path);
    request.set_language(Language::Python);
    let compilation = Driver::new(request).run();
    assert_eq!(compilation.state, PipelineState::Failed(Stage::Configuration));
    assert_eq!(compilation.diagnostics[0].code, codes::OUTPUT_DIR_CONFLICT);
    assert_eq!(fs::read_to_string(&path).unwrap(), KERNELS);

    let out = dir.path().join("pure");
    let mut request = CompileRequest::new(&path);
    request.set_language(Language::Python).set_output_dir(&out);
    let compilation = Driver::new(request).run();
    assert!(compilation.succeeded(), "{:?}", compilation.diagnostics);
    assert_eq!(compilation.state, PipelineState::Generated);
    let generated = fs::read_to_string(out.join("kernels.py")).unwrap();
    assert!(generated.contains("def dot("));
    assert!(compilation.artifact.is_none());
}

#[test]
fn errors_are_accumulated_across_statements() {
    let dir = tempfile::tempdir().unwrap();
    let path = write(
        dir.path(),
        "broken.py",
        "\
def f() -> int:
    return missing_a

def g() -> int:
    return missing_b
",
    );
    let mut request = CompileRequest::new(path);
    request.set_stop(StopPoint::Semantic);
    let compilation = Driver::new(request).run();
    assert_eq!(compilation.state, PipelineState::Failed(Stage::Semantic));
    let undefined: Vec<_> = compilation
        .diagnostics
        .iter()
        .filter(|d| d.code == codes::UNDEFINED_NAME)
        .collect();
    assert_eq!(undefined.len(), 2);
}

#[test]
fn syntax_errors_carry_a_location() {
    let dir = tempfile::tempdir().unwrap();
    let path = write(dir.path(), "bad.py", "def f(:\n    pass\n");
    let compilation = Driver::new(CompileRequest::new(path)).run();
    assert_eq!(compilation.state, PipelineState::Failed(Stage::Syntax));
    let location = compilation.diagnostics[0].location.as_ref().unwrap();
    assert_eq!(location.line, 1);
}

#[test]
fn imported_headers_resolve_from_the_source_directory() {
    let dir = tempfile::tempdir().unwrap();
    write(dir.path(), "blas.pyh", "def ddot(x: 'float[:]', y: 'float[:]') -> float:\n    ...\n");
    let path = write(
        dir.path(),
        "user.py",
        "\
from blas import ddot

def norm2(x: 'float[:]') -> float:
    return ddot(x, x)
",
    );
    let mut request = CompileRequest::new(path);
    request.set_stop(StopPoint::Convert).set_language(Language::C);
    let compilation = Driver::new(request).run();
    assert!(compilation.succeeded(), "{:?}", compilation.diagnostics);
    let code = compilation.code.unwrap();
    let source = code.files.iter().find(|f| f.name == "user.c").unwrap();
    assert!(source.contents.contains("#include \"blas.h\""));
}

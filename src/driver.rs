//! Driver that orchestrates the compilation pipeline.
//!
//! `Parsed → Analyzed → Generated → Built → Wrapped`, stopping early at the
//! requested stop-point. A failed stage ends the run; nothing is retried.

use crate::build::{self, Artifact, BuildOptions, CompilerDescription, BUILD_DIR};
use crate::codegen::{self, FileKind, GeneratedCode, GeneratedFile, Language};
use crate::config::{CompileRequest, StopPoint};
use crate::diagnostics::{self, Diagnostic, DiagnosticReporter, Stage};
use crate::error::{BuildError, CompileError};
use crate::parser::{self, Module as Ast};
use crate::semantic::{self, SearchPathResolver, TypedModule};
use crate::wrapper::Module;
use std::fs;
use std::path::PathBuf;
use tracing::{debug, info};

/// Furthest point a compilation reached
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineState {
    /// Nothing compiled (descriptor export only)
    Pending,
    Parsed,
    Analyzed,
    Generated,
    Built,
    Wrapped,
    Failed(Stage),
}

/// Everything one run produced
#[derive(Debug)]
pub struct Compilation {
    pub state: PipelineState,
    pub diagnostics: Vec<Diagnostic>,
    pub ast: Option<Ast>,
    pub typed: Option<TypedModule>,
    pub code: Option<GeneratedCode>,
    /// Generated files as written to disk
    pub written: Vec<PathBuf>,
    pub artifact: Option<Artifact>,
    /// Exported compiler descriptor
    pub descriptor: Option<PathBuf>,
    pub error: Option<CompileError>,
}

impl Compilation {
    fn new() -> Self {
        Self {
            state: PipelineState::Pending,
            diagnostics: Vec::new(),
            ast: None,
            typed: None,
            code: None,
            written: Vec::new(),
            artifact: None,
            descriptor: None,
            error: None,
        }
    }

    /// Reached the stop-point with no error diagnostics
    pub fn succeeded(&self) -> bool {
        !matches!(self.state, PipelineState::Failed(_)) && !self.diagnostics.iter().any(Diagnostic::is_error)
    }

    pub fn error_count(&self) -> usize {
        self.diagnostics.iter().filter(|d| d.is_error()).count()
    }

    pub fn warning_count(&self) -> usize {
        self.diagnostics.len() - self.error_count()
    }

    fn fail(mut self, error: CompileError, reporter: DiagnosticReporter) -> Self {
        let stage = error.stage();
        info!(%stage, "compilation failed: {}", error);
        self.diagnostics.extend(reporter.take_diagnostics());
        match &error {
            CompileError::Build(e) => self.diagnostics.push(e.to_diagnostic()),
            CompileError::Wrap(e) => self.diagnostics.push(e.to_diagnostic()),
            CompileError::Configuration(e) => self.diagnostics.push(e.to_diagnostic()),
            _ => {}
        }
        self.state = PipelineState::Failed(stage);
        self.error = Some(error);
        self
    }

    fn finish(mut self, reporter: DiagnosticReporter) -> Self {
        info!(state = ?self.state, "compilation finished");
        self.diagnostics.extend(reporter.take_diagnostics());
        self
    }
}

/// The compilation driver
pub struct Driver {
    request: CompileRequest,
}

impl Driver {
    pub fn new(request: CompileRequest) -> Self {
        Self { request }
    }

    pub fn request(&self) -> &CompileRequest {
        &self.request
    }

    /// Run the pipeline up to the requested stop-point
    pub fn run(&mut self) -> Compilation {
        diagnostics::set_error_mode(self.request.error_mode);
        let compilation = Compilation::new();

        if let Err(e) = self.request.validate() {
            let reporter = DiagnosticReporter::new("", "");
            return compilation.fail(e.into(), reporter);
        }
        if self.request.is_export_only() {
            let reporter = DiagnosticReporter::new("", "");
            return match self.export_descriptor() {
                Ok(path) => Compilation {
                    descriptor: path,
                    ..compilation
                }
                .finish(reporter),
                Err(e) => compilation.fail(e.into(), reporter),
            };
        }
        let debug = self.request.effective_debug();

        let path = self.request.source().to_path_buf();
        let source = match fs::read_to_string(&path) {
            Ok(source) => source,
            Err(e) => {
                let reporter = DiagnosticReporter::new("", "");
                return compilation.fail(CompileError::Io { path, source: e }, reporter);
            }
        };
        let file = path.display().to_string();
        let mut reporter = DiagnosticReporter::new(&file, &source);
        let module_name = self.request.module_name();
        info!(file = %file, module = %module_name, stop = ?self.request.stop, "compiling");

        // === Syntax ===
        let ast = parser::parse_source(&source, &mut reporter);
        if reporter.has_errors() {
            return compilation.fail(CompileError::Syntax(file), reporter);
        }
        let mut compilation = Compilation {
            state: PipelineState::Parsed,
            ..compilation
        };
        if self.request.stop == StopPoint::Syntax {
            compilation.ast = Some(ast);
            return compilation.finish(reporter);
        }

        // === Semantic ===
        let mut resolver = SearchPathResolver::new(self.search_paths());
        let typed = semantic::analyze(&ast, &module_name, self.request.is_header(), &mut resolver, &mut reporter);
        compilation.ast = Some(ast);
        let typed = match typed {
            Some(typed) if !reporter.has_errors() => typed,
            _ => return compilation.fail(CompileError::Semantic(file), reporter),
        };
        compilation.state = PipelineState::Analyzed;
        if self.request.stop == StopPoint::Semantic {
            compilation.typed = Some(typed);
            return compilation.finish(reporter);
        }

        // === Code generation ===
        let language = self.request.language;
        let Some(mut code) = codegen::generate(&typed, language, self.request.accelerators, &mut reporter) else {
            let error = CompileError::BackendUnsupported {
                module: module_name,
                language: language.to_string(),
            };
            return compilation.fail(error, reporter);
        };
        compilation.typed = Some(typed);
        compilation.state = PipelineState::Generated;

        let output_dir = self.request.output_dir();
        let target = if self.request.is_header() || language == Language::Python {
            output_dir.clone()
        } else {
            output_dir.join(BUILD_DIR)
        };
        match build::write_sources(&code, &target) {
            Ok(written) => compilation.written = written,
            Err(e) => return compilation.fail(e.into(), reporter),
        }
        if self.request.stop == StopPoint::Convert || self.request.is_header() || !language.is_compiled() {
            compilation.code = Some(code);
            return compilation.finish(reporter);
        }

        // === Build ===
        if language == Language::Fortran {
            if let Some(typed) = &compilation.typed {
                self.attach_interface_modules(typed, &mut code);
            }
        }
        let mut compiler = match CompilerDescription::resolve(self.request.compiler.as_deref()) {
            Ok(compiler) => compiler,
            Err(e) => return compilation.fail(e.into(), reporter),
        };
        compiler.extend_paths(
            &self.search_paths(),
            &self.request.library_dirs,
            &self.request.libraries,
        );
        let options = BuildOptions {
            accelerators: self.request.accelerators,
            debug,
            flags: self.request.flags.clone(),
            wrapper_flags: self.request.wrapper_flags.clone(),
            timeout: self.request.timeout,
            ..BuildOptions::new(compiler.clone())
        };
        let artifact = match build::build(&code, &options, &output_dir) {
            Ok(artifact) => artifact,
            Err(e) => return compilation.fail(e.into(), reporter),
        };
        if let Some(path) = &self.request.export_descriptor {
            if let Err(e) = compiler.save(path) {
                return compilation.fail(e.into(), reporter);
            }
            compilation.descriptor = Some(path.clone());
        }
        compilation.code = Some(code);
        compilation.artifact = Some(artifact);
        compilation.state = PipelineState::Built;
        compilation.finish(reporter)
    }

    /// Run the whole pipeline and load the artifact
    pub fn compile_and_load(&mut self) -> Result<(Compilation, Module), CompileError> {
        self.request.set_stop(StopPoint::Full);
        let mut compilation = self.run();
        if let Some(error) = compilation.error.take() {
            return Err(error);
        }
        let Some(artifact) = &compilation.artifact else {
            return Err(CompileError::BackendUnsupported {
                module: self.request.module_name(),
                language: self.request.language.to_string(),
            });
        };
        let module = Module::open(artifact)?;
        compilation.state = PipelineState::Wrapped;
        Ok((compilation, module))
    }

    /// Source directory, include directories, then the output directory
    fn search_paths(&self) -> Vec<PathBuf> {
        let mut paths = vec![self.request.source_dir()];
        paths.extend(self.request.include_dirs.iter().cloned());
        let output = self.request.output_dir();
        if !paths.contains(&output) {
            paths.push(output);
        }
        paths
    }

    /// `use` of an imported header needs its interface module compiled
    /// first, so the generated interface is added ahead of the sources.
    fn attach_interface_modules(&self, typed: &TypedModule, code: &mut GeneratedCode) {
        for header in typed.headers.iter().rev() {
            let name = format!("{}.f90", header.module);
            let found = self
                .search_paths()
                .into_iter()
                .map(|dir| dir.join(&name))
                .find(|path| path.is_file());
            match found.map(|path| fs::read_to_string(path)) {
                Some(Ok(contents)) => {
                    debug!(header = %header.module, "interface module attached");
                    code.files.insert(
                        0,
                        GeneratedFile {
                            name,
                            kind: FileKind::Source,
                            contents,
                        },
                    );
                }
                _ => debug!(header = %header.module, "no interface module found; compile the header first"),
            }
        }
    }

    fn export_descriptor(&self) -> Result<Option<PathBuf>, BuildError> {
        let Some(path) = &self.request.export_descriptor else {
            return Ok(None);
        };
        let mut compiler = CompilerDescription::resolve(self.request.compiler.as_deref())?;
        compiler.extend_paths(
            &self.request.include_dirs,
            &self.request.library_dirs,
            &self.request.libraries,
        );
        compiler.save(path)?;
        info!(path = %path.display(), family = %compiler.family, "compiler descriptor exported");
        Ok(Some(path.clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::diagnostics::codes;

    fn source(dir: &std::path::Path, name: &str, text: &str) -> PathBuf {
        let path = dir.join(name);
        fs::write(&path, text).unwrap();
        path
    }

    const MAX: &str = "\
def array_max(a: 'float[:]') -> float:
    m = a[0]
    for i in range(1, len(a)):
        if a[i] > m:
            m = a[i]
    return m
";

    #[test]
    fn syntax_stop_produces_only_an_ast() {
        let dir = tempfile::tempdir().unwrap();
        let path = source(dir.path(), "m.py", MAX);
        let mut request = CompileRequest::new(path);
        request.set_stop(StopPoint::Syntax);
        let compilation = Driver::new(request).run();
        assert!(compilation.succeeded());
        assert_eq!(compilation.state, PipelineState::Parsed);
        assert!(compilation.ast.is_some());
        assert!(compilation.typed.is_none() && compilation.code.is_none());
        assert!(!dir.path().join(BUILD_DIR).exists());
    }

    #[test]
    fn semantic_stop_produces_no_code() {
        let dir = tempfile::tempdir().unwrap();
        let path = source(dir.path(), "m.py", MAX);
        let mut request = CompileRequest::new(path);
        request.set_stop(StopPoint::Semantic);
        let compilation = Driver::new(request).run();
        assert_eq!(compilation.state, PipelineState::Analyzed);
        assert!(compilation.typed.is_some());
        assert!(compilation.code.is_none() && compilation.written.is_empty());
    }

    #[test]
    fn convert_writes_sources_without_building() {
        let dir = tempfile::tempdir().unwrap();
        let path = source(dir.path(), "m.py", MAX);
        let mut request = CompileRequest::new(path);
        request.set_stop(StopPoint::Convert).set_language(Language::C);
        let compilation = Driver::new(request).run();
        assert!(compilation.succeeded(), "{:?}", compilation.diagnostics);
        assert_eq!(compilation.state, PipelineState::Generated);
        assert!(dir.path().join(BUILD_DIR).join("m.c").is_file());
        assert!(dir.path().join(BUILD_DIR).join("m_wrapper.c").is_file());
        assert!(compilation.artifact.is_none());
    }

    #[test]
    fn semantic_errors_fail_the_stage() {
        let dir = tempfile::tempdir().unwrap();
        let path = source(dir.path(), "m.py", "def f() -> int:\n    return y\n");
        let compilation = Driver::new(CompileRequest::new(path)).run();
        assert_eq!(compilation.state, PipelineState::Failed(Stage::Semantic));
        assert!(compilation.diagnostics.iter().any(|d| d.code == codes::UNDEFINED_NAME));
        assert!(matches!(compilation.error, Some(CompileError::Semantic(_))));
    }

    #[test]
    fn configuration_errors_stop_before_parsing() {
        let dir = tempfile::tempdir().unwrap();
        let a = source(dir.path(), "a.py", MAX);
        let b = source(dir.path(), "b.py", MAX);
        let compilation = Driver::new(CompileRequest::with_files(vec![a, b])).run();
        assert_eq!(compilation.state, PipelineState::Failed(Stage::Configuration));
        assert!(compilation.ast.is_none());
        assert_eq!(compilation.diagnostics[0].code, codes::MULTIPLE_FILES);
        assert!(compilation.diagnostics[0].is_fatal());
    }

    #[test]
    fn headers_stop_after_code_generation() {
        let dir = tempfile::tempdir().unwrap();
        let path = source(dir.path(), "ext.pyh", "def norm(x: 'float[:]') -> float:\n    ...\n");
        let mut request = CompileRequest::new(path);
        request.set_language(Language::C);
        let compilation = Driver::new(request).run();
        assert!(compilation.succeeded(), "{:?}", compilation.diagnostics);
        assert_eq!(compilation.state, PipelineState::Generated);
        assert!(dir.path().join("ext.h").is_file());
    }

    #[test]
    fn descriptor_only_requests_export_the_compiler() {
        let dir = tempfile::tempdir().unwrap();
        let mut request = CompileRequest::with_files(Vec::new());
        request.set_compiler("intel").set_export_descriptor(dir.path().join("toolchain"));
        let compilation = Driver::new(request).run();
        assert!(compilation.succeeded(), "{:?}", compilation.diagnostics);
        assert_eq!(compilation.state, PipelineState::Pending);
        let exported = dir.path().join("toolchain.json");
        assert_eq!(compilation.descriptor, Some(exported.clone()));
        assert_eq!(CompilerDescription::load(&exported).unwrap().family, "intel");
    }
}

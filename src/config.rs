//! Compile request and the hard preconditions checked before any stage runs.

use crate::codegen::Language;
use crate::diagnostics::ErrorMode;
use crate::error::ConfigError;
use std::env;
use std::path::{Component, Path, PathBuf};
use std::time::Duration;
use tracing::{debug, warn};

/// Extension appended to descriptor export paths that have none
pub const DESCRIPTOR_EXTENSION: &str = "json";

pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(300);

/// Last pipeline stage to run
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default)]
pub enum StopPoint {
    Syntax,
    Semantic,
    /// Generate code without building it
    Convert,
    #[default]
    Full,
}

/// Accelerators requested for the generated code
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Accelerators {
    pub mpi: bool,
    pub openmp: bool,
    pub openacc: bool,
}

impl Accelerators {
    pub fn any(&self) -> bool {
        self.mpi || self.openmp || self.openacc
    }
}

#[derive(Debug, Clone)]
pub struct CompileRequest {
    pub files: Vec<PathBuf>,
    pub stop: StopPoint,
    pub language: Language,
    pub accelerators: Accelerators,
    /// Family name or path of a `.json` descriptor
    pub compiler: Option<String>,
    pub flags: Vec<String>,
    pub wrapper_flags: Vec<String>,
    pub include_dirs: Vec<PathBuf>,
    pub library_dirs: Vec<PathBuf>,
    pub libraries: Vec<String>,
    pub output_dir: Option<PathBuf>,
    /// `None` defers to `PYAOT_DEBUG`
    pub debug: Option<bool>,
    pub error_mode: ErrorMode,
    pub export_descriptor: Option<PathBuf>,
    pub timeout: Duration,
}

impl CompileRequest {
    pub fn new(file: impl Into<PathBuf>) -> Self {
        Self::with_files(vec![file.into()])
    }

    pub fn with_files(files: Vec<PathBuf>) -> Self {
        Self {
            files,
            stop: StopPoint::default(),
            language: Language::default(),
            accelerators: Accelerators::default(),
            compiler: None,
            flags: Vec::new(),
            wrapper_flags: Vec::new(),
            include_dirs: Vec::new(),
            library_dirs: Vec::new(),
            libraries: Vec::new(),
            output_dir: None,
            debug: None,
            error_mode: ErrorMode::default(),
            export_descriptor: None,
            timeout: DEFAULT_TIMEOUT,
        }
    }

    pub fn set_stop(&mut self, stop: StopPoint) -> &mut Self {
        self.stop = stop;
        self
    }

    pub fn set_language(&mut self, language: Language) -> &mut Self {
        self.language = language;
        self
    }

    pub fn set_accelerators(&mut self, accelerators: Accelerators) -> &mut Self {
        self.accelerators = accelerators;
        self
    }

    pub fn set_compiler(&mut self, compiler: impl Into<String>) -> &mut Self {
        self.compiler = Some(compiler.into());
        self
    }

    pub fn set_output_dir(&mut self, dir: impl Into<PathBuf>) -> &mut Self {
        self.output_dir = Some(dir.into());
        self
    }

    pub fn set_debug(&mut self, debug: bool) -> &mut Self {
        self.debug = Some(debug);
        self
    }

    pub fn set_error_mode(&mut self, mode: ErrorMode) -> &mut Self {
        self.error_mode = mode;
        self
    }

    pub fn set_export_descriptor(&mut self, path: impl Into<PathBuf>) -> &mut Self {
        self.export_descriptor = Some(path.into());
        self
    }

    pub fn set_timeout(&mut self, timeout: Duration) -> &mut Self {
        self.timeout = timeout;
        self
    }

    pub fn add_flag(&mut self, flag: impl Into<String>) -> &mut Self {
        self.flags.push(flag.into());
        self
    }

    pub fn add_include_dir(&mut self, dir: impl Into<PathBuf>) -> &mut Self {
        self.include_dirs.push(dir.into());
        self
    }

    pub fn add_library(&mut self, library: impl Into<String>) -> &mut Self {
        self.libraries.push(library.into());
        self
    }

    pub fn add_library_dir(&mut self, dir: impl Into<PathBuf>) -> &mut Self {
        self.library_dirs.push(dir.into());
        self
    }

    /// The single source file. Only meaningful after [`validate`](Self::validate).
    pub fn source(&self) -> &Path {
        self.files.first().map(PathBuf::as_path).unwrap_or(Path::new(""))
    }

    pub fn is_header(&self) -> bool {
        self.source().extension().is_some_and(|e| e == "pyh")
    }

    pub fn module_name(&self) -> String {
        self.source()
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_default()
    }

    pub fn source_dir(&self) -> PathBuf {
        match self.source().parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
            _ => PathBuf::from("."),
        }
    }

    /// Where generated files and the artifact go
    pub fn output_dir(&self) -> PathBuf {
        self.output_dir.clone().unwrap_or_else(|| self.source_dir())
    }

    /// Debug builds only matter when the toolchain runs
    pub fn effective_debug(&self) -> bool {
        let requested = self
            .debug
            .unwrap_or_else(|| env::var("PYAOT_DEBUG").is_ok_and(|v| matches!(v.as_str(), "1" | "true" | "yes")));
        if requested && self.stop < StopPoint::Full {
            warn!(stop = ?self.stop, "debug flag ignored: no build at this stop point");
            return false;
        }
        requested
    }

    /// Check every hard precondition. The descriptor export path gets the
    /// canonical extension when it has none.
    pub fn validate(&mut self) -> Result<(), ConfigError> {
        self.normalize_descriptor()?;
        match self.files.len() {
            0 if self.export_descriptor.is_some() => return Ok(()),
            0 => return Err(ConfigError::MissingInput),
            1 => {}
            _ => return Err(ConfigError::MultipleFiles(self.files.clone())),
        }
        let source = self.source().to_path_buf();
        match source.extension().and_then(|e| e.to_str()) {
            Some("py" | "pyh") => {}
            other => return Err(ConfigError::BadExtension(other.unwrap_or("").to_string())),
        }
        if !source.is_file() {
            return Err(ConfigError::MissingFile(source));
        }

        if self.language == Language::Python {
            let source_dir = canonical(&self.source_dir());
            match &self.output_dir {
                Some(out) if canonical(out) != source_dir => {}
                _ => return Err(ConfigError::OutputDirConflict(self.source_dir())),
            }
        }
        Ok(())
    }

    /// No source, only a compiler description to write out
    pub fn is_export_only(&self) -> bool {
        self.files.is_empty() && self.export_descriptor.is_some()
    }

    fn normalize_descriptor(&mut self) -> Result<(), ConfigError> {
        if let Some(path) = &self.export_descriptor {
            match path.extension().and_then(|e| e.to_str()) {
                None => {
                    let fixed = path.with_extension(DESCRIPTOR_EXTENSION);
                    debug!(path = %fixed.display(), "descriptor extension appended");
                    self.export_descriptor = Some(fixed);
                }
                Some(DESCRIPTOR_EXTENSION) => {}
                Some(other) => return Err(ConfigError::BadDescriptorExtension(other.to_string())),
            }
        }
        Ok(())
    }
}

/// Resolve `path` the way the filesystem will once missing directories are
/// created: existing prefixes are canonicalized, the rest is normalized
/// lexically.
fn canonical(path: &Path) -> PathBuf {
    let absolute = if path.is_absolute() {
        path.to_path_buf()
    } else {
        env::current_dir().map_or_else(|_| path.to_path_buf(), |cwd| cwd.join(path))
    };
    let mut resolved = PathBuf::new();
    for component in absolute.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                if let Ok(real) = resolved.canonicalize() {
                    resolved = real;
                }
                resolved.pop();
            }
            other => resolved.push(other),
        }
    }
    resolved.canonicalize().unwrap_or(resolved)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn source_in(dir: &Path, name: &str) -> PathBuf {
        let path = dir.join(name);
        fs::write(&path, "x = 1\n").unwrap();
        path
    }

    #[test]
    fn more_than_one_file_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let a = source_in(dir.path(), "a.py");
        let b = source_in(dir.path(), "b.py");
        let mut request = CompileRequest::with_files(vec![a, b]);
        request.set_stop(StopPoint::Syntax);
        assert!(matches!(request.validate(), Err(ConfigError::MultipleFiles(files)) if files.len() == 2));
    }

    #[test]
    fn unknown_extension_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = source_in(dir.path(), "a.txt");
        let mut request = CompileRequest::new(path);
        assert_eq!(request.validate(), Err(ConfigError::BadExtension("txt".into())));
    }

    #[test]
    fn descriptor_extension_is_appended_or_checked() {
        let dir = tempfile::tempdir().unwrap();
        let path = source_in(dir.path(), "a.py");

        let mut request = CompileRequest::new(&path);
        request.set_export_descriptor(dir.path().join("gnu"));
        request.validate().unwrap();
        assert_eq!(request.export_descriptor, Some(dir.path().join("gnu.json")));

        let mut request = CompileRequest::new(&path);
        request.set_export_descriptor(dir.path().join("gnu.yaml"));
        assert_eq!(request.validate(), Err(ConfigError::BadDescriptorExtension("yaml".into())));
    }

    #[test]
    fn a_descriptor_alone_is_an_export_request() {
        let mut request = CompileRequest::with_files(Vec::new());
        assert_eq!(request.validate(), Err(ConfigError::MissingInput));

        request.set_export_descriptor("toolchain");
        assert_eq!(request.validate(), Ok(()));
        assert!(request.is_export_only());
        assert_eq!(request.export_descriptor, Some(PathBuf::from("toolchain.json")));
    }

    #[test]
    fn python_output_needs_another_directory() {
        let dir = tempfile::tempdir().unwrap();
        let path = source_in(dir.path(), "a.py");

        let mut request = CompileRequest::new(&path);
        request.set_language(Language::Python);
        assert!(matches!(request.validate(), Err(ConfigError::OutputDirConflict(_))));

        request.set_output_dir(dir.path());
        assert!(matches!(request.validate(), Err(ConfigError::OutputDirConflict(_))));

        request.set_output_dir(dir.path().join("missing").join(".."));
        assert!(matches!(request.validate(), Err(ConfigError::OutputDirConflict(_))));

        request.set_output_dir(dir.path().join(".").join("out").join("..").join("."));
        assert!(matches!(request.validate(), Err(ConfigError::OutputDirConflict(_))));

        request.set_output_dir(dir.path().join("out"));
        assert_eq!(request.validate(), Ok(()));
    }

    #[test]
    fn debug_is_ignored_without_a_build() {
        let mut request = CompileRequest::new("a.py");
        request.set_debug(true).set_stop(StopPoint::Semantic);
        assert!(!request.effective_debug());
        request.set_stop(StopPoint::Full);
        assert!(request.effective_debug());
    }

    #[test]
    fn names_come_from_the_source() {
        let request = CompileRequest::new("dir/kernels.pyh");
        assert_eq!(request.module_name(), "kernels");
        assert!(request.is_header());
        assert_eq!(request.output_dir(), PathBuf::from("dir"));
    }
}

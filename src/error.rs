//! Error taxonomy of the pipeline. Stage errors convert into diagnostics so
//! they are printed together with everything else the compilation found.

use crate::diagnostics::{codes, Diagnostic, Stage};
use std::io;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Failure of a whole compilation
#[derive(Debug, Error)]
pub enum CompileError {
    #[error("syntax errors in {0}")]
    Syntax(String),
    #[error("semantic errors in {0}")]
    Semantic(String),
    #[error("{module} uses constructs the {language} backend cannot express")]
    BackendUnsupported { module: String, language: String },
    #[error(transparent)]
    Build(#[from] BuildError),
    #[error(transparent)]
    Wrap(#[from] WrapError),
    #[error(transparent)]
    Configuration(#[from] ConfigError),
    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

impl CompileError {
    pub fn stage(&self) -> Stage {
        match self {
            CompileError::Syntax(_) => Stage::Syntax,
            CompileError::Semantic(_) => Stage::Semantic,
            CompileError::BackendUnsupported { .. } => Stage::Codegen,
            CompileError::Build(_) | CompileError::Io { .. } => Stage::Build,
            CompileError::Wrap(_) => Stage::Wrap,
            CompileError::Configuration(_) => Stage::Configuration,
        }
    }
}

/// Failure of the native toolchain step
#[derive(Debug, Error)]
pub enum BuildError {
    /// Output is the toolchain's own text, unmodified
    #[error("`{command}` failed with {status}")]
    ToolchainFailed {
        command: String,
        status: String,
        output: String,
    },
    #[error("compiler `{0}` was not found")]
    MissingToolchain(String),
    #[error("`{command}` did not finish within {limit:?}")]
    Timeout { command: String, limit: Duration },
    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("invalid compiler descriptor {path}: {message}")]
    Descriptor { path: PathBuf, message: String },
}

impl BuildError {
    pub fn io(path: impl Into<PathBuf>, source: io::Error) -> Self {
        BuildError::Io {
            path: path.into(),
            source,
        }
    }

    pub fn to_diagnostic(&self) -> Diagnostic {
        match self {
            BuildError::ToolchainFailed { command, output, .. } => {
                let mut diagnostic = Diagnostic::error(codes::TOOLCHAIN_FAILED, self.to_string()).with_note(command.clone());
                if !output.is_empty() {
                    diagnostic = diagnostic.with_note(output.clone());
                }
                diagnostic
            }
            BuildError::MissingToolchain(compiler) => Diagnostic::error(codes::MISSING_TOOLCHAIN, "compiler not found")
                .with_symbol(compiler.clone())
                .with_help("install it or select another family with --compiler"),
            BuildError::Timeout { .. } => Diagnostic::error(codes::BUILD_TIMEOUT, self.to_string()),
            BuildError::Io { .. } => Diagnostic::error(codes::BUILD_IO, self.to_string()),
            BuildError::Descriptor { .. } => Diagnostic::error(codes::INVALID_DESCRIPTOR, self.to_string()),
        }
    }
}

/// Failure binding or calling a compiled module
#[derive(Debug, Error)]
pub enum WrapError {
    #[error("artifact does not export `{0}`")]
    MissingExport(String),
    #[error("cannot pass argument {index} of `{function}`: {message}")]
    Marshalling {
        function: String,
        index: usize,
        message: String,
    },
    #[error("no instance of `{function}` accepts ({arguments})")]
    NoMatchingOverload { function: String, arguments: String },
    #[error("module has no function `{0}`")]
    UnknownFunction(String),
    #[error("module has no variable `{0}`")]
    UnknownGlobal(String),
    #[error("cannot load {path}: {message}")]
    Load { path: PathBuf, message: String },
    #[error("`{function}` rejected its arguments: {message}")]
    CallFailed { function: String, message: String },
}

impl WrapError {
    pub fn to_diagnostic(&self) -> Diagnostic {
        let code = match self {
            WrapError::MissingExport(_) => codes::MISSING_EXPORT,
            WrapError::Load { .. } => codes::LOAD_FAILED,
            _ => codes::MARSHALLING,
        };
        Diagnostic::error(code, self.to_string())
    }
}

/// Hard precondition violations, checked before any stage runs
#[derive(Debug, Error, PartialEq)]
pub enum ConfigError {
    #[error("only one source file can be compiled at a time")]
    MultipleFiles(Vec<PathBuf>),
    #[error("no source file given")]
    MissingInput,
    #[error("file not found: {0}")]
    MissingFile(PathBuf),
    #[error("wrong file extension: {0}")]
    BadExtension(String),
    #[error("descriptor file must have a .json extension, found .{0}")]
    BadDescriptorExtension(String),
    #[error("python output needs an output directory other than {0}")]
    OutputDirConflict(PathBuf),
}

impl ConfigError {
    pub fn to_diagnostic(&self) -> Diagnostic {
        let diagnostic = match self {
            ConfigError::MultipleFiles(files) => Diagnostic::fatal(codes::MULTIPLE_FILES, self.to_string())
                .with_note(format!("{} files were given", files.len())),
            ConfigError::MissingInput => Diagnostic::fatal(codes::MISSING_INPUT, self.to_string()),
            ConfigError::MissingFile(path) => {
                Diagnostic::fatal(codes::MISSING_INPUT, "file not found").with_symbol(path.display().to_string())
            }
            ConfigError::BadExtension(extension) => Diagnostic::fatal(codes::INVALID_FILE_EXTENSION, "wrong file extension")
                .with_symbol(extension.clone())
                .with_help("source files end in .py, header files in .pyh"),
            ConfigError::BadDescriptorExtension(extension) => {
                Diagnostic::fatal(codes::INVALID_DESCRIPTOR_EXTENSION, "wrong descriptor extension")
                    .with_symbol(extension.clone())
                    .with_help("descriptor files end in .json")
            }
            ConfigError::OutputDirConflict(dir) => Diagnostic::fatal(codes::OUTPUT_DIR_CONFLICT, self.to_string())
                .with_symbol(dir.display().to_string())
                .with_help("pass --output with another directory"),
        };
        diagnostic.with_stage(Stage::Configuration)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn toolchain_output_is_kept_verbatim() {
        let output = "m.c:3:5: error: expected ';'\n    x = 1\n    ^".to_string();
        let error = BuildError::ToolchainFailed {
            command: "gcc -c m.c".to_string(),
            status: "exit status: 1".to_string(),
            output: output.clone(),
        };
        let diagnostic = error.to_diagnostic();
        assert_eq!(diagnostic.code, codes::TOOLCHAIN_FAILED);
        assert!(diagnostic.notes.contains(&output));
    }

    #[test]
    fn configuration_errors_are_fatal() {
        let diagnostic = ConfigError::BadExtension("txt".into()).to_diagnostic();
        assert!(diagnostic.is_fatal());
        assert_eq!(diagnostic.text(), "wrong file extension: txt");
        assert_eq!(diagnostic.stage, Stage::Configuration);
    }

    #[test]
    fn compile_errors_know_their_stage() {
        let error: CompileError = ConfigError::MissingInput.into();
        assert_eq!(error.stage(), Stage::Configuration);
        let error: CompileError = WrapError::UnknownFunction("f".into()).into();
        assert_eq!(error.stage(), Stage::Wrap);
    }
}

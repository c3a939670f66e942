//! Build Driver: writes generated code to disk and turns it into a shared
//! library with the native toolchain.

pub mod compiler;
pub mod process;
pub mod workdir;

pub use compiler::{CompilerDescription, ToolDescription};
pub use workdir::BuildDir;

use crate::codegen::{FileKind, GeneratedCode, Language};
use crate::config::Accelerators;
use crate::error::BuildError;
use process::{render, run_bounded};
use std::env::consts::DLL_EXTENSION;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::time::Duration;
use tracing::{debug, info};

/// Directory, under the output directory, holding sources and objects
pub const BUILD_DIR: &str = "__pyaot__";

/// Extension of the interface file written next to the artifact
pub const INTERFACE_EXTENSION: &str = "pyaot.json";

/// A built module
#[derive(Debug, Clone)]
pub struct Artifact {
    pub path: PathBuf,
    pub interface_path: PathBuf,
    pub build_dir: PathBuf,
}

#[derive(Debug, Clone)]
pub struct BuildOptions {
    pub compiler: CompilerDescription,
    pub accelerators: Accelerators,
    pub debug: bool,
    /// Extra flags for every translation unit
    pub flags: Vec<String>,
    /// Extra flags for the wrapper only
    pub wrapper_flags: Vec<String>,
    pub timeout: Duration,
}

impl BuildOptions {
    pub fn new(compiler: CompilerDescription) -> Self {
        Self {
            compiler,
            accelerators: Accelerators::default(),
            debug: false,
            flags: Vec::new(),
            wrapper_flags: Vec::new(),
            timeout: crate::config::DEFAULT_TIMEOUT,
        }
    }
}

pub fn artifact_path(output_dir: &Path, module: &str) -> PathBuf {
    output_dir.join(format!("{}.{}", module, DLL_EXTENSION))
}

pub fn interface_path(output_dir: &Path, module: &str) -> PathBuf {
    output_dir.join(format!("{}.{}", module, INTERFACE_EXTENSION))
}

/// Write every generated file into `dir`, creating it first
pub fn write_sources(code: &GeneratedCode, dir: &Path) -> Result<Vec<PathBuf>, BuildError> {
    fs::create_dir_all(dir).map_err(|e| BuildError::io(dir, e))?;
    let mut written = Vec::with_capacity(code.files.len());
    for file in &code.files {
        let path = dir.join(&file.name);
        fs::write(&path, &file.contents).map_err(|e| BuildError::io(&path, e))?;
        debug!(path = %path.display(), "written");
        written.push(path);
    }
    Ok(written)
}

/// Compile and link the generated code into `<output_dir>/<module>.<dll>`.
/// Every toolchain command runs inside the build directory; object files
/// are removed again on every exit path.
pub fn build(code: &GeneratedCode, options: &BuildOptions, output_dir: &Path) -> Result<Artifact, BuildError> {
    if !code.language.is_compiled() {
        return Err(BuildError::Descriptor {
            path: PathBuf::from(code.language.to_string()),
            message: "this language is not compiled".to_string(),
        });
    }
    fs::create_dir_all(output_dir).map_err(|e| BuildError::io(output_dir, e))?;
    let output_dir = output_dir
        .canonicalize()
        .map_err(|e| BuildError::io(output_dir, e))?;
    let mut scope = BuildDir::acquire(&output_dir.join(BUILD_DIR)).map_err(|e| BuildError::io(&output_dir, e))?;
    let build_dir = scope.path().to_path_buf();
    write_sources(code, &build_dir)?;

    let tool = options.compiler.tool(code.language);
    let name = tool.executable(options.accelerators);
    let compiler = which::which(name).map_err(|_| BuildError::MissingToolchain(name.to_string()))?;
    info!(module = %code.module, compiler = %compiler.display(), "building");

    let mut objects = Vec::new();
    for file in code.compiled_files() {
        let object = scope.temporary(Path::new(&file.name).with_extension("o"));
        let mut command = Command::new(&compiler);
        command
            .current_dir(&build_dir)
            .args(tool.compile_flags(options.accelerators, options.debug))
            .args(&options.flags)
            .arg("-I.");
        if code.language == Language::Fortran {
            if let Some(flag) = &tool.module_dir_flag {
                command.arg(flag).arg(".");
            }
        }
        if file.kind == FileKind::Wrapper {
            command.args(&options.wrapper_flags);
        }
        command.arg("-c").arg(&file.name).arg("-o").arg(&object);
        run_checked(&mut command, options.timeout)?;
        objects.push(object);
    }

    let path = artifact_path(&output_dir, &code.module);
    let mut command = Command::new(&compiler);
    command
        .current_dir(&build_dir)
        .arg("-shared")
        .args(&tool.shared_flags)
        .args(tool.accelerator_flags(options.accelerators))
        .args(&objects)
        .arg("-o")
        .arg(&path);
    for dir in &tool.library_dirs {
        command.arg(format!("-L{}", dir.display()));
    }
    for library in &tool.libraries {
        command.arg(format!("-l{}", library));
    }
    run_checked(&mut command, options.timeout)?;

    let interface_path = interface_path(&output_dir, &code.module);
    if let Some(interface) = &code.interface {
        interface
            .save(&interface_path)
            .map_err(|e| BuildError::io(&interface_path, e))?;
    }
    info!(artifact = %path.display(), "built");
    Ok(Artifact {
        path,
        interface_path,
        build_dir,
    })
}

/// A non-zero exit keeps the toolchain's own output
fn run_checked(command: &mut Command, timeout: Duration) -> Result<(), BuildError> {
    let finished = run_bounded(command, timeout)?;
    if finished.status.success() {
        return Ok(());
    }
    Err(BuildError::ToolchainFailed {
        command: render(command),
        status: finished.status.to_string(),
        output: finished.output,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codegen::GeneratedFile;
    use std::env;

    fn code(language: Language) -> GeneratedCode {
        GeneratedCode {
            module: "kernels".to_string(),
            language,
            files: vec![
                GeneratedFile {
                    name: "kernels.h".to_string(),
                    kind: FileKind::Header,
                    contents: "#pragma once\n".to_string(),
                },
                GeneratedFile {
                    name: "kernels.c".to_string(),
                    kind: FileKind::Source,
                    contents: "int x;\n".to_string(),
                },
            ],
            interface: None,
        }
    }

    #[test]
    fn sources_are_written_into_the_build_dir() {
        let dir = tempfile::tempdir().unwrap();
        let written = write_sources(&code(Language::C), &dir.path().join(BUILD_DIR)).unwrap();
        assert_eq!(written.len(), 2);
        assert_eq!(fs::read_to_string(&written[1]).unwrap(), "int x;\n");
    }

    #[test]
    fn missing_compiler_fails_and_keeps_the_directory() {
        let before = env::current_dir().unwrap();
        let dir = tempfile::tempdir().unwrap();
        let mut compiler = CompilerDescription::family("GNU").unwrap();
        compiler.c.exec = "pyaot-missing-cc".to_string();

        let error = build(&code(Language::C), &BuildOptions::new(compiler), dir.path()).unwrap_err();
        assert!(matches!(error, BuildError::MissingToolchain(name) if name == "pyaot-missing-cc"));
        assert_eq!(env::current_dir().unwrap(), before);
        assert!(dir.path().join(BUILD_DIR).join("kernels.c").is_file());
    }

    #[test]
    fn artifact_names_follow_the_platform() {
        let path = artifact_path(Path::new("out"), "kernels");
        assert_eq!(path.extension().and_then(|e| e.to_str()), Some(DLL_EXTENSION));
        assert_eq!(
            interface_path(Path::new("out"), "kernels"),
            PathBuf::from("out/kernels.pyaot.json")
        );
    }
}

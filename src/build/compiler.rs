//! Compiler descriptions: which executables to run and with which flags,
//! per family, loadable from and exportable to a JSON descriptor.

use crate::codegen::Language;
use crate::config::Accelerators;
use crate::error::BuildError;
use serde::{Deserialize, Serialize};
use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::debug;

/// Executable and flag templates for one language of a family
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolDescription {
    pub exec: String,
    /// Wrapper executable used when MPI is requested
    pub mpi_exec: String,
    #[serde(default)]
    pub flags: Vec<String>,
    #[serde(default)]
    pub release_flags: Vec<String>,
    #[serde(default)]
    pub debug_flags: Vec<String>,
    #[serde(default)]
    pub shared_flags: Vec<String>,
    #[serde(default)]
    pub openmp_flags: Vec<String>,
    #[serde(default)]
    pub openacc_flags: Vec<String>,
    /// Flag naming the directory for Fortran `.mod` files
    #[serde(default)]
    pub module_dir_flag: Option<String>,
    #[serde(default)]
    pub include_dirs: Vec<PathBuf>,
    #[serde(default)]
    pub library_dirs: Vec<PathBuf>,
    #[serde(default)]
    pub libraries: Vec<String>,
}

impl ToolDescription {
    fn new(exec: &str, mpi_exec: &str) -> Self {
        Self {
            exec: exec.to_string(),
            mpi_exec: mpi_exec.to_string(),
            flags: Vec::new(),
            release_flags: strings(&["-O3"]),
            debug_flags: strings(&["-g", "-O0"]),
            shared_flags: strings(&["-fPIC"]),
            openmp_flags: strings(&["-fopenmp"]),
            openacc_flags: Vec::new(),
            module_dir_flag: None,
            include_dirs: Vec::new(),
            library_dirs: Vec::new(),
            libraries: Vec::new(),
        }
    }

    pub fn executable(&self, accelerators: Accelerators) -> &str {
        if accelerators.mpi {
            &self.mpi_exec
        } else {
            &self.exec
        }
    }

    /// Flags for compiling one translation unit, before per-file extras
    pub fn compile_flags(&self, accelerators: Accelerators, debug: bool) -> Vec<String> {
        let mut flags = self.flags.clone();
        let optimisation = if debug { &self.debug_flags } else { &self.release_flags };
        flags.extend(optimisation.iter().cloned());
        flags.extend(self.shared_flags.iter().cloned());
        flags.extend(self.accelerator_flags(accelerators));
        for dir in &self.include_dirs {
            flags.push(format!("-I{}", dir.display()));
        }
        flags
    }

    /// Accelerator flags, also needed when linking
    pub fn accelerator_flags(&self, accelerators: Accelerators) -> Vec<String> {
        let mut flags = Vec::new();
        if accelerators.openmp {
            flags.extend(self.openmp_flags.iter().cloned());
        }
        if accelerators.openacc {
            flags.extend(self.openacc_flags.iter().cloned());
        }
        flags
    }
}

/// A named toolchain family
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompilerDescription {
    pub family: String,
    pub c: ToolDescription,
    pub fortran: ToolDescription,
}

impl CompilerDescription {
    /// Built-in description of a family: `GNU`, `intel`, `PGI`/`nvidia` or `LLVM`
    pub fn family(name: &str) -> Option<Self> {
        let description = match name.to_ascii_lowercase().as_str() {
            "gnu" => {
                let mut c = ToolDescription::new("gcc", "mpicc");
                c.flags = strings(&["-std=c99", "-funroll-loops"]);
                c.openacc_flags = strings(&["-fopenacc"]);
                c.libraries = strings(&["m"]);
                let mut fortran = ToolDescription::new("gfortran", "mpif90");
                fortran.flags = strings(&["-funroll-loops", "-ffree-line-length-none"]);
                fortran.openacc_flags = strings(&["-fopenacc"]);
                fortran.module_dir_flag = Some("-J".to_string());
                Self::named("GNU", c, fortran)
            }
            "intel" => {
                let mut c = ToolDescription::new("icx", "mpiicx");
                c.flags = strings(&["-std=c99"]);
                c.openmp_flags = strings(&["-qopenmp"]);
                c.libraries = strings(&["m"]);
                let mut fortran = ToolDescription::new("ifx", "mpiifx");
                fortran.openmp_flags = strings(&["-qopenmp"]);
                fortran.module_dir_flag = Some("-module".to_string());
                Self::named("intel", c, fortran)
            }
            "pgi" | "nvidia" => {
                let mut c = ToolDescription::new("nvc", "mpicc");
                c.release_flags = strings(&["-O3", "-Munroll"]);
                c.openmp_flags = strings(&["-mp"]);
                c.openacc_flags = strings(&["-acc"]);
                c.libraries = strings(&["m"]);
                let mut fortran = ToolDescription::new("nvfortran", "mpif90");
                fortran.release_flags = strings(&["-O3", "-Munroll"]);
                fortran.openmp_flags = strings(&["-mp"]);
                fortran.openacc_flags = strings(&["-acc"]);
                fortran.module_dir_flag = Some("-module".to_string());
                Self::named("nvidia", c, fortran)
            }
            "llvm" => {
                let mut c = ToolDescription::new("clang", "mpicc");
                c.flags = strings(&["-std=c99"]);
                c.libraries = strings(&["m"]);
                let mut fortran = ToolDescription::new("flang-new", "mpif90");
                fortran.module_dir_flag = Some("-module-dir".to_string());
                Self::named("LLVM", c, fortran)
            }
            _ => return None,
        };
        Some(description)
    }

    fn named(family: &str, c: ToolDescription, fortran: ToolDescription) -> Self {
        Self {
            family: family.to_string(),
            c,
            fortran,
        }
    }

    /// GNU defaults with `CC` and `FC` overriding the executables
    pub fn from_env() -> Self {
        let mut description = Self::family("GNU").unwrap_or_else(|| {
            Self::named("GNU", ToolDescription::new("gcc", "mpicc"), ToolDescription::new("gfortran", "mpif90"))
        });
        if let Ok(cc) = env::var("CC") {
            if !cc.trim().is_empty() {
                debug!(%cc, "C compiler from environment");
                description.c.exec = cc;
            }
        }
        if let Ok(fc) = env::var("FC") {
            if !fc.trim().is_empty() {
                debug!(%fc, "Fortran compiler from environment");
                description.fortran.exec = fc;
            }
        }
        description
    }

    /// Descriptor file (`*.json`), family name, or the environment default
    pub fn resolve(spec: Option<&str>) -> Result<Self, BuildError> {
        let description = match spec {
            None => Self::from_env(),
            Some(spec) if spec.ends_with(".json") => Self::load(Path::new(spec))?,
            Some(name) => Self::family(name).ok_or_else(|| BuildError::Descriptor {
                path: PathBuf::from(name),
                message: "unknown compiler family (expected GNU, intel, PGI, nvidia or LLVM)".to_string(),
            })?,
        };
        debug!(family = %description.family, c = %description.c.exec, fortran = %description.fortran.exec, "compiler resolved");
        Ok(description)
    }

    pub fn tool(&self, language: Language) -> &ToolDescription {
        match language {
            Language::Fortran => &self.fortran,
            _ => &self.c,
        }
    }

    /// Include and library paths supplied with the request are appended to
    /// both languages
    pub fn extend_paths(&mut self, includes: &[PathBuf], library_dirs: &[PathBuf], libraries: &[String]) {
        for tool in [&mut self.c, &mut self.fortran] {
            tool.include_dirs.extend(includes.iter().cloned());
            tool.library_dirs.extend(library_dirs.iter().cloned());
            tool.libraries.extend(libraries.iter().cloned());
        }
    }

    pub fn load(path: &Path) -> Result<Self, BuildError> {
        let text = fs::read_to_string(path).map_err(|e| BuildError::io(path, e))?;
        serde_json::from_str(&text).map_err(|e| BuildError::Descriptor {
            path: path.to_path_buf(),
            message: e.to_string(),
        })
    }

    pub fn save(&self, path: &Path) -> Result<(), BuildError> {
        let json = serde_json::to_string_pretty(self).map_err(|e| BuildError::Descriptor {
            path: path.to_path_buf(),
            message: e.to_string(),
        })?;
        fs::write(path, json).map_err(|e| BuildError::io(path, e))
    }
}

fn strings(items: &[&str]) -> Vec<String> {
    items.iter().map(|s| s.to_string()).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn families_are_case_insensitive() {
        assert_eq!(CompilerDescription::family("gnu").unwrap().fortran.exec, "gfortran");
        assert_eq!(CompilerDescription::family("PGI").unwrap().family, "nvidia");
        assert!(CompilerDescription::family("borland").is_none());
    }

    #[test]
    fn accelerators_select_flags_and_executable() {
        let gnu = CompilerDescription::family("GNU").unwrap();
        let accelerators = Accelerators {
            mpi: true,
            openmp: true,
            openacc: false,
        };
        assert_eq!(gnu.c.executable(accelerators), "mpicc");
        let flags = gnu.c.compile_flags(accelerators, false);
        assert!(flags.contains(&"-fopenmp".to_string()));
        assert!(flags.contains(&"-O3".to_string()));
        let flags = gnu.fortran.compile_flags(Accelerators::default(), true);
        assert!(flags.contains(&"-g".to_string()));
        assert!(!flags.contains(&"-fopenmp".to_string()));
    }

    #[test]
    fn gnu_offload_passes_fopenacc() {
        let gnu = CompilerDescription::family("GNU").unwrap();
        let accelerators = Accelerators {
            openacc: true,
            ..Accelerators::default()
        };
        for tool in [&gnu.c, &gnu.fortran] {
            let flags = tool.compile_flags(accelerators, false);
            assert!(flags.contains(&"-fopenacc".to_string()), "{:?}", flags);
            assert!(!tool.compile_flags(Accelerators::default(), false).contains(&"-fopenacc".to_string()));
        }
    }

    #[test]
    fn descriptor_round_trips_through_json() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("intel.json");
        let mut intel = CompilerDescription::family("intel").unwrap();
        intel.extend_paths(&[PathBuf::from("/opt/include")], &[], &["blas".to_string()]);
        intel.save(&path).unwrap();

        let loaded = CompilerDescription::resolve(path.to_str()).unwrap();
        assert_eq!(loaded, intel);
        assert!(loaded.c.libraries.contains(&"blas".to_string()));
    }

    #[test]
    fn unknown_family_is_a_descriptor_error() {
        let error = CompilerDescription::resolve(Some("turbo")).unwrap_err();
        assert!(matches!(error, BuildError::Descriptor { .. }));
    }
}

//! pyaot command line
//!
//! Usage: pyaot [OPTIONS] [FILES]...

use anyhow::Context;
use clap::Parser;
use colored::Colorize;
use pyaot::{Accelerators, Compilation, CompileRequest, Driver, ErrorMode, Language, StopPoint};
use std::path::PathBuf;
use std::process::ExitCode;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "pyaot")]
#[command(author = "pyaot Team")]
#[command(version)]
#[command(about = "Compile a typed Python subset to C or Fortran and build it as a shared library", long_about = None)]
struct Args {
    /// Source file (.py) or header (.pyh)
    #[arg(value_name = "FILES")]
    files: Vec<PathBuf>,

    /// Stop after syntax checking
    #[arg(short = 'x', long, group = "stop")]
    syntax_only: bool,

    /// Stop after semantic checking
    #[arg(short = 'e', long, group = "stop")]
    semantic_only: bool,

    /// Generate code without building it
    #[arg(short = 't', long, group = "stop")]
    convert_only: bool,

    /// Generated language
    #[arg(long, value_parser = ["fortran", "c", "python"], default_value = "fortran")]
    language: String,

    /// Compiler family (GNU, intel, PGI, nvidia, LLVM) or a .json descriptor
    #[arg(long)]
    compiler: Option<String>,

    /// Extra compiler flags, whitespace separated
    #[arg(long, allow_hyphen_values = true)]
    flags: Option<String>,

    /// Extra compiler flags for the wrapper, whitespace separated
    #[arg(long, allow_hyphen_values = true)]
    wrapper_flags: Option<String>,

    /// Compile with debug flags
    #[arg(long, overrides_with = "no_debug")]
    debug: bool,

    #[arg(long, overrides_with = "debug", hide = true)]
    no_debug: bool,

    /// Include directories
    #[arg(long = "include", num_args = 0.., value_name = "DIR")]
    includes: Vec<PathBuf>,

    /// Library directories
    #[arg(long = "libdir", num_args = 0.., value_name = "DIR")]
    libdirs: Vec<PathBuf>,

    /// Libraries to link with
    #[arg(long, num_args = 0.., value_name = "LIB")]
    libs: Vec<String>,

    /// Directory in which the output is stored
    #[arg(long)]
    output: Option<PathBuf>,

    /// Use MPI
    #[arg(long)]
    mpi: bool,

    /// Use OpenMP
    #[arg(long)]
    openmp: bool,

    /// Use OpenACC
    #[arg(long)]
    openacc: bool,

    /// Log every stage and toolchain command
    #[arg(short, long)]
    verbose: bool,

    /// Show the stage and origin of each diagnostic
    #[arg(long)]
    developer_mode: bool,

    /// Write the resolved compiler description to this file
    #[arg(long, value_name = "FILE")]
    export_compile_info: Option<PathBuf>,

    /// Toolchain time limit in seconds
    #[arg(long, value_name = "SECONDS")]
    timeout: Option<u64>,
}

impl Args {
    fn stop(&self) -> StopPoint {
        if self.syntax_only {
            StopPoint::Syntax
        } else if self.semantic_only {
            StopPoint::Semantic
        } else if self.convert_only {
            StopPoint::Convert
        } else {
            StopPoint::Full
        }
    }

    fn request(&self) -> anyhow::Result<CompileRequest> {
        let mut request = CompileRequest::with_files(self.files.clone());
        let language: Language = self
            .language
            .parse()
            .map_err(|e| anyhow::anyhow!("{}", e))
            .context("invalid --language")?;
        request
            .set_stop(self.stop())
            .set_language(language)
            .set_accelerators(Accelerators {
                mpi: self.mpi,
                openmp: self.openmp,
                openacc: self.openacc,
            })
            .set_error_mode(if self.developer_mode {
                ErrorMode::Developer
            } else {
                ErrorMode::User
            });
        if let Some(compiler) = &self.compiler {
            request.set_compiler(compiler.clone());
        }
        for flag in self.flags.iter().flat_map(|f| f.split_whitespace()) {
            request.add_flag(flag);
        }
        request.wrapper_flags = self
            .wrapper_flags
            .iter()
            .flat_map(|f| f.split_whitespace())
            .map(str::to_string)
            .collect();
        if self.debug {
            request.set_debug(true);
        } else if self.no_debug {
            request.set_debug(false);
        }
        for dir in &self.includes {
            request.add_include_dir(dir);
        }
        for dir in &self.libdirs {
            request.add_library_dir(dir);
        }
        for lib in &self.libs {
            request.add_library(lib);
        }
        if let Some(output) = &self.output {
            request.set_output_dir(output);
        }
        if let Some(path) = &self.export_compile_info {
            request.set_export_descriptor(path);
        }
        if let Some(seconds) = self.timeout {
            request.set_timeout(std::time::Duration::from_secs(seconds));
        }
        Ok(request)
    }
}

fn main() -> ExitCode {
    let args = Args::parse();

    let default_level = if args.verbose { "debug" } else { "warn" };
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)))
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();

    let request = match args.request() {
        Ok(request) => request,
        Err(e) => {
            eprintln!("{}: {:#}", "error".red().bold(), e);
            return ExitCode::from(2);
        }
    };

    let compilation = Driver::new(request).run();
    report(&compilation);
    if compilation.succeeded() {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    }
}

fn report(compilation: &Compilation) {
    for diag in &compilation.diagnostics {
        eprintln!("{}", diag);
    }

    if !compilation.succeeded() {
        let error_count = compilation.error_count();
        let warning_count = compilation.warning_count();
        eprintln!(
            "\n{} generated{}",
            format!("{} error{}", error_count, if error_count == 1 { "" } else { "s" }).red().bold(),
            if warning_count > 0 {
                format!(", {} warning{}", warning_count, if warning_count == 1 { "" } else { "s" })
            } else {
                String::new()
            }
        );
        return;
    }

    if let Some(artifact) = &compilation.artifact {
        println!("{}: {}", "built".green().bold(), artifact.path.display());
    } else if !compilation.written.is_empty() {
        for path in &compilation.written {
            println!("{}: {}", "generated".green().bold(), path.display());
        }
    } else if let Some(path) = &compilation.descriptor {
        println!("{}: {}", "exported".green().bold(), path.display());
    } else {
        println!("{}: {:?}", "checked".green().bold(), compilation.state);
    }
    if let (Some(path), true) = (&compilation.descriptor, compilation.artifact.is_some()) {
        println!("{}: {}", "exported".green().bold(), path.display());
    }
}

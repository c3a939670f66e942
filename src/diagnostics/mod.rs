//! Diagnostic reporting system shared by every pipeline stage.

mod reporter;

pub use reporter::DiagnosticReporter;

use colored::Colorize;
use std::fmt;
use std::panic::Location;
use std::sync::atomic::{AtomicU8, Ordering};

/// Location in source code
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceLocation {
    pub file: String,
    pub line: usize,
    pub column: usize,
    pub length: usize,
}

impl SourceLocation {
    pub fn new(file: &str, line: usize, column: usize, length: usize) -> Self {
        Self {
            file: file.to_string(),
            line,
            column,
            length,
        }
    }
}

impl fmt::Display for SourceLocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}:{}", self.file, self.line, self.column)
    }
}

/// Severity level of a diagnostic
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum DiagnosticLevel {
    Note,
    Warning,
    Error,
    /// Stops dependent work: later statements relying on the offending
    /// name are skipped instead of producing follow-up errors.
    Fatal,
}

impl fmt::Display for DiagnosticLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DiagnosticLevel::Fatal => write!(f, "{}", "fatal".red().bold()),
            DiagnosticLevel::Error => write!(f, "{}", "error".red().bold()),
            DiagnosticLevel::Warning => write!(f, "{}", "warning".yellow().bold()),
            DiagnosticLevel::Note => write!(f, "{}", "note".cyan().bold()),
        }
    }
}

/// Pipeline stage a diagnostic originates from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Configuration,
    Syntax,
    Semantic,
    Codegen,
    Build,
    Wrap,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Stage::Configuration => "configuration",
            Stage::Syntax => "syntax",
            Stage::Semantic => "semantic",
            Stage::Codegen => "codegen",
            Stage::Build => "build",
            Stage::Wrap => "wrap",
        };
        f.write_str(name)
    }
}

/// Verbosity of rendered diagnostics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ErrorMode {
    #[default]
    User,
    /// Adds the originating stage and compiler source location.
    Developer,
}

static ERROR_MODE: AtomicU8 = AtomicU8::new(0);

/// Set the process-wide rendering mode. Called at every entry point.
pub fn set_error_mode(mode: ErrorMode) {
    let raw = match mode {
        ErrorMode::User => 0,
        ErrorMode::Developer => 1,
    };
    ERROR_MODE.store(raw, Ordering::Relaxed);
}

pub fn error_mode() -> ErrorMode {
    match ERROR_MODE.load(Ordering::Relaxed) {
        1 => ErrorMode::Developer,
        _ => ErrorMode::User,
    }
}

/// A compiler diagnostic with rich context
#[derive(Debug, Clone)]
pub struct Diagnostic {
    pub level: DiagnosticLevel,
    pub code: String,
    pub message: String,
    /// Symbol substituted into the message template.
    pub symbol: Option<String>,
    pub stage: Stage,
    pub location: Option<SourceLocation>,
    pub source_line: Option<String>,
    pub labels: Vec<(usize, usize, String)>, // (column, length, label)
    pub help: Option<String>,
    pub notes: Vec<String>,
    pub origin: &'static Location<'static>,
}

impl Diagnostic {
    #[track_caller]
    fn with_level(level: DiagnosticLevel, code: &str, message: String) -> Self {
        Self {
            level,
            code: code.to_string(),
            message,
            symbol: None,
            stage: stage_for_code(code),
            location: None,
            source_line: None,
            labels: Vec::new(),
            help: None,
            notes: Vec::new(),
            origin: Location::caller(),
        }
    }

    #[track_caller]
    pub fn error(code: &str, message: impl Into<String>) -> Self {
        Self::with_level(DiagnosticLevel::Error, code, message.into())
    }

    #[track_caller]
    pub fn fatal(code: &str, message: impl Into<String>) -> Self {
        Self::with_level(DiagnosticLevel::Fatal, code, message.into())
    }

    #[track_caller]
    pub fn warning(code: &str, message: impl Into<String>) -> Self {
        Self::with_level(DiagnosticLevel::Warning, code, message.into())
    }

    #[track_caller]
    pub fn note(code: &str, message: impl Into<String>) -> Self {
        Self::with_level(DiagnosticLevel::Note, code, message.into())
    }

    pub fn with_symbol(mut self, symbol: impl Into<String>) -> Self {
        self.symbol = Some(symbol.into());
        self
    }

    pub fn with_stage(mut self, stage: Stage) -> Self {
        self.stage = stage;
        self
    }

    pub fn with_location(mut self, location: SourceLocation) -> Self {
        self.location = Some(location);
        self
    }

    pub fn with_source_line(mut self, line: impl Into<String>) -> Self {
        self.source_line = Some(line.into());
        self
    }

    pub fn with_label(mut self, column: usize, length: usize, label: impl Into<String>) -> Self {
        self.labels.push((column, length, label.into()));
        self
    }

    pub fn with_help(mut self, help: impl Into<String>) -> Self {
        self.help = Some(help.into());
        self
    }

    pub fn with_note(mut self, note: impl Into<String>) -> Self {
        self.notes.push(note.into());
        self
    }

    /// Errors and fatal errors both fail the compilation.
    pub fn is_error(&self) -> bool {
        self.level >= DiagnosticLevel::Error
    }

    pub fn is_fatal(&self) -> bool {
        self.level == DiagnosticLevel::Fatal
    }

    /// Message with the substituted symbol, without any decoration.
    pub fn text(&self) -> String {
        match self.symbol {
            Some(ref symbol) => format!("{}: {}", self.message, symbol),
            None => self.message.clone(),
        }
    }
}

impl fmt::Display for Diagnostic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Header: error[E205]: message
        writeln!(f, "{}[{}]: {}", self.level, self.code.cyan(), self.text())?;

        if error_mode() == ErrorMode::Developer {
            writeln!(
                f,
                "   {} stage: {}, raised at {}:{}",
                "=".blue(),
                self.stage,
                self.origin.file(),
                self.origin.line()
            )?;
        }

        // Location arrow
        if let Some(ref loc) = self.location {
            let line_num_width = loc.line.to_string().len();
            let padding = " ".repeat(line_num_width);

            writeln!(f, "{}--> {}", padding, loc.to_string().blue())?;
            writeln!(f, "{} {}", padding, "|".blue())?;

            // Source line with line number
            if let Some(ref source) = self.source_line {
                writeln!(f, "{} {} {}",
                    loc.line.to_string().blue().bold(),
                    "|".blue(),
                    source
                )?;

                // Underlines and labels
                for (column, length, label) in &self.labels {
                    let underline_padding = " ".repeat(column.saturating_sub(1));
                    let underline = "^".repeat((*length).max(1));

                    let (colored_underline, colored_label) = match self.level {
                        DiagnosticLevel::Error | DiagnosticLevel::Fatal => {
                            (underline.red().bold().to_string(), label.red().to_string())
                        }
                        DiagnosticLevel::Warning => {
                            (underline.yellow().bold().to_string(), label.yellow().to_string())
                        }
                        DiagnosticLevel::Note => (underline.cyan().to_string(), label.cyan().to_string()),
                    };

                    writeln!(f, "{} {} {}{} {}",
                        padding,
                        "|".blue(),
                        underline_padding,
                        colored_underline,
                        colored_label
                    )?;
                }
            }

            writeln!(f, "{} {}", padding, "|".blue())?;
        }

        if let Some(ref help) = self.help {
            writeln!(f, "   {} {}: {}", "=".blue(), "help".green().bold(), help)?;
        }

        for note in &self.notes {
            writeln!(f, "   {} {}: {}", "=".blue(), "note".cyan().bold(), note)?;
        }

        Ok(())
    }
}

fn stage_for_code(code: &str) -> Stage {
    match code.as_bytes() {
        [b'E', b'0' | b'1', ..] => Stage::Syntax,
        [b'E', b'2', ..] => Stage::Semantic,
        [b'E', b'3', ..] => Stage::Codegen,
        [b'E', b'4', ..] => Stage::Build,
        [b'E', b'5', ..] => Stage::Wrap,
        [b'E', b'6', ..] => Stage::Configuration,
        _ => Stage::Semantic,
    }
}

/// Error codes for diagnostics
pub mod codes {
    // Lexer errors (E0xx)
    pub const UNEXPECTED_CHARACTER: &str = "E001";
    pub const UNTERMINATED_STRING: &str = "E002";
    pub const INVALID_NUMBER: &str = "E003";
    pub const INCONSISTENT_INDENT: &str = "E004";

    // Parser errors (E1xx)
    pub const EXPECTED_TOKEN: &str = "E100";
    pub const EXPECTED_EXPRESSION: &str = "E101";
    pub const EXPECTED_STATEMENT: &str = "E102";
    pub const EXPECTED_INDENT: &str = "E103";
    pub const EXPECTED_IDENTIFIER: &str = "E104";
    pub const UNEXPECTED_TOKEN: &str = "E105";
    pub const INVALID_ANNOTATION: &str = "E106";
    pub const INVALID_TARGET: &str = "E107";

    // Semantic errors (E2xx)
    pub const TYPE_MISMATCH: &str = "E200";
    pub const INCOMPATIBLE_REASSIGNMENT: &str = "E201";
    pub const ANNOTATION_CONFLICT: &str = "E202";
    pub const MISSING_ANNOTATION: &str = "E203";
    pub const RANK_MISMATCH: &str = "E204";
    pub const UNDEFINED_NAME: &str = "E205";
    pub const UNDEFINED_FUNCTION: &str = "E206";
    pub const NO_MATCHING_OVERLOAD: &str = "E207";
    pub const ARGUMENT_COUNT_MISMATCH: &str = "E208";
    pub const RETURN_TYPE_MISMATCH: &str = "E209";
    pub const UNRESOLVED_IMPORT: &str = "E210";
    pub const UNSUPPORTED_CONSTRUCT: &str = "E211";
    pub const UNSUPPORTED_BUILTIN: &str = "E212";
    pub const REDEFINITION: &str = "E213";
    pub const INVALID_INDEX: &str = "E214";
    pub const SHAPE_MISMATCH: &str = "E215";
    pub const OUTSIDE_LOOP: &str = "E216";
    pub const RECURSIVE_INFERENCE: &str = "E217";
    pub const INVALID_UNPACK: &str = "E218";
    pub const INVALID_PRAGMA: &str = "E219";
    pub const CONSTANT_MUTATION: &str = "E220";

    // Backend errors (E3xx)
    pub const BACKEND_UNSUPPORTED: &str = "E300";
    pub const NAME_COLLISION: &str = "E301";

    // Build errors (E4xx)
    pub const TOOLCHAIN_FAILED: &str = "E400";
    pub const MISSING_TOOLCHAIN: &str = "E401";
    pub const BUILD_TIMEOUT: &str = "E402";
    pub const BUILD_IO: &str = "E403";
    pub const INVALID_DESCRIPTOR: &str = "E404";

    // Wrap errors (E5xx)
    pub const MISSING_EXPORT: &str = "E500";
    pub const MARSHALLING: &str = "E501";
    pub const LOAD_FAILED: &str = "E502";

    // Configuration errors (E6xx)
    pub const MULTIPLE_FILES: &str = "E600";
    pub const INVALID_FILE_EXTENSION: &str = "E601";
    pub const INVALID_DESCRIPTOR_EXTENSION: &str = "E603";
    pub const OUTPUT_DIR_CONFLICT: &str = "E604";
    pub const MISSING_INPUT: &str = "E605";

    // Warning codes (W0xx)
    pub const UNUSED_VARIABLE: &str = "W001";
    pub const SHADOWED_VARIABLE: &str = "W002";
    pub const IGNORED_DIRECTIVE: &str = "W003";
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stage_follows_code_family() {
        assert_eq!(Diagnostic::error(codes::EXPECTED_TOKEN, "x").stage, Stage::Syntax);
        assert_eq!(Diagnostic::error(codes::UNDEFINED_NAME, "x").stage, Stage::Semantic);
        assert_eq!(Diagnostic::error(codes::BACKEND_UNSUPPORTED, "x").stage, Stage::Codegen);
        assert_eq!(Diagnostic::error(codes::TOOLCHAIN_FAILED, "x").stage, Stage::Build);
        assert_eq!(Diagnostic::error(codes::MULTIPLE_FILES, "x").stage, Stage::Configuration);
    }

    #[test]
    fn fatal_counts_as_error() {
        let diag = Diagnostic::fatal(codes::UNRESOLVED_IMPORT, "could not resolve module");
        assert!(diag.is_error());
        assert!(diag.is_fatal());
        assert!(!Diagnostic::warning(codes::UNUSED_VARIABLE, "unused").is_error());
    }

    #[test]
    fn symbol_is_substituted_into_text() {
        let diag = Diagnostic::error(codes::INVALID_FILE_EXTENSION, "Wrong file extension")
            .with_symbol("txt");
        assert_eq!(diag.text(), "Wrong file extension: txt");
    }

    #[test]
    fn developer_mode_shows_origin() {
        colored::control::set_override(false);
        let diag = Diagnostic::error(codes::UNDEFINED_NAME, "undefined name");
        set_error_mode(ErrorMode::Developer);
        let rendered = diag.to_string();
        set_error_mode(ErrorMode::User);
        let plain = diag.to_string();
        assert!(rendered.contains("stage: semantic"));
        assert!(rendered.contains("diagnostics/mod.rs"));
        assert!(!plain.contains("stage:"));
    }
}

//! Native identifiers for source names.
//!
//! Every symbol and function instance gets one spelling per backend. The
//! spelling is a legal identifier, hides nothing the generated code or its
//! includes rely on, and is unique in its scope. Fortran scopes compare
//! names case-folded. Renaming is deterministic: earlier declarations keep
//! their spelling and later ones get a numeric suffix.

use super::Language;
use crate::parser::Span;
use crate::semantic::tast::{Callee, TExprKind, TypedModule};
use crate::semantic::{SymbolId, SymbolRole};
use std::collections::{HashMap, HashSet};
use tracing::debug;

/// A header name that cannot keep its link spelling in the target language
#[derive(Debug, Clone, PartialEq)]
pub struct NameCollision {
    pub name: String,
    pub native: String,
    pub span: Span,
}

#[derive(Debug, Clone, Default)]
pub struct NameTable {
    language: Language,
    module: String,
    symbols: HashMap<SymbolId, String>,
    functions: HashMap<String, String>,
    collisions: Vec<NameCollision>,
}

impl NameTable {
    pub fn new(module: &TypedModule, language: Language) -> Self {
        let mut table = Self {
            language,
            module: escape(&module.name.replace('.', "_"), language),
            symbols: HashMap::new(),
            functions: HashMap::new(),
            collisions: Vec::new(),
        };
        if !language.is_compiled() {
            return table;
        }

        let mut scope = Scope::new(language);
        scope.reserve(&table.module);
        scope.reserve(&table.init());
        scope.reserve(&format!("{}_wrapper", table.module));
        for header in &module.headers {
            scope.reserve(&escape(&header.module, language));
        }
        for (_, symbol) in module.symbols.symbols() {
            if let SymbolRole::Imported { name, .. } = &symbol.role {
                scope.reserve(&table.external(name));
            }
        }
        for expr in module.exprs.iter() {
            if let TExprKind::Call { callee: Callee::External { symbol, .. }, .. } = &expr.kind {
                scope.reserve(&table.external(symbol));
            }
        }

        if module.is_header {
            // Header names are link names of an existing library
            for &id in &module.globals {
                let symbol = module.symbols.symbol(id);
                let native = table.external(&symbol.name);
                table.link(&mut scope, &symbol.name, &native, symbol.span);
                table.symbols.insert(id, native);
            }
            for function in module.functions.iter() {
                let native = table.external(&function.mangled);
                if !table.functions.contains_key(&function.mangled) {
                    table.link(&mut scope, &function.mangled, &native, function.span);
                }
                table.functions.insert(function.mangled.clone(), native);
            }
        } else {
            for &id in &module.globals {
                let symbol = module.symbols.symbol(id);
                let native = scope.claim(&escape(&symbol.name, language), companions(language, symbol.ty.rank));
                table.symbols.insert(id, native);
            }
            for function in module.functions.iter() {
                let native = scope.claim(&escape(&function.mangled, language), 0);
                table.functions.insert(function.mangled.clone(), native);
            }
        }

        for function in module.functions.iter() {
            let mut local = scope.clone();
            for &id in function.params.iter().chain(&function.locals) {
                let symbol = module.symbols.symbol(id);
                let native = local.claim(&escape(&symbol.name, language), companions(language, symbol.ty.rank));
                table.symbols.insert(id, native);
            }
        }

        for (&id, native) in &table.symbols {
            let symbol = module.symbols.symbol(id);
            if *native != symbol.name {
                debug!(module = %module.name, %language, name = %symbol.name, %native, "renamed");
            }
        }
        table
    }

    fn link(&mut self, scope: &mut Scope, name: &str, native: &str, span: Span) {
        if !scope.insert(native) {
            self.collisions.push(NameCollision {
                name: name.to_string(),
                native: native.to_string(),
                span,
            });
        }
    }

    /// Spelling of a symbol inside the module
    pub fn symbol(&self, module: &TypedModule, id: SymbolId) -> String {
        if let Some(native) = self.symbols.get(&id) {
            return native.clone();
        }
        let symbol = module.symbols.symbol(id);
        match &symbol.role {
            SymbolRole::Imported { name, .. } => self.external(name),
            _ => escape(&symbol.name, self.language),
        }
    }

    /// Spelling of a module variable, by source name
    pub fn global(&self, module: &TypedModule, name: &str) -> String {
        module
            .globals
            .iter()
            .find(|&&id| module.symbols.symbol(id).name == name)
            .map(|&id| self.symbol(module, id))
            .unwrap_or_else(|| escape(name, self.language))
    }

    /// Spelling of a function instance, by mangled name
    pub fn function(&self, mangled: &str) -> String {
        self.functions
            .get(mangled)
            .cloned()
            .unwrap_or_else(|| escape(mangled, self.language))
    }

    /// Spelling of a name declared by a header. C uses the link name as is;
    /// Fortran binds an escaped name to it.
    pub fn external(&self, link_name: &str) -> String {
        match self.language {
            Language::C => link_name.to_string(),
            _ => escape(link_name, self.language),
        }
    }

    pub fn module(&self) -> &str {
        &self.module
    }

    /// Module initialiser run by the wrapper
    pub fn init(&self) -> String {
        format!("{}__init", self.module)
    }

    pub fn collisions(&self) -> &[NameCollision] {
        &self.collisions
    }
}

/// Names already used in one scope
#[derive(Debug, Clone)]
struct Scope {
    language: Language,
    taken: HashSet<String>,
}

impl Scope {
    fn new(language: Language) -> Self {
        Self {
            language,
            taken: HashSet::new(),
        }
    }

    fn key(&self, name: &str) -> String {
        match self.language {
            Language::Fortran => name.to_ascii_lowercase(),
            _ => name.to_string(),
        }
    }

    fn reserve(&mut self, name: &str) {
        let key = self.key(name);
        self.taken.insert(key);
    }

    fn insert(&mut self, name: &str) -> bool {
        let key = self.key(name);
        self.taken.insert(key)
    }

    fn is_free(&self, name: &str) -> bool {
        !self.taken.contains(&self.key(name))
    }

    /// First free spelling of `base`, together with `name_shape0..` for
    /// each of its `extents` companion variables
    fn claim(&mut self, base: &str, extents: usize) -> String {
        let mut candidate = base.to_string();
        let mut suffix = 0;
        loop {
            let shapes: Vec<String> = (0..extents).map(|k| format!("{}_shape{}", candidate, k)).collect();
            if self.is_free(&candidate) && shapes.iter().all(|s| self.is_free(s)) {
                self.reserve(&candidate);
                for shape in &shapes {
                    self.reserve(shape);
                }
                return candidate;
            }
            suffix += 1;
            candidate = format!("{}_{}", base, suffix);
        }
    }
}

/// Extent variables the C backend declares next to an array
fn companions(language: Language, rank: usize) -> usize {
    match language {
        Language::C => rank,
        _ => 0,
    }
}

/// Context-free spelling of a source name: a legal identifier that is not
/// a keyword, a library name of the generated code or a generated name.
pub fn escape(name: &str, language: Language) -> String {
    let mut spelled = String::with_capacity(name.len());
    for c in name.chars() {
        if c.is_ascii_alphanumeric() || c == '_' {
            spelled.push(c);
        } else {
            spelled.push_str(&format!("u{:04x}", c as u32));
        }
    }
    match language {
        Language::C => {
            if has_reserved_c_prefix(&spelled) {
                format!("v{}", spelled)
            } else if is_reserved_c(&spelled) {
                format!("{}_", spelled)
            } else {
                spelled
            }
        }
        Language::Fortran => {
            let lower = spelled.to_ascii_lowercase();
            if FORTRAN_RESERVED_PREFIXES.iter().any(|p| lower.starts_with(p)) {
                format!("v{}", spelled)
            } else if FORTRAN_RESERVED.contains(&lower.as_str()) {
                format!("{}_", spelled)
            } else {
                spelled
            }
        }
        Language::Python => name.to_string(),
    }
}

fn has_reserved_c_prefix(name: &str) -> bool {
    let bytes = name.as_bytes();
    name.starts_with("pyaot_")
        || name.starts_with("__")
        || (bytes.first() == Some(&b'_') && bytes.get(1).is_some_and(u8::is_ascii_uppercase))
}

fn is_reserved_c(name: &str) -> bool {
    if C_KEYWORDS.contains(&name) || C_LIBRARY.contains(&name) || name.ends_with("_t") {
        return true;
    }
    let base = name
        .strip_suffix('f')
        .or_else(|| name.strip_suffix('l'))
        .filter(|b| C_MATH.contains(b));
    if C_MATH.contains(&name) || base.is_some() {
        return true;
    }
    // <stdint.h> limit and constant macros
    let width = name.trim_start_matches('U');
    width.starts_with("INT") && (width.ends_with("_MAX") || width.ends_with("_MIN") || width.ends_with("_C"))
}

const C_KEYWORDS: &[&str] = &[
    "auto", "break", "case", "char", "const", "continue", "default", "do", "double", "else", "enum",
    "extern", "float", "for", "goto", "if", "inline", "int", "long", "register", "restrict", "return",
    "short", "signed", "sizeof", "static", "struct", "switch", "typedef", "union", "unsigned", "void",
    "volatile", "while", "alignas", "alignof", "bool", "constexpr", "false", "nullptr", "static_assert",
    "thread_local", "true", "typeof", "typeof_unqual", "asm", "fortran",
];

/// Identifiers of the headers the C backend includes, other than the
/// <math.h> and <complex.h> functions
const C_LIBRARY: &[&str] = &[
    "main", "errno", "assert", "NULL", "EOF", "FILE", "stdin", "stdout", "stderr",
    // <stdlib.h>
    "malloc", "calloc", "realloc", "free", "aligned_alloc", "abort", "exit", "atexit", "quick_exit",
    "at_quick_exit", "getenv", "system", "atoi", "atol", "atoll", "atof", "strtod", "strtof", "strtold",
    "strtol", "strtoll", "strtoul", "strtoull", "abs", "labs", "llabs", "div", "ldiv", "lldiv", "rand",
    "srand", "qsort", "bsearch", "mblen", "mbtowc", "wctomb", "mbstowcs", "wcstombs", "EXIT_SUCCESS",
    "EXIT_FAILURE", "RAND_MAX", "MB_CUR_MAX",
    // <stdio.h>
    "printf", "fprintf", "sprintf", "snprintf", "vprintf", "vfprintf", "vsprintf", "vsnprintf", "scanf",
    "fscanf", "sscanf", "puts", "fputs", "putc", "fputc", "putchar", "gets", "fgets", "getc", "fgetc",
    "getchar", "ungetc", "fopen", "freopen", "fclose", "fflush", "fread", "fwrite", "fseek", "ftell",
    "rewind", "fgetpos", "fsetpos", "feof", "ferror", "clearerr", "perror", "remove", "rename",
    "tmpfile", "tmpnam", "setbuf", "setvbuf", "BUFSIZ", "SEEK_SET", "SEEK_CUR", "SEEK_END",
    // <string.h>
    "memcpy", "memmove", "memset", "memcmp", "memchr", "strlen", "strcmp", "strncmp", "strcpy",
    "strncpy", "strcat", "strncat", "strchr", "strrchr", "strstr", "strpbrk", "strspn", "strcspn",
    "strtok", "strerror", "strcoll", "strxfrm", "strdup", "strndup",
    // <math.h> and <complex.h> macros
    "HUGE_VAL", "HUGE_VALF", "HUGE_VALL", "INFINITY", "NAN", "FP_NAN", "FP_INFINITE", "FP_ZERO",
    "FP_NORMAL", "FP_SUBNORMAL", "M_PI", "M_E", "isnan", "isinf", "isfinite", "isnormal", "signbit",
    "fpclassify", "isgreater", "isless", "complex", "imaginary", "I", "CMPLX", "CMPLXF", "CMPLXL",
    "SIZE_MAX", "PTRDIFF_MAX", "PTRDIFF_MIN",
];

/// <math.h> and <complex.h> functions; the `f` and `l` variants are
/// reserved as well
const C_MATH: &[&str] = &[
    "acos", "asin", "atan", "atan2", "cos", "sin", "tan", "acosh", "asinh", "atanh", "cosh", "sinh",
    "tanh", "exp", "exp2", "expm1", "frexp", "ilogb", "ldexp", "log", "log10", "log1p", "log2", "logb",
    "modf", "scalbn", "scalbln", "cbrt", "fabs", "hypot", "pow", "sqrt", "erf", "erfc", "lgamma",
    "tgamma", "ceil", "floor", "nearbyint", "rint", "lrint", "llrint", "round", "lround", "llround",
    "trunc", "fmod", "remainder", "remquo", "copysign", "nan", "nextafter", "nexttoward", "fdim",
    "fmax", "fmin", "fma", "cabs", "cacos", "cacosh", "carg", "casin", "casinh", "catan", "catanh",
    "ccos", "ccosh", "cexp", "cimag", "clog", "conj", "cpow", "cproj", "creal", "csin", "csinh",
    "csqrt", "ctan", "ctanh",
];

const FORTRAN_RESERVED_PREFIXES: &[&str] = &["_", "pyaot_", "c_", "ieee_"];

/// Keywords and the intrinsics the Fortran backend calls
const FORTRAN_RESERVED: &[&str] = &[
    "abs", "aimag", "aint", "all", "allocatable", "allocate", "allocated", "anint", "any", "associate",
    "associated", "bind", "block", "btest", "call", "case", "ceiling", "character", "close", "cmplx",
    "common", "complex", "conjg", "contains", "continue", "cos", "count", "cycle", "data", "deallocate",
    "dimension", "do", "dot_product", "else", "elemental", "end", "epsilon", "exit", "exp", "external",
    "floor", "forall", "format", "function", "go", "goto", "huge", "iand", "ieor", "if", "implicit",
    "import", "in", "inout", "int", "integer", "intent", "interface", "intrinsic", "ior", "iso_c_binding",
    "kind", "lbound", "len", "log", "log10", "logical", "matmul", "max", "maxval", "merge", "min",
    "minval", "mod", "module", "modulo", "nint", "none", "not", "null", "only", "open", "optional",
    "out", "pack", "parameter", "pointer", "present", "print", "private", "procedure", "product",
    "program", "public", "pure", "read", "real", "recursive", "reshape", "result", "return", "save",
    "select", "shape", "shifta", "shiftl", "shiftr", "sign", "sin", "size", "spread", "sqrt", "stop",
    "subroutine", "sum", "tan", "target", "then", "transpose", "type", "ubound", "use", "value", "where",
    "while", "write",
];

#[cfg(test)]
mod tests {
    use super::*;
    use crate::diagnostics::DiagnosticReporter;
    use crate::parser::parse_source;
    use crate::semantic::{analyze, SearchPathResolver};

    fn module(source: &str) -> TypedModule {
        let mut reporter = DiagnosticReporter::new("m.py", source);
        let ast = parse_source(source, &mut reporter);
        let mut resolver = SearchPathResolver::new(Vec::new());
        analyze(&ast, "m", false, &mut resolver, &mut reporter)
            .unwrap_or_else(|| panic!("{:?}", reporter.diagnostics()))
    }

    fn global(names: &NameTable, m: &TypedModule, name: &str) -> String {
        names.global(m, name)
    }

    #[test]
    fn keywords_and_library_names_are_escaped() {
        assert_eq!(escape("int", Language::C), "int_");
        assert_eq!(escape("fmod", Language::C), "fmod_");
        assert_eq!(escape("sinf", Language::C), "sinf_");
        assert_eq!(escape("true", Language::C), "true_");
        assert_eq!(escape("INT64_MAX", Language::C), "INT64_MAX_");
        assert_eq!(escape("pyaot_k", Language::C), "vpyaot_k");
        assert_eq!(escape("__x", Language::C), "v__x");
        assert_eq!(escape("width", Language::C), "width");
        assert_eq!(escape("Function", Language::Fortran), "Function_");
        assert_eq!(escape("allocate", Language::Fortran), "allocate_");
        assert_eq!(escape("_x", Language::Fortran), "v_x");
        assert_eq!(escape("c_int", Language::Fortran), "vc_int");
        assert_eq!(escape("é", Language::C), "u00e9");
    }

    #[test]
    fn fortran_renames_names_equal_up_to_case() {
        let m = module("a: int = 1\nA: int = 2\n");
        let names = NameTable::new(&m, Language::Fortran);
        assert_eq!(global(&names, &m, "a"), "a");
        assert_eq!(global(&names, &m, "A"), "A_1");
        let names = NameTable::new(&m, Language::C);
        assert_eq!(global(&names, &m, "A"), "A");
    }

    #[test]
    fn escaped_names_do_not_collide_with_user_names() {
        let m = module("_x: int = 1\nv_x: int = 2\n");
        let names = NameTable::new(&m, Language::Fortran);
        assert_eq!(global(&names, &m, "_x"), "v_x");
        assert_eq!(global(&names, &m, "v_x"), "v_x_1");
    }

    #[test]
    fn c_arrays_keep_their_extent_names_free() {
        let m = module("import numpy as np\na_shape0: int = 3\na = np.zeros(4)\n");
        let names = NameTable::new(&m, Language::C);
        assert_eq!(global(&names, &m, "a_shape0"), "a_shape0");
        assert_eq!(global(&names, &m, "a"), "a_1");
    }

    #[test]
    fn locals_never_hide_module_names() {
        let m = module("n: int = 1\n\ndef f(n_1: int) -> int:\n    n: int = n_1\n    return n\n");
        let names = NameTable::new(&m, Language::C);
        assert_eq!(global(&names, &m, "n"), "n");
        let function = m.functions.iter().next().unwrap();
        assert_eq!(names.function(&function.mangled), "f");
        let spelled: Vec<String> = function
            .params
            .iter()
            .chain(&function.locals)
            .map(|&id| names.symbol(&m, id))
            .collect();
        assert_eq!(spelled, ["n_1", "n_2"]);
    }
}

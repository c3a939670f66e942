//! Resolution of imported modules: the builtin `numpy` and `math`
//! interfaces, and `.pyh` headers found on a search path.

use super::types::TypeDescriptor;
use crate::diagnostics::DiagnosticReporter;
use crate::parser::{self, Annotation, FunctionDef, StmtKind};
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::rc::Rc;
use tracing::debug;

/// A function declared in a header, one entry per instance
#[derive(Debug, Clone, PartialEq)]
pub struct ExternalFunction {
    pub name: String,
    pub link_name: String,
    pub params: Vec<TypeDescriptor>,
    pub results: Vec<TypeDescriptor>,
}

/// Declarations read from a `.pyh` file
#[derive(Debug, Clone, Default, PartialEq)]
pub struct HeaderModule {
    pub name: String,
    pub functions: Vec<ExternalFunction>,
    pub constants: Vec<(String, TypeDescriptor)>,
}

impl HeaderModule {
    pub fn instances<'h>(&'h self, name: &'h str) -> impl Iterator<Item = &'h ExternalFunction> + 'h {
        self.functions.iter().filter(move |f| f.name == name)
    }

    pub fn constant(&self, name: &str) -> Option<&TypeDescriptor> {
        self.constants.iter().find(|(n, _)| n == name).map(|(_, ty)| ty)
    }

    pub fn has_member(&self, name: &str) -> bool {
        self.constant(name).is_some() || self.instances(name).next().is_some()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ResolvedModule {
    Numpy,
    Math,
    Header(Rc<HeaderModule>),
}

/// Resolves the module named in an import statement
pub trait ModuleResolver {
    fn resolve(&mut self, module: &str) -> Result<ResolvedModule, String>;
}

/// Finds `<module>.pyh` in a list of directories
#[derive(Debug, Default)]
pub struct SearchPathResolver {
    search_paths: Vec<PathBuf>,
    cache: HashMap<String, Rc<HeaderModule>>,
}

impl SearchPathResolver {
    pub fn new(search_paths: Vec<PathBuf>) -> Self {
        Self {
            search_paths,
            cache: HashMap::new(),
        }
    }

    fn find_header(&self, module: &str) -> Option<PathBuf> {
        let relative: PathBuf = module.split('.').collect::<PathBuf>().with_extension("pyh");
        self.search_paths
            .iter()
            .map(|dir| dir.join(&relative))
            .find(|candidate| candidate.is_file())
    }
}

impl ModuleResolver for SearchPathResolver {
    fn resolve(&mut self, module: &str) -> Result<ResolvedModule, String> {
        match module {
            "numpy" => return Ok(ResolvedModule::Numpy),
            "math" => return Ok(ResolvedModule::Math),
            _ => {}
        }
        if let Some(header) = self.cache.get(module) {
            return Ok(ResolvedModule::Header(Rc::clone(header)));
        }
        let path = self
            .find_header(module)
            .ok_or_else(|| format!("no module named '{}'", module))?;
        debug!(module, path = %path.display(), "reading header");
        let header = Rc::new(read_header(module, &path)?);
        self.cache.insert(module.to_string(), Rc::clone(&header));
        Ok(ResolvedModule::Header(header))
    }
}

/// Parse a header file into its declarations
pub fn read_header(module: &str, path: &Path) -> Result<HeaderModule, String> {
    let source = fs::read_to_string(path).map_err(|e| format!("cannot read '{}': {}", path.display(), e))?;
    let mut reporter = DiagnosticReporter::new(&path.display().to_string(), &source);
    let ast = parser::parse_source(&source, &mut reporter);
    if let Some(first) = reporter.diagnostics().iter().find(|d| d.is_error()) {
        return Err(format!("invalid header '{}': {}", path.display(), first.text()));
    }

    let mut header = HeaderModule {
        name: module.to_string(),
        ..HeaderModule::default()
    };
    for stmt in &ast.body {
        match &stmt.kind {
            StmtKind::FunctionDef(def) => header.functions.extend(declare_function(def)?),
            StmtKind::AnnAssign { target, annotation, .. } => {
                if let Some(name) = target.as_name() {
                    let ty = single_type(annotation)?;
                    header.constants.push((name.to_string(), ty));
                }
            }
            _ => {}
        }
    }
    Ok(header)
}

fn declare_function(def: &FunctionDef) -> Result<Vec<ExternalFunction>, String> {
    let mut annotations = Vec::with_capacity(def.params.len());
    for param in &def.params {
        let annotation = param
            .annotation
            .as_ref()
            .ok_or_else(|| format!("parameter '{}' of '{}' needs an annotation", param.name, def.name))?;
        annotations.push(annotation);
    }
    let results = match &def.returns {
        Some(annotation) => {
            let ty = single_type(annotation)?;
            if ty.kind == super::types::BaseKind::Void {
                Vec::new()
            } else {
                vec![ty]
            }
        }
        None => Vec::new(),
    };

    let instances = expand_alternatives(&annotations)?;
    let count = instances.len();
    Ok(instances
        .into_iter()
        .enumerate()
        .map(|(index, params)| ExternalFunction {
            name: def.name.clone(),
            link_name: mangle(&def.name, index, count),
            params,
            results: results.clone(),
        })
        .collect())
}

fn single_type(annotation: &Annotation) -> Result<TypeDescriptor, String> {
    match annotation.alternatives.as_slice() {
        [single] => TypeDescriptor::from_annotated(single),
        _ => Err("a union type is only allowed on function parameters".to_string()),
    }
}

/// Every combination of the parameters' annotation alternatives, in order
pub fn expand_alternatives(annotations: &[&Annotation]) -> Result<Vec<Vec<TypeDescriptor>>, String> {
    let mut instances: Vec<Vec<TypeDescriptor>> = vec![Vec::new()];
    for annotation in annotations {
        let mut choices = Vec::with_capacity(annotation.alternatives.len());
        for alternative in &annotation.alternatives {
            choices.push(TypeDescriptor::from_annotated(alternative)?);
        }
        instances = instances
            .into_iter()
            .flat_map(|prefix| {
                choices.iter().map(move |choice| {
                    let mut next = prefix.clone();
                    next.push(choice.clone());
                    next
                })
            })
            .collect();
    }
    Ok(instances)
}

/// Native name of instance `index` out of `count`
pub fn mangle(name: &str, index: usize, count: usize) -> String {
    if count <= 1 {
        name.to_string()
    } else {
        format!("{}__{}", name, index)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::semantic::types::Dtype;
    use std::fs;

    #[test]
    fn builtin_modules_need_no_files() {
        let mut resolver = SearchPathResolver::new(Vec::new());
        assert_eq!(resolver.resolve("numpy"), Ok(ResolvedModule::Numpy));
        assert_eq!(resolver.resolve("math"), Ok(ResolvedModule::Math));
        assert!(resolver.resolve("scipy").is_err());
    }

    #[test]
    fn headers_declare_instances_and_constants() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(
            dir.path().join("mylib.pyh"),
            "def scale(x: 'float[:]', k: 'int | float') -> None:\n    ...\n\nN: int\n",
        )
        .unwrap();

        let mut resolver = SearchPathResolver::new(vec![dir.path().to_path_buf()]);
        let header = match resolver.resolve("mylib") {
            Ok(ResolvedModule::Header(header)) => header,
            other => panic!("unexpected {:?}", other),
        };
        let names: Vec<_> = header.instances("scale").map(|f| f.link_name.as_str()).collect();
        assert_eq!(names, vec!["scale__0", "scale__1"]);
        assert!(header.functions[0].results.is_empty());
        assert_eq!(header.constant("N").and_then(|t| t.dtype()), Some(Dtype::Int64));
    }

    #[test]
    fn mangling_only_for_generic_functions() {
        assert_eq!(mangle("f", 0, 1), "f");
        assert_eq!(mangle("f", 1, 3), "f__1");
    }
}

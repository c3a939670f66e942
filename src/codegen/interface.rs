//! Description of what a compiled module exports through its wrapper:
//! function instances with their argument layouts, and module variables.
//! Written next to the artifact as JSON and read back by the loader.

use super::Language;
use crate::semantic::{Dtype, Order, TypeDescriptor, TypedModule};
use serde::{Deserialize, Serialize};
use std::fs;
use std::io;
use std::path::Path;
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Intent {
    In,
    /// Arrays written by the function; the caller's buffer is updated in place
    InOut,
}

/// Layout of one argument or result
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArgSpec {
    pub name: String,
    pub dtype: Dtype,
    pub rank: usize,
    #[serde(default)]
    pub order: Order,
    pub intent: Intent,
}

impl ArgSpec {
    fn new(name: &str, ty: &TypeDescriptor, intent: Intent) -> Option<Self> {
        Some(Self {
            name: name.to_string(),
            dtype: ty.dtype()?,
            rank: ty.rank,
            order: ty.order,
            intent,
        })
    }

    /// Memory order only matters for arrays of rank 2 and more
    pub fn order_matters(&self) -> bool {
        self.rank > 1
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InstanceInterface {
    /// Exported wrapper symbol
    pub symbol: String,
    pub mangled: String,
    pub params: Vec<ArgSpec>,
    pub results: Vec<ArgSpec>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FunctionInterface {
    pub name: String,
    pub instances: Vec<InstanceInterface>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GlobalInterface {
    pub name: String,
    pub symbol: String,
    pub dtype: Dtype,
    pub rank: usize,
    #[serde(default)]
    pub order: Order,
    pub is_const: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WrapperInterface {
    pub module: String,
    pub language: Language,
    pub init_symbol: String,
    /// Frees array result buffers handed out by the wrappers
    #[serde(default)]
    pub release_symbol: String,
    pub functions: Vec<FunctionInterface>,
    pub globals: Vec<GlobalInterface>,
}

pub fn wrapper_symbol(mangled: &str) -> String {
    format!("pyaot_wrap_{}", mangled)
}

pub fn global_symbol(name: &str) -> String {
    format!("pyaot_global_{}", name)
}

pub fn init_symbol(module: &str) -> String {
    format!("pyaot_init_{}", module)
}

pub fn release_symbol(module: &str) -> String {
    format!("pyaot_release_{}", module)
}

impl WrapperInterface {
    /// Collect the exported functions and module variables. Anything whose
    /// values cannot cross the native boundary (strings) is left out.
    pub fn from_module(module: &TypedModule, language: Language) -> Self {
        let mut functions: Vec<FunctionInterface> = Vec::new();
        for (_, function) in module.exported_functions() {
            let params: Option<Vec<ArgSpec>> = function
                .params
                .iter()
                .map(|&id| {
                    let symbol = module.symbols.symbol(id);
                    let intent = if symbol.ty.is_array() && symbol.mutated {
                        Intent::InOut
                    } else {
                        Intent::In
                    };
                    ArgSpec::new(&symbol.name, &symbol.ty, intent)
                })
                .collect();
            let results: Option<Vec<ArgSpec>> = function
                .results
                .iter()
                .enumerate()
                .map(|(i, ty)| ArgSpec::new(&format!("result_{}", i), ty, Intent::In))
                .collect();
            let (Some(params), Some(results)) = (params, results) else {
                debug!(function = %function.mangled, "not wrapped: argument without a native dtype");
                continue;
            };

            let instance = InstanceInterface {
                symbol: wrapper_symbol(&function.mangled),
                mangled: function.mangled.clone(),
                params,
                results,
            };
            match functions.iter_mut().find(|f| f.name == function.name) {
                Some(existing) => existing.instances.push(instance),
                None => functions.push(FunctionInterface {
                    name: function.name.clone(),
                    instances: vec![instance],
                }),
            }
        }

        let globals = module
            .globals
            .iter()
            .map(|&id| module.symbols.symbol(id))
            .filter(|symbol| symbol.is_exported)
            .filter_map(|symbol| {
                Some(GlobalInterface {
                    name: symbol.name.clone(),
                    symbol: global_symbol(&symbol.name),
                    dtype: symbol.ty.dtype()?,
                    rank: symbol.ty.rank,
                    order: symbol.ty.order,
                    is_const: symbol.ty.is_const,
                })
            })
            .collect();

        Self {
            module: module.name.clone(),
            language,
            init_symbol: init_symbol(&module.name),
            release_symbol: release_symbol(&module.name),
            functions,
            globals,
        }
    }

    pub fn function(&self, name: &str) -> Option<&FunctionInterface> {
        self.functions.iter().find(|f| f.name == name)
    }

    pub fn global(&self, name: &str) -> Option<&GlobalInterface> {
        self.globals.iter().find(|g| g.name == name)
    }

    /// Whether any instance hands back an array
    pub fn returns_arrays(&self) -> bool {
        self.instances().any(|i| i.results.iter().any(|r| r.rank > 0))
    }

    /// Every wrapper instance in declaration order
    pub fn instances(&self) -> impl Iterator<Item = &InstanceInterface> {
        self.functions.iter().flat_map(|f| f.instances.iter())
    }

    pub fn save(&self, path: &Path) -> io::Result<()> {
        let json = serde_json::to_string_pretty(self).map_err(io::Error::other)?;
        fs::write(path, json)
    }

    pub fn load(path: &Path) -> io::Result<Self> {
        let text = fs::read_to_string(path)?;
        serde_json::from_str(&text).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::diagnostics::DiagnosticReporter;
    use crate::parser::parse_source;
    use crate::semantic::{analyze, SearchPathResolver};

    fn interface(source: &str) -> WrapperInterface {
        let mut reporter = DiagnosticReporter::new("m.py", source);
        let ast = parse_source(source, &mut reporter);
        let mut resolver = SearchPathResolver::new(Vec::new());
        let module = analyze(&ast, "m", false, &mut resolver, &mut reporter)
            .unwrap_or_else(|| panic!("{:?}", reporter.diagnostics()));
        WrapperInterface::from_module(&module, Language::C)
    }

    #[test]
    fn written_arrays_are_inout() {
        let iface = interface("\
def scale(a: 'float[:]', k: float):
    for i in range(len(a)):
        a[i] = a[i] * k

def total(a: 'float[:]') -> float:
    s = 0.0
    for i in range(len(a)):
        s += a[i]
    return s
");
        let scale = &iface.function("scale").unwrap().instances[0];
        assert_eq!(scale.symbol, "pyaot_wrap_scale");
        assert_eq!(scale.params[0].intent, Intent::InOut);
        assert_eq!(scale.params[1].intent, Intent::In);
        assert!(scale.results.is_empty());

        let total = &iface.function("total").unwrap().instances[0];
        assert_eq!(total.params[0].intent, Intent::In);
        assert_eq!(total.results[0].dtype, Dtype::Float64);
        assert_eq!(iface.init_symbol, "pyaot_init_m");
    }

    #[test]
    fn globals_skip_private_and_string_values() {
        let iface = interface("\
import numpy as np
a = np.array([1, 2, 3, 4, 5])
_hidden = 3
name = 'm'
");
        let names: Vec<_> = iface.globals.iter().map(|g| g.name.as_str()).collect();
        assert_eq!(names, vec!["a"]);
        assert_eq!(iface.globals[0].dtype, Dtype::Int64);
        assert_eq!(iface.globals[0].rank, 1);
    }

    #[test]
    fn interface_survives_a_json_file() {
        let iface = interface("def f(x: 'int | float') -> float:\n    return x * 2.0\n");
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("m.json");
        iface.save(&path).unwrap();
        let loaded = WrapperInterface::load(&path).unwrap();
        assert_eq!(loaded, iface);
        assert_eq!(loaded.function("f").unwrap().instances.len(), 2);
    }
}

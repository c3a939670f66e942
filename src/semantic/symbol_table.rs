//! Symbol table for tracking declarations and scopes.
//!
//! Scopes and symbols live in arenas and refer to their parents by id.
//! Python only opens scopes for modules and functions; blocks share the
//! scope of the function that contains them.

use super::types::TypeDescriptor;
use crate::index_vec::IndexVec;
use crate::parser::Span;
use std::collections::HashMap;

crate::define_id!(
    /// Index of a [`Symbol`] in the table
    SymbolId,
    "sym"
);
crate::define_id!(
    /// Index of a [`Scope`] in the table
    ScopeId,
    "scope"
);

/// Role a name plays in its scope
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SymbolRole {
    Variable,
    Argument,
    Constant,
    /// A function defined in this module
    Function,
    /// `import numpy as np` binds `np` to `numpy`
    Module(String),
    /// `from m import n` binds `n` to a member of `m`
    Imported { module: String, name: String },
}

/// A symbol in the symbol table
#[derive(Debug, Clone)]
pub struct Symbol {
    pub name: String,
    pub ty: TypeDescriptor,
    pub scope: ScopeId,
    pub role: SymbolRole,
    pub is_exported: bool,
    pub span: Span,
    pub used: bool,
    /// Written after its first binding (element writes included)
    pub mutated: bool,
}

impl Symbol {
    pub fn new(name: impl Into<String>, ty: TypeDescriptor, role: SymbolRole, span: Span) -> Self {
        Self {
            name: name.into(),
            ty,
            scope: ScopeId(0),
            role,
            is_exported: false,
            span,
            used: false,
            mutated: false,
        }
    }

    pub fn is_argument(&self) -> bool {
        self.role == SymbolRole::Argument
    }

    /// Variables, arguments and constants carry values
    pub fn is_value(&self) -> bool {
        matches!(self.role, SymbolRole::Variable | SymbolRole::Argument | SymbolRole::Constant)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScopeKind {
    Module,
    Function,
}

/// A single scope level
#[derive(Debug, Clone)]
pub struct Scope {
    pub kind: ScopeKind,
    pub name: String,
    pub parent: Option<ScopeId>,
    names: HashMap<String, SymbolId>,
    /// Symbols in declaration order
    order: Vec<SymbolId>,
    closed: bool,
}

impl Scope {
    fn new(kind: ScopeKind, name: String, parent: Option<ScopeId>) -> Self {
        Self {
            kind,
            name,
            parent,
            names: HashMap::new(),
            order: Vec::new(),
            closed: false,
        }
    }

    pub fn symbols(&self) -> &[SymbolId] {
        &self.order
    }
}

/// Symbol table with nested scopes
#[derive(Debug, Clone)]
pub struct SymbolTable {
    symbols: IndexVec<SymbolId, Symbol>,
    scopes: IndexVec<ScopeId, Scope>,
    current: ScopeId,
}

impl SymbolTable {
    pub fn new(module_name: &str) -> Self {
        let mut scopes = IndexVec::new();
        let root = scopes.push(Scope::new(ScopeKind::Module, module_name.to_string(), None));
        Self {
            symbols: IndexVec::new(),
            scopes,
            current: root,
        }
    }

    pub fn root(&self) -> ScopeId {
        ScopeId(0)
    }

    pub fn current(&self) -> ScopeId {
        self.current
    }

    pub fn is_global(&self) -> bool {
        self.current == self.root()
    }

    /// Open a function scope under the module scope and make it current.
    pub fn enter_function(&mut self, name: &str) -> ScopeId {
        let scope = Scope::new(ScopeKind::Function, name.to_string(), Some(self.root()));
        let id = self.scopes.push(scope);
        self.current = id;
        id
    }

    /// Switch the current scope, returning the previous one
    pub fn set_current(&mut self, scope: ScopeId) -> ScopeId {
        std::mem::replace(&mut self.current, scope)
    }

    /// Define a symbol in the current scope. On a duplicate, returns the id
    /// of the existing symbol.
    pub fn define(&mut self, mut symbol: Symbol) -> Result<SymbolId, SymbolId> {
        let scope_id = self.current;
        if let Some(&existing) = self.scopes[scope_id].names.get(&symbol.name) {
            return Err(existing);
        }
        symbol.scope = scope_id;
        symbol.is_exported = scope_id == self.root() && !symbol.name.starts_with('_');
        let name = symbol.name.clone();
        let id = self.symbols.push(symbol);
        let scope = &mut self.scopes[scope_id];
        scope.names.insert(name, id);
        scope.order.push(id);
        Ok(id)
    }

    /// Look up a name from the current scope outwards
    pub fn lookup(&self, name: &str) -> Option<SymbolId> {
        let mut scope = Some(self.current);
        while let Some(id) = scope {
            let current = &self.scopes[id];
            if !current.closed {
                if let Some(&symbol) = current.names.get(name) {
                    return Some(symbol);
                }
            }
            scope = current.parent;
        }
        None
    }

    /// Look up a name in the current scope only
    pub fn lookup_local(&self, name: &str) -> Option<SymbolId> {
        self.scopes[self.current].names.get(name).copied()
    }

    pub fn lookup_global(&self, name: &str) -> Option<SymbolId> {
        self.scopes[self.root()].names.get(name).copied()
    }

    pub fn mark_used(&mut self, id: SymbolId) {
        self.symbols[id].used = true;
    }

    pub fn mark_mutated(&mut self, id: SymbolId) {
        self.symbols[id].mutated = true;
    }

    /// Check if defining `name` in the current scope would hide a module
    /// level value.
    pub fn shadows(&self, name: &str) -> bool {
        if self.is_global() {
            return false;
        }
        self.lookup_global(name)
            .map(|id| self.symbols[id].is_value())
            .unwrap_or(false)
    }

    /// Finish a function scope, returning its unused local variables
    pub fn close(&mut self, scope: ScopeId) -> Vec<SymbolId> {
        self.scopes[scope].closed = true;
        if self.current == scope {
            self.current = self.root();
        }
        self.scopes[scope]
            .order
            .iter()
            .copied()
            .filter(|&id| {
                let symbol = &self.symbols[id];
                symbol.role == SymbolRole::Variable && !symbol.used && !symbol.name.starts_with('_')
            })
            .collect()
    }

    pub fn symbol(&self, id: SymbolId) -> &Symbol {
        &self.symbols[id]
    }

    pub fn symbol_mut(&mut self, id: SymbolId) -> &mut Symbol {
        &mut self.symbols[id]
    }

    pub fn scope(&self, id: ScopeId) -> &Scope {
        &self.scopes[id]
    }

    pub fn symbols(&self) -> impl Iterator<Item = (SymbolId, &Symbol)> {
        self.symbols.iter_enumerated()
    }

    /// Whether a name is bound anywhere in a scope, closed or not
    pub fn is_bound_in(&self, scope: ScopeId, name: &str) -> bool {
        self.scopes[scope].names.contains_key(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn variable(name: &str) -> Symbol {
        Symbol::new(name, TypeDescriptor::int(), SymbolRole::Variable, Span::default())
    }

    #[test]
    fn lookup_walks_to_module_scope() {
        let mut table = SymbolTable::new("m");
        let global = table.define(variable("n")).unwrap();
        assert!(table.symbol(global).is_exported);

        let scope = table.enter_function("f");
        let local = table.define(variable("x")).unwrap();
        assert_eq!(table.lookup("n"), Some(global));
        assert_eq!(table.lookup("x"), Some(local));
        assert_eq!(table.lookup_local("n"), None);
        assert!(!table.symbol(local).is_exported);

        table.close(scope);
        assert_eq!(table.lookup("x"), None);
        assert!(table.is_bound_in(scope, "x"));
    }

    #[test]
    fn duplicates_return_existing_symbol() {
        let mut table = SymbolTable::new("m");
        let first = table.define(variable("a")).unwrap();
        assert_eq!(table.define(variable("a")), Err(first));
    }

    #[test]
    fn shadowing_and_unused_locals() {
        let mut table = SymbolTable::new("m");
        table.define(variable("total")).unwrap();
        let scope = table.enter_function("f");
        assert!(table.shadows("total"));
        let used = table.define(variable("used")).unwrap();
        table.define(variable("unused")).unwrap();
        table.define(variable("_ignored")).unwrap();
        table.mark_used(used);
        let unused = table.close(scope);
        assert_eq!(unused.len(), 1);
        assert_eq!(table.symbol(unused[0]).name, "unused");
        assert!(table.is_global());
    }
}

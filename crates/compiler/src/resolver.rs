//! Name resolution.
//!
//! The resolver assigns every declaration a unique symbol id, binds every
//! identifier reference to a symbol, and maintains the tree of lexical
//! scopes. Scopes refer to their parents by id; the resolver owns both the
//! scope tree and the symbol table for the lifetime of a compilation, and
//! AST nodes refer to symbols by id only.
//!
//! Symbols declared inside a function body additionally receive a dense
//! function-level index; these indices are the addresses the lowerer uses
//! for function-scoped locals.

use crate::ast::{Ast, FunDecl, NodeId, NodeKind};
use crate::error::{Error, ErrorKind, SourceLoc};
use crate::modules::ModuleDef;
use crate::types::Type;
use std::collections::{HashMap, HashSet};

/// Name of the hidden local carrying a function's return value (`знач`).
pub const RETURN_VAR: &str = "$$return";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ScopeId(pub u32);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SymbolId(pub u32);

/// A named entity bound at a declaration site.
#[derive(Debug)]
pub struct Symbol {
    pub id: SymbolId,
    /// Scope of declaration.
    pub scope: ScopeId,
    /// Index among the declarations of that scope.
    pub scope_index: u32,
    /// Dense index among all locals of the enclosing function, if declared
    /// inside a function body.
    pub function_index: Option<u32>,
    /// The enclosing function scope, if any.
    pub function_scope: Option<ScopeId>,
    pub name: String,
    /// The declaring AST node.
    pub node: NodeId,
}

/// The subset of [`Symbol`] callers need at lookup sites.
#[derive(Debug, Clone, Copy)]
pub struct SymbolInfo {
    pub id: SymbolId,
    pub scope: ScopeId,
    pub scope_index: u32,
    pub function_index: Option<u32>,
    pub function_scope: Option<ScopeId>,
}

#[derive(Debug)]
struct Scope {
    parent: Option<ScopeId>,
    /// Nearest enclosing function scope (the scope itself for a function
    /// body scope).
    function_scope: Option<ScopeId>,
    names: HashMap<String, SymbolId>,
    allows_redeclare: bool,
    root: bool,
    /// Counter for function-level indices; meaningful on function scopes.
    next_function_local: u32,
}

/// The name resolver. See the module docs.
#[derive(Debug, Default)]
pub struct Resolver {
    scopes: Vec<Scope>,
    symbols: Vec<Symbol>,
    /// Identifier and assignment nodes bound to their symbols.
    bindings: HashMap<NodeId, SymbolId>,
    registered: HashMap<String, ModuleDef>,
    imported: HashSet<String>,
    externals: Vec<(SymbolId, NodeId)>,
}

impl Resolver {
    pub fn new() -> Self {
        Resolver::default()
    }

    /// The root scope, created on first use.
    pub fn root_scope(&mut self) -> ScopeId {
        if self.scopes.is_empty() {
            self.scopes.push(Scope {
                parent: None,
                function_scope: None,
                names: HashMap::new(),
                allows_redeclare: false,
                root: true,
                next_function_local: 0,
            });
        }
        ScopeId(0)
    }

    /// Permit repeated declarations in the root scope (REPL-style use).
    pub fn allow_root_redeclare(&mut self) {
        let root = self.root_scope();
        self.scopes[root.0 as usize].allows_redeclare = true;
    }

    fn new_scope(&mut self, parent: ScopeId, function_scope: Option<ScopeId>) -> ScopeId {
        let id = ScopeId(self.scopes.len() as u32);
        self.scopes.push(Scope {
            parent: Some(parent),
            function_scope,
            names: HashMap::new(),
            allows_redeclare: false,
            root: false,
            next_function_local: 0,
        });
        id
    }

    /// Walk the scope chain towards the root looking for `name`.
    pub fn lookup(&self, name: &str, scope: ScopeId) -> Option<SymbolInfo> {
        let mut cur = Some(scope);
        while let Some(id) = cur {
            let s = self.scopes.get(id.0 as usize)?;
            if let Some(&sym) = s.names.get(name) {
                let symbol = &self.symbols[sym.0 as usize];
                return Some(SymbolInfo {
                    id: symbol.id,
                    scope: symbol.scope,
                    scope_index: symbol.scope_index,
                    function_index: symbol.function_index,
                    function_scope: symbol.function_scope,
                });
            }
            cur = s.parent;
        }
        None
    }

    /// The declaring AST node of a symbol.
    pub fn symbol_node(&self, id: SymbolId) -> Option<NodeId> {
        self.symbols.get(id.0 as usize).map(|s| s.node)
    }

    /// The symbol an identifier or assignment node was bound to.
    pub fn binding(&self, node: NodeId) -> Option<SymbolId> {
        self.bindings.get(&node).copied()
    }

    pub fn symbols(&self) -> &[Symbol] {
        &self.symbols
    }

    /// External function declarations injected by imported modules, in
    /// import order.
    pub fn external_functions(&self) -> &[(SymbolId, NodeId)] {
        &self.externals
    }

    fn declare(
        &mut self,
        name: &str,
        node: NodeId,
        scope: ScopeId,
        loc: SourceLoc,
    ) -> Result<SymbolId, Error> {
        // Re-entry: the same node declaring the same name keeps its symbol.
        if let Some(&bound) = self.bindings.get(&node) {
            if self.symbols[bound.0 as usize].name == name {
                return Ok(bound);
            }
        }
        if let Some(&existing) = self.scopes[scope.0 as usize].names.get(name) {
            if !self.scopes[scope.0 as usize].allows_redeclare {
                return Err(Error::new(
                    loc,
                    ErrorKind::AlreadyDeclared {
                        name: name.to_string(),
                    },
                ));
            }
            self.symbols[existing.0 as usize].node = node;
            self.bindings.insert(node, existing);
            return Ok(existing);
        }

        let id = SymbolId(self.symbols.len() as u32);
        let function_scope = self.scopes[scope.0 as usize].function_scope;
        let function_index = function_scope.map(|fs| {
            let counter = &mut self.scopes[fs.0 as usize].next_function_local;
            let idx = *counter;
            *counter += 1;
            idx
        });
        let scope_index = self.scopes[scope.0 as usize].names.len() as u32;
        self.symbols.push(Symbol {
            id,
            scope,
            scope_index,
            function_index,
            function_scope,
            name: name.to_string(),
            node,
        });
        self.scopes[scope.0 as usize]
            .names
            .insert(name.to_string(), id);
        self.bindings.insert(node, id);
        Ok(id)
    }

    /// Declare `name` in the same scope as an already-resolved symbol.
    /// Used by the transformer for the hidden array-bounds variables, which
    /// must share the array's scope and function.
    pub fn declare_like(
        &mut self,
        name: &str,
        node: NodeId,
        sibling: &SymbolInfo,
        loc: SourceLoc,
    ) -> Result<SymbolId, Error> {
        self.declare(name, node, sibling.scope, loc)
    }

    /// Declare a function symbol in the root scope. Used by module
    /// registration.
    pub fn declare_function(
        &mut self,
        name: &str,
        node: NodeId,
        loc: SourceLoc,
    ) -> Result<SymbolId, Error> {
        let root = self.root_scope();
        self.declare(name, node, root, loc)
    }

    /// Make a module's external functions available for import.
    pub fn register_module(&mut self, module: ModuleDef) {
        self.registered.insert(module.name.clone(), module);
    }

    /// Inject a registered module's external functions into the root scope.
    /// Returns false if no module with that name was registered.
    pub fn import_module(&mut self, ast: &mut Ast, name: &str) -> bool {
        if self.imported.contains(name) {
            return true;
        }
        let Some(module) = self.registered.get(name) else {
            return false;
        };
        let decls: Vec<_> = module.functions.clone();
        self.imported.insert(name.to_string());
        for ext in decls {
            let loc = SourceLoc::default();
            let params: Vec<NodeId> = ext
                .params
                .iter()
                .enumerate()
                .map(|(i, ty)| ast.var_decl(loc, &format!("arg{}", i), ty.clone()))
                .collect();
            let fun_type = Type::function(ext.params.clone(), ext.ret.clone());
            let node = ast.external_fun(
                loc,
                FunDecl {
                    name: ext.name.clone(),
                    mangled: ext.mangled.clone(),
                    params,
                    body: None,
                    ret: ext.ret.clone(),
                    packed: ext.packed,
                    requires_materialization: ext.requires_materialization,
                    scope: None,
                },
            );
            ast.node_mut(node).ty = Some(fun_type);
            match self.declare_function(&ext.name, node, loc) {
                Ok(sym) => self.externals.push((sym, node)),
                Err(_) => {
                    // A redeclared external keeps its first registration.
                    tracing::debug!(name = %ext.name, "skipping already-declared external");
                }
            }
        }
        true
    }

    /// Resolve the whole tree. The root must be a block; it receives the
    /// root scope.
    pub fn resolve(&mut self, ast: &mut Ast, root: NodeId) -> Result<(), Error> {
        let root_scope = self.root_scope();
        if let NodeKind::Block { scope, .. } = &mut ast.node_mut(root).kind {
            *scope = Some(root_scope);
        }
        self.resolve_node(ast, root, root_scope)
    }

    fn resolve_node(&mut self, ast: &mut Ast, id: NodeId, scope: ScopeId) -> Result<(), Error> {
        let loc = ast.node(id).loc;
        let mut scope = scope;
        match &ast.node(id).kind {
            NodeKind::FunDecl(decl) => {
                if decl.name.is_empty() {
                    return Err(Error::new(
                        loc,
                        ErrorKind::MissingBinding {
                            name: "<anonymous function>".to_string(),
                        },
                    ));
                }
                let name = decl.name.clone();
                let params = decl.params.clone();
                let body = decl.body;
                let ret = decl.ret.clone();
                let recorded = decl.scope;
                self.declare(&name, id, scope, loc)?;
                let Some(body) = body else {
                    // External declaration, no scope of its own.
                    return Ok(());
                };
                // Re-entry reuses the function scope recorded on the node.
                let body_scope = match recorded {
                    Some(s) => s,
                    None => {
                        let s = self.new_scope(scope, None);
                        self.scopes[s.0 as usize].function_scope = Some(s);
                        if let NodeKind::FunDecl(decl) = &mut ast.node_mut(id).kind {
                            decl.scope = Some(s);
                        }
                        s
                    }
                };
                for param in params {
                    self.resolve_node(ast, param, body_scope)?;
                }
                if !ret.is_void() && self.scopes[body_scope.0 as usize].names.get(RETURN_VAR).is_none()
                {
                    // The hidden return-value local, assigned by `знач := e`.
                    // The node lives outside the statement tree, so it gets
                    // its type here rather than from the annotator.
                    let ret_var = ast.var_decl(loc, RETURN_VAR, ret.clone());
                    ast.node_mut(ret_var).ty = Some(ret);
                    self.declare(RETURN_VAR, ret_var, body_scope, loc)?;
                }
                if let NodeKind::Block { scope: s, .. } = &mut ast.node_mut(body).kind {
                    if s.is_none() {
                        *s = Some(body_scope);
                    }
                }
                return self.resolve_node(ast, body, body_scope);
            }
            NodeKind::Block { scope: recorded, .. } => {
                // Re-entry during multi-pass analysis reuses the recorded
                // scope; a fresh block gets a new child scope.
                match recorded {
                    Some(s) => scope = *s,
                    None => {
                        let function_scope = self.scopes[scope.0 as usize].function_scope;
                        let new = self.new_scope(scope, function_scope);
                        if let NodeKind::Block { scope: s, .. } = &mut ast.node_mut(id).kind {
                            *s = Some(new);
                        }
                        scope = new;
                    }
                }
            }
            NodeKind::Ident { name } => {
                let name = name.clone();
                let Some(info) = self.lookup(&name, scope) else {
                    return Err(Error::new(loc, ErrorKind::UndefinedIdentifier { name }));
                };
                self.bindings.insert(id, info.id);
                return Ok(());
            }
            NodeKind::Assign { name, .. } => {
                let name = name.clone();
                let Some(info) = self.lookup(&name, scope) else {
                    return Err(Error::new(loc, ErrorKind::UndefinedIdentifier { name }));
                };
                self.bindings.insert(id, info.id);
            }
            NodeKind::VarDecl { name, .. } => {
                let name = name.clone();
                self.declare(&name, id, scope, loc)?;
            }
            _ => {}
        }

        for child in ast.node(id).kind.children() {
            self.resolve_node(ast, child, scope)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Type;

    fn loc() -> SourceLoc {
        SourceLoc::new(1, 1)
    }

    #[test]
    fn lookup_finds_nearest_declaration() {
        let mut ast = Ast::new();
        let outer_decl = ast.var_decl(loc(), "x", Type::int());
        let inner_decl = ast.var_decl(loc(), "x", Type::float());
        let inner_use = ast.ident(loc(), "x");
        let inner = ast.block(loc(), vec![inner_decl, inner_use]);
        let outer_use = ast.ident(loc(), "x");
        let root = ast.block(loc(), vec![outer_decl, inner, outer_use]);

        let mut r = Resolver::new();
        r.resolve(&mut ast, root).unwrap();

        let outer_sym = r.binding(outer_decl).unwrap();
        let inner_sym = r.binding(inner_decl).unwrap();
        assert_ne!(outer_sym, inner_sym);
        assert_eq!(r.binding(inner_use).unwrap(), inner_sym);
        assert_eq!(r.binding(outer_use).unwrap(), outer_sym);
    }

    #[test]
    fn redeclaration_in_same_scope_fails() {
        let mut ast = Ast::new();
        let a = ast.var_decl(loc(), "x", Type::int());
        let b = ast.var_decl(loc(), "x", Type::int());
        let root = ast.block(loc(), vec![a, b]);

        let mut r = Resolver::new();
        let err = r.resolve(&mut ast, root).unwrap_err();
        assert!(matches!(err.kind, ErrorKind::AlreadyDeclared { .. }));
    }

    #[test]
    fn root_redeclare_flag_permits_repeats() {
        let mut ast = Ast::new();
        let a = ast.var_decl(loc(), "x", Type::int());
        let b = ast.var_decl(loc(), "x", Type::int());
        let root = ast.block(loc(), vec![a, b]);

        let mut r = Resolver::new();
        r.allow_root_redeclare();
        r.resolve(&mut ast, root).unwrap();
        assert_eq!(r.binding(a).unwrap(), r.binding(b).unwrap());
    }

    #[test]
    fn undefined_identifier_reports_name() {
        let mut ast = Ast::new();
        let use_x = ast.ident(loc(), "мистика");
        let root = ast.block(loc(), vec![use_x]);

        let mut r = Resolver::new();
        let err = r.resolve(&mut ast, root).unwrap_err();
        match err.kind {
            ErrorKind::UndefinedIdentifier { name } => assert_eq!(name, "мистика"),
            other => panic!("unexpected error: {:?}", other),
        }
    }

    #[test]
    fn function_locals_get_dense_indices() {
        let mut ast = Ast::new();
        let p0 = ast.var_decl(loc(), "a", Type::int());
        let p1 = ast.var_decl(loc(), "b", Type::float());
        let local = ast.var_decl(loc(), "t", Type::int());
        let body = ast.block(loc(), vec![local]);
        let f = ast.fun_decl(loc(), "f", vec![p0, p1], body, Type::int());
        let root = ast.block(loc(), vec![f]);

        let mut r = Resolver::new();
        r.resolve(&mut ast, root).unwrap();

        // Params first, then $$return, then body locals; contiguous from 0.
        let fun_scope = match &ast.node(f).kind {
            NodeKind::FunDecl(d) => d.scope.unwrap(),
            _ => unreachable!(),
        };
        let idx_of = |name: &str| r.lookup(name, fun_scope).unwrap().function_index.unwrap();
        let mut indices = vec![idx_of("a"), idx_of("b"), idx_of(RETURN_VAR), idx_of("t")];
        indices.sort_unstable();
        assert_eq!(indices, vec![0, 1, 2, 3]);
        assert_eq!(idx_of("a"), 0);
        assert_eq!(idx_of("b"), 1);
    }

    #[test]
    fn globals_have_no_function_index() {
        let mut ast = Ast::new();
        let g = ast.var_decl(loc(), "g", Type::int());
        let root = ast.block(loc(), vec![g]);

        let mut r = Resolver::new();
        r.resolve(&mut ast, root).unwrap();
        let info = r.lookup("g", ScopeId(0)).unwrap();
        assert!(info.function_index.is_none());
        assert!(info.function_scope.is_none());
    }

    #[test]
    fn nested_blocks_reuse_recorded_scopes_on_reentry() {
        let mut ast = Ast::new();
        let decl = ast.var_decl(loc(), "x", Type::int());
        let inner = ast.block(loc(), vec![decl]);
        let root = ast.block(loc(), vec![inner]);

        let mut r = Resolver::new();
        r.resolve(&mut ast, root).unwrap();
        let first = match &ast.node(inner).kind {
            NodeKind::Block { scope, .. } => scope.unwrap(),
            _ => unreachable!(),
        };
        // A second resolve pass over the same tree must not allocate new
        // scopes or re-declare.
        r.resolve(&mut ast, root).unwrap();
        let second = match &ast.node(inner).kind {
            NodeKind::Block { scope, .. } => scope.unwrap(),
            _ => unreachable!(),
        };
        assert_eq!(first, second);
    }
}

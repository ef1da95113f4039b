//! Top-level lowering: external imports, globals, and the synthetic module
//! constructor/destructor.
//!
//! The root block's statements are function declarations, global variable
//! declarations, and global assignments. Globals occupy module slots
//! indexed by their symbol id; any global whose initialization has
//! observable effects is lowered into `$$module_constructor` so the
//! initialization order follows source order. Destructors pending at module
//! scope are emitted into `$$module_destructor`.

use super::{BlockScope, Destructor, Lowerer};
use crate::ast::{NodeId, NodeKind, Number};
use crate::error::{Error, ErrorKind};
use crate::ir::{ExternalFunction, Imm, Kind, Slot, MODULE_CONSTRUCTOR, MODULE_DESTRUCTOR};
use crate::op;
use crate::resolver::ScopeId;

impl Lowerer<'_> {
    /// Lower the whole translation unit into the builder's module.
    pub fn lower_top(&mut self, root: NodeId) -> Result<(), Error> {
        self.import_external_functions();
        if !matches!(self.ast.node(root).kind, NodeKind::Block { .. }) {
            return Err(Error::new(
                self.ast.node(root).loc,
                ErrorKind::RootExprMustBeBlock,
            ));
        }
        let scope = BlockScope {
            func: None,
            scope: ScopeId(0),
            break_label: None,
            continue_label: None,
        };

        let mut state = TopLevelState::default();
        self.lower_top_block(root, &scope, &mut state)?;

        if let Some(ctor) = state.constructor {
            self.builder.select_function(ctor);
            self.builder.emit_void(op::RET, &[]);
            self.builder.module_mut().constructor = Some(ctor);
        }

        if !self.pending_destructors.is_empty() {
            let dtor_idx = self.builder.new_function(MODULE_DESTRUCTOR, vec![], None);
            let void = self.builder.types_mut().primitive(Kind::Void);
            self.builder.set_return_type(void);
            let dtors: Vec<Destructor> = std::mem::take(&mut self.pending_destructors);
            for dtor in dtors.iter().rev() {
                self.emit_destructor(dtor)?;
            }
            self.builder.emit_void(op::RET, &[]);
            self.builder.module_mut().destructor = Some(dtor_idx);
        }
        tracing::debug!(
            functions = self.builder.module().functions.len(),
            externals = self.builder.module().externals.len(),
            "lowered module"
        );
        Ok(())
    }

    /// Copy the resolver's imported external declarations into the module.
    fn import_external_functions(&mut self) {
        for &(sym, node) in self.resolver.external_functions() {
            if self.builder.module().ext_by_symbol.contains_key(&sym) {
                continue;
            }
            let NodeKind::FunDecl(decl) = &self.ast.node(node).kind else {
                continue;
            };
            let decl = decl.clone();
            let fun_ty = self.ast.node(node).ty.clone();
            let (param_types, ret_type) = match fun_ty.as_ref().and_then(|t| t.as_function()) {
                Some((params, ret)) => {
                    let ps = params
                        .iter()
                        .map(|p| self.builder.types_mut().lower(p))
                        .collect();
                    let r = self.builder.types_mut().lower(ret);
                    (ps, r)
                }
                None => (Vec::new(), self.builder.types_mut().primitive(Kind::Void)),
            };
            let ext = ExternalFunction {
                name: decl.name,
                mangled: decl.mangled,
                param_types,
                ret_type,
                packed: decl.packed,
                sym_id: sym,
            };
            let module = self.builder.module_mut();
            let idx = module.externals.len();
            module.externals.push(ext);
            module.ext_by_symbol.insert(sym, idx);
        }
    }

    fn switch_to_constructor(&mut self, state: &mut TopLevelState) {
        match state.constructor {
            Some(idx) => self.builder.select_function(idx),
            None => {
                let idx = self.builder.new_function(MODULE_CONSTRUCTOR, vec![], None);
                let void = self.builder.types_mut().primitive(Kind::Void);
                self.builder.set_return_type(void);
                state.constructor = Some(idx);
            }
        }
    }

    fn lower_top_block(
        &mut self,
        block: NodeId,
        scope: &BlockScope,
        state: &mut TopLevelState,
    ) -> Result<(), Error> {
        let stmts = match &self.ast.node(block).kind {
            NodeKind::Block { stmts, .. } => stmts.clone(),
            _ => {
                return Err(Error::new(
                    self.ast.node(block).loc,
                    ErrorKind::RootExprMustBeBlock,
                ));
            }
        };
        for stmt in stmts {
            let loc = self.ast.node(stmt).loc;
            match &self.ast.node(stmt).kind {
                NodeKind::FunDecl(decl) => {
                    let is_external = decl.body.is_none();
                    self.lower(stmt, scope)?;
                    if !is_external {
                        state.function_seen = true;
                    }
                }
                NodeKind::Block { .. } => {
                    // Transient wrappers (array-bounds expansion) at the
                    // top level keep the surrounding ordering rules.
                    self.lower_top_block(stmt, scope, state)?;
                }
                NodeKind::VarDecl { name, .. } => {
                    if state.function_seen {
                        return Err(Error::new(loc, ErrorKind::VariableDeclsBeforeFunctions));
                    }
                    let name = name.clone();
                    let Some(info) = self.resolver.lookup(&name, scope.scope) else {
                        return Err(Error::new(loc, ErrorKind::MissingBinding { name }));
                    };
                    let (sym_ty, slot_type) = self.symbol_type(&info, loc)?;
                    self.builder
                        .set_slot_type(Slot(info.id.0), slot_type);
                    // Arrays and strings have observable construction; run
                    // it in the module constructor.
                    if sym_ty.as_array().is_some() || sym_ty.is_string() {
                        self.switch_to_constructor(state);
                        self.lower(stmt, scope)?;
                    }
                }
                NodeKind::Assign { name, value } => {
                    if state.function_seen {
                        return Err(Error::new(loc, ErrorKind::VariableDeclsBeforeFunctions));
                    }
                    let (name, value) = (name.clone(), *value);
                    let Some(info) = self.resolver.lookup(&name, scope.scope) else {
                        return Err(Error::new(
                            loc,
                            ErrorKind::UndefinedIdentifier { name },
                        ));
                    };
                    let slot = Slot(info.id.0);
                    match &self.ast.node(value).kind {
                        NodeKind::Number(Number::Int(v)) => {
                            let i64t = self.builder.types_mut().primitive(Kind::I64);
                            self.builder.module_mut().set_slot_value(slot, Imm::int(*v, i64t));
                        }
                        NodeKind::Number(Number::Float(v)) => {
                            let f64t = self.builder.types_mut().primitive(Kind::F64);
                            let bits = v.to_bits() as i64;
                            self.builder
                                .module_mut()
                                .set_slot_value(slot, Imm::int(bits, f64t));
                        }
                        NodeKind::StringLit { value: text } => {
                            let text = text.clone();
                            let pool_id = self.builder.intern_string(&text);
                            let string_ty = self.builder.types_mut().string();
                            self.builder
                                .module_mut()
                                .set_slot_value(slot, Imm::int(pool_id as i64, string_ty));
                            // String globals are pointers.
                            self.builder.set_slot_type(slot, string_ty);
                        }
                        _ => {}
                    }
                    self.switch_to_constructor(state);
                    self.lower(stmt, scope)?;
                }
                other => {
                    return Err(Error::new(
                        loc,
                        ErrorKind::UnexpectedTopLevelStatement {
                            what: other.variant().to_string(),
                        },
                    ));
                }
            }
        }
        Ok(())
    }
}

#[derive(Default)]
struct TopLevelState {
    function_seen: bool,
    constructor: Option<usize>,
}

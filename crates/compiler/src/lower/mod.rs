//! AST to IR lowering.
//!
//! The lowerer walks the annotated AST and drives the [`Builder`], emitting
//! three-address instructions for arithmetic, comparisons and control flow,
//! reference-count management for heap-owned strings, destructor calls at
//! scope exit, and the synthetic module constructor/destructor functions
//! for globals.
//!
//! Every lowering step returns a [`Value`]: the produced operand (if any),
//! the label of the block that actually produced it (control flow inside an
//! expression can move the cursor), and the heap-ownership of the result.

mod loops;
mod toplevel;

use crate::ast::{Ast, NodeId, NodeKind, Number};
use crate::error::{Error, ErrorKind, SourceLoc};
use crate::ir::{Builder, Imm, Label, Local, Operand, Slot, Tmp, TypeId};
use crate::op;
use crate::resolver::{RETURN_VAR, Resolver, ScopeId, SymbolInfo};
use crate::types::Type;

/// Heap-ownership of a lowered value; decides where retain/release calls
/// are emitted for reference-counted strings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Ownership {
    Unknown,
    /// The value holds its own reference; whoever consumes it releases it
    /// or transfers the reference.
    Owned,
    /// The value aliases storage owned elsewhere; storing it requires a
    /// retain.
    Borrowed,
}

/// Result of lowering one expression or statement.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Value {
    pub value: Option<Operand>,
    /// Block that produced `value` (the current block when there is none).
    pub label: Label,
    pub ownership: Ownership,
}

impl Value {
    fn none(label: Label) -> Self {
        Value {
            value: None,
            label,
            ownership: Ownership::Unknown,
        }
    }
}

/// The running scope descriptor threaded through the walk.
#[derive(Debug, Clone, Copy)]
pub(crate) struct BlockScope {
    pub func: Option<usize>,
    pub scope: ScopeId,
    pub break_label: Option<Label>,
    pub continue_label: Option<Label>,
}

impl BlockScope {
    fn with_loop(self, break_label: Label, continue_label: Label) -> Self {
        BlockScope {
            break_label: Some(break_label),
            continue_label: Some(continue_label),
            ..self
        }
    }
}

/// A pending scope-exit destructor: locations to load and pass, and the
/// runtime function to call.
#[derive(Debug, Clone)]
pub(crate) struct Destructor {
    pub args: Vec<Operand>,
    pub fn_sym: i64,
}

pub struct Lowerer<'a> {
    pub(crate) ast: &'a Ast,
    pub(crate) resolver: &'a Resolver,
    pub(crate) builder: &'a mut Builder,
    pub(crate) pending_destructors: Vec<Destructor>,
}

impl<'a> Lowerer<'a> {
    pub fn new(ast: &'a Ast, resolver: &'a Resolver, builder: &'a mut Builder) -> Self {
        Lowerer {
            ast,
            resolver,
            builder,
            pending_destructors: Vec::new(),
        }
    }

    /// Symbol id of a root-scope (runtime) function.
    pub(crate) fn runtime_symbol(&self, name: &str) -> Result<i64, Error> {
        self.resolver
            .lookup(name, ScopeId(0))
            .map(|info| info.id.0 as i64)
            .ok_or_else(|| {
                Error::bare(ErrorKind::UndefinedIdentifier {
                    name: name.to_string(),
                })
            })
    }

    fn node_type(&mut self, id: NodeId) -> Result<TypeId, Error> {
        let ty = self.ast.node(id).ty.clone().ok_or_else(|| {
            Error::new(
                self.ast.node(id).loc,
                ErrorKind::UntypedExpression {
                    what: self.ast.describe(id),
                },
            )
        })?;
        Ok(self.builder.types_mut().lower(&ty))
    }

    fn symbol_type(&mut self, info: &SymbolInfo, loc: SourceLoc) -> Result<(Type, TypeId), Error> {
        let node = self.resolver.symbol_node(info.id).ok_or_else(|| {
            Error::new(
                loc,
                ErrorKind::MissingBinding {
                    name: String::new(),
                },
            )
        })?;
        let ty = self.ast.node(node).ty.clone().ok_or_else(|| {
            Error::new(
                loc,
                ErrorKind::UntypedExpression {
                    what: self.ast.describe(node),
                },
            )
        })?;
        let lowered = self.builder.types_mut().lower(&ty);
        Ok((ty, lowered))
    }

    fn storage_operand(info: &SymbolInfo) -> Operand {
        match info.function_index {
            Some(idx) => Operand::Local(Local(idx)),
            None => Operand::Slot(Slot(info.id.0)),
        }
    }

    /// Emit `arg`s followed by a void call to a runtime function.
    pub(crate) fn emit_runtime_call(&mut self, fn_sym: i64, args: &[Operand]) {
        for a in args {
            self.builder.emit_void(op::ARG, &[*a]);
        }
        self.builder
            .emit_void(op::CALL, &[Operand::Imm(Imm::raw(fn_sym))]);
    }

    fn emit_retain(&mut self, value: Operand) -> Result<(), Error> {
        let retain = self.runtime_symbol("str_retain")?;
        self.emit_runtime_call(retain, &[value]);
        Ok(())
    }

    fn emit_release(&mut self, value: Operand) -> Result<(), Error> {
        let release = self.runtime_symbol("str_release")?;
        self.emit_runtime_call(release, &[value]);
        Ok(())
    }

    /// Promote a string-literal immediate to a String object. The result
    /// owns its reference.
    fn materialize_literal(&mut self, literal: Operand, ty: TypeId) -> Result<Operand, Error> {
        let ctor = self.runtime_symbol("str_from_lit")?;
        self.builder.emit_void(op::ARG, &[literal]);
        let tmp = self.builder.emit(op::CALL, &[Operand::Imm(Imm::raw(ctor))]);
        self.builder.set_tmp_type(tmp, ty);
        Ok(Operand::Tmp(tmp))
    }

    fn is_string_literal_imm(&mut self, operand: &Operand) -> bool {
        let string_ty = self.builder.types_mut().string();
        matches!(operand, Operand::Imm(imm) if imm.ty == Some(string_ty))
    }

    /// Load a variable (or take its address with `lea`). A variable that
    /// is itself a reference already stores an address, so `lea` degrades
    /// to a plain load for it.
    pub(crate) fn load_var(
        &mut self,
        name: &str,
        scope: &BlockScope,
        loc: SourceLoc,
        mut take_addr: bool,
    ) -> Result<Tmp, Error> {
        let Some(info) = self.resolver.lookup(name, scope.scope) else {
            return Err(Error::new(
                loc,
                ErrorKind::UndefinedIdentifier {
                    name: name.to_string(),
                },
            ));
        };
        let (ty, lowered) = self.symbol_type(&info, loc)?;
        if ty.is_reference() {
            take_addr = false;
        }
        let operand = Self::storage_operand(&info);
        let opcode = if take_addr { op::LEA } else { op::LOAD };
        let tmp = self.builder.emit(opcode, &[operand]);
        self.builder.set_tmp_type(tmp, lowered);
        Ok(tmp)
    }

    /// Flatten a multi-dimensional index list into a byte offset using the
    /// hidden bound/stride variables:
    /// `offset = (sum_i (index_i - lbound_i) * stride_i) * 8`, with
    /// `stride_i = mulacc_{i+1}` and the innermost stride 1.
    pub(crate) fn lower_indices(
        &mut self,
        name: &str,
        indices: &[NodeId],
        scope: &BlockScope,
    ) -> Result<Value, Error> {
        if indices.is_empty() {
            return Err(Error::bare(ErrorKind::CannotLowerArrayIndices {
                name: name.to_string(),
            }));
        }
        let i64t = self.builder.types_mut().primitive(crate::ir::Kind::I64);
        let last = indices.len() - 1;
        let mut acc: Option<Tmp> = None;
        for i in (0..indices.len()).rev() {
            let loc = self.ast.node(indices[i]).loc;
            let index = self.lower(indices[i], scope)?;
            let Some(index_val) = index.value else {
                return Err(Error::new(
                    loc,
                    ErrorKind::CannotLowerArrayIndices {
                        name: name.to_string(),
                    },
                ));
            };
            let lbound = self.load_var(&format!("$${}_lbound{}", name, i), scope, loc, false)?;
            let mut tmp = self
                .builder
                .emit(op::SUB, &[index_val, Operand::Tmp(lbound)]);
            self.builder.set_tmp_type(tmp, i64t);
            if i != last {
                let stride =
                    self.load_var(&format!("$${}_mulacc{}", name, i + 1), scope, loc, false)?;
                tmp = self
                    .builder
                    .emit(op::MUL, &[Operand::Tmp(tmp), Operand::Tmp(stride)]);
                self.builder.set_tmp_type(tmp, i64t);
            }
            if let Some(prev) = acc {
                tmp = self
                    .builder
                    .emit(op::ADD, &[Operand::Tmp(tmp), Operand::Tmp(prev)]);
                self.builder.set_tmp_type(tmp, i64t);
            }
            acc = Some(tmp);
        }
        let total = acc.ok_or_else(|| {
            Error::bare(ErrorKind::CannotLowerArrayIndices {
                name: name.to_string(),
            })
        })?;
        let bytes = self
            .builder
            .emit(op::MUL, &[Operand::Tmp(total), Builder::imm(8, i64t)]);
        self.builder.set_tmp_type(bytes, i64t);
        Ok(Value {
            value: Some(Operand::Tmp(bytes)),
            label: self.builder.current_block_label(),
            ownership: Ownership::Unknown,
        })
    }

    pub(crate) fn lower(&mut self, id: NodeId, scope: &BlockScope) -> Result<Value, Error> {
        let loc = self.ast.node(id).loc;
        match &self.ast.node(id).kind {
            NodeKind::Number(n) => {
                let operand = match *n {
                    Number::Int(v) => {
                        let i64t = self.builder.types_mut().primitive(crate::ir::Kind::I64);
                        Builder::imm(v, i64t)
                    }
                    Number::Float(v) => {
                        let f64t = self.builder.types_mut().primitive(crate::ir::Kind::F64);
                        Builder::imm(v.to_bits() as i64, f64t)
                    }
                };
                Ok(Value {
                    value: Some(operand),
                    label: self.builder.current_block_label(),
                    ownership: Ownership::Unknown,
                })
            }
            NodeKind::StringLit { value } => {
                let value = value.clone();
                let pool_id = self.builder.intern_string(&value);
                let string_ty = self.builder.types_mut().string();
                Ok(Value {
                    value: Some(Builder::imm(pool_id as i64, string_ty)),
                    label: self.builder.current_block_label(),
                    ownership: Ownership::Unknown,
                })
            }
            NodeKind::Cast { operand, .. } => self.lower_cast(id, *operand, scope),
            NodeKind::Block { .. } => self.lower_block(id, scope),
            NodeKind::Unary { op: un_op, operand } => {
                let (un_op, operand) = (*un_op, *operand);
                let value = self.lower(operand, scope)?;
                let Some(v) = value.value else {
                    return Err(Error::new(
                        self.ast.node(operand).loc,
                        ErrorKind::UntypedExpression {
                            what: self.ast.describe(operand),
                        },
                    ));
                };
                let opcode = if un_op == op::SUB { op::NEG } else { un_op };
                let ty = self.node_type(id)?;
                let tmp = self.builder.emit(opcode, &[v]);
                self.builder.set_tmp_type(tmp, ty);
                Ok(Value {
                    value: Some(Operand::Tmp(tmp)),
                    label: self.builder.current_block_label(),
                    ownership: Ownership::Unknown,
                })
            }
            NodeKind::Binary { .. } => self.lower_binary(id, scope),
            NodeKind::If { .. } => self.lower_if(id, scope),
            NodeKind::Loop { .. } => self.lower_loop(id, scope),
            NodeKind::Break => match scope.break_label {
                Some(label) => {
                    self.builder.emit_void(op::JMP, &[Operand::Label(label)]);
                    Ok(Value::none(self.builder.current_block_label()))
                }
                None => Err(Error::new(loc, ErrorKind::BreakNotInLoop)),
            },
            NodeKind::Continue => match scope.continue_label {
                Some(label) => {
                    self.builder.emit_void(op::JMP, &[Operand::Label(label)]);
                    Ok(Value::none(self.builder.current_block_label()))
                }
                None => Err(Error::new(loc, ErrorKind::ContinueNotInLoop)),
            },
            NodeKind::Ident { name } => {
                let name = name.clone();
                let tmp = self.load_var(&name, scope, loc, false)?;
                let info = self.resolver.lookup(&name, scope.scope).ok_or_else(|| {
                    Error::new(loc, ErrorKind::UndefinedIdentifier { name: name.clone() })
                })?;
                let (ty, _) = self.symbol_type(&info, loc)?;
                let tmp = if let crate::types::TypeKind::Reference(referenced) = &ty.kind {
                    let referenced = referenced.as_ref().clone();
                    let lowered = self.builder.types_mut().lower(&referenced);
                    let deref = self.builder.emit(op::LDE, &[Operand::Tmp(tmp)]);
                    self.builder.set_tmp_type(deref, lowered);
                    deref
                } else {
                    tmp
                };
                Ok(Value {
                    value: Some(Operand::Tmp(tmp)),
                    label: self.builder.current_block_label(),
                    ownership: Ownership::Borrowed,
                })
            }
            NodeKind::Assign { .. } => self.lower_assign(id, scope),
            NodeKind::ArrayAssign { .. } => self.lower_array_assign(id, scope),
            NodeKind::Index { .. } => self.lower_index(id, scope),
            NodeKind::MultiIndex { .. } => self.lower_multi_index(id, scope),
            NodeKind::VarDecl { .. } => self.lower_var_decl(id, scope),
            NodeKind::FunDecl(_) => self.lower_fun_decl(id, scope),
            NodeKind::Call { .. } => self.lower_call(id, scope),
            other => Err(Error::new(
                loc,
                ErrorKind::NotImplemented {
                    what: other.variant().to_string(),
                },
            )),
        }
    }

    fn lower_cast(&mut self, id: NodeId, operand: NodeId, scope: &BlockScope) -> Result<Value, Error> {
        let loc = self.ast.node(id).loc;
        let value = self.lower(operand, scope)?;
        let Some(v) = value.value else {
            return Err(Error::new(
                self.ast.node(operand).loc,
                ErrorKind::UntypedExpression {
                    what: self.ast.describe(operand),
                },
            ));
        };
        let to = self.ast.node(id).ty.clone().ok_or_else(|| {
            Error::new(
                loc,
                ErrorKind::UntypedExpression {
                    what: self.ast.describe(id),
                },
            )
        })?;
        let from = self.ast.node(operand).ty.clone().ok_or_else(|| {
            Error::new(
                loc,
                ErrorKind::UntypedExpression {
                    what: self.ast.describe(operand),
                },
            )
        })?;
        let from = from.unwrap_ref().clone();
        let opcode = if to.is_int() && from.is_float() {
            op::F2I
        } else if to.is_float() && from.is_int() {
            op::I2F
        } else if to.is_bool() && from.is_int() {
            op::I2B
        } else if to.is_bool() && from.is_float() {
            op::F2B
        } else if (to.is_symbol() && from.is_int()) || (to.is_int() && from.is_symbol()) {
            op::MOV
        } else {
            return Err(Error::new(
                loc,
                ErrorKind::MismatchedTypes {
                    from: from.to_string(),
                    to: to.to_string(),
                },
            ));
        };
        let lowered = self.node_type(id)?;
        let tmp = self.builder.emit(opcode, &[v]);
        self.builder.set_tmp_type(tmp, lowered);
        Ok(Value {
            value: Some(Operand::Tmp(tmp)),
            label: self.builder.current_block_label(),
            ownership: Ownership::Unknown,
        })
    }

    fn lower_block(&mut self, id: NodeId, scope: &BlockScope) -> Result<Value, Error> {
        let (stmts, block_scope, skip_destructors) = match &self.ast.node(id).kind {
            NodeKind::Block {
                stmts,
                scope: s,
                skip_destructors,
            } => (stmts.clone(), *s, *skip_destructors),
            _ => unreachable!("lower_block on non-block"),
        };
        let inner = BlockScope {
            scope: block_scope.unwrap_or(scope.scope),
            ..*scope
        };
        let watermark = self.pending_destructors.len();
        let mut last = None;
        for stmt in stmts {
            let value = self.lower(stmt, &inner)?;
            last = value.value;
            // A statement whose owned result is discarded releases it here.
            if value.ownership == Ownership::Owned {
                if let Some(v) = value.value {
                    self.emit_release(v)?;
                }
            }
            if self.builder.is_terminated() {
                break;
            }
        }
        // Destructors run in LIFO order at scope exit. A transient block
        // (skip_destructors) leaves its registrations to the enclosing
        // scope instead.
        if !skip_destructors && self.pending_destructors.len() > watermark {
            let dtors: Vec<Destructor> = self.pending_destructors.split_off(watermark);
            for dtor in dtors.iter().rev() {
                self.emit_destructor(dtor)?;
            }
        }
        Ok(Value {
            value: last,
            label: self.builder.current_block_label(),
            ownership: Ownership::Unknown,
        })
    }

    /// Load each destructor argument location and emit the call. Skipped
    /// when the current block is already terminated (a `break` or `ret`
    /// left the scope through its target's own destructors).
    pub(crate) fn emit_destructor(&mut self, dtor: &Destructor) -> Result<(), Error> {
        if self.builder.is_terminated() {
            return Ok(());
        }
        let mut loaded = Vec::with_capacity(dtor.args.len());
        for arg in &dtor.args {
            match arg {
                Operand::Local(l) => {
                    let ty = self.builder.module().functions
                        [self.builder.current_function_index()]
                    .local_type(*l);
                    let tmp = self.builder.emit(op::LOAD, &[*arg]);
                    if let Some(ty) = ty {
                        self.builder.set_tmp_type(tmp, ty);
                    }
                    loaded.push(Operand::Tmp(tmp));
                }
                Operand::Slot(s) => {
                    let ty = self.builder.module().slot_type(*s);
                    let tmp = self.builder.emit(op::LOAD, &[*arg]);
                    if let Some(ty) = ty {
                        self.builder.set_tmp_type(tmp, ty);
                    }
                    loaded.push(Operand::Tmp(tmp));
                }
                other => loaded.push(*other),
            }
        }
        for arg in &loaded {
            self.builder.emit_void(op::ARG, &[*arg]);
        }
        self.builder
            .emit_void(op::CALL, &[Operand::Imm(Imm::raw(dtor.fn_sym))]);
        Ok(())
    }

    fn lower_binary(&mut self, id: NodeId, scope: &BlockScope) -> Result<Value, Error> {
        let (bin_op, lhs, rhs) = match &self.ast.node(id).kind {
            NodeKind::Binary { op, lhs, rhs } => (*op, *lhs, *rhs),
            _ => unreachable!(),
        };
        let loc = self.ast.node(id).loc;
        if bin_op == op::AND || bin_op == op::OR {
            return self.lower_short_circuit(id, bin_op, lhs, rhs, scope);
        }
        let left = self.lower(lhs, scope)?;
        let right = self.lower(rhs, scope)?;
        let (Some(l), Some(r)) = (left.value, right.value) else {
            return Err(Error::new(
                loc,
                ErrorKind::UntypedExpression {
                    what: self.ast.describe(id),
                },
            ));
        };
        let ty = self.node_type(id)?;
        let tmp = self.builder.emit(bin_op, &[l, r]);
        self.builder.set_tmp_type(tmp, ty);
        Ok(Value {
            value: Some(Operand::Tmp(tmp)),
            label: self.builder.current_block_label(),
            ownership: Ownership::Unknown,
        })
    }

    /// Short-circuit `&&`/`||`: a predicate block, an RHS block, and a
    /// merge block whose φ selects the left value on the short-circuit
    /// edge and the right value on the fall-through edge. The φ records the
    /// labels of the blocks that actually produced each value.
    fn lower_short_circuit(
        &mut self,
        id: NodeId,
        bin_op: crate::op::Op,
        lhs: NodeId,
        rhs: NodeId,
        scope: &BlockScope,
    ) -> Result<Value, Error> {
        let loc = self.ast.node(id).loc;
        let left = self.lower(lhs, scope)?;
        let Some(l) = left.value else {
            return Err(Error::new(
                loc,
                ErrorKind::UntypedExpression {
                    what: self.ast.describe(lhs),
                },
            ));
        };
        let (rhs_label, rhs_idx) = self.builder.new_block();
        let end = self.builder.new_label();

        // Branch on the left value from the block that produced it.
        self.builder.select_block_label(left.label);
        if bin_op == op::AND {
            self.builder.emit_void(
                op::CMP,
                &[l, Operand::Label(rhs_label), Operand::Label(end)],
            );
        } else {
            self.builder.emit_void(
                op::CMP,
                &[l, Operand::Label(end), Operand::Label(rhs_label)],
            );
        }
        let left_edge = self.builder.current_block_label();

        self.builder.select_block(rhs_idx);
        let right = self.lower(rhs, scope)?;
        let Some(r) = right.value else {
            return Err(Error::new(
                loc,
                ErrorKind::UntypedExpression {
                    what: self.ast.describe(rhs),
                },
            ));
        };
        self.builder.emit_void(op::JMP, &[Operand::Label(end)]);
        let right_edge = self.builder.current_block_label();

        self.builder.new_block_with(end);
        let result = self.builder.emit(
            op::PHI,
            &[
                l,
                Operand::Label(left_edge),
                r,
                Operand::Label(right_edge),
            ],
        );
        let ty = self.node_type(id)?;
        self.builder.set_tmp_type(result, ty);
        if let Some(lt) = l.as_tmp() {
            self.builder.unify_tmp_types(result, lt);
        }
        if let Some(rt) = r.as_tmp() {
            self.builder.unify_tmp_types(result, rt);
        }
        Ok(Value {
            value: Some(Operand::Tmp(result)),
            label: self.builder.current_block_label(),
            ownership: Ownership::Unknown,
        })
    }

    /// `If` is a statement: then/else blocks plus a merge block, no φ.
    fn lower_if(&mut self, id: NodeId, scope: &BlockScope) -> Result<Value, Error> {
        let (cond, then_branch, else_branch) = match &self.ast.node(id).kind {
            NodeKind::If {
                cond,
                then_branch,
                else_branch,
            } => (*cond, *then_branch, *else_branch),
            _ => unreachable!(),
        };
        let cond_value = self.lower(cond, scope)?;
        let Some(c) = cond_value.value else {
            return Err(Error::new(
                self.ast.node(cond).loc,
                ErrorKind::UntypedExpression {
                    what: self.ast.describe(cond),
                },
            ));
        };
        let entry = self.builder.current_block_index();
        let (then_label, then_idx) = self.builder.new_block();
        let (else_label, else_idx) = self.builder.new_block();
        let end = self.builder.new_label();

        self.builder.select_block(entry);
        self.builder.emit_void(
            op::CMP,
            &[c, Operand::Label(then_label), Operand::Label(else_label)],
        );

        self.builder.select_block(then_idx);
        self.lower(then_branch, scope)?;
        if !self.builder.is_terminated() {
            self.builder.emit_void(op::JMP, &[Operand::Label(end)]);
        }

        self.builder.select_block(else_idx);
        if let Some(else_branch) = else_branch {
            self.lower(else_branch, scope)?;
        }
        if !self.builder.is_terminated() {
            self.builder.emit_void(op::JMP, &[Operand::Label(end)]);
        }

        self.builder.new_block_with(end);
        Ok(Value::none(self.builder.current_block_label()))
    }

    fn lower_assign(&mut self, id: NodeId, scope: &BlockScope) -> Result<Value, Error> {
        let (name, value_id) = match &self.ast.node(id).kind {
            NodeKind::Assign { name, value } => (name.clone(), *value),
            _ => unreachable!(),
        };
        let loc = self.ast.node(id).loc;
        let mut rhs = self.lower(value_id, scope)?;
        let Some(mut rhs_value) = rhs.value else {
            return Err(Error::new(
                self.ast.node(value_id).loc,
                ErrorKind::UntypedExpression {
                    what: self.ast.describe(value_id),
                },
            ));
        };
        let Some(info) = self.resolver.lookup(&name, scope.scope) else {
            return Err(Error::new(loc, ErrorKind::UndefinedIdentifier { name }));
        };
        let (sym_ty, slot_type) = self.symbol_type(&info, loc)?;
        let storage = Self::storage_operand(&info);
        if let Operand::Local(l) = storage {
            self.builder.set_local_type(l, slot_type);
        }

        // A string-literal RHS becomes an owned String object first.
        if self.is_string_literal_imm(&rhs_value) && sym_ty.unwrap_ref().is_string() {
            rhs_value = self.materialize_literal(rhs_value, slot_type)?;
            rhs.ownership = Ownership::Owned;
        }

        let target_is_string = sym_ty.unwrap_ref().is_string();
        if target_is_string && rhs.ownership == Ownership::Borrowed {
            // Retain before touching the destination, so `s := s` is safe.
            self.emit_retain(rhs_value)?;
        }

        if let crate::types::TypeKind::Reference(referenced) = &sym_ty.kind {
            let referenced = referenced.as_ref().clone();
            let addr = self.builder.emit(op::LOAD, &[storage]);
            self.builder.set_tmp_type(addr, slot_type);
            if referenced.is_string() {
                // The destination takes its own reference regardless of RHS
                // ownership; a later release of an owned temporary must not
                // drop the stored value.
                if rhs.ownership != Ownership::Borrowed {
                    self.emit_retain(rhs_value)?;
                }
                let ref_ty = self.builder.types_mut().lower(&referenced);
                let prev = self.builder.emit(op::LDE, &[Operand::Tmp(addr)]);
                self.builder.set_tmp_type(prev, ref_ty);
                self.emit_release(Operand::Tmp(prev))?;
            }
            self.builder
                .emit_void(op::STE, &[Operand::Tmp(addr), rhs_value]);
        } else {
            if target_is_string {
                // Release the previous value before overwriting it.
                let prev = self.builder.emit(op::LOAD, &[storage]);
                self.builder.set_tmp_type(prev, slot_type);
                self.emit_release(Operand::Tmp(prev))?;
            }
            self.builder.emit_void(op::STRE, &[storage, rhs_value]);
        }
        Ok(Value::none(self.builder.current_block_label()))
    }

    fn lower_array_assign(&mut self, id: NodeId, scope: &BlockScope) -> Result<Value, Error> {
        let (name, indices, value_id) = match &self.ast.node(id).kind {
            NodeKind::ArrayAssign {
                name,
                indices,
                value,
            } => (name.clone(), indices.clone(), *value),
            _ => unreachable!(),
        };
        let loc = self.ast.node(id).loc;
        let index_value = self.lower_indices(&name, &indices, scope)?;
        let Some(total_index) = index_value.value else {
            return Err(Error::new(
                loc,
                ErrorKind::CannotLowerArrayIndices { name },
            ));
        };
        let array_ptr = self.load_var(&name, scope, loc, false)?;
        let array_ty = self.builder.tmp_type(array_ptr).ok_or_else(|| {
            Error::new(loc, ErrorKind::MissingBinding { name: name.clone() })
        })?;
        let dest = self
            .builder
            .emit(op::ADD, &[Operand::Tmp(array_ptr), total_index]);
        self.builder.set_tmp_type(dest, array_ty);

        let mut rhs = self.lower(value_id, scope)?;
        let Some(mut rhs_value) = rhs.value else {
            return Err(Error::new(
                self.ast.node(value_id).loc,
                ErrorKind::UntypedExpression {
                    what: self.ast.describe(value_id),
                },
            ));
        };
        let elem_ty = self.builder.module().types.underlying(array_ty);
        let string_ty = self.builder.types_mut().string();
        let elem_is_string = elem_ty == Some(string_ty);

        if self.is_string_literal_imm(&rhs_value) && elem_is_string {
            rhs_value = self.materialize_literal(rhs_value, string_ty)?;
            rhs.ownership = Ownership::Owned;
        }
        if elem_is_string && rhs.ownership == Ownership::Borrowed {
            self.emit_retain(rhs_value)?;
        }
        if elem_is_string {
            let prev = self.builder.emit(op::LDE, &[Operand::Tmp(dest)]);
            self.builder.set_tmp_type(prev, string_ty);
            self.emit_release(Operand::Tmp(prev))?;
        }
        self.builder
            .emit_void(op::STE, &[Operand::Tmp(dest), rhs_value]);
        Ok(Value::none(self.builder.current_block_label()))
    }

    fn lower_index(&mut self, id: NodeId, scope: &BlockScope) -> Result<Value, Error> {
        let (collection, index) = match &self.ast.node(id).kind {
            NodeKind::Index { collection, index } => (*collection, *index),
            _ => unreachable!(),
        };
        let loc = self.ast.node(id).loc;
        let name = match &self.ast.node(collection).kind {
            NodeKind::Ident { name } => name.clone(),
            _ => {
                return Err(Error::new(
                    self.ast.node(collection).loc,
                    ErrorKind::CannotLowerArrayIndices {
                        name: self.ast.describe(collection),
                    },
                ));
            }
        };
        let index_value = self.lower(index, scope)?;
        let Some(index_val) = index_value.value else {
            return Err(Error::new(
                self.ast.node(index).loc,
                ErrorKind::CannotLowerArrayIndices { name },
            ));
        };
        let collection_value = self.lower(collection, scope)?;
        let Some(Operand::Tmp(array_ptr)) = collection_value.value else {
            return Err(Error::new(
                self.ast.node(collection).loc,
                ErrorKind::CannotLowerArrayIndices { name },
            ));
        };

        let i64t = self.builder.types_mut().primitive(crate::ir::Kind::I64);
        let lbound = self.load_var(&format!("$${}_lbound0", name), scope, loc, false)?;
        let zero_based = self
            .builder
            .emit(op::SUB, &[index_val, Operand::Tmp(lbound)]);
        self.builder.set_tmp_type(zero_based, i64t);
        let offset = self
            .builder
            .emit(op::MUL, &[Operand::Tmp(zero_based), Builder::imm(8, i64t)]);
        self.builder.set_tmp_type(offset, i64t);
        let array_ty = self.builder.tmp_type(array_ptr).ok_or_else(|| {
            Error::new(loc, ErrorKind::MissingBinding { name: name.clone() })
        })?;
        let dest = self
            .builder
            .emit(op::ADD, &[Operand::Tmp(array_ptr), Operand::Tmp(offset)]);
        self.builder.set_tmp_type(dest, array_ty);
        let loaded = self.builder.emit(op::LDE, &[Operand::Tmp(dest)]);
        let result_ty = self.node_type(id)?;
        self.builder.set_tmp_type(loaded, result_ty);
        Ok(Value {
            value: Some(Operand::Tmp(loaded)),
            label: self.builder.current_block_label(),
            ownership: Ownership::Borrowed,
        })
    }

    fn lower_multi_index(&mut self, id: NodeId, scope: &BlockScope) -> Result<Value, Error> {
        let (collection, indices) = match &self.ast.node(id).kind {
            NodeKind::MultiIndex {
                collection,
                indices,
            } => (*collection, indices.clone()),
            _ => unreachable!(),
        };
        let loc = self.ast.node(id).loc;
        let name = match &self.ast.node(collection).kind {
            NodeKind::Ident { name } => name.clone(),
            _ => {
                return Err(Error::new(
                    self.ast.node(collection).loc,
                    ErrorKind::ReferenceRequiresIdentifier,
                ));
            }
        };
        let index_value = self.lower_indices(&name, &indices, scope)?;
        let Some(total_index) = index_value.value else {
            return Err(Error::new(loc, ErrorKind::CannotLowerArrayIndices { name }));
        };
        let collection_value = self.lower(collection, scope)?;
        let Some(Operand::Tmp(array_ptr)) = collection_value.value else {
            return Err(Error::new(
                self.ast.node(collection).loc,
                ErrorKind::CannotLowerArrayIndices { name },
            ));
        };
        let array_ty = self.builder.tmp_type(array_ptr).ok_or_else(|| {
            Error::new(loc, ErrorKind::MissingBinding { name: name.clone() })
        })?;
        let dest = self
            .builder
            .emit(op::ADD, &[Operand::Tmp(array_ptr), total_index]);
        self.builder.set_tmp_type(dest, array_ty);
        let loaded = self.builder.emit(op::LDE, &[Operand::Tmp(dest)]);
        let result_ty = self.node_type(id)?;
        self.builder.set_tmp_type(loaded, result_ty);
        Ok(Value {
            value: Some(Operand::Tmp(loaded)),
            label: self.builder.current_block_label(),
            ownership: Ownership::Borrowed,
        })
    }

    fn lower_var_decl(&mut self, id: NodeId, scope: &BlockScope) -> Result<Value, Error> {
        let (name, declared) = match &self.ast.node(id).kind {
            NodeKind::VarDecl { name, declared, .. } => (name.clone(), declared.clone()),
            _ => unreachable!(),
        };
        let loc = self.ast.node(id).loc;
        let Some(info) = self.resolver.lookup(&name, scope.scope) else {
            return Err(Error::new(loc, ErrorKind::MissingBinding { name }));
        };
        let lowered = self.builder.types_mut().lower(&declared);
        if let Some(idx) = info.function_index {
            self.builder.set_local_type(Local(idx), lowered);
        }

        if declared.is_string() && name != RETURN_VAR {
            // The return local is owned by the caller.
            let release = self.runtime_symbol("str_release")?;
            self.pending_destructors.push(Destructor {
                args: vec![Self::storage_operand(&info)],
                fn_sym: release,
            });
        }

        if declared.as_array().is_some() {
            let ctor = self.runtime_symbol("array_create")?;
            let count_name = format!("$${}_mulacc0", name);
            let Some(count_info) = self.resolver.lookup(&count_name, scope.scope) else {
                return Err(Error::new(
                    loc,
                    ErrorKind::MissingBinding { name: count_name },
                ));
            };
            let count_op = Self::storage_operand(&count_info);
            let i64t = self.builder.types_mut().primitive(crate::ir::Kind::I64);
            let count = self.builder.emit(op::LOAD, &[count_op]);
            self.builder.set_tmp_type(count, i64t);
            let size = self
                .builder
                .emit(op::MUL, &[Operand::Tmp(count), Builder::imm(8, i64t)]);
            self.builder.set_tmp_type(size, i64t);
            self.builder.emit_void(op::ARG, &[Operand::Tmp(size)]);
            let array_ptr = self.builder.emit(op::CALL, &[Operand::Imm(Imm::raw(ctor))]);
            self.builder.set_tmp_type(array_ptr, lowered);

            let string_ty = self.builder.types_mut().string();
            let elem_is_string = self.builder.module().types.underlying(lowered) == Some(string_ty);
            let storage = Self::storage_operand(&info);
            self.builder
                .emit_void(op::STRE, &[storage, Operand::Tmp(array_ptr)]);
            let (dtor_name, dtor_args) = if elem_is_string {
                // Element-aware destroy needs the element count.
                ("array_str_destroy", vec![storage, count_op])
            } else {
                ("array_destroy", vec![storage])
            };
            let dtor = self.runtime_symbol(dtor_name)?;
            self.pending_destructors.push(Destructor {
                args: dtor_args,
                fn_sym: dtor,
            });
        }
        Ok(Value::none(self.builder.current_block_label()))
    }

    fn lower_fun_decl(&mut self, id: NodeId, scope: &BlockScope) -> Result<Value, Error> {
        let decl = match &self.ast.node(id).kind {
            NodeKind::FunDecl(decl) => decl.clone(),
            _ => unreachable!(),
        };
        let loc = self.ast.node(id).loc;
        if decl.body.is_none() {
            // Externals are imported separately.
            return Ok(Value::none(self.builder.current_block_label()));
        }
        if scope.func.is_some() {
            return Err(Error::new(loc, ErrorKind::NestedFunctionsNotSupported));
        }
        let Some(info) = self.resolver.lookup(&decl.name, scope.scope) else {
            return Err(Error::new(
                loc,
                ErrorKind::MissingBinding { name: decl.name },
            ));
        };
        let Some(fun_scope) = decl.scope else {
            return Err(Error::new(
                loc,
                ErrorKind::MissingBinding { name: decl.name },
            ));
        };
        let fun_ty = self.ast.node(id).ty.clone().ok_or_else(|| {
            Error::new(
                loc,
                ErrorKind::UntypedExpression {
                    what: decl.name.clone(),
                },
            )
        })?;
        let Some((param_types, _)) = fun_ty.as_function() else {
            return Err(Error::new(
                loc,
                ErrorKind::NotAFunction { name: decl.name },
            ));
        };
        let param_types = param_types.to_vec();

        let mut args = Vec::with_capacity(decl.params.len());
        for param in &decl.params {
            let pname = match &self.ast.node(*param).kind {
                NodeKind::VarDecl { name, .. } => name.clone(),
                _ => continue,
            };
            let Some(pinfo) = self.resolver.lookup(&pname, fun_scope) else {
                return Err(Error::new(
                    self.ast.node(*param).loc,
                    ErrorKind::MissingBinding { name: pname },
                ));
            };
            let Some(idx) = pinfo.function_index else {
                return Err(Error::new(
                    self.ast.node(*param).loc,
                    ErrorKind::MissingBinding { name: pname },
                ));
            };
            args.push(Local(idx));
        }

        let func_idx = self
            .builder
            .new_function(&decl.name, args.clone(), Some(info.id));
        let ret_ty = self.builder.types_mut().lower(&decl.ret);
        self.builder.set_return_type(ret_ty);
        for (local, pty) in args.iter().zip(&param_types) {
            let lowered = self.builder.types_mut().lower(pty);
            self.builder.set_local_type(*local, lowered);
        }

        // A dedicated final block receives early exits and the single ret.
        let end = self.builder.new_label();
        let body_scope = BlockScope {
            func: Some(func_idx),
            scope: fun_scope,
            break_label: Some(end),
            continue_label: None,
        };
        let body = decl.body.ok_or_else(|| {
            Error::new(
                loc,
                ErrorKind::MissingBinding {
                    name: self.ast.describe(id),
                },
            )
        })?;
        self.lower(body, &body_scope)?;
        if !self.builder.is_terminated() {
            self.builder.emit_void(op::JMP, &[Operand::Label(end)]);
        }
        self.builder.new_block_with(end);
        if !decl.ret.is_void() {
            let ret_var = self.load_var(RETURN_VAR, &body_scope, loc, false)?;
            self.builder.emit_void(op::RET, &[Operand::Tmp(ret_var)]);
        } else {
            self.builder.emit_void(op::RET, &[]);
        }
        Ok(Value::none(self.builder.current_block_label()))
    }

    fn lower_call(&mut self, id: NodeId, scope: &BlockScope) -> Result<Value, Error> {
        let (callee, arg_ids) = match &self.ast.node(id).kind {
            NodeKind::Call { callee, args } => (*callee, args.clone()),
            _ => unreachable!(),
        };
        let loc = self.ast.node(id).loc;
        let callee_name = match &self.ast.node(callee).kind {
            NodeKind::Ident { name } => name.clone(),
            _ => {
                return Err(Error::new(
                    self.ast.node(callee).loc,
                    ErrorKind::FunctionCallNonIdentifier,
                ));
            }
        };
        let Some(info) = self.resolver.lookup(&callee_name, scope.scope) else {
            return Err(Error::new(
                loc,
                ErrorKind::UndefinedIdentifier { name: callee_name },
            ));
        };
        let callee_sym = info.id;
        let decl_node = self.resolver.symbol_node(callee_sym).ok_or_else(|| {
            Error::new(loc, ErrorKind::MissingBinding { name: callee_name.clone() })
        })?;
        let decl = match &self.ast.node(decl_node).kind {
            NodeKind::FunDecl(decl) => decl.clone(),
            _ => {
                return Err(Error::new(
                    loc,
                    ErrorKind::NotAFunction { name: callee_name },
                ));
            }
        };
        let param_types: Vec<Type> = match self.ast.node(decl_node).ty.as_ref() {
            Some(t) => match t.as_function() {
                Some((params, _)) => params.to_vec(),
                None => Vec::new(),
            },
            None => Vec::new(),
        };
        let is_internal = decl.body.is_some();

        let mut argv: Vec<(Operand, Ownership)> = Vec::with_capacity(arg_ids.len());
        for (i, arg) in arg_ids.iter().enumerate() {
            let param_ty = param_types.get(i);
            let arg_loc = self.ast.node(*arg).loc;
            let mut value = if param_ty.is_some_and(Type::is_reference) {
                // By-reference argument: must be an identifier; pass its
                // address.
                let NodeKind::Ident { name } = &self.ast.node(*arg).kind else {
                    return Err(Error::new(arg_loc, ErrorKind::ArgRefMustBeIdentifier));
                };
                let name = name.clone();
                let tmp = self.load_var(&name, scope, arg_loc, true)?;
                if let Some(pty) = param_ty {
                    let lowered = self.builder.types_mut().lower(pty);
                    self.builder.set_tmp_type(tmp, lowered);
                }
                Value {
                    value: Some(Operand::Tmp(tmp)),
                    label: self.builder.current_block_label(),
                    ownership: Ownership::Unknown,
                }
            } else {
                self.lower(*arg, scope)?
            };
            let Some(mut operand) = value.value else {
                return Err(Error::new(
                    arg_loc,
                    ErrorKind::UntypedExpression {
                        what: self.ast.describe(*arg),
                    },
                ));
            };
            // String-literal arguments are promoted to String objects for
            // internal callees, and for externals that require it.
            if self.is_string_literal_imm(&operand)
                && (is_internal || decl.requires_materialization)
                && param_ty.is_some_and(|t| t.unwrap_ref().is_string())
            {
                let string_ty = self.builder.types_mut().string();
                operand = self.materialize_literal(operand, string_ty)?;
                value.ownership = Ownership::Owned;
            }
            argv.push((operand, value.ownership));
        }

        for (operand, _) in &argv {
            self.builder.emit_void(op::ARG, &[*operand]);
        }
        let callee_imm = Operand::Imm(Imm::raw(callee_sym.0 as i64));
        let result = if decl.ret.is_void() {
            self.builder.emit_void(op::CALL, &[callee_imm]);
            None
        } else {
            let tmp = self.builder.emit(op::CALL, &[callee_imm]);
            let lowered = self.builder.types_mut().lower(&decl.ret);
            self.builder.set_tmp_type(tmp, lowered);
            Some(Operand::Tmp(tmp))
        };

        // Owned argument temporaries die with the call, last argument
        // first.
        for (operand, ownership) in argv.iter().rev() {
            if *ownership == Ownership::Owned {
                self.emit_release(*operand)?;
            }
        }

        let ownership = if decl.ret.is_string() {
            Ownership::Owned
        } else {
            Ownership::Unknown
        };
        Ok(Value {
            value: result,
            label: self.builder.current_block_label(),
            ownership,
        })
    }
}

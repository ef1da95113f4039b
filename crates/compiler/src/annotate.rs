//! Type annotation.
//!
//! A single top-down walk assigns a type to every expression, inserting
//! implicit-cast wrappers where the conversion rules permit and reporting
//! localized diagnostics otherwise. Number literals constant-fold under an
//! implicit cast instead of growing a wrapper node.
//!
//! The walk runs after name resolution; identifier types come from the
//! declaring node of the bound symbol.

use crate::ast::{Ast, NodeId, NodeKind, Number};
use crate::error::{Error, ErrorKind};
use crate::op;
use crate::resolver::{Resolver, ScopeId};
use crate::types::{Type, common_numeric};

pub struct Annotator<'a> {
    resolver: &'a Resolver,
}

impl<'a> Annotator<'a> {
    pub fn new(resolver: &'a Resolver) -> Self {
        Annotator { resolver }
    }

    /// Annotate the whole tree. The top-level block aggregates its
    /// children's errors instead of stopping at the first one.
    pub fn annotate(&self, ast: &mut Ast, root: NodeId) -> Result<NodeId, Error> {
        if let NodeKind::Block { .. } = &ast.node(root).kind {
            return self.annotate_block(ast, root, true);
        }
        self.annotate_node(ast, root, ScopeId(0))
    }

    fn mismatch(ast: &Ast, id: NodeId, from: &Type, to: &str) -> Error {
        Error::new(
            ast.node(id).loc,
            ErrorKind::MismatchedTypes {
                from: from.to_string(),
                to: to.to_string(),
            },
        )
    }

    fn ty(ast: &Ast, id: NodeId) -> Result<Type, Error> {
        ast.node(id).ty.clone().ok_or_else(|| {
            Error::new(
                ast.node(id).loc,
                ErrorKind::UntypedExpression {
                    what: ast.describe(id),
                },
            )
        })
    }

    /// Wrap `id` in an implicit cast to `to`, when the rules permit and the
    /// types differ. Number literals are refolded in place instead.
    fn insert_cast(&self, ast: &mut Ast, id: NodeId, to: &Type) -> NodeId {
        let Some(cur) = ast.node(id).ty.clone() else {
            return id;
        };
        if cur.same_shape(to) || !cur.can_implicit(to) {
            return id;
        }
        if let NodeKind::Number(n) = ast.node(id).kind {
            if to.is_int() {
                let v = match n {
                    Number::Int(v) => v,
                    Number::Float(f) => f as i64,
                };
                let node = ast.node_mut(id);
                node.kind = NodeKind::Number(Number::Int(v));
                node.ty = Some(Type::int());
                return id;
            }
            if to.is_float() {
                let v = match n {
                    Number::Int(v) => v as f64,
                    Number::Float(f) => f,
                };
                let node = ast.node_mut(id);
                node.kind = NodeKind::Number(Number::Float(v));
                node.ty = Some(Type::float());
                return id;
            }
        }
        let loc = ast.node(id).loc;
        let cast = ast.cast(loc, id, to.clone());
        ast.node_mut(cast).ty = Some(to.clone());
        cast
    }

    fn annotate_block(&self, ast: &mut Ast, id: NodeId, aggregate: bool) -> Result<NodeId, Error> {
        let stmts = match &ast.node(id).kind {
            NodeKind::Block { stmts, .. } => stmts.clone(),
            _ => return self.annotate_node(ast, id, ScopeId(0)),
        };
        let scope = match &ast.node(id).kind {
            NodeKind::Block {
                scope: Some(s), ..
            } => *s,
            _ => ScopeId(0),
        };
        let mut errors = Vec::new();
        let mut new_stmts = stmts.clone();
        for (i, stmt) in stmts.iter().enumerate() {
            match self.annotate_node(ast, *stmt, scope) {
                Ok(new_id) => new_stmts[i] = new_id,
                Err(e) => {
                    if aggregate {
                        errors.push(e);
                    } else {
                        return Err(e);
                    }
                }
            }
        }
        if let NodeKind::Block { stmts, .. } = &mut ast.node_mut(id).kind {
            *stmts = new_stmts;
        }
        ast.node_mut(id).ty = Some(Type::void());
        if !errors.is_empty() {
            return Err(Error::group(ast.node(id).loc, errors));
        }
        Ok(id)
    }

    fn annotate_ident(
        &self,
        ast: &mut Ast,
        id: NodeId,
        scope: ScopeId,
        pass_through: bool,
    ) -> Result<NodeId, Error> {
        let (name, loc) = match &ast.node(id).kind {
            NodeKind::Ident { name } => (name.clone(), ast.node(id).loc),
            _ => unreachable!("annotate_ident on non-identifier"),
        };
        let Some(info) = self.resolver.lookup(&name, scope) else {
            return Err(Error::new(loc, ErrorKind::UndefinedIdentifier { name }));
        };
        let sym_node = self
            .resolver
            .symbol_node(info.id)
            .ok_or_else(|| Error::new(loc, ErrorKind::MissingBinding { name: name.clone() }))?;
        let ty = Self::ty(ast, sym_node)?;
        ast.node_mut(id).ty = Some(ty.clone());
        if pass_through {
            return Ok(id);
        }
        let unwrapped = ty.unwrap_ref();
        if !unwrapped.readable {
            return Err(Error::new(loc, ErrorKind::ReadOfOutParameter { name }));
        }
        if let Some((elem, _)) = unwrapped.as_array() {
            if !elem.readable {
                return Err(Error::new(loc, ErrorKind::ReadOfOutParameter { name }));
            }
        }
        Ok(id)
    }

    fn annotate_binary(&self, ast: &mut Ast, id: NodeId, scope: ScopeId) -> Result<NodeId, Error> {
        let (bin_op, lhs, rhs) = match &ast.node(id).kind {
            NodeKind::Binary { op, lhs, rhs } => (*op, *lhs, *rhs),
            _ => unreachable!(),
        };
        let lhs = self.annotate_node(ast, lhs, scope)?;
        let rhs = self.annotate_node(ast, rhs, scope)?;
        let left = Self::ty(ast, lhs)?.unwrap_ref().clone();
        let right = Self::ty(ast, rhs)?.unwrap_ref().clone();

        let (lhs, rhs, result) = match bin_op {
            op::ADD | op::SUB | op::MUL | op::DIV => {
                // String and symbol concatenation; `+` only.
                if bin_op == op::ADD {
                    let str_like =
                        |t: &Type| t.is_string() || t.is_symbol();
                    if str_like(&left) && str_like(&right) {
                        let s = Type::string();
                        let lhs = self.insert_cast(ast, lhs, &s);
                        let rhs = self.insert_cast(ast, rhs, &s);
                        self.store_binary(ast, id, lhs, rhs, s);
                        return Ok(id);
                    }
                }
                let Some(mut common) = common_numeric(&left, &right) else {
                    return Err(Self::mismatch(ast, id, &left, "Int or Float"));
                };
                if bin_op == op::DIV {
                    // 3/2 -> 1.5: division is always float division.
                    common = Type::float();
                }
                let lhs = self.insert_cast(ast, lhs, &common);
                let rhs = self.insert_cast(ast, rhs, &common);
                (lhs, rhs, common)
            }
            op::REM => {
                if !(left.is_int() && right.is_int()) {
                    return Err(Self::mismatch(ast, id, &left, "Int"));
                }
                (lhs, rhs, Type::int())
            }
            op::POW => {
                if left.is_float() && right.is_int() {
                    (lhs, rhs, Type::float())
                } else if left.is_int() && right.is_int() {
                    (lhs, rhs, Type::int())
                } else {
                    return Err(Self::mismatch(ast, id, &right, "Int"));
                }
            }
            op::LT | op::LE | op::GT | op::GE | op::EQ | op::NE => {
                let (mut lhs, mut rhs) = (lhs, rhs);
                if left.is_numeric() && right.is_numeric() {
                    let Some(common) = common_numeric(&left, &right) else {
                        return Err(Self::mismatch(ast, id, &left, "Int or Float"));
                    };
                    lhs = self.insert_cast(ast, lhs, &common);
                    rhs = self.insert_cast(ast, rhs, &common);
                }
                (lhs, rhs, Type::boolean())
            }
            op::AND | op::OR => {
                let b = Type::boolean();
                let lhs = self.insert_cast(ast, lhs, &b);
                let rhs = self.insert_cast(ast, rhs, &b);
                (lhs, rhs, b)
            }
            other => {
                return Err(Error::new(
                    ast.node(id).loc,
                    ErrorKind::NotImplemented {
                        what: format!("binary operator `{}`", other),
                    },
                ));
            }
        };
        self.store_binary(ast, id, lhs, rhs, result);
        Ok(id)
    }

    fn store_binary(&self, ast: &mut Ast, id: NodeId, new_lhs: NodeId, new_rhs: NodeId, ty: Type) {
        if let NodeKind::Binary { lhs, rhs, .. } = &mut ast.node_mut(id).kind {
            *lhs = new_lhs;
            *rhs = new_rhs;
        }
        ast.node_mut(id).ty = Some(ty);
    }

    fn annotate_call(&self, ast: &mut Ast, id: NodeId, scope: ScopeId) -> Result<NodeId, Error> {
        let (callee, args) = match &ast.node(id).kind {
            NodeKind::Call { callee, args } => (*callee, args.clone()),
            _ => unreachable!(),
        };
        let loc = ast.node(id).loc;
        let callee = self.annotate_node(ast, callee, scope)?;
        let callee_ty = Self::ty(ast, callee)?;
        let Some((params, ret)) = callee_ty.as_function() else {
            // Not a function-typed callee; the lowerer reports this with
            // more context. Propagate the callee's type.
            if let NodeKind::Call { callee: c, .. } = &mut ast.node_mut(id).kind {
                *c = callee;
            }
            ast.node_mut(id).ty = Some(callee_ty.clone());
            return Ok(id);
        };
        let (params, ret) = (params.to_vec(), ret.clone());
        if params.len() != args.len() {
            return Err(Error::new(
                loc,
                ErrorKind::WrongArgCount {
                    expected: params.len(),
                    got: args.len(),
                },
            ));
        }
        let mut new_args = args.clone();
        for (i, arg) in args.iter().enumerate() {
            let param = &params[i];
            let is_ident = matches!(ast.node(*arg).kind, NodeKind::Ident { .. });
            let annotated = if is_ident {
                // Identifier arguments pass through without the readable
                // check; output parameters are legal call arguments.
                self.annotate_ident(ast, *arg, scope, true)?
            } else {
                self.annotate_node(ast, *arg, scope)?
            };
            let arg_ty = Self::ty(ast, annotated)?;
            if param.is_reference() {
                let referenced = param.unwrap_ref();
                if is_ident {
                    let ident_ty = arg_ty.unwrap_ref();
                    if !ident_ty.mutable {
                        let name = match &ast.node(annotated).kind {
                            NodeKind::Ident { name } => name.clone(),
                            _ => String::new(),
                        };
                        return Err(Error::new(
                            ast.node(annotated).loc,
                            ErrorKind::AssignmentToConst { name },
                        ));
                    }
                }
                if !arg_ty.unwrap_ref().same_shape(referenced) {
                    return Err(Self::mismatch(
                        ast,
                        annotated,
                        &arg_ty,
                        &referenced.to_string(),
                    ));
                }
                // No implicit casts for reference parameters.
                new_args[i] = annotated;
                continue;
            }
            if !arg_ty.same_shape(param) {
                if !arg_ty.unwrap_ref().can_implicit(param) {
                    return Err(Self::mismatch(ast, annotated, &arg_ty, &param.to_string()));
                }
                new_args[i] = self.insert_cast(ast, annotated, param);
            } else {
                new_args[i] = annotated;
            }
        }
        if let NodeKind::Call { callee: c, args: a } = &mut ast.node_mut(id).kind {
            *c = callee;
            *a = new_args;
        }
        ast.node_mut(id).ty = Some(ret);
        Ok(id)
    }

    fn annotate_assign(&self, ast: &mut Ast, id: NodeId, scope: ScopeId) -> Result<NodeId, Error> {
        let (name, value) = match &ast.node(id).kind {
            NodeKind::Assign { name, value } => (name.clone(), *value),
            _ => unreachable!(),
        };
        let loc = ast.node(id).loc;
        let value = self.annotate_node(ast, value, scope)?;
        let Some(info) = self.resolver.lookup(&name, scope) else {
            return Err(Error::new(loc, ErrorKind::UndefinedIdentifier { name }));
        };
        let sym_node = self
            .resolver
            .symbol_node(info.id)
            .ok_or_else(|| Error::new(loc, ErrorKind::MissingBinding { name: name.clone() }))?;
        let target = Self::ty(ast, sym_node)?;
        let target_unwrapped = target.unwrap_ref().clone();
        if !target_unwrapped.mutable {
            return Err(Error::new(loc, ErrorKind::AssignmentToConst { name }));
        }
        let value_ty = Self::ty(ast, value)?.unwrap_ref().clone();
        let value = if !value_ty.same_shape(&target_unwrapped) {
            if !value_ty.can_implicit(&target_unwrapped) {
                return Err(Self::mismatch(
                    ast,
                    id,
                    &value_ty,
                    &target_unwrapped.to_string(),
                ));
            }
            self.insert_cast(ast, value, &target_unwrapped)
        } else {
            value
        };
        if let NodeKind::Assign { value: v, .. } = &mut ast.node_mut(id).kind {
            *v = value;
        }
        ast.node_mut(id).ty = Some(Type::void());
        Ok(id)
    }

    fn annotate_array_assign(
        &self,
        ast: &mut Ast,
        id: NodeId,
        scope: ScopeId,
    ) -> Result<NodeId, Error> {
        let (name, indices, value) = match &ast.node(id).kind {
            NodeKind::ArrayAssign {
                name,
                indices,
                value,
            } => (name.clone(), indices.clone(), *value),
            _ => unreachable!(),
        };
        let loc = ast.node(id).loc;
        let value = self.annotate_node(ast, value, scope)?;
        let Some(info) = self.resolver.lookup(&name, scope) else {
            return Err(Error::new(loc, ErrorKind::UndefinedIdentifier { name }));
        };
        let sym_node = self
            .resolver
            .symbol_node(info.id)
            .ok_or_else(|| Error::new(loc, ErrorKind::MissingBinding { name: name.clone() }))?;
        let target = Self::ty(ast, sym_node)?;

        if let Some((elem, arity)) = target.unwrap_ref().as_array() {
            let elem = elem.clone();
            let value_ty = Self::ty(ast, value)?.unwrap_ref().clone();
            let value = if !value_ty.same_shape(&elem) {
                if !value_ty.can_implicit(&elem) {
                    return Err(Self::mismatch(ast, id, &value_ty, &elem.to_string()));
                }
                self.insert_cast(ast, value, &elem)
            } else {
                value
            };
            if indices.len() != arity {
                return Err(Error::new(
                    loc,
                    ErrorKind::WrongIndexCount {
                        expected: arity,
                        got: indices.len(),
                    },
                ));
            }
            let mut new_indices = indices.clone();
            for (i, idx) in indices.iter().enumerate() {
                let annotated = self.annotate_node(ast, *idx, scope)?;
                let idx_ty = Self::ty(ast, annotated)?;
                if !idx_ty.is_int() {
                    return Err(Self::mismatch(ast, annotated, &idx_ty, "Int"));
                }
                new_indices[i] = annotated;
            }
            if let NodeKind::ArrayAssign {
                indices: idx,
                value: v,
                ..
            } = &mut ast.node_mut(id).kind
            {
                *idx = new_indices;
                *v = value;
            }
            ast.node_mut(id).ty = Some(Type::void());
            return Ok(id);
        }

        if target.unwrap_ref().is_string() {
            // Element assignment into a string: one integer index, symbol
            // value.
            if indices.len() != 1 {
                return Err(Error::new(
                    loc,
                    ErrorKind::WrongIndexCount {
                        expected: 1,
                        got: indices.len(),
                    },
                ));
            }
            let idx = self.annotate_node(ast, indices[0], scope)?;
            let idx_ty = Self::ty(ast, idx)?;
            if !idx_ty.is_int() {
                return Err(Self::mismatch(ast, idx, &idx_ty, "Int"));
            }
            let value_ty = Self::ty(ast, value)?.unwrap_ref().clone();
            if !value_ty.is_symbol() {
                return Err(Self::mismatch(ast, value, &value_ty, "Symbol"));
            }
            if let NodeKind::ArrayAssign {
                indices: i,
                value: v,
                ..
            } = &mut ast.node_mut(id).kind
            {
                *i = vec![idx];
                *v = value;
            }
            ast.node_mut(id).ty = Some(Type::void());
            return Ok(id);
        }

        Err(Self::mismatch(ast, id, &target, "Array or String"))
    }

    fn annotate_node(&self, ast: &mut Ast, id: NodeId, scope: ScopeId) -> Result<NodeId, Error> {
        match &ast.node(id).kind {
            NodeKind::Number(n) => {
                let ty = if n.is_float() {
                    Type::float()
                } else {
                    Type::int()
                };
                ast.node_mut(id).ty = Some(ty);
                Ok(id)
            }
            NodeKind::StringLit { .. } => {
                ast.node_mut(id).ty = Some(Type::string());
                Ok(id)
            }
            NodeKind::Ident { .. } => self.annotate_ident(ast, id, scope, false),
            NodeKind::Unary { op: un_op, operand } => {
                let (un_op, operand) = (*un_op, *operand);
                let operand = self.annotate_node(ast, operand, scope)?;
                let ty = Self::ty(ast, operand)?.unwrap_ref().clone();
                let result = if un_op == op::SUB {
                    if !ty.is_numeric() {
                        return Err(Self::mismatch(ast, id, &ty, "Int or Float"));
                    }
                    ty
                } else if un_op == op::NOT {
                    if !(ty.is_bool() || ty.is_numeric()) {
                        return Err(Self::mismatch(ast, id, &ty, "Bool"));
                    }
                    Type::boolean()
                } else {
                    ty
                };
                if let NodeKind::Unary { operand: o, .. } = &mut ast.node_mut(id).kind {
                    *o = operand;
                }
                ast.node_mut(id).ty = Some(result);
                Ok(id)
            }
            NodeKind::Binary { .. } => self.annotate_binary(ast, id, scope),
            NodeKind::Cast { operand, to } => {
                let (operand, to) = (*operand, to.clone());
                let operand = self.annotate_node(ast, operand, scope)?;
                if let NodeKind::Cast { operand: o, .. } = &mut ast.node_mut(id).kind {
                    *o = operand;
                }
                ast.node_mut(id).ty = Some(to);
                Ok(id)
            }
            NodeKind::Assign { .. } => self.annotate_assign(ast, id, scope),
            NodeKind::ArrayAssign { .. } => self.annotate_array_assign(ast, id, scope),
            NodeKind::Index { collection, index } => {
                let (collection, index) = (*collection, *index);
                let collection = self.annotate_node(ast, collection, scope)?;
                let index = self.annotate_node(ast, index, scope)?;
                let index_ty = Self::ty(ast, index)?;
                let index = if index_ty.is_int() {
                    index
                } else if index_ty.can_implicit(&Type::int()) {
                    self.insert_cast(ast, index, &Type::int())
                } else {
                    return Err(Self::mismatch(ast, index, &index_ty, "Int"));
                };
                let coll_ty = Self::ty(ast, collection)?.unwrap_ref().clone();
                let result = if coll_ty.is_string() {
                    Type::symbol()
                } else if let Some((elem, _)) = coll_ty.as_array() {
                    elem.clone()
                } else {
                    return Err(Self::mismatch(ast, id, &coll_ty, "Array or String"));
                };
                if let NodeKind::Index {
                    collection: c,
                    index: i,
                } = &mut ast.node_mut(id).kind
                {
                    *c = collection;
                    *i = index;
                }
                ast.node_mut(id).ty = Some(result);
                Ok(id)
            }
            NodeKind::MultiIndex { .. } => {
                let (collection, indices) = match &ast.node(id).kind {
                    NodeKind::MultiIndex {
                        collection,
                        indices,
                    } => (*collection, indices.clone()),
                    _ => unreachable!(),
                };
                let collection = self.annotate_node(ast, collection, scope)?;
                let coll_ty = Self::ty(ast, collection)?.unwrap_ref().clone();
                let Some((elem, arity)) = coll_ty.as_array() else {
                    return Err(Self::mismatch(ast, id, &coll_ty, "Array"));
                };
                let elem = elem.clone();
                if indices.len() != arity {
                    return Err(Error::new(
                        ast.node(id).loc,
                        ErrorKind::WrongIndexCount {
                            expected: arity,
                            got: indices.len(),
                        },
                    ));
                }
                let mut new_indices = indices.clone();
                for (i, idx) in indices.iter().enumerate() {
                    let annotated = self.annotate_node(ast, *idx, scope)?;
                    let idx_ty = Self::ty(ast, annotated)?;
                    new_indices[i] = if idx_ty.is_int() {
                        annotated
                    } else if idx_ty.can_implicit(&Type::int()) {
                        self.insert_cast(ast, annotated, &Type::int())
                    } else {
                        return Err(Self::mismatch(ast, annotated, &idx_ty, "Int"));
                    };
                }
                if let NodeKind::MultiIndex {
                    collection: c,
                    indices: i,
                } = &mut ast.node_mut(id).kind
                {
                    *c = collection;
                    *i = new_indices;
                }
                ast.node_mut(id).ty = Some(elem);
                Ok(id)
            }
            NodeKind::Slice { .. } => {
                let (collection, start, end) = match &ast.node(id).kind {
                    NodeKind::Slice {
                        collection,
                        start,
                        end,
                    } => (*collection, *start, *end),
                    _ => unreachable!(),
                };
                let collection = self.annotate_node(ast, collection, scope)?;
                let coll_ty = Self::ty(ast, collection)?.unwrap_ref().clone();
                if !coll_ty.is_string() {
                    return Err(Self::mismatch(ast, id, &coll_ty, "String"));
                }
                let mut bounds = [start, end];
                for b in &mut bounds {
                    let annotated = self.annotate_node(ast, *b, scope)?;
                    let ty = Self::ty(ast, annotated)?;
                    *b = if ty.is_int() {
                        annotated
                    } else if ty.can_implicit(&Type::int()) {
                        self.insert_cast(ast, annotated, &Type::int())
                    } else {
                        return Err(Self::mismatch(ast, annotated, &ty, "Int"));
                    };
                }
                if let NodeKind::Slice {
                    collection: c,
                    start: s,
                    end: e,
                } = &mut ast.node_mut(id).kind
                {
                    *c = collection;
                    *s = bounds[0];
                    *e = bounds[1];
                }
                ast.node_mut(id).ty = Some(coll_ty);
                Ok(id)
            }
            NodeKind::Block { .. } => self.annotate_block(ast, id, false),
            NodeKind::If { .. } => {
                let (cond, then_branch, else_branch) = match &ast.node(id).kind {
                    NodeKind::If {
                        cond,
                        then_branch,
                        else_branch,
                    } => (*cond, *then_branch, *else_branch),
                    _ => unreachable!(),
                };
                let cond = self.annotate_node(ast, cond, scope)?;
                let cond_ty = Self::ty(ast, cond)?.unwrap_ref().clone();
                let b = Type::boolean();
                let cond = if !cond_ty.same_shape(&b) && cond_ty.can_implicit(&b) {
                    self.insert_cast(ast, cond, &b)
                } else {
                    cond
                };
                let then_branch = self.annotate_node(ast, then_branch, scope)?;
                let else_branch = match else_branch {
                    Some(e) => Some(self.annotate_node(ast, e, scope)?),
                    None => None,
                };
                if let NodeKind::If {
                    cond: c,
                    then_branch: t,
                    else_branch: e,
                } = &mut ast.node_mut(id).kind
                {
                    *c = cond;
                    *t = then_branch;
                    *e = else_branch;
                }
                ast.node_mut(id).ty = Some(Type::void());
                Ok(id)
            }
            NodeKind::Loop { .. } => {
                let children: Vec<NodeId> = ast.node(id).kind.children();
                let mut replacements = Vec::with_capacity(children.len());
                for child in children {
                    replacements.push(self.annotate_node(ast, child, scope)?);
                }
                for (slot, new_id) in ast
                    .node_mut(id)
                    .kind
                    .children_mut()
                    .into_iter()
                    .zip(replacements)
                {
                    *slot = new_id;
                }
                ast.node_mut(id).ty = Some(Type::void());
                Ok(id)
            }
            NodeKind::Break | NodeKind::Continue => {
                ast.node_mut(id).ty = Some(Type::void());
                Ok(id)
            }
            NodeKind::VarDecl { declared, .. } => {
                let declared = declared.clone();
                // Bound expressions were consumed by the transformer; any
                // remaining ones (globals) still need types.
                let children: Vec<NodeId> = ast.node(id).kind.children();
                for child in children {
                    self.annotate_node(ast, child, scope)?;
                }
                ast.node_mut(id).ty = Some(declared);
                Ok(id)
            }
            NodeKind::FunDecl(decl) => {
                let (params, body, ret) = (decl.params.clone(), decl.body, decl.ret.clone());
                let Some(body) = body else {
                    // External declaration; typed at import.
                    return Ok(id);
                };
                let mut param_types = Vec::with_capacity(params.len());
                for p in &params {
                    self.annotate_node(ast, *p, scope)?;
                    param_types.push(Self::ty(ast, *p)?);
                }
                ast.node_mut(id).ty = Some(Type::function(param_types, ret));
                self.annotate_node(ast, body, scope)?;
                Ok(id)
            }
            NodeKind::Call { .. } => self.annotate_call(ast, id, scope),
            NodeKind::Input { args } | NodeKind::Output { args } => {
                let args = args.clone();
                let mut new_args = args.clone();
                for (i, arg) in args.iter().enumerate() {
                    new_args[i] = self.annotate_node(ast, *arg, scope)?;
                }
                match &mut ast.node_mut(id).kind {
                    NodeKind::Input { args } | NodeKind::Output { args } => *args = new_args,
                    _ => unreachable!(),
                }
                ast.node_mut(id).ty = Some(Type::void());
                Ok(id)
            }
            NodeKind::VarsBlock { .. } | NodeKind::Assert { .. } | NodeKind::Use { .. } => {
                // These are desugared before annotation ever runs.
                Err(Error::new(
                    ast.node(id).loc,
                    ErrorKind::UntypedExpression {
                        what: ast.node(id).kind.variant().to_string(),
                    },
                ))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::SourceLoc;
    use crate::types::TypeKind;

    fn loc() -> SourceLoc {
        SourceLoc::new(1, 1)
    }

    fn resolved(ast: &mut Ast, root: NodeId) -> Resolver {
        let mut r = Resolver::new();
        r.resolve(ast, root).unwrap();
        r
    }

    fn all_typed(ast: &Ast, id: NodeId) -> bool {
        if ast.node(id).ty.is_none() {
            return false;
        }
        ast.node(id)
            .kind
            .children()
            .iter()
            .all(|&c| all_typed(ast, c))
    }

    #[test]
    fn annotation_is_total_after_success() {
        let mut ast = Ast::new();
        let d = ast.var_decl(loc(), "x", Type::int());
        let one = ast.int(loc(), 1);
        let two = ast.int(loc(), 2);
        let sum = ast.binary(loc(), op::ADD, one, two);
        let asg = ast.assign(loc(), "x", sum);
        let use_x = ast.ident(loc(), "x");
        let zero = ast.int(loc(), 0);
        let cmp = ast.binary(loc(), op::GT, use_x, zero);
        let then = ast.block(loc(), vec![]);
        let iff = ast.if_stmt(loc(), cmp, then, None);
        let root = ast.block(loc(), vec![d, asg, iff]);
        let r = resolved(&mut ast, root);
        Annotator::new(&r).annotate(&mut ast, root).unwrap();
        assert!(all_typed(&ast, root));
    }

    #[test]
    fn mixed_arithmetic_promotes_to_float() {
        let mut ast = Ast::new();
        let d = ast.var_decl(loc(), "x", Type::float());
        let x = ast.ident(loc(), "x");
        let two = ast.int(loc(), 2);
        let sum = ast.binary(loc(), op::ADD, x, two);
        let asg = ast.assign(loc(), "x", sum);
        let root = ast.block(loc(), vec![d, asg]);
        let r = resolved(&mut ast, root);
        Annotator::new(&r).annotate(&mut ast, root).unwrap();
        assert!(ast.node(sum).ty.as_ref().unwrap().is_float());
        // The int literal was refolded, not wrapped.
        match &ast.node(sum).kind {
            NodeKind::Binary { rhs, .. } => match ast.node(*rhs).kind {
                NodeKind::Number(Number::Float(f)) => assert_eq!(f, 2.0),
                ref other => panic!("expected refolded float literal, got {:?}", other),
            },
            _ => unreachable!(),
        }
    }

    #[test]
    fn division_always_yields_float() {
        let mut ast = Ast::new();
        let d = ast.var_decl(loc(), "x", Type::float());
        let three = ast.int(loc(), 3);
        let two = ast.int(loc(), 2);
        let div = ast.binary(loc(), op::DIV, three, two);
        let asg = ast.assign(loc(), "x", div);
        let root = ast.block(loc(), vec![d, asg]);
        let r = resolved(&mut ast, root);
        Annotator::new(&r).annotate(&mut ast, root).unwrap();
        assert!(ast.node(div).ty.as_ref().unwrap().is_float());
    }

    #[test]
    fn remainder_requires_integers() {
        let mut ast = Ast::new();
        let a = ast.float(loc(), 1.5);
        let b = ast.int(loc(), 2);
        let rem = ast.binary(loc(), op::REM, a, b);
        let root = ast.block(loc(), vec![rem]);
        let r = resolved(&mut ast, root);
        let err = Annotator::new(&r).annotate(&mut ast, root).unwrap_err();
        assert!(!err.children.is_empty());
    }

    #[test]
    fn symbol_concat_yields_string_with_casts() {
        let mut ast = Ast::new();
        let d1 = ast.var_decl(loc(), "a", Type::symbol());
        let d2 = ast.var_decl(loc(), "b", Type::symbol());
        let d3 = ast.var_decl(loc(), "s", Type::string());
        let a = ast.ident(loc(), "a");
        let b = ast.ident(loc(), "b");
        let sum = ast.binary(loc(), op::ADD, a, b);
        let asg = ast.assign(loc(), "s", sum);
        let root = ast.block(loc(), vec![d1, d2, d3, asg]);
        let r = resolved(&mut ast, root);
        Annotator::new(&r).annotate(&mut ast, root).unwrap();
        assert!(ast.node(sum).ty.as_ref().unwrap().is_string());
        match &ast.node(sum).kind {
            NodeKind::Binary { lhs, rhs, .. } => {
                assert!(matches!(ast.node(*lhs).kind, NodeKind::Cast { .. }));
                assert!(matches!(ast.node(*rhs).kind, NodeKind::Cast { .. }));
            }
            _ => unreachable!(),
        }
    }

    #[test]
    fn float_literal_refolds_when_int_expected() {
        let mut ast = Ast::new();
        let d = ast.var_decl(loc(), "x", Type::int());
        let lit = ast.float(loc(), 1.0);
        let asg = ast.assign(loc(), "x", lit);
        let root = ast.block(loc(), vec![d, asg]);
        let r = resolved(&mut ast, root);
        Annotator::new(&r).annotate(&mut ast, root).unwrap();
        match ast.node(lit).kind {
            NodeKind::Number(Number::Int(v)) => assert_eq!(v, 1),
            ref other => panic!("expected refolded int literal, got {:?}", other),
        }
        assert!(ast.node(lit).ty.as_ref().unwrap().is_int());
    }

    #[test]
    fn assignment_to_input_parameter_is_rejected() {
        let mut ast = Ast::new();
        let p = ast.var_decl(loc(), "n", Type::int().input_only());
        let one = ast.int(loc(), 1);
        let asg = ast.assign(loc(), "n", one);
        let body = ast.block(loc(), vec![asg]);
        let f = ast.fun_decl(loc(), "f", vec![p], body, Type::void());
        let root = ast.block(loc(), vec![f]);
        let r = resolved(&mut ast, root);
        let err = Annotator::new(&r).annotate(&mut ast, root).unwrap_err();
        fn find_kind(e: &Error) -> bool {
            matches!(e.kind, ErrorKind::AssignmentToConst { .. })
                || e.children.iter().any(find_kind)
        }
        assert!(find_kind(&err));
    }

    #[test]
    fn read_of_output_parameter_is_rejected() {
        let mut ast = Ast::new();
        let p = ast.var_decl(loc(), "out", Type::reference(Type::int().output_only()));
        let d = ast.var_decl(loc(), "x", Type::int());
        let read = ast.ident(loc(), "out");
        let asg = ast.assign(loc(), "x", read);
        let body = ast.block(loc(), vec![d, asg]);
        let f = ast.fun_decl(loc(), "f", vec![p], body, Type::void());
        let root = ast.block(loc(), vec![f]);
        let r = resolved(&mut ast, root);
        let err = Annotator::new(&r).annotate(&mut ast, root).unwrap_err();
        fn find_kind(e: &Error) -> bool {
            matches!(e.kind, ErrorKind::ReadOfOutParameter { .. })
                || e.children.iter().any(find_kind)
        }
        assert!(find_kind(&err));
    }

    #[test]
    fn call_checks_argument_count() {
        let mut ast = Ast::new();
        let p = ast.var_decl(loc(), "a", Type::int());
        let body = ast.block(loc(), vec![]);
        let f = ast.fun_decl(loc(), "f", vec![p], body, Type::void());
        let call = ast.call_named(loc(), "f", vec![]);
        let root = ast.block(loc(), vec![f, call]);
        let r = resolved(&mut ast, root);
        let err = Annotator::new(&r).annotate(&mut ast, root).unwrap_err();
        fn find_kind(e: &Error) -> bool {
            matches!(e.kind, ErrorKind::WrongArgCount { expected: 1, got: 0 })
                || e.children.iter().any(find_kind)
        }
        assert!(find_kind(&err));
    }

    #[test]
    fn if_condition_casts_to_bool() {
        let mut ast = Ast::new();
        let d = ast.var_decl(loc(), "x", Type::int());
        let x = ast.ident(loc(), "x");
        let then = ast.block(loc(), vec![]);
        let iff = ast.if_stmt(loc(), x, then, None);
        let root = ast.block(loc(), vec![d, iff]);
        let r = resolved(&mut ast, root);
        Annotator::new(&r).annotate(&mut ast, root).unwrap();
        match &ast.node(iff).kind {
            NodeKind::If { cond, .. } => match &ast.node(*cond).kind {
                NodeKind::Cast { to, .. } => assert!(matches!(to.kind, TypeKind::Bool)),
                other => panic!("expected bool cast on condition, got {:?}", other),
            },
            _ => unreachable!(),
        }
    }

    #[test]
    fn string_index_types_as_symbol() {
        let mut ast = Ast::new();
        let d = ast.var_decl(loc(), "s", Type::string());
        let ds = ast.var_decl(loc(), "c", Type::symbol());
        let s = ast.ident(loc(), "s");
        let one = ast.int(loc(), 1);
        let idx = ast.index(loc(), s, one);
        let asg = ast.assign(loc(), "c", idx);
        let root = ast.block(loc(), vec![d, ds, asg]);
        let r = resolved(&mut ast, root);
        Annotator::new(&r).annotate(&mut ast, root).unwrap();
        assert!(ast.node(idx).ty.as_ref().unwrap().is_symbol());
    }
}

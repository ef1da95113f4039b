//! AST transformation passes.
//!
//! Three rewriting passes run around name resolution and type annotation:
//!
//! * pre-resolution: reserved-identifier constants, `юникод`/`юнисимвол`
//!   desugaring, `assert` lowering to `__ensure`, vars-block splicing;
//! * post-resolution: zero-argument function references become calls, and
//!   array declarations expand into hidden bound/stride variables;
//! * post-annotation: type-dependent desugaring (string concatenation,
//!   power, I/O statements, string indexing and slicing, symbol-to-string
//!   casts), iterated with the annotator to a bounded fixpoint.
//!
//! The rewriters are generic bottom-up and top-down walks that replace
//! nodes through the mutable children accessors.

use crate::annotate::Annotator;
use crate::ast::{Ast, NodeId, NodeKind, Number};
use crate::error::{Error, ErrorKind};
use crate::op;
use crate::resolver::{Resolver, ScopeId, SymbolInfo};
use crate::types::Type;
use std::collections::HashSet;

/// Iteration bound for the annotate/rewrite fixpoint.
const MAX_ITERATIONS: usize = 10;

/// Bottom-up rewrite: children first, then the node itself. The closure
/// returns a replacement id or `None` to keep the node. Returns whether
/// anything changed.
pub fn transform_postorder(
    ast: &mut Ast,
    root: &mut NodeId,
    f: &mut dyn FnMut(&mut Ast, NodeId) -> Option<NodeId>,
) -> bool {
    let mut changed = false;
    walk_post(ast, root, f, &mut changed);
    changed
}

fn walk_post(
    ast: &mut Ast,
    id: &mut NodeId,
    f: &mut dyn FnMut(&mut Ast, NodeId) -> Option<NodeId>,
    changed: &mut bool,
) {
    let kids = ast.node(*id).kind.children();
    let mut new_kids = kids.clone();
    for (i, kid) in kids.iter().enumerate() {
        let mut k = *kid;
        walk_post(ast, &mut k, f, changed);
        new_kids[i] = k;
    }
    if new_kids != kids {
        for (slot, n) in ast
            .node_mut(*id)
            .kind
            .children_mut()
            .into_iter()
            .zip(new_kids)
        {
            *slot = n;
        }
    }
    if let Some(replacement) = f(ast, *id) {
        if replacement != *id {
            *id = replacement;
            *changed = true;
        }
    }
}

/// Top-down rewrite, used when a pass needs enclosing context (scope ids).
/// `descend` gates recursion into a node's children.
pub fn transform_preorder(
    ast: &mut Ast,
    root: &mut NodeId,
    f: &mut dyn FnMut(&mut Ast, NodeId) -> Option<NodeId>,
    descend: &mut dyn FnMut(&Ast, NodeId) -> bool,
) -> bool {
    let mut changed = false;
    walk_pre(ast, root, f, descend, &mut changed);
    changed
}

fn walk_pre(
    ast: &mut Ast,
    id: &mut NodeId,
    f: &mut dyn FnMut(&mut Ast, NodeId) -> Option<NodeId>,
    descend: &mut dyn FnMut(&Ast, NodeId) -> bool,
    changed: &mut bool,
) {
    if let Some(replacement) = f(ast, *id) {
        if replacement != *id {
            *id = replacement;
            *changed = true;
        }
    }
    if !descend(ast, *id) {
        return;
    }
    let kids = ast.node(*id).kind.children();
    let mut new_kids = kids.clone();
    for (i, kid) in kids.iter().enumerate() {
        let mut k = *kid;
        walk_pre(ast, &mut k, f, descend, changed);
        new_kids[i] = k;
    }
    if new_kids != kids {
        for (slot, n) in ast
            .node_mut(*id)
            .kind
            .children_mut()
            .into_iter()
            .zip(new_kids)
        {
            *slot = n;
        }
    }
}

/// Rewrites that need no name or type information.
pub fn pre_resolution_transform(ast: &mut Ast, root: &mut NodeId) -> Result<bool, Error> {
    let changed = transform_postorder(ast, root, &mut |ast, id| {
        let loc = ast.node(id).loc;
        match &ast.node(id).kind {
            NodeKind::Ident { name } if name == "МАКСВЕЩ" => Some(ast.float(loc, f64::MAX)),
            NodeKind::Ident { name } if name == "МАКСЦЕЛ" => Some(ast.int(loc, i64::MAX)),
            NodeKind::Call { callee, args } if args.len() == 1 => {
                let arg = args[0];
                match &ast.node(*callee).kind {
                    NodeKind::Ident { name } if name == "юникод" => {
                        Some(ast.cast(loc, arg, Type::int()))
                    }
                    NodeKind::Ident { name } if name == "юнисимвол" => {
                        Some(ast.cast(loc, arg, Type::symbol()))
                    }
                    _ => None,
                }
            }
            NodeKind::Assert { expr } => {
                let expr = *expr;
                let text = ast.describe(expr);
                let message = ast.string_lit(loc, &text);
                Some(ast.call_named(loc, "__ensure", vec![expr, message]))
            }
            NodeKind::Block { stmts, .. }
                if stmts
                    .iter()
                    .any(|s| matches!(ast.node(*s).kind, NodeKind::VarsBlock { .. })) =>
            {
                let mut spliced = Vec::with_capacity(stmts.len());
                for &s in stmts {
                    match &ast.node(s).kind {
                        NodeKind::VarsBlock { vars } => spliced.extend(vars.iter().copied()),
                        _ => spliced.push(s),
                    }
                }
                if let NodeKind::Block { stmts, .. } = &mut ast.node_mut(id).kind {
                    *stmts = spliced;
                }
                Some(id)
            }
            _ => None,
        }
    });
    Ok(changed)
}

/// Expand the hidden bound/stride variables of an array declaration into a
/// transient block: for each dimension, `$$name_lbound<i>`,
/// `$$name_dimsize<i>` and `$$name_mulacc<i>`, with
/// `dimsize<i> = hi - lo + 1` and `mulacc<i> = mulacc<i+1> * dimsize<i>`
/// (`mulacc<arity>` implicitly 1). The block shares the enclosing scope and
/// skips destructors.
fn generate_bounds(
    ast: &mut Ast,
    resolver: &mut Resolver,
    var: NodeId,
    info: &SymbolInfo,
    block_scope: ScopeId,
) -> Result<NodeId, Error> {
    let loc = ast.node(var).loc;
    let (name, bounds) = match &mut ast.node_mut(var).kind {
        NodeKind::VarDecl { name, bounds, .. } => (name.clone(), std::mem::take(bounds)),
        _ => {
            return Err(Error::new(
                loc,
                ErrorKind::MissingBinding {
                    name: "<array declaration>".to_string(),
                },
            ));
        }
    };
    let mut stmts = Vec::new();
    for i in (0..bounds.len()).rev() {
        let (lo, hi) = bounds[i];
        let lbound = format!("$${}_lbound{}", name, i);
        let dimsize = format!("$${}_dimsize{}", name, i);
        let mulacc = format!("$${}_mulacc{}", name, i);
        for hidden in [&lbound, &dimsize, &mulacc] {
            let decl = ast.var_decl(loc, hidden, Type::int());
            resolver.declare_like(hidden, decl, info, loc)?;
            stmts.push(decl);
        }
        stmts.push(ast.assign(loc, &lbound, lo));
        let diff = ast.binary(loc, op::SUB, hi, lo);
        let one = ast.int(loc, 1);
        let size = ast.binary(loc, op::ADD, diff, one);
        stmts.push(ast.assign(loc, &dimsize, size));
        let prev = if i + 1 < bounds.len() {
            ast.ident(loc, &format!("$${}_mulacc{}", name, i + 1))
        } else {
            ast.int(loc, 1)
        };
        let size_ref = ast.ident(loc, &dimsize);
        let acc = ast.binary(loc, op::MUL, prev, size_ref);
        stmts.push(ast.assign(loc, &mulacc, acc));
    }
    let block = ast.block(loc, stmts);
    if let NodeKind::Block {
        scope,
        skip_destructors,
        ..
    } = &mut ast.node_mut(block).kind
    {
        *scope = Some(block_scope);
        *skip_destructors = true;
    }
    Ok(block)
}

/// Rewrites that need resolved names: zero-argument function references and
/// array-bounds expansion (declarations and array parameters).
pub fn post_resolution_transform(
    ast: &mut Ast,
    root: &mut NodeId,
    resolver: &mut Resolver,
) -> Result<bool, Error> {
    let mut errors: Vec<Error> = Vec::new();
    let mut scope: Option<ScopeId> = None;
    // Call callees must not be wrapped into calls themselves.
    let mut callee_skip: HashSet<NodeId> = HashSet::new();

    let changed = transform_preorder(
        ast,
        root,
        &mut |ast, id| {
            let loc = ast.node(id).loc;
            match &ast.node(id).kind {
                NodeKind::Block { scope: s, .. } => {
                    if s.is_some() {
                        scope = *s;
                    }
                    None
                }
                NodeKind::Call { callee, .. } => {
                    callee_skip.insert(*callee);
                    None
                }
                NodeKind::Ident { name } => {
                    if callee_skip.contains(&id) {
                        return None;
                    }
                    let cur_scope = scope?;
                    let name = name.clone();
                    let Some(info) = resolver.lookup(&name, cur_scope) else {
                        errors.push(Error::new(loc, ErrorKind::UndefinedIdentifier { name }));
                        return None;
                    };
                    let sym_node = resolver.symbol_node(info.id)?;
                    match &ast.node(sym_node).kind {
                        NodeKind::FunDecl(decl) if decl.params.is_empty() => {
                            let ret = decl.ret.clone();
                            let call = ast.call(loc, id, vec![]);
                            ast.node_mut(call).ty = Some(ret);
                            callee_skip.insert(id);
                            Some(call)
                        }
                        _ => None,
                    }
                }
                NodeKind::VarDecl {
                    name,
                    declared,
                    bounds,
                } if !bounds.is_empty() && declared.as_array().is_some() => {
                    let cur_scope = scope?;
                    let name = name.clone();
                    let Some(info) = resolver.lookup(&name, cur_scope) else {
                        errors.push(Error::new(loc, ErrorKind::UndefinedIdentifier { name }));
                        return None;
                    };
                    match generate_bounds(ast, resolver, id, &info, cur_scope) {
                        Ok(block) => {
                            if let NodeKind::Block { stmts, .. } = &mut ast.node_mut(block).kind {
                                stmts.push(id);
                            }
                            Some(block)
                        }
                        Err(e) => {
                            errors.push(e);
                            None
                        }
                    }
                }
                NodeKind::FunDecl(decl) if decl.body.is_some() => {
                    let params = decl.params.clone();
                    let fun_scope = decl.scope?;
                    let body = decl.body?;
                    let mut pre_stmts = Vec::new();
                    for param in params {
                        let has_bounds = matches!(
                            &ast.node(param).kind,
                            NodeKind::VarDecl { bounds, .. } if !bounds.is_empty()
                        );
                        if !has_bounds {
                            continue;
                        }
                        let pname = match &ast.node(param).kind {
                            NodeKind::VarDecl { name, .. } => name.clone(),
                            _ => continue,
                        };
                        let Some(info) = resolver.lookup(&pname, fun_scope) else {
                            errors.push(Error::new(
                                ast.node(param).loc,
                                ErrorKind::UndefinedIdentifier { name: pname },
                            ));
                            continue;
                        };
                        match generate_bounds(ast, resolver, param, &info, fun_scope) {
                            Ok(block) => {
                                if let NodeKind::Block { stmts, .. } = &ast.node(block).kind {
                                    pre_stmts.extend(stmts.iter().copied());
                                }
                            }
                            Err(e) => errors.push(e),
                        }
                    }
                    if pre_stmts.is_empty() {
                        return None;
                    }
                    if let NodeKind::Block { stmts, .. } = &mut ast.node_mut(body).kind {
                        pre_stmts.extend(stmts.iter().copied());
                        *stmts = pre_stmts;
                    }
                    // In-place reshaping of the body still counts as a
                    // change for the caller.
                    Some(id)
                }
                _ => None,
            }
        },
        &mut |_, _| true,
    );

    if let Some(first) = errors.into_iter().next() {
        return Err(first);
    }
    Ok(changed)
}

/// Type-dependent desugaring, run after each annotation pass.
pub fn post_annotation_transform(ast: &mut Ast, root: &mut NodeId) -> Result<bool, Error> {
    let mut errors: Vec<Error> = Vec::new();

    let changed = transform_postorder(ast, root, &mut |ast, id| {
        let loc = ast.node(id).loc;
        match &ast.node(id).kind {
            NodeKind::Binary { op: bin_op, lhs, rhs } => {
                let (bin_op, lhs, rhs) = (*bin_op, *lhs, *rhs);
                if bin_op == op::ADD {
                    let both_strings = ast.node(lhs).ty.as_ref().is_some_and(Type::is_string)
                        && ast.node(rhs).ty.as_ref().is_some_and(Type::is_string);
                    if both_strings {
                        return Some(ast.call_named(loc, "str_concat", vec![lhs, rhs]));
                    }
                }
                if bin_op == op::POW {
                    let float_base = ast.node(lhs).ty.as_ref().is_some_and(Type::is_float);
                    let name = if float_base { "pow" } else { "fpow" };
                    return Some(ast.call_named(loc, name, vec![lhs, rhs]));
                }
                None
            }
            NodeKind::Output { args } => {
                let args = args.clone();
                let mut stmts = Vec::with_capacity(args.len());
                for arg in args {
                    let Some(ty) = ast.node(arg).ty.clone() else {
                        continue;
                    };
                    let ty = ty.unwrap_ref().clone();
                    let fn_name = if ty.is_float() {
                        "output_double"
                    } else if ty.is_int() {
                        "output_int64"
                    } else if ty.is_bool() {
                        "output_bool"
                    } else if ty.is_string() {
                        "output_string"
                    } else if ty.is_symbol() {
                        "output_symbol"
                    } else {
                        errors.push(Error::new(
                            ast.node(arg).loc,
                            ErrorKind::MismatchedTypes {
                                from: ty.to_string(),
                                to: "Int, Float, Bool, String or Symbol".to_string(),
                            },
                        ));
                        continue;
                    };
                    stmts.push(ast.call_named(loc, fn_name, vec![arg]));
                }
                Some(ast.block(loc, stmts))
            }
            NodeKind::Input { args } => {
                let args = args.clone();
                let mut stmts = Vec::with_capacity(args.len());
                for arg in args {
                    let Some(ty) = ast.node(arg).ty.clone() else {
                        continue;
                    };
                    let fn_name = if ty.unwrap_ref().is_float() {
                        "input_double"
                    } else if ty.unwrap_ref().is_int() {
                        "input_int64"
                    } else {
                        errors.push(Error::new(
                            ast.node(arg).loc,
                            ErrorKind::MismatchedTypes {
                                from: ty.to_string(),
                                to: "Int or Float".to_string(),
                            },
                        ));
                        continue;
                    };
                    let read = ast.call_named(loc, fn_name, vec![]);
                    let stmt = match &ast.node(arg).kind {
                        NodeKind::Ident { name } => {
                            let name = name.clone();
                            ast.assign(loc, &name, read)
                        }
                        NodeKind::Index { collection, index } => {
                            let (collection, index) = (*collection, *index);
                            match &ast.node(collection).kind {
                                NodeKind::Ident { name } => {
                                    let name = name.clone();
                                    ast.array_assign(loc, &name, vec![index], read)
                                }
                                _ => {
                                    errors.push(Error::new(
                                        ast.node(arg).loc,
                                        ErrorKind::ReferenceRequiresIdentifier,
                                    ));
                                    continue;
                                }
                            }
                        }
                        NodeKind::MultiIndex {
                            collection,
                            indices,
                        } => {
                            let (collection, indices) = (*collection, indices.clone());
                            match &ast.node(collection).kind {
                                NodeKind::Ident { name } => {
                                    let name = name.clone();
                                    ast.array_assign(loc, &name, indices, read)
                                }
                                _ => {
                                    errors.push(Error::new(
                                        ast.node(arg).loc,
                                        ErrorKind::ReferenceRequiresIdentifier,
                                    ));
                                    continue;
                                }
                            }
                        }
                        _ => {
                            errors.push(Error::new(
                                ast.node(arg).loc,
                                ErrorKind::ReferenceRequiresIdentifier,
                            ));
                            continue;
                        }
                    };
                    stmts.push(stmt);
                }
                Some(ast.block(loc, stmts))
            }
            NodeKind::Index { collection, index } => {
                let (collection, index) = (*collection, *index);
                let on_string = ast
                    .node(collection)
                    .ty
                    .as_ref()
                    .is_some_and(|t| t.unwrap_ref().is_string());
                if !on_string {
                    return None;
                }
                let ty = ast.node(id).ty.clone();
                let call = ast.call_named(loc, "str_symbol_at", vec![collection, index]);
                ast.node_mut(call).ty = ty;
                Some(call)
            }
            NodeKind::Slice {
                collection,
                start,
                end,
            } => {
                let (collection, start, end) = (*collection, *start, *end);
                let on_string = ast
                    .node(collection)
                    .ty
                    .as_ref()
                    .is_some_and(|t| t.unwrap_ref().is_string());
                if !on_string {
                    return None;
                }
                let ty = ast.node(id).ty.clone();
                let call = ast.call_named(loc, "str_slice", vec![collection, start, end]);
                ast.node_mut(call).ty = ty;
                Some(call)
            }
            NodeKind::Cast { operand, to } => {
                let operand = *operand;
                let symbol_to_string = to.is_string()
                    && ast
                        .node(operand)
                        .ty
                        .as_ref()
                        .is_some_and(|t| t.unwrap_ref().is_symbol());
                if !symbol_to_string {
                    return None;
                }
                let ty = ast.node(id).ty.clone();
                let call = ast.call_named(loc, "str_from_unicode", vec![operand]);
                ast.node_mut(call).ty = ty;
                Some(call)
            }
            _ => None,
        }
    });

    if changed {
        // Newly introduced blocks inherit the scope last seen on the path
        // from the root.
        let mut last_scope: Option<ScopeId> = None;
        transform_preorder(
            ast,
            root,
            &mut |ast, id| {
                if let NodeKind::Block { scope, .. } = &mut ast.node_mut(id).kind {
                    match scope {
                        Some(s) => last_scope = Some(*s),
                        None => *scope = last_scope,
                    }
                }
                None
            },
            &mut |ast, id| !matches!(ast.node(id).kind, NodeKind::Binary { .. }),
        );
    }

    if let Some(first) = errors.into_iter().next() {
        return Err(first);
    }
    Ok(changed)
}

/// The full mid-end front: module imports, the three transform passes, name
/// resolution, and the annotate/rewrite fixpoint.
pub fn pipeline(ast: &mut Ast, root: &mut NodeId, resolver: &mut Resolver) -> Result<(), Error> {
    // Leading `use` directives import registered modules.
    loop {
        let first = match &ast.node(*root).kind {
            NodeKind::Block { stmts, .. } => stmts.first().copied(),
            _ => None,
        };
        let Some(first) = first else { break };
        let NodeKind::Use { module } = &ast.node(first).kind else {
            break;
        };
        let module = module.clone();
        if !resolver.import_module(ast, &module) {
            return Err(Error::new(
                ast.node(first).loc,
                ErrorKind::UnknownModule { name: module },
            ));
        }
        tracing::debug!(module = %module, "imported module");
        if let NodeKind::Block { stmts, .. } = &mut ast.node_mut(*root).kind {
            stmts.remove(0);
        }
    }

    pre_resolution_transform(ast, root)?;
    resolver.resolve(ast, *root)?;
    post_resolution_transform(ast, root, resolver)?;

    let mut iterations = 0;
    loop {
        Annotator::new(resolver).annotate(ast, *root)?;
        let changed = post_annotation_transform(ast, root)?;
        iterations += 1;
        tracing::trace!(iterations, changed, "annotation round");
        if !changed {
            break;
        }
        if iterations >= MAX_ITERATIONS {
            return Err(Error::new(
                ast.node(*root).loc,
                ErrorKind::TooManyTransformIterations,
            ));
        }
    }
    tracing::debug!(iterations, nodes = ast.len(), "front-end pipeline done");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::SourceLoc;
    use crate::modules::{RUNTIME_MODULE, SYSTEM_MODULE, runtime_module, system_module};

    fn loc() -> SourceLoc {
        SourceLoc::new(1, 1)
    }

    fn prepared_resolver(ast: &mut Ast) -> Resolver {
        let mut r = Resolver::new();
        r.register_module(system_module());
        r.register_module(runtime_module());
        r.import_module(ast, SYSTEM_MODULE);
        r.import_module(ast, RUNTIME_MODULE);
        r
    }

    #[test]
    fn reserved_identifiers_fold_to_literals() {
        let mut ast = Ast::new();
        let m1 = ast.ident(loc(), "МАКСЦЕЛ");
        let m2 = ast.ident(loc(), "МАКСВЕЩ");
        let mut root = ast.block(loc(), vec![m1, m2]);
        pre_resolution_transform(&mut ast, &mut root).unwrap();
        let stmts = match &ast.node(root).kind {
            NodeKind::Block { stmts, .. } => stmts.clone(),
            _ => unreachable!(),
        };
        assert!(matches!(
            ast.node(stmts[0]).kind,
            NodeKind::Number(Number::Int(i64::MAX))
        ));
        match ast.node(stmts[1]).kind {
            NodeKind::Number(Number::Float(f)) => assert_eq!(f, f64::MAX),
            ref other => panic!("expected float literal, got {:?}", other),
        }
    }

    #[test]
    fn unicode_intrinsics_become_casts() {
        let mut ast = Ast::new();
        let arg = ast.int(loc(), 65);
        let call = ast.call_named(loc(), "юнисимвол", vec![arg]);
        let mut root = ast.block(loc(), vec![call]);
        pre_resolution_transform(&mut ast, &mut root).unwrap();
        let stmts = match &ast.node(root).kind {
            NodeKind::Block { stmts, .. } => stmts.clone(),
            _ => unreachable!(),
        };
        match &ast.node(stmts[0]).kind {
            NodeKind::Cast { to, .. } => assert!(to.is_symbol()),
            other => panic!("expected cast, got {:?}", other),
        }
    }

    #[test]
    fn assert_desugars_to_ensure_with_source_text() {
        let mut ast = Ast::new();
        let a = ast.ident(loc(), "a");
        let two = ast.int(loc(), 2);
        let cmp = ast.binary(loc(), op::LT, a, two);
        let assert_node = ast.assert_stmt(loc(), cmp);
        let mut root = ast.block(loc(), vec![assert_node]);
        pre_resolution_transform(&mut ast, &mut root).unwrap();
        let stmts = match &ast.node(root).kind {
            NodeKind::Block { stmts, .. } => stmts.clone(),
            _ => unreachable!(),
        };
        let (callee, args) = match &ast.node(stmts[0]).kind {
            NodeKind::Call { callee, args } => (*callee, args.clone()),
            other => panic!("expected call, got {:?}", other),
        };
        assert!(matches!(
            &ast.node(callee).kind,
            NodeKind::Ident { name } if name == "__ensure"
        ));
        assert_eq!(args[0], cmp);
        match &ast.node(args[1]).kind {
            NodeKind::StringLit { value } => assert_eq!(value, "a < 2"),
            other => panic!("expected message literal, got {:?}", other),
        }
    }

    #[test]
    fn vars_blocks_are_spliced() {
        let mut ast = Ast::new();
        let v1 = ast.var_decl(loc(), "a", Type::int());
        let v2 = ast.var_decl(loc(), "b", Type::int());
        let vb = ast.vars_block(loc(), vec![v1, v2]);
        let tail = ast.int(loc(), 0);
        let mut root = ast.block(loc(), vec![vb, tail]);
        pre_resolution_transform(&mut ast, &mut root).unwrap();
        let stmts = match &ast.node(root).kind {
            NodeKind::Block { stmts, .. } => stmts.clone(),
            _ => unreachable!(),
        };
        assert_eq!(stmts, vec![v1, v2, tail]);
    }

    #[test]
    fn zero_arg_function_reference_becomes_call() {
        let mut ast = Ast::new();
        let body = ast.block(loc(), vec![]);
        let f = ast.fun_decl(loc(), "готово", vec![], body, Type::int());
        let d = ast.var_decl(loc(), "x", Type::int());
        let use_f = ast.ident(loc(), "готово");
        let asg = ast.assign(loc(), "x", use_f);
        let mut root = ast.block(loc(), vec![f, d, asg]);
        let mut r = Resolver::new();
        r.resolve(&mut ast, root).unwrap();
        post_resolution_transform(&mut ast, &mut root, &mut r).unwrap();
        let value = match &ast.node(asg).kind {
            NodeKind::Assign { value, .. } => *value,
            _ => unreachable!(),
        };
        match &ast.node(value).kind {
            NodeKind::Call { callee, args } => {
                assert_eq!(*callee, use_f);
                assert!(args.is_empty());
            }
            other => panic!("expected call wrap, got {:?}", other),
        }
    }

    #[test]
    fn explicit_calls_are_not_rewrapped() {
        let mut ast = Ast::new();
        let body = ast.block(loc(), vec![]);
        let f = ast.fun_decl(loc(), "готово", vec![], body, Type::int());
        let d = ast.var_decl(loc(), "x", Type::int());
        let call = ast.call_named(loc(), "готово", vec![]);
        let asg = ast.assign(loc(), "x", call);
        let mut root = ast.block(loc(), vec![f, d, asg]);
        let mut r = Resolver::new();
        r.resolve(&mut ast, root).unwrap();
        post_resolution_transform(&mut ast, &mut root, &mut r).unwrap();
        let value = match &ast.node(asg).kind {
            NodeKind::Assign { value, .. } => *value,
            _ => unreachable!(),
        };
        // Still the same single call, callee untouched.
        assert_eq!(value, call);
        match &ast.node(value).kind {
            NodeKind::Call { callee, .. } => {
                assert!(matches!(ast.node(*callee).kind, NodeKind::Ident { .. }));
            }
            other => panic!("expected original call, got {:?}", other),
        }
    }

    #[test]
    fn array_declaration_expands_hidden_bounds() {
        let mut ast = Ast::new();
        let lo0 = ast.int(loc(), 1);
        let hi0 = ast.int(loc(), 3);
        let lo1 = ast.int(loc(), 1);
        let hi1 = ast.int(loc(), 4);
        let decl = ast.var_decl_bounded(
            loc(),
            "a",
            Type::array(Type::int(), 2),
            vec![(lo0, hi0), (lo1, hi1)],
        );
        let body = ast.block(loc(), vec![decl]);
        let f = ast.fun_decl(loc(), "ф", vec![], body, Type::void());
        let mut root = ast.block(loc(), vec![f]);
        let mut r = Resolver::new();
        r.resolve(&mut ast, root).unwrap();
        post_resolution_transform(&mut ast, &mut root, &mut r).unwrap();

        let fun_scope = match &ast.node(f).kind {
            NodeKind::FunDecl(d) => d.scope.unwrap(),
            _ => unreachable!(),
        };
        for hidden in [
            "$$a_lbound0",
            "$$a_dimsize0",
            "$$a_mulacc0",
            "$$a_lbound1",
            "$$a_dimsize1",
            "$$a_mulacc1",
        ] {
            assert!(
                r.lookup(hidden, fun_scope).is_some(),
                "missing hidden variable {}",
                hidden
            );
        }
        // The bounds were consumed.
        assert!(matches!(
            &ast.node(decl).kind,
            NodeKind::VarDecl { bounds, .. } if bounds.is_empty()
        ));
        // The wrapping block skips destructors and ends with the array
        // declaration itself.
        let wrapper = match &ast.node(body).kind {
            NodeKind::Block { stmts, .. } => stmts[0],
            _ => unreachable!(),
        };
        match &ast.node(wrapper).kind {
            NodeKind::Block {
                stmts,
                skip_destructors,
                ..
            } => {
                assert!(skip_destructors);
                assert_eq!(*stmts.last().unwrap(), decl);
            }
            other => panic!("expected wrapper block, got {:?}", other),
        }
    }

    #[test]
    fn string_concat_rewrites_after_annotation() {
        let mut ast = Ast::new();
        let d = ast.var_decl(loc(), "s", Type::string());
        let a = ast.string_lit(loc(), "a");
        let b = ast.string_lit(loc(), "b");
        let sum = ast.binary(loc(), op::ADD, a, b);
        let asg = ast.assign(loc(), "s", sum);
        let mut root = ast.block(loc(), vec![d, asg]);
        let mut r = prepared_resolver(&mut ast);
        pipeline(&mut ast, &mut root, &mut r).unwrap();
        let value = match &ast.node(asg).kind {
            NodeKind::Assign { value, .. } => *value,
            _ => unreachable!(),
        };
        match &ast.node(value).kind {
            NodeKind::Call { callee, args } => {
                assert!(matches!(
                    &ast.node(*callee).kind,
                    NodeKind::Ident { name } if name == "str_concat"
                ));
                assert_eq!(args.len(), 2);
            }
            other => panic!("expected str_concat call, got {:?}", other),
        }
    }

    #[test]
    fn power_rewrites_by_base_type() {
        let mut ast = Ast::new();
        let di = ast.var_decl(loc(), "i", Type::int());
        let df = ast.var_decl(loc(), "f", Type::float());
        let i1 = ast.ident(loc(), "i");
        let two = ast.int(loc(), 2);
        let ipow = ast.binary(loc(), op::POW, i1, two);
        let iasg = ast.assign(loc(), "i", ipow);
        let f1 = ast.ident(loc(), "f");
        let three = ast.int(loc(), 3);
        let fp = ast.binary(loc(), op::POW, f1, three);
        let fasg = ast.assign(loc(), "f", fp);
        let mut root = ast.block(loc(), vec![di, df, iasg, fasg]);
        let mut r = prepared_resolver(&mut ast);
        pipeline(&mut ast, &mut root, &mut r).unwrap();

        let callee_name = |ast: &Ast, asg: NodeId| -> String {
            let value = match &ast.node(asg).kind {
                NodeKind::Assign { value, .. } => *value,
                _ => unreachable!(),
            };
            match &ast.node(value).kind {
                NodeKind::Call { callee, .. } => match &ast.node(*callee).kind {
                    NodeKind::Ident { name } => name.clone(),
                    _ => unreachable!(),
                },
                other => panic!("expected power call, got {:?}", other),
            }
        };
        assert_eq!(callee_name(&ast, iasg), "fpow");
        assert_eq!(callee_name(&ast, fasg), "pow");
    }

    #[test]
    fn output_desugars_into_typed_calls() {
        let mut ast = Ast::new();
        let di = ast.var_decl(loc(), "i", Type::int());
        let ds = ast.var_decl(loc(), "s", Type::string());
        let i1 = ast.ident(loc(), "i");
        let s1 = ast.ident(loc(), "s");
        let out = ast.output(loc(), vec![i1, s1]);
        let mut root = ast.block(loc(), vec![di, ds, out]);
        let mut r = prepared_resolver(&mut ast);
        pipeline(&mut ast, &mut root, &mut r).unwrap();

        let stmts = match &ast.node(root).kind {
            NodeKind::Block { stmts, .. } => stmts.clone(),
            _ => unreachable!(),
        };
        let block = stmts[2];
        let calls = match &ast.node(block).kind {
            NodeKind::Block { stmts, .. } => stmts.clone(),
            other => panic!("expected desugared block, got {:?}", other),
        };
        let names: Vec<String> = calls
            .iter()
            .map(|c| match &ast.node(*c).kind {
                NodeKind::Call { callee, .. } => match &ast.node(*callee).kind {
                    NodeKind::Ident { name } => name.clone(),
                    _ => unreachable!(),
                },
                other => panic!("expected call, got {:?}", other),
            })
            .collect();
        assert_eq!(names, vec!["output_int64", "output_string"]);
    }

    #[test]
    fn input_desugars_into_assignments() {
        let mut ast = Ast::new();
        let di = ast.var_decl(loc(), "i", Type::int());
        let i1 = ast.ident(loc(), "i");
        let inp = ast.input(loc(), vec![i1]);
        let mut root = ast.block(loc(), vec![di, inp]);
        let mut r = prepared_resolver(&mut ast);
        pipeline(&mut ast, &mut root, &mut r).unwrap();

        let stmts = match &ast.node(root).kind {
            NodeKind::Block { stmts, .. } => stmts.clone(),
            _ => unreachable!(),
        };
        let block = stmts[1];
        let inner = match &ast.node(block).kind {
            NodeKind::Block { stmts, .. } => stmts.clone(),
            other => panic!("expected desugared block, got {:?}", other),
        };
        match &ast.node(inner[0]).kind {
            NodeKind::Assign { name, value } => {
                assert_eq!(name, "i");
                match &ast.node(*value).kind {
                    NodeKind::Call { callee, .. } => assert!(matches!(
                        &ast.node(*callee).kind,
                        NodeKind::Ident { name } if name == "input_int64"
                    )),
                    other => panic!("expected input call, got {:?}", other),
                }
            }
            other => panic!("expected assignment, got {:?}", other),
        }
    }

    #[test]
    fn string_index_rewrites_to_symbol_at() {
        let mut ast = Ast::new();
        let ds = ast.var_decl(loc(), "s", Type::string());
        let dc = ast.var_decl(loc(), "c", Type::symbol());
        let s1 = ast.ident(loc(), "s");
        let one = ast.int(loc(), 1);
        let idx = ast.index(loc(), s1, one);
        let asg = ast.assign(loc(), "c", idx);
        let mut root = ast.block(loc(), vec![ds, dc, asg]);
        let mut r = prepared_resolver(&mut ast);
        pipeline(&mut ast, &mut root, &mut r).unwrap();
        let value = match &ast.node(asg).kind {
            NodeKind::Assign { value, .. } => *value,
            _ => unreachable!(),
        };
        match &ast.node(value).kind {
            NodeKind::Call { callee, .. } => assert!(matches!(
                &ast.node(*callee).kind,
                NodeKind::Ident { name } if name == "str_symbol_at"
            )),
            other => panic!("expected str_symbol_at call, got {:?}", other),
        }
    }

    #[test]
    fn unknown_use_module_reports_error() {
        let mut ast = Ast::new();
        let u = ast.use_module(loc(), "Чертёжник");
        let mut root = ast.block(loc(), vec![u]);
        let mut r = Resolver::new();
        let err = pipeline(&mut ast, &mut root, &mut r).unwrap_err();
        assert!(matches!(err.kind, ErrorKind::UnknownModule { .. }));
    }
}

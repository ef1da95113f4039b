//! Abstract syntax tree for Kum.
//!
//! Nodes live in a single arena owned by [`Ast`]; child relations are stored
//! as [`NodeId`] lists, which keeps shape rewrites explicit and makes
//! ownership cycles impossible. Every node carries a source location and a
//! type slot filled by the annotator.
//!
//! The construction methods on [`Ast`] are the interface the external parser
//! feeds; tests build programs through the same API.

use crate::error::SourceLoc;
use crate::op::{self, Op};
use crate::resolver::ScopeId;
use crate::types::Type;

/// Index of a node in the AST arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct NodeId(pub u32);

/// Signature of a packed native thunk usable by the stack-frame interpreter:
/// arguments and result are bit-cast to `u64`.
pub type PackedFn = fn(args: &[u64]) -> u64;

/// A numeric literal: integer or double, as written in source.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Number {
    Int(i64),
    Float(f64),
}

impl Number {
    pub fn is_float(&self) -> bool {
        matches!(self, Number::Float(_))
    }
}

/// A function declaration payload. External functions (injected by module
/// registration) have no body; their native entry is resolved through the
/// mangled name, and `packed` serves the in-process interpreter.
#[derive(Debug, Clone)]
pub struct FunDecl {
    pub name: String,
    pub mangled: String,
    /// `VarDecl` nodes, one per parameter.
    pub params: Vec<NodeId>,
    /// `Block` node; `None` for external declarations.
    pub body: Option<NodeId>,
    pub ret: Type,
    pub packed: Option<PackedFn>,
    /// Force string-literal arguments to be promoted to String objects
    /// before the call.
    pub requires_materialization: bool,
    /// The function's internal scope, filled in by the name resolver.
    pub scope: Option<ScopeId>,
}

/// Node payload, discriminated by variant.
#[derive(Debug, Clone)]
pub enum NodeKind {
    Ident {
        name: String,
    },
    Number(Number),
    StringLit {
        value: String,
    },
    Unary {
        op: Op,
        operand: NodeId,
    },
    Binary {
        op: Op,
        lhs: NodeId,
        rhs: NodeId,
    },
    Cast {
        operand: NodeId,
        to: Type,
    },
    Assign {
        name: String,
        value: NodeId,
    },
    ArrayAssign {
        name: String,
        indices: Vec<NodeId>,
        value: NodeId,
    },
    Index {
        collection: NodeId,
        index: NodeId,
    },
    MultiIndex {
        collection: NodeId,
        indices: Vec<NodeId>,
    },
    Slice {
        collection: NodeId,
        start: NodeId,
        end: NodeId,
    },
    Block {
        stmts: Vec<NodeId>,
        /// Filled in by the name resolver.
        scope: Option<ScopeId>,
        /// Transient scopes (e.g. array-bounds expansion) do not emit
        /// destructor calls on exit.
        skip_destructors: bool,
    },
    /// Transient list of declarations produced by the parser for
    /// multi-name declarations; spliced into the enclosing block before
    /// name resolution.
    VarsBlock {
        vars: Vec<NodeId>,
    },
    If {
        cond: NodeId,
        then_branch: NodeId,
        else_branch: Option<NodeId>,
    },
    /// The unified loop form. A while loop has only `pre_cond`, a
    /// repeat-until loop only `post_cond`, a counted for loop carries
    /// `pre_cond`, `pre_body` and `post_body`.
    Loop {
        pre_cond: Option<NodeId>,
        pre_body: Option<NodeId>,
        body: NodeId,
        post_body: Option<NodeId>,
        post_cond: Option<NodeId>,
    },
    Break,
    Continue,
    VarDecl {
        name: String,
        declared: Type,
        /// Array dimension bounds `[lo:hi, ...]`; consumed by the
        /// post-resolution transform.
        bounds: Vec<(NodeId, NodeId)>,
    },
    FunDecl(FunDecl),
    Call {
        callee: NodeId,
        args: Vec<NodeId>,
    },
    Input {
        args: Vec<NodeId>,
    },
    Output {
        args: Vec<NodeId>,
    },
    Assert {
        expr: NodeId,
    },
    Use {
        module: String,
    },
}

impl NodeKind {
    /// The node's children in evaluation order.
    pub fn children(&self) -> Vec<NodeId> {
        use NodeKind::*;
        match self {
            Ident { .. } | NodeKind::Number(_) | StringLit { .. } | Break | Continue
            | Use { .. } => vec![],
            Unary { operand, .. } => vec![*operand],
            Binary { lhs, rhs, .. } => vec![*lhs, *rhs],
            Cast { operand, .. } => vec![*operand],
            Assign { value, .. } => vec![*value],
            ArrayAssign { indices, value, .. } => {
                let mut out = indices.clone();
                out.push(*value);
                out
            }
            Index { collection, index } => vec![*collection, *index],
            MultiIndex {
                collection,
                indices,
            } => {
                let mut out = vec![*collection];
                out.extend(indices);
                out
            }
            Slice {
                collection,
                start,
                end,
            } => vec![*collection, *start, *end],
            Block { stmts, .. } => stmts.clone(),
            VarsBlock { vars } => vars.clone(),
            If {
                cond,
                then_branch,
                else_branch,
            } => {
                let mut out = vec![*cond, *then_branch];
                out.extend(else_branch);
                out
            }
            Loop {
                pre_cond,
                pre_body,
                body,
                post_body,
                post_cond,
            } => {
                let mut out = Vec::new();
                out.extend(pre_cond);
                out.extend(pre_body);
                out.push(*body);
                out.extend(post_body);
                out.extend(post_cond);
                out
            }
            VarDecl { bounds, .. } => bounds.iter().flat_map(|(lo, hi)| [*lo, *hi]).collect(),
            // Parameters are visited explicitly by the resolver and the
            // annotator; the generic walk sees only the body.
            FunDecl(decl) => decl.body.into_iter().collect(),
            Call { callee, args } => {
                let mut out = vec![*callee];
                out.extend(args);
                out
            }
            Input { args } | Output { args } => args.clone(),
            Assert { expr } => vec![*expr],
        }
    }

    /// Mutable slots of the node's children, in the same order as
    /// [`NodeKind::children`]. Transformers write replacements through these.
    pub fn children_mut(&mut self) -> Vec<&mut NodeId> {
        use NodeKind::*;
        match self {
            Ident { .. } | NodeKind::Number(_) | StringLit { .. } | Break | Continue
            | Use { .. } => vec![],
            Unary { operand, .. } => vec![operand],
            Binary { lhs, rhs, .. } => vec![lhs, rhs],
            Cast { operand, .. } => vec![operand],
            Assign { value, .. } => vec![value],
            ArrayAssign { indices, value, .. } => {
                let mut out: Vec<&mut NodeId> = indices.iter_mut().collect();
                out.push(value);
                out
            }
            Index { collection, index } => vec![collection, index],
            MultiIndex {
                collection,
                indices,
            } => {
                let mut out: Vec<&mut NodeId> = vec![collection];
                out.extend(indices.iter_mut());
                out
            }
            Slice {
                collection,
                start,
                end,
            } => vec![collection, start, end],
            Block { stmts, .. } => stmts.iter_mut().collect(),
            VarsBlock { vars } => vars.iter_mut().collect(),
            If {
                cond,
                then_branch,
                else_branch,
            } => {
                let mut out = vec![cond, then_branch];
                out.extend(else_branch.iter_mut());
                out
            }
            Loop {
                pre_cond,
                pre_body,
                body,
                post_body,
                post_cond,
            } => {
                let mut out: Vec<&mut NodeId> = Vec::new();
                out.extend(pre_cond.iter_mut());
                out.extend(pre_body.iter_mut());
                out.push(body);
                out.extend(post_body.iter_mut());
                out.extend(post_cond.iter_mut());
                out
            }
            VarDecl { bounds, .. } => bounds
                .iter_mut()
                .flat_map(|(lo, hi)| [lo, hi])
                .collect(),
            FunDecl(decl) => decl.body.iter_mut().collect(),
            Call { callee, args } => {
                let mut out: Vec<&mut NodeId> = vec![callee];
                out.extend(args.iter_mut());
                out
            }
            Input { args } | Output { args } => args.iter_mut().collect(),
            Assert { expr } => vec![expr],
        }
    }

    /// The variant name, used in diagnostics.
    pub fn variant(&self) -> &'static str {
        use NodeKind::*;
        match self {
            Ident { .. } => "Ident",
            NodeKind::Number(_) => "Number",
            StringLit { .. } => "StringLiteral",
            Unary { .. } => "Unary",
            Binary { .. } => "Binary",
            Cast { .. } => "Cast",
            Assign { .. } => "Assign",
            ArrayAssign { .. } => "ArrayAssign",
            Index { .. } => "Index",
            MultiIndex { .. } => "MultiIndex",
            Slice { .. } => "Slice",
            Block { .. } => "Block",
            VarsBlock { .. } => "VarsBlock",
            If { .. } => "If",
            Loop { .. } => "Loop",
            Break => "Break",
            Continue => "Continue",
            VarDecl { .. } => "Var",
            FunDecl(_) => "FunDecl",
            Call { .. } => "Call",
            Input { .. } => "Input",
            Output { .. } => "Output",
            Assert { .. } => "Assert",
            Use { .. } => "Use",
        }
    }
}

/// An AST node: location, annotated type, payload.
#[derive(Debug, Clone)]
pub struct Node {
    pub loc: SourceLoc,
    pub ty: Option<Type>,
    pub kind: NodeKind,
}

/// The node arena.
#[derive(Debug, Default)]
pub struct Ast {
    nodes: Vec<Node>,
}

impl Ast {
    pub fn new() -> Self {
        Ast::default()
    }

    pub fn add(&mut self, loc: SourceLoc, kind: NodeKind) -> NodeId {
        self.nodes.push(Node {
            loc,
            ty: None,
            kind,
        });
        NodeId(self.nodes.len() as u32 - 1)
    }

    pub fn node(&self, id: NodeId) -> &Node {
        &self.nodes[id.0 as usize]
    }

    pub fn node_mut(&mut self, id: NodeId) -> &mut Node {
        &mut self.nodes[id.0 as usize]
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    // Construction API, used by the parser and by tests.

    pub fn ident(&mut self, loc: SourceLoc, name: &str) -> NodeId {
        self.add(
            loc,
            NodeKind::Ident {
                name: name.to_string(),
            },
        )
    }

    pub fn int(&mut self, loc: SourceLoc, value: i64) -> NodeId {
        self.add(loc, NodeKind::Number(Number::Int(value)))
    }

    pub fn float(&mut self, loc: SourceLoc, value: f64) -> NodeId {
        self.add(loc, NodeKind::Number(Number::Float(value)))
    }

    pub fn string_lit(&mut self, loc: SourceLoc, value: &str) -> NodeId {
        self.add(
            loc,
            NodeKind::StringLit {
                value: value.to_string(),
            },
        )
    }

    pub fn unary(&mut self, loc: SourceLoc, op: Op, operand: NodeId) -> NodeId {
        self.add(loc, NodeKind::Unary { op, operand })
    }

    pub fn binary(&mut self, loc: SourceLoc, op: Op, lhs: NodeId, rhs: NodeId) -> NodeId {
        self.add(loc, NodeKind::Binary { op, lhs, rhs })
    }

    pub fn cast(&mut self, loc: SourceLoc, operand: NodeId, to: Type) -> NodeId {
        self.add(loc, NodeKind::Cast { operand, to })
    }

    pub fn assign(&mut self, loc: SourceLoc, name: &str, value: NodeId) -> NodeId {
        self.add(
            loc,
            NodeKind::Assign {
                name: name.to_string(),
                value,
            },
        )
    }

    pub fn array_assign(
        &mut self,
        loc: SourceLoc,
        name: &str,
        indices: Vec<NodeId>,
        value: NodeId,
    ) -> NodeId {
        self.add(
            loc,
            NodeKind::ArrayAssign {
                name: name.to_string(),
                indices,
                value,
            },
        )
    }

    pub fn index(&mut self, loc: SourceLoc, collection: NodeId, index: NodeId) -> NodeId {
        self.add(loc, NodeKind::Index { collection, index })
    }

    pub fn multi_index(
        &mut self,
        loc: SourceLoc,
        collection: NodeId,
        indices: Vec<NodeId>,
    ) -> NodeId {
        self.add(
            loc,
            NodeKind::MultiIndex {
                collection,
                indices,
            },
        )
    }

    pub fn slice(&mut self, loc: SourceLoc, collection: NodeId, start: NodeId, end: NodeId) -> NodeId {
        self.add(
            loc,
            NodeKind::Slice {
                collection,
                start,
                end,
            },
        )
    }

    pub fn block(&mut self, loc: SourceLoc, stmts: Vec<NodeId>) -> NodeId {
        self.add(
            loc,
            NodeKind::Block {
                stmts,
                scope: None,
                skip_destructors: false,
            },
        )
    }

    pub fn vars_block(&mut self, loc: SourceLoc, vars: Vec<NodeId>) -> NodeId {
        self.add(loc, NodeKind::VarsBlock { vars })
    }

    pub fn if_stmt(
        &mut self,
        loc: SourceLoc,
        cond: NodeId,
        then_branch: NodeId,
        else_branch: Option<NodeId>,
    ) -> NodeId {
        self.add(
            loc,
            NodeKind::If {
                cond,
                then_branch,
                else_branch,
            },
        )
    }

    pub fn while_loop(&mut self, loc: SourceLoc, cond: NodeId, body: NodeId) -> NodeId {
        self.add(
            loc,
            NodeKind::Loop {
                pre_cond: Some(cond),
                pre_body: None,
                body,
                post_body: None,
                post_cond: None,
            },
        )
    }

    pub fn repeat_loop(&mut self, loc: SourceLoc, body: NodeId, cond: NodeId) -> NodeId {
        self.add(
            loc,
            NodeKind::Loop {
                pre_cond: None,
                pre_body: None,
                body,
                post_body: None,
                post_cond: Some(cond),
            },
        )
    }

    pub fn for_loop(
        &mut self,
        loc: SourceLoc,
        cond: NodeId,
        pre_body: NodeId,
        body: NodeId,
        post_body: NodeId,
    ) -> NodeId {
        self.add(
            loc,
            NodeKind::Loop {
                pre_cond: Some(cond),
                pre_body: Some(pre_body),
                body,
                post_body: Some(post_body),
                post_cond: None,
            },
        )
    }

    pub fn break_stmt(&mut self, loc: SourceLoc) -> NodeId {
        self.add(loc, NodeKind::Break)
    }

    pub fn continue_stmt(&mut self, loc: SourceLoc) -> NodeId {
        self.add(loc, NodeKind::Continue)
    }

    pub fn var_decl(&mut self, loc: SourceLoc, name: &str, declared: Type) -> NodeId {
        self.add(
            loc,
            NodeKind::VarDecl {
                name: name.to_string(),
                declared,
                bounds: Vec::new(),
            },
        )
    }

    pub fn var_decl_bounded(
        &mut self,
        loc: SourceLoc,
        name: &str,
        declared: Type,
        bounds: Vec<(NodeId, NodeId)>,
    ) -> NodeId {
        self.add(
            loc,
            NodeKind::VarDecl {
                name: name.to_string(),
                declared,
                bounds,
            },
        )
    }

    pub fn fun_decl(
        &mut self,
        loc: SourceLoc,
        name: &str,
        params: Vec<NodeId>,
        body: NodeId,
        ret: Type,
    ) -> NodeId {
        self.add(
            loc,
            NodeKind::FunDecl(FunDecl {
                name: name.to_string(),
                mangled: name.to_string(),
                params,
                body: Some(body),
                ret,
                packed: None,
                requires_materialization: false,
                scope: None,
            }),
        )
    }

    /// A declaration without a body: an external function owned by a module.
    pub fn external_fun(&mut self, loc: SourceLoc, decl: FunDecl) -> NodeId {
        self.add(loc, NodeKind::FunDecl(decl))
    }

    pub fn call(&mut self, loc: SourceLoc, callee: NodeId, args: Vec<NodeId>) -> NodeId {
        self.add(loc, NodeKind::Call { callee, args })
    }

    pub fn call_named(&mut self, loc: SourceLoc, name: &str, args: Vec<NodeId>) -> NodeId {
        let callee = self.ident(loc, name);
        self.call(loc, callee, args)
    }

    pub fn input(&mut self, loc: SourceLoc, args: Vec<NodeId>) -> NodeId {
        self.add(loc, NodeKind::Input { args })
    }

    pub fn output(&mut self, loc: SourceLoc, args: Vec<NodeId>) -> NodeId {
        self.add(loc, NodeKind::Output { args })
    }

    pub fn assert_stmt(&mut self, loc: SourceLoc, expr: NodeId) -> NodeId {
        self.add(loc, NodeKind::Assert { expr })
    }

    pub fn use_module(&mut self, loc: SourceLoc, module: &str) -> NodeId {
        self.add(
            loc,
            NodeKind::Use {
                module: module.to_string(),
            },
        )
    }

    /// Render an expression back to a compact source-like form, used for
    /// assertion messages and diagnostics.
    pub fn describe(&self, id: NodeId) -> String {
        let node = self.node(id);
        use NodeKind::*;
        match &node.kind {
            Ident { name } => name.clone(),
            NodeKind::Number(crate::ast::Number::Int(v)) => v.to_string(),
            NodeKind::Number(crate::ast::Number::Float(v)) => format!("{:?}", v),
            StringLit { value } => format!("\"{}\"", value.escape_default()),
            Unary { op, operand } => format!("{}{}", op, self.describe(*operand)),
            Binary { op, lhs, rhs } => {
                format!("{} {} {}", self.describe(*lhs), op, self.describe(*rhs))
            }
            Cast { operand, to } => format!("({} as {})", self.describe(*operand), to),
            Assign { name, value } => format!("{} := {}", name, self.describe(*value)),
            ArrayAssign { name, indices, value } => {
                let idx: Vec<_> = indices.iter().map(|i| self.describe(*i)).collect();
                format!("{}[{}] := {}", name, idx.join(", "), self.describe(*value))
            }
            Index { collection, index } => {
                format!("{}[{}]", self.describe(*collection), self.describe(*index))
            }
            MultiIndex {
                collection,
                indices,
            } => {
                let idx: Vec<_> = indices.iter().map(|i| self.describe(*i)).collect();
                format!("{}[{}]", self.describe(*collection), idx.join(", "))
            }
            Slice {
                collection,
                start,
                end,
            } => format!(
                "{}[{}:{}]",
                self.describe(*collection),
                self.describe(*start),
                self.describe(*end)
            ),
            Call { callee, args } => {
                let a: Vec<_> = args.iter().map(|i| self.describe(*i)).collect();
                format!("{}({})", self.describe(*callee), a.join(", "))
            }
            VarDecl { name, .. } => format!("var {}", name),
            other => other.variant().to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::op;

    fn loc() -> SourceLoc {
        SourceLoc::new(1, 1)
    }

    #[test]
    fn children_cover_binary() {
        let mut ast = Ast::new();
        let a = ast.ident(loc(), "a");
        let b = ast.ident(loc(), "b");
        let bin = ast.binary(loc(), op::ADD, a, b);
        assert_eq!(ast.node(bin).kind.children(), vec![a, b]);
    }

    #[test]
    fn children_mut_matches_children_order() {
        let mut ast = Ast::new();
        let c = ast.ident(loc(), "c");
        let t = ast.block(loc(), vec![]);
        let e = ast.block(loc(), vec![]);
        let stmt = ast.if_stmt(loc(), c, t, Some(e));
        let expected = ast.node(stmt).kind.children();
        let got: Vec<NodeId> = ast
            .node_mut(stmt)
            .kind
            .children_mut()
            .into_iter()
            .map(|slot| *slot)
            .collect();
        assert_eq!(got, expected);
    }

    #[test]
    fn loop_children_skip_absent_parts() {
        let mut ast = Ast::new();
        let c = ast.ident(loc(), "c");
        let body = ast.block(loc(), vec![]);
        let l = ast.while_loop(loc(), c, body);
        assert_eq!(ast.node(l).kind.children(), vec![c, body]);
    }

    #[test]
    fn var_decl_children_are_bound_exprs() {
        let mut ast = Ast::new();
        let lo = ast.int(loc(), 1);
        let hi = ast.ident(loc(), "n");
        let v = ast.var_decl_bounded(loc(), "a", Type::array(Type::int(), 1), vec![(lo, hi)]);
        assert_eq!(ast.node(v).kind.children(), vec![lo, hi]);
    }

    #[test]
    fn describe_renders_expressions() {
        let mut ast = Ast::new();
        let a = ast.ident(loc(), "a");
        let b = ast.int(loc(), 2);
        let cmp = ast.binary(loc(), op::LT, a, b);
        assert_eq!(ast.describe(cmp), "a < 2");
    }
}

//! Loop lowering.
//!
//! The unified loop node covers three shapes:
//!
//! * while (pre-condition only): entry -> cond -> (cmp body/end) -> body ->
//!   jmp cond -> end; break targets end, continue targets cond;
//! * repeat-until (post-condition only): entry -> body -> cond ->
//!   (cmp body/end) -> end; break targets end, continue targets cond;
//! * for (pre-condition with pre/post bodies): entry -> cond -> (cmp
//!   pre/end) -> pre -> body -> post -> jmp cond -> end; break targets
//!   end, continue targets post (and cond within the post body).

use super::{BlockScope, Lowerer, Value};
use crate::ast::{NodeId, NodeKind};
use crate::error::{Error, ErrorKind};
use crate::ir::Operand;
use crate::op;

impl Lowerer<'_> {
    pub(crate) fn lower_loop(&mut self, id: NodeId, scope: &BlockScope) -> Result<Value, Error> {
        let (pre_cond, pre_body, body, post_body, post_cond) = match &self.ast.node(id).kind {
            NodeKind::Loop {
                pre_cond,
                pre_body,
                body,
                post_body,
                post_cond,
            } => (*pre_cond, *pre_body, *body, *post_body, *post_cond),
            _ => unreachable!("lower_loop on non-loop"),
        };
        if pre_body.is_none() && post_body.is_none() && post_cond.is_none() {
            return self.lower_while(id, pre_cond, body, scope);
        }
        if pre_body.is_none() && post_body.is_none() && pre_cond.is_none() {
            return self.lower_repeat(id, body, post_cond, scope);
        }
        self.lower_for(id, pre_cond, pre_body, body, post_body, scope)
    }

    fn lower_while(
        &mut self,
        id: NodeId,
        pre_cond: Option<NodeId>,
        body: NodeId,
        scope: &BlockScope,
    ) -> Result<Value, Error> {
        let loc = self.ast.node(id).loc;
        let Some(pre_cond) = pre_cond else {
            return Err(Error::new(
                loc,
                ErrorKind::NotImplemented {
                    what: "loop without any condition".to_string(),
                },
            ));
        };
        let entry = self.builder.current_block_index();
        let (cond_label, cond_idx) = self.builder.new_block();
        let (body_label, body_idx) = self.builder.new_block();
        // Reserve the end label now; its block is materialized last.
        let end = self.builder.new_label();

        self.builder.select_block(entry);
        self.builder
            .emit_void(op::JMP, &[Operand::Label(cond_label)]);

        self.builder.select_block(cond_idx);
        let cond = self.lower(pre_cond, scope)?;
        let Some(c) = cond.value else {
            return Err(Error::new(
                self.ast.node(pre_cond).loc,
                ErrorKind::UntypedExpression {
                    what: self.ast.describe(pre_cond),
                },
            ));
        };
        self.builder.emit_void(
            op::CMP,
            &[c, Operand::Label(body_label), Operand::Label(end)],
        );

        self.builder.select_block(body_idx);
        self.lower(body, &scope.with_loop(end, cond_label))?;
        if !self.builder.is_terminated() {
            self.builder
                .emit_void(op::JMP, &[Operand::Label(cond_label)]);
        }

        self.builder.new_block_with(end);
        Ok(Value::none(self.builder.current_block_label()))
    }

    fn lower_repeat(
        &mut self,
        id: NodeId,
        body: NodeId,
        post_cond: Option<NodeId>,
        scope: &BlockScope,
    ) -> Result<Value, Error> {
        let loc = self.ast.node(id).loc;
        let Some(post_cond) = post_cond else {
            return Err(Error::new(
                loc,
                ErrorKind::NotImplemented {
                    what: "loop without any condition".to_string(),
                },
            ));
        };
        let entry = self.builder.current_block_index();
        let (body_label, body_idx) = self.builder.new_block();
        let (cond_label, cond_idx) = self.builder.new_block();
        let end = self.builder.new_label();

        // The body executes at least once.
        self.builder.select_block(entry);
        self.builder
            .emit_void(op::JMP, &[Operand::Label(body_label)]);

        self.builder.select_block(body_idx);
        self.lower(body, &scope.with_loop(end, cond_label))?;
        if !self.builder.is_terminated() {
            self.builder
                .emit_void(op::JMP, &[Operand::Label(cond_label)]);
        }

        self.builder.select_block(cond_idx);
        let cond = self.lower(post_cond, scope)?;
        let Some(c) = cond.value else {
            return Err(Error::new(
                self.ast.node(post_cond).loc,
                ErrorKind::UntypedExpression {
                    what: self.ast.describe(post_cond),
                },
            ));
        };
        self.builder.emit_void(
            op::CMP,
            &[c, Operand::Label(body_label), Operand::Label(end)],
        );

        self.builder.new_block_with(end);
        Ok(Value::none(self.builder.current_block_label()))
    }

    fn lower_for(
        &mut self,
        id: NodeId,
        pre_cond: Option<NodeId>,
        pre_body: Option<NodeId>,
        body: NodeId,
        post_body: Option<NodeId>,
        scope: &BlockScope,
    ) -> Result<Value, Error> {
        let loc = self.ast.node(id).loc;
        let missing = |what: &str| {
            Error::new(
                loc,
                ErrorKind::NotImplemented {
                    what: format!("counted loop without a {}", what),
                },
            )
        };
        let pre_cond = pre_cond.ok_or_else(|| missing("condition"))?;
        let pre_body = pre_body.ok_or_else(|| missing("pre-body"))?;
        let post_body = post_body.ok_or_else(|| missing("post-body"))?;

        let entry = self.builder.current_block_index();
        let (cond_label, cond_idx) = self.builder.new_block();
        let (pre_label, pre_idx) = self.builder.new_block();
        let (body_label, body_idx) = self.builder.new_block();
        let (post_label, post_idx) = self.builder.new_block();
        let end = self.builder.new_label();

        self.builder.select_block(entry);
        self.builder
            .emit_void(op::JMP, &[Operand::Label(cond_label)]);

        self.builder.select_block(cond_idx);
        let cond = self.lower(pre_cond, scope)?;
        let Some(c) = cond.value else {
            return Err(Error::new(
                self.ast.node(pre_cond).loc,
                ErrorKind::UntypedExpression {
                    what: self.ast.describe(pre_cond),
                },
            ));
        };
        self.builder.emit_void(
            op::CMP,
            &[c, Operand::Label(pre_label), Operand::Label(end)],
        );

        self.builder.select_block(pre_idx);
        self.lower(pre_body, &scope.with_loop(end, post_label))?;
        if !self.builder.is_terminated() {
            self.builder
                .emit_void(op::JMP, &[Operand::Label(body_label)]);
        }

        self.builder.select_block(body_idx);
        self.lower(body, &scope.with_loop(end, post_label))?;
        if !self.builder.is_terminated() {
            self.builder
                .emit_void(op::JMP, &[Operand::Label(post_label)]);
        }

        // Inside the post body, continue proceeds to the condition.
        self.builder.select_block(post_idx);
        self.lower(post_body, &scope.with_loop(end, cond_label))?;
        if !self.builder.is_terminated() {
            self.builder
                .emit_void(op::JMP, &[Operand::Label(cond_label)]);
        }

        self.builder.new_block_with(end);
        Ok(Value::none(self.builder.current_block_label()))
    }
}

//! IR builder.
//!
//! The builder owns the [`Module`] while it is under construction and keeps
//! a cursor over the current function and block. The lowerer drives it and
//! calls [`Builder::finish`] to take the completed module.

use super::{
    Block, Function, Imm, Instr, Label, Local, Module, Operand, Slot, Tmp, TypeId, TypeTable,
};
use crate::op::{self, Op};
use crate::resolver::SymbolId;

#[derive(Debug)]
pub struct Builder {
    module: Module,
    cur_func: usize,
    cur_block: usize,
}

impl Builder {
    pub fn new(module: Module) -> Self {
        Builder {
            module,
            cur_func: 0,
            cur_block: 0,
        }
    }

    /// Take the finished module.
    pub fn finish(self) -> Module {
        self.module
    }

    pub fn module(&self) -> &Module {
        &self.module
    }

    pub fn module_mut(&mut self) -> &mut Module {
        &mut self.module
    }

    pub fn types_mut(&mut self) -> &mut TypeTable {
        &mut self.module.types
    }

    fn func(&self) -> &Function {
        &self.module.functions[self.cur_func]
    }

    fn func_mut(&mut self) -> &mut Function {
        &mut self.module.functions[self.cur_func]
    }

    /// Create a function, or redefine an existing one in place: a function
    /// redefined under the same symbol id keeps its index (so references by
    /// symbol stay valid) and bumps its generation counter.
    pub fn new_function(
        &mut self,
        name: &str,
        arg_locals: Vec<Local>,
        sym_id: Option<SymbolId>,
    ) -> usize {
        let existing = sym_id.and_then(|s| self.module.fn_by_symbol.get(&s).copied());
        let idx = match existing {
            Some(idx) => {
                let generation = self.module.functions[idx].generation + 1;
                self.module.functions[idx] = Function {
                    name: name.to_string(),
                    arg_locals,
                    sym_id,
                    generation,
                    ..Function::default()
                };
                idx
            }
            None => {
                self.module.functions.push(Function {
                    name: name.to_string(),
                    arg_locals,
                    sym_id,
                    ..Function::default()
                });
                let idx = self.module.functions.len() - 1;
                if let Some(s) = sym_id {
                    self.module.fn_by_symbol.insert(s, idx);
                }
                idx
            }
        };
        self.cur_func = idx;
        self.new_block();
        idx
    }

    /// Append a block with a fresh label, making it current.
    pub fn new_block(&mut self) -> (Label, usize) {
        let label = self.func_mut().fresh_label();
        (label, self.new_block_with(label))
    }

    /// Append a block with a pre-reserved label, making it current.
    pub fn new_block_with(&mut self, label: Label) -> usize {
        let f = self.func_mut();
        f.blocks.push(Block::new(label));
        let idx = f.blocks.len() - 1;
        f.label_to_block.insert(label, idx);
        self.cur_block = idx;
        idx
    }

    /// Reserve a label without creating its block yet.
    pub fn new_label(&mut self) -> Label {
        self.func_mut().fresh_label()
    }

    pub fn current_function_index(&self) -> usize {
        self.cur_func
    }

    pub fn current_block_index(&self) -> usize {
        self.cur_block
    }

    pub fn current_block_label(&self) -> Label {
        self.func().blocks[self.cur_block].label
    }

    pub fn select_function(&mut self, idx: usize) {
        self.cur_func = idx;
        self.cur_block = self.module.functions[idx].blocks.len().saturating_sub(1);
    }

    pub fn select_block(&mut self, idx: usize) {
        self.cur_block = idx;
    }

    pub fn select_block_label(&mut self, label: Label) {
        if let Some(idx) = self.func().block_index(label) {
            self.cur_block = idx;
        }
    }

    /// Emit an instruction producing a fresh destination temporary.
    pub fn emit(&mut self, op: Op, operands: &[Operand]) -> Tmp {
        let t = self.func_mut().fresh_tmp();
        let instr = Instr::new(op, Some(t), operands.to_vec());
        let block = self.cur_block;
        self.func_mut().blocks[block].instrs.push(instr);
        t
    }

    /// Emit an instruction without a destination.
    pub fn emit_void(&mut self, op: Op, operands: &[Operand]) {
        let instr = Instr::new(op, None, operands.to_vec());
        let block = self.cur_block;
        self.func_mut().blocks[block].instrs.push(instr);
    }

    /// Does the current block already end in a control transfer?
    pub fn is_terminated(&self) -> bool {
        match self.func().blocks[self.cur_block].instrs.last() {
            Some(last) => last.op == op::JMP || last.op == op::RET || last.op == op::CMP,
            None => false,
        }
    }

    pub fn set_tmp_type(&mut self, tmp: Tmp, ty: TypeId) {
        self.func_mut().set_tmp_type(tmp, ty);
    }

    pub fn tmp_type(&self, tmp: Tmp) -> Option<TypeId> {
        self.func().tmp_type(tmp)
    }

    pub fn set_local_type(&mut self, local: Local, ty: TypeId) {
        self.func_mut().set_local_type(local, ty);
    }

    pub fn set_slot_type(&mut self, slot: Slot, ty: TypeId) {
        self.module.set_slot_type(slot, ty);
    }

    pub fn set_return_type(&mut self, ty: TypeId) {
        self.func_mut().ret_type = Some(ty);
    }

    /// Give two temporaries their common numeric type, when they disagree.
    pub fn unify_tmp_types(&mut self, left: Tmp, right: Tmp) {
        let (Some(lt), Some(rt)) = (self.tmp_type(left), self.tmp_type(right)) else {
            return;
        };
        if lt == rt {
            return;
        }
        if let Some(unified) = self.module.types.unify(lt, rt) {
            self.set_tmp_type(left, unified);
            self.set_tmp_type(right, unified);
        }
    }

    pub fn intern_string(&mut self, value: &str) -> usize {
        self.module.intern_string(value)
    }

    /// Shorthand for an immediate operand.
    pub fn imm(value: i64, ty: TypeId) -> Operand {
        Operand::Imm(Imm::int(value, ty))
    }
}

impl Default for Builder {
    fn default() -> Self {
        Builder::new(Module::new())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::Kind;

    #[test]
    fn new_function_starts_with_entry_block() {
        let mut b = Builder::default();
        b.new_function("f", vec![], Some(SymbolId(0)));
        assert_eq!(b.module().functions.len(), 1);
        assert_eq!(b.module().functions[0].blocks.len(), 1);
        assert_eq!(b.current_block_label(), Label(0));
    }

    #[test]
    fn redefinition_keeps_index_and_bumps_generation() {
        let mut b = Builder::default();
        let first = b.new_function("f", vec![], Some(SymbolId(7)));
        b.emit_void(op::RET, &[]);
        let second = b.new_function("f", vec![], Some(SymbolId(7)));
        assert_eq!(first, second);
        assert_eq!(b.module().functions[first].generation, 1);
        assert!(b.module().functions[first].blocks[0].instrs.is_empty());
    }

    #[test]
    fn emit_allocates_monotonic_tmps() {
        let mut b = Builder::default();
        b.new_function("f", vec![], None);
        let i64t = b.types_mut().primitive(Kind::I64);
        let t0 = b.emit(op::ADD, &[Builder::imm(1, i64t), Builder::imm(2, i64t)]);
        let t1 = b.emit(op::ADD, &[Operand::Tmp(t0), Builder::imm(3, i64t)]);
        assert_eq!(t0, Tmp(0));
        assert_eq!(t1, Tmp(1));
    }

    #[test]
    fn termination_detects_all_terminators() {
        let mut b = Builder::default();
        b.new_function("f", vec![], None);
        assert!(!b.is_terminated());
        b.emit_void(op::RET, &[]);
        assert!(b.is_terminated());
        let (label, _) = b.new_block();
        assert!(!b.is_terminated());
        b.emit_void(op::JMP, &[Operand::Label(label)]);
        assert!(b.is_terminated());
    }

    #[test]
    fn labels_can_be_reserved_and_materialized_later() {
        let mut b = Builder::default();
        b.new_function("f", vec![], None);
        let end = b.new_label();
        let (cond, _) = b.new_block();
        b.new_block_with(end);
        assert_ne!(end, cond);
        let f = &b.module().functions[0];
        assert_eq!(f.block_index(end), Some(2));
    }
}

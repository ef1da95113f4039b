//! Three-address, block-structured intermediate representation.
//!
//! A [`Module`] owns functions, external-function declarations, module
//! slots, the interned string-literal pool and the shared [`TypeTable`].
//! Each function is a list of basic blocks; each block an optional φ list
//! and an instruction list. Operands are a tagged sum over temporaries,
//! locals, module slots, immediates and block labels.
//!
//! Opcodes reuse the packed operator encoding of [`crate::op`]; that
//! encoding is the IR's stable interchange format with the backends.

pub mod builder;
pub mod types;

pub use builder::Builder;
pub use types::{Kind, TypeId, TypeTable};

use crate::ast::PackedFn;
use crate::op::{self, Op};
use crate::resolver::SymbolId;
use std::collections::HashMap;
use std::fmt::Write as _;

/// Name of the synthetic function holding global initialization.
pub const MODULE_CONSTRUCTOR: &str = "$$module_constructor";
/// Name of the synthetic function holding global teardown.
pub const MODULE_DESTRUCTOR: &str = "$$module_destructor";

/// A single-assignment temporary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Tmp(pub u32);

/// A module-global addressable location.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Slot(pub u32);

/// A function-scoped addressable location.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Local(pub u32);

/// A basic-block label, unique within its function.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Label(pub u32);

/// An immediate: a signed 64-bit bit pattern plus its type.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Imm {
    pub value: i64,
    pub ty: Option<TypeId>,
}

impl Imm {
    pub fn int(value: i64, ty: TypeId) -> Self {
        Imm {
            value,
            ty: Some(ty),
        }
    }

    /// An untyped immediate (e.g. a callee symbol id).
    pub fn raw(value: i64) -> Self {
        Imm { value, ty: None }
    }
}

/// Instruction operand.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Operand {
    Tmp(Tmp),
    Slot(Slot),
    Local(Local),
    Imm(Imm),
    Label(Label),
}

impl Operand {
    pub fn as_tmp(&self) -> Option<Tmp> {
        match self {
            Operand::Tmp(t) => Some(*t),
            _ => None,
        }
    }

    pub fn as_label(&self) -> Option<Label> {
        match self {
            Operand::Label(l) => Some(*l),
            _ => None,
        }
    }

    pub fn as_imm(&self) -> Option<Imm> {
        match self {
            Operand::Imm(i) => Some(*i),
            _ => None,
        }
    }
}

/// A three-address instruction: opcode, optional destination temporary, up
/// to four operands.
#[derive(Debug, Clone, PartialEq)]
pub struct Instr {
    pub op: Op,
    pub dest: Option<Tmp>,
    pub operands: Vec<Operand>,
}

impl Instr {
    pub fn new(op: Op, dest: Option<Tmp>, operands: Vec<Operand>) -> Self {
        Instr { op, dest, operands }
    }

    /// Turn the instruction into a no-op; passes compact these out later.
    pub fn clear(&mut self) {
        self.op = op::NOP;
        self.dest = None;
        self.operands.clear();
    }

    pub fn is_nop(&self) -> bool {
        self.op == op::NOP
    }
}

/// A φ-instruction: operands alternate `value, incoming-label`.
#[derive(Debug, Clone, PartialEq)]
pub struct Phi {
    pub op: Op,
    pub dest: Option<Tmp>,
    pub operands: Vec<Operand>,
}

impl Phi {
    pub fn clear(&mut self) {
        self.op = op::NOP;
        self.dest = None;
        self.operands.clear();
    }

    pub fn is_nop(&self) -> bool {
        self.op == op::NOP
    }

    /// Iterate `(value, incoming-label)` pairs.
    pub fn incoming(&self) -> impl Iterator<Item = (Operand, Label)> + '_ {
        self.operands.chunks_exact(2).filter_map(|pair| {
            let label = pair[1].as_label()?;
            Some((pair[0], label))
        })
    }
}

/// A basic block: label, optional φ list, instructions, and the CFG edge
/// sets filled in by the CFG pass.
#[derive(Debug, Clone, Default)]
pub struct Block {
    pub label: Label,
    pub phis: Vec<Phi>,
    pub instrs: Vec<Instr>,
    pub succ: Vec<Label>,
    pub pred: Vec<Label>,
}

impl Default for Label {
    fn default() -> Self {
        Label(0)
    }
}

impl Block {
    pub fn new(label: Label) -> Self {
        Block {
            label,
            ..Block::default()
        }
    }

    pub fn terminator(&self) -> Option<&Instr> {
        self.instrs.last().filter(|i| {
            i.op == op::JMP || i.op == op::CMP || i.op == op::RET
        })
    }
}

/// An external function, injected by module registration.
#[derive(Debug, Clone)]
pub struct ExternalFunction {
    pub name: String,
    /// ASCII symbol used by the native backend.
    pub mangled: String,
    pub param_types: Vec<TypeId>,
    pub ret_type: TypeId,
    /// Thunk for the stack-frame interpreter.
    pub packed: Option<PackedFn>,
    pub sym_id: SymbolId,
}

/// An IR function.
#[derive(Debug, Default)]
pub struct Function {
    pub name: String,
    /// Parameter locals, in declaration order; they occupy the first
    /// function-local indices.
    pub arg_locals: Vec<Local>,
    pub blocks: Vec<Block>,
    /// Local index -> type.
    pub local_types: Vec<Option<TypeId>>,
    /// Temporary index -> type.
    pub tmp_types: Vec<Option<TypeId>>,
    pub ret_type: Option<TypeId>,
    /// Absent for synthetic functions (module constructor/destructor).
    pub sym_id: Option<SymbolId>,
    /// Bumped on redefinition, so a backend doing incremental emission can
    /// skip functions it has already seen.
    pub generation: u32,
    pub next_tmp: u32,
    pub next_label: u32,
    /// Label -> block index, maintained on block creation.
    pub label_to_block: HashMap<Label, usize>,
}

impl Function {
    pub fn block_index(&self, label: Label) -> Option<usize> {
        self.label_to_block.get(&label).copied()
    }

    pub fn fresh_tmp(&mut self) -> Tmp {
        let t = Tmp(self.next_tmp);
        self.next_tmp += 1;
        t
    }

    pub fn fresh_label(&mut self) -> Label {
        let l = Label(self.next_label);
        self.next_label += 1;
        l
    }

    pub fn tmp_type(&self, tmp: Tmp) -> Option<TypeId> {
        self.tmp_types.get(tmp.0 as usize).copied().flatten()
    }

    pub fn set_tmp_type(&mut self, tmp: Tmp, ty: TypeId) {
        let idx = tmp.0 as usize;
        if idx >= self.tmp_types.len() {
            self.tmp_types.resize(idx + 1, None);
        }
        self.tmp_types[idx] = Some(ty);
    }

    pub fn local_type(&self, local: Local) -> Option<TypeId> {
        self.local_types.get(local.0 as usize).copied().flatten()
    }

    pub fn set_local_type(&mut self, local: Local, ty: TypeId) {
        let idx = local.0 as usize;
        if idx >= self.local_types.len() {
            self.local_types.resize(idx + 1, None);
        }
        self.local_types[idx] = Some(ty);
    }

    /// Is `local` a parameter? Parameters occupy the first local indices
    /// and keep memory semantics through the SSA pass.
    pub fn is_param(&self, local: Local) -> bool {
        (local.0 as usize) < self.arg_locals.len()
    }

    /// Render the function for debugging and golden tests.
    pub fn print(&self, module: &Module) -> String {
        let mut out = String::new();
        let _ = write!(out, "function {} (", self.name);
        for (i, a) in self.arg_locals.iter().enumerate() {
            if i > 0 {
                out.push_str(", ");
            }
            let _ = write!(out, "local({})", a.0);
        }
        out.push_str(") { ; ");
        match self.ret_type {
            Some(t) => out.push_str(&module.types.describe(t)),
            None => out.push_str("?"),
        }
        out.push('\n');
        for block in &self.blocks {
            let _ = writeln!(out, "  block {} {{", block.label.0);
            for phi in &block.phis {
                if phi.is_nop() {
                    continue;
                }
                out.push_str("    ");
                self.print_instr_line(&mut out, module, phi.op, phi.dest, &phi.operands);
            }
            for instr in &block.instrs {
                if instr.is_nop() {
                    continue;
                }
                out.push_str("    ");
                self.print_instr_line(&mut out, module, instr.op, instr.dest, &instr.operands);
            }
            out.push_str("  }\n");
        }
        out.push_str("}\n");
        out
    }

    fn print_instr_line(
        &self,
        out: &mut String,
        module: &Module,
        op: Op,
        dest: Option<Tmp>,
        operands: &[Operand],
    ) {
        let _ = write!(out, "{} ", op);
        if let Some(d) = dest {
            self.print_operand(out, module, &Operand::Tmp(d));
            out.push_str(" = ");
        }
        for operand in operands {
            self.print_operand(out, module, operand);
            out.push(' ');
        }
        out.push('\n');
    }

    fn print_operand(&self, out: &mut String, module: &Module, operand: &Operand) {
        match operand {
            Operand::Tmp(t) => {
                let _ = write!(out, "tmp({}", t.0);
                if let Some(ty) = self.tmp_type(*t) {
                    let _ = write!(out, ",{}", module.types.describe(ty));
                }
                out.push(')');
            }
            Operand::Local(l) => {
                let _ = write!(out, "local({}", l.0);
                if let Some(ty) = self.local_type(*l) {
                    let _ = write!(out, ",{}", module.types.describe(ty));
                }
                out.push(')');
            }
            Operand::Slot(s) => {
                let _ = write!(out, "slot({}", s.0);
                if let Some(ty) = module.slot_type(*s) {
                    let _ = write!(out, ",{}", module.types.describe(ty));
                }
                out.push(')');
            }
            Operand::Imm(i) => {
                let _ = write!(out, "imm({})", i.value);
            }
            Operand::Label(l) => {
                let _ = write!(out, "label({})", l.0);
            }
        }
    }
}

/// A finalized or in-progress IR module.
#[derive(Debug, Default)]
pub struct Module {
    pub functions: Vec<Function>,
    pub externals: Vec<ExternalFunction>,
    pub fn_by_symbol: HashMap<SymbolId, usize>,
    pub ext_by_symbol: HashMap<SymbolId, usize>,
    /// Slot index -> type (slots are indexed by global symbol id).
    pub slot_types: Vec<Option<TypeId>>,
    /// Slot index -> constant initializer, when one is known.
    pub slot_values: Vec<Option<Imm>>,
    string_pool: HashMap<String, usize>,
    pub string_literals: Vec<String>,
    pub types: TypeTable,
    /// Function index of `$$module_constructor`, when one was emitted.
    pub constructor: Option<usize>,
    /// Function index of `$$module_destructor`, when one was emitted.
    pub destructor: Option<usize>,
}

impl Module {
    pub fn new() -> Self {
        Module::default()
    }

    pub fn function_by_name(&self, name: &str) -> Option<&Function> {
        self.functions.iter().find(|f| f.name == name)
    }

    /// The function the execution environment should run: `<main>` when
    /// present, else the first argument-less non-generated function.
    pub fn entry_point(&self) -> Option<&Function> {
        if let Some(f) = self.function_by_name("<main>") {
            return Some(f);
        }
        self.functions.iter().find(|f| {
            !f.name.starts_with("__") && !f.name.starts_with("$$") && f.arg_locals.is_empty()
        })
    }

    pub fn external_by_symbol(&self, sym: SymbolId) -> Option<&ExternalFunction> {
        self.ext_by_symbol.get(&sym).map(|&i| &self.externals[i])
    }

    pub fn external_by_name(&self, name: &str) -> Option<&ExternalFunction> {
        self.externals.iter().find(|e| e.name == name)
    }

    /// Intern a string literal, returning its pool id.
    pub fn intern_string(&mut self, value: &str) -> usize {
        if let Some(&id) = self.string_pool.get(value) {
            return id;
        }
        let id = self.string_literals.len();
        self.string_pool.insert(value.to_string(), id);
        self.string_literals.push(value.to_string());
        id
    }

    pub fn slot_type(&self, slot: Slot) -> Option<TypeId> {
        self.slot_types.get(slot.0 as usize).copied().flatten()
    }

    pub fn set_slot_type(&mut self, slot: Slot, ty: TypeId) {
        let idx = slot.0 as usize;
        if idx >= self.slot_types.len() {
            self.slot_types.resize(idx + 1, None);
            self.slot_values.resize(idx + 1, None);
        }
        self.slot_types[idx] = Some(ty);
    }

    pub fn set_slot_value(&mut self, slot: Slot, value: Imm) {
        let idx = slot.0 as usize;
        if idx >= self.slot_values.len() {
            self.slot_types.resize(idx + 1, None);
            self.slot_values.resize(idx + 1, None);
        }
        self.slot_values[idx] = Some(value);
    }

    pub fn print(&self) -> String {
        let mut out = String::new();
        for f in &self.functions {
            out.push_str(&f.print(self));
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn string_pool_interns() {
        let mut m = Module::new();
        let a = m.intern_string("hello");
        let b = m.intern_string("world");
        let c = m.intern_string("hello");
        assert_eq!(a, c);
        assert_ne!(a, b);
        assert_eq!(m.string_literals, vec!["hello", "world"]);
    }

    #[test]
    fn phi_incoming_pairs() {
        let phi = Phi {
            op: op::PHI,
            dest: Some(Tmp(5)),
            operands: vec![
                Operand::Tmp(Tmp(1)),
                Operand::Label(Label(0)),
                Operand::Tmp(Tmp(2)),
                Operand::Label(Label(3)),
            ],
        };
        let pairs: Vec<_> = phi.incoming().collect();
        assert_eq!(pairs.len(), 2);
        assert_eq!(pairs[0].1, Label(0));
        assert_eq!(pairs[1].1, Label(3));
    }

    #[test]
    fn cleared_instr_is_nop() {
        let mut i = Instr::new(op::ADD, Some(Tmp(0)), vec![Operand::Tmp(Tmp(1))]);
        i.clear();
        assert!(i.is_nop());
        assert!(i.dest.is_none());
        assert!(i.operands.is_empty());
    }

    #[test]
    fn entry_point_skips_generated_functions() {
        let mut m = Module::new();
        m.functions.push(Function {
            name: MODULE_CONSTRUCTOR.to_string(),
            ..Function::default()
        });
        m.functions.push(Function {
            name: "главная".to_string(),
            ..Function::default()
        });
        assert_eq!(m.entry_point().map(|f| f.name.as_str()), Some("главная"));
    }

    #[test]
    fn function_tmp_types_grow_on_demand() {
        let mut f = Function::default();
        f.set_tmp_type(Tmp(3), TypeId(0));
        assert_eq!(f.tmp_type(Tmp(3)), Some(TypeId(0)));
        assert_eq!(f.tmp_type(Tmp(1)), None);
    }
}

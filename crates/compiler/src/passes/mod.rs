//! The IR pass pipeline.
//!
//! [`optimize`] runs per function: SSA promotion of locals, constant
//! folding, register renumbering, then cleanup (null-release elimination
//! and nop compaction). [`prepare_codegen`] is the second mode run before
//! handing the module to a backend: out-of-SSA translation with
//! critical-edge splitting and parallel copies.

pub mod cfg;
pub mod const_fold;
pub mod de_ssa;
pub mod renumber;
pub mod ssa;

pub use cfg::{build_cfg, compute_rpo};
pub use const_fold::const_fold;
pub use de_ssa::de_ssa;
pub use renumber::renumber_registers;
pub use ssa::promote_locals;

use crate::error::Error;
use crate::ir::{Function, Module, Operand};
use crate::op;

/// Run the optimization pipeline on every function of the module.
pub fn optimize(module: &mut Module) -> Result<(), Error> {
    for idx in 0..module.functions.len() {
        let mut f = std::mem::take(&mut module.functions[idx]);
        let result = optimize_function(&mut f, module);
        module.functions[idx] = f;
        result?;
    }
    Ok(())
}

pub fn optimize_function(f: &mut Function, module: &mut Module) -> Result<(), Error> {
    tracing::trace!(function = %f.name, "optimizing");
    promote_locals(f, &mut module.types)?;
    const_fold(f, module)?;
    renumber_registers(f)?;
    strip_null_releases(f, module);
    compact_nops(f);
    Ok(())
}

/// De-SSA every function ahead of code generation.
pub fn prepare_codegen(module: &mut Module) -> Result<(), Error> {
    for idx in 0..module.functions.len() {
        let mut f = std::mem::take(&mut module.functions[idx]);
        let result = de_ssa(&mut f);
        module.functions[idx] = f;
        result?;
    }
    Ok(())
}

/// Remove `arg 0; call str_release` pairs: releasing a null pointer is a
/// no-op per the runtime contract, and undefined string reads fold to a
/// zero immediate.
fn strip_null_releases(f: &mut Function, module: &Module) {
    let Some(release_sym) = module
        .external_by_name("str_release")
        .map(|e| e.sym_id.0 as i64)
    else {
        return;
    };
    for block in &mut f.blocks {
        for i in 1..block.instrs.len() {
            let (head, tail) = block.instrs.split_at_mut(i);
            let prev = &mut head[i - 1];
            let instr = &mut tail[0];
            let is_release = instr.op == op::CALL
                && instr
                    .operands
                    .first()
                    .and_then(Operand::as_imm)
                    .is_some_and(|imm| imm.value == release_sym);
            let is_null_arg = prev.op == op::ARG
                && prev
                    .operands
                    .first()
                    .and_then(Operand::as_imm)
                    .is_some_and(|imm| imm.value == 0);
            if is_release && is_null_arg {
                prev.clear();
                instr.clear();
            }
        }
    }
}

/// Compact cleared instructions and φs out of every block.
fn compact_nops(f: &mut Function) {
    for block in &mut f.blocks {
        block.instrs.retain(|i| !i.is_nop());
        block.phis.retain(|p| !p.is_nop());
    }
}

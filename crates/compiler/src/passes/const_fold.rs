//! Constant folding.
//!
//! Iterates to a fixpoint per function: binary arithmetic over two
//! immediates of matching numeric kind is computed at compile time, and the
//! usual algebraic identities collapse (`x+0`, `x-0`, `0+x`, `x*1`, `1*x`,
//! `x/1` to `x`; `x*0`, `0*x` to `0`). Division by a zero immediate aborts
//! the fold of that instruction. All integer arithmetic is signed.
//!
//! Uses are discovered by a single pre-pass mapping each temporary to its
//! using instructions and φs; the map is kept current as replacements
//! rewire uses.

use crate::error::Error;
use crate::ir::{Function, Imm, Module, Operand, Tmp};
use crate::op::{self, Op};
use std::collections::HashMap;

type UseMap = HashMap<u32, Vec<(usize, usize)>>;

pub fn const_fold(f: &mut Function, module: &Module) -> Result<(), Error> {
    let mut users: UseMap = HashMap::new();
    let mut phi_users: UseMap = HashMap::new();
    for (bi, block) in f.blocks.iter().enumerate() {
        for (ii, instr) in block.instrs.iter().enumerate() {
            for operand in &instr.operands {
                if let Operand::Tmp(t) = operand {
                    users.entry(t.0).or_default().push((bi, ii));
                }
            }
        }
        for (pi, phi) in block.phis.iter().enumerate() {
            for operand in &phi.operands {
                if let Operand::Tmp(t) = operand {
                    phi_users.entry(t.0).or_default().push((bi, pi));
                }
            }
        }
    }

    let mut changed = true;
    while changed {
        changed = false;
        for bi in 0..f.blocks.len() {
            for ii in 0..f.blocks[bi].instrs.len() {
                let instr = &f.blocks[bi].instrs[ii];
                if instr.is_nop() || instr.operands.len() < 2 {
                    continue;
                }
                changed |= fold_instr(f, module, &mut users, &mut phi_users, bi, ii);
            }
        }
    }
    Ok(())
}

fn is_arith(o: Op) -> bool {
    o == op::ADD || o == op::SUB || o == op::MUL || o == op::DIV
}

fn apply_int(o: Op, a: i64, b: i64) -> Option<i64> {
    match o {
        op::ADD => Some(a.wrapping_add(b)),
        op::SUB => Some(a.wrapping_sub(b)),
        op::MUL => Some(a.wrapping_mul(b)),
        op::DIV => {
            if b == 0 {
                None
            } else {
                Some(a.wrapping_div(b))
            }
        }
        _ => None,
    }
}

fn apply_float(o: Op, a: f64, b: f64) -> Option<f64> {
    match o {
        op::ADD => Some(a + b),
        op::SUB => Some(a - b),
        op::MUL => Some(a * b),
        op::DIV => {
            if b == 0.0 {
                None
            } else {
                Some(a / b)
            }
        }
        _ => None,
    }
}

/// Rewrite every use of `tmp` to `replacement`, keeping the use maps
/// current: when the replacement is itself a temporary, the rewired users
/// become its users.
fn replace_uses(
    f: &mut Function,
    users: &mut UseMap,
    phi_users: &mut UseMap,
    tmp: Tmp,
    replacement: Operand,
) {
    if let Some(refs) = users.remove(&tmp.0) {
        for &(bi, ii) in &refs {
            for operand in &mut f.blocks[bi].instrs[ii].operands {
                if *operand == Operand::Tmp(tmp) {
                    *operand = replacement;
                }
            }
        }
        if let Operand::Tmp(new) = replacement {
            users.entry(new.0).or_default().extend(refs);
        }
    }
    if let Some(refs) = phi_users.remove(&tmp.0) {
        for &(bi, pi) in &refs {
            for operand in &mut f.blocks[bi].phis[pi].operands {
                if *operand == Operand::Tmp(tmp) {
                    *operand = replacement;
                }
            }
        }
        if let Operand::Tmp(new) = replacement {
            phi_users.entry(new.0).or_default().extend(refs);
        }
    }
}

fn fold_instr(
    f: &mut Function,
    module: &Module,
    users: &mut UseMap,
    phi_users: &mut UseMap,
    bi: usize,
    ii: usize,
) -> bool {
    let instr = &f.blocks[bi].instrs[ii];
    let o = instr.op;
    if !is_arith(o) {
        return false;
    }
    let Some(dest) = instr.dest else {
        return false;
    };
    let (a, b) = (instr.operands[0], instr.operands[1]);

    // Both operands immediate: compute now.
    if let (Operand::Imm(ia), Operand::Imm(ib)) = (a, b) {
        if let (Some(ta), Some(tb)) = (ia.ty, ib.ty) {
            if module.types.is_integer(ta) && module.types.is_integer(tb) {
                let Some(v) = apply_int(o, ia.value, ib.value) else {
                    return false;
                };
                f.blocks[bi].instrs[ii].clear();
                replace_uses(f, users, phi_users, dest, Operand::Imm(Imm::int(v, ta)));
                return true;
            }
            if module.types.is_float(ta) && module.types.is_float(tb) {
                let (va, vb) = (
                    f64::from_bits(ia.value as u64),
                    f64::from_bits(ib.value as u64),
                );
                let Some(v) = apply_float(o, va, vb) else {
                    return false;
                };
                f.blocks[bi].instrs[ii].clear();
                replace_uses(
                    f,
                    users,
                    phi_users,
                    dest,
                    Operand::Imm(Imm::int(v.to_bits() as i64, ta)),
                );
                return true;
            }
        }
        return false;
    }

    // Algebraic identities; integer immediates only, so float NaN/infinity
    // behavior is preserved.
    let int_imm = |imm: &Imm| imm.ty.is_some_and(|t| module.types.is_integer(t));
    if let (Operand::Tmp(x), Operand::Imm(imm)) = (a, b) {
        if int_imm(&imm) {
            if imm.value == 0 && (o == op::ADD || o == op::SUB) {
                f.blocks[bi].instrs[ii].clear();
                replace_uses(f, users, phi_users, dest, Operand::Tmp(x));
                return true;
            }
            if imm.value == 0 && o == op::MUL {
                f.blocks[bi].instrs[ii].clear();
                replace_uses(f, users, phi_users, dest, Operand::Imm(imm));
                return true;
            }
            if imm.value == 1 && (o == op::MUL || o == op::DIV) {
                f.blocks[bi].instrs[ii].clear();
                replace_uses(f, users, phi_users, dest, Operand::Tmp(x));
                return true;
            }
        }
    }
    if let (Operand::Imm(imm), Operand::Tmp(x)) = (a, b) {
        if int_imm(&imm) {
            if imm.value == 0 && o == op::ADD {
                f.blocks[bi].instrs[ii].clear();
                replace_uses(f, users, phi_users, dest, Operand::Tmp(x));
                return true;
            }
            if imm.value == 0 && o == op::MUL {
                f.blocks[bi].instrs[ii].clear();
                replace_uses(f, users, phi_users, dest, Operand::Imm(imm));
                return true;
            }
            if imm.value == 1 && o == op::MUL {
                f.blocks[bi].instrs[ii].clear();
                replace_uses(f, users, phi_users, dest, Operand::Tmp(x));
                return true;
            }
        }
    }
    false
}

//! SSA construction.
//!
//! Promotes function-local memory reads and writes to SSA values with
//! φ-nodes, following Braun et al., "Simple and Efficient Construction of
//! Static Single Assignment Form": local definitions are tracked per block,
//! blocks are sealed once all predecessor edges have been processed, and
//! incomplete φs are completed at seal time. Trivial φs are removed as they
//! appear, recursing into φs that may have become trivial in turn.
//!
//! Parameters keep their memory semantics; only non-parameter locals are
//! promoted.

use super::cfg::{build_cfg, compute_rpo};
use crate::error::{Error, ErrorKind};
use crate::ir::{Function, Imm, Kind, Label, Operand, Phi, Tmp, TypeTable};
use crate::op;
use std::collections::{BTreeMap, HashMap, HashSet};

/// Run the promotion on one function.
pub fn promote_locals(f: &mut Function, types: &mut TypeTable) -> Result<(), Error> {
    SsaBuilder {
        f,
        types,
        current_def: HashMap::new(),
        incomplete: BTreeMap::new(),
        sealed: HashSet::new(),
    }
    .run()
}

#[derive(Debug, Clone)]
struct PhiInfo {
    local: u32,
    dest: Tmp,
    incoming: Vec<(Operand, Label)>,
}

struct SsaBuilder<'a> {
    f: &'a mut Function,
    types: &'a mut TypeTable,
    /// local -> block -> current definition.
    current_def: HashMap<u32, HashMap<Label, Operand>>,
    incomplete: BTreeMap<Label, Vec<PhiInfo>>,
    sealed: HashSet<Label>,
}

impl SsaBuilder<'_> {
    fn run(mut self) -> Result<(), Error> {
        build_cfg(self.f)?;
        let rpo = compute_rpo(self.f)?;

        let mut open_preds: HashMap<Label, usize> = HashMap::new();
        for block in &self.f.blocks {
            open_preds.insert(block.label, block.pred.len());
        }
        let zero_pred: Vec<Label> = self
            .f
            .blocks
            .iter()
            .filter(|b| b.pred.is_empty())
            .map(|b| b.label)
            .collect();
        for label in zero_pred {
            self.seal_block(label)?;
        }

        for label in rpo {
            let bi = self.block_index(label)?;
            let arg_count = self.f.arg_locals.len() as u32;
            for ii in 0..self.f.blocks[bi].instrs.len() {
                let instr = &self.f.blocks[bi].instrs[ii];
                if instr.op == op::STRE {
                    if instr.operands.len() != 2 {
                        return Err(invalid("stre must have exactly two operands"));
                    }
                    let Operand::Local(local) = instr.operands[0] else {
                        continue;
                    };
                    if local.0 < arg_count {
                        continue;
                    }
                    let value = instr.operands[1];
                    self.f.blocks[bi].instrs[ii].clear();
                    self.write_variable(local.0, label, value);
                } else if instr.op == op::LOAD {
                    if instr.operands.len() != 1 {
                        return Err(invalid("load must have exactly one operand"));
                    }
                    let Operand::Local(local) = instr.operands[0] else {
                        continue;
                    };
                    if local.0 < arg_count {
                        continue;
                    }
                    let old_dest = self.f.blocks[bi].instrs[ii].dest;
                    let value = self.read_variable(local.0, label)?;
                    self.f.blocks[bi].instrs[ii].clear();
                    if let Some(old) = old_dest {
                        self.replace_tmp_everywhere(old, value);
                    }
                    self.write_variable(local.0, label, value);
                }
            }
            let succ = self.f.blocks[bi].succ.clone();
            for s in succ {
                if let Some(count) = open_preds.get_mut(&s) {
                    if *count > 0 {
                        *count -= 1;
                        if *count == 0 {
                            self.seal_block(s)?;
                        }
                    }
                }
            }
        }
        Ok(())
    }

    fn block_index(&self, label: Label) -> Result<usize, Error> {
        self.f
            .block_index(label)
            .ok_or_else(|| invalid(format!("unknown label {}", label.0)))
    }

    fn undef(&mut self) -> Operand {
        let undef = self.types.primitive(Kind::Undef);
        Operand::Imm(Imm::int(0, undef))
    }

    fn write_variable(&mut self, local: u32, block: Label, value: Operand) {
        self.current_def.entry(local).or_default().insert(block, value);
    }

    fn read_variable(&mut self, local: u32, block: Label) -> Result<Operand, Error> {
        if let Some(value) = self.current_def.get(&local).and_then(|m| m.get(&block)) {
            return Ok(*value);
        }
        self.read_variable_recursive(local, block)
    }

    fn read_variable_recursive(&mut self, local: u32, block: Label) -> Result<Operand, Error> {
        let bi = self.block_index(block)?;
        let preds = self.f.blocks[bi].pred.clone();
        let result = if preds.is_empty() {
            // Entry-reachable read before any write; refined later when a
            // φ's other operands settle the type.
            self.undef()
        } else if preds.len() == 1 {
            self.read_variable(local, preds[0])?
        } else if !self.sealed.contains(&block) {
            let dest = self.f.fresh_tmp();
            if let Some(ty) = self.f.local_type(crate::ir::Local(local)) {
                self.f.set_tmp_type(dest, ty);
            }
            self.incomplete.entry(block).or_default().push(PhiInfo {
                local,
                dest,
                incoming: Vec::new(),
            });
            Operand::Tmp(dest)
        } else {
            let dest = self.f.fresh_tmp();
            if let Some(ty) = self.f.local_type(crate::ir::Local(local)) {
                self.f.set_tmp_type(dest, ty);
            }
            // Cache the φ destination first to break read cycles through
            // loops.
            self.write_variable(local, block, Operand::Tmp(dest));
            let info = PhiInfo {
                local,
                dest,
                incoming: Vec::new(),
            };
            self.add_phi_operands(block, info)?
        };
        self.write_variable(local, block, result);
        Ok(result)
    }

    fn add_phi_operands(&mut self, block: Label, mut info: PhiInfo) -> Result<Operand, Error> {
        let bi = self.block_index(block)?;
        let preds = self.f.blocks[bi].pred.clone();
        for pred in preds {
            let value = self.read_variable(info.local, pred)?;
            info.incoming.push((value, pred));
        }
        let (b, p) = self.materialize_phi(block, &info)?;
        Ok(self.try_remove_trivial_phi(b, p))
    }

    /// Append the φ instruction; widen undef operand types to the type
    /// concluded from the non-undef siblings.
    fn materialize_phi(&mut self, block: Label, info: &PhiInfo) -> Result<(usize, usize), Error> {
        let mut concluded = None;
        let mut has_undef = false;
        for (value, _) in &info.incoming {
            match value {
                Operand::Imm(imm) => match imm.ty {
                    Some(ty) if self.types.is_undef(ty) => has_undef = true,
                    Some(ty) => concluded = Some(ty),
                    None => {}
                },
                Operand::Tmp(t) => {
                    if let Some(ty) = self.f.tmp_type(*t) {
                        concluded = Some(ty);
                    }
                }
                _ => {}
            }
        }
        let mut operands = Vec::with_capacity(info.incoming.len() * 2);
        for (value, label) in &info.incoming {
            let mut value = *value;
            if has_undef {
                if let (Operand::Imm(imm), Some(ty)) = (&mut value, concluded) {
                    if imm.ty.is_some_and(|t| self.types.is_undef(t)) {
                        imm.ty = Some(ty);
                    }
                }
            }
            operands.push(value);
            operands.push(Operand::Label(*label));
        }
        let bi = self.block_index(block)?;
        self.f.blocks[bi].phis.push(Phi {
            op: op::PHI,
            dest: Some(info.dest),
            operands,
        });
        Ok((bi, self.f.blocks[bi].phis.len() - 1))
    }

    /// A φ whose operands are all its own destination or a single other
    /// value is replaced by that value; φs that used it are retried.
    fn try_remove_trivial_phi(&mut self, b: usize, p: usize) -> Operand {
        let Some(dest) = self.f.blocks[b].phis[p].dest else {
            return self.undef();
        };
        let incoming: Vec<(Operand, Label)> = self.f.blocks[b].phis[p].incoming().collect();
        let mut same: Option<Operand> = None;
        for (value, _) in &incoming {
            if *value == Operand::Tmp(dest) || Some(*value) == same {
                continue;
            }
            if same.is_some() {
                // Merges at least two distinct values: not trivial.
                return Operand::Tmp(dest);
            }
            same = Some(*value);
        }
        let same = same.unwrap_or_else(|| self.undef());

        let (users, phi_users) = self.users_of(dest);
        for (ub, ui) in users {
            for operand in &mut self.f.blocks[ub].instrs[ui].operands {
                if *operand == Operand::Tmp(dest) {
                    *operand = same;
                }
            }
        }
        let mut retry = Vec::new();
        for (ub, up) in phi_users {
            if (ub, up) == (b, p) {
                continue;
            }
            for operand in &mut self.f.blocks[ub].phis[up].operands {
                if *operand == Operand::Tmp(dest) {
                    *operand = same;
                }
            }
            retry.push((ub, up));
        }
        for defs in self.current_def.values_mut() {
            for value in defs.values_mut() {
                if *value == Operand::Tmp(dest) {
                    *value = same;
                }
            }
        }
        for (ub, up) in retry {
            if !self.f.blocks[ub].phis[up].is_nop() {
                self.try_remove_trivial_phi(ub, up);
            }
        }
        self.f.blocks[b].phis[p].clear();
        same
    }

    fn users_of(&self, tmp: Tmp) -> (Vec<(usize, usize)>, Vec<(usize, usize)>) {
        let mut users = Vec::new();
        let mut phi_users = Vec::new();
        for (bi, block) in self.f.blocks.iter().enumerate() {
            for (pi, phi) in block.phis.iter().enumerate() {
                if phi
                    .operands
                    .iter()
                    .any(|o| *o == Operand::Tmp(tmp))
                {
                    phi_users.push((bi, pi));
                }
            }
            for (ii, instr) in block.instrs.iter().enumerate() {
                if instr
                    .operands
                    .iter()
                    .any(|o| *o == Operand::Tmp(tmp))
                {
                    users.push((bi, ii));
                }
            }
        }
        (users, phi_users)
    }

    fn replace_tmp_everywhere(&mut self, from: Tmp, to: Operand) {
        for block in &mut self.f.blocks {
            for phi in &mut block.phis {
                if phi.dest == Some(from) {
                    phi.clear();
                    continue;
                }
                for operand in &mut phi.operands {
                    if *operand == Operand::Tmp(from) {
                        *operand = to;
                    }
                }
            }
            for instr in &mut block.instrs {
                if instr.dest == Some(from) {
                    instr.clear();
                    continue;
                }
                for operand in &mut instr.operands {
                    if *operand == Operand::Tmp(from) {
                        *operand = to;
                    }
                }
            }
        }
    }

    fn seal_block(&mut self, block: Label) -> Result<(), Error> {
        if !self.sealed.insert(block) {
            return Ok(());
        }
        if let Some(pending) = self.incomplete.remove(&block) {
            for info in pending {
                self.add_phi_operands(block, info)?;
            }
        }
        Ok(())
    }
}

fn invalid(what: impl Into<String>) -> Error {
    Error::bare(ErrorKind::InvalidIr { what: what.into() })
}

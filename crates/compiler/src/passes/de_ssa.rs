//! Out-of-SSA translation.
//!
//! Two steps per function:
//!
//! 1. Split every critical edge (a predecessor with multiple successors
//!    feeding a block with multiple predecessors) by inserting a fresh
//!    block holding only a `jmp`.
//! 2. For each block, group φ transfers by predecessor and emit, right
//!    before that predecessor's terminator, a parallel-copy sequence:
//!    first every φ source into a fresh temporary, then every fresh
//!    temporary into its φ destination. This keeps swap-like transfers
//!    (where destination and source sets overlap) correct.
//!
//! All φs are cleared afterwards; backends see none.

use crate::error::{Error, ErrorKind};
use crate::ir::{Block, Function, Instr, Label, Operand, Tmp};
use crate::op;
use std::collections::BTreeMap;

fn invalid(what: impl Into<String>) -> Error {
    Error::bare(ErrorKind::InvalidIr { what: what.into() })
}

pub fn de_ssa(f: &mut Function) -> Result<(), Error> {
    super::cfg::build_cfg(f)?;
    // Step 1: split critical edges. `remap` records (pred, succ) -> new
    // intermediate block, so φ incoming labels can be re-pointed.
    let mut remap: BTreeMap<(Label, Label), Label> = BTreeMap::new();
    let mut new_blocks: Vec<Block> = Vec::new();
    for bi in 0..f.blocks.len() {
        let block_label = f.blocks[bi].label;
        if f.blocks[bi].pred.len() <= 1 {
            continue;
        }
        let preds = f.blocks[bi].pred.clone();
        for (pi, pred_label) in preds.iter().enumerate() {
            let pred_idx = f
                .block_index(*pred_label)
                .ok_or_else(|| invalid(format!("unknown predecessor {}", pred_label.0)))?;
            if f.blocks[pred_idx].succ.len() <= 1 {
                continue;
            }
            let new_label = f.fresh_label();
            let mut bridge = Block::new(new_label);
            bridge
                .instrs
                .push(Instr::new(op::JMP, None, vec![Operand::Label(block_label)]));
            bridge.succ = vec![block_label];
            bridge.pred = vec![*pred_label];
            new_blocks.push(bridge);
            remap.insert((*pred_label, block_label), new_label);

            let pred_block = &mut f.blocks[pred_idx];
            let Some(term) = pred_block.instrs.last_mut() else {
                return Err(invalid("predecessor block has no terminator"));
            };
            for operand in &mut term.operands {
                if *operand == Operand::Label(block_label) {
                    *operand = Operand::Label(new_label);
                }
            }
            for succ in &mut pred_block.succ {
                if *succ == block_label {
                    *succ = new_label;
                }
            }
            f.blocks[bi].pred[pi] = new_label;
        }
    }
    for bridge in new_blocks {
        let label = bridge.label;
        f.blocks.push(bridge);
        let idx = f.blocks.len() - 1;
        f.label_to_block.insert(label, idx);
    }

    // Step 2: lower φs to parallel copies in each predecessor.
    for bi in 0..f.blocks.len() {
        let block_label = f.blocks[bi].label;
        if f.blocks[bi].phis.is_empty() {
            continue;
        }
        // pred -> [(dest, src)]
        let mut per_pred: BTreeMap<Label, Vec<(Tmp, Operand)>> = BTreeMap::new();
        for phi in &f.blocks[bi].phis {
            if phi.is_nop() {
                continue;
            }
            let Some(dest) = phi.dest else { continue };
            for (src, mut pred_label) in phi.incoming() {
                if let Some(&mapped) = remap.get(&(pred_label, block_label)) {
                    pred_label = mapped;
                }
                per_pred.entry(pred_label).or_default().push((dest, src));
            }
        }

        for (pred_label, pairs) in per_pred {
            let pred_idx = f
                .block_index(pred_label)
                .ok_or_else(|| invalid(format!("unknown predecessor {}", pred_label.0)))?;
            if f.blocks[pred_idx].instrs.is_empty() {
                return Err(invalid(format!(
                    "cannot insert parallel copies into empty block {}",
                    pred_label.0
                )));
            }
            let mut pre_copies = Vec::with_capacity(pairs.len());
            let mut post_copies = Vec::with_capacity(pairs.len());
            for (dest, src) in pairs {
                let fresh = f.fresh_tmp();
                if let Some(ty) = f.tmp_type(dest) {
                    f.set_tmp_type(fresh, ty);
                }
                pre_copies.push(Instr::new(op::MOV, Some(fresh), vec![src]));
                post_copies.push(Instr::new(op::MOV, Some(dest), vec![Operand::Tmp(fresh)]));
            }
            let pred_block = &mut f.blocks[pred_idx];
            let term_at = pred_block.instrs.len() - 1;
            let mut copies = pre_copies;
            copies.extend(post_copies);
            pred_block.instrs.splice(term_at..term_at, copies);
        }
        f.blocks[bi].phis.clear();
    }
    Ok(())
}

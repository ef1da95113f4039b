//! Control-flow graph construction.
//!
//! Fills each block's successor and predecessor lists from its terminator
//! and computes reverse postorder from the entry block.

use crate::error::{Error, ErrorKind};
use crate::ir::{Function, Label};
use crate::op;
use std::collections::HashSet;

fn invalid(what: impl Into<String>) -> Error {
    Error::bare(ErrorKind::InvalidIr { what: what.into() })
}

/// Rebuild `succ`/`pred` for every block of the function.
pub fn build_cfg(f: &mut Function) -> Result<(), Error> {
    for block in &mut f.blocks {
        block.succ.clear();
        block.pred.clear();
    }

    for bi in 0..f.blocks.len() {
        let block = &f.blocks[bi];
        let Some(last) = block.instrs.iter().rev().find(|i| !i.is_nop()) else {
            return Err(invalid(format!("block {} has no instructions", block.label.0)));
        };
        let succ: Vec<Label> = if last.op == op::JMP {
            let Some(target) = last.operands.first().and_then(|o| o.as_label()) else {
                return Err(invalid("jmp operand must be a label"));
            };
            vec![target]
        } else if last.op == op::CMP {
            if last.operands.len() != 3 {
                return Err(invalid("cmp must have exactly three operands"));
            }
            let (Some(t), Some(e)) = (last.operands[1].as_label(), last.operands[2].as_label())
            else {
                return Err(invalid("cmp targets must be labels"));
            };
            vec![t, e]
        } else if last.op == op::RET {
            vec![]
        } else {
            return Err(invalid(format!(
                "block {} does not end with a terminator",
                block.label.0
            )));
        };
        f.blocks[bi].succ = succ;
    }

    for bi in 0..f.blocks.len() {
        let label = f.blocks[bi].label;
        let succ = f.blocks[bi].succ.clone();
        for s in succ {
            let si = f
                .block_index(s)
                .ok_or_else(|| invalid(format!("unknown successor label {}", s.0)))?;
            f.blocks[si].pred.push(label);
        }
    }
    Ok(())
}

/// Reverse postorder over block labels, starting from the entry block.
pub fn compute_rpo(f: &Function) -> Result<Vec<Label>, Error> {
    let Some(entry) = f.blocks.first() else {
        return Ok(Vec::new());
    };
    let mut seen = HashSet::new();
    let mut order = Vec::with_capacity(f.blocks.len());
    dfs(f, entry.label, &mut seen, &mut order)?;
    order.reverse();
    Ok(order)
}

fn dfs(
    f: &Function,
    label: Label,
    seen: &mut HashSet<Label>,
    order: &mut Vec<Label>,
) -> Result<(), Error> {
    seen.insert(label);
    let idx = f
        .block_index(label)
        .ok_or_else(|| invalid(format!("unknown label {}", label.0)))?;
    for succ in f.blocks[idx].succ.clone() {
        if !seen.contains(&succ) {
            dfs(f, succ, seen, order)?;
        }
    }
    order.push(label);
    Ok(())
}

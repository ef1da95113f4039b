//! Register renumbering.
//!
//! After the in-function passes, temporaries are sparse. Walk all φs and
//! instructions, map each temporary to a dense new index on first sight,
//! rewrite all occurrences, and reorder the temporary type table to match.

use crate::error::Error;
use crate::ir::{Function, Operand, Tmp};
use std::collections::HashMap;

fn renumber(t: Tmp, mapping: &mut HashMap<u32, u32>, next: &mut u32) -> Tmp {
    let idx = *mapping.entry(t.0).or_insert_with(|| {
        let idx = *next;
        *next += 1;
        idx
    });
    Tmp(idx)
}

pub fn renumber_registers(f: &mut Function) -> Result<(), Error> {
    let mut mapping: HashMap<u32, u32> = HashMap::new();
    let mut next = 0u32;

    for block in &mut f.blocks {
        for phi in &mut block.phis {
            if let Some(dest) = phi.dest {
                phi.dest = Some(renumber(dest, &mut mapping, &mut next));
            }
            for operand in &mut phi.operands {
                if let Operand::Tmp(t) = operand {
                    *operand = Operand::Tmp(renumber(*t, &mut mapping, &mut next));
                }
            }
        }
        for instr in &mut block.instrs {
            if let Some(dest) = instr.dest {
                instr.dest = Some(renumber(dest, &mut mapping, &mut next));
            }
            for operand in &mut instr.operands {
                if let Operand::Tmp(t) = operand {
                    *operand = Operand::Tmp(renumber(*t, &mut mapping, &mut next));
                }
            }
        }
    }

    let mut new_types = vec![None; next as usize];
    for (old, new) in &mapping {
        if let Some(ty) = f.tmp_types.get(*old as usize).copied().flatten() {
            new_types[*new as usize] = Some(ty);
        }
    }
    f.tmp_types = new_types;
    f.next_tmp = next;
    Ok(())
}

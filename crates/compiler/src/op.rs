//! Packed operator codes.
//!
//! Operators are packed into a `u64` by big-endian-concatenating their ASCII
//! bytes, so a multi-character operator like `<=` or `stre` dispatches on a
//! single integer compare. The encoding is shared by the AST and the IR and
//! is the primary dispatch key in the lowerer and the backends.

use std::fmt;

/// A packed operator code.
///
/// `Op::new("<=")` packs to `0x3C3D`; a single-character operator is just its
/// ASCII byte. At most eight bytes fit, which covers every operator and
/// opcode in the pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Op(pub u64);

impl Op {
    /// Pack an operator from its textual spelling.
    pub const fn new(text: &str) -> Self {
        let bytes = text.as_bytes();
        let mut value = 0u64;
        let mut i = 0;
        while i < bytes.len() {
            value = (value << 8) | bytes[i] as u64;
            i += 1;
        }
        Op(value)
    }

    /// Recover the textual spelling.
    pub fn text(self) -> String {
        let mut bytes = Vec::new();
        let mut value = self.0;
        while value != 0 {
            bytes.push((value & 0xFF) as u8);
            value >>= 8;
        }
        bytes.reverse();
        String::from_utf8_lossy(&bytes).into_owned()
    }
}

impl fmt::Display for Op {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.text())
    }
}

// Arithmetic and comparison operators (AST and IR share these codes).
pub const ADD: Op = Op::new("+");
pub const SUB: Op = Op::new("-");
pub const MUL: Op = Op::new("*");
pub const DIV: Op = Op::new("/");
pub const REM: Op = Op::new("%");
pub const POW: Op = Op::new("^");
pub const LT: Op = Op::new("<");
pub const LE: Op = Op::new("<=");
pub const GT: Op = Op::new(">");
pub const GE: Op = Op::new(">=");
pub const EQ: Op = Op::new("==");
pub const NE: Op = Op::new("!=");
pub const AND: Op = Op::new("&&");
pub const OR: Op = Op::new("||");
pub const NOT: Op = Op::new("!");

// IR opcodes.
pub const NOP: Op = Op::new("nop");
pub const STRE: Op = Op::new("stre");
pub const LOAD: Op = Op::new("load");
pub const LDE: Op = Op::new("lde");
pub const STE: Op = Op::new("ste");
pub const LEA: Op = Op::new("lea");
pub const NEG: Op = Op::new("neg");
pub const MOV: Op = Op::new("mov");
pub const CMOV: Op = Op::new("cmov");
pub const I2F: Op = Op::new("i2f");
pub const F2I: Op = Op::new("f2i");
pub const I2B: Op = Op::new("i2b");
pub const F2B: Op = Op::new("f2b");
pub const ARG: Op = Op::new("arg");
pub const CALL: Op = Op::new("call");
pub const RET: Op = Op::new("ret");
pub const JMP: Op = Op::new("jmp");
pub const CMP: Op = Op::new("cmp");
pub const PHI: Op = Op::new("phi");

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn single_char_packs_to_ascii() {
        assert_eq!(ADD.0, b'+' as u64);
        assert_eq!(LT.0, b'<' as u64);
    }

    #[test]
    fn multi_char_packs_big_endian() {
        assert_eq!(LE.0, ((b'<' as u64) << 8) | b'=' as u64);
        assert_eq!(Op::new("jmp").0, 0x6A6D70);
    }

    #[test]
    fn text_round_trips() {
        for op in [ADD, LE, NE, AND, STRE, LOAD, CALL, PHI, CMOV] {
            assert_eq!(Op::new(&op.text()), op);
        }
    }

    #[test]
    fn distinct_codes() {
        let ops = [
            ADD, SUB, MUL, DIV, REM, POW, LT, LE, GT, GE, EQ, NE, AND, OR, NOT, NOP, STRE, LOAD,
            LDE, STE, LEA, NEG, MOV, CMOV, I2F, F2I, I2B, F2B, ARG, CALL, RET, JMP, CMP, PHI,
        ];
        for (i, a) in ops.iter().enumerate() {
            for b in &ops[i + 1..] {
                assert_ne!(a, b);
            }
        }
    }
}

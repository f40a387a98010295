//! Instruction records produced by the front end.
//!
//! An instruction is an opcode from a fixed operation set plus an
//! operand-shape tag carrying the populated operands. Both backends match the
//! shape exhaustively; there is no other dispatch.

use crate::operand::{Immediate, MemoryOperand, Register};

/// The fixed operation set.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Opcode {
    Add,
    Addsd,
    Addss,
    Cvtss2sd,
    Cvtsd2ss,
    Cvtsi2ss,
    Cvtsi2sd,
    Cvttsd2si,
    Cvttss2si,
    Cdq,
    Cqo,
    Div,
    Divsd,
    Divss,
    Sub,
    Subsd,
    Subss,
    Not,
    Mul,
    Xor,
    And,
    Or,
    Shl,
    Shr,
    Sar,
    Idiv,
    Mov,
    Movzx,
    Movsx,
    Movaps,
    Movss,
    Movsd,
    Mulsd,
    Mulss,
    Sete,
    Seta,
    Setna,
    Setg,
    Setng,
    Setp,
    Setae,
    Setnae,
    Setge,
    Setnge,
    Setnp,
    Setne,
    Test,
    Ucomiss,
    Ucomisd,
    Cmp,
    Lea,
    Push,
    Pop,
    Pxor,
    Jmp,
    Je,
    Ja,
    Jna,
    Jg,
    Jng,
    Js,
    Jp,
    Jae,
    Jnae,
    Jge,
    Jnge,
    Jne,
    Jns,
    Call,
    Leave,
    Ret,
    RepMovsq,
    Fld,
    Fild,
    Fstp,
    Fxch,
    Fnstcw,
    Fldcw,
    Fistp,
    Fucomip,
    Faddp,
    Fsubrp,
    Fmulp,
    Fdivrp,
    Inc,
    Dec,
    /// Marker for hand-encoded runtime-support code.
    Builtin,
}

impl Opcode {
    /// True for the unconditional and conditional jump group, whose immediate
    /// operand is a bare label rather than a value.
    pub fn is_jump(self) -> bool {
        use Opcode::*;
        matches!(
            self,
            Jmp | Je | Ja | Jna | Jg | Jng | Js | Jp | Jae | Jnae | Jge | Jnge | Jne | Jns
        )
    }
}

/// Operand shape: which operand fields an instruction populates.
#[derive(Debug, Clone, PartialEq)]
pub enum Operands {
    None,
    Reg(Register),
    RegReg(Register, Register),
    RegMem(Register, MemoryOperand),
    Mem(MemoryOperand),
    MemReg(MemoryOperand, Register),
    ImmReg(Immediate, Register),
    ImmMem(Immediate, MemoryOperand),
    Imm(Immediate),
}

/// One machine instruction as submitted by the front end.
#[derive(Debug, Clone, PartialEq)]
pub struct Instruction {
    pub opcode: Opcode,
    pub operands: Operands,
}

impl Instruction {
    pub fn new(opcode: Opcode, operands: Operands) -> Self {
        Self { opcode, operands }
    }

    /// Zero-operand instruction.
    pub fn op0(opcode: Opcode) -> Self {
        Self::new(opcode, Operands::None)
    }

    /// The label this instruction references through its operands, if any.
    /// Jump/call targets and symbol-based memory operands need relocation in
    /// the JIT backend; this is the name the fix-up pass resolves.
    pub fn referenced_label(&self) -> Option<&str> {
        match &self.operands {
            Operands::Imm(Immediate::Addr(addr)) => addr.symbol.as_deref(),
            Operands::Mem(mem) | Operands::MemReg(mem, _) => mem.addr.symbol.as_deref(),
            Operands::RegMem(_, mem) | Operands::ImmMem(_, mem) => mem.addr.symbol.as_deref(),
            _ => None,
        }
    }
}

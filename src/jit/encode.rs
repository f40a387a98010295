//! x86-64 instruction encoding.
//!
//! Turns an `Instruction` into its machine-code bytes. Symbol references in
//! memory operands encode as RIP-relative with a zero displacement field;
//! jump/call targets encode as rel32 zero placeholders. Both are rewritten by
//! the fix-up pass once label addresses are known, so the placeholder content
//! never reaches execution.

use crate::instruction::{Instruction, Opcode, Operands};
use crate::operand::{Address, Immediate, MemoryOperand, Register, RegId, Width};

/// Byte sink with little-endian emit helpers.
struct Enc {
    bytes: Vec<u8>,
}

impl Enc {
    fn new() -> Self {
        Self { bytes: Vec::with_capacity(8) }
    }

    fn u8(&mut self, byte: u8) {
        self.bytes.push(byte);
    }

    fn u16(&mut self, value: u16) {
        self.bytes.extend_from_slice(&value.to_le_bytes());
    }

    fn u32(&mut self, value: u32) {
        self.bytes.extend_from_slice(&value.to_le_bytes());
    }

    fn u64(&mut self, value: u64) {
        self.bytes.extend_from_slice(&value.to_le_bytes());
    }
}

/// ModR/M byte: 2-bit mode, 3-bit reg/digit, 3-bit r/m.
fn modrm(mode: u8, reg: u8, rm: u8) -> u8 {
    ((mode & 0x3) << 6) | ((reg & 0x7) << 3) | (rm & 0x7)
}

/// Full 4-bit hardware code of a general-purpose or vector register.
fn code_of(reg: Register) -> u8 {
    reg.id
        .gp_code()
        .or_else(|| reg.id.xmm_code())
        .expect("register with hardware encoding")
}

/// Byte access to SPL/BPL/SIL/DIL needs a REX prefix even with no bits set.
fn needs_byte_rex(reg: Register) -> bool {
    reg.width == Width::Byte
        && matches!(reg.id, RegId::Sp | RegId::Bp | RegId::Si | RegId::Di)
}

/// The r/m side of an instruction: a register or an addressing expression.
enum Rm<'a> {
    Reg(u8),
    Mem(&'a Address),
}

/// REX.X/REX.B contribution of a memory operand.
fn mem_rex_bits(addr: &Address) -> (bool, bool) {
    let x = addr
        .index
        .map(|(index, _)| index.gp_code().expect("index register") >= 8)
        .unwrap_or(false);
    let b = addr
        .base
        .and_then(|base| base.gp_code())
        .map(|code| code >= 8)
        .unwrap_or(false);
    (x, b)
}

/// Emit prefixes, opcode and ModR/M (+SIB, +displacement) for one operation.
///
/// `mandatory` is an SSE prefix (F2/F3/66) that precedes REX; `opsize` emits
/// the 0x66 operand-size prefix; `reg` is the full 4-bit /r field value (or
/// an opcode digit, which never has an extension bit).
fn encode_op(
    enc: &mut Enc,
    mandatory: Option<u8>,
    opsize: bool,
    rex_w: bool,
    opcode: &[u8],
    reg: u8,
    rm: Rm,
    force_rex: bool,
) {
    if let Some(prefix) = mandatory {
        enc.u8(prefix);
    }
    if opsize {
        enc.u8(0x66);
    }

    let rex_r = reg >= 8;
    let (rex_x, rex_b) = match &rm {
        Rm::Reg(code) => (false, *code >= 8),
        Rm::Mem(addr) => mem_rex_bits(addr),
    };
    let rex = 0x40
        | (rex_w as u8) << 3
        | (rex_r as u8) << 2
        | (rex_x as u8) << 1
        | rex_b as u8;
    if rex != 0x40 || force_rex {
        enc.u8(rex);
    }

    enc.bytes.extend_from_slice(opcode);

    match rm {
        Rm::Reg(code) => enc.u8(modrm(0b11, reg, code)),
        Rm::Mem(addr) => encode_mem(enc, reg, addr),
    }
}

/// ModR/M + SIB + displacement for a memory operand.
fn encode_mem(enc: &mut Enc, reg: u8, addr: &Address) {
    if addr.symbol.is_some() {
        // Symbol references are position-relative; the 32-bit displacement
        // field is a placeholder rewritten during fix-up.
        assert!(
            addr.base.is_none() || addr.base == Some(RegId::Ip),
            "symbol reference with a base register"
        );
        assert!(addr.index.is_none(), "symbol reference with an index register");
        enc.u8(modrm(0b00, reg, 0b101));
        enc.u32(0);
        return;
    }

    let Some(base) = addr.base else {
        // Absolute 32-bit address through a SIB byte with no base.
        enc.u8(modrm(0b00, reg, 0b100));
        enc.u8(0x25);
        enc.u32(addr.disp as u32);
        return;
    };

    let base_code = base.gp_code().expect("base register");
    let disp = addr.disp;
    // RBP/R13 as base cannot use the no-displacement mode.
    let no_disp = disp == 0 && (base_code & 7) != 0b101;

    if let Some((index, scale)) = addr.index {
        let index_code = index.gp_code().expect("index register");
        assert!(index != RegId::Sp, "stack pointer cannot be an index");
        let scale_bits = match scale {
            1 => 0,
            2 => 1,
            4 => 2,
            8 => 3,
            _ => panic!("invalid scale factor"),
        };
        let sib = (scale_bits << 6) | ((index_code & 7) << 3) | (base_code & 7);
        if no_disp {
            enc.u8(modrm(0b00, reg, 0b100));
            enc.u8(sib);
        } else if (-128..=127).contains(&disp) {
            enc.u8(modrm(0b01, reg, 0b100));
            enc.u8(sib);
            enc.u8(disp as u8);
        } else {
            enc.u8(modrm(0b10, reg, 0b100));
            enc.u8(sib);
            enc.u32(disp as u32);
        }
        return;
    }

    // RSP/R12 as base always needs a SIB byte.
    let needs_sib = (base_code & 7) == 0b100;
    let rm_bits = if needs_sib { 0b100 } else { base_code & 7 };
    if no_disp {
        enc.u8(modrm(0b00, reg, rm_bits));
        if needs_sib {
            enc.u8(0x24);
        }
    } else if (-128..=127).contains(&disp) {
        enc.u8(modrm(0b01, reg, rm_bits));
        if needs_sib {
            enc.u8(0x24);
        }
        enc.u8(disp as u8);
    } else {
        enc.u8(modrm(0b10, reg, rm_bits));
        if needs_sib {
            enc.u8(0x24);
        }
        enc.u32(disp as u32);
    }
}

fn int_value(imm: &Immediate) -> i64 {
    match imm {
        Immediate::Int { value, .. } => *value,
        _ => panic!("integer immediate required"),
    }
}

/// Width-driven prefix selection for the integer operation groups.
fn width_bits(w: Width) -> (bool /*opsize*/, bool /*rex_w*/) {
    match w {
        Width::Byte | Width::Long => (false, false),
        Width::Word => (true, false),
        Width::Quad => (false, true),
        Width::Tword => panic!("unsupported integer operand width"),
    }
}

/// Opcode byte for the byte/full-width split of an integer operation.
fn op_for_width(base: u8, w: Width) -> u8 {
    if w == Width::Byte { base } else { base + 1 }
}

/// ALU-style immediate form: 0x80/0x81 (or 0x83 short form) with a digit.
fn encode_alu_imm(enc: &mut Enc, digit: u8, w: Width, value: i64, rm: Rm, force_rex: bool) {
    let (opsize, rex_w) = width_bits(w);
    if w == Width::Byte {
        encode_op(enc, None, opsize, rex_w, &[0x80], digit, rm, force_rex);
        enc.u8(value as u8);
    } else if (-128..=127).contains(&value) {
        encode_op(enc, None, opsize, rex_w, &[0x83], digit, rm, force_rex);
        enc.u8(value as u8);
    } else {
        encode_op(enc, None, opsize, rex_w, &[0x81], digit, rm, force_rex);
        match w {
            Width::Word => enc.u16(value as u16),
            _ => {
                assert!(
                    i32::try_from(value).is_ok(),
                    "immediate does not fit a 32-bit field"
                );
                enc.u32(value as u32);
            }
        }
    }
}

/// SSE scalar operation: [prefix] 0F op /r with xmm or memory r/m.
fn encode_sse(
    enc: &mut Enc,
    prefix: Option<u8>,
    op: u8,
    rex_w: bool,
    reg: Register,
    operands: &Operands,
) {
    let reg_code = code_of(reg);
    match operands {
        Operands::RegReg(src, _) => {
            encode_op(enc, prefix, false, rex_w, &[0x0F, op], reg_code, Rm::Reg(code_of(*src)), false);
        }
        Operands::MemReg(mem, _) => {
            encode_op(enc, prefix, false, rex_w, &[0x0F, op], reg_code, Rm::Mem(&mem.addr), false);
        }
        Operands::RegMem(_, mem) => {
            encode_op(enc, prefix, false, rex_w, &[0x0F, op], reg_code, Rm::Mem(&mem.addr), false);
        }
        _ => panic!("unsupported operand shape for vector operation"),
    }
}

/// Single-operand integer group (F6/F7, FE/FF families) with a digit.
fn encode_unary(enc: &mut Enc, base: u8, digit: u8, operands: &Operands) {
    match operands {
        Operands::Reg(reg) => {
            let (opsize, rex_w) = width_bits(reg.width);
            let op = op_for_width(base, reg.width);
            encode_op(enc, None, opsize, rex_w, &[op], digit, Rm::Reg(code_of(*reg)), needs_byte_rex(*reg));
        }
        Operands::Mem(mem) => {
            let (opsize, rex_w) = width_bits(mem.width);
            let op = op_for_width(base, mem.width);
            encode_op(enc, None, opsize, rex_w, &[op], digit, Rm::Mem(&mem.addr), false);
        }
        _ => panic!("unsupported operand shape for unary operation"),
    }
}

/// x87 memory form selected by access width.
fn encode_x87_mem(enc: &mut Enc, mem: &MemoryOperand, table: &[(Width, u8, u8)]) {
    for (width, op, digit) in table {
        if mem.width == *width {
            encode_op(enc, None, false, false, &[*op], *digit, Rm::Mem(&mem.addr), false);
            return;
        }
    }
    panic!("unsupported extended-precision operand width");
}

/// x87 register form: escape byte plus stack-position opcode.
fn encode_x87_reg(enc: &mut Enc, escape: u8, base: u8, operands: &Operands) {
    let slot = match operands {
        Operands::Reg(reg) => reg.id.st_slot().expect("float-stack register"),
        Operands::None => 1,
        _ => panic!("unsupported operand shape for float-stack operation"),
    };
    enc.u8(escape);
    enc.u8(base + slot);
}

/// Condition-code byte for the jcc/setcc groups.
fn cond_code(opcode: Opcode) -> u8 {
    use Opcode::*;
    match opcode {
        Je | Sete => 0x4,
        Jne | Setne => 0x5,
        Ja | Seta => 0x7,
        Jna | Setna => 0x6,
        Jae | Setae => 0x3,
        Jnae | Setnae => 0x2,
        Jg | Setg => 0xF,
        Jng | Setng => 0xE,
        Jge | Setge => 0xD,
        Jnge | Setnge => 0xC,
        Js => 0x8,
        Jns => 0x9,
        Jp | Setp => 0xA,
        Setnp => 0xB,
        _ => panic!("not a conditional operation"),
    }
}

/// Encode one instruction into its machine-code bytes.
pub fn encode(instr: &Instruction) -> Vec<u8> {
    let mut enc = Enc::new();
    use Opcode::*;

    match instr.opcode {
        Add | Or | And | Sub | Xor | Cmp => {
            let (base, digit) = match instr.opcode {
                Add => (0x00, 0),
                Or => (0x08, 1),
                And => (0x20, 4),
                Sub => (0x28, 5),
                Xor => (0x30, 6),
                _ => (0x38, 7),
            };
            match &instr.operands {
                Operands::RegReg(src, dst) => {
                    let (opsize, rex_w) = width_bits(dst.width);
                    let op = op_for_width(base, dst.width);
                    let force = needs_byte_rex(*src) || needs_byte_rex(*dst);
                    encode_op(&mut enc, None, opsize, rex_w, &[op], code_of(*src), Rm::Reg(code_of(*dst)), force);
                }
                Operands::RegMem(src, mem) => {
                    let (opsize, rex_w) = width_bits(mem.width);
                    let op = op_for_width(base, mem.width);
                    encode_op(&mut enc, None, opsize, rex_w, &[op], code_of(*src), Rm::Mem(&mem.addr), needs_byte_rex(*src));
                }
                Operands::MemReg(mem, dst) => {
                    let (opsize, rex_w) = width_bits(dst.width);
                    let op = op_for_width(base + 2, dst.width);
                    encode_op(&mut enc, None, opsize, rex_w, &[op], code_of(*dst), Rm::Mem(&mem.addr), needs_byte_rex(*dst));
                }
                Operands::ImmReg(imm, dst) => {
                    encode_alu_imm(&mut enc, digit, dst.width, int_value(imm), Rm::Reg(code_of(*dst)), needs_byte_rex(*dst));
                }
                Operands::ImmMem(imm, mem) => {
                    encode_alu_imm(&mut enc, digit, mem.width, int_value(imm), Rm::Mem(&mem.addr), false);
                }
                _ => panic!("unsupported operand shape for ALU operation"),
            }
        }
        Test => match &instr.operands {
            Operands::RegReg(src, dst) => {
                let (opsize, rex_w) = width_bits(dst.width);
                let op = op_for_width(0x84, dst.width);
                let force = needs_byte_rex(*src) || needs_byte_rex(*dst);
                encode_op(&mut enc, None, opsize, rex_w, &[op], code_of(*src), Rm::Reg(code_of(*dst)), force);
            }
            Operands::RegMem(src, mem) => {
                let (opsize, rex_w) = width_bits(mem.width);
                let op = op_for_width(0x84, mem.width);
                encode_op(&mut enc, None, opsize, rex_w, &[op], code_of(*src), Rm::Mem(&mem.addr), needs_byte_rex(*src));
            }
            Operands::ImmReg(imm, dst) => {
                let (opsize, rex_w) = width_bits(dst.width);
                let op = op_for_width(0xF6, dst.width);
                encode_op(&mut enc, None, opsize, rex_w, &[op], 0, Rm::Reg(code_of(*dst)), needs_byte_rex(*dst));
                let value = int_value(imm);
                match dst.width {
                    Width::Byte => enc.u8(value as u8),
                    Width::Word => enc.u16(value as u16),
                    _ => enc.u32(value as u32),
                }
            }
            _ => panic!("unsupported operand shape for test"),
        },
        Mov => match &instr.operands {
            Operands::RegReg(src, dst) => {
                let (opsize, rex_w) = width_bits(dst.width);
                let op = op_for_width(0x88, dst.width);
                let force = needs_byte_rex(*src) || needs_byte_rex(*dst);
                encode_op(&mut enc, None, opsize, rex_w, &[op], code_of(*src), Rm::Reg(code_of(*dst)), force);
            }
            Operands::RegMem(src, mem) => {
                let (opsize, rex_w) = width_bits(mem.width);
                let op = op_for_width(0x88, mem.width);
                encode_op(&mut enc, None, opsize, rex_w, &[op], code_of(*src), Rm::Mem(&mem.addr), needs_byte_rex(*src));
            }
            Operands::MemReg(mem, dst) => {
                let (opsize, rex_w) = width_bits(dst.width);
                let op = op_for_width(0x8A, dst.width);
                encode_op(&mut enc, None, opsize, rex_w, &[op], code_of(*dst), Rm::Mem(&mem.addr), needs_byte_rex(*dst));
            }
            Operands::ImmReg(imm, dst) => {
                let code = code_of(*dst);
                // An address-valued immediate loads a 64-bit slot; the value
                // is not position-relative, so no relocation applies.
                let value = match imm {
                    Immediate::Addr(_) => 0,
                    _ => int_value(imm),
                };
                match dst.width {
                    Width::Byte => {
                        let rex = 0x40 | (code >= 8) as u8;
                        if rex != 0x40 || needs_byte_rex(*dst) {
                            enc.u8(rex);
                        }
                        enc.u8(0xB0 + (code & 7));
                        enc.u8(value as u8);
                    }
                    Width::Word => {
                        enc.u8(0x66);
                        if code >= 8 {
                            enc.u8(0x41);
                        }
                        enc.u8(0xB8 + (code & 7));
                        enc.u16(value as u16);
                    }
                    Width::Long => {
                        if code >= 8 {
                            enc.u8(0x41);
                        }
                        enc.u8(0xB8 + (code & 7));
                        enc.u32(value as u32);
                    }
                    Width::Quad => {
                        if i32::try_from(value).is_ok() && !matches!(imm, Immediate::Addr(_)) {
                            encode_op(&mut enc, None, false, true, &[0xC7], 0, Rm::Reg(code), false);
                            enc.u32(value as u32);
                        } else {
                            enc.u8(0x48 | (code >= 8) as u8);
                            enc.u8(0xB8 + (code & 7));
                            enc.u64(value as u64);
                        }
                    }
                    Width::Tword => panic!("unsupported move width"),
                }
            }
            Operands::ImmMem(imm, mem) => {
                let (opsize, rex_w) = width_bits(mem.width);
                let op = op_for_width(0xC6, mem.width);
                encode_op(&mut enc, None, opsize, rex_w, &[op], 0, Rm::Mem(&mem.addr), false);
                let value = int_value(imm);
                match mem.width {
                    Width::Byte => enc.u8(value as u8),
                    Width::Word => enc.u16(value as u16),
                    _ => {
                        assert!(
                            i32::try_from(value).is_ok(),
                            "immediate does not fit a 32-bit field"
                        );
                        enc.u32(value as u32);
                    }
                }
            }
            _ => panic!("unsupported operand shape for mov"),
        },
        Movzx | Movsx => {
            let (src_width, reg, rm, force) = match &instr.operands {
                Operands::RegReg(src, dst) => {
                    (src.width, *dst, Rm::Reg(code_of(*src)), needs_byte_rex(*src))
                }
                Operands::MemReg(mem, dst) => (mem.width, *dst, Rm::Mem(&mem.addr), false),
                _ => panic!("unsupported operand shape for extension move"),
            };
            assert!(src_width < reg.width, "extension requires source < destination");
            let (opsize, rex_w) = width_bits(reg.width);
            let opcode: &[u8] = match (instr.opcode, src_width) {
                (Movzx, Width::Byte) => &[0x0F, 0xB6],
                (Movzx, Width::Word) => &[0x0F, 0xB7],
                (Movsx, Width::Byte) => &[0x0F, 0xBE],
                (Movsx, Width::Word) => &[0x0F, 0xBF],
                (Movsx, Width::Long) => &[0x63],
                _ => panic!("unsupported extension source width"),
            };
            encode_op(&mut enc, None, opsize, rex_w, opcode, code_of(reg), rm, force);
        }
        Lea => {
            let Operands::MemReg(mem, dst) = &instr.operands else {
                panic!("lea requires a memory source and register destination");
            };
            let (opsize, rex_w) = width_bits(dst.width);
            encode_op(&mut enc, None, opsize, rex_w, &[0x8D], code_of(*dst), Rm::Mem(&mem.addr), false);
        }
        Shl | Shr | Sar => {
            let digit = match instr.opcode {
                Shl => 4,
                Shr => 5,
                _ => 7,
            };
            match &instr.operands {
                Operands::ImmReg(imm, dst) => {
                    let (opsize, rex_w) = width_bits(dst.width);
                    let value = int_value(imm);
                    let op = op_for_width(if value == 1 { 0xD0 } else { 0xC0 }, dst.width);
                    encode_op(&mut enc, None, opsize, rex_w, &[op], digit, Rm::Reg(code_of(*dst)), needs_byte_rex(*dst));
                    if value != 1 {
                        enc.u8(value as u8);
                    }
                }
                Operands::RegReg(count, dst) => {
                    assert_eq!(count.id, RegId::Cx, "variable shift count must be in CL");
                    let (opsize, rex_w) = width_bits(dst.width);
                    let op = op_for_width(0xD2, dst.width);
                    encode_op(&mut enc, None, opsize, rex_w, &[op], digit, Rm::Reg(code_of(*dst)), needs_byte_rex(*dst));
                }
                _ => panic!("unsupported operand shape for shift"),
            }
        }
        Not => encode_unary(&mut enc, 0xF6, 2, &instr.operands),
        Mul => encode_unary(&mut enc, 0xF6, 4, &instr.operands),
        Div => encode_unary(&mut enc, 0xF6, 6, &instr.operands),
        Idiv => encode_unary(&mut enc, 0xF6, 7, &instr.operands),
        Inc => encode_unary(&mut enc, 0xFE, 0, &instr.operands),
        Dec => encode_unary(&mut enc, 0xFE, 1, &instr.operands),
        Push => match &instr.operands {
            Operands::Reg(reg) => {
                let code = code_of(*reg);
                if reg.width == Width::Word {
                    enc.u8(0x66);
                }
                if code >= 8 {
                    enc.u8(0x41);
                }
                enc.u8(0x50 + (code & 7));
            }
            Operands::Mem(mem) => {
                encode_op(&mut enc, None, false, false, &[0xFF], 6, Rm::Mem(&mem.addr), false);
            }
            Operands::Imm(imm) => {
                let value = int_value(imm);
                if (-128..=127).contains(&value) {
                    enc.u8(0x6A);
                    enc.u8(value as u8);
                } else {
                    enc.u8(0x68);
                    enc.u32(value as u32);
                }
            }
            _ => panic!("unsupported operand shape for push"),
        },
        Pop => match &instr.operands {
            Operands::Reg(reg) => {
                let code = code_of(*reg);
                if reg.width == Width::Word {
                    enc.u8(0x66);
                }
                if code >= 8 {
                    enc.u8(0x41);
                }
                enc.u8(0x58 + (code & 7));
            }
            Operands::Mem(mem) => {
                encode_op(&mut enc, None, false, false, &[0x8F], 0, Rm::Mem(&mem.addr), false);
            }
            _ => panic!("unsupported operand shape for pop"),
        },
        Call => match &instr.operands {
            Operands::Imm(_) => {
                enc.u8(0xE8);
                enc.u32(0);
            }
            Operands::Reg(reg) => {
                encode_op(&mut enc, None, false, false, &[0xFF], 2, Rm::Reg(code_of(*reg)), false);
            }
            Operands::Mem(mem) => {
                encode_op(&mut enc, None, false, false, &[0xFF], 2, Rm::Mem(&mem.addr), false);
            }
            _ => panic!("unsupported operand shape for call"),
        },
        Jmp => match &instr.operands {
            Operands::Imm(_) => {
                enc.u8(0xE9);
                enc.u32(0);
            }
            Operands::Reg(reg) => {
                encode_op(&mut enc, None, false, false, &[0xFF], 4, Rm::Reg(code_of(*reg)), false);
            }
            Operands::Mem(mem) => {
                encode_op(&mut enc, None, false, false, &[0xFF], 4, Rm::Mem(&mem.addr), false);
            }
            _ => panic!("unsupported operand shape for jmp"),
        },
        Je | Ja | Jna | Jg | Jng | Js | Jp | Jae | Jnae | Jge | Jnge | Jne | Jns => {
            enc.u8(0x0F);
            enc.u8(0x80 + cond_code(instr.opcode));
            enc.u32(0);
        }
        Sete | Seta | Setna | Setg | Setng | Setp | Setae | Setnae | Setge | Setnge | Setnp
        | Setne => {
            let rm = match &instr.operands {
                Operands::Reg(reg) => {
                    assert_eq!(reg.width, Width::Byte, "setcc writes a byte register");
                    (Rm::Reg(code_of(*reg)), needs_byte_rex(*reg))
                }
                Operands::Mem(mem) => (Rm::Mem(&mem.addr), false),
                _ => panic!("unsupported operand shape for setcc"),
            };
            encode_op(&mut enc, None, false, false, &[0x0F, 0x90 + cond_code(instr.opcode)], 0, rm.0, rm.1);
        }
        Ret => enc.u8(0xC3),
        Leave => enc.u8(0xC9),
        Cdq => enc.u8(0x99),
        Cqo => {
            enc.u8(0x48);
            enc.u8(0x99);
        }
        RepMovsq => {
            enc.u8(0xF3);
            enc.u8(0x48);
            enc.u8(0xA5);
        }
        Movss | Movsd => {
            let prefix = if instr.opcode == Movss { 0xF3 } else { 0xF2 };
            match &instr.operands {
                Operands::RegReg(_, dst) | Operands::MemReg(_, dst) => {
                    encode_sse(&mut enc, Some(prefix), 0x10, false, *dst, &instr.operands);
                }
                Operands::RegMem(src, _) => {
                    encode_sse(&mut enc, Some(prefix), 0x11, false, *src, &instr.operands);
                }
                _ => panic!("unsupported operand shape for vector move"),
            }
        }
        Movaps => match &instr.operands {
            Operands::RegReg(_, dst) | Operands::MemReg(_, dst) => {
                encode_sse(&mut enc, None, 0x28, false, *dst, &instr.operands);
            }
            Operands::RegMem(src, _) => {
                encode_sse(&mut enc, None, 0x29, false, *src, &instr.operands);
            }
            _ => panic!("unsupported operand shape for movaps"),
        },
        Addss | Addsd | Subss | Subsd | Mulss | Mulsd | Divss | Divsd => {
            let prefix = match instr.opcode {
                Addss | Subss | Mulss | Divss => 0xF3,
                _ => 0xF2,
            };
            let op = match instr.opcode {
                Addss | Addsd => 0x58,
                Subss | Subsd => 0x5C,
                Mulss | Mulsd => 0x59,
                _ => 0x5E,
            };
            let dst = match &instr.operands {
                Operands::RegReg(_, dst) | Operands::MemReg(_, dst) => *dst,
                _ => panic!("unsupported operand shape for vector arithmetic"),
            };
            encode_sse(&mut enc, Some(prefix), op, false, dst, &instr.operands);
        }
        Ucomiss | Ucomisd => {
            let prefix = if instr.opcode == Ucomisd { Some(0x66) } else { None };
            let dst = match &instr.operands {
                Operands::RegReg(_, dst) | Operands::MemReg(_, dst) => *dst,
                _ => panic!("unsupported operand shape for vector compare"),
            };
            encode_sse(&mut enc, prefix, 0x2E, false, dst, &instr.operands);
        }
        Pxor => {
            let dst = match &instr.operands {
                Operands::RegReg(_, dst) | Operands::MemReg(_, dst) => *dst,
                _ => panic!("unsupported operand shape for pxor"),
            };
            encode_sse(&mut enc, Some(0x66), 0xEF, false, dst, &instr.operands);
        }
        Cvtss2sd | Cvtsd2ss => {
            let prefix = if instr.opcode == Cvtss2sd { 0xF3 } else { 0xF2 };
            let dst = match &instr.operands {
                Operands::RegReg(_, dst) | Operands::MemReg(_, dst) => *dst,
                _ => panic!("unsupported operand shape for conversion"),
            };
            encode_sse(&mut enc, Some(prefix), 0x5A, false, dst, &instr.operands);
        }
        Cvtsi2ss | Cvtsi2sd => {
            let prefix = if instr.opcode == Cvtsi2ss { 0xF3 } else { 0xF2 };
            let (src_width, dst) = match &instr.operands {
                Operands::RegReg(src, dst) => (src.width, *dst),
                Operands::MemReg(mem, dst) => (mem.width, *dst),
                _ => panic!("unsupported operand shape for conversion"),
            };
            encode_sse(&mut enc, Some(prefix), 0x2A, src_width == Width::Quad, dst, &instr.operands);
        }
        Cvttss2si | Cvttsd2si => {
            let prefix = if instr.opcode == Cvttss2si { 0xF3 } else { 0xF2 };
            let dst = match &instr.operands {
                Operands::RegReg(_, dst) | Operands::MemReg(_, dst) => *dst,
                _ => panic!("unsupported operand shape for conversion"),
            };
            encode_sse(&mut enc, Some(prefix), 0x2C, dst.width == Width::Quad, dst, &instr.operands);
        }
        Fld => match &instr.operands {
            Operands::Mem(mem) => encode_x87_mem(
                &mut enc,
                mem,
                &[(Width::Long, 0xD9, 0), (Width::Quad, 0xDD, 0), (Width::Tword, 0xDB, 5)],
            ),
            _ => encode_x87_reg(&mut enc, 0xD9, 0xC0, &instr.operands),
        },
        Fstp => match &instr.operands {
            Operands::Mem(mem) => encode_x87_mem(
                &mut enc,
                mem,
                &[(Width::Long, 0xD9, 3), (Width::Quad, 0xDD, 3), (Width::Tword, 0xDB, 7)],
            ),
            _ => encode_x87_reg(&mut enc, 0xDD, 0xD8, &instr.operands),
        },
        Fild => match &instr.operands {
            Operands::Mem(mem) => encode_x87_mem(
                &mut enc,
                mem,
                &[(Width::Word, 0xDF, 0), (Width::Long, 0xDB, 0), (Width::Quad, 0xDF, 5)],
            ),
            _ => panic!("fild requires a memory operand"),
        },
        Fistp => match &instr.operands {
            Operands::Mem(mem) => encode_x87_mem(
                &mut enc,
                mem,
                &[(Width::Word, 0xDF, 3), (Width::Long, 0xDB, 3), (Width::Quad, 0xDF, 7)],
            ),
            _ => panic!("fistp requires a memory operand"),
        },
        Fnstcw => match &instr.operands {
            Operands::Mem(mem) => {
                encode_op(&mut enc, None, false, false, &[0xD9], 7, Rm::Mem(&mem.addr), false);
            }
            _ => panic!("fnstcw requires a memory operand"),
        },
        Fldcw => match &instr.operands {
            Operands::Mem(mem) => {
                encode_op(&mut enc, None, false, false, &[0xD9], 5, Rm::Mem(&mem.addr), false);
            }
            _ => panic!("fldcw requires a memory operand"),
        },
        Fxch => encode_x87_reg(&mut enc, 0xD9, 0xC8, &instr.operands),
        Fucomip => encode_x87_reg(&mut enc, 0xDF, 0xE8, &instr.operands),
        Faddp => encode_x87_reg(&mut enc, 0xDE, 0xC0, &instr.operands),
        Fmulp => encode_x87_reg(&mut enc, 0xDE, 0xC8, &instr.operands),
        Fsubrp => encode_x87_reg(&mut enc, 0xDE, 0xE0, &instr.operands),
        Fdivrp => encode_x87_reg(&mut enc, 0xDE, 0xF8, &instr.operands),
        // Runtime-support code is embedded verbatim, never encoded.
        Builtin => {}
    }

    enc.bytes
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::operand::Address;

    fn reg(id: RegId, w: Width) -> Register {
        Register::new(id, w)
    }

    fn mem(addr: Address, w: Width) -> MemoryOperand {
        MemoryOperand::new(addr, w)
    }

    #[test]
    fn test_mov_imm32_to_eax() {
        let instr = Instruction::new(
            Opcode::Mov,
            Operands::ImmReg(Immediate::int(Width::Long, 42), reg(RegId::Ax, Width::Long)),
        );
        assert_eq!(encode(&instr), vec![0xB8, 0x2A, 0x00, 0x00, 0x00]);
    }

    #[test]
    fn test_mov_imm32_to_r64() {
        let instr = Instruction::new(
            Opcode::Mov,
            Operands::ImmReg(Immediate::int(Width::Quad, 1), reg(RegId::Ax, Width::Quad)),
        );
        assert_eq!(encode(&instr), vec![0x48, 0xC7, 0xC0, 0x01, 0x00, 0x00, 0x00]);
    }

    #[test]
    fn test_mov_imm64_to_r64() {
        let instr = Instruction::new(
            Opcode::Mov,
            Operands::ImmReg(
                Immediate::int(Width::Quad, 0x1_0000_0000),
                reg(RegId::Ax, Width::Quad),
            ),
        );
        assert_eq!(
            encode(&instr),
            vec![0x48, 0xB8, 0, 0, 0, 0, 1, 0, 0, 0]
        );
    }

    #[test]
    fn test_mov_rr_64() {
        let instr = Instruction::new(
            Opcode::Mov,
            Operands::RegReg(reg(RegId::Di, Width::Quad), reg(RegId::Ax, Width::Quad)),
        );
        assert_eq!(encode(&instr), vec![0x48, 0x89, 0xF8]);
    }

    #[test]
    fn test_add_rr_32() {
        let instr = Instruction::new(
            Opcode::Add,
            Operands::RegReg(reg(RegId::Cx, Width::Long), reg(RegId::Ax, Width::Long)),
        );
        assert_eq!(encode(&instr), vec![0x01, 0xC8]);
    }

    #[test]
    fn test_add_imm8_short_form() {
        let instr = Instruction::new(
            Opcode::Add,
            Operands::ImmReg(Immediate::int(Width::Quad, 8), reg(RegId::Sp, Width::Quad)),
        );
        assert_eq!(encode(&instr), vec![0x48, 0x83, 0xC4, 0x08]);
    }

    #[test]
    fn test_extended_register_rex() {
        let instr = Instruction::new(
            Opcode::Mov,
            Operands::RegReg(reg(RegId::R8, Width::Quad), reg(RegId::R15, Width::Quad)),
        );
        assert_eq!(encode(&instr), vec![0x4D, 0x89, 0xC7]);
    }

    #[test]
    fn test_load_base_disp8() {
        let instr = Instruction::new(
            Opcode::Mov,
            Operands::MemReg(
                mem(Address::base_disp(RegId::Bp, -8), Width::Quad),
                reg(RegId::Ax, Width::Quad),
            ),
        );
        assert_eq!(encode(&instr), vec![0x48, 0x8B, 0x45, 0xF8]);
    }

    #[test]
    fn test_load_rsp_base_needs_sib() {
        let instr = Instruction::new(
            Opcode::Mov,
            Operands::MemReg(
                mem(Address::base_disp(RegId::Sp, 0), Width::Quad),
                reg(RegId::Ax, Width::Quad),
            ),
        );
        assert_eq!(encode(&instr), vec![0x48, 0x8B, 0x04, 0x24]);
    }

    #[test]
    fn test_load_scaled_index() {
        let instr = Instruction::new(
            Opcode::Mov,
            Operands::MemReg(
                mem(Address::base_index(RegId::Ax, RegId::Cx, 8, 0), Width::Quad),
                reg(RegId::Dx, Width::Quad),
            ),
        );
        assert_eq!(encode(&instr), vec![0x48, 0x8B, 0x14, 0xC8]);
    }

    #[test]
    fn test_rip_relative_placeholder() {
        let instr = Instruction::new(
            Opcode::Mov,
            Operands::MemReg(
                mem(Address::rip_relative("value"), Width::Long),
                reg(RegId::Ax, Width::Long),
            ),
        );
        assert_eq!(encode(&instr), vec![0x8B, 0x05, 0, 0, 0, 0]);
    }

    #[test]
    fn test_jmp_placeholder() {
        let instr = Instruction::new(
            Opcode::Jmp,
            Operands::Imm(Immediate::Addr(Address::symbolic("main", 0))),
        );
        assert_eq!(encode(&instr), vec![0xE9, 0, 0, 0, 0]);
    }

    #[test]
    fn test_jcc_length() {
        let instr = Instruction::new(
            Opcode::Jne,
            Operands::Imm(Immediate::Addr(Address::symbolic("loop", 0))),
        );
        assert_eq!(encode(&instr), vec![0x0F, 0x85, 0, 0, 0, 0]);
    }

    #[test]
    fn test_call_and_indirect_call() {
        let direct = Instruction::new(
            Opcode::Call,
            Operands::Imm(Immediate::Addr(Address::symbolic("f", 0))),
        );
        assert_eq!(encode(&direct), vec![0xE8, 0, 0, 0, 0]);

        let indirect =
            Instruction::new(Opcode::Call, Operands::Reg(reg(RegId::Ax, Width::Quad)));
        assert_eq!(encode(&indirect), vec![0xFF, 0xD0]);
    }

    #[test]
    fn test_push_pop() {
        let push = Instruction::new(Opcode::Push, Operands::Reg(reg(RegId::Bp, Width::Quad)));
        let pop = Instruction::new(Opcode::Pop, Operands::Reg(reg(RegId::Bp, Width::Quad)));
        assert_eq!(encode(&push), vec![0x55]);
        assert_eq!(encode(&pop), vec![0x5D]);

        let push_ext = Instruction::new(Opcode::Push, Operands::Reg(reg(RegId::R12, Width::Quad)));
        assert_eq!(encode(&push_ext), vec![0x41, 0x54]);
    }

    #[test]
    fn test_ret_and_leave() {
        assert_eq!(encode(&Instruction::op0(Opcode::Ret)), vec![0xC3]);
        assert_eq!(encode(&Instruction::op0(Opcode::Leave)), vec![0xC9]);
        assert_eq!(encode(&Instruction::op0(Opcode::Cqo)), vec![0x48, 0x99]);
    }

    #[test]
    fn test_setcc_byte_register() {
        let instr = Instruction::new(Opcode::Sete, Operands::Reg(reg(RegId::Ax, Width::Byte)));
        assert_eq!(encode(&instr), vec![0x0F, 0x94, 0xC0]);
    }

    #[test]
    fn test_spl_requires_rex() {
        let instr = Instruction::new(Opcode::Sete, Operands::Reg(reg(RegId::Sp, Width::Byte)));
        assert_eq!(encode(&instr), vec![0x40, 0x0F, 0x94, 0xC4]);
    }

    #[test]
    fn test_movzx_byte_to_long() {
        let instr = Instruction::new(
            Opcode::Movzx,
            Operands::RegReg(reg(RegId::Ax, Width::Byte), reg(RegId::Ax, Width::Long)),
        );
        assert_eq!(encode(&instr), vec![0x0F, 0xB6, 0xC0]);
    }

    #[test]
    fn test_movslq() {
        let instr = Instruction::new(
            Opcode::Movsx,
            Operands::RegReg(reg(RegId::Cx, Width::Long), reg(RegId::Cx, Width::Quad)),
        );
        assert_eq!(encode(&instr), vec![0x48, 0x63, 0xC9]);
    }

    #[test]
    fn test_movsd_load_store() {
        let load = Instruction::new(
            Opcode::Movsd,
            Operands::MemReg(
                mem(Address::rip_relative("d"), Width::Quad),
                reg(RegId::Xmm0, Width::Quad),
            ),
        );
        assert_eq!(encode(&load), vec![0xF2, 0x0F, 0x10, 0x05, 0, 0, 0, 0]);

        let store = Instruction::new(
            Opcode::Movsd,
            Operands::RegMem(
                reg(RegId::Xmm0, Width::Quad),
                mem(Address::base_disp(RegId::Bp, -16), Width::Quad),
            ),
        );
        assert_eq!(encode(&store), vec![0xF2, 0x0F, 0x11, 0x45, 0xF0]);
    }

    #[test]
    fn test_addsd_rr() {
        let instr = Instruction::new(
            Opcode::Addsd,
            Operands::RegReg(reg(RegId::Xmm1, Width::Quad), reg(RegId::Xmm0, Width::Quad)),
        );
        assert_eq!(encode(&instr), vec![0xF2, 0x0F, 0x58, 0xC1]);
    }

    #[test]
    fn test_cvtsi2sd_quad_source() {
        let instr = Instruction::new(
            Opcode::Cvtsi2sd,
            Operands::RegReg(reg(RegId::Ax, Width::Quad), reg(RegId::Xmm0, Width::Quad)),
        );
        assert_eq!(encode(&instr), vec![0xF2, 0x48, 0x0F, 0x2A, 0xC0]);
    }

    #[test]
    fn test_fld_quad_memory() {
        let instr = Instruction::new(
            Opcode::Fld,
            Operands::Mem(mem(Address::base_disp(RegId::Bp, -8), Width::Quad)),
        );
        assert_eq!(encode(&instr), vec![0xDD, 0x45, 0xF8]);
    }

    #[test]
    fn test_faddp_default() {
        let instr = Instruction::op0(Opcode::Faddp);
        assert_eq!(encode(&instr), vec![0xDE, 0xC1]);
    }

    #[test]
    fn test_idiv_reg() {
        let instr = Instruction::new(Opcode::Idiv, Operands::Reg(reg(RegId::Cx, Width::Quad)));
        assert_eq!(encode(&instr), vec![0x48, 0xF7, 0xF9]);
    }

    #[test]
    fn test_builtin_has_no_encoding() {
        assert!(encode(&Instruction::op0(Opcode::Builtin)).is_empty());
    }
}

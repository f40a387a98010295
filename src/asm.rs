//! Textual assembler backend.
//!
//! Renders the instruction/symbol stream as AT&T-syntax assembly for an
//! external assembler. Output goes to any `io::Write`; the session tracks the
//! current symbol (for the closing `.size` directive, whose value is only
//! known once the next symbol arrives) and the extended-precision float-stack
//! depth (stack registers are named by current position, not fixed id).

use std::io::{self, Write};

use log::debug;

use crate::backend::{Backend, BackendError};
use crate::instruction::{Instruction, Opcode, Operands};
use crate::operand::{Address, AddressKind, Immediate, Register, Width};
use crate::symbol::{FloatValue, Linkage, Symbol, SymbolKind};

/// General-purpose register names, indexed by hardware code and width class.
const GP_NAMES: [[&str; 4]; 16] = [
    ["%al", "%ax", "%eax", "%rax"],
    ["%cl", "%cx", "%ecx", "%rcx"],
    ["%dl", "%dx", "%edx", "%rdx"],
    ["%bl", "%bx", "%ebx", "%rbx"],
    ["%spl", "%sp", "%esp", "%rsp"],
    ["%bpl", "%bp", "%ebp", "%rbp"],
    ["%sil", "%si", "%esi", "%rsi"],
    ["%dil", "%di", "%edi", "%rdi"],
    ["%r8b", "%r8w", "%r8d", "%r8"],
    ["%r9b", "%r9w", "%r9d", "%r9"],
    ["%r10b", "%r10w", "%r10d", "%r10"],
    ["%r11b", "%r11w", "%r11d", "%r11"],
    ["%r12b", "%r12w", "%r12d", "%r12"],
    ["%r13b", "%r13w", "%r13d", "%r13"],
    ["%r14b", "%r14w", "%r14d", "%r14"],
    ["%r15b", "%r15w", "%r15d", "%r15"],
];

const XMM_NAMES: [&str; 16] = [
    "%xmm0", "%xmm1", "%xmm2", "%xmm3", "%xmm4", "%xmm5", "%xmm6", "%xmm7", "%xmm8", "%xmm9",
    "%xmm10", "%xmm11", "%xmm12", "%xmm13", "%xmm14", "%xmm15",
];

const X87_NAMES: [&str; 8] = [
    "%st(0)", "%st(1)", "%st(2)", "%st(3)", "%st(4)", "%st(5)", "%st(6)", "%st(7)",
];

/// Integer width suffix: b/w/l/q.
fn int_suffix(w: Width) -> char {
    match w {
        Width::Byte => 'b',
        Width::Word => 'w',
        Width::Long => 'l',
        _ => 'q',
    }
}

/// Extended-precision memory suffix: s/l/t for 4/8/extended bytes.
fn x87_suffix(w: Width) -> char {
    match w {
        Width::Long => 's',
        Width::Quad => 'l',
        _ => 't',
    }
}

/// Integer-to-extended memory suffix: s/l/q for 2/4/8 bytes.
fn x87_int_suffix(w: Width) -> char {
    match w {
        Width::Word => 's',
        Width::Long => 'l',
        _ => 'q',
    }
}

/// Textual backend session.
pub struct AsmWriter<W: Write> {
    out: W,
    current: Option<Symbol>,
    x87_depth: usize,
}

impl<W: Write> AsmWriter<W> {
    pub fn new(out: W) -> Self {
        Self {
            out,
            current: None,
            x87_depth: 0,
        }
    }

    /// Emit the `.file` directive naming the translation unit.
    pub fn emit_file(&mut self, path: &str) -> io::Result<()> {
        writeln!(self.out, "\t.file\t\"{}\"", path)
    }

    /// Consume the session, returning the output sink. Call `finalize` first
    /// so the trailing size directive is not lost.
    pub fn into_inner(self) -> W {
        self.out
    }

    fn mnemonic(&self, reg: Register) -> &'static str {
        if reg.id == crate::operand::RegId::Ip {
            assert_eq!(reg.width, Width::Quad, "instruction pointer is quad only");
            return "%rip";
        }
        if let Some(code) = reg.id.gp_code() {
            let class = match reg.width {
                Width::Byte => 0,
                Width::Word => 1,
                Width::Long => 2,
                Width::Quad => 3,
                Width::Tword => panic!("no general-purpose register at extended width"),
            };
            return GP_NAMES[code as usize][class];
        }
        if let Some(code) = reg.id.xmm_code() {
            return XMM_NAMES[code as usize];
        }
        let slot = reg.id.st_slot().expect("register class") as usize;
        let pos = self
            .x87_depth
            .checked_sub(1 + slot)
            .expect("float-stack slot below current depth");
        X87_NAMES[pos]
    }

    fn format_address(&self, addr: &Address) -> String {
        let mut text = String::new();
        if let Some(name) = &addr.symbol {
            text.push_str(name);
            match addr.kind {
                AddressKind::GlobalOffset => {
                    assert_eq!(addr.disp, 0, "GOT reference with displacement");
                    text.push_str("@GOTPCREL");
                }
                AddressKind::Plt => {
                    assert_eq!(addr.disp, 0, "PLT reference with displacement");
                    text.push_str("@PLT");
                }
                AddressKind::Plain => {
                    if addr.disp != 0 {
                        text.push_str(&format!("{:+}", addr.disp));
                    }
                }
            }
        } else if addr.disp != 0 {
            text.push_str(&addr.disp.to_string());
        }

        if let Some(base) = addr.base {
            text.push('(');
            text.push_str(self.mnemonic(Register::new(base, Width::Quad)));
            if let Some((index, scale)) = addr.index {
                text.push(',');
                text.push_str(self.mnemonic(Register::new(index, Width::Quad)));
                text.push_str(&format!(",{}", scale));
            }
            text.push(')');
        }
        text
    }

    /// Immediate operand text plus its width contribution to the suffix.
    fn format_immediate(&self, imm: &Immediate) -> (String, Width) {
        match imm {
            Immediate::Int { width, value } => {
                let text = match width {
                    Width::Byte => format!("${}", *value as i8),
                    Width::Word => format!("${}", *value as i16),
                    Width::Long => format!("${}", *value as i32),
                    _ => format!("${}", value),
                };
                (text, *width)
            }
            Immediate::Addr(addr) => {
                assert!(addr.symbol.is_some(), "address immediate without symbol");
                (self.format_address(addr), Width::Quad)
            }
            Immediate::Str { .. } => panic!("string immediate as instruction operand"),
        }
    }

    fn write_escaped(&mut self, data: &[u8]) -> io::Result<()> {
        let mut text = String::from('"');
        for &byte in data {
            match byte {
                b'"' => text.push_str("\\\""),
                b'\\' => text.push_str("\\\\"),
                b'\n' => text.push_str("\\n"),
                b'\t' => text.push_str("\\t"),
                b'\r' => text.push_str("\\r"),
                0x20..=0x7e => text.push(byte as char),
                _ => text.push_str(&format!("\\{:03o}", byte)),
            }
        }
        text.push('"');
        self.out.write_all(text.as_bytes())
    }

    fn i0(&mut self, m: &str) -> io::Result<()> {
        writeln!(self.out, "\t{}", m)
    }

    fn i1(&mut self, m: &str, a: &str) -> io::Result<()> {
        writeln!(self.out, "\t{}\t{}", m, a)
    }

    fn i2(&mut self, m: &str, a: &str, b: &str) -> io::Result<()> {
        writeln!(self.out, "\t{}\t{}, {}", m, a, b)
    }

    fn u1(&mut self, m: &str, w: Width, a: &str) -> io::Result<()> {
        writeln!(self.out, "\t{}{}\t{}", m, int_suffix(w), a)
    }

    fn u2(&mut self, m: &str, w: Width, a: &str, b: &str) -> io::Result<()> {
        writeln!(self.out, "\t{}{}\t{}, {}", m, int_suffix(w), a, b)
    }

    fn x1(&mut self, m: &str, w: Width, a: &str) -> io::Result<()> {
        writeln!(self.out, "\t{}{}\t{}", m, x87_suffix(w), a)
    }

    fn y1(&mut self, m: &str, w: Width, a: &str) -> io::Result<()> {
        writeln!(self.out, "\t{}{}\t{}", m, x87_int_suffix(w), a)
    }

    /// Close out the previous symbol. A function definition gets its size
    /// directive here, since the body length is only known at this point.
    fn flush(&mut self) -> io::Result<()> {
        if let Some(sym) = self.current.take() {
            if sym.is_function() && matches!(sym.kind, SymbolKind::Definition) {
                writeln!(self.out, "\t.size\t{}, .-{}", sym.name, sym.name)?;
            }
        }
        Ok(())
    }

    fn declare_symbol(&mut self, sym: &Symbol) -> io::Result<()> {
        // Labels stay in the same function context; everything else closes
        // the previous symbol first.
        if !matches!(sym.kind, SymbolKind::Label) {
            self.flush()?;
            self.current = Some(sym.clone());
        }
        debug!("declare {} ({:?})", sym.name, sym.kind);

        match &sym.kind {
            SymbolKind::Tentative => {
                assert!(!sym.is_function(), "tentative definition of a function");
                if sym.linkage == Linkage::Internal {
                    writeln!(self.out, "\t.local {}", sym.name)?;
                }
                writeln!(
                    self.out,
                    "\t.comm {},{},{}",
                    sym.name,
                    sym.size(),
                    sym.alignment()
                )?;
            }
            SymbolKind::Definition => {
                if sym.is_function() {
                    self.i0(".text")?;
                    if sym.linkage == Linkage::External {
                        self.i1(".globl", &sym.name)?;
                    }
                    writeln!(self.out, "\t.type\t{}, @function", sym.name)?;
                    writeln!(self.out, "{}:", sym.name)?;
                } else {
                    self.i0(".data")?;
                    if sym.linkage == Linkage::External {
                        self.i1(".globl", &sym.name)?;
                    }
                    writeln!(self.out, "\t.align\t{}", sym.alignment())?;
                    writeln!(self.out, "\t.type\t{}, @object", sym.name)?;
                    writeln!(self.out, "\t.size\t{}, {}", sym.name, sym.size())?;
                    writeln!(self.out, "{}:", sym.name)?;
                }
            }
            SymbolKind::StringValue(data) => {
                self.i0(".data")?;
                writeln!(self.out, "\t.align\t{}", sym.alignment())?;
                writeln!(self.out, "\t.type\t{}, @object", sym.name)?;
                writeln!(self.out, "\t.size\t{}, {}", sym.name, sym.size())?;
                writeln!(self.out, "{}:", sym.name)?;
                write!(self.out, "\t.string\t")?;
                let data = data.clone();
                self.write_escaped(&data)?;
                writeln!(self.out)?;
            }
            SymbolKind::FloatConstant(value) => {
                self.i0(".section\t.rodata")?;
                writeln!(self.out, "\t.align\t{}", sym.alignment())?;
                writeln!(self.out, "{}:", sym.name)?;
                match value {
                    FloatValue::Single(f) => {
                        writeln!(self.out, "\t.long\t{}", f.to_bits())?;
                    }
                    FloatValue::Double(d) => {
                        writeln!(self.out, "\t.quad\t{}", d.to_bits() as i64)?;
                    }
                    FloatValue::Extended { lo, hi } => {
                        writeln!(self.out, "\t.quad\t{}", *lo as i64)?;
                        writeln!(self.out, "\t.quad\t{}", (hi & 0xFFFF) as i64)?;
                    }
                }
            }
            SymbolKind::Label => {
                writeln!(self.out, "{}:", sym.name)?;
            }
            // Jump tables reach textual output as ordinary data definitions.
            SymbolKind::Table | SymbolKind::TableEntry => {}
        }
        Ok(())
    }

    fn emit_text(&mut self, instr: &Instruction) -> io::Result<()> {
        let mut ws = Width::Quad;
        let mut wd = Width::Quad;
        let mut source: Option<String> = None;
        let mut dest: Option<String> = None;

        match &instr.operands {
            Operands::Reg(reg) | Operands::RegReg(reg, _) | Operands::RegMem(reg, _) => {
                ws = reg.width;
                source = Some(self.mnemonic(*reg).to_string());
            }
            Operands::Imm(imm) | Operands::ImmReg(imm, _) | Operands::ImmMem(imm, _) => {
                if instr.opcode.is_jump() {
                    let Immediate::Addr(addr) = imm else {
                        panic!("jump without label target");
                    };
                    source = addr.symbol.clone();
                } else {
                    let (text, w) = self.format_immediate(imm);
                    ws = w;
                    source = Some(text);
                }
            }
            Operands::Mem(mem) | Operands::MemReg(mem, _) => {
                ws = mem.width;
                source = Some(self.format_address(&mem.addr));
            }
            Operands::None => {}
        }

        match &instr.operands {
            Operands::RegReg(_, reg) | Operands::MemReg(_, reg) | Operands::ImmReg(_, reg) => {
                wd = reg.width;
                dest = Some(self.mnemonic(*reg).to_string());
            }
            Operands::RegMem(_, mem) | Operands::ImmMem(_, mem) => {
                wd = mem.width;
                dest = Some(self.format_address(&mem.addr));
            }
            _ => {}
        }

        let src = source.as_deref().unwrap_or_default().to_string();
        let dst = dest.as_deref().unwrap_or_default().to_string();

        use Opcode::*;
        match instr.opcode {
            Add => self.u2("add", wd, &src, &dst)?,
            Addsd => self.i2("addsd", &src, &dst)?,
            Addss => self.i2("addss", &src, &dst)?,
            Cvtss2sd => self.i2("cvtss2sd", &src, &dst)?,
            Cvtsd2ss => self.i2("cvtsd2ss", &src, &dst)?,
            Cvtsi2ss => self.u2("cvtsi2ss", ws, &src, &dst)?,
            Cvtsi2sd => self.u2("cvtsi2sd", ws, &src, &dst)?,
            Cvttsd2si => self.u2("cvttsd2si", wd, &src, &dst)?,
            Cvttss2si => self.u2("cvttss2si", wd, &src, &dst)?,
            Cdq => self.i0("cdq")?,
            Cqo => self.i0("cqo")?,
            Div => self.u1("div", ws, &src)?,
            Divsd => self.i2("divsd", &src, &dst)?,
            Divss => self.i2("divss", &src, &dst)?,
            Sub => self.u2("sub", wd, &src, &dst)?,
            Subsd => self.i2("subsd", &src, &dst)?,
            Subss => self.i2("subss", &src, &dst)?,
            Not => self.u1("not", ws, &src)?,
            Mul => self.u1("mul", ws, &src)?,
            Xor => self.u2("xor", wd, &src, &dst)?,
            And => self.u2("and", wd, &src, &dst)?,
            Or => self.u2("or", wd, &src, &dst)?,
            Shl => self.u2("shl", wd, &src, &dst)?,
            Shr => self.u2("shr", wd, &src, &dst)?,
            Sar => self.u2("sar", wd, &src, &dst)?,
            Idiv => self.u1("idiv", ws, &src)?,
            Mov => self.u2("mov", wd, &src, &dst)?,
            Movzx => {
                assert!(matches!(ws, Width::Byte | Width::Word));
                assert!(ws < wd, "zero extension requires source < destination");
                let m = if ws == Width::Byte { "movzb" } else { "movzw" };
                self.u2(m, wd, &src, &dst)?;
            }
            Movsx => {
                assert!(matches!(ws, Width::Byte | Width::Word | Width::Long));
                assert!(ws < wd, "sign extension requires source < destination");
                let m = match ws {
                    Width::Byte => "movsb",
                    Width::Word => "movsw",
                    _ => "movsl",
                };
                self.u2(m, wd, &src, &dst)?;
            }
            Movaps => self.i2("movaps", &src, &dst)?,
            Movss => self.i2("movss", &src, &dst)?,
            Movsd => self.i2("movsd", &src, &dst)?,
            Mulsd => self.i2("mulsd", &src, &dst)?,
            Mulss => self.i2("mulss", &src, &dst)?,
            Sete => self.i1("sete", &src)?,
            Seta => self.i1("seta", &src)?,
            Setna => self.i1("setna", &src)?,
            Setg => self.i1("setg", &src)?,
            Setng => self.i1("setng", &src)?,
            Setp => self.i1("setp", &src)?,
            Setae => self.i1("setae", &src)?,
            Setnae => self.i1("setnae", &src)?,
            Setge => self.i1("setge", &src)?,
            Setnge => self.i1("setnge", &src)?,
            Setnp => self.i1("setnp", &src)?,
            Setne => self.i1("setne", &src)?,
            Test => self.u2("test", wd, &src, &dst)?,
            Ucomiss => self.i2("ucomiss", &src, &dst)?,
            Ucomisd => self.i2("ucomisd", &src, &dst)?,
            Cmp => self.u2("cmp", wd, &src, &dst)?,
            Lea => self.u2("lea", wd, &src, &dst)?,
            Push => self.u1("push", ws, &src)?,
            Pop => self.u1("pop", ws, &src)?,
            Pxor => self.i2("pxor", &src, &dst)?,
            Jmp => self.i1("jmp", &src)?,
            Je => self.i1("je", &src)?,
            Ja => self.i1("ja", &src)?,
            Jna => self.i1("jna", &src)?,
            Jg => self.i1("jg", &src)?,
            Jng => self.i1("jng", &src)?,
            Js => self.i1("js", &src)?,
            Jp => self.i1("jp", &src)?,
            Jae => self.i1("jae", &src)?,
            Jnae => self.i1("jnae", &src)?,
            Jge => self.i1("jge", &src)?,
            Jnge => self.i1("jnge", &src)?,
            Jne => self.i1("jne", &src)?,
            Jns => self.i1("jns", &src)?,
            Call => {
                // A call through a register needs the indirection marker.
                if matches!(instr.operands, Operands::Reg(_)) {
                    writeln!(self.out, "\tcall\t*{}", src)?;
                } else {
                    self.i1("call", &src)?;
                }
            }
            Leave => self.i0("leave")?,
            Ret => self.i0("ret")?,
            RepMovsq => self.i0("rep movsq")?,
            Fld => self.x1("fld", ws, &src)?,
            Fild => self.y1("fild", ws, &src)?,
            Fstp => {
                if matches!(instr.operands, Operands::Reg(_)) {
                    self.i1("fstp", &src)?;
                } else {
                    self.x1("fstp", ws, &src)?;
                }
            }
            Fxch => self.i1("fxch", &src)?,
            Fnstcw => self.i1("fnstcw", &src)?,
            Fldcw => self.i1("fldcw", &src)?,
            Fistp => self.y1("fistp", ws, &src)?,
            Fucomip => self.i1("fucomip", &src)?,
            Faddp => self.i1("faddp", &src)?,
            Fsubrp => self.i1("fsubrp", &src)?,
            Fmulp => self.i1("fmulp", &src)?,
            Fdivrp => self.i1("fdivrp", &src)?,
            Inc => self.u1("inc", ws, &src)?,
            Dec => self.u1("dec", ws, &src)?,
            Builtin => self.i0("(builtin)")?,
        }

        match instr.opcode {
            Fld | Fild => self.x87_depth += 1,
            Fstp | Fistp | Faddp | Fsubrp | Fmulp | Fdivrp | Fucomip => {
                self.x87_depth = self.x87_depth.saturating_sub(1);
            }
            _ => {}
        }
        Ok(())
    }

    fn emit_datum(&mut self, data: &Immediate) -> io::Result<()> {
        match data {
            Immediate::Int { width, value } => match width {
                Width::Byte => writeln!(self.out, "\t.byte\t{}", *value as i8)?,
                Width::Word => writeln!(self.out, "\t.short\t{}", *value as i16)?,
                Width::Long => writeln!(self.out, "\t.int\t{}", *value as i32)?,
                _ => writeln!(self.out, "\t.quad\t{}", value)?,
            },
            Immediate::Addr(addr) => {
                let name = addr.symbol.as_deref().expect("address datum without symbol");
                if addr.disp != 0 {
                    writeln!(
                        self.out,
                        "\t.quad\t{}{}{}",
                        name,
                        if addr.disp < 0 { "" } else { "+" },
                        addr.disp
                    )?;
                } else {
                    writeln!(self.out, "\t.quad\t{}", name)?;
                }
            }
            Immediate::Str { width, data } => {
                if *width == data.len() {
                    write!(self.out, "\t.ascii\t")?;
                } else {
                    assert_eq!(*width, data.len() + 1, "string width mismatch");
                    write!(self.out, "\t.string\t")?;
                }
                let data = data.clone();
                self.write_escaped(&data)?;
                writeln!(self.out)?;
            }
        }
        Ok(())
    }
}

impl AsmWriter<Vec<u8>> {
    /// Drain the accumulated text, keeping session state. Used by the JIT
    /// dump listing to render one instruction at a time.
    pub fn take_output(&mut self) -> Vec<u8> {
        std::mem::take(&mut self.out)
    }
}

impl<W: Write> Backend for AsmWriter<W> {
    fn declare(&mut self, symbol: &Symbol) -> Result<(), BackendError> {
        self.declare_symbol(symbol)?;
        Ok(())
    }

    fn emit_instruction(&mut self, instr: Instruction) -> Result<(), BackendError> {
        self.emit_text(&instr)?;
        Ok(())
    }

    fn emit_data(&mut self, data: Immediate) -> Result<(), BackendError> {
        self.emit_datum(&data)?;
        Ok(())
    }

    fn finalize(&mut self) -> Result<(), BackendError> {
        self.flush()?;
        self.out.flush()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::operand::{MemoryOperand, RegId};
    use crate::symbol::Linkage;

    fn writer() -> AsmWriter<Vec<u8>> {
        AsmWriter::new(Vec::new())
    }

    fn text(w: AsmWriter<Vec<u8>>) -> String {
        String::from_utf8(w.into_inner()).unwrap()
    }

    #[test]
    fn test_mov_imm_to_reg() {
        let mut w = writer();
        w.emit_text(&Instruction::new(
            Opcode::Mov,
            Operands::ImmReg(
                Immediate::int(Width::Long, 42),
                Register::new(RegId::Ax, Width::Long),
            ),
        ))
        .unwrap();
        assert_eq!(text(w), "\tmovl\t$42, %eax\n");
    }

    #[test]
    fn test_register_width_names() {
        let w = writer();
        assert_eq!(w.mnemonic(Register::new(RegId::Ax, Width::Byte)), "%al");
        assert_eq!(w.mnemonic(Register::new(RegId::Ax, Width::Word)), "%ax");
        assert_eq!(w.mnemonic(Register::new(RegId::R11, Width::Long)), "%r11d");
        assert_eq!(w.mnemonic(Register::new(RegId::R11, Width::Quad)), "%r11");
        assert_eq!(w.mnemonic(Register::new(RegId::Xmm3, Width::Quad)), "%xmm3");
    }

    #[test]
    fn test_address_with_base_index() {
        let w = writer();
        let addr = Address::base_index(RegId::Bx, RegId::Cx, 4, -8);
        assert_eq!(w.format_address(&addr), "-8(%rbx,%rcx,4)");
    }

    #[test]
    fn test_got_plt_suffixes() {
        let w = writer();
        let got = Address::symbolic_with_kind("errno", AddressKind::GlobalOffset);
        let plt = Address::symbolic_with_kind("printf", AddressKind::Plt);
        assert_eq!(w.format_address(&got), "errno@GOTPCREL");
        assert_eq!(w.format_address(&plt), "printf@PLT");
    }

    #[test]
    fn test_symbolic_displacement_sign() {
        let w = writer();
        assert_eq!(w.format_address(&Address::symbolic("tab", 8)), "tab+8");
        assert_eq!(w.format_address(&Address::symbolic("tab", -8)), "tab-8");
    }

    #[test]
    fn test_function_flush_emits_size() {
        let mut w = writer();
        w.declare(&Symbol::function("main", Linkage::External))
            .unwrap();
        w.emit_instruction(Instruction::op0(Opcode::Ret)).unwrap();
        w.finalize().unwrap();
        let out = text(w);
        assert_eq!(
            out,
            "\t.text\n\t.globl\tmain\n\t.type\tmain, @function\nmain:\n\tret\n\t.size\tmain, .-main\n"
        );
    }

    #[test]
    fn test_tentative_common_storage() {
        let mut w = writer();
        w.declare(&Symbol::tentative("buf", Linkage::Internal, 64, 32))
            .unwrap();
        assert_eq!(text(w), "\t.local buf\n\t.comm buf,64,32\n");
    }

    #[test]
    fn test_float_constant_bit_pattern() {
        let mut w = writer();
        w.declare(&Symbol::float_constant("half", FloatValue::Single(1.5)))
            .unwrap();
        let out = text(w);
        assert!(out.contains("\t.long\t1069547520\n"), "got: {}", out);
    }

    #[test]
    fn test_extended_constant_masks_high_word() {
        let mut w = writer();
        w.declare(&Symbol::float_constant(
            "pi",
            FloatValue::Extended {
                lo: 0xC90FDAA22168C235,
                hi: 0xFFFF_FFFF_FFFF_4000,
            },
        ))
        .unwrap();
        let out = text(w);
        assert!(out.ends_with("\t.quad\t16384\n"), "got: {}", out);
    }

    #[test]
    fn test_string_data_tagging() {
        let mut w = writer();
        w.emit_datum(&Immediate::string(2, *b"hi")).unwrap();
        w.emit_datum(&Immediate::string(3, *b"hi")).unwrap();
        assert_eq!(text(w), "\t.ascii\t\"hi\"\n\t.string\t\"hi\"\n");
    }

    #[test]
    fn test_string_escaping() {
        let mut w = writer();
        w.emit_datum(&Immediate::string(5, *b"a\n\x01\"")).unwrap();
        assert_eq!(text(w), "\t.string\t\"a\\n\\001\\\"\"\n");
    }

    #[test]
    fn test_extension_move_suffixes() {
        let mut w = writer();
        w.emit_text(&Instruction::new(
            Opcode::Movzx,
            Operands::RegReg(
                Register::new(RegId::Ax, Width::Byte),
                Register::new(RegId::Ax, Width::Long),
            ),
        ))
        .unwrap();
        w.emit_text(&Instruction::new(
            Opcode::Movsx,
            Operands::RegReg(
                Register::new(RegId::Cx, Width::Long),
                Register::new(RegId::Cx, Width::Quad),
            ),
        ))
        .unwrap();
        assert_eq!(text(w), "\tmovzbl\t%al, %eax\n\tmovslq\t%ecx, %rcx\n");
    }

    #[test]
    #[should_panic]
    fn test_extension_move_rejects_narrowing() {
        let mut w = writer();
        let _ = w.emit_text(&Instruction::new(
            Opcode::Movsx,
            Operands::RegReg(
                Register::new(RegId::Ax, Width::Quad),
                Register::new(RegId::Ax, Width::Long),
            ),
        ));
    }

    #[test]
    fn test_indirect_call_marker() {
        let mut w = writer();
        w.emit_text(&Instruction::new(
            Opcode::Call,
            Operands::Reg(Register::new(RegId::Ax, Width::Quad)),
        ))
        .unwrap();
        w.emit_text(&Instruction::new(
            Opcode::Call,
            Operands::Imm(Immediate::Addr(Address::symbolic_with_kind(
                "printf",
                AddressKind::Plt,
            ))),
        ))
        .unwrap();
        assert_eq!(text(w), "\tcall\t*%rax\n\tcall\tprintf@PLT\n");
    }

    #[test]
    fn test_float_stack_naming() {
        let mut w = writer();
        // Two loads push the stack; the first slot is now below the top.
        w.emit_text(&Instruction::new(
            Opcode::Fld,
            Operands::Mem(MemoryOperand::new(
                Address::base_disp(RegId::Bp, -16),
                Width::Quad,
            )),
        ))
        .unwrap();
        w.emit_text(&Instruction::new(
            Opcode::Fld,
            Operands::Mem(MemoryOperand::new(
                Address::base_disp(RegId::Bp, -24),
                Width::Quad,
            )),
        ))
        .unwrap();
        assert_eq!(w.x87_depth, 2);
        assert_eq!(w.mnemonic(Register::new(RegId::St0, Width::Tword)), "%st(1)");
        assert_eq!(w.mnemonic(Register::new(RegId::St1, Width::Tword)), "%st(0)");
    }

    #[test]
    fn test_jump_table_data() {
        let mut w = writer();
        w.emit_datum(&Immediate::Addr(Address::symbolic("case_1", 0)))
            .unwrap();
        w.emit_datum(&Immediate::Addr(Address::symbolic("case_2", 16)))
            .unwrap();
        assert_eq!(text(w), "\t.quad\tcase_1\n\t.quad\tcase_2+16\n");
    }
}

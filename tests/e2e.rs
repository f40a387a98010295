//! End-to-end scenarios driving the backends through the front-end contract.

use std::io::Read;

use pretty_assertions::assert_eq as assert_text_eq;

use jitcc::asm::AsmWriter;
use jitcc::jit::JitUnit;
use jitcc::jit::support::{Builtin, BuiltinSource};
use jitcc::{
    Address, Backend, FloatValue, Immediate, Instruction, JitOptions, Linkage, MemoryOperand,
    Opcode, Operands, RegId, Register, Symbol, Width,
};

fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

fn jit_unit() -> JitUnit {
    JitUnit::new(&JitOptions {
        support_library: None,
        ..JitOptions::default()
    })
}

fn mov_imm_reg(value: i64, id: RegId, width: Width) -> Instruction {
    Instruction::new(
        Opcode::Mov,
        Operands::ImmReg(Immediate::int(width, value), Register::new(id, width)),
    )
}

/// Drive one small translation unit through a backend: a string constant, a
/// float constant, a tentative global, and a function.
fn drive_unit(backend: &mut dyn Backend) {
    backend
        .declare(&Symbol::string_value(".LC0", *b"hello"))
        .unwrap();
    backend
        .declare(&Symbol::float_constant(".LC1", FloatValue::Single(1.5)))
        .unwrap();
    backend
        .declare(&Symbol::tentative("counter", Linkage::External, 4, 4))
        .unwrap();
    backend
        .declare(&Symbol::function("main", Linkage::External))
        .unwrap();
    backend
        .emit_instruction(mov_imm_reg(42, RegId::Ax, Width::Long))
        .unwrap();
    backend
        .emit_instruction(Instruction::op0(Opcode::Ret))
        .unwrap();
}

#[test]
fn asm_unit_output() {
    init_logging();
    let mut asm = AsmWriter::new(Vec::new());
    asm.emit_file("hello.c").unwrap();
    drive_unit(&mut asm);
    asm.finalize().unwrap();

    let text = String::from_utf8(asm.into_inner()).unwrap();
    assert_text_eq!(
        text,
        "\t.file\t\"hello.c\"\n\
         \t.data\n\
         \t.align\t1\n\
         \t.type\t.LC0, @object\n\
         \t.size\t.LC0, 6\n\
         .LC0:\n\
         \t.string\t\"hello\"\n\
         \t.section\t.rodata\n\
         \t.align\t4\n\
         .LC1:\n\
         \t.long\t1069547520\n\
         \t.comm counter,4,4\n\
         \t.text\n\
         \t.globl\tmain\n\
         \t.type\tmain, @function\n\
         main:\n\
         \tmovl\t$42, %eax\n\
         \tret\n\
         \t.size\tmain, .-main\n"
    );
}

#[test]
fn asm_output_to_file() {
    init_logging();
    let file = tempfile::NamedTempFile::new().unwrap();
    let mut asm = AsmWriter::new(file.reopen().unwrap());
    drive_unit(&mut asm);
    asm.finalize().unwrap();

    let mut text = String::new();
    file.reopen().unwrap().read_to_string(&mut text).unwrap();
    assert!(text.ends_with("\t.size\tmain, .-main\n"));
}

/// The two backends must agree bit-for-bit on float encodings: the textual
/// backend's emitted pattern and the JIT's raw little-endian bytes.
#[test]
fn float_encoding_parity() {
    init_logging();
    let value = 1.5f32;

    let mut asm = AsmWriter::new(Vec::new());
    asm.declare(&Symbol::float_constant("f", FloatValue::Single(value)))
        .unwrap();
    let text = String::from_utf8(asm.into_inner()).unwrap();
    assert!(text.contains(&format!("\t.long\t{}\n", value.to_bits())));

    let mut unit = jit_unit();
    let offset = unit.label_address("memcpy").unwrap() as usize + 33;
    unit.declare(&Symbol::float_constant("f", FloatValue::Single(value)))
        .unwrap();
    unit.fix().unwrap();
    let image = unit.image().unwrap();
    assert_eq!(&image[offset..offset + 4], &[0x00, 0x00, 0xC0, 0x3F]);
    assert_eq!(
        u32::from_le_bytes(image[offset..offset + 4].try_into().unwrap()),
        value.to_bits()
    );
}

#[test]
fn jit_forward_reference_patch() {
    init_logging();
    let mut unit = jit_unit();
    // The startup jump references main before anything is declared.
    unit.declare(&Symbol::string_value(".LC0", *b"padding"))
        .unwrap();
    unit.declare(&Symbol::function("main", Linkage::External))
        .unwrap();
    unit.emit_instruction(mov_imm_reg(7, RegId::Ax, Width::Long))
        .unwrap();
    unit.emit_instruction(Instruction::op0(Opcode::Ret)).unwrap();
    unit.fix().unwrap();

    let main_addr = unit.label_address("main").unwrap() as usize;
    let image = unit.image().unwrap();
    assert_eq!(image[0], 0xE9);
    let disp = u32::from_le_bytes(image[1..5].try_into().unwrap()) as usize;
    assert_eq!(disp, main_addr - 5);
}

#[test]
fn jit_builtin_enumeration_terminates() {
    init_logging();
    struct StubLibrary;
    impl BuiltinSource for StubLibrary {
        fn lookup(&self, index: u32) -> Option<Builtin> {
            match index {
                1 => Some(Builtin {
                    name: "__builtin_print".to_string(),
                    func: std::ptr::null(),
                    args: 1,
                    uses_float: false,
                }),
                2 => Some(Builtin {
                    name: "__builtin_sqrt".to_string(),
                    func: std::ptr::null(),
                    args: 1,
                    uses_float: true,
                }),
                _ => None,
            }
        }
    }

    let unit = JitUnit::with_builtin_source(Box::new(StubLibrary));
    assert_eq!(unit.label_address("__builtin_print"), Some(-1));
    assert_eq!(unit.label_address("__builtin_sqrt"), Some(-2));
    assert!(unit.label_address("__builtin_other").is_none());
    assert!(unit.builtin("__builtin_sqrt").unwrap().uses_float);
    assert_eq!(unit.builtin("__builtin_print").unwrap().args, 1);
}

#[test]
fn jit_finalize_clears_unit() {
    init_logging();
    let mut unit = jit_unit();
    drive_unit(&mut unit);
    unit.fix().unwrap();
    assert!(unit.image().is_some());

    unit.finalize().unwrap();
    assert!(unit.image().is_none());
    assert!(unit.label_address("main").is_none());
    assert!(unit.label_address("setjmp").is_none());
}

#[test]
fn jit_unresolved_relocation_is_observable() {
    init_logging();
    let mut unit = jit_unit();
    unit.declare(&Symbol::function("main", Linkage::External))
        .unwrap();
    unit.emit_instruction(Instruction::new(
        Opcode::Call,
        Operands::Imm(Immediate::Addr(Address::symbolic("undefined_fn", 0))),
    ))
    .unwrap();
    unit.emit_instruction(Instruction::op0(Opcode::Ret)).unwrap();
    unit.fix().unwrap();
    assert_eq!(unit.unresolved(), &["undefined_fn".to_string()]);
}

#[cfg(target_arch = "x86_64")]
mod execution {
    use super::*;

    #[test]
    fn run_returns_42() {
        init_logging();
        let mut unit = jit_unit();
        unit.declare(&Symbol::function("main", Linkage::External))
            .unwrap();
        unit.emit_instruction(mov_imm_reg(42, RegId::Ax, Width::Long))
            .unwrap();
        unit.emit_instruction(Instruction::op0(Opcode::Ret)).unwrap();

        assert_eq!(unit.run().unwrap(), 42);
        assert_eq!(unit.return_value(), 42);
        unit.finalize().unwrap();
    }

    #[test]
    fn run_with_arithmetic() {
        init_logging();
        let mut unit = jit_unit();
        unit.declare(&Symbol::function("main", Linkage::External))
            .unwrap();
        unit.emit_instruction(mov_imm_reg(40, RegId::Ax, Width::Long))
            .unwrap();
        unit.emit_instruction(mov_imm_reg(2, RegId::Cx, Width::Long))
            .unwrap();
        unit.emit_instruction(Instruction::new(
            Opcode::Add,
            Operands::RegReg(
                Register::new(RegId::Cx, Width::Long),
                Register::new(RegId::Ax, Width::Long),
            ),
        ))
        .unwrap();
        unit.emit_instruction(Instruction::op0(Opcode::Ret)).unwrap();

        assert_eq!(unit.run().unwrap(), 42);
    }

    #[test]
    fn run_with_control_flow() {
        init_logging();
        let mut unit = jit_unit();
        unit.declare(&Symbol::function("main", Linkage::External))
            .unwrap();
        // Compare equal values, branch over the failure path.
        unit.emit_instruction(mov_imm_reg(5, RegId::Ax, Width::Long))
            .unwrap();
        unit.emit_instruction(Instruction::new(
            Opcode::Cmp,
            Operands::ImmReg(
                Immediate::int(Width::Long, 5),
                Register::new(RegId::Ax, Width::Long),
            ),
        ))
        .unwrap();
        unit.emit_instruction(Instruction::new(
            Opcode::Je,
            Operands::Imm(Immediate::Addr(Address::symbolic(".L_ok", 0))),
        ))
        .unwrap();
        unit.emit_instruction(mov_imm_reg(0, RegId::Ax, Width::Long))
            .unwrap();
        unit.emit_instruction(Instruction::op0(Opcode::Ret)).unwrap();
        unit.declare(&Symbol::label(".L_ok")).unwrap();
        unit.emit_instruction(mov_imm_reg(42, RegId::Ax, Width::Long))
            .unwrap();
        unit.emit_instruction(Instruction::op0(Opcode::Ret)).unwrap();

        assert_eq!(unit.run().unwrap(), 42);
    }

    #[test]
    fn run_reads_global_data() {
        init_logging();
        let mut unit = jit_unit();
        unit.declare(&Symbol::object("answer", Linkage::Internal, 8, 8))
            .unwrap();
        unit.emit_data(Immediate::int(Width::Long, 42)).unwrap();
        unit.emit_data(Immediate::int(Width::Long, 0)).unwrap();
        unit.declare(&Symbol::function("main", Linkage::External))
            .unwrap();
        unit.emit_instruction(Instruction::new(
            Opcode::Mov,
            Operands::MemReg(
                MemoryOperand::new(Address::rip_relative("answer"), Width::Long),
                Register::new(RegId::Ax, Width::Long),
            ),
        ))
        .unwrap();
        unit.emit_instruction(Instruction::op0(Opcode::Ret)).unwrap();

        assert_eq!(unit.run().unwrap(), 42);
    }

    #[test]
    fn run_calls_helper_function() {
        init_logging();
        let mut unit = jit_unit();
        unit.declare(&Symbol::function("main", Linkage::External))
            .unwrap();
        unit.emit_instruction(Instruction::new(
            Opcode::Call,
            Operands::Imm(Immediate::Addr(Address::symbolic("helper", 0))),
        ))
        .unwrap();
        unit.emit_instruction(Instruction::op0(Opcode::Ret)).unwrap();
        unit.declare(&Symbol::function("helper", Linkage::Internal))
            .unwrap();
        unit.emit_instruction(mov_imm_reg(42, RegId::Ax, Width::Long))
            .unwrap();
        unit.emit_instruction(Instruction::op0(Opcode::Ret)).unwrap();

        assert_eq!(unit.run().unwrap(), 42);
    }
}

//! JIT backend: instruction/symbol/data to executable bytes.
//!
//! The unit accepts the same three-call sequence as the textual backend, but
//! the outcome is machine code in an in-process buffer that can be run and
//! later finalized. Emission appends records to an append-only log at
//! monotonically increasing logical addresses; the log is only ever revisited
//! to patch already-written bytes, never to reorder them. Fixing the unit
//! resolves label references in two phases: a relocation pass over the log,
//! then materialization into an executable region.

pub mod encode;
pub mod memory;
pub mod runtime;
pub mod support;

use std::io::{self, Write};

use log::{debug, error, warn};

use crate::asm::AsmWriter;
use crate::backend::{Backend, BackendError};
use crate::config::JitOptions;
use crate::instruction::{Instruction, Opcode, Operands};
use crate::operand::{Address, Immediate};
use crate::symbol::{FloatValue, Symbol, SymbolKind};
use encode::encode;
use memory::ExecutableMemory;
use runtime::{
    ATEXIT_LABEL, ENTRY_LABEL, ONEXIT_BUILTIN, ONSTART_BUILTIN, RUNTIME_BLOB, STARTUP_JMP_LEN,
    STARTUP_LABEL,
};
use support::{Builtin, BuiltinSource, SupportLibrary};

/// Lifecycle of a compilation unit.
///
/// Construction performs initialization, so a freshly created unit is already
/// emitting. `Running` is entered only for the duration of execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnitState {
    Emitting,
    Fixed,
    Running,
    Finalized,
}

/// One entry of the label table: a name resolved either to a logical address
/// inside the unit (non-negative) or to a builtin (negative index).
struct LabelEntry {
    name: String,
    index: i64,
    builtin: Option<Builtin>,
}

/// Payload of one emission record.
enum Payload {
    /// Named position, no bytes of its own.
    Label { name: String },
    /// Encoded instruction. The originating instruction is kept for the
    /// patch-offset decision and the dump listing.
    Code { bytes: Vec<u8>, instr: Instruction },
    /// Sized little-endian integer; also zero-initialized tentative storage.
    Int { size: usize, value: u64 },
    Float { bits: u32 },
    Double { bits: u64 },
    Extended { lo: u64, hi: u64 },
    /// Byte string, optionally NUL-terminated.
    Bytes { data: Vec<u8>, nul: bool },
    /// 8-byte absolute address slot (address datum or jump-table entry),
    /// resolved to base-of-buffer + target address during fix-up.
    Addr { addend: u64 },
}

/// One record of the append-only emission log.
struct EmitRecord {
    addr: usize,
    end: usize,
    hidden: bool,
    label_ref: bool,
    /// Referenced label for relocation, or owning symbol for the listing.
    target: Option<String>,
    payload: Payload,
}

fn find_label(labels: &[LabelEntry], name: &str) -> Option<i64> {
    labels.iter().find(|l| l.name == name).map(|l| l.index)
}

/// Offset of the trailing 32-bit displacement field inside encoded bytes.
///
/// For shapes whose memory operand is the destination, an immediate may
/// follow the displacement, so the field position is derived from the prefix
/// pattern (operand-size, REX.W, two-byte SSE opcode). Otherwise the field is
/// the last four bytes.
fn patch_offset(bytes: &[u8], operands: &Operands) -> usize {
    match operands {
        Operands::ImmMem(..) | Operands::RegMem(..) => {
            if bytes.len() >= 8 && (bytes[0] == 0xF2 || bytes[0] == 0xF3) && bytes[1] == 0x0F {
                4
            } else if bytes[0] == 0x66 || (0x48..=0x4F).contains(&bytes[0]) {
                3
            } else {
                2
            }
        }
        _ => bytes.len() - 4,
    }
}

/// Displacement carried by the patched memory operand, added to the relative
/// offset during fix-up.
fn patch_disp(operands: &Operands) -> i32 {
    match operands {
        Operands::ImmMem(_, mem) | Operands::RegMem(_, mem) => mem.addr.disp,
        Operands::MemReg(mem, _) => mem.addr.disp,
        _ => 0,
    }
}

/// A JIT compilation unit.
///
/// All backend state is owned here; separate units coexist independently.
pub struct JitUnit {
    state: UnitState,
    /// Next logical address.
    addr: usize,
    records: Vec<EmitRecord>,
    labels: Vec<LabelEntry>,
    /// Relocation high-water mark: records below it are already patched.
    passed: usize,
    /// Index of the startup placeholder-jump record.
    startup_jmp: usize,
    buffer: Option<ExecutableMemory>,
    /// Symbol owning subsequent data emissions.
    current: Option<Symbol>,
    /// Symbol that owned the previous data emission, for label hiding.
    previous: Option<String>,
    /// Keeps the optional support library alive until finalization.
    support: Option<Box<dyn BuiltinSource>>,
    /// Targets whose relocation was skipped because they did not resolve.
    unresolved: Vec<String>,
    return_value: i32,
    main_found: bool,
}

impl JitUnit {
    /// Initialize a unit, loading the support library named by `options` if
    /// it is available.
    pub fn new(options: &JitOptions) -> Self {
        let mut unit = Self::empty();
        if let Some(name) = &options.support_library {
            if let Some(library) = SupportLibrary::open(name) {
                unit.install_builtins(&library);
                unit.support = Some(Box::new(library));
            }
        }
        unit.emit_runtime();
        unit
    }

    /// Initialize a unit against an explicit builtin source.
    pub fn with_builtin_source(source: Box<dyn BuiltinSource>) -> Self {
        let mut unit = Self::empty();
        unit.install_builtins(source.as_ref());
        unit.support = Some(source);
        unit.emit_runtime();
        unit
    }

    fn empty() -> Self {
        Self {
            state: UnitState::Emitting,
            addr: 0,
            records: Vec::new(),
            labels: Vec::new(),
            passed: 0,
            startup_jmp: 0,
            buffer: None,
            current: None,
            previous: None,
            support: None,
            unresolved: Vec::new(),
            return_value: 0,
            main_found: false,
        }
    }

    /// Enumerate builtins from index 1 until the first empty lookup,
    /// registering each under a negative label index.
    fn install_builtins(&mut self, source: &dyn BuiltinSource) {
        for index in 1u32.. {
            let Some(builtin) = source.lookup(index) else {
                break;
            };
            debug!("builtin {} registered at index -{}", builtin.name, index);
            self.labels.push(LabelEntry {
                name: builtin.name.clone(),
                index: -(index as i64),
                builtin: Some(builtin),
            });
        }
    }

    /// Embed the fixed startup sequence at the bottom of the unit.
    fn emit_runtime(&mut self) {
        for piece in RUNTIME_BLOB {
            self.push_label(piece.label);
            let instr = if piece.label == STARTUP_LABEL {
                self.startup_jmp = self.records.len();
                Instruction::new(
                    Opcode::Jmp,
                    Operands::Imm(Immediate::Addr(Address::symbolic(ENTRY_LABEL, 0))),
                )
            } else {
                Instruction::op0(Opcode::Builtin)
            };
            let end = self.addr + piece.code.len();
            self.records.push(EmitRecord {
                addr: self.addr,
                end,
                hidden: false,
                label_ref: false,
                target: None,
                payload: Payload::Code {
                    bytes: piece.code.to_vec(),
                    instr,
                },
            });
            self.addr = end;
        }
    }

    fn push_label(&mut self, name: &str) {
        self.labels.push(LabelEntry {
            name: name.to_string(),
            index: self.addr as i64,
            builtin: None,
        });
        self.records.push(EmitRecord {
            addr: self.addr,
            end: self.addr,
            hidden: false,
            label_ref: false,
            target: None,
            payload: Payload::Label {
                name: name.to_string(),
            },
        });
    }

    fn push_record(&mut self, size: usize, label_ref: bool, target: Option<String>, hidden: bool, payload: Payload) {
        let end = self.addr + size;
        self.records.push(EmitRecord {
            addr: self.addr,
            end,
            hidden,
            label_ref,
            target,
            payload,
        });
        self.addr = end;
    }

    fn declare_symbol(&mut self, sym: &Symbol) {
        assert_eq!(self.state, UnitState::Emitting, "unit is not emitting");
        match &sym.kind {
            SymbolKind::Tentative => {
                assert!(!sym.is_function(), "tentative definition of a function");
                self.labels.push(LabelEntry {
                    name: sym.name.clone(),
                    index: self.addr as i64,
                    builtin: None,
                });
                self.push_record(
                    sym.size() as usize,
                    false,
                    Some(sym.name.clone()),
                    false,
                    Payload::Int {
                        size: sym.size() as usize,
                        value: 0,
                    },
                );
            }
            SymbolKind::Definition => {
                if sym.is_function() {
                    self.push_label(&sym.name);
                    self.current = None;
                } else {
                    // Storage is reserved by the data emissions that follow;
                    // the first one registers the label.
                    self.current = Some(sym.clone());
                }
            }
            SymbolKind::Label | SymbolKind::Table => {
                self.push_label(&sym.name);
                self.current = None;
            }
            SymbolKind::TableEntry => {
                self.push_record(
                    8,
                    true,
                    Some(sym.name.clone()),
                    false,
                    Payload::Addr { addend: 0 },
                );
                self.current = None;
            }
            SymbolKind::StringValue(data) => {
                self.labels.push(LabelEntry {
                    name: sym.name.clone(),
                    index: self.addr as i64,
                    builtin: None,
                });
                self.push_record(
                    data.len() + 1,
                    false,
                    Some(sym.name.clone()),
                    false,
                    Payload::Bytes {
                        data: data.clone(),
                        nul: true,
                    },
                );
                self.current = None;
            }
            SymbolKind::FloatConstant(value) => {
                self.labels.push(LabelEntry {
                    name: sym.name.clone(),
                    index: self.addr as i64,
                    builtin: None,
                });
                let payload = match value {
                    FloatValue::Single(f) => Payload::Float { bits: f.to_bits() },
                    FloatValue::Double(d) => Payload::Double { bits: d.to_bits() },
                    FloatValue::Extended { lo, hi } => Payload::Extended { lo: *lo, hi: *hi },
                };
                self.push_record(
                    sym.size() as usize,
                    false,
                    Some(sym.name.clone()),
                    false,
                    payload,
                );
                self.current = None;
            }
        }
    }

    fn emit_code(&mut self, instr: Instruction) {
        assert_eq!(self.state, UnitState::Emitting, "unit is not emitting");
        let bytes = encode(&instr);
        let target = instr.referenced_label().map(str::to_string);
        let label_ref = target.is_some();
        let size = bytes.len();
        self.push_record(size, label_ref, target, false, Payload::Code { bytes, instr });
    }

    fn emit_datum(&mut self, data: &Immediate) {
        assert_eq!(self.state, UnitState::Emitting, "unit is not emitting");
        let Some(current) = &self.current else {
            return;
        };
        let name = current.name.clone();
        // Successive pieces of the same symbol keep their label hidden, so
        // one symbol can own several consecutive emissions.
        let hidden = self.previous.as_deref() == Some(name.as_str());
        if !hidden {
            self.labels.push(LabelEntry {
                name: name.clone(),
                index: self.addr as i64,
                builtin: None,
            });
        }

        match data {
            Immediate::Int { width, value } => {
                self.push_record(
                    width.bytes(),
                    false,
                    Some(name.clone()),
                    hidden,
                    Payload::Int {
                        size: width.bytes(),
                        value: *value as u64,
                    },
                );
            }
            Immediate::Addr(addr) => {
                let target = addr
                    .symbol
                    .clone()
                    .expect("address datum without symbol");
                self.push_record(
                    8,
                    true,
                    Some(target),
                    hidden,
                    Payload::Addr {
                        addend: addr.disp as i64 as u64,
                    },
                );
            }
            Immediate::Str { width, data } => {
                let nul = *width == data.len() + 1;
                assert!(
                    nul || *width == data.len(),
                    "string width must be content length or content length + 1"
                );
                self.push_record(
                    *width,
                    false,
                    Some(name.clone()),
                    hidden,
                    Payload::Bytes {
                        data: data.clone(),
                        nul,
                    },
                );
            }
        }
        self.previous = Some(name);
    }

    /// Relocation pass: resolve every label-referencing record emitted since
    /// the last pass. Unresolvable targets are skipped and recorded.
    fn relocate(&mut self, base: u64) {
        for i in self.passed..self.records.len() {
            if !self.records[i].label_ref {
                continue;
            }
            let Some(target) = self.records[i].target.clone() else {
                continue;
            };
            let resolved = find_label(&self.labels, &target);
            let end = self.records[i].end;
            match &mut self.records[i].payload {
                Payload::Addr { addend } => match resolved {
                    Some(address) if address >= 0 => {
                        *addend = addend.wrapping_add(base.wrapping_add(address as u64));
                    }
                    _ => {
                        warn!("unresolved address reference to {}", target);
                        self.unresolved.push(target);
                    }
                },
                Payload::Code { bytes, instr } if bytes.len() > 4 => match resolved {
                    Some(address) if address >= 0 => {
                        let mut disp = (address.wrapping_sub(end as i64)) as u32;
                        disp = disp.wrapping_add(patch_disp(&instr.operands) as u32);
                        let at = patch_offset(bytes, &instr.operands);
                        bytes[at..at + 4].copy_from_slice(&disp.to_le_bytes());
                    }
                    _ => {
                        warn!("unresolved relocation target {}", target);
                        self.unresolved.push(target);
                    }
                },
                _ => {}
            }
        }
        self.passed = self.records.len();
    }

    /// Materialization pass: write every record at its logical offset, and
    /// back-patch the startup jump once the entry label is reached.
    fn materialize(&mut self) -> Result<(), BackendError> {
        let buffer = self.buffer.as_mut().expect("buffer allocated before materialization");
        let mut entry_addr = None;
        for record in &self.records {
            match &record.payload {
                Payload::Label { name } => {
                    if name == ENTRY_LABEL {
                        entry_addr = Some(record.addr);
                    }
                }
                Payload::Code { bytes, .. } => buffer.write(record.addr, bytes)?,
                Payload::Int { size, value } => {
                    let mut bytes = vec![0u8; *size];
                    let n = (*size).min(8);
                    bytes[..n].copy_from_slice(&value.to_le_bytes()[..n]);
                    buffer.write(record.addr, &bytes)?;
                }
                Payload::Float { bits } => buffer.write(record.addr, &bits.to_le_bytes())?,
                Payload::Double { bits } => buffer.write(record.addr, &bits.to_le_bytes())?,
                Payload::Extended { lo, hi } => {
                    buffer.write(record.addr, &lo.to_le_bytes())?;
                    buffer.write(record.addr + 8, &(hi & 0xFFFF).to_le_bytes())?;
                }
                Payload::Bytes { data, nul } => {
                    buffer.write(record.addr, data)?;
                    if *nul {
                        buffer.write(record.addr + data.len(), &[0])?;
                    }
                }
                Payload::Addr { addend } => buffer.write(record.addr, &addend.to_le_bytes())?,
            }
        }

        if let Some(entry) = entry_addr {
            let disp = (entry - STARTUP_JMP_LEN) as u32;
            buffer.write(1, &disp.to_le_bytes())?;
            if let Payload::Code { bytes, .. } = &mut self.records[self.startup_jmp].payload {
                bytes[1..5].copy_from_slice(&disp.to_le_bytes());
            }
            self.main_found = true;
            debug!("entry point {} at {:#x}", ENTRY_LABEL, entry);
        }
        Ok(())
    }

    /// Transition to the fixed state: allocate the executable region, run the
    /// relocation pass, then materialize the log into the region.
    pub fn fix(&mut self) -> Result<(), BackendError> {
        match self.state {
            UnitState::Fixed => return Ok(()),
            UnitState::Emitting => {}
            _ => panic!("fix-up requires an emitting unit"),
        }

        let size = (self.addr + 16 + 7) & !7;
        let buffer = ExecutableMemory::new(size).map_err(|e| {
            error!("cannot allocate {} bytes of executable memory: {}", size, e);
            e
        })?;
        let base = buffer.base();
        self.buffer = Some(buffer);
        self.relocate(base);
        self.materialize()?;
        self.state = UnitState::Fixed;
        Ok(())
    }

    /// Fix the unit and execute it from the buffer base, capturing the
    /// program's integer return value. Without an entry point nothing runs
    /// and the previously captured value is returned.
    pub fn run(&mut self) -> Result<i32, BackendError> {
        self.fix()?;
        if !self.main_found {
            warn!("no {} in unit; skipping execution", ENTRY_LABEL);
            return Ok(self.return_value);
        }

        self.buffer
            .as_mut()
            .expect("fixed unit has a buffer")
            .make_executable()?;
        let base = self.buffer.as_ref().expect("fixed unit has a buffer").as_ptr();

        self.state = UnitState::Running;
        if let Some(hook) = self.builtin_func(ONSTART_BUILTIN) {
            unsafe {
                let f: extern "C" fn() = std::mem::transmute(hook);
                f();
            }
        }

        let value = unsafe {
            let entry: extern "C" fn() -> i32 = std::mem::transmute(base);
            entry()
        };
        self.return_value = value;

        if let Some(address) = find_label(&self.labels, ATEXIT_LABEL) {
            if address > 0 {
                unsafe {
                    let f: extern "C" fn() = std::mem::transmute(base.add(address as usize));
                    f();
                }
            }
        }
        if let Some(hook) = self.builtin_func(ONEXIT_BUILTIN) {
            unsafe {
                let f: extern "C" fn() = std::mem::transmute(hook);
                f();
            }
        }
        self.state = UnitState::Fixed;
        Ok(value)
    }

    /// Render the fixed unit as a hex listing.
    pub fn dump(&mut self, out: &mut dyn Write) -> Result<(), BackendError> {
        self.fix()?;
        let mut asm = AsmWriter::new(Vec::new());
        for record in &self.records {
            match &record.payload {
                Payload::Label { name } => {
                    writeln!(out, "{:34}{}", "", name)?;
                }
                Payload::Code { bytes, instr } => {
                    write!(out, "{:08X}:", record.addr)?;
                    for byte in bytes {
                        write!(out, " {:02X}", byte)?;
                    }
                    if instr.opcode == Opcode::Builtin {
                        writeln!(out)?;
                    } else {
                        let _ = asm.emit_instruction(instr.clone());
                        let text = String::from_utf8_lossy(&asm.take_output()).into_owned();
                        writeln!(out, "\t{}", text.trim_end())?;
                    }
                }
                Payload::Int { size, value } => {
                    self.dump_symbol_line(out, record)?;
                    write!(out, "{:08X}:", record.addr)?;
                    let mut value = *value;
                    for _ in 0..(*size).min(8) {
                        write!(out, " {:02X}", value & 0xFF)?;
                        value >>= 8;
                    }
                    writeln!(out)?;
                }
                Payload::Float { bits } => {
                    self.dump_symbol_line(out, record)?;
                    Self::dump_bytes(out, record.addr, &bits.to_le_bytes())?;
                }
                Payload::Double { bits } => {
                    self.dump_symbol_line(out, record)?;
                    Self::dump_bytes(out, record.addr, &bits.to_le_bytes())?;
                }
                Payload::Extended { lo, hi } => {
                    self.dump_symbol_line(out, record)?;
                    Self::dump_bytes(out, record.addr, &lo.to_le_bytes())?;
                    Self::dump_bytes(out, record.addr + 8, &(hi & 0xFFFF).to_le_bytes())?;
                }
                Payload::Bytes { data, nul } => {
                    self.dump_symbol_line(out, record)?;
                    write!(out, "{:08X}:", record.addr)?;
                    for byte in data {
                        write!(out, " {:02X}", byte)?;
                    }
                    if *nul {
                        write!(out, " 00")?;
                    }
                    writeln!(out, "\t{}", String::from_utf8_lossy(data))?;
                }
                Payload::Addr { addend } => {
                    self.dump_symbol_line(out, record)?;
                    write!(out, "{:08X}:", record.addr)?;
                    for byte in addend.to_le_bytes() {
                        write!(out, " {:02X}", byte)?;
                    }
                    writeln!(
                        out,
                        "\t{}",
                        record.target.as_deref().unwrap_or_default()
                    )?;
                }
            }
        }
        Ok(())
    }

    fn dump_symbol_line(&self, out: &mut dyn Write, record: &EmitRecord) -> io::Result<()> {
        if !record.hidden {
            if let Some(name) = &record.target {
                writeln!(out, "{:33}{}", "", name)?;
            }
        }
        Ok(())
    }

    fn dump_bytes(out: &mut dyn Write, addr: usize, bytes: &[u8]) -> io::Result<()> {
        write!(out, "{:08X}:", addr)?;
        for byte in bytes {
            write!(out, " {:02X}", byte)?;
        }
        writeln!(out)
    }

    /// Release the executable region, clear the label table and emission log,
    /// and unload the support library. The unit is inert afterwards.
    pub fn finalize_unit(&mut self) {
        self.buffer = None;
        self.labels.clear();
        self.records.clear();
        self.support = None;
        self.unresolved.clear();
        self.addr = 0;
        self.passed = 0;
        self.startup_jmp = 0;
        self.current = None;
        self.previous = None;
        self.main_found = false;
        self.state = UnitState::Finalized;
    }

    pub fn state(&self) -> UnitState {
        self.state
    }

    /// The integer value captured by the last execution.
    pub fn return_value(&self) -> i32 {
        self.return_value
    }

    /// Relocation targets that could not be resolved during fix-up.
    pub fn unresolved(&self) -> &[String] {
        &self.unresolved
    }

    /// Logical address of a label, or the negative index of a builtin.
    pub fn label_address(&self, name: &str) -> Option<i64> {
        find_label(&self.labels, name)
    }

    /// Look up a builtin registered from the support library.
    pub fn builtin(&self, name: &str) -> Option<&Builtin> {
        self.labels
            .iter()
            .find(|l| l.index < 0 && l.name == name)
            .and_then(|l| l.builtin.as_ref())
    }

    fn builtin_func(&self, name: &str) -> Option<*const std::ffi::c_void> {
        self.builtin(name).map(|b| b.func)
    }

    /// The materialized unit image, available once fixed.
    pub fn image(&self) -> Option<&[u8]> {
        self.buffer.as_ref().and_then(|b| b.bytes(0, self.addr).ok())
    }
}

impl Backend for JitUnit {
    fn declare(&mut self, symbol: &Symbol) -> Result<(), BackendError> {
        self.declare_symbol(symbol);
        Ok(())
    }

    fn emit_instruction(&mut self, instr: Instruction) -> Result<(), BackendError> {
        self.emit_code(instr);
        Ok(())
    }

    fn emit_data(&mut self, data: Immediate) -> Result<(), BackendError> {
        self.emit_datum(&data);
        Ok(())
    }

    fn finalize(&mut self) -> Result<(), BackendError> {
        self.finalize_unit();
        Ok(())
    }
}

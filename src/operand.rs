//! Machine operand model shared by both backends.
//!
//! Registers, addressing expressions and immediates are pure data: the only
//! behavior they carry is construction and width queries. Both backends match
//! exhaustively over these closed tags.

/// Operand width in bytes.
///
/// `Tword` is the 80-bit extended-precision storage format and is only valid
/// for extended-precision memory operands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum Width {
    Byte = 1,
    Word = 2,
    Long = 4,
    Quad = 8,
    Tword = 16,
}

impl Width {
    /// Number of bytes this width covers.
    pub fn bytes(self) -> usize {
        self as usize
    }
}

/// Architectural register identifier.
///
/// Three classes: general-purpose integer, vector (scalar float/double), and
/// the extended-precision stack. `St*` identifiers name logical stack slots,
/// not hardware positions; the textual backend maps them to `%st(k)` from its
/// float-stack depth. `Ip` is the instruction-pointer pseudo-register used
/// for position-relative addressing and is valid only at width `Quad`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegId {
    Ax,
    Cx,
    Dx,
    Bx,
    Sp,
    Bp,
    Si,
    Di,
    R8,
    R9,
    R10,
    R11,
    R12,
    R13,
    R14,
    R15,
    Ip,
    Xmm0,
    Xmm1,
    Xmm2,
    Xmm3,
    Xmm4,
    Xmm5,
    Xmm6,
    Xmm7,
    Xmm8,
    Xmm9,
    Xmm10,
    Xmm11,
    Xmm12,
    Xmm13,
    Xmm14,
    Xmm15,
    St0,
    St1,
    St2,
    St3,
    St4,
    St5,
    St6,
    St7,
}

impl RegId {
    /// Hardware encoding (0..16) for a general-purpose register.
    pub fn gp_code(self) -> Option<u8> {
        use RegId::*;
        let code = match self {
            Ax => 0,
            Cx => 1,
            Dx => 2,
            Bx => 3,
            Sp => 4,
            Bp => 5,
            Si => 6,
            Di => 7,
            R8 => 8,
            R9 => 9,
            R10 => 10,
            R11 => 11,
            R12 => 12,
            R13 => 13,
            R14 => 14,
            R15 => 15,
            _ => return None,
        };
        Some(code)
    }

    /// Hardware encoding (0..16) for a vector register.
    pub fn xmm_code(self) -> Option<u8> {
        use RegId::*;
        let code = match self {
            Xmm0 => 0,
            Xmm1 => 1,
            Xmm2 => 2,
            Xmm3 => 3,
            Xmm4 => 4,
            Xmm5 => 5,
            Xmm6 => 6,
            Xmm7 => 7,
            Xmm8 => 8,
            Xmm9 => 9,
            Xmm10 => 10,
            Xmm11 => 11,
            Xmm12 => 12,
            Xmm13 => 13,
            Xmm14 => 14,
            Xmm15 => 15,
            _ => return None,
        };
        Some(code)
    }

    /// Logical slot number for an extended-precision stack register.
    pub fn st_slot(self) -> Option<u8> {
        use RegId::*;
        let slot = match self {
            St0 => 0,
            St1 => 1,
            St2 => 2,
            St3 => 3,
            St4 => 4,
            St5 => 5,
            St6 => 6,
            St7 => 7,
            _ => return None,
        };
        Some(slot)
    }
}

/// A register operand: identifier plus operand width.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Register {
    pub id: RegId,
    pub width: Width,
}

impl Register {
    pub fn new(id: RegId, width: Width) -> Self {
        Self { id, width }
    }
}

/// Addressing variant attached to a symbol reference.
///
/// The variant selects a textual suffix in the assembler backend and a
/// distinct relocation kind in the JIT backend. GOT/PLT references must carry
/// zero displacement.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AddressKind {
    #[default]
    Plain,
    /// Global-offset-table-relative data access (position-independent code).
    GlobalOffset,
    /// Procedure-linkage-table-relative call target.
    Plt,
}

/// An addressing expression: `symbol ± disp (base, index, scale)`.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Address {
    pub symbol: Option<String>,
    pub kind: AddressKind,
    pub disp: i32,
    pub base: Option<RegId>,
    /// Index register with scale factor 1, 2, 4 or 8.
    pub index: Option<(RegId, u8)>,
}

impl Address {
    /// Reference a symbol, optionally displaced.
    pub fn symbolic(name: impl Into<String>, disp: i32) -> Self {
        Self {
            symbol: Some(name.into()),
            disp,
            ..Self::default()
        }
    }

    /// Symbol reference with a GOT/PLT addressing variant.
    pub fn symbolic_with_kind(name: impl Into<String>, kind: AddressKind) -> Self {
        Self {
            symbol: Some(name.into()),
            kind,
            ..Self::default()
        }
    }

    /// Plain base-register addressing with displacement.
    pub fn base_disp(base: RegId, disp: i32) -> Self {
        Self {
            base: Some(base),
            disp,
            ..Self::default()
        }
    }

    /// Base + index * scale addressing.
    pub fn base_index(base: RegId, index: RegId, scale: u8, disp: i32) -> Self {
        assert!(matches!(scale, 1 | 2 | 4 | 8), "invalid scale factor");
        Self {
            base: Some(base),
            index: Some((index, scale)),
            disp,
            ..Self::default()
        }
    }

    /// Symbol addressed relative to the instruction pointer.
    pub fn rip_relative(name: impl Into<String>) -> Self {
        Self {
            symbol: Some(name.into()),
            base: Some(RegId::Ip),
            ..Self::default()
        }
    }
}

/// A memory operand: addressing expression plus access width.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MemoryOperand {
    pub addr: Address,
    pub width: Width,
}

impl MemoryOperand {
    pub fn new(addr: Address, width: Width) -> Self {
        Self { addr, width }
    }
}

/// An immediate operand or data item.
#[derive(Debug, Clone, PartialEq)]
pub enum Immediate {
    /// Sized integer value.
    Int { width: Width, value: i64 },
    /// Address-valued immediate: symbol + displacement.
    Addr(Address),
    /// Inline byte string. Declared width equal to the content length means a
    /// raw (ascii) string; content length + 1 means NUL-terminated.
    Str { width: usize, data: Vec<u8> },
}

impl Immediate {
    pub fn int(width: Width, value: i64) -> Self {
        Immediate::Int { width, value }
    }

    pub fn string(width: usize, data: impl Into<Vec<u8>>) -> Self {
        let data = data.into();
        assert!(
            width == data.len() || width == data.len() + 1,
            "string width must be content length or content length + 1"
        );
        Immediate::Str { width, data }
    }

    /// Size of the data item in bytes.
    pub fn size(&self) -> usize {
        match self {
            Immediate::Int { width, .. } => width.bytes(),
            Immediate::Addr(_) => Width::Quad.bytes(),
            Immediate::Str { width, .. } => *width,
        }
    }
}

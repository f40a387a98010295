//! The backend contract shared by the textual and JIT emitters.
//!
//! The front end drives a backend through the same three-call sequence
//! regardless of output form: declare a symbol, then append instructions and
//! data to it, repeating for every symbol in the translation unit, then
//! finalize once. Only one backend is active per compiler invocation.

use thiserror::Error;

use crate::instruction::Instruction;
use crate::operand::Immediate;
use crate::symbol::Symbol;

/// Errors surfaced by backend operations.
///
/// Only resource-level failures are reported this way; violations of the
/// front-end contract (unsupported widths, structurally missing symbols)
/// indicate front-end bugs and panic instead.
#[derive(Debug, Error)]
pub enum BackendError {
    #[error("output error: {0}")]
    Io(#[from] std::io::Error),
    #[cfg(feature = "jit")]
    #[error("executable memory error: {0}")]
    Memory(#[from] crate::jit::memory::MemoryError),
}

/// The three-call contract consumed by the front end.
pub trait Backend {
    /// Announce a symbol and its kind/type/linkage. Code and data emitted
    /// afterwards belong to this symbol until the next declaration.
    fn declare(&mut self, symbol: &Symbol) -> Result<(), BackendError>;

    /// Append one machine instruction to the currently declared symbol.
    fn emit_instruction(&mut self, instr: Instruction) -> Result<(), BackendError>;

    /// Append one data item to the currently declared symbol.
    fn emit_data(&mut self, data: Immediate) -> Result<(), BackendError>;

    /// Close the unit: flush trailing metadata, or fix up and release.
    fn finalize(&mut self) -> Result<(), BackendError>;
}

//! Backend configuration types.

/// Which backend a compiler invocation drives.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum BackendKind {
    /// Textual assembly for an external assembler/linker.
    #[default]
    Asm,
    /// In-process machine code with immediate execution.
    Jit,
}

/// Options for the JIT backend.
#[derive(Debug, Clone)]
pub struct JitOptions {
    /// Runtime-support library to load at initialization. `None`, or an
    /// unavailable library, degrades to having no builtins.
    pub support_library: Option<String>,
    /// Print the hex listing of the unit instead of running it.
    pub dump_code: bool,
}

impl Default for JitOptions {
    fn default() -> Self {
        Self {
            support_library: Some("libjitccrt.so".to_string()),
            dump_code: false,
        }
    }
}

//! Hand-encoded runtime-support code embedded in every unit.
//!
//! These are fixed binary constants, not generated from instruction
//! descriptions; a port to another architecture must supply an equivalent
//! blob. The sequences are position-dependent (`setjmp` calls the
//! instruction-pointer helper with a hard-coded backwards displacement), so
//! pieces must be emitted in this order at offset 0.
//!
//! Layout:
//!
//! ```text
//! __startup:
//!     00  E9 00 00 00 00          jmp   main          (displacement patched)
//! __load_rip:
//!     05  48 89 E2                mov   %rsp, %rdx
//!     08  48 8B 02                mov   (%rdx), %rax
//!     0b  C3                      ret
//! setjmp:
//!     0c  48 89 67 08             mov   %rsp, 0x8(%rdi)
//!     10  48 8B 04 24             mov   (%rsp), %rax
//!     14  48 89 47 10             mov   %rax, 0x10(%rdi)
//!     18  E8 E8 FF FF FF          call  __load_rip
//!     1d  48 85 C0                test  %rax, %rax
//!     20  74 23                   je    1f
//!     22  48 89 07                mov   %rax, (%rdi)
//!     25  48 89 5F 18             mov   %rbx, 0x18(%rdi)
//!     29  48 89 6F 20             mov   %rbp, 0x20(%rdi)
//!     2d  4C 89 67 28             mov   %r12, 0x28(%rdi)
//!     31  4C 89 6F 30             mov   %r13, 0x30(%rdi)
//!     35  4C 89 77 38             mov   %r14, 0x38(%rdi)
//!     39  4C 89 7F 40             mov   %r15, 0x40(%rdi)
//!     3d  48 C7 C0 00 00 00 00    mov   $0, %rax
//!     44  C3                      ret
//! 1:  45  48 8B 47 10             mov   0x10(%rdi), %rax
//!     49  48 89 04 24             mov   %rax, (%rsp)
//!     4d  48 89 F0                mov   %rsi, %rax
//!     50  48 8B 5F 18             mov   0x18(%rdi), %rbx
//!     54  48 8B 6F 20             mov   0x20(%rdi), %rbp
//!     58  4C 8B 67 28             mov   0x28(%rdi), %r12
//!     5c  4C 8B 6F 30             mov   0x30(%rdi), %r13
//!     60  4C 8B 77 38             mov   0x38(%rdi), %r14
//!     64  4C 8B 7F 40             mov   0x40(%rdi), %r15
//!     68  C3                      ret
//! longjmp:
//!     69  4C 8B 07                mov   (%rdi), %r8
//!     6c  4C 8B 4F 08             mov   0x8(%rdi), %r9
//!     70  4C 89 CC                mov   %r9, %rsp
//!     73  4C 89 04 24             mov   %r8, (%rsp)
//!     77  48 C7 C0 00 00 00 00    mov   $0, %rax
//!     7e  41 FF E0                jmp   *%r8
//! strlen:
//!     81  48 83 C8 FF             or    $-1, %rax
//! 1:  85  48 FF C0                inc   %rax
//!     88  80 3C 07 00             cmpb  $0, (%rdi,%rax)
//!     8c  75 F7                   jne   1b
//!     8e  C3                      ret
//! memcpy:
//!     8f  48 85 D2                test  %rdx, %rdx
//!     92  74 18                   je    1f
//!     94  48 8D 0C 16             lea   (%rsi,%rdx), %rcx
//!     98  48 89 FA                mov   %rdi, %rdx
//!     9b  48 29 F2                sub   %rsi, %rdx
//! 2:  9e  0F B6 06                movzbl (%rsi), %eax
//!     a1  88 04 32                mov   %al, (%rdx,%rsi)
//!     a4  48 FF C6                inc   %rsi
//!     a7  48 39 CE                cmp   %rcx, %rsi
//!     aa  75 F2                   jne   2b
//! 1:  ac  48 89 F8                mov   %rdi, %rax
//!     af  C3                      ret
//! ```

/// Length of the placeholder jump at offset 0.
pub const STARTUP_JMP_LEN: usize = 5;

/// Label of the placeholder jump record.
pub const STARTUP_LABEL: &str = "__startup";

/// Entry symbol the placeholder jump is patched to.
pub const ENTRY_LABEL: &str = "main";

/// Label executed after the program returns, when the front end registered
/// pending exit handlers.
pub const ATEXIT_LABEL: &str = "__call_atexit_funcs";

/// Builtin hook invoked before the unit runs.
pub const ONSTART_BUILTIN: &str = "__builtin_onstart";

/// Builtin hook invoked after the unit finished.
pub const ONEXIT_BUILTIN: &str = "__builtin_onexit";

/// One named piece of the runtime-support blob.
pub struct RuntimePiece {
    pub label: &'static str,
    pub code: &'static [u8],
}

/// The support blob, in mandatory emission order.
pub const RUNTIME_BLOB: &[RuntimePiece] = &[
    RuntimePiece {
        label: STARTUP_LABEL,
        code: &[0xE9, 0x00, 0x00, 0x00, 0x00],
    },
    RuntimePiece {
        label: "__load_rip",
        code: &[0x48, 0x89, 0xE2, 0x48, 0x8B, 0x02, 0xC3],
    },
    RuntimePiece {
        label: "setjmp",
        code: &[
            0x48, 0x89, 0x67, 0x08, //
            0x48, 0x8B, 0x04, 0x24, //
            0x48, 0x89, 0x47, 0x10, //
            0xE8, 0xE8, 0xFF, 0xFF, 0xFF, //
            0x48, 0x85, 0xC0, //
            0x74, 0x23, //
            0x48, 0x89, 0x07, //
            0x48, 0x89, 0x5F, 0x18, //
            0x48, 0x89, 0x6F, 0x20, //
            0x4C, 0x89, 0x67, 0x28, //
            0x4C, 0x89, 0x6F, 0x30, //
            0x4C, 0x89, 0x77, 0x38, //
            0x4C, 0x89, 0x7F, 0x40, //
            0x48, 0xC7, 0xC0, 0x00, 0x00, 0x00, 0x00, //
            0xC3, //
            0x48, 0x8B, 0x47, 0x10, //
            0x48, 0x89, 0x04, 0x24, //
            0x48, 0x89, 0xF0, //
            0x48, 0x8B, 0x5F, 0x18, //
            0x48, 0x8B, 0x6F, 0x20, //
            0x4C, 0x8B, 0x67, 0x28, //
            0x4C, 0x8B, 0x6F, 0x30, //
            0x4C, 0x8B, 0x77, 0x38, //
            0x4C, 0x8B, 0x7F, 0x40, //
            0xC3,
        ],
    },
    RuntimePiece {
        label: "longjmp",
        code: &[
            0x4C, 0x8B, 0x07, //
            0x4C, 0x8B, 0x4F, 0x08, //
            0x4C, 0x89, 0xCC, //
            0x4C, 0x89, 0x04, 0x24, //
            0x48, 0xC7, 0xC0, 0x00, 0x00, 0x00, 0x00, //
            0x41, 0xFF, 0xE0,
        ],
    },
    RuntimePiece {
        label: "strlen",
        code: &[
            0x48, 0x83, 0xC8, 0xFF, //
            0x48, 0xFF, 0xC0, //
            0x80, 0x3C, 0x07, 0x00, //
            0x75, 0xF7, //
            0xC3,
        ],
    },
    RuntimePiece {
        label: "memcpy",
        code: &[
            0x48, 0x85, 0xD2, //
            0x74, 0x18, //
            0x48, 0x8D, 0x0C, 0x16, //
            0x48, 0x89, 0xFA, //
            0x48, 0x29, 0xF2, //
            0x0F, 0xB6, 0x06, //
            0x88, 0x04, 0x32, //
            0x48, 0xFF, 0xC6, //
            0x48, 0x39, 0xCE, //
            0x75, 0xF2, //
            0x48, 0x89, 0xF8, //
            0xC3,
        ],
    },
];

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_blob_layout() {
        // The setjmp call to __load_rip is encoded against these offsets.
        let mut offset = 0usize;
        let mut offsets = Vec::new();
        for piece in RUNTIME_BLOB {
            offsets.push((piece.label, offset));
            offset += piece.code.len();
        }
        assert_eq!(offsets[0], (STARTUP_LABEL, 0x00));
        assert_eq!(offsets[1], ("__load_rip", 0x05));
        assert_eq!(offsets[2], ("setjmp", 0x0C));
        assert_eq!(offsets[3], ("longjmp", 0x69));
        assert_eq!(offsets[4], ("strlen", 0x81));
        assert_eq!(offsets[5], ("memcpy", 0x8F));
        assert_eq!(offset, 0xB0);
    }

    #[test]
    fn test_setjmp_calls_rip_helper() {
        // call rel32 at setjmp+0x0c: 0x1d + rel == 0x05.
        let setjmp = RUNTIME_BLOB[2].code;
        assert_eq!(setjmp[12], 0xE8);
        let rel = i32::from_le_bytes([setjmp[13], setjmp[14], setjmp[15], setjmp[16]]);
        assert_eq!(0x0C + 12 + 5 + rel as i64, 0x05);
    }

    #[test]
    fn test_startup_is_placeholder_jump() {
        assert_eq!(RUNTIME_BLOB[0].code, &[0xE9, 0, 0, 0, 0]);
        assert_eq!(RUNTIME_BLOB[0].code.len(), STARTUP_JMP_LEN);
    }
}

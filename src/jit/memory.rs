//! Executable memory for jitted units.
//!
//! A region is allocated read-write for materialization, flipped to
//! read-execute before the unit runs, and unmapped when the unit is
//! finalized. The base address is exposed so absolute address slots can be
//! resolved once the region exists.

use std::ptr::NonNull;

/// Error type for executable-memory operations.
#[derive(Debug, PartialEq, Eq)]
pub enum MemoryError {
    AllocationFailed,
    ProtectionFailed,
    InvalidSize,
    OutOfBounds,
}

impl std::fmt::Display for MemoryError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MemoryError::AllocationFailed => write!(f, "executable memory allocation failed"),
            MemoryError::ProtectionFailed => write!(f, "memory protection change failed"),
            MemoryError::InvalidSize => write!(f, "invalid region size"),
            MemoryError::OutOfBounds => write!(f, "write outside the allocated region"),
        }
    }
}

impl std::error::Error for MemoryError {}

/// An mmap-backed region holding the materialized unit.
#[derive(Debug)]
pub struct ExecutableMemory {
    ptr: NonNull<u8>,
    size: usize,
    executable: bool,
}

impl ExecutableMemory {
    /// Allocate a writable region of at least `size` bytes, rounded up to the
    /// page size.
    pub fn new(size: usize) -> Result<Self, MemoryError> {
        if size == 0 {
            return Err(MemoryError::InvalidSize);
        }

        let page_size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) as usize };
        let aligned = (size + page_size - 1) & !(page_size - 1);

        let ptr = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                aligned,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
                -1,
                0,
            )
        };
        if ptr == libc::MAP_FAILED {
            return Err(MemoryError::AllocationFailed);
        }
        let ptr = NonNull::new(ptr as *mut u8).ok_or(MemoryError::AllocationFailed)?;

        Ok(Self {
            ptr,
            size: aligned,
            executable: false,
        })
    }

    /// Runtime base address of the region, used to resolve absolute slots.
    pub fn base(&self) -> u64 {
        self.ptr.as_ptr() as u64
    }

    pub fn as_ptr(&self) -> *const u8 {
        self.ptr.as_ptr()
    }

    pub fn size(&self) -> usize {
        self.size
    }

    /// Write bytes at a logical offset. Fails once the region is executable
    /// or if the write would run past the end.
    pub fn write(&mut self, offset: usize, data: &[u8]) -> Result<(), MemoryError> {
        if self.executable {
            return Err(MemoryError::ProtectionFailed);
        }
        if offset.checked_add(data.len()).is_none_or(|end| end > self.size) {
            return Err(MemoryError::OutOfBounds);
        }
        unsafe {
            std::ptr::copy_nonoverlapping(data.as_ptr(), self.ptr.as_ptr().add(offset), data.len());
        }
        Ok(())
    }

    /// Read back a slice of the region, for inspection and tests.
    pub fn bytes(&self, offset: usize, len: usize) -> Result<&[u8], MemoryError> {
        if offset.checked_add(len).is_none_or(|end| end > self.size) {
            return Err(MemoryError::OutOfBounds);
        }
        Ok(unsafe { std::slice::from_raw_parts(self.ptr.as_ptr().add(offset), len) })
    }

    /// Flip the region to read-execute. No further writes are accepted.
    pub fn make_executable(&mut self) -> Result<(), MemoryError> {
        if self.executable {
            return Ok(());
        }
        let result = unsafe {
            libc::mprotect(
                self.ptr.as_ptr() as *mut libc::c_void,
                self.size,
                libc::PROT_READ | libc::PROT_EXEC,
            )
        };
        if result != 0 {
            return Err(MemoryError::ProtectionFailed);
        }
        self.executable = true;
        Ok(())
    }

    pub fn is_executable(&self) -> bool {
        self.executable
    }
}

impl Drop for ExecutableMemory {
    fn drop(&mut self) {
        unsafe {
            libc::munmap(self.ptr.as_ptr() as *mut libc::c_void, self.size);
        }
    }
}

// The region is exclusively owned; nothing else aliases the mapping.
unsafe impl Send for ExecutableMemory {}

//! Runtime-support builtins.
//!
//! A unit may be backed by an optional support library exporting native
//! functions the generated code can call. The library is modeled as a
//! capability: a by-index lookup that yields name, function pointer, argument
//! count and calling-convention flag. Absence of the library, or of any of
//! its lookup entry points, degrades to an empty capability set.

use std::ffi::{CStr, CString, c_char, c_int, c_void};

use log::{debug, warn};

/// One resolved runtime-support function.
pub struct Builtin {
    pub name: String,
    pub func: *const c_void,
    /// Declared argument count, used to synthesize calls without a full
    /// ABI-aware lowering.
    pub args: u8,
    /// Floating-point argument/return convention.
    pub uses_float: bool,
}

/// By-index builtin resolution. Enumeration starts at 1 and stops at the
/// first index with no entry.
pub trait BuiltinSource {
    fn lookup(&self, index: u32) -> Option<Builtin>;
}

type NameFn = unsafe extern "C" fn(c_int) -> *const c_char;
type FuncFn = unsafe extern "C" fn(c_int) -> *const c_void;
type ByteFn = unsafe extern "C" fn(c_int) -> u8;

/// A dynamically loaded support library.
///
/// The image must export four fixed-name lookup functions; missing any one of
/// them disables builtin support without failing the build.
pub struct SupportLibrary {
    handle: *mut c_void,
    name_fn: NameFn,
    func_fn: FuncFn,
    args_fn: ByteFn,
    float_fn: ByteFn,
}

impl SupportLibrary {
    /// Load a support library by path or soname. Returns `None` when the
    /// library or any of its lookup functions is unavailable.
    pub fn open(name: &str) -> Option<Self> {
        let Ok(cname) = CString::new(name) else {
            return None;
        };
        let handle = unsafe { libc::dlopen(cname.as_ptr(), libc::RTLD_NOW | libc::RTLD_LOCAL) };
        if handle.is_null() {
            debug!("support library {} not found", name);
            return None;
        }

        let lookup = |symbol: &CStr| -> *mut c_void { unsafe { libc::dlsym(handle, symbol.as_ptr()) } };
        let name_fn = lookup(c"jit_builtin_name_by_index");
        let func_fn = lookup(c"jit_builtin_func_by_index");
        let args_fn = lookup(c"jit_builtin_args_by_index");
        let float_fn = lookup(c"jit_builtin_float_by_index");
        if name_fn.is_null() || func_fn.is_null() || args_fn.is_null() || float_fn.is_null() {
            warn!("support library {} lacks builtin lookup entry points", name);
            unsafe { libc::dlclose(handle) };
            return None;
        }

        debug!("support library {} loaded", name);
        Some(unsafe {
            Self {
                handle,
                name_fn: std::mem::transmute::<*mut c_void, NameFn>(name_fn),
                func_fn: std::mem::transmute::<*mut c_void, FuncFn>(func_fn),
                args_fn: std::mem::transmute::<*mut c_void, ByteFn>(args_fn),
                float_fn: std::mem::transmute::<*mut c_void, ByteFn>(float_fn),
            }
        })
    }
}

impl BuiltinSource for SupportLibrary {
    fn lookup(&self, index: u32) -> Option<Builtin> {
        let index = index as c_int;
        let name = unsafe { (self.name_fn)(index) };
        if name.is_null() {
            return None;
        }
        let name = unsafe { CStr::from_ptr(name) }.to_string_lossy().into_owned();
        Some(Builtin {
            name,
            func: unsafe { (self.func_fn)(index) },
            args: unsafe { (self.args_fn)(index) },
            uses_float: unsafe { (self.float_fn)(index) } != 0,
        })
    }
}

impl Drop for SupportLibrary {
    fn drop(&mut self) {
        unsafe { libc::dlclose(self.handle) };
    }
}

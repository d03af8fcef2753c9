//! Dynamic FFI bindings for libjq using libloading.
//!
//! This module loads the jq shared library at runtime via dlopen, so the
//! crate builds without jq headers and reports a missing library as an
//! ordinary error.

#![allow(non_camel_case_types)]

use std::ffi::c_void;
use std::os::raw::{c_char, c_double, c_int};
use std::path::PathBuf;
use std::sync::OnceLock;

use libloading::Library;

use crate::error::{JqError, Result};
use crate::setup;

/// Opaque engine state owned by libjq.
#[repr(C)]
pub struct jq_state {
    _opaque: [u8; 0],
}

#[repr(C)]
#[derive(Clone, Copy)]
pub union jv_u {
    pub ptr: *mut c_void,
    pub number: c_double,
}

/// libjq's by-value JSON handle.
#[repr(C)]
#[derive(Clone, Copy)]
pub struct jv {
    pub kind_flags: u8,
    pub pad_: u8,
    pub offset: u16,
    pub size: c_int,
    pub u: jv_u,
}

pub type jv_kind = c_int;

pub const JV_KIND_INVALID: jv_kind = 0;
pub const JV_KIND_NULL: jv_kind = 1;
pub const JV_KIND_FALSE: jv_kind = 2;
pub const JV_KIND_TRUE: jv_kind = 3;
pub const JV_KIND_NUMBER: jv_kind = 4;
pub const JV_KIND_STRING: jv_kind = 5;
pub const JV_KIND_ARRAY: jv_kind = 6;
pub const JV_KIND_OBJECT: jv_kind = 7;

/// Error callback signature; `None` is the C `NULL`.
pub type jq_msg_cb = Option<unsafe extern "C" fn(data: *mut c_void, msg: jv)>;

// Function pointer types
type JqInitFn = unsafe extern "C" fn() -> *mut jq_state;
type JqTeardownFn = unsafe extern "C" fn(state: *mut *mut jq_state);
type JqSetErrorCbFn = unsafe extern "C" fn(state: *mut jq_state, cb: jq_msg_cb, data: *mut c_void);
type JqCompileArgsFn =
    unsafe extern "C" fn(state: *mut jq_state, program: *const c_char, args: jv) -> c_int;
type JqStartFn = unsafe extern "C" fn(state: *mut jq_state, value: jv, flags: c_int);
type JqNextFn = unsafe extern "C" fn(state: *mut jq_state) -> jv;

type JvUnaryFn = unsafe extern "C" fn(value: jv) -> jv;
type JvBinaryFn = unsafe extern "C" fn(a: jv, b: jv) -> jv;
type JvNullaryFn = unsafe extern "C" fn() -> jv;
type JvPredicateFn = unsafe extern "C" fn(value: jv) -> c_int;
type JvFreeFn = unsafe extern "C" fn(value: jv);
type JvGetKindFn = unsafe extern "C" fn(value: jv) -> jv_kind;
type JvBoolFn = unsafe extern "C" fn(b: c_int) -> jv;
type JvNumberFn = unsafe extern "C" fn(n: c_double) -> jv;
type JvNumberValueFn = unsafe extern "C" fn(value: jv) -> c_double;
type JvStringSizedFn = unsafe extern "C" fn(s: *const c_char, len: c_int) -> jv;
type JvStringValueFn = unsafe extern "C" fn(value: jv) -> *const c_char;
type JvArrayGetFn = unsafe extern "C" fn(array: jv, idx: c_int) -> jv;
type JvObjectSetFn = unsafe extern "C" fn(object: jv, key: jv, value: jv) -> jv;
type JvObjectIterFn = unsafe extern "C" fn(object: jv) -> c_int;
type JvObjectIterStepFn = unsafe extern "C" fn(object: jv, iter: c_int) -> c_int;
type JvObjectIterGetFn = unsafe extern "C" fn(object: jv, iter: c_int) -> jv;
type JvDumpStringFn = unsafe extern "C" fn(value: jv, flags: c_int) -> jv;

/// Holds the dynamically loaded library and function pointers.
///
/// Ownership conventions follow libjq: functions marked "consumes" in the
/// jq C API documentation take over the reference passed to them.
pub struct JqLib {
    #[allow(dead_code)]
    lib: Library,
    pub jq_init: JqInitFn,
    pub jq_teardown: JqTeardownFn,
    pub jq_set_error_cb: JqSetErrorCbFn,
    pub jq_compile_args: JqCompileArgsFn,
    pub jq_start: JqStartFn,
    pub jq_next: JqNextFn,
    pub jq_format_error: JvUnaryFn,

    pub jv_get_kind: JvGetKindFn,
    pub jv_copy: JvUnaryFn,
    pub jv_free: JvFreeFn,
    pub jv_invalid_get_msg: JvUnaryFn,
    pub jv_invalid_has_msg: JvPredicateFn,
    pub jv_invalid_with_msg: JvUnaryFn,
    pub jv_null: JvNullaryFn,
    pub jv_bool: JvBoolFn,
    pub jv_number: JvNumberFn,
    pub jv_number_value: JvNumberValueFn,
    pub jv_is_integer: JvPredicateFn,
    pub jv_string_sized: JvStringSizedFn,
    pub jv_string_value: JvStringValueFn,
    pub jv_string_length_bytes: JvPredicateFn,
    pub jv_array: JvNullaryFn,
    pub jv_array_append: JvBinaryFn,
    pub jv_array_length: JvPredicateFn,
    pub jv_array_get: JvArrayGetFn,
    pub jv_object: JvNullaryFn,
    pub jv_object_set: JvObjectSetFn,
    pub jv_object_iter: JvObjectIterFn,
    pub jv_object_iter_valid: JvObjectIterStepFn,
    pub jv_object_iter_next: JvObjectIterStepFn,
    pub jv_object_iter_key: JvObjectIterGetFn,
    pub jv_object_iter_value: JvObjectIterGetFn,
    pub jv_parse_sized: JvStringSizedFn,
    pub jv_dump_string: JvDumpStringFn,
}

// Safety: the library handle and function pointers are plain data. Engine
// handles and jv values are never shared through this table.
unsafe impl Send for JqLib {}
unsafe impl Sync for JqLib {}

static LIBRARY: OnceLock<std::result::Result<JqLib, String>> = OnceLock::new();

/// Copies a function pointer out of the library.
///
/// # Safety
///
/// `T` must match the C signature of `name`.
unsafe fn symbol<T: Copy>(lib: &Library, name: &str) -> std::result::Result<T, String> {
    lib.get::<T>(name.as_bytes())
        .map(|sym| *sym)
        .map_err(|e| format!("Symbol {} not found: {}", name, e))
}

fn open_first(candidates: &[PathBuf]) -> std::result::Result<Library, String> {
    let mut failures = Vec::new();
    for path in candidates {
        // Safety: libjq runs no initialization code with preconditions on load.
        match unsafe { Library::new(path) } {
            Ok(lib) => {
                log::debug!("loaded libjq from {}", path.display());
                return Ok(lib);
            }
            Err(e) => failures.push(format!("{}: {}", path.display(), e)),
        }
    }
    Err(format!("libjq could not be loaded ({})", failures.join("; ")))
}

impl JqLib {
    fn load() -> std::result::Result<Self, String> {
        let lib = open_first(&setup::library_candidates())?;
        Self::bind(lib)
    }

    fn bind(lib: Library) -> std::result::Result<Self, String> {
        // Safety: every type below matches the declaration in jq.h / jv.h.
        unsafe {
            Ok(JqLib {
                jq_init: symbol(&lib, "jq_init")?,
                jq_teardown: symbol(&lib, "jq_teardown")?,
                jq_set_error_cb: symbol(&lib, "jq_set_error_cb")?,
                jq_compile_args: symbol(&lib, "jq_compile_args")?,
                jq_start: symbol(&lib, "jq_start")?,
                jq_next: symbol(&lib, "jq_next")?,
                jq_format_error: symbol(&lib, "jq_format_error")?,
                jv_get_kind: symbol(&lib, "jv_get_kind")?,
                jv_copy: symbol(&lib, "jv_copy")?,
                jv_free: symbol(&lib, "jv_free")?,
                jv_invalid_get_msg: symbol(&lib, "jv_invalid_get_msg")?,
                jv_invalid_has_msg: symbol(&lib, "jv_invalid_has_msg")?,
                jv_invalid_with_msg: symbol(&lib, "jv_invalid_with_msg")?,
                jv_null: symbol(&lib, "jv_null")?,
                jv_bool: symbol(&lib, "jv_bool")?,
                jv_number: symbol(&lib, "jv_number")?,
                jv_number_value: symbol(&lib, "jv_number_value")?,
                jv_is_integer: symbol(&lib, "jv_is_integer")?,
                jv_string_sized: symbol(&lib, "jv_string_sized")?,
                jv_string_value: symbol(&lib, "jv_string_value")?,
                jv_string_length_bytes: symbol(&lib, "jv_string_length_bytes")?,
                jv_array: symbol(&lib, "jv_array")?,
                jv_array_append: symbol(&lib, "jv_array_append")?,
                jv_array_length: symbol(&lib, "jv_array_length")?,
                jv_array_get: symbol(&lib, "jv_array_get")?,
                jv_object: symbol(&lib, "jv_object")?,
                jv_object_set: symbol(&lib, "jv_object_set")?,
                jv_object_iter: symbol(&lib, "jv_object_iter")?,
                jv_object_iter_valid: symbol(&lib, "jv_object_iter_valid")?,
                jv_object_iter_next: symbol(&lib, "jv_object_iter_next")?,
                jv_object_iter_key: symbol(&lib, "jv_object_iter_key")?,
                jv_object_iter_value: symbol(&lib, "jv_object_iter_value")?,
                jv_parse_sized: symbol(&lib, "jv_parse_sized")?,
                jv_dump_string: symbol(&lib, "jv_dump_string")?,
                lib,
            })
        }
    }
}

/// Gets or initializes the loaded library.
pub fn get_library() -> Result<&'static JqLib> {
    let result = LIBRARY.get_or_init(JqLib::load);

    match result {
        Ok(lib) => Ok(lib),
        Err(msg) => Err(JqError::SetupFailed(msg.clone())),
    }
}

/// Returns the library if a previous call to [`get_library`] loaded it.
pub fn loaded_library() -> Option<&'static JqLib> {
    LIBRARY.get().and_then(|result| result.as_ref().ok())
}

/// Library for tests that need a real libjq.
///
/// Returns `None` only when no candidate can be opened at all. A libjq that
/// opens but fails to bind is a test failure, not a skip.
#[cfg(test)]
pub(crate) fn test_library() -> Option<&'static JqLib> {
    if open_first(&setup::library_candidates()).is_err() {
        return None;
    }
    match get_library() {
        Ok(lib) => Some(lib),
        Err(e) => panic!("libjq opened but did not bind: {}", e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::mem;
    use tempfile::TempDir;

    #[test]
    fn test_jv_layout_matches_c() {
        assert_eq!(mem::size_of::<jv>(), 16);
        assert_eq!(mem::align_of::<jv>(), 8);
    }

    #[test]
    fn test_jv_kind_values_are_sequential() {
        let kinds = [
            JV_KIND_INVALID,
            JV_KIND_NULL,
            JV_KIND_FALSE,
            JV_KIND_TRUE,
            JV_KIND_NUMBER,
            JV_KIND_STRING,
            JV_KIND_ARRAY,
            JV_KIND_OBJECT,
        ];
        for (i, kind) in kinds.iter().enumerate() {
            assert_eq!(*kind as usize, i);
        }
    }

    #[test]
    fn test_msg_cb_is_pointer_sized() {
        assert_eq!(mem::size_of::<jq_msg_cb>(), mem::size_of::<*mut c_void>());
    }

    #[test]
    fn test_open_first_fails_with_invalid_library() {
        let temp_dir = TempDir::new().unwrap();
        let lib_path = temp_dir.path().join("libjq.so.1");
        std::fs::write(&lib_path, b"not a real library").unwrap();

        let err = match open_first(&[lib_path.clone()]) {
            Err(err) => err,
            Ok(_) => panic!("Expected error but got Ok"),
        };
        assert!(err.contains("libjq could not be loaded"), "{}", err);
        assert!(err.contains(&lib_path.display().to_string()), "{}", err);
    }

    #[test]
    fn test_open_first_with_no_candidates() {
        match open_first(&[]) {
            Err(err) => assert!(err.contains("libjq could not be loaded")),
            Ok(_) => panic!("Expected error but got Ok"),
        }
    }

    #[test]
    fn test_openable_library_binds_every_symbol() {
        for name in setup::get_lib_names() {
            // Safety: see `open_first`.
            if unsafe { Library::new(name) }.is_ok() {
                if let Err(e) = get_library() {
                    panic!("{} opens but binding failed: {}", name, e);
                }
                return;
            }
        }
    }

    #[test]
    fn test_loaded_library_matches_get_library() {
        match get_library() {
            Ok(lib) => {
                let loaded = loaded_library().unwrap();
                assert!(std::ptr::eq(lib, loaded));
            }
            Err(JqError::SetupFailed(msg)) => {
                assert!(loaded_library().is_none());
                assert!(!msg.is_empty());
            }
            Err(other) => panic!("Unexpected error type: {}", other),
        }
    }
}

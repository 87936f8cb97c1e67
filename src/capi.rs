//! C ABI for embedding the parser, mirroring the JSON output contract.
//!
//! ```c
//! int logica_parse_rules_json(const char* program_text,
//!                             const char* file_name,
//!                             const char* logicapath,
//!                             int full,
//!                             char** out_json,
//!                             char** out_err);
//! void logica_free(char* p);
//! ```
//!
//! Returns 0 on success setting `*out_json`, non-zero on error setting
//! `*out_err`; exactly one of the two is set. Both strings are freed by
//! the caller via `logica_free`.

use std::ffi::{c_char, c_int, CStr, CString};
use std::path::PathBuf;

use crate::json;
use crate::parser::FileParser;

fn to_c_string(s: String) -> *mut c_char {
    // Interior NULs cannot round-trip through a C string.
    let sanitized = s.replace('\0', " ");
    CString::new(sanitized)
        .expect("NUL bytes removed")
        .into_raw()
}

unsafe fn from_c_string<'a>(ptr: *const c_char) -> &'a str {
    if ptr.is_null() {
        return "";
    }
    CStr::from_ptr(ptr).to_str().unwrap_or("")
}

/// # Safety
///
/// All pointer arguments must be null or valid NUL-terminated strings;
/// `out_json` and `out_err` must be null or valid out-pointers.
#[no_mangle]
pub unsafe extern "C" fn logica_parse_rules_json(
    program_text: *const c_char,
    file_name: *const c_char,
    logicapath: *const c_char,
    full: c_int,
    out_json: *mut *mut c_char,
    out_err: *mut *mut c_char,
) -> c_int {
    if !out_json.is_null() {
        *out_json = std::ptr::null_mut();
    }
    if !out_err.is_null() {
        *out_err = std::ptr::null_mut();
    }
    let text = from_c_string(program_text);
    let _name = from_c_string(file_name);
    let roots: Vec<PathBuf> = from_c_string(logicapath)
        .split(':')
        .filter(|p| !p.is_empty())
        .map(PathBuf::from)
        .collect();
    match FileParser::new(roots).parse(text) {
        Ok(unit) => {
            if !out_json.is_null() {
                *out_json = to_c_string(json::render(&unit, full != 0));
            }
            0
        }
        Err(error) => {
            if !out_err.is_null() {
                *out_err = to_c_string(error.to_string());
            }
            1
        }
    }
}

/// # Safety
///
/// `p` must be null or a pointer previously returned by this library.
#[no_mangle]
pub unsafe extern "C" fn logica_free(p: *mut c_char) {
    if !p.is_null() {
        drop(CString::from_raw(p));
    }
}

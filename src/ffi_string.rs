//! FFI String Safety Module
//!
//! Moves strings and bytes across the boundary through caller-owned buffers,
//! and turns raw C arguments into checked Rust values.
//!
//! # Design Principles
//! 1. The host owns every output buffer; Rust never hands out allocations
//! 2. Writes never exceed the declared capacity and strings are always
//!    null-terminated within it
//! 3. Truncation that loses data is reported as `BufferTooSmall`
//! 4. The last error message is kept per thread for later retrieval

use std::cell::RefCell;
use std::ffi::{c_char, CStr, CString};

use crate::error::{NativeError, NativeResult};
use crate::ffi::ERR_SUCCESS;

/// Largest buffer capacity honoured for string output.
pub const MAX_OUTPUT_BUFFER_SIZE: usize = 64 * 1024;

/// Most symbols accepted in one subscription.
pub const MAX_SYMBOLS: usize = 100_000;

/// Longest single symbol accepted, in bytes.
pub const MAX_SYMBOL_LENGTH: usize = 1024;

/// Largest combined size of all symbols in one subscription.
pub const MAX_TOTAL_SYMBOL_BYTES: usize = 10 * 1024 * 1024;

// ============================================================================
// Last Error Storage
// ============================================================================

thread_local! {
    static LAST_ERROR: RefCell<Option<String>> = const { RefCell::new(None) };
}

/// Set the last error message for the calling thread.
pub fn set_last_error_message(message: impl Into<String>) {
    let message = message.into();
    LAST_ERROR.with(|cell| *cell.borrow_mut() = Some(message));
}

/// Clear the last error message for the calling thread.
pub fn clear_last_error() {
    LAST_ERROR.with(|cell| *cell.borrow_mut() = None);
}

/// Get the last error message for the calling thread.
pub fn get_last_error() -> Option<String> {
    LAST_ERROR.with(|cell| cell.borrow().clone())
}

// ============================================================================
// Output Buffers
// ============================================================================

/// Copy `src` into a caller buffer as a null-terminated string.
///
/// Writes at most `capacity` bytes (capped at `MAX_OUTPUT_BUFFER_SIZE`),
/// always including the terminator. Truncation happens on a UTF-8 character
/// boundary and is reported as `BufferTooSmall`; the truncated string is
/// still written.
///
/// # Safety
/// `dest` must be null or valid for writes of `capacity` bytes.
pub unsafe fn copy_str_to_buffer(dest: *mut c_char, capacity: usize, src: &str) -> NativeResult<usize> {
    if dest.is_null() {
        return Err(NativeError::null_pointer("buffer"));
    }
    if capacity == 0 {
        return Err(NativeError::invalid_param("buffer_size", "must be at least 1"));
    }

    let usable = capacity.min(MAX_OUTPUT_BUFFER_SIZE) - 1;
    let mut len = src.len().min(usable);
    while !src.is_char_boundary(len) {
        len -= 1;
    }

    // SAFETY: len + 1 <= capacity and the caller guarantees capacity bytes
    std::ptr::copy_nonoverlapping(src.as_ptr(), dest as *mut u8, len);
    *dest.add(len) = 0;

    if len < src.len() {
        Err(NativeError::BufferTooSmall {
            required: src.len() + 1,
            capacity,
        })
    } else {
        Ok(len)
    }
}

/// Best-effort error message output. Null buffers are ignored.
///
/// # Safety
/// Same contract as [`copy_str_to_buffer`].
pub unsafe fn write_error(dest: *mut c_char, capacity: usize, message: &str) {
    let _ = copy_str_to_buffer(dest, capacity, message);
}

/// Copy raw bytes into a caller buffer.
///
/// Nothing is written unless all of `src` fits.
///
/// # Safety
/// `dest` must be null or valid for writes of `capacity` bytes.
pub unsafe fn copy_bytes_to_buffer(dest: *mut u8, capacity: usize, src: &[u8]) -> NativeResult<usize> {
    if dest.is_null() {
        return Err(NativeError::null_pointer("buffer"));
    }
    if src.len() > capacity {
        return Err(NativeError::BufferTooSmall {
            required: src.len(),
            capacity,
        });
    }
    std::ptr::copy_nonoverlapping(src.as_ptr(), dest, src.len());
    Ok(src.len())
}

/// Build a C string for callbacks, replacing interior nulls.
pub fn to_c_message(message: &str) -> CString {
    CString::new(message.replace('\0', "\u{FFFD}")).unwrap_or_default()
}

// ============================================================================
// Input Arguments
// ============================================================================

/// Borrow a required, non-empty UTF-8 string argument.
///
/// # Safety
/// `ptr` must be null or point to a null-terminated string that outlives `'a`.
pub unsafe fn cstr_arg<'a>(ptr: *const c_char, name: &str) -> NativeResult<&'a str> {
    if ptr.is_null() {
        return Err(NativeError::null_pointer(name));
    }
    let value = CStr::from_ptr(ptr)
        .to_str()
        .map_err(|_| NativeError::invalid_param(name, "is not valid UTF-8"))?;
    if value.is_empty() {
        return Err(NativeError::invalid_param(name, "cannot be empty"));
    }
    Ok(value)
}

/// Borrow an optional string argument. Null and empty both mean `None`.
///
/// # Safety
/// Same contract as [`cstr_arg`].
pub unsafe fn optional_cstr_arg<'a>(ptr: *const c_char, name: &str) -> NativeResult<Option<&'a str>> {
    if ptr.is_null() {
        return Ok(None);
    }
    let value = CStr::from_ptr(ptr)
        .to_str()
        .map_err(|_| NativeError::invalid_param(name, "is not valid UTF-8"))?;
    Ok(if value.is_empty() { None } else { Some(value) })
}

/// Length of a C string, scanning no further than `limit + 1` bytes.
unsafe fn bounded_strlen(ptr: *const c_char, limit: usize) -> usize {
    let mut len = 0;
    while len <= limit && *ptr.add(len) != 0 {
        len += 1;
    }
    len
}

/// Read a symbol array, enforcing count, per-symbol and total size limits.
///
/// # Safety
/// When `count > 0`, `symbols` must be null or point to `count` pointers,
/// each null or pointing to a null-terminated string.
pub unsafe fn symbol_array_arg(symbols: *const *const c_char, count: usize) -> NativeResult<Vec<String>> {
    if count == 0 {
        return Ok(Vec::new());
    }
    if symbols.is_null() {
        return Err(NativeError::invalid_param(
            "symbols",
            "array cannot be NULL when symbol_count > 0",
        ));
    }
    if count > MAX_SYMBOLS {
        return Err(NativeError::invalid_param(
            "symbols",
            format!("count exceeds maximum limit of {}", MAX_SYMBOLS),
        ));
    }

    let mut total = 0usize;
    let mut out = Vec::with_capacity(count);
    for i in 0..count {
        let ptr = *symbols.add(i);
        if ptr.is_null() {
            return Err(NativeError::invalid_param(
                "symbols",
                format!("contains NULL element at index {}", i),
            ));
        }

        let len = bounded_strlen(ptr, MAX_SYMBOL_LENGTH);
        if len > MAX_SYMBOL_LENGTH {
            return Err(NativeError::invalid_param(
                "symbols",
                format!("symbol at index {} exceeds maximum length of {}", i, MAX_SYMBOL_LENGTH),
            ));
        }
        total += len;
        if total > MAX_TOTAL_SYMBOL_BYTES {
            return Err(NativeError::invalid_param(
                "symbols",
                format!("total size exceeds maximum limit of {} bytes", MAX_TOTAL_SYMBOL_BYTES),
            ));
        }

        let bytes = std::slice::from_raw_parts(ptr as *const u8, len);
        let symbol = std::str::from_utf8(bytes).map_err(|_| {
            NativeError::invalid_param("symbols", format!("symbol at index {} is not valid UTF-8", i))
        })?;
        out.push(symbol.to_string());
    }
    Ok(out)
}

// ============================================================================
// FFI Functions
// ============================================================================

/// Copy the calling thread's last error message into `buffer`.
///
/// Writes an empty string when there is no error.
///
/// # Safety
/// - `buffer` must be valid for writes of `buffer_size` bytes
///
/// # Returns
/// - ERR_SUCCESS on success
/// - ERR_BUFFER_TOO_SMALL if the message was truncated
/// - ERR_INVALID_PARAM if buffer is null or buffer_size is 0
#[no_mangle]
pub unsafe extern "C" fn dbento_get_last_error(buffer: *mut c_char, buffer_size: usize) -> i32 {
    let message = get_last_error().unwrap_or_default();
    match copy_str_to_buffer(buffer, buffer_size, &message) {
        Ok(_) => ERR_SUCCESS,
        Err(e) => e.to_error_code(),
    }
}

/// Check if there is a pending error message.
///
/// # Returns
/// - 1 if there is an error message
/// - 0 if there is no error message
#[no_mangle]
pub extern "C" fn dbento_has_last_error() -> i32 {
    if get_last_error().is_some() {
        1
    } else {
        0
    }
}

/// Clear the calling thread's last error message.
#[no_mangle]
pub extern "C" fn dbento_clear_last_error() {
    clear_last_error();
}

/// Copy a record envelope into a caller buffer.
///
/// # Safety
/// - `record` must be valid for reads of `record_length` bytes
/// - `buffer` must be valid for writes of `buffer_size` bytes
/// - `written` may be null; otherwise receives the bytes copied, or the
///   required size when the buffer is too small
///
/// # Returns
/// - ERR_SUCCESS on success
/// - ERR_INVALID_PARAM if record or buffer is null
/// - ERR_BUFFER_TOO_SMALL if buffer_size < record_length (nothing copied)
#[no_mangle]
pub unsafe extern "C" fn dbento_copy_record(
    record: *const u8,
    record_length: usize,
    buffer: *mut u8,
    buffer_size: usize,
    written: *mut usize,
) -> i32 {
    if record.is_null() {
        return NativeError::null_pointer("record").set_and_return_code();
    }
    let src = std::slice::from_raw_parts(record, record_length);
    let (code, count) = match copy_bytes_to_buffer(buffer, buffer_size, src) {
        Ok(n) => (ERR_SUCCESS, n),
        Err(e @ NativeError::BufferTooSmall { required, .. }) => (e.set_and_return_code(), required),
        Err(e) => (e.set_and_return_code(), 0),
    };
    if !written.is_null() {
        *written = count;
    }
    code
}

// ============================================================================
// Tests
// ============================================================================

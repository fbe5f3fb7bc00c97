//! Shared helpers for live session integration tests.

#![allow(dead_code)]

use std::ffi::{c_char, c_void, CStr, CString};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;
use std::thread;
use std::time::{Duration, Instant};

use databento_native::gateway::Record;

/// Collects everything the bridge delivers for one session.
///
/// Passed to the bridge as `user_data`.
#[derive(Default)]
pub struct Sink {
    pub records: Mutex<Vec<Delivered>>,
    pub errors: Mutex<Vec<(String, i32)>>,
    pub metadata: Mutex<Vec<String>>,
    /// Panic inside the record callback on this (1-based) record
    pub panic_on: AtomicUsize,
    /// Panic with a non-string payload instead
    pub panic_opaque: AtomicBool,
    /// Set while a record callback is executing
    pub inside: AtomicBool,
    /// Sleep inside every record callback
    pub delay_ms: AtomicUsize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivered {
    pub length: usize,
    pub rtype: u8,
    pub instrument_id: u32,
}

impl Sink {
    pub fn ctx(&self) -> *mut c_void {
        self as *const Sink as *mut c_void
    }

    pub fn record_count(&self) -> usize {
        self.records.lock().unwrap().len()
    }

    pub fn error_codes(&self) -> Vec<i32> {
        self.errors.lock().unwrap().iter().map(|e| e.1).collect()
    }
}

pub unsafe extern "C-unwind" fn on_record(bytes: *const u8, length: usize, rtype: u8, ctx: *mut c_void) {
    let sink = &*(ctx as *const Sink);
    sink.inside.store(true, Ordering::SeqCst);

    let raw = std::slice::from_raw_parts(bytes, length);
    let instrument_id = u32::from_le_bytes([raw[4], raw[5], raw[6], raw[7]]);
    let count = {
        let mut records = sink.records.lock().unwrap();
        records.push(Delivered {
            length,
            rtype,
            instrument_id,
        });
        records.len()
    };

    let delay = sink.delay_ms.load(Ordering::SeqCst);
    if delay > 0 {
        thread::sleep(Duration::from_millis(delay as u64));
    }
    sink.inside.store(false, Ordering::SeqCst);

    if count == sink.panic_on.load(Ordering::SeqCst) {
        if sink.panic_opaque.load(Ordering::SeqCst) {
            std::panic::panic_any(17u32);
        }
        panic!("record handler failed on {}", count);
    }
}

pub unsafe extern "C-unwind" fn on_error(message: *const c_char, code: i32, ctx: *mut c_void) {
    let sink = &*(ctx as *const Sink);
    let message = CStr::from_ptr(message).to_string_lossy().into_owned();
    sink.errors.lock().unwrap().push((message, code));
}

pub unsafe extern "C-unwind" fn on_metadata(json: *const c_char, length: usize, ctx: *mut c_void) {
    let sink = &*(ctx as *const Sink);
    let bytes = std::slice::from_raw_parts(json as *const u8, length);
    sink.metadata
        .lock()
        .unwrap()
        .push(String::from_utf8_lossy(bytes).into_owned());
}

/// Records the error like `on_error`, then panics.
pub unsafe extern "C-unwind" fn panicking_on_error(message: *const c_char, code: i32, ctx: *mut c_void) {
    on_error(message, code, ctx);
    panic!("error handler failed");
}

/// Records the metadata like `on_metadata`, then panics. The payload is
/// opaque when `panic_opaque` is set.
pub unsafe extern "C-unwind" fn panicking_on_metadata(json: *const c_char, length: usize, ctx: *mut c_void) {
    on_metadata(json, length, ctx);
    let sink = &*(ctx as *const Sink);
    if sink.panic_opaque.load(Ordering::SeqCst) {
        std::panic::panic_any(3u8);
    }
    panic!("metadata handler failed");
}

/// A trade-like record with a 32-byte payload.
pub fn trade(instrument_id: u32) -> Record {
    Record::build(0x00, 1, instrument_id, 1_700_000_000_000_000_000, &[0u8; 32]).unwrap()
}

pub fn cstring(s: &str) -> CString {
    CString::new(s).unwrap()
}

pub fn read_c(buf: &[c_char]) -> String {
    unsafe { CStr::from_ptr(buf.as_ptr()) }
        .to_string_lossy()
        .into_owned()
}

pub fn wait_until(mut done: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + Duration::from_secs(5);
    while Instant::now() < deadline {
        if done() {
            return true;
        }
        thread::sleep(Duration::from_millis(1));
    }
    false
}

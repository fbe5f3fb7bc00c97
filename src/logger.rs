//! Host-facing logging.
//!
//! Log lines go to a single callback registered by the host. The callback is
//! kept in an `AtomicPtr`, so logging from run-loop threads never takes a
//! lock and a callback swap is visible to every thread on its next message.

use std::ffi::{c_char, CString};
use std::sync::atomic::{AtomicPtr, AtomicU64, Ordering};

use chrono::{SecondsFormat, Utc};

/// Severity attached to each log line. Values are part of the C ABI.
#[repr(i32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum LogLevel {
    Trace = 0,
    Debug = 1,
    Info = 2,
    Warn = 3,
    Error = 4,
}

impl LogLevel {
    pub fn from_i32(value: i32) -> Option<Self> {
        [
            LogLevel::Trace,
            LogLevel::Debug,
            LogLevel::Info,
            LogLevel::Warn,
            LogLevel::Error,
        ]
        .into_iter()
        .find(|level| *level as i32 == value)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            LogLevel::Trace => "TRACE",
            LogLevel::Debug => "DEBUG",
            LogLevel::Info => "INFO",
            LogLevel::Warn => "WARN",
            LogLevel::Error => "ERROR",
        }
    }
}

/// Host log sink: `(level, null-terminated message)`.
pub type LogCallback = extern "C" fn(level: i32, message: *const c_char);

/// Null, or a `LogCallback` stored as a data pointer.
static LOG_CALLBACK: AtomicPtr<()> = AtomicPtr::new(std::ptr::null_mut());

static NEXT_CORRELATION_ID: AtomicU64 = AtomicU64::new(1);

/// Register the host log callback, replacing any previous one.
///
/// The function must stay callable until `clear_log_callback` is called.
pub fn set_log_callback(callback: LogCallback) {
    LOG_CALLBACK.store(callback as *mut (), Ordering::Release);
}

pub fn clear_log_callback() {
    LOG_CALLBACK.store(std::ptr::null_mut(), Ordering::Release);
}

pub fn has_log_callback() -> bool {
    !LOG_CALLBACK.load(Ordering::Acquire).is_null()
}

/// Send one line to the host. Without a callback the line is dropped.
fn emit(level: LogLevel, line: &str) {
    let ptr = LOG_CALLBACK.load(Ordering::Acquire);
    if ptr.is_null() {
        return;
    }
    // SAFETY: LOG_CALLBACK only ever holds null or a LogCallback
    let callback: LogCallback = unsafe { std::mem::transmute::<*mut (), LogCallback>(ptr) };
    if let Ok(line) = CString::new(line) {
        callback(level as i32, line.as_ptr());
    }
}

/// Log a bare message at `level`. Used by the `log_*!` macros.
pub fn log(level: LogLevel, message: &str) {
    emit(level, message);
}

/// Named logger that stamps each line with time, level and correlation id.
///
/// Each live session owns one, so all lines for a session share an id.
#[derive(Debug)]
pub struct Logger {
    name: String,
    min_level: LogLevel,
    correlation_id: u64,
}

impl Logger {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            min_level: LogLevel::Info,
            correlation_id: 0,
        }
    }

    pub fn with_level(mut self, level: LogLevel) -> Self {
        self.min_level = level;
        self
    }

    pub fn with_correlation_id(mut self, id: u64) -> Self {
        self.correlation_id = id;
        self
    }

    /// Fresh process-wide correlation id. Never 0.
    pub fn new_correlation_id() -> u64 {
        NEXT_CORRELATION_ID.fetch_add(1, Ordering::Relaxed)
    }

    pub fn correlation_id(&self) -> u64 {
        self.correlation_id
    }

    fn format(&self, level: LogLevel, message: &str) -> String {
        let timestamp = Utc::now().to_rfc3339_opts(SecondsFormat::Micros, true);
        if self.correlation_id == 0 {
            format!("{} [{}] [{}] {}", timestamp, level.as_str(), self.name, message)
        } else {
            format!(
                "{} [{}] [{}] [cid:{:#x}] {}",
                timestamp,
                level.as_str(),
                self.name,
                self.correlation_id,
                message
            )
        }
    }

    pub fn log(&self, level: LogLevel, message: &str) {
        if level < self.min_level {
            return;
        }
        let line = self.format(level, message);

        #[cfg(debug_assertions)]
        eprintln!("{}", line);

        emit(level, &line);
    }

    pub fn debug(&self, message: &str) {
        self.log(LogLevel::Debug, message);
    }

    pub fn info(&self, message: &str) {
        self.log(LogLevel::Info, message);
    }

    pub fn warn(&self, message: &str) {
        self.log(LogLevel::Warn, message);
    }

    pub fn error(&self, message: &str) {
        self.log(LogLevel::Error, message);
    }

    // Session events

    pub fn log_session_created(&self, handle: usize, dataset: Option<&str>) {
        self.info(&format!(
            "SESSION_CREATED: handle={:#x}, dataset={}",
            handle,
            dataset.unwrap_or("<unbound>")
        ));
    }

    pub fn log_subscribed(&self, dataset: &str, schema: &str, symbol_count: usize, snapshot: bool) {
        self.info(&format!(
            "SUBSCRIBED: dataset={}, schema={}, symbols={}, snapshot={}",
            dataset, schema, symbol_count, snapshot
        ));
    }

    pub fn log_streaming_started(&self, dataset: &str, with_metadata: bool) {
        self.info(&format!(
            "STREAMING_STARTED: dataset={}, metadata_callback={}",
            dataset, with_metadata
        ));
    }

    pub fn log_session_stopped(&self, dataset: &str) {
        self.info(&format!("SESSION_STOPPED: dataset={}", dataset));
    }

    /// `action` is `reconnect` or `resubscribe`.
    pub fn log_rearm(&self, dataset: &str, action: &str, restarted: bool) {
        self.info(&format!(
            "SESSION_REARMED: dataset={}, action={}, restarted={}",
            dataset, action, restarted
        ));
    }

    pub fn log_session_destroyed(&self, dataset: &str) {
        self.info(&format!("SESSION_DESTROYED: dataset={}", dataset));
    }

    /// A gateway error swallowed while tearing a session down.
    pub fn log_teardown_failure(&self, dataset: &str, reason: &str) {
        self.warn(&format!("TEARDOWN_FAILURE: dataset={}, reason={}", dataset, reason));
    }

    pub fn log_callback_panic(&self, code: i32, message: &str) {
        self.error(&format!("CALLBACK_PANIC: code={}, message={}", code, message));
    }
}

impl Default for Logger {
    fn default() -> Self {
        Self::new("DatabentoNative")
    }
}

#[macro_export]
macro_rules! log_info {
    ($($arg:tt)*) => {
        $crate::logger::log($crate::logger::LogLevel::Info, &format!($($arg)*))
    };
}

#[macro_export]
macro_rules! log_debug {
    ($($arg:tt)*) => {
        $crate::logger::log($crate::logger::LogLevel::Debug, &format!($($arg)*))
    };
}

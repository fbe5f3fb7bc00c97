//! Databento Native Bridge
//!
//! C ABI library that lets a managed host drive live market-data sessions
//! through validated opaque handles.
//! Provides FFI interface for C# interop.

pub mod types;
pub mod error;
pub mod registry;
pub mod gateway;
pub mod session;
pub mod client;
pub mod ffi_string;
pub mod ffi;
pub mod logger;

pub use types::*;
pub use error::{NativeError, NativeResult};
pub use registry::{Handle, HandleRegistry, TypeTag, ValidationError};
pub use gateway::*;
pub use session::{LiveSession, SessionCallbacks, SessionPhase};
pub use client::LiveClients;
pub use ffi::*;
pub use ffi_string::*;
// Note: logger::set_log_callback is intentionally not re-exported here
// to keep dbento_set_log_callback the single FFI entry point.
pub use logger::{Logger, LogLevel, LogCallback, clear_log_callback};

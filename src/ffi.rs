//! FFI (Foreign Function Interface) layer for C# interop.
//!
//! All functions use `extern "C"` ABI and `#[no_mangle]` for C# P/Invoke compatibility.
//! Error handling uses return codes instead of panics to ensure FFI safety.
//!
//! Live client handles are registry tokens: every call resolves the handle
//! through the process-wide [`HandleRegistry`] before touching a session.

use std::ffi::c_char;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, PoisonError, RwLock};

use lazy_static::lazy_static;

use crate::client::LiveClients;
use crate::error::{NativeError, NativeResult};
use crate::ffi_string::{
    copy_str_to_buffer, cstr_arg, optional_cstr_arg, symbol_array_arg, write_error,
};
use crate::gateway::{GatewayConfig, GatewayFactory, ReplayGatewayFactory};
use crate::logger::{self, LogCallback};
use crate::registry::{Handle, HandleRegistry};
use crate::session::SessionCallbacks;
use crate::types::{
    ConnectionState, DbentoLiveClientHandle, ErrorCallback, LiveClientConfig, MetadataCallback,
    RecordCallback, UpgradePolicy,
};

// ============================================================================
// Error Codes
// ============================================================================

/// Operation completed successfully
pub const ERR_SUCCESS: i32 = 0;
/// Handle is null, unknown or already destroyed
pub const ERR_INVALID_HANDLE: i32 = -1;
/// Invalid parameter value (null, empty, malformed or over a limit)
pub const ERR_INVALID_PARAM: i32 = -2;
/// The gateway raised an error
pub const ERR_CONNECTION_FAILED: i32 = -3;
/// Handle belongs to a different object type
pub const ERR_TYPE_MISMATCH: i32 = -4;
/// Schema name not recognised
pub const ERR_UNKNOWN_SCHEMA: i32 = -5;
/// Caller buffer cannot hold the output
pub const ERR_BUFFER_TOO_SMALL: i32 = -6;
/// Operation not allowed in the current session phase
pub const ERR_INVALID_STATE: i32 = -7;
/// Uncategorized failure, including panics caught at the boundary
pub const ERR_UNKNOWN: i32 = -99;

/// Record callback panicked with a string payload
pub const ERR_CALLBACK_PANIC: i32 = -999;
/// Record callback panicked with any other payload
pub const ERR_CALLBACK_UNKNOWN: i32 = -998;
/// Metadata callback panicked with a string payload
pub const ERR_METADATA_PANIC: i32 = -997;
/// Metadata callback panicked with any other payload
pub const ERR_METADATA_UNKNOWN: i32 = -996;

// ============================================================================
// Library State
// ============================================================================

lazy_static! {
    static ref REGISTRY: HandleRegistry = HandleRegistry::new();
    static ref GATEWAY_FACTORY: RwLock<Arc<dyn GatewayFactory>> =
        RwLock::new(Arc::new(ReplayGatewayFactory::new()));
}

/// The registry backing every handle issued through the C ABI.
pub fn registry() -> &'static HandleRegistry {
    &REGISTRY
}

/// Replace the factory used by sessions created from now on.
pub fn install_gateway_factory(factory: Arc<dyn GatewayFactory>) {
    *GATEWAY_FACTORY.write().unwrap_or_else(PoisonError::into_inner) = factory;
}

/// Restore the default replay factory.
pub fn reset_gateway_factory() {
    install_gateway_factory(Arc::new(ReplayGatewayFactory::new()));
}

fn live_clients() -> LiveClients<'static> {
    let factory = Arc::clone(&GATEWAY_FACTORY.read().unwrap_or_else(PoisonError::into_inner));
    LiveClients::new(registry(), factory)
}

fn handle_arg(handle: DbentoLiveClientHandle) -> NativeResult<Handle> {
    Handle::from_ptr(handle).ok_or(NativeError::InvalidHandle)
}

/// Map an operation outcome to a status code, reporting failures.
unsafe fn status(
    result: std::thread::Result<NativeResult<()>>,
    error_buffer: *mut c_char,
    error_buffer_size: usize,
) -> i32 {
    let error = match result {
        Ok(Ok(())) => return ERR_SUCCESS,
        Ok(Err(e)) => e,
        Err(_) => NativeError::internal("panic caught at FFI boundary"),
    };
    write_error(error_buffer, error_buffer_size, &error.to_string());
    error.set_and_return_code()
}

fn gateway_config(api_key: &str, config: Option<&LiveClientConfig>) -> NativeResult<GatewayConfig> {
    let mut out = GatewayConfig::new(api_key);
    if let Some(config) = config {
        // SAFETY: dataset is null or a valid C string per the config contract
        if let Some(dataset) = unsafe { optional_cstr_arg(config.dataset, "dataset")? } {
            out = out.with_dataset(dataset);
        }
        out.send_ts_out = config.send_ts_out != 0;
        out.upgrade_policy = UpgradePolicy::from_i32(config.upgrade_policy);
        out = out.with_heartbeat_secs(config.heartbeat_interval_secs);
    }
    Ok(out)
}

unsafe fn create(
    api_key: *const c_char,
    config: *const LiveClientConfig,
    error_buffer: *mut c_char,
    error_buffer_size: usize,
) -> DbentoLiveClientHandle {
    let result = catch_unwind(AssertUnwindSafe(|| -> NativeResult<Handle> {
        let api_key = cstr_arg(api_key, "api_key")?;
        let config = gateway_config(api_key, config.as_ref())?;
        live_clients().create(config)
    }));

    let error = match result {
        Ok(Ok(handle)) => return handle.into_ptr(),
        Ok(Err(e)) => e,
        Err(_) => NativeError::internal("panic caught at FFI boundary"),
    };
    write_error(error_buffer, error_buffer_size, &error.to_string());
    error.set_and_return_code();
    std::ptr::null_mut()
}

// ============================================================================
// Live Client Lifecycle
// ============================================================================

/// Create a live client.
///
/// Sessions are backed by the installed gateway factory. Until an embedder
/// calls [`install_gateway_factory`], that is a [`ReplayGatewayFactory`]
/// whose feeds are only reachable from Rust, so a host using the C ABI
/// alone can subscribe and start but never receives records.
///
/// # Safety
/// - `api_key` must be a valid null-terminated UTF-8 string
/// - `error_buffer` must be null or valid for `error_buffer_size` bytes
/// - Caller must call `dbento_live_destroy` to release the handle
///
/// # Returns
/// - Opaque handle on success
/// - Null on failure, with the reason in `error_buffer`
#[no_mangle]
pub unsafe extern "C" fn dbento_live_create(
    api_key: *const c_char,
    error_buffer: *mut c_char,
    error_buffer_size: usize,
) -> DbentoLiveClientHandle {
    create(api_key, std::ptr::null(), error_buffer, error_buffer_size)
}

/// Create a live client with extended configuration.
///
/// # Safety
/// - `api_key` must be a valid null-terminated UTF-8 string
/// - `config` must be null (uses defaults) or point to a valid `LiveClientConfig`
/// - `error_buffer` must be null or valid for `error_buffer_size` bytes
#[no_mangle]
pub unsafe extern "C" fn dbento_live_create_ex(
    api_key: *const c_char,
    config: *const LiveClientConfig,
    error_buffer: *mut c_char,
    error_buffer_size: usize,
) -> DbentoLiveClientHandle {
    create(api_key, config, error_buffer, error_buffer_size)
}

/// Subscribe to symbols on a dataset.
///
/// # Safety
/// - `dataset` must be null (use the dataset given at creation) or a valid C string
/// - `schema` must be a valid null-terminated UTF-8 string
/// - `symbols` must point to `symbol_count` C strings (may be null when the count is 0)
/// - `error_buffer` must be null or valid for `error_buffer_size` bytes
///
/// # Returns
/// - ERR_SUCCESS on success
/// - ERR_INVALID_HANDLE / ERR_TYPE_MISMATCH for a bad handle
/// - ERR_INVALID_PARAM for bad arguments, ERR_UNKNOWN_SCHEMA for an unknown schema
/// - ERR_CONNECTION_FAILED if the gateway rejects the subscription
#[no_mangle]
pub unsafe extern "C" fn dbento_live_subscribe(
    handle: DbentoLiveClientHandle,
    dataset: *const c_char,
    schema: *const c_char,
    symbols: *const *const c_char,
    symbol_count: usize,
    error_buffer: *mut c_char,
    error_buffer_size: usize,
) -> i32 {
    let result = catch_unwind(AssertUnwindSafe(|| {
        let handle = handle_arg(handle)?;
        let dataset = optional_cstr_arg(dataset, "dataset")?;
        let schema = cstr_arg(schema, "schema")?;
        let symbols = symbol_array_arg(symbols, symbol_count)?;
        live_clients().subscribe(handle, dataset, schema, &symbols)
    }));
    status(result, error_buffer, error_buffer_size)
}

/// Subscribe with an initial snapshot of current state.
///
/// # Safety
/// Same as `dbento_live_subscribe`.
#[no_mangle]
pub unsafe extern "C" fn dbento_live_subscribe_with_snapshot(
    handle: DbentoLiveClientHandle,
    dataset: *const c_char,
    schema: *const c_char,
    symbols: *const *const c_char,
    symbol_count: usize,
    error_buffer: *mut c_char,
    error_buffer_size: usize,
) -> i32 {
    let result = catch_unwind(AssertUnwindSafe(|| {
        let handle = handle_arg(handle)?;
        let dataset = optional_cstr_arg(dataset, "dataset")?;
        let schema = cstr_arg(schema, "schema")?;
        let symbols = symbol_array_arg(symbols, symbol_count)?;
        live_clients().subscribe_with_snapshot(handle, dataset, schema, &symbols)
    }));
    status(result, error_buffer, error_buffer_size)
}

/// Start streaming. Returns immediately; records arrive on a background thread.
///
/// # Safety
/// - `on_record` must be non-null; `on_error` may be null
/// - `user_data` is passed back verbatim and must stay valid until the
///   client is stopped and destroyed
/// - `error_buffer` must be null or valid for `error_buffer_size` bytes
///
/// # Returns
/// - ERR_SUCCESS on success
/// - ERR_INVALID_STATE if not subscribed yet or already streaming
#[no_mangle]
pub unsafe extern "C" fn dbento_live_start(
    handle: DbentoLiveClientHandle,
    on_record: RecordCallback,
    on_error: ErrorCallback,
    user_data: *mut std::ffi::c_void,
    error_buffer: *mut c_char,
    error_buffer_size: usize,
) -> i32 {
    dbento_live_start_ex(
        handle,
        None,
        on_record,
        on_error,
        user_data,
        error_buffer,
        error_buffer_size,
    )
}

/// Start streaming with a metadata callback invoked before the first record.
///
/// # Safety
/// Same as `dbento_live_start`; `on_metadata` may be null.
#[no_mangle]
pub unsafe extern "C" fn dbento_live_start_ex(
    handle: DbentoLiveClientHandle,
    on_metadata: MetadataCallback,
    on_record: RecordCallback,
    on_error: ErrorCallback,
    user_data: *mut std::ffi::c_void,
    error_buffer: *mut c_char,
    error_buffer_size: usize,
) -> i32 {
    let result = catch_unwind(AssertUnwindSafe(|| {
        let handle = handle_arg(handle)?;
        live_clients().start(
            handle,
            SessionCallbacks {
                on_record,
                on_metadata,
                on_error,
                user_data,
            },
        )
    }));
    status(result, error_buffer, error_buffer_size)
}

/// Stop delivering records. Callbacks stay registered for a later re-arm.
///
/// # Returns
/// - ERR_SUCCESS on success
/// - ERR_INVALID_HANDLE / ERR_TYPE_MISMATCH for a bad handle
#[no_mangle]
pub extern "C" fn dbento_live_stop(handle: DbentoLiveClientHandle) -> i32 {
    let result = catch_unwind(AssertUnwindSafe(|| {
        let handle = handle_arg(handle)?;
        live_clients().stop(handle)
    }));
    // SAFETY: a null error buffer is never written
    unsafe { status(result, std::ptr::null_mut(), 0) }
}

/// Reconnect and resume streaming with the registered callbacks.
///
/// # Safety
/// - `error_buffer` must be null or valid for `error_buffer_size` bytes
#[no_mangle]
pub unsafe extern "C" fn dbento_live_reconnect(
    handle: DbentoLiveClientHandle,
    error_buffer: *mut c_char,
    error_buffer_size: usize,
) -> i32 {
    let result = catch_unwind(AssertUnwindSafe(|| {
        let handle = handle_arg(handle)?;
        live_clients().reconnect(handle)
    }));
    status(result, error_buffer, error_buffer_size)
}

/// Replay subscriptions and resume streaming if it was stopped.
///
/// # Safety
/// - `error_buffer` must be null or valid for `error_buffer_size` bytes
#[no_mangle]
pub unsafe extern "C" fn dbento_live_resubscribe(
    handle: DbentoLiveClientHandle,
    error_buffer: *mut c_char,
    error_buffer_size: usize,
) -> i32 {
    let result = catch_unwind(AssertUnwindSafe(|| {
        let handle = handle_arg(handle)?;
        live_clients().resubscribe(handle)
    }));
    status(result, error_buffer, error_buffer_size)
}

/// Destroy a live client.
///
/// Safe to call with null, unknown or already destroyed handles. Returns
/// after any in-flight callback has finished, unless called from one.
#[no_mangle]
pub extern "C" fn dbento_live_destroy(handle: DbentoLiveClientHandle) {
    let Some(handle) = Handle::from_ptr(handle) else {
        return;
    };
    let _ = catch_unwind(AssertUnwindSafe(|| {
        live_clients().destroy(handle);
    }));
}

/// Get the connection state.
///
/// # Returns
/// - 0 (disconnected) for null, invalid or destroyed handles
/// - 2 (connected) when subscribed but not streaming
/// - 3 (streaming) while records are being delivered
#[no_mangle]
pub extern "C" fn dbento_live_get_connection_state(handle: DbentoLiveClientHandle) -> i32 {
    let result = catch_unwind(AssertUnwindSafe(|| match Handle::from_ptr(handle) {
        Some(handle) => live_clients().connection_state(handle),
        None => ConnectionState::Disconnected,
    }));

    match result {
        Ok(state) => state as i32,
        Err(_) => ConnectionState::Disconnected as i32,
    }
}

/// Copy the bound dataset into `buffer`. Writes an empty string when unbound.
///
/// # Safety
/// - `buffer` must be valid for `buffer_size` bytes
///
/// # Returns
/// - ERR_SUCCESS on success
/// - ERR_BUFFER_TOO_SMALL if the dataset was truncated
/// - ERR_INVALID_PARAM if buffer is null or buffer_size is 0
#[no_mangle]
pub unsafe extern "C" fn dbento_live_get_dataset(
    handle: DbentoLiveClientHandle,
    buffer: *mut c_char,
    buffer_size: usize,
) -> i32 {
    let result = catch_unwind(AssertUnwindSafe(|| {
        let handle = handle_arg(handle)?;
        let dataset = live_clients().dataset(handle)?.unwrap_or_default();
        copy_str_to_buffer(buffer, buffer_size, &dataset).map(|_| ())
    }));
    status(result, std::ptr::null_mut(), 0)
}

// ============================================================================
// Logging
// ============================================================================

/// Set log callback function.
///
/// # Returns
/// - ERR_SUCCESS always
#[no_mangle]
pub extern "C" fn dbento_set_log_callback(callback: LogCallback) -> i32 {
    let result = catch_unwind(|| {
        logger::set_log_callback(callback);
        ERR_SUCCESS
    });

    match result {
        Ok(code) => code,
        Err(_) => ERR_UNKNOWN,
    }
}

/// Remove the log callback. Log output is dropped afterwards.
#[no_mangle]
pub extern "C" fn dbento_clear_log_callback() {
    logger::clear_log_callback();
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ffi_string::get_last_error;
    use crate::registry::TypeTag;
    use serial_test::serial;
    use std::ffi::{CStr, CString};

    fn read_c(buf: &[c_char]) -> String {
        unsafe { CStr::from_ptr(buf.as_ptr()) }.to_string_lossy().into_owned()
    }

    #[test]
    #[serial]
    fn test_create_and_destroy() {
        let key = CString::new("db-test-key").unwrap();
        unsafe {
            let handle = dbento_live_create(key.as_ptr(), std::ptr::null_mut(), 0);
            assert!(!handle.is_null());
            assert_eq!(dbento_live_get_connection_state(handle), 0);
            dbento_live_destroy(handle);
            dbento_live_destroy(handle);
            assert_eq!(dbento_live_stop(handle), ERR_INVALID_HANDLE);
        }
    }

    #[test]
    #[serial]
    fn test_create_with_null_key_reports_error() {
        let mut err = [0 as c_char; 128];
        unsafe {
            let handle = dbento_live_create(std::ptr::null(), err.as_mut_ptr(), err.len());
            assert!(handle.is_null());
        }
        assert_eq!(read_c(&err), "api_key cannot be NULL");
        assert_eq!(get_last_error().as_deref(), Some("api_key cannot be NULL"));
    }

    #[test]
    #[serial]
    fn test_create_ex_binds_dataset() {
        let key = CString::new("db-test-key").unwrap();
        let dataset = CString::new("XNAS.ITCH").unwrap();
        let config = LiveClientConfig {
            dataset: dataset.as_ptr(),
            send_ts_out: 1,
            upgrade_policy: 0,
            heartbeat_interval_secs: 10,
        };
        unsafe {
            let handle = dbento_live_create_ex(key.as_ptr(), &config, std::ptr::null_mut(), 0);
            assert!(!handle.is_null());

            let mut buf = [0 as c_char; 32];
            assert_eq!(dbento_live_get_dataset(handle, buf.as_mut_ptr(), buf.len()), ERR_SUCCESS);
            assert_eq!(read_c(&buf), "XNAS.ITCH");

            let mut small = [0 as c_char; 4];
            assert_eq!(
                dbento_live_get_dataset(handle, small.as_mut_ptr(), small.len()),
                ERR_BUFFER_TOO_SMALL
            );
            assert_eq!(read_c(&small), "XNA");

            dbento_live_destroy(handle);
        }
    }

    #[test]
    #[serial]
    fn test_null_handle_is_invalid() {
        let schema = CString::new("trades").unwrap();
        let mut err = [0 as c_char; 64];
        unsafe {
            let code = dbento_live_subscribe(
                std::ptr::null_mut(),
                std::ptr::null(),
                schema.as_ptr(),
                std::ptr::null(),
                0,
                err.as_mut_ptr(),
                err.len(),
            );
            assert_eq!(code, ERR_INVALID_HANDLE);
            assert_eq!(read_c(&err), "Invalid handle");
        }
        assert_eq!(dbento_live_stop(std::ptr::null_mut()), ERR_INVALID_HANDLE);
        assert_eq!(dbento_live_get_connection_state(std::ptr::null_mut()), 0);
        dbento_live_destroy(std::ptr::null_mut());
    }

    #[test]
    #[serial]
    fn test_foreign_handle_is_type_mismatch() {
        let handle = registry().create(TypeTag::DbnFileReader, Arc::new(()));
        assert_eq!(dbento_live_stop(handle.into_ptr()), ERR_TYPE_MISMATCH);
        dbento_live_destroy(handle.into_ptr());
        assert!(registry().destroy(handle));
    }

    #[test]
    #[serial]
    fn test_subscribe_errors() {
        let key = CString::new("db-test-key").unwrap();
        let dataset = CString::new("GLBX.MDP3").unwrap();
        let bad_schema = CString::new("ticks").unwrap();
        let schema = CString::new("trades").unwrap();
        let mut err = [0 as c_char; 128];
        unsafe {
            let handle = dbento_live_create(key.as_ptr(), std::ptr::null_mut(), 0);

            let code = dbento_live_subscribe(
                handle,
                dataset.as_ptr(),
                bad_schema.as_ptr(),
                std::ptr::null(),
                0,
                err.as_mut_ptr(),
                err.len(),
            );
            assert_eq!(code, ERR_UNKNOWN_SCHEMA);
            assert_eq!(read_c(&err), "Unknown schema: ticks");

            let code = dbento_live_subscribe(
                handle,
                dataset.as_ptr(),
                schema.as_ptr(),
                std::ptr::null(),
                3,
                err.as_mut_ptr(),
                err.len(),
            );
            assert_eq!(code, ERR_INVALID_PARAM);

            let code = dbento_live_start(handle, None, None, std::ptr::null_mut(), err.as_mut_ptr(), err.len());
            assert_eq!(code, ERR_INVALID_PARAM);

            dbento_live_destroy(handle);
        }
    }

    #[test]
    #[serial]
    fn test_start_before_subscribe_is_invalid_state() {
        unsafe extern "C-unwind" fn noop(_: *const u8, _: usize, _: u8, _: *mut std::ffi::c_void) {}

        let key = CString::new("db-test-key").unwrap();
        unsafe {
            let handle = dbento_live_create(key.as_ptr(), std::ptr::null_mut(), 0);
            let code = dbento_live_start(handle, Some(noop), None, std::ptr::null_mut(), std::ptr::null_mut(), 0);
            assert_eq!(code, ERR_INVALID_STATE);
            assert_eq!(
                dbento_live_reconnect(handle, std::ptr::null_mut(), 0),
                ERR_INVALID_STATE
            );
            dbento_live_destroy(handle);
        }
    }

    #[test]
    #[serial]
    fn test_default_factory_streams_without_records() {
        unsafe extern "C-unwind" fn noop(_: *const u8, _: usize, _: u8, _: *mut std::ffi::c_void) {}

        reset_gateway_factory();
        let key = CString::new("db-test-key").unwrap();
        let dataset = CString::new("GLBX.MDP3").unwrap();
        let schema = CString::new("trades").unwrap();
        unsafe {
            let handle = dbento_live_create(key.as_ptr(), std::ptr::null_mut(), 0);
            let code = dbento_live_subscribe(
                handle,
                dataset.as_ptr(),
                schema.as_ptr(),
                std::ptr::null(),
                0,
                std::ptr::null_mut(),
                0,
            );
            assert_eq!(code, ERR_SUCCESS);
            let code = dbento_live_start(handle, Some(noop), None, std::ptr::null_mut(), std::ptr::null_mut(), 0);
            assert_eq!(code, ERR_SUCCESS);
            assert_eq!(dbento_live_get_connection_state(handle), 3);
            dbento_live_destroy(handle);
            assert_eq!(dbento_live_get_connection_state(handle), 0);
        }
    }

    #[test]
    #[serial]
    fn test_log_callback_round_trip() {
        extern "C" fn sink(_level: i32, _message: *const c_char) {}

        assert_eq!(dbento_set_log_callback(sink), ERR_SUCCESS);
        assert!(logger::has_log_callback());
        dbento_clear_log_callback();
        assert!(!logger::has_log_callback());
    }
}

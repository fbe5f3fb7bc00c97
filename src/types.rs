//! Core FFI-compatible types for the live client bridge.
//!
//! All structs use `#[repr(C)]` and all enums exposed to the host use an
//! explicit integer representation so they line up with
//! C# `StructLayout.Sequential` and `enum : int` declarations.

use std::ffi::{c_char, c_void};
use std::fmt;
use std::str::FromStr;

use crate::error::NativeError;

// ============================================================================
// Handles
// ============================================================================

/// Opaque live client handle as seen by the host.
///
/// The address is a registry token, never a dereferenceable pointer.
pub type DbentoLiveClientHandle = *mut c_void;

// ============================================================================
// Callback Types
// ============================================================================

/// Callback for each received record.
///
/// # Arguments
/// * `record_bytes` - Raw record bytes (header followed by payload)
/// * `record_length` - Length of the record in bytes
/// * `record_type` - One-byte record type from the header
/// * `user_data` - Context pointer passed verbatim from `start`
///
/// The bytes are only valid for the duration of the call.
pub type RecordCallback = Option<
    unsafe extern "C-unwind" fn(
        record_bytes: *const u8,
        record_length: usize,
        record_type: u8,
        user_data: *mut c_void,
    ),
>;

/// Callback for errors raised while streaming.
///
/// `error_code` is always negative. The message is only valid during the call.
pub type ErrorCallback = Option<
    unsafe extern "C-unwind" fn(error_message: *const c_char, error_code: i32, user_data: *mut c_void),
>;

/// Callback for session metadata, delivered as a JSON document.
pub type MetadataCallback = Option<
    unsafe extern "C-unwind" fn(metadata_json: *const c_char, metadata_length: usize, user_data: *mut c_void),
>;

// ============================================================================
// Configuration
// ============================================================================

/// Extended live client configuration.
///
/// # FFI Safety
/// - `dataset` may be null (bound later by the first subscribe)
/// - `send_ts_out`: 0 = false, anything else = true
/// - `upgrade_policy`: 0 = AsIs, anything else = UpgradeToV3
/// - `heartbeat_interval_secs`: values <= 0 select the default (30s)
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct LiveClientConfig {
    /// Dataset code (null-terminated UTF-8) or null
    pub dataset: *const c_char,
    /// Request the gateway send timestamp on each record
    pub send_ts_out: i32,
    /// DBN version upgrade policy
    pub upgrade_policy: i32,
    /// Heartbeat interval in seconds
    pub heartbeat_interval_secs: i32,
}

impl Default for LiveClientConfig {
    fn default() -> Self {
        Self {
            dataset: std::ptr::null(),
            send_ts_out: 0,
            upgrade_policy: 1,
            heartbeat_interval_secs: 0,
        }
    }
}

/// How records from older DBN versions are presented to the host.
#[repr(i32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum UpgradePolicy {
    /// Pass records through in the version they were encoded with
    AsIs = 0,
    /// Upgrade records to DBN version 3
    #[default]
    UpgradeToV3 = 1,
}

impl UpgradePolicy {
    /// Convert from i32 for FFI. Zero selects `AsIs`, everything else upgrades.
    pub fn from_i32(value: i32) -> Self {
        if value == 0 {
            UpgradePolicy::AsIs
        } else {
            UpgradePolicy::UpgradeToV3
        }
    }
}

// ============================================================================
// Connection State
// ============================================================================

/// Connection state reported to the host.
///
/// Values match the host enum, where 1 is a host-side `Connecting` state.
#[repr(i32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// No gateway exists, or the handle is invalid or destroyed
    Disconnected = 0,
    /// Gateway exists but no records are being delivered
    Connected = 2,
    /// Records are being delivered to the record callback
    Streaming = 3,
}

// ============================================================================
// Schema
// ============================================================================

/// Record schema requested from the gateway.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Schema {
    Mbo,
    Mbp1,
    Mbp10,
    Trades,
    Ohlcv1S,
    Ohlcv1M,
    Ohlcv1H,
    Ohlcv1D,
    OhlcvEod,
    Definition,
    Statistics,
    Status,
    Imbalance,
}

impl Schema {
    /// Every schema, in wire-name order.
    pub const ALL: [Schema; 13] = [
        Schema::Mbo,
        Schema::Mbp1,
        Schema::Mbp10,
        Schema::Trades,
        Schema::Ohlcv1S,
        Schema::Ohlcv1M,
        Schema::Ohlcv1H,
        Schema::Ohlcv1D,
        Schema::OhlcvEod,
        Schema::Definition,
        Schema::Statistics,
        Schema::Status,
        Schema::Imbalance,
    ];

    /// Wire name of the schema.
    pub fn as_str(&self) -> &'static str {
        match self {
            Schema::Mbo => "mbo",
            Schema::Mbp1 => "mbp-1",
            Schema::Mbp10 => "mbp-10",
            Schema::Trades => "trades",
            Schema::Ohlcv1S => "ohlcv-1s",
            Schema::Ohlcv1M => "ohlcv-1m",
            Schema::Ohlcv1H => "ohlcv-1h",
            Schema::Ohlcv1D => "ohlcv-1d",
            Schema::OhlcvEod => "ohlcv-eod",
            Schema::Definition => "definition",
            Schema::Statistics => "statistics",
            Schema::Status => "status",
            Schema::Imbalance => "imbalance",
        }
    }
}

impl FromStr for Schema {
    type Err = NativeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Schema::ALL
            .iter()
            .copied()
            .find(|schema| schema.as_str() == s)
            .ok_or_else(|| NativeError::UnknownSchema(s.to_string()))
    }
}

impl fmt::Display for Schema {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Symbology type of subscription symbols.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SType {
    #[default]
    RawSymbol,
    InstrumentId,
    Parent,
    Continuous,
}

impl SType {
    pub fn as_str(&self) -> &'static str {
        match self {
            SType::RawSymbol => "raw_symbol",
            SType::InstrumentId => "instrument_id",
            SType::Parent => "parent",
            SType::Continuous => "continuous",
        }
    }
}

//! Bridge errors and their status codes.
//!
//! Every fallible operation returns `NativeResult<T>`. At the C boundary the
//! error becomes a negative status code and its message is stored as the
//! calling thread's last error.

use thiserror::Error;

use crate::ffi::{
    ERR_BUFFER_TOO_SMALL, ERR_CONNECTION_FAILED, ERR_INVALID_HANDLE, ERR_INVALID_PARAM,
    ERR_INVALID_STATE, ERR_TYPE_MISMATCH, ERR_UNKNOWN, ERR_UNKNOWN_SCHEMA,
};
use crate::ffi_string::set_last_error_message;
use crate::gateway::GatewayError;
use crate::registry::{TypeTag, ValidationError};

/// Everything that can go wrong behind an exported function.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum NativeError {
    // Handle Errors
    #[error("Invalid handle")]
    InvalidHandle,

    #[error("Handle type mismatch: expected {expected}, got {actual}")]
    TypeMismatch { expected: TypeTag, actual: TypeTag },

    // Parameter Errors
    #[error("{name} cannot be NULL")]
    NullPointer { name: String },

    #[error("Invalid parameter '{name}': {reason}")]
    InvalidParameter { name: String, reason: String },

    #[error("Unknown schema: {0}")]
    UnknownSchema(String),

    #[error("Buffer too small: required {required} bytes, capacity {capacity}")]
    BufferTooSmall { required: usize, capacity: usize },

    // Session State Errors
    #[error("Invalid state: {0}")]
    InvalidState(String),

    // Gateway Errors
    #[error("Connection failure: {0}")]
    ConnectionFailure(String),

    // Internal Errors
    #[error("Internal error: {0}")]
    Internal(String),
}

impl NativeError {
    /// Status code returned to the host for this error.
    pub fn to_error_code(&self) -> i32 {
        match self {
            NativeError::InvalidHandle => ERR_INVALID_HANDLE,
            NativeError::TypeMismatch { .. } => ERR_TYPE_MISMATCH,

            // Null and malformed arguments are both parameter errors to the host
            NativeError::NullPointer { .. } => ERR_INVALID_PARAM,
            NativeError::InvalidParameter { .. } => ERR_INVALID_PARAM,
            NativeError::UnknownSchema(_) => ERR_UNKNOWN_SCHEMA,
            NativeError::BufferTooSmall { .. } => ERR_BUFFER_TOO_SMALL,

            NativeError::InvalidState(_) => ERR_INVALID_STATE,
            NativeError::ConnectionFailure(_) => ERR_CONNECTION_FAILED,

            NativeError::Internal(_) => ERR_UNKNOWN,
        }
    }

    /// Record this error as the thread's last error and return its code.
    pub fn set_and_return_code(&self) -> i32 {
        set_last_error(self);
        self.to_error_code()
    }
}

// ----------------------------------------------------------------------------
// Conversions
// ----------------------------------------------------------------------------

impl From<ValidationError> for NativeError {
    fn from(err: ValidationError) -> Self {
        match err {
            ValidationError::InvalidHandle => NativeError::InvalidHandle,
            ValidationError::TypeMismatch { expected, actual } => {
                NativeError::TypeMismatch { expected, actual }
            }
        }
    }
}

impl From<GatewayError> for NativeError {
    fn from(err: GatewayError) -> Self {
        NativeError::ConnectionFailure(err.to_string())
    }
}

impl From<std::str::Utf8Error> for NativeError {
    fn from(err: std::str::Utf8Error) -> Self {
        NativeError::invalid_param("string", err.to_string())
    }
}

impl From<serde_json::Error> for NativeError {
    fn from(err: serde_json::Error) -> Self {
        NativeError::Internal(err.to_string())
    }
}

/// Keep the message for `dbento_get_last_error` on this thread.
pub fn set_last_error(error: &NativeError) {
    set_last_error_message(error.to_string());
}

pub type NativeResult<T> = Result<T, NativeError>;

impl NativeError {
    pub fn null_pointer(name: impl Into<String>) -> Self {
        NativeError::NullPointer { name: name.into() }
    }

    pub fn invalid_param(name: impl Into<String>, reason: impl Into<String>) -> Self {
        NativeError::InvalidParameter {
            name: name.into(),
            reason: reason.into(),
        }
    }

    pub fn invalid_state(reason: impl Into<String>) -> Self {
        NativeError::InvalidState(reason.into())
    }

    pub fn internal(message: impl Into<String>) -> Self {
        NativeError::Internal(message.into())
    }
}

//! Validated handle registry.
//!
//! Every object handed to the host is stored here under an opaque token.
//! The host only ever sees the token; turning it back into an object goes
//! through [`HandleRegistry::validate_and_cast`], which rejects tokens that
//! were never issued, have been destroyed, or were issued for a different
//! object type.
//!
//! Objects are held as `Arc`s, so a lookup that races with `destroy` keeps
//! its object alive until the caller is done with it.

use std::any::Any;
use std::collections::HashMap;
use std::ffi::c_void;
use std::fmt;
use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, PoisonError, RwLock};

use thiserror::Error;

/// Object kinds that can sit behind a handle.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TypeTag {
    LiveClient = 1,
    HistoricalClient = 2,
    Metadata = 3,
    DbnFileReader = 4,
    DbnFileWriter = 5,
    SymbologyResolution = 6,
    UnitPrices = 7,
    TsSymbolMap = 8,
    PitSymbolMap = 9,
}

impl TypeTag {
    pub const ALL: [TypeTag; 9] = [
        TypeTag::LiveClient,
        TypeTag::HistoricalClient,
        TypeTag::Metadata,
        TypeTag::DbnFileReader,
        TypeTag::DbnFileWriter,
        TypeTag::SymbologyResolution,
        TypeTag::UnitPrices,
        TypeTag::TsSymbolMap,
        TypeTag::PitSymbolMap,
    ];
}

impl fmt::Display for TypeTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Opaque token identifying a registered object.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Handle(NonZeroUsize);

impl Handle {
    /// Rebuild a handle from its raw value. Zero is never a handle.
    pub fn from_raw(raw: usize) -> Option<Self> {
        NonZeroUsize::new(raw).map(Handle)
    }

    pub fn as_raw(&self) -> usize {
        self.0.get()
    }

    /// Rebuild a handle from the pointer-shaped value the host passes back.
    pub fn from_ptr(ptr: *const c_void) -> Option<Self> {
        Self::from_raw(ptr as usize)
    }

    /// Pointer-shaped form handed to the host. Never dereferenced.
    pub fn into_ptr(self) -> *mut c_void {
        self.0.get() as *mut c_void
    }
}

/// Reasons a handle fails validation.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum ValidationError {
    #[error("Invalid handle")]
    InvalidHandle,

    #[error("Handle type mismatch: expected {expected}, got {actual}")]
    TypeMismatch { expected: TypeTag, actual: TypeTag },
}

struct Entry {
    tag: TypeTag,
    object: Arc<dyn Any + Send + Sync>,
}

impl Entry {
    fn cast<T: Any + Send + Sync>(&self, expected: TypeTag) -> Result<Arc<T>, ValidationError> {
        if self.tag != expected {
            return Err(ValidationError::TypeMismatch {
                expected,
                actual: self.tag,
            });
        }
        // A tag that matches but a payload that does not is still a mismatch,
        // never a reinterpretation.
        Arc::clone(&self.object)
            .downcast::<T>()
            .map_err(|_| ValidationError::TypeMismatch {
                expected,
                actual: self.tag,
            })
    }
}

/// Table of live handles.
///
/// One instance backs the C ABI; tests and embedders construct their own.
pub struct HandleRegistry {
    next_handle: AtomicUsize,
    entries: RwLock<HashMap<usize, Entry>>,
}

impl HandleRegistry {
    pub fn new() -> Self {
        Self {
            next_handle: AtomicUsize::new(1),
            entries: RwLock::new(HashMap::new()),
        }
    }

    /// Register an object and issue a fresh handle for it.
    pub fn create<T: Any + Send + Sync>(&self, tag: TypeTag, object: Arc<T>) -> Handle {
        let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);
        loop {
            let raw = self.next_handle.fetch_add(1, Ordering::Relaxed);
            // Skip zero and anything still live after a counter wrap
            let Some(handle) = Handle::from_raw(raw) else {
                continue;
            };
            if entries.contains_key(&raw) {
                continue;
            }
            entries.insert(raw, Entry { tag, object });
            return handle;
        }
    }

    /// Resolve a handle to its object, checking both liveness and type.
    pub fn validate_and_cast<T: Any + Send + Sync>(
        &self,
        handle: Handle,
        expected: TypeTag,
    ) -> Result<Arc<T>, ValidationError> {
        let entries = self.entries.read().unwrap_or_else(PoisonError::into_inner);
        entries
            .get(&handle.as_raw())
            .ok_or(ValidationError::InvalidHandle)?
            .cast(expected)
    }

    /// Validate a handle and remove it in one step.
    ///
    /// Of two racing callers at most one gets the object back.
    pub fn take<T: Any + Send + Sync>(
        &self,
        handle: Handle,
        expected: TypeTag,
    ) -> Result<Arc<T>, ValidationError> {
        let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);
        let object = entries
            .get(&handle.as_raw())
            .ok_or(ValidationError::InvalidHandle)?
            .cast(expected)?;
        entries.remove(&handle.as_raw());
        Ok(object)
    }

    /// Forget a handle. Returns `false` if it was not live.
    pub fn destroy(&self, handle: Handle) -> bool {
        // The removed object is dropped after the lock is released
        let removed = {
            let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);
            entries.remove(&handle.as_raw())
        };
        removed.is_some()
    }

    pub fn contains(&self, handle: Handle) -> bool {
        let entries = self.entries.read().unwrap_or_else(PoisonError::into_inner);
        entries.contains_key(&handle.as_raw())
    }

    pub fn tag_of(&self, handle: Handle) -> Option<TypeTag> {
        let entries = self.entries.read().unwrap_or_else(PoisonError::into_inner);
        entries.get(&handle.as_raw()).map(|entry| entry.tag)
    }

    pub fn len(&self) -> usize {
        self.entries.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for HandleRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for HandleRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HandleRegistry").field("live", &self.len()).finish()
    }
}

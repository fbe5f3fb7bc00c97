//! Live session lifecycle and callback bridge.
//!
//! A `LiveSession` owns a lazily built gateway and a `Bridge`. The bridge is
//! what the gateway's run-loop thread calls into: it holds the host's
//! callback pointers behind a delivery lock and a running flag.
//!
//! # Delivery contract
//! - Every callback invocation happens with the delivery lock held
//! - The running flag is checked under the lock before each invocation
//! - Stop clears the flag without the lock; destroy clears it and then takes
//!   the lock, so it returns only after an in-flight delivery has finished
//! - A panic unwinding out of a host callback is caught, reported through
//!   the error callback and stops delivery

use std::any::Any;
use std::cell::Cell;
use std::ffi::c_void;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use crate::error::{NativeError, NativeResult};
use crate::ffi::{
    ERR_CALLBACK_PANIC, ERR_CALLBACK_UNKNOWN, ERR_CONNECTION_FAILED, ERR_METADATA_PANIC,
    ERR_METADATA_UNKNOWN,
};
use crate::ffi_string::to_c_message;
use crate::gateway::{
    ExceptionHandler, GatewayConfig, GatewayError, GatewayFactory, KeepGoing, LiveGateway,
    MetadataHandler, Record, RecordHandler, SessionHandlers, SessionMetadata,
};
use crate::logger::Logger;
use crate::types::{ConnectionState, ErrorCallback, MetadataCallback, RecordCallback, SType, Schema};

// ============================================================================
// Callbacks
// ============================================================================

/// Opaque host context pointer, passed back verbatim.
#[derive(Debug, Clone, Copy)]
struct UserContext(*mut c_void);

// SAFETY: the pointer is never dereferenced on this side; the host owns
// whatever it points to and is responsible for its thread safety.
unsafe impl Send for UserContext {}
unsafe impl Sync for UserContext {}

impl Default for UserContext {
    fn default() -> Self {
        Self(std::ptr::null_mut())
    }
}

/// Callback set supplied to [`LiveSession::start`].
#[derive(Debug, Clone, Copy)]
pub struct SessionCallbacks {
    pub on_record: RecordCallback,
    pub on_metadata: MetadataCallback,
    pub on_error: ErrorCallback,
    pub user_data: *mut c_void,
}

impl Default for SessionCallbacks {
    fn default() -> Self {
        Self {
            on_record: None,
            on_metadata: None,
            on_error: None,
            user_data: std::ptr::null_mut(),
        }
    }
}

#[derive(Debug, Default)]
struct Callbacks {
    on_record: RecordCallback,
    on_metadata: MetadataCallback,
    on_error: ErrorCallback,
    user_data: UserContext,
}

impl From<SessionCallbacks> for Callbacks {
    fn from(cb: SessionCallbacks) -> Self {
        Self {
            on_record: cb.on_record,
            on_metadata: cb.on_metadata,
            on_error: cb.on_error,
            user_data: UserContext(cb.user_data),
        }
    }
}

impl Callbacks {
    /// Report an error to the host. Dropped when no error callback is set.
    fn notify_error(&self, message: &str, code: i32) {
        let Some(on_error) = self.on_error else {
            return;
        };
        let message = to_c_message(message);
        let ctx = self.user_data.0;
        // A panicking error callback has nowhere left to report to
        let _ = catch_unwind(AssertUnwindSafe(|| unsafe {
            on_error(message.as_ptr(), code, ctx)
        }));
    }
}

// ============================================================================
// Bridge
// ============================================================================

thread_local! {
    /// Address of the bridge currently delivering on this thread, or 0.
    static IN_DELIVERY: Cell<usize> = const { Cell::new(0) };
}

struct DeliveryGuard {
    previous: usize,
}

impl DeliveryGuard {
    fn enter(bridge: &Bridge) -> Self {
        let previous = IN_DELIVERY.with(|cell| cell.replace(bridge as *const Bridge as usize));
        Self { previous }
    }
}

impl Drop for DeliveryGuard {
    fn drop(&mut self) {
        IN_DELIVERY.with(|cell| cell.set(self.previous));
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> Option<String> {
    if let Some(s) = payload.downcast_ref::<&str>() {
        Some((*s).to_string())
    } else {
        payload.downcast_ref::<String>().cloned()
    }
}

/// Hand-off point between a gateway run loop and the host's callbacks.
pub(crate) struct Bridge {
    running: AtomicBool,
    delivery: Mutex<Callbacks>,
    logger: Logger,
}

impl Bridge {
    fn new(logger: Logger) -> Self {
        Self {
            running: AtomicBool::new(false),
            delivery: Mutex::new(Callbacks::default()),
            logger,
        }
    }

    fn lock(&self) -> MutexGuard<'_, Callbacks> {
        self.delivery.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    fn set_running(&self, running: bool) {
        self.running.store(running, Ordering::Release);
    }

    /// True when called from inside one of this bridge's callbacks.
    fn in_delivery(&self) -> bool {
        IN_DELIVERY.with(|cell| cell.get() == self as *const Bridge as usize)
    }

    fn keep_going(&self) -> KeepGoing {
        if self.is_running() {
            KeepGoing::Continue
        } else {
            KeepGoing::Stop
        }
    }

    fn deliver_record(&self, record: &Record) -> KeepGoing {
        let callbacks = self.lock();
        let _guard = DeliveryGuard::enter(self);
        if !self.is_running() {
            return KeepGoing::Stop;
        }
        let Some(on_record) = callbacks.on_record else {
            return KeepGoing::Stop;
        };

        let bytes = record.as_bytes();
        let ctx = callbacks.user_data.0;
        let outcome = catch_unwind(AssertUnwindSafe(|| unsafe {
            on_record(bytes.as_ptr(), bytes.len(), record.rtype(), ctx)
        }));

        if let Err(payload) = outcome {
            self.set_running(false);
            let (code, message) = match panic_message(payload.as_ref()) {
                Some(msg) => (ERR_CALLBACK_PANIC, format!("Record callback panicked: {}", msg)),
                None => (
                    ERR_CALLBACK_UNKNOWN,
                    "Record callback panicked with a non-string payload".to_string(),
                ),
            };
            self.logger.log_callback_panic(code, &message);
            callbacks.notify_error(&message, code);
        }

        self.keep_going()
    }

    fn deliver_metadata(&self, metadata: &SessionMetadata) {
        let callbacks = self.lock();
        let _guard = DeliveryGuard::enter(self);
        if !self.is_running() {
            return;
        }
        let Some(on_metadata) = callbacks.on_metadata else {
            return;
        };

        let json = match serde_json::to_string(metadata) {
            Ok(json) => json,
            Err(e) => {
                let err = NativeError::from(e);
                callbacks.notify_error(&err.to_string(), err.to_error_code());
                return;
            }
        };
        let message = to_c_message(&json);
        let len = message.as_bytes().len();
        let ctx = callbacks.user_data.0;
        let outcome = catch_unwind(AssertUnwindSafe(|| unsafe {
            on_metadata(message.as_ptr(), len, ctx)
        }));

        if let Err(payload) = outcome {
            self.set_running(false);
            let (code, message) = match panic_message(payload.as_ref()) {
                Some(msg) => (ERR_METADATA_PANIC, format!("Metadata callback panicked: {}", msg)),
                None => (
                    ERR_METADATA_UNKNOWN,
                    "Metadata callback panicked with a non-string payload".to_string(),
                ),
            };
            self.logger.log_callback_panic(code, &message);
            callbacks.notify_error(&message, code);
        }
    }

    fn deliver_error(&self, error: &GatewayError) {
        let callbacks = self.lock();
        let _guard = DeliveryGuard::enter(self);
        if self.is_running() {
            callbacks.notify_error(&error.to_string(), ERR_CONNECTION_FAILED);
        }
    }

    fn handlers(self: &Arc<Self>, with_metadata: bool) -> SessionHandlers {
        let on_record = {
            let bridge = Arc::clone(self);
            Box::new(move |record: &Record| bridge.deliver_record(record)) as RecordHandler
        };
        let on_metadata = with_metadata.then(|| {
            let bridge = Arc::clone(self);
            Box::new(move |metadata: &SessionMetadata| bridge.deliver_metadata(metadata)) as MetadataHandler
        });
        let on_error = {
            let bridge = Arc::clone(self);
            Box::new(move |error: &GatewayError| bridge.deliver_error(error)) as ExceptionHandler
        };
        SessionHandlers {
            on_metadata,
            on_record,
            on_error: Some(on_error),
        }
    }
}

// ============================================================================
// Live Session
// ============================================================================

/// Lifecycle phase of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionPhase {
    Created,
    Subscribed,
    Streaming,
    Stopped,
    Destroyed,
}

/// One live market-data session.
pub struct LiveSession {
    config: GatewayConfig,
    factory: Arc<dyn GatewayFactory>,
    gateway: Mutex<Option<Arc<dyn LiveGateway>>>,
    bridge: Arc<Bridge>,
    started: AtomicBool,
    destroyed: AtomicBool,
}

impl LiveSession {
    pub fn new(mut config: GatewayConfig, factory: Arc<dyn GatewayFactory>) -> NativeResult<Self> {
        if config.api_key.is_empty() {
            return Err(NativeError::invalid_param("api_key", "cannot be empty"));
        }
        if config.dataset.as_deref() == Some("") {
            config.dataset = None;
        }

        let logger = Logger::new("LiveSession").with_correlation_id(Logger::new_correlation_id());
        Ok(Self {
            config,
            factory,
            gateway: Mutex::new(None),
            bridge: Arc::new(Bridge::new(logger)),
            started: AtomicBool::new(false),
            destroyed: AtomicBool::new(false),
        })
    }

    pub fn logger(&self) -> &Logger {
        &self.bridge.logger
    }

    /// Dataset the session is bound to, if any yet.
    pub fn dataset(&self) -> Option<String> {
        match self.current_gateway() {
            Some(gateway) => Some(gateway.dataset().to_string()),
            None => self.config.dataset.clone(),
        }
    }

    fn dataset_label(&self) -> String {
        self.dataset().unwrap_or_else(|| "<unbound>".to_string())
    }

    fn current_gateway(&self) -> Option<Arc<dyn LiveGateway>> {
        self.gateway
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn require_gateway(&self) -> NativeResult<Arc<dyn LiveGateway>> {
        self.current_gateway()
            .ok_or_else(|| NativeError::invalid_state("subscribe must be called first"))
    }

    fn ensure_alive(&self) -> NativeResult<()> {
        if self.destroyed.load(Ordering::Acquire) {
            Err(NativeError::invalid_state("session has been destroyed"))
        } else {
            Ok(())
        }
    }

    fn ensure_not_delivering(&self, operation: &str) -> NativeResult<()> {
        if self.bridge.in_delivery() {
            Err(NativeError::invalid_state(format!(
                "{} cannot be called from a session callback",
                operation
            )))
        } else {
            Ok(())
        }
    }

    /// Get the gateway, building it on first use.
    ///
    /// The slot lock is held across the build, so concurrent callers see
    /// exactly one gateway.
    fn gateway_for(&self, requested: Option<&str>) -> NativeResult<Arc<dyn LiveGateway>> {
        let mut slot = self.gateway.lock().unwrap_or_else(PoisonError::into_inner);

        let bound = slot
            .as_ref()
            .map(|gateway| gateway.dataset().to_string())
            .or_else(|| self.config.dataset.clone());
        let dataset = match (requested, bound.as_deref()) {
            (Some(req), Some(bound)) if req != bound => {
                return Err(NativeError::invalid_param(
                    "dataset",
                    format!("session is bound to {}, got {}", bound, req),
                ));
            }
            (Some(req), _) => req.to_string(),
            (None, Some(bound)) => bound.to_string(),
            (None, None) => return Err(NativeError::invalid_param("dataset", "is required")),
        };

        if let Some(gateway) = slot.as_ref() {
            return Ok(Arc::clone(gateway));
        }
        let gateway = self.factory.build(&self.config.clone().with_dataset(dataset))?;
        *slot = Some(Arc::clone(&gateway));
        Ok(gateway)
    }

    fn add_subscription(
        &self,
        dataset: Option<&str>,
        schema: &str,
        symbols: &[String],
        snapshot: bool,
    ) -> NativeResult<()> {
        self.ensure_alive()?;
        let schema: Schema = schema.parse()?;
        let gateway = self.gateway_for(dataset)?;
        if snapshot {
            gateway.subscribe_with_snapshot(symbols, schema, SType::RawSymbol)?;
        } else {
            gateway.subscribe(symbols, schema, SType::RawSymbol)?;
        }
        self.logger()
            .log_subscribed(gateway.dataset(), schema.as_str(), symbols.len(), snapshot);
        Ok(())
    }

    /// Subscribe to `symbols` under `schema`. An empty symbol list means all symbols.
    ///
    /// The first subscribe binds the dataset; `None` uses the dataset given at creation.
    pub fn subscribe(&self, dataset: Option<&str>, schema: &str, symbols: &[String]) -> NativeResult<()> {
        self.add_subscription(dataset, schema, symbols, false)
    }

    /// Like [`subscribe`](Self::subscribe), requesting an initial snapshot.
    pub fn subscribe_with_snapshot(
        &self,
        dataset: Option<&str>,
        schema: &str,
        symbols: &[String],
    ) -> NativeResult<()> {
        self.add_subscription(dataset, schema, symbols, true)
    }

    /// Install callbacks and start delivery. Does not block.
    pub fn start(&self, callbacks: SessionCallbacks) -> NativeResult<()> {
        self.ensure_alive()?;
        if callbacks.on_record.is_none() {
            return Err(NativeError::null_pointer("record_callback"));
        }
        self.ensure_not_delivering("start")?;
        let gateway = self.require_gateway()?;
        if self.bridge.is_running() {
            return Err(NativeError::invalid_state("session is already streaming"));
        }

        *self.bridge.lock() = Callbacks::from(callbacks);
        self.arm(gateway.as_ref())
    }

    fn arm(&self, gateway: &dyn LiveGateway) -> NativeResult<()> {
        let with_metadata = self.bridge.lock().on_metadata.is_some();
        self.bridge.set_running(true);
        if let Err(e) = gateway.start(self.bridge.handlers(with_metadata)) {
            self.bridge.set_running(false);
            return Err(e.into());
        }
        self.started.store(true, Ordering::Release);
        self.logger().log_streaming_started(gateway.dataset(), with_metadata);
        Ok(())
    }

    /// Restart delivery with the registered callbacks, if there are any.
    fn rearm(&self, gateway: &dyn LiveGateway) -> NativeResult<bool> {
        if self.bridge.lock().on_record.is_none() {
            return Ok(false);
        }
        self.arm(gateway)?;
        Ok(true)
    }

    /// Stop delivering records. The run loop exits on its next event.
    pub fn stop(&self) -> NativeResult<()> {
        self.ensure_alive()?;
        self.bridge.set_running(false);
        self.logger().log_session_stopped(&self.dataset_label());
        Ok(())
    }

    /// Reconnect the gateway and resume delivery with the same callbacks.
    pub fn reconnect(&self) -> NativeResult<()> {
        self.ensure_alive()?;
        self.ensure_not_delivering("reconnect")?;
        let gateway = self.require_gateway()?;

        self.bridge.set_running(false);
        gateway.reconnect()?;
        let restarted = self.rearm(gateway.as_ref())?;
        self.logger().log_rearm(gateway.dataset(), "reconnect", restarted);
        Ok(())
    }

    /// Replay subscriptions and resume delivery if it was stopped.
    pub fn resubscribe(&self) -> NativeResult<()> {
        self.ensure_alive()?;
        self.ensure_not_delivering("resubscribe")?;
        let gateway = self.require_gateway()?;

        gateway.resubscribe()?;
        let restarted = if self.bridge.is_running() {
            false
        } else {
            self.rearm(gateway.as_ref())?
        };
        self.logger().log_rearm(gateway.dataset(), "resubscribe", restarted);
        Ok(())
    }

    /// Tear the session down. Idempotent and infallible.
    ///
    /// Returns once no delivery is in progress, except when called from
    /// inside one of this session's callbacks, where the current delivery
    /// finishes after return and nothing further is delivered.
    pub fn destroy(&self) {
        if self.destroyed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.bridge.set_running(false);
        if !self.bridge.in_delivery() {
            *self.bridge.lock() = Callbacks::default();
        }

        let dataset = self.dataset_label();
        let gateway = self
            .gateway
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(gateway) = gateway {
            if let Err(e) = gateway.shutdown() {
                self.logger().log_teardown_failure(&dataset, &e.to_string());
            }
        }
        self.logger().log_session_destroyed(&dataset);
    }

    pub fn is_destroyed(&self) -> bool {
        self.destroyed.load(Ordering::Acquire)
    }

    pub fn connection_state(&self) -> ConnectionState {
        if self.is_destroyed() || self.current_gateway().is_none() {
            ConnectionState::Disconnected
        } else if self.bridge.is_running() {
            ConnectionState::Streaming
        } else {
            ConnectionState::Connected
        }
    }

    pub fn phase(&self) -> SessionPhase {
        if self.is_destroyed() {
            SessionPhase::Destroyed
        } else if self.current_gateway().is_none() {
            SessionPhase::Created
        } else if self.bridge.is_running() {
            SessionPhase::Streaming
        } else if self.started.load(Ordering::Acquire) {
            SessionPhase::Stopped
        } else {
            SessionPhase::Subscribed
        }
    }
}

impl Drop for LiveSession {
    fn drop(&mut self) {
        self.destroy();
    }
}

impl std::fmt::Debug for LiveSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LiveSession")
            .field("dataset", &self.dataset())
            .field("phase", &self.phase())
            .finish()
    }
}

// ============================================================================
// Tests
// ============================================================================

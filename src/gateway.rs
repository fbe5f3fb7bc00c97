//! Gateway abstraction layer for live market data.
//!
//! The live gateway is the streaming engine a session drives: it accepts
//! subscriptions, runs its own record loop on a background thread and hands
//! each record to a handler that decides whether the loop keeps going.
//! The `LiveGateway` trait is the seam; `ReplayGateway` is the in-process
//! implementation fed through a channel.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam_channel::{bounded, select, unbounded, Receiver, Sender};
use serde::Serialize;
use thiserror::Error;

use crate::types::{SType, Schema, UpgradePolicy};

/// Size of the fixed record header in bytes.
pub const RECORD_HEADER_LEN: usize = 16;

/// Largest record the one-byte length field can describe.
pub const MAX_RECORD_LEN: usize = u8::MAX as usize * RECORD_LENGTH_MULTIPLIER;

/// The header length byte counts 4-byte words.
pub const RECORD_LENGTH_MULTIPLIER: usize = 4;

/// DBN version reported in session metadata.
pub const DBN_VERSION: u8 = 3;

/// Heartbeat interval used when none is configured.
pub const DEFAULT_HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);

// ============================================================================
// Records
// ============================================================================

/// A single record: header followed by payload, contiguous.
///
/// Header layout: length in words (u8), rtype (u8), publisher id (u16),
/// instrument id (u32), event timestamp (u64), all little-endian.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Record {
    bytes: Vec<u8>,
}

impl Record {
    /// Wrap raw record bytes after checking the header is self-consistent.
    pub fn from_bytes(bytes: Vec<u8>) -> Result<Self, GatewayError> {
        if bytes.len() < RECORD_HEADER_LEN {
            return Err(GatewayError::InvalidRecord(format!(
                "record of {} bytes is shorter than its header",
                bytes.len()
            )));
        }
        let declared = bytes[0] as usize * RECORD_LENGTH_MULTIPLIER;
        if declared != bytes.len() {
            return Err(GatewayError::InvalidRecord(format!(
                "header declares {} bytes, got {}",
                declared,
                bytes.len()
            )));
        }
        Ok(Self { bytes })
    }

    /// Build a record from header fields and a payload.
    ///
    /// The payload is zero-padded to a whole number of words.
    pub fn build(
        rtype: u8,
        publisher_id: u16,
        instrument_id: u32,
        ts_event: u64,
        payload: &[u8],
    ) -> Result<Self, GatewayError> {
        let unpadded = RECORD_HEADER_LEN + payload.len();
        let total = unpadded.div_ceil(RECORD_LENGTH_MULTIPLIER) * RECORD_LENGTH_MULTIPLIER;
        if total > MAX_RECORD_LEN {
            return Err(GatewayError::InvalidRecord(format!(
                "record of {} bytes exceeds {} byte limit",
                total, MAX_RECORD_LEN
            )));
        }

        let mut bytes = Vec::with_capacity(total);
        bytes.push((total / RECORD_LENGTH_MULTIPLIER) as u8);
        bytes.push(rtype);
        bytes.extend_from_slice(&publisher_id.to_le_bytes());
        bytes.extend_from_slice(&instrument_id.to_le_bytes());
        bytes.extend_from_slice(&ts_event.to_le_bytes());
        bytes.extend_from_slice(payload);
        bytes.resize(total, 0);
        Self::from_bytes(bytes)
    }

    pub fn rtype(&self) -> u8 {
        self.bytes[1]
    }

    pub fn size(&self) -> usize {
        self.bytes.len()
    }

    pub fn instrument_id(&self) -> u32 {
        u32::from_le_bytes([self.bytes[4], self.bytes[5], self.bytes[6], self.bytes[7]])
    }

    pub fn ts_event(&self) -> u64 {
        let mut raw = [0u8; 8];
        raw.copy_from_slice(&self.bytes[8..16]);
        u64::from_le_bytes(raw)
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }
}

/// Returned by record handlers to steer the run loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeepGoing {
    Continue,
    Stop,
}

// ============================================================================
// Errors
// ============================================================================

/// Gateway error types.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum GatewayError {
    #[error("Gateway not connected")]
    NotConnected,

    #[error("Invalid gateway configuration: {0}")]
    InvalidConfig(String),

    #[error("No subscriptions to start or replay")]
    NoSubscriptions,

    #[error("Invalid record: {0}")]
    InvalidRecord(String),

    #[error("Stream error: {0}")]
    Stream(String),

    #[error("Failed to spawn run loop: {0}")]
    ThreadSpawn(String),

    #[error("Gateway error: {0}")]
    Other(String),
}

// ============================================================================
// Configuration & Metadata
// ============================================================================

/// Settings a gateway is built from.
#[derive(Debug, Clone, PartialEq)]
pub struct GatewayConfig {
    pub api_key: String,
    pub dataset: Option<String>,
    pub send_ts_out: bool,
    pub upgrade_policy: UpgradePolicy,
    pub heartbeat_interval: Duration,
}

impl GatewayConfig {
    pub fn new(api_key: impl Into<String>) -> Self {
        Self {
            api_key: api_key.into(),
            ..Self::default()
        }
    }

    pub fn with_dataset(mut self, dataset: impl Into<String>) -> Self {
        self.dataset = Some(dataset.into());
        self
    }

    /// Set the heartbeat interval in seconds. Non-positive values keep the default.
    pub fn with_heartbeat_secs(mut self, secs: i32) -> Self {
        self.heartbeat_interval = if secs > 0 {
            Duration::from_secs(secs as u64)
        } else {
            DEFAULT_HEARTBEAT_INTERVAL
        };
        self
    }
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            api_key: String::new(),
            dataset: None,
            send_ts_out: false,
            upgrade_policy: UpgradePolicy::UpgradeToV3,
            heartbeat_interval: DEFAULT_HEARTBEAT_INTERVAL,
        }
    }
}

/// One subscription request as tracked by a gateway.
#[derive(Debug, Clone, PartialEq)]
pub struct Subscription {
    pub symbols: Vec<String>,
    pub schema: Schema,
    pub stype: SType,
    pub snapshot: bool,
}

/// Session metadata emitted when a run loop starts.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SessionMetadata {
    pub version: u8,
    pub dataset: String,
    pub schema: Option<String>,
    pub stype_in: Option<String>,
    pub stype_out: String,
    pub start: i64,
    pub ts_out: bool,
    pub symbols: Vec<String>,
}

impl SessionMetadata {
    /// Describe a session from its configuration and subscriptions.
    ///
    /// `schema` and `stype_in` are only set when every subscription agrees.
    pub fn describe(dataset: &str, config: &GatewayConfig, subscriptions: &[Subscription]) -> Self {
        let schema = common(subscriptions.iter().map(|s| s.schema)).map(|s| s.as_str().to_string());
        let stype_in = common(subscriptions.iter().map(|s| s.stype)).map(|s| s.as_str().to_string());
        let mut symbols: Vec<String> = subscriptions
            .iter()
            .flat_map(|s| s.symbols.iter().cloned())
            .collect();
        symbols.sort();
        symbols.dedup();

        Self {
            version: DBN_VERSION,
            dataset: dataset.to_string(),
            schema,
            stype_in,
            stype_out: SType::InstrumentId.as_str().to_string(),
            start: chrono::Utc::now().timestamp_nanos_opt().unwrap_or_default(),
            ts_out: config.send_ts_out,
            symbols,
        }
    }
}

fn common<T: PartialEq>(mut values: impl Iterator<Item = T>) -> Option<T> {
    let first = values.next()?;
    values.all(|v| v == first).then_some(first)
}

// ============================================================================
// Gateway Trait
// ============================================================================

/// Handler invoked once per record on the run-loop thread.
pub type RecordHandler = Box<dyn FnMut(&Record) -> KeepGoing + Send>;
/// Handler invoked with session metadata before the first record.
pub type MetadataHandler = Box<dyn FnMut(&SessionMetadata) + Send>;
/// Handler invoked for errors raised inside the run loop.
pub type ExceptionHandler = Box<dyn FnMut(&GatewayError) + Send>;

/// Handlers a session hands to `LiveGateway::start`.
pub struct SessionHandlers {
    pub on_metadata: Option<MetadataHandler>,
    pub on_record: RecordHandler,
    pub on_error: Option<ExceptionHandler>,
}

/// Streaming engine driven by a live session.
///
/// Methods take `&self`: a gateway is shared between the control thread
/// and its own run-loop thread and synchronizes internally.
pub trait LiveGateway: Send + Sync {
    /// Dataset the gateway is bound to.
    fn dataset(&self) -> &str;

    /// Add a subscription.
    fn subscribe(&self, symbols: &[String], schema: Schema, stype: SType) -> Result<(), GatewayError>;

    /// Add a subscription that first replays a snapshot of current state.
    fn subscribe_with_snapshot(
        &self,
        symbols: &[String],
        schema: Schema,
        stype: SType,
    ) -> Result<(), GatewayError>;

    /// Start the run loop on a gateway-owned thread. Does not block.
    fn start(&self, handlers: SessionHandlers) -> Result<(), GatewayError>;

    /// Drop the current session and establish a new one.
    fn reconnect(&self) -> Result<(), GatewayError>;

    /// Replay every tracked subscription on the current session.
    fn resubscribe(&self) -> Result<(), GatewayError>;

    /// Stop the run loop and disconnect.
    fn shutdown(&self) -> Result<(), GatewayError>;
}

/// Builds gateways once a session knows its dataset.
pub trait GatewayFactory: Send + Sync {
    fn build(&self, config: &GatewayConfig) -> Result<Arc<dyn LiveGateway>, GatewayError>;
}

// ============================================================================
// Replay Gateway
// ============================================================================

enum FeedEvent {
    Record(Record),
    Error(String),
}

/// Producer side of a replay gateway.
#[derive(Clone)]
pub struct ReplayFeed {
    tx: Sender<FeedEvent>,
}

impl ReplayFeed {
    /// Queue a record for the run loop.
    pub fn push_record(&self, record: Record) -> Result<(), GatewayError> {
        self.tx
            .send(FeedEvent::Record(record))
            .map_err(|_| GatewayError::NotConnected)
    }

    /// Queue a stream error for the run loop.
    pub fn push_error(&self, message: impl Into<String>) -> Result<(), GatewayError> {
        self.tx
            .send(FeedEvent::Error(message.into()))
            .map_err(|_| GatewayError::NotConnected)
    }

    /// Events queued but not yet taken by the run loop.
    pub fn pending(&self) -> usize {
        self.tx.len()
    }
}

/// Feeds of live replay gateways, keyed by dataset.
type FeedDirectory = Arc<Mutex<HashMap<String, ReplayFeed>>>;

struct Worker {
    stop_tx: Sender<()>,
    handle: JoinHandle<()>,
}

/// Gateway whose records come from a [`ReplayFeed`].
///
/// At most one run loop exists at a time; starting again joins the previous
/// one first, so records leave the feed in order through a single consumer.
pub struct ReplayGateway {
    config: GatewayConfig,
    dataset: String,
    feed_tx: Sender<FeedEvent>,
    feed_rx: Receiver<FeedEvent>,
    subscriptions: Mutex<Vec<Subscription>>,
    worker: Mutex<Option<Worker>>,
    connected: AtomicBool,
    directory: Option<FeedDirectory>,
}

impl ReplayGateway {
    pub fn new(config: GatewayConfig) -> Result<Self, GatewayError> {
        if config.api_key.is_empty() {
            return Err(GatewayError::InvalidConfig("api key cannot be empty".into()));
        }
        let dataset = match config.dataset.as_deref() {
            Some(ds) if !ds.is_empty() => ds.to_string(),
            _ => return Err(GatewayError::InvalidConfig("dataset is required".into())),
        };
        let (feed_tx, feed_rx) = unbounded();
        Ok(Self {
            config,
            dataset,
            feed_tx,
            feed_rx,
            subscriptions: Mutex::new(Vec::new()),
            worker: Mutex::new(None),
            connected: AtomicBool::new(true),
            directory: None,
        })
    }

    /// Publish this gateway's feed in `directory` until shutdown.
    fn listed_in(mut self, directory: &FeedDirectory) -> Self {
        directory
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(self.dataset.clone(), self.feed());
        self.directory = Some(Arc::clone(directory));
        self
    }

    /// Remove this gateway's feed from its directory, if it is still the listed one.
    fn unlist(&self) {
        let Some(directory) = &self.directory else {
            return;
        };
        let mut feeds = directory.lock().unwrap_or_else(PoisonError::into_inner);
        if feeds
            .get(&self.dataset)
            .is_some_and(|feed| feed.tx.same_channel(&self.feed_tx))
        {
            feeds.remove(&self.dataset);
        }
    }

    pub fn feed(&self) -> ReplayFeed {
        ReplayFeed {
            tx: self.feed_tx.clone(),
        }
    }

    pub fn subscriptions(&self) -> Vec<Subscription> {
        self.subscriptions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn is_running(&self) -> bool {
        self.worker
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .is_some_and(|w| !w.handle.is_finished())
    }

    fn ensure_connected(&self) -> Result<(), GatewayError> {
        if self.connected.load(Ordering::Acquire) {
            Ok(())
        } else {
            Err(GatewayError::NotConnected)
        }
    }

    fn add_subscription(
        &self,
        symbols: &[String],
        schema: Schema,
        stype: SType,
        snapshot: bool,
    ) -> Result<(), GatewayError> {
        self.ensure_connected()?;
        self.subscriptions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(Subscription {
                symbols: symbols.to_vec(),
                schema,
                stype,
                snapshot,
            });
        Ok(())
    }

    /// Signal the current run loop and wait for it to exit.
    ///
    /// Called from the run-loop thread itself, the loop is only signalled.
    fn stop_worker(&self) -> Result<(), GatewayError> {
        let worker = self
            .worker
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        let Some(worker) = worker else {
            return Ok(());
        };

        let _ = worker.stop_tx.try_send(());
        if worker.handle.thread().id() == thread::current().id() {
            return Ok(());
        }
        worker
            .handle
            .join()
            .map_err(|_| GatewayError::Other("run loop panicked".into()))
    }
}

impl LiveGateway for ReplayGateway {
    fn dataset(&self) -> &str {
        &self.dataset
    }

    fn subscribe(&self, symbols: &[String], schema: Schema, stype: SType) -> Result<(), GatewayError> {
        self.add_subscription(symbols, schema, stype, false)
    }

    fn subscribe_with_snapshot(
        &self,
        symbols: &[String],
        schema: Schema,
        stype: SType,
    ) -> Result<(), GatewayError> {
        self.add_subscription(symbols, schema, stype, true)
    }

    fn start(&self, handlers: SessionHandlers) -> Result<(), GatewayError> {
        self.ensure_connected()?;
        let subscriptions = self.subscriptions();
        if subscriptions.is_empty() {
            return Err(GatewayError::NoSubscriptions);
        }
        self.stop_worker()?;

        let metadata = SessionMetadata::describe(&self.dataset, &self.config, &subscriptions);
        let feed_rx = self.feed_rx.clone();
        let (stop_tx, stop_rx) = bounded(1);
        let heartbeat = self.config.heartbeat_interval;
        let dataset = self.dataset.clone();

        let handle = thread::Builder::new()
            .name(format!("dbento-live-{}", self.dataset))
            .spawn(move || run_loop(dataset, feed_rx, stop_rx, metadata, handlers, heartbeat))
            .map_err(|e| GatewayError::ThreadSpawn(e.to_string()))?;

        *self.worker.lock().unwrap_or_else(PoisonError::into_inner) = Some(Worker { stop_tx, handle });
        Ok(())
    }

    fn reconnect(&self) -> Result<(), GatewayError> {
        self.stop_worker()?;
        self.connected.store(true, Ordering::Release);
        crate::log_info!("RECONNECTED: dataset={}", self.dataset);
        Ok(())
    }

    fn resubscribe(&self) -> Result<(), GatewayError> {
        self.ensure_connected()?;
        let count = self
            .subscriptions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len();
        if count == 0 {
            return Err(GatewayError::NoSubscriptions);
        }
        crate::log_debug!("RESUBSCRIBED: dataset={}, subscriptions={}", self.dataset, count);
        Ok(())
    }

    fn shutdown(&self) -> Result<(), GatewayError> {
        self.connected.store(false, Ordering::Release);
        self.unlist();
        self.stop_worker()
    }
}

impl Drop for ReplayGateway {
    fn drop(&mut self) {
        let _ = self.shutdown();
    }
}

fn run_loop(
    dataset: String,
    feed_rx: Receiver<FeedEvent>,
    stop_rx: Receiver<()>,
    metadata: SessionMetadata,
    mut handlers: SessionHandlers,
    heartbeat: Duration,
) {
    if let Some(on_metadata) = handlers.on_metadata.as_mut() {
        on_metadata(&metadata);
    }

    loop {
        select! {
            recv(stop_rx) -> _ => break,
            recv(feed_rx) -> event => match event {
                Ok(FeedEvent::Record(record)) => {
                    if (handlers.on_record)(&record) == KeepGoing::Stop {
                        break;
                    }
                }
                Ok(FeedEvent::Error(message)) => {
                    if let Some(on_error) = handlers.on_error.as_mut() {
                        on_error(&GatewayError::Stream(message));
                    }
                }
                Err(_) => break,
            },
            default(heartbeat) => {
                crate::log_debug!("HEARTBEAT_GAP: dataset={}, idle_secs={}", dataset, heartbeat.as_secs());
            }
        }
    }

    crate::log_debug!("RUN_LOOP_EXIT: dataset={}", dataset);
}

/// Factory producing [`ReplayGateway`]s.
///
/// Keeps the feed of the most recent live gateway built for each dataset so
/// the producer side can be reached after the session has built it. A
/// gateway's feed is dropped from the factory when that gateway shuts down.
#[derive(Default)]
pub struct ReplayGatewayFactory {
    feeds: FeedDirectory,
}

impl ReplayGatewayFactory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed of the latest gateway built for `dataset`.
    pub fn feed(&self, dataset: &str) -> Option<ReplayFeed> {
        self.feeds
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(dataset)
            .cloned()
    }
}

impl GatewayFactory for ReplayGatewayFactory {
    fn build(&self, config: &GatewayConfig) -> Result<Arc<dyn LiveGateway>, GatewayError> {
        let gateway = ReplayGateway::new(config.clone())?.listed_in(&self.feeds);
        Ok(Arc::new(gateway))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::time::Instant;

    fn config() -> GatewayConfig {
        GatewayConfig::new("db-test-key").with_dataset("GLBX.MDP3")
    }

    fn wait_until(mut done: impl FnMut() -> bool) -> bool {
        let deadline = Instant::now() + Duration::from_secs(5);
        while Instant::now() < deadline {
            if done() {
                return true;
            }
            thread::sleep(Duration::from_millis(1));
        }
        false
    }

    #[test]
    fn test_record_build_and_accessors() {
        let record = Record::build(0x00, 1, 4242, 1_700_000_000_000_000_000, &[1, 2, 3]).unwrap();
        assert_eq!(record.size(), 20);
        assert_eq!(record.as_bytes()[0] as usize * 4, record.size());
        assert_eq!(record.rtype(), 0x00);
        assert_eq!(record.instrument_id(), 4242);
        assert_eq!(record.ts_event(), 1_700_000_000_000_000_000);
    }

    #[test]
    fn test_record_rejects_inconsistent_header() {
        assert!(Record::from_bytes(vec![0u8; 8]).is_err());

        let mut bytes = vec![0u8; 16];
        bytes[0] = 5; // claims 20 bytes
        assert!(Record::from_bytes(bytes).is_err());

        assert!(Record::build(0x01, 0, 0, 0, &[0u8; MAX_RECORD_LEN]).is_err());
    }

    #[test]
    fn test_gateway_requires_dataset_and_key() {
        assert!(matches!(
            ReplayGateway::new(GatewayConfig::new("key")),
            Err(GatewayError::InvalidConfig(_))
        ));
        assert!(matches!(
            ReplayGateway::new(GatewayConfig::default().with_dataset("XNAS.ITCH")),
            Err(GatewayError::InvalidConfig(_))
        ));
    }

    #[test]
    fn test_start_without_subscription_fails() {
        let gateway = ReplayGateway::new(config()).unwrap();
        let handlers = SessionHandlers {
            on_metadata: None,
            on_record: Box::new(|_| KeepGoing::Continue),
            on_error: None,
        };
        assert_eq!(gateway.start(handlers).unwrap_err(), GatewayError::NoSubscriptions);
    }

    #[test]
    fn test_run_loop_delivers_in_order_and_stops() {
        let gateway = ReplayGateway::new(config()).unwrap();
        gateway
            .subscribe(&["ESZ4".to_string()], Schema::Trades, SType::RawSymbol)
            .unwrap();

        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        gateway
            .start(SessionHandlers {
                on_metadata: None,
                on_record: Box::new(move |record| {
                    let mut seen = sink.lock().unwrap();
                    seen.push(record.instrument_id());
                    if seen.len() == 3 {
                        KeepGoing::Stop
                    } else {
                        KeepGoing::Continue
                    }
                }),
                on_error: None,
            })
            .unwrap();

        let feed = gateway.feed();
        for id in 1..=5 {
            feed.push_record(Record::build(0, 0, id, 0, &[]).unwrap()).unwrap();
        }

        assert!(wait_until(|| !gateway.is_running()));
        assert_eq!(*seen.lock().unwrap(), vec![1, 2, 3]);
        // The loop stopped before taking the rest
        assert_eq!(feed.pending(), 2);
    }

    #[test]
    fn test_metadata_and_errors_reach_handlers() {
        let gateway = ReplayGateway::new(config()).unwrap();
        gateway
            .subscribe_with_snapshot(&["NQZ4".to_string()], Schema::Mbo, SType::RawSymbol)
            .unwrap();

        let metadata = Arc::new(Mutex::new(None));
        let errors = Arc::new(AtomicUsize::new(0));
        let metadata_sink = Arc::clone(&metadata);
        let error_sink = Arc::clone(&errors);
        gateway
            .start(SessionHandlers {
                on_metadata: Some(Box::new(move |m| {
                    *metadata_sink.lock().unwrap() = Some(m.clone());
                })),
                on_record: Box::new(|_| KeepGoing::Continue),
                on_error: Some(Box::new(move |_| {
                    error_sink.fetch_add(1, Ordering::SeqCst);
                })),
            })
            .unwrap();

        gateway.feed().push_error("connection reset").unwrap();
        assert!(wait_until(|| errors.load(Ordering::SeqCst) == 1));

        let metadata = metadata.lock().unwrap().clone().unwrap();
        assert_eq!(metadata.dataset, "GLBX.MDP3");
        assert_eq!(metadata.schema.as_deref(), Some("mbo"));
        assert_eq!(metadata.symbols, vec!["NQZ4".to_string()]);
        assert!(gateway.subscriptions()[0].snapshot);

        gateway.shutdown().unwrap();
        assert!(!gateway.is_running());
    }

    #[test]
    fn test_shutdown_disconnects() {
        let gateway = ReplayGateway::new(config()).unwrap();
        gateway.shutdown().unwrap();
        assert_eq!(
            gateway
                .subscribe(&[], Schema::Trades, SType::RawSymbol)
                .unwrap_err(),
            GatewayError::NotConnected
        );
        gateway.reconnect().unwrap();
        assert!(gateway.subscribe(&[], Schema::Trades, SType::RawSymbol).is_ok());
        assert!(gateway.resubscribe().is_ok());
    }

    #[test]
    fn test_metadata_schema_only_when_uniform() {
        let subs = vec![
            Subscription {
                symbols: vec!["B".into(), "A".into()],
                schema: Schema::Trades,
                stype: SType::RawSymbol,
                snapshot: false,
            },
            Subscription {
                symbols: vec!["A".into()],
                schema: Schema::Mbp1,
                stype: SType::RawSymbol,
                snapshot: false,
            },
        ];
        let metadata = SessionMetadata::describe("XNAS.ITCH", &config(), &subs);
        assert_eq!(metadata.schema, None);
        assert_eq!(metadata.stype_in.as_deref(), Some("raw_symbol"));
        assert_eq!(metadata.symbols, vec!["A".to_string(), "B".to_string()]);
    }

    #[test]
    fn test_factory_tracks_feed_by_dataset() {
        let factory = ReplayGatewayFactory::new();
        assert!(factory.feed("GLBX.MDP3").is_none());
        let _gateway = factory.build(&config()).unwrap();
        assert!(factory.feed("GLBX.MDP3").is_some());
    }

    #[test]
    fn test_factory_forgets_feed_on_shutdown() {
        let factory = ReplayGatewayFactory::new();
        let first = factory.build(&config()).unwrap();
        let second = factory.build(&config()).unwrap();

        // The older gateway's shutdown leaves the newer listing in place
        first.shutdown().unwrap();
        assert!(factory.feed("GLBX.MDP3").is_some());

        second.shutdown().unwrap();
        assert!(factory.feed("GLBX.MDP3").is_none());

        drop(first);
        drop(second);
        assert!(factory.feed("GLBX.MDP3").is_none());
    }
}

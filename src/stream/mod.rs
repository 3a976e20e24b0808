//! Live streaming synchronizer
//!
//! Turns the request/response exchange with a remote black box into
//! per-variable feeds in the shared [`SeriesStore`].
//!
//! # Session lifecycle
//!
//! ```text
//! Idle -> Discovering -> AwaitingSelection -> Initializing -> Streaming -> Stopping -> Idle
//! ```
//!
//! - **Discovering** - a catalog query is shouted and the correlated answer
//!   awaited for a bounded time
//! - **Initializing** - one series per selected variable is created and
//!   seeded from a latest-value query
//! - **Streaming** - producers fetch and replay data, a receive thread
//!   routes responses into per-variable [`PendingBuffer`]s
//! - **Stopping** - the running flag clears and every thread is joined
//!
//! Any failure before streaming returns the session to `Idle`; calling
//! [`Synchronizer::start`] again retries from discovery.
//!
//! # Threads
//!
//! Discovery and initialization block the calling thread for up to their
//! configured timeouts. Hosts with a render loop should use
//! [`Synchronizer::spawn_discover`] or call from a worker thread.

mod pending;
mod producer;
mod router;
mod scheduler;

pub use pending::{BufferStats, PendingBuffer};
pub use router::{Correlator, ResponseRouter};
pub use scheduler::{
    Delivery, PlaybackScheduler, Sleeper, ThreadSleeper, MAX_PLAYBACK_SPEED, MIN_PLAYBACK_SPEED,
};

use crate::bus::{Bus, BusMessage, Request, Response};
use crate::config::{AppConfig, BusConfig, StreamMode};
use crate::error::{DataFeedError, Result};
use crate::store::SeriesStore;
use crate::types::{CatalogEntry, LatestSample};
use crossbeam_channel::{bounded, Receiver, RecvTimeoutError};
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use producer::{run_combined_producer, run_variable_producer, ProducerContext};

/// State of a streaming session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SyncState {
    /// No session
    #[default]
    Idle,
    /// Waiting for the catalog
    Discovering,
    /// Catalog known, waiting for a selection
    AwaitingSelection,
    /// Creating and seeding series
    Initializing,
    /// Producers running
    Streaming,
    /// Producers being joined
    Stopping,
}

impl SyncState {
    /// Check if producers are (still) running
    pub fn is_streaming(&self) -> bool {
        matches!(self, SyncState::Streaming | SyncState::Stopping)
    }
}

impl fmt::Display for SyncState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SyncState::Idle => "idle",
            SyncState::Discovering => "discovering",
            SyncState::AwaitingSelection => "awaiting selection",
            SyncState::Initializing => "initializing",
            SyncState::Streaming => "streaming",
            SyncState::Stopping => "stopping",
        };
        f.write_str(name)
    }
}

/// Health of one streamed variable
#[derive(Debug, Clone, PartialEq)]
pub struct VariableHealth {
    /// Variable name
    pub name: String,
    /// Time since the last response (or since streaming started)
    pub silent_for: Duration,
    /// Whether `silent_for` exceeds the stall timeout
    pub stalled: bool,
    /// Admission counters of the variable's buffer
    pub buffer: BufferStats,
}

/// Steady-state health of a streaming session
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StreamHealth {
    /// Per-variable health, in selection order
    pub variables: Vec<VariableHealth>,
}

impl StreamHealth {
    /// Names of stalled variables
    pub fn stalled(&self) -> Vec<&str> {
        self.variables
            .iter()
            .filter(|v| v.stalled)
            .map(|v| v.name.as_str())
            .collect()
    }

    /// True when no variable is stalled
    pub fn is_healthy(&self) -> bool {
        self.variables.iter().all(|v| !v.stalled)
    }
}

#[derive(Debug, Default)]
struct Shared {
    state: Mutex<SyncState>,
    catalog: Mutex<Vec<CatalogEntry>>,
}

impl Shared {
    fn state(&self) -> SyncState {
        *self.state.lock().unwrap_or_else(|p| p.into_inner())
    }

    fn set_state(&self, state: SyncState) {
        let mut current = self.state.lock().unwrap_or_else(|p| p.into_inner());
        if *current != state {
            tracing::debug!("Synchronizer {} -> {}", *current, state);
            *current = state;
        }
    }

    /// Enter `Discovering` unless a discovery is already in flight
    fn begin_discovery(&self) -> Result<()> {
        let mut current = self.state.lock().unwrap_or_else(|p| p.into_inner());
        if *current == SyncState::Discovering {
            return Err(DataFeedError::DiscoveryInProgress);
        }
        tracing::debug!("Synchronizer {} -> {}", *current, SyncState::Discovering);
        *current = SyncState::Discovering;
        Ok(())
    }

    fn catalog(&self) -> Vec<CatalogEntry> {
        self.catalog.lock().unwrap_or_else(|p| p.into_inner()).clone()
    }

    fn set_catalog(&self, catalog: Vec<CatalogEntry>) {
        *self.catalog.lock().unwrap_or_else(|p| p.into_inner()) = catalog;
    }
}

struct Session {
    running: Arc<AtomicBool>,
    mode: StreamMode,
    buffers: Vec<Arc<PendingBuffer>>,
    producers: Vec<JoinHandle<()>>,
    receiver: Option<JoinHandle<()>>,
    stall_timeout: Duration,
}

impl Session {
    fn stop(&mut self) {
        self.running.store(false, Ordering::SeqCst);
        for buffer in &self.buffers {
            buffer.wake();
        }
        for handle in self.producers.drain(..) {
            if handle.join().is_err() {
                tracing::error!("A producer thread panicked");
            }
        }
        if let Some(handle) = self.receiver.take() {
            if handle.join().is_err() {
                tracing::error!("The bus receive thread panicked");
            }
        }
    }
}

/// Orchestrates discovery, initialization, producers and shutdown
pub struct Synchronizer {
    config: AppConfig,
    bus: Arc<dyn Bus>,
    store: SeriesStore,
    shared: Arc<Shared>,
    session: Option<Session>,
}

impl fmt::Debug for Synchronizer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Synchronizer")
            .field("node", &self.bus.node_name())
            .field("state", &self.state())
            .field("series", &self.store.len())
            .finish()
    }
}

impl Synchronizer {
    /// Create a synchronizer writing into a fresh store
    pub fn new(config: AppConfig, bus: impl Bus + 'static) -> Self {
        Self::with_store(config, Arc::new(bus), SeriesStore::new())
    }

    /// Create a synchronizer writing into an existing store
    pub fn with_store(config: AppConfig, bus: Arc<dyn Bus>, store: SeriesStore) -> Self {
        Self {
            config,
            bus,
            store,
            shared: Arc::new(Shared::default()),
            session: None,
        }
    }

    /// The store producers write into
    pub fn store(&self) -> &SeriesStore {
        &self.store
    }

    /// The configuration in use
    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    /// Current session state
    pub fn state(&self) -> SyncState {
        self.shared.state()
    }

    /// Catalog from the last successful discovery
    pub fn catalog(&self) -> Vec<CatalogEntry> {
        self.shared.catalog()
    }

    /// Check if producers are running
    pub fn is_running(&self) -> bool {
        self.session
            .as_ref()
            .is_some_and(|s| s.running.load(Ordering::SeqCst))
    }

    /// Producer layout of the running session
    pub fn mode(&self) -> Option<StreamMode> {
        self.session.as_ref().map(|s| s.mode)
    }

    /// Variables of the running session
    pub fn selection(&self) -> Vec<String> {
        self.session
            .as_ref()
            .map(|s| s.buffers.iter().map(|b| b.name().to_string()).collect())
            .unwrap_or_default()
    }

    /// Query the remote catalog, blocking up to the discovery timeout
    pub fn discover(&mut self) -> Result<Vec<CatalogEntry>> {
        if self.session.is_some() {
            return Err(DataFeedError::AlreadyRunning);
        }
        self.shared.begin_discovery()?;
        discover_into(self.bus.as_ref(), &self.config, &self.shared)
    }

    /// Run discovery on a helper thread
    ///
    /// The result arrives on the returned channel; the synchronizer's state
    /// and catalog are updated as with [`discover`](Self::discover). The
    /// state is `Discovering` by the time this returns, so `start` and
    /// further discoveries are refused until the helper finishes.
    pub fn spawn_discover(&self) -> Receiver<Result<Vec<CatalogEntry>>> {
        let (tx, rx) = bounded(1);
        if self.session.is_some() {
            let _ = tx.send(Err(DataFeedError::AlreadyRunning));
            return rx;
        }
        if let Err(e) = self.shared.begin_discovery() {
            let _ = tx.send(Err(e));
            return rx;
        }
        let bus = self.bus.clone();
        let config = self.config.clone();
        let shared = self.shared.clone();
        std::thread::spawn(move || {
            let result = discover_into(bus.as_ref(), &config, &shared);
            let _ = tx.send(result);
        });
        rx
    }

    /// Start streaming `selection`
    ///
    /// Discovers first unless a catalog is waiting for a selection. Blocks
    /// until the series are seeded or initialization times out.
    pub fn start(&mut self, selection: &[String]) -> Result<()> {
        if self.session.is_some() {
            return Err(DataFeedError::AlreadyRunning);
        }
        match self.state() {
            SyncState::AwaitingSelection => {}
            SyncState::Discovering => return Err(DataFeedError::DiscoveryInProgress),
            _ => {
                self.discover()?;
            }
        }

        let selection = dedup(selection);
        if selection.is_empty() {
            return self.fail(DataFeedError::EmptySelection);
        }
        let catalog = self.shared.catalog();
        let known: HashSet<&str> = catalog.iter().map(|e| e.name.as_str()).collect();
        if let Some(unknown) = selection.iter().find(|n| !known.contains(n.as_str())) {
            return self.fail(DataFeedError::UnknownVariable(unknown.clone()));
        }

        self.shared.set_state(SyncState::Initializing);
        let created: Vec<String> = selection
            .iter()
            .filter(|name| self.store.create_series(name))
            .cloned()
            .collect();

        let inbox = self.bus.subscribe();
        let seeds = match self.initialize(&inbox, &selection) {
            Ok(seeds) => seeds,
            Err(e) => {
                for name in &created {
                    self.store.remove_series(name);
                }
                return self.fail(e);
            }
        };

        match self.spawn_session(inbox, &selection, &seeds) {
            Ok(session) => {
                tracing::info!(
                    "Streaming {} variables ({} mode)",
                    selection.len(),
                    session.mode
                );
                self.session = Some(session);
                self.shared.set_state(SyncState::Streaming);
                Ok(())
            }
            Err(e) => self.fail(e),
        }
    }

    /// Ask for the latest values and seed the store with them
    ///
    /// Every selected variable must receive a value before the deadline,
    /// otherwise nothing is written. A series that already holds a point
    /// at or after the received one keeps its history, and its buffer
    /// resumes from that last point.
    fn initialize(
        &self,
        inbox: &Receiver<BusMessage>,
        selection: &[String],
    ) -> Result<HashMap<String, LatestSample>> {
        let bus_config = &self.config.bus;
        let request = Request::latest_data(&bus_config.source_id, &bus_config.sender_id, selection);
        self.bus.shout(&bus_config.group, &request.to_json()?)?;
        tracing::debug!("Requested initial values for {} variables", selection.len());

        let deadline = Instant::now() + self.config.discovery.init_timeout();
        let mut latest: HashMap<String, LatestSample> = HashMap::new();
        while latest.len() < selection.len() {
            let remaining = deadline.saturating_duration_since(Instant::now());
            let response = await_response(inbox, bus_config, remaining, |r| {
                matches!(r, Response::Latest { .. })
                    && r.msg_id().map_or(true, |id| id == request.msg_id)
            });
            let Some(Response::Latest { data, .. }) = response else {
                break;
            };
            for (name, point) in data {
                if selection.contains(&name) {
                    latest.insert(name, point);
                }
            }
        }

        let missing: Vec<&str> = selection
            .iter()
            .filter(|n| !latest.contains_key(*n))
            .map(String::as_str)
            .collect();
        if !missing.is_empty() {
            tracing::warn!("No initial value for {}", missing.join(", "));
            return Err(DataFeedError::InitializationTimeout {
                timeout_ms: self.config.discovery.init_timeout_ms,
            });
        }

        let mut seeds = HashMap::with_capacity(latest.len());
        for (name, point) in latest {
            let last = self.store.with_series(&name, |s| s.last().copied()).flatten();
            let seed = match last {
                Some(last) if last.timestamp >= point.timestamp => {
                    tracing::debug!("'{}' resumes after t={}", name, last.timestamp);
                    last
                }
                _ => {
                    self.store.append(&name, point)?;
                    point
                }
            };
            seeds.insert(name, seed);
        }
        Ok(seeds)
    }

    fn spawn_session(
        &self,
        inbox: Receiver<BusMessage>,
        selection: &[String],
        seeds: &HashMap<String, LatestSample>,
    ) -> Result<Session> {
        let streaming = self.config.streaming.clone();
        let running = Arc::new(AtomicBool::new(true));
        let correlator = Arc::new(Correlator::new());
        let buffers: Vec<Arc<PendingBuffer>> = selection
            .iter()
            .map(|name| Arc::new(PendingBuffer::new(name.clone(), seeds.get(name).copied())))
            .collect();

        let mut session = Session {
            running: running.clone(),
            mode: streaming.mode,
            buffers: buffers.clone(),
            producers: Vec::new(),
            receiver: None,
            stall_timeout: streaming.stall_timeout(),
        };

        let router = ResponseRouter::new(
            self.config.bus.group.clone(),
            self.config.bus.sender_id.clone(),
            buffers.iter().map(|b| (b.name().to_string(), b.clone())).collect(),
            correlator.clone(),
        );
        let flag = running.clone();
        session.receiver = Some(
            std::thread::Builder::new()
                .name("datafeed-receive".into())
                .spawn(move || router.run(inbox, flag))?,
        );

        let ctx = ProducerContext {
            bus: self.bus.clone(),
            store: self.store.clone(),
            running,
            correlator,
            group: self.config.bus.group.clone(),
            source_id: self.config.bus.source_id.clone(),
            sender_id: self.config.bus.sender_id.clone(),
            streaming,
        };

        let spawned = match session.mode {
            StreamMode::PerVariable => buffers.iter().try_for_each(|buffer| {
                let ctx = ctx.clone();
                let buffer = buffer.clone();
                let handle = std::thread::Builder::new()
                    .name(format!("datafeed-{}", buffer.name()))
                    .spawn(move || run_variable_producer(ctx, buffer))?;
                session.producers.push(handle);
                Ok::<(), DataFeedError>(())
            }),
            StreamMode::Combined => std::thread::Builder::new()
                .name("datafeed-combined".into())
                .spawn(move || run_combined_producer(ctx, buffers))
                .map(|handle| session.producers.push(handle))
                .map_err(DataFeedError::from),
        };

        if let Err(e) = spawned {
            session.stop();
            return Err(e);
        }
        Ok(session)
    }

    fn fail<T>(&self, error: DataFeedError) -> Result<T> {
        tracing::error!("Session failed: {}", error);
        self.shared.set_catalog(Vec::new());
        self.shared.set_state(SyncState::Idle);
        Err(error)
    }

    /// Health of the running session; empty when idle
    pub fn health(&self) -> StreamHealth {
        let Some(session) = &self.session else {
            return StreamHealth::default();
        };
        StreamHealth {
            variables: session
                .buffers
                .iter()
                .map(|buffer| {
                    let silent_for = buffer.silent_for();
                    VariableHealth {
                        name: buffer.name().to_string(),
                        silent_for,
                        stalled: silent_for > session.stall_timeout,
                        buffer: buffer.stats(),
                    }
                })
                .collect(),
        }
    }

    /// Stop streaming and wait for every producer to exit
    ///
    /// Nothing is written to the store after this returns. Series are kept.
    pub fn shutdown(&mut self) {
        let Some(mut session) = self.session.take() else {
            return;
        };
        self.shared.set_state(SyncState::Stopping);
        tracing::info!("Stopping {} producers", session.producers.len());
        session.stop();
        self.shared.set_state(SyncState::Idle);
        tracing::info!("Streaming stopped");
    }
}

impl Drop for Synchronizer {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Run a discovery already entered through [`Shared::begin_discovery`]
fn discover_into(bus: &dyn Bus, config: &AppConfig, shared: &Shared) -> Result<Vec<CatalogEntry>> {
    match query_catalog(bus, config) {
        Ok(catalog) => {
            tracing::info!(
                "Discovered {} variables on '{}'",
                catalog.len(),
                config.bus.source_id
            );
            shared.set_catalog(catalog.clone());
            shared.set_state(SyncState::AwaitingSelection);
            Ok(catalog)
        }
        Err(e) => {
            tracing::error!("Discovery failed: {}", e);
            shared.set_catalog(Vec::new());
            shared.set_state(SyncState::Idle);
            Err(e)
        }
    }
}

fn query_catalog(bus: &dyn Bus, config: &AppConfig) -> Result<Vec<CatalogEntry>> {
    let bus_config = &config.bus;
    let inbox = bus.subscribe();
    let request = Request::variables(&bus_config.source_id, &bus_config.sender_id);
    bus.shout(&bus_config.group, &request.to_json()?)?;

    let response = await_response(&inbox, bus_config, config.discovery.timeout(), |r| {
        matches!(r, Response::Catalog(_))
    })
    .ok_or_else(|| DataFeedError::DiscoveryTimeout {
        source_id: bus_config.source_id.clone(),
        timeout_ms: config.discovery.timeout_ms,
    })?;

    let names = dedup(&response.catalog_names());
    if names.is_empty() {
        return Err(DataFeedError::EmptyCatalog(bus_config.source_id.clone()));
    }
    Ok(names.into_iter().map(CatalogEntry::untyped).collect())
}

/// Wait for the first correlated response accepted by `accept`
fn await_response(
    inbox: &Receiver<BusMessage>,
    bus_config: &BusConfig,
    timeout: Duration,
    accept: impl Fn(&Response) -> bool,
) -> Option<Response> {
    let deadline = Instant::now() + timeout;
    loop {
        let remaining = deadline.saturating_duration_since(Instant::now());
        let message = match inbox.recv_timeout(remaining) {
            Ok(message) => message,
            Err(RecvTimeoutError::Timeout) => return None,
            Err(RecvTimeoutError::Disconnected) => {
                tracing::warn!("Bus subscription closed while waiting for a response");
                return None;
            }
        };
        if message.group != bus_config.group {
            continue;
        }
        match Response::parse(&message.payload, &bus_config.sender_id) {
            Ok(Some(response)) if accept(&response) => return Some(response),
            Ok(_) => {}
            Err(e) => tracing::trace!("Ignoring message from {}: {}", message.sender, e),
        }
    }
}

/// Drop repeated names, keeping first occurrences in order
fn dedup(names: &[String]) -> Vec<String> {
    let mut seen = HashSet::new();
    names
        .iter()
        .filter(|name| seen.insert(name.as_str()))
        .cloned()
        .collect()
}

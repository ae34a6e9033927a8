//! Stream multiplexer: one live market-data connection per credential, fanned
//! out to per-instrument sinks.
//!
//! The transport only accepts the instrument set when a stream opens, so every
//! membership change tears the current connection down and opens a new one.
//! A single supervisor task owns the subscription map and the connection
//! handle; callers talk to it through a command channel and never block.
//!
//! Each connection runs in its own task and tags everything it reports with an
//! epoch. The supervisor awaits the old task before opening the next one and
//! drops any event whose epoch is not the live one, so at most one connection
//! is ever live and a superseded stream cannot deliver into the new one.

use std::sync::Arc;
use std::time::Duration;

use ahash::AHashMap;
use itertools::Itertools;
use metrics::{counter, gauge};
use rand::Rng;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use crate::engine::types::{FeedUpdate, InstrumentId, RawBook};
use crate::error::StreamError;
use crate::market_data::adapters::{MarketConnection, MarketEvent, MarketTransport, SubscriptionRequest};

pub const DEFAULT_DEPTH: u32 = 50;
pub const DEFAULT_KEEPALIVE: Duration = Duration::from_millis(100);
pub const DEFAULT_BACKOFF_INITIAL: Duration = Duration::from_millis(500);
pub const DEFAULT_BACKOFF_MAX: Duration = Duration::from_secs(30);

/// Capacity of the connection -> supervisor channel.
const EVENT_CHANNEL_CAPACITY: usize = 1024;

/// How long a cancelled connection task gets to close before it is aborted.
const STOP_GRACE: Duration = Duration::from_secs(1);

/// Receives routed updates for exactly one instrument.
///
/// Called from the supervisor task; implementations must return quickly
/// (push into a buffer, send on a channel) and never block.
pub trait UpdateSink: Send + Sync + 'static {
    fn on_update(&self, update: FeedUpdate);
    fn on_error(&self, message: &str);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MuxState {
    Idle,
    Connecting,
    Streaming,
    Restarting,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconnectPolicy {
    /// Report the failure and stay idle until an instrument is registered
    /// (again) or the set changes.
    Disabled,
    /// Retry with exponential backoff while subscriptions remain.
    Backoff { initial: Duration, max: Duration },
}

#[derive(Debug, Clone)]
pub struct MuxConfig {
    pub depth: u32,
    pub keepalive: Duration,
    pub reconnect: ReconnectPolicy,
}

impl Default for MuxConfig {
    fn default() -> Self {
        Self {
            depth: DEFAULT_DEPTH,
            keepalive: DEFAULT_KEEPALIVE,
            reconnect: ReconnectPolicy::Backoff {
                initial: DEFAULT_BACKOFF_INITIAL,
                max: DEFAULT_BACKOFF_MAX,
            },
        }
    }
}

enum Command {
    Register { id: InstrumentId, sink: Arc<dyn UpdateSink> },
    Unregister { id: InstrumentId },
}

enum ConnEvent {
    Opened { epoch: u64 },
    Inbound { epoch: u64, event: MarketEvent },
    Failed { epoch: u64, error: StreamError },
}

impl ConnEvent {
    fn epoch(&self) -> u64 {
        match self {
            ConnEvent::Opened { epoch } | ConnEvent::Inbound { epoch, .. } | ConnEvent::Failed { epoch, .. } => *epoch,
        }
    }
}

/// Caller-held handle; construct one per API credential.
///
/// Must be created inside a tokio runtime. Dropping the handle stops the
/// worker without waiting; use [`StreamMultiplexer::shutdown`] to wait.
pub struct StreamMultiplexer {
    commands: mpsc::UnboundedSender<Command>,
    state: watch::Receiver<MuxState>,
    shutdown: CancellationToken,
    worker: Option<JoinHandle<()>>,
}

impl StreamMultiplexer {
    pub fn new(transport: Arc<dyn MarketTransport>, config: MuxConfig) -> Self {
        let (commands, command_rx) = mpsc::unbounded_channel();
        let (state_tx, state) = watch::channel(MuxState::Idle);
        let (events_tx, events) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        let shutdown = CancellationToken::new();

        let supervisor = Supervisor {
            transport,
            backoff: Backoff::new(config.reconnect),
            config,
            commands: command_rx,
            events_tx,
            events,
            state: state_tx,
            shutdown: shutdown.clone(),
            subscriptions: AHashMap::new(),
            epoch: 0,
            connection: None,
            retry_at: None,
        };
        let worker = tokio::spawn(supervisor.run());

        Self {
            commands,
            state,
            shutdown,
            worker: Some(worker),
        }
    }

    /// Route `id` to `sink`. Returns immediately; the reconnect happens in the
    /// background. Registering an id again swaps its sink without reconnecting,
    /// unless no connection is up (e.g. after a failure), in which case it reopens.
    pub fn register(&self, id: impl Into<InstrumentId>, sink: Arc<dyn UpdateSink>) {
        let id = id.into();
        if self.commands.send(Command::Register { id, sink }).is_err() {
            warn!("multiplexer worker gone, register ignored");
        }
    }

    /// Stop routing `id`. Unknown ids are ignored.
    pub fn unregister(&self, id: &str) {
        if self.commands.send(Command::Unregister { id: id.to_owned() }).is_err() {
            warn!("multiplexer worker gone, unregister ignored");
        }
    }

    pub fn state(&self) -> MuxState {
        *self.state.borrow()
    }

    pub fn watch_state(&self) -> watch::Receiver<MuxState> {
        self.state.clone()
    }

    /// Stop the worker and wait until the live connection has closed.
    pub async fn shutdown(mut self) {
        self.shutdown.cancel();
        if let Some(worker) = self.worker.take() {
            if let Err(e) = worker.await {
                warn!(error = %e, "multiplexer worker panicked");
            }
        }
    }
}

impl Drop for StreamMultiplexer {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

struct LiveConnection {
    epoch: u64,
    instruments: Vec<InstrumentId>,
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

struct Supervisor {
    transport: Arc<dyn MarketTransport>,
    config: MuxConfig,
    commands: mpsc::UnboundedReceiver<Command>,
    events_tx: mpsc::Sender<ConnEvent>,
    events: mpsc::Receiver<ConnEvent>,
    state: watch::Sender<MuxState>,
    shutdown: CancellationToken,
    subscriptions: AHashMap<InstrumentId, Arc<dyn UpdateSink>>,
    epoch: u64,
    connection: Option<LiveConnection>,
    retry_at: Option<Instant>,
    backoff: Backoff,
}

impl Supervisor {
    async fn run(mut self) {
        debug!("multiplexer started");
        loop {
            let retry_at = self.retry_at;
            // Commands before events: nothing reaches a sink after its unregister was queued.
            tokio::select! {
                biased;
                _ = self.shutdown.cancelled() => break,
                command = self.commands.recv() => {
                    let Some(command) = command else { break };
                    self.on_commands(command).await;
                }
                Some(event) = self.events.recv() => self.on_event(event).await,
                _ = tokio::time::sleep_until(retry_at.unwrap_or_else(Instant::now)), if retry_at.is_some() => {
                    self.retry_at = None;
                    self.retry();
                }
            }
        }
        self.stop_connection().await;
        self.set_state(MuxState::Idle);
        info!("multiplexer stopped");
    }

    // Drain whatever else is queued so a burst of registrations costs one restart.
    async fn on_commands(&mut self, first: Command) {
        let mut changed = self.apply(first);
        while let Ok(next) = self.commands.try_recv() {
            changed |= self.apply(next);
        }
        gauge!("lobgrid_subscriptions").set(self.subscriptions.len() as f64);
        if changed {
            self.reconcile().await;
        }
    }

    /// True when the connection has to be (re)opened: the set of instruments
    /// changed, or a registration arrived while no connection is up.
    fn apply(&mut self, command: Command) -> bool {
        match command {
            Command::Register { id, sink } => {
                let added = self.subscriptions.insert(id.clone(), sink).is_none();
                if added {
                    info!(instrument = %id, "registered");
                } else {
                    debug!(instrument = %id, "sink replaced");
                }
                added || self.connection.is_none()
            }
            Command::Unregister { id } => {
                let removed = self.subscriptions.remove(&id).is_some();
                if removed {
                    info!(instrument = %id, "unregistered");
                }
                removed
            }
        }
    }

    fn desired_instruments(&self) -> Vec<InstrumentId> {
        self.subscriptions.keys().cloned().sorted().collect()
    }

    async fn reconcile(&mut self) {
        let desired = self.desired_instruments();
        if self.connection.as_ref().is_some_and(|c| c.instruments == desired) {
            return;
        }

        self.retry_at = None;
        self.backoff.reset();

        if desired.is_empty() {
            self.stop_connection().await;
            self.set_state(MuxState::Idle);
            return;
        }

        if self.connection.is_some() {
            self.set_state(MuxState::Restarting);
            self.stop_connection().await;
        }
        self.start_connection(desired);
    }

    fn retry(&mut self) {
        if self.connection.is_some() || self.subscriptions.is_empty() {
            return;
        }
        info!(instruments = self.subscriptions.len(), "reconnecting");
        let desired = self.desired_instruments();
        self.start_connection(desired);
    }

    fn start_connection(&mut self, instruments: Vec<InstrumentId>) {
        self.epoch += 1;
        let epoch = self.epoch;
        let cancel = self.shutdown.child_token();
        let request = SubscriptionRequest {
            instruments: instruments.clone(),
            depth: self.config.depth,
        };

        debug!(epoch, instruments = %instruments.iter().join(","), "opening connection");
        counter!("lobgrid_connection_attempts_total").increment(1);

        let task = tokio::spawn(drive_connection(
            self.transport.clone(),
            request,
            epoch,
            self.config.keepalive,
            self.events_tx.clone(),
            cancel.clone(),
        ));
        self.connection = Some(LiveConnection {
            epoch,
            instruments,
            cancel,
            task,
        });
        self.set_state(MuxState::Connecting);
    }

    /// Cancel the live connection and wait for its task to finish, aborting
    /// it if it has not wound down within [`STOP_GRACE`].
    async fn stop_connection(&mut self) {
        let Some(mut conn) = self.connection.take() else {
            return;
        };
        conn.cancel.cancel();
        let joined = match tokio::time::timeout(STOP_GRACE, &mut conn.task).await {
            Ok(joined) => joined,
            Err(_) => {
                warn!(epoch = conn.epoch, grace_ms = STOP_GRACE.as_millis() as u64, "connection stuck, aborting");
                counter!("lobgrid_connection_aborts_total").increment(1);
                conn.task.abort();
                conn.task.await
            }
        };
        match joined {
            Err(e) if e.is_panic() => warn!(epoch = conn.epoch, error = %e, "connection task panicked"),
            _ => debug!(epoch = conn.epoch, "connection stopped"),
        }
    }

    fn is_live(&self, epoch: u64) -> bool {
        self.connection.as_ref().is_some_and(|c| c.epoch == epoch)
    }

    async fn on_event(&mut self, event: ConnEvent) {
        if !self.is_live(event.epoch()) {
            trace!(epoch = event.epoch(), live = self.epoch, "event from superseded connection dropped");
            return;
        }
        match event {
            ConnEvent::Opened { epoch } => {
                self.backoff.reset();
                self.set_state(MuxState::Streaming);
                info!(epoch, instruments = self.subscriptions.len(), "streaming");
            }
            ConnEvent::Inbound { event, .. } => self.dispatch(event),
            ConnEvent::Failed { error, .. } => self.on_failure(error).await,
        }
    }

    fn dispatch(&self, event: MarketEvent) {
        let (id, update) = match event {
            MarketEvent::BookUpdate { instrument_id, bids, asks } => {
                (instrument_id, FeedUpdate::book(RawBook::new(bids, asks)))
            }
            MarketEvent::Trade { instrument_id, trade } => (instrument_id, FeedUpdate::trade(trade)),
            MarketEvent::Heartbeat => return,
        };
        match self.subscriptions.get(&id) {
            Some(sink) => {
                sink.on_update(update);
                counter!("lobgrid_messages_routed_total").increment(1);
            }
            None => {
                // Normal while a restart is in flight.
                trace!(instrument = %id, "no subscriber, dropped");
                counter!("lobgrid_messages_dropped_total").increment(1);
            }
        }
    }

    async fn on_failure(&mut self, error: StreamError) {
        self.stop_connection().await;
        self.set_state(MuxState::Idle);
        counter!("lobgrid_stream_failures_total").increment(1);
        warn!(error = %error, subscriptions = self.subscriptions.len(), "market data stream failed");

        let message = error.to_string();
        for sink in self.subscriptions.values() {
            sink.on_error(&message);
        }

        if self.subscriptions.is_empty() {
            return;
        }
        if let Some(delay) = self.backoff.next_delay() {
            info!(delay_ms = delay.as_millis() as u64, "reconnect scheduled");
            self.retry_at = Some(Instant::now() + delay);
        }
    }

    fn set_state(&self, next: MuxState) {
        let prev = self.state.send_replace(next);
        if prev != next {
            debug!(?prev, ?next, "state");
        }
    }
}

async fn drive_connection(
    transport: Arc<dyn MarketTransport>,
    request: SubscriptionRequest,
    epoch: u64,
    keepalive: Duration,
    events: mpsc::Sender<ConnEvent>,
    cancel: CancellationToken,
) {
    let opened = tokio::select! {
        _ = cancel.cancelled() => return,
        opened = transport.open(&request) => opened,
    };
    let mut conn = match opened {
        Ok(conn) => conn,
        Err(error) => {
            forward(&events, &cancel, ConnEvent::Failed { epoch, error }).await;
            return;
        }
    };
    if !forward(&events, &cancel, ConnEvent::Opened { epoch }).await {
        conn.close().await;
        return;
    }

    let failure = pump(conn.as_mut(), epoch, keepalive, &events, &cancel).await;
    conn.close().await;
    if let Some(error) = failure {
        forward(&events, &cancel, ConnEvent::Failed { epoch, error }).await;
    }
    trace!(epoch, "connection task done");
}

// Returns the error that ended the stream, or `None` when cancelled.
async fn pump(
    conn: &mut dyn MarketConnection,
    epoch: u64,
    keepalive: Duration,
    events: &mpsc::Sender<ConnEvent>,
    cancel: &CancellationToken,
) -> Option<StreamError> {
    let mut ticker = tokio::time::interval_at(Instant::now() + keepalive, keepalive);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => return None,
            _ = ticker.tick() => {
                let sent = tokio::select! {
                    _ = cancel.cancelled() => return None,
                    sent = conn.send_heartbeat() => sent,
                };
                if let Err(e) = sent {
                    return Some(e);
                }
                counter!("lobgrid_heartbeats_sent_total").increment(1);
            }
            next = conn.next_event() => match next {
                Some(Ok(MarketEvent::Heartbeat)) => trace!(epoch, "server heartbeat"),
                Some(Ok(event)) => {
                    if !forward(events, cancel, ConnEvent::Inbound { epoch, event }).await {
                        return None;
                    }
                }
                Some(Err(e)) => return Some(e),
                None => return Some(StreamError::Closed),
            },
        }
    }
}

// False once cancelled or the supervisor is gone.
async fn forward(events: &mpsc::Sender<ConnEvent>, cancel: &CancellationToken, event: ConnEvent) -> bool {
    tokio::select! {
        _ = cancel.cancelled() => false,
        sent = events.send(event) => sent.is_ok(),
    }
}

/// Exponential reconnect delay with up to 10% jitter.
#[derive(Debug)]
struct Backoff {
    policy: ReconnectPolicy,
    next: Option<Duration>,
}

impl Backoff {
    fn new(policy: ReconnectPolicy) -> Self {
        let mut backoff = Self { policy, next: None };
        backoff.reset();
        backoff
    }

    fn reset(&mut self) {
        self.next = match self.policy {
            ReconnectPolicy::Disabled => None,
            ReconnectPolicy::Backoff { initial, .. } => Some(initial),
        };
    }

    fn next_delay(&mut self) -> Option<Duration> {
        let ReconnectPolicy::Backoff { max, .. } = self.policy else {
            return None;
        };
        let current = self.next?;
        self.next = Some((current * 2).min(max));

        let jitter_ms = current.as_millis() as u64 / 10;
        let jitter = if jitter_ms > 0 {
            Duration::from_millis(rand::thread_rng().gen_range(0..=jitter_ms))
        } else {
            Duration::ZERO
        };
        Some(current + jitter)
    }
}

//! Session engine for one instrument connection.
//!
//! The [`Session`] owns the link, the connection state machine, the current
//! [`ParameterSet`] and the outstanding telemetry requests. All of that lives
//! behind a single async lock: commands take it for validation-to-send, and
//! the reception loop takes it for every batch of decoded frames. Because
//! notifications are emitted while the lock is held, a state transition is
//! always visible to later commands before any later frame is dispatched.
//!
//! # States
//!
//! ```text
//! Disconnected --connect--> Connecting --handshake ok--> Connected
//!      ^                        |                           |
//!      |                  retries exhausted           transport lost
//!      |                        v                           v
//!      +------disconnect---- Cancelled <--------------------+
//! ```
//!
//! While `Connected`, the acquisition mode moves between `Idle`,
//! `SingleTransmitterActive` and `QuadroTransmitterActive`; at most one is
//! active and switching always stops the previous one first.
//!
//! # Staged parameters
//!
//! Values set while not connected are validated, recorded and rejected with
//! `NotConnected`. After the next successful handshake the parameter set is
//! reset to the model defaults and the staged values are replayed in the
//! order they were set (see [`SessionConfig::replay_staged_parameters`]).

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use log::{debug, info, trace, warn};
use parking_lot::Mutex as SyncMutex;
use serde::{Deserialize, Serialize};
use tokio::sync::{oneshot, watch, Mutex};
use tokio::task::{AbortHandle, JoinHandle};

use crate::codec::{Command, Decoded, FrameDecoder, InboundFrame, PROTOCOL_VERSION};
use crate::dispatcher::{ConnectivityEvent, Dispatcher, SessionFault};
use crate::errors::{DriverError, Result};
use crate::params::{DeviceModel, ParameterId, ParameterSet, TransmitterMode};
use crate::transport::{Connector, TcpConnector, Transport, TransportReader, TransportWriter};

// ============================================================================
// Constants
// ============================================================================

const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(3);
const DEFAULT_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(2);
const DEFAULT_MAX_CONNECT_ATTEMPTS: u32 = 3;
const DEFAULT_RETRY_DELAY: Duration = Duration::from_millis(500);
const DEFAULT_WRITE_TIMEOUT: Duration = Duration::from_secs(2);
const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(2);
const DEFAULT_NOTIFICATION_CAPACITY: usize = 256;
const DEFAULT_TCP_KEEPALIVE: Duration = Duration::from_secs(10);

// ============================================================================
// State types
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    /// The session gave up after a failure; distinct from a caller's disconnect.
    Cancelled,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
            ConnectionState::Cancelled => "cancelled",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AcquisitionMode {
    #[default]
    Idle,
    SingleTransmitterActive,
    QuadroTransmitterActive,
}

impl AcquisitionMode {
    pub fn is_active(self) -> bool {
        self != AcquisitionMode::Idle
    }

    pub fn transmitter_mode(self) -> Option<TransmitterMode> {
        match self {
            AcquisitionMode::Idle => None,
            AcquisitionMode::SingleTransmitterActive => Some(TransmitterMode::Single),
            AcquisitionMode::QuadroTransmitterActive => Some(TransmitterMode::Quadro),
        }
    }
}

impl From<TransmitterMode> for AcquisitionMode {
    fn from(mode: TransmitterMode) -> Self {
        match mode {
            TransmitterMode::Single => AcquisitionMode::SingleTransmitterActive,
            TransmitterMode::Quadro => AcquisitionMode::QuadroTransmitterActive,
        }
    }
}

/// Request/response style telemetry queries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RequestKind {
    Battery,
    Diagnostic,
}

impl RequestKind {
    fn command(self) -> Command {
        match self {
            RequestKind::Battery => Command::RequestBattery,
            RequestKind::Diagnostic => Command::RequestDiagnostic,
        }
    }
}

impl fmt::Display for RequestKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RequestKind::Battery => f.write_str("battery"),
            RequestKind::Diagnostic => f.write_str("diagnostic"),
        }
    }
}

/// What a telemetry request call did on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestOutcome {
    /// A new request was transmitted.
    Sent,
    /// A request of the same kind was already outstanding; nothing was sent.
    Coalesced,
}

/// Snapshot of the two state variables.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct SessionStatus {
    pub state: ConnectionState,
    pub acquisition: AcquisitionMode,
}

/// Counters accumulated over the lifetime of a session.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SessionStats {
    pub connects: u64,
    pub transport_losses: u64,
    pub frames_received: u64,
    pub malformed_frames: u64,
    pub request_timeouts: u64,
    pub dropped_notifications: u64,
    pub bytes_sent: u64,
}

// ============================================================================
// Configuration
// ============================================================================

/// Timeouts, retry budget and policies of a session.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SessionConfig {
    /// Per-attempt limit for opening the link.
    pub connect_timeout: Duration,
    /// Limit for the device's connectivity handshake after opening.
    pub handshake_timeout: Duration,
    /// Attempts before the session gives up and becomes `Cancelled`.
    pub max_connect_attempts: u32,
    /// Base back-off between attempts, doubled per retry up to 8x.
    pub retry_delay: Duration,
    /// A send that does not complete in time counts as transport loss.
    pub write_timeout: Duration,
    /// Lifetime of an outstanding battery or diagnostic request.
    pub request_timeout: Duration,
    /// Depth of each notification category's queue.
    pub notification_capacity: usize,
    /// Replay values staged while disconnected after the next connect.
    pub replay_staged_parameters: bool,
    /// TCP keepalive idle time for the default connector.
    pub tcp_keepalive: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            handshake_timeout: DEFAULT_HANDSHAKE_TIMEOUT,
            max_connect_attempts: DEFAULT_MAX_CONNECT_ATTEMPTS,
            retry_delay: DEFAULT_RETRY_DELAY,
            write_timeout: DEFAULT_WRITE_TIMEOUT,
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            notification_capacity: DEFAULT_NOTIFICATION_CAPACITY,
            replay_staged_parameters: true,
            tcp_keepalive: DEFAULT_TCP_KEEPALIVE,
        }
    }
}

// ============================================================================
// Internal state
// ============================================================================

struct PendingRequest {
    id: u64,
    issued_at: Instant,
    timer: JoinHandle<()>,
}

struct Connection {
    endpoint: String,
    generation: u64,
    writer: TransportWriter,
    shutdown: Option<oneshot::Sender<()>>,
    last_activity: Instant,
}

/// A connect call in flight. Taking it out of [`Inner`] tells that call its
/// outcome no longer matters.
struct PendingConnect {
    id: u64,
    cancel: oneshot::Sender<()>,
}

struct Inner {
    state: ConnectionState,
    acquisition: AcquisitionMode,
    params: ParameterSet,
    staged: Vec<(ParameterId, f64)>,
    connection: Option<Connection>,
    pending: HashMap<RequestKind, PendingRequest>,
    connecting: Option<PendingConnect>,
    next_connect_id: u64,
    next_generation: u64,
    next_request_id: u64,
    stats: SessionStats,
}

impl Inner {
    fn owns_connect(&self, id: u64) -> bool {
        self.connecting.as_ref().map(|c| c.id) == Some(id)
    }

    fn is_live(&self, generation: u64) -> bool {
        self.connection.as_ref().map(|c| c.generation) == Some(generation)
    }

    fn require_connected(&self) -> Result<()> {
        if self.state == ConnectionState::Connected {
            Ok(())
        } else {
            Err(DriverError::NotConnected { state: self.state })
        }
    }

    fn stage(&mut self, id: ParameterId, value: f64) {
        self.staged.retain(|(staged, _)| *staged != id);
        self.staged.push((id, value));
    }
}

struct Shared {
    model: DeviceModel,
    config: SessionConfig,
    connector: Arc<dyn Connector>,
    inner: Mutex<Inner>,
    dispatcher: Dispatcher,
    status: watch::Sender<SessionStatus>,
    reader_abort: SyncMutex<Option<AbortHandle>>,
}

impl Shared {
    fn publish(&self, inner: &Inner) {
        self.status.send_replace(SessionStatus {
            state: inner.state,
            acquisition: inner.acquisition,
        });
    }

    fn notify_connectivity(&self, connected: bool, state: ConnectionState) {
        self.dispatcher.emit_connectivity(ConnectivityEvent {
            connected,
            state,
            at: Instant::now(),
        });
    }

    /// Encode and send one command over the live connection.
    ///
    /// A send failure cancels the session before the error is returned.
    async fn transmit(&self, inner: &mut Inner, command: &Command) -> Result<()> {
        let Some(conn) = inner.connection.as_mut() else {
            return Err(DriverError::NotConnected { state: inner.state });
        };
        let bytes = command.encode();
        trace!("-> {:?} ({} bytes)", command, bytes.len());
        let sent = conn.writer.send(&bytes).await;
        match sent {
            Ok(()) => {
                conn.last_activity = Instant::now();
                inner.stats.bytes_sent += bytes.len() as u64;
                Ok(())
            }
            Err(e) => {
                let reason = format!("send failed: {e}");
                self.fail_connection(inner, &reason);
                Err(DriverError::TransportLost(reason))
            }
        }
    }

    async fn apply_parameter(&self, inner: &mut Inner, id: ParameterId, value: f64) -> Result<()> {
        let command = match id {
            ParameterId::LedMask => Command::SetLedMask(value as u8),
            _ => Command::SetParameter {
                parameter: id,
                value: value as f32,
            },
        };
        self.transmit(inner, &command).await?;
        inner.params.set(id, value);
        debug!("parameter set: {}={}", id, value);
        Ok(())
    }

    fn release(&self, mut conn: Connection) {
        if let Some(tx) = conn.shutdown.take() {
            let _ = tx.send(());
        }
        self.reader_abort.lock().take();
        // Dropping the writer and stopping the reader closes the link.
        drop(conn);
    }

    fn clear_pending(&self, inner: &mut Inner) {
        for (_, pending) in inner.pending.drain() {
            pending.timer.abort();
        }
    }

    /// Failure-induced stop: `Cancelled`, acquisition forgotten, one
    /// connectivity-false notification.
    fn fail_connection(&self, inner: &mut Inner, reason: &str) {
        let Some(conn) = inner.connection.take() else {
            return;
        };
        warn!("transport lost: endpoint={}, reason={}", conn.endpoint, reason);
        self.release(conn);
        self.clear_pending(inner);
        inner.acquisition = AcquisitionMode::Idle;
        inner.state = ConnectionState::Cancelled;
        inner.stats.transport_losses += 1;
        self.publish(inner);
        self.notify_connectivity(false, ConnectionState::Cancelled);
        self.dispatcher
            .emit_fault(SessionFault::TransportLost(reason.to_string()));
    }

    /// Caller-initiated stop. Returns `false` when already disconnected.
    fn teardown(&self, inner: &mut Inner) -> bool {
        if inner.state == ConnectionState::Disconnected {
            return false;
        }
        if let Some(pending) = inner.connecting.take() {
            let _ = pending.cancel.send(());
        }
        if let Some(conn) = inner.connection.take() {
            self.release(conn);
        }
        self.clear_pending(inner);
        inner.acquisition = AcquisitionMode::Idle;
        inner.state = ConnectionState::Disconnected;
        self.publish(inner);
        self.notify_connectivity(false, ConnectionState::Disconnected);
        true
    }

    /// Reset a connect whose caller went away. Only the call that owns the
    /// `Connecting` state may do this.
    fn abandon_connect(&self, inner: &mut Inner, id: u64) {
        if !inner.owns_connect(id) {
            return;
        }
        inner.connecting = None;
        inner.state = ConnectionState::Disconnected;
        self.publish(inner);
        info!("connect abandoned by caller");
        self.notify_connectivity(false, ConnectionState::Disconnected);
    }

    /// Run the attempt budget with back-off, returning the first link that
    /// completed its handshake or the last error.
    async fn connect_attempts(
        &self,
        endpoint: &str,
        attempts: u32,
    ) -> Result<(Transport, FrameDecoder)> {
        let mut attempt = 0;
        loop {
            if attempt > 0 {
                let delay = self.config.retry_delay * (1u32 << (attempt - 1).min(3));
                warn!(
                    "retrying connection after {:?} (endpoint={}, attempt={}/{})",
                    delay,
                    endpoint,
                    attempt + 1,
                    attempts
                );
                tokio::time::sleep(delay).await;
            }

            match self.open_and_handshake(endpoint).await {
                Ok(link) => return Ok(link),
                Err(e) => {
                    warn!(
                        "connection attempt failed: endpoint={}, attempt={}/{}, error={}",
                        endpoint,
                        attempt + 1,
                        attempts,
                        e
                    );
                    attempt += 1;
                    if attempt >= attempts {
                        return Err(e);
                    }
                }
            }
        }
    }

    async fn open_and_handshake(&self, endpoint: &str) -> Result<(Transport, FrameDecoder)> {
        let link = tokio::time::timeout(self.config.connect_timeout, self.connector.open(endpoint))
            .await
            .map_err(|_| {
                DriverError::Timeout(format!(
                    "opening {endpoint} took longer than {:?}",
                    self.config.connect_timeout
                ))
            })??;

        let mut transport = Transport::new(link, self.config.write_timeout);
        transport
            .send(
                &Command::Hello {
                    version: PROTOCOL_VERSION,
                }
                .encode(),
            )
            .await?;

        let mut decoder = FrameDecoder::new();
        tokio::time::timeout(
            self.config.handshake_timeout,
            await_handshake(&mut transport, &mut decoder),
        )
        .await
        .map_err(|_| {
            DriverError::Timeout(format!(
                "no handshake from {endpoint} within {:?}",
                self.config.handshake_timeout
            ))
        })??;

        Ok((transport, decoder))
    }

    fn establish(
        self: &Arc<Self>,
        inner: &mut Inner,
        endpoint: &str,
        transport: Transport,
        decoder: FrameDecoder,
    ) {
        let generation = inner.next_generation;
        inner.next_generation += 1;

        let (reader, writer) = transport.into_split();
        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        let handle = tokio::spawn(reception_loop(
            Arc::clone(self),
            generation,
            reader,
            decoder,
            shutdown_rx,
        ));
        *self.reader_abort.lock() = Some(handle.abort_handle());

        inner.connection = Some(Connection {
            endpoint: endpoint.to_string(),
            generation,
            writer,
            shutdown: Some(shutdown_tx),
            last_activity: Instant::now(),
        });
        inner.params = self.model.defaults();
        inner.acquisition = AcquisitionMode::Idle;
        inner.state = ConnectionState::Connected;
        inner.stats.connects += 1;
        self.publish(inner);
        info!("connected: endpoint={}, model={}", endpoint, self.model.name());
        self.notify_connectivity(true, ConnectionState::Connected);
    }

    async fn replay_staged(&self, inner: &mut Inner) -> Result<()> {
        let staged = std::mem::take(&mut inner.staged);
        if staged.is_empty() {
            return Ok(());
        }
        if !self.config.replay_staged_parameters {
            info!("discarding {} staged parameter(s)", staged.len());
            return Ok(());
        }
        debug!("replaying {} staged parameter(s)", staged.len());
        for (id, value) in staged {
            self.apply_parameter(inner, id, value).await?;
        }
        Ok(())
    }

    async fn request(self: &Arc<Self>, kind: RequestKind) -> Result<RequestOutcome> {
        let mut guard = self.inner.lock().await;
        let inner = &mut *guard;
        inner.require_connected()?;

        if inner.pending.contains_key(&kind) {
            debug!("{} request already outstanding, coalescing", kind);
            return Ok(RequestOutcome::Coalesced);
        }

        self.transmit(inner, &kind.command()).await?;
        let id = inner.next_request_id;
        inner.next_request_id += 1;
        let timer = tokio::spawn(request_timer(
            Arc::downgrade(self),
            kind,
            id,
            self.config.request_timeout,
        ));
        inner.pending.insert(
            kind,
            PendingRequest {
                id,
                issued_at: Instant::now(),
                timer,
            },
        );
        Ok(RequestOutcome::Sent)
    }

    fn resolve(&self, inner: &mut Inner, kind: RequestKind) {
        if let Some(pending) = inner.pending.remove(&kind) {
            pending.timer.abort();
            debug!(
                "{} request resolved after {:?}",
                kind,
                pending.issued_at.elapsed()
            );
        }
    }

    /// Decode everything buffered and dispatch it. Returns `false` once the
    /// connection this loop belongs to is gone.
    async fn process_frames(&self, generation: u64, decoder: &mut FrameDecoder) -> bool {
        let mut guard = self.inner.lock().await;
        let inner = &mut *guard;
        if !inner.is_live(generation) {
            decoder.clear();
            return false;
        }

        loop {
            match decoder.next_inbound() {
                Decoded::NeedMoreData => return true,
                Decoded::Malformed(e) => {
                    inner.stats.malformed_frames += 1;
                    warn!("malformed frame discarded: {}", e);
                    self.dispatcher.emit_fault(SessionFault::MalformedFrame(e));
                }
                Decoded::Frame(frame) => {
                    inner.stats.frames_received += 1;
                    if let Some(conn) = inner.connection.as_mut() {
                        conn.last_activity = Instant::now();
                    }
                    if !self.apply_frame(inner, frame) {
                        return false;
                    }
                }
            }
        }
    }

    fn apply_frame(&self, inner: &mut Inner, frame: InboundFrame) -> bool {
        match frame {
            InboundFrame::AcquisitionData(data) => {
                if inner.acquisition.is_active() {
                    self.dispatcher.emit_acquisition(data);
                } else {
                    trace!("dropping A-scan received while idle");
                }
            }
            InboundFrame::BatteryTelemetry(info) => {
                self.resolve(inner, RequestKind::Battery);
                self.dispatcher.emit_battery(info);
            }
            InboundFrame::DiagnosticInfo(info) => {
                self.resolve(inner, RequestKind::Diagnostic);
                self.dispatcher.emit_diagnostic(info);
            }
            InboundFrame::ButtonEvent(event) => self.dispatcher.emit_button(event),
            InboundFrame::ConnectivityChange { connected: false } => {
                self.fail_connection(inner, "device reported disconnect");
                return false;
            }
            InboundFrame::ConnectivityChange { connected: true } => {
                debug!("repeated connectivity handshake ignored");
            }
            InboundFrame::DeviceInfo(info) => {
                debug!("unsolicited device info: serial={}", info.serial);
            }
        }
        true
    }

    async fn transport_lost(&self, generation: u64, reason: &str) {
        let mut guard = self.inner.lock().await;
        if guard.is_live(generation) {
            self.fail_connection(&mut guard, reason);
        }
    }
}

async fn await_handshake(transport: &mut Transport, decoder: &mut FrameDecoder) -> Result<()> {
    loop {
        loop {
            match decoder.next_inbound() {
                Decoded::Frame(InboundFrame::ConnectivityChange { connected: true }) => {
                    return Ok(());
                }
                Decoded::Frame(InboundFrame::ConnectivityChange { connected: false }) => {
                    return Err(DriverError::Protocol("device refused the connection".into()));
                }
                Decoded::Frame(other) => {
                    debug!("ignoring frame kind={:#04X} before handshake", other.kind());
                }
                Decoded::Malformed(e) => warn!("malformed frame during handshake: {}", e),
                Decoded::NeedMoreData => break,
            }
        }
        let chunk = transport.recv().await?;
        decoder.feed(chunk);
    }
}

async fn reception_loop(
    shared: Arc<Shared>,
    generation: u64,
    mut reader: TransportReader,
    mut decoder: FrameDecoder,
    mut shutdown: oneshot::Receiver<()>,
) {
    debug!("reception loop started: generation={}", generation);

    // Bytes that arrived together with the handshake.
    if !shared.process_frames(generation, &mut decoder).await {
        return;
    }

    loop {
        let received = tokio::select! {
            _ = &mut shutdown => None,
            chunk = reader.recv() => Some(chunk.map(|bytes| decoder.feed(bytes))),
        };
        match received {
            None => {
                debug!("reception loop stopped: generation={}", generation);
                return;
            }
            Some(Ok(())) => {
                if !shared.process_frames(generation, &mut decoder).await {
                    return;
                }
            }
            Some(Err(e)) => {
                shared.transport_lost(generation, &e.to_string()).await;
                return;
            }
        }
    }
}

async fn request_timer(shared: Weak<Shared>, kind: RequestKind, id: u64, limit: Duration) {
    tokio::time::sleep(limit).await;
    let Some(shared) = shared.upgrade() else {
        return;
    };
    let mut guard = shared.inner.lock().await;
    let inner = &mut *guard;
    if inner.pending.get(&kind).map(|p| p.id) != Some(id) {
        return;
    }
    inner.pending.remove(&kind);
    inner.stats.request_timeouts += 1;
    warn!("{} request timed out after {:?}", kind, limit);
    shared
        .dispatcher
        .emit_fault(SessionFault::RequestTimeout(kind));
}

// ============================================================================
// Session
// ============================================================================

/// Driver session for one instrument.
///
/// Commands may be issued concurrently from any task; they are serialised
/// internally. Inbound data is delivered through [`Session::events`].
///
/// Dropping the session releases the connection without further I/O.
///
/// # Example
/// ```ignore
/// let session = Session::new(DeviceModel::a1052(), SessionConfig::default());
/// let mut ascans = session.events().observe_acquisition();
///
/// session.connect("192.168.137.123").await?;
/// session.set_gain(10).await?;
/// session.start_acquisition(TransmitterMode::Single, Some(0)).await?;
/// while let Some(ascan) = ascans.recv().await {
///     println!("{} samples at {}us", ascan.sample_count, ascan.capture_time_us);
/// }
/// ```
pub struct Session {
    shared: Arc<Shared>,
}

impl Session {
    /// Session talking TCP to the instrument.
    pub fn new(model: DeviceModel, config: SessionConfig) -> Self {
        let connector = TcpConnector {
            keepalive: Some(config.tcp_keepalive),
            ..TcpConnector::default()
        };
        Self::with_connector(model, config, Arc::new(connector))
    }

    /// Session using a custom link factory.
    pub fn with_connector(
        model: DeviceModel,
        config: SessionConfig,
        connector: Arc<dyn Connector>,
    ) -> Self {
        let (status, _) = watch::channel(SessionStatus {
            state: ConnectionState::Disconnected,
            acquisition: AcquisitionMode::Idle,
        });
        let inner = Inner {
            state: ConnectionState::Disconnected,
            acquisition: AcquisitionMode::Idle,
            params: model.defaults(),
            staged: Vec::new(),
            connection: None,
            pending: HashMap::new(),
            connecting: None,
            next_connect_id: 0,
            next_generation: 0,
            next_request_id: 0,
            stats: SessionStats::default(),
        };
        let dispatcher = Dispatcher::new(config.notification_capacity);
        Self {
            shared: Arc::new(Shared {
                model,
                config,
                connector,
                inner: Mutex::new(inner),
                dispatcher,
                status,
                reader_abort: SyncMutex::new(None),
            }),
        }
    }

    // ------------------------------------------------------------------------
    // Connection
    // ------------------------------------------------------------------------

    /// Open the link and wait for the device's handshake.
    ///
    /// Legal from `Disconnected` and `Cancelled`. Failed attempts are retried
    /// with back-off; once the budget is spent the session is `Cancelled` and
    /// a connectivity-false notification is emitted.
    ///
    /// The session lock is not held while attempts run, so accessors stay
    /// responsive and [`Session::disconnect`] interrupts the attempts. Dropping
    /// the returned future before it completes leaves the session
    /// `Disconnected`.
    pub async fn connect(&self, endpoint: &str) -> Result<()> {
        let shared = &self.shared;
        let (id, mut cancelled) = {
            let mut guard = shared.inner.lock().await;
            let inner = &mut *guard;
            match inner.state {
                ConnectionState::Disconnected | ConnectionState::Cancelled => {}
                state => {
                    return Err(DriverError::InvalidState {
                        operation: "connect",
                        state,
                    })
                }
            }

            let id = inner.next_connect_id;
            inner.next_connect_id += 1;
            let (cancel, cancelled) = oneshot::channel();
            inner.connecting = Some(PendingConnect { id, cancel });
            inner.state = ConnectionState::Connecting;
            shared.publish(inner);
            (id, cancelled)
        };
        let mut abandoned = AbandonOnDrop {
            shared,
            id,
            armed: true,
        };
        info!("connecting: endpoint={}", endpoint);

        let attempts = shared.config.max_connect_attempts.max(1);
        let outcome = tokio::select! {
            _ = &mut cancelled => None,
            result = shared.connect_attempts(endpoint, attempts) => Some(result),
        };

        let mut guard = shared.inner.lock().await;
        abandoned.armed = false;
        let inner = &mut *guard;
        let outcome = match outcome {
            Some(outcome) if inner.owns_connect(id) => outcome,
            // A disconnect took over; any link opened meanwhile is dropped here.
            _ => {
                info!("connect interrupted: endpoint={}", endpoint);
                return Err(DriverError::ConnectInterrupted {
                    endpoint: endpoint.to_string(),
                });
            }
        };
        inner.connecting = None;

        match outcome {
            Ok((transport, decoder)) => {
                shared.establish(inner, endpoint, transport, decoder);
                shared.replay_staged(inner).await
            }
            Err(e) => {
                inner.state = ConnectionState::Cancelled;
                shared.publish(inner);
                shared.notify_connectivity(false, ConnectionState::Cancelled);
                Err(DriverError::ConnectCancelled {
                    endpoint: endpoint.to_string(),
                    attempts,
                    reason: e.to_string(),
                })
            }
        }
    }

    /// Stop any acquisition, say goodbye and close the link.
    ///
    /// Always ends in `Disconnected`; a no-op when already there. A connect
    /// still running its attempts is interrupted and fails with
    /// `ConnectInterrupted`.
    pub async fn disconnect(&self) {
        let mut guard = self.shared.inner.lock().await;
        let inner = &mut *guard;
        if inner.state == ConnectionState::Disconnected {
            return;
        }

        if let Some(conn) = inner.connection.as_mut() {
            // Best effort: the device may already be gone.
            if inner.acquisition.is_active() {
                let _ = conn.writer.send(&Command::StopAcquisition.encode()).await;
            }
            let _ = conn.writer.send(&Command::Goodbye.encode()).await;
            let _ = conn.writer.close().await;
        }

        let endpoint = inner.connection.as_ref().map(|c| c.endpoint.clone());
        self.shared.teardown(inner);
        info!("disconnected: endpoint={}", endpoint.as_deref().unwrap_or("-"));
    }

    // ------------------------------------------------------------------------
    // Configuration commands
    // ------------------------------------------------------------------------

    /// Validate and send a parameter, returning the accepted value.
    ///
    /// Out-of-range values fail with a validation error and nothing is sent.
    /// While not connected the value is staged and `NotConnected` is returned.
    pub async fn set_parameter(&self, id: ParameterId, value: f64) -> Result<f64> {
        let value = self.shared.model.validate(id, value)?;

        let mut guard = self.shared.inner.lock().await;
        let inner = &mut *guard;
        if inner.state != ConnectionState::Connected {
            inner.stage(id, value);
            debug!("parameter staged while {}: {}={}", inner.state, id, value);
            return Err(DriverError::NotConnected { state: inner.state });
        }
        self.shared.apply_parameter(inner, id, value).await?;
        Ok(value)
    }

    /// [`Session::set_parameter`] by parameter name, e.g. `"gain"`.
    pub async fn set_parameter_named(&self, name: &str, value: f64) -> Result<f64> {
        let id: ParameterId = name.parse()?;
        self.set_parameter(id, value).await
    }

    /// Receiver gain in dB (0-36).
    pub async fn set_gain(&self, db: u8) -> Result<()> {
        self.set_parameter(ParameterId::Gain, db as f64).await.map(|_| ())
    }

    /// Operating frequency in kHz (10-100).
    pub async fn set_frequency(&self, khz: f64) -> Result<()> {
        self.set_parameter(ParameterId::Frequency, khz).await.map(|_| ())
    }

    /// A-scans averaged per capture (1-16).
    pub async fn set_averaging(&self, count: u8) -> Result<()> {
        self.set_parameter(ParameterId::Averaging, count as f64)
            .await
            .map(|_| ())
    }

    /// Pulse repetition rate in Hz (0-100, 0 = unlimited).
    pub async fn set_pulse_repetition_rate(&self, hz: f64) -> Result<()> {
        self.set_parameter(ParameterId::PulseRepetitionRate, hz)
            .await
            .map(|_| ())
    }

    /// Periods per transmitted burst (0.5-10).
    pub async fn set_burst_periods(&self, periods: f64) -> Result<()> {
        self.set_parameter(ParameterId::BurstPeriods, periods)
            .await
            .map(|_| ())
    }

    /// Element used by single-transmitter acquisitions.
    pub async fn set_single_transmitter(&self, index: u8) -> Result<()> {
        self.set_parameter(ParameterId::SingleTransmitter, index as f64)
            .await
            .map(|_| ())
    }

    /// Column used by quadro-transmitter acquisitions.
    pub async fn set_quadro_transmitter(&self, column: u8) -> Result<()> {
        self.set_parameter(ParameterId::QuadroTransmitter, column as f64)
            .await
            .map(|_| ())
    }

    /// Light the LEDs in `mask`. Fire-and-forget.
    pub async fn set_led_mask(&self, mask: u8) -> Result<()> {
        self.set_parameter(ParameterId::LedMask, mask as f64)
            .await
            .map(|_| ())
    }

    // ------------------------------------------------------------------------
    // Acquisition
    // ------------------------------------------------------------------------

    /// Start streaming A-scans with the given transmitter arrangement.
    ///
    /// `transmitter` overrides the selector for this mode; without it the last
    /// value set is used, or element 0 unless the model demands a selection.
    /// Any active acquisition is stopped first. Data arrives through
    /// [`Dispatcher::observe_acquisition`].
    pub async fn start_acquisition(
        &self,
        mode: TransmitterMode,
        transmitter: Option<u8>,
    ) -> Result<()> {
        let shared = &self.shared;
        let mut guard = shared.inner.lock().await;
        let inner = &mut *guard;
        inner.require_connected()?;

        let parameter = mode.parameter();
        let selector = match transmitter {
            Some(t) => shared.model.validate(parameter, t as f64)?,
            None => match inner.params.get(parameter) {
                Some(v) => v,
                None if shared.model.requires_explicit_transmitter() => {
                    return Err(DriverError::TransmitterNotSelected(mode));
                }
                None => 0.0,
            },
        };

        if inner.acquisition.is_active() {
            debug!(
                "stopping {:?} before starting {} acquisition",
                inner.acquisition, mode
            );
            shared
                .transmit(inner, &Command::StopAcquisition)
                .await?;
            inner.acquisition = AcquisitionMode::Idle;
            shared.publish(inner);
        }

        shared
            .transmit(
                inner,
                &Command::StartAcquisition {
                    mode,
                    transmitter: selector as u8,
                },
            )
            .await?;
        inner.params.set(parameter, selector);
        inner.acquisition = mode.into();
        shared.publish(inner);
        info!("acquisition started: mode={}, transmitter={}", mode, selector);
        Ok(())
    }

    /// Stop streaming. A no-op when no acquisition is active.
    pub async fn stop_acquisition(&self) -> Result<()> {
        let shared = &self.shared;
        let mut guard = shared.inner.lock().await;
        let inner = &mut *guard;
        if !inner.acquisition.is_active() {
            return Ok(());
        }
        shared
            .transmit(inner, &Command::StopAcquisition)
            .await?;
        inner.acquisition = AcquisitionMode::Idle;
        shared.publish(inner);
        info!("acquisition stopped");
        Ok(())
    }

    // ------------------------------------------------------------------------
    // Telemetry
    // ------------------------------------------------------------------------

    /// Ask for battery telemetry; the reply arrives as a battery notification.
    ///
    /// At most one battery request is outstanding; overlapping calls coalesce.
    pub async fn request_battery_info(&self) -> Result<RequestOutcome> {
        self.shared.request(RequestKind::Battery).await
    }

    /// Ask for diagnostic info; the reply arrives as a diagnostic notification.
    pub async fn request_diagnostic_info(&self) -> Result<RequestOutcome> {
        self.shared.request(RequestKind::Diagnostic).await
    }

    // ------------------------------------------------------------------------
    // Accessors
    // ------------------------------------------------------------------------

    /// Notification observers.
    pub fn events(&self) -> &Dispatcher {
        &self.shared.dispatcher
    }

    pub fn model(&self) -> &DeviceModel {
        &self.shared.model
    }

    pub fn config(&self) -> &SessionConfig {
        &self.shared.config
    }

    pub fn status(&self) -> SessionStatus {
        *self.shared.status.borrow()
    }

    pub fn state(&self) -> ConnectionState {
        self.status().state
    }

    pub fn acquisition_mode(&self) -> AcquisitionMode {
        self.status().acquisition
    }

    /// Follow state transitions as they happen.
    pub fn watch_status(&self) -> watch::Receiver<SessionStatus> {
        self.shared.status.subscribe()
    }

    /// Values currently applied to the device (or its defaults when offline).
    pub async fn parameters(&self) -> ParameterSet {
        self.shared.inner.lock().await.params.clone()
    }

    /// Values waiting for the next connect, in the order they were set.
    pub async fn staged_parameters(&self) -> Vec<(ParameterId, f64)> {
        self.shared.inner.lock().await.staged.clone()
    }

    pub async fn endpoint(&self) -> Option<String> {
        let inner = self.shared.inner.lock().await;
        inner.connection.as_ref().map(|c| c.endpoint.clone())
    }

    /// Time of the last frame sent or received on the live connection.
    pub async fn last_activity(&self) -> Option<Instant> {
        let inner = self.shared.inner.lock().await;
        inner.connection.as_ref().map(|c| c.last_activity)
    }

    /// Telemetry requests still waiting for a reply.
    pub async fn pending_requests(&self) -> Vec<RequestKind> {
        let inner = self.shared.inner.lock().await;
        inner.pending.keys().copied().collect()
    }

    pub async fn stats(&self) -> SessionStats {
        let mut stats = self.shared.inner.lock().await.stats.clone();
        stats.dropped_notifications = self.shared.dispatcher.dropped();
        stats
    }
}

/// Puts a `Connecting` session back to `Disconnected` when the connect future
/// is dropped before it settles.
struct AbandonOnDrop<'a> {
    shared: &'a Arc<Shared>,
    id: u64,
    armed: bool,
}

impl Drop for AbandonOnDrop<'_> {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        let id = self.id;
        match self.shared.inner.try_lock() {
            Ok(mut guard) => self.shared.abandon_connect(&mut guard, id),
            Err(_) => {
                // Finish the reset once the current holder lets go.
                let shared = Arc::clone(self.shared);
                if let Ok(handle) = tokio::runtime::Handle::try_current() {
                    handle.spawn(async move {
                        let mut guard = shared.inner.lock().await;
                        shared.abandon_connect(&mut guard, id);
                    });
                }
            }
        }
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        match self.shared.inner.try_lock() {
            Ok(mut guard) => {
                if self.shared.teardown(&mut guard) {
                    info!("session dropped, connection released");
                }
            }
            Err(_) => {
                // A background task holds the lock; stop the reader so the link
                // closes once that task lets go of the shared state.
                warn!("session dropped while busy, aborting reception loop");
                if let Some(handle) = self.shared.reader_abort.lock().take() {
                    handle.abort();
                }
            }
        }
    }
}

//! Event dispatcher.
//!
//! Each notification category has at most one observer, fed through its own
//! bounded queue. The reception loop only ever `try_send`s into these queues,
//! so a slow observer delays its own category and never the decoding of other
//! frames. When a queue is full the new notification is dropped and counted.
//! Within a category, notifications arrive in decode order; across categories
//! there is no ordering guarantee.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

use log::{debug, warn};
use parking_lot::Mutex;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::task::JoinHandle;

use crate::codec::{AscanData, BatteryInfo, ButtonEvent, DiagnosticInfo};
use crate::errors::DecodeError;
use crate::session::{ConnectionState, RequestKind};

/// Drop warnings after the first are rate limited to one per this many.
const DROP_WARN_EVERY: u64 = 100;

/// Notification categories, one observer each.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Category {
    Connectivity,
    Acquisition,
    Battery,
    Diagnostic,
    Button,
    Fault,
}

impl fmt::Display for Category {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Category::Connectivity => "connectivity",
            Category::Acquisition => "acquisition",
            Category::Battery => "battery",
            Category::Diagnostic => "diagnostic",
            Category::Button => "button",
            Category::Fault => "fault",
        };
        f.write_str(name)
    }
}

/// The session went up or down.
///
/// `state` tells a caller-initiated disconnect (`Disconnected`) apart from a
/// session that gave up (`Cancelled`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectivityEvent {
    pub connected: bool,
    pub state: ConnectionState,
    pub at: Instant,
}

/// Non-fatal conditions reported while a session runs.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionFault {
    /// Bytes were discarded while decoding; the stream was resynchronised.
    MalformedFrame(DecodeError),
    /// A telemetry request got no reply in time; only that request was cleared.
    RequestTimeout(RequestKind),
    /// The link failed; the session is now `Cancelled`.
    TransportLost(String),
}

enum Delivery {
    Delivered,
    NoObserver,
    Dropped,
}

struct Slot<T> {
    tx: Mutex<Option<mpsc::Sender<T>>>,
}

impl<T> Slot<T> {
    fn new() -> Self {
        Self {
            tx: Mutex::new(None),
        }
    }

    fn register(&self, capacity: usize) -> mpsc::Receiver<T> {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        // Replacing the sender closes the previous observer's queue.
        *self.tx.lock() = Some(tx);
        rx
    }

    fn unregister(&self) {
        self.tx.lock().take();
    }

    fn deliver(&self, value: T) -> Delivery {
        let mut guard = self.tx.lock();
        let Some(tx) = guard.as_ref() else {
            return Delivery::NoObserver;
        };
        match tx.try_send(value) {
            Ok(()) => Delivery::Delivered,
            Err(TrySendError::Full(_)) => Delivery::Dropped,
            Err(TrySendError::Closed(_)) => {
                *guard = None;
                Delivery::NoObserver
            }
        }
    }
}

/// Routes decoded notifications to registered observers.
pub struct Dispatcher {
    capacity: usize,
    connectivity: Slot<ConnectivityEvent>,
    acquisition: Slot<AscanData>,
    battery: Slot<BatteryInfo>,
    diagnostic: Slot<DiagnosticInfo>,
    button: Slot<ButtonEvent>,
    faults: Slot<SessionFault>,
    dropped: AtomicU64,
}

impl Dispatcher {
    /// `capacity` bounds each category's queue.
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            connectivity: Slot::new(),
            acquisition: Slot::new(),
            battery: Slot::new(),
            diagnostic: Slot::new(),
            button: Slot::new(),
            faults: Slot::new(),
            dropped: AtomicU64::new(0),
        }
    }

    // ------------------------------------------------------------------------
    // Registration
    // ------------------------------------------------------------------------

    /// Register the connectivity observer, replacing any previous one.
    pub fn observe_connectivity(&self) -> mpsc::Receiver<ConnectivityEvent> {
        self.connectivity.register(self.capacity)
    }

    /// Register the A-scan observer, replacing any previous one.
    pub fn observe_acquisition(&self) -> mpsc::Receiver<AscanData> {
        self.acquisition.register(self.capacity)
    }

    pub fn observe_battery(&self) -> mpsc::Receiver<BatteryInfo> {
        self.battery.register(self.capacity)
    }

    pub fn observe_diagnostic(&self) -> mpsc::Receiver<DiagnosticInfo> {
        self.diagnostic.register(self.capacity)
    }

    pub fn observe_button(&self) -> mpsc::Receiver<ButtonEvent> {
        self.button.register(self.capacity)
    }

    pub fn observe_faults(&self) -> mpsc::Receiver<SessionFault> {
        self.faults.register(self.capacity)
    }

    /// Run `handler` on a task for every connectivity change.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn on_connectivity<F>(&self, handler: F) -> JoinHandle<()>
    where
        F: FnMut(ConnectivityEvent) + Send + 'static,
    {
        spawn_observer(Category::Connectivity, self.observe_connectivity(), handler)
    }

    /// Run `handler` on a task for every A-scan.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn on_acquisition<F>(&self, handler: F) -> JoinHandle<()>
    where
        F: FnMut(AscanData) + Send + 'static,
    {
        spawn_observer(Category::Acquisition, self.observe_acquisition(), handler)
    }

    pub fn on_battery<F>(&self, handler: F) -> JoinHandle<()>
    where
        F: FnMut(BatteryInfo) + Send + 'static,
    {
        spawn_observer(Category::Battery, self.observe_battery(), handler)
    }

    pub fn on_diagnostic<F>(&self, handler: F) -> JoinHandle<()>
    where
        F: FnMut(DiagnosticInfo) + Send + 'static,
    {
        spawn_observer(Category::Diagnostic, self.observe_diagnostic(), handler)
    }

    pub fn on_button<F>(&self, handler: F) -> JoinHandle<()>
    where
        F: FnMut(ButtonEvent) + Send + 'static,
    {
        spawn_observer(Category::Button, self.observe_button(), handler)
    }

    pub fn on_fault<F>(&self, handler: F) -> JoinHandle<()>
    where
        F: FnMut(SessionFault) + Send + 'static,
    {
        spawn_observer(Category::Fault, self.observe_faults(), handler)
    }

    /// Remove the observer of `category`; its queue ends after draining.
    pub fn unregister(&self, category: Category) {
        match category {
            Category::Connectivity => self.connectivity.unregister(),
            Category::Acquisition => self.acquisition.unregister(),
            Category::Battery => self.battery.unregister(),
            Category::Diagnostic => self.diagnostic.unregister(),
            Category::Button => self.button.unregister(),
            Category::Fault => self.faults.unregister(),
        }
    }

    /// Notifications dropped because an observer's queue was full.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    // ------------------------------------------------------------------------
    // Emission (session side)
    // ------------------------------------------------------------------------

    pub(crate) fn emit_connectivity(&self, event: ConnectivityEvent) {
        let outcome = self.connectivity.deliver(event);
        self.account(Category::Connectivity, outcome);
    }

    pub(crate) fn emit_acquisition(&self, data: AscanData) {
        let outcome = self.acquisition.deliver(data);
        self.account(Category::Acquisition, outcome);
    }

    pub(crate) fn emit_battery(&self, info: BatteryInfo) {
        let outcome = self.battery.deliver(info);
        self.account(Category::Battery, outcome);
    }

    pub(crate) fn emit_diagnostic(&self, info: DiagnosticInfo) {
        let outcome = self.diagnostic.deliver(info);
        self.account(Category::Diagnostic, outcome);
    }

    pub(crate) fn emit_button(&self, event: ButtonEvent) {
        let outcome = self.button.deliver(event);
        self.account(Category::Button, outcome);
    }

    pub(crate) fn emit_fault(&self, fault: SessionFault) {
        let outcome = self.faults.deliver(fault);
        self.account(Category::Fault, outcome);
    }

    fn account(&self, category: Category, outcome: Delivery) {
        match outcome {
            Delivery::Delivered | Delivery::NoObserver => {}
            Delivery::Dropped => {
                let n = self.dropped.fetch_add(1, Ordering::Relaxed) + 1;
                if n == 1 || n % DROP_WARN_EVERY == 0 {
                    warn!(
                        "{} observer is not keeping up, notification dropped (total dropped: {})",
                        category, n
                    );
                }
            }
        }
    }
}

fn spawn_observer<T, F>(category: Category, mut rx: mpsc::Receiver<T>, mut handler: F) -> JoinHandle<()>
where
    T: Send + 'static,
    F: FnMut(T) + Send + 'static,
{
    tokio::spawn(async move {
        while let Some(value) = rx.recv().await {
            handler(value);
        }
        debug!("{} observer finished", category);
    })
}

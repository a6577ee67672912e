//! Client-side driver for A10x-family ultrasonic instruments.
//!
//! The instrument is reached over TCP and speaks a framed binary protocol.
//! A [`Session`] owns one connection: it validates and applies acquisition
//! parameters, starts and stops A-scan streaming, requests battery and
//! diagnostic telemetry, and delivers everything the device sends through
//! per-category observer queues on its [`Dispatcher`].
//!
//! # Timing
//!
//! Every inbound notification carries the host-side `received_at` instant at
//! which its frame was decoded. A-scans additionally carry the device's own
//! capture timestamp (`capture_time_us`), which is the one to use when
//! reconstructing acquisition timing; network latency only affects the former.
//!
//! # Layers
//!
//! 1. [`transport`]: opens links and moves bytes with timeouts.
//! 2. [`codec`]: frames, checksums and payload layouts.
//! 3. [`params`]: the device model's parameter table and validation.
//! 4. [`session`]: connection lifecycle, acquisition state and requests.
//! 5. [`dispatcher`]: observer registration and non-blocking delivery.

pub mod codec;
pub mod dispatcher;
mod errors;
pub mod identity;
pub mod logging;
pub mod params;
pub mod session;
pub mod transport;

#[cfg(feature = "python")]
mod python;

pub use codec::{AscanData, BatteryInfo, ButtonEvent, DiagnosticInfo, InboundFrame};
pub use dispatcher::{Category, ConnectivityEvent, Dispatcher, SessionFault};
pub use errors::*;
pub use identity::{DeviceInfo, DeviceProbe, FirmwareVersion, MacAddress};
pub use params::{DeviceModel, ParameterId, ParameterSet, ParameterSpec, TransmitterMode};
pub use session::{
    AcquisitionMode, ConnectionState, RequestKind, RequestOutcome, Session, SessionConfig,
    SessionStats, SessionStatus,
};
pub use transport::{BoxedLink, Connector, Link, TcpConnector, DEFAULT_PORT};

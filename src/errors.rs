use std::io;
use thiserror::Error;

use crate::params::{ParameterId, TransmitterMode};
use crate::session::ConnectionState;

#[derive(Debug, Error)]
pub enum DriverError {
    #[error("io error: {0}")]
    Io(#[from] io::Error),
    #[error("invalid parameter: {0}")]
    Validation(#[from] ValidationError),
    #[error("not connected (session is {state})")]
    NotConnected { state: ConnectionState },
    #[error("{operation} is not allowed while {state}")]
    InvalidState {
        operation: &'static str,
        state: ConnectionState,
    },
    #[error("transport lost: {0}")]
    TransportLost(String),
    #[error("connect to {endpoint} cancelled after {attempts} attempt(s): {reason}")]
    ConnectCancelled {
        endpoint: String,
        attempts: u32,
        reason: String,
    },
    #[error("connect to {endpoint} interrupted by disconnect")]
    ConnectInterrupted { endpoint: String },
    #[error("no {0} transmitter selected and the device model requires one")]
    TransmitterNotSelected(TransmitterMode),
    #[error("timeout: {0}")]
    Timeout(String),
    #[error("malformed frame: {0}")]
    Malformed(#[from] DecodeError),
    #[error("protocol error: {0}")]
    Protocol(String),
}

/// Rejection raised by the parameter table before anything reaches the wire.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ValidationError {
    #[error("{parameter} = {value} is outside [{min}, {max}]")]
    OutOfRange {
        parameter: ParameterId,
        value: f64,
        min: f64,
        max: f64,
    },
    #[error("{parameter} must be a whole number, got {value}")]
    NotIntegral { parameter: ParameterId, value: f64 },
    #[error("unknown parameter: {0}")]
    UnknownParameter(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DecodeError {
    #[error("skipped {0} byte(s) of garbage before sync")]
    Garbage(usize),
    #[error("CRC mismatch (received {received:#04X}, calculated {calculated:#04X})")]
    Crc { received: u8, calculated: u8 },
    #[error("payload length {0} exceeds the frame limit")]
    Oversize(usize),
    #[error("unknown frame kind {0:#04X}")]
    UnknownKind(u8),
    #[error("bad payload for frame kind {kind:#04X}: {reason}")]
    Payload { kind: u8, reason: String },
}

pub type Result<T> = std::result::Result<T, DriverError>;

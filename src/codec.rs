//! Frame codec for the A10x binary protocol.
//!
//! Both directions share one framing:
//!
//! ```text
//! +------+------+--------------+-----------------+-------+
//! | 0xA5 | kind | length u16LE | payload[length] | crc8  |
//! +------+------+--------------+-----------------+-------+
//! ```
//!
//! The CRC covers `kind`, `length` and `payload`. Encoding is pure; decoding
//! goes through [`FrameDecoder`], which accumulates partial reads and
//! resynchronises on the next sync byte after any corruption.

use std::time::Instant;

use log::trace;
use serde::Serialize;

use crate::errors::DecodeError;
use crate::identity::{DeviceInfo, FirmwareVersion, MacAddress};
use crate::params::{ParameterId, TransmitterMode};

// ============================================================================
// Constants
// ============================================================================

/// First byte of every frame.
pub const SYNC: u8 = 0xA5;

/// Sync, kind and the two length bytes.
pub const HEADER_LEN: usize = 4;

/// Trailing CRC byte.
const TRAILER_LEN: usize = 1;

/// Largest payload either side may send.
pub const MAX_PAYLOAD_LEN: usize = 32 * 1024;

/// Capture time and sample count precede the samples of an A-scan.
const ASCAN_HEADER_LEN: usize = 10;

/// Most samples one A-scan frame can carry.
pub const MAX_ASCAN_SAMPLES: usize = (MAX_PAYLOAD_LEN - ASCAN_HEADER_LEN) / 2;

/// Version announced in the Hello command.
pub const PROTOCOL_VERSION: u8 = 1;

// Host -> device
const CMD_HELLO: u8 = 0x01;
const CMD_GOODBYE: u8 = 0x02;
const CMD_SET_PARAMETER: u8 = 0x10;
const CMD_START_ACQUISITION: u8 = 0x20;
const CMD_STOP_ACQUISITION: u8 = 0x21;
const CMD_REQUEST_BATTERY: u8 = 0x30;
const CMD_REQUEST_DIAGNOSTIC: u8 = 0x31;
const CMD_SET_LED_MASK: u8 = 0x40;
const CMD_IDENTIFY: u8 = 0x50;

// Device -> host
const FRAME_CONNECTIVITY: u8 = 0x81;
const FRAME_ACQUISITION: u8 = 0x82;
const FRAME_BATTERY: u8 = 0x83;
const FRAME_DIAGNOSTIC: u8 = 0x84;
const FRAME_BUTTON: u8 = 0x85;
const FRAME_DEVICE_INFO: u8 = 0x86;

const BATTERY_MASTER_CHARGING: u8 = 0b001;
const BATTERY_AUX_CHARGING: u8 = 0b010;
const BATTERY_AUX_PRESENT: u8 = 0b100;

// ============================================================================
// Framing
// ============================================================================

/// CRC-8, polynomial 0x07, MSB first.
pub fn crc8(data: &[u8]) -> u8 {
    let mut crc = 0u8;
    for &byte in data {
        crc ^= byte;
        for _ in 0..8 {
            crc = if crc & 0x80 != 0 {
                (crc << 1) ^ 0x07
            } else {
                crc << 1
            };
        }
    }
    crc
}

/// Wrap `payload` into a complete frame of the given kind.
///
/// Callers must keep payloads within [`MAX_PAYLOAD_LEN`]; every encoder in
/// this module caps its variable-length fields to fit. Debug builds assert
/// this, release builds cut the payload so the length field stays valid.
pub fn encode_frame(kind: u8, payload: &[u8]) -> Vec<u8> {
    debug_assert!(
        payload.len() <= MAX_PAYLOAD_LEN,
        "payload of {} bytes exceeds the frame limit",
        payload.len()
    );
    let payload = &payload[..payload.len().min(MAX_PAYLOAD_LEN)];
    let mut out = Vec::with_capacity(HEADER_LEN + payload.len() + TRAILER_LEN);
    out.push(SYNC);
    out.push(kind);
    out.extend_from_slice(&(payload.len() as u16).to_le_bytes());
    out.extend_from_slice(payload);
    let crc = crc8(&out[1..]);
    out.push(crc);
    out
}

/// A CRC-checked frame whose payload has not been interpreted yet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawFrame {
    pub kind: u8,
    pub payload: Vec<u8>,
}

/// Outcome of one decode step.
#[derive(Debug, Clone, PartialEq)]
pub enum Decoded<T> {
    Frame(T),
    /// The buffer holds at most a partial frame.
    NeedMoreData,
    /// Bytes were discarded; decoding can continue.
    Malformed(DecodeError),
}

/// Accumulates inbound bytes and yields frames once complete.
#[derive(Debug, Default)]
pub struct FrameDecoder {
    buffer: Vec<u8>,
}

impl FrameDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a chunk read from the transport.
    pub fn feed(&mut self, chunk: &[u8]) {
        self.buffer.extend_from_slice(chunk);
    }

    /// Number of bytes waiting for the rest of their frame.
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    /// Drop any partial frame.
    pub fn clear(&mut self) {
        self.buffer.clear();
    }

    /// Extract the next CRC-valid frame.
    pub fn next_raw(&mut self) -> Decoded<RawFrame> {
        if self.buffer.is_empty() {
            return Decoded::NeedMoreData;
        }

        if self.buffer[0] != SYNC {
            let skip = self
                .buffer
                .iter()
                .position(|&b| b == SYNC)
                .unwrap_or(self.buffer.len());
            self.buffer.drain(..skip);
            return Decoded::Malformed(DecodeError::Garbage(skip));
        }

        if self.buffer.len() < HEADER_LEN {
            return Decoded::NeedMoreData;
        }

        let kind = self.buffer[1];
        let len = u16::from_le_bytes([self.buffer[2], self.buffer[3]]) as usize;
        if len > MAX_PAYLOAD_LEN {
            self.buffer.drain(..1);
            return Decoded::Malformed(DecodeError::Oversize(len));
        }

        let total = HEADER_LEN + len + TRAILER_LEN;
        if self.buffer.len() < total {
            return Decoded::NeedMoreData;
        }

        let received = self.buffer[total - 1];
        let calculated = crc8(&self.buffer[1..total - 1]);
        if received != calculated {
            // The sync byte may have been payload data; rescan from the next byte.
            self.buffer.drain(..1);
            return Decoded::Malformed(DecodeError::Crc {
                received,
                calculated,
            });
        }

        let payload = self.buffer[HEADER_LEN..HEADER_LEN + len].to_vec();
        self.buffer.drain(..total);
        trace!("decoded frame kind={:#04X} len={}", kind, len);
        Decoded::Frame(RawFrame { kind, payload })
    }

    /// Extract and classify the next inbound frame, stamping it with the
    /// decode time.
    pub fn next_inbound(&mut self) -> Decoded<InboundFrame> {
        match self.next_raw() {
            Decoded::Frame(raw) => match InboundFrame::from_raw(&raw, Instant::now()) {
                Ok(frame) => Decoded::Frame(frame),
                Err(e) => Decoded::Malformed(e),
            },
            Decoded::NeedMoreData => Decoded::NeedMoreData,
            Decoded::Malformed(e) => Decoded::Malformed(e),
        }
    }
}

// ============================================================================
// Payload helpers
// ============================================================================

struct PayloadReader<'a> {
    kind: u8,
    data: &'a [u8],
    pos: usize,
}

impl<'a> PayloadReader<'a> {
    fn new(raw: &'a RawFrame) -> Self {
        Self {
            kind: raw.kind,
            data: &raw.payload,
            pos: 0,
        }
    }

    fn error(&self, reason: impl Into<String>) -> DecodeError {
        DecodeError::Payload {
            kind: self.kind,
            reason: reason.into(),
        }
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8], DecodeError> {
        if self.remaining() < n {
            return Err(self.error(format!(
                "truncated: needed {} more byte(s) at offset {}",
                n, self.pos
            )));
        }
        let slice = &self.data[self.pos..self.pos + n];
        self.pos += n;
        Ok(slice)
    }

    fn remaining(&self) -> usize {
        self.data.len() - self.pos
    }

    fn u8(&mut self) -> Result<u8, DecodeError> {
        Ok(self.take(1)?[0])
    }

    fn u16(&mut self) -> Result<u16, DecodeError> {
        let b = self.take(2)?;
        Ok(u16::from_le_bytes([b[0], b[1]]))
    }

    fn i16(&mut self) -> Result<i16, DecodeError> {
        let b = self.take(2)?;
        Ok(i16::from_le_bytes([b[0], b[1]]))
    }

    fn u32(&mut self) -> Result<u32, DecodeError> {
        let b = self.take(4)?;
        Ok(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    fn u64(&mut self) -> Result<u64, DecodeError> {
        let mut buf = [0u8; 8];
        buf.copy_from_slice(self.take(8)?);
        Ok(u64::from_le_bytes(buf))
    }

    fn f32(&mut self) -> Result<f32, DecodeError> {
        let b = self.take(4)?;
        Ok(f32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    fn firmware(&mut self) -> Result<FirmwareVersion, DecodeError> {
        let b = self.take(3)?;
        Ok(FirmwareVersion::new(b[0], b[1], b[2]))
    }

    fn finish(self) -> Result<(), DecodeError> {
        if self.remaining() != 0 {
            return Err(self.error(format!("{} trailing byte(s)", self.remaining())));
        }
        Ok(())
    }
}

// ============================================================================
// Outbound commands
// ============================================================================

/// A command sent from the host to the instrument.
#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    Hello { version: u8 },
    Goodbye,
    SetParameter { parameter: ParameterId, value: f32 },
    StartAcquisition { mode: TransmitterMode, transmitter: u8 },
    StopAcquisition,
    RequestBattery,
    RequestDiagnostic,
    SetLedMask(u8),
    Identify,
}

impl Command {
    pub fn kind(&self) -> u8 {
        match self {
            Command::Hello { .. } => CMD_HELLO,
            Command::Goodbye => CMD_GOODBYE,
            Command::SetParameter { .. } => CMD_SET_PARAMETER,
            Command::StartAcquisition { .. } => CMD_START_ACQUISITION,
            Command::StopAcquisition => CMD_STOP_ACQUISITION,
            Command::RequestBattery => CMD_REQUEST_BATTERY,
            Command::RequestDiagnostic => CMD_REQUEST_DIAGNOSTIC,
            Command::SetLedMask(_) => CMD_SET_LED_MASK,
            Command::Identify => CMD_IDENTIFY,
        }
    }

    /// Serialize into a complete frame.
    pub fn encode(&self) -> Vec<u8> {
        let payload = match self {
            Command::Hello { version } => vec![*version],
            Command::SetParameter { parameter, value } => {
                let mut p = Vec::with_capacity(5);
                p.push(parameter.code());
                p.extend_from_slice(&value.to_le_bytes());
                p
            }
            Command::StartAcquisition { mode, transmitter } => {
                vec![mode.wire_code(), *transmitter]
            }
            Command::SetLedMask(mask) => vec![*mask],
            Command::Goodbye
            | Command::StopAcquisition
            | Command::RequestBattery
            | Command::RequestDiagnostic
            | Command::Identify => Vec::new(),
        };
        encode_frame(self.kind(), &payload)
    }

    /// Interpret a raw frame as a command (device side of the protocol).
    pub fn from_raw(raw: &RawFrame) -> Result<Self, DecodeError> {
        let mut r = PayloadReader::new(raw);
        let command = match raw.kind {
            CMD_HELLO => Command::Hello { version: r.u8()? },
            CMD_GOODBYE => Command::Goodbye,
            CMD_SET_PARAMETER => {
                let code = r.u8()?;
                let parameter = ParameterId::from_code(code)
                    .ok_or_else(|| r.error(format!("unknown parameter code {code}")))?;
                Command::SetParameter {
                    parameter,
                    value: r.f32()?,
                }
            }
            CMD_START_ACQUISITION => {
                let code = r.u8()?;
                let mode = TransmitterMode::from_wire_code(code)
                    .ok_or_else(|| r.error(format!("unknown transmitter mode {code}")))?;
                Command::StartAcquisition {
                    mode,
                    transmitter: r.u8()?,
                }
            }
            CMD_STOP_ACQUISITION => Command::StopAcquisition,
            CMD_REQUEST_BATTERY => Command::RequestBattery,
            CMD_REQUEST_DIAGNOSTIC => Command::RequestDiagnostic,
            CMD_SET_LED_MASK => Command::SetLedMask(r.u8()?),
            CMD_IDENTIFY => Command::Identify,
            other => return Err(DecodeError::UnknownKind(other)),
        };
        r.finish()?;
        Ok(command)
    }
}

// ============================================================================
// Inbound frames
// ============================================================================

/// One A-scan capture.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AscanData {
    pub samples: Vec<i16>,
    /// Always equal to `samples.len()`.
    pub sample_count: usize,
    /// Device capture time in microseconds.
    pub capture_time_us: u64,
    #[serde(skip)]
    pub received_at: Instant,
}

impl AscanData {
    pub fn new(capture_time_us: u64, samples: Vec<i16>) -> Self {
        Self {
            sample_count: samples.len(),
            samples,
            capture_time_us,
            received_at: Instant::now(),
        }
    }
}

/// Battery levels of the master and the optional auxiliary pack.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BatteryInfo {
    /// Charge in percent.
    pub master_level: u8,
    pub aux_level: u8,
    pub master_charging: bool,
    pub aux_charging: bool,
    pub aux_present: bool,
    pub master_millivolts: u16,
    pub aux_millivolts: u16,
    #[serde(skip)]
    pub received_at: Instant,
}

/// Self-test and housekeeping values reported by the device.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DiagnosticInfo {
    /// Board temperature in hundredths of a degree Celsius.
    pub temperature_centi_c: i16,
    pub uptime_secs: u32,
    pub firmware: FirmwareVersion,
    /// Device-specific fault bits, 0 when healthy.
    pub error_flags: u16,
    #[serde(skip)]
    pub received_at: Instant,
}

impl DiagnosticInfo {
    pub fn temperature_celsius(&self) -> f32 {
        self.temperature_centi_c as f32 / 100.0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ButtonEvent {
    pub received_at: Instant,
}

/// Any frame the instrument may send.
#[derive(Debug, Clone, PartialEq)]
pub enum InboundFrame {
    AcquisitionData(AscanData),
    BatteryTelemetry(BatteryInfo),
    DiagnosticInfo(DiagnosticInfo),
    ButtonEvent(ButtonEvent),
    ConnectivityChange { connected: bool },
    /// Reply to an Identify probe.
    DeviceInfo(DeviceInfo),
}

impl InboundFrame {
    pub fn kind(&self) -> u8 {
        match self {
            InboundFrame::AcquisitionData(_) => FRAME_ACQUISITION,
            InboundFrame::BatteryTelemetry(_) => FRAME_BATTERY,
            InboundFrame::DiagnosticInfo(_) => FRAME_DIAGNOSTIC,
            InboundFrame::ButtonEvent(_) => FRAME_BUTTON,
            InboundFrame::ConnectivityChange { .. } => FRAME_CONNECTIVITY,
            InboundFrame::DeviceInfo(_) => FRAME_DEVICE_INFO,
        }
    }

    /// Classify a CRC-valid frame.
    pub fn from_raw(raw: &RawFrame, received_at: Instant) -> Result<Self, DecodeError> {
        let mut r = PayloadReader::new(raw);
        let frame = match raw.kind {
            FRAME_CONNECTIVITY => InboundFrame::ConnectivityChange {
                connected: r.u8()? != 0,
            },
            FRAME_ACQUISITION => {
                let capture_time_us = r.u64()?;
                let count = r.u16()? as usize;
                if r.remaining() != count * 2 {
                    return Err(r.error(format!(
                        "sample count {} does not match {} sample byte(s)",
                        count,
                        r.remaining()
                    )));
                }
                let mut samples = Vec::with_capacity(count);
                for _ in 0..count {
                    samples.push(r.i16()?);
                }
                InboundFrame::AcquisitionData(AscanData {
                    sample_count: samples.len(),
                    samples,
                    capture_time_us,
                    received_at,
                })
            }
            FRAME_BATTERY => {
                let master_level = r.u8()?;
                let aux_level = r.u8()?;
                let flags = r.u8()?;
                InboundFrame::BatteryTelemetry(BatteryInfo {
                    master_level,
                    aux_level,
                    master_charging: flags & BATTERY_MASTER_CHARGING != 0,
                    aux_charging: flags & BATTERY_AUX_CHARGING != 0,
                    aux_present: flags & BATTERY_AUX_PRESENT != 0,
                    master_millivolts: r.u16()?,
                    aux_millivolts: r.u16()?,
                    received_at,
                })
            }
            FRAME_DIAGNOSTIC => InboundFrame::DiagnosticInfo(DiagnosticInfo {
                temperature_centi_c: r.i16()?,
                uptime_secs: r.u32()?,
                firmware: r.firmware()?,
                error_flags: r.u16()?,
                received_at,
            }),
            FRAME_BUTTON => InboundFrame::ButtonEvent(ButtonEvent { received_at }),
            FRAME_DEVICE_INFO => {
                let serial_len = r.u8()? as usize;
                let serial = String::from_utf8(r.take(serial_len)?.to_vec())
                    .map_err(|_| r.error("serial number is not UTF-8"))?;
                let mut mac = [0u8; 6];
                mac.copy_from_slice(r.take(6)?);
                InboundFrame::DeviceInfo(DeviceInfo {
                    serial,
                    mac: MacAddress(mac),
                    firmware: r.firmware()?,
                })
            }
            other => return Err(DecodeError::UnknownKind(other)),
        };
        r.finish()?;
        Ok(frame)
    }

    /// Serialize into a complete frame (device side of the protocol).
    ///
    /// An A-scan longer than [`MAX_ASCAN_SAMPLES`] keeps only its first
    /// `MAX_ASCAN_SAMPLES` samples, and the encoded count says so.
    pub fn encode(&self) -> Vec<u8> {
        let mut p = Vec::new();
        match self {
            InboundFrame::ConnectivityChange { connected } => p.push(*connected as u8),
            InboundFrame::AcquisitionData(data) => {
                let samples = &data.samples[..data.samples.len().min(MAX_ASCAN_SAMPLES)];
                p.extend_from_slice(&data.capture_time_us.to_le_bytes());
                p.extend_from_slice(&(samples.len() as u16).to_le_bytes());
                for s in samples {
                    p.extend_from_slice(&s.to_le_bytes());
                }
            }
            InboundFrame::BatteryTelemetry(b) => {
                let mut flags = 0u8;
                if b.master_charging {
                    flags |= BATTERY_MASTER_CHARGING;
                }
                if b.aux_charging {
                    flags |= BATTERY_AUX_CHARGING;
                }
                if b.aux_present {
                    flags |= BATTERY_AUX_PRESENT;
                }
                p.extend_from_slice(&[b.master_level, b.aux_level, flags]);
                p.extend_from_slice(&b.master_millivolts.to_le_bytes());
                p.extend_from_slice(&b.aux_millivolts.to_le_bytes());
            }
            InboundFrame::DiagnosticInfo(d) => {
                p.extend_from_slice(&d.temperature_centi_c.to_le_bytes());
                p.extend_from_slice(&d.uptime_secs.to_le_bytes());
                p.extend_from_slice(&[d.firmware.major, d.firmware.minor, d.firmware.patch]);
                p.extend_from_slice(&d.error_flags.to_le_bytes());
            }
            InboundFrame::ButtonEvent(_) => {}
            InboundFrame::DeviceInfo(info) => {
                let serial = info.serial.as_bytes();
                let serial = &serial[..serial.len().min(u8::MAX as usize)];
                p.push(serial.len() as u8);
                p.extend_from_slice(serial);
                p.extend_from_slice(&info.mac.0);
                p.extend_from_slice(&[
                    info.firmware.major,
                    info.firmware.minor,
                    info.firmware.patch,
                ]);
            }
        }
        encode_frame(self.kind(), &p)
    }
}

//! Python bindings (`python` feature).
//!
//! Each Python `Session` owns a small multi-threaded Tokio runtime that keeps
//! the reception loop and observer callbacks running while Python code does
//! other work. Blocking calls release the GIL.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use pyo3::exceptions::{
    PyConnectionError, PyIOError, PyRuntimeError, PyTimeoutError, PyValueError,
};
use pyo3::prelude::*;
use pyo3::types::PyDict;
use tokio::runtime::Runtime;

use crate::codec::{AscanData, BatteryInfo, DiagnosticInfo};
use crate::errors::{DriverError, Result};
use crate::identity::{DeviceInfo, DeviceProbe};
use crate::logging::{init_python_logging, set_python_log_level_str};
use crate::params::{DeviceModel, TransmitterMode};
use crate::session::{RequestOutcome, Session, SessionConfig};
use crate::transport::TcpConnector;

impl From<DriverError> for PyErr {
    fn from(e: DriverError) -> Self {
        let msg = e.to_string();
        match e {
            DriverError::Validation(_) => PyValueError::new_err(msg),
            DriverError::Timeout(_) => PyTimeoutError::new_err(msg),
            DriverError::TransportLost(_)
            | DriverError::ConnectCancelled { .. }
            | DriverError::ConnectInterrupted { .. } => {
                PyConnectionError::new_err(msg)
            }
            DriverError::Io(_) | DriverError::Malformed(_) => PyIOError::new_err(msg),
            _ => PyRuntimeError::new_err(msg),
        }
    }
}

fn parse_mode(mode: &str) -> PyResult<TransmitterMode> {
    match mode.to_ascii_lowercase().as_str() {
        "single" => Ok(TransmitterMode::Single),
        "quadro" => Ok(TransmitterMode::Quadro),
        other => Err(PyValueError::new_err(format!(
            "unknown transmitter mode '{other}', expected 'single' or 'quadro'"
        ))),
    }
}

fn build_runtime(workers: usize) -> PyResult<Runtime> {
    tokio::runtime::Builder::new_multi_thread()
        .worker_threads(workers)
        .thread_name("a10x-driver")
        .enable_all()
        .build()
        .map_err(|e| PyRuntimeError::new_err(format!("failed to start runtime: {e}")))
}

// ============================================================================
// Data classes
// ============================================================================

/// One A-scan captured by the instrument.
///
/// Attributes:
///     samples: Signed 16-bit amplitude samples.
///     sample_count: Number of samples.
///     capture_time_us: Device timestamp of the capture in microseconds.
#[pyclass(name = "AScan", frozen)]
#[derive(Clone)]
struct PyAscan {
    #[pyo3(get)]
    samples: Vec<i16>,
    #[pyo3(get)]
    sample_count: usize,
    #[pyo3(get)]
    capture_time_us: u64,
}

#[pymethods]
impl PyAscan {
    fn __repr__(&self) -> String {
        format!(
            "AScan(sample_count={}, capture_time_us={})",
            self.sample_count, self.capture_time_us
        )
    }

    fn __len__(&self) -> usize {
        self.sample_count
    }
}

impl From<AscanData> for PyAscan {
    fn from(a: AscanData) -> Self {
        PyAscan {
            sample_count: a.sample_count,
            capture_time_us: a.capture_time_us,
            samples: a.samples,
        }
    }
}

/// Battery telemetry for the master and auxiliary packs.
#[pyclass(name = "BatteryInfo", frozen)]
#[derive(Clone)]
struct PyBatteryInfo {
    #[pyo3(get)]
    master_level: u8,
    #[pyo3(get)]
    aux_level: u8,
    #[pyo3(get)]
    master_charging: bool,
    #[pyo3(get)]
    aux_charging: bool,
    #[pyo3(get)]
    aux_present: bool,
    #[pyo3(get)]
    master_millivolts: u16,
    #[pyo3(get)]
    aux_millivolts: u16,
}

#[pymethods]
impl PyBatteryInfo {
    fn __repr__(&self) -> String {
        format!(
            "BatteryInfo(master={}%, aux={}%, charging={})",
            self.master_level, self.aux_level, self.master_charging
        )
    }

    fn to_dict<'py>(&self, py: Python<'py>) -> PyResult<Bound<'py, PyDict>> {
        let dict = PyDict::new(py);
        dict.set_item("master_level", self.master_level)?;
        dict.set_item("aux_level", self.aux_level)?;
        dict.set_item("master_charging", self.master_charging)?;
        dict.set_item("aux_charging", self.aux_charging)?;
        dict.set_item("aux_present", self.aux_present)?;
        dict.set_item("master_millivolts", self.master_millivolts)?;
        dict.set_item("aux_millivolts", self.aux_millivolts)?;
        Ok(dict)
    }
}

impl From<BatteryInfo> for PyBatteryInfo {
    fn from(b: BatteryInfo) -> Self {
        PyBatteryInfo {
            master_level: b.master_level,
            aux_level: b.aux_level,
            master_charging: b.master_charging,
            aux_charging: b.aux_charging,
            aux_present: b.aux_present,
            master_millivolts: b.master_millivolts,
            aux_millivolts: b.aux_millivolts,
        }
    }
}

/// Diagnostic snapshot reported by the instrument.
#[pyclass(name = "DiagnosticInfo", frozen)]
#[derive(Clone)]
struct PyDiagnosticInfo {
    #[pyo3(get)]
    temperature_celsius: f32,
    #[pyo3(get)]
    uptime_secs: u32,
    #[pyo3(get)]
    firmware: String,
    #[pyo3(get)]
    error_flags: u16,
}

#[pymethods]
impl PyDiagnosticInfo {
    fn __repr__(&self) -> String {
        format!(
            "DiagnosticInfo(temperature={:.2}C, uptime={}s, error_flags={:#06x})",
            self.temperature_celsius, self.uptime_secs, self.error_flags
        )
    }
}

impl From<DiagnosticInfo> for PyDiagnosticInfo {
    fn from(d: DiagnosticInfo) -> Self {
        PyDiagnosticInfo {
            temperature_celsius: d.temperature_celsius(),
            uptime_secs: d.uptime_secs,
            firmware: d.firmware.to_string(),
            error_flags: d.error_flags,
        }
    }
}

/// Serial number, MAC address and firmware version of an instrument.
#[pyclass(name = "DeviceInfo", frozen)]
#[derive(Clone)]
struct PyDeviceInfo {
    #[pyo3(get)]
    serial: String,
    #[pyo3(get)]
    mac: String,
    #[pyo3(get)]
    firmware: String,
}

#[pymethods]
impl PyDeviceInfo {
    fn __repr__(&self) -> String {
        format!(
            "DeviceInfo(serial={}, mac={}, firmware={})",
            self.serial, self.mac, self.firmware
        )
    }
}

impl From<DeviceInfo> for PyDeviceInfo {
    fn from(d: DeviceInfo) -> Self {
        PyDeviceInfo {
            serial: d.serial,
            mac: d.mac.to_string(),
            firmware: d.firmware.to_string(),
        }
    }
}

// ============================================================================
// Session
// ============================================================================

/// Driver session for an A1052 instrument.
///
/// Example:
///     >>> s = Session()
///     >>> s.on_acquisition(lambda scan: print(scan.capture_time_us))
///     >>> s.connect("192.168.137.123")
///     >>> s.set_gain(10)
///     >>> s.start_acquisition("single", transmitter=0)
///     >>> s.stop_acquisition()
///     >>> s.disconnect()
#[pyclass(name = "Session")]
struct PySession {
    // Dropped before the runtime that drives it.
    session: Session,
    runtime: Runtime,
}

impl PySession {
    fn run<'a, T, F>(&'a self, py: Python<'_>, fut: F) -> PyResult<T>
    where
        T: Send,
        F: Future<Output = Result<T>> + Send + 'a,
    {
        py.detach(|| self.runtime.block_on(fut)).map_err(PyErr::from)
    }
}

#[pymethods]
impl PySession {
    /// Create a disconnected session.
    ///
    /// Args:
    ///     connect_timeout: Seconds allowed per connection attempt.
    ///     request_timeout: Seconds to wait for telemetry replies.
    ///     max_connect_attempts: Attempts before the session is cancelled.
    ///
    /// Raises:
    ///     ValueError: If a timeout is negative, NaN or too large.
    #[new]
    #[pyo3(signature = (connect_timeout=3.0, request_timeout=2.0, max_connect_attempts=3))]
    fn new(connect_timeout: f64, request_timeout: f64, max_connect_attempts: u32) -> PyResult<Self> {
        let config = SessionConfig {
            connect_timeout: seconds("connect_timeout", connect_timeout)?,
            request_timeout: seconds("request_timeout", request_timeout)?,
            max_connect_attempts,
            ..SessionConfig::default()
        };
        Ok(PySession {
            session: Session::new(DeviceModel::a1052(), config),
            runtime: build_runtime(2)?,
        })
    }

    /// Connect to the instrument at `endpoint` (IP address, optionally with port).
    ///
    /// Raises:
    ///     ConnectionError: If every connection attempt fails.
    fn connect(&self, py: Python<'_>, endpoint: &str) -> PyResult<()> {
        self.run(py, self.session.connect(endpoint))
    }

    /// Stop acquisition and close the connection.
    fn disconnect(&self, py: Python<'_>) -> PyResult<()> {
        self.run(py, async {
            self.session.disconnect().await;
            Ok(())
        })
    }

    /// Set a parameter by name (e.g. "gain") and return the accepted value.
    ///
    /// Raises:
    ///     ValueError: If the value is out of range for the parameter.
    ///     RuntimeError: If not connected; the value is kept for the next connect.
    fn set_parameter(&self, py: Python<'_>, name: &str, value: f64) -> PyResult<f64> {
        self.run(py, self.session.set_parameter_named(name, value))
    }

    /// Receiver gain in dB (0-36).
    fn set_gain(&self, py: Python<'_>, db: u8) -> PyResult<()> {
        self.run(py, self.session.set_gain(db))
    }

    /// Operating frequency in kHz (10-100).
    fn set_frequency(&self, py: Python<'_>, khz: f64) -> PyResult<()> {
        self.run(py, self.session.set_frequency(khz))
    }

    /// A-scans averaged per capture (1-16).
    fn set_averaging(&self, py: Python<'_>, count: u8) -> PyResult<()> {
        self.run(py, self.session.set_averaging(count))
    }

    /// Pulse repetition rate in Hz (0-100).
    fn set_pulse_repetition_rate(&self, py: Python<'_>, hz: f64) -> PyResult<()> {
        self.run(py, self.session.set_pulse_repetition_rate(hz))
    }

    fn set_burst_periods(&self, py: Python<'_>, periods: f64) -> PyResult<()> {
        self.run(py, self.session.set_burst_periods(periods))
    }

    fn set_single_transmitter(&self, py: Python<'_>, index: u8) -> PyResult<()> {
        self.run(py, self.session.set_single_transmitter(index))
    }

    fn set_quadro_transmitter(&self, py: Python<'_>, column: u8) -> PyResult<()> {
        self.run(py, self.session.set_quadro_transmitter(column))
    }

    fn set_led_mask(&self, py: Python<'_>, mask: u8) -> PyResult<()> {
        self.run(py, self.session.set_led_mask(mask))
    }

    /// Start streaming A-scans.
    ///
    /// Args:
    ///     mode: "single" or "quadro".
    ///     transmitter: Element (single) or column (quadro); defaults to the last one set.
    #[pyo3(signature = (mode="single", transmitter=None))]
    fn start_acquisition(&self, py: Python<'_>, mode: &str, transmitter: Option<u8>) -> PyResult<()> {
        let mode = parse_mode(mode)?;
        self.run(py, self.session.start_acquisition(mode, transmitter))
    }

    fn stop_acquisition(&self, py: Python<'_>) -> PyResult<()> {
        self.run(py, self.session.stop_acquisition())
    }

    /// Request battery telemetry. Returns False if a request was already pending.
    fn request_battery_info(&self, py: Python<'_>) -> PyResult<bool> {
        self.run(py, self.session.request_battery_info())
            .map(|outcome| outcome == RequestOutcome::Sent)
    }

    /// Request diagnostic info. Returns False if a request was already pending.
    fn request_diagnostic_info(&self, py: Python<'_>) -> PyResult<bool> {
        self.run(py, self.session.request_diagnostic_info())
            .map(|outcome| outcome == RequestOutcome::Sent)
    }

    /// Call `callback(scan: AScan)` for every A-scan, replacing any previous callback.
    fn on_acquisition(&self, callback: Py<PyAny>) {
        let _guard = self.runtime.enter();
        self.session.events().on_acquisition(move |scan| {
            Python::attach(|py| {
                if let Err(e) = callback.call1(py, (PyAscan::from(scan),)) {
                    e.print(py);
                }
            })
        });
    }

    /// Call `callback(info: BatteryInfo)` for every battery reply.
    fn on_battery(&self, callback: Py<PyAny>) {
        let _guard = self.runtime.enter();
        self.session.events().on_battery(move |info| {
            Python::attach(|py| {
                if let Err(e) = callback.call1(py, (PyBatteryInfo::from(info),)) {
                    e.print(py);
                }
            })
        });
    }

    /// Call `callback(info: DiagnosticInfo)` for every diagnostic reply.
    fn on_diagnostic(&self, callback: Py<PyAny>) {
        let _guard = self.runtime.enter();
        self.session.events().on_diagnostic(move |info| {
            Python::attach(|py| {
                if let Err(e) = callback.call1(py, (PyDiagnosticInfo::from(info),)) {
                    e.print(py);
                }
            })
        });
    }

    /// Call `callback(connected: bool, state: str)` on every connectivity change.
    fn on_connectivity(&self, callback: Py<PyAny>) {
        let _guard = self.runtime.enter();
        self.session.events().on_connectivity(move |event| {
            Python::attach(|py| {
                let args = (event.connected, event.state.to_string());
                if let Err(e) = callback.call1(py, args) {
                    e.print(py);
                }
            })
        });
    }

    /// Call `callback()` whenever the device's button is pressed.
    fn on_button(&self, callback: Py<PyAny>) {
        let _guard = self.runtime.enter();
        self.session.events().on_button(move |_| {
            Python::attach(|py| {
                if let Err(e) = callback.call0(py) {
                    e.print(py);
                }
            })
        });
    }

    /// "disconnected", "connecting", "connected" or "cancelled".
    #[getter]
    fn state(&self) -> String {
        self.session.state().to_string()
    }

    #[getter]
    fn is_acquiring(&self) -> bool {
        self.session.acquisition_mode().is_active()
    }

    /// Current parameter values by name.
    fn parameters(&self, py: Python<'_>) -> PyResult<HashMap<String, f64>> {
        self.run(py, async {
            let params = self.session.parameters().await;
            Ok(params
                .iter()
                .map(|(id, value)| (id.name().to_string(), value))
                .collect())
        })
    }

    /// Session counters as a dict.
    fn stats<'py>(&self, py: Python<'py>) -> PyResult<Bound<'py, PyDict>> {
        let stats = self.run(py, async { Ok(self.session.stats().await) })?;
        let dict = PyDict::new(py);
        dict.set_item("connects", stats.connects)?;
        dict.set_item("transport_losses", stats.transport_losses)?;
        dict.set_item("frames_received", stats.frames_received)?;
        dict.set_item("malformed_frames", stats.malformed_frames)?;
        dict.set_item("request_timeouts", stats.request_timeouts)?;
        dict.set_item("dropped_notifications", stats.dropped_notifications)?;
        dict.set_item("bytes_sent", stats.bytes_sent)?;
        Ok(dict)
    }

    fn __repr__(&self) -> String {
        let status = self.session.status();
        format!(
            "Session(model={}, state={}, acquisition={:?})",
            self.session.model().name(),
            status.state,
            status.acquisition
        )
    }
}

// ============================================================================
// Module functions
// ============================================================================

/// Convert a Python float of seconds, rejecting negative, NaN and overflowing values.
fn seconds(name: &str, value: f64) -> PyResult<Duration> {
    Duration::try_from_secs_f64(value).map_err(|e| {
        PyValueError::new_err(format!("{name} must be a non-negative number of seconds, got {value}: {e}"))
    })
}

fn probe(timeout: f64) -> PyResult<DeviceProbe> {
    Ok(DeviceProbe::new(
        Arc::new(TcpConnector::default()),
        seconds("timeout", timeout)?,
    ))
}

fn run_once<T: Send>(py: Python<'_>, fut: impl Future<Output = T> + Send) -> PyResult<T> {
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .map_err(|e| PyRuntimeError::new_err(format!("failed to start runtime: {e}")))?;
    Ok(py.detach(|| runtime.block_on(fut)))
}

/// Return True if an instrument answers at `address`.
#[pyfunction]
#[pyo3(signature = (address, timeout=2.0))]
fn identify(py: Python<'_>, address: &str, timeout: f64) -> PyResult<bool> {
    let probe = probe(timeout)?;
    run_once(py, probe.identify(address))
}

/// Read the identity of the instrument at `address`.
///
/// Raises:
///     TimeoutError: If the instrument does not answer in time.
#[pyfunction]
#[pyo3(signature = (address, timeout=2.0))]
fn device_info(py: Python<'_>, address: &str, timeout: f64) -> PyResult<PyDeviceInfo> {
    let probe = probe(timeout)?;
    let info = run_once(py, probe.device_info(address))??;
    Ok(PyDeviceInfo::from(info))
}

/// Set the minimum level of Rust logs forwarded to Python's `logging`.
#[pyfunction]
#[pyo3(signature = (level=None))]
fn set_log_level(py: Python<'_>, level: Option<&str>) -> PyResult<()> {
    set_python_log_level_str(py, level)
}

/// The Python module definition
#[pymodule]
fn _core(m: &Bound<'_, PyModule>) -> PyResult<()> {
    init_python_logging(m.py())?;

    m.add_class::<PySession>()?;
    m.add_class::<PyAscan>()?;
    m.add_class::<PyBatteryInfo>()?;
    m.add_class::<PyDiagnosticInfo>()?;
    m.add_class::<PyDeviceInfo>()?;
    m.add_function(wrap_pyfunction!(identify, m)?)?;
    m.add_function(wrap_pyfunction!(device_info, m)?)?;
    m.add_function(wrap_pyfunction!(set_log_level, m)?)?;

    m.add("DEFAULT_PORT", crate::transport::DEFAULT_PORT)?;
    m.add("CHANNEL_COUNT", DeviceModel::a1052().channel_count())?;

    Ok(())
}

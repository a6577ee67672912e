use std::sync::Once;

use env_logger::Env;
use log::LevelFilter;

static RUST_LOG_ONCE: Once = Once::new();

pub(crate) fn env_level() -> LevelFilter {
    std::env::var("A10X_LOG")
        .or_else(|_| std::env::var("RUST_LOG"))
        .ok()
        .as_deref()
        .and_then(|v| v.parse::<LevelFilter>().ok())
        .unwrap_or(LevelFilter::Info)
}

fn level_to_str(level: LevelFilter) -> &'static str {
    match level {
        LevelFilter::Off => "off",
        LevelFilter::Error => "error",
        LevelFilter::Warn => "warn",
        LevelFilter::Info => "info",
        LevelFilter::Debug => "debug",
        LevelFilter::Trace => "trace",
    }
}

#[cfg_attr(not(feature = "python"), allow(dead_code))]
pub(crate) fn parse_level(input: Option<&str>) -> Option<LevelFilter> {
    input.and_then(|s| s.parse::<LevelFilter>().ok())
}

/// Initialize logging for Rust binaries (stderr formatter) based on `A10X_LOG`/`RUST_LOG`.
///
/// Safe to call more than once; only the first call installs the logger.
pub fn init_rust_logging() {
    let level = env_level();
    RUST_LOG_ONCE.call_once(|| {
        let env = Env::default().default_filter_or(level_to_str(level));
        // Another logger may already be installed by the embedding program.
        let _ = env_logger::Builder::from_env(env)
            .format_timestamp_millis()
            .format_module_path(true)
            .format_target(true)
            .try_init();
    });
}

#[cfg(feature = "python")]
pub(crate) use python_bridge::{init_python_logging, set_python_log_level_str};

#[cfg(feature = "python")]
mod python_bridge {
    use std::collections::HashMap;
    use std::sync::Once;

    use log::{LevelFilter, Log, Metadata, Record};
    use once_cell::sync::OnceCell;
    use parking_lot::Mutex;
    use pyo3::prelude::*;
    use pyo3::types::{PyAny, PyModule, PyTuple};

    use super::{env_level, parse_level};

    static PY_LOG_ONCE: Once = Once::new();
    static PY_LOGGER: OnceCell<&'static PyLogger> = OnceCell::new();

    /// Forwards `log` records to Python's `logging`, one Python logger per target.
    struct PyLogger {
        top_filter: Mutex<LevelFilter>,
        logging_mod: Py<PyModule>,
        cache: Mutex<HashMap<String, (LevelFilter, Py<PyAny>)>>, // target -> (effective_level, logger)
    }

    impl PyLogger {
        fn new(py: Python<'_>, top_filter: LevelFilter) -> PyResult<Self> {
            let logging = py.import("logging")?;
            Ok(Self {
                top_filter: Mutex::new(top_filter),
                logging_mod: logging.into(),
                cache: Mutex::new(HashMap::new()),
            })
        }

        fn map_level(level: log::Level) -> usize {
            match level {
                log::Level::Error => 40,
                log::Level::Warn => 30,
                log::Level::Info => 20,
                log::Level::Debug => 10,
                log::Level::Trace => 5,
            }
        }

        fn extract_max_level(logger: &Bound<'_, PyAny>) -> PyResult<LevelFilter> {
            use log::Level::*;
            for l in [Trace, Debug, Info, Warn, Error] {
                let enabled = logger
                    .call_method1("isEnabledFor", (Self::map_level(l),))?
                    .is_truthy()?;
                if enabled {
                    return Ok(l.to_level_filter());
                }
            }
            Ok(LevelFilter::Off)
        }

        fn logger_for(&self, py: Python<'_>, target: &str) -> PyResult<(LevelFilter, Py<PyAny>)> {
            let mut cache = self.cache.lock();
            if let Some((level, logger)) = cache.get(target) {
                return Ok((*level, logger.clone_ref(py)));
            }
            let logger = self
                .logging_mod
                .bind(py)
                .getattr("getLogger")?
                .call1((target,))?;
            let level = Self::extract_max_level(&logger)?;
            let owned = logger.unbind();
            cache.insert(target.to_string(), (level, owned.clone_ref(py)));
            Ok((level, owned))
        }

        fn forward(&self, py: Python<'_>, record: &Record) -> PyResult<()> {
            let target = record.target().replace("::", ".");
            let (enabled_level, logger) = self.logger_for(py, &target)?;
            let level = record.level().to_level_filter();
            if level > enabled_level || level > *self.top_filter.lock() {
                return Ok(());
            }

            let logger = logger.bind(py);
            let none = py.None();
            let rec = logger.call_method1(
                "makeRecord",
                (
                    &target,
                    Self::map_level(record.level()),
                    record.file(),
                    record.line().unwrap_or_default(),
                    record.args().to_string(),
                    PyTuple::empty(py),
                    &none, // exc_info
                    &none, // func
                    &none, // extra
                ),
            )?;
            logger.call_method1("handle", (rec,))?;
            Ok(())
        }
    }

    impl Log for PyLogger {
        fn enabled(&self, metadata: &Metadata) -> bool {
            metadata.level().to_level_filter() <= *self.top_filter.lock()
        }

        fn log(&self, record: &Record) {
            Python::attach(|py| {
                if let Err(e) = self.forward(py, record) {
                    e.restore(py);
                }
            });
        }

        fn flush(&self) {}
    }

    /// Route Rust logs into Python's `logging`. Only the first call installs the bridge.
    pub(crate) fn init_python_logging(py: Python<'_>) -> PyResult<()> {
        let level = env_level();
        let mut result = Ok(());
        PY_LOG_ONCE.call_once(|| match PyLogger::new(py, level) {
            Ok(logger) => {
                let leaked: &'static PyLogger = Box::leak(Box::new(logger));
                if log::set_logger(leaked).is_ok() {
                    log::set_max_level(level);
                    let _ = PY_LOGGER.set(leaked);
                }
            }
            Err(e) => result = Err(e),
        });
        result
    }

    /// Drop cached per-target loggers so Python config changes take effect.
    fn reset_cache() {
        if let Some(logger) = PY_LOGGER.get() {
            logger.cache.lock().clear();
        }
    }

    /// Apply a level name (or the env fallback) to the bridge.
    pub(crate) fn set_python_log_level_str(py: Python<'_>, level: Option<&str>) -> PyResult<()> {
        let level = parse_level(level).unwrap_or_else(env_level);
        init_python_logging(py)?;
        if let Some(logger) = PY_LOGGER.get() {
            *logger.top_filter.lock() = level;
            reset_cache();
        }
        log::set_max_level(level);
        Ok(())
    }
}

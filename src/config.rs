//! Call-site definitions and monitor tunables
//!
//! # Call-site file
//!
//! One definition per line, `<call_site> <threshold> <unit>`, optionally
//! followed by `* <nested_call>` lines that attach nested-call tracking to
//! the definition above them:
//!
//! ```text
//! # catch anything slower than 5 ms
//! slow_fn 5 ms
//! outer   2.5 s
//! * inner
//! * helper
//! ```
//!
//! Valid units are `s`, `ms`, `us` and `ns`. Blank lines and `#` comments
//! are skipped. Any malformed line is an error: monitoring with a partial
//! configuration is meaningless.

use crate::error::ConfigError;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use std::time::Duration;

/// Threshold unit accepted in the call-site file
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeUnit {
    Seconds,
    Millis,
    Micros,
    Nanos,
}

impl TimeUnit {
    pub fn parse(unit: &str) -> Option<Self> {
        match unit {
            "s" => Some(Self::Seconds),
            "ms" => Some(Self::Millis),
            "us" => Some(Self::Micros),
            "ns" => Some(Self::Nanos),
            _ => None,
        }
    }

    pub fn nanos(self) -> u64 {
        match self {
            Self::Seconds => 1_000_000_000,
            Self::Millis => 1_000_000,
            Self::Micros => 1_000,
            Self::Nanos => 1,
        }
    }
}

/// One configured call site
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CallSiteSpec {
    pub name: String,
    pub threshold_nanos: u64,
    pub nested_calls: Vec<String>,
}

impl CallSiteSpec {
    pub fn threshold(&self) -> Duration {
        Duration::from_nanos(self.threshold_nanos)
    }
}

/// Convert `<value> <unit>` to whole nanoseconds
///
/// Fractional values are allowed; the result is rounded to the nearest
/// nanosecond and must be non-zero.
pub fn parse_threshold(value: &str, unit: &str, line: usize) -> Result<u64, ConfigError> {
    let invalid = || ConfigError::InvalidThreshold {
        line,
        value: value.to_string(),
    };

    let amount: f64 = value.parse().map_err(|_| invalid())?;
    if !amount.is_finite() || amount <= 0.0 {
        return Err(invalid());
    }

    let unit = TimeUnit::parse(unit).ok_or_else(|| ConfigError::UnknownUnit {
        line,
        unit: unit.to_string(),
    })?;

    let nanos = (amount * unit.nanos() as f64).round();
    if nanos >= u64::MAX as f64 {
        return Err(invalid());
    }
    match nanos as u64 {
        0 => Err(invalid()),
        n => Ok(n),
    }
}

/// Parse the contents of a call-site file
pub fn parse_call_sites(input: &str) -> Result<Vec<CallSiteSpec>, ConfigError> {
    let mut specs: Vec<CallSiteSpec> = Vec::new();

    for (index, raw) in input.lines().enumerate() {
        let line = index + 1;
        let trimmed = raw.trim();
        if trimmed.is_empty() || trimmed.starts_with('#') {
            continue;
        }

        let words: Vec<&str> = trimmed.split_whitespace().collect();
        match words.as_slice() {
            ["*", nested] => {
                let Some(current) = specs.last_mut() else {
                    return Err(ConfigError::OrphanNestedCall {
                        line,
                        name: nested.to_string(),
                    });
                };
                if !current.nested_calls.iter().any(|n| n == nested) {
                    current.nested_calls.push(nested.to_string());
                }
            }
            [name, value, unit] if *name != "*" => {
                let threshold_nanos = parse_threshold(value, unit, line)?;
                specs.push(CallSiteSpec {
                    name: name.to_string(),
                    threshold_nanos,
                    nested_calls: Vec::new(),
                });
            }
            _ => {
                return Err(ConfigError::MalformedLine {
                    line,
                    content: trimmed.to_string(),
                });
            }
        }
    }

    Ok(specs)
}

/// Read and parse a call-site file
pub fn load_call_sites<P: AsRef<Path>>(path: P) -> Result<Vec<CallSiteSpec>, ConfigError> {
    let path = path.as_ref();
    let content = fs::read_to_string(path).map_err(|source| ConfigError::Io {
        path: path.display().to_string(),
        source,
    })?;
    parse_call_sites(&content)
}

/// Runtime tunables of a monitor
///
/// # Example
/// ```
/// use straggler::config::MonitorConfig;
///
/// let config = MonitorConfig::default();
/// assert_eq!(config.poll_interval_ms, 1000);
/// assert_eq!(config.initial_slot_capacity, 32);
/// assert!(config.validate().is_ok());
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct MonitorConfig {
    /// Scanner sweep period
    pub poll_interval_ms: u64,

    /// Starting size of every thread-slot table; a power of two
    pub initial_slot_capacity: usize,

    /// Bytes of nested-call trace per thread per traced call site
    pub trace_buffer_capacity: usize,

    /// Record nested-call markers for sites that list nested calls
    pub nested_call_tracing: bool,

    /// Check the exiting thread's slot for a straggler in `on_exit`
    pub check_on_exit: bool,

    /// Spawn the scanner when the first thread starts. When off, the
    /// embedder drives detection through `StragglerMonitor::scan_once`.
    pub autostart_scanner: bool,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: 1000,
            initial_slot_capacity: 32,
            trace_buffer_capacity: 8192,
            nested_call_tracing: true,
            check_on_exit: true,
            autostart_scanner: true,
        }
    }
}

impl MonitorConfig {
    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_toml_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_toml_str(&content)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.poll_interval_ms == 0 {
            return Err(ConfigError::InvalidTunable(
                "poll_interval_ms must be > 0".to_string(),
            ));
        }

        if !self.initial_slot_capacity.is_power_of_two() {
            return Err(ConfigError::InvalidTunable(format!(
                "initial_slot_capacity must be a power of two, got {}",
                self.initial_slot_capacity
            )));
        }

        if self.nested_call_tracing && self.trace_buffer_capacity == 0 {
            return Err(ConfigError::InvalidTunable(
                "trace_buffer_capacity must be > 0 when nested_call_tracing is on".to_string(),
            ));
        }

        Ok(())
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    /// Per-thread trace size, or `None` when tracing is off
    pub fn trace_capacity(&self) -> Option<usize> {
        self.nested_call_tracing.then_some(self.trace_buffer_capacity)
    }
}

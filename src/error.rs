//! Error taxonomy for the straggler monitor
//!
//! Configuration errors and structural failures surface to the operator and
//! end the monitoring session. Report-handler failures are logged and never
//! propagate into the monitored process. The hot path has no error type at
//! all: `on_enter`/`on_exit` degrade silently.

use thiserror::Error;

/// Errors raised while reading call-site definitions or tunables
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read configuration file {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Line {line}: expected `<call_site> <threshold> <unit>`, got `{content}`")]
    MalformedLine { line: usize, content: String },

    #[error("Line {line}: invalid latency threshold `{value}`")]
    InvalidThreshold { line: usize, value: String },

    #[error("Line {line}: invalid unit `{unit}` (valid units are s, ms, us, ns)")]
    UnknownUnit { line: usize, unit: String },

    #[error("Line {line}: nested call `{name}` does not follow a call site definition")]
    OrphanNestedCall { line: usize, name: String },

    #[error("Invalid tunable: {0}")]
    InvalidTunable(String),

    #[error("Failed to parse tunables: {0}")]
    Toml(#[from] toml::de::Error),
}

/// Structural failures of the monitor itself
#[derive(Error, Debug)]
pub enum MonitorError {
    #[error("Insufficient thread-local storage for {requested} threads")]
    SlotAllocation { requested: usize },

    #[error("Straggler scanner thread could not be created: {0}")]
    ScannerSpawn(#[source] std::io::Error),
}

/// Failures of the external action handler
#[derive(Error, Debug)]
pub enum ReportError {
    #[error("Couldn't invoke handler `{program}`: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Handler `{program}` exited with {status}")]
    ExitStatus { program: String, status: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to serialize report: {0}")]
    Serialize(#[from] serde_json::Error),
}

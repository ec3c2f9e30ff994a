//! Straggler reports and the action handlers that receive them
//!
//! A sink is invoked synchronously from whichever thread detected the
//! straggler: the scanner, or a monitored thread at call exit. A failing
//! sink returns an error that the caller logs and otherwise ignores.

use crate::error::ReportError;
use serde::Serialize;
use std::io::Write;
use std::path::PathBuf;
use std::process::Command;
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

/// Argument passed to handlers in place of the trace when none was recorded
pub const NO_TRACE_PLACEHOLDER: &str = "none";

/// An invocation that exceeded its call site's threshold
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StragglerReport {
    pub call_site_name: String,
    pub thread_id: usize,
    pub entry_timestamp_nanos: u64,
    pub observation_timestamp_nanos: u64,
    pub elapsed_nanos: u64,
    pub nested_call_trace: Option<String>,
}

impl StragglerReport {
    pub fn elapsed(&self) -> Duration {
        Duration::from_nanos(self.elapsed_nanos)
    }

    /// Positional handler arguments:
    /// `<pid> <call_site> <thread_id> <entry_ns> <observation_ns> <trace>`
    pub fn handler_args(&self, pid: u32) -> Vec<String> {
        vec![
            pid.to_string(),
            self.call_site_name.clone(),
            self.thread_id.to_string(),
            self.entry_timestamp_nanos.to_string(),
            self.observation_timestamp_nanos.to_string(),
            self.trace_or_placeholder().to_string(),
        ]
    }

    /// The nested-call trace, or [`NO_TRACE_PLACEHOLDER`] if nothing was recorded
    ///
    /// A traced site whose nested calls never ran this time has an empty
    /// trace; handlers get the placeholder for it as well.
    pub fn trace_or_placeholder(&self) -> &str {
        match self.nested_call_trace.as_deref() {
            Some(trace) if !trace.is_empty() => trace,
            _ => NO_TRACE_PLACEHOLDER,
        }
    }
}

/// Destination for straggler reports
pub trait ReportSink: Send + Sync {
    fn report(&self, report: &StragglerReport) -> Result<(), ReportError>;
}

/// Runs a user-supplied program once per report
///
/// The program may attach a debugger, collect more statistics, page
/// someone, and so on. It receives the report as positional arguments
/// (see [`StragglerReport::handler_args`]).
#[derive(Debug, Clone)]
pub struct ScriptSink {
    program: PathBuf,
    pid: u32,
}

impl ScriptSink {
    /// Handler reporting on the current process
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self::for_pid(program, std::process::id())
    }

    pub fn for_pid(program: impl Into<PathBuf>, pid: u32) -> Self {
        Self {
            program: program.into(),
            pid,
        }
    }
}

impl ReportSink for ScriptSink {
    fn report(&self, report: &StragglerReport) -> Result<(), ReportError> {
        let program = self.program.display().to_string();
        let args = report.handler_args(self.pid);
        let status = Command::new(&self.program)
            .args(&args)
            .status()
            .map_err(|source| ReportError::Spawn {
                program: program.clone(),
                source,
            })?;

        if !status.success() {
            return Err(ReportError::ExitStatus {
                program,
                status: status.to_string(),
            });
        }

        tracing::info!(command = %format!("{} {}", program, args.join(" ")), "Handler invoked");
        Ok(())
    }
}

/// Emits each report as a `tracing` warning
#[derive(Debug, Clone, Copy, Default)]
pub struct LogSink;

impl ReportSink for LogSink {
    fn report(&self, report: &StragglerReport) -> Result<(), ReportError> {
        tracing::warn!(
            call_site = %report.call_site_name,
            thread = report.thread_id,
            elapsed_ns = report.elapsed_nanos,
            trace = report.trace_or_placeholder(),
            "Caught straggler"
        );
        Ok(())
    }
}

/// Writes one JSON object per report
#[derive(Debug)]
pub struct JsonLinesSink<W: Write + Send> {
    writer: Mutex<W>,
}

impl<W: Write + Send> JsonLinesSink<W> {
    pub fn new(writer: W) -> Self {
        Self {
            writer: Mutex::new(writer),
        }
    }

    pub fn into_inner(self) -> W {
        self.writer
            .into_inner()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

impl<W: Write + Send> ReportSink for JsonLinesSink<W> {
    fn report(&self, report: &StragglerReport) -> Result<(), ReportError> {
        let mut writer = self.writer.lock().unwrap_or_else(PoisonError::into_inner);
        serde_json::to_writer(&mut *writer, report)?;
        writer.write_all(b"\n")?;
        writer.flush()?;
        Ok(())
    }
}

/// Keeps reports in memory; useful for embedding tests
#[derive(Debug, Default)]
pub struct MemorySink {
    reports: Mutex<Vec<StragglerReport>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn reports(&self) -> Vec<StragglerReport> {
        self.reports
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn len(&self) -> usize {
        self.reports
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl ReportSink for MemorySink {
    fn report(&self, report: &StragglerReport) -> Result<(), ReportError> {
        self.reports
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(report.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(trace: Option<&str>) -> StragglerReport {
        StragglerReport {
            call_site_name: "slow_fn".to_string(),
            thread_id: 3,
            entry_timestamp_nanos: 1_000,
            observation_timestamp_nanos: 10_001_000,
            elapsed_nanos: 10_000_000,
            nested_call_trace: trace.map(str::to_string),
        }
    }

    #[test]
    fn test_handler_args_order() {
        let args = sample(Some("b--> b<--")).handler_args(42);
        assert_eq!(
            args,
            vec!["42", "slow_fn", "3", "1000", "10001000", "b--> b<--"]
        );
    }

    #[test]
    fn test_handler_args_placeholder() {
        let args = sample(None).handler_args(1);
        assert_eq!(args.last().map(String::as_str), Some(NO_TRACE_PLACEHOLDER));
    }

    #[test]
    fn test_handler_args_placeholder_for_empty_trace() {
        let report = sample(Some(""));
        assert_eq!(report.trace_or_placeholder(), NO_TRACE_PLACEHOLDER);
        let args = report.handler_args(1);
        assert_eq!(args.len(), 6);
        assert_eq!(args[5], NO_TRACE_PLACEHOLDER);
    }

    #[test]
    fn test_elapsed_duration() {
        assert_eq!(sample(None).elapsed(), Duration::from_millis(10));
    }

    #[test]
    fn test_memory_sink_collects() {
        let sink = MemorySink::new();
        assert!(sink.is_empty());
        sink.report(&sample(None)).unwrap();
        sink.report(&sample(None)).unwrap();
        assert_eq!(sink.len(), 2);
        assert_eq!(sink.reports()[0].call_site_name, "slow_fn");
    }

    #[test]
    fn test_json_lines_sink_writes_one_line_per_report() {
        let sink = JsonLinesSink::new(Vec::new());
        sink.report(&sample(Some("x-->"))).unwrap();
        sink.report(&sample(None)).unwrap();

        let output = String::from_utf8(sink.into_inner()).unwrap();
        let lines: Vec<_> = output.lines().collect();
        assert_eq!(lines.len(), 2);
        let first: serde_json::Value = serde_json::from_str(lines[0]).unwrap();
        assert_eq!(first["call_site_name"], "slow_fn");
        assert_eq!(first["nested_call_trace"], "x-->");
        let second: serde_json::Value = serde_json::from_str(lines[1]).unwrap();
        assert!(second["nested_call_trace"].is_null());
    }

    #[test]
    fn test_log_sink_never_fails() {
        assert!(LogSink.report(&sample(None)).is_ok());
    }

    #[test]
    fn test_script_sink_missing_program() {
        let sink = ScriptSink::new("/nonexistent/straggler-handler");
        let err = sink.report(&sample(None)).unwrap_err();
        assert!(matches!(err, ReportError::Spawn { .. }));
    }

    #[cfg(unix)]
    #[test]
    fn test_script_sink_nonzero_exit() {
        let sink = ScriptSink::new("false");
        let err = sink.report(&sample(None)).unwrap_err();
        assert!(matches!(err, ReportError::ExitStatus { .. }));
    }

    #[cfg(unix)]
    #[test]
    fn test_script_sink_success() {
        let sink = ScriptSink::new("true");
        assert!(sink.report(&sample(None)).is_ok());
    }
}

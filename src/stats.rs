//! Monitor counters
//!
//! Relaxed atomics bumped from the hooks and the scanner. Values are
//! approximate while threads are running.

use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};

/// Live counters shared by every component of a monitor
#[derive(Debug, Default)]
pub struct MonitorStats {
    reports_emitted: AtomicU64,
    report_failures: AtomicU64,
    trace_tokens_dropped: AtomicU64,
    scan_passes: AtomicU64,
}

impl MonitorStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_report(&self) {
        self.reports_emitted.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_report_failure(&self) {
        self.report_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_trace_drop(&self) {
        self.trace_tokens_dropped.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_scan_pass(&self) {
        self.scan_passes.fetch_add(1, Ordering::Relaxed);
    }

    /// Copy the counters; `growth_events` comes from the registry
    pub fn snapshot(&self, growth_events: u64) -> StatsSnapshot {
        StatsSnapshot {
            reports_emitted: self.reports_emitted.load(Ordering::Relaxed),
            report_failures: self.report_failures.load(Ordering::Relaxed),
            trace_tokens_dropped: self.trace_tokens_dropped.load(Ordering::Relaxed),
            scan_passes: self.scan_passes.load(Ordering::Relaxed),
            growth_events,
        }
    }
}

/// Point-in-time copy of [`MonitorStats`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StatsSnapshot {
    pub reports_emitted: u64,
    pub report_failures: u64,
    pub trace_tokens_dropped: u64,
    pub scan_passes: u64,
    pub growth_events: u64,
}

impl StatsSnapshot {
    /// Fraction of handler invocations that failed (0.0 to 1.0)
    pub fn failure_rate(&self) -> f64 {
        let attempts = self.reports_emitted + self.report_failures;
        if attempts == 0 {
            0.0
        } else {
            self.report_failures as f64 / attempts as f64
        }
    }

    /// Print a summary to stderr
    pub fn print_summary(&self) {
        eprintln!("\n╔════════════════════════════════════════════════════════════╗");
        eprintln!("║  Straggler Monitor Summary                                 ║");
        eprintln!("╚════════════════════════════════════════════════════════════╝");
        eprintln!("Stragglers reported:       {}", self.reports_emitted);
        eprintln!("Handler failures:          {}", self.report_failures);
        eprintln!("Trace tokens dropped:      {}", self.trace_tokens_dropped);
        eprintln!("Scan passes:               {}", self.scan_passes);
        eprintln!("Slot table growths:        {}", self.growth_events);
    }
}

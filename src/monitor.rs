//! The straggler monitor: the context object an embedding harness owns
//!
//! `StragglerMonitor` wires the registry, hooks, nested-call recorder,
//! scanner and report sink together and exposes the interface the
//! instrumentation layer drives:
//!
//! ```text
//! instrumentation layer                 StragglerMonitor
//! ─────────────────────                 ────────────────
//! call site found in image  ─────────►  on_call_site_resolved(name) -> SiteId
//! thread created            ─────────►  on_thread_start(tid)   (may spawn scanner)
//! before monitored call     ─────────►  on_enter(site, tid)
//! nested call enter/exit    ─────────►  on_nested_enter / on_nested_exit
//! after monitored call      ─────────►  on_exit(site, tid)     (may report)
//! thread destroyed          ─────────►  on_thread_end(tid)     (may stop scanner)
//! ```
//!
//! The monitor is cheap to clone; all clones share the same state.

use crate::clock::{Clock, MonotonicClock};
use crate::config::{CallSiteSpec, MonitorConfig};
use crate::error::{ConfigError, MonitorError};
use crate::hooks::HookDispatcher;
use crate::registry::{CallSiteRecord, CallSiteRegistry, SiteDump, SiteId, ThreadId};
use crate::report::ReportSink;
use crate::scanner::{scan_pass, Detector, ScannerState, StragglerScanner};
use crate::stats::{MonitorStats, StatsSnapshot};
use crate::trace::CallTraceRecorder;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

#[derive(Debug)]
struct MonitorInner {
    config: MonitorConfig,
    registry: Arc<CallSiteRegistry>,
    detector: Arc<Detector>,
    hooks: HookDispatcher,
    tracer: CallTraceRecorder,
    scanner: StragglerScanner,
    stats: Arc<MonitorStats>,
    /// Configured call sites not yet confirmed by the instrumentation layer
    pending: Mutex<HashMap<String, CallSiteSpec>>,
}

/// Straggler detector embedded in a monitored process
///
/// # Example
///
/// ```
/// use std::sync::Arc;
/// use std::time::Duration;
/// use straggler::clock::FakeClock;
/// use straggler::config::MonitorConfig;
/// use straggler::monitor::StragglerMonitor;
/// use straggler::report::MemorySink;
///
/// let clock = Arc::new(FakeClock::new(1));
/// let sink = Arc::new(MemorySink::new());
/// let config = MonitorConfig { autostart_scanner: false, ..Default::default() };
/// let monitor = StragglerMonitor::new(config, clock.clone(), sink.clone())?;
///
/// let site = monitor.register_call_site("slow_fn", Duration::from_millis(5), &[])?.unwrap();
/// monitor.on_thread_start(3)?;
/// monitor.on_enter(site, 3);
/// clock.advance(10_000_000);
/// monitor.on_exit(site, 3);
///
/// assert_eq!(sink.reports()[0].elapsed_nanos, 10_000_000);
/// # Ok::<(), anyhow::Error>(())
/// ```
#[derive(Debug, Clone)]
pub struct StragglerMonitor {
    inner: Arc<MonitorInner>,
}

impl StragglerMonitor {
    /// Build a monitor with an explicit clock and sink
    pub fn new(
        config: MonitorConfig,
        clock: Arc<dyn Clock>,
        sink: Arc<dyn ReportSink>,
    ) -> Result<Self, ConfigError> {
        config.validate()?;

        let stats = Arc::new(MonitorStats::new());
        let registry = Arc::new(CallSiteRegistry::new(
            config.initial_slot_capacity,
            config.trace_capacity(),
        ));
        let detector = Arc::new(Detector::new(clock, sink, stats.clone()));
        let hooks = HookDispatcher::new(registry.clone(), detector.clone(), config.check_on_exit);
        let tracer =
            CallTraceRecorder::new(registry.clone(), stats.clone(), config.nested_call_tracing);
        let scanner = StragglerScanner::new(config.poll_interval());

        Ok(Self {
            inner: Arc::new(MonitorInner {
                config,
                registry,
                detector,
                hooks,
                tracer,
                scanner,
                stats,
                pending: Mutex::new(HashMap::new()),
            }),
        })
    }

    /// Build a monitor on the process monotonic clock
    pub fn with_sink(
        config: MonitorConfig,
        sink: Arc<dyn ReportSink>,
    ) -> Result<Self, ConfigError> {
        Self::new(config, Arc::new(MonotonicClock::new()), sink)
    }

    /// Build a monitor whose call sites come from a parsed call-site file
    ///
    /// The sites stay pending until [`on_call_site_resolved`] confirms them.
    /// For duplicate names the first definition wins.
    ///
    /// [`on_call_site_resolved`]: Self::on_call_site_resolved
    pub fn from_specs(
        specs: Vec<CallSiteSpec>,
        config: MonitorConfig,
        clock: Arc<dyn Clock>,
        sink: Arc<dyn ReportSink>,
    ) -> Result<Self, ConfigError> {
        let monitor = Self::new(config, clock, sink)?;
        {
            let mut pending = monitor.pending();
            for spec in specs {
                pending.entry(spec.name.clone()).or_insert(spec);
            }
        }
        Ok(monitor)
    }

    fn pending(&self) -> std::sync::MutexGuard<'_, HashMap<String, CallSiteSpec>> {
        self.inner
            .pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    pub fn config(&self) -> &MonitorConfig {
        &self.inner.config
    }

    pub fn registry(&self) -> &CallSiteRegistry {
        &self.inner.registry
    }

    /// Register a call site directly; idempotent
    pub fn register_call_site(
        &self,
        name: &str,
        threshold: Duration,
        nested_calls: &[String],
    ) -> Result<Option<SiteId>, MonitorError> {
        let threshold_nanos = u64::try_from(threshold.as_nanos()).unwrap_or(u64::MAX);
        self.inner
            .registry
            .register_call_site(name, threshold_nanos, nested_calls)
    }

    /// The instrumentation layer found `name` in the running program
    ///
    /// Returns the site id if `name` was configured (or registered earlier),
    /// `None` if nobody asked to monitor it.
    pub fn on_call_site_resolved(&self, name: &str) -> Result<Option<SiteId>, MonitorError> {
        if let Some(id) = self.inner.registry.id_of(name) {
            return Ok(Some(id));
        }

        let Some(spec) = self.pending().get(name).cloned() else {
            return Ok(None);
        };
        let id = self.inner.registry.register_call_site(
            &spec.name,
            spec.threshold_nanos,
            &spec.nested_calls,
        )?;
        if id.is_some() {
            tracing::info!(call_site = name, "Procedure located");
            self.pending().remove(name);
        }
        Ok(id)
    }

    /// Resolve a registered site by name
    pub fn lookup(&self, name: &str) -> Option<Arc<CallSiteRecord>> {
        self.inner.registry.lookup(name)
    }

    /// Configured names still waiting for resolution, sorted
    pub fn pending_call_sites(&self) -> Vec<String> {
        let mut names: Vec<_> = self.pending().keys().cloned().collect();
        names.sort();
        names
    }

    #[inline]
    pub fn on_enter(&self, site: SiteId, thread_id: ThreadId) {
        self.inner.hooks.on_enter(site, thread_id);
    }

    #[inline]
    pub fn on_exit(&self, site: SiteId, thread_id: ThreadId) {
        self.inner.hooks.on_exit(site, thread_id);
    }

    #[inline]
    pub fn on_nested_enter(&self, thread_id: ThreadId, label: &str) {
        self.inner.tracer.record_enter(thread_id, label);
    }

    #[inline]
    pub fn on_nested_exit(&self, thread_id: ThreadId, label: &str) {
        self.inner.tracer.record_exit(thread_id, label);
    }

    /// A thread was created; grows slot tables and may start the scanner
    ///
    /// An error here means the monitor cannot cover the thread and the
    /// session should end.
    pub fn on_thread_start(&self, thread_id: ThreadId) -> Result<(), MonitorError> {
        let autostart = self.inner.config.autostart_scanner;
        let spawn = self.inner.registry.thread_started(thread_id, |_live| {
            autostart && self.inner.scanner.request_start()
        })?;

        if spawn {
            self.inner
                .scanner
                .spawn(self.inner.registry.clone(), self.inner.detector.clone())?;
        }
        Ok(())
    }

    /// A thread is going away; the last one stops the scanner
    pub fn on_thread_end(&self, thread_id: ThreadId) {
        self.inner.registry.thread_ended(thread_id, |live| {
            if live == 0 {
                self.inner.scanner.request_stop();
            }
        });
    }

    /// Run one detection pass on the calling thread
    pub fn scan_once(&self) -> usize {
        scan_pass(&self.inner.registry, &self.inner.detector)
    }

    pub fn scanner_state(&self) -> ScannerState {
        self.inner.scanner.state()
    }

    pub fn live_thread_count(&self) -> usize {
        self.inner.registry.live_thread_count()
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.inner
            .stats
            .snapshot(self.inner.registry.growth_events())
    }

    /// Per-site dump of valid slots
    pub fn snapshot(&self) -> Vec<SiteDump> {
        self.inner.registry.dump()
    }

    /// Stop the scanner and wait for it, whatever the live-thread count
    pub fn shutdown(&self) {
        self.inner.scanner.request_stop();
        self.inner.scanner.join();
    }
}

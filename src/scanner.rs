//! Straggler detection and the background scanner
//!
//! Detection is a single primitive, [`check_slot`], shared by two callers:
//! the scanner thread, which sweeps every valid slot once per poll interval,
//! and the exit hook, which checks the exiting thread's own slot before
//! clearing it. Both funnel into [`Detector::check_and_report`], so a
//! straggler may be reported twice. Duplicates are tolerated.
//!
//! # Scanner lifecycle
//!
//! ```text
//!            first live thread              last live thread ends
//!  Stopped ───────────────────► Running ─────────────────────────► Draining
//!     ▲                            ▲                                  │
//!     │                            └──── a thread starts again ───────┤
//!     └────────────────── scanner loop observes Draining ─────────────┘
//! ```
//!
//! `request_start`/`request_stop` run under the registry lock, so the state
//! always agrees with the live-thread count.

use crate::clock::Clock;
use crate::error::MonitorError;
use crate::registry::{CallSiteRecord, CallSiteRegistry};
use crate::report::{ReportSink, StragglerReport};
use crate::slot::{read_possibly_stale_timestamp, ThreadSlot};
use crate::stats::MonitorStats;
use crossbeam::channel::{self, Receiver, Sender};
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::Duration;

/// Evaluate one slot against its call site's threshold
///
/// The timestamp is read twice, once to skip idle slots and once to compute
/// the elapsed time. If the owner cleared it in between, `elapsed == now`
/// and the reading is discarded. That test is a heuristic with a narrow
/// window, not a race detector: a slot re-entered between the two reads
/// is measured from its new entry time.
pub fn check_slot(
    record: &CallSiteRecord,
    thread_id: usize,
    slot: &ThreadSlot,
    clock: &dyn Clock,
) -> Option<StragglerReport> {
    if read_possibly_stale_timestamp(slot) == 0 {
        return None;
    }

    let now = clock.now_nanos();
    let entry = read_possibly_stale_timestamp(slot);
    let elapsed = now.saturating_sub(entry);
    if elapsed == now {
        return None;
    }
    if elapsed <= record.threshold_nanos() {
        return None;
    }

    Some(StragglerReport {
        call_site_name: record.name().to_string(),
        thread_id,
        entry_timestamp_nanos: entry,
        observation_timestamp_nanos: now,
        elapsed_nanos: elapsed,
        nested_call_trace: slot.trace().map(|trace| trace.read()),
    })
}

/// Detection routine plus the sink it reports into
pub struct Detector {
    clock: Arc<dyn Clock>,
    sink: Arc<dyn ReportSink>,
    stats: Arc<MonitorStats>,
}

impl std::fmt::Debug for Detector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Detector").field("stats", &self.stats).finish()
    }
}

impl Detector {
    pub fn new(clock: Arc<dyn Clock>, sink: Arc<dyn ReportSink>, stats: Arc<MonitorStats>) -> Self {
        Self { clock, sink, stats }
    }

    #[inline]
    pub fn clock(&self) -> &dyn Clock {
        &*self.clock
    }

    pub fn stats(&self) -> &MonitorStats {
        &self.stats
    }

    /// Check a slot and hand any straggler to the sink
    ///
    /// A failing sink is logged; detection carries on.
    pub fn check_and_report(
        &self,
        record: &CallSiteRecord,
        thread_id: usize,
        slot: &ThreadSlot,
    ) -> bool {
        let Some(report) = check_slot(record, thread_id, slot, &*self.clock) else {
            return false;
        };

        match self.sink.report(&report) {
            Ok(()) => self.stats.record_report(),
            Err(e) => {
                self.stats.record_report_failure();
                tracing::error!(
                    call_site = record.name(),
                    thread = thread_id,
                    "Straggler report failed: {}",
                    e
                );
            }
        }
        true
    }
}

/// Sweep every valid slot of every call site once
///
/// Returns the number of stragglers caught.
pub fn scan_pass(registry: &CallSiteRegistry, detector: &Detector) -> usize {
    let snapshot = registry.snapshot();
    let mut caught = 0;

    for record in snapshot.sites.iter() {
        let slots = record.slots().load();
        let limit = snapshot.thread_limit.min(slots.capacity());
        for thread_id in 0..limit {
            let Some(slot) = slots.get(thread_id) else {
                continue;
            };
            if slot.is_valid() && detector.check_and_report(record, thread_id, slot) {
                caught += 1;
            }
        }
    }

    detector.stats().record_scan_pass();
    caught
}

/// Lifecycle state of the background scanner
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ScannerState {
    Stopped = 0,
    Running = 1,
    Draining = 2,
}

impl ScannerState {
    fn from_u8(value: u8) -> Self {
        match value {
            1 => Self::Running,
            2 => Self::Draining,
            _ => Self::Stopped,
        }
    }
}

#[derive(Debug)]
struct ScannerControl {
    state: AtomicU8,
    wake_tx: Sender<()>,
    wake_rx: Receiver<()>,
}

impl ScannerControl {
    fn transition(&self, from: ScannerState, to: ScannerState) -> bool {
        self.state
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    fn state(&self) -> ScannerState {
        ScannerState::from_u8(self.state.load(Ordering::Acquire))
    }
}

/// Background thread that periodically sweeps for stragglers
#[derive(Debug)]
pub struct StragglerScanner {
    control: Arc<ScannerControl>,
    handle: Mutex<Option<JoinHandle<()>>>,
    poll_interval: Duration,
}

impl StragglerScanner {
    pub fn new(poll_interval: Duration) -> Self {
        let (wake_tx, wake_rx) = channel::bounded(1);
        Self {
            control: Arc::new(ScannerControl {
                state: AtomicU8::new(ScannerState::Stopped as u8),
                wake_tx,
                wake_rx,
            }),
            handle: Mutex::new(None),
            poll_interval,
        }
    }

    pub fn state(&self) -> ScannerState {
        self.control.state()
    }

    pub fn poll_interval(&self) -> Duration {
        self.poll_interval
    }

    /// Enter `Running`; returns `true` when a new scanner thread must be spawned
    ///
    /// A scanner still draining is revived instead of replaced.
    pub fn request_start(&self) -> bool {
        loop {
            match self.control.state() {
                ScannerState::Running => return false,
                ScannerState::Draining => {
                    if self
                        .control
                        .transition(ScannerState::Draining, ScannerState::Running)
                    {
                        return false;
                    }
                }
                ScannerState::Stopped => {
                    if self
                        .control
                        .transition(ScannerState::Stopped, ScannerState::Running)
                    {
                        return true;
                    }
                }
            }
        }
    }

    /// Ask a running scanner to finish after its current pass
    pub fn request_stop(&self) {
        if self.control.transition(ScannerState::Running, ScannerState::Draining) {
            let _ = self.control.wake_tx.try_send(());
        }
    }

    /// Start the scanner thread; call after `request_start` returned `true`
    pub fn spawn(
        &self,
        registry: Arc<CallSiteRegistry>,
        detector: Arc<Detector>,
    ) -> Result<(), MonitorError> {
        let control = Arc::clone(&self.control);
        let interval = self.poll_interval;
        let spawned = thread::Builder::new()
            .name("straggler-scanner".to_string())
            .spawn(move || Self::run(&control, &registry, &detector, interval));

        let handle = match spawned {
            Ok(handle) => handle,
            Err(e) => {
                self.control
                    .transition(ScannerState::Running, ScannerState::Stopped);
                return Err(MonitorError::ScannerSpawn(e));
            }
        };

        let previous = self
            .handle
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .replace(handle);
        if let Some(previous) = previous {
            // Already past its loop: it moved to Stopped before we could start
            let _ = previous.join();
        }
        Ok(())
    }

    /// Wait for the scanner thread, if any, to exit
    pub fn join(&self) {
        let handle = self
            .handle
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(handle) = handle {
            let _ = handle.join();
        }
    }

    fn run(
        control: &ScannerControl,
        registry: &CallSiteRegistry,
        detector: &Detector,
        interval: Duration,
    ) {
        tracing::info!(interval_ms = interval.as_millis() as u64, "Straggler scanner starting");

        loop {
            let _ = control.wake_rx.recv_timeout(interval);

            if control.state() == ScannerState::Draining {
                if control.transition(ScannerState::Draining, ScannerState::Stopped) {
                    break;
                }
                continue;
            }

            let caught = scan_pass(registry, detector);
            if caught > 0 {
                tracing::debug!(caught, "Scan pass caught stragglers");
            }
        }

        tracing::info!("Straggler scanner exiting");
    }
}

impl Drop for StragglerScanner {
    fn drop(&mut self) {
        self.control
            .state
            .store(ScannerState::Draining as u8, Ordering::Release);
        let _ = self.control.wake_tx.try_send(());
        self.join();
    }
}

//! Nested-call trace recording
//!
//! While a monitored call is outstanding on a thread, calls to its tracked
//! nested functions append `label-->` on entry and `label<--` on exit to
//! that thread's trace buffer. The buffer is rewound when the monitored call
//! is entered again and left alone on exit, so a report raised at exit (or
//! shortly after, by the scanner) still carries the trace.

use crate::registry::{CallSiteRegistry, ThreadId};
use crate::stats::MonitorStats;
use std::sync::Arc;

pub const ENTER_MARKER: &str = "-->";
pub const EXIT_MARKER: &str = "<--";

/// Appends nested-call markers to outstanding call sites' trace buffers
#[derive(Debug)]
pub struct CallTraceRecorder {
    registry: Arc<CallSiteRegistry>,
    stats: Arc<MonitorStats>,
    enabled: bool,
}

impl CallTraceRecorder {
    pub fn new(registry: Arc<CallSiteRegistry>, stats: Arc<MonitorStats>, enabled: bool) -> Self {
        Self {
            registry,
            stats,
            enabled,
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    #[inline]
    pub fn record_enter(&self, thread_id: ThreadId, label: &str) {
        self.record(thread_id, label, ENTER_MARKER);
    }

    #[inline]
    pub fn record_exit(&self, thread_id: ThreadId, label: &str) {
        self.record(thread_id, label, EXIT_MARKER);
    }

    fn record(&self, thread_id: ThreadId, label: &str, marker: &str) {
        if !self.enabled {
            return;
        }

        self.registry.for_each_site_unlocked(|record| {
            if !record.tracks_nested(label) {
                return;
            }
            record.slots().with_slot(thread_id, |slot| {
                if !slot.is_outstanding() {
                    return;
                }
                let Some(buffer) = slot.trace() else {
                    return;
                };
                if !buffer.append(label, marker) {
                    self.stats.record_trace_drop();
                    if buffer.first_overflow() {
                        tracing::warn!(
                            call_site = record.name(),
                            thread = thread_id,
                            capacity = buffer.capacity(),
                            "Trace buffer full, dropping nested call markers"
                        );
                    }
                }
            });
        });
    }
}

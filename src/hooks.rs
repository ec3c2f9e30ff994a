//! Entry and exit hooks called by the instrumentation layer
//!
//! Both hooks run on the monitored thread for every invocation of a
//! monitored call site. They take no locks and never allocate; unknown
//! sites or thread ids outside the slot table are ignored.

use crate::registry::{CallSiteRegistry, SiteId, ThreadId};
use crate::scanner::Detector;
use std::sync::Arc;

/// Hot-path dispatcher for `on_enter`/`on_exit`
#[derive(Debug)]
pub struct HookDispatcher {
    registry: Arc<CallSiteRegistry>,
    detector: Arc<Detector>,
    check_on_exit: bool,
}

impl HookDispatcher {
    pub fn new(
        registry: Arc<CallSiteRegistry>,
        detector: Arc<Detector>,
        check_on_exit: bool,
    ) -> Self {
        Self {
            registry,
            detector,
            check_on_exit,
        }
    }

    /// Stamp the entry time of `site` on `thread_id`
    #[inline]
    pub fn on_enter(&self, site: SiteId, thread_id: ThreadId) {
        let clock = self.detector.clock();
        self.registry.with_site(site, |record| {
            record
                .slots()
                .with_slot(thread_id, |slot| slot.begin(clock.now_nanos()))
        });
    }

    /// Optionally check for a straggler, then count the call and clear the entry time
    #[inline]
    pub fn on_exit(&self, site: SiteId, thread_id: ThreadId) {
        self.registry.with_site(site, |record| {
            record.slots().with_slot(thread_id, |slot| {
                if self.check_on_exit {
                    self.detector.check_and_report(record, thread_id, slot);
                }
                slot.finish();
            })
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::{Clock, FakeClock};
    use crate::report::MemorySink;
    use crate::stats::MonitorStats;

    fn setup(
        check_on_exit: bool,
    ) -> (Arc<CallSiteRegistry>, Arc<FakeClock>, Arc<MemorySink>, HookDispatcher) {
        let registry = Arc::new(CallSiteRegistry::new(4, None));
        let clock = Arc::new(FakeClock::new(100));
        let sink = Arc::new(MemorySink::new());
        let detector = Arc::new(Detector::new(
            clock.clone(),
            sink.clone(),
            Arc::new(MonitorStats::new()),
        ));
        let hooks = HookDispatcher::new(registry.clone(), detector, check_on_exit);
        (registry, clock, sink, hooks)
    }

    #[test]
    fn test_enter_exit_updates_slot() {
        let (registry, clock, _sink, hooks) = setup(true);
        let site = registry.register_call_site("f", 1_000, &[]).unwrap().unwrap();
        registry.thread_started(1, |_| ()).unwrap();
        let record = registry.lookup("f").unwrap();

        hooks.on_enter(site, 1);
        assert_eq!(
            record.slots().with_slot(1, |s| s.snapshot(1).entry_timestamp_nanos),
            Some(clock.now_nanos())
        );

        hooks.on_exit(site, 1);
        let snapshot = record.slots().with_slot(1, |s| s.snapshot(1)).unwrap();
        assert_eq!(snapshot.entry_timestamp_nanos, 0);
        assert_eq!(snapshot.invocation_count, 1);
    }

    #[test]
    fn test_exit_reports_straggler() {
        let (registry, clock, sink, hooks) = setup(true);
        let site = registry.register_call_site("f", 1_000, &[]).unwrap().unwrap();
        registry.thread_started(0, |_| ()).unwrap();

        hooks.on_enter(site, 0);
        clock.advance(5_000);
        hooks.on_exit(site, 0);

        let reports = sink.reports();
        assert_eq!(reports.len(), 1);
        assert_eq!(reports[0].elapsed_nanos, 5_000);
    }

    #[test]
    fn test_exit_check_can_be_disabled() {
        let (registry, clock, sink, hooks) = setup(false);
        let site = registry.register_call_site("f", 1_000, &[]).unwrap().unwrap();
        registry.thread_started(0, |_| ()).unwrap();

        hooks.on_enter(site, 0);
        clock.advance(5_000);
        hooks.on_exit(site, 0);
        assert!(sink.is_empty());
    }

    #[test]
    fn test_unknown_site_and_thread_are_ignored() {
        let (registry, _clock, sink, hooks) = setup(true);
        let site = registry.register_call_site("f", 1, &[]).unwrap().unwrap();

        hooks.on_enter(SiteId(99), 0);
        hooks.on_exit(SiteId(99), 0);
        // Thread 50 is beyond the table
        hooks.on_enter(site, 50);
        hooks.on_exit(site, 50);
        assert!(sink.is_empty());
    }
}

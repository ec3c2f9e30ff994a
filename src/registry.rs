//! Call-site registry
//!
//! Owns every monitored `CallSiteRecord`. Records are published through an
//! `ArcSwap` so the hooks resolve a `SiteId` without locking. The registry
//! mutex guards structural changes only: registration, slot-table growth,
//! validity flags, and the live-thread set. It is never held across a
//! timestamp read or write.

use crate::error::MonitorError;
use crate::slot::SlotSnapshot;
use crate::slot_table::{grown_capacity, ThreadSlotTable};
use arc_swap::ArcSwap;
use serde::Serialize;
use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

/// Thread id as handed out by the instrumentation layer (monotonic, never reused)
pub type ThreadId = usize;

/// Stable handle of a registered call site
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct SiteId(pub usize);

/// A monitored call site and its per-thread timing slots
#[derive(Debug)]
pub struct CallSiteRecord {
    id: SiteId,
    name: String,
    threshold_nanos: u64,
    nested_calls: Vec<String>,
    slots: ThreadSlotTable,
}

impl CallSiteRecord {
    pub fn id(&self) -> SiteId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn threshold_nanos(&self) -> u64 {
        self.threshold_nanos
    }

    pub fn threshold(&self) -> Duration {
        Duration::from_nanos(self.threshold_nanos)
    }

    pub fn nested_calls(&self) -> &[String] {
        &self.nested_calls
    }

    /// Whether nested calls named `label` are recorded into this site's traces
    #[inline]
    pub fn tracks_nested(&self, label: &str) -> bool {
        self.slots.traces_nested_calls() && self.nested_calls.iter().any(|n| n == label)
    }

    pub fn slots(&self) -> &ThreadSlotTable {
        &self.slots
    }
}

/// Diagnostic dump of one call site
#[derive(Debug, Clone, Serialize)]
pub struct SiteDump {
    pub name: String,
    pub threshold_nanos: u64,
    pub capacity: usize,
    pub slots: Vec<SlotSnapshot>,
}

/// Consistent view of the registry taken at the start of a scan pass
#[derive(Debug, Clone)]
pub struct RegistrySnapshot {
    pub sites: Arc<Vec<Arc<CallSiteRecord>>>,
    /// Scan slots `0..thread_limit`
    pub thread_limit: usize,
}

#[derive(Debug, Default)]
struct RegistryState {
    by_name: HashMap<String, SiteId>,
    live_threads: BTreeSet<ThreadId>,
    highest_thread_id: Option<ThreadId>,
    growth_events: u64,
}

impl RegistryState {
    fn thread_limit(&self) -> usize {
        self.highest_thread_id.map_or(0, |tid| tid.saturating_add(1))
    }
}

/// Registry of monitored call sites
#[derive(Debug)]
pub struct CallSiteRegistry {
    state: Mutex<RegistryState>,
    sites: ArcSwap<Vec<Arc<CallSiteRecord>>>,
    initial_capacity: usize,
    trace_capacity: Option<usize>,
}

impl CallSiteRegistry {
    /// Create an empty registry
    ///
    /// New slot tables start at `initial_capacity` slots. When
    /// `trace_capacity` is `Some`, sites with nested calls get trace buffers
    /// of that many bytes per thread.
    pub fn new(initial_capacity: usize, trace_capacity: Option<usize>) -> Self {
        Self {
            state: Mutex::new(RegistryState::default()),
            sites: ArcSwap::from_pointee(Vec::new()),
            initial_capacity: initial_capacity.max(1),
            trace_capacity,
        }
    }

    fn lock(&self) -> MutexGuard<'_, RegistryState> {
        // Every critical section leaves the state consistent
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Register `name` with the given threshold; idempotent
    ///
    /// Returns `Ok(None)` for an empty name, which is logged and ignored.
    pub fn register_call_site(
        &self,
        name: &str,
        threshold_nanos: u64,
        nested_calls: &[String],
    ) -> Result<Option<SiteId>, MonitorError> {
        if name.is_empty() {
            tracing::warn!("Ignoring call site with empty name");
            return Ok(None);
        }

        let mut state = self.lock();
        if let Some(&id) = state.by_name.get(name) {
            return Ok(Some(id));
        }

        let capacity = match state.highest_thread_id {
            Some(tid) => grown_capacity(self.initial_capacity, tid)
                .ok_or(MonitorError::SlotAllocation {
                    requested: tid.saturating_add(1),
                })?,
            None => self.initial_capacity,
        };
        let trace_capacity = self.trace_capacity.filter(|_| !nested_calls.is_empty());
        let slots = ThreadSlotTable::try_new(capacity, trace_capacity)?;
        for &tid in &state.live_threads {
            slots.set_valid(tid, true);
        }

        let sites = self.sites.load();
        let id = SiteId(sites.len());
        let record = Arc::new(CallSiteRecord {
            id,
            name: name.to_string(),
            threshold_nanos,
            nested_calls: nested_calls.to_vec(),
            slots,
        });
        let mut next = Vec::with_capacity(sites.len() + 1);
        next.extend(sites.iter().cloned());
        next.push(record);
        self.sites.store(Arc::new(next));
        state.by_name.insert(name.to_string(), id);

        tracing::info!(
            call_site = name,
            threshold_ns = threshold_nanos,
            nested = nested_calls.len(),
            "Call site registered"
        );
        Ok(Some(id))
    }

    /// Resolve a name to its record; the result may be cached for the process lifetime
    pub fn lookup(&self, name: &str) -> Option<Arc<CallSiteRecord>> {
        let id = *self.lock().by_name.get(name)?;
        self.get(id)
    }

    pub fn id_of(&self, name: &str) -> Option<SiteId> {
        self.lock().by_name.get(name).copied()
    }

    /// Lock-free record access by id
    pub fn get(&self, site: SiteId) -> Option<Arc<CallSiteRecord>> {
        self.sites.load().get(site.0).cloned()
    }

    /// Lock-free borrow of a record for the duration of `f`
    #[inline]
    pub fn with_site<R>(&self, site: SiteId, f: impl FnOnce(&CallSiteRecord) -> R) -> Option<R> {
        self.sites.load().get(site.0).map(|record| f(record))
    }

    /// Lock-free iteration over all records, used by the nested-call recorder
    #[inline]
    pub fn for_each_site_unlocked(&self, mut f: impl FnMut(&CallSiteRecord)) {
        for record in self.sites.load().iter() {
            f(record);
        }
    }

    pub fn len(&self) -> usize {
        self.sites.load().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Take the structural snapshot a scan pass works from
    ///
    /// The lock is held only while the snapshot is taken.
    pub fn snapshot(&self) -> RegistrySnapshot {
        let state = self.lock();
        RegistrySnapshot {
            sites: self.sites.load_full(),
            thread_limit: state.thread_limit(),
        }
    }

    /// Visit every record with the current scan limit
    pub fn for_each_call_site(&self, mut f: impl FnMut(&CallSiteRecord, usize)) {
        let snapshot = self.snapshot();
        for record in snapshot.sites.iter() {
            f(record, snapshot.thread_limit);
        }
    }

    /// Make room for `thread_id` in every table, mark its slots valid, and
    /// add it to the live set
    ///
    /// `then` runs under the registry lock with the new live-thread count.
    pub fn thread_started<R>(
        &self,
        thread_id: ThreadId,
        then: impl FnOnce(usize) -> R,
    ) -> Result<R, MonitorError> {
        // Every table, present or future, must be able to hold this id
        grown_capacity(self.initial_capacity, thread_id).ok_or(MonitorError::SlotAllocation {
            requested: thread_id.saturating_add(1),
        })?;

        let mut state = self.lock();
        let sites = self.sites.load();
        for record in sites.iter() {
            if record.slots.ensure_capacity(thread_id)? {
                state.growth_events += 1;
                tracing::debug!(
                    call_site = record.name(),
                    capacity = record.slots.capacity(),
                    "Reallocated thread slots"
                );
            }
        }

        // Every table has room now; a failed start above leaves no trace
        for record in sites.iter() {
            record.slots.set_valid(thread_id, true);
        }
        let highest = state.highest_thread_id.map_or(thread_id, |h| h.max(thread_id));
        state.highest_thread_id = Some(highest);
        state.live_threads.insert(thread_id);
        Ok(then(state.live_threads.len()))
    }

    /// Mark `thread_id` invalid everywhere and drop it from the live set
    ///
    /// `then` runs under the registry lock with the new live-thread count.
    pub fn thread_ended<R>(&self, thread_id: ThreadId, then: impl FnOnce(usize) -> R) -> R {
        let mut state = self.lock();
        for record in self.sites.load().iter() {
            record.slots.set_valid(thread_id, false);
        }
        state.live_threads.remove(&thread_id);
        then(state.live_threads.len())
    }

    pub fn live_thread_count(&self) -> usize {
        self.lock().live_threads.len()
    }

    pub fn highest_thread_id(&self) -> Option<ThreadId> {
        self.lock().highest_thread_id
    }

    pub fn growth_events(&self) -> u64 {
        self.lock().growth_events
    }

    /// Valid slots of every site, for debugging
    pub fn dump(&self) -> Vec<SiteDump> {
        let snapshot = self.snapshot();
        snapshot
            .sites
            .iter()
            .map(|record| SiteDump {
                name: record.name.clone(),
                threshold_nanos: record.threshold_nanos,
                capacity: record.slots.capacity(),
                slots: record
                    .slots
                    .snapshots(snapshot.thread_limit)
                    .into_iter()
                    .filter(|slot| slot.valid)
                    .collect(),
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registry() -> CallSiteRegistry {
        CallSiteRegistry::new(4, Some(64))
    }

    #[test]
    fn test_register_is_idempotent() {
        let registry = registry();
        let first = registry.register_call_site("foo", 100, &[]).unwrap();
        let second = registry.register_call_site("foo", 999, &[]).unwrap();
        assert_eq!(first, second);
        assert_eq!(registry.len(), 1);
        assert_eq!(registry.lookup("foo").unwrap().threshold_nanos(), 100);
    }

    #[test]
    fn test_register_empty_name_is_ignored() {
        let registry = registry();
        assert_eq!(registry.register_call_site("", 100, &[]).unwrap(), None);
        assert!(registry.is_empty());
    }

    #[test]
    fn test_lookup_unknown() {
        let registry = registry();
        assert!(registry.lookup("missing").is_none());
        assert!(registry.get(SiteId(3)).is_none());
    }

    #[test]
    fn test_lookup_identity_is_stable() {
        let registry = registry();
        registry.register_call_site("a", 1, &[]).unwrap();
        let before = registry.lookup("a").unwrap();
        registry.register_call_site("b", 1, &[]).unwrap();
        let after = registry.lookup("a").unwrap();
        assert!(Arc::ptr_eq(&before, &after));
    }

    #[test]
    fn test_thread_start_grows_every_table() {
        let registry = registry();
        registry.register_call_site("a", 1, &[]).unwrap();
        registry.register_call_site("b", 1, &[]).unwrap();

        let live = registry.thread_started(9, |live| live).unwrap();
        assert_eq!(live, 1);
        assert_eq!(registry.lookup("a").unwrap().slots().capacity(), 16);
        assert_eq!(registry.lookup("b").unwrap().slots().capacity(), 16);
        assert_eq!(registry.growth_events(), 2);
        assert_eq!(registry.highest_thread_id(), Some(9));
    }

    #[test]
    fn test_thread_lifecycle_toggles_validity() {
        let registry = registry();
        registry.register_call_site("a", 1, &[]).unwrap();
        registry.thread_started(1, |_| ()).unwrap();
        let record = registry.lookup("a").unwrap();
        assert_eq!(record.slots().with_slot(1, |s| s.is_valid()), Some(true));

        let live = registry.thread_ended(1, |live| live);
        assert_eq!(live, 0);
        assert_eq!(record.slots().with_slot(1, |s| s.is_valid()), Some(false));
    }

    #[test]
    fn test_late_registration_covers_live_threads() {
        let registry = registry();
        registry.thread_started(2, |_| ()).unwrap();
        registry.thread_started(6, |_| ()).unwrap();
        registry.register_call_site("late", 1, &[]).unwrap();

        let record = registry.lookup("late").unwrap();
        assert_eq!(record.slots().capacity(), 8);
        assert_eq!(record.slots().with_slot(2, |s| s.is_valid()), Some(true));
        assert_eq!(record.slots().with_slot(6, |s| s.is_valid()), Some(true));
        assert_eq!(record.slots().with_slot(3, |s| s.is_valid()), Some(false));
    }

    #[test]
    fn test_trace_buffers_only_for_nested_sites() {
        let registry = registry();
        registry.register_call_site("plain", 1, &[]).unwrap();
        registry
            .register_call_site("outer", 1, &["inner".to_string()])
            .unwrap();

        let plain = registry.lookup("plain").unwrap();
        let outer = registry.lookup("outer").unwrap();
        assert!(!plain.slots().traces_nested_calls());
        assert!(outer.tracks_nested("inner"));
        assert!(!outer.tracks_nested("other"));
    }

    #[test]
    fn test_tracing_disabled_registry() {
        let registry = CallSiteRegistry::new(4, None);
        registry
            .register_call_site("outer", 1, &["inner".to_string()])
            .unwrap();
        assert!(!registry.lookup("outer").unwrap().tracks_nested("inner"));
    }

    #[test]
    fn test_for_each_call_site_reports_limit() {
        let registry = registry();
        registry.register_call_site("a", 1, &[]).unwrap();
        registry.thread_started(3, |_| ()).unwrap();

        let mut seen = Vec::new();
        registry.for_each_call_site(|record, limit| seen.push((record.name().to_string(), limit)));
        assert_eq!(seen, vec![("a".to_string(), 4)]);
    }

    #[test]
    fn test_failed_thread_start_leaves_registry_intact() {
        let registry = registry();
        registry.register_call_site("a", 1, &[]).unwrap();
        registry.thread_started(3, |_| ()).unwrap();

        let err = registry.thread_started(usize::MAX, |_| ()).unwrap_err();
        assert!(matches!(err, MonitorError::SlotAllocation { .. }));
        assert_eq!(registry.highest_thread_id(), Some(3));
        assert_eq!(registry.live_thread_count(), 1);
        assert_eq!(registry.snapshot().thread_limit, 4);

        // Registration and later threads still work
        registry.register_call_site("b", 1, &[]).unwrap();
        assert_eq!(registry.lookup("b").unwrap().slots().capacity(), 4);
        registry.thread_started(5, |_| ()).unwrap();
        assert_eq!(registry.highest_thread_id(), Some(5));
    }

    #[test]
    fn test_unrepresentable_thread_id_rejected_without_sites() {
        let registry = registry();
        assert!(registry.thread_started(usize::MAX, |_| ()).is_err());
        assert_eq!(registry.highest_thread_id(), None);
        assert_eq!(registry.snapshot().thread_limit, 0);
        assert!(registry.register_call_site("a", 1, &[]).unwrap().is_some());
    }

    #[test]
    fn test_dump_lists_valid_slots() {
        let registry = registry();
        registry.register_call_site("a", 1, &[]).unwrap();
        registry.thread_started(0, |_| ()).unwrap();
        registry.thread_started(2, |_| ()).unwrap();
        registry.thread_ended(0, |_| ());

        let dump = registry.dump();
        assert_eq!(dump.len(), 1);
        let tids: Vec<_> = dump[0].slots.iter().map(|s| s.thread_id).collect();
        assert_eq!(tids, vec![2]);
    }
}

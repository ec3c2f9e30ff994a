//! Growable thread-id-indexed slot table
//!
//! The table is a versioned, immutable-length `SlotArray` published through
//! an `ArcSwap`. Growth never touches the live array: it builds a complete
//! replacement, copies every existing slot by value, and swaps the pointer.
//! A reader still holding the previous array sees a consistent (possibly
//! stale) table, never a half-written one.
//!
//! ```text
//!   ArcSwap ──► SlotArray v1 [32 slots]
//!                     │ ensure_capacity(40)
//!                     ▼ copy 32 + zero 32
//!   ArcSwap ──► SlotArray v2 [64 slots]      (v1 dropped when last reader leaves)
//! ```
//!
//! Writes an owning thread makes to v1 after the copy are lost. Growth is
//! rare and happens at thread start, so the loss is accepted.

use crate::error::MonitorError;
use crate::slot::{SlotSnapshot, ThreadSlot};
use arc_swap::{ArcSwap, Guard};
use crossbeam::utils::CachePadded;
use std::sync::Arc;

/// One published generation of slots
#[derive(Debug)]
pub struct SlotArray {
    version: u64,
    slots: Box<[CachePadded<ThreadSlot>]>,
}

impl SlotArray {
    fn try_build(
        version: u64,
        capacity: usize,
        previous: &[CachePadded<ThreadSlot>],
        trace_capacity: Option<usize>,
    ) -> Result<Self, MonitorError> {
        let exhausted = || MonitorError::SlotAllocation {
            requested: capacity,
        };

        let mut slots = Vec::new();
        slots.try_reserve_exact(capacity).map_err(|_| exhausted())?;
        for old in previous.iter().take(capacity) {
            slots.push(CachePadded::new(old.try_copy().ok_or_else(exhausted)?));
        }
        while slots.len() < capacity {
            slots.push(CachePadded::new(
                ThreadSlot::try_new(trace_capacity).ok_or_else(exhausted)?,
            ));
        }

        Ok(Self {
            version,
            slots: slots.into_boxed_slice(),
        })
    }

    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    #[inline]
    pub fn get(&self, thread_id: usize) -> Option<&ThreadSlot> {
        self.slots.get(thread_id).map(|slot| &**slot)
    }
}

/// Smallest `base * 2^k` strictly greater than `thread_id`
///
/// Returns `None` if the doubling sequence overflows `usize`.
pub fn grown_capacity(base: usize, thread_id: usize) -> Option<usize> {
    let mut capacity = base.max(1);
    while thread_id >= capacity {
        capacity = capacity.checked_mul(2)?;
    }
    Some(capacity)
}

/// Per-call-site table of thread slots
#[derive(Debug)]
pub struct ThreadSlotTable {
    current: ArcSwap<SlotArray>,
    trace_capacity: Option<usize>,
}

impl ThreadSlotTable {
    /// Allocate a table of `capacity` zeroed slots
    ///
    /// `trace_capacity` gives every slot a nested-call buffer of that size.
    pub fn try_new(capacity: usize, trace_capacity: Option<usize>) -> Result<Self, MonitorError> {
        let array = SlotArray::try_build(0, capacity.max(1), &[], trace_capacity)?;
        Ok(Self {
            current: ArcSwap::from_pointee(array),
            trace_capacity,
        })
    }

    /// Current generation of the table. Lock-free.
    #[inline]
    pub fn load(&self) -> Guard<Arc<SlotArray>> {
        self.current.load()
    }

    pub fn capacity(&self) -> usize {
        self.load().capacity()
    }

    pub fn version(&self) -> u64 {
        self.load().version()
    }

    pub fn traces_nested_calls(&self) -> bool {
        self.trace_capacity.is_some()
    }

    /// Grow until `thread_id < capacity`; caller holds the registry lock
    ///
    /// Returns whether a new array was published.
    pub fn ensure_capacity(&self, thread_id: usize) -> Result<bool, MonitorError> {
        let current = self.current.load_full();
        if thread_id < current.capacity() {
            return Ok(false);
        }

        let capacity = grown_capacity(current.capacity(), thread_id).ok_or(
            MonitorError::SlotAllocation {
                requested: thread_id.saturating_add(1),
            },
        )?;
        let grown = SlotArray::try_build(
            current.version() + 1,
            capacity,
            &current.slots,
            self.trace_capacity,
        )?;
        self.current.store(Arc::new(grown));
        Ok(true)
    }

    /// Run `f` on the slot for `thread_id` in the current generation
    #[inline]
    pub fn with_slot<R>(&self, thread_id: usize, f: impl FnOnce(&ThreadSlot) -> R) -> Option<R> {
        self.load().get(thread_id).map(f)
    }

    /// Set the validity flag; caller holds the registry lock
    pub fn set_valid(&self, thread_id: usize, valid: bool) {
        self.with_slot(thread_id, |slot| slot.set_valid(valid));
    }

    /// Snapshot of slots `0..limit`
    pub fn snapshots(&self, limit: usize) -> Vec<SlotSnapshot> {
        let array = self.load();
        (0..limit.min(array.capacity()))
            .filter_map(|tid| array.get(tid).map(|slot| slot.snapshot(tid)))
            .collect()
    }
}

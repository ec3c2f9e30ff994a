//! Per-thread, per-call-site timing slots
//!
//! A slot is written only by the thread that owns it and read by anyone.
//! Every field is an atomic accessed with `Relaxed` ordering: the scanner may
//! observe a slot that is stale or mid-update, and that imprecision is
//! accepted in exchange for a hot path free of locks and fences.
//!
//! ```text
//!  owning thread                         scanner thread
//!  ─────────────                         ──────────────
//!  on_enter: trace.reset()               read_possibly_stale_timestamp()
//!            entry = now                 trace.read()
//!  on_exit:  count += 1
//!            entry = 0
//! ```

use serde::Serialize;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, AtomicUsize, Ordering};

/// Separator appended after every trace token
const TOKEN_SEPARATOR: u8 = b' ';

/// Read the entry timestamp of a slot owned by another thread
///
/// This is the only sanctioned way for a non-owning thread to look at the
/// timestamp. The load is `Relaxed`: the value may lag behind the owner's
/// latest write, and two successive calls may disagree. `0` means the owner
/// was not inside the call at the moment of the read (or had just left it).
#[inline]
pub fn read_possibly_stale_timestamp(slot: &ThreadSlot) -> u64 {
    slot.entry_timestamp.load(Ordering::Relaxed)
}

/// Fixed-capacity byte buffer holding nested-call markers
///
/// Never reallocated after construction. Tokens that do not fit are refused.
#[derive(Debug)]
pub struct TraceBuffer {
    bytes: Box<[AtomicU8]>,
    cursor: AtomicUsize,
    overflow_warned: AtomicBool,
}

impl TraceBuffer {
    /// Allocate a zeroed buffer, or `None` if the allocator refuses
    pub fn try_new(capacity: usize) -> Option<Self> {
        let mut bytes = Vec::new();
        bytes.try_reserve_exact(capacity).ok()?;
        bytes.extend((0..capacity).map(|_| AtomicU8::new(0)));
        Some(Self {
            bytes: bytes.into_boxed_slice(),
            cursor: AtomicUsize::new(0),
            overflow_warned: AtomicBool::new(false),
        })
    }

    pub fn capacity(&self) -> usize {
        self.bytes.len()
    }

    /// Bytes written since the last reset
    pub fn len(&self) -> usize {
        self.cursor.load(Ordering::Acquire).min(self.bytes.len())
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Owner only. Rewind the write cursor.
    #[inline]
    pub fn reset(&self) {
        self.cursor.store(0, Ordering::Release);
    }

    /// Owner only. Append `label` followed by `marker` and a separator.
    ///
    /// Returns `false` and leaves the buffer untouched if the token does not
    /// fit in the remaining space.
    #[inline]
    pub fn append(&self, label: &str, marker: &str) -> bool {
        let start = self.cursor.load(Ordering::Relaxed);
        let token_len = label.len() + marker.len() + 1;
        let end = match start.checked_add(token_len) {
            Some(end) if end <= self.bytes.len() => end,
            _ => return false,
        };

        let token = label
            .bytes()
            .chain(marker.bytes())
            .chain(std::iter::once(TOKEN_SEPARATOR));
        for (cell, byte) in self.bytes[start..end].iter().zip(token) {
            cell.store(byte, Ordering::Relaxed);
        }
        self.cursor.store(end, Ordering::Release);
        true
    }

    /// Render the buffer contents; any thread may call this
    ///
    /// A concurrent reset or append by the owner can produce a torn string.
    pub fn read(&self) -> String {
        let end = self.len();
        let raw: Vec<u8> = self.bytes[..end]
            .iter()
            .map(|cell| cell.load(Ordering::Relaxed))
            .collect();
        String::from_utf8_lossy(&raw).trim_end().to_string()
    }

    /// Returns `true` exactly once, the first time an overflow is reported
    pub fn first_overflow(&self) -> bool {
        !self.overflow_warned.swap(true, Ordering::Relaxed)
    }

    fn try_copy(&self) -> Option<Self> {
        let copy = Self::try_new(self.bytes.len())?;
        for (dst, src) in copy.bytes.iter().zip(self.bytes.iter()) {
            dst.store(src.load(Ordering::Relaxed), Ordering::Relaxed);
        }
        copy.cursor
            .store(self.cursor.load(Ordering::Acquire), Ordering::Relaxed);
        copy.overflow_warned
            .store(self.overflow_warned.load(Ordering::Relaxed), Ordering::Relaxed);
        Some(copy)
    }
}

/// Timing state of one thread for one call site
#[derive(Debug, Default)]
pub struct ThreadSlot {
    entry_timestamp: AtomicU64,
    invocation_count: AtomicU64,
    valid: AtomicBool,
    trace: Option<TraceBuffer>,
}

impl ThreadSlot {
    /// Zeroed slot, with a trace buffer of `trace_capacity` bytes if given
    pub fn try_new(trace_capacity: Option<usize>) -> Option<Self> {
        let trace = match trace_capacity {
            Some(capacity) => Some(TraceBuffer::try_new(capacity)?),
            None => None,
        };
        Some(Self {
            trace,
            ..Self::default()
        })
    }

    /// Value copy of this slot, used when a table grows
    pub fn try_copy(&self) -> Option<Self> {
        let trace = match &self.trace {
            Some(buffer) => Some(buffer.try_copy()?),
            None => None,
        };
        Some(Self {
            entry_timestamp: AtomicU64::new(self.entry_timestamp.load(Ordering::Relaxed)),
            invocation_count: AtomicU64::new(self.invocation_count.load(Ordering::Relaxed)),
            valid: AtomicBool::new(self.valid.load(Ordering::Relaxed)),
            trace,
        })
    }

    /// Owner only. Record entry into the monitored call at `now`.
    #[inline]
    pub fn begin(&self, now: u64) {
        if let Some(trace) = &self.trace {
            trace.reset();
        }
        self.entry_timestamp.store(now, Ordering::Relaxed);
    }

    /// Owner only. Count the completed invocation and clear the entry time.
    #[inline]
    pub fn finish(&self) {
        // Single writer, so a plain load/store pair is enough
        let count = self.invocation_count.load(Ordering::Relaxed);
        self.invocation_count.store(count + 1, Ordering::Relaxed);
        self.entry_timestamp.store(0, Ordering::Relaxed);
    }

    /// Owner's view of whether it is currently inside the call
    #[inline]
    pub fn is_outstanding(&self) -> bool {
        self.entry_timestamp.load(Ordering::Relaxed) != 0
    }

    pub fn invocation_count(&self) -> u64 {
        self.invocation_count.load(Ordering::Relaxed)
    }

    pub fn is_valid(&self) -> bool {
        self.valid.load(Ordering::Relaxed)
    }

    pub fn set_valid(&self, valid: bool) {
        self.valid.store(valid, Ordering::Relaxed);
    }

    pub fn trace(&self) -> Option<&TraceBuffer> {
        self.trace.as_ref()
    }

    pub fn snapshot(&self, thread_id: usize) -> SlotSnapshot {
        SlotSnapshot {
            thread_id,
            entry_timestamp_nanos: read_possibly_stale_timestamp(self),
            invocation_count: self.invocation_count(),
            valid: self.is_valid(),
        }
    }
}

/// Point-in-time copy of a slot for diagnostics
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct SlotSnapshot {
    pub thread_id: usize,
    pub entry_timestamp_nanos: u64,
    pub invocation_count: u64,
    pub valid: bool,
}

//! Live-entry counter that latches at zero
//!
//! Each layer counts the cache entries it owns. When the last one is evicted the
//! counter latches: it stays at zero and refuses further increments, so an entry
//! inserted concurrently with the final eviction learns that its layer is gone.

use std::sync::atomic::{AtomicI64, Ordering};

const LATCHED: i64 = -1;

/// Lock-free counter that latches when it reaches zero through a decrement.
#[derive(Debug, Default)]
pub struct LatchingCounter {
    value: AtomicI64,
}

impl LatchingCounter {
    /// Counter at zero, not latched.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            value: AtomicI64::new(0),
        }
    }

    /// Add one. Returns `false` (and leaves the counter unchanged) if latched.
    pub fn increment(&self) -> bool {
        self.value
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |v| {
                (v != LATCHED).then_some(v + 1)
            })
            .is_ok()
    }

    /// Subtract one. Returns `true` if this call latched the counter.
    pub fn decrement(&self) -> bool {
        self.value
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |v| match v {
                LATCHED => None,
                v if v <= 1 => Some(LATCHED),
                v => Some(v - 1),
            })
            .is_ok_and(|previous| previous <= 1)
    }

    /// Latch if the count is zero. Returns `true` if this call latched it.
    pub fn latch_if_zero(&self) -> bool {
        self.value
            .compare_exchange(0, LATCHED, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Latch regardless of the count.
    pub fn latch(&self) {
        self.value.store(LATCHED, Ordering::Release);
    }

    /// Whether the counter has latched.
    #[must_use]
    pub fn is_latched(&self) -> bool {
        self.value.load(Ordering::Acquire) == LATCHED
    }

    /// Current count (zero once latched).
    #[must_use]
    pub fn count(&self) -> u64 {
        self.value.load(Ordering::Acquire).max(0) as u64
    }
}
